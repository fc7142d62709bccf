//! Report Builder: turns raw capture inputs into a validated, immutable [`Report`].
//!
//! Building is pure. Classification, blurring and reverse-geocoding happen
//! before this point; their results arrive here as plain fields.

use crate::{config::Config, util::now_rfc3339};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// Floor for `[capture] min_title_chars`; configuration may only raise it.
pub const MIN_TITLE_CHARS: usize = 3;
/// Floor for `[capture] min_description_chars`.
pub const MIN_DESCRIPTION_CHARS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Agency {
    #[serde(rename = "dept_dbkl")]
    CityHall,
    #[serde(rename = "dept_kdebwm")]
    WasteManagement,
    #[serde(rename = "dept_pcb")]
    PublicComplaintsBureau,
    #[serde(rename = "dept_rapidkl")]
    RapidKl,
    #[serde(rename = "dept_works")]
    MinistryOfWorks,
}

impl Agency {
    pub const ALL: [Agency; 5] = [
        Agency::CityHall,
        Agency::WasteManagement,
        Agency::PublicComplaintsBureau,
        Agency::RapidKl,
        Agency::MinistryOfWorks,
    ];

    pub fn code(self) -> &'static str {
        match self {
            Agency::CityHall => "dept_dbkl",
            Agency::WasteManagement => "dept_kdebwm",
            Agency::PublicComplaintsBureau => "dept_pcb",
            Agency::RapidKl => "dept_rapidkl",
            Agency::MinistryOfWorks => "dept_works",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Agency::CityHall => "Kuala Lumpur City Hall",
            Agency::WasteManagement => "KDEB Waste Management",
            Agency::PublicComplaintsBureau => "Public Complaints Bureau",
            Agency::RapidKl => "Rapid KL",
            Agency::MinistryOfWorks => "Ministry of Works",
        }
    }
}

impl FromStr for Agency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Agency::ALL
            .into_iter()
            .find(|a| a.code().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown agency code: {s}"))
    }
}

impl fmt::Display for Agency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Lifecycle owned by the remote store once a report has been created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    #[default]
    Pending,
    InProgress,
    Resolved,
}

impl ReportStatus {
    /// Forward-only: pending -> in_progress -> resolved, or pending -> resolved.
    pub fn can_advance_to(self, next: ReportStatus) -> bool {
        matches!(
            (self, next),
            (ReportStatus::Pending, ReportStatus::InProgress)
                | (ReportStatus::Pending, ReportStatus::Resolved)
                | (ReportStatus::InProgress, ReportStatus::Resolved)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReportStatus::Pending => "pending",
            ReportStatus::InProgress => "in_progress",
            ReportStatus::Resolved => "resolved",
        }
    }
}

impl FromStr for ReportStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(ReportStatus::Pending),
            "in_progress" => Ok(ReportStatus::InProgress),
            "resolved" => Ok(ReportStatus::Resolved),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// Reference to an already-processed (blurred) photo. Never the bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhotoRef {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    title: String,
    description: String,
    photo: PhotoRef,
    agency: Agency,
    #[serde(default)]
    location: Option<GeoPoint>,
    #[serde(default)]
    address: Option<String>,
    created_at: String,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    status: ReportStatus,
}

impl Report {
    pub fn title(&self) -> &str {
        &self.title
    }
    pub fn description(&self) -> &str {
        &self.description
    }
    pub fn photo(&self) -> &PhotoRef {
        &self.photo
    }
    pub fn agency(&self) -> Agency {
        self.agency
    }
    pub fn location(&self) -> Option<GeoPoint> {
        self.location
    }
    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }
    pub fn created_at(&self) -> &str {
        &self.created_at
    }
    pub fn author(&self) -> Option<&str> {
        self.author.as_deref()
    }
    pub fn status(&self) -> ReportStatus {
        self.status
    }

    /// Human-readable location: address, else coordinates, else a placeholder.
    pub fn location_label(&self) -> String {
        match (&self.address, self.location) {
            (Some(addr), _) => addr.clone(),
            (None, Some(p)) => format!("Lat: {:.5} | Lng: {:.5}", p.latitude, p.longitude),
            (None, None) => "No location provided".to_string(),
        }
    }
}

/// Raw capture inputs, as collected by the capture flow.
#[derive(Debug, Clone, Default)]
pub struct RawInputs {
    pub title: String,
    pub description: String,
    pub photo: Option<PhotoRef>,
    pub agency: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub address: Option<String>,
    /// Reverse-geocode components; used when `address` is absent.
    pub address_parts: Vec<String>,
    pub captured_at: Option<String>,
    pub author: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Violation {
    TitleTooShort { min: usize },
    DescriptionTooShort { min: usize },
    MissingPhoto,
    MissingAgency,
    UnknownAgency(String),
    InvalidLocation,
    InvalidCaptureTime(String),
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::TitleTooShort { min } => {
                write!(f, "Please enter a title (at least {min} characters).")
            }
            Violation::DescriptionTooShort { min } => {
                write!(f, "Please describe the complaint (at least {min} characters).")
            }
            Violation::MissingPhoto => f.write_str("Please take a photo of the issue."),
            Violation::MissingAgency => f.write_str("Please select a government agency."),
            Violation::UnknownAgency(code) => write!(f, "Unknown government agency: {code}."),
            Violation::InvalidLocation => f.write_str("Latitude/longitude out of range."),
            Violation::InvalidCaptureTime(raw) => {
                write!(f, "Capture time is not an RFC 3339 timestamp: {raw}.")
            }
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("{}", join_violations(.violations))]
pub struct ValidationError {
    pub violations: Vec<Violation>,
}

impl ValidationError {
    pub fn messages(&self) -> Vec<String> {
        self.violations.iter().map(ToString::to_string).collect()
    }
}

fn join_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Validate every constraint and collect all violations before failing.
pub fn build(cfg: &Config, raw: RawInputs) -> Result<Report, ValidationError> {
    let mut violations = Vec::new();

    let min_title = cfg.capture.min_title_chars.max(MIN_TITLE_CHARS);
    let title = raw.title.trim().to_string();
    if title.chars().count() < min_title {
        violations.push(Violation::TitleTooShort { min: min_title });
    }

    let min_description = cfg.capture.min_description_chars.max(MIN_DESCRIPTION_CHARS);
    let description = raw.description.trim().to_string();
    if description.chars().count() < min_description {
        violations.push(Violation::DescriptionTooShort {
            min: min_description,
        });
    }

    let photo = raw.photo.filter(|p| !p.uri.trim().is_empty());
    if photo.is_none() {
        violations.push(Violation::MissingPhoto);
    }

    let agency = match raw.agency.as_deref().map(str::trim) {
        None | Some("") => {
            violations.push(Violation::MissingAgency);
            None
        }
        Some(code) => match code.parse::<Agency>() {
            Ok(a) => Some(a),
            Err(_) => {
                violations.push(Violation::UnknownAgency(code.to_string()));
                None
            }
        },
    };

    let location = match (raw.latitude, raw.longitude) {
        (None, None) => None,
        (Some(latitude), Some(longitude)) => {
            let p = GeoPoint {
                latitude,
                longitude,
            };
            if !p.is_valid() {
                violations.push(Violation::InvalidLocation);
            }
            Some(p)
        }
        _ => {
            violations.push(Violation::InvalidLocation);
            None
        }
    };

    let created_at = match raw.captured_at.as_deref().map(str::trim) {
        None | Some("") => now_rfc3339(),
        Some(ts) => match OffsetDateTime::parse(ts, &Rfc3339) {
            Ok(_) => ts.to_string(),
            Err(_) => {
                violations.push(Violation::InvalidCaptureTime(ts.to_string()));
                String::new()
            }
        },
    };

    let (Some(photo), Some(agency)) = (photo, agency) else {
        return Err(ValidationError { violations });
    };
    if !violations.is_empty() {
        return Err(ValidationError { violations });
    }

    let address = raw
        .address
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty())
        .or_else(|| format_address(&raw.address_parts));

    let author = raw
        .author
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty())
        .or_else(|| Some(cfg.identity.author.trim().to_string()).filter(|a| !a.is_empty()));

    Ok(Report {
        title,
        description,
        photo,
        agency,
        location,
        address,
        created_at,
        author,
        status: ReportStatus::Pending,
    })
}

/// Join non-empty reverse-geocode components with ", ".
pub fn format_address<S: AsRef<str>>(parts: &[S]) -> Option<String> {
    let joined = parts
        .iter()
        .map(|p| p.as_ref().trim())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(", ");
    if joined.is_empty() { None } else { Some(joined) }
}
