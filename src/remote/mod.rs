//! Remote Store Client.
//!
//! A stateless seam over the remote record tree. Every call ends in an
//! [`Outcome`]; clients never retry on their own, retry policy belongs to the
//! replayer.

pub mod fake;
pub mod http;

use crate::report::{Agency, GeoPoint, Report, ReportStatus};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use fake::FakeRemote;
pub use http::HttpRemoteStore;

/// Identifier assigned by the remote store on creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteId(pub String);

impl RemoteId {
    /// Used when the store acknowledged a create without returning an id.
    pub const UNTRACKED: &'static str = "untracked";

    pub fn untracked() -> Self {
        RemoteId(Self::UNTRACKED.to_string())
    }

    pub fn is_tracked(&self) -> bool {
        self.0 != Self::UNTRACKED
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RemoteId {
    fn from(s: &str) -> Self {
        RemoteId(s.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    Success(T),
    /// Permanently invalid; never retry.
    Rejected(String),
    /// Transient; retry on the next trigger.
    Unreachable(String),
}

impl<T> Outcome<T> {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success(_) => "success",
            Outcome::Rejected(_) => "rejected",
            Outcome::Unreachable(_) => "unreachable",
        }
    }
}

/// Mutation patch; absent fields are left untouched by the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReportPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ReportStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agency: Option<Agency>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl ReportPatch {
    pub fn status(status: ReportStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

/// Body of a create call, in the record tree's field naming.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBody<'a> {
    pub title: &'a str,
    pub message: &'a str,
    pub agency: Agency,
    pub image: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_sha256: Option<&'a str>,
    pub address: &'a str,
    pub photo_location: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoPoint>,
    pub timestamp: &'a str,
    pub status: ReportStatus,
    pub user_email: Option<&'a str>,
}

impl<'a> From<&'a Report> for CreateBody<'a> {
    fn from(r: &'a Report) -> Self {
        let address = r.address().unwrap_or("");
        Self {
            title: r.title(),
            message: r.description(),
            agency: r.agency(),
            image: &r.photo().uri,
            image_sha256: r.photo().sha256.as_deref(),
            address,
            photo_location: address,
            location: r.location(),
            timestamp: r.created_at(),
            status: r.status(),
            user_email: r.author(),
        }
    }
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn create(&self, report: &Report) -> Outcome<RemoteId>;

    async fn patch(&self, id: &RemoteId, fields: &ReportPatch) -> Outcome<()>;
}

/// How an HTTP status maps onto an outcome class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    Rejected,
    Unreachable,
}

pub fn classify_status(status: u16) -> StatusClass {
    match status {
        200..=299 => StatusClass::Success,
        // request timeout and rate limiting say nothing about the request itself
        408 | 429 => StatusClass::Unreachable,
        400..=499 => StatusClass::Rejected,
        _ => StatusClass::Unreachable,
    }
}
