use super::{CreateBody, Outcome, RemoteId, RemoteStore, ReportPatch, StatusClass, classify_status};
use crate::{config::Config, report::Report};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Response};
use tracing::{debug, instrument};

const BODY_SNIPPET_CHARS: usize = 200;

pub struct HttpRemoteStore {
    client: Client,
    base_url: String,
    collection: String,
    path_suffix: String,
}

impl HttpRemoteStore {
    pub fn new(cfg: &Config) -> Result<Self> {
        let client = Client::builder()
            .timeout(cfg.remote.timeout())
            .user_agent(cfg.remote.user_agent.clone())
            .build()
            .with_context(|| "building HTTP client")?;
        Ok(Self {
            client,
            base_url: cfg.remote.base_url.trim_end_matches('/').to_string(),
            collection: cfg.remote.collection.trim_matches('/').to_string(),
            path_suffix: cfg.remote.path_suffix.clone(),
        })
    }

    pub fn collection_url(&self) -> String {
        format!("{}/{}{}", self.base_url, self.collection, self.path_suffix)
    }

    pub fn record_url(&self, id: &RemoteId) -> String {
        format!(
            "{}/{}/{}{}",
            self.base_url, self.collection, id, self.path_suffix
        )
    }

    /// Classify a non-success response into Rejected/Unreachable with a reason.
    async fn failure<T>(resp: Response) -> Outcome<T> {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        let snippet: String = body.chars().take(BODY_SNIPPET_CHARS).collect();
        let reason = if snippet.is_empty() {
            format!("http {}", status.as_u16())
        } else {
            format!("http {}: {}", status.as_u16(), snippet)
        };
        match classify_status(status.as_u16()) {
            StatusClass::Rejected => Outcome::Rejected(reason),
            _ => Outcome::Unreachable(reason),
        }
    }
}

fn transport_reason(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        format!("timeout: {err}")
    } else if err.is_connect() {
        format!("connection: {err}")
    } else {
        format!("network: {err}")
    }
}

/// The generated id: `name` (realtime-database style) or `id`.
pub fn extract_created_id(body: &serde_json::Value) -> Option<RemoteId> {
    ["name", "id"]
        .iter()
        .find_map(|k| body.get(*k).and_then(|v| v.as_str()))
        .filter(|s| !s.is_empty())
        .map(RemoteId::from)
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    #[instrument(skip_all, fields(title = report.title()))]
    async fn create(&self, report: &Report) -> Outcome<RemoteId> {
        let url = self.collection_url();
        let resp = match self
            .client
            .post(&url)
            .json(&CreateBody::from(report))
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => return Outcome::Unreachable(transport_reason(&e)),
        };

        if classify_status(resp.status().as_u16()) != StatusClass::Success {
            return Self::failure(resp).await;
        }

        // Creation is acknowledged from here on; an unreadable body must not
        // turn into a retry.
        let id = match resp.json::<serde_json::Value>().await {
            Ok(body) => extract_created_id(&body),
            Err(e) => {
                debug!("create response body unreadable: {e}");
                None
            }
        };
        Outcome::Success(id.unwrap_or_else(RemoteId::untracked))
    }

    #[instrument(skip_all, fields(remote_id = %id))]
    async fn patch(&self, id: &RemoteId, fields: &ReportPatch) -> Outcome<()> {
        if !id.is_tracked() {
            return Outcome::Rejected("cannot patch an untracked record".to_string());
        }
        let resp = match self
            .client
            .patch(self.record_url(id))
            .json(fields)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => return Outcome::Unreachable(transport_reason(&e)),
        };
        if classify_status(resp.status().as_u16()) == StatusClass::Success {
            Outcome::Success(())
        } else {
            Self::failure(resp).await
        }
    }
}
