//! Submission Orchestrator: send now, or fall back to the durable queue.

use crate::{
    queue::{LocalQueue, QueueError, off_runtime},
    remote::{Outcome, RemoteId, RemoteStore},
    replayer::{DeliveryLog, DeliveryPath, DeliveryRecord, Replayer, Trigger},
    report::Report,
};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum SubmissionResult {
    SentImmediately { remote_id: RemoteId },
    QueuedForLaterDelivery { seq: u64, pending: usize },
    PermanentlyFailed { reason: String },
}

impl SubmissionResult {
    /// Both a send and a durable enqueue count as "recorded" for the user.
    pub fn is_recorded(&self) -> bool {
        !matches!(self, SubmissionResult::PermanentlyFailed { .. })
    }
}

/// The report was neither sent nor safely queued.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("report could not be saved for later delivery: {0}")]
    Queue(#[from] QueueError),
}

pub struct Orchestrator {
    remote: Arc<dyn RemoteStore>,
    queue: Arc<LocalQueue>,
    log: DeliveryLog,
    replayer: Option<Arc<Replayer>>,
}

impl Orchestrator {
    pub fn new(remote: Arc<dyn RemoteStore>, queue: Arc<LocalQueue>, log: DeliveryLog) -> Self {
        Self {
            remote,
            queue,
            log,
            replayer: None,
        }
    }

    /// After a successful immediate send, nudge this replayer if reports are
    /// still waiting.
    pub fn with_replayer(mut self, replayer: Arc<Replayer>) -> Self {
        self.replayer = Some(replayer);
        self
    }

    pub async fn submit(&self, report: Report) -> Result<SubmissionResult, SubmitError> {
        match self.remote.create(&report).await {
            Outcome::Success(remote_id) => {
                info!(remote_id = %remote_id, "report sent immediately");
                self.log.record(DeliveryRecord::new(
                    remote_id.clone(),
                    &report,
                    DeliveryPath::Immediate,
                    None,
                ));
                self.nudge_replayer();
                Ok(SubmissionResult::SentImmediately { remote_id })
            }
            Outcome::Rejected(reason) => {
                warn!(reason = %reason, "report rejected by store");
                Ok(SubmissionResult::PermanentlyFailed { reason })
            }
            Outcome::Unreachable(reason) => {
                info!(reason = %reason, "store unreachable; queueing report");
                let entry = off_runtime(&self.queue, move |q| q.append(report)).await?;
                // the entry is durable at this point; a failed count must not undo that
                let pending = off_runtime(&self.queue, |q| q.len()).await.unwrap_or(1);
                Ok(SubmissionResult::QueuedForLaterDelivery {
                    seq: entry.seq,
                    pending,
                })
            }
        }
    }

    fn nudge_replayer(&self) {
        let Some(replayer) = &self.replayer else {
            return;
        };
        let replayer = replayer.clone();
        let queue = self.queue.clone();
        tokio::spawn(async move {
            if matches!(off_runtime(&queue, |q| q.is_empty()).await, Ok(true)) {
                return;
            }
            replayer.trigger(Trigger::AfterSubmission).await;
        });
    }
}
