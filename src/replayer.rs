//! Connectivity-triggered replayer.
//!
//! Two states, `Idle` and `Draining`. A trigger moves `Idle -> Draining`; a
//! trigger that arrives while draining is remembered (at most once) and runs
//! as a single follow-up drain as soon as the current one finishes.
//!
//! A drain walks the queue head by head:
//! - `Success`: remove the head, continue.
//! - `Rejected`: remove the head (it would block the queue forever), report
//!   it, continue.
//! - `Unreachable`: leave the head and everything behind it, stop.
//!
//! Stopping at the first `Unreachable` is what keeps delivery in capture
//! order. Remote calls are strictly sequential, and each drain holds the
//! queue's drain lease, so a drain in another process waits its turn.
//!
//! Delivery is at-least-once: if the process dies after the store
//! acknowledged a create but before the head was removed, the next drain
//! sends that report again. No read-after-write check is attempted.

use crate::{
    connectivity::ConnectivityEvents,
    queue::{LocalQueue, QueueError, off_runtime},
    remote::{Outcome, RemoteId, RemoteStore},
    report::Report,
    util::now_rfc3339,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    ConnectivityRegained,
    Foregrounded,
    Manual,
    AfterSubmission,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryPath {
    Immediate,
    Replay,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub remote_id: RemoteId,
    pub title: String,
    pub captured_at: String,
    pub delivered_at: String,
    pub path: DeliveryPath,
    /// Queue sequence number for replayed reports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

impl DeliveryRecord {
    pub fn new(remote_id: RemoteId, report: &Report, path: DeliveryPath, seq: Option<u64>) -> Self {
        Self {
            remote_id,
            title: report.title().to_string(),
            captured_at: report.created_at().to_string(),
            delivered_at: now_rfc3339(),
            path,
            seq,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedEntry {
    pub seq: u64,
    pub title: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DrainStop {
    Empty,
    Unreachable { seq: u64, reason: String },
    QueueFault { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrainReport {
    pub trigger: Trigger,
    pub started_at: String,
    pub delivered: Vec<DeliveryRecord>,
    pub rejected: Vec<RejectedEntry>,
    pub stop: DrainStop,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TriggerOutcome {
    /// A drain was already running; one follow-up drain is scheduled.
    Coalesced,
    /// This call ran the drain plus any follow-ups requested meanwhile.
    Completed(Vec<DrainReport>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplayEvent {
    Delivered(DeliveryRecord),
    Rejected(RejectedEntry),
    Stopped(DrainStop),
}

/// History of acknowledged reports, shared by the immediate and replay paths.
#[derive(Clone, Default)]
pub struct DeliveryLog {
    inner: Arc<Mutex<Vec<DeliveryRecord>>>,
}

impl DeliveryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, rec: DeliveryRecord) {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(rec);
    }

    pub fn all(&self) -> Vec<DeliveryRecord> {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
struct DrainState {
    draining: bool,
    rerun: Option<Trigger>,
    completed_drains: u64,
}

pub struct Replayer {
    queue: Arc<LocalQueue>,
    remote: Arc<dyn RemoteStore>,
    log: DeliveryLog,
    state: Mutex<DrainState>,
    events: broadcast::Sender<ReplayEvent>,
}

/// Returns the replayer to `Idle` if a drain future is dropped mid-flight.
struct DrainGuard<'a> {
    replayer: &'a Replayer,
    armed: bool,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut st = self.replayer.state();
            st.draining = false;
            st.rerun = None;
        }
    }
}

impl Replayer {
    pub fn new(queue: Arc<LocalQueue>, remote: Arc<dyn RemoteStore>, log: DeliveryLog) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            queue,
            remote,
            log,
            state: Mutex::new(DrainState::default()),
            events,
        }
    }

    fn state(&self) -> MutexGuard<'_, DrainState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReplayEvent> {
        self.events.subscribe()
    }

    pub fn history(&self) -> Vec<DeliveryRecord> {
        self.log.all()
    }

    pub fn is_draining(&self) -> bool {
        self.state().draining
    }

    pub fn completed_drains(&self) -> u64 {
        self.state().completed_drains
    }

    pub fn queue(&self) -> &Arc<LocalQueue> {
        &self.queue
    }

    fn try_begin(&self, trigger: Trigger) -> bool {
        let mut st = self.state();
        if st.draining {
            if st.rerun.is_none() {
                st.rerun = Some(trigger);
            }
            false
        } else {
            st.draining = true;
            true
        }
    }

    /// Finish the current drain; hands back the remembered trigger if a
    /// follow-up is owed, otherwise goes `Idle`.
    fn finish_or_rerun(&self) -> Option<Trigger> {
        let mut st = self.state();
        st.completed_drains += 1;
        let next = st.rerun.take();
        if next.is_none() {
            st.draining = false;
        }
        next
    }

    pub async fn trigger(&self, trigger: Trigger) -> TriggerOutcome {
        if !self.try_begin(trigger) {
            debug!(?trigger, "drain in progress; follow-up scheduled");
            return TriggerOutcome::Coalesced;
        }
        let mut guard = DrainGuard {
            replayer: self,
            armed: true,
        };

        let mut reports = Vec::new();
        let mut current = trigger;
        loop {
            reports.push(self.drain_once(current).await);
            match self.finish_or_rerun() {
                Some(next) => {
                    debug!(trigger = ?next, "running follow-up drain");
                    current = next;
                }
                None => break,
            }
        }
        guard.armed = false;
        TriggerOutcome::Completed(reports)
    }

    fn emit(&self, event: ReplayEvent) {
        let _ = self.events.send(event);
    }

    /// Remove the head, checking it is the entry that was just delivered.
    async fn remove_head(&self, expected_seq: u64) -> Result<(), QueueError> {
        let removed = off_runtime(&self.queue, |q| q.remove_oldest()).await?;
        if removed.seq != expected_seq {
            return Err(QueueError::Corruption(format!(
                "removed seq {} while delivering seq {}",
                removed.seq, expected_seq
            )));
        }
        Ok(())
    }

    async fn drain_once(&self, trigger: Trigger) -> DrainReport {
        let started_at = now_rfc3339();
        let mut delivered = Vec::new();
        let mut rejected = Vec::new();
        info!(?trigger, "drain started");

        let stop = match off_runtime(&self.queue, |q| q.lease_drain()).await {
            Ok(lease) => {
                let stop = self.drain_entries(&mut delivered, &mut rejected).await;
                drop(lease);
                stop
            }
            Err(e) => {
                error!("drain aborted acquiring drain lease: {e}");
                DrainStop::QueueFault {
                    reason: e.to_string(),
                }
            }
        };

        info!(
            delivered = delivered.len(),
            rejected = rejected.len(),
            stop = ?stop,
            "drain finished"
        );
        self.emit(ReplayEvent::Stopped(stop.clone()));
        DrainReport {
            trigger,
            started_at,
            delivered,
            rejected,
            stop,
        }
    }

    async fn drain_entries(
        &self,
        delivered: &mut Vec<DeliveryRecord>,
        rejected: &mut Vec<RejectedEntry>,
    ) -> DrainStop {
        loop {
            let entry = match off_runtime(&self.queue, |q| q.peek_oldest()).await {
                Ok(Some(entry)) => entry,
                Ok(None) => return DrainStop::Empty,
                Err(e) => {
                    error!("drain aborted reading queue head: {e}");
                    return DrainStop::QueueFault {
                        reason: e.to_string(),
                    };
                }
            };
            debug!(seq = entry.seq, attempts = entry.attempt_count, "delivering queued report");

            let outcome = self.remote.create(&entry.report).await;
            debug!(seq = entry.seq, outcome = outcome.label(), "create returned");
            match outcome {
                Outcome::Success(remote_id) => {
                    let rec = DeliveryRecord::new(
                        remote_id,
                        &entry.report,
                        DeliveryPath::Replay,
                        Some(entry.seq),
                    );
                    self.log.record(rec.clone());
                    info!(seq = entry.seq, remote_id = %rec.remote_id, "queued report delivered");
                    delivered.push(rec.clone());
                    self.emit(ReplayEvent::Delivered(rec));
                    if let Err(e) = self.remove_head(entry.seq).await {
                        error!(seq = entry.seq, "drain aborted removing delivered head: {e}");
                        return DrainStop::QueueFault {
                            reason: e.to_string(),
                        };
                    }
                }
                Outcome::Rejected(reason) => {
                    warn!(seq = entry.seq, reason = %reason, "queued report rejected; discarding");
                    let rej = RejectedEntry {
                        seq: entry.seq,
                        title: entry.report.title().to_string(),
                        reason,
                    };
                    rejected.push(rej.clone());
                    self.emit(ReplayEvent::Rejected(rej));
                    if let Err(e) = self.remove_head(entry.seq).await {
                        error!(seq = entry.seq, "drain aborted removing rejected head: {e}");
                        return DrainStop::QueueFault {
                            reason: e.to_string(),
                        };
                    }
                }
                Outcome::Unreachable(reason) => {
                    let seq = entry.seq;
                    if let Err(e) = off_runtime(&self.queue, move |q| q.record_attempt(seq)).await {
                        warn!(seq = entry.seq, "could not record attempt: {e}");
                    }
                    warn!(seq = entry.seq, reason = %reason, "store unreachable; drain stopped");
                    return DrainStop::Unreachable {
                        seq: entry.seq,
                        reason,
                    };
                }
            }
        }
    }

    /// Service the replayer until `shutdown` resolves or the connectivity
    /// source closes. Each rising edge spawns a trigger; drains already in
    /// flight are awaited before returning, never cancelled.
    pub async fn run<F>(self: Arc<Self>, mut events: ConnectivityEvents, drain_on_start: bool, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut tasks = JoinSet::new();
        if drain_on_start {
            let this = self.clone();
            tasks.spawn(async move { this.trigger(Trigger::Foregrounded).await });
        }

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("replayer shutting down");
                    break;
                }
                edge = events.next_regained() => {
                    if edge.is_none() {
                        info!("connectivity source closed");
                        break;
                    }
                    let this = self.clone();
                    tasks.spawn(async move { this.trigger(Trigger::ConnectivityRegained).await });
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!("drain task failed: {e}");
                    }
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("drain task failed: {e}");
            }
        }
    }
}
