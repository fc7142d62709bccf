use super::{Outcome, RemoteId, RemoteStore, ReportPatch};
use crate::report::Report;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Per-call behavior of the fake.
#[derive(Debug, Clone, PartialEq)]
pub enum FakeResponse {
    /// Accept and assign the next `r<N>` id.
    Accept,
    AcceptAs(RemoteId),
    Reject(String),
    Unreachable,
}

/// In-process record store with scripted outcomes.
///
/// Scripted responses are consumed one per `create`; once the script runs
/// out, `default_response` applies. Accepted reports are kept in receipt
/// order.
pub struct FakeRemote {
    script: Mutex<VecDeque<FakeResponse>>,
    default_response: Mutex<FakeResponse>,
    accepted: Mutex<Vec<(RemoteId, Report)>>,
    attempts: Mutex<Vec<String>>,
    patches: Mutex<Vec<(RemoteId, ReportPatch)>>,
    next_id: AtomicUsize,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for FakeRemote {
    fn default() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default_response: Mutex::new(FakeResponse::Accept),
            accepted: Mutex::new(Vec::new()),
            attempts: Mutex::new(Vec::new()),
            patches: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(1),
            delay: None,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every create sleeps this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push_script(&self, responses: impl IntoIterator<Item = FakeResponse>) {
        if let Ok(mut script) = self.script.lock() {
            script.extend(responses);
        }
    }

    pub fn set_default(&self, response: FakeResponse) {
        if let Ok(mut d) = self.default_response.lock() {
            *d = response;
        }
    }

    /// Titles of accepted reports, in receipt order.
    pub fn accepted_titles(&self) -> Vec<String> {
        self.accepted
            .lock()
            .map(|a| a.iter().map(|(_, r)| r.title().to_string()).collect())
            .unwrap_or_default()
    }

    pub fn accepted(&self) -> Vec<(RemoteId, Report)> {
        self.accepted.lock().map(|a| a.clone()).unwrap_or_default()
    }

    /// Titles of every create attempt, whatever the outcome.
    pub fn attempted_titles(&self) -> Vec<String> {
        self.attempts.lock().map(|a| a.clone()).unwrap_or_default()
    }

    pub fn patches(&self) -> Vec<(RemoteId, ReportPatch)> {
        self.patches.lock().map(|p| p.clone()).unwrap_or_default()
    }

    /// Highest number of creates observed running at the same time.
    pub fn max_concurrent_creates(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_response(&self) -> FakeResponse {
        let scripted = self.script.lock().ok().and_then(|mut s| s.pop_front());
        scripted.unwrap_or_else(|| {
            self.default_response
                .lock()
                .map(|d| d.clone())
                .unwrap_or(FakeResponse::Accept)
        })
    }
}

#[async_trait]
impl RemoteStore for FakeRemote {
    async fn create(&self, report: &Report) -> Outcome<RemoteId> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Ok(mut a) = self.attempts.lock() {
            a.push(report.title().to_string());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let outcome = match self.next_response() {
            FakeResponse::Accept => {
                let n = self.next_id.fetch_add(1, Ordering::SeqCst);
                Outcome::Success(RemoteId(format!("r{n}")))
            }
            FakeResponse::AcceptAs(id) => Outcome::Success(id),
            FakeResponse::Reject(reason) => Outcome::Rejected(reason),
            FakeResponse::Unreachable => Outcome::Unreachable("fake: offline".to_string()),
        };
        if let Outcome::Success(id) = &outcome {
            if let Ok(mut a) = self.accepted.lock() {
                a.push((id.clone(), report.clone()));
            }
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        outcome
    }

    async fn patch(&self, id: &RemoteId, fields: &ReportPatch) -> Outcome<()> {
        let known = self
            .accepted
            .lock()
            .map(|a| a.iter().any(|(rid, _)| rid == id))
            .unwrap_or(false);
        if !known {
            return Outcome::Rejected(format!("no record {id}"));
        }
        if let Ok(mut p) = self.patches.lock() {
            p.push((id.clone(), fields.clone()));
        }
        Outcome::Success(())
    }
}
