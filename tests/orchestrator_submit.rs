use complaint_relay::{
    config::Config,
    orchestrator::{Orchestrator, SubmissionResult, SubmitError},
    queue::{LocalQueue, MemoryStore},
    remote::{FakeRemote, RemoteId, fake::FakeResponse},
    replayer::{DeliveryLog, DeliveryPath, DrainStop, Replayer, Trigger, TriggerOutcome},
    report::{self, PhotoRef, RawInputs, Report},
};
use std::sync::Arc;
use std::time::Duration;

fn mk_report(title: &str) -> Report {
    let raw = RawInputs {
        title: title.into(),
        description: "Bus shelter roof collapsed after the storm".into(),
        photo: Some(PhotoRef {
            uri: format!("file:///cache/{title}.jpg"),
            sha256: Some("ab".repeat(32)),
        }),
        agency: Some("dept_rapidkl".into()),
        latitude: Some(3.139),
        longitude: Some(101.6869),
        ..Default::default()
    };
    report::build(&Config::default(), raw).expect("valid report")
}

struct Harness {
    store: MemoryStore,
    queue: Arc<LocalQueue>,
    remote: Arc<FakeRemote>,
    log: DeliveryLog,
    orchestrator: Orchestrator,
}

fn harness() -> Harness {
    let store = MemoryStore::new();
    let queue = Arc::new(LocalQueue::open(Box::new(store.clone())).expect("open"));
    let remote = Arc::new(FakeRemote::new());
    let log = DeliveryLog::new();
    let orchestrator = Orchestrator::new(remote.clone(), queue.clone(), log.clone());
    Harness {
        store,
        queue,
        remote,
        log,
        orchestrator,
    }
}

#[tokio::test]
async fn online_submission_is_sent_immediately() {
    let h = harness();
    let result = h.orchestrator.submit(mk_report("alpha")).await.expect("submit");
    assert_eq!(
        result,
        SubmissionResult::SentImmediately {
            remote_id: RemoteId::from("r1")
        }
    );
    assert!(result.is_recorded());
    assert!(h.queue.is_empty().expect("empty"));
    let history = h.log.all();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].path, DeliveryPath::Immediate);
}

#[tokio::test]
async fn rejected_submission_is_never_queued() {
    let h = harness();
    h.remote
        .push_script([FakeResponse::Reject("http 400: invalid agency".into())]);
    let result = h.orchestrator.submit(mk_report("alpha")).await.expect("submit");
    assert_eq!(
        result,
        SubmissionResult::PermanentlyFailed {
            reason: "http 400: invalid agency".into()
        }
    );
    assert!(!result.is_recorded());
    assert!(h.queue.is_empty().expect("empty"));
    assert!(h.log.is_empty());
}

#[tokio::test]
async fn unreachable_submission_is_queued() {
    let h = harness();
    h.remote.set_default(FakeResponse::Unreachable);
    let first = h.orchestrator.submit(mk_report("alpha")).await.expect("submit");
    let second = h.orchestrator.submit(mk_report("bravo")).await.expect("submit");
    assert_eq!(
        first,
        SubmissionResult::QueuedForLaterDelivery { seq: 0, pending: 1 }
    );
    assert_eq!(
        second,
        SubmissionResult::QueuedForLaterDelivery { seq: 1, pending: 2 }
    );
    assert!(second.is_recorded());
    assert_eq!(h.store.persisted().entries.len(), 2);
}

#[tokio::test]
async fn failed_local_save_is_a_hard_error() {
    let h = harness();
    h.remote.set_default(FakeResponse::Unreachable);
    h.store.set_fail_writes(true);
    let err = h
        .orchestrator
        .submit(mk_report("alpha"))
        .await
        .expect_err("nothing was saved");
    assert!(matches!(err, SubmitError::Queue(_)));
    assert!(h.queue.is_empty().expect("empty"));
}

#[tokio::test]
async fn offline_capture_then_reconnect_delivers_once() {
    let h = harness();
    h.remote.push_script([FakeResponse::Unreachable]);
    let replayer = Replayer::new(h.queue.clone(), h.remote.clone(), h.log.clone());

    let result = h.orchestrator.submit(mk_report("pothole")).await.expect("submit");
    assert!(matches!(
        result,
        SubmissionResult::QueuedForLaterDelivery { pending: 1, .. }
    ));

    let outcome = replayer.trigger(Trigger::ConnectivityRegained).await;
    let TriggerOutcome::Completed(reports) = outcome else {
        panic!("expected a completed drain");
    };
    assert_eq!(reports[0].stop, DrainStop::Empty);
    assert_eq!(reports[0].delivered[0].remote_id, RemoteId::from("r1"));
    assert!(h.queue.is_empty().expect("empty"));

    let history = replayer.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].title, "pothole");
    assert_eq!(history[0].path, DeliveryPath::Replay);
}

#[tokio::test]
async fn successful_send_nudges_replayer_for_waiting_reports() {
    let h = harness();
    h.queue.append(mk_report("backlog")).expect("append");
    let replayer = Arc::new(Replayer::new(
        h.queue.clone(),
        h.remote.clone(),
        h.log.clone(),
    ));
    let orchestrator = Orchestrator::new(h.remote.clone(), h.queue.clone(), h.log.clone())
        .with_replayer(replayer.clone());

    orchestrator.submit(mk_report("fresh")).await.expect("submit");
    tokio::time::timeout(Duration::from_secs(2), async {
        while !h.queue.is_empty().expect("empty") {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("backlog drained");

    let mut accepted = h.remote.accepted_titles();
    accepted.sort();
    assert_eq!(accepted, vec!["backlog", "fresh"]);
    assert_eq!(h.log.len(), 2);
}
