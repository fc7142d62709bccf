use complaint_relay::{
    config::Config,
    connectivity::ConnectivitySignal,
    queue::{JsonFileStore, LocalQueue, MemoryStore},
    remote::{FakeRemote, RemoteId, fake::FakeResponse},
    replayer::{DeliveryLog, DrainStop, ReplayEvent, Replayer, Trigger, TriggerOutcome},
    report::{self, PhotoRef, RawInputs, Report},
};
use std::sync::Arc;
use std::time::Duration;

fn mk_report(title: &str) -> Report {
    let raw = RawInputs {
        title: title.into(),
        description: "Pothole in the left lane, about a metre wide".into(),
        photo: Some(PhotoRef {
            uri: format!("file:///cache/{title}.jpg"),
            sha256: None,
        }),
        agency: Some("dept_works".into()),
        captured_at: Some("2026-02-14T09:00:00Z".into()),
        ..Default::default()
    };
    report::build(&Config::default(), raw).expect("valid report")
}

fn setup(remote: FakeRemote, titles: &[&str]) -> (Arc<LocalQueue>, Arc<FakeRemote>, Arc<Replayer>) {
    let queue = Arc::new(LocalQueue::open(Box::new(MemoryStore::new())).expect("open"));
    for t in titles {
        queue.append(mk_report(t)).expect("append");
    }
    let remote = Arc::new(remote);
    let replayer = Arc::new(Replayer::new(
        queue.clone(),
        remote.clone(),
        DeliveryLog::new(),
    ));
    (queue, remote, replayer)
}

fn queued_titles(queue: &LocalQueue) -> Vec<String> {
    queue
        .snapshot_all()
        .expect("snapshot")
        .iter()
        .map(|e| e.report.title().to_string())
        .collect()
}

fn completed(outcome: TriggerOutcome) -> Vec<complaint_relay::replayer::DrainReport> {
    match outcome {
        TriggerOutcome::Completed(reports) => reports,
        TriggerOutcome::Coalesced => panic!("expected a completed drain"),
    }
}

#[tokio::test]
async fn stops_at_first_unreachable_and_resumes_from_same_head() {
    let fake = FakeRemote::new();
    fake.push_script([FakeResponse::Accept, FakeResponse::Unreachable]);
    let (queue, remote, replayer) = setup(fake, &["alpha", "bravo", "charlie"]);

    let reports = completed(replayer.trigger(Trigger::ConnectivityRegained).await);
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].delivered.len(), 1);
    assert!(matches!(reports[0].stop, DrainStop::Unreachable { seq: 1, .. }));
    assert_eq!(queued_titles(&queue), vec!["bravo", "charlie"]);
    let head = queue.peek_oldest().expect("peek").expect("head");
    assert_eq!(head.attempt_count, 1);
    // nothing behind the stuck head was attempted
    assert_eq!(remote.attempted_titles(), vec!["alpha", "bravo"]);

    let reports = completed(replayer.trigger(Trigger::ConnectivityRegained).await);
    assert_eq!(reports[0].stop, DrainStop::Empty);
    assert_eq!(remote.accepted_titles(), vec!["alpha", "bravo", "charlie"]);
    assert!(queue.is_empty().expect("empty"));
}

#[tokio::test]
async fn rejected_entry_is_discarded_and_reported_once() {
    let fake = FakeRemote::new();
    fake.push_script([FakeResponse::Reject("http 400: missing title".into())]);
    let (queue, remote, replayer) = setup(fake, &["alpha"]);
    let mut events = replayer.subscribe();

    let reports = completed(replayer.trigger(Trigger::Manual).await);
    assert_eq!(reports[0].rejected.len(), 1);
    assert_eq!(reports[0].rejected[0].title, "alpha");
    assert_eq!(reports[0].stop, DrainStop::Empty);
    assert!(queue.is_empty().expect("empty"));

    match events.recv().await.expect("event") {
        ReplayEvent::Rejected(rej) => assert_eq!(rej.reason, "http 400: missing title"),
        other => panic!("unexpected event {other:?}"),
    }

    replayer.trigger(Trigger::ConnectivityRegained).await;
    assert_eq!(remote.attempted_titles(), vec!["alpha"]);
    assert!(remote.accepted_titles().is_empty());
}

#[tokio::test]
async fn poison_entry_does_not_block_the_rest() {
    let fake = FakeRemote::new();
    fake.push_script([
        FakeResponse::Accept,
        FakeResponse::Reject("http 404".into()),
        FakeResponse::Accept,
    ]);
    let (queue, remote, replayer) = setup(fake, &["alpha", "bravo", "charlie"]);

    let reports = completed(replayer.trigger(Trigger::Manual).await);
    assert_eq!(reports[0].delivered.len(), 2);
    assert_eq!(reports[0].rejected.len(), 1);
    assert_eq!(remote.accepted_titles(), vec!["alpha", "charlie"]);
    assert!(queue.is_empty().expect("empty"));
}

#[tokio::test]
async fn repeated_triggers_converge_without_duplicates() {
    let (queue, remote, replayer) = setup(FakeRemote::new(), &["alpha", "bravo"]);

    for _ in 0..3 {
        replayer.trigger(Trigger::ConnectivityRegained).await;
    }
    assert_eq!(remote.accepted_titles(), vec!["alpha", "bravo"]);
    assert!(queue.is_empty().expect("empty"));
    assert_eq!(replayer.completed_drains(), 3);
}

#[tokio::test]
async fn triggers_during_a_drain_coalesce_into_one_follow_up() {
    let fake = FakeRemote::new().with_delay(Duration::from_millis(30));
    let (queue, remote, replayer) = setup(fake, &["alpha", "bravo", "charlie"]);

    let first = {
        let replayer = replayer.clone();
        tokio::spawn(async move { replayer.trigger(Trigger::Foregrounded).await })
    };
    while !replayer.is_draining() {
        tokio::task::yield_now().await;
    }

    assert_eq!(
        replayer.trigger(Trigger::ConnectivityRegained).await,
        TriggerOutcome::Coalesced
    );
    assert_eq!(
        replayer.trigger(Trigger::ConnectivityRegained).await,
        TriggerOutcome::Coalesced
    );

    let reports = completed(first.await.expect("join"));
    assert_eq!(reports.len(), 2, "one drain plus a single follow-up");
    assert_eq!(reports[0].trigger, Trigger::Foregrounded);
    assert_eq!(reports[1].trigger, Trigger::ConnectivityRegained);
    assert!(reports[1].delivered.is_empty());

    assert_eq!(remote.max_concurrent_creates(), 1);
    assert_eq!(remote.accepted_titles(), vec!["alpha", "bravo", "charlie"]);
    assert!(queue.is_empty().expect("empty"));
    assert!(!replayer.is_draining());
}

#[tokio::test]
async fn reports_appended_mid_drain_are_delivered_in_capture_order() {
    let fake = FakeRemote::new().with_delay(Duration::from_millis(20));
    let (queue, remote, replayer) = setup(fake, &["alpha", "bravo"]);

    let drain = {
        let replayer = replayer.clone();
        tokio::spawn(async move { replayer.trigger(Trigger::Manual).await })
    };
    while !replayer.is_draining() {
        tokio::task::yield_now().await;
    }
    queue.append(mk_report("charlie")).expect("append");
    assert_eq!(
        replayer.trigger(Trigger::ConnectivityRegained).await,
        TriggerOutcome::Coalesced
    );
    queue.append(mk_report("delta")).expect("append");

    drain.await.expect("join");
    assert_eq!(
        remote.accepted_titles(),
        vec!["alpha", "bravo", "charlie", "delta"]
    );
    assert!(queue.is_empty().expect("empty"));
}

#[tokio::test]
async fn queue_fault_ends_the_cycle_but_not_the_replayer() {
    let store = MemoryStore::new();
    let queue = Arc::new(LocalQueue::open(Box::new(store.clone())).expect("open"));
    queue.append(mk_report("alpha")).expect("append");
    let remote = Arc::new(FakeRemote::new());
    let replayer = Replayer::new(queue.clone(), remote.clone(), DeliveryLog::new());

    store.set_fail_writes(true);
    let reports = completed(replayer.trigger(Trigger::Manual).await);
    assert!(matches!(reports[0].stop, DrainStop::QueueFault { .. }));
    assert!(!replayer.is_draining());
    // the delivered head stays queued: delivery is at-least-once
    assert_eq!(queue.len().expect("len"), 1);

    store.set_fail_writes(false);
    replayer.trigger(Trigger::Manual).await;
    assert_eq!(remote.accepted_titles(), vec!["alpha", "alpha"]);
    assert!(queue.is_empty().expect("empty"));
}

#[tokio::test]
async fn run_drains_on_each_regained_edge_until_shutdown() {
    let fake = FakeRemote::new();
    fake.set_default(FakeResponse::Unreachable);
    let (queue, remote, replayer) = setup(fake, &["alpha"]);

    let signal = ConnectivitySignal::new(false);
    let events = signal.events();
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let runner = tokio::spawn(replayer.clone().run(events, true, async move {
        let _ = stop_rx.await;
    }));

    // start-up drain hits the outage and leaves the report queued
    tokio::time::timeout(Duration::from_secs(2), async {
        while replayer.completed_drains() < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("start-up drain");
    assert_eq!(queue.len().expect("len"), 1);

    remote.set_default(FakeResponse::AcceptAs(RemoteId::from("-Nq1")));
    signal.set_reachable(true);
    tokio::time::timeout(Duration::from_secs(2), async {
        while !queue.is_empty().expect("empty") {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("drain after regained edge");

    stop_tx.send(()).expect("runner alive");
    runner.await.expect("join");

    let history = replayer.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].remote_id, RemoteId::from("-Nq1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn drains_from_two_handles_on_one_file_take_turns() {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let path = std::env::temp_dir()
        .join(format!("complaint-relay-shared-{}-{nanos}", std::process::id()))
        .join("queue.json");
    let open = || {
        Arc::new(
            LocalQueue::open(Box::new(JsonFileStore::new(&path, false))).expect("open"),
        )
    };

    let seed = open();
    for t in ["alpha", "bravo", "charlie"] {
        seed.append(mk_report(t)).expect("append");
    }

    let remote = Arc::new(FakeRemote::new().with_delay(Duration::from_millis(20)));
    let watcher = Replayer::new(open(), remote.clone(), DeliveryLog::new());
    let manual = Replayer::new(open(), remote.clone(), DeliveryLog::new());

    let (a, b) = tokio::join!(
        watcher.trigger(Trigger::ConnectivityRegained),
        manual.trigger(Trigger::Manual)
    );
    let delivered: usize = completed(a)
        .iter()
        .chain(completed(b).iter())
        .map(|r| r.delivered.len())
        .sum();

    assert_eq!(delivered, 3);
    assert_eq!(remote.accepted_titles(), vec!["alpha", "bravo", "charlie"]);
    assert_eq!(remote.max_concurrent_creates(), 1);
    assert!(seed.is_empty().expect("empty"));
}
