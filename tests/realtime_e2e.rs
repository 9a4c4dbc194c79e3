//! End-to-end behaviour of the realtime pipeline: session -> publisher ->
//! channel -> observers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use intake_relay::{
    ActivityConfig, ChangeFeedChannel, ChannelConfig, DeliveryError, DistributionChannel, InMemorySnapshotStore,
    InProcessChannel, IntakeConfig, IntakeSession, ObserverSession, PatientField, PatientStatus, RequiredFields,
    Snapshot, SnapshotSink, SnapshotStore,
};

const WAIT: Duration = Duration::from_secs(2);

fn in_process(replay: bool) -> Arc<InProcessChannel> {
    Arc::new(InProcessChannel::new(ChannelConfig {
        replay_last_on_subscribe: replay,
        ..ChannelConfig::default()
    }))
}

fn config_with_idle(ms: u64) -> IntakeConfig {
    IntakeConfig {
        activity: ActivityConfig {
            idle_window: Duration::from_millis(ms),
        },
        ..IntakeConfig::default()
    }
}

fn drain(observer: &mut ObserverSession) -> Vec<Snapshot> {
    let mut seen = Vec::new();
    while let Ok(Some(snapshot)) = observer.recv_timeout(Duration::from_millis(50)) {
        seen.push(snapshot.clone());
    }
    seen
}

#[test]
fn n_edits_yield_n_snapshots_in_order() {
    let channel = in_process(true);
    let session = IntakeSession::new(channel.clone(), IntakeConfig::default()).unwrap();
    let mut staff = session.observe().unwrap();

    let typed = ["S", "So", "Som", "Somc", "Somch", "Somcha", "Somchai"];
    for prefix in typed {
        session.apply_edit(PatientField::FirstName, prefix).unwrap();
    }
    session.apply_edit(PatientField::LastName, "Jaidee").unwrap();

    let seen = drain(&mut staff);
    assert_eq!(seen.len(), typed.len() + 1);
    for (snapshot, prefix) in seen.iter().zip(typed) {
        assert_eq!(snapshot.record.first_name, prefix);
    }
    assert!(seen.windows(2).all(|w| w[1].sequence > w[0].sequence));

    let last = staff.last_snapshot().unwrap();
    assert_eq!(last.record.first_name, "Somchai");
    assert_eq!(last.record.last_name, "Jaidee");
    assert_eq!(last.status(), PatientStatus::Active);
}

#[test]
fn idle_timeout_publishes_inactive_and_edit_reactivates() {
    let channel = in_process(true);
    let session = IntakeSession::new(channel.clone(), config_with_idle(60)).unwrap();
    let mut staff = session.observe().unwrap();

    session.apply_edit(PatientField::Phone, "081").unwrap();
    assert_eq!(staff.recv_timeout(WAIT).unwrap().unwrap().status(), PatientStatus::Active);
    assert_eq!(staff.recv_timeout(WAIT).unwrap().unwrap().status(), PatientStatus::Inactive);

    session.apply_edit(PatientField::Phone, "0812").unwrap();
    let back = staff.recv_timeout(WAIT).unwrap().unwrap();
    assert_eq!(back.status(), PatientStatus::Active);
    assert_eq!(back.record.phone, "0812");
}

#[test]
fn edits_inside_the_window_suppress_the_timeout() {
    let channel = in_process(true);
    let session = IntakeSession::new(channel.clone(), config_with_idle(150)).unwrap();
    let mut staff = session.observe().unwrap();

    for i in 0..6 {
        session.apply_edit(PatientField::Address, format!("{i} Main St")).unwrap();
        thread::sleep(Duration::from_millis(40));
    }
    let during = drain(&mut staff);
    assert_eq!(during.len(), 6);
    assert!(during.iter().all(|s| s.status() == PatientStatus::Active));

    // Exactly one inactive snapshot once typing stops.
    let idle = staff.recv_timeout(WAIT).unwrap().unwrap();
    assert_eq!(idle.status(), PatientStatus::Inactive);
    assert!(drain(&mut staff).is_empty());
}

#[test]
fn nothing_changes_after_submit() {
    let channel = in_process(true);
    let session = IntakeSession::new(channel.clone(), config_with_idle(40)).unwrap();
    let mut staff = session.observe().unwrap();

    session.apply_edit(PatientField::Gender, "Female").unwrap();
    session.mark_submitted().unwrap();
    assert!(session.apply_edit(PatientField::Gender, "Male").is_err());
    assert!(session.mark_submitted().unwrap().is_none());

    // Give a stale idle timer every chance to fire.
    thread::sleep(Duration::from_millis(150));

    let seen = drain(&mut staff);
    let submitted_at = seen.iter().position(Snapshot::is_submitted).unwrap();
    assert!(seen[submitted_at..].iter().all(|s| s.status() == PatientStatus::Submitted));
    assert_eq!(seen.len(), submitted_at + 1);
    assert_eq!(staff.last_snapshot().unwrap().record.gender, "Female");
    assert!(staff.submitted_at().is_some());
}

#[test]
fn completion_percentage_three_of_five() {
    let channel = in_process(true);
    let session = IntakeSession::new(channel.clone(), IntakeConfig::default()).unwrap();
    let mut staff = ObserverSession::subscribe(channel.as_ref(), RequiredFields::dashboard()).unwrap();

    session.apply_edit(PatientField::FirstName, "Ada").unwrap();
    session.apply_edit(PatientField::Dob, "1815-12-10").unwrap();
    session.apply_edit(PatientField::Email, "ada@example.org").unwrap();
    staff.try_drain().unwrap();
    assert_eq!(staff.completion_percentage(), 40);

    session.apply_edit(PatientField::Phone, "0812345678").unwrap();
    staff.try_drain().unwrap();
    assert_eq!(staff.completion_percentage(), 60);
    assert_eq!(session.completion_percentage().unwrap(), 60);
}

#[test]
fn late_subscriber_gets_replay_only_when_enabled() {
    for replay in [true, false] {
        let channel = in_process(replay);
        let session = IntakeSession::new(channel.clone(), IntakeConfig::default()).unwrap();
        session.apply_edit(PatientField::Nationality, "Thai").unwrap();

        let mut late = ObserverSession::subscribe(channel.as_ref(), RequiredFields::dashboard()).unwrap();
        let first = late.try_drain().unwrap();
        if replay {
            assert_eq!(first, 1);
            assert_eq!(late.last_snapshot().unwrap().record.nationality, "Thai");
        } else {
            assert_eq!(first, 0);
            assert!(late.last_snapshot().is_none());
        }

        session.apply_edit(PatientField::Nationality, "Lao").unwrap();
        late.try_drain().unwrap();
        assert_eq!(late.last_snapshot().unwrap().record.nationality, "Lao");
    }
}

struct FlakySink {
    failing: AtomicBool,
}

impl SnapshotSink for FlakySink {
    fn deliver(&self, _snapshot: &Snapshot) -> Result<(), DeliveryError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(DeliveryError::Rejected("socket write failed".to_string()))
        } else {
            Ok(())
        }
    }
}

#[test]
fn failing_observer_does_not_block_others() {
    let channel = in_process(true);
    let session = IntakeSession::new(channel.clone(), IntakeConfig::default()).unwrap();

    let flaky = Arc::new(FlakySink {
        failing: AtomicBool::new(true),
    });
    channel.subscribe_sink(flaky.clone()).unwrap();
    let mut healthy = session.observe().unwrap();

    session.apply_edit(PatientField::Language, "Thai").unwrap();
    assert_eq!(healthy.try_drain().unwrap(), 1);
    assert_eq!(channel.failed_deliveries(), 1);
    assert_eq!(channel.observer_count(), 2);

    flaky.failing.store(false, Ordering::SeqCst);
    session.apply_edit(PatientField::Language, "English").unwrap();
    assert_eq!(healthy.try_drain().unwrap(), 1);
    assert_eq!(channel.failed_deliveries(), 1);
}

#[test]
fn reset_starts_a_new_session_for_observers() {
    let channel = in_process(true);
    let session = IntakeSession::new(channel.clone(), IntakeConfig::default()).unwrap();
    let mut staff = session.observe().unwrap();

    session.apply_edit(PatientField::FirstName, "Ada").unwrap();
    session.mark_submitted().unwrap();
    staff.try_drain().unwrap();
    let first_session = staff.session_id().unwrap();
    assert!(staff.submitted_at().is_some());

    session.reset().unwrap();
    staff.try_drain().unwrap();
    assert_ne!(staff.session_id().unwrap(), first_session);
    assert!(staff.submitted_at().is_none());
    assert_eq!(staff.completion_percentage(), 0);
    assert_eq!(staff.status(), Some(PatientStatus::Active));
}

#[test]
fn concurrent_writers_keep_a_single_order() {
    let channel = in_process(true);
    let session = IntakeSession::new(channel.clone(), IntakeConfig::default()).unwrap();
    let a = session.observe().unwrap();
    let b = session.observe().unwrap();

    let writers: Vec<_> = [PatientField::FirstName, PatientField::LastName, PatientField::Address]
        .into_iter()
        .map(|field| {
            let session = session.clone();
            thread::spawn(move || {
                for i in 0..50 {
                    session.apply_edit(field, format!("{i}")).unwrap();
                }
            })
        })
        .collect();
    for w in writers {
        w.join().unwrap();
    }

    let order = |mut obs: ObserverSession| {
        let mut seqs = Vec::new();
        while let Ok(Some(s)) = obs.recv_timeout(Duration::from_millis(50)) {
            seqs.push(s.sequence);
        }
        seqs
    };
    let seen_a = order(a);
    let seen_b = order(b);
    assert_eq!(seen_a.len(), 150);
    assert_eq!(seen_a, seen_b);
    assert!(seen_a.windows(2).all(|w| w[1] == w[0] + 1));
}

#[test]
fn change_feed_binding_preserves_order_and_replay() {
    let store = Arc::new(InMemorySnapshotStore::new());
    let channel: Arc<dyn DistributionChannel> =
        Arc::new(ChangeFeedChannel::new(ChannelConfig::default(), store.clone()).unwrap());
    let session = IntakeSession::new(Arc::clone(&channel), IntakeConfig::default()).unwrap();
    let mut staff = session.observe().unwrap();

    for value in ["1", "12", "123"] {
        session.apply_edit(PatientField::Phone, value).unwrap();
    }
    let phones: Vec<String> = (0..3)
        .map(|_| staff.recv_timeout(WAIT).unwrap().unwrap().record.phone.clone())
        .collect();
    assert_eq!(phones, vec!["1", "12", "123"]);
    assert_eq!(store.writes(), 3);

    // A second channel on the same store replays the stored state.
    let restarted = ChangeFeedChannel::new(ChannelConfig::default(), store).unwrap();
    let mut late = ObserverSession::subscribe(&restarted, RequiredFields::dashboard()).unwrap();
    let replayed = late.recv_timeout(WAIT).unwrap().unwrap();
    assert_eq!(replayed.record.phone, "123");
}

#[test]
fn change_feed_under_backpressure_converges_on_submitted() {
    let store = Arc::new(InMemorySnapshotStore::new());
    let channel: Arc<dyn DistributionChannel> = Arc::new(
        ChangeFeedChannel::new(
            ChannelConfig {
                feed_queue_capacity: 1,
                ..ChannelConfig::default()
            },
            store.clone(),
        )
        .unwrap(),
    );
    let session = IntakeSession::new(Arc::clone(&channel), IntakeConfig::default()).unwrap();
    let mut staff = session.observe().unwrap();
    let _crowd: Vec<ObserverSession> = (0..100).map(|_| session.observe().unwrap()).collect();

    for n in 0..300 {
        session.apply_edit(PatientField::Address, format!("{n} Main Road")).unwrap();
    }
    let submitted = session.mark_submitted().unwrap().unwrap();

    let deadline = std::time::Instant::now() + WAIT;
    while staff.status() != Some(PatientStatus::Submitted) && std::time::Instant::now() < deadline {
        let _ = staff.recv_timeout(Duration::from_millis(50));
    }

    assert_eq!(staff.last_snapshot(), Some(&submitted));
    assert_eq!(store.latest().unwrap().unwrap().sequence, submitted.sequence);
    assert_eq!(staff.last_snapshot().unwrap().record.address, "299 Main Road");
}

#[test]
fn closing_the_session_releases_observers_and_timer() {
    let channel = in_process(true);
    let session = IntakeSession::new(channel.clone(), config_with_idle(30)).unwrap();
    let _staff = session.observe().unwrap();
    session.apply_edit(PatientField::Religion, "None").unwrap();

    session.close();
    assert_eq!(channel.observer_count(), 0);
    assert!(session.apply_edit(PatientField::Religion, "Buddhist").is_err());

    thread::sleep(Duration::from_millis(100));
    // No idle transition after teardown.
    assert_eq!(channel.last_snapshot().unwrap().status(), PatientStatus::Active);
}
