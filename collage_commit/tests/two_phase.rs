//! End-to-end tests for the two-phase collage commit protocol.
//!
//! Each test wires a coordinator and participants over the in-memory
//! transport with real dispatcher threads, then drives a commit through
//! the full protocol:
//! - Unanimous commit, single NO, missing source, cross-locked sources
//! - Coordinator crash during PREPARING
//! - Decision message loss healed by the retry heartbeat

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use collage_commit::{
    Approval, AutoApprove, Coordinator, CoordinatorConfig, MemoryHub, MemoryTransport,
    Participant, ParticipantConfig, RetryEngine, Transport, TxnState,
};
use tempfile::TempDir;

/// Oracle that always rejects.
struct Reject;

impl Approval for Reject {
    fn ask_user(&self, _composite: &[u8], _sources: &[String]) -> bool {
        false
    }
}

/// Oracle that records whether it was ever consulted.
struct Tracked {
    asked: AtomicBool,
}

impl Tracked {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            asked: AtomicBool::new(false),
        })
    }
}

impl Approval for Tracked {
    fn ask_user(&self, _composite: &[u8], _sources: &[String]) -> bool {
        self.asked.store(true, Ordering::SeqCst);
        true
    }
}

fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

fn sources(refs: &[&str]) -> Vec<String> {
    refs.iter().map(|s| s.to_string()).collect()
}

/// Wires roles over one `MemoryHub` and owns their dispatcher threads.
struct Harness {
    hub: Arc<MemoryHub>,
    threads: Vec<JoinHandle<()>>,
    ids: Vec<String>,
}

impl Harness {
    fn new() -> Self {
        Self {
            hub: MemoryHub::new(),
            threads: Vec::new(),
            ids: Vec::new(),
        }
    }

    fn coordinator(
        &mut self,
        prepare_timeout: Duration,
        resend_interval: Duration,
    ) -> (Arc<Coordinator>, Arc<MemoryTransport>, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(self.hub.register("server"));
        let config = CoordinatorConfig::default()
            .with_prepare_timeout(prepare_timeout)
            .with_resend_interval(resend_interval)
            .with_log_path(dir.path().join("server_log.dat"))
            .with_image_dir(dir.path());
        let coordinator = Arc::new(
            Coordinator::new(config, Arc::clone(&transport) as Arc<dyn Transport>).unwrap(),
        );

        let runner = Arc::clone(&coordinator);
        self.threads.push(std::thread::spawn(move || runner.run()));
        self.ids.push("server".to_string());
        (coordinator, transport, dir)
    }

    fn participant(
        &mut self,
        id: &str,
        approval: Arc<dyn Approval>,
        seeded: &[&str],
    ) -> (Arc<Participant>, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        for file in seeded {
            std::fs::write(dir.path().join(file), format!("source:{file}")).unwrap();
        }
        let config = ParticipantConfig::new(id)
            .with_log_path(dir.path().join(format!("usernode_{id}_log.dat")))
            .with_image_dir(dir.path());
        let transport = Arc::new(self.hub.register(id)) as Arc<dyn Transport>;
        let participant = Arc::new(Participant::new(config, transport, approval));

        let runner = Arc::clone(&participant);
        self.threads.push(std::thread::spawn(move || runner.run()));
        self.ids.push(id.to_string());
        (participant, dir)
    }

    fn stop(mut self) {
        for id in &self.ids {
            self.hub.unregister(id);
        }
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

#[test]
fn test_unanimous_commit_applies_everywhere() {
    let mut net = Harness::new();
    let (coordinator, _ctrans, cdir) =
        net.coordinator(Duration::from_secs(3), Duration::from_millis(200));
    let (pa, adir) = net.participant("A", Arc::new(AutoApprove), &["a1.jpg", "a2.jpg"]);
    let (pb, bdir) = net.participant("B", Arc::new(AutoApprove), &["b1.jpg"]);
    let retry = RetryEngine::start(Arc::clone(&coordinator));

    let composite = vec![0xDE, 0xAD, 0xBE, 0xEF];
    let txn_id = coordinator
        .start_commit(
            "out.jpg",
            composite.clone(),
            &sources(&["A:a1.jpg", "A:a2.jpg", "B:b1.jpg"]),
        )
        .unwrap();

    assert!(wait_until(Duration::from_secs(3), || {
        coordinator.get(&txn_id).unwrap().state == TxnState::Committed
    }));

    // The composite holds exactly the proposed bytes and every source is gone.
    assert_eq!(
        std::fs::read(cdir.path().join("out.jpg")).unwrap(),
        composite
    );
    assert!(!adir.path().join("a1.jpg").exists());
    assert!(!adir.path().join("a2.jpg").exists());
    assert!(!bdir.path().join("b1.jpg").exists());

    // No lock leakage after the terminal state.
    assert_eq!(pa.locked_count(), 0);
    assert_eq!(pb.locked_count(), 0);
    assert_eq!(pa.active_count(), 0);
    assert_eq!(pb.active_count(), 0);

    drop(retry);
    net.stop();
}

#[test]
fn test_single_no_vote_aborts_everywhere() {
    let mut net = Harness::new();
    let (coordinator, _ctrans, cdir) =
        net.coordinator(Duration::from_secs(3), Duration::from_millis(200));
    let (pa, adir) = net.participant("A", Arc::new(AutoApprove), &["a1.jpg", "a2.jpg"]);
    let (pb, bdir) = net.participant("B", Arc::new(Reject), &["b1.jpg"]);
    let retry = RetryEngine::start(Arc::clone(&coordinator));

    let txn_id = coordinator
        .start_commit(
            "out.jpg",
            vec![1, 2, 3],
            &sources(&["A:a1.jpg", "A:a2.jpg", "B:b1.jpg"]),
        )
        .unwrap();

    assert!(wait_until(Duration::from_secs(3), || {
        coordinator.get(&txn_id).unwrap().state == TxnState::Aborted
    }));

    // Nothing happened anywhere: no composite, all sources intact.
    assert!(!cdir.path().join("out.jpg").exists());
    assert!(adir.path().join("a1.jpg").exists());
    assert!(adir.path().join("a2.jpg").exists());
    assert!(bdir.path().join("b1.jpg").exists());
    assert_eq!(pa.locked_count(), 0);
    assert_eq!(pb.locked_count(), 0);

    drop(retry);
    net.stop();
}

#[test]
fn test_missing_source_votes_no_without_prompting() {
    let mut net = Harness::new();
    let (coordinator, _ctrans, cdir) =
        net.coordinator(Duration::from_secs(3), Duration::from_millis(200));
    let (_pa, adir) = net.participant("A", Arc::new(AutoApprove), &["a1.jpg"]);
    let oracle = Tracked::new();
    let (_pb, _bdir) = net.participant("B", Arc::clone(&oracle) as Arc<dyn Approval>, &[]);
    let retry = RetryEngine::start(Arc::clone(&coordinator));

    let txn_id = coordinator
        .start_commit("out.jpg", vec![7], &sources(&["A:a1.jpg", "B:b1.jpg"]))
        .unwrap();

    assert!(wait_until(Duration::from_secs(3), || {
        coordinator.get(&txn_id).unwrap().state == TxnState::Aborted
    }));

    assert!(!oracle.asked.load(Ordering::SeqCst));
    assert!(!cdir.path().join("out.jpg").exists());
    assert!(adir.path().join("a1.jpg").exists());

    drop(retry);
    net.stop();
}

#[test]
fn test_cross_locked_source_aborts_second_commit() {
    let mut net = Harness::new();
    let (coordinator, ctrans, cdir) =
        net.coordinator(Duration::from_secs(3), Duration::from_millis(100));
    let (pa, adir) = net.participant("A", Arc::new(AutoApprove), &["a1.jpg", "a2.jpg"]);

    // Hold the first commit open by dropping its COMMIT order once.
    ctrans.drop_next(&"A".to_string(), "Commit", 1);

    let first = coordinator
        .start_commit("first.jpg", vec![1], &sources(&["A:a1.jpg"]))
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        coordinator.get(&first).unwrap().state == TxnState::Committing
    }));
    assert!(pa.is_promised(&first));

    // The second commit touches the locked a1.jpg and must abort.
    let second = coordinator
        .start_commit("second.jpg", vec![2], &sources(&["A:a1.jpg", "A:a2.jpg"]))
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        coordinator.get(&second).unwrap().state == TxnState::Aborted
    }));
    assert!(!cdir.path().join("second.jpg").exists());
    assert!(adir.path().join("a2.jpg").exists());

    // Once the heartbeat re-sends the COMMIT, the first commit completes.
    let retry = RetryEngine::start(Arc::clone(&coordinator));
    assert!(wait_until(Duration::from_secs(2), || {
        coordinator.get(&first).unwrap().state == TxnState::Committed
    }));
    assert!(!adir.path().join("a1.jpg").exists());
    assert_eq!(pa.locked_count(), 0);

    drop(retry);
    net.stop();
}

#[test]
fn test_coordinator_crash_during_preparing_recovers_to_abort() {
    let hub = MemoryHub::new();
    let cdir = tempfile::tempdir().unwrap();
    let config = CoordinatorConfig::default()
        .with_resend_interval(Duration::from_millis(100))
        .with_log_path(cdir.path().join("server_log.dat"))
        .with_image_dir(cdir.path());

    // First incarnation: the PREPAREs are lost and no vote ever arrives.
    let txn_id = {
        let transport = Arc::new(hub.register("server"));
        transport.drop_next(&"A".to_string(), "Prepare", 1);
        let coordinator =
            Coordinator::new(config.clone(), transport as Arc<dyn Transport>).unwrap();
        let txn_id = coordinator
            .start_commit("out.jpg", vec![9, 9], &sources(&["A:a1.jpg"]))
            .unwrap();
        assert_eq!(
            coordinator.get(&txn_id).unwrap().state,
            TxnState::Preparing
        );
        txn_id
    };
    hub.unregister(&"server".to_string());

    // Restart: recovery forces the undecided transaction to abort.
    let transport = Arc::new(hub.register("server"));
    let coordinator =
        Arc::new(Coordinator::new(config, transport as Arc<dyn Transport>).unwrap());
    assert_eq!(coordinator.get(&txn_id).unwrap().state, TxnState::Aborting);
    assert!(!cdir.path().join("out.jpg").exists());

    // The participant comes up, receives the retried ABORT, releases.
    let adir = tempfile::tempdir().unwrap();
    std::fs::write(adir.path().join("a1.jpg"), b"source").unwrap();
    let pconfig = ParticipantConfig::new("A")
        .with_log_path(adir.path().join("usernode_A_log.dat"))
        .with_image_dir(adir.path());
    let participant = Arc::new(Participant::new(
        pconfig,
        Arc::new(hub.register("A")) as Arc<dyn Transport>,
        Arc::new(AutoApprove),
    ));
    let participant_runner = Arc::clone(&participant);
    let participant_thread = std::thread::spawn(move || participant_runner.run());
    let coordinator_runner = Arc::clone(&coordinator);
    let coordinator_thread = std::thread::spawn(move || coordinator_runner.run());
    let retry = RetryEngine::start(Arc::clone(&coordinator));

    assert!(wait_until(Duration::from_secs(2), || {
        coordinator.get(&txn_id).unwrap().state == TxnState::Aborted
    }));
    assert!(adir.path().join("a1.jpg").exists());
    assert_eq!(participant.locked_count(), 0);

    drop(retry);
    hub.unregister(&"server".to_string());
    hub.unregister(&"A".to_string());
    let _ = participant_thread.join();
    let _ = coordinator_thread.join();
}

#[test]
fn test_lost_commit_is_resent_until_acknowledged() {
    let mut net = Harness::new();
    let (coordinator, ctrans, cdir) =
        net.coordinator(Duration::from_secs(3), Duration::from_millis(150));
    let (_pa, adir) = net.participant("A", Arc::new(AutoApprove), &["a1.jpg"]);
    let (_pb, bdir) = net.participant("B", Arc::new(AutoApprove), &["b1.jpg"]);
    let retry = RetryEngine::start(Arc::clone(&coordinator));

    ctrans.drop_next(&"A".to_string(), "Commit", 1);

    let txn_id = coordinator
        .start_commit("out.jpg", vec![4, 4], &sources(&["A:a1.jpg", "B:b1.jpg"]))
        .unwrap();

    assert!(wait_until(Duration::from_secs(3), || {
        coordinator.get(&txn_id).unwrap().state == TxnState::Committed
    }));

    assert!(ctrans.dropped_count() >= 1);
    assert!(coordinator.stats.resends.load(Ordering::Relaxed) >= 1);
    assert!(cdir.path().join("out.jpg").exists());
    assert!(!adir.path().join("a1.jpg").exists());
    assert!(!bdir.path().join("b1.jpg").exists());

    drop(retry);
    net.stop();
}

#[test]
fn test_duplicated_commit_deletes_sources_once() {
    let mut net = Harness::new();
    let (coordinator, ctrans, _cdir) =
        net.coordinator(Duration::from_secs(3), Duration::from_millis(200));
    let (pa, adir) = net.participant("A", Arc::new(AutoApprove), &["a1.jpg"]);
    let retry = RetryEngine::start(Arc::clone(&coordinator));

    ctrans.duplicate_next(&"A".to_string(), "Commit", 1);

    let txn_id = coordinator
        .start_commit("out.jpg", vec![1], &sources(&["A:a1.jpg"]))
        .unwrap();

    assert!(wait_until(Duration::from_secs(3), || {
        coordinator.get(&txn_id).unwrap().state == TxnState::Committed
    }));

    // Both copies were delivered; only the first had any effect.
    assert!(wait_until(Duration::from_secs(1), || {
        pa.stats.prepares.load(Ordering::Relaxed) >= 1
    }));
    assert_eq!(pa.stats.commits_applied.load(Ordering::Relaxed), 1);
    assert!(!adir.path().join("a1.jpg").exists());
    assert_eq!(pa.locked_count(), 0);

    drop(retry);
    net.stop();
}

#[test]
fn test_independent_commits_make_progress_concurrently() {
    let mut net = Harness::new();
    let (coordinator, _ctrans, cdir) =
        net.coordinator(Duration::from_secs(3), Duration::from_millis(200));
    let (_pa, adir) = net.participant("A", Arc::new(AutoApprove), &["a1.jpg"]);
    let (_pb, bdir) = net.participant("B", Arc::new(AutoApprove), &["b1.jpg"]);
    let retry = RetryEngine::start(Arc::clone(&coordinator));

    let first = coordinator
        .start_commit("first.jpg", vec![1], &sources(&["A:a1.jpg"]))
        .unwrap();
    let second = coordinator
        .start_commit("second.jpg", vec![2], &sources(&["B:b1.jpg"]))
        .unwrap();

    assert!(wait_until(Duration::from_secs(3), || {
        coordinator.get(&first).unwrap().state == TxnState::Committed
            && coordinator.get(&second).unwrap().state == TxnState::Committed
    }));

    assert!(cdir.path().join("first.jpg").exists());
    assert!(cdir.path().join("second.jpg").exists());
    assert!(!adir.path().join("a1.jpg").exists());
    assert!(!bdir.path().join("b1.jpg").exists());

    drop(retry);
    net.stop();
}

#[test]
fn test_prepare_deadline_aborts_unresponsive_participant() {
    let mut net = Harness::new();
    let (coordinator, ctrans, cdir) =
        net.coordinator(Duration::from_millis(300), Duration::from_millis(100));
    let (pa, adir) = net.participant("A", Arc::new(AutoApprove), &["a1.jpg"]);
    let (_pb, bdir) = net.participant("B", Arc::new(AutoApprove), &["b1.jpg"]);
    let retry = RetryEngine::start(Arc::clone(&coordinator));

    // B never sees its PREPARE, so the deadline must fire.
    ctrans.drop_next(&"B".to_string(), "Prepare", 1);

    let txn_id = coordinator
        .start_commit("out.jpg", vec![3], &sources(&["A:a1.jpg", "B:b1.jpg"]))
        .unwrap();

    assert!(wait_until(Duration::from_secs(3), || {
        coordinator.get(&txn_id).unwrap().state == TxnState::Aborted
    }));

    assert_eq!(coordinator.stats.timed_out.load(Ordering::Relaxed), 1);
    assert!(!cdir.path().join("out.jpg").exists());
    assert!(adir.path().join("a1.jpg").exists());
    assert!(bdir.path().join("b1.jpg").exists());
    assert_eq!(pa.locked_count(), 0);

    drop(retry);
    net.stop();
}
