//! Protocol-level tests against a live master task.
//!
//! Each test binds a master on a Unix socket in a temp directory and talks
//! to it as workers, relays, and discovery would: over real connections.

use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use volley::discovery::DiscoveryChild;
use volley::hooks::DefaultHooks;
use volley::master::{DispatchOutcome, Master, MasterError, MasterReport};
use volley::protocol::{
    Endpoint, MasterClient, PopReply, RunToken, SuiteId, SuiteOutcome, SuiteResult, WorkerRecord,
};
use volley::queue::SuiteQueue;
use volley::supervisor::WorkerPool;

fn suite(name: &str) -> SuiteId {
    SuiteId::new(name, format!("t/{}.sh", name.to_lowercase()))
}

struct Harness {
    dir: TempDir,
    endpoint: Endpoint,
    token: RunToken,
}

impl Harness {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let endpoint = Endpoint::Unix(dir.path().join("master.sock"));
        Self {
            dir,
            endpoint,
            token: RunToken::generate(),
        }
    }

    /// Spawn a master task with no local workers.
    async fn start_master(
        &self,
        known: Vec<(SuiteId, f64)>,
        whitelist: &[String],
        discovery: Option<DiscoveryChild>,
    ) -> JoinHandle<MasterReport> {
        let listener = self.endpoint.bind().await.unwrap();
        let queue = SuiteQueue::build(known, whitelist);
        let pool = WorkerPool::new(self.dir.path().to_path_buf(), "testhost".to_string());
        let master = Master::new(
            listener,
            self.token.clone(),
            queue,
            pool,
            discovery,
            self.dir.path(),
        );
        let (_tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            let hooks = DefaultHooks;
            master.run(&hooks, rx).await
        })
    }

    fn client(&self) -> MasterClient {
        MasterClient::new(self.endpoint.clone(), self.token.clone())
    }

    fn foreign_client(&self) -> MasterClient {
        MasterClient::new(self.endpoint.clone(), RunToken::generate())
    }
}

fn discovery_child(script: &str) -> DiscoveryChild {
    let mut cmd = tokio::process::Command::new("sh");
    cmd.args(["-c", script]);
    cmd.kill_on_drop(true);
    DiscoveryChild::new(cmd.spawn().unwrap())
}

async fn pop_name(client: &MasterClient) -> String {
    match client.pop().await.unwrap() {
        PopReply::Suite(suite) => suite.name,
        other => panic!("expected a suite, got {other:?}"),
    }
}

#[tokio::test]
async fn test_dispatch_order_follows_history() {
    let harness = Harness::new();
    let known = vec![(suite("A"), 5.0), (suite("B"), 3.0), (suite("C"), 1.0)];
    let master = harness.start_master(known, &[], None).await;
    let client = harness.client();

    assert_eq!(pop_name(&client).await, "A");
    assert_eq!(pop_name(&client).await, "B");
    assert_eq!(pop_name(&client).await, "C");

    let report = master.await.unwrap();
    assert!(matches!(report.outcome, Ok(DispatchOutcome::Drained)));
    assert!(report.completed.is_empty());
}

#[tokio::test]
async fn test_pop_after_drain_gets_empty_body() {
    let harness = Harness::new();
    let master = harness.start_master(Vec::new(), &[], None).await;
    let client = harness.client();

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(client.pop().await.unwrap(), PopReply::Done);

    let report = master.await.unwrap();
    assert!(matches!(report.outcome, Ok(DispatchOutcome::Drained)));
}

#[tokio::test]
async fn test_whitelist_reorders_dispatch() {
    let harness = Harness::new();
    let known = vec![(suite("A"), 5.0), (suite("B"), 3.0), (suite("C"), 1.0)];
    let whitelist = vec!["C".to_string(), "A".to_string(), "B".to_string()];
    let master = harness.start_master(known, &whitelist, None).await;
    let client = harness.client();

    assert_eq!(pop_name(&client).await, "C");
    assert_eq!(pop_name(&client).await, "A");
    assert_eq!(pop_name(&client).await, "B");

    let report = master.await.unwrap();
    assert!(matches!(report.outcome, Ok(DispatchOutcome::Drained)));
}

#[tokio::test]
async fn test_pop_waits_for_late_discovery() {
    let harness = Harness::new();
    let master = harness
        .start_master(Vec::new(), &[], Some(discovery_child("sleep 2")))
        .await;
    let client = harness.client();

    // Nothing known yet and discovery is still walking files.
    assert_eq!(client.pop().await.unwrap(), PopReply::Wait);

    client.new_suite(&suite("X")).await.unwrap();
    assert_eq!(pop_name(&client).await, "X");

    assert_eq!(client.pop().await.unwrap(), PopReply::Wait);

    client.new_suite(&suite("Y")).await.unwrap();
    assert_eq!(pop_name(&client).await, "Y");

    let report = master.await.unwrap();
    assert!(matches!(report.outcome, Ok(DispatchOutcome::Drained)));
}

#[tokio::test]
async fn test_duplicate_new_suite_is_noop() {
    let harness = Harness::new();
    let master = harness
        .start_master(Vec::new(), &[], Some(discovery_child("sleep 1")))
        .await;
    let client = harness.client();

    client.new_suite(&suite("X")).await.unwrap();
    client.new_suite(&suite("X")).await.unwrap();
    assert_eq!(pop_name(&client).await, "X");

    // The duplicate did not queue a second copy.
    assert_eq!(client.pop().await.unwrap(), PopReply::Wait);

    master.await.unwrap();
}

#[tokio::test]
async fn test_missing_forced_suite_aborts() {
    let harness = Harness::new();
    let whitelist = vec!["Z".to_string()];
    let master = harness
        .start_master(Vec::new(), &whitelist, Some(discovery_child("exit 0")))
        .await;

    let report = master.await.unwrap();
    match report.outcome {
        Err(MasterError::MissingForcedSuites(names)) => assert!(names.contains('Z')),
        other => panic!("expected missing forced suites, got {other:?}"),
    }
}

#[tokio::test]
async fn test_failed_discovery_aborts() {
    let harness = Harness::new();
    let master = harness
        .start_master(Vec::new(), &[], Some(discovery_child("exit 3")))
        .await;

    let report = master.await.unwrap();
    assert!(matches!(report.outcome, Err(MasterError::DiscoveryFailed(_))));
}

#[tokio::test]
async fn test_satisfied_whitelist_interrupts_discovery() {
    let harness = Harness::new();
    let whitelist = vec!["X".to_string()];
    // A discovery stand-in that exits 0 when interrupted, as the real
    // discovery subprocess does.
    let discovery = discovery_child("trap 'exit 0' INT; sleep 5 & wait $!; exit 0");
    let master = harness
        .start_master(Vec::new(), &whitelist, Some(discovery))
        .await;
    let client = harness.client();

    assert_eq!(client.pop().await.unwrap(), PopReply::Wait);

    client.new_suite(&suite("X")).await.unwrap();
    assert_eq!(pop_name(&client).await, "X");

    let report = master.await.unwrap();
    assert!(matches!(report.outcome, Ok(DispatchOutcome::Drained)));
}

#[tokio::test]
async fn test_relay_workers_counted_and_forwarded() {
    let harness = Harness::new();
    let known = vec![(suite("X"), 2.0), (suite("Y"), 1.0)];
    let master = harness.start_master(known, &[], None).await;
    let client = harness.client();

    client.announce_relay(2, "host2", Some("nightly")).await.unwrap();

    // Remote workers pull from the primary directly.
    assert_eq!(pop_name(&client).await, "X");
    assert_eq!(pop_name(&client).await, "Y");

    for (num, name) in ["X", "Y"].iter().enumerate() {
        let mut record = WorkerRecord::new(num, 1000 + num as u32, "host2");
        record.exit_status = 0;
        record.suites_run.push(SuiteResult {
            id: suite(name),
            outcome: SuiteOutcome::Passed,
            duration_seconds: 0.5,
            detail: None,
        });
        client.forward_worker(&record).await.unwrap();
    }

    let report = master.await.unwrap();
    assert!(matches!(report.outcome, Ok(DispatchOutcome::Drained)));
    assert_eq!(report.completed.len(), 2);
    assert!(report.completed.iter().all(|r| r.host == "host2"));
    let names: Vec<_> = report
        .completed
        .iter()
        .flat_map(|r| r.suites_run.iter().map(|s| s.id.name.clone()))
        .collect();
    assert!(names.contains(&"X".to_string()));
    assert!(names.contains(&"Y".to_string()));
}

#[tokio::test]
async fn test_foreign_token_never_mutates_state() {
    let harness = Harness::new();
    let known = vec![(suite("A"), 1.0)];
    let master = harness.start_master(known, &[], None).await;

    let foreign = harness.foreign_client();
    assert_eq!(foreign.pop().await.unwrap(), PopReply::WrongRun);
    assert!(matches!(
        foreign.announce_relay(5, "rogue", None).await,
        Err(volley::protocol::ProtocolError::WrongRun)
    ));
    // A forwarded record with a bad token is dropped before parsing.
    let record = WorkerRecord::new(0, 1, "rogue");
    foreign.forward_worker(&record).await.ok();

    // The queue is untouched: the real client still gets A, and the run
    // terminates without waiting on phantom remote workers.
    let client = harness.client();
    assert_eq!(pop_name(&client).await, "A");

    let report = master.await.unwrap();
    assert!(matches!(report.outcome, Ok(DispatchOutcome::Drained)));
    assert!(report.completed.is_empty());
}

#[tokio::test]
async fn test_kaboom_stops_dispatch() {
    let harness = Harness::new();
    let known = vec![(suite("A"), 2.0), (suite("B"), 1.0)];
    let master = harness.start_master(known, &[], None).await;
    let client = harness.client();

    assert_eq!(pop_name(&client).await, "A");
    client.kaboom().await.unwrap();

    let report = master.await.unwrap();
    assert!(matches!(report.outcome, Ok(DispatchOutcome::Kaboom)));
}
