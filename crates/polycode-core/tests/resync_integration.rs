//! Save announcement and resync tests
//!
//! Steps run through a recording runner instead of git. Time is paused, so the
//! grace delay before a resync elapses instantly but stays measurable.

use std::path::Path;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use polycode_core::{
    connect_in_memory, ClientId, CollabError, CollabNode, CollabResult, CommandStep, DocumentStore,
    MemoryDocuments, NodeBuilder, NodeConfig, NodeEvent, NoticeLevel, Overlay, StepOutput,
    StepRunner,
};
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout, Duration, Instant};

/// Records every step it is asked to run
#[derive(Default)]
struct RecordingRunner {
    calls: Mutex<Vec<(String, Vec<String>)>>,
    fail: Vec<String>,
}

impl RecordingRunner {
    fn failing(step: &str) -> Self {
        Self {
            fail: vec![step.to_string()],
            ..Default::default()
        }
    }

    fn names(&self) -> Vec<String> {
        self.calls.lock().iter().map(|(n, _)| n.clone()).collect()
    }
}

impl StepRunner for RecordingRunner {
    fn run<'a>(
        &'a self,
        step: &'a CommandStep,
        args: Vec<String>,
        _cwd: &'a Path,
    ) -> BoxFuture<'a, CollabResult<StepOutput>> {
        Box::pin(async move {
            self.calls.lock().push((step.name.clone(), args));
            if self.fail.contains(&step.name) {
                return Err(CollabError::Command {
                    step: step.name.clone(),
                    reason: "exit status: 1".into(),
                });
            }
            Ok(StepOutput::default())
        })
    }
}

struct Peer {
    node: CollabNode,
    overlay: Overlay,
    runner: Arc<RecordingRunner>,
}

fn peer(name: &str, runner: RecordingRunner) -> Peer {
    let store: Arc<dyn DocumentStore> =
        Arc::new(MemoryDocuments::new(format!("/home/{}/project", name)));
    let runner = Arc::new(runner);
    let (overlay, events) = Overlay::new(format!("{}-endpoint", name));
    let node = NodeBuilder::new(NodeConfig::default(), store)
        .client_id(ClientId::from_string(name))
        .runner(Arc::clone(&runner) as Arc<dyn StepRunner>)
        .spawn(overlay.clone(), events);
    Peer {
        node,
        overlay,
        runner,
    }
}

async fn wait_for(what: &str, check: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(60);
    while !check() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_event(
    rx: &mut broadcast::Receiver<NodeEvent>,
    mut pick: impl FnMut(&NodeEvent) -> bool,
) -> NodeEvent {
    loop {
        match timeout(Duration::from_secs(60), rx.recv()).await {
            Ok(Ok(event)) if pick(&event) => return event,
            Ok(Ok(_)) => continue,
            other => panic!("event not seen: {:?}", other),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_save_triggers_resync_after_grace() {
    let a = peer("alice", RecordingRunner::default());
    let b = peer("bob", RecordingRunner::default());
    connect_in_memory(&a.overlay, &b.overlay);
    let mut b_events = b.node.subscribe_events();
    let saved_at = Instant::now();

    assert!(a.node.broadcast_save("fix parser").await.unwrap());
    assert_eq!(
        a.runner.names(),
        vec!["branch", "add", "commit", "checkout", "merge", "cleanup", "push"]
    );
    let commit_args = a.runner.calls.lock()[2].1.clone();
    assert_eq!(commit_args, vec!["commit", "-m", "fix parser"]);

    let announced = wait_event(&mut b_events, |e| {
        matches!(e, NodeEvent::SaveAnnounced { .. })
    })
    .await;
    assert_eq!(
        announced,
        NodeEvent::SaveAnnounced {
            by: Some(ClientId::from_string("alice")),
            commit_message: "fix parser".into(),
        }
    );
    assert!(b.runner.names().is_empty());

    wait_event(&mut b_events, |e| matches!(e, NodeEvent::SyncStarted)).await;
    assert!(saved_at.elapsed() >= Duration::from_secs(5));

    let finished = wait_event(&mut b_events, |e| {
        matches!(e, NodeEvent::SyncFinished { .. })
    })
    .await;
    assert_eq!(finished, NodeEvent::SyncFinished { success: true });
    assert_eq!(b.runner.names(), vec!["fetch", "reset", "pull"]);
    assert!(!b.node.get_status().sync_in_progress);

    // The saver does not resync on its own announcement.
    sleep(Duration::from_secs(10)).await;
    assert_eq!(a.runner.names().len(), 7);

    a.node.stop().await;
    b.node.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_save_is_not_announced() {
    let a = peer("alice", RecordingRunner::failing("commit"));
    let b = peer("bob", RecordingRunner::default());
    connect_in_memory(&a.overlay, &b.overlay);
    let mut a_events = a.node.subscribe_events();
    let mut b_events = b.node.subscribe_events();

    assert!(!a.node.broadcast_save("broken").await.unwrap());
    assert_eq!(
        a.runner.names(),
        vec!["branch", "add", "commit", "checkout", "cleanup"]
    );

    let failure = wait_event(&mut a_events, |e| {
        matches!(
            e,
            NodeEvent::Notification {
                level: NoticeLevel::Error,
                ..
            }
        )
    })
    .await;
    match failure {
        NodeEvent::Notification { message, .. } => assert!(message.contains("commit")),
        other => panic!("unexpected {:?}", other),
    }

    sleep(Duration::from_secs(10)).await;
    assert!(b.runner.names().is_empty());
    while let Ok(event) = b_events.try_recv() {
        assert!(!matches!(event, NodeEvent::SaveAnnounced { .. }));
    }
    assert!(!a.node.get_status().sync_in_progress);

    a.node.stop().await;
    b.node.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_request_resync_runs_everywhere() {
    let a = peer("alice", RecordingRunner::default());
    let b = peer("bob", RecordingRunner::default());
    let c = peer("carol", RecordingRunner::default());
    connect_in_memory(&a.overlay, &b.overlay);
    connect_in_memory(&b.overlay, &c.overlay);

    let report = a.node.request_resync().await.unwrap();
    assert!(report.success());
    assert_eq!(a.runner.names(), vec!["fetch", "reset", "pull"]);

    wait_for("bob resynced", || b.runner.names().len() == 3).await;
    wait_for("carol resynced", || c.runner.names().len() == 3).await;

    for p in [a, b, c] {
        p.node.stop().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_repeated_announcements_resync_once() {
    let a = peer("alice", RecordingRunner::default());
    let b = peer("bob", RecordingRunner::default());
    connect_in_memory(&a.overlay, &b.overlay);
    let mut b_events = b.node.subscribe_events();

    assert!(a.node.broadcast_save("one").await.unwrap());
    assert!(a.node.broadcast_save("two").await.unwrap());

    wait_event(&mut b_events, |e| matches!(e, NodeEvent::SyncFinished { .. })).await;
    sleep(Duration::from_secs(30)).await;
    assert_eq!(b.runner.names(), vec!["fetch", "reset", "pull"]);

    a.node.stop().await;
    b.node.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_resync_reports_and_releases_flag() {
    let a = peer("alice", RecordingRunner::failing("fetch"));
    let mut events = a.node.subscribe_events();

    let report = a.node.request_resync().await.unwrap();
    assert!(!report.success());
    assert_eq!(a.runner.names(), vec!["fetch"]);
    assert!(!a.node.guard().is_sync_in_progress());

    wait_event(&mut events, |e| {
        matches!(
            e,
            NodeEvent::Notification {
                level: NoticeLevel::Error,
                ..
            }
        )
    })
    .await;
    a.node.stop().await;
}
