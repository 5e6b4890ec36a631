//! Save and resync coordination through an external version-control tool
//!
//! ```text
//!   local save ─► Saving ─► steps ok? ─► github_save flooded ─► Idle
//!
//!   github_save / sync_request received
//!       Idle ─► Notified ─► Waiting (grace delay) ─► Syncing ─► Idle
//!                                                     │
//!                                   SyncPermit held: capture suspended
//! ```
//!
//! Each step runs with its own timeout; a timed-out step's process is killed.
//! A failing step does not stop the sequence unless it is marked `required`,
//! in which case the remaining steps are skipped, except those marked
//! `always` (branch restores and cleanup). The permit is released and
//! the phase returns to `Idle` on every exit path.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{CollabError, CollabResult};
use crate::guard::FeedbackGuard;
use crate::sync::events::NodeEvent;
use crate::types::ClientId;

/// Timeout for a step that does not set one
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(60);

fn default_timeout_secs() -> u64 {
    DEFAULT_STEP_TIMEOUT.as_secs()
}

/// One external command in a save or resync sequence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandStep {
    /// Label used in logs and reports
    pub name: String,
    /// Executable
    pub program: String,
    /// Arguments; `{message}` is replaced by the commit message
    #[serde(default)]
    pub args: Vec<String>,
    /// Time budget (seconds)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Whether later steps depend on this one
    #[serde(default)]
    pub required: bool,
    /// Run even after a required step failed
    #[serde(default)]
    pub always: bool,
}

impl CommandStep {
    /// Optional step with the default timeout
    pub fn new<I, S>(name: impl Into<String>, program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            timeout_secs: default_timeout_secs(),
            required: false,
            always: false,
        }
    }

    /// Mark as a prerequisite for the steps after it
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Run even when an earlier required step failed
    pub fn always(mut self) -> Self {
        self.always = true;
        self
    }

    /// Override the time budget
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs().max(1);
        self
    }

    /// Time budget
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Arguments with placeholders filled in
    pub fn render_args(&self, message: Option<&str>) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| match message {
                Some(m) => arg.replace("{message}", m),
                None => arg.clone(),
            })
            .collect()
    }
}

/// Captured output of a successful step
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepOutput {
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
}

/// Executes steps; success means exit status 0
pub trait StepRunner: Send + Sync {
    /// Run `step` with `args` in `cwd`.
    ///
    /// Dropping the returned future must stop the underlying work.
    fn run<'a>(
        &'a self,
        step: &'a CommandStep,
        args: Vec<String>,
        cwd: &'a Path,
    ) -> BoxFuture<'a, CollabResult<StepOutput>>;
}

/// Runs steps as child processes
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl StepRunner for ProcessRunner {
    fn run<'a>(
        &'a self,
        step: &'a CommandStep,
        args: Vec<String>,
        cwd: &'a Path,
    ) -> BoxFuture<'a, CollabResult<StepOutput>> {
        Box::pin(async move {
            let output = tokio::process::Command::new(&step.program)
                .args(&args)
                .current_dir(cwd)
                .kill_on_drop(true)
                .output()
                .await
                .map_err(|e| CollabError::Command {
                    step: step.name.clone(),
                    reason: format!("failed to spawn {}: {}", step.program, e),
                })?;

            let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            if !output.status.success() {
                return Err(CollabError::Command {
                    step: step.name.clone(),
                    reason: format!("{}: {}", output.status, stderr.trim()),
                });
            }
            Ok(StepOutput { stdout, stderr })
        })
    }
}

/// How one step ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepStatus {
    /// Exit status 0
    Succeeded,
    /// Ran and failed
    Failed(String),
    /// Killed after its time budget
    TimedOut,
    /// Not run because a required step failed
    Skipped,
}

/// Outcome of one step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    /// Step name
    pub name: String,
    /// How it ended
    pub status: StepStatus,
}

/// Outcome of a whole sequence
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceReport {
    /// One entry per configured step, in order
    pub steps: Vec<StepReport>,
}

impl SequenceReport {
    /// Whether every step succeeded
    pub fn success(&self) -> bool {
        self.steps
            .iter()
            .all(|s| s.status == StepStatus::Succeeded)
    }

    /// Names of steps that did not succeed
    pub fn failed_steps(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| s.status != StepStatus::Succeeded)
            .map(|s| s.name.as_str())
            .collect()
    }
}

/// Run `steps` in order, best effort
pub async fn run_steps(
    runner: &dyn StepRunner,
    steps: &[CommandStep],
    cwd: &Path,
    message: Option<&str>,
) -> SequenceReport {
    let mut report = SequenceReport::default();
    let mut blocked_by: Option<String> = None;

    for step in steps {
        if let Some(prereq) = blocked_by.as_ref().filter(|_| !step.always) {
            debug!(step = %step.name, prereq = %prereq, "Step skipped");
            report.steps.push(StepReport {
                name: step.name.clone(),
                status: StepStatus::Skipped,
            });
            continue;
        }

        let args = step.render_args(message);
        let status = match tokio::time::timeout(step.timeout(), runner.run(step, args, cwd)).await {
            Ok(Ok(output)) => {
                debug!(step = %step.name, stdout = %output.stdout.trim(), "Step succeeded");
                StepStatus::Succeeded
            }
            Ok(Err(e)) => {
                warn!(step = %step.name, error = %e, "Step failed");
                StepStatus::Failed(e.to_string())
            }
            Err(_) => {
                let e = CollabError::Timeout {
                    step: step.name.clone(),
                    timeout: step.timeout(),
                };
                warn!(error = %e, "Step timed out");
                StepStatus::TimedOut
            }
        };

        if status != StepStatus::Succeeded && step.required && blocked_by.is_none() {
            blocked_by = Some(step.name.clone());
        }
        report.steps.push(StepReport {
            name: step.name.clone(),
            status,
        });
    }
    report
}

/// Where the coordinator is in its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncPhase {
    /// Nothing pending
    Idle,
    /// A save notification arrived
    Notified,
    /// Sleeping through the grace delay
    Waiting,
    /// Resync steps running
    Syncing,
    /// Save steps running
    Saving,
}

/// Returns the phase to `Idle` when dropped
struct PhaseReset<'a>(&'a Mutex<ResyncPhase>);

impl Drop for PhaseReset<'_> {
    fn drop(&mut self) {
        *self.0.lock() = ResyncPhase::Idle;
    }
}

/// Drives save and resync sequences for one peer
pub struct ResyncCoordinator {
    guard: Arc<FeedbackGuard>,
    runner: Arc<dyn StepRunner>,
    workspace: PathBuf,
    grace: Duration,
    resync_steps: Vec<CommandStep>,
    save_steps: Vec<CommandStep>,
    phase: Mutex<ResyncPhase>,
    events: broadcast::Sender<NodeEvent>,
}

impl std::fmt::Debug for ResyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResyncCoordinator")
            .field("workspace", &self.workspace)
            .field("grace", &self.grace)
            .field("phase", &*self.phase.lock())
            .field("runner", &"<StepRunner>")
            .finish()
    }
}

impl ResyncCoordinator {
    /// Create a coordinator
    pub fn new(
        guard: Arc<FeedbackGuard>,
        runner: Arc<dyn StepRunner>,
        workspace: impl Into<PathBuf>,
        grace: Duration,
        resync_steps: Vec<CommandStep>,
        save_steps: Vec<CommandStep>,
        events: broadcast::Sender<NodeEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            guard,
            runner,
            workspace: workspace.into(),
            grace,
            resync_steps,
            save_steps,
            phase: Mutex::new(ResyncPhase::Idle),
            events,
        })
    }

    /// Current phase
    pub fn phase(&self) -> ResyncPhase {
        *self.phase.lock()
    }

    /// React to a peer's save announcement or resync request.
    ///
    /// Starts the grace delay and a resync in the background. Returns `None`
    /// without doing anything when a cycle is already pending or running.
    pub fn notify(self: &Arc<Self>, by: Option<ClientId>) -> Option<JoinHandle<()>> {
        {
            let mut phase = self.phase.lock();
            if *phase != ResyncPhase::Idle || self.guard.is_sync_in_progress() {
                debug!(phase = ?*phase, "Resync already pending, notification ignored");
                return None;
            }
            *phase = ResyncPhase::Notified;
        }
        info!(by = ?by.as_ref().map(|c| c.short().to_string()), grace = ?self.grace, "Resync scheduled");

        let this = Arc::clone(self);
        Some(tokio::spawn(async move {
            *this.phase.lock() = ResyncPhase::Waiting;
            tokio::time::sleep(this.grace).await;
            if let Err(e) = this.run_resync().await {
                warn!(error = %e, "Scheduled resync did not run");
                *this.phase.lock() = ResyncPhase::Idle;
            }
        }))
    }

    /// Run the resync steps now.
    ///
    /// Fails only when another save or resync holds the permit.
    pub async fn run_resync(&self) -> CollabResult<SequenceReport> {
        let permit = self
            .guard
            .try_begin_sync()
            .ok_or_else(|| CollabError::InvalidOperation("a save or resync is already running".into()))?;
        *self.phase.lock() = ResyncPhase::Syncing;
        let _reset = PhaseReset(&self.phase);
        let _ = self.events.send(NodeEvent::SyncStarted);

        info!(steps = self.resync_steps.len(), "Resync started");
        let report = run_steps(self.runner.as_ref(), &self.resync_steps, &self.workspace, None).await;
        drop(permit);

        let success = report.success();
        if success {
            info!("Resync finished");
            let _ = self.events.send(NodeEvent::info("Synced latest changes from the repository"));
        } else {
            error!(failed = ?report.failed_steps(), "Resync finished with failures");
            let _ = self.events.send(NodeEvent::error(format!(
                "Resync failed at: {}",
                report.failed_steps().join(", ")
            )));
        }
        let _ = self.events.send(NodeEvent::SyncFinished { success });
        Ok(report)
    }

    /// Run the save steps with `commit_message`.
    ///
    /// Capture is suspended while they run. The caller announces the save
    /// only if the report is a success.
    pub async fn save(&self, commit_message: &str) -> CollabResult<SequenceReport> {
        let _permit = self
            .guard
            .try_begin_sync()
            .ok_or_else(|| CollabError::InvalidOperation("a save or resync is already running".into()))?;
        *self.phase.lock() = ResyncPhase::Saving;
        let _reset = PhaseReset(&self.phase);

        info!(message = %commit_message, steps = self.save_steps.len(), "Save started");
        let report = run_steps(
            self.runner.as_ref(),
            &self.save_steps,
            &self.workspace,
            Some(commit_message),
        )
        .await;

        if report.success() {
            info!("Save finished");
        } else {
            error!(failed = ?report.failed_steps(), "Save failed");
            let _ = self.events.send(NodeEvent::error(format!(
                "Save failed at: {}",
                report.failed_steps().join(", ")
            )));
        }
        Ok(report)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeRunner;
    use super::*;

    fn steps() -> Vec<CommandStep> {
        vec![
            CommandStep::new("fetch", "git", ["fetch"]).required(),
            CommandStep::new("reset", "git", ["reset"]),
            CommandStep::new("pull", "git", ["pull"]),
        ]
    }

    fn coordinator(
        runner: Arc<FakeRunner>,
        guard: Arc<FeedbackGuard>,
    ) -> (Arc<ResyncCoordinator>, broadcast::Receiver<NodeEvent>) {
        let (tx, rx) = broadcast::channel(64);
        let save = vec![CommandStep::new("commit", "git", ["commit", "-m", "{message}"]).required()];
        let c = ResyncCoordinator::new(
            guard,
            runner,
            "/ws",
            Duration::from_secs(5),
            steps(),
            save,
            tx,
        );
        (c, rx)
    }

    fn guard() -> Arc<FeedbackGuard> {
        FeedbackGuard::new(ClientId::from_string("me"))
    }

    #[tokio::test]
    async fn test_optional_failure_continues_required_failure_skips() {
        let runner = FakeRunner {
            fail: vec!["reset".into()],
            ..Default::default()
        };
        let report = run_steps(&runner, &steps(), Path::new("/ws"), None).await;
        assert_eq!(runner.names(), vec!["fetch", "reset", "pull"]);
        assert!(!report.success());
        assert_eq!(report.failed_steps(), vec!["reset"]);

        let runner = FakeRunner {
            fail: vec!["fetch".into()],
            ..Default::default()
        };
        let report = run_steps(&runner, &steps(), Path::new("/ws"), None).await;
        assert_eq!(runner.names(), vec!["fetch"]);
        assert_eq!(report.steps[1].status, StepStatus::Skipped);
        assert_eq!(report.steps[2].status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn test_failed_commit_still_returns_to_main() {
        let runner = FakeRunner {
            fail: vec!["commit".into()],
            ..Default::default()
        };
        let report = run_steps(
            &runner,
            &crate::config::default_save_steps(),
            Path::new("/ws"),
            Some("nothing to commit"),
        )
        .await;
        assert_eq!(
            runner.names(),
            vec!["branch", "add", "commit", "checkout", "cleanup"]
        );
        let status = |name: &str| {
            report
                .steps
                .iter()
                .find(|s| s.name == name)
                .map(|s| s.status.clone())
        };
        assert_eq!(status("checkout"), Some(StepStatus::Succeeded));
        assert_eq!(status("merge"), Some(StepStatus::Skipped));
        assert_eq!(status("push"), Some(StepStatus::Skipped));
        assert!(!report.success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_timeout() {
        let runner = FakeRunner {
            hang: vec!["reset".into()],
            ..Default::default()
        };
        let steps = vec![
            CommandStep::new("reset", "git", ["reset"]).with_timeout(Duration::from_secs(2)),
            CommandStep::new("pull", "git", ["pull"]),
        ];
        let report = run_steps(&runner, &steps, Path::new("/ws"), None).await;
        assert_eq!(report.steps[0].status, StepStatus::TimedOut);
        assert_eq!(report.steps[1].status, StepStatus::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_notify_waits_grace_then_syncs() {
        let g = guard();
        let runner = Arc::new(FakeRunner {
            guard: Some(Arc::clone(&g)),
            ..Default::default()
        });
        let (c, mut rx) = coordinator(Arc::clone(&runner), Arc::clone(&g));

        let handle = c.notify(Some(ClientId::from_string("peer"))).unwrap();
        assert!(c.notify(None).is_none(), "second trigger must be a no-op");

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(runner.names().is_empty());
        assert_eq!(c.phase(), ResyncPhase::Waiting);

        handle.await.unwrap();
        assert_eq!(runner.names(), vec!["fetch", "reset", "pull"]);
        assert!(runner.calls.lock().iter().all(|(_, _, syncing)| *syncing));
        assert!(!g.is_sync_in_progress());
        assert_eq!(c.phase(), ResyncPhase::Idle);

        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        assert_eq!(events.first(), Some(&NodeEvent::SyncStarted));
        assert_eq!(events.last(), Some(&NodeEvent::SyncFinished { success: true }));
    }

    #[tokio::test]
    async fn test_flag_reset_after_failed_resync() {
        let g = guard();
        let runner = Arc::new(FakeRunner {
            fail: vec!["fetch".into()],
            ..Default::default()
        });
        let (c, mut rx) = coordinator(runner, Arc::clone(&g));
        let report = c.run_resync().await.unwrap();
        assert!(!report.success());
        assert!(!g.is_sync_in_progress());
        assert_eq!(c.phase(), ResyncPhase::Idle);

        let mut saw_error = false;
        while let Ok(e) = rx.try_recv() {
            if let NodeEvent::Notification { level, .. } = e {
                saw_error |= level == crate::sync::events::NoticeLevel::Error;
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn test_busy_coordinator_rejects_second_run() {
        let g = guard();
        let (c, _rx) = coordinator(Arc::new(FakeRunner::default()), Arc::clone(&g));
        let _held = g.try_begin_sync().unwrap();
        assert!(c.run_resync().await.is_err());
        assert!(c.save("x").await.is_err());
        assert!(c.notify(None).is_none());
    }

    #[tokio::test]
    async fn test_save_fills_commit_message() {
        let g = guard();
        let runner = Arc::new(FakeRunner::default());
        let (c, _rx) = coordinator(Arc::clone(&runner), g);
        let report = c.save("wip: parser").await.unwrap();
        assert!(report.success());
        assert_eq!(
            runner.calls.lock()[0].1,
            vec!["commit".to_string(), "-m".into(), "wip: parser".into()]
        );
    }
}
