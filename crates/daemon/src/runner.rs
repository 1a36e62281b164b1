//! Test runner
//!
//! The runner is the single owner of harness state. It runs as one task that
//! drains a command queue, so every mutation happens on that task and no
//! locking is needed. Clients reach it through [`RunnerHandle`] or, for
//! remote connections, through a [`HarnessBinding`].
//!
//! ```text
//!   start(test)          Run (deferred)            completion / engine lost
//! Idle ──────────► Scheduled ──────────────► Running ─────────────────────────► Idle
//! ```

use crate::bindings::{BindingId, BindingSet, HarnessBinding};
use crate::engine::{EngineConnection, EngineHost, RunContext};
use crate::report::{completion_report, engine_failure_report, FinishedRun};
use crate::view::{ViewFactory, ViewHost};
use bytes::Bytes;
use sky_harness_common::{
    DispatchOutcome, Error, InputEvent, Result, RunId, RunPhase, RunReport, RunnerStatus,
    SingleTest, Verdict,
};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Report subscribers that fall further behind than this lose reports
const REPORT_BUFFER: usize = 64;

/// Commands processed by the runner task
pub(crate) enum RunnerCommand {
    Bind {
        peer: String,
        reply: oneshot::Sender<BindingId>,
    },
    Unbind {
        id: BindingId,
    },
    SetPackageRoot {
        root: String,
    },
    Start {
        test: Option<SingleTest>,
        reply: oneshot::Sender<Result<RunPhase>>,
    },
    /// Deferred run start, posted by the runner to itself
    Run,
    TestComplete {
        result_text: String,
        pixels: Vec<u8>,
        reply: oneshot::Sender<Result<RunReport>>,
    },
    DispatchInput {
        event: InputEvent,
        reply: oneshot::Sender<Result<DispatchOutcome>>,
    },
    EngineLost {
        run_id: RunId,
        reason: String,
    },
    Status {
        reply: oneshot::Sender<RunnerStatus>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Run state. The test, view host and engine connection only exist together.
enum RunState {
    Idle,
    Scheduled { test: SingleTest },
    Running(ActiveRun),
}

struct ActiveRun {
    id: RunId,
    test: SingleTest,
    view: Box<dyn ViewHost>,
    engine: Box<dyn EngineConnection>,
    cancel: CancellationToken,
}

/// The harness state owner
pub struct TestRunner {
    package_root: String,
    state: RunState,
    bindings: BindingSet,
    last_run_id: RunId,
    views: Arc<dyn ViewFactory>,
    engines: Arc<dyn EngineHost>,
    reports: broadcast::Sender<FinishedRun>,
    commands: mpsc::UnboundedReceiver<RunnerCommand>,
    /// Weak so that the queue closes once every external handle is gone
    queue: mpsc::WeakUnboundedSender<RunnerCommand>,
}

impl TestRunner {
    /// Create a runner and the handle used to reach it
    pub fn new(views: Arc<dyn ViewFactory>, engines: Arc<dyn EngineHost>) -> (Self, RunnerHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (reports, _) = broadcast::channel(REPORT_BUFFER);

        let runner = Self {
            package_root: String::new(),
            state: RunState::Idle,
            bindings: BindingSet::new(),
            last_run_id: 0,
            views,
            engines,
            reports: reports.clone(),
            commands: rx,
            queue: tx.downgrade(),
        };

        (runner, RunnerHandle { tx, reports })
    }

    /// Process commands until shutdown or until every handle is dropped.
    ///
    /// Returns an error only when releasing an engine or view host fails.
    pub async fn run(mut self) -> Result<()> {
        info!("Test runner started");

        loop {
            let Some(command) = self.commands.recv().await else {
                debug!("All runner handles dropped");
                break;
            };

            match command {
                RunnerCommand::Bind { peer, reply } => {
                    let id = self.bindings.insert(peer);
                    debug!("Binding {} attached ({} active)", id, self.bindings.len());
                    let _ = reply.send(id);
                }
                RunnerCommand::Unbind { id } => {
                    if let Some(info) = self.bindings.remove(&id) {
                        debug!(
                            "Binding {} ({}) detached ({} active)",
                            id,
                            info.peer,
                            self.bindings.len()
                        );
                    }
                }
                RunnerCommand::SetPackageRoot { root } => {
                    debug!("Package root set to {}", root);
                    self.package_root = root;
                }
                RunnerCommand::Start { test, reply } => {
                    let _ = reply.send(self.handle_start(test));
                }
                RunnerCommand::Run => {
                    self.handle_run().await?;
                }
                RunnerCommand::TestComplete {
                    result_text,
                    pixels,
                    reply,
                } => {
                    let (result, fatal) = split_fatal(self.handle_complete(result_text, pixels).await);
                    let _ = reply.send(result);
                    if let Some(e) = fatal {
                        return Err(e);
                    }
                }
                RunnerCommand::DispatchInput { event, reply } => {
                    let (result, fatal) = split_fatal(self.handle_input(event).await);
                    let _ = reply.send(result);
                    if let Some(e) = fatal {
                        return Err(e);
                    }
                }
                RunnerCommand::EngineLost { run_id, reason } => {
                    self.handle_engine_lost(run_id, reason).await?;
                }
                RunnerCommand::Status { reply } => {
                    let _ = reply.send(self.status());
                }
                RunnerCommand::Shutdown { reply } => {
                    self.shutdown().await?;
                    let _ = reply.send(());
                    return Ok(());
                }
            }
        }

        self.shutdown().await
    }

    fn status(&self) -> RunnerStatus {
        let (state, test, run_id) = match &self.state {
            RunState::Idle => (RunPhase::Idle, None, None),
            RunState::Scheduled { test } => (RunPhase::Scheduled, Some(test.clone()), None),
            RunState::Running(run) => (RunPhase::Running, Some(run.test.clone()), Some(run.id)),
        };

        RunnerStatus {
            state,
            test,
            run_id,
            package_root: self.package_root.clone(),
            bindings: self.bindings.len(),
        }
    }

    fn handle_start(&mut self, test: Option<SingleTest>) -> Result<RunPhase> {
        let active = match &self.state {
            RunState::Idle => None,
            RunState::Scheduled { test } => Some(("scheduled", test)),
            RunState::Running(run) => Some(("running", &run.test)),
        };
        if let Some((phase, current)) = active {
            let err = Error::Logic(format!("start called while {} is {}", current.path, phase));
            error!("{}", err);
            return Err(err);
        }

        let Some(test) = test else {
            info!("Runner started without a test; waiting for remote start");
            return Ok(RunPhase::Idle);
        };
        test.validate()?;

        info!("Scheduling test {}", test);
        self.state = RunState::Scheduled { test };
        self.schedule(RunnerCommand::Run);
        Ok(RunPhase::Scheduled)
    }

    /// Post a command to the back of our own queue
    fn schedule(&self, command: RunnerCommand) {
        match self.queue.upgrade() {
            Some(tx) => {
                let _ = tx.send(command);
            }
            None => debug!("Runner queue closed, dropping deferred command"),
        }
    }

    async fn handle_run(&mut self) -> Result<()> {
        let test = match std::mem::replace(&mut self.state, RunState::Idle) {
            RunState::Scheduled { test } => test,
            other => {
                self.state = other;
                debug!("Stale run task ignored");
                return Ok(());
            }
        };

        self.last_run_id += 1;
        let run_id = self.last_run_id;
        let cancel = CancellationToken::new();

        let ctx = RunContext::new(run_id, cancel.clone(), self.queue.clone());
        let launched = launch(
            self.views.as_ref(),
            self.engines.as_ref(),
            &test,
            &self.package_root,
            ctx,
        )
        .await;

        match launched {
            Ok((view, engine)) => {
                info!("Run {} started: {} (root {:?})", run_id, test, self.package_root);
                self.state = RunState::Running(ActiveRun {
                    id: run_id,
                    test,
                    view,
                    engine,
                    cancel,
                });
                Ok(())
            }
            Err(Error::Teardown(msg)) => Err(Error::Teardown(msg)),
            Err(e) => {
                cancel.cancel();
                error!("Run {} failed to start {}: {}", run_id, test, e);
                self.publish(engine_failure_report(run_id, test, e.to_string()));
                Ok(())
            }
        }
    }

    async fn handle_complete(&mut self, result_text: String, pixels: Vec<u8>) -> Result<RunReport> {
        let run = match std::mem::replace(&mut self.state, RunState::Idle) {
            RunState::Running(run) => run,
            other => {
                self.state = other;
                let err = Error::Logic("test completion received with no test running".to_string());
                error!("{}", err);
                return Err(err);
            }
        };

        let finished = completion_report(run.id, run.test.clone(), result_text, Bytes::from(pixels));
        match &finished.report.verdict {
            Verdict::Inconsistent { reason } => {
                warn!("Run {} ({}) finished inconsistently: {}", run.id, run.test, reason)
            }
            _ => info!("Run {} ({}) completed", run.id, run.test),
        }

        teardown(run).await?;

        let report = finished.report.clone();
        self.publish(finished);
        Ok(report)
    }

    async fn handle_input(&mut self, event: InputEvent) -> Result<DispatchOutcome> {
        let RunState::Running(run) = &mut self.state else {
            debug!(
                "Dropping input event {:?}: no engine connection",
                event.kind().unwrap_or("unknown")
            );
            return Ok(DispatchOutcome::Ignored);
        };

        let forwarded = run.engine.forward_input_event(&event).await;
        match forwarded {
            Ok(()) => Ok(DispatchOutcome::Forwarded),
            Err(e) => {
                let reason = format!("input forwarding failed: {}", e);
                self.fail_run(reason).await?;
                Err(e)
            }
        }
    }

    async fn handle_engine_lost(&mut self, run_id: RunId, reason: String) -> Result<()> {
        let current = matches!(&self.state, RunState::Running(run) if run.id == run_id);
        if !current {
            debug!("Ignoring engine notification for finished run {}", run_id);
            return Ok(());
        }
        self.fail_run(reason).await
    }

    /// End the active run without a completion
    async fn fail_run(&mut self, reason: String) -> Result<()> {
        let RunState::Running(run) = std::mem::replace(&mut self.state, RunState::Idle) else {
            return Ok(());
        };

        warn!("Run {} ({}) lost its engine: {}", run.id, run.test, reason);
        let finished = engine_failure_report(run.id, run.test.clone(), reason);
        teardown(run).await?;
        self.publish(finished);
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.state, RunState::Idle) {
            RunState::Running(run) => {
                info!("Releasing run {} ({}) at shutdown", run.id, run.test);
                teardown(run).await?;
            }
            RunState::Scheduled { test } => {
                info!("Dropping scheduled test {} at shutdown", test);
            }
            RunState::Idle => {}
        }

        info!("Test runner stopped");
        Ok(())
    }

    fn publish(&self, finished: FinishedRun) {
        // No subscribers is fine; the report is still logged.
        let _ = self.reports.send(finished);
    }
}

/// Create the view host and engine and load the test.
///
/// Must not borrow the runner: `TestRunner` is not `Sync`.
async fn launch(
    views: &dyn ViewFactory,
    engines: &dyn EngineHost,
    test: &SingleTest,
    package_root: &str,
    ctx: RunContext,
) -> Result<(Box<dyn ViewHost>, Box<dyn EngineConnection>)> {
    let view = views.create().await?;

    let mut engine = match engines.connect(view.surface(), ctx).await {
        Ok(engine) => engine,
        Err(e) => {
            release(view, None).await?;
            return Err(e);
        }
    };

    if let Err(e) = engine.load(&test.path, package_root).await {
        release(view, Some(engine)).await?;
        return Err(e);
    }

    Ok((view, engine))
}

/// Cancel engine notifications, then release the engine and view host
async fn teardown(run: ActiveRun) -> Result<()> {
    run.cancel.cancel();
    release(run.view, Some(run.engine)).await?;
    debug!("Run {} resources released", run.id);
    Ok(())
}

async fn release(view: Box<dyn ViewHost>, engine: Option<Box<dyn EngineConnection>>) -> Result<()> {
    if let Some(mut engine) = engine {
        engine
            .close()
            .await
            .map_err(|e| Error::Teardown(format!("engine: {}", e)))?;
    }
    view.destroy()
        .await
        .map_err(|e| Error::Teardown(format!("view host: {}", e)))
}

/// Separate a teardown failure, which must also stop the runner
fn split_fatal<T>(result: Result<T>) -> (Result<T>, Option<Error>) {
    match result {
        Err(Error::Teardown(msg)) => (Err(Error::Teardown(msg.clone())), Some(Error::Teardown(msg))),
        other => (other, None),
    }
}

/// Cloneable handle to the runner; also the connection factory
#[derive(Clone)]
pub struct RunnerHandle {
    tx: mpsc::UnboundedSender<RunnerCommand>,
    reports: broadcast::Sender<FinishedRun>,
}

impl RunnerHandle {
    pub(crate) fn send(&self, command: RunnerCommand) {
        let _ = self.tx.send(command);
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> RunnerCommand) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(command(reply)).map_err(|_| Error::ChannelClosed)?;
        rx.await.map_err(|_| Error::ChannelClosed)
    }

    /// Attach a new client connection
    pub async fn create(&self, peer: impl Into<String>) -> Result<HarnessBinding> {
        let peer = peer.into();
        let id = self.request(|reply| RunnerCommand::Bind { peer, reply }).await?;
        Ok(HarnessBinding::new(id, self.clone()))
    }

    pub fn set_package_root(&self, root: impl Into<String>) -> Result<()> {
        self.tx
            .send(RunnerCommand::SetPackageRoot { root: root.into() })
            .map_err(|_| Error::ChannelClosed)
    }

    /// Accept a test and schedule its run. Returns before the run begins.
    pub async fn start(&self, test: Option<SingleTest>) -> Result<RunPhase> {
        self.request(|reply| RunnerCommand::Start { test, reply }).await?
    }

    pub(crate) async fn on_test_complete(&self, result_text: String, pixels: Vec<u8>) -> Result<RunReport> {
        self.request(|reply| RunnerCommand::TestComplete {
            result_text,
            pixels,
            reply,
        })
        .await?
    }

    pub(crate) async fn dispatch_input_event(&self, event: InputEvent) -> Result<DispatchOutcome> {
        self.request(|reply| RunnerCommand::DispatchInput { event, reply })
            .await?
    }

    pub async fn status(&self) -> Result<RunnerStatus> {
        self.request(|reply| RunnerCommand::Status { reply }).await
    }

    /// Receive every finished run from now on
    pub fn subscribe(&self) -> broadcast::Receiver<FinishedRun> {
        self.reports.subscribe()
    }

    /// Release any active run and stop the runner
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| RunnerCommand::Shutdown { reply }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{EngineCall, FakeEngineHost, FakeViewFactory};
    use tokio::task::JoinHandle;

    struct Harness {
        handle: RunnerHandle,
        engines: FakeEngineHost,
        views: FakeViewFactory,
        task: JoinHandle<Result<()>>,
    }

    fn harness() -> Harness {
        let engines = FakeEngineHost::new();
        let views = FakeViewFactory::new();
        let (runner, handle) = TestRunner::new(Arc::new(views.clone()), Arc::new(engines.clone()));
        let task = tokio::spawn(runner.run());
        Harness {
            handle,
            engines,
            views,
            task,
        }
    }

    #[tokio::test]
    async fn test_text_run_scenario() {
        let h = harness();
        let driver = h.handle.create("driver").await.unwrap();
        let mut reports = h.handle.subscribe();

        driver.set_package_root("/assets").unwrap();
        let phase = driver.start(Some(SingleTest::new("a.test"))).await.unwrap();
        assert_eq!(phase, RunPhase::Scheduled);

        let status = driver.status().await.unwrap();
        assert_eq!(status.state, RunPhase::Running);
        assert_eq!(status.test, Some(SingleTest::new("a.test")));
        assert!(h.engines.calls().contains(&EngineCall::Load {
            path: "a.test".to_string(),
            package_root: "/assets".to_string(),
        }));
        assert_eq!(h.views.live_surfaces(), 1);

        let report = driver.on_test_complete("PASS".to_string(), Vec::new()).await.unwrap();
        assert_eq!(report.result_text, "PASS");
        assert!(report.is_success());

        let published = reports.recv().await.unwrap();
        assert_eq!(published.report, report);

        let status = driver.status().await.unwrap();
        assert_eq!(status.state, RunPhase::Idle);
        assert!(status.test.is_none());
        assert!(status.run_id.is_none());
        assert_eq!(h.views.live_surfaces(), 0);
        assert_eq!(h.engines.live_connections(), 0);

        h.handle.shutdown().await.unwrap();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let h = harness();

        h.handle.start(Some(SingleTest::new("a.test"))).await.unwrap();
        let err = h.handle.start(Some(SingleTest::new("c.test"))).await.unwrap_err();
        assert!(err.is_logic_error());

        let status = h.handle.status().await.unwrap();
        assert_eq!(status.state, RunPhase::Running);
        assert_eq!(status.test.unwrap().path, "a.test");
        assert_eq!(h.engines.connect_count(), 1);
        assert_eq!(h.views.live_surfaces(), 1);
    }

    #[tokio::test]
    async fn test_start_while_scheduled_is_rejected() {
        let h = harness();
        let binding = h.handle.create("driver").await.unwrap();

        // Both starts are queued before the deferred run executes.
        let first = h.handle.start(Some(SingleTest::new("a.test")));
        let second = binding.start(Some(SingleTest::new("c.test")));
        let (first, second) = tokio::join!(first, second);

        assert_eq!(first.unwrap(), RunPhase::Scheduled);
        assert!(second.unwrap_err().is_logic_error());

        let status = h.handle.status().await.unwrap();
        assert_eq!(status.test.unwrap().path, "a.test");
        assert_eq!(h.engines.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_completion_allows_next_start() {
        let h = harness();
        let engine = h.handle.create("engine").await.unwrap();

        h.handle.start(Some(SingleTest::new("a.test"))).await.unwrap();
        engine.on_test_complete("PASS".to_string(), Vec::new()).await.unwrap();

        let phase = h.handle.start(Some(SingleTest::new("b.test"))).await.unwrap();
        assert_eq!(phase, RunPhase::Scheduled);

        let status = h.handle.status().await.unwrap();
        assert_eq!(status.state, RunPhase::Running);
        assert_eq!(status.run_id, Some(2));
    }

    #[test]
    fn test_runner_future_is_send() {
        fn assert_send<T: Send>(_: &T) {}

        let (runner, _handle) = TestRunner::new(
            Arc::new(FakeViewFactory::new()),
            Arc::new(FakeEngineHost::new()),
        );
        let run = runner.run();
        assert_send(&run);
    }

    #[tokio::test]
    async fn test_package_root_change_applies_to_later_runs() {
        let h = harness();

        h.handle.set_package_root("/a").unwrap();
        h.handle.start(Some(SingleTest::new("a.test"))).await.unwrap();
        h.handle.set_package_root("/b").unwrap();

        let status = h.handle.status().await.unwrap();
        assert_eq!(status.state, RunPhase::Running);
        assert_eq!(status.package_root, "/b");

        h.handle.on_test_complete("PASS".to_string(), Vec::new()).await.unwrap();
        h.handle.start(Some(SingleTest::new("c.test"))).await.unwrap();
        h.handle.status().await.unwrap();

        let loads: Vec<EngineCall> = h
            .engines
            .calls()
            .into_iter()
            .filter(|call| matches!(call, EngineCall::Load { .. }))
            .collect();
        assert_eq!(
            loads,
            vec![
                EngineCall::Load {
                    path: "a.test".to_string(),
                    package_root: "/a".to_string(),
                },
                EngineCall::Load {
                    path: "c.test".to_string(),
                    package_root: "/b".to_string(),
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_snapshot_without_pixels_is_inconsistent() {
        let h = harness();
        let engine = h.handle.create("engine").await.unwrap();

        h.handle.start(Some(SingleTest::snapshot("b.test"))).await.unwrap();
        let report = engine.on_test_complete("PASS".to_string(), Vec::new()).await.unwrap();

        assert!(matches!(report.verdict, Verdict::Inconsistent { .. }));
        assert_eq!(h.handle.status().await.unwrap().state, RunPhase::Idle);
        assert_eq!(h.views.live_surfaces(), 0);
    }

    #[tokio::test]
    async fn test_pixels_for_text_test_are_inconsistent() {
        let h = harness();
        let engine = h.handle.create("engine").await.unwrap();

        h.handle.start(Some(SingleTest::new("a.test"))).await.unwrap();
        let report = engine.on_test_complete("PASS".to_string(), vec![1, 2, 3, 4]).await.unwrap();

        assert!(matches!(report.verdict, Verdict::Inconsistent { .. }));
        assert_eq!(report.pixels_len, 4);
        assert_eq!(h.handle.status().await.unwrap().state, RunPhase::Idle);
    }

    #[tokio::test]
    async fn test_snapshot_with_pixels_passes() {
        let h = harness();
        let engine = h.handle.create("engine").await.unwrap();

        h.handle.start(Some(SingleTest::snapshot("b.test"))).await.unwrap();
        let report = engine.on_test_complete("PASS".to_string(), vec![255; 16]).await.unwrap();

        assert!(report.is_success());
        assert!(report.pixels_sha256.is_some());
    }

    #[tokio::test]
    async fn test_orphan_calls_leave_state_unchanged() {
        let h = harness();
        let binding = h.handle.create("engine").await.unwrap();
        h.handle.set_package_root("/assets").unwrap();
        let before = h.handle.status().await.unwrap();

        let err = binding.on_test_complete("PASS".to_string(), Vec::new()).await.unwrap_err();
        assert!(err.is_logic_error());

        let outcome = binding
            .dispatch_input_event(InputEvent(serde_json::json!({"type": "pointer_down"})))
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Ignored);

        assert_eq!(h.handle.status().await.unwrap(), before);
        assert!(h.engines.calls().is_empty());
    }

    #[tokio::test]
    async fn test_input_is_forwarded_in_order() {
        let h = harness();
        let driver = h.handle.create("driver").await.unwrap();

        driver.start(Some(SingleTest::new("a.test"))).await.unwrap();
        for x in 0..3 {
            let event = InputEvent(serde_json::json!({"type": "pointer_move", "x": x}));
            let outcome = driver.dispatch_input_event(event).await.unwrap();
            assert_eq!(outcome, DispatchOutcome::Forwarded);
        }

        let inputs: Vec<i64> = h
            .engines
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                EngineCall::Input(event) => event.0["x"].as_i64(),
                _ => None,
            })
            .collect();
        assert_eq!(inputs, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_failed_forwarding_ends_run() {
        let h = harness();
        let driver = h.handle.create("driver").await.unwrap();
        let mut reports = h.handle.subscribe();

        driver.start(Some(SingleTest::new("a.test"))).await.unwrap();
        h.engines.fail_forwarding();

        let err = driver
            .dispatch_input_event(InputEvent(serde_json::json!({"type": "key_down"})))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Engine(_)));

        let finished = reports.recv().await.unwrap();
        assert!(matches!(finished.report.verdict, Verdict::EngineFailed { .. }));
        assert_eq!(driver.status().await.unwrap().state, RunPhase::Idle);
        assert_eq!(h.views.live_surfaces(), 0);
    }

    #[tokio::test]
    async fn test_engine_crash_ends_run() {
        let h = harness();
        let mut reports = h.handle.subscribe();

        h.handle.start(Some(SingleTest::new("a.test"))).await.unwrap();
        assert_eq!(h.handle.status().await.unwrap().state, RunPhase::Running);

        assert!(h.engines.crash_latest("engine exited with signal 11"));
        let finished = reports.recv().await.unwrap();
        assert_eq!(
            finished.report.verdict,
            Verdict::EngineFailed {
                reason: "engine exited with signal 11".to_string()
            }
        );

        let status = h.handle.status().await.unwrap();
        assert_eq!(status.state, RunPhase::Idle);
        assert_eq!(h.engines.live_connections(), 0);

        // The torn-down run's context no longer reaches the runner.
        assert!(!h.engines.crash_latest("late exit"));
    }

    #[tokio::test]
    async fn test_stale_engine_notification_is_ignored() {
        let h = harness();
        let engine = h.handle.create("engine").await.unwrap();

        h.handle.start(Some(SingleTest::new("a.test"))).await.unwrap();
        let first = h.engines.latest_context().unwrap();
        engine.on_test_complete("PASS".to_string(), Vec::new()).await.unwrap();

        h.handle.start(Some(SingleTest::new("b.test"))).await.unwrap();

        // Bypass the cancellation check to exercise the run id guard.
        h.handle.send(RunnerCommand::EngineLost {
            run_id: first.run_id(),
            reason: "late exit".to_string(),
        });

        let status = h.handle.status().await.unwrap();
        assert_eq!(status.state, RunPhase::Running);
        assert_eq!(status.test.unwrap().path, "b.test");
    }

    #[tokio::test]
    async fn test_connect_failure_reports_and_idles() {
        let h = harness();
        let mut reports = h.handle.subscribe();
        h.engines.fail_next_connect();

        let phase = h.handle.start(Some(SingleTest::new("a.test"))).await.unwrap();
        assert_eq!(phase, RunPhase::Scheduled);

        let finished = reports.recv().await.unwrap();
        assert!(matches!(finished.report.verdict, Verdict::EngineFailed { .. }));
        assert_eq!(h.handle.status().await.unwrap().state, RunPhase::Idle);
        assert_eq!(h.views.live_surfaces(), 0);
    }

    #[tokio::test]
    async fn test_load_failure_releases_engine() {
        let h = harness();
        let mut reports = h.handle.subscribe();
        h.engines.fail_next_load();

        h.handle.start(Some(SingleTest::new("a.test"))).await.unwrap();

        let finished = reports.recv().await.unwrap();
        assert!(matches!(finished.report.verdict, Verdict::EngineFailed { .. }));
        assert_eq!(h.engines.live_connections(), 0);
        assert_eq!(h.views.live_surfaces(), 0);
    }

    #[tokio::test]
    async fn test_start_without_test_stays_idle() {
        let h = harness();

        let phase = h.handle.start(None).await.unwrap();
        assert_eq!(phase, RunPhase::Idle);
        assert_eq!(h.handle.status().await.unwrap().state, RunPhase::Idle);
        assert_eq!(h.engines.connect_count(), 0);

        let phase = h.handle.start(Some(SingleTest::new("a.test"))).await.unwrap();
        assert_eq!(phase, RunPhase::Scheduled);
    }

    #[tokio::test]
    async fn test_empty_path_is_rejected() {
        let h = harness();

        let err = h.handle.start(Some(SingleTest::new(""))).await.unwrap_err();
        assert!(matches!(err, Error::InvalidTest(_)));
        assert_eq!(h.handle.status().await.unwrap().state, RunPhase::Idle);
    }

    #[tokio::test]
    async fn test_bindings_share_one_runner() {
        let h = harness();
        let driver = h.handle.create("driver").await.unwrap();
        let engine = h.handle.create("engine").await.unwrap();
        assert_ne!(driver.id(), engine.id());

        driver.start(Some(SingleTest::snapshot("b.test"))).await.unwrap();

        let seen_by_driver = driver.status().await.unwrap();
        let seen_by_engine = engine.status().await.unwrap();
        assert_eq!(seen_by_driver, seen_by_engine);
        assert_eq!(seen_by_engine.bindings, 2);

        drop(driver);
        let status = engine.status().await.unwrap();
        assert_eq!(status.bindings, 1);
        assert_eq!(status.state, RunPhase::Running);

        engine.on_test_complete("PASS".to_string(), vec![0; 4]).await.unwrap();
        assert_eq!(engine.status().await.unwrap().state, RunPhase::Idle);
    }

    #[tokio::test]
    async fn test_shutdown_releases_active_run() {
        let h = harness();

        h.handle.start(Some(SingleTest::new("a.test"))).await.unwrap();
        assert_eq!(h.views.live_surfaces(), 1);

        h.handle.shutdown().await.unwrap();
        h.task.await.unwrap().unwrap();

        assert_eq!(h.views.live_surfaces(), 0);
        assert_eq!(h.engines.live_connections(), 0);
        assert!(matches!(h.handle.status().await, Err(Error::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_dropping_handles_releases_active_run() {
        let h = harness();

        h.handle.start(Some(SingleTest::new("a.test"))).await.unwrap();
        let Harness {
            handle,
            engines,
            views,
            task,
        } = h;
        drop(handle);

        task.await.unwrap().unwrap();
        assert_eq!(views.live_surfaces(), 0);
        assert_eq!(engines.live_connections(), 0);
    }

    #[tokio::test]
    async fn test_teardown_failure_is_fatal() {
        let h = harness();
        let engine = h.handle.create("engine").await.unwrap();

        h.handle.start(Some(SingleTest::new("a.test"))).await.unwrap();
        h.engines.fail_close();

        let err = engine.on_test_complete("PASS".to_string(), Vec::new()).await.unwrap_err();
        assert!(matches!(err, Error::Teardown(_)));

        let result = h.task.await.unwrap();
        assert!(matches!(result, Err(Error::Teardown(_))));
    }
}
