//! Concurrency scenarios: a real driver thread with mock collaborators,
//! steered through the control surface.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tether::checkpoint::{
    CheckpointManager, CheckpointReason, CheckpointStore, RollbackGuard,
};
use tether::config::SessionConfig;
use tether::control::{CommandOutcome, ControlSurface};
use tether::error::{RollbackError, TetherError};
use tether::r#loop::{DriverConfig, DriverHandle, LoopDriver, LoopState, SharedLoopState};
use tether::session::{Session, SessionDependencies};
use tether::testing::{
    GitOperations, IterationExecutor, MockCheckpointStore, MockExecutor, MockGitOperations,
};

const BASE_CONTEXT: &str = "Implement the feature.";

struct Harness {
    shared: Arc<SharedLoopState>,
    executor: Arc<MockExecutor>,
    store: Arc<MockCheckpointStore>,
    git: Arc<MockGitOperations>,
    surface: ControlSurface,
}

impl Harness {
    fn new(executor: MockExecutor, git: MockGitOperations) -> Self {
        Self::with_store(executor, git, MockCheckpointStore::new())
    }

    fn with_store(
        executor: MockExecutor,
        git: MockGitOperations,
        store: MockCheckpointStore,
    ) -> Self {
        let shared = Arc::new(SharedLoopState::new(BASE_CONTEXT));
        let executor = Arc::new(executor);
        let store = Arc::new(store);
        let git = Arc::new(git);
        let guard = RollbackGuard::new(
            Arc::clone(&git) as Arc<dyn GitOperations>,
            Arc::clone(&shared),
            Arc::clone(&store) as Arc<dyn CheckpointStore>,
        )
        .with_pause_timeout(Duration::from_secs(5));
        let surface = ControlSurface::new(Arc::clone(&shared), guard);
        Self {
            shared,
            executor,
            store,
            git,
            surface,
        }
    }

    fn start(&self, config: DriverConfig) -> DriverHandle {
        LoopDriver::new(
            Arc::clone(&self.shared),
            Arc::clone(&self.executor) as Arc<dyn IterationExecutor>,
            Arc::clone(&self.store) as Arc<dyn CheckpointStore>,
        )
        .with_config(config)
        .spawn()
        .unwrap()
    }

    fn wait_for_state(&self, state: LoopState) {
        let observed = self
            .shared
            .wait_for(Some(Duration::from_secs(5)), |s| s == state);
        assert_eq!(observed, state);
    }
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        thread::sleep(Duration::from_millis(2));
    }
}

fn no_periodic_checkpoints() -> DriverConfig {
    DriverConfig::new().with_checkpoint_interval(0)
}

#[test]
fn test_add_timeout_scenario_exact_merge_block() {
    let harness = Harness::new(MockExecutor::new(), MockGitOperations::new());
    harness.surface.execute("/inject add timeout").unwrap();

    let handle = harness.start(no_periodic_checkpoints().with_max_iterations(1));
    let report = handle.join().unwrap();
    assert_eq!(report.final_state, LoopState::Completed);

    let contexts = harness.executor.contexts();
    assert_eq!(
        contexts[0],
        "Implement the feature.\n\n## Queued Instructions\n\n### USER_INPUT\n1. add timeout"
    );
    assert!(!contexts[0].contains("### PLAN_UPDATE"));
}

#[test]
fn test_pause_inject_resume_orders_by_priority() {
    let harness = Harness::new(
        MockExecutor::new().with_delay(Duration::from_millis(10)),
        MockGitOperations::new(),
    );
    let handle = harness.start(no_periodic_checkpoints());

    wait_until(|| harness.executor.call_count() >= 1);
    assert_eq!(
        harness.surface.execute("/pause").unwrap(),
        CommandOutcome::PauseRequested
    );
    harness.wait_for_state(LoopState::Paused);
    let calls_at_pause = harness.executor.call_count() as usize;

    harness
        .surface
        .execute("/inject low task --priority low")
        .unwrap();
    harness
        .surface
        .execute("/inject critical task --priority critical")
        .unwrap();
    harness.surface.execute("/inject normal task").unwrap();
    assert_eq!(harness.shared.status().queued_count, 3);

    harness.surface.execute("/resume").unwrap();
    wait_until(|| harness.executor.call_count() as usize > calls_at_pause);
    harness.surface.execute("/cancel").unwrap();
    handle.join().unwrap();

    let context = &harness.executor.contexts()[calls_at_pause];
    assert!(context.ends_with(
        "## Queued Instructions\n\n### USER_INPUT\n1. critical task\n2. normal task\n3. low task"
    ));
}

#[test]
fn test_cancel_while_paused_never_runs_again() {
    let harness = Harness::new(
        MockExecutor::new().with_delay(Duration::from_millis(5)),
        MockGitOperations::new(),
    );
    let handle = harness.start(no_periodic_checkpoints());

    wait_until(|| harness.executor.call_count() >= 1);
    harness.surface.execute("/pause").unwrap();
    harness.wait_for_state(LoopState::Paused);
    let calls_at_pause = harness.executor.call_count();

    // Record every state seen from here on.
    let observer_shared = Arc::clone(&harness.shared);
    let observer = thread::spawn(move || {
        let mut trace = vec![observer_shared.state()];
        while !observer_shared.state().is_terminal() {
            let state = observer_shared.state();
            if trace.last() != Some(&state) {
                trace.push(state);
            }
            thread::sleep(Duration::from_micros(200));
        }
        trace.push(observer_shared.state());
        trace
    });

    let outcome = harness.surface.execute("/cancel").unwrap();
    assert_eq!(
        outcome,
        CommandOutcome::Cancelled {
            state: LoopState::Cancelled,
            checkpointed: true
        }
    );
    let report = handle.join().unwrap();
    let trace = observer.join().unwrap();

    assert_eq!(report.final_state, LoopState::Cancelled);
    assert!(!trace.contains(&LoopState::Running), "trace: {trace:?}");
    assert_eq!(harness.executor.call_count(), calls_at_pause);

    let saved = harness.store.saved();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].reason, CheckpointReason::Cancellation);
    assert_eq!(saved[0].state, LoopState::Paused);
}

#[test]
fn test_cancel_while_paused_reports_failed_checkpoint() {
    let harness = Harness::with_store(
        MockExecutor::new().with_delay(Duration::from_millis(5)),
        MockGitOperations::new(),
        MockCheckpointStore::new().with_save_error("disk full"),
    );
    let handle = harness.start(no_periodic_checkpoints());

    wait_until(|| harness.executor.call_count() >= 1);
    harness.surface.execute("/pause").unwrap();
    harness.wait_for_state(LoopState::Paused);

    let outcome = harness.surface.execute("/cancel").unwrap();
    assert_eq!(
        outcome,
        CommandOutcome::Cancelled {
            state: LoopState::Cancelled,
            checkpointed: false
        }
    );
    assert_eq!(outcome.to_string(), "Cancelled; no checkpoint saved");

    let report = handle.join().unwrap();
    assert_eq!(report.final_state, LoopState::Cancelled);
    assert!(report.cancellation_checkpoint.is_none());
    assert!(report.error.unwrap().contains("disk full"));
    assert!(harness.store.saved().is_empty());
}

#[test]
fn test_background_keeps_loop_iterating() {
    let harness = Harness::new(
        MockExecutor::new().with_delay(Duration::from_millis(5)),
        MockGitOperations::new(),
    );
    let handle = harness.start(no_periodic_checkpoints());

    wait_until(|| harness.executor.call_count() >= 1);
    assert_eq!(
        harness.surface.execute("/background").unwrap(),
        CommandOutcome::Detach
    );

    // The console lets go; the loop itself is untouched until the handoff.
    let calls_at_detach = harness.executor.call_count();
    wait_until(|| harness.executor.call_count() >= calls_at_detach + 3);
    assert_eq!(harness.shared.state(), LoopState::Running);
    assert!(harness.store.saved().is_empty());

    harness.surface.execute("/cancel").unwrap();
    let report = handle.join().unwrap();
    assert_eq!(report.final_state, LoopState::Cancelled);
    assert!(report.iterations >= calls_at_detach + 3);
}

#[test]
fn test_cancel_running_checkpoints_last_completed_iteration() {
    let harness = Harness::new(
        MockExecutor::new().with_delay(Duration::from_millis(15)),
        MockGitOperations::new(),
    );
    let handle = harness.start(DriverConfig::new().with_checkpoint_interval(100));

    wait_until(|| harness.executor.call_count() >= 3);
    let outcome = harness.surface.execute("/cancel").unwrap();
    assert!(matches!(
        outcome,
        CommandOutcome::Cancelled {
            state: LoopState::Cancelled,
            checkpointed: true
        }
    ));

    let report = handle.join().unwrap();
    let cancellations: Vec<_> = harness
        .store
        .saved()
        .into_iter()
        .filter(|cp| cp.reason == CheckpointReason::Cancellation)
        .collect();
    assert_eq!(cancellations.len(), 1);
    assert_eq!(cancellations[0].iteration, report.iterations);
    assert_eq!(report.iterations, harness.executor.call_count());
}

#[test]
fn test_commands_after_termination_are_rejected() {
    let harness = Harness::new(MockExecutor::new(), MockGitOperations::new());
    harness
        .start(no_periodic_checkpoints().with_max_iterations(1))
        .join()
        .unwrap();

    assert!(matches!(
        harness.surface.execute("/cancel"),
        Err(TetherError::Precondition { .. })
    ));
    assert!(matches!(
        harness.surface.execute("/pause"),
        Err(TetherError::Precondition { .. })
    ));
    match harness.surface.execute("/status").unwrap() {
        CommandOutcome::Status(status) => assert_eq!(status.state, LoopState::Completed),
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[test]
fn test_rollback_on_default_branch_never_resets() {
    let harness = Harness::new(
        MockExecutor::new().with_delay(Duration::from_millis(5)),
        MockGitOperations::new().with_commits_since(10),
    );
    let handle = harness.start(no_periodic_checkpoints());
    wait_until(|| harness.executor.call_count() >= 1);

    let err = harness.surface.execute("/rollback 2").unwrap_err();
    assert!(matches!(
        err,
        TetherError::Rollback(RollbackError::UnsafeBranch { .. })
    ));
    assert!(harness.git.resets().is_empty());
    // Refusal leaves the loop running.
    assert_eq!(harness.shared.state(), LoopState::Running);

    harness.surface.execute("/cancel").unwrap();
    handle.join().unwrap();
}

#[test]
fn test_rollback_pauses_running_loop_on_feature_branch() {
    let harness = Harness::new(
        MockExecutor::new().with_delay(Duration::from_millis(5)),
        MockGitOperations::new()
            .with_branch("feature/timeouts")
            .with_commits_since(3),
    );
    let handle = harness.start(no_periodic_checkpoints());
    wait_until(|| harness.executor.call_count() >= 1);

    match harness.surface.execute("/rollback 2").unwrap() {
        CommandOutcome::RolledBack(outcome) => {
            assert!(outcome.paused_by_guard);
            assert_eq!(outcome.commits_discarded, 2);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(harness.git.resets(), vec![2]);
    assert_eq!(harness.shared.state(), LoopState::Paused);
    assert!(harness
        .store
        .saved()
        .iter()
        .any(|cp| cp.reason == CheckpointReason::Rollback));

    // The operator confirms before work continues.
    let calls = harness.executor.call_count();
    harness.surface.execute("/resume").unwrap();
    wait_until(|| harness.executor.call_count() > calls);

    harness.surface.execute("/cancel").unwrap();
    handle.join().unwrap();
}

#[test]
fn test_resume_from_cancellation_checkpoint() {
    let temp = TempDir::new().unwrap();
    let manager: Arc<dyn CheckpointStore> =
        Arc::new(CheckpointManager::new(SessionConfig::checkpoints_dir(temp.path())).unwrap());

    // First run: two iterations, then pause, queue a note and cancel.
    let first_executor = Arc::new(MockExecutor::new().with_delay(Duration::from_millis(5)));
    let first = Session::new(
        temp.path(),
        SessionConfig::default().with_checkpoint_interval(0),
        BASE_CONTEXT,
        SessionDependencies {
            executor: Arc::clone(&first_executor) as Arc<dyn IterationExecutor>,
            git: Arc::new(MockGitOperations::new()),
            checkpoints: Arc::clone(&manager),
        },
    );
    let surface = first.control_surface();
    let handle = first.start().unwrap();
    wait_until(|| first_executor.call_count() >= 2);
    surface.execute("/pause").unwrap();
    first
        .shared()
        .wait_for(Some(Duration::from_secs(5)), |s| s == LoopState::Paused);
    surface.execute("/merge use exponential backoff").unwrap();
    surface.execute("/cancel").unwrap();
    let report = handle.join().unwrap();

    let checkpoint = manager.load().unwrap().expect("cancellation checkpoint");
    assert_eq!(checkpoint.reason, CheckpointReason::Cancellation);
    assert_eq!(checkpoint.iteration, report.iterations);
    assert_eq!(checkpoint.pending.len(), 1);

    // Second run picks up where the first left off.
    let second_executor = Arc::new(MockExecutor::new());
    let second = Session::from_checkpoint(
        temp.path(),
        SessionConfig::default()
            .with_checkpoint_interval(0)
            .with_max_iterations(report.iterations + 1),
        checkpoint,
        SessionDependencies {
            executor: Arc::clone(&second_executor) as Arc<dyn IterationExecutor>,
            git: Arc::new(MockGitOperations::new()),
            checkpoints: Arc::clone(&manager),
        },
    )
    .unwrap();
    let report2 = second.start().unwrap().join().unwrap();

    assert_eq!(report2.final_state, LoopState::Completed);
    assert_eq!(report2.iterations, report.iterations + 1);
    let contexts = second_executor.contexts();
    assert_eq!(contexts.len(), 1);
    assert!(contexts[0].starts_with(BASE_CONTEXT));
    assert!(contexts[0].ends_with("### PLAN_UPDATE\n1. use exponential backoff"));
}
