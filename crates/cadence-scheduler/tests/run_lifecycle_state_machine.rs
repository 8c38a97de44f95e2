//! Stateful property testing for the run lifecycle.
//!
//! Drives a runner through random sequences of starts, backend completions,
//! reconciliations, and cancellations, and checks that no task ever has more
//! than one pending or running run.

mod common;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use proptest::prelude::*;
use proptest_state_machine::{ReferenceStateMachine, StateMachineTest, prop_state_machine};
use tokio::runtime::Runtime;

use cadence_scheduler::{
    ExecutionState, InMemoryStorage, RunQuery, Runner, Storage, Task,
};
use common::{ScriptedBackend, no_environments};

const TASKS: [&str; 3] = ["alpha", "beta", "gamma"];

/// Operations applied to the runner.
#[derive(Debug, Clone)]
pub enum LifecycleOperation {
    /// Ask the runner to start a task.
    Start { task: String },
    /// The backend finishes the task's active execution.
    Finish { task: String, with_error: bool },
    /// Reconcile running runs.
    Reconcile,
    /// Administratively cancel the task's active run.
    Cancel { task: String },
    /// Make the backend refuse or accept placements.
    SetRefusing(bool),
}

/// Reference model of which tasks have an active run.
#[derive(Clone, Debug, Default)]
pub struct LifecycleModel {
    /// Tasks with a pending or running run.
    pub active: HashSet<String>,
    /// Active tasks whose execution the backend reports as stopped.
    pub stopped: HashSet<String>,
    /// Runs created per task, including cancelled ones.
    pub runs: HashMap<String, usize>,
    pub refusing: bool,
}

impl ReferenceStateMachine for LifecycleModel {
    type State = Self;
    type Transition = LifecycleOperation;

    fn init_state() -> BoxedStrategy<Self::State> {
        Just(Self::default()).boxed()
    }

    fn transitions(_state: &Self::State) -> BoxedStrategy<Self::Transition> {
        let task = proptest::sample::select(TASKS.to_vec()).prop_map(str::to_string);

        prop_oneof![
            4 => task.clone().prop_map(|task| LifecycleOperation::Start { task }),
            2 => (task.clone(), any::<bool>())
                .prop_map(|(task, with_error)| LifecycleOperation::Finish { task, with_error }),
            2 => Just(LifecycleOperation::Reconcile),
            1 => task.prop_map(|task| LifecycleOperation::Cancel { task }),
            1 => any::<bool>().prop_map(LifecycleOperation::SetRefusing),
        ]
        .boxed()
    }

    fn apply(mut state: Self::State, transition: &Self::Transition) -> Self::State {
        match transition {
            LifecycleOperation::Start { task } => {
                if !state.active.contains(task) {
                    *state.runs.entry(task.clone()).or_default() += 1;
                    if !state.refusing {
                        state.active.insert(task.clone());
                    }
                }
            }
            LifecycleOperation::Finish { task, .. } => {
                if state.active.contains(task) {
                    state.stopped.insert(task.clone());
                }
            }
            LifecycleOperation::Reconcile => {
                for task in state.stopped.drain() {
                    state.active.remove(&task);
                }
            }
            LifecycleOperation::Cancel { task } => {
                state.active.remove(task);
                state.stopped.remove(task);
            }
            LifecycleOperation::SetRefusing(refusing) => {
                state.refusing = *refusing;
            }
        }
        state
    }

    fn preconditions(_state: &Self::State, _transition: &Self::Transition) -> bool {
        true
    }
}

/// Runner over in-memory storage and a scripted backend.
pub struct LifecycleHarness {
    runtime: Runtime,
    storage: Arc<InMemoryStorage>,
    backend: Arc<ScriptedBackend>,
    runner: Runner,
}

impl LifecycleHarness {
    fn new() -> Self {
        let runtime = Runtime::new().expect("Failed to create tokio runtime");
        let storage = Arc::new(InMemoryStorage::new());
        let backend = Arc::new(ScriptedBackend::new());
        let runner = Runner::new(
            storage.clone(),
            no_environments(),
            backend.clone(),
            Vec::new(),
        );
        Self {
            runtime,
            storage,
            backend,
            runner,
        }
    }

    async fn active_run(&self, task: &str) -> Option<cadence_scheduler::Run> {
        self.storage
            .get_runs(RunQuery::task(task))
            .await
            .unwrap()
            .into_iter()
            .find(|r| r.status.is_active())
    }

    fn apply_operation(&self, op: &LifecycleOperation) {
        self.runtime.block_on(async {
            match op {
                LifecycleOperation::Start { task } => {
                    let _ = self.runner.run_task(&Task::new(task.as_str())).await;
                }
                LifecycleOperation::Finish { task, with_error } => {
                    if let Some(run) = self.active_run(task).await {
                        self.backend
                            .set_state(&run.execution_ref, ExecutionState::Stopped);
                        let line = if *with_error { "Traceback" } else { "done" };
                        self.backend.set_logs(&run.execution_ref, &[line]);
                    }
                }
                LifecycleOperation::Reconcile => {
                    let report = self.runner.reconcile(false).await.unwrap();
                    assert!(report.errors.is_empty(), "{:?}", report.errors);
                }
                LifecycleOperation::Cancel { task } => {
                    if let Some(run) = self.active_run(task).await {
                        self.runner.cancel(&run.uuid).await.unwrap();
                    }
                }
                LifecycleOperation::SetRefusing(refusing) => {
                    self.backend.refuse_placement(*refusing);
                }
            }
        });
    }
}

impl StateMachineTest for LifecycleHarness {
    type SystemUnderTest = Self;
    type Reference = LifecycleModel;

    fn init_test(
        _ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) -> Self::SystemUnderTest {
        Self::new()
    }

    fn apply(
        state: Self::SystemUnderTest,
        _ref_state: &<Self::Reference as ReferenceStateMachine>::State,
        transition: <Self::Reference as ReferenceStateMachine>::Transition,
    ) -> Self::SystemUnderTest {
        state.apply_operation(&transition);
        state
    }

    fn check_invariants(
        state: &Self::SystemUnderTest,
        ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) {
        state.runtime.block_on(async {
            for task in TASKS {
                let runs = state.storage.get_runs(RunQuery::task(task)).await.unwrap();
                let active = runs.iter().filter(|r| r.status.is_active()).count();

                // Invariant: at most one pending or running run per task
                assert!(active <= 1, "{task} has {active} active runs");
                assert_eq!(active == 1, ref_state.active.contains(task), "{task}");
                assert_eq!(
                    runs.len(),
                    ref_state.runs.get(task).copied().unwrap_or(0),
                    "{task}"
                );

                // Invariant: terminal runs always carry an end time
                assert!(runs
                    .iter()
                    .filter(|r| r.status.is_terminal())
                    .all(|r| r.end.is_some()));
            }
        });
    }
}

prop_state_machine! {
    #![proptest_config(ProptestConfig {
        cases: 50,
        max_shrink_iters: 5000,
        ..ProptestConfig::default()
    })]

    #[test]
    fn run_lifecycle_state_machine_test(sequential 1..30 => LifecycleHarness);
}
