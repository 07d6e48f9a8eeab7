//! Parallel execution of a planned task graph.
//!
//! Ready tasks are spawned onto a `JoinSet` and admitted by a semaphore
//! sized to `max_parallel`. A task becomes ready once every ordering
//! predecessor has settled; the decision to run, skip or block it is made
//! at that point from the predecessors' outcomes.

use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use serde::Serialize;
use shipgate_state::FingerprintStore;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn, Instrument};

use super::{fingerprint, ExecutionPlan, TaskGraph};
use crate::error::{Result, ShipgateError};
use crate::obs;

/// How a task ended in one graph run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    Succeeded,
    /// Fingerprint unchanged since the last success; action not invoked.
    UpToDate,
    Failed { error: String, exit_code: u8 },
    /// Not run because `by` failed upstream.
    Blocked { by: String },
    /// Finalizer whose owners never started.
    NotRequired,
}

impl TaskOutcome {
    /// Whether the action was invoked.
    pub fn started(&self) -> bool {
        matches!(self, TaskOutcome::Succeeded | TaskOutcome::Failed { .. })
    }

    fn blocking_root(&self, task: &str) -> Option<String> {
        match self {
            TaskOutcome::Failed { .. } => Some(task.to_string()),
            TaskOutcome::Blocked { by } => Some(by.clone()),
            _ => None,
        }
    }
}

/// Result of one [`TaskExecutor::execute`] call.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub run_id: String,
    pub plan: ExecutionPlan,
    pub outcomes: BTreeMap<String, TaskOutcome>,
    /// Tasks in the order their actions were launched.
    pub started: Vec<String>,
    pub duration_ms: u64,
}

impl ExecutionReport {
    pub fn outcome(&self, task: &str) -> Option<&TaskOutcome> {
        self.outcomes.get(task)
    }

    /// Failed tasks in plan order.
    pub fn failures(&self) -> Vec<(&str, &TaskOutcome)> {
        self.plan
            .order
            .iter()
            .filter_map(|name| {
                self.outcomes
                    .get(name)
                    .filter(|o| matches!(o, TaskOutcome::Failed { .. }))
                    .map(|o| (name.as_str(), o))
            })
            .collect()
    }

    /// Every planned task settled without a failure or block.
    pub fn success(&self) -> bool {
        self.plan.order.iter().all(|name| {
            self.outcomes.get(name).is_some_and(|o| {
                !matches!(o, TaskOutcome::Failed { .. } | TaskOutcome::Blocked { .. })
            })
        })
    }

    /// Exit code of the first failure in plan order, 0 on success.
    pub fn exit_code(&self) -> u8 {
        match self.failures().first() {
            Some((_, TaskOutcome::Failed { exit_code, .. })) => *exit_code,
            _ if self.success() => 0,
            _ => 1,
        }
    }
}

/// Runs planned tasks with bounded parallelism and up-to-date checks.
pub struct TaskExecutor {
    fingerprints: Arc<dyn FingerprintStore>,
    max_parallel: usize,
    force: bool,
    run_id: Option<String>,
}

impl TaskExecutor {
    pub fn new(fingerprints: Arc<dyn FingerprintStore>, max_parallel: usize) -> Self {
        Self {
            fingerprints,
            max_parallel: max_parallel.max(1),
            force: false,
            run_id: None,
        }
    }

    /// Ignore stored fingerprints and run every task.
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Use a caller-chosen run id instead of a fresh one.
    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Plan `targets` and run the plan to completion.
    ///
    /// Returns `Err` only for planning errors; task failures are recorded
    /// in the report.
    pub async fn execute(&self, graph: &TaskGraph, targets: &[&str]) -> Result<ExecutionReport> {
        let plan = graph.plan(targets)?;
        let run_id = self
            .run_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let span = obs::run_span(&run_id);
        Ok(self.run(graph, plan, run_id).instrument(span).await)
    }

    async fn run(&self, graph: &TaskGraph, plan: ExecutionPlan, run_id: String) -> ExecutionReport {
        obs::emit_run_started(&run_id, &plan.targets, plan.order.len());
        let started_at = Instant::now();

        let index: HashMap<&str, usize> = plan
            .order
            .iter()
            .enumerate()
            .map(|(i, n)| (n.as_str(), i))
            .collect();

        // Predecessors and successors restricted to the plan.
        let mut pending: HashMap<&str, usize> = HashMap::new();
        let mut successors: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut owners: HashMap<&str, Vec<&str>> = HashMap::new();
        for name in &plan.order {
            pending.entry(name.as_str()).or_insert(0);
            let Some(spec) = graph.get(name) else { continue };
            for pred in spec.depends_on.iter().chain(&spec.must_run_after) {
                if index.contains_key(pred.as_str()) {
                    *pending.entry(name.as_str()).or_insert(0) += 1;
                    successors.entry(pred.as_str()).or_default().push(name.as_str());
                }
            }
            for fin in &spec.finalized_by {
                if index.contains_key(fin.as_str()) {
                    *pending.entry(fin.as_str()).or_insert(0) += 1;
                    successors.entry(name.as_str()).or_default().push(fin.as_str());
                    owners.entry(fin.as_str()).or_default().push(name.as_str());
                }
            }
        }

        let mut ready: std::collections::BTreeSet<usize> = plan
            .order
            .iter()
            .filter(|n| pending.get(n.as_str()) == Some(&0))
            .map(|n| index[n.as_str()])
            .collect();

        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let mut running: JoinSet<(String, anyhow::Result<()>, u64)> = JoinSet::new();
        let mut outcomes: BTreeMap<String, TaskOutcome> = BTreeMap::new();
        let mut started = Vec::new();

        loop {
            while let Some(pos) = ready.pop_first() {
                let name = plan.order[pos].as_str();
                let Some(spec) = graph.get(name) else { continue };

                let decided = self.decide(name, graph, &plan, &owners, &outcomes);
                let outcome = match decided {
                    Some(outcome) => Some(outcome),
                    None if !self.force => match fingerprint(spec) {
                        Ok(Some(current))
                            if self.fingerprints.load(name).ok().flatten().as_ref()
                                == Some(&current) =>
                        {
                            obs::emit_task_skipped(name, "up-to-date");
                            Some(TaskOutcome::UpToDate)
                        }
                        Ok(_) => None,
                        Err(e) => Some(TaskOutcome::Failed {
                            exit_code: e.exit_code(),
                            error: format!("fingerprint: {e}"),
                        }),
                    },
                    None => None,
                };

                if let Some(outcome) = outcome {
                    outcomes.insert(name.to_string(), outcome);
                    release(name, &successors, &mut pending, &index, &mut ready);
                    continue;
                }

                started.push(name.to_string());
                let action = Arc::clone(&spec.action);
                let permit_source = Arc::clone(&semaphore);
                let task_name = name.to_string();
                running.spawn(async move {
                    let _permit = permit_source.acquire_owned().await.ok();
                    obs::emit_task_started(&task_name);
                    let t0 = Instant::now();
                    // Panics while building the future count the same as
                    // panics while polling it.
                    let caught = match std::panic::catch_unwind(AssertUnwindSafe(|| action())) {
                        Ok(future) => AssertUnwindSafe(future).catch_unwind().await,
                        Err(panic) => Err(panic),
                    };
                    let result = match caught {
                        Ok(result) => result,
                        Err(panic) => Err(anyhow::anyhow!(
                            "task panicked: {}",
                            panic_message(panic.as_ref())
                        )),
                    };
                    (task_name, result, t0.elapsed().as_millis() as u64)
                });
            }

            let Some(joined) = running.join_next().await else {
                break;
            };
            let (name, result, elapsed) = match joined {
                Ok(done) => done,
                Err(e) => {
                    // Unattributed; settled after the loop.
                    warn!(error = %e, "task join failed");
                    continue;
                }
            };
            obs::emit_task_finished(&name, elapsed, result.is_ok());

            let outcome = match result {
                Ok(()) => {
                    if let Some(spec) = graph.get(&name) {
                        self.remember(spec);
                    }
                    TaskOutcome::Succeeded
                }
                Err(err) => {
                    warn!(task = %name, error = %format!("{err:#}"), "task failed");
                    if let Err(e) = self.fingerprints.invalidate(&name) {
                        warn!(task = %name, error = %e, "could not invalidate fingerprint");
                    }
                    TaskOutcome::Failed {
                        exit_code: ShipgateError::exit_code_of(&err),
                        error: format!("{err:#}"),
                    }
                }
            };
            release(&name, &successors, &mut pending, &index, &mut ready);
            outcomes.insert(name, outcome);
        }
        settle_aborted(&plan, &started, &mut outcomes);

        let report = ExecutionReport {
            run_id: run_id.clone(),
            plan,
            outcomes,
            started,
            duration_ms: started_at.elapsed().as_millis() as u64,
        };
        obs::emit_run_finished(
            &run_id,
            report.duration_ms,
            report.failures().len(),
            report.success(),
        );
        report
    }

    /// Outcome decided without running, or `None` if the task should run.
    fn decide(
        &self,
        name: &str,
        graph: &TaskGraph,
        plan: &ExecutionPlan,
        owners: &HashMap<&str, Vec<&str>>,
        outcomes: &BTreeMap<String, TaskOutcome>,
    ) -> Option<TaskOutcome> {
        let spec = graph.get(name)?;
        for pred in spec.depends_on.iter().chain(&spec.must_run_after) {
            if let Some(by) = outcomes.get(pred).and_then(|o| o.blocking_root(pred)) {
                obs::emit_task_skipped(name, "blocked");
                debug!(task = %name, by = %by, "blocked by upstream failure");
                return Some(TaskOutcome::Blocked { by });
            }
        }

        if plan.finalizer_only.contains(name) {
            let any_started = owners
                .get(name)
                .into_iter()
                .flatten()
                .any(|owner| outcomes.get(*owner).is_some_and(TaskOutcome::started));
            if !any_started {
                obs::emit_task_skipped(name, "not-required");
                return Some(TaskOutcome::NotRequired);
            }
        }
        None
    }

    fn remember(&self, spec: &super::TaskSpec) {
        match fingerprint(spec) {
            Ok(Some(digest)) => {
                if let Err(e) = self.fingerprints.save(&spec.name, &digest) {
                    warn!(task = %spec.name, error = %e, "could not save fingerprint");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(task = %spec.name, error = %e, "could not fingerprint outputs"),
        }
    }
}

fn release<'a>(
    name: &str,
    successors: &HashMap<&'a str, Vec<&'a str>>,
    pending: &mut HashMap<&'a str, usize>,
    index: &HashMap<&'a str, usize>,
    ready: &mut std::collections::BTreeSet<usize>,
) {
    for &succ in successors.get(name).into_iter().flatten() {
        if let Some(count) = pending.get_mut(succ) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                ready.insert(index[succ]);
            }
        }
    }
}

/// Record tasks whose join handle was lost as failed, and everything left
/// waiting on them as blocked.
fn settle_aborted(
    plan: &ExecutionPlan,
    started: &[String],
    outcomes: &mut BTreeMap<String, TaskOutcome>,
) {
    let aborted: Vec<&String> = started
        .iter()
        .filter(|name| !outcomes.contains_key(*name))
        .collect();
    let Some(first) = aborted.first().map(|name| name.to_string()) else {
        return;
    };
    for name in aborted {
        outcomes.insert(
            name.clone(),
            TaskOutcome::Failed {
                error: "task aborted".to_string(),
                exit_code: 1,
            },
        );
    }
    for name in &plan.order {
        outcomes
            .entry(name.clone())
            .or_insert_with(|| TaskOutcome::Blocked { by: first.clone() });
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{TaskInput, TaskSpec};
    use shipgate_state::fakes::MemoryFingerprintStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    type Log = Arc<Mutex<Vec<String>>>;

    fn logged(name: &str, log: &Log) -> TaskSpec {
        let log = Arc::clone(log);
        let task = name.to_string();
        TaskSpec::new(name, move || {
            let log = Arc::clone(&log);
            let task = task.clone();
            async move {
                log.lock().unwrap().push(task);
                Ok(())
            }
        })
    }

    fn failing(name: &str, log: &Log) -> TaskSpec {
        let log = Arc::clone(log);
        let task = name.to_string();
        TaskSpec::new(name, move || {
            let log = Arc::clone(&log);
            let task = task.clone();
            async move {
                log.lock().unwrap().push(task.clone());
                anyhow::bail!("{task} exploded")
            }
        })
    }

    fn executor() -> TaskExecutor {
        TaskExecutor::new(Arc::new(MemoryFingerprintStore::new()), 4)
    }

    fn pos(log: &Log, name: &str) -> usize {
        log.lock().unwrap().iter().position(|n| n == name).unwrap()
    }

    #[tokio::test]
    async fn dependencies_complete_before_dependents() {
        let log: Log = Arc::default();
        let graph = TaskGraph::builder()
            .task(logged("a", &log))
            .task(logged("b", &log).depends_on("a"))
            .task(logged("c", &log).depends_on("a"))
            .task(logged("d", &log).depends_on("b").depends_on("c"))
            .build()
            .unwrap();

        let report = executor().execute(&graph, &["d"]).await.unwrap();
        assert!(report.success());
        assert_eq!(report.exit_code(), 0);
        assert!(pos(&log, "a") < pos(&log, "b"));
        assert!(pos(&log, "a") < pos(&log, "c"));
        assert!(pos(&log, "b") < pos(&log, "d"));
        assert!(pos(&log, "c") < pos(&log, "d"));
    }

    #[tokio::test]
    async fn failure_blocks_dependents_but_not_independent_branches() {
        let log: Log = Arc::default();
        let graph = TaskGraph::builder()
            .task(failing("build", &log))
            .task(logged("package", &log).depends_on("build"))
            .task(logged("ordered", &log).must_run_after("build"))
            .task(logged("lint", &log))
            .task(logged("all", &log).depends_on("package").depends_on("lint"))
            .build()
            .unwrap();

        let report = executor()
            .execute(&graph, &["all", "ordered"])
            .await
            .unwrap();
        assert!(!report.success());
        assert!(matches!(
            report.outcome("build"),
            Some(TaskOutcome::Failed { .. })
        ));
        assert_eq!(
            report.outcome("package"),
            Some(&TaskOutcome::Blocked { by: "build".into() })
        );
        assert_eq!(
            report.outcome("all"),
            Some(&TaskOutcome::Blocked { by: "build".into() })
        );
        assert_eq!(
            report.outcome("ordered"),
            Some(&TaskOutcome::Blocked { by: "build".into() })
        );
        assert_eq!(report.outcome("lint"), Some(&TaskOutcome::Succeeded));
        assert_eq!(report.exit_code(), 1);
        assert!(!log.lock().unwrap().contains(&"package".to_string()));
    }

    #[tokio::test]
    async fn finalizer_runs_once_after_owner_failure() {
        let log: Log = Arc::default();
        let graph = TaskGraph::builder()
            .task(logged("start", &log).finalized_by("stop"))
            .task(
                failing("test", &log)
                    .depends_on("start")
                    .finalized_by("stop"),
            )
            .task(logged("stop", &log))
            .task(logged("publish", &log).depends_on("test"))
            .build()
            .unwrap();

        let report = executor().execute(&graph, &["publish"]).await.unwrap();
        assert_eq!(report.outcome("stop"), Some(&TaskOutcome::Succeeded));
        assert_eq!(
            report.outcome("publish"),
            Some(&TaskOutcome::Blocked { by: "test".into() })
        );
        let log = log.lock().unwrap();
        assert_eq!(log.iter().filter(|n| *n == "stop").count(), 1);
        assert_eq!(log.last().map(String::as_str), Some("stop"));
    }

    #[tokio::test]
    async fn finalizer_not_required_when_owner_never_started() {
        let log: Log = Arc::default();
        let graph = TaskGraph::builder()
            .task(failing("build", &log))
            .task(logged("start", &log).depends_on("build").finalized_by("stop"))
            .task(logged("stop", &log))
            .build()
            .unwrap();

        let report = executor().execute(&graph, &["start"]).await.unwrap();
        assert_eq!(report.outcome("stop"), Some(&TaskOutcome::NotRequired));
        assert!(!log.lock().unwrap().contains(&"stop".to_string()));
    }

    #[tokio::test]
    async fn panicking_action_is_a_failure() {
        let graph = TaskGraph::builder()
            .task(TaskSpec::new("boom", || async {
                if true {
                    panic!("kaboom");
                }
                Ok(())
            }))
            .build()
            .unwrap();
        let report = executor().execute(&graph, &["boom"]).await.unwrap();
        match report.outcome("boom") {
            Some(TaskOutcome::Failed { error, .. }) => assert!(error.contains("kaboom")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn panic_before_first_poll_fails_and_runs_finalizer() {
        let log: Log = Arc::default();
        let graph = TaskGraph::builder()
            .task(
                TaskSpec::new("start", || -> futures::future::Ready<anyhow::Result<()>> {
                    panic!("no container runtime")
                })
                .finalized_by("stop"),
            )
            .task(logged("stop", &log))
            .task(logged("test", &log).depends_on("start"))
            .build()
            .unwrap();

        let report = executor().execute(&graph, &["test"]).await.unwrap();
        match report.outcome("start") {
            Some(TaskOutcome::Failed { error, .. }) => {
                assert!(error.contains("no container runtime"))
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(
            report.outcome("test"),
            Some(&TaskOutcome::Blocked { by: "start".into() })
        );
        assert_eq!(report.outcome("stop"), Some(&TaskOutcome::Succeeded));
        assert!(!report.success());
        assert_eq!(report.exit_code(), 1);
        assert_eq!(*log.lock().unwrap(), vec!["stop".to_string()]);
    }

    #[test]
    fn unsettled_tasks_are_not_a_success() {
        let graph = TaskGraph::builder()
            .task(TaskSpec::new("a", || async { Ok(()) }))
            .task(TaskSpec::new("b", || async { Ok(()) }).depends_on("a"))
            .build()
            .unwrap();
        let plan = graph.plan(&["b"]).unwrap();
        let mut outcomes = BTreeMap::new();
        let started = vec!["a".to_string()];

        let partial = ExecutionReport {
            run_id: "r".into(),
            plan: plan.clone(),
            outcomes: outcomes.clone(),
            started: started.clone(),
            duration_ms: 0,
        };
        assert!(!partial.success());

        settle_aborted(&plan, &started, &mut outcomes);
        assert!(matches!(outcomes["a"], TaskOutcome::Failed { .. }));
        assert_eq!(outcomes["b"], TaskOutcome::Blocked { by: "a".into() });
        let report = ExecutionReport {
            run_id: "r".into(),
            plan,
            outcomes,
            started,
            duration_ms: 0,
        };
        assert_eq!(report.exit_code(), 1);
    }

    #[tokio::test]
    async fn exit_code_comes_from_typed_error() {
        let graph = TaskGraph::builder()
            .task(TaskSpec::new("assemble", || async {
                Err(ShipgateError::Assembly("missing SBOM input".into()).into())
            }))
            .build()
            .unwrap();
        let report = executor().execute(&graph, &["assemble"]).await.unwrap();
        assert_eq!(report.exit_code(), 12);
    }

    #[tokio::test]
    async fn parallelism_is_bounded() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut builder = TaskGraph::builder();
        for i in 0..6 {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            builder = builder.task(TaskSpec::new(format!("t{i}"), move || {
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            }));
        }
        let graph = builder.build().unwrap();
        let targets: Vec<String> = (0..6).map(|i| format!("t{i}")).collect();
        let targets: Vec<&str> = targets.iter().map(String::as_str).collect();

        let exec = TaskExecutor::new(Arc::new(MemoryFingerprintStore::new()), 2);
        let report = exec.execute(&graph, &targets).await.unwrap();
        assert!(report.success());
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn unchanged_inputs_are_up_to_date_and_force_reruns() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.txt");
        std::fs::write(&input, "v1").unwrap();

        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let graph = TaskGraph::builder()
            .task(
                TaskSpec::new("copy", move || {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                })
                .input(TaskInput::file(&input)),
            )
            .build()
            .unwrap();

        let store: Arc<dyn FingerprintStore> = Arc::new(MemoryFingerprintStore::new());
        let exec = TaskExecutor::new(Arc::clone(&store), 2);

        let first = exec.execute(&graph, &["copy"]).await.unwrap();
        assert_eq!(first.outcome("copy"), Some(&TaskOutcome::Succeeded));
        let second = exec.execute(&graph, &["copy"]).await.unwrap();
        assert_eq!(second.outcome("copy"), Some(&TaskOutcome::UpToDate));
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        std::fs::write(&input, "v2").unwrap();
        let third = exec.execute(&graph, &["copy"]).await.unwrap();
        assert_eq!(third.outcome("copy"), Some(&TaskOutcome::Succeeded));

        let forced = TaskExecutor::new(store, 2).with_force(true);
        let fourth = forced.execute(&graph, &["copy"]).await.unwrap();
        assert_eq!(fourth.outcome("copy"), Some(&TaskOutcome::Succeeded));
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }
}
