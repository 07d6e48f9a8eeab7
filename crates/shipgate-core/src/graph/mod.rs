//! Task graph: declaration, validation and planning.
//!
//! Tasks are declared statically and validated when the graph is built.
//! Three edge kinds exist:
//!
//! - `depends_on`: the dependency must complete successfully first and is
//!   pulled into any plan that includes the dependent.
//! - `must_run_after`: ordering only; the other task is not pulled in.
//! - `finalized_by`: the finalizer is pulled in and runs after the owner
//!   settles, whatever the owner's outcome.
//!
//! Cycle detection runs over the union of all three, so every plan has a
//! valid linear order.

mod executor;
mod fingerprint;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};

use crate::error::{Result, ShipgateError};

pub use executor::{ExecutionReport, TaskExecutor, TaskOutcome};
pub use fingerprint::fingerprint;

/// Side-effecting body of a task.
pub type TaskAction = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Declared input participating in the up-to-date check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskInput {
    File { path: PathBuf },
    Dir { path: PathBuf },
    Value { name: String, value: String },
}

impl TaskInput {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        TaskInput::File { path: path.into() }
    }

    pub fn dir(path: impl Into<PathBuf>) -> Self {
        TaskInput::Dir { path: path.into() }
    }

    pub fn value(name: impl Into<String>, value: impl fmt::Display) -> Self {
        TaskInput::Value {
            name: name.into(),
            value: value.to_string(),
        }
    }
}

/// A named unit of work with its declared edges.
#[derive(Clone)]
pub struct TaskSpec {
    pub name: String,
    pub inputs: Vec<TaskInput>,
    pub outputs: Vec<PathBuf>,
    pub depends_on: Vec<String>,
    pub must_run_after: Vec<String>,
    pub finalized_by: Vec<String>,
    pub action: TaskAction,
}

impl fmt::Debug for TaskSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSpec")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("depends_on", &self.depends_on)
            .field("must_run_after", &self.must_run_after)
            .field("finalized_by", &self.finalized_by)
            .finish_non_exhaustive()
    }
}

impl TaskSpec {
    pub fn new<F, Fut>(name: impl Into<String>, action: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            depends_on: Vec::new(),
            must_run_after: Vec::new(),
            finalized_by: Vec::new(),
            action: Arc::new(move || action().boxed()),
        }
    }

    pub fn depends_on(mut self, task: impl Into<String>) -> Self {
        self.depends_on.push(task.into());
        self
    }

    pub fn must_run_after(mut self, task: impl Into<String>) -> Self {
        self.must_run_after.push(task.into());
        self
    }

    pub fn finalized_by(mut self, task: impl Into<String>) -> Self {
        self.finalized_by.push(task.into());
        self
    }

    pub fn input(mut self, input: TaskInput) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn output(mut self, path: impl Into<PathBuf>) -> Self {
        self.outputs.push(path.into());
        self
    }
}

/// Incremental constructor; validation happens in [`GraphBuilder::build`].
#[derive(Default)]
pub struct GraphBuilder {
    tasks: Vec<TaskSpec>,
}

impl GraphBuilder {
    pub fn task(mut self, spec: TaskSpec) -> Self {
        self.tasks.push(spec);
        self
    }

    pub fn build(self) -> Result<TaskGraph> {
        let mut tasks = BTreeMap::new();
        for spec in self.tasks {
            if tasks.contains_key(&spec.name) {
                return Err(ShipgateError::DuplicateTask(spec.name));
            }
            tasks.insert(spec.name.clone(), spec);
        }

        for spec in tasks.values() {
            for target in spec
                .depends_on
                .iter()
                .chain(&spec.must_run_after)
                .chain(&spec.finalized_by)
            {
                if !tasks.contains_key(target) {
                    return Err(ShipgateError::UnknownTask {
                        task: spec.name.clone(),
                        missing: target.clone(),
                    });
                }
            }
        }

        let graph = TaskGraph { tasks };
        if let Some(cycle) = graph.find_cycle() {
            return Err(ShipgateError::CyclicDependency { cycle });
        }
        Ok(graph)
    }
}

/// Validated, acyclic set of tasks.
pub struct TaskGraph {
    tasks: BTreeMap<String, TaskSpec>,
}

/// A deterministic linear order over the tasks selected for some targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionPlan {
    pub targets: Vec<String>,
    pub order: Vec<String>,
    /// Tasks pulled in only as finalizers; they run only if an owner started.
    pub finalizer_only: BTreeSet<String>,
}

impl ExecutionPlan {
    pub fn position(&self, task: &str) -> Option<usize> {
        self.order.iter().position(|t| t == task)
    }
}

impl TaskGraph {
    pub fn builder() -> GraphBuilder {
        GraphBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<&TaskSpec> {
        self.tasks.get(name)
    }

    pub fn task_names(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Ordering predecessors of `name`: everything that must settle before it starts.
    fn ordering_edges(&self) -> HashMap<&str, BTreeSet<&str>> {
        let mut preds: HashMap<&str, BTreeSet<&str>> =
            self.tasks.keys().map(|k| (k.as_str(), BTreeSet::new())).collect();
        for spec in self.tasks.values() {
            let entry = preds.entry(spec.name.as_str()).or_default();
            for dep in spec.depends_on.iter().chain(&spec.must_run_after) {
                entry.insert(dep.as_str());
            }
            for fin in &spec.finalized_by {
                preds
                    .entry(fin.as_str())
                    .or_default()
                    .insert(spec.name.as_str());
            }
        }
        preds
    }

    /// DFS over predecessor edges; returns the cycle path with its first node repeated.
    fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }

        fn visit<'a>(
            node: &'a str,
            preds: &HashMap<&'a str, BTreeSet<&'a str>>,
            marks: &mut HashMap<&'a str, Mark>,
            stack: &mut Vec<&'a str>,
        ) -> Option<Vec<String>> {
            marks.insert(node, Mark::InProgress);
            stack.push(node);
            if let Some(next) = preds.get(node) {
                for &p in next {
                    match marks.get(p).copied().unwrap_or(Mark::Unvisited) {
                        Mark::InProgress => {
                            let start = stack.iter().position(|n| *n == p).unwrap_or(0);
                            // Stack follows predecessor edges; reverse to read in run order.
                            let mut cycle = vec![p.to_string()];
                            cycle.extend(stack[start..].iter().rev().map(|s| s.to_string()));
                            return Some(cycle);
                        }
                        Mark::Unvisited => {
                            if let Some(cycle) = visit(p, preds, marks, stack) {
                                return Some(cycle);
                            }
                        }
                        Mark::Done => {}
                    }
                }
            }
            stack.pop();
            marks.insert(node, Mark::Done);
            None
        }

        let preds = self.ordering_edges();
        let mut marks: HashMap<&str, Mark> = HashMap::new();
        for name in self.tasks.keys() {
            if marks.get(name.as_str()).copied().unwrap_or(Mark::Unvisited) == Mark::Unvisited {
                let mut stack = Vec::new();
                if let Some(cycle) = visit(name.as_str(), &preds, &mut marks, &mut stack) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    /// Select the tasks needed for `targets` and order them.
    ///
    /// Uses Kahn's algorithm; among ready tasks the lexicographically
    /// smallest name goes first, so the order is stable across runs.
    pub fn plan(&self, targets: &[&str]) -> Result<ExecutionPlan> {
        let mut required: BTreeSet<&str> = BTreeSet::new();
        let mut stack: Vec<&str> = Vec::new();
        for target in targets {
            let spec = self.tasks.get(*target).ok_or_else(|| ShipgateError::UnknownTask {
                task: "<target>".to_string(),
                missing: target.to_string(),
            })?;
            stack.push(spec.name.as_str());
        }
        while let Some(name) = stack.pop() {
            if required.insert(name) {
                stack.extend(self.tasks[name].depends_on.iter().map(String::as_str));
            }
        }

        // Finalizers join the selection with their own dependency closure.
        let mut selected = required.clone();
        let mut finalizer_only = BTreeSet::new();
        let mut frontier: Vec<&str> = selected.iter().copied().collect();
        while let Some(name) = frontier.pop() {
            for fin in &self.tasks[name].finalized_by {
                let fin = fin.as_str();
                if selected.insert(fin) {
                    finalizer_only.insert(fin.to_string());
                    frontier.push(fin);
                    let mut deps: Vec<&str> =
                        self.tasks[fin].depends_on.iter().map(String::as_str).collect();
                    while let Some(dep) = deps.pop() {
                        if selected.insert(dep) {
                            frontier.push(dep);
                            deps.extend(self.tasks[dep].depends_on.iter().map(String::as_str));
                        }
                    }
                }
            }
        }

        let preds = self.ordering_edges();
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut successors: HashMap<&str, Vec<&str>> = HashMap::new();
        for &name in &selected {
            let relevant: Vec<&str> = preds[name]
                .iter()
                .copied()
                .filter(|p| selected.contains(p))
                .collect();
            in_degree.insert(name, relevant.len());
            for p in relevant {
                successors.entry(p).or_default().push(name);
            }
        }

        let mut ready: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(&name, _)| name)
            .collect();
        let mut order = Vec::with_capacity(selected.len());
        while let Some(name) = ready.pop_first() {
            order.push(name.to_string());
            for &succ in successors.get(name).into_iter().flatten() {
                if let Some(deg) = in_degree.get_mut(succ) {
                    *deg -= 1;
                    if *deg == 0 {
                        ready.insert(succ);
                    }
                }
            }
        }

        if order.len() != selected.len() {
            // Unreachable for a graph that passed `build`, kept as a guard.
            let stuck: Vec<String> = selected
                .iter()
                .filter(|n| !order.iter().any(|o| o == *n))
                .map(|n| n.to_string())
                .collect();
            return Err(ShipgateError::CyclicDependency { cycle: stuck });
        }

        Ok(ExecutionPlan {
            targets: targets.iter().map(|t| t.to_string()).collect(),
            order,
            finalizer_only,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(name: &str) -> TaskSpec {
        TaskSpec::new(name, || async { Ok(()) })
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let err = TaskGraph::builder()
            .task(noop("a"))
            .task(noop("a"))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, ShipgateError::DuplicateTask(name) if name == "a"));
    }

    #[test]
    fn unknown_reference_is_rejected() {
        let err = TaskGraph::builder()
            .task(noop("a").depends_on("ghost"))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, ShipgateError::UnknownTask { missing, .. } if missing == "ghost"));
    }

    #[test]
    fn cycle_is_named() {
        let err = TaskGraph::builder()
            .task(noop("a").depends_on("b"))
            .task(noop("b").depends_on("a"))
            .build()
            .err()
            .unwrap();
        match err {
            ShipgateError::CyclicDependency { cycle } => {
                assert_eq!(cycle.first(), cycle.last());
                assert!(cycle.contains(&"a".to_string()));
                assert!(cycle.contains(&"b".to_string()));
                assert_eq!(cycle.len(), 3);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn self_edge_is_a_cycle() {
        let err = TaskGraph::builder()
            .task(noop("a").must_run_after("a"))
            .build()
            .err()
            .unwrap();
        match err {
            ShipgateError::CyclicDependency { cycle } => assert_eq!(cycle, vec!["a", "a"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn cycle_through_finalizer_edge_is_detected() {
        // b finalizes a, x runs after b, and a depends on x.
        let err = TaskGraph::builder()
            .task(noop("a").depends_on("x").finalized_by("b"))
            .task(noop("b"))
            .task(noop("x").must_run_after("b"))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, ShipgateError::CyclicDependency { .. }));
    }

    #[test]
    fn plan_respects_dependencies_and_breaks_ties_by_name() {
        let graph = TaskGraph::builder()
            .task(noop("publish").depends_on("gate"))
            .task(noop("gate").depends_on("zeta").depends_on("alpha"))
            .task(noop("zeta"))
            .task(noop("alpha"))
            .task(noop("unrelated"))
            .build()
            .unwrap();
        let plan = graph.plan(&["publish"]).unwrap();
        assert_eq!(plan.order, vec!["alpha", "zeta", "gate", "publish"]);
    }

    #[test]
    fn must_run_after_orders_without_pulling_in() {
        let graph = TaskGraph::builder()
            .task(noop("clean"))
            .task(noop("write-version").must_run_after("clean"))
            .build()
            .unwrap();

        let alone = graph.plan(&["write-version"]).unwrap();
        assert_eq!(alone.order, vec!["write-version"]);

        let both = graph.plan(&["write-version", "clean"]).unwrap();
        assert_eq!(both.order, vec!["clean", "write-version"]);
    }

    #[test]
    fn finalizers_are_pulled_in_and_placed_after_owners() {
        let graph = TaskGraph::builder()
            .task(noop("start").finalized_by("stop"))
            .task(noop("test").depends_on("start").finalized_by("stop"))
            .task(noop("stop"))
            .build()
            .unwrap();
        let plan = graph.plan(&["test"]).unwrap();
        assert_eq!(plan.order, vec!["start", "test", "stop"]);
        assert!(plan.finalizer_only.contains("stop"));
    }

    #[test]
    fn unknown_target_is_rejected() {
        let graph = TaskGraph::builder().task(noop("a")).build().unwrap();
        assert!(matches!(
            graph.plan(&["b"]),
            Err(ShipgateError::UnknownTask { .. })
        ));
    }
}
