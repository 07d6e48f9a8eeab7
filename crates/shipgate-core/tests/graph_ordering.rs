//! Ordering properties of the executor over a wider graph.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use shipgate_core::{TaskExecutor, TaskGraph, TaskOutcome, TaskSpec};
use shipgate_state::fakes::MemoryFingerprintStore;

#[derive(Default)]
struct Log {
    events: Mutex<Vec<(String, &'static str)>>,
}

impl Log {
    fn push(&self, task: &str, what: &'static str) {
        self.events.lock().unwrap().push((task.to_string(), what));
    }

    fn index(&self, task: &str, what: &str) -> Option<usize> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .position(|(t, w)| t == task && *w == what)
    }
}

fn task(log: &Arc<Log>, name: &str, delay_ms: u64, fail: bool) -> TaskSpec {
    let log = Arc::clone(log);
    let owned = name.to_string();
    TaskSpec::new(name, move || {
        let log = Arc::clone(&log);
        let name = owned.clone();
        async move {
            log.push(&name, "start");
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            log.push(&name, "end");
            if fail {
                anyhow::bail!("{name} failed");
            }
            Ok(())
        }
    })
}

/// Five layers; every task depends on two tasks of the previous layer.
fn layered(log: &Arc<Log>, failing: Option<&str>) -> (TaskGraph, HashMap<String, Vec<String>>) {
    let mut builder = TaskGraph::builder();
    let mut deps = HashMap::new();
    for layer in 0..5 {
        for i in 0..4 {
            let name = format!("l{layer}t{i}");
            let delay = ((layer * 7 + i * 3) % 5) as u64;
            let mut spec = task(log, &name, delay, failing == Some(name.as_str()));
            let mut mine = Vec::new();
            if layer > 0 {
                for j in [i, (i + 1) % 4] {
                    let dep = format!("l{}t{j}", layer - 1);
                    spec = spec.depends_on(dep.clone());
                    mine.push(dep);
                }
            }
            deps.insert(name, mine);
            builder = builder.task(spec);
        }
    }
    (builder.build().unwrap(), deps)
}

#[tokio::test]
async fn dependencies_finish_before_dependents_start() {
    let log = Arc::new(Log::default());
    let (graph, deps) = layered(&log, None);
    let report = TaskExecutor::new(Arc::new(MemoryFingerprintStore::new()), 3)
        .execute(&graph, &["l4t0", "l4t1", "l4t2", "l4t3"])
        .await
        .unwrap();

    assert!(report.success());
    assert_eq!(report.started.len(), 20);
    for (task, task_deps) in &deps {
        let start = log.index(task, "start").unwrap();
        for dep in task_deps {
            let end = log.index(dep, "end").unwrap();
            assert!(end < start, "{task} started before {dep} finished");
        }
    }
}

#[tokio::test]
async fn failure_halts_dependents_but_not_independent_branches() {
    let log = Arc::new(Log::default());
    let (graph, _) = layered(&log, Some("l1t0"));
    let report = TaskExecutor::new(Arc::new(MemoryFingerprintStore::new()), 2)
        .execute(&graph, &["l4t0", "l4t1", "l4t2", "l4t3"])
        .await
        .unwrap();

    assert!(!report.success());
    // l1t0 feeds l2t0 and l2t3 directly.
    for blocked in ["l2t0", "l2t3"] {
        assert_eq!(
            report.outcome(blocked),
            Some(&TaskOutcome::Blocked {
                by: "l1t0".to_string()
            })
        );
        assert!(log.index(blocked, "start").is_none());
    }
    // l2t1 depends on l1t1 and l1t2 only.
    assert_eq!(report.outcome("l2t1"), Some(&TaskOutcome::Succeeded));
    assert_eq!(report.outcome("l1t3"), Some(&TaskOutcome::Succeeded));
}
