use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::state::{RunState, TaskStatus};
use crate::{FlowError, Task, creates_cycle};

/// Tasks plus their dependency edges, built incrementally and then frozen.
///
/// Upstream ids may refer to tasks added later; they have to resolve by the
/// time `freeze` is called. Every addition is checked for cycles, so the
/// edge relation stays acyclic at all times.
#[derive(Debug, Default)]
pub struct TaskGraph {
    tasks: Vec<Arc<Task>>,
    index: HashMap<String, usize>,
    dependents: HashMap<String, Vec<String>>,
    frozen: bool,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_task<I, S>(&mut self, mut task: Task, upstream: I) -> Result<(), FlowError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if self.frozen {
            return Err(FlowError::GraphFrozen);
        }
        if self.index.contains_key(task.id()) {
            return Err(FlowError::DuplicateId(task.id().to_string()));
        }

        let mut deps: Vec<String> = Vec::new();
        for dep in upstream {
            let dep = dep.into();
            if !deps.contains(&dep) {
                deps.push(dep);
            }
        }

        if creates_cycle(task.id(), &deps, |id| self.upstream_of(id)) {
            return Err(FlowError::Cycle {
                task: task.id().to_string(),
            });
        }

        let id = task.id().to_string();
        for dep in &deps {
            self.dependents
                .entry(dep.clone())
                .or_default()
                .push(id.clone());
        }
        task.set_upstream(deps);
        self.index.insert(id, self.tasks.len());
        self.tasks.push(Arc::new(task));

        Ok(())
    }

    /// Checks that every upstream id resolves and makes the graph read-only.
    pub fn freeze(&mut self) -> Result<(), FlowError> {
        if self.frozen {
            return Ok(());
        }
        for task in &self.tasks {
            if let Some(missing) = task.upstream().iter().find(|dep| !self.index.contains_key(*dep)) {
                return Err(FlowError::DanglingReference {
                    task: task.id().to_string(),
                    upstream: missing.clone(),
                });
            }
        }
        self.frozen = true;
        Ok(())
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Task>> {
        self.index.get(id).map(|&i| &self.tasks[i])
    }

    /// Tasks in insertion order.
    pub fn tasks(&self) -> impl Iterator<Item = &Arc<Task>> {
        self.tasks.iter()
    }

    pub fn upstream_of(&self, id: &str) -> Option<&[String]> {
        self.get(id).map(|task| task.upstream())
    }

    pub fn dependents_of(&self, id: &str) -> &[String] {
        self.dependents.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every task reachable downstream of `id`, in insertion order.
    pub fn descendants(&self, id: &str) -> Vec<&str> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([id]);

        while let Some(current) = queue.pop_front() {
            for child in self.dependents_of(current) {
                if seen.insert(child.as_str()) {
                    queue.push_back(child);
                }
            }
        }

        self.tasks
            .iter()
            .map(|task| task.id())
            .filter(|task| seen.contains(task))
            .collect()
    }

    /// Pending tasks whose upstreams all succeeded, in insertion order.
    pub fn ready_set(&self, state: &RunState) -> Vec<Arc<Task>> {
        self.tasks
            .iter()
            .filter(|task| state.status(task.id()) == Some(TaskStatus::Pending))
            .filter(|task| {
                task.upstream()
                    .iter()
                    .all(|dep| state.status(dep) == Some(TaskStatus::Succeeded))
            })
            .cloned()
            .collect()
    }

    /// Dependency tree from every root, one line per edge.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for root in self.tasks.iter().filter(|task| task.upstream().is_empty()) {
            out.push_str(root.id());
            out.push('\n');
            self.render_chain(root.id(), "  ", &mut out);
        }
        out
    }

    fn render_chain(&self, id: &str, prefix: &str, out: &mut String) {
        for child in self.dependents_of(id) {
            out.push_str(&format!("{}└─> {}\n", prefix, child));
            self.render_chain(child, &format!("{}    ", prefix), out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{HttpRequest, Method};
    use pretty_assertions::assert_eq;

    fn task(id: &str) -> Task {
        Task::single_call(id, HttpRequest::new(Method::Get, id))
    }

    fn ids(tasks: &[Arc<Task>]) -> Vec<&str> {
        tasks.iter().map(|t| t.id()).collect()
    }

    fn diamond() -> TaskGraph {
        let mut graph = TaskGraph::new();
        graph.add_task(task("a"), Vec::<String>::new()).unwrap();
        graph.add_task(task("b"), ["a"]).unwrap();
        graph.add_task(task("c"), ["a"]).unwrap();
        graph.add_task(task("d"), ["b", "c"]).unwrap();
        graph.freeze().unwrap();
        graph
    }

    #[test]
    fn closing_a_cycle_is_rejected_and_graph_unchanged() {
        let mut graph = TaskGraph::new();
        graph.add_task(task("a"), ["b"]).unwrap();

        let err = graph.add_task(task("b"), ["a"]).unwrap_err();

        assert_eq!(err, FlowError::Cycle { task: "b".into() });
        assert_eq!(graph.len(), 1);
        assert!(graph.get("b").is_none());
        assert!(graph.dependents_of("a").is_empty());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut graph = TaskGraph::new();
        graph.add_task(task("a"), Vec::<String>::new()).unwrap();
        assert_eq!(
            graph.add_task(task("a"), Vec::<String>::new()),
            Err(FlowError::DuplicateId("a".into()))
        );
    }

    #[test]
    fn freeze_reports_dangling_upstream() {
        let mut graph = TaskGraph::new();
        graph.add_task(task("a"), ["ghost"]).unwrap();
        assert_eq!(
            graph.freeze(),
            Err(FlowError::DanglingReference {
                task: "a".into(),
                upstream: "ghost".into()
            })
        );
        assert!(!graph.is_frozen());
    }

    #[test]
    fn frozen_graph_rejects_additions() {
        let mut graph = diamond();
        assert_eq!(
            graph.add_task(task("e"), ["d"]),
            Err(FlowError::GraphFrozen)
        );
    }

    #[test]
    fn roots_are_ready_first() {
        let mut graph = TaskGraph::new();
        graph.add_task(task("z"), Vec::<String>::new()).unwrap();
        graph.add_task(task("y"), ["z"]).unwrap();
        graph.add_task(task("x"), Vec::<String>::new()).unwrap();
        graph.freeze().unwrap();

        let state = RunState::new(graph.tasks().map(|t| t.id()));
        assert_eq!(ids(&graph.ready_set(&state)), vec!["z", "x"]);
    }

    #[test]
    fn ready_set_waits_for_every_upstream() {
        let graph = diamond();
        let mut state = RunState::new(graph.tasks().map(|t| t.id()));
        state.begin_attempt("a");
        state.succeed("a", serde_json::Value::Null);
        assert_eq!(ids(&graph.ready_set(&state)), vec!["b", "c"]);

        state.begin_attempt("b");
        state.succeed("b", serde_json::Value::Null);
        assert_eq!(ids(&graph.ready_set(&state)), vec!["c"]);

        state.begin_attempt("c");
        state.succeed("c", serde_json::Value::Null);
        assert_eq!(ids(&graph.ready_set(&state)), vec!["d"]);
    }

    #[test]
    fn descendants_are_transitive() {
        let graph = diamond();
        assert_eq!(graph.descendants("a"), vec!["b", "c", "d"]);
        assert_eq!(graph.descendants("c"), vec!["d"]);
        assert!(graph.descendants("d").is_empty());
    }

    #[test]
    fn duplicate_upstream_ids_collapse() {
        let mut graph = TaskGraph::new();
        graph.add_task(task("a"), Vec::<String>::new()).unwrap();
        graph.add_task(task("b"), ["a", "a"]).unwrap();
        assert_eq!(graph.upstream_of("b").unwrap(), ["a"]);
        assert_eq!(graph.dependents_of("a"), ["b"]);
    }

    #[test]
    fn render_draws_tree_from_roots() {
        let graph = diamond();
        assert_eq!(
            graph.render(),
            "a\n  └─> b\n      └─> d\n  └─> c\n      └─> d\n"
        );
    }
}
