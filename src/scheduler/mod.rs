//! Scheduling strategies over a plan's task set (C3, §4.3). Each strategy
//! takes the tasks plus their `requires` edges and produces a deterministic
//! linear order.

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use std::collections::{BTreeSet, HashMap};

use crate::store::{Task, TaskStatus, TaskType};

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("cycle detected among {} tasks", nodes.len())]
    CycleDetected { nodes: Vec<String>, edges: Vec<(String, String)>, names: Vec<String> },
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Breadth-first over the tree, tie-broken by priority then id.
    Bfs,
    /// Topological order over the `requires` DAG; aborts on a cycle.
    Dag,
    /// Leaves before parents, used to assemble composite-task context from
    /// completed children.
    Postorder,
}

/// Orders `tasks` for execution per `strategy`. `requires_edges` is the
/// full set of `(from, to)` "from requires to" pairs for the plan; only
/// edges between tasks present in `tasks` are considered.
pub fn schedule(tasks: &[Task], requires_edges: &[(String, String)], strategy: Strategy) -> SchedulerResult<Vec<Task>> {
    match strategy {
        Strategy::Bfs => Ok(schedule_bfs(tasks)),
        Strategy::Dag => schedule_dag(tasks, requires_edges),
        Strategy::Postorder => Ok(schedule_postorder(tasks)),
    }
}

fn schedule_bfs(tasks: &[Task]) -> Vec<Task> {
    let mut ordered: Vec<Task> = tasks.to_vec();
    ordered.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.id.cmp(&b.id)));
    ordered
}

fn schedule_postorder(tasks: &[Task]) -> Vec<Task> {
    let mut by_parent: HashMap<Option<String>, Vec<&Task>> = HashMap::new();
    for t in tasks {
        by_parent.entry(t.parent_id.clone()).or_default().push(t);
    }
    for kids in by_parent.values_mut() {
        kids.sort_by(|a, b| a.position.cmp(&b.position).then(a.id.cmp(&b.id)));
    }

    let roots: Vec<&Task> = by_parent.get(&None).cloned().unwrap_or_default();
    let mut out = Vec::with_capacity(tasks.len());
    for root in roots {
        visit_postorder(root, &by_parent, &mut out);
    }
    out
}

fn visit_postorder<'a>(task: &'a Task, by_parent: &HashMap<Option<String>, Vec<&'a Task>>, out: &mut Vec<Task>) {
    if let Some(children) = by_parent.get(&Some(task.id.clone())) {
        for child in children {
            visit_postorder(child, by_parent, out);
        }
    }
    out.push(task.clone());
}

fn schedule_dag(tasks: &[Task], requires_edges: &[(String, String)]) -> SchedulerResult<Vec<Task>> {
    let by_id: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();

    let mut graph: DiGraph<String, ()> = DiGraph::new();
    let mut index_of: HashMap<String, NodeIndex> = HashMap::new();
    for t in tasks {
        let idx = graph.add_node(t.id.clone());
        index_of.insert(t.id.clone(), idx);
    }
    // `requires_edges` is "from requires to" meaning `to` must run before
    // `from`; the scheduling DAG edge therefore points to -> from.
    for (from, to) in requires_edges {
        if let (Some(&to_idx), Some(&from_idx)) = (index_of.get(to), index_of.get(from)) {
            graph.add_edge(to_idx, from_idx, ());
        }
    }

    // Priority-ordered Kahn's algorithm: the *ready set* (in-degree zero,
    // not yet emitted) at each step is exactly the nodes with no remaining
    // precedence constraint, and only that set is tie-broken by
    // `(priority, id)`. This is distinct from toposort-then-sort: sorting
    // the whole toposorted order by priority can move a prerequisite after
    // a dependent whenever the dependent happens to have a lower priority
    // number, which violates the DAG the sort claims to respect.
    let mut in_degree: HashMap<NodeIndex, usize> = graph.node_indices().map(|idx| (idx, 0)).collect();
    for e in graph.edge_indices() {
        if let Some((_, target)) = graph.edge_endpoints(e) {
            *in_degree.get_mut(&target).unwrap() += 1;
        }
    }

    let priority_of = |idx: NodeIndex| -> i64 { by_id.get(graph[idx].as_str()).map(|t| t.priority).unwrap_or(0) };

    let mut ready: BTreeSet<(i64, String, NodeIndex)> =
        in_degree.iter().filter(|&(_, &deg)| deg == 0).map(|(&idx, _)| (priority_of(idx), graph[idx].clone(), idx)).collect();

    let mut order: Vec<NodeIndex> = Vec::with_capacity(graph.node_count());
    while let Some((_, _, idx)) = ready.pop_first() {
        order.push(idx);
        for edge in graph.edges(idx) {
            let target = edge.target();
            let deg = in_degree.get_mut(&target).unwrap();
            *deg -= 1;
            if *deg == 0 {
                ready.insert((priority_of(target), graph[target].clone(), target));
            }
        }
    }

    if order.len() < graph.node_count() {
        let nodes: Vec<String> = graph.node_indices().map(|i| graph[i].clone()).collect();
        let edges: Vec<(String, String)> = graph
            .edge_indices()
            .filter_map(|e| {
                let (a, b) = graph.edge_endpoints(e)?;
                Some((graph[a].clone(), graph[b].clone()))
            })
            .collect();
        let names: Vec<String> = nodes
            .iter()
            .map(|id| by_id.get(id.as_str()).map(|t| t.name.clone()).unwrap_or_default())
            .collect();
        return Err(SchedulerError::CycleDetected { nodes, edges, names });
    }

    Ok(order.into_iter().filter_map(|idx| by_id.get(graph[idx].as_str()).map(|t| (*t).clone())).collect())
}

/// Atomic tasks ready to run right now under `requires`: pending, not
/// blocked by any unfinished `requires` dependency. Composite and root
/// tasks never execute directly, so they never appear here.
pub fn ready_tasks(tasks: &[Task], requires_edges: &[(String, String)]) -> Vec<Task> {
    let by_id: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();
    let mut blocked: HashMap<&str, bool> = HashMap::new();
    for (from, to) in requires_edges {
        let to_done = by_id.get(to.as_str()).map(|t| t.status == TaskStatus::Completed).unwrap_or(true);
        if !to_done {
            blocked.insert(from.as_str(), true);
        }
    }
    tasks
        .iter()
        .filter(|t| t.task_type == TaskType::Atomic && t.status == TaskStatus::Pending && !blocked.get(t.id.as_str()).copied().unwrap_or(false))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::TaskType;
    use chrono::Utc;

    fn task(id: &str, parent: Option<&str>, priority: i64, position: i64, depth: i64) -> Task {
        Task {
            id: id.to_string(),
            plan_id: "p".to_string(),
            parent_id: parent.map(|s| s.to_string()),
            root_id: "root".to_string(),
            name: id.to_string(),
            task_type: TaskType::Atomic,
            status: TaskStatus::Pending,
            priority,
            depth,
            position,
            path: id.to_string(),
            session_id: None,
            workflow_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn bfs_orders_by_priority_then_id_regardless_of_depth() {
        // "deep" is deeper in the tree but has the lower priority number,
        // so it must still be scheduled first: bfs has no depth key.
        let deep = task("deep", None, 0, 0, 3);
        let shallow = task("shallow", None, 1, 0, 0);
        let ordered = schedule_bfs(&[shallow, deep]);
        assert_eq!(ordered[0].id, "deep");
        assert_eq!(ordered[1].id, "shallow");
    }

    #[test]
    fn dag_detects_cycle() {
        let tasks = vec![task("a", None, 0, 0, 0), task("b", None, 0, 1, 0)];
        let edges = vec![("a".to_string(), "b".to_string()), ("b".to_string(), "a".to_string())];
        let err = schedule(&tasks, &edges, Strategy::Dag).unwrap_err();
        assert!(matches!(err, SchedulerError::CycleDetected { .. }));
    }

    #[test]
    fn dag_orders_dependency_before_dependent() {
        let tasks = vec![task("a", None, 0, 0, 0), task("b", None, 0, 1, 0)];
        // a requires b: b must come first.
        let edges = vec![("a".to_string(), "b".to_string())];
        let ordered = schedule(&tasks, &edges, Strategy::Dag).unwrap();
        let pos_a = ordered.iter().position(|t| t.id == "a").unwrap();
        let pos_b = ordered.iter().position(|t| t.id == "b").unwrap();
        assert!(pos_b < pos_a);
    }

    #[test]
    fn dag_priority_tie_break_never_overrides_precedence() {
        // b requires a, but a has a much higher priority number than b.
        // The correct order still runs a before b: priority only breaks
        // ties among nodes with no remaining precedence relationship.
        let a = task("a", None, 5, 0, 0);
        let b = task("b", None, 0, 1, 0);
        let edges = vec![("b".to_string(), "a".to_string())];
        let ordered = schedule(&[a, b], &edges, Strategy::Dag).unwrap();
        let pos_a = ordered.iter().position(|t| t.id == "a").unwrap();
        let pos_b = ordered.iter().position(|t| t.id == "b").unwrap();
        assert!(pos_a < pos_b);
    }

    #[test]
    fn postorder_visits_children_before_parent() {
        let root = task("root", None, 0, 0, 0);
        let child = task("child", Some("root"), 0, 0, 1);
        let ordered = schedule_postorder(&[root, child]);
        assert_eq!(ordered[0].id, "child");
        assert_eq!(ordered[1].id, "root");
    }

    #[test]
    fn ready_tasks_excludes_blocked() {
        let mut a = task("a", None, 0, 0, 0);
        a.status = TaskStatus::Pending;
        let b = task("b", None, 0, 1, 0);
        let edges = vec![("a".to_string(), "b".to_string())];
        let ready = ready_tasks(&[a, b], &edges);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, "b");
    }
}
