//! Dependency-graph construction and validation.
//!
//! `needs` edges are validated against the job set, cycles are detected
//! with Kahn's algorithm, and topological levels are precomputed for plan
//! printing. Scheduling itself consumes the in-degree and adjacency maps,
//! not the discrete levels.

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet};
use tarmac_core::workflow::Job;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DagError {
    #[error("Duplicate job name: {0}")]
    DuplicateJob(String),

    #[error("Job '{job}' needs unknown job '{missing}'")]
    UnknownNeed { job: String, missing: String },

    #[error("Dependency cycle: {0}")]
    Cycle(String),
}

/// Validated dependency graph over a set of jobs.
#[derive(Debug)]
pub struct JobGraph {
    graph: DiGraph<String, ()>,
    index: HashMap<String, NodeIndex>,
    /// Declaration position of each job, for deterministic ordering.
    order: HashMap<String, usize>,
    levels: Vec<Vec<String>>,
}

impl JobGraph {
    /// Jobs that depend on `name` (forward adjacency).
    pub fn dependents(&self, name: &str) -> Vec<String> {
        self.neighbors(name, Direction::Outgoing)
    }

    /// Jobs `name` depends on.
    pub fn dependencies(&self, name: &str) -> Vec<String> {
        self.neighbors(name, Direction::Incoming)
    }

    fn neighbors(&self, name: &str, direction: Direction) -> Vec<String> {
        self.index
            .get(name)
            .map(|&idx| {
                self.graph
                    .neighbors_directed(idx, direction)
                    .filter_map(|n| self.graph.node_weight(n).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Remaining-dependency count per job.
    pub fn in_degrees(&self) -> HashMap<String, usize> {
        self.index
            .iter()
            .map(|(name, &idx)| {
                let degree = self
                    .graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .count();
                (name.clone(), degree)
            })
            .collect()
    }

    /// Topological levels: each level's jobs depend only on lower levels.
    /// Within a level, jobs keep their declaration order.
    pub fn levels(&self) -> &[Vec<String>] {
        &self.levels
    }

    /// Declaration position of a job, for ordering ready queues.
    pub fn position(&self, name: &str) -> usize {
        self.order.get(name).copied().unwrap_or(usize::MAX)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }
}

/// Builder for validated job graphs.
pub struct DagBuilder;

impl DagBuilder {
    /// Build and validate the graph over all of `jobs`.
    pub fn build(jobs: &[Job]) -> Result<JobGraph, DagError> {
        Self::build_inner(jobs, None)
    }

    /// Build the graph over the selected subset only.
    ///
    /// `needs` edges onto unselected jobs are dropped: a skipped upstream
    /// is a vacuous success, so the dependent starts unblocked by it. The
    /// full workflow must have been validated with [`DagBuilder::build`]
    /// first.
    pub fn build_pruned(jobs: &[Job], selected: &HashSet<String>) -> Result<JobGraph, DagError> {
        Self::build_inner(jobs, Some(selected))
    }

    fn build_inner(jobs: &[Job], selected: Option<&HashSet<String>>) -> Result<JobGraph, DagError> {
        let keep = |name: &str| selected.is_none_or(|s| s.contains(name));

        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        let mut order = HashMap::new();
        for (position, job) in jobs.iter().filter(|j| keep(&j.name)).enumerate() {
            if index.contains_key(&job.name) {
                return Err(DagError::DuplicateJob(job.name.clone()));
            }
            let idx = graph.add_node(job.name.clone());
            index.insert(job.name.clone(), idx);
            order.insert(job.name.clone(), position);
        }

        let known: HashSet<&str> = jobs.iter().map(|j| j.name.as_str()).collect();
        for job in jobs.iter().filter(|j| keep(&j.name)) {
            for need in &job.needs {
                if !known.contains(need.as_str()) {
                    return Err(DagError::UnknownNeed {
                        job: job.name.clone(),
                        missing: need.clone(),
                    });
                }
                // Edge need -> job; dropped when the need was not selected.
                if let Some(&need_idx) = index.get(need) {
                    graph.update_edge(need_idx, index[&job.name], ());
                }
            }
        }

        let levels = kahn_levels(&graph, &order)?;
        Ok(JobGraph {
            graph,
            index,
            order,
            levels,
        })
    }
}

/// Peel zero-in-degree layers off the graph. Failing to consume every
/// node means the leftovers contain a cycle.
fn kahn_levels(
    graph: &DiGraph<String, ()>,
    order: &HashMap<String, usize>,
) -> Result<Vec<Vec<String>>, DagError> {
    let mut indeg: HashMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|idx| (idx, graph.neighbors_directed(idx, Direction::Incoming).count()))
        .collect();

    let mut frontier: Vec<NodeIndex> = indeg
        .iter()
        .filter(|&(_, &d)| d == 0)
        .map(|(&idx, _)| idx)
        .collect();

    let mut levels = Vec::new();
    let mut processed = 0;
    while !frontier.is_empty() {
        frontier.sort_by_key(|&idx| order.get(&graph[idx]).copied().unwrap_or(usize::MAX));
        let mut next = Vec::new();
        let mut level = Vec::new();
        for &idx in &frontier {
            level.push(graph[idx].clone());
            processed += 1;
            for dependent in graph.neighbors_directed(idx, Direction::Outgoing) {
                if let Some(degree) = indeg.get_mut(&dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        next.push(dependent);
                    }
                }
            }
        }
        levels.push(level);
        frontier = next;
    }

    if processed != graph.node_count() {
        let stuck: HashSet<NodeIndex> = indeg
            .iter()
            .filter(|&(_, &d)| d > 0)
            .map(|(&idx, _)| idx)
            .collect();
        return Err(DagError::Cycle(describe_cycle(graph, &stuck)));
    }
    Ok(levels)
}

/// Walk backwards through stuck nodes until one repeats, then print the
/// loop in forward order.
fn describe_cycle(graph: &DiGraph<String, ()>, stuck: &HashSet<NodeIndex>) -> String {
    let start = match stuck.iter().min_by_key(|&&idx| &graph[idx]) {
        Some(&idx) => idx,
        None => return "unresolved dependencies".to_string(),
    };

    let mut seen: Vec<NodeIndex> = Vec::new();
    let mut current = start;
    loop {
        if let Some(pos) = seen.iter().position(|&n| n == current) {
            let mut names: Vec<&str> = seen[pos..].iter().map(|&n| graph[n].as_str()).collect();
            names.reverse();
            names.push(names[0]);
            return names.join(" -> ");
        }
        seen.push(current);
        current = match graph
            .neighbors_directed(current, Direction::Incoming)
            .find(|n| stuck.contains(n))
        {
            Some(next) => next,
            None => return graph[current].clone(),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tarmac_core::workflow::Job;

    fn make_job(name: &str, needs: &[&str]) -> Job {
        Job::builder(name).sh("s", "true").needs(needs.iter().copied()).build()
    }

    #[test]
    fn test_linear_chain_levels() {
        let jobs = vec![
            make_job("build", &[]),
            make_job("test", &["build"]),
            make_job("deploy", &["test"]),
        ];
        let graph = DagBuilder::build(&jobs).unwrap();
        assert_eq!(
            graph.levels(),
            &[
                vec!["build".to_string()],
                vec!["test".to_string()],
                vec!["deploy".to_string()],
            ]
        );
    }

    #[test]
    fn test_diamond_adjacency() {
        let jobs = vec![
            make_job("a", &[]),
            make_job("b", &["a"]),
            make_job("c", &["a"]),
            make_job("d", &["b", "c"]),
        ];
        let graph = DagBuilder::build(&jobs).unwrap();

        let mut dependents = graph.dependents("a");
        dependents.sort();
        assert_eq!(dependents, vec!["b", "c"]);
        let mut dependencies = graph.dependencies("d");
        dependencies.sort();
        assert_eq!(dependencies, vec!["b", "c"]);
        assert_eq!(graph.levels().len(), 3);
        assert_eq!(graph.levels()[1], vec!["b".to_string(), "c".to_string()]);
        assert_eq!(graph.in_degrees()["d"], 2);
        assert!(!graph.is_empty());
    }

    #[test]
    fn test_level_order_follows_declaration() {
        let jobs = vec![make_job("zeta", &[]), make_job("alpha", &[])];
        let graph = DagBuilder::build(&jobs).unwrap();
        assert_eq!(
            graph.levels()[0],
            vec!["zeta".to_string(), "alpha".to_string()]
        );
    }

    #[test]
    fn test_unknown_need() {
        let jobs = vec![make_job("a", &["ghost"])];
        let err = DagBuilder::build(&jobs).unwrap_err();
        assert!(
            matches!(err, DagError::UnknownNeed { job, missing } if job == "a" && missing == "ghost")
        );
    }

    #[test]
    fn test_cycle_detected_with_path() {
        let jobs = vec![make_job("a", &["b"]), make_job("b", &["a"])];
        let err = DagBuilder::build(&jobs).unwrap_err();
        match err {
            DagError::Cycle(path) => {
                assert!(path.contains("a") && path.contains("b"), "{path}");
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_pruned_drops_edges_onto_skipped() {
        let jobs = vec![
            make_job("a", &[]),
            make_job("b", &["a"]),
        ];
        let selected: HashSet<String> = ["b".to_string()].into();
        let graph = DagBuilder::build_pruned(&jobs, &selected).unwrap();
        assert_eq!(graph.len(), 1);
        assert_eq!(graph.in_degrees()["b"], 0);
    }
}
