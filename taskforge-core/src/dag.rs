//! DAG Extender (C3, §4.3): turns the user's job table and dependency edges
//! into the extended graph the scheduler actually runs against, inserting
//! conditional-run probes ahead of temp jobs and cleanup nodes after a
//! parent's consumers.

use crate::error::GraphError;
use crate::job::{Job, JobKind};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// The extended DAG plus the lookups the runner needs to walk it by
/// `job_id`: a `petgraph` graph carries only node indices, not names.
pub struct ExtendedGraph {
    pub graph: DiGraph<String, ()>,
    pub index_of: HashMap<String, NodeIndex>,
    pub jobs: HashMap<String, Arc<dyn Job>>,
    /// Declared + synthesized input names per job, used by invalidation.
    pub inputs: HashMap<String, HashSet<String>>,
}

impl ExtendedGraph {
    pub fn node(&self, job_id: &str) -> Option<NodeIndex> {
        self.index_of.get(job_id).copied()
    }

    pub fn direct_upstreams(&self, job_id: &str) -> Vec<String> {
        let Some(idx) = self.node(job_id) else {
            return Vec::new();
        };
        self.graph
            .edges_directed(idx, Direction::Incoming)
            .map(|e| self.graph[e.source()].clone())
            .collect()
    }

    pub fn direct_downstreams(&self, job_id: &str) -> Vec<String> {
        let Some(idx) = self.node(job_id) else {
            return Vec::new();
        };
        self.graph
            .edges_directed(idx, Direction::Outgoing)
            .map(|e| self.graph[e.target()].clone())
            .collect()
    }
}

/// `depends_on` edges between user-declared jobs, prior to extension.
pub struct UserDag {
    pub jobs: Vec<Arc<dyn Job>>,
    pub depends_on: HashMap<String, Vec<String>>,
}

/// Transitive non-temp upstream hull of `start`, stopping the walk at (but
/// not through) any `Temp` job. Used to give a probe the same effective
/// invalidation inputs as the downstream it guards (§4.3).
fn non_temp_upstream_hull(
    start: &str,
    depends_on: &HashMap<String, Vec<String>>,
    kinds: &HashMap<String, JobKind>,
) -> HashSet<String> {
    let mut hull = HashSet::new();
    let mut stack: Vec<String> = depends_on.get(start).cloned().unwrap_or_default();
    while let Some(candidate) = stack.pop() {
        if hull.contains(&candidate) {
            continue;
        }
        match kinds.get(&candidate) {
            Some(JobKind::Temp) => {
                for upstream in depends_on.get(&candidate).cloned().unwrap_or_default() {
                    stack.push(upstream);
                }
            }
            _ => {
                hull.insert(candidate.clone());
                for upstream in depends_on.get(&candidate).cloned().unwrap_or_default() {
                    stack.push(upstream);
                }
            }
        }
    }
    hull
}

/// Builds the extended DAG per §4.3. Performs the eager structural checks
/// (`OutputConflict`, `SelfDependency`, `UnknownDependency`) before
/// extension, and the acyclicity check (`NotADag`) after.
pub fn extend(user_dag: UserDag) -> Result<ExtendedGraph, GraphError> {
    let UserDag { jobs, depends_on } = user_dag;

    let mut job_by_id: HashMap<String, Arc<dyn Job>> = HashMap::new();
    let mut kinds: HashMap<String, JobKind> = HashMap::new();
    let mut output_owner: HashMap<String, String> = HashMap::new();

    for job in jobs {
        let id = job.job_id().to_string();
        for output in job.outputs() {
            if let Some(existing) = output_owner.get(output) {
                if existing != &id {
                    return Err(GraphError::OutputConflict {
                        output: output.clone(),
                        first: existing.clone(),
                        second: id.clone(),
                    });
                }
            } else {
                output_owner.insert(output.clone(), id.clone());
            }
        }
        kinds.insert(id.clone(), job.kind());
        job_by_id.insert(id, job);
    }

    for (job_id, deps) in &depends_on {
        for dep in deps {
            if dep == job_id {
                return Err(GraphError::SelfDependency(job_id.clone()));
            }
            if !job_by_id.contains_key(dep) {
                return Err(GraphError::UnknownDependency {
                    job: job_id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    let mut inputs: HashMap<String, HashSet<String>> = HashMap::new();
    for (job_id, deps) in &depends_on {
        let entry = inputs.entry(job_id.clone()).or_default();
        for dep in deps {
            if let Some(dep_job) = job_by_id.get(dep) {
                entry.extend(dep_job.outputs().iter().cloned());
            }
        }
    }

    let mut graph: DiGraph<String, ()> = DiGraph::new();
    let mut index_of: HashMap<String, NodeIndex> = HashMap::new();
    for job_id in job_by_id.keys() {
        let idx = graph.add_node(job_id.clone());
        index_of.insert(job_id.clone(), idx);
    }
    for (job_id, deps) in &depends_on {
        let to = index_of[job_id];
        for dep in deps {
            let from = index_of[dep];
            graph.add_edge(from, to, ());
        }
    }

    // Probes ahead of Temp jobs: one per downstream consumer, keyed by the
    // downstream's id and shared by every Temp job that feeds it (a probe
    // gets one edge per such Temp job), so re-running `extend` on the same
    // input is deterministic.
    let temp_ids: Vec<String> = kinds
        .iter()
        .filter(|(_, k)| **k == JobKind::Temp)
        .map(|(id, _)| id.clone())
        .collect();

    for temp_id in &temp_ids {
        let temp_idx = index_of[temp_id];
        let downstreams: Vec<String> = graph
            .edges_directed(temp_idx, Direction::Outgoing)
            .map(|e| graph[e.target()].clone())
            .filter(|d| kinds.get(d) != Some(&JobKind::Cleanup))
            .collect();

        for downstream in downstreams {
            let probe_id = format!("_DownstreamNeedsMeChecker_{downstream}");
            let probe_idx = *index_of.entry(probe_id.clone()).or_insert_with(|| {
                let idx = graph.add_node(probe_id.clone());
                kinds.insert(probe_id.clone(), JobKind::Invariant);
                idx
            });
            graph.add_edge(probe_idx, temp_idx, ());
            inputs
                .entry(temp_id.clone())
                .or_default()
                .insert(probe_id.clone());

            let hull = non_temp_upstream_hull(&downstream, &depends_on, &kinds);
            for member in hull {
                let member_idx = index_of[&member];
                graph.add_edge(member_idx, temp_idx, ());
                if let Some(member_job) = job_by_id.get(&member) {
                    inputs
                        .entry(temp_id.clone())
                        .or_default()
                        .extend(member_job.outputs().iter().cloned());
                }
            }

            job_by_id.insert(
                probe_id.clone(),
                Arc::new(crate::jobs::probe::DownstreamNeedsMeChecker::new(
                    probe_id.clone(),
                    downstream.clone(),
                )),
            );
        }
    }

    // Cleanup nodes: one per job that declares a cleanup factory.
    let parent_ids: Vec<String> = job_by_id.keys().cloned().collect();
    for parent_id in parent_ids {
        let Some(cleanup_job) = job_by_id
            .get(&parent_id)
            .and_then(|job| job.cleanup_job_class())
        else {
            continue;
        };
        let parent_idx = index_of[&parent_id];
        let cleanup_id = cleanup_job.job_id().to_string();
        let cleanup_idx = graph.add_node(cleanup_id.clone());
        index_of.insert(cleanup_id.clone(), cleanup_idx);
        kinds.insert(cleanup_id.clone(), JobKind::Cleanup);

        let consumers: Vec<NodeIndex> = graph
            .edges_directed(parent_idx, Direction::Outgoing)
            .map(|e| e.target())
            .collect();
        for consumer_idx in consumers {
            graph.add_edge(consumer_idx, cleanup_idx, ());
        }
        job_by_id.insert(cleanup_id, cleanup_job);
    }

    if petgraph::algo::toposort(&graph, None).is_err() {
        return Err(GraphError::NotADag);
    }

    Ok(ExtendedGraph {
        graph,
        index_of,
        jobs: job_by_id,
        inputs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::file_generating::FileGeneratingJob;

    fn noop_job(id: &str, outputs: &[&str]) -> Arc<dyn Job> {
        Arc::new(FileGeneratingJob::new(
            id,
            outputs.iter().map(|s| s.to_string()).collect(),
            Arc::new(|_paths| Ok(())),
        ))
    }

    #[test]
    fn rejects_output_conflict() {
        let jobs = vec![noop_job("a", &["out"]), noop_job("b", &["out"])];
        let mut depends_on = HashMap::new();
        depends_on.insert("a".to_string(), vec![]);
        depends_on.insert("b".to_string(), vec![]);
        let err = extend(UserDag { jobs, depends_on }).unwrap_err();
        assert!(matches!(err, GraphError::OutputConflict { .. }));
    }

    #[test]
    fn rejects_self_dependency() {
        let jobs = vec![noop_job("a", &["out"])];
        let mut depends_on = HashMap::new();
        depends_on.insert("a".to_string(), vec!["a".to_string()]);
        let err = extend(UserDag { jobs, depends_on }).unwrap_err();
        assert!(matches!(err, GraphError::SelfDependency(_)));
    }

    #[test]
    fn linear_chain_extends_cleanly() {
        let jobs = vec![noop_job("a", &["a.out"]), noop_job("b", &["b.out"])];
        let mut depends_on = HashMap::new();
        depends_on.insert("a".to_string(), vec![]);
        depends_on.insert("b".to_string(), vec!["a".to_string()]);
        let extended = extend(UserDag { jobs, depends_on }).unwrap();
        assert_eq!(extended.direct_upstreams("b"), vec!["a".to_string()]);
    }

    fn temp_job(id: &str, outputs: &[&str]) -> Arc<dyn Job> {
        Arc::new(crate::jobs::temp_file_generating::TempFileGeneratingJob::from_file_generating(
            FileGeneratingJob::new(
                id,
                outputs.iter().map(|s| s.to_string()).collect(),
                Arc::new(|_paths| Ok(())),
            ),
        ))
    }

    /// A Temp job with two live consumers gets a distinct probe per consumer,
    /// keyed by the consumer's id -- not one probe shared (and silently
    /// overwritten) across both.
    #[test]
    fn temp_job_gets_one_probe_per_downstream_consumer() {
        let jobs = vec![
            temp_job("t", &["t.out"]),
            noop_job("c1", &["c1.out"]),
            noop_job("c2", &["c2.out"]),
        ];
        let mut depends_on = HashMap::new();
        depends_on.insert("t".to_string(), vec![]);
        depends_on.insert("c1".to_string(), vec!["t".to_string()]);
        depends_on.insert("c2".to_string(), vec!["t".to_string()]);
        let extended = extend(UserDag { jobs, depends_on }).unwrap();

        let mut probes = extended.direct_upstreams("t");
        probes.sort();
        assert_eq!(
            probes,
            vec![
                "_DownstreamNeedsMeChecker_c1".to_string(),
                "_DownstreamNeedsMeChecker_c2".to_string(),
            ],
            "each consumer must keep its own probe node instead of sharing/overwriting one keyed by the Temp job"
        );
        assert!(extended.jobs.contains_key("_DownstreamNeedsMeChecker_c1"));
        assert!(extended.jobs.contains_key("_DownstreamNeedsMeChecker_c2"));
        assert!(extended.inputs["t"].contains("_DownstreamNeedsMeChecker_c1"));
        assert!(extended.inputs["t"].contains("_DownstreamNeedsMeChecker_c2"));
    }
}
