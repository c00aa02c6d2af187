// Copyright (c) 2024 The Regents of the University of Michigan.
// Part of weft, released under the BSD 3-Clause License.

//! The workflow data model: a DAG of job and transfer nodes.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

use crate::job::JobId;
use crate::transfer::TransferId;
use crate::Error;

pub type WorkflowId = String;

/// A workflow node: either a job or a transfer.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub enum NodeId {
    Job(JobId),
    Transfer(TransferId),
}

/// A purely cosmetic grouping of nodes for client-side display: groups may
/// nest, but the engine never reads them when computing readiness.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Group {
    pub name: String,
    pub members: Vec<NodeId>,
    pub subgroups: Vec<Group>,
}

/// Workflow lifecycle status.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum WorkflowStatus {
    NotStarted,
    InProgress,
    Done,
    Failed,
}

impl WorkflowStatus {
    /// Terminal statuses per `{DONE, FAILED}`.
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowStatus::Done | WorkflowStatus::Failed)
    }
}

/// A workflow: a DAG of job and transfer nodes plus the dependencies between
/// them.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub jobs: Vec<JobId>,
    pub transfers: Vec<TransferId>,

    /// The dependencies declared by the client: `(u, v)` meaning `u` must
    /// complete before `v` may start.
    pub dependencies: Vec<(NodeId, NodeId)>,

    pub groups: Vec<Group>,

    pub status: WorkflowStatus,
}

impl Workflow {
    pub fn new(id: WorkflowId, jobs: Vec<JobId>, transfers: Vec<TransferId>) -> Self {
        Workflow {
            id,
            jobs,
            transfers,
            dependencies: Vec::new(),
            groups: Vec::new(),
            status: WorkflowStatus::NotStarted,
        }
    }

    fn all_node_ids(&self) -> HashSet<NodeId> {
        let mut nodes: HashSet<NodeId> = self.jobs.iter().cloned().map(NodeId::Job).collect();
        nodes.extend(self.transfers.iter().cloned().map(NodeId::Transfer));
        nodes
    }

    /// Compute the full-dependency-closure: the declared
    /// dependencies plus the implicit edges `input_transfer -> job` and
    /// `job -> output_transfer`, given each job's transfer references.
    ///
    /// # Errors
    /// Returns [`Error::DanglingDependency`] when a declared edge references
    /// a node not present in the workflow, and [`Error::CyclicWorkflow`] when
    /// the resulting graph is not a DAG.
    pub fn full_dependency_closure(
        &self,
        job_transfers: &HashMap<JobId, (Vec<TransferId>, Vec<TransferId>)>,
    ) -> Result<Vec<(NodeId, NodeId)>, Error> {
        let known = self.all_node_ids();
        let mut edges = Vec::with_capacity(self.dependencies.len());

        for (u, v) in &self.dependencies {
            if !known.contains(u) {
                return Err(Error::DanglingDependency(describe(u)));
            }
            if !known.contains(v) {
                return Err(Error::DanglingDependency(describe(v)));
            }
            edges.push((u.clone(), v.clone()));
        }

        for job in &self.jobs {
            let Some((inputs, outputs)) = job_transfers.get(job) else {
                continue;
            };
            for input in inputs {
                edges.push((NodeId::Transfer(input.clone()), NodeId::Job(job.clone())));
            }
            for output in outputs {
                edges.push((NodeId::Job(job.clone()), NodeId::Transfer(output.clone())));
            }
        }

        assert_dag(&known, &edges)?;

        Ok(edges)
    }
}

/// Verify that `edges` over `nodes` form a DAG via Kahn's algorithm.
///
/// # Errors
/// Returns [`Error::CyclicWorkflow`] if any node is left unvisited, meaning a
/// cycle exists among it and its remaining predecessors/successors.
fn assert_dag(nodes: &HashSet<NodeId>, edges: &[(NodeId, NodeId)]) -> Result<(), Error> {
    let mut in_degree: HashMap<&NodeId, usize> = nodes.iter().map(|n| (n, 0)).collect();
    let mut successors: HashMap<&NodeId, Vec<&NodeId>> = HashMap::new();

    for (u, v) in edges {
        *in_degree.entry(v).or_insert(0) += 1;
        successors.entry(u).or_default().push(v);
    }

    let mut queue: VecDeque<&NodeId> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(node, _)| *node)
        .collect();

    let mut visited = 0usize;
    while let Some(node) = queue.pop_front() {
        visited += 1;
        if let Some(succ) = successors.get(node) {
            for next in succ {
                let degree = in_degree.get_mut(next).expect("known node");
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(next);
                }
            }
        }
    }

    if visited == nodes.len() {
        Ok(())
    } else {
        Err(Error::CyclicWorkflow)
    }
}

fn describe(node: &NodeId) -> String {
    match node {
        NodeId::Job(id) => format!("job:{id}"),
        NodeId::Transfer(id) => format!("transfer:{id}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wf() -> Workflow {
        Workflow::new(
            "wf0".into(),
            vec!["a".into(), "b".into(), "c".into()],
            vec!["t0".into()],
        )
    }

    #[test]
    fn closure_includes_implicit_transfer_edges() {
        let mut workflow = wf();
        workflow.dependencies = vec![(NodeId::Job("a".into()), NodeId::Job("b".into()))];

        let mut job_transfers = HashMap::new();
        job_transfers.insert("a".to_string(), (vec!["t0".to_string()], Vec::new()));

        let closure = workflow.full_dependency_closure(&job_transfers).unwrap();

        assert!(closure.contains(&(NodeId::Transfer("t0".into()), NodeId::Job("a".into()))));
        assert!(closure.contains(&(NodeId::Job("a".into()), NodeId::Job("b".into()))));
    }

    #[test]
    fn detects_cycle() {
        let mut workflow = wf();
        workflow.dependencies = vec![
            (NodeId::Job("a".into()), NodeId::Job("b".into())),
            (NodeId::Job("b".into()), NodeId::Job("c".into())),
            (NodeId::Job("c".into()), NodeId::Job("a".into())),
        ];

        let result = workflow.full_dependency_closure(&HashMap::new());
        assert!(matches!(result, Err(Error::CyclicWorkflow)));
    }

    #[test]
    fn detects_dangling_dependency() {
        let mut workflow = wf();
        workflow.dependencies = vec![(NodeId::Job("a".into()), NodeId::Job("ghost".into()))];

        let result = workflow.full_dependency_closure(&HashMap::new());
        assert!(matches!(result, Err(Error::DanglingDependency(_))));
    }

    #[test]
    fn diamond_is_not_a_cycle() {
        let mut workflow = wf();
        workflow.dependencies = vec![
            (NodeId::Job("a".into()), NodeId::Job("b".into())),
            (NodeId::Job("a".into()), NodeId::Job("c".into())),
            (NodeId::Job("b".into()), NodeId::Job("c".into())),
        ];

        assert!(workflow.full_dependency_closure(&HashMap::new()).is_ok());
    }

    #[test]
    fn terminal_statuses() {
        assert!(WorkflowStatus::Done.is_terminal());
        assert!(WorkflowStatus::Failed.is_terminal());
        assert!(!WorkflowStatus::InProgress.is_terminal());
    }
}
