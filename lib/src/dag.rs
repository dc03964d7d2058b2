//! Workflow graphs: write-once DAGs of dependent subtasks.
use petgraph::algo::toposort;
use petgraph::graph::{Graph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction::{Incoming, Outgoing};

use crate::error::SchedulerError;
use crate::task::{Criticality, TaskKey};

/// Node weight of a workflow graph.
#[derive(Debug, Clone, PartialEq)]
pub struct Subtask {
    pub id: i64,
    pub criticality: Criticality,
    pub cost: i64,
    pub memory: i64,
}

impl Subtask {
    pub fn new(id: i64, criticality: Criticality, cost: i64, memory: i64) -> Subtask {
        Subtask {
            id,
            criticality,
            cost,
            memory,
        }
    }
}

/// A submitted dependency graph. Edge weights carry the payload size handed
/// from predecessor to successor.
#[derive(Debug, Clone)]
pub struct Workflow {
    pub id: i64,
    pub deadline: i64,
    pub arrival: i64,
    pub graph: Graph<Subtask, i64>,
    /// Arena keys parallel to node indices, filled at submission.
    pub task_keys: Vec<TaskKey>,
}

impl Workflow {
    pub fn new(id: i64, deadline: i64, arrival: i64) -> Workflow {
        Workflow {
            id,
            deadline,
            arrival,
            graph: Graph::new(),
            task_keys: Vec::new(),
        }
    }

    pub fn add_subtask(&mut self, subtask: Subtask) -> usize {
        self.graph.add_node(subtask).index()
    }

    pub fn add_dependency(
        &mut self,
        pred: usize,
        succ: usize,
        payload: i64,
    ) -> Result<(), SchedulerError> {
        let count = self.graph.node_count();
        if pred >= count || succ >= count {
            return Err(SchedulerError::NotRegistered(format!(
                "workflow {}: edge {} -> {} references an unknown subtask",
                self.id, pred, succ
            )));
        }
        if pred == succ {
            return Err(SchedulerError::NotRegistered(format!(
                "workflow {}: subtask {} depends on itself",
                self.id, pred
            )));
        }
        self.graph
            .add_edge(NodeIndex::new(pred), NodeIndex::new(succ), payload);
        Ok(())
    }

    /// Rejects graphs whose edges do not form a DAG.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        toposort(&self.graph, None).map_err(|cycle| {
            SchedulerError::NotRegistered(format!(
                "workflow {}: dependency cycle through subtask {}",
                self.id,
                cycle.node_id().index()
            ))
        })?;
        Ok(())
    }

    pub fn subtask_count(&self) -> usize {
        self.graph.node_count()
    }

    /// `(predecessor node index, payload)` pairs of a subtask.
    pub fn predecessors(&self, node: usize) -> Vec<(usize, i64)> {
        self.graph
            .edges_directed(NodeIndex::new(node), Incoming)
            .map(|e| (e.source().index(), *e.weight()))
            .collect()
    }

    /// `(successor node index, payload)` pairs of a subtask.
    pub fn successors(&self, node: usize) -> Vec<(usize, i64)> {
        self.graph
            .edges_directed(NodeIndex::new(node), Outgoing)
            .map(|e| (e.target().index(), *e.weight()))
            .collect()
    }
}
