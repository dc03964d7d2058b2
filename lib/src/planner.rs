//! List-scheduling planner run once per submitted workflow.
//!
//! Maps subtasks onto processors by upward rank and earliest finish time,
//! then distributes the graph's deadline slack across subtasks in proportion
//! to their position on the planned timeline.
use crate::dag::Workflow;
use crate::processor::Processor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedSubtask {
    pub rank: i64,
    pub start: i64,
    pub finish: i64,
    pub processor: usize,
    /// Relative deadline derived from the slack distribution.
    pub deadline: i64,
}

#[derive(Debug, Clone)]
pub struct Plan {
    pub subtasks: Vec<PlannedSubtask>,
    pub makespan: i64,
}

fn div_ceil(value: i64, divisor: i64) -> i64 {
    if divisor <= 0 {
        return 0;
    }
    (value + divisor - 1) / divisor
}

/// Upward rank: average execution time of the subtask plus the heaviest
/// successor chain, counting edge payloads as communication weight.
fn calculate_rank(
    workflow: &Workflow,
    execution_times: &[Vec<i64>],
    ranks: &mut Vec<Option<i64>>,
    node: usize,
) -> i64 {
    if let Some(rank) = ranks[node] {
        return rank;
    }
    let times = &execution_times[node];
    // Ceil of the mean; a zero-cost dummy node contributes a zero mean.
    let computation_avg = div_ceil(times.iter().sum::<i64>(), times.len() as i64);

    let successor_max = workflow
        .successors(node)
        .iter()
        .map(|&(succ, payload)| calculate_rank(workflow, execution_times, ranks, succ) + payload)
        .max();

    let rank = computation_avg + successor_max.unwrap_or(0);
    ranks[node] = Some(rank);
    rank
}

pub fn plan_workflow(workflow: &Workflow, processors: &[Processor], bus_bandwidth: i64) -> Plan {
    let node_count = workflow.subtask_count();
    let execution_times: Vec<Vec<i64>> = (0..node_count)
        .map(|node| {
            let cost = workflow.graph[petgraph::graph::NodeIndex::new(node)].cost;
            processors.iter().map(|p| p.execution_time(cost)).collect()
        })
        .collect();

    let mut ranks = vec![None; node_count];
    for node in 0..node_count {
        calculate_rank(workflow, &execution_times, &mut ranks, node);
    }

    // Decreasing rank, stable on the original index.
    let mut order: Vec<usize> = (0..node_count).collect();
    order.sort_by(|&a, &b| ranks[b].cmp(&ranks[a]).then(a.cmp(&b)));

    let mut planned: Vec<PlannedSubtask> = (0..node_count)
        .map(|node| PlannedSubtask {
            rank: ranks[node].unwrap_or(0),
            start: 0,
            finish: 0,
            processor: 0,
            deadline: 0,
        })
        .collect();
    let mut tails = vec![0i64; processors.len()];
    let mut assigned = vec![None; node_count];

    for &node in &order {
        let mut best_start = i64::MAX;
        let mut best_finish = i64::MAX;
        let mut best_processor = 0;
        for (p, tail) in tails.iter().enumerate() {
            let mut data_ready = 0;
            for &(pred, payload) in &workflow.predecessors(node) {
                let mut candidate = planned[pred].finish;
                if assigned[pred] != Some(p) {
                    candidate += div_ceil(payload, bus_bandwidth);
                }
                data_ready = data_ready.max(candidate);
            }
            let start = data_ready.max(*tail);
            let finish = start + execution_times[node][p];
            // First minimal finish wins.
            if finish < best_finish {
                best_start = start;
                best_finish = finish;
                best_processor = p;
            }
        }
        planned[node].start = best_start;
        planned[node].finish = best_finish;
        planned[node].processor = best_processor;
        assigned[node] = Some(best_processor);
        tails[best_processor] = best_finish;
    }

    let makespan = tails.iter().copied().max().unwrap_or(0);

    for subtask in planned.iter_mut() {
        if makespan > 0 {
            let overhead = ((workflow.deadline - makespan) as f64
                * (subtask.finish as f64 / makespan as f64)) as i64;
            subtask.deadline = subtask.finish + overhead;
        } else {
            // All-dummy graph: nothing to distribute over.
            subtask.deadline = workflow.deadline;
        }
    }

    Plan {
        subtasks: planned,
        makespan,
    }
}
