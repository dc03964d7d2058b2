//! End-of-run report: every task's placement history and every processor's
//! allocation list, dumped as YAML into a timestamped run file.
use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};

use crate::dispatcher::SchedState;
use crate::util::{append_info_to_yaml, create_yaml_file};

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct PlacementReport {
    pub processor: i64,
    pub start_time: i64,
    pub end_time: i64,
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct TaskReport {
    pub task_id: i64,
    pub workflow_id: i64,
    pub job_id: i64,
    pub criticality: String,
    pub cost: i64,
    pub memory: i64,
    pub placements: Vec<PlacementReport>,
    pub arrival_time: i64,
    pub deadline: i64,
    pub absolute_deadline: i64,
    pub latency: Option<i64>,
    pub remaining_cost: i64,
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct AllocationReport {
    pub task_id: i64,
    pub workflow_id: i64,
    pub job_id: i64,
    pub start_time: i64,
    pub end_time: i64,
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ProcessorReport {
    pub processor_id: usize,
    pub rate: f64,
    pub memory: i64,
    pub active_power: f64,
    pub idle_power: f64,
    pub busy_time: i64,
    pub energy: f64,
    pub allocations: Vec<AllocationReport>,
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct RunReport {
    pub policy: String,
    pub label: String,
    pub horizon: i64,
    pub tasks: Vec<TaskReport>,
    pub processors: Vec<ProcessorReport>,
}

pub fn build_run_report(state: &SchedState, policy: &str, label: &str, total_time: i64) -> RunReport {
    let tasks = state
        .arena
        .iter()
        .map(|(_, task)| TaskReport {
            task_id: task.id,
            workflow_id: task.workflow_id,
            job_id: task.job,
            criticality: format!("{:?}", task.criticality),
            cost: task.cost,
            memory: task.memory,
            placements: task
                .placements
                .iter()
                .map(|p| PlacementReport {
                    processor: p.processor,
                    start_time: p.start,
                    end_time: p.end,
                })
                .collect(),
            arrival_time: task.arrival,
            deadline: task.deadline,
            absolute_deadline: task.absolute_deadline,
            latency: task.latency,
            remaining_cost: task.remaining_cost,
        })
        .collect();

    let processors = state
        .processors
        .iter()
        .map(|processor| {
            let busy_time = processor.busy_time();
            let idle_time = (total_time - busy_time).max(0);
            ProcessorReport {
                processor_id: processor.id,
                rate: processor.rate,
                memory: processor.memory,
                active_power: processor.active_power,
                idle_power: processor.idle_power,
                busy_time,
                energy: processor.active_power * busy_time as f64
                    + processor.idle_power * idle_time as f64,
                allocations: processor
                    .timeline
                    .iter()
                    .map(|alloc| {
                        let task = &state.arena[alloc.task];
                        AllocationReport {
                            task_id: task.id,
                            workflow_id: task.workflow_id,
                            job_id: task.job,
                            start_time: alloc.start,
                            end_time: alloc.end,
                        }
                    })
                    .collect(),
            }
        })
        .collect();

    RunReport {
        policy: policy.to_string(),
        label: label.to_string(),
        horizon: total_time,
        tasks,
        processors,
    }
}

pub fn create_report_yaml(dir_path: &str, policy: &str, label: &str) -> String {
    let now: DateTime<Utc> = Utc::now();
    let date = now.format("%Y-%m-%d-%H-%M-%S").to_string();
    let file_name = format!("{}-{}-{}-report", date, policy, label);
    create_yaml_file(dir_path, &file_name)
}

pub fn dump_run_report_to_yaml(file_path: &str, report: &RunReport) {
    let yaml = serde_yaml::to_string(report).expect("Failed to serialize RunReport to YAML");
    append_info_to_yaml(file_path, &yaml);
}
