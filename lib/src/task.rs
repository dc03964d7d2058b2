//! Task entities and the dispatch priority order shared by every policy.
use serde_derive::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::ops::{Index, IndexMut};

/// Workflow id recorded for standalone (non-DAG) tasks.
pub const WORKFLOW_NONE: i64 = -1;
/// Pseudo processor id recorded for tasks that ran on a remote tier.
pub const REMOTE_PROCESSOR: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Criticality {
    Hard,
    Firm,
    Soft,
}

impl Criticality {
    pub fn from_name(name: &str) -> Option<Criticality> {
        match name.to_ascii_uppercase().as_str() {
            "HARD" => Some(Criticality::Hard),
            "FIRM" => Some(Criticality::Firm),
            "SOFT" => Some(Criticality::Soft),
            _ => None,
        }
    }

    fn class_rank(&self) -> u8 {
        match self {
            Criticality::Hard => 2,
            Criticality::Firm => 1,
            Criticality::Soft => 0,
        }
    }
}

/// Strict dispatch priority: criticality class first, earlier absolute
/// deadline within the same class.
pub fn outranks(a: Criticality, a_deadline: i64, b: Criticality, b_deadline: i64) -> bool {
    match a.class_rank().cmp(&b.class_rank()) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => a_deadline < b_deadline,
    }
}

/// One contiguous run of a task on a processor. A preempted and resumed task
/// accumulates several of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub processor: i64,
    pub start: i64,
    pub end: i64,
}

/// Stable handle into the task arena. Keys are never invalidated; membership
/// in ready/blocked structures is tracked separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskKey(pub usize);

#[derive(Debug, Clone)]
pub struct Task {
    pub id: i64,
    pub workflow_id: i64,
    pub job: i64,
    pub criticality: Criticality,
    pub cost: i64,
    pub memory: i64,
    pub remaining_cost: i64,
    pub placements: Vec<Placement>,
    pub arrival: i64,
    pub deadline: i64,
    pub absolute_deadline: i64,
    pub period: Option<i64>,
    /// Slot of the owning workflow in the session plus the node index inside
    /// its graph. `None` for standalone tasks.
    pub workflow_slot: Option<(usize, usize)>,
    /// Callback address recorded for a task pushed from another tier.
    pub origin: Option<String>,
    pub notified: bool,
    pub offloaded_at: Option<i64>,
    pub latency: Option<i64>,
}

impl Task {
    pub fn new(id: i64, criticality: Criticality, cost: i64, memory: i64) -> Task {
        Task {
            id,
            workflow_id: WORKFLOW_NONE,
            job: 0,
            criticality,
            cost,
            memory,
            remaining_cost: cost,
            placements: Vec::new(),
            arrival: 0,
            deadline: 0,
            absolute_deadline: 0,
            period: None,
            workflow_slot: None,
            origin: None,
            notified: false,
            offloaded_at: None,
            latency: None,
        }
    }

    pub fn last_placement_end(&self) -> Option<i64> {
        self.placements.last().map(|p| p.end)
    }

    /// Complete exactly when nothing remains and the last run has ended.
    pub fn is_complete(&self, now: i64) -> bool {
        self.remaining_cost == 0 && self.last_placement_end().map_or(false, |end| end <= now)
    }
}

/// Append-only task storage. Tasks are created on submission, mutated in
/// place by the dispatcher, and never deleted during a run.
#[derive(Debug, Default)]
pub struct TaskArena {
    tasks: Vec<Task>,
}

impl TaskArena {
    pub fn new() -> TaskArena {
        TaskArena { tasks: Vec::new() }
    }

    pub fn insert(&mut self, task: Task) -> TaskKey {
        self.tasks.push(task);
        TaskKey(self.tasks.len() - 1)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn clear(&mut self) {
        self.tasks.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (TaskKey, &Task)> {
        self.tasks.iter().enumerate().map(|(i, t)| (TaskKey(i), t))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (TaskKey, &mut Task)> {
        self.tasks
            .iter_mut()
            .enumerate()
            .map(|(i, t)| (TaskKey(i), t))
    }

    /// Looks up a job instance by its external identity.
    pub fn find_job(&self, id: i64, workflow_id: i64, job: i64) -> Option<TaskKey> {
        self.iter()
            .find(|(_, t)| t.id == id && t.workflow_id == workflow_id && t.job == job)
            .map(|(k, _)| k)
    }

    /// True when a later job instance of a standalone task already exists.
    pub fn has_later_job(&self, id: i64, after_job: i64) -> bool {
        self.tasks
            .iter()
            .any(|t| t.workflow_id == WORKFLOW_NONE && t.id == id && t.job > after_job)
    }
}

impl Index<TaskKey> for TaskArena {
    type Output = Task;

    fn index(&self, key: TaskKey) -> &Task {
        &self.tasks[key.0]
    }
}

impl IndexMut<TaskKey> for TaskArena {
    fn index_mut(&mut self, key: TaskKey) -> &mut Task {
        &mut self.tasks[key.0]
    }
}

/// Ready-queue entry. The ordering makes a max-heap pop the highest dispatch
/// priority first; release time and key only break ties for a total order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyEntry {
    pub criticality: Criticality,
    pub absolute_deadline: i64,
    pub release: i64,
    pub key: TaskKey,
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.criticality
            .class_rank()
            .cmp(&other.criticality.class_rank())
            .then_with(|| other.absolute_deadline.cmp(&self.absolute_deadline))
            .then_with(|| other.release.cmp(&self.release))
            .then_with(|| other.key.cmp(&self.key))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
