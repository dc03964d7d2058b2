//! Per-tick preemptive dispatch over live processor timelines.
//!
//! One engine serves every tier; the placement strategy, the offload policy,
//! and the learned engine are injected at session start.
use log::warn;
use rand::rngs::StdRng;
use rand::Rng;
use serde_derive::{Deserialize, Serialize};
use std::collections::BinaryHeap;

use crate::adaptive::AdaptivePlacement;
use crate::dag::Workflow;
use crate::offload::{OffloadPolicy, TierDecision};
use crate::peer::{CompletionNote, FogNode, OffloadedTask, PeerLink};
use crate::processor::{Allocation, Processor};
use crate::task::{outranks, Criticality, Placement, ReadyEntry, Task, TaskArena, TaskKey};

/// Governs whether a running occupant may be interrupted mid-run (Eager) or
/// only at its next natural boundary (Lazy).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PreemptionMode {
    Lazy,
    Eager,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StrategyKind {
    Edf,
    FirstIdle,
    Uniform,
    Adaptive,
}

/// Placement strategies selectable at session start. All of them share the
/// ready-queue discipline; they differ in how a processor is chosen.
pub enum PlacementStrategy {
    /// Earliest finish time over a fixed odd/even core partition, with full
    /// preemptive timeline insertion.
    EdfPartition,
    /// First processor whose timeline tail has passed; plain append.
    FirstIdle,
    /// Uniformly random processor; plain append.
    Uniform,
    /// Episodic learned placement.
    Adaptive(Box<AdaptivePlacement>),
}

impl PlacementStrategy {
    fn kind(&self) -> StrategyKind {
        match self {
            PlacementStrategy::EdfPartition => StrategyKind::Edf,
            PlacementStrategy::FirstIdle => StrategyKind::FirstIdle,
            PlacementStrategy::Uniform => StrategyKind::Uniform,
            PlacementStrategy::Adaptive(_) => StrategyKind::Adaptive,
        }
    }
}

/// Everything the tick needs from outside the locked scheduling state.
pub struct DispatchContext<'a> {
    pub now: i64,
    pub fogs: &'a [FogNode],
    pub cloud: Option<String>,
    pub link: &'a dyn PeerLink,
    pub self_address: &'a str,
}

/// Shared mutable scheduling state of one session, guarded by the session
/// mutex. Tasks live in the arena for the whole run; queue membership is
/// tracked by `ready` alone.
pub struct SchedState {
    pub arena: TaskArena,
    pub workflows: Vec<Workflow>,
    pub processors: Vec<Processor>,
    pub ready: BinaryHeap<ReadyEntry>,
    pub position: (i64, i64),
    pub preemption: PreemptionMode,
    /// Periodic spawn suppression horizon (virtual ms).
    pub horizon: i64,
    pub bus_bandwidth: i64,
}

impl SchedState {
    pub fn new(
        processors: Vec<Processor>,
        preemption: PreemptionMode,
        horizon: i64,
        bus_bandwidth: i64,
    ) -> SchedState {
        SchedState {
            arena: TaskArena::new(),
            workflows: Vec::new(),
            processors,
            ready: BinaryHeap::new(),
            position: (0, 0),
            preemption,
            horizon,
            bus_bandwidth,
        }
    }

    pub fn enqueue(&mut self, key: TaskKey, release: i64) {
        let task = &self.arena[key];
        let entry = ReadyEntry {
            criticality: task.criticality,
            absolute_deadline: task.absolute_deadline,
            release,
            key,
        };
        self.ready.push(entry);
    }

    pub fn clear(&mut self) {
        self.arena.clear();
        self.workflows.clear();
        self.ready.clear();
        for processor in self.processors.iter_mut() {
            processor.clear();
        }
    }
}

fn requeue(state: &mut SchedState, key: TaskKey, release: i64) {
    state.enqueue(key, release);
}

/// Virtual time at which a subtask's inputs are ready, or `None` while a
/// predecessor is still incomplete. Zero-cost dummy predecessors gate
/// readiness but contribute no availability time.
pub fn data_available_at(state: &SchedState, key: TaskKey) -> Option<i64> {
    let task = &state.arena[key];
    let Some((slot, node)) = task.workflow_slot else {
        return Some(0);
    };
    let workflow = &state.workflows[slot];
    let mut available = 0;
    for &(pred, _) in workflow.predecessors(node).iter() {
        let pred_task = &state.arena[workflow.task_keys[pred]];
        if pred_task.remaining_cost != 0 {
            return None;
        }
        if pred_task.cost == 0 {
            continue;
        }
        if let Some(end) = pred_task.last_placement_end() {
            available = available.max(end);
        }
    }
    Some(available)
}

/// Inserts `[start, end)` for `key` at `position`, merging with the task's
/// own contiguous previous record instead of fragmenting it.
fn commit_segment(
    state: &mut SchedState,
    key: TaskKey,
    proc_idx: usize,
    position: &mut usize,
    start: i64,
    end: i64,
) {
    let merged = {
        let timeline = &state.processors[proc_idx].timeline;
        *position > 0
            && timeline[*position - 1].task == key
            && timeline[*position - 1].end == start
    };
    if merged {
        state.processors[proc_idx].timeline[*position - 1].end = end;
        let task = &mut state.arena[key];
        if let Some(last) = task.placements.last_mut() {
            if last.processor == proc_idx as i64 && last.end == start {
                last.end = end;
                return;
            }
        }
        task.placements.push(Placement {
            processor: proc_idx as i64,
            start,
            end,
        });
    } else {
        state.processors[proc_idx].timeline.insert(
            *position,
            Allocation {
                task: key,
                start,
                end,
            },
        );
        *position += 1;
        state.arena[key].placements.push(Placement {
            processor: proc_idx as i64,
            start,
            end,
        });
    }
}

/// Places a task into a processor's timeline starting no earlier than
/// `requested_start`, splitting around or preempting existing occupants.
/// With `commit` false this is a pure earliest-finish estimate.
///
/// Preemption rules: an occupant whose run starts exactly at the candidate
/// boundary yields to a strictly higher-priority incomer in either mode; an
/// occupant already mid-run yields only in Eager mode. A preempted
/// occupant's unexecuted remainder returns to its remaining cost and the
/// occupant is re-enqueued.
pub fn place_task(
    state: &mut SchedState,
    key: TaskKey,
    proc_idx: usize,
    requested_start: i64,
    commit: bool,
) -> i64 {
    let exec_total = {
        let remaining = state.arena[key].remaining_cost;
        state.processors[proc_idx].execution_time(remaining)
    };
    let mut exec = exec_total;
    let mut start = requested_start;
    if let Some(end) = state.arena[key].last_placement_end() {
        start = start.max(end);
    }
    let incoming_criticality = state.arena[key].criticality;
    let incoming_deadline = state.arena[key].absolute_deadline;

    let mut i = 0usize;
    let mut gap_at = None;

    while exec > 0 && i < state.processors[proc_idx].timeline.len() {
        let alloc = state.processors[proc_idx].timeline[i];
        if alloc.end <= start {
            i += 1;
            continue;
        }
        if alloc.start >= start + exec {
            gap_at = Some(i);
            break;
        }

        if alloc.start > start {
            // The leading gap is too small for the whole remainder: commit
            // the fragment that fits and keep scanning.
            let fragment_end = alloc.start;
            if commit {
                commit_segment(state, key, proc_idx, &mut i, start, fragment_end);
            }
            exec -= fragment_end - start;
            start = fragment_end;
            continue;
        }

        let occupant = alloc.task;
        let occupant_wins = {
            let occ = &state.arena[occupant];
            !outranks(
                incoming_criticality,
                incoming_deadline,
                occ.criticality,
                occ.absolute_deadline,
            )
        };

        if alloc.start == start {
            // Exact boundary: priority alone decides, in either mode.
            if occupant_wins {
                start = alloc.end;
                i += 1;
                continue;
            }
            let take = exec.min(alloc.end - start);
            let finish = start + take;
            if commit {
                // The occupant had not begun this run: drop it whole.
                let refund = state.processors[proc_idx].execution_cost(alloc.end - alloc.start);
                state.arena[occupant].remaining_cost += refund;
                state.arena[occupant].placements.retain(|p| {
                    !(p.processor == proc_idx as i64 && p.start == alloc.start && p.end == alloc.end)
                });
                requeue(state, occupant, 0);
                state.processors[proc_idx].timeline.remove(i);
                commit_segment(state, key, proc_idx, &mut i, start, finish);
            } else {
                i += 1;
            }
            exec -= take;
            start = finish;
        } else {
            // The occupant is mid-run across the candidate start.
            if occupant_wins || state.preemption == PreemptionMode::Lazy {
                start = alloc.end;
                i += 1;
                continue;
            }
            let take = exec.min(alloc.end - start);
            let finish = start + take;
            if commit {
                let refund = state.processors[proc_idx].execution_cost(alloc.end - start);
                state.arena[occupant].remaining_cost += refund;
                if let Some(record) = state.arena[occupant]
                    .placements
                    .iter_mut()
                    .find(|p| p.processor == proc_idx as i64 && p.end == alloc.end)
                {
                    record.end = start;
                }
                requeue(state, occupant, 0);
                state.processors[proc_idx].timeline[i].end = start;
                i += 1;
                commit_segment(state, key, proc_idx, &mut i, start, finish);
            } else {
                i += 1;
            }
            exec -= take;
            start = finish;
        }
    }

    let finish_time = start + exec;
    if commit {
        if exec > 0 {
            let mut position = gap_at.unwrap_or(state.processors[proc_idx].timeline.len());
            commit_segment(state, key, proc_idx, &mut position, start, finish_time);
        } else if exec_total == 0 && state.arena[key].placements.is_empty() {
            // Zero-cost task: record an instantaneous run.
            state.arena[key].placements.push(Placement {
                processor: proc_idx as i64,
                start,
                end: start,
            });
        }
        state.arena[key].remaining_cost = 0;
    }
    finish_time
}

/// Odd cores serve standalone tasks, even cores serve workflow subtasks.
/// Falls back to the full set when the partition would be empty.
fn partition_for(state: &SchedState, key: TaskKey) -> Vec<usize> {
    let standalone = state.arena[key].workflow_slot.is_none();
    let selected: Vec<usize> = state
        .processors
        .iter()
        .filter(|p| if standalone { p.id % 2 == 1 } else { p.id % 2 == 0 })
        .map(|p| p.id)
        .collect();
    if selected.is_empty() {
        (0..state.processors.len()).collect()
    } else {
        selected
    }
}

fn append_whole(state: &mut SchedState, key: TaskKey, proc_idx: usize, now: i64) {
    let exec = {
        let remaining = state.arena[key].remaining_cost;
        state.processors[proc_idx].execution_time(remaining)
    };
    let start = now.max(state.processors[proc_idx].tail_end());
    let end = start + exec;
    if exec > 0 {
        state.processors[proc_idx].timeline.push(Allocation {
            task: key,
            start,
            end,
        });
    }
    let task = &mut state.arena[key];
    task.placements.push(Placement {
        processor: proc_idx as i64,
        start,
        end,
    });
    task.remaining_cost = 0;
}

/// Spawns the next job of a periodic task unless its deadline would land
/// beyond the horizon or a later job already exists.
fn maybe_spawn_periodic(state: &mut SchedState, key: TaskKey) {
    let Some(period) = state.arena[key].period else {
        return;
    };
    let (id, job) = {
        let t = &state.arena[key];
        (t.id, t.job)
    };
    if state.arena.has_later_job(id, job) {
        return;
    }
    let template = state.arena[key].clone();
    let arrival = template.arrival + period;
    if template.deadline + arrival >= state.horizon {
        return;
    }
    let mut next = Task::new(id, template.criticality, template.cost, template.memory);
    next.job = job + 1;
    next.deadline = template.deadline;
    next.period = Some(period);
    next.arrival = arrival;
    next.absolute_deadline = arrival + template.deadline;
    next.origin = template.origin.clone();
    let next_key = state.arena.insert(next);
    state.enqueue(next_key, arrival);
}

fn forward_task(state: &mut SchedState, key: TaskKey, destination: &str, ctx: &DispatchContext) {
    let payload = {
        let task = &state.arena[key];
        OffloadedTask {
            id: task.id,
            workflow_id: task.workflow_id,
            job_id: task.job,
            criticality: task.criticality,
            cost: task.cost,
            memory: task.memory,
            absolute_deadline: task.absolute_deadline,
        }
    };
    if let Err(err) = ctx.link.forward(destination, ctx.self_address, &payload) {
        // Best-effort handoff: no retry, no rollback.
        warn!(
            "offload of task {} to {} failed: {}",
            payload.id, destination, err
        );
    }
    state.arena[key].offloaded_at = Some(ctx.now);
}

fn schedule_entry(
    state: &mut SchedState,
    key: TaskKey,
    kind: StrategyKind,
    ctx: &DispatchContext,
    offload: &dyn OffloadPolicy,
    rng: &mut StdRng,
) {
    let now = ctx.now;
    let candidate: Option<usize> = match kind {
        StrategyKind::Edf => partition_for(state, key)
            .into_iter()
            .map(|p| (p, place_task(state, key, p, now, false)))
            .min_by_key(|&(_, finish)| finish)
            .map(|(p, _)| p),
        StrategyKind::FirstIdle => state
            .processors
            .iter()
            .find(|p| p.tail_end() <= now)
            .map(|p| p.id),
        StrategyKind::Uniform => Some(rng.random_range(0..state.processors.len())),
        StrategyKind::Adaptive => unreachable!("adaptive entries are batched"),
    };

    let forwardable = {
        let task = &state.arena[key];
        task.criticality != Criticality::Hard && task.cost != 0 && task.placements.is_empty()
    };
    if forwardable {
        let decision = {
            let task = &state.arena[key];
            let candidate_ref = candidate.map(|p| &state.processors[p]);
            offload.decide(task, candidate_ref, now, ctx.fogs, state.position, rng)
        };
        match decision {
            TierDecision::Local => {}
            TierDecision::Fog(i) => {
                let destination = ctx.fogs[i].address.clone();
                forward_task(state, key, &destination, ctx);
                maybe_spawn_periodic(state, key);
                return;
            }
            TierDecision::Cloud => {
                if let Some(cloud) = ctx.cloud.clone() {
                    forward_task(state, key, &cloud, ctx);
                    maybe_spawn_periodic(state, key);
                    return;
                }
                // No cloud registered: keep the task local.
            }
        }
    }

    match candidate {
        Some(p) => match kind {
            StrategyKind::Edf => {
                place_task(state, key, p, now, true);
            }
            _ => append_whole(state, key, p, now),
        },
        None => {
            // Every core is busy this tick: retry later.
            let release = state.arena[key].arrival;
            requeue(state, key, release);
            return;
        }
    }
    maybe_spawn_periodic(state, key);
}

fn completion_sweep(state: &mut SchedState, now: i64) -> Vec<CompletionNote> {
    let mut notes = Vec::new();
    for (_, task) in state.arena.iter_mut() {
        if task.notified || task.remaining_cost != 0 {
            continue;
        }
        let Some(end) = task.last_placement_end() else {
            continue;
        };
        if end <= now {
            if let Some(origin) = &task.origin {
                notes.push(CompletionNote {
                    origin: origin.clone(),
                    task_id: task.id,
                    workflow_id: task.workflow_id,
                    job_id: task.job,
                });
            }
            task.notified = true;
        }
    }
    notes
}

/// One dispatch round: drains this tick's ready snapshot in priority order,
/// requeues entries that are not yet released or still data-blocked, places
/// or forwards the rest, and finally sweeps for newly completed tasks.
/// Returns the completion notes to deliver asynchronously.
pub fn dispatch_tick(
    state: &mut SchedState,
    ctx: &DispatchContext,
    strategy: &mut PlacementStrategy,
    offload: &dyn OffloadPolicy,
    rng: &mut StdRng,
) -> Vec<CompletionNote> {
    let kind = strategy.kind();
    let mut round = Vec::with_capacity(state.ready.len());
    while let Some(entry) = state.ready.pop() {
        round.push(entry);
    }

    let mut backup = Vec::new();
    let mut batch = Vec::new();
    for entry in round {
        {
            let task = &state.arena[entry.key];
            if task.remaining_cost == 0 || task.offloaded_at.is_some() {
                continue;
            }
        }
        if ctx.now < entry.release {
            backup.push(entry);
            continue;
        }
        match data_available_at(state, entry.key) {
            None => {
                backup.push(entry);
                continue;
            }
            Some(available) if ctx.now < available => {
                backup.push(entry);
                continue;
            }
            Some(_) => {}
        }
        if kind == StrategyKind::Adaptive {
            if state.arena[entry.key].placements.is_empty() {
                batch.push(entry.key);
            }
        } else {
            schedule_entry(state, entry.key, kind, ctx, offload, rng);
        }
    }
    for entry in backup {
        state.ready.push(entry);
    }

    if let PlacementStrategy::Adaptive(engine) = strategy {
        engine.schedule_round(state, &batch, ctx.now, rng);
        for &key in &batch {
            maybe_spawn_periodic(state, key);
        }
    }

    for processor in &state.processors {
        if let Err(err) = processor.verify_timeline() {
            // Soft failure: keep dispatching on a best-effort basis.
            warn!("{}", err);
        }
    }

    completion_sweep(state, ctx.now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::Subtask;
    use crate::offload::NeverOffload;
    use crate::peer::NullLink;
    use crate::planner::plan_workflow;
    use rand::SeedableRng;

    fn create_state(cores: usize, rate: f64, mode: PreemptionMode) -> SchedState {
        let processors = (0..cores)
            .map(|i| Processor::new(i, rate, 2048, 8.0, 2.7))
            .collect();
        SchedState::new(processors, mode, 50_000, 100)
    }

    fn add_task(
        state: &mut SchedState,
        id: i64,
        criticality: Criticality,
        cost: i64,
        arrival: i64,
        deadline: i64,
    ) -> TaskKey {
        let mut task = Task::new(id, criticality, cost, 16);
        task.arrival = arrival;
        task.deadline = deadline;
        task.absolute_deadline = arrival + deadline;
        state.arena.insert(task)
    }

    fn placed_cost(state: &SchedState, key: TaskKey) -> i64 {
        state.arena[key]
            .placements
            .iter()
            .filter(|p| p.processor >= 0)
            .map(|p| state.processors[p.processor as usize].execution_cost(p.end - p.start))
            .sum()
    }

    fn context<'a>(now: i64, link: &'a NullLink) -> DispatchContext<'a> {
        DispatchContext {
            now,
            fogs: &[],
            cloud: None,
            link,
            self_address: "edge:8000",
        }
    }

    #[test]
    fn test_eager_hard_preempts_running_soft() {
        let mut state = create_state(1, 1.0, PreemptionMode::Eager);
        let soft = add_task(&mut state, 0, Criticality::Soft, 1000, 1000, 4000);
        let hard = add_task(&mut state, 1, Criticality::Hard, 200, 1200, 300);

        place_task(&mut state, soft, 0, 1000, true);
        assert_eq!(state.processors[0].timeline[0].end, 2000);

        let finish = place_task(&mut state, hard, 0, 1200, true);
        assert_eq!(finish, 1400);

        let timeline = &state.processors[0].timeline;
        assert_eq!(timeline.len(), 2);
        assert_eq!((timeline[0].task, timeline[0].start, timeline[0].end), (soft, 1000, 1200));
        assert_eq!((timeline[1].task, timeline[1].start, timeline[1].end), (hard, 1200, 1400));

        // 800 units of the SOFT task's cost returned and requeued.
        assert_eq!(state.arena[soft].remaining_cost, 800);
        assert_eq!(state.ready.len(), 1);
        assert_eq!(state.ready.peek().unwrap().key, soft);
        assert!(state.processors[0].verify_timeline().is_ok());
    }

    #[test]
    fn test_lazy_defers_mid_run_preemption() {
        let mut state = create_state(1, 1.0, PreemptionMode::Lazy);
        let soft = add_task(&mut state, 0, Criticality::Soft, 1000, 1000, 4000);
        let hard = add_task(&mut state, 1, Criticality::Hard, 200, 1200, 300);

        place_task(&mut state, soft, 0, 1000, true);
        let finish = place_task(&mut state, hard, 0, 1200, true);

        // The HARD task waits for the SOFT task's contiguous run to end.
        assert_eq!(finish, 2200);
        assert_eq!(state.arena[soft].remaining_cost, 0);
        let timeline = &state.processors[0].timeline;
        assert_eq!((timeline[1].start, timeline[1].end), (2000, 2200));
    }

    #[test]
    fn test_boundary_preemption_ignores_mode() {
        // The occupant's run starts exactly at the candidate start: strictly
        // higher priority wins whole even in Lazy mode.
        let mut state = create_state(1, 1.0, PreemptionMode::Lazy);
        let soft = add_task(&mut state, 0, Criticality::Soft, 1000, 1000, 4000);
        let hard = add_task(&mut state, 1, Criticality::Hard, 200, 1000, 300);

        place_task(&mut state, soft, 0, 1000, true);
        let finish = place_task(&mut state, hard, 0, 1000, true);

        assert_eq!(finish, 1200);
        assert_eq!(state.arena[soft].remaining_cost, 1000);
        assert!(state.arena[soft].placements.is_empty());
        let timeline = &state.processors[0].timeline;
        assert_eq!(timeline.len(), 1);
        assert_eq!((timeline[0].task, timeline[0].start, timeline[0].end), (hard, 1000, 1200));
    }

    #[test]
    fn test_boundary_equal_priority_never_preempts() {
        let mut state = create_state(1, 1.0, PreemptionMode::Eager);
        let first = add_task(&mut state, 0, Criticality::Soft, 500, 0, 600);
        let second = add_task(&mut state, 1, Criticality::Soft, 300, 0, 900);

        place_task(&mut state, first, 0, 0, true);
        let finish = place_task(&mut state, second, 0, 0, true);

        // Later deadline loses the boundary and appends after.
        assert_eq!(finish, 800);
        assert_eq!(state.arena[first].remaining_cost, 0);
    }

    #[test]
    fn test_straddling_interval_resolves_per_allocation() {
        // Incoming FIRM straddles a higher-priority HARD run and a
        // lower-priority SOFT run: it waits out the first and takes the
        // second whole at its boundary.
        let mut state = create_state(1, 1.0, PreemptionMode::Eager);
        let hard = add_task(&mut state, 0, Criticality::Hard, 100, 100, 100);
        let soft = add_task(&mut state, 1, Criticality::Soft, 100, 200, 4000);
        let firm = add_task(&mut state, 2, Criticality::Firm, 150, 0, 400);

        place_task(&mut state, hard, 0, 100, true);
        place_task(&mut state, soft, 0, 200, true);

        let finish = place_task(&mut state, firm, 0, 150, true);
        assert_eq!(finish, 350);

        let timeline = &state.processors[0].timeline;
        assert_eq!(timeline.len(), 2);
        assert_eq!((timeline[0].task, timeline[0].start, timeline[0].end), (hard, 100, 200));
        // The two FIRM fragments merge into one record.
        assert_eq!((timeline[1].task, timeline[1].start, timeline[1].end), (firm, 200, 350));
        assert_eq!(state.arena[soft].remaining_cost, 100);
        assert!(state.arena[soft].placements.is_empty());
        assert!(state.processors[0].verify_timeline().is_ok());
    }

    #[test]
    fn test_split_around_higher_priority_occupant() {
        let mut state = create_state(1, 1.0, PreemptionMode::Eager);
        let hard = add_task(&mut state, 0, Criticality::Hard, 100, 100, 150);
        let soft = add_task(&mut state, 1, Criticality::Soft, 150, 50, 4000);

        place_task(&mut state, hard, 0, 100, true);
        let finish = place_task(&mut state, soft, 0, 50, true);

        // 50 units fit before the HARD run; the rest appends after it.
        assert_eq!(finish, 300);
        let placements = &state.arena[soft].placements;
        assert_eq!(placements.len(), 2);
        assert_eq!((placements[0].start, placements[0].end), (50, 100));
        assert_eq!((placements[1].start, placements[1].end), (200, 300));
        assert!(state.processors[0].verify_timeline().is_ok());
    }

    #[test]
    fn test_cost_conservation_through_preemption() {
        let mut state = create_state(1, 1.0, PreemptionMode::Eager);
        let soft = add_task(&mut state, 0, Criticality::Soft, 1000, 1000, 8000);
        let hard = add_task(&mut state, 1, Criticality::Hard, 200, 1200, 300);

        place_task(&mut state, soft, 0, 1000, true);
        place_task(&mut state, hard, 0, 1200, true);
        assert_eq!(placed_cost(&state, soft) + state.arena[soft].remaining_cost, 1000);

        // Re-place the preempted remainder and check the invariant again.
        let entry = state.ready.pop().unwrap();
        assert_eq!(entry.key, soft);
        place_task(&mut state, soft, 0, 1400, true);
        assert_eq!(state.arena[soft].remaining_cost, 0);
        assert_eq!(placed_cost(&state, soft), 1000);
        assert!(state.processors[0].verify_timeline().is_ok());
    }

    #[test]
    fn test_zero_cost_task_places_instantaneously() {
        let mut state = create_state(1, 1.0, PreemptionMode::Eager);
        let dummy = add_task(&mut state, 0, Criticality::Soft, 0, 0, 100);
        let finish = place_task(&mut state, dummy, 0, 40, true);

        assert_eq!(finish, 40);
        assert_eq!(state.arena[dummy].placements.len(), 1);
        assert_eq!(state.arena[dummy].placements[0].start, 40);
        assert_eq!(state.arena[dummy].placements[0].end, 40);
        assert!(state.processors[0].timeline.is_empty());
    }

    #[test]
    fn test_dispatch_blocks_on_incomplete_predecessor() {
        let mut state = create_state(2, 1.0, PreemptionMode::Eager);

        let mut workflow = Workflow::new(0, 1000, 0);
        workflow.add_subtask(Subtask::new(0, Criticality::Soft, 100, 16));
        workflow.add_subtask(Subtask::new(1, Criticality::Soft, 100, 16));
        workflow.add_dependency(0, 1, 0).unwrap();
        let plan = plan_workflow(&workflow, &state.processors, state.bus_bandwidth);
        for node in 0..workflow.subtask_count() {
            let mut task = Task::new(node as i64, Criticality::Soft, 100, 16);
            task.workflow_id = 0;
            task.workflow_slot = Some((0, node));
            task.deadline = plan.subtasks[node].deadline;
            task.absolute_deadline = plan.subtasks[node].deadline;
            let key = state.arena.insert(task);
            workflow.task_keys.push(key);
        }
        let keys = workflow.task_keys.clone();
        state.workflows.push(workflow);
        state.enqueue(keys[0], 0);
        state.enqueue(keys[1], 0);

        let link = NullLink;
        let mut strategy = PlacementStrategy::FirstIdle;
        let mut rng = StdRng::seed_from_u64(7);

        dispatch_tick(&mut state, &context(0, &link), &mut strategy, &NeverOffload, &mut rng);
        // The root placed; the successor stayed queued behind its data.
        assert_eq!(state.arena[keys[0]].remaining_cost, 0);
        assert_eq!(state.arena[keys[1]].remaining_cost, 100);
        assert_eq!(state.ready.len(), 1);
        assert_eq!(data_available_at(&state, keys[1]), Some(100));

        // Predecessor output lands at t=100: the successor goes through.
        dispatch_tick(&mut state, &context(100, &link), &mut strategy, &NeverOffload, &mut rng);
        assert_eq!(state.arena[keys[1]].remaining_cost, 0);
        assert!(state.ready.is_empty());
    }

    #[test]
    fn test_zero_cost_predecessor_is_skipped_in_availability() {
        let mut state = create_state(1, 1.0, PreemptionMode::Eager);
        let mut workflow = Workflow::new(0, 1000, 0);
        workflow.add_subtask(Subtask::new(0, Criticality::Soft, 0, 0));
        workflow.add_subtask(Subtask::new(1, Criticality::Soft, 100, 16));
        workflow.add_dependency(0, 1, 0).unwrap();
        for node in 0..2 {
            let cost = if node == 0 { 0 } else { 100 };
            let mut task = Task::new(node as i64, Criticality::Soft, cost, 16);
            task.workflow_id = 0;
            task.workflow_slot = Some((0, node));
            let key = state.arena.insert(task);
            workflow.task_keys.push(key);
        }
        let keys = workflow.task_keys.clone();
        state.workflows.push(workflow);

        // Dummy entry completed at t=700 with an instantaneous run.
        place_task(&mut state, keys[0], 0, 700, true);
        assert_eq!(data_available_at(&state, keys[1]), Some(0));
    }

    #[test]
    fn test_periodic_jobs_spawn_until_horizon() {
        let mut state = create_state(1, 1.0, PreemptionMode::Eager);
        state.horizon = 2500;
        let mut task = Task::new(9, Criticality::Firm, 100, 16);
        task.deadline = 500;
        task.absolute_deadline = 500;
        task.period = Some(500);
        let key = state.arena.insert(task);
        state.enqueue(key, 0);

        let link = NullLink;
        let mut strategy = PlacementStrategy::FirstIdle;
        let mut rng = StdRng::seed_from_u64(11);
        for step in 0..6 {
            let ctx = context(step * 500, &link);
            dispatch_tick(&mut state, &ctx, &mut strategy, &NeverOffload, &mut rng);
        }

        // Jobs 0..=3 spawned at arrivals 0, 500, 1000, 1500; the job whose
        // deadline would reach the horizon (500 + 2000 >= 2500) is not.
        let arrivals: Vec<i64> = state.arena.iter().map(|(_, t)| t.arrival).collect();
        assert_eq!(arrivals, vec![0, 500, 1000, 1500]);
        let jobs: Vec<i64> = state.arena.iter().map(|(_, t)| t.job).collect();
        assert_eq!(jobs, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_completion_sweep_notifies_origin_once() {
        let mut state = create_state(1, 1.0, PreemptionMode::Eager);
        let key = add_task(&mut state, 4, Criticality::Soft, 100, 0, 1000);
        state.arena[key].origin = Some("edge:8000".to_string());
        state.enqueue(key, 0);

        let link = NullLink;
        let mut strategy = PlacementStrategy::FirstIdle;
        let mut rng = StdRng::seed_from_u64(13);

        let notes = dispatch_tick(&mut state, &context(0, &link), &mut strategy, &NeverOffload, &mut rng);
        // Placed this tick, finishes at t=100: nothing to notify yet.
        assert!(notes.is_empty());

        let notes = dispatch_tick(&mut state, &context(100, &link), &mut strategy, &NeverOffload, &mut rng);
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].task_id, 4);
        assert_eq!(notes[0].origin, "edge:8000");

        // The per-task flag prevents a duplicate.
        let notes = dispatch_tick(&mut state, &context(200, &link), &mut strategy, &NeverOffload, &mut rng);
        assert!(notes.is_empty());
    }

    #[test]
    fn test_edf_partition_separates_task_kinds() {
        let mut state = create_state(4, 1.0, PreemptionMode::Eager);
        let standalone = add_task(&mut state, 0, Criticality::Firm, 100, 0, 1000);
        assert_eq!(partition_for(&state, standalone), vec![1, 3]);

        let mut subtask = Task::new(1, Criticality::Firm, 100, 16);
        subtask.workflow_slot = Some((0, 0));
        let subtask = state.arena.insert(subtask);
        assert_eq!(partition_for(&state, subtask), vec![0, 2]);
    }

    #[test]
    fn test_offload_hands_task_off_without_rollback() {
        use crate::error::SchedulerError;
        use crate::offload::ProbabilisticOffload;
        use crate::peer::FogNode;

        // A link whose peer is unreachable: the handoff is logged and the
        // task is still considered handed off (no rollback, no retry).
        struct DeadLink;
        impl PeerLink for DeadLink {
            fn forward(
                &self,
                destination: &str,
                _origin: &str,
                _task: &OffloadedTask,
            ) -> Result<(), SchedulerError> {
                Err(SchedulerError::Unreachable(
                    destination.to_string(),
                    "connection refused".to_string(),
                ))
            }
        }

        let mut state = create_state(1, 1.0, PreemptionMode::Eager);
        let key = add_task(&mut state, 6, Criticality::Soft, 100, 0, 1000);
        state.enqueue(key, 0);

        let fogs = vec![FogNode::new("fog:9000", (0, 0), 100)];
        let link = DeadLink;
        let ctx = DispatchContext {
            now: 0,
            fogs: &fogs,
            cloud: None,
            link: &link,
            self_address: "edge:8000",
        };
        let mut strategy = PlacementStrategy::FirstIdle;
        let always = ProbabilisticOffload {
            forward_probability: 1.0,
        };
        let mut rng = StdRng::seed_from_u64(19);
        dispatch_tick(&mut state, &ctx, &mut strategy, &always, &mut rng);

        let task = &state.arena[key];
        assert_eq!(task.offloaded_at, Some(0));
        assert!(task.placements.is_empty());
        assert_eq!(task.remaining_cost, 100);
        assert!(state.ready.is_empty());
        assert!(state.processors[0].timeline.is_empty());
    }

    #[test]
    fn test_hard_tasks_are_never_forwarded() {
        use crate::offload::ProbabilisticOffload;
        use crate::peer::FogNode;

        let mut state = create_state(1, 1.0, PreemptionMode::Eager);
        let key = add_task(&mut state, 7, Criticality::Hard, 100, 0, 1000);
        state.enqueue(key, 0);

        let fogs = vec![FogNode::new("fog:9000", (0, 0), 100)];
        let link = NullLink;
        let ctx = DispatchContext {
            now: 0,
            fogs: &fogs,
            cloud: None,
            link: &link,
            self_address: "edge:8000",
        };
        let mut strategy = PlacementStrategy::FirstIdle;
        let always = ProbabilisticOffload {
            forward_probability: 1.0,
        };
        let mut rng = StdRng::seed_from_u64(23);
        dispatch_tick(&mut state, &ctx, &mut strategy, &always, &mut rng);

        let task = &state.arena[key];
        assert_eq!(task.offloaded_at, None);
        assert_eq!(task.remaining_cost, 0);
        assert_eq!(state.processors[0].timeline.len(), 1);
    }

    #[test]
    fn test_dispatch_survives_corrupted_timeline() {
        // Overlap injected behind the dispatcher's back: the tick logs the
        // invariant violation and keeps going instead of aborting.
        let mut state = create_state(1, 1.0, PreemptionMode::Eager);
        let a = add_task(&mut state, 0, Criticality::Soft, 100, 0, 1000);
        let b = add_task(&mut state, 1, Criticality::Soft, 100, 0, 1000);
        state.processors[0].timeline.push(Allocation { task: a, start: 0, end: 100 });
        state.processors[0].timeline.push(Allocation { task: b, start: 50, end: 150 });

        let link = NullLink;
        let mut strategy = PlacementStrategy::FirstIdle;
        let mut rng = StdRng::seed_from_u64(17);
        let notes = dispatch_tick(&mut state, &context(0, &link), &mut strategy, &NeverOffload, &mut rng);
        assert!(notes.is_empty());
    }
}
