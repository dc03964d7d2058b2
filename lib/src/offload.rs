//! Tier-selection policies: keep a task local or hand it to a fog/cloud peer.
use rand::rngs::StdRng;
use rand::Rng;

use crate::peer::FogNode;
use crate::processor::Processor;
use crate::task::Task;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierDecision {
    Local,
    /// Index into the fog node slice passed to `decide`.
    Fog(usize),
    Cloud,
}

/// One decision contract for all strategies. The dispatcher guarantees the
/// caller-side rules before invoking it: HARD tasks, zero-cost tasks, and
/// tasks that already started locally are never offered for forwarding.
pub trait OffloadPolicy: Send {
    fn decide(
        &self,
        task: &Task,
        candidate: Option<&Processor>,
        now: i64,
        fogs: &[FogNode],
        position: (i64, i64),
        rng: &mut StdRng,
    ) -> TierDecision;
}

/// Uniform destination choice among fog nodes covering the device's last
/// known position, falling back to the cloud when none qualify.
pub fn select_destination(fogs: &[FogNode], position: (i64, i64), rng: &mut StdRng) -> TierDecision {
    let in_range: Vec<usize> = fogs
        .iter()
        .enumerate()
        .filter(|(_, fog)| fog.in_range(position))
        .map(|(i, _)| i)
        .collect();
    if in_range.is_empty() {
        TierDecision::Cloud
    } else {
        TierDecision::Fog(in_range[rng.random_range(0..in_range.len())])
    }
}

/// Forwards with a fixed probability.
pub struct ProbabilisticOffload {
    pub forward_probability: f64,
}

impl Default for ProbabilisticOffload {
    fn default() -> Self {
        ProbabilisticOffload {
            forward_probability: 0.8,
        }
    }
}

impl OffloadPolicy for ProbabilisticOffload {
    fn decide(
        &self,
        _task: &Task,
        _candidate: Option<&Processor>,
        _now: i64,
        fogs: &[FogNode],
        position: (i64, i64),
        rng: &mut StdRng,
    ) -> TierDecision {
        if rng.random::<f64>() < self.forward_probability {
            select_destination(fogs, position, rng)
        } else {
            TierDecision::Local
        }
    }
}

/// Combines a deadline-urgency membership with an estimated-finish-time
/// membership, equal weights; forwards when the combined score exceeds 0.5.
pub struct FuzzyOffload;

impl FuzzyOffload {
    fn deadline_membership(deadline: i64, arrival: i64, now: i64) -> f64 {
        let remaining = (deadline + arrival - now) as f64;
        if remaining < deadline as f64 * 0.5 {
            1.0
        } else if remaining < deadline as f64 * 0.7 {
            0.7
        } else {
            0.4
        }
    }

    fn finish_membership(
        candidate: Option<&Processor>,
        deadline: i64,
        arrival: i64,
        now: i64,
        cost: i64,
    ) -> f64 {
        let Some(processor) = candidate else {
            return 0.7;
        };
        let finish = now + processor.execution_time(cost);
        if finish > deadline + arrival {
            1.0
        } else if finish as f64 > deadline as f64 * 0.7 + arrival as f64 {
            0.7
        } else {
            0.4
        }
    }
}

impl OffloadPolicy for FuzzyOffload {
    fn decide(
        &self,
        task: &Task,
        candidate: Option<&Processor>,
        now: i64,
        fogs: &[FogNode],
        position: (i64, i64),
        rng: &mut StdRng,
    ) -> TierDecision {
        let deadline = Self::deadline_membership(task.deadline, task.arrival, now);
        let finish = Self::finish_membership(candidate, task.deadline, task.arrival, now, task.cost);
        let score = deadline * 0.5 + finish * 0.5;
        if score > 0.5 {
            select_destination(fogs, position, rng)
        } else {
            TierDecision::Local
        }
    }
}

/// Used by the learned policy, which decides implicitly through assignment.
pub struct NeverOffload;

impl OffloadPolicy for NeverOffload {
    fn decide(
        &self,
        _task: &Task,
        _candidate: Option<&Processor>,
        _now: i64,
        _fogs: &[FogNode],
        _position: (i64, i64),
        _rng: &mut StdRng,
    ) -> TierDecision {
        TierDecision::Local
    }
}
