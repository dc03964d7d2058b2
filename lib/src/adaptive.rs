//! Learned placement: one scheduling round as a finite-horizon decision
//! process over the ready-but-unassigned snapshot.
//!
//! Episodes run against a speculative copy of the timelines; only the
//! winning trajectory's edits are committed to the real state.
use log::debug;
use rand::rngs::StdRng;
use rand::Rng;
use std::collections::HashMap;

use crate::dispatcher::SchedState;
use crate::processor::Allocation;
use crate::task::{Criticality, Placement, TaskKey};

type StateKey = (Vec<Criticality>, Vec<Option<usize>>, usize);
type Action = (usize, usize);

const REWARD_WINDOW: usize = 100;

/// Speculative edits of one episode: per-processor tail allocations plus
/// per-slot placements. Committed wholesale or discarded.
#[derive(Debug, Clone)]
struct Stage {
    tails: Vec<Vec<Allocation>>,
    placements: Vec<Vec<Placement>>,
    remaining: Vec<i64>,
    reward_total: f64,
}

impl Stage {
    fn new(state: &SchedState, ready: &[TaskKey]) -> Stage {
        Stage {
            tails: vec![Vec::new(); state.processors.len()],
            placements: vec![Vec::new(); ready.len()],
            remaining: ready.iter().map(|&k| state.arena[k].remaining_cost).collect(),
            reward_total: 0.0,
        }
    }
}

pub struct AdaptivePlacement {
    q_table: HashMap<(StateKey, Action), f64>,
    action_n: HashMap<Action, u64>,
    last_rewards: Vec<f64>,
    last_rewards_index: usize,
    qos_values: Vec<f64>,
    pub epsilon: f64,
    lambda_weight: f64,
    qos_sensitivity: f64,
    deadline_sensitivity: f64,
    alpha: f64,
    gamma: f64,
    epsilon_decay: f64,
    pub epsilon_min: f64,
    episodes: usize,
}

impl Default for AdaptivePlacement {
    fn default() -> Self {
        AdaptivePlacement::new()
    }
}

impl AdaptivePlacement {
    pub fn new() -> AdaptivePlacement {
        AdaptivePlacement {
            q_table: HashMap::new(),
            action_n: HashMap::new(),
            last_rewards: Vec::new(),
            last_rewards_index: 0,
            qos_values: Vec::new(),
            epsilon: 0.99,
            lambda_weight: 1.0,
            qos_sensitivity: 1.0,
            deadline_sensitivity: 1.0,
            alpha: 0.1,
            gamma: 0.9,
            epsilon_decay: 0.99,
            epsilon_min: 0.2,
            episodes: 10,
        }
    }

    pub fn clear(&mut self) {
        *self = AdaptivePlacement::new();
    }

    pub fn q_value(&self, state: &StateKey, action: Action) -> Option<f64> {
        self.q_table.get(&(state.clone(), action)).copied()
    }

    /// Legal actions of a state, seeding value-table and trial-count entries
    /// on first sight.
    fn legal_actions(&mut self, state: &StateKey, processor_count: usize) -> Vec<Action> {
        let mut actions = Vec::new();
        for slot in 0..state.0.len() {
            if state.1[slot].is_some() {
                continue;
            }
            for processor in 0..processor_count {
                let action = (slot, processor);
                actions.push(action);
                self.q_table.entry((state.clone(), action)).or_insert(0.0);
                self.action_n.entry(action).or_insert(0);
            }
        }
        actions
    }

    /// Learned value plus an upper-confidence exploration bonus; an action
    /// never tried wins immediately.
    fn ucb_action(&self, state: &StateKey, actions: &[Action], now: i64) -> Action {
        let ln_now = (now.max(1) as f64).ln();
        let mut best = actions[0];
        let mut best_ucb = f64::NEG_INFINITY;
        for &action in actions {
            let tried = self.action_n[&action];
            if tried == 0 {
                return action;
            }
            let ucb = self.q_table[&(state.clone(), action)]
                + self.lambda_weight * (ln_now / tried as f64).sqrt();
            if ucb > best_ucb {
                best_ucb = ucb;
                best = action;
            }
        }
        best
    }

    fn push_reward(&mut self, reward: f64) {
        if self.last_rewards.is_empty() {
            self.last_rewards = vec![reward; REWARD_WINDOW];
        } else {
            self.last_rewards[self.last_rewards_index] = reward;
        }
        self.last_rewards_index = (self.last_rewards_index + 1) % REWARD_WINDOW;
    }

    /// λ shrinks as reward variance rises, damping exploration when
    /// outcomes are noisy.
    fn update_lambda(&mut self) {
        let len = self.last_rewards.len() as f64;
        let mean = self.last_rewards.iter().sum::<f64>() / len;
        let variance = self
            .last_rewards
            .iter()
            .map(|r| (r - mean) * (r - mean))
            .sum::<f64>();
        self.lambda_weight = 1.0 / (1.0 + variance / len);
    }

    /// QoS of one speculative trajectory: binary for HARD tasks, the
    /// throughput-weighted fraction of execution before the deadline for
    /// FIRM and SOFT.
    fn qos(&self, state: &SchedState, key: TaskKey, placements: &[Placement], remaining: i64) -> f64 {
        let task = &state.arena[key];
        let deadline = task.absolute_deadline;
        if task.criticality == Criticality::Hard {
            let finish = placements.last().map(|p| p.end).unwrap_or(i64::MAX);
            return if finish <= deadline { 1.0 } else { 0.0 };
        }
        let mut before = 0i64;
        let mut after = remaining;
        for placement in placements {
            let processor = &state.processors[placement.processor as usize];
            if placement.end <= deadline {
                before += processor.execution_cost(placement.end - placement.start);
            } else if placement.start < deadline && deadline < placement.end {
                before += processor.execution_cost(deadline - placement.start);
                after += processor.execution_cost(placement.end - deadline);
            } else {
                after += processor.execution_cost(placement.end - placement.start);
            }
        }
        if before == 0 {
            0.0
        } else {
            before as f64 / (before + after) as f64
        }
    }

    /// Reward = 0.5 × normalized QoS + 0.5 × deadline term, recomputed over
    /// every ready task's speculative placements. Both sensitivities are
    /// re-estimated online from the running statistics.
    fn reward(&mut self, state: &SchedState, ready: &[TaskKey], stage: &Stage) -> f64 {
        let mut reward_deadline = 0.0;
        let mut qos_sum = 0.0;
        let mut max_d = 0.0f64;
        let mut min_d = f64::INFINITY;
        let mut max_r = f64::NEG_INFINITY;
        let mut min_r = f64::INFINITY;

        for (slot, &key) in ready.iter().enumerate() {
            let placements = &stage.placements[slot];
            if placements.is_empty() {
                continue;
            }
            qos_sum += self.qos(state, key, placements, stage.remaining[slot]);

            let task = &state.arena[key];
            let finish = placements.last().map(|p| p.end).unwrap_or(i64::MAX);
            if finish <= task.absolute_deadline {
                let elapsed = (finish - task.arrival) as f64;
                let allowed = (task.absolute_deadline - task.arrival) as f64;
                if allowed <= 0.0 {
                    continue;
                }
                let mut term = 1.0 - (elapsed / allowed).powf(self.deadline_sensitivity);
                if task.criticality == Criticality::Firm {
                    term *= 2.0;
                }
                reward_deadline += term;
                max_r = max_r.max(term);
                min_r = min_r.min(term);
                max_d = max_d.max(allowed);
                min_d = min_d.min(allowed);
            }
        }

        let qos = qos_sum / ready.len() as f64;
        if self.qos_values.len() > 100 {
            self.qos_values.drain(..50);
        }
        self.qos_values.push(qos);

        let qos_mean = self.qos_values.iter().sum::<f64>() / self.qos_values.len() as f64;
        let qos_spread = self
            .qos_values
            .iter()
            .map(|v| (v - qos_mean) * (v - qos_mean))
            .sum::<f64>()
            .sqrt();
        let reward_qos = if qos_spread != 0.0 {
            self.qos_sensitivity = qos_mean / qos_spread;
            ((qos - qos_mean) / qos_spread) * (1.0 - (-qos / self.qos_sensitivity).exp())
        } else {
            0.0
        };

        if max_r > 0.0 && min_r > 0.0 && min_d > 0.0 && min_d.is_finite() && max_d > 2.0 * min_d {
            let denominator = ((max_d - min_d) / min_d).ln();
            if denominator != 0.0 {
                let sensitivity = (max_r / min_r).ln() / denominator;
                if sensitivity.is_finite() && sensitivity > 0.0 {
                    self.deadline_sensitivity = sensitivity;
                }
            }
        }

        0.5 * reward_qos + 0.5 * reward_deadline
    }

    fn apply_action(&self, state: &SchedState, ready: &[TaskKey], stage: &mut Stage, action: Action, now: i64) {
        let (slot, processor) = action;
        let key = ready[slot];
        let p = &state.processors[processor];
        let exec = p.execution_time(stage.remaining[slot]);
        let committed_tail = p.tail_end();
        let staged_tail = stage.tails[processor].last().map(|a| a.end).unwrap_or(0);
        let start = now.max(committed_tail).max(staged_tail);
        stage.tails[processor].push(Allocation {
            task: key,
            start,
            end: start + exec,
        });
        stage.placements[slot].push(Placement {
            processor: processor as i64,
            start,
            end: start + exec,
        });
        stage.remaining[slot] = 0;
    }

    /// Runs the configured number of independent episodes from the last
    /// committed timelines and commits the winning trajectory.
    pub fn schedule_round(
        &mut self,
        state: &mut SchedState,
        ready: &[TaskKey],
        now: i64,
        rng: &mut StdRng,
    ) {
        if ready.is_empty() {
            return;
        }
        debug!(
            "adaptive round over {} ready tasks, value table {}",
            ready.len(),
            self.q_table.len()
        );
        let criticalities: Vec<Criticality> =
            ready.iter().map(|&k| state.arena[k].criticality).collect();
        let processor_count = state.processors.len();
        let load_indicator = ready.len() % processor_count.max(1);

        let mut winner: Option<Stage> = None;
        for _episode in 0..self.episodes {
            let mut stage = Stage::new(state, ready);
            let mut assigned: Vec<Option<usize>> = vec![None; ready.len()];
            let mut state_key: StateKey =
                (criticalities.clone(), assigned.clone(), load_indicator);

            while assigned.iter().any(Option::is_none) {
                let actions = self.legal_actions(&state_key, processor_count);
                let action = if rng.random::<f64>() < self.epsilon {
                    actions[rng.random_range(0..actions.len())]
                } else {
                    self.ucb_action(&state_key, &actions, now)
                };
                *self.action_n.entry(action).or_insert(0) += 1;

                self.apply_action(state, ready, &mut stage, action, now);
                let reward = self.reward(state, ready, &stage);
                stage.reward_total += reward;

                assigned[action.0] = Some(action.1);
                let next_key: StateKey = (criticalities.clone(), assigned.clone(), load_indicator);
                let next_actions = self.legal_actions(&next_key, processor_count);
                let max_next = next_actions
                    .iter()
                    .map(|a| self.q_table[&(next_key.clone(), *a)])
                    .fold(f64::NEG_INFINITY, f64::max);

                let current = self.q_table[&(state_key.clone(), action)];
                let updated = if next_actions.is_empty() {
                    current + self.alpha * reward
                } else {
                    current + self.alpha * (reward + self.gamma * max_next - current)
                };
                self.q_table.insert((state_key, action), updated);
                state_key = next_key;

                self.push_reward(reward);
                self.update_lambda();
            }

            self.epsilon = (self.epsilon * self.epsilon_decay).max(self.epsilon_min);
            let wins = winner
                .as_ref()
                .map_or(true, |best| stage.reward_total >= best.reward_total);
            if wins {
                winner = Some(stage);
            }
        }

        if let Some(stage) = winner {
            for (processor, staged) in stage.tails.into_iter().enumerate() {
                state.processors[processor].timeline.extend(staged);
            }
            for (slot, &key) in ready.iter().enumerate() {
                let task = &mut state.arena[key];
                task.placements.extend(stage.placements[slot].iter().copied());
                task.remaining_cost = stage.remaining[slot];
            }
        }
    }
}
