//! Processor descriptor and its ordered allocation timeline.
use getset::CopyGetters;
use serde_derive::{Deserialize, Serialize};

use crate::error::SchedulerError;
use crate::task::TaskKey;

/// One record of the timeline: a task occupying `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub task: TaskKey,
    pub start: i64,
    pub end: i64,
}

/// Static description of one processor group, as read from the run config.
/// Expanded into `cores` identical `Processor` instances at session start.
#[derive(Debug, Clone, Serialize, Deserialize, CopyGetters)]
pub struct ProcessorSpec {
    #[getset(get_copy = "pub")]
    cores: usize,
    /// Execution rate in MI per millisecond.
    #[getset(get_copy = "pub")]
    rate: f64,
    #[getset(get_copy = "pub")]
    memory: i64,
    #[getset(get_copy = "pub")]
    active_power: f64,
    #[getset(get_copy = "pub")]
    idle_power: f64,
}

impl ProcessorSpec {
    pub fn new(cores: usize, rate: f64, memory: i64, active_power: f64, idle_power: f64) -> Self {
        ProcessorSpec {
            cores,
            rate,
            memory,
            active_power,
            idle_power,
        }
    }

    pub fn build(&self) -> Vec<Processor> {
        (0..self.cores)
            .map(|id| {
                Processor::new(id, self.rate, self.memory, self.active_power, self.idle_power)
            })
            .collect()
    }
}

impl Default for ProcessorSpec {
    fn default() -> Self {
        // Quad-core 1.5 MI/ms edge device profile.
        ProcessorSpec::new(4, 1.5, 2048, 8.0, 2.7)
    }
}

#[derive(Debug, Clone)]
pub struct Processor {
    pub id: usize,
    pub rate: f64,
    pub memory: i64,
    pub active_power: f64,
    pub idle_power: f64,
    /// Sorted by start time; records never overlap outside a preemption split.
    pub timeline: Vec<Allocation>,
}

impl Processor {
    pub fn new(id: usize, rate: f64, memory: i64, active_power: f64, idle_power: f64) -> Self {
        Processor {
            id,
            rate,
            memory,
            active_power,
            idle_power,
            timeline: Vec::new(),
        }
    }

    /// Milliseconds needed to execute `cost` MI, rounded up.
    pub fn execution_time(&self, cost: i64) -> i64 {
        (cost as f64 / self.rate).ceil() as i64
    }

    /// MI executed over `duration` milliseconds, rounded down. Rounding in
    /// both conversions goes in the processor's favor so remaining cost can
    /// never go negative.
    pub fn execution_cost(&self, duration: i64) -> i64 {
        (self.rate * duration as f64).floor() as i64
    }

    pub fn tail_end(&self) -> i64 {
        self.timeline.last().map(|a| a.end).unwrap_or(0)
    }

    pub fn busy_time(&self) -> i64 {
        self.timeline.iter().map(|a| a.end - a.start).sum()
    }

    pub fn verify_timeline(&self) -> Result<(), SchedulerError> {
        for pair in self.timeline.windows(2) {
            if pair[1].start < pair[0].end {
                return Err(SchedulerError::Invariant {
                    processor: self.id,
                    detail: format!(
                        "allocation [{}, {}) overlaps [{}, {})",
                        pair[1].start, pair[1].end, pair[0].start, pair[0].end
                    ),
                });
            }
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        self.timeline.clear();
    }
}
