//! Device mobility simulation: the dispatcher only ever polls the latest
//! position through `PositionFeed`.
use rand::rngs::StdRng;
use rand::Rng;
use serde_derive::{Deserialize, Serialize};

const HISTORY_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalkMode {
    Random,
    HeavyTailed,
}

pub trait PositionFeed: Send + Sync {
    fn current_position(&self) -> (i64, i64);
}

impl PositionFeed for std::sync::Mutex<MobilityModel> {
    fn current_position(&self) -> (i64, i64) {
        self.lock().unwrap().current()
    }
}

fn clamp(value: i64, max: i64) -> i64 {
    value.max(0).min(max)
}

/// Unit steps in each axis, clamped to the arena.
pub fn random_walk(
    steps: usize,
    start: (i64, i64),
    max_position: (i64, i64),
    rng: &mut StdRng,
) -> (i64, i64) {
    let mut position = start;
    for _ in 0..steps {
        let dx = rng.random_range(-1i64..=1);
        let dy = rng.random_range(-1i64..=1);
        position = (
            clamp(position.0 + dx, max_position.0),
            clamp(position.1 + dy, max_position.1),
        );
    }
    position
}

/// Heavy-tailed step lengths with a uniform heading, clamped to the arena.
/// Step lengths are drawn by inverse transform from a power-law tail.
pub fn heavy_tailed_walk(
    steps: usize,
    start: (i64, i64),
    max_position: (i64, i64),
    scale: f64,
    rng: &mut StdRng,
) -> (i64, i64) {
    let mut position = start;
    for _ in 0..steps {
        let u = rng.random::<f64>().max(f64::EPSILON);
        let length = scale / (u * u);
        let theta = rng.random::<f64>() * std::f64::consts::TAU;
        let dx = (length * theta.cos()) as i64;
        let dy = (length * theta.sin()) as i64;
        position = (
            clamp(position.0 + dx, max_position.0),
            clamp(position.1 + dy, max_position.1),
        );
    }
    position
}

/// Position history of one simulated device, capped at the last
/// `HISTORY_LIMIT` samples.
#[derive(Debug, Clone)]
pub struct MobilityModel {
    mode: WalkMode,
    max_position: (i64, i64),
    scale: f64,
    history: Vec<(i64, i64)>,
}

impl MobilityModel {
    pub fn new(mode: WalkMode, start: (i64, i64), max_position: (i64, i64)) -> MobilityModel {
        MobilityModel {
            mode,
            max_position,
            scale: 2.0,
            history: vec![start],
        }
    }

    pub fn step(&mut self, steps: usize, rng: &mut StdRng) {
        let current = self.current();
        let next = match self.mode {
            WalkMode::Random => random_walk(steps, current, self.max_position, rng),
            WalkMode::HeavyTailed => {
                heavy_tailed_walk(steps, current, self.max_position, self.scale, rng)
            }
        };
        self.history.push(next);
        if self.history.len() > HISTORY_LIMIT {
            self.history.drain(..HISTORY_LIMIT / 2);
        }
    }

    pub fn current(&self) -> (i64, i64) {
        *self.history.last().unwrap()
    }

    pub fn last_positions(&self, max_count: usize) -> &[(i64, i64)] {
        let len = self.history.len();
        if max_count >= len {
            &self.history
        } else {
            &self.history[len - max_count..]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_random_walk_stays_in_bounds() {
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..50 {
            let position = random_walk(100, (0, 0), (10, 10), &mut rng);
            assert!(position.0 >= 0 && position.0 <= 10);
            assert!(position.1 >= 0 && position.1 <= 10);
        }
    }

    #[test]
    fn test_heavy_tailed_walk_stays_in_bounds() {
        let mut rng = StdRng::seed_from_u64(2);
        for _ in 0..50 {
            let position = heavy_tailed_walk(10, (500, 500), (1000, 1000), 2.0, &mut rng);
            assert!(position.0 >= 0 && position.0 <= 1000);
            assert!(position.1 >= 0 && position.1 <= 1000);
        }
    }

    #[test]
    fn test_history_is_capped() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut model = MobilityModel::new(WalkMode::Random, (5, 5), (10, 10));
        for _ in 0..500 {
            model.step(1, &mut rng);
        }
        assert!(model.history.len() <= HISTORY_LIMIT);
        assert_eq!(model.last_positions(10).len(), 10);
        assert_eq!(
            model.last_positions(10).last().copied().unwrap(),
            model.current()
        );
    }
}
