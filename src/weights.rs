//! Resource weights: project energy/data costs onto a scalar
//! objective. Two policies — caller-fixed weights, or goal-adaptive weights
//! a background thread re-tunes once a second against a spending budget and
//! a deadline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const EWMA_SWITCH_THRESHOLD: u64 = 100;
const VARIABLE_BUFFER_WEIGHT: f64 = 0.05;
const CONSTANT_BUFFER_WEIGHT: f64 = 0.08;
const UPDATE_INTERVAL: Duration = Duration::from_secs(1);

/// Really large but finite, so a degenerate "spend everything" weight never
/// overflows arithmetic downstream.
fn prohibitive_upper() -> f64 {
    2f64.powi(200)
}

fn seconds_until(deadline: Instant, now: Instant) -> f64 {
    if now <= deadline {
        deadline.duration_since(now).as_secs_f64()
    } else {
        -now.duration_since(deadline).as_secs_f64()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Energy,
    Data,
}

/// Per-resource goal-adaptive bookkeeping: a spending-rate EWMA (arithmetic
/// mean for the first [`EWMA_SWITCH_THRESHOLD`] samples, then exponential)
/// and the weight it implies against a remaining supply and deadline.
#[derive(Debug)]
struct GoalAdaptiveState {
    kind: ResourceKind,
    initial_supply: f64,
    last_supply: f64,
    goal_deadline: Instant,
    last_sample_at: Instant,
    last_spending_rate: f64,
    spending_rate_update_count: u64,
    weight: f64,
}

impl GoalAdaptiveState {
    fn new(kind: ResourceKind, supply: f64, goal_deadline: Instant) -> Self {
        let now = Instant::now();
        let seconds_until_goal = seconds_until(goal_deadline, now);
        let last_spending_rate = if seconds_until_goal != 0.0 {
            supply / seconds_until_goal
        } else {
            0.0
        };
        // Large starting weight: spend the entire budget to save a span as
        // long as the whole remaining goal.
        let weight = if supply != 0.0 {
            seconds_until_goal / supply
        } else {
            prohibitive_upper()
        };
        log::info!(
            "{kind:?} goal-adaptive weight created: supply {supply}, seconds_until_goal {seconds_until_goal}, initial weight {weight}"
        );
        GoalAdaptiveState {
            kind,
            initial_supply: supply,
            last_supply: supply,
            goal_deadline,
            last_sample_at: now,
            last_spending_rate,
            spending_rate_update_count: 1,
            weight,
        }
    }

    fn adjusted_supply(&self, supply: f64) -> f64 {
        supply - (VARIABLE_BUFFER_WEIGHT * supply + CONSTANT_BUFFER_WEIGHT * self.initial_supply)
    }

    /// Zero is the most aggressive weight, but a weight of exactly zero
    /// never recovers (it only ever gets multiplied). Use something tiny
    /// but scaled to the budget instead.
    fn aggressive_lower(&self) -> f64 {
        0.01 / self.initial_supply
    }

    fn smoothing_factor(&self, now: Instant) -> f64 {
        if now > self.goal_deadline {
            0.0
        } else {
            2f64.powf(-1.0 / (0.1 * seconds_until(self.goal_deadline, now)))
        }
    }

    fn next_spending_rate(&self, rate_sample: f64, now: Instant) -> f64 {
        if self.spending_rate_update_count < EWMA_SWITCH_THRESHOLD {
            let n = self.spending_rate_update_count as f64;
            (self.last_spending_rate * n + rate_sample) / (n + 1.0)
        } else {
            let alpha = self.smoothing_factor(now);
            (1.0 - alpha) * rate_sample + alpha * self.last_spending_rate
        }
    }

    fn record_spent(&mut self, amount: f64) {
        let now = Instant::now();
        let sample_period = now.duration_since(self.last_sample_at).as_secs_f64().max(f64::EPSILON);
        self.last_sample_at = now;
        let rate_sample = amount / sample_period;
        self.last_spending_rate = self.next_spending_rate(rate_sample, now);
        self.spending_rate_update_count += 1;
        self.last_supply -= amount;
        log::debug!(
            "{:?} spent {amount} over {sample_period}s: rate {}  supply {}",
            self.kind,
            self.last_spending_rate,
            self.last_supply
        );
    }

    fn new_weight(&self, old_weight: f64, supply: f64, spending_rate: f64, now: Instant) -> f64 {
        let adjusted = self.adjusted_supply(supply);
        if supply <= 0.0 || adjusted <= 0.0 || now > self.goal_deadline {
            return prohibitive_upper();
        }
        let future_demand = spending_rate * seconds_until(self.goal_deadline, now);
        let mut w = old_weight * (future_demand / adjusted);
        w = w.max(self.aggressive_lower());
        w = w.min(prohibitive_upper());
        w
    }

    fn tick(&mut self) {
        let now = Instant::now();
        self.weight = self.new_weight(self.weight, self.last_supply, self.last_spending_rate, now);
        log::debug!("{:?} weight updated to {}", self.kind, self.weight);
    }
}

enum Policy {
    Fixed { energy: f64, data: f64 },
    GoalAdaptive { energy: GoalAdaptiveState, data: GoalAdaptiveState },
}

/// Resource-weight source the chooser consults every `calculate_cost`.
/// Goal-adaptive weights are re-tuned by a background
/// thread spawned at construction and stopped by [`shutdown`](Self::shutdown).
pub struct ResourceWeights {
    inner: Mutex<Policy>,
    running: Arc<AtomicBool>,
    updater: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ResourceWeights {
    pub fn fixed(energy: f64, data: f64) -> Arc<Self> {
        Arc::new(ResourceWeights {
            inner: Mutex::new(Policy::Fixed { energy, data }),
            running: Arc::new(AtomicBool::new(false)),
            updater: Mutex::new(None),
        })
    }

    /// `goal_deadline` is when the goal must be met; `energy_budget`/
    /// `data_budget` are the total remaining supply of each resource.
    pub fn goal_adaptive(energy_budget: f64, data_budget: f64, goal_deadline: Instant) -> Arc<Self> {
        let weights = Arc::new(ResourceWeights {
            inner: Mutex::new(Policy::GoalAdaptive {
                energy: GoalAdaptiveState::new(ResourceKind::Energy, energy_budget, goal_deadline),
                data: GoalAdaptiveState::new(ResourceKind::Data, data_budget, goal_deadline),
            }),
            running: Arc::new(AtomicBool::new(true)),
            updater: Mutex::new(None),
        });
        let handle = {
            let weights = weights.clone();
            let running = weights.running.clone();
            thread::spawn(move || {
                while running.load(Ordering::Acquire) {
                    thread::sleep(UPDATE_INTERVAL);
                    if !running.load(Ordering::Acquire) {
                        break;
                    }
                    if let Policy::GoalAdaptive { energy, data } = &mut *weights.inner.lock().unwrap() {
                        energy.tick();
                        data.tick();
                    }
                }
            })
        };
        *weights.updater.lock().unwrap() = Some(handle);
        weights
    }

    /// Returns `(energy_weight, data_weight)`.
    pub fn current(&self) -> (f64, f64) {
        match &*self.inner.lock().unwrap() {
            Policy::Fixed { energy, data } => (*energy, *data),
            Policy::GoalAdaptive { energy, data } => (energy.weight, data.weight),
        }
    }

    pub fn set_fixed(&self, energy: f64, data: f64) {
        let mut guard = self.inner.lock().unwrap();
        *guard = Policy::Fixed { energy, data };
    }

    pub fn report_spent_energy(&self, amount: f64) {
        if let Policy::GoalAdaptive { energy, .. } = &mut *self.inner.lock().unwrap() {
            energy.record_spent(amount);
        }
    }

    pub fn report_spent_data(&self, amount: f64) {
        if let Policy::GoalAdaptive { data, .. } = &mut *self.inner.lock().unwrap() {
            data.record_spent(amount);
        }
    }

    /// Stops and joins the periodic updater thread, if one is running.
    /// Idempotent.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.updater.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ResourceWeights {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_weights_are_stable() {
        let w = ResourceWeights::fixed(1.0, 2.0);
        assert_eq!(w.current(), (1.0, 2.0));
    }

    #[test]
    fn exhausted_supply_forces_prohibitive_weight() {
        let past = Instant::now();
        let w = ResourceWeights::goal_adaptive(100.0, 100.0, past);
        w.shutdown();
        let state = GoalAdaptiveState::new(ResourceKind::Energy, 100.0, past);
        let now = Instant::now();
        let weight = state.new_weight(state.weight, -1.0, state.last_spending_rate, now);
        assert_eq!(weight, prohibitive_upper());
        let _ = w.current();
    }

    #[test]
    fn report_spent_reduces_supply() {
        let deadline = Instant::now() + Duration::from_secs(3600);
        let w = ResourceWeights::goal_adaptive(1000.0, 1000.0, deadline);
        w.report_spent_energy(10.0);
        if let Policy::GoalAdaptive { energy, .. } = &*w.inner.lock().unwrap() {
            assert!((energy.last_supply - 990.0).abs() < 1e-6);
        } else {
            panic!("expected goal-adaptive policy");
        }
        w.shutdown();
    }
}
