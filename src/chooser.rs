//! The strategy chooser: picks the best strategy among a
//! registered set by ranking singular strategies on expected time, then
//! checking whether any redundant strategy's net benefit over the best
//! singular strategy is positive.

use std::sync::Mutex;

use crate::eval::{ComparisonType, Evaluator};
use crate::strategy::Strategy;
use crate::weights::ResourceWeights;

/// Caches the winning strategy's identity and its `t*` from the most recent
/// [`choose`](Chooser::choose)/[`choose_nonredundant`](Chooser::choose_nonredundant)
/// call, backing `get_last_strategy_time`.
#[derive(Debug, Clone, Copy)]
struct LastChoice {
    strategy_identity: usize,
    time: f64,
}

pub struct Chooser {
    strategies: Vec<Strategy>,
    weights: std::sync::Arc<ResourceWeights>,
    last: Mutex<Option<LastChoice>>,
}

impl Chooser {
    pub fn new(strategies: Vec<Strategy>, weights: std::sync::Arc<ResourceWeights>) -> Self {
        Chooser {
            strategies,
            weights,
            last: Mutex::new(None),
        }
    }

    fn singular_times(
        &self,
        evaluator: &dyn Evaluator,
        chooser_arg: f64,
    ) -> Vec<(Strategy, f64)> {
        self.strategies
            .iter()
            .filter(|s| !s.is_redundant())
            .map(|s| (s.clone(), s.calculate_time(evaluator, chooser_arg, ComparisonType::SingularToSingular)))
            .collect()
    }

    fn best_singular(&self, evaluator: &dyn Evaluator, chooser_arg: f64) -> Option<(Strategy, f64)> {
        self.singular_times(evaluator, chooser_arg)
            .into_iter()
            .min_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
    }

    /// Among redundant strategies, pick the one
    /// whose net benefit over `best_singular` is positive and maximal.
    fn best_redundant(
        &self,
        evaluator: &dyn Evaluator,
        chooser_arg: f64,
        best_singular: &Strategy,
        best_singular_time: f64,
    ) -> Option<(Strategy, f64)> {
        let best_singular_time_vs_redundant =
            best_singular.calculate_time(evaluator, chooser_arg, ComparisonType::SingularToRedundant);
        let best_singular_cost =
            best_singular.calculate_cost(evaluator, chooser_arg, &self.weights, ComparisonType::SingularToRedundant);

        self.strategies
            .iter()
            .filter(|s| s.is_redundant())
            .filter_map(|r| {
                let r_time = r.calculate_time(evaluator, chooser_arg, ComparisonType::SingularToRedundant);
                let r_cost = r.calculate_cost(evaluator, chooser_arg, &self.weights, ComparisonType::SingularToRedundant);
                let benefit = best_singular_time_vs_redundant - r_time;
                let extra_cost = r_cost - best_singular_cost;
                let net = benefit - extra_cost;
                (net > 0.0).then(|| (r.clone(), net))
            })
            .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
    }

    /// Full choice: ranks singular strategies, then checks whether any
    /// redundant strategy beats the winner on net benefit.
    pub fn choose(&self, evaluator: &dyn Evaluator, chooser_arg: f64) -> Option<Strategy> {
        let (best_singular, best_singular_time) = self.best_singular(evaluator, chooser_arg)?;
        let winner = match self.best_redundant(evaluator, chooser_arg, &best_singular, best_singular_time) {
            Some((redundant, _net)) => redundant,
            None => best_singular,
        };
        let winner_time = winner.calculate_time(evaluator, chooser_arg, ComparisonType::SingularToSingular);
        *self.last.lock().unwrap() = Some(LastChoice {
            strategy_identity: winner.identity(),
            time: winner_time,
        });
        Some(winner)
    }

    /// Skips the redundant net-benefit comparison.
    pub fn choose_nonredundant(&self, evaluator: &dyn Evaluator, chooser_arg: f64) -> Option<Strategy> {
        let (best_singular, best_singular_time) = self.best_singular(evaluator, chooser_arg)?;
        *self.last.lock().unwrap() = Some(LastChoice {
            strategy_identity: best_singular.identity(),
            time: best_singular_time,
        });
        Some(best_singular)
    }

    /// Cached `t*` of the most recent `choose`/`choose_nonredundant` call for
    /// the given strategy, if it was the winner of that call.
    pub fn get_last_strategy_time(&self, strategy: &Strategy) -> Option<f64> {
        self.last.lock().unwrap().and_then(|last| {
            (last.strategy_identity == strategy.identity()).then_some(last.time)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::oracle::TrustedOracle;
    use crate::strategy::{cost_fn, SingularStrategy};
    use std::sync::Arc;

    fn const_fn(v: f64) -> Arc<dyn crate::strategy::CostFn> {
        cost_fn(move |_ctx, _strategy_arg, _chooser_arg| v)
    }

    fn singular(name: &str, time: f64) -> Strategy {
        let s = SingularStrategy::new(name, const_fn(time), const_fn(0.0), const_fn(0.0), 0.0, 0.0);
        Strategy::Singular(s)
    }

    #[test]
    fn picks_fastest_singular_strategy() {
        let fast = singular("fast", 1.0);
        let slow = singular("slow", 5.0);
        let chooser = Chooser::new(vec![fast.clone(), slow], ResourceWeights::fixed(1.0, 1.0));
        let evaluator = TrustedOracle::new();
        let winner = chooser.choose_nonredundant(&*evaluator, 0.0).unwrap();
        assert_eq!(winner.name(), fast.name());
        assert_eq!(chooser.get_last_strategy_time(&winner), Some(1.0));
    }
}
