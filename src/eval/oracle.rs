//! Trusted-Oracle evaluator: no iteration, no error model —
//! `expected_value` is just `f` applied to raw point estimates. Its
//! "pick by lowest expected time" logic is also reused, in the same
//! shape, as the Bayesian evaluator's internal sub-evaluator.

use std::sync::Arc;

use super::{ComparisonType, Evaluator};
use crate::estimator::{Estimator, EstimatorHandle, Observation, ObservationSink};
use crate::strategy::{CostFn, EvalContext, SingularStrategy};

#[derive(Debug, Default)]
pub struct TrustedOracle;

struct OracleContext;

impl EvalContext for OracleContext {
    fn value(&self, estimator: &EstimatorHandle) -> f64 {
        estimator.get_estimate()
    }
}

impl TrustedOracle {
    pub fn new() -> Arc<Self> {
        Arc::new(TrustedOracle)
    }
}

impl Evaluator for TrustedOracle {
    fn adjusted_estimator_value(&self, estimator: &EstimatorHandle) -> f64 {
        estimator.get_estimate()
    }

    fn expected_value_singular(
        &self,
        _strategy: &SingularStrategy,
        fn_: &Arc<dyn CostFn>,
        strategy_arg: f64,
        chooser_arg: f64,
        _comparison: ComparisonType,
    ) -> f64 {
        fn_.call(&OracleContext, strategy_arg, chooser_arg)
    }
}

impl ObservationSink for TrustedOracle {
    fn sink_id(&self) -> u64 {
        self as *const _ as u64
    }
    fn observation_added(&self, _estimator: &Estimator, _obs: Observation) {}
    fn conditions_changed(&self, _estimator: &Estimator) {}
    fn forget(&self, _estimator_name: &str) {}
}

/// Nothing to persist: the oracle carries no state beyond the estimators it
/// reads live.
impl super::Persist for TrustedOracle {
    fn save_to(&self, _out: &mut dyn std::io::Write) -> std::io::Result<()> {
        Ok(())
    }
    fn restore_from(&self, _input: &mut dyn std::io::BufRead) -> crate::error::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::cost_fn;

    #[test]
    fn expected_value_matches_point_estimates() {
        let bw = EstimatorHandle::new_last_observation("oracle_point_estimate_bw").unwrap();
        bw.add_observation(5000.0);
        let lat = EstimatorHandle::new_last_observation("oracle_point_estimate_lat").unwrap();
        lat.add_observation(1.0);

        let bw2 = bw.clone();
        let lat2 = lat.clone();
        let time = cost_fn(move |ctx, sarg, _carg| sarg / ctx.value(&bw2) + ctx.value(&lat2));
        let s = SingularStrategy::new(
            "s",
            time,
            cost_fn(|_c, _s, _a| 0.0),
            cost_fn(|_c, _s, _a| 0.0),
            4000.0,
            0.0,
        );
        let oracle = TrustedOracle::new();
        let v: f64 = oracle.expected_value_singular(
            &s,
            &s.time_fn,
            s.strategy_arg,
            0.0,
            ComparisonType::SingularToSingular,
        );
        assert!((v - (4000.0 / 5000.0 + 1.0)).abs() < 1e-9);
    }
}
