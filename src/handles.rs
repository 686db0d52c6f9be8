//! Public functional surface, expressed as idiomatic Rust functions and
//! constructors over the opaque handle types already defined in their
//! owning modules (`EstimatorHandle`, `Strategy`, `AnyEvaluator`,
//! `ScheduledReevalHandle`, `Dist`). There is no explicit free/release
//! function here: handles release their resources on `Drop`.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use crate::chooser::Chooser;
use crate::error::Result;
use crate::estimator::{ConditionKind, EstimatorHandle};
use crate::eval::bayesian::BayesianEvaluator;
use crate::eval::confidence::ConfidenceBoundsEvaluator;
use crate::eval::empirical::EmpiricalErrorEvaluator;
use crate::eval::oracle::TrustedOracle;
use crate::eval::{AnyEvaluator, EvalMethod};
use crate::persistence::{restore_evaluator, save_evaluator};
use crate::scheduler::{ScheduledReevalHandle, Scheduler};
use crate::strategy::{CostFn, RedundantStrategy, SingularStrategy, Strategy};
use crate::weights::ResourceWeights;

pub fn make_strategy(
    name: impl Into<String>,
    time_fn: Arc<dyn CostFn>,
    energy_fn: Arc<dyn CostFn>,
    data_fn: Arc<dyn CostFn>,
    strategy_arg: f64,
    default_chooser_arg: f64,
) -> Strategy {
    Strategy::Singular(SingularStrategy::new(
        name,
        time_fn,
        energy_fn,
        data_fn,
        strategy_arg,
        default_chooser_arg,
    ))
}

pub fn make_redundant_strategy(name: impl Into<String>, children: Vec<Arc<SingularStrategy>>) -> Strategy {
    Strategy::Redundant(RedundantStrategy::new(name, children))
}

pub fn set_strategy_name(strategy: &Strategy, name: impl Into<String>) {
    strategy.set_name(name);
}

pub fn get_strategy_name(strategy: &Strategy) -> String {
    strategy.name()
}

pub fn create_external_estimator(name: &str) -> Result<EstimatorHandle> {
    EstimatorHandle::new_external(name)
}

pub fn add_observation(estimator: &EstimatorHandle, observation: f64, new_estimate: f64) {
    estimator.add_observation_external(observation, new_estimate);
}

pub fn set_estimator_range_hints(estimator: &EstimatorHandle, min: f64, max: f64, num_bins: usize) {
    estimator.set_range_hints(min, max, num_bins);
}

pub fn set_estimator_condition(estimator: &EstimatorHandle, kind: ConditionKind, v: f64) {
    estimator.set_condition(kind, v);
}

pub fn clear_estimator_conditions(estimator: &EstimatorHandle) {
    estimator.clear_conditions();
}

/// Creates an evaluator for `method` and subscribes it to every estimator
/// the registered strategies touch.
pub fn register_strategy_set_with_method(strategies: &[Strategy], method: EvalMethod) -> Arc<AnyEvaluator> {
    let evaluator = Arc::new(match method {
        EvalMethod::TrustedOracle => AnyEvaluator::Oracle(TrustedOracle::new()),
        EvalMethod::ConfidenceBounds { .. } => {
            AnyEvaluator::Confidence(ConfidenceBoundsEvaluator::new(method))
        }
        EvalMethod::Bayesian { .. } => {
            let bayesian = BayesianEvaluator::new(method);
            bayesian.register_strategies(strategies);
            AnyEvaluator::Bayesian(bayesian)
        }
        EvalMethod::EmpiricalError { .. } => {
            AnyEvaluator::Empirical(EmpiricalErrorEvaluator::new(method))
        }
    });
    let sink = evaluator.as_sink();
    for strategy in strategies {
        for (_, estimator) in strategy.uses() {
            estimator.subscribe(sink.clone());
        }
    }
    evaluator
}

/// `register_strategy_set` without an explicit method defaults to the
/// simplest evaluator, Trusted-Oracle.
pub fn register_strategy_set(strategies: &[Strategy]) -> Arc<AnyEvaluator> {
    register_strategy_set_with_method(strategies, EvalMethod::TrustedOracle)
}

pub fn choose_strategy(chooser: &Chooser, evaluator: &AnyEvaluator, chooser_arg: f64) -> Option<Strategy> {
    chooser.choose(evaluator, chooser_arg)
}

pub fn choose_nonredundant_strategy(
    chooser: &Chooser,
    evaluator: &AnyEvaluator,
    chooser_arg: f64,
) -> Option<Strategy> {
    chooser.choose_nonredundant(evaluator, chooser_arg)
}

pub fn choose_strategy_async(
    scheduler: &Scheduler,
    evaluator: Arc<AnyEvaluator>,
    chooser: Arc<Chooser>,
    chooser_arg: f64,
    callback: impl FnOnce(Option<Strategy>) + Send + 'static,
) {
    scheduler.choose_strategy_async(evaluator, chooser, chooser_arg, callback);
}

pub fn schedule_reevaluation(
    scheduler: &Scheduler,
    evaluator: Arc<AnyEvaluator>,
    chooser: Arc<Chooser>,
    chooser_arg: f64,
    pre: impl FnOnce() + Send + 'static,
    post: impl FnOnce(Option<Strategy>) + Send + 'static,
    seconds_in_future: f64,
) -> ScheduledReevalHandle {
    scheduler.schedule_reevaluation(evaluator, chooser, chooser_arg, pre, post, seconds_in_future)
}

pub fn save_evaluator_to(evaluator: &AnyEvaluator, path: impl AsRef<Path>) -> Result<()> {
    save_evaluator(evaluator, path)
}

pub fn restore_evaluator_from(evaluator: &AnyEvaluator, path: impl AsRef<Path>) -> Result<()> {
    restore_evaluator(evaluator, path)
}

pub fn set_fixed_resource_weights(weights: &ResourceWeights, energy: f64, data: f64) {
    weights.set_fixed(energy, data);
}

pub fn set_resource_budgets(goal_time: Instant, energy_budget: f64, data_budget: f64) -> Arc<ResourceWeights> {
    ResourceWeights::goal_adaptive(energy_budget, data_budget, goal_time)
}

pub fn report_spent_energy(weights: &ResourceWeights, amount: f64) {
    weights.report_spent_energy(amount);
}

pub fn report_spent_data(weights: &ResourceWeights, amount: f64) {
    weights.report_spent_data(amount);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::cost_fn;

    #[test]
    fn make_strategy_and_choose_round_trip() {
        let bw = create_external_estimator("bw").unwrap();
        add_observation(&bw, 5000.0, 5000.0);
        let bw2 = bw.clone();
        let time = cost_fn(move |ctx, sarg, _carg| sarg / ctx.value(&bw2));
        let zero = cost_fn(|_c, _s, _a| 0.0);
        let strategy = make_strategy("only", time, zero.clone(), zero, 4000.0, 0.0);
        set_strategy_name(&strategy, "renamed");
        assert_eq!(get_strategy_name(&strategy), "renamed");

        let evaluator = register_strategy_set(&[strategy.clone()]);
        let weights = ResourceWeights::fixed(1.0, 1.0);
        let chooser = Chooser::new(vec![strategy.clone()], weights);
        let winner = choose_strategy(&chooser, &evaluator, 0.0).unwrap();
        assert_eq!(winner.name(), "renamed");
    }
}
