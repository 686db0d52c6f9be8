//! The evaluator family: interchangeable models of the
//! joint distribution over estimators, all implementing [`Evaluator`].

pub mod bayesian;
pub mod confidence;
pub mod empirical;
pub mod oracle;

use std::sync::Arc;

pub use crate::distribution::DistributionKind;
use crate::distribution::ErrorMode;
use crate::estimator::{EstimatorHandle, ObservationSink};
use crate::strategy::{CombinerKind, CostFn, SingularStrategy, Strategy};

/// Closed set of evaluation methods a caller can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalMethod {
    TrustedOracle,
    ConfidenceBounds {
        weighted: bool,
        mode: ErrorMode,
    },
    Bayesian {
        weighted: bool,
    },
    EmpiricalError {
        distribution: DistributionKind,
        weighted: bool,
        mode: ErrorMode,
    },
}

/// Distinguishes, at the call site, whether an expected-value query is
/// ranking one singular strategy against other singular strategies, or
/// computing a singular strategy's bound for comparison against a
/// redundant candidate's net-benefit. Only the
/// Confidence-Bounds evaluator's bound-type selection depends on this; all
/// other evaluators ignore it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComparisonType {
    SingularToSingular,
    SingularToRedundant,
}

/// Common interface every evaluator implements. `expected_value_singular` is
/// the model-specific part; the default `expected_value` wires in the
/// redundant-strategy combine path so individual evaluators only need to
/// override it when they can do better than the naive per-child combine
/// (the Empirical-Error evaluator does, via memoization).
pub trait Evaluator: Send + Sync {
    fn adjusted_estimator_value(&self, estimator: &EstimatorHandle) -> f64;

    fn expected_value_singular(
        &self,
        strategy: &SingularStrategy,
        fn_: &Arc<dyn CostFn>,
        strategy_arg: f64,
        chooser_arg: f64,
        comparison: ComparisonType,
    ) -> f64;

    fn expected_value(
        &self,
        strategy: &Strategy,
        fn_: &Arc<dyn CostFn>,
        strategy_arg: f64,
        chooser_arg: f64,
        comparison: ComparisonType,
    ) -> f64 {
        match strategy {
            Strategy::Singular(s) => {
                self.expected_value_singular(s, fn_, strategy_arg, chooser_arg, comparison)
            }
            Strategy::Redundant(r) => default_combine(self, r, fn_, chooser_arg),
        }
    }
}

/// The naive (non-memoized) redundant combine: evaluate each child
/// independently against the per-resource cost fn matching `kind`, then
/// combine (`min` for time, `sum` for energy/data).
pub fn default_combine(
    evaluator: &(impl Evaluator + ?Sized),
    redundant: &crate::strategy::RedundantStrategy,
    fn_: &Arc<dyn CostFn>,
    chooser_arg: f64,
) -> f64 {
    let kind = fn_
        .combiner()
        .expect("redundant strategies must be queried with a tagged combiner fn");
    let values: Vec<f64> = redundant
        .children
        .iter()
        .map(|child| {
            evaluator.expected_value_singular(
                child,
                child.fn_for(kind),
                child.strategy_arg,
                chooser_arg,
                ComparisonType::SingularToSingular,
            )
        })
        .collect();
    combine(kind, &values)
}

pub fn combine(kind: CombinerKind, values: &[f64]) -> f64 {
    match kind {
        CombinerKind::MinTime => values.iter().cloned().fold(f64::INFINITY, f64::min),
        CombinerKind::SumEnergy | CombinerKind::SumData => values.iter().sum(),
    }
}

/// Internal trait bridging an evaluator's persistence to the line-oriented
/// save/restore format.
pub trait Persist {
    fn save_to(&self, out: &mut dyn std::io::Write) -> std::io::Result<()>;
    fn restore_from(&self, input: &mut dyn std::io::BufRead) -> crate::error::Result<()>;
}

/// The closed set of concrete evaluators, tagged rather than open
/// subclasses.
pub enum AnyEvaluator {
    Oracle(Arc<oracle::TrustedOracle>),
    Empirical(Arc<empirical::EmpiricalErrorEvaluator>),
    Confidence(Arc<confidence::ConfidenceBoundsEvaluator>),
    Bayesian(Arc<bayesian::BayesianEvaluator>),
}

impl AnyEvaluator {
    pub(crate) fn as_sink(self: &Arc<Self>) -> Arc<dyn ObservationSink> {
        self.clone()
    }
}

impl Evaluator for AnyEvaluator {
    fn adjusted_estimator_value(&self, estimator: &EstimatorHandle) -> f64 {
        match self {
            AnyEvaluator::Oracle(e) => e.adjusted_estimator_value(estimator),
            AnyEvaluator::Empirical(e) => e.adjusted_estimator_value(estimator),
            AnyEvaluator::Confidence(e) => e.adjusted_estimator_value(estimator),
            AnyEvaluator::Bayesian(e) => e.adjusted_estimator_value(estimator),
        }
    }

    fn expected_value_singular(
        &self,
        strategy: &SingularStrategy,
        fn_: &Arc<dyn CostFn>,
        strategy_arg: f64,
        chooser_arg: f64,
        comparison: ComparisonType,
    ) -> f64 {
        match self {
            AnyEvaluator::Oracle(e) => {
                e.expected_value_singular(strategy, fn_, strategy_arg, chooser_arg, comparison)
            }
            AnyEvaluator::Empirical(e) => {
                e.expected_value_singular(strategy, fn_, strategy_arg, chooser_arg, comparison)
            }
            AnyEvaluator::Confidence(e) => {
                e.expected_value_singular(strategy, fn_, strategy_arg, chooser_arg, comparison)
            }
            AnyEvaluator::Bayesian(e) => {
                e.expected_value_singular(strategy, fn_, strategy_arg, chooser_arg, comparison)
            }
        }
    }

    fn expected_value(
        &self,
        strategy: &Strategy,
        fn_: &Arc<dyn CostFn>,
        strategy_arg: f64,
        chooser_arg: f64,
        comparison: ComparisonType,
    ) -> f64 {
        match self {
            AnyEvaluator::Oracle(e) => {
                e.expected_value(strategy, fn_, strategy_arg, chooser_arg, comparison)
            }
            AnyEvaluator::Empirical(e) => {
                e.expected_value(strategy, fn_, strategy_arg, chooser_arg, comparison)
            }
            AnyEvaluator::Confidence(e) => {
                e.expected_value(strategy, fn_, strategy_arg, chooser_arg, comparison)
            }
            AnyEvaluator::Bayesian(e) => {
                e.expected_value(strategy, fn_, strategy_arg, chooser_arg, comparison)
            }
        }
    }
}

impl Persist for AnyEvaluator {
    fn save_to(&self, out: &mut dyn std::io::Write) -> std::io::Result<()> {
        match self {
            AnyEvaluator::Oracle(e) => e.save_to(out),
            AnyEvaluator::Empirical(e) => e.save_to(out),
            AnyEvaluator::Confidence(e) => e.save_to(out),
            AnyEvaluator::Bayesian(e) => e.save_to(out),
        }
    }

    fn restore_from(&self, input: &mut dyn std::io::BufRead) -> crate::error::Result<()> {
        match self {
            AnyEvaluator::Oracle(e) => e.restore_from(input),
            AnyEvaluator::Empirical(e) => e.restore_from(input),
            AnyEvaluator::Confidence(e) => e.restore_from(input),
            AnyEvaluator::Bayesian(e) => e.restore_from(input),
        }
    }
}

impl ObservationSink for AnyEvaluator {
    fn sink_id(&self) -> u64 {
        match self {
            AnyEvaluator::Oracle(e) => Arc::as_ptr(e) as u64,
            AnyEvaluator::Empirical(e) => Arc::as_ptr(e) as u64,
            AnyEvaluator::Confidence(e) => Arc::as_ptr(e) as u64,
            AnyEvaluator::Bayesian(e) => Arc::as_ptr(e) as u64,
        }
    }

    fn observation_added(&self, estimator: &crate::estimator::Estimator, obs: crate::estimator::Observation) {
        match self {
            AnyEvaluator::Oracle(e) => e.observation_added(estimator, obs),
            AnyEvaluator::Empirical(e) => e.observation_added(estimator, obs),
            AnyEvaluator::Confidence(e) => e.observation_added(estimator, obs),
            AnyEvaluator::Bayesian(e) => e.observation_added(estimator, obs),
        }
    }

    fn conditions_changed(&self, estimator: &crate::estimator::Estimator) {
        match self {
            AnyEvaluator::Oracle(e) => e.conditions_changed(estimator),
            AnyEvaluator::Empirical(e) => e.conditions_changed(estimator),
            AnyEvaluator::Confidence(e) => e.conditions_changed(estimator),
            AnyEvaluator::Bayesian(e) => e.conditions_changed(estimator),
        }
    }

    fn forget(&self, estimator_name: &str) {
        match self {
            AnyEvaluator::Oracle(e) => e.forget(estimator_name),
            AnyEvaluator::Empirical(e) => e.forget(estimator_name),
            AnyEvaluator::Confidence(e) => e.forget(estimator_name),
            AnyEvaluator::Bayesian(e) => e.forget(estimator_name),
        }
    }
}
