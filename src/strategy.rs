//! Strategies and cost-function composition.
//!
//! A strategy hands its cost function to the evaluator rather than calling
//! it directly — the evaluator is the one that knows how to iterate over
//! whatever uncertainty model it implements.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::estimator::EstimatorHandle;
use crate::eval::{ComparisonType, Evaluator};
use crate::weights::ResourceWeights;

/// The read side of a cost-function evaluation: how a `CostFn` reads an
/// estimator's "current" value depends entirely on which evaluator is
/// driving the call (raw point estimate, error-adjusted sample, confidence
/// bound, or posterior bin assignment).
pub trait EvalContext {
    fn value(&self, estimator: &EstimatorHandle) -> f64;
}

/// Stable, comparable identity for the three built-in redundant-strategy
/// combiners — no raw function-pointer equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CombinerKind {
    MinTime,
    SumEnergy,
    SumData,
}

pub trait CostFn: Send + Sync {
    fn call(&self, ctx: &dyn EvalContext, strategy_arg: f64, chooser_arg: f64) -> f64;
    /// `Some` for the three built-in redundant combiners; `None` for
    /// ordinary user-supplied cost functions.
    fn combiner(&self) -> Option<CombinerKind> {
        None
    }
}

struct FnCost<F> {
    f: F,
}

impl<F> CostFn for FnCost<F>
where
    F: Fn(&dyn EvalContext, f64, f64) -> f64 + Send + Sync,
{
    fn call(&self, ctx: &dyn EvalContext, strategy_arg: f64, chooser_arg: f64) -> f64 {
        (self.f)(ctx, strategy_arg, chooser_arg)
    }
}

/// Wraps an ordinary closure as a `CostFn`.
pub fn cost_fn<F>(f: F) -> Arc<dyn CostFn>
where
    F: Fn(&dyn EvalContext, f64, f64) -> f64 + Send + Sync + 'static,
{
    Arc::new(FnCost { f })
}

struct CombinerFn(CombinerKind);

impl CostFn for CombinerFn {
    fn call(&self, _ctx: &dyn EvalContext, _strategy_arg: f64, _chooser_arg: f64) -> f64 {
        unreachable!(
            "combiner cost functions are intercepted by the evaluator and never invoked directly"
        )
    }

    fn combiner(&self) -> Option<CombinerKind> {
        Some(self.0)
    }
}

pub fn redundant_min_time() -> Arc<dyn CostFn> {
    Arc::new(CombinerFn(CombinerKind::MinTime))
}
pub fn redundant_sum_energy() -> Arc<dyn CostFn> {
    Arc::new(CombinerFn(CombinerKind::SumEnergy))
}
pub fn redundant_sum_data() -> Arc<dyn CostFn> {
    Arc::new(CombinerFn(CombinerKind::SumData))
}

/// Records every estimator a cost function dereferences, when run once
/// against arbitrary arguments. `uses()` re-runs this on demand, so the
/// discovered set only ever grows, never shrinks.
struct UsesCollector {
    touched: Mutex<HashMap<u64, EstimatorHandle>>,
}

impl UsesCollector {
    fn new() -> Self {
        UsesCollector {
            touched: Mutex::new(HashMap::new()),
        }
    }

    fn into_map(self) -> HashMap<u64, EstimatorHandle> {
        self.touched.into_inner().unwrap()
    }
}

impl EvalContext for UsesCollector {
    fn value(&self, estimator: &EstimatorHandle) -> f64 {
        self.touched
            .lock()
            .unwrap()
            .entry(estimator.id())
            .or_insert_with(|| estimator.clone());
        estimator.get_estimate()
    }
}

fn collect_uses(
    fn_: &Arc<dyn CostFn>,
    strategy_arg: f64,
    chooser_arg: f64,
) -> HashMap<u64, EstimatorHandle> {
    let collector = UsesCollector::new();
    fn_.call(&collector, strategy_arg, chooser_arg);
    collector.into_map()
}

fn merge(cache: &Mutex<HashMap<u64, EstimatorHandle>>, fresh: HashMap<u64, EstimatorHandle>) -> HashMap<u64, EstimatorHandle> {
    let mut guard = cache.lock().unwrap();
    for (id, handle) in fresh {
        guard.entry(id).or_insert(handle);
    }
    guard.clone()
}

pub struct SingularStrategy {
    name: Mutex<String>,
    pub time_fn: Arc<dyn CostFn>,
    pub energy_fn: Arc<dyn CostFn>,
    pub data_fn: Arc<dyn CostFn>,
    pub strategy_arg: f64,
    pub default_chooser_arg: f64,
    uses_time: Mutex<HashMap<u64, EstimatorHandle>>,
    uses_energy: Mutex<HashMap<u64, EstimatorHandle>>,
    uses_data: Mutex<HashMap<u64, EstimatorHandle>>,
}

impl SingularStrategy {
    pub fn new(
        name: impl Into<String>,
        time_fn: Arc<dyn CostFn>,
        energy_fn: Arc<dyn CostFn>,
        data_fn: Arc<dyn CostFn>,
        strategy_arg: f64,
        default_chooser_arg: f64,
    ) -> Arc<Self> {
        Arc::new(SingularStrategy {
            name: Mutex::new(name.into()),
            time_fn,
            energy_fn,
            data_fn,
            strategy_arg,
            default_chooser_arg,
            uses_time: Mutex::new(HashMap::new()),
            uses_energy: Mutex::new(HashMap::new()),
            uses_data: Mutex::new(HashMap::new()),
        })
    }

    pub fn name(&self) -> String {
        self.name.lock().unwrap().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.lock().unwrap() = name.into();
    }

    pub fn uses_for(&self, fn_: &Arc<dyn CostFn>) -> HashMap<u64, EstimatorHandle> {
        let fresh = collect_uses(fn_, self.strategy_arg, self.default_chooser_arg);
        if Arc::ptr_eq(fn_, &self.time_fn) {
            merge(&self.uses_time, fresh)
        } else if Arc::ptr_eq(fn_, &self.energy_fn) {
            merge(&self.uses_energy, fresh)
        } else {
            merge(&self.uses_data, fresh)
        }
    }

    pub fn uses_time(&self) -> HashMap<u64, EstimatorHandle> {
        self.uses_for(&self.time_fn.clone())
    }
    pub fn uses_energy(&self) -> HashMap<u64, EstimatorHandle> {
        self.uses_for(&self.energy_fn.clone())
    }
    pub fn uses_data(&self) -> HashMap<u64, EstimatorHandle> {
        self.uses_for(&self.data_fn.clone())
    }

    pub fn uses(&self) -> HashMap<u64, EstimatorHandle> {
        let mut all = self.uses_time();
        all.extend(self.uses_energy());
        all.extend(self.uses_data());
        all
    }

    pub fn fn_for(&self, kind: CombinerKind) -> &Arc<dyn CostFn> {
        match kind {
            CombinerKind::MinTime => &self.time_fn,
            CombinerKind::SumEnergy => &self.energy_fn,
            CombinerKind::SumData => &self.data_fn,
        }
    }
}

pub struct RedundantStrategy {
    name: Mutex<String>,
    pub children: Vec<Arc<SingularStrategy>>,
}

impl RedundantStrategy {
    pub fn new(name: impl Into<String>, children: Vec<Arc<SingularStrategy>>) -> Arc<Self> {
        assert!(
            !children.is_empty(),
            "a redundant strategy must have at least one child"
        );
        Arc::new(RedundantStrategy {
            name: Mutex::new(name.into()),
            children,
        })
    }

    pub fn name(&self) -> String {
        self.name.lock().unwrap().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.lock().unwrap() = name.into();
    }

    pub fn uses(&self) -> HashMap<u64, EstimatorHandle> {
        let mut all = HashMap::new();
        for child in &self.children {
            all.extend(child.uses());
        }
        all
    }

    /// True when no two children share an estimator relevant to `kind` —
    /// the precondition for the memoized redundant-evaluation path.
    pub fn disjoint_for(&self, kind: CombinerKind) -> bool {
        let mut seen = std::collections::HashSet::new();
        for child in &self.children {
            let ids: Vec<u64> = child.uses_for(child.fn_for(kind)).keys().copied().collect();
            for id in &ids {
                if !seen.insert(*id) {
                    return false;
                }
            }
        }
        true
    }
}

#[derive(Clone)]
pub enum Strategy {
    Singular(Arc<SingularStrategy>),
    Redundant(Arc<RedundantStrategy>),
}

impl Strategy {
    pub fn name(&self) -> String {
        match self {
            Strategy::Singular(s) => s.name(),
            Strategy::Redundant(r) => r.name(),
        }
    }

    pub fn set_name(&self, name: impl Into<String>) {
        match self {
            Strategy::Singular(s) => s.set_name(name),
            Strategy::Redundant(r) => r.set_name(name),
        }
    }

    pub fn uses(&self) -> HashMap<u64, EstimatorHandle> {
        match self {
            Strategy::Singular(s) => s.uses(),
            Strategy::Redundant(r) => r.uses(),
        }
    }

    pub fn is_redundant(&self) -> bool {
        matches!(self, Strategy::Redundant(_))
    }

    /// Stable identity used for memoization keys, caches, and equality.
    pub fn identity(&self) -> usize {
        match self {
            Strategy::Singular(s) => Arc::as_ptr(s) as usize,
            Strategy::Redundant(r) => Arc::as_ptr(r) as usize,
        }
    }

    /// `comparison` only affects the Confidence-Bounds evaluator's
    /// bound-type selection: the chooser passes
    /// `SingularToSingular` while ranking singular strategies against each
    /// other, and `SingularToRedundant` when re-querying the cached best
    /// singular strategy's time for a redundant candidate's net-benefit
    /// calculation.
    pub fn calculate_time(
        &self,
        evaluator: &dyn Evaluator,
        chooser_arg: f64,
        comparison: ComparisonType,
    ) -> f64 {
        match self {
            Strategy::Singular(s) => {
                evaluator.expected_value(self, &s.time_fn, s.strategy_arg, chooser_arg, comparison)
            }
            Strategy::Redundant(_) => evaluator.expected_value(
                self,
                &redundant_min_time(),
                0.0,
                chooser_arg,
                comparison,
            ),
        }
    }

    pub fn calculate_cost(
        &self,
        evaluator: &dyn Evaluator,
        chooser_arg: f64,
        weights: &ResourceWeights,
        comparison: ComparisonType,
    ) -> f64 {
        let (energy, data) = match self {
            Strategy::Singular(s) => (
                evaluator.expected_value(self, &s.energy_fn, s.strategy_arg, chooser_arg, comparison),
                evaluator.expected_value(self, &s.data_fn, s.strategy_arg, chooser_arg, comparison),
            ),
            Strategy::Redundant(_) => (
                evaluator.expected_value(self, &redundant_sum_energy(), 0.0, chooser_arg, comparison),
                evaluator.expected_value(self, &redundant_sum_data(), 0.0, chooser_arg, comparison),
            ),
        };
        let (w_e, w_d) = weights.current();
        w_e * energy + w_d * data
    }
}

impl PartialEq for Strategy {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}
impl Eq for Strategy {}

impl std::hash::Hash for Strategy {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimator::EstimatorHandle;

    #[test]
    fn uses_discovers_referenced_estimators() {
        let bw = EstimatorHandle::new_last_observation("strategy_uses_bw").unwrap();
        let lat = EstimatorHandle::new_last_observation("strategy_uses_lat").unwrap();
        let bw2 = bw.clone();
        let lat2 = lat.clone();
        let time = cost_fn(move |ctx, sarg, _carg| sarg / ctx.value(&bw2) + ctx.value(&lat2));
        let energy = cost_fn(|_ctx, _s, _c| 0.0);
        let data = cost_fn(|_ctx, _s, _c| 0.0);
        let s = SingularStrategy::new("s", time, energy, data, 4000.0, 0.0);
        let uses = s.uses_time();
        assert_eq!(uses.len(), 2);
        assert!(uses.contains_key(&bw.id()));
        assert!(uses.contains_key(&lat.id()));
    }

    #[test]
    fn disjoint_children_detected() {
        let a = EstimatorHandle::new_last_observation("strategy_disjoint_a").unwrap();
        let b = EstimatorHandle::new_last_observation("strategy_disjoint_b").unwrap();
        let mk = |e: EstimatorHandle| {
            let e2 = e.clone();
            SingularStrategy::new(
                "s",
                cost_fn(move |ctx, _s, _c| ctx.value(&e2)),
                cost_fn(|_c, _s, _a| 0.0),
                cost_fn(|_c, _s, _a| 0.0),
                0.0,
                0.0,
            )
        };
        let r = RedundantStrategy::new("r", vec![mk(a), mk(b)]);
        assert!(r.disjoint_for(CombinerKind::MinTime));
    }
}
