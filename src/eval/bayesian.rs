//! Bayesian evaluator: each estimator's raw observations feed a
//! binned value distribution, and every strategy-choice "decision" made once
//! every registered strategy has at least one sample is logged under the
//! joint bin assignment active at that moment. A later query re-derives the
//! probability that the same joint bin assignment would still pick today's
//! actual winner, and uses that as a likelihood weight over the fitted
//! distributions' own prior.
//!
//! Unlike the other evaluators this one needs to know the full strategy set
//! up front — [`register_strategies`](BayesianEvaluator::register_strategies)
//! — since a "decision" snapshot is recorded across every strategy at once,
//! not per query.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::{BufRead, Write};
use std::sync::{Arc, Mutex};

use super::{ComparisonType, EvalMethod, Evaluator, Persist};
use crate::distribution::{BinnedDistribution, StatsDistribution, MAX_SAMPLES};
use crate::error::{Error, Result};
use crate::estimator::{
    is_valid, Estimator, EstimatorHandle, Observation, ObservationSink, RangeHints, INVALID_ESTIMATE,
};
use crate::strategy::{CostFn, EvalContext, SingularStrategy, Strategy};

/// A full point-value snapshot, one entry per estimator known at the moment
/// a decision was recorded. Keyed by estimator name so it survives a
/// restart across estimator reordering.
type Decision = HashMap<String, f64>;

/// Joint bin assignment identifying which region of the estimator space a
/// decision (or a query) falls into. A `BTreeMap` rather than a
/// position-indexed vector so it stays meaningful independent of which
/// subset of estimators a particular cost function happens to read.
type BinKey = BTreeMap<String, usize>;

/// Reads a decision snapshot instead of live estimator state, so a past
/// decision can be replayed to see which strategy it would have favored.
struct SnapshotContext<'a> {
    values: &'a Decision,
}

impl EvalContext for SnapshotContext<'_> {
    fn value(&self, estimator: &EstimatorHandle) -> f64 {
        self.values
            .get(estimator.name())
            .copied()
            .unwrap_or_else(|| estimator.get_estimate())
    }
}

/// Pins a subset of estimators to bin-midpoint values (for evaluating a cost
/// function at a specific joint bin) and reads live estimates for the rest.
struct PinnedContext {
    assignment: HashMap<u64, f64>,
}

impl EvalContext for PinnedContext {
    fn value(&self, estimator: &EstimatorHandle) -> f64 {
        self.assignment
            .get(&estimator.id())
            .copied()
            .unwrap_or_else(|| estimator.get_estimate())
    }
}

struct LiveContext;

impl EvalContext for LiveContext {
    fn value(&self, estimator: &EstimatorHandle) -> f64 {
        estimator.get_estimate()
    }
}

fn sorted_handles(map: HashMap<u64, EstimatorHandle>) -> Vec<EstimatorHandle> {
    let mut v: Vec<_> = map.into_values().collect();
    v.sort_by_key(|e| e.id());
    v
}

/// The trusted-oracle-style "pick by lowest expected time" sub-evaluator,
/// grounded directly on `oracle::TrustedOracle`'s `expected_value_singular`
/// (no iteration, just `fn_.call` against a context). It differs from `TrustedOracle` only
/// in taking its context as a parameter: the "current" half of this
/// evaluator reads live estimates (`LiveContext`, same as `TrustedOracle`),
/// while replaying a historical decision needs `SnapshotContext` instead —
/// so rather than holding its own mutable point-value overrides, this
/// function is generic over whichever context the caller supplies.
fn best_singular_index(
    strategies: &[Arc<SingularStrategy>],
    ctx: &dyn EvalContext,
    chooser_arg: f64,
) -> Option<usize> {
    strategies
        .iter()
        .enumerate()
        .map(|(i, s)| (i, s.time_fn.call(ctx, s.strategy_arg, chooser_arg)))
        .min_by(|(_, a), (_, b)| a.partial_cmp(b).expect("strategy times must be comparable"))
        .map(|(i, _)| i)
}

/// Every decision recorded under one joint-bin key (or, for the normalizer,
/// every decision recorded regardless of key).
#[derive(Debug, Default)]
struct DecisionLog {
    decisions: VecDeque<Decision>,
}

impl DecisionLog {
    fn push(&mut self, snapshot: Decision, weighted: bool) {
        self.decisions.push_back(snapshot);
        if weighted {
            while self.decisions.len() > MAX_SAMPLES {
                self.decisions.pop_front();
            }
        }
    }

    /// Fraction of logged decisions whose replayed winner still matches
    /// `current_winner`. `ensure_nonzero` applies add-one smoothing when no
    /// decision matches — used for the normalizer's own call (always) and
    /// for a strategy's per-key call only when that key is the strategy's
    /// current key.
    fn winner_probability(
        &self,
        strategies: &[Arc<SingularStrategy>],
        chooser_arg: f64,
        current_winner: usize,
        ensure_nonzero: bool,
    ) -> f64 {
        let mut matches = 0usize;
        let mut total = 0usize;
        for snapshot in &self.decisions {
            let ctx = SnapshotContext { values: snapshot };
            if best_singular_index(strategies, &ctx, chooser_arg) == Some(current_winner) {
                matches += 1;
            }
            total += 1;
        }
        if matches == 0 && ensure_nonzero {
            matches = 1;
            total += 1;
        }
        if total == 0 {
            1.0
        } else {
            matches as f64 / total as f64
        }
    }
}

pub struct BayesianEvaluator {
    weighted: bool,
    strategies: Mutex<Vec<Arc<SingularStrategy>>>,
    distributions: Mutex<HashMap<String, BinnedDistribution>>,
    /// Range hints in effect the first time each estimator was observed —
    /// `None` means the distribution was auto-fit. Persisted so a restored
    /// evaluator rebuilds the same binning its observations were originally
    /// folded into.
    range_hints: Mutex<HashMap<String, Option<RangeHints>>>,
    last_observation: Mutex<HashMap<String, f64>>,
    likelihood: Mutex<HashMap<String, HashMap<BinKey, DecisionLog>>>,
    normalizer: Mutex<DecisionLog>,
    /// Every observation ever recorded, in arrival order. This is the
    /// persisted representation — on restore it is replayed through the
    /// same update path live observations take, rebuilding the distributions,
    /// normalizer, and likelihood tables rather than serializing them
    /// directly.
    observation_log: Mutex<Vec<(String, Observation)>>,
}

impl BayesianEvaluator {
    pub fn new(method: EvalMethod) -> Arc<Self> {
        let weighted = match method {
            EvalMethod::Bayesian { weighted } => weighted,
            _ => panic!("BayesianEvaluator::new requires EvalMethod::Bayesian"),
        };
        Arc::new(BayesianEvaluator {
            weighted,
            strategies: Mutex::new(Vec::new()),
            distributions: Mutex::new(HashMap::new()),
            range_hints: Mutex::new(HashMap::new()),
            last_observation: Mutex::new(HashMap::new()),
            likelihood: Mutex::new(HashMap::new()),
            normalizer: Mutex::new(DecisionLog::default()),
            observation_log: Mutex::new(Vec::new()),
        })
    }

    /// Registers the full strategy set this evaluator reasons about.
    /// Redundant strategies contribute their children — a redundant
    /// strategy's own estimators are captured entirely by its children.
    pub fn register_strategies(&self, strategies: &[Strategy]) {
        let mut flat = Vec::new();
        for s in strategies {
            match s {
                Strategy::Singular(s) => flat.push(s.clone()),
                Strategy::Redundant(r) => flat.extend(r.children.iter().cloned()),
            }
        }
        *self.strategies.lock().unwrap() = flat;
    }

    fn uninitialized_strategies_exist(strategies: &[Arc<SingularStrategy>]) -> bool {
        strategies
            .iter()
            .any(|s| s.uses().values().any(|e| !is_valid(e.get_estimate())))
    }

    fn full_snapshot(strategies: &[Arc<SingularStrategy>]) -> Decision {
        let mut snap = HashMap::new();
        for s in strategies {
            for e in s.uses().into_values() {
                snap.entry(e.name().to_string())
                    .or_insert_with(|| e.get_estimate());
            }
        }
        snap
    }

    fn current_key(
        ests: &[EstimatorHandle],
        distributions: &HashMap<String, BinnedDistribution>,
        last_observation: &HashMap<String, f64>,
    ) -> BinKey {
        ests.iter()
            .map(|e| {
                let v = last_observation
                    .get(e.name())
                    .copied()
                    .unwrap_or_else(|| e.get_estimate());
                let idx = distributions.get(e.name()).map(|d| d.bin_index_of(v)).unwrap_or(0);
                (e.name().to_string(), idx)
            })
            .collect()
    }

    fn weighted_sum(
        &self,
        strategy: &SingularStrategy,
        fn_: &Arc<dyn CostFn>,
        strategy_arg: f64,
        chooser_arg: f64,
        strategies: &[Arc<SingularStrategy>],
        winner: usize,
    ) -> Option<f64> {
        let likelihood = self.likelihood.lock().unwrap();
        let per_key = likelihood.get(&strategy.name())?;
        if per_key.is_empty() {
            return None;
        }

        let ests = sorted_handles(strategy.uses());
        let fn_ests = sorted_handles(strategy.uses_for(fn_));
        let id_by_name: HashMap<&str, u64> = fn_ests.iter().map(|e| (e.name(), e.id())).collect();

        let distributions = self.distributions.lock().unwrap();
        let last_observation = self.last_observation.lock().unwrap();
        let cur_key = Self::current_key(&ests, &distributions, &last_observation);
        drop(last_observation);

        let mut sum = 0.0;
        for (key, log) in per_key.iter() {
            let mut assignment = HashMap::new();
            let mut prior = 1.0;
            for (name, &idx) in key.iter() {
                let Some(d) = distributions.get(name) else {
                    continue;
                };
                let midpoint = d.bin_midpoint(idx);
                if let Some(&id) = id_by_name.get(name.as_str()) {
                    assignment.insert(id, midpoint);
                }
                prior *= d.bin_probability(midpoint);
            }
            let ctx = PinnedContext { assignment };
            let value = fn_.call(&ctx, strategy_arg, chooser_arg);
            let ensure_nonzero = *key == cur_key;
            let coeff = log.winner_probability(strategies, chooser_arg, winner, ensure_nonzero);
            sum += value * prior * coeff;
        }
        Some(sum)
    }

    /// Folds one observation into distributions/normalizer/likelihood —
    /// the common path for both a live `observation_added` call and replaying
    /// a persisted observation log during `restore_from`.
    fn record_observation(&self, name: &str, range_hints: Option<RangeHints>, obs: Observation) {
        self.range_hints
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_insert(range_hints);
        {
            let mut dists = self.distributions.lock().unwrap();
            let d = dists.entry(name.to_string()).or_insert_with(|| match range_hints {
                Some(h) => BinnedDistribution::with_range(h.min, h.max, h.num_bins),
                None => BinnedDistribution::auto_fit(),
            });
            d.add_value(obs.value);
        }
        self.last_observation.lock().unwrap().insert(name.to_string(), obs.value);

        let strategies = self.strategies.lock().unwrap().clone();
        if strategies.is_empty() || Self::uninitialized_strategies_exist(&strategies) {
            return;
        }

        let snapshot = Self::full_snapshot(&strategies);
        self.normalizer.lock().unwrap().push(snapshot.clone(), self.weighted);

        let distributions = self.distributions.lock().unwrap();
        let last_observation = self.last_observation.lock().unwrap();
        let mut likelihood = self.likelihood.lock().unwrap();
        for s in &strategies {
            let ests = sorted_handles(s.uses());
            let key = Self::current_key(&ests, &distributions, &last_observation);
            likelihood
                .entry(s.name())
                .or_default()
                .entry(key)
                .or_default()
                .push(snapshot.clone(), self.weighted);
        }
    }

    fn write_estimate(out: &mut dyn Write, v: f64) -> std::io::Result<()> {
        if is_valid(v) {
            write!(out, "{v}")
        } else {
            write!(out, "(invalid)")
        }
    }

    fn read_estimate(tokens: &mut std::str::SplitWhitespace<'_>) -> Result<f64> {
        let tok = tokens.next().ok_or_else(|| Error::corrupt("missing observation field"))?;
        if tok == "(invalid)" {
            Ok(INVALID_ESTIMATE)
        } else {
            tok.parse().map_err(|_| Error::corrupt("bad observation field"))
        }
    }
}

impl Evaluator for BayesianEvaluator {
    fn adjusted_estimator_value(&self, estimator: &EstimatorHandle) -> f64 {
        let distributions = self.distributions.lock().unwrap();
        match distributions.get(estimator.name()) {
            Some(d) if d.total_count() > 0 => d.snapshot().iter().map(|&(v, p)| v * p).sum(),
            _ => estimator.get_estimate(),
        }
    }

    fn expected_value_singular(
        &self,
        strategy: &SingularStrategy,
        fn_: &Arc<dyn CostFn>,
        strategy_arg: f64,
        chooser_arg: f64,
        _comparison: ComparisonType,
    ) -> f64 {
        let strategies = self.strategies.lock().unwrap().clone();
        let winner = match best_singular_index(&strategies, &LiveContext, chooser_arg) {
            Some(w) => w,
            None => return fn_.call(&LiveContext, strategy_arg, chooser_arg),
        };

        let normalizing_factor = {
            let norm = self.normalizer.lock().unwrap();
            norm.winner_probability(&strategies, chooser_arg, winner, true)
        };
        assert!(
            normalizing_factor > 0.0,
            "normalizer winner probability must be nonzero (add-one smoothing guarantees this)"
        );

        match self.weighted_sum(strategy, fn_, strategy_arg, chooser_arg, &strategies, winner) {
            Some(value) => value / normalizing_factor,
            None => fn_.call(&LiveContext, strategy_arg, chooser_arg),
        }
    }
}

impl ObservationSink for BayesianEvaluator {
    fn sink_id(&self) -> u64 {
        self as *const _ as u64
    }

    fn observation_added(&self, estimator: &Estimator, obs: Observation) {
        let name = estimator.name().to_string();
        self.observation_log.lock().unwrap().push((name.clone(), obs));
        self.record_observation(&name, estimator.range_hints(), obs);
    }

    fn conditions_changed(&self, _estimator: &Estimator) {}

    fn forget(&self, estimator_name: &str) {
        self.distributions.lock().unwrap().remove(estimator_name);
        self.range_hints.lock().unwrap().remove(estimator_name);
        self.last_observation.lock().unwrap().remove(estimator_name);
        self.observation_log.lock().unwrap().retain(|(n, _)| n != estimator_name);
    }
}

impl Persist for BayesianEvaluator {
    fn save_to(&self, out: &mut dyn Write) -> std::io::Result<()> {
        let hints = self.range_hints.lock().unwrap();
        let mut names: Vec<_> = hints.keys().cloned().collect();
        names.sort();
        writeln!(out, "{} estimators", names.len())?;
        for name in &names {
            match hints[name] {
                Some(h) => writeln!(out, "{name} {} {} {}", h.min, h.max, h.num_bins)?,
                None => writeln!(out, "{name} auto")?,
            }
        }
        drop(hints);
        writeln!(out)?;

        let log = self.observation_log.lock().unwrap();
        writeln!(out, "{} observations", log.len())?;
        for (name, obs) in log.iter() {
            write!(out, "{name} ")?;
            Self::write_estimate(out, obs.value)?;
            write!(out, " ")?;
            Self::write_estimate(out, obs.old_estimate)?;
            write!(out, " ")?;
            Self::write_estimate(out, obs.new_estimate)?;
            writeln!(out)?;
        }
        Ok(())
    }

    fn restore_from(&self, input: &mut dyn BufRead) -> Result<()> {
        let mut header = String::new();
        input
            .read_line(&mut header)
            .map_err(|e| Error::io("<evaluator-stream>", e))?;
        let k: usize = header
            .split_whitespace()
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::corrupt("missing estimator count header"))?;

        let mut hints = HashMap::new();
        for _ in 0..k {
            let mut line = String::new();
            input
                .read_line(&mut line)
                .map_err(|e| Error::io("<evaluator-stream>", e))?;
            let mut tokens = line.split_whitespace();
            let name = tokens.next().ok_or_else(|| Error::corrupt("missing estimator name"))?.to_string();
            let first = tokens.next().ok_or_else(|| Error::corrupt("missing range hint field"))?;
            let hint = if first == "auto" {
                None
            } else {
                let min: f64 = first.parse().map_err(|_| Error::corrupt("bad range hint min"))?;
                let max: f64 = tokens
                    .next()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| Error::corrupt("bad range hint max"))?;
                let num_bins: usize = tokens
                    .next()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| Error::corrupt("bad range hint bin count"))?;
                Some(RangeHints { min, max, num_bins })
            };
            hints.insert(name, hint);
        }

        let mut blank = String::new();
        input
            .read_line(&mut blank)
            .map_err(|e| Error::io("<evaluator-stream>", e))?;
        if !blank.trim().is_empty() {
            return Err(Error::corrupt("expected blank line before observations header"));
        }

        let mut obs_header = String::new();
        input
            .read_line(&mut obs_header)
            .map_err(|e| Error::io("<evaluator-stream>", e))?;
        let n: usize = obs_header
            .split_whitespace()
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::corrupt("missing observation count header"))?;

        let mut log = Vec::with_capacity(n);
        for _ in 0..n {
            let mut line = String::new();
            input
                .read_line(&mut line)
                .map_err(|e| Error::io("<evaluator-stream>", e))?;
            let mut tokens = line.split_whitespace();
            let name = tokens
                .next()
                .ok_or_else(|| Error::corrupt("missing observation estimator name"))?
                .to_string();
            let value = Self::read_estimate(&mut tokens)?;
            let old_estimate = Self::read_estimate(&mut tokens)?;
            let new_estimate = Self::read_estimate(&mut tokens)?;
            log.push((
                name,
                Observation {
                    value,
                    old_estimate,
                    new_estimate,
                },
            ));
        }

        self.distributions.lock().unwrap().clear();
        self.range_hints.lock().unwrap().clear();
        self.last_observation.lock().unwrap().clear();
        self.normalizer.lock().unwrap().decisions.clear();
        self.likelihood.lock().unwrap().clear();
        self.observation_log.lock().unwrap().clear();

        for (name, obs) in &log {
            let hint = hints.get(name).copied().flatten();
            self.record_observation(name, hint, *obs);
        }
        *self.observation_log.lock().unwrap() = log;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::cost_fn;

    fn strategy(name: &str, e: &EstimatorHandle) -> Arc<SingularStrategy> {
        let e2 = e.clone();
        SingularStrategy::new(
            name,
            cost_fn(move |ctx, sarg, _carg| sarg / ctx.value(&e2)),
            cost_fn(|_c, _s, _a| 0.0),
            cost_fn(|_c, _s, _a| 0.0),
            4000.0,
            0.0,
        )
    }

    #[test]
    fn falls_back_to_point_estimate_before_any_decision_recorded() {
        let bw = EstimatorHandle::new_last_observation("bayesian_fallback_bw").unwrap();
        bw.add_observation(5000.0);
        let eval = BayesianEvaluator::new(EvalMethod::Bayesian { weighted: false });
        let s = strategy("s", &bw);
        eval.register_strategies(&[Strategy::Singular(s.clone())]);

        let v = eval.expected_value_singular(&s, &s.time_fn, s.strategy_arg, 0.0, ComparisonType::SingularToSingular);
        assert!((v - 4000.0 / 5000.0).abs() < 1e-9);
    }

    #[test]
    fn records_decision_once_every_strategy_has_a_sample() {
        let bw = EstimatorHandle::new_last_observation("bayesian_decision_bw").unwrap();
        let eval = BayesianEvaluator::new(EvalMethod::Bayesian { weighted: false });
        let sink: Arc<dyn ObservationSink> = eval.clone();
        bw.subscribe(sink);

        let s = strategy("s", &bw);
        eval.register_strategies(&[Strategy::Singular(s.clone())]);

        bw.add_observation(5000.0);
        assert_eq!(eval.normalizer.lock().unwrap().decisions.len(), 1);

        bw.add_observation(4800.0);
        assert_eq!(eval.normalizer.lock().unwrap().decisions.len(), 2);

        let v = eval.expected_value_singular(&s, &s.time_fn, s.strategy_arg, 0.0, ComparisonType::SingularToSingular);
        assert!(v.is_finite() && v > 0.0);
    }

    #[test]
    fn save_restore_round_trips_observation_log() {
        let bw = EstimatorHandle::new_last_observation("bayesian_restore_bw").unwrap();
        let eval = BayesianEvaluator::new(EvalMethod::Bayesian { weighted: false });
        let sink: Arc<dyn ObservationSink> = eval.clone();
        bw.subscribe(sink);
        for v in [5000.0, 4800.0, 5200.0] {
            bw.add_observation(v);
        }

        let mut buf = Vec::new();
        eval.save_to(&mut buf).unwrap();

        let restored = BayesianEvaluator::new(EvalMethod::Bayesian { weighted: false });
        let mut cursor = std::io::Cursor::new(buf);
        restored.restore_from(&mut cursor).unwrap();

        assert_eq!(restored.observation_log.lock().unwrap().len(), 3);
        assert_eq!(
            *restored.last_observation.lock().unwrap().get("bayesian_restore_bw").unwrap(),
            5200.0
        );
    }

    #[test]
    fn saved_format_matches_documented_grammar() {
        let bw = EstimatorHandle::new_last_observation("bayesian_format_bw").unwrap();
        let eval = BayesianEvaluator::new(EvalMethod::Bayesian { weighted: false });
        let sink: Arc<dyn ObservationSink> = eval.clone();
        bw.subscribe(sink);
        bw.add_observation(5000.0);
        bw.add_observation(4800.0);

        let mut buf = Vec::new();
        eval.save_to(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let mut lines = text.lines();

        assert_eq!(lines.next().unwrap(), "1 estimators");
        assert_eq!(lines.next().unwrap(), "bayesian_format_bw auto");
        assert_eq!(lines.next().unwrap(), "");
        assert_eq!(lines.next().unwrap(), "2 observations");
        assert_eq!(lines.next().unwrap(), "bayesian_format_bw 5000 (invalid) 5000");
        assert_eq!(lines.next().unwrap(), "bayesian_format_bw 4800 5000 4800");
        assert!(lines.next().is_none());
    }

    #[test]
    fn restore_rebuilds_decisions_by_replay() {
        let bw = EstimatorHandle::new_last_observation("bayesian_replay_bw").unwrap();
        let eval = BayesianEvaluator::new(EvalMethod::Bayesian { weighted: false });
        let sink: Arc<dyn ObservationSink> = eval.clone();
        bw.subscribe(sink);
        let s = strategy("s", &bw);
        eval.register_strategies(&[Strategy::Singular(s.clone())]);
        for v in [5000.0, 4800.0, 5200.0] {
            bw.add_observation(v);
        }
        assert_eq!(eval.normalizer.lock().unwrap().decisions.len(), 3);

        let mut buf = Vec::new();
        eval.save_to(&mut buf).unwrap();

        let restored = BayesianEvaluator::new(EvalMethod::Bayesian { weighted: false });
        restored.register_strategies(&[Strategy::Singular(s.clone())]);
        let mut cursor = std::io::Cursor::new(buf);
        restored.restore_from(&mut cursor).unwrap();

        assert_eq!(restored.normalizer.lock().unwrap().decisions.len(), 3);
        let v = restored.expected_value_singular(
            &s,
            &s.time_fn,
            s.strategy_arg,
            0.0,
            ComparisonType::SingularToSingular,
        );
        assert!(v.is_finite() && v > 0.0);
    }
}
