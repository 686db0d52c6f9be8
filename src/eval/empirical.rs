//! Empirical-Error evaluator: joint iteration over per-estimator
//! error distributions, plus the memoized redundant-strategy fast path.

use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::{combine, ComparisonType, EvalMethod, Evaluator, Persist};
use crate::distribution::{Dist, DistributionKind, ErrorMode, StatsDistribution};
use crate::error::{Error, Result};
use crate::estimator::{Estimator, EstimatorHandle, Observation, ObservationSink};
use crate::memo::MemoTable;
use crate::strategy::{CombinerKind, CostFn, EvalContext, RedundantStrategy, SingularStrategy, Strategy};

struct JointCtx {
    assignment: HashMap<u64, f64>,
}

impl EvalContext for JointCtx {
    fn value(&self, estimator: &EstimatorHandle) -> f64 {
        self.assignment
            .get(&estimator.id())
            .copied()
            .unwrap_or_else(|| estimator.get_estimate())
    }
}

/// Generic N-way joint iterator over a set of per-dimension `(value,
/// probability)` distributions: a stack of indices, the least-significant
/// advancing innermost, with the running probability product cached and
/// only recomputed for the suffix of dimensions that actually changed.
struct JointIterator {
    dists: Vec<Vec<(f64, f64)>>,
    idx: Vec<usize>,
    /// `prefix[k]` = product of probabilities for dimensions `0..k`.
    /// `prefix[n]` is the current total probability.
    prefix: Vec<f64>,
}

impl JointIterator {
    fn new(dists: Vec<Vec<(f64, f64)>>) -> Self {
        let n = dists.len();
        let mut it = JointIterator {
            idx: vec![0; n],
            prefix: vec![1.0; n + 1],
            dists,
        };
        it.recompute_from(0);
        it
    }

    fn recompute_from(&mut self, from: usize) {
        for k in from..self.dists.len() {
            self.prefix[k + 1] = self.prefix[k] * self.dists[k][self.idx[k]].1;
        }
    }

    fn current(&self) -> (Vec<f64>, f64) {
        let values = self
            .idx
            .iter()
            .zip(self.dists.iter())
            .map(|(&i, d)| d[i].0)
            .collect();
        (values, *self.prefix.last().unwrap())
    }

    /// Advances the odometer. Returns `false` once every combination has
    /// been visited.
    fn advance(&mut self) -> bool {
        let n = self.dists.len();
        if n == 0 {
            return false;
        }
        let mut i = n;
        loop {
            if i == 0 {
                return false;
            }
            i -= 1;
            self.idx[i] += 1;
            if self.idx[i] < self.dists[i].len() {
                break;
            }
            self.idx[i] = 0;
        }
        self.recompute_from(i);
        true
    }
}

fn sorted_handles(map: HashMap<u64, EstimatorHandle>) -> Vec<EstimatorHandle> {
    let mut v: Vec<_> = map.into_values().collect();
    v.sort_by_key(|e| e.id());
    v
}

struct ReentrancyGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> ReentrancyGuard<'a> {
    fn enter(flag: &'a AtomicBool) -> Self {
        let already = flag.swap(true, Ordering::SeqCst);
        assert!(
            !already,
            "expected_value must not be re-entered while a joint-iterator instance is live"
        );
        ReentrancyGuard { flag }
    }
}

impl Drop for ReentrancyGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

pub struct EmpiricalErrorEvaluator {
    mode: ErrorMode,
    distribution_kind: DistributionKind,
    weighted: bool,
    /// Keyed by estimator name, not id: restored state may predate the
    /// estimator being reconstructed, and names (unlike ids) are stable
    /// across process restarts.
    errors: Mutex<HashMap<String, Dist>>,
    reentrant: AtomicBool,
}

impl EmpiricalErrorEvaluator {
    pub fn new(method: EvalMethod) -> Arc<Self> {
        let (distribution, weighted, mode) = match method {
            EvalMethod::EmpiricalError {
                distribution,
                weighted,
                mode,
            } => (distribution, weighted, mode),
            _ => panic!("EmpiricalErrorEvaluator::new requires EvalMethod::EmpiricalError"),
        };
        Arc::new(EmpiricalErrorEvaluator {
            mode,
            distribution_kind: distribution,
            weighted,
            errors: Mutex::new(HashMap::new()),
            reentrant: AtomicBool::new(false),
        })
    }

    fn range_for(estimator: &Estimator) -> Option<(f64, f64, usize)> {
        estimator
            .range_hints()
            .map(|h| (h.min, h.max, h.num_bins))
    }

    fn pruned_snapshot(&self, estimator: &EstimatorHandle) -> Vec<(f64, f64)> {
        let raw = {
            let errs = self.errors.lock().unwrap();
            match errs.get(estimator.name()) {
                Some(dist) => dist.snapshot(),
                None => vec![(self.mode.identity(), 1.0)],
            }
        };
        let (at_least, at_most) = estimator.conditions();
        if at_least.is_none() && at_most.is_none() {
            return raw;
        }
        let estimate = estimator.get_estimate();
        let mut kept: Vec<(f64, f64)> = raw
            .into_iter()
            .filter(|&(err, _)| {
                let adjusted = self.mode.compose(estimate, err);
                at_least.map_or(true, |lo| adjusted >= lo) && at_most.map_or(true, |hi| adjusted <= hi)
            })
            .collect();
        if kept.is_empty() {
            let lo = at_least.unwrap_or(f64::NEG_INFINITY);
            let hi = at_most.unwrap_or(f64::INFINITY);
            let mid = match (lo.is_finite(), hi.is_finite()) {
                (true, true) => self.mode.midpoint(lo, hi),
                (true, false) => lo,
                (false, true) => hi,
                (false, false) => estimate,
            };
            let synthetic = self.mode.error_for_target(estimate, mid);
            return vec![(synthetic, 1.0)];
        }
        let total: f64 = kept.iter().map(|(_, p)| p).sum();
        for (_, p) in kept.iter_mut() {
            *p /= total;
        }
        kept
    }

    /// General joint sweep: handles any number of estimators via
    /// [`JointIterator`].
    fn sweep_generic(
        &self,
        ests: &[EstimatorHandle],
        fn_: &Arc<dyn CostFn>,
        strategy_arg: f64,
        chooser_arg: f64,
    ) -> Vec<(f64, f64)> {
        if ests.is_empty() {
            let ctx = JointCtx {
                assignment: HashMap::new(),
            };
            return vec![(fn_.call(&ctx, strategy_arg, chooser_arg), 1.0)];
        }
        let dists: Vec<Vec<(f64, f64)>> = ests.iter().map(|e| self.pruned_snapshot(e)).collect();
        let mut joint = JointIterator::new(dists);
        let mut out = Vec::new();
        loop {
            let (vals, prob) = joint.current();
            let assignment = ests
                .iter()
                .zip(vals.iter())
                .map(|(e, &v)| (e.id(), self.mode.compose(e.get_estimate(), v)))
                .collect();
            let ctx = JointCtx { assignment };
            out.push((fn_.call(&ctx, strategy_arg, chooser_arg), prob));
            if !joint.advance() {
                break;
            }
        }
        out
    }

    /// Fixed-topology specialization: a hand-unrolled sweep over at most two
    /// estimators, used automatically for the common two-network shape
    /// instead of routing through the general [`JointIterator`].
    fn sweep_fixed_topology(
        &self,
        ests: &[EstimatorHandle],
        fn_: &Arc<dyn CostFn>,
        strategy_arg: f64,
        chooser_arg: f64,
    ) -> Option<Vec<(f64, f64)>> {
        if ests.len() > 2 {
            return None;
        }
        let mut out = Vec::new();
        match ests.len() {
            0 => {
                let ctx = JointCtx {
                    assignment: HashMap::new(),
                };
                out.push((fn_.call(&ctx, strategy_arg, chooser_arg), 1.0));
            }
            1 => {
                for &(v0, p0) in &self.pruned_snapshot(&ests[0]) {
                    let mut assignment = HashMap::new();
                    assignment.insert(ests[0].id(), self.mode.compose(ests[0].get_estimate(), v0));
                    let ctx = JointCtx { assignment };
                    out.push((fn_.call(&ctx, strategy_arg, chooser_arg), p0));
                }
            }
            2 => {
                let d0 = self.pruned_snapshot(&ests[0]);
                let d1 = self.pruned_snapshot(&ests[1]);
                for &(v0, p0) in &d0 {
                    for &(v1, p1) in &d1 {
                        let mut assignment = HashMap::new();
                        assignment.insert(ests[0].id(), self.mode.compose(ests[0].get_estimate(), v0));
                        assignment.insert(ests[1].id(), self.mode.compose(ests[1].get_estimate(), v1));
                        let ctx = JointCtx { assignment };
                        out.push((fn_.call(&ctx, strategy_arg, chooser_arg), p0 * p1));
                    }
                }
            }
            _ => unreachable!(),
        }
        Some(out)
    }

    fn sweep(
        &self,
        child: &SingularStrategy,
        fn_: &Arc<dyn CostFn>,
        strategy_arg: f64,
        chooser_arg: f64,
    ) -> Vec<(f64, f64)> {
        let ests = sorted_handles(child.uses_for(fn_));
        self.sweep_fixed_topology(&ests, fn_, strategy_arg, chooser_arg)
            .unwrap_or_else(|| self.sweep_generic(&ests, fn_, strategy_arg, chooser_arg))
    }

    /// Memoizes each disjoint child's per-point values in a [`MemoTable`]
    /// before combining, so the combiner never re-invokes the cost
    /// function — it only reads cells.
    fn memoized_combine(&self, r: &RedundantStrategy, kind: CombinerKind, chooser_arg: f64) -> f64 {
        let per_child: Vec<Vec<(f64, f64)>> = r
            .children
            .iter()
            .map(|c| {
                let pts = self.sweep(c, c.fn_for(kind), c.strategy_arg, chooser_arg);
                let mut memo = MemoTable::new(vec![pts.len().max(1)]);
                for (i, &(v, _)) in pts.iter().enumerate() {
                    memo.set(&[i], v);
                }
                memo.validate();
                pts.iter()
                    .enumerate()
                    .map(|(i, &(_, p))| (memo.get(&[i]), p))
                    .collect()
            })
            .collect();

        if matches!(kind, CombinerKind::SumEnergy | CombinerKind::SumData) {
            return per_child
                .iter()
                .map(|pts| pts.iter().map(|&(v, p)| v * p).sum::<f64>())
                .sum();
        }

        let mut joint = JointIterator::new(per_child);
        let mut total = 0.0;
        loop {
            let (vals, prob) = joint.current();
            let m = combine(kind, &vals);
            total += prob * m;
            if !joint.advance() {
                break;
            }
        }
        total
    }
}

impl Evaluator for EmpiricalErrorEvaluator {
    fn adjusted_estimator_value(&self, estimator: &EstimatorHandle) -> f64 {
        let errs = self.errors.lock().unwrap();
        match errs.get(estimator.name()) {
            Some(dist) => {
                let snap = dist.snapshot();
                let mean_error: f64 = snap.iter().map(|&(v, p)| v * p).sum();
                self.mode.compose(estimator.get_estimate(), mean_error)
            }
            None => estimator.get_estimate(),
        }
    }

    /// Not guarded against reentrancy: the redundant-combine path drives its
    /// own joint iterators directly via `sweep` rather than calling back
    /// into this method, so it can safely be invoked both as the external
    /// entry point for singular strategies and, transitively, wherever an
    /// evaluator needs a single child's value without going through
    /// `expected_value`.
    fn expected_value_singular(
        &self,
        strategy: &SingularStrategy,
        fn_: &Arc<dyn CostFn>,
        strategy_arg: f64,
        chooser_arg: f64,
        _comparison: ComparisonType,
    ) -> f64 {
        self.sweep(strategy, fn_, strategy_arg, chooser_arg)
            .iter()
            .map(|&(v, p)| v * p)
            .sum()
    }

    fn expected_value(
        &self,
        strategy: &Strategy,
        fn_: &Arc<dyn CostFn>,
        strategy_arg: f64,
        chooser_arg: f64,
        _comparison: ComparisonType,
    ) -> f64 {
        let _guard = ReentrancyGuard::enter(&self.reentrant);
        match strategy {
            Strategy::Singular(s) => self
                .sweep(s, fn_, strategy_arg, chooser_arg)
                .iter()
                .map(|&(v, p)| v * p)
                .sum(),
            Strategy::Redundant(r) => {
                let kind = fn_
                    .combiner()
                    .expect("redundant strategies must be queried with a combiner fn");
                if r.disjoint_for(kind) {
                    self.memoized_combine(r, kind, chooser_arg)
                } else {
                    let values: Vec<f64> = r
                        .children
                        .iter()
                        .map(|c| {
                            self.sweep(c, c.fn_for(kind), c.strategy_arg, chooser_arg)
                                .iter()
                                .map(|&(v, p)| v * p)
                                .sum()
                        })
                        .collect();
                    combine(kind, &values)
                }
            }
        }
    }
}

impl ObservationSink for EmpiricalErrorEvaluator {
    fn sink_id(&self) -> u64 {
        self as *const _ as u64
    }

    fn observation_added(&self, estimator: &Estimator, obs: Observation) {
        let mut errs = self.errors.lock().unwrap();
        if let Some(dist) = errs.get_mut(estimator.name()) {
            let error = self.mode.error_sample(obs.old_estimate, obs.value);
            dist.add_value(error);
        } else {
            let mut dist = Dist::new(self.distribution_kind, self.weighted, Self::range_for(estimator));
            dist.add_value(self.mode.identity());
            errs.insert(estimator.name().to_string(), dist);
        }
    }

    fn conditions_changed(&self, estimator: &Estimator) {
        log::debug!("empirical evaluator observed conditions change on {}", estimator.name());
    }

    fn forget(&self, estimator_name: &str) {
        self.errors.lock().unwrap().remove(estimator_name);
    }
}

impl Persist for EmpiricalErrorEvaluator {
    fn save_to(&self, out: &mut dyn Write) -> std::io::Result<()> {
        let errs = self.errors.lock().unwrap();
        let mut entries: Vec<_> = errs.iter().collect();
        entries.sort_by_key(|(name, _)| (*name).clone());
        writeln!(out, "{} estimators", entries.len())?;
        for (name, dist) in entries {
            match dist.raw_samples() {
                Some(samples) => {
                    write!(out, "{} {}", name, samples.len())?;
                    for v in samples {
                        write!(out, " {v}")?;
                    }
                    writeln!(out)?;
                }
                None => {
                    let binned = dist.as_binned().expect("binned distribution expected");
                    let snap = dist.snapshot();
                    write!(out, "{} binned {}", name, snap.len())?;
                    for (value, prob) in snap {
                        write!(out, " {value} {prob}")?;
                    }
                    writeln!(out)?;
                    let _ = binned.num_bins();
                }
            }
        }
        Ok(())
    }

    fn restore_from(&self, input: &mut dyn BufRead) -> Result<()> {
        let mut errs = self.errors.lock().unwrap();
        errs.clear();
        let mut header = String::new();
        input
            .read_line(&mut header)
            .map_err(|e| Error::io("<evaluator-stream>", e))?;
        let k: usize = header
            .split_whitespace()
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::corrupt("missing estimator count header"))?;
        for _ in 0..k {
            let mut line = String::new();
            input
                .read_line(&mut line)
                .map_err(|e| Error::io("<evaluator-stream>", e))?;
            let mut tokens = line.split_whitespace();
            let name = tokens
                .next()
                .ok_or_else(|| Error::corrupt("missing estimator name"))?
                .to_string();
            let second = tokens
                .next()
                .ok_or_else(|| Error::corrupt("missing sample count"))?;
            if second == "binned" {
                let n: usize = tokens
                    .next()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| Error::corrupt("bad binned sample count"))?;
                let mut dist = Dist::new(self.distribution_kind, self.weighted, None);
                for _ in 0..n {
                    let value: f64 = tokens
                        .next()
                        .and_then(|s| s.parse().ok())
                        .ok_or_else(|| Error::corrupt("bad binned value"))?;
                    let _prob: f64 = tokens
                        .next()
                        .and_then(|s| s.parse().ok())
                        .ok_or_else(|| Error::corrupt("bad binned probability"))?;
                    dist.add_value(value);
                }
                errs.insert(name, dist);
            } else {
                let n: usize = second
                    .parse()
                    .map_err(|_| Error::corrupt("bad sample count"))?;
                let mut samples = Vec::with_capacity(n);
                for _ in 0..n {
                    let v: f64 = tokens
                        .next()
                        .and_then(|s| s.parse().ok())
                        .ok_or_else(|| Error::corrupt("bad sample value"))?;
                    samples.push(v);
                }
                let dist = Dist::All(crate::distribution::AllSamplesDistribution::restore(self.weighted, samples));
                errs.insert(name, dist);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::cost_fn;

    fn feed_alternating(e: &EstimatorHandle, a: f64, b: f64, n: usize) {
        for i in 0..n {
            e.add_observation(if i % 2 == 0 { a } else { b });
        }
    }

    #[test]
    fn error_distribution_sums_to_one() {
        let bw = EstimatorHandle::new_last_observation("empirical_sums_to_one_bw").unwrap();
        let eval = EmpiricalErrorEvaluator::new(EvalMethod::EmpiricalError {
            distribution: DistributionKind::AllSamples,
            weighted: false,
            mode: ErrorMode::Relative,
        });
        let sink: Arc<dyn ObservationSink> = eval.clone();
        bw.subscribe(sink);
        feed_alternating(&bw, 1000.0, 2000.0, 10);
        let errs = eval.errors.lock().unwrap();
        let dist = errs.get(bw.name()).unwrap();
        let total: f64 = dist.snapshot().iter().map(|(_, p)| p).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn redundant_min_time_matches_product_rule() {
        let a = EstimatorHandle::new_last_observation("empirical_product_rule_a").unwrap();
        let b = EstimatorHandle::new_last_observation("empirical_product_rule_b").unwrap();
        let eval = EmpiricalErrorEvaluator::new(EvalMethod::EmpiricalError {
            distribution: DistributionKind::AllSamples,
            weighted: false,
            mode: ErrorMode::Relative,
        });
        let sink: Arc<dyn ObservationSink> = eval.clone();
        a.subscribe(sink.clone());
        b.subscribe(sink);
        feed_alternating(&a, 1000.0, 3000.0, 6);
        feed_alternating(&b, 2000.0, 500.0, 6);

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
        let sa = mk(a);
        let sb = mk(b);
        let r = RedundantStrategy::new("r", vec![sa.clone(), sb.clone()]);

        let via_memo = eval.expected_value(
            &Strategy::Redundant(r.clone()),
            &crate::strategy::redundant_min_time(),
            0.0,
            0.0,
            ComparisonType::SingularToSingular,
        );

        let ta = eval.expected_value_singular(&sa, &sa.time_fn, 0.0, 0.0, ComparisonType::SingularToSingular);
        let tb = eval.expected_value_singular(&sb, &sb.time_fn, 0.0, 0.0, ComparisonType::SingularToSingular);
        let dist_a = eval.sweep(&sa, &sa.time_fn, 0.0, 0.0);
        let dist_b = eval.sweep(&sb, &sb.time_fn, 0.0, 0.0);
        let mut brute = 0.0;
        for &(va, pa) in &dist_a {
            for &(vb, pb) in &dist_b {
                brute += pa * pb * va.min(vb);
            }
        }
        assert!((via_memo - brute).abs() < 1e-9);
        assert!(ta.is_finite() && tb.is_finite());
    }
}
