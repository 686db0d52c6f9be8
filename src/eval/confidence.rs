//! Confidence-Bounds evaluator: instead of sweeping a joint
//! error distribution, each cost function is evaluated at the corners of a
//! per-estimator confidence interval and the bound (min, max, or center) the
//! caller asked for is reported.
//!
//! Error samples are kept log-transformed (so the fitted interval, once
//! exponentiated back, is never negative) and smoothed through a two-speed
//! EWMA ("flip-flop": a fast tracker that always moves, and a slow tracker
//! that snaps to the fast one on a big jump and creeps towards it
//! otherwise) before being folded into a running mean/variance.

use std::collections::{HashMap, VecDeque};
use std::io::{BufRead, Write};
use std::sync::{Arc, Mutex};

use super::{combine, ComparisonType, EvalMethod, Evaluator, Persist};
use crate::distribution::{ErrorMode, MAX_SAMPLES};
use crate::error::{Error, Result};
use crate::estimator::{is_valid, Estimator, EstimatorHandle, Observation, ObservationSink};
use crate::strategy::{CostFn, EvalContext, SingularStrategy, Strategy};

const CONFIDENCE_ALPHA: f64 = 0.05;

/// Two-tailed Student's-t critical value at alpha=0.05 for df 1..=30;
/// beyond that the normal approximation (z=1.960) is close enough.
const T_TABLE: [f64; 30] = [
    12.706, 4.303, 3.182, 2.776, 2.571, 2.447, 2.365, 2.306, 2.262, 2.228, 2.201, 2.179, 2.160,
    2.145, 2.131, 2.120, 2.110, 2.101, 2.093, 2.086, 2.080, 2.074, 2.069, 2.064, 2.060, 2.056,
    2.052, 2.048, 2.045, 2.042,
];

fn t_value(df: usize) -> f64 {
    if df == 0 {
        0.0
    } else if df <= T_TABLE.len() {
        T_TABLE[df - 1]
    } else {
        1.960
    }
}

/// Student's-t prediction-interval half-width (unknown mean, unknown
/// variance): `t_{alpha/2,n-1} * sqrt(variance * (1 + 1/n))`.
fn bound_distance(variance: f64, num_samples: usize) -> f64 {
    if num_samples <= 1 {
        0.0
    } else {
        t_value(num_samples - 1) * (variance * (1.0 + 1.0 / num_samples as f64)).sqrt()
    }
}

/// New-sample weight solved so a sample's influence decays to 1% after
/// [`MAX_SAMPLES`] further observations.
fn new_sample_weight() -> f64 {
    0.01f64.powf(1.0 / MAX_SAMPLES as f64)
}

/// Weight on the *old* value in an EWMA update (the rest goes to the new
/// sample), matching `update_ewma` below.
fn ewma_gain() -> f64 {
    1.0 - new_sample_weight()
}

fn update_ewma(ewma: &mut f64, spot: f64, gain: f64) {
    *ewma = *ewma * gain + spot * (1.0 - gain);
}

/// Which side of the confidence interval (or its midpoint) a query wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BoundType {
    Lower,
    Upper,
    Center,
}

/// Whether bound selection should favor the largest plausible gap between
/// singular and redundant strategies (Aggressive, the default) or the
/// smallest (Conservative).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalMode {
    Aggressive,
    Conservative,
}

/// Fast-tracks every sample; the slow tracker only follows along when the
/// fast tracker hasn't just jumped.
#[derive(Debug, Clone)]
struct FlipFlop {
    fast: Option<f64>,
    slow: Option<f64>,
}

impl FlipFlop {
    const FAST_GAIN: f64 = 0.3;
    const SLOW_GAIN: f64 = 0.8;
    const JUMP_THRESHOLD: f64 = 1.0;

    fn new() -> Self {
        FlipFlop {
            fast: None,
            slow: None,
        }
    }

    fn add_observation(&mut self, value: f64) -> f64 {
        let fast = match self.fast {
            None => value,
            Some(f) => f * Self::FAST_GAIN + value * (1.0 - Self::FAST_GAIN),
        };
        self.fast = Some(fast);
        let slow = match self.slow {
            None => fast,
            Some(s) => {
                if (fast - s).abs() > Self::JUMP_THRESHOLD {
                    fast
                } else {
                    s * Self::SLOW_GAIN + fast * (1.0 - Self::SLOW_GAIN)
                }
            }
        };
        self.slow = Some(slow);
        slow
    }
}

/// Raw (un-composed) error bounds, as fitted either from the unconditional
/// running stats or from a conditional replay over buffered samples.
struct Bounds {
    lower: f64,
    upper: f64,
    num_samples: usize,
}

/// Per-estimator running state: natural-log error samples, their flip-flop
/// smoothed counterparts, and the fitted confidence interval.
#[derive(Debug)]
struct ErrorBoundsState {
    log_error_mean: f64,
    log_error_variance: f64,
    m2: f64,
    num_samples: usize,
    log_error_samples: VecDeque<f64>,
    smoothed_log_error_samples: VecDeque<f64>,
    /// `[lower, upper]`, unconditional (last value set by `process_observation`).
    error_bounds: [f64; 2],
    flipflop: FlipFlop,
}

impl ErrorBoundsState {
    fn new() -> Self {
        ErrorBoundsState {
            log_error_mean: 0.0,
            log_error_variance: 0.0,
            m2: 0.0,
            num_samples: 0,
            log_error_samples: VecDeque::new(),
            smoothed_log_error_samples: VecDeque::new(),
            error_bounds: [0.0, 0.0],
            flipflop: FlipFlop::new(),
        }
    }

    fn update_linear(&mut self, smoothed: f64) {
        self.num_samples += 1;
        let delta = smoothed - self.log_error_mean;
        self.log_error_mean += delta / self.num_samples as f64;
        self.m2 += delta * (smoothed - self.log_error_mean);
        if self.num_samples > 1 {
            self.log_error_variance = self.m2 / (self.num_samples - 1) as f64;
        }
    }

    fn update_ewma(&mut self, smoothed: f64) {
        self.num_samples = (self.num_samples + 1).min(MAX_SAMPLES);
        if self.num_samples == 1 {
            self.log_error_mean = smoothed;
            self.log_error_variance = 0.0;
        } else {
            let deviation = self.log_error_mean - smoothed;
            let gain = ewma_gain();
            update_ewma(&mut self.log_error_mean, smoothed, gain);
            update_ewma(&mut self.log_error_variance, deviation * deviation, gain);
        }
    }

    /// Sets `error_bounds` from a fitted `(mean, variance, n)`, ordering
    /// lower/upper by a reference-value probe so the ordering is correct
    /// regardless of `ErrorMode`.
    fn set_bounds(&mut self, mode: ErrorMode, mean: f64, variance: f64, n: usize) {
        let d = bound_distance(variance, n);
        let a = (mean - d).exp();
        let b = (mean + d).exp();
        const REF_VALUE: f64 = 100.0;
        if mode.compose(REF_VALUE, a) < mode.compose(REF_VALUE, b) {
            self.error_bounds = [a, b];
        } else {
            self.error_bounds = [b, a];
        }
    }

    fn process_observation(&mut self, weighted: bool, mode: ErrorMode, old_estimate: f64, observation: f64) {
        let error = mode.error_sample(old_estimate, observation);
        let log_error = error.ln();
        let smoothed = self.flipflop.add_observation(log_error);

        if weighted {
            self.update_ewma(smoothed);
        } else {
            self.update_linear(smoothed);
        }

        self.log_error_samples.push_back(log_error);
        self.smoothed_log_error_samples.push_back(smoothed);
        while self.log_error_samples.len() > MAX_SAMPLES {
            self.log_error_samples.pop_front();
        }
        while self.smoothed_log_error_samples.len() > MAX_SAMPLES {
            self.smoothed_log_error_samples.pop_front();
        }

        let (mean, variance, n) = (self.log_error_mean, self.log_error_variance, self.num_samples);
        self.set_bounds(mode, mean, variance, n);
    }

    /// Pure, non-mutating conditional fit: replays the buffered smoothed
    /// samples that satisfy `[at_least, at_most]` (composed against
    /// `estimate`) through the same running-stats algorithm, then fits
    /// bounds from that local replay alone. When no condition is set this
    /// degenerates to the stored unconditional bounds, so the common case
    /// pays no replay cost.
    ///
    /// Replaying into fresh locals rather than mutating the stored bounds
    /// in place keeps this call side-effect free under concurrent readers.
    fn pruned_bounds(
        &self,
        weighted: bool,
        mode: ErrorMode,
        estimate: f64,
        at_least: Option<f64>,
        at_most: Option<f64>,
    ) -> Bounds {
        if at_least.is_none() && at_most.is_none() {
            return Bounds {
                lower: self.error_bounds[0],
                upper: self.error_bounds[1],
                num_samples: self.num_samples,
            };
        }

        let included: Vec<f64> = self
            .smoothed_log_error_samples
            .iter()
            .copied()
            .filter(|&log_error| {
                let adjusted = mode.compose(estimate, log_error.exp());
                at_least.map_or(true, |lo| adjusted >= lo) && at_most.map_or(true, |hi| adjusted <= hi)
            })
            .collect();

        let samples: Vec<f64> = if included.is_empty() {
            let lo = at_least.unwrap_or(f64::NEG_INFINITY);
            let hi = at_most.unwrap_or(f64::INFINITY);
            let target = match (lo.is_finite(), hi.is_finite()) {
                (true, true) => mode.midpoint(lo, hi),
                (true, false) => lo,
                (false, true) => hi,
                (false, false) => estimate,
            };
            vec![mode.error_for_target(estimate, target).ln()]
        } else {
            included
        };

        let mut mean = 0.0;
        let mut variance = 0.0;
        let mut m2 = 0.0;
        let mut n = 0usize;
        for &log_error in &samples {
            if weighted {
                n = (n + 1).min(MAX_SAMPLES);
                if n == 1 {
                    mean = log_error;
                    variance = 0.0;
                } else {
                    let deviation = mean - log_error;
                    let gain = ewma_gain();
                    update_ewma(&mut mean, log_error, gain);
                    update_ewma(&mut variance, deviation * deviation, gain);
                }
            } else {
                n += 1;
                let delta = log_error - mean;
                mean += delta / n as f64;
                m2 += delta * (log_error - mean);
                if n > 1 {
                    variance = m2 / (n - 1) as f64;
                }
            }
        }

        let d = bound_distance(variance, n);
        let a = (mean - d).exp();
        let b = (mean + d).exp();
        const REF_VALUE: f64 = 100.0;
        let (lower, upper) = if mode.compose(REF_VALUE, a) < mode.compose(REF_VALUE, b) {
            (a, b)
        } else {
            (b, a)
        };
        Bounds {
            lower,
            upper,
            num_samples: n,
        }
    }
}

fn sorted_handles(map: HashMap<u64, EstimatorHandle>) -> Vec<EstimatorHandle> {
    let mut v: Vec<_> = map.into_values().collect();
    v.sort_by_key(|e| e.id());
    v
}

struct CornerContext {
    assignment: HashMap<u64, f64>,
}

impl EvalContext for CornerContext {
    fn value(&self, estimator: &EstimatorHandle) -> f64 {
        self.assignment
            .get(&estimator.id())
            .copied()
            .unwrap_or_else(|| estimator.get_estimate())
    }
}

pub struct ConfidenceBoundsEvaluator {
    mode: ErrorMode,
    weighted: bool,
    eval_mode: EvalMode,
    states: Mutex<HashMap<String, ErrorBoundsState>>,
    cache: Mutex<HashMap<(usize, usize, ComparisonType, bool), f64>>,
    last_chooser_arg: Mutex<Option<f64>>,
}

impl ConfidenceBoundsEvaluator {
    pub fn new(method: EvalMethod) -> Arc<Self> {
        let (weighted, mode) = match method {
            EvalMethod::ConfidenceBounds { weighted, mode } => (weighted, mode),
            _ => panic!("ConfidenceBoundsEvaluator::new requires EvalMethod::ConfidenceBounds"),
        };
        Arc::new(ConfidenceBoundsEvaluator {
            mode,
            weighted,
            eval_mode: EvalMode::Aggressive,
            states: Mutex::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
            last_chooser_arg: Mutex::new(None),
        })
    }

    pub fn with_eval_mode(method: EvalMethod, eval_mode: EvalMode) -> Arc<Self> {
        let (weighted, mode) = match method {
            EvalMethod::ConfidenceBounds { weighted, mode } => (weighted, mode),
            _ => panic!("ConfidenceBoundsEvaluator::with_eval_mode requires EvalMethod::ConfidenceBounds"),
        };
        Arc::new(ConfidenceBoundsEvaluator {
            mode,
            weighted,
            eval_mode,
            states: Mutex::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
            last_chooser_arg: Mutex::new(None),
        })
    }

    fn bound_pair(&self, estimator: &EstimatorHandle) -> (f64, f64) {
        let states = self.states.lock().unwrap();
        let estimate = estimator.get_estimate();
        match states.get(estimator.name()) {
            None => (estimate, estimate),
            Some(state) => {
                let (at_least, at_most) = estimator.conditions();
                let b = state.pruned_bounds(self.weighted, self.mode, estimate, at_least, at_most);
                (
                    self.mode.compose(estimate, b.lower),
                    self.mode.compose(estimate, b.upper),
                )
            }
        }
    }

    /// A cost function's own `[ENERGY_FN]`/`[DATA_FN]` are always bound from
    /// below (we want an upper bound on redundancy's net *benefit*, so its
    /// cost side should be as small as plausible); otherwise the selection
    /// depends on whether this singular strategy is standing in for a
    /// redundant candidate (`is_redundant_context`) and which comparison the
    /// chooser is making.
    fn bound_type(
        &self,
        is_redundant_context: bool,
        fn_: &Arc<dyn CostFn>,
        strategy: &SingularStrategy,
        comparison: ComparisonType,
    ) -> BoundType {
        match self.eval_mode {
            EvalMode::Aggressive => {
                let is_cost_fn = Arc::ptr_eq(fn_, &strategy.energy_fn) || Arc::ptr_eq(fn_, &strategy.data_fn);
                if is_cost_fn {
                    BoundType::Lower
                } else if is_redundant_context {
                    BoundType::Lower
                } else if comparison == ComparisonType::SingularToSingular {
                    BoundType::Center
                } else {
                    BoundType::Upper
                }
            }
            EvalMode::Conservative => {
                if is_redundant_context {
                    BoundType::Upper
                } else {
                    BoundType::Lower
                }
            }
        }
    }

    fn evaluate(
        &self,
        strategy: &SingularStrategy,
        fn_: &Arc<dyn CostFn>,
        strategy_arg: f64,
        chooser_arg: f64,
        comparison: ComparisonType,
        is_redundant_context: bool,
    ) -> f64 {
        {
            let mut last = self.last_chooser_arg.lock().unwrap();
            if *last != Some(chooser_arg) {
                self.cache.lock().unwrap().clear();
                *last = Some(chooser_arg);
            }
        }

        let key = (
            strategy as *const SingularStrategy as usize,
            Arc::as_ptr(fn_) as *const () as usize,
            comparison,
            is_redundant_context,
        );
        if let Some(&v) = self.cache.lock().unwrap().get(&key) {
            return v;
        }

        let bt = self.bound_type(is_redundant_context, fn_, strategy, comparison);
        let ests = sorted_handles(strategy.uses_for(fn_));

        let value = match bt {
            BoundType::Center => {
                let assignment = ests
                    .iter()
                    .map(|e| (e.id(), self.adjusted_estimator_value(e)))
                    .collect();
                let ctx = CornerContext { assignment };
                fn_.call(&ctx, strategy_arg, chooser_arg)
            }
            BoundType::Lower | BoundType::Upper => {
                if ests.is_empty() {
                    let ctx = CornerContext {
                        assignment: HashMap::new(),
                    };
                    fn_.call(&ctx, strategy_arg, chooser_arg)
                } else {
                    let pairs: Vec<(u64, f64, f64)> = ests.iter().map(|e| {
                        let (lo, up) = self.bound_pair(e);
                        (e.id(), lo, up)
                    }).collect();
                    let n = pairs.len();
                    let mut best = if bt == BoundType::Lower {
                        f64::INFINITY
                    } else {
                        f64::NEG_INFINITY
                    };
                    for mask in 0..(1usize << n) {
                        let assignment = pairs
                            .iter()
                            .enumerate()
                            .map(|(j, &(id, lo, up))| {
                                let bit = (mask >> j) & 1;
                                (id, if bit == 0 { lo } else { up })
                            })
                            .collect();
                        let ctx = CornerContext { assignment };
                        let v = fn_.call(&ctx, strategy_arg, chooser_arg);
                        best = if bt == BoundType::Lower { best.min(v) } else { best.max(v) };
                    }
                    best
                }
            }
        };

        self.cache.lock().unwrap().insert(key, value);
        value
    }
}

impl Evaluator for ConfidenceBoundsEvaluator {
    fn adjusted_estimator_value(&self, estimator: &EstimatorHandle) -> f64 {
        let states = self.states.lock().unwrap();
        let estimate = estimator.get_estimate();
        match states.get(estimator.name()) {
            None => estimate,
            Some(state) => {
                let (at_least, at_most) = estimator.conditions();
                let b = state.pruned_bounds(self.weighted, self.mode, estimate, at_least, at_most);
                if b.num_samples == 0 {
                    self.mode.compose(estimate, self.mode.identity())
                } else {
                    self.mode.compose(estimate, self.mode.midpoint(b.lower, b.upper))
                }
            }
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
        self.evaluate(strategy, fn_, strategy_arg, chooser_arg, comparison, false)
    }

    fn expected_value(
        &self,
        strategy: &Strategy,
        fn_: &Arc<dyn CostFn>,
        strategy_arg: f64,
        chooser_arg: f64,
        comparison: ComparisonType,
    ) -> f64 {
        match strategy {
            Strategy::Singular(s) => self.evaluate(s, fn_, strategy_arg, chooser_arg, comparison, false),
            Strategy::Redundant(r) => {
                let kind = fn_
                    .combiner()
                    .expect("redundant strategies must be queried with a combiner fn");
                let values: Vec<f64> = r
                    .children
                    .iter()
                    .map(|c| self.evaluate(c, c.fn_for(kind), c.strategy_arg, chooser_arg, comparison, true))
                    .collect();
                combine(kind, &values)
            }
        }
    }
}

impl ObservationSink for ConfidenceBoundsEvaluator {
    fn sink_id(&self) -> u64 {
        self as *const _ as u64
    }

    fn observation_added(&self, estimator: &Estimator, obs: Observation) {
        if !is_valid(obs.old_estimate) {
            return;
        }
        {
            let mut states = self.states.lock().unwrap();
            let state = states
                .entry(estimator.name().to_string())
                .or_insert_with(ErrorBoundsState::new);
            state.process_observation(self.weighted, self.mode, obs.old_estimate, obs.value);
        }
        self.cache.lock().unwrap().clear();
    }

    fn conditions_changed(&self, _estimator: &Estimator) {
        self.cache.lock().unwrap().clear();
    }

    fn forget(&self, estimator_name: &str) {
        self.states.lock().unwrap().remove(estimator_name);
    }
}

impl Persist for ConfidenceBoundsEvaluator {
    fn save_to(&self, out: &mut dyn Write) -> std::io::Result<()> {
        let states = self.states.lock().unwrap();
        let mut entries: Vec<_> = states.iter().collect();
        entries.sort_by_key(|(name, _)| (*name).clone());
        writeln!(out, "{} estimator-bounds", entries.len())?;
        for (name, state) in entries {
            write!(
                out,
                "{} num_samples {} mean {} variance {} M2 {} bounds {} {} samples ",
                name,
                state.num_samples,
                state.log_error_mean,
                state.log_error_variance,
                state.m2,
                state.error_bounds[0],
                state.error_bounds[1],
            )?;
            write!(out, "{}", state.log_error_samples.len())?;
            for v in &state.log_error_samples {
                write!(out, " {v}")?;
            }
            writeln!(out)?;
        }
        Ok(())
    }

    fn restore_from(&self, input: &mut dyn BufRead) -> Result<()> {
        let mut states = self.states.lock().unwrap();
        states.clear();
        let mut header = String::new();
        input
            .read_line(&mut header)
            .map_err(|e| Error::io("<evaluator-stream>", e))?;
        let k: usize = header
            .split_whitespace()
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::corrupt("missing estimator-bounds count header"))?;

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

            let expect_tag = |tokens: &mut std::str::SplitWhitespace<'_>, expected: &str| -> Result<()> {
                let tag = tokens.next().ok_or_else(|| Error::corrupt("missing field tag"))?;
                if tag != expected {
                    return Err(Error::corrupt(format!("expected tag {expected:?}, got {tag:?}")));
                }
                Ok(())
            };
            let parse_f64 = |tokens: &mut std::str::SplitWhitespace<'_>| -> Result<f64> {
                tokens
                    .next()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| Error::corrupt("bad floating-point field"))
            };

            expect_tag(&mut tokens, "num_samples")?;
            let num_samples: usize = tokens
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| Error::corrupt("bad num_samples"))?;
            expect_tag(&mut tokens, "mean")?;
            let mean = parse_f64(&mut tokens)?;
            expect_tag(&mut tokens, "variance")?;
            let variance = parse_f64(&mut tokens)?;
            expect_tag(&mut tokens, "M2")?;
            let m2 = parse_f64(&mut tokens)?;
            expect_tag(&mut tokens, "bounds")?;
            let lower = parse_f64(&mut tokens)?;
            let upper = parse_f64(&mut tokens)?;
            expect_tag(&mut tokens, "samples")?;
            let n: usize = tokens
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| Error::corrupt("bad sample count"))?;

            let mut state = ErrorBoundsState {
                log_error_mean: mean,
                log_error_variance: variance,
                m2,
                num_samples,
                log_error_samples: VecDeque::with_capacity(n),
                smoothed_log_error_samples: VecDeque::with_capacity(n),
                error_bounds: [lower, upper],
                flipflop: FlipFlop::new(),
            };
            for _ in 0..n {
                let raw: f64 = tokens
                    .next()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| Error::corrupt("bad sample value"))?;
                let smoothed = state.flipflop.add_observation(raw);
                state.log_error_samples.push_back(raw);
                state.smoothed_log_error_samples.push_back(smoothed);
            }
            states.insert(name, state);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::cost_fn;

    fn feed(e: &EstimatorHandle, values: &[f64]) {
        for &v in values {
            e.add_observation(v);
        }
    }

    #[test]
    fn lower_bound_never_exceeds_upper() {
        let bw = EstimatorHandle::new_last_observation("confidence_bound_order_bw").unwrap();
        let eval = ConfidenceBoundsEvaluator::new(EvalMethod::ConfidenceBounds {
            weighted: false,
            mode: ErrorMode::Relative,
        });
        let sink: Arc<dyn ObservationSink> = eval.clone();
        bw.subscribe(sink);
        feed(&bw, &[1000.0, 1200.0, 900.0, 1100.0, 1050.0, 950.0]);

        let (lower, upper) = eval.bound_pair(&bw);
        assert!(lower <= upper);
    }

    #[test]
    fn expected_value_uses_center_for_singular_to_singular() {
        let bw = EstimatorHandle::new_last_observation("confidence_center_bw").unwrap();
        let eval = ConfidenceBoundsEvaluator::new(EvalMethod::ConfidenceBounds {
            weighted: false,
            mode: ErrorMode::Relative,
        });
        let sink: Arc<dyn ObservationSink> = eval.clone();
        bw.subscribe(sink);
        feed(&bw, &[1000.0, 1100.0, 900.0, 1050.0]);

        let bw2 = bw.clone();
        let time = cost_fn(move |ctx, sarg, _carg| sarg / ctx.value(&bw2));
        let s = SingularStrategy::new(
            "s",
            time,
            cost_fn(|_c, _s, _a| 0.0),
            cost_fn(|_c, _s, _a| 0.0),
            4000.0,
            0.0,
        );
        let v = eval.expected_value_singular(
            &s,
            &s.time_fn,
            s.strategy_arg,
            0.0,
            ComparisonType::SingularToSingular,
        );
        assert!(v.is_finite() && v > 0.0);
    }

    #[test]
    fn save_restore_round_trips_bounds() {
        let bw = EstimatorHandle::new_last_observation("confidence_restore_bw").unwrap();
        let eval = ConfidenceBoundsEvaluator::new(EvalMethod::ConfidenceBounds {
            weighted: false,
            mode: ErrorMode::Relative,
        });
        let sink: Arc<dyn ObservationSink> = eval.clone();
        bw.subscribe(sink);
        feed(&bw, &[1000.0, 1200.0, 900.0]);

        let mut buf = Vec::new();
        eval.save_to(&mut buf).unwrap();

        let restored = ConfidenceBoundsEvaluator::new(EvalMethod::ConfidenceBounds {
            weighted: false,
            mode: ErrorMode::Relative,
        });
        let mut cursor = std::io::Cursor::new(buf);
        restored.restore_from(&mut cursor).unwrap();

        let before = eval.bound_pair(&bw);
        let after = restored.bound_pair(&bw);
        assert!((before.0 - after.0).abs() < 1e-9);
        assert!((before.1 - after.1).abs() < 1e-9);
    }
}
