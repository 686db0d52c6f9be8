//! Error-sample arithmetic and the two `StatsDistribution` variants.

use std::collections::VecDeque;

/// Whether error samples are relative (`observation / prev_estimate`) or
/// absolute (`prev_estimate - observation`). A construction-time policy,
/// not a compile-time macro.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorMode {
    Relative,
    Absolute,
}

impl ErrorMode {
    /// The "no error" value folded into a freshly seeded distribution.
    pub fn identity(self) -> f64 {
        match self {
            ErrorMode::Relative => 1.0,
            ErrorMode::Absolute => 0.0,
        }
    }

    pub fn error_sample(self, old_estimate: f64, observation: f64) -> f64 {
        match self {
            ErrorMode::Relative => {
                if old_estimate == 0.0 {
                    self.identity()
                } else {
                    observation / old_estimate
                }
            }
            ErrorMode::Absolute => old_estimate - observation,
        }
    }

    /// `adjusted_estimate(estimate, error)`.
    pub fn compose(self, estimate: f64, error: f64) -> f64 {
        match self {
            ErrorMode::Relative => estimate * error,
            ErrorMode::Absolute => estimate - error,
        }
    }

    /// The error sample that would compose with `estimate` to produce
    /// exactly `target` — used to synthesize a sample at a condition's
    /// bound midpoint when pruning empties a distribution.
    pub fn error_for_target(self, estimate: f64, target: f64) -> f64 {
        match self {
            ErrorMode::Relative => {
                if estimate == 0.0 {
                    self.identity()
                } else {
                    target / estimate
                }
            }
            ErrorMode::Absolute => estimate - target,
        }
    }

    pub fn midpoint(self, a: f64, b: f64) -> f64 {
        match self {
            ErrorMode::Relative => (a * b).sqrt(),
            ErrorMode::Absolute => (a + b) / 2.0,
        }
    }
}

/// A restartable snapshot of `(value, probability)` pairs with probabilities
/// summing to 1 (or empty, before the first sample).
pub trait StatsDistribution: std::fmt::Debug + Send {
    fn add_value(&mut self, value: f64);
    fn total_count(&self) -> u64;
    fn snapshot(&self) -> Vec<(f64, f64)>;
}

/// Which `StatsDistribution` variant an evaluator was configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistributionKind {
    AllSamples,
    Binned,
}

/// Closed tagged enum over the two `StatsDistribution` variants — used in
/// place of a trait object wherever persistence or other format-specific
/// code needs to see past the shared interface.
#[derive(Debug, Clone)]
pub enum Dist {
    All(AllSamplesDistribution),
    Binned(BinnedDistribution),
}

impl Dist {
    pub fn new(kind: DistributionKind, weighted: bool, range: Option<(f64, f64, usize)>) -> Self {
        match kind {
            DistributionKind::AllSamples => Dist::All(AllSamplesDistribution::new(weighted)),
            DistributionKind::Binned => Dist::Binned(match range {
                Some((min, max, bins)) => BinnedDistribution::with_range(min, max, bins),
                None => BinnedDistribution::auto_fit(),
            }),
        }
    }

    pub fn raw_samples(&self) -> Option<Vec<f64>> {
        match self {
            Dist::All(d) => Some(d.raw_samples()),
            Dist::Binned(_) => None,
        }
    }

    pub fn is_weighted(&self) -> bool {
        match self {
            Dist::All(d) => d.is_weighted(),
            Dist::Binned(_) => false,
        }
    }

    pub fn as_binned(&self) -> Option<&BinnedDistribution> {
        match self {
            Dist::Binned(d) => Some(d),
            Dist::All(_) => None,
        }
    }
}

impl StatsDistribution for Dist {
    fn add_value(&mut self, value: f64) {
        match self {
            Dist::All(d) => d.add_value(value),
            Dist::Binned(d) => d.add_value(value),
        }
    }
    fn total_count(&self) -> u64 {
        match self {
            Dist::All(d) => d.total_count(),
            Dist::Binned(d) => d.total_count(),
        }
    }
    fn snapshot(&self) -> Vec<(f64, f64)> {
        match self {
            Dist::All(d) => d.snapshot(),
            Dist::Binned(d) => d.snapshot(),
        }
    }
}

pub const MAX_SAMPLES: usize = 20;

#[derive(Debug, Clone)]
pub struct AllSamplesDistribution {
    samples: VecDeque<f64>,
    weighted: bool,
}

impl AllSamplesDistribution {
    pub fn new(weighted: bool) -> Self {
        AllSamplesDistribution {
            samples: VecDeque::with_capacity(MAX_SAMPLES),
            weighted,
        }
    }

    /// ρ such that the oldest of `MAX_SAMPLES` samples has weight 0.01.
    fn rho() -> f64 {
        0.01f64.powf(1.0 / (MAX_SAMPLES as f64 - 1.0))
    }

    /// Raw samples, oldest first — used for persistence, which stores exact
    /// values rather than the derived snapshot weights.
    pub fn raw_samples(&self) -> Vec<f64> {
        self.samples.iter().copied().collect()
    }

    pub fn is_weighted(&self) -> bool {
        self.weighted
    }

    pub fn restore(weighted: bool, samples: Vec<f64>) -> Self {
        AllSamplesDistribution {
            samples: samples.into(),
            weighted,
        }
    }
}

impl StatsDistribution for AllSamplesDistribution {
    fn add_value(&mut self, value: f64) {
        if self.samples.len() == MAX_SAMPLES {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    fn total_count(&self) -> u64 {
        self.samples.len() as u64
    }

    fn snapshot(&self) -> Vec<(f64, f64)> {
        let n = self.samples.len();
        if n == 0 {
            return Vec::new();
        }
        if !self.weighted {
            let p = 1.0 / n as f64;
            return self.samples.iter().map(|&v| (v, p)).collect();
        }
        let rho = Self::rho();
        // oldest (index 0) gets the smallest weight rho^(n-1), newest gets rho^0.
        let weights: Vec<f64> = (0..n).map(|i| rho.powi((n - 1 - i) as i32)).collect();
        let total: f64 = weights.iter().sum();
        self.samples
            .iter()
            .zip(weights.iter())
            .map(|(&v, &w)| (v, w / total))
            .collect()
    }
}

/// Number of raw samples buffered before an auto-fit of bin breaks is
/// attempted, absent explicit range hints.
pub const AUTO_FIT_THRESHOLD: usize = 50;

#[derive(Debug, Clone)]
pub struct BinnedDistribution {
    breaks: Vec<f64>,
    counts: Vec<u64>,
    tail_low_sum: f64,
    tail_low_count: u64,
    tail_high_sum: f64,
    tail_high_count: u64,
    total: u64,
    pending: Vec<f64>,
}

impl BinnedDistribution {
    /// Construct with explicit, evenly-spaced breaks derived from range
    /// hints — the preferred construction path over guessing bounds from
    /// the first few observations.
    pub fn with_range(min: f64, max: f64, num_bins: usize) -> Self {
        let num_bins = num_bins.max(1);
        let width = (max - min) / num_bins as f64;
        let breaks: Vec<f64> = (1..num_bins).map(|i| min + width * i as f64).collect();
        BinnedDistribution {
            counts: vec![0; breaks.len() + 1],
            breaks,
            tail_low_sum: 0.0,
            tail_low_count: 0,
            tail_high_sum: 0.0,
            tail_high_count: 0,
            total: 0,
            pending: Vec::new(),
        }
    }

    /// Construct with no prior hints: samples are buffered until
    /// [`AUTO_FIT_THRESHOLD`] is reached, then a Scott's-rule break set is
    /// fit. See module docs — no embedded statistical interpreter.
    pub fn auto_fit() -> Self {
        BinnedDistribution {
            breaks: Vec::new(),
            counts: Vec::new(),
            tail_low_sum: 0.0,
            tail_low_count: 0,
            tail_high_sum: 0.0,
            tail_high_count: 0,
            total: 0,
            pending: Vec::new(),
        }
    }

    fn has_breaks(&self) -> bool {
        !self.breaks.is_empty() || !self.counts.is_empty()
    }

    /// Scott's rule: bin width = 3.49 * std * n^(-1/3).
    fn fit_breaks(samples: &[f64]) -> Vec<f64> {
        let n = samples.len() as f64;
        let mean = samples.iter().sum::<f64>() / n;
        let var = samples.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0).max(1.0);
        let std = var.sqrt();
        let min = samples.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = samples.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        if std <= 0.0 || !std.is_finite() || max <= min {
            return Vec::new();
        }
        let width = 3.49 * std * n.powf(-1.0 / 3.0);
        let num_bins = (((max - min) / width).ceil() as usize).max(1);
        let step = (max - min) / num_bins as f64;
        (1..num_bins).map(|i| min + step * i as f64).collect()
    }

    fn classify(&self, x: f64) -> usize {
        self.breaks.partition_point(|&b| x > b)
    }

    fn place(&mut self, value: f64) {
        let idx = self.classify(value);
        self.counts[idx] += 1;
        self.total += 1;
        if idx == 0 {
            self.tail_low_sum += value;
            self.tail_low_count += 1;
        } else if idx == self.counts.len() - 1 {
            self.tail_high_sum += value;
            self.tail_high_count += 1;
        }
    }
}

impl StatsDistribution for BinnedDistribution {
    fn add_value(&mut self, value: f64) {
        if !self.has_breaks() {
            self.pending.push(value);
            if self.pending.len() >= AUTO_FIT_THRESHOLD {
                let fitted = Self::fit_breaks(&self.pending);
                self.breaks = fitted;
                self.counts = vec![0; self.breaks.len() + 1];
                let pending = std::mem::take(&mut self.pending);
                for v in pending {
                    self.place(v);
                }
            }
            return;
        }
        self.place(value);
    }

    fn total_count(&self) -> u64 {
        self.total + self.pending.len() as u64
    }

    fn snapshot(&self) -> Vec<(f64, f64)> {
        if !self.has_breaks() {
            // Not yet fit: fall back to point masses over whatever was
            // observed so far, uniform weight — identical in shape to an
            // All-Samples distribution during warm-up.
            let n = self.pending.len();
            if n == 0 {
                return Vec::new();
            }
            let p = 1.0 / n as f64;
            return self.pending.iter().map(|&v| (v, p)).collect();
        }
        if self.total == 0 {
            return Vec::new();
        }
        let mut out = Vec::new();
        let last = self.counts.len() - 1;
        for (idx, &count) in self.counts.iter().enumerate() {
            if count == 0 {
                continue;
            }
            let value = if idx == 0 {
                self.tail_low_sum / self.tail_low_count as f64
            } else if idx == last {
                self.tail_high_sum / self.tail_high_count as f64
            } else {
                (self.breaks[idx - 1] + self.breaks[idx]) / 2.0
            };
            out.push((value, count as f64 / self.total as f64));
        }
        out
    }

    // `bin_index_of`/`bin_midpoint` below support the Bayesian evaluator's
    // key construction, which needs a stable index rather than a raw value.
}

impl BinnedDistribution {
    pub fn bin_index_of(&self, value: f64) -> usize {
        if !self.has_breaks() {
            return 0;
        }
        self.classify(value)
    }

    pub fn bin_midpoint(&self, idx: usize) -> f64 {
        if !self.has_breaks() {
            // Not yet fit: every sample classifies into bin 0 (see
            // `classify`/`bin_index_of`), so fall back to the mean of what's
            // been observed so far rather than an arbitrary placeholder.
            return if self.pending.is_empty() {
                0.0
            } else {
                self.pending.iter().sum::<f64>() / self.pending.len() as f64
            };
        }
        let last = self.counts.len().saturating_sub(1);
        if idx == 0 && self.tail_low_count > 0 {
            return self.tail_low_sum / self.tail_low_count as f64;
        }
        if idx == last && self.tail_high_count > 0 {
            return self.tail_high_sum / self.tail_high_count as f64;
        }
        if idx > 0 && idx < self.breaks.len() + 1 && idx <= last {
            if idx == 0 || idx == last {
                return 0.0;
            }
            return (self.breaks[idx - 1] + self.breaks[idx]) / 2.0;
        }
        0.0
    }

    pub fn num_bins(&self) -> usize {
        self.counts.len().max(1)
    }

    /// Probability mass of the bin a value falls into — used by the
    /// Bayesian evaluator to weight a likelihood key's joint prior.
    pub fn bin_probability(&self, value: f64) -> f64 {
        if !self.has_breaks() {
            // Every sample classifies into the same implicit bin until
            // breaks are fit, so that bin's mass is the whole distribution.
            return 1.0;
        }
        if self.total == 0 {
            return 0.0;
        }
        let idx = self.bin_index_of(value);
        self.counts[idx] as f64 / self.total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_samples_unweighted_sums_to_one() {
        let mut d = AllSamplesDistribution::new(false);
        for v in [1.0, 2.0, 3.0] {
            d.add_value(v);
        }
        let snap = d.snapshot();
        let total: f64 = snap.iter().map(|(_, p)| p).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn all_samples_weighted_favors_recent() {
        let mut d = AllSamplesDistribution::new(true);
        for v in 0..MAX_SAMPLES {
            d.add_value(v as f64);
        }
        let snap = d.snapshot();
        let (_, p_oldest) = snap[0];
        let (_, p_newest) = snap[snap.len() - 1];
        assert!(p_newest > p_oldest);
        let total: f64 = snap.iter().map(|(_, p)| p).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn all_samples_evicts_oldest() {
        let mut d = AllSamplesDistribution::new(false);
        for v in 0..(MAX_SAMPLES + 5) {
            d.add_value(v as f64);
        }
        assert_eq!(d.total_count(), MAX_SAMPLES as u64);
    }

    #[test]
    fn binned_with_range_sums_to_one() {
        let mut d = BinnedDistribution::with_range(0.0, 10.0, 5);
        for v in [1.0, 2.0, 9.0, 15.0, -3.0] {
            d.add_value(v);
        }
        let snap = d.snapshot();
        let total: f64 = snap.iter().map(|(_, p)| p).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn error_mode_identity_and_compose() {
        assert_eq!(ErrorMode::Relative.identity(), 1.0);
        assert_eq!(ErrorMode::Absolute.identity(), 0.0);
        assert_eq!(ErrorMode::Relative.compose(10.0, 1.0), 10.0);
        assert_eq!(ErrorMode::Absolute.compose(10.0, 0.0), 10.0);
    }
}
