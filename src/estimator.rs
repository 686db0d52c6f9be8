//! Estimators and the observation bus.
//!
//! Three built-in estimation rules share one struct: Last-Observation,
//! Running-Mean, and External (the caller supplies `new_estimate` itself).
//! Each estimator owns two locks, state then subscribers, acquired in that
//! fixed order everywhere — this is the base of the locking graph in §9.

use std::collections::{HashMap, HashSet};
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crate::error::{Error, Result};

/// Live estimator names, so construction can reject a duplicate instead of
/// leaving name-keyed lookups (persistence, Bayesian decision snapshots)
/// ambiguous about which estimator a name refers to.
fn live_names() -> &'static Mutex<HashSet<String>> {
    static REGISTRY: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Sentinel for "no estimate yet" — distinct from any value a real signal
/// can take.
pub const INVALID_ESTIMATE: f64 = f64::MAX;

pub fn is_valid(v: f64) -> bool {
    v != INVALID_ESTIMATE
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstimatorKind {
    LastObservation,
    RunningMean,
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionKind {
    AtLeast,
    AtMost,
}

#[derive(Debug, Clone, Copy)]
pub struct RangeHints {
    pub min: f64,
    pub max: f64,
    pub num_bins: usize,
}

/// `(estimator, observation, old_estimate, new_estimate)`, broadcast to
/// subscribers after every `add_observation`.
#[derive(Debug, Clone, Copy)]
pub struct Observation {
    pub value: f64,
    pub old_estimate: f64,
    pub new_estimate: f64,
}

/// An evaluator subscribes to every estimator its strategies use. Object-safe
/// so estimators can hold `Arc<dyn ObservationSink>` without knowing which
/// concrete evaluator is listening.
pub trait ObservationSink: Send + Sync {
    /// Stable identity used for set semantics in the subscriber registry.
    fn sink_id(&self) -> u64;
    fn observation_added(&self, estimator: &Estimator, obs: Observation);
    fn conditions_changed(&self, estimator: &Estimator);
    /// Called once, from the estimator's `Drop`, so a subscriber can forget
    /// cached state keyed by this estimator's name.
    fn forget(&self, estimator_name: &str);
}

#[derive(Debug)]
struct EstimatorState {
    kind: EstimatorKind,
    has_estimate: bool,
    estimate: f64,
    // Running-Mean bookkeeping.
    sum: f64,
    count: u64,
    at_least: Option<f64>,
    at_most: Option<f64>,
    range_hints: Option<RangeHints>,
}

impl EstimatorState {
    fn new(kind: EstimatorKind) -> Self {
        EstimatorState {
            kind,
            has_estimate: false,
            estimate: INVALID_ESTIMATE,
            sum: 0.0,
            count: 0,
            at_least: None,
            at_most: None,
            range_hints: None,
        }
    }

    fn fold(&mut self, value: f64, new_estimate_external: Option<f64>) -> f64 {
        let new_estimate = match self.kind {
            EstimatorKind::LastObservation => value,
            EstimatorKind::RunningMean => {
                self.sum += value;
                self.count += 1;
                self.sum / self.count as f64
            }
            EstimatorKind::External => new_estimate_external
                .expect("External estimator requires new_estimate on every observation"),
        };
        self.estimate = new_estimate;
        self.has_estimate = true;
        new_estimate
    }
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
pub struct Estimator {
    id: u64,
    name: String,
    state: Mutex<EstimatorState>,
    subscribers: Mutex<HashMap<u64, Arc<dyn ObservationSink>>>,
}

impl Estimator {
    fn fold_name(raw: &str) -> Result<String> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(Error::configuration("estimator name must not be empty"));
        }
        Ok(trimmed
            .chars()
            .map(|c| if c.is_whitespace() { '_' } else { c })
            .collect())
    }

    pub fn new(name: &str, kind: EstimatorKind) -> Result<EstimatorHandle> {
        let name = Self::fold_name(name)?;
        {
            let mut names = live_names().lock().unwrap();
            if !names.insert(name.clone()) {
                return Err(Error::configuration(format!(
                    "estimator {name:?} already exists"
                )));
            }
        }
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        log::info!("estimator {name:?} (id {id}) created as {kind:?}");
        Ok(EstimatorHandle(Arc::new(Estimator {
            id,
            name,
            state: Mutex::new(EstimatorState::new(kind)),
            subscribers: Mutex::new(HashMap::new()),
        })))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> EstimatorKind {
        self.state.lock().unwrap().kind
    }

    /// Appends a new sample. `new_estimate` is required for `External`
    /// estimators and ignored otherwise. Returns the observation that was
    /// broadcast to subscribers.
    pub fn add_observation(&self, value: f64, new_estimate: Option<f64>) -> Observation {
        let obs = {
            let mut state = self.state.lock().unwrap();
            let old_estimate = if state.has_estimate {
                state.estimate
            } else {
                INVALID_ESTIMATE
            };
            let new_estimate = state.fold(value, new_estimate);
            Observation {
                value,
                old_estimate,
                new_estimate,
            }
        };
        self.notify_observation(obs);
        obs
    }

    pub fn get_estimate(&self) -> f64 {
        let state = self.state.lock().unwrap();
        if state.has_estimate {
            state.estimate
        } else {
            INVALID_ESTIMATE
        }
    }

    pub fn has_estimate(&self) -> bool {
        self.state.lock().unwrap().has_estimate
    }

    pub fn set_condition(&self, kind: ConditionKind, v: f64) {
        {
            let mut state = self.state.lock().unwrap();
            match kind {
                ConditionKind::AtLeast => {
                    state.at_least = Some(v);
                    if let Some(at_most) = state.at_most {
                        if at_most < v {
                            state.at_least = Some(at_most);
                        }
                    }
                }
                ConditionKind::AtMost => {
                    state.at_most = Some(v);
                    if let Some(at_least) = state.at_least {
                        if at_least > v {
                            state.at_most = Some(at_least);
                        }
                    }
                }
            }
        }
        self.notify_conditions_changed();
    }

    pub fn clear_conditions(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.at_least = None;
            state.at_most = None;
        }
        self.notify_conditions_changed();
    }

    pub fn conditions(&self) -> (Option<f64>, Option<f64>) {
        let state = self.state.lock().unwrap();
        (state.at_least, state.at_most)
    }

    pub fn set_range_hints(&self, min: f64, max: f64, num_bins: usize) {
        let mut state = self.state.lock().unwrap();
        state.range_hints = Some(RangeHints { min, max, num_bins });
    }

    pub fn range_hints(&self) -> Option<RangeHints> {
        self.state.lock().unwrap().range_hints
    }

    pub fn subscribe(&self, sink: Arc<dyn ObservationSink>) {
        let mut subs = self.subscribers.lock().unwrap();
        subs.entry(sink.sink_id()).or_insert(sink);
    }

    pub fn unsubscribe(&self, sink_id: u64) {
        let mut subs = self.subscribers.lock().unwrap();
        subs.remove(&sink_id);
    }

    fn notify_observation(&self, obs: Observation) {
        let subs: Vec<_> = self.subscribers.lock().unwrap().values().cloned().collect();
        for sink in subs {
            sink.observation_added(self, obs);
        }
    }

    fn notify_conditions_changed(&self) {
        log::debug!("estimator {:?} conditions changed", self.name);
        let subs: Vec<_> = self.subscribers.lock().unwrap().values().cloned().collect();
        for sink in subs {
            sink.conditions_changed(self);
        }
    }
}

impl Drop for Estimator {
    fn drop(&mut self) {
        live_names().lock().unwrap().remove(&self.name);
        let subs: Vec<_> = self.subscribers.lock().unwrap().values().cloned().collect();
        for sink in subs {
            sink.forget(&self.name);
        }
    }
}

/// Sealed, `Arc`-backed handle to an estimator. Cheap to clone; the
/// underlying `Estimator` is kept alive as long as any handle (or evaluator
/// subscription) references it.
#[derive(Debug, Clone)]
pub struct EstimatorHandle(Arc<Estimator>);

impl EstimatorHandle {
    pub fn new_last_observation(name: &str) -> Result<Self> {
        Estimator::new(name, EstimatorKind::LastObservation)
    }

    pub fn new_running_mean(name: &str) -> Result<Self> {
        Estimator::new(name, EstimatorKind::RunningMean)
    }

    pub fn new_external(name: &str) -> Result<Self> {
        Estimator::new(name, EstimatorKind::External)
    }

    pub fn add_observation(&self, value: f64) -> Observation {
        self.0.add_observation(value, None)
    }

    pub fn add_observation_external(&self, value: f64, new_estimate: f64) -> Observation {
        self.0.add_observation(value, Some(new_estimate))
    }
}

impl Deref for EstimatorHandle {
    type Target = Estimator;
    fn deref(&self) -> &Estimator {
        &self.0
    }
}

impl PartialEq for EstimatorHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for EstimatorHandle {}

impl std::hash::Hash for EstimatorHandle {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}
