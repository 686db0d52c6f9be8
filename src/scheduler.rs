//! Asynchronous chooser and scheduled re-evaluation: a
//! fixed-size OS-thread pool drains a FIFO of one-shot "choose now" tasks;
//! a dedicated timer thread drains a deadline-ordered priority queue of
//! scheduled re-evaluations. Workers and the timer thread block on condition
//! variables while idle — there is no polling.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::chooser::Chooser;
use crate::eval::Evaluator;
use crate::strategy::Strategy;

type ChooseCallback = Box<dyn FnOnce(Option<Strategy>) + Send>;
type PreCallback = Box<dyn FnOnce() + Send>;
type PostCallback = Box<dyn FnOnce(Option<Strategy>) + Send>;

fn default_worker_count() -> usize {
    num_cpus::get().clamp(1, 3)
}

/// A unit of work run on the worker pool: evaluate, then hand the winner to
/// the caller's callback.
struct OneShotTask {
    evaluator: Arc<dyn Evaluator>,
    chooser: Arc<Chooser>,
    chooser_arg: f64,
    callback: ChooseCallback,
}

impl OneShotTask {
    fn run(self) {
        let winner = self.chooser.choose(&*self.evaluator, self.chooser_arg);
        (self.callback)(winner);
    }
}

/// A scheduled re-evaluation. Shared between the timer heap entry and the
/// handle returned to the caller, so `cancel()` can flip the flag the timer
/// thread checks right before running it: cooperative, idempotent
/// cancellation — a task already running is not interrupted.
struct ScheduledTask {
    evaluator: Arc<dyn Evaluator>,
    chooser: Arc<Chooser>,
    chooser_arg: f64,
    pre: Mutex<Option<PreCallback>>,
    post: Mutex<Option<PostCallback>>,
    cancelled: Arc<AtomicBool>,
}

impl ScheduledTask {
    fn run(&self) {
        if self.cancelled.load(AtomicOrdering::Acquire) {
            return;
        }
        if let Some(pre) = self.pre.lock().unwrap().take() {
            pre();
        }
        if self.cancelled.load(AtomicOrdering::Acquire) {
            return;
        }
        let winner = self.chooser.choose(&*self.evaluator, self.chooser_arg);
        if let Some(post) = self.post.lock().unwrap().take() {
            post(winner);
        }
    }
}

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    task: Arc<ScheduledTask>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    /// Reversed so `BinaryHeap` (a max-heap) pops the *earliest* deadline
    /// first; `seq` breaks ties in enqueue order.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Handle returned by [`Scheduler::schedule_reevaluation`].
pub struct ScheduledReevalHandle {
    cancelled: Arc<AtomicBool>,
}

impl ScheduledReevalHandle {
    /// Idempotent. Skips the task if the timer thread hasn't started it yet;
    /// has no effect on a task already running to completion.
    pub fn cancel(&self) {
        self.cancelled.store(true, AtomicOrdering::Release);
    }

    /// Releases the handle. Cancellation state is shared via `Arc`, so
    /// dropping the handle does not itself cancel the task.
    pub fn free(self) {}
}

struct WorkerPool {
    queue: Mutex<VecDeque<OneShotTask>>,
    cv: Condvar,
    shutting_down: AtomicBool,
}

struct TimerState {
    heap: Mutex<BinaryHeap<TimerEntry>>,
    cv: Condvar,
    shutting_down: AtomicBool,
    next_seq: AtomicU64,
}

/// Owns the worker pool and timer thread backing the async/scheduled
/// re-evaluation API.
pub struct Scheduler {
    pool: Arc<WorkerPool>,
    timer: Arc<TimerState>,
    worker_handles: Mutex<Vec<thread::JoinHandle<()>>>,
    timer_handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new() -> Arc<Self> {
        Self::with_workers(default_worker_count())
    }

    pub fn with_workers(num_workers: usize) -> Arc<Self> {
        let num_workers = num_workers.max(1);
        let pool = Arc::new(WorkerPool {
            queue: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
            shutting_down: AtomicBool::new(false),
        });
        let timer = Arc::new(TimerState {
            heap: Mutex::new(BinaryHeap::new()),
            cv: Condvar::new(),
            shutting_down: AtomicBool::new(false),
            next_seq: AtomicU64::new(0),
        });

        let worker_handles = (0..num_workers)
            .map(|i| {
                let pool = pool.clone();
                thread::Builder::new()
                    .name(format!("netstrat-chooser-{i}"))
                    .spawn(move || worker_loop(pool))
                    .expect("failed to spawn chooser worker thread")
            })
            .collect();

        let timer_handle = {
            let timer = timer.clone();
            thread::Builder::new()
                .name("netstrat-reeval-timer".to_string())
                .spawn(move || timer_loop(timer))
                .expect("failed to spawn re-evaluation timer thread")
        };

        Arc::new(Scheduler {
            pool,
            timer,
            worker_handles: Mutex::new(worker_handles),
            timer_handle: Mutex::new(Some(timer_handle)),
        })
    }

    /// Enqueues a one-shot chooser call on the worker pool; `callback` runs
    /// on whichever worker thread picks it up.
    pub fn choose_strategy_async(
        &self,
        evaluator: Arc<dyn Evaluator>,
        chooser: Arc<Chooser>,
        chooser_arg: f64,
        callback: impl FnOnce(Option<Strategy>) + Send + 'static,
    ) {
        let task = OneShotTask {
            evaluator,
            chooser,
            chooser_arg,
            callback: Box::new(callback),
        };
        let mut queue = self.pool.queue.lock().unwrap();
        queue.push_back(task);
        self.pool.cv.notify_one();
    }

    /// Enqueues a timer task firing `seconds_in_future` from now: `pre()`,
    /// then the synchronous chooser, then `post(winner)`. Returns a handle
    /// supporting cooperative cancellation.
    pub fn schedule_reevaluation(
        &self,
        evaluator: Arc<dyn Evaluator>,
        chooser: Arc<Chooser>,
        chooser_arg: f64,
        pre: impl FnOnce() + Send + 'static,
        post: impl FnOnce(Option<Strategy>) + Send + 'static,
        seconds_in_future: f64,
    ) -> ScheduledReevalHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let task = Arc::new(ScheduledTask {
            evaluator,
            chooser,
            chooser_arg,
            pre: Mutex::new(Some(Box::new(pre) as PreCallback)),
            post: Mutex::new(Some(Box::new(post) as PostCallback)),
            cancelled: cancelled.clone(),
        });
        let deadline = Instant::now() + Duration::from_secs_f64(seconds_in_future.max(0.0));
        let seq = self.timer.next_seq.fetch_add(1, AtomicOrdering::Relaxed);
        {
            let mut heap = self.timer.heap.lock().unwrap();
            heap.push(TimerEntry { deadline, seq, task });
        }
        self.timer.cv.notify_one();
        ScheduledReevalHandle { cancelled }
    }

    /// Stops both the worker pool and the timer thread and joins them.
    /// Tasks already queued but not yet run are dropped without executing.
    pub fn shutdown(&self) {
        self.pool.shutting_down.store(true, AtomicOrdering::Release);
        self.pool.cv.notify_all();
        for handle in self.worker_handles.lock().unwrap().drain(..) {
            let _ = handle.join();
        }

        self.timer.shutting_down.store(true, AtomicOrdering::Release);
        self.timer.cv.notify_all();
        if let Some(handle) = self.timer_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.pool.shutting_down.store(true, AtomicOrdering::Release);
        self.pool.cv.notify_all();
        self.timer.shutting_down.store(true, AtomicOrdering::Release);
        self.timer.cv.notify_all();
    }
}

fn worker_loop(pool: Arc<WorkerPool>) {
    loop {
        let mut queue = pool.queue.lock().unwrap();
        while queue.is_empty() && !pool.shutting_down.load(AtomicOrdering::Acquire) {
            queue = pool.cv.wait(queue).unwrap();
        }
        let task = match queue.pop_front() {
            Some(task) => task,
            None => return,
        };
        drop(queue);
        task.run();
    }
}

fn timer_loop(timer: Arc<TimerState>) {
    loop {
        let mut heap = timer.heap.lock().unwrap();
        let entry = loop {
            if timer.shutting_down.load(AtomicOrdering::Acquire) && heap.is_empty() {
                return;
            }
            match heap.peek() {
                None => {
                    heap = timer.cv.wait(heap).unwrap();
                }
                Some(top) => {
                    let now = Instant::now();
                    if top.deadline <= now {
                        break heap.pop().expect("heap non-empty under peek");
                    }
                    let wait_for = top.deadline - now;
                    let (guard, _timeout) = timer.cv.wait_timeout(heap, wait_for).unwrap();
                    heap = guard;
                }
            }
        };
        drop(heap);
        entry.task.run();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::oracle::TrustedOracle;
    use crate::strategy::{cost_fn, SingularStrategy};
    use crate::weights::ResourceWeights;
    use std::sync::mpsc;

    fn trivial_strategy() -> Strategy {
        let f = cost_fn(|_ctx, _s, _c| 1.0);
        Strategy::Singular(SingularStrategy::new("s", f.clone(), f.clone(), f, 0.0, 0.0))
    }

    #[test]
    fn async_choice_invokes_callback() {
        let scheduler = Scheduler::with_workers(1);
        let chooser = Arc::new(Chooser::new(vec![trivial_strategy()], ResourceWeights::fixed(1.0, 1.0)));
        let evaluator: Arc<dyn Evaluator> = TrustedOracle::new();
        let (tx, rx) = mpsc::channel();
        scheduler.choose_strategy_async(evaluator, chooser, 0.0, move |winner| {
            tx.send(winner.map(|s| s.name())).unwrap();
        });
        let result = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(result, Some("s".to_string()));
        scheduler.shutdown();
    }

    #[test]
    fn cancelled_reevaluation_never_fires_post() {
        let scheduler = Scheduler::with_workers(1);
        let chooser = Arc::new(Chooser::new(vec![trivial_strategy()], ResourceWeights::fixed(1.0, 1.0)));
        let evaluator: Arc<dyn Evaluator> = TrustedOracle::new();
        let (tx, rx) = mpsc::channel::<()>();
        let handle = scheduler.schedule_reevaluation(
            evaluator,
            chooser,
            0.0,
            || {},
            move |_winner| {
                tx.send(()).unwrap();
            },
            5.0,
        );
        handle.cancel();
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        scheduler.shutdown();
    }
}
