//! Bounded-parallel row processing.
//!
//! Rows are read on the calling thread, the only thread that touches the cursor,
//! and each row becomes one task on a [`WorkerPool`]. Submission blocks while the
//! pool's queue is full, so the reader never runs more than `queue_capacity` rows
//! ahead of the workers.
//!
//! When cancellation is observed, no further rows are read. Tasks that are already
//! running finish; tasks still waiting in the queue are skipped and counted in
//! [`WorkResult::skipped`].

use crate::driver::Row;
use crate::error::{BoxError, Error};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const SUBMIT_POLL: Duration = Duration::from_millis(50);

type Job = Box<dyn FnOnce(usize) + Send + 'static>;

/// Worker pool settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    workers: usize,
    queue_capacity: usize,
    max_failures: usize,
    progress_interval: Duration,
    await_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let workers = thread::available_parallelism()
            .map(|count| count.get())
            .unwrap_or(4);
        Self {
            workers,
            queue_capacity: workers * 2,
            max_failures: 100,
            progress_interval: Duration::from_secs(10),
            await_timeout: Some(Duration::from_secs(3600)),
        }
    }
}

impl PoolConfig {
    pub fn builder() -> PoolConfigBuilder {
        PoolConfigBuilder::default()
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    /// Failures beyond this many are counted but not recorded.
    pub fn max_failures(&self) -> usize {
        self.max_failures
    }

    pub fn progress_interval(&self) -> Duration {
        self.progress_interval
    }

    /// How long a run waits for outstanding tasks; `None` waits forever.
    pub fn await_timeout(&self) -> Option<Duration> {
        self.await_timeout
    }
}

/// Builder for [`PoolConfig`]. Values are validated in [`build`](Self::build).
#[derive(Debug, Default, Clone)]
pub struct PoolConfigBuilder {
    workers: Option<usize>,
    queue_capacity: Option<usize>,
    max_failures: Option<usize>,
    progress_interval: Option<Duration>,
    await_timeout: Option<Option<Duration>>,
}

impl PoolConfigBuilder {
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Defaults to twice the worker count.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    pub fn max_failures(mut self, max: usize) -> Self {
        self.max_failures = Some(max);
        self
    }

    pub fn progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = Some(interval);
        self
    }

    pub fn await_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.await_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> crate::Result<PoolConfig> {
        let defaults = PoolConfig::default();
        let workers = self.workers.unwrap_or(defaults.workers);
        if workers == 0 {
            return Err(Error::Config("a worker pool needs at least one worker".into()));
        }
        let queue_capacity = self.queue_capacity.unwrap_or(workers * 2);
        if queue_capacity == 0 {
            return Err(Error::Config("queue_capacity must be at least 1".into()));
        }
        let progress_interval = self.progress_interval.unwrap_or(defaults.progress_interval);
        if progress_interval.is_zero() {
            return Err(Error::Config("progress_interval must be positive".into()));
        }
        Ok(PoolConfig {
            workers,
            queue_capacity,
            max_failures: self.max_failures.unwrap_or(defaults.max_failures),
            progress_interval,
            await_timeout: self.await_timeout.unwrap_or(defaults.await_timeout),
        })
    }
}

/// A fixed set of worker threads fed from a bounded queue.
///
/// Pools are created explicitly and passed to whoever needs them; there is no
/// process-wide pool. Dropping a pool shuts it down gracefully.
pub struct WorkerPool {
    config: PoolConfig,
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    halt: CancellationToken,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish()
    }
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> crate::Result<Self> {
        let (sender, receiver) = bounded::<Job>(config.queue_capacity);
        let mut workers = Vec::with_capacity(config.workers);
        for id in 0..config.workers {
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("row-worker-{id}"))
                .spawn(move || worker_loop(id, receiver))
                .map_err(|e| Error::Config(format!("cannot spawn worker thread: {e}")))?;
            workers.push(handle);
        }
        tracing::debug!(workers = config.workers, queue = config.queue_capacity, "worker pool started");
        Ok(Self {
            config,
            sender: Some(sender),
            workers,
            halt: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.sender.is_some()
    }

    /// Queues `job`, blocking while the queue is full. Returns `Ok(false)` if
    /// `cancel` fires before the job could be queued.
    fn submit(&self, mut job: Job, cancel: &CancellationToken) -> crate::Result<bool> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| Error::Usage("worker pool is shut down".into()))?;
        loop {
            if cancel.is_cancelled() || self.halt.is_cancelled() {
                return Ok(false);
            }
            match sender.send_timeout(job, SUBMIT_POLL) {
                Ok(()) => return Ok(true),
                Err(SendTimeoutError::Timeout(returned)) => job = returned,
                Err(SendTimeoutError::Disconnected(_)) => {
                    return Err(Error::Usage("worker pool has no running workers".into()))
                }
            }
        }
    }

    /// Stops accepting work, lets queued tasks run, and joins every worker.
    pub fn shutdown(&mut self) {
        if self.sender.take().is_none() && self.workers.is_empty() {
            return;
        }
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::warn!("worker thread panicked");
            }
        }
        tracing::debug!("worker pool stopped");
    }

    /// Stops accepting work and makes queued tasks skip themselves. Workers are
    /// detached and exit once their current task returns.
    pub fn shutdown_now(&mut self) {
        self.halt.cancel();
        self.sender = None;
        let detached = self.workers.drain(..).count();
        tracing::debug!(detached, "worker pool halted");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(id: usize, receiver: Receiver<Job>) {
    while let Ok(job) = receiver.recv() {
        job(id);
    }
}

/// What a row handler can see about the task it runs in.
pub struct TaskContext<'a, X> {
    worker: usize,
    row_number: usize,
    cancel: &'a CancellationToken,
    context: &'a X,
}

impl<X> TaskContext<'_, X> {
    /// Index of the worker thread running this task.
    pub fn worker(&self) -> usize {
        self.worker
    }

    /// 1-based position of the row in cursor order.
    pub fn row_number(&self) -> usize {
        self.row_number
    }

    /// Long-running handlers should poll this and return early.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        self.cancel
    }

    /// The shared execution context passed to [`dispatch`].
    pub fn context(&self) -> &X {
        self.context
    }
}

/// A row whose handler failed.
#[derive(Debug)]
pub struct FailureRecord {
    pub row_number: usize,
    pub row: Row,
    pub error: BoxError,
}

/// Outcome of a parallel run.
///
/// Once every task has finished, `completed + failed + skipped == submitted`.
#[derive(Debug, Default)]
pub struct WorkResult {
    pub submitted: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    /// At most `max_failures` records, in completion order.
    pub failures: Vec<FailureRecord>,
    pub interrupted: bool,
    /// Outstanding tasks did not finish within the await timeout.
    pub timed_out: bool,
}

impl WorkResult {
    pub fn is_success(&self) -> bool {
        self.failed == 0 && !self.interrupted && !self.timed_out
    }
}

#[derive(Default)]
struct RunState {
    completed: AtomicUsize,
    failed: AtomicUsize,
    skipped: AtomicUsize,
    failures: Mutex<Vec<FailureRecord>>,
    max_failures: usize,
}

impl RunState {
    fn record_failure(&self, row_number: usize, row: Row, error: BoxError) {
        self.failed.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(row_number, error = %error, "row handler failed");
        let mut failures = self
            .failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if failures.len() < self.max_failures {
            failures.push(FailureRecord {
                row_number,
                row,
                error,
            });
        }
    }

    fn take_failures(&self) -> Vec<FailureRecord> {
        let mut failures = self
            .failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::take(&mut *failures)
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> BoxError {
    let message = if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "row handler panicked".to_owned()
    };
    format!("panic: {message}").into()
}

/// Reads `rows` on the calling thread and runs `handler` for each row on `pool`.
///
/// Handler errors and panics are recorded per row and never stop the run. A
/// failure to read a row stops submission; outstanding tasks are awaited and the
/// read error is returned. Cancellation of `cancel` stops submission and marks
/// the result interrupted.
pub fn dispatch<I, X, H>(
    pool: &WorkerPool,
    rows: I,
    context: Arc<X>,
    handler: Arc<H>,
    cancel: &CancellationToken,
) -> crate::Result<WorkResult>
where
    I: IntoIterator<Item = crate::Result<Row>>,
    X: Send + Sync + 'static,
    H: Fn(&TaskContext<'_, X>, &Row) -> Result<(), BoxError> + Send + Sync + 'static,
{
    let config = pool.config();
    let state = Arc::new(RunState {
        max_failures: config.max_failures,
        ..RunState::default()
    });
    let (done_tx, done_rx) = unbounded::<()>();
    let mut rows = rows.into_iter();
    let mut submitted = 0;
    let mut interrupted = false;
    let mut read_error = None;
    let started = Instant::now();

    loop {
        if cancel.is_cancelled() {
            interrupted = true;
            break;
        }
        let row = match rows.next() {
            None => break,
            Some(Ok(row)) => row,
            Some(Err(err)) if err.is_cancelled() => {
                interrupted = true;
                break;
            }
            Some(Err(err)) => {
                read_error = Some(err);
                break;
            }
        };
        let row_number = submitted + 1;
        let job = row_job(
            row_number,
            row,
            Arc::clone(&state),
            Arc::clone(&context),
            Arc::clone(&handler),
            cancel.clone(),
            pool.halt.clone(),
            done_tx.clone(),
        );
        if !pool.submit(job, cancel)? {
            interrupted = true;
            break;
        }
        submitted = row_number;
    }
    drop(done_tx);

    if interrupted {
        tracing::warn!(submitted, "parallel run interrupted; queued rows will be skipped");
    }
    let waited = await_tasks(&done_rx, submitted, &state, config);

    let result = WorkResult {
        submitted,
        completed: state.completed.load(Ordering::SeqCst),
        failed: state.failed.load(Ordering::SeqCst),
        skipped: state.skipped.load(Ordering::SeqCst),
        failures: state.take_failures(),
        interrupted,
        timed_out: waited.timed_out,
    };
    tracing::info!(
        submitted = result.submitted,
        completed = result.completed,
        failed = result.failed,
        skipped = result.skipped,
        progress_reports = waited.reports,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "parallel run finished"
    );
    match read_error {
        Some(err) => Err(err),
        None => Ok(result),
    }
}

#[allow(clippy::too_many_arguments)]
fn row_job<X, H>(
    row_number: usize,
    row: Row,
    state: Arc<RunState>,
    context: Arc<X>,
    handler: Arc<H>,
    cancel: CancellationToken,
    halt: CancellationToken,
    done: Sender<()>,
) -> Job
where
    X: Send + Sync + 'static,
    H: Fn(&TaskContext<'_, X>, &Row) -> Result<(), BoxError> + Send + Sync + 'static,
{
    Box::new(move |worker| {
        if cancel.is_cancelled() || halt.is_cancelled() {
            state.skipped.fetch_add(1, Ordering::SeqCst);
        } else {
            let ctx = TaskContext {
                worker,
                row_number,
                cancel: &cancel,
                context: &*context,
            };
            match catch_unwind(AssertUnwindSafe(|| handler(&ctx, &row))) {
                Ok(Ok(())) => {
                    state.completed.fetch_add(1, Ordering::SeqCst);
                }
                Ok(Err(error)) => state.record_failure(row_number, row, error),
                Err(panic) => state.record_failure(row_number, row, panic_message(panic)),
            }
        }
        let _ = done.send(());
    })
}

/// Waits until `submitted` tasks have reported back. Returns `true` on timeout.
struct Waited {
    timed_out: bool,
    reports: usize,
}

/// Waits for `submitted` completion signals, logging progress every
/// `progress_interval` whether or not tasks keep finishing.
fn await_tasks(
    done: &Receiver<()>,
    submitted: usize,
    state: &RunState,
    config: &PoolConfig,
) -> Waited {
    let deadline = config.await_timeout.map(|timeout| Instant::now() + timeout);
    let mut last_report = Instant::now();
    let mut reports = 0;
    let mut finished = 0;
    while finished < submitted {
        let now = Instant::now();
        if now.duration_since(last_report) >= config.progress_interval {
            tracing::info!(
                finished,
                submitted,
                completed = state.completed.load(Ordering::SeqCst),
                failed = state.failed.load(Ordering::SeqCst),
                "waiting for row handlers"
            );
            last_report = now;
            reports += 1;
        }
        let mut wait = config
            .progress_interval
            .saturating_sub(now.duration_since(last_report));
        if let Some(deadline) = deadline {
            if now >= deadline {
                tracing::warn!(finished, submitted, "gave up waiting for row handlers");
                return Waited { timed_out: true, reports };
            }
            wait = wait.min(deadline - now);
        }
        match done.recv_timeout(wait) {
            Ok(()) => finished += 1,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    Waited { timed_out: false, reports }
}
