use super::WorkerPoolConfig;
use super::shutdown::WorkerPoolShutdownController;
use crate::config::ConfigService;
use crate::context::{DEFAULT_PRIORITY, ShutdownAction, ShutdownContext};
use crate::error::{Result, RuntimeError, panic_message};
use crate::interrupt::{self, InterruptHandle};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// A unit of work queued on a [`WorkerPool`].
pub type Job = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
    static CURRENT_WORKER: RefCell<Option<Arc<WorkerSlot>>> = const { RefCell::new(None) };
}

/// Flags the calling worker thread as blocked in a call that terminates the
/// process and will therefore never return. No-op off the pool.
pub fn mark_terminating_call() {
    CURRENT_WORKER.with(|current| {
        if let Some(slot) = current.borrow().as_ref() {
            slot.terminating.store(true, Ordering::SeqCst);
        }
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Running,
    Shutdown,
    Stopped,
}

struct WorkerSlot {
    id: usize,
    thread_name: String,
    interrupt: OnceLock<InterruptHandle>,
    busy_since: Mutex<Option<Instant>>,
    terminating: AtomicBool,
}

impl WorkerSlot {
    fn set_busy(&self, busy: bool) {
        *self
            .busy_since
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = busy.then(Instant::now);
    }

    fn snapshot(&self) -> WorkerSnapshot {
        let busy_since = *self
            .busy_since
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        WorkerSnapshot {
            id: self.id,
            thread_name: self.thread_name.clone(),
            busy_for: busy_since.map(|since| since.elapsed()),
            in_terminating_call: self.terminating.load(Ordering::SeqCst),
            interrupted: self
                .interrupt
                .get()
                .is_some_and(InterruptHandle::is_interrupted),
        }
    }
}

/// Point-in-time view of one worker thread.
#[derive(Debug, Clone)]
pub struct WorkerSnapshot {
    pub id: usize,
    pub thread_name: String,
    /// How long the current task has been running, `None` when idle.
    pub busy_for: Option<Duration>,
    /// The task called into process termination and can never return.
    pub in_terminating_call: bool,
    pub interrupted: bool,
}

impl WorkerSnapshot {
    pub fn is_busy(&self) -> bool {
        self.busy_for.is_some()
    }
}

/// Point-in-time view of a [`WorkerPool`].
#[derive(Debug, Clone)]
pub struct PoolSnapshot {
    pub queued: usize,
    pub active: usize,
    pub threads: usize,
    pub workers: Vec<WorkerSnapshot>,
}

struct PoolState {
    queue: VecDeque<Job>,
    workers: HashMap<usize, Arc<WorkerSlot>>,
    idle: usize,
    active: usize,
    run_state: RunState,
    next_worker_id: usize,
}

impl PoolState {
    fn is_terminated(&self) -> bool {
        self.run_state != RunState::Running && self.workers.is_empty() && self.queue.is_empty()
    }
}

struct PoolInner {
    name: String,
    config: WorkerPoolConfig,
    state: Mutex<PoolState>,
    work_available: Condvar,
    terminated: Condvar,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks for the next job. `None` means the worker has been
    /// deregistered and must exit.
    fn next_job(&self, id: usize) -> Option<Job> {
        let mut state = self.lock();
        loop {
            if let Some(job) = state.queue.pop_front() {
                state.active += 1;
                // cleared under the lock so a concurrent interrupt_workers()
                // is either seen by this job or by none
                let _ = interrupt::interrupted();
                return Some(job);
            }
            if state.run_state != RunState::Running {
                break;
            }

            state.idle += 1;
            let (guard, wait) = self
                .work_available
                .wait_timeout(state, self.config.keep_alive_time)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
            state.idle -= 1;

            if wait.timed_out()
                && state.queue.is_empty()
                && state.run_state == RunState::Running
                && state.workers.len() > self.config.core_threads
            {
                break;
            }
        }

        // must happen under the lock that decided the exit
        state.workers.remove(&id);
        if state.is_terminated() {
            self.terminated.notify_all();
        }
        None
    }

    fn finish_job(&self) {
        let mut state = self.lock();
        state.active -= 1;
    }
}

fn run_worker(inner: Arc<PoolInner>, slot: Arc<WorkerSlot>, first: Option<Job>) {
    let _ = slot.interrupt.set(InterruptHandle::current());
    CURRENT_WORKER.with(|current| *current.borrow_mut() = Some(Arc::clone(&slot)));
    tracing::debug!("{} started", slot.thread_name);

    let mut next = first;
    loop {
        let job = match next.take().or_else(|| inner.next_job(slot.id)) {
            Some(job) => job,
            None => break,
        };

        slot.set_busy(true);
        let outcome = panic::catch_unwind(AssertUnwindSafe(job));
        slot.set_busy(false);
        if let Err(payload) = outcome {
            tracing::error!(
                "Task on {} panicked: {}",
                slot.thread_name,
                panic_message(payload.as_ref())
            );
        }
        inner.finish_job();
    }

    CURRENT_WORKER.with(|current| current.borrow_mut().take());
    tracing::debug!("{} exited", slot.thread_name);
}

/// Bounded thread pool with core/max sizing, keep-alive reaping of non-core
/// threads and growth resistance.
///
/// Submission policy, in order:
///
/// 1. below `core_threads`: start a new worker for the job
/// 2. an idle worker is available: queue the job
/// 3. below `max_threads` and either the queue is full or growth is not
///    resisted this time: start a new worker
/// 4. room in the queue: queue the job
/// 5. otherwise reject
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, config: WorkerPoolConfig) -> Result<Self> {
        config.validate()?;
        let pool = Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                config,
                state: Mutex::new(PoolState {
                    queue: VecDeque::new(),
                    workers: HashMap::new(),
                    idle: 0,
                    active: 0,
                    run_state: RunState::Running,
                    next_worker_id: 0,
                }),
                work_available: Condvar::new(),
                terminated: Condvar::new(),
            }),
        };

        if pool.inner.config.prefill {
            let mut state = pool.inner.lock();
            for _ in 0..pool.inner.config.core_threads {
                pool.spawn_worker(&mut state, None)?;
            }
        }
        tracing::debug!(
            "Worker pool {} created (core={}, max={})",
            pool.inner.name,
            pool.inner.config.core_threads,
            pool.inner.config.max_threads
        );
        Ok(pool)
    }

    /// A pool configured from `MESHESTRA_THREAD_POOL_*` keys.
    pub fn from_config(name: impl Into<String>, config: &ConfigService) -> Result<Self> {
        Self::new(name, WorkerPoolConfig::from_config(config)?)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.inner.config
    }

    /// Queue `task` for execution.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::Rejected`] once the pool is shut down, or when both the
    /// queue and the thread budget are exhausted.
    pub fn submit<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let job: Job = Box::new(task);
        let config = &self.inner.config;
        let mut state = self.inner.lock();

        if state.run_state != RunState::Running {
            return Err(RuntimeError::rejected(&self.inner.name, "pool is shut down"));
        }

        let threads = state.workers.len();
        if threads < config.core_threads {
            return self.spawn_worker(&mut state, Some(job));
        }
        if state.idle > state.queue.len() {
            return self.enqueue(&mut state, job);
        }

        let queue_full = config
            .queue_size
            .is_some_and(|capacity| state.queue.len() >= capacity);
        if threads < config.max_threads && (queue_full || !self.resists_growth()) {
            return self.spawn_worker(&mut state, Some(job));
        }
        if !queue_full {
            return self.enqueue(&mut state, job);
        }
        Err(RuntimeError::rejected(&self.inner.name, "queue is full"))
    }

    /// Execute `f` on the pool and return its result asynchronously.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::Rejected`] as for [`submit`](Self::submit), and
    /// [`RuntimeError::TaskAbandoned`] if the task panicked or was discarded
    /// by [`shutdown_now`](Self::shutdown_now).
    pub async fn execute<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.submit(move || {
            let _ = tx.send(f());
        })?;

        rx.await
            .map_err(|_| RuntimeError::TaskAbandoned(self.inner.name.clone()))
    }

    /// Stop accepting work. Queued tasks still run.
    pub fn shutdown(&self) {
        let mut state = self.inner.lock();
        if state.run_state == RunState::Running {
            tracing::debug!("Worker pool {} shutting down", self.inner.name);
            state.run_state = RunState::Shutdown;
        }
        self.inner.work_available.notify_all();
        if state.is_terminated() {
            self.inner.terminated.notify_all();
        }
    }

    /// Stop accepting work, discard the queue and interrupt every worker.
    ///
    /// Returns the discarded jobs.
    pub fn shutdown_now(&self) -> Vec<Job> {
        let mut state = self.inner.lock();
        state.run_state = RunState::Stopped;
        let discarded: Vec<Job> = state.queue.drain(..).collect();
        for slot in state.workers.values() {
            if let Some(handle) = slot.interrupt.get() {
                handle.interrupt();
            }
        }
        self.inner.work_available.notify_all();
        if state.is_terminated() {
            self.inner.terminated.notify_all();
        }
        discarded
    }

    /// Interrupt every worker thread. Running tasks observe it through
    /// [`interrupt::is_interrupted`](crate::interrupt::is_interrupted).
    pub fn interrupt_workers(&self) {
        let state = self.inner.lock();
        for slot in state.workers.values() {
            if let Some(handle) = slot.interrupt.get() {
                handle.interrupt();
            }
        }
    }

    /// Wait until the pool is shut down and every worker has exited.
    ///
    /// Returns `false` if `timeout` elapsed first.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.lock();
        while !state.is_terminated() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .inner
                .terminated
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.lock().run_state != RunState::Running
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.lock().is_terminated()
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let state = self.inner.lock();
        let mut workers: Vec<WorkerSnapshot> =
            state.workers.values().map(|slot| slot.snapshot()).collect();
        workers.sort_by_key(|worker| worker.id);
        PoolSnapshot {
            queued: state.queue.len(),
            active: state.active,
            threads: state.workers.len(),
            workers,
        }
    }

    /// Release this pool once every regular shutdown task of `context` ran.
    pub fn register_shutdown(&self, context: &dyn ShutdownContext) {
        let controller = WorkerPoolShutdownController::new(self.clone());
        context.add_last_shutdown_task(
            DEFAULT_PRIORITY,
            ShutdownAction::named(format!("worker pool {}", self.inner.name), move || {
                controller.shutdown();
                Ok(())
            }),
        );
    }

    fn enqueue(&self, state: &mut PoolState, job: Job) -> Result<()> {
        state.queue.push_back(job);
        if !state.workers.is_empty() {
            self.inner.work_available.notify_one();
            return Ok(());
        }
        // a queued job always has a worker to run it
        if let Err(e) = self.spawn_worker(state, None) {
            state.queue.pop_back();
            return Err(e);
        }
        Ok(())
    }

    fn resists_growth(&self) -> bool {
        let resistance = self.inner.config.growth_resistance;
        resistance > 0.0 && rand::random::<f32>() < resistance
    }

    fn spawn_worker(&self, state: &mut PoolState, first: Option<Job>) -> Result<()> {
        let id = state.next_worker_id;
        state.next_worker_id += 1;
        let slot = Arc::new(WorkerSlot {
            id,
            thread_name: format!("{}-worker-{}", self.inner.name, id),
            interrupt: OnceLock::new(),
            busy_since: Mutex::new(None),
            terminating: AtomicBool::new(false),
        });

        let has_job = first.is_some();
        if has_job {
            state.active += 1;
        }
        state.workers.insert(id, Arc::clone(&slot));

        let inner = Arc::clone(&self.inner);
        let worker = Arc::clone(&slot);
        let spawned = thread::Builder::new()
            .name(slot.thread_name.clone())
            .spawn(move || run_worker(inner, worker, first));

        if let Err(e) = spawned {
            state.workers.remove(&id);
            if has_job {
                state.active -= 1;
            }
            return Err(RuntimeError::rejected(
                &self.inner.name,
                format!("cannot start worker thread: {}", e),
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("WorkerPool")
            .field("name", &self.inner.name)
            .field("threads", &snapshot.threads)
            .field("active", &snapshot.active)
            .field("queued", &snapshot.queued)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::ShutdownOutcome;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Barrier, mpsc};

    fn config(core: usize, max: usize, queue: Option<usize>) -> WorkerPoolConfig {
        WorkerPoolConfig {
            core_threads: core,
            max_threads: max,
            queue_size: queue,
            ..Default::default()
        }
    }

    #[test]
    fn test_runs_submitted_tasks() {
        let pool = WorkerPool::new("test", config(2, 4, None)).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..20 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(5)));
        assert_eq!(counter.load(Ordering::SeqCst), 20);
        assert!(pool.is_terminated());
    }

    #[test]
    fn test_grows_to_max_then_rejects() {
        let pool = WorkerPool::new("bounded", config(1, 2, Some(1))).unwrap();
        let gate = Arc::new(Barrier::new(3));

        for _ in 0..2 {
            let gate = Arc::clone(&gate);
            pool.submit(move || {
                gate.wait();
            })
            .unwrap();
        }
        assert_eq!(pool.snapshot().threads, 2);

        pool.submit(|| {}).unwrap();
        assert_eq!(pool.snapshot().queued, 1);

        let err = pool.submit(|| {}).unwrap_err();
        assert!(matches!(err, RuntimeError::Rejected { .. }));

        gate.wait();
        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(5)));
    }

    #[test]
    fn test_full_growth_resistance_prefers_the_queue() {
        let pool = WorkerPool::new(
            "resistant",
            WorkerPoolConfig {
                growth_resistance: 1.0,
                ..config(1, 8, None)
            },
        )
        .unwrap();
        let (release, gate) = mpsc::channel::<()>();
        let gate = Arc::new(Mutex::new(gate));

        for _ in 0..4 {
            let gate = Arc::clone(&gate);
            pool.submit(move || {
                let _ = gate.lock().unwrap().recv();
            })
            .unwrap();
        }
        let snapshot = pool.snapshot();
        assert_eq!(snapshot.threads, 1);
        assert_eq!(snapshot.queued, 3);

        for _ in 0..4 {
            release.send(()).unwrap();
        }
        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(5)));
    }

    #[test]
    fn test_queued_job_starts_a_worker_without_core_threads() {
        let pool = WorkerPool::new(
            "no-core",
            WorkerPoolConfig {
                growth_resistance: 1.0,
                ..config(0, 4, None)
            },
        )
        .unwrap();
        let (tx, rx) = mpsc::channel();
        pool.submit(move || tx.send(()).unwrap()).unwrap();

        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        let outcome = WorkerPoolShutdownController::new(pool.clone()).shutdown();
        assert_eq!(outcome, ShutdownOutcome::Terminated);
        assert_eq!(pool.snapshot().queued, 0);
    }

    #[test]
    fn test_rejects_after_shutdown() {
        let pool = WorkerPool::new("closed", config(1, 1, None)).unwrap();
        pool.shutdown();
        assert!(pool.is_shutdown());
        assert!(pool.await_termination(Duration::ZERO));
        assert!(pool.submit(|| {}).is_err());
    }

    #[test]
    fn test_prefill_starts_core_threads() {
        let pool = WorkerPool::new(
            "prefilled",
            WorkerPoolConfig {
                prefill: true,
                ..config(3, 3, None)
            },
        )
        .unwrap();
        assert_eq!(pool.snapshot().threads, 3);

        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(5)));
    }

    #[test]
    fn test_non_core_threads_are_reaped() {
        let pool = WorkerPool::new(
            "elastic",
            WorkerPoolConfig {
                keep_alive_time: Duration::from_millis(50),
                ..config(1, 4, None)
            },
        )
        .unwrap();
        let gate = Arc::new(Barrier::new(4));
        for _ in 0..3 {
            let gate = Arc::clone(&gate);
            pool.submit(move || {
                gate.wait();
            })
            .unwrap();
        }
        assert_eq!(pool.snapshot().threads, 3);
        gate.wait();

        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.snapshot().threads > 1 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(pool.snapshot().threads, 1);

        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(5)));
    }

    #[test]
    fn test_shutdown_now_discards_queue_and_interrupts() {
        let pool = WorkerPool::new(
            "stoppable",
            WorkerPoolConfig {
                growth_resistance: 1.0,
                ..config(1, 1, None)
            },
        )
        .unwrap();
        let (started_tx, started_rx) = mpsc::channel();
        pool.submit(move || {
            started_tx.send(()).unwrap();
            let _ = interrupt::sleep(Duration::from_secs(30));
        })
        .unwrap();
        started_rx.recv().unwrap();
        pool.submit(|| {}).unwrap();
        pool.submit(|| {}).unwrap();

        let discarded = pool.shutdown_now();
        assert_eq!(discarded.len(), 2);
        assert!(pool.await_termination(Duration::from_secs(5)));
    }

    #[test]
    fn test_panicking_task_keeps_worker_alive() {
        let pool = WorkerPool::new("sturdy", config(1, 1, None)).unwrap();
        pool.submit(|| panic!("task exploded")).unwrap();

        let (tx, rx) = mpsc::channel();
        pool.submit(move || tx.send(42).unwrap()).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);

        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(5)));
    }

    #[test]
    fn test_terminating_call_is_visible_in_snapshot() {
        let pool = WorkerPool::new("exit", config(1, 1, None)).unwrap();
        let (tx, rx) = mpsc::channel();
        let (release, gate) = mpsc::channel::<()>();
        pool.submit(move || {
            mark_terminating_call();
            tx.send(()).unwrap();
            let _ = gate.recv();
        })
        .unwrap();
        rx.recv().unwrap();

        let worker = &pool.snapshot().workers[0];
        assert!(worker.is_busy());
        assert!(worker.in_terminating_call);

        release.send(()).unwrap();
        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn test_execute_returns_result() {
        let pool = WorkerPool::new("async", config(2, 2, None)).unwrap();
        let value = pool.execute(|| 6 * 7).await.unwrap();
        assert_eq!(value, 42);

        let err = pool.execute(|| -> u8 { panic!("lost") }).await.unwrap_err();
        assert!(matches!(err, RuntimeError::TaskAbandoned(_)));

        pool.shutdown();
    }
}
