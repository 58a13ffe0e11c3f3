use super::{ShutdownAction, ShutdownContext};
use crate::error::panic_error;
use dashmap::DashMap;
use std::any::Any;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

const COMMAND_LINE_ARGS: &str = "meshestra.command_line_args";

struct ShutdownTask {
    priority: i32,
    sequence: u64,
    action: ShutdownAction,
}

impl ShutdownTask {
    fn label(&self) -> String {
        match self.action.name() {
            Some(name) => format!("'{}' (priority {})", name, self.priority),
            None => format!("#{} (priority {})", self.sequence, self.priority),
        }
    }
}

// max-heap: higher priority first, then earlier registration
impl Ord for ShutdownTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for ShutdownTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for ShutdownTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for ShutdownTask {}

#[derive(Clone, Copy)]
enum Phase {
    Regular,
    Last,
}

#[derive(Default)]
struct Queues {
    shutdown: BinaryHeap<ShutdownTask>,
    last: BinaryHeap<ShutdownTask>,
}

impl Queues {
    fn get(&mut self, phase: Phase) -> &mut BinaryHeap<ShutdownTask> {
        match phase {
            Phase::Regular => &mut self.shutdown,
            Phase::Last => &mut self.last,
        }
    }
}

/// The per-application shutdown registry and value store.
///
/// Registration may happen from any thread at any time, including from inside
/// a running shutdown action; work added during [`drain`](Self::drain) is
/// picked up by the same drain.
#[derive(Default)]
pub struct ShutdownTaskRegistry {
    tasks: Mutex<Queues>,
    values: DashMap<String, Arc<dyn Any + Send + Sync>>,
    sequence: AtomicU64,
}

impl ShutdownTaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run every registered action, then clear the value store.
    ///
    /// Regular actions run first, in priority order; "last" actions run once
    /// the regular queue is empty. A regular action registered by a "last"
    /// action runs before the next "last" action. A failing or panicking action is logged and
    /// does not prevent the rest from running.
    pub fn drain(&self) {
        let mut ran = 0usize;
        while let Some(task) = self.next_task() {
            Self::run_task(task);
            ran += 1;
        }
        self.values.clear();
        tracing::debug!("Ran {} shutdown tasks", ran);
    }

    /// Number of actions waiting to run.
    pub fn pending(&self) -> usize {
        let queues = self.lock();
        queues.shutdown.len() + queues.last.len()
    }

    pub fn put_value<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.values.insert(key.into(), Arc::new(value));
    }

    /// The value stored under `key`, if it exists and has type `T`.
    pub fn get_value<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = self.values.get(key).map(|entry| Arc::clone(entry.value()))?;
        value.downcast::<T>().ok()
    }

    pub fn remove_value(&self, key: &str) -> bool {
        self.values.remove(key).is_some()
    }

    /// Stores the raw command line arguments the application was started with.
    pub fn set_command_line_args(&self, args: &[String]) {
        self.put_value(COMMAND_LINE_ARGS, args.to_vec());
    }

    pub fn command_line_args(&self) -> Vec<String> {
        self.get_value::<Vec<String>>(COMMAND_LINE_ARGS)
            .map(|args| args.as_ref().clone())
            .unwrap_or_default()
    }

    fn push(&self, phase: Phase, priority: i32, action: ShutdownAction) {
        let sequence = self.sequence.fetch_add(1, AtomicOrdering::Relaxed);
        self.lock().get(phase).push(ShutdownTask {
            priority,
            sequence,
            action,
        });
    }

    // the lock is released before the task runs
    fn next_task(&self) -> Option<ShutdownTask> {
        let mut queues = self.lock();
        queues.shutdown.pop().or_else(|| queues.last.pop())
    }

    fn run_task(task: ShutdownTask) {
        let label = task.label();
        tracing::debug!("Running shutdown task {}", label);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| task.action.run()))
            .unwrap_or_else(|payload| Err(panic_error(payload)));
        if let Err(e) = outcome {
            tracing::error!("Shutdown task {} failed: {:#}", label, e);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Queues> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ShutdownContext for ShutdownTaskRegistry {
    fn add_shutdown_task(&self, priority: i32, action: ShutdownAction) {
        self.push(Phase::Regular, priority, action);
    }

    fn add_last_shutdown_task(&self, priority: i32, action: ShutdownAction) {
        self.push(Phase::Last, priority, action);
    }
}

impl std::fmt::Debug for ShutdownTaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownTaskRegistry")
            .field("pending", &self.pending())
            .field("values", &self.values.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::LifecycleError;
    use tracing_test::traced_test;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> ShutdownAction) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let make = move |label: &str| {
            let sink = Arc::clone(&sink);
            let label = label.to_string();
            ShutdownAction::new(move || {
                sink.lock().unwrap().push(label);
                Ok(())
            })
        };
        (log, make)
    }

    #[test]
    fn test_priority_order_then_last_phase() {
        let registry = ShutdownTaskRegistry::new();
        let (log, record) = recorder();

        registry.add_last_shutdown_task(100, record("last-high"));
        registry.add_shutdown_task(1, record("low"));
        registry.add_last_shutdown_task(-5, record("last-low"));
        registry.add_shutdown_task(50, record("high"));
        registry.add_shutdown_task(10, record("mid"));

        registry.drain();
        assert_eq!(
            *log.lock().unwrap(),
            vec!["high", "mid", "low", "last-high", "last-low"]
        );
        assert_eq!(registry.pending(), 0);
    }

    #[test]
    fn test_equal_priority_runs_in_registration_order() {
        let registry = ShutdownTaskRegistry::new();
        let (log, record) = recorder();
        for label in ["a", "b", "c", "d"] {
            registry.add_shutdown_task(7, record(label));
        }

        registry.drain();
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c", "d"]);
    }

    #[traced_test]
    #[test]
    fn test_failing_task_does_not_stop_the_drain() {
        let registry = ShutdownTaskRegistry::new();
        let (log, record) = recorder();

        registry.add_shutdown_task(3, record("first"));
        registry.add_shutdown_task(2, ShutdownAction::named("flaky", || anyhow::bail!("disk full")));
        registry.add_shutdown_task(1, ShutdownAction::new(|| panic!("boom")));
        registry.add_last_shutdown_task(0, record("final"));

        registry.drain();
        assert_eq!(*log.lock().unwrap(), vec!["first", "final"]);
        assert!(logs_contain("Shutdown task 'flaky' (priority 2) failed: disk full"));
        assert!(logs_contain("panicked: boom"));
    }

    #[test]
    fn test_task_registered_during_drain_runs() {
        let registry = Arc::new(ShutdownTaskRegistry::new());
        let (log, record) = recorder();
        let late = record("late");

        let inner = Arc::clone(&registry);
        registry.add_shutdown_task(
            10,
            ShutdownAction::new(move || {
                inner.add_last_shutdown_task(0, late);
                Ok(())
            }),
        );

        registry.drain();
        assert_eq!(*log.lock().unwrap(), vec!["late"]);
    }

    #[test]
    fn test_regular_task_registered_by_last_task_runs() {
        let registry = Arc::new(ShutdownTaskRegistry::new());
        let (log, record) = recorder();
        let rescheduled = record("rescheduled");
        let closing = record("closing");

        let inner = Arc::clone(&registry);
        registry.add_last_shutdown_task(
            5,
            ShutdownAction::new(move || {
                inner.add_shutdown_task(0, rescheduled);
                Ok(())
            }),
        );
        registry.add_last_shutdown_task(1, closing);

        registry.drain();
        assert_eq!(*log.lock().unwrap(), vec!["rescheduled", "closing"]);
        assert_eq!(registry.pending(), 0);
    }

    #[test]
    fn test_missing_action_is_rejected() {
        let registry = ShutdownTaskRegistry::new();
        let err = registry.try_add_shutdown_task(1, None).unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidArgument(_)));
        assert!(registry.try_add_last_shutdown_task(1, None).is_err());
        assert_eq!(registry.pending(), 0);

        registry
            .try_add_shutdown_task(1, Some(ShutdownAction::new(|| Ok(()))))
            .unwrap();
        assert_eq!(registry.pending(), 1);
    }

    #[test]
    fn test_values_are_cleared_on_drain() {
        let registry = ShutdownTaskRegistry::new();
        registry.put_value("port", 8080_u16);
        registry.set_command_line_args(&["--verbose".to_string()]);

        assert_eq!(*registry.get_value::<u16>("port").unwrap(), 8080);
        assert!(registry.get_value::<String>("port").is_none());
        assert_eq!(registry.command_line_args(), vec!["--verbose"]);

        registry.drain();
        assert!(registry.get_value::<u16>("port").is_none());
        assert!(registry.command_line_args().is_empty());
        assert!(!registry.remove_value("port"));
    }
}
