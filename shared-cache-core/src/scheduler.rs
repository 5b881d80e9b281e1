//! Recurring callbacks and inter-process wake-ups for channel listeners.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// A callback run by a [`Scheduler`]. It may block briefly (lock waits).
pub type Task = Arc<dyn Fn() + Send + Sync>;

/// Identifies a scheduled task within one scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskHandle(pub u64);

/// The per-process event loop the channel relies on.
pub trait Scheduler: Send + Sync {
    /// Id other processes use to signal this one
    fn process_id(&self) -> u32;

    /// Runs `task` repeatedly, waiting `interval` between runs
    fn schedule(&self, task: Task, interval: Duration) -> TaskHandle;

    /// Runs `task` each time this process is signalled
    fn on_signal(&self, task: Task) -> TaskHandle;

    /// Stops future runs of a task. Returns `false` for unknown handles.
    fn cancel(&self, handle: TaskHandle) -> bool;

    /// Wakes the signal tasks of process `pid`. Returns `false` when no such
    /// process is listening.
    fn send_signal(&self, pid: u32) -> bool;
}

/// Delivery fabric shared by the [`TokioScheduler`]s of one process group.
///
/// Each signal task owns a `Notify`; signalling a process notifies every task
/// it registered. `notify_one` stores a permit, so a signal sent while the
/// task is busy is not lost.
#[derive(Default)]
pub struct SignalBus {
    targets: DashMap<(u32, u64), Arc<Notify>>,
}

impl SignalBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, pid: u32, task_id: u64) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.targets.insert((pid, task_id), notify.clone());
        notify
    }

    fn unregister(&self, pid: u32, task_id: u64) {
        self.targets.remove(&(pid, task_id));
    }

    fn signal(&self, pid: u32) -> bool {
        let mut delivered = false;
        for target in self.targets.iter().filter(|t| t.key().0 == pid) {
            target.value().notify_one();
            delivered = true;
        }
        delivered
    }
}

/// [`Scheduler`] running tasks on a Tokio runtime.
///
/// Each task gets its own async loop; the task body runs on the blocking
/// pool so lock waits never stall the runtime's worker threads. Runs of the
/// same task never overlap.
pub struct TokioScheduler {
    pid: u32,
    runtime: Handle,
    bus: Arc<SignalBus>,
    tasks: DashMap<u64, JoinHandle<()>>,
    next_id: AtomicU64,
}

impl TokioScheduler {
    /// Scheduler for the current OS process with a private signal bus
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime context.
    pub fn new() -> Self {
        Self::with_bus(std::process::id(), Arc::new(SignalBus::new()))
    }

    /// Scheduler acting as process `pid` on a shared signal bus. Several
    /// schedulers on one bus behave like separate worker processes.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime context.
    pub fn with_bus(pid: u32, bus: Arc<SignalBus>) -> Self {
        Self {
            pid,
            runtime: Handle::current(),
            bus,
            tasks: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    async fn run_task(task: &Task) {
        let task = task.clone();
        if let Err(err) = tokio::task::spawn_blocking(move || task()).await {
            tracing::warn!(error = %err, "scheduled task failed");
        }
    }
}

impl Default for TokioScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for TokioScheduler {
    fn process_id(&self) -> u32 {
        self.pid
    }

    fn schedule(&self, task: Task, interval: Duration) -> TaskHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let interval = interval.max(Duration::from_millis(1));

        let join = self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                Self::run_task(&task).await;
            }
        });

        self.tasks.insert(id, join);
        TaskHandle(id)
    }

    fn on_signal(&self, task: Task) -> TaskHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let notify = self.bus.register(self.pid, id);

        let join = self.runtime.spawn(async move {
            loop {
                notify.notified().await;
                Self::run_task(&task).await;
            }
        });

        self.tasks.insert(id, join);
        TaskHandle(id)
    }

    fn cancel(&self, handle: TaskHandle) -> bool {
        self.bus.unregister(self.pid, handle.0);
        match self.tasks.remove(&handle.0) {
            Some((_, join)) => {
                join.abort();
                true
            }
            None => false,
        }
    }

    fn send_signal(&self, pid: u32) -> bool {
        self.bus.signal(pid)
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        for entry in self.tasks.iter() {
            entry.value().abort();
            self.bus.unregister(self.pid, *entry.key());
        }
    }
}

#[derive(Clone)]
enum Trigger {
    Interval(Duration),
    Signal,
}

/// [`Scheduler`] that only runs tasks when told to.
///
/// Useful for embedding the cache in a foreign event loop, and for tests
/// that need to step listeners deterministically.
pub struct ManualScheduler {
    pid: u32,
    tasks: Mutex<BTreeMap<u64, (Task, Trigger)>>,
    pending_signals: AtomicU64,
    sent: Mutex<Vec<u32>>,
    next_id: AtomicU64,
}

impl ManualScheduler {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            tasks: Mutex::new(BTreeMap::new()),
            pending_signals: AtomicU64::new(0),
            sent: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn snapshot(&self, filter: impl Fn(&Trigger) -> bool) -> Vec<Task> {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks
            .values()
            .filter(|(_, trigger)| filter(trigger))
            .map(|(task, _)| task.clone())
            .collect()
    }

    /// Runs one task once. Returns `false` for unknown handles.
    pub fn fire(&self, handle: TaskHandle) -> bool {
        let task = {
            let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.get(&handle.0).map(|(task, _)| task.clone())
        };
        match task {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }

    /// Runs every interval task once, in registration order
    pub fn tick(&self) -> usize {
        let due = self.snapshot(|t| matches!(t, Trigger::Interval(_)));
        for task in &due {
            task();
        }
        due.len()
    }

    /// Runs every signal task once per signal received since the last call.
    /// Returns the number of signals consumed.
    pub fn deliver_signals(&self) -> u64 {
        let pending = self.pending_signals.swap(0, Ordering::SeqCst);
        for _ in 0..pending {
            for task in self.snapshot(|t| matches!(t, Trigger::Signal)) {
                task();
            }
        }
        pending
    }

    /// Process ids signalled through this scheduler, in order
    pub fn sent_signals(&self) -> Vec<u32> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of live tasks
    pub fn len(&self) -> usize {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Interval a task was scheduled with; `None` for signal tasks
    pub fn interval_of(&self, handle: TaskHandle) -> Option<Duration> {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        match tasks.get(&handle.0) {
            Some((_, Trigger::Interval(interval))) => Some(*interval),
            _ => None,
        }
    }

    fn insert(&self, task: Task, trigger: Trigger) -> TaskHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, (task, trigger));
        TaskHandle(id)
    }
}

impl Scheduler for ManualScheduler {
    fn process_id(&self) -> u32 {
        self.pid
    }

    fn schedule(&self, task: Task, interval: Duration) -> TaskHandle {
        self.insert(task, Trigger::Interval(interval))
    }

    fn on_signal(&self, task: Task) -> TaskHandle {
        self.insert(task, Trigger::Signal)
    }

    fn cancel(&self, handle: TaskHandle) -> bool {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&handle.0)
            .is_some()
    }

    fn send_signal(&self, pid: u32) -> bool {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(pid);
        if pid == self.pid {
            self.pending_signals.fetch_add(1, Ordering::SeqCst);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter_task() -> (Arc<AtomicUsize>, Task) {
        let count = Arc::new(AtomicUsize::new(0));
        let task_count = count.clone();
        let task: Task = Arc::new(move || {
            task_count.fetch_add(1, Ordering::SeqCst);
        });
        (count, task)
    }

    #[test]
    fn test_manual_fire_and_cancel() {
        let scheduler = ManualScheduler::new(1);
        let (count, task) = counter_task();

        let handle = scheduler.schedule(task, Duration::from_millis(5));
        assert_eq!(scheduler.interval_of(handle), Some(Duration::from_millis(5)));
        assert!(scheduler.fire(handle));
        assert_eq!(scheduler.tick(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 2);

        assert!(scheduler.cancel(handle));
        assert!(!scheduler.cancel(handle));
        assert!(!scheduler.fire(handle));
        assert_eq!(scheduler.tick(), 0);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_manual_signals() {
        let scheduler = ManualScheduler::new(7);
        let (count, task) = counter_task();
        scheduler.on_signal(task);

        assert!(scheduler.send_signal(7));
        assert!(scheduler.send_signal(7));
        assert!(!scheduler.send_signal(8));

        assert_eq!(scheduler.deliver_signals(), 2);
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.deliver_signals(), 0);
        assert_eq!(scheduler.sent_signals(), vec![7, 7, 8]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tokio_interval_task_runs_until_cancelled() {
        let scheduler = TokioScheduler::new();
        let (count, task) = counter_task();

        let handle = scheduler.schedule(task, Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(count.load(Ordering::SeqCst) >= 2);

        assert!(scheduler.cancel(handle));
        // Let an in-flight run finish
        tokio::time::sleep(Duration::from_millis(20)).await;
        let after_cancel = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(count.load(Ordering::SeqCst), after_cancel);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tokio_signal_between_processes() {
        let bus = Arc::new(SignalBus::new());
        let listener = TokioScheduler::with_bus(100, bus.clone());
        let publisher = TokioScheduler::with_bus(200, bus);
        let (count, task) = counter_task();

        listener.on_signal(task);
        assert!(publisher.send_signal(100));
        assert!(!publisher.send_signal(300));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tokio_cancel_unregisters_signal_target() {
        let bus = Arc::new(SignalBus::new());
        let scheduler = TokioScheduler::with_bus(5, bus);
        let (_count, task) = counter_task();

        let handle = scheduler.on_signal(task);
        assert!(scheduler.cancel(handle));
        assert!(!scheduler.send_signal(5));
    }
}
