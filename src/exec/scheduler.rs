use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Cancellation token for a scheduled task. Cancellation is
/// cooperative: a task that already started running is not interrupted.
#[derive(Clone)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, AtomicOrdering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(AtomicOrdering::SeqCst)
    }
}

struct TimerEntry {
    due_at: Instant,
    seq: u64,
    cancelled: Arc<AtomicBool>,
    task: Box<dyn FnOnce() + Send + 'static>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due_at == other.due_at && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    // Reversed so the BinaryHeap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due_at
            .cmp(&self.due_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct TimerQueue {
    entries: BinaryHeap<TimerEntry>,
    next_seq: u64,
    shutdown: bool,
}

struct SchedulerInner {
    queue: Mutex<TimerQueue>,
    tick: Condvar,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

/// Delayed-task scheduler backing time-based buffer flushes and other
/// periodic helper work. Runs a small fixed worker set.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(workers: usize) -> Self {
        let inner = Arc::new(SchedulerInner {
            queue: Mutex::new(TimerQueue {
                entries: BinaryHeap::new(),
                next_seq: 0,
                shutdown: false,
            }),
            tick: Condvar::new(),
            workers: Mutex::new(Vec::new()),
        });
        let workers = workers.max(1);
        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let weak = Arc::downgrade(&inner);
            let handle = thread::Builder::new()
                .name(format!("buffer-scheduler-{index}"))
                .spawn(move || loop {
                    let inner = match weak.upgrade() {
                        Some(inner) => inner,
                        None => break,
                    };
                    if !run_due_tasks(&inner) {
                        break;
                    }
                })
                .expect("failed to spawn scheduler worker");
            handles.push(handle);
        }
        *lock_ignore_poison(&inner.workers) = handles;
        Self { inner }
    }

    /// Schedules `task` to run once `delay` elapses. The returned handle
    /// cancels the task if it has not started yet.
    pub fn schedule_after(
        &self,
        delay: Duration,
        task: impl FnOnce() + Send + 'static,
    ) -> CancelHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        {
            let mut queue = lock_ignore_poison(&self.inner.queue);
            if queue.shutdown {
                cancelled.store(true, AtomicOrdering::SeqCst);
            } else {
                let seq = queue.next_seq;
                queue.next_seq += 1;
                queue.entries.push(TimerEntry {
                    due_at: Instant::now() + delay,
                    seq,
                    cancelled: cancelled.clone(),
                    task: Box::new(task),
                });
            }
        }
        self.inner.tick.notify_all();
        CancelHandle { cancelled }
    }

    pub fn shutdown(&self) {
        {
            let mut queue = lock_ignore_poison(&self.inner.queue);
            queue.shutdown = true;
            queue.entries.clear();
        }
        self.inner.tick.notify_all();
        let handles: Vec<_> = lock_ignore_poison(&self.inner.workers).drain(..).collect();
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for SchedulerInner {
    fn drop(&mut self) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.shutdown = true;
            queue.entries.clear();
        }
        self.tick.notify_all();
    }
}

const SCHEDULER_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Runs the next due task or naps until one may be due; returns `false`
/// once the scheduler shuts down. Control returns to the caller between
/// polls so an abandoned scheduler can be reclaimed.
fn run_due_tasks(inner: &SchedulerInner) -> bool {
    let mut queue = lock_ignore_poison(&inner.queue);
    if queue.shutdown {
        return false;
    }
    let now = Instant::now();
    let wait = match queue.entries.peek() {
        Some(entry) if entry.due_at <= now => {
            let entry = queue.entries.pop().expect("peeked timer entry");
            drop(queue);
            if !entry.cancelled.load(AtomicOrdering::SeqCst) {
                (entry.task)();
            }
            return true;
        }
        Some(entry) => (entry.due_at - now).min(SCHEDULER_POLL_INTERVAL),
        None => SCHEDULER_POLL_INTERVAL,
    };
    let (queue, _timeout) = inner
        .tick
        .wait_timeout(queue, wait)
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    !queue.shutdown
}

fn lock_ignore_poison<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn delayed_task_fires_after_delay() {
        let scheduler = Scheduler::new(1);
        let fired = Arc::new(AtomicUsize::new(0));
        let observed = fired.clone();
        scheduler.schedule_after(Duration::from_millis(20), move || {
            observed.fetch_add(1, AtomicOrdering::SeqCst);
        });
        assert_eq!(fired.load(AtomicOrdering::SeqCst), 0);
        thread::sleep(Duration::from_millis(120));
        assert_eq!(fired.load(AtomicOrdering::SeqCst), 1);
        scheduler.shutdown();
    }

    #[test]
    fn cancelled_task_never_fires() {
        let scheduler = Scheduler::new(1);
        let fired = Arc::new(AtomicUsize::new(0));
        let observed = fired.clone();
        let handle = scheduler.schedule_after(Duration::from_millis(30), move || {
            observed.fetch_add(1, AtomicOrdering::SeqCst);
        });
        handle.cancel();
        thread::sleep(Duration::from_millis(120));
        assert_eq!(fired.load(AtomicOrdering::SeqCst), 0);
        scheduler.shutdown();
    }

    #[test]
    fn tasks_fire_in_deadline_order() {
        let scheduler = Scheduler::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));
        for (delay_ms, label) in [(60u64, "late"), (10, "early"), (35, "middle")] {
            let order = order.clone();
            scheduler.schedule_after(Duration::from_millis(delay_ms), move || {
                order.lock().unwrap().push(label);
            });
        }
        thread::sleep(Duration::from_millis(200));
        assert_eq!(*order.lock().unwrap(), vec!["early", "middle", "late"]);
        scheduler.shutdown();
    }
}
