use crate::error::HelperError;
use crate::exec::{OpFuture, Promise};
use log::debug;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct JobQueue {
    jobs: VecDeque<Job>,
    shutdown: bool,
}

struct PoolInner {
    name: String,
    queue: Mutex<JobQueue>,
    available: Condvar,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

/// Fixed-size worker pool dispatching blocking backend calls off the
/// caller's thread. Cloning is cheap; all clones share the same workers.
#[derive(Clone)]
pub struct ExecutorPool {
    inner: Arc<PoolInner>,
}

impl ExecutorPool {
    pub fn new(name: impl Into<String>, threads: usize) -> Self {
        let inner = Arc::new(PoolInner {
            name: name.into(),
            queue: Mutex::new(JobQueue {
                jobs: VecDeque::new(),
                shutdown: false,
            }),
            available: Condvar::new(),
            workers: Mutex::new(Vec::new()),
        });
        let threads = threads.max(1);
        let mut workers = Vec::with_capacity(threads);
        for index in 0..threads {
            let worker = Arc::downgrade(&inner);
            let thread_name = format!("{}-{}", inner.name, index);
            let handle = thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || {
                    // The strong reference is re-acquired per poll so an
                    // abandoned pool can be dropped while workers idle.
                    loop {
                        let pool = match worker.upgrade() {
                            Some(pool) => pool,
                            None => break,
                        };
                        match poll_queue(&pool) {
                            QueuePoll::Job(job) => {
                                let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(job));
                            }
                            QueuePoll::Idle => {}
                            QueuePoll::Shutdown => break,
                        }
                    }
                })
                .unwrap_or_else(|err| panic!("failed to spawn worker {thread_name}: {err}"));
            workers.push(handle);
        }
        *lock_ignore_poison(&inner.workers) = workers;
        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Submits a blocking task; the returned future completes on the
    /// worker that ran it. If the pool is already shut down the task is
    /// dropped and the future resolves `Cancelled`.
    pub fn submit<T, F>(&self, task: F) -> OpFuture<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, HelperError> + Send + 'static,
    {
        let (promise, future) = OpFuture::promise();
        let job: Job = Box::new(move || run_task(task, promise));
        {
            let mut queue = lock_ignore_poison(&self.inner.queue);
            if queue.shutdown {
                // Dropping the job drops its promise, resolving Cancelled.
                drop(job);
                return future;
            }
            queue.jobs.push_back(job);
        }
        self.inner.available.notify_one();
        future
    }

    /// Stops accepting work, cancels queued-but-unstarted jobs and joins
    /// the workers. In-flight jobs run to completion first.
    pub fn shutdown(&self) {
        let pending = {
            let mut queue = lock_ignore_poison(&self.inner.queue);
            if queue.shutdown {
                VecDeque::new()
            } else {
                queue.shutdown = true;
                std::mem::take(&mut queue.jobs)
            }
        };
        self.inner.available.notify_all();
        if !pending.is_empty() {
            debug!(
                "executor {} dropping {} queued jobs at shutdown",
                self.inner.name,
                pending.len()
            );
        }
        drop(pending);
        let handles: Vec<_> = lock_ignore_poison(&self.inner.workers).drain(..).collect();
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        // Last owner gone; workers hold only weak references and exit on
        // their next queue poll.
        if let Ok(mut queue) = self.queue.lock() {
            queue.shutdown = true;
        }
        self.available.notify_all();
    }
}

fn run_task<T, F>(task: F, promise: Promise<T>)
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, HelperError>,
{
    promise.complete(task());
}

enum QueuePoll {
    Job(Job),
    Idle,
    Shutdown,
}

const IDLE_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(100);

fn poll_queue(pool: &PoolInner) -> QueuePoll {
    let mut queue = lock_ignore_poison(&pool.queue);
    if queue.shutdown {
        return QueuePoll::Shutdown;
    }
    if let Some(job) = queue.jobs.pop_front() {
        return QueuePoll::Job(job);
    }
    let (mut queue, _timeout) = pool
        .available
        .wait_timeout(queue, IDLE_POLL_INTERVAL)
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if queue.shutdown {
        return QueuePoll::Shutdown;
    }
    match queue.jobs.pop_front() {
        Some(job) => QueuePoll::Job(job),
        None => QueuePoll::Idle,
    }
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
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn tasks_complete_on_workers() {
        let pool = ExecutorPool::new("test-pool", 2);
        let futures: Vec<_> = (0..8u32).map(|n| pool.submit(move || Ok(n * n))).collect();
        let mut results: Vec<u32> = futures.into_iter().map(|f| f.wait().unwrap()).collect();
        results.sort_unstable();
        assert_eq!(results, vec![0, 1, 4, 9, 16, 25, 36, 49]);
        pool.shutdown();
    }

    #[test]
    fn chained_tasks_observe_predecessor() {
        let pool = ExecutorPool::new("chain-pool", 1);
        let counter = Arc::new(AtomicUsize::new(0));
        let first = {
            let counter = counter.clone();
            pool.submit(move || {
                counter.store(1, Ordering::SeqCst);
                Ok(())
            })
        };
        let counter_after = counter.clone();
        let second = first.then(&pool, move |result| {
            result?;
            Ok(counter_after.load(Ordering::SeqCst))
        });
        assert_eq!(second.wait().unwrap(), 1);
        pool.shutdown();
    }

    #[test]
    fn submit_after_shutdown_is_cancelled() {
        let pool = ExecutorPool::new("closed-pool", 1);
        pool.shutdown();
        let future = pool.submit(|| Ok(1u8));
        assert_eq!(future.wait().unwrap_err().kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn dropped_future_detaches_without_blocking_task() {
        let pool = ExecutorPool::new("detach-pool", 1);
        let ran = Arc::new(AtomicUsize::new(0));
        let observed = ran.clone();
        let future = pool.submit(move || {
            std::thread::sleep(Duration::from_millis(20));
            observed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        drop(future);
        let barrier = pool.submit(|| Ok(()));
        barrier.wait().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        pool.shutdown();
    }

    #[test]
    fn panicking_task_resolves_cancelled() {
        let pool = ExecutorPool::new("panic-pool", 1);
        let future: OpFuture<()> = pool.submit(|| panic!("worker task failure"));
        assert_eq!(future.wait().unwrap_err().kind(), ErrorKind::Cancelled);
        // The worker survives the panic and keeps serving jobs.
        assert_eq!(pool.submit(|| Ok(5u8)).wait().unwrap(), 5);
        pool.shutdown();
    }
}
