use crate::error::{ErrorKind, HelperError};
use crate::exec::ExecutorPool;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

type Callback<T> = Box<dyn FnOnce(Result<T, HelperError>) + Send + 'static>;

enum State<T> {
    /// Not yet completed; an optional continuation waits for the result.
    Pending(Option<Callback<T>>),
    /// Completed; `None` once the result has been handed out.
    Done(Option<Result<T, HelperError>>),
}

struct Cell<T> {
    state: Mutex<State<T>>,
    ready: Condvar,
}

/// One-shot result of an asynchronous storage operation.
///
/// Completion happens on whichever thread fulfils the matching
/// [`Promise`]; waiters must assume the continuation can observe any
/// thread. An optional deadline is baked into the future itself, so a
/// backend result arriving after the deadline is dominated by `TimedOut`.
pub struct OpFuture<T> {
    cell: Arc<Cell<T>>,
    deadline: Option<Instant>,
}

/// Producer half of an [`OpFuture`]. Dropping a promise without
/// completing it resolves the future with `Cancelled`, so a waiter can
/// never block on a task that died.
pub struct Promise<T> {
    cell: Arc<Cell<T>>,
    completed: bool,
}

impl<T: Send + 'static> OpFuture<T> {
    /// Creates a connected promise/future pair.
    pub fn promise() -> (Promise<T>, OpFuture<T>) {
        let cell = Arc::new(Cell {
            state: Mutex::new(State::Pending(None)),
            ready: Condvar::new(),
        });
        (
            Promise {
                cell: cell.clone(),
                completed: false,
            },
            OpFuture {
                cell,
                deadline: None,
            },
        )
    }

    /// An already-completed future.
    pub fn ready(result: Result<T, HelperError>) -> Self {
        let cell = Arc::new(Cell {
            state: Mutex::new(State::Done(Some(result))),
            ready: Condvar::new(),
        });
        OpFuture {
            cell,
            deadline: None,
        }
    }

    /// Caps how long waiters will block; expiry resolves to `TimedOut`
    /// even if the backend call later completes.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Blocks until completion (or the baked-in deadline).
    pub fn wait(self) -> Result<T, HelperError> {
        let deadline = self.deadline;
        self.wait_until(deadline)
    }

    /// Blocks at most `timeout`, whichever of it and the baked-in
    /// deadline comes first.
    pub fn wait_for(self, timeout: Duration) -> Result<T, HelperError> {
        let requested = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) => Some(existing.min(requested)),
            None => Some(requested),
        };
        self.wait_until(deadline)
    }

    fn wait_until(self, deadline: Option<Instant>) -> Result<T, HelperError> {
        let mut state = match self.cell.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        loop {
            if let State::Done(slot) = &mut *state {
                return slot.take().unwrap_or_else(|| {
                    Err(HelperError::cancelled("operation result already consumed"))
                });
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(HelperError::timed_out("operation deadline exceeded"));
                    }
                    let (next, _timeout) = self
                        .cell
                        .ready
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    state = next;
                }
                None => {
                    state = self
                        .cell
                        .ready
                        .wait(state)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
            }
        }
    }

    /// Registers a continuation invoked on the completing thread. Used by
    /// the combinators below; continuations must stay cheap.
    fn on_complete(self, callback: Callback<T>) {
        let ready = {
            let mut state = match self.cell.state.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            match &mut *state {
                State::Pending(slot) => {
                    *slot = Some(callback);
                    None
                }
                State::Done(slot) => {
                    let result = slot.take().unwrap_or_else(|| {
                        Err(HelperError::cancelled("operation result already consumed"))
                    });
                    Some((callback, result))
                }
            }
        };
        if let Some((callback, result)) = ready {
            callback(result);
        }
    }

    /// Transforms the result inline on the completing thread. The
    /// deadline (if any) carries over to the returned future.
    pub fn map<U, F>(self, transform: F) -> OpFuture<U>
    where
        U: Send + 'static,
        F: FnOnce(Result<T, HelperError>) -> Result<U, HelperError> + Send + 'static,
    {
        let deadline = self.deadline;
        let (promise, future) = OpFuture::promise();
        self.on_complete(Box::new(move |result| {
            promise.complete(transform(result));
        }));
        match deadline {
            Some(deadline) => future.with_deadline(deadline),
            None => future,
        }
    }

    /// Chains a continuation that runs as its own task on `pool` once
    /// this future completes. Chained operations observe the post-state
    /// of their predecessor.
    pub fn then<U, F>(self, pool: &ExecutorPool, continuation: F) -> OpFuture<U>
    where
        U: Send + 'static,
        F: FnOnce(Result<T, HelperError>) -> Result<U, HelperError> + Send + 'static,
    {
        let pool = pool.clone();
        let (promise, future) = OpFuture::promise();
        self.on_complete(Box::new(move |result| {
            pool.submit(move || continuation(result))
                .on_complete(Box::new(move |chained| promise.complete(chained)));
        }));
        future
    }
}

impl<T> Promise<T> {
    pub fn complete(mut self, result: Result<T, HelperError>) {
        self.completed = true;
        Self::fulfil(&self.cell, result);
    }

    fn fulfil(cell: &Cell<T>, result: Result<T, HelperError>) {
        let callback = {
            let mut state = match cell.state.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            match std::mem::replace(&mut *state, State::Done(None)) {
                State::Pending(Some(callback)) => Some((callback, result)),
                State::Pending(None) => {
                    *state = State::Done(Some(result));
                    cell.ready.notify_all();
                    None
                }
                // Already completed; keep the first result.
                State::Done(previous) => {
                    *state = State::Done(previous);
                    None
                }
            }
        };
        if let Some((callback, result)) = callback {
            callback(result);
        }
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if !self.completed {
            Self::fulfil(
                &self.cell,
                Err(HelperError::new(
                    ErrorKind::Cancelled,
                    "task dropped before completion",
                )),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_future_resolves_immediately() {
        let future = OpFuture::ready(Ok(7u32));
        assert_eq!(future.wait().unwrap(), 7);
    }

    #[test]
    fn promise_completion_wakes_waiter() {
        let (promise, future) = OpFuture::<u32>::promise();
        let waiter = std::thread::spawn(move || future.wait());
        std::thread::sleep(Duration::from_millis(20));
        promise.complete(Ok(11));
        assert_eq!(waiter.join().unwrap().unwrap(), 11);
    }

    #[test]
    fn dropped_promise_cancels_waiter() {
        let (promise, future) = OpFuture::<u32>::promise();
        drop(promise);
        assert_eq!(future.wait().unwrap_err().kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn deadline_dominates_late_completion() {
        let (promise, future) = OpFuture::<u32>::promise();
        let future = future.with_timeout(Duration::from_millis(30));
        let late = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(120));
            promise.complete(Ok(1));
        });
        assert_eq!(future.wait().unwrap_err().kind(), ErrorKind::TimedOut);
        late.join().unwrap();
    }

    #[test]
    fn map_transforms_on_completion() {
        let (promise, future) = OpFuture::<u32>::promise();
        let mapped = future.map(|result| result.map(|value| value * 2));
        promise.complete(Ok(21));
        assert_eq!(mapped.wait().unwrap(), 42);
    }

    #[test]
    fn map_preserves_error() {
        let future: OpFuture<u32> = OpFuture::ready(Err(HelperError::not_supported("op")));
        let mapped = future.map(|result| result.map(|value| value + 1));
        assert_eq!(mapped.wait().unwrap_err().kind(), ErrorKind::NotSupported);
    }
}
