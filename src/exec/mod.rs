//! Execution runtime for the storage helpers.
//!
//! Each backend family owns an [`ExecutorPool`]; blocking backend calls
//! are submitted as closures and run to completion on a worker, never
//! yielding mid-syscall. The caller gets an [`OpFuture`] that can be
//! awaited, chained or dropped (dropping detaches the waiter; the
//! in-flight call finishes and its result is discarded). A small
//! [`Scheduler`] drives delayed tasks such as buffer flush timers.

mod future;
mod pool;
mod scheduler;

pub use future::{OpFuture, Promise};
pub use pool::ExecutorPool;
pub use scheduler::{CancelHandle, Scheduler};
