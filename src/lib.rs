//! storfab — a uniform storage-access layer.
//!
//! Presents heterogeneous backends (local POSIX filesystem, S3- and
//! Swift-semantics object stores, a Ceph RADOS pool, and a remote proxy
//! reached over an injected channel) behind one filesystem-shaped
//! contract, the engine a FUSE-style frontend drives. Backends are
//! feature-gated; the [`factory::HelperFactory`] assembles helpers from
//! a name plus a string→string parameter map and wires in per-backend
//! executors and the optional write-buffering decorator.
#![deny(unreachable_pub)]
#![deny(unused_must_use)]

pub mod buffering;
#[cfg(feature = "ceph")]
pub mod ceph;
pub mod error;
pub mod exec;
pub mod factory;
pub mod helper;
#[cfg(feature = "objectstore")]
pub mod objectstore;
pub mod posix;
#[cfg(feature = "proxy")]
pub mod proxy;
pub mod retry;
pub mod telemetry;

pub use buffering::{BufferLimits, BufferedFileHandle, BufferedHelper};
#[cfg(feature = "ceph")]
pub use ceph::{CephConfig, CephFileHandle, CephHelper};
pub use error::{ErrorKind, HelperError};
pub use exec::{CancelHandle, ExecutorPool, OpFuture, Promise, Scheduler};
pub use factory::{HelperFactory, HelperFactoryBuilder, POSIX_HELPER_NAME};
#[cfg(feature = "ceph")]
pub use factory::CEPH_HELPER_NAME;
#[cfg(feature = "proxy")]
pub use factory::PROXY_HELPER_NAME;
#[cfg(feature = "s3")]
pub use factory::S3_HELPER_NAME;
#[cfg(feature = "swift")]
pub use factory::SWIFT_HELPER_NAME;
pub use helper::{
    FileHandle, FileId, Mode, NodeKind, OpenFlags, Params, Stat, StorageHelper,
    DEFAULT_OP_TIMEOUT,
};
#[cfg(feature = "objectstore")]
pub use objectstore::{
    delete_objects_batched, ObjectBackend, ObjectEntry, ObjectStoreHelper, MAX_DELETE_BATCH,
};
#[cfg(feature = "s3")]
pub use objectstore::s3::{S3Client, S3Config};
#[cfg(feature = "swift")]
pub use objectstore::swift::{SwiftClient, SwiftConfig};
pub use posix::{FsIdentityGuard, PosixFileHandle, PosixHelper, PosixHelperConfig};
#[cfg(feature = "proxy")]
pub use proxy::{
    Communicator, ProxyConnection, ProxyFileHandle, ProxyHelper, ProxyRequest, ProxyResponse,
};
pub use retry::{RetryHandle, RetryPolicy, RetryStrategy};
pub use telemetry::{
    MetricsSnapshot, SharedMetricsRegistry, TimerGuard, TimerSnapshot, HELPER_METRICS_NAMESPACE,
};
