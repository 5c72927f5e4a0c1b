//! Helper assembly: name + parameter map → ready-to-use helper.
//!
//! The factory owns one executor pool per backend family and the
//! scheduler that drives buffered flushes; helpers constructed here
//! share those resources. Backend names are only recognized when the
//! corresponding feature is compiled in.

use crate::buffering::{BufferLimits, BufferedHelper};
#[cfg(feature = "ceph")]
use crate::ceph::CephHelper;
use crate::error::HelperError;
use crate::exec::{ExecutorPool, Scheduler};
use crate::helper::{Params, StorageHelper};
#[cfg(any(feature = "s3", feature = "swift"))]
use crate::objectstore::ObjectStoreHelper;
#[cfg(feature = "s3")]
use crate::objectstore::s3::{S3Client, S3Config};
#[cfg(feature = "swift")]
use crate::objectstore::swift::{SwiftClient, SwiftConfig};
use crate::posix::PosixHelper;
#[cfg(feature = "proxy")]
use crate::proxy::{Communicator, ProxyConnection, ProxyHelper};
use crate::telemetry::SharedMetricsRegistry;
use std::sync::Arc;

pub const POSIX_HELPER_NAME: &str = "posix";
#[cfg(feature = "s3")]
pub const S3_HELPER_NAME: &str = "s3";
#[cfg(feature = "swift")]
pub const SWIFT_HELPER_NAME: &str = "swift";
#[cfg(feature = "ceph")]
pub const CEPH_HELPER_NAME: &str = "ceph";
#[cfg(feature = "proxy")]
pub const PROXY_HELPER_NAME: &str = "proxy";

const DEFAULT_POOL_THREADS: usize = 4;
const DEFAULT_SCHEDULER_WORKERS: usize = 1;

pub struct HelperFactoryBuilder {
    posix_threads: usize,
    #[cfg(feature = "s3")]
    s3_threads: usize,
    #[cfg(feature = "swift")]
    swift_threads: usize,
    #[cfg(feature = "ceph")]
    ceph_threads: usize,
    scheduler_workers: usize,
    buffer_limits: BufferLimits,
    metrics: Option<SharedMetricsRegistry>,
    #[cfg(feature = "proxy")]
    communicator: Option<Arc<dyn Communicator>>,
}

impl Default for HelperFactoryBuilder {
    fn default() -> Self {
        Self {
            posix_threads: DEFAULT_POOL_THREADS,
            #[cfg(feature = "s3")]
            s3_threads: DEFAULT_POOL_THREADS,
            #[cfg(feature = "swift")]
            swift_threads: DEFAULT_POOL_THREADS,
            #[cfg(feature = "ceph")]
            ceph_threads: DEFAULT_POOL_THREADS,
            scheduler_workers: DEFAULT_SCHEDULER_WORKERS,
            buffer_limits: BufferLimits::default(),
            metrics: None,
            #[cfg(feature = "proxy")]
            communicator: None,
        }
    }
}

impl HelperFactoryBuilder {
    pub fn posix_threads(mut self, threads: usize) -> Self {
        self.posix_threads = threads;
        self
    }

    #[cfg(feature = "s3")]
    pub fn s3_threads(mut self, threads: usize) -> Self {
        self.s3_threads = threads;
        self
    }

    #[cfg(feature = "swift")]
    pub fn swift_threads(mut self, threads: usize) -> Self {
        self.swift_threads = threads;
        self
    }

    #[cfg(feature = "ceph")]
    pub fn ceph_threads(mut self, threads: usize) -> Self {
        self.ceph_threads = threads;
        self
    }

    pub fn scheduler_workers(mut self, workers: usize) -> Self {
        self.scheduler_workers = workers;
        self
    }

    pub fn buffer_limits(mut self, limits: BufferLimits) -> Self {
        self.buffer_limits = limits;
        self
    }

    pub fn metrics(mut self, metrics: SharedMetricsRegistry) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Injects the transport used by proxy helpers.
    #[cfg(feature = "proxy")]
    pub fn communicator(mut self, communicator: Arc<dyn Communicator>) -> Self {
        self.communicator = Some(communicator);
        self
    }

    pub fn build(self) -> HelperFactory {
        HelperFactory {
            posix_pool: ExecutorPool::new("posix-io", self.posix_threads),
            #[cfg(feature = "s3")]
            s3_pool: ExecutorPool::new("s3-io", self.s3_threads),
            #[cfg(feature = "swift")]
            swift_pool: ExecutorPool::new("swift-io", self.swift_threads),
            #[cfg(feature = "ceph")]
            ceph_pool: ExecutorPool::new("ceph-io", self.ceph_threads),
            scheduler: Scheduler::new(self.scheduler_workers),
            buffer_limits: self.buffer_limits,
            metrics: self.metrics.unwrap_or_default(),
            #[cfg(feature = "proxy")]
            proxy_connection: self.communicator.map(ProxyConnection::new),
        }
    }
}

pub struct HelperFactory {
    posix_pool: ExecutorPool,
    #[cfg(feature = "s3")]
    s3_pool: ExecutorPool,
    #[cfg(feature = "swift")]
    swift_pool: ExecutorPool,
    #[cfg(feature = "ceph")]
    ceph_pool: ExecutorPool,
    scheduler: Scheduler,
    buffer_limits: BufferLimits,
    metrics: SharedMetricsRegistry,
    #[cfg(feature = "proxy")]
    proxy_connection: Option<ProxyConnection>,
}

impl HelperFactory {
    pub fn builder() -> HelperFactoryBuilder {
        HelperFactoryBuilder::default()
    }

    pub fn metrics(&self) -> &SharedMetricsRegistry {
        &self.metrics
    }

    /// Inbound proxy messages are routed through this connection.
    #[cfg(feature = "proxy")]
    pub fn proxy_connection(&self) -> Option<&ProxyConnection> {
        self.proxy_connection.as_ref()
    }

    /// Produces a helper for `name` configured by `params`; `buffered`
    /// wraps bufferable helpers in the coalescing decorator.
    pub fn create(
        &self,
        name: &str,
        params_map: &Params,
        buffered: bool,
    ) -> Result<Arc<dyn StorageHelper>, HelperError> {
        match name {
            POSIX_HELPER_NAME => {
                let helper = PosixHelper::from_params(params_map, self.posix_pool.clone())?
                    .with_metrics(self.metrics.clone());
                // Local I/O gains nothing from coalescing.
                Ok(Arc::new(helper))
            }
            #[cfg(feature = "s3")]
            S3_HELPER_NAME => {
                let config = S3Config::from_params(params_map)?;
                let timeout = config.timeout;
                let client = S3Client::new(config)?.with_metrics(self.metrics.clone());
                let helper: Arc<dyn StorageHelper> = Arc::new(ObjectStoreHelper::new(
                    Arc::new(client),
                    self.s3_pool.clone(),
                    timeout,
                ));
                Ok(self.maybe_buffered(helper, buffered))
            }
            #[cfg(feature = "swift")]
            SWIFT_HELPER_NAME => {
                let config = SwiftConfig::from_params(params_map)?;
                let timeout = config.timeout;
                let client = SwiftClient::new(config)?.with_metrics(self.metrics.clone());
                let helper: Arc<dyn StorageHelper> = Arc::new(ObjectStoreHelper::new(
                    Arc::new(client),
                    self.swift_pool.clone(),
                    timeout,
                ));
                Ok(self.maybe_buffered(helper, buffered))
            }
            #[cfg(feature = "ceph")]
            CEPH_HELPER_NAME => {
                let helper = CephHelper::from_params(params_map, self.ceph_pool.clone())?
                    .with_metrics(self.metrics.clone());
                Ok(self.maybe_buffered(Arc::new(helper), buffered))
            }
            #[cfg(feature = "proxy")]
            PROXY_HELPER_NAME => {
                let connection = self.proxy_connection.clone().ok_or_else(|| {
                    HelperError::invalid_argument(
                        "proxy helper requires an injected communicator",
                    )
                })?;
                let helper = ProxyHelper::from_params(params_map, connection)?
                    .with_metrics(self.metrics.clone());
                Ok(self.maybe_buffered(Arc::new(helper), buffered))
            }
            other => Err(HelperError::invalid_argument(format!(
                "unknown storage helper `{other}`"
            ))),
        }
    }

    fn maybe_buffered(
        &self,
        helper: Arc<dyn StorageHelper>,
        buffered: bool,
    ) -> Arc<dyn StorageHelper> {
        if buffered {
            Arc::new(
                BufferedHelper::new(helper, self.scheduler.clone())
                    .with_limits(self.buffer_limits.clone()),
            )
        } else {
            helper
        }
    }

    /// Stops the pools and the scheduler; outstanding calls finish,
    /// queued ones cancel.
    pub fn shutdown(&self) {
        self.posix_pool.shutdown();
        #[cfg(feature = "s3")]
        self.s3_pool.shutdown();
        #[cfg(feature = "swift")]
        self.swift_pool.shutdown();
        #[cfg(feature = "ceph")]
        self.ceph_pool.shutdown();
        self.scheduler.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn params_of(pairs: &[(&str, &str)]) -> Params {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn unknown_names_are_invalid_arguments() {
        let factory = HelperFactory::builder().build();
        let err = factory
            .create("tape-robot", &Params::new(), false)
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        factory.shutdown();
    }

    #[test]
    fn posix_helpers_are_assembled_from_params() {
        let factory = HelperFactory::builder().build();
        let helper = factory
            .create(
                POSIX_HELPER_NAME,
                &params_of(&[("mountPoint", "/tmp"), ("timeout", "750")]),
                false,
            )
            .unwrap();
        assert_eq!(helper.name(), "posix");
        assert_eq!(helper.timeout().as_millis(), 750);
        factory.shutdown();
    }

    #[test]
    fn missing_required_params_fail_assembly() {
        let factory = HelperFactory::builder().build();
        let err = factory
            .create(POSIX_HELPER_NAME, &Params::new(), false)
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        factory.shutdown();
    }

    #[cfg(feature = "s3")]
    #[test]
    fn s3_helpers_keep_their_backend_name_when_buffered() {
        let factory = HelperFactory::builder().build();
        let params = params_of(&[
            ("hostname", "s3.us-west-2.example.com"),
            ("bucketName", "bkt"),
            ("accessKey", "ak"),
            ("secretKey", "sk"),
            ("scheme", "http"),
        ]);
        let plain = factory.create(S3_HELPER_NAME, &params, false).unwrap();
        assert_eq!(plain.name(), "s3");
        let buffered = factory.create(S3_HELPER_NAME, &params, true).unwrap();
        assert_eq!(buffered.name(), "s3");
        factory.shutdown();
    }

    #[cfg(feature = "s3")]
    #[test]
    fn s3_rejects_unsupported_signature_versions() {
        let factory = HelperFactory::builder().build();
        let params = params_of(&[
            ("hostname", "s3.example.com"),
            ("bucketName", "bkt"),
            ("accessKey", "ak"),
            ("secretKey", "sk"),
            ("signatureVersion", "2"),
        ]);
        let err = factory.create(S3_HELPER_NAME, &params, false).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        factory.shutdown();
    }

    #[cfg(feature = "proxy")]
    #[test]
    fn proxy_requires_an_injected_communicator() {
        let factory = HelperFactory::builder().build();
        let err = factory
            .create(
                PROXY_HELPER_NAME,
                &params_of(&[("storageId", "st1")]),
                false,
            )
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        factory.shutdown();
    }

    #[cfg(feature = "proxy")]
    #[test]
    fn proxy_helpers_build_when_a_communicator_is_injected() {
        use crate::proxy::Communicator;

        struct NullCommunicator;

        impl Communicator for NullCommunicator {
            fn send(&self, _message_id: i64, _payload: Vec<u8>) -> Result<(), HelperError> {
                Ok(())
            }
        }

        let factory = HelperFactory::builder()
            .communicator(Arc::new(NullCommunicator))
            .build();
        let helper = factory
            .create(
                PROXY_HELPER_NAME,
                &params_of(&[("storageId", "st1"), ("timeout", "900")]),
                true,
            )
            .unwrap();
        assert_eq!(helper.name(), "proxy");
        assert!(factory.proxy_connection().is_some());
        factory.shutdown();
    }
}
