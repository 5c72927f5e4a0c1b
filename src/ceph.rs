//! Ceph RADOS pool backend.
//!
//! Talks to librados directly; objects in the configured pool are read
//! and written through partial-extent operations, `readdir` enumerates
//! the pool listing, and xattrs map onto RADOS object attributes.
//! librados reports failures as negated errnos, so retry classification
//! reuses the POSIX transient set. The cluster connection is established
//! lazily on first use and torn down when the helper goes away.

use crate::error::{ErrorKind, HelperError};
use crate::exec::{ExecutorPool, OpFuture};
use crate::helper::{
    params, FileHandle, FileId, Mode, NodeKind, OpenFlags, Params, Stat, StorageHelper,
    DEFAULT_OP_TIMEOUT,
};
use crate::retry::{errno_is_transient, retry, RetryPolicy};
use crate::telemetry::{SharedMetricsRegistry, TimerGuard};
use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[allow(non_camel_case_types)]
mod ffi {
    use super::{c_char, c_int, c_void};

    pub type rados_t = *mut c_void;
    pub type rados_ioctx_t = *mut c_void;
    pub type rados_list_ctx_t = *mut c_void;
    pub type rados_xattrs_iter_t = *mut c_void;

    #[link(name = "rados")]
    extern "C" {
        pub fn rados_create2(
            cluster: *mut rados_t,
            cluster_name: *const c_char,
            name: *const c_char,
            flags: u64,
        ) -> c_int;
        pub fn rados_conf_set(
            cluster: rados_t,
            option: *const c_char,
            value: *const c_char,
        ) -> c_int;
        pub fn rados_connect(cluster: rados_t) -> c_int;
        pub fn rados_shutdown(cluster: rados_t);
        pub fn rados_ioctx_create(
            cluster: rados_t,
            pool_name: *const c_char,
            ioctx: *mut rados_ioctx_t,
        ) -> c_int;
        pub fn rados_ioctx_destroy(ioctx: rados_ioctx_t);
        pub fn rados_stat(
            ioctx: rados_ioctx_t,
            oid: *const c_char,
            size: *mut u64,
            mtime: *mut libc::time_t,
        ) -> c_int;
        pub fn rados_read(
            ioctx: rados_ioctx_t,
            oid: *const c_char,
            buf: *mut c_char,
            len: usize,
            off: u64,
        ) -> c_int;
        pub fn rados_write(
            ioctx: rados_ioctx_t,
            oid: *const c_char,
            buf: *const c_char,
            len: usize,
            off: u64,
        ) -> c_int;
        pub fn rados_write_full(
            ioctx: rados_ioctx_t,
            oid: *const c_char,
            buf: *const c_char,
            len: usize,
        ) -> c_int;
        pub fn rados_trunc(ioctx: rados_ioctx_t, oid: *const c_char, size: u64) -> c_int;
        pub fn rados_remove(ioctx: rados_ioctx_t, oid: *const c_char) -> c_int;
        pub fn rados_getxattr(
            ioctx: rados_ioctx_t,
            oid: *const c_char,
            name: *const c_char,
            buf: *mut c_char,
            len: usize,
        ) -> c_int;
        pub fn rados_setxattr(
            ioctx: rados_ioctx_t,
            oid: *const c_char,
            name: *const c_char,
            buf: *const c_char,
            len: usize,
        ) -> c_int;
        pub fn rados_rmxattr(
            ioctx: rados_ioctx_t,
            oid: *const c_char,
            name: *const c_char,
        ) -> c_int;
        pub fn rados_getxattrs(
            ioctx: rados_ioctx_t,
            oid: *const c_char,
            iter: *mut rados_xattrs_iter_t,
        ) -> c_int;
        pub fn rados_getxattrs_next(
            iter: rados_xattrs_iter_t,
            name: *mut *const c_char,
            val: *mut *const c_char,
            len: *mut usize,
        ) -> c_int;
        pub fn rados_getxattrs_end(iter: rados_xattrs_iter_t);
        pub fn rados_nobjects_list_open(
            ioctx: rados_ioctx_t,
            ctx: *mut rados_list_ctx_t,
        ) -> c_int;
        pub fn rados_nobjects_list_next(
            ctx: rados_list_ctx_t,
            entry: *mut *const c_char,
            key: *mut *const c_char,
            nspace: *mut *const c_char,
        ) -> c_int;
        pub fn rados_nobjects_list_close(ctx: rados_list_ctx_t);
    }
}

const XATTR_PROBE_SIZE: usize = 256;
const XATTR_MAX_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct CephConfig {
    pub cluster_name: String,
    pub monitor_hostname: String,
    pub pool_name: String,
    pub username: String,
    pub key: String,
    pub timeout: Duration,
}

impl CephConfig {
    /// Factory parameters: `monitorHostname`, `poolName`, `username`,
    /// `key` (required), `clusterName` (default `ceph`), `timeout` (ms).
    pub fn from_params(params_map: &Params) -> Result<Self, HelperError> {
        Ok(Self {
            cluster_name: params::optional(params_map, "clusterName")
                .unwrap_or_else(|| "ceph".to_string()),
            monitor_hostname: params::required(params_map, "monitorHostname")?,
            pool_name: params::required(params_map, "poolName")?,
            username: params::required(params_map, "username")?,
            key: params::required(params_map, "key")?,
            timeout: params::timeout(params_map, DEFAULT_OP_TIMEOUT)?,
        })
    }
}

struct RadosHandles {
    cluster: ffi::rados_t,
    ioctx: ffi::rados_ioctx_t,
}

// librados handles are documented thread-safe.
unsafe impl Send for RadosHandles {}
unsafe impl Sync for RadosHandles {}

/// Lazily-connected cluster session shared by helper and handles.
struct CephConnection {
    config: CephConfig,
    state: Mutex<Option<Arc<RadosHandles>>>,
}

impl CephConnection {
    fn new(config: CephConfig) -> Self {
        Self {
            config,
            state: Mutex::new(None),
        }
    }

    fn handles(&self) -> Result<Arc<RadosHandles>, HelperError> {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(handles) = state.as_ref() {
            return Ok(handles.clone());
        }
        let handles = Arc::new(self.connect()?);
        *state = Some(handles.clone());
        Ok(handles)
    }

    fn connect(&self) -> Result<RadosHandles, HelperError> {
        let cluster_name = cstring(&self.config.cluster_name)?;
        let client_name = cstring(&format!("client.{}", self.config.username))?;
        let mon_host_key = cstring("mon_host")?;
        let mon_host = cstring(&self.config.monitor_hostname)?;
        let key_key = cstring("key")?;
        let key = cstring(&self.config.key)?;
        let pool = cstring(&self.config.pool_name)?;

        let mut cluster: ffi::rados_t = std::ptr::null_mut();
        check(
            unsafe { ffi::rados_create2(&mut cluster, cluster_name.as_ptr(), client_name.as_ptr(), 0) },
            || "rados_create2".to_string(),
        )?;
        let result = (|| {
            check(
                unsafe { ffi::rados_conf_set(cluster, mon_host_key.as_ptr(), mon_host.as_ptr()) },
                || "set mon_host".to_string(),
            )?;
            check(
                unsafe { ffi::rados_conf_set(cluster, key_key.as_ptr(), key.as_ptr()) },
                || "set client key".to_string(),
            )?;
            check(unsafe { ffi::rados_connect(cluster) }, || {
                format!("connect to cluster {}", self.config.cluster_name)
            })?;
            let mut ioctx: ffi::rados_ioctx_t = std::ptr::null_mut();
            check(
                unsafe { ffi::rados_ioctx_create(cluster, pool.as_ptr(), &mut ioctx) },
                || format!("open pool {}", self.config.pool_name),
            )?;
            Ok(ioctx)
        })();
        match result {
            Ok(ioctx) => Ok(RadosHandles { cluster, ioctx }),
            Err(err) => {
                unsafe { ffi::rados_shutdown(cluster) };
                Err(err)
            }
        }
    }
}

impl Drop for CephConnection {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(handles) = state.take() {
                // Handles are only shared inside this connection, so the
                // last reference goes away with the state slot.
                if let Ok(handles) = Arc::try_unwrap(handles) {
                    unsafe {
                        ffi::rados_ioctx_destroy(handles.ioctx);
                        ffi::rados_shutdown(handles.cluster);
                    }
                }
            }
        }
    }
}

/// Storage helper over one RADOS pool.
pub struct CephHelper {
    connection: Arc<CephConnection>,
    executor: ExecutorPool,
    timeout: Duration,
    retry_policy: RetryPolicy,
    metrics: Option<SharedMetricsRegistry>,
}

#[derive(Clone)]
struct CephCallCtx {
    op: &'static str,
    connection: Arc<CephConnection>,
    retry_policy: RetryPolicy,
    metrics: Option<SharedMetricsRegistry>,
}

impl CephCallCtx {
    fn timer(&self) -> Option<TimerGuard> {
        self.metrics
            .as_ref()
            .map(|metrics| metrics.timer(&format!("ceph.{}", self.op)))
    }

    fn count_retry(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.inc_counter(&format!("ceph.{}.retries", self.op), 1);
        }
    }

    fn count_error(&self, counter: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.inc_counter(counter, 1);
        }
    }

    fn run<T>(
        &self,
        bytes: impl Fn(&T) -> u64,
        mut call: impl FnMut(&RadosHandles) -> Result<T, HelperError>,
    ) -> Result<T, HelperError> {
        let timer = self.timer();
        let result = retry(
            &self.retry_policy,
            errno_is_transient,
            |_| self.count_retry(),
            || {
                let handles = self.connection.handles()?;
                call(&handles)
            },
        );
        if let (Ok(value), Some(timer)) = (&result, timer) {
            timer.stop(bytes(value));
        }
        result
    }
}

impl CephHelper {
    pub fn new(config: CephConfig, executor: ExecutorPool) -> Self {
        let timeout = config.timeout;
        Self {
            connection: Arc::new(CephConnection::new(config)),
            executor,
            timeout,
            retry_policy: RetryPolicy::default(),
            metrics: None,
        }
    }

    pub fn from_params(params_map: &Params, executor: ExecutorPool) -> Result<Self, HelperError> {
        Ok(Self::new(CephConfig::from_params(params_map)?, executor))
    }

    pub fn with_metrics(mut self, metrics: SharedMetricsRegistry) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    fn ctx(&self, op: &'static str) -> CephCallCtx {
        CephCallCtx {
            op,
            connection: self.connection.clone(),
            retry_policy: self.retry_policy.clone(),
            metrics: self.metrics.clone(),
        }
    }

    fn submit<T: Send + 'static>(
        &self,
        task: impl FnOnce() -> Result<T, HelperError> + Send + 'static,
    ) -> OpFuture<T> {
        self.executor.submit(task).with_timeout(self.timeout)
    }
}

impl StorageHelper for CephHelper {
    fn name(&self) -> &'static str {
        "ceph"
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn getattr(&self, file_id: &str) -> OpFuture<Stat> {
        let ctx = self.ctx("getattr");
        let oid = file_id.to_string();
        self.submit(move || {
            ctx.run(
                |_| 0,
                |handles| {
                    let coid = cstring(&oid)?;
                    let mut size = 0u64;
                    let mut mtime: libc::time_t = 0;
                    check(
                        unsafe { ffi::rados_stat(handles.ioctx, coid.as_ptr(), &mut size, &mut mtime) },
                        || format!("stat object {oid}"),
                    )?;
                    let mut stat = Stat::regular(size, 0o644);
                    stat.mtime_sec = mtime as i64;
                    Ok(stat)
                },
            )
        })
    }

    fn access(&self, _file_id: &str, _mask: i32) -> OpFuture<()> {
        OpFuture::ready(Ok(()))
    }

    fn readdir(&self, file_id: &str, offset: usize, count: usize) -> OpFuture<Vec<FileId>> {
        let ctx = self.ctx("readdir");
        let prefix = {
            let trimmed = file_id.trim_matches('/');
            if trimmed.is_empty() {
                String::new()
            } else {
                format!("{trimmed}/")
            }
        };
        self.submit(move || {
            ctx.run(
                |entries: &Vec<FileId>| entries.len() as u64,
                |handles| {
                    let names = list_pool(handles, &prefix)?;
                    Ok(names.into_iter().skip(offset).take(count).collect())
                },
            )
        })
    }

    fn mknod(&self, file_id: &str, _mode: Mode, kind: NodeKind, _rdev: u64) -> OpFuture<()> {
        if kind != NodeKind::Regular {
            return OpFuture::ready(Err(HelperError::not_supported(
                "mknod: RADOS pools hold regular objects only",
            )));
        }
        let ctx = self.ctx("mknod");
        let oid = file_id.to_string();
        self.submit(move || {
            ctx.run(
                |_| 0,
                |handles| {
                    let coid = cstring(&oid)?;
                    check(
                        unsafe {
                            ffi::rados_write_full(
                                handles.ioctx,
                                coid.as_ptr(),
                                b"".as_ptr().cast(),
                                0,
                            )
                        },
                        || format!("create object {oid}"),
                    )
                },
            )
        })
    }

    fn mkdir(&self, _file_id: &str, _mode: Mode) -> OpFuture<()> {
        OpFuture::ready(Ok(()))
    }

    fn unlink(&self, file_id: &str, _current_size: Option<u64>) -> OpFuture<()> {
        let ctx = self.ctx("unlink");
        let oid = file_id.to_string();
        self.submit(move || {
            ctx.run(
                |_| 0,
                |handles| {
                    let coid = cstring(&oid)?;
                    check(unsafe { ffi::rados_remove(handles.ioctx, coid.as_ptr()) }, || {
                        format!("remove object {oid}")
                    })
                },
            )
        })
    }

    fn rmdir(&self, file_id: &str) -> OpFuture<()> {
        let ctx = self.ctx("rmdir");
        let prefix = {
            let trimmed = file_id.trim_matches('/');
            if trimmed.is_empty() {
                String::new()
            } else {
                format!("{trimmed}/")
            }
        };
        self.submit(move || {
            ctx.run(
                |_| 0,
                |handles| {
                    let names = list_pool(handles, &prefix)?;
                    if names.is_empty() {
                        Ok(())
                    } else {
                        Err(HelperError::with_errno(
                            ErrorKind::IoError,
                            libc::ENOTEMPTY,
                            format!("rmdir {prefix}: prefix not empty"),
                        ))
                    }
                },
            )
        })
    }

    fn rename(&self, from: &str, to: &str) -> OpFuture<()> {
        let ctx = self.ctx("rename");
        let from_oid = from.to_string();
        let to_oid = to.to_string();
        self.submit(move || {
            ctx.run(
                |_| 0,
                |handles| {
                    let cfrom = cstring(&from_oid)?;
                    let cto = cstring(&to_oid)?;
                    let mut size = 0u64;
                    let mut mtime: libc::time_t = 0;
                    check(
                        unsafe {
                            ffi::rados_stat(handles.ioctx, cfrom.as_ptr(), &mut size, &mut mtime)
                        },
                        || format!("stat object {from_oid}"),
                    )?;
                    let mut data = vec![0u8; size as usize];
                    let read = unsafe {
                        ffi::rados_read(
                            handles.ioctx,
                            cfrom.as_ptr(),
                            data.as_mut_ptr().cast(),
                            data.len(),
                            0,
                        )
                    };
                    if read < 0 {
                        return Err(rados_error(read, format!("read object {from_oid}")));
                    }
                    data.truncate(read as usize);
                    check(
                        unsafe {
                            ffi::rados_write_full(
                                handles.ioctx,
                                cto.as_ptr(),
                                data.as_ptr().cast(),
                                data.len(),
                            )
                        },
                        || format!("write object {to_oid}"),
                    )?;
                    check(unsafe { ffi::rados_remove(handles.ioctx, cfrom.as_ptr()) }, || {
                        format!("remove object {from_oid}")
                    })
                },
            )
        })
    }

    fn chmod(&self, _file_id: &str, _mode: Mode) -> OpFuture<()> {
        OpFuture::ready(Ok(()))
    }

    fn chown(&self, _file_id: &str, _uid: Option<u32>, _gid: Option<u32>) -> OpFuture<()> {
        OpFuture::ready(Ok(()))
    }

    fn truncate(&self, file_id: &str, size: u64, _current_size: Option<u64>) -> OpFuture<()> {
        let ctx = self.ctx("truncate");
        let oid = file_id.to_string();
        self.submit(move || {
            ctx.run(
                |_| 0,
                |handles| {
                    let coid = cstring(&oid)?;
                    check(
                        unsafe { ffi::rados_trunc(handles.ioctx, coid.as_ptr(), size) },
                        || format!("truncate object {oid}"),
                    )
                },
            )
        })
    }

    fn open(
        &self,
        file_id: &str,
        _flags: OpenFlags,
        _params: &Params,
    ) -> OpFuture<Arc<dyn FileHandle>> {
        let handle: Arc<dyn FileHandle> = Arc::new(CephFileHandle {
            file_id: file_id.to_string(),
            connection: self.connection.clone(),
            executor: self.executor.clone(),
            timeout: self.timeout,
            retry_policy: self.retry_policy.clone(),
            metrics: self.metrics.clone(),
            needs_release: AtomicBool::new(true),
        });
        OpFuture::ready(Ok(handle))
    }

    fn getxattr(&self, file_id: &str, name: &str) -> OpFuture<Vec<u8>> {
        let ctx = self.ctx("getxattr");
        let oid = file_id.to_string();
        let name = name.to_string();
        self.submit(move || {
            ctx.run(
                |value: &Vec<u8>| value.len() as u64,
                |handles| read_xattr(handles, &oid, &name),
            )
        })
    }

    fn setxattr(
        &self,
        file_id: &str,
        name: &str,
        value: &[u8],
        create: bool,
        replace: bool,
    ) -> OpFuture<()> {
        let ctx = self.ctx("setxattr");
        let oid = file_id.to_string();
        let name = name.to_string();
        let value = value.to_vec();
        self.submit(move || {
            ctx.run(
                |_| 0,
                |handles| {
                    // RADOS has no exclusivity flags; emulate them.
                    if create || replace {
                        let exists = read_xattr(handles, &oid, &name).is_ok();
                        if create && exists {
                            return Err(HelperError::with_errno(
                                ErrorKind::AlreadyExists,
                                libc::EEXIST,
                                format!("xattr {name} already set on {oid}"),
                            ));
                        }
                        if replace && !exists {
                            return Err(HelperError::with_errno(
                                ErrorKind::NotFound,
                                libc::ENODATA,
                                format!("xattr {name} not set on {oid}"),
                            ));
                        }
                    }
                    let coid = cstring(&oid)?;
                    let cname = cstring(&name)?;
                    check(
                        unsafe {
                            ffi::rados_setxattr(
                                handles.ioctx,
                                coid.as_ptr(),
                                cname.as_ptr(),
                                value.as_ptr().cast(),
                                value.len(),
                            )
                        },
                        || format!("setxattr {name} on {oid}"),
                    )
                },
            )
        })
    }

    fn removexattr(&self, file_id: &str, name: &str) -> OpFuture<()> {
        let ctx = self.ctx("removexattr");
        let oid = file_id.to_string();
        let name = name.to_string();
        self.submit(move || {
            ctx.run(
                |_| 0,
                |handles| {
                    let coid = cstring(&oid)?;
                    let cname = cstring(&name)?;
                    check(
                        unsafe { ffi::rados_rmxattr(handles.ioctx, coid.as_ptr(), cname.as_ptr()) },
                        || format!("removexattr {name} on {oid}"),
                    )
                },
            )
        })
    }

    fn listxattr(&self, file_id: &str) -> OpFuture<Vec<String>> {
        let ctx = self.ctx("listxattr");
        let oid = file_id.to_string();
        self.submit(move || {
            ctx.run(
                |names: &Vec<String>| names.len() as u64,
                |handles| {
                    let coid = cstring(&oid)?;
                    let mut iter: ffi::rados_xattrs_iter_t = std::ptr::null_mut();
                    check(
                        unsafe { ffi::rados_getxattrs(handles.ioctx, coid.as_ptr(), &mut iter) },
                        || format!("open xattr iterator for {oid}"),
                    )?;
                    let mut names = Vec::new();
                    loop {
                        let mut name: *const c_char = std::ptr::null();
                        let mut value: *const c_char = std::ptr::null();
                        let mut len = 0usize;
                        let ret = unsafe {
                            ffi::rados_getxattrs_next(iter, &mut name, &mut value, &mut len)
                        };
                        if ret < 0 {
                            unsafe { ffi::rados_getxattrs_end(iter) };
                            return Err(rados_error(ret, format!("iterate xattrs of {oid}")));
                        }
                        if name.is_null() {
                            break;
                        }
                        let owned = unsafe { CStr::from_ptr(name) }
                            .to_string_lossy()
                            .into_owned();
                        names.push(owned);
                    }
                    unsafe { ffi::rados_getxattrs_end(iter) };
                    Ok(names)
                },
            )
        })
    }
}

/// Handle over one RADOS object; the key doubles as the backend token.
pub struct CephFileHandle {
    file_id: String,
    connection: Arc<CephConnection>,
    executor: ExecutorPool,
    timeout: Duration,
    retry_policy: RetryPolicy,
    metrics: Option<SharedMetricsRegistry>,
    needs_release: AtomicBool,
}

impl CephFileHandle {
    fn ctx(&self, op: &'static str) -> CephCallCtx {
        CephCallCtx {
            op,
            connection: self.connection.clone(),
            retry_policy: self.retry_policy.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl FileHandle for CephFileHandle {
    fn file_id(&self) -> &str {
        &self.file_id
    }

    fn read(&self, offset: u64, size: usize) -> OpFuture<Vec<u8>> {
        let ctx = self.ctx("read");
        let oid = self.file_id.clone();
        self.executor
            .submit(move || {
                let result = ctx.run(
                    |data: &Vec<u8>| data.len() as u64,
                    |handles| {
                        let coid = cstring(&oid)?;
                        let mut buf = vec![0u8; size];
                        let ret = unsafe {
                            ffi::rados_read(
                                handles.ioctx,
                                coid.as_ptr(),
                                buf.as_mut_ptr().cast(),
                                size,
                                offset,
                            )
                        };
                        if ret < 0 {
                            return Err(rados_error(ret, format!("read object {oid}")));
                        }
                        buf.truncate(ret as usize);
                        Ok(buf)
                    },
                );
                if result.is_err() {
                    ctx.count_error("ceph.errors.read");
                }
                result
            })
            .with_timeout(self.timeout)
    }

    fn write(&self, offset: u64, data: Vec<u8>) -> OpFuture<usize> {
        let ctx = self.ctx("write");
        let oid = self.file_id.clone();
        self.executor
            .submit(move || {
                let result = ctx.run(
                    |written: &usize| *written as u64,
                    |handles| {
                        let coid = cstring(&oid)?;
                        check(
                            unsafe {
                                ffi::rados_write(
                                    handles.ioctx,
                                    coid.as_ptr(),
                                    data.as_ptr().cast(),
                                    data.len(),
                                    offset,
                                )
                            },
                            || format!("write object {oid}"),
                        )?;
                        Ok(data.len())
                    },
                );
                if result.is_err() {
                    ctx.count_error("ceph.errors.write");
                }
                result
            })
            .with_timeout(self.timeout)
    }

    fn release(&self) -> OpFuture<()> {
        self.needs_release.swap(false, Ordering::AcqRel);
        OpFuture::ready(Ok(()))
    }
}

fn list_pool(handles: &RadosHandles, prefix: &str) -> Result<Vec<String>, HelperError> {
    let mut ctx: ffi::rados_list_ctx_t = std::ptr::null_mut();
    check(
        unsafe { ffi::rados_nobjects_list_open(handles.ioctx, &mut ctx) },
        || "open pool listing".to_string(),
    )?;
    let mut names = Vec::new();
    loop {
        let mut entry: *const c_char = std::ptr::null();
        let ret = unsafe {
            ffi::rados_nobjects_list_next(
                ctx,
                &mut entry,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        };
        if ret == -libc::ENOENT {
            break;
        }
        if ret < 0 {
            unsafe { ffi::rados_nobjects_list_close(ctx) };
            return Err(rados_error(ret, "iterate pool listing".to_string()));
        }
        if entry.is_null() {
            continue;
        }
        let name = unsafe { CStr::from_ptr(entry) }.to_string_lossy().into_owned();
        if let Some(relative) = name.strip_prefix(prefix) {
            if !relative.is_empty() {
                names.push(relative.to_string());
            }
        }
    }
    unsafe { ffi::rados_nobjects_list_close(ctx) };
    Ok(names)
}

fn read_xattr(handles: &RadosHandles, oid: &str, name: &str) -> Result<Vec<u8>, HelperError> {
    let coid = cstring(oid)?;
    let cname = cstring(name)?;
    let mut buf = vec![0u8; XATTR_PROBE_SIZE];
    let mut ret = unsafe {
        ffi::rados_getxattr(
            handles.ioctx,
            coid.as_ptr(),
            cname.as_ptr(),
            buf.as_mut_ptr().cast(),
            buf.len(),
        )
    };
    if ret == -libc::ERANGE {
        buf = vec![0u8; XATTR_MAX_SIZE];
        ret = unsafe {
            ffi::rados_getxattr(
                handles.ioctx,
                coid.as_ptr(),
                cname.as_ptr(),
                buf.as_mut_ptr().cast(),
                buf.len(),
            )
        };
    }
    if ret < 0 {
        return Err(rados_error(ret, format!("getxattr {name} on {oid}")));
    }
    buf.truncate(ret as usize);
    Ok(buf)
}

fn cstring(value: &str) -> Result<CString, HelperError> {
    CString::new(value)
        .map_err(|_| HelperError::invalid_argument(format!("value `{value}` contains NUL")))
}

fn rados_error(ret: c_int, context: String) -> HelperError {
    HelperError::from_errno(-ret, context)
}

fn check(ret: c_int, context: impl FnOnce() -> String) -> Result<(), HelperError> {
    if ret < 0 {
        Err(rados_error(ret, context()))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_cluster_name() {
        let mut params_map = Params::new();
        params_map.insert("monitorHostname".into(), "mon1.local".into());
        params_map.insert("poolName".into(), "data".into());
        params_map.insert("username".into(), "admin".into());
        params_map.insert("key".into(), "secret".into());
        let config = CephConfig::from_params(&params_map).unwrap();
        assert_eq!(config.cluster_name, "ceph");
        assert_eq!(config.timeout, DEFAULT_OP_TIMEOUT);
    }

    #[test]
    fn negative_returns_are_negated_errnos() {
        let err = rados_error(-libc::ENOENT, "stat object x".to_string());
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.errno(), Some(libc::ENOENT));
    }
}
