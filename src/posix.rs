//! Local-filesystem backend.
//!
//! Every syscall runs on the helper's executor inside a filesystem
//! identity scope: the worker thread adopts the configured uid/gid
//! before touching the kernel and restores the previous identity on
//! every exit path, so access checks are enforced on behalf of the
//! logical user. The scope is validated after switching; a failed
//! adoption surfaces `PermissionDenied` without issuing the syscall.

use crate::error::{ErrorKind, HelperError};
use crate::exec::{ExecutorPool, OpFuture};
use crate::helper::{
    params, FileHandle, FileId, Mode, NodeKind, OpenFlags, Params, Stat, StorageHelper,
    DEFAULT_OP_TIMEOUT,
};
use crate::retry::{errno_is_transient, retry, RetryPolicy};
use crate::telemetry::{SharedMetricsRegistry, TimerGuard};
use log::warn;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Identity value meaning "keep the caller's id", POSIX `-1`.
pub const KEEP_ID: u32 = u32::MAX;

const DEFAULT_CREATE_MODE: Mode = 0o644;
/// Upper bound per write syscall; large buffers go out as a sequence of
/// bounded chunks and the byte total is the sum of the successful ones.
const MAX_WRITE_CHUNK: usize = 8 << 20;
#[cfg(target_os = "linux")]
const XATTR_PROBE_SIZE: usize = 256;
#[cfg(target_os = "linux")]
const XATTR_MAX_SIZE: usize = 64 * 1024;

/// Scoped filesystem identity. Restores the previous uid/gid on drop,
/// including the error and panic paths.
pub struct FsIdentityGuard {
    prev_uid: libc::uid_t,
    prev_gid: libc::gid_t,
}

#[cfg(target_os = "linux")]
impl FsIdentityGuard {
    pub fn adopt(uid: u32, gid: u32) -> Result<Self, HelperError> {
        let guard = unsafe {
            Self {
                prev_uid: libc::setfsuid(uid) as libc::uid_t,
                prev_gid: libc::setfsgid(gid) as libc::gid_t,
            }
        };
        // setfsuid(-1) reports the current value without changing it.
        let current_uid = unsafe { libc::setfsuid(KEEP_ID) } as u32;
        let current_gid = unsafe { libc::setfsgid(KEEP_ID) } as u32;
        let valid = (uid == KEEP_ID || current_uid == uid) && (gid == KEEP_ID || current_gid == gid);
        if valid {
            Ok(guard)
        } else {
            // Guard drops here and restores whatever was adopted.
            Err(HelperError::new(
                ErrorKind::PermissionDenied,
                format!("failed to adopt filesystem identity uid={uid} gid={gid}"),
            ))
        }
    }
}

#[cfg(target_os = "linux")]
impl Drop for FsIdentityGuard {
    fn drop(&mut self) {
        unsafe {
            libc::setfsuid(self.prev_uid);
            libc::setfsgid(self.prev_gid);
        }
    }
}

#[cfg(not(target_os = "linux"))]
impl FsIdentityGuard {
    pub fn adopt(uid: u32, gid: u32) -> Result<Self, HelperError> {
        let guard = unsafe {
            Self {
                prev_uid: libc::geteuid(),
                prev_gid: libc::getegid(),
            }
        };
        let gid_ok = gid == KEEP_ID || unsafe { libc::setegid(gid) } == 0;
        let uid_ok = uid == KEEP_ID || unsafe { libc::seteuid(uid) } == 0;
        if uid_ok && gid_ok {
            Ok(guard)
        } else {
            Err(HelperError::new(
                ErrorKind::PermissionDenied,
                format!("failed to adopt effective identity uid={uid} gid={gid}"),
            ))
        }
    }
}

#[cfg(not(target_os = "linux"))]
impl Drop for FsIdentityGuard {
    fn drop(&mut self) {
        unsafe {
            libc::seteuid(self.prev_uid);
            libc::setegid(self.prev_gid);
        }
    }
}

/// Configuration of a [`PosixHelper`].
#[derive(Debug, Clone)]
pub struct PosixHelperConfig {
    pub mount_point: PathBuf,
    pub uid: u32,
    pub gid: u32,
    pub timeout: Duration,
}

impl Default for PosixHelperConfig {
    fn default() -> Self {
        Self {
            mount_point: PathBuf::from("/"),
            uid: KEEP_ID,
            gid: KEEP_ID,
            timeout: DEFAULT_OP_TIMEOUT,
        }
    }
}

/// Storage helper backed by local syscalls under a mount root.
pub struct PosixHelper {
    config: PosixHelperConfig,
    executor: ExecutorPool,
    retry_policy: RetryPolicy,
    metrics: Option<SharedMetricsRegistry>,
}

/// Per-call context cloned into the worker closure: identity, retry
/// budget and metric sinks for one named operation.
#[derive(Clone)]
struct SyscallCtx {
    op: &'static str,
    uid: u32,
    gid: u32,
    retry_policy: RetryPolicy,
    metrics: Option<SharedMetricsRegistry>,
}

impl SyscallCtx {
    fn timer(&self) -> Option<TimerGuard> {
        self.metrics
            .as_ref()
            .map(|metrics| metrics.timer(&format!("posix.{}", self.op)))
    }

    fn count_retry(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.inc_counter(&format!("posix.{}.retries", self.op), 1);
        }
    }

    fn count_error(&self, counter: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.inc_counter(counter, 1);
        }
    }

    /// One identity-scoped syscall attempt with transient-errno retry.
    fn syscall<T>(&self, mut call: impl FnMut() -> Result<T, HelperError>) -> Result<T, HelperError> {
        retry(
            &self.retry_policy,
            errno_is_transient,
            |_| self.count_retry(),
            || {
                let _identity = FsIdentityGuard::adopt(self.uid, self.gid)?;
                call()
            },
        )
    }

    /// Timed wrapper for single-syscall operations.
    fn run<T>(
        &self,
        bytes: impl Fn(&T) -> u64,
        call: impl FnMut() -> Result<T, HelperError>,
    ) -> Result<T, HelperError> {
        let timer = self.timer();
        let result = self.syscall(call);
        if let (Ok(value), Some(timer)) = (&result, timer) {
            timer.stop(bytes(value));
        }
        result
    }
}

impl PosixHelper {
    pub fn new(config: PosixHelperConfig, executor: ExecutorPool) -> Self {
        Self {
            config,
            executor,
            retry_policy: RetryPolicy::default(),
            metrics: None,
        }
    }

    /// Builds a helper from factory parameters: `mountPoint` (required),
    /// `uid`, `gid` (default: keep caller identity), `timeout` (ms).
    pub fn from_params(params_map: &Params, executor: ExecutorPool) -> Result<Self, HelperError> {
        let config = PosixHelperConfig {
            mount_point: PathBuf::from(params::required(params_map, "mountPoint")?),
            uid: params::parsed_or(params_map, "uid", KEEP_ID)?,
            gid: params::parsed_or(params_map, "gid", KEEP_ID)?,
            timeout: params::timeout(params_map, DEFAULT_OP_TIMEOUT)?,
        };
        Ok(Self::new(config, executor))
    }

    pub fn with_metrics(mut self, metrics: SharedMetricsRegistry) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// FileId joined under the mount root; no traversal normalization,
    /// the caller is trusted.
    fn root(&self, file_id: &str) -> PathBuf {
        self.config.mount_point.join(file_id.trim_start_matches('/'))
    }

    fn ctx(&self, op: &'static str) -> SyscallCtx {
        SyscallCtx {
            op,
            uid: self.config.uid,
            gid: self.config.gid,
            retry_policy: self.retry_policy.clone(),
            metrics: self.metrics.clone(),
        }
    }

    fn submit<T: Send + 'static>(
        &self,
        task: impl FnOnce() -> Result<T, HelperError> + Send + 'static,
    ) -> OpFuture<T> {
        self.executor.submit(task).with_timeout(self.config.timeout)
    }
}

impl StorageHelper for PosixHelper {
    fn name(&self) -> &'static str {
        "posix"
    }

    fn timeout(&self) -> Duration {
        self.config.timeout
    }

    fn getattr(&self, file_id: &str) -> OpFuture<Stat> {
        let ctx = self.ctx("getattr");
        let path = self.root(file_id);
        self.submit(move || {
            ctx.run(
                |_| 0,
                || {
                    let cpath = cpath(&path)?;
                    let mut raw: libc::stat = unsafe { std::mem::zeroed() };
                    check_ret(unsafe { libc::lstat(cpath.as_ptr(), &mut raw) }, || {
                        format!("lstat {}", path.display())
                    })?;
                    Ok(stat_from_raw(&raw))
                },
            )
        })
    }

    fn access(&self, file_id: &str, mask: i32) -> OpFuture<()> {
        let ctx = self.ctx("access");
        let path = self.root(file_id);
        self.submit(move || {
            ctx.run(
                |_| 0,
                || {
                    let cpath = cpath(&path)?;
                    check_ret(unsafe { libc::access(cpath.as_ptr(), mask) }, || {
                        format!("access {}", path.display())
                    })
                },
            )
        })
    }

    fn readdir(&self, file_id: &str, offset: usize, count: usize) -> OpFuture<Vec<FileId>> {
        let ctx = self.ctx("readdir");
        let path = self.root(file_id);
        self.submit(move || {
            ctx.run(
                |entries: &Vec<FileId>| entries.len() as u64,
                || {
                    let mut entries = Vec::new();
                    let mut to_skip = offset;
                    let dir = std::fs::read_dir(&path)
                        .map_err(|err| HelperError::from_io(&err, format!("opendir {}", path.display())))?;
                    for entry in dir {
                        if entries.len() == count {
                            break;
                        }
                        let entry = entry.map_err(|err| {
                            HelperError::from_io(&err, format!("readdir {}", path.display()))
                        })?;
                        // `read_dir` already omits `.` and `..`.
                        if to_skip > 0 {
                            to_skip -= 1;
                            continue;
                        }
                        entries.push(entry.file_name().to_string_lossy().into_owned());
                    }
                    Ok(entries)
                },
            )
        })
    }

    fn readlink(&self, file_id: &str) -> OpFuture<FileId> {
        let ctx = self.ctx("readlink");
        let path = self.root(file_id);
        let mount_point = self.config.mount_point.clone();
        self.submit(move || {
            ctx.run(
                |_| 0,
                || {
                    let target = std::fs::read_link(&path).map_err(|err| {
                        HelperError::from_io(&err, format!("readlink {}", path.display()))
                    })?;
                    // Targets under the mount root come back as FileIds.
                    let target = match target.strip_prefix(&mount_point) {
                        Ok(relative) => relative.to_path_buf(),
                        Err(_) => target,
                    };
                    Ok(target.to_string_lossy().into_owned())
                },
            )
        })
    }

    fn mknod(&self, file_id: &str, mode: Mode, kind: NodeKind, rdev: u64) -> OpFuture<()> {
        let ctx = self.ctx("mknod");
        let path = self.root(file_id);
        self.submit(move || {
            ctx.run(
                |_| 0,
                || {
                    let cpath = cpath(&path)?;
                    let mode = mode & 0o7777;
                    match kind {
                        NodeKind::Regular => {
                            // More portable than mknod(2) for plain files.
                            let fd = unsafe {
                                libc::open(
                                    cpath.as_ptr(),
                                    libc::O_CREAT | libc::O_EXCL | libc::O_WRONLY,
                                    mode as libc::c_uint,
                                )
                            };
                            check_ret(fd, || format!("create {}", path.display()))?;
                            check_ret(unsafe { libc::close(fd) }, || {
                                format!("close {}", path.display())
                            })
                        }
                        NodeKind::Fifo => check_ret(
                            unsafe { libc::mkfifo(cpath.as_ptr(), mode as libc::mode_t) },
                            || format!("mkfifo {}", path.display()),
                        ),
                        NodeKind::CharDevice | NodeKind::BlockDevice => {
                            let type_bits = if kind == NodeKind::CharDevice {
                                libc::S_IFCHR
                            } else {
                                libc::S_IFBLK
                            };
                            check_ret(
                                unsafe {
                                    libc::mknod(
                                        cpath.as_ptr(),
                                        type_bits | mode as libc::mode_t,
                                        rdev as libc::dev_t,
                                    )
                                },
                                || format!("mknod {}", path.display()),
                            )
                        }
                    }
                },
            )
        })
    }

    fn mkdir(&self, file_id: &str, mode: Mode) -> OpFuture<()> {
        let ctx = self.ctx("mkdir");
        let path = self.root(file_id);
        self.submit(move || {
            ctx.run(
                |_| 0,
                || {
                    let cpath = cpath(&path)?;
                    check_ret(
                        unsafe { libc::mkdir(cpath.as_ptr(), (mode & 0o7777) as libc::mode_t) },
                        || format!("mkdir {}", path.display()),
                    )
                },
            )
        })
    }

    fn unlink(&self, file_id: &str, _current_size: Option<u64>) -> OpFuture<()> {
        let ctx = self.ctx("unlink");
        let path = self.root(file_id);
        self.submit(move || {
            ctx.run(
                |_| 0,
                || {
                    let cpath = cpath(&path)?;
                    check_ret(unsafe { libc::unlink(cpath.as_ptr()) }, || {
                        format!("unlink {}", path.display())
                    })
                },
            )
        })
    }

    fn rmdir(&self, file_id: &str) -> OpFuture<()> {
        let ctx = self.ctx("rmdir");
        let path = self.root(file_id);
        self.submit(move || {
            ctx.run(
                |_| 0,
                || {
                    let cpath = cpath(&path)?;
                    check_ret(unsafe { libc::rmdir(cpath.as_ptr()) }, || {
                        format!("rmdir {}", path.display())
                    })
                },
            )
        })
    }

    fn symlink(&self, from: &str, to: &str) -> OpFuture<()> {
        let ctx = self.ctx("symlink");
        let from = self.root(from);
        let to = self.root(to);
        self.submit(move || {
            ctx.run(
                |_| 0,
                || {
                    let cfrom = cpath(&from)?;
                    let cto = cpath(&to)?;
                    check_ret(unsafe { libc::symlink(cfrom.as_ptr(), cto.as_ptr()) }, || {
                        format!("symlink {} -> {}", to.display(), from.display())
                    })
                },
            )
        })
    }

    fn link(&self, from: &str, to: &str) -> OpFuture<()> {
        let ctx = self.ctx("link");
        let from = self.root(from);
        let to = self.root(to);
        self.submit(move || {
            ctx.run(
                |_| 0,
                || {
                    let cfrom = cpath(&from)?;
                    let cto = cpath(&to)?;
                    check_ret(unsafe { libc::link(cfrom.as_ptr(), cto.as_ptr()) }, || {
                        format!("link {} -> {}", to.display(), from.display())
                    })
                },
            )
        })
    }

    fn rename(&self, from: &str, to: &str) -> OpFuture<()> {
        let ctx = self.ctx("rename");
        let from = self.root(from);
        let to = self.root(to);
        self.submit(move || {
            ctx.run(
                |_| 0,
                || {
                    let cfrom = cpath(&from)?;
                    let cto = cpath(&to)?;
                    check_ret(unsafe { libc::rename(cfrom.as_ptr(), cto.as_ptr()) }, || {
                        format!("rename {} -> {}", from.display(), to.display())
                    })
                },
            )
        })
    }

    fn chmod(&self, file_id: &str, mode: Mode) -> OpFuture<()> {
        let ctx = self.ctx("chmod");
        let path = self.root(file_id);
        self.submit(move || {
            ctx.run(
                |_| 0,
                || {
                    let cpath = cpath(&path)?;
                    check_ret(
                        unsafe { libc::chmod(cpath.as_ptr(), (mode & 0o7777) as libc::mode_t) },
                        || format!("chmod {}", path.display()),
                    )
                },
            )
        })
    }

    fn chown(&self, file_id: &str, uid: Option<u32>, gid: Option<u32>) -> OpFuture<()> {
        let ctx = self.ctx("chown");
        let path = self.root(file_id);
        self.submit(move || {
            ctx.run(
                |_| 0,
                || {
                    let cpath = cpath(&path)?;
                    check_ret(
                        unsafe {
                            libc::chown(
                                cpath.as_ptr(),
                                uid.unwrap_or(KEEP_ID) as libc::uid_t,
                                gid.unwrap_or(KEEP_ID) as libc::gid_t,
                            )
                        },
                        || format!("chown {}", path.display()),
                    )
                },
            )
        })
    }

    fn truncate(&self, file_id: &str, size: u64, _current_size: Option<u64>) -> OpFuture<()> {
        let ctx = self.ctx("truncate");
        let path = self.root(file_id);
        self.submit(move || {
            ctx.run(
                |_| 0,
                || {
                    let cpath = cpath(&path)?;
                    check_ret(
                        unsafe { libc::truncate(cpath.as_ptr(), size as libc::off_t) },
                        || format!("truncate {}", path.display()),
                    )
                },
            )
        })
    }

    fn open(
        &self,
        file_id: &str,
        flags: OpenFlags,
        _params: &Params,
    ) -> OpFuture<Arc<dyn FileHandle>> {
        let ctx = self.ctx("open");
        let path = self.root(file_id);
        let file_id = file_id.to_string();
        let executor = self.executor.clone();
        let retry_policy = self.retry_policy.clone();
        let metrics = self.metrics.clone();
        let timeout = self.config.timeout;
        let (uid, gid) = (self.config.uid, self.config.gid);
        self.submit(move || {
            let fd = ctx.run(
                |_| 0,
                || {
                    let cpath = cpath(&path)?;
                    let fd = unsafe {
                        libc::open(
                            cpath.as_ptr(),
                            flags.to_posix(),
                            DEFAULT_CREATE_MODE as libc::c_uint,
                        )
                    };
                    check_ret(fd, || format!("open {}", path.display()))?;
                    Ok(fd)
                },
            )?;
            let handle: Arc<dyn FileHandle> = Arc::new(PosixFileHandle {
                file_id,
                fd,
                uid,
                gid,
                executor,
                timeout,
                retry_policy,
                metrics,
                needs_release: AtomicBool::new(true),
            });
            Ok(handle)
        })
    }

    #[cfg(target_os = "linux")]
    fn getxattr(&self, file_id: &str, name: &str) -> OpFuture<Vec<u8>> {
        let ctx = self.ctx("getxattr");
        let path = self.root(file_id);
        let name = name.to_string();
        self.submit(move || {
            ctx.run(
                |value: &Vec<u8>| value.len() as u64,
                || {
                    let cpath = cpath(&path)?;
                    let cname = cstring(&name)?;
                    let mut buf = vec![0u8; XATTR_PROBE_SIZE];
                    let mut res = unsafe {
                        libc::getxattr(
                            cpath.as_ptr(),
                            cname.as_ptr(),
                            buf.as_mut_ptr().cast(),
                            buf.len(),
                        )
                    };
                    if res < 0 && last_errno() == libc::ERANGE {
                        buf = vec![0u8; XATTR_MAX_SIZE];
                        res = unsafe {
                            libc::getxattr(
                                cpath.as_ptr(),
                                cname.as_ptr(),
                                buf.as_mut_ptr().cast(),
                                buf.len(),
                            )
                        };
                    }
                    let len = check_size(res, || format!("getxattr {} {}", path.display(), name))?;
                    buf.truncate(len);
                    Ok(buf)
                },
            )
        })
    }

    #[cfg(target_os = "linux")]
    fn setxattr(
        &self,
        file_id: &str,
        name: &str,
        value: &[u8],
        create: bool,
        replace: bool,
    ) -> OpFuture<()> {
        let ctx = self.ctx("setxattr");
        let path = self.root(file_id);
        let name = name.to_string();
        let value = value.to_vec();
        self.submit(move || {
            ctx.run(
                |_| 0,
                || {
                    let cpath = cpath(&path)?;
                    let cname = cstring(&name)?;
                    let flags = if create {
                        libc::XATTR_CREATE
                    } else if replace {
                        libc::XATTR_REPLACE
                    } else {
                        0
                    };
                    check_ret(
                        unsafe {
                            libc::setxattr(
                                cpath.as_ptr(),
                                cname.as_ptr(),
                                value.as_ptr().cast(),
                                value.len(),
                                flags,
                            )
                        },
                        || format!("setxattr {} {}", path.display(), name),
                    )
                },
            )
        })
    }

    #[cfg(target_os = "linux")]
    fn removexattr(&self, file_id: &str, name: &str) -> OpFuture<()> {
        let ctx = self.ctx("removexattr");
        let path = self.root(file_id);
        let name = name.to_string();
        self.submit(move || {
            ctx.run(
                |_| 0,
                || {
                    let cpath = cpath(&path)?;
                    let cname = cstring(&name)?;
                    check_ret(
                        unsafe { libc::removexattr(cpath.as_ptr(), cname.as_ptr()) },
                        || format!("removexattr {} {}", path.display(), name),
                    )
                },
            )
        })
    }

    #[cfg(target_os = "linux")]
    fn listxattr(&self, file_id: &str) -> OpFuture<Vec<String>> {
        let ctx = self.ctx("listxattr");
        let path = self.root(file_id);
        self.submit(move || {
            ctx.run(
                |names: &Vec<String>| names.len() as u64,
                || {
                    let cpath = cpath(&path)?;
                    let mut buf = vec![0u8; 4096];
                    let mut res = unsafe {
                        libc::listxattr(cpath.as_ptr(), buf.as_mut_ptr().cast(), buf.len())
                    };
                    if res < 0 && last_errno() == libc::ERANGE {
                        buf = vec![0u8; XATTR_MAX_SIZE];
                        res = unsafe {
                            libc::listxattr(cpath.as_ptr(), buf.as_mut_ptr().cast(), buf.len())
                        };
                    }
                    let len = check_size(res, || format!("listxattr {}", path.display()))?;
                    buf.truncate(len);
                    Ok(buf
                        .split(|byte| *byte == 0)
                        .filter(|segment| !segment.is_empty())
                        .map(|segment| String::from_utf8_lossy(segment).into_owned())
                        .collect())
                },
            )
        })
    }
}

/// Handle over a raw descriptor. Exactly one close is attempted: either
/// through [`FileHandle::release`] or, for handles dropped without one,
/// from the destructor under the same identity scope.
pub struct PosixFileHandle {
    file_id: String,
    fd: libc::c_int,
    uid: u32,
    gid: u32,
    executor: ExecutorPool,
    timeout: Duration,
    retry_policy: RetryPolicy,
    metrics: Option<SharedMetricsRegistry>,
    needs_release: AtomicBool,
}

impl PosixFileHandle {
    fn ctx(&self, op: &'static str) -> SyscallCtx {
        SyscallCtx {
            op,
            uid: self.uid,
            gid: self.gid,
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

impl FileHandle for PosixFileHandle {
    fn file_id(&self) -> &str {
        &self.file_id
    }

    fn read(&self, offset: u64, size: usize) -> OpFuture<Vec<u8>> {
        let ctx = self.ctx("read");
        let fd = self.fd;
        self.submit(move || {
            let timer = ctx.timer();
            let result = ctx.syscall(|| {
                let mut buf = vec![0u8; size];
                let res = unsafe {
                    libc::pread(fd, buf.as_mut_ptr().cast(), size, offset as libc::off_t)
                };
                let read = check_size(res, || format!("pread fd {fd} offset {offset}"))?;
                buf.truncate(read);
                Ok(buf)
            });
            match &result {
                Ok(buf) => {
                    if let Some(timer) = timer {
                        timer.stop(buf.len() as u64);
                    }
                }
                Err(_) => ctx.count_error("posix.errors.read"),
            }
            result
        })
    }

    fn write(&self, offset: u64, data: Vec<u8>) -> OpFuture<usize> {
        let ctx = self.ctx("write");
        let fd = self.fd;
        self.submit(move || {
            let timer = ctx.timer();
            let result = write_chunked(&ctx, fd, offset, &data);
            match &result {
                Ok(written) => {
                    if let Some(timer) = timer {
                        timer.stop(*written as u64);
                    }
                }
                Err(_) => ctx.count_error("posix.errors.write"),
            }
            result
        })
    }

    fn flush(&self) -> OpFuture<()> {
        let ctx = self.ctx("flush");
        self.submit(move || {
            // Validates the identity scope; the kernel flushes on close.
            let _identity = FsIdentityGuard::adopt(ctx.uid, ctx.gid)?;
            Ok(())
        })
    }

    fn fsync(&self, data_only: bool) -> OpFuture<()> {
        let ctx = self.ctx("fsync");
        let fd = self.fd;
        self.submit(move || {
            ctx.run(
                |_| 0,
                || check_ret(sync_fd(fd, data_only), || format!("fsync fd {fd}")),
            )
        })
    }

    fn release(&self) -> OpFuture<()> {
        if !self.needs_release.swap(false, Ordering::AcqRel) {
            return OpFuture::ready(Ok(()));
        }
        let ctx = self.ctx("release");
        let fd = self.fd;
        self.submit(move || {
            ctx.run(
                |_| 0,
                || check_ret(unsafe { libc::close(fd) }, || format!("close fd {fd}")),
            )
        })
    }
}

impl Drop for PosixFileHandle {
    fn drop(&mut self) {
        if self.needs_release.swap(false, Ordering::AcqRel) {
            match FsIdentityGuard::adopt(self.uid, self.gid) {
                Ok(_identity) => {
                    if unsafe { libc::close(self.fd) } == -1 {
                        warn!(
                            "failed to release descriptor {} for {}: {}",
                            self.fd,
                            self.file_id,
                            std::io::Error::last_os_error()
                        );
                    }
                }
                Err(err) => {
                    warn!(
                        "failed to release descriptor {} for {}: {}",
                        self.fd, self.file_id, err
                    );
                }
            }
        }
    }
}

#[cfg(target_os = "linux")]
fn sync_fd(fd: libc::c_int, data_only: bool) -> libc::c_int {
    unsafe {
        if data_only {
            libc::fdatasync(fd)
        } else {
            libc::fsync(fd)
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn sync_fd(fd: libc::c_int, _data_only: bool) -> libc::c_int {
    unsafe { libc::fsync(fd) }
}

fn write_chunked(
    ctx: &SyscallCtx,
    fd: libc::c_int,
    offset: u64,
    data: &[u8],
) -> Result<usize, HelperError> {
    let mut written = 0usize;
    while written < data.len() {
        let chunk = &data[written..data.len().min(written + MAX_WRITE_CHUNK)];
        let chunk_offset = offset + written as u64;
        let wrote = ctx.syscall(|| {
            let res = unsafe {
                libc::pwrite(
                    fd,
                    chunk.as_ptr().cast(),
                    chunk.len(),
                    chunk_offset as libc::off_t,
                )
            };
            check_size(res, || format!("pwrite fd {fd} offset {chunk_offset}"))
        })?;
        if wrote == 0 {
            break;
        }
        written += wrote;
    }
    Ok(written)
}

fn cpath(path: &Path) -> Result<CString, HelperError> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| HelperError::invalid_argument(format!("path {} contains NUL", path.display())))
}

fn cstring(value: &str) -> Result<CString, HelperError> {
    CString::new(value)
        .map_err(|_| HelperError::invalid_argument(format!("value `{value}` contains NUL")))
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
}

fn check_ret(ret: libc::c_int, context: impl FnOnce() -> String) -> Result<(), HelperError> {
    if ret < 0 {
        Err(HelperError::from_errno(last_errno(), context()))
    } else {
        Ok(())
    }
}

fn check_size(ret: libc::ssize_t, context: impl FnOnce() -> String) -> Result<usize, HelperError> {
    if ret < 0 {
        Err(HelperError::from_errno(last_errno(), context()))
    } else {
        Ok(ret as usize)
    }
}

fn stat_from_raw(raw: &libc::stat) -> Stat {
    Stat {
        dev: raw.st_dev as u64,
        ino: raw.st_ino as u64,
        mode: raw.st_mode as u32,
        nlink: raw.st_nlink as u64,
        uid: raw.st_uid,
        gid: raw.st_gid,
        rdev: raw.st_rdev as u64,
        size: raw.st_size as u64,
        blocks: raw.st_blocks as u64,
        atime_sec: raw.st_atime as i64,
        atime_nsec: raw.st_atime_nsec as i64,
        mtime_sec: raw.st_mtime as i64,
        mtime_nsec: raw.st_mtime_nsec as i64,
        ctime_sec: raw.st_ctime as i64,
        ctime_nsec: raw.st_ctime_nsec as i64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeping_the_caller_identity_is_always_valid() {
        let guard = FsIdentityGuard::adopt(KEEP_ID, KEEP_ID);
        assert!(guard.is_ok());
    }

    #[test]
    fn file_ids_join_under_the_mount_root() {
        let pool = ExecutorPool::new("posix-test", 1);
        let helper = PosixHelper::new(
            PosixHelperConfig {
                mount_point: PathBuf::from("/mnt/storage"),
                ..PosixHelperConfig::default()
            },
            pool.clone(),
        );
        assert_eq!(helper.root("a/b"), PathBuf::from("/mnt/storage/a/b"));
        assert_eq!(helper.root("/a/b"), PathBuf::from("/mnt/storage/a/b"));
        pool.shutdown();
    }

    #[test]
    fn from_params_requires_mount_point() {
        let pool = ExecutorPool::new("posix-test", 1);
        let empty = Params::new();
        assert!(PosixHelper::from_params(&empty, pool.clone()).is_err());
        let mut params_map = Params::new();
        params_map.insert("mountPoint".into(), "/data".into());
        params_map.insert("uid".into(), "1000".into());
        params_map.insert("timeout".into(), "1500".into());
        let helper = PosixHelper::from_params(&params_map, pool.clone()).unwrap();
        assert_eq!(helper.config.uid, 1000);
        assert_eq!(helper.config.gid, KEEP_ID);
        assert_eq!(helper.timeout(), Duration::from_millis(1500));
        pool.shutdown();
    }
}
