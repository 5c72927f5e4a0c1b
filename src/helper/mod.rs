//! The storage-access contract every backend implements.
//!
//! A helper is anything that provides the operation set below; a handle
//! anything that provides the per-open session operations. Callers hold
//! both behind `Arc<dyn ...>`. Operations a backend cannot provide
//! report `NotSupported` instead of silently succeeding, which is what
//! the default trait methods do.

pub mod params;

use crate::error::HelperError;
use crate::exec::OpFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Backend-scoped opaque identifier of a file. POSIX joins it under a
/// mount root, object stores use it as the key, the proxy forwards it.
pub type FileId = String;

/// Opaque string→string configuration passed to the factory and `open`.
pub type Params = HashMap<String, String>;

/// 12-bit POSIX permission word.
pub type Mode = u32;

/// Default per-call timeout when the configuration does not set one.
pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(120);

/// Abstract open flags translated by each backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenFlags(u32);

impl OpenFlags {
    pub const READ: OpenFlags = OpenFlags(1);
    pub const WRITE: OpenFlags = OpenFlags(1 << 1);
    pub const READ_WRITE: OpenFlags = OpenFlags(1 | 1 << 1);
    pub const CREATE: OpenFlags = OpenFlags(1 << 2);
    pub const EXCLUSIVE: OpenFlags = OpenFlags(1 << 3);
    pub const TRUNCATE: OpenFlags = OpenFlags(1 << 4);
    pub const APPEND: OpenFlags = OpenFlags(1 << 5);

    pub fn empty() -> Self {
        OpenFlags(0)
    }

    pub fn union(self, other: OpenFlags) -> Self {
        OpenFlags(self.0 | other.0)
    }

    pub fn contains(self, other: OpenFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_write(self) -> bool {
        self.contains(OpenFlags::WRITE)
    }

    /// Translation into POSIX `open(2)` flag bits.
    pub fn to_posix(self) -> i32 {
        let mut bits = match (
            self.contains(OpenFlags::READ),
            self.contains(OpenFlags::WRITE),
        ) {
            (true, true) => libc::O_RDWR,
            (false, true) => libc::O_WRONLY,
            // Plain read and flagless opens both degrade to O_RDONLY.
            _ => libc::O_RDONLY,
        };
        if self.contains(OpenFlags::CREATE) {
            bits |= libc::O_CREAT;
        }
        if self.contains(OpenFlags::EXCLUSIVE) {
            bits |= libc::O_EXCL;
        }
        if self.contains(OpenFlags::TRUNCATE) {
            bits |= libc::O_TRUNC;
        }
        if self.contains(OpenFlags::APPEND) {
            bits |= libc::O_APPEND;
        }
        bits
    }
}

impl std::ops::BitOr for OpenFlags {
    type Output = OpenFlags;

    fn bitor(self, rhs: OpenFlags) -> OpenFlags {
        self.union(rhs)
    }
}

/// Node type created by `mknod`. Object stores implement only `Regular`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    Regular,
    Fifo,
    CharDevice,
    BlockDevice,
}

/// Portable stat record returned by `getattr`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    pub dev: u64,
    pub ino: u64,
    /// File type and permission bits, POSIX `st_mode` layout.
    pub mode: u32,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: u64,
    pub blocks: u64,
    pub atime_sec: i64,
    pub atime_nsec: i64,
    pub mtime_sec: i64,
    pub mtime_nsec: i64,
    pub ctime_sec: i64,
    pub ctime_nsec: i64,
}

impl Stat {
    pub fn regular(size: u64, mode: Mode) -> Self {
        Stat {
            mode: libc::S_IFREG as u32 | (mode & 0o7777),
            nlink: 1,
            size,
            ..Stat::default()
        }
    }

    pub fn directory(mode: Mode) -> Self {
        Stat {
            mode: libc::S_IFDIR as u32 | (mode & 0o7777),
            nlink: 2,
            ..Stat::default()
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT as u32 == libc::S_IFDIR as u32
    }
}

/// One backend behind the uniform storage-access contract.
///
/// Every operation returns a future completing on the helper's executor.
/// Stateless per call; configuration, executor and identity are bound at
/// construction. Handles returned by [`StorageHelper::open`] keep the
/// pieces they need alive through shared ownership.
pub trait StorageHelper: Send + Sync {
    /// Short backend tag used in metric names (`posix`, `s3`, ...).
    fn name(&self) -> &'static str;

    /// Per-call timeout baked into the futures this helper returns.
    fn timeout(&self) -> Duration;

    fn getattr(&self, _file_id: &str) -> OpFuture<Stat> {
        unsupported("getattr")
    }

    fn access(&self, _file_id: &str, _mask: i32) -> OpFuture<()> {
        unsupported("access")
    }

    /// Up to `count` entries starting at logical `offset`, `.`/`..`
    /// never included.
    fn readdir(&self, _file_id: &str, _offset: usize, _count: usize) -> OpFuture<Vec<FileId>> {
        unsupported("readdir")
    }

    fn readlink(&self, _file_id: &str) -> OpFuture<FileId> {
        unsupported("readlink")
    }

    fn mknod(&self, _file_id: &str, _mode: Mode, _kind: NodeKind, _rdev: u64) -> OpFuture<()> {
        unsupported("mknod")
    }

    fn mkdir(&self, _file_id: &str, _mode: Mode) -> OpFuture<()> {
        unsupported("mkdir")
    }

    /// `current_size` is an advisory hint forwarded by some frontends;
    /// backends may ignore it.
    fn unlink(&self, _file_id: &str, _current_size: Option<u64>) -> OpFuture<()> {
        unsupported("unlink")
    }

    fn rmdir(&self, _file_id: &str) -> OpFuture<()> {
        unsupported("rmdir")
    }

    fn symlink(&self, _from: &str, _to: &str) -> OpFuture<()> {
        unsupported("symlink")
    }

    fn link(&self, _from: &str, _to: &str) -> OpFuture<()> {
        unsupported("link")
    }

    fn rename(&self, _from: &str, _to: &str) -> OpFuture<()> {
        unsupported("rename")
    }

    fn chmod(&self, _file_id: &str, _mode: Mode) -> OpFuture<()> {
        unsupported("chmod")
    }

    fn chown(&self, _file_id: &str, _uid: Option<u32>, _gid: Option<u32>) -> OpFuture<()> {
        unsupported("chown")
    }

    fn truncate(&self, _file_id: &str, _size: u64, _current_size: Option<u64>) -> OpFuture<()> {
        unsupported("truncate")
    }

    fn open(
        &self,
        _file_id: &str,
        _flags: OpenFlags,
        _params: &Params,
    ) -> OpFuture<Arc<dyn FileHandle>> {
        unsupported("open")
    }

    fn getxattr(&self, _file_id: &str, _name: &str) -> OpFuture<Vec<u8>> {
        unsupported("getxattr")
    }

    /// `create` and `replace` carry the usual xattr exclusivity
    /// semantics; both false means create-or-replace.
    fn setxattr(
        &self,
        _file_id: &str,
        _name: &str,
        _value: &[u8],
        _create: bool,
        _replace: bool,
    ) -> OpFuture<()> {
        unsupported("setxattr")
    }

    fn removexattr(&self, _file_id: &str, _name: &str) -> OpFuture<()> {
        unsupported("removexattr")
    }

    fn listxattr(&self, _file_id: &str) -> OpFuture<Vec<String>> {
        unsupported("listxattr")
    }
}

/// A per-open session bound to one file and one helper.
///
/// Exactly one release is attempted over a handle's lifetime; dropping
/// an unreleased handle triggers it from the destructor. After `release`
/// completes the handle is unusable.
pub trait FileHandle: Send + Sync {
    fn file_id(&self) -> &str;

    /// Returns at most `size` bytes; fewer signals EOF or a short read.
    fn read(&self, offset: u64, size: usize) -> OpFuture<Vec<u8>>;

    /// Returns the number of bytes durably accepted at `offset`.
    fn write(&self, offset: u64, data: Vec<u8>) -> OpFuture<usize>;

    /// Best-effort durability hint; a no-op on backends without flush.
    fn flush(&self) -> OpFuture<()> {
        OpFuture::ready(Ok(()))
    }

    fn fsync(&self, _data_only: bool) -> OpFuture<()> {
        OpFuture::ready(Ok(()))
    }

    /// Idempotent; repeated calls after the first are no-ops.
    fn release(&self) -> OpFuture<()>;
}

pub(crate) fn unsupported<T: Send + 'static>(operation: &str) -> OpFuture<T> {
    OpFuture::ready(Err(HelperError::not_supported(operation)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn open_flags_translate_to_posix_bits() {
        let flags = OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::EXCLUSIVE;
        let bits = flags.to_posix();
        assert_eq!(bits & libc::O_ACCMODE, libc::O_WRONLY);
        assert_ne!(bits & libc::O_CREAT, 0);
        assert_ne!(bits & libc::O_EXCL, 0);
        assert_eq!(bits & libc::O_TRUNC, 0);
        assert_eq!(OpenFlags::READ_WRITE.to_posix() & libc::O_ACCMODE, libc::O_RDWR);
    }

    #[test]
    fn stat_constructors_set_type_bits() {
        assert!(Stat::directory(0o755).is_dir());
        let file = Stat::regular(42, 0o644);
        assert!(!file.is_dir());
        assert_eq!(file.size, 42);
        assert_eq!(file.mode & 0o7777, 0o644);
    }

    struct Bare;

    impl StorageHelper for Bare {
        fn name(&self) -> &'static str {
            "bare"
        }

        fn timeout(&self) -> Duration {
            DEFAULT_OP_TIMEOUT
        }
    }

    #[test]
    fn unimplemented_operations_report_not_supported() {
        let helper = Bare;
        let err = helper.getattr("f").wait().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotSupported);
        let err = helper.symlink("a", "b").wait().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotSupported);
    }
}
