//! Flat-key object stores behind the filesystem-shaped contract.
//!
//! The REST clients (`s3`, `swift`) implement [`ObjectBackend`]; the
//! [`ObjectStoreHelper`] adapter maps the storage contract onto it.
//! There are no directory objects: `readdir` prefix-lists, `mkdir` is a
//! successful no-op and `rmdir` merely verifies the prefix is empty.
//! Handle reads are ranged GETs; handle writes PUT the whole object and
//! therefore require offset zero — the buffering layer is the path for
//! anything else.

pub mod http;
#[cfg(feature = "s3")]
pub mod s3;
#[cfg(feature = "swift")]
pub mod swift;

use crate::error::{ErrorKind, HelperError};
use crate::exec::{ExecutorPool, OpFuture};
use crate::helper::{
    FileHandle, FileId, Mode, NodeKind, OpenFlags, Params, Stat, StorageHelper,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Bulk deletes are chunked into batches of at most this many keys.
pub const MAX_DELETE_BATCH: usize = 1000;

const DEFAULT_FILE_MODE: Mode = 0o644;
const DEFAULT_DIR_MODE: Mode = 0o755;

/// One listed or headed object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    pub key: String,
    pub size: u64,
}

/// Blocking flat-key operations provided by a concrete object store.
/// Implementations own their retry loops, error mapping and metrics.
pub trait ObjectBackend: Send + Sync {
    fn backend_name(&self) -> &'static str;

    /// Ranged read; may return fewer bytes than requested and returns
    /// empty when the range starts at or past the end of the object.
    fn get_object(&self, key: &str, offset: u64, size: usize) -> Result<Vec<u8>, HelperError>;

    /// Whole-object write.
    fn put_object(&self, key: &str, data: &[u8]) -> Result<usize, HelperError>;

    /// Bulk delete of at most [`MAX_DELETE_BATCH`] keys.
    fn delete_objects(&self, keys: &[String]) -> Result<(), HelperError>;

    /// Keys under `prefix`, with sizes.
    fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectEntry>, HelperError>;

    fn head_object(&self, key: &str) -> Result<ObjectEntry, HelperError>;
}

/// Chunks `keys` into [`MAX_DELETE_BATCH`]-sized batches and issues one
/// bulk delete per batch.
pub fn delete_objects_batched(
    backend: &dyn ObjectBackend,
    keys: &[String],
) -> Result<(), HelperError> {
    for batch in keys.chunks(MAX_DELETE_BATCH) {
        backend.delete_objects(batch)?;
    }
    Ok(())
}

/// Adapter presenting an [`ObjectBackend`] as a [`StorageHelper`].
pub struct ObjectStoreHelper {
    backend: Arc<dyn ObjectBackend>,
    backend_name: &'static str,
    executor: ExecutorPool,
    timeout: Duration,
}

impl ObjectStoreHelper {
    pub fn new(backend: Arc<dyn ObjectBackend>, executor: ExecutorPool, timeout: Duration) -> Self {
        let backend_name = backend.backend_name();
        Self {
            backend,
            backend_name,
            executor,
            timeout,
        }
    }

    fn submit<T: Send + 'static>(
        &self,
        task: impl FnOnce() -> Result<T, HelperError> + Send + 'static,
    ) -> OpFuture<T> {
        self.executor.submit(task).with_timeout(self.timeout)
    }
}

/// Normalized listing prefix for a directory-like FileId.
fn listing_prefix(file_id: &str) -> String {
    let trimmed = file_id.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}/")
    }
}

fn object_key(file_id: &str) -> String {
    file_id.trim_start_matches('/').to_string()
}

/// Immediate child names under `prefix`, deduplicated in listing order.
fn child_names(entries: &[ObjectEntry], prefix: &str) -> Vec<FileId> {
    let mut seen = std::collections::HashSet::new();
    let mut children = Vec::new();
    for entry in entries {
        let relative = match entry.key.strip_prefix(prefix) {
            Some(relative) if !relative.is_empty() => relative,
            _ => continue,
        };
        let name = relative.split('/').next().unwrap_or(relative);
        if seen.insert(name.to_string()) {
            children.push(name.to_string());
        }
    }
    children
}

impl StorageHelper for ObjectStoreHelper {
    fn name(&self) -> &'static str {
        self.backend_name
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn getattr(&self, file_id: &str) -> OpFuture<Stat> {
        let backend = self.backend.clone();
        let key = object_key(file_id);
        self.submit(move || {
            if key.is_empty() {
                return Ok(Stat::directory(DEFAULT_DIR_MODE));
            }
            match backend.head_object(&key) {
                Ok(entry) => Ok(Stat::regular(entry.size, DEFAULT_FILE_MODE)),
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    let entries = backend.list_objects(&listing_prefix(&key))?;
                    if entries.is_empty() {
                        Err(err)
                    } else {
                        Ok(Stat::directory(DEFAULT_DIR_MODE))
                    }
                }
                Err(err) => Err(err),
            }
        })
    }

    fn access(&self, _file_id: &str, _mask: i32) -> OpFuture<()> {
        OpFuture::ready(Ok(()))
    }

    fn readdir(&self, file_id: &str, offset: usize, count: usize) -> OpFuture<Vec<FileId>> {
        let backend = self.backend.clone();
        let prefix = listing_prefix(file_id);
        self.submit(move || {
            let entries = backend.list_objects(&prefix)?;
            Ok(child_names(&entries, &prefix)
                .into_iter()
                .skip(offset)
                .take(count)
                .collect())
        })
    }

    fn mknod(&self, file_id: &str, _mode: Mode, kind: NodeKind, _rdev: u64) -> OpFuture<()> {
        if kind != NodeKind::Regular {
            return OpFuture::ready(Err(HelperError::not_supported(
                "mknod: object stores hold regular objects only",
            )));
        }
        let backend = self.backend.clone();
        let key = object_key(file_id);
        self.submit(move || backend.put_object(&key, &[]).map(|_| ()))
    }

    fn mkdir(&self, _file_id: &str, _mode: Mode) -> OpFuture<()> {
        // Directories are implicit in the key space.
        OpFuture::ready(Ok(()))
    }

    fn unlink(&self, file_id: &str, _current_size: Option<u64>) -> OpFuture<()> {
        let backend = self.backend.clone();
        let key = object_key(file_id);
        self.submit(move || delete_objects_batched(backend.as_ref(), &[key]))
    }

    fn rmdir(&self, file_id: &str) -> OpFuture<()> {
        let backend = self.backend.clone();
        let prefix = listing_prefix(file_id);
        self.submit(move || {
            let entries = backend.list_objects(&prefix)?;
            if entries.is_empty() {
                Ok(())
            } else {
                Err(HelperError::with_errno(
                    ErrorKind::IoError,
                    libc::ENOTEMPTY,
                    format!("rmdir {prefix}: prefix not empty"),
                ))
            }
        })
    }

    fn rename(&self, from: &str, to: &str) -> OpFuture<()> {
        let backend = self.backend.clone();
        let from_key = object_key(from);
        let to_key = object_key(to);
        self.submit(move || {
            let entry = backend.head_object(&from_key)?;
            let data = backend.get_object(&from_key, 0, entry.size as usize)?;
            backend.put_object(&to_key, &data)?;
            delete_objects_batched(backend.as_ref(), &[from_key])
        })
    }

    fn chmod(&self, _file_id: &str, _mode: Mode) -> OpFuture<()> {
        // No mode bits to maintain on a flat key space.
        OpFuture::ready(Ok(()))
    }

    fn chown(&self, _file_id: &str, _uid: Option<u32>, _gid: Option<u32>) -> OpFuture<()> {
        OpFuture::ready(Ok(()))
    }

    fn truncate(&self, file_id: &str, size: u64, _current_size: Option<u64>) -> OpFuture<()> {
        let backend = self.backend.clone();
        let key = object_key(file_id);
        self.submit(move || {
            if size == 0 {
                backend.put_object(&key, &[]).map(|_| ())
            } else {
                let mut data = backend.get_object(&key, 0, size as usize)?;
                data.resize(size as usize, 0);
                backend.put_object(&key, &data).map(|_| ())
            }
        })
    }

    fn open(
        &self,
        file_id: &str,
        _flags: OpenFlags,
        _params: &Params,
    ) -> OpFuture<Arc<dyn FileHandle>> {
        let handle: Arc<dyn FileHandle> = Arc::new(ObjectStoreFileHandle {
            file_id: file_id.to_string(),
            key: object_key(file_id),
            backend: self.backend.clone(),
            executor: self.executor.clone(),
            timeout: self.timeout,
            needs_release: AtomicBool::new(true),
        });
        OpFuture::ready(Ok(handle))
    }
}

/// Handle over one object key. The backend token is the key itself;
/// release has nothing to close and only flips the pending flag.
pub struct ObjectStoreFileHandle {
    file_id: String,
    key: String,
    backend: Arc<dyn ObjectBackend>,
    executor: ExecutorPool,
    timeout: Duration,
    needs_release: AtomicBool,
}

impl FileHandle for ObjectStoreFileHandle {
    fn file_id(&self) -> &str {
        &self.file_id
    }

    fn read(&self, offset: u64, size: usize) -> OpFuture<Vec<u8>> {
        let backend = self.backend.clone();
        let key = self.key.clone();
        self.executor
            .submit(move || backend.get_object(&key, offset, size))
            .with_timeout(self.timeout)
    }

    fn write(&self, offset: u64, data: Vec<u8>) -> OpFuture<usize> {
        if offset != 0 {
            return OpFuture::ready(Err(HelperError::not_supported(
                "write at non-zero offset on an object store",
            )));
        }
        let backend = self.backend.clone();
        let key = self.key.clone();
        self.executor
            .submit(move || backend.put_object(&key, &data))
            .with_timeout(self.timeout)
    }

    fn release(&self) -> OpFuture<()> {
        self.needs_release.swap(false, Ordering::AcqRel);
        OpFuture::ready(Ok(()))
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// In-memory backend recording traffic, for adapter-level tests.
    #[derive(Default)]
    pub(crate) struct MemoryBackend {
        pub(crate) objects: Mutex<BTreeMap<String, Vec<u8>>>,
        pub(crate) delete_batches: Mutex<Vec<usize>>,
        pub(crate) put_count: Mutex<usize>,
    }

    impl ObjectBackend for MemoryBackend {
        fn backend_name(&self) -> &'static str {
            "memory"
        }

        fn get_object(&self, key: &str, offset: u64, size: usize) -> Result<Vec<u8>, HelperError> {
            let objects = self.objects.lock().unwrap();
            let data = objects
                .get(key)
                .ok_or_else(|| HelperError::new(ErrorKind::NotFound, format!("get {key}")))?;
            let start = (offset as usize).min(data.len());
            let end = (start + size).min(data.len());
            Ok(data[start..end].to_vec())
        }

        fn put_object(&self, key: &str, data: &[u8]) -> Result<usize, HelperError> {
            *self.put_count.lock().unwrap() += 1;
            self.objects
                .lock()
                .unwrap()
                .insert(key.to_string(), data.to_vec());
            Ok(data.len())
        }

        fn delete_objects(&self, keys: &[String]) -> Result<(), HelperError> {
            self.delete_batches.lock().unwrap().push(keys.len());
            let mut objects = self.objects.lock().unwrap();
            for key in keys {
                objects.remove(key);
            }
            Ok(())
        }

        fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectEntry>, HelperError> {
            Ok(self
                .objects
                .lock()
                .unwrap()
                .iter()
                .filter(|(key, _)| key.starts_with(prefix))
                .map(|(key, data)| ObjectEntry {
                    key: key.clone(),
                    size: data.len() as u64,
                })
                .collect())
        }

        fn head_object(&self, key: &str) -> Result<ObjectEntry, HelperError> {
            self.objects
                .lock()
                .unwrap()
                .get(key)
                .map(|data| ObjectEntry {
                    key: key.to_string(),
                    size: data.len() as u64,
                })
                .ok_or_else(|| HelperError::new(ErrorKind::NotFound, format!("head {key}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::MemoryBackend;
    use super::*;
    use crate::helper::DEFAULT_OP_TIMEOUT;

    fn helper_fixture() -> (Arc<MemoryBackend>, ObjectStoreHelper, ExecutorPool) {
        let backend = Arc::new(MemoryBackend::default());
        let pool = ExecutorPool::new("objectstore-test", 2);
        let helper = ObjectStoreHelper::new(backend.clone(), pool.clone(), DEFAULT_OP_TIMEOUT);
        (backend, helper, pool)
    }

    fn put(backend: &MemoryBackend, key: &str, data: &[u8]) {
        backend.put_object(key, data).unwrap();
    }

    #[test]
    fn put_get_delete_round_trip() {
        let (_, helper, pool) = helper_fixture();
        let handle = helper
            .open("data/blob", OpenFlags::WRITE, &Params::new())
            .wait()
            .unwrap();
        assert_eq!(handle.write(0, b"payload".to_vec()).wait().unwrap(), 7);
        assert_eq!(handle.read(0, 7).wait().unwrap(), b"payload");
        assert_eq!(handle.read(3, 2).wait().unwrap(), b"lo");
        handle.release().wait().unwrap();
        helper.unlink("data/blob", None).wait().unwrap();
        let err = helper.getattr("data/blob").wait().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        pool.shutdown();
    }

    #[test]
    fn writes_at_non_zero_offsets_are_rejected() {
        let (_, helper, pool) = helper_fixture();
        let handle = helper
            .open("k", OpenFlags::WRITE, &Params::new())
            .wait()
            .unwrap();
        let err = handle.write(5, b"x".to_vec()).wait().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotSupported);
        pool.shutdown();
    }

    #[test]
    fn readdir_lists_immediate_children_with_window() {
        let (backend, helper, pool) = helper_fixture();
        for name in ["d/e0", "d/e1", "d/e2", "d/e3", "d/sub/nested", "other"] {
            put(&backend, name, b"x");
        }
        let all = helper.readdir("d", 0, 100).wait().unwrap();
        assert_eq!(all, vec!["e0", "e1", "e2", "e3", "sub"]);
        let window = helper.readdir("d", 2, 2).wait().unwrap();
        assert_eq!(window, vec!["e2", "e3"]);
        pool.shutdown();
    }

    #[test]
    fn mkdir_succeeds_and_rmdir_requires_empty_prefix() {
        let (backend, helper, pool) = helper_fixture();
        helper.mkdir("fresh", 0o755).wait().unwrap();
        helper.rmdir("fresh").wait().unwrap();
        put(&backend, "busy/child", b"x");
        let err = helper.rmdir("busy").wait().unwrap_err();
        assert_eq!(err.errno(), Some(libc::ENOTEMPTY));
        pool.shutdown();
    }

    #[test]
    fn getattr_distinguishes_objects_and_prefixes() {
        let (backend, helper, pool) = helper_fixture();
        put(&backend, "dir/file", b"abcde");
        let dir = helper.getattr("dir").wait().unwrap();
        assert!(dir.is_dir());
        let file = helper.getattr("dir/file").wait().unwrap();
        assert!(!file.is_dir());
        assert_eq!(file.size, 5);
        pool.shutdown();
    }

    #[test]
    fn bulk_deletes_chunk_at_the_batch_limit() {
        let backend = MemoryBackend::default();
        let keys: Vec<String> = (0..2350).map(|n| format!("k{n}")).collect();
        delete_objects_batched(&backend, &keys).unwrap();
        assert_eq!(*backend.delete_batches.lock().unwrap(), vec![1000, 1000, 350]);
    }

    #[test]
    fn truncate_rewrites_the_object() {
        let (backend, helper, pool) = helper_fixture();
        put(&backend, "t", b"123456");
        helper.truncate("t", 3, None).wait().unwrap();
        assert_eq!(backend.objects.lock().unwrap()["t"], b"123".to_vec());
        helper.truncate("t", 5, None).wait().unwrap();
        assert_eq!(backend.objects.lock().unwrap()["t"], b"123\0\0".to_vec());
        pool.shutdown();
    }

    #[test]
    fn release_is_idempotent() {
        let (_, helper, pool) = helper_fixture();
        let handle = helper
            .open("k", OpenFlags::READ, &Params::new())
            .wait()
            .unwrap();
        handle.release().wait().unwrap();
        handle.release().wait().unwrap();
        pool.shutdown();
    }
}
