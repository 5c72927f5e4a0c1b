//! Write-coalescing and read-ahead decorator.
//!
//! Wraps any helper whose handles benefit from fewer, larger backend
//! calls (object stores most of all: many small writes become one
//! whole-object PUT). Writes accumulate in a contiguous in-memory
//! region flushed on a size threshold, a timer, or release; reads are
//! served from the buffered region and a read-ahead block when they
//! overlap it, so a read after a write on the same handle always
//! observes the write. A failed flush poisons the handle and every
//! later operation replays the stored error.

use crate::error::{ErrorKind, HelperError};
use crate::exec::{CancelHandle, OpFuture, Scheduler};
use crate::helper::{
    FileHandle, FileId, Mode, NodeKind, OpenFlags, Params, Stat, StorageHelper,
};
use log::warn;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BufferLimits {
    /// Pending bytes that trigger an immediate flush.
    pub write_flush_threshold: usize,
    /// Idle time before a pending region is flushed by the scheduler.
    pub flush_interval: Duration,
    /// Minimum size fetched from the wrapped handle on a buffer miss.
    pub read_ahead_bytes: usize,
}

impl Default for BufferLimits {
    fn default() -> Self {
        Self {
            write_flush_threshold: 10 * 1024 * 1024,
            flush_interval: Duration::from_secs(1),
            read_ahead_bytes: 1024 * 1024,
        }
    }
}

/// Decorator around any [`StorageHelper`]; only `open` changes, every
/// other operation delegates to the wrapped helper.
pub struct BufferedHelper {
    inner: Arc<dyn StorageHelper>,
    scheduler: Scheduler,
    limits: BufferLimits,
}

impl BufferedHelper {
    pub fn new(inner: Arc<dyn StorageHelper>, scheduler: Scheduler) -> Self {
        Self {
            inner,
            scheduler,
            limits: BufferLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: BufferLimits) -> Self {
        self.limits = limits;
        self
    }
}

impl StorageHelper for BufferedHelper {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn timeout(&self) -> Duration {
        self.inner.timeout()
    }

    fn getattr(&self, file_id: &str) -> OpFuture<Stat> {
        self.inner.getattr(file_id)
    }

    fn access(&self, file_id: &str, mask: i32) -> OpFuture<()> {
        self.inner.access(file_id, mask)
    }

    fn readdir(&self, file_id: &str, offset: usize, count: usize) -> OpFuture<Vec<FileId>> {
        self.inner.readdir(file_id, offset, count)
    }

    fn readlink(&self, file_id: &str) -> OpFuture<FileId> {
        self.inner.readlink(file_id)
    }

    fn mknod(&self, file_id: &str, mode: Mode, kind: NodeKind, rdev: u64) -> OpFuture<()> {
        self.inner.mknod(file_id, mode, kind, rdev)
    }

    fn mkdir(&self, file_id: &str, mode: Mode) -> OpFuture<()> {
        self.inner.mkdir(file_id, mode)
    }

    fn unlink(&self, file_id: &str, current_size: Option<u64>) -> OpFuture<()> {
        self.inner.unlink(file_id, current_size)
    }

    fn rmdir(&self, file_id: &str) -> OpFuture<()> {
        self.inner.rmdir(file_id)
    }

    fn symlink(&self, from: &str, to: &str) -> OpFuture<()> {
        self.inner.symlink(from, to)
    }

    fn link(&self, from: &str, to: &str) -> OpFuture<()> {
        self.inner.link(from, to)
    }

    fn rename(&self, from: &str, to: &str) -> OpFuture<()> {
        self.inner.rename(from, to)
    }

    fn chmod(&self, file_id: &str, mode: Mode) -> OpFuture<()> {
        self.inner.chmod(file_id, mode)
    }

    fn chown(&self, file_id: &str, uid: Option<u32>, gid: Option<u32>) -> OpFuture<()> {
        self.inner.chown(file_id, uid, gid)
    }

    fn truncate(&self, file_id: &str, size: u64, current_size: Option<u64>) -> OpFuture<()> {
        self.inner.truncate(file_id, size, current_size)
    }

    fn open(
        &self,
        file_id: &str,
        flags: OpenFlags,
        open_params: &Params,
    ) -> OpFuture<Arc<dyn FileHandle>> {
        let scheduler = self.scheduler.clone();
        let limits = self.limits.clone();
        self.inner.open(file_id, flags, open_params).map(move |result| {
            let inner = result?;
            let buffered: Arc<dyn FileHandle> =
                Arc::new(BufferedFileHandle::new(inner, scheduler, limits));
            Ok(buffered)
        })
    }

    fn getxattr(&self, file_id: &str, name: &str) -> OpFuture<Vec<u8>> {
        self.inner.getxattr(file_id, name)
    }

    fn setxattr(
        &self,
        file_id: &str,
        name: &str,
        value: &[u8],
        create: bool,
        replace: bool,
    ) -> OpFuture<()> {
        self.inner.setxattr(file_id, name, value, create, replace)
    }

    fn removexattr(&self, file_id: &str, name: &str) -> OpFuture<()> {
        self.inner.removexattr(file_id, name)
    }

    fn listxattr(&self, file_id: &str) -> OpFuture<Vec<String>> {
        self.inner.listxattr(file_id)
    }
}

struct ReadBlock {
    offset: u64,
    data: Vec<u8>,
}

struct BufferState {
    pending_offset: u64,
    pending: Vec<u8>,
    poisoned: Option<HelperError>,
    read_block: Option<ReadBlock>,
    flush_timer: Option<CancelHandle>,
}

impl BufferState {
    fn new() -> Self {
        Self {
            pending_offset: 0,
            pending: Vec::new(),
            poisoned: None,
            read_block: None,
            flush_timer: None,
        }
    }
}

/// Handle decorator owning the in-memory region and its flush timer.
pub struct BufferedFileHandle {
    inner: Arc<dyn FileHandle>,
    scheduler: Scheduler,
    limits: BufferLimits,
    state: Arc<Mutex<BufferState>>,
    released: AtomicBool,
}

impl BufferedFileHandle {
    pub fn new(inner: Arc<dyn FileHandle>, scheduler: Scheduler, limits: BufferLimits) -> Self {
        Self {
            inner,
            scheduler,
            limits,
            state: Arc::new(Mutex::new(BufferState::new())),
            released: AtomicBool::new(false),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, BufferState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn arm_flush_timer(&self, state: &mut BufferState) {
        if state.flush_timer.is_some() {
            return;
        }
        let weak_state: Weak<Mutex<BufferState>> = Arc::downgrade(&self.state);
        let weak_inner: Weak<dyn FileHandle> = Arc::downgrade(&self.inner);
        let handle = self.scheduler.schedule_after(self.limits.flush_interval, move || {
            let (state, inner) = match (weak_state.upgrade(), weak_inner.upgrade()) {
                (Some(state), Some(inner)) => (state, inner),
                _ => return,
            };
            let mut guard = match state.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if guard.poisoned.is_some() {
                return;
            }
            if let Err(err) = flush_pending(&mut guard, &inner) {
                warn!("timed buffer flush failed: {err}");
                guard.poisoned = Some(err);
            }
        });
        state.flush_timer = Some(handle);
    }

    fn check_usable(&self, state: &BufferState) -> Result<(), HelperError> {
        if self.released.load(Ordering::Acquire) {
            return Err(HelperError::new(
                ErrorKind::IoError,
                "operation on a released handle",
            ));
        }
        match &state.poisoned {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

/// Writes the pending region through the wrapped handle. Blocks until
/// the backend accepts it; the read block is dropped because the
/// backend now owns the truth for that range.
fn flush_pending(
    state: &mut BufferState,
    inner: &Arc<dyn FileHandle>,
) -> Result<(), HelperError> {
    if let Some(timer) = state.flush_timer.take() {
        timer.cancel();
    }
    if state.pending.is_empty() {
        return Ok(());
    }
    let offset = state.pending_offset;
    let data = std::mem::take(&mut state.pending);
    let len = data.len();
    state.read_block = None;
    let written = inner.write(offset, data).wait()?;
    if written < len {
        return Err(HelperError::new(
            ErrorKind::IoError,
            format!("short flush: backend accepted {written} of {len} bytes"),
        ));
    }
    Ok(())
}

/// Copies the part of `pending` overlapping `[offset, offset+size)` over
/// `out`, growing `out` when the buffered region extends past it.
fn overlay_pending(state: &BufferState, offset: u64, size: usize, out: &mut Vec<u8>) {
    if state.pending.is_empty() {
        return;
    }
    let pending_start = state.pending_offset;
    let pending_end = pending_start + state.pending.len() as u64;
    let request_start = offset;
    let request_end = offset + size as u64;
    let start = pending_start.max(request_start);
    let end = pending_end.min(request_end);
    if start >= end {
        return;
    }
    let needed = (end - request_start) as usize;
    if out.len() < needed {
        out.resize(needed, 0);
    }
    let out_from = (start - request_start) as usize;
    let pending_from = (start - pending_start) as usize;
    let pending_to = (end - pending_start) as usize;
    out[out_from..needed].copy_from_slice(&state.pending[pending_from..pending_to]);
}

/// Serves a read entirely from buffered data when possible.
fn try_serve_buffered(state: &BufferState, offset: u64, size: usize) -> Option<Vec<u8>> {
    let request_end = offset + size as u64;
    // Fully inside the pending write region.
    if !state.pending.is_empty()
        && offset >= state.pending_offset
        && request_end <= state.pending_offset + state.pending.len() as u64
    {
        let from = (offset - state.pending_offset) as usize;
        return Some(state.pending[from..from + size].to_vec());
    }
    // Fully inside the read-ahead block, with pending overlaid.
    if let Some(block) = &state.read_block {
        if offset >= block.offset && request_end <= block.offset + block.data.len() as u64 {
            let from = (offset - block.offset) as usize;
            let mut out = block.data[from..from + size].to_vec();
            overlay_pending(state, offset, size, &mut out);
            return Some(out);
        }
    }
    None
}

impl FileHandle for BufferedFileHandle {
    fn file_id(&self) -> &str {
        self.inner.file_id()
    }

    fn read(&self, offset: u64, size: usize) -> OpFuture<Vec<u8>> {
        let mut state = self.lock_state();
        if let Err(err) = self.check_usable(&state) {
            return OpFuture::ready(Err(err));
        }
        if let Some(data) = try_serve_buffered(&state, offset, size) {
            return OpFuture::ready(Ok(data));
        }
        let fetch_size = size.max(self.limits.read_ahead_bytes);
        drop(state);
        let shared_state = self.state.clone();
        self.inner.read(offset, fetch_size).map(move |result| {
            let fetched = result?;
            let mut state = match shared_state.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let mut out = fetched.clone();
            out.truncate(size);
            overlay_pending(&state, offset, size, &mut out);
            state.read_block = Some(ReadBlock {
                offset,
                data: fetched,
            });
            Ok(out)
        })
    }

    fn write(&self, offset: u64, data: Vec<u8>) -> OpFuture<usize> {
        let len = data.len();
        let mut state = self.lock_state();
        if let Err(err) = self.check_usable(&state) {
            return OpFuture::ready(Err(err));
        }
        let pending_end = state.pending_offset + state.pending.len() as u64;
        if state.pending.is_empty() {
            state.pending_offset = offset;
            state.pending = data;
        } else if offset == pending_end {
            state.pending.extend_from_slice(&data);
        } else if offset >= state.pending_offset
            && offset + len as u64 <= pending_end
        {
            // Rewrite inside the buffered region.
            let from = (offset - state.pending_offset) as usize;
            state.pending[from..from + len].copy_from_slice(&data);
        } else {
            // Non-contiguous; push the old region out first.
            if let Err(err) = flush_pending(&mut state, &self.inner) {
                state.poisoned = Some(err.clone());
                return OpFuture::ready(Err(err));
            }
            state.pending_offset = offset;
            state.pending = data;
        }
        if state.pending.len() >= self.limits.write_flush_threshold {
            if let Err(err) = flush_pending(&mut state, &self.inner) {
                state.poisoned = Some(err.clone());
                return OpFuture::ready(Err(err));
            }
        } else {
            self.arm_flush_timer(&mut state);
        }
        OpFuture::ready(Ok(len))
    }

    fn flush(&self) -> OpFuture<()> {
        let mut state = self.lock_state();
        if let Err(err) = self.check_usable(&state) {
            return OpFuture::ready(Err(err));
        }
        if let Err(err) = flush_pending(&mut state, &self.inner) {
            state.poisoned = Some(err.clone());
            return OpFuture::ready(Err(err));
        }
        drop(state);
        self.inner.flush()
    }

    fn fsync(&self, data_only: bool) -> OpFuture<()> {
        let mut state = self.lock_state();
        if let Err(err) = self.check_usable(&state) {
            return OpFuture::ready(Err(err));
        }
        if let Err(err) = flush_pending(&mut state, &self.inner) {
            state.poisoned = Some(err.clone());
            return OpFuture::ready(Err(err));
        }
        drop(state);
        self.inner.fsync(data_only)
    }

    fn release(&self) -> OpFuture<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return OpFuture::ready(Ok(()));
        }
        let flush_result = {
            let mut state = self.lock_state();
            if let Some(err) = state.poisoned.clone() {
                Err(err)
            } else {
                match flush_pending(&mut state, &self.inner) {
                    Ok(()) => Ok(()),
                    Err(err) => {
                        state.poisoned = Some(err.clone());
                        Err(err)
                    }
                }
            }
        };
        let release_future = self.inner.release();
        match flush_result {
            Ok(()) => release_future,
            // The final flush failure wins over the release result.
            Err(err) => release_future.map(move |_| Err(err)),
        }
    }
}

impl Drop for BufferedFileHandle {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut state = self.lock_state();
        if state.poisoned.is_none() {
            if let Err(err) = flush_pending(&mut state, &self.inner) {
                warn!(
                    "dropping unreleased buffered handle for {}: final flush failed: {err}",
                    self.inner.file_id()
                );
            }
        }
        // The wrapped handle's own destructor performs its release.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct ScriptedHandle {
        content: Mutex<Vec<u8>>,
        writes: Mutex<Vec<(u64, usize)>>,
        reads: Mutex<Vec<(u64, usize)>>,
        fail_writes: AtomicBool,
        released: AtomicBool,
    }

    impl FileHandle for ScriptedHandle {
        fn file_id(&self) -> &str {
            "scripted"
        }

        fn read(&self, offset: u64, size: usize) -> OpFuture<Vec<u8>> {
            self.reads.lock().unwrap().push((offset, size));
            let content = self.content.lock().unwrap();
            let start = (offset as usize).min(content.len());
            let end = (start + size).min(content.len());
            OpFuture::ready(Ok(content[start..end].to_vec()))
        }

        fn write(&self, offset: u64, data: Vec<u8>) -> OpFuture<usize> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return OpFuture::ready(Err(HelperError::new(
                    ErrorKind::NoSpace,
                    "backend rejected write",
                )));
            }
            self.writes.lock().unwrap().push((offset, data.len()));
            let mut content = self.content.lock().unwrap();
            let end = offset as usize + data.len();
            if content.len() < end {
                content.resize(end, 0);
            }
            content[offset as usize..end].copy_from_slice(&data);
            OpFuture::ready(Ok(data.len()))
        }

        fn release(&self) -> OpFuture<()> {
            self.released.store(true, Ordering::SeqCst);
            OpFuture::ready(Ok(()))
        }
    }

    fn fixture(limits: BufferLimits) -> (Arc<ScriptedHandle>, BufferedFileHandle, Scheduler) {
        let inner = Arc::new(ScriptedHandle::default());
        let scheduler = Scheduler::new(1);
        let handle = BufferedFileHandle::new(inner.clone(), scheduler.clone(), limits);
        (inner, handle, scheduler)
    }

    fn quiet_limits() -> BufferLimits {
        BufferLimits {
            write_flush_threshold: 1024 * 1024,
            flush_interval: Duration::from_secs(3600),
            read_ahead_bytes: 16,
        }
    }

    #[test]
    fn contiguous_writes_coalesce_into_one_backend_write() {
        let (inner, handle, scheduler) = fixture(quiet_limits());
        assert_eq!(handle.write(0, b"hel".to_vec()).wait().unwrap(), 3);
        assert_eq!(handle.write(3, b"lo ".to_vec()).wait().unwrap(), 3);
        assert_eq!(handle.write(6, b"world".to_vec()).wait().unwrap(), 5);
        assert!(inner.writes.lock().unwrap().is_empty());
        handle.release().wait().unwrap();
        let writes = inner.writes.lock().unwrap().clone();
        assert_eq!(writes, vec![(0, 11)]);
        assert_eq!(*inner.content.lock().unwrap(), b"hello world".to_vec());
        assert!(inner.released.load(Ordering::SeqCst));
        scheduler.shutdown();
    }

    #[test]
    fn reaching_the_threshold_flushes_immediately() {
        let limits = BufferLimits {
            write_flush_threshold: 8,
            ..quiet_limits()
        };
        let (inner, handle, scheduler) = fixture(limits);
        handle.write(0, b"1234".to_vec()).wait().unwrap();
        assert!(inner.writes.lock().unwrap().is_empty());
        handle.write(4, b"5678".to_vec()).wait().unwrap();
        assert_eq!(inner.writes.lock().unwrap().clone(), vec![(0, 8)]);
        scheduler.shutdown();
    }

    #[test]
    fn timer_flushes_idle_buffers() {
        let limits = BufferLimits {
            flush_interval: Duration::from_millis(30),
            ..quiet_limits()
        };
        let (inner, handle, scheduler) = fixture(limits);
        handle.write(0, b"idle".to_vec()).wait().unwrap();
        std::thread::sleep(Duration::from_millis(250));
        assert_eq!(inner.writes.lock().unwrap().clone(), vec![(0, 4)]);
        scheduler.shutdown();
    }

    #[test]
    fn reads_observe_buffered_writes() {
        let (inner, handle, scheduler) = fixture(quiet_limits());
        *inner.content.lock().unwrap() = b"aaaaaa".to_vec();
        handle.write(2, b"xyz".to_vec()).wait().unwrap();
        let data = handle.read(0, 6).wait().unwrap();
        assert_eq!(data, b"aaxyza".to_vec());
        // Entirely inside the pending region: no backend read needed.
        let before = inner.reads.lock().unwrap().len();
        let inside = handle.read(2, 3).wait().unwrap();
        assert_eq!(inside, b"xyz".to_vec());
        assert_eq!(inner.reads.lock().unwrap().len(), before);
        scheduler.shutdown();
    }

    #[test]
    fn buffered_writes_alone_satisfy_reads_past_backend_eof() {
        let (_, handle, scheduler) = fixture(quiet_limits());
        handle.write(0, b"fresh".to_vec()).wait().unwrap();
        let data = handle.read(0, 5).wait().unwrap();
        assert_eq!(data, b"fresh".to_vec());
        scheduler.shutdown();
    }

    #[test]
    fn non_contiguous_write_flushes_previous_region() {
        let (inner, handle, scheduler) = fixture(quiet_limits());
        handle.write(0, b"abc".to_vec()).wait().unwrap();
        handle.write(100, b"def".to_vec()).wait().unwrap();
        assert_eq!(inner.writes.lock().unwrap().clone(), vec![(0, 3)]);
        handle.release().wait().unwrap();
        assert_eq!(
            inner.writes.lock().unwrap().clone(),
            vec![(0, 3), (100, 3)]
        );
        scheduler.shutdown();
    }

    #[test]
    fn flush_failure_poisons_the_handle() {
        let (inner, handle, scheduler) = fixture(quiet_limits());
        handle.write(0, b"doomed".to_vec()).wait().unwrap();
        inner.fail_writes.store(true, Ordering::SeqCst);
        let err = handle.flush().wait().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoSpace);
        let replay = handle.write(6, b"more".to_vec()).wait().unwrap_err();
        assert_eq!(replay.kind(), ErrorKind::NoSpace);
        let read_err = handle.read(0, 4).wait().unwrap_err();
        assert_eq!(read_err.kind(), ErrorKind::NoSpace);
        scheduler.shutdown();
    }

    #[test]
    fn release_surfaces_final_flush_errors() {
        let (inner, handle, scheduler) = fixture(quiet_limits());
        handle.write(0, b"doomed".to_vec()).wait().unwrap();
        inner.fail_writes.store(true, Ordering::SeqCst);
        let err = handle.release().wait().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoSpace);
        // The wrapped handle still saw its release.
        assert!(inner.released.load(Ordering::SeqCst));
        // And release stays idempotent.
        handle.release().wait().unwrap();
        scheduler.shutdown();
    }

    #[test]
    fn operations_after_release_are_rejected() {
        let (_, handle, scheduler) = fixture(quiet_limits());
        handle.release().wait().unwrap();
        assert!(handle.write(0, b"x".to_vec()).wait().is_err());
        assert!(handle.read(0, 1).wait().is_err());
        scheduler.shutdown();
    }
}
