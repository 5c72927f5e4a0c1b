//! Remote backend reached over an injected request/response channel.
//!
//! The channel is a black box: [`Communicator::send`] ships an opaque
//! payload tagged with a message id, and the transport feeds inbound
//! `(message_id, payload)` pairs back through
//! [`ProxyConnection::deliver`]. Correlation lives here: a monotonically
//! increasing id generator that skips zero and negatives, a mailbox of
//! pending calls keyed by id, and a push callback that receives
//! server-initiated messages (negative ids) as well as replies nobody is
//! waiting for anymore.

use crate::error::{ErrorKind, HelperError};
use crate::exec::{OpFuture, Promise};
use crate::helper::{
    FileHandle, FileId, Mode, NodeKind, OpenFlags, Params, Stat, StorageHelper, DEFAULT_OP_TIMEOUT,
};
use crate::helper::params;
use crate::telemetry::SharedMetricsRegistry;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Outbound half of the proxy channel.
pub trait Communicator: Send + Sync {
    fn send(&self, message_id: i64, payload: Vec<u8>) -> Result<(), HelperError>;
}

/// Callback receiving push messages and unmatched replies.
pub type PushCallback = Box<dyn Fn(Vec<u8>) + Send + Sync>;

struct PendingCall {
    promise: Promise<Vec<u8>>,
    expires_at: Instant,
}

struct ConnectionInner {
    communicator: Arc<dyn Communicator>,
    mailbox: Mutex<HashMap<i64, PendingCall>>,
    next_id: AtomicI64,
    push: Mutex<Option<PushCallback>>,
}

/// Correlated request/response channel shared by proxy helpers.
#[derive(Clone)]
pub struct ProxyConnection {
    inner: Arc<ConnectionInner>,
}

impl ProxyConnection {
    pub fn new(communicator: Arc<dyn Communicator>) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                communicator,
                mailbox: Mutex::new(HashMap::new()),
                next_id: AtomicI64::new(1),
                push: Mutex::new(None),
            }),
        }
    }

    pub fn set_push_callback(&self, callback: impl Fn(Vec<u8>) + Send + Sync + 'static) {
        if let Ok(mut slot) = self.inner.push.lock() {
            *slot = Some(Box::new(callback));
        }
    }

    /// Sends `payload` and returns a future for the correlated reply.
    pub fn call(&self, payload: Vec<u8>, timeout: Duration) -> OpFuture<Vec<u8>> {
        self.sweep_expired();
        let message_id = self.next_message_id();
        let expires_at = Instant::now() + timeout;
        let (promise, future) = OpFuture::promise();
        {
            let mut mailbox = lock_ignore_poison(&self.inner.mailbox);
            mailbox.insert(
                message_id,
                PendingCall {
                    promise,
                    expires_at,
                },
            );
        }
        if let Err(err) = self.inner.communicator.send(message_id, payload) {
            let mut mailbox = lock_ignore_poison(&self.inner.mailbox);
            if let Some(pending) = mailbox.remove(&message_id) {
                pending.promise.complete(Err(err));
            }
        }
        future.with_deadline(expires_at)
    }

    /// Routes one inbound message. Negative ids are pushes; ids with no
    /// waiter (already timed out, or never ours) drain to the push
    /// callback as well.
    pub fn deliver(&self, message_id: i64, payload: Vec<u8>) {
        if message_id > 0 {
            let pending = lock_ignore_poison(&self.inner.mailbox).remove(&message_id);
            if let Some(pending) = pending {
                pending.promise.complete(Ok(payload));
                return;
            }
            debug!("proxy reply {message_id} has no waiter, draining to push callback");
        }
        if let Ok(slot) = self.inner.push.lock() {
            if let Some(callback) = slot.as_ref() {
                callback(payload);
            }
        }
    }

    fn next_message_id(&self) -> i64 {
        loop {
            let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
            if id > 0 {
                return id;
            }
            // Wrapped around; bring the counter back into positives.
            let _ = self.inner.next_id.compare_exchange(
                id + 1,
                1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            );
        }
    }

    fn sweep_expired(&self) {
        let now = Instant::now();
        let mut expired = Vec::new();
        {
            let mut mailbox = lock_ignore_poison(&self.inner.mailbox);
            let stale: Vec<i64> = mailbox
                .iter()
                .filter(|(_, pending)| pending.expires_at <= now)
                .map(|(id, _)| *id)
                .collect();
            for id in stale {
                if let Some(pending) = mailbox.remove(&id) {
                    expired.push(pending);
                }
            }
        }
        for pending in expired {
            pending
                .promise
                .complete(Err(HelperError::timed_out("proxy call expired unanswered")));
        }
    }
}

fn lock_ignore_poison<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Requests forwarded to the remote peer.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum ProxyRequest {
    Getattr {
        storage_id: String,
        file_id: FileId,
    },
    Access {
        storage_id: String,
        file_id: FileId,
        mask: i32,
    },
    Readdir {
        storage_id: String,
        file_id: FileId,
        offset: usize,
        count: usize,
    },
    Readlink {
        storage_id: String,
        file_id: FileId,
    },
    Mknod {
        storage_id: String,
        file_id: FileId,
        mode: Mode,
        kind: NodeKind,
        rdev: u64,
    },
    Mkdir {
        storage_id: String,
        file_id: FileId,
        mode: Mode,
    },
    Unlink {
        storage_id: String,
        file_id: FileId,
        current_size: Option<u64>,
    },
    Rmdir {
        storage_id: String,
        file_id: FileId,
    },
    Symlink {
        storage_id: String,
        from: FileId,
        to: FileId,
    },
    Link {
        storage_id: String,
        from: FileId,
        to: FileId,
    },
    Rename {
        storage_id: String,
        from: FileId,
        to: FileId,
    },
    Chmod {
        storage_id: String,
        file_id: FileId,
        mode: Mode,
    },
    Chown {
        storage_id: String,
        file_id: FileId,
        uid: Option<u32>,
        gid: Option<u32>,
    },
    Truncate {
        storage_id: String,
        file_id: FileId,
        size: u64,
        current_size: Option<u64>,
    },
    Getxattr {
        storage_id: String,
        file_id: FileId,
        name: String,
    },
    Setxattr {
        storage_id: String,
        file_id: FileId,
        name: String,
        value: Vec<u8>,
        create: bool,
        replace: bool,
    },
    Removexattr {
        storage_id: String,
        file_id: FileId,
        name: String,
    },
    Listxattr {
        storage_id: String,
        file_id: FileId,
    },
    Read {
        storage_id: String,
        file_id: FileId,
        offset: u64,
        size: usize,
        params: Params,
    },
    Write {
        storage_id: String,
        file_id: FileId,
        offset: u64,
        data: Vec<u8>,
        params: Params,
    },
    Fsync {
        storage_id: String,
        file_id: FileId,
        data_only: bool,
    },
}

/// Typed replies from the remote peer.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "camelCase")]
pub enum ProxyResponse {
    Stat { stat: Stat },
    Entries { entries: Vec<FileId> },
    Target { target: FileId },
    Data { data: Vec<u8> },
    Written { written: usize },
    Xattr { value: Vec<u8> },
    XattrNames { names: Vec<String> },
    Done,
    Error {
        kind: ErrorKind,
        errno: Option<i32>,
        message: String,
    },
}

/// Storage helper forwarding every operation to a remote peer that owns
/// the actual storage.
pub struct ProxyHelper {
    storage_id: String,
    connection: ProxyConnection,
    timeout: Duration,
    metrics: Option<SharedMetricsRegistry>,
}

impl ProxyHelper {
    pub fn new(storage_id: impl Into<String>, connection: ProxyConnection, timeout: Duration) -> Self {
        Self {
            storage_id: storage_id.into(),
            connection,
            timeout,
            metrics: None,
        }
    }

    /// Factory parameters: `storageId` (required), `timeout` (ms). The
    /// communicator is injected, not configured.
    pub fn from_params(
        params_map: &Params,
        connection: ProxyConnection,
    ) -> Result<Self, HelperError> {
        Ok(Self::new(
            params::required(params_map, "storageId")?,
            connection,
            params::timeout(params_map, DEFAULT_OP_TIMEOUT)?,
        ))
    }

    pub fn with_metrics(mut self, metrics: SharedMetricsRegistry) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn storage_id(&self) -> String {
        self.storage_id.clone()
    }
}

/// Serializes `request`, ships it, and decodes the typed reply.
fn round_trip(
    connection: &ProxyConnection,
    metrics: &Option<SharedMetricsRegistry>,
    op: &'static str,
    timeout: Duration,
    request: &ProxyRequest,
) -> OpFuture<ProxyResponse> {
    let payload = match serde_json::to_vec(request) {
        Ok(payload) => payload,
        Err(err) => {
            return OpFuture::ready(Err(HelperError::new(
                ErrorKind::IoError,
                format!("{op}: encode request: {err}"),
            )))
        }
    };
    let timer = metrics.as_ref().map(|metrics| metrics.timer(&format!("proxy.{op}")));
    connection.call(payload, timeout).map(move |result| {
        let bytes = result?;
        let response: ProxyResponse = serde_json::from_slice(&bytes).map_err(|err| {
            HelperError::new(ErrorKind::IoError, format!("{op}: decode response: {err}"))
        })?;
        if let ProxyResponse::Error {
            kind,
            errno,
            message,
        } = response
        {
            return Err(match errno {
                Some(errno) => HelperError::with_errno(kind, errno, message),
                None => HelperError::new(kind, message),
            });
        }
        if let Some(timer) = timer {
            timer.stop(0);
        }
        Ok(response)
    })
}

fn unexpected(op: &'static str) -> HelperError {
    HelperError::new(ErrorKind::IoError, format!("{op}: unexpected response variant"))
}

macro_rules! expect_done {
    ($future:expr, $op:literal) => {
        $future.map(|result| match result? {
            ProxyResponse::Done => Ok(()),
            _ => Err(unexpected($op)),
        })
    };
}

impl StorageHelper for ProxyHelper {
    fn name(&self) -> &'static str {
        "proxy"
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn getattr(&self, file_id: &str) -> OpFuture<Stat> {
        let request = ProxyRequest::Getattr {
            storage_id: self.storage_id(),
            file_id: file_id.to_string(),
        };
        round_trip(&self.connection, &self.metrics, "getattr", self.timeout, &request).map(
            |result| match result? {
                ProxyResponse::Stat { stat } => Ok(stat),
                _ => Err(unexpected("getattr")),
            },
        )
    }

    fn access(&self, file_id: &str, mask: i32) -> OpFuture<()> {
        let request = ProxyRequest::Access {
            storage_id: self.storage_id(),
            file_id: file_id.to_string(),
            mask,
        };
        expect_done!(
            round_trip(&self.connection, &self.metrics, "access", self.timeout, &request),
            "access"
        )
    }

    fn readdir(&self, file_id: &str, offset: usize, count: usize) -> OpFuture<Vec<FileId>> {
        let request = ProxyRequest::Readdir {
            storage_id: self.storage_id(),
            file_id: file_id.to_string(),
            offset,
            count,
        };
        round_trip(&self.connection, &self.metrics, "readdir", self.timeout, &request).map(
            |result| match result? {
                ProxyResponse::Entries { entries } => Ok(entries),
                _ => Err(unexpected("readdir")),
            },
        )
    }

    fn readlink(&self, file_id: &str) -> OpFuture<FileId> {
        let request = ProxyRequest::Readlink {
            storage_id: self.storage_id(),
            file_id: file_id.to_string(),
        };
        round_trip(&self.connection, &self.metrics, "readlink", self.timeout, &request).map(
            |result| match result? {
                ProxyResponse::Target { target } => Ok(target),
                _ => Err(unexpected("readlink")),
            },
        )
    }

    fn mknod(&self, file_id: &str, mode: Mode, kind: NodeKind, rdev: u64) -> OpFuture<()> {
        let request = ProxyRequest::Mknod {
            storage_id: self.storage_id(),
            file_id: file_id.to_string(),
            mode,
            kind,
            rdev,
        };
        expect_done!(
            round_trip(&self.connection, &self.metrics, "mknod", self.timeout, &request),
            "mknod"
        )
    }

    fn mkdir(&self, file_id: &str, mode: Mode) -> OpFuture<()> {
        let request = ProxyRequest::Mkdir {
            storage_id: self.storage_id(),
            file_id: file_id.to_string(),
            mode,
        };
        expect_done!(
            round_trip(&self.connection, &self.metrics, "mkdir", self.timeout, &request),
            "mkdir"
        )
    }

    fn unlink(&self, file_id: &str, current_size: Option<u64>) -> OpFuture<()> {
        let request = ProxyRequest::Unlink {
            storage_id: self.storage_id(),
            file_id: file_id.to_string(),
            current_size,
        };
        expect_done!(
            round_trip(&self.connection, &self.metrics, "unlink", self.timeout, &request),
            "unlink"
        )
    }

    fn rmdir(&self, file_id: &str) -> OpFuture<()> {
        let request = ProxyRequest::Rmdir {
            storage_id: self.storage_id(),
            file_id: file_id.to_string(),
        };
        expect_done!(
            round_trip(&self.connection, &self.metrics, "rmdir", self.timeout, &request),
            "rmdir"
        )
    }

    fn symlink(&self, from: &str, to: &str) -> OpFuture<()> {
        let request = ProxyRequest::Symlink {
            storage_id: self.storage_id(),
            from: from.to_string(),
            to: to.to_string(),
        };
        expect_done!(
            round_trip(&self.connection, &self.metrics, "symlink", self.timeout, &request),
            "symlink"
        )
    }

    fn link(&self, from: &str, to: &str) -> OpFuture<()> {
        let request = ProxyRequest::Link {
            storage_id: self.storage_id(),
            from: from.to_string(),
            to: to.to_string(),
        };
        expect_done!(
            round_trip(&self.connection, &self.metrics, "link", self.timeout, &request),
            "link"
        )
    }

    fn rename(&self, from: &str, to: &str) -> OpFuture<()> {
        let request = ProxyRequest::Rename {
            storage_id: self.storage_id(),
            from: from.to_string(),
            to: to.to_string(),
        };
        expect_done!(
            round_trip(&self.connection, &self.metrics, "rename", self.timeout, &request),
            "rename"
        )
    }

    fn chmod(&self, file_id: &str, mode: Mode) -> OpFuture<()> {
        let request = ProxyRequest::Chmod {
            storage_id: self.storage_id(),
            file_id: file_id.to_string(),
            mode,
        };
        expect_done!(
            round_trip(&self.connection, &self.metrics, "chmod", self.timeout, &request),
            "chmod"
        )
    }

    fn chown(&self, file_id: &str, uid: Option<u32>, gid: Option<u32>) -> OpFuture<()> {
        let request = ProxyRequest::Chown {
            storage_id: self.storage_id(),
            file_id: file_id.to_string(),
            uid,
            gid,
        };
        expect_done!(
            round_trip(&self.connection, &self.metrics, "chown", self.timeout, &request),
            "chown"
        )
    }

    fn truncate(&self, file_id: &str, size: u64, current_size: Option<u64>) -> OpFuture<()> {
        let request = ProxyRequest::Truncate {
            storage_id: self.storage_id(),
            file_id: file_id.to_string(),
            size,
            current_size,
        };
        expect_done!(
            round_trip(&self.connection, &self.metrics, "truncate", self.timeout, &request),
            "truncate"
        )
    }

    fn open(
        &self,
        file_id: &str,
        _flags: OpenFlags,
        open_params: &Params,
    ) -> OpFuture<Arc<dyn FileHandle>> {
        let handle: Arc<dyn FileHandle> = Arc::new(ProxyFileHandle {
            file_id: file_id.to_string(),
            storage_id: self.storage_id.clone(),
            open_params: open_params.clone(),
            connection: self.connection.clone(),
            timeout: self.timeout,
            metrics: self.metrics.clone(),
            needs_release: AtomicBool::new(true),
        });
        OpFuture::ready(Ok(handle))
    }

    fn getxattr(&self, file_id: &str, name: &str) -> OpFuture<Vec<u8>> {
        let request = ProxyRequest::Getxattr {
            storage_id: self.storage_id(),
            file_id: file_id.to_string(),
            name: name.to_string(),
        };
        round_trip(&self.connection, &self.metrics, "getxattr", self.timeout, &request).map(
            |result| match result? {
                ProxyResponse::Xattr { value } => Ok(value),
                _ => Err(unexpected("getxattr")),
            },
        )
    }

    fn setxattr(
        &self,
        file_id: &str,
        name: &str,
        value: &[u8],
        create: bool,
        replace: bool,
    ) -> OpFuture<()> {
        let request = ProxyRequest::Setxattr {
            storage_id: self.storage_id(),
            file_id: file_id.to_string(),
            name: name.to_string(),
            value: value.to_vec(),
            create,
            replace,
        };
        expect_done!(
            round_trip(&self.connection, &self.metrics, "setxattr", self.timeout, &request),
            "setxattr"
        )
    }

    fn removexattr(&self, file_id: &str, name: &str) -> OpFuture<()> {
        let request = ProxyRequest::Removexattr {
            storage_id: self.storage_id(),
            file_id: file_id.to_string(),
            name: name.to_string(),
        };
        expect_done!(
            round_trip(&self.connection, &self.metrics, "removexattr", self.timeout, &request),
            "removexattr"
        )
    }

    fn listxattr(&self, file_id: &str) -> OpFuture<Vec<String>> {
        let request = ProxyRequest::Listxattr {
            storage_id: self.storage_id(),
            file_id: file_id.to_string(),
        };
        round_trip(&self.connection, &self.metrics, "listxattr", self.timeout, &request).map(
            |result| match result? {
                ProxyResponse::XattrNames { names } => Ok(names),
                _ => Err(unexpected("listxattr")),
            },
        )
    }
}

/// Handle whose backend token is an RPC session: every read and write is
/// forwarded with the storage id, file id and original open parameters.
pub struct ProxyFileHandle {
    file_id: String,
    storage_id: String,
    open_params: Params,
    connection: ProxyConnection,
    timeout: Duration,
    metrics: Option<SharedMetricsRegistry>,
    needs_release: AtomicBool,
}

impl FileHandle for ProxyFileHandle {
    fn file_id(&self) -> &str {
        &self.file_id
    }

    fn read(&self, offset: u64, size: usize) -> OpFuture<Vec<u8>> {
        let request = ProxyRequest::Read {
            storage_id: self.storage_id.clone(),
            file_id: self.file_id.clone(),
            offset,
            size,
            params: self.open_params.clone(),
        };
        let metrics = self.metrics.clone();
        let timer = metrics.as_ref().map(|m| m.timer("proxy.read"));
        round_trip(&self.connection, &None, "read", self.timeout, &request).map(move |result| {
            match result {
                Ok(ProxyResponse::Data { data }) => {
                    if let Some(timer) = timer {
                        timer.stop(data.len() as u64);
                    }
                    Ok(data)
                }
                Ok(_) => Err(unexpected("read")),
                Err(err) => {
                    if let Some(metrics) = &metrics {
                        metrics.inc_counter("proxy.errors.read", 1);
                    }
                    Err(err)
                }
            }
        })
    }

    fn write(&self, offset: u64, data: Vec<u8>) -> OpFuture<usize> {
        let size = data.len();
        let request = ProxyRequest::Write {
            storage_id: self.storage_id.clone(),
            file_id: self.file_id.clone(),
            offset,
            data,
            params: self.open_params.clone(),
        };
        let metrics = self.metrics.clone();
        let timer = metrics.as_ref().map(|m| m.timer("proxy.write"));
        round_trip(&self.connection, &None, "write", self.timeout, &request).map(move |result| {
            match result {
                Ok(ProxyResponse::Written { written }) => {
                    if let Some(timer) = timer {
                        timer.stop(written.min(size) as u64);
                    }
                    Ok(written)
                }
                Ok(_) => Err(unexpected("write")),
                Err(err) => {
                    if let Some(metrics) = &metrics {
                        metrics.inc_counter("proxy.errors.write", 1);
                    }
                    Err(err)
                }
            }
        })
    }

    fn fsync(&self, data_only: bool) -> OpFuture<()> {
        let request = ProxyRequest::Fsync {
            storage_id: self.storage_id.clone(),
            file_id: self.file_id.clone(),
            data_only,
        };
        expect_done!(
            round_trip(&self.connection, &self.metrics, "fsync", self.timeout, &request),
            "fsync"
        )
    }

    fn release(&self) -> OpFuture<()> {
        // The remote peer tracks no per-open state for proxied files.
        self.needs_release.swap(false, Ordering::AcqRel);
        OpFuture::ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingCommunicator {
        sent: Mutex<Vec<(i64, Vec<u8>)>>,
        fail: AtomicBool,
    }

    impl Communicator for RecordingCommunicator {
        fn send(&self, message_id: i64, payload: Vec<u8>) -> Result<(), HelperError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(HelperError::new(
                    ErrorKind::NetworkUnreachable,
                    "channel down",
                ));
            }
            self.sent.lock().unwrap().push((message_id, payload));
            Ok(())
        }
    }

    fn fixture() -> (Arc<RecordingCommunicator>, ProxyConnection) {
        let communicator = Arc::new(RecordingCommunicator::default());
        let connection = ProxyConnection::new(communicator.clone());
        (communicator, connection)
    }

    #[test]
    fn replies_are_correlated_by_message_id() {
        let (communicator, connection) = fixture();
        let first = connection.call(b"one".to_vec(), Duration::from_secs(1));
        let second = connection.call(b"two".to_vec(), Duration::from_secs(1));
        let sent = communicator.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].0 > 0 && sent[1].0 > sent[0].0);
        // Complete out of order.
        connection.deliver(sent[1].0, b"reply-two".to_vec());
        connection.deliver(sent[0].0, b"reply-one".to_vec());
        assert_eq!(first.wait().unwrap(), b"reply-one");
        assert_eq!(second.wait().unwrap(), b"reply-two");
    }

    #[test]
    fn negative_ids_and_unmatched_replies_reach_the_push_callback() {
        let (_, connection) = fixture();
        let pushed = Arc::new(Mutex::new(Vec::new()));
        let sink = pushed.clone();
        connection.set_push_callback(move |payload| sink.lock().unwrap().push(payload));
        connection.deliver(-7, b"server-push".to_vec());
        connection.deliver(9999, b"nobody-waiting".to_vec());
        let pushed = pushed.lock().unwrap();
        assert_eq!(pushed.len(), 2);
        assert_eq!(pushed[0], b"server-push");
        assert_eq!(pushed[1], b"nobody-waiting");
    }

    #[test]
    fn unanswered_calls_time_out() {
        let (_, connection) = fixture();
        let future = connection.call(b"ping".to_vec(), Duration::from_millis(30));
        assert_eq!(future.wait().unwrap_err().kind(), ErrorKind::TimedOut);
    }

    #[test]
    fn send_failures_resolve_the_future() {
        let (communicator, connection) = fixture();
        communicator.fail.store(true, Ordering::SeqCst);
        let future = connection.call(b"ping".to_vec(), Duration::from_secs(1));
        assert_eq!(
            future.wait().unwrap_err().kind(),
            ErrorKind::NetworkUnreachable
        );
    }

    #[test]
    fn helper_round_trip_decodes_typed_responses() {
        let (communicator, connection) = fixture();
        let helper = ProxyHelper::new("storage-1", connection.clone(), Duration::from_secs(1));
        let future = helper.getattr("some/file");
        let (message_id, payload) = communicator.sent.lock().unwrap()[0].clone();
        let request: ProxyRequest = serde_json::from_slice(&payload).unwrap();
        match request {
            ProxyRequest::Getattr {
                storage_id,
                file_id,
            } => {
                assert_eq!(storage_id, "storage-1");
                assert_eq!(file_id, "some/file");
            }
            other => panic!("unexpected request: {other:?}"),
        }
        let response = ProxyResponse::Stat {
            stat: Stat::regular(321, 0o640),
        };
        connection.deliver(message_id, serde_json::to_vec(&response).unwrap());
        let stat = future.wait().unwrap();
        assert_eq!(stat.size, 321);
    }

    #[test]
    fn remote_errors_surface_as_values() {
        let (communicator, connection) = fixture();
        let helper = ProxyHelper::new("storage-1", connection.clone(), Duration::from_secs(1));
        let future = helper.unlink("gone", Some(100));
        let (message_id, _) = communicator.sent.lock().unwrap()[0].clone();
        let response = ProxyResponse::Error {
            kind: ErrorKind::NotFound,
            errno: Some(libc::ENOENT),
            message: "no such file".to_string(),
        };
        connection.deliver(message_id, serde_json::to_vec(&response).unwrap());
        let err = future.wait().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.errno(), Some(libc::ENOENT));
    }
}
