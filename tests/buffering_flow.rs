//! Buffered object-store traffic: coalescing, read-back, batching.
#![cfg(feature = "objectstore")]

mod support;

use std::sync::Arc;
use std::time::Duration;
use storfab::{
    delete_objects_batched, BufferLimits, BufferedHelper, ExecutorPool, FileHandle, ObjectBackend,
    ObjectStoreHelper, OpenFlags, Params, Scheduler, StorageHelper,
};
use support::RecordingObjectStore;

const MIB: usize = 1024 * 1024;

struct Fixture {
    store: Arc<RecordingObjectStore>,
    helper: Arc<dyn StorageHelper>,
    pool: ExecutorPool,
    scheduler: Scheduler,
}

fn buffered_fixture() -> Fixture {
    let store = Arc::new(RecordingObjectStore::default());
    let pool = ExecutorPool::new("objectstore-io", 2);
    let scheduler = Scheduler::new(1);
    let plain = Arc::new(ObjectStoreHelper::new(
        store.clone(),
        pool.clone(),
        Duration::from_secs(10),
    ));
    let helper: Arc<dyn StorageHelper> = Arc::new(
        BufferedHelper::new(plain, scheduler.clone()).with_limits(BufferLimits {
            write_flush_threshold: 10 * MIB,
            flush_interval: Duration::from_secs(3600),
            read_ahead_bytes: MIB,
        }),
    );
    Fixture {
        store,
        helper,
        pool,
        scheduler,
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn four_mebibyte_write_issues_exactly_one_put() {
    let fx = buffered_fixture();
    let payload = pattern(4 * MIB);

    let handle = fx
        .helper
        .open("k", OpenFlags::WRITE, &Params::new())
        .wait()
        .unwrap();
    assert_eq!(handle.write(0, payload.clone()).wait().unwrap(), 4 * MIB);
    assert!(fx.store.puts.lock().unwrap().is_empty());
    handle.release().wait().unwrap();

    let puts = fx.store.puts.lock().unwrap().clone();
    assert_eq!(puts, vec![("k".to_string(), 4 * MIB)]);

    // The second mebibyte reads back byte-for-byte.
    let reader = fx
        .helper
        .open("k", OpenFlags::READ, &Params::new())
        .wait()
        .unwrap();
    let second = reader.read(MIB as u64, MIB).wait().unwrap();
    assert_eq!(second, payload[MIB..2 * MIB].to_vec());
    reader.release().wait().unwrap();

    fx.scheduler.shutdown();
    fx.pool.shutdown();
}

#[test]
fn many_small_writes_coalesce_into_one_object() {
    let fx = buffered_fixture();
    let handle = fx
        .helper
        .open("chunks", OpenFlags::WRITE, &Params::new())
        .wait()
        .unwrap();
    let mut offset = 0u64;
    for _ in 0..64 {
        let chunk = pattern(1024);
        handle.write(offset, chunk).wait().unwrap();
        offset += 1024;
    }
    handle.release().wait().unwrap();
    let puts = fx.store.puts.lock().unwrap().clone();
    assert_eq!(puts.len(), 1);
    assert_eq!(puts[0].1, 64 * 1024);
    fx.scheduler.shutdown();
    fx.pool.shutdown();
}

#[test]
fn buffered_reads_observe_unflushed_writes() {
    let fx = buffered_fixture();
    fx.store
        .put_object("mixed", &pattern(64))
        .expect("seed object");
    fx.store.puts.lock().unwrap().clear();

    let handle = fx
        .helper
        .open("mixed", OpenFlags::READ_WRITE, &Params::new())
        .wait()
        .unwrap();
    handle.write(0, vec![0xAB; 16]).wait().unwrap();
    let data = handle.read(0, 32).wait().unwrap();
    assert_eq!(&data[..16], &[0xAB; 16]);
    assert_eq!(&data[16..32], &pattern(64)[16..32]);
    // Still nothing flushed.
    assert!(fx.store.puts.lock().unwrap().is_empty());
    handle.release().wait().unwrap();
    fx.scheduler.shutdown();
    fx.pool.shutdown();
}

#[test]
fn unbuffered_handles_reject_sparse_writes_buffered_ones_do_not() {
    let store = Arc::new(RecordingObjectStore::default());
    let pool = ExecutorPool::new("sparse-io", 1);
    let helper = ObjectStoreHelper::new(store, pool.clone(), Duration::from_secs(5));
    let handle = helper
        .open("sparse", OpenFlags::WRITE, &Params::new())
        .wait()
        .unwrap();
    let err = handle.write(4096, vec![1, 2, 3]).wait().unwrap_err();
    assert_eq!(err.kind(), storfab::ErrorKind::NotSupported);
    pool.shutdown();
}

#[test]
fn bulk_delete_batches_cap_at_one_thousand_keys() {
    let store = RecordingObjectStore::default();
    let keys: Vec<String> = (0..1500).map(|i| format!("k{i}")).collect();
    delete_objects_batched(&store, &keys).unwrap();
    assert_eq!(*store.delete_batches.lock().unwrap(), vec![1000, 500]);
}
