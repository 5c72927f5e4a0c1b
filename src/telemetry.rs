//! Metric sinks for the storage helpers.
//!
//! Two instrument families, matching what the helpers emit:
//! counters (`comp.helpers.mod.<backend>.<op>.retries`,
//! `comp.helpers.mod.<backend>.errors.{read,write}`) and per-operation
//! timers (`comp.helpers.mod.<backend>.<op>`) that accumulate call count,
//! elapsed time and transferred bytes. The registry is sharded so worker
//! threads on different backends do not contend on one lock.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

const METRICS_SHARD_COUNT: usize = 8;

/// Namespace every helper metric lives under.
pub const HELPER_METRICS_NAMESPACE: &str = "comp.helpers.mod";

#[derive(Debug, Clone)]
pub struct SharedMetricsRegistry {
    prefix: Arc<String>,
    shards: Arc<Vec<Mutex<MetricsShard>>>,
}

#[derive(Debug, Default)]
struct MetricsShard {
    counters: HashMap<String, Arc<CounterCell>>,
    timers: HashMap<String, Arc<TimerCell>>,
}

#[derive(Debug)]
struct CounterCell {
    value: AtomicU64,
}

#[derive(Debug, Default)]
struct TimerCell {
    calls: AtomicU64,
    nanos: AtomicU64,
    bytes: AtomicU64,
}

/// Point-in-time view of one timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerSnapshot {
    pub calls: u64,
    pub nanos: u64,
    pub bytes: u64,
}

/// Point-in-time view of the whole registry.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub counters: HashMap<String, u64>,
    pub timers: HashMap<String, TimerSnapshot>,
}

impl SharedMetricsRegistry {
    pub fn new() -> Self {
        Self::with_namespace(HELPER_METRICS_NAMESPACE)
    }

    pub fn with_namespace(namespace: impl Into<String>) -> Self {
        let raw = namespace.into();
        let prefix = if raw.ends_with('.') {
            raw
        } else {
            format!("{raw}.")
        };
        let shards = (0..METRICS_SHARD_COUNT)
            .map(|_| Mutex::new(MetricsShard::default()))
            .collect();
        Self {
            prefix: Arc::new(prefix),
            shards: Arc::new(shards),
        }
    }

    pub fn inc_counter(&self, name: &str, delta: u64) -> u64 {
        let key = self.qualify(name);
        let cell = {
            let mut shard = self.lock_shard(&key);
            shard
                .counters
                .entry(key)
                .or_insert_with(|| {
                    Arc::new(CounterCell {
                        value: AtomicU64::new(0),
                    })
                })
                .clone()
        };
        saturating_add(&cell.value, delta)
    }

    pub fn counter_value(&self, name: &str) -> u64 {
        let key = self.qualify(name);
        let shard = self.lock_shard(&key);
        shard
            .counters
            .get(&key)
            .map(|cell| cell.value.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Starts a timer for one operation; `stop(n_bytes)` records it.
    pub fn timer(&self, name: &str) -> TimerGuard {
        TimerGuard {
            registry: self.clone(),
            name: self.qualify(name),
            started_at: Instant::now(),
        }
    }

    pub fn timer_snapshot(&self, name: &str) -> TimerSnapshot {
        let key = self.qualify(name);
        let shard = self.lock_shard(&key);
        shard
            .timers
            .get(&key)
            .map(|cell| cell.snapshot())
            .unwrap_or(TimerSnapshot {
                calls: 0,
                nanos: 0,
                bytes: 0,
            })
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut snapshot = MetricsSnapshot::default();
        for shard in self.shards.iter() {
            let guard = match shard.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            for (name, cell) in guard.counters.iter() {
                snapshot
                    .counters
                    .insert(name.clone(), cell.value.load(Ordering::Relaxed));
            }
            for (name, cell) in guard.timers.iter() {
                snapshot.timers.insert(name.clone(), cell.snapshot());
            }
        }
        snapshot
    }

    fn record_timer(&self, qualified: &str, nanos: u64, bytes: u64) {
        let cell = {
            let mut shard = self.lock_shard(qualified);
            shard
                .timers
                .entry(qualified.to_string())
                .or_insert_with(|| Arc::new(TimerCell::default()))
                .clone()
        };
        saturating_add(&cell.calls, 1);
        saturating_add(&cell.nanos, nanos);
        saturating_add(&cell.bytes, bytes);
    }

    fn shard_for(&self, key: &str) -> &Mutex<MetricsShard> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    fn lock_shard(&self, key: &str) -> std::sync::MutexGuard<'_, MetricsShard> {
        match self.shard_for(key).lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn qualify(&self, name: &str) -> String {
        if name.starts_with(self.prefix.as_str()) {
            name.to_string()
        } else {
            format!("{}{}", self.prefix, name)
        }
    }
}

impl Default for SharedMetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerCell {
    fn snapshot(&self) -> TimerSnapshot {
        TimerSnapshot {
            calls: self.calls.load(Ordering::Relaxed),
            nanos: self.nanos.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }
}

/// Live timer handed out by [`SharedMetricsRegistry::timer`]. Dropping
/// the guard without calling [`TimerGuard::stop`] records nothing.
pub struct TimerGuard {
    registry: SharedMetricsRegistry,
    name: String,
    started_at: Instant,
}

impl TimerGuard {
    pub fn stop(self, n_bytes: u64) {
        let elapsed = self.started_at.elapsed().as_nanos().min(u64::MAX as u128) as u64;
        self.registry.record_timer(&self.name, elapsed, n_bytes);
    }
}

fn saturating_add(cell: &AtomicU64, delta: u64) -> u64 {
    let mut current = cell.load(Ordering::Relaxed);
    loop {
        let next = current.saturating_add(delta);
        match cell.compare_exchange(current, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => current = actual,
        }
    }
}
