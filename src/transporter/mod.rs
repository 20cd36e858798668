//! [`Transporter`] — the background worker pool that drains a
//! [`crate::limbo::Buffer`]-backed [`BufferedStore`] into its durable
//! [`crate::database::Database`].
//!
//! Shared `Arc` state and `tracing` pass-timing drive a small pool of
//! worker threads, each repeatedly draining a batch and backing off when a
//! pass comes up empty. The supervisor's restart mechanism is cooperative
//! cancellation via an `AtomicBool` stop flag checked between passes, not a
//! thread interrupt, so a hung worker is detected by a stale heartbeat
//! rather than force-killed.

#[cfg(test)]
mod tests;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::buffered_store::BufferedStore;

/// Tunables for a [`Transporter`]'s worker pool.
#[derive(Debug, Clone)]
pub struct TransporterConfig {
    /// Number of concurrent drain workers.
    pub workers: usize,
    /// Upper bound on writes drained per pass (keeps a single pass bounded
    /// even under a large backlog).
    pub batch_size: usize,
    /// Whether a completed pass fsyncs the durable side.
    pub sync_on_pass: bool,
    /// Sleep used between passes that drained nothing, growing up to
    /// `max_idle_sleep` — there is no `Condvar` wired into [`crate::limbo::Buffer`]
    /// to block on directly, so "wait until transportable" is approximated by
    /// exponential backoff instead.
    pub idle_sleep: Duration,
    /// Ceiling for the idle backoff.
    pub max_idle_sleep: Duration,
    /// Small yielding sleep used between passes that drained a full batch
    /// (sustained activity — busy-loop rather than block).
    pub busy_sleep: Duration,
    /// How often the supervisor inspects worker stats.
    pub supervisor_interval: Duration,
    /// A worker whose last pass has been running longer than this is
    /// considered hung.
    pub hang_threshold: Duration,
}

impl Default for TransporterConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            batch_size: 4096,
            sync_on_pass: true,
            idle_sleep: Duration::from_millis(5),
            max_idle_sleep: Duration::from_millis(250),
            busy_sleep: Duration::from_millis(1),
            supervisor_interval: Duration::from_secs(5),
            hang_threshold: Duration::from_secs(30),
        }
    }
}

/// A snapshot of one worker's cumulative pass timings.
#[derive(Debug, Clone, Copy)]
pub struct PassStats {
    pub passes: u64,
    pub drained: u64,
    pub last_pass: Duration,
    pub avg_pass: Duration,
    pub since_last_pass: Duration,
}

struct WorkerStat {
    passes: AtomicU64,
    drained: AtomicU64,
    total_nanos: AtomicU64,
    last_pass_nanos: AtomicU64,
    last_heartbeat: Mutex<Instant>,
}

impl WorkerStat {
    fn new() -> Self {
        Self {
            passes: AtomicU64::new(0),
            drained: AtomicU64::new(0),
            total_nanos: AtomicU64::new(0),
            last_pass_nanos: AtomicU64::new(0),
            last_heartbeat: Mutex::new(Instant::now()),
        }
    }

    fn record_pass(&self, drained: usize, elapsed: Duration) {
        self.passes.fetch_add(1, Ordering::Relaxed);
        self.drained.fetch_add(drained as u64, Ordering::Relaxed);
        self.total_nanos.fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        self.last_pass_nanos.store(elapsed.as_nanos() as u64, Ordering::Relaxed);
        *self.last_heartbeat.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    fn heartbeat(&self) {
        *self.last_heartbeat.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    fn snapshot(&self) -> PassStats {
        let passes = self.passes.load(Ordering::Relaxed);
        let total = Duration::from_nanos(self.total_nanos.load(Ordering::Relaxed));
        let avg = if passes > 0 { total / passes as u32 } else { Duration::ZERO };
        let since_last = self
            .last_heartbeat
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed();
        PassStats {
            passes,
            drained: self.drained.load(Ordering::Relaxed),
            last_pass: Duration::from_nanos(self.last_pass_nanos.load(Ordering::Relaxed)),
            avg_pass: avg,
            since_last_pass: since_last,
        }
    }
}

fn worker_loop(id: usize, store: Arc<BufferedStore>, config: TransporterConfig, stop: Arc<AtomicBool>, stat: Arc<WorkerStat>) {
    let mut idle_backoff = config.idle_sleep;
    while !stop.load(Ordering::Relaxed) {
        stat.heartbeat();
        let started = Instant::now();
        let drained = match store.transport(config.sync_on_pass) {
            Ok(n) => n,
            Err(e) => {
                warn!(worker = id, error = %e, "transporter pass failed");
                0
            }
        };
        stat.record_pass(drained, started.elapsed());

        if drained >= config.batch_size {
            idle_backoff = config.idle_sleep;
            trace!(worker = id, drained, "transporter pass drained a full batch, continuing");
            thread::sleep(config.busy_sleep);
        } else if drained > 0 {
            idle_backoff = config.idle_sleep;
            trace!(worker = id, drained, "transporter pass drained partial batch");
            thread::sleep(config.busy_sleep);
        } else {
            thread::sleep(idle_backoff);
            idle_backoff = (idle_backoff * 2).min(config.max_idle_sleep);
        }
    }
    debug!(worker = id, "transporter worker stopped");
}

/// Whether the supervisor should tear down and respawn the worker pool:
/// any worker whose last heartbeat predates `hang_threshold`.
fn requires_restart(stats: &[PassStats], config: &TransporterConfig) -> bool {
    stats.iter().any(|s| s.since_last_pass > config.hang_threshold)
}

/// Runs N worker threads that repeatedly drain `store`'s Limbo into its
/// Durable side, plus a supervisor thread that restarts the pool if a
/// worker appears hung.
pub struct Transporter {
    store: Arc<BufferedStore>,
    config: TransporterConfig,
    stop: Arc<AtomicBool>,
    stats: Vec<Arc<WorkerStat>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Transporter {
    /// Build the worker pool and its supervisor and begin running
    /// immediately.
    pub fn start(store: Arc<BufferedStore>, config: TransporterConfig) -> Arc<Self> {
        let stats: Vec<Arc<WorkerStat>> = (0..config.workers.max(1)).map(|_| Arc::new(WorkerStat::new())).collect();
        let this = Arc::new(Self {
            store,
            config,
            stop: Arc::new(AtomicBool::new(false)),
            stats,
            handles: Mutex::new(Vec::new()),
            supervisor: Mutex::new(None),
        });
        this.spawn_workers();
        this.spawn_supervisor();
        this
    }

    fn spawn_workers(self: &Arc<Self>) {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        for (id, stat) in self.stats.iter().enumerate() {
            let store = Arc::clone(&self.store);
            let config = self.config.clone();
            let stop = Arc::clone(&self.stop);
            let stat = Arc::clone(stat);
            handles.push(thread::spawn(move || worker_loop(id, store, config, stop, stat)));
        }
        debug!(workers = handles.len(), "transporter workers started");
    }

    fn spawn_supervisor(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let interval = self.config.supervisor_interval;
        let handle = thread::spawn(move || {
            loop {
                thread::sleep(interval);
                let Some(this) = weak.upgrade() else { break };
                if this.stop.load(Ordering::Relaxed) {
                    break;
                }
                let snapshot = this.stats();
                if requires_restart(&snapshot, &this.config) {
                    warn!("transporter supervisor detected a hung worker, restarting pool");
                    this.restart();
                }
            }
        });
        *self.supervisor.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    /// A snapshot of every worker's cumulative pass statistics.
    pub fn stats(&self) -> Vec<PassStats> {
        self.stats.iter().map(|s| s.snapshot()).collect()
    }

    /// Stop the current worker threads and spawn a fresh pool in their
    /// place, leaving the supervisor running.
    pub fn restart(self: &Arc<Self>) {
        let mut handles = std::mem::take(&mut *self.handles.lock().unwrap_or_else(|e| e.into_inner()));
        self.stop.store(true, Ordering::Relaxed);
        for h in handles.drain(..) {
            let _ = h.join();
        }
        self.stop.store(false, Ordering::Relaxed);
        drop(handles);
        self.spawn_workers();
    }

    /// Stop every worker and the supervisor, blocking until all threads
    /// have exited.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Relaxed);
        for h in std::mem::take(&mut *self.handles.lock().unwrap_or_else(|e| e.into_inner())) {
            let _ = h.join();
        }
        if let Some(h) = self.supervisor.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = h.join();
        }
    }
}

impl Drop for Transporter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[allow(dead_code)]
fn _assert_send_sync<T: Send + Sync>() {}
const _: fn() = || {
    _assert_send_sync::<Transporter>();
};
