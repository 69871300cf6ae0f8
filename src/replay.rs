//! Consumed-assertion tracking.
//!
//! An assertion ID is remembered until the assertion itself would have
//! expired; after that the time window rejects it anyway.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc, Arc, Mutex, PoisonError,
    },
    thread,
};

use time::OffsetDateTime;
use tracing::{debug, info};

const PRUNE_EVERY_INSERTS: usize = 1024;

/// Records assertion IDs that have already been accepted.
pub trait ReplayStore: Send + Sync {
    /// Atomically records `id` until `expires_at`, inclusive. Returns `false`
    /// when the ID is already present and unexpired at `now`; of any number of
    /// concurrent calls with the same ID exactly one sees `true`.
    fn insert_if_absent(&self, id: &str, expires_at: OffsetDateTime, now: OffsetDateTime) -> bool;
}

/// Process-local store. A multi-node deployment needs a shared store behind
/// the same trait.
#[derive(Debug, Default)]
pub struct InMemoryReplayCache {
    entries: Mutex<HashMap<String, OffsetDateTime>>,
    inserts: AtomicUsize,
}

impl InMemoryReplayCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops entries whose expiry lies before `now`.
    pub fn prune_expired(&self, now: OffsetDateTime) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, expires_at| *expires_at >= now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Prunes on a background thread every `interval` until the handle is
    /// stopped or dropped.
    pub fn spawn_pruner(self: Arc<Self>, interval: std::time::Duration) -> PrunerHandle {
        let (stop, stopped) = mpsc::channel::<()>();
        let thread = thread::spawn(move || {
            info!(interval_ms = interval.as_millis() as u64, "replay cache pruner started");
            while let Err(mpsc::RecvTimeoutError::Timeout) = stopped.recv_timeout(interval) {
                let evicted = self.prune_expired(OffsetDateTime::now_utc());
                debug!(evicted, remaining = self.len(), "replay cache pruned");
            }
            info!("replay cache pruner stopped");
        });
        PrunerHandle {
            stop: Some(stop),
            thread: Some(thread),
        }
    }
}

impl ReplayStore for InMemoryReplayCache {
    fn insert_if_absent(&self, id: &str, expires_at: OffsetDateTime, now: OffsetDateTime) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        let inserts = self.inserts.fetch_add(1, Ordering::Relaxed);
        if inserts % PRUNE_EVERY_INSERTS == PRUNE_EVERY_INSERTS - 1 {
            entries.retain(|_, expiry| *expiry >= now);
        }

        match entries.get(id) {
            Some(existing) if *existing >= now => false,
            _ => {
                entries.insert(id.to_string(), expires_at);
                true
            }
        }
    }
}

/// Stops the pruning thread when stopped explicitly or dropped.
#[derive(Debug)]
pub struct PrunerHandle {
    stop: Option<mpsc::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl PrunerHandle {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // Dropping the sender wakes the thread with `Disconnected`.
        self.stop.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for PrunerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
