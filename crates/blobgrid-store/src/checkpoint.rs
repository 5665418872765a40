//! Checkpoint flusher
//!
//! Durable counters live in atomics and are only folded into the PG
//! superblock here. A dedicated thread wakes on the configured interval,
//! gathers every PG dirtied since the last pass, and rewrites their
//! superblocks; commit handlers never touch the meta-blk service for
//! counter updates.

use crate::pg::PgEntry;
use crate::store::BlobStore;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;
use tracing::debug;

const TICK: Duration = Duration::from_millis(50);

/// Owns the background checkpoint thread
pub struct CpManager {
    shutdown: Arc<AtomicBool>,
    progress: Arc<AtomicU8>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl CpManager {
    /// Start flushing `store` every `interval`
    pub(crate) fn start(store: Weak<BlobStore>, interval: Duration) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let progress = Arc::new(AtomicU8::new(100));

        let thread_shutdown = shutdown.clone();
        let thread_progress = progress.clone();
        let handle = thread::Builder::new()
            .name("blobgrid-cp".into())
            .spawn(move || {
                let mut since_flush = Duration::ZERO;
                loop {
                    if thread_shutdown.load(Ordering::Acquire) {
                        break;
                    }
                    thread::sleep(TICK);
                    since_flush += TICK;
                    if since_flush < interval {
                        continue;
                    }
                    since_flush = Duration::ZERO;
                    let Some(store) = store.upgrade() else { break };
                    let flushed = store.checkpoint_flush(Some(&thread_progress));
                    if flushed > 0 {
                        debug!(flushed, "checkpoint flushed PG superblocks");
                    }
                }
            })
            .expect("failed to spawn checkpoint thread");

        Self {
            shutdown,
            progress,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Progress of the current flush in `[0, 100]`, monotone within a pass
    #[must_use]
    pub fn cp_progress_percent(&self) -> u8 {
        self.progress.load(Ordering::Acquire)
    }

    /// Stop and join the flusher thread
    pub(crate) fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl BlobStore {
    /// Flush every dirty PG superblock; returns how many were written
    pub fn checkpoint_flush(&self, progress: Option<&AtomicU8>) -> usize {
        let dirty: Vec<Arc<PgEntry>> = {
            let pgs = self.pgs.read();
            pgs.values()
                .filter(|pg| pg.dirty.swap(false, Ordering::AcqRel))
                .cloned()
                .collect()
        };
        if dirty.is_empty() {
            if let Some(p) = progress {
                p.store(100, Ordering::Release);
            }
            return 0;
        }
        if let Some(p) = progress {
            p.store(0, Ordering::Release);
        }
        let total = dirty.len();
        for (i, pg) in dirty.iter().enumerate() {
            self.persist_pg_superblk(pg);
            if let Some(p) = progress {
                p.store((((i + 1) * 100) / total) as u8, Ordering::Release);
            }
        }
        total
    }
}
