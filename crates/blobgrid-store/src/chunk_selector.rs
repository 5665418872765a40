//! Chunk selection and per-PG chunk ownership
//!
//! A process-wide pool of fixed-size chunks, grouped by device. PG creation
//! reserves whole chunks from the single device with the most available;
//! shard creation pins one of the PG's chunks (addressed by its virtual
//! chunk id). Physical chunk ids are replica-local; virtual ids are dense
//! per PG and stable across replicas.
//!
//! All state is behind one internal mutex; every operation is a short
//! critical section safe to call from the commit path.

use blobgrid_common::{ChunkNum, DeviceConfig, PgId};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use tracing::warn;

struct ChunkState {
    dev_id: u32,
    assigned_pg: Option<PgId>,
}

struct PgChunks {
    /// v_chunk -> p_chunk
    chunks: Vec<ChunkNum>,
    /// v_chunk -> owned by a shard
    busy: Vec<bool>,
}

#[derive(Default)]
struct Inner {
    chunks: HashMap<ChunkNum, ChunkState>,
    /// Unassigned chunks per device; rebuilt by `recover_per_dev_chunk_heap`
    free_by_dev: HashMap<u32, BTreeSet<ChunkNum>>,
    pgs: HashMap<PgId, PgChunks>,
}

/// Tracks chunk availability per device and chunk ownership per PG
pub struct ChunkSelector {
    chunk_size: u64,
    blk_size: u32,
    inner: Mutex<Inner>,
}

impl ChunkSelector {
    /// Build the pool from the configured devices.
    ///
    /// Physical chunk ids are dense and start at 1. The per-device free
    /// lists stay empty until `recover_per_dev_chunk_heap` runs, so that
    /// recovery can first carve out every chunk already owned by a PG.
    #[must_use]
    pub fn new(chunk_size: u64, blk_size: u32, devices: &[DeviceConfig]) -> Self {
        let mut inner = Inner::default();
        let mut next_chunk: ChunkNum = 1;
        for dev in devices {
            inner.free_by_dev.entry(dev.dev_id).or_default();
            for _ in 0..dev.num_chunks {
                inner.chunks.insert(
                    next_chunk,
                    ChunkState {
                        dev_id: dev.dev_id,
                        assigned_pg: None,
                    },
                );
                next_chunk += 1;
            }
        }
        Self {
            chunk_size,
            blk_size,
            inner: Mutex::new(inner),
        }
    }

    /// Uniform chunk size in bytes
    #[must_use]
    pub fn get_chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Maximum number of free chunks on any single device
    #[must_use]
    pub fn most_avail_num_chunks(&self) -> u32 {
        let inner = self.inner.lock();
        inner
            .free_by_dev
            .values()
            .map(|s| s.len() as u32)
            .max()
            .unwrap_or(0)
    }

    /// Total registered chunks
    #[must_use]
    pub fn total_chunks(&self) -> u32 {
        self.inner.lock().chunks.len() as u32
    }

    /// Atomically reserve `⌊size_bytes / chunk_size⌋` chunks for `pg_id`.
    ///
    /// All chunks come from the single device with the most available.
    /// Returns the reservation count, or `None` when no device has enough
    /// free chunks. Re-selecting for an already-known PG is a no-op
    /// returning its existing count.
    pub fn select_chunks_for_pg(&self, pg_id: PgId, size_bytes: u64) -> Option<u32> {
        let needed = (size_bytes / self.chunk_size) as u32;
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.pgs.get(&pg_id) {
            return Some(existing.chunks.len() as u32);
        }
        let (&dev_id, _) = inner
            .free_by_dev
            .iter()
            .max_by_key(|(_, free)| free.len())?;
        let free = inner.free_by_dev.get_mut(&dev_id)?;
        if (free.len() as u32) < needed {
            warn!(pg_id, needed, avail = free.len(), "not enough free chunks");
            return None;
        }
        let picked: Vec<ChunkNum> = free.iter().take(needed as usize).copied().collect();
        for &c in &picked {
            free.remove(&c);
        }
        for &c in &picked {
            if let Some(state) = inner.chunks.get_mut(&c) {
                state.assigned_pg = Some(pg_id);
            }
        }
        inner.pgs.insert(
            pg_id,
            PgChunks {
                busy: vec![false; picked.len()],
                chunks: picked,
            },
        );
        Some(needed)
    }

    /// The PG's ordered p-chunk list (entry `i` backs v_chunk `i`)
    #[must_use]
    pub fn get_pg_chunks(&self, pg_id: PgId) -> Option<Vec<ChunkNum>> {
        self.inner.lock().pgs.get(&pg_id).map(|p| p.chunks.clone())
    }

    /// Resolve a virtual chunk to its physical chunk on this replica
    #[must_use]
    pub fn v_to_p(&self, pg_id: PgId, v_chunk: ChunkNum) -> Option<ChunkNum> {
        self.inner
            .lock()
            .pgs
            .get(&pg_id)
            .and_then(|p| p.chunks.get(v_chunk as usize).copied())
    }

    /// Lowest virtual chunk of the PG not yet owned by a shard
    #[must_use]
    pub fn preselect_v_chunk(&self, pg_id: PgId) -> Option<ChunkNum> {
        self.inner.lock().pgs.get(&pg_id).and_then(|p| {
            p.busy
                .iter()
                .position(|&busy| !busy)
                .map(|v| v as ChunkNum)
        })
    }

    /// Claim a virtual chunk for a shard; false when unknown or already owned
    pub fn try_mark_busy(&self, pg_id: PgId, v_chunk: ChunkNum) -> bool {
        let mut inner = self.inner.lock();
        let Some(pg) = inner.pgs.get_mut(&pg_id) else {
            return false;
        };
        match pg.busy.get_mut(v_chunk as usize) {
            Some(slot) if !*slot => {
                *slot = true;
                true
            }
            _ => false,
        }
    }

    /// Return a virtual chunk to the PG's free pool.
    ///
    /// Idempotent so that a log rollback can re-release safely; false only
    /// when the PG or chunk index is unknown.
    pub fn release_v_chunk(&self, pg_id: PgId, v_chunk: ChunkNum) -> bool {
        let mut inner = self.inner.lock();
        let Some(pg) = inner.pgs.get_mut(&pg_id) else {
            return false;
        };
        match pg.busy.get_mut(v_chunk as usize) {
            Some(slot) => {
                *slot = false;
                true
            }
            None => false,
        }
    }

    /// Restore a PG's chunk list during superblock recovery
    pub fn recover_pg_chunks(&self, pg_id: PgId, chunks: Vec<ChunkNum>) -> bool {
        let mut inner = self.inner.lock();
        if inner.pgs.contains_key(&pg_id) {
            return false;
        }
        for &c in &chunks {
            match inner.chunks.get(&c) {
                Some(state) if state.assigned_pg.is_none() => {}
                _ => {
                    warn!(pg_id, chunk = c, "chunk missing or already assigned");
                    return false;
                }
            }
        }
        for &c in &chunks {
            if let Some(state) = inner.chunks.get_mut(&c) {
                state.assigned_pg = Some(pg_id);
            }
        }
        inner.pgs.insert(
            pg_id,
            PgChunks {
                busy: vec![false; chunks.len()],
                chunks,
            },
        );
        true
    }

    /// Rebuild the per-device free lists once every PG has been recovered
    pub fn recover_per_dev_chunk_heap(&self) {
        let mut inner = self.inner.lock();
        let mut free_by_dev: HashMap<u32, BTreeSet<ChunkNum>> = inner
            .free_by_dev
            .keys()
            .map(|&d| (d, BTreeSet::new()))
            .collect();
        for (&chunk, state) in &inner.chunks {
            free_by_dev.entry(state.dev_id).or_default();
            if state.assigned_pg.is_none() {
                free_by_dev.get_mut(&state.dev_id).unwrap().insert(chunk);
            }
        }
        inner.free_by_dev = free_by_dev;
    }

    /// Chunks of the PG not owned by any shard
    #[must_use]
    pub fn avail_num_chunks(&self, pg_id: PgId) -> u32 {
        self.inner
            .lock()
            .pgs
            .get(&pg_id)
            .map_or(0, |p| p.busy.iter().filter(|&&b| !b).count() as u32)
    }

    /// Free blocks across the PG's unowned chunks
    #[must_use]
    pub fn avail_blks(&self, pg_id: PgId) -> u64 {
        u64::from(self.avail_num_chunks(pg_id)) * (self.chunk_size / u64::from(self.blk_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHUNK_SIZE: u64 = 1 << 20;
    const BLK_SIZE: u32 = 1024;

    fn selector(devs: &[(u32, u32)]) -> ChunkSelector {
        let devices: Vec<DeviceConfig> = devs
            .iter()
            .map(|&(dev_id, num_chunks)| DeviceConfig { dev_id, num_chunks })
            .collect();
        let sel = ChunkSelector::new(CHUNK_SIZE, BLK_SIZE, &devices);
        sel.recover_per_dev_chunk_heap();
        sel
    }

    #[test]
    fn selects_from_most_available_device() {
        let sel = selector(&[(0, 2), (1, 6)]);
        assert_eq!(sel.most_avail_num_chunks(), 6);

        let n = sel.select_chunks_for_pg(1, 4 * CHUNK_SIZE).unwrap();
        assert_eq!(n, 4);
        assert_eq!(sel.most_avail_num_chunks(), 2);

        // All four came from device 1 (chunk ids 3..=8 belong to it).
        let chunks = sel.get_pg_chunks(1).unwrap();
        assert_eq!(chunks.len(), 4);
        assert!(chunks.iter().all(|&c| c >= 3));
    }

    #[test]
    fn insufficient_space_returns_none() {
        let sel = selector(&[(0, 2)]);
        assert!(sel.select_chunks_for_pg(1, 3 * CHUNK_SIZE).is_none());
        // Nothing was reserved by the failed attempt.
        assert_eq!(sel.most_avail_num_chunks(), 2);
        assert!(sel.select_chunks_for_pg(1, 2 * CHUNK_SIZE).is_some());
    }

    #[test]
    fn reselect_is_idempotent() {
        let sel = selector(&[(0, 8)]);
        assert_eq!(sel.select_chunks_for_pg(1, 2 * CHUNK_SIZE), Some(2));
        assert_eq!(sel.select_chunks_for_pg(1, 2 * CHUNK_SIZE), Some(2));
        assert_eq!(sel.most_avail_num_chunks(), 6);
    }

    #[test]
    fn busy_marking_and_idempotent_release() {
        let sel = selector(&[(0, 4)]);
        sel.select_chunks_for_pg(7, 2 * CHUNK_SIZE).unwrap();
        assert_eq!(sel.avail_num_chunks(7), 2);

        assert_eq!(sel.preselect_v_chunk(7), Some(0));
        assert!(sel.try_mark_busy(7, 0));
        assert!(!sel.try_mark_busy(7, 0));
        assert_eq!(sel.preselect_v_chunk(7), Some(1));
        assert_eq!(sel.avail_num_chunks(7), 1);
        assert_eq!(
            sel.avail_blks(7),
            CHUNK_SIZE / u64::from(BLK_SIZE)
        );

        assert!(sel.release_v_chunk(7, 0));
        assert!(sel.release_v_chunk(7, 0));
        assert_eq!(sel.avail_num_chunks(7), 2);
        assert!(!sel.release_v_chunk(7, 9));
        assert!(!sel.release_v_chunk(8, 0));
    }

    #[test]
    fn recovery_rebuilds_free_lists() {
        let sel = ChunkSelector::new(
            CHUNK_SIZE,
            BLK_SIZE,
            &[DeviceConfig { dev_id: 0, num_chunks: 4 }],
        );
        // Free lists are not populated before the heap-recovery pass.
        assert_eq!(sel.most_avail_num_chunks(), 0);

        assert!(sel.recover_pg_chunks(3, vec![2, 4]));
        assert!(!sel.recover_pg_chunks(5, vec![2])); // already assigned
        sel.recover_per_dev_chunk_heap();

        assert_eq!(sel.most_avail_num_chunks(), 2);
        assert_eq!(sel.v_to_p(3, 0), Some(2));
        assert_eq!(sel.v_to_p(3, 1), Some(4));
        assert_eq!(sel.v_to_p(3, 2), None);
    }
}
