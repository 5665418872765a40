//! In-memory replication runtime
//!
//! A deterministic single-replica stand-in for the replicated block device.
//! Writes commit synchronously through the registered listener
//! (pre-commit → commit, or rollback), block payloads and the committed log
//! are retained across listener re-registration so tests can replay the log
//! against a freshly recovered store, and fault hooks cover the leadership
//! and rollback paths.

use crate::blk::{BlkAllocHints, MultiBlkId};
use crate::service::{
    ReplCtx, ReplDev, ReplListener, ReplServiceError, ReplicaMember, ReplicaStatus,
    ReplicationService, SgList,
};
use async_trait::async_trait;
use blobgrid_common::{ChunkNum, GroupId, PeerId};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

type SharedListener = Arc<Mutex<Option<Arc<dyn ReplListener>>>>;

#[derive(Clone)]
struct LogEntry {
    lsn: u64,
    header: Bytes,
    key: Bytes,
    blkid: MultiBlkId,
}

#[derive(Default)]
struct DevState {
    lsn: u64,
    next_blk: HashMap<ChunkNum, u64>,
    blocks: HashMap<(ChunkNum, u64), Bytes>,
    log: Vec<LogEntry>,
    rollback_next: bool,
}

/// One in-memory replicated device
pub struct MemReplDev {
    group_id: GroupId,
    local_peer: PeerId,
    blk_size: u32,
    leader: AtomicBool,
    members: Mutex<Vec<ReplicaMember>>,
    listener: SharedListener,
    state: Mutex<DevState>,
}

impl MemReplDev {
    fn new(
        group_id: GroupId,
        local_peer: PeerId,
        blk_size: u32,
        members: Vec<ReplicaMember>,
        listener: SharedListener,
    ) -> Self {
        Self {
            group_id,
            local_peer,
            blk_size,
            leader: AtomicBool::new(true),
            members: Mutex::new(members),
            listener,
            state: Mutex::new(DevState::default()),
        }
    }

    fn listener(&self) -> Arc<dyn ReplListener> {
        self.listener
            .lock()
            .clone()
            .expect("replication listener not registered")
    }

    /// Toggle this replica's leadership (fault hook)
    pub fn set_leader(&self, leader: bool) {
        self.leader.store(leader, Ordering::Relaxed);
    }

    /// Force the next `async_alloc_write` to roll back (fault hook)
    pub fn inject_rollback_next(&self) {
        self.state.lock().rollback_next = true;
    }

    /// Number of committed log entries
    #[must_use]
    pub fn committed_entries(&self) -> usize {
        self.state.lock().log.len()
    }

    fn replay(&self, listener: &Arc<dyn ReplListener>) {
        // Snapshot the log first; commit handlers may call back into the
        // runtime (e.g. to look up this device).
        let entries: Vec<LogEntry> = self.state.lock().log.clone();
        for entry in &entries {
            listener.on_commit(entry.lsn, &entry.header, &entry.key, &entry.blkid, None);
        }
    }
}

#[async_trait]
impl ReplDev for MemReplDev {
    fn group_id(&self) -> GroupId {
        self.group_id
    }

    fn is_leader(&self) -> bool {
        self.leader.load(Ordering::Relaxed)
    }

    fn leader_id(&self) -> PeerId {
        if self.is_leader() {
            self.local_peer
        } else {
            self.members
                .lock()
                .iter()
                .find(|m| m.id != self.local_peer)
                .map_or(self.local_peer, |m| m.id)
        }
    }

    fn blk_size(&self) -> u32 {
        self.blk_size
    }

    fn async_alloc_write(&self, header: Bytes, key: Bytes, value: SgList, ctx: ReplCtx) {
        let listener = self.listener();
        let total: usize = value.iter().map(Bytes::len).sum();

        let hints = if total > 0 {
            match listener.get_blk_alloc_hints(&header, total as u64) {
                Ok(h) => h,
                Err(e) => {
                    listener.on_error(e, &header, &key, Some(&ctx));
                    return;
                }
            }
        } else {
            BlkAllocHints::default()
        };

        let (lsn, blkid, rollback) = {
            let mut st = self.state.lock();
            st.lsn += 1;
            let lsn = st.lsn;
            let rollback = std::mem::take(&mut st.rollback_next);
            let blkid = if total > 0 {
                let chunk = hints.preferred_chunk.unwrap_or(0);
                let nblks = (total as u64).div_ceil(u64::from(self.blk_size));
                // Block 0 is never handed out so a real location can't
                // collide with the tombstone sentinel.
                let next = st.next_blk.entry(chunk).or_insert(1);
                let blk_num = *next;
                *next += nblks;
                let mut payload = BytesMut::with_capacity(total);
                for buf in &value {
                    payload.extend_from_slice(buf);
                }
                st.blocks.insert((chunk, blk_num), payload.freeze());
                MultiBlkId::single(chunk, blk_num, nblks as u16)
            } else {
                MultiBlkId {
                    chunk: 0,
                    extents: Vec::new(),
                }
            };
            (lsn, blkid, rollback)
        };

        if !listener.on_pre_commit(lsn, &header, &key, Some(&ctx)) || rollback {
            // Allocated blocks stay orphaned; nothing references them.
            debug!(group = %self.group_id, lsn, "entry rolled back");
            listener.on_rollback(lsn, &header, &key, Some(&ctx));
            return;
        }

        listener.on_commit(lsn, &header, &key, &blkid, Some(&ctx));
        self.state.lock().log.push(LogEntry {
            lsn,
            header,
            key,
            blkid,
        });
    }

    async fn async_read(&self, blkid: &MultiBlkId, size: usize) -> Result<Bytes, ReplServiceError> {
        let st = self.state.lock();
        let mut out = BytesMut::with_capacity(size);
        for extent in &blkid.extents {
            let payload = st
                .blocks
                .get(&(blkid.chunk, extent.blk_num))
                .ok_or(ReplServiceError::BadRequest)?;
            out.extend_from_slice(payload);
        }
        if out.len() < size {
            return Err(ReplServiceError::BadRequest);
        }
        out.truncate(size);
        Ok(out.freeze())
    }

    fn get_replication_status(&self) -> Vec<ReplicaStatus> {
        let lsn = self.state.lock().lsn;
        self.members
            .lock()
            .iter()
            .map(|m| ReplicaStatus {
                id: m.id,
                replication_idx: lsn,
                last_succ_resp_us: 0,
            })
            .collect()
    }
}

/// The in-memory replication service owning all groups on this node
pub struct MemReplicationRuntime {
    local_peer: PeerId,
    blk_size: u32,
    listener: SharedListener,
    devs: Mutex<Vec<Arc<MemReplDev>>>,
}

impl MemReplicationRuntime {
    /// Create a runtime for `local_peer` with the given device block size
    #[must_use]
    pub fn new(local_peer: PeerId, blk_size: u32) -> Self {
        Self {
            local_peer,
            blk_size,
            listener: Arc::new(Mutex::new(None)),
            devs: Mutex::new(Vec::new()),
        }
    }

    /// Register (or swap) the commit listener
    pub fn set_listener(&self, listener: Arc<dyn ReplListener>) {
        *self.listener.lock() = Some(listener);
    }

    /// Re-deliver every committed entry to the current listener.
    ///
    /// Commit handlers are idempotent, so this models the log-tail replay a
    /// restarted replica performs after superblock recovery.
    pub fn replay(&self) {
        let listener = self
            .listener
            .lock()
            .clone()
            .expect("replication listener not registered");
        let devs: Vec<Arc<MemReplDev>> = self.devs.lock().clone();
        for dev in &devs {
            dev.replay(&listener);
        }
    }

    /// Number of replication groups created so far
    #[must_use]
    pub fn num_groups(&self) -> usize {
        self.devs.lock().len()
    }

    /// Device handle for a group (test helper)
    #[must_use]
    pub fn dev(&self, group_id: GroupId) -> Option<Arc<MemReplDev>> {
        self.devs
            .lock()
            .iter()
            .find(|d| d.group_id == group_id)
            .cloned()
    }

    /// This node's peer id
    #[must_use]
    pub fn local_peer(&self) -> PeerId {
        self.local_peer
    }
}

#[async_trait]
impl ReplicationService for MemReplicationRuntime {
    fn register_listener(&self, listener: Arc<dyn ReplListener>) {
        self.set_listener(listener);
    }

    fn replay_log(&self) {
        self.replay();
    }

    async fn create_repl_dev(
        &self,
        group_id: GroupId,
        members: &[PeerId],
    ) -> Result<Arc<dyn ReplDev>, ReplServiceError> {
        let mut devs = self.devs.lock();
        if let Some(existing) = devs.iter().find(|d| d.group_id == group_id) {
            return Ok(existing.clone() as Arc<dyn ReplDev>);
        }
        let members = members
            .iter()
            .map(|&id| ReplicaMember::new(id, "", 0))
            .collect();
        let dev = Arc::new(MemReplDev::new(
            group_id,
            self.local_peer,
            self.blk_size,
            members,
            self.listener.clone(),
        ));
        devs.push(dev.clone());
        Ok(dev)
    }

    fn get_repl_dev(&self, group_id: GroupId) -> Result<Arc<dyn ReplDev>, ReplServiceError> {
        self.dev(group_id)
            .map(|d| d as Arc<dyn ReplDev>)
            .ok_or(ReplServiceError::ServerNotFound)
    }

    async fn replace_member(
        &self,
        group_id: GroupId,
        member_out: ReplicaMember,
        member_in: ReplicaMember,
        commit_quorum: u32,
    ) -> Result<(), ReplServiceError> {
        let dev = self
            .dev(group_id)
            .ok_or(ReplServiceError::ServerNotFound)?;
        if !dev.is_leader() && commit_quorum == 0 {
            return Err(ReplServiceError::NotLeader);
        }
        {
            let mut members = dev.members.lock();
            let Some(pos) = members.iter().position(|m| m.id == member_out.id) else {
                return Err(ReplServiceError::ServerNotFound);
            };
            members.remove(pos);
            members.push(member_in.clone());
        }
        let listener = self
            .listener
            .lock()
            .clone()
            .expect("replication listener not registered");
        listener.on_replace_member(group_id, &member_out, &member_in);
        Ok(())
    }
}
