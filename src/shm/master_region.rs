//! The master region (base spec §4.1): a single, fixed-layout shared
//! segment holding child shm-info, the heartbeat node table, a node-list
//! reset timestamp, and the shard-management table.
//!
//! All slots are plain-old-data with `used` flags rather than growable
//! collections, matching the base spec's explicit capacity bounds ("up to
//! N", "up to K") and letting the region live directly in shared memory
//! without a serialization pass on every read.

use crate::error::{Result, RyeError};
use crate::heartbeat::node::NodeState;
use crate::shm::mutex::RobustMutex;
use crate::shm::region::ShmRegion;
use std::mem::size_of;

pub const MASTER_REGION_TYPE: u32 = 1;
pub const MAX_CHILD_SHMS: usize = 16;
pub const MAX_NODES: usize = 32;
pub const MAX_SHARD_ENDPOINTS: usize = 8;

fn copy_name(dst: &mut [u8], src: &str) {
    let n = src.len().min(dst.len());
    dst[..n].copy_from_slice(&src.as_bytes()[..n]);
    dst[n..].fill(0);
}

fn read_name(src: &[u8]) -> String {
    let end = src.iter().position(|&b| b == 0).unwrap_or(src.len());
    String::from_utf8_lossy(&src[..end]).into_owned()
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ChildShmInfo {
    pub name: [u8; 32],
    pub key: i32,
    pub type_tag: u32,
    pub used: bool,
}

impl Default for ChildShmInfo {
    fn default() -> Self {
        ChildShmInfo { name: [0; 32], key: 0, type_tag: 0, used: false }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct HbNodeSlot {
    pub name: [u8; 32],
    pub priority: u32,
    pub state: u32,
    pub score: u32,
    pub heartbeat_gap: u32,
    pub last_recv_hbtime_unix_ms: u64,
    pub version: u32,
    pub used: bool,
}

impl Default for HbNodeSlot {
    fn default() -> Self {
        HbNodeSlot {
            name: [0; 32],
            priority: 0,
            state: NodeState::Unknown as u32,
            score: 0,
            heartbeat_gap: 0,
            last_recv_hbtime_unix_ms: 0,
            version: 0,
            used: false,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ShardEndpointSlot {
    pub local_db: [u8; 64],
    pub global_db: [u8; 64],
    pub nodeid: u32,
    pub sync_time_unix_ms: u64,
    pub used: bool,
}

impl Default for ShardEndpointSlot {
    fn default() -> Self {
        ShardEndpointSlot {
            local_db: [0; 64],
            global_db: [0; 64],
            nodeid: 0,
            sync_time_unix_ms: 0,
            used: false,
        }
    }
}

/// Fixed-size payload stamped into the master region, guarded by a
/// [`RobustMutex`] placed immediately before it.
#[repr(C)]
pub struct MasterRegionData {
    pub mutex: RobustMutex,
    pub child_shms: [ChildShmInfo; MAX_CHILD_SHMS],
    pub nodes: [HbNodeSlot; MAX_NODES],
    pub node_list_reset_unix_ms: u64,
    pub shard_endpoints: [ShardEndpointSlot; MAX_SHARD_ENDPOINTS],
}

/// Owning or viewing handle to the master region.
pub struct MasterRegion {
    region: ShmRegion,
}

impl MasterRegion {
    pub fn create(key: i32) -> Result<Self> {
        let region = ShmRegion::create(key, MASTER_REGION_TYPE, 1, size_of::<MasterRegionData>())?;
        unsafe {
            let data = region.payload_ptr() as *mut MasterRegionData;
            std::ptr::write_bytes(data as *mut u8, 0, size_of::<MasterRegionData>());
            RobustMutex::init_in_place(std::ptr::addr_of_mut!((*data).mutex))?;
        }
        Ok(Self { region })
    }

    pub fn attach(key: i32, readonly: bool) -> Result<Self> {
        let region = ShmRegion::attach(key, Some(MASTER_REGION_TYPE), readonly, size_of::<MasterRegionData>())?;
        Ok(Self { region })
    }

    pub fn destroy(key: i32) -> Result<()> {
        ShmRegion::destroy(key)
    }

    fn data(&self) -> &MasterRegionData {
        unsafe { &*(self.region.payload_ptr() as *const MasterRegionData) }
    }

    #[allow(clippy::mut_from_ref)]
    fn data_mut(&self) -> &mut MasterRegionData {
        unsafe { &mut *(self.region.payload_ptr() as *mut MasterRegionData) }
    }

    /// Runs `f` while holding the master region's robust mutex, recovering
    /// automatically from a dead prior owner (base spec §4.1/§5).
    fn with_lock<R>(&self, f: impl FnOnce(&mut MasterRegionData) -> R) -> Result<R> {
        if self.region.is_readonly() {
            return Err(RyeError::OperationNotAllowed("master region attached read-only".into()));
        }
        let data = self.data_mut();
        let (guard, outcome) = data.mutex.lock()?;
        if outcome == crate::shm::mutex::LockOutcome::RecoveredFromOwnerDeath {
            tracing::warn!(target: "rye::event_log", "master region mutex owner died; recovering");
            data.mutex.mark_consistent(&guard)?;
        }
        let result = f(self.data_mut());
        drop(guard);
        Ok(result)
    }

    pub fn register_child_shm(&self, name: &str, key: i32, type_tag: u32) -> Result<()> {
        self.with_lock(|data| {
            if let Some(slot) = data.child_shms.iter_mut().find(|s| !s.used) {
                copy_name(&mut slot.name, name);
                slot.key = key;
                slot.type_tag = type_tag;
                slot.used = true;
                Ok(())
            } else {
                Err(RyeError::ResourceExhausted("master region child shm table is full".into()))
            }
        })?
    }

    /// Upserts a node's heartbeat row. Returns the node table's slot count
    /// used after the update.
    pub fn upsert_node(
        &self,
        name: &str,
        priority: u32,
        state: NodeState,
        score: u32,
        heartbeat_gap: u32,
        last_recv_hbtime_unix_ms: u64,
        version: u32,
    ) -> Result<()> {
        self.with_lock(|data| {
            if let Some(slot) = data.nodes.iter_mut().find(|s| s.used && read_name(&s.name) == name) {
                slot.priority = priority;
                slot.state = state as u32;
                slot.score = score;
                slot.heartbeat_gap = heartbeat_gap;
                slot.last_recv_hbtime_unix_ms = last_recv_hbtime_unix_ms;
                slot.version = version;
                return Ok(());
            }
            if let Some(slot) = data.nodes.iter_mut().find(|s| !s.used) {
                copy_name(&mut slot.name, name);
                slot.priority = priority;
                slot.state = state as u32;
                slot.score = score;
                slot.heartbeat_gap = heartbeat_gap;
                slot.last_recv_hbtime_unix_ms = last_recv_hbtime_unix_ms;
                slot.version = version;
                slot.used = true;
                Ok(())
            } else {
                Err(RyeError::ResourceExhausted("master region node table is full".into()))
            }
        })?
    }

    /// Reads a consistent snapshot of the node table.
    ///
    /// Base spec §9 flags `master_shm_reset_hb_nodes` racing concurrent
    /// readers as an open question ("behaviour on partial reads is
    /// unspecified"). We resolve it conservatively here by always reading
    /// under the same mutex that `reset_hb_nodes` takes, trading a little
    /// reader contention for a guaranteed-consistent snapshot; see
    /// DESIGN.md.
    pub fn get_ha_nodes(&self) -> Vec<(String, u32, NodeState, u32, u32, u64, u32)> {
        self.with_lock(|data| {
            data.nodes
                .iter()
                .filter(|s| s.used)
                .map(|s| {
                    (
                        read_name(&s.name),
                        s.priority,
                        NodeState::from_u32(s.state),
                        s.score,
                        s.heartbeat_gap,
                        s.last_recv_hbtime_unix_ms,
                        s.version,
                    )
                })
                .collect()
        })
        .unwrap_or_default()
    }

    pub fn reset_hb_nodes(&self) -> Result<()> {
        self.with_lock(|data| {
            for slot in data.nodes.iter_mut() {
                *slot = HbNodeSlot::default();
            }
            data.node_list_reset_unix_ms = unix_millis_now();
        })
    }

    pub fn upsert_shard_endpoint(
        &self,
        local_db: &str,
        global_db: &str,
        nodeid: u32,
        sync_time_unix_ms: u64,
    ) -> Result<()> {
        self.with_lock(|data| {
            if let Some(slot) = data
                .shard_endpoints
                .iter_mut()
                .find(|s| s.used && read_name(&s.local_db) == local_db && s.nodeid == nodeid)
            {
                slot.sync_time_unix_ms = sync_time_unix_ms;
                copy_name(&mut slot.global_db, global_db);
                return Ok(());
            }
            if let Some(slot) = data.shard_endpoints.iter_mut().find(|s| !s.used) {
                copy_name(&mut slot.local_db, local_db);
                copy_name(&mut slot.global_db, global_db);
                slot.nodeid = nodeid;
                slot.sync_time_unix_ms = sync_time_unix_ms;
                slot.used = true;
                Ok(())
            } else {
                Err(RyeError::ResourceExhausted("master region shard endpoint table is full".into()))
            }
        })?
    }

    /// Returns the shard-management endpoint with the most recent sync
    /// time for `local_db` (base spec §4.1: "grant the current shard-mgmt
    /// endpoint by most-recent sync-time").
    pub fn current_shard_endpoint(&self, local_db: &str) -> Option<(String, u32, u64)> {
        self.data()
            .shard_endpoints
            .iter()
            .filter(|s| s.used && read_name(&s.local_db) == local_db)
            .max_by_key(|s| s.sync_time_unix_ms)
            .map(|s| (read_name(&s.global_db), s.nodeid, s.sync_time_unix_ms))
    }
}

fn unix_millis_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
