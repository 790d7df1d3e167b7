//! Log page layout and the log page buffer (base spec §3 "Log page" /
//! §4.6): a bounded, fix-counted cache over the active and archive
//! volumes.

use crate::common::{Lsa, PageId};
use crate::error::{Result, RyeError};
use crate::replication::archive::ArchiveHeader;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::Mutex;

pub const DEFAULT_PAGE_SIZE: usize = 16 * 1024;
pub const DEFAULT_BUFFER_FRAMES: usize = 100;
/// Log records are aligned to 8 bytes (base spec §4.6 "read_align").
pub const LOG_RECORD_ALIGNMENT: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileStatus {
    Clear,
    Archived,
    Synchronized,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HaInfo {
    pub last_flushed_pageid: PageId,
    pub nxarv_pageid: PageId,
    pub nxarv_num: u32,
    pub last_deleted_arv_num: u32,
    pub file_status: FileStatus,
    pub server_state: crate::heartbeat::node::NodeState,
    pub perm_status: u32,
}

impl Default for HaInfo {
    fn default() -> Self {
        HaInfo {
            last_flushed_pageid: 0,
            nxarv_pageid: 0,
            nxarv_num: 0,
            last_deleted_arv_num: 0,
            file_status: FileStatus::Clear,
            server_state: crate::heartbeat::node::NodeState::Unknown,
            perm_status: 0,
        }
    }
}

/// The active log's header page, stored in physical slot 0 (base spec §3
/// "Log header (active)").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogHeader {
    pub magic: [u8; 8],
    pub creation_time_unix_ms: u64,
    pub db_name: String,
    pub page_size: usize,
    pub npages: u32,
    pub fpageid: PageId,
    pub next_archive_num: u32,
    pub next_archive_start_pageid: PageId,
    pub ha_info: HaInfo,
    pub eof_lsa: Lsa,
}

pub const LOG_HEADER_MAGIC: &[u8; 8] = b"RYE_LGAT";

impl LogHeader {
    pub fn bootstrap(db_name: &str, page_size: usize, npages: u32, creation_time_unix_ms: u64) -> Self {
        LogHeader {
            magic: *LOG_HEADER_MAGIC,
            creation_time_unix_ms,
            db_name: db_name.to_string(),
            page_size,
            npages,
            fpageid: 1,
            next_archive_num: 1,
            next_archive_start_pageid: 1,
            ha_info: HaInfo::default(),
            eof_lsa: Lsa::NULL,
        }
    }

    /// Logical-to-physical slot mapping on the active volume (base spec
    /// §3): `((pageid - fpageid) mod npages) + 1`, slot 0 reserved for the
    /// header.
    pub fn physical_slot(&self, pageid: PageId) -> u64 {
        let npages = self.npages as u64;
        ((pageid.wrapping_sub(self.fpageid)) % npages) + 1
    }
}

#[derive(Debug, Clone)]
pub struct LogPage {
    pub pageid: PageId,
    pub first_record_offset: u32,
    pub payload: Vec<u8>,
}

struct Frame {
    page: LogPage,
    num_fixed: u32,
    #[cfg(debug_assertions)]
    fixers: Vec<(&'static str, u32)>,
}

/// Where a page physically lives, so callers know whether a miss should
/// read the active volume or a numbered archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageLocation {
    Active,
    Archive(u32),
}

/// Source of truth a [`PageBuffer`] reads through on a cache miss.
pub trait PageSource: Send + Sync {
    fn read_page(&self, pageid: PageId, location: PageLocation) -> Result<LogPage>;
}

/// Reads pages straight off the replica's on-disk active volume
/// (`<db>_lgat`) and numbered archives (`<db>_lgar<NNN>`), the files
/// [`crate::replication::writer::LogWriter`] and
/// [`crate::replication::archive::Archiver`] maintain (base spec §4.6:
/// "reads from the active volume if `pageid ≥ nxarv_pageid`, else from
/// archive number located via the log-info file"; archive selection here
/// is the caller's job via [`PageLocation`], matching the analyzer's own
/// page-buffer cache over the *local* files).
pub struct FilePageSource {
    log_path: PathBuf,
    db_name: String,
    page_size: usize,
}

impl FilePageSource {
    pub fn new(log_path: impl Into<PathBuf>, db_name: &str, page_size: usize) -> Self {
        FilePageSource { log_path: log_path.into(), db_name: db_name.to_string(), page_size }
    }

    fn active_path(&self) -> PathBuf {
        self.log_path.join(format!("{}_lgat", self.db_name))
    }

    fn archive_path(&self, arv_num: u32) -> PathBuf {
        self.log_path.join(format!("{}_lgar{:03}", self.db_name, arv_num))
    }

    fn read_slot(&self, file: &File, slot: u64, pageid: PageId) -> Result<LogPage> {
        let mut payload = vec![0u8; self.page_size];
        file.read_exact_at(&mut payload, slot * self.page_size as u64)?;
        Ok(LogPage { pageid, first_record_offset: 0, payload })
    }
}

impl PageSource for FilePageSource {
    fn read_page(&self, pageid: PageId, location: PageLocation) -> Result<LogPage> {
        match location {
            PageLocation::Active => {
                let path = self.active_path();
                let file = File::open(&path)?;
                let mut header_buf = vec![0u8; self.page_size];
                file.read_exact_at(&mut header_buf, 0)?;
                let (header, _): (LogHeader, usize) =
                    bincode::serde::decode_from_slice(&header_buf, bincode::config::standard())
                        .map_err(|e| RyeError::Corruption(format!("active log header decode failed: {e}")))?;
                if header.magic != *LOG_HEADER_MAGIC {
                    return Err(RyeError::Corruption("active log header magic mismatch".into()));
                }
                let slot = header.physical_slot(pageid);
                self.read_slot(&file, slot, pageid)
            }
            PageLocation::Archive(arv_num) => {
                let path = self.archive_path(arv_num);
                let file = File::open(&path)?;
                let mut header_buf = vec![0u8; self.page_size];
                file.read_exact_at(&mut header_buf, 0)?;
                let (header, _): (ArchiveHeader, usize) =
                    bincode::serde::decode_from_slice(&header_buf, bincode::config::standard())
                        .map_err(|e| RyeError::Corruption(format!("archive header decode failed: {e}")))?;
                if pageid < header.fpageid {
                    return Err(RyeError::Corruption(format!("pageid {pageid} precedes archive {arv_num} start")));
                }
                let slot = pageid - header.fpageid + 1;
                self.read_slot(&file, slot, pageid)
            }
        }
    }
}

/// A bounded, fix-counted cache of [`LogPage`] frames keyed by `pageid`
/// (base spec §4.6).
pub struct PageBuffer<S: PageSource> {
    source: S,
    capacity: usize,
    frames: Mutex<HashMap<PageId, Frame>>,
}

impl<S: PageSource> PageBuffer<S> {
    pub fn new(source: S, capacity: usize) -> Self {
        PageBuffer { source, capacity, frames: Mutex::new(HashMap::new()) }
    }

    /// Fixes and returns `pageid`, reading through `source` on a miss.
    /// Never reads past `last_flushed_pageid` (base spec §4.6).
    pub fn get_page_buffer(
        &self,
        pageid: PageId,
        last_flushed_pageid: PageId,
        location: PageLocation,
        #[cfg(debug_assertions)] caller: &'static str,
        #[cfg(debug_assertions)] line: u32,
    ) -> Result<LogPage> {
        if pageid > last_flushed_pageid {
            return Err(RyeError::NotFound(format!("log page {pageid} does not exist yet")));
        }

        let mut frames = self.frames.lock().unwrap();
        if let Some(frame) = frames.get_mut(&pageid) {
            frame.num_fixed += 1;
            #[cfg(debug_assertions)]
            frame.fixers.push((caller, line));
            return Ok(frame.page.clone());
        }

        if frames.len() >= self.capacity {
            self.evict_one(&mut frames);
        }

        let page = self.source.read_page(pageid, location)?;
        frames.insert(
            pageid,
            Frame {
                page: page.clone(),
                num_fixed: 1,
                #[cfg(debug_assertions)]
                fixers: vec![(caller, line)],
            },
        );
        Ok(page)
    }

    fn evict_one(&self, frames: &mut HashMap<PageId, Frame>) {
        if let Some(victim) = frames.iter().find(|(_, f)| f.num_fixed == 0).map(|(id, _)| *id) {
            frames.remove(&victim);
        }
        // If every frame is pinned the cache simply grows past capacity
        // rather than evicting a fixed page; the caller is expected to
        // release fixes promptly.
    }

    /// Unfixes `pageid`; it becomes a reuse candidate only once every
    /// fixer has released it.
    pub fn release(&self, pageid: PageId) {
        let mut frames = self.frames.lock().unwrap();
        if let Some(frame) = frames.get_mut(&pageid) {
            frame.num_fixed = frame.num_fixed.saturating_sub(1);
            #[cfg(debug_assertions)]
            frame.fixers.pop();
        }
    }

    pub fn release_all(&self, exclude: Option<PageId>) {
        let mut frames = self.frames.lock().unwrap();
        for (pageid, frame) in frames.iter_mut() {
            if Some(*pageid) != exclude {
                frame.num_fixed = 0;
                #[cfg(debug_assertions)]
                frame.fixers.clear();
            }
        }
    }

    /// Evicts `[from, to)` without checking fix counts, for use on rewind.
    pub fn decache_range(&self, from: PageId, to: PageId) {
        let mut frames = self.frames.lock().unwrap();
        frames.retain(|pageid, _| *pageid < from || *pageid >= to);
    }

    pub fn fixed_count(&self, pageid: PageId) -> u32 {
        self.frames.lock().unwrap().get(&pageid).map(|f| f.num_fixed).unwrap_or(0)
    }
}

/// Rounds `len` up to the 8-byte log-record alignment (base spec §4.6
/// "read_align").
pub fn read_align(len: usize) -> usize {
    (len + LOG_RECORD_ALIGNMENT - 1) / LOG_RECORD_ALIGNMENT * LOG_RECORD_ALIGNMENT
}
