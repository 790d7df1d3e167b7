//! Log writer (base spec §4.8): drains the copier's recv queue, writes
//! pages to the replica's active volume and a concurrently-built
//! background archive, and maintains the replica-side log header.

use crate::common::{Lsa, PageId};
use crate::error::{Result, RyeError};
use crate::replication::archive::Archiver;
use crate::replication::copier::{RecvNode, RecvQueue};
use crate::replication::page::{FileStatus, LogHeader};
use crate::replication::progress::{ProgressStore, WriterProgressRow};
use flate2::read::ZlibDecoder;
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Replica-side mutable view published for analyzer threads and SHM
/// viewers (base spec §4.8 step 5, "writer.ct").
#[derive(Debug, Clone)]
pub struct WriterCt {
    pub last_flushed_pageid: PageId,
    pub last_received_time_unix_ms: u64,
    pub eof_lsa: Lsa,
}

pub struct LogWriter {
    active_path: PathBuf,
    bg_archive_path: PathBuf,
    active_file: File,
    header: LogHeader,
    header_path_offset: u64,
    ct: parking_lot::Mutex<WriterCt>,
    last_header_flush: parking_lot::Mutex<Instant>,
    progress: ProgressStore<WriterProgressRow>,
    host_ip: String,
    archiver: Archiver,
}

impl LogWriter {
    pub fn bootstrap(log_path: &Path, db_name: &str, page_size: usize, npages: u32, host_ip: &str) -> Result<Self> {
        std::fs::create_dir_all(log_path)?;
        let active_path = log_path.join(format!("{db_name}_lgat"));
        let bg_archive_path = log_path.join(format!("{db_name}_lgar_t"));

        let header = if active_path.exists() {
            Self::read_header(&active_path, page_size)?
        } else {
            let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64;
            let header = LogHeader::bootstrap(db_name, page_size, npages, now);
            let file = OpenOptions::new().create(true).write(true).truncate(true).open(&active_path)?;
            file.set_len((npages as u64 + 1) * page_size as u64)?;
            Self::write_header(&file, &header, page_size)?;
            header
        };

        let active_file = OpenOptions::new().read(true).write(true).open(&active_path)?;

        Ok(LogWriter {
            active_path,
            bg_archive_path,
            active_file,
            header,
            header_path_offset: 0,
            ct: parking_lot::Mutex::new(WriterCt {
                last_flushed_pageid: 0,
                last_received_time_unix_ms: 0,
                eof_lsa: Lsa::NULL,
            }),
            last_header_flush: parking_lot::Mutex::new(Instant::now()),
            progress: ProgressStore::new(log_path.join(format!("{db_name}_log_writer_progress"))),
            host_ip: host_ip.to_string(),
            archiver: Archiver::new(log_path, db_name, page_size),
        })
    }

    fn read_header(path: &Path, page_size: usize) -> Result<LogHeader> {
        let file = File::open(path)?;
        let mut buf = vec![0u8; page_size];
        file.read_exact_at(&mut buf, 0)?;
        let (header, _): (LogHeader, usize) =
            bincode::serde::decode_from_slice(&buf, bincode::config::standard())
                .map_err(|e| RyeError::Corruption(format!("log header decode failed: {e}")))?;
        if header.magic != *crate::replication::page::LOG_HEADER_MAGIC {
            return Err(RyeError::Corruption("log header magic mismatch".into()));
        }
        Ok(header)
    }

    fn write_header(file: &File, header: &LogHeader, page_size: usize) -> Result<()> {
        let mut buf = bincode::serde::encode_to_vec(header, bincode::config::standard())?;
        buf.resize(page_size, 0);
        file.write_all_at(&buf, 0)?;
        file.sync_all()?;
        Ok(())
    }

    pub fn ct(&self) -> WriterCt {
        self.ct.lock().clone()
    }

    /// Drains one item from the recv queue and applies it. Returns `true`
    /// if work was performed, `false` on shutdown with an empty queue.
    pub fn drain_one(&mut self, recv_queue: &RecvQueue, master_file_status: FileStatus, master_nxarv_num: u32) -> Result<bool> {
        let Some(node) = recv_queue.pop() else { return Ok(false) };
        match node {
            RecvNode::Pages { pageid, eof_pageid, num_pages, file_status: _, server_state: _, payload } => {
                self.apply_pages(pageid, eof_pageid, num_pages, payload, master_file_status, master_nxarv_num)?;
            }
            RecvNode::ServerDead => {
                self.force_header_flush()?;
            }
            RecvNode::NetworkFailure(_) => {
                // Recorded by the caller's event log; the writer itself has
                // nothing durable to update on a transient failure.
            }
        }
        Ok(true)
    }

    fn apply_pages(
        &mut self,
        first_pageid: PageId,
        eof_pageid: PageId,
        num_pages: u32,
        payload: Vec<u8>,
        master_file_status: FileStatus,
        master_nxarv_num: u32,
    ) -> Result<()> {
        let page_size = self.header.page_size;
        let mut decompressed;
        let bytes: &[u8] = if payload.len() < num_pages as usize * page_size {
            decompressed = Vec::new();
            ZlibDecoder::new(&payload[..])
                .read_to_end(&mut decompressed)
                .map_err(|e| RyeError::Corruption(format!("page payload decompress failed: {e}")))?;
            &decompressed
        } else {
            &payload
        };

        if self.header.physical_slot(first_pageid) == 1 && first_pageid > self.header.fpageid {
            self.header.fpageid = self.header.fpageid.wrapping_add(self.header.npages as u64);
        }

        for i in 0..num_pages as u64 {
            let pageid = first_pageid + i;
            let slot = self.header.physical_slot(pageid);
            let offset = slot * page_size as u64;
            let start = i as usize * page_size;
            let end = (start + page_size).min(bytes.len());
            if start >= bytes.len() {
                break;
            }
            self.active_file.write_all_at(&bytes[start..end], offset)?;
            self.archiver.stage_background_page(pageid, &bytes[start..end])?;
        }
        self.active_file.sync_all()?;
        self.archiver.sync_background()?;

        {
            let mut ct = self.ct.lock();
            ct.last_flushed_pageid = first_pageid + num_pages.saturating_sub(1) as u64;
            ct.last_received_time_unix_ms =
                SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64;
            ct.eof_lsa = Lsa::new(eof_pageid, 0);
        }

        let should_archive = master_file_status == FileStatus::Archived
            || master_nxarv_num == self.header.ha_info.nxarv_num + 1;
        if should_archive {
            self.archiver.promote(&mut self.header)?;
        }

        let heartbeat_due = self.last_header_flush.lock().elapsed() >= Duration::from_secs(1);
        if should_archive || heartbeat_due {
            self.force_header_flush()?;
        }

        self.persist_progress()
    }

    fn force_header_flush(&mut self) -> Result<()> {
        Self::write_header(&self.active_file, &self.header, self.header.page_size)?;
        *self.last_header_flush.lock() = Instant::now();
        let _ = self.header_path_offset;
        Ok(())
    }

    fn persist_progress(&self) -> Result<()> {
        let ct = self.ct.lock().clone();
        self.progress.store(&WriterProgressRow {
            host_ip: self.host_ip.clone(),
            last_flushed_pageid: ct.last_flushed_pageid,
            last_received_time_unix_ms: ct.last_received_time_unix_ms,
            eof_lsa: ct.eof_lsa,
        })
    }

    pub fn active_path(&self) -> &Path {
        &self.active_path
    }

    pub fn bg_archive_path(&self) -> &Path {
        &self.bg_archive_path
    }
}

/// Drives [`LogWriter::drain_one`] until `shutdown` is observed.
pub fn run_writer_loop(
    writer: &mut LogWriter,
    recv_queue: &RecvQueue,
    shutdown: Arc<AtomicBool>,
    master_file_status: FileStatus,
    master_nxarv_num: u32,
) -> Result<()> {
    while !shutdown.load(Ordering::SeqCst) {
        if !writer.drain_one(recv_queue, master_file_status, master_nxarv_num)? {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heartbeat::node::NodeState;

    fn new_writer(dir: &Path) -> LogWriter {
        LogWriter::bootstrap(dir, "testdb", 256, 4, "127.0.0.1").unwrap()
    }

    #[test]
    fn bootstrap_creates_active_volume_with_valid_header() {
        let dir = tempfile::tempdir().unwrap();
        let writer = new_writer(dir.path());
        assert!(writer.active_path().exists());
        assert_eq!(writer.header.npages, 4);
    }

    #[test]
    fn reopening_reads_back_the_same_header() {
        let dir = tempfile::tempdir().unwrap();
        {
            new_writer(dir.path());
        }
        let reopened = new_writer(dir.path());
        assert_eq!(reopened.header.db_name, "testdb");
    }

    #[test]
    fn applying_a_page_batch_advances_last_flushed_pageid_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = new_writer(dir.path());
        let recv_queue = RecvQueue::new(16);
        recv_queue.push(RecvNode::Pages {
            pageid: 1,
            eof_pageid: 1,
            num_pages: 1,
            file_status: FileStatus::Clear,
            server_state: NodeState::Master,
            payload: vec![0u8; 256],
        });
        writer.drain_one(&recv_queue, FileStatus::Clear, 1).unwrap();
        assert_eq!(writer.ct().last_flushed_pageid, 1);

        let loaded = writer.progress.load().unwrap();
        assert_eq!(loaded.last_flushed_pageid, 1);
    }
}
