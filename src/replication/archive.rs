//! Active-to-archive promotion (base spec §4.9): the background archive
//! file is built incrementally as pages are written to the active volume,
//! then atomically promoted to a numbered archive.

use crate::common::PageId;
use crate::error::Result;
use crate::replication::page::LogHeader;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveHeader {
    pub magic: [u8; 8],
    pub db_creation_time_unix_ms: u64,
    pub next_trid: i64,
    pub fpageid: PageId,
    pub arv_num: u32,
    pub npages: u32,
}

/// Builds and promotes the background archive file (`<db>_lgar_t`) into a
/// numbered archive (`<db>_lgar<NNN>`).
pub struct Archiver {
    log_path: PathBuf,
    db_name: String,
    page_size: usize,
    bg_file: File,
    bg_start_pageid: PageId,
    log_info_path: PathBuf,
}

impl Archiver {
    pub fn new(log_path: &Path, db_name: &str, page_size: usize) -> Self {
        let bg_path = log_path.join(format!("{db_name}_lgar_t"));
        let bg_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&bg_path)
            .expect("background archive file must be creatable");
        Archiver {
            log_path: log_path.to_path_buf(),
            db_name: db_name.to_string(),
            page_size,
            bg_file,
            bg_start_pageid: 1,
            log_info_path: log_path.join(format!("{db_name}_lginf")),
        }
    }

    /// Copies one page's bytes into the background file at the slot
    /// matching its position within the archive-in-progress (base spec
    /// §4.9 step 1/4).
    pub fn stage_background_page(&mut self, pageid: PageId, bytes: &[u8]) -> Result<()> {
        if pageid < self.bg_start_pageid {
            return Ok(());
        }
        let slot = pageid - self.bg_start_pageid + 1;
        self.bg_file.write_all_at(bytes, slot * self.page_size as u64)?;
        Ok(())
    }

    pub fn sync_background(&self) -> Result<()> {
        self.bg_file.sync_all()?;
        Ok(())
    }

    /// Runs the full promotion sequence: finish the header page, fsync,
    /// atomically rename, bump `ha_info`, append a log-info line, and
    /// reformat a fresh background file (base spec §4.9).
    pub fn promote(&mut self, header: &mut LogHeader) -> Result<()> {
        let arv_num = header.ha_info.nxarv_num.max(header.next_archive_num);
        let arv_header = ArchiveHeader {
            magic: *crate::replication::page::LOG_HEADER_MAGIC,
            db_creation_time_unix_ms: header.creation_time_unix_ms,
            next_trid: 0,
            fpageid: self.bg_start_pageid,
            arv_num,
            npages: header.npages,
        };
        let mut buf = bincode::serde::encode_to_vec(&arv_header, bincode::config::standard())?;
        buf.resize(self.page_size, 0);
        self.bg_file.write_all_at(&buf, 0)?;
        self.bg_file.sync_all()?;

        let final_path = self.log_path.join(format!("{}_lgar{:03}", self.db_name, arv_num));
        let bg_path = self.log_path.join(format!("{}_lgar_t", self.db_name));
        std::fs::rename(&bg_path, &final_path)?;

        header.ha_info.nxarv_pageid = self.bg_start_pageid + header.npages as u64;
        header.ha_info.nxarv_num = arv_num + 1;
        header.next_archive_num = arv_num + 1;
        header.next_archive_start_pageid = header.ha_info.nxarv_pageid;

        self.append_log_info_line(arv_num, self.bg_start_pageid, header.ha_info.nxarv_pageid)?;

        self.bg_start_pageid = header.ha_info.nxarv_pageid;
        self.bg_file = OpenOptions::new().create(true).read(true).write(true).open(&bg_path)?;
        Ok(())
    }

    fn append_log_info_line(&self, arv_num: u32, start: PageId, end: PageId) -> Result<()> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
        let mut file = OpenOptions::new().create(true).append(true).open(&self.log_info_path)?;
        writeln!(file, "{now} archive {arv_num} pages [{start},{end})")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn promote_renames_background_file_and_advances_counters() {
        let dir = tempfile::tempdir().unwrap();
        let mut archiver = Archiver::new(dir.path(), "testdb", 256);
        archiver.stage_background_page(1, &[1u8; 256]).unwrap();

        let mut header = LogHeader::bootstrap("testdb", 256, 4, 0);
        archiver.promote(&mut header).unwrap();

        assert!(dir.path().join("testdb_lgar001").exists());
        assert!(!dir.path().join("testdb_lgar_t").exists() || File::open(dir.path().join("testdb_lgar_t")).unwrap().metadata().unwrap().len() == 0);
        assert_eq!(header.ha_info.nxarv_num, 2);
    }

    #[test]
    fn promote_appends_a_log_info_line() {
        let dir = tempfile::tempdir().unwrap();
        let mut archiver = Archiver::new(dir.path(), "testdb", 256);
        let mut header = LogHeader::bootstrap("testdb", 256, 4, 0);
        archiver.promote(&mut header).unwrap();
        let contents = std::fs::read_to_string(dir.path().join("testdb_lginf")).unwrap();
        assert!(contents.contains("archive 1"));
    }
}
