//! Log record scanner (base spec §4.10 steps 1-3): walks the analyzer's
//! page-buffer cache forward from a given [`Lsa`], decoding [`LogRecord`]s
//! across page boundaries using `read_advance_when_doesnt_fit` (base spec
//! §4.6 "Advance helpers").

use crate::common::{Lsa, PageId};
use crate::error::{Result, RyeError};
use crate::replication::page::{PageBuffer, PageLocation, PageSource};
use crate::replication::record::LogRecord;

/// How many pages' worth of bytes a single record may straddle before the
/// scanner gives up and reports corruption rather than retrying forever.
const MAX_SPAN_PAGES: usize = 4;

/// Read-only forward scanner over a [`PageBuffer`], used by the analyzer
/// to turn persisted page bytes back into [`LogRecord`]s.
pub struct LogScanner<S: PageSource> {
    buffer: PageBuffer<S>,
    page_size: usize,
}

impl<S: PageSource> LogScanner<S> {
    pub fn new(source: S, page_size: usize, capacity: usize) -> Self {
        LogScanner { buffer: PageBuffer::new(source, capacity), page_size }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Decodes the next record at or after `from`, not reading past
    /// `last_flushed_pageid`. Returns `None` when there is nothing new to
    /// read yet (base spec §4.10 step 2: "if empty or no pages flushed
    /// yet, sleep briefly").
    pub fn next_record(&self, from: Lsa, last_flushed_pageid: PageId) -> Result<Option<(LogRecord, Lsa)>> {
        if from.pageid > last_flushed_pageid {
            return Ok(None);
        }

        let mut acc: Vec<u8> = Vec::new();
        let mut segments: Vec<(PageId, usize, usize)> = Vec::new(); // (pageid, start_in_page, len)
        let mut pageid = from.pageid;

        loop {
            if pageid > last_flushed_pageid {
                return if acc.is_empty() {
                    Ok(None)
                } else {
                    Err(RyeError::Corruption("log record truncated at end of flushed log".into()))
                };
            }

            let page = fetch(&self.buffer, pageid, last_flushed_pageid)?;
            self.buffer.release(pageid);

            let start = if segments.is_empty() { from.offset as usize } else { 0 };
            if start > page.payload.len() {
                return Err(RyeError::Corruption(format!("record offset {start} past page {pageid} bounds")));
            }
            let slice = &page.payload[start..];
            if !slice.is_empty() {
                acc.extend_from_slice(slice);
                segments.push((pageid, start, slice.len()));
            }

            // A real record's length prefix is never zero; zero bytes here
            // mean the scan has caught up to unwritten page tail, not that
            // a record is short. Treat it as "nothing new yet" rather than
            // spanning further pages looking for a record that isn't there.
            if acc.len() >= 4 && acc[..4] == [0, 0, 0, 0] {
                return Ok(None);
            }

            match LogRecord::decode(&acc) {
                Ok((record, consumed)) => {
                    let mut remaining = consumed;
                    let mut end_lsa = from;
                    for (seg_pageid, seg_start, seg_len) in &segments {
                        if remaining <= *seg_len {
                            end_lsa = Lsa::new(*seg_pageid, (*seg_start + remaining) as u32);
                            break;
                        }
                        remaining -= seg_len;
                    }
                    return Ok(Some((record, end_lsa)));
                }
                Err(_) if segments.len() < MAX_SPAN_PAGES => {
                    pageid += 1;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(debug_assertions)]
fn fetch<S: PageSource>(buffer: &PageBuffer<S>, pageid: PageId, last_flushed_pageid: PageId) -> Result<crate::replication::page::LogPage> {
    buffer.get_page_buffer(pageid, last_flushed_pageid, PageLocation::Active, "log_scanner", line!())
}

#[cfg(not(debug_assertions))]
fn fetch<S: PageSource>(buffer: &PageBuffer<S>, pageid: PageId, last_flushed_pageid: PageId) -> Result<crate::replication::page::LogPage> {
    buffer.get_page_buffer(pageid, last_flushed_pageid, PageLocation::Active)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Trid;
    use crate::replication::page::LogPage;
    use crate::replication::record::{LogRecordHeader, LogRecordType};
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct FakePages {
        page_size: usize,
        pages: Mutex<HashMap<PageId, Vec<u8>>>,
    }

    impl PageSource for FakePages {
        fn read_page(&self, pageid: PageId, _location: PageLocation) -> Result<LogPage> {
            let payload = self
                .pages
                .lock()
                .unwrap()
                .get(&pageid)
                .cloned()
                .unwrap_or_else(|| vec![0u8; self.page_size]);
            Ok(LogPage { pageid, first_record_offset: 0, payload })
        }
    }

    fn commit_record(trid: i64) -> LogRecord {
        LogRecord {
            header: LogRecordHeader {
                record_type: LogRecordType::Commit,
                trid: Trid(trid),
                prev_tran_lsa: Lsa::NULL,
                prev_lsa: Lsa::NULL,
                forward_lsa: Lsa::NULL,
            },
            data: None,
            schema: None,
            catalog: None,
            ha_server_state: None,
        }
    }

    #[test]
    fn reads_a_record_that_fits_on_one_page() {
        let page_size = 64;
        let encoded = commit_record(1).encode().unwrap();
        let mut payload = vec![0u8; page_size];
        payload[..encoded.len()].copy_from_slice(&encoded);

        let mut pages = HashMap::new();
        pages.insert(1, payload);
        let scanner = LogScanner::new(FakePages { page_size, pages: Mutex::new(pages) }, page_size, 4);

        let (record, end_lsa) = scanner.next_record(Lsa::new(1, 0), 1).unwrap().unwrap();
        assert_eq!(record.header.trid, Trid(1));
        assert_eq!(end_lsa, Lsa::new(1, encoded.len() as u32));
    }

    #[test]
    fn reads_a_record_that_spans_two_pages() {
        let page_size = 8;
        let encoded = commit_record(2).encode().unwrap();
        let half = encoded.len() / 2;
        assert!(half > 0 && half < encoded.len(), "test record must be splittable across a page boundary");

        let mut pages = HashMap::new();
        pages.insert(1, encoded[..half].to_vec());
        pages.insert(2, encoded[half..].to_vec());
        let scanner = LogScanner::new(FakePages { page_size, pages: Mutex::new(pages) }, page_size, 4);

        let (record, _end_lsa) = scanner.next_record(Lsa::new(1, 0), 2).unwrap().unwrap();
        assert_eq!(record.header.trid, Trid(2));
    }

    #[test]
    fn returns_none_past_last_flushed_page() {
        let page_size = 16;
        let scanner = LogScanner::new(
            FakePages { page_size, pages: Mutex::new(HashMap::new()) },
            page_size,
            4,
        );
        assert!(scanner.next_record(Lsa::new(5, 0), 3).unwrap().is_none());
    }
}
