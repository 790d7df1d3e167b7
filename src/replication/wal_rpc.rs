//! Wire types for the WAL-streaming RPC the copier speaks to the master
//! database (base spec §6 "WAL streaming RPC", §4.7).

use crate::common::PageId;
use crate::heartbeat::node::NodeState;
use crate::replication::page::FileStatus;
use serde::{Deserialize, Serialize};

/// One outbound request: resume from `first_pageid`, report the error (if
/// any) that ended the previous stream, and advertise whether we accept a
/// compressed payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalRequest {
    pub first_pageid: PageId,
    pub last_error: Option<String>,
    pub compressed_protocol_bit: bool,
}

impl WalRequest {
    pub fn resume_from(first_pageid: PageId, compressed: bool) -> Self {
        WalRequest { first_pageid, last_error: None, compressed_protocol_bit: compressed }
    }

    pub fn resume_after_error(first_pageid: PageId, error: impl Into<String>, compressed: bool) -> Self {
        WalRequest { first_pageid, last_error: Some(error.into()), compressed_protocol_bit: compressed }
    }
}

/// One batch of log pages pushed by the master, or the terminal reply
/// ending the stream (base spec §4.7, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalResponse {
    GetNextLogPages {
        /// Payload length; the high bit (stripped before reaching here)
        /// marked the payload as zipped on the wire.
        length: u32,
        pageid: PageId,
        eof_pageid: PageId,
        num_pages: u32,
        file_status: FileStatus,
        server_state: NodeState,
        is_zipped: bool,
        payload: Vec<u8>,
    },
    EndCallback {
        err: String,
    },
}

impl WalResponse {
    pub fn is_end(&self) -> bool {
        matches!(self, WalResponse::EndCallback { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_without_prior_error_round_trips() {
        let req = WalRequest::resume_from(10, true);
        let json = serde_json::to_string(&req).unwrap();
        let back: WalRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.first_pageid, 10);
        assert!(back.last_error.is_none());
    }

    #[test]
    fn end_callback_is_end_get_next_is_not() {
        let end = WalResponse::EndCallback { err: "peer dead".into() };
        assert!(end.is_end());
        let pages = WalResponse::GetNextLogPages {
            length: 0,
            pageid: 1,
            eof_pageid: 1,
            num_pages: 0,
            file_status: FileStatus::Clear,
            server_state: NodeState::Master,
            is_zipped: false,
            payload: vec![],
        };
        assert!(!pages.is_end());
    }
}
