//! Master request table (base spec §6): the typed function codes accepted
//! over the supervisor's Unix-domain socket, one packet in, one packet
//! out, with peer-address eligibility gating who may send which.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MasterRequestCode {
    GetStartTime,
    GetServerCount,
    GetServerList,
    GetHaNodeList,
    GetHaProcessList,
    GetHaPingHostInfo,
    GetHaAdminInfo,
    IsRegisteredHaProcs,
    GetServerState,
    StartShutdown,
    ActivateHeartbeat,
    RegisterHaProcess,
    DeactStopAll,
    DeactConfirmStopAll,
    DeactivateHeartbeat,
    DeactConfirmNoServer,
    ReconfigHeartbeat,
    Changemode,
    ChangeServerState,
}

impl MasterRequestCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        use MasterRequestCode::*;
        const ALL: &[MasterRequestCode] = &[
            GetStartTime,
            GetServerCount,
            GetServerList,
            GetHaNodeList,
            GetHaProcessList,
            GetHaPingHostInfo,
            GetHaAdminInfo,
            IsRegisteredHaProcs,
            GetServerState,
            StartShutdown,
            ActivateHeartbeat,
            RegisterHaProcess,
            DeactStopAll,
            DeactConfirmStopAll,
            DeactivateHeartbeat,
            DeactConfirmNoServer,
            ReconfigHeartbeat,
            Changemode,
            ChangeServerState,
        ];
        ALL.get(v as usize).copied()
    }
}

/// Where a connection came from, for the peer-address eligibility check
/// (base spec §6: "`AF_UNIX` → local, loopback IP → local, configured
/// cluster peer IP → remote-authorised, else rejected.").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerOrigin {
    Local,
    RemoteAuthorised,
    Rejected,
}

/// Whether `code` may be accepted from a connection with the given
/// origin. Administrative codes (shutdown, changemode, deactivation) are
/// restricted to local callers; read-only status queries and HA-protocol
/// codes used between cluster peers accept remote-authorised origins too.
pub fn is_permitted(code: MasterRequestCode, origin: PeerOrigin) -> bool {
    use MasterRequestCode::*;
    if origin == PeerOrigin::Rejected {
        return false;
    }
    match code {
        GetStartTime | GetServerCount | GetServerList | GetHaNodeList | GetHaProcessList
        | GetHaPingHostInfo | GetHaAdminInfo | IsRegisteredHaProcs | GetServerState => true,
        StartShutdown | DeactStopAll | DeactConfirmStopAll | DeactivateHeartbeat
        | DeactConfirmNoServer | ReconfigHeartbeat | ChangeServerState => origin == PeerOrigin::Local,
        ActivateHeartbeat | RegisterHaProcess | Changemode => true,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterRequest {
    pub code: u16,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterResponse {
    pub ok: bool,
    pub payload: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_u16() {
        for code in [
            MasterRequestCode::GetStartTime,
            MasterRequestCode::Changemode,
            MasterRequestCode::ChangeServerState,
        ] {
            assert_eq!(MasterRequestCode::from_u16(code.as_u16()), Some(code));
        }
    }

    #[test]
    fn unknown_code_does_not_resolve() {
        assert_eq!(MasterRequestCode::from_u16(9999), None);
    }

    #[test]
    fn shutdown_is_local_only() {
        assert!(is_permitted(MasterRequestCode::StartShutdown, PeerOrigin::Local));
        assert!(!is_permitted(MasterRequestCode::StartShutdown, PeerOrigin::RemoteAuthorised));
    }

    #[test]
    fn status_queries_accept_remote_peers() {
        assert!(is_permitted(MasterRequestCode::GetHaNodeList, PeerOrigin::RemoteAuthorised));
    }
}
