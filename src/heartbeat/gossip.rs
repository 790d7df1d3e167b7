//! UDP heartbeat datagram wire format and gossip send/receive (base spec
//! §6: "Heartbeat datagram: UDP, port `rye_port_id`. Header {type byte,
//! r-bit, length, seq, 16-byte group id, 8-byte dest ip+port, 8-byte orig
//! ip+port} followed by {state:int32, version}").

use crate::error::{Result, RyeError};
use crate::heartbeat::node::NodeState;
use std::net::SocketAddr;
use tokio::net::UdpSocket;

pub const GROUP_ID_LEN: usize = 16;
const HEADER_LEN: usize = 1 + 1 + 2 + 4 + GROUP_ID_LEN + 8 + 8;
const BODY_LEN: usize = 4 + 4;
pub const DATAGRAM_LEN: usize = HEADER_LEN + BODY_LEN;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatDatagram {
    pub request_response_bit: bool,
    pub seq: u32,
    pub group_id: [u8; GROUP_ID_LEN],
    pub dest_addr: SocketAddr,
    pub orig_addr: SocketAddr,
    pub state: NodeState,
    pub version: u32,
}

fn pack_addr(addr: SocketAddr) -> [u8; 8] {
    let mut buf = [0u8; 8];
    match addr {
        SocketAddr::V4(v4) => {
            buf[..4].copy_from_slice(&v4.ip().octets());
            buf[4..6].copy_from_slice(&v4.port().to_be_bytes());
        }
        SocketAddr::V6(_) => {
            // Only the v4-mapped low bytes are carried, matching the
            // fixed 8-byte on-wire field; callers run an IPv4 cluster.
        }
    }
    buf
}

fn unpack_addr(buf: &[u8; 8]) -> SocketAddr {
    let ip = std::net::Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
    let port = u16::from_be_bytes([buf[4], buf[5]]);
    SocketAddr::from((ip, port))
}

impl HeartbeatDatagram {
    pub fn encode(&self) -> [u8; DATAGRAM_LEN] {
        let mut out = [0u8; DATAGRAM_LEN];
        out[0] = 1; // type byte: the only datagram type this fabric sends
        out[1] = self.request_response_bit as u8;
        out[2..4].copy_from_slice(&(DATAGRAM_LEN as u16).to_be_bytes());
        out[4..8].copy_from_slice(&self.seq.to_be_bytes());
        out[8..8 + GROUP_ID_LEN].copy_from_slice(&self.group_id);
        let mut off = 8 + GROUP_ID_LEN;
        out[off..off + 8].copy_from_slice(&pack_addr(self.dest_addr));
        off += 8;
        out[off..off + 8].copy_from_slice(&pack_addr(self.orig_addr));
        off += 8;
        out[off..off + 4].copy_from_slice(&(self.state as u32).to_be_bytes());
        off += 4;
        out[off..off + 4].copy_from_slice(&self.version.to_be_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < DATAGRAM_LEN {
            return Err(RyeError::Heartbeat(format!(
                "datagram too short: {} < {DATAGRAM_LEN}",
                buf.len()
            )));
        }
        let request_response_bit = buf[1] != 0;
        let seq = u32::from_be_bytes(buf[4..8].try_into().unwrap());
        let mut group_id = [0u8; GROUP_ID_LEN];
        group_id.copy_from_slice(&buf[8..8 + GROUP_ID_LEN]);
        let mut off = 8 + GROUP_ID_LEN;
        let dest_addr = unpack_addr(buf[off..off + 8].try_into().unwrap());
        off += 8;
        let orig_addr = unpack_addr(buf[off..off + 8].try_into().unwrap());
        off += 8;
        let state = NodeState::from_u32(u32::from_be_bytes(buf[off..off + 4].try_into().unwrap()));
        off += 4;
        let version = u32::from_be_bytes(buf[off..off + 4].try_into().unwrap());
        Ok(HeartbeatDatagram { request_response_bit, seq, group_id, dest_addr, orig_addr, state, version })
    }
}

/// Validates that an incoming datagram belongs to our cluster and speaks
/// a compatible protocol version before it's allowed to update node state
/// (base spec §6: "Receivers validate the group-id and version
/// compatibility").
pub fn is_compatible(datagram: &HeartbeatDatagram, our_group_id: &[u8; GROUP_ID_LEN], our_version: u32) -> bool {
    &datagram.group_id == our_group_id && datagram.version == our_version
}

/// Thin wrapper over a bound UDP socket for sending/receiving gossip.
pub struct GossipSocket {
    socket: UdpSocket,
}

impl GossipSocket {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(GossipSocket { socket })
    }

    pub async fn send_to(&self, datagram: &HeartbeatDatagram, peer: SocketAddr) -> Result<()> {
        self.socket.send_to(&datagram.encode(), peer).await?;
        Ok(())
    }

    pub async fn recv(&self) -> Result<(HeartbeatDatagram, SocketAddr)> {
        let mut buf = [0u8; DATAGRAM_LEN];
        let (n, from) = self.socket.recv_from(&mut buf).await?;
        let datagram = HeartbeatDatagram::decode(&buf[..n])?;
        Ok((datagram, from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> HeartbeatDatagram {
        HeartbeatDatagram {
            request_response_bit: true,
            seq: 42,
            group_id: [7u8; GROUP_ID_LEN],
            dest_addr: "10.0.0.1:59999".parse().unwrap(),
            orig_addr: "10.0.0.2:59999".parse().unwrap(),
            state: NodeState::Slave,
            version: 3,
        }
    }

    #[test]
    fn round_trips_through_wire_format() {
        let original = sample();
        let decoded = HeartbeatDatagram::decode(&original.encode()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn rejects_short_buffer() {
        let err = HeartbeatDatagram::decode(&[0u8; 4]);
        assert!(err.is_err());
    }

    #[test]
    fn compatibility_checks_group_and_version() {
        let datagram = sample();
        assert!(is_compatible(&datagram, &[7u8; GROUP_ID_LEN], 3));
        assert!(!is_compatible(&datagram, &[8u8; GROUP_ID_LEN], 3));
        assert!(!is_compatible(&datagram, &[7u8; GROUP_ID_LEN], 4));
    }

    #[tokio::test]
    async fn sockets_exchange_a_datagram() {
        let a = GossipSocket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let b = GossipSocket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let b_addr = b.socket.local_addr().unwrap();

        let datagram = sample();
        a.send_to(&datagram, b_addr).await.unwrap();
        let (received, _from) = b.recv().await.unwrap();
        assert_eq!(received, datagram);
    }
}
