//! Cluster node identity, role state and scoring (base spec §3, §4.4).

use crate::common::NodeId;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// A node's role in the master/slave election (base spec §3: `state ∈
/// {unknown, master, to-be-master, slave, to-be-slave, replica, dead}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum NodeState {
    Unknown = 0,
    Master = 1,
    ToBeMaster = 2,
    Slave = 3,
    ToBeSlave = 4,
    Replica = 5,
    Dead = 6,
}

impl NodeState {
    pub fn from_u32(v: u32) -> Self {
        match v {
            1 => NodeState::Master,
            2 => NodeState::ToBeMaster,
            3 => NodeState::Slave,
            4 => NodeState::ToBeSlave,
            5 => NodeState::Replica,
            6 => NodeState::Dead,
            _ => NodeState::Unknown,
        }
    }

    /// Category bits used by [`Node::score`]: lower is more master-like,
    /// matching the base spec's "lowest score wins" rule.
    fn category_bits(self) -> u32 {
        match self {
            NodeState::Master => 0,
            NodeState::ToBeMaster => 1,
            NodeState::Slave => 2,
            NodeState::ToBeSlave => 3,
            NodeState::Replica => 4,
            NodeState::Dead | NodeState::Unknown => 5,
        }
    }
}

/// The election transition table (base spec §4.4): `(current, requested)
/// -> Some(next)`, or `None` if the transition is disallowed and must be
/// ignored by the caller.
pub fn election_transition(current: NodeState, requested: NodeState) -> Option<NodeState> {
    use NodeState::*;
    match (current, requested) {
        (Unknown, Unknown) => Some(Unknown),
        (Unknown, Master) => Some(Master),
        (Unknown, ToBeMaster) => Some(ToBeMaster),
        (Unknown, Slave) => Some(Slave),
        (Unknown, ToBeSlave) => Some(ToBeSlave),

        (Master, Master) => Some(Master),
        (Master, Slave) => Some(ToBeSlave),
        (Master, ToBeSlave) => Some(ToBeSlave),

        (ToBeMaster, Master) => Some(Master),
        (ToBeMaster, ToBeMaster) => Some(ToBeMaster),

        (Slave, Master) => Some(ToBeMaster),
        (Slave, Slave) => Some(Slave),

        (ToBeSlave, Slave) => Some(Slave),
        (ToBeSlave, ToBeSlave) => Some(ToBeSlave),

        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub priority: u32,
    pub state: NodeState,
    pub score: u32,
    pub heartbeat_gap: u32,
    pub last_recv_hbtime: Option<Instant>,
    pub version: u32,
}

impl Node {
    pub fn new(id: NodeId, addr: SocketAddr, priority: u32) -> Self {
        Node {
            id,
            addr,
            priority,
            state: NodeState::Unknown,
            score: priority | (NodeState::Unknown.category_bits() << 24),
            heartbeat_gap: 0,
            last_recv_hbtime: None,
            version: 0,
        }
    }

    /// Recomputes `score = priority | category_bits`, per base spec §4.4.
    pub fn recompute_score(&mut self) {
        self.score = self.priority | (self.state.category_bits() << 24);
    }

    /// Demotes to `unknown` if the node has missed too many consecutive
    /// heartbeat rounds or has gone silent for too long in absolute time.
    pub fn demote_if_stale(&mut self, max_heartbeat_gap: u32, calc_score_interval: Duration) {
        let absolute_stale = self
            .last_recv_hbtime
            .map(|t| t.elapsed() > calc_score_interval)
            .unwrap_or(true);
        if self.heartbeat_gap >= max_heartbeat_gap || absolute_stale {
            self.state = NodeState::Unknown;
        }
        self.recompute_score();
    }

    pub fn record_heartbeat(&mut self, reported_state: NodeState, version: u32) {
        self.last_recv_hbtime = Some(Instant::now());
        self.heartbeat_gap = self.heartbeat_gap.saturating_sub(1);
        self.version = version;
        if reported_state != self.state {
            self.state = reported_state;
            self.recompute_score();
        }
    }

    pub fn tick_missed(&mut self) {
        self.heartbeat_gap += 1;
    }
}

/// Picks the cluster master: the node with the lowest score (base spec
/// §4.4: "After scoring, the lowest-scoring node is nominated cluster
/// master.").
pub fn nominate_master<'a>(nodes: impl IntoIterator<Item = &'a Node>) -> Option<&'a Node> {
    nodes.into_iter().min_by_key(|n| n.score)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:59999".parse().unwrap()
    }

    #[test]
    fn master_outscores_slave() {
        let mut master = Node::new(NodeId::new("a"), addr(), 5);
        master.state = NodeState::Master;
        master.recompute_score();

        let mut slave = Node::new(NodeId::new("b"), addr(), 1);
        slave.state = NodeState::Slave;
        slave.recompute_score();

        let nominated = nominate_master([&master, &slave]).unwrap();
        assert_eq!(nominated.id.as_str(), "a", "category bits dominate priority");
    }

    #[test]
    fn lower_priority_wins_within_same_state() {
        let mut a = Node::new(NodeId::new("a"), addr(), 5);
        a.state = NodeState::Slave;
        a.recompute_score();
        let mut b = Node::new(NodeId::new("b"), addr(), 1);
        b.state = NodeState::Slave;
        b.recompute_score();

        let nominated = nominate_master([&a, &b]).unwrap();
        assert_eq!(nominated.id.as_str(), "b");
    }

    #[test]
    fn election_table_matches_spec() {
        assert_eq!(election_transition(NodeState::Unknown, NodeState::Master), Some(NodeState::Master));
        assert_eq!(election_transition(NodeState::Master, NodeState::Slave), Some(NodeState::ToBeSlave));
        assert_eq!(election_transition(NodeState::Slave, NodeState::Master), Some(NodeState::ToBeMaster));
        assert_eq!(election_transition(NodeState::ToBeMaster, NodeState::Master), Some(NodeState::Master));
        assert_eq!(election_transition(NodeState::ToBeSlave, NodeState::Slave), Some(NodeState::Slave));
        assert_eq!(election_transition(NodeState::Master, NodeState::ToBeMaster), None);
        assert_eq!(election_transition(NodeState::Slave, NodeState::ToBeSlave), None);
    }

    #[test]
    fn stale_node_demotes_to_unknown() {
        let mut node = Node::new(NodeId::new("a"), addr(), 1);
        node.state = NodeState::Slave;
        node.heartbeat_gap = 10;
        node.demote_if_stale(3, Duration::from_secs(60));
        assert_eq!(node.state, NodeState::Unknown);
    }
}
