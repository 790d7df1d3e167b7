//! Heartbeat controller and resource manager (base spec §4.4): cluster
//! gossip, master/slave election, split-brain failback, and the process
//! supervisor that spawns and confirms rye_server / replicator children.

pub mod changemode;
pub mod controller;
pub mod gossip;
pub mod node;
pub mod process;

pub use controller::HeartbeatController;
pub use node::{Node, NodeState};
