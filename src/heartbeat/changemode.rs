//! Change-mode protocol escalation (base spec §4.4: "A `changemode_gap`
//! counter increments per unacknowledged attempt; at
//! `MAX_CHANGEMODE_DIFF_TO_TERM` the server is SIGTERM'd, at
//! `MAX_CHANGEMODE_DIFF_TO_KILL` SIGKILL'd.").

use crate::heartbeat::node::NodeState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangemodeAction {
    /// Resend `CHANGE_HA_MODE(state, force)` and keep waiting.
    Retry,
    Sigterm,
    Sigkill,
}

/// Advances `changemode_gap` for one unacknowledged attempt and decides
/// the escalation action. `force` mirrors the protocol's force bit: a
/// forced change-mode request is retried but never escalates, matching
/// the base spec's distinction between a normal and a forced transition.
pub fn next_action(changemode_gap: u32, force: bool, max_diff_to_term: u32, max_diff_to_kill: u32) -> ChangemodeAction {
    if force {
        return ChangemodeAction::Retry;
    }
    if changemode_gap >= max_diff_to_kill {
        ChangemodeAction::Sigkill
    } else if changemode_gap >= max_diff_to_term {
        ChangemodeAction::Sigterm
    } else {
        ChangemodeAction::Retry
    }
}

/// Desired HA mode the controller will keep forcing a registered server
/// towards until it acknowledges (base spec: "periodically forces each
/// registered server's HA state to match the controller's own desired
/// state").
pub fn desired_mode_for(controller_state: NodeState) -> NodeState {
    match controller_state {
        NodeState::Master | NodeState::ToBeMaster => NodeState::Master,
        _ => NodeState::Slave,
    }
}
