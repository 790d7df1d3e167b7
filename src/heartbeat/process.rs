//! Child process bookkeeping and the resource manager (base spec §4.4:
//! "Maintains a list of child processes declared by configuration ...
//! Confirm-start job retries until a configurable limit ... On unexpected
//! disconnection, if the gap since last registration is less than
//! `UNACCEPTABLE_PROC_RESTART_TIMEDIFF`, demote self to slave before
//! restarting.").

use crate::error::{Result, RyeError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ffi::CString;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessKind {
    Server,
    Replication,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessState {
    Unknown,
    Dead,
    Deregistered,
    Started,
    NotRegistered,
    Registered,
}

#[derive(Debug, Clone)]
pub struct ManagedProcess {
    pub kind: ProcessKind,
    pub pid: Option<i32>,
    pub exec_path: String,
    pub args: Vec<String>,
    pub state: ProcessState,
    pub server_state: crate::heartbeat::node::NodeState,
    pub first_registered_at: Option<Instant>,
    pub registered_at: Option<Instant>,
    pub deregistered_at: Option<Instant>,
    pub shutdown_requested_at: Option<Instant>,
    pub started_at: Option<Instant>,
    pub being_shutdown: bool,
    pub server_hang: bool,
    pub confirm_start_attempts: u32,
    pub changemode_gap: u32,
}

impl ManagedProcess {
    pub fn new(kind: ProcessKind, exec_path: impl Into<String>, args: Vec<String>) -> Self {
        ManagedProcess {
            kind,
            pid: None,
            exec_path: exec_path.into(),
            args,
            state: ProcessState::Unknown,
            server_state: crate::heartbeat::node::NodeState::Unknown,
            first_registered_at: None,
            registered_at: None,
            deregistered_at: None,
            shutdown_requested_at: None,
            started_at: None,
            being_shutdown: false,
            server_hang: false,
            confirm_start_attempts: 0,
            changemode_gap: 0,
        }
    }
}

/// Forks and execs a child with a clean fd table and the marker env var
/// the child uses to find its supervisor (base spec: "fork+exec with a
/// clean fd table and a marker env var").
///
/// # Safety
/// Must be called before the process spawns additional threads that hold
/// locks the child could deadlock on post-fork; callers are expected to
/// invoke this only from the single-threaded startup path or a dedicated
/// spawner task.
pub unsafe fn spawn_child(exec_path: &str, args: &[String], marker_env: &str) -> Result<i32> {
    let path = CString::new(exec_path)
        .map_err(|e| RyeError::Heartbeat(format!("bad exec path: {e}")))?;
    let mut arg_cstrings: Vec<CString> = vec![path.clone()];
    for a in args {
        arg_cstrings.push(
            CString::new(a.as_str()).map_err(|e| RyeError::Heartbeat(format!("bad arg: {e}")))?,
        );
    }
    let mut arg_ptrs: Vec<*const libc::c_char> = arg_cstrings.iter().map(|c| c.as_ptr()).collect();
    arg_ptrs.push(std::ptr::null());

    let pid = libc::fork();
    if pid < 0 {
        return Err(RyeError::Heartbeat("fork failed".into()));
    }
    if pid == 0 {
        libc::setenv(
            CString::new("RYE_HA_CHILD").unwrap().as_ptr(),
            CString::new(marker_env).unwrap().as_ptr(),
            1,
        );
        libc::execv(path.as_ptr(), arg_ptrs.as_ptr());
        libc::_exit(127);
    }
    Ok(pid)
}

pub struct ResourceManager {
    processes: HashMap<String, ManagedProcess>,
    confirm_start_retry_limit: u32,
    unacceptable_restart_timediff: Duration,
}

impl ResourceManager {
    pub fn new(confirm_start_retry_limit: u32, unacceptable_restart_timediff: Duration) -> Self {
        ResourceManager { processes: HashMap::new(), confirm_start_retry_limit, unacceptable_restart_timediff }
    }

    pub fn declare(&mut self, key: impl Into<String>, process: ManagedProcess) {
        self.processes.insert(key.into(), process);
    }

    pub fn get(&self, key: &str) -> Option<&ManagedProcess> {
        self.processes.get(key)
    }

    pub fn mark_started(&mut self, key: &str, pid: i32) -> Result<()> {
        let p = self.processes.get_mut(key).ok_or_else(|| RyeError::NotFound(key.to_string()))?;
        p.pid = Some(pid);
        p.state = ProcessState::Started;
        p.started_at = Some(Instant::now());
        p.confirm_start_attempts = 0;
        Ok(())
    }

    /// The child connected back with `REGISTER_HA_PROCESS`.
    pub fn mark_registered(&mut self, key: &str) -> Result<()> {
        let p = self.processes.get_mut(key).ok_or_else(|| RyeError::NotFound(key.to_string()))?;
        let now = Instant::now();
        if p.first_registered_at.is_none() {
            p.first_registered_at = Some(now);
        }
        p.registered_at = Some(now);
        p.state = ProcessState::Registered;
        Ok(())
    }

    /// Called on each confirm-start tick while a process is `started` but
    /// not yet `registered`. Returns `true` once the retry budget is
    /// exhausted, signalling the caller to demote self and restart the
    /// child.
    pub fn tick_confirm_start(&mut self, key: &str) -> Result<bool> {
        let p = self.processes.get_mut(key).ok_or_else(|| RyeError::NotFound(key.to_string()))?;
        if p.state != ProcessState::Started {
            return Ok(false);
        }
        p.confirm_start_attempts += 1;
        Ok(p.confirm_start_attempts >= self.confirm_start_retry_limit)
    }

    /// On unexpected disconnection: returns whether the demotion path
    /// should trigger, based on how recently the process last registered.
    pub fn disconnection_requires_demotion(&self, key: &str) -> Result<bool> {
        let p = self.processes.get(key).ok_or_else(|| RyeError::NotFound(key.to_string()))?;
        let gap = p
            .registered_at
            .map(|t| t.elapsed())
            .unwrap_or(Duration::MAX);
        Ok(gap < self.unacceptable_restart_timediff)
    }

    pub fn mark_deregistered(&mut self, key: &str) -> Result<()> {
        let p = self.processes.get_mut(key).ok_or_else(|| RyeError::NotFound(key.to_string()))?;
        p.state = ProcessState::Deregistered;
        p.deregistered_at = Some(Instant::now());
        p.pid = None;
        Ok(())
    }

    pub fn all(&self) -> impl Iterator<Item = (&String, &ManagedProcess)> {
        self.processes.iter()
    }

    pub fn registered_count(&self) -> usize {
        self.processes.values().filter(|p| p.state == ProcessState::Registered).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ResourceManager {
        ResourceManager::new(3, Duration::from_secs(10))
    }

    #[test]
    fn confirm_start_exhausts_after_limit() {
        let mut mgr = manager();
        mgr.declare("db1", ManagedProcess::new(ProcessKind::Server, "/bin/rye_server", vec![]));
        mgr.mark_started("db1", 1234).unwrap();

        assert!(!mgr.tick_confirm_start("db1").unwrap());
        assert!(!mgr.tick_confirm_start("db1").unwrap());
        assert!(mgr.tick_confirm_start("db1").unwrap(), "third attempt hits the limit of 3");
    }

    #[test]
    fn registering_stops_confirm_start_checks() {
        let mut mgr = manager();
        mgr.declare("db1", ManagedProcess::new(ProcessKind::Server, "/bin/rye_server", vec![]));
        mgr.mark_started("db1", 1234).unwrap();
        mgr.mark_registered("db1").unwrap();
        assert!(!mgr.tick_confirm_start("db1").unwrap());
    }

    #[test]
    fn recent_registration_requires_demotion_on_disconnect() {
        let mut mgr = ResourceManager::new(3, Duration::from_secs(3600));
        mgr.declare("db1", ManagedProcess::new(ProcessKind::Server, "/bin/rye_server", vec![]));
        mgr.mark_started("db1", 1234).unwrap();
        mgr.mark_registered("db1").unwrap();
        assert!(mgr.disconnection_requires_demotion("db1").unwrap());
    }

    #[test]
    fn never_registered_does_not_require_demotion() {
        let mut mgr = manager();
        mgr.declare("db1", ManagedProcess::new(ProcessKind::Server, "/bin/rye_server", vec![]));
        assert!(!mgr.disconnection_requires_demotion("db1").unwrap());
    }
}
