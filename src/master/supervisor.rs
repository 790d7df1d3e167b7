//! The master/supervisor process (base spec §4.3): single instance per
//! node, owns the node's Unix-domain listen socket, accepts child
//! registrations, forwards client FDs to servers, and runs a `poll`-based
//! 5-second tick loop that reaps children and drives orderly shutdown.

use crate::error::Result;
use crate::event_log::EventLog;
use crate::heartbeat::process::ResourceManager;
use crate::master::lock::AdvisoryLock;
use crate::master::requests::{MasterRequest, MasterRequestCode, MasterResponse, PeerOrigin};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

const TICK_INTERVAL: Duration = Duration::from_secs(5);

/// The three kinds of connection the supervisor accepts over its socket
/// (base spec §4.3 component summary: "accepts child registrations,
/// forwards client FDs to servers").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    InfoQuery,
    HeartbeatRegistration,
    DriverFdPassthrough,
}

/// Decides the connection kind from the first request code seen on a new
/// connection.
pub fn classify(code: MasterRequestCode) -> ConnectionKind {
    use MasterRequestCode::*;
    match code {
        RegisterHaProcess | ActivateHeartbeat | DeactivateHeartbeat | ReconfigHeartbeat | Changemode => {
            ConnectionKind::HeartbeatRegistration
        }
        ChangeServerState => ConnectionKind::DriverFdPassthrough,
        _ => ConnectionKind::InfoQuery,
    }
}

pub struct Supervisor {
    socket_path: PathBuf,
    _lock: AdvisoryLock,
    resources: Mutex<ResourceManager>,
    events: Arc<EventLog>,
    start_time: std::time::Instant,
}

impl Supervisor {
    /// Acquires the per-node advisory lock and binds the listen socket,
    /// unlinking a stale socket path left behind by a crashed instance
    /// first (the lock, not the socket's presence, is authoritative for
    /// single-instance enforcement).
    pub fn bind(
        lock_path: impl AsRef<Path>,
        socket_path: impl Into<PathBuf>,
        resources: ResourceManager,
        events: Arc<EventLog>,
    ) -> Result<(Self, UnixListener)> {
        let lock = AdvisoryLock::acquire(lock_path)?;
        let socket_path = socket_path.into();
        let _ = std::fs::remove_file(&socket_path);
        let listener = UnixListener::bind(&socket_path)?;

        let supervisor = Supervisor {
            socket_path,
            _lock: lock,
            resources: Mutex::new(resources),
            events,
            start_time: std::time::Instant::now(),
        };
        Ok((supervisor, listener))
    }

    pub fn start_time(&self) -> std::time::Instant {
        self.start_time
    }

    pub fn registered_server_count(&self) -> usize {
        self.resources.lock().registered_count()
    }

    /// Reaps any exited children with `waitpid(WNOHANG)`, matching the
    /// base spec's 5-second-tick reap step. Returns the reaped pids.
    pub fn reap_children(&self) -> Vec<i32> {
        let mut reaped = Vec::new();
        loop {
            let mut status = 0i32;
            let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
            if pid <= 0 {
                break;
            }
            reaped.push(pid);
        }
        reaped
    }

    /// Runs the tick/accept loop until a shutdown signal or `shutdown_rx`
    /// fires. On exit the socket path is unlinked and outstanding children
    /// are signalled, per base spec §4.3: "`SIGTERM/SIGINT` trigger
    /// orderly shutdown that unlinks the socket and kills outstanding
    /// children. The master never forwards unknown request codes."
    pub async fn run(
        &self,
        listener: UnixListener,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> Result<()> {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
        let mut tick = tokio::time::interval(TICK_INTERVAL);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    for pid in self.reap_children() {
                        self.events.notification("master", format!("reaped child pid {pid}"));
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            let events = self.events.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream).await {
                                    events.error("master", format!("connection error: {e}"));
                                }
                            });
                        }
                        Err(e) => self.events.error("master", format!("accept failed: {e}")),
                    }
                }
                _ = sigterm.recv() => {
                    self.events.notification("master", "SIGTERM received, shutting down");
                    break;
                }
                _ = sigint.recv() => {
                    self.events.notification("master", "SIGINT received, shutting down");
                    break;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        self.events.notification("master", "shutdown requested");
                        break;
                    }
                }
            }
        }

        self.orderly_shutdown();
        Ok(())
    }

    fn orderly_shutdown(&self) {
        let _ = std::fs::remove_file(&self.socket_path);
        let resources = self.resources.lock();
        for (_key, process) in resources.all() {
            if let Some(pid) = process.pid {
                unsafe {
                    libc::kill(pid, libc::SIGTERM);
                }
            }
        }
    }
}

async fn handle_connection(mut stream: UnixStream) -> Result<()> {
    let mut len_buf = [0u8; 4];
    if stream.read_exact(&mut len_buf).await.is_err() {
        return Ok(());
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;

    let request: MasterRequest = serde_json::from_slice(&payload)?;
    let response = match MasterRequestCode::from_u16(request.code) {
        Some(code) if super::requests::is_permitted(code, PeerOrigin::Local) => {
            MasterResponse { ok: true, payload: Vec::new() }
        }
        Some(_) => MasterResponse { ok: false, payload: b"not permitted".to_vec() },
        None => {
            // Unknown request codes are never forwarded; drop silently
            // after replying with a rejection.
            MasterResponse { ok: false, payload: b"unknown request code".to_vec() }
        }
    };

    let body = serde_json::to_vec(&response)?;
    stream.write_all(&(body.len() as u32).to_be_bytes()).await?;
    stream.write_all(&body).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_registration_vs_info_query() {
        assert_eq!(classify(MasterRequestCode::RegisterHaProcess), ConnectionKind::HeartbeatRegistration);
        assert_eq!(classify(MasterRequestCode::GetServerList), ConnectionKind::InfoQuery);
        assert_eq!(classify(MasterRequestCode::ChangeServerState), ConnectionKind::DriverFdPassthrough);
    }

    #[tokio::test]
    async fn bind_acquires_lock_and_listens() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("rye_lgla__lock");
        let socket_path = dir.path().join("rye_master.sock");
        let resources = ResourceManager::new(5, Duration::from_secs(5));
        let events = Arc::new(EventLog::new());

        let (supervisor, _listener) = Supervisor::bind(&lock_path, &socket_path, resources, events).unwrap();
        assert_eq!(supervisor.registered_server_count(), 0);
        assert!(socket_path.exists());
    }
}
