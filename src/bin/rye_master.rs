//! `rye-master`: the per-node supervisor process (base spec §4.3, §9
//! "init during startup in dependency order: SHM → monitor → master →
//! heartbeat → replication; teardown in reverse").

use rye::config::HaConfig;
use rye::event_log::EventLog;
use rye::heartbeat::process::ResourceManager;
use rye::master::Supervisor;
use rye::monitor::StatsCollector;
use rye::shm::master_region::MasterRegion;
use std::path::PathBuf;
use std::sync::Arc;

const DEFAULT_CONFIG_PATH: &str = "rye_ha.json";
const DEFAULT_SOCKET_PATH: &str = "/tmp/rye_master.sock";
const DEFAULT_LOCK_PATH: &str = "/tmp/rye_master.lock";
const MASTER_SHM_KEY: i32 = 0x52594501u32 as i32;

fn load_config() -> rye::Result<HaConfig> {
    let path = std::env::var("RYE_HA_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    match std::fs::read_to_string(&path) {
        Ok(contents) => HaConfig::from_json_str(&contents),
        Err(_) => {
            tracing::warn!(path, "no HA config file found, refusing to start without this_node/node_list");
            Err(rye::RyeError::Configuration(format!("missing config file at {path}")))
        }
    }
}

#[tokio::main]
async fn main() -> rye::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = load_config()?;
    let events = Arc::new(EventLog::new());
    let mut stats = StatsCollector::new();
    events.notification("master", format!("starting as node '{}'", config.this_node));

    let region = match MasterRegion::create(MASTER_SHM_KEY) {
        Ok(region) => region,
        Err(_) => MasterRegion::attach(MASTER_SHM_KEY, false)?,
    };
    for node in &config.node_list {
        region.upsert_node(&node.name, node.priority, rye::heartbeat::NodeState::Unknown, 0, 0, 0, 0)?;
    }

    let resources = ResourceManager::new(config.confirm_start_retry_limit, config.unacceptable_proc_restart_timediff);
    let socket_path = std::env::var("RYE_MASTER_SOCKET").unwrap_or_else(|_| DEFAULT_SOCKET_PATH.to_string());
    let lock_path = std::env::var("RYE_MASTER_LOCK").unwrap_or_else(|_| DEFAULT_LOCK_PATH.to_string());
    let (supervisor, listener) =
        Supervisor::bind(PathBuf::from(&lock_path), PathBuf::from(&socket_path), resources, events.clone())?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);

    let heartbeat_events = events.clone();
    let heartbeat_config = config.clone();
    let heartbeat_shutdown = shutdown_tx.clone();
    let heartbeat_task = tokio::spawn(async move {
        if let Err(e) = run_heartbeat_loop(heartbeat_config, heartbeat_events, region, heartbeat_shutdown).await {
            tracing::error!(error = %e, "heartbeat loop exited");
        }
    });

    let _ = stats.declare("master.connections_accepted", 0, rye::monitor::StatKind::Counter);

    supervisor.run(listener, shutdown_rx).await?;
    let _ = shutdown_tx.send(true);
    let _ = heartbeat_task.await;
    Ok(())
}

async fn run_heartbeat_loop(
    config: HaConfig,
    events: Arc<EventLog>,
    region: MasterRegion,
    shutdown: Arc<tokio::sync::watch::Sender<bool>>,
) -> rye::Result<()> {
    use rye::heartbeat::controller::HeartbeatController;
    use rye::heartbeat::gossip::GossipSocket;

    let this = config.node_list.iter().find(|n| n.name == config.this_node).ok_or_else(|| {
        rye::RyeError::Configuration(format!("this_node '{}' not in node_list", config.this_node))
    })?;
    let socket = GossipSocket::bind(this.addr).await?;
    let group_id = [0u8; 16];
    let controller = HeartbeatController::new(config.clone(), group_id, events.clone());

    let mut interval = tokio::time::interval(config.heartbeat_interval);
    let mut shutdown_rx = shutdown.subscribe();
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let _ = controller.broadcast(&socket).await;
                let _ = controller.run_scoring_tick();
                let _ = controller.publish_to_shm(&region);
            }
            recv = socket.recv() => {
                if let Ok((datagram, from)) = recv {
                    controller.apply_incoming(&datagram, &from.to_string());
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
    Ok(())
}
