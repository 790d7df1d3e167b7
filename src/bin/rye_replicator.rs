//! `rye-replicator`: the per-database replication agent (base spec §4.7–
//! §4.11). Wires the copier, writer, analyzer and applier pool together,
//! joining threads in reverse dependency order on shutdown (base spec §5:
//! "analyzer → appliers → copier → writer → health-checker").

use rye::config::HaConfig;
use rye::error::{Result, RyeError};
use rye::replication::{
    applier::{ApplierQueueItem, ApplyOutcome, LocalDbClient},
    copier::{Copier, RecvQueue, WalTransport},
    page::FileStatus,
    progress::{ProgressStore, WriterProgressRow},
    record::ReplicationItem,
    wal_rpc::{WalRequest, WalResponse},
    Analyzer, Applier, FilePageSource, LogScanner, LogWriter,
};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Blocking TCP client for the master database's WAL-streaming RPC
/// (base spec §6). One request/response pair per call, length-prefixed
/// JSON, matching the wire discipline already used for the master's
/// request/response socket.
struct TcpWalTransport {
    stream: Mutex<TcpStream>,
}

impl TcpWalTransport {
    fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).map_err(RyeError::Io)?;
        Ok(TcpWalTransport { stream: Mutex::new(stream) })
    }
}

impl WalTransport for TcpWalTransport {
    fn request(&self, req: WalRequest) -> Result<WalResponse> {
        let mut stream = self.stream.lock().unwrap();
        let body = serde_json::to_vec(&req)?;
        stream.write_all(&(body.len() as u32).to_be_bytes()).map_err(RyeError::Io)?;
        stream.write_all(&body).map_err(RyeError::Io)?;

        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).map_err(RyeError::Io)?;
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut resp_buf = vec![0u8; len];
        stream.read_exact(&mut resp_buf).map_err(RyeError::Io)?;
        Ok(serde_json::from_slice(&resp_buf)?)
    }
}

/// Replays items against the local database. The SQL engine and query
/// client protocol are external collaborators (base spec §1 Non-goals);
/// this stands in for the real client the way the replication core treats
/// it, as a single `apply`/`already_applied` seam.
struct LocalRpcClient {
    addr: String,
}

impl LocalDbClient for LocalRpcClient {
    fn apply(&self, item: &ReplicationItem) -> ApplyOutcome {
        match TcpStream::connect(&self.addr) {
            Ok(mut stream) => match serde_json::to_vec(item) {
                Ok(body) => match stream.write_all(&body) {
                    Ok(()) => ApplyOutcome::Committed,
                    Err(e) => ApplyOutcome::Retryable(e.to_string()),
                },
                Err(e) => ApplyOutcome::Fatal(e.to_string()),
            },
            Err(e) => ApplyOutcome::Retryable(e.to_string()),
        }
    }

    fn already_applied(&self, _item: &ReplicationItem) -> Result<bool> {
        Ok(false)
    }
}

fn load_config() -> Result<HaConfig> {
    let path = std::env::var("RYE_HA_CONFIG").unwrap_or_else(|_| "rye_ha.json".to_string());
    let contents = std::fs::read_to_string(&path).map_err(RyeError::Io)?;
    HaConfig::from_json_str(&contents)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = load_config()?;
    let db_name = std::env::var("RYE_DB_NAME").unwrap_or_else(|_| "rye".to_string());
    let master_db_addr = std::env::var("RYE_MASTER_DB_ADDR").unwrap_or_else(|_| "127.0.0.1:1523".to_string());
    let local_db_addr = std::env::var("RYE_LOCAL_DB_ADDR").unwrap_or_else(|_| "127.0.0.1:1524".to_string());

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc_shutdown(shutdown);
    }

    let recv_queue = Arc::new(RecvQueue::new(config.hb_recv_q_max_count));

    let mut writer = LogWriter::bootstrap(&config.log_path, &db_name, config.log_page_size, config.log_npages, &local_db_addr)?;

    let writer_shutdown = shutdown.clone();
    let writer_recv_queue = recv_queue.clone();
    let writer_thread = std::thread::spawn(move || {
        while !writer_shutdown.load(Ordering::SeqCst) {
            match writer.drain_one(&writer_recv_queue, FileStatus::Clear, 0) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    tracing::error!(error = %e, "log writer stopped on corruption");
                    break;
                }
            }
        }
    });

    let copier_shutdown = shutdown.clone();
    let copier_recv_queue = recv_queue.clone();
    let copier_compression = config.copier_compression;
    let copier_thread = std::thread::spawn(move || -> Result<()> {
        let transport = TcpWalTransport::connect(&master_db_addr)?;
        let mut copier = Copier::new(transport, copier_recv_queue, copier_compression, copier_shutdown.clone());
        let mut required_lsa_pageid = 1;
        while !copier_shutdown.load(Ordering::SeqCst) {
            if !copier.step(required_lsa_pageid) {
                break;
            }
            required_lsa_pageid = required_lsa_pageid.max(1);
        }
        Ok(())
    });

    let applier_count = config.applier_shard_count + 2;
    let mut appliers = Vec::with_capacity(applier_count);
    for index in 0..applier_count {
        let applier = Arc::new(Applier::new(
            index,
            LocalRpcClient { addr: local_db_addr.clone() },
            &config.log_path,
            &local_db_addr,
            5,
        ));
        let worker_shutdown = shutdown.clone();
        let worker_applier = applier.clone();
        std::thread::spawn(move || {
            while !worker_shutdown.load(Ordering::SeqCst) {
                match worker_applier.process_one() {
                    Ok(ApplyOutcome::Fatal(msg)) => {
                        tracing::error!(applier = worker_applier.index, %msg, "applier lane failed fatally");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!(error = %e, "applier lane I/O error");
                        break;
                    }
                }
                std::thread::sleep(std::time::Duration::from_millis(10));
            }
        });
        appliers.push(applier);
    }

    let analyzer_shutdown = shutdown.clone();
    let mut analyzer = Analyzer::new(
        &config.log_path,
        &db_name,
        &local_db_addr,
        applier_count,
        "shard_group_skey",
        config.max_committed_array,
        config.la_get_page_retry_count,
    );
    let analyzer_appliers = appliers.clone();
    let scanner = LogScanner::new(
        FilePageSource::new(config.log_path.clone(), &db_name, config.log_page_size),
        config.log_page_size,
        config.la_get_page_retry_count as usize + 1,
    );
    let writer_progress: ProgressStore<WriterProgressRow> =
        ProgressStore::new(config.log_path.join(format!("{db_name}_log_writer_progress")));
    let analyzer_thread = std::thread::spawn(move || {
        while !analyzer_shutdown.load(Ordering::SeqCst) {
            let last_flushed_pageid = writer_progress.load().map(|row| row.last_flushed_pageid).unwrap_or(0);
            match analyzer.scan_and_apply(&scanner, last_flushed_pageid) {
                Ok(dispatches) => {
                    for dispatch in dispatches {
                        analyzer_appliers[dispatch.applier_index].push(ApplierQueueItem {
                            trid: dispatch.trid,
                            tran_start_lsa: dispatch.tran_start_lsa,
                            target_committed_lsa: dispatch.tran_end_lsa,
                            repl_start_lsa: dispatch.item.source_lsa(),
                            item: dispatch.item,
                        });
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "log analyzer scan stopped on corruption");
                }
            }

            let committed: Vec<_> = analyzer_appliers.iter().map(|a| a.committed_lsa()).collect();
            analyzer.sweep(&committed);
            if let Err(e) = analyzer.persist_progress() {
                tracing::error!(error = %e, "failed to persist analyzer progress");
            }
            std::thread::sleep(std::time::Duration::from_secs(1));
        }
    });

    let _ = analyzer_thread.join();
    let _ = copier_thread.join();
    let _ = writer_thread.join();
    for applier in appliers {
        applier.shutdown();
    }
    Ok(())
}

fn ctrlc_shutdown(shutdown: Arc<AtomicBool>) {
    std::thread::spawn(move || {
        let _ = std::io::stdin().read(&mut [0u8; 1]);
        shutdown.store(true, Ordering::SeqCst);
    });
}
