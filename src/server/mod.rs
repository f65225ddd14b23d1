//! Master server aggregate: configuration, sockets, tracker, persistence
//! and the run loop that ties them together.

pub mod dispatch;
pub mod record;
pub mod sockets;
pub mod tracker;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::MySqlPool;

use crate::config::ServerConfig;
use crate::core::{create_shutdown_state, SharedShutdownState};
use crate::database::combiner::SaveCombiner;
use crate::database::MasterDatabase;
use crate::protocol::GameMode;
use crate::server::sockets::{SocketRole, SocketSet};

pub struct MasterServer {
    pub config: ServerConfig,
    pub mode: GameMode,
    pub db: Option<MasterDatabase>,
    pub tracker: tracker::ServerTracker,
    pub combiner: SaveCombiner,
    pub shutdown: SharedShutdownState,
    pub(crate) sockets: SocketSet,
}

impl MasterServer {
    /// Bind sockets and assemble the server. A bind failure here aborts
    /// startup entirely.
    pub async fn new(config: ServerConfig, pool: Option<MySqlPool>) -> Result<Arc<Self>> {
        let sockets = SocketSet::bind(&config).await?;
        let mode = config.mode();
        Ok(Arc::new(Self {
            mode,
            db: pool.map(MasterDatabase::new),
            tracker: tracker::ServerTracker::new(),
            combiner: SaveCombiner::new(),
            shutdown: create_shutdown_state(),
            sockets,
            config,
        }))
    }

    /// An in-process server with ephemeral loopback ports and no database,
    /// for unit and integration tests.
    pub async fn test_only() -> Arc<Self> {
        let yaml = r#"
sql_ip: 127.0.0.1
sql_id: test
sql_pw: test
sql_db: test
bind_ip: 127.0.0.1
master_port: 0
probe_port: 0
ping_port: 0
"#;
        let config = ServerConfig::from_str(yaml).expect("test config must parse");
        Self::new(config, None).await.expect("test bind must succeed")
    }

    /// Synchronously execute the server until a quit is requested, then
    /// drain in order: probes first, then outstanding receives, then the
    /// batched writes.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        self.tracker
            .initial_load(self)
            .await
            .context("Cannot load server directory from store")?;

        let mut receive_tasks = Vec::new();
        for role in [SocketRole::Master, SocketRole::Probe, SocketRole::Ping] {
            receive_tasks.extend(sockets::spawn_receive_pool(self, role));
        }

        self.tracker.queue_initial_heartbeats(self).await;
        self.tracker.probe_dormant(self).await;

        let flush_task = self.combiner.spawn_flush_task(self);

        tracing::info!(
            "[master] [started] servers={} mode={:?}",
            self.tracker.server_count(),
            self.mode
        );

        self.shutdown.wait_for_quit().await;
        tracing::info!("[master] [stopping] draining probes and receives");

        self.tracker.drain_heartbeats().await;
        for task in receive_tasks {
            let _ = task.await;
        }
        flush_task.abort();
        self.combiner.flush_now(self).await;

        tracing::info!("[master] [stopped]");
        Ok(())
    }

    /// Request an asynchronous stop.
    pub fn stop(&self) {
        self.shutdown.request_quit();
    }

    pub async fn send_master(&self, to: SocketAddr, data: Vec<u8>) {
        sockets::send_datagram(self, SocketRole::Master, to, data).await;
    }

    pub async fn send_probe(&self, to: SocketAddr, data: Vec<u8>) {
        sockets::send_datagram(self, SocketRole::Probe, to, data).await;
    }

    pub async fn send_ping(&self, to: SocketAddr, data: Vec<u8>) {
        sockets::send_datagram(self, SocketRole::Ping, to, data).await;
    }

    /// Local addresses, mainly for tests driving real datagrams.
    pub fn master_addr(&self) -> SocketAddr {
        self.sockets.master.local_addr().expect("bound socket")
    }

    pub fn probe_addr(&self) -> SocketAddr {
        self.sockets.probe.local_addr().expect("bound socket")
    }

    pub fn ping_addr(&self) -> SocketAddr {
        self.sockets.ping.local_addr().expect("bound socket")
    }
}
