//! Server tracker: the process-wide directory of known game servers.
//!
//! A single structural lock guards the address map; individual field
//! mutations go through each record's own lock so unrelated servers never
//! contend. Probe emission is serialized through a shared lock, which also
//! doubles as the drain barrier at shutdown.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;

use crate::server::record::GameServer;
use crate::server::{dispatch, MasterServer};

pub struct ServerTracker {
    servers: Mutex<HashMap<SocketAddr, Arc<GameServer>>>,
    probe_lock: tokio::sync::Mutex<()>,
    probes_enabled: AtomicBool,
}

impl ServerTracker {
    pub fn new() -> Self {
        Self {
            servers: Mutex::new(HashMap::new()),
            probe_lock: tokio::sync::Mutex::new(()),
            probes_enabled: AtomicBool::new(true),
        }
    }

    /// Look up a game server by address, optionally creating it on first
    /// contact. A freshly created record is hydrated from any persisted row
    /// for its address.
    pub async fn lookup(
        &self,
        srv: &Arc<MasterServer>,
        address: SocketAddr,
        create: bool,
    ) -> Option<Arc<GameServer>> {
        let (server, created) = {
            let mut table = self.servers.lock().expect("server table poisoned");
            match table.get(&address) {
                Some(s) => (Arc::clone(s), false),
                None if create => {
                    let s = GameServer::new(address);
                    table.insert(address, Arc::clone(&s));
                    (s, true)
                }
                None => return None,
            }
        };

        if created {
            self.hydrate(srv, &server).await;
        }
        Some(server)
    }

    /// Load any persisted row for a newly inserted record. Fields are only
    /// applied while the record still looks untouched, so a message that
    /// raced the hydration wins.
    async fn hydrate(&self, srv: &Arc<MasterServer>, server: &Arc<GameServer>) {
        let Some(db) = &srv.db else { return };
        let row = match db
            .load_one(&srv.config.product_id, &server.address().to_string())
            .await
        {
            Ok(row) => row,
            Err(e) => {
                tracing::warn!(
                    "[tracker] [hydrate_failed] addr={} err={}",
                    server.address(),
                    e
                );
                return;
            }
        };
        if let Some(row) = row {
            let mut st = server.state.lock().await;
            if st.database_id == 0 {
                row.apply_to(&mut st);
                // Hydration never resurrects a record: liveness comes from
                // the wire or from the startup scan, not from this path.
                st.online = false;
            }
        }
    }

    /// Bulk load of the persisted directory at startup, plus the queue of
    /// externally registered addresses awaiting first contact.
    pub async fn initial_load(&self, srv: &Arc<MasterServer>) -> anyhow::Result<()> {
        let Some(db) = &srv.db else { return Ok(()) };

        let rows = db.load_all(&srv.config.product_id).await?;
        let mut loaded = 0usize;
        for row in rows {
            let Some(address) = row.parse_address() else {
                tracing::warn!("[tracker] [bad_address] row id={} addr={}", row.server_id, row.server_address);
                continue;
            };
            let server = GameServer::new(address);
            {
                let mut st = server.state.lock().await;
                row.apply_to(&mut st);
                st.initial_heartbeat = true;
            }
            let mut table = self.servers.lock().expect("server table poisoned");
            table.entry(address).or_insert(server);
            loaded += 1;
        }

        let pending = db.take_pending(&srv.config.product_id).await?;
        let mut queued = 0usize;
        for addr_text in pending {
            let Ok(address) = addr_text.parse::<SocketAddr>() else {
                tracing::warn!("[tracker] [bad_pending_address] addr={}", addr_text);
                continue;
            };
            let mut table = self.servers.lock().expect("server table poisoned");
            table.entry(address).or_insert_with(|| {
                queued += 1;
                GameServer::new(address)
            });
        }

        tracing::info!(
            "[tracker] [initial_load] loaded={} pending={}",
            loaded,
            queued
        );
        Ok(())
    }

    /// Restart re-probe timers for every record persisted as online and
    /// still within the liveness cutoff; demote the rest to offline.
    pub async fn queue_initial_heartbeats(&self, srv: &Arc<MasterServer>) {
        let now = Utc::now();
        for server in self.all_servers() {
            let mut st = server.state.lock().await;
            if !st.online {
                continue;
            }
            let fresh = match st.last_heartbeat {
                Some(hb) => {
                    hb >= now || (now - hb).num_seconds() <= super::record::SERVER_LIFETIME_SECS
                }
                None => false,
            };
            if fresh {
                server.start_heartbeat(&mut st, srv);
            } else {
                st.online = false;
                st.last_saved = None;
                let snap = st.snapshot(server.address());
                srv.combiner.enqueue(Arc::clone(&server), snap).await;
            }
        }
    }

    /// Send one immediate probe to every record that has no live timer
    /// (pending registrations and demoted rows get one chance to answer).
    pub async fn probe_dormant(&self, srv: &Arc<MasterServer>) {
        for server in self.all_servers() {
            let dormant = {
                let st = server.state.lock().await;
                !st.timer_running()
            };
            if dormant && !self.request_probe(srv, &server).await {
                break;
            }
        }
    }

    /// Emit a status probe toward a server. Returns false without sending
    /// once probing has been disabled for shutdown. Probe emission is
    /// serialized so concurrent timers cannot flood the probe channel.
    pub async fn request_probe(&self, srv: &Arc<MasterServer>, server: &Arc<GameServer>) -> bool {
        if !self.probes_enabled.load(Ordering::SeqCst) {
            return false;
        }
        let _guard = self.probe_lock.lock().await;
        if !self.probes_enabled.load(Ordering::SeqCst) {
            return false;
        }
        dispatch::refresh_server_status(srv, server.address()).await;
        true
    }

    /// Disable future probes and wait out any probe currently in flight.
    pub async fn drain_heartbeats(&self) {
        self.probes_enabled.store(false, Ordering::SeqCst);
        // Barrier: once we have held the probe lock, no sender that
        // observed probes as enabled can still be mid-send.
        drop(self.probe_lock.lock().await);
    }

    pub fn server_count(&self) -> usize {
        self.servers.lock().expect("server table poisoned").len()
    }

    /// Count of records currently marked online.
    pub async fn online_count(&self) -> usize {
        let mut n = 0;
        for server in self.all_servers() {
            if server.state.lock().await.online {
                n += 1;
            }
        }
        n
    }

    fn all_servers(&self) -> Vec<Arc<GameServer>> {
        self.servers
            .lock()
            .expect("server table poisoned")
            .values()
            .cloned()
            .collect()
    }
}

impl Default for ServerTracker {
    fn default() -> Self {
        Self::new()
    }
}
