//! Write-combining save buffer.
//!
//! Record saves are bursty (a heartbeat wave touches many records at
//! once) and the store is remote, so saves are batched: pending snapshots
//! are keyed by server address, the newest snapshot wins, and a periodic
//! task flushes the batch. Only the timer-observed offline transition
//! bypasses this path, because that save's failure must veto the
//! transition.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::server::record::{GameServer, ServerSnapshot};
use crate::server::MasterServer;

/// How often the pending batch is flushed to the store.
pub const FLUSH_INTERVAL_MS: u64 = 1_000;

struct PendingSave {
    server: Arc<GameServer>,
    snapshot: ServerSnapshot,
}

/// Combines pending record saves. Its lock is independent of all record
/// locks; enqueue never blocks on the store.
pub struct SaveCombiner {
    pending: Mutex<HashMap<SocketAddr, PendingSave>>,
}

impl SaveCombiner {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Queue a snapshot for the next flush. A newer snapshot for the same
    /// address replaces the older one.
    pub async fn enqueue(&self, server: Arc<GameServer>, snapshot: ServerSnapshot) {
        let mut pending = self.pending.lock().await;
        pending.insert(server.address(), PendingSave { server, snapshot });
    }

    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    #[cfg(test)]
    pub async fn clear_for_test(&self) {
        self.pending.lock().await.clear();
    }

    /// Spawn the periodic flush task. Aborted by the run loop at
    /// shutdown, after which `flush_now` runs once more synchronously.
    pub fn spawn_flush_task(&self, srv: &Arc<MasterServer>) -> JoinHandle<()> {
        let srv = Arc::clone(srv);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(FLUSH_INTERVAL_MS)).await;
                srv.combiner.flush_now(&srv).await;
            }
        })
    }

    /// Flush everything currently pending. Failed saves are logged and
    /// dropped (best effort); the record keeps its state either way.
    pub async fn flush_now(&self, srv: &Arc<MasterServer>) {
        let drained: Vec<PendingSave> = {
            let mut pending = self.pending.lock().await;
            pending.drain().map(|(_, v)| v).collect()
        };
        if drained.is_empty() {
            return;
        }

        let Some(db) = &srv.db else {
            return;
        };

        let mut saved = 0u64;
        for entry in drained {
            match db.save_server(&srv.config.product_id, &entry.snapshot).await {
                Ok(id) => {
                    saved += 1;
                    if entry.snapshot.database_id == 0 {
                        let mut st = entry.server.state.lock().await;
                        if st.database_id == 0 {
                            st.database_id = id;
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(
                        "[combiner] [save_failed] addr={} err={}",
                        entry.snapshot.address,
                        e
                    );
                }
            }
        }

        tracing::debug!("[combiner] [flushed] saved={}", saved);
        if let Err(e) = db.increment_counter("server_saves", saved).await {
            tracing::debug!("[combiner] [counter_failed] err={}", e);
        }
    }
}

impl Default for SaveCombiner {
    fn default() -> Self {
        Self::new()
    }
}
