//! UDP socket multiplexer.
//!
//! Three sockets with distinct roles: the primary master-protocol port,
//! a probe socket used for liveness/status probes (so broken replies on
//! the primary path cannot be mistaken for probe replies), and the legacy
//! discovery ping port. Each socket keeps a fixed pool of receive tasks
//! perpetually posted; a task re-posts itself immediately after every
//! completion. Shutdown flips the quit flag and waits for the pending
//! receive count to drain to zero before teardown.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::server::{dispatch, MasterServer};

/// Count of receive buffers simultaneously posted per socket.
pub const BUFFER_COUNT: usize = 5;

/// Which listener a datagram arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketRole {
    Master,
    Probe,
    Ping,
}

impl SocketRole {
    fn name(self) -> &'static str {
        match self {
            SocketRole::Master => "master",
            SocketRole::Probe => "probe",
            SocketRole::Ping => "ping",
        }
    }
}

pub struct SocketSet {
    pub master: Arc<UdpSocket>,
    pub probe: Arc<UdpSocket>,
    pub ping: Arc<UdpSocket>,
}

impl SocketSet {
    /// Bind all three sockets. Any bind failure is fatal to startup.
    pub async fn bind(config: &ServerConfig) -> Result<Self> {
        Ok(Self {
            master: Arc::new(bind_one(&config.bind_ip, config.master_port, "master").await?),
            probe: Arc::new(bind_one(&config.bind_ip, config.probe_port, "probe").await?),
            ping: Arc::new(bind_one(&config.bind_ip, config.ping_port, "ping").await?),
        })
    }

    pub fn socket(&self, role: SocketRole) -> &Arc<UdpSocket> {
        match role {
            SocketRole::Master => &self.master,
            SocketRole::Probe => &self.probe,
            SocketRole::Ping => &self.ping,
        }
    }
}

async fn bind_one(ip: &str, port: u16, role: &str) -> Result<UdpSocket> {
    let bind = format!("{ip}:{port}");
    let socket = UdpSocket::bind(&bind)
        .await
        .with_context(|| format!("Cannot bind {role} socket on {bind}"))?;
    tracing::info!("[sockets] [bound] role={} addr={}", role, socket.local_addr()?);
    Ok(socket)
}

/// Spawn the receive pool for one socket. Each task owns one buffer and
/// loops: receive, hand off to the dispatcher, immediately re-post.
pub fn spawn_receive_pool(srv: &Arc<MasterServer>, role: SocketRole) -> Vec<JoinHandle<()>> {
    let frame_size = srv.mode.max_frame_size();
    (0..BUFFER_COUNT)
        .map(|_| {
            let srv = Arc::clone(srv);
            let socket = Arc::clone(srv.sockets.socket(role));
            tokio::spawn(async move {
                let mut buf = vec![0u8; frame_size];
                loop {
                    if !srv.shutdown.begin_receive() {
                        break;
                    }
                    let received = tokio::select! {
                        _ = srv.shutdown.wait_for_quit() => None,
                        res = socket.recv_from(&mut buf) => Some(res),
                    };
                    srv.shutdown.end_receive();

                    match received {
                        None => break,
                        Some(Ok((len, sender))) => {
                            dispatch::on_datagram(&srv, role, &buf[..len], sender).await;
                        }
                        Some(Err(e)) if is_reset_noise(&e) => {
                            // ICMP port-unreachable surfacing as a reset on
                            // a connectionless socket; expected, ignore.
                        }
                        Some(Err(e)) => {
                            tracing::warn!(
                                "[sockets] [recv_error] role={} err={}",
                                role.name(),
                                e
                            );
                        }
                    }
                }
            })
        })
        .collect()
}

fn is_reset_noise(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
    )
}

/// Fire-and-forget datagram send. No retry: probes are inherently repeated
/// by the timer mechanism, so a lost send corrects itself.
pub async fn send_datagram(
    srv: &MasterServer,
    role: SocketRole,
    to: SocketAddr,
    data: Vec<u8>,
) {
    if let Err(e) = srv.sockets.socket(role).send_to(&data, to).await {
        if !is_reset_noise(&e) {
            tracing::warn!(
                "[sockets] [send_error] role={} to={} err={}",
                role.name(),
                to,
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ServerConfig {
        ServerConfig::from_str(
            r#"
sql_ip: 127.0.0.1
sql_id: x
sql_pw: x
sql_db: x
bind_ip: 127.0.0.1
master_port: 0
probe_port: 0
ping_port: 0
"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_bind_ephemeral_sockets() {
        let sockets = SocketSet::bind(&test_config()).await.unwrap();
        let master = sockets.master.local_addr().unwrap();
        let probe = sockets.probe.local_addr().unwrap();
        assert_ne!(master.port(), 0);
        assert_ne!(probe.port(), 0);
        assert_ne!(master.port(), probe.port());
    }

    #[tokio::test]
    async fn test_bind_collision_is_fatal() {
        let first = SocketSet::bind(&test_config()).await.unwrap();
        let mut config = test_config();
        config.master_port = first.master.local_addr().unwrap().port();
        assert!(SocketSet::bind(&config).await.is_err());
    }
}
