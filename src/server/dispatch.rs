//! Protocol dispatcher: decodes message envelopes and routes them to
//! handlers that mutate server records and emit reply datagrams.
//!
//! Every parser here fails softly. A malformed datagram is discarded
//! without a reply, logged at trace level only, and can never take down a
//! receive task.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::protocol::codec::{begin_message, decode_envelope, ParseBuffer};
use crate::protocol::{
    cmd, connect_status, ping, ServerInfo, ACCOUNT_NAME_LEN, CDKEY_LEN, DESCRIPTION_LEN,
    MODULE_NAME_LEN, SERVER_NAME_LEN,
};
use crate::server::sockets::SocketRole;
use crate::server::MasterServer;

/// Entry point for every received datagram, tagged with the socket it
/// arrived on.
pub async fn on_datagram(
    srv: &Arc<MasterServer>,
    role: SocketRole,
    data: &[u8],
    sender: SocketAddr,
) {
    match role {
        SocketRole::Ping => on_ping_datagram(srv, data, sender).await,
        SocketRole::Master | SocketRole::Probe => {
            let Some((command, payload)) = decode_envelope(data) else {
                tracing::trace!("[dispatch] [runt] from={} len={}", sender, data.len());
                return;
            };
            let mut parser = ParseBuffer::new(payload);
            if role == SocketRole::Master {
                on_master_message(srv, command, &mut parser, sender).await;
            } else {
                on_probe_message(srv, command, &mut parser, sender).await;
            }
        }
    }
}

async fn on_master_message(
    srv: &Arc<MasterServer>,
    command: u32,
    parser: &mut ParseBuffer<'_>,
    sender: SocketAddr,
) {
    let handled = match command {
        cmd::COMMUNITY_AUTH_REQUEST => on_community_auth_request(srv, parser, sender).await,
        cmd::CDKEY_AUTH_REQUEST => on_cdkey_auth_request(srv, parser, sender).await,
        cmd::HEARTBEAT => on_heartbeat(srv, parser, sender).await,
        cmd::DISCONNECT_NOTIFY => on_disconnect_notify(srv, parser, sender).await,
        cmd::SHUTDOWN_NOTIFY => on_shutdown_notify(srv, parser, sender).await,
        cmd::STARTUP_NOTIFY => on_startup_notify(srv, parser, sender).await,
        cmd::MODULE_LOAD_NOTIFY => on_module_load_notify(srv, parser, sender).await,
        cmd::MOTD_REQUEST => on_motd_request(srv, parser, sender).await,
        cmd::VERSION_REQUEST => on_version_request(srv, parser, sender).await,
        cmd::STATUS_REQUEST => on_status_request(srv, parser, sender).await,
        _ => {
            tracing::trace!(
                "[dispatch] [unknown_cmd] cmd={:08X} from={}",
                command,
                sender
            );
            return;
        }
    };
    if handled.is_none() {
        tracing::trace!(
            "[dispatch] [malformed] cmd={:08X} from={}",
            command,
            sender
        );
    }
}

async fn on_probe_message(
    srv: &Arc<MasterServer>,
    command: u32,
    parser: &mut ParseBuffer<'_>,
    sender: SocketAddr,
) {
    let handled = match command {
        cmd::SERVER_INFO_RESPONSE => on_server_info_response(srv, parser, sender).await,
        cmd::SERVER_NAME_RESPONSE => on_server_name_response(srv, parser, sender).await,
        cmd::SERVER_DESC_RESPONSE => on_server_desc_response(srv, parser, sender).await,
        _ => {
            tracing::trace!(
                "[dispatch] [unknown_probe_cmd] cmd={:08X} from={}",
                command,
                sender
            );
            return;
        }
    };
    if handled.is_none() {
        tracing::trace!(
            "[dispatch] [malformed_probe] cmd={:08X} from={}",
            command,
            sender
        );
    }
}

async fn on_ping_datagram(srv: &Arc<MasterServer>, data: &[u8], sender: SocketAddr) {
    if data.first() != Some(&ping::ALIVE_REQUEST) {
        return;
    }
    let cookie: [u8; 2] = match data.get(1..3) {
        Some(c) => [c[0], c[1]],
        None => [0, 0],
    };
    srv.send_ping(sender, vec![ping::ALIVE_ACK, cookie[0], cookie[1]])
        .await;
}

// ---------------------------------------------------------------------
// Master protocol handlers
// ---------------------------------------------------------------------

/// A single CD-key entry in an authorization request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdKeyEntry {
    pub public_key: String,
    pub hash: Vec<u8>,
}

pub(crate) fn parse_community_auth(p: &mut ParseBuffer<'_>) -> Option<(u16, String)> {
    let data_port = p.read_u16()?;
    let challenge_len = p.read_u16()? as usize;
    p.read_bytes(challenge_len)?;
    let account = p.read_small_string(ACCOUNT_NAME_LEN)?;
    let verifier_len = p.read_u16()? as usize;
    p.read_bytes(verifier_len)?;
    let _language = p.read_u16()?;
    let _platform = p.read_u8()?;
    let _is_player = p.read_u8()?;
    Some((data_port, account))
}

async fn on_community_auth_request(
    srv: &Arc<MasterServer>,
    p: &mut ParseBuffer<'_>,
    sender: SocketAddr,
) -> Option<()> {
    let (_data_port, account) = parse_community_auth(p)?;

    let server = srv.tracker.lookup(srv, sender, true).await?;
    server.record_activity(srv, |_| false).await;

    // The protocol is deliberately permissive: any sender may claim any
    // identity, so authorization always succeeds.
    let mut reply = begin_message(cmd::COMMUNITY_AUTH_RESPONSE);
    reply.write_small_string(&account, ACCOUNT_NAME_LEN);
    reply.write_u16(connect_status::CONNECT_ERR_SUCCESS);
    srv.send_master(sender, reply.into_vec()).await;
    Some(())
}

pub(crate) fn parse_cdkey_auth(p: &mut ParseBuffer<'_>) -> Option<(u16, Vec<CdKeyEntry>)> {
    let data_port = p.read_u16()?;
    let entry_count = p.read_u16()?;
    if entry_count != 1 {
        return None;
    }
    let _client_ip = p.read_u32()?;
    let _client_port = p.read_u16()?;
    let challenge_len = p.read_u16()? as usize;
    p.read_bytes(challenge_len)?;

    let key_count = p.read_u16()?;
    let mut keys = Vec::new();
    for _ in 0..key_count {
        let public_key = p.read_small_string(CDKEY_LEN)?;
        let hash_len = p.read_u16()? as usize;
        let hash = p.read_bytes(hash_len)?.to_vec();
        keys.push(CdKeyEntry { public_key, hash });
    }
    let _account = p.read_small_string(ACCOUNT_NAME_LEN)?;
    Some((data_port, keys))
}

async fn on_cdkey_auth_request(
    srv: &Arc<MasterServer>,
    p: &mut ParseBuffer<'_>,
    sender: SocketAddr,
) -> Option<()> {
    let (_data_port, keys) = parse_cdkey_auth(p)?;

    let server = srv.tracker.lookup(srv, sender, true).await?;
    server.record_activity(srv, |_| false).await;

    let mut reply = begin_message(cmd::CDKEY_AUTH_RESPONSE);
    reply.write_u16(keys.len() as u16);
    for key in &keys {
        reply.write_small_string(&key.public_key, CDKEY_LEN);
        reply.write_u16(connect_status::CONNECT_ERR_SUCCESS);
    }
    srv.send_master(sender, reply.into_vec()).await;
    Some(())
}

pub(crate) fn parse_heartbeat(p: &mut ParseBuffer<'_>) -> Option<u16> {
    let player_count = p.read_u16()?;
    for _ in 0..player_count {
        let cdkey_count = p.read_u16()?;
        for _ in 0..cdkey_count {
            p.read_small_string(CDKEY_LEN)?;
        }
    }
    Some(player_count)
}

async fn on_heartbeat(
    srv: &Arc<MasterServer>,
    p: &mut ParseBuffer<'_>,
    sender: SocketAddr,
) -> Option<()> {
    let player_count = parse_heartbeat(p)?;
    let server = srv.tracker.lookup(srv, sender, true).await?;
    server
        .record_activity(srv, |st| set_u16(&mut st.active_players, player_count))
        .await;
    Some(())
}

pub(crate) fn parse_disconnect_notify(p: &mut ParseBuffer<'_>) -> Option<u16> {
    let _data_port = p.read_u16()?;
    let entry_count = p.read_u16()?;
    match entry_count {
        // Entry count zero doubles as a shutdown signal.
        0 => Some(0),
        1 => {
            let cdkey_count = p.read_u16()?;
            for _ in 0..cdkey_count {
                p.read_small_string(CDKEY_LEN)?;
            }
            Some(1)
        }
        _ => None,
    }
}

async fn on_disconnect_notify(
    srv: &Arc<MasterServer>,
    p: &mut ParseBuffer<'_>,
    sender: SocketAddr,
) -> Option<()> {
    let entry_count = parse_disconnect_notify(p)?;
    let server = srv.tracker.lookup(srv, sender, true).await?;
    if entry_count == 0 {
        server.record_shutdown(srv).await;
    } else {
        server.record_activity(srv, |_| false).await;
    }
    Some(())
}

async fn on_shutdown_notify(
    srv: &Arc<MasterServer>,
    p: &mut ParseBuffer<'_>,
    sender: SocketAddr,
) -> Option<()> {
    let _data_port = p.read_u16()?;
    let server = srv.tracker.lookup(srv, sender, true).await?;
    server.record_shutdown(srv).await;
    Some(())
}

pub(crate) fn parse_startup_notify(p: &mut ParseBuffer<'_>) -> Option<(u8, u16)> {
    let platform = p.read_u8()?;
    let build_number = p.read_u16()?;
    p.read_bytes(5)?; // reserved
    Some((platform, build_number))
}

async fn on_startup_notify(
    srv: &Arc<MasterServer>,
    p: &mut ParseBuffer<'_>,
    sender: SocketAddr,
) -> Option<()> {
    let (platform, build_number) = parse_startup_notify(p)?;
    let server = srv.tracker.lookup(srv, sender, true).await?;
    server
        .record_activity(srv, |st| {
            let mut changed = false;
            if st.platform != platform {
                st.platform = platform;
                changed = true;
            }
            if st.build_number != build_number {
                st.build_number = build_number;
                changed = true;
            }
            changed
        })
        .await;

    // A freshly started server has nothing loaded yet; demand an early
    // heartbeat so the directory fills in quickly.
    let reply = begin_message(cmd::DEMAND_HEARTBEAT);
    srv.send_master(sender, reply.into_vec()).await;
    Some(())
}

pub(crate) fn parse_module_load_notify(p: &mut ParseBuffer<'_>) -> Option<(u8, String)> {
    let expansions_mask = p.read_u8()?;
    let module_name = p.read_small_string(MODULE_NAME_LEN)?;
    Some((expansions_mask, module_name))
}

async fn on_module_load_notify(
    srv: &Arc<MasterServer>,
    p: &mut ParseBuffer<'_>,
    sender: SocketAddr,
) -> Option<()> {
    let (expansions_mask, module_name) = parse_module_load_notify(p)?;
    let server = srv.tracker.lookup(srv, sender, true).await?;
    server
        .record_activity(srv, |st| {
            let mut changed = false;
            if st.expansions_mask != expansions_mask {
                st.expansions_mask = expansions_mask;
                changed = true;
            }
            if st.module_name != module_name {
                st.module_name = module_name;
                changed = true;
            }
            changed
        })
        .await;
    Some(())
}

async fn on_motd_request(
    srv: &Arc<MasterServer>,
    p: &mut ParseBuffer<'_>,
    sender: SocketAddr,
) -> Option<()> {
    let _data_port = p.read_u16()?;
    let mut reply = begin_message(cmd::MOTD_RESPONSE);
    reply.write_small_string(&srv.config.motd, 255);
    srv.send_master(sender, reply.into_vec()).await;
    Some(())
}

async fn on_version_request(
    srv: &Arc<MasterServer>,
    p: &mut ParseBuffer<'_>,
    sender: SocketAddr,
) -> Option<()> {
    let _data_port = p.read_u16()?;
    let mut reply = begin_message(cmd::VERSION_RESPONSE);
    reply.write_u16(srv.config.build_number);
    srv.send_master(sender, reply.into_vec()).await;
    Some(())
}

/// Status request: the one message that feeds the NAT-duplicate machinery.
/// The claimed internal data port is compared against the observed UDP
/// source port; a mismatch means a NAT gateway rewrote the source, so both
/// addresses are probed and the internal record remembers its suspected
/// external twin.
async fn on_status_request(
    srv: &Arc<MasterServer>,
    p: &mut ParseBuffer<'_>,
    sender: SocketAddr,
) -> Option<()> {
    let data_port = p.read_u16()?;
    let internal_addr = SocketAddr::new(sender.ip(), data_port);

    if data_port == sender.port() {
        let server = srv.tracker.lookup(srv, sender, true).await?;
        server.record_activity(srv, |_| false).await;
        srv.tracker.request_probe(srv, &server).await;
    } else {
        let internal = srv.tracker.lookup(srv, internal_addr, true).await?;
        let external = srv.tracker.lookup(srv, sender, true).await?;
        {
            let mut st = internal.state.lock().await;
            st.internal_data_port = data_port;
            st.nat_check_peer = Some(sender);
        }
        {
            let mut st = external.state.lock().await;
            st.internal_data_port = data_port;
        }
        srv.tracker.request_probe(srv, &internal).await;
        srv.tracker.request_probe(srv, &external).await;
    }

    let mut reply = begin_message(cmd::STATUS_RESPONSE);
    reply.write_u16(srv.config.build_number);
    reply.write_u16(srv.tracker.online_count().await as u16);
    srv.send_master(sender, reply.into_vec()).await;
    Some(())
}

// ---------------------------------------------------------------------
// Probe protocol handlers
// ---------------------------------------------------------------------

async fn on_server_info_response(
    srv: &Arc<MasterServer>,
    p: &mut ParseBuffer<'_>,
    sender: SocketAddr,
) -> Option<()> {
    let info = ServerInfo::read(p, srv.mode)?;

    let server = srv.tracker.lookup(srv, sender, true).await?;
    server.record_activity(srv, |st| st.apply_info(&info)).await;

    // Resolve a pending NAT-duplicate pair: now that this record's own
    // configuration is fresh, compare it against the suspected twin.
    let peer = {
        let mut st = server.state.lock().await;
        st.nat_check_peer.take()
    };
    if let Some(peer_addr) = peer {
        if let Some(external) = srv.tracker.lookup(srv, peer_addr, false).await {
            server.check_for_nat_duplicate(&external, srv).await;
        }
    }
    Some(())
}

async fn on_server_name_response(
    srv: &Arc<MasterServer>,
    p: &mut ParseBuffer<'_>,
    sender: SocketAddr,
) -> Option<()> {
    let name = p.read_small_string(SERVER_NAME_LEN)?;
    let server = srv.tracker.lookup(srv, sender, true).await?;
    server
        .record_activity(srv, |st| set_string(&mut st.server_name, name))
        .await;
    Some(())
}

pub(crate) fn parse_server_desc(
    p: &mut ParseBuffer<'_>,
) -> Option<(String, String, String)> {
    let server_description = p.read_string16(DESCRIPTION_LEN)?;
    let module_description = p.read_string16(DESCRIPTION_LEN)?;
    let module_url = p.read_string16(DESCRIPTION_LEN)?;
    Some((server_description, module_description, module_url))
}

async fn on_server_desc_response(
    srv: &Arc<MasterServer>,
    p: &mut ParseBuffer<'_>,
    sender: SocketAddr,
) -> Option<()> {
    let (server_description, module_description, module_url) = parse_server_desc(p)?;
    let server = srv.tracker.lookup(srv, sender, true).await?;
    server
        .record_activity(srv, |st| {
            let mut changed = false;
            changed |= set_string(&mut st.server_description, server_description);
            changed |= set_string(&mut st.module_description, module_description);
            changed |= set_string(&mut st.module_url, module_url);
            changed
        })
        .await;
    Some(())
}

// ---------------------------------------------------------------------
// Outbound probes
// ---------------------------------------------------------------------

/// Refresh a server's status: one info, one name and one description
/// request, all sent from the probe socket so replies come back there.
pub async fn refresh_server_status(srv: &Arc<MasterServer>, to: SocketAddr) {
    let reply_port = srv.probe_addr().port();
    for request in [
        cmd::SERVER_INFO_REQUEST,
        cmd::SERVER_NAME_REQUEST,
        cmd::SERVER_DESC_REQUEST,
    ] {
        let mut msg = begin_message(request);
        msg.write_u16(reply_port);
        srv.send_probe(to, msg.into_vec()).await;
    }
}

fn set_u16(field: &mut u16, value: u16) -> bool {
    if *field != value {
        *field = value;
        true
    } else {
        false
    }
}

fn set_string(field: &mut String, value: String) -> bool {
    if *field != value {
        *field = value;
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::BuildBuffer;

    fn build_community_auth() -> Vec<u8> {
        let mut b = BuildBuffer::new();
        b.write_u16(5121); // data port
        b.write_u16(4);
        b.write_bytes(&[1, 2, 3, 4]); // challenge
        b.write_small_string("adventurer", ACCOUNT_NAME_LEN);
        b.write_u16(2);
        b.write_bytes(&[9, 9]); // verifier
        b.write_u16(0); // language
        b.write_u8(b'W'); // platform
        b.write_u8(1); // is player
        b.into_vec()
    }

    #[test]
    fn test_parse_community_auth() {
        let bytes = build_community_auth();
        let mut p = ParseBuffer::new(&bytes);
        let (port, account) = parse_community_auth(&mut p).unwrap();
        assert_eq!(port, 5121);
        assert_eq!(account, "adventurer");
    }

    #[test]
    fn test_parse_community_auth_truncated() {
        let bytes = build_community_auth();
        for cut in 0..bytes.len() {
            let mut p = ParseBuffer::new(&bytes[..cut]);
            assert!(parse_community_auth(&mut p).is_none(), "cut={cut}");
        }
    }

    fn build_cdkey_auth(entry_count: u16) -> Vec<u8> {
        let mut b = BuildBuffer::new();
        b.write_u16(5121);
        b.write_u16(entry_count);
        b.write_u32(0x0100007F); // client ip
        b.write_u16(40000); // client port
        b.write_u16(0);
        b.write_u16(2); // two keys
        for key in ["QWERTYUI", "ASDFGHJK"] {
            b.write_small_string(key, CDKEY_LEN);
            b.write_u16(3);
            b.write_bytes(&[0xAA, 0xBB, 0xCC]);
        }
        b.write_small_string("adventurer", ACCOUNT_NAME_LEN);
        b.into_vec()
    }

    #[test]
    fn test_parse_cdkey_auth() {
        let bytes = build_cdkey_auth(1);
        let mut p = ParseBuffer::new(&bytes);
        let (port, keys) = parse_cdkey_auth(&mut p).unwrap();
        assert_eq!(port, 5121);
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].public_key, "QWERTYUI");
        assert_eq!(keys[1].hash, vec![0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn test_parse_cdkey_auth_rejects_bad_entry_count() {
        for count in [0u16, 2, 7] {
            let bytes = build_cdkey_auth(count);
            let mut p = ParseBuffer::new(&bytes);
            assert!(parse_cdkey_auth(&mut p).is_none());
        }
    }

    #[test]
    fn test_parse_heartbeat_nested_lists() {
        let mut b = BuildBuffer::new();
        b.write_u16(2); // two players
        b.write_u16(2); // first has two keys
        b.write_small_string("KEY1", CDKEY_LEN);
        b.write_small_string("KEY2", CDKEY_LEN);
        b.write_u16(1);
        b.write_small_string("KEY3", CDKEY_LEN);
        let bytes = b.into_vec();
        let mut p = ParseBuffer::new(&bytes);
        assert_eq!(parse_heartbeat(&mut p), Some(2));
    }

    #[test]
    fn test_parse_heartbeat_zero_players() {
        let mut b = BuildBuffer::new();
        b.write_u16(0);
        let bytes = b.into_vec();
        let mut p = ParseBuffer::new(&bytes);
        assert_eq!(parse_heartbeat(&mut p), Some(0));
    }

    #[test]
    fn test_parse_heartbeat_truncated_player_list() {
        let mut b = BuildBuffer::new();
        b.write_u16(3); // claims three players, provides none
        let bytes = b.into_vec();
        let mut p = ParseBuffer::new(&bytes);
        assert!(parse_heartbeat(&mut p).is_none());
    }

    #[test]
    fn test_parse_disconnect_notify_entry_counts() {
        // Zero entries: shutdown signal.
        let mut b = BuildBuffer::new();
        b.write_u16(5121);
        b.write_u16(0);
        let bytes = b.into_vec();
        assert_eq!(parse_disconnect_notify(&mut ParseBuffer::new(&bytes)), Some(0));

        // One entry with a key list.
        let mut b = BuildBuffer::new();
        b.write_u16(5121);
        b.write_u16(1);
        b.write_u16(1);
        b.write_small_string("KEY1", CDKEY_LEN);
        let bytes = b.into_vec();
        assert_eq!(parse_disconnect_notify(&mut ParseBuffer::new(&bytes)), Some(1));

        // Anything else is out of grammar.
        let mut b = BuildBuffer::new();
        b.write_u16(5121);
        b.write_u16(2);
        let bytes = b.into_vec();
        assert!(parse_disconnect_notify(&mut ParseBuffer::new(&bytes)).is_none());
    }

    #[test]
    fn test_parse_startup_notify() {
        let mut b = BuildBuffer::new();
        b.write_u8(b'L');
        b.write_u16(8193);
        b.write_bytes(&[0, 0, 1, 0, 3]);
        let bytes = b.into_vec();
        let mut p = ParseBuffer::new(&bytes);
        assert_eq!(parse_startup_notify(&mut p), Some((b'L', 8193)));

        // Short reserved block fails.
        let mut p = ParseBuffer::new(&bytes[..bytes.len() - 1]);
        assert!(parse_startup_notify(&mut p).is_none());
    }

    #[test]
    fn test_parse_module_load_notify() {
        let mut b = BuildBuffer::new();
        b.write_u8(0x03);
        b.write_small_string("Underdark", MODULE_NAME_LEN);
        let bytes = b.into_vec();
        let mut p = ParseBuffer::new(&bytes);
        assert_eq!(
            parse_module_load_notify(&mut p),
            Some((0x03, "Underdark".to_string()))
        );
    }

    #[test]
    fn test_parse_server_desc() {
        let mut b = BuildBuffer::new();
        b.write_string16("a world", DESCRIPTION_LEN);
        b.write_string16("a module", DESCRIPTION_LEN);
        b.write_string16("http://mod.example.com", DESCRIPTION_LEN);
        let bytes = b.into_vec();
        let mut p = ParseBuffer::new(&bytes);
        let (sd, md, url) = parse_server_desc(&mut p).unwrap();
        assert_eq!(sd, "a world");
        assert_eq!(md, "a module");
        assert_eq!(url, "http://mod.example.com");
    }
}
