//! Wire protocol definitions for the master server.
//!
//! Three families share the ground here:
//! - the master protocol (`BM**` commands, game server -> master, plus the
//!   replies the master sends back),
//! - the probe sub-protocol (`BN**` commands the master sends from its
//!   probe socket to refresh server status, and the responses),
//! - a legacy single-byte ping protocol on its own well-known port.

pub mod codec;

use codec::{BuildBuffer, ParseBuffer};

/// Master protocol command codes. Four ASCII bytes interpreted as a
/// little-endian u32, matching the legacy dispatch table.
pub mod cmd {
    /// "BMPA" - community authorization request.
    pub const COMMUNITY_AUTH_REQUEST: u32 = 0x41504d42;
    /// "BMPR" - community authorization response.
    pub const COMMUNITY_AUTH_RESPONSE: u32 = 0x52504d42;
    /// "BMAU" - CD-key authorization request.
    pub const CDKEY_AUTH_REQUEST: u32 = 0x55414d42;
    /// "BMAR" - CD-key authorization response.
    pub const CDKEY_AUTH_RESPONSE: u32 = 0x52414d42;
    /// "BMHB" - heartbeat (carries the player list).
    pub const HEARTBEAT: u32 = 0x42484d42;
    /// "BMDC" - disconnect notify; entry count 0 doubles as shutdown.
    pub const DISCONNECT_NOTIFY: u32 = 0x43444d42;
    /// "BMST" - shutdown notify.
    pub const SHUTDOWN_NOTIFY: u32 = 0x54534d42;
    /// "BMSU" - startup notify.
    pub const STARTUP_NOTIFY: u32 = 0x55534d42;
    /// "BMMO" - module load notify.
    pub const MODULE_LOAD_NOTIFY: u32 = 0x4f4d4d42;
    /// "BMMA" / "BMMB" - message-of-the-day request/response.
    pub const MOTD_REQUEST: u32 = 0x414d4d42;
    pub const MOTD_RESPONSE: u32 = 0x424d4d42;
    /// "BMRA" / "BMRB" - version request/response.
    pub const VERSION_REQUEST: u32 = 0x41524d42;
    pub const VERSION_RESPONSE: u32 = 0x42524d42;
    /// "BMSA" / "BMSB" - status request/response.
    pub const STATUS_REQUEST: u32 = 0x41534d42;
    pub const STATUS_RESPONSE: u32 = 0x42534d42;
    /// "BMDH" - heartbeat demand, master -> game server.
    pub const DEMAND_HEARTBEAT: u32 = 0x48444d42;

    /// "BNXI" / "BNXR" - extended server info request/response.
    pub const SERVER_INFO_REQUEST: u32 = 0x49584e42;
    pub const SERVER_INFO_RESPONSE: u32 = 0x52584e42;
    /// "BNES" / "BNER" - server name request/response.
    pub const SERVER_NAME_REQUEST: u32 = 0x53454e42;
    pub const SERVER_NAME_RESPONSE: u32 = 0x52454e42;
    /// "BNDS" / "BNDR" - server description request/response.
    pub const SERVER_DESC_REQUEST: u32 = 0x53444e42;
    pub const SERVER_DESC_RESPONSE: u32 = 0x52444e42;
}

/// Legacy discovery ping protocol (single-byte opcodes).
pub mod ping {
    pub const ALIVE_REQUEST: u8 = 0x05;
    pub const ALIVE_ACK: u8 = 0x06;
}

/// Connect status codes carried in authorization responses.
pub mod connect_status {
    pub const CONNECT_ERR_SUCCESS: u16 = 0;
}

/// Which product family's wire layout is in force. The master tracks one
/// product at a time; the mode gates the `BNXR` parse path and the expected
/// reserved byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameMode {
    Nwn1,
    Nwn2,
}

impl GameMode {
    /// The magic reserved byte leading a `BNXR` payload for this mode.
    pub fn info_reserved_byte(self) -> u8 {
        match self {
            GameMode::Nwn1 => 0xFC,
            GameMode::Nwn2 => 0xFD,
        }
    }

    /// Maximum datagram frame accepted on any socket in this mode.
    pub fn max_frame_size(self) -> usize {
        match self {
            GameMode::Nwn1 => 1472,
            GameMode::Nwn2 => 3200,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "nwn1" => Some(GameMode::Nwn1),
            "nwn2" => Some(GameMode::Nwn2),
            _ => None,
        }
    }
}

pub const MODULE_NAME_LEN: usize = 32;
pub const SERVER_NAME_LEN: usize = 48;
pub const DESCRIPTION_LEN: usize = 256;
pub const PWC_URL_LEN: usize = 256;
pub const CDKEY_LEN: usize = 16;
pub const ACCOUNT_NAME_LEN: usize = 16;

/// Configuration snapshot carried by a `BNXR` extended-info response.
///
/// The field set doubles as the NAT-duplicate comparison basis, so every
/// member here is part of the observable server identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerInfo {
    pub has_player_password: bool,
    pub min_level: u8,
    pub max_level: u8,
    pub active_players: u8,
    pub maximum_players: u8,
    pub local_vault: bool,
    pub pvp_level: u8,
    pub player_pause: bool,
    pub one_party_only: bool,
    pub elc_enforced: bool,
    pub ilr_enforced: bool,
    pub expansions_mask: u8,
    pub module_name: String,
    pub build_number: u16,
    /// Mode-two extension fields; zero/empty under mode one.
    pub game_type: u16,
    pub pwc_url: String,
}

impl ServerInfo {
    /// Parses a `BNXR` payload. The leading reserved byte must match the
    /// configured mode, otherwise the datagram is from the wrong product
    /// and is discarded.
    pub fn read(p: &mut ParseBuffer<'_>, mode: GameMode) -> Option<Self> {
        if p.read_u8()? != mode.info_reserved_byte() {
            return None;
        }
        let mut info = ServerInfo {
            has_player_password: p.read_u8()? != 0,
            min_level: p.read_u8()?,
            max_level: p.read_u8()?,
            active_players: p.read_u8()?,
            maximum_players: p.read_u8()?,
            local_vault: p.read_u8()? != 0,
            pvp_level: p.read_u8()?,
            player_pause: p.read_u8()? != 0,
            one_party_only: p.read_u8()? != 0,
            elc_enforced: p.read_u8()? != 0,
            ilr_enforced: p.read_u8()? != 0,
            expansions_mask: p.read_u8()?,
            module_name: p.read_small_string(MODULE_NAME_LEN)?,
            build_number: p.read_u16()?,
            ..Default::default()
        };
        if mode == GameMode::Nwn2 {
            info.game_type = p.read_u16()?;
            info.pwc_url = p.read_string16(PWC_URL_LEN)?;
        }
        Some(info)
    }

    /// Encodes the payload of a `BNXR` response (used by tests and by the
    /// simulator side of the integration suite).
    pub fn write(&self, b: &mut BuildBuffer, mode: GameMode) {
        b.write_u8(mode.info_reserved_byte());
        b.write_u8(self.has_player_password as u8);
        b.write_u8(self.min_level);
        b.write_u8(self.max_level);
        b.write_u8(self.active_players);
        b.write_u8(self.maximum_players);
        b.write_u8(self.local_vault as u8);
        b.write_u8(self.pvp_level);
        b.write_u8(self.player_pause as u8);
        b.write_u8(self.one_party_only as u8);
        b.write_u8(self.elc_enforced as u8);
        b.write_u8(self.ilr_enforced as u8);
        b.write_u8(self.expansions_mask);
        b.write_small_string(&self.module_name, MODULE_NAME_LEN);
        b.write_u16(self.build_number);
        if mode == GameMode::Nwn2 {
            b.write_u16(self.game_type);
            b.write_string16(&self.pwc_url, PWC_URL_LEN);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::{begin_message, decode_envelope};

    fn sample_info() -> ServerInfo {
        ServerInfo {
            has_player_password: false,
            min_level: 1,
            max_level: 40,
            active_players: 12,
            maximum_players: 64,
            local_vault: true,
            pvp_level: 2,
            player_pause: false,
            one_party_only: false,
            elc_enforced: true,
            ilr_enforced: true,
            expansions_mask: 0x03,
            module_name: "Endless Nights".to_string(),
            build_number: 8193,
            game_type: 9,
            pwc_url: "http://pw.example.com/client".to_string(),
        }
    }

    #[test]
    fn test_command_codes_are_ascii_mnemonics() {
        assert_eq!(&cmd::HEARTBEAT.to_le_bytes(), b"BMHB");
        assert_eq!(&cmd::STARTUP_NOTIFY.to_le_bytes(), b"BMSU");
        assert_eq!(&cmd::SERVER_INFO_REQUEST.to_le_bytes(), b"BNXI");
        assert_eq!(&cmd::SERVER_INFO_RESPONSE.to_le_bytes(), b"BNXR");
        assert_eq!(&cmd::SERVER_NAME_REQUEST.to_le_bytes(), b"BNES");
        assert_eq!(&cmd::SERVER_DESC_RESPONSE.to_le_bytes(), b"BNDR");
    }

    #[test]
    fn test_server_info_roundtrip_nwn1() {
        let mut info = sample_info();
        // Mode-one layout carries no extension fields.
        info.game_type = 0;
        info.pwc_url = String::new();

        let mut b = BuildBuffer::new();
        info.write(&mut b, GameMode::Nwn1);
        let bytes = b.into_vec();
        let mut p = ParseBuffer::new(&bytes);
        assert_eq!(ServerInfo::read(&mut p, GameMode::Nwn1), Some(info));
    }

    #[test]
    fn test_server_info_roundtrip_nwn2() {
        let info = sample_info();
        let mut b = BuildBuffer::new();
        info.write(&mut b, GameMode::Nwn2);
        let bytes = b.into_vec();
        let mut p = ParseBuffer::new(&bytes);
        assert_eq!(ServerInfo::read(&mut p, GameMode::Nwn2), Some(info));
    }

    #[test]
    fn test_server_info_wrong_mode_rejected() {
        let info = sample_info();
        let mut b = BuildBuffer::new();
        info.write(&mut b, GameMode::Nwn2);
        let bytes = b.into_vec();
        let mut p = ParseBuffer::new(&bytes);
        // Reserved byte mismatch: a mode-two payload must not parse as
        // mode one.
        assert_eq!(ServerInfo::read(&mut p, GameMode::Nwn1), None);
    }

    #[test]
    fn test_server_info_truncation_fails_softly() {
        let info = sample_info();
        let mut env = begin_message(cmd::SERVER_INFO_RESPONSE);
        info.write(&mut env, GameMode::Nwn2);
        let full = env.into_vec();

        for cut in 4..full.len() {
            let (_, payload) = decode_envelope(&full[..cut]).unwrap();
            let mut p = ParseBuffer::new(payload);
            assert_eq!(ServerInfo::read(&mut p, GameMode::Nwn2), None);
        }
    }

    #[test]
    fn test_max_frame_size_by_mode() {
        assert_eq!(GameMode::Nwn1.max_frame_size(), 1472);
        assert_eq!(GameMode::Nwn2.max_frame_size(), 3200);
    }

    #[test]
    fn test_game_mode_from_name() {
        assert_eq!(GameMode::from_name("nwn1"), Some(GameMode::Nwn1));
        assert_eq!(GameMode::from_name("NWN2"), Some(GameMode::Nwn2));
        assert_eq!(GameMode::from_name("other"), None);
    }
}
