//! Queries against the game_servers table and its auxiliaries.

use std::net::SocketAddr;

use chrono::{DateTime, Utc};

use super::{DatabaseError, MasterDatabase};
use crate::server::record::{RecordState, ServerSnapshot};

/// One persisted row of the game_servers table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ServerRow {
    pub server_id: u32,
    pub server_address: String,
    pub online: bool,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub platform: u8,
    pub build_number: u16,
    pub internal_data_port: u16,
    pub expansions_mask: u8,
    pub module_name: String,
    pub module_description: String,
    pub module_url: String,
    pub server_name: String,
    pub server_description: String,
    pub active_players: u16,
    pub maximum_players: u16,
    pub local_vault: bool,
    pub pvp_level: u8,
    pub min_level: u8,
    pub max_level: u8,
    pub player_pause: bool,
    pub one_party_only: bool,
    pub elc_enforced: bool,
    pub ilr_enforced: bool,
    pub private_server: bool,
    pub game_type: u16,
    pub pwc_url: String,
}

impl ServerRow {
    pub fn parse_address(&self) -> Option<SocketAddr> {
        self.server_address.parse().ok()
    }

    /// Copy persisted fields into a live record's state.
    pub fn apply_to(&self, st: &mut RecordState) {
        st.database_id = self.server_id;
        st.online = self.online;
        st.last_heartbeat = self.last_heartbeat;
        st.platform = self.platform;
        st.build_number = self.build_number;
        st.internal_data_port = self.internal_data_port;
        st.expansions_mask = self.expansions_mask;
        st.module_name = self.module_name.clone();
        st.module_description = self.module_description.clone();
        st.module_url = self.module_url.clone();
        st.server_name = self.server_name.clone();
        st.server_description = self.server_description.clone();
        st.active_players = self.active_players;
        st.maximum_players = self.maximum_players;
        st.local_vault = self.local_vault;
        st.pvp_level = self.pvp_level;
        st.min_level = self.min_level;
        st.max_level = self.max_level;
        st.player_pause = self.player_pause;
        st.one_party_only = self.one_party_only;
        st.elc_enforced = self.elc_enforced;
        st.ilr_enforced = self.ilr_enforced;
        st.private_server = self.private_server;
        st.game_type = self.game_type;
        st.pwc_url = self.pwc_url.clone();
    }
}

const SERVER_COLUMNS: &str = "`server_id`, `server_address`, `online`, `last_heartbeat`, \
     `platform`, `build_number`, `internal_data_port`, `expansions_mask`, `module_name`, \
     `module_description`, `module_url`, `server_name`, `server_description`, \
     `active_players`, `maximum_players`, `local_vault`, `pvp_level`, `min_level`, \
     `max_level`, `player_pause`, `one_party_only`, `elc_enforced`, `ilr_enforced`, \
     `private_server`, `game_type`, `pwc_url`";

impl MasterDatabase {
    /// Upsert a server snapshot and return its row id. The
    /// LAST_INSERT_ID(server_id) trick makes the duplicate-key path report
    /// the existing id instead of zero.
    pub async fn save_server(
        &self,
        product_id: &str,
        snap: &ServerSnapshot,
    ) -> Result<u32, DatabaseError> {
        let result = sqlx::query(
            "INSERT INTO `game_servers` (
                `product_id`, `server_address`, `online`, `last_heartbeat`, `platform`,
                `build_number`, `internal_data_port`, `expansions_mask`, `module_name`,
                `module_description`, `module_url`, `server_name`, `server_description`,
                `active_players`, `maximum_players`, `local_vault`, `pvp_level`,
                `min_level`, `max_level`, `player_pause`, `one_party_only`,
                `elc_enforced`, `ilr_enforced`, `private_server`, `game_type`, `pwc_url`
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON DUPLICATE KEY UPDATE
                `server_id` = LAST_INSERT_ID(`server_id`),
                `online` = VALUES(`online`),
                `last_heartbeat` = VALUES(`last_heartbeat`),
                `platform` = VALUES(`platform`),
                `build_number` = VALUES(`build_number`),
                `internal_data_port` = VALUES(`internal_data_port`),
                `expansions_mask` = VALUES(`expansions_mask`),
                `module_name` = VALUES(`module_name`),
                `module_description` = VALUES(`module_description`),
                `module_url` = VALUES(`module_url`),
                `server_name` = VALUES(`server_name`),
                `server_description` = VALUES(`server_description`),
                `active_players` = VALUES(`active_players`),
                `maximum_players` = VALUES(`maximum_players`),
                `local_vault` = VALUES(`local_vault`),
                `pvp_level` = VALUES(`pvp_level`),
                `min_level` = VALUES(`min_level`),
                `max_level` = VALUES(`max_level`),
                `player_pause` = VALUES(`player_pause`),
                `one_party_only` = VALUES(`one_party_only`),
                `elc_enforced` = VALUES(`elc_enforced`),
                `ilr_enforced` = VALUES(`ilr_enforced`),
                `private_server` = VALUES(`private_server`),
                `game_type` = VALUES(`game_type`),
                `pwc_url` = VALUES(`pwc_url`)",
        )
        .bind(product_id)
        .bind(&snap.address)
        .bind(snap.online)
        .bind(snap.last_heartbeat)
        .bind(snap.platform)
        .bind(snap.build_number)
        .bind(snap.internal_data_port)
        .bind(snap.expansions_mask)
        .bind(&snap.module_name)
        .bind(&snap.module_description)
        .bind(&snap.module_url)
        .bind(&snap.server_name)
        .bind(&snap.server_description)
        .bind(snap.active_players)
        .bind(snap.maximum_players)
        .bind(snap.local_vault)
        .bind(snap.pvp_level)
        .bind(snap.min_level)
        .bind(snap.max_level)
        .bind(snap.player_pause)
        .bind(snap.one_party_only)
        .bind(snap.elc_enforced)
        .bind(snap.ilr_enforced)
        .bind(snap.private_server)
        .bind(snap.game_type)
        .bind(&snap.pwc_url)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_id() as u32;
        if id == 0 {
            return Err(DatabaseError::MissingId);
        }
        Ok(id)
    }

    /// Load every persisted server for the product.
    pub async fn load_all(&self, product_id: &str) -> Result<Vec<ServerRow>, DatabaseError> {
        let rows = sqlx::query_as::<_, ServerRow>(&format!(
            "SELECT {SERVER_COLUMNS} FROM `game_servers` WHERE `product_id` = ?"
        ))
        .bind(product_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Load one persisted server by address, if present.
    pub async fn load_one(
        &self,
        product_id: &str,
        address: &str,
    ) -> Result<Option<ServerRow>, DatabaseError> {
        let row = sqlx::query_as::<_, ServerRow>(&format!(
            "SELECT {SERVER_COLUMNS} FROM `game_servers`
             WHERE `product_id` = ? AND `server_address` = ?"
        ))
        .bind(product_id)
        .bind(address)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Drain the queue of externally registered addresses awaiting first
    /// contact. Only the fetched rows are deleted, inside one transaction,
    /// so an address registered mid-drain survives for the next pass.
    pub async fn take_pending(&self, product_id: &str) -> Result<Vec<String>, DatabaseError> {
        let mut tx = self.pool.begin().await?;

        let rows: Vec<(u32, String)> = sqlx::query_as(
            "SELECT `pending_id`, `server_address` FROM `pending_game_servers`
             WHERE `product_id` = ? FOR UPDATE",
        )
        .bind(product_id)
        .fetch_all(&mut *tx)
        .await?;

        for (pending_id, _) in &rows {
            sqlx::query("DELETE FROM `pending_game_servers` WHERE `pending_id` = ?")
                .bind(pending_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        Ok(rows.into_iter().map(|(_, a)| a).collect())
    }

    /// Publish the configured MOTD so the query API serves the same text
    /// the wire protocol does.
    pub async fn publish_motd(&self, product_id: &str, motd: &str) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO `server_motd` (`product_id`, `motd`) VALUES (?, ?)
             ON DUPLICATE KEY UPDATE `motd` = VALUES(`motd`)",
        )
        .bind(product_id)
        .bind(motd)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Bump a named statistics counter.
    pub async fn increment_counter(&self, name: &str, delta: u64) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO `stat_counters` (`counter_name`, `counter_value`) VALUES (?, ?)
             ON DUPLICATE KEY UPDATE `counter_value` = `counter_value` + VALUES(`counter_value`)",
        )
        .bind(name)
        .bind(delta)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Query round-trips need a live DATABASE_URL and are exercised out of
    // band; these tests cover the row-to-record mapping.

    fn sample_row() -> ServerRow {
        ServerRow {
            server_id: 42,
            server_address: "10.0.0.1:5121".into(),
            online: true,
            last_heartbeat: Some(Utc::now()),
            platform: b'W',
            build_number: 8193,
            internal_data_port: 5121,
            expansions_mask: 3,
            module_name: "Endless Nights".into(),
            module_description: "desc".into(),
            module_url: "http://mod.example.com".into(),
            server_name: "The Keep".into(),
            server_description: "a keep".into(),
            active_players: 4,
            maximum_players: 64,
            local_vault: true,
            pvp_level: 2,
            min_level: 1,
            max_level: 40,
            player_pause: false,
            one_party_only: false,
            elc_enforced: true,
            ilr_enforced: true,
            private_server: false,
            game_type: 9,
            pwc_url: String::new(),
        }
    }

    #[test]
    fn test_parse_address() {
        let row = sample_row();
        assert_eq!(
            row.parse_address(),
            Some("10.0.0.1:5121".parse().unwrap())
        );
        let mut bad = sample_row();
        bad.server_address = "not-an-address".into();
        assert!(bad.parse_address().is_none());
    }

    #[test]
    fn test_apply_to_record_state() {
        let row = sample_row();
        let mut st = RecordState::default();
        row.apply_to(&mut st);
        assert_eq!(st.database_id, 42);
        assert!(st.online);
        assert_eq!(st.module_name, "Endless Nights");
        assert_eq!(st.maximum_players, 64);
        assert_eq!(st.platform, b'W');
    }

    #[test]
    fn test_snapshot_roundtrips_through_row() {
        let row = sample_row();
        let mut st = RecordState::default();
        row.apply_to(&mut st);
        let snap = st.snapshot("10.0.0.1:5121".parse().unwrap());
        assert_eq!(snap.address, row.server_address);
        assert_eq!(snap.database_id, row.server_id);
        assert_eq!(snap.module_name, row.module_name);
        assert_eq!(snap.active_players, row.active_players);
    }
}
