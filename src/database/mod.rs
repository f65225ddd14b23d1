//! Database layer for the master server.
//!
//! The relational store is an external contract: a separate query API
//! reads the same tables. This layer owns connecting, bootstrapping the
//! schema if absent, and the upsert/select surface in `server_db`.

use sqlx::mysql::MySqlPoolOptions;
use sqlx::MySqlPool;

pub mod combiner;
pub mod server_db;

/// Errors surfaced by the persistence gateway.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("query failed: {0}")]
    Query(#[from] sqlx::Error),

    #[error("server row has no id after upsert")]
    MissingId,
}

/// Handle to the master-server database.
pub struct MasterDatabase {
    pool: MySqlPool,
}

impl MasterDatabase {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

/// Connect to the database.
pub async fn connect(url: &str) -> Result<MySqlPool, sqlx::Error> {
    let pool = MySqlPoolOptions::new().max_connections(5).connect(url).await?;
    tracing::info!("[db] Connected to MySQL");
    Ok(pool)
}

/// Create the schema if it does not exist yet. Failure here is fatal to
/// startup: running without a reachable store would silently lose the
/// directory.
pub async fn bootstrap_schema(pool: &MySqlPool) -> Result<(), DatabaseError> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS `game_servers` (
            `server_id` INT UNSIGNED NOT NULL AUTO_INCREMENT,
            `product_id` VARCHAR(16) NOT NULL,
            `server_address` VARCHAR(64) NOT NULL,
            `online` TINYINT(1) NOT NULL DEFAULT 0,
            `last_heartbeat` TIMESTAMP NULL DEFAULT NULL,
            `platform` TINYINT UNSIGNED NOT NULL DEFAULT 0,
            `build_number` SMALLINT UNSIGNED NOT NULL DEFAULT 0,
            `internal_data_port` SMALLINT UNSIGNED NOT NULL DEFAULT 0,
            `expansions_mask` TINYINT UNSIGNED NOT NULL DEFAULT 0,
            `module_name` VARCHAR(64) NOT NULL DEFAULT '',
            `module_description` VARCHAR(256) NOT NULL DEFAULT '',
            `module_url` VARCHAR(256) NOT NULL DEFAULT '',
            `server_name` VARCHAR(64) NOT NULL DEFAULT '',
            `server_description` VARCHAR(256) NOT NULL DEFAULT '',
            `active_players` SMALLINT UNSIGNED NOT NULL DEFAULT 0,
            `maximum_players` SMALLINT UNSIGNED NOT NULL DEFAULT 0,
            `local_vault` TINYINT(1) NOT NULL DEFAULT 0,
            `pvp_level` TINYINT UNSIGNED NOT NULL DEFAULT 0,
            `min_level` TINYINT UNSIGNED NOT NULL DEFAULT 0,
            `max_level` TINYINT UNSIGNED NOT NULL DEFAULT 0,
            `player_pause` TINYINT(1) NOT NULL DEFAULT 0,
            `one_party_only` TINYINT(1) NOT NULL DEFAULT 0,
            `elc_enforced` TINYINT(1) NOT NULL DEFAULT 0,
            `ilr_enforced` TINYINT(1) NOT NULL DEFAULT 0,
            `private_server` TINYINT(1) NOT NULL DEFAULT 0,
            `game_type` SMALLINT UNSIGNED NOT NULL DEFAULT 0,
            `pwc_url` VARCHAR(256) NOT NULL DEFAULT '',
            PRIMARY KEY (`server_id`),
            UNIQUE KEY `product_address` (`product_id`, `server_address`)
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS `pending_game_servers` (
            `pending_id` INT UNSIGNED NOT NULL AUTO_INCREMENT,
            `product_id` VARCHAR(16) NOT NULL,
            `server_address` VARCHAR(64) NOT NULL,
            PRIMARY KEY (`pending_id`),
            UNIQUE KEY `product_address` (`product_id`, `server_address`)
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS `server_motd` (
            `product_id` VARCHAR(16) NOT NULL,
            `motd` VARCHAR(255) NOT NULL DEFAULT '',
            PRIMARY KEY (`product_id`)
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS `stat_counters` (
            `counter_name` VARCHAR(64) NOT NULL,
            `counter_value` BIGINT UNSIGNED NOT NULL DEFAULT 0,
            PRIMARY KEY (`counter_name`)
        )",
    )
    .execute(pool)
    .await?;

    tracing::info!("[db] Schema bootstrap complete");
    Ok(())
}
