//! NWMaster - Game Master Server
//!
//! A Rust reimplementation of a legacy C# master server for an online
//! multiplayer game. Tracks live game-server instances over a binary UDP
//! protocol, re-verifies liveness with jittered probes, reconciles
//! NAT-duplicate records and persists the directory to MySQL.

/// Server configuration (replaces the legacy service registry surface)
pub mod config;
/// Server lifecycle management (shutdown state, drain accounting)
pub mod core;
/// Database layer (schema bootstrap, server table, write combining)
pub mod database;
/// Wire formats (envelope codec, opcode constants)
pub mod protocol;
/// Master server implementation (tracker, sockets, dispatch)
pub mod server;
