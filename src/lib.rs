// ABOUTME: Library root for jumpwire - SSH sessions, tunnels and the session cache.
// ABOUTME: The CLI binary is in main.rs.

pub mod cache;
pub mod config;
pub mod error;
pub mod ssh;
pub mod tunnel;
pub mod types;
