// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Runtime Configuration
//!
//! Engine tunables are loaded from the environment at startup.
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `DATA_DIR` | Directory holding the ledger database | `/data` |
//! | `SCAN_POLL_SECS` | Scanner poll interval when caught up | `5` |
//! | `SCAN_CHUNK_SIZE` | Blocks per scan window | `2000` |
//! | `SWEEP_POLL_SECS` | Sweep worker interval | `300` |
//! | `SWEEP_SAFETY_MARGIN` | Minor units withheld from every sweep | `0` |
//! | `LOCK_STALE_SECS` | Advisory lock staleness window | `600` |
//! | `RPC_MAX_RETRIES` | Bounded retry count for transient RPC errors | `3` |
//! | `RPC_RETRY_BASE_MS` | Initial retry backoff in milliseconds | `250` |
//! | `LOG_FORMAT` | Logging format (`json` or `pretty`) | `pretty` |
//! | `RUST_LOG` | Log level filter | `info` |

use std::env;
use std::time::Duration;

use crate::models::Amount;

/// Environment variable name for the ledger database directory.
pub const DATA_DIR_ENV: &str = "DATA_DIR";

/// Database file name inside the data directory.
pub const DB_FILE_NAME: &str = "treasury.redb";

/// Engine configuration, fixed at startup.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory holding the redb database file.
    pub data_dir: String,
    /// Scanner poll interval when caught up to the safe head.
    pub scan_poll_interval: Duration,
    /// Blocks per scan window.
    pub scan_chunk_size: u64,
    /// Sweep worker interval.
    pub sweep_poll_interval: Duration,
    /// Minor units withheld from every sweep as dust/fee headroom.
    pub sweep_safety_margin: Amount,
    /// Age after which a held treasury lock may be reclaimed.
    pub lock_staleness: Duration,
    /// Bounded retry count for transient RPC errors.
    pub rpc_max_retries: u32,
    /// Initial retry backoff; doubles per attempt.
    pub rpc_retry_base: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: "/data".to_string(),
            scan_poll_interval: Duration::from_secs(5),
            scan_chunk_size: 2000,
            sweep_poll_interval: Duration::from_secs(300),
            sweep_safety_margin: 0,
            lock_staleness: Duration::from_secs(600),
            rpc_max_retries: 3,
            rpc_retry_base: Duration::from_millis(250),
        }
    }
}

impl EngineConfig {
    /// Load configuration from the environment, falling back to defaults for
    /// anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            data_dir: env::var(DATA_DIR_ENV).unwrap_or(defaults.data_dir),
            scan_poll_interval: env_secs("SCAN_POLL_SECS", defaults.scan_poll_interval),
            scan_chunk_size: env_u64("SCAN_CHUNK_SIZE", defaults.scan_chunk_size),
            sweep_poll_interval: env_secs("SWEEP_POLL_SECS", defaults.sweep_poll_interval),
            sweep_safety_margin: env_u128("SWEEP_SAFETY_MARGIN", defaults.sweep_safety_margin),
            lock_staleness: env_secs("LOCK_STALE_SECS", defaults.lock_staleness),
            rpc_max_retries: env_u64("RPC_MAX_RETRIES", defaults.rpc_max_retries as u64) as u32,
            rpc_retry_base: env_millis("RPC_RETRY_BASE_MS", defaults.rpc_retry_base),
        }
    }

    /// Path of the database file under `data_dir`.
    pub fn db_path(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.data_dir).join(DB_FILE_NAME)
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u128(key: &str, default: u128) -> u128 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn env_millis(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.scan_chunk_size, 2000);
        assert_eq!(cfg.rpc_max_retries, 3);
        assert!(cfg.lock_staleness > cfg.sweep_poll_interval);
        assert!(cfg.db_path().ends_with(DB_FILE_NAME));
    }
}
