//! On-disk layout.
//!
//! Config lives in the platform config directory, mutable state in the
//! platform data directory. `WARDEN_CONFIG_DIR` / `WARDEN_DATA_DIR`
//! override both for tests and portable installs.

use std::path::PathBuf;

const APP_DIR: &str = "warden";

/// Environment variable overriding the config directory.
pub const CONFIG_DIR_ENV: &str = "WARDEN_CONFIG_DIR";
/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "WARDEN_DATA_DIR";

/// Resolve the configuration directory (`config.toml`, `policy.yaml`).
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
        return PathBuf::from(dir);
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

/// Resolve the data directory (store, audit mirror, decision trace, lock).
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        return PathBuf::from(dir);
    }
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

/// `{config-dir}/config.toml`
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}

/// `{config-dir}/policy.yaml` — default policy location.
pub fn default_policy_file() -> PathBuf {
    config_dir().join("policy.yaml")
}

/// `{data-dir}/store.db`
pub fn store_file() -> PathBuf {
    data_dir().join("store.db")
}

/// `{data-dir}/audit.log` — JSONL mirror of the audit chain.
pub fn audit_mirror_file() -> PathBuf {
    data_dir().join("audit.log")
}

/// `{data-dir}/decisions.jsonl`
pub fn decision_trace_file() -> PathBuf {
    data_dir().join("decisions.jsonl")
}

/// `{data-dir}/warden.lock` — single-instance lock.
pub fn lock_file() -> PathBuf {
    data_dir().join("warden.lock")
}

/// `{data-dir}/audit-archive.jsonl` — rows pruned by `db archive`.
pub fn audit_archive_file() -> PathBuf {
    data_dir().join("audit-archive.jsonl")
}
