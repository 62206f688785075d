//! Environment diagnostics behind `warden doctor [--fix]`.
//!
//! Each check reports pass/fail with a one-line detail; `--fix` applies
//! the safe repairs (permission tightening, stale-lock reap).

use std::path::Path;

use serde::Serialize;

use crate::audit;
use crate::config::{self, Config, ConfigError};
use crate::daemon::process_alive;
use crate::paths;
use crate::policy::Policy;
use crate::store::Store;

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub ok: bool,
    pub detail: String,
    /// Whether `--fix` repaired (or would repair) this.
    pub fixed: bool,
}

impl CheckResult {
    fn pass(name: &str, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            ok: true,
            detail: detail.into(),
            fixed: false,
        }
    }

    fn fail(name: &str, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            ok: false,
            detail: detail.into(),
            fixed: false,
        }
    }
}

/// Run every check. `fix` applies safe repairs before re-judging.
pub fn run(fix: bool) -> Vec<CheckResult> {
    let mut results = Vec::new();
    results.push(check_config(fix));
    results.push(check_policy());
    results.push(check_store());
    results.push(check_audit_chain());
    results.push(check_lock(fix));
    results
}

pub fn all_ok(results: &[CheckResult]) -> bool {
    results.iter().all(|r| r.ok)
}

fn check_config(fix: bool) -> CheckResult {
    let path = paths::config_file();
    match Config::load_from(&path) {
        Ok(_) => CheckResult::pass("config", format!("{} parses, mode 0600", path.display())),
        Err(ConfigError::Missing(_)) => {
            CheckResult::fail("config", format!("{} not found (run `warden setup`)", path.display()))
        }
        Err(ConfigError::Permissions(_)) if fix => match config::fix_permissions(&path) {
            Ok(()) => {
                let mut r =
                    CheckResult::pass("config", format!("tightened {} to 0600", path.display()));
                r.fixed = true;
                r
            }
            Err(e) => CheckResult::fail("config", format!("could not fix permissions: {e}")),
        },
        Err(e) => CheckResult::fail("config", e.to_string()),
    }
}

fn check_policy() -> CheckResult {
    let path = match Config::load_or_default() {
        Ok(config) => config.policy.path,
        Err(_) => paths::default_policy_file(),
    };
    if !path.is_file() {
        return CheckResult::pass(
            "policy",
            format!("{} absent; every prompt escalates", path.display()),
        );
    }
    match Policy::load(&path) {
        Ok(policy) => CheckResult::pass(
            "policy",
            format!("{} valid ({} rules)", path.display(), policy.rules.len()),
        ),
        Err(e) => CheckResult::fail("policy", e.to_string()),
    }
}

fn check_store() -> CheckResult {
    let path = paths::store_file();
    if !path.exists() {
        return CheckResult::pass("store", format!("{} not created yet", path.display()));
    }
    match Store::open_read_only(&path) {
        Ok(store) => match store.integrity_check() {
            Ok(true) => CheckResult::pass("store", format!("{} integrity ok", path.display())),
            Ok(false) => CheckResult::fail(
                "store",
                format!("{} failed integrity_check; restore from backup", path.display()),
            ),
            Err(e) => CheckResult::fail("store", e.to_string()),
        },
        Err(e) => CheckResult::fail("store", format!("cannot open {}: {e}", path.display())),
    }
}

fn check_audit_chain() -> CheckResult {
    let path = paths::store_file();
    if !path.exists() {
        return CheckResult::pass("audit", "no store yet; empty chain");
    }
    match Store::open_read_only(&path) {
        Ok(store) => match audit::verify(&store) {
            Ok(v) if v.is_intact() => {
                CheckResult::pass("audit", format!("chain intact ({} rows)", v.checked))
            }
            Ok(v) => CheckResult::fail(
                "audit",
                format!("chain broken at seq {}", v.first_break.unwrap_or(-1)),
            ),
            Err(e) => CheckResult::fail("audit", e.to_string()),
        },
        Err(e) => CheckResult::fail("audit", e.to_string()),
    }
}

fn check_lock(fix: bool) -> CheckResult {
    let path = paths::lock_file();
    check_lock_at(&path, fix)
}

fn check_lock_at(path: &Path, fix: bool) -> CheckResult {
    if !path.exists() {
        return CheckResult::pass("lock", "no daemon lock held");
    }
    let holder = std::fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok());
    match holder {
        Some(pid) if process_alive(pid) => {
            CheckResult::pass("lock", format!("daemon running (pid {pid})"))
        }
        _ => {
            if fix {
                match std::fs::remove_file(path) {
                    Ok(()) => {
                        let mut r = CheckResult::pass("lock", "reaped stale lock");
                        r.fixed = true;
                        r
                    }
                    Err(e) => CheckResult::fail("lock", format!("stale lock; removal failed: {e}")),
                }
            } else {
                CheckResult::fail(
                    "lock",
                    format!("stale lock at {} (run `warden doctor --fix`)", path.display()),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn stale_lock_detected_and_fixed() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("warden.lock");
        std::fs::write(&path, "4194999").unwrap();

        let unfixed = check_lock_at(&path, false);
        assert!(!unfixed.ok);
        assert!(path.exists());

        let fixed = check_lock_at(&path, true);
        assert!(fixed.ok);
        assert!(fixed.fixed);
        assert!(!path.exists());
    }

    #[test]
    #[serial]
    fn live_lock_passes() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("warden.lock");
        std::fs::write(&path, std::process::id().to_string()).unwrap();
        let result = check_lock_at(&path, false);
        assert!(result.ok);
        assert!(result.detail.contains("running"));
    }

    #[test]
    #[serial]
    fn full_run_reports_every_check() {
        let tmp = tempfile::tempdir().unwrap();
        unsafe {
            std::env::set_var(paths::CONFIG_DIR_ENV, tmp.path().join("cfg"));
            std::env::set_var(paths::DATA_DIR_ENV, tmp.path().join("data"));
        }
        let results = run(false);
        unsafe {
            std::env::remove_var(paths::CONFIG_DIR_ENV);
            std::env::remove_var(paths::DATA_DIR_ENV);
        }
        let names: Vec<&str> = results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["config", "policy", "store", "audit", "lock"]);
        // Missing config is the only failure in a fresh environment.
        assert!(!results[0].ok);
        assert!(results[2].ok);
        assert!(results[4].ok);
    }
}
