//! Policy hot reload.
//!
//! A polling watcher (mtime check every 2 s) revalidates the policy file
//! when it changes. A reload that fails validation keeps the active policy
//! and surfaces the error in the log; the daemon never runs ruleless
//! because of a bad edit.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use tracing::{info, warn};

use super::Policy;

/// Default poll interval.
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// The live policy, swappable under readers.
pub struct SharedPolicy {
    inner: RwLock<Arc<Policy>>,
}

impl SharedPolicy {
    pub fn new(policy: Policy) -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(Arc::new(policy)),
        })
    }

    /// Snapshot the current policy. Cheap; clones an Arc.
    pub fn get(&self) -> Arc<Policy> {
        Arc::clone(&self.inner.read().unwrap())
    }

    pub fn replace(&self, policy: Policy) {
        *self.inner.write().unwrap() = Arc::new(policy);
    }
}

/// Spawn the reload thread. Exits promptly once `stop` flips.
pub fn spawn_watcher(
    shared: Arc<SharedPolicy>,
    path: PathBuf,
    poll_interval: Duration,
    stop: Arc<AtomicBool>,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("policy-watch".to_string())
        .spawn(move || {
            let mut last_mtime = mtime(&path);
            while !stop.load(Ordering::Relaxed) {
                std::thread::sleep(poll_interval);
                let current = mtime(&path);
                if current == last_mtime {
                    continue;
                }
                last_mtime = current;
                match Policy::load(&path) {
                    Ok(policy) => {
                        info!(path = %path.display(), version = policy.version, "policy reloaded");
                        shared.replace(policy);
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "policy reload failed; keeping previous policy");
                    }
                }
            }
        })
        .expect("failed to spawn policy watcher thread")
}

fn mtime(path: &std::path::Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
