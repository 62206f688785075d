//! Process-wide lifecycle: the supervising daemon behind `warden run`.
//!
//! Startup sequence: single-instance lock → store connect + migrations →
//! policy load → channel init → restart recovery (sweep, then re-notify
//! surviving prompts with their original nonces). SIGINT/SIGTERM flip a
//! shared cancellation flag; supervisors terminate their children with a
//! grace period, the sweeper exits promptly, and in-flight channel sends
//! abort on their deadline.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{AuditKind, AuditLog};
use crate::channel::{Channel, ConsoleChannel, IdentityAllowlist, MultiChannel};
use crate::channel::telegram::TelegramChannel;
use crate::config::{ChannelKind, Config};
use crate::detector::{DetectorConfig, DetectorEvent, PromptDetector, Signals};
use crate::paths;
use crate::policy::Policy;
use crate::policy::watch::{self, SharedPolicy};
use crate::pty::{DEFAULT_ECHO_WINDOW, PtyError, PtyEvent, PtySupervisor, SpawnConfig};
use crate::router::{Injector, Router, RouterConfig};
use crate::store::{ConversationState, SessionRecord, SessionStatus, Store};
use crate::trace::DecisionTrace;

/// Sweeper cadence.
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);
/// Long-poll window handed to the channel's inbound source.
const INBOUND_POLL: Duration = Duration::from_secs(25);
/// Grace between SIGTERM and the hard kill on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
/// Minimum gap between forwarded output chunks per session.
const OUTPUT_FORWARD_GAP: Duration = Duration::from_secs(30);

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Single-instance OS file lock with PID diagnostics.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
}

impl InstanceLock {
    /// Acquire, reaping a stale lock whose owner is gone.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        for attempt in 0..2 {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
            {
                Ok(mut file) => {
                    use std::io::Write;
                    write!(file, "{}", std::process::id())?;
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let holder = std::fs::read_to_string(path)
                        .ok()
                        .and_then(|s| s.trim().parse::<u32>().ok());
                    match holder {
                        Some(pid) if process_alive(pid) => {
                            bail!(
                                "another warden daemon is running (pid {pid}, lock {})",
                                path.display()
                            );
                        }
                        _ => {
                            // Stale lock from a dead process.
                            warn!(path = %path.display(), "reaping stale instance lock");
                            std::fs::remove_file(path).with_context(|| {
                                format!("failed to remove stale lock {}", path.display())
                            })?;
                            if attempt == 1 {
                                bail!("could not acquire instance lock {}", path.display());
                            }
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        bail!("could not acquire instance lock {}", path.display())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    // Without a cheap liveness probe, treat the lock as held.
    true
}

/// The daemon's view of its running supervisors; the router's injection
/// seam.
#[derive(Default)]
pub struct SupervisorRegistry {
    map: Mutex<HashMap<String, Arc<PtySupervisor>>>,
}

impl SupervisorRegistry {
    pub fn insert(&self, session_id: &str, supervisor: Arc<PtySupervisor>) {
        self.map
            .lock()
            .unwrap()
            .insert(session_id.to_string(), supervisor);
    }

    pub fn remove(&self, session_id: &str) {
        self.map.lock().unwrap().remove(session_id);
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<PtySupervisor>> {
        self.map.lock().unwrap().get(session_id).cloned()
    }

    pub fn terminate_all(&self, grace: Duration) {
        let supervisors: Vec<Arc<PtySupervisor>> =
            self.map.lock().unwrap().values().cloned().collect();
        for supervisor in supervisors {
            supervisor.terminate(grace);
        }
    }
}

impl Injector for SupervisorRegistry {
    fn inject(&self, session_id: &str, bytes: &[u8]) -> Result<(), PtyError> {
        match self.get(session_id) {
            Some(supervisor) => supervisor.inject(bytes),
            None => Err(PtyError::ChildGone),
        }
    }
}

/// Build the configured channel stack.
pub fn build_channel(config: &Config) -> Result<Arc<dyn Channel>> {
    Ok(match config.channel {
        ChannelKind::Console => Arc::new(ConsoleChannel),
        ChannelKind::Telegram => {
            ensure_telegram(config)?;
            Arc::new(TelegramChannel::new(&config.telegram))
        }
        ChannelKind::Multi => {
            ensure_telegram(config)?;
            Arc::new(MultiChannel::new(vec![
                Arc::new(TelegramChannel::new(&config.telegram)),
                Arc::new(ConsoleChannel),
            ]))
        }
    })
}

fn ensure_telegram(config: &Config) -> Result<()> {
    if config.telegram.bot_token.is_empty() {
        return Err(crate::config::ConfigError::MissingCredential {
            channel: "telegram",
            field: "telegram.bot_token",
        }
        .into());
    }
    if config.telegram.chat_id.is_empty() {
        return Err(crate::config::ConfigError::MissingCredential {
            channel: "telegram",
            field: "telegram.chat_id",
        }
        .into());
    }
    Ok(())
}

pub struct Daemon {
    config: Config,
    store: Arc<Store>,
    audit: Arc<AuditLog>,
    channel: Arc<dyn Channel>,
    router: Arc<Router>,
    supervisors: Arc<SupervisorRegistry>,
    cancel: Arc<AtomicBool>,
    _lock: InstanceLock,
}

impl Daemon {
    /// Full startup sequence. Fails hard on store or policy problems.
    pub fn bootstrap(config: Config) -> Result<Self> {
        let lock = InstanceLock::acquire(&paths::lock_file())?;

        let store = Arc::new(
            Store::open(&paths::store_file())
                .with_context(|| format!("store at {}", paths::store_file().display()))?,
        );
        let audit = Arc::new(AuditLog::new(
            Arc::clone(&store),
            Some(&paths::audit_mirror_file()),
        )?);
        let trace = Arc::new(DecisionTrace::open(&paths::decision_trace_file())?);

        let policy_path = config.policy.path.clone();
        let policy = if policy_path.is_file() {
            SharedPolicy::new(Policy::load(&policy_path)?)
        } else {
            warn!(path = %policy_path.display(), "no policy file; every prompt escalates");
            SharedPolicy::new(Policy::permissive_default())
        };

        let channel = build_channel(&config)?;
        let supervisors = Arc::new(SupervisorRegistry::default());

        let router = Arc::new(Router::new(
            Arc::clone(&store),
            Arc::clone(&audit),
            trace,
            Arc::clone(&policy),
            Arc::clone(&channel),
            Arc::clone(&supervisors) as Arc<dyn Injector>,
            IdentityAllowlist::new(config.allowed_identities.iter().cloned()),
            RouterConfig {
                ttl_seconds: config.prompt.timeout_seconds,
                free_text_enabled: config.prompt.free_text_enabled,
                password_reply_enabled: config.prompt.password_reply_enabled,
                ..RouterConfig::default()
            },
        ));

        let cancel = Arc::new(AtomicBool::new(false));
        {
            let cancel = Arc::clone(&cancel);
            ctrlc::set_handler(move || {
                cancel.store(true, Ordering::Relaxed);
            })
            .context("failed to install signal handler")?;
        }

        audit.append(AuditKind::DaemonStarted, None, None, json!({}))?;

        // Restart recovery: settle overdue prompts first, then re-notify
        // the survivors with their original nonces.
        let now = now_ms();
        let expired = router.sweep(now)?;
        let renotified = router.renotify_pending(now)?;
        if expired > 0 || renotified > 0 {
            info!(expired, renotified, "restart recovery complete");
        }

        if policy_path.is_file() {
            watch::spawn_watcher(
                Arc::clone(&policy),
                policy_path,
                watch::POLL_INTERVAL,
                Arc::clone(&cancel),
            );
        }

        Ok(Self {
            config,
            store,
            audit,
            channel,
            router,
            supervisors,
            cancel,
            _lock: lock,
        })
    }

    /// Supervise one tool until it exits or the daemon is cancelled.
    /// Returns the child's exit success.
    pub fn run_session(&self, tool: &str, args: &[String]) -> Result<bool> {
        let session_id = Uuid::new_v4().to_string();
        let session = SessionRecord {
            id: session_id.clone(),
            tool: tool.to_string(),
            started_at: now_ms(),
            ended_at: None,
            status: SessionStatus::Active,
            autonomy_mode: self.config.autopilot.mode,
            conversation_state: ConversationState::Running,
            bound_thread: None,
        };
        self.store.create_session(&session)?;
        self.audit.append(
            AuditKind::SessionStarted,
            Some(&session_id),
            None,
            json!({ "tool": tool }),
        )?;

        let spawn = SpawnConfig {
            program: tool.to_string(),
            args: args.to_vec(),
            cwd: std::env::current_dir()
                .ok()
                .map(|p| p.display().to_string()),
            env: Vec::new(),
        };
        let silence = Duration::from_secs_f64(self.config.prompt.silence_seconds.max(0.1));
        let echo_window = if self.config.prompt.echo_suppress_ms == 0 {
            DEFAULT_ECHO_WINDOW
        } else {
            Duration::from_millis(self.config.prompt.echo_suppress_ms)
        };
        let (supervisor, events) = match PtySupervisor::spawn(&spawn, silence, echo_window) {
            Ok(pair) => pair,
            Err(e) => {
                // PTY or spawn failure is fatal for the session.
                self.router.handle_session_exit(&session_id, true, now_ms())?;
                return Err(e).context("failed to start supervised session");
            }
        };
        let supervisor = Arc::new(supervisor);
        self.supervisors.insert(&session_id, Arc::clone(&supervisor));

        let sweeper = self.spawn_sweeper();
        let inbound = self.spawn_inbound_pump();

        let mut detector = PromptDetector::new(DetectorConfig::default());
        let mut conversation_state = ConversationState::Running;
        let mut last_forward = Instant::now() - OUTPUT_FORWARD_GAP;
        let mut exited_cleanly = false;
        let mut termination_sent = false;

        loop {
            if self.cancel.load(Ordering::Relaxed) && !termination_sent {
                termination_sent = true;
                info!(session = %session_id, "cancellation requested; terminating child");
                supervisor.terminate(SHUTDOWN_GRACE);
            }
            let event = match events.recv_timeout(Duration::from_millis(250)) {
                Ok(event) => event,
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
            };
            match event {
                PtyEvent::Output { echo_suspect } => {
                    let tail = supervisor.buffer_tail();
                    let signals = Signals {
                        echo_suspect,
                        ..Signals::default()
                    };
                    self.observe(&session_id, &mut detector, &mut conversation_state, &tail, signals)?;
                    if last_forward.elapsed() >= OUTPUT_FORWARD_GAP {
                        last_forward = Instant::now();
                        self.router.forward_output(&session_id, &tail);
                    }
                }
                PtyEvent::Idle => {
                    let tail = supervisor.buffer_tail();
                    let signals = Signals {
                        idle: true,
                        blocked_on_read: supervisor.blocked_on_read(),
                        ..Signals::default()
                    };
                    self.observe(&session_id, &mut detector, &mut conversation_state, &tail, signals)?;
                }
                PtyEvent::Exited => {
                    exited_cleanly = true;
                    break;
                }
            }
        }

        let success = supervisor.wait();
        self.supervisors.remove(&session_id);
        let crashed = !exited_cleanly || !success;
        self.router
            .handle_session_exit(&session_id, crashed, now_ms())?;

        // Wind down the background loops with the session.
        self.cancel.store(true, Ordering::Relaxed);
        drop(sweeper);
        drop(inbound);
        self.audit
            .append(AuditKind::DaemonStopped, None, None, json!({}))?;
        Ok(success)
    }

    fn observe(
        &self,
        session_id: &str,
        detector: &mut PromptDetector,
        state: &mut ConversationState,
        tail: &str,
        signals: Signals,
    ) -> Result<()> {
        match detector.observe(tail, signals) {
            Some(DetectorEvent::Candidate(detection)) => {
                self.set_conversation_state(session_id, state, ConversationState::AwaitingInput)?;
                self.router
                    .handle_detection(session_id, &detection, now_ms())?;
            }
            Some(DetectorEvent::Duplicate(detection)) => {
                self.router.note_duplicate(session_id, &detection)?;
            }
            None => {
                if !signals.idle {
                    self.set_conversation_state(session_id, state, ConversationState::Streaming)?;
                }
            }
        }
        Ok(())
    }

    /// Persist the conversation state only when it actually changes; the
    /// reader emits an event per chunk and the store should not see one
    /// write per chunk.
    fn set_conversation_state(
        &self,
        session_id: &str,
        current: &mut ConversationState,
        next: ConversationState,
    ) -> Result<()> {
        if *current == next {
            return Ok(());
        }
        *current = next;
        self.store.update_session(
            session_id,
            &[("conversation_state", next.as_str().to_string().into())],
        )?;
        Ok(())
    }

    fn spawn_sweeper(&self) -> std::thread::JoinHandle<()> {
        let router = Arc::clone(&self.router);
        let cancel = Arc::clone(&self.cancel);
        std::thread::Builder::new()
            .name("ttl-sweeper".to_string())
            .spawn(move || {
                let tick = Duration::from_millis(250);
                let mut next_sweep = Instant::now();
                while !cancel.load(Ordering::Relaxed) {
                    std::thread::sleep(tick);
                    if Instant::now() < next_sweep {
                        continue;
                    }
                    next_sweep = Instant::now() + SWEEP_INTERVAL;
                    match router.sweep(now_ms()) {
                        Ok(0) => {}
                        Ok(n) => debug!(expired = n, "sweeper pass"),
                        Err(e) => warn!(error = %e, "sweeper pass failed"),
                    }
                }
            })
            .expect("failed to spawn sweeper thread")
    }

    fn spawn_inbound_pump(&self) -> std::thread::JoinHandle<()> {
        let router = Arc::clone(&self.router);
        let channel = Arc::clone(&self.channel);
        let cancel = Arc::clone(&self.cancel);
        std::thread::Builder::new()
            .name("inbound-pump".to_string())
            .spawn(move || {
                while !cancel.load(Ordering::Relaxed) {
                    match channel.poll_inbound(INBOUND_POLL) {
                        Ok(messages) => {
                            for message in messages {
                                if let Err(e) = router.handle_inbound(&message, now_ms()) {
                                    warn!(error = %e, "inbound handling failed");
                                }
                            }
                        }
                        Err(e) => {
                            debug!(error = %e, "inbound poll failed; backing off");
                            std::thread::sleep(Duration::from_secs(2));
                        }
                    }
                }
            })
            .expect("failed to spawn inbound pump thread")
    }

}
