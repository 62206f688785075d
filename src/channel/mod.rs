//! Channel abstraction — how prompts reach a human and replies come back.
//!
//! A channel sends structured prompt messages, streams output snippets,
//! and yields inbound messages. Implementations are transports only; the
//! router owns the gate, nonce checks, and lifecycle. Every `send_*` is
//! wrapped by a per-channel circuit breaker: three consecutive failures
//! open the circuit for 30 s, a half-open probe closes it on success.

pub mod telegram;

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;

use crate::store::PromptRecord;

/// Bound on any single channel send.
pub const SEND_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ChannelError {
    /// Circuit open or transport degraded; transient from the router's view.
    #[error("channel unavailable: {0}")]
    Unavailable(String),
    #[error("channel transport error: {0}")]
    Transport(String),
    #[error("channel send exceeded {0:?} deadline")]
    Deadline(Duration),
}

/// Handle to a sent prompt message (transport message id).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHandle(pub String);

/// An inbound message from the transport, before gating.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Transport identity of the sender (checked against the allowlist).
    pub identity: String,
    /// Nonce echoed back by the reply UI, if present.
    pub nonce: Option<String>,
    /// Prompt the sender believes they are answering.
    pub prompt_id: Option<String>,
    /// Session binding carried by the reply (thread / chat scope).
    pub session_binding: Option<String>,
    /// Raw reply body.
    pub body: String,
}

/// Why the gate dropped an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelRejection {
    NotAllowlisted,
    ChannelPaused,
    RateLimited,
    UnknownPrompt,
    SessionMismatch,
    PromptExpired,
    NotAwaitingReply,
    InputKindForbidden,
    NonceMismatch,
    RedactionFailed,
}

impl ChannelRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelRejection::NotAllowlisted => "NOT_ALLOWLISTED",
            ChannelRejection::ChannelPaused => "CHANNEL_PAUSED",
            ChannelRejection::RateLimited => "RATE_LIMITED",
            ChannelRejection::UnknownPrompt => "UNKNOWN_PROMPT",
            ChannelRejection::SessionMismatch => "SESSION_MISMATCH",
            ChannelRejection::PromptExpired => "PROMPT_EXPIRED",
            ChannelRejection::NotAwaitingReply => "NOT_AWAITING_REPLY",
            ChannelRejection::InputKindForbidden => "INPUT_KIND_FORBIDDEN",
            ChannelRejection::NonceMismatch => "NONCE_MISMATCH",
            ChannelRejection::RedactionFailed => "REDACTION_FAILED",
        }
    }
}

/// A prompt transport.
pub trait Channel: Send + Sync {
    fn name(&self) -> &'static str;

    /// Send a prompt with kind-appropriate reply affordances.
    fn send_prompt(
        &self,
        session_id: &str,
        prompt: &PromptRecord,
    ) -> Result<MessageHandle, ChannelError>;

    /// Forward an output snippet (already redacted by the caller).
    fn send_output(&self, session_id: &str, chunk: &str) -> Result<(), ChannelError>;

    /// Forward a plan / multi-line status block.
    fn send_plan(&self, session_id: &str, plan: &str) -> Result<(), ChannelError>;

    /// Out-of-band notification (expiry, crash, recovery).
    fn notify(&self, session_id: &str, event: &str) -> Result<(), ChannelError>;

    /// Pull inbound messages, waiting up to `timeout`.
    fn poll_inbound(&self, timeout: Duration) -> Result<Vec<InboundMessage>, ChannelError>;
}

/// Channel identities allowed to answer prompts.
#[derive(Debug, Clone, Default)]
pub struct IdentityAllowlist {
    identities: HashSet<String>,
}

impl IdentityAllowlist {
    pub fn new(identities: impl IntoIterator<Item = String>) -> Self {
        Self {
            identities: identities.into_iter().collect(),
        }
    }

    pub fn is_allowed(&self, identity: &str) -> bool {
        self.identities.contains(identity)
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}

/// State change reported by the breaker, for audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerEvent {
    Opened,
    Closed,
}

#[derive(Debug, Clone, Copy)]
enum BreakerState {
    Closed { consecutive_failures: u32 },
    Open { since: Instant },
    HalfOpen,
}

/// Per-channel circuit breaker.
pub struct CircuitBreaker {
    state: Mutex<BreakerState>,
    threshold: u32,
    open_for: Duration,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(30))
    }
}

impl CircuitBreaker {
    pub fn new(threshold: u32, open_for: Duration) -> Self {
        Self {
            state: Mutex::new(BreakerState::Closed {
                consecutive_failures: 0,
            }),
            threshold,
            open_for,
        }
    }

    /// Gate a send. While open (and not yet due for a probe), callers get
    /// `Unavailable` synchronously.
    pub fn check(&self, now: Instant) -> Result<(), ChannelError> {
        let mut state = self.state.lock().unwrap();
        match *state {
            BreakerState::Closed { .. } | BreakerState::HalfOpen => Ok(()),
            BreakerState::Open { since } => {
                if now.duration_since(since) >= self.open_for {
                    *state = BreakerState::HalfOpen;
                    Ok(())
                } else {
                    Err(ChannelError::Unavailable("circuit open".to_string()))
                }
            }
        }
    }

    pub fn on_success(&self) -> Option<BreakerEvent> {
        let mut state = self.state.lock().unwrap();
        let was_half_open = matches!(*state, BreakerState::HalfOpen);
        *state = BreakerState::Closed {
            consecutive_failures: 0,
        };
        was_half_open.then_some(BreakerEvent::Closed)
    }

    pub fn on_failure(&self, now: Instant) -> Option<BreakerEvent> {
        let mut state = self.state.lock().unwrap();
        match *state {
            BreakerState::Closed {
                consecutive_failures,
            } => {
                let failures = consecutive_failures + 1;
                if failures >= self.threshold {
                    *state = BreakerState::Open { since: now };
                    Some(BreakerEvent::Opened)
                } else {
                    *state = BreakerState::Closed {
                        consecutive_failures: failures,
                    };
                    None
                }
            }
            BreakerState::HalfOpen => {
                // Probe failed; back to open.
                *state = BreakerState::Open { since: now };
                Some(BreakerEvent::Opened)
            }
            BreakerState::Open { .. } => None,
        }
    }

    pub fn is_open(&self, now: Instant) -> bool {
        self.check(now).is_err()
    }
}

/// Per-identity inbound budget: token bucket, 10/min with a burst of 3.
pub struct InboundRateLimiter {
    buckets: Mutex<HashMap<String, (f64, Instant)>>,
    per_minute: f64,
    burst: f64,
}

impl Default for InboundRateLimiter {
    fn default() -> Self {
        Self::new(10, 3)
    }
}

impl InboundRateLimiter {
    pub fn new(per_minute: u32, burst: u32) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            per_minute: f64::from(per_minute),
            burst: f64::from(burst.max(1)),
        }
    }

    /// Take one token for `identity`; false when the bucket is empty.
    pub fn try_take(&self, identity: &str, now: Instant) -> bool {
        let mut buckets = self.buckets.lock().unwrap();
        let (tokens, last) = buckets
            .entry(identity.to_string())
            .or_insert((self.burst, now));
        let elapsed = now.duration_since(*last).as_secs_f64();
        *tokens = (*tokens + elapsed * self.per_minute / 60.0).min(self.burst);
        *last = now;
        if *tokens >= 1.0 {
            *tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Fan-out over several transports. Sends go to every member (first
/// success wins the handle); inbound is drained from all of them.
pub struct MultiChannel {
    members: Vec<std::sync::Arc<dyn Channel>>,
}

impl MultiChannel {
    pub fn new(members: Vec<std::sync::Arc<dyn Channel>>) -> Self {
        Self { members }
    }

    fn fan_out(
        &self,
        op: impl Fn(&dyn Channel) -> Result<(), ChannelError>,
    ) -> Result<(), ChannelError> {
        let mut last_error = None;
        let mut any_ok = false;
        for member in &self.members {
            match op(member.as_ref()) {
                Ok(()) => any_ok = true,
                Err(e) => last_error = Some(e),
            }
        }
        if any_ok {
            Ok(())
        } else {
            Err(last_error.unwrap_or_else(|| ChannelError::Unavailable("no members".to_string())))
        }
    }
}

impl Channel for MultiChannel {
    fn name(&self) -> &'static str {
        "multi"
    }

    fn send_prompt(
        &self,
        session_id: &str,
        prompt: &PromptRecord,
    ) -> Result<MessageHandle, ChannelError> {
        let mut handle = None;
        let mut last_error = None;
        for member in &self.members {
            match member.send_prompt(session_id, prompt) {
                Ok(h) if handle.is_none() => handle = Some(h),
                Ok(_) => {}
                Err(e) => last_error = Some(e),
            }
        }
        handle.ok_or_else(|| {
            last_error.unwrap_or_else(|| ChannelError::Unavailable("no members".to_string()))
        })
    }

    fn send_output(&self, session_id: &str, chunk: &str) -> Result<(), ChannelError> {
        self.fan_out(|c| c.send_output(session_id, chunk))
    }

    fn send_plan(&self, session_id: &str, plan: &str) -> Result<(), ChannelError> {
        self.fan_out(|c| c.send_plan(session_id, plan))
    }

    fn notify(&self, session_id: &str, event: &str) -> Result<(), ChannelError> {
        self.fan_out(|c| c.notify(session_id, event))
    }

    fn poll_inbound(&self, timeout: Duration) -> Result<Vec<InboundMessage>, ChannelError> {
        let per_member = timeout / self.members.len().max(1) as u32;
        let mut messages = Vec::new();
        for member in &self.members {
            if let Ok(mut inbound) = member.poll_inbound(per_member) {
                messages.append(&mut inbound);
            }
        }
        Ok(messages)
    }
}

/// Local-terminal channel: prints prompts to the operator, no inbound.
pub struct ConsoleChannel;

impl Channel for ConsoleChannel {
    fn name(&self) -> &'static str {
        "console"
    }

    fn send_prompt(
        &self,
        session_id: &str,
        prompt: &PromptRecord,
    ) -> Result<MessageHandle, ChannelError> {
        eprintln!(
            "\x1b[33m[warden]\x1b[0m session {session_id} needs input ({}): {}",
            prompt.kind, prompt.excerpt
        );
        Ok(MessageHandle(format!("console-{}", prompt.id)))
    }

    fn send_output(&self, _session_id: &str, _chunk: &str) -> Result<(), ChannelError> {
        // The operator already sees the live PTY; don't double-print.
        Ok(())
    }

    fn send_plan(&self, session_id: &str, plan: &str) -> Result<(), ChannelError> {
        eprintln!("\x1b[36m[warden]\x1b[0m plan for {session_id}:\n{plan}");
        Ok(())
    }

    fn notify(&self, session_id: &str, event: &str) -> Result<(), ChannelError> {
        eprintln!("\x1b[36m[warden]\x1b[0m {session_id}: {event}");
        Ok(())
    }

    fn poll_inbound(&self, timeout: Duration) -> Result<Vec<InboundMessage>, ChannelError> {
        std::thread::sleep(timeout.min(Duration::from_millis(100)));
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowlist_membership() {
        let list = IdentityAllowlist::new(["user42".to_string()]);
        assert!(list.is_allowed("user42"));
        assert!(!list.is_allowed("user99"));
    }

    #[test]
    fn breaker_opens_after_three_consecutive_failures() {
        let breaker = CircuitBreaker::default();
        let now = Instant::now();
        assert!(breaker.on_failure(now).is_none());
        assert!(breaker.on_failure(now).is_none());
        assert_eq!(breaker.on_failure(now), Some(BreakerEvent::Opened));
        assert!(breaker.is_open(now));
        assert!(matches!(
            breaker.check(now).unwrap_err(),
            ChannelError::Unavailable(_)
        ));
    }

    #[test]
    fn breaker_success_resets_failure_count() {
        let breaker = CircuitBreaker::default();
        let now = Instant::now();
        breaker.on_failure(now);
        breaker.on_failure(now);
        breaker.on_success();
        // Two more failures don't open it; the streak restarted.
        assert!(breaker.on_failure(now).is_none());
        assert!(breaker.on_failure(now).is_none());
    }

    #[test]
    fn breaker_half_open_probe_closes_on_success() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(10));
        let start = Instant::now();
        assert_eq!(breaker.on_failure(start), Some(BreakerEvent::Opened));
        // Before the window: still open.
        assert!(breaker.check(start).is_err());
        // After the window: half-open, probe allowed.
        let later = start + Duration::from_millis(20);
        assert!(breaker.check(later).is_ok());
        assert_eq!(breaker.on_success(), Some(BreakerEvent::Closed));
        assert!(breaker.check(later).is_ok());
    }

    #[test]
    fn breaker_failed_probe_reopens() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(10));
        let start = Instant::now();
        breaker.on_failure(start);
        let later = start + Duration::from_millis(20);
        assert!(breaker.check(later).is_ok()); // half-open
        assert_eq!(breaker.on_failure(later), Some(BreakerEvent::Opened));
        assert!(breaker.check(later + Duration::from_millis(1)).is_err());
    }

    #[test]
    fn inbound_limiter_enforces_burst() {
        let limiter = InboundRateLimiter::new(10, 3);
        let now = Instant::now();
        for _ in 0..3 {
            assert!(limiter.try_take("user42", now));
        }
        assert!(!limiter.try_take("user42", now));
        // A different identity has its own bucket.
        assert!(limiter.try_take("user43", now));
    }

    #[test]
    fn inbound_limiter_refills_over_time() {
        let limiter = InboundRateLimiter::new(60, 1);
        let now = Instant::now();
        assert!(limiter.try_take("user42", now));
        assert!(!limiter.try_take("user42", now));
        // 60/min refills one token per second.
        assert!(limiter.try_take("user42", now + Duration::from_secs(1)));
    }

    #[test]
    fn rejection_reasons_render_screaming_snake() {
        assert_eq!(ChannelRejection::NotAllowlisted.as_str(), "NOT_ALLOWLISTED");
        assert_eq!(ChannelRejection::NonceMismatch.as_str(), "NONCE_MISMATCH");
        let json = serde_json::to_string(&ChannelRejection::RateLimited).unwrap();
        assert_eq!(json, "\"RATE_LIMITED\"");
    }

    #[test]
    fn console_channel_yields_no_inbound() {
        let channel = ConsoleChannel;
        let inbound = channel.poll_inbound(Duration::from_millis(10)).unwrap();
        assert!(inbound.is_empty());
    }
}
