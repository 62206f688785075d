//! Per-prompt lifecycle.
//!
//! ```text
//! CREATED → ROUTED → AWAITING_REPLY → REPLY_RECEIVED → INJECTED → RESOLVED
//!                          │
//!                          └→ EXPIRED          (TTL sweeper)
//! any non-terminal state   ─→ CANCELED         (session gone)
//! any non-terminal state   ─→ FAILED           (dispatch / write error)
//! ```
//!
//! The transition graph is fixed; everything else is rejected. The store
//! consults [`can_transition`] before persisting a status change, and the
//! AWAITING_REPLY → REPLY_RECEIVED edge is only ever taken by the atomic
//! decision guard.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle states of a detected prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptStatus {
    Created,
    Routed,
    AwaitingReply,
    ReplyReceived,
    Injected,
    Resolved,
    Expired,
    Canceled,
    Failed,
}

/// Attempted transition not present in the graph.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid prompt transition {from} -> {to}")]
pub struct TransitionError {
    pub from: PromptStatus,
    pub to: PromptStatus,
}

impl PromptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PromptStatus::Created => "created",
            PromptStatus::Routed => "routed",
            PromptStatus::AwaitingReply => "awaiting_reply",
            PromptStatus::ReplyReceived => "reply_received",
            PromptStatus::Injected => "injected",
            PromptStatus::Resolved => "resolved",
            PromptStatus::Expired => "expired",
            PromptStatus::Canceled => "canceled",
            PromptStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(PromptStatus::Created),
            "routed" => Some(PromptStatus::Routed),
            "awaiting_reply" => Some(PromptStatus::AwaitingReply),
            "reply_received" => Some(PromptStatus::ReplyReceived),
            "injected" => Some(PromptStatus::Injected),
            "resolved" => Some(PromptStatus::Resolved),
            "expired" => Some(PromptStatus::Expired),
            "canceled" => Some(PromptStatus::Canceled),
            "failed" => Some(PromptStatus::Failed),
            _ => None,
        }
    }

    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PromptStatus::Resolved
                | PromptStatus::Expired
                | PromptStatus::Canceled
                | PromptStatus::Failed
        )
    }
}

impl std::fmt::Display for PromptStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether `from -> to` is an edge in the lifecycle graph.
pub fn can_transition(from: PromptStatus, to: PromptStatus) -> bool {
    use PromptStatus::*;
    match (from, to) {
        (Created, Routed) => true,
        (Routed, AwaitingReply) => true,
        (AwaitingReply, ReplyReceived) => true,
        (AwaitingReply, Expired) => true,
        (ReplyReceived, Injected) => true,
        (Injected, Resolved) => true,
        // A claimed reply must reach INJECTED or FAILED, never CANCELED.
        (Created | Routed | AwaitingReply, Canceled) => true,
        (from, Failed) => !from.is_terminal(),
        _ => false,
    }
}

/// Validate a transition, returning the error the store surfaces.
pub fn check_transition(from: PromptStatus, to: PromptStatus) -> Result<(), TransitionError> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(TransitionError { from, to })
    }
}

/// Latency recorded on entry to RESOLVED.
pub fn latency_ms(created_at_ms: i64, resolved_at_ms: i64) -> i64 {
    (resolved_at_ms - created_at_ms).max(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALL: [PromptStatus; 9] = [
        PromptStatus::Created,
        PromptStatus::Routed,
        PromptStatus::AwaitingReply,
        PromptStatus::ReplyReceived,
        PromptStatus::Injected,
        PromptStatus::Resolved,
        PromptStatus::Expired,
        PromptStatus::Canceled,
        PromptStatus::Failed,
    ];

    #[test]
    fn happy_path_is_valid() {
        let path = [
            PromptStatus::Created,
            PromptStatus::Routed,
            PromptStatus::AwaitingReply,
            PromptStatus::ReplyReceived,
            PromptStatus::Injected,
            PromptStatus::Resolved,
        ];
        for pair in path.windows(2) {
            assert!(can_transition(pair[0], pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn reply_received_only_from_awaiting() {
        for from in ALL {
            let valid = can_transition(from, PromptStatus::ReplyReceived);
            assert_eq!(valid, from == PromptStatus::AwaitingReply, "from {from}");
        }
    }

    #[test]
    fn expired_only_from_awaiting() {
        for from in ALL {
            let valid = can_transition(from, PromptStatus::Expired);
            assert_eq!(valid, from == PromptStatus::AwaitingReply, "from {from}");
        }
    }

    #[test]
    fn skipping_injection_is_rejected() {
        assert!(!can_transition(
            PromptStatus::ReplyReceived,
            PromptStatus::Resolved
        ));
        assert!(!can_transition(
            PromptStatus::AwaitingReply,
            PromptStatus::Injected
        ));
    }

    #[test]
    fn check_transition_reports_edge() {
        let err = check_transition(PromptStatus::Resolved, PromptStatus::Routed).unwrap_err();
        assert_eq!(err.from, PromptStatus::Resolved);
        assert_eq!(err.to, PromptStatus::Routed);
    }

    #[test]
    fn latency_is_non_negative() {
        assert_eq!(latency_ms(1_000, 3_500), 2_500);
        assert_eq!(latency_ms(3_500, 1_000), 0);
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in ALL {
            assert_eq!(PromptStatus::parse(status.as_str()), Some(status));
        }
    }

    proptest! {
        #[test]
        fn terminal_states_have_no_outgoing_edges(from in 0usize..9, to in 0usize..9) {
            let (from, to) = (ALL[from], ALL[to]);
            if from.is_terminal() {
                prop_assert!(!can_transition(from, to));
            }
        }

        #[test]
        fn failure_reachable_from_every_live_state(idx in 0usize..9) {
            let from = ALL[idx];
            if !from.is_terminal() {
                prop_assert!(can_transition(from, PromptStatus::Failed));
            }
        }
    }

    #[test]
    fn claimed_reply_cannot_be_canceled() {
        assert!(!can_transition(
            PromptStatus::ReplyReceived,
            PromptStatus::Canceled
        ));
        assert!(!can_transition(PromptStatus::Injected, PromptStatus::Canceled));
        assert!(can_transition(
            PromptStatus::AwaitingReply,
            PromptStatus::Canceled
        ));
    }
}
