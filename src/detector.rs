//! Tri-signal prompt detection.
//!
//! Consumes the supervisor's rolling output buffer and emits at most one
//! candidate per output event. Three signals feed the score:
//!
//! 1. **Pattern match** — the ANSI-stripped tail hits a curated regex
//!    table (HIGH, except the inherently weaker free-text heuristics).
//! 2. **Blocked on read** — a platform probe says the child is runnable
//!    but its PTY has nothing more to give (MED).
//! 3. **Silence** — the idle watchdog fired with a non-empty buffer (LOW).
//!
//! Confidence is the max of the signals that fired. Output observed inside
//! the echo-suppression window never produces a candidate.
//!
//! A 30-second rolling set of content hashes suppresses re-printed prompts;
//! the router layers an active-prompt comparison and a fail-safe rate
//! limiter on top.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

use crate::prompt::{
    Confidence, PromptKind, PromptPatterns, build_excerpt, looks_raw_terminal, strip_ansi,
};

/// Configuration for the detector.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// How long a content hash suppresses an identical candidate.
    pub dedup_window: Duration,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            dedup_window: Duration::from_secs(30),
        }
    }
}

/// A classified prompt candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub kind: PromptKind,
    pub confidence: Confidence,
    pub excerpt: String,
}

/// What the detector concluded for one buffer event.
#[derive(Debug, Clone, PartialEq)]
pub enum DetectorEvent {
    /// A new prompt candidate.
    Candidate(Detection),
    /// Same content as a recent candidate; suppressed.
    Duplicate(Detection),
}

/// Non-pattern signals accompanying a buffer event.
#[derive(Debug, Clone, Copy, Default)]
pub struct Signals {
    /// The supervisor is inside the post-injection echo window.
    pub echo_suspect: bool,
    /// Platform probe inferred the child is awaiting input.
    pub blocked_on_read: bool,
    /// The idle watchdog fired (buffer non-empty, no output for the
    /// silence threshold).
    pub idle: bool,
}

pub struct PromptDetector {
    patterns: PromptPatterns,
    config: DetectorConfig,
    seen: VecDeque<(Instant, [u8; 32])>,
}

impl PromptDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            patterns: PromptPatterns::curated(),
            config,
            seen: VecDeque::new(),
        }
    }

    /// Classify the current buffer tail. `raw_tail` is the unstripped
    /// rolling buffer contents.
    pub fn observe(&mut self, raw_tail: &str, signals: Signals) -> Option<DetectorEvent> {
        if signals.echo_suspect {
            return None;
        }
        let stripped = strip_ansi(raw_tail);
        if stripped.trim().is_empty() {
            return None;
        }

        let classified = self.classify(raw_tail, &stripped, signals)?;
        let hash = content_hash(classified.kind, &classified.excerpt);
        let now = Instant::now();
        self.expire_seen(now);
        if self.seen.iter().any(|(_, h)| *h == hash) {
            return Some(DetectorEvent::Duplicate(classified));
        }
        self.seen.push_back((now, hash));
        Some(DetectorEvent::Candidate(classified))
    }

    fn classify(&self, raw_tail: &str, stripped: &str, signals: Signals) -> Option<Detection> {
        // Raw-terminal interaction outranks the text patterns: a TUI menu
        // can look like a numbered choice after stripping.
        if looks_raw_terminal(raw_tail) {
            return Some(Detection {
                kind: PromptKind::RawTerminal,
                confidence: Confidence::High,
                excerpt: build_excerpt(raw_tail),
            });
        }

        let pattern = self.patterns.detect(stripped);
        let kind = match &pattern {
            Some(m) => m.kind,
            // Without a pattern, only a blocked or silent child suggests
            // input is wanted; treat it as free-form entry.
            None if signals.blocked_on_read || signals.idle => PromptKind::FreeText,
            None => return None,
        };

        let pattern_confidence = pattern.map(|m| {
            // Free-text heuristics (trailing colon) are weaker than the
            // closed-form prompts.
            if m.kind == PromptKind::FreeText {
                Confidence::Med
            } else {
                Confidence::High
            }
        });

        let mut confidence = Confidence::Low;
        if let Some(c) = pattern_confidence {
            confidence = confidence.max(c);
        }
        if signals.blocked_on_read {
            confidence = confidence.max(Confidence::Med);
        }

        Some(Detection {
            kind,
            confidence,
            excerpt: build_excerpt(raw_tail),
        })
    }

    fn expire_seen(&mut self, now: Instant) {
        while let Some((at, _)) = self.seen.front() {
            if now.duration_since(*at) >= self.config.dedup_window {
                self.seen.pop_front();
            } else {
                break;
            }
        }
    }
}

fn content_hash(kind: PromptKind, excerpt: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update(b"\x00");
    hasher.update(excerpt.as_bytes());
    hasher.finalize().into()
}
