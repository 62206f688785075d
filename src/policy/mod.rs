//! Declarative policy — load, validate, evaluate.
//!
//! Policies are YAML: an ordered rule list plus defaults. Evaluation is
//! first-match-wins in declaration order, and every evaluation yields both
//! a decision and a per-criterion explanation list for the decision trace.
//!
//! Dangerous configurations are rejected at load time, not at evaluation
//! time: a rule may never auto-approve a yes/no prompt below HIGH
//! confidence, and free-text, password, and raw-terminal prompts can never
//! be auto-answered at all.

pub mod watch;

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::{Duration, Instant};

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use crate::config::AutonomyMode;
use crate::prompt::{Confidence, PromptKind};
use crate::trace::RuleEvaluation;

/// Wall-clock budget for a single pattern evaluation.
const PATTERN_BUDGET: Duration = Duration::from_millis(100);

/// Default rate budget for throttled rules.
const DEFAULT_PER_MINUTE: u32 = 10;
const DEFAULT_BURST: u32 = 3;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("failed to read policy {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse policy: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("rule '{rule}': {message}")]
    Invalid { rule: String, message: String },
    #[error("rule '{rule}' extends unknown rule '{parent}'")]
    UnknownExtends { rule: String, parent: String },
    #[error("extends cycle involving rule '{0}'")]
    ExtendsCycle(String),
    #[error("duplicate rule id '{0}'")]
    DuplicateRule(String),
    #[error("rule '{rule}': invalid pattern: {source}")]
    BadPattern {
        rule: String,
        source: Box<regex::Error>,
    },
}

// ── On-disk model ──

#[derive(Debug, Clone, Deserialize)]
struct PolicyFile {
    policy_version: u32,
    #[serde(default)]
    autonomy_mode: Option<AutonomyMode>,
    #[serde(default)]
    defaults: DefaultsSpec,
    #[serde(default)]
    rules: Vec<RuleSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DefaultAction {
    #[default]
    RequireHuman,
    Deny,
}

#[derive(Debug, Clone, Deserialize)]
struct DefaultsSpec {
    #[serde(default)]
    no_match: DefaultAction,
    #[serde(default)]
    low_confidence: DefaultAction,
    /// Inject the kind-specific safe default when a prompt expires.
    #[serde(default)]
    safe_default: bool,
}

impl Default for DefaultsSpec {
    fn default() -> Self {
        Self {
            no_match: DefaultAction::RequireHuman,
            low_confidence: DefaultAction::RequireHuman,
            safe_default: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RuleSpec {
    id: String,
    #[serde(default)]
    extends: Option<String>,
    #[serde(default, rename = "match")]
    match_: MatchSpec,
    action: ActionSpec,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    rate: Option<RateSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ActionSpec {
    AutoReply,
    RequireHuman,
    Deny,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct MatchSpec {
    #[serde(default)]
    prompt_type: Option<Vec<PromptKind>>,
    #[serde(default)]
    min_confidence: Option<Confidence>,
    #[serde(default)]
    max_confidence: Option<Confidence>,
    #[serde(default)]
    any_of: Option<Vec<String>>,
    #[serde(default)]
    none_of: Option<Vec<String>>,
    #[serde(default)]
    pattern: Option<String>,
    #[serde(default)]
    session_tag: Option<String>,
}

impl MatchSpec {
    /// `extends` resolution: child fields override, parent fills gaps.
    fn merged_over(&self, parent: &MatchSpec) -> MatchSpec {
        MatchSpec {
            prompt_type: self.prompt_type.clone().or_else(|| parent.prompt_type.clone()),
            min_confidence: self.min_confidence.or(parent.min_confidence),
            max_confidence: self.max_confidence.or(parent.max_confidence),
            any_of: self.any_of.clone().or_else(|| parent.any_of.clone()),
            none_of: self.none_of.clone().or_else(|| parent.none_of.clone()),
            pattern: self.pattern.clone().or_else(|| parent.pattern.clone()),
            session_tag: self.session_tag.clone().or_else(|| parent.session_tag.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RateSpec {
    #[serde(default = "default_per_minute")]
    pub per_minute: u32,
    #[serde(default = "default_burst")]
    pub burst: u32,
}

fn default_per_minute() -> u32 {
    DEFAULT_PER_MINUTE
}

fn default_burst() -> u32 {
    DEFAULT_BURST
}

// ── Compiled model ──

/// What a rule does when it matches.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    AutoReply(String),
    RequireHuman,
    Deny,
}

/// What the evaluator decided for a prompt.
#[derive(Debug, Clone, PartialEq)]
pub enum DecisionAction {
    AutoReply(String),
    RequireHuman,
    Deny,
    RateLimited,
}

impl DecisionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionAction::AutoReply(_) => "auto_reply",
            DecisionAction::RequireHuman => "require_human",
            DecisionAction::Deny => "deny",
            DecisionAction::RateLimited => "rate_limited",
        }
    }
}

#[derive(Debug, Clone)]
struct CompiledMatch {
    prompt_type: Option<Vec<PromptKind>>,
    min_confidence: Option<Confidence>,
    max_confidence: Option<Confidence>,
    any_of: Option<Vec<String>>,
    none_of: Option<Vec<String>>,
    pattern: Option<Regex>,
    session_tag: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub id: String,
    matcher: CompiledMatch,
    pub action: Action,
    pub rate: Option<RateSpec>,
}

/// A validated, immutable policy.
#[derive(Debug, Clone)]
pub struct Policy {
    pub version: u32,
    pub autonomy_mode: Option<AutonomyMode>,
    pub no_match: DefaultAction,
    pub low_confidence: DefaultAction,
    pub safe_default_on_expiry: bool,
    pub rules: Vec<CompiledRule>,
}

/// The prompt fields the evaluator sees.
#[derive(Debug, Clone)]
pub struct PromptView<'a> {
    pub kind: PromptKind,
    pub confidence: Confidence,
    pub excerpt: &'a str,
    pub session_tag: Option<&'a str>,
}

/// Decision plus the explanation the trace records.
#[derive(Debug, Clone)]
pub struct Decision {
    pub action: DecisionAction,
    pub rule_id: Option<String>,
    pub reason: String,
    pub evaluations: Vec<RuleEvaluation>,
}

/// Mutable rate state shared across evaluations, keyed by
/// `(rule, user, channel)`.
#[derive(Debug, Default)]
pub struct RateState {
    buckets: HashMap<String, TokenBucket>,
}

impl RateState {
    pub fn new() -> Self {
        Self::default()
    }

    fn try_take(&mut self, key: &str, spec: RateSpec, now: Instant) -> bool {
        self.buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::new(spec, now))
            .try_take(now)
    }
}

/// Classic token bucket: capacity = burst, refilled at `per_minute`.
#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(spec: RateSpec, now: Instant) -> Self {
        let capacity = f64::from(spec.burst.max(1));
        Self {
            capacity,
            refill_per_sec: f64::from(spec.per_minute) / 60.0,
            tokens: capacity,
            last_refill: now,
        }
    }

    fn try_take(&mut self, now: Instant) -> bool {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

impl Policy {
    /// Load and validate from a YAML file.
    pub fn load(path: &Path) -> Result<Self, PolicyError> {
        let contents = std::fs::read_to_string(path).map_err(|source| PolicyError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate from YAML text.
    pub fn from_yaml(text: &str) -> Result<Self, PolicyError> {
        let file: PolicyFile = serde_yaml::from_str(text)?;
        compile(file)
    }

    /// An empty policy: no rules, safe defaults.
    pub fn permissive_default() -> Self {
        Self {
            version: 1,
            autonomy_mode: None,
            no_match: DefaultAction::RequireHuman,
            low_confidence: DefaultAction::RequireHuman,
            safe_default_on_expiry: false,
            rules: Vec::new(),
        }
    }

    /// First-match-wins evaluation with per-criterion explanations.
    ///
    /// `rate_key` scopes throttled rules, typically `user:channel`.
    pub fn evaluate(
        &self,
        prompt: &PromptView<'_>,
        rate: &mut RateState,
        rate_key: &str,
        now: Instant,
    ) -> Decision {
        let mut evaluations = Vec::with_capacity(self.rules.len());
        let mut saw_rate_limited = false;

        for rule in &self.rules {
            match rule.matcher.check(prompt) {
                Err(criterion) => {
                    evaluations.push(RuleEvaluation {
                        rule_id: rule.id.clone(),
                        matched: false,
                        failing_criterion: Some(criterion),
                    });
                }
                Ok(()) => {
                    if let Some(spec) = rule.rate {
                        let key = format!("{}:{rate_key}", rule.id);
                        if !rate.try_take(&key, spec, now) {
                            saw_rate_limited = true;
                            evaluations.push(RuleEvaluation {
                                rule_id: rule.id.clone(),
                                matched: false,
                                failing_criterion: Some("rate_budget_exhausted".to_string()),
                            });
                            continue;
                        }
                    }
                    evaluations.push(RuleEvaluation {
                        rule_id: rule.id.clone(),
                        matched: true,
                        failing_criterion: None,
                    });
                    let action = match &rule.action {
                        Action::AutoReply(v) => DecisionAction::AutoReply(v.clone()),
                        Action::RequireHuman => DecisionAction::RequireHuman,
                        Action::Deny => DecisionAction::Deny,
                    };
                    return Decision {
                        reason: format!("matched rule '{}'", rule.id),
                        rule_id: Some(rule.id.clone()),
                        action,
                        evaluations,
                    };
                }
            }
        }

        if saw_rate_limited {
            return Decision {
                action: DecisionAction::RateLimited,
                rule_id: None,
                reason: "matching rule over rate budget".to_string(),
                evaluations,
            };
        }

        let (default, reason) = if prompt.confidence == Confidence::Low {
            (self.low_confidence, "low-confidence default")
        } else {
            (self.no_match, "no rule matched")
        };
        Decision {
            action: match default {
                DefaultAction::RequireHuman => DecisionAction::RequireHuman,
                DefaultAction::Deny => DecisionAction::Deny,
            },
            rule_id: None,
            reason: reason.to_string(),
            evaluations,
        }
    }
}

impl CompiledMatch {
    /// `Ok(())` on match; `Err(name-of-failing-criterion)` otherwise.
    fn check(&self, prompt: &PromptView<'_>) -> Result<(), String> {
        if let Some(kinds) = &self.prompt_type {
            if !kinds.contains(&prompt.kind) {
                return Err("prompt_type".to_string());
            }
        }
        if let Some(min) = self.min_confidence {
            if prompt.confidence < min {
                return Err("min_confidence".to_string());
            }
        }
        if let Some(max) = self.max_confidence {
            if prompt.confidence > max {
                return Err("max_confidence".to_string());
            }
        }
        if let Some(needles) = &self.any_of {
            if !needles.iter().any(|n| prompt.excerpt.contains(n.as_str())) {
                return Err("any_of".to_string());
            }
        }
        if let Some(needles) = &self.none_of {
            if needles.iter().any(|n| prompt.excerpt.contains(n.as_str())) {
                return Err("none_of".to_string());
            }
        }
        if let Some(pattern) = &self.pattern {
            let started = Instant::now();
            let hit = pattern.is_match(prompt.excerpt);
            if started.elapsed() > PATTERN_BUDGET {
                // Over-budget evaluation counts as a non-match.
                return Err("pattern_budget_exceeded".to_string());
            }
            if !hit {
                return Err("pattern".to_string());
            }
        }
        if let Some(tag) = &self.session_tag {
            if prompt.session_tag != Some(tag.as_str()) {
                return Err("session_tag".to_string());
            }
        }
        Ok(())
    }

    /// Kinds this rule can fire on (`None` in the spec means "all").
    fn covers(&self, kind: PromptKind) -> bool {
        match &self.prompt_type {
            Some(kinds) => kinds.contains(&kind),
            None => true,
        }
    }
}

fn compile(file: PolicyFile) -> Result<Policy, PolicyError> {
    // Duplicate ids break extends resolution and trace readability.
    let mut ids = HashSet::new();
    for rule in &file.rules {
        if !ids.insert(rule.id.clone()) {
            return Err(PolicyError::DuplicateRule(rule.id.clone()));
        }
    }

    let by_id: HashMap<&str, &RuleSpec> =
        file.rules.iter().map(|r| (r.id.as_str(), r)).collect();

    let mut compiled = Vec::with_capacity(file.rules.len());
    for rule in &file.rules {
        let matcher = resolve_match(rule, &by_id)?;
        let action = match rule.action {
            ActionSpec::AutoReply => {
                let value = rule.value.clone().ok_or_else(|| PolicyError::Invalid {
                    rule: rule.id.clone(),
                    message: "auto_reply requires a value".to_string(),
                })?;
                Action::AutoReply(value)
            }
            ActionSpec::RequireHuman => Action::RequireHuman,
            ActionSpec::Deny => Action::Deny,
        };
        validate_action(&rule.id, &matcher, &action)?;
        let pattern = match &matcher.pattern {
            Some(p) => Some(Regex::new(p).map_err(|source| PolicyError::BadPattern {
                rule: rule.id.clone(),
                source: Box::new(source),
            })?),
            None => None,
        };
        compiled.push(CompiledRule {
            id: rule.id.clone(),
            matcher: CompiledMatch {
                prompt_type: matcher.prompt_type,
                min_confidence: matcher.min_confidence,
                max_confidence: matcher.max_confidence,
                any_of: matcher.any_of,
                none_of: matcher.none_of,
                pattern,
                session_tag: matcher.session_tag,
            },
            action,
            rate: rule.rate,
        });
    }

    Ok(Policy {
        version: file.policy_version,
        autonomy_mode: file.autonomy_mode,
        no_match: file.defaults.no_match,
        low_confidence: file.defaults.low_confidence,
        safe_default_on_expiry: file.defaults.safe_default,
        rules: compiled,
    })
}

/// Walk the `extends` chain, child fields overriding parents.
fn resolve_match(
    rule: &RuleSpec,
    by_id: &HashMap<&str, &RuleSpec>,
) -> Result<MatchSpec, PolicyError> {
    let mut merged = rule.match_.clone();
    let mut visited = HashSet::new();
    visited.insert(rule.id.as_str());
    let mut current = rule;
    while let Some(parent_id) = &current.extends {
        let parent = by_id
            .get(parent_id.as_str())
            .ok_or_else(|| PolicyError::UnknownExtends {
                rule: rule.id.clone(),
                parent: parent_id.clone(),
            })?;
        if !visited.insert(parent.id.as_str()) {
            return Err(PolicyError::ExtendsCycle(rule.id.clone()));
        }
        merged = merged.merged_over(&parent.match_);
        current = parent;
    }
    Ok(merged)
}

/// Forbidden configurations rejected at load time.
fn validate_action(
    rule_id: &str,
    matcher: &MatchSpec,
    action: &Action,
) -> Result<(), PolicyError> {
    let Action::AutoReply(value) = action else {
        return Ok(());
    };

    let compiled_view = CompiledMatch {
        prompt_type: matcher.prompt_type.clone(),
        min_confidence: matcher.min_confidence,
        max_confidence: matcher.max_confidence,
        any_of: None,
        none_of: None,
        pattern: None,
        session_tag: None,
    };

    for kind in [
        PromptKind::FreeText,
        PromptKind::Password,
        PromptKind::RawTerminal,
    ] {
        if compiled_view.covers(kind) {
            return Err(PolicyError::Invalid {
                rule: rule_id.to_string(),
                message: format!("auto_reply may not target {kind} prompts"),
            });
        }
    }

    let affirms = matches!(value.trim().to_ascii_lowercase().as_str(), "y" | "yes");
    if affirms
        && compiled_view.covers(PromptKind::YesNo)
        && matcher.min_confidence != Some(Confidence::High)
    {
        return Err(PolicyError::Invalid {
            rule: rule_id.to_string(),
            message: "auto-approving yes/no prompts requires min_confidence: high".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r#"
policy_version: 1
autonomy_mode: assist
defaults:
  no_match: require_human
  low_confidence: require_human
  safe_default: true
rules:
  - id: approve-overwrite
    match:
      prompt_type: [yes_no]
      min_confidence: high
      any_of: ["Overwrite"]
      none_of: ["rm -rf"]
    action: auto_reply
    value: "y"
  - id: deny-trust
    match:
      prompt_type: [folder_trust]
    action: deny
"#;

    fn view(kind: PromptKind, confidence: Confidence, excerpt: &str) -> PromptView<'static> {
        PromptView {
            kind,
            confidence,
            excerpt: Box::leak(excerpt.to_string().into_boxed_str()),
            session_tag: None,
        }
    }

    fn decide(policy: &Policy, prompt: &PromptView<'_>) -> Decision {
        let mut rate = RateState::new();
        policy.evaluate(prompt, &mut rate, "user42:telegram", Instant::now())
    }

    #[test]
    fn parses_and_validates_base_policy() {
        let p = Policy::from_yaml(BASE).unwrap();
        assert_eq!(p.version, 1);
        assert_eq!(p.rules.len(), 2);
        assert!(p.safe_default_on_expiry);
    }

    #[test]
    fn first_match_wins_and_cites_rule() {
        let p = Policy::from_yaml(BASE).unwrap();
        let d = decide(
            &p,
            &view(PromptKind::YesNo, Confidence::High, "Overwrite file? (y/n)"),
        );
        assert_eq!(d.action, DecisionAction::AutoReply("y".to_string()));
        assert_eq!(d.rule_id.as_deref(), Some("approve-overwrite"));
        // Later rules were never evaluated.
        assert_eq!(d.evaluations.len(), 1);
        assert!(d.evaluations[0].matched);
    }

    #[test]
    fn failing_criterion_is_named() {
        let p = Policy::from_yaml(BASE).unwrap();
        let d = decide(
            &p,
            &view(PromptKind::YesNo, Confidence::Med, "Overwrite file? (y/n)"),
        );
        assert_eq!(d.action, DecisionAction::RequireHuman);
        assert_eq!(
            d.evaluations[0].failing_criterion.as_deref(),
            Some("min_confidence")
        );
        assert_eq!(d.reason, "no rule matched");
    }

    #[test]
    fn none_of_blocks_match() {
        let p = Policy::from_yaml(BASE).unwrap();
        let d = decide(
            &p,
            &view(
                PromptKind::YesNo,
                Confidence::High,
                "Overwrite and rm -rf /? (y/n)",
            ),
        );
        assert_eq!(d.action, DecisionAction::RequireHuman);
        assert_eq!(d.evaluations[0].failing_criterion.as_deref(), Some("none_of"));
    }

    #[test]
    fn deny_rule_fires() {
        let p = Policy::from_yaml(BASE).unwrap();
        let d = decide(
            &p,
            &view(
                PromptKind::FolderTrust,
                Confidence::High,
                "Do you trust the files in this folder?",
            ),
        );
        assert_eq!(d.action, DecisionAction::Deny);
        assert_eq!(d.rule_id.as_deref(), Some("deny-trust"));
    }

    #[test]
    fn low_confidence_uses_its_own_default() {
        let yaml = r#"
policy_version: 1
defaults:
  no_match: require_human
  low_confidence: deny
rules: []
"#;
        let p = Policy::from_yaml(yaml).unwrap();
        let d = decide(&p, &view(PromptKind::FreeText, Confidence::Low, "hmm"));
        assert_eq!(d.action, DecisionAction::Deny);
        assert_eq!(d.reason, "low-confidence default");
    }

    #[test]
    fn extends_inherits_and_overrides() {
        let yaml = r#"
policy_version: 1
rules:
  - id: base
    match:
      prompt_type: [yes_no]
      min_confidence: high
      any_of: ["Overwrite"]
    action: auto_reply
    value: "y"
  - id: narrower
    extends: base
    match:
      any_of: ["Replace"]
    action: auto_reply
    value: "y"
"#;
        let p = Policy::from_yaml(yaml).unwrap();
        // Child keeps parent's prompt_type/min_confidence, overrides any_of.
        let d = decide(
            &p,
            &view(PromptKind::YesNo, Confidence::High, "Replace config? (y/n)"),
        );
        assert_eq!(d.rule_id.as_deref(), Some("narrower"));
    }

    #[test]
    fn unknown_extends_rejected() {
        let yaml = r#"
policy_version: 1
rules:
  - id: orphan
    extends: ghost
    action: require_human
"#;
        assert!(matches!(
            Policy::from_yaml(yaml).unwrap_err(),
            PolicyError::UnknownExtends { .. }
        ));
    }

    #[test]
    fn extends_cycle_rejected() {
        let yaml = r#"
policy_version: 1
rules:
  - id: a
    extends: b
    action: require_human
  - id: b
    extends: a
    action: require_human
"#;
        assert!(matches!(
            Policy::from_yaml(yaml).unwrap_err(),
            PolicyError::ExtendsCycle(_)
        ));
    }

    #[test]
    fn forbidden_auto_yes_below_high() {
        let yaml = r#"
policy_version: 1
rules:
  - id: reckless
    match:
      prompt_type: [yes_no]
      min_confidence: med
    action: auto_reply
    value: "y"
"#;
        assert!(matches!(
            Policy::from_yaml(yaml).unwrap_err(),
            PolicyError::Invalid { .. }
        ));
    }

    #[test]
    fn forbidden_auto_reply_on_free_text() {
        let yaml = r#"
policy_version: 1
rules:
  - id: reckless
    match:
      prompt_type: [free_text]
    action: auto_reply
    value: "ok"
"#;
        assert!(matches!(
            Policy::from_yaml(yaml).unwrap_err(),
            PolicyError::Invalid { .. }
        ));
    }

    #[test]
    fn forbidden_auto_reply_without_kind_filter() {
        // No prompt_type means the rule covers password prompts too.
        let yaml = r#"
policy_version: 1
rules:
  - id: reckless
    action: auto_reply
    value: "ok"
"#;
        assert!(matches!(
            Policy::from_yaml(yaml).unwrap_err(),
            PolicyError::Invalid { .. }
        ));
    }

    #[test]
    fn duplicate_rule_ids_rejected() {
        let yaml = r#"
policy_version: 1
rules:
  - id: twin
    action: require_human
  - id: twin
    action: deny
"#;
        assert!(matches!(
            Policy::from_yaml(yaml).unwrap_err(),
            PolicyError::DuplicateRule(_)
        ));
    }

    #[test]
    fn rate_limited_rule_yields_rate_limited() {
        let yaml = r#"
policy_version: 1
rules:
  - id: throttled
    match:
      prompt_type: [confirm_enter]
    action: auto_reply
    value: ""
    rate:
      per_minute: 10
      burst: 2
"#;
        let p = Policy::from_yaml(yaml).unwrap();
        let mut rate = RateState::new();
        let now = Instant::now();
        let prompt = view(PromptKind::ConfirmEnter, Confidence::High, "Press enter");
        for _ in 0..2 {
            let d = p.evaluate(&prompt, &mut rate, "user42:telegram", now);
            assert!(matches!(d.action, DecisionAction::AutoReply(_)));
        }
        // Burst exhausted, no refill yet.
        let d = p.evaluate(&prompt, &mut rate, "user42:telegram", now);
        assert_eq!(d.action, DecisionAction::RateLimited);
        assert_eq!(
            d.evaluations[0].failing_criterion.as_deref(),
            Some("rate_budget_exhausted")
        );
    }

    #[test]
    fn rate_buckets_are_scoped_per_key() {
        let yaml = r#"
policy_version: 1
rules:
  - id: throttled
    match:
      prompt_type: [confirm_enter]
    action: auto_reply
    value: ""
    rate:
      per_minute: 10
      burst: 1
"#;
        let p = Policy::from_yaml(yaml).unwrap();
        let mut rate = RateState::new();
        let now = Instant::now();
        let prompt = view(PromptKind::ConfirmEnter, Confidence::High, "Press enter");
        assert!(matches!(
            p.evaluate(&prompt, &mut rate, "user42:telegram", now).action,
            DecisionAction::AutoReply(_)
        ));
        assert_eq!(
            p.evaluate(&prompt, &mut rate, "user42:telegram", now).action,
            DecisionAction::RateLimited
        );
        // Another identity still has budget.
        assert!(matches!(
            p.evaluate(&prompt, &mut rate, "user99:telegram", now).action,
            DecisionAction::AutoReply(_)
        ));
    }

    #[test]
    fn evaluation_is_deterministic() {
        let p = Policy::from_yaml(BASE).unwrap();
        let prompt = view(PromptKind::YesNo, Confidence::High, "Overwrite file? (y/n)");
        let a = decide(&p, &prompt);
        let b = decide(&p, &prompt);
        assert_eq!(a.action, b.action);
        assert_eq!(a.rule_id, b.rule_id);
        assert_eq!(a.evaluations, b.evaluations);
        assert_eq!(a.reason, b.reason);
    }

    #[test]
    fn pattern_criterion_matches_regex() {
        let yaml = r#"
policy_version: 1
rules:
  - id: pattern-rule
    match:
      prompt_type: [confirm_enter]
      pattern: "(?i)press\\s+enter"
    action: auto_reply
    value: ""
"#;
        let p = Policy::from_yaml(yaml).unwrap();
        let d = decide(
            &p,
            &view(PromptKind::ConfirmEnter, Confidence::High, "Press enter to continue"),
        );
        assert!(matches!(d.action, DecisionAction::AutoReply(_)));
    }

    #[test]
    fn bad_pattern_rejected_at_load() {
        let yaml = r#"
policy_version: 1
rules:
  - id: broken
    match:
      prompt_type: [confirm_enter]
      pattern: "(unclosed"
    action: require_human
"#;
        assert!(matches!(
            Policy::from_yaml(yaml).unwrap_err(),
            PolicyError::BadPattern { .. }
        ));
    }

    #[test]
    fn session_tag_criterion() {
        let yaml = r#"
policy_version: 1
rules:
  - id: tagged
    match:
      prompt_type: [confirm_enter]
      session_tag: "ci"
    action: auto_reply
    value: ""
"#;
        let p = Policy::from_yaml(yaml).unwrap();
        let mut rate = RateState::new();
        let untagged = PromptView {
            kind: PromptKind::ConfirmEnter,
            confidence: Confidence::High,
            excerpt: "Press enter",
            session_tag: None,
        };
        let d = p.evaluate(&untagged, &mut rate, "k", Instant::now());
        assert_eq!(d.action, DecisionAction::RequireHuman);

        let tagged = PromptView {
            session_tag: Some("ci"),
            ..untagged
        };
        let d = p.evaluate(&tagged, &mut rate, "k", Instant::now());
        assert!(matches!(d.action, DecisionAction::AutoReply(_)));
    }
}
