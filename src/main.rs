use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use dialoguer::{Confirm, Input, Password, Select};
use serde_json::json;
use tracing::info;

use warden_cli::audit::{self, AuditKind, AuditLog};
use warden_cli::channel::ChannelError;
use warden_cli::cli::{
    AuditCommand, AutopilotCommand, Cli, Command, ConfidenceArg, DbCommand, ModeArg, PolicyCommand,
};
use warden_cli::config::{self, AutonomyMode, Config, ConfigError};
use warden_cli::daemon::{Daemon, process_alive};
use warden_cli::doctor;
use warden_cli::paths;
use warden_cli::policy::{Policy, PolicyError, PromptView, RateState};
use warden_cli::prompt::{Confidence, PromptKind};
use warden_cli::router::{META_AUTOPILOT_MODE, META_PAUSED};
use warden_cli::store::{SCHEMA_VERSION, Store};
use warden_cli::trace;

/// Exit codes (frozen contract): 0 success, 2 usage, 3 config, 4 channel
/// unreachable, 5 policy invalid.
const EXIT_CONFIG: u8 = 3;
const EXIT_CHANNEL: u8 = 4;
const EXIT_POLICY: u8 = 5;

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warden=info",
        1 => "warden=debug",
        _ => "warden=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match dispatch(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(exit_code_for(&e))
        }
    }
}

fn exit_code_for(error: &anyhow::Error) -> u8 {
    for cause in error.chain() {
        if cause.downcast_ref::<ConfigError>().is_some() {
            return EXIT_CONFIG;
        }
        if cause.downcast_ref::<PolicyError>().is_some() {
            return EXIT_POLICY;
        }
        if let Some(channel) = cause.downcast_ref::<ChannelError>() {
            if matches!(
                channel,
                ChannelError::Unavailable(_) | ChannelError::Deadline(_)
            ) {
                return EXIT_CHANNEL;
            }
        }
    }
    1
}

fn dispatch(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Command::Setup => cmd_setup(),
        Command::Run { tool, args } => cmd_run(&tool, &args),
        Command::Status => cmd_status(cli.json),
        Command::Sessions => cmd_sessions(cli.json),
        Command::Doctor { fix } => cmd_doctor(fix, cli.json),
        Command::Audit {
            command: AuditCommand::Verify,
        } => cmd_audit_verify(cli.json),
        Command::Pause => cmd_set_paused(true),
        Command::Resume => cmd_set_paused(false),
        Command::Policy { command } => cmd_policy(command, cli.json),
        Command::Autopilot { command } => cmd_autopilot(command, cli.json),
        Command::Db { command } => cmd_db(command, cli.json),
    }
}

// ── setup ──

fn cmd_setup() -> Result<ExitCode> {
    let config_path = paths::config_file();
    if config_path.exists() {
        let overwrite = Confirm::new()
            .with_prompt(format!("{} exists; overwrite?", config_path.display()))
            .default(false)
            .interact()?;
        if !overwrite {
            return Ok(ExitCode::SUCCESS);
        }
    }

    let channels = ["telegram", "console", "multi"];
    let channel_idx = Select::new()
        .with_prompt("Channel for prompt escalation")
        .items(&channels)
        .default(0)
        .interact()?;
    let channel = channels[channel_idx];

    let (bot_token, chat_id) = if channel != "console" {
        let token: String = Password::new()
            .with_prompt("Telegram bot token")
            .interact()?;
        let chat: String = Input::new()
            .with_prompt("Telegram chat id")
            .interact_text()?;
        (token, chat)
    } else {
        (String::new(), String::new())
    };

    let identities: String = Input::new()
        .with_prompt("Allowed identities (comma-separated usernames)")
        .allow_empty(true)
        .interact_text()?;
    let allowed: Vec<String> = identities
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();

    let free_text = Confirm::new()
        .with_prompt("Allow free-text replies from the channel?")
        .default(false)
        .interact()?;

    let allowed_toml = allowed
        .iter()
        .map(|id| format!("\"{id}\""))
        .collect::<Vec<_>>()
        .join(", ");
    let body = format!(
        "channel = \"{channel}\"\nallowed_identities = [{allowed_toml}]\n\n\
         [telegram]\nbot_token = \"{bot_token}\"\nchat_id = \"{chat_id}\"\n\n\
         [prompt]\ntimeout_seconds = 600\nsilence_seconds = 2.0\nfree_text_enabled = {free_text}\npassword_reply_enabled = false\n\n\
         [audit]\nmax_rows = 10000\n\n\
         [autopilot]\nmode = \"assist\"\n"
    );
    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&config_path, body)?;
    config::fix_permissions(&config_path)?;
    println!("wrote {}", config_path.display());

    let policy_path = paths::default_policy_file();
    if !policy_path.exists() {
        std::fs::write(&policy_path, STARTER_POLICY)?;
        println!("wrote starter policy {}", policy_path.display());
    }
    Ok(ExitCode::SUCCESS)
}

const STARTER_POLICY: &str = r#"policy_version: 1
autonomy_mode: assist
defaults:
  no_match: require_human
  low_confidence: require_human
  safe_default: false
rules:
  # Confirmations that only continue paused output are safe to wave through.
  - id: press-enter-continue
    match:
      prompt_type: [confirm_enter]
      min_confidence: high
    action: auto_reply
    value: ""
  # Never answer workspace-trust screens automatically.
  - id: escalate-trust
    match:
      prompt_type: [folder_trust]
    action: require_human
"#;

// ── run ──

fn cmd_run(tool: &str, args: &[String]) -> Result<ExitCode> {
    let config = Config::load().map_err(anyhow::Error::from)?;
    let daemon = Daemon::bootstrap(config)?;
    let success = daemon.run_session(tool, args)?;
    Ok(if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

// ── status / sessions ──

fn open_store_read_only() -> Result<Option<Store>> {
    let path = paths::store_file();
    if !path.exists() {
        return Ok(None);
    }
    Ok(Some(Store::open_read_only(&path)?))
}

fn cmd_status(as_json: bool) -> Result<ExitCode> {
    let config = Config::load_or_default().map_err(anyhow::Error::from)?;
    let store = open_store_read_only()?;
    let now = Utc::now().timestamp_millis();

    let daemon_pid = std::fs::read_to_string(paths::lock_file())
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok())
        .filter(|pid| process_alive(*pid));

    let (active, pending, paused, mode, audit_rows) = match &store {
        Some(store) => {
            let mode = store
                .meta_get(META_AUTOPILOT_MODE)?
                .and_then(|v| AutonomyMode::parse(&v))
                .unwrap_or(config.autopilot.mode);
            (
                store.active_sessions()?.len(),
                store.pending_prompts(now)?.len(),
                store.meta_get(META_PAUSED)?.as_deref() == Some("1"),
                mode,
                store.audit_row_count()?,
            )
        }
        None => (0, 0, false, config.autopilot.mode, 0),
    };

    if as_json {
        println!(
            "{}",
            json!({
                "daemon_pid": daemon_pid,
                "channel": config.channel.as_str(),
                "paused": paused,
                "autopilot_mode": mode.as_str(),
                "active_sessions": active,
                "pending_prompts": pending,
                "audit_rows": audit_rows,
            })
        );
    } else {
        match daemon_pid {
            Some(pid) => println!("daemon:          running (pid {pid})"),
            None => println!("daemon:          not running"),
        }
        println!("channel:         {}", config.channel.as_str());
        println!("paused:          {paused}");
        println!("autopilot mode:  {mode}");
        println!("active sessions: {active}");
        println!("pending prompts: {pending}");
        println!("audit rows:      {audit_rows}");
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_sessions(as_json: bool) -> Result<ExitCode> {
    let Some(store) = open_store_read_only()? else {
        if as_json {
            println!("[]");
        } else {
            println!("no sessions yet");
        }
        return Ok(ExitCode::SUCCESS);
    };
    let sessions = store.sessions()?;
    if as_json {
        let rows: Vec<_> = sessions
            .iter()
            .map(|s| {
                json!({
                    "id": s.id,
                    "tool": s.tool,
                    "status": s.status.as_str(),
                    "state": s.conversation_state.as_str(),
                    "started_at": s.started_at,
                    "ended_at": s.ended_at,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else if sessions.is_empty() {
        println!("no sessions yet");
    } else {
        for s in &sessions {
            println!(
                "{}  {:8}  {:14}  {}  {}",
                s.id,
                s.status.as_str(),
                s.conversation_state.as_str(),
                s.tool,
                format_ts(s.started_at),
            );
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn format_ts(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ms.to_string())
}

// ── doctor ──

fn cmd_doctor(fix: bool, as_json: bool) -> Result<ExitCode> {
    let results = doctor::run(fix);
    if as_json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        for result in &results {
            let mark = if result.ok { "ok " } else { "FAIL" };
            let fixed = if result.fixed { " (fixed)" } else { "" };
            println!("[{mark}] {:8} {}{fixed}", result.name, result.detail);
        }
    }
    Ok(if doctor::all_ok(&results) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

// ── audit verify ──

fn cmd_audit_verify(as_json: bool) -> Result<ExitCode> {
    let Some(store) = open_store_read_only()? else {
        if as_json {
            println!("{}", json!({ "intact": true, "checked": 0 }));
        } else {
            println!("no store yet; empty chain is intact");
        }
        return Ok(ExitCode::SUCCESS);
    };
    let verification = audit::verify(&store)?;
    if as_json {
        println!(
            "{}",
            json!({
                "intact": verification.is_intact(),
                "checked": verification.checked,
                "first_break": verification.first_break,
            })
        );
    } else if verification.is_intact() {
        println!("audit chain intact ({} rows)", verification.checked);
    } else {
        println!(
            "audit chain BROKEN at seq {} ({} rows verified)",
            verification.first_break.unwrap_or(-1),
            verification.checked
        );
    }
    Ok(if verification.is_intact() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

// ── pause / resume ──

fn cmd_set_paused(paused: bool) -> Result<ExitCode> {
    let store = std::sync::Arc::new(Store::open(&paths::store_file())?);
    store.meta_set(META_PAUSED, if paused { "1" } else { "0" })?;
    let log = AuditLog::new(std::sync::Arc::clone(&store), Some(&paths::audit_mirror_file()))?;
    log.append(AuditKind::PauseChanged, None, None, json!({ "paused": paused }))?;
    println!(
        "channel replies {}",
        if paused { "paused" } else { "resumed" }
    );
    Ok(ExitCode::SUCCESS)
}

// ── policy ──

fn cmd_policy(command: PolicyCommand, as_json: bool) -> Result<ExitCode> {
    match command {
        PolicyCommand::Validate { file } => {
            let path = match file {
                Some(path) => path,
                None => Config::load_or_default()
                    .map_err(anyhow::Error::from)?
                    .policy
                    .path,
            };
            let policy = Policy::load(&path).map_err(anyhow::Error::from)?;
            if as_json {
                println!(
                    "{}",
                    json!({
                        "valid": true,
                        "path": path.display().to_string(),
                        "policy_version": policy.version,
                        "rules": policy.rules.len(),
                    })
                );
            } else {
                println!(
                    "{} is valid (version {}, {} rules)",
                    path.display(),
                    policy.version,
                    policy.rules.len()
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        PolicyCommand::Test {
            file,
            prompt,
            prompt_type,
            confidence,
            explain,
        } => {
            let policy = Policy::load(&file).map_err(anyhow::Error::from)?;
            let kind = PromptKind::parse(&prompt_type)
                .with_context(|| format!("unknown prompt type '{prompt_type}'"))?;
            let confidence = match confidence {
                ConfidenceArg::Low => Confidence::Low,
                ConfidenceArg::Med => Confidence::Med,
                ConfidenceArg::High => Confidence::High,
            };
            let view = PromptView {
                kind,
                confidence,
                excerpt: &prompt,
                session_tag: None,
            };
            let mut rate = RateState::new();
            let decision = policy.evaluate(&view, &mut rate, "policy-test", std::time::Instant::now());
            if as_json {
                println!(
                    "{}",
                    json!({
                        "action": decision.action.as_str(),
                        "rule_id": decision.rule_id,
                        "reason": decision.reason,
                        "evaluations": decision.evaluations,
                    })
                );
            } else {
                println!("action: {}", decision.action.as_str());
                if let Some(rule) = &decision.rule_id {
                    println!("rule:   {rule}");
                }
                println!("reason: {}", decision.reason);
                if explain {
                    for eval in &decision.evaluations {
                        match (&eval.matched, &eval.failing_criterion) {
                            (true, _) => println!("  {} matched", eval.rule_id),
                            (false, Some(criterion)) => {
                                println!("  {} failed on {criterion}", eval.rule_id);
                            }
                            (false, None) => println!("  {} did not match", eval.rule_id),
                        }
                    }
                }
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

// ── autopilot ──

fn cmd_autopilot(command: AutopilotCommand, as_json: bool) -> Result<ExitCode> {
    match command {
        AutopilotCommand::Enable => {
            let config = Config::load_or_default().map_err(anyhow::Error::from)?;
            let store = Store::open(&paths::store_file())?;
            store.meta_set(META_AUTOPILOT_MODE, config.autopilot.mode.as_str())?;
            println!("autopilot enabled ({})", config.autopilot.mode);
            Ok(ExitCode::SUCCESS)
        }
        AutopilotCommand::Disable => {
            let store = Store::open(&paths::store_file())?;
            store.meta_set(META_AUTOPILOT_MODE, "off")?;
            println!("autopilot disabled; everything escalates to a human");
            Ok(ExitCode::SUCCESS)
        }
        AutopilotCommand::Mode { mode } => {
            let mode = match mode {
                ModeArg::Off => AutonomyMode::Off,
                ModeArg::Assist => AutonomyMode::Assist,
                ModeArg::Full => AutonomyMode::Full,
            };
            let store = Store::open(&paths::store_file())?;
            store.meta_set(META_AUTOPILOT_MODE, mode.as_str())?;
            println!("autopilot mode set to {mode}");
            Ok(ExitCode::SUCCESS)
        }
        AutopilotCommand::Status => {
            let config = Config::load_or_default().map_err(anyhow::Error::from)?;
            let mode = match open_store_read_only()? {
                Some(store) => store
                    .meta_get(META_AUTOPILOT_MODE)?
                    .and_then(|v| AutonomyMode::parse(&v))
                    .unwrap_or(config.autopilot.mode),
                None => config.autopilot.mode,
            };
            if as_json {
                println!("{}", json!({ "mode": mode.as_str() }));
            } else {
                println!("autopilot mode: {mode}");
            }
            Ok(ExitCode::SUCCESS)
        }
        AutopilotCommand::Explain { n } => {
            let entries = trace::tail(&paths::decision_trace_file(), n)?;
            if as_json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else if entries.is_empty() {
                println!("no decisions recorded yet");
            } else {
                for entry in &entries {
                    let rule = entry.rule_id.as_deref().unwrap_or("-");
                    println!(
                        "{}  {:14}  rule={rule}  prompt={}  {}",
                        entry.timestamp, entry.action, entry.prompt_id, entry.reason
                    );
                }
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

// ── db ──

fn cmd_db(command: DbCommand, as_json: bool) -> Result<ExitCode> {
    match command {
        DbCommand::Migrate { dry_run } => {
            let path = paths::store_file();
            let current = if path.exists() {
                Store::open_read_only(&path)?.user_version()?
            } else {
                0
            };
            let pending: Vec<i64> = ((current + 1)..=SCHEMA_VERSION).collect();
            if dry_run {
                if as_json {
                    println!(
                        "{}",
                        json!({ "current": current, "pending": pending, "applied": [] })
                    );
                } else if pending.is_empty() {
                    println!("schema up to date (v{current})");
                } else {
                    println!("would apply migrations: {pending:?}");
                }
                return Ok(ExitCode::SUCCESS);
            }
            // Opening migrates as part of the startup contract.
            let store = Store::open(&path)?;
            let version = store.user_version()?;
            if as_json {
                println!(
                    "{}",
                    json!({ "current": version, "pending": [], "applied": pending })
                );
            } else if pending.is_empty() {
                println!("schema already up to date (v{version})");
            } else {
                println!("migrated to schema v{version} (applied {pending:?})");
            }
            Ok(ExitCode::SUCCESS)
        }
        DbCommand::Archive => {
            let config = Config::load_or_default().map_err(anyhow::Error::from)?;
            let store = Store::open(&paths::store_file())?;
            let archived = audit::archive(
                &store,
                &paths::audit_archive_file(),
                config.audit.max_rows,
            )?;
            info!(archived, "audit archive complete");
            if as_json {
                println!("{}", json!({ "archived": archived }));
            } else if archived == 0 {
                println!("nothing to archive (under {} rows)", config.audit.max_rows);
            } else {
                println!(
                    "archived {archived} audit rows to {}",
                    paths::audit_archive_file().display()
                );
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}
