use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    name = "warden",
    about = "Policy-governed human-in-the-loop supervision for interactive CLI agents",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Emit machine-readable JSON output
    #[arg(long, global = true, default_value_t = false)]
    pub json: bool,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Interactive first-run wizard: channel credentials, allowlist, policy
    Setup,

    /// Supervise a tool inside a PTY
    Run {
        /// The program to supervise (e.g. "claude", "codex", "aider")
        tool: String,

        /// Arguments passed through to the tool
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Daemon and store overview
    Status,

    /// List supervised sessions
    Sessions,

    /// Diagnose the local installation
    Doctor {
        /// Apply safe repairs (permissions, stale locks)
        #[arg(long, default_value_t = false)]
        fix: bool,
    },

    /// Audit chain tooling
    Audit {
        #[command(subcommand)]
        command: AuditCommand,
    },

    /// Stop accepting channel replies (kill switch)
    Pause,

    /// Resume accepting channel replies
    Resume,

    /// Policy tooling
    Policy {
        #[command(subcommand)]
        command: PolicyCommand,
    },

    /// Autonomy controls
    Autopilot {
        #[command(subcommand)]
        command: AutopilotCommand,
    },

    /// Store maintenance
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum AuditCommand {
    /// Walk the hash chain and report the first break
    Verify,
}

#[derive(Subcommand, Debug)]
pub enum PolicyCommand {
    /// Validate a policy file (defaults to the configured path)
    Validate {
        file: Option<PathBuf>,
    },
    /// Evaluate a sample prompt against a policy file
    Test {
        file: PathBuf,

        /// Sample prompt excerpt
        #[arg(long)]
        prompt: String,

        /// Prompt kind (yes_no, confirm_enter, numbered_choice, free_text,
        /// password, folder_trust, raw_terminal)
        #[arg(long = "type", value_name = "TYPE", default_value = "yes_no")]
        prompt_type: String,

        /// Confidence to evaluate at
        #[arg(long, value_enum, default_value_t = ConfidenceArg::High)]
        confidence: ConfidenceArg,

        /// Show the per-rule explanation list
        #[arg(long, default_value_t = false)]
        explain: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum AutopilotCommand {
    /// Re-enable automatic execution of policy decisions
    Enable,
    /// Escalate everything to a human
    Disable,
    /// Set the autonomy mode explicitly
    Mode {
        #[arg(value_enum)]
        mode: ModeArg,
    },
    /// Show the effective autonomy mode
    Status,
    /// Show recent policy decisions from the trace
    Explain {
        /// Number of decisions to show
        #[arg(short = 'n', long = "count", default_value_t = 10)]
        n: usize,
    },
}

#[derive(Subcommand, Debug)]
pub enum DbCommand {
    /// Apply pending schema migrations
    Migrate {
        /// Report pending migrations without applying them
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Move audit rows beyond audit.max_rows into the offline archive
    Archive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    Off,
    Assist,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ConfidenceArg {
    Low,
    Med,
    High,
}
