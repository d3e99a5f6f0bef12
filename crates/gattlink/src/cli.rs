//! Clap derive structures for the `gattlink` CLI.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

use gattlink_core::{ConnectFailureKind, SimBehavior};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// gattlink -- drive and watch BLE-style device connections
#[derive(Debug, Parser)]
#[command(
    name = "gattlink",
    version,
    about = "Connect to BLE-style devices and watch their connection lifecycle",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Config file (defaults to the platform config directory)
    #[arg(long, env = "GATTLINK_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Connection profile to use
    #[arg(long, short = 'p', env = "GATTLINK_PROFILE", global = true)]
    pub profile: Option<String>,

    /// Output format
    #[arg(
        long,
        short = 'o',
        env = "GATTLINK_OUTPUT",
        default_value = "text",
        global = true
    )]
    pub output: OutputFormat,

    /// When to use color output
    #[arg(long, default_value = "auto", global = true)]
    pub color: ColorMode,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable lines (default)
    Text,
    /// One JSON object per line
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ColorMode {
    /// Auto-detect (color if terminal is interactive)
    Auto,
    /// Always emit color codes
    Always,
    /// Never emit color codes
    Never,
}

// ── Commands ─────────────────────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Connect to devices and print their connection events
    #[command(alias = "w")]
    Watch(WatchArgs),

    /// Manage the configuration file
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

// ── watch ────────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct WatchArgs {
    /// Device aliases from the config file, or MAC addresses
    #[arg(required = true, num_args = 1..)]
    pub devices: Vec<String>,

    /// Simulated radio behavior applied to every device
    #[arg(long, default_value = "healthy")]
    pub sim: SimMode,

    /// Simulated latency of each scan/open/discover step, in milliseconds
    #[arg(long, default_value = "100")]
    pub latency_ms: u64,

    /// Stop after this many seconds (default: run until Ctrl-C)
    #[arg(long, short = 'd')]
    pub duration: Option<u64>,

    /// Reconnect automatically after a failure or link loss
    #[arg(long)]
    pub auto_reconnect: bool,

    /// Delay between link establishment and service discovery (ms)
    #[arg(long, allow_hyphen_values = true)]
    pub discover_delay_ms: Option<i64>,

    /// Budget for scanning plus connecting (ms)
    #[arg(long, allow_hyphen_values = true)]
    pub connect_timeout_ms: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SimMode {
    /// Every step succeeds
    Healthy,
    /// The device never shows up in a scan
    NeverFound,
    /// The device rejects the connection
    Reject,
    /// Connecting never completes
    HangOpen,
    /// Service discovery never completes
    HangDiscovery,
    /// Discovery finds no services
    NoServices,
    /// The first two connection attempts are rejected
    Flaky,
}

impl SimMode {
    pub fn behavior(self, latency: Duration) -> SimBehavior {
        match self {
            Self::Healthy => SimBehavior::Healthy {
                latency,
                services: 3,
            },
            Self::NeverFound => SimBehavior::NeverFound,
            Self::Reject => SimBehavior::RejectOpen(ConnectFailureKind::TransportRejected),
            Self::HangOpen => SimBehavior::HangOnOpen,
            Self::HangDiscovery => SimBehavior::HangOnDiscovery,
            Self::NoServices => SimBehavior::Healthy {
                latency,
                services: 0,
            },
            Self::Flaky => SimBehavior::Flaky {
                failures: 2,
                latency,
            },
        }
    }
}

// ── config ───────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the config file path
    Path,

    /// Print the effective configuration as TOML
    Show,

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

// ── completions ──────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    pub shell: clap_complete::Shell,
}
