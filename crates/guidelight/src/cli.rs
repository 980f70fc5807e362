//! Clap derive structures for the `guidelight` binary.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// guidelight -- headless emergency state monitor
#[derive(Debug, Parser)]
#[command(
    name = "guidelight",
    version,
    about = "Follow emergency zone state and sound the alarm",
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
    /// Backend URL (overrides server.http_url)
    #[arg(long, short = 's', env = "GUIDELIGHT_SERVER", global = true)]
    pub server: Option<String>,

    /// Config file to read instead of the platform default
    #[arg(long, env = "GUIDELIGHT_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Accept self-signed TLS certificates
    #[arg(long, short = 'k', global = true)]
    pub insecure: bool,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,
}

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text
    #[default]
    Text,
    /// Pretty-printed JSON
    Json,
}

// ── Commands ─────────────────────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Stream connection, zone and alarm transitions until Ctrl-C
    Watch(WatchArgs),

    /// Read the emergency state once over HTTP
    Status(StatusArgs),

    /// Inspect configuration
    Config(ConfigArgs),
}

#[derive(Debug, Args)]
pub struct WatchArgs {
    /// Device group whose command statuses are tracked
    #[arg(long)]
    pub scope: Option<String>,

    /// Run without an alarm sample; the alarm stays logical only
    #[arg(long)]
    pub mute: bool,
}

#[derive(Debug, Args)]
pub struct StatusArgs {
    #[arg(long, short = 'o', value_enum, default_value_t = OutputFormat::Text)]
    pub output: OutputFormat,
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the config file location
    Path,
    /// Print the effective configuration (secrets omitted)
    Show,
}
