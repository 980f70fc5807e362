mod cli;
mod commands;
mod error;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use guidelight_config::Config;

use crate::cli::{Cli, Command, GlobalOpts};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_tracing(cli.global.verbose, cli.global.log_json);

    if let Err(err) = run(cli).await {
        let code = err.exit_code();
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(code);
    }
}

fn init_tracing(verbosity: u8, json: bool) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        // Config commands don't need a backend
        Command::Config(args) => commands::config_cmd::handle(&args, &cli.global),

        Command::Status(args) => {
            let config = load_config(&cli.global)?;
            commands::status::handle(&args, &config).await
        }

        Command::Watch(args) => {
            let config = load_config(&cli.global)?;
            commands::watch::handle(args, &config).await
        }
    }
}

/// Load file + env configuration, then apply CLI overrides.
pub(crate) fn load_config(global: &GlobalOpts) -> Result<Config, CliError> {
    let mut config = match global.config {
        Some(ref path) => guidelight_config::load_config_from(path)?,
        None => guidelight_config::load_config()?,
    };
    if let Some(ref server) = global.server {
        config.server.http_url = Some(server.clone());
    }
    if global.insecure {
        config.server.insecure = true;
    }
    tracing::debug!(server = ?config.server.http_url, "configuration loaded");
    Ok(config)
}
