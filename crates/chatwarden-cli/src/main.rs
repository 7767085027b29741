//! `warden` -- Twitch chat moderation bot.
//!
//! Provides the following subcommands:
//!
//! - `warden run` -- Join the configured channel and moderate chat until Ctrl+C.
//! - `warden check` -- Validate the configuration and show what was loaded.
//! - `warden categories` -- Show the violation categories and escalation policy.

use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

mod commands;
mod config_loader;

/// Twitch chat moderation bot.
#[derive(Parser)]
#[command(name = "warden", about = "Twitch chat moderation bot", version)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Config file path (overrides auto-discovery).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Connect to chat and moderate until interrupted.
    Run,

    /// Validate the configuration and print it with secrets redacted.
    Check,

    /// List violation categories and their escalation policy.
    Categories,
}

fn default_filter(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn,chatwarden=info",
        1 => "info",
        _ => "debug",
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter(cli.verbose).into()),
        )
        .init();

    let (config, source) = config_loader::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run => commands::run::run(config).await?,
        Commands::Check => commands::check::run(&config, source.as_deref())?,
        Commands::Categories => commands::categories::run(&config),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_without_error() {
        Cli::command().debug_assert();
    }

    #[test]
    fn cli_help_contains_binary_name() {
        let help = Cli::command().render_help().to_string();
        assert!(help.contains("warden"));
    }

    #[test]
    fn cli_has_all_subcommands() {
        let cmd = Cli::command();
        let names: Vec<&str> = cmd.get_subcommands().map(|s| s.get_name()).collect();
        assert!(names.contains(&"run"));
        assert!(names.contains(&"check"));
        assert!(names.contains(&"categories"));
    }

    #[test]
    fn verbose_counts_and_is_global() {
        let cli = Cli::try_parse_from(["warden", "check", "-vv"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(default_filter(cli.verbose), "debug");
        let cli = Cli::try_parse_from(["warden", "run"]).unwrap();
        assert_eq!(default_filter(cli.verbose), "warn,chatwarden=info");
    }

    #[test]
    fn config_flag_before_subcommand() {
        let cli = Cli::try_parse_from(["warden", "--config", "/tmp/w.yaml", "run"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/w.yaml")));
        assert!(matches!(cli.command, Commands::Run));
    }

    #[test]
    fn missing_subcommand_is_an_error() {
        assert!(Cli::try_parse_from(["warden"]).is_err());
    }
}
