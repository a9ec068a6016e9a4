//! CLI commands implementation.
//!
//! This module contains the CLI parser and dispatches to command-specific modules.

mod config_cmd;
mod fetch;
mod poll;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use oddsgate::config::{load_settings, LoadOptions};
use oddsgate::JobKind;

#[derive(Parser)]
#[command(name = "oddsgate")]
#[command(about = "Rate-limited, retrying fetches from odds and casino feeds")]
#[command(version)]
pub struct Cli {
    /// Config file path (overrides auto-discovery)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch one resource directly (no queue)
    Fetch {
        /// Resource kind: cricket_odds, cricket_scorecard, casino_data, casino_results, casino_tv
        kind: JobKind,
        /// Event id, game type or stream id
        id: String,
    },

    /// Poll resources through the job queue
    Poll {
        /// Resource kind
        kind: JobKind,
        /// Ids to poll (one job per id per round)
        #[arg(required = true)]
        ids: Vec<String>,
        /// Seconds between rounds
        #[arg(short, long, default_value = "5")]
        interval: u64,
        /// Number of rounds
        #[arg(short, long, default_value = "1")]
        rounds: u32,
        /// Job priority (lower runs first)
        #[arg(short, long)]
        priority: Option<i32>,
    },

    /// Show effective configuration
    Config,
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let options = LoadOptions {
        config_path: cli.config,
        ignore_env: false,
    };
    let (settings, _config) = load_settings(&options).await?;

    match cli.command {
        Commands::Fetch { kind, id } => fetch::cmd_fetch(settings, kind, &id, cli.json).await,
        Commands::Poll {
            kind,
            ids,
            interval,
            rounds,
            priority,
        } => {
            poll::cmd_poll(
                settings,
                poll::PollOptions {
                    kind,
                    ids,
                    interval: std::time::Duration::from_secs(interval),
                    rounds: rounds.max(1),
                    priority,
                },
                cli.json,
            )
            .await
        }
        Commands::Config => config_cmd::cmd_config_show(&settings, cli.json),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_poll() {
        let cli = Cli::try_parse_from([
            "oddsgate",
            "poll",
            "cricket-odds",
            "1.1",
            "1.2",
            "--rounds",
            "3",
            "--json",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Poll {
                kind, ids, rounds, ..
            } => {
                assert_eq!(kind, JobKind::CricketOdds);
                assert_eq!(ids, vec!["1.1", "1.2"]);
                assert_eq!(rounds, 3);
            }
            _ => panic!("expected poll"),
        }
    }

    #[test]
    fn test_rejects_unknown_kind() {
        assert!(Cli::try_parse_from(["oddsgate", "fetch", "football", "1"]).is_err());
    }
}
