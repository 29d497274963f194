use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

/// Operator console for a project's execution scheduler.
///
/// Every command opens the persisted scheduler state for the project,
/// runs startup recovery (stale locks, promotion of a waiting queue) and
/// flushes any configured status publisher before exiting.
#[derive(Parser, Debug)]
#[command(name = "baton", version, about = "Inspect and administer the execution queue")]
pub struct CliArgs {
    /// Path to a baton.toml (default: <project>/baton.toml if present, else env only)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Project directory the scheduler state belongs to (overrides config)
    #[arg(long, global = true, env = "BATON_PROJECT_PATH")]
    pub project: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show the current holder and the waiting queue
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Show recently finished executions, newest last
    History {
        /// Only show the last N records
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    /// Force-release a conversation's execution lock
    Release {
        conversation: String,
        #[arg(long, default_value = "released by operator")]
        reason: String,
    },
    /// Clear the queue and force-release the current holder
    ReleaseAll {
        #[arg(long, default_value = "released by operator")]
        reason: String,
    },
    /// Remove a waiting conversation from the queue
    Dequeue { conversation: String },
    /// Remove every waiting conversation from the queue
    Clear,
}

impl CliArgs {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub fn default_log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_global_flags_after_subcommand() {
        let args = CliArgs::parse_from(["baton", "status", "--json", "-vv", "--project", "/tmp/p"]);
        assert_eq!(args.verbose, 2);
        assert_eq!(args.default_log_filter(), "debug");
        assert_eq!(args.project, Some(PathBuf::from("/tmp/p")));
        assert!(matches!(args.command, Command::Status { json: true }));
    }

    #[test]
    fn release_has_default_reason() {
        let args = CliArgs::parse_from(["baton", "release", "conv-1"]);
        match args.command {
            Command::Release { conversation, reason } => {
                assert_eq!(conversation, "conv-1");
                assert_eq!(reason, "released by operator");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn history_limit() {
        let args = CliArgs::parse_from(["baton", "history", "--limit", "5"]);
        assert!(matches!(args.command, Command::History { limit: Some(5), json: false }));
    }
}
