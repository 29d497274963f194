mod cli;
mod terminal;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use baton_core::Config;
use baton_scheduler::{
    ExecutionScheduler, LogStatusPublisher, StatusPublisher, WebhookStatusPublisher,
};
use chrono::Utc;
use clap::Parser;
use tracing::{debug, info};

use crate::cli::{CliArgs, Command};
use crate::terminal::Terminal;

const CONFIG_FILE: &str = "baton.toml";
const OPERATOR: &str = "baton-cli";

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(args.default_log_filter())),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    baton_core::load_dotenv();
    let config = load_config(&args).context("failed to load configuration")?;
    config.log_summary();

    let publisher: Arc<dyn StatusPublisher> = if config.publisher.is_configured() {
        let webhook = WebhookStatusPublisher::from_config(&config.publisher)
            .context("invalid status webhook configuration")?
            .context("status webhook URL missing")?;
        Arc::new(webhook)
    } else {
        Arc::new(LogStatusPublisher)
    };
    info!(publisher = publisher.name(), "status publisher selected");

    let scheduler = ExecutionScheduler::builder(config.scheduler.clone())
        .project_path(config.project.path.clone())
        .publisher(publisher)
        .operator(OPERATOR)
        .build()
        .await;

    let result = run(&scheduler, args.command).await;
    scheduler.shutdown().await;
    if let Err(e) = result {
        Terminal::new().print_error(&format!("{:#}", e))?;
        std::process::exit(1);
    }
    Ok(())
}

/// Resolve configuration: explicit `--config`, else `<project>/baton.toml`
/// when present, else environment only. `--project` always wins.
fn load_config(args: &CliArgs) -> Result<Config> {
    let project = match &args.project {
        Some(path) => Some(path.clone()),
        None => std::env::current_dir().ok(),
    };

    let file = args.config.clone().or_else(|| {
        project
            .as_deref()
            .map(|p| p.join(CONFIG_FILE))
            .filter(|p| p.is_file())
    });

    let mut config = match file {
        Some(path) => {
            debug!(path = %path.display(), "loading config file");
            Config::from_file(&path)
                .with_context(|| format!("failed to read {}", path.display()))?
        }
        None => Config::from_env()?,
    };

    if let Some(path) = &args.project {
        config.project.path = path.clone();
    }
    Ok(config)
}

async fn run(scheduler: &ExecutionScheduler, command: Command) -> Result<()> {
    let terminal = Terminal::new();

    match command {
        Command::Status { json } => {
            let state = scheduler.get_execution_queue_state().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&state)?);
            } else {
                terminal.print_status(&state, Utc::now())?;
            }
        }
        Command::History { limit, json } => {
            let mut records = scheduler.history().await;
            if let Some(limit) = limit {
                let skip = records.len().saturating_sub(limit);
                records.drain(..skip);
            }
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                terminal.print_history(&records)?;
            }
        }
        Command::Release {
            conversation,
            reason,
        } => {
            if scheduler.force_release(&conversation, &reason).await {
                terminal.print_info(&format!("Released {}", conversation))?;
                report_next_holder(scheduler, &terminal).await?;
            } else {
                bail!("{} does not hold the execution lock", conversation);
            }
        }
        Command::ReleaseAll { reason } => {
            let cleared = scheduler.clear_queue().await;
            match scheduler.force_release_any(&reason).await {
                Some(holder) => terminal.print_info(&format!(
                    "Released {} and removed {} queued conversation(s)",
                    holder, cleared
                ))?,
                None => terminal.print_info(&format!(
                    "No active holder; removed {} queued conversation(s)",
                    cleared
                ))?,
            }
        }
        Command::Dequeue { conversation } => {
            if scheduler.remove_from_queue(&conversation).await {
                terminal.print_info(&format!("Removed {} from the queue", conversation))?;
            } else {
                bail!("{} is not queued", conversation);
            }
        }
        Command::Clear => {
            let cleared = scheduler.clear_queue().await;
            terminal.print_info(&format!("Removed {} queued conversation(s)", cleared))?;
        }
    }
    Ok(())
}

async fn report_next_holder(scheduler: &ExecutionScheduler, terminal: &Terminal) -> Result<()> {
    match scheduler.current_holder().await {
        Some(lock) => terminal.print_info(&format!("Lock passed to {}", lock.holder_id)),
        None => terminal.print_info("Lock is now free"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use baton_core::SchedulerConfig;

    async fn scheduler() -> ExecutionScheduler {
        ExecutionScheduler::builder(SchedulerConfig::in_memory())
            .build()
            .await
    }

    #[tokio::test]
    async fn release_of_non_holder_fails() {
        let scheduler = scheduler().await;
        scheduler.request_execution("conv-1", "a").await.unwrap();
        let err = run(
            &scheduler,
            Command::Release {
                conversation: "conv-2".into(),
                reason: "test".into(),
            },
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("conv-2"));
        assert!(scheduler.is_holding("conv-1").await);
    }

    #[tokio::test]
    async fn dequeue_of_unknown_conversation_fails() {
        let scheduler = scheduler().await;
        let result = run(
            &scheduler,
            Command::Dequeue {
                conversation: "conv-9".into(),
            },
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn successful_commands_return_ok() {
        let scheduler = scheduler().await;
        scheduler.request_execution("conv-1", "a").await.unwrap();
        scheduler.request_execution("conv-2", "b").await.unwrap();
        run(
            &scheduler,
            Command::Dequeue {
                conversation: "conv-2".into(),
            },
        )
        .await
        .unwrap();
        run(
            &scheduler,
            Command::Release {
                conversation: "conv-1".into(),
                reason: "test".into(),
            },
        )
        .await
        .unwrap();
        assert!(scheduler.current_holder().await.is_none());
    }
}
