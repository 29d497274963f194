use anyhow::Result;
use baton_scheduler::{EndReason, ExecutionHistoryRecord, QueueState};
use chrono::{DateTime, Utc};
use crossterm::{
    execute,
    style::{Color, Print, ResetColor, SetForegroundColor},
};
use std::io::{self, Write};
use std::time::Duration;

/// Color scheme for terminal output.
struct Colors;

impl Colors {
    const HOLDER: Color = Color::Green;
    const WAITING: Color = Color::Yellow;
    const ERROR: Color = Color::Red;
    const DIM: Color = Color::DarkGrey;
    const HEADER: Color = Color::Magenta;
}

/// Human-readable rendering of scheduler state.
pub struct Terminal;

impl Terminal {
    pub fn new() -> Self {
        Self
    }

    /// Print the active holder and the waiting queue.
    pub fn print_status(&self, state: &QueueState, now: DateTime<Utc>) -> Result<()> {
        let mut stdout = io::stdout();
        execute!(
            stdout,
            SetForegroundColor(Colors::HEADER),
            Print("Execution lock\n"),
            ResetColor,
        )?;
        match &state.active {
            Some(lock) => {
                let limit = lock
                    .max_duration()
                    .map(|d| format!(", limit {}", format_duration(d)))
                    .unwrap_or_default();
                execute!(
                    stdout,
                    SetForegroundColor(Colors::HOLDER),
                    Print(format!("  {}", lock.holder_id)),
                    ResetColor,
                    SetForegroundColor(Colors::DIM),
                    Print(format!(
                        "  requester {}, held {}{}\n",
                        lock.requester_id,
                        format_duration(lock.age(now)),
                        limit
                    )),
                    ResetColor,
                )?;
            }
            None => {
                execute!(
                    stdout,
                    SetForegroundColor(Colors::DIM),
                    Print("  (free)\n"),
                    ResetColor,
                )?;
            }
        }

        execute!(
            stdout,
            SetForegroundColor(Colors::HEADER),
            Print(format!("Queue ({} waiting)\n", state.queued.len())),
            ResetColor,
        )?;
        for (i, entry) in state.queued.iter().enumerate() {
            let waited = (now - entry.enqueued_at).to_std().unwrap_or_default();
            execute!(
                stdout,
                SetForegroundColor(Colors::WAITING),
                Print(format!("  {:>3}. {}", i + 1, entry.holder_id)),
                ResetColor,
                SetForegroundColor(Colors::DIM),
                Print(format!(
                    "  requester {}, waiting {}\n",
                    entry.requester_id,
                    format_duration(waited)
                )),
                ResetColor,
            )?;
        }
        if !state.queued.is_empty() {
            execute!(
                stdout,
                SetForegroundColor(Colors::DIM),
                Print(format!(
                    "Estimated wait for a new request: {}\n",
                    format_duration(Duration::from_secs(state.estimated_wait_secs))
                )),
                ResetColor,
            )?;
        }

        stdout.flush()?;
        Ok(())
    }

    /// Print finished executions as a table.
    pub fn print_history(&self, records: &[ExecutionHistoryRecord]) -> Result<()> {
        let mut stdout = io::stdout();

        if records.is_empty() {
            execute!(
                stdout,
                SetForegroundColor(Colors::DIM),
                Print("No finished executions.\n"),
                ResetColor,
            )?;
            return Ok(());
        }

        execute!(
            stdout,
            SetForegroundColor(Colors::HEADER),
            Print(format!(
                "{:<24} {:<32} {:<10} {:>10}\n",
                "ENDED", "CONVERSATION", "REASON", "DURATION"
            )),
            ResetColor,
        )?;
        for r in records {
            let color = match r.end_reason {
                EndReason::Completed => Colors::HOLDER,
                EndReason::Forced | EndReason::Timeout => Colors::WAITING,
                EndReason::Error => Colors::ERROR,
            };
            execute!(
                stdout,
                Print(format!(
                    "{:<24} {:<32} ",
                    r.ended_at.format("%Y-%m-%d %H:%M:%S"),
                    truncate(&r.holder_id, 32)
                )),
                SetForegroundColor(color),
                Print(format!("{:<10}", r.end_reason.to_string())),
                ResetColor,
                Print(format!(" {:>10}\n", format_duration(r.duration()))),
            )?;
        }

        stdout.flush()?;
        Ok(())
    }

    /// Print an error message.
    pub fn print_error(&self, msg: &str) -> Result<()> {
        let mut stdout = io::stdout();
        execute!(
            stdout,
            SetForegroundColor(Colors::ERROR),
            Print(format!("Error: {}\n", msg)),
            ResetColor,
        )?;
        stdout.flush()?;
        Ok(())
    }

    /// Print an info message.
    pub fn print_info(&self, msg: &str) -> Result<()> {
        let mut stdout = io::stdout();
        execute!(
            stdout,
            SetForegroundColor(Colors::DIM),
            Print(format!("{}\n", msg)),
            ResetColor,
        )?;
        stdout.flush()?;
        Ok(())
    }
}

/// Compact duration: `42s`, `3m05s`, `1h02m`.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let head: String = s.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", head)
}
