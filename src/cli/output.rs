// Terminal rendering of status tables and supervisor events

use crate::config::ProcessSpec;
use crate::process::ProcessState;
use crate::supervisor::{StatusSnapshot, SupervisorEvent};
use chrono::{Local, Utc};
use colored::*;
use std::time::Duration;
use tabled::{
    settings::{object::Rows, Alignment, Modify, Style},
    Table, Tabled,
};

/// Print a formatted table of every supervised instance
pub fn print_status_table(snapshot: &StatusSnapshot) {
    #[derive(Tabled)]
    struct StatusRow {
        #[tabled(rename = "ID")]
        id: String,
        #[tabled(rename = "State")]
        state: String,
        #[tabled(rename = "PID")]
        pid: String,
        #[tabled(rename = "Memory")]
        memory: String,
        #[tabled(rename = "Uptime")]
        uptime: String,
        #[tabled(rename = "Restarts")]
        restarts: String,
        #[tabled(rename = "Last Exit")]
        last_exit: String,
    }

    if snapshot.processes.is_empty() {
        println!("{}", "No processes are configured".yellow());
        return;
    }

    let now = Utc::now();
    let rows: Vec<StatusRow> = snapshot
        .processes
        .iter()
        .map(|p| StatusRow {
            id: truncate(&p.id, 24),
            state: format_state_colored(p.state),
            pid: p
                .pid
                .map(|pid| pid.to_string())
                .unwrap_or_else(|| "-".to_string()),
            memory: p
                .memory_bytes
                .map(format_memory)
                .unwrap_or_else(|| "-".to_string()),
            uptime: p
                .uptime(now)
                .map(|d| format_duration(&d))
                .unwrap_or_else(|| "-".to_string()),
            restarts: match p.consecutive_failures {
                0 => p.restarts.to_string(),
                failures => format!("{} ({} failing)", p.restarts, failures),
            },
            last_exit: p
                .last_exit
                .as_ref()
                .map(|e| truncate(&e.to_string(), 32))
                .unwrap_or_else(|| "-".to_string()),
        })
        .collect();

    let mut table = Table::new(rows);
    table
        .with(Style::rounded())
        .with(Modify::new(Rows::first()).with(Alignment::center()));

    println!("\n{}\n", table);
    println!(
        "{}",
        format!("Total: {} process(es)", snapshot.processes.len())
            .dimmed()
            .italic()
    );
}

/// Print the validated specs of a configuration file
pub fn print_spec_table(specs: &[ProcessSpec]) {
    #[derive(Tabled)]
    struct SpecRow {
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "Command")]
        command: String,
        #[tabled(rename = "Instances")]
        instances: usize,
        #[tabled(rename = "Autorestart")]
        autorestart: String,
        #[tabled(rename = "Restarts / Window")]
        budget: String,
        #[tabled(rename = "Memory Limit")]
        memory: String,
    }

    let rows: Vec<SpecRow> = specs
        .iter()
        .map(|spec| {
            let command = std::iter::once(spec.executable.display().to_string())
                .chain(spec.args.iter().cloned())
                .collect::<Vec<_>>()
                .join(" ");
            SpecRow {
                name: spec.name.cyan().to_string(),
                command: truncate(&command, 40),
                instances: spec.instances,
                autorestart: if spec.autorestart {
                    "yes".green().to_string()
                } else {
                    "no".bright_black().to_string()
                },
                budget: format!(
                    "{} / {}",
                    spec.max_restarts,
                    format_duration(&spec.restart_window)
                ),
                memory: spec
                    .max_memory_bytes
                    .map(format_memory)
                    .unwrap_or_else(|| "-".to_string()),
            }
        })
        .collect();

    let mut table = Table::new(rows);
    table
        .with(Style::rounded())
        .with(Modify::new(Rows::first()).with(Alignment::center()));

    println!("\n{}\n", table);
}

/// Print one operational event as a timestamped line
pub fn print_event(event: &SupervisorEvent) {
    let timestamp = format!("[{}]", Local::now().format("%H:%M:%S")).dimmed();

    let message = match event {
        SupervisorEvent::Started { id, pid, .. } => {
            format!("{} started (PID: {})", id.cyan(), pid)
        }
        SupervisorEvent::Running { id } => format!("{} is running", id.cyan()).green().to_string(),
        SupervisorEvent::SpawnFailed { id, reason } => {
            format!("{} failed to start: {}", id, reason).red().to_string()
        }
        SupervisorEvent::Exited {
            id, info, uptime, ..
        } => format!(
            "{} exited ({}) after {}",
            id.cyan(),
            info,
            format_duration(uptime)
        ),
        SupervisorEvent::RestartScheduled { id, delay, .. } => format!(
            "{} restarting in {}",
            id.cyan(),
            format_duration(delay)
        )
        .yellow()
        .to_string(),
        SupervisorEvent::NotRestarted { id, reason } => {
            format!("{} not restarted ({})", id.cyan(), reason)
        }
        SupervisorEvent::FatallyFailed { id } => format!(
            "{} exceeded its restart limit and will not be restarted",
            id
        )
        .red()
        .bold()
        .to_string(),
        SupervisorEvent::ResourceViolation {
            id,
            observed_bytes,
            limit_bytes,
        } => format!(
            "{} uses {} (limit {}), restarting",
            id,
            format_memory(*observed_bytes),
            format_memory(*limit_bytes)
        )
        .yellow()
        .to_string(),
        SupervisorEvent::ForceKilled { id } => {
            format!("{} did not stop in time and was killed", id)
                .red()
                .to_string()
        }
        SupervisorEvent::ShutdownComplete => "All processes stopped".green().bold().to_string(),
    };

    println!("{} {}", timestamp, message);
}

/// Print an error message to stderr
pub fn print_error(error: &str) {
    eprintln!("{} {}", "✗ Error:".red().bold(), error);
}

/// Print a success message
pub fn print_success_msg(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Format a process state with color coding
fn format_state_colored(state: ProcessState) -> String {
    match state {
        ProcessState::Running => state.to_string().green().to_string(),
        ProcessState::Starting | ProcessState::Stopping => state.to_string().yellow().to_string(),
        ProcessState::Stopped => state.to_string().bright_black().to_string(),
        ProcessState::Crashed => state.to_string().red().to_string(),
        ProcessState::FatallyFailed => state.to_string().red().bold().to_string(),
    }
}

/// Format a duration with its two most significant units ("1m 30s", "2h 5m")
fn format_duration(duration: &Duration) -> String {
    const UNITS: [(u64, &str); 4] = [(86400, "d"), (3600, "h"), (60, "m"), (1, "s")];

    let secs = duration.as_secs();
    if secs == 0 {
        return match duration.as_millis() {
            0 => "0s".to_string(),
            ms => format!("{}ms", ms),
        };
    }

    let parts: Vec<String> = UNITS
        .iter()
        .scan(secs, |rest, &(size, suffix)| {
            let count = *rest / size;
            *rest %= size;
            Some((count, suffix))
        })
        .skip_while(|(count, _)| *count == 0)
        .take(2)
        .filter(|(count, _)| *count > 0)
        .map(|(count, suffix)| format!("{}{}", count, suffix))
        .collect();

    parts.join(" ")
}

/// Format memory usage in human-readable format
fn format_memory(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    match bytes {
        b if b < KB => format!("{}B", b),
        b if b < MB => format!("{:.1}KB", b as f64 / KB as f64),
        b if b < GB => format!("{:.1}MB", b as f64 / MB as f64),
        b => format!("{:.2}GB", b as f64 / GB as f64),
    }
}

/// Truncate to at most `max_len` characters
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
