// ABOUTME: Output formatting for CLI feedback.
// ABOUTME: Supports normal, quiet (scripts), and JSON output modes.

use jumpwire::ssh::CommandResult;
use jumpwire::tunnel::TunnelStats;
use serde::Serialize;

/// Output mode for CLI feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Human-friendly output with progress messages
    Normal,
    /// Minimal output (only results)
    Quiet,
    /// JSON lines for scripting
    Json,
}

/// Handles CLI output based on the configured mode.
pub struct Output {
    mode: OutputMode,
}

impl Output {
    pub fn new(mode: OutputMode) -> Self {
        Self { mode }
    }

    /// Print a progress message (suppressed in quiet/json mode).
    pub fn progress(&self, message: &str) {
        if self.mode == OutputMode::Normal {
            println!("{message}");
        }
    }

    /// Print the outcome of one remote command.
    pub fn command(&self, command: &str, result: &CommandResult) {
        match self.mode {
            OutputMode::Normal => {
                println!(
                    "$ {command}  (exit {}, {:.2}s)",
                    result.exit_code,
                    result.duration.as_secs_f64()
                );
                print!("{}", result.stdout);
                eprint!("{}", result.stderr);
            }
            OutputMode::Quiet => {
                print!("{}", result.stdout);
                eprint!("{}", result.stderr);
            }
            OutputMode::Json => print_json(&CommandEvent {
                event: "command",
                command,
                exit_code: result.exit_code,
                stdout: &result.stdout,
                stderr: &result.stderr,
                duration_secs: result.duration.as_secs_f64(),
            }),
        }
    }

    /// Print a tunnel stats snapshot.
    pub fn tunnel(&self, stats: &TunnelStats) {
        match self.mode {
            OutputMode::Normal | OutputMode::Quiet => {
                let last = stats
                    .last_activity
                    .map(|t| t.format("%H:%M:%S").to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<16} {:<8} {} -> {}  connections={} open={} last={}",
                    stats.id,
                    stats.state,
                    stats.local_addr,
                    stats.remote_addr,
                    stats.connections,
                    stats.open_connections,
                    last
                );
            }
            OutputMode::Json => print_json(&TunnelEvent {
                event: "tunnel",
                stats,
            }),
        }
    }

    /// Print a plain result line.
    pub fn success(&self, message: &str) {
        match self.mode {
            OutputMode::Normal | OutputMode::Quiet => println!("{message}"),
            OutputMode::Json => print_json(&MessageEvent {
                event: "success",
                message,
            }),
        }
    }

    /// Print an error message.
    pub fn error(&self, message: &str) {
        match self.mode {
            OutputMode::Normal | OutputMode::Quiet => {
                eprintln!("Error: {message}");
            }
            OutputMode::Json => {
                if let Ok(json) = serde_json::to_string(&MessageEvent {
                    event: "error",
                    message,
                }) {
                    eprintln!("{json}");
                }
            }
        }
    }
}

fn print_json<T: Serialize>(event: &T) {
    if let Ok(json) = serde_json::to_string(event) {
        println!("{json}");
    }
}

#[derive(Serialize)]
struct MessageEvent<'a> {
    event: &'a str,
    message: &'a str,
}

#[derive(Serialize)]
struct CommandEvent<'a> {
    event: &'a str,
    command: &'a str,
    exit_code: i32,
    stdout: &'a str,
    stderr: &'a str,
    duration_secs: f64,
}

#[derive(Serialize)]
struct TunnelEvent<'a> {
    event: &'a str,
    #[serde(flatten)]
    stats: &'a TunnelStats,
}
