// ABOUTME: Entry point for the jumpwire CLI application.
// ABOUTME: Parses arguments and dispatches to appropriate command handlers.

mod cli;
mod output;

use clap::Parser;
use cli::{Cli, Commands};
use jumpwire::cache::ServerConnectionCache;
use jumpwire::config::Config;
use jumpwire::error::{Error, Result};
use jumpwire::ssh;
use jumpwire::tunnel::TunnelRegistry;
use output::{Output, OutputMode};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing subscriber based on verbose flag
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let mode = if cli.json {
        OutputMode::Json
    } else if cli.quiet {
        OutputMode::Quiet
    } else {
        OutputMode::Normal
    };
    let output = Output::new(mode);

    match run(cli, &output).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            output.error(&e.to_string());
            std::process::exit(1);
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    match &cli.config {
        Some(path) => Config::load(path),
        None => Config::discover(&env::current_dir()?),
    }
}

async fn run(cli: Cli, output: &Output) -> Result<i32> {
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Exec { server, commands } => exec(&config, &server, &commands, output).await,
        Commands::Exists { server, path } => exists(&config, &server, &path, output).await,
        Commands::Tunnels { interval } => tunnels(&config, interval, output).await,
    }
}

/// Run a command batch on one server. Returns the failing exit code.
async fn exec(config: &Config, server: &str, commands: &[String], output: &Output) -> Result<i32> {
    let server = config.server(server)?;
    let cache = ServerConnectionCache::new(Arc::new(TunnelRegistry::new()), config.ports);

    output.progress(&format!("Connecting to {}...", server.id));
    let session = cache.get_session(server).await?;

    let outcome = session.exec_all(commands).await;
    let code = match outcome {
        Ok(results) => {
            for (command, result) in commands.iter().zip(&results) {
                output.command(command, result);
            }
            0
        }
        Err(batch) => {
            for (command, result) in commands.iter().zip(&batch.results) {
                output.command(command, result);
            }
            match batch.source {
                ssh::Error::NonZeroExit { exit_code, .. } => exit_code.clamp(1, 255),
                _ => {
                    close_quietly(&cache).await;
                    return Err(batch.into());
                }
            }
        }
    };

    close_quietly(&cache).await;
    Ok(code)
}

async fn exists(config: &Config, server: &str, path: &str, output: &Output) -> Result<i32> {
    let server = config.server(server)?;
    let cache = ServerConnectionCache::new(Arc::new(TunnelRegistry::new()), config.ports);

    let session = cache.get_session(server).await?;
    let found = session.file_exists(path).await;
    close_quietly(&cache).await;

    if found? {
        output.success(&format!("{path} exists on {}", server.id));
        Ok(0)
    } else {
        output.success(&format!("{path} does not exist on {}", server.id));
        Ok(1)
    }
}

/// Start every configured tunnel and report stats until Ctrl-C.
async fn tunnels(config: &Config, interval: Duration, output: &Output) -> Result<i32> {
    if config.tunnels.is_empty() {
        return Err(Error::InvalidConfig("no tunnels configured".to_string()));
    }

    let registry = TunnelRegistry::new();
    for entry in &config.tunnels {
        let started = registry
            .create_tunnel(
                entry.id.clone(),
                entry.via.session_config(),
                entry.tunnel_config(),
            )
            .await;
        match started {
            Ok(tunnel) => output.progress(&format!(
                "Tunnel {} listening on {}",
                entry.id,
                tunnel.stats().local_addr
            )),
            Err(e) => {
                if let Err(stop_err) = registry.stop_all().await {
                    tracing::warn!("Failed to stop tunnels: {}", stop_err);
                }
                return Err(e.into());
            }
        }
    }

    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                for stats in registry.list().await.values() {
                    output.tunnel(stats);
                }
            }
        }
    }

    output.progress("Stopping tunnels...");
    for stats in registry.list().await.values() {
        output.tunnel(stats);
    }
    registry.stop_all().await?;
    Ok(0)
}

async fn close_quietly(cache: &ServerConnectionCache) {
    if let Err(e) = cache.close_all().await {
        tracing::warn!("Failed to close connections: {}", e);
    }
}
