//! LinkTerm
//!
//! Remote shell over a WebSocket: `linkterm server` shares a shell,
//! `linkterm client` connects a terminal to it.

use std::path::PathBuf;

use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand};
use linkterm::client::{DialOptions, TerminalController};
use linkterm::config::Config;
use linkterm::logging;
use linkterm::server::Server;
use tokio::signal::unix::{signal, SignalKind};

/// LinkTerm - remote shell over a WebSocket.
#[derive(Parser, Debug)]
#[command(name = "linkterm")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable debug logging (-dd for trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub debug: u8,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Share a shell with WebSocket clients
    Server {
        /// Address to bind to (default: localhost)
        #[arg(short = 'H', long)]
        host: Option<String>,

        /// Port to listen on (default: 8080)
        #[arg(short = 'P', long)]
        port: Option<u16>,

        /// Shell to run (default: $SHELL, then bash, zsh, sh)
        #[arg(short, long)]
        shell: Option<String>,

        /// Argument passed to the shell, repeatable
        #[arg(long = "shell-arg", value_name = "ARG", allow_hyphen_values = true)]
        shell_args: Vec<String>,

        /// Milliseconds a shell gets to exit after SIGTERM before SIGKILL
        #[arg(long, value_name = "MS")]
        grace_period_ms: Option<u64>,
    },

    /// Connect this terminal to a server
    Client {
        /// Server address: host[:port], http(s)://, or ws(s):// URL
        #[arg(short, long)]
        url: Option<String>,

        /// Proxy to dial through: socks5://[user:pass@]host:port or http://...
        #[arg(short = 'x', long)]
        proxy: Option<String>,

        /// Seconds allowed for connecting and the WebSocket handshake
        #[arg(long, value_name = "SECS")]
        handshake_timeout: Option<u64>,
    },
}

impl Commands {
    /// Layer command-line values over the loaded configuration.
    fn apply(&self, config: &mut Config) {
        match self {
            Commands::Server {
                host,
                port,
                shell,
                shell_args,
                grace_period_ms,
            } => {
                if let Some(host) = host {
                    config.server.host = host.clone();
                }
                if let Some(port) = port {
                    config.server.port = *port;
                }
                if let Some(shell) = shell {
                    config.server.shell = Some(shell.clone());
                }
                if !shell_args.is_empty() {
                    config.server.shell_args = shell_args.clone();
                }
                if let Some(grace) = grace_period_ms {
                    config.server.grace_period_ms = *grace;
                }
            }
            Commands::Client {
                url,
                proxy,
                handshake_timeout,
            } => {
                if let Some(url) = url {
                    config.client.url = url.clone();
                }
                if let Some(proxy) = proxy {
                    config.client.proxy = Some(proxy.clone());
                }
                if let Some(timeout) = handshake_timeout {
                    config.client.handshake_timeout_secs = *timeout;
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    let env_overrides = config.apply_env_overrides();
    cli.command.apply(&mut config);

    // Initialize tracing
    let level = logging::effective_level(&config.logging.level, cli.debug);
    let log_guard = logging::init(&level, config.logging.file.as_deref())?;

    for (variable, value) in &env_overrides {
        tracing::info!("Overriding from environment: {}={}", variable, value);
    }

    if let Some(path) = &cli.config {
        tracing::debug!("Using config file: {:?}", path);
    }
    config.validate().context("Invalid configuration")?;

    match cli.command {
        Commands::Server { .. } => run_server(&config).await,
        Commands::Client { .. } => {
            let options = DialOptions::from_config(&config.client)?;
            let reason = TerminalController::new(options)
                .connect(&config.client.url)
                .await?;
            tracing::debug!(reason = %reason, "Session finished");

            // The stdin reader thread is blocked in read(2); leave without
            // waiting for it.
            drop(log_guard);
            std::process::exit(0);
        }
    }
}

/// Serve until SIGINT or SIGTERM.
async fn run_server(config: &Config) -> anyhow::Result<()> {
    let server = Server::bind(&config.server).await?;

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint =
        signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT");
            }
        }
        shutdown.cancel();
    });

    server.run().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_debug_assert() {
        // Verify the CLI structure is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn test_server_command_defaults() {
        let cli = Cli::try_parse_from(["linkterm", "server"]).unwrap();
        match cli.command {
            Commands::Server {
                host,
                port,
                shell,
                shell_args,
                grace_period_ms,
            } => {
                assert!(host.is_none());
                assert!(port.is_none());
                assert!(shell.is_none());
                assert!(shell_args.is_empty());
                assert!(grace_period_ms.is_none());
            }
            _ => panic!("Expected Server command"),
        }
        assert_eq!(cli.debug, 0);
    }

    #[test]
    fn test_server_command_flags() {
        let cli = Cli::try_parse_from([
            "linkterm",
            "server",
            "-H",
            "0.0.0.0",
            "-P",
            "9000",
            "-s",
            "/bin/sh",
            "--shell-arg",
            "-l",
            "--grace-period-ms",
            "2500",
        ])
        .unwrap();

        let mut config = Config::default();
        cli.command.apply(&mut config);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.shell.as_deref(), Some("/bin/sh"));
        assert_eq!(config.server.shell_args, vec!["-l"]);
        assert_eq!(config.server.grace_period_ms, 2500);
    }

    #[test]
    fn test_client_command_flags() {
        let cli = Cli::try_parse_from([
            "linkterm",
            "client",
            "-u",
            "https://shell.example.com",
            "-x",
            "socks5://127.0.0.1:1080",
            "--handshake-timeout",
            "20",
        ])
        .unwrap();

        let mut config = Config::default();
        cli.command.apply(&mut config);
        assert_eq!(config.client.url, "https://shell.example.com");
        assert_eq!(config.client.proxy.as_deref(), Some("socks5://127.0.0.1:1080"));
        assert_eq!(config.client.handshake_timeout_secs, 20);
    }

    #[test]
    fn test_client_without_flags_keeps_config() {
        let cli = Cli::try_parse_from(["linkterm", "client"]).unwrap();
        let mut config = Config::default();
        config.client.url = "example.com".to_string();
        cli.command.apply(&mut config);
        assert_eq!(config.client.url, "example.com");
    }

    #[test]
    fn test_global_debug_count() {
        let cli = Cli::try_parse_from(["linkterm", "-dd", "client"]).unwrap();
        assert_eq!(cli.debug, 2);

        let cli = Cli::try_parse_from(["linkterm", "server", "-d"]).unwrap();
        assert_eq!(cli.debug, 1);
    }

    #[test]
    fn test_global_config_flag() {
        let cli = Cli::try_parse_from(["linkterm", "-c", "/tmp/lt.toml", "server"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/lt.toml")));
    }

    #[test]
    fn test_missing_subcommand_fails() {
        assert!(Cli::try_parse_from(["linkterm"]).is_err());
    }

    #[test]
    fn test_invalid_port_fails() {
        assert!(Cli::try_parse_from(["linkterm", "server", "-P", "notaport"]).is_err());
    }
}
