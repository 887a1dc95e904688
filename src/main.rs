// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use vidqueue::config::{config_path, load_config, save_config, Config};
use vidqueue::download::{MAX_CONCURRENT, MIN_CONCURRENT};
use vidqueue::server::Server;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit codes following sysexits.h conventions
mod exit_codes {
    /// Usage error - invalid command line arguments
    pub const USAGE: i32 = 64;
    /// Configuration error - invalid or missing config
    pub const CONFIG: i32 = 78;
}

#[derive(Parser)]
#[command(name = "vidqueue")]
#[command(version = VERSION)]
#[command(about = "Local yt-dlp download queue with a web API", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Port to listen on
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// Address to bind to (127.0.0.1 keeps the API local)
    #[arg(long, global = true, value_name = "ADDR")]
    bind: Option<String>,

    /// Directory downloads are written to
    #[arg(short, long, global = true, value_name = "DIR")]
    downloads_dir: Option<PathBuf>,

    /// Maximum concurrent downloads (1-10)
    #[arg(short = 'c', long, global = true, value_name = "N")]
    max_concurrent: Option<usize>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server (default)
    ///
    /// Examples:
    ///   vidqueue serve
    ///   vidqueue serve --port 8080 --downloads-dir ~/Videos
    Serve,

    /// Inspect configuration
    ///
    /// Examples:
    ///   vidqueue config show
    ///   vidqueue config path
    ///   vidqueue --port 8080 config init
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Print the config file location
    Path,
    /// Write the effective configuration (flags included) to the config file
    Init,
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "vidqueue=debug,tower_http=debug"
    } else {
        "vidqueue=info,tower_http=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

/// Apply command-line overrides on top of the config file.
fn apply_overrides(mut config: Config, cli: &Cli) -> Config {
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(bind) = &cli.bind {
        config.bind_address = bind.clone();
    }
    if let Some(dir) = &cli.downloads_dir {
        config.downloads_dir = dir.clone();
    }
    if let Some(limit) = cli.max_concurrent {
        config.max_concurrent = limit;
    }
    config
}

fn handle_config(command: Option<ConfigCommands>, config: &Config) -> Result<()> {
    match command.unwrap_or(ConfigCommands::Show) {
        ConfigCommands::Show => {
            println!("{}", "vidqueue configuration".bold());
            println!("{}", serde_json::to_string_pretty(config)?);
        }
        ConfigCommands::Path => {
            println!("{}", config_path()?.display());
        }
        ConfigCommands::Init => {
            save_config(config)?;
            println!("{} Saved {}", "[✓]".green(), config_path()?.display());
        }
    }
    Ok(())
}

fn serve(config: Config) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    runtime.block_on(async {
        let server = Server::from_config(&config);
        println!(
            "{} vidqueue {} listening on {}",
            "[✓]".green(),
            VERSION,
            format!("http://{}:{}", config.bind_address, config.port).cyan()
        );
        println!(
            "{} Saving to {} ({} concurrent)",
            "[✓]".green(),
            config.downloads_dir.display(),
            config.ceiling()
        );
        server.start().await
    })
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} {:#}", "[!]".red(), e);
            std::process::exit(exit_codes::CONFIG);
        }
    };
    let config = apply_overrides(config, &cli);

    if !(MIN_CONCURRENT..=MAX_CONCURRENT).contains(&config.max_concurrent) {
        if cli.max_concurrent.is_some() {
            eprintln!(
                "{} --max-concurrent must be between {} and {}",
                "[!]".red(),
                MIN_CONCURRENT,
                MAX_CONCURRENT
            );
            std::process::exit(exit_codes::USAGE);
        }
        eprintln!(
            "{} max_concurrent {} out of range, using {}",
            "[!]".yellow(),
            config.max_concurrent,
            config.ceiling()
        );
    }

    match cli.command {
        None | Some(Commands::Serve) => serve(config),
        Some(Commands::Config { command }) => handle_config(command, &config),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides() {
        let cli = Cli::parse_from(["vidqueue", "--port", "8080", "-c", "5", "serve"]);
        let config = apply_overrides(Config::default(), &cli);
        assert_eq!(config.port, 8080);
        assert_eq!(config.max_concurrent, 5);
        assert_eq!(config.bind_address, "127.0.0.1");
        assert!(matches!(cli.command, Some(Commands::Serve)));
    }

    #[test]
    fn test_default_command_is_serve() {
        let cli = Cli::parse_from(["vidqueue"]);
        assert!(cli.command.is_none());
        assert!(!cli.verbose);
    }

    #[test]
    fn test_config_init_keeps_global_flags() {
        let cli = Cli::parse_from(["vidqueue", "config", "init", "-d", "/srv/videos"]);
        let config = apply_overrides(Config::default(), &cli);
        assert_eq!(config.downloads_dir, PathBuf::from("/srv/videos"));
        assert!(matches!(
            cli.command,
            Some(Commands::Config {
                command: Some(ConfigCommands::Init)
            })
        ));
    }

    #[test]
    fn test_config_subcommand() {
        let cli = Cli::parse_from(["vidqueue", "config", "path"]);
        assert!(matches!(
            cli.command,
            Some(Commands::Config {
                command: Some(ConfigCommands::Path)
            })
        ));
    }
}
