// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use vidqueue::config::{self, Config};
use vidqueue::error::{format_error, ErrorBuilder};
use vidqueue::server::Server;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit codes following sysexits.h conventions
mod exit_codes {
    /// General error
    pub const ERROR: i32 = 1;
    /// Port in use or similar; try again later
    pub const TEMP_FAIL: i32 = 75;
    /// Invalid or unreadable config
    pub const CONFIG: i32 = 78;
}

/// vidqueue - a local download queue for video and audio.
#[derive(Parser)]
#[command(name = "vidqueue")]
#[command(version = VERSION)]
#[command(about = "Local download queue for video and audio, driven over HTTP.")]
#[command(long_about = "vidqueue - local download queue\n\n\
    Start the server:    vidqueue\n\
    Custom port:         vidqueue serve --port 8080\n\
    Configure:           vidqueue config show\n\n\
    Jobs run one at a time through yt-dlp (or another compatible downloader).")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Quiet mode: only warnings and errors
    #[arg(short = 'q', long, global = true)]
    quiet: bool,

    /// Verbose mode: debug logging
    #[arg(short = 'v', long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server (default)
    ///
    /// Examples:
    ///   vidqueue serve
    ///   vidqueue serve --port 8080 --downloads-dir ~/Videos
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind to
        #[arg(long)]
        bind: Option<String>,

        /// Directory downloads are written to
        #[arg(long)]
        downloads_dir: Option<PathBuf>,

        /// Downloader executable
        #[arg(long)]
        downloader: Option<PathBuf>,
    },

    /// View or change configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show current configuration
    Show,

    /// Change server port
    ///
    /// Example:
    ///   vidqueue config set-port 8080
    SetPort {
        /// Port number
        port: u16,
    },

    /// Change the downloader executable
    ///
    /// Example:
    ///   vidqueue config set-downloader /usr/local/bin/yt-dlp
    SetDownloader {
        /// Path or name of the executable
        program: PathBuf,
    },

    /// Change where downloads are written
    ///
    /// Example:
    ///   vidqueue config set-downloads-dir ~/Videos
    SetDownloadsDir {
        /// Directory path
        dir: PathBuf,
    },
}

fn init_tracing(verbose: bool, quiet: bool) {
    let default_filter = if verbose {
        "debug"
    } else if quiet {
        "warn"
    } else {
        "info,vidqueue=debug"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let config = match config::load_config() {
        Ok(config) => config,
        Err(e) => {
            let path = config::config_path()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|_| "~/.vidqueue/config.json".to_string());
            let fix = format!("Fix or delete {}", path);
            eprintln!(
                "{}",
                format_error(
                    &format!("Could not load configuration: {:#}", e),
                    &["The config file is not valid JSON", "The home directory is not readable"],
                    &[fix.as_str()],
                )
            );
            std::process::exit(exit_codes::CONFIG);
        }
    };

    let result = match cli.command {
        None => serve(config),
        Some(Commands::Serve {
            port,
            bind,
            downloads_dir,
            downloader,
        }) => {
            let mut config = config;
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(bind) = bind {
                config.bind_address = bind;
            }
            if let Some(dir) = downloads_dir {
                config.downloads_dir = dir;
            }
            if let Some(program) = downloader {
                config.downloader = program;
            }
            serve(config)
        }
        Some(Commands::Config { command }) => handle_config(config, command),
    };

    if let Err(e) = result {
        eprintln!("{} {:#}", "[✗]".red(), e);
        std::process::exit(exit_codes::ERROR);
    }
}

fn serve(config: Config) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    let server = Server::from_config(&config);

    println!(
        "{} Starting vidqueue {} on http://{}:{}",
        "[✓]".green(),
        VERSION,
        config.bind_address,
        config.port
    );
    println!("    Downloads: {}", config.downloads_dir.display());

    if let Err(e) = runtime.block_on(server.start()) {
        let message = format!("{:#}", e);
        if message.contains("already in use") {
            let fix = format!(
                "Use a different port: vidqueue serve --port {}",
                config.port.wrapping_add(1)
            );
            let error = ErrorBuilder::new(format!("Port {} is already in use", config.port))
                .cause("Another vidqueue server is running")
                .cause("Another program is using this port")
                .fix(fix)
                .fix("Or stop the other process");
            eprintln!("{}", error);
            std::process::exit(exit_codes::TEMP_FAIL);
        }
        return Err(e);
    }

    Ok(())
}

fn handle_config(mut config: Config, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("{}", "=== vidqueue configuration ===".cyan().bold());
            println!();
            println!("  Port:           {}", config.port);
            println!("  Bind address:   {}", config.bind_address);
            println!("  Downloads dir:  {}", config.downloads_dir.display());
            let downloader = if config.downloader_args.is_empty() {
                config.downloader.display().to_string()
            } else {
                format!(
                    "{} {}",
                    config.downloader.display(),
                    config.downloader_args.join(" ")
                )
            };
            println!("  Downloader:     {}", downloader);
            println!("  Allowed hosts:  {}", config.allowed_hosts.join(", "));
            println!("  Cancel grace:   {}s", config.cancel_grace_secs);
            println!();

            if let Ok(path) = config::config_path() {
                println!("Config file: {}", path.display().to_string().dimmed());
            }
            println!();
        }
        Some(ConfigCommands::SetPort { port }) => {
            config.port = port;
            config::save_config(&config)?;
            println!("{} Port set to: {}", "[✓]".green(), port);
        }
        Some(ConfigCommands::SetDownloader { program }) => {
            config.downloader = program;
            config::save_config(&config)?;
            println!("{} Downloader set to: {}", "[✓]".green(), config.downloader.display());
        }
        Some(ConfigCommands::SetDownloadsDir { dir }) => {
            config.downloads_dir = dir;
            config::save_config(&config)?;
            println!(
                "{} Downloads directory set to: {}",
                "[✓]".green(),
                config.downloads_dir.display()
            );
        }
    }

    Ok(())
}
