//! broodd - per-identity worker-process supervisor

mod cli;
mod config;
mod connection;
mod error;
mod identity;
mod logging;
mod processor;
mod routing;
mod supervisor;
mod worker;

use anyhow::{Context, Result};
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr};
use std::sync::Arc;
use tracing::{Level, info};

use cli::{Cli, Commands};
use config::ServerConfig;
use supervisor::{Outcome, Supervisor};

fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    let result = match &cli.command {
        Commands::Serve => cmd_serve(&cli),
        Commands::Check => cmd_check(&cli),
        Commands::Completions(args) => {
            args.generate();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

fn init_logging(cli: &Cli) {
    let mut config = logging::LogConfig::new();
    if cli.quiet {
        config = config.with_level(Level::ERROR);
    } else {
        config = config.with_level(match cli.verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        });
    }
    if let Some(format) = cli.log_format.as_deref().and_then(|f| f.parse().ok()) {
        config = config.with_format(format);
    }
    if let Some(path) = &cli.log_file {
        config = config.with_file(path.clone());
    }
    logging::init(config.with_env_overrides());
}

/// Run the supervisor; restarts re-enter the loop, shutdown leaves it.
fn cmd_serve(cli: &Cli) -> Result<()> {
    let cfg = ServerConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    let processor = Arc::new(processor::DrainProcessor);
    let mut sup = Supervisor::new(cfg, processor).context("starting supervisor")?;
    sup.install_signal_handlers()
        .context("installing signal handlers")?;

    loop {
        match sup.run().context("supervisor run failed")? {
            Outcome::Shutdown => break,
            Outcome::Restart { graceful } => {
                info!(graceful, "restarting");
                match ServerConfig::load(&cli.config) {
                    Ok(cfg) => sup.reconfigure(cfg),
                    Err(e) => {
                        tracing::error!(error = %e, "reload failed, keeping previous configuration");
                        sup.control_flags().reset();
                    }
                }
            }
        }
    }
    Ok(())
}

fn cmd_check(cli: &Cli) -> Result<()> {
    let cfg = ServerConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    println!(
        "{} is valid: {} processes, {} listeners, {} identity bindings",
        cli.config.display(),
        cfg.max_processes,
        cfg.listeners.len(),
        cfg.identities.len()
    );
    Ok(())
}
