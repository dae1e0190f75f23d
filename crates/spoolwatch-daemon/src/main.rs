// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// spoolwatchd — print-queue discovery and reconciliation daemon.
//
// Watches DNS-SD, legacy CUPS broadcasts, and polled upstream servers,
// and maintains a matching local print queue for every eligible remote
// printer.  Entry point: logging, configuration, environment isolation,
// then the event loop.

mod broadcast;
mod catalogue;
mod clock;
mod cups;
mod daemon;
mod descriptor;
mod dnssd;
mod intake;
mod local_view;
mod netif;
mod poll;
mod reconciler;
mod uri;

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::{debug, info};

use spoolwatch_core::config::{self, Config, DEFAULT_CONFIG_PATH};

use crate::daemon::Daemon;

/// spoolwatchd -- make remote printers appear as local queues
#[derive(Debug, Parser)]
#[command(name = "spoolwatchd", version, about)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short = 'd', long = "debug")]
    debug: bool,

    /// Verbosity (repeatable); same effect as --debug.
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,

    /// Auto-shutdown mode: on, off, avahi, or none.
    #[arg(long = "autoshutdown", value_name = "MODE")]
    autoshutdown: Option<String>,

    /// Auto-shutdown timeout in seconds.
    #[arg(long = "autoshutdown-timeout", value_name = "SECONDS")]
    autoshutdown_timeout: Option<i64>,

    /// Configuration file path.
    #[arg(long = "config", value_name = "FILE", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

fn init_logging(verbose: bool) {
    let default_directive = if verbose {
        "spoolwatch=debug,spoolwatchd=debug"
    } else {
        "spoolwatch=info,spoolwatchd=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive)),
        )
        .init();
}

/// Point every CUPS request at the local service: the configured domain
/// socket when it is usable by everyone, else localhost.  This shields the
/// daemon from client-side server overrides.
fn isolate_print_service(config: &Config) {
    let server = match &config.domain_socket {
        Some(socket) => {
            let world_accessible = std::fs::metadata(socket)
                .map(|meta| {
                    use std::os::unix::fs::PermissionsExt;
                    meta.permissions().mode() & 0o007 == 0o007
                })
                .unwrap_or(false);
            if world_accessible {
                socket.display().to_string()
            } else {
                "localhost".to_string()
            }
        }
        None => "localhost".to_string(),
    };
    debug!(server = %server, "using print service");
    std::env::set_var("CUPS_SERVER", &server);
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug || cli.verbose > 0);
    info!("spoolwatchd starting");

    let mut config = Config::load(&cli.config);

    // Command line overrides the config file.
    if let Some(mode) = &cli.autoshutdown {
        config.autoshutdown = config::parse_autoshutdown(mode)
            .with_context(|| format!("unknown auto shutdown mode '{mode}'"))?;
    }
    if let Some(timeout) = cli.autoshutdown_timeout {
        anyhow::ensure!(
            timeout >= 0,
            "invalid auto shutdown timeout value: {timeout}"
        );
        config.autoshutdown_timeout = timeout as u64;
    }

    config.normalise();
    isolate_print_service(&config);

    if config.is_idle() {
        info!("no browse protocols enabled and no servers to poll, exiting");
        return Ok(());
    }

    let (daemon, events) = Daemon::new(config);
    daemon
        .run(events)
        .await
        .context("daemon terminated with an error")?;
    Ok(())
}
