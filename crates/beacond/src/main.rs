//! beacond: the Beacon daemon.
//!
//! Keeps one BGP session per enabled peer and announces each target's
//! prefixes only while its health check passes.
//!
//! # Usage
//!
//! ```text
//! beacond run --config /etc/beacon/beacon.toml
//! beacond check-config --config ./beacon.toml
//! ```

mod daemon;

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use beacon_core::Config;

const DEFAULT_CONFIG: &str = "/etc/beacon/beacon.toml";

#[derive(Parser)]
#[command(name = "beacond", version, about = "Health-driven BGP route advertiser")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon in the foreground until SIGINT or SIGTERM.
    Run {
        /// Path to the configuration file.
        #[arg(long, env = "BEACON_CONFIG", default_value = DEFAULT_CONFIG)]
        config: PathBuf,

        /// Emit logs as JSON lines.
        #[arg(long)]
        log_json: bool,
    },
    /// Validate the configuration and print what would run.
    CheckConfig {
        /// Path to the configuration file.
        #[arg(long, env = "BEACON_CONFIG", default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run { config, log_json } => {
            init_tracing(log_json);
            let config = load(&config)?;
            daemon::run(config).await
        }
        Command::CheckConfig { config } => {
            let loaded = load(&config)?;
            print!("{}", summary(&config, &loaded));
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,beacond=debug,beacon_engine=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load(path: &Path) -> anyhow::Result<Config> {
    Config::from_file(path).with_context(|| format!("failed to load {}", path.display()))
}

/// Human-readable account of the enabled peers and their targets.
fn summary(path: &Path, config: &Config) -> String {
    let s = &config.settings;
    let mut out = String::new();
    let _ = writeln!(out, "configuration OK: {}", path.display());
    let _ = writeln!(
        out,
        "daemon: tick {}ms, check every {}s, probe timeout {}s, {} concurrent probe(s), reconnect after {}s",
        s.tick_interval.as_millis(),
        s.check_interval.as_secs(),
        s.probe_timeout.as_secs(),
        s.max_concurrent_probes,
        s.connect_retry.as_secs(),
    );

    for peer in config.enabled_peers() {
        let remote_as = peer
            .remote_as
            .map_or_else(|| "any".to_string(), |asn| asn.to_string());
        let _ = writeln!(
            out,
            "peer {}: {} -> {}:{} ({}), AS {} -> {}, hold {}s, {} target(s)",
            peer.name,
            peer.local_address,
            peer.remote_address,
            peer.remote_port,
            peer.address_family,
            peer.local_as,
            remote_as,
            peer.hold_time,
            peer.targets.len(),
        );
        for target in &peer.targets {
            let prefixes: Vec<String> = target.prefixes.iter().map(ToString::to_string).collect();
            let _ = writeln!(
                out,
                "  target {}: {} via {}",
                target.name,
                prefixes.join(", "),
                target.destination,
            );
        }
    }

    if config.disabled_peers() > 0 {
        let _ = writeln!(out, "{} disabled peer(s) skipped", config.disabled_peers());
    }
    out
}
