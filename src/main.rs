use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use garm::config::ConfigSnapshot;
use garm::engine::{Command, Engine, EngineOptions, StatePaths};
use garm::upstream;

#[derive(Parser, Debug)]
#[command(name = "garm", about = "Host-local DNS-filtering VPN gateway")]
struct Args {
    /// Path to the JSON configuration snapshot
    #[arg(short, long, default_value = "garm.json")]
    config: PathBuf,

    /// Directory for persisted state (block log, active flag)
    #[arg(long, default_value = ".")]
    state_dir: PathBuf,

    /// Name of the tun interface to create
    #[arg(long, default_value = "garm0")]
    tun_name: String,

    /// Physical interface to pin the upstream socket to
    #[arg(long)]
    bind_device: Option<String>,
}

/// Resolvers inherited from the underlying link.
fn read_system_resolvers() -> Vec<SocketAddr> {
    let Ok(contents) = std::fs::read_to_string("/etc/resolv.conf") else {
        return vec![];
    };

    contents
        .lines()
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            match (tokens.next(), tokens.next()) {
                (Some("nameserver"), Some(addr)) => garm::config::parse_resolver_addr(addr).ok(),
                _ => None,
            }
        })
        .collect()
}

#[cfg(target_os = "linux")]
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    let args = Args::parse();

    let mut config = if args.config.exists() {
        ConfigSnapshot::load(&args.config)?
    } else {
        warn!(
            "Configuration {} not found, using defaults",
            args.config.display()
        );
        ConfigSnapshot::default()
    };
    config.apply_env();

    let protector = match args.bind_device {
        Some(interface) => upstream::bind_to_device(interface),
        None => upstream::no_protection(),
    };

    let system_dns = read_system_resolvers();
    if system_dns.is_empty() {
        warn!("No system resolvers found in /etc/resolv.conf");
    }

    let engine = Engine::spawn(
        config,
        EngineOptions {
            tun_provider: Arc::new(garm::tun::linux::LinuxTunProvider),
            protector,
            system_dns,
            paths: StatePaths::in_dir(&args.state_dir),
            tun_name: args.tun_name,
        },
    );

    let mut status = engine.status();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = status.borrow_and_update().clone();
            if let Some(warning) = &current.warning {
                warn!("Engine warning: {warning}");
            }
        }
    });

    engine.command(Command::Start).await?;

    tokio::signal::ctrl_c().await?;
    info!("Interrupted, shutting down");

    engine.command(Command::Stop).await?;
    let mut status = engine.status();
    while status.borrow_and_update().state != garm::EngineState::Stopped {
        if status.changed().await.is_err() {
            break;
        }
    }

    let snapshot = engine.stats().snapshot();
    info!(
        "Session totals: {} blocked, {} forwarded, {} relayed",
        snapshot.queries_blocked, snapshot.queries_forwarded, snapshot.responses_relayed
    );

    engine.join().await;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("garm currently only runs on Linux hosts");
    std::process::exit(1);
}
