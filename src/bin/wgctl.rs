//! wgctl - WireGuard lifecycle CLI
//!
//! Drives one configured backend (or an ad-hoc `--url`) through the
//! orchestration service.
//!
//! # Usage
//!
//! ```bash
//! # Bring an interface up from a wg-quick file on the local kernel
//! sudo wgctl --url linux:// up /etc/wireguard/wg0.conf
//!
//! # Show an interface on a configured RouterOS backend
//! wgctl --backend edge device wg0
//!
//! # Generate a key pair
//! wgctl genkey | tee privatekey | wgctl pubkey
//! ```

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use libwgctl::codec::wgquick::parse_config;
use libwgctl::driver::keys::{generate_private_key, public_key_from_private};
use libwgctl::{
    BackendTarget, Device, Factories, StatsPoller, StatsTarget, WgctlConfig, WireguardService,
};
use serde::Serialize;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "wgctl")]
#[command(version)]
#[command(about = "Manage WireGuard interfaces on kernel, NetworkManager, RouterOS and wg-quick backends", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Backend id from the configuration file
    #[arg(short, long)]
    backend: Option<String>,

    /// Ad-hoc backend connection URL, e.g. linux:// or exec:///etc/wireguard
    #[arg(long, conflicts_with = "backend")]
    url: Option<String>,

    /// Output format: text, json
    #[arg(short = 'o', long, default_value = "text")]
    output: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the current state of an interface
    Device { name: String },
    /// Create or converge an interface from a wg-quick file
    Up {
        file: PathBuf,
        /// Interface name, defaults to the file stem
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Tear an interface down
    Down { name: String },
    /// Whether an interface is active
    Status { name: String },
    /// Interface counters
    Stats { name: String },
    /// Counters for one peer
    PeerStats { name: String, public_key: String },
    /// WireGuard interfaces not managed by the caller
    Foreign {
        /// Interfaces to leave out
        #[arg(short, long, value_delimiter = ',')]
        known: Vec<String>,
    },
    /// Configured backends and the backend types this platform supports
    Backends,
    /// Print a new private key
    Genkey,
    /// Read a private key on stdin and print its public key
    Pubkey,
    /// Print interface counters as they change until interrupted
    Watch {
        #[arg(required = true)]
        names: Vec<String>,
        /// Seconds between reads, defaults to the configured poller interval
        #[arg(short, long)]
        interval: Option<u64>,
    },
}

fn init_logging(cli: &Cli, configured: &str) {
    let log_level = if cli.verbose {
        "debug"
    } else {
        cli.log_level.as_deref().unwrap_or(configured)
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("wgctl={},libwgctl={}", log_level, log_level)));

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .init();
}

fn load_config(path: Option<&Path>) -> Result<WgctlConfig> {
    match path {
        Some(path) => WgctlConfig::load(path).with_context(|| format!("loading {}", path.display())),
        None => {
            let path = WgctlConfig::default_path();
            if path.exists() {
                WgctlConfig::load(&path).with_context(|| format!("loading {}", path.display()))
            } else {
                Ok(WgctlConfig::default())
            }
        }
    }
}

fn resolve_target(cli: &Cli, config: &WgctlConfig) -> Result<BackendTarget> {
    if let Some(url) = &cli.url {
        return Ok(BackendTarget::from_url("cli", url)?);
    }
    let backend = match &cli.backend {
        Some(id) => config
            .backend(id)
            .ok_or_else(|| anyhow!("backend {} is not configured", id))?,
        None => match config.backends.as_slice() {
            [only] => only,
            [] => bail!("no backend configured; pass --url or --backend"),
            _ => bail!("several backends configured; choose one with --backend"),
        },
    };
    Ok(backend.target()?)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_device(device: &Device) {
    println!("interface: {}", device.interface.name);
    if !device.interface.description.is_empty() {
        println!("  description: {}", device.interface.description);
    }
    if !device.interface.addresses.is_empty() {
        println!("  addresses: {}", device.interface.addresses.join(", "));
    }
    if device.interface.mtu > 0 {
        println!("  mtu: {}", device.interface.mtu);
    }
    println!("  public key: {}", device.wireguard.public_key);
    if device.wireguard.listen_port > 0 {
        println!("  listening port: {}", device.wireguard.listen_port);
    }
    if device.wireguard.firewall_mark > 0 {
        println!("  fwmark: {:#x}", device.wireguard.firewall_mark);
    }
    for peer in &device.wireguard.peers {
        println!();
        println!("peer: {}", peer.public_key);
        if let Some(endpoint) = peer.stats.endpoint.as_ref().or(peer.endpoint.as_ref()) {
            println!("  endpoint: {}", endpoint);
        }
        println!("  allowed ips: {}", peer.allowed_ips.join(", "));
        if let Some(handshake) = peer.stats.last_handshake_time {
            println!("  latest handshake: {}", handshake.to_rfc3339());
        }
        if peer.stats.receive_bytes > 0 || peer.stats.transmit_bytes > 0 {
            println!(
                "  transfer: {} B received, {} B sent",
                peer.stats.receive_bytes, peer.stats.transmit_bytes
            );
        }
        if !peer.persistent_keepalive.is_zero() {
            println!("  persistent keepalive: every {} seconds", peer.persistent_keepalive.as_secs());
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Key helpers never touch a backend or the configuration
    match &cli.command {
        Commands::Genkey => {
            println!("{}", generate_private_key());
            return Ok(());
        }
        Commands::Pubkey => {
            let mut input = String::new();
            std::io::stdin().read_to_string(&mut input)?;
            println!("{}", public_key_from_private(input.trim())?);
            return Ok(());
        }
        _ => {}
    }

    let config = load_config(cli.config.as_deref())?;
    init_logging(&cli, &config.logging.level);

    let service = Arc::new(WireguardService::new(Arc::new(Factories::builtin())));
    let result = run(&cli, &config, service.clone()).await;
    if let Err(e) = service.close().await {
        debug!("Closing backends failed: {}", e);
    }
    result
}

async fn run(cli: &Cli, config: &WgctlConfig, service: Arc<WireguardService>) -> Result<()> {
    let json = cli.output == "json";

    if let Commands::Backends = cli.command {
        let supported = service.supported_types();
        if json {
            #[derive(Serialize)]
            struct Listing<'a> {
                backends: &'a [libwgctl::config::BackendConfig],
                supported_types: &'a [libwgctl::BackendKind],
            }
            return print_json(&Listing {
                backends: &config.backends,
                supported_types: &supported,
            });
        }
        println!("BACKEND\tURL");
        for backend in &config.backends {
            println!("{}\t{}", backend.id, backend.url);
        }
        let names: Vec<&str> = supported.iter().map(|kind| kind.as_str()).collect();
        println!("\nsupported types: {}", names.join(", "));
        return Ok(());
    }

    let target = resolve_target(cli, config)?;
    debug!("Using {} backend {}", target.kind, target.id);

    match &cli.command {
        Commands::Device { name } => {
            let device = service.device(&target, name).await?;
            if json {
                print_json(&device)?;
            } else {
                print_device(&device);
            }
        }
        Commands::Up { file, name } => {
            let name = match name {
                Some(name) => name.clone(),
                None => file
                    .file_stem()
                    .and_then(|stem| stem.to_str())
                    .map(str::to_string)
                    .ok_or_else(|| anyhow!("cannot derive an interface name from {}", file.display()))?,
            };
            let content = tokio::fs::read_to_string(file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let options = parse_config(&name, &content)?.to_options();
            let device = service.up(&target, &options).await?;
            info!("{} is up", name);
            if json {
                print_json(&device)?;
            } else {
                print_device(&device);
            }
        }
        Commands::Down { name } => {
            service.down(&target, name).await?;
            info!("{} is down", name);
        }
        Commands::Status { name } => {
            let active = service.status(&target, name).await?;
            if json {
                print_json(&serde_json::json!({ "name": name, "active": active }))?;
            } else {
                println!("{}: {}", name, if active { "active" } else { "inactive" });
            }
        }
        Commands::Stats { name } => {
            let stats = service
                .stats(&target, name)
                .await?
                .ok_or_else(|| anyhow!("interface {} does not exist", name))?;
            if json {
                print_json(&stats)?;
            } else {
                println!("{}: rx {} B / {} packets, tx {} B / {} packets", name,
                    stats.rx_bytes, stats.rx_packets, stats.tx_bytes, stats.tx_packets);
                println!("  errors rx {} tx {}, dropped rx {} tx {}",
                    stats.rx_errors, stats.tx_errors, stats.rx_dropped, stats.tx_dropped);
            }
        }
        Commands::PeerStats { name, public_key } => {
            let stats = service
                .peer_stats(&target, name, public_key)
                .await?
                .ok_or_else(|| anyhow!("peer {} not found on {}", public_key, name))?;
            if json {
                print_json(&stats)?;
            } else {
                println!("peer: {}", public_key);
                if let Some(endpoint) = &stats.endpoint {
                    println!("  endpoint: {}", endpoint);
                }
                match stats.last_handshake_time {
                    Some(handshake) => println!("  latest handshake: {}", handshake.to_rfc3339()),
                    None => println!("  latest handshake: never"),
                }
                println!("  transfer: {} B received, {} B sent", stats.receive_bytes, stats.transmit_bytes);
            }
        }
        Commands::Foreign { known } => {
            let servers = service.find_foreign_servers(&target, known).await?;
            if json {
                print_json(&servers)?;
            } else {
                println!("NAME\tSTATE\tPORT\tPEERS\tDESCRIPTION");
                for server in servers {
                    println!(
                        "{}\t{}\t{}\t{}\t{}",
                        server.name,
                        server.interface.state,
                        server.listen_port,
                        server.peers.len(),
                        server.description
                    );
                }
            }
        }
        Commands::Watch { names, interval } => {
            let interval = interval.unwrap_or(config.poller.interval_secs).max(1);
            let poller = StatsPoller::start(service.clone(), Duration::from_secs(interval));
            for name in names {
                poller
                    .track(StatsTarget {
                        backend: target.clone(),
                        interface: name.clone(),
                    })
                    .await;
            }
            let mut subscription = poller.subscribe();

            loop {
                tokio::select! {
                    event = subscription.recv() => {
                        let Some(event) = event else { break };
                        if json {
                            println!("{}", serde_json::to_string(&event)?);
                        } else {
                            match event.stats {
                                Some(stats) => println!(
                                    "{} {}: rx {} B, tx {} B",
                                    event.observed_at.to_rfc3339(), event.interface, stats.rx_bytes, stats.tx_bytes
                                ),
                                None => println!("{} {}: gone", event.observed_at.to_rfc3339(), event.interface),
                            }
                        }
                    }
                    _ = tokio::signal::ctrl_c() => {
                        info!("Interrupted, stopping");
                        break;
                    }
                }
            }
            drop(subscription);
            poller.shutdown().await?;
        }
        Commands::Backends | Commands::Genkey | Commands::Pubkey => {}
    }
    Ok(())
}
