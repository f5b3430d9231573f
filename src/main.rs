use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::{self, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use kadmos::{Contact, Dht, DhtConfig, PeerId, QuicTransport};

#[derive(Clone, Debug)]
struct BootstrapPeer {
    addr: SocketAddr,
    peer: PeerId,
}

impl FromStr for BootstrapPeer {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr_part, id_part) = s
            .rsplit_once('/')
            .context("bootstrap peer must include a peer id (format: IP:PORT/PEER_ID)")?;

        let addr: SocketAddr = addr_part.parse().context("invalid socket address")?;
        let peer = PeerId::from_hex(id_part)
            .map_err(|_| anyhow::anyhow!("peer id must be 64 hex characters"))?;

        Ok(BootstrapPeer { addr, peer })
    }
}

#[derive(Parser, Debug)]
#[command(name = "kadmos")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    #[arg(short = 'B', long = "bootstrap", value_name = "PEER")]
    bootstrap: Vec<BootstrapPeer>,

    /// Answer queries from other peers instead of running as a pure client.
    #[arg(long)]
    server: bool,

    /// Run the LAN profile (private addresses, /lan protocol).
    #[arg(long)]
    lan: bool,

    #[arg(short, long, default_value = "300")]
    telemetry_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let keypair = kadmos::Keypair::generate();
    let transport = QuicTransport::bind(args.bind, &keypair).await?;
    let local_addr = transport.local_addr()?;

    let config = DhtConfig {
        client_mode: !args.server,
        lan: args.lan,
        ..DhtConfig::default()
    };
    let dht = Dht::builder()
        .config(config)
        .keypair(keypair)
        .connection_manager(transport.clone())
        .registrar(transport.clone())
        .external_addresses(vec![local_addr.to_string()])
        .build()?;
    dht.start().await?;

    info!("peer id: {}", dht.local_peer().to_hex());
    info!("listening on {local_addr} ({})", dht.protocol());

    let cancel = CancellationToken::new();
    for peer in &args.bootstrap {
        info!("bootstrapping from {}/{}", peer.addr, &peer.peer.to_hex()[..16]);
        let seed = Contact::single(peer.peer, peer.addr.to_string());
        match dht.bootstrap(seed, &cancel).await {
            Ok(()) => info!("bootstrap complete"),
            Err(e) => warn!(error = %e, "bootstrap failed"),
        }
    }

    let mut interval = time::interval(Duration::from_secs(args.telemetry_interval));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
            _ = interval.tick() => {
                let snapshot = dht.telemetry().await;
                info!(
                    peers = snapshot.peers,
                    buckets = snapshot.buckets,
                    server = snapshot.server_mode,
                    "telemetry snapshot"
                );
            }
        }
    }

    dht.stop().await;
    transport.close();
    Ok(())
}
