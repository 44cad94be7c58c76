use anyhow::Result;
use battletap::transport::{TcpAcceptor, TcpConnector, Transport};
use battletap::{wire, InboundEvent, SessionConfig, SessionManager};
use clap::{Parser, Subcommand, ValueEnum};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TransportKind {
    Tcp,
    Rfcomm,
}

#[derive(Debug, Parser)]
#[command(name = "battletap", about = "Two-player BattleTap peer node")]
struct Cli {
    /// Stream transport to use
    #[arg(long, value_enum, default_value_t = TransportKind::Tcp)]
    transport: TransportKind,

    /// Local TCP address to accept peers on
    #[arg(long, global = true)]
    bind: Option<String>,

    /// RFCOMM channel
    #[arg(long, default_value_t = 1)]
    channel: u8,

    /// Make the Bluetooth adapter discoverable while waiting for an opponent
    #[arg(long)]
    discoverable: bool,

    /// Seconds allowed for one outbound connect attempt
    #[arg(long, default_value_t = 12)]
    connect_timeout: u64,

    /// Stay idle after a failed connect or a lost connection
    #[arg(long)]
    no_relisten: bool,

    /// Send the end signal as soon as a peer is bound
    #[arg(long)]
    send_end: bool,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Debug, Subcommand)]
enum Mode {
    /// Wait for an opponent to connect
    Listen,
    /// Connect to an opponent (`host:port` or Bluetooth MAC)
    Connect { peer: String },
    /// Scan for nearby Bluetooth devices
    #[cfg(feature = "bluetooth")]
    Scan {
        /// Scan duration in seconds
        #[arg(long, default_value_t = 12)]
        seconds: u64,
        /// Only list devices whose name starts with this prefix
        #[arg(long)]
        prefix: Option<String>,
    },
}

const DEFAULT_TCP_BIND: &str = "0.0.0.0:9000";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    #[cfg(feature = "bluetooth")]
    if let Mode::Scan { seconds, prefix } = &cli.mode {
        return scan(*seconds, prefix.clone()).await;
    }

    let config = SessionConfig {
        connect_timeout: Duration::from_secs(cli.connect_timeout),
        relisten: !cli.no_relisten,
        ..Default::default()
    };

    let transport = build_transport(&cli).await?;
    let (manager, mut events) = SessionManager::new(config, transport.clone());

    match &cli.mode {
        Mode::Listen => manager.start().await?,
        Mode::Connect { peer } => {
            if transport.can_listen() {
                manager.start().await?;
            }
            manager.connect(peer.as_str()).await?;
        }
        #[cfg(feature = "bluetooth")]
        Mode::Scan { .. } => unreachable!("scan returns early"),
    }

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    // Main event loop
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    if handle_event(&manager, event, cli.send_end) {
                        break;
                    }
                }
                None => {
                    error!("Session manager closed");
                    break;
                }
            },
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    let line = line.trim().to_string();
                    if let Err(e) = manager.send(line.into_bytes()) {
                        warn!("[GAME] Not sent: {}", e);
                    }
                }
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!("[GAME] stdin error: {}", e);
                    stdin_open = false;
                }
            },
            _ = &mut ctrl_c => {
                info!("Interrupted");
                break;
            }
        }
    }

    manager.stop().await?;
    manager.shutdown().await;
    Ok(())
}

async fn build_transport(cli: &Cli) -> Result<Transport> {
    match cli.transport {
        TransportKind::Tcp => {
            if cli.discoverable {
                warn!("[GAME] --discoverable only applies to the RFCOMM transport");
            }
            let connector = Arc::new(TcpConnector::new());
            let bind = match (&cli.mode, &cli.bind) {
                (_, Some(bind)) => Some(bind.as_str()),
                (Mode::Listen, None) => Some(DEFAULT_TCP_BIND),
                _ => None,
            };
            match bind {
                Some(addr) => {
                    let acceptor = TcpAcceptor::bind(addr).await?;
                    Ok(Transport::new(connector, Arc::new(acceptor)))
                }
                None => Ok(Transport::connect_only(connector)),
            }
        }
        TransportKind::Rfcomm => rfcomm_transport(cli.channel, cli.discoverable).await,
    }
}

#[cfg(feature = "bluetooth")]
async fn rfcomm_transport(channel: u8, discoverable: bool) -> Result<Transport> {
    use battletap::transport::{BtDiscovery, RfcommAcceptor, RfcommConnector, DISCOVERABLE_WINDOW};

    let acceptor = RfcommAcceptor::bind(channel).await?;
    if discoverable {
        let adapter = BtDiscovery::get_adapter().await?;
        BtDiscovery::make_discoverable(&adapter, DISCOVERABLE_WINDOW).await?;
    }
    Ok(Transport::new(
        Arc::new(RfcommConnector::new(channel)),
        Arc::new(acceptor),
    ))
}

#[cfg(not(feature = "bluetooth"))]
async fn rfcomm_transport(_channel: u8, _discoverable: bool) -> Result<Transport> {
    anyhow::bail!("RFCOMM transport needs a build with `--features bluetooth`")
}

#[cfg(feature = "bluetooth")]
async fn scan(seconds: u64, prefix: Option<String>) -> Result<()> {
    use battletap::transport::{BtDiscovery, BtDiscoveryConfig};

    let adapter = BtDiscovery::get_adapter().await?;
    let discovery = BtDiscovery::new(BtDiscoveryConfig {
        scan_duration: Duration::from_secs(seconds),
        name_prefix: prefix,
    });

    let peers = discovery.discover(&adapter).await?;
    if peers.is_empty() {
        println!("No devices found");
    }
    for peer in peers {
        println!(
            "{}  {}  rssi={}",
            peer.identity(),
            peer.name.as_deref().unwrap_or("<unnamed>"),
            peer.rssi.map_or_else(|| "?".to_string(), |r| r.to_string())
        );
    }
    Ok(())
}

/// Log a session event; returns true when the game is over
fn handle_event(manager: &SessionManager, event: InboundEvent, send_end: bool) -> bool {
    match event {
        InboundEvent::StateChanged(state) => {
            info!("[GAME] State: {}", state);
        }
        InboundEvent::PeerBound(peer) => {
            info!("[GAME] Connected to {}", peer);
            if send_end {
                if let Err(e) = manager.send(wire::END_SIGNAL) {
                    warn!("[GAME] Could not send end signal: {}", e);
                }
            }
        }
        InboundEvent::DataSent(data) => {
            info!("[GAME] WRITE : {}", String::from_utf8_lossy(&data));
            if send_end && wire::is_end_signal(&data) {
                return true;
            }
        }
        InboundEvent::DataReceived { data, peer } => {
            info!("[GAME] READ from {} : {}", peer, String::from_utf8_lossy(&data));
            if wire::is_end_signal(&data) {
                info!("[GAME] {} ended the game", peer);
                return true;
            }
        }
        InboundEvent::Notice(text) => {
            warn!("[GAME] {}", text);
        }
    }
    debug!("[GAME] Waiting for next event");
    false
}
