use async_trait::async_trait;
use clap::Parser;
use clap_derive::Parser;
use rdm::client::InitiatingEndPoint;
use rdm::config::RdmConfig;
use rdm::datagram::PeerId;
use rdm::message_dispatcher::MessageDispatcher;
use rdm::server::AcceptingEndPoint;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant};
use tracing::{info, warn, Level};

/// Runs an echo server, or a client sending messages to an echo server and measuring round trips
#[derive(Parser)]
struct Args {
    /// local address to bind to
    #[clap(long, default_value = "127.0.0.1:0")]
    bind: String,

    /// run as a client, connecting to the echo server at this address
    #[clap(long)]
    connect: Option<String>,

    /// message size in bytes (client mode)
    #[clap(long, default_value_t = 2000)]
    size: usize,

    /// number of messages to send (client mode)
    #[clap(long, default_value_t = 10)]
    count: usize,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,
}

/// Sends every received message back to its sender
struct EchoDispatcher {
    end_point: OnceLock<Arc<AcceptingEndPoint>>,
}

#[async_trait]
impl MessageDispatcher for EchoDispatcher {
    async fn on_message(&self, peer_id: PeerId, sender_addr: SocketAddr, message: Vec<u8>) {
        info!("echoing {} bytes to {} ({:?})", message.len(), peer_id, sender_addr);
        if let Some(end_point) = self.end_point.get() {
            if let Err(e) = end_point.send(peer_id, &message).await {
                warn!("error echoing message: {}", e);
            }
        }
    }
}

struct ReplyDispatcher {
    replies: mpsc::UnboundedSender<Vec<u8>>,
}

#[async_trait]
impl MessageDispatcher for ReplyDispatcher {
    async fn on_message(&self, _peer_id: PeerId, _sender_addr: SocketAddr, message: Vec<u8>) {
        let _ = self.replies.send(message);
    }
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .try_init()
        .ok();

    let config = RdmConfig::with_self_addr(args.bind.parse()?);

    match args.connect {
        None => run_server(config).await,
        Some(server_addr) => run_client(config, server_addr.parse()?, args.size, args.count).await,
    }
}

async fn run_server(config: RdmConfig) -> anyhow::Result<()> {
    let dispatcher = Arc::new(EchoDispatcher { end_point: OnceLock::new() });
    let end_point = Arc::new(AcceptingEndPoint::bind(config, dispatcher.clone()).await?);
    let _ = dispatcher.end_point.set(end_point.clone());

    info!("echo server listening on {:?}", end_point.local_addr()?);

    let mut stats_interval = interval(Duration::from_secs(10));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = stats_interval.tick() => {
                info!("peers: {:?}, pool: {:?}", end_point.peers().await, end_point.pool_stats());
            }
        }
    }

    end_point.shutdown().await;
    Ok(())
}

async fn run_client(config: RdmConfig, server_addr: SocketAddr, size: usize, count: usize) -> anyhow::Result<()> {
    let (replies_tx, mut replies) = mpsc::unbounded_channel();
    let end_point = InitiatingEndPoint::bind(config, Arc::new(ReplyDispatcher { replies: replies_tx })).await?;

    let peer_id = end_point.connect(server_addr).await?;
    info!("connected to {:?} as {}", server_addr, peer_id);

    for i in 0..count {
        let message = (0..size).map(|j| (i + j) as u8).collect::<Vec<_>>();

        let start = Instant::now();
        end_point.send(&message).await?;
        let Some(reply) = replies.recv().await else {
            anyhow::bail!("end point terminated");
        };

        if reply != message {
            warn!("reply #{} differs from the message", i);
        }
        info!("round trip #{}: {} bytes in {:?}", i, size, start.elapsed());
    }

    end_point.disconnect().await;
    end_point.shutdown().await;
    Ok(())
}
