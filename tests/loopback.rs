use async_trait::async_trait;
use rdm::client::{ConnectionState, InitiatingEndPoint};
use rdm::config::RdmConfig;
use rdm::datagram::PeerId;
use rdm::message_dispatcher::MessageDispatcher;
use rdm::server::AcceptingEndPoint;
use rdm::socket::DatagramSocket;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, timeout};
use tracing::Level;

#[ctor::ctor(unsafe)]
fn init_test_logging() {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(Level::DEBUG)
        .try_init()
        .ok();
}

fn loopback_config() -> RdmConfig {
    RdmConfig {
        retransmit_timeout: Duration::from_millis(50),
        sweep_interval: Duration::from_millis(5),
        heartbeat_interval: Duration::from_millis(10),
        connect_retry_interval: Duration::from_millis(50),
        connect_timeout: Duration::from_secs(5),
        ..RdmConfig::with_self_addr(SocketAddr::from(([127, 0, 0, 1], 0)))
    }
}

struct ChannelDispatcher {
    tx: mpsc::UnboundedSender<(PeerId, SocketAddr, Vec<u8>)>,
}

#[async_trait]
impl MessageDispatcher for ChannelDispatcher {
    async fn on_message(&self, peer_id: PeerId, sender_addr: SocketAddr, message: Vec<u8>) {
        let _ = self.tx.send((peer_id, sender_addr, message));
    }
}

fn channel_dispatcher() -> (Arc<ChannelDispatcher>, Mutex<mpsc::UnboundedReceiver<(PeerId, SocketAddr, Vec<u8>)>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(ChannelDispatcher { tx }), Mutex::new(rx))
}

async fn next_message(rx: &Mutex<mpsc::UnboundedReceiver<(PeerId, SocketAddr, Vec<u8>)>>) -> (PeerId, SocketAddr, Vec<u8>) {
    timeout(Duration::from_secs(10), rx.lock().await.recv()).await
        .expect("timeout waiting for message")
        .expect("dispatcher channel closed")
}

/// Drops every n-th datagram it is asked to send, pretending it was sent
struct LossySocket {
    socket: UdpSocket,
    drop_every: usize,
    num_sends: AtomicUsize,
    num_dropped: AtomicUsize,
}

impl LossySocket {
    async fn bind(drop_every: usize) -> io::Result<LossySocket> {
        Ok(LossySocket {
            socket: UdpSocket::bind("127.0.0.1:0").await?,
            drop_every,
            num_sends: AtomicUsize::new(0),
            num_dropped: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl DatagramSocket for LossySocket {
    async fn send_to(&self, to: SocketAddr, buf: &[u8]) -> io::Result<usize> {
        if (self.num_sends.fetch_add(1, Ordering::AcqRel) + 1) % self.drop_every == 0 {
            self.num_dropped.fetch_add(1, Ordering::AcqRel);
            return Ok(buf.len());
        }
        self.socket.send_to(buf, to).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn reset(&self) -> io::Result<()> {
        self.socket.take_error().map(|_| ())
    }
}

fn message(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_add(seed)).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_roundtrip() {
    let (server_dispatcher, server_rx) = channel_dispatcher();
    let server = AcceptingEndPoint::bind(loopback_config(), server_dispatcher).await.unwrap();

    let (client_dispatcher, client_rx) = channel_dispatcher();
    let client = InitiatingEndPoint::bind(loopback_config(), client_dispatcher).await.unwrap();

    let peer_id = client.connect(server.local_addr().unwrap()).await.unwrap();
    assert_eq!(client.state(), ConnectionState::Connected(peer_id));
    assert_eq!(server.peers().await, vec![peer_id]);

    let messages = vec![message(0, 0), message(1000, 1), message(100_000, 2), message(540, 3), message(541, 4)];
    for m in &messages {
        client.send(m).await.unwrap();
    }
    for m in &messages {
        let (from_id, from_addr, received) = next_message(&server_rx).await;
        assert_eq!(from_id, peer_id);
        assert_eq!(from_addr, client.local_addr().unwrap());
        assert_eq!(&received, m);
    }

    for m in &messages {
        server.send(peer_id, m).await.unwrap();
    }
    for m in &messages {
        let (from_id, from_addr, received) = next_message(&client_rx).await;
        assert_eq!(from_id, peer_id);
        assert_eq!(from_addr, server.local_addr().unwrap());
        assert_eq!(&received, m);
    }

    // heartbeats in both directions retire everything that was sent
    timeout(Duration::from_secs(5), async {
        while client.num_outstanding_sends().await > 0 || server.num_outstanding_sends(peer_id).await != Some(0) {
            sleep(Duration::from_millis(5)).await;
        }
    }).await.unwrap();

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lossy_roundtrip() {
    let server_socket = Arc::new(LossySocket::bind(5).await.unwrap());
    let (server_dispatcher, server_rx) = channel_dispatcher();
    let server = AcceptingEndPoint::with_socket(loopback_config(), server_socket.clone(), server_dispatcher).await.unwrap();

    let client_socket = Arc::new(LossySocket::bind(4).await.unwrap());
    let (client_dispatcher, client_rx) = channel_dispatcher();
    let client = InitiatingEndPoint::with_socket(loopback_config(), client_socket.clone(), client_dispatcher).await.unwrap();

    let peer_id = client.connect(server.local_addr().unwrap()).await.unwrap();

    let messages = (0..20)
        .map(|i| message(i * 357, i as u8))
        .collect::<Vec<_>>();
    for m in &messages {
        client.send(m).await.unwrap();
        server.send(peer_id, m).await.unwrap();
    }

    for m in &messages {
        assert_eq!(&next_message(&server_rx).await.2, m);
        assert_eq!(&next_message(&client_rx).await.2, m);
    }

    assert!(client_socket.num_dropped.load(Ordering::Acquire) > 0);
    assert!(server_socket.num_dropped.load(Ordering::Acquire) > 0);

    timeout(Duration::from_secs(5), async {
        while client.num_outstanding_sends().await > 0 || server.num_outstanding_sends(peer_id).await != Some(0) {
            sleep(Duration::from_millis(5)).await;
        }
    }).await.unwrap();
}

#[tokio::test]
async fn test_connect_to_silent_address_times_out() {
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let (dispatcher, _rx) = channel_dispatcher();
    let config = RdmConfig {
        connect_timeout: Duration::from_millis(300),
        ..loopback_config()
    };
    let client = InitiatingEndPoint::bind(config, dispatcher).await.unwrap();

    assert!(client.connect(silent.local_addr().unwrap()).await.is_err());
    assert_eq!(client.state(), ConnectionState::Disconnected);
}
