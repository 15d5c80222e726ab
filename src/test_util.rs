use crate::config::RdmConfig;
use crate::datagram::{DatagramHeader, PeerId};
use crate::message_dispatcher::MessageDispatcher;
use crate::socket::DatagramSocket;
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

pub fn test_config() -> RdmConfig {
    RdmConfig {
        max_message_size: 64 * 1024,
        receive_window_size: 1024,
        retransmit_timeout: Duration::from_millis(100),
        sweep_interval: Duration::from_millis(5),
        heartbeat_interval: Duration::from_millis(20),
        connect_retry_interval: Duration::from_millis(50),
        connect_timeout: Duration::from_millis(500),
        peer_idle_timeout: Some(Duration::from_secs(1)),
        ..RdmConfig::default()
    }
}

pub fn test_addr(number: u8) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, number], 4000 + number as u16))
}

/// An in-memory [DatagramSocket] that records sent datagrams and serves received datagrams from
///  a queue. A receive on an empty queue waits until something is pushed.
pub struct TrackingSocket {
    local_addr: SocketAddr,
    sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
    send_failures: Mutex<Vec<io::ErrorKind>>,
    incoming_tx: mpsc::UnboundedSender<io::Result<(SocketAddr, Vec<u8>)>>,
    incoming_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<io::Result<(SocketAddr, Vec<u8>)>>>,
    num_resets: AtomicUsize,
}

impl TrackingSocket {
    pub fn new() -> TrackingSocket {
        TrackingSocket::with_local_addr(SocketAddr::from(([127, 0, 0, 1], 9000)))
    }

    pub fn with_local_addr(local_addr: SocketAddr) -> TrackingSocket {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        TrackingSocket {
            local_addr,
            sent: Default::default(),
            send_failures: Default::default(),
            incoming_tx,
            incoming_rx: tokio::sync::Mutex::new(incoming_rx),
            num_resets: AtomicUsize::new(0),
        }
    }

    pub fn sent(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn take_sent(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    pub fn sent_headers(&self) -> Vec<(SocketAddr, DatagramHeader)> {
        self.sent().into_iter()
            .map(|(to, buf)| (to, DatagramHeader::deser(&mut buf.as_slice()).unwrap()))
            .collect()
    }

    pub fn num_resets(&self) -> usize {
        self.num_resets.load(Ordering::Acquire)
    }

    pub fn fail_next_send(&self, kind: io::ErrorKind) {
        self.send_failures.lock().unwrap().push(kind);
    }

    pub fn push_incoming(&self, from: SocketAddr, buf: Vec<u8>) {
        self.incoming_tx.send(Ok((from, buf))).unwrap();
    }

    pub fn push_incoming_error(&self, kind: io::ErrorKind) {
        self.incoming_tx.send(Err(io::Error::from(kind))).unwrap();
    }
}

#[async_trait]
impl DatagramSocket for TrackingSocket {
    async fn send_to(&self, to: SocketAddr, buf: &[u8]) -> io::Result<usize> {
        if let Some(kind) = self.send_failures.lock().unwrap().pop() {
            return Err(io::Error::from(kind));
        }
        self.sent.lock().unwrap().push((to, buf.to_vec()));
        Ok(buf.len())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        // the sender is held by self, so this never returns None
        let Some(incoming) = self.incoming_rx.lock().await.recv().await else {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        };
        let (from, data) = incoming?;
        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        Ok((len, from))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local_addr)
    }

    fn reset(&self) -> io::Result<()> {
        self.num_resets.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

/// Records all dispatched messages in order
#[derive(Default)]
pub struct CollectingDispatcher {
    messages: Mutex<Vec<(PeerId, SocketAddr, Vec<u8>)>>,
}

impl CollectingDispatcher {
    pub fn messages(&self) -> Vec<(PeerId, SocketAddr, Vec<u8>)> {
        self.messages.lock().unwrap().clone()
    }

    /// Wait until at least `n` messages were dispatched, panicking after a generous timeout
    pub async fn wait_for(&self, n: usize) -> Vec<(PeerId, SocketAddr, Vec<u8>)> {
        tokio::time::timeout(Duration::from_secs(10), async {
            while self.messages.lock().unwrap().len() < n {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }).await.unwrap();
        self.messages()
    }
}

#[async_trait]
impl MessageDispatcher for CollectingDispatcher {
    async fn on_message(&self, peer_id: PeerId, sender_addr: SocketAddr, message: Vec<u8>) {
        self.messages.lock().unwrap().push((peer_id, sender_addr, message));
    }
}
