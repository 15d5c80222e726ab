use crate::buffers::datagram_pool::DatagramPool;
use crate::datagram::Datagram;
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::watch;
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;

/// This is an abstraction for the raw datagram primitive of the operating system, introduced to
///  facilitate replacing the I/O part for testing
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    async fn send_to(&self, to: SocketAddr, buf: &[u8]) -> io::Result<usize>;

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Clear a pending asynchronous error (e.g. an ICMP 'port unreachable' reported for an
    ///  earlier send) so it is not surfaced again for subsequent unrelated operations
    fn reset(&self) -> io::Result<()>;
}

#[async_trait]
impl DatagramSocket for UdpSocket {
    async fn send_to(&self, to: SocketAddr, buf: &[u8]) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, to).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }

    fn reset(&self) -> io::Result<()> {
        if let Some(pending) = self.take_error()? {
            debug!("cleared pending socket error: {}", pending);
        }
        Ok(())
    }
}

/// The classes of transport errors that are handled differently
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TransportErrorKind {
    /// The peer's port is (or was) unreachable, typically reported through ICMP for a peer that
    ///  went away. Some platforms keep reporting this for unrelated operations until the
    ///  socket is reset.
    PortUnreachable,
    Other,
}

impl TransportErrorKind {
    pub fn classify(e: &io::Error) -> TransportErrorKind {
        match e.kind() {
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused => TransportErrorKind::PortUnreachable,
            _ => TransportErrorKind::Other,
        }
    }
}

/// Wraps a [DatagramSocket], handling transport errors: 'port unreachable' errors trigger a
///  socket reset, all other errors are logged. No error is fatal.
pub struct SocketAdapter {
    socket: Arc<dyn DatagramSocket>,
}

impl SocketAdapter {
    pub fn new(socket: Arc<dyn DatagramSocket>) -> SocketAdapter {
        SocketAdapter { socket }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub async fn send_datagram(&self, to: SocketAddr, datagram: &Datagram) -> Result<(), TransportErrorKind> {
        trace!("sending {:?} to {:?}", datagram, to);

        match self.socket.send_to(to, datagram.as_ref()).await {
            Ok(_) => Ok(()),
            Err(e) => Err(self.on_transport_error(Some(to), &e)),
        }
    }

    /// Receive a datagram into the given buffer, returning the sender's address
    pub async fn receive_datagram(&self, datagram: &mut Datagram) -> Result<SocketAddr, TransportErrorKind> {
        datagram.clear();
        match self.socket.recv_from(datagram.receive_buffer()).await {
            Ok((len, from)) => {
                datagram.set_received_len(len);
                Ok(from)
            }
            Err(e) => Err(self.on_transport_error(None, &e)),
        }
    }

    fn on_transport_error(&self, peer: Option<SocketAddr>, e: &io::Error) -> TransportErrorKind {
        let kind = TransportErrorKind::classify(e);
        match kind {
            TransportErrorKind::PortUnreachable => {
                debug!("peer port unreachable ({:?}): {} - resetting socket", peer, e);
                if let Err(reset_error) = self.socket.reset() {
                    warn!("error resetting socket: {}", reset_error);
                }
            }
            TransportErrorKind::Other => {
                error!("socket error ({:?}): {}", peer, e);
            }
        }
        kind
    }
}

/// Processing of received datagrams. Implementations take ownership of the datagram and are
///  responsible for returning it to the pool.
#[async_trait]
pub trait DatagramHandler: Send + Sync + 'static {
    async fn on_datagram(&self, from: SocketAddr, datagram: Datagram);
}

/// Continuously receives datagrams until shutdown is signalled, re-issuing a receive
///  immediately after each completed one. Several of these loops can run on the same socket
///  concurrently.
pub async fn receive_loop(
    worker: usize,
    socket: Arc<SocketAdapter>,
    pool: Arc<DatagramPool>,
    handler: Arc<dyn DatagramHandler>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("starting receive loop #{}", worker);

    loop {
        if *shutdown.borrow() {
            break;
        }

        let mut datagram = pool.rent();
        let received = select! {
            _ = shutdown.changed() => None,
            result = socket.receive_datagram(&mut datagram) => Some(result),
        };

        let from = match received {
            None => {
                pool.return_to_pool(datagram);
                break;
            }
            Some(Err(_)) => {
                // logged by the adapter
                pool.return_to_pool(datagram);
                continue;
            }
            Some(Ok(from)) => from,
        };

        let correlation_id = Uuid::new_v4();
        let span = span!(Level::TRACE, "datagram_received", ?correlation_id, ?from);
        handler.on_datagram(from, datagram)
            .instrument(span)
            .await;
    }

    info!("receive loop #{} terminated", worker);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datagram::{DatagramHeader, DatagramKind, PeerId};
    use crate::test_util::TrackingSocket;
    use rstest::rstest;

    #[rstest]
    #[case::reset(io::ErrorKind::ConnectionReset, TransportErrorKind::PortUnreachable)]
    #[case::refused(io::ErrorKind::ConnectionRefused, TransportErrorKind::PortUnreachable)]
    #[case::would_block(io::ErrorKind::WouldBlock, TransportErrorKind::Other)]
    #[case::other(io::ErrorKind::Other, TransportErrorKind::Other)]
    fn test_classify(#[case] io_kind: io::ErrorKind, #[case] expected: TransportErrorKind) {
        assert_eq!(TransportErrorKind::classify(&io::Error::from(io_kind)), expected);
    }

    fn datagram() -> Datagram {
        Datagram::from_parts(&DatagramHeader { kind: DatagramKind::SINGLE_FRAGMENT, id: PeerId::new(2).unwrap(), seq: 1 }, &[1, 2])
    }

    #[tokio::test]
    async fn test_send_ok() {
        let socket = Arc::new(TrackingSocket::new());
        let adapter = SocketAdapter::new(socket.clone());

        let to = SocketAddr::from(([1, 2, 3, 4], 5));
        assert_eq!(adapter.send_datagram(to, &datagram()).await, Ok(()));

        assert_eq!(socket.sent(), vec![(to, datagram().as_ref().to_vec())]);
        assert_eq!(socket.num_resets(), 0);
    }

    #[rstest]
    #[case::port_unreachable(io::ErrorKind::ConnectionReset, TransportErrorKind::PortUnreachable, 1)]
    #[case::other(io::ErrorKind::PermissionDenied, TransportErrorKind::Other, 0)]
    #[tokio::test]
    async fn test_send_error(#[case] io_kind: io::ErrorKind, #[case] expected: TransportErrorKind, #[case] expected_resets: usize) {
        let socket = Arc::new(TrackingSocket::new());
        socket.fail_next_send(io_kind);
        let adapter = SocketAdapter::new(socket.clone());

        let to = SocketAddr::from(([1, 2, 3, 4], 5));
        assert_eq!(adapter.send_datagram(to, &datagram()).await, Err(expected));
        assert_eq!(socket.num_resets(), expected_resets);

        // the adapter keeps operating
        assert_eq!(adapter.send_datagram(to, &datagram()).await, Ok(()));
    }

    struct CollectingHandler {
        pool: Arc<DatagramPool>,
        received: std::sync::Mutex<Vec<(SocketAddr, Vec<u8>)>>,
    }

    #[async_trait]
    impl DatagramHandler for CollectingHandler {
        async fn on_datagram(&self, from: SocketAddr, datagram: Datagram) {
            self.received.lock().unwrap().push((from, datagram.as_ref().to_vec()));
            self.pool.return_to_pool(datagram);
        }
    }

    #[tokio::test]
    async fn test_receive_loop_until_shutdown() {
        let socket = Arc::new(TrackingSocket::new());
        let from = SocketAddr::from(([5, 6, 7, 8], 9));
        socket.push_incoming(from, vec![5, 0, 0, 1, 0, 0, 0, 1, 42]);
        socket.push_incoming_error(io::ErrorKind::ConnectionReset);
        socket.push_incoming(from, vec![5, 0, 0, 1, 0, 0, 0, 2, 43]);

        let pool = Arc::new(DatagramPool::new(8));
        let handler = Arc::new(CollectingHandler { pool: pool.clone(), received: Default::default() });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(receive_loop(0, Arc::new(SocketAdapter::new(socket.clone())), pool.clone(), handler.clone(), shutdown_rx));

        while handler.received.lock().unwrap().len() < 2 {
            tokio::task::yield_now().await;
        }
        shutdown_tx.send_replace(true);
        handle.await.unwrap();

        assert_eq!(handler.received.lock().unwrap().clone(), vec![
            (from, vec![5, 0, 0, 1, 0, 0, 0, 1, 42]),
            (from, vec![5, 0, 0, 1, 0, 0, 0, 2, 43]),
        ]);
        assert_eq!(socket.num_resets(), 1);
    }
}
