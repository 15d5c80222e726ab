use crate::buffers::datagram_pool::{DatagramPool, PoolStats};
use crate::config::RdmConfig;
use crate::control;
use crate::datagram::{Datagram, DatagramHeader, PeerId};
use crate::end_point::EndPointCore;
use crate::message_dispatcher::{Delivery, MessageDispatcher};
use crate::peer::Peer;
use crate::seq::SeqNo;
use crate::socket::{DatagramHandler, DatagramSocket, SocketAdapter};
use crate::sweeper::PeerSet;
use anyhow::bail;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::select;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, trace, warn};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// with the identity assigned by the accepting side
    Connected(PeerId),
}

enum Connection {
    Disconnected,
    Connecting { server_addr: SocketAddr },
    Connected { peer: Arc<Peer> },
}

/// The initiating side of the protocol, talking to a single accepting end point. It requests an
///  identity on [InitiatingEndPoint::connect] and uses it for all subsequent traffic.
pub struct InitiatingEndPoint {
    core: EndPointCore,
    inner: Arc<InitiatingInner>,
}

impl InitiatingEndPoint {
    pub async fn bind(config: RdmConfig, dispatcher: Arc<dyn MessageDispatcher>) -> anyhow::Result<InitiatingEndPoint> {
        let socket = EndPointCore::bind_udp(&config).await?;
        InitiatingEndPoint::with_socket(config, socket, dispatcher).await
    }

    pub async fn with_socket(config: RdmConfig, socket: Arc<dyn DatagramSocket>, dispatcher: Arc<dyn MessageDispatcher>) -> anyhow::Result<InitiatingEndPoint> {
        let core = EndPointCore::new(config, socket, dispatcher)?;

        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let inner = Arc::new(InitiatingInner {
            config: core.config.clone(),
            pool: core.pool.clone(),
            socket: core.socket.clone(),
            deliveries: core.deliveries.clone(),
            connection: RwLock::new(Connection::Disconnected),
            state,
        });
        core.start(inner.clone(), inner.clone());

        Ok(InitiatingEndPoint { core, inner })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.core.local_addr()
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Notifies about every state change
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Request an identity from the accepting end point at `server_addr`, re-sending the request
    ///  until a reply arrives or the connect timeout expires.
    pub async fn connect(&self, server_addr: SocketAddr) -> anyhow::Result<PeerId> {
        if self.core.is_shut_down() {
            bail!("end point is shut down");
        }

        {
            let mut connection = self.inner.connection.write().await;
            match &*connection {
                Connection::Disconnected => {}
                Connection::Connecting { server_addr } => bail!("already connecting to {:?}", server_addr),
                Connection::Connected { peer } => bail!("already connected as {}", peer.id()),
            }
            *connection = Connection::Connecting { server_addr };
            self.inner.state.send_replace(ConnectionState::Connecting);
        }
        info!("connecting to {:?}", server_addr);

        let connect_timeout = self.inner.config.connect_timeout;
        match timeout(connect_timeout, self.inner.do_connect(server_addr)).await {
            Ok(Ok(peer_id)) => Ok(peer_id),
            Ok(Err(e)) => {
                self.inner.abort_connecting().await;
                Err(e)
            }
            Err(_) => {
                self.inner.abort_connecting().await;
                bail!("no reply from {:?} within {:?}", server_addr, connect_timeout)
            }
        }
    }

    /// Drop the connection locally. Unacknowledged messages are discarded, and the accepting
    ///  side eventually evicts this peer.
    pub async fn disconnect(&self) {
        let previous = std::mem::replace(&mut *self.inner.connection.write().await, Connection::Disconnected);
        self.inner.state.send_replace(ConnectionState::Disconnected);

        if let Connection::Connected { peer } = previous {
            info!("disconnecting peer {}", peer.id());
            peer.release().await;
        }
    }

    pub async fn send(&self, message: &[u8]) -> anyhow::Result<()> {
        if self.core.is_shut_down() {
            bail!("end point is shut down");
        }
        let Some(peer) = self.inner.connected_peer().await else {
            bail!("not connected");
        };
        peer.send_message(message).await
    }

    /// the accepting end point's address as currently known
    pub async fn server_addr(&self) -> Option<SocketAddr> {
        match &*self.inner.connection.read().await {
            Connection::Disconnected => None,
            Connection::Connecting { server_addr } => Some(*server_addr),
            Connection::Connected { peer } => Some(peer.remote_endpoint().await),
        }
    }

    pub async fn num_outstanding_sends(&self) -> usize {
        match self.inner.connected_peer().await {
            Some(peer) => peer.num_outstanding_sends().await,
            None => 0,
        }
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.core.pool_stats()
    }

    pub async fn shutdown(&self) {
        self.core.shutdown().await;
    }
}

struct InitiatingInner {
    config: Arc<RdmConfig>,
    pool: Arc<DatagramPool>,
    socket: Arc<SocketAdapter>,
    deliveries: mpsc::Sender<Delivery>,
    connection: RwLock<Connection>,
    state: watch::Sender<ConnectionState>,
}

impl InitiatingInner {
    async fn connected_peer(&self) -> Option<Arc<Peer>> {
        match &*self.connection.read().await {
            Connection::Connected { peer } => Some(peer.clone()),
            _ => None,
        }
    }

    async fn do_connect(&self, server_addr: SocketAddr) -> anyhow::Result<PeerId> {
        let mut state = self.state.subscribe();
        loop {
            match *state.borrow_and_update() {
                ConnectionState::Connected(peer_id) => return Ok(peer_id),
                ConnectionState::Disconnected => bail!("connect was aborted"),
                ConnectionState::Connecting => {}
            }

            trace!("sending connect request to {:?}", server_addr);
            let request = control::connect_request(&self.pool);
            let _ = self.socket.send_datagram(server_addr, &request).await;
            self.pool.return_to_pool(request);

            select! {
                _ = sleep(self.config.connect_retry_interval) => {
                    debug!("no connect reply from {:?} yet - retrying", server_addr);
                }
                changed = state.changed() => changed?,
            }
        }
    }

    async fn abort_connecting(&self) {
        let mut connection = self.connection.write().await;
        if let Connection::Connecting { .. } = &*connection {
            *connection = Connection::Disconnected;
            self.state.send_replace(ConnectionState::Disconnected);
        }
    }

    async fn on_connect_reply(&self, from: SocketAddr, header: &DatagramHeader) {
        let Ok(mut connection) = timeout(self.config.lock_timeout, self.connection.write()).await else {
            debug!("connection busy - dropping connect reply from {:?}", from);
            return;
        };
        let Connection::Connecting { server_addr } = &*connection else {
            return;
        };
        if *server_addr != from {
            debug!("connect reply from {:?} while connecting to {:?} - dropping", from, server_addr);
            return;
        }

        let receive_baseline = SeqNo::from_raw(header.seq as u64);
        let peer = Arc::new(Peer::new(
            header.id,
            from,
            SeqNo::ZERO,
            receive_baseline,
            self.config.clone(),
            self.pool.clone(),
            self.socket.clone(),
        ));
        *connection = Connection::Connected { peer };
        self.state.send_replace(ConnectionState::Connected(header.id));
        info!("connected to {:?} as {}, ack baseline #{}", from, header.id, receive_baseline);
    }
}

#[async_trait]
impl DatagramHandler for InitiatingInner {
    async fn on_datagram(&self, from: SocketAddr, datagram: Datagram) {
        let header = match datagram.header() {
            Ok(header) => header,
            Err(e) => {
                warn!("received malformed datagram from {:?} - dropping: {}", from, e);
                self.pool.return_to_pool(datagram);
                return;
            }
        };
        trace!("received {:?}", header);

        if !header.id.is_assigned() {
            debug!("unexpected datagram without identity from {:?} - dropping", from);
            self.pool.return_to_pool(datagram);
            return;
        }

        let peer = match &*self.connection.read().await {
            Connection::Disconnected => None,
            Connection::Connecting { .. } => {
                if header.kind.is_command() {
                    // upgrade to the write lock outside of this match
                    None
                }
                else {
                    debug!("data datagram while connecting - dropping");
                    self.pool.return_to_pool(datagram);
                    return;
                }
            }
            Connection::Connected { peer } => Some(peer.clone()),
        };

        let Some(peer) = peer else {
            if header.kind.is_command() {
                self.on_connect_reply(from, &header).await;
            }
            else {
                debug!("datagram while disconnected - dropping");
            }
            self.pool.return_to_pool(datagram);
            return;
        };

        if peer.id() != header.id {
            debug!("datagram for {} while connected as {} - dropping", header.id, peer.id());
            self.pool.return_to_pool(datagram);
            return;
        }

        if header.kind.is_command() {
            self.pool.return_to_pool(datagram);
            peer.on_heartbeat(from, &header).await;
        }
        else {
            peer.on_inbound(from).await;
            peer.on_data(from, &header, datagram, &self.deliveries).await;
        }
    }
}

#[async_trait]
impl PeerSet for InitiatingInner {
    async fn peers(&self) -> Vec<Arc<Peer>> {
        self.connected_peer().await
            .into_iter()
            .collect()
    }

    /// The initiating side keeps its connection until it is explicitly disconnected
    async fn evict_idle(&self, _now: Instant) {}
}
