use crate::buffers::datagram_pool::{DatagramPool, PoolStats};
use crate::config::RdmConfig;
use crate::control;
use crate::datagram::{Datagram, PeerId};
use crate::end_point::EndPointCore;
use crate::message_dispatcher::{Delivery, MessageDispatcher};
use crate::peer::Peer;
use crate::seq::SeqNo;
use crate::socket::{DatagramHandler, DatagramSocket, SocketAdapter};
use crate::sweeper::PeerSet;
use anyhow::bail;
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, trace, warn};

/// The accepting side of the protocol: Assigns an identity to each peer that sends a connect
///  request, and keeps per-peer state keyed by that identity. Traffic is routed by identity
///  rather than network address, so peers may change their address.
pub struct AcceptingEndPoint {
    core: EndPointCore,
    inner: Arc<AcceptingInner>,
}

impl AcceptingEndPoint {
    pub async fn bind(config: RdmConfig, dispatcher: Arc<dyn MessageDispatcher>) -> anyhow::Result<AcceptingEndPoint> {
        let socket = EndPointCore::bind_udp(&config).await?;
        AcceptingEndPoint::with_socket(config, socket, dispatcher).await
    }

    pub async fn with_socket(config: RdmConfig, socket: Arc<dyn DatagramSocket>, dispatcher: Arc<dyn MessageDispatcher>) -> anyhow::Result<AcceptingEndPoint> {
        let core = EndPointCore::new(config, socket, dispatcher)?;

        let inner = Arc::new(AcceptingInner {
            config: core.config.clone(),
            pool: core.pool.clone(),
            socket: core.socket.clone(),
            deliveries: core.deliveries.clone(),
            peers: Default::default(),
            id_counter: AtomicU32::new(0),
        });
        core.start(inner.clone(), inner.clone());

        info!("accepting connections on {:?}", core.local_addr()?);
        Ok(AcceptingEndPoint { core, inner })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.core.local_addr()
    }

    /// Send a message to a connected peer. Delivery is reliable and in order as long as the
    ///  peer stays reachable; there is no confirmation of delivery.
    pub async fn send(&self, peer_id: PeerId, message: &[u8]) -> anyhow::Result<()> {
        if self.core.is_shut_down() {
            bail!("end point is shut down");
        }
        let Some(peer) = self.inner.get_peer(peer_id).await else {
            bail!("unknown peer {}", peer_id);
        };
        peer.send_message(message).await
    }

    /// the identities of all currently known peers, in ascending order
    pub async fn peers(&self) -> Vec<PeerId> {
        let mut result = self.inner.peers.read().await
            .by_id
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        result.sort();
        result
    }

    pub async fn peer_addr(&self, peer_id: PeerId) -> Option<SocketAddr> {
        match self.inner.get_peer(peer_id).await {
            Some(peer) => Some(peer.remote_endpoint().await),
            None => None,
        }
    }

    /// number of datagrams sent to a peer that are not acknowledged yet
    pub async fn num_outstanding_sends(&self, peer_id: PeerId) -> Option<usize> {
        match self.inner.get_peer(peer_id).await {
            Some(peer) => Some(peer.num_outstanding_sends().await),
            None => None,
        }
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.core.pool_stats()
    }

    pub async fn shutdown(&self) {
        self.core.shutdown().await;
    }
}

#[derive(Default)]
struct PeerTable {
    by_id: FxHashMap<PeerId, Arc<Peer>>,
    /// Peers by the address of their connect request, as long as they may still be fresh.
    ///  This is what answers a repeated connect request without touching per-peer locks.
    by_connect_addr: FxHashMap<SocketAddr, PeerId>,
}

struct AcceptingInner {
    config: Arc<RdmConfig>,
    pool: Arc<DatagramPool>,
    socket: Arc<SocketAdapter>,
    deliveries: mpsc::Sender<Delivery>,
    peers: RwLock<PeerTable>,
    id_counter: AtomicU32,
}

impl AcceptingInner {
    async fn get_peer(&self, peer_id: PeerId) -> Option<Arc<Peer>> {
        self.peers.read().await
            .by_id
            .get(&peer_id)
            .cloned()
    }

    /// Identities are allocated round robin, skipping those that are still in use
    fn allocate_id(&self, peers: &FxHashMap<PeerId, Arc<Peer>>) -> Option<PeerId> {
        for _ in 0..PeerId::MAX.to_raw() {
            let candidate = PeerId::from_counter(self.id_counter.fetch_add(1, Ordering::AcqRel));
            if !peers.contains_key(&candidate) {
                return Some(candidate);
            }
        }
        None
    }

    /// The peer table lock is held only briefly and never across an await, so connect
    ///  requests do not depend on any individual peer being responsive
    async fn on_connect_request(&self, from: SocketAddr) {
        let Ok(mut peers) = timeout(self.config.lock_timeout, self.peers.write()).await else {
            debug!("peer table busy - dropping connect request from {:?}, the peer will retry", from);
            return;
        };
        let table = &mut *peers;

        let repeated = match table.by_connect_addr.get(&from).and_then(|peer_id| table.by_id.get(peer_id)) {
            Some(peer) if peer.is_fresh() => Some(peer.id()),
            _ => None,
        };

        let peer_id = match repeated {
            Some(peer_id) => {
                debug!("repeated connect request from {:?} - re-sending identity {}", from, peer_id);
                peer_id
            }
            None => {
                let Some(peer_id) = self.allocate_id(&table.by_id) else {
                    warn!("no free peer identity - dropping connect request from {:?}", from);
                    return;
                };
                table.by_id.insert(peer_id, Arc::new(Peer::new(
                    peer_id,
                    from,
                    SeqNo::ZERO,
                    SeqNo::ZERO,
                    self.config.clone(),
                    self.pool.clone(),
                    self.socket.clone(),
                )));
                table.by_connect_addr.insert(from, peer_id);
                info!("accepted peer {} from {:?}", peer_id, from);
                peer_id
            }
        };
        drop(peers);

        let reply = control::connect_reply(&self.pool, peer_id, SeqNo::ZERO);
        let _ = self.socket.send_datagram(from, &reply).await;
        self.pool.return_to_pool(reply);
    }
}

#[async_trait]
impl DatagramHandler for AcceptingInner {
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

        if control::is_connect_request(&header) {
            self.pool.return_to_pool(datagram);
            self.on_connect_request(from).await;
            return;
        }

        let Some(peer) = self.get_peer(header.id).await else {
            debug!("datagram for unknown peer {} from {:?} - dropping", header.id, from);
            self.pool.return_to_pool(datagram);
            return;
        };

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
impl PeerSet for AcceptingInner {
    async fn peers(&self) -> Vec<Arc<Peer>> {
        let Ok(peers) = timeout(self.config.lock_timeout, self.peers.read()).await else {
            debug!("peer table busy - skipping this sweep");
            return Vec::new();
        };
        peers.by_id.values().cloned().collect()
    }

    async fn evict_idle(&self, now: Instant) {
        let Some(idle_timeout) = self.config.peer_idle_timeout else {
            return;
        };

        let Ok(peers) = timeout(self.config.lock_timeout, self.peers.read()).await else {
            debug!("peer table busy - skipping eviction");
            return;
        };
        let candidates = peers.by_id.values().cloned().collect::<Vec<_>>();
        drop(peers);

        let mut idle = Vec::new();
        for peer in candidates {
            if let Some(idle_for) = peer.idle_for(now).await {
                if idle_for > idle_timeout {
                    idle.push(peer.id());
                }
            }
        }
        if idle.is_empty() {
            return;
        }

        let Ok(mut peers) = timeout(self.config.lock_timeout, self.peers.write()).await else {
            debug!("peer table busy - skipping eviction");
            return;
        };
        let table = &mut *peers;
        let evicted = idle.into_iter()
            .flat_map(|peer_id| table.by_id.remove(&peer_id))
            .collect::<Vec<_>>();
        table.by_connect_addr.retain(|_, peer_id| table.by_id.contains_key(peer_id));
        drop(peers);

        for peer in evicted {
            info!("evicting peer {} after {:?} of silence", peer.id(), idle_timeout);
            peer.release().await;
        }
    }
}
