use crate::buffers::datagram_pool::{DatagramPool, PoolStats};
use crate::config::RdmConfig;
use crate::message_dispatcher::{delivery_loop, Delivery, MessageDispatcher};
use crate::socket::{receive_loop, DatagramHandler, DatagramSocket, SocketAdapter};
use crate::sweeper::{run_sweeper, PeerSet};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// The parts shared by both kinds of end point: socket, pool, delivery to the application and
///  the background tasks, which all stop when the end point is shut down or dropped.
pub(crate) struct EndPointCore {
    pub config: Arc<RdmConfig>,
    pub pool: Arc<DatagramPool>,
    pub socket: Arc<SocketAdapter>,
    pub deliveries: mpsc::Sender<Delivery>,
    shutdown: watch::Sender<bool>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl EndPointCore {
    pub async fn bind_udp(config: &RdmConfig) -> anyhow::Result<Arc<dyn DatagramSocket>> {
        let socket = UdpSocket::bind(config.self_addr).await?;
        info!("bound UDP socket to {:?}", socket.local_addr()?);
        Ok(Arc::new(socket))
    }

    /// Set up the end point, starting the delivery task. Receiving starts with [EndPointCore::start].
    pub fn new(config: RdmConfig, socket: Arc<dyn DatagramSocket>, dispatcher: Arc<dyn MessageDispatcher>) -> anyhow::Result<EndPointCore> {
        config.validate()?;

        let config = Arc::new(config);
        let (shutdown, _) = watch::channel(false);
        let (deliveries, deliveries_rx) = mpsc::channel(config.delivery_queue_len);

        let delivery_task = tokio::spawn(delivery_loop(deliveries_rx, dispatcher, shutdown.subscribe()));

        Ok(EndPointCore {
            pool: Arc::new(DatagramPool::new(config.buffer_pool_size)),
            socket: Arc::new(SocketAdapter::new(socket)),
            deliveries,
            shutdown,
            tasks: std::sync::Mutex::new(vec![delivery_task]),
            config,
        })
    }

    pub fn start(&self, handler: Arc<dyn DatagramHandler>, peer_set: Arc<dyn PeerSet>) {
        let mut tasks = self.tasks.lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        for worker in 0..self.config.receive_workers {
            tasks.push(tokio::spawn(receive_loop(
                worker,
                self.socket.clone(),
                self.pool.clone(),
                handler.clone(),
                self.shutdown.subscribe(),
            )));
        }
        tasks.push(tokio::spawn(run_sweeper(peer_set, self.config.clone(), self.shutdown.subscribe())));
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Stop all background tasks and wait for them to terminate
    pub async fn shutdown(&self) {
        info!("shutting down end point");
        self.shutdown.send_replace(true);

        let tasks = std::mem::take(&mut *self.tasks.lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner));
        for task in tasks {
            if let Err(e) = task.await {
                warn!("background task terminated abnormally: {}", e);
            }
        }
    }
}

impl Drop for EndPointCore {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}
