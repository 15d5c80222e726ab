use crate::datagram::PeerId;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::select;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace};

/// The application's notification for reassembled messages. Messages from the same peer are
///  dispatched one at a time in the order they were sent.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageDispatcher: Send + Sync + 'static {
    async fn on_message(&self, peer_id: PeerId, sender_addr: SocketAddr, message: Vec<u8>);
}

/// A reassembled message on its way to the application
#[derive(Debug)]
pub struct Delivery {
    pub peer_id: PeerId,
    pub sender_addr: SocketAddr,
    pub message: Vec<u8>,
}

/// Messages are queued while the reassembly lock is held, so the queue's order is the order of
///  extraction. A single task drains the queue so the dispatcher sees that same order.
pub(crate) async fn delivery_loop(
    mut deliveries: mpsc::Receiver<Delivery>,
    dispatcher: Arc<dyn MessageDispatcher>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        let delivery = select! {
            _ = shutdown.changed() => break,
            delivery = deliveries.recv() => delivery,
        };

        match delivery {
            Some(delivery) => {
                trace!("dispatching message of {} bytes from {} ({:?})", delivery.message.len(), delivery.peer_id, delivery.sender_addr);
                dispatcher.on_message(delivery.peer_id, delivery.sender_addr, delivery.message).await;
            }
            None => {
                debug!("delivery queue closed");
                break;
            }
        }
    }
    info!("delivery loop terminated");
}
