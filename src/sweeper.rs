use crate::config::RdmConfig;
use crate::peer::Peer;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::select;
use tokio::sync::watch;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, trace};

/// The peers an end point currently has, as seen by the sweeper
#[async_trait]
pub trait PeerSet: Send + Sync + 'static {
    async fn peers(&self) -> Vec<Arc<Peer>>;

    /// Discard peers that were not heard from for longer than the configured idle timeout.
    ///  End points that do not expire peers leave this empty.
    async fn evict_idle(&self, now: Instant);
}

/// The end point's periodic housekeeping: Resends unacknowledged datagrams on every sweep
///  interval, and sends heartbeats and evicts idle peers on every heartbeat interval. Runs
///  until shutdown is signalled.
pub async fn run_sweeper(peer_set: Arc<dyn PeerSet>, config: Arc<RdmConfig>, mut shutdown: watch::Receiver<bool>) {
    info!("starting sweeper");

    let mut sweep_interval = interval(config.sweep_interval);
    sweep_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut heartbeat_interval = interval(config.heartbeat_interval);
    heartbeat_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if *shutdown.borrow() {
            break;
        }

        select! {
            _ = shutdown.changed() => break,
            _ = sweep_interval.tick() => {
                sweep(peer_set.as_ref()).await;
            }
            _ = heartbeat_interval.tick() => {
                for peer in peer_set.peers().await {
                    peer.send_heartbeat().await;
                }
                peer_set.evict_idle(Instant::now()).await;
            }
        }
    }

    info!("sweeper terminated");
}

async fn sweep(peer_set: &dyn PeerSet) {
    let now = Instant::now();
    for peer in peer_set.peers().await {
        match peer.resend_expired(now).await {
            Some(0) => {}
            Some(n) => trace!("sweep resent {} datagrams to {}", n, peer.id()),
            None => debug!("peer {} busy - will be swept next time", peer.id()),
        }
    }
}
