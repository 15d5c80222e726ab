use crate::buffers::datagram_pool::DatagramPool;
use crate::config::RdmConfig;
use crate::control;
use crate::datagram::{Datagram, DatagramHeader, PeerId};
use crate::fragmentation::fragment;
use crate::message_dispatcher::Delivery;
use crate::reassembly::{InsertOutcome, ReassemblyTable};
use crate::seq::SeqNo;
use crate::socket::SocketAdapter;
use anyhow::bail;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, trace, warn};

/// The send side of a peer connection, and the peer's network address
pub(crate) struct PeerState {
    /// the peer's observed address - it can change if the peer rebinds, e.g. due to NAT
    remote_endpoint: SocketAddr,

    /// Datagrams that were sent but not acknowledged yet.
    ///
    /// NB: This is ordered by sequence number, and since datagrams are sent in sequence order,
    ///      it is ordered by time of first transmission as well
    outstanding_sends: VecDeque<(SeqNo, Datagram)>,

    highest_sent_seq: SeqNo,
    highest_acked_seq: SeqNo,
    last_received_at: Instant,
}

impl PeerState {
    /// liveness and address bookkeeping for any datagram received from the peer
    fn touch(&mut self, peer_id: PeerId, from: SocketAddr) {
        self.last_received_at = Instant::now();
        if self.remote_endpoint != from {
            info!("peer {} moved from {:?} to {:?}", peer_id, self.remote_endpoint, from);
            self.remote_endpoint = from;
        }
    }
}

/// Per-peer connection state, shared by the receive loops and the sweeper. Send state and
///  reassembly are guarded by separate locks, so sending and receiving do not contend.
pub struct Peer {
    id: PeerId,
    state: Mutex<PeerState>,
    reassembly: Mutex<ReassemblyTable>,
    /// cleared on the first data datagram in either direction
    fresh: AtomicBool,

    config: Arc<RdmConfig>,
    pool: Arc<DatagramPool>,
    socket: Arc<SocketAdapter>,
}

impl Peer {
    /// `send_baseline` is the sequence number before the first data datagram sent to the peer,
    ///  `receive_baseline` the one before the first data datagram expected from the peer.
    pub fn new(
        id: PeerId,
        remote_endpoint: SocketAddr,
        send_baseline: SeqNo,
        receive_baseline: SeqNo,
        config: Arc<RdmConfig>,
        pool: Arc<DatagramPool>,
        socket: Arc<SocketAdapter>,
    ) -> Peer {
        let state = PeerState {
            remote_endpoint,
            outstanding_sends: VecDeque::new(),
            highest_sent_seq: send_baseline,
            highest_acked_seq: send_baseline,
            last_received_at: Instant::now(),
        };
        let reassembly = ReassemblyTable::new(receive_baseline, config.receive_window_size, config.max_message_size);

        Peer {
            id,
            state: Mutex::new(state),
            reassembly: Mutex::new(reassembly),
            fresh: AtomicBool::new(true),
            config,
            pool,
            socket,
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub async fn remote_endpoint(&self) -> SocketAddr {
        self.state.lock().await.remote_endpoint
    }

    pub async fn num_outstanding_sends(&self) -> usize {
        self.state.lock().await.outstanding_sends.len()
    }

    pub async fn highest_sent_seq(&self) -> SeqNo {
        self.state.lock().await.highest_sent_seq
    }

    pub async fn highest_acked_seq(&self) -> SeqNo {
        self.state.lock().await.highest_acked_seq
    }

    /// the last sequence number received from the peer and consumed in order
    pub async fn ack_seq(&self) -> SeqNo {
        self.reassembly.lock().await.ack_seq()
    }

    /// `true` while no data was exchanged in either direction. A repeated connect request
    ///  (e.g. after a lost reply) can safely be answered with this peer's identity.
    pub fn is_fresh(&self) -> bool {
        self.fresh.load(Ordering::Acquire)
    }

    /// Fragment a message and send all fragments, keeping them until they are acknowledged.
    ///
    /// NB: Transport errors are not reported here - the fragments stay in the outstanding queue
    ///      and are retransmitted like lost ones
    pub async fn send_message(&self, message: &[u8]) -> anyhow::Result<()> {
        if message.len() > self.config.max_message_size {
            bail!("message of {} bytes exceeds the maximum message size of {}", message.len(), self.config.max_message_size);
        }

        self.fresh.store(false, Ordering::Release);
        let mut state = self.state.lock().await;

        let fragments = fragment(&self.pool, self.id, state.highest_sent_seq.next(), message);
        debug!("sending message of {} bytes to {} ({:?}) in {} fragments", message.len(), self.id, state.remote_endpoint, fragments.len());

        let remote_endpoint = state.remote_endpoint;
        for (seq, mut datagram) in fragments {
            let _ = self.socket.send_datagram(remote_endpoint, &datagram).await;
            datagram.mark_sent(Instant::now());

            state.highest_sent_seq = seq;
            state.outstanding_sends.push_back((seq, datagram));
        }
        Ok(())
    }

    /// Liveness and address bookkeeping for any datagram received from the peer. This is
    ///  opportunistic: If the peer is busy, the update is skipped.
    pub async fn on_inbound(&self, from: SocketAddr) {
        let Ok(mut state) = timeout(self.config.lock_timeout, self.state.lock()).await else {
            debug!("peer {} busy - skipping address update", self.id);
            return;
        };
        state.touch(self.id, from);
    }

    /// Handle a heartbeat: the ack value it carries is cumulative, retiring all outstanding
    ///  datagrams up to and including it
    pub async fn on_heartbeat(&self, from: SocketAddr, header: &DatagramHeader) {
        let Ok(mut state) = timeout(self.config.lock_timeout, self.state.lock()).await else {
            debug!("peer {} busy - skipping heartbeat", self.id);
            return;
        };
        state.touch(self.id, from);

        let mut ack = SeqNo::from_wire(header.seq, state.highest_sent_seq);
        if ack > state.highest_sent_seq {
            warn!("peer {} acknowledged #{} which was never sent (highest sent is #{})", self.id, ack, state.highest_sent_seq);
            ack = state.highest_sent_seq;
        }

        let mut num_retired = 0;
        while let Some((seq, _)) = state.outstanding_sends.front() {
            if *seq > ack {
                break;
            }
            if let Some((_, datagram)) = state.outstanding_sends.pop_front() {
                self.pool.return_to_pool(datagram);
                num_retired += 1;
            }
        }
        if ack > state.highest_acked_seq {
            state.highest_acked_seq = ack;
        }
        trace!("heartbeat from {}: ack #{} retired {} datagrams", self.id, ack, num_retired);
    }

    /// Add a received data datagram to the reassembly table, queueing all messages that become
    ///  complete for delivery.
    ///
    /// NB: If the peer is busy, the datagram is dropped, and if the delivery queue is full,
    ///      complete messages stay in the table without being acknowledged. The sender
    ///      retransmits in both cases, and every retransmission retries the extraction.
    pub async fn on_data(&self, from: SocketAddr, header: &DatagramHeader, datagram: Datagram, deliveries: &mpsc::Sender<Delivery>) {
        let Ok(mut table) = timeout(self.config.lock_timeout, self.reassembly.lock()).await else {
            debug!("peer {} busy - dropping datagram #{}", self.id, header.seq);
            self.pool.return_to_pool(datagram);
            return;
        };

        let seq = SeqNo::from_wire(header.seq, table.expected_seq());
        match table.insert(seq, header.kind, datagram, &self.pool) {
            InsertOutcome::Inserted => self.fresh.store(false, Ordering::Release),
            InsertOutcome::Duplicate => {}
            InsertOutcome::OutOfWindow => return,
        }

        loop {
            // reserving before extraction keeps undeliverable messages in the table
            let permit = match deliveries.try_reserve() {
                Ok(permit) => permit,
                Err(TrySendError::Full(_)) => {
                    debug!("delivery queue full - postponing delivery of messages from {}", self.id);
                    return;
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("delivery queue closed - not delivering messages from {}", self.id);
                    return;
                }
            };
            let Some(message) = table.extract_next(&self.pool) else {
                return;
            };
            permit.send(Delivery {
                peer_id: self.id,
                sender_addr: from,
                message,
            });
        }
    }

    /// Resend outstanding datagrams whose last transmission is older than the retransmit
    ///  timeout. Returns the number of resent datagrams, or `None` if the peer was busy.
    pub async fn resend_expired(&self, now: Instant) -> Option<usize> {
        let Ok(mut state) = timeout(self.config.lock_timeout, self.state.lock()).await else {
            debug!("peer {} busy - skipping retransmission", self.id);
            return None;
        };

        let remote_endpoint = state.remote_endpoint;
        let retransmit_timeout = self.config.retransmit_timeout;

        let mut num_resent = 0;
        for (seq, datagram) in state.outstanding_sends.iter_mut() {
            if let Some(first_sent_at) = datagram.first_sent_at() {
                if now.saturating_duration_since(first_sent_at) < retransmit_timeout {
                    // first transmissions are ordered, so no later datagram can be due
                    break;
                }
            }
            if let Some(last_sent_at) = datagram.last_sent_at() {
                if now.saturating_duration_since(last_sent_at) < retransmit_timeout {
                    continue;
                }
            }

            trace!("resending #{} to {}", seq, self.id);
            let _ = self.socket.send_datagram(remote_endpoint, datagram).await;
            datagram.mark_sent(now);
            num_resent += 1;
        }

        if num_resent > 0 {
            debug!("resent {} datagrams to {} ({:?})", num_resent, self.id, remote_endpoint);
        }
        Some(num_resent)
    }

    /// Send a heartbeat carrying the current cumulative ack. Skipped if the peer is busy.
    pub async fn send_heartbeat(&self) {
        let Ok(table) = timeout(self.config.lock_timeout, self.reassembly.lock()).await else {
            debug!("peer {} busy - skipping heartbeat", self.id);
            return;
        };
        let ack_seq = table.ack_seq();
        drop(table);

        let Ok(state) = timeout(self.config.lock_timeout, self.state.lock()).await else {
            debug!("peer {} busy - skipping heartbeat", self.id);
            return;
        };
        let remote_endpoint = state.remote_endpoint;
        drop(state);

        trace!("sending heartbeat to {} with ack #{}", self.id, ack_seq);
        let datagram = control::heartbeat(&self.pool, self.id, ack_seq);
        let _ = self.socket.send_datagram(remote_endpoint, &datagram).await;
        self.pool.return_to_pool(datagram);
    }

    /// `None` if the peer is busy, which is anything but idle
    pub async fn idle_for(&self, now: Instant) -> Option<std::time::Duration> {
        let state = timeout(self.config.lock_timeout, self.state.lock()).await.ok()?;
        Some(now.saturating_duration_since(state.last_received_at))
    }

    #[cfg(test)]
    pub(crate) async fn lock_state(&self) -> tokio::sync::MutexGuard<'_, PeerState> {
        self.state.lock().await
    }

    /// Return all buffered datagrams to the pool when the peer is discarded
    pub async fn release(&self) {
        let mut state = self.state.lock().await;
        for (_, datagram) in state.outstanding_sends.drain(..) {
            self.pool.return_to_pool(datagram);
        }
        drop(state);

        self.reassembly.lock().await
            .clear(&self.pool);
    }
}
