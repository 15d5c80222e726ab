use anyhow::bail;
use std::net::SocketAddr;
use std::time::Duration;

pub struct RdmConfig {
    /// The local address to bind the UDP socket to
    pub self_addr: SocketAddr,

    /// This is the number of datagrams that will be pooled at a given time - datagrams in excess
    ///  of this number are discarded when they are returned.
    pub buffer_pool_size: usize,

    /// Messages longer than this are rejected when sending, and reassembled messages exceeding
    ///  it are discarded
    pub max_message_size: usize,

    /// The number of fragments beyond the last delivered one that a receiver buffers. Datagrams
    ///  further ahead are dropped, to be retransmitted later.
    ///
    /// NB: This bounds the distance between the receiver's expectation and incoming sequence
    ///      numbers, which is what makes 32-bit sequence numbers on the wire unambiguous
    pub receive_window_size: u32,

    /// An outstanding datagram is re-sent when it was last sent longer ago than this.
    ///  Configure to well above the RTT plus the heartbeat interval, since acknowledgements are
    ///  piggybacked on heartbeats.
    pub retransmit_timeout: Duration,

    pub sweep_interval: Duration,

    pub heartbeat_interval: Duration,

    /// Bounded wait for per-peer locks; on timeout the peer is treated as busy and skipped
    pub lock_timeout: Duration,

    pub connect_retry_interval: Duration,
    pub connect_timeout: Duration,

    /// The accepting side discards peers it has not heard from for this long. `None` keeps peers
    ///  forever.
    pub peer_idle_timeout: Option<Duration>,

    /// number of concurrent receive loops on the socket
    pub receive_workers: usize,

    /// Bound for complete messages waiting to be handed to the application
    pub delivery_queue_len: usize,
}

impl Default for RdmConfig {
    fn default() -> Self {
        RdmConfig {
            self_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            buffer_pool_size: 4096,
            max_message_size: 16 * 1024 * 1024,
            receive_window_size: 65536,
            retransmit_timeout: Duration::from_millis(200),
            sweep_interval: Duration::from_millis(5),
            heartbeat_interval: Duration::from_millis(50),
            lock_timeout: Duration::from_millis(10),
            connect_retry_interval: Duration::from_millis(250),
            connect_timeout: Duration::from_secs(5),
            peer_idle_timeout: Some(Duration::from_secs(60)),
            receive_workers: 2,
            delivery_queue_len: 1024,
        }
    }
}

impl RdmConfig {
    /// Datagrams are never further apart than this in a well-behaved exchange; reconstruction of
    ///  full sequence numbers from the wire needs them to stay below 2^31
    pub const MAX_RECEIVE_WINDOW_SIZE: u32 = 1 << 30;

    pub fn with_self_addr(self_addr: SocketAddr) -> RdmConfig {
        RdmConfig {
            self_addr,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let intervals = [
            ("retransmit timeout", self.retransmit_timeout),
            ("sweep interval", self.sweep_interval),
            ("heartbeat interval", self.heartbeat_interval),
            ("lock timeout", self.lock_timeout),
            ("connect retry interval", self.connect_retry_interval),
            ("connect timeout", self.connect_timeout),
        ];
        for (name, value) in intervals {
            if value.is_zero() {
                bail!("{} must not be zero", name);
            }
        }

        if self.retransmit_timeout <= self.sweep_interval {
            bail!("retransmit timeout {:?} must be longer than the sweep interval {:?}", self.retransmit_timeout, self.sweep_interval);
        }
        if let Some(idle_timeout) = self.peer_idle_timeout {
            if idle_timeout <= self.heartbeat_interval {
                bail!("peer idle timeout {:?} must be longer than the heartbeat interval {:?}", idle_timeout, self.heartbeat_interval);
            }
        }
        if self.receive_window_size == 0 || self.receive_window_size > Self::MAX_RECEIVE_WINDOW_SIZE {
            bail!("receive window size must be between 1 and {}, was {}", Self::MAX_RECEIVE_WINDOW_SIZE, self.receive_window_size);
        }
        if self.receive_workers == 0 {
            bail!("at least one receive worker is required");
        }
        if self.delivery_queue_len == 0 {
            bail!("delivery queue length must not be zero");
        }

        Ok(())
    }
}
