//! A message-oriented transport on top of UDP that delivers whole messages reliably and in the
//!  order they were sent.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *messages* (defined-length chunks of data) rather than
//!   streams of bytes
//! * One side accepts connections (see [server::AcceptingEndPoint]), the other side initiates
//!   them (see [client::InitiatingEndPoint]). The accepting side handles any number of peers
//!   through a single UDP socket.
//!   * Peers are identified by a 24-bit identity that the accepting side assigns on first
//!     contact, not by their network address. A peer whose address changes (e.g. NAT rebinding)
//!     keeps its identity and its state.
//! * Big messages are sent without IP-level fragmentation - the protocol splits them into
//!   datagrams of a fixed MTU and reassembles them on the receiving side
//! * Every datagram has a sequence number. The receiver buffers datagrams until all fragments
//!   of a message are present, delivering messages strictly in sequence order.
//!   * NB: This means that a missing datagram delays delivery of all messages after it
//! * Positive, cumulative acknowledgement: both sides periodically send a heartbeat carrying
//!   the highest sequence number up to which they received everything. The sender keeps all
//!   unacknowledged datagrams and resends them after a timeout.
//! * Explicitly out of scope: congestion control, encryption, multi-path
//!
//! ## Datagram format
//!
//! All numbers in network byte order (BE):
//!
//! ```ascii
//! 0: kind (8 bits): bit flags
//!    * 0x01 START: first fragment of a message
//!    * 0x02 COMMAND: control datagram, always with START and END set
//!    * 0x04 END: last fragment of a message
//! 1: peer identity (u24), 0 for connect requests
//! 4: sequence number (u32): the lower 32 bits of the fragment's sequence number
//! 8: payload - up to 540 bytes for a total of 548 bytes
//! ```
//!
//! A single-fragment message has both START and END set, fragments between START and END have
//!  neither. See [control] for the control datagrams.
//!
//! ## Sequence numbers
//!
//! Sequence numbers are 64 bit internally and never wrap. The wire carries the lower 32 bits,
//!  and the receiver reconstructs the full number as the one closest to what it expects next.
//!  This works because a receiver accepts only datagrams within its receive window.

pub mod buffers;
pub mod client;
pub mod config;
pub mod control;
pub mod datagram;
mod end_point;
pub mod fragmentation;
pub mod message_dispatcher;
pub mod peer;
pub mod reassembly;
pub mod seq;
pub mod server;
pub mod socket;
pub mod sweeper;

#[cfg(test)] mod test_util;

#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor(unsafe)]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
