//! Command datagrams carry the control plane. They are always a single fragment
//!  (`START | END | COMMAND`), never occupy a sequence number and are never retransmitted -
//!  the periodic nature of the exchanges takes care of losses.
//!
//! *Connect request* (initiating side, before an id is assigned)
//! ```ascii
//! id = 0, seq = 0, no payload
//! ```
//!
//! *Connect reply* (accepting side)
//! ```ascii
//! id = newly assigned id
//! seq = the ack baseline, i.e. the sequence number *before* the first data datagram the
//!        accepting side will send to this peer
//! ```
//!
//! *Heartbeat* (both sides, periodically)
//! ```ascii
//! id = the peer's assigned id
//! seq = cumulative ack: all data datagrams up to and including this were received and
//!        consumed, so the other side can retire them
//! ```

use crate::buffers::datagram_pool::DatagramPool;
use crate::datagram::{Datagram, DatagramHeader, DatagramKind, PeerId};
use crate::seq::SeqNo;

pub fn connect_request(pool: &DatagramPool) -> Datagram {
    control_datagram(pool, PeerId::UNASSIGNED, 0)
}

pub fn connect_reply(pool: &DatagramPool, id: PeerId, ack_baseline: SeqNo) -> Datagram {
    control_datagram(pool, id, ack_baseline.to_wire())
}

pub fn heartbeat(pool: &DatagramPool, id: PeerId, ack_seq: SeqNo) -> Datagram {
    control_datagram(pool, id, ack_seq.to_wire())
}

pub fn is_connect_request(header: &DatagramHeader) -> bool {
    header.kind.is_command() && !header.id.is_assigned()
}

fn control_datagram(pool: &DatagramPool, id: PeerId, seq: u32) -> Datagram {
    let mut datagram = pool.rent();
    datagram.init(&DatagramHeader {
        kind: DatagramKind::CONTROL,
        id,
        seq,
    });
    datagram
}
