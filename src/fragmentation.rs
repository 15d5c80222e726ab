use crate::buffers::datagram_pool::DatagramPool;
use crate::datagram::{Datagram, DatagramHeader, DatagramKind, PeerId, MTS};
use crate::seq::SeqNo;
use bytes::BufMut;

/// The number of datagrams a message of the given length is split into. An empty message is
///  still sent as a single (empty) datagram.
pub fn num_fragments(message_len: usize) -> usize {
    message_len.div_ceil(MTS).max(1)
}

/// Split a message into datagrams of at most [MTS] payload bytes, preserving order. The first
///  datagram is tagged `START`, the last one `END`, and they are numbered consecutively
///  starting at `first_seq`.
pub fn fragment(pool: &DatagramPool, id: PeerId, first_seq: SeqNo, message: &[u8]) -> Vec<(SeqNo, Datagram)> {
    let num_fragments = num_fragments(message.len());
    let mut result = Vec::with_capacity(num_fragments);

    for i in 0..num_fragments {
        let chunk = &message[(i * MTS).min(message.len())..((i + 1) * MTS).min(message.len())];

        let mut kind = DatagramKind::empty();
        if i == 0 {
            kind |= DatagramKind::START;
        }
        if i == num_fragments - 1 {
            kind |= DatagramKind::END;
        }

        let seq = first_seq + i as u64;
        let mut datagram = pool.rent();
        datagram.init(&DatagramHeader { kind, id, seq: seq.to_wire() });
        datagram.put_slice(chunk);

        result.push((seq, datagram));
    }
    result
}
