use crate::buffers::datagram_pool::DatagramPool;
use crate::datagram::{Datagram, DatagramKind};
use crate::seq::SeqNo;
use std::collections::BTreeMap;
use tracing::{debug, trace, warn};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum InsertOutcome {
    Inserted,
    /// at or below the ack threshold, or already buffered
    Duplicate,
    /// too far ahead of the ack threshold
    OutOfWindow,
}

/// The receive side of one direction of a peer connection: buffers incoming data datagrams
///  until a contiguous run from a `START` to an `END` fragment is present, and extracts complete
///  messages strictly in sequence order.
///
/// NB: A missing fragment blocks delivery of all messages behind it (head-of-line blocking),
///      which is what guarantees in-order, gap-free delivery
pub struct ReassemblyTable {
    /// received datagrams that were not consumed yet, with their kind
    datagrams: BTreeMap<SeqNo, (DatagramKind, Datagram)>,

    /// The last sequence number that was consumed in order (delivered or discarded). All
    ///  datagrams with a sequence number up to and including this are duplicates.
    ack_seq: SeqNo,

    receive_window_size: u64,
    max_message_size: usize,
}

impl ReassemblyTable {
    pub fn new(ack_seq: SeqNo, receive_window_size: u32, max_message_size: usize) -> ReassemblyTable {
        ReassemblyTable {
            datagrams: Default::default(),
            ack_seq,
            receive_window_size: receive_window_size as u64,
            max_message_size,
        }
    }

    pub fn ack_seq(&self) -> SeqNo {
        self.ack_seq
    }

    /// the sequence number of the next datagram to be consumed
    pub fn expected_seq(&self) -> SeqNo {
        self.ack_seq.next()
    }

    pub fn min_seq(&self) -> Option<SeqNo> {
        self.datagrams.keys().next().cloned()
    }

    pub fn max_seq(&self) -> Option<SeqNo> {
        self.datagrams.keys().next_back().cloned()
    }

    pub fn len(&self) -> usize {
        self.datagrams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datagrams.is_empty()
    }

    /// Add a received data datagram. Datagrams that are not inserted are returned to the pool.
    pub fn insert(&mut self, seq: SeqNo, kind: DatagramKind, datagram: Datagram, pool: &DatagramPool) -> InsertOutcome {
        if seq <= self.ack_seq {
            debug!("datagram #{} is at or below ack threshold {} - discarding duplicate", seq, self.ack_seq);
            pool.return_to_pool(datagram);
            return InsertOutcome::Duplicate;
        }
        if seq.distance_from(self.ack_seq) > self.receive_window_size {
            debug!("datagram #{} is beyond the receive window (ack threshold {}) - discarding", seq, self.ack_seq);
            pool.return_to_pool(datagram);
            return InsertOutcome::OutOfWindow;
        }
        if self.datagrams.contains_key(&seq) {
            debug!("datagram #{} is already buffered - discarding duplicate", seq);
            pool.return_to_pool(datagram);
            return InsertOutcome::Duplicate;
        }

        trace!("buffering datagram #{} ({:?})", seq, kind);
        self.datagrams.insert(seq, (kind, datagram));
        InsertOutcome::Inserted
    }

    /// Extract the next complete message if there is one, advancing the ack threshold past it
    pub fn extract_next(&mut self, pool: &DatagramPool) -> Option<Vec<u8>> {
        loop {
            let head = self.expected_seq();
            let head_kind = match self.datagrams.get(&head) {
                Some((kind, _)) => *kind,
                None => {
                    trace!("datagram #{} was not received yet", head);
                    return None;
                }
            };

            if !head_kind.is_start() {
                // this can only be a leftover of a run that was abandoned on the sender side
                warn!("datagram #{} continues a message that was never started - discarding", head);
                self.discard_up_to(head, pool);
                continue;
            }

            let mut end = head;
            if !head_kind.is_end() {
                let mut cursor = head.next();
                loop {
                    match self.datagrams.get(&cursor) {
                        None => {
                            trace!("message starting at #{} is incomplete: #{} is missing", head, cursor);
                            return None;
                        }
                        Some((kind, _)) if kind.is_start() => {
                            break;
                        }
                        Some((kind, _)) if kind.is_end() => {
                            end = cursor;
                            break;
                        }
                        Some(_) => {
                            cursor = cursor.next();
                        }
                    }
                }

                if end == head {
                    warn!("message starting at #{} is interrupted by a new message at #{} - discarding the partial message", head, cursor);
                    if let Some(last_stale) = cursor.checked_sub(1) {
                        self.discard_up_to(last_stale, pool);
                    }
                    continue;
                }
            }

            let num_fragments = end.distance_from(head) + 1;
            let mut message = Vec::new();
            let mut is_too_long = false;
            for _ in 0..num_fragments {
                let seq = self.expected_seq();
                if let Some((_, datagram)) = self.datagrams.remove(&seq) {
                    if message.len() + datagram.payload().len() > self.max_message_size {
                        is_too_long = true;
                    }
                    if !is_too_long {
                        message.extend_from_slice(datagram.payload());
                    }
                    pool.return_to_pool(datagram);
                }
                self.ack_seq = seq;
            }

            if is_too_long {
                warn!("message #{}-#{} exceeds the maximum message size of {} - discarding", head, end, self.max_message_size);
                continue;
            }

            trace!("extracted message #{}-#{} with {} bytes", head, end, message.len());
            return Some(message);
        }
    }

    /// Extract all messages that are complete, in order
    pub fn extract_all(&mut self, pool: &DatagramPool) -> Vec<Vec<u8>> {
        let mut result = Vec::new();
        while let Some(message) = self.extract_next(pool) {
            result.push(message);
        }
        result
    }

    /// Remove all buffered datagrams, e.g. when a peer is discarded
    pub fn clear(&mut self, pool: &DatagramPool) {
        for (_, (_, datagram)) in std::mem::take(&mut self.datagrams) {
            pool.return_to_pool(datagram);
        }
    }

    /// Discard all buffered datagrams up to and including `last`, moving the ack threshold there
    fn discard_up_to(&mut self, last: SeqNo, pool: &DatagramPool) {
        let retained = self.datagrams.split_off(&last.next());
        for (_, (_, datagram)) in std::mem::replace(&mut self.datagrams, retained) {
            pool.return_to_pool(datagram);
        }
        if last > self.ack_seq {
            self.ack_seq = last;
        }
    }
}
