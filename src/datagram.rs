//! A datagram is the unit of transmission, pooling and reassembly. Its buffer holds the
//!  complete wire representation, i.e. header and payload:
//!
//! ```ascii
//! 0: kind (u8, top 8 bits) | peer id (u24, low 24 bits) - one u32 BE
//! 4: sequence number (u32 BE), see [crate::seq::SeqNo] for the relation to the full sequence number
//! 8: payload (up to MTS bytes)
//! ```
//!
//! The buffer has room for one byte beyond the MTU so that oversized datagrams can be detected
//!  on receipt rather than being silently truncated.

use anyhow::bail;
use bitflags::bitflags;
use bytes::buf::UninitSlice;
use bytes::{Buf, BufMut};
use std::fmt::{Debug, Display, Formatter};
use tokio::time::Instant;

/// The largest datagram that is sent: 576 (minimum IPv4 reassembly buffer) - 20 (IP header)
///  - 8 (UDP header)
pub const MTU: usize = 548;
pub const HEADER_LEN: usize = 8;
/// maximum payload per datagram
pub const MTS: usize = MTU - HEADER_LEN;

const RECEIVE_CAPACITY: usize = MTU + 1;

bitflags! {
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
    pub struct DatagramKind: u8 {
        /// first fragment of a message
        const START = 0x01;
        /// control plane datagram (handshake, heartbeat) - always a single fragment
        const COMMAND = 0x02;
        /// last fragment of a message
        const END = 0x04;
    }
}

impl DatagramKind {
    pub const SINGLE_FRAGMENT: DatagramKind = DatagramKind::START.union(DatagramKind::END);
    pub const CONTROL: DatagramKind = DatagramKind::SINGLE_FRAGMENT.union(DatagramKind::COMMAND);

    pub fn is_start(&self) -> bool {
        self.contains(DatagramKind::START)
    }

    pub fn is_end(&self) -> bool {
        self.contains(DatagramKind::END)
    }

    pub fn is_command(&self) -> bool {
        self.contains(DatagramKind::COMMAND)
    }
}

/// The 24-bit identity that the accepting side assigns to a peer on first contact. Zero is
///  reserved for 'not assigned yet', i.e. connection requests.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct PeerId(u32);

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl PeerId {
    pub const UNASSIGNED: PeerId = PeerId(0);
    pub const MAX: PeerId = PeerId(0x00ff_ffff);

    pub fn new(raw: u32) -> anyhow::Result<PeerId> {
        if raw > Self::MAX.0 {
            bail!("peer id {:#x} exceeds 24 bits", raw);
        }
        Ok(PeerId(raw))
    }

    /// maps an arbitrary counter value to the range of assignable ids, i.e. 1..=MAX
    pub(crate) fn from_counter(counter: u32) -> PeerId {
        PeerId(counter % Self::MAX.0 + 1)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }

    pub fn is_assigned(&self) -> bool {
        *self != Self::UNASSIGNED
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DatagramHeader {
    pub kind: DatagramKind,
    pub id: PeerId,
    /// the lower 32 bits of the sequence number
    pub seq: u32,
}

impl DatagramHeader {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(((self.kind.bits() as u32) << 24) | self.id.to_raw());
        buf.put_u32(self.seq);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<DatagramHeader> {
        if buf.remaining() < HEADER_LEN {
            bail!("datagram of {} bytes is too short for a header", buf.remaining());
        }

        let kind_and_id = buf.get_u32();
        let seq = buf.get_u32();

        let kind_bits = (kind_and_id >> 24) as u8;
        let kind = match DatagramKind::from_bits(kind_bits) {
            Some(kind) => kind,
            None => bail!("unknown datagram kind {:#04x}", kind_bits),
        };
        if kind.is_command() && kind != DatagramKind::CONTROL {
            bail!("command datagram must be a single fragment, kind was {:?}", kind);
        }

        Ok(DatagramHeader {
            kind,
            id: PeerId(kind_and_id & PeerId::MAX.0),
            seq,
        })
    }
}

/// A fixed-capacity buffer holding one datagram's wire representation, with the bookkeeping
///  needed for retransmission.
pub struct Datagram {
    buf: Vec<u8>,
    count: usize,
    first_sent_at: Option<Instant>,
    last_sent_at: Option<Instant>,
}

impl Default for Datagram {
    fn default() -> Self {
        Self::new()
    }
}

impl Datagram {
    pub fn new() -> Datagram {
        Datagram {
            buf: vec![0; RECEIVE_CAPACITY],
            count: 0,
            first_sent_at: None,
            last_sent_at: None,
        }
    }

    /// Clear the datagram and write a header, leaving an empty payload
    pub fn init(&mut self, header: &DatagramHeader) {
        self.clear();
        header.ser(self);
    }

    /// Number of valid bytes, header included
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn header(&self) -> anyhow::Result<DatagramHeader> {
        if self.count > MTU {
            bail!("datagram exceeds MTU of {} bytes", MTU);
        }
        DatagramHeader::deser(&mut self.as_ref())
    }

    pub fn payload(&self) -> &[u8] {
        if self.count <= HEADER_LEN {
            return &[];
        }
        &self.buf[HEADER_LEN..self.count]
    }

    /// The entire buffer for receiving from a socket, to be followed by [Datagram::set_received_len]
    pub fn receive_buffer(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    pub fn set_received_len(&mut self, len: usize) {
        self.count = len.min(self.buf.len());
    }

    pub fn first_sent_at(&self) -> Option<Instant> {
        self.first_sent_at
    }

    pub fn last_sent_at(&self) -> Option<Instant> {
        self.last_sent_at
    }

    pub fn mark_sent(&mut self, now: Instant) {
        if self.first_sent_at.is_none() {
            self.first_sent_at = Some(now);
        }
        self.last_sent_at = Some(now);
    }

    /// Zero the buffer and forget all state, making the datagram ready for reuse
    pub fn clear(&mut self) {
        self.buf.fill(0);
        self.count = 0;
        self.first_sent_at = None;
        self.last_sent_at = None;
    }

    #[cfg(test)]
    pub fn from_parts(header: &DatagramHeader, payload: &[u8]) -> Datagram {
        let mut result = Datagram::new();
        result.init(header);
        result.put_slice(payload);
        result
    }
}

impl AsRef<[u8]> for Datagram {
    fn as_ref(&self) -> &[u8] {
        &self.buf[..self.count]
    }
}

impl PartialEq for Datagram {
    fn eq(&self, other: &Self) -> bool {
        self.as_ref().eq(other.as_ref())
    }
}
impl Eq for Datagram {}

impl Debug for Datagram {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.header() {
            Ok(header) => write!(f, "Datagram{{{:?} id:{} seq:{} payload:{}}}", header.kind, header.id, header.seq, self.payload().len()),
            Err(_) => write!(f, "Datagram{{invalid: {:?}}}", self.as_ref()),
        }
    }
}

/// Writing is limited to the MTU even though the buffer has room for one more byte
unsafe impl BufMut for Datagram {
    fn remaining_mut(&self) -> usize {
        MTU.saturating_sub(self.count)
    }

    unsafe fn advance_mut(&mut self, cnt: usize) {
        assert!(self.count + cnt <= MTU);
        self.count += cnt;
    }

    fn chunk_mut(&mut self) -> &mut UninitSlice {
        UninitSlice::new(&mut self.buf[self.count..MTU])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::single(DatagramKind::SINGLE_FRAGMENT, 7, 99, vec![5,0,0,7, 0,0,0,99])]
    #[case::control(DatagramKind::CONTROL, 0, 0, vec![7,0,0,0, 0,0,0,0])]
    #[case::start(DatagramKind::START, 0x123456, 0x01020304, vec![1,0x12,0x34,0x56, 1,2,3,4])]
    #[case::continuation(DatagramKind::empty(), 0xffffff, u32::MAX, vec![0,0xff,0xff,0xff, 0xff,0xff,0xff,0xff])]
    fn test_header_ser(#[case] kind: DatagramKind, #[case] id: u32, #[case] seq: u32, #[case] expected: Vec<u8>) {
        let header = DatagramHeader { kind, id: PeerId::new(id).unwrap(), seq };

        let mut buf = Vec::new();
        header.ser(&mut buf);
        assert_eq!(buf, expected);

        let deser = DatagramHeader::deser(&mut buf.as_slice()).unwrap();
        assert_eq!(deser, header);
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::truncated(vec![5,0,0,7, 0,0,0])]
    #[case::unknown_kind(vec![0x85,0,0,7, 0,0,0,1])]
    #[case::multi_fragment_command(vec![3,0,0,7, 0,0,0,1])]
    fn test_header_deser_invalid(#[case] buf: Vec<u8>) {
        assert!(DatagramHeader::deser(&mut buf.as_slice()).is_err());
    }

    #[test]
    fn test_peer_id() {
        assert!(PeerId::new(0x100_0000).is_err());
        assert!(!PeerId::UNASSIGNED.is_assigned());
        assert!(PeerId::new(1).unwrap().is_assigned());

        assert_eq!(PeerId::from_counter(0), PeerId::new(1).unwrap());
        assert_eq!(PeerId::from_counter(0xff_fffe), PeerId::MAX);
        assert_eq!(PeerId::from_counter(0xff_ffff), PeerId::new(1).unwrap());
    }

    #[test]
    fn test_payload_and_count() {
        let header = DatagramHeader { kind: DatagramKind::START, id: PeerId::new(3).unwrap(), seq: 1 };
        let datagram = Datagram::from_parts(&header, &[9, 8, 7]);

        assert_eq!(datagram.count(), HEADER_LEN + 3);
        assert_eq!(datagram.payload(), &[9, 8, 7]);
        assert_eq!(datagram.header().unwrap(), header);
    }

    #[test]
    fn test_put_limited_to_mtu() {
        let mut datagram = Datagram::new();
        datagram.init(&DatagramHeader { kind: DatagramKind::START, id: PeerId::new(1).unwrap(), seq: 1 });
        assert_eq!(datagram.remaining_mut(), MTS);

        datagram.put_slice(&[1; MTS]);
        assert_eq!(datagram.count(), MTU);
        assert_eq!(datagram.remaining_mut(), 0);
    }

    #[test]
    fn test_oversized_receive_is_rejected() {
        let mut datagram = Datagram::new();
        assert_eq!(datagram.receive_buffer().len(), MTU + 1);

        datagram.receive_buffer()[0] = DatagramKind::SINGLE_FRAGMENT.bits();
        datagram.set_received_len(MTU + 1);
        assert!(datagram.header().is_err());

        datagram.set_received_len(MTU);
        assert!(datagram.header().is_ok());
    }

    #[test]
    fn test_clear() {
        let mut datagram = Datagram::from_parts(&DatagramHeader { kind: DatagramKind::END, id: PeerId::new(1).unwrap(), seq: 4 }, &[1, 2, 3]);
        datagram.mark_sent(Instant::now());

        datagram.clear();
        assert_eq!(datagram.count(), 0);
        assert!(datagram.first_sent_at().is_none());
        assert!(datagram.last_sent_at().is_none());
        assert!(datagram.receive_buffer().iter().all(|&b| b == 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mark_sent() {
        let mut datagram = Datagram::new();
        let first = Instant::now();
        datagram.mark_sent(first);

        tokio::time::advance(std::time::Duration::from_millis(10)).await;
        let second = Instant::now();
        datagram.mark_sent(second);

        assert_eq!(datagram.first_sent_at(), Some(first));
        assert_eq!(datagram.last_sent_at(), Some(second));
    }
}
