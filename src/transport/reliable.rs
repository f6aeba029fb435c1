//! Wire format and selective-repeat bookkeeping for the reliable UDP stream.
//!
//! Generalizes the anti-replay sliding window from the original
//! `protocol/transport.rs` from a one-shot replay check into a full ARQ: the
//! same bitmap-of-recently-seen-sequence-numbers shape now also drives which
//! sequence numbers must be retransmitted.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Width of the selective-ack bitmap, mirroring the original 128-bit replay
/// window.
const WINDOW_SIZE: u32 = 128;

pub const FLAG_SYN: u8 = 0x01;
pub const FLAG_ACK: u8 = 0x02;
pub const FLAG_FIN: u8 = 0x04;
pub const FLAG_DATA: u8 = 0x08;

/// Fixed header carried by every datagram on the shared UDP socket.
///
/// `tag` demultiplexes datagrams to a session (or to the pending-dial /
/// punch-cookie table before a session exists) independent of the peer's
/// `SocketAddr`, which may change across a NAT rebinding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatagramHeader {
    pub tag: u64,
    pub seq: u32,
    pub ack: u32,
    pub ack_bitmap: u128,
    pub flags: u8,
}

pub const HEADER_LEN: usize = 8 + 4 + 4 + 16 + 1;

impl DatagramHeader {
    pub fn encode(&self, payload: &[u8], out: &mut Vec<u8>) {
        out.reserve(HEADER_LEN + payload.len());
        out.extend_from_slice(&self.tag.to_be_bytes());
        out.extend_from_slice(&self.seq.to_be_bytes());
        out.extend_from_slice(&self.ack.to_be_bytes());
        out.extend_from_slice(&self.ack_bitmap.to_be_bytes());
        out.push(self.flags);
        out.extend_from_slice(payload);
    }

    pub fn decode(buf: &[u8]) -> Option<(Self, &[u8])> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        let tag = u64::from_be_bytes(buf[0..8].try_into().ok()?);
        let seq = u32::from_be_bytes(buf[8..12].try_into().ok()?);
        let ack = u32::from_be_bytes(buf[12..16].try_into().ok()?);
        let ack_bitmap = u128::from_be_bytes(buf[16..32].try_into().ok()?);
        let flags = buf[32];
        Some((
            Self {
                tag,
                seq,
                ack,
                ack_bitmap,
                flags,
            },
            &buf[HEADER_LEN..],
        ))
    }
}

/// Tracks which sequence numbers the peer has acknowledged, for
/// retransmission purposes, and reassembles DATA payloads back into
/// contiguous order before they are released to the caller. Both sides'
/// `SendWindow`s start numbering at 0, so 0 is always the correct baseline
/// for the first payload this session delivers.
#[derive(Debug, Default)]
pub struct RecvWindow {
    highest: u32,
    bitmap: u128,
    seen_any: bool,
    next_deliver: u32,
    pending: BTreeMap<u32, Vec<u8>>,
}

impl RecvWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `seq` arrived carrying `payload`. Returns every payload
    /// now releasable in contiguous order: empty if `seq` is a duplicate
    /// retransmission or if it leaves a gap before `next_deliver`, one or
    /// more if it fills a gap that unblocks already-buffered payloads.
    pub fn record(&mut self, seq: u32, payload: Vec<u8>) -> Vec<Vec<u8>> {
        if !self.mark_seen(seq) {
            return Vec::new();
        }
        self.pending.insert(seq, payload);

        let mut deliverable = Vec::new();
        while let Some(next) = self.pending.remove(&self.next_deliver) {
            deliverable.push(next);
            self.next_deliver = self.next_deliver.wrapping_add(1);
        }
        deliverable
    }

    /// Duplicate-detection and ack-bitmap bookkeeping, independent of
    /// reassembly ordering.
    fn mark_seen(&mut self, seq: u32) -> bool {
        if !self.seen_any {
            self.seen_any = true;
            self.highest = seq;
            self.bitmap = 1;
            return true;
        }

        if seq > self.highest {
            let shift = seq - self.highest;
            self.bitmap = if shift >= WINDOW_SIZE as u32 {
                1
            } else {
                (self.bitmap << shift) | 1
            };
            self.highest = seq;
            true
        } else {
            let diff = self.highest - seq;
            if diff >= WINDOW_SIZE {
                false
            } else {
                let bit = 1u128 << diff;
                let already = self.bitmap & bit != 0;
                self.bitmap |= bit;
                !already
            }
        }
    }

    /// Ack fields to put on the next outgoing datagram.
    pub fn ack_fields(&self) -> (u32, u128) {
        (self.highest, self.bitmap)
    }
}

#[derive(Debug)]
struct InFlight {
    payload: Vec<u8>,
    sent_at: Instant,
    attempts: u32,
}

/// Outbound side: buffers unacknowledged datagrams and decides what to
/// retransmit under exponential backoff, capped at `MAX_ATTEMPTS` before the
/// session is declared dead.
#[derive(Debug)]
pub struct SendWindow {
    next_seq: u32,
    in_flight: BTreeMap<u32, InFlight>,
}

pub const MAX_ATTEMPTS: u32 = 8;
const BASE_RETRANSMIT_INTERVAL: Duration = Duration::from_millis(200);

impl SendWindow {
    pub fn new() -> Self {
        Self {
            next_seq: 0,
            in_flight: BTreeMap::new(),
        }
    }

    pub fn push(&mut self, payload: Vec<u8>) -> u32 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.in_flight.insert(
            seq,
            InFlight {
                payload,
                sent_at: Instant::now(),
                attempts: 1,
            },
        );
        seq
    }

    /// Apply a peer's cumulative ack plus selective bitmap, dropping
    /// everything now confirmed delivered.
    pub fn acknowledge(&mut self, ack: u32, bitmap: u128) {
        self.in_flight.retain(|&seq, _| {
            if seq <= ack {
                let diff = ack - seq;
                if diff == 0 {
                    return false;
                }
                if diff < WINDOW_SIZE && (bitmap >> diff) & 1 == 1 {
                    return false;
                }
            }
            true
        });
    }

    /// Datagrams due for retransmission right now, given each attempt's
    /// backoff. Returns `None` (session dead) if any entry has exhausted
    /// `MAX_ATTEMPTS`.
    pub fn due_for_retransmit(&mut self) -> Option<Vec<(u32, Vec<u8>)>> {
        let mut due = Vec::new();
        let now = Instant::now();
        for (&seq, entry) in self.in_flight.iter_mut() {
            if entry.attempts > MAX_ATTEMPTS {
                return None;
            }
            let backoff = BASE_RETRANSMIT_INTERVAL * 2u32.pow(entry.attempts.min(6) - 1);
            if now.duration_since(entry.sent_at) >= backoff {
                entry.attempts += 1;
                entry.sent_at = now;
                due.push((seq, entry.payload.clone()));
            }
        }
        Some(due)
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_empty()
    }
}

impl Default for SendWindow {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrips() {
        let header = DatagramHeader {
            tag: 0xdead_beef_0000_0001,
            seq: 42,
            ack: 41,
            ack_bitmap: 0b1011,
            flags: FLAG_DATA,
        };
        let mut buf = Vec::new();
        header.encode(b"payload", &mut buf);

        let (decoded, payload) = DatagramHeader::decode(&buf).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(payload, b"payload");
    }

    #[test]
    fn decode_rejects_short_buffers() {
        assert!(DatagramHeader::decode(&[0u8; 4]).is_none());
    }

    #[test]
    fn recv_window_rejects_duplicates() {
        let mut window = RecvWindow::new();
        assert_eq!(window.record(0, b"a".to_vec()), vec![b"a".to_vec()]);
        assert!(window.record(0, b"a".to_vec()).is_empty());
        assert_eq!(window.record(1, b"b".to_vec()), vec![b"b".to_vec()]);
        assert_eq!(window.record(2, b"c".to_vec()), vec![b"c".to_vec()]);
        assert!(window.record(1, b"b".to_vec()).is_empty());
    }

    #[test]
    fn recv_window_buffers_out_of_order_until_gap_fills() {
        let mut window = RecvWindow::new();

        // 1 and 2 arrive before 0; neither is releasable with a gap at 0.
        assert!(window.record(1, b"b".to_vec()).is_empty());
        assert!(window.record(2, b"c".to_vec()).is_empty());

        // 0 fills the gap: 0, 1, and 2 all release together, in order.
        let released = window.record(0, b"a".to_vec());
        assert_eq!(released, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn send_window_acknowledge_drops_confirmed() {
        let mut window = SendWindow::new();
        let s0 = window.push(b"a".to_vec());
        let s1 = window.push(b"b".to_vec());
        let s2 = window.push(b"c".to_vec());
        assert_eq!((s0, s1, s2), (0, 1, 2));

        window.acknowledge(1, 0);
        assert!(window.in_flight.contains_key(&2));
        assert!(!window.in_flight.contains_key(&0));
        assert!(!window.in_flight.contains_key(&1));
    }

    #[test]
    fn send_window_empty_after_full_ack() {
        let mut window = SendWindow::new();
        window.push(b"a".to_vec());
        window.push(b"b".to_vec());
        window.acknowledge(1, 0);
        assert!(window.is_idle());
    }
}
