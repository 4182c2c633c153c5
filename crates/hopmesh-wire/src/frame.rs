//! # Frame codec
//!
//! One codec covering the three DATA variants (unicast fragment, link-state,
//! addressing) and the two DATA_SHORT variants (ACK, keep-alive), driven by
//! the high bits of byte 0 (DATA) and the tag byte of DATA_SHORT.
//!
//! ```text
//!  DATA, byte 0:
//!    1NNNNNNN   unicast fragment, N = fragment count (1..=127)
//!    01000000   link-state
//!    00nnnnnn   addressing, n = number of known-address entries
//! ```
//!
//! Unlike the historical implementation this codec does not pad unicast
//! frames to a fixed 32 bytes — byte 1 already carries the true frame
//! length, so the wire size is exactly `header + payload`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::node_id::NodeId;

/// Fixed header size of a unicast DATA fragment.
pub const UNICAST_HEADER_LEN: usize = 9;

/// Maximum payload carried by a single unicast fragment.
pub const MAX_FRAGMENT_PAYLOAD: usize = 23;

/// Addressing frame TTL — constant per the protocol.
pub const ADDRESSING_TTL: u8 = 10;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("frame too short: need at least {need} bytes, have {have}")]
    TooShort { need: usize, have: usize },
    #[error("payload of {len} bytes exceeds the {max}-byte fragment limit")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("declared frame length {declared} does not match header+payload length {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("link-state frame is missing its 0x40 tag byte")]
    BadLinkStateTag,
    #[error("link-state advertised length {0} is not of the form 4 + 2*entries")]
    BadLinkStateLength(u8),
    #[error("addressing frame declares {declared} entries but only {available} bytes remain")]
    TruncatedAddressing { declared: usize, available: usize },
}

/// One of the three DATA-class frames sharing the 9-byte-header envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Unicast(UnicastFrame),
    LinkState(LinkStateFrame),
    Addressing(AddressingFrame),
}

impl Frame {
    pub fn encode(&self) -> Bytes {
        match self {
            Frame::Unicast(f) => f.encode(),
            Frame::LinkState(f) => f.encode(),
            Frame::Addressing(f) => f.encode(),
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Frame, WireError> {
        if buf.is_empty() {
            return Err(WireError::TooShort { need: 1, have: 0 });
        }
        let byte0 = buf[0];
        if byte0 & 0x80 != 0 {
            UnicastFrame::decode(buf).map(Frame::Unicast)
        } else if byte0 & 0x40 != 0 {
            LinkStateFrame::decode(buf).map(Frame::LinkState)
        } else {
            AddressingFrame::decode(buf).map(Frame::Addressing)
        }
    }
}

// ─── Unicast fragment ───────────────────────────────────────────────────────

/// A single fragment of a chunked unicast (or per-destination broadcast) message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnicastFrame {
    /// Total number of fragments in this series.
    pub fragment_count: u8,
    /// Next hop this fragment is being sent to right now.
    pub next_hop: NodeId,
    /// Original sender of the message.
    pub source: NodeId,
    /// Final destination of the message.
    pub destination: NodeId,
    /// Sequence number of this fragment, `1..=fragment_count`.
    pub sequence: u8,
    /// Immediate upstream hop that handed us this frame (rewritten per hop).
    pub previous_hop: NodeId,
    /// Nonce shared by every fragment of this series.
    pub nonce: [u8; 2],
    pub payload: Bytes,
}

impl UnicastFrame {
    pub fn encode(&self) -> Bytes {
        let total_len = UNICAST_HEADER_LEN + self.payload.len();
        let mut buf = BytesMut::with_capacity(total_len);
        buf.put_u8(0x80 | (self.fragment_count & 0x7F));
        buf.put_u8(total_len as u8);
        buf.put_u8(self.next_hop.as_byte());
        buf.put_u8(self.source.as_byte());
        buf.put_u8(self.destination.as_byte());
        buf.put_u8(self.sequence);
        buf.put_u8(self.previous_hop.as_byte());
        buf.put_u8(self.nonce[0]);
        buf.put_u8(self.nonce[1]);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(buf: &[u8]) -> Result<UnicastFrame, WireError> {
        if buf.len() < UNICAST_HEADER_LEN {
            return Err(WireError::TooShort {
                need: UNICAST_HEADER_LEN,
                have: buf.len(),
            });
        }
        let mut cur = buf;
        let byte0 = cur.get_u8();
        let fragment_count = byte0 & 0x7F;
        let declared_len = cur.get_u8() as usize;
        let next_hop = NodeId::from_byte(cur.get_u8());
        let source = NodeId::from_byte(cur.get_u8());
        let destination = NodeId::from_byte(cur.get_u8());
        let sequence = cur.get_u8();
        let previous_hop = NodeId::from_byte(cur.get_u8());
        let nonce = [cur.get_u8(), cur.get_u8()];

        if declared_len < UNICAST_HEADER_LEN || declared_len > buf.len() {
            return Err(WireError::LengthMismatch {
                declared: declared_len,
                actual: buf.len(),
            });
        }
        let payload_len = declared_len - UNICAST_HEADER_LEN;
        if payload_len > MAX_FRAGMENT_PAYLOAD {
            return Err(WireError::PayloadTooLarge {
                len: payload_len,
                max: MAX_FRAGMENT_PAYLOAD,
            });
        }
        let payload = Bytes::copy_from_slice(&buf[UNICAST_HEADER_LEN..declared_len]);

        Ok(UnicastFrame {
            fragment_count,
            next_hop,
            source,
            destination,
            sequence,
            previous_hop,
            nonce,
            payload,
        })
    }
}

// ─── Link-state ─────────────────────────────────────────────────────────────

/// A distance-vector advertisement: `(destination, cost)` pairs known by `source`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkStateFrame {
    pub source: NodeId,
    pub entries: Vec<(NodeId, u8)>,
}

impl LinkStateFrame {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.entries.len() * 2);
        buf.put_u8(0x40);
        buf.put_u8(self.source.as_byte());
        buf.put_u8((self.entries.len() * 2 + 4) as u8);
        buf.put_u8(0xFF);
        for (dest, cost) in &self.entries {
            buf.put_u8(dest.as_byte());
            buf.put_u8(*cost);
        }
        buf.freeze()
    }

    pub fn decode(buf: &[u8]) -> Result<LinkStateFrame, WireError> {
        if buf.len() < 4 {
            return Err(WireError::TooShort { need: 4, have: buf.len() });
        }
        if buf[0] != 0x40 {
            return Err(WireError::BadLinkStateTag);
        }
        let source = NodeId::from_byte(buf[1]);
        let advertised_len = buf[2];
        if advertised_len < 4 || advertised_len % 2 != 0 {
            return Err(WireError::BadLinkStateLength(advertised_len));
        }
        let entry_count = (advertised_len as usize - 4) / 2;
        let needed = 4 + entry_count * 2;
        if buf.len() < needed {
            return Err(WireError::TooShort { need: needed, have: buf.len() });
        }
        let mut entries = Vec::with_capacity(entry_count);
        for k in 0..entry_count {
            let dest = NodeId::from_byte(buf[4 + 2 * k]);
            let cost = buf[5 + 2 * k];
            entries.push((dest, cost));
        }
        Ok(LinkStateFrame { source, entries })
    }
}

// ─── Addressing ─────────────────────────────────────────────────────────────

/// Self-assignment exploration / gossip / reply frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressingFrame {
    /// `true` = final reply, `false` = exploration/gossip.
    pub is_reply: bool,
    /// `NodeId::NONE` marks an exploration request from a newcomer.
    pub source: NodeId,
    pub known: Vec<NodeId>,
}

impl AddressingFrame {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.known.len());
        buf.put_u8(self.known.len() as u8);
        buf.put_u8(self.is_reply as u8);
        buf.put_u8(self.source.as_byte());
        buf.put_u8(ADDRESSING_TTL);
        for id in &self.known {
            buf.put_u8(id.as_byte());
        }
        buf.freeze()
    }

    pub fn decode(buf: &[u8]) -> Result<AddressingFrame, WireError> {
        if buf.len() < 4 {
            return Err(WireError::TooShort { need: 4, have: buf.len() });
        }
        let entry_count = buf[0] as usize;
        let is_reply = buf[1] != 0;
        let source = NodeId::from_byte(buf[2]);
        // buf[3] is TTL; not enforced on decode, the protocol never forwards
        // addressing frames hop-by-hop.
        let available = buf.len() - 4;
        if available < entry_count {
            return Err(WireError::TruncatedAddressing {
                declared: entry_count,
                available,
            });
        }
        let known = buf[4..4 + entry_count]
            .iter()
            .map(|&b| NodeId::from_byte(b))
            .collect();
        Ok(AddressingFrame { is_reply, source, known })
    }
}

// ─── DATA_SHORT ─────────────────────────────────────────────────────────────

/// The 2-byte DATA_SHORT frame: either an ACK or a keep-alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataShort {
    /// Acknowledges receipt by `NodeId`.
    Ack(NodeId),
    /// Asserts liveness of `NodeId`.
    KeepAlive(NodeId),
}

impl DataShort {
    pub fn encode(&self) -> [u8; 2] {
        match self {
            DataShort::Ack(id) => [0x00, id.as_byte()],
            DataShort::KeepAlive(id) => [0x01, id.as_byte()],
        }
    }

    pub fn decode(buf: &[u8]) -> Result<DataShort, WireError> {
        if buf.len() < 2 {
            return Err(WireError::TooShort { need: 2, have: buf.len() });
        }
        let id = NodeId::from_byte(buf[1]);
        if buf[0] == 0x00 {
            Ok(DataShort::Ack(id))
        } else {
            Ok(DataShort::KeepAlive(id))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u8) -> NodeId {
        NodeId::new(n).unwrap()
    }

    #[test]
    fn unicast_roundtrip_matches_scenario_1() {
        let frame = UnicastFrame {
            fragment_count: 1,
            next_hop: id(7),
            source: id(5),
            destination: id(7),
            sequence: 1,
            previous_hop: id(5),
            nonce: [0x11, 0x22],
            payload: Bytes::from_static(b"hello world"),
        };
        let encoded = frame.encode();
        assert_eq!(encoded[0], 0x81);
        assert_eq!(encoded[3], 5);
        assert_eq!(encoded[4], 7);
        assert_eq!(encoded[5], 1);
        assert_eq!(encoded[2], 7);
        assert_eq!(encoded[6], 5);
        assert_eq!(encoded.len(), UNICAST_HEADER_LEN + 11);

        let decoded = UnicastFrame::decode(&encoded).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn unicast_rejects_oversized_payload() {
        let big = vec![0u8; MAX_FRAGMENT_PAYLOAD + 1];
        let mut raw = vec![0x81u8, (UNICAST_HEADER_LEN + big.len()) as u8, 0, 0, 0, 1, 0, 0, 0];
        raw.extend_from_slice(&big);
        let err = UnicastFrame::decode(&raw).unwrap_err();
        assert!(matches!(err, WireError::PayloadTooLarge { .. }));
    }

    #[test]
    fn link_state_roundtrip() {
        let frame = LinkStateFrame {
            source: id(3),
            entries: vec![(id(4), 1), (id(5), 2)],
        };
        let encoded = frame.encode();
        assert_eq!(encoded[0], 0x40);
        assert_eq!(encoded[2], 2 * 2 + 4);
        let decoded = LinkStateFrame::decode(&encoded).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn link_state_empty_entries() {
        let frame = LinkStateFrame { source: id(1), entries: vec![] };
        let decoded = LinkStateFrame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded.entries.len(), 0);
    }

    #[test]
    fn addressing_exploration_roundtrip() {
        let frame = AddressingFrame {
            is_reply: false,
            source: NodeId::NONE,
            known: vec![],
        };
        let encoded = frame.encode();
        assert_eq!(encoded.len(), 4);
        assert_eq!(encoded[3], ADDRESSING_TTL);
        let decoded = AddressingFrame::decode(&encoded).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn addressing_reply_roundtrip() {
        let frame = AddressingFrame {
            is_reply: true,
            source: id(9),
            known: vec![id(3), id(9)],
        };
        let decoded = AddressingFrame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn data_short_ack_vs_keepalive() {
        let ack = DataShort::Ack(id(5));
        assert_eq!(ack.encode(), [0x00, 5]);
        assert_eq!(DataShort::decode(&ack.encode()).unwrap(), ack);

        let ka = DataShort::KeepAlive(id(12));
        assert_eq!(DataShort::decode(&ka.encode()).unwrap(), ka);
        // Any nonzero tag byte means keep-alive, not just 0x01.
        assert_eq!(DataShort::decode(&[0x42, 12]).unwrap(), DataShort::KeepAlive(id(12)));
    }

    #[test]
    fn frame_dispatches_on_type_bits() {
        let uni = Frame::Unicast(UnicastFrame {
            fragment_count: 1,
            next_hop: id(1),
            source: id(2),
            destination: id(1),
            sequence: 1,
            previous_hop: id(2),
            nonce: [1, 2],
            payload: Bytes::from_static(b"hi"),
        });
        assert_eq!(Frame::decode(&uni.encode()).unwrap(), uni);

        let ls = Frame::LinkState(LinkStateFrame { source: id(1), entries: vec![(id(2), 1)] });
        assert_eq!(Frame::decode(&ls.encode()).unwrap(), ls);

        let addr = Frame::Addressing(AddressingFrame {
            is_reply: true,
            source: id(1),
            known: vec![id(1)],
        });
        assert_eq!(Frame::decode(&addr.encode()).unwrap(), addr);
    }
}
