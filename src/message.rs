//! Wire message model for the multiplexed channel.
//!
//! # Zero-Copy Payload Handling
//!
//! Payloads use [`Bytes`], so cloning a message for the dispatch path is
//! O(1) on the payload: only the envelope fields are copied, the payload
//! buffer is shared by reference count.
//!
//! A message is an envelope around an opaque payload:
//!
//! - optional source and destination [`TopologyAddress`]es,
//! - a [`Flags`] word carrying delivery-guarantee hints,
//! - an optional [`ForkHeader`] naming the logical sub-channel the
//!   message is addressed to,
//! - an optional [`CorrelationHeader`] linking a response back to the
//!   request that triggered it,
//! - the payload bytes.
//!
//! The correlation header is present only on messages that are part of a
//! request/response exchange; one-way messages omit it.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::address::TopologyAddress;

/// Delivery-hint flags carried by every message.
///
/// Flags are a plain bit set; unknown bits are preserved end to end so
/// intermediate layers never have to understand every hint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags(u16);

impl Flags {
    /// No flags set.
    pub const NONE: Flags = Flags(0);
    /// Guaranteed, ordered, flow-controlled delivery with receipt
    /// acknowledgement. Cleared on synthetic orphan responses so an
    /// already-dead exchange does not become a reliability burden.
    pub const RSVP: Flags = Flags(1 << 0);
    /// Out-of-band: may be delivered ahead of regular messages.
    pub const OOB: Flags = Flags(1 << 1);
    /// Skip bundling; send immediately.
    pub const DONT_BUNDLE: Flags = Flags(1 << 2);

    /// Whether all bits of `other` are set in `self`.
    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of both flag sets.
    pub fn with(self, other: Flags) -> Flags {
        Flags(self.0 | other.0)
    }

    /// `self` with all bits of `other` cleared.
    pub fn without(self, other: Flags) -> Flags {
        Flags(self.0 & !other.0)
    }

    /// Raw bit representation.
    pub fn bits(self) -> u16 {
        self.0
    }

    /// Build from a raw bit representation.
    pub fn from_bits(bits: u16) -> Flags {
        Flags(bits)
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Fork envelope naming the logical sub-channel a message belongs to.
///
/// Mirrors the two-level addressing of forked stacks: a fork stack groups
/// sub-channels that share extra protocol layers, the fork channel names
/// one endpoint within it. Dispatch is keyed by the channel id; neither
/// id is unique across the cluster, only per physical channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForkHeader {
    /// Fork stack the sub-channel belongs to.
    pub stack_id: String,
    /// The sub-channel endpoint within the stack.
    pub channel_id: String,
}

impl ForkHeader {
    /// Create a fork header.
    pub fn new(stack_id: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            stack_id: stack_id.into(),
            channel_id: channel_id.into(),
        }
    }

    fn encoded_len(&self) -> usize {
        2 + self.stack_id.len() + 2 + self.channel_id.len()
    }

    fn encode(&self, buf: &mut impl BufMut) {
        put_str(buf, &self.stack_id);
        put_str(buf, &self.channel_id);
    }

    fn decode(buf: &mut impl Buf) -> Option<Self> {
        let stack_id = get_str(buf)?;
        let channel_id = get_str(buf)?;
        Some(Self {
            stack_id,
            channel_id,
        })
    }
}

/// Whether a correlated message is the request or the response leg.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelationType {
    /// Request leg of an exchange.
    Request = 1,
    /// Response leg of an exchange.
    Response = 2,
}

impl TryFrom<u8> for CorrelationType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(CorrelationType::Request),
            2 => Ok(CorrelationType::Response),
            _ => Err(value),
        }
    }
}

/// Request/response correlation metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorrelationHeader {
    /// Request or response.
    pub kind: CorrelationType,
    /// Id of the request within the sender's correlator.
    pub request_id: u64,
    /// Id of the correlator instance that issued the request.
    pub correlation_id: u16,
    /// Whether the sender is blocked waiting for a response. Always
    /// `false` on responses.
    pub response_expected: bool,
}

impl CorrelationHeader {
    const ENCODED_SIZE: usize = 1 + 8 + 2 + 1;

    /// Header for a request, optionally expecting a response.
    pub fn request(request_id: u64, correlation_id: u16, response_expected: bool) -> Self {
        Self {
            kind: CorrelationType::Request,
            request_id,
            correlation_id,
            response_expected,
        }
    }

    /// Header for the response to the given request.
    pub fn response(request_id: u64, correlation_id: u16) -> Self {
        Self {
            kind: CorrelationType::Response,
            request_id,
            correlation_id,
            response_expected: false,
        }
    }

    /// Whether this header marks a request that expects a response.
    pub fn awaits_response(&self) -> bool {
        self.kind == CorrelationType::Request && self.response_expected
    }

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.kind as u8);
        buf.put_u64(self.request_id);
        buf.put_u16(self.correlation_id);
        buf.put_u8(self.response_expected as u8);
    }

    fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < Self::ENCODED_SIZE {
            return None;
        }
        let kind = CorrelationType::try_from(buf.get_u8()).ok()?;
        let request_id = buf.get_u64();
        let correlation_id = buf.get_u16();
        let response_expected = buf.get_u8() != 0;
        Some(Self {
            kind,
            request_id,
            correlation_id,
            response_expected,
        })
    }
}

// Presence bits of the envelope bitmap.
const HAS_SRC: u8 = 1 << 0;
const HAS_DEST: u8 = 1 << 1;
const HAS_FORK: u8 = 1 << 2;
const HAS_CORRELATION: u8 = 1 << 3;

/// A message moving through the protocol stack.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    /// Sender address, if known.
    pub src: Option<TopologyAddress>,
    /// Destination address; `None` means the whole group.
    pub dest: Option<TopologyAddress>,
    /// Delivery-hint flags.
    pub flags: Flags,
    /// Fork envelope, present on multiplexed messages only.
    pub fork: Option<ForkHeader>,
    /// Correlation header, present on request/response exchanges only.
    pub correlation: Option<CorrelationHeader>,
    /// Opaque payload.
    pub payload: Bytes,
}

impl Message {
    /// Create an empty message.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the destination address.
    pub fn with_dest(mut self, dest: TopologyAddress) -> Self {
        self.dest = Some(dest);
        self
    }

    /// Set the source address.
    pub fn with_src(mut self, src: TopologyAddress) -> Self {
        self.src = Some(src);
        self
    }

    /// Replace the flags word.
    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    /// Attach a fork envelope.
    pub fn with_fork(mut self, fork: ForkHeader) -> Self {
        self.fork = Some(fork);
        self
    }

    /// Attach a correlation header.
    pub fn with_correlation(mut self, correlation: CorrelationHeader) -> Self {
        self.correlation = Some(correlation);
        self
    }

    /// Set the payload.
    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Whether the message carries any payload bytes.
    ///
    /// Synthetic "fork not found" responses are defined by an empty
    /// payload, so this is the discriminator used by
    /// [`ChannelFactory::is_unknown_fork_response`](crate::ChannelFactory::is_unknown_fork_response).
    pub fn has_payload(&self) -> bool {
        !self.payload.is_empty()
    }

    /// Calculate the encoded length of the message.
    pub fn encoded_len(&self) -> usize {
        let mut len = 1 + 2; // presence bitmap + flags
        if let Some(src) = &self.src {
            len += src.encoded_len();
        }
        if let Some(dest) = &self.dest {
            len += dest.encoded_len();
        }
        if let Some(fork) = &self.fork {
            len += fork.encoded_len();
        }
        if self.correlation.is_some() {
            len += CorrelationHeader::ENCODED_SIZE;
        }
        len + 4 + self.payload.len()
    }

    /// Encode the message into the buffer.
    pub fn encode(&self, buf: &mut impl BufMut) {
        let mut presence = 0u8;
        if self.src.is_some() {
            presence |= HAS_SRC;
        }
        if self.dest.is_some() {
            presence |= HAS_DEST;
        }
        if self.fork.is_some() {
            presence |= HAS_FORK;
        }
        if self.correlation.is_some() {
            presence |= HAS_CORRELATION;
        }
        buf.put_u8(presence);
        buf.put_u16(self.flags.bits());
        if let Some(src) = &self.src {
            src.encode(buf);
        }
        if let Some(dest) = &self.dest {
            dest.encode(buf);
        }
        if let Some(fork) = &self.fork {
            fork.encode(buf);
        }
        if let Some(correlation) = &self.correlation {
            correlation.encode(buf);
        }
        debug_assert!(
            self.payload.len() <= u32::MAX as usize,
            "payload exceeds frame length field"
        );
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
    }

    /// Encode the message into a new `Bytes` buffer.
    pub fn encode_to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decode a message from the buffer.
    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < 3 {
            return None;
        }
        let presence = buf.get_u8();
        let flags = Flags::from_bits(buf.get_u16());
        let src = if presence & HAS_SRC != 0 {
            Some(TopologyAddress::decode(buf)?)
        } else {
            None
        };
        let dest = if presence & HAS_DEST != 0 {
            Some(TopologyAddress::decode(buf)?)
        } else {
            None
        };
        let fork = if presence & HAS_FORK != 0 {
            Some(ForkHeader::decode(buf)?)
        } else {
            None
        };
        let correlation = if presence & HAS_CORRELATION != 0 {
            Some(CorrelationHeader::decode(buf)?)
        } else {
            None
        };
        if buf.remaining() < 4 {
            return None;
        }
        let payload_len = buf.get_u32() as usize;
        if buf.remaining() < payload_len {
            return None;
        }
        let payload = buf.copy_to_bytes(payload_len);
        Some(Self {
            src,
            dest,
            flags,
            fork,
            correlation,
            payload,
        })
    }

    /// Decode a message from a byte slice.
    pub fn decode_from_slice(data: &[u8]) -> Option<Self> {
        let mut cursor = std::io::Cursor::new(data);
        Self::decode(&mut cursor)
    }
}

fn put_str(buf: &mut impl BufMut, value: &str) {
    debug_assert!(
        value.len() <= u16::MAX as usize,
        "string field exceeds frame length field"
    );
    buf.put_u16(value.len() as u16);
    buf.put_slice(value.as_bytes());
}

fn get_str(buf: &mut impl Buf) -> Option<String> {
    if buf.remaining() < 2 {
        return None;
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return None;
    }
    let raw = buf.copy_to_bytes(len);
    String::from_utf8(raw.to_vec()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_clear_only_requested_bits() {
        let flags = Flags::RSVP.with(Flags::OOB);
        let cleared = flags.without(Flags::RSVP);
        assert!(!cleared.contains(Flags::RSVP));
        assert!(cleared.contains(Flags::OOB));
    }

    #[test]
    fn full_envelope_survives_the_wire() {
        let msg = Message::new()
            .with_src(TopologyAddress::new("10.0.0.1:7600".parse().unwrap()))
            .with_dest(TopologyAddress::new("10.0.0.2:7600".parse().unwrap()))
            .with_flags(Flags::RSVP)
            .with_fork(ForkHeader::new("web", "session-registry"))
            .with_correlation(CorrelationHeader::request(42, 3, true))
            .with_payload(Bytes::from_static(b"payload"));

        let bytes = msg.encode_to_bytes();
        assert_eq!(bytes.len(), msg.encoded_len());
        let decoded = Message::decode_from_slice(&bytes).unwrap();
        assert_eq!(decoded, msg);
        assert!(decoded.correlation.unwrap().awaits_response());
    }

    #[test]
    fn one_way_message_omits_optional_headers() {
        let msg = Message::new().with_payload(Bytes::from_static(b"x"));
        let decoded = Message::decode_from_slice(&msg.encode_to_bytes()).unwrap();
        assert!(decoded.fork.is_none());
        assert!(decoded.correlation.is_none());
        assert!(decoded.has_payload());
    }

    #[test]
    #[should_panic(expected = "frame length field")]
    fn oversized_string_field_is_rejected() {
        let mut buf = BytesMut::new();
        put_str(&mut buf, &"x".repeat(u16::MAX as usize + 1));
    }

    #[test]
    fn truncated_frame_fails_to_decode() {
        let msg = Message::new()
            .with_fork(ForkHeader::new("web", "s"))
            .with_payload(Bytes::from_static(b"abcdef"));
        let bytes = msg.encode_to_bytes();
        assert!(Message::decode_from_slice(&bytes[..bytes.len() - 3]).is_none());
    }
}
