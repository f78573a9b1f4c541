//! Inbound SIP media decoding: PCMU/PCMA companding and PCM16 passthrough.

pub mod g711;

use bytes::Bytes;
use g711::G711Variant;

/// RTP payload codec carried by an inbound SIP media frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundCodec {
    /// μ-law companded, RTP payload type 0 by default.
    Pcmu,
    /// A-law companded, RTP payload type 8 by default.
    Pcma,
    /// Linear PCM16, passed through unchanged.
    Pcm16,
}

impl InboundCodec {
    /// Resolve from a negotiated RTP static payload type, falling back to PCMU.
    pub fn from_payload_type(payload_type: u8) -> Self {
        match payload_type {
            8 => InboundCodec::Pcma,
            _ => InboundCodec::Pcmu,
        }
    }
}

/// Decode one inbound SIP media frame to little-endian PCM16 mono at the source rate (8 kHz).
///
/// An empty payload produces no output, matching the "if payload is empty,
/// produce no output" decoding rule.
pub fn decode_inbound(codec: InboundCodec, payload: &[u8]) -> Bytes {
    if payload.is_empty() {
        return Bytes::new();
    }
    match codec {
        InboundCodec::Pcmu => Bytes::from(g711::decode(G711Variant::PCMU, payload)),
        InboundCodec::Pcma => Bytes::from(g711::decode(G711Variant::PCMA, payload)),
        InboundCodec::Pcm16 => Bytes::copy_from_slice(payload),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_payload_decodes_to_empty() {
        assert!(decode_inbound(InboundCodec::Pcmu, &[]).is_empty());
    }

    #[test]
    fn pcm16_passes_through_unchanged() {
        let payload = vec![1u8, 2, 3, 4];
        assert_eq!(decode_inbound(InboundCodec::Pcm16, &payload).as_ref(), &payload[..]);
    }

    #[test]
    fn payload_type_resolution() {
        assert_eq!(InboundCodec::from_payload_type(0), InboundCodec::Pcmu);
        assert_eq!(InboundCodec::from_payload_type(8), InboundCodec::Pcma);
        assert_eq!(InboundCodec::from_payload_type(99), InboundCodec::Pcmu);
    }
}
