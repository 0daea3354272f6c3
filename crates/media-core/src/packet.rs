//! Inbound UDP packet classification
//!
//! Media sockets carry an interleaved mix of STUN binding traffic and
//! (S)RTP. Demultiplexing is done per packet: STUN is identified by the
//! magic cookie at offset 4, everything else is classified by the RTP
//! payload-type heuristic the remote encoders are known to use.

/// The STUN magic cookie (RFC 5389 §6), network byte order
pub const STUN_MAGIC_COOKIE: u32 = 0x2112_A442;

/// What a received UDP datagram appears to be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// STUN binding request/response
    Stun,
    /// RTP (or SRTP; indistinguishable at this layer)
    Rtp,
    /// Neither STUN nor plausible RTP
    Unknown,
}

/// Classify a received datagram.
///
/// A buffer is STUN if the four bytes at offset 4 equal the magic cookie.
/// Otherwise it is RTP if the payload-type field (second byte, marker bit
/// masked off) is 0 (PCMU) or above 90 (the dynamic range the vendor uses).
pub fn classify(buf: &[u8]) -> PacketKind {
    if is_stun_message(buf) {
        return PacketKind::Stun;
    }
    if buf.len() >= 12 {
        let payload_type = buf[1] & 0x7f;
        if payload_type == 0 || payload_type > 90 {
            return PacketKind::Rtp;
        }
    }
    PacketKind::Unknown
}

/// True if the buffer carries the STUN magic cookie at offset 4
pub fn is_stun_message(buf: &[u8]) -> bool {
    buf.len() >= 8 && buf[4..8] == STUN_MAGIC_COOKIE.to_be_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stun_header() -> Vec<u8> {
        let mut buf = vec![0x00, 0x01, 0x00, 0x00];
        buf.extend_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
        buf.extend_from_slice(&[0u8; 12]);
        buf
    }

    #[test]
    fn magic_cookie_is_stun() {
        assert_eq!(classify(&stun_header()), PacketKind::Stun);
    }

    #[test]
    fn pcmu_payload_is_rtp() {
        // Version 2 RTP header, payload type 0
        let mut buf = vec![0x80, 0x00];
        buf.extend_from_slice(&[0u8; 10]);
        assert_eq!(classify(&buf), PacketKind::Rtp);
    }

    #[test]
    fn dynamic_payload_is_rtp() {
        // Payload type 99 with marker bit set
        let mut buf = vec![0x80, 0x80 | 99];
        buf.extend_from_slice(&[0u8; 10]);
        assert_eq!(classify(&buf), PacketKind::Rtp);
    }

    #[test]
    fn mid_range_payload_without_cookie_is_unknown() {
        let mut buf = vec![0x80, 72];
        buf.extend_from_slice(&[0u8; 10]);
        assert_eq!(classify(&buf), PacketKind::Unknown);
    }

    #[test]
    fn short_buffer_is_unknown() {
        assert_eq!(classify(&[0x80, 0x00, 0x01]), PacketKind::Unknown);
    }
}
