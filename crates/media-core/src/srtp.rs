//! SRTP keying material codec
//!
//! The vendor transports SRTP session keys as a single base64 blob holding
//! a 16-byte AES master key immediately followed by a 14-byte salt, the
//! same layout an SDP `a=crypto` inline parameter uses for
//! AES_CM_128_HMAC_SHA1_80.

use base64::{engine::general_purpose::STANDARD, Engine};

use crate::error::{Error, Result};

/// Length of the SRTP master key in bytes
pub const SRTP_KEY_LEN: usize = 16;
/// Length of the SRTP master salt in bytes
pub const SRTP_SALT_LEN: usize = 14;

/// SRTP master key and salt for one media leg
#[derive(Clone, PartialEq, Eq)]
pub struct SrtpMaterial {
    /// 128-bit AES master key
    pub key: [u8; SRTP_KEY_LEN],
    /// 112-bit master salt
    pub salt: [u8; SRTP_SALT_LEN],
}

impl std::fmt::Debug for SrtpMaterial {
    // Keying material must not end up in logs
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SrtpMaterial").finish_non_exhaustive()
    }
}

impl SrtpMaterial {
    /// Decode key+salt from the vendor's base64 session blob.
    ///
    /// The decoded payload must be exactly 30 bytes: 16 of key, 14 of salt.
    pub fn from_base64(blob: &str) -> Result<Self> {
        let raw = STANDARD
            .decode(blob.trim())
            .map_err(|e| Error::InvalidSrtpMaterial(format!("bad base64: {e}")))?;
        if raw.len() != SRTP_KEY_LEN + SRTP_SALT_LEN {
            return Err(Error::InvalidSrtpMaterial(format!(
                "expected {} bytes, got {}",
                SRTP_KEY_LEN + SRTP_SALT_LEN,
                raw.len()
            )));
        }
        let mut key = [0u8; SRTP_KEY_LEN];
        let mut salt = [0u8; SRTP_SALT_LEN];
        key.copy_from_slice(&raw[..SRTP_KEY_LEN]);
        salt.copy_from_slice(&raw[SRTP_KEY_LEN..]);
        Ok(Self { key, salt })
    }

    /// Encode back to the base64 form used on the wire and in `a=crypto` lines
    pub fn to_base64(&self) -> String {
        let mut raw = Vec::with_capacity(SRTP_KEY_LEN + SRTP_SALT_LEN);
        raw.extend_from_slice(&self.key);
        raw.extend_from_slice(&self.salt);
        STANDARD.encode(raw)
    }

    /// The full `a=crypto` attribute value for this material
    pub fn crypto_line_value(&self, tag: u8) -> String {
        format!(
            "{} AES_CM_128_HMAC_SHA1_80 inline:{}",
            tag,
            self.to_base64()
        )
    }
}
