use std::fmt;

use crate::{ManioError, Result};

/// Width of one fingerprint: a 64-bit weak checksum rendered as 16 hex digits.
pub const FINGERPRINT_LEN: usize = 16;

/// Fixed-length fingerprint of one data block.
///
/// Ordering is plain byte order, which for the upper-case hex rendering is
/// also numeric order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint([u8; FINGERPRINT_LEN]);

impl Fingerprint {
    pub fn new(bytes: [u8; FINGERPRINT_LEN]) -> Self {
        Self(bytes)
    }

    /// Builds a fingerprint from a record payload.
    ///
    /// # Errors
    ///
    /// Returns [`ManioError::Protocol`] unless `bytes` is exactly
    /// [`FINGERPRINT_LEN`] long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; FINGERPRINT_LEN] = bytes.try_into().map_err(|_| {
            ManioError::Protocol(format!(
                "fingerprint must be {FINGERPRINT_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }

    /// Renders a weak checksum as 16 upper-case hex digits.
    pub fn from_u64(value: u64) -> Self {
        let mut arr = [0u8; FINGERPRINT_LEN];
        arr.copy_from_slice(format!("{value:016X}").as_bytes());
        Self(arr)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_u64_renders_zero_padded_hex() {
        let fp = Fingerprint::from_u64(0xAB);
        assert_eq!(fp.as_bytes(), b"00000000000000AB");
        assert_eq!(fp.to_string(), "00000000000000AB");
    }

    #[test]
    fn byte_order_matches_numeric_order() {
        let mut fps: Vec<_> = [0xFFu64, 0x10, 0x1_0000_0000, 0]
            .into_iter()
            .map(Fingerprint::from_u64)
            .collect();
        fps.sort();
        let expect: Vec<_> = [0u64, 0x10, 0xFF, 0x1_0000_0000]
            .into_iter()
            .map(Fingerprint::from_u64)
            .collect();
        assert_eq!(fps, expect);
    }

    #[test]
    fn from_slice_rejects_wrong_length() {
        assert!(Fingerprint::from_slice(b"0123456789ABCDEF").is_ok());
        assert!(matches!(
            Fingerprint::from_slice(b"0123"),
            Err(ManioError::Protocol(_))
        ));
        assert!(Fingerprint::from_slice(&[b'0'; 17]).is_err());
    }
}
