//! Byte-level helpers shared by the descriptor parsers and writers.

use base64::engine::general_purpose::{STANDARD as BASE64_STANDARD, STANDARD_NO_PAD as BASE64_STANDARD_NO_PAD};
use base64::Engine as _;

use crate::error::OffcryptoError;

/// Sequential little-endian reader over a borrowed byte slice.
pub(crate) struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> &'a [u8] {
        &self.bytes[self.pos..]
    }

    pub(crate) fn take(&mut self, n: usize, context: &'static str) -> Result<&'a [u8], OffcryptoError> {
        let end = self.pos.saturating_add(n);
        if end > self.bytes.len() {
            return Err(OffcryptoError::MalformedEnvelope(format!(
                "truncated data while reading {context}"
            )));
        }
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    pub(crate) fn read_u16_le(&mut self, context: &'static str) -> Result<u16, OffcryptoError> {
        let b = self.take(2, context)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub(crate) fn read_u32_le(&mut self, context: &'static str) -> Result<u32, OffcryptoError> {
        let b = self.take(4, context)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn read_u64_le(&mut self, context: &'static str) -> Result<u64, OffcryptoError> {
        let b = self.take(8, context)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }
}

/// Constant-time byte-slice equality.
///
/// Lengths are public information (they come from the descriptor layout), so
/// a length mismatch may return early; the content comparison must not.
pub(crate) fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Encode a string as UTF-16LE without BOM or terminator.
pub(crate) fn utf16le_bytes(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len() * 2);
    for cu in s.encode_utf16() {
        out.extend_from_slice(&cu.to_le_bytes());
    }
    out
}

/// Decode a NUL-terminated UTF-16LE string field (e.g. `CSPName`).
///
/// A missing terminator is tolerated: trailing NUL padding is trimmed and the
/// remainder decoded as-is.
pub(crate) fn decode_utf16le_nul_terminated(bytes: &[u8]) -> Result<String, OffcryptoError> {
    if bytes.is_empty() {
        return Ok(String::new());
    }
    if bytes.len() % 2 != 0 {
        return Err(OffcryptoError::MalformedEnvelope(
            "UTF-16LE field has odd byte length".to_string(),
        ));
    }

    let mut code_units: Vec<u16> = Vec::with_capacity(bytes.len() / 2);
    for chunk in bytes.chunks_exact(2) {
        code_units.push(u16::from_le_bytes([chunk[0], chunk[1]]));
    }

    let end = match code_units.iter().position(|u| *u == 0) {
        Some(nul_pos) => nul_pos,
        None => {
            log::warn!("UTF-16LE string field is missing its NUL terminator");
            let mut end = code_units.len();
            while end > 0 && code_units[end - 1] == 0 {
                end -= 1;
            }
            end
        }
    };

    String::from_utf16(&code_units[..end])
        .map_err(|_| OffcryptoError::MalformedEnvelope("invalid UTF-16LE string field".to_string()))
}

/// Decode a base64 attribute value, tolerating embedded whitespace and a
/// missing padding suffix (both occur in the wild).
pub(crate) fn decode_b64_attr(value: &[u8]) -> Result<Vec<u8>, OffcryptoError> {
    let needs_cleaning = value.iter().any(|b| matches!(b, b'\r' | b'\n' | b'\t' | b' '));
    let cleaned: Vec<u8>;
    let input: &[u8] = if needs_cleaning {
        cleaned = value
            .iter()
            .copied()
            .filter(|b| !matches!(b, b'\r' | b'\n' | b'\t' | b' '))
            .collect();
        &cleaned
    } else {
        value
    };

    BASE64_STANDARD
        .decode(input)
        .or_else(|_| BASE64_STANDARD_NO_PAD.decode(input))
        .map_err(|_| OffcryptoError::MalformedEnvelope("invalid base64 value".to_string()))
}

/// Validate that a declared plaintext size fits into a `Vec<u8>`.
pub(crate) fn checked_vec_len(total_size: u64) -> Result<usize, OffcryptoError> {
    let len = usize::try_from(total_size).map_err(|_| {
        OffcryptoError::MalformedEnvelope(format!(
            "declared package size {total_size} exceeds addressable memory"
        ))
    })?;
    // `Vec<u8>` cannot exceed `isize::MAX`.
    isize::try_from(len).map_err(|_| {
        OffcryptoError::MalformedEnvelope(format!(
            "declared package size {total_size} exceeds addressable memory"
        ))
    })?;
    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ct_eq_basic() {
        assert!(ct_eq(b"abc", b"abc"));
        assert!(!ct_eq(b"abc", b"abd"));
        assert!(!ct_eq(b"abc", b"ab"));
    }

    #[test]
    fn utf16le_round_trip() {
        let bytes = utf16le_bytes("Ab");
        assert_eq!(bytes, vec![b'A', 0, b'b', 0]);
    }

    #[test]
    fn decode_utf16le_stops_at_nul() {
        let mut bytes = utf16le_bytes("name");
        bytes.extend_from_slice(&[0, 0, 0x41, 0x00]);
        assert_eq!(decode_utf16le_nul_terminated(&bytes).unwrap(), "name");
    }

    #[test]
    fn b64_accepts_missing_padding_and_whitespace() {
        assert_eq!(decode_b64_attr(b"AAAA").unwrap(), vec![0, 0, 0]);
        assert_eq!(decode_b64_attr(b"AA A\nA").unwrap(), vec![0, 0, 0]);
        assert_eq!(decode_b64_attr(b"AAA").unwrap(), vec![0, 0]);
    }

    #[test]
    fn reader_reports_truncation() {
        let mut r = Reader::new(&[0x01, 0x02]);
        assert!(r.read_u32_le("field").is_err());
    }
}
