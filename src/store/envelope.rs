//! # Item Envelope
//!
//! Every stored item is written to its arena as one envelope carrying the key
//! next to the value, so a used arena can always be traced back to its key
//! (index rebuild, relocation repair, enumeration).
//!
//! ```text
//! Offset      Size      Field
//! 0           4         key_len (u32 little-endian)
//! 4           key_len   key bytes
//! 4+key_len   rest      value bytes (opaque, never interpreted)
//! ```

use eyre::{ensure, Result};

const KEY_LEN_SIZE: usize = 4;

/// Encoded size of an envelope for a key and value of the given lengths.
pub fn encoded_len(key_len: usize, value_len: usize) -> usize {
    KEY_LEN_SIZE + key_len + value_len
}

pub fn encode(key: &[u8], value: &[u8]) -> Result<Vec<u8>> {
    ensure!(
        key.len() <= u32::MAX as usize,
        "key of {} bytes is too long",
        key.len()
    );

    let mut buf = Vec::with_capacity(encoded_len(key.len(), value.len()));
    buf.extend((key.len() as u32).to_le_bytes());
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
    Ok(buf)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope<'a> {
    key: &'a [u8],
    value: &'a [u8],
}

impl<'a> Envelope<'a> {
    pub fn decode(bytes: &'a [u8]) -> Result<Self> {
        ensure!(
            bytes.len() >= KEY_LEN_SIZE,
            "envelope too short: {} bytes",
            bytes.len()
        );

        let key_len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        let key_end = KEY_LEN_SIZE
            .checked_add(key_len)
            .filter(|&end| end <= bytes.len())
            .ok_or_else(|| {
                eyre::eyre!(
                    "envelope key length {} exceeds envelope size {}",
                    key_len,
                    bytes.len()
                )
            })?;

        Ok(Self {
            key: &bytes[KEY_LEN_SIZE..key_end],
            value: &bytes[key_end..],
        })
    }

    pub fn key(&self) -> &'a [u8] {
        self.key
    }

    pub fn value(&self) -> &'a [u8] {
        self.value
    }

    pub fn into_owned(self) -> (Vec<u8>, Vec<u8>) {
        (self.key.to_vec(), self.value.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_layout() {
        let bytes = encode(b"key", b"value").unwrap();

        assert_eq!(&bytes[0..4], &3u32.to_le_bytes());
        assert_eq!(&bytes[4..7], b"key");
        assert_eq!(&bytes[7..], b"value");
        assert_eq!(bytes.len(), encoded_len(3, 5));
    }

    #[test]
    fn decode_splits_key_and_value() {
        let bytes = encode(b"user:42", &[0, 1, 2, 255]).unwrap();
        let envelope = Envelope::decode(&bytes).unwrap();

        assert_eq!(envelope.key(), b"user:42");
        assert_eq!(envelope.value(), &[0, 1, 2, 255]);
    }

    #[test]
    fn decode_allows_empty_value() {
        let bytes = encode(b"k", b"").unwrap();

        assert!(Envelope::decode(&bytes).unwrap().value().is_empty());
    }

    #[test]
    fn decode_rejects_truncated_prefix() {
        assert!(Envelope::decode(&[1, 0]).is_err());
    }

    #[test]
    fn decode_rejects_oversized_key_len() {
        let mut bytes = encode(b"abc", b"xyz").unwrap();
        bytes[0..4].copy_from_slice(&100u32.to_le_bytes());

        let result = Envelope::decode(&bytes);

        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("exceeds envelope size"));
    }
}
