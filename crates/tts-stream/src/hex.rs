//! Hex audio payload codec.
//!
//! The streaming endpoint ships audio as hex text inside JSON frames. Decoding is a pure
//! function; callers treat a [`HexDecodeError`] as a dropped chunk, not as a pipeline failure.

use bytes::Bytes;

/// A hex payload that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HexDecodeError {
    /// Input length is not a multiple of two.
    #[error("odd hex length {len}")]
    OddLength {
        /// Length of the rejected input.
        len: usize,
    },

    /// Input contains a character outside `[0-9a-fA-F]`.
    #[error("invalid hex character {c:?} at {index}")]
    InvalidChar {
        /// Offending character.
        c: char,
        /// Byte index of the character.
        index: usize,
    },
}

/// Decode a hex payload into raw audio bytes.
///
/// Leading/trailing ASCII whitespace is not tolerated: frames carry the payload verbatim.
pub fn decode_hex(payload: &str) -> Result<Bytes, HexDecodeError> {
    if payload.len() % 2 != 0 {
        return Err(HexDecodeError::OddLength { len: payload.len() });
    }
    hex::decode(payload)
        .map(Bytes::from)
        .map_err(|e| match e {
            hex::FromHexError::InvalidHexCharacter { c, index } => {
                HexDecodeError::InvalidChar { c, index }
            }
            hex::FromHexError::OddLength | hex::FromHexError::InvalidStringLength => {
                HexDecodeError::OddLength { len: payload.len() }
            }
        })
}

/// Encode raw bytes as lowercase hex.
pub fn encode_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}
