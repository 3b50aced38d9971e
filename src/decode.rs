//! Chunk payload repair and decoding.
//!
//! The sender splits one long base64 stream at arbitrary byte offsets, so
//! an individual chunk's length is frequently not a multiple of four and
//! its original padding may have been sheared off. Repair is deterministic
//! and idempotent: strip whatever padding survived, then re-pad to the
//! next quantum. All failures come back as a typed [`DecodeError`].

use crate::error::DecodeError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

/// Decode a repaired chunk payload into `out` (cleared first), returning
/// the decoded length. Decoding into a caller-owned buffer lets the
/// session reuse one scratch allocation across every chunk of a transfer.
pub fn decode_chunk_into(payload: &str, out: &mut Vec<u8>) -> Result<usize, DecodeError> {
    out.clear();
    let repaired = repair_padding(payload)?;
    STANDARD.decode_vec(repaired.as_bytes(), out)?;
    Ok(out.len())
}

/// One-shot variant of [`decode_chunk_into`].
pub fn decode_chunk(payload: &str) -> Result<Vec<u8>, DecodeError> {
    let mut out = Vec::new();
    decode_chunk_into(payload, &mut out)?;
    Ok(out)
}

/// Validate the alphabet and normalize padding. Rejects out-of-alphabet
/// characters before any decode work happens; a length of 4k+1 after
/// stripping is impossible for any split of a valid stream and is
/// rejected outright.
fn repair_padding(payload: &str) -> Result<String, DecodeError> {
    let trimmed: String = payload.chars().filter(|c| !c.is_ascii_whitespace()).collect();

    let mut padding_seen = false;
    for (index, ch) in trimmed.chars().enumerate() {
        match ch {
            'A'..='Z' | 'a'..='z' | '0'..='9' | '+' | '/' => {
                if padding_seen {
                    return Err(DecodeError::EmbeddedPadding);
                }
            }
            '=' => padding_seen = true,
            _ => return Err(DecodeError::InvalidChar { index, ch }),
        }
    }

    let mut repaired: String = trimmed.trim_end_matches('=').to_string();
    match repaired.len() % 4 {
        0 => {}
        1 => return Err(DecodeError::ImpossibleLength(repaired.len())),
        rem => {
            for _ in 0..(4 - rem) {
                repaired.push('=');
            }
        }
    }
    Ok(repaired)
}
