//! Wormhole codes: the slot number plus the short password, in one string a
//! person can read aloud.
//!
//! The slot is written in decimal, followed by a dash and the password in a
//! 32-symbol alphabet that leaves out the easily confused `l`, `o`, `0` and `1`.
//! Decoding is case-insensitive.

use thiserror::Error;

/// Password length used when a slot creator generates a fresh secret.
pub const DEFAULT_SECRET_LEN: usize = 2;

const ALPHABET: &[u8; 32] = b"abcdefghijkmnpqrstuvwxyz23456789";
const SEPARATOR: char = '-';

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodeError {
    #[error("malformed wormhole code: {0}")]
    Malformed(&'static str),
}

pub fn encode(slot: u64, secret: &[u8]) -> String {
    let mut out = slot.to_string();
    out.push(SEPARATOR);

    let mut acc: u32 = 0;
    let mut bits = 0u32;
    for &byte in secret {
        acc = (acc << 8) | u32::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(ALPHABET[((acc >> bits) & 0x1f) as usize] as char);
            acc &= (1 << bits) - 1;
        }
    }
    if bits > 0 {
        out.push(ALPHABET[((acc << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
}

pub fn decode(code: &str) -> Result<(u64, Vec<u8>), CodeError> {
    let normalized = code.trim().to_ascii_lowercase();
    let (slot, secret) = normalized
        .split_once(SEPARATOR)
        .ok_or(CodeError::Malformed("missing separator"))?;

    if slot.is_empty() || !slot.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CodeError::Malformed("slot is not a number"));
    }
    let slot: u64 = slot
        .parse()
        .map_err(|_| CodeError::Malformed("slot out of range"))?;

    let mut acc: u32 = 0;
    let mut bits = 0u32;
    let mut bytes = Vec::with_capacity(secret.len() * 5 / 8);
    for ch in secret.bytes() {
        let value = ALPHABET
            .iter()
            .position(|&symbol| symbol == ch)
            .ok_or(CodeError::Malformed("character outside the code alphabet"))?;
        acc = (acc << 5) | value as u32;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            bytes.push((acc >> bits) as u8);
            acc &= (1 << bits) - 1;
        }
    }

    // A canonical encoding leaves fewer than five zero padding bits.
    if bits >= 5 || acc != 0 {
        return Err(CodeError::Malformed("trailing bits"));
    }
    if bytes.is_empty() {
        return Err(CodeError::Malformed("empty password"));
    }
    Ok((slot, bytes))
}
