//! Cyclic pattern generation and offset lookup.
//!
//! The pattern is built from three rotating alphabets (uppercase,
//! lowercase, digits), one byte of each per triple: `Aa0Aa1Aa2...`.
//! Every triple is unique across [`PATTERN_MAX`] bytes, so any 4-byte
//! window taken from the pattern maps back to exactly one offset.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::types::Orientation;

const UPPER: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const LOWER: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const DIGITS: &[u8] = b"0123456789";

/// Longest pattern before triples start repeating: 26 * 26 * 10 triples of 3 bytes.
pub const PATTERN_MAX: usize = 26 * 26 * 10 * 3;

/// Width of the values looked up in the pattern.
pub const WINDOW: usize = 4;

/// Generate the first `length` bytes of the cyclic pattern.
pub fn generate(length: usize) -> Result<Vec<u8>> {
    if length > PATTERN_MAX {
        return Err(Error::InvalidLength {
            requested: length,
            max: PATTERN_MAX,
        });
    }

    let mut pattern = Vec::with_capacity(length);
    let (mut ai, mut bi, mut ci) = (0usize, 0usize, 0usize);

    while pattern.len() < length {
        for byte in [UPPER[ai], LOWER[bi], DIGITS[ci]] {
            if pattern.len() == length {
                break;
            }
            pattern.push(byte);
        }

        ci += 1;
        if ci == DIGITS.len() {
            ci = 0;
            bi += 1;
        }
        if bi == LOWER.len() {
            bi = 0;
            ai += 1;
        }
        if ai == UPPER.len() {
            ai = 0;
        }
    }

    Ok(pattern)
}

/// The full-length pattern plus a reverse index over its 4-byte windows.
///
/// Built once per session and shared read-only (typically behind an `Arc`)
/// between the command loop and the scan worker.
#[derive(Debug, Clone)]
pub struct PatternCodec {
    bytes: Vec<u8>,
    /// First offset of every window. Equivalent to a left-to-right scan.
    index: HashMap<[u8; WINDOW], usize>,
}

impl PatternCodec {
    pub fn new() -> Self {
        // PATTERN_MAX is always a valid length.
        let bytes = generate(PATTERN_MAX).unwrap_or_default();

        let mut index = HashMap::with_capacity(bytes.len());
        for (offset, window) in bytes.windows(WINDOW).enumerate() {
            let key = [window[0], window[1], window[2], window[3]];
            index.entry(key).or_insert(offset);
        }

        PatternCodec { bytes, index }
    }

    /// The whole stored pattern.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// A pattern of `length` bytes; always a prefix of the stored pattern.
    pub fn create(&self, length: usize) -> Result<&[u8]> {
        if length > self.bytes.len() {
            return Err(Error::InvalidLength {
                requested: length,
                max: PATTERN_MAX,
            });
        }
        Ok(&self.bytes[..length])
    }

    /// Offset of a captured 4-byte value.
    ///
    /// Each orientation in [`Orientation::SEARCH_ORDER`] is tried over the
    /// whole pattern before the next one, so an as-given match always wins
    /// over a reversed one. `None` means the value is not pattern data.
    pub fn find_offset(&self, value: [u8; WINDOW]) -> Option<usize> {
        Orientation::SEARCH_ORDER
            .iter()
            .find_map(|orientation| self.index.get(&orientation.apply(value)).copied())
    }

    /// Offset of the big-endian bytes of `value`, e.g. a register read.
    pub fn offset_of_u32(&self, value: u32) -> Option<usize> {
        self.find_offset(value.to_be_bytes())
    }

    /// Offset of an arbitrary byte string within the pattern (as given only).
    pub fn offset_of_bytes(&self, needle: &[u8]) -> Option<usize> {
        if let Ok(window) = <[u8; WINDOW]>::try_from(needle) {
            return self.index.get(&window).copied();
        }
        find_subsequence(&self.bytes, needle)
    }

    /// Offset of a parsed [`Query`].
    ///
    /// Bare text is looked up literally first: four bytes in either
    /// orientation, longer text as given. Only when that misses is a token
    /// of hex digits read as a u32, so `Ab0Ab1Ab` is pattern text while
    /// `41306141` and `6141` fall through to their hex values.
    pub fn lookup(&self, query: &Query) -> Option<usize> {
        match query {
            Query::Value(value) => self.find_offset(*value),
            Query::Text(text) => {
                let literal = match <[u8; WINDOW]>::try_from(text.as_bytes()) {
                    Ok(window) => self.find_offset(window),
                    Err(_) => self.offset_of_bytes(text.as_bytes()),
                };
                literal.or_else(|| parse_hex(text).and_then(|value| self.find_offset(value)))
            }
        }
    }
}

impl Default for PatternCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// A user-supplied lookup value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    /// `0x`-prefixed hex, as copied from a register dump.
    Value([u8; WINDOW]),
    /// A bare token, as seen in a crash dump or a hex listing.
    Text(String),
}

/// Parse a lookup value.
///
/// `0x41306141` is always hex. A bare token such as `Aa0A`, `Ab0Ab1Ab` or
/// `41306141` is kept as text; [`PatternCodec::lookup`] decides how to read
/// it.
pub fn parse_query(text: &str) -> Result<Query> {
    let text = text.trim();
    if text.is_empty() {
        return Err(Error::InvalidValue(text.to_string()));
    }
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => parse_hex(hex)
            .map(Query::Value)
            .ok_or_else(|| Error::InvalidValue(text.to_string())),
        None => Ok(Query::Text(text.to_string())),
    }
}

fn parse_hex(hex: &str) -> Option<[u8; WINDOW]> {
    if hex.is_empty() || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u32::from_str_radix(hex, 16).ok().map(u32::to_be_bytes)
}

/// Find the first occurrence of `needle` in `haystack`.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
