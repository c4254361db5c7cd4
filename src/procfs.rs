//! Process memory map parsing.
//!
//! Reads the `/proc/[pid]/maps` record format and reduces it to the set of
//! writable ranges, the only places an overflowed pattern can land.

use std::collections::BTreeMap;

use log::debug;

use crate::error::{Error, Result};
use crate::types::{AddressRange, VirtAddr};

/// A single memory region from a maps listing.
#[derive(Debug, Clone)]
pub struct MemoryRegion {
    pub start: VirtAddr,
    pub end: VirtAddr,
    pub perms: Permissions,
    pub offset: u64,
    pub pathname: String,
}

impl MemoryRegion {
    pub fn range(&self) -> AddressRange {
        AddressRange {
            start: self.start,
            end: self.end,
            writable: self.perms.write,
        }
    }
}

/// Memory region permissions (rwxp/s).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permissions {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    pub private: bool,
}

impl Permissions {
    /// Parse a 4-character permissions token such as `rw-p`.
    pub fn parse(token: &str) -> Option<Self> {
        let b = token.as_bytes();
        if b.len() != 4 {
            return None;
        }
        let flag = |byte: u8, set: u8| match byte {
            x if x == set => Some(true),
            b'-' => Some(false),
            _ => None,
        };
        Some(Permissions {
            read: flag(b[0], b'r')?,
            write: flag(b[1], b'w')?,
            execute: flag(b[2], b'x')?,
            private: match b[3] {
                b'p' => true,
                b's' => false,
                _ => return None,
            },
        })
    }
}

impl std::fmt::Display for Permissions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{}{}{}",
            if self.read { 'r' } else { '-' },
            if self.write { 'w' } else { '-' },
            if self.execute { 'x' } else { '-' },
            if self.private { 'p' } else { 's' },
        )
    }
}

/// Writable ranges keyed by start address, iterated in ascending order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeSet {
    ranges: BTreeMap<VirtAddr, VirtAddr>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `[start, end)`. Empty or inverted spans are ignored; a second
    /// range with the same start replaces the first.
    pub fn insert(&mut self, start: VirtAddr, end: VirtAddr) -> bool {
        if start >= end {
            return false;
        }
        self.ranges.insert(start, end);
        true
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = AddressRange> + '_ {
        self.ranges.iter().map(|(&start, &end)| AddressRange {
            start,
            end,
            writable: true,
        })
    }

    pub fn total_bytes(&self) -> u64 {
        self.iter().map(|r| r.len()).sum()
    }
}

impl FromIterator<(VirtAddr, VirtAddr)> for RangeSet {
    fn from_iter<I: IntoIterator<Item = (VirtAddr, VirtAddr)>>(iter: I) -> Self {
        let mut set = RangeSet::new();
        for (start, end) in iter {
            set.insert(start, end);
        }
        set
    }
}

/// Read the raw text of `/proc/[pid]/maps`.
pub fn read_maps_text(pid: i32) -> Result<String> {
    Ok(std::fs::read_to_string(format!("/proc/{}/maps", pid))?)
}

/// Parse `/proc/[pid]/maps` into a list of memory regions.
pub fn read_memory_maps(pid: i32) -> Result<Vec<MemoryRegion>> {
    Ok(parse_maps(&read_maps_text(pid)?))
}

/// Parse the contents of a maps listing, skipping malformed records.
pub fn parse_maps(content: &str) -> Vec<MemoryRegion> {
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match parse_record(line) {
            Ok(region) => Some(region),
            Err(e) => {
                debug!("{}", e);
                None
            }
        })
        .collect()
}

/// Writable ranges of a maps listing. Unparseable input yields an empty set.
pub fn writable_ranges(content: &str) -> RangeSet {
    parse_maps(content)
        .iter()
        .map(MemoryRegion::range)
        .filter(|range| range.writable)
        .map(|range| (range.start, range.end))
        .collect()
}

/// Parse one maps record.
///
/// Format: `7f8a1000-7f8a2000 rw-p 00000000 08:01 12345  /lib/libc.so.6`.
/// Only the address span and the permissions are required; the offset,
/// device, inode and path columns may be absent.
pub fn parse_record(line: &str) -> Result<MemoryRegion> {
    let skip = |reason: &str| Error::MapParseSkip {
        line: line.to_string(),
        reason: reason.to_string(),
    };

    let mut fields = line.split_whitespace();
    let span = fields.next().ok_or_else(|| skip("missing address span"))?;
    let perms_str = fields.next().ok_or_else(|| skip("missing permissions"))?;

    let (start_str, end_str) = span
        .split_once('-')
        .ok_or_else(|| skip("address span has no '-' separator"))?;
    let start = u64::from_str_radix(start_str, 16)
        .map_err(|_| skip("start address is not hexadecimal"))?;
    let end =
        u64::from_str_radix(end_str, 16).map_err(|_| skip("end address is not hexadecimal"))?;
    if start >= end {
        return Err(skip("start address is not below end address"));
    }

    let perms = Permissions::parse(perms_str).ok_or_else(|| skip("bad permissions token"))?;

    let offset = fields
        .next()
        .and_then(|s| u64::from_str_radix(s, 16).ok())
        .unwrap_or(0);
    let _dev = fields.next();
    let _inode = fields.next();
    let pathname = fields.collect::<Vec<_>>().join(" ");

    Ok(MemoryRegion {
        start: VirtAddr(start),
        end: VirtAddr(end),
        perms,
        offset,
        pathname,
    })
}
