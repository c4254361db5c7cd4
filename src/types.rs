use std::fmt;

/// Virtual address in the scanned process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtAddr(pub u64);

impl VirtAddr {
    pub fn addr(self) -> u64 {
        self.0
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl fmt::LowerHex for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl std::ops::Add<u64> for VirtAddr {
    type Output = VirtAddr;
    fn add(self, rhs: u64) -> Self::Output {
        VirtAddr(self.0 + rhs)
    }
}

impl std::ops::Sub<u64> for VirtAddr {
    type Output = VirtAddr;
    fn sub(self, rhs: u64) -> Self::Output {
        VirtAddr(self.0 - rhs)
    }
}

/// A half-open span `[start, end)` of the target's address space.
///
/// Purely descriptive: it owns no memory, it only names addresses that
/// a [`MemoryReader`](crate::scan::MemoryReader) can be asked about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRange {
    pub start: VirtAddr,
    pub end: VirtAddr,
    pub writable: bool,
}

impl AddressRange {
    pub fn len(&self) -> u64 {
        self.end.0.saturating_sub(self.start.0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Byte order applied to a captured 4-byte value before it is compared
/// against the pattern.
///
/// A value lifted from a register is usually the little-endian reading of
/// pattern bytes, while a value typed in from a memory dump is usually in
/// memory order. Lookups try both, in a fixed order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    /// Bytes compared exactly as supplied (big-endian reading of a u32).
    AsGiven,
    /// Bytes compared back to front.
    Reversed,
}

impl Orientation {
    /// Lookup order used by [`PatternCodec::find_offset`](crate::pattern::PatternCodec::find_offset).
    pub const SEARCH_ORDER: [Orientation; 2] = [Orientation::AsGiven, Orientation::Reversed];

    pub fn apply(self, value: [u8; 4]) -> [u8; 4] {
        match self {
            Orientation::AsGiven => value,
            Orientation::Reversed => {
                let [b0, b1, b2, b3] = value;
                [b3, b2, b1, b0]
            }
        }
    }
}

/// Lifecycle of one background search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Running,
    Completed,
    Cancelled,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Idle => "idle",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}
