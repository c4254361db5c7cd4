//! Collected search results.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::types::{JobState, VirtAddr};

/// Message printed whenever a search turns up nothing.
pub const NOTHING_FOUND: &str = "no pattern found";

/// Pattern data found in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Finding {
    pub address: VirtAddr,
    /// Offset of the 4 bytes at `address` within the pattern.
    pub offset: usize,
}

/// Pattern data found in a register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterHit {
    pub name: String,
    pub value: u64,
    pub offset: usize,
}

/// Findings keyed by address, one per address, reported in address order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FindingSet {
    by_address: BTreeMap<VirtAddr, usize>,
}

impl FindingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a finding; a later finding at the same address replaces the earlier one.
    pub fn record(&mut self, finding: Finding) {
        self.by_address.insert(finding.address, finding.offset);
    }

    pub fn get(&self, address: VirtAddr) -> Option<usize> {
        self.by_address.get(&address).copied()
    }

    pub fn len(&self) -> usize {
        self.by_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Finding> + '_ {
        self.by_address
            .iter()
            .map(|(&address, &offset)| Finding { address, offset })
    }

    pub fn render(&self) -> String {
        if self.is_empty() {
            return NOTHING_FOUND.to_string();
        }
        let mut out = String::new();
        for f in self.iter() {
            let _ = writeln!(out, "Found at {} offset {}", f.address, f.offset);
        }
        out.truncate(out.trim_end().len());
        out
    }
}

impl Extend<Finding> for FindingSet {
    fn extend<I: IntoIterator<Item = Finding>>(&mut self, iter: I) {
        for finding in iter {
            self.record(finding);
        }
    }
}

/// Everything one search produced, handed back when the worker stops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub registers: Vec<RegisterHit>,
    pub findings: FindingSet,
    /// `Completed` or `Cancelled`.
    pub state: JobState,
}

impl ScanReport {
    pub fn is_empty(&self) -> bool {
        self.registers.is_empty() && self.findings.is_empty()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for hit in &self.registers {
            let _ = writeln!(
                out,
                "Found pattern in {} (0x{:016x}) offset {}",
                hit.name, hit.value, hit.offset
            );
        }
        if !self.findings.is_empty() {
            out.push_str(&self.findings.render());
            out.push('\n');
        }
        if self.is_empty() {
            out.push_str(NOTHING_FOUND);
            out.push('\n');
        }
        if self.state == JobState::Cancelled {
            out.push_str("scan cancelled; results are partial\n");
        }
        out.truncate(out.trim_end().len());
        out
    }
}
