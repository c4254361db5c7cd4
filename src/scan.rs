//! Searching registers and writable memory for pattern data.
//!
//! Ranges are walked in ascending address order, one byte at a time, and
//! every non-zero 4-byte window is looked up in the pattern. Memory is
//! fetched through a [`MemoryReader`] in chunks of
//! [`ScanConfig::chunk_size`] bytes; the last three bytes of a chunk are
//! carried into the next read so windows spanning two chunks are still seen
//! exactly once.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};

use crate::config::ScanConfig;
use crate::error::{Error, Result};
use crate::findings::{Finding, FindingSet, RegisterHit};
use crate::pattern::{PatternCodec, WINDOW};
use crate::procfs::RangeSet;
use crate::types::{AddressRange, VirtAddr};

/// Register name to value, captured when the search starts.
pub type RegisterSnapshot = BTreeMap<String, u64>;

/// Reads bytes out of the target's address space.
///
/// Closures of the form `Fn(VirtAddr, usize) -> Result<Vec<u8>>` implement
/// this directly.
pub trait MemoryReader: Send + Sync {
    fn read(&self, addr: VirtAddr, len: usize) -> Result<Vec<u8>>;
}

impl<F> MemoryReader for F
where
    F: Fn(VirtAddr, usize) -> Result<Vec<u8>> + Send + Sync,
{
    fn read(&self, addr: VirtAddr, len: usize) -> Result<Vec<u8>> {
        self(addr, len)
    }
}

/// An in-memory image mapped at `base`, e.g. a saved dump.
#[derive(Debug, Clone)]
pub struct SliceReader {
    base: VirtAddr,
    data: Vec<u8>,
}

impl SliceReader {
    pub fn new(base: VirtAddr, data: Vec<u8>) -> Self {
        SliceReader { base, data }
    }

    /// Overwrite bytes at an absolute address inside the image.
    pub fn write(&mut self, addr: VirtAddr, bytes: &[u8]) -> Result<()> {
        let start = addr
            .addr()
            .checked_sub(self.base.addr())
            .map(|off| off as usize)
            .filter(|&off| off + bytes.len() <= self.data.len())
            .ok_or_else(|| Error::Other(format!("{} is outside the image", addr)))?;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}

impl MemoryReader for SliceReader {
    fn read(&self, addr: VirtAddr, len: usize) -> Result<Vec<u8>> {
        let unreadable = || Error::UnreadableRegion {
            addr,
            len,
            reason: "outside the image".into(),
        };
        let start = addr
            .addr()
            .checked_sub(self.base.addr())
            .ok_or_else(unreadable)? as usize;
        let end = start.checked_add(len).ok_or_else(unreadable)?;
        self.data
            .get(start..end)
            .map(<[u8]>::to_vec)
            .ok_or_else(unreadable)
    }
}

/// Cooperative cancellation flag shared between a scan and its owner.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Progress notifications. Informational only; every method defaults to a no-op.
pub trait ScanObserver {
    fn range_started(&mut self, _range: &AddressRange) {}
    fn range_finished(&mut self, _range: &AddressRange, _found: usize) {}
    fn range_skipped(&mut self, _range: &AddressRange, _reason: &str) {}
    fn unreadable(&mut self, _error: &Error) {}
    fn finding(&mut self, _finding: &Finding) {}
}

impl ScanObserver for () {}

/// Reports progress through the `log` facade.
#[derive(Debug, Default)]
pub struct LogObserver {
    unreadable_chunks: usize,
}

impl LogObserver {
    pub fn unreadable_chunks(&self) -> usize {
        self.unreadable_chunks
    }
}

impl ScanObserver for LogObserver {
    fn range_started(&mut self, range: &AddressRange) {
        info!("scanning {} ({} bytes)", range, range.len());
    }

    fn range_finished(&mut self, range: &AddressRange, found: usize) {
        debug!("finished {}: {} finding(s)", range, found);
    }

    fn range_skipped(&mut self, range: &AddressRange, reason: &str) {
        warn!("skipping {}: {}", range, reason);
    }

    fn unreadable(&mut self, error: &Error) {
        self.unreadable_chunks += 1;
        debug!("{}", error);
    }
}

/// Outcome of [`scan_ranges`].
#[derive(Debug, Clone, Default)]
pub struct RangeScan {
    pub findings: FindingSet,
    /// Set when the token fired before every range was walked.
    pub cancelled: bool,
}

/// Look up every register value in the pattern.
///
/// Only the low 32 bits are used: a 64-bit register loaded from overwritten
/// memory holds the bytes at the lowest address there.
pub fn scan_registers(registers: &RegisterSnapshot, codec: &PatternCodec) -> Vec<RegisterHit> {
    registers
        .iter()
        .filter_map(|(name, &value)| {
            codec.offset_of_u32(value as u32).map(|offset| RegisterHit {
                name: name.clone(),
                value,
                offset,
            })
        })
        .collect()
}

/// Walk every range in `ranges` and record each address holding pattern data.
///
/// Cancellation is checked before every window. When it fires, the result
/// holds exactly the findings for addresses already examined.
pub fn scan_ranges(
    ranges: &RangeSet,
    codec: &PatternCodec,
    reader: &dyn MemoryReader,
    cancel: &CancelToken,
    config: &ScanConfig,
    observer: &mut dyn ScanObserver,
) -> RangeScan {
    let mut scan = RangeScan::default();

    for range in ranges.iter() {
        if cancel.is_cancelled() {
            scan.cancelled = true;
            break;
        }
        if let Some(max) = config.max_range_len {
            if range.len() > max {
                observer.range_skipped(&range, "larger than the configured maximum");
                continue;
            }
        }

        observer.range_started(&range);
        let before = scan.findings.len();
        let finished = scan_range(
            &range,
            codec,
            reader,
            cancel,
            config.chunk_size.max(WINDOW),
            &mut scan.findings,
            observer,
        );
        observer.range_finished(&range, scan.findings.len() - before);

        if !finished {
            scan.cancelled = true;
            break;
        }
    }

    scan
}

/// Returns `false` if cancelled part way through.
fn scan_range(
    range: &AddressRange,
    codec: &PatternCodec,
    reader: &dyn MemoryReader,
    cancel: &CancelToken,
    chunk_size: usize,
    findings: &mut FindingSet,
    observer: &mut dyn ScanObserver,
) -> bool {
    if range.len() < WINDOW as u64 {
        return true;
    }
    let last_window = range.end.addr() - WINDOW as u64;

    // `buf[0]` lives at `buf_base`.
    let mut buf: Vec<u8> = Vec::with_capacity(chunk_size + WINDOW);
    let mut buf_base = range.start.addr();
    let mut addr = range.start.addr();

    while addr < range.end.addr() {
        let len = (range.end.addr() - addr).min(chunk_size as u64) as usize;

        match reader.read(VirtAddr(addr), len) {
            Ok(data) if data.len() == len => {
                if buf.is_empty() {
                    buf_base = addr;
                }
                buf.extend_from_slice(&data);
            }
            result => {
                let reason = match result {
                    Ok(data) => format!("short read ({} of {} bytes)", data.len(), len),
                    Err(e) => e.to_string(),
                };
                observer.unreadable(&Error::UnreadableRegion {
                    addr: VirtAddr(addr),
                    len,
                    reason,
                });
                buf.clear();
                addr += len as u64;
                continue;
            }
        }

        for (i, window) in buf.windows(WINDOW).enumerate() {
            let window_addr = buf_base + i as u64;
            if window_addr > last_window {
                break;
            }
            if cancel.is_cancelled() {
                return false;
            }
            let value = [window[0], window[1], window[2], window[3]];
            if value == [0; WINDOW] {
                continue;
            }
            if let Some(offset) = codec.find_offset(value) {
                let finding = Finding {
                    address: VirtAddr(window_addr),
                    offset,
                };
                findings.record(finding);
                observer.finding(&finding);
            }
        }

        // Keep the bytes whose windows are not complete yet.
        let keep = buf.len().min(WINDOW - 1);
        let consumed = buf.len() - keep;
        buf.drain(..consumed);
        buf_base += consumed as u64;
        addr += len as u64;
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::generate;
    use crate::procfs::writable_ranges;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Recorder {
        started: Vec<VirtAddr>,
        skipped: usize,
        unreadable: usize,
        findings: usize,
    }

    impl ScanObserver for Recorder {
        fn range_started(&mut self, range: &AddressRange) {
            self.started.push(range.start);
        }
        fn range_skipped(&mut self, _range: &AddressRange, _reason: &str) {
            self.skipped += 1;
        }
        fn unreadable(&mut self, error: &Error) {
            assert!(matches!(error, Error::UnreadableRegion { .. }));
            self.unreadable += 1;
        }
        fn finding(&mut self, _finding: &Finding) {
            self.findings += 1;
        }
    }

    fn zeroed(base: u64, len: usize) -> SliceReader {
        SliceReader::new(VirtAddr(base), vec![0u8; len])
    }

    fn run(ranges: &RangeSet, reader: &dyn MemoryReader, config: ScanConfig) -> RangeScan {
        let codec = PatternCodec::new();
        scan_ranges(ranges, &codec, reader, &CancelToken::new(), &config, &mut ())
    }

    #[test]
    fn finds_offset_12_in_writable_range() {
        let pattern = generate(30).unwrap();
        let mut reader = zeroed(0x7f0000, 0x1000);
        reader.write(VirtAddr(0x7f0040), &pattern[12..16]).unwrap();

        let ranges = writable_ranges("7f0000-7f1000 rw-p 00000000 00:00 0");
        let scan = run(&ranges, &reader, ScanConfig::default());

        assert!(!scan.cancelled);
        assert_eq!(scan.findings.len(), 1);
        assert_eq!(scan.findings.get(VirtAddr(0x7f0040)), Some(12));
    }

    #[test]
    fn windows_spanning_chunks_are_seen_once() {
        let pattern = generate(64).unwrap();
        let mut reader = zeroed(0x1000, 0x100);
        reader.write(VirtAddr(0x1005), &pattern).unwrap();

        let ranges: RangeSet = [(VirtAddr(0x1000), VirtAddr(0x1100))].into_iter().collect();
        for chunk in [4, 5, 7, 16, 4096] {
            let scan = run(&ranges, &reader, ScanConfig::default().with_chunk_size(chunk));
            assert_eq!(scan.findings.len(), 61, "chunk size {}", chunk);
            for f in scan.findings.iter() {
                assert_eq!(f.address.addr() - 0x1005, f.offset as u64);
            }
        }
    }

    #[test]
    fn last_window_of_range_is_scanned() {
        let pattern = generate(8).unwrap();
        let mut reader = zeroed(0x2000, 0x20);
        reader.write(VirtAddr(0x201c), &pattern[4..8]).unwrap();

        let ranges: RangeSet = [(VirtAddr(0x2000), VirtAddr(0x2020))].into_iter().collect();
        let scan = run(&ranges, &reader, ScanConfig::default().with_chunk_size(6));
        assert_eq!(scan.findings.get(VirtAddr(0x201c)), Some(4));
    }

    #[test]
    fn reversed_bytes_in_memory_are_found() {
        let pattern = generate(200).unwrap();
        let mut window = pattern[100..104].to_vec();
        window.reverse();
        let mut reader = zeroed(0x3000, 0x40);
        reader.write(VirtAddr(0x3010), &window).unwrap();

        let ranges: RangeSet = [(VirtAddr(0x3000), VirtAddr(0x3040))].into_iter().collect();
        let scan = run(&ranges, &reader, ScanConfig::default());
        assert_eq!(scan.findings.get(VirtAddr(0x3010)), Some(100));
    }

    #[test]
    fn unreadable_chunks_are_skipped() {
        let pattern = generate(16).unwrap();
        let mut image = zeroed(0x0, 0x3000);
        image.write(VirtAddr(0x2100), &pattern[8..12]).unwrap();

        let reader = move |addr: VirtAddr, len: usize| -> Result<Vec<u8>> {
            if (0x1000..0x2000).contains(&addr.addr()) {
                return Err(Error::Other("page not present".into()));
            }
            image.read(addr, len)
        };

        let ranges: RangeSet = [(VirtAddr(0x0), VirtAddr(0x3000))].into_iter().collect();
        let mut recorder = Recorder::default();
        let scan = scan_ranges(
            &ranges,
            &PatternCodec::new(),
            &reader,
            &CancelToken::new(),
            &ScanConfig::default(),
            &mut recorder,
        );

        assert_eq!(recorder.unreadable, 1);
        assert_eq!(recorder.findings, 1);
        assert_eq!(scan.findings.get(VirtAddr(0x2100)), Some(8));
    }

    #[test]
    fn ranges_are_walked_in_address_order() {
        let reader = zeroed(0x1000, 0x4000);
        let ranges = writable_ranges(
            "4000-5000 rw-p 0 0 0\n1000-2000 rw-p 0 0 0\n3000-3800 r--p 0 0 0\n2000-3000 rw-p 0 0 0",
        );
        let mut recorder = Recorder::default();
        scan_ranges(
            &ranges,
            &PatternCodec::new(),
            &reader,
            &CancelToken::new(),
            &ScanConfig::default(),
            &mut recorder,
        );
        assert_eq!(
            recorder.started,
            vec![VirtAddr(0x1000), VirtAddr(0x2000), VirtAddr(0x4000)]
        );
    }

    #[test]
    fn oversized_ranges_are_skipped() {
        let reader = zeroed(0x1000, 0x2000);
        let ranges: RangeSet = [(VirtAddr(0x1000), VirtAddr(0x3000))].into_iter().collect();
        let mut recorder = Recorder::default();
        scan_ranges(
            &ranges,
            &PatternCodec::new(),
            &reader,
            &CancelToken::new(),
            &ScanConfig::default().with_max_range_len(Some(0x1000)),
            &mut recorder,
        );
        assert_eq!(recorder.skipped, 1);
        assert!(recorder.started.is_empty());
    }

    #[test]
    fn cancel_mid_range_keeps_only_earlier_findings() {
        let pattern = generate(64).unwrap();
        let mut image = zeroed(0x0, 0x8000);
        image.write(VirtAddr(0x1000), &pattern[0..4]).unwrap();
        image.write(VirtAddr(0x5000), &pattern[20..24]).unwrap();

        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let reads = Arc::new(AtomicUsize::new(0));
        let counter = reads.clone();
        let reader = move |addr: VirtAddr, len: usize| -> Result<Vec<u8>> {
            counter.fetch_add(1, Ordering::SeqCst);
            if addr.addr() >= 0x3000 {
                trigger.cancel();
            }
            image.read(addr, len)
        };

        let ranges: RangeSet = [(VirtAddr(0x0), VirtAddr(0x8000))].into_iter().collect();
        let scan = scan_ranges(
            &ranges,
            &PatternCodec::new(),
            &reader,
            &cancel,
            &ScanConfig::default(),
            &mut (),
        );

        assert!(scan.cancelled);
        assert_eq!(scan.findings.len(), 1);
        assert_eq!(scan.findings.get(VirtAddr(0x1000)), Some(0));
        assert!(scan.findings.iter().all(|f| f.address.addr() < 0x3000));
        assert_eq!(reads.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn cancelled_before_start_scans_nothing() {
        let reader = zeroed(0x1000, 0x1000);
        let ranges: RangeSet = [(VirtAddr(0x1000), VirtAddr(0x2000))].into_iter().collect();
        let cancel = CancelToken::new();
        cancel.cancel();
        let scan = scan_ranges(
            &ranges,
            &PatternCodec::new(),
            &reader,
            &cancel,
            &ScanConfig::default(),
            &mut (),
        );
        assert!(scan.cancelled);
        assert!(scan.findings.is_empty());
    }

    #[test]
    fn registers_holding_pattern_are_reported() {
        let codec = PatternCodec::new();
        let pattern = codec.as_bytes();
        let rbp = u64::from_le_bytes(pattern[40..48].try_into().unwrap());

        let mut regs = RegisterSnapshot::new();
        regs.insert("rax".into(), 0);
        regs.insert("rbp".into(), rbp);
        regs.insert("rip".into(), 0x41306141);
        regs.insert("rsp".into(), 0x7ffd5e391f00);

        let hits = scan_registers(&regs, &codec);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].name, "rbp");
        assert_eq!(hits[0].offset, 40);
        assert_eq!(hits[1].name, "rip");
        assert_eq!(hits[1].offset, 0);
    }

    #[test]
    fn slice_reader_bounds() {
        let reader = zeroed(0x1000, 0x10);
        assert_eq!(reader.read(VirtAddr(0x1008), 8).unwrap().len(), 8);
        assert!(reader.read(VirtAddr(0x1009), 8).is_err());
        assert!(reader.read(VirtAddr(0xfff), 1).is_err());
    }
}
