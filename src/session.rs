//! Request entry points: `create`, `find`, `search` and `cancel`.
//!
//! A [`Session`] owns the pattern (built once, shared read-only with the
//! scan worker) and the single [`ScanJob`] slot. Hosts drive it with their
//! own transport: the bundled CLI, a debugger plugin, tests.

use std::sync::Arc;

use crossbeam_channel::Receiver;
use log::info;

use crate::config::ScanConfig;
use crate::error::{Error, Result};
use crate::findings::ScanReport;
use crate::job::{ScanEvent, ScanJob, SearchRequest};
use crate::pattern::{PatternCodec, Query, WINDOW};
use crate::procfs;
use crate::scan::{MemoryReader, RegisterSnapshot};
use crate::types::JobState;

pub struct Session {
    codec: Arc<PatternCodec>,
    config: ScanConfig,
    job: ScanJob,
}

impl Session {
    pub fn new(config: ScanConfig) -> Result<Self> {
        config.validate()?;
        Ok(Session {
            codec: Arc::new(PatternCodec::new()),
            config,
            job: ScanJob::new(),
        })
    }

    pub fn codec(&self) -> &PatternCodec {
        &self.codec
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// The first `length` bytes of the pattern.
    pub fn create(&self, length: usize) -> Result<&[u8]> {
        self.codec.create(length)
    }

    /// Offset of a captured 4-byte value, in either byte order.
    pub fn find(&self, value: [u8; WINDOW]) -> Option<usize> {
        self.codec.find_offset(value)
    }

    /// Offset of a parsed user query: hex value or crash-dump text.
    pub fn lookup(&self, query: &Query) -> Option<usize> {
        self.codec.lookup(query)
    }

    /// Start a background search of every writable range in `map_text`
    /// plus every register in `registers`.
    ///
    /// An empty register snapshot means nothing is attached and the request
    /// is refused before any work starts. A search already in flight is
    /// cancelled and joined first.
    pub fn search(
        &mut self,
        map_text: &str,
        registers: RegisterSnapshot,
        reader: Arc<dyn MemoryReader>,
    ) -> Result<Receiver<ScanEvent>> {
        if registers.is_empty() {
            return Err(Error::NoTarget);
        }

        let ranges = procfs::writable_ranges(map_text);
        info!(
            "searching {} register(s) and {} writable range(s) ({} bytes)",
            registers.len(),
            ranges.len(),
            ranges.total_bytes()
        );

        self.job.start(SearchRequest {
            codec: Arc::clone(&self.codec),
            ranges,
            registers,
            reader,
            config: self.config,
        })
    }

    pub fn cancel(&mut self) -> Option<ScanReport> {
        self.job.cancel()
    }

    pub fn wait(&mut self) -> Option<ScanReport> {
        self.job.wait()
    }

    /// Non-blocking: the report if the search has just finished.
    pub fn poll(&mut self) -> Option<ScanReport> {
        self.job.try_finish()
    }

    pub fn state(&self) -> JobState {
        self.job.state()
    }

    pub fn is_searching(&self) -> bool {
        self.job.is_running()
    }

    pub fn last_report(&self) -> Option<&ScanReport> {
        self.job.last_report()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::findings::NOTHING_FOUND;
    use crate::pattern::PATTERN_MAX;
    use crate::scan::SliceReader;
    use crate::types::VirtAddr;

    const MAPS: &str = "\
7f0000-7f1000 rw-p 00000000 00:00 0 [heap]
7f1000-7f2000 r-xp 00000000 08:01 42 /usr/bin/victim";

    fn session() -> Session {
        Session::new(ScanConfig::default()).unwrap()
    }

    fn registers(rip: u64) -> RegisterSnapshot {
        let mut regs = RegisterSnapshot::new();
        regs.insert("rip".into(), rip);
        regs.insert("rsp".into(), 0x7ffd5e391f00);
        regs
    }

    #[test]
    fn create_and_find() {
        let session = session();
        let pattern = session.create(30).unwrap().to_vec();
        assert_eq!(&pattern[..9], b"Aa0Aa1Aa2");
        assert_eq!(session.find([pattern[12], pattern[13], pattern[14], pattern[15]]), Some(12));
        assert_eq!(session.find([0, 0, 0, 0]), None);
        assert_eq!(session.lookup(&Query::Text("Aa4Aa5".into())), Some(12));
        assert!(matches!(
            session.create(PATTERN_MAX + 1),
            Err(Error::InvalidLength { .. })
        ));
    }

    #[test]
    fn search_without_target_is_refused() {
        let mut session = session();
        let reader = Arc::new(SliceReader::new(VirtAddr(0), Vec::new()));
        let result = session.search(MAPS, RegisterSnapshot::new(), reader);
        assert!(matches!(result, Err(Error::NoTarget)));
        assert_eq!(session.state(), JobState::Idle);
    }

    #[test]
    fn end_to_end_overflow_offset() {
        let mut session = session();
        let pattern = session.create(30).unwrap().to_vec();

        // The crashed process: pattern bytes 12..16 landed in the heap and
        // bytes 20..24 were popped into rip.
        let mut heap = SliceReader::new(VirtAddr(0x7f0000), vec![0u8; 0x1000]);
        heap.write(VirtAddr(0x7f0abc), &pattern[12..16]).unwrap();
        let rip = u32::from_le_bytes([pattern[20], pattern[21], pattern[22], pattern[23]]);

        session
            .search(MAPS, registers(rip as u64), Arc::new(heap))
            .unwrap();
        let report = session.wait().unwrap();
        assert!(!session.is_searching());

        assert_eq!(report.state, JobState::Completed);
        assert_eq!(report.findings.len(), 1);
        assert_eq!(report.findings.get(VirtAddr(0x7f0abc)), Some(12));
        assert_eq!(report.registers.len(), 1);
        assert_eq!(report.registers[0].name, "rip");
        assert_eq!(report.registers[0].offset, 20);
        assert!(report.render().contains("Found at 0x7f0abc offset 12"));
    }

    #[test]
    fn restart_after_cancel_keeps_partial_report() {
        let mut session = session();
        let pattern = session.create(30).unwrap().to_vec();
        let window = [pattern[12], pattern[13], pattern[14], pattern[15]];
        let slow = Arc::new(move |addr: VirtAddr, len: usize| -> Result<Vec<u8>> {
            std::thread::sleep(std::time::Duration::from_millis(1));
            let mut chunk = vec![0u8; len];
            if addr == VirtAddr(0x10000000) {
                chunk[..4].copy_from_slice(&window);
            }
            Ok(chunk)
        });
        let maps = "10000000-14000000 rw-p 00000000 00:00 0";

        let rx = session.search(maps, registers(0x401000), slow).unwrap();
        loop {
            match rx.recv_timeout(std::time::Duration::from_secs(10)) {
                Ok(ScanEvent::Finding(_)) => break,
                Ok(_) => continue,
                Err(e) => panic!("no finding before timeout: {}", e),
            }
        }
        assert!(session.is_searching());

        let partial = session.cancel().unwrap();
        assert_eq!(partial.state, JobState::Cancelled);
        assert_eq!(partial.findings.get(VirtAddr(0x10000000)), Some(12));

        let heap = SliceReader::new(VirtAddr(0x7f0000), vec![0u8; 0x1000]);
        session.search(MAPS, registers(0x401000), Arc::new(heap)).unwrap();
        assert_eq!(session.wait().unwrap().state, JobState::Completed);
    }

    #[test]
    fn clean_process_reports_nothing_found() {
        let mut session = session();
        let heap = SliceReader::new(VirtAddr(0x7f0000), vec![0u8; 0x1000]);
        session
            .search(MAPS, registers(0x401000), Arc::new(heap))
            .unwrap();
        let report = session.wait().unwrap();
        assert!(report.is_empty());
        assert_eq!(report.render(), NOTHING_FOUND);
        assert_eq!(session.last_report(), Some(&report));
    }
}
