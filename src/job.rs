//! The background search slot.
//!
//! A [`ScanJob`] runs at most one search at a time on a dedicated thread.
//! The thread owns its copy of the ranges, the register snapshot and the
//! result set; the result set is handed back through the join handle, so the
//! foreground never observes it half-written. Progress streams out over a
//! channel while the thread runs.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{error, info, trace};

use crate::config::ScanConfig;
use crate::error::{Error, Result};
use crate::findings::{Finding, RegisterHit, ScanReport};
use crate::pattern::PatternCodec;
use crate::procfs::RangeSet;
use crate::scan::{self, CancelToken, LogObserver, MemoryReader, RegisterSnapshot, ScanObserver};
use crate::types::{AddressRange, JobState, VirtAddr};

/// Everything a search needs; moved onto the worker thread.
pub struct SearchRequest {
    pub codec: Arc<PatternCodec>,
    pub ranges: RangeSet,
    pub registers: RegisterSnapshot,
    pub reader: Arc<dyn MemoryReader>,
    pub config: ScanConfig,
}

/// Progress and results streamed from the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    Register(RegisterHit),
    RangeStarted(AddressRange),
    RangeFinished { range: AddressRange, found: usize },
    RangeSkipped { range: AddressRange, reason: String },
    Unreadable { addr: VirtAddr, len: usize },
    Finding(Finding),
    /// Always the last event of a search.
    Done(JobState),
}

/// Forwards scan progress into the event channel and the log. A dropped
/// receiver is not an error; the search just runs without an audience.
struct ChannelObserver {
    tx: Sender<ScanEvent>,
    log: LogObserver,
}

impl ChannelObserver {
    fn send(&self, event: ScanEvent) {
        if let Err(e) = self.tx.send(event) {
            trace!("event dropped, no receiver: {:?}", e.into_inner());
        }
    }
}

impl ScanObserver for ChannelObserver {
    fn range_started(&mut self, range: &AddressRange) {
        self.log.range_started(range);
        self.send(ScanEvent::RangeStarted(*range));
    }

    fn range_finished(&mut self, range: &AddressRange, found: usize) {
        self.log.range_finished(range, found);
        self.send(ScanEvent::RangeFinished {
            range: *range,
            found,
        });
    }

    fn range_skipped(&mut self, range: &AddressRange, reason: &str) {
        self.log.range_skipped(range, reason);
        self.send(ScanEvent::RangeSkipped {
            range: *range,
            reason: reason.to_string(),
        });
    }

    fn unreadable(&mut self, error: &Error) {
        self.log.unreadable(error);
        if let Error::UnreadableRegion { addr, len, .. } = error {
            self.send(ScanEvent::Unreadable {
                addr: *addr,
                len: *len,
            });
        }
    }

    fn finding(&mut self, finding: &Finding) {
        self.send(ScanEvent::Finding(*finding));
    }
}

/// Single cancellable worker slot: `Idle -> Running -> Completed | Cancelled`.
pub struct ScanJob {
    state: JobState,
    cancel: CancelToken,
    handle: Option<JoinHandle<ScanReport>>,
    last_report: Option<ScanReport>,
}

impl ScanJob {
    pub fn new() -> Self {
        ScanJob {
            state: JobState::Idle,
            cancel: CancelToken::new(),
            handle: None,
            last_report: None,
        }
    }

    /// Start a search, cancelling and joining any search still running.
    ///
    /// Returns the receiving end of the event stream. It disconnects once
    /// the worker has exited.
    pub fn start(&mut self, request: SearchRequest) -> Result<Receiver<ScanEvent>> {
        if self.handle.is_some() {
            info!("replacing running search");
            self.cancel();
        }

        let cancel = CancelToken::new();
        let worker_cancel = cancel.clone();
        let (tx, rx) = unbounded();

        let handle = thread::Builder::new()
            .name("pattern-scan".into())
            .spawn(move || run_search(request, worker_cancel, tx))?;

        self.cancel = cancel;
        self.handle = Some(handle);
        self.state = JobState::Running;
        self.last_report = None;
        Ok(rx)
    }

    /// Stop the running search and wait for the worker to exit.
    ///
    /// Nothing is sent on the event channel after this returns. Returns the
    /// (possibly partial) report, or `None` when no search was running.
    pub fn cancel(&mut self) -> Option<ScanReport> {
        if self.handle.is_none() {
            return None;
        }
        self.cancel.cancel();
        self.join()
    }

    /// Block until the running search finishes on its own.
    pub fn wait(&mut self) -> Option<ScanReport> {
        self.join()
    }

    /// Collect the report if the worker has already exited; never blocks.
    pub fn try_finish(&mut self) -> Option<ScanReport> {
        match &self.handle {
            Some(handle) if handle.is_finished() => self.join(),
            _ => None,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Report of the most recently collected search.
    pub fn last_report(&self) -> Option<&ScanReport> {
        self.last_report.as_ref()
    }

    fn join(&mut self) -> Option<ScanReport> {
        let handle = self.handle.take()?;
        match handle.join() {
            Ok(report) => {
                info!(
                    "search {}: {} register hit(s), {} memory finding(s)",
                    report.state,
                    report.registers.len(),
                    report.findings.len()
                );
                self.state = report.state;
                self.last_report = Some(report.clone());
                Some(report)
            }
            Err(_) => {
                error!("search worker panicked");
                self.state = JobState::Cancelled;
                None
            }
        }
    }
}

impl Default for ScanJob {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ScanJob {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn run_search(request: SearchRequest, cancel: CancelToken, tx: Sender<ScanEvent>) -> ScanReport {
    let mut observer = ChannelObserver {
        tx,
        log: LogObserver::default(),
    };

    let registers = scan::scan_registers(&request.registers, &request.codec);
    for hit in &registers {
        observer.send(ScanEvent::Register(hit.clone()));
    }

    let scan = scan::scan_ranges(
        &request.ranges,
        &request.codec,
        request.reader.as_ref(),
        &cancel,
        &request.config,
        &mut observer,
    );

    let state = if scan.cancelled {
        JobState::Cancelled
    } else {
        JobState::Completed
    };
    if observer.log.unreadable_chunks() > 0 {
        info!(
            "{} chunk(s) could not be read and were skipped",
            observer.log.unreadable_chunks()
        );
    }
    observer.send(ScanEvent::Done(state));

    ScanReport {
        registers,
        findings: scan.findings,
        state,
    }
}
