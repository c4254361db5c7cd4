//! A live search target: an attached process and the views of it a search
//! needs (registers, maps text, memory).

use crossbeam_channel::Receiver;
use nix::unistd::Pid;

use crate::error::Result;
use crate::job::ScanEvent;
use crate::process::Process;
use crate::procfs::{self, MemoryRegion};
use crate::registers::Registers;
use crate::scan::RegisterSnapshot;
use crate::session::Session;

pub struct Target {
    process: Process,
}

impl Target {
    /// Attach to `pid` and keep it stopped while this value lives.
    pub fn attach(pid: Pid) -> Result<Self> {
        Ok(Target {
            process: Process::attach(pid)?,
        })
    }

    pub fn pid(&self) -> Pid {
        self.process.pid()
    }

    pub fn read_registers(&self) -> Result<Registers> {
        Registers::read(self.process.pid())
    }

    pub fn register_snapshot(&self) -> Result<RegisterSnapshot> {
        Ok(self.read_registers()?.snapshot())
    }

    pub fn maps_text(&self) -> Result<String> {
        procfs::read_maps_text(self.process.pid().as_raw())
    }

    pub fn memory_maps(&self) -> Result<Vec<MemoryRegion>> {
        procfs::read_memory_maps(self.process.pid().as_raw())
    }

    /// Capture registers, maps and a memory reader, and hand them to the
    /// session's background search.
    pub fn search(&self, session: &mut Session) -> Result<Receiver<ScanEvent>> {
        let registers = self.register_snapshot()?;
        let maps = self.maps_text()?;
        let reader = self.process.memory_reader()?;
        session.search(&maps, registers, reader)
    }
}
