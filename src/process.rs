//! Attaching to a crashed or paused process via ptrace.
//!
//! Only what a search needs: stop the target, read its registers and
//! memory, and let it go again on drop.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::Arc;

use log::{debug, info};
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;

use crate::error::{Error, Result};
use crate::scan::MemoryReader;
use crate::types::VirtAddr;

/// Reads target memory through `/proc/[pid]/mem`.
///
/// The file is opened on the attaching thread, so the permission check
/// happens there; reads use positioned I/O and are safe from any thread.
#[derive(Debug)]
pub struct ProcMem {
    file: File,
}

impl ProcMem {
    pub fn open(pid: Pid) -> Result<Self> {
        let file = File::open(format!("/proc/{}/mem", pid))
            .map_err(|e| Error::Process(format!("/proc/{}/mem: {}", pid, e)))?;
        Ok(ProcMem { file })
    }
}

impl MemoryReader for ProcMem {
    fn read(&self, addr: VirtAddr, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.file
            .read_exact_at(&mut buf, addr.addr())
            .map_err(|e| Error::UnreadableRegion {
                addr,
                len,
                reason: e.to_string(),
            })?;
        Ok(buf)
    }
}

/// A process stopped under ptrace. Detached on drop.
pub struct Process {
    pid: Pid,
    is_attached: bool,
}

impl Process {
    /// Attach to an already-running process and wait for it to stop.
    pub fn attach(pid: Pid) -> Result<Self> {
        ptrace::attach(pid)?;

        match waitpid(pid, None)
            .map_err(|e| Error::Process(format!("waitpid after attach: {}", e)))?
        {
            WaitStatus::Stopped(_, Signal::SIGSTOP) => {}
            // A crashed target may report its fault signal first.
            WaitStatus::Stopped(_, sig) => debug!("pid {} stopped by {:?}", pid, sig),
            other => {
                let _ = ptrace::detach(pid, None);
                return Err(Error::Process(format!(
                    "unexpected status after attach: {:?}",
                    other
                )));
            }
        }

        info!("attached to {}", pid);
        Ok(Process {
            pid,
            is_attached: true,
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// A memory reader usable from the scan worker.
    pub fn memory_reader(&self) -> Result<Arc<dyn MemoryReader>> {
        Ok(Arc::new(ProcMem::open(self.pid)?))
    }

    /// Release the process and let it run again.
    pub fn detach(&mut self) -> Result<()> {
        if self.is_attached {
            ptrace::detach(self.pid, None)?;
            self.is_attached = false;
            info!("detached from {}", self.pid);
        }
        Ok(())
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        let _ = self.detach();
    }
}
