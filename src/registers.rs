//! x86_64 register capture via ptrace.
//!
//! Table-driven: [`REGISTERS`] lists every register searched for pattern
//! data, and [`Registers::snapshot`] turns a ptrace read into the
//! name-keyed map the scan engine consumes.

use nix::sys::ptrace;
use nix::unistd::Pid;

use crate::error::{Error, Result};
use crate::scan::RegisterSnapshot;

/// Registers an overflow can plausibly load from smashed memory.
pub const REGISTERS: &[&str] = &[
    "rax",
    "rbx",
    "rcx",
    "rdx",
    "rsi",
    "rdi",
    "rbp",
    "rsp",
    "r8",
    "r9",
    "r10",
    "r11",
    "r12",
    "r13",
    "r14",
    "r15",
    "rip",
];

/// Registers of a stopped tracee.
pub struct Registers {
    regs: libc::user_regs_struct,
}

impl Registers {
    /// Read all registers from a stopped tracee.
    pub fn read(pid: Pid) -> Result<Self> {
        let regs = ptrace::getregs(pid)?;
        Ok(Registers { regs })
    }

    /// Get a register value by name.
    pub fn get(&self, name: &str) -> Result<u64> {
        match name {
            "rax" => Ok(self.regs.rax),
            "rbx" => Ok(self.regs.rbx),
            "rcx" => Ok(self.regs.rcx),
            "rdx" => Ok(self.regs.rdx),
            "rsi" => Ok(self.regs.rsi),
            "rdi" => Ok(self.regs.rdi),
            "rbp" => Ok(self.regs.rbp),
            "rsp" => Ok(self.regs.rsp),
            "r8" => Ok(self.regs.r8),
            "r9" => Ok(self.regs.r9),
            "r10" => Ok(self.regs.r10),
            "r11" => Ok(self.regs.r11),
            "r12" => Ok(self.regs.r12),
            "r13" => Ok(self.regs.r13),
            "r14" => Ok(self.regs.r14),
            "r15" => Ok(self.regs.r15),
            "rip" => Ok(self.regs.rip),
            _ => Err(Error::Register(format!("unknown register: {}", name))),
        }
    }

    /// Iterate over all register name-value pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, u64)> + '_ {
        REGISTERS
            .iter()
            .filter_map(move |&name| self.get(name).ok().map(|v| (name, v)))
    }

    /// Copy the registers out for a search.
    pub fn snapshot(&self) -> RegisterSnapshot {
        self.iter().map(|(name, v)| (name.to_string(), v)).collect()
    }
}
