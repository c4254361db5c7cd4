use thiserror::Error;

use crate::types::VirtAddr;

#[derive(Error, Debug)]
pub enum Error {
    #[error("pattern length {requested} exceeds maximum {max} (26*26*10*3)")]
    InvalidLength { requested: usize, max: usize },

    #[error("unreadable memory at {addr} ({len} bytes): {reason}")]
    UnreadableRegion {
        addr: VirtAddr,
        len: usize,
        reason: String,
    },

    #[error("skipping map record '{line}': {reason}")]
    MapParseSkip { line: String, reason: String },

    #[error("no target: attach to a stopped process before searching")]
    NoTarget,

    #[error("invalid pattern value '{0}': expected a hex u32 or 4 ASCII characters")]
    InvalidValue(String),

    #[error("ptrace error: {0}")]
    Ptrace(#[from] nix::errno::Errno),

    #[error("process error: {0}")]
    Process(String),

    #[error("register error: {0}")]
    Register(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
