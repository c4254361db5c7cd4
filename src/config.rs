//! Scan tunables.

use crate::error::{Error, Result};
use crate::pattern::WINDOW;

/// Default read granularity: one page.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanConfig {
    /// Bytes fetched from the target per read. An unreadable chunk is
    /// skipped as a whole, so this is also the skip granularity.
    pub chunk_size: usize,
    /// Ranges longer than this are skipped. `None` scans everything.
    pub max_range_len: Option<u64>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        ScanConfig {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_range_len: None,
        }
    }
}

impl ScanConfig {
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_max_range_len(mut self, max: Option<u64>) -> Self {
        self.max_range_len = max;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size < WINDOW {
            return Err(Error::Other(format!(
                "chunk size {} is smaller than the {}-byte window",
                self.chunk_size, WINDOW
            )));
        }
        if self.max_range_len == Some(0) {
            return Err(Error::Other("max range length must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        let config = ScanConfig::default();
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert!(config.max_range_len.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn tiny_chunks_rejected() {
        assert!(ScanConfig::default().with_chunk_size(3).validate().is_err());
        assert!(ScanConfig::default().with_chunk_size(4).validate().is_ok());
        assert!(ScanConfig::default().with_max_range_len(Some(0)).validate().is_err());
    }
}
