use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::policy::ComparisonPolicy;
use crate::text_diff::{DEFAULT_BINARY_RATIO, DEFAULT_SNIFF_LEN};
use crate::volume::DiskFormat;

/// Smallest block size given to a newly created output image.
pub const MIN_BLOCK_SIZE: u64 = 512 * 1024;

/// Tunables shared by compare and apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Unchanged lines kept around each hunk.
    pub context_lines: usize,
    pub binary_sniff_len: usize,
    pub binary_ratio: f64,
    pub min_block_size: u64,
    /// Queue drain workers; `None` uses the rayon pool size.
    pub workers: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            context_lines: 0,
            binary_sniff_len: DEFAULT_SNIFF_LEN,
            binary_ratio: DEFAULT_BINARY_RATIO,
            min_block_size: MIN_BLOCK_SIZE,
            workers: None,
        }
    }
}

impl EngineConfig {
    pub fn is_binary(&self, data: &[u8]) -> bool {
        crate::text_diff::is_binary_with(data, self.binary_sniff_len, self.binary_ratio)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(rayon::current_num_threads).max(1)
    }
}

/// Which partition of the first disk is paired with which of the second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionPair {
    pub old: usize,
    pub new: usize,
}

impl PartitionPair {
    pub fn same(index: usize) -> Self {
        Self { old: index, new: index }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompareRequest {
    pub old_image: PathBuf,
    pub new_image: PathBuf,
    pub output: PathBuf,
    pub overwrite: bool,
    pub partitions: Option<PartitionPair>,
    pub policy: ComparisonPolicy,
    pub format: DiskFormat,
    pub config: EngineConfig,
}

impl CompareRequest {
    pub fn new(old_image: impl Into<PathBuf>, new_image: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            old_image: old_image.into(),
            new_image: new_image.into(),
            output: output.into(),
            overwrite: false,
            partitions: None,
            policy: ComparisonPolicy::default(),
            format: DiskFormat::default(),
            config: EngineConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyRequest {
    pub base_image: PathBuf,
    pub diff_image: PathBuf,
    /// Where the result goes; `None` patches the base in place.
    pub output: Option<PathBuf>,
    pub differencing: bool,
    /// Pairs a base partition (`old`) with a diff partition (`new`).
    pub partitions: Option<PartitionPair>,
    pub config: EngineConfig,
}

impl ApplyRequest {
    pub fn new(base_image: impl Into<PathBuf>, diff_image: impl Into<PathBuf>) -> Self {
        Self {
            base_image: base_image.into(),
            diff_image: diff_image.into(),
            output: None,
            differencing: false,
            partitions: None,
            config: EngineConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.context_lines, 0);
        assert_eq!(config.binary_sniff_len, 8000);
        assert_eq!(config.min_block_size, 512 * 1024);
        assert!(config.worker_count() >= 1);
    }

    #[test]
    fn test_worker_override() {
        let config = EngineConfig {
            workers: Some(0),
            ..EngineConfig::default()
        };
        assert_eq!(config.worker_count(), 1);
    }
}
