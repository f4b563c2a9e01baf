use std::path::Path;

use tracing::info;

use crate::config::{CompareRequest, EngineConfig, PartitionPair};
use crate::copy_queue::{CopyJob, CopyQueue};
use crate::error::{ensure_no_failures, DiffError, Result};
use crate::hives::{self, FILES_ROOT};
use crate::policy::ComparisonPolicy;
use crate::tree_compare::TreeComparator;
use crate::volume::{Access, DiskProvider, FsHandle, PartitionInfo, VirtualDisk};

/// Sectors left free ahead of the first partition of an output image.
pub const PARTITION_TABLE_SLACK_SECTORS: u64 = 64;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CompareSummary {
    pub partitions: usize,
    pub files_copied: usize,
    pub files_diffed: usize,
    pub files_dropped: usize,
    pub hives_diffed: usize,
    pub hives_relocated: usize,
}

impl CompareSummary {
    fn add(&mut self, other: &CompareSummary) {
        self.partitions += other.partitions;
        self.files_copied += other.files_copied;
        self.files_diffed += other.files_diffed;
        self.files_dropped += other.files_dropped;
        self.hives_diffed += other.hives_diffed;
        self.hives_relocated += other.hives_relocated;
    }
}

pub(crate) fn open_existing(provider: &dyn DiskProvider, path: &Path, access: Access) -> Result<Box<dyn VirtualDisk>> {
    if !provider.exists(path) {
        return Err(DiffError::InputMissing(path.to_path_buf()));
    }
    provider.open(path, access)
}

pub(crate) fn partitions_of(disk: &dyn VirtualDisk, path: &Path) -> Result<Vec<PartitionInfo>> {
    let partitions = disk.partitions();
    if partitions.is_empty() {
        return Err(DiffError::NotPartitioned(path.to_path_buf()));
    }
    Ok(partitions)
}

/// Resolve which partitions are paired and check their filesystem types
/// agree. Nothing is written before this succeeds.
pub(crate) fn select_pairs(
    old: &[PartitionInfo],
    new: &[PartitionInfo],
    requested: Option<PartitionPair>,
) -> Result<Vec<(PartitionInfo, PartitionInfo)>> {
    let pairs: Vec<PartitionPair> = match requested {
        Some(pair) => vec![pair],
        None if old.len() != new.len() => {
            return Err(DiffError::PartitionCountMismatch {
                old: old.len(),
                new: new.len(),
            })
        }
        None => (0..old.len()).map(PartitionPair::same).collect(),
    };

    pairs
        .into_iter()
        .map(|pair| {
            let a = *old.get(pair.old).ok_or(DiffError::PartitionOutOfRange {
                index: pair.old,
                count: old.len(),
            })?;
            let b = *new.get(pair.new).ok_or(DiffError::PartitionOutOfRange {
                index: pair.new,
                count: new.len(),
            })?;
            if a.fs_type != b.fs_type {
                return Err(DiffError::FsTypeMismatch {
                    old_index: a.index,
                    old: a.fs_type,
                    new_index: b.index,
                    new: b.fs_type,
                });
            }
            Ok((a, b))
        })
        .collect()
}

/// Compare two disk images and write their differences to a new image.
///
/// Each partition pair is walked on the blocking pool; the registry pass for
/// a partition starts only after its copy queue has fully drained.
pub async fn create_diff(provider: &dyn DiskProvider, request: &CompareRequest) -> Result<CompareSummary> {
    let mut old_disk = open_existing(provider, &request.old_image, Access::Read)?;
    let mut new_disk = open_existing(provider, &request.new_image, Access::Read)?;
    if !request.overwrite && provider.exists(&request.output) {
        return Err(DiffError::OutputExists(request.output.clone()));
    }

    let old_parts = partitions_of(old_disk.as_ref(), &request.old_image)?;
    let new_parts = partitions_of(new_disk.as_ref(), &request.new_image)?;
    let pairs = select_pairs(&old_parts, &new_parts, request.partitions)?;
    for (old, _) in &pairs {
        if !old.fs_type.is_formattable() {
            return Err(DiffError::Unsupported(format!(
                "partition {} has filesystem type {}, which cannot be created in the output",
                old.index, old.fs_type
            )));
        }
    }

    let mut sources = Vec::with_capacity(pairs.len());
    for (old, new) in &pairs {
        let old_fs = old_disk.open_filesystem(old.index)?;
        let new_fs = new_disk.open_filesystem(new.index)?;
        request.policy.check_supported(&old_fs)?;
        request.policy.check_supported(&new_fs)?;
        sources.push((old_fs, new_fs));
    }

    let sizes: Vec<u64> = pairs
        .iter()
        .map(|(old, new)| old.size_bytes().max(new.size_bytes()))
        .collect();
    let capacity = PARTITION_TABLE_SLACK_SECTORS * new_disk.sector_size() + sizes.iter().sum::<u64>();
    let block_size = new_disk.block_size().max(request.config.min_block_size);

    let mut out_disk = provider.create_dynamic(&request.output, request.format, capacity, block_size, request.overwrite)?;
    info!(
        output = %request.output.display(),
        capacity,
        block_size,
        partitions = pairs.len(),
        "created output image"
    );

    let mut tasks = Vec::with_capacity(pairs.len());
    for (((old, new), (old_fs, new_fs)), size) in pairs.iter().zip(sources).zip(sizes) {
        let out_index = out_disk.create_partition(size, old.fs_type)?;
        let out_fs = out_disk.open_filesystem(out_index)?;
        let policy = request.policy;
        let config = request.config.clone();
        let pair = (old.index, new.index);
        tasks.push(tokio::task::spawn_blocking(move || {
            compare_partition(&old_fs, &new_fs, &out_fs, policy, &config).inspect(|summary| {
                info!(
                    old = pair.0,
                    new = pair.1,
                    copied = summary.files_copied,
                    diffed = summary.files_diffed,
                    hives = summary.hives_diffed + summary.hives_relocated,
                    "partition compared"
                );
            })
        }));
    }

    let mut summary = CompareSummary::default();
    for task in tasks {
        let partition = task.await.map_err(|e| DiffError::Join(e.to_string()))??;
        summary.add(&partition);
    }
    out_disk.flush()?;
    Ok(summary)
}

/// Diff one partition pair into `out`.
pub fn compare_partition(
    old: &FsHandle,
    new: &FsHandle,
    out: &FsHandle,
    policy: ComparisonPolicy,
    config: &EngineConfig,
) -> Result<CompareSummary> {
    let changes = TreeComparator::new(policy).compare(old, new, out, FILES_ROOT)?;

    let queue = CopyQueue::new();
    queue.extend(changes.into_iter().map(CopyJob::from));
    let report = queue.drain(config);

    let mut failures = report.failures;
    let registry = hives::rewrite_hives(old, new, out, &report.written, &mut failures);
    ensure_no_failures(failures)?;

    Ok(CompareSummary {
        partitions: 1,
        files_copied: report.copied,
        files_diffed: report.diffed,
        files_dropped: report.dropped,
        hives_diffed: registry.diffed,
        hives_relocated: registry.relocated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::FsType;

    fn part(index: usize, fs_type: FsType) -> PartitionInfo {
        PartitionInfo {
            index,
            fs_type,
            sector_count: 2048,
            sector_size: 512,
        }
    }

    #[test]
    fn test_select_all_pairs() {
        let old = [part(0, FsType::Ntfs), part(1, FsType::Fat32)];
        let new = [part(0, FsType::Ntfs), part(1, FsType::Fat32)];
        let pairs = select_pairs(&old, &new, None).unwrap();
        assert_eq!(pairs.len(), 2);
    }

    #[test]
    fn test_count_mismatch_needs_explicit_pair() {
        let old = [part(0, FsType::Ntfs)];
        let new = [part(0, FsType::Fat32), part(1, FsType::Ntfs)];
        assert!(matches!(
            select_pairs(&old, &new, None),
            Err(DiffError::PartitionCountMismatch { old: 1, new: 2 })
        ));
        let pairs = select_pairs(&old, &new, Some(PartitionPair { old: 0, new: 1 })).unwrap();
        assert_eq!(pairs[0].1.index, 1);
    }

    #[test]
    fn test_type_mismatch() {
        let old = [part(0, FsType::Ntfs)];
        let new = [part(0, FsType::Fat32)];
        assert!(matches!(
            select_pairs(&old, &new, None),
            Err(DiffError::FsTypeMismatch { .. })
        ));
    }

    #[test]
    fn test_out_of_range() {
        let old = [part(0, FsType::Ntfs)];
        assert!(matches!(
            select_pairs(&old, &old, Some(PartitionPair::same(3))),
            Err(DiffError::PartitionOutOfRange { index: 3, count: 1 })
        ));
    }
}
