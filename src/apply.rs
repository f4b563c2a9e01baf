use std::path::PathBuf;

use tracing::{info, warn};

use crate::config::{ApplyRequest, EngineConfig};
use crate::copy_queue::{CopyJob, CopyQueue};
use crate::create::{open_existing, partitions_of, select_pairs};
use crate::error::{ensure_no_failures, DiffError, Result};
use crate::hives::{self, FILES_ROOT};
use crate::volume::{Access, DiskProvider, FsHandle, VirtualDisk};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ApplySummary {
    /// The image that received the changes.
    pub target: PathBuf,
    pub partitions: usize,
    pub files_copied: usize,
    pub files_patched: usize,
    pub files_overwritten: usize,
    pub hives_applied: usize,
    pub hives_partial: usize,
    pub hives_copied: usize,
    pub hives_skipped: usize,
}

impl ApplySummary {
    fn add(&mut self, other: &ApplySummary) {
        self.partitions += other.partitions;
        self.files_copied += other.files_copied;
        self.files_patched += other.files_patched;
        self.files_overwritten += other.files_overwritten;
        self.hives_applied += other.hives_applied;
        self.hives_partial += other.hives_partial;
        self.hives_copied += other.hives_copied;
        self.hives_skipped += other.hives_skipped;
    }
}

/// Open the image that will receive the changes: the base itself, a full
/// copy of it, or a differencing child of it.
fn open_target(provider: &dyn DiskProvider, request: &ApplyRequest) -> Result<(PathBuf, Box<dyn VirtualDisk>)> {
    match &request.output {
        None => Ok((
            request.base_image.clone(),
            provider.open(&request.base_image, Access::ReadWrite)?,
        )),
        Some(output) if request.differencing => Ok((
            output.clone(),
            provider.create_differencing(&request.base_image, output)?,
        )),
        Some(output) => {
            provider.copy_image(&request.base_image, output)?;
            Ok((output.clone(), provider.open(output, Access::ReadWrite)?))
        }
    }
}

/// Replay a diff image onto a base image.
///
/// Files under `FILES/` are merged first; the registry pass runs once the
/// queue for that partition has drained. Every failing entry is reported,
/// but the rest of the partition is still applied.
pub async fn apply_diff(provider: &dyn DiskProvider, request: &ApplyRequest) -> Result<ApplySummary> {
    let mut diff_disk = open_existing(provider, &request.diff_image, Access::Read)?;
    let base_disk = open_existing(provider, &request.base_image, Access::Read)?;
    match &request.output {
        None if request.differencing => return Err(DiffError::MissingOutput),
        Some(output) if provider.exists(output) => return Err(DiffError::OutputExists(output.clone())),
        _ => {}
    }

    let base_parts = partitions_of(base_disk.as_ref(), &request.base_image)?;
    let diff_parts = partitions_of(diff_disk.as_ref(), &request.diff_image)?;
    let pairs = select_pairs(&base_parts, &diff_parts, request.partitions)?;
    drop(base_disk);

    let (target_path, mut target_disk) = open_target(provider, request)?;
    info!(target = %target_path.display(), partitions = pairs.len(), "applying diff");

    let mut tasks = Vec::with_capacity(pairs.len());
    for (base, diff) in &pairs {
        let diff_fs = diff_disk.open_filesystem(diff.index)?;
        let target_fs = target_disk.open_filesystem(base.index)?;
        let config = request.config.clone();
        let index = base.index;
        tasks.push(tokio::task::spawn_blocking(move || {
            apply_partition(&diff_fs, &target_fs, &config).inspect(|summary| {
                info!(
                    partition = index,
                    copied = summary.files_copied,
                    patched = summary.files_patched,
                    hives = summary.hives_applied + summary.hives_copied,
                    "partition applied"
                );
            })
        }));
    }

    let mut summary = ApplySummary {
        target: target_path,
        ..ApplySummary::default()
    };
    for task in tasks {
        let partition = task.await.map_err(|e| DiffError::Join(e.to_string()))??;
        summary.add(&partition);
    }
    target_disk.flush()?;
    Ok(summary)
}

/// Apply the diff stored on `diff` to `target`.
pub fn apply_partition(diff: &FsHandle, target: &FsHandle, config: &EngineConfig) -> Result<ApplySummary> {
    let queue = CopyQueue::new();
    if diff.is_dir(FILES_ROOT) {
        let files = diff.list_files(FILES_ROOT)?;
        queue.extend(files.into_iter().map(|stored| {
            let destination_path = stored
                .strip_prefix(FILES_ROOT)
                .map(|p| p.trim_start_matches('/'))
                .unwrap_or(&stored)
                .to_string();
            CopyJob {
                source: diff.clone(),
                source_path: stored,
                destination: target.clone(),
                destination_path,
                base: None,
            }
        }));
    }
    let report = queue.drain(config);

    let mut failures = report.failures;
    let registry = hives::apply_hives(diff, target, &mut failures)?;
    if registry.partial > 0 {
        warn!(count = registry.partial, "some registry values could not be applied");
    }
    ensure_no_failures(failures)?;

    Ok(ApplySummary {
        target: PathBuf::new(),
        partitions: 1,
        files_copied: report.copied,
        files_patched: report.patched,
        files_overwritten: report.overwritten,
        hives_applied: registry.applied,
        hives_partial: registry.partial,
        hives_copied: registry.copied,
        hives_skipped: registry.skipped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::memory::MemoryFs;
    use crate::volume::FsType;

    #[test]
    fn test_stored_files_merge_into_target() {
        let diff = FsHandle::new(MemoryFs::new(FsType::Ntfs));
        let target = FsHandle::new(MemoryFs::new(FsType::Ntfs));
        diff.with_mut(|fs| fs.create_dir("FILES")).unwrap();
        diff.with_mut(|fs| fs.create_dir("FILES/docs")).unwrap();
        diff.write("FILES/docs/notes.txt", b"@@ -1,1 +1,1 @@\n-one\n+uno\n").unwrap();
        diff.write("FILES/docs/new.bin", b"\0\0\x01").unwrap();
        target.with_mut(|fs| fs.create_dir("docs")).unwrap();
        target.write("docs/notes.txt", b"one\ntwo\n").unwrap();

        let summary = apply_partition(&diff, &target, &EngineConfig::default()).unwrap();
        assert_eq!(summary.files_patched, 1);
        assert_eq!(summary.files_copied, 1);
        assert_eq!(target.read("docs/notes.txt").unwrap(), b"uno\ntwo\n");
        assert_eq!(target.read("docs/new.bin").unwrap(), b"\0\0\x01");
    }

    #[test]
    fn test_empty_diff_partition_is_a_no_op() {
        let diff = FsHandle::new(MemoryFs::new(FsType::Fat32));
        let target = FsHandle::new(MemoryFs::new(FsType::Fat32));
        target.write("keep.txt", b"k").unwrap();
        let summary = apply_partition(&diff, &target, &EngineConfig::default()).unwrap();
        assert_eq!(summary.files_copied + summary.files_patched, 0);
        assert_eq!(target.read("keep.txt").unwrap(), b"k");
    }

    #[test]
    fn test_failed_entry_fails_partition() {
        let diff = FsHandle::new(MemoryFs::new(FsType::Fat32));
        let target = FsHandle::new(MemoryFs::new(FsType::Fat32));
        diff.with_mut(|fs| fs.create_dir("FILES")).unwrap();
        diff.write("FILES/a.txt", b"@@ -1,1 +1,1 @@\n-expected\n+new\n").unwrap();
        target.write("a.txt", b"actual\n").unwrap();
        assert!(matches!(
            apply_partition(&diff, &target, &EngineConfig::default()),
            Err(DiffError::EntryFailures { count: 1, .. })
        ));
    }
}
