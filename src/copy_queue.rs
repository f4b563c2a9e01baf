use std::collections::BTreeMap;

use parking_lot::Mutex;
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::{DiffError, EntryFailure, Result};
use crate::patch_format::{PatchScript, HUNK_PREFIX};
use crate::text_diff::TextDiff;
use crate::tree_compare::ChangeEntry;
use crate::volume::{parent_path, FsHandle, SecurityDescriptor, StandardInformation};

/// One file to materialize: read `source_path` from `source`, write the
/// result to `destination_path` on `destination`.
#[derive(Debug, Clone)]
pub struct CopyJob {
    pub source: FsHandle,
    pub source_path: String,
    pub destination: FsHandle,
    pub destination_path: String,
    /// Earlier version of the source, diffed against when it is text.
    pub base: Option<(FsHandle, String)>,
}

impl From<ChangeEntry> for CopyJob {
    fn from(entry: ChangeEntry) -> Self {
        let base = entry.base.map(|fs| (fs, entry.path.clone()));
        Self {
            source: entry.source,
            source_path: entry.path,
            destination: entry.destination,
            destination_path: entry.destination_path,
            base,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    destination: u64,
    path: String,
}

impl QueueKey {
    /// Paths are folded only when the destination ignores case.
    fn of(job: &CopyJob) -> Self {
        let path = if job.destination.is_case_insensitive() {
            job.destination_path.to_lowercase()
        } else {
            job.destination_path.clone()
        };
        Self {
            destination: job.destination.id(),
            path,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Bytes copied verbatim to a new destination file.
    Copied,
    /// A patch script written in place of the source.
    Diffed,
    /// Only metadata differed; nothing written.
    Dropped,
    /// A stored patch applied to the existing destination.
    Patched,
    /// An existing destination replaced by binary content.
    Overwritten,
}

/// A destination file the drain produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Written {
    pub source_path: String,
    pub destination_path: String,
    pub outcome: Outcome,
}

#[derive(Debug, Default)]
pub struct DrainReport {
    pub copied: usize,
    pub diffed: usize,
    pub dropped: usize,
    pub patched: usize,
    pub overwritten: usize,
    pub written: Vec<Written>,
    pub failures: Vec<EntryFailure>,
}

impl DrainReport {
    fn record(&mut self, job: &CopyJob, outcome: Outcome) {
        match outcome {
            Outcome::Copied => self.copied += 1,
            Outcome::Diffed => self.diffed += 1,
            Outcome::Dropped => {
                self.dropped += 1;
                return;
            }
            Outcome::Patched => self.patched += 1,
            Outcome::Overwritten => self.overwritten += 1,
        }
        self.written.push(Written {
            source_path: job.source_path.clone(),
            destination_path: job.destination_path.clone(),
            outcome,
        });
    }
}

/// Pending writes, keyed by destination. Adding a job for a destination
/// that is already queued replaces the earlier job.
#[derive(Default)]
pub struct CopyQueue {
    jobs: Mutex<BTreeMap<QueueKey, CopyJob>>,
}

impl CopyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, job: CopyJob) {
        let key = QueueKey::of(&job);
        self.jobs.lock().insert(key, job);
    }

    pub fn extend(&self, jobs: impl IntoIterator<Item = CopyJob>) {
        // keys take the destination lock, so build them before the queue lock
        let keyed: Vec<_> = jobs.into_iter().map(|job| (QueueKey::of(&job), job)).collect();
        self.jobs.lock().extend(keyed);
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }

    fn pop(&self) -> Option<CopyJob> {
        self.jobs.lock().pop_first().map(|(_, job)| job)
    }

    /// Process every queued job with `config.worker_count()` workers.
    ///
    /// A failing job is recorded in the report and never stops the others.
    pub fn drain(&self, config: &EngineConfig) -> DrainReport {
        let report = Mutex::new(DrainReport::default());
        (0..config.worker_count()).into_par_iter().for_each(|_| {
            // the queue lock is released before the job runs
            while let Some(job) = self.pop() {
                let result = process(&job, config);
                let mut report = report.lock();
                match result {
                    Ok(outcome) => report.record(&job, outcome),
                    Err(error) => {
                        warn!(path = %job.destination_path, error = %error, "failed to write entry");
                        report.failures.push(EntryFailure {
                            path: job.destination_path.clone(),
                            error,
                        });
                    }
                }
            }
        });
        let mut report = report.into_inner();
        report.written.sort_by(|a, b| a.destination_path.cmp(&b.destination_path));
        report
    }
}

fn process(job: &CopyJob, config: &EngineConfig) -> Result<Outcome> {
    if let Some(parent) = parent_path(&job.destination_path) {
        if !job.destination.is_dir(parent) {
            let source_parent = parent_path(&job.source_path).unwrap_or("");
            create_directory_tree(&job.source, source_parent, &job.destination, parent)?;
        }
    }

    let src = job.source.read(&job.source_path)?;
    let outcome = if job.destination.exists(&job.destination_path) {
        merge_into_existing(job, &src, config)?
    } else {
        write_new(job, &src, config)?
    };

    if outcome != Outcome::Dropped {
        copy_metadata(&job.source, &job.source_path, &job.destination, &job.destination_path)?;
    }
    Ok(outcome)
}

/// Stored entries read back as patches when they are text and open with a
/// hunk header; anything else is whole file content.
fn is_stored_patch(data: &[u8], config: &EngineConfig) -> bool {
    data.starts_with(HUNK_PREFIX) && !config.is_binary(data)
}

fn merge_into_existing(job: &CopyJob, src: &[u8], config: &EngineConfig) -> Result<Outcome> {
    if !is_stored_patch(src, config) {
        job.destination.write(&job.destination_path, src)?;
        return Ok(Outcome::Overwritten);
    }
    let script = PatchScript::parse(src)?;
    for warning in script.warnings() {
        warn!(path = %job.source_path, "{warning}");
    }
    let current = job.destination.read(&job.destination_path)?;
    let patched = script.apply(&current)?;
    job.destination.write(&job.destination_path, &patched)?;
    Ok(Outcome::Patched)
}

fn write_new(job: &CopyJob, src: &[u8], config: &EngineConfig) -> Result<Outcome> {
    let base = match &job.base {
        Some((fs, path)) if fs.exists(path) => fs.read(path)?,
        _ => {
            job.destination.write(&job.destination_path, src)?;
            return Ok(Outcome::Copied);
        }
    };

    if !config.is_binary(src) && !config.is_binary(&base) {
        let diff = TextDiff::new(&base, src);
        if !diff.has_differences() {
            debug!(path = %job.source_path, "content unchanged, dropping entry");
            return Ok(Outcome::Dropped);
        }
        let patch = PatchScript::from_diff(&diff, config.context_lines).to_bytes();
        if is_stored_patch(&patch, config) {
            job.destination.write(&job.destination_path, &patch)?;
            return Ok(Outcome::Diffed);
        }
        debug!(path = %job.source_path, "patch classifies as binary, storing whole file");
    }

    // apply would replay this as a patch against the base
    if is_stored_patch(src, config) {
        return Err(DiffError::Unsupported(format!(
            "{} reads as a patch script and cannot be stored whole",
            job.source_path
        )));
    }
    job.destination.write(&job.destination_path, src)?;
    Ok(Outcome::Copied)
}

/// Create `dest_dir` and any missing parents, taking metadata from the
/// matching directories of the source chain. Extra leading destination
/// components mirror the source root.
pub fn create_directory_tree(source: &FsHandle, source_dir: &str, destination: &FsHandle, dest_dir: &str) -> Result<()> {
    if destination.is_dir(dest_dir) {
        return Ok(());
    }
    if let Some(dest_parent) = parent_path(dest_dir) {
        let source_parent = parent_path(source_dir).unwrap_or("");
        create_directory_tree(source, source_parent, destination, dest_parent)?;
    }
    destination.with_mut(|fs| fs.create_dir(dest_dir))?;
    if source.is_dir(source_dir) {
        copy_metadata(source, source_dir, destination, dest_dir)?;
    }
    Ok(())
}

/// Copy attributes and timestamps, plus the security descriptor and
/// standard information when both sides are NTFS.
pub fn copy_metadata(source: &FsHandle, source_path: &str, destination: &FsHandle, dest_path: &str) -> Result<()> {
    let meta = source.metadata(source_path)?;
    destination.with_mut(|fs| fs.set_attributes(dest_path, meta.attributes))?;

    let ntfs_meta = source.with(|fs| -> Result<Option<(SecurityDescriptor, StandardInformation)>> {
        match fs.ntfs() {
            Some(ntfs) => Ok(Some((ntfs.security(source_path)?, ntfs.standard_information(source_path)?))),
            None => Ok(None),
        }
    })?;
    if let Some((security, info)) = ntfs_meta {
        let applied = destination.with_mut(|fs| -> Result<bool> {
            match fs.ntfs_mut() {
                Some(ntfs) => {
                    ntfs.set_security(dest_path, &security)?;
                    ntfs.set_standard_information(dest_path, &info)?;
                    Ok(true)
                }
                None => Ok(false),
            }
        })?;
        if applied {
            return Ok(());
        }
    }

    destination.with_mut(|fs| fs.set_times(dest_path, &meta.times))
}
