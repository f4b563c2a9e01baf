use rayon::prelude::*;
use regex::Regex;
use tracing::debug;

use crate::error::Result;
use crate::hives;
use crate::policy::ComparisonPolicy;
use crate::volume::{join_path, EntryKind, FsHandle};

/// Root-level files never worth diffing.
const DENIED_FILES: &[&str] = &["PAGEFILE.SYS", "HIBERFIL.SYS", "SWAPFILE.SYS"];
/// Root-level directories skipped entirely.
const DENIED_DIRS: &[&str] = &["SYSTEM VOLUME INFORMATION"];

/// One file to materialize in the destination.
#[derive(Debug, Clone)]
pub struct ChangeEntry {
    /// Path on the source volume.
    pub path: String,
    pub in_old: bool,
    pub in_new: bool,
    pub source: FsHandle,
    /// The old-side volume, when the file existed there.
    pub base: Option<FsHandle>,
    pub destination: FsHandle,
    pub destination_path: String,
}

/// Paths the comparator never reports.
#[derive(Debug, Clone)]
pub struct Exclusions {
    hive_dir: &'static Regex,
}

impl Default for Exclusions {
    fn default() -> Self {
        Self {
            hive_dir: hives::hive_dir_regex(),
        }
    }
}

impl Exclusions {
    pub fn is_excluded(&self, path: &str) -> bool {
        let (first, rest) = path.split_once('/').unwrap_or((path, ""));
        if rest.is_empty() && DENIED_FILES.iter().any(|d| d.eq_ignore_ascii_case(first)) {
            return true;
        }
        if !rest.is_empty() && DENIED_DIRS.iter().any(|d| d.eq_ignore_ascii_case(first)) {
            return true;
        }
        // SAM, SECURITY, logs and the like sit next to the hives handled by
        // the registry pass
        self.hive_dir.is_match(path) && !hives::is_system_hive(path)
    }

    fn skips_dir(&self, dir: &str) -> bool {
        DENIED_DIRS.iter().any(|d| d.eq_ignore_ascii_case(dir))
    }
}

/// Walks a new tree against an old one and reports files that differ.
pub struct TreeComparator {
    policy: ComparisonPolicy,
    exclusions: Exclusions,
}

impl TreeComparator {
    pub fn new(policy: ComparisonPolicy) -> Self {
        Self {
            policy,
            exclusions: Exclusions::default(),
        }
    }

    /// Every file under `new` that is missing from `old` or not equivalent
    /// to it, targeted at `destination` under `prefix`.
    pub fn compare(&self, old: &FsHandle, new: &FsHandle, destination: &FsHandle, prefix: &str) -> Result<Vec<ChangeEntry>> {
        self.policy.check_supported(old)?;
        self.policy.check_supported(new)?;

        let ctx = WalkContext {
            comparator: self,
            old,
            new,
            destination,
            prefix,
        };
        let mut changes = ctx.walk_dir("")?;
        changes.sort_by(|a, b| a.path.cmp(&b.path));
        debug!(changes = changes.len(), policy = %self.policy, "tree comparison finished");
        Ok(changes)
    }
}

struct WalkContext<'a> {
    comparator: &'a TreeComparator,
    old: &'a FsHandle,
    new: &'a FsHandle,
    destination: &'a FsHandle,
    prefix: &'a str,
}

impl WalkContext<'_> {
    /// Compare one directory's files and recurse into its subdirectories.
    /// Returns after every child walk has finished.
    fn walk_dir(&self, dir: &str) -> Result<Vec<ChangeEntry>> {
        let entries = self.new.read_dir(dir)?;

        let (files, dirs): (Vec<_>, Vec<_>) = entries.into_iter().partition(|e| e.kind == EntryKind::File);

        let mut changes: Vec<ChangeEntry> = files
            .par_iter()
            .map(|entry| self.compare_file(&join_path(dir, &entry.name)))
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .flatten()
            .collect();

        let nested = dirs
            .par_iter()
            .filter(|entry| !(dir.is_empty() && self.comparator.exclusions.skips_dir(&entry.name)))
            .map(|entry| self.walk_dir(&join_path(dir, &entry.name)))
            .collect::<Result<Vec<_>>>()?;
        changes.extend(nested.into_iter().flatten());
        Ok(changes)
    }

    fn compare_file(&self, path: &str) -> Result<Option<ChangeEntry>> {
        if self.comparator.exclusions.is_excluded(path) {
            debug!(path, "excluded");
            return Ok(None);
        }
        let in_old = self.old.exists(path) && !self.old.is_dir(path);
        if in_old && self.comparator.policy.equivalent(self.old, self.new, path)? {
            return Ok(None);
        }
        Ok(Some(ChangeEntry {
            path: path.to_string(),
            in_old,
            in_new: true,
            source: self.new.clone(),
            base: in_old.then(|| self.old.clone()),
            destination: self.destination.clone(),
            destination_path: join_path(self.prefix, path),
        }))
    }
}
