use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DiffError, Result};
use crate::volume::FsHandle;

/// How two files with the same path are judged equivalent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ComparisonPolicy {
    /// Same length.
    NameOnly,
    /// Same length and last-write time.
    #[default]
    DateTimeOnly,
    /// Same length and content.
    BinaryOnly,
    /// Same length, last-write time and content.
    Full,
    /// Same NTFS change-journal sequence number. NTFS only.
    Journaled,
}

impl ComparisonPolicy {
    /// Fails fast when the policy cannot run against this filesystem.
    pub fn check_supported(self, fs: &FsHandle) -> Result<()> {
        if self == ComparisonPolicy::Journaled && !fs.has_ntfs_extensions() {
            return Err(DiffError::Unsupported(format!(
                "journal comparison requires NTFS, found {}",
                fs.fs_type()
            )));
        }
        Ok(())
    }

    /// Returns true when `path` on `old` and `path` on `new` are equivalent.
    /// A file missing on either side is never equivalent.
    ///
    /// Each handle is locked only for the single call made against it.
    pub fn equivalent(self, old: &FsHandle, new: &FsHandle, path: &str) -> Result<bool> {
        if !old.exists(path) || !new.exists(path) {
            return Ok(false);
        }

        match self {
            ComparisonPolicy::Journaled => Ok(journal_usn(old, path)? == journal_usn(new, path)?),
            ComparisonPolicy::NameOnly => Ok(compare_stat(old, new, path)?.same_len),
            ComparisonPolicy::DateTimeOnly => {
                let stat = compare_stat(old, new, path)?;
                Ok(stat.same_len && stat.same_time)
            }
            ComparisonPolicy::BinaryOnly => {
                Ok(compare_stat(old, new, path)?.same_len && same_content(old, new, path)?)
            }
            ComparisonPolicy::Full => {
                let stat = compare_stat(old, new, path)?;
                Ok(stat.same_len && stat.same_time && same_content(old, new, path)?)
            }
        }
    }
}

struct StatComparison {
    same_len: bool,
    same_time: bool,
}

fn compare_stat(old: &FsHandle, new: &FsHandle, path: &str) -> Result<StatComparison> {
    let old_meta = old.metadata(path)?;
    let new_meta = new.metadata(path)?;
    Ok(StatComparison {
        same_len: old_meta.len == new_meta.len,
        same_time: old_meta.times.modified == new_meta.times.modified,
    })
}

fn journal_usn(fs: &FsHandle, path: &str) -> Result<u64> {
    fs.with(|fs| -> Result<u64> {
        match fs.ntfs() {
            Some(ntfs) => Ok(ntfs.standard_information(path)?.usn),
            None => Err(DiffError::Unsupported(
                "journal comparison only functions on NTFS partitions".into(),
            )),
        }
    })
}

/// Compare content by BLAKE3 digest so only one file body is held at a time.
fn same_content(old: &FsHandle, new: &FsHandle, path: &str) -> Result<bool> {
    let old_hash = blake3::hash(&old.read(path)?);
    let new_hash = blake3::hash(&new.read(path)?);
    Ok(old_hash == new_hash)
}

impl fmt::Display for ComparisonPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ComparisonPolicy::NameOnly => "name-only",
            ComparisonPolicy::DateTimeOnly => "date-time-only",
            ComparisonPolicy::BinaryOnly => "binary-only",
            ComparisonPolicy::Full => "full",
            ComparisonPolicy::Journaled => "journaled",
        };
        f.write_str(name)
    }
}

impl FromStr for ComparisonPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['_', ' '], "-").as_str() {
            "name-only" | "nameonly" => Ok(ComparisonPolicy::NameOnly),
            "date-time-only" | "datetimeonly" => Ok(ComparisonPolicy::DateTimeOnly),
            "binary-only" | "binaryonly" => Ok(ComparisonPolicy::BinaryOnly),
            "full" => Ok(ComparisonPolicy::Full),
            "journaled" => Ok(ComparisonPolicy::Journaled),
            other => Err(format!("unknown comparison policy: {other}")),
        }
    }
}
