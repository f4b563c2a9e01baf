//! The registry pass: recognizes hive files and swaps whole-file copies
//! for key/value diffs.
//!
//! On compare, hives that the queue wrote under `FILES/` are replaced by a
//! [`RegistryDiff`] under `REGISTRY/SYSTEM/` or `REGISTRY/USERS/<user>/`.
//! A hive the old volume never had is moved there whole. On apply, those
//! diffs are replayed into the base volume's hives.

use std::sync::OnceLock;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::copy_queue::{create_directory_tree, Written};
use crate::error::{DiffError, EntryFailure, Result};
use crate::registry::{hive, RegistryDiff, SharedHive};
use crate::volume::{join_path, parent_path, FsHandle};

pub const FILES_ROOT: &str = "FILES";
pub const SYSTEM_REGISTRY_ROOT: &str = "REGISTRY/SYSTEM";
pub const USER_REGISTRY_ROOT: &str = "REGISTRY/USERS";
const USER_HIVE_NAME: &str = "ntuser.dat";

/// System hives diffed structurally, relative to the volume root.
pub const SYSTEM_HIVES: &[&str] = &[
    "WINDOWS/SYSTEM32/CONFIG/DEFAULT",
    "WINDOWS/SYSTEM32/CONFIG/SOFTWARE",
    "WINDOWS/SYSTEM32/CONFIG/SYSTEM",
    "WINDOWS/SYSTEM32/CONFIG/SYSTEMPROFILE/NTUSER.DAT",
];

static USER_HIVE: OnceLock<Regex> = OnceLock::new();
static HIVE_DIR: OnceLock<Regex> = OnceLock::new();

fn user_hive_regex() -> &'static Regex {
    USER_HIVE.get_or_init(|| {
        Regex::new(r"(?i)^(?:.*/)?(?:Documents and Settings|Users)/([^/]+)/ntuser\.dat$")
            .expect("USER_HIVE should be valid")
    })
}

/// Matches anything inside a Windows `SYSTEM32/CONFIG` directory.
pub fn hive_dir_regex() -> &'static Regex {
    HIVE_DIR.get_or_init(|| Regex::new(r"(?i)^WIN[^/]*/SYSTEM32/CONFIG/").expect("HIVE_DIR should be valid"))
}

pub fn is_system_hive(path: &str) -> bool {
    SYSTEM_HIVES.iter().any(|h| h.eq_ignore_ascii_case(path))
}

/// The account name owning a per-user hive path.
pub fn user_hive_owner(path: &str) -> Option<&str> {
    user_hive_regex().captures(path).and_then(|c| c.get(1)).map(|m| m.as_str())
}

/// Where a hive's diff lives inside the diff image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HiveLocation {
    System(String),
    User(String),
}

impl HiveLocation {
    pub fn classify(path: &str) -> Option<Self> {
        if is_system_hive(path) {
            return Some(HiveLocation::System(path.to_string()));
        }
        user_hive_owner(path).map(|user| HiveLocation::User(user.to_string()))
    }

    pub fn diff_path(&self) -> String {
        match self {
            HiveLocation::System(path) => join_path(SYSTEM_REGISTRY_ROOT, path),
            HiveLocation::User(user) => format!("{USER_REGISTRY_ROOT}/{user}/{USER_HIVE_NAME}"),
        }
    }
}

/// Counts from one registry pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HiveReport {
    pub diffed: usize,
    pub relocated: usize,
    pub applied: usize,
    pub partial: usize,
    pub copied: usize,
    pub skipped: usize,
}

fn load_hive(fs: &FsHandle, path: &str) -> Result<SharedHive> {
    let raw = fs.read(path)?;
    hive::decode(&raw)
        .map(SharedHive::new)
        .map_err(|e| DiffError::Hive(format!("{path}: {e}")))
}

fn ensure_parent(fs: &FsHandle, path: &str) -> Result<()> {
    if let Some(parent) = parent_path(path) {
        if !fs.is_dir(parent) {
            create_directory_tree(fs, "", fs, parent)?;
        }
    }
    Ok(())
}

/// Compare side: rewrite every hive the drain wrote to `output`.
pub fn rewrite_hives(
    old: &FsHandle,
    new: &FsHandle,
    output: &FsHandle,
    written: &[Written],
    failures: &mut Vec<EntryFailure>,
) -> HiveReport {
    let mut report = HiveReport::default();
    for entry in written {
        let Some(location) = HiveLocation::classify(&entry.source_path) else {
            continue;
        };
        match rewrite_hive(old, new, output, entry, &location) {
            Ok(true) => report.diffed += 1,
            Ok(false) => report.relocated += 1,
            Err(error) => {
                warn!(path = %entry.source_path, error = %error, "failed to rewrite hive");
                failures.push(EntryFailure {
                    path: entry.source_path.clone(),
                    error,
                });
            }
        }
    }
    report
}

/// Returns true when a diff was written, false when the hive was relocated.
fn rewrite_hive(
    old: &FsHandle,
    new: &FsHandle,
    output: &FsHandle,
    entry: &Written,
    location: &HiveLocation,
) -> Result<bool> {
    let target = location.diff_path();
    ensure_parent(output, &target)?;

    if !old.exists(&entry.source_path) {
        debug!(path = %entry.source_path, target = %target, "relocating new hive");
        output.with_mut(|fs| fs.rename(&entry.destination_path, &target))?;
        return Ok(false);
    }

    let old_hive = load_hive(old, &entry.source_path)?;
    let new_hive = load_hive(new, &entry.source_path)?;
    let diff = RegistryDiff::between(&old_hive, &new_hive);
    debug!(
        path = %entry.source_path,
        keys = diff.key_count(),
        values = diff.value_count(),
        "hive diffed"
    );
    output.write(&target, &diff.to_bytes()?)?;
    output.remove_file(&entry.destination_path)?;
    Ok(true)
}

/// Apply side: replay every hive stored under `REGISTRY/` in `diff` onto
/// `base`.
pub fn apply_hives(diff: &FsHandle, base: &FsHandle, failures: &mut Vec<EntryFailure>) -> Result<HiveReport> {
    let mut report = HiveReport::default();

    if diff.is_dir(SYSTEM_REGISTRY_ROOT) {
        for stored in diff.list_files(SYSTEM_REGISTRY_ROOT)? {
            let relative = stored
                .strip_prefix(SYSTEM_REGISTRY_ROOT)
                .map(|p| p.trim_start_matches('/'))
                .unwrap_or(&stored)
                .to_string();
            record(&mut report, failures, &stored, apply_stored_hive(diff, &stored, base, &relative));
        }
    }

    if diff.is_dir(USER_REGISTRY_ROOT) {
        let base_files = base.list_files("")?;
        for stored in diff.list_files(USER_REGISTRY_ROOT)? {
            let Some(user) = stored_user(&stored) else {
                warn!(path = %stored, "unrecognized file in user registry area");
                continue;
            };
            let target = base_files
                .iter()
                .find(|f| user_hive_owner(f).is_some_and(|owner| owner.eq_ignore_ascii_case(user)));
            match target {
                Some(target) => {
                    record(&mut report, failures, &stored, apply_stored_hive(diff, &stored, base, target))
                }
                None => {
                    warn!(user, "base image has no profile for user, skipping hive");
                    report.skipped += 1;
                }
            }
        }
    }

    Ok(report)
}

fn stored_user(stored: &str) -> Option<&str> {
    let rest = stored.strip_prefix(USER_REGISTRY_ROOT)?.strip_prefix('/')?;
    let (user, file) = rest.split_once('/')?;
    file.eq_ignore_ascii_case(USER_HIVE_NAME).then_some(user)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HiveApply {
    Copied,
    Applied,
    Partial,
}

fn record(report: &mut HiveReport, failures: &mut Vec<EntryFailure>, stored: &str, result: Result<HiveApply>) {
    match result {
        Ok(HiveApply::Copied) => report.copied += 1,
        Ok(HiveApply::Applied) => report.applied += 1,
        Ok(HiveApply::Partial) => report.partial += 1,
        Err(error) => {
            warn!(path = %stored, error = %error, "failed to apply hive");
            failures.push(EntryFailure {
                path: stored.to_string(),
                error,
            });
        }
    }
}

fn apply_stored_hive(diff: &FsHandle, stored: &str, base: &FsHandle, target: &str) -> Result<HiveApply> {
    let raw = diff.read(stored)?;
    if !base.exists(target) {
        ensure_parent(base, target)?;
        base.write(target, &raw)?;
        return Ok(HiveApply::Copied);
    }

    let mut live = hive::decode(&base.read(target)?).map_err(|e| DiffError::Hive(format!("{target}: {e}")))?;
    let clean = RegistryDiff::from_bytes(&raw).apply_to(&mut live);
    base.write(target, &hive::encode(&live)?)?;
    info!(hive = %target, clean, "registry diff applied");
    Ok(if clean { HiveApply::Applied } else { HiveApply::Partial })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::copy_queue::Outcome;
    use crate::registry::{Hive, RegValue};
    use crate::volume::memory::MemoryFs;
    use crate::volume::FsType;

    fn ntfs() -> FsHandle {
        FsHandle::new(MemoryFs::new(FsType::Ntfs))
    }

    fn put(fs: &FsHandle, path: &str, data: &[u8]) {
        ensure_parent(fs, path).unwrap();
        fs.write(path, data).unwrap();
    }

    fn hive_with(values: &[(&str, &str, u32)]) -> Vec<u8> {
        let mut hive = Hive::new();
        for (key, name, v) in values {
            hive.set_value(key, name, RegValue::dword(*v)).unwrap();
        }
        hive::encode(&hive).unwrap()
    }

    #[test]
    fn test_classify_paths() {
        assert_eq!(
            HiveLocation::classify("Windows/System32/config/SOFTWARE"),
            Some(HiveLocation::System("Windows/System32/config/SOFTWARE".into()))
        );
        assert_eq!(
            HiveLocation::classify("Users/alice/NTUSER.DAT"),
            Some(HiveLocation::User("alice".into()))
        );
        assert_eq!(
            HiveLocation::classify("Documents and Settings/bob/ntuser.dat"),
            Some(HiveLocation::User("bob".into()))
        );
        assert_eq!(HiveLocation::classify("Users/alice/Desktop/ntuser.dat"), None);
        assert_eq!(HiveLocation::classify("Windows/System32/config/SAM"), None);
        assert_eq!(
            HiveLocation::User("alice".into()).diff_path(),
            "REGISTRY/USERS/alice/ntuser.dat"
        );
    }

    #[test]
    fn test_hive_dir_regex() {
        assert!(hive_dir_regex().is_match("WINNT/system32/config/SAM"));
        assert!(!hive_dir_regex().is_match("Program Files/WINDOWS/SYSTEM32/CONFIG/x"));
    }

    #[test]
    fn test_rewrite_diffs_existing_and_relocates_new() {
        let old = ntfs();
        let new = ntfs();
        let out = ntfs();
        let software = "Windows/System32/config/SOFTWARE";
        put(&old, software, &hive_with(&[("App", "V", 1)]));
        put(&new, software, &hive_with(&[("App", "V", 2)]));
        put(&new, "Users/carol/NTUSER.DAT", &hive_with(&[("Env", "X", 7)]));
        put(&out, &join_path(FILES_ROOT, software), b"raw copy");
        put(&out, "FILES/Users/carol/NTUSER.DAT", b"raw user copy");

        let written = vec![
            Written {
                source_path: software.into(),
                destination_path: join_path(FILES_ROOT, software),
                outcome: Outcome::Copied,
            },
            Written {
                source_path: "Users/carol/NTUSER.DAT".into(),
                destination_path: "FILES/Users/carol/NTUSER.DAT".into(),
                outcome: Outcome::Copied,
            },
        ];
        let mut failures = Vec::new();
        let report = rewrite_hives(&old, &new, &out, &written, &mut failures);
        assert!(failures.is_empty());
        assert_eq!(report.diffed, 1);
        assert_eq!(report.relocated, 1);

        assert!(!out.exists("FILES/Windows/System32/config/SOFTWARE"));
        let diff = RegistryDiff::from_bytes(&out.read("REGISTRY/SYSTEM/Windows/System32/config/SOFTWARE").unwrap());
        assert_eq!(diff.get("App", "V"), Some(&RegValue::dword(2)));
        assert_eq!(out.read("REGISTRY/USERS/carol/ntuser.dat").unwrap(), b"raw user copy");
        assert!(!out.exists("FILES/Users/carol/NTUSER.DAT"));
    }

    #[test]
    fn test_rewrite_reports_unreadable_hive() {
        let old = ntfs();
        let new = ntfs();
        let out = ntfs();
        let system = "Windows/System32/config/SYSTEM";
        put(&old, system, b"garbage");
        put(&new, system, &hive_with(&[]));
        put(&out, &join_path(FILES_ROOT, system), b"raw");
        let written = vec![Written {
            source_path: system.into(),
            destination_path: join_path(FILES_ROOT, system),
            outcome: Outcome::Copied,
        }];
        let mut failures = Vec::new();
        rewrite_hives(&old, &new, &out, &written, &mut failures);
        assert_eq!(failures.len(), 1);
        assert!(matches!(failures[0].error, DiffError::Hive(_)));
    }

    #[test]
    fn test_apply_replays_system_and_user_hives() {
        let diff_fs = ntfs();
        let base = ntfs();
        let software = "Windows/System32/config/SOFTWARE";
        put(&base, software, &hive_with(&[("App", "V", 1), ("App", "Keep", 5)]));
        put(&base, "Users/Dave/ntuser.dat", &hive_with(&[("Env", "X", 1)]));

        let mut system_diff = RegistryDiff::new();
        system_diff.insert("App", "V", RegValue::dword(2));
        put(&diff_fs, &join_path(SYSTEM_REGISTRY_ROOT, software), &system_diff.to_bytes().unwrap());
        let mut user_diff = RegistryDiff::new();
        user_diff.insert("Env", "X", RegValue::dword(9));
        put(&diff_fs, "REGISTRY/USERS/dave/ntuser.dat", &user_diff.to_bytes().unwrap());
        put(&diff_fs, "REGISTRY/USERS/erin/ntuser.dat", &user_diff.to_bytes().unwrap());
        put(&diff_fs, "REGISTRY/SYSTEM/WINDOWS/SYSTEM32/CONFIG/DEFAULT", &hive_with(&[("D", "d", 3)]));

        let mut failures = Vec::new();
        let report = apply_hives(&diff_fs, &base, &mut failures).unwrap();
        assert!(failures.is_empty());
        assert_eq!(report.applied, 2);
        assert_eq!(report.copied, 1);
        assert_eq!(report.skipped, 1);

        let software_hive = hive::decode(&base.read(software).unwrap()).unwrap();
        assert_eq!(software_hive.value("App", "V"), Some(&RegValue::dword(2)));
        assert_eq!(software_hive.value("App", "Keep"), Some(&RegValue::dword(5)));
        let user_hive = hive::decode(&base.read("Users/Dave/ntuser.dat").unwrap()).unwrap();
        assert_eq!(user_hive.value("Env", "X"), Some(&RegValue::dword(9)));
        assert!(base.exists("WINDOWS/SYSTEM32/CONFIG/DEFAULT"));
    }
}
