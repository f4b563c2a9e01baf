use std::collections::BTreeMap;

use tracing::warn;

use super::compare::{CompareMode, RegistryComparison, Side};
use super::hive::{self, SharedHive};
use super::{split_key_path, Hive, RegName, RegValue};
use crate::error::Result;

/// Values that changed between two hives, as seen from one side.
///
/// Deletions are not represented: a value missing from the diff is left
/// alone when the diff is applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryDiff {
    keys: BTreeMap<RegName, BTreeMap<RegName, RegValue>>,
}

impl RegistryDiff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep the changed entries of `comparison`, recording `side`'s value.
    /// Entries where `side` has no value are skipped.
    pub fn from_comparison(comparison: &RegistryComparison, side: Side) -> Self {
        let mut diff = Self::new();
        for entry in comparison.changed() {
            if let Some(value) = entry.side(side) {
                diff.insert(&entry.key_path, &entry.name, value.clone());
            }
        }
        diff
    }

    /// The values of `new` that are missing from or different in `old`.
    pub fn between(old: &SharedHive, new: &SharedHive) -> Self {
        let comparison = RegistryComparison::compare(old, new, CompareMode::PreferB);
        Self::from_comparison(&comparison, Side::B)
    }

    pub fn insert(&mut self, key_path: &str, name: &str, value: RegValue) {
        self.keys
            .entry(RegName::from(key_path))
            .or_default()
            .insert(RegName::from(name), value);
    }

    pub fn get(&self, key_path: &str, name: &str) -> Option<&RegValue> {
        self.keys.get(&RegName::from(key_path))?.get(&RegName::from(name))
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    pub fn value_count(&self) -> usize {
        self.keys.values().map(BTreeMap::len).sum()
    }

    /// A standalone hive holding one key per recorded path.
    ///
    /// Names and payloads are stored as recorded; they are validated only
    /// when applied.
    pub fn to_hive(&self) -> Hive {
        let mut out = Hive::new();
        for (path, values) in &self.keys {
            let key = split_key_path(path.as_str())
                .into_iter()
                .fold(&mut out.root, |key, name| key.subkeys.entry(RegName::from(name)).or_default());
            for (name, value) in values {
                key.values.insert(name.clone(), value.clone());
            }
        }
        out
    }

    pub fn from_hive(hive: &Hive) -> Self {
        let mut diff = Self::new();
        for (path, key) in hive.valued_keys() {
            for (name, value) in &key.values {
                diff.insert(&path, name.as_str(), value.clone());
            }
        }
        diff
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        hive::encode(&self.to_hive())
    }

    /// Read a diff written by [`RegistryDiff::to_bytes`]. Anything that does
    /// not decode as a hive reads as an empty diff.
    pub fn from_bytes(raw: &[u8]) -> Self {
        match hive::decode(raw) {
            Ok(hive) => Self::from_hive(&hive),
            Err(e) => {
                warn!(error = %e, "registry diff is unreadable, treating it as empty");
                Self::new()
            }
        }
    }

    /// Write every recorded value into `root`, creating keys as needed.
    ///
    /// A key or value that cannot be written is logged and skipped; the rest
    /// are still applied. Returns true only if everything applied.
    pub fn apply_to(&self, root: &mut Hive) -> bool {
        let mut clean = true;
        for (path, values) in &self.keys {
            let key = match split_key_path(path.as_str())
                .into_iter()
                .try_fold(&mut root.root, |key, name| key.create_subkey(name))
            {
                Ok(key) => key,
                Err(e) => {
                    warn!(key = %path, error = %e, "failed to open registry key");
                    clean = false;
                    continue;
                }
            };
            for (name, value) in values {
                if let Err(e) = key.set_value(name.as_str(), value.clone()) {
                    warn!(key = %path, value = %name, error = %e, "failed to set registry value");
                    clean = false;
                }
            }
        }
        clean
    }
}
