//! Registry hives: a tree of case-insensitively named keys, each holding
//! typed values.
//!
//! Key paths are backslash-delimited and relative to the hive root, which is
//! the empty path.

pub mod compare;
pub mod diff;
pub mod hive;

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::error::{DiffError, Result};

pub use compare::{CompareMode, RegistryComparison, Side, ValueComparison};
pub use diff::RegistryDiff;
pub use hive::SharedHive;

pub const MAX_KEY_NAME_LEN: usize = 255;

/// A key name, value name or key path that compares case-insensitively but
/// keeps the case it was first written with.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegName(String);

impl RegName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn folded(&self) -> String {
        self.0.to_lowercase()
    }
}

impl PartialEq for RegName {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for RegName {}

impl PartialOrd for RegName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RegName {
    fn cmp(&self, other: &Self) -> Ordering {
        self.folded().cmp(&other.folded())
    }
}

impl Hash for RegName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.folded().hash(state);
    }
}

impl fmt::Display for RegName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RegName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Registry value type, with the Windows `REG_*` numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    None,
    String,
    ExpandString,
    Binary,
    Dword,
    DwordBigEndian,
    Link,
    MultiString,
    ResourceList,
    FullResourceDescriptor,
    ResourceRequirementsList,
    Qword,
}

impl ValueKind {
    pub fn code(self) -> u32 {
        match self {
            ValueKind::None => 0,
            ValueKind::String => 1,
            ValueKind::ExpandString => 2,
            ValueKind::Binary => 3,
            ValueKind::Dword => 4,
            ValueKind::DwordBigEndian => 5,
            ValueKind::Link => 6,
            ValueKind::MultiString => 7,
            ValueKind::ResourceList => 8,
            ValueKind::FullResourceDescriptor => 9,
            ValueKind::ResourceRequirementsList => 10,
            ValueKind::Qword => 11,
        }
    }

    fn fixed_len(self) -> Option<usize> {
        match self {
            ValueKind::Dword | ValueKind::DwordBigEndian => Some(4),
            ValueKind::Qword => Some(8),
            _ => None,
        }
    }
}

/// A typed value payload. The bytes are stored as the hive stores them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegValue {
    pub kind: ValueKind,
    pub data: Vec<u8>,
}

impl RegValue {
    pub fn new(kind: ValueKind, data: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            data: data.into(),
        }
    }

    pub fn dword(value: u32) -> Self {
        Self::new(ValueKind::Dword, value.to_le_bytes())
    }

    pub fn qword(value: u64) -> Self {
        Self::new(ValueKind::Qword, value.to_le_bytes())
    }

    /// A `REG_SZ` value, stored as NUL-terminated UTF-16LE.
    pub fn string(value: &str) -> Self {
        let data: Vec<u8> = value
            .encode_utf16()
            .chain(std::iter::once(0))
            .flat_map(u16::to_le_bytes)
            .collect();
        Self::new(ValueKind::String, data)
    }

    pub fn validate(&self) -> Result<()> {
        match self.kind.fixed_len() {
            Some(len) if self.data.len() != len => Err(DiffError::Hive(format!(
                "{:?} value must be {len} bytes, got {}",
                self.kind,
                self.data.len()
            ))),
            _ => Ok(()),
        }
    }
}

pub fn validate_key_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(DiffError::Hive("key name is empty".into()));
    }
    if name.contains('\\') {
        return Err(DiffError::Hive(format!("key name {name:?} contains a backslash")));
    }
    if name.chars().count() > MAX_KEY_NAME_LEN {
        return Err(DiffError::Hive(format!(
            "key name is longer than {MAX_KEY_NAME_LEN} characters"
        )));
    }
    Ok(())
}

/// Split a key path into its components. The root path has none.
pub fn split_key_path(path: &str) -> Vec<&str> {
    if path.is_empty() {
        Vec::new()
    } else {
        path.split('\\').collect()
    }
}

pub fn join_key_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}\\{name}")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key {
    pub values: BTreeMap<RegName, RegValue>,
    pub subkeys: BTreeMap<RegName, Key>,
}

impl Key {
    pub fn value(&self, name: &str) -> Option<&RegValue> {
        self.values.get(&RegName::from(name))
    }

    pub fn subkey(&self, name: &str) -> Option<&Key> {
        self.subkeys.get(&RegName::from(name))
    }

    pub fn value_names(&self) -> Vec<String> {
        self.values.keys().map(|n| n.as_str().to_string()).collect()
    }

    pub fn subkey_names(&self) -> Vec<String> {
        self.subkeys.keys().map(|n| n.as_str().to_string()).collect()
    }

    /// Open or create the subkey `name`.
    pub fn create_subkey(&mut self, name: &str) -> Result<&mut Key> {
        validate_key_name(name)?;
        Ok(self.subkeys.entry(RegName::from(name)).or_default())
    }

    pub fn set_value(&mut self, name: &str, value: RegValue) -> Result<()> {
        value.validate()?;
        self.values.insert(RegName::from(name), value);
        Ok(())
    }
}

/// An in-memory hive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hive {
    pub root: Key,
}

impl Hive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(&self, path: &str) -> Option<&Key> {
        split_key_path(path)
            .into_iter()
            .try_fold(&self.root, |key, name| key.subkey(name))
    }

    /// Open or create every key along `path`.
    pub fn create_key(&mut self, path: &str) -> Result<&mut Key> {
        let mut key = &mut self.root;
        for name in split_key_path(path) {
            key = key.create_subkey(name)?;
        }
        Ok(key)
    }

    pub fn value(&self, path: &str, name: &str) -> Option<&RegValue> {
        self.key(path)?.value(name)
    }

    pub fn set_value(&mut self, path: &str, name: &str, value: RegValue) -> Result<()> {
        self.create_key(path)?.set_value(name, value)
    }

    /// Every key path holding at least one value, with those values.
    pub fn valued_keys(&self) -> Vec<(String, &Key)> {
        let mut out = Vec::new();
        let mut pending = vec![(String::new(), &self.root)];
        while let Some((path, key)) = pending.pop() {
            if !key.values.is_empty() {
                out.push((path.clone(), key));
            }
            for (name, sub) in &key.subkeys {
                pending.push((join_key_path(&path, name.as_str()), sub));
            }
        }
        out
    }
}
