use std::collections::BTreeMap;

use parking_lot::Mutex;
use rayon::prelude::*;

use super::hive::{KeySnapshot, SharedHive};
use super::{join_key_path, RegName, RegValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    A,
    B,
}

/// Which subtrees a comparison walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareMode {
    /// The union of both trees.
    Full,
    /// Only keys present in A, noting B's matching values.
    PreferA,
    /// Only keys present in B, noting A's matching values.
    PreferB,
}

/// One value name seen at one key path, on either side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueComparison {
    pub key_path: String,
    pub name: String,
    pub a: Option<RegValue>,
    pub b: Option<RegValue>,
}

impl ValueComparison {
    /// Both sides hold a value of the same kind and content.
    pub fn is_same(&self) -> bool {
        matches!((&self.a, &self.b), (Some(a), Some(b)) if a == b)
    }

    pub fn side(&self, side: Side) -> Option<&RegValue> {
        match side {
            Side::A => self.a.as_ref(),
            Side::B => self.b.as_ref(),
        }
    }
}

/// Result of walking two hives in lock-step.
///
/// Entries are keyed by key path and value name, both case-insensitive.
#[derive(Debug, Default)]
pub struct RegistryComparison {
    entries: BTreeMap<(RegName, RegName), ValueComparison>,
}

impl RegistryComparison {
    pub fn compare(a: &SharedHive, b: &SharedHive, mode: CompareMode) -> Self {
        let output = Mutex::new(BTreeMap::new());
        compare_key(a, b, mode, String::new(), &output);
        Self {
            entries: output.into_inner(),
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = &ValueComparison> {
        self.entries.values()
    }

    pub fn get(&self, key_path: &str, name: &str) -> Option<&ValueComparison> {
        self.entries.get(&(RegName::from(key_path), RegName::from(name)))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn changed(&self) -> impl Iterator<Item = &ValueComparison> {
        self.entries().filter(|entry| !entry.is_same())
    }
}

type Output = Mutex<BTreeMap<(RegName, RegName), ValueComparison>>;

/// Compare one key, then fan out over its subkeys. Returns once every
/// subkey walk has finished.
fn compare_key(a: &SharedHive, b: &SharedHive, mode: CompareMode, path: String, output: &Output) {
    // each hive lock is held only while its snapshot is taken
    let snap_a = a.snapshot(&path);
    let snap_b = b.snapshot(&path);

    let walk_a = snap_a.exists && mode != CompareMode::PreferB;
    let walk_b = snap_b.exists && mode != CompareMode::PreferA;

    let mut values: BTreeMap<RegName, (Option<RegValue>, Option<RegValue>)> = BTreeMap::new();
    if walk_a {
        for (name, value) in &snap_a.values {
            values.entry(RegName::from(name.as_str())).or_default().0 = Some(value.clone());
        }
    }
    if walk_b {
        for (name, value) in &snap_b.values {
            values.entry(RegName::from(name.as_str())).or_default().1 = Some(value.clone());
        }
    }
    // a one-sided walk still notes the other side's matching values
    if walk_b && !walk_a {
        fill_other_side(&mut values, &snap_a, Side::A);
    }
    if walk_a && !walk_b {
        fill_other_side(&mut values, &snap_b, Side::B);
    }

    if !values.is_empty() {
        let mut out = output.lock();
        for (name, (va, vb)) in values {
            let entry = ValueComparison {
                key_path: path.clone(),
                name: name.as_str().to_string(),
                a: va,
                b: vb,
            };
            out.insert((RegName::from(path.as_str()), name), entry);
        }
    }

    let mut subkeys: BTreeMap<RegName, String> = BTreeMap::new();
    if walk_a {
        for name in &snap_a.subkeys {
            subkeys.entry(RegName::from(name.as_str())).or_insert_with(|| name.clone());
        }
    }
    if walk_b {
        for name in &snap_b.subkeys {
            subkeys.entry(RegName::from(name.as_str())).or_insert_with(|| name.clone());
        }
    }

    subkeys
        .into_values()
        .collect::<Vec<_>>()
        .into_par_iter()
        .for_each(|name| compare_key(a, b, mode, join_key_path(&path, &name), output));
}

fn fill_other_side(
    values: &mut BTreeMap<RegName, (Option<RegValue>, Option<RegValue>)>,
    other: &KeySnapshot,
    side: Side,
) {
    for (name, value) in &other.values {
        if let Some((a, b)) = values.get_mut(&RegName::from(name.as_str())) {
            let slot = match side {
                Side::A => a,
                Side::B => b,
            };
            *slot = Some(value.clone());
        }
    }
}
