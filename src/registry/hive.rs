use std::sync::Arc;

use parking_lot::Mutex;

use super::{Hive, Key};
use crate::error::{DiffError, Result};

/// Leading bytes of every hive file this crate writes.
pub const MAGIC: &[u8; 8] = b"HIVEV001";
const ZSTD_LEVEL: i32 = 3;

/// Serialize and compress a hive, prefixed with [`MAGIC`].
pub fn encode(hive: &Hive) -> Result<Vec<u8>> {
    let encoded = bincode::serialize(hive).map_err(|e| DiffError::Hive(format!("failed to serialize hive: {e}")))?;
    let compressed = zstd::bulk::compress(&encoded, ZSTD_LEVEL)?;
    let mut out = Vec::with_capacity(MAGIC.len() + compressed.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&compressed);
    Ok(out)
}

pub fn decode(raw: &[u8]) -> Result<Hive> {
    if raw.len() < MAGIC.len() || &raw[..MAGIC.len()] != MAGIC {
        return Err(DiffError::Hive("not a hive file (bad magic)".into()));
    }
    let decoder = zstd::Decoder::new(&raw[MAGIC.len()..])
        .map_err(|e| DiffError::Hive(format!("failed to open hive stream: {e}")))?;
    bincode::deserialize_from(decoder).map_err(|e| DiffError::Hive(format!("failed to deserialize hive: {e}")))
}

/// A hive behind its own lock. Concurrent walkers take the lock for one
/// read at a time, so walks of two different hives never contend.
#[derive(Debug, Clone, Default)]
pub struct SharedHive {
    inner: Arc<Mutex<Hive>>,
}

/// What a walker needs from one key, copied out under the lock.
#[derive(Debug, Clone, Default)]
pub struct KeySnapshot {
    pub exists: bool,
    pub values: Vec<(String, super::RegValue)>,
    pub subkeys: Vec<String>,
}

impl SharedHive {
    pub fn new(hive: Hive) -> Self {
        Self {
            inner: Arc::new(Mutex::new(hive)),
        }
    }

    pub fn snapshot(&self, path: &str) -> KeySnapshot {
        let hive = self.inner.lock();
        match hive.key(path) {
            Some(key) => snapshot_key(key),
            None => KeySnapshot::default(),
        }
    }

    pub fn with_mut<R>(&self, op: impl FnOnce(&mut Hive) -> R) -> R {
        op(&mut self.inner.lock())
    }

    pub fn into_inner(self) -> Hive {
        match Arc::try_unwrap(self.inner) {
            Ok(mutex) => mutex.into_inner(),
            Err(shared) => shared.lock().clone(),
        }
    }
}

fn snapshot_key(key: &Key) -> KeySnapshot {
    KeySnapshot {
        exists: true,
        values: key
            .values
            .iter()
            .map(|(name, value)| (name.as_str().to_string(), value.clone()))
            .collect(),
        subkeys: key.subkey_names(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{RegValue, ValueKind};

    #[test]
    fn test_encode_decode() {
        let mut hive = Hive::new();
        hive.set_value("Control\\Session Manager", "Flags", RegValue::dword(0x10))
            .unwrap();
        hive.set_value("", "Blob", RegValue::new(ValueKind::Binary, vec![0, 1, 2]))
            .unwrap();
        let bytes = encode(&hive).unwrap();
        assert!(bytes.starts_with(MAGIC));
        assert_eq!(decode(&bytes).unwrap(), hive);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode(b"regf\0\0\0\0"), Err(DiffError::Hive(_))));
        let mut truncated = encode(&Hive::new()).unwrap();
        truncated.truncate(MAGIC.len() + 2);
        assert!(decode(&truncated).is_err());
    }

    #[test]
    fn test_snapshot_missing_key() {
        let shared = SharedHive::new(Hive::new());
        let snap = shared.snapshot("Nope");
        assert!(!snap.exists);
        assert!(snap.values.is_empty());
    }
}
