//! Volume access: virtual disks, their partitions, and the filesystems
//! mounted on them.
//!
//! The engine only talks to these traits. Two providers ship with the crate:
//! [`memory`] keeps whole disks in memory and [`host`] maps a disk image onto
//! a host directory tree.

pub mod host;
pub mod memory;

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{DiffError, Result};

pub const ATTR_READONLY: u32 = 0x0001;
pub const ATTR_HIDDEN: u32 = 0x0002;
pub const ATTR_SYSTEM: u32 = 0x0004;
pub const ATTR_DIRECTORY: u32 = 0x0010;
pub const ATTR_ARCHIVE: u32 = 0x0020;

/// Filesystem tag of a partition, as recorded in the BIOS partition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FsType {
    Fat12,
    Fat16,
    Fat32,
    Ntfs,
    LinuxNative,
    LinuxSwap,
    LinuxLvm,
    Other(u8),
}

impl FsType {
    pub fn from_bios(code: u8) -> Self {
        match code {
            0x01 => FsType::Fat12,
            0x04 | 0x06 | 0x0e => FsType::Fat16,
            0x0b | 0x0c => FsType::Fat32,
            0x07 => FsType::Ntfs,
            0x83 => FsType::LinuxNative,
            0x82 => FsType::LinuxSwap,
            0x8e => FsType::LinuxLvm,
            other => FsType::Other(other),
        }
    }

    pub fn bios_code(self) -> u8 {
        match self {
            FsType::Fat12 => 0x01,
            FsType::Fat16 => 0x06,
            FsType::Fat32 => 0x0c,
            FsType::Ntfs => 0x07,
            FsType::LinuxNative => 0x83,
            FsType::LinuxSwap => 0x82,
            FsType::LinuxLvm => 0x8e,
            FsType::Other(code) => code,
        }
    }

    /// Only FAT and NTFS partitions can be formatted in an output image.
    pub fn is_formattable(self) -> bool {
        matches!(self, FsType::Fat12 | FsType::Fat16 | FsType::Fat32 | FsType::Ntfs)
    }

    pub fn tag(self) -> String {
        match self {
            FsType::Fat12 => "fat12".into(),
            FsType::Fat16 => "fat16".into(),
            FsType::Fat32 => "fat32".into(),
            FsType::Ntfs => "ntfs".into(),
            FsType::LinuxNative => "ext".into(),
            FsType::LinuxSwap => "swap".into(),
            FsType::LinuxLvm => "lvm".into(),
            FsType::Other(code) => format!("{code:02x}"),
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        let fs_type = match tag.to_ascii_lowercase().as_str() {
            "fat12" => FsType::Fat12,
            "fat16" => FsType::Fat16,
            "fat32" => FsType::Fat32,
            "ntfs" => FsType::Ntfs,
            "ext" => FsType::LinuxNative,
            "swap" => FsType::LinuxSwap,
            "lvm" => FsType::LinuxLvm,
            hex => FsType::from_bios(u8::from_str_radix(hex, 16).ok()?),
        };
        Some(fs_type)
    }
}

impl fmt::Display for FsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionInfo {
    pub index: usize,
    pub fs_type: FsType,
    pub sector_count: u64,
    pub sector_size: u64,
}

impl PartitionInfo {
    pub fn size_bytes(&self) -> u64 {
        self.sector_count * self.sector_size
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTimes {
    pub created: SystemTime,
    pub modified: SystemTime,
    pub accessed: SystemTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    pub len: u64,
    pub attributes: u32,
    pub times: FileTimes,
}

/// Opaque NTFS security descriptor bytes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SecurityDescriptor(pub Vec<u8>);

/// The NTFS `$STANDARD_INFORMATION` fields the engine cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StandardInformation {
    pub times: FileTimes,
    pub attributes: u32,
    /// Update sequence number of the last change-journal record for the file.
    pub usn: u64,
}

/// Extended metadata only NTFS volumes provide.
pub trait NtfsExtensions {
    fn security(&self, path: &str) -> Result<SecurityDescriptor>;
    fn set_security(&mut self, path: &str, descriptor: &SecurityDescriptor) -> Result<()>;
    fn standard_information(&self, path: &str) -> Result<StandardInformation>;
    fn set_standard_information(&mut self, path: &str, info: &StandardInformation) -> Result<()>;
}

/// A mounted filesystem. Paths are relative to the volume root, use `/`
/// separators, and the root itself is `""`.
pub trait FileSystem: Send {
    fn fs_type(&self) -> FsType;
    fn read_dir(&self, dir: &str) -> Result<Vec<DirEntry>>;
    fn exists(&self, path: &str) -> bool;
    fn is_dir(&self, path: &str) -> bool;
    fn metadata(&self, path: &str) -> Result<FileMeta>;
    fn read(&self, path: &str) -> Result<Vec<u8>>;
    /// Create or truncate `path` and write `data`. The parent must exist.
    fn write(&mut self, path: &str, data: &[u8]) -> Result<()>;
    /// Create a single directory. The parent must exist.
    fn create_dir(&mut self, path: &str) -> Result<()>;
    fn remove_file(&mut self, path: &str) -> Result<()>;
    fn rename(&mut self, from: &str, to: &str) -> Result<()>;
    fn set_attributes(&mut self, path: &str, attributes: u32) -> Result<()>;
    fn set_times(&mut self, path: &str, times: &FileTimes) -> Result<()>;

    /// Whether paths differing only in case name the same entry.
    fn is_case_insensitive(&self) -> bool {
        false
    }

    fn ntfs(&self) -> Option<&dyn NtfsExtensions> {
        None
    }

    fn ntfs_mut(&mut self) -> Option<&mut dyn NtfsExtensions> {
        None
    }

    /// Every file below `dir`, recursively, as volume-relative paths.
    fn list_files(&self, dir: &str) -> Result<Vec<String>> {
        let mut files = Vec::new();
        let mut pending = vec![dir.to_string()];
        while let Some(current) = pending.pop() {
            for entry in self.read_dir(&current)? {
                let path = join_path(&current, &entry.name);
                match entry.kind {
                    EntryKind::File => files.push(path),
                    EntryKind::Dir => pending.push(path),
                }
            }
        }
        files.sort();
        Ok(files)
    }
}

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Shared access to one mounted filesystem.
///
/// The filesystem is not assumed to tolerate concurrent calls, so every
/// operation goes through this handle's own lock. Different handles never
/// contend with each other.
#[derive(Clone)]
pub struct FsHandle {
    id: u64,
    inner: Arc<Mutex<dyn FileSystem>>,
}

impl FsHandle {
    pub fn new<F: FileSystem + 'static>(fs: F) -> Self {
        Self::from_shared(Arc::new(Mutex::new(fs)))
    }

    /// Wrap a filesystem whose lock is also held elsewhere, e.g. by the disk
    /// that owns it.
    pub fn from_shared(inner: Arc<Mutex<dyn FileSystem>>) -> Self {
        Self {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            inner,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn with<R>(&self, op: impl FnOnce(&dyn FileSystem) -> R) -> R {
        let guard = self.inner.lock();
        op(&*guard)
    }

    pub fn with_mut<R>(&self, op: impl FnOnce(&mut dyn FileSystem) -> R) -> R {
        let mut guard = self.inner.lock();
        op(&mut *guard)
    }

    pub fn fs_type(&self) -> FsType {
        self.with(|fs| fs.fs_type())
    }

    pub fn is_case_insensitive(&self) -> bool {
        self.with(|fs| fs.is_case_insensitive())
    }

    pub fn has_ntfs_extensions(&self) -> bool {
        self.with(|fs| fs.ntfs().is_some())
    }

    pub fn exists(&self, path: &str) -> bool {
        self.with(|fs| fs.exists(path))
    }

    pub fn is_dir(&self, path: &str) -> bool {
        self.with(|fs| fs.is_dir(path))
    }

    pub fn read(&self, path: &str) -> Result<Vec<u8>> {
        self.with(|fs| fs.read(path))
    }

    pub fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        self.with_mut(|fs| fs.write(path, data))
    }

    pub fn metadata(&self, path: &str) -> Result<FileMeta> {
        self.with(|fs| fs.metadata(path))
    }

    pub fn list_files(&self, dir: &str) -> Result<Vec<String>> {
        self.with(|fs| fs.list_files(dir))
    }

    pub fn read_dir(&self, dir: &str) -> Result<Vec<DirEntry>> {
        self.with(|fs| fs.read_dir(dir))
    }

    pub fn remove_file(&self, path: &str) -> Result<()> {
        self.with_mut(|fs| fs.remove_file(path))
    }
}

impl fmt::Debug for FsHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsHandle").field("id", &self.id).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    ReadWrite,
}

/// Container format of a newly created output image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DiskFormat {
    #[default]
    Vhd,
    Vhdx,
}

impl std::str::FromStr for DiskFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "vhd" => Ok(DiskFormat::Vhd),
            "vhdx" => Ok(DiskFormat::Vhdx),
            other => Err(format!("unknown disk format: {other}")),
        }
    }
}

pub trait VirtualDisk: Send {
    fn partitions(&self) -> Vec<PartitionInfo>;
    fn sector_size(&self) -> u64;
    fn block_size(&self) -> u64;
    /// Detect and mount the filesystem of a partition.
    fn open_filesystem(&mut self, index: usize) -> Result<FsHandle>;
    /// Append a partition of at least `size_bytes` and format it.
    fn create_partition(&mut self, size_bytes: u64, fs_type: FsType) -> Result<usize>;
    fn flush(&mut self) -> Result<()>;
}

pub trait DiskProvider: Send + Sync {
    fn exists(&self, path: &Path) -> bool;
    fn open(&self, path: &Path, access: Access) -> Result<Box<dyn VirtualDisk>>;
    fn create_dynamic(
        &self,
        path: &Path,
        format: DiskFormat,
        capacity: u64,
        block_size: u64,
        overwrite: bool,
    ) -> Result<Box<dyn VirtualDisk>>;
    /// Create an image that records only changes relative to `parent`.
    fn create_differencing(&self, parent: &Path, path: &Path) -> Result<Box<dyn VirtualDisk>>;
    fn copy_image(&self, from: &Path, to: &Path) -> Result<()>;
}

/// Join a volume-relative directory and a name.
pub fn join_path(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir.trim_end_matches('/'), name)
    }
}

/// Parent directory of a volume-relative path; the root's parent is `None`.
pub fn parent_path(path: &str) -> Option<&str> {
    if path.is_empty() {
        return None;
    }
    Some(path.rfind('/').map_or("", |i| &path[..i]))
}

pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

pub(crate) fn not_found(path: &str) -> DiffError {
    DiffError::NotFound(path.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_helpers() {
        assert_eq!(join_path("", "a"), "a");
        assert_eq!(join_path("a/b", "c"), "a/b/c");
        assert_eq!(parent_path("a/b/c"), Some("a/b"));
        assert_eq!(parent_path("a"), Some(""));
        assert_eq!(parent_path(""), None);
        assert_eq!(file_name("a/b/c.txt"), "c.txt");
        assert_eq!(file_name("c.txt"), "c.txt");
    }

    #[test]
    fn test_fs_type_tags() {
        for fs_type in [FsType::Fat16, FsType::Fat32, FsType::Ntfs, FsType::LinuxNative, FsType::Other(0xaa)] {
            assert_eq!(FsType::from_tag(&fs_type.tag()), Some(fs_type));
            assert_eq!(FsType::from_bios(fs_type.bios_code()), fs_type);
        }
        assert!(FsType::Ntfs.is_formattable());
        assert!(!FsType::LinuxNative.is_formattable());
        assert_eq!(FsType::from_tag("NTFS"), Some(FsType::Ntfs));
        assert_eq!(FsType::from_tag("nonsense"), None);
    }
}
