//! Disks and filesystems held entirely in memory.
//!
//! Paths are matched case-insensitively and keep the case they were created
//! with, like FAT and NTFS. NTFS partitions expose [`NtfsExtensions`] with a
//! per-volume update sequence counter that advances on every change.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;

use super::{
    file_name, not_found, parent_path, Access, DirEntry, DiskFormat, DiskProvider, EntryKind, FileMeta,
    FileSystem, FileTimes, FsHandle, FsType, NtfsExtensions, PartitionInfo, SecurityDescriptor,
    StandardInformation, VirtualDisk, ATTR_ARCHIVE, ATTR_DIRECTORY,
};
use crate::error::{DiffError, Result};

const SECTOR_SIZE: u64 = 512;
const TABLE_SLACK_SECTORS: u64 = 64;

#[derive(Debug, Clone)]
struct Node {
    name: String,
    kind: EntryKind,
    data: Vec<u8>,
    attributes: u32,
    times: FileTimes,
    security: SecurityDescriptor,
    usn: u64,
}

impl Node {
    fn new(name: &str, kind: EntryKind, usn: u64) -> Self {
        let now = SystemTime::now();
        let attributes = match kind {
            EntryKind::Dir => ATTR_DIRECTORY,
            EntryKind::File => ATTR_ARCHIVE,
        };
        Self {
            name: name.to_string(),
            kind,
            data: Vec::new(),
            attributes,
            times: FileTimes {
                created: now,
                modified: now,
                accessed: now,
            },
            security: SecurityDescriptor::default(),
            usn,
        }
    }
}

/// An in-memory filesystem.
#[derive(Debug, Clone)]
pub struct MemoryFs {
    fs_type: FsType,
    nodes: BTreeMap<String, Node>,
    next_usn: u64,
}

fn key(path: &str) -> String {
    path.trim_matches('/').to_lowercase()
}

impl MemoryFs {
    pub fn new(fs_type: FsType) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(String::new(), Node::new("", EntryKind::Dir, 0));
        Self {
            fs_type,
            nodes,
            next_usn: 1,
        }
    }

    fn bump_usn(&mut self) -> u64 {
        let usn = self.next_usn;
        self.next_usn += 1;
        usn
    }

    fn node(&self, path: &str) -> Result<&Node> {
        self.nodes.get(&key(path)).ok_or_else(|| not_found(path))
    }

    fn node_mut(&mut self, path: &str) -> Result<&mut Node> {
        let usn = self.bump_usn();
        let node = self.nodes.get_mut(&key(path)).ok_or_else(|| not_found(path))?;
        node.usn = usn;
        Ok(node)
    }

    fn check_parent(&self, path: &str) -> Result<()> {
        let parent = parent_path(path.trim_matches('/')).ok_or_else(|| {
            DiffError::Io(io::Error::new(io::ErrorKind::InvalidInput, "the root cannot be replaced"))
        })?;
        match self.nodes.get(&key(parent)) {
            Some(node) if node.kind == EntryKind::Dir => Ok(()),
            Some(_) => Err(DiffError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{parent} is not a directory"),
            ))),
            None => Err(not_found(parent)),
        }
    }
}

impl FileSystem for MemoryFs {
    fn fs_type(&self) -> FsType {
        self.fs_type
    }

    fn read_dir(&self, dir: &str) -> Result<Vec<DirEntry>> {
        let dir_key = key(dir);
        match self.nodes.get(&dir_key) {
            Some(node) if node.kind == EntryKind::Dir => {}
            _ => return Err(not_found(dir)),
        }
        let entries = self
            .nodes
            .iter()
            .filter(|(k, _)| !k.is_empty() && parent_path(k) == Some(dir_key.as_str()))
            .map(|(_, node)| DirEntry {
                name: node.name.clone(),
                kind: node.kind,
            })
            .collect();
        Ok(entries)
    }

    fn exists(&self, path: &str) -> bool {
        self.nodes.contains_key(&key(path))
    }

    fn is_dir(&self, path: &str) -> bool {
        self.nodes
            .get(&key(path))
            .is_some_and(|node| node.kind == EntryKind::Dir)
    }

    fn metadata(&self, path: &str) -> Result<FileMeta> {
        let node = self.node(path)?;
        Ok(FileMeta {
            len: node.data.len() as u64,
            attributes: node.attributes,
            times: node.times.clone(),
        })
    }

    fn read(&self, path: &str) -> Result<Vec<u8>> {
        let node = self.node(path)?;
        if node.kind == EntryKind::Dir {
            return Err(DiffError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{path} is a directory"),
            )));
        }
        Ok(node.data.clone())
    }

    fn write(&mut self, path: &str, data: &[u8]) -> Result<()> {
        if !self.exists(path) {
            self.check_parent(path)?;
            let usn = self.bump_usn();
            self.nodes
                .insert(key(path), Node::new(file_name(path.trim_matches('/')), EntryKind::File, usn));
        }
        let node = self.node_mut(path)?;
        if node.kind == EntryKind::Dir {
            return Err(DiffError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{path} is a directory"),
            )));
        }
        node.data = data.to_vec();
        node.times.modified = SystemTime::now();
        Ok(())
    }

    fn create_dir(&mut self, path: &str) -> Result<()> {
        if self.is_dir(path) {
            return Ok(());
        }
        if self.exists(path) {
            return Err(DiffError::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{path} exists and is a file"),
            )));
        }
        self.check_parent(path)?;
        let usn = self.bump_usn();
        self.nodes
            .insert(key(path), Node::new(file_name(path.trim_matches('/')), EntryKind::Dir, usn));
        Ok(())
    }

    fn remove_file(&mut self, path: &str) -> Result<()> {
        match self.nodes.get(&key(path)) {
            Some(node) if node.kind == EntryKind::File => {
                self.nodes.remove(&key(path));
                self.bump_usn();
                Ok(())
            }
            Some(_) => Err(DiffError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{path} is a directory"),
            ))),
            None => Err(not_found(path)),
        }
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        if self.is_dir(from) {
            return Err(DiffError::Unsupported(format!("renaming directory {from}")));
        }
        self.check_parent(to)?;
        let mut node = self.nodes.remove(&key(from)).ok_or_else(|| not_found(from))?;
        node.name = file_name(to.trim_matches('/')).to_string();
        node.usn = self.bump_usn();
        self.nodes.insert(key(to), node);
        Ok(())
    }

    fn set_attributes(&mut self, path: &str, attributes: u32) -> Result<()> {
        let node = self.node_mut(path)?;
        let dir_bit = node.attributes & ATTR_DIRECTORY;
        node.attributes = (attributes & !ATTR_DIRECTORY) | dir_bit;
        Ok(())
    }

    fn set_times(&mut self, path: &str, times: &FileTimes) -> Result<()> {
        self.node_mut(path)?.times = times.clone();
        Ok(())
    }

    fn is_case_insensitive(&self) -> bool {
        true
    }

    fn ntfs(&self) -> Option<&dyn NtfsExtensions> {
        (self.fs_type == FsType::Ntfs).then_some(self as &dyn NtfsExtensions)
    }

    fn ntfs_mut(&mut self) -> Option<&mut dyn NtfsExtensions> {
        if self.fs_type == FsType::Ntfs {
            Some(self as &mut dyn NtfsExtensions)
        } else {
            None
        }
    }
}

impl NtfsExtensions for MemoryFs {
    fn security(&self, path: &str) -> Result<SecurityDescriptor> {
        Ok(self.node(path)?.security.clone())
    }

    fn set_security(&mut self, path: &str, descriptor: &SecurityDescriptor) -> Result<()> {
        self.node_mut(path)?.security = descriptor.clone();
        Ok(())
    }

    fn standard_information(&self, path: &str) -> Result<StandardInformation> {
        let node = self.node(path)?;
        Ok(StandardInformation {
            times: node.times.clone(),
            attributes: node.attributes,
            usn: node.usn,
        })
    }

    fn set_standard_information(&mut self, path: &str, info: &StandardInformation) -> Result<()> {
        // the journal assigns usn values, callers cannot
        let node = self.node_mut(path)?;
        let dir_bit = node.attributes & ATTR_DIRECTORY;
        node.times = info.times.clone();
        node.attributes = (info.attributes & !ATTR_DIRECTORY) | dir_bit;
        Ok(())
    }
}

struct MemoryPartition {
    info: PartitionInfo,
    fs: Arc<Mutex<MemoryFs>>,
    handle: FsHandle,
}

impl MemoryPartition {
    fn new(info: PartitionInfo, fs: MemoryFs) -> Self {
        let fs = Arc::new(Mutex::new(fs));
        let shared: Arc<Mutex<dyn FileSystem>> = fs.clone();
        Self {
            info,
            fs,
            handle: FsHandle::from_shared(shared),
        }
    }

    fn snapshot(&self) -> Self {
        let copy = self.fs.lock().clone();
        Self::new(self.info, copy)
    }
}

struct DiskState {
    format: DiskFormat,
    capacity: u64,
    block_size: u64,
    parent: Option<PathBuf>,
    partitions: Vec<MemoryPartition>,
}

impl DiskState {
    fn new(format: DiskFormat, capacity: u64, block_size: u64) -> Self {
        Self {
            format,
            capacity,
            block_size,
            parent: None,
            partitions: Vec::new(),
        }
    }

    fn used_sectors(&self) -> u64 {
        TABLE_SLACK_SECTORS + self.partitions.iter().map(|p| p.info.sector_count).sum::<u64>()
    }

    fn add_partition(&mut self, size_bytes: u64, fs_type: FsType) -> Result<usize> {
        let sector_count = size_bytes.div_ceil(SECTOR_SIZE);
        if (self.used_sectors() + sector_count) * SECTOR_SIZE > self.capacity {
            return Err(DiffError::Io(io::Error::other(format!(
                "partition of {size_bytes} bytes does not fit in a {} byte disk",
                self.capacity
            ))));
        }
        let index = self.partitions.len();
        let info = PartitionInfo {
            index,
            fs_type,
            sector_count,
            sector_size: SECTOR_SIZE,
        };
        self.partitions.push(MemoryPartition::new(info, MemoryFs::new(fs_type)));
        Ok(index)
    }

    fn snapshot(&self) -> Self {
        Self {
            format: self.format,
            capacity: self.capacity,
            block_size: self.block_size,
            parent: self.parent.clone(),
            partitions: self.partitions.iter().map(MemoryPartition::snapshot).collect(),
        }
    }
}

/// An opened in-memory disk. Changes are visible to every other opener.
pub struct MemoryDisk {
    state: Arc<Mutex<DiskState>>,
    access: Access,
}

impl VirtualDisk for MemoryDisk {
    fn partitions(&self) -> Vec<PartitionInfo> {
        self.state.lock().partitions.iter().map(|p| p.info).collect()
    }

    fn sector_size(&self) -> u64 {
        SECTOR_SIZE
    }

    fn block_size(&self) -> u64 {
        self.state.lock().block_size
    }

    fn open_filesystem(&mut self, index: usize) -> Result<FsHandle> {
        let state = self.state.lock();
        let count = state.partitions.len();
        state
            .partitions
            .get(index)
            .map(|p| p.handle.clone())
            .ok_or(DiffError::PartitionOutOfRange { index, count })
    }

    fn create_partition(&mut self, size_bytes: u64, fs_type: FsType) -> Result<usize> {
        if self.access == Access::Read {
            return Err(DiffError::Unsupported("creating a partition on a read-only disk".into()));
        }
        if !fs_type.is_formattable() {
            return Err(DiffError::Unsupported(format!("formatting a {fs_type} partition")));
        }
        self.state.lock().add_partition(size_bytes, fs_type)
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Keeps every disk it creates, keyed by path.
#[derive(Default)]
pub struct MemoryDiskProvider {
    disks: Mutex<HashMap<PathBuf, Arc<Mutex<DiskState>>>>,
}

impl MemoryDiskProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a disk laid out by some other tool. Unlike
    /// [`VirtualDisk::create_partition`], any partition type is accepted.
    pub fn create_disk(&self, path: &Path, layout: &[(FsType, u64)]) -> Result<()> {
        let capacity = layout
            .iter()
            .map(|(_, size)| size.div_ceil(SECTOR_SIZE) * SECTOR_SIZE)
            .sum::<u64>()
            + TABLE_SLACK_SECTORS * SECTOR_SIZE;
        let mut state = DiskState::new(DiskFormat::Vhd, capacity, 2 * 1024 * 1024);
        for &(fs_type, size) in layout {
            state.add_partition(size, fs_type)?;
        }
        self.disks
            .lock()
            .insert(path.to_path_buf(), Arc::new(Mutex::new(state)));
        Ok(())
    }

    /// The parent a differencing disk was created from.
    pub fn parent_of(&self, path: &Path) -> Option<PathBuf> {
        let disks = self.disks.lock();
        let state = disks.get(path)?;
        let parent = state.lock().parent.clone();
        parent
    }

    pub fn format_of(&self, path: &Path) -> Option<DiskFormat> {
        let disks = self.disks.lock();
        let state = disks.get(path)?;
        let format = state.lock().format;
        Some(format)
    }

    fn state(&self, path: &Path) -> Result<Arc<Mutex<DiskState>>> {
        self.disks
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| DiffError::InputMissing(path.to_path_buf()))
    }
}

impl DiskProvider for MemoryDiskProvider {
    fn exists(&self, path: &Path) -> bool {
        self.disks.lock().contains_key(path)
    }

    fn open(&self, path: &Path, access: Access) -> Result<Box<dyn VirtualDisk>> {
        let state = self.state(path)?;
        Ok(Box::new(MemoryDisk { state, access }))
    }

    fn create_dynamic(
        &self,
        path: &Path,
        format: DiskFormat,
        capacity: u64,
        block_size: u64,
        overwrite: bool,
    ) -> Result<Box<dyn VirtualDisk>> {
        let mut disks = self.disks.lock();
        if !overwrite && disks.contains_key(path) {
            return Err(DiffError::OutputExists(path.to_path_buf()));
        }
        let state = Arc::new(Mutex::new(DiskState::new(format, capacity, block_size)));
        disks.insert(path.to_path_buf(), state.clone());
        Ok(Box::new(MemoryDisk {
            state,
            access: Access::ReadWrite,
        }))
    }

    fn create_differencing(&self, parent: &Path, path: &Path) -> Result<Box<dyn VirtualDisk>> {
        let parent_state = self.state(parent)?;
        let mut child = parent_state.lock().snapshot();
        child.parent = Some(parent.to_path_buf());

        let mut disks = self.disks.lock();
        if disks.contains_key(path) {
            return Err(DiffError::OutputExists(path.to_path_buf()));
        }
        let state = Arc::new(Mutex::new(child));
        disks.insert(path.to_path_buf(), state.clone());
        Ok(Box::new(MemoryDisk {
            state,
            access: Access::ReadWrite,
        }))
    }

    fn copy_image(&self, from: &Path, to: &Path) -> Result<()> {
        let source = self.state(from)?;
        let copy = source.lock().snapshot();
        let mut disks = self.disks.lock();
        if disks.contains_key(to) {
            return Err(DiffError::OutputExists(to.to_path_buf()));
        }
        disks.insert(to.to_path_buf(), Arc::new(Mutex::new(copy)));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive_paths() {
        let mut fs = MemoryFs::new(FsType::Ntfs);
        fs.create_dir("Windows").unwrap();
        fs.write("Windows/Notepad.EXE", b"x").unwrap();
        assert!(fs.exists("WINDOWS/notepad.exe"));
        let entries = fs.read_dir("windows").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "Notepad.EXE");
    }

    #[test]
    fn test_write_requires_parent() {
        let mut fs = MemoryFs::new(FsType::Fat32);
        assert!(matches!(fs.write("missing/file.txt", b"x"), Err(DiffError::NotFound(_))));
    }

    #[test]
    fn test_usn_advances_on_change() {
        let mut fs = MemoryFs::new(FsType::Ntfs);
        fs.write("a.txt", b"one").unwrap();
        let before = fs.standard_information("a.txt").unwrap().usn;
        fs.write("a.txt", b"two").unwrap();
        let after = fs.standard_information("a.txt").unwrap().usn;
        assert!(after > before);
    }

    #[test]
    fn test_ntfs_extensions_only_on_ntfs() {
        assert!(MemoryFs::new(FsType::Ntfs).ntfs().is_some());
        assert!(MemoryFs::new(FsType::Fat32).ntfs().is_none());
    }

    #[test]
    fn test_list_files_recursive() {
        let mut fs = MemoryFs::new(FsType::Fat32);
        fs.create_dir("a").unwrap();
        fs.create_dir("a/b").unwrap();
        fs.write("a/b/c.txt", b"").unwrap();
        fs.write("root.txt", b"").unwrap();
        assert_eq!(fs.list_files("").unwrap(), vec!["a/b/c.txt", "root.txt"]);
    }

    #[test]
    fn test_copy_image_is_independent() {
        let provider = MemoryDiskProvider::new();
        let a = Path::new("a.vhd");
        let b = Path::new("b.vhd");
        provider.create_disk(a, &[(FsType::Ntfs, 1 << 20)]).unwrap();
        let fs = provider.open(a, Access::ReadWrite).unwrap().open_filesystem(0).unwrap();
        fs.write("f.txt", b"original").unwrap();

        provider.copy_image(a, b).unwrap();
        fs.write("f.txt", b"changed").unwrap();

        let copy = provider.open(b, Access::Read).unwrap().open_filesystem(0).unwrap();
        assert_eq!(copy.read("f.txt").unwrap(), b"original");
        assert_ne!(copy.id(), fs.id());
    }

    #[test]
    fn test_create_partition_rejects_unformattable_type() {
        let provider = MemoryDiskProvider::new();
        let mut disk = provider
            .create_dynamic(Path::new("out.vhd"), DiskFormat::Vhd, 1 << 24, 1 << 19, false)
            .unwrap();
        assert!(matches!(
            disk.create_partition(1 << 20, FsType::LinuxNative),
            Err(DiffError::Unsupported(_))
        ));
        assert_eq!(disk.create_partition(1 << 20, FsType::Fat32).unwrap(), 0);
    }

    #[test]
    fn test_create_dynamic_respects_overwrite() {
        let provider = MemoryDiskProvider::new();
        let path = Path::new("out.vhd");
        provider
            .create_dynamic(path, DiskFormat::Vhdx, 1 << 20, 1 << 19, false)
            .unwrap();
        assert!(matches!(
            provider.create_dynamic(path, DiskFormat::Vhdx, 1 << 20, 1 << 19, false),
            Err(DiffError::OutputExists(_))
        ));
        assert!(provider
            .create_dynamic(path, DiskFormat::Vhdx, 1 << 20, 1 << 19, true)
            .is_ok());
    }
}
