//! Disk images stored as plain host directories.
//!
//! An image is a directory whose partitions are subdirectories named
//! `<index>-<tag>`, e.g. `0-ntfs` or `1-fat32`. The partition directory is
//! the filesystem root. Host files carry no NTFS security or journal data,
//! so [`FileSystem::ntfs`] is always `None` here.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use tracing::debug;
use walkdir::WalkDir;

use super::{
    Access, DirEntry, DiskFormat, DiskProvider, EntryKind, FileMeta, FileSystem, FileTimes, FsHandle, FsType,
    PartitionInfo, VirtualDisk, ATTR_ARCHIVE, ATTR_DIRECTORY, ATTR_READONLY,
};
use crate::error::{DiffError, Result};

const SECTOR_SIZE: u64 = 512;
const DEFAULT_BLOCK_SIZE: u64 = 2 * 1024 * 1024;

/// Memory-map a file for read-only access.
///
/// # Safety
/// The mapping is read-only. Callers must not concurrently truncate or replace
/// the underlying file while the `Mmap` is live.
fn mmap_file(path: &Path) -> Result<Mmap> {
    let file = fs::File::open(path)?;
    // SAFETY: the mapping is copied out before the handle lock is released.
    let map = unsafe { Mmap::map(&file)? };
    Ok(map)
}

fn non_utf8(path: &Path) -> DiffError {
    DiffError::Io(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("non-UTF8 path: {}", path.display()),
    ))
}

/// A filesystem rooted at a host directory.
#[derive(Debug)]
pub struct HostFs {
    root: PathBuf,
    fs_type: FsType,
}

impl HostFs {
    pub fn new(root: impl Into<PathBuf>, fs_type: FsType) -> Self {
        Self {
            root: root.into(),
            fs_type,
        }
    }

    fn full(&self, path: &str) -> PathBuf {
        let path = path.trim_matches('/');
        if path.is_empty() {
            self.root.clone()
        } else {
            self.root.join(path)
        }
    }

    fn relative(&self, full: &Path) -> Result<String> {
        let relative = full.strip_prefix(&self.root).map_err(|_| non_utf8(full))?;
        let relative = relative.to_str().ok_or_else(|| non_utf8(full))?;
        Ok(relative.replace('\\', "/"))
    }
}

impl FileSystem for HostFs {
    fn fs_type(&self) -> FsType {
        self.fs_type
    }

    fn read_dir(&self, dir: &str) -> Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        for entry in WalkDir::new(self.full(dir)).min_depth(1).max_depth(1).sort_by_file_name() {
            let entry = entry.map_err(io::Error::from)?;
            let name = entry.file_name().to_str().ok_or_else(|| non_utf8(entry.path()))?;
            let kind = if entry.file_type().is_dir() {
                EntryKind::Dir
            } else {
                EntryKind::File
            };
            entries.push(DirEntry {
                name: name.to_string(),
                kind,
            });
        }
        Ok(entries)
    }

    fn exists(&self, path: &str) -> bool {
        self.full(path).exists()
    }

    fn is_dir(&self, path: &str) -> bool {
        self.full(path).is_dir()
    }

    fn metadata(&self, path: &str) -> Result<FileMeta> {
        let meta = fs::metadata(self.full(path))?;
        let mut attributes = if meta.is_dir() { ATTR_DIRECTORY } else { ATTR_ARCHIVE };
        if meta.permissions().readonly() {
            attributes |= ATTR_READONLY;
        }
        let modified = meta.modified()?;
        Ok(FileMeta {
            len: if meta.is_dir() { 0 } else { meta.len() },
            attributes,
            times: FileTimes {
                created: meta.created().unwrap_or(modified),
                modified,
                accessed: meta.accessed().unwrap_or(modified),
            },
        })
    }

    fn read(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.full(path);
        if fs::metadata(&full)?.len() == 0 {
            return Ok(Vec::new());
        }
        Ok(mmap_file(&full)?.to_vec())
    }

    fn write(&mut self, path: &str, data: &[u8]) -> Result<()> {
        let full = self.full(path);
        // a read-only target would refuse the truncate
        if let Ok(meta) = fs::metadata(&full) {
            let mut permissions = meta.permissions();
            if permissions.readonly() {
                #[allow(clippy::permissions_set_readonly_false)]
                permissions.set_readonly(false);
                fs::set_permissions(&full, permissions)?;
            }
        }
        fs::write(full, data)?;
        Ok(())
    }

    fn create_dir(&mut self, path: &str) -> Result<()> {
        let full = self.full(path);
        if full.is_dir() {
            return Ok(());
        }
        fs::create_dir(full)?;
        Ok(())
    }

    fn remove_file(&mut self, path: &str) -> Result<()> {
        fs::remove_file(self.full(path))?;
        Ok(())
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        fs::rename(self.full(from), self.full(to))?;
        Ok(())
    }

    fn set_attributes(&mut self, path: &str, attributes: u32) -> Result<()> {
        let full = self.full(path);
        let mut permissions = fs::metadata(&full)?.permissions();
        #[allow(clippy::permissions_set_readonly_false)]
        permissions.set_readonly(attributes & ATTR_READONLY != 0);
        fs::set_permissions(full, permissions)?;
        Ok(())
    }

    fn set_times(&mut self, path: &str, times: &FileTimes) -> Result<()> {
        let full = self.full(path);
        if full.is_dir() {
            // directory handles cannot be opened for writing on every host
            return Ok(());
        }
        let readonly = fs::metadata(&full)?.permissions().readonly();
        if readonly {
            self.set_attributes(path, 0)?;
        }
        let file = fs::OpenOptions::new().write(true).open(&full)?;
        file.set_times(
            fs::FileTimes::new()
                .set_accessed(times.accessed)
                .set_modified(times.modified),
        )?;
        drop(file);
        if readonly {
            self.set_attributes(path, ATTR_READONLY)?;
        }
        Ok(())
    }

    fn list_files(&self, dir: &str) -> Result<Vec<String>> {
        let mut files = Vec::new();
        for entry in WalkDir::new(self.full(dir)).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(io::Error::from)?;
            if entry.file_type().is_file() {
                files.push(self.relative(entry.path())?);
            }
        }
        files.sort();
        Ok(files)
    }
}

fn partition_dir_name(index: usize, fs_type: FsType) -> String {
    format!("{index}-{}", fs_type.tag())
}

fn parse_partition_dir(name: &str) -> Option<(usize, FsType)> {
    let (index, tag) = name.split_once('-')?;
    Some((index.parse().ok()?, FsType::from_tag(tag)?))
}

fn tree_size(root: &Path) -> Result<u64> {
    let mut total = 0;
    for entry in WalkDir::new(root).min_depth(1) {
        let entry = entry.map_err(io::Error::from)?;
        if entry.file_type().is_file() {
            total += entry.metadata().map_err(io::Error::from)?.len().div_ceil(SECTOR_SIZE) * SECTOR_SIZE;
        }
    }
    Ok(total)
}

/// A directory image opened from the host.
pub struct HostDisk {
    root: PathBuf,
    access: Access,
    partitions: Vec<PartitionInfo>,
    handles: Vec<Option<FsHandle>>,
}

impl HostDisk {
    fn load(root: &Path, access: Access) -> Result<Self> {
        let mut found = Vec::new();
        for entry in WalkDir::new(root).min_depth(1).max_depth(1) {
            let entry = entry.map_err(io::Error::from)?;
            if !entry.file_type().is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str() else {
                continue;
            };
            if let Some((index, fs_type)) = parse_partition_dir(name) {
                found.push((index, fs_type, tree_size(entry.path())?));
            }
        }
        found.sort_by_key(|(index, _, _)| *index);

        let mut partitions = Vec::with_capacity(found.len());
        for (position, (index, fs_type, bytes)) in found.into_iter().enumerate() {
            if index != position {
                return Err(DiffError::Io(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("{}: partition {position} is missing", root.display()),
                )));
            }
            partitions.push(PartitionInfo {
                index,
                fs_type,
                sector_count: bytes.div_ceil(SECTOR_SIZE),
                sector_size: SECTOR_SIZE,
            });
        }

        let handles = vec![None; partitions.len()];
        Ok(Self {
            root: root.to_path_buf(),
            access,
            partitions,
            handles,
        })
    }
}

impl VirtualDisk for HostDisk {
    fn partitions(&self) -> Vec<PartitionInfo> {
        self.partitions.clone()
    }

    fn sector_size(&self) -> u64 {
        SECTOR_SIZE
    }

    fn block_size(&self) -> u64 {
        DEFAULT_BLOCK_SIZE
    }

    fn open_filesystem(&mut self, index: usize) -> Result<FsHandle> {
        let count = self.partitions.len();
        let info = *self
            .partitions
            .get(index)
            .ok_or(DiffError::PartitionOutOfRange { index, count })?;
        let root = self.root.join(partition_dir_name(index, info.fs_type));
        let handle = self.handles[index].get_or_insert_with(|| FsHandle::new(HostFs::new(root, info.fs_type)));
        Ok(handle.clone())
    }

    fn create_partition(&mut self, size_bytes: u64, fs_type: FsType) -> Result<usize> {
        if self.access == Access::Read {
            return Err(DiffError::Unsupported("creating a partition on a read-only disk".into()));
        }
        if !fs_type.is_formattable() {
            return Err(DiffError::Unsupported(format!("formatting a {fs_type} partition")));
        }
        let index = self.partitions.len();
        fs::create_dir(self.root.join(partition_dir_name(index, fs_type)))?;
        self.partitions.push(PartitionInfo {
            index,
            fs_type,
            sector_count: size_bytes.div_ceil(SECTOR_SIZE),
            sector_size: SECTOR_SIZE,
        });
        self.handles.push(None);
        Ok(index)
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Opens and creates directory images on the host filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostDiskProvider;

impl HostDiskProvider {
    pub fn new() -> Self {
        Self
    }
}

impl DiskProvider for HostDiskProvider {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn open(&self, path: &Path, access: Access) -> Result<Box<dyn VirtualDisk>> {
        if !path.exists() {
            return Err(DiffError::InputMissing(path.to_path_buf()));
        }
        if !path.is_dir() {
            return Err(DiffError::Unsupported(format!(
                "{} is not a directory image",
                path.display()
            )));
        }
        Ok(Box::new(HostDisk::load(path, access)?))
    }

    fn create_dynamic(
        &self,
        path: &Path,
        format: DiskFormat,
        capacity: u64,
        block_size: u64,
        overwrite: bool,
    ) -> Result<Box<dyn VirtualDisk>> {
        if path.exists() {
            if !overwrite {
                return Err(DiffError::OutputExists(path.to_path_buf()));
            }
            fs::remove_dir_all(path)?;
        }
        fs::create_dir_all(path)?;
        debug!(path = %path.display(), ?format, capacity, block_size, "created directory image");
        Ok(Box::new(HostDisk::load(path, Access::ReadWrite)?))
    }

    fn create_differencing(&self, _parent: &Path, _path: &Path) -> Result<Box<dyn VirtualDisk>> {
        Err(DiffError::Unsupported(
            "directory images cannot be chained as differencing disks".into(),
        ))
    }

    fn copy_image(&self, from: &Path, to: &Path) -> Result<()> {
        if !from.is_dir() {
            return Err(DiffError::InputMissing(from.to_path_buf()));
        }
        if to.exists() {
            return Err(DiffError::OutputExists(to.to_path_buf()));
        }
        for entry in WalkDir::new(from) {
            let entry = entry.map_err(io::Error::from)?;
            let relative = entry.path().strip_prefix(from).map_err(|_| non_utf8(entry.path()))?;
            let target = to.join(relative);
            if entry.file_type().is_dir() {
                fs::create_dir_all(&target)?;
            } else {
                fs::copy(entry.path(), &target)?;
                if let Ok(modified) = entry.metadata().map_err(io::Error::from).and_then(|m| m.modified()) {
                    let file = fs::OpenOptions::new().write(true).open(&target)?;
                    file.set_times(fs::FileTimes::new().set_modified(modified))?;
                }
            }
        }
        Ok(())
    }
}
