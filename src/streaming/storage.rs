//! Bulk storage backends and the shared open-file registry
//!
//! Bulk data is either stored as loose files (one per data kind and file
//! id) or packed into a single archive with a table of contents. Both sit
//! behind `BulkStorage`, and the content-addressed cache (see `cache`) is
//! the alternative backend. Exactly one backend is resolved per session.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::core::Result;
use crate::streaming::cache::{CacheKey, ContentCache};

/// Category of bulk-data file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataKind {
    /// Generation engine data (compiled graph constants)
    Model = 0,
    RealTimeMorph = 1,
    Clothing = 2,
}

impl DataKind {
    fn prefix(self) -> &'static str {
        match self {
            DataKind::Model => "model",
            DataKind::RealTimeMorph => "morph",
            DataKind::Clothing => "cloth",
        }
    }

    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(DataKind::Model),
            1 => Some(DataKind::RealTimeMorph),
            2 => Some(DataKind::Clothing),
            _ => None,
        }
    }
}

/// An open bulk-data file
pub trait StorageFile: Send + Sync {
    /// Read exactly `dest.len()` bytes starting at `offset`
    fn read_at(&self, offset: u64, dest: &mut [u8]) -> io::Result<()>;
}

/// Source of bulk-data files
pub trait BulkStorage: Send + Sync {
    fn open(&self, kind: DataKind, file_id: u32) -> io::Result<Arc<dyn StorageFile>>;
}

/// File handle that seeks within an optional sub-range of the OS file
struct RangedFile {
    file: Mutex<File>,
    base: u64,
    len: u64,
}

impl StorageFile for RangedFile {
    fn read_at(&self, offset: u64, dest: &mut [u8]) -> io::Result<()> {
        let end = offset.checked_add(dest.len() as u64);
        if end.map_or(true, |end| end > self.len) {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("read of {} bytes at {} past end of file ({})", dest.len(), offset, self.len),
            ));
        }

        let start = self.base.checked_add(offset).ok_or_else(|| invalid_data("read offset overflows"))?;
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(dest)
    }
}

fn invalid_data(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Get the file path for a loose bulk-data file
pub fn bulk_file_path(root: &Path, kind: DataKind, file_id: u32) -> PathBuf {
    root.join(format!("{}_{:04}.bulk", kind.prefix(), file_id))
}

/// Loose files under a root directory
pub struct LooseFileStorage {
    root: PathBuf,
}

impl LooseFileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write one bulk file (build-side helper)
    pub fn write_file(&self, kind: DataKind, file_id: u32, bytes: &[u8]) -> io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::write(bulk_file_path(&self.root, kind, file_id), bytes)
    }
}

impl BulkStorage for LooseFileStorage {
    fn open(&self, kind: DataKind, file_id: u32) -> io::Result<Arc<dyn StorageFile>> {
        let file = File::open(bulk_file_path(&self.root, kind, file_id))?;
        let len = file.metadata()?.len();
        Ok(Arc::new(RangedFile { file: Mutex::new(file), base: 0, len }))
    }
}

const ARCHIVE_MAGIC: &[u8; 4] = b"PGBA";
const ARCHIVE_ENTRY_SIZE: usize = 1 + 4 + 8 + 8;

#[derive(Debug, Clone, Copy)]
struct ArchiveEntry {
    offset: u64,
    len: u64,
}

/// All bulk files packed into one archive.
///
/// Layout: magic, entry count (u32), entries of
/// `kind: u8 | file_id: u32 | offset: u64 | len: u64`, then payloads.
/// Integers are little-endian.
pub struct PackagedArchiveStorage {
    path: PathBuf,
    entries: HashMap<(DataKind, u32), ArchiveEntry>,
}

impl PackagedArchiveStorage {
    /// Open an archive and read its table of contents.
    ///
    /// # Arguments
    /// * `path` - Archive written by `write_archive`
    ///
    /// # Returns
    /// The archive, or `InvalidData` when the header or any table entry
    /// does not fit inside the file.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let mut file = File::open(&path)?;
        let file_len = file.metadata()?.len();

        let mut header = [0u8; 8];
        file.read_exact(&mut header)?;
        if &header[0..4] != ARCHIVE_MAGIC {
            return Err(invalid_data("not a bulk archive"));
        }
        let count = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;

        // The table must fit in the file before anything is allocated for it
        let toc_len = count
            .checked_mul(ARCHIVE_ENTRY_SIZE)
            .filter(|&len| len as u64 <= file_len.saturating_sub(header.len() as u64))
            .ok_or_else(|| invalid_data(format!("archive table of {} entries exceeds the file", count)))?;

        let mut toc = vec![0u8; toc_len];
        file.read_exact(&mut toc)?;

        let mut entries = HashMap::with_capacity(count);
        for record in toc.chunks_exact(ARCHIVE_ENTRY_SIZE) {
            let kind = DataKind::from_u8(record[0]).ok_or_else(|| invalid_data("unknown data kind"))?;
            let file_id = u32::from_le_bytes([record[1], record[2], record[3], record[4]]);
            let offset = u64::from_le_bytes(record[5..13].try_into().unwrap_or_default());
            let len = u64::from_le_bytes(record[13..21].try_into().unwrap_or_default());
            if offset.checked_add(len).is_none_or(|end| end > file_len) {
                return Err(invalid_data(format!(
                    "{:?} file {} ({} bytes at {}) lies outside the archive",
                    kind, file_id, len, offset
                )));
            }
            entries.insert((kind, file_id), ArchiveEntry { offset, len });
        }

        Ok(Self { path, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_count(&self) -> usize {
        self.entries.len()
    }

    /// Write an archive containing `files` (build-side helper)
    pub fn write_archive(path: &Path, files: &[(DataKind, u32, Vec<u8>)]) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let header_len = 8 + files.len() * ARCHIVE_ENTRY_SIZE;
        let mut out = Vec::with_capacity(header_len + files.iter().map(|f| f.2.len()).sum::<usize>());
        out.extend_from_slice(ARCHIVE_MAGIC);
        out.extend_from_slice(&(files.len() as u32).to_le_bytes());

        let mut offset = header_len as u64;
        for (kind, file_id, bytes) in files {
            out.push(*kind as u8);
            out.extend_from_slice(&file_id.to_le_bytes());
            out.extend_from_slice(&offset.to_le_bytes());
            out.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
            offset += bytes.len() as u64;
        }
        for (_, _, bytes) in files {
            out.extend_from_slice(bytes);
        }

        let mut file = File::create(path)?;
        file.write_all(&out)?;
        file.sync_all()
    }
}

impl BulkStorage for PackagedArchiveStorage {
    fn open(&self, kind: DataKind, file_id: u32) -> io::Result<Arc<dyn StorageFile>> {
        let entry = self.entries.get(&(kind, file_id)).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("{:?} file {} not in archive", kind, file_id))
        })?;
        let file = File::open(&self.path)?;
        Ok(Arc::new(RangedFile { file: Mutex::new(file), base: entry.offset, len: entry.len }))
    }
}

/// Reference-counted open handles shared by concurrent transfers.
///
/// A handle stays open while any pending read holds it and is closed when
/// the last one drops.
pub struct OpenFileRegistry {
    storage: Arc<dyn BulkStorage>,
    open: Mutex<HashMap<(DataKind, u32), Weak<dyn StorageFile>>>,
}

impl OpenFileRegistry {
    pub fn new(storage: Arc<dyn BulkStorage>) -> Self {
        Self { storage, open: Mutex::new(HashMap::new()) }
    }

    /// Get the shared handle for a file, opening it if nobody holds it
    pub fn acquire(&self, kind: DataKind, file_id: u32) -> io::Result<Arc<dyn StorageFile>> {
        let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(file) = open.get(&(kind, file_id)).and_then(Weak::upgrade) {
            return Ok(file);
        }

        let file = self.storage.open(kind, file_id)?;
        open.insert((kind, file_id), Arc::downgrade(&file));
        log::trace!("Opened {:?} bulk file {}", kind, file_id);
        Ok(file)
    }

    /// Number of handles currently held open
    pub fn open_count(&self) -> usize {
        let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        open.retain(|_, file| file.strong_count() > 0);
        open.len()
    }
}

/// Where a resource's bulk data lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageLocation {
    /// Stored inline in the packaged archive
    Inline(PathBuf),
    /// Stored externally as loose files
    External(PathBuf),
    /// Stored in the content-addressed cache under a key
    Cache(CacheKey),
}

/// Backend resolved once per streaming session
#[derive(Clone)]
pub enum StorageBackend {
    Bulk(Arc<OpenFileRegistry>),
    Cache { cache: Arc<dyn ContentCache>, key: CacheKey },
}

impl StorageBackend {
    pub fn bulk(storage: Arc<dyn BulkStorage>) -> Self {
        StorageBackend::Bulk(Arc::new(OpenFileRegistry::new(storage)))
    }

    pub fn cache(cache: Arc<dyn ContentCache>, key: CacheKey) -> Self {
        StorageBackend::Cache { cache, key }
    }

    /// Resolve a storage location to its backend
    pub fn resolve(location: &StorageLocation, cache: Option<Arc<dyn ContentCache>>) -> Result<Self> {
        match location {
            StorageLocation::Inline(archive) => {
                Ok(Self::bulk(Arc::new(PackagedArchiveStorage::open(archive.clone())?)))
            }
            StorageLocation::External(root) => Ok(Self::bulk(Arc::new(LooseFileStorage::new(root.clone())))),
            StorageLocation::Cache(key) => match cache {
                Some(cache) => Ok(Self::cache(cache, *key)),
                None => Err(crate::core::Error::InvalidRequest(
                    "cache location without a content cache".to_string(),
                )),
            },
        }
    }

    pub fn is_cache(&self) -> bool {
        matches!(self, StorageBackend::Cache { .. })
    }
}

impl std::fmt::Debug for StorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageBackend::Bulk(_) => f.write_str("StorageBackend::Bulk"),
            StorageBackend::Cache { key, .. } => write!(f, "StorageBackend::Cache({:?})", key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bulk_file_path() {
        let path = bulk_file_path(Path::new("/tmp/bulk"), DataKind::Clothing, 12);
        assert_eq!(path, PathBuf::from("/tmp/bulk/cloth_0012.bulk"));
    }

    #[test]
    fn test_loose_read_at() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LooseFileStorage::new(dir.path());
        storage.write_file(DataKind::Model, 0, &(0u8..64).collect::<Vec<_>>()).unwrap();

        let file = storage.open(DataKind::Model, 0).unwrap();
        let mut dest = [0u8; 4];
        file.read_at(10, &mut dest).unwrap();
        assert_eq!(dest, [10, 11, 12, 13]);
    }

    #[test]
    fn test_read_past_end_fails() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LooseFileStorage::new(dir.path());
        storage.write_file(DataKind::Model, 0, &[1, 2, 3]).unwrap();

        let file = storage.open(DataKind::Model, 0).unwrap();
        let mut dest = [0u8; 4];
        let err = file.read_at(0, &mut dest).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_archive_entries_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("content.pgba");
        PackagedArchiveStorage::write_archive(
            &path,
            &[
                (DataKind::Model, 0, vec![1; 8]),
                (DataKind::RealTimeMorph, 0, vec![2; 8]),
            ],
        )
        .unwrap();

        let archive = PackagedArchiveStorage::open(&path).unwrap();
        assert_eq!(archive.file_count(), 2);

        let morph = archive.open(DataKind::RealTimeMorph, 0).unwrap();
        let mut dest = [0u8; 8];
        morph.read_at(0, &mut dest).unwrap();
        assert_eq!(dest, [2; 8]);

        // Reading past the entry must not leak into the neighbouring file
        let model = archive.open(DataKind::Model, 0).unwrap();
        let mut long = [0u8; 9];
        assert!(model.read_at(0, &mut long).is_err());

        assert!(archive.open(DataKind::Clothing, 0).is_err());
    }

    #[test]
    fn test_archive_rejects_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.pgba");
        std::fs::write(&path, b"NOPE\0\0\0\0").unwrap();
        assert!(PackagedArchiveStorage::open(&path).is_err());
    }

    #[test]
    fn test_archive_rejects_oversized_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("huge.pgba");
        let mut bytes = ARCHIVE_MAGIC.to_vec();
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        std::fs::write(&path, &bytes).unwrap();

        let err = PackagedArchiveStorage::open(&path).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_archive_rejects_entry_outside_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crafted.pgba");
        let mut bytes = ARCHIVE_MAGIC.to_vec();
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.push(DataKind::Model as u8);
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&u64::MAX.to_le_bytes());
        bytes.extend_from_slice(&16u64.to_le_bytes());
        std::fs::write(&path, &bytes).unwrap();

        let err = PackagedArchiveStorage::open(&path).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_registry_shares_and_releases_handles() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LooseFileStorage::new(dir.path());
        storage.write_file(DataKind::Model, 1, &[0; 16]).unwrap();
        let registry = OpenFileRegistry::new(Arc::new(storage));

        let a = registry.acquire(DataKind::Model, 1).unwrap();
        let b = registry.acquire(DataKind::Model, 1).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.open_count(), 1);

        drop(a);
        assert_eq!(registry.open_count(), 1);
        drop(b);
        assert_eq!(registry.open_count(), 0);
    }

    #[test]
    fn test_resolve_locations() {
        let dir = tempfile::tempdir().unwrap();
        let external = StorageBackend::resolve(&StorageLocation::External(dir.path().to_path_buf()), None).unwrap();
        assert!(!external.is_cache());

        let missing_cache = StorageBackend::resolve(&StorageLocation::Cache(CacheKey(1)), None);
        assert!(missing_cache.is_err());
    }
}
