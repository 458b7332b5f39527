#![forbid(unsafe_code)]
//! File I/O layer for the cache directory.
//!
//! Every cache file (index, `data_N` block files, `f_XXXXXX` external
//! files) is accessed through the [`ByteFile`] trait with positioned
//! `pread`/`pwrite` semantics, so no shared seek position exists and the
//! cache thread can keep handles open for the life of the backend.
//!
//! [`Storage`] names the directory that holds those files. [`DirStorage`]
//! is the real thing; [`MemStorage`] keeps files in memory and can inject
//! read or write failures, which the backend tests use to drive the
//! I/O-error and crash-recovery paths.

use dc_error::{DcError, Result};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Name of block file `data_<n>`.
#[must_use]
pub fn block_file_name(file_number: u32) -> String {
    format!("data_{file_number}")
}

/// Name of external file `f_<n>` (six lowercase hex digits).
#[must_use]
pub fn external_file_name(file_number: u32) -> String {
    format!("f_{file_number:06x}")
}

/// Files that belong to a cache directory and are removed on restart.
#[must_use]
pub fn is_cache_file_name(name: &str) -> bool {
    name == dc_types::INDEX_FILE_NAME
        || name
            .strip_prefix("data_")
            .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
        || name
            .strip_prefix("f_")
            .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_hexdigit()))
}

fn range_end(offset: u64, len: usize) -> Result<u64> {
    let len = u64::try_from(len).map_err(|_| DcError::Format("length overflows u64".to_owned()))?;
    offset
        .checked_add(len)
        .ok_or_else(|| DcError::Format("range overflows u64".to_owned()))
}

/// Byte-addressed file for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteFile: Send + Sync + fmt::Debug {
    /// Current length in bytes.
    fn len_bytes(&self) -> Result<u64>;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` at `offset`, extending the file if needed.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Grow or shrink the file to `len` bytes. New bytes read as zero.
    fn set_len(&self, len: u64) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// Directory holding the cache files.
pub trait Storage: Send + Sync + fmt::Debug {
    /// Open an existing file.
    fn open(&self, name: &str) -> Result<Arc<dyn ByteFile>>;

    /// Create (or truncate) a file.
    fn create(&self, name: &str) -> Result<Arc<dyn ByteFile>>;

    /// Remove a file. Removing a missing file is not an error.
    fn remove(&self, name: &str) -> Result<()>;

    fn exists(&self, name: &str) -> bool;

    /// Names of all files in the directory.
    fn list(&self) -> Result<Vec<String>>;
}

/// Running I/O counters shared by every file of a storage.
#[derive(Debug, Default)]
pub struct IoCounters {
    reads: AtomicU64,
    writes: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct IoStats {
    pub reads: u64,
    pub writes: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

impl IoCounters {
    fn on_read(&self, len: usize) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(len as u64, Ordering::Relaxed);
    }

    fn on_write(&self, len: usize) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(len as u64, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> IoStats {
        IoStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }
}

// ── Real files ──────────────────────────────────────────────────────────────

/// File-backed [`ByteFile`] using `std::os::unix::fs::FileExt`.
#[derive(Debug)]
pub struct CacheFile {
    file: File,
    counters: Arc<IoCounters>,
}

impl ByteFile for CacheFile {
    fn len_bytes(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        range_end(offset, buf.len())?;
        self.file.read_exact_at(buf, offset)?;
        self.counters.on_read(buf.len());
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        range_end(offset, buf.len())?;
        self.file.write_all_at(buf, offset)?;
        self.counters.on_write(buf.len());
        Ok(())
    }

    fn set_len(&self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

/// Cache directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct DirStorage {
    root: PathBuf,
    counters: Arc<IoCounters>,
}

impl DirStorage {
    /// Use `root` as the cache directory, creating it when missing.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        debug!(path = %root.display(), "cache directory ready");
        Ok(Self {
            root,
            counters: Arc::new(IoCounters::default()),
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn io_stats(&self) -> IoStats {
        self.counters.snapshot()
    }
}

impl Storage for DirStorage {
    fn open(&self, name: &str) -> Result<Arc<dyn ByteFile>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.root.join(name))?;
        Ok(Arc::new(CacheFile {
            file,
            counters: Arc::clone(&self.counters),
        }))
    }

    fn create(&self, name: &str) -> Result<Arc<dyn ByteFile>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.root.join(name))?;
        trace!(name, "created cache file");
        Ok(Arc::new(CacheFile {
            file,
            counters: Arc::clone(&self.counters),
        }))
    }

    fn remove(&self, name: &str) -> Result<()> {
        match fs::remove_file(self.root.join(name)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn exists(&self, name: &str) -> bool {
        self.root.join(name).is_file()
    }

    fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_owned());
            }
        }
        names.sort();
        Ok(names)
    }
}

// ── In-memory files ─────────────────────────────────────────────────────────

/// Failure switches shared by all files of a [`MemStorage`].
#[derive(Debug, Default)]
struct Faults {
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

/// In-memory [`ByteFile`].
#[derive(Debug)]
pub struct MemByteFile {
    bytes: Mutex<Vec<u8>>,
    faults: Arc<Faults>,
    counters: Arc<IoCounters>,
}

impl MemByteFile {
    fn injected(op: &str) -> DcError {
        DcError::Io(io::Error::other(format!("injected {op} failure")))
    }
}

impl ByteFile for MemByteFile {
    fn len_bytes(&self) -> Result<u64> {
        Ok(self.bytes.lock().len() as u64)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if self.faults.fail_reads.load(Ordering::Relaxed) {
            return Err(Self::injected("read"));
        }
        let end = range_end(offset, buf.len())?;
        let bytes = self.bytes.lock();
        if end > bytes.len() as u64 {
            return Err(DcError::Io(io::Error::from(io::ErrorKind::UnexpectedEof)));
        }
        buf.copy_from_slice(&bytes[offset as usize..end as usize]);
        drop(bytes);
        self.counters.on_read(buf.len());
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if self.faults.fail_writes.load(Ordering::Relaxed) {
            return Err(Self::injected("write"));
        }
        let end = usize::try_from(range_end(offset, buf.len())?)
            .map_err(|_| DcError::Format("range overflows usize".to_owned()))?;
        let mut bytes = self.bytes.lock();
        if end > bytes.len() {
            bytes.resize(end, 0);
        }
        bytes[end - buf.len()..end].copy_from_slice(buf);
        drop(bytes);
        self.counters.on_write(buf.len());
        Ok(())
    }

    fn set_len(&self, len: u64) -> Result<()> {
        if self.faults.fail_writes.load(Ordering::Relaxed) {
            return Err(Self::injected("truncate"));
        }
        let len = usize::try_from(len).map_err(|_| DcError::Format("length overflows usize".to_owned()))?;
        self.bytes.lock().resize(len, 0);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// In-memory cache directory with failure injection.
#[derive(Debug, Clone, Default)]
pub struct MemStorage {
    files: Arc<Mutex<BTreeMap<String, Arc<MemByteFile>>>>,
    faults: Arc<Faults>,
    counters: Arc<IoCounters>,
}

impl MemStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent read fail (or succeed again).
    pub fn fail_reads(&self, fail: bool) {
        self.faults.fail_reads.store(fail, Ordering::Relaxed);
    }

    /// Make every subsequent write fail (or succeed again).
    pub fn fail_writes(&self, fail: bool) {
        self.faults.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Independent copy of the current file contents, as a crash would leave
    /// them on disk.
    #[must_use]
    pub fn snapshot(&self) -> Self {
        let copy = Self::new();
        {
            let files = self.files.lock();
            let mut target = copy.files.lock();
            for (name, file) in files.iter() {
                let bytes = file.bytes.lock().clone();
                target.insert(name.clone(), copy.new_file(bytes));
            }
        }
        copy
    }

    /// Raw contents of a file, for assertions.
    #[must_use]
    pub fn contents(&self, name: &str) -> Option<Vec<u8>> {
        self.files.lock().get(name).map(|f| f.bytes.lock().clone())
    }

    /// Overwrite part of a file, bypassing failure injection.
    pub fn poke(&self, name: &str, offset: usize, data: &[u8]) -> bool {
        let files = self.files.lock();
        let Some(file) = files.get(name) else {
            return false;
        };
        let mut bytes = file.bytes.lock();
        let Some(slot) = bytes.get_mut(offset..offset + data.len()) else {
            return false;
        };
        slot.copy_from_slice(data);
        true
    }

    #[must_use]
    pub fn io_stats(&self) -> IoStats {
        self.counters.snapshot()
    }

    fn new_file(&self, bytes: Vec<u8>) -> Arc<MemByteFile> {
        Arc::new(MemByteFile {
            bytes: Mutex::new(bytes),
            faults: Arc::clone(&self.faults),
            counters: Arc::clone(&self.counters),
        })
    }
}

impl Storage for MemStorage {
    fn open(&self, name: &str) -> Result<Arc<dyn ByteFile>> {
        let files = self.files.lock();
        let file = files
            .get(name)
            .cloned()
            .ok_or_else(|| DcError::Io(io::Error::from(io::ErrorKind::NotFound)))?;
        Ok(file)
    }

    fn create(&self, name: &str) -> Result<Arc<dyn ByteFile>> {
        if self.faults.fail_writes.load(Ordering::Relaxed) {
            return Err(MemByteFile::injected("create"));
        }
        let file = self.new_file(Vec::new());
        self.files.lock().insert(name.to_owned(), Arc::clone(&file));
        Ok(file)
    }

    fn remove(&self, name: &str) -> Result<()> {
        self.files.lock().remove(name);
        Ok(())
    }

    fn exists(&self, name: &str) -> bool {
        self.files.lock().contains_key(name)
    }

    fn list(&self) -> Result<Vec<String>> {
        Ok(self.files.lock().keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_names_follow_directory_layout() {
        assert_eq!(block_file_name(0), "data_0");
        assert_eq!(block_file_name(17), "data_17");
        assert_eq!(external_file_name(0x1a), "f_00001a");
        assert!(is_cache_file_name("index"));
        assert!(is_cache_file_name("data_3"));
        assert!(is_cache_file_name("f_00001a"));
        assert!(!is_cache_file_name("data_"));
        assert!(!is_cache_file_name("notes.txt"));
        assert!(!is_cache_file_name("f_xyz"));
    }

    #[test]
    fn mem_file_extends_on_write_and_reads_back() {
        let storage = MemStorage::new();
        let file = storage.create("data_1").expect("create");
        file.write_all_at(10, b"abc").expect("write");
        assert_eq!(file.len_bytes().expect("len"), 13);
        let mut buf = [0_u8; 5];
        file.read_exact_at(8, &mut buf).expect("read");
        assert_eq!(&buf, b"\0\0abc");
        assert!(file.read_exact_at(12, &mut buf).is_err());
        file.set_len(4).expect("truncate");
        assert_eq!(file.len_bytes().expect("len"), 4);
    }

    #[test]
    fn injected_failures_surface_as_io_errors() {
        let storage = MemStorage::new();
        let file = storage.create("index").expect("create");
        file.write_all_at(0, &[1, 2, 3]).expect("write");
        storage.fail_writes(true);
        let err = file.write_all_at(0, &[9]).expect_err("write fails");
        assert!(err.is_storage_failure());
        storage.fail_writes(false);
        storage.fail_reads(true);
        let mut buf = [0_u8; 3];
        assert!(file.read_exact_at(0, &mut buf).is_err());
        storage.fail_reads(false);
        file.read_exact_at(0, &mut buf).expect("read");
        assert_eq!(buf, [1, 2, 3]);
    }

    #[test]
    fn snapshot_is_independent() {
        let storage = MemStorage::new();
        let file = storage.create("data_0").expect("create");
        file.write_all_at(0, b"before").expect("write");
        let copy = storage.snapshot();
        file.write_all_at(0, b"after!").expect("write");
        assert_eq!(copy.contents("data_0").as_deref(), Some(&b"before"[..]));
        assert!(copy.poke("data_0", 0, b"B"));
        assert_eq!(copy.contents("data_0").as_deref(), Some(&b"Before"[..]));
        assert_eq!(storage.list().expect("list"), vec!["data_0".to_owned()]);
    }

    #[test]
    fn dir_storage_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = DirStorage::open(dir.path().join("cache")).expect("storage");
        let file = storage.create("f_000001").expect("create");
        file.write_all_at(4, b"data").expect("write");
        file.sync().expect("sync");
        drop(file);

        let file = storage.open("f_000001").expect("reopen");
        let mut buf = [0_u8; 4];
        file.read_exact_at(4, &mut buf).expect("read");
        assert_eq!(&buf, b"data");
        assert!(storage.exists("f_000001"));
        assert_eq!(storage.list().expect("list"), vec!["f_000001".to_owned()]);
        storage.remove("f_000001").expect("remove");
        storage.remove("f_000001").expect("remove missing");
        assert!(!storage.exists("f_000001"));
        assert!(storage.open("missing").is_err());
        let stats = storage.io_stats();
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.bytes_read, 4);
    }
}
