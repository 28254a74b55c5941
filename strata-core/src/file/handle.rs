//! OS handle and mode switching shared by both file layouts

use crate::cache::{Decoded, FileCache};
use crate::codec::Header;
use crate::config::HEADER_SIZE;
use crate::{Result, Sample, StoreError};
use parking_lot::{Mutex, MutexGuard};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Open mode of a file unit. Readable and writable are mutually exclusive.
#[derive(Debug)]
pub(crate) enum Mode {
    Closed,
    Readable(File),
    Writable(File),
}

/// Everything behind the per-file mutex
#[derive(Debug)]
pub(crate) struct FileState {
    mode: Mode,
    /// Cached file length in bytes
    pub length: u64,
    /// Last written timestamp (flexible layout only)
    pub last_timestamp: Option<i64>,
}

/// Path, header, handle and cache view of one sample file.
///
/// Every mode transition closes the previous handle and invalidates the
/// cache entry in the same step.
#[derive(Debug)]
pub(crate) struct FileCore {
    path: PathBuf,
    header: Header,
    cache: FileCache,
    state: Mutex<FileState>,
}

impl FileCore {
    /// Create a new file and write its header; the unit starts writable
    pub fn create(path: PathBuf, header: Header, cache: FileCache) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.write_all(&header.to_bytes())?;
        cache.invalidate();
        Ok(Self {
            path,
            header,
            cache,
            state: Mutex::new(FileState {
                mode: Mode::Writable(file),
                length: HEADER_SIZE,
                last_timestamp: None,
            }),
        })
    }

    /// Open an existing file by reading its header; the unit starts closed
    pub fn open(path: PathBuf, cache: FileCache) -> Result<Self> {
        let mut file = File::open(&path)?;
        let length = file.metadata()?.len();
        if length < HEADER_SIZE {
            return Err(StoreError::Corruption(format!(
                "{} is shorter than a header",
                path.display()
            )));
        }
        let mut buf = [0u8; Header::SIZE];
        file.read_exact(&mut buf)?;
        let header = Header::from_bytes(&buf)?;
        Ok(Self {
            path,
            header,
            cache,
            state: Mutex::new(FileState {
                mode: Mode::Closed,
                length,
                last_timestamp: None,
            }),
        })
    }

    /// Replace the header as it was read, e.g. to re-align the start
    pub fn with_header(mut self, header: Header) -> Self {
        self.header = header;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn cache(&self) -> &FileCache {
        &self.cache
    }

    /// Enter the per-file critical section
    pub fn lock(&self) -> MutexGuard<'_, FileState> {
        self.state.lock()
    }

    fn writable<'a>(&self, state: &'a mut FileState) -> Result<&'a mut File> {
        if !matches!(state.mode, Mode::Writable(_)) {
            state.mode = Mode::Closed;
            self.cache.invalidate();
            let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
            state.length = file.metadata()?.len();
            state.mode = Mode::Writable(file);
        }
        match &mut state.mode {
            Mode::Writable(file) => Ok(file),
            _ => Err(StoreError::Internal("file not writable".into())),
        }
    }

    fn readable<'a>(&self, state: &'a mut FileState) -> Result<&'a mut File> {
        if !matches!(state.mode, Mode::Readable(_)) {
            state.mode = Mode::Closed;
            self.cache.invalidate();
            let file = File::open(&self.path)?;
            state.mode = Mode::Readable(file);
        }
        match &mut state.mode {
            Mode::Readable(file) => Ok(file),
            _ => Err(StoreError::Internal("file not readable".into())),
        }
    }

    /// Write `bytes` at `offset` and invalidate the cache entry
    pub fn write_at(&self, state: &mut FileState, offset: u64, bytes: &[u8]) -> Result<()> {
        let file = self.writable(state)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(bytes)?;
        state.length = state.length.max(offset + bytes.len() as u64);
        self.cache.invalidate();
        Ok(())
    }

    /// Cut the file to `length` bytes
    pub fn truncate(&self, state: &mut FileState, length: u64) -> Result<()> {
        let file = self.writable(state)?;
        file.set_len(length)?;
        state.length = length;
        self.cache.invalidate();
        Ok(())
    }

    /// Read up to `len` bytes at `offset`; short at end of file
    pub fn read_at(&self, state: &mut FileState, offset: u64, len: usize) -> Result<Vec<u8>> {
        let file = self.readable(state)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::with_capacity(len);
        file.take(len as u64).read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// All bytes after the header, up to the cached length
    pub fn read_body(&self, state: &mut FileState) -> Result<Vec<u8>> {
        let len = state.length.saturating_sub(HEADER_SIZE) as usize;
        self.read_at(state, HEADER_SIZE, len)
    }

    /// Cached decode, or decode the body and cache it.
    /// Runs inside the critical section so no write can slip in between.
    pub fn decoded(
        &self,
        state: &mut FileState,
        decode: impl FnOnce(&[u8]) -> Vec<Sample>,
    ) -> Result<Decoded> {
        if let Some(samples) = self.cache.get() {
            return Ok(samples);
        }
        let body = self.read_body(state)?;
        let samples: Decoded = decode(&body).into();
        self.cache.put(samples.clone());
        Ok(samples)
    }

    /// Push written bytes to the OS and drop the decode
    pub fn flush(&self, state: &mut FileState) -> Result<()> {
        if let Mode::Writable(file) = &mut state.mode {
            file.flush()?;
        }
        self.cache.invalidate();
        Ok(())
    }

    /// Release the OS handle
    pub fn close(&self, state: &mut FileState) -> Result<()> {
        self.flush(state)?;
        state.mode = Mode::Closed;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheKey, DecodeCache, LruDecodeCache};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn file_cache(shared: &Arc<LruDecodeCache>) -> FileCache {
        let backing: Arc<dyn DecodeCache> = shared.clone();
        FileCache::new(CacheKey::new("l", "c0.slots"), backing)
    }

    #[test]
    fn test_create_and_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("c0.slots");
        let shared = Arc::new(LruDecodeCache::new(100));

        let core = FileCore::create(path.clone(), Header::new(0, 10), file_cache(&shared)).unwrap();
        {
            let mut state = core.lock();
            assert!(matches!(state.mode, Mode::Writable(_)));
            core.write_at(&mut state, 16, &[1, 2, 3]).unwrap();
            assert_eq!(state.length, 19);
            core.close(&mut state).unwrap();
            assert!(matches!(state.mode, Mode::Closed));
        }

        let reopened = FileCore::open(path, file_cache(&shared)).unwrap();
        assert_eq!(reopened.header(), &Header::new(0, 10));
        let mut state = reopened.lock();
        assert_eq!(state.length, 19);
        assert_eq!(reopened.read_body(&mut state).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_open_rejects_short_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("c0.slots");
        std::fs::write(&path, [0u8; 10]).unwrap();
        let shared = Arc::new(LruDecodeCache::new(100));
        let err = FileCore::open(path, file_cache(&shared)).unwrap_err();
        assert!(matches!(err, StoreError::Corruption(_)));
    }

    #[test]
    fn test_mode_switch_invalidates() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("c0.slots");
        let shared = Arc::new(LruDecodeCache::new(100));
        let core = FileCore::create(path, Header::new(0, 10), file_cache(&shared)).unwrap();

        let mut state = core.lock();
        let decoded = core
            .decoded(&mut state, |_| vec![Sample::good(0, 1.0)])
            .unwrap();
        assert_eq!(decoded.len(), 1);
        assert!(core.cache().get().is_some());

        // switching back to writable drops the decode
        core.write_at(&mut state, 16, &[0; 9]).unwrap();
        assert!(core.cache().get().is_none());

        core.decoded(&mut state, |_| Vec::new()).unwrap();
        assert!(core.cache().get().is_some());
        core.flush(&mut state).unwrap();
        assert!(core.cache().get().is_none());
    }

    #[test]
    fn test_truncate() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("f0.slots");
        let shared = Arc::new(LruDecodeCache::new(100));
        let core = FileCore::create(path.clone(), Header::flexible(0), file_cache(&shared)).unwrap();

        let mut state = core.lock();
        core.write_at(&mut state, 16, &[7; 20]).unwrap();
        core.truncate(&mut state, 33).unwrap();
        assert_eq!(state.length, 33);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 33);
    }
}
