//! A size-bounded cache of memory-mapped pack windows, shared by every open pack.
//!
//! Pack files are mapped in fixed-size, aligned windows. A window handed out as a [`WindowRef`]
//! is pinned until the reference is dropped; only unpinned windows are evicted, least recently
//! used first. When the platform refuses a mapping because the address space is exhausted, every
//! unpinned window is unmapped and the mapping is retried once before giving up with
//! [`Error::OutOfMemory`].

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read};
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use memmap2::{Mmap, MmapOptions};
use tracing::*;

use crate::error::{Error, Result};

pub const DEFAULT_WINDOW_SIZE: usize = 8 * 1024 * 1024;
pub const DEFAULT_LIMIT: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct WindowCacheConfig {
    /// Bytes per window. Rounded up to a multiple of the page size.
    pub window_size: usize,
    /// Upper bound on mapped bytes across all unpinned windows.
    pub limit: usize,
}

impl Default for WindowCacheConfig {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            limit: DEFAULT_LIMIT,
        }
    }
}

fn page_size() -> usize {
    // Safety: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

/// A file whose bytes can be read through the cache.
pub struct MappedFile {
    key: usize,
    name: String,
    file: File,
    len: u64,
}

static NEXT_KEY: AtomicUsize = AtomicUsize::new(0);

impl MappedFile {
    pub fn new(name: impl Into<String>, file: File) -> Result<Self> {
        let len = file.metadata()?.len();
        Ok(Self {
            key: NEXT_KEY.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            file,
            len,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> u64 {
        self.len
    }
}

/// One mapped, read-only slice of a file.
pub struct Window {
    start: u64,
    map: Mmap,
}

impl Window {
    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.start + self.map.len() as u64
    }

    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.start && offset < self.end()
    }
}

/// A pinned window. The window cannot be evicted while this is alive.
#[derive(Clone)]
pub struct WindowRef(Arc<Window>);

impl Deref for WindowRef {
    type Target = Window;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl WindowRef {
    /// The mapped bytes from `offset` to the end of the window.
    pub fn bytes_from(&self, offset: u64) -> &[u8] {
        let skip = (offset - self.0.start) as usize;
        &self.0.map[skip..]
    }
}

pub(crate) type Mapper = dyn Fn(&File, u64, usize) -> io::Result<Mmap> + Send + Sync;

struct Entry {
    window: Arc<Window>,
    last_used: u64,
}

impl Entry {
    fn pinned(&self) -> bool {
        Arc::strong_count(&self.window) > 1
    }
}

#[derive(Default)]
struct CacheState {
    windows: HashMap<(usize, u64), Entry>,
    mapped: usize,
    tick: u64,
}

pub struct WindowCache {
    window_size: usize,
    limit: usize,
    state: Mutex<CacheState>,
    mapper: Box<Mapper>,
}

impl WindowCache {
    pub fn new(config: WindowCacheConfig) -> Self {
        Self::with_mapper(config, Box::new(map_window))
    }

    pub(crate) fn with_mapper(config: WindowCacheConfig, mapper: Box<Mapper>) -> Self {
        let page = page_size();
        let window_size = config.window_size.max(1).div_ceil(page) * page;
        debug!(window_size, limit = config.limit, "Creating window cache");
        Self {
            window_size,
            limit: config.limit,
            state: Mutex::new(CacheState::default()),
            mapper,
        }
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Total bytes currently mapped, pinned or not.
    pub fn mapped_bytes(&self) -> usize {
        self.lock().mapped
    }

    pub fn open_windows(&self) -> usize {
        self.lock().windows.len()
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        // A panicking reader cannot leave the map half-updated
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Get the window of `file` containing `offset`, mapping it if necessary.
    pub fn get(&self, file: &MappedFile, offset: u64) -> Result<WindowRef> {
        if offset >= file.len {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("offset {offset} is past the end of {}", file.name),
            )));
        }

        let index = offset / self.window_size as u64;
        let mut state = self.lock();
        state.tick += 1;
        let tick = state.tick;

        if let Some(entry) = state.windows.get_mut(&(file.key, index)) {
            entry.last_used = tick;
            let window = WindowRef(Arc::clone(&entry.window));
            self.evict_to_limit(&mut state, 0);
            return Ok(window);
        }

        let start = index * self.window_size as u64;
        let len = (file.len - start).min(self.window_size as u64) as usize;
        self.evict_to_limit(&mut state, len);

        let map = match (self.mapper)(&file.file, start, len) {
            Ok(map) => map,
            Err(e) if is_address_space_exhausted(&e) => {
                warn!(pack = %file.name, start, len, "Mapping refused, releasing unpinned windows");
                Self::evict_all_unpinned(&mut state);
                (self.mapper)(&file.file, start, len).map_err(|source| Error::OutOfMemory {
                    pack: file.name.clone(),
                    len,
                    source,
                })?
            }
            Err(e) => return Err(e.into()),
        };

        trace!(pack = %file.name, start, len, "Mapped window");
        let window = Arc::new(Window { start, map });
        state.windows.insert(
            (file.key, index),
            Entry {
                window: Arc::clone(&window),
                last_used: tick,
            },
        );
        state.mapped += len;

        Ok(WindowRef(window))
    }

    /// Evict unpinned windows until `incoming` more bytes fit in the budget.
    fn evict_to_limit(&self, state: &mut CacheState, incoming: usize) {
        while state.mapped + incoming > self.limit {
            let victim = state
                .windows
                .iter()
                .filter(|(_, entry)| !entry.pinned())
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| *key);

            match victim {
                Some(key) => {
                    if let Some(entry) = state.windows.remove(&key) {
                        trace!(start = entry.window.start, "Evicting window");
                        state.mapped -= entry.window.map.len();
                    }
                }
                // Everything left is pinned by a reader
                None => break,
            }
        }
    }

    fn evict_all_unpinned(state: &mut CacheState) {
        let mut released = 0;
        state.windows.retain(|_, entry| {
            if entry.pinned() {
                true
            } else {
                released += entry.window.map.len();
                false
            }
        });
        state.mapped -= released;
        debug!(released, "Released unpinned windows");
    }

    /// Forget every window of `file`. Pinned windows stay mapped until their readers finish.
    pub fn purge(&self, file: &MappedFile) {
        let mut state = self.lock();
        let mut released = 0;
        state.windows.retain(|(key, _), entry| {
            if *key == file.key {
                released += entry.window.map.len();
                false
            } else {
                true
            }
        });
        state.mapped -= released;
    }

    /// A sequential reader over `file` starting at `offset`.
    pub fn cursor<'a>(&'a self, file: &'a MappedFile, offset: u64) -> WindowCursor<'a> {
        WindowCursor {
            cache: self,
            file,
            pos: offset,
            current: None,
        }
    }

    /// Copy `buf.len()` bytes starting at `offset` into `buf`.
    pub fn read_exact_at(&self, file: &MappedFile, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.cursor(file, offset).read_exact(buf).map_err(cursor_error)
    }
}

/// Recover the cache error a [`WindowCursor`] had to wrap in an `io::Error`, so that
/// [`Error::OutOfMemory`] survives a trip through [`Read`].
pub fn cursor_error(e: io::Error) -> Error {
    if !e.get_ref().is_some_and(|inner| inner.is::<Error>()) {
        return Error::Io(e);
    }
    let kind = e.kind();
    match e.into_inner().map(|inner| inner.downcast::<Error>()) {
        Some(Ok(inner)) => *inner,
        Some(Err(inner)) => Error::Io(io::Error::new(kind, inner)),
        None => Error::Io(kind.into()),
    }
}

pub(crate) fn map_window(file: &File, start: u64, len: usize) -> io::Result<Mmap> {
    // Safety: pack files are immutable once written; nothing truncates them while mapped.
    unsafe { MmapOptions::new().offset(start).len(len).map(file) }
}

fn is_address_space_exhausted(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(libc::ENOMEM) | Some(libc::EAGAIN))
        || e.kind() == io::ErrorKind::OutOfMemory
}

/// Reads a file through the cache, pinning one window at a time.
pub struct WindowCursor<'a> {
    cache: &'a WindowCache,
    file: &'a MappedFile,
    pos: u64,
    current: Option<WindowRef>,
}

impl WindowCursor<'_> {
    pub fn position(&self) -> u64 {
        self.pos
    }
}

impl Read for WindowCursor<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.pos >= self.file.len {
            return Ok(0);
        }

        let stale = !matches!(&self.current, Some(w) if w.contains(self.pos));
        if stale {
            // Unpin the old window before pinning the next one
            self.current = None;
            let w = self.cache.get(self.file, self.pos).map_err(|e| match e {
                Error::Io(e) => e,
                other => io::Error::new(io::ErrorKind::OutOfMemory, other),
            })?;
            self.current = Some(w);
        }
        let Some(window) = &self.current else {
            return Ok(0);
        };

        let available = window.bytes_from(self.pos);
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.pos += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempdir::TempDir;

    fn file_of(dir: &TempDir, name: &str, len: usize) -> Result<MappedFile> {
        let path = dir.path().join(name);
        let mut f = File::create(&path)?;
        let bytes: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        f.write_all(&bytes)?;
        drop(f);
        MappedFile::new(name, File::open(&path)?)
    }

    fn small_cache(windows: usize) -> WindowCache {
        let page = page_size();
        WindowCache::new(WindowCacheConfig {
            window_size: page,
            limit: page * windows,
        })
    }

    #[test]
    fn test_cursor_reads_across_windows() -> Result<()> {
        let dir = TempDir::new("")?;
        let cache = small_cache(2);
        let page = cache.window_size();
        let file = file_of(&dir, "a", page * 3 + 17)?;

        let mut buf = vec![0; page + 100];
        cache.read_exact_at(&file, (page - 50) as u64, &mut buf)?;
        for (i, b) in buf.iter().enumerate() {
            assert_eq!(*b, ((page - 50 + i) % 251) as u8);
        }

        let mut tail = Vec::new();
        cache.cursor(&file, (page * 3) as u64).read_to_end(&mut tail)?;
        assert_eq!(tail.len(), 17);
        Ok(())
    }

    #[test]
    fn test_budget_is_respected() -> Result<()> {
        let dir = TempDir::new("")?;
        let cache = small_cache(2);
        let page = cache.window_size();
        let a = file_of(&dir, "a", page * 4)?;
        let b = file_of(&dir, "b", page * 4)?;

        for i in 0..4 {
            drop(cache.get(&a, (i * page) as u64)?);
            drop(cache.get(&b, (i * page) as u64)?);
            assert!(cache.mapped_bytes() <= page * 2);
        }
        assert_eq!(cache.open_windows(), 2);
        Ok(())
    }

    #[test]
    fn test_pinned_windows_are_not_evicted() -> Result<()> {
        let dir = TempDir::new("")?;
        let cache = small_cache(1);
        let page = cache.window_size();
        let a = file_of(&dir, "a", page * 4)?;

        let pinned = cache.get(&a, 0)?;
        let also_pinned = cache.get(&a, page as u64)?;
        // Both readers are still active, so the cache is allowed to go over budget
        assert_eq!(cache.mapped_bytes(), page * 2);

        drop(also_pinned);
        drop(cache.get(&a, (2 * page) as u64)?);
        // The second window made room for the third; the first is untouched
        assert_eq!(cache.open_windows(), 2);
        assert_eq!(cache.mapped_bytes(), page * 2);
        assert_eq!(pinned.bytes_from(0)[1], 1);

        // The pinned window is still the cached one
        let again = cache.get(&a, 5)?;
        assert!(Arc::ptr_eq(&again.0, &pinned.0));
        Ok(())
    }

    #[test]
    fn test_address_space_exhaustion_releases_and_retries() -> Result<()> {
        let dir = TempDir::new("")?;
        let page = page_size();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let cache = WindowCache::with_mapper(
            WindowCacheConfig {
                window_size: page,
                limit: page * 16,
            },
            Box::new(move |file: &File, start: u64, len: usize| {
                // The third mapping fails once as if address space ran out
                if counter.fetch_add(1, Ordering::SeqCst) == 2 {
                    return Err(io::Error::from_raw_os_error(libc::ENOMEM));
                }
                map_window(file, start, len)
            }),
        );
        let a = file_of(&dir, "a", page * 4)?;

        let pinned = cache.get(&a, 0)?;
        drop(cache.get(&a, page as u64)?);
        assert_eq!(cache.open_windows(), 2);

        let w = cache.get(&a, (2 * page) as u64)?;
        assert_eq!(w.start(), (2 * page) as u64);
        // The unpinned window was released, the pinned one survived
        assert_eq!(cache.open_windows(), 2);
        assert_eq!(cache.mapped_bytes(), page * 2);
        drop(pinned);
        Ok(())
    }

    #[test]
    fn test_persistent_exhaustion_is_out_of_memory() -> Result<()> {
        let dir = TempDir::new("")?;
        let cache = WindowCache::with_mapper(
            WindowCacheConfig::default(),
            Box::new(|_: &File, _: u64, _: usize| Err(io::Error::from_raw_os_error(libc::ENOMEM))),
        );
        let a = file_of(&dir, "a", 100)?;
        let err = cache.get(&a, 0).err().unwrap();
        assert!(matches!(err, Error::OutOfMemory { .. }));
        Ok(())
    }

    #[test]
    fn test_exhaustion_survives_reads_through_a_cursor() -> Result<()> {
        let dir = TempDir::new("")?;
        let cache = WindowCache::with_mapper(
            WindowCacheConfig::default(),
            Box::new(|_: &File, _: u64, _: usize| Err(io::Error::from_raw_os_error(libc::ENOMEM))),
        );
        let a = file_of(&dir, "a", 100)?;
        let mut buf = [0u8; 10];
        let err = cache.read_exact_at(&a, 0, &mut buf).unwrap_err();
        assert!(matches!(err, Error::OutOfMemory { .. }), "{err:?}");

        // Plain io errors pass through untouched
        let err = cache.read_exact_at(&a, 200, &mut buf).unwrap_err();
        assert!(matches!(&err, Error::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof), "{err:?}");
        Ok(())
    }

    #[test]
    fn test_concurrent_readers() -> Result<()> {
        let dir = TempDir::new("")?;
        let cache = small_cache(2);
        let page = cache.window_size();
        let a = file_of(&dir, "a", page * 8)?;

        std::thread::scope(|s| {
            for t in 0..4 {
                let (cache, a) = (&cache, &a);
                s.spawn(move || {
                    for i in 0..8 {
                        let offset = ((i + t) % 8 * page + t) as u64;
                        let mut b = [0u8; 1];
                        cache.read_exact_at(a, offset, &mut b).unwrap();
                        assert_eq!(b[0], (offset % 251) as u8);
                    }
                });
            }
        });

        // Once the readers are gone the next access brings the cache back within budget
        drop(cache.get(&a, 0)?);
        assert!(cache.mapped_bytes() <= page * 2);
        Ok(())
    }
}
