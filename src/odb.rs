use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::SystemTime;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::*;

use crate::error::{Error, Result};
use crate::loose::LooseObjectStore;
use crate::object::Object;
use crate::object_id::ObjectId;
use crate::pack::{pack_name, DeltaBaseSource, DeltaGuard, PackFile};
use crate::window_cache::WindowCache;

pub const ALTERNATES_FILE: &str = "info/alternates";
pub const PACK_DIR: &str = "pack";

/// One lookup surface over loose objects, packs, and alternate databases.
///
/// Lookups try packs (most recently added first), then loose objects, then each alternate in the
/// order `objects/info/alternates` lists them. A corrupt pack or loose file is logged and skipped;
/// the lookup carries on with the remaining sources.
pub struct ObjectDatabase {
    objects_dir: Utf8PathBuf,
    loose: LooseObjectStore,
    packs: RwLock<Vec<Arc<PackFile>>>,
    alternates: Vec<ObjectDatabase>,
    cache: Arc<WindowCache>,
}

impl std::fmt::Debug for ObjectDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectDatabase")
            .field("objects_dir", &self.objects_dir)
            .field("packs", &self.read_packs().len())
            .field("alternates", &self.alternates)
            .finish()
    }
}

impl ObjectDatabase {
    /// Open the database rooted at `objects_dir` (usually `.git/objects`), with its packs and
    /// alternates.
    pub fn open(objects_dir: impl AsRef<Utf8Path>, cache: Arc<WindowCache>) -> Result<Self> {
        let mut visited = HashSet::new();
        Self::open_chained(objects_dir.as_ref(), cache, &mut visited)
    }

    fn open_chained(
        objects_dir: &Utf8Path,
        cache: Arc<WindowCache>,
        visited: &mut HashSet<PathBuf>,
    ) -> Result<Self> {
        if let Ok(canonical) = objects_dir.canonicalize() {
            visited.insert(canonical);
        }

        let mut alternates = Vec::new();
        for dir in read_local_alternates(objects_dir)? {
            let canonical = match dir.canonicalize() {
                Ok(canonical) => canonical,
                Err(e) => {
                    warn!(alternate = %dir, error = %e, "Skipping unreadable alternate");
                    continue;
                }
            };
            if visited.contains(&canonical) {
                debug!(alternate = %dir, "Alternate already in the chain");
                continue;
            }
            trace!(alternate = %dir, "Opening alternate database");
            alternates.push(Self::open_chained(&dir, cache.clone(), visited)?);
        }

        let db = Self {
            objects_dir: objects_dir.to_owned(),
            loose: LooseObjectStore::new(objects_dir),
            packs: RwLock::new(Vec::new()),
            alternates,
            cache,
        };
        db.scan_packs()?;
        Ok(db)
    }

    pub fn objects_dir(&self) -> &Utf8Path {
        &self.objects_dir
    }

    pub fn pack_dir(&self) -> Utf8PathBuf {
        self.objects_dir.join(PACK_DIR)
    }

    pub fn loose(&self) -> &LooseObjectStore {
        &self.loose
    }

    pub fn cache(&self) -> &Arc<WindowCache> {
        &self.cache
    }

    pub fn alternates(&self) -> &[ObjectDatabase] {
        &self.alternates
    }

    fn read_packs(&self) -> RwLockReadGuard<'_, Vec<Arc<PackFile>>> {
        self.packs.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_packs(&self) -> RwLockWriteGuard<'_, Vec<Arc<PackFile>>> {
        self.packs.write().unwrap_or_else(|e| e.into_inner())
    }

    /// A snapshot of the open packs, most recently added first.
    pub fn packs(&self) -> Vec<Arc<PackFile>> {
        self.read_packs().clone()
    }

    pub fn has_pack(&self, name: &str) -> bool {
        self.read_packs().iter().any(|p| p.name() == name)
    }

    /// Open every `objects/pack/*.pack` with an index beside it that is not open yet. The most
    /// recently modified packs are searched first.
    ///
    /// Packs that fail validation are logged and left out. Returns the number of packs added.
    pub fn scan_packs(&self) -> Result<usize> {
        let dir = self.pack_dir();
        let listing = match dir.read_dir_utf8() {
            Ok(listing) => listing,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut paths = Vec::new();
        for entry in listing {
            let path = entry?.into_path();
            if path.extension() == Some("pack") && path.with_extension("idx").is_file() {
                let modified = path
                    .metadata()
                    .and_then(|m| m.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                paths.push((modified, path));
            }
        }
        // Oldest first, so that each insert at the front leaves the newest pack searched first
        paths.sort();

        let mut added = 0;
        for (_, path) in paths {
            if self.has_pack(&pack_name(&path)) {
                continue;
            }
            match PackFile::open(&path, self.cache.clone()) {
                Ok(pack) => {
                    self.write_packs().insert(0, Arc::new(pack));
                    added += 1;
                }
                Err(e) if e.is_corruption() => warn!(%path, error = %e, "Skipping invalid pack"),
                Err(e) => return Err(e),
            }
        }
        Ok(added)
    }

    /// Open the pack at `path` and make it visible to lookups.
    ///
    /// The pack and its index must already be in their final place. A pack with the same name as
    /// one already open is not opened twice.
    pub fn insert_pack(&self, path: impl AsRef<Utf8Path>) -> Result<Arc<PackFile>> {
        let path = path.as_ref();
        let name = pack_name(path);
        if let Some(pack) = self.read_packs().iter().find(|p| p.name() == name) {
            return Ok(pack.clone());
        }

        let pack = Arc::new(PackFile::open(path, self.cache.clone())?);
        let mut packs = self.write_packs();
        // Another thread may have won the race
        if let Some(existing) = packs.iter().find(|p| p.name() == name) {
            return Ok(existing.clone());
        }
        packs.insert(0, pack.clone());
        info!(pack = %name, objects = pack.index().len(), "Registered pack");
        Ok(pack)
    }

    /// Store `object` as a loose object. Visible to lookups once this returns.
    pub fn insert_loose(&self, object: &Object) -> Result<ObjectId> {
        self.loose.put(object)
    }

    /// Whether `id` is present anywhere in the chain, without reading its content.
    pub fn has_object(&self, id: &ObjectId) -> bool {
        self.read_packs().iter().any(|p| p.contains(id))
            || self.loose.has(id)
            || self.alternates.iter().any(|alt| alt.has_object(id))
    }

    /// Whether `id` is present in this database itself, ignoring alternates.
    pub fn has_local(&self, id: &ObjectId) -> bool {
        self.read_packs().iter().any(|p| p.contains(id)) || self.loose.has(id)
    }

    pub fn resolve(&self, id: &ObjectId) -> Result<Object> {
        let mut guard = DeltaGuard::new();
        guard.enter(*id);
        self.resolve_guarded(id, &mut guard)
    }

    fn resolve_guarded(&self, id: &ObjectId, guard: &mut DeltaGuard) -> Result<Object> {
        let mut corruption = None;
        let mut note = |source: &str, e: Error| -> Result<()> {
            if e.is_corruption() {
                warn!(oid = %id, source, error = %e, "Skipping corrupt copy of object");
                corruption = Some(e);
                Ok(())
            } else if e.is_not_found() {
                Ok(())
            } else {
                Err(e)
            }
        };

        for pack in self.packs() {
            if !pack.contains(id) {
                continue;
            }
            // A failed attempt must not poison the guard for the next source
            let mut attempt = guard.clone();
            match pack.get_guarded(id, self, &mut attempt) {
                Ok(object) => return Ok(object),
                Err(e) => note(pack.name(), e)?,
            }
        }

        match self.loose.get(id) {
            Ok(object) => return Ok(object),
            Err(e) => note("loose", e)?,
        }

        for alternate in &self.alternates {
            let mut attempt = guard.clone();
            match alternate.resolve_guarded(id, &mut attempt) {
                Ok(object) => return Ok(object),
                Err(e) => note(alternate.objects_dir.as_str(), e)?,
            }
        }

        Err(corruption.unwrap_or_else(|| Error::NotFound(format!("object {id}"))))
    }
}

impl DeltaBaseSource for ObjectDatabase {
    fn delta_base(&self, id: &ObjectId, guard: &mut DeltaGuard) -> Result<Object> {
        self.resolve_guarded(id, guard)
    }
}

/// The directories named by `objects/info/alternates`, relative paths resolved against
/// `objects_dir`. Blank lines and `#` comments are ignored.
pub fn read_local_alternates(objects_dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>> {
    let text = match std::fs::read_to_string(objects_dir.join(ALTERNATES_FILE)) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| objects_dir.join(line))
        .collect())
}
