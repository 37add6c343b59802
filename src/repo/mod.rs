pub mod refs;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{eyre, Context};
use tracing::*;

use crate::fetch::{FetchJob, FetchOptions, FetchResult, Progress};
use crate::object::{Object, ObjectKind};
use crate::object_id::ObjectId;
use crate::odb::ObjectDatabase;
use crate::pack::{delta, PackWriter};
use crate::remote::WalkRemoteObjectDatabase;
use crate::server_info;
use crate::window_cache::{WindowCache, WindowCacheConfig};
use crate::Result;

/// Deltas are not chained deeper than this in packs rit writes.
const MAX_DELTA_DEPTH: usize = 10;

pub struct Repo {
    git_dir: Utf8PathBuf,
    heads_path: Utf8PathBuf,
    pub database: Arc<ObjectDatabase>,
}

impl Repo {
    pub fn init(path: &Utf8Path) -> Result<()> {
        trace!(%path, "Initialising repo");
        let git_dir = path.join(".git");
        if git_dir.exists() {
            warn!("Repo already exists, init will do nothing");
            return Ok(());
        }
        for d in ["objects/info", "objects/pack", "refs/heads"] {
            let dir = git_dir.join(d);
            trace!(%dir, "Creating directory");
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(git_dir.join("HEAD"), "ref: refs/heads/master\n")?;
        Ok(())
    }

    pub fn open(path: impl AsRef<Utf8Path>, cache: WindowCacheConfig) -> Result<Self> {
        let git_dir = path.as_ref().join(".git");
        if !git_dir.is_dir() {
            return Err(eyre!("Not a rit repository: '{}'", path.as_ref()));
        }
        let cache = Arc::new(WindowCache::new(cache));
        let database = ObjectDatabase::open(git_dir.join("objects"), cache)
            .wrap_err("Could not open the object database")?;
        trace!(%git_dir, "Opened repo");
        Ok(Self {
            heads_path: git_dir.join("refs/heads"),
            git_dir,
            database: Arc::new(database),
        })
    }

    pub fn git_dir(&self) -> &Utf8Path {
        &self.git_dir
    }

    /// Hash `data` as an object of `kind`, storing it if `write` is set.
    pub fn hash_object(&self, kind: ObjectKind, data: Vec<u8>, write: bool) -> Result<ObjectId> {
        let object = Object::new(kind, data);
        if kind != ObjectKind::Blob {
            // Refuse to store something that cannot be walked later
            object
                .references()
                .wrap_err_with(|| format!("Content is not a valid {kind}"))?;
        }
        if write {
            Ok(self.database.insert_loose(&object)?)
        } else {
            Ok(object.id())
        }
    }

    /// Write a pack of everything reachable from `tips`, register it, and refresh
    /// `objects/info/packs`. Returns the pack name and object count.
    pub fn pack_objects(&self, tips: &[ObjectId]) -> Result<(String, usize)> {
        let mut writer = PackWriter::new();
        let mut seen = HashSet::new();
        let mut queue: VecDeque<ObjectId> = tips.iter().copied().collect();
        // Last object written of each kind: the delta base candidate for the next one
        let mut last: HashMap<ObjectKind, (Object, u64, usize)> = HashMap::new();

        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            let object = self
                .database
                .resolve(&id)
                .wrap_err_with(|| format!("Cannot pack {id}"))?;
            queue.extend(object.references()?);

            let kind = object.kind();
            let delta = last.get(&kind).and_then(|(base, offset, depth)| {
                if *depth >= MAX_DELTA_DEPTH {
                    return None;
                }
                delta::encode(base.data(), object.data()).map(|d| (d, *offset, depth + 1))
            });
            let (offset, depth) = match delta {
                Some((delta, base_offset, depth)) => {
                    (writer.add_ofs_delta(id, base_offset, &delta)?, depth)
                }
                None => (writer.add(&object)?, 0),
            };
            last.insert(kind, (object, offset, depth));
        }

        let count = writer.len();
        let written = writer.finish();
        let path = written.write_to(&self.database.pack_dir())?;
        self.database.insert_pack(&path)?;
        server_info::update(&self.database)?;
        info!(pack = %written.name, objects = count, "Packed objects");
        Ok((written.name, count))
    }

    /// Fetch `wants` from `remote` on a worker thread, passing progress events to `on_progress`.
    ///
    /// On success the ref `update_ref`, if given, is pointed at the first want.
    pub fn fetch(
        &self,
        remote: Box<dyn WalkRemoteObjectDatabase>,
        wants: &[ObjectId],
        options: FetchOptions,
        update_ref: Option<&str>,
        mut on_progress: impl FnMut(Progress),
    ) -> Result<FetchResult> {
        if let Some(name) = update_ref {
            let full = refs::full_ref_name(name);
            if !refs::is_valid_ref_name(&full) {
                return Err(eyre!("Invalid ref name: {}", full));
            }
        }

        let haves = self.haves()?;
        debug!(haves = haves.len(), "Seeded haves from local refs");
        let job = FetchJob::spawn(
            self.database.clone(),
            remote,
            wants.to_vec(),
            haves,
            options,
        )?;
        for event in job.progress().iter() {
            on_progress(event);
        }
        let result = job.join()?;

        if let (Some(name), Some(tip)) = (update_ref, wants.first()) {
            self.update_ref(name, tip)?;
        }
        Ok(result)
    }
}
