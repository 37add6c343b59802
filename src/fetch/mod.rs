//! Fetching over dumb transports by walking the object graph.
//!
//! Starting from the wanted tips, every object not already present locally is looked up on the
//! remote: first in its packs (the index is downloaded, and the whole pack if the index lists
//! the object), then as a loose object. Loose objects are hashed on arrival, since some servers
//! answer a missing path with a success status and an error page. Objects the remote lacks are
//! looked for in its alternates, which are opened lazily, breadth first. The walk then follows
//! the references of each object until nothing is left to fetch.

pub mod job;

use std::collections::{HashSet, VecDeque};
use std::fmt::Display;
use std::fs::File;
use std::str::FromStr;
use std::sync::mpsc::Sender;

use tracing::*;

use crate::cancel::{self, CancelFlag};
use crate::error::{Error, Result};
use crate::loose::decode_loose;
use crate::object::{Object, ObjectKind};
use crate::object_id::ObjectId;
use crate::odb::ObjectDatabase;
use crate::pack::{PackFile, PackIndex};
use crate::remote::WalkRemoteObjectDatabase;
use crate::{server_info, util};

pub use job::FetchJob;

/// Upper bound on open connections (the remote plus its alternates) in one fetch.
pub const MAX_ALTERNATE_CONNECTIONS: usize = 64;

/// What to do with an alternate reachable through more than one path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AlternatePolicy {
    /// Open each location once per fetch. Cycles end here.
    #[default]
    Deduplicate,
    /// Open every declared alternate, up to [`MAX_ALTERNATE_CONNECTIONS`].
    FollowAll,
}

impl FromStr for AlternatePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "dedup" | "deduplicate" => Ok(Self::Deduplicate),
            "all" | "follow-all" => Ok(Self::FollowAll),
            _ => Err(format!("unknown alternates policy '{s}', expected 'dedup' or 'all'")),
        }
    }
}

impl Display for AlternatePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Deduplicate => "dedup",
            Self::FollowAll => "all",
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub alternates: AlternatePolicy,
}

/// Events reported while a fetch runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    AlternateOpened { location: String },
    PackFetched { pack: String, objects: usize },
    LooseFetched { oid: ObjectId },
    Walked { done: usize, queued: usize },
}

/// What a successful fetch transferred.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchResult {
    /// Names of the packs downloaded and installed.
    pub packs: Vec<String>,
    /// Ids of the objects downloaded one at a time.
    pub loose: Vec<ObjectId>,
    /// Objects reachable from the wants that the walk visited, now all present locally.
    pub objects: usize,
}

struct RemoteIndex {
    /// `pack-<hex>.pack`
    file_name: String,
    index: PackIndex,
    raw: Vec<u8>,
}

/// One remote database taking part in the fetch: the primary, or an alternate.
struct Source {
    remote: Box<dyn WalkRemoteObjectDatabase>,
    /// Advertised packs whose index has not been looked at yet. `None` until listed.
    unread_indexes: Option<VecDeque<String>>,
    /// Indexes downloaded whose pack has not been needed yet.
    indexes: Vec<RemoteIndex>,
    alternates_listed: bool,
}

impl Source {
    fn new(remote: Box<dyn WalkRemoteObjectDatabase>) -> Self {
        Self {
            remote,
            unread_indexes: None,
            indexes: Vec::new(),
            alternates_listed: false,
        }
    }
}

/// A single fetch from a remote into `local`.
///
/// Every remote connection the fetch opens, the primary included, is closed when the fetch
/// finishes, whether it succeeded, failed, or was cancelled.
pub struct WalkFetchConnection<'a> {
    local: &'a ObjectDatabase,
    sources: Vec<Source>,
    locations: HashSet<String>,
    visited: HashSet<ObjectId>,
    options: FetchOptions,
    cancel: CancelFlag,
    progress: Option<Sender<Progress>>,
    result: FetchResult,
}

impl<'a> WalkFetchConnection<'a> {
    pub fn new(
        local: &'a ObjectDatabase,
        remote: Box<dyn WalkRemoteObjectDatabase>,
        options: FetchOptions,
    ) -> Self {
        let locations = HashSet::from([remote.location().to_owned()]);
        Self {
            local,
            sources: vec![Source::new(remote)],
            locations,
            visited: HashSet::new(),
            options,
            cancel: CancelFlag::new(),
            progress: None,
            result: FetchResult::default(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: Sender<Progress>) -> Self {
        self.progress = Some(progress);
        self
    }

    fn report(&self, event: Progress) {
        if let Some(progress) = &self.progress {
            // Nobody listening is fine
            let _ = progress.send(event);
        }
    }

    /// Fetch everything reachable from `wants` that is not reachable from `haves`.
    ///
    /// Fails with [`Error::MissingObject`] if any object cannot be found on the remote or its
    /// alternates, or with [`Error::ContentMismatch`] if the only copies found were wrong.
    pub fn fetch(mut self, wants: &[ObjectId], haves: &[ObjectId]) -> Result<FetchResult> {
        info!(remote = self.sources[0].remote.location(), wants = wants.len(), "Fetching");
        let walked = self.walk(wants, haves);
        self.close();
        walked?;

        if !self.result.packs.is_empty() {
            if let Err(e) = server_info::update(self.local) {
                warn!(error = %e, "Could not update server info");
            }
        }

        let result = std::mem::take(&mut self.result);
        info!(
            packs = result.packs.len(),
            loose = result.loose.len(),
            objects = result.objects,
            "Fetch complete"
        );
        Ok(result)
    }

    /// Close every remote connection opened so far.
    pub fn close(&mut self) {
        for source in &mut self.sources {
            source.remote.close();
        }
    }

    /// Mark the local history behind `haves` as already present: commits and their root trees.
    fn mark_complete(&mut self, haves: &[ObjectId]) {
        let mut queue: VecDeque<ObjectId> = haves.iter().copied().collect();
        while let Some(id) = queue.pop_front() {
            if self.visited.contains(&id) || !self.local.has_object(&id) {
                continue;
            }
            let object = match self.local.resolve(&id) {
                Ok(object) => object,
                Err(e) => {
                    warn!(oid = %id, error = %e, "Ignoring unreadable local object");
                    continue;
                }
            };
            self.visited.insert(id);
            match (object.kind(), object.references()) {
                (ObjectKind::Commit, Ok(refs)) => {
                    let mut refs = refs.into_iter();
                    self.visited.extend(refs.next());
                    queue.extend(refs);
                }
                (ObjectKind::Tag, Ok(refs)) => queue.extend(refs),
                _ => {}
            }
        }
        trace!(complete = self.visited.len(), "Marked local history complete");
    }

    fn walk(&mut self, wants: &[ObjectId], haves: &[ObjectId]) -> Result<()> {
        self.mark_complete(haves);

        let mut queue: VecDeque<ObjectId> = wants.iter().copied().collect();
        while let Some(id) = queue.pop_front() {
            self.cancel.check()?;
            if !self.visited.insert(id) {
                continue;
            }

            let object = if self.local.has_object(&id) {
                self.local.resolve(&id)?
            } else {
                self.download(&id)?
            };

            let refs = object
                .references()
                .map_err(|e| Error::corrupt_object(id, e.to_string()))?;
            queue.extend(refs.into_iter().filter(|r| !self.visited.contains(r)));

            self.result.objects += 1;
            self.report(Progress::Walked {
                done: self.result.objects,
                queued: queue.len(),
            });
        }
        Ok(())
    }

    /// Find `id` on the remote or its alternates and store it locally.
    fn download(&mut self, id: &ObjectId) -> Result<Object> {
        let mut mismatch = None;
        let mut i = 0;
        while i < self.sources.len() {
            self.cancel.check()?;

            if self.find_in_packs(i, id)? {
                let object = self.local.resolve(id)?;
                if object.id() == *id {
                    return Ok(object);
                }
                let e = Error::ContentMismatch {
                    path: format!("{}pack/", with_separator(self.sources[i].remote.location())),
                    expected: *id,
                    actual: object.id(),
                };
                warn!(oid = %id, error = %e, "Rejected object");
                mismatch = Some(e);
            }

            match self.fetch_loose(i, id) {
                Ok(Some(object)) => return Ok(object),
                Ok(None) => {}
                Err(e @ Error::ContentMismatch { .. }) => {
                    warn!(oid = %id, error = %e, "Rejected object");
                    mismatch = Some(e);
                }
                Err(e) => return Err(e),
            }

            self.open_alternates(i)?;
            i += 1;
        }

        Err(mismatch.unwrap_or(Error::MissingObject(*id)))
    }

    /// Look for `id` in the packs of source `i`, downloading indexes as needed and the pack that
    /// holds it. Returns whether a pack with `id` was installed.
    fn find_in_packs(&mut self, i: usize, id: &ObjectId) -> Result<bool> {
        if self.sources[i].unread_indexes.is_none() {
            let names = match self.sources[i].remote.pack_names() {
                Ok(names) => names,
                Err(e) => {
                    if !e.is_not_found() {
                        warn!(error = %e, "Could not list remote packs");
                    }
                    Vec::new()
                }
            };
            let local = self.local;
            let names: VecDeque<String> = names
                .into_iter()
                .filter(|name| !local.has_pack(name.trim_end_matches(".pack")))
                .collect();
            debug!(remote = self.sources[i].remote.location(), packs = names.len(), "Listed packs");
            self.sources[i].unread_indexes = Some(names);
        }

        loop {
            let source = &mut self.sources[i];
            if let Some(pos) = source.indexes.iter().position(|r| r.index.contains(id)) {
                let candidate = source.indexes.swap_remove(pos);
                if self.install_pack(i, candidate)? {
                    return Ok(true);
                }
                continue;
            }

            let Some(name) = source.unread_indexes.as_mut().and_then(VecDeque::pop_front) else {
                return Ok(false);
            };
            self.cancel.check()?;
            match fetch_index(&*source.remote, &name, &self.cancel) {
                Ok(index) => source.indexes.push(index),
                Err(e) if e.is_not_found() || e.is_corruption() => {
                    warn!(pack = %name, error = %e, "Skipping remote pack with unusable index")
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Download the pack behind `candidate`, validate it, move it into place, and register it.
    /// Returns `false` if the pack turned out to be missing or invalid.
    fn install_pack(&mut self, i: usize, candidate: RemoteIndex) -> Result<bool> {
        let RemoteIndex {
            file_name,
            index,
            raw,
        } = candidate;
        let name = file_name.trim_end_matches(".pack").to_owned();
        if self.local.has_pack(&name) {
            return Ok(false);
        }

        let pack_dir = self.local.pack_dir();
        std::fs::create_dir_all(&pack_dir)?;
        let tmp = pack_dir.join(util::tmp_file_name("pack"));
        let dest = pack_dir.join(&file_name);
        let remote = &*self.sources[i].remote;
        debug!(pack = %name, remote = remote.location(), "Downloading pack");

        let downloaded = (|| -> Result<usize> {
            let mut stream = remote.open(&format!("pack/{file_name}"))?;
            let mut file = File::create(&tmp)?;
            cancel::copy(&mut stream.reader, &mut file, &self.cancel)?;
            file.sync_all()?;
            drop(file);

            // An index can file an id under any record, so every object is hashed before the
            // pack is trusted
            let pack = PackFile::open_with_index(&tmp, &name, index, self.local.cache().clone())?;
            self.cancel.check()?;
            pack.verify(self.local)?;
            let objects = pack.index().len();
            drop(pack);

            // The index goes in last, so the pack is complete before anything looks for it
            std::fs::rename(&tmp, &dest)?;
            util::write_atomically(&dest.with_extension("idx"), "idx", &raw)?;
            Ok(objects)
        })();

        let objects = match downloaded {
            Ok(objects) => objects,
            Err(e) => {
                let _ = std::fs::remove_file(&tmp);
                if e.is_not_found() || e.is_corruption() {
                    warn!(pack = %name, error = %e, "Skipping remote pack");
                    return Ok(false);
                }
                return Err(e);
            }
        };

        self.local.insert_pack(&dest)?;
        info!(pack = %name, objects, "Fetched pack");
        self.result.packs.push(name.clone());
        self.report(Progress::PackFetched {
            pack: name,
            objects,
        });
        Ok(true)
    }

    /// Fetch `id` as a loose object from source `i`. `None` if the source does not have it.
    fn fetch_loose(&mut self, i: usize, id: &ObjectId) -> Result<Option<Object>> {
        let path = id.loose_path();
        let remote = &*self.sources[i].remote;
        let stream = match remote.open(&path) {
            Ok(stream) => stream,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        let location = format!("{}{path}", with_separator(remote.location()));
        let raw = stream.into_bytes(&self.cancel)?;

        // Content that does not even inflate is reported under the hash of its raw bytes
        let actual = match decode_loose(&raw) {
            Ok(object) => object,
            Err(e) => {
                debug!(%location, error = %e, "Fetched bytes are not a loose object");
                return Err(Error::ContentMismatch {
                    path: location,
                    expected: *id,
                    actual: ObjectId::new(&raw),
                });
            }
        };
        if actual.id() != *id {
            return Err(Error::ContentMismatch {
                path: location,
                expected: *id,
                actual: actual.id(),
            });
        }

        self.local.insert_loose(&actual)?;
        trace!(oid = %id, "Fetched loose object");
        self.result.loose.push(*id);
        self.report(Progress::LooseFetched { oid: *id });
        Ok(Some(actual))
    }

    /// Open the alternates of source `i` and queue them behind every source opened so far.
    fn open_alternates(&mut self, i: usize) -> Result<()> {
        if self.sources[i].alternates_listed {
            return Ok(());
        }
        self.sources[i].alternates_listed = true;

        let locations = match self.sources[i].remote.alternates() {
            Ok(locations) => locations,
            Err(e) => {
                warn!(error = %e, "Could not read remote alternates");
                Vec::new()
            }
        };

        for location in locations {
            self.cancel.check()?;
            if self.sources.len() >= MAX_ALTERNATE_CONNECTIONS {
                warn!(
                    limit = MAX_ALTERNATE_CONNECTIONS,
                    "Not opening more alternates"
                );
                break;
            }

            let mut alternate = match self.sources[i].remote.open_alternate(&location) {
                Ok(alternate) => alternate,
                Err(e) => {
                    warn!(%location, error = %e, "Could not open alternate");
                    continue;
                }
            };

            let seen = !self.locations.insert(alternate.location().to_owned());
            if seen && self.options.alternates == AlternatePolicy::Deduplicate {
                debug!(location = alternate.location(), "Alternate already open");
                alternate.close();
                continue;
            }

            info!(location = alternate.location(), "Opened alternate");
            self.report(Progress::AlternateOpened {
                location: alternate.location().to_owned(),
            });
            self.sources.push(Source::new(alternate));
        }
        Ok(())
    }
}

impl Drop for WalkFetchConnection<'_> {
    fn drop(&mut self) {
        self.close();
    }
}

fn with_separator(location: &str) -> String {
    if location.ends_with('/') {
        location.to_owned()
    } else {
        format!("{location}/")
    }
}

fn fetch_index(
    remote: &dyn WalkRemoteObjectDatabase,
    file_name: &str,
    cancel: &CancelFlag,
) -> Result<RemoteIndex> {
    let name = file_name.trim_end_matches(".pack");
    let raw = remote
        .open(&format!("pack/{name}.idx"))?
        .into_bytes(cancel)?;
    let index = PackIndex::parse(name, &raw)?;
    trace!(pack = %name, objects = index.len(), "Fetched pack index");
    Ok(RemoteIndex {
        file_name: file_name.to_owned(),
        index,
        raw,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alternate_policy_parsing() {
        assert_eq!("dedup".parse(), Ok(AlternatePolicy::Deduplicate));
        assert_eq!("all".parse(), Ok(AlternatePolicy::FollowAll));
        assert!("sometimes".parse::<AlternatePolicy>().is_err());
        assert_eq!(AlternatePolicy::default().to_string(), "dedup");
    }
}
