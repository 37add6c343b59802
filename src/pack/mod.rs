pub mod delta;
pub mod entry;
pub mod index;
pub mod write;

use std::collections::HashSet;
use std::io::Read;
use std::ops::Range;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use flate2::read::ZlibDecoder;
use rayon::prelude::*;
use tracing::*;

use crate::error::{Error, Result};
use crate::object::Object;
use crate::object_id::ObjectId;
use crate::window_cache::{cursor_error, MappedFile, WindowCache};

use delta::MAX_PREALLOC;
use entry::{EntryHeader, EntryKind, MAX_HEADER_LEN};
pub use index::PackIndex;
pub use write::PackWriter;

const PACK_MAGIC: &[u8; 4] = b"PACK";
const HEADER_LEN: u64 = 12;
const TRAILER_LEN: u64 = 20;

/// Ids of objects requested as delta bases while resolving one object.
///
/// A ref-delta chain that leaves a pack can come back into it through another pack. Every base
/// id is recorded here, so a chain that returns to an id it has already asked for is cyclic.
#[derive(Debug, Default, Clone)]
pub struct DeltaGuard {
    requested: HashSet<ObjectId>,
}

impl DeltaGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `id`. Returns `false` if it was already being resolved.
    pub fn enter(&mut self, id: ObjectId) -> bool {
        self.requested.insert(id)
    }
}

/// Where ref-delta bases that are not in the same pack come from.
pub trait DeltaBaseSource {
    fn delta_base(&self, id: &ObjectId, guard: &mut DeltaGuard) -> Result<Object>;
}

/// Resolves nothing. Packs read through this must be self-contained.
pub struct NoExternalBases;

impl DeltaBaseSource for NoExternalBases {
    fn delta_base(&self, id: &ObjectId, _: &mut DeltaGuard) -> Result<Object> {
        Err(Error::NotFound(format!("delta base {id}")))
    }
}

/// A pack file and its index, read through the shared [`WindowCache`].
pub struct PackFile {
    name: String,
    path: Utf8PathBuf,
    file: MappedFile,
    index: PackIndex,
    cache: Arc<WindowCache>,
}

impl std::fmt::Debug for PackFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackFile")
            .field("name", &self.name)
            .field("objects", &self.index.len())
            .finish()
    }
}

/// `pack-1234.pack` -> `pack-1234`
pub fn pack_name(path: &Utf8Path) -> String {
    path.file_stem().unwrap_or(path.as_str()).to_owned()
}

impl PackFile {
    /// Open `path` and the `.idx` beside it.
    ///
    /// The header, the object count, and the trailer checksum are all validated before the pack
    /// is returned, as is the index's record of that checksum.
    pub fn open(path: impl AsRef<Utf8Path>, cache: Arc<WindowCache>) -> Result<Self> {
        let path = path.as_ref().to_owned();
        let name = pack_name(&path);
        let index_bytes = std::fs::read(path.with_extension("idx"))?;
        let index = PackIndex::parse(&name, &index_bytes)?;
        Self::open_with_index(path, name, index, cache)
    }

    /// Open the pack at `path` with an already parsed index, validating it as [`PackFile::open`]
    /// does. `name` need not match the file name, e.g. for a download not yet moved into place.
    pub fn open_with_index(
        path: impl AsRef<Utf8Path>,
        name: impl Into<String>,
        index: PackIndex,
        cache: Arc<WindowCache>,
    ) -> Result<Self> {
        let path = path.as_ref().to_owned();
        let name = name.into();
        let file = MappedFile::new(name.clone(), std::fs::File::open(&path)?)?;

        let pack = Self {
            name,
            path,
            file,
            index,
            cache,
        };
        pack.validate()?;
        debug!(pack = %pack.name, objects = pack.index.len(), "Opened pack");
        Ok(pack)
    }

    fn invalid(&self, reason: impl Into<String>) -> Error {
        Error::invalid_pack(&self.name, reason)
    }

    fn validate(&self) -> Result<()> {
        let len = self.file.len();
        if len < HEADER_LEN + TRAILER_LEN {
            return Err(self.invalid("pack is truncated"));
        }

        let mut header = [0u8; HEADER_LEN as usize];
        self.cache.read_exact_at(&self.file, 0, &mut header)?;
        let (count, _) = parse_header(&header).map_err(|reason| self.invalid(reason))?;
        if count as usize != self.index.len() {
            return Err(self.invalid(format!(
                "pack holds {count} objects but its index lists {}",
                self.index.len()
            )));
        }

        let actual = self.compute_checksum()?;
        let mut trailer = [0u8; TRAILER_LEN as usize];
        self.cache
            .read_exact_at(&self.file, len - TRAILER_LEN, &mut trailer)?;
        if actual.0 != trailer {
            return Err(self.invalid("trailer checksum mismatch"));
        }
        if &actual != self.index.pack_checksum() {
            return Err(self.invalid("index was built for a different pack"));
        }
        Ok(())
    }

    fn compute_checksum(&self) -> Result<ObjectId> {
        use sha1::{Digest as _, Sha1};

        let mut hasher = Sha1::new();
        let mut remaining = self.file.len() - TRAILER_LEN;
        let mut cursor = self.cache.cursor(&self.file, 0);
        let mut buf = vec![0u8; 64 * 1024];
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            cursor.read_exact(&mut buf[..want]).map_err(cursor_error)?;
            hasher.update(&buf[..want]);
            remaining -= want as u64;
        }
        let mut raw = [0u8; 20];
        raw.copy_from_slice(&hasher.finalize());
        Ok(ObjectId(raw))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn index(&self) -> &PackIndex {
        &self.index
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.index.contains(id)
    }

    /// The raw byte range of `id`'s record.
    pub fn resolve(&self, id: &ObjectId) -> Result<Range<u64>> {
        let offset = self
            .index
            .find_offset(id)
            .ok_or_else(|| Error::NotFound(format!("{id} in {}", self.name)))?;
        Ok(self.index.record_range(offset, self.file.len()))
    }

    /// Load `id` from this pack.
    pub fn get(&self, id: &ObjectId, bases: &dyn DeltaBaseSource) -> Result<Object> {
        let mut guard = DeltaGuard::new();
        guard.enter(*id);
        self.get_guarded(id, bases, &mut guard)
    }

    pub fn get_guarded(
        &self,
        id: &ObjectId,
        bases: &dyn DeltaBaseSource,
        guard: &mut DeltaGuard,
    ) -> Result<Object> {
        let offset = self
            .index
            .find_offset(id)
            .ok_or_else(|| Error::NotFound(format!("{id} in {}", self.name)))?;
        self.inflate(offset, bases, guard)
    }

    fn read_entry_header(&self, offset: u64) -> Result<EntryHeader> {
        let data_end = self.file.len() - TRAILER_LEN;
        if offset < HEADER_LEN || offset >= data_end {
            return Err(self.invalid(format!("offset {offset} is outside the object data")));
        }
        let len = (data_end - offset).min(MAX_HEADER_LEN as u64) as usize;
        let mut buf = [0u8; MAX_HEADER_LEN];
        self.cache.read_exact_at(&self.file, offset, &mut buf[..len])?;
        EntryHeader::parse(&buf[..len])
            .map_err(|reason| self.invalid(format!("at offset {offset}: {reason}")))
    }

    /// Inflate exactly `size` bytes of zlib data starting at `offset`.
    fn inflate_exact(&self, offset: u64, size: u64) -> Result<Vec<u8>> {
        let size = usize::try_from(size).map_err(|_| self.invalid("entry is too large"))?;
        let mut out = Vec::with_capacity(size.min(MAX_PREALLOC));
        let cursor = self.cache.cursor(&self.file, offset);
        ZlibDecoder::new(cursor)
            .take(size as u64 + 1)
            .read_to_end(&mut out)
            .map_err(|e| match cursor_error(e) {
                Error::Io(e) if e.kind() != std::io::ErrorKind::OutOfMemory => {
                    self.invalid(format!("at offset {offset}: {e}"))
                }
                other => other,
            })?;
        if out.len() != size {
            return Err(self.invalid(format!(
                "at offset {offset}: inflated {} bytes, header declares {size}",
                out.len()
            )));
        }
        Ok(out)
    }

    /// Reconstruct the object whose record starts at `offset`.
    ///
    /// Delta chains are followed iteratively: offset deltas within this pack, ref deltas within
    /// this pack when the index has the base, and through `bases` otherwise.
    pub fn inflate(
        &self,
        offset: u64,
        bases: &dyn DeltaBaseSource,
        guard: &mut DeltaGuard,
    ) -> Result<Object> {
        let mut deltas: Vec<(u64, Vec<u8>)> = Vec::new();
        let mut seen = HashSet::new();
        let mut pos = offset;

        let base = loop {
            if !seen.insert(pos) {
                return Err(Error::corrupt_delta(
                    &self.name,
                    offset,
                    format!("delta chain loops back to offset {pos}"),
                ));
            }

            let header = self.read_entry_header(pos)?;
            let data = self.inflate_exact(pos + header.len as u64, header.size)?;

            match header.kind {
                EntryKind::Full(kind) => break Object::new(kind, data),
                EntryKind::OfsDelta { distance } => {
                    deltas.push((pos, data));
                    if distance == 0 || distance > pos {
                        return Err(Error::corrupt_delta(
                            &self.name,
                            pos,
                            format!("base distance {distance} is out of range"),
                        ));
                    }
                    pos -= distance;
                }
                EntryKind::RefDelta { base } => {
                    deltas.push((pos, data));
                    if let Some(base_offset) = self.index.find_offset(&base) {
                        pos = base_offset;
                        continue;
                    }
                    if !guard.enter(base) {
                        return Err(Error::corrupt_delta(
                            &self.name,
                            pos,
                            format!("delta chain loops back to {base}"),
                        ));
                    }
                    trace!(pack = %self.name, %base, "Delta base is outside the pack");
                    break bases.delta_base(&base, guard).map_err(|e| match e {
                        e if e.is_not_found() => Error::corrupt_delta(
                            &self.name,
                            pos,
                            format!("delta base {base} is not available"),
                        ),
                        e => e,
                    })?;
                }
            }
        };

        let kind = base.kind();
        let mut data = base.into_data();
        for (at, delta) in deltas.into_iter().rev() {
            data = delta::apply_delta(&data, &delta)
                .map_err(|e| Error::corrupt_delta(&self.name, at, e.to_string()))?;
        }
        Ok(Object::new(kind, data))
    }

    /// Check every object in the pack: the CRC-32 of its raw record, and that its content hashes
    /// to the id the index files it under.
    pub fn verify(&self, bases: &(dyn DeltaBaseSource + Sync)) -> Result<()> {
        self.index
            .entries()
            .collect::<Vec<_>>()
            .into_par_iter()
            .try_for_each(|(id, offset)| -> Result<()> {
                if let Some(expected) = self.index.crc(&id) {
                    let range = self.index.record_range(offset, self.file.len());
                    let mut raw = vec![0u8; (range.end - range.start) as usize];
                    self.cache.read_exact_at(&self.file, range.start, &mut raw)?;
                    if crc32fast::hash(&raw) != expected {
                        return Err(Error::corrupt_object(id, format!("CRC mismatch in {}", self.name)));
                    }
                }

                let mut guard = DeltaGuard::new();
                guard.enter(id);
                let object = self.inflate(offset, bases, &mut guard)?;
                let actual = object.id();
                if actual != id {
                    return Err(Error::corrupt_object(
                        id,
                        format!("{} holds content hashing to {actual}", self.name),
                    ));
                }
                Ok(())
            })?;
        info!(pack = %self.name, objects = self.index.len(), "Pack verified");
        Ok(())
    }
}

impl Drop for PackFile {
    fn drop(&mut self) {
        self.cache.purge(&self.file);
    }
}

/// Parse the 12 byte pack header, returning `(object count, version)`.
pub fn parse_header(header: &[u8]) -> std::result::Result<(u32, u32), String> {
    if header.len() < HEADER_LEN as usize || &header[..4] != PACK_MAGIC {
        return Err("bad pack signature".into());
    }
    let version = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    if version != 2 && version != 3 {
        return Err(format!("unsupported pack version {version}"));
    }
    let count = u32::from_be_bytes([header[8], header[9], header[10], header[11]]);
    Ok((count, version))
}

#[cfg(test)]
mod tests;
