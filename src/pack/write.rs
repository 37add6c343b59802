use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use tracing::*;

use super::entry::{EntryHeader, EntryKind};
use super::index::PackIndex;
use crate::error::Result;
use crate::object::Object;
use crate::object_id::ObjectId;
use crate::util;

/// Builds a version 2 pack and its index in memory.
pub struct PackWriter {
    buf: Vec<u8>,
    entries: Vec<(ObjectId, u64, u32)>,
}

impl Default for PackWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// A finished pack: its bytes, its index, and its name (`pack-<trailer hex>`).
pub struct WrittenPack {
    pub name: String,
    pub pack: Vec<u8>,
    pub index: Vec<u8>,
}

impl PackWriter {
    pub fn new() -> Self {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"PACK");
        buf.extend_from_slice(&2u32.to_be_bytes());
        // Count is patched in `finish`
        buf.extend_from_slice(&0u32.to_be_bytes());
        Self {
            buf,
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn push(&mut self, id: ObjectId, kind: EntryKind, payload: &[u8]) -> Result<u64> {
        let offset = self.buf.len() as u64;
        let header = EntryHeader {
            kind,
            size: payload.len() as u64,
            len: 0,
        };

        let mut e = ZlibEncoder::new(Vec::new(), Compression::default());
        e.write_all(payload)?;
        let compressed = e.finish()?;

        let mut crc = crc32fast::Hasher::new();
        let header = header.encode();
        crc.update(&header);
        crc.update(&compressed);

        self.buf.extend_from_slice(&header);
        self.buf.extend_from_slice(&compressed);
        self.entries.push((id, offset, crc.finalize()));
        Ok(offset)
    }

    /// Append a whole object. Returns the offset of its record.
    pub fn add(&mut self, object: &Object) -> Result<u64> {
        trace!(oid = %object.id(), "Adding object to pack");
        self.push(object.id(), EntryKind::Full(object.kind()), object.data())
    }

    /// Append `id` as a delta against the record at `base_offset`.
    pub fn add_ofs_delta(&mut self, id: ObjectId, base_offset: u64, delta: &[u8]) -> Result<u64> {
        let distance = self.buf.len() as u64 - base_offset;
        self.push(id, EntryKind::OfsDelta { distance }, delta)
    }

    /// Append `id` as a delta against the object `base`, which need not be in this pack.
    pub fn add_ref_delta(&mut self, id: ObjectId, base: ObjectId, delta: &[u8]) -> Result<u64> {
        self.push(id, EntryKind::RefDelta { base }, delta)
    }

    pub fn finish(mut self) -> WrittenPack {
        let count = self.entries.len() as u32;
        self.buf[8..12].copy_from_slice(&count.to_be_bytes());

        let checksum = ObjectId::new(&self.buf);
        self.buf.extend_from_slice(&*checksum);

        let index = PackIndex::write(&mut self.entries, &checksum);
        WrittenPack {
            name: format!("pack-{checksum:x}"),
            pack: self.buf,
            index,
        }
    }
}

impl WrittenPack {
    /// Write `<dir>/<name>.pack` and then `<dir>/<name>.idx`, each atomically.
    ///
    /// The index lands last, so a pack never appears without the data it points into.
    pub fn write_to(&self, dir: &Utf8Path) -> Result<Utf8PathBuf> {
        let pack_path = dir.join(format!("{}.pack", self.name));
        util::write_atomically(&pack_path, "pack", &self.pack)?;
        util::write_atomically(&pack_path.with_extension("idx"), "idx", &self.index)?;
        debug!(pack = %self.name, "Wrote pack");
        Ok(pack_path)
    }
}
