use std::io::Read;
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use tracing::*;
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::object::{Object, ParseError};
use crate::object_id::ObjectId;
use crate::util;

/// Objects stored one per file, zlib-compressed, under `xx/yyyy...` paths derived from their id.
pub struct LooseObjectStore {
    root: Utf8PathBuf,
}

impl LooseObjectStore {
    pub fn new(objects_dir: impl AsRef<Utf8Path>) -> Self {
        Self {
            root: objects_dir.as_ref().to_owned(),
        }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn object_path(&self, oid: &ObjectId) -> Utf8PathBuf {
        self.root.join(oid.loose_path())
    }

    pub fn has(&self, oid: &ObjectId) -> bool {
        self.object_path(oid).is_file()
    }

    /// Compress and store `obj`, returning its id.
    ///
    /// Storing an object that is already present is a no-op.
    pub fn put(&self, obj: &Object) -> Result<ObjectId> {
        let oid = obj.id();
        let object_path = self.object_path(&oid);

        if object_path.exists() {
            trace!(%oid, "Object already stored");
            return Ok(oid);
        }

        trace!(%oid, kind = %obj.kind(), "Writing loose object");
        let content = obj.formatted();
        let mut e = ZlibEncoder::new(Vec::with_capacity(content.len() / 2), Compression::fast());
        e.write_all(&content)?;
        let compressed_bytes = e.finish()?;

        util::write_atomically(&object_path, "obj", &compressed_bytes)?;

        Ok(oid)
    }

    /// Read the still-compressed bytes of an object.
    pub fn read_raw(&self, oid: &ObjectId) -> Result<Vec<u8>> {
        match std::fs::read(self.object_path(oid)) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("loose object {oid}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Load and validate an object. The content must hash back to `oid`.
    pub fn get(&self, oid: &ObjectId) -> Result<Object> {
        trace!(%oid, "Reading loose object");
        let compressed = self.read_raw(oid)?;

        let object =
            decode_loose(&compressed).map_err(|e| Error::corrupt_object(*oid, e.to_string()))?;

        let actual = object.id();
        if actual != *oid {
            return Err(Error::corrupt_object(
                *oid,
                format!("content hashes to {actual}"),
            ));
        }

        Ok(object)
    }

    /// Every loose object id present on disk.
    pub fn ids(&self) -> Result<Vec<ObjectId>> {
        let mut ids = Vec::new();
        if !self.root.is_dir() {
            return Ok(ids);
        }

        for entry in WalkDir::new(&self.root).min_depth(2).max_depth(2) {
            let entry = entry.map_err(|e| Error::Io(e.into()))?;
            let Some(dir) = entry.path().parent().and_then(|p| p.file_name()) else {
                continue;
            };
            let hex = format!(
                "{}{}",
                dir.to_string_lossy(),
                entry.file_name().to_string_lossy()
            );
            if let Ok(oid) = hex.parse() {
                ids.push(oid);
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// Enough for `commit `, a 20 digit length and the NUL.
const MAX_HEADER_LEN: u64 = 32;

/// Inflate and parse loose object bytes. The id is not checked.
///
/// Inflation stops one byte past the length the header declares, so content that inflates to
/// far more than it claims is rejected without being held in memory.
pub fn decode_loose(compressed: &[u8]) -> Result<Object, ParseError> {
    let inflate_error = |e: std::io::Error| ParseError::new(format!("inflate failed: {e}"));
    let mut d = ZlibDecoder::new(compressed);
    let mut decompressed = Vec::new();
    d.by_ref()
        .take(MAX_HEADER_LEN)
        .read_to_end(&mut decompressed)
        .map_err(inflate_error)?;

    let nul = memchr::memchr(b'\0', &decompressed)
        .ok_or_else(|| ParseError::new("object header is not terminated"))?;
    let declared = std::str::from_utf8(&decompressed[..nul])
        .ok()
        .and_then(|header| header.split_once(' '))
        .and_then(|(_, len)| len.parse::<u64>().ok())
        .ok_or_else(|| ParseError::new("object length is not a decimal number"))?;

    let limit = (nul as u64 + 1).saturating_add(declared).saturating_add(1);
    d.take(limit.saturating_sub(decompressed.len() as u64))
        .read_to_end(&mut decompressed)
        .map_err(inflate_error)?;
    Object::parse_formatted(decompressed)
}
