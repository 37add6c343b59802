//! Remote object databases reachable over dumb transports.
//!
//! A dumb transport can only hand out files. Everything the fetch needs is expressed as paths
//! relative to the remote `objects/` directory: `info/packs`, `info/alternates`,
//! `pack/pack-<hex>.{pack,idx}`, and `xx/yyyy...` loose objects.

pub mod http;
pub mod local;

use std::io::Read;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::*;

use crate::cancel::{self, CancelFlag};
use crate::error::Result;

pub use http::HttpRemote;
pub use local::LocalRemote;

pub const INFO_PACKS: &str = "info/packs";
pub const INFO_ALTERNATES: &str = "info/alternates";
pub const INFO_HTTP_ALTERNATES: &str = "info/http-alternates";

static PACK_FILE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^pack-[0-9a-f]{40}\.pack$").unwrap());

/// A readable remote file and its length, if the transport knows it.
pub struct FileStream {
    pub reader: Box<dyn Read + Send>,
    pub length: Option<u64>,
}

impl std::fmt::Debug for FileStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStream")
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

impl FileStream {
    pub fn new(reader: impl Read + Send + 'static, length: Option<u64>) -> Self {
        Self {
            reader: Box::new(reader),
            length,
        }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let length = Some(bytes.len() as u64);
        Self::new(std::io::Cursor::new(bytes), length)
    }

    /// Read the whole stream, checking `cancel` between chunks.
    pub fn into_bytes(mut self, cancel: &CancelFlag) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.length.unwrap_or(0).min(1 << 20) as usize);
        cancel::copy(&mut self.reader, &mut out, cancel)?;
        Ok(out)
    }
}

/// An object database on the far side of a dumb transport.
///
/// Implementations must report a plainly absent file as [`Error::NotFound`], but callers never
/// rely on that alone: every fetched object is hashed and checked.
///
/// [`Error::NotFound`]: crate::error::Error::NotFound
pub trait WalkRemoteObjectDatabase: Send {
    /// Where this database lives. Two connections with equal locations reach the same data.
    fn location(&self) -> &str;

    /// File names (`pack-<hex>.pack`) of the packs this database advertises.
    fn pack_names(&self) -> Result<Vec<String>>;

    /// Locations of alternate databases, relative to this one, each ending in `/`.
    fn alternates(&self) -> Result<Vec<String>>;

    /// Open the file at `path`, relative to the `objects/` directory.
    fn open(&self, path: &str) -> Result<FileStream>;

    /// Connect to the alternate at `location`, resolved against this database.
    fn open_alternate(&self, location: &str) -> Result<Box<dyn WalkRemoteObjectDatabase>>;

    /// Release transport resources. Calling it more than once is harmless.
    fn close(&mut self);
}

/// Read a small text file, or `None` if the remote does not have it.
pub fn read_text(
    remote: &dyn WalkRemoteObjectDatabase,
    path: &str,
    cancel: &CancelFlag,
) -> Result<Option<String>> {
    let stream = match remote.open(path) {
        Ok(stream) => stream,
        Err(e) if e.is_not_found() => return Ok(None),
        Err(e) => return Err(e),
    };
    let bytes = stream.into_bytes(cancel)?;
    Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
}

/// Parse an alternates file: one location per line, each normalized to end in `/`.
pub fn parse_alternates(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| {
            if line.ends_with('/') {
                line.to_owned()
            } else {
                format!("{line}/")
            }
        })
        .collect()
}

/// Read the alternates file at `path`. A missing file means no alternates.
pub fn read_alternates(remote: &dyn WalkRemoteObjectDatabase, path: &str) -> Result<Vec<String>> {
    let alternates = read_text(remote, path, &CancelFlag::new())?
        .map(|text| parse_alternates(&text))
        .unwrap_or_default();
    trace!(remote = remote.location(), ?alternates, "Read alternates");
    Ok(alternates)
}

/// Parse `info/packs`, keeping the `P pack-<hex>.pack` lines.
pub fn parse_info_packs(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| line.strip_prefix("P "))
        .map(str::trim)
        .filter(|name| {
            let valid = is_pack_file_name(name);
            if !valid {
                warn!(name, "Ignoring malformed pack name in info/packs");
            }
            valid
        })
        .map(str::to_owned)
        .collect()
}

/// Read `info/packs`. A missing file means no packs are advertised.
pub fn read_info_packs(remote: &dyn WalkRemoteObjectDatabase) -> Result<Option<Vec<String>>> {
    Ok(read_text(remote, INFO_PACKS, &CancelFlag::new())?.map(|text| parse_info_packs(&text)))
}

/// Whether `name` is a well-formed pack file name. Remote names become local paths, so anything
/// else is refused.
pub fn is_pack_file_name(name: &str) -> bool {
    PACK_FILE_NAME.is_match(name)
}
