use std::fs::File;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::*;
use walkdir::WalkDir;

use super::{FileStream, WalkRemoteObjectDatabase, INFO_ALTERNATES};
use crate::error::{Error, Result};

/// A repository on a locally mounted filesystem, read as if it were a dumb server.
#[derive(Debug)]
pub struct LocalRemote {
    objects_dir: Utf8PathBuf,
    location: String,
    closed: bool,
}

impl LocalRemote {
    /// Connect to the objects directory `objects_dir`. A repository root or its `.git` directory
    /// is accepted too.
    pub fn new(path: impl AsRef<Utf8Path>) -> Result<Self> {
        let path = path.as_ref();
        let objects_dir = [path.join(".git/objects"), path.join("objects")]
            .into_iter()
            .find(|candidate| candidate.is_dir())
            .unwrap_or_else(|| path.to_owned());
        if !objects_dir.is_dir() {
            return Err(Error::NotFound(format!("object directory {objects_dir}")));
        }

        let location = objects_dir
            .canonicalize_utf8()
            .unwrap_or_else(|_| objects_dir.clone())
            .into_string();
        debug!(%location, "Connected to local remote");
        Ok(Self {
            objects_dir,
            location,
            closed: false,
        })
    }

    fn path(&self, path: &str) -> Utf8PathBuf {
        self.objects_dir.join(path)
    }

    /// List `pack/` directly, for repositories that never ran `update-server-info`.
    fn list_pack_dir(&self) -> Result<Vec<String>> {
        let dir = self.path("pack");
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in WalkDir::new(&dir).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|e| Error::Io(e.into()))?;
            let name = entry.file_name().to_string_lossy();
            if super::is_pack_file_name(&name) {
                names.push(name.into_owned());
            }
        }
        names.sort();
        Ok(names)
    }
}

impl WalkRemoteObjectDatabase for LocalRemote {
    fn location(&self) -> &str {
        &self.location
    }

    fn pack_names(&self) -> Result<Vec<String>> {
        match super::read_info_packs(self)? {
            Some(names) => Ok(names),
            None => self.list_pack_dir(),
        }
    }

    fn alternates(&self) -> Result<Vec<String>> {
        super::read_alternates(self, INFO_ALTERNATES)
    }

    fn open(&self, path: &str) -> Result<FileStream> {
        let path = self.path(path);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(path.into_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let length = file.metadata().ok().map(|m| m.len());
        Ok(FileStream::new(file, length))
    }

    fn open_alternate(&self, location: &str) -> Result<Box<dyn WalkRemoteObjectDatabase>> {
        Ok(Box::new(LocalRemote::new(self.objects_dir.join(location))?))
    }

    fn close(&mut self) {
        if !self.closed {
            trace!(location = %self.location, "Closing local remote");
            self.closed = true;
        }
    }
}
