use std::io::Write;

use camino::Utf8Path;
use color_eyre::eyre::{eyre, Context};
use tracing::*;
use walkdir::WalkDir;

use crate::lock::LockedFile;
use crate::object_id::ObjectId;
use crate::Result;

/// Contains all characters that cannot appear in a ref name.
///
/// In git, the character `'*'` is allowed in ref names if the environment variable
/// `REFNAME_REFSPEC_PATTERN` is set. Rit does not allow this, so `'*'` appears in this array.
///
/// See: <https://github.com/git/git/blob/795ea8776befc95ea2becd8020c7a284677b4161/refs.c#L48-L57>
const DISALLOWED_CHARACTERS: [char; 40] = [
    '\x01', '\x02', '\x03', '\x04', '\x05', '\x06', '\x07', '\x08', '\t', '\n', '\x0b', '\x0c',
    '\r', '\x0e', '\x0f', '\x10', '\x11', '\x12', '\x13', '\x14', '\x15', '\x16', '\x17', '\x18',
    '\x19', '\x1a', '\x1b', '\x1c', '\x1d', '\x1e', '\x1f', ' ', '*', ':', '?', '[', '\\', '^',
    '~', '\x7f',
];

/// Symbolic refs are followed at most this many times.
const MAX_SYMREF_DEPTH: usize = 5;

/// Check whether a string is a valid ref name.
///
/// Disallowed paths are any path where:
///
/// - it (or any path component) begins with `'.'`
/// - it contains double dots `".."`
/// - it contains ASCII control characters
/// - it contains ':', '?', '[', '\', '^', '~', SP, or TAB anywhere
/// - it contains `'*'`
/// - it ends with `'/'`
/// - it ends with `".lock"`
/// - it contains `"@{"`
///
/// See: <https://github.com/git/git/blob/795ea8776befc95ea2becd8020c7a284677b4161/refs.c#L59-L77>
pub fn is_valid_ref_name(name: &str) -> bool {
    !(name.is_empty()
        || (name.chars().any(|c| DISALLOWED_CHARACTERS.contains(&c)))
        || name.starts_with('.')
        || name.contains("/.")
        || name.contains("..")
        || name.ends_with('/')
        || name.ends_with(".lock")
        || name.contains("@{"))
}

/// `main` -> `refs/heads/main`; names already under `refs/` are kept.
pub fn full_ref_name(name: &str) -> String {
    if name.starts_with("refs/") {
        name.to_owned()
    } else {
        format!("refs/heads/{name}")
    }
}

impl super::Repo {
    /// Resolve `name` (`HEAD`, `refs/heads/main`, ...) to an id, following symbolic refs.
    /// `None` if the ref does not exist yet.
    pub fn read_ref(&self, name: &str) -> Result<Option<ObjectId>> {
        let mut name = name.to_owned();
        for _ in 0..MAX_SYMREF_DEPTH {
            let path = self.git_dir.join(&name);
            if !path.is_file() {
                return Ok(None);
            }
            let content = std::fs::read_to_string(&path)?;
            let content = content.trim();
            match content.strip_prefix("ref: ") {
                Some(target) => name = target.to_owned(),
                None => {
                    let oid = content
                        .parse()
                        .wrap_err_with(|| format!("Invalid value in {name}"))?;
                    return Ok(Some(oid));
                }
            }
        }
        Err(eyre!("Too many levels of symbolic refs at {name}"))
    }

    pub fn read_head(&self) -> Result<Option<ObjectId>> {
        self.read_ref("HEAD")
    }

    /// Point the branch or ref `name` at `oid`.
    pub fn update_ref(&self, name: &str, oid: &ObjectId) -> Result<()> {
        let name = full_ref_name(name);
        if !is_valid_ref_name(&name) {
            return Err(eyre!("Invalid ref name: {}", name));
        }
        self.update_ref_file(&self.git_dir.join(&name), oid)?;
        info!(%name, %oid, "Updated ref");
        Ok(())
    }

    fn update_ref_file(&self, path: &Utf8Path, oid: &ObjectId) -> Result<()> {
        let mut file = LockedFile::try_acquire(path)?
            .ok_or_else(|| eyre!("Could not acquire lock file `{}.lock`", path))?;
        writeln!(&mut *file, "{oid:x}")?;
        file.commit()?;
        Ok(())
    }

    /// Every id the local refs point at: `HEAD` and each branch.
    pub fn haves(&self) -> Result<Vec<ObjectId>> {
        let mut haves: Vec<ObjectId> = self.read_head()?.into_iter().collect();
        if self.heads_path.is_dir() {
            for entry in WalkDir::new(&self.heads_path).min_depth(1) {
                let entry = entry?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let Ok(relative) = entry.path().strip_prefix(&self.git_dir) else {
                    continue;
                };
                let name = relative.to_string_lossy();
                match self.read_ref(&name) {
                    Ok(Some(oid)) => haves.push(oid),
                    Ok(None) => {}
                    Err(e) => warn!(%name, error = %e, "Ignoring unreadable ref"),
                }
            }
        }
        haves.sort();
        haves.dedup();
        Ok(haves)
    }
}
