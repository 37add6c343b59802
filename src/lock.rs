use std::fs::File;
use std::io::{ErrorKind, Write};
use std::ops::{Deref, DerefMut};

use camino::{Utf8Path, Utf8PathBuf};
use tracing::*;

use crate::error::Result;

/// Exclusive write access to `path` through `path.lock`.
///
/// The new content is written to the lock file and replaces `path` on [`LockedFile::commit`].
/// Dropping an uncommitted lock removes it and leaves `path` untouched.
pub struct LockedFile {
    guarded_path: Utf8PathBuf,
    lock_path: Utf8PathBuf,
    lockfile: Option<File>,
}

impl Deref for LockedFile {
    type Target = File;

    fn deref(&self) -> &Self::Target {
        // Only `commit` takes the file, and it consumes `self`
        self.lockfile.as_ref().unwrap_or_else(|| unreachable!())
    }
}
impl DerefMut for LockedFile {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.lockfile.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl LockedFile {
    /// Take the lock, or `None` if someone else holds it.
    pub fn try_acquire(path: impl AsRef<Utf8Path>) -> Result<Option<Self>> {
        let path = path.as_ref();
        let lock_path = Utf8PathBuf::from(format!("{path}.lock"));
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        match File::options()
            .write(true)
            .create_new(true)
            .open(&lock_path)
        {
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e.into()),
            Ok(lockfile) => Ok(Some(Self {
                guarded_path: path.to_owned(),
                lock_path,
                lockfile: Some(lockfile),
            })),
        }
    }

    /// Flush the new content and move it over the guarded path.
    pub fn commit(mut self) -> Result<()> {
        if let Some(mut file) = self.lockfile.take() {
            file.flush()?;
            file.sync_all()?;
        }
        std::fs::rename(&self.lock_path, &self.guarded_path)?;
        Ok(())
    }
}

impl Drop for LockedFile {
    fn drop(&mut self) {
        if self.lockfile.is_some() {
            trace!(path = %self.lock_path, "Abandoning lock");
            let _ = std::fs::remove_file(&self.lock_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn test_lock_commit_and_abandon() -> Result<()> {
        let tmp = TempDir::new("")?;
        let path = Utf8Path::from_path(tmp.path()).unwrap().join("info/packs");

        let mut lock = LockedFile::try_acquire(&path)?.unwrap();
        assert!(LockedFile::try_acquire(&path)?.is_none());
        writeln!(&mut *lock, "P pack-1.pack")?;
        lock.commit()?;
        assert_eq!(std::fs::read_to_string(&path)?, "P pack-1.pack\n");

        let mut lock = LockedFile::try_acquire(&path)?.unwrap();
        writeln!(&mut *lock, "discarded")?;
        drop(lock);
        assert_eq!(std::fs::read_to_string(&path)?, "P pack-1.pack\n");
        assert!(LockedFile::try_acquire(&path)?.is_some());
        Ok(())
    }
}
