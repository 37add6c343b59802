use std::io::Write;

use tracing::*;

use crate::error::Result;
use crate::lock::LockedFile;
use crate::odb::ObjectDatabase;
use crate::remote::INFO_PACKS;

/// Rewrite `objects/info/packs` from the packs `db` has open, so the repository can be served
/// over a dumb transport.
pub fn update(db: &ObjectDatabase) -> Result<()> {
    let path = db.objects_dir().join(INFO_PACKS);
    let mut lock = LockedFile::try_acquire(&path)?.ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::WouldBlock,
            format!("{path}.lock exists; is another process updating it?"),
        )
    })?;

    let mut names: Vec<String> = db.packs().iter().map(|p| p.name().to_owned()).collect();
    names.sort();
    for name in &names {
        writeln!(&mut *lock, "P {name}.pack")?;
    }
    writeln!(&mut *lock)?;
    lock.commit()?;

    debug!(packs = names.len(), "Updated {INFO_PACKS}");
    Ok(())
}
