use std::io::Write;

use camino::Utf8Path;
use rand::{distributions::Alphanumeric, Rng};

use crate::error::Result;

pub fn tmp_file_name(prefix: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();
    format!("tmp_{prefix}_{suffix}")
}

/// Write `bytes` to `path` such that readers either see nothing or the complete file.
///
/// The data goes to a temporary file in the same directory, is synced, and is then renamed over
/// `path`.
pub fn write_atomically(path: &Utf8Path, prefix: &str, bytes: &[u8]) -> Result<()> {
    let dirname = path.parent().unwrap_or_else(|| Utf8Path::new("."));
    if !dirname.is_dir() {
        std::fs::create_dir_all(dirname)?;
    }

    let temp_path = dirname.join(tmp_file_name(prefix));
    let written = (|| -> Result<()> {
        let mut file = std::fs::File::create(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&temp_path, path)?;
        Ok(())
    })();

    if written.is_err() {
        let _ = std::fs::remove_file(&temp_path);
    }
    written
}
