use std::cmp::Ordering;
use std::io::Write;

use super::{Object, ObjectKind, ParseError};
use crate::filemode::FileMode;
use crate::object_id::ObjectId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    mode: FileMode,
    name: Vec<u8>,
    oid: ObjectId,
}

impl TreeEntry {
    pub fn new(mode: FileMode, name: impl Into<Vec<u8>>, oid: ObjectId) -> Self {
        Self {
            mode,
            name: name.into(),
            oid,
        }
    }

    pub fn mode(&self) -> FileMode {
        self.mode
    }

    pub fn name(&self) -> &[u8] {
        &self.name
    }

    pub fn oid(&self) -> &ObjectId {
        &self.oid
    }

    /// Parses one entry from the front of `bytes`. Entries are of the form
    /// `<mode> <name>\0<oid>`. Returns the entry and the remaining bytes.
    fn parse(bytes: &[u8]) -> Result<(Self, &[u8]), ParseError> {
        let mode_len = memchr::memchr(b' ', bytes)
            .ok_or_else(|| ParseError::new("tree entry has no mode"))?;
        let mode = std::str::from_utf8(&bytes[..mode_len])
            .ok()
            .and_then(|mode| u32::from_str_radix(mode, 8).ok())
            .ok_or_else(|| ParseError::new("tree entry mode is not octal"))?;

        let rest = &bytes[mode_len + 1..];
        let nul_idx =
            memchr::memchr(b'\0', rest).ok_or_else(|| ParseError::new("tree entry has no name"))?;
        let name = rest[..nul_idx].to_vec();

        let rest = &rest[nul_idx + 1..];
        let oid = ObjectId::from_slice(rest)
            .ok_or_else(|| ParseError::new("tree entry id is truncated"))?;

        Ok((
            Self {
                mode: FileMode(mode),
                name,
                oid,
            },
            &rest[ObjectId::LEN..],
        ))
    }

    /// Git sorts tree entries as though directory names had a trailing `/`.
    fn sort_cmp(&self, other: &Self) -> Ordering {
        let key = |e: &Self| {
            let suffix: &[u8] = if e.mode.is_directory() { b"/" } else { b"" };
            e.name.iter().chain(suffix).copied().collect::<Vec<u8>>()
        };
        key(self).cmp(&key(other))
    }
}

#[derive(Debug, Clone, Default)]
pub struct Tree {
    entries: Vec<TreeEntry>,
}

impl Tree {
    pub fn new(mut entries: Vec<TreeEntry>) -> Self {
        entries.sort_by(TreeEntry::sort_cmp);
        Self { entries }
    }

    pub fn parse(mut bytes: &[u8]) -> Result<Self, ParseError> {
        let mut entries = Vec::new();

        while !bytes.is_empty() {
            let (entry, rest) = TreeEntry::parse(bytes)?;
            entries.push(entry);
            bytes = rest;
        }

        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[TreeEntry] {
        &self.entries
    }

    pub fn to_object(&self) -> Object {
        let mut data = Vec::new();
        for entry in &self.entries {
            data.extend_from_slice(format!("{:o}", entry.mode).as_bytes());
            data.push(b' ');
            data.extend_from_slice(&entry.name);
            data.push(b'\0');
            data.extend_from_slice(&*entry.oid);
        }
        Object::new(ObjectKind::Tree, data)
    }

    pub fn pretty_print(&self, out: &mut impl Write) -> std::io::Result<()> {
        for entry in &self.entries {
            writeln!(
                out,
                "{:06o} {} {}\t{}",
                entry.mode,
                entry.mode.object_kind(),
                entry.oid,
                String::from_utf8_lossy(&entry.name)
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn test_tree_roundtrip_and_references() {
        let blob = Object::blob("hello\n").id();
        let sub = Tree::new(vec![TreeEntry::new(FileMode::REGULAR, "inner", blob)])
            .to_object()
            .id();
        let module = ObjectId::from_str("14a9d8464caef987f3b5c3cf26f56db825459abd").unwrap();

        let tree = Tree::new(vec![
            TreeEntry::new(FileMode::REGULAR, "file1", blob),
            TreeEntry::new(FileMode::DIRECTORY, "dir", sub),
            TreeEntry::new(FileMode::GITLINK, "module", module),
        ]);
        let object = tree.to_object();

        let parsed = Tree::parse(object.data()).unwrap();
        assert_eq!(parsed.entries(), tree.entries());
        assert_eq!(parsed.entries()[0].name(), b"dir");

        // Submodule commits live in another repository
        assert_eq!(object.references().unwrap(), vec![sub, blob]);
    }

    #[test]
    fn test_entry_encoding() {
        let blob = Object::blob("hello\n").id();
        let tree = Tree::new(vec![TreeEntry::new(FileMode::REGULAR, "file1", blob)]);
        let object = tree.to_object();
        assert!(object.data().starts_with(b"100644 file1\0"));
        assert_eq!(object.data().len(), "100644 file1\0".len() + 20);
    }

    #[test]
    fn test_directory_sort_order() {
        let id = ObjectId::NULL;
        let tree = Tree::new(vec![
            TreeEntry::new(FileMode::DIRECTORY, "foo", id),
            TreeEntry::new(FileMode::REGULAR, "foo.c", id),
            TreeEntry::new(FileMode::REGULAR, "foo0", id),
        ]);
        let names: Vec<_> = tree.entries().iter().map(|e| e.name().to_vec()).collect();
        // "foo/" sorts after "foo.c" but before "foo0"
        assert_eq!(names, vec![b"foo.c".to_vec(), b"foo".to_vec(), b"foo0".to_vec()]);
    }

    #[test]
    fn test_truncated_tree_is_rejected() {
        assert!(Tree::parse(b"100644 file\0abc").is_err());
        assert!(Tree::parse(b"100644 file").is_err());
        assert!(Tree::parse(b"10x644 file\0aaaaaaaaaaaaaaaaaaaa").is_err());
    }
}
