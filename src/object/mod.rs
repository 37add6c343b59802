pub mod commit;
pub mod tag;
pub mod tree;

use std::fmt::Display;
use std::io::Write;

use thiserror::Error;

use crate::object_id::ObjectId;

pub use commit::Commit;
pub use tag::Tag;
pub use tree::Tree;

#[derive(Debug, Error)]
#[error("{0}")]
pub struct ParseError(pub String);

impl ParseError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Commit,
    Tree,
    Blob,
    Tag,
}

impl ObjectKind {
    pub fn name(self) -> &'static str {
        match self {
            ObjectKind::Commit => "commit",
            ObjectKind::Tree => "tree",
            ObjectKind::Blob => "blob",
            ObjectKind::Tag => "tag",
        }
    }

    pub fn from_name(name: &[u8]) -> Option<Self> {
        match name {
            b"commit" => Some(ObjectKind::Commit),
            b"tree" => Some(ObjectKind::Tree),
            b"blob" => Some(ObjectKind::Blob),
            b"tag" => Some(ObjectKind::Tag),
            _ => None,
        }
    }

    /// The 3-bit type code used in pack entry headers.
    pub fn pack_code(self) -> u8 {
        match self {
            ObjectKind::Commit => 1,
            ObjectKind::Tree => 2,
            ObjectKind::Blob => 3,
            ObjectKind::Tag => 4,
        }
    }

    pub fn from_pack_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(ObjectKind::Commit),
            2 => Some(ObjectKind::Tree),
            3 => Some(ObjectKind::Blob),
            4 => Some(ObjectKind::Tag),
            _ => None,
        }
    }
}

impl Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for ObjectKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s.as_bytes()).ok_or_else(|| ParseError::new(format!("unknown kind: {s}")))
    }
}

/// An immutable git object: a kind tag plus its payload.
///
/// The identity of an object is the SHA-1 of its canonical serialization,
/// `"{kind} {len}\0{payload}"`.
#[derive(Clone, PartialEq, Eq)]
pub struct Object {
    kind: ObjectKind,
    data: Vec<u8>,
}

impl std::fmt::Debug for Object {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Object")
            .field("kind", &self.kind)
            .field("len", &self.data.len())
            .finish()
    }
}

impl Object {
    pub fn new(kind: ObjectKind, data: Vec<u8>) -> Self {
        Self { kind, data }
    }

    pub fn blob(data: impl Into<Vec<u8>>) -> Self {
        Self::new(ObjectKind::Blob, data.into())
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Returns the object formatted `"{type} {len}\0{data}"`.
    /// e.g.
    /// a blob `"hello\n"` becomes `"blob 6\0hello\n"`
    pub fn formatted(&self) -> Vec<u8> {
        let mut formatted = Vec::with_capacity(self.data.len() + 32);
        formatted.extend_from_slice(self.kind.name().as_bytes());
        formatted.push(b' ');
        formatted.extend_from_slice(format!("{}", self.data.len()).as_bytes());
        formatted.push(b'\0');
        formatted.extend_from_slice(&self.data);
        formatted
    }

    pub fn id(&self) -> ObjectId {
        Self::hash(self.kind, &self.data)
    }

    /// Hash a payload as if it were stored as an object of `kind`, without copying it.
    pub fn hash(kind: ObjectKind, data: &[u8]) -> ObjectId {
        let mut header = Vec::with_capacity(32);
        let _ = write!(header, "{} {}\0", kind, data.len());
        ObjectId::from_parts(&[&header, data])
    }

    /// Parse a decompressed loose object, `"{type} {len}\0{data}"`.
    pub fn parse_formatted(mut bytes: Vec<u8>) -> Result<Self, ParseError> {
        let space_idx = memchr::memchr(b' ', &bytes)
            .ok_or_else(|| ParseError::new("object header has no type separator"))?;
        let nul_idx = memchr::memchr(b'\0', &bytes)
            .ok_or_else(|| ParseError::new("object header is not terminated"))?;
        if nul_idx < space_idx {
            return Err(ParseError::new("object header is malformed"));
        }

        let kind = ObjectKind::from_name(&bytes[..space_idx]).ok_or_else(|| {
            ParseError::new(format!(
                "unknown object type: {}",
                String::from_utf8_lossy(&bytes[..space_idx])
            ))
        })?;

        let len = std::str::from_utf8(&bytes[space_idx + 1..nul_idx])
            .ok()
            .and_then(|len| len.parse::<usize>().ok())
            .ok_or_else(|| ParseError::new("object length is not a decimal number"))?;

        let content_start = nul_idx + 1;
        if bytes.len() - content_start != len {
            return Err(ParseError::new(format!(
                "object declares {len} bytes but holds {}",
                bytes.len() - content_start
            )));
        }

        bytes.drain(0..content_start);
        Ok(Self { kind, data: bytes })
    }

    /// The ids this object directly refers to.
    ///
    /// Commits refer to their tree and parents, trees to their entries (except submodule
    /// commits), tags to their target. Blobs refer to nothing.
    pub fn references(&self) -> Result<Vec<ObjectId>, ParseError> {
        Ok(match self.kind {
            ObjectKind::Blob => Vec::new(),
            ObjectKind::Commit => {
                let commit = Commit::parse(&self.data)?;
                std::iter::once(*commit.tree_id())
                    .chain(commit.parents().iter().copied())
                    .collect()
            }
            ObjectKind::Tree => Tree::parse(&self.data)?
                .entries()
                .iter()
                .filter(|e| !e.mode().is_gitlink())
                .map(|e| *e.oid())
                .collect(),
            ObjectKind::Tag => vec![*Tag::parse(&self.data)?.object()],
        })
    }

    pub fn pretty_print(&self) -> std::io::Result<()> {
        let mut stdout = std::io::stdout().lock();
        match self.kind {
            ObjectKind::Tree => match Tree::parse(&self.data) {
                Ok(tree) => tree.pretty_print(&mut stdout)?,
                Err(e) => return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
            },
            // Commits and tags are already human readable
            _ => stdout.write_all(&self.data)?,
        }
        stdout.flush()
    }
}
