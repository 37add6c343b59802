use thiserror::Error;

use crate::object_id::ObjectId;

/// Failures raised by the object store and the dumb-transport fetch.
///
/// Storage-layer corruption (`InvalidPack`, `CorruptDelta`, `CorruptObject`) is contained by the
/// [`ObjectDatabase`](crate::odb::ObjectDatabase), which falls through to the next source. Fetch
/// failures abort the whole synchronization.
#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("content of {path} does not hash to {expected} (got {actual})")]
    ContentMismatch {
        path: String,
        expected: ObjectId,
        actual: ObjectId,
    },

    #[error("invalid pack {pack}: {reason}")]
    InvalidPack { pack: String, reason: String },

    #[error("corrupt delta at offset {offset} in {pack}: {reason}")]
    CorruptDelta {
        pack: String,
        offset: u64,
        reason: String,
    },

    #[error("corrupt object {id}: {reason}")]
    CorruptObject { id: ObjectId, reason: String },

    #[error("missing object {0}: not available from the remote or any of its alternates")]
    MissingObject(ObjectId),

    #[error("out of memory mapping {len} bytes of {pack}")]
    OutOfMemory {
        pack: String,
        len: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn invalid_pack(pack: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPack {
            pack: pack.into(),
            reason: reason.into(),
        }
    }

    pub fn corrupt_delta(pack: impl Into<String>, offset: u64, reason: impl Into<String>) -> Self {
        Self::CorruptDelta {
            pack: pack.into(),
            offset,
            reason: reason.into(),
        }
    }

    pub fn corrupt_object(id: ObjectId, reason: impl Into<String>) -> Self {
        Self::CorruptObject {
            id,
            reason: reason.into(),
        }
    }

    /// `true` for an absent object, pack, or file. Absence is expected and drives fallback.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// `true` for format or checksum violations confined to a single artifact.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::InvalidPack { .. } | Self::CorruptDelta { .. } | Self::CorruptObject { .. }
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let io = Error::from(std::io::Error::from(std::io::ErrorKind::NotFound));
        assert!(io.is_not_found());
        assert!(!io.is_corruption());

        assert!(Error::NotFound("objects/info/packs".into()).is_not_found());
        assert!(Error::invalid_pack("pack-1", "bad magic").is_corruption());
        assert!(Error::corrupt_delta("pack-1", 12, "cycle").is_corruption());
        assert!(!Error::MissingObject(ObjectId::NULL).is_corruption());
        assert!(!Error::Cancelled.is_not_found());
    }
}
