use crate::object::ObjectKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct FileMode(pub u32);

impl std::fmt::Octal for FileMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Octal::fmt(&self.0, f)
    }
}

impl FileMode {
    pub const DIRECTORY: FileMode = FileMode(0o040000);
    pub const EXECUTABLE: FileMode = FileMode(0o100755);
    pub const REGULAR: FileMode = FileMode(0o100644);
    pub const SYMLINK: FileMode = FileMode(0o120000);
    pub const GITLINK: FileMode = FileMode(0o160000);

    const TYPE_MASK: u32 = libc::S_IFMT as u32;

    pub fn is_executable(self) -> bool {
        self.0 & libc::S_IXUSR as u32 != 0
    }

    pub fn is_directory(self) -> bool {
        self.0 & Self::TYPE_MASK == Self::DIRECTORY.0
    }

    /// A submodule commit. These point into another repository and are never fetched.
    pub fn is_gitlink(self) -> bool {
        self.0 & Self::TYPE_MASK == Self::GITLINK.0
    }

    /// The kind of object an entry with this mode refers to.
    pub fn object_kind(self) -> ObjectKind {
        if self.is_directory() {
            ObjectKind::Tree
        } else if self.is_gitlink() {
            ObjectKind::Commit
        } else {
            ObjectKind::Blob
        }
    }
}
