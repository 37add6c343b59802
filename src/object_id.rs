use std::{
    fmt::{Debug, Display, LowerHex},
    ops::Deref,
    str::FromStr,
};

use hex::FromHexError;
use sha1::{Digest as _, Sha1};

#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ObjectId(pub [u8; 20]);

impl ObjectId {
    pub const LEN: usize = 20;

    /// The null id, 0x00000...
    pub const NULL: Self = ObjectId([0; 20]);
}

impl ObjectId {
    /// Hash the input bytes and return the resulting id.
    pub fn new(bytes: &[u8]) -> Self {
        Self::from_parts(&[bytes])
    }

    /// Hash several byte slices as though they were one contiguous input.
    pub fn from_parts(parts: &[&[u8]]) -> Self {
        let mut hasher = Sha1::new();
        for part in parts {
            hasher.update(part);
        }
        let mut raw = [0; 20];
        raw.copy_from_slice(&hasher.finalize());
        Self(raw)
    }

    /// Read an id from the first 20 bytes of `bytes`.
    ///
    /// Returns `None` if `bytes` is too short.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let raw: [u8; 20] = bytes.get(..Self::LEN)?.try_into().ok()?;
        Some(Self(raw))
    }

    /// Format the id as a hex string.
    ///
    /// Identical to `format!("{:x}", self)`.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// The first byte, used to select a fan-out bucket in a pack index.
    pub fn first_byte(&self) -> u8 {
        self.0[0]
    }

    /// Path of the loose object relative to an objects directory, e.g.
    /// `ce/013625030ba8dba906f756967f9e9ca394464a`.
    pub fn loose_path(&self) -> String {
        let hex = self.to_hex();
        let (prefix, suffix) = hex.split_at(2);
        format!("{prefix}/{suffix}")
    }
}

impl Deref for ObjectId {
    type Target = [u8; 20];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl LowerHex for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Debug for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

impl FromStr for ObjectId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        let raw: [u8; 20] = bytes
            .try_into()
            .map_err(|_| FromHexError::InvalidStringLength)?;
        Ok(ObjectId(raw))
    }
}
