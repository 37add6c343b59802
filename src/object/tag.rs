use super::commit::parse_hex;
use super::{Object, ObjectKind, ParseError};
use crate::object_id::ObjectId;

/// An annotated tag. Only the fields needed to walk the object graph are kept.
#[derive(Debug, Clone)]
pub struct Tag {
    object: ObjectId,
    kind: ObjectKind,
    name: String,
}

impl Tag {
    pub fn object(&self) -> &ObjectId {
        &self.object
    }

    pub fn target_kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parse a decompressed tag payload.
    ///
    /// ## Example
    /// ```text
    /// object 090c4c5dd61d2e84c832c4cd306b66bf2fabc1f5
    /// type commit
    /// tag v1.0
    /// tagger Jamie Quigley <jamie@quigley.xyz> 1658312219 +0100
    ///
    /// Release 1.0
    /// ```
    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        let mut object = None;
        let mut kind = None;
        let mut name = None;

        for line in bytes.split(|b| *b == b'\n') {
            if line.is_empty() {
                break;
            }
            if let Some(rest) = line.strip_prefix(b"object ") {
                object = Some(parse_hex(rest)?);
            } else if let Some(rest) = line.strip_prefix(b"type ") {
                kind = Some(ObjectKind::from_name(rest).ok_or_else(|| {
                    ParseError::new(format!(
                        "tag has unknown target type: {}",
                        String::from_utf8_lossy(rest)
                    ))
                })?);
            } else if let Some(rest) = line.strip_prefix(b"tag ") {
                name = Some(String::from_utf8_lossy(rest).into_owned());
            }
        }

        Ok(Self {
            object: object.ok_or_else(|| ParseError::new("tag has no object"))?,
            kind: kind.ok_or_else(|| ParseError::new("tag has no type"))?,
            name: name.unwrap_or_default(),
        })
    }

    pub fn to_object(&self, tagger: &super::commit::Signature, message: &str) -> Object {
        let data = format!(
            "object {:x}\ntype {}\ntag {}\ntagger {}\n\n{}",
            self.object, self.kind, self.name, tagger, message
        );
        Object::new(ObjectKind::Tag, data.into_bytes())
    }

    pub fn new(object: ObjectId, kind: ObjectKind, name: impl Into<String>) -> Self {
        Self {
            object,
            kind,
            name: name.into(),
        }
    }
}
