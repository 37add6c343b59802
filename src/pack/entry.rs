use crate::object::ObjectKind;
use crate::object_id::ObjectId;

pub const OFS_DELTA: u8 = 6;
pub const REF_DELTA: u8 = 7;

/// Longest possible header: type/size byte, 9 size continuation bytes, and a 20 byte base id
/// (or 10 offset bytes).
pub const MAX_HEADER_LEN: usize = 1 + 9 + 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Full(ObjectKind),
    /// Delta against the record `distance` bytes before this one.
    OfsDelta { distance: u64 },
    /// Delta against the object with this id, which may live anywhere.
    RefDelta { base: ObjectId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHeader {
    pub kind: EntryKind,
    /// Inflated size of the payload. For deltas this is the size of the delta itself.
    pub size: u64,
    /// Bytes taken by the header, i.e. where the compressed payload begins.
    pub len: usize,
}

impl EntryHeader {
    /// Parse the header of the record starting at `bytes[0]`.
    pub fn parse(bytes: &[u8]) -> Result<Self, String> {
        let mut pos = 0;
        let mut next = || {
            let b = bytes.get(pos).copied().ok_or("entry header is truncated");
            pos += 1;
            b
        };

        let mut c = next()?;
        let code = (c >> 4) & 0x7;
        let mut size = u64::from(c & 0x0f);
        let mut shift = 4;
        while c & 0x80 != 0 {
            c = next()?;
            if shift > 57 {
                return Err("entry size overflows".into());
            }
            size |= u64::from(c & 0x7f) << shift;
            shift += 7;
        }

        let kind = match code {
            OFS_DELTA => {
                let mut c = next()?;
                let mut distance = u64::from(c & 0x7f);
                while c & 0x80 != 0 {
                    c = next()?;
                    distance = distance
                        .checked_add(1)
                        .and_then(|d| d.checked_mul(128))
                        .ok_or("delta base offset overflows")?
                        + u64::from(c & 0x7f);
                }
                EntryKind::OfsDelta { distance }
            }
            REF_DELTA => {
                let start = pos;
                pos += ObjectId::LEN;
                let base = bytes
                    .get(start..pos)
                    .and_then(ObjectId::from_slice)
                    .ok_or("delta base id is truncated")?;
                EntryKind::RefDelta { base }
            }
            code => EntryKind::Full(
                ObjectKind::from_pack_code(code)
                    .ok_or_else(|| format!("invalid entry type {code}"))?,
            ),
        };

        Ok(Self {
            kind,
            size,
            len: pos,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let code = match self.kind {
            EntryKind::Full(kind) => kind.pack_code(),
            EntryKind::OfsDelta { .. } => OFS_DELTA,
            EntryKind::RefDelta { .. } => REF_DELTA,
        };

        let mut out = Vec::with_capacity(MAX_HEADER_LEN);
        let mut size = self.size;
        let mut c = (code << 4) | (size & 0x0f) as u8;
        size >>= 4;
        while size != 0 {
            out.push(c | 0x80);
            c = (size & 0x7f) as u8;
            size >>= 7;
        }
        out.push(c);

        match self.kind {
            EntryKind::Full(_) => {}
            EntryKind::OfsDelta { distance } => {
                let mut buf = [0u8; 10];
                let mut i = buf.len() - 1;
                let mut d = distance;
                buf[i] = (d & 0x7f) as u8;
                d >>= 7;
                while d != 0 {
                    d -= 1;
                    i -= 1;
                    buf[i] = 0x80 | (d & 0x7f) as u8;
                    d >>= 7;
                }
                out.extend_from_slice(&buf[i..]);
            }
            EntryKind::RefDelta { base } => out.extend_from_slice(&*base),
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_headers() {
        // A 6 byte blob fits in one byte
        let h = EntryHeader::parse(&[0x36]).unwrap();
        assert_eq!(h.kind, EntryKind::Full(ObjectKind::Blob));
        assert_eq!(h.size, 6);
        assert_eq!(h.len, 1);

        // 0x95 0x0a: commit, size 5 | (10 << 4) = 165
        let h = EntryHeader::parse(&[0x95, 0x0a]).unwrap();
        assert_eq!(h.kind, EntryKind::Full(ObjectKind::Commit));
        assert_eq!(h.size, 165);

        // Offset 128 is encoded as [0x80, 0x00]
        let h = EntryHeader::parse(&[0x63, 0x80, 0x00]).unwrap();
        assert_eq!(h.kind, EntryKind::OfsDelta { distance: 128 });
        assert_eq!(h.len, 3);
    }

    #[test]
    fn test_encode_matches_parse() {
        let base = ObjectId::new(b"base");
        for header in [
            EntryHeader {
                kind: EntryKind::Full(ObjectKind::Tree),
                size: 1 << 40,
                len: 0,
            },
            EntryHeader {
                kind: EntryKind::OfsDelta { distance: 16511 },
                size: 300,
                len: 0,
            },
            EntryHeader {
                kind: EntryKind::RefDelta { base },
                size: 0,
                len: 0,
            },
        ] {
            let bytes = header.encode();
            let parsed = EntryHeader::parse(&bytes).unwrap();
            assert_eq!(parsed.kind, header.kind);
            assert_eq!(parsed.size, header.size);
            assert_eq!(parsed.len, bytes.len());
        }
    }

    #[test]
    fn test_bad_headers() {
        assert!(EntryHeader::parse(&[]).is_err());
        assert!(EntryHeader::parse(&[0x80 | 0x30]).is_err());
        assert!(EntryHeader::parse(&[0x50]).is_err());
        assert!(EntryHeader::parse(&[0x70, 1, 2, 3]).is_err());
    }
}
