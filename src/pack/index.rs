use std::ops::Range;

use once_cell::sync::OnceCell;
use tracing::*;

use crate::error::{Error, Result};
use crate::object_id::ObjectId;

const V2_MAGIC: &[u8; 4] = b"\xfftOc";
const FANOUT_LEN: usize = 256 * 4;
const LARGE_OFFSET_FLAG: u32 = 0x8000_0000;

/// The sorted lookup table of a pack.
///
/// Layout (version 2):
/// - `\377tOc`, version
/// - Fan-out table: 256 cumulative counts of ids whose first byte is `<=` the slot
/// - Sorted id array
/// - CRC-32 array (parallel)
/// - 31-bit offset array (parallel), the high bit selects an entry of the 64-bit table
/// - 64-bit offset table
/// - Pack checksum, index checksum
///
/// Version 1 indexes (fan-out followed by `(offset, id)` pairs, no CRCs) are read too.
#[derive(Debug)]
pub struct PackIndex {
    fan_out: [u32; 256],
    ids: Vec<ObjectId>,
    crcs: Option<Vec<u32>>,
    offsets: Vec<u64>,
    pack_checksum: ObjectId,
    sorted_offsets: OnceCell<Vec<u64>>,
}

fn be_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn be_u64(bytes: &[u8], at: usize) -> u64 {
    (u64::from(be_u32(bytes, at)) << 32) | u64::from(be_u32(bytes, at + 4))
}

impl PackIndex {
    /// Parse and validate an index file. `name` is only used in error messages.
    pub fn parse(name: &str, data: &[u8]) -> Result<Self> {
        let invalid = |reason: &str| Error::invalid_pack(format!("{name}.idx"), reason);

        if data.len() < FANOUT_LEN + 40 {
            return Err(invalid("index is truncated"));
        }

        let (body, trailer) = data.split_at(data.len() - 20);
        if ObjectId::new(body) != ObjectId::from_slice(trailer).unwrap_or_default() {
            return Err(invalid("index checksum mismatch"));
        }

        let (version, fan_out_start) = if data.starts_with(V2_MAGIC) {
            (be_u32(data, 4), 8)
        } else {
            (1, 0)
        };

        let mut fan_out = [0u32; 256];
        for (i, slot) in fan_out.iter_mut().enumerate() {
            *slot = be_u32(data, fan_out_start + i * 4);
        }
        if fan_out.windows(2).any(|w| w[0] > w[1]) {
            return Err(invalid("fan-out table is not monotonic"));
        }
        let count = fan_out[255] as usize;
        let mut pos = fan_out_start + FANOUT_LEN;

        let (ids, crcs, offsets) = match version {
            1 => {
                if data.len() < pos + count * 24 + 40 {
                    return Err(invalid("index is truncated"));
                }
                let mut ids = Vec::with_capacity(count);
                let mut offsets = Vec::with_capacity(count);
                for _ in 0..count {
                    offsets.push(u64::from(be_u32(data, pos)));
                    ids.push(ObjectId::from_slice(&data[pos + 4..]).unwrap_or_default());
                    pos += 24;
                }
                (ids, None, offsets)
            }
            2 => {
                if data.len() < pos + count * 28 + 40 {
                    return Err(invalid("index is truncated"));
                }
                let ids: Vec<ObjectId> = data[pos..pos + count * 20]
                    .chunks_exact(20)
                    .filter_map(ObjectId::from_slice)
                    .collect();
                pos += count * 20;

                let crcs = (0..count).map(|i| be_u32(data, pos + i * 4)).collect();
                pos += count * 4;

                let small: Vec<u32> = (0..count).map(|i| be_u32(data, pos + i * 4)).collect();
                pos += count * 4;

                let large_start = pos;
                let large_count = (data.len() - 40 - large_start) / 8;
                let mut offsets = Vec::with_capacity(count);
                for raw in small {
                    if raw & LARGE_OFFSET_FLAG == 0 {
                        offsets.push(u64::from(raw));
                    } else {
                        let slot = (raw & !LARGE_OFFSET_FLAG) as usize;
                        if slot >= large_count {
                            return Err(invalid("large offset slot out of range"));
                        }
                        offsets.push(be_u64(data, large_start + slot * 8));
                    }
                }
                (ids, Some(crcs), offsets)
            }
            v => return Err(invalid(&format!("unsupported index version {v}"))),
        };

        if ids.windows(2).any(|w| w[0] >= w[1]) {
            return Err(invalid("ids are not sorted"));
        }
        for (i, id) in ids.iter().enumerate() {
            let bucket = id.first_byte() as usize;
            let lo = if bucket == 0 { 0 } else { fan_out[bucket - 1] as usize };
            if i < lo || i >= fan_out[bucket] as usize {
                return Err(invalid("id is outside its fan-out bucket"));
            }
        }

        let pack_checksum =
            ObjectId::from_slice(&data[data.len() - 40..]).unwrap_or_default();

        trace!(name, version, count, "Parsed pack index");

        Ok(Self {
            fan_out,
            ids,
            crcs,
            offsets,
            pack_checksum,
            sorted_offsets: OnceCell::new(),
        })
    }

    /// Narrow the search to the ids sharing `id`'s first byte, then binary search within them.
    fn position(&self, id: &ObjectId) -> Option<usize> {
        let bucket = id.first_byte() as usize;
        let start = if bucket == 0 {
            0
        } else {
            self.fan_out[bucket - 1] as usize
        };
        let end = self.fan_out[bucket] as usize;

        self.ids[start..end]
            .binary_search(id)
            .ok()
            .map(|pos| start + pos)
    }

    pub fn find_offset(&self, id: &ObjectId) -> Option<u64> {
        self.position(id).map(|i| self.offsets[i])
    }

    pub fn crc(&self, id: &ObjectId) -> Option<u32> {
        let i = self.position(id)?;
        self.crcs.as_ref().map(|crcs| crcs[i])
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.position(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[ObjectId] {
        &self.ids
    }

    /// `(id, offset)` for every object, in id order.
    pub fn entries(&self) -> impl Iterator<Item = (ObjectId, u64)> + '_ {
        self.ids.iter().copied().zip(self.offsets.iter().copied())
    }

    /// The trailer checksum of the pack this index describes.
    pub fn pack_checksum(&self) -> &ObjectId {
        &self.pack_checksum
    }

    /// The byte range of the record starting at `offset`, given the pack's length.
    ///
    /// A record ends where the next one (in offset order) begins, or at the trailer.
    pub fn record_range(&self, offset: u64, pack_len: u64) -> Range<u64> {
        let sorted = self.sorted_offsets.get_or_init(|| {
            let mut sorted = self.offsets.clone();
            sorted.sort_unstable();
            sorted
        });
        let end = match sorted.binary_search(&offset) {
            Ok(i) => sorted.get(i + 1).copied(),
            Err(i) => sorted.get(i).copied(),
        }
        .unwrap_or_else(|| pack_len.saturating_sub(20));
        offset..end
    }

    /// Serialize a version 2 index for `entries` of `(id, offset, crc)`.
    pub fn write(entries: &mut [(ObjectId, u64, u32)], pack_checksum: &ObjectId) -> Vec<u8> {
        entries.sort_unstable_by(|a, b| a.0.cmp(&b.0));

        let mut buf = Vec::with_capacity(FANOUT_LEN + entries.len() * 28 + 48);
        buf.extend_from_slice(V2_MAGIC);
        buf.extend_from_slice(&2u32.to_be_bytes());

        let mut fan_out = [0u32; 256];
        for (id, _, _) in entries.iter() {
            fan_out[id.first_byte() as usize] += 1;
        }
        let mut running = 0;
        for slot in fan_out.iter_mut() {
            running += *slot;
            *slot = running;
        }
        for count in fan_out {
            buf.extend_from_slice(&count.to_be_bytes());
        }

        for (id, _, _) in entries.iter() {
            buf.extend_from_slice(&**id);
        }
        for (_, _, crc) in entries.iter() {
            buf.extend_from_slice(&crc.to_be_bytes());
        }

        let mut large = Vec::new();
        for (_, offset, _) in entries.iter() {
            if *offset < u64::from(LARGE_OFFSET_FLAG) {
                buf.extend_from_slice(&(*offset as u32).to_be_bytes());
            } else {
                let slot = large.len() as u32 | LARGE_OFFSET_FLAG;
                buf.extend_from_slice(&slot.to_be_bytes());
                large.push(*offset);
            }
        }
        for offset in large {
            buf.extend_from_slice(&offset.to_be_bytes());
        }

        buf.extend_from_slice(&**pack_checksum);
        let checksum = ObjectId::new(&buf);
        buf.extend_from_slice(&*checksum);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Object;

    fn ids(n: usize) -> Vec<ObjectId> {
        (0..n)
            .map(|i| Object::blob(format!("object {i}")).id())
            .collect()
    }

    #[test]
    fn test_lookup() -> Result<()> {
        let ids = ids(300);
        let mut entries: Vec<_> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| (*id, 12 + i as u64 * 10, i as u32))
            .collect();
        let checksum = ObjectId::new(b"pack");
        let bytes = PackIndex::write(&mut entries, &checksum);

        let index = PackIndex::parse("pack-test", &bytes)?;
        assert_eq!(index.len(), 300);
        assert_eq!(index.pack_checksum(), &checksum);
        for (i, id) in ids.iter().enumerate() {
            assert_eq!(index.find_offset(id), Some(12 + i as u64 * 10));
            assert_eq!(index.crc(id), Some(i as u32));
        }
        assert!(!index.contains(&Object::blob("absent").id()));
        assert_eq!(index.record_range(12, 5000), 12..22);
        assert_eq!(index.record_range(12 + 299 * 10, 5000), 3002..4980);
        Ok(())
    }

    #[test]
    fn test_large_offsets() -> Result<()> {
        let ids = ids(3);
        let mut entries = vec![
            (ids[0], 12, 0),
            (ids[1], 0x1_0000_0000, 1),
            (ids[2], 0x8000_0000, 2),
        ];
        let bytes = PackIndex::write(&mut entries, &ObjectId::NULL);
        let index = PackIndex::parse("pack-big", &bytes)?;
        assert_eq!(index.find_offset(&ids[1]), Some(0x1_0000_0000));
        assert_eq!(index.find_offset(&ids[2]), Some(0x8000_0000));
        assert_eq!(index.find_offset(&ids[0]), Some(12));
        Ok(())
    }

    #[test]
    fn test_version_1() -> Result<()> {
        let mut ids = ids(5);
        ids.sort();
        let mut fan_out = [0u32; 256];
        for id in &ids {
            for slot in &mut fan_out[id.first_byte() as usize..] {
                *slot += 1;
            }
        }
        let mut bytes = Vec::new();
        for count in fan_out {
            bytes.extend_from_slice(&count.to_be_bytes());
        }
        for (i, id) in ids.iter().enumerate() {
            bytes.extend_from_slice(&(100 * i as u32 + 12).to_be_bytes());
            bytes.extend_from_slice(&**id);
        }
        bytes.extend_from_slice(&[0; 20]);
        let checksum = ObjectId::new(&bytes);
        bytes.extend_from_slice(&*checksum);

        let index = PackIndex::parse("pack-v1", &bytes)?;
        assert_eq!(index.find_offset(&ids[3]), Some(312));
        assert_eq!(index.crc(&ids[3]), None);
        Ok(())
    }

    #[test]
    fn test_corrupt_index_is_rejected() {
        let mut entries: Vec<_> = ids(4).into_iter().map(|id| (id, 12, 0)).collect();
        let mut bytes = PackIndex::write(&mut entries, &ObjectId::NULL);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(PackIndex::parse("pack-bad", &bytes).unwrap_err().is_corruption());
        assert!(PackIndex::parse("pack-bad", b"<html>Not Found</html>")
            .unwrap_err()
            .is_corruption());
    }
}
