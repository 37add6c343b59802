use thiserror::Error;

/// Largest buffer reserved up front from a size declared by untrusted input.
pub const MAX_PREALLOC: usize = 64 * 1024 * 1024;

#[derive(Debug, Error)]
#[error("{0}")]
pub struct DeltaError(pub String);

fn read_varint(delta: &[u8], pos: &mut usize) -> Result<u64, DeltaError> {
    let mut value = 0u64;
    let mut shift = 0;
    loop {
        let b = *delta
            .get(*pos)
            .ok_or_else(|| DeltaError("delta header is truncated".into()))?;
        *pos += 1;
        if shift > 63 {
            return Err(DeltaError("delta header size overflows".into()));
        }
        value |= u64::from(b & 0x7f) << shift;
        shift += 7;
        if b & 0x80 == 0 {
            return Ok(value);
        }
    }
}

/// The `(base size, result size)` declared at the start of a delta.
pub fn sizes(delta: &[u8]) -> Result<(u64, u64), DeltaError> {
    let mut pos = 0;
    Ok((read_varint(delta, &mut pos)?, read_varint(delta, &mut pos)?))
}

/// Replay the copy/insert instructions of `delta` against `base`.
///
/// The output never grows past the result size the delta declares, and must reach it exactly.
pub fn apply_delta(base: &[u8], delta: &[u8]) -> Result<Vec<u8>, DeltaError> {
    let mut pos = 0;
    let base_size = read_varint(delta, &mut pos)?;
    let result_size = read_varint(delta, &mut pos)?;

    if base_size != base.len() as u64 {
        return Err(DeltaError(format!(
            "delta expects a {base_size} byte base, got {}",
            base.len()
        )));
    }
    let result_size = usize::try_from(result_size)
        .map_err(|_| DeltaError("delta result does not fit in memory".into()))?;

    let mut out = Vec::with_capacity(result_size.min(MAX_PREALLOC));

    while pos < delta.len() {
        let cmd = delta[pos];
        pos += 1;

        let chunk = if cmd & 0x80 != 0 {
            let mut arg = |present: bool| -> Result<u32, DeltaError> {
                if !present {
                    return Ok(0);
                }
                let b = *delta
                    .get(pos)
                    .ok_or_else(|| DeltaError("copy instruction is truncated".into()))?;
                pos += 1;
                Ok(u32::from(b))
            };

            let mut offset = 0u32;
            for i in 0..4 {
                offset |= arg(cmd & (1 << i) != 0)? << (8 * i);
            }
            let mut size = 0u32;
            for i in 0..3 {
                size |= arg(cmd & (0x10 << i) != 0)? << (8 * i);
            }
            if size == 0 {
                size = 0x10000;
            }

            let start = offset as usize;
            let end = start + size as usize;
            base.get(start..end).ok_or_else(|| {
                DeltaError(format!(
                    "copy of {start}..{end} is outside the {} byte base",
                    base.len()
                ))
            })?
        } else if cmd != 0 {
            let end = pos + cmd as usize;
            let literal = delta
                .get(pos..end)
                .ok_or_else(|| DeltaError("insert instruction is truncated".into()))?;
            pos = end;
            literal
        } else {
            return Err(DeltaError("reserved delta instruction 0".into()));
        };

        if out.len() + chunk.len() > result_size {
            return Err(DeltaError(format!(
                "delta writes past its declared {result_size} byte result"
            )));
        }
        out.extend_from_slice(chunk);
    }

    if out.len() != result_size {
        return Err(DeltaError(format!(
            "delta produced {} bytes, declared {result_size}",
            out.len()
        )));
    }

    Ok(out)
}

/// Writes copy/insert instructions in the pack delta encoding.
pub struct DeltaBuilder {
    out: Vec<u8>,
}

impl DeltaBuilder {
    fn varint(out: &mut Vec<u8>, mut value: u64) {
        loop {
            let b = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                out.push(b);
                return;
            }
            out.push(b | 0x80);
        }
    }

    pub fn new(base_size: usize, result_size: usize) -> Self {
        let mut out = Vec::new();
        Self::varint(&mut out, base_size as u64);
        Self::varint(&mut out, result_size as u64);
        Self { out }
    }

    pub fn copy(mut self, offset: u32, size: u32) -> Self {
        let mut cmd = 0x80u8;
        let mut args = Vec::new();
        for i in 0..4 {
            let b = (offset >> (8 * i)) as u8;
            if b != 0 {
                cmd |= 1 << i;
                args.push(b);
            }
        }
        for i in 0..3 {
            let b = (size >> (8 * i)) as u8;
            if b != 0 {
                cmd |= 0x10 << i;
                args.push(b);
            }
        }
        self.out.push(cmd);
        self.out.extend_from_slice(&args);
        self
    }

    pub fn insert(mut self, bytes: &[u8]) -> Self {
        for chunk in bytes.chunks(0x7f) {
            self.out.push(chunk.len() as u8);
            self.out.extend_from_slice(chunk);
        }
        self
    }

    /// Copy `size` bytes of the base at `offset`, split into as many instructions as needed.
    pub fn copy_range(mut self, mut offset: u32, mut size: u32) -> Self {
        while size > 0 {
            let chunk = size.min(MAX_COPY);
            self = self.copy(offset, chunk);
            offset += chunk;
            size -= chunk;
        }
        self
    }

    pub fn build(self) -> Vec<u8> {
        self.out
    }
}

/// Largest copy a single instruction can express.
const MAX_COPY: u32 = 0xff_ffff;

/// Smallest saving for which [`encode`] bothers with a delta.
const MIN_SAVING: usize = 32;

/// Encode `target` as a delta against `base` from the prefix and suffix they share.
///
/// Returns `None` when the shared part is too small to be worth it.
pub fn encode(base: &[u8], target: &[u8]) -> Option<Vec<u8>> {
    if base.len() > u32::MAX as usize {
        return None;
    }
    let prefix = base
        .iter()
        .zip(target)
        .take_while(|(a, b)| a == b)
        .count();
    let suffix = base[prefix..]
        .iter()
        .rev()
        .zip(target[prefix..].iter().rev())
        .take_while(|(a, b)| a == b)
        .count();
    if prefix + suffix < MIN_SAVING {
        return None;
    }

    let middle = &target[prefix..target.len() - suffix];
    let delta = DeltaBuilder::new(base.len(), target.len())
        .copy_range(0, prefix as u32)
        .insert(middle)
        .copy_range((base.len() - suffix) as u32, suffix as u32)
        .build();
    (delta.len() < target.len()).then_some(delta)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_and_insert() {
        let base = b"the quick brown fox";
        let delta = DeltaBuilder::new(base.len(), 20)
            .copy(4, 6)
            .insert(b"slow ")
            .copy(10, 9)
            .build();
        assert_eq!(sizes(&delta).unwrap(), (19, 20));
        assert_eq!(apply_delta(base, &delta).unwrap(), b"quick slow brown fox");
    }

    #[test]
    fn test_copy_size_zero_means_64k() {
        let base = vec![7u8; 0x10000];
        let delta = DeltaBuilder::new(base.len(), 0x10000).copy(0, 0).build();
        assert_eq!(apply_delta(&base, &delta).unwrap(), base);
    }

    #[test]
    fn test_wrong_base_size() {
        let delta = DeltaBuilder::new(3, 3).copy(0, 3).build();
        assert!(apply_delta(b"abcd", &delta).is_err());
    }

    #[test]
    fn test_output_is_bounded_by_declared_size() {
        let delta = DeltaBuilder::new(4, 2).copy(0, 4).build();
        let err = apply_delta(b"abcd", &delta).unwrap_err();
        assert!(err.0.contains("past its declared"));

        let short = DeltaBuilder::new(4, 8).copy(0, 4).build();
        assert!(apply_delta(b"abcd", &short).is_err());
    }

    #[test]
    fn test_encode() {
        let base: Vec<u8> = (0..200u8).collect();
        let mut target = base.clone();
        target.splice(100..110, *b"replacement text");
        let delta = encode(&base, &target).unwrap();
        assert!(delta.len() < 40);
        assert_eq!(apply_delta(&base, &delta).unwrap(), target);

        assert_eq!(encode(b"abc", b"xyz"), None);
        // Identical content is a pure copy
        assert_eq!(apply_delta(&base, &encode(&base, &base).unwrap()).unwrap(), base);
    }

    #[test]
    fn test_copy_outside_base() {
        let delta = DeltaBuilder::new(4, 4).copy(2, 4).build();
        assert!(apply_delta(b"abcd", &delta).is_err());
    }

    #[test]
    fn test_malformed_instructions() {
        let mut delta = DeltaBuilder::new(4, 4).build();
        delta.push(0);
        assert!(apply_delta(b"abcd", &delta).is_err());

        let mut delta = DeltaBuilder::new(4, 4).build();
        delta.extend_from_slice(&[5, b'a']);
        assert!(apply_delta(b"abcd", &delta).is_err());
    }
}
