use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};

/// Shared cooperative cancellation. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Error::Cancelled)` once [`CancelFlag::cancel`] has been called.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

const CHUNK: usize = 64 * 1024;

/// Copy `reader` into `writer`, checking `cancel` before every chunk.
pub fn copy(reader: &mut dyn Read, writer: &mut dyn Write, cancel: &CancelFlag) -> Result<u64> {
    let mut buf = vec![0u8; CHUNK];
    let mut total = 0;
    loop {
        cancel.check()?;
        let n = match reader.read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Endless;

    impl Read for Endless {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            buf.fill(b'x');
            Ok(buf.len())
        }
    }

    #[test]
    fn test_copy() -> Result<()> {
        let mut out = Vec::new();
        let n = copy(&mut &b"hello"[..], &mut out, &CancelFlag::new())?;
        assert_eq!(n, 5);
        assert_eq!(out, b"hello");
        Ok(())
    }

    #[test]
    fn test_cancelled_copy_stops() {
        let cancel = CancelFlag::new();
        let shared = cancel.clone();
        shared.cancel();
        assert!(cancel.is_cancelled());
        let err = copy(&mut Endless, &mut std::io::sink(), &cancel).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
