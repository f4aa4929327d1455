//! Bounded and chunked transfer helpers (component A).
//!
//! Every read/write against a block device or a FunctionFS endpoint in this
//! crate goes through these two helpers. Both treat a short transfer as a
//! hard error instead of silently truncating, because the underlying targets
//! define their own transaction sizes.

use std::io::{Read, Write};

use crate::error::{KbootError, Result};

/// Perform exactly one `read` call; fail if it doesn't fill `buf`.
pub fn bounded_read(src: &mut impl Read, buf: &mut [u8]) -> Result<()> {
    let n = src.read(buf)?;
    if n != buf.len() {
        return Err(KbootError::IoShort {
            moved: n,
            requested: buf.len(),
        });
    }
    Ok(())
}

/// Perform exactly one `write` call; fail if it doesn't consume all of `buf`.
pub fn bounded_write(dst: &mut impl Write, buf: &[u8]) -> Result<()> {
    let n = dst.write(buf)?;
    if n != buf.len() {
        return Err(KbootError::IoShort {
            moved: n,
            requested: buf.len(),
        });
    }
    Ok(())
}

/// Read `buf.len()` bytes in chunks of at most `max` bytes, failing on any
/// short chunk transfer.
pub fn chunked_read(src: &mut impl Read, buf: &mut [u8], max: usize) -> Result<()> {
    let mut done = 0;
    while done < buf.len() {
        let n = (buf.len() - done).min(max);
        bounded_read(src, &mut buf[done..done + n])?;
        done += n;
    }
    Ok(())
}

/// Write `buf` in chunks of at most `max` bytes, failing on any short chunk
/// transfer.
pub fn chunked_write(dst: &mut impl Write, buf: &[u8], max: usize) -> Result<()> {
    let mut done = 0;
    while done < buf.len() {
        let n = (buf.len() - done).min(max);
        bounded_write(dst, &buf[done..done + n])?;
        done += n;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// A reader that yields at most `cap` bytes per call, to exercise the
    /// chunking loop and the short-read failure path.
    struct Capped<'a> {
        data: &'a [u8],
        pos: usize,
        cap: usize,
    }

    impl Read for Capped<'_> {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = (self.data.len() - self.pos).min(buf.len()).min(self.cap);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    #[test]
    fn bounded_read_rejects_short_transfer() {
        let mut src = Capped {
            data: &[1, 2, 3],
            pos: 0,
            cap: 2,
        };
        let mut buf = [0u8; 3];
        assert!(matches!(
            bounded_read(&mut src, &mut buf),
            Err(KbootError::IoShort {
                moved: 2,
                requested: 3
            })
        ));
    }

    #[test]
    fn chunked_read_reassembles_full_buffer() {
        let data: Vec<u8> = (0..100).collect();
        let mut src = Capped {
            data: &data,
            pos: 0,
            cap: 13,
        };
        let mut buf = [0u8; 100];
        chunked_read(&mut src, &mut buf, 13).unwrap();
        assert_eq!(&buf[..], &data[..]);
    }

    #[test]
    fn chunked_write_round_trips() {
        let data: Vec<u8> = (0..250u16).map(|x| x as u8).collect();
        let mut out = Cursor::new(Vec::new());
        chunked_write(&mut out, &data, 61_440).unwrap();
        assert_eq!(out.into_inner(), data);
    }
}
