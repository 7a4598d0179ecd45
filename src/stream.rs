//! Bounded view over a seekable byte source.

use std::io::{self, Read, Seek, SeekFrom};

/// Restricts a `Read + Seek` source to the window `[start, start + len)`.
///
/// Positions and seeks are window-relative; reads clamp to the window and
/// return 0 once it is exhausted.
pub struct BoundedReader<R> {
    inner: R,
    start: u64,
    len: u64,
    pos: u64,
}

impl<R: Read + Seek> BoundedReader<R> {
    pub fn new(mut inner: R, start: u64, len: u64) -> io::Result<Self> {
        inner.seek(SeekFrom::Start(start))?;
        Ok(BoundedReader {
            inner,
            start,
            len,
            pos: 0,
        })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<R: Read> Read for BoundedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.len - self.pos;
        if remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = (buf.len() as u64).min(remaining) as usize;
        let n = self.inner.read(&mut buf[..want])?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl<R: Read + Seek> Seek for BoundedReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::Current(d) => self.pos as i64 + d,
            SeekFrom::End(d) => self.len as i64 + d,
        };
        if target < 0 || target as u64 > self.len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("seek to {target} outside window of {} bytes", self.len),
            ));
        }
        let target = target as u64;
        self.inner.seek(SeekFrom::Start(self.start + target))?;
        self.pos = target;
        Ok(self.pos)
    }

    fn stream_position(&mut self) -> io::Result<u64> {
        Ok(self.pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn source() -> Cursor<Vec<u8>> {
        Cursor::new((0u8..100).collect())
    }

    #[test]
    fn reads_are_confined_to_the_window() {
        let mut rd = BoundedReader::new(source(), 10, 5).unwrap();
        let mut buf = Vec::new();
        rd.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, [10, 11, 12, 13, 14]);
    }

    #[test]
    fn read_past_end_is_short_then_empty() {
        let mut rd = BoundedReader::new(source(), 20, 4).unwrap();
        let mut buf = [0u8; 16];
        let n = rd.read(&mut buf).unwrap();
        assert_eq!(n, 4);
        assert_eq!(rd.stream_position().unwrap(), 4);
        assert_eq!(rd.read(&mut buf).unwrap(), 0);
        assert_eq!(rd.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn seeks_are_window_relative_and_range_checked() {
        let mut rd = BoundedReader::new(source(), 50, 10).unwrap();
        rd.seek(SeekFrom::Start(6)).unwrap();
        let mut b = [0u8; 1];
        rd.read_exact(&mut b).unwrap();
        assert_eq!(b[0], 56);

        rd.seek(SeekFrom::End(-1)).unwrap();
        rd.read_exact(&mut b).unwrap();
        assert_eq!(b[0], 59);

        assert!(rd.seek(SeekFrom::Start(11)).is_err());
        assert!(rd.seek(SeekFrom::Current(-100)).is_err());
    }
}
