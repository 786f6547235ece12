//! Pull-based byte streams.
//!
//! The vendor HTTP client pushes data through callbacks; everything in the
//! update pipeline instead pulls chunks until [`Chunk::End`], which keeps the
//! digest/size bookkeeping a plain loop.

use std::io::Read;

use super::error::{OtaError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chunk {
    /// `n` bytes were written to the front of the caller's buffer.
    Data(usize),
    End,
}

pub trait ByteSource {
    /// Fill `buf` with the next chunk. Blocking, bounded by the transport timeout.
    fn next_chunk(&mut self, buf: &mut [u8]) -> Result<Chunk>;
}

/// Opens streaming GET requests. Dropping the returned source closes the connection.
pub trait HttpClient: Send + Sync {
    fn get<'a>(&'a self, url: &str) -> Result<Box<dyn ByteSource + 'a>>;
}

/// Adapts any `Read` (a firmware file on the SD card, a response body) to [`ByteSource`].
///
/// A zero-length read is the end of the stream; a read that fails because the
/// peer went away is reported as [`OtaError::TransferInterrupted`].
pub struct ReaderSource<R> {
    inner: R,
}

impl<R: Read> ReaderSource<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

impl<R: Read> ByteSource for ReaderSource<R> {
    fn next_chunk(&mut self, buf: &mut [u8]) -> Result<Chunk> {
        loop {
            match self.inner.read(buf) {
                Ok(0) => return Ok(Chunk::End),
                Ok(n) => return Ok(Chunk::Data(n)),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(OtaError::from_read_error(e)),
            }
        }
    }
}

/// Fill `buf` completely unless the stream ends first. Returns the byte count.
///
/// Used where a minimum prefix is required (image header) but the transport
/// is free to hand out short chunks.
pub fn read_full(source: &mut dyn ByteSource, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.next_chunk(&mut buf[filled..])? {
            Chunk::Data(n) => filled += n,
            Chunk::End => break,
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    struct Flaky {
        reads: Vec<io::Result<Vec<u8>>>,
    }

    impl Read for Flaky {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.reads.is_empty() {
                return Ok(0);
            }
            match self.reads.remove(0) {
                Ok(mut data) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    if n < data.len() {
                        self.reads.insert(0, Ok(data.split_off(n)));
                    }
                    Ok(n)
                }
                Err(e) => Err(e),
            }
        }
    }

    #[test]
    fn reader_source_reports_end_and_reset() {
        let mut src = ReaderSource::new(Flaky {
            reads: vec![
                Ok(vec![1, 2, 3]),
                Err(io::Error::from(io::ErrorKind::Interrupted)),
                Ok(vec![4]),
                Err(io::Error::from(io::ErrorKind::ConnectionReset)),
            ],
        });
        let mut buf = [0u8; 8];
        assert_eq!(src.next_chunk(&mut buf).unwrap(), Chunk::Data(3));
        assert_eq!(src.next_chunk(&mut buf).unwrap(), Chunk::Data(1));
        assert!(matches!(
            src.next_chunk(&mut buf),
            Err(OtaError::TransferInterrupted)
        ));
        assert_eq!(src.next_chunk(&mut buf).unwrap(), Chunk::End);
    }

    #[test]
    fn read_full_joins_short_chunks() {
        let mut src = ReaderSource::new(Flaky {
            reads: vec![Ok(vec![1, 2]), Ok(vec![3, 4, 5])],
        });
        let mut buf = [0u8; 4];
        assert_eq!(read_full(&mut src, &mut buf).unwrap(), 4);
        assert_eq!(buf, [1, 2, 3, 4]);
    }
}
