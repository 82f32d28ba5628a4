//! A growable byte buffer with endian awareness,
//! in-place byte swapping, and bounded bulk copies.

use byteordered::Endianness;
use std::io::{Read, Seek, Write};

/// The maximum number of bytes written in one call when copying
/// to a seekable destination. Writes above this size are split,
/// since some file system drivers mishandle very large single writes.
pub const MAX_WRITE_CHUNK: usize = 4 * 1024 * 1024;

/// A growable buffer of raw value bytes.
///
/// The buffer records the byte order its contents were produced in,
/// and supports in-place swapping for endian conversion.
#[derive(Debug, Clone, PartialEq)]
pub struct ByteBuffer {
    data: Vec<u8>,
    endianness: Endianness,
}

impl Default for ByteBuffer {
    fn default() -> Self {
        ByteBuffer::new(Endianness::Little)
    }
}

impl ByteBuffer {
    /// Create an empty buffer with the given byte order.
    pub fn new(endianness: Endianness) -> Self {
        ByteBuffer {
            data: Vec::new(),
            endianness,
        }
    }

    /// Create a buffer over existing data with the given byte order.
    pub fn from_vec(data: Vec<u8>, endianness: Endianness) -> Self {
        ByteBuffer { data, endianness }
    }

    /// The byte order of the buffer contents.
    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    /// The number of bytes in the buffer.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Borrow the buffer contents.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Take the buffer contents.
    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    /// Append raw bytes to the buffer.
    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Read exactly `count` bytes from the source into the buffer.
    pub fn copy_from<R>(&mut self, source: &mut R, count: usize) -> std::io::Result<()>
    where
        R: Read,
    {
        let base = self.data.len();
        self.data.resize(base + count, 0);
        source.read_exact(&mut self.data[base..])
    }

    /// Write the buffer contents to a byte sink in a single call.
    pub fn copy_to<W>(&self, to: &mut W) -> std::io::Result<()>
    where
        W: Write,
    {
        to.write_all(&self.data)
    }

    /// Write the buffer contents to a seekable destination,
    /// splitting copies larger than [`MAX_WRITE_CHUNK`] into
    /// chunk-sized writes.
    pub fn copy_to_seekable<W>(&self, to: &mut W) -> std::io::Result<()>
    where
        W: Write + Seek,
    {
        for chunk in self.data.chunks(MAX_WRITE_CHUNK) {
            to.write_all(chunk)?;
        }
        Ok(())
    }

    /// Reverse every pair of bytes in place.
    /// A trailing odd byte is left untouched.
    pub fn swap_2(&mut self) {
        for pair in self.data.chunks_exact_mut(2) {
            pair.swap(0, 1);
        }
    }

    /// Reverse every group of 4 bytes in place.
    /// Trailing bytes that do not make a full group are left untouched.
    pub fn swap_4(&mut self) {
        for quad in self.data.chunks_exact_mut(4) {
            quad.swap(0, 3);
            quad.swap(1, 2);
        }
    }

    /// Reverse every group of `word_size` bytes in place,
    /// flipping the recorded byte order.
    /// Trailing bytes that do not make a full group are left untouched.
    pub fn swap(&mut self, word_size: usize) {
        match word_size {
            0 | 1 => {}
            2 => self.swap_2(),
            4 => self.swap_4(),
            n => {
                for group in self.data.chunks_exact_mut(n) {
                    group.reverse();
                }
            }
        }
        if word_size > 1 {
            self.endianness = match self.endianness {
                Endianness::Little => Endianness::Big,
                Endianness::Big => Endianness::Little,
            };
        }
    }

    /// Convert the buffer contents to the given byte order,
    /// interpreting them as a run of `word_size`-byte values.
    pub fn to_endianness(&mut self, endianness: Endianness, word_size: usize) {
        if self.endianness != endianness {
            self.swap(word_size);
            self.endianness = endianness;
        }
    }
}

impl Write for ByteBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.data.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn swap_2_and_4() {
        let mut buffer = ByteBuffer::from_vec(vec![1, 2, 3, 4, 5], Endianness::Little);
        buffer.swap_2();
        assert_eq!(buffer.as_slice(), &[2, 1, 4, 3, 5]);

        let mut buffer = ByteBuffer::from_vec(vec![1, 2, 3, 4, 5, 6], Endianness::Little);
        buffer.swap_4();
        assert_eq!(buffer.as_slice(), &[4, 3, 2, 1, 5, 6]);
    }

    #[test]
    fn swap_n_flips_endianness() {
        let mut buffer =
            ByteBuffer::from_vec(vec![1, 2, 3, 4, 5, 6, 7, 8], Endianness::Little);
        buffer.swap(8);
        assert_eq!(buffer.as_slice(), &[8, 7, 6, 5, 4, 3, 2, 1]);
        assert_eq!(buffer.endianness(), Endianness::Big);
    }

    #[test]
    fn to_endianness_is_idempotent() {
        let mut buffer = ByteBuffer::from_vec(vec![0x01, 0x00], Endianness::Little);
        buffer.to_endianness(Endianness::Little, 2);
        assert_eq!(buffer.as_slice(), &[0x01, 0x00]);
        buffer.to_endianness(Endianness::Big, 2);
        assert_eq!(buffer.as_slice(), &[0x00, 0x01]);
    }

    #[test]
    fn copy_from_reads_exactly() {
        let mut source = Cursor::new(vec![9u8; 16]);
        let mut buffer = ByteBuffer::new(Endianness::Little);
        buffer.copy_from(&mut source, 10).unwrap();
        assert_eq!(buffer.len(), 10);

        let mut short = Cursor::new(vec![1u8; 4]);
        assert!(buffer.copy_from(&mut short, 8).is_err());
    }

    #[test]
    fn copy_to_seekable_splits_chunks() {
        // sink which records the size of each write call
        struct RecordingSink {
            writes: Vec<usize>,
        }
        impl Write for RecordingSink {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.writes.push(buf.len());
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }
        impl Seek for RecordingSink {
            fn seek(&mut self, _pos: std::io::SeekFrom) -> std::io::Result<u64> {
                Ok(0)
            }
        }

        let buffer = ByteBuffer::from_vec(vec![0u8; MAX_WRITE_CHUNK + 1], Endianness::Little);
        let mut sink = RecordingSink { writes: Vec::new() };
        buffer.copy_to_seekable(&mut sink).unwrap();
        assert_eq!(sink.writes, vec![MAX_WRITE_CHUNK, 1]);
    }
}
