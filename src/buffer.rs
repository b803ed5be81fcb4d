use crate::error::{Error, Result};

/// Grow-on-write, compact-on-consume byte buffer.
///
/// Every connection carries two of these: one for received bytes the
/// protocol parsers consume from the front, one for outbound bytes the
/// I/O driver drains to the socket. `len()` is the data present,
/// `size()` the backing capacity; consuming a prefix compacts the
/// remainder to offset 0.
#[derive(Default)]
pub struct IoBuffer {
    data: Vec<u8>,
}

impl IoBuffer {
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
        }
    }

    /// Bytes currently stored.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Capacity of the backing storage.
    pub fn size(&self) -> usize {
        self.data.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Appends bytes, growing the backing storage as needed. Fails with
    /// `Error::Resource` when the allocator refuses the growth; the
    /// owning connection is then transitioned to ERROR and closed.
    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        self.data
            .try_reserve(bytes.len())
            .map_err(|_| Error::Resource(format!("buffer grow by {} refused", bytes.len())))?;
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Ensures capacity for at least `n` bytes total.
    pub fn grow_to(&mut self, n: usize) -> Result<()> {
        if n > self.data.capacity() {
            let additional = n - self.data.len();
            self.data
                .try_reserve(additional)
                .map_err(|_| Error::Resource(format!("buffer grow to {} refused", n)))?;
        }
        Ok(())
    }

    /// Borrows up to `n` bytes from the front without consuming them.
    pub fn peek(&self, n: usize) -> &[u8] {
        &self.data[..n.min(self.data.len())]
    }

    /// Drops the first `n` bytes and compacts the remainder to offset 0.
    ///
    /// `n > len()` is a programming error.
    pub fn consume(&mut self, n: usize) {
        assert!(n <= self.data.len(), "consume({}) exceeds len {}", n, self.data.len());
        self.data.drain(..n);
    }

    /// Removes and returns the first `n` bytes; the remainder compacts
    /// to offset 0.
    pub fn take(&mut self, n: usize) -> Vec<u8> {
        assert!(n <= self.data.len(), "take({}) exceeds len {}", n, self.data.len());
        if n == self.data.len() {
            return std::mem::take(&mut self.data);
        }
        let taken = self.data[..n].to_vec();
        self.data.drain(..n);
        taken
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }
}

impl std::fmt::Debug for IoBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoBuffer")
            .field("len", &self.len())
            .field("size", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_tracks_len_and_contents() {
        let mut buf = IoBuffer::new();
        buf.append(b"hello").unwrap();
        assert_eq!(buf.len(), 5);
        buf.append(b" world").unwrap();
        assert_eq!(buf.len(), 11);
        assert_eq!(buf.as_slice(), b"hello world");
        assert!(buf.size() >= buf.len());
    }

    #[test]
    fn test_consume_compacts_prefix() {
        let mut buf = IoBuffer::new();
        buf.append(b"abcdef").unwrap();
        buf.consume(2);
        assert_eq!(buf.as_slice(), b"cdef");
        assert_eq!(buf.peek(3), b"cde");
        buf.consume(4);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_take_returns_prefix_and_compacts() {
        let mut buf = IoBuffer::new();
        buf.append(b"headbody").unwrap();
        let head = buf.take(4);
        assert_eq!(head, b"head");
        assert_eq!(buf.as_slice(), b"body");
        let rest = buf.take(4);
        assert_eq!(rest, b"body");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_peek_clamps_to_len() {
        let mut buf = IoBuffer::new();
        buf.append(b"xy").unwrap();
        assert_eq!(buf.peek(10), b"xy");
    }

    #[test]
    #[should_panic(expected = "consume(3) exceeds len 2")]
    fn test_consume_past_end_panics() {
        let mut buf = IoBuffer::new();
        buf.append(b"ab").unwrap();
        buf.consume(3);
    }

    #[test]
    fn test_grow_to_preserves_contents() {
        let mut buf = IoBuffer::new();
        buf.append(b"keep").unwrap();
        buf.grow_to(4096).unwrap();
        assert!(buf.size() >= 4096);
        assert_eq!(buf.as_slice(), b"keep");
    }

    #[test]
    fn test_data_conservation_across_consume() {
        let mut buf = IoBuffer::new();
        buf.append(b"0123456789").unwrap();
        buf.consume(3);
        buf.append(b"ab").unwrap();
        assert_eq!(buf.as_slice(), b"3456789ab");
        assert_eq!(buf.len(), 9);
    }
}
