use std::io;

/// Minimum capacity granted on first growth.
const MIN_CAPACITY: usize = 64;

/// An appendable byte stream with amortized growth. The dispatcher reads
/// directly into the tail and protocol parsers consume from the head, so the
/// buffer stays contiguous: `remove_head` shifts the remaining bytes down
/// instead of wrapping.
pub struct IoBuf {
    data: Vec<u8>,
}

impl IoBuf {
    #[inline]
    pub fn new() -> IoBuf {
        IoBuf { data: Vec::new() }
    }

    #[inline]
    pub fn with_capacity(capacity: usize) -> IoBuf {
        IoBuf {
            data: Vec::with_capacity(capacity),
        }
    }

    /// The number of bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true in case the buffer is empty, false otherwise.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Slice containing data.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Mutable slice containing data.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Ensures capacity for `additional` more bytes. Growth is geometric:
    /// the new capacity is at least `max(len + additional, 2 * cap, 64)`.
    /// Returns false when the allocator refuses.
    pub fn reserve(&mut self, additional: usize) -> bool {
        let needed = self.data.len() + additional;

        if needed <= self.data.capacity() {
            return true;
        }

        let target = needed.max(self.data.capacity() * 2).max(MIN_CAPACITY);

        self.data.try_reserve_exact(target - self.data.len()).is_ok()
    }

    /// Appends the bytes, growing the buffer as required. Returns the number
    /// of bytes appended, which is always `bytes.len()`.
    pub fn append(&mut self, bytes: &[u8]) -> usize {
        if !self.reserve(bytes.len()) {
            panic!("Buffer growth of {} bytes failed", bytes.len());
        }

        self.data.extend_from_slice(bytes);
        bytes.len()
    }

    /// Drops `count` bytes off the head, shifting the remainder down.
    /// Capacity is retained.
    pub fn remove_head(&mut self, count: usize) {
        assert!(count <= self.data.len(), "remove_head beyond buffer length");

        let len = self.data.len();
        self.data.copy_within(count.., 0);
        self.data.truncate(len - count);
    }

    /// Detaches the first `count` bytes into an owned vector and removes
    /// them from the buffer.
    pub fn split_head(&mut self, count: usize) -> Vec<u8> {
        let head = self.data[..count].to_vec();
        self.remove_head(count);
        head
    }

    #[inline]
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Performs one read from the supplied reader into the tail, after
    /// reserving `chunk` bytes of headroom. Returns the byte count, with
    /// zero meaning end-of-stream.
    pub fn ingress<R: io::Read>(&mut self, mut reader: R, chunk: usize) -> io::Result<usize> {
        if !self.reserve(chunk) {
            return Err(io::Error::new(io::ErrorKind::Other, "buffer growth failed"));
        }

        let old_len = self.data.len();
        self.data.resize(old_len + chunk, 0);

        match reader.read(&mut self.data[old_len..]) {
            Ok(count) => {
                self.data.truncate(old_len + count);
                Ok(count)
            }
            Err(err) => {
                self.data.truncate(old_len);
                Err(err)
            }
        }
    }

    /// Performs one write of the buffered data to the supplied writer and
    /// removes the written prefix. A partial write keeps the remainder.
    pub fn egress<W: io::Write>(&mut self, mut writer: W) -> io::Result<usize> {
        if self.data.is_empty() {
            return Ok(0);
        }

        let count = writer.write(&self.data)?;

        if count == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }

        self.remove_head(count);
        Ok(count)
    }
}
