//! Bounded, wrap-around byte buffer with logical-offset addressing.
//!
//! The buffer never fails a write: once capacity is exceeded, older bytes are
//! silently overwritten. Reads are addressed by the monotonic count of bytes
//! ever written (`len`), not by a physical position, so that `stat.st_size`
//! and offset-based reads agree even across wraps.

/// A fixed-capacity FIFO of bytes that keeps only the most recently written
/// `capacity` bytes, addressable by logical offset.
#[derive(Debug, Clone)]
pub struct RingBuffer {
    data: Vec<u8>,
    len: u64,
}

impl RingBuffer {
    /// Creates an empty buffer with the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity],
            len: 0,
        }
    }

    /// Current capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Total number of bytes ever written; also the logical end offset.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Number of bytes currently retrievable via `read`.
    pub fn valid_len(&self) -> u64 {
        self.len.min(self.capacity() as u64)
    }

    /// Logical offset of the oldest byte still retrievable.
    fn valid_start(&self) -> u64 {
        self.len.saturating_sub(self.capacity() as u64)
    }

    /// Reallocates to `new_cap`, preserving up to `new_cap` of the most
    /// recently written bytes as a prefix of the new buffer. `len` becomes
    /// the number of bytes preserved.
    pub fn resize(&mut self, new_cap: usize) {
        let start = self.len.saturating_sub(new_cap as u64);
        let mut new_data = vec![0u8; new_cap];
        let copied = self.read(start, &mut new_data);
        self.data = new_data;
        self.len = copied as u64;
    }

    /// Appends `bytes`, returning `bytes.len()`. Never fails; if `bytes` is
    /// longer than the capacity, only the final `capacity` bytes survive.
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        let cap = self.capacity();
        if cap == 0 {
            self.len += bytes.len() as u64;
            return bytes.len();
        }

        let mut rest = bytes;
        while !rest.is_empty() {
            let cursor = (self.len % cap as u64) as usize;
            let free = cap - cursor;
            let chunk = free.min(rest.len());
            self.data[cursor..cursor + chunk].copy_from_slice(&rest[..chunk]);
            rest = &rest[chunk..];
            self.len += chunk as u64;
        }
        bytes.len()
    }

    /// Copies bytes starting at logical `offset` into `out`, returning the
    /// number of bytes copied. Returns 0 if `offset` is outside the valid
    /// range `[valid_start, len)`.
    pub fn read(&self, offset: u64, out: &mut [u8]) -> usize {
        let cap = self.capacity();
        if cap == 0 || offset >= self.len || out.is_empty() {
            return 0;
        }
        if offset < self.valid_start() {
            return 0;
        }

        let want = (self.len - offset).min(out.len() as u64) as usize;
        if self.len <= cap as u64 {
            // No wrap yet: physical position equals logical offset.
            let start = offset as usize;
            out[..want].copy_from_slice(&self.data[start..start + want]);
            return want;
        }

        let end = (self.len % cap as u64) as usize; // physical position just past the newest byte
        let behind_end = cap - end; // bytes physically stored at [end, cap)
        let logical_of_end = self.len - behind_end as u64; // logical offset of physical index `end`

        let mut copied = 0usize;
        if offset < logical_of_end {
            // Some of the requested range lies in the tail segment [end, cap).
            let phys_start = end + (offset - self.valid_start()) as usize;
            let avail = cap - phys_start;
            let chunk = avail.min(want);
            out[..chunk].copy_from_slice(&self.data[phys_start..phys_start + chunk]);
            copied += chunk;
        }
        if copied < want {
            let remaining = want - copied;
            let phys_start = if offset > logical_of_end {
                (offset - logical_of_end) as usize
            } else {
                0
            };
            out[copied..copied + remaining]
                .copy_from_slice(&self.data[phys_start..phys_start + remaining]);
            copied += remaining;
        }
        copied
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_returns_input_length() {
        let mut buf = RingBuffer::new(16);
        assert_eq!(buf.write(b"hello"), 5);
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn read_within_unwrapped_range() {
        let mut buf = RingBuffer::new(16);
        buf.write(b"hello world");
        let mut out = [0u8; 5];
        assert_eq!(buf.read(0, &mut out), 5);
        assert_eq!(&out, b"hello");
        let mut out = [0u8; 5];
        assert_eq!(buf.read(6, &mut out), 5);
        assert_eq!(&out, b"world");
    }

    #[test]
    fn read_offset_beyond_len_is_zero() {
        let mut buf = RingBuffer::new(16);
        buf.write(b"hi");
        let mut out = [0u8; 4];
        assert_eq!(buf.read(100, &mut out), 0);
    }

    #[test]
    fn capacity_zero_discards_everything() {
        let mut buf = RingBuffer::new(0);
        assert_eq!(buf.write(b"anything"), 8);
        assert_eq!(buf.len(), 8);
        let mut out = [0u8; 4];
        assert_eq!(buf.read(0, &mut out), 0);
    }

    #[test]
    fn wrap_retains_only_final_capacity_bytes() {
        // Matches the worked example from the spec: capacity 8, write
        // "hello", then "!", then "world!" -> last 8 bytes are "o!world!".
        let mut buf = RingBuffer::new(8);
        buf.write(b"hello");
        buf.write(b"!");
        buf.write(b"world!");
        assert_eq!(buf.len(), 12);
        assert_eq!(buf.valid_len(), 8);

        // offset 0 lies outside the valid range [4, 12) and yields nothing.
        let mut out = [0u8; 12];
        assert_eq!(buf.read(0, &mut out), 0);

        // reading from the start of the valid range returns the tail bytes
        // in logical-offset order.
        let mut out = [0u8; 8];
        let n = buf.read(4, &mut out);
        assert_eq!(n, 8);
        assert_eq!(&out, b"o!world!");
    }

    #[test]
    fn write_larger_than_capacity_keeps_tail() {
        let mut buf = RingBuffer::new(4);
        buf.write(b"abcdefgh");
        assert_eq!(buf.len(), 8);
        let mut out = [0u8; 4];
        assert_eq!(buf.read(4, &mut out), 4);
        assert_eq!(&out, b"efgh");
    }

    #[test]
    fn resize_preserves_tail_as_prefix() {
        let mut buf = RingBuffer::new(4);
        buf.write(b"abcdefgh"); // valid: "efgh"
        buf.resize(2);
        assert_eq!(buf.len(), 2);
        let mut out = [0u8; 2];
        assert_eq!(buf.read(0, &mut out), 2);
        assert_eq!(&out, b"gh");
    }

    #[test]
    fn resize_grow_keeps_all_bytes_when_they_fit() {
        let mut buf = RingBuffer::new(4);
        buf.write(b"ab");
        buf.resize(8);
        assert_eq!(buf.len(), 2);
        let mut out = [0u8; 2];
        assert_eq!(buf.read(0, &mut out), 2);
        assert_eq!(&out, b"ab");
    }

    #[test]
    fn partial_read_at_tail_of_valid_range() {
        let mut buf = RingBuffer::new(4);
        buf.write(b"abcdefgh"); // valid "efgh", logical offsets [4, 8)
        let mut out = [0u8; 10];
        assert_eq!(buf.read(6, &mut out), 2);
        assert_eq!(&out[..2], b"gh");
    }
}
