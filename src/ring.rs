/// Growable circular byte buffer backing a connection's inbound and
/// outbound stores.
///
/// Reads come in two flavours: non-consuming (`peek` / `bytes`) and
/// consuming (`consume`, `read_n`, `take_all`). `read_n` is all-or-nothing:
/// it only succeeds once at least `n` bytes are buffered, so callers never
/// have to track partially-consumed frames.
#[derive(Debug)]
pub struct RingBuffer {
    buf: Box<[u8]>,
    r: usize,
    len: usize,
}

const MIN_CAP: usize = 64;
pub(crate) const SOCKET_RING_CAP: usize = 1024;

impl RingBuffer {
    pub fn new() -> Self {
        Self::with_capacity(SOCKET_RING_CAP)
    }

    pub fn with_capacity(cap: usize) -> Self {
        let cap = cap.next_power_of_two().max(MIN_CAP);
        Self {
            buf: vec![0; cap].into_boxed_slice(),
            r: 0,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    fn w(&self) -> usize {
        (self.r + self.len) % self.buf.len()
    }

    /// Append `data`, doubling the backing storage when it does not fit.
    pub fn write_all(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.reserve(data.len());

        let cap = self.buf.len();
        let w = self.w();
        let first = (cap - w).min(data.len());
        self.buf[w..w + first].copy_from_slice(&data[..first]);
        if first < data.len() {
            self.buf[..data.len() - first].copy_from_slice(&data[first..]);
        }
        self.len += data.len();
    }

    /// Everything currently buffered, as up to two contiguous slices in
    /// read order. Does not advance the read position.
    pub fn peek(&self) -> (&[u8], &[u8]) {
        let cap = self.buf.len();
        let first = (cap - self.r).min(self.len);
        (&self.buf[self.r..self.r + first], &self.buf[..self.len - first])
    }

    /// Non-consuming copy of everything currently buffered.
    pub fn bytes(&self) -> Vec<u8> {
        let (a, b) = self.peek();
        let mut out = Vec::with_capacity(self.len);
        out.extend_from_slice(a);
        out.extend_from_slice(b);
        out
    }

    /// Advance the read position by up to `n` bytes.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.len);
        self.r = (self.r + n) % self.buf.len();
        self.len -= n;
        if self.len == 0 {
            self.r = 0;
        }
    }

    /// Consume exactly `n` bytes, or nothing at all when fewer than `n`
    /// bytes are buffered.
    pub fn read_n(&mut self, n: usize) -> Option<Vec<u8>> {
        if self.len < n {
            return None;
        }

        let mut out = Vec::with_capacity(n);
        {
            let (a, b) = self.peek();
            let take = a.len().min(n);
            out.extend_from_slice(&a[..take]);
            out.extend_from_slice(&b[..n - take]);
        }
        self.consume(n);
        Some(out)
    }

    /// Consume and return everything currently buffered.
    pub fn take_all(&mut self) -> Vec<u8> {
        let out = self.bytes();
        self.clear();
        out
    }

    /// Discard everything currently buffered.
    pub fn clear(&mut self) {
        self.r = 0;
        self.len = 0;
    }

    fn reserve(&mut self, extra: usize) {
        if self.len + extra <= self.buf.len() {
            return;
        }

        let new_cap = (self.len + extra).next_power_of_two();
        let mut new_buf = vec![0u8; new_cap].into_boxed_slice();
        {
            let (a, b) = self.peek();
            new_buf[..a.len()].copy_from_slice(a);
            new_buf[a.len()..a.len() + b.len()].copy_from_slice(b);
        }
        self.buf = new_buf;
        self.r = 0;
    }
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_back() {
        let mut ring = RingBuffer::with_capacity(64);
        ring.write_all(b"hello world");
        assert_eq!(ring.len(), 11);
        assert_eq!(ring.bytes(), b"hello world");
        // Non-consuming: still there.
        assert_eq!(ring.len(), 11);
    }

    #[test]
    fn read_n_is_all_or_nothing() {
        let mut ring = RingBuffer::new();
        ring.write_all(b"abcdef");

        // 6 bytes buffered, 10 requested: no-op.
        assert!(ring.read_n(10).is_none());
        assert_eq!(ring.len(), 6);
        assert_eq!(ring.bytes(), b"abcdef");

        // 4 more arrive, the same call now consumes exactly 10.
        ring.write_all(b"ghij");
        assert_eq!(ring.read_n(10).unwrap(), b"abcdefghij");
        assert!(ring.is_empty());
    }

    #[test]
    fn wraps_around_without_growing() {
        let mut ring = RingBuffer::with_capacity(64);
        ring.write_all(&[1u8; 48]);
        ring.consume(40);
        // 8 live bytes at offset 40; 24 more force a wrap.
        ring.write_all(&[2u8; 24]);
        assert_eq!(ring.capacity(), 64);
        assert_eq!(ring.len(), 32);

        let mut expected = vec![1u8; 8];
        expected.extend_from_slice(&[2u8; 24]);
        assert_eq!(ring.bytes(), expected);
    }

    #[test]
    fn grows_preserving_order() {
        let mut ring = RingBuffer::with_capacity(64);
        ring.write_all(&[1u8; 50]);
        ring.consume(30);
        ring.write_all(&[2u8; 100]);

        let mut expected = vec![1u8; 20];
        expected.extend_from_slice(&[2u8; 100]);
        assert_eq!(ring.take_all(), expected);
        assert!(ring.is_empty());
    }

    #[test]
    fn clear_discards_everything() {
        let mut ring = RingBuffer::new();
        ring.write_all(b"leftovers");
        ring.clear();
        assert!(ring.is_empty());
        assert_eq!(ring.bytes(), b"");
    }
}
