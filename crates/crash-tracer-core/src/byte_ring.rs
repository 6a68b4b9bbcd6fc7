//! Bounded byte ring for error-stream capture.
//!
//! Keeps the most recent N bytes of a target's stderr. Diagnostic output
//! is typically emitted just before death, so on overflow the oldest
//! bytes are dropped. No allocations after the ring reaches capacity.

use std::collections::VecDeque;

/// A fixed-capacity byte ring.
///
/// When full, appended bytes evict the oldest bytes. `total_seen`
/// tracks how many bytes passed through, so callers can tell a small
/// capture from a truncated one.
#[derive(Debug)]
pub struct ByteRing {
    buf: VecDeque<u8>,
    capacity: usize,
    total_seen: u64,
}

impl ByteRing {
    /// Create a ring holding at most `capacity` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be > 0");
        Self {
            buf: VecDeque::with_capacity(capacity),
            capacity,
            total_seen: 0,
        }
    }

    /// Append a chunk, evicting from the front on overflow.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.total_seen += chunk.len() as u64;
        if chunk.len() >= self.capacity {
            // Chunk alone fills the ring: keep only its tail.
            self.buf.clear();
            self.buf.extend(&chunk[chunk.len() - self.capacity..]);
            return;
        }
        let overflow = (self.buf.len() + chunk.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            self.buf.drain(..overflow);
        }
        self.buf.extend(chunk);
    }

    /// Bytes currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing was captured yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Configured capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total bytes ever appended, including evicted ones.
    #[must_use]
    pub fn total_seen(&self) -> u64 {
        self.total_seen
    }

    /// Whether the front of the capture was dropped.
    #[must_use]
    pub fn truncated(&self) -> bool {
        self.total_seen > self.buf.len() as u64
    }

    /// Copy out the retained bytes, oldest first.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let (a, b) = self.buf.as_slices();
        let mut out = Vec::with_capacity(a.len() + b.len());
        out.extend_from_slice(a);
        out.extend_from_slice(b);
        out
    }

    /// Render the tail of the capture as text, trimmed to whole lines.
    ///
    /// Returns up to `max_bytes` of the most recent output. When the cut
    /// would land mid-line, the partial first line is dropped so the
    /// excerpt starts at a line boundary (unless that would discard
    /// everything). Invalid UTF-8 is replaced lossily.
    #[must_use]
    pub fn tail_excerpt(&self, max_bytes: usize) -> String {
        let bytes = self.to_bytes();
        let start = bytes.len().saturating_sub(max_bytes);
        let mut window = &bytes[start..];
        if start > 0 {
            // Mid-line cut: resume at the next line boundary when one exists.
            if let Some(nl) = memchr::memchr(b'\n', window) {
                if nl + 1 < window.len() {
                    window = &window[nl + 1..];
                }
            }
        }
        String::from_utf8_lossy(window).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // -- Basic operations -------------------------------------------------------

    #[test]
    fn new_ring_is_empty() {
        let ring = ByteRing::new(16);
        assert!(ring.is_empty());
        assert_eq!(ring.len(), 0);
        assert_eq!(ring.capacity(), 16);
        assert_eq!(ring.total_seen(), 0);
        assert!(!ring.truncated());
    }

    #[test]
    fn extend_within_capacity() {
        let mut ring = ByteRing::new(16);
        ring.extend(b"hello");
        assert_eq!(ring.to_bytes(), b"hello");
        assert_eq!(ring.total_seen(), 5);
        assert!(!ring.truncated());
    }

    #[test]
    fn overflow_drops_oldest() {
        let mut ring = ByteRing::new(8);
        ring.extend(b"abcdefgh");
        ring.extend(b"XY");
        assert_eq!(ring.to_bytes(), b"cdefghXY");
        assert_eq!(ring.total_seen(), 10);
        assert!(ring.truncated());
    }

    #[test]
    fn oversized_chunk_keeps_tail() {
        let mut ring = ByteRing::new(4);
        ring.extend(b"0123456789");
        assert_eq!(ring.to_bytes(), b"6789");
        assert_eq!(ring.total_seen(), 10);
    }

    // -- Excerpts ----------------------------------------------------------------

    #[test]
    fn excerpt_returns_everything_when_small() {
        let mut ring = ByteRing::new(64);
        ring.extend(b"line one\nline two\n");
        assert_eq!(ring.tail_excerpt(64), "line one\nline two\n");
    }

    #[test]
    fn excerpt_trims_partial_first_line() {
        let mut ring = ByteRing::new(64);
        ring.extend(b"aaaa\nbbbb\ncccc\n");
        // A 7-byte window lands inside "bbbb" -> excerpt resumes at "cccc".
        assert_eq!(ring.tail_excerpt(7), "cccc\n");
    }

    #[test]
    fn excerpt_keeps_partial_line_when_nothing_else() {
        let mut ring = ByteRing::new(64);
        ring.extend(b"one long line without newline");
        let excerpt = ring.tail_excerpt(8);
        assert_eq!(excerpt, " newline");
    }

    #[test]
    fn excerpt_is_lossy_on_invalid_utf8() {
        let mut ring = ByteRing::new(16);
        ring.extend(&[0xff, 0xfe, b'o', b'k']);
        let excerpt = ring.tail_excerpt(16);
        assert!(excerpt.ends_with("ok"));
    }

    // -- Properties --------------------------------------------------------------

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn never_exceeds_capacity(
                cap in 1usize..256,
                chunks in proptest::collection::vec(
                    proptest::collection::vec(any::<u8>(), 0..64), 0..32),
            ) {
                let mut ring = ByteRing::new(cap);
                for chunk in &chunks {
                    ring.extend(chunk);
                    prop_assert!(ring.len() <= cap);
                }
                let total: u64 = chunks.iter().map(|c| c.len() as u64).sum();
                prop_assert_eq!(ring.total_seen(), total);
            }

            #[test]
            fn retains_exact_tail(
                cap in 1usize..128,
                data in proptest::collection::vec(any::<u8>(), 0..512),
            ) {
                let mut ring = ByteRing::new(cap);
                for chunk in data.chunks(7) {
                    ring.extend(chunk);
                }
                let expect_start = data.len().saturating_sub(cap);
                prop_assert_eq!(ring.to_bytes(), &data[expect_start..]);
            }
        }
    }
}
