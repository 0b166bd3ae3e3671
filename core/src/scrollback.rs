//! Bounded, append-only byte store per session. New data appends; once over capacity,
//! the oldest bytes are dropped at byte granularity (an ANSI escape at the head may be
//! truncated — consumers tolerate a partial leading sequence).

use std::sync::Mutex;

pub struct ScrollbackRing {
    data: Mutex<Vec<u8>>,
    cap: usize,
}

impl ScrollbackRing {
    pub fn new(cap: usize) -> Self {
        Self {
            data: Mutex::new(Vec::new()),
            cap,
        }
    }

    /// Append bytes; drop the oldest bytes if this pushes the buffer over capacity.
    pub fn append(&self, bytes: &[u8]) {
        let mut g = self.data.lock().expect("scrollback mutex");
        g.extend_from_slice(bytes);
        if g.len() > self.cap {
            let excess = g.len() - self.cap;
            g.drain(..excess);
        }
    }

    /// A consistent copy of the current contents. Never aliases the live buffer.
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().expect("scrollback mutex").clone()
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_snapshot() {
        let rb = ScrollbackRing::new(16);
        assert!(rb.snapshot().is_empty());
    }

    #[test]
    fn appends_under_capacity() {
        let rb = ScrollbackRing::new(16);
        rb.append(b"hello");
        assert_eq!(rb.snapshot(), b"hello");
    }

    #[test]
    fn drops_oldest_over_capacity() {
        let rb = ScrollbackRing::new(8);
        rb.append(b"12345678");
        rb.append(b"90");
        assert_eq!(rb.snapshot(), b"34567890");
    }

    #[test]
    fn single_write_larger_than_capacity_keeps_tail() {
        let rb = ScrollbackRing::new(4);
        rb.append(b"0123456789");
        assert_eq!(rb.snapshot(), b"6789");
    }

    #[test]
    fn snapshot_does_not_alias_live_buffer() {
        let rb = ScrollbackRing::new(16);
        rb.append(b"abc");
        let mut snap = rb.snapshot();
        snap.push(b'z');
        assert_eq!(rb.snapshot(), b"abc");
    }

    #[test]
    fn many_small_appends_preserve_order() {
        let rb = ScrollbackRing::new(1024);
        for i in 0..100u8 {
            rb.append(&[i]);
        }
        let snap = rb.snapshot();
        assert_eq!(snap.len(), 100);
        assert_eq!(snap[0], 0);
        assert_eq!(snap[99], 99);
    }
}
