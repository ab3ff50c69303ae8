//! Bounded allocator for tags and fids.

use std::sync::{Mutex, PoisonError};

#[derive(Debug)]
struct Inner {
    cache: Vec<u32>,
    cur: u32,
    limit: u32,
}

/// Hands out values in `[start, limit)`, reusing released ones first.
#[derive(Debug)]
pub struct Pool {
    inner: Mutex<Inner>,
}

impl Pool {
    pub fn new(start: u32, limit: u32) -> Pool {
        Pool {
            inner: Mutex::new(Inner {
                cache: Vec::new(),
                cur: start,
                limit,
            }),
        }
    }

    /// Reserve a value, `None` once the pool is exhausted.
    pub fn next(&self) -> Option<u32> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(v) = inner.cache.pop() {
            return Some(v);
        }
        if inner.cur < inner.limit {
            let v = inner.cur;
            inner.cur += 1;
            return Some(v);
        }
        None
    }

    /// Return a value for reuse.
    pub fn put(&self, v: u32) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cache
            .push(v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn values_are_unique_until_put() {
        let pool = Pool::new(1, 4);
        assert_eq!(pool.next(), Some(1));
        assert_eq!(pool.next(), Some(2));
        assert_eq!(pool.next(), Some(3));
        assert_eq!(pool.next(), None);

        pool.put(2);
        assert_eq!(pool.next(), Some(2));
        assert_eq!(pool.next(), None);
    }

    #[test]
    fn tag_range_excludes_notag() {
        let pool = Pool::new(1, crate::fcall::NOTAG as u32);
        let mut last = 0;
        while let Some(v) = pool.next() {
            last = v;
        }
        assert_eq!(last, 0xfffe);
    }

    #[test]
    fn concurrent_next() {
        let pool = Arc::new(Pool::new(0, 10_000));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || (0..2500).filter_map(|_| pool.next()).collect::<Vec<_>>())
            })
            .collect();
        let mut seen = HashSet::new();
        for h in handles {
            for v in h.join().unwrap() {
                assert!(seen.insert(v), "{} handed out twice", v);
            }
        }
        assert_eq!(seen.len(), 10_000);
        assert_eq!(pool.next(), None);
    }
}
