//! Request id pools correlating asynchronous replies with their requests.

use std::collections::HashMap;

/// Pool of 32-bit request ids, each bound to a completion token
///
/// Ids are handed out from a wrapping counter that skips 0 and any id
/// still outstanding.
#[derive(Debug)]
pub struct ReqidPool<T> {
    name: &'static str,
    pending: HashMap<u32, T>,
    next_id: u32,
}

impl<T> ReqidPool<T> {
    /// Create a pool starting at id 1
    pub fn new(name: &'static str) -> Self {
        Self::with_start(name, 1)
    }

    /// Create a pool whose first allocation tries `start`
    pub fn with_start(name: &'static str, start: u32) -> Self {
        Self {
            name,
            pending: HashMap::new(),
            next_id: start,
        }
    }

    /// Bind `token` to a fresh id
    pub fn allocate(&mut self, token: T) -> u32 {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if id != 0 && !self.pending.contains_key(&id) {
                self.pending.insert(id, token);
                tracing::trace!(pool = self.name, id, "Request id allocated");
                return id;
            }
        }
    }

    /// Release an id, returning its token; absent ids are ignored
    pub fn free(&mut self, id: u32) -> Option<T> {
        self.pending.remove(&id)
    }

    /// Token bound to `id`
    pub fn lookup(&self, id: u32) -> Option<&T> {
        self.pending.get(&id)
    }

    /// Outstanding ids
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is outstanding
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_unique_and_nonzero() {
        let mut pool = ReqidPool::new("test");
        let a = pool.allocate("a");
        let b = pool.allocate("b");
        assert_ne!(a, 0);
        assert_ne!(a, b);
        assert_eq!(pool.lookup(a), Some(&"a"));
        assert_eq!(pool.lookup(b), Some(&"b"));
    }

    #[test]
    fn test_free_then_lookup_is_none() {
        let mut pool = ReqidPool::new("test");
        let id = pool.allocate(5u8);
        assert_eq!(pool.free(id), Some(5));
        assert!(pool.lookup(id).is_none());
        assert_eq!(pool.free(id), None);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_wrap_skips_zero_and_in_use() {
        let mut pool = ReqidPool::with_start("test", u32::MAX - 1);
        let first = pool.allocate(1);
        let second = pool.allocate(2);
        let third = pool.allocate(3);
        assert_eq!(first, u32::MAX - 1);
        assert_eq!(second, u32::MAX);
        assert_eq!(third, 1);

        let mut pool = ReqidPool::with_start("test", 7);
        let held = pool.allocate(());
        assert_eq!(held, 7);
        pool.next_id = 7;
        assert_eq!(pool.allocate(()), 8);
    }

    #[test]
    fn test_pools_are_independent() {
        let mut packets = ReqidPool::new("packet");
        let mut events = ReqidPool::new("event");
        let p = packets.allocate('p');
        let e = events.allocate('e');
        assert_eq!(p, e);
        packets.free(p);
        assert_eq!(events.lookup(e), Some(&'e'));
    }
}
