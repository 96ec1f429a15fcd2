use std::{collections::BTreeSet, io::ErrorKind, net::TcpListener, sync::Mutex};

use crate::error::{HiveError, HiveResult};

/// Hands out unique ports from an inclusive range.
///
/// The free set is the only shared state; every call holds the lock for a
/// single set operation.
#[derive(Debug)]
pub struct PortAllocator {
    start: u16,
    end: u16,
    free: Mutex<BTreeSet<u16>>,
}

impl PortAllocator {
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start,
            end,
            free: Mutex::new((start..=end).collect()),
        }
    }

    pub fn range(&self) -> (u16, u16) {
        (self.start, self.end)
    }

    fn pool(&self) -> std::sync::MutexGuard<'_, BTreeSet<u16>> {
        self.free.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Lowest free port.
    pub fn allocate(&self) -> HiveResult<u16> {
        self.pool().pop_first().ok_or(HiveError::PortExhausted {
            start: self.start,
            end: self.end,
        })
    }

    /// Mark a known port as taken (boot-time reconciliation). Returns false if
    /// it was already taken or lies outside the range.
    pub fn reserve(&self, port: u16) -> bool {
        self.pool().remove(&port)
    }

    /// Return a port to the pool. Releasing an unallocated or foreign port is a no-op.
    pub fn release(&self, port: u16) {
        if port < self.start || port > self.end {
            return;
        }
        self.pool().insert(port);
    }

    pub fn is_allocated(&self, port: u16) -> bool {
        port >= self.start && port <= self.end && !self.pool().contains(&port)
    }

    pub fn free_count(&self) -> usize {
        self.pool().len()
    }

    pub fn capacity(&self) -> usize {
        usize::from(self.end - self.start) + 1
    }
}

/// True when nothing on this host is bound to `port`.
pub fn probe_tcp_port(port: u16) -> bool {
    match TcpListener::bind(("0.0.0.0", port)) {
        Ok(l) => {
            drop(l);
            true
        }
        Err(e) if e.kind() == ErrorKind::AddrInUse => false,
        Err(e) => {
            tracing::warn!(port, error = %e, "port probe failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_lowest_free_port() {
        let a = PortAllocator::new(18100, 18199);
        assert_eq!(a.allocate().unwrap(), 18100);
        assert_eq!(a.allocate().unwrap(), 18101);
        a.release(18100);
        assert_eq!(a.allocate().unwrap(), 18100);
    }

    #[test]
    fn exhausts_exactly_after_range_size() {
        let a = PortAllocator::new(20000, 20009);
        let mut seen = BTreeSet::new();
        for _ in 0..10 {
            assert!(seen.insert(a.allocate().unwrap()));
        }
        let err = a.allocate().unwrap_err();
        assert!(matches!(
            err,
            HiveError::PortExhausted {
                start: 20000,
                end: 20009
            }
        ));
    }

    #[test]
    fn release_is_idempotent() {
        let a = PortAllocator::new(18100, 18102);
        let p = a.allocate().unwrap();
        a.release(p);
        a.release(p);
        a.release(18101);
        a.release(9);
        assert_eq!(a.free_count(), 3);
        assert_eq!(a.capacity(), 3);
    }

    #[test]
    fn reserve_removes_port_from_pool() {
        let a = PortAllocator::new(18100, 18102);
        assert!(a.reserve(18100));
        assert!(!a.reserve(18100));
        assert!(!a.reserve(80));
        assert!(a.is_allocated(18100));
        assert_eq!(a.allocate().unwrap(), 18101);
    }

    #[test]
    fn probe_detects_bound_port() {
        let l = TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let port = l.local_addr().unwrap().port();
        assert!(!probe_tcp_port(port));
        drop(l);
    }
}
