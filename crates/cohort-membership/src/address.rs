//! Node identity.
//!
//! A node is identified by its network address plus an incarnation
//! number. Restarting a process on the same address yields a new
//! incarnation, so the restarted node is a different member as far as
//! the protocol is concerned.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Last incarnation handed out by this process. Keeps uids strictly
/// increasing even when the wall clock stalls or steps backwards.
static LAST_INCARNATION: AtomicU64 = AtomicU64::new(0);

/// Network address plus incarnation number.
///
/// Ordered by address first, then by uid. Leader election and the
/// member map both rely on this total order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UniqueAddress {
    pub address: SocketAddr,
    pub uid: u64,
}

impl UniqueAddress {
    /// Creates a unique address from explicit parts.
    pub fn new(address: SocketAddr, uid: u64) -> Self {
        Self { address, uid }
    }

    /// Creates a unique address with a fresh incarnation.
    ///
    /// Incarnations are derived from the wall clock in microseconds and
    /// bumped past the previous value, so a process restarted on the same
    /// address always gets a larger uid than its predecessor.
    pub fn new_incarnation(address: SocketAddr) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        let mut prev = LAST_INCARNATION.load(Ordering::Relaxed);
        loop {
            let next = now.max(prev + 1);
            match LAST_INCARNATION.compare_exchange_weak(
                prev,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Self { address, uid: next },
                Err(actual) => prev = actual,
            }
        }
    }
}

impl std::fmt::Display for UniqueAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.address, self.uid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::new(127, 0, 0, 1), port))
    }

    #[test]
    fn ordering_is_address_then_uid() {
        let a = UniqueAddress::new(addr(7000), 9);
        let b = UniqueAddress::new(addr(7001), 1);
        let c = UniqueAddress::new(addr(7000), 10);
        assert!(a < b);
        assert!(a < c);
        assert!(c < b);
    }

    #[test]
    fn new_incarnations_strictly_increase() {
        let first = UniqueAddress::new_incarnation(addr(7000));
        let second = UniqueAddress::new_incarnation(addr(7000));
        assert_eq!(first.address, second.address);
        assert!(second.uid > first.uid);
        assert_ne!(first, second);
    }

    #[test]
    fn display_shows_address_and_uid() {
        let a = UniqueAddress::new(addr(7000), 42);
        assert_eq!(a.to_string(), "127.0.0.1:7000#42");
    }
}
