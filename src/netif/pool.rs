//! Private /24 address pool.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

/// Lowest host octet handed out; `.1` is left for a gateway.
const FIRST_HOST: u8 = 2;
/// Highest host octet handed out; `.255` is broadcast.
const LAST_HOST: u8 = 254;

/// Hands out one address per package from a /24, lowest free first.
#[derive(Debug, Clone)]
pub struct AddressPool {
    base: Ipv4Addr,
    used: BTreeSet<u8>,
}

impl AddressPool {
    /// Pool over `base/24`. The last octet of `base` is ignored.
    pub fn new(base: Ipv4Addr) -> Self {
        let [a, b, c, _] = base.octets();
        Self {
            base: Ipv4Addr::new(a, b, c, 0),
            used: BTreeSet::new(),
        }
    }

    /// Network address of the pool.
    pub fn base(&self) -> Ipv4Addr {
        self.base
    }

    /// Take the lowest free address.
    pub fn allocate(&mut self) -> Option<Ipv4Addr> {
        let octet = (FIRST_HOST..=LAST_HOST).find(|o| !self.used.contains(o))?;
        self.used.insert(octet);
        Some(self.address(octet))
    }

    /// Return `addr` to the pool. Returns whether it was assigned.
    pub fn release(&mut self, addr: Ipv4Addr) -> bool {
        match self.host_octet(addr) {
            Some(octet) => self.used.remove(&octet),
            None => false,
        }
    }

    /// Number of assigned addresses.
    pub fn in_use(&self) -> usize {
        self.used.len()
    }

    /// Addresses the pool can hand out in total.
    pub fn capacity(&self) -> usize {
        usize::from(LAST_HOST - FIRST_HOST) + 1
    }

    fn address(&self, octet: u8) -> Ipv4Addr {
        let [a, b, c, _] = self.base.octets();
        Ipv4Addr::new(a, b, c, octet)
    }

    fn host_octet(&self, addr: Ipv4Addr) -> Option<u8> {
        let [a, b, c, d] = addr.octets();
        let [ba, bb, bc, _] = self.base.octets();
        ((a, b, c) == (ba, bb, bc)).then_some(d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_allocation() {
        let mut pool = AddressPool::new(Ipv4Addr::new(10, 47, 0, 0));
        assert_eq!(pool.allocate(), Some(Ipv4Addr::new(10, 47, 0, 2)));
        assert_eq!(pool.allocate(), Some(Ipv4Addr::new(10, 47, 0, 3)));
        assert_eq!(pool.in_use(), 2);
    }

    #[test]
    fn test_released_address_reused_first() {
        let mut pool = AddressPool::new(Ipv4Addr::new(10, 47, 0, 0));
        let a = pool.allocate().unwrap();
        let _b = pool.allocate().unwrap();

        assert!(pool.release(a));
        assert!(!pool.release(a));
        assert_eq!(pool.allocate(), Some(a));
    }

    #[test]
    fn test_exhaustion() {
        let mut pool = AddressPool::new(Ipv4Addr::new(192, 168, 9, 0));
        for _ in 0..pool.capacity() {
            assert!(pool.allocate().is_some());
        }
        assert_eq!(pool.allocate(), None);
        assert_eq!(pool.in_use(), 253);
    }

    #[test]
    fn test_foreign_address_not_released() {
        let mut pool = AddressPool::new(Ipv4Addr::new(10, 47, 0, 0));
        pool.allocate().unwrap();
        assert!(!pool.release(Ipv4Addr::new(10, 48, 0, 2)));
        assert_eq!(pool.in_use(), 1);
    }
}
