//! Host port allocation
//!
//! Hands out host ports from an inclusive range. A port is free when no
//! active lease holds it and the OS lets us bind it. The scan and the
//! reservation happen under one lock, so concurrent callers never receive
//! the same port. A lease gives its port back exactly once, when released or
//! dropped.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::net::TcpListener;
use std::sync::Arc;
use tracing::debug;

use crate::error::{DeployError, Result};

/// Probe for whether the OS has a port in use
pub trait PortProbe: Send + Sync {
    fn is_free(&self, port: u16) -> bool;
}

/// Probes by binding a listener on all interfaces and closing it again
#[derive(Debug, Default, Clone, Copy)]
pub struct OsPortProbe;

impl PortProbe for OsPortProbe {
    fn is_free(&self, port: u16) -> bool {
        TcpListener::bind(("0.0.0.0", port)).is_ok()
    }
}

/// Allocator over a configured port range
#[derive(Clone)]
pub struct PortAllocator {
    low: u16,
    high: u16,
    reserved: Arc<Mutex<BTreeSet<u16>>>,
    probe: Arc<dyn PortProbe>,
}

impl PortAllocator {
    pub fn new(low: u16, high: u16) -> Self {
        Self::with_probe(low, high, Arc::new(OsPortProbe))
    }

    pub fn with_probe(low: u16, high: u16, probe: Arc<dyn PortProbe>) -> Self {
        Self {
            low,
            high,
            reserved: Arc::new(Mutex::new(BTreeSet::new())),
            probe,
        }
    }

    pub fn range(&self) -> (u16, u16) {
        (self.low, self.high)
    }

    /// Allocates from the configured range
    pub fn allocate(&self) -> Result<PortLease> {
        self.allocate_in(self.low, self.high)
    }

    /// Allocates the lowest free port in `[low, high]`
    pub fn allocate_in(&self, low: u16, high: u16) -> Result<PortLease> {
        let mut reserved = self.reserved.lock();
        let port = (low..=high)
            .filter(|port| !reserved.contains(port))
            .find(|port| self.probe.is_free(*port))
            .ok_or(DeployError::NoPortAvailable { low, high })?;

        reserved.insert(port);
        debug!("Reserved port {}", port);
        Ok(PortLease {
            port,
            reserved: Some(Arc::clone(&self.reserved)),
        })
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.reserved.lock().contains(&port)
    }

    /// Number of ports currently leased
    pub fn in_use(&self) -> usize {
        self.reserved.lock().len()
    }
}

/// A reserved port; released on `release()` or drop
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    reserved: Option<Arc<Mutex<BTreeSet<u16>>>>,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the port to the allocator; further calls do nothing
    pub fn release(&mut self) {
        if let Some(reserved) = self.reserved.take() {
            reserved.lock().remove(&self.port);
            debug!("Released port {}", self.port);
        }
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    /// Reports a fixed set of ports as taken by the OS
    struct FakeProbe(HashSet<u16>);

    impl PortProbe for FakeProbe {
        fn is_free(&self, port: u16) -> bool {
            !self.0.contains(&port)
        }
    }

    fn allocator(low: u16, high: u16, taken: &[u16]) -> PortAllocator {
        PortAllocator::with_probe(
            low,
            high,
            Arc::new(FakeProbe(taken.iter().copied().collect())),
        )
    }

    #[test]
    fn test_skips_os_bound_ports() {
        let ports = allocator(40000, 40005, &[40000, 40001]);
        assert_eq!(ports.allocate().unwrap().port(), 40002);
    }

    #[test]
    fn test_range_exhaustion() {
        let ports = allocator(40000, 40002, &[]);
        let leases: Vec<_> = (0..3).map(|_| ports.allocate().unwrap()).collect();
        let distinct: HashSet<u16> = leases.iter().map(PortLease::port).collect();
        assert_eq!(distinct.len(), 3);

        assert!(matches!(
            ports.allocate(),
            Err(DeployError::NoPortAvailable {
                low: 40000,
                high: 40002
            })
        ));
    }

    #[test]
    fn test_concurrent_allocations_are_distinct() {
        let ports = allocator(41000, 41063, &[]);
        let handles: Vec<_> = (0..64)
            .map(|_| {
                let ports = ports.clone();
                std::thread::spawn(move || ports.allocate())
            })
            .collect();
        let leases: Vec<PortLease> = handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect();

        let distinct: HashSet<u16> = leases.iter().map(PortLease::port).collect();
        assert_eq!(distinct.len(), 64);
        assert!(ports.allocate().is_err());
    }

    #[test]
    fn test_release_is_idempotent_and_frees_port() {
        let ports = allocator(40000, 40000, &[]);
        let mut lease = ports.allocate().unwrap();
        assert!(ports.is_reserved(40000));

        lease.release();
        lease.release();
        assert!(!ports.is_reserved(40000));

        let again = ports.allocate().unwrap();
        assert_eq!(again.port(), 40000);
        drop(lease);
        assert!(ports.is_reserved(40000));
    }

    #[test]
    fn test_drop_releases() {
        let ports = allocator(40000, 40000, &[]);
        {
            let _lease = ports.allocate().unwrap();
            assert_eq!(ports.in_use(), 1);
        }
        assert_eq!(ports.in_use(), 0);
    }

    #[test]
    fn test_os_probe_sees_bound_listener() {
        let listener = TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!OsPortProbe.is_free(port));
    }
}
