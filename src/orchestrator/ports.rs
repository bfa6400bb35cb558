//! Host port allocation for integration processes.

use std::collections::{BTreeSet, HashSet};
use std::sync::Mutex;

use crate::config::PortRange;
use crate::orchestrator::error::{OrchestratorError, Result};

struct PortSets {
    free: BTreeSet<u16>,
    in_use: HashSet<u16>,
}

/// Hands out ports from a fixed range; no port is ever held twice.
///
/// Allocation and release share one allocator-wide lock. Exhaustion is a
/// transient failure reported to the caller, never retried here.
pub struct PortAllocator {
    range: PortRange,
    sets: Mutex<PortSets>,
}

impl PortAllocator {
    pub fn new(range: PortRange) -> Self {
        Self {
            range,
            sets: Mutex::new(PortSets {
                free: (range.start..=range.end).collect(),
                in_use: HashSet::new(),
            }),
        }
    }

    /// Take the lowest free port.
    pub fn allocate(&self) -> Result<u16> {
        let mut sets = self.sets.lock().unwrap_or_else(|e| e.into_inner());
        let port = sets
            .free
            .pop_first()
            .ok_or(OrchestratorError::PortsExhausted {
                start: self.range.start,
                end: self.range.end,
            })?;
        sets.in_use.insert(port);
        tracing::trace!(port, "Allocated port");
        Ok(port)
    }

    /// Return a port to the free set. Releasing a port that is not held is a no-op.
    pub fn release(&self, port: u16) {
        let mut sets = self.sets.lock().unwrap_or_else(|e| e.into_inner());
        if sets.in_use.remove(&port) {
            sets.free.insert(port);
            tracing::trace!(port, "Released port");
        } else {
            tracing::warn!(port, "Ignoring release of a port that is not allocated");
        }
    }

    pub fn is_allocated(&self, port: u16) -> bool {
        let sets = self.sets.lock().unwrap_or_else(|e| e.into_inner());
        sets.in_use.contains(&port)
    }

    pub fn available(&self) -> usize {
        let sets = self.sets.lock().unwrap_or_else(|e| e.into_inner());
        sets.free.len()
    }

    pub fn in_use(&self) -> usize {
        let sets = self.sets.lock().unwrap_or_else(|e| e.into_inner());
        sets.in_use.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn allocator(start: u16, end: u16) -> PortAllocator {
        PortAllocator::new(PortRange::new(start, end).unwrap())
    }

    #[test]
    fn test_allocate_until_exhausted() {
        let ports = allocator(9100, 9102);

        assert_eq!(ports.allocate().unwrap(), 9100);
        assert_eq!(ports.allocate().unwrap(), 9101);
        assert_eq!(ports.allocate().unwrap(), 9102);

        let err = ports.allocate().unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::PortsExhausted {
                start: 9100,
                end: 9102
            }
        ));
        assert!(err.is_transient());
    }

    #[test]
    fn test_release_makes_port_reusable() {
        let ports = allocator(9100, 9101);
        let a = ports.allocate().unwrap();
        let _b = ports.allocate().unwrap();
        assert_eq!(ports.available(), 0);

        ports.release(a);
        assert!(!ports.is_allocated(a));
        assert_eq!(ports.allocate().unwrap(), a);
    }

    #[test]
    fn test_double_release_is_ignored() {
        let ports = allocator(9100, 9101);
        let a = ports.allocate().unwrap();
        ports.release(a);
        ports.release(a);
        ports.release(4242);

        assert_eq!(ports.available(), 2);
        assert_eq!(ports.in_use(), 0);
    }

    #[test]
    fn test_concurrent_allocations_are_unique() {
        let ports = Arc::new(allocator(20000, 20199));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ports = Arc::clone(&ports);
                std::thread::spawn(move || {
                    (0..25).map(|_| ports.allocate().unwrap()).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all: Vec<u16> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 200);
        assert_eq!(ports.available(), 0);
    }
}
