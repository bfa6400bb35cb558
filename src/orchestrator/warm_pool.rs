//! Bounded set of customers with resident processes, in LRU order.
//!
//! Besides the warm entries the pool remembers customers whose processes
//! are still being stopped ("draining"). A customer evicted to make room
//! drains in place of the newcomer, which waits for that drain before
//! starting anything; a customer released by an operator keeps holding
//! its capacity until its drain ends. Either way, customers with live
//! processes never outnumber `max_warm`.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::Serialize;

/// One pool entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolEntry {
    pub customer: String,
    pub last_used: DateTime<Utc>,
}

/// Result of [`WarmPool::touch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Already warm, now most recently used.
    Resident,
    /// Inserted into free capacity.
    Admitted,
    /// Inserted in place of the returned customer, which must be drained
    /// before the newcomer starts.
    Evicted(String),
    /// Every evictable entry is busy, or drains hold the free capacity.
    Saturated,
    /// The customer itself is still draining.
    Draining,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Drain {
    /// Capacity already handed to the customer that evicted it.
    Evicted,
    /// Still holds capacity.
    Released,
}

struct PoolState {
    entries: LruCache<String, DateTime<Utc>>,
    draining: HashMap<String, Drain>,
}

impl PoolState {
    fn held_by_drains(&self) -> usize {
        self.draining
            .values()
            .filter(|d| **d == Drain::Released)
            .count()
    }
}

/// Tracks which customers may keep processes resident.
///
/// Only accounting lives here; stopping a drained customer's processes is
/// the caller's job, reported back through [`finish_drain`](Self::finish_drain).
pub struct WarmPool {
    max_warm: usize,
    state: Mutex<PoolState>,
}

impl WarmPool {
    pub fn new(max_warm: usize) -> Self {
        Self {
            max_warm: max_warm.max(1),
            state: Mutex::new(PoolState {
                entries: LruCache::unbounded(),
                draining: HashMap::new(),
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn max_warm(&self) -> usize {
        self.max_warm
    }

    /// Mark `customer` most recently used, inserting it if there is room.
    ///
    /// When the pool is full, the least recently used other entry not in
    /// `busy` moves to draining and is returned as the victim. On
    /// [`Admission::Saturated`] and [`Admission::Draining`] the pool is left
    /// unchanged and the caller retries after a switch or drain ends.
    pub fn touch(&self, customer: &str, busy: &HashSet<String>) -> Admission {
        let mut state = self.state();
        let now = Utc::now();

        if let Some(last_used) = state.entries.get_mut(customer) {
            *last_used = now;
            return Admission::Resident;
        }
        if state.draining.contains_key(customer) {
            return Admission::Draining;
        }

        if state.entries.len() < self.max_warm {
            if state.entries.len() + state.held_by_drains() >= self.max_warm {
                return Admission::Saturated;
            }
            state.entries.put(customer.to_string(), now);
            return Admission::Admitted;
        }

        let Some(victim) = state
            .entries
            .iter()
            .rev()
            .map(|(name, _)| name)
            .find(|name| !busy.contains(name.as_str()))
            .cloned()
        else {
            return Admission::Saturated;
        };

        state.entries.pop(&victim);
        state.draining.insert(victim.clone(), Drain::Evicted);
        state.entries.put(customer.to_string(), now);
        tracing::info!(customer, evicted = %victim, "Warm pool full, evicting LRU customer");
        Admission::Evicted(victim)
    }

    /// Remove an entry without stopping anything.
    pub fn release(&self, customer: &str) -> bool {
        self.state().entries.pop(customer).is_some()
    }

    /// Remove an entry whose processes are about to be stopped; it keeps
    /// holding capacity until [`finish_drain`](Self::finish_drain).
    pub fn begin_drain(&self, customer: &str) {
        let mut state = self.state();
        if state.entries.pop(customer).is_some() {
            state
                .draining
                .entry(customer.to_string())
                .or_insert(Drain::Released);
        }
    }

    /// The customer's processes are gone.
    pub fn finish_drain(&self, customer: &str) {
        self.state().draining.remove(customer);
    }

    pub fn contains(&self, customer: &str) -> bool {
        self.state().entries.contains(customer)
    }

    pub fn is_draining(&self, customer: &str) -> bool {
        self.state().draining.contains_key(customer)
    }

    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries, most recently used first.
    pub fn entries(&self) -> Vec<PoolEntry> {
        self.state()
            .entries
            .iter()
            .map(|(customer, last_used)| PoolEntry {
                customer: customer.clone(),
                last_used: *last_used,
            })
            .collect()
    }

    /// Drop every entry and drain, returning the removed entries.
    pub fn clear(&self) -> Vec<String> {
        let mut state = self.state();
        state.draining.clear();
        let mut removed = Vec::with_capacity(state.entries.len());
        while let Some((customer, _)) = state.entries.pop_lru() {
            removed.push(customer);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn names(pool: &WarmPool) -> Vec<String> {
        pool.entries().into_iter().map(|e| e.customer).collect()
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let pool = WarmPool::new(2);
        let idle = HashSet::new();

        assert_eq!(pool.touch("a", &idle), Admission::Admitted);
        assert_eq!(pool.touch("b", &idle), Admission::Admitted);
        assert_eq!(pool.touch("c", &idle), Admission::Evicted("a".to_string()));
        assert_eq!(names(&pool), vec!["c", "b"]);
        assert!(pool.is_draining("a"));
    }

    #[test]
    fn test_touch_refreshes_order() {
        let pool = WarmPool::new(2);
        let idle = HashSet::new();

        pool.touch("a", &idle);
        pool.touch("b", &idle);
        // a becomes MRU, so b is the victim
        assert_eq!(pool.touch("a", &idle), Admission::Resident);
        assert_eq!(pool.touch("c", &idle), Admission::Evicted("b".to_string()));
        assert_eq!(names(&pool), vec!["c", "a"]);
    }

    #[test]
    fn test_busy_customers_are_skipped() {
        let pool = WarmPool::new(2);
        pool.touch("a", &HashSet::new());
        pool.touch("b", &HashSet::new());

        let busy: HashSet<String> = ["a".to_string()].into();
        assert_eq!(pool.touch("c", &busy), Admission::Evicted("b".to_string()));
        assert!(pool.contains("a"));
    }

    #[test]
    fn test_saturated_pool_is_unchanged() {
        let pool = WarmPool::new(1);
        pool.touch("a", &HashSet::new());

        let busy: HashSet<String> = ["a".to_string()].into();
        assert_eq!(pool.touch("b", &busy), Admission::Saturated);
        assert_eq!(names(&pool), vec!["a"]);
    }

    #[test]
    fn test_draining_customer_waits() {
        let pool = WarmPool::new(1);
        let idle = HashSet::new();
        pool.touch("a", &idle);
        pool.touch("b", &idle);

        assert_eq!(pool.touch("a", &idle), Admission::Draining);
        pool.finish_drain("a");
        assert_eq!(pool.touch("a", &idle), Admission::Evicted("b".to_string()));
    }

    #[test]
    fn test_released_drain_holds_capacity() {
        let pool = WarmPool::new(2);
        let idle = HashSet::new();
        pool.touch("a", &idle);
        pool.touch("b", &idle);

        pool.begin_drain("a");
        assert!(!pool.contains("a"));
        assert_eq!(pool.touch("c", &idle), Admission::Saturated);

        pool.finish_drain("a");
        assert_eq!(pool.touch("c", &idle), Admission::Admitted);
    }

    #[test]
    fn test_release_and_clear() {
        let pool = WarmPool::new(3);
        for name in ["a", "b", "c"] {
            pool.touch(name, &HashSet::new());
        }

        assert!(pool.release("b"));
        assert!(!pool.release("b"));
        assert_eq!(pool.len(), 2);

        assert_eq!(pool.clear(), vec!["a", "c"]);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_never_exceeds_max_warm() {
        let pool = WarmPool::new(3);
        for i in 0..20 {
            let admission = pool.touch(&format!("customer-{}", i % 7), &HashSet::new());
            if let Admission::Evicted(victim) = admission {
                pool.finish_drain(&victim);
            }
            assert!(pool.len() <= 3);
        }
    }
}
