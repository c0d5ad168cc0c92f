//! Lease allocator: dense integer claims for parallel workers.
//!
//! A lease is a claim by a named worker on a position in a pool. Within a
//! pool the assigned integers of non-expired leases always form
//! `{0, 1, …, k-1}`: allocations take the smallest free integer, renewals
//! keep their integer, and releases or expiries open gaps the next
//! allocation fills.
//!
//! Expired entries are pruned at the top of every `lease` call, so the
//! allocator stays correct even if the periodic sweeper never fires.

use std::collections::HashMap;

/// One active lease, keyed externally by worker id.
#[derive(Debug, Clone)]
pub struct LeaseEntry {
    /// Pool this lease belongs to.
    pub pool_key: String,
    /// Dense integer assigned within the pool.
    pub assigned_value: u64,
    /// Absolute expiry, wall-clock milliseconds.
    pub expires_at: u64,
}

/// Policy failures from `lease`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseError {
    /// Pool key or worker id was empty.
    KeyAndWorkerRequired,
    /// The worker holds a non-expired lease in a different pool.
    WorkerAlreadyHasLease,
}

/// The lease table. A worker holds at most one lease at a time.
#[derive(Debug, Default)]
pub struct LeaseTable {
    leases: HashMap<String, LeaseEntry>,
    default_ttl_ms: u64,
}

impl LeaseTable {
    /// Creates an empty table; `default_ttl_ms` applies when a lease
    /// request omits its TTL.
    #[must_use]
    pub fn new(default_ttl_ms: u64) -> Self {
        Self {
            leases: HashMap::new(),
            default_ttl_ms,
        }
    }

    /// Allocates or renews a lease, returning the assigned integer.
    ///
    /// A repeat request from the same worker for the same pool renews the
    /// expiry and returns the original integer; for a different pool it
    /// fails while the existing lease is live.
    ///
    /// # Errors
    ///
    /// [`LeaseError::KeyAndWorkerRequired`] on empty identifiers,
    /// [`LeaseError::WorkerAlreadyHasLease`] on a cross-pool conflict.
    pub fn lease(
        &mut self,
        pool_key: &str,
        worker_id: &str,
        ttl: Option<i64>,
        now: u64,
    ) -> Result<u64, LeaseError> {
        if pool_key.is_empty() || worker_id.is_empty() {
            return Err(LeaseError::KeyAndWorkerRequired);
        }

        // Eager prune keeps the dense-set property independent of sweeper
        // cadence.
        self.sweep(now);

        let ttl_ms = match ttl {
            Some(ms) if ms > 0 => ms as u64,
            _ => self.default_ttl_ms,
        };
        let expires_at = now + ttl_ms;

        if let Some(existing) = self.leases.get_mut(worker_id) {
            if existing.pool_key == pool_key {
                existing.expires_at = expires_at;
                return Ok(existing.assigned_value);
            }
            return Err(LeaseError::WorkerAlreadyHasLease);
        }

        let assigned = self.smallest_free(pool_key);
        self.leases.insert(
            worker_id.to_string(),
            LeaseEntry {
                pool_key: pool_key.to_string(),
                assigned_value: assigned,
                expires_at,
            },
        );
        Ok(assigned)
    }

    /// Releases a worker's lease, reporting whether one was held.
    ///
    /// Releasing an unknown worker is not an error.
    pub fn release(&mut self, worker_id: &str) -> bool {
        self.leases.remove(worker_id).is_some()
    }

    /// Removes expired leases, returning how many were evicted.
    pub fn sweep(&mut self, now: u64) -> u64 {
        let before = self.leases.len();
        self.leases.retain(|_, entry| entry.expires_at > now);
        (before - self.leases.len()) as u64
    }

    /// Count of non-expired leases.
    #[must_use]
    pub fn live_count(&self, now: u64) -> usize {
        self.leases
            .values()
            .filter(|entry| entry.expires_at > now)
            .count()
    }

    /// Drops every lease.
    pub fn clear(&mut self) {
        self.leases.clear();
    }

    /// Smallest non-negative integer not assigned in the pool.
    ///
    /// O(k) over the pool; pools are small (low hundreds), so a scan beats
    /// maintaining per-pool free heaps.
    fn smallest_free(&self, pool_key: &str) -> u64 {
        let mut taken: Vec<u64> = self
            .leases
            .values()
            .filter(|entry| entry.pool_key == pool_key)
            .map(|entry| entry.assigned_value)
            .collect();
        taken.sort_unstable();

        let mut candidate = 0;
        for value in taken {
            if value == candidate {
                candidate += 1;
            } else if value > candidate {
                break;
            }
        }
        candidate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> LeaseTable {
        LeaseTable::new(1_800_000)
    }

    #[test]
    fn allocation_is_dense_from_zero() {
        let mut table = table();
        for (i, worker) in ["w1", "w2", "w3", "w4", "w5"].iter().enumerate() {
            let value = table.lease("p", worker, Some(60_000), 0).unwrap();
            assert_eq!(value, i as u64);
        }
    }

    #[test]
    fn release_opens_gap_that_next_allocation_fills() {
        let mut table = table();
        for worker in ["w1", "w2", "w3", "w4", "w5"] {
            table.lease("p", worker, Some(60_000), 0).unwrap();
        }

        assert!(table.release("w2"));
        assert_eq!(table.lease("p", "w6", Some(60_000), 0).unwrap(), 1);
        assert_eq!(table.lease("p", "w7", Some(60_000), 0).unwrap(), 5);
    }

    #[test]
    fn renew_keeps_integer_and_extends_expiry() {
        let mut table = table();
        assert_eq!(table.lease("p", "w", Some(60_000), 0).unwrap(), 0);
        assert_eq!(table.lease("p", "w", Some(60_000), 50_000).unwrap(), 0);

        // Still live well past the original expiry.
        assert_eq!(table.live_count(100_000), 1);
    }

    #[test]
    fn cross_pool_lease_is_rejected_while_live() {
        let mut table = table();
        table.lease("p", "w", Some(60_000), 0).unwrap();
        assert_eq!(
            table.lease("q", "w", Some(60_000), 1),
            Err(LeaseError::WorkerAlreadyHasLease)
        );
    }

    #[test]
    fn cross_pool_lease_succeeds_after_expiry() {
        let mut table = table();
        table.lease("p", "w", Some(100), 0).unwrap();
        assert_eq!(table.lease("q", "w", Some(100), 200).unwrap(), 0);
    }

    #[test]
    fn empty_identifiers_are_rejected() {
        let mut table = table();
        assert_eq!(
            table.lease("", "w", None, 0),
            Err(LeaseError::KeyAndWorkerRequired)
        );
        assert_eq!(
            table.lease("p", "", None, 0),
            Err(LeaseError::KeyAndWorkerRequired)
        );
    }

    #[test]
    fn release_reports_prior_presence() {
        let mut table = table();
        table.lease("p", "w", Some(60_000), 0).unwrap();
        assert!(table.release("w"));
        assert!(!table.release("w"));
        assert!(!table.release("never-seen"));
    }

    #[test]
    fn expired_leases_free_their_integers() {
        let mut table = table();
        table.lease("p", "w1", Some(100), 0).unwrap();
        table.lease("p", "w2", Some(60_000), 0).unwrap();

        // w1's slot 0 expires; a new worker gets it back.
        assert_eq!(table.lease("p", "w3", Some(60_000), 200).unwrap(), 0);
    }

    #[test]
    fn pools_are_independent() {
        let mut table = table();
        assert_eq!(table.lease("p", "w1", Some(60_000), 0).unwrap(), 0);
        assert_eq!(table.lease("q", "w2", Some(60_000), 0).unwrap(), 0);
        assert_eq!(table.lease("p", "w3", Some(60_000), 0).unwrap(), 1);
        assert_eq!(table.lease("q", "w4", Some(60_000), 0).unwrap(), 1);
    }

    #[test]
    fn assignments_stay_unique_under_churn() {
        let mut table = table();
        let mut now = 0;
        for round in 0..50u64 {
            now += 10;
            let worker = format!("w{}", round % 7);
            let _ = table.lease("p", &worker, Some(500), now);
            if round % 3 == 0 {
                table.release(&format!("w{}", (round + 1) % 7));
            }

            // Live assignments must never collide.
            let mut values: Vec<u64> = table
                .leases
                .values()
                .filter(|entry| entry.pool_key == "p" && entry.expires_at > now)
                .map(|entry| entry.assigned_value)
                .collect();
            values.sort_unstable();
            let mut deduped = values.clone();
            deduped.dedup();
            assert_eq!(values, deduped, "round {round}");
        }
    }

    #[test]
    fn allocations_refill_gaps_in_ascending_order() {
        let mut table = table();
        for worker in ["w0", "w1", "w2", "w3", "w4", "w5"] {
            table.lease("p", worker, Some(60_000), 0).unwrap();
        }
        table.release("w4");
        table.release("w1");

        // Freed slots come back smallest-first, then the high-water mark.
        assert_eq!(table.lease("p", "a", Some(60_000), 0).unwrap(), 1);
        assert_eq!(table.lease("p", "b", Some(60_000), 0).unwrap(), 4);
        assert_eq!(table.lease("p", "c", Some(60_000), 0).unwrap(), 6);
    }

    #[test]
    fn default_ttl_applies_when_omitted() {
        let mut table = LeaseTable::new(5_000);
        table.lease("p", "w", None, 1_000).unwrap();
        assert_eq!(table.live_count(5_999), 1);
        assert_eq!(table.live_count(6_000), 0);
    }

    #[test]
    fn sweep_counts_evictions() {
        let mut table = table();
        table.lease("p", "w1", Some(100), 0).unwrap();
        table.lease("p", "w2", Some(100), 0).unwrap();
        table.lease("p", "w3", Some(60_000), 0).unwrap();

        assert_eq!(table.sweep(500), 2);
        assert_eq!(table.sweep(500), 0);
    }
}
