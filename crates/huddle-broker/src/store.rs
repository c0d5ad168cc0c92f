//! In-memory value store with TTL and capacity discipline.
//!
//! Values are opaque JSON: the broker stores what the client sent and
//! echoes the `compressed` marker back on reads without ever inspecting or
//! transforming the blob. Expiry is wall-clock milliseconds; callers pass
//! `now` explicitly so tests control time.
//!
//! The item cap counts non-expired entries only, and updating an existing
//! key never trips it.

use std::collections::HashMap;

use serde_json::Value;

/// One stored value.
#[derive(Debug, Clone)]
pub struct ValueEntry {
    /// The opaque payload.
    pub value: Value,
    /// Absolute expiry, wall-clock milliseconds.
    pub expires_at: u64,
    /// Client-side compression marker.
    pub compressed: bool,
}

/// Outcome of a `get`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetOutcome {
    /// The key exists and is live.
    Found {
        /// The stored payload.
        value: Value,
        /// Echo of the compression marker.
        compressed: bool,
    },
    /// The key existed but its TTL passed; the entry has been removed.
    Expired,
    /// The key is absent.
    NotFound,
}

/// Policy failures from `set`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetError {
    /// TTLs are mandatory and none was supplied.
    TtlRequired,
    /// The TTL was zero (with mandatory TTLs) or negative.
    InvalidTtl,
    /// The value exceeds the per-value size cap.
    TooLarge,
    /// The store is at its non-expired item cap and the key is new.
    MaxItems,
}

/// The value store.
#[derive(Debug)]
pub struct ValueStore {
    entries: HashMap<String, ValueEntry>,
    default_ttl_ms: u64,
    require_ttl: bool,
    max_items: usize,
    max_value_size: usize,
}

impl ValueStore {
    /// Creates an empty store with the given policy knobs.
    ///
    /// `max_items` of zero disables the capacity cap.
    #[must_use]
    pub fn new(
        default_ttl_ms: u64,
        require_ttl: bool,
        max_items: usize,
        max_value_size: usize,
    ) -> Self {
        Self {
            entries: HashMap::new(),
            default_ttl_ms,
            require_ttl,
            max_items,
            max_value_size,
        }
    }

    /// Looks up a key, removing it when expired.
    pub fn get(&mut self, key: &str, now: u64) -> GetOutcome {
        match self.entries.get(key) {
            None => GetOutcome::NotFound,
            Some(entry) if entry.expires_at > now => GetOutcome::Found {
                value: entry.value.clone(),
                compressed: entry.compressed,
            },
            Some(_) => {
                self.entries.remove(key);
                GetOutcome::Expired
            },
        }
    }

    /// Validates and stores a value.
    ///
    /// # Errors
    ///
    /// Returns the policy violation; the store is unchanged on error.
    pub fn set(
        &mut self,
        key: &str,
        value: Value,
        ttl: Option<i64>,
        compressed: bool,
        now: u64,
    ) -> Result<(), SetError> {
        let ttl_ms = self.validate_ttl(ttl)?;

        if value_size(&value) > self.max_value_size {
            return Err(SetError::TooLarge);
        }

        let is_update = self
            .entries
            .get(key)
            .is_some_and(|entry| entry.expires_at > now);
        if !is_update && self.max_items > 0 && self.live_count(now) >= self.max_items {
            return Err(SetError::MaxItems);
        }

        self.entries.insert(
            key.to_string(),
            ValueEntry {
                value,
                expires_at: now + ttl_ms,
                compressed,
            },
        );
        Ok(())
    }

    /// Deletes a key, reporting whether it was present.
    pub fn del(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Iterates non-expired entries as `(key, expires_at)`.
    pub fn list(&self, now: u64) -> impl Iterator<Item = (&str, u64)> {
        self.entries
            .iter()
            .filter(move |(_, entry)| entry.expires_at > now)
            .map(|(key, entry)| (key.as_str(), entry.expires_at))
    }

    /// Removes expired entries, returning how many were evicted.
    pub fn sweep(&mut self, now: u64) -> u64 {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        (before - self.entries.len()) as u64
    }

    /// Count of non-expired entries.
    #[must_use]
    pub fn live_count(&self, now: u64) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.expires_at > now)
            .count()
    }

    /// Rough live-data footprint: key bytes plus serialized value bytes.
    ///
    /// A heuristic for the stats surface; it is monotone in key and value
    /// sizes, nothing more is promised.
    #[must_use]
    pub fn approx_bytes(&self, now: u64) -> u64 {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.expires_at > now)
            .map(|(key, entry)| (key.len() + value_size(&entry.value)) as u64)
            .sum()
    }

    /// The configured item cap (zero when disabled).
    #[must_use]
    pub const fn max_items(&self) -> usize {
        self.max_items
    }

    /// Drops every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn validate_ttl(&self, ttl: Option<i64>) -> Result<u64, SetError> {
        match ttl {
            Some(ms) if ms < 0 => Err(SetError::InvalidTtl),
            Some(0) if self.require_ttl => Err(SetError::InvalidTtl),
            None if self.require_ttl => Err(SetError::TtlRequired),
            Some(0) | None => Ok(self.default_ttl_ms),
            Some(ms) => Ok(ms as u64),
        }
    }
}

/// Byte size of a value for cap checks: raw length for strings, serialized
/// length for every other JSON shape.
fn value_size(value: &Value) -> usize {
    match value {
        Value::String(s) => s.len(),
        other => serde_json::to_vec(other).map_or(0, |bytes| bytes.len()),
    }
}
