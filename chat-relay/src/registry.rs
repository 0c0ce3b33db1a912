//! Relay-side membership state: one lease per connected handle.
//!
//! The registry is exclusively owned by the relay task; a purge pass and
//! the servicing of one inbound message run as consecutive steps of the
//! same loop iteration, so no handle is ever touched and purged
//! inconsistently.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Handle → lease-expiry table. A handle is a member exactly while it holds
/// an unexpired lease; uniqueness is last-seen wins.
pub struct Registry {
    leases: HashMap<String, Instant>,
    lease_duration: Duration,
}

impl Registry {
    pub fn new(lease_duration: Duration) -> Self {
        Self {
            leases: HashMap::new(),
            lease_duration,
        }
    }

    /// Insert or refresh the lease for `handle`, setting its expiry to
    /// now + lease duration. Returns `true` when the handle was previously
    /// absent.
    pub fn touch(&mut self, handle: &str) -> bool {
        self.touch_at(handle, Instant::now())
    }

    /// [`Registry::touch`] with an explicit clock, so tests control time.
    pub fn touch_at(&mut self, handle: &str, now: Instant) -> bool {
        self.leases
            .insert(handle.to_owned(), now + self.lease_duration)
            .is_none()
    }

    /// Remove and return every handle whose lease expired at or before
    /// `now`. Each expired handle is returned by exactly one purge call.
    pub fn purge_expired(&mut self) -> Vec<String> {
        self.purge_expired_at(Instant::now())
    }

    /// [`Registry::purge_expired`] with an explicit clock.
    pub fn purge_expired_at(&mut self, now: Instant) -> Vec<String> {
        let mut expired: Vec<String> = self
            .leases
            .iter()
            .filter(|(_, expiry)| **expiry <= now)
            .map(|(handle, _)| handle.clone())
            .collect();
        expired.sort();
        for handle in &expired {
            self.leases.remove(handle);
        }
        expired
    }

    /// Current membership, sorted for stable output. Duplicates are
    /// impossible by construction.
    pub fn snapshot(&self) -> Vec<String> {
        let mut handles: Vec<String> = self.leases.keys().cloned().collect();
        handles.sort();
        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEASE: Duration = Duration::from_secs(5);

    #[test]
    fn touch_reports_new_handles_once() {
        let mut registry = Registry::new(LEASE);
        let now = Instant::now();
        assert!(registry.touch_at("alice", now));
        assert!(!registry.touch_at("alice", now));
    }

    #[test]
    fn purge_before_expiry_keeps_the_handle() {
        let mut registry = Registry::new(LEASE);
        let now = Instant::now();
        registry.touch_at("alice", now);
        assert!(registry.purge_expired_at(now + LEASE / 2).is_empty());
        assert_eq!(registry.snapshot(), vec!["alice".to_string()]);
    }

    #[test]
    fn purge_at_expiry_returns_the_handle_exactly_once() {
        let mut registry = Registry::new(LEASE);
        let now = Instant::now();
        registry.touch_at("alice", now);
        assert_eq!(
            registry.purge_expired_at(now + LEASE),
            vec!["alice".to_string()]
        );
        assert!(registry.purge_expired_at(now + LEASE).is_empty());
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn touch_extends_an_existing_lease() {
        let mut registry = Registry::new(LEASE);
        let start = Instant::now();
        registry.touch_at("alice", start);
        registry.touch_at("alice", start + LEASE / 2);
        // The original expiry has passed, but the refresh moved it out.
        assert!(registry.purge_expired_at(start + LEASE).is_empty());
        assert_eq!(
            registry.purge_expired_at(start + LEASE + LEASE / 2),
            vec!["alice".to_string()]
        );
    }

    #[test]
    fn purge_returns_only_expired_handles() {
        let mut registry = Registry::new(LEASE);
        let now = Instant::now();
        registry.touch_at("bob", now);
        registry.touch_at("alice", now + LEASE / 2);
        assert_eq!(registry.purge_expired_at(now + LEASE), vec!["bob".to_string()]);
        assert_eq!(registry.snapshot(), vec!["alice".to_string()]);
    }
}
