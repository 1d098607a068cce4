//! Router-ID pool

use crate::backend::MidoObject;
use crate::error::{SyncError, SyncResult};
use mido_sync_common::defaults::FIRST_ROUTER_ID;
use mido_sync_common::tags::TAG_ROUTER_ID;
use std::collections::BTreeSet;
use tracing::warn;

/// Bounded pool of router IDs in `[FIRST_ROUTER_ID, max)`.
///
/// The pool holds no persisted state: on every run it is rebuilt by
/// reserving the IDs found in router tags.
#[derive(Debug, Clone)]
pub struct RouterIdPool {
    max: u32,
    used: BTreeSet<u32>,
}

impl RouterIdPool {
    pub fn new(max: u32) -> Self {
        Self {
            max,
            used: BTreeSet::new(),
        }
    }

    fn exhausted(&self) -> SyncError {
        SyncError::CapacityExceeded {
            what: "router id".to_string(),
            max: self.capacity(),
        }
    }

    /// Number of allocatable IDs
    pub fn capacity(&self) -> usize {
        self.max.saturating_sub(FIRST_ROUTER_ID) as usize
    }

    /// Lowest free ID
    pub fn allocate(&mut self) -> SyncResult<u32> {
        let id = (FIRST_ROUTER_ID..self.max)
            .find(|id| !self.used.contains(id))
            .ok_or_else(|| self.exhausted())?;
        self.used.insert(id);
        Ok(id)
    }

    /// Mark an ID found on the backend as used; reserving twice is a no-op
    pub fn reserve(&mut self, id: u32) -> SyncResult<()> {
        if !(FIRST_ROUTER_ID..self.max).contains(&id) {
            return Err(self.exhausted());
        }
        self.used.insert(id);
        Ok(())
    }

    pub fn release(&mut self, id: u32) {
        self.used.remove(&id);
    }

    pub fn is_reserved(&self, id: u32) -> bool {
        self.used.contains(&id)
    }

    pub fn in_use(&self) -> usize {
        self.used.len()
    }

    /// Reserve the ID recorded on a discovered router.
    ///
    /// Returns `None` when the tag is missing, unparsable, out of range or
    /// already claimed by another router; the caller must then replace
    /// the router.
    pub fn claim(&mut self, router: &MidoObject) -> Option<u32> {
        let tagged = router.tag(TAG_ROUTER_ID).and_then(|t| t.parse::<u32>().ok());
        match tagged {
            Some(id) if !self.is_reserved(id) && self.reserve(id).is_ok() => Some(id),
            other => {
                warn!(router = %router.id, router_id = ?other, "Router ID unusable");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_lowest_first() {
        let mut pool = RouterIdPool::new(10);
        assert_eq!(pool.allocate().unwrap(), 2);
        assert_eq!(pool.allocate().unwrap(), 3);
        pool.release(2);
        assert_eq!(pool.allocate().unwrap(), 2);
    }

    #[test]
    fn test_reserve_is_idempotent_and_skipped_by_allocate() {
        let mut pool = RouterIdPool::new(10);
        pool.reserve(2).unwrap();
        pool.reserve(2).unwrap();
        assert_eq!(pool.in_use(), 1);
        assert_eq!(pool.allocate().unwrap(), 3);
    }

    #[test]
    fn test_exhaustion() {
        let mut pool = RouterIdPool::new(4);
        assert_eq!(pool.capacity(), 2);
        pool.allocate().unwrap();
        pool.allocate().unwrap();
        assert!(matches!(
            pool.allocate(),
            Err(SyncError::CapacityExceeded { max: 2, .. })
        ));
    }

    #[test]
    fn test_claim_router_tag() {
        use crate::backend::{MidoObject, ObjectSpec};
        use mido_sync_common::Tags;

        let router = |tag: Option<&str>| MidoObject {
            id: "router-000001".into(),
            name: "vr".to_string(),
            tags: tag
                .map(|t| Tags::from([(TAG_ROUTER_ID.to_string(), t.to_string())]))
                .unwrap_or_default(),
            spec: ObjectSpec::Router {
                inbound_filter: None,
                outbound_filter: None,
            },
        };

        let mut pool = RouterIdPool::new(10);
        assert_eq!(pool.claim(&router(Some("5"))), Some(5));
        assert_eq!(pool.claim(&router(Some("5"))), None, "already claimed");
        assert_eq!(pool.claim(&router(Some("abc"))), None);
        assert_eq!(pool.claim(&router(Some("12"))), None);
        assert_eq!(pool.claim(&router(None)), None);
        assert_eq!(pool.in_use(), 1);
    }

    #[test]
    fn test_reserve_out_of_range() {
        let mut pool = RouterIdPool::new(4);
        assert!(pool.reserve(1).is_err());
        assert!(pool.reserve(4).is_err());
        assert!(!pool.is_reserved(4));
    }
}
