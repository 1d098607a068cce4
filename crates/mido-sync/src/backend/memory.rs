//! In-memory backend
//!
//! Stateful implementation of [`MidoApi`] used by the test-suite and by
//! `plan`. It validates references on create, cascades deletes the way the
//! real backend does (a deleted device takes its ports, routes and rules
//! with it) and can inject failures.

use super::error::BackendError;
use super::object::{MidoObject, NewObject, ObjectId, ObjectSpec};
use super::operations::MidoApi;
use mido_sync_common::ObjectKind;
use mido_sync_common::tags::Tags;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// API operation, for counters and fault injection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryOp {
    List,
    Create,
    Delete,
}

/// Number of API calls served
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounters {
    pub lists: usize,
    pub creates: usize,
    pub deletes: usize,
}

impl CallCounters {
    /// Creates plus deletes
    pub fn mutations(&self) -> usize {
        self.creates + self.deletes
    }
}

#[derive(Debug)]
struct Fault {
    op: MemoryOp,
    kind: Option<ObjectKind>,
    error: BackendError,
    remaining: usize,
}

#[derive(Debug, Default)]
struct MemoryState {
    objects: BTreeMap<ObjectId, MidoObject>,
    next_seq: u64,
    counters: CallCounters,
    faults: Vec<Fault>,
}

impl MemoryState {
    fn take_fault(&mut self, op: MemoryOp, kind: ObjectKind) -> Option<BackendError> {
        let fault = self
            .faults
            .iter_mut()
            .find(|f| f.op == op && f.remaining > 0 && f.kind.is_none_or(|k| k == kind))?;
        fault.remaining -= 1;
        let error = fault.error.clone();
        self.faults.retain(|f| f.remaining > 0);
        Some(error)
    }

    fn next_id(&mut self, kind: ObjectKind) -> ObjectId {
        loop {
            self.next_seq += 1;
            let id = ObjectId(format!("{}-{:06}", kind.as_str(), self.next_seq));
            if !self.objects.contains_key(&id) {
                return id;
            }
        }
    }

    /// Remove `id` and everything that cannot exist without it
    fn remove_cascading(&mut self, id: &ObjectId) {
        let mut pending = vec![id.clone()];
        while let Some(gone) = pending.pop() {
            if self.objects.remove(&gone).is_none() {
                continue;
            }
            for object in self.objects.values_mut() {
                if unlink(&mut object.spec, &gone) {
                    continue;
                }
                if object.references().contains(&&gone) {
                    pending.push(object.id.clone());
                }
            }
        }
    }
}

/// Clear soft references (port peers and filters) to `gone`.
///
/// Returns true if the object survives the delete.
fn unlink(spec: &mut ObjectSpec, gone: &ObjectId) -> bool {
    fn clear(slot: &mut Option<ObjectId>, gone: &ObjectId) -> bool {
        if slot.as_ref() == Some(gone) {
            *slot = None;
            true
        } else {
            false
        }
    }

    match spec {
        ObjectSpec::Router {
            inbound_filter,
            outbound_filter,
        } => {
            clear(inbound_filter, gone);
            clear(outbound_filter, gone);
            true
        }
        ObjectSpec::Bridge { inbound_filter } => {
            clear(inbound_filter, gone);
            true
        }
        ObjectSpec::Port(port) if &port.device != gone => {
            clear(&mut port.peer, gone);
            clear(&mut port.inbound_filter, gone);
            clear(&mut port.outbound_filter, gone);
            true
        }
        _ => false,
    }
}

/// Shared in-memory backend; clones see the same state
#[derive(Debug, Clone, Default)]
pub struct MemoryApi {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend pre-loaded with existing objects, ids preserved
    pub fn from_objects(objects: impl IntoIterator<Item = MidoObject>) -> Self {
        let api = Self::new();
        {
            let mut state = api.lock();
            for object in objects {
                state.objects.insert(object.id.clone(), object);
            }
        }
        api
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a hypervisor or gateway host
    pub fn add_host(&self, name: &str) -> ObjectId {
        let mut state = self.lock();
        let id = state.next_id(ObjectKind::Host);
        state.objects.insert(
            id.clone(),
            MidoObject {
                id: id.clone(),
                name: name.to_string(),
                tags: Tags::new(),
                spec: ObjectSpec::Host {
                    addresses: Vec::new(),
                },
            },
        );
        id
    }

    /// Store an object without validation or counting
    pub fn insert_raw(&self, name: &str, tags: Tags, spec: ObjectSpec) -> MidoObject {
        let mut state = self.lock();
        let id = state.next_id(spec.kind());
        let object = MidoObject {
            id: id.clone(),
            name: name.to_string(),
            tags,
            spec,
        };
        state.objects.insert(id, object.clone());
        object
    }

    /// Fail the next `times` calls of `op` (on `kind`, or on any kind)
    pub fn fail_next(
        &self,
        op: MemoryOp,
        kind: Option<ObjectKind>,
        error: BackendError,
        times: usize,
    ) {
        self.lock().faults.push(Fault {
            op,
            kind,
            error,
            remaining: times,
        });
    }

    pub fn get(&self, id: &ObjectId) -> Option<MidoObject> {
        self.lock().objects.get(id).cloned()
    }

    /// Every stored object, ordered by id
    pub fn objects(&self) -> Vec<MidoObject> {
        self.lock().objects.values().cloned().collect()
    }

    pub fn objects_of(&self, kind: ObjectKind) -> Vec<MidoObject> {
        self.lock()
            .objects
            .values()
            .filter(|o| o.kind() == kind)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn counters(&self) -> CallCounters {
        self.lock().counters
    }

    pub fn reset_counters(&self) {
        self.lock().counters = CallCounters::default();
    }
}

impl MidoApi for MemoryApi {
    async fn list(&self, kind: ObjectKind) -> Result<Vec<MidoObject>, BackendError> {
        let mut state = self.lock();
        state.counters.lists += 1;
        if let Some(error) = state.take_fault(MemoryOp::List, kind) {
            return Err(error);
        }
        Ok(state
            .objects
            .values()
            .filter(|o| o.kind() == kind)
            .cloned()
            .collect())
    }

    async fn create(&self, object: &NewObject) -> Result<MidoObject, BackendError> {
        let kind = object.kind();
        let mut state = self.lock();
        state.counters.creates += 1;
        if let Some(error) = state.take_fault(MemoryOp::Create, kind) {
            return Err(error);
        }
        if kind == ObjectKind::Host {
            return Err(BackendError::Rejected {
                status: 405,
                message: "hosts register themselves".to_string(),
            });
        }
        if let Some(missing) = object
            .spec
            .references()
            .into_iter()
            .find(|r| !state.objects.contains_key(*r))
        {
            return Err(BackendError::Rejected {
                status: 400,
                message: format!("{kind} '{}' references unknown object '{missing}'", object.name),
            });
        }

        let id = state.next_id(kind);
        let stored = MidoObject {
            id: id.clone(),
            name: object.name.clone(),
            tags: object.tags.clone(),
            spec: object.spec.clone(),
        };
        state.objects.insert(id, stored.clone());
        Ok(stored)
    }

    async fn delete(&self, kind: ObjectKind, id: &ObjectId) -> Result<(), BackendError> {
        let mut state = self.lock();
        state.counters.deletes += 1;
        if let Some(error) = state.take_fault(MemoryOp::Delete, kind) {
            return Err(error);
        }
        match state.objects.get(id) {
            Some(existing) if existing.kind() == kind => {}
            _ => {
                return Err(BackendError::NotFound {
                    kind,
                    id: id.to_string(),
                });
            }
        }
        state.remove_cascading(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::object::{PortSpec, RuleAction, RuleSpec};

    fn router(name: &str) -> NewObject {
        NewObject {
            name: name.to_string(),
            tags: Tags::new(),
            spec: ObjectSpec::Router {
                inbound_filter: None,
                outbound_filter: None,
            },
        }
    }

    fn port(device: &ObjectId, peer: Option<&ObjectId>) -> NewObject {
        NewObject {
            name: "port".to_string(),
            tags: Tags::new(),
            spec: ObjectSpec::Port(PortSpec {
                device: device.clone(),
                peer: peer.cloned(),
                ..Default::default()
            }),
        }
    }

    #[tokio::test]
    async fn test_create_assigns_ordered_ids() {
        let api = MemoryApi::new();
        let a = api.create(&router("a")).await.unwrap();
        let b = api.create(&router("b")).await.unwrap();
        assert_eq!(a.id.as_str(), "router-000001");
        assert!(a.id < b.id);
        assert_eq!(api.counters().creates, 2);
    }

    #[tokio::test]
    async fn test_create_rejects_dangling_reference() {
        let api = MemoryApi::new();
        let err = api
            .create(&port(&"router-999999".into(), None))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Rejected { status: 400, .. }));
        assert!(api.is_empty());
    }

    #[tokio::test]
    async fn test_delete_cascades_to_ports_and_unlinks_peers() {
        let api = MemoryApi::new();
        let r1 = api.create(&router("r1")).await.unwrap();
        let r2 = api.create(&router("r2")).await.unwrap();
        let p1 = api.create(&port(&r1.id, None)).await.unwrap();
        let p2 = api.create(&port(&r2.id, Some(&p1.id))).await.unwrap();

        api.delete(ObjectKind::Router, &r1.id).await.unwrap();

        assert!(api.get(&p1.id).is_none(), "port goes with its router");
        let survivor = api.get(&p2.id).unwrap();
        assert_eq!(survivor.as_port().unwrap().peer, None);
    }

    #[tokio::test]
    async fn test_delete_chain_clears_filters_and_rules() {
        let api = MemoryApi::new();
        let chain = api
            .create(&NewObject {
                name: "chain".to_string(),
                tags: Tags::new(),
                spec: ObjectSpec::Chain,
            })
            .await
            .unwrap();
        let r = api
            .create(&NewObject {
                name: "r".to_string(),
                tags: Tags::new(),
                spec: ObjectSpec::Router {
                    inbound_filter: Some(chain.id.clone()),
                    outbound_filter: None,
                },
            })
            .await
            .unwrap();
        let rule = api
            .create(&NewObject {
                name: "rule".to_string(),
                tags: Tags::new(),
                spec: ObjectSpec::Rule(RuleSpec::new(chain.id.clone(), 0, RuleAction::Drop)),
            })
            .await
            .unwrap();

        api.delete(ObjectKind::Chain, &chain.id).await.unwrap();

        assert!(api.get(&rule.id).is_none());
        assert_eq!(
            api.get(&r.id).unwrap().spec,
            ObjectSpec::Router {
                inbound_filter: None,
                outbound_filter: None
            }
        );
    }

    #[tokio::test]
    async fn test_delete_missing_or_wrong_kind() {
        let api = MemoryApi::new();
        let r = api.create(&router("r")).await.unwrap();
        let err = api.delete(ObjectKind::Bridge, &r.id).await.unwrap_err();
        assert!(err.is_not_found());
        let err = api
            .delete(ObjectKind::Router, &"router-424242".into())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_fault_injection_is_consumed() {
        let api = MemoryApi::new();
        api.fail_next(
            MemoryOp::Create,
            Some(ObjectKind::Router),
            BackendError::Transient("boom".to_string()),
            2,
        );

        assert!(api.create(&router("a")).await.unwrap_err().is_retryable());
        assert!(api.create(&router("a")).await.unwrap_err().is_retryable());
        assert!(api.create(&router("a")).await.is_ok());
        assert_eq!(api.objects_of(ObjectKind::Router).len(), 1);
    }

    #[tokio::test]
    async fn test_hosts_cannot_be_created() {
        let api = MemoryApi::new();
        let host = api.add_host("node-1");
        assert_eq!(api.get(&host).unwrap().name, "node-1");
        let err = api
            .create(&NewObject {
                name: "node-2".to_string(),
                tags: Tags::new(),
                spec: ObjectSpec::Host { addresses: vec![] },
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Rejected { status: 405, .. }));
    }

    #[tokio::test]
    async fn test_from_objects_keeps_ids() {
        let source = MemoryApi::new();
        let r = source.create(&router("r")).await.unwrap();
        let copy = MemoryApi::from_objects(source.objects());
        assert_eq!(copy.get(&r.id).unwrap().name, "r");

        let next = copy.create(&router("s")).await.unwrap();
        assert_ne!(next.id, r.id);
    }
}
