//! Network-virtualization API trait

use super::error::BackendError;
use super::object::{MidoObject, NewObject, ObjectId};
use mido_sync_common::ObjectKind;

/// Trait for backend operations that can be mocked in tests.
///
/// This is the whole surface the controller needs from the backend: list
/// every object of a kind, create one object, delete one object. Linking
/// and filter assignment are expressed through object specs.
#[allow(async_fn_in_trait)] // Internal use only, Send+Sync bounds on trait are sufficient
#[cfg_attr(test, mockall::automock)]
pub trait MidoApi: Send + Sync {
    /// List every object of a kind
    async fn list(&self, kind: ObjectKind) -> Result<Vec<MidoObject>, BackendError>;

    /// Create an object and return it as stored
    async fn create(&self, object: &NewObject) -> Result<MidoObject, BackendError>;

    /// Delete an object by id
    async fn delete(&self, kind: ObjectKind, id: &ObjectId) -> Result<(), BackendError>;
}
