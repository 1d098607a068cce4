//! Retrying wrapper around a [`MidoApi`] implementation

use super::error::BackendError;
use super::object::{MidoObject, NewObject, ObjectId};
use super::operations::MidoApi;
use crate::config::RetryConfig;
use backon::Retryable;
use mido_sync_common::ObjectKind;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info, warn};

/// Mutation counters for one client
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStats {
    pub created: usize,
    pub deleted: usize,
}

/// Backend client used by every topology operation.
///
/// Transient failures are retried with exponential backoff. A conflict on
/// create resolves to the live object with the same tag identity, and a
/// delete of an object that is already gone is reported as `Ok(false)`.
pub struct MidoClient<A> {
    api: A,
    retry: RetryConfig,
    created: AtomicUsize,
    deleted: AtomicUsize,
}

impl<A: MidoApi> MidoClient<A> {
    pub fn new(api: A, retry: RetryConfig) -> Self {
        Self {
            api,
            retry,
            created: AtomicUsize::new(0),
            deleted: AtomicUsize::new(0),
        }
    }

    /// The wrapped backend
    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn stats(&self) -> ClientStats {
        ClientStats {
            created: self.created.load(Ordering::Relaxed),
            deleted: self.deleted.load(Ordering::Relaxed),
        }
    }

    /// List every object of a kind
    pub async fn list(&self, kind: ObjectKind) -> Result<Vec<MidoObject>, BackendError> {
        (|| async { self.api.list(kind).await })
            .retry(self.retry.backoff())
            .when(BackendError::is_retryable)
            .notify(|e, dur| {
                warn!(kind = %kind, delay = ?dur, error = %e, "List failed, retrying...");
            })
            .await
    }

    /// Create an object.
    ///
    /// If the backend reports that it already exists, the live object
    /// carrying the same identity tags is returned instead.
    pub async fn create(&self, object: &NewObject) -> Result<MidoObject, BackendError> {
        let kind = object.kind();
        let result = (|| async { self.api.create(object).await })
            .retry(self.retry.backoff())
            .when(BackendError::is_retryable)
            .notify(|e, dur| {
                warn!(
                    kind = %kind,
                    name = %object.name,
                    delay = ?dur,
                    error = %e,
                    "Create failed, retrying..."
                );
            })
            .await;

        match result {
            Ok(created) => {
                self.created.fetch_add(1, Ordering::Relaxed);
                debug!(kind = %kind, id = %created.id, name = %created.name, "Created object");
                Ok(created)
            }
            Err(e) if e.is_already_exists() => match self.find_existing(object).await? {
                Some(existing) => {
                    info!(
                        kind = %kind,
                        id = %existing.id,
                        name = %existing.name,
                        "Object already exists, adopting it"
                    );
                    Ok(existing)
                }
                None => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    /// Delete an object. Returns `false` if it was already gone.
    pub async fn delete(&self, object: &MidoObject) -> Result<bool, BackendError> {
        self.delete_by_id(object.kind(), &object.id).await
    }

    /// Delete an object by kind and id. Returns `false` if it was already gone.
    pub async fn delete_by_id(&self, kind: ObjectKind, id: &ObjectId) -> Result<bool, BackendError> {
        let result = (|| async { self.api.delete(kind, id).await })
            .retry(self.retry.backoff())
            .when(BackendError::is_retryable)
            .notify(|e, dur| {
                warn!(kind = %kind, id = %id, delay = ?dur, error = %e, "Delete failed, retrying...");
            })
            .await;

        match result {
            Ok(()) => {
                self.deleted.fetch_add(1, Ordering::Relaxed);
                debug!(kind = %kind, id = %id, "Deleted object");
                Ok(true)
            }
            Err(e) if e.is_not_found() => {
                debug!(kind = %kind, id = %id, "Object already deleted");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Live object with the same identity tags as `object`, lowest id first
    async fn find_existing(&self, object: &NewObject) -> Result<Option<MidoObject>, BackendError> {
        let Some(identity) = mido_sync_common::tags::identity(&object.tags) else {
            return Ok(None);
        };
        let mut candidates: Vec<MidoObject> = self
            .list(object.kind())
            .await?
            .into_iter()
            .filter(|o| o.identity().as_ref() == Some(&identity))
            .collect();
        candidates.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(candidates.into_iter().next())
    }
}
