//! JSON-over-HTTP adapter for the network-virtualization API
//!
//! Objects live under `{base}/{kind}s`: `GET` lists, `POST` creates and
//! `DELETE {base}/{kind}s/{id}` deletes. Non-success statuses are classified
//! with [`classify_status`].

use super::error::{BackendError, classify_status};
use super::object::{MidoObject, NewObject, ObjectId};
use super::operations::MidoApi;
use anyhow::{Context, Result};
use mido_sync_common::ObjectKind;
use std::time::Duration;
use tracing::debug;

/// Per-request timeout
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpApi {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn collection_url(&self, kind: ObjectKind) -> String {
        format!("{}/{}s", self.base_url, kind.as_str())
    }

    fn object_url(&self, kind: ObjectKind, id: &ObjectId) -> String {
        format!("{}/{}", self.collection_url(kind), id)
    }
}

fn transport_error(e: reqwest::Error) -> BackendError {
    BackendError::Transient(e.to_string())
}

/// Turn a non-success response into a classified error
async fn error_for(
    response: reqwest::Response,
    kind: ObjectKind,
    subject: &str,
) -> BackendError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    classify_status(status, kind, subject, body.trim())
}

async fn decode<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, BackendError> {
    let status = response.status().as_u16();
    response.json().await.map_err(|e| BackendError::Rejected {
        status,
        message: format!("undecodable response: {e}"),
    })
}

impl MidoApi for HttpApi {
    async fn list(&self, kind: ObjectKind) -> Result<Vec<MidoObject>, BackendError> {
        let url = self.collection_url(kind);
        debug!(url = %url, "GET");
        let response = self.client.get(&url).send().await.map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(error_for(response, kind, kind.as_str()).await);
        }
        decode(response).await
    }

    async fn create(&self, object: &NewObject) -> Result<MidoObject, BackendError> {
        let kind = object.kind();
        let url = self.collection_url(kind);
        debug!(url = %url, name = %object.name, "POST");
        let response = self
            .client
            .post(&url)
            .json(object)
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(error_for(response, kind, &object.name).await);
        }
        decode(response).await
    }

    async fn delete(&self, kind: ObjectKind, id: &ObjectId) -> Result<(), BackendError> {
        let url = self.object_url(kind, id);
        debug!(url = %url, "DELETE");
        let response = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(error_for(response, kind, id.as_str()).await);
        }
        Ok(())
    }
}
