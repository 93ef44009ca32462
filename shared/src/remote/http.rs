use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};
use url::Url;

use super::{RemoteError, RemoteRecord, RemoteStore};
use crate::connectivity::HealthProbe;
use crate::model::{EntityId, EntityKind, EntityPatch, EntityPayload, OwnerId};

#[derive(Debug, Serialize)]
struct CreateRequest<'a> {
    owner: &'a OwnerId,
    payload: &'a EntityPayload,
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    id: EntityId,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    #[serde(default)]
    message: String,
}

fn transport_error(e: reqwest::Error) -> RemoteError {
    if e.is_timeout() {
        RemoteError::timeout(e.to_string())
    } else if let Some(status) = e.status() {
        RemoteError::from_status(status.as_u16(), e.to_string())
    } else {
        RemoteError::network(e.to_string())
    }
}

/// Turns a non-2xx response into a classified error, keeping the server's
/// message when the body carries one.
async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.bytes().await.unwrap_or_default();
    let message = serde_json::from_slice::<ApiErrorResponse>(&body)
        .ok()
        .map(|e| e.message)
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| format!("HTTP error: {}", status.as_u16()));
    Err(RemoteError::from_status(status.as_u16(), message))
}

/// JSON-over-HTTP remote store rooted at `base`.
#[derive(Clone, Debug)]
pub struct HttpRemoteStore {
    client: reqwest::Client,
    base: Url,
}

impl HttpRemoteStore {
    pub fn new(base: &str) -> Result<Self, RemoteError> {
        Self::with_client(reqwest::Client::new(), base)
    }

    pub fn with_client(client: reqwest::Client, base: &str) -> Result<Self, RemoteError> {
        let base = Url::parse(base)
            .map_err(|e| RemoteError::rejected(format!("invalid base url: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(RemoteError::rejected(format!("not a base url: {base}")));
        }
        Ok(Self { client, base })
    }

    fn url(&self, segments: &[&str]) -> Result<Url, RemoteError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| RemoteError::rejected("base url cannot carry a path"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    #[instrument(skip(self, payload), fields(kind = %payload.kind()))]
    async fn create(
        &self,
        owner: &OwnerId,
        payload: &EntityPayload,
    ) -> Result<EntityId, RemoteError> {
        let url = self.url(&[payload.kind().collection()])?;
        let resp = self
            .client
            .post(url)
            .json(&CreateRequest { owner, payload })
            .send()
            .await
            .map_err(transport_error)?;
        let created: CreateResponse = check_status(resp)
            .await?
            .json()
            .await
            .map_err(|e| RemoteError::network(format!("malformed create response: {e}")))?;
        debug!(id = %created.id, "remote create confirmed");
        Ok(created.id)
    }

    #[instrument(skip(self, patch), fields(%kind, %id))]
    async fn update(
        &self,
        kind: EntityKind,
        id: &EntityId,
        patch: &EntityPatch,
    ) -> Result<(), RemoteError> {
        let url = self.url(&[kind.collection(), id.as_str()])?;
        let resp = self
            .client
            .patch(url)
            .json(patch)
            .send()
            .await
            .map_err(transport_error)?;
        check_status(resp).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(%kind, %id))]
    async fn delete(&self, kind: EntityKind, id: &EntityId) -> Result<(), RemoteError> {
        let url = self.url(&[kind.collection(), id.as_str()])?;
        let resp = self
            .client
            .delete(url)
            .send()
            .await
            .map_err(transport_error)?;
        check_status(resp).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(%kind, %owner))]
    async fn list_all(
        &self,
        kind: EntityKind,
        owner: &OwnerId,
    ) -> Result<Vec<RemoteRecord>, RemoteError> {
        let mut url = self.url(&[kind.collection()])?;
        url.query_pairs_mut().append_pair("owner", owner.as_str());
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(transport_error)?;
        let records: Vec<RemoteRecord> = check_status(resp)
            .await?
            .json()
            .await
            .map_err(|e| RemoteError::network(format!("malformed listing: {e}")))?;

        let total = records.len();
        let records: Vec<_> = records
            .into_iter()
            .filter(|r| r.payload.kind() == kind && &r.owner == owner)
            .collect();
        if records.len() != total {
            warn!(dropped = total - records.len(), "listing contained foreign records");
        }
        Ok(records)
    }
}

/// Side-effect-free GET; any 2xx means the server is reachable.
#[derive(Clone, Debug)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
    url: Url,
}

impl HttpHealthProbe {
    pub fn new(url: &str) -> Result<Self, RemoteError> {
        let url =
            Url::parse(url).map_err(|e| RemoteError::rejected(format!("invalid probe url: {e}")))?;
        Ok(Self {
            client: reqwest::Client::new(),
            url,
        })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self) -> Result<(), RemoteError> {
        let resp = self
            .client
            .get(self.url.clone())
            .send()
            .await
            .map_err(transport_error)?;
        check_status(resp).await.map(|_| ())
    }
}
