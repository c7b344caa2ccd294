use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::{Client, RequestBuilder, Response};
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::api_types::{collection, ApiCreateResponse, ApiNewRecord, ApiRecord, ApiTaskDispatch};
use super::{RemoteDataSource, RemoteError};
use crate::config::{Config, RemoteConfig};
use crate::sync::{EntityKind, Record};
use crate::tasks::{SyncTask, TaskDispatcher};

/// REST client for the trip data service
#[derive(Clone)]
pub struct HttpRemote {
  client: Client,
  base: Url,
  api_key: Option<String>,
}

impl HttpRemote {
  pub fn new(config: &RemoteConfig) -> Result<Self> {
    let client = Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base: config.base_url()?,
      api_key: Config::get_api_key(),
    })
  }

  fn endpoint(&self, path: &str) -> Result<Url, RemoteError> {
    self
      .base
      .join(path)
      .map_err(|e| RemoteError::Decode(format!("invalid endpoint {}: {}", path, e)))
  }

  fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
    match &self.api_key {
      Some(key) => request.header("apikey", key).bearer_auth(key),
      None => request,
    }
  }
}

#[async_trait]
impl RemoteDataSource for HttpRemote {
  async fn list_by_user(
    &self,
    kind: EntityKind,
    user_id: &str,
  ) -> Result<Vec<Record>, RemoteError> {
    let url = self.endpoint(collection(kind))?;
    debug!(%url, %kind, "listing remote records");

    let response = self
      .authorized(self.client.get(url).query(&[("user_id", user_id)]))
      .send()
      .await
      .map_err(transport_error)?;

    let rows: Vec<ApiRecord> = check_status(response)
      .await?
      .json()
      .await
      .map_err(transport_error)?;

    Ok(rows.into_iter().map(|row| row.into_record(kind)).collect())
  }

  async fn create(&self, record: &Record) -> Result<Record, RemoteError> {
    let url = self.endpoint(collection(record.kind))?;
    debug!(%url, id = %record.id, "creating remote record");

    let response = self
      .authorized(self.client.post(url))
      .header("Prefer", "return=representation")
      .json(&ApiNewRecord::from_record(record))
      .send()
      .await
      .map_err(transport_error)?;

    let created: ApiCreateResponse = check_status(response)
      .await?
      .json()
      .await
      .map_err(transport_error)?;

    created
      .into_single()
      .map(|row| row.into_record(record.kind))
      .ok_or_else(|| RemoteError::Decode("create returned no record".to_string()))
  }
}

#[async_trait]
impl TaskDispatcher for HttpRemote {
  async fn dispatch(&self, task: &SyncTask) -> Result<(), RemoteError> {
    let url = self.endpoint(&format!("tasks/{}", task.tag))?;
    let key = task.dispatch_key();
    debug!(%url, %key, "dispatching background task");

    let body = ApiTaskDispatch {
      tag: task.tag.as_str(),
      payload: &task.payload,
      scheduled_at: task.scheduled_at,
    };
    let response = self
      .authorized(self.client.post(url))
      .header("Idempotency-Key", &key)
      .json(&body)
      .send()
      .await
      .map_err(transport_error)?;

    check_status(response).await?;
    Ok(())
  }
}

/// Map a non-success status to `Rejected`, keeping the body as the message.
async fn check_status(response: Response) -> Result<Response, RemoteError> {
  let status = response.status();
  if status.is_success() {
    return Ok(response);
  }

  let message = response.text().await.unwrap_or_default();
  Err(RemoteError::Rejected {
    status: status.as_u16(),
    message,
  })
}

fn transport_error(e: reqwest::Error) -> RemoteError {
  if e.is_decode() {
    RemoteError::Decode(e.to_string())
  } else {
    RemoteError::Connectivity(e.to_string())
  }
}
