//! Typed HTTP client for the coordinator.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use std::time::Duration;
use url::Url;

use crate::ecies::WrappedSecret;
use crate::error::Error;
use crate::types::{MessageBatch, RunnerQueue, RunnerQueueUpdate, Turn};
use crate::Result;

/// The coordinator operations the runner core depends on.
///
/// The poller consumes this trait rather than the concrete [`Client`] so
/// tests can substitute a scripted implementation.
#[async_trait]
pub trait CoordinatorApi: Send + Sync {
    /// Register a queue with its public key. A conflict means the queue
    /// already exists and is treated as success by callers.
    async fn register_runner_queue(
        &self,
        tenant_id: &str,
        runner_id: &str,
        queue_id: &str,
        public_key: &str,
    ) -> Result<()>;

    async fn get_runner_queue(
        &self,
        tenant_id: &str,
        runner_id: &str,
        queue_id: &str,
    ) -> Result<RunnerQueue>;

    /// Apply a version-guarded partial update. Conflicts carry the
    /// coordinator's current record so callers can refresh and retry.
    async fn update_runner_queue(
        &self,
        tenant_id: &str,
        runner_id: &str,
        queue_id: &str,
        version: i64,
        update: RunnerQueueUpdate,
    ) -> Result<RunnerQueue>;

    async fn delete_runner_queue(
        &self,
        tenant_id: &str,
        runner_id: &str,
        queue_id: &str,
        version: i64,
    ) -> Result<()>;

    /// Long-poll for up to `max_wait_seconds`; an empty batch signals a
    /// timeout, `Error::NotFound` a queue the coordinator has forgotten.
    async fn get_messages_batch(
        &self,
        tenant_id: &str,
        runner_id: &str,
        queue_id: &str,
        max_wait_seconds: u32,
    ) -> Result<MessageBatch>;

    async fn write_response(
        &self,
        tenant_id: &str,
        runner_id: &str,
        queue_id: &str,
        message_id: &str,
        caller_id: &str,
        payload: &WrappedSecret,
    ) -> Result<()>;

    /// Update a turn's status using the turn-scoped agent token instead
    /// of the runner token.
    async fn update_turn(
        &self,
        agent_token: &str,
        tenant_id: &str,
        task_id: &str,
        turn_index: u32,
        version: i64,
        status: &str,
    ) -> Result<Turn>;
}

/// Options for constructing a [`Client`].
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    /// Accept invalid TLS certificates. Only sensible against a local
    /// development coordinator.
    pub skip_tls_verify: bool,
}

/// HTTP client for the coordinator REST API.
pub struct Client {
    http: reqwest::Client,
    base_url: Url,
    token: String,
}

impl Client {
    pub fn new(base_url: &str, token: &str, options: ClientOptions) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("relay-runner/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .danger_accept_invalid_certs(options.skip_tls_verify)
            .build()?;

        let mut base = base_url.to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base)?.join("v1/")?;

        Ok(Self {
            http,
            base_url,
            token: token.to_string(),
        })
    }

    /// A client sharing this one's connection pool but authenticating
    /// with a different API token.
    pub fn with_api_token(&self, token: &str) -> Self {
        Self {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            token: token.to_string(),
        }
    }

    fn queue_url(&self, tenant_id: &str, runner_id: &str, queue_id: &str) -> Result<Url> {
        Ok(self.base_url.join(&format!(
            "tenants/{tenant_id}/runners/{runner_id}/queues/{queue_id}"
        ))?)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterQueueBody<'a> {
    queue_id: &'a str,
    public_key: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UpdateQueueBody {
    version: i64,
    #[serde(flatten)]
    update: RunnerQueueUpdate,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WriteResponseBody<'a> {
    caller_id: &'a str,
    payload: &'a WrappedSecret,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UpdateTurnBody<'a> {
    version: i64,
    status: &'a str,
}

/// Map non-success statuses to the error taxonomy the core retries on.
async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match status {
        StatusCode::NOT_FOUND => Err(Error::NotFound),
        StatusCode::CONFLICT => {
            let body = response.text().await.unwrap_or_default();
            let current = serde_json::from_str::<RunnerQueue>(&body).ok();
            Err(Error::Conflict { current })
        }
        _ => {
            let message = response.text().await.unwrap_or_default();
            Err(Error::Api {
                status: status.as_u16(),
                message,
            })
        }
    }
}

#[async_trait]
impl CoordinatorApi for Client {
    async fn register_runner_queue(
        &self,
        tenant_id: &str,
        runner_id: &str,
        queue_id: &str,
        public_key: &str,
    ) -> Result<()> {
        let url = self
            .base_url
            .join(&format!("tenants/{tenant_id}/runners/{runner_id}/queues"))?;
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(&RegisterQueueBody {
                queue_id,
                public_key,
            })
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn get_runner_queue(
        &self,
        tenant_id: &str,
        runner_id: &str,
        queue_id: &str,
    ) -> Result<RunnerQueue> {
        let url = self.queue_url(tenant_id, runner_id, queue_id)?;
        let response = self.http.get(url).bearer_auth(&self.token).send().await?;
        Ok(check(response).await?.json().await?)
    }

    async fn update_runner_queue(
        &self,
        tenant_id: &str,
        runner_id: &str,
        queue_id: &str,
        version: i64,
        update: RunnerQueueUpdate,
    ) -> Result<RunnerQueue> {
        let url = self.queue_url(tenant_id, runner_id, queue_id)?;
        let response = self
            .http
            .patch(url)
            .bearer_auth(&self.token)
            .json(&UpdateQueueBody { version, update })
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    async fn delete_runner_queue(
        &self,
        tenant_id: &str,
        runner_id: &str,
        queue_id: &str,
        version: i64,
    ) -> Result<()> {
        let mut url = self.queue_url(tenant_id, runner_id, queue_id)?;
        url.query_pairs_mut()
            .append_pair("version", &version.to_string());
        let response = self.http.delete(url).bearer_auth(&self.token).send().await?;
        check(response).await?;
        Ok(())
    }

    async fn get_messages_batch(
        &self,
        tenant_id: &str,
        runner_id: &str,
        queue_id: &str,
        max_wait_seconds: u32,
    ) -> Result<MessageBatch> {
        let mut url = self.queue_url(tenant_id, runner_id, queue_id)?;
        url.path_segments_mut()
            .map_err(|_| Error::Api {
                status: 0,
                message: "coordinator URL cannot be a base".to_string(),
            })?
            .push("messages");
        url.query_pairs_mut()
            .append_pair("maxWaitSeconds", &max_wait_seconds.to_string());
        let response = self.http.get(url).bearer_auth(&self.token).send().await?;
        Ok(check(response).await?.json().await?)
    }

    async fn write_response(
        &self,
        tenant_id: &str,
        runner_id: &str,
        queue_id: &str,
        message_id: &str,
        caller_id: &str,
        payload: &WrappedSecret,
    ) -> Result<()> {
        let mut url = self.queue_url(tenant_id, runner_id, queue_id)?;
        url.path_segments_mut()
            .map_err(|_| Error::Api {
                status: 0,
                message: "coordinator URL cannot be a base".to_string(),
            })?
            .extend(["messages", message_id, "response"]);
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(&WriteResponseBody { caller_id, payload })
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn update_turn(
        &self,
        agent_token: &str,
        tenant_id: &str,
        task_id: &str,
        turn_index: u32,
        version: i64,
        status: &str,
    ) -> Result<Turn> {
        let url = self.base_url.join(&format!(
            "tenants/{tenant_id}/tasks/{task_id}/turns/{turn_index}"
        ))?;
        let response = self
            .http
            .patch(url)
            .bearer_auth(agent_token)
            .json(&UpdateTurnBody { version, status })
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }
}
