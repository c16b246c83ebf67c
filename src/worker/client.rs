//! RPC client used by the worker to talk to the broker
//!
//! Every call carries a hard timeout and normalizes transport failures,
//! timeouts, and malformed replies into a [`ClientError`] value instead of a
//! panic or a raw reqwest error. That uniformity is what keeps the
//! autonomous loop's error handling tractable: any failed RPC is just a
//! value to log and retry on the next tick.

use crate::broker::rest_api::{
    AckResponse, AgentsResponse, BroadcastResponse, ClearResponse, ContextListResponse,
    ContextValueResponse, ContextWriteResponse, ErrorBody, OkResponse, RegisterResponse,
    SendResponse, StatusResponse,
};
use crate::broker::state::{Agent, ContextSummary, ReadBatch};
use crate::domain_types::{AgentId, MessageId, MessageType};
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

/// Uniform error shape for every broker RPC
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// The broker could not be reached, timed out, or replied with
    /// something that is not JSON.
    #[error("broker unavailable: {reason}")]
    Unavailable { reason: String },

    /// The broker replied with a structured error.
    #[error("broker error ({status}): {message}")]
    Api { status: u16, message: String },
}

impl ClientError {
    /// Whether the broker reported the target as unknown. A heartbeat
    /// failing this way is the worker's re-register trigger.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Api { status: 404, .. })
    }
}

/// HTTP client for the broker's RPC surface
#[derive(Debug, Clone)]
pub struct BrokerClient {
    http: reqwest::Client,
    base_url: Url,
    fetch_timeout: Duration,
}

impl BrokerClient {
    pub fn new(base_url: Url, fetch_timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            fetch_timeout,
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, path: &str) -> Result<Url, ClientError> {
        self.base_url
            .join(path)
            .map_err(|e| ClientError::Unavailable {
                reason: format!("invalid request url: {e}"),
            })
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        timeout: Duration,
    ) -> Result<T, ClientError> {
        let response = request
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| ClientError::Unavailable {
                reason: e.to_string(),
            })?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| ClientError::Unavailable {
                reason: e.to_string(),
            })?;

        if status.is_success() {
            serde_json::from_slice(&body).map_err(|e| ClientError::Unavailable {
                reason: format!("malformed broker reply: {e}"),
            })
        } else {
            let message = serde_json::from_slice::<ErrorBody>(&body)
                .map(|b| b.error)
                .unwrap_or_else(|_| String::from_utf8_lossy(&body).into_owned());
            Err(ClientError::Api {
                status: status.as_u16(),
                message,
            })
        }
    }

    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<T, ClientError> {
        let url = self.url(path)?;
        self.execute(self.http.post(url).json(&body), self.fetch_timeout)
            .await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let url = self.url(path)?;
        self.execute(self.http.get(url), self.fetch_timeout).await
    }

    pub async fn register(
        &self,
        id: &AgentId,
        name: &str,
        project: &str,
        path: &str,
    ) -> Result<RegisterResponse, ClientError> {
        self.post(
            "/agents/register",
            json!({
                "agentId": id.as_str(),
                "name": name,
                "project": project,
                "path": path,
            }),
        )
        .await
    }

    pub async fn heartbeat(&self, id: &AgentId) -> Result<(), ClientError> {
        let _: OkResponse = self
            .post(&format!("/agents/{id}/heartbeat"), json!({}))
            .await?;
        Ok(())
    }

    pub async fn deregister(&self, id: &AgentId, timeout: Duration) -> Result<(), ClientError> {
        let url = self.url(&format!("/agents/{id}"))?;
        let _: OkResponse = self.execute(self.http.delete(url), timeout).await?;
        Ok(())
    }

    pub async fn agents(&self) -> Result<Vec<Agent>, ClientError> {
        let response: AgentsResponse = self.get("/agents").await?;
        Ok(response.agents)
    }

    pub async fn send(
        &self,
        from: &str,
        to: &str,
        content: &str,
        kind: MessageType,
    ) -> Result<MessageId, ClientError> {
        let response: SendResponse = self
            .post(
                "/messages/send",
                json!({
                    "from": from,
                    "to": to,
                    "content": content,
                    "type": kind.as_str(),
                }),
            )
            .await?;
        Ok(response.message_id)
    }

    pub async fn broadcast(
        &self,
        from: &str,
        content: &str,
        kind: MessageType,
    ) -> Result<usize, ClientError> {
        let response: BroadcastResponse = self
            .post(
                "/messages/broadcast",
                json!({
                    "from": from,
                    "content": content,
                    "type": kind.as_str(),
                }),
            )
            .await?;
        Ok(response.sent_to)
    }

    pub async fn read(
        &self,
        id: &AgentId,
        unread_only: bool,
        limit: usize,
    ) -> Result<ReadBatch, ClientError> {
        let url = self.url(&format!("/messages/{id}"))?;
        self.execute(
            self.http
                .get(url)
                .query(&[("unread", unread_only.to_string()), ("limit", limit.to_string())]),
            self.fetch_timeout,
        )
        .await
    }

    pub async fn ack(&self, id: &AgentId, ids: &[MessageId]) -> Result<usize, ClientError> {
        let response: AckResponse = self
            .post(&format!("/messages/{id}/ack"), json!({ "ids": ids }))
            .await?;
        Ok(response.acked)
    }

    pub async fn clear_messages(&self, id: &AgentId) -> Result<usize, ClientError> {
        let url = self.url(&format!("/messages/{id}"))?;
        let response: ClearResponse = self.execute(self.http.delete(url), self.fetch_timeout).await?;
        Ok(response.cleared)
    }

    pub async fn set_context(
        &self,
        key: &str,
        value: serde_json::Value,
        set_by: &str,
    ) -> Result<(), ClientError> {
        let _: ContextWriteResponse = self
            .post(
                "/context",
                json!({
                    "key": key,
                    "value": value,
                    "setBy": set_by,
                }),
            )
            .await?;
        Ok(())
    }

    pub async fn get_context(&self, key: &str) -> Result<ContextValueResponse, ClientError> {
        self.get(&format!("/context/{key}")).await
    }

    pub async fn list_contexts(&self) -> Result<Vec<ContextSummary>, ClientError> {
        let response: ContextListResponse = self.get("/context").await?;
        Ok(response.contexts)
    }

    pub async fn delete_context(&self, key: &str) -> Result<(), ClientError> {
        let url = self.url(&format!("/context/{key}"))?;
        let _: OkResponse = self.execute(self.http.delete(url), self.fetch_timeout).await?;
        Ok(())
    }

    pub async fn status(&self) -> Result<StatusResponse, ClientError> {
        self.get("/status").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_detection_matches_only_404() {
        let not_found = ClientError::Api {
            status: 404,
            message: "not found: agent w".into(),
        };
        let bad_request = ClientError::Api {
            status: 400,
            message: "invalid argument".into(),
        };
        let unavailable = ClientError::Unavailable {
            reason: "timeout".into(),
        };

        assert!(not_found.is_not_found());
        assert!(!bad_request.is_not_found());
        assert!(!unavailable.is_not_found());
    }
}
