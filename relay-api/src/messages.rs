//! The runner message catalogue.
//!
//! Decrypted queue payloads are self-describing JSON records whose `type`
//! field selects the handler. The catalogue is a closed world: a payload
//! with an unknown discriminator fails to decode, which the worker logs
//! and drops.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::{Task, Turn};

/// Every request a caller can post to a runner queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RunnerRequest {
    PingRequest(PingRequest),
    InvokeAgentRequest(InvokeAgentRequest),
    ListOrgsForConnectionRequest(ListOrgsForConnectionRequest),
    SearchRepoRequest(SearchRepoRequest),
    ListRepoBranchesRequest(ListRepoBranchesRequest),
}

/// Every reply a runner writes back.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RunnerResponse {
    PingResponse(PingResponse),
    InvokeAgentResponse(InvokeAgentResponse),
    ListOrgsForConnectionResponse(ListOrgsForConnectionResponse),
    SearchRepoResponse(SearchRepoResponse),
    ListRepoBranchesResponse(ListRepoBranchesResponse),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingRequest {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Container environment for an agent invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEnvironment {
    pub docker_image: String,
}

/// Request to launch a container-packaged agent turn on this runner.
///
/// The whole request (with any fetched PR feedback and GitHub
/// credentials attached) is fed to the agent container on stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeAgentRequest {
    pub turn: Turn,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<Task>,
    pub environment: AgentEnvironment,
    /// Turn-scoped API token used for status updates during the run.
    pub agent_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_github_connection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github_url: Option<String>,
    /// PR feedback keyed by `org/repo`, populated by the runner when the
    /// turn needs it and the caller did not supply it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<HashMap<String, Vec<PrFeedback>>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeAgentResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListOrgsForConnectionRequest {
    pub connection_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_results: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListOrgsForConnectionResponse {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRepoRequest {
    pub connection_id: String,
    pub org_name: String,
    pub search: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_results: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRepoResponse {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListRepoBranchesRequest {
    pub connection_id: String,
    pub org_name: String,
    pub repo_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_results: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListRepoBranchesResponse {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// One thread of pull-request feedback for the agent to address.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrFeedback {
    pub id: String,
    #[serde(default)]
    pub is_resolved: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub comments: Vec<PrComment>,
}

/// A single review or issue comment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrComment {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_hunk: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_line: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orig_start_line: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
    #[serde(default)]
    pub is_minimized: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimized_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_request_decodes_by_type_tag() {
        let req: RunnerRequest = serde_json::from_str(r#"{"type":"pingRequest"}"#).unwrap();
        assert!(matches!(req, RunnerRequest::PingRequest(_)));
    }

    #[test]
    fn unknown_type_is_an_error() {
        let err = serde_json::from_str::<RunnerRequest>(r#"{"type":"mysteryRequest"}"#)
            .expect_err("unknown discriminator must not decode");
        assert!(err.to_string().contains("mysteryRequest"));
    }

    #[test]
    fn response_tag_round_trips() {
        let reply = RunnerResponse::PingResponse(PingResponse::default());
        let json = serde_json::to_string(&reply).unwrap();
        assert_eq!(json, r#"{"type":"pingResponse"}"#);

        let parsed: RunnerResponse = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, RunnerResponse::PingResponse(_)));
    }

    #[test]
    fn invoke_request_decodes() {
        let json = r#"{
            "type": "invokeAgentRequest",
            "turn": {"tenantId":"t","taskId":"k","turnIndex":2,"version":7},
            "environment": {"dockerImage":"ghcr.io/acme/agent:1"},
            "agentToken": "rlya_abc"
        }"#;
        let req: RunnerRequest = serde_json::from_str(json).unwrap();
        match req {
            RunnerRequest::InvokeAgentRequest(invoke) => {
                assert_eq!(invoke.turn.turn_index, 2);
                assert_eq!(invoke.environment.docker_image, "ghcr.io/acme/agent:1");
                assert!(invoke.feedback.is_none());
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }
}
