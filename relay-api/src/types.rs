//! Wire types for the coordinator API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::ecies::WrappedSecret;

/// A queue record as held by the coordinator.
///
/// Every mutation is optimistic-concurrency-controlled by `version`; a
/// stale version produces a conflict carrying the current record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerQueue {
    pub tenant_id: String,
    pub runner_id: String,
    pub queue_id: String,
    pub version: i64,
    #[serde(default)]
    pub draining: bool,
    #[serde(default)]
    pub is_healthy: bool,
    /// SPKI PEM of the queue's P-256 public key.
    #[serde(default)]
    pub public_key: String,
}

/// Partial update applied to a queue record.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerQueueUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub draining: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_healthy: Option<bool>,
}

/// One encrypted message delivered from a queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    pub message_id: String,
    pub caller_id: String,
    /// SPKI PEM of the caller's P-256 public key; replies are wrapped to it.
    pub caller_public_key: String,
    pub payload: WrappedSecret,
}

/// The (possibly empty) result of one long-poll.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageBatch {
    #[serde(default)]
    pub messages: Vec<QueueMessage>,
}

/// A single turn of a task as held by the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Turn {
    pub tenant_id: String,
    pub task_id: String,
    pub turn_index: u32,
    pub version: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Task metadata referenced by agent invocations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Repository state keyed by `org/repo`.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub repo_info: HashMap<String, RepoInfo>,
}

/// Per-repository state attached to a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<u64>,
}
