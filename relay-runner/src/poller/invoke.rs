//! Agent invocation handler.
//!
//! Launches a container-packaged agent turn through the configured
//! runtime provider. The reply is written immediately; image pull and
//! container execution continue on a detached task scoped to the
//! queue's cancellation token.

use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Instrument};
use uuid::Uuid;

use relay_api::messages::{InvokeAgentRequest, InvokeAgentResponse, PrFeedback};

use super::{Poller, Queue};
use crate::docker;
use crate::error::{Error, Result};
use crate::runtime::{self, JobOptions, RuntimeProvider};

fn error_response(message: impl Into<String>) -> InvokeAgentResponse {
    InvokeAgentResponse {
        error_message: Some(message.into()),
    }
}

pub(super) async fn process(
    poller: &Arc<Poller>,
    mut request: InvokeAgentRequest,
    queue: &Arc<Queue>,
) -> InvokeAgentResponse {
    // The task id and image are interpolated into runtime command lines,
    // so both are validated before use.
    if let Err(err) = Uuid::parse_str(&request.turn.task_id) {
        return error_response(format!("invalid task ID: {err}"));
    }
    if let Err(err) = docker::parse_image_ref(&request.environment.docker_image) {
        return error_response(format!("invalid container image: {err}"));
    }
    let Some(provider) = poller.runtime.clone() else {
        return error_response("container runtime not configured");
    };

    // Attach the connection's GitHub credentials before the request is
    // handed to the agent container.
    if let Some(connection_id) = &request.private_github_connection_id {
        if let Some(info) = poller.connection_idx.get(connection_id) {
            request.github_token = Some(info.token.clone());
            request.github_url = Some(info.url.clone());
        }
    }

    let job_id = runtime::job_id(&request.turn.task_id, request.turn.turn_index);
    info!(
        task_id = %request.turn.task_id,
        turn_index = request.turn.turn_index,
        job_id = %job_id,
        "received invoke request"
    );
    let span = tracing::info_span!(
        "invoke",
        task_id = %request.turn.task_id,
        turn_index = request.turn.turn_index,
        job_id = %job_id,
    );

    let poller = Arc::clone(poller);
    let cancel = queue.cancel.clone();
    tokio::spawn(
        async move { invoke_async(poller, provider, request, job_id, cancel).await }
            .instrument(span),
    );

    InvokeAgentResponse::default()
}

async fn invoke_async(
    poller: Arc<Poller>,
    provider: Arc<dyn RuntimeProvider>,
    mut request: InvokeAgentRequest,
    job_id: String,
    cancel: CancellationToken,
) {
    if should_fetch_pr_feedback(&request) {
        if let Err(err) = update_turn_status(&poller, &mut request, "Checking for PR Feedback").await
        {
            error!(error = %err, status = "Checking for PR Feedback", "failed to update turn status");
            return;
        }
        if let Err(err) = fetch_pr_feedback(&poller, &mut request).await {
            error!(error = %err, "failed to fetch feedback");
            return;
        }
    }

    if let Err(err) =
        update_turn_status(&poller, &mut request, "Pulling Agent Image on Local Runner").await
    {
        error!(error = %err, status = "Pulling Agent Image on Local Runner", "failed to update turn status");
        return;
    }

    info!("pulling image");
    if let Err(err) = provider.pull_image(&cancel, &request.environment.docker_image).await {
        error!(error = %err, "failed to pull image");
        return;
    }

    info!("starting agent");
    let stdin = match serde_json::to_vec(&request) {
        Ok(bytes) => bytes,
        Err(err) => {
            error!(error = %err, "failed to serialize agent input");
            return;
        }
    };

    let options = JobOptions {
        job_id,
        image: request.environment.docker_image.clone(),
        cpus: 4,
        memory_gb: 8,
        entrypoint: "/usr/bin/agent-wrapper".to_string(),
        args: vec![
            "--encrypted-input=false".to_string(),
            "--relay-proxy".to_string(),
            "--log-agent-output".to_string(),
        ],
        stdin: Some(stdin),
    };

    if let Err(err) = provider.run_job(&cancel, options).await {
        error!(error = %err, "agent container run failed");
    }
}

/// Feedback is fetched only for follow-up turns with a private GitHub
/// connection and no caller-supplied feedback.
fn should_fetch_pr_feedback(request: &InvokeAgentRequest) -> bool {
    if request.feedback.is_some() || request.private_github_connection_id.is_none() {
        return false;
    }
    request.turn.turn_index > 1
}

async fn update_turn_status(
    poller: &Poller,
    request: &mut InvokeAgentRequest,
    status: &str,
) -> Result<()> {
    let turn = &request.turn;
    let updated = poller
        .client
        .update_turn(
            &request.agent_token,
            &turn.tenant_id,
            &turn.task_id,
            turn.turn_index,
            turn.version,
            status,
        )
        .await?;
    request.turn = updated;
    Ok(())
}

async fn fetch_pr_feedback(poller: &Poller, request: &mut InvokeAgentRequest) -> Result<()> {
    let Some(connection_id) = &request.private_github_connection_id else {
        return Ok(());
    };
    let client = poller.get_github_client(connection_id)?;

    let mut feedback: HashMap<String, Vec<PrFeedback>> = HashMap::new();
    if let Some(task) = &request.task {
        for (org_repo, info) in &task.repo_info {
            let Some(pr_number) = info.pr_number else {
                continue;
            };
            let (org, repo) = split_repo_name(org_repo)?;
            let threads = client.get_pr_feedback(org, repo, pr_number).await?;
            feedback.insert(org_repo.clone(), threads);
        }
    }

    request.feedback = Some(feedback);
    Ok(())
}

fn split_repo_name(name: &str) -> Result<(&str, &str)> {
    match name.split_once('/') {
        Some((org, repo)) if !org.is_empty() && !repo.is_empty() => Ok((org, repo)),
        _ => Err(Error::Github(format!("invalid repo name: {name}"))),
    }
}
