//! Read-only GitHub proxy handlers.
//!
//! These let the control plane browse an operator's GitHub through the
//! runner's connections without ever holding the tokens itself.
//! Pagination state is carried in an opaque base64 token round-tripped
//! through the caller.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

use relay_api::messages::{
    ListOrgsForConnectionRequest, ListOrgsForConnectionResponse, ListRepoBranchesRequest,
    ListRepoBranchesResponse, SearchRepoRequest, SearchRepoResponse,
};

use super::Poller;

const DEFAULT_PAGE_SIZE: usize = 10;
const MAX_PAGE_SIZE: usize = 100;

/// Pagination key for org listing. `page: None` marks the trailing page
/// that carries only the authenticated user.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListOrgsKey {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    page: Option<u32>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageKey {
    #[serde(default)]
    page: u32,
}

/// Resolve the page limit and decode the pagination key from a token.
fn parse_pagination<T>(max_results: Option<usize>, token: Option<&str>) -> Result<(usize, T), String>
where
    T: DeserializeOwned + Default,
{
    let limit = max_results.unwrap_or(DEFAULT_PAGE_SIZE);
    if limit == 0 || limit > MAX_PAGE_SIZE {
        return Err("maxResults must be between 1 and 100".to_string());
    }
    let key = match token {
        Some(token) => {
            let bytes = URL_SAFE_NO_PAD
                .decode(token)
                .map_err(|_| "invalid pagination token".to_string())?;
            serde_json::from_slice(&bytes).map_err(|_| "invalid pagination token".to_string())?
        }
        None => T::default(),
    };
    Ok((limit, key))
}

fn next_token<T: Serialize>(key: &T) -> Result<String, String> {
    serde_json::to_vec(key)
        .map(|bytes| URL_SAFE_NO_PAD.encode(bytes))
        .map_err(|_| "unable to generate pagination token".to_string())
}

fn matches_search(search: Option<&str>, candidate: &str) -> bool {
    search.map_or(true, |needle| candidate.contains(needle))
}

pub(super) async fn list_orgs(
    poller: &Arc<Poller>,
    request: ListOrgsForConnectionRequest,
) -> ListOrgsForConnectionResponse {
    info!(
        connection_id = %request.connection_id,
        pagination_token = ?request.token,
        "received list orgs request"
    );
    let fail = |message: String| ListOrgsForConnectionResponse {
        error_message: Some(message),
        ..Default::default()
    };

    let client = match poller.get_github_client(&request.connection_id) {
        Ok(client) => client,
        Err(err) => {
            error!(error = %err, connection_id = %request.connection_id, "unable to initialize github client");
            return fail(err.to_string());
        }
    };

    let (limit, mut key) =
        match parse_pagination::<ListOrgsKey>(request.max_results, request.token.as_deref()) {
            Ok(parsed) => parsed,
            Err(message) => {
                error!(connection_id = %request.connection_id, "unable to parse pagination key");
                return fail(message);
            }
        };
    if request.token.is_none() {
        key.page = Some(1);
    }

    let Some(page) = key.page else {
        // The org pages are exhausted; finish with the user itself.
        let user = match client.get_current_user().await {
            Ok(user) => user,
            Err(err) => {
                error!(error = %err, "unable to fetch github user");
                return fail("unable to fetch data for github user".to_string());
            }
        };
        let mut items = Vec::new();
        if matches_search(request.search.as_deref(), &user.login) {
            items.push(user.login);
        }
        return ListOrgsForConnectionResponse {
            items,
            ..Default::default()
        };
    };

    let (orgs, next_page) = match client.list_organizations(page, limit as u32).await {
        Ok(result) => result,
        Err(err) => {
            error!(error = %err, "organization listing failed");
            return fail(err.to_string());
        }
    };
    let mut items: Vec<String> = orgs
        .into_iter()
        .map(|org| org.login)
        .filter(|login| matches_search(request.search.as_deref(), login))
        .collect();
    info!(n_orgs = items.len(), "organization listing succeeded");

    let next_key = if let Some(next) = next_page {
        Some(ListOrgsKey { page: Some(next) })
    } else if items.len() < limit {
        // Room left on this page: append the user and end pagination.
        let user = match client.get_current_user().await {
            Ok(user) => user,
            Err(err) => {
                error!(error = %err, "unable to fetch github user");
                return fail("unable to fetch data for github user".to_string());
            }
        };
        if matches_search(request.search.as_deref(), &user.login) {
            items.push(user.login);
        }
        None
    } else {
        Some(ListOrgsKey { page: None })
    };

    let token = match next_key.as_ref().map(next_token).transpose() {
        Ok(token) => token,
        Err(message) => {
            error!("unable to generate next pagination token");
            return fail(message);
        }
    };

    ListOrgsForConnectionResponse {
        items,
        next_token: token,
        error_message: None,
    }
}

pub(super) async fn search_repos(
    poller: &Arc<Poller>,
    request: SearchRepoRequest,
) -> SearchRepoResponse {
    info!(
        connection_id = %request.connection_id,
        org_name = %request.org_name,
        pagination_token = ?request.token,
        "received search repo request"
    );
    let fail = |message: String| SearchRepoResponse {
        error_message: Some(message),
        ..Default::default()
    };

    let client = match poller.get_github_client(&request.connection_id) {
        Ok(client) => client,
        Err(err) => {
            error!(error = %err, connection_id = %request.connection_id, "unable to initialize github client");
            return fail(err.to_string());
        }
    };
    if request.org_name.is_empty() {
        return fail("org name is required".to_string());
    }
    if request.search.is_empty() {
        return fail("search query is required".to_string());
    }

    let (limit, mut key) =
        match parse_pagination::<PageKey>(request.max_results, request.token.as_deref()) {
            Ok(parsed) => parsed,
            Err(message) => {
                error!(connection_id = %request.connection_id, "unable to parse pagination key");
                return fail(message);
            }
        };
    if request.token.is_none() {
        key.page = 1;
    }

    let query = format!("{} org:{} fork:true", request.search, request.org_name);
    let (repos, next_page) = match client.search_repositories(&query, key.page, limit as u32).await
    {
        Ok(result) => result,
        Err(err) => {
            error!(error = %err, "github repository search failed");
            return fail(err.to_string());
        }
    };
    let items: Vec<String> = repos.into_iter().map(|repo| repo.full_name).collect();

    let next_key = next_page.map(|page| PageKey { page });
    let token = match next_key.as_ref().map(next_token).transpose() {
        Ok(token) => token,
        Err(message) => {
            error!("unable to generate next pagination token");
            return fail(message);
        }
    };

    SearchRepoResponse {
        items,
        next_token: token,
        error_message: None,
    }
}

pub(super) async fn list_branches(
    poller: &Arc<Poller>,
    request: ListRepoBranchesRequest,
) -> ListRepoBranchesResponse {
    info!(
        connection_id = %request.connection_id,
        org_name = %request.org_name,
        repo_name = %request.repo_name,
        pagination_token = ?request.token,
        "received list branches request"
    );
    let fail = |message: String| ListRepoBranchesResponse {
        error_message: Some(message),
        ..Default::default()
    };

    let client = match poller.get_github_client(&request.connection_id) {
        Ok(client) => client,
        Err(err) => {
            error!(error = %err, connection_id = %request.connection_id, "unable to initialize github client");
            return fail(err.to_string());
        }
    };
    if request.org_name.is_empty() {
        return fail("org name is required".to_string());
    }
    if request.repo_name.is_empty() {
        return fail("repo name is required".to_string());
    }

    let (limit, mut key) =
        match parse_pagination::<PageKey>(request.max_results, request.token.as_deref()) {
            Ok(parsed) => parsed,
            Err(message) => {
                error!(connection_id = %request.connection_id, "unable to parse pagination key");
                return fail(message);
            }
        };
    if request.token.is_none() {
        key.page = 1;
    }

    let (branches, next_page) = match client
        .list_branches(&request.org_name, &request.repo_name, key.page, limit as u32)
        .await
    {
        Ok(result) => result,
        Err(err) => {
            error!(error = %err, "github branch listing failed");
            return fail(err.to_string());
        }
    };
    let items: Vec<String> = branches
        .into_iter()
        .map(|branch| branch.name)
        .filter(|name| !name.is_empty())
        .filter(|name| matches_search(request.search.as_deref(), name))
        .collect();

    let next_key = next_page.map(|page| PageKey { page });
    let token = match next_key.as_ref().map(next_token).transpose() {
        Ok(token) => token,
        Err(message) => {
            error!("unable to generate next pagination token");
            return fail(message);
        }
    };

    ListRepoBranchesResponse {
        items,
        next_token: token,
        error_message: None,
    }
}
