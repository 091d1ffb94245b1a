//! GitHub client used by the proxy handlers and agent invocations.
//!
//! REST is used for the read-only listing endpoints; the PR feedback
//! assembly uses GraphQL so review threads, issue comments, and review
//! bodies can be fetched with their resolution state.

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, LINK};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use relay_api::messages::{PrComment, PrFeedback};

use crate::error::{Error, Result};

/// Base URL treated as github.com proper; anything else is Enterprise.
pub const DEFAULT_GITHUB_URL: &str = "https://github.com";

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub login: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Organization {
    pub login: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Repository {
    pub full_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Branch {
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct RepositorySearchResult {
    #[serde(default)]
    items: Vec<Repository>,
}

/// GitHub REST + GraphQL client bound to one connection's token.
pub struct GithubClient {
    http: reqwest::Client,
    token: String,
    rest_base: Url,
    graphql_url: Url,
}

impl GithubClient {
    pub fn new(token: &str, base_url: &str) -> Result<Self> {
        if token.is_empty() {
            return Err(Error::Github("missing github token".to_string()));
        }

        let http = reqwest::Client::builder()
            .user_agent(concat!("relay-runner/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Github(e.to_string()))?;

        let (rest_base, graphql_url) = if base_url.is_empty() || base_url == DEFAULT_GITHUB_URL {
            (
                Url::parse("https://api.github.com/").expect("valid github API URL"),
                Url::parse("https://api.github.com/graphql").expect("valid github graphql URL"),
            )
        } else {
            let mut base = base_url.to_string();
            if !base.ends_with('/') {
                base.push('/');
            }
            let base = Url::parse(&base).map_err(|e| Error::Github(e.to_string()))?;
            (
                base.join("api/v3/").map_err(|e| Error::Github(e.to_string()))?,
                base.join("api/graphql")
                    .map_err(|e| Error::Github(e.to_string()))?,
            )
        };

        Ok(Self {
            http,
            token: token.to_string(),
            rest_base,
            graphql_url,
        })
    }

    async fn get_rest<T: DeserializeOwned>(&self, url: Url) -> Result<(T, Option<u32>)> {
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .header(ACCEPT, HeaderValue::from_static("application/vnd.github+json"))
            .send()
            .await
            .map_err(|e| Error::Github(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Github(format!("status {status}: {body}")));
        }

        let next_page = next_page_from_link(response.headers());
        let value = response
            .json()
            .await
            .map_err(|e| Error::Github(e.to_string()))?;
        Ok((value, next_page))
    }

    pub async fn get_current_user(&self) -> Result<User> {
        let url = self
            .rest_base
            .join("user")
            .map_err(|e| Error::Github(e.to_string()))?;
        let (user, _) = self.get_rest(url).await?;
        Ok(user)
    }

    /// List the authenticated user's organizations. Returns the page of
    /// organizations and the next page number, if any.
    pub async fn list_organizations(
        &self,
        page: u32,
        per_page: u32,
    ) -> Result<(Vec<Organization>, Option<u32>)> {
        let mut url = self
            .rest_base
            .join("user/orgs")
            .map_err(|e| Error::Github(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("page", &page.to_string())
            .append_pair("per_page", &per_page.to_string());
        self.get_rest(url).await
    }

    pub async fn search_repositories(
        &self,
        query: &str,
        page: u32,
        per_page: u32,
    ) -> Result<(Vec<Repository>, Option<u32>)> {
        let mut url = self
            .rest_base
            .join("search/repositories")
            .map_err(|e| Error::Github(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("q", query)
            .append_pair("page", &page.to_string())
            .append_pair("per_page", &per_page.to_string());
        let (result, next_page): (RepositorySearchResult, Option<u32>) = self.get_rest(url).await?;
        Ok((result.items, next_page))
    }

    pub async fn list_branches(
        &self,
        owner: &str,
        repo: &str,
        page: u32,
        per_page: u32,
    ) -> Result<(Vec<Branch>, Option<u32>)> {
        let mut url = self
            .rest_base
            .join(&format!("repos/{owner}/{repo}/branches"))
            .map_err(|e| Error::Github(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("page", &page.to_string())
            .append_pair("per_page", &per_page.to_string());
        self.get_rest(url).await
    }

    /// Collect all outstanding feedback on a pull request: review threads
    /// with their comments, standalone issue comments, and review bodies.
    pub async fn get_pr_feedback(
        &self,
        org: &str,
        repo: &str,
        pr_number: u64,
    ) -> Result<Vec<PrFeedback>> {
        let mut feedback = Vec::new();
        self.collect_review_threads(org, repo, pr_number, &mut feedback)
            .await?;
        self.collect_issue_comments(org, repo, pr_number, &mut feedback)
            .await?;
        self.collect_review_bodies(org, repo, pr_number, &mut feedback)
            .await?;
        Ok(feedback)
    }

    async fn query_graphql<V: Serialize, T: DeserializeOwned>(
        &self,
        query: &'static str,
        variables: V,
    ) -> Result<T> {
        #[derive(Serialize)]
        struct GraphQlRequest<V> {
            query: &'static str,
            variables: V,
        }

        let response = self
            .http
            .post(self.graphql_url.clone())
            .bearer_auth(&self.token)
            .header(ACCEPT, HeaderValue::from_static("application/vnd.github+json"))
            .json(&GraphQlRequest { query, variables })
            .send()
            .await
            .map_err(|e| Error::Github(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Github(format!("graphql query returned {status}")));
        }

        response
            .json()
            .await
            .map_err(|e| Error::Github(e.to_string()))
    }

    async fn collect_review_threads(
        &self,
        org: &str,
        repo: &str,
        pr_number: u64,
        feedback: &mut Vec<PrFeedback>,
    ) -> Result<()> {
        let mut cursor: Option<String> = None;
        loop {
            let response: ReviewThreadResponse = self
                .query_graphql(
                    REVIEW_THREAD_QUERY,
                    PrVariables {
                        owner: org,
                        name: repo,
                        pr_num: pr_number,
                        cursor: cursor.clone(),
                    },
                )
                .await?;

            let threads = response.data.repository.pull_request.review_threads;
            for thread in threads.nodes {
                let comments = self.get_thread_comments(&thread.id).await?;
                if comments.is_empty() {
                    continue;
                }
                feedback.push(PrFeedback {
                    id: thread.id,
                    is_resolved: thread.is_resolved,
                    comments,
                });
            }

            if !threads.page_info.has_next_page {
                return Ok(());
            }
            cursor = threads.page_info.end_cursor;
        }
    }

    async fn get_thread_comments(&self, thread_id: &str) -> Result<Vec<PrComment>> {
        let mut comments = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let response: ThreadCommentsResponse = self
                .query_graphql(
                    THREAD_COMMENTS_QUERY,
                    ThreadVariables {
                        thread_id,
                        cursor: cursor.clone(),
                    },
                )
                .await?;

            let page = response.data.node.comments;
            for node in page.nodes {
                let user = node.author.map(|a| a.login).unwrap_or_default();
                if is_runner_comment(&user, &node.body) {
                    continue;
                }
                comments.push(PrComment {
                    user,
                    body: node.body,
                    date: node.created_at,
                    diff_hunk: node.diff_hunk,
                    path: node.path,
                    start_line: node.start_line,
                    orig_start_line: node.original_start_line,
                    commit_hash: node.commit.map(|c| c.oid),
                    is_minimized: node.is_minimized,
                    minimized_reason: node.minimized_reason,
                });
            }

            if !page.page_info.has_next_page {
                return Ok(comments);
            }
            cursor = page.page_info.end_cursor;
        }
    }

    async fn collect_issue_comments(
        &self,
        org: &str,
        repo: &str,
        pr_number: u64,
        feedback: &mut Vec<PrFeedback>,
    ) -> Result<()> {
        let mut cursor: Option<String> = None;
        loop {
            let response: IssueCommentsResponse = self
                .query_graphql(
                    ISSUE_COMMENTS_QUERY,
                    PrVariables {
                        owner: org,
                        name: repo,
                        pr_num: pr_number,
                        cursor: cursor.clone(),
                    },
                )
                .await?;

            let page = response.data.repository.pull_request.comments;
            for node in page.nodes {
                let user = node.author.map(|a| a.login).unwrap_or_default();
                if is_runner_comment(&user, &node.body) {
                    continue;
                }
                feedback.push(PrFeedback {
                    id: node.id,
                    is_resolved: false,
                    comments: vec![PrComment {
                        user,
                        body: node.body,
                        date: node.created_at,
                        is_minimized: node.is_minimized,
                        minimized_reason: node.minimized_reason,
                        ..Default::default()
                    }],
                });
            }

            if !page.page_info.has_next_page {
                return Ok(());
            }
            cursor = page.page_info.end_cursor;
        }
    }

    async fn collect_review_bodies(
        &self,
        org: &str,
        repo: &str,
        pr_number: u64,
        feedback: &mut Vec<PrFeedback>,
    ) -> Result<()> {
        let mut cursor: Option<String> = None;
        loop {
            let response: ReviewsResponse = self
                .query_graphql(
                    REVIEWS_QUERY,
                    PrVariables {
                        owner: org,
                        name: repo,
                        pr_num: pr_number,
                        cursor: cursor.clone(),
                    },
                )
                .await?;

            let page = response.data.repository.pull_request.reviews;
            for node in page.nodes {
                if node.body.is_empty() {
                    continue;
                }
                let user = node.author.map(|a| a.login).unwrap_or_default();
                if is_runner_comment(&user, &node.body) {
                    continue;
                }
                feedback.push(PrFeedback {
                    id: node.id,
                    is_resolved: false,
                    comments: vec![PrComment {
                        user,
                        body: node.body,
                        date: node.created_at,
                        commit_hash: node.commit.map(|c| c.oid),
                        ..Default::default()
                    }],
                });
            }

            if !page.page_info.has_next_page {
                return Ok(());
            }
            cursor = page.page_info.end_cursor;
        }
    }
}

/// Whether a comment was posted by the runner's own marker account and
/// should not be replayed to the agent as feedback.
fn is_runner_comment(user: &str, body: &str) -> bool {
    if !user.to_lowercase().starts_with("relay") {
        return false;
    }
    unescape_html(body).starts_with("<!-- relay")
}

/// Minimal HTML entity unescape, sufficient for the marker prefix check.
fn unescape_html(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

/// Extract the `page` parameter of the `rel="next"` link, if present.
fn next_page_from_link(headers: &HeaderMap) -> Option<u32> {
    let link = headers.get(LINK)?.to_str().ok()?;
    for segment in link.split(',') {
        if !segment.contains(r#"rel="next""#) {
            continue;
        }
        let start = segment.find('<')? + 1;
        let end = segment.find('>')?;
        let url = Url::parse(&segment[start..end]).ok()?;
        return url
            .query_pairs()
            .find(|(key, _)| key == "page")
            .and_then(|(_, value)| value.parse().ok());
    }
    None
}

// --- GraphQL wire types ---

#[derive(Serialize)]
struct PrVariables<'a> {
    owner: &'a str,
    name: &'a str,
    #[serde(rename = "prNum")]
    pr_num: u64,
    cursor: Option<String>,
}

#[derive(Serialize)]
struct ThreadVariables<'a> {
    #[serde(rename = "threadID")]
    thread_id: &'a str,
    cursor: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    #[serde(default)]
    has_next_page: bool,
    #[serde(default)]
    end_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Author {
    #[serde(default)]
    login: String,
}

#[derive(Debug, Deserialize)]
struct CommitOid {
    #[serde(default)]
    oid: String,
}

#[derive(Debug, Deserialize)]
struct ReviewThreadResponse {
    data: ReviewThreadData,
}

#[derive(Debug, Deserialize)]
struct ReviewThreadData {
    repository: ReviewThreadRepository,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReviewThreadRepository {
    pull_request: ReviewThreadPullRequest,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReviewThreadPullRequest {
    review_threads: ReviewThreadPage,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReviewThreadPage {
    #[serde(default)]
    page_info: PageInfo,
    #[serde(default)]
    nodes: Vec<ReviewThreadNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReviewThreadNode {
    id: String,
    #[serde(default)]
    is_resolved: bool,
}

const REVIEW_THREAD_QUERY: &str = r#"
query($owner:String!, $name:String!, $prNum:Int!, $cursor:String) {
  repository(owner: $owner, name: $name) {
    pullRequest(number: $prNum) {
      reviewThreads(first: 100, after: $cursor) {
        pageInfo { hasNextPage endCursor }
        nodes {
          id
          isResolved
        }
      }
    }
  }
}
"#;

#[derive(Debug, Deserialize)]
struct ThreadCommentsResponse {
    data: ThreadCommentsData,
}

#[derive(Debug, Deserialize)]
struct ThreadCommentsData {
    node: ThreadCommentsNode,
}

#[derive(Debug, Deserialize)]
struct ThreadCommentsNode {
    comments: ThreadCommentsPage,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThreadCommentsPage {
    #[serde(default)]
    page_info: PageInfo,
    #[serde(default)]
    nodes: Vec<ThreadCommentNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThreadCommentNode {
    #[serde(default)]
    author: Option<Author>,
    #[serde(default)]
    body: String,
    #[serde(default)]
    created_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    is_minimized: bool,
    #[serde(default)]
    minimized_reason: Option<String>,
    #[serde(default)]
    diff_hunk: Option<String>,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    commit: Option<CommitOid>,
    #[serde(default)]
    start_line: Option<i64>,
    #[serde(default)]
    original_start_line: Option<i64>,
}

const THREAD_COMMENTS_QUERY: &str = r#"
query($threadID:ID!, $cursor:String) {
  node(id: $threadID) {
    ... on PullRequestReviewThread {
      comments(first: 100, after: $cursor) {
        pageInfo { hasNextPage endCursor }
        nodes {
          author { login }
          body
          createdAt
          isMinimized
          minimizedReason
          diffHunk
          path
          commit { oid }
          startLine
          originalStartLine
        }
      }
    }
  }
}
"#;

#[derive(Debug, Deserialize)]
struct IssueCommentsResponse {
    data: IssueCommentsData,
}

#[derive(Debug, Deserialize)]
struct IssueCommentsData {
    repository: IssueCommentsRepository,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IssueCommentsRepository {
    pull_request: IssueCommentsPullRequest,
}

#[derive(Debug, Deserialize)]
struct IssueCommentsPullRequest {
    comments: IssueCommentsPage,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IssueCommentsPage {
    #[serde(default)]
    page_info: PageInfo,
    #[serde(default)]
    nodes: Vec<IssueCommentNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IssueCommentNode {
    id: String,
    #[serde(default)]
    author: Option<Author>,
    #[serde(default)]
    body: String,
    #[serde(default)]
    created_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    is_minimized: bool,
    #[serde(default)]
    minimized_reason: Option<String>,
}

const ISSUE_COMMENTS_QUERY: &str = r#"
query($owner:String!, $name:String!, $prNum:Int!, $cursor:String) {
  repository(owner: $owner, name: $name) {
    pullRequest(number: $prNum) {
      comments(first: 100, after: $cursor) {
        pageInfo { hasNextPage endCursor }
        nodes {
          id
          author { login }
          body
          createdAt
          isMinimized
          minimizedReason
        }
      }
    }
  }
}
"#;

#[derive(Debug, Deserialize)]
struct ReviewsResponse {
    data: ReviewsData,
}

#[derive(Debug, Deserialize)]
struct ReviewsData {
    repository: ReviewsRepository,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReviewsRepository {
    pull_request: ReviewsPullRequest,
}

#[derive(Debug, Deserialize)]
struct ReviewsPullRequest {
    reviews: ReviewsPage,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReviewsPage {
    #[serde(default)]
    page_info: PageInfo,
    #[serde(default)]
    nodes: Vec<ReviewNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReviewNode {
    id: String,
    #[serde(default)]
    author: Option<Author>,
    #[serde(default)]
    body: String,
    #[serde(default)]
    created_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    commit: Option<CommitOid>,
}

const REVIEWS_QUERY: &str = r#"
query($owner:String!, $name:String!, $prNum:Int!, $cursor:String) {
  repository(owner: $owner, name: $name) {
    pullRequest(number: $prNum) {
      reviews(first: 100, after: $cursor) {
        pageInfo { hasNextPage endCursor }
        nodes {
          id
          author { login }
          body
          createdAt
          commit { oid }
        }
      }
    }
  }
}
"#;
