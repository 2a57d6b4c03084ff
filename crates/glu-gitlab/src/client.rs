use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;

use crate::transport::{
    is_retryable_gitlab_status, is_retryable_transport_error, parse_next_page, parse_retry_after,
    retry_delay, truncate_for_error,
};
use crate::{
    ApprovalState, GitlabApi, GitlabError, GitlabResult, GitlabUser, MergeRequest,
    MergeRequestDiff, MergeRequestFilter, Page, Project,
};

const PROJECTS_PER_PAGE: &str = "100";
const MERGE_REQUESTS_PER_PAGE: &str = "50";
const DIFFS_PER_PAGE: &str = "100";

/// Connection settings for [`GitlabApiClient`].
#[derive(Debug, Clone)]
pub struct GitlabClientConfig {
    /// API root, e.g. `https://gitlab.example.com/api/v4`.
    pub api_base: String,
    pub token: String,
    pub request_timeout_ms: u64,
    pub retry_max_attempts: usize,
    pub retry_base_delay_ms: u64,
}

impl GitlabClientConfig {
    pub fn new(api_base: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
            token: token.into(),
            request_timeout_ms: 30_000,
            retry_max_attempts: 3,
            retry_base_delay_ms: 500,
        }
    }
}

/// reqwest-backed GitLab REST v4 client.
#[derive(Clone)]
pub struct GitlabApiClient {
    http: reqwest::Client,
    api_base: String,
    retry_max_attempts: usize,
    retry_base_delay_ms: u64,
}

impl GitlabApiClient {
    pub fn new(config: GitlabClientConfig) -> GitlabResult<Self> {
        let api_base = config.api_base.trim().trim_end_matches('/').to_string();
        if api_base.is_empty() {
            return Err(GitlabError::InvalidConfig(
                "gitlab api base url must not be empty".to_string(),
            ));
        }
        let token = config.token.trim();
        if token.is_empty() {
            return Err(GitlabError::InvalidConfig(
                "gitlab token must not be empty".to_string(),
            ));
        }

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::USER_AGENT,
            reqwest::header::HeaderValue::from_static("gitlab-util"),
        );
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        let mut token_header = reqwest::header::HeaderValue::from_str(token).map_err(|_| {
            GitlabError::InvalidConfig("gitlab token contains invalid characters".to_string())
        })?;
        token_header.set_sensitive(true);
        headers.insert("private-token", token_header);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_millis(config.request_timeout_ms.max(1)))
            .build()
            .map_err(|error| {
                GitlabError::InvalidConfig(format!("failed to create gitlab api client: {error}"))
            })?;
        Ok(Self {
            http,
            api_base,
            retry_max_attempts: config.retry_max_attempts.max(1),
            retry_base_delay_ms: config.retry_base_delay_ms.max(1),
        })
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    async fn request_json<T, F>(
        &self,
        operation: &str,
        max_attempts: usize,
        mut request_builder: F,
    ) -> GitlabResult<(T, Option<u32>)>
    where
        T: DeserializeOwned,
        F: FnMut() -> reqwest::RequestBuilder,
    {
        let mut attempt = 0_usize;
        loop {
            attempt = attempt.saturating_add(1);
            let response = request_builder().send().await;
            match response {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let next_page = parse_next_page(response.headers());
                        let parsed =
                            response
                                .json::<T>()
                                .await
                                .map_err(|error| GitlabError::Decode {
                                    operation: operation.to_string(),
                                    message: error.to_string(),
                                })?;
                        return Ok((parsed, next_page));
                    }

                    let retry_after = parse_retry_after(response.headers(), Utc::now());
                    let body = response.text().await.unwrap_or_default();
                    if attempt < max_attempts && is_retryable_gitlab_status(status.as_u16()) {
                        tracing::debug!(
                            operation,
                            status = status.as_u16(),
                            attempt,
                            "retrying gitlab request"
                        );
                        tokio::time::sleep(retry_delay(
                            self.retry_base_delay_ms,
                            attempt,
                            retry_after,
                        ))
                        .await;
                        continue;
                    }

                    return Err(GitlabError::HttpStatus {
                        operation: operation.to_string(),
                        status: status.as_u16(),
                        body: truncate_for_error(&body, 800),
                    });
                }
                Err(error) => {
                    if attempt < max_attempts && is_retryable_transport_error(&error) {
                        tokio::time::sleep(retry_delay(self.retry_base_delay_ms, attempt, None))
                            .await;
                        continue;
                    }
                    return Err(GitlabError::Transport {
                        operation: operation.to_string(),
                        source: error,
                    });
                }
            }
        }
    }

    fn merge_request_url(&self, project_id: u64, iid: u64) -> String {
        format!(
            "{}/projects/{project_id}/merge_requests/{iid}",
            self.api_base
        )
    }
}

#[async_trait]
impl GitlabApi for GitlabApiClient {
    async fn current_user(&self) -> GitlabResult<GitlabUser> {
        let (user, _) = self
            .request_json("resolve current user", self.retry_max_attempts, || {
                self.http.get(format!("{}/user", self.api_base))
            })
            .await?;
        Ok(user)
    }

    async fn list_projects(&self, page: u32) -> GitlabResult<Page<Project>> {
        let page_value = page.max(1).to_string();
        let (items, next_page) = self
            .request_json("list projects", self.retry_max_attempts, || {
                self.http
                    .get(format!("{}/projects", self.api_base))
                    .query(&[
                        ("simple", "true"),
                        ("per_page", PROJECTS_PER_PAGE),
                        ("page", page_value.as_str()),
                    ])
            })
            .await?;
        Ok(Page { items, next_page })
    }

    async fn list_merge_requests(
        &self,
        filter: &MergeRequestFilter,
        page: u32,
    ) -> GitlabResult<Page<MergeRequest>> {
        let page_value = page.max(1).to_string();
        let (items, next_page) = self
            .request_json("list merge requests", self.retry_max_attempts, || {
                let mut request = self
                    .http
                    .get(format!("{}/merge_requests", self.api_base))
                    .query(&[
                        ("state", "opened"),
                        ("scope", "all"),
                        ("order_by", "created_at"),
                        ("sort", "desc"),
                        ("per_page", MERGE_REQUESTS_PER_PAGE),
                        ("page", page_value.as_str()),
                    ]);
                if let Some(author) = filter.author_username.as_deref() {
                    request = request.query(&[("author_username", author)]);
                }
                if let Some(reviewer) = filter.reviewer_username.as_deref() {
                    request = request.query(&[("reviewer_username", reviewer)]);
                }
                request
            })
            .await?;
        Ok(Page { items, next_page })
    }

    async fn get_merge_request(&self, project_id: u64, iid: u64) -> GitlabResult<MergeRequest> {
        let url = self.merge_request_url(project_id, iid);
        let (merge_request, _) = self
            .request_json("get merge request", self.retry_max_attempts, || {
                self.http.get(url.as_str())
            })
            .await?;
        Ok(merge_request)
    }

    async fn list_merge_request_diffs(
        &self,
        project_id: u64,
        iid: u64,
        page: u32,
    ) -> GitlabResult<Page<MergeRequestDiff>> {
        let url = format!("{}/diffs", self.merge_request_url(project_id, iid));
        let page_value = page.max(1).to_string();
        let (items, next_page) = self
            .request_json("list merge request diffs", self.retry_max_attempts, || {
                self.http.get(url.as_str()).query(&[
                    ("unidiff", "true"),
                    ("per_page", DIFFS_PER_PAGE),
                    ("page", page_value.as_str()),
                ])
            })
            .await?;
        Ok(Page { items, next_page })
    }

    // Mutations are attempted once; a retried approve/merge could act twice.
    async fn approve_merge_request(
        &self,
        project_id: u64,
        iid: u64,
    ) -> GitlabResult<ApprovalState> {
        let url = format!("{}/approve", self.merge_request_url(project_id, iid));
        let (state, _) = self
            .request_json("approve merge request", 1, || self.http.post(url.as_str()))
            .await?;
        Ok(state)
    }

    async fn accept_merge_request(&self, project_id: u64, iid: u64) -> GitlabResult<MergeRequest> {
        let url = format!("{}/merge", self.merge_request_url(project_id, iid));
        let (merge_request, _) = self
            .request_json("accept merge request", 1, || self.http.put(url.as_str()))
            .await?;
        Ok(merge_request)
    }
}
