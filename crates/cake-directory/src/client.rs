//! HTTP client for the user-management service.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::{DirectoryError, DirectoryGateway, UserPage, UserPatch, UserRecord};

/// Attempts per request: initial + 3 retries with backoff.
const MAX_ATTEMPTS: u32 = 4;

/// Directory gateway backed by the user-management REST API.
pub struct HttpDirectory {
    http: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpDirectory {
    /// Create a new client for the given service URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build HTTP client");

        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
        }
    }

    /// Authenticate every request with a bearer token.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Get the service URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.header("Authorization", format!("Bearer {}", token)),
            None => request,
        }
    }

    /// Check if an error is transient and worth retrying.
    fn is_transient_error(err: &DirectoryError) -> bool {
        match err {
            DirectoryError::Status { status, .. } => matches!(status, 502..=504),
            DirectoryError::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    /// Send a request built by `build`, retrying transient failures.
    async fn send<T, F>(&self, operation: &str, build: F) -> Result<T, DirectoryError>
    where
        T: DeserializeOwned,
        F: Fn() -> RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            let result = match self.authorize(build()).send().await {
                Ok(response) => self.handle_response(response).await,
                Err(e) => Err(DirectoryError::Http(e)),
            };

            match result {
                Err(ref e) if Self::is_transient_error(e) && attempt + 1 < MAX_ATTEMPTS => {
                    let backoff_ms = 500 * (1 << attempt); // 500ms, 1s, 2s
                    warn!(
                        operation,
                        attempt = attempt + 1,
                        backoff_ms,
                        error = %e,
                        "transient directory error, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    attempt += 1;
                }
                _ => return result,
            }
        }
    }

    /// Handle HTTP response and parse JSON.
    async fn handle_response<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, DirectoryError> {
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok());
            return Err(DirectoryError::RateLimited { retry_after_secs });
        }

        if status == StatusCode::NOT_FOUND {
            return Err(DirectoryError::NotFound(response.url().path().to_string()));
        }

        if !status.is_success() {
            let body = response.text().await.map_err(|e| {
                DirectoryError::InvalidResponse(format!(
                    "request failed ({}): failed to read response: {}",
                    status, e
                ))
            })?;
            return Err(DirectoryError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.json().await?;
        Ok(body)
    }
}

#[async_trait]
impl DirectoryGateway for HttpDirectory {
    async fn fetch_page(&self, page: u32, per_page: u32) -> Result<UserPage, DirectoryError> {
        let url = format!("{}/users", self.base_url);
        let result: UserPage = self
            .send("fetch_page", || {
                self.http
                    .get(&url)
                    .query(&[("page", page), ("per_page", per_page)])
            })
            .await?;

        debug!(
            page = result.page,
            last_page = result.last_page,
            count = result.records.len(),
            "fetched user page"
        );
        Ok(result)
    }

    async fn fetch_unsent(&self) -> Result<Vec<UserRecord>, DirectoryError> {
        let url = format!("{}/users/unsent", self.base_url);
        let users: Vec<UserRecord> = self
            .send("fetch_unsent", || self.http.get(&url))
            .await?;

        debug!(count = users.len(), "fetched unsent users");
        Ok(users)
    }

    async fn update(&self, user_id: &str, patch: &UserPatch) -> Result<UserRecord, DirectoryError> {
        if user_id.is_empty() {
            return Err(DirectoryError::InvalidResponse(
                "cannot update a user without an id".to_string(),
            ));
        }

        let url = format!("{}/users/{}", self.base_url, user_id);
        let user: UserRecord = self
            .send("update", || self.http.patch(&url).json(patch))
            .await
            .map_err(|e| match e {
                DirectoryError::NotFound(_) => DirectoryError::NotFound(user_id.to_string()),
                other => other,
            })?;

        debug!(user_id, "updated user");
        Ok(user)
    }
}
