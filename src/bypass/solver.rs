use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::bypass::detect::ChallengeKind;
use crate::error::CrawlError;

/// What a solver needs to know about a challenge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolveRequest {
    pub page_url: String,
    pub kind: ChallengeKind,
    pub site_key: Option<String>,
}

/// Pluggable CAPTCHA / widget solver
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChallengeSolver: Send + Sync {
    /// Return the response token to submit back to the page
    async fn solve(&self, request: &SolveRequest) -> Result<String, CrawlError>;
}

#[derive(Debug, Clone, Serialize)]
struct SolverServiceRequest<'a> {
    url: &'a str,
    kind: ChallengeKind,
    site_key: Option<&'a str>,
    api_key: Option<&'a str>,
}

#[derive(Debug, Clone, Deserialize)]
struct SolverServiceResponse {
    success: bool,
    token: Option<String>,
    error: Option<String>,
}

/// Solver backed by an external HTTP solving service
pub struct HttpSolver {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpSolver {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl ChallengeSolver for HttpSolver {
    async fn solve(&self, request: &SolveRequest) -> Result<String, CrawlError> {
        let endpoint = format!("{}/solve", self.base_url);
        let body = SolverServiceRequest {
            url: &request.page_url,
            kind: request.kind,
            site_key: request.site_key.as_deref(),
            api_key: self.api_key.as_deref(),
        };

        debug!("Sending {:?} challenge to solver service: {}", request.kind, request.page_url);

        let response = self.client.post(&endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| CrawlError::Network(format!("solver service unreachable: {}", e)))?;

        if !response.status().is_success() {
            return Err(CrawlError::Blocked(format!("solver service returned HTTP {}", response.status())));
        }

        let response: SolverServiceResponse = response.json()
            .await
            .map_err(|e| CrawlError::Parse(format!("invalid solver response: {}", e)))?;

        match (response.success, response.token) {
            (true, Some(token)) => Ok(token),
            _ => {
                let reason = response.error.unwrap_or_else(|| "unknown error".to_string());
                error!("Solver service error: {}", reason);
                Err(CrawlError::Blocked(format!("solver failed: {}", reason)))
            }
        }
    }
}
