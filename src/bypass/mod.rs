pub mod detect;
pub mod solver;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::CrawlError;

pub use detect::{classify, site_key, ChallengeKind};
pub use solver::{ChallengeSolver, HttpSolver, SolveRequest};

/// Page handle the bypass layer drives: a browser tab or an HTTP re-request
#[async_trait]
pub trait ChallengePage: Send {
    async fn current_url(&mut self) -> Result<String, CrawlError>;

    async fn content(&mut self) -> Result<String, CrawlError>;

    /// Let the challenge script run
    async fn wait(&mut self, duration: Duration) -> Result<(), CrawlError>;

    async fn reload(&mut self) -> Result<(), CrawlError>;

    /// Hand a solver token to the page and submit the challenge
    async fn submit_token(&mut self, kind: ChallengeKind, token: &str) -> Result<(), CrawlError>;
}

/// What happened when a challenge was met
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BypassOutcome {
    /// Classification of the first response
    pub detected: ChallengeKind,

    /// Wait/reload rounds or solver submissions made
    pub attempts: u32,

    pub solver_used: bool,
}

/// Challenge bypass settings and the optional external solver
#[derive(Clone)]
pub struct ChallengeBypass {
    pub enabled: bool,

    /// Rounds for script challenges
    pub max_attempts: u32,

    /// How long a challenge script gets per round
    pub challenge_wait: Duration,

    solver: Option<Arc<dyn ChallengeSolver>>,
}

impl Default for ChallengeBypass {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 2,
            challenge_wait: Duration::from_secs(5),
            solver: None,
        }
    }
}

impl ChallengeBypass {
    pub fn new(enabled: bool, max_attempts: u32, challenge_wait: Duration) -> Self {
        Self { enabled, max_attempts, challenge_wait, solver: None }
    }

    pub fn with_solver(mut self, solver: Arc<dyn ChallengeSolver>) -> Self {
        self.solver = Some(solver);
        self
    }

    pub fn has_solver(&self) -> bool {
        self.solver.is_some()
    }

    /// Same solver with per-job overrides
    pub fn for_job(&self, enabled: bool, max_attempts: u32) -> Self {
        Self { enabled, max_attempts, ..self.clone() }
    }

    /// Turn a possibly-challenged document into the real one.
    ///
    /// Returns the final HTML and, when a challenge was met, how it was
    /// handled. Fails with `Blocked` when the challenge cannot be cleared.
    pub async fn resolve<P: ChallengePage + ?Sized>(
        &self,
        page: &mut P,
        html: String,
    ) -> Result<(String, Option<BypassOutcome>), CrawlError> {
        let detected = classify(&html);
        if !detected.is_challenge() {
            return Ok((html, None));
        }

        let url = page.current_url().await?;
        info!("{:?} detected on {}", detected, url);

        if !self.enabled {
            return Err(CrawlError::Blocked(format!("{:?} on {} and bypass is disabled", detected, url)));
        }

        let mut outcome = BypassOutcome { detected, attempts: 0, solver_used: false };
        let mut kind = detected;
        let mut html = html;

        // Script challenges clear themselves once the browser has run them
        while kind == ChallengeKind::ScriptChallenge && outcome.attempts < self.max_attempts {
            outcome.attempts += 1;
            page.wait(self.challenge_wait).await?;
            html = page.content().await?;
            kind = classify(&html);

            if kind == ChallengeKind::ScriptChallenge {
                debug!("Challenge still present on {} after round {}", url, outcome.attempts);
                page.reload().await?;
                html = page.content().await?;
                kind = classify(&html);
            }
        }

        if kind.needs_solver() {
            let solver = match &self.solver {
                Some(solver) => solver,
                None => {
                    warn!("{:?} on {} and no solver configured", kind, url);
                    return Err(CrawlError::Blocked(format!("{:?} on {} requires a solver", kind, url)));
                }
            };

            let request = SolveRequest { page_url: url.clone(), kind, site_key: site_key(&html) };
            let token = solver.solve(&request).await?;
            outcome.attempts += 1;
            outcome.solver_used = true;

            page.submit_token(kind, &token).await?;
            page.wait(self.challenge_wait).await?;
            html = page.content().await?;
            kind = classify(&html);
        }

        if kind.is_challenge() {
            return Err(CrawlError::Blocked(format!(
                "{:?} on {} persisted after {} attempts",
                kind, url, outcome.attempts
            )));
        }

        info!("Challenge on {} cleared after {} attempts", url, outcome.attempts);
        Ok((html, Some(outcome)))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Page that serves a fixed sequence of documents, one per wait/reload/submit
    pub struct ScriptedPage {
        pub documents: Vec<String>,
        pub position: usize,
        pub tokens: Vec<String>,
    }

    impl ScriptedPage {
        pub fn new(documents: &[&str]) -> Self {
            Self {
                documents: documents.iter().map(|d| d.to_string()).collect(),
                position: 0,
                tokens: Vec::new(),
            }
        }

        fn advance(&mut self) {
            if self.position + 1 < self.documents.len() {
                self.position += 1;
            }
        }
    }

    #[async_trait]
    impl ChallengePage for ScriptedPage {
        async fn current_url(&mut self) -> Result<String, CrawlError> {
            Ok("https://example.com/".to_string())
        }

        async fn content(&mut self) -> Result<String, CrawlError> {
            Ok(self.documents[self.position].clone())
        }

        async fn wait(&mut self, _duration: Duration) -> Result<(), CrawlError> {
            self.advance();
            Ok(())
        }

        async fn reload(&mut self) -> Result<(), CrawlError> {
            self.advance();
            Ok(())
        }

        async fn submit_token(&mut self, _kind: ChallengeKind, token: &str) -> Result<(), CrawlError> {
            self.tokens.push(token.to_string());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::detect::fixtures::*;
    use super::solver::MockChallengeSolver;
    use super::testing::ScriptedPage;
    use super::*;

    const CONTENT: &str = "<html><head><title>Home</title></head><body>Welcome</body></html>";

    fn bypass() -> ChallengeBypass {
        ChallengeBypass::new(true, 2, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_normal_page_passes_through() {
        let mut page = ScriptedPage::new(&[CONTENT]);
        let (html, outcome) = bypass().resolve(&mut page, CONTENT.to_string()).await.unwrap();
        assert_eq!(html, CONTENT);
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn test_script_challenge_is_cleared() {
        let mut page = ScriptedPage::new(&[SCRIPT_CHALLENGE, CONTENT]);
        let (html, outcome) = bypass().resolve(&mut page, SCRIPT_CHALLENGE.to_string()).await.unwrap();

        assert_eq!(classify(&html), ChallengeKind::Normal);
        assert!(!html.contains("jschl"));
        let outcome = outcome.unwrap();
        assert_eq!(outcome.detected, ChallengeKind::ScriptChallenge);
        assert_eq!(outcome.attempts, 1);
        assert!(!outcome.solver_used);
    }

    #[tokio::test]
    async fn test_persistent_script_challenge_is_blocked() {
        let mut page = ScriptedPage::new(&[SCRIPT_CHALLENGE]);
        let err = bypass().resolve(&mut page, SCRIPT_CHALLENGE.to_string()).await.unwrap_err();
        assert!(matches!(err, CrawlError::Blocked(_)));
    }

    #[tokio::test]
    async fn test_captcha_without_solver_blocks_immediately() {
        let mut page = ScriptedPage::new(&[MANAGED_CAPTCHA, CONTENT]);
        let err = bypass().resolve(&mut page, MANAGED_CAPTCHA.to_string()).await.unwrap_err();
        assert!(matches!(err, CrawlError::Blocked(msg) if msg.contains("requires a solver")));
        assert_eq!(page.position, 0);
    }

    #[tokio::test]
    async fn test_captcha_is_delegated_to_solver() {
        let mut solver = MockChallengeSolver::new();
        solver.expect_solve()
            .withf(|request| request.kind == ChallengeKind::ManagedCaptcha
                && request.site_key.as_deref() == Some("site-key-123"))
            .times(1)
            .returning(|_| Ok("token-abc".to_string()));

        let bypass = bypass().with_solver(Arc::new(solver));
        let mut page = ScriptedPage::new(&[MANAGED_CAPTCHA, CONTENT]);
        let (html, outcome) = bypass.resolve(&mut page, MANAGED_CAPTCHA.to_string()).await.unwrap();

        assert_eq!(html, CONTENT);
        assert_eq!(page.tokens, vec!["token-abc"]);
        assert!(outcome.unwrap().solver_used);
    }

    #[tokio::test]
    async fn test_disabled_bypass_reports_blocked() {
        let bypass = bypass().for_job(false, 2);
        let mut page = ScriptedPage::new(&[TURNSTILE]);
        assert!(matches!(
            bypass.resolve(&mut page, TURNSTILE.to_string()).await,
            Err(CrawlError::Blocked(_))
        ));
    }
}
