pub mod report;
pub mod scorer;

use std::path::Path;

use async_trait::async_trait;

use crate::error::CrawlError;

/// Reloads a mirrored page in a sandboxed browser
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ScriptProbe: Send + Sync {
    /// Uncaught script errors raised while the page loads
    async fn script_errors(&self, page: &Path) -> Result<Vec<String>, CrawlError>;
}

// Re-export common types
pub use report::{
    AssetStats, IntegrityStats, IssueCategory, LinkStats, ScoreComponents, ScoreWeights, ScriptCheck,
    VerificationIssue, VerificationReport,
};
pub use scorer::Verifier;
