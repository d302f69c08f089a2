use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Weights of the score components.
///
/// Components that were not evaluated drop out and the remaining weights
/// are renormalised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub links: f64,
    pub assets: f64,
    pub integrity: f64,
    pub javascript: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self { links: 0.4, assets: 0.3, integrity: 0.2, javascript: 0.1 }
    }
}

impl ScoreWeights {
    /// Overall score in 0..=100
    pub fn combine(&self, components: &ScoreComponents) -> f64 {
        let mut parts = vec![
            (self.links, components.links),
            (self.assets, components.assets),
            (self.integrity, components.integrity),
        ];
        if let Some(javascript) = components.javascript {
            parts.push((self.javascript, javascript));
        }

        let total_weight: f64 = parts.iter().map(|(weight, _)| weight.max(0.0)).sum();
        if total_weight <= 0.0 {
            return 0.0;
        }

        let weighted: f64 = parts.iter().map(|(weight, value)| weight.max(0.0) * value).sum();
        ((weighted / total_weight) * 10_000.0).round() / 100.0
    }
}

/// Fraction of successes, 1.0 when there was nothing to check
pub fn ratio(good: u32, total: u32) -> f64 {
    if total == 0 {
        1.0
    } else {
        good as f64 / total as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCategory {
    /// Internal link or reference that does not resolve to a file in the mirror
    BrokenLink,
    /// Asset the original page referenced that the mirror does not hold
    MissingAsset,
    /// Stored asset whose bytes no longer match the recorded hash
    IntegrityMismatch,
    /// Page recorded as captured without a file in the mirror
    MissingPage,
    /// Uncaught script error on reload
    ScriptError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationIssue {
    pub category: IssueCategory,

    /// Mirror path of the page the issue was found on
    pub page: Option<String>,

    /// Reference, URL or file concerned
    pub target: String,

    pub detail: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkStats {
    pub total: u32,
    pub valid: u32,
    pub broken: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssetStats {
    pub expected: u32,
    pub found: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntegrityStats {
    pub checked: u32,
    pub mismatched: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptCheck {
    pub pages_checked: u32,
    pub pages_with_errors: u32,
}

/// Per-component scores in 0..=1
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreComponents {
    pub links: f64,
    pub assets: f64,
    pub integrity: f64,
    /// `None` when the script check did not run
    pub javascript: Option<f64>,
}

/// Quality of a finished mirror; attached to the job once computed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationReport {
    pub links: LinkStats,

    pub assets: AssetStats,

    pub integrity: IntegrityStats,

    pub javascript: Option<ScriptCheck>,

    pub components: ScoreComponents,

    /// Weighted score in 0..=100
    pub score: f64,

    pub issues: Vec<VerificationIssue>,

    pub verified_at: DateTime<Utc>,
}

impl VerificationReport {
    pub fn issue_count(&self, category: IssueCategory) -> usize {
        self.issues.iter().filter(|issue| issue.category == category).count()
    }
}
