use serde::{Deserialize, Serialize};

/// What a fetched document turned out to be
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChallengeKind {
    /// Real content
    Normal,
    /// Interstitial that clears itself once its script has run
    ScriptChallenge,
    /// Interstitial that requires a CAPTCHA answer
    ManagedCaptcha,
    /// Interstitial with a click-through widget
    InteractiveWidget,
}

impl ChallengeKind {
    pub fn is_challenge(self) -> bool {
        self != ChallengeKind::Normal
    }

    /// Needs an external solver rather than waiting
    pub fn needs_solver(self) -> bool {
        matches!(self, ChallengeKind::ManagedCaptcha | ChallengeKind::InteractiveWidget)
    }
}

/// Markers that only appear on anti-bot interstitials
const INTERSTITIAL_MARKERS: &[&str] = &[
    "<title>just a moment...</title>",
    "<title>attention required!",
    "<title>please wait...</title>",
    "id=\"challenge-form\"",
    "id=\"cf-challenge-running\"",
    "cf-browser-verification",
    "window._cf_chl_opt",
    "/cdn-cgi/challenge-platform/",
    "name=\"jschl_vc\"",
    "name=\"jschl_answer\"",
    "__cf_chl_jschl_tk__",
    "<title>ddos-guard</title>",
    "check.ddos-guard.net/",
    "ddos-guard.net/.well-known/ddos-guard/",
];

const CAPTCHA_MARKERS: &[&str] = &[
    "cf_captcha_kind",
    "cf-chl-captcha",
    "ctype: 'managed'",
    "ctype: \"managed\"",
    "class=\"g-recaptcha\"",
    "class=\"h-captcha\"",
    "__cf_chl_captcha_tk__",
];

const WIDGET_MARKERS: &[&str] = &[
    "class=\"cf-turnstile\"",
    "challenges.cloudflare.com/turnstile",
    "ctype: 'interactive'",
    "ctype: \"interactive\"",
];

/// Classify a document by structural markers.
///
/// CAPTCHA and widget markers only count inside an interstitial, so a
/// contact form with a reCAPTCHA stays a normal page.
pub fn classify(html: &str) -> ChallengeKind {
    let lower = html.to_ascii_lowercase();

    if !INTERSTITIAL_MARKERS.iter().any(|m| lower.contains(m)) {
        return ChallengeKind::Normal;
    }

    if CAPTCHA_MARKERS.iter().any(|m| lower.contains(m)) {
        ChallengeKind::ManagedCaptcha
    } else if WIDGET_MARKERS.iter().any(|m| lower.contains(m)) {
        ChallengeKind::InteractiveWidget
    } else {
        ChallengeKind::ScriptChallenge
    }
}

/// `data-sitekey` of the widget, which solvers need
pub fn site_key(html: &str) -> Option<String> {
    let start = html.find("data-sitekey=\"")? + "data-sitekey=\"".len();
    let end = html[start..].find('"')? + start;
    Some(html[start..end].to_string())
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(classify(SCRIPT_CHALLENGE), ChallengeKind::ScriptChallenge);
        assert_eq!(classify(MANAGED_CAPTCHA), ChallengeKind::ManagedCaptcha);
        assert_eq!(classify(TURNSTILE), ChallengeKind::InteractiveWidget);
        assert_eq!(classify(NORMAL), ChallengeKind::Normal);
    }

    #[test]
    fn test_ddos_guard_mention_is_not_a_challenge() {
        let article = r#"<html><head><title>Choosing a CDN</title></head>
<body><p>We compared Cloudflare and DDoS-Guard for our origin.</p>
<a href="https://ddos-guard.net/en">ddos-guard.net</a></body></html>"#;
        assert_eq!(classify(article), ChallengeKind::Normal);

        let interstitial = r#"<html><head><title>DDoS-Guard</title>
<script src="https://check.ddos-guard.net/check.js"></script></head><body></body></html>"#;
        assert_eq!(classify(interstitial), ChallengeKind::ScriptChallenge);
    }

    #[test]
    fn test_site_key() {
        assert_eq!(site_key(MANAGED_CAPTCHA).as_deref(), Some("site-key-123"));
        assert_eq!(site_key("<html></html>"), None);
    }
}
