use std::collections::HashMap;
use anyhow::{Result, Context};
use rand::{thread_rng, Rng};

use crate::cli::config::{BrowserFingerprint, Viewport};

/// Browser fingerprint selection
pub struct FingerprintManager {
    /// Available fingerprints to use
    fingerprints: Vec<BrowserFingerprint>,

    /// Base viewport; mobile agents get a phone-sized one
    viewport: Viewport,

    pinned: Option<String>,
}

/// Identity a browser session presents
#[derive(Debug, Clone, PartialEq)]
pub struct Fingerprint {
    pub name: String,
    pub user_agent: String,
    pub accept_language: String,
    pub platform: String,
    pub viewport: Viewport,
    pub headers: HashMap<String, String>,
}

impl Fingerprint {
    /// Primary language tag, e.g. `en-US`
    pub fn language(&self) -> &str {
        self.accept_language
            .split(',')
            .next()
            .map(|tag| tag.split(';').next().unwrap_or(tag).trim())
            .filter(|tag| !tag.is_empty())
            .unwrap_or("en-US")
    }
}

impl FingerprintManager {
    pub fn new(fingerprints: Vec<BrowserFingerprint>, viewport: Viewport) -> Self {
        Self { fingerprints, viewport, pinned: None }
    }

    pub fn with_pinned(mut self, name: Option<String>) -> Self {
        self.pinned = name;
        self
    }

    /// Fingerprint for a new session: the pinned one, or a random pick
    pub fn select(&self) -> Result<Fingerprint> {
        match &self.pinned {
            Some(name) => self.get_fingerprint(name),
            None => self.random_fingerprint(),
        }
    }

    /// Select a random fingerprint
    pub fn random_fingerprint(&self) -> Result<Fingerprint> {
        if self.fingerprints.is_empty() {
            anyhow::bail!("No fingerprints available");
        }

        let index = thread_rng().gen_range(0..self.fingerprints.len());
        Ok(self.complete(&self.fingerprints[index]))
    }

    /// Get a specific fingerprint by name
    pub fn get_fingerprint(&self, name: &str) -> Result<Fingerprint> {
        let fingerprint = self.fingerprints.iter()
            .find(|f| f.name == name)
            .context(format!("Fingerprint not found: {}", name))?;

        Ok(self.complete(fingerprint))
    }

    fn complete(&self, fingerprint: &BrowserFingerprint) -> Fingerprint {
        let viewport = if fingerprint.user_agent.contains("Mobile") {
            Viewport { width: 390, height: 844 }
        } else {
            self.viewport.clone()
        };

        let mut headers = fingerprint.extra_headers.clone();
        headers.insert("Accept-Language".to_string(), fingerprint.accept_language.clone());

        Fingerprint {
            name: fingerprint.name.clone(),
            user_agent: fingerprint.user_agent.clone(),
            accept_language: fingerprint.accept_language.clone(),
            platform: fingerprint.platform.clone(),
            viewport,
            headers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fingerprint(name: &str, user_agent: &str) -> BrowserFingerprint {
        BrowserFingerprint {
            name: name.to_string(),
            user_agent: user_agent.to_string(),
            accept_language: "de-DE;q=1.0,de;q=0.8".to_string(),
            platform: "Linux x86_64".to_string(),
            extra_headers: HashMap::new(),
        }
    }

    #[test]
    fn test_selects_by_name_and_sizes_viewport() {
        let manager = FingerprintManager::new(
            vec![fingerprint("desktop", "Mozilla/5.0 Chrome"), fingerprint("phone", "Mozilla/5.0 Mobile Safari")],
            Viewport { width: 1366, height: 768 },
        );

        let desktop = manager.get_fingerprint("desktop").unwrap();
        assert_eq!(desktop.viewport, Viewport { width: 1366, height: 768 });
        assert_eq!(desktop.language(), "de-DE");

        let phone = manager.get_fingerprint("phone").unwrap();
        assert_eq!(phone.viewport.width, 390);
        assert!(manager.get_fingerprint("tablet").is_err());
    }

    #[test]
    fn test_empty_manager_has_no_random_pick() {
        let manager = FingerprintManager::new(vec![], Viewport { width: 800, height: 600 });
        assert!(manager.random_fingerprint().is_err());
    }

    #[test]
    fn test_pinned_fingerprint_always_selected() {
        let manager = FingerprintManager::new(
            vec![fingerprint("desktop", "Mozilla/5.0 Chrome"), fingerprint("phone", "Mozilla/5.0 Mobile Safari")],
            Viewport { width: 1366, height: 768 },
        )
        .with_pinned(Some("phone".to_string()));

        for _ in 0..5 {
            assert_eq!(manager.select().unwrap().name, "phone");
        }
    }
}
