use anyhow::Result;
use rand::{thread_rng, Rng};
use std::time::Duration;
use tokio::time::sleep;
use thirtyfour::prelude::*;
use tracing::debug;

use crate::cli::config::BrowserBehavior;

/// Page interaction before the DOM is captured
pub struct BehaviorSimulator {
    config: BrowserBehavior,
}

impl BehaviorSimulator {
    pub fn new(config: BrowserBehavior) -> Self {
        Self { config }
    }

    /// Scroll to the bottom in steps so lazy-loaded content is requested,
    /// then return to the top
    pub async fn load_lazy_content(&self, driver: &WebDriver) -> Result<()> {
        if !self.config.lazy_scroll {
            return Ok(());
        }

        let mut steps = 0;
        while steps < self.config.max_scroll_steps {
            let at_bottom = driver.execute(
                &format!(
                    "window.scrollBy(0, {}); return (window.innerHeight + window.scrollY) >= document.body.scrollHeight;",
                    self.config.scroll_step_px
                ),
                Vec::new(),
            )
            .await?;
            steps += 1;

            sleep(self.step_delay()).await;

            if at_bottom.json().as_bool().unwrap_or(true) {
                break;
            }
        }

        driver.execute("window.scrollTo(0, 0);", Vec::new()).await?;
        sleep(Duration::from_millis(self.config.settle_ms)).await;

        debug!("Scrolled through page in {} steps", steps);
        Ok(())
    }

    fn step_delay(&self) -> Duration {
        let (min, max) = self.config.scroll_delay;
        let millis = if max > min { thread_rng().gen_range(min..max) } else { min };
        Duration::from_millis(millis)
    }
}
