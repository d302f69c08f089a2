use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::crawler::job::JobStatus;

/// Events buffered per subscriber before the oldest are dropped
pub const PROGRESS_CAPACITY: usize = 256;

/// One progress update of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub job_id: String,
    pub current_page: u32,
    pub total_pages: u32,
    pub status: JobStatus,
    pub message: String,
}

/// Typed progress stream.
///
/// Backed by a broadcast channel: sending never waits on subscribers, and a
/// subscriber that falls behind loses the oldest events.
#[derive(Debug, Clone)]
pub struct ProgressChannel {
    sender: broadcast::Sender<ProgressEvent>,
}

impl Default for ProgressChannel {
    fn default() -> Self {
        Self::new(PROGRESS_CAPACITY)
    }
}

impl ProgressChannel {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> ProgressStream {
        ProgressStream { receiver: self.sender.subscribe() }
    }

    pub fn emit(&self, event: ProgressEvent) {
        // No subscribers is not an error
        if self.sender.send(event).is_err() {
            debug!("Progress event dropped, no subscribers");
        }
    }
}

/// Receiving side of a progress channel
pub struct ProgressStream {
    receiver: broadcast::Receiver<ProgressEvent>,
}

impl ProgressStream {
    /// Next event, skipping over anything lost to lag; `None` once closed
    pub async fn next(&mut self) -> Option<ProgressEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Progress subscriber lagged, {} events dropped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`ProgressStream::next`]
    pub fn try_next(&mut self) -> Option<ProgressEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(page: u32) -> ProgressEvent {
        ProgressEvent {
            job_id: "job".to_string(),
            current_page: page,
            total_pages: 10,
            status: JobStatus::Crawling,
            message: format!("page {}", page),
        }
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest() {
        let channel = ProgressChannel::new(4);
        let mut stream = channel.subscribe();

        for page in 0..10 {
            channel.emit(event(page));
        }

        let received: Vec<u32> = std::iter::from_fn(|| stream.try_next()).map(|e| e.current_page).collect();
        assert_eq!(received, vec![6, 7, 8, 9]);
    }

    #[tokio::test]
    async fn test_emit_without_subscribers() {
        let channel = ProgressChannel::default();
        channel.emit(event(1));
        let mut stream = channel.subscribe();
        channel.emit(event(2));
        assert_eq!(stream.next().await.unwrap().current_page, 2);
    }

    #[test]
    fn test_event_contract() {
        let json = serde_json::to_value(event(3)).unwrap();
        assert_eq!(json["currentPage"], 3);
        assert_eq!(json["totalPages"], 10);
        assert_eq!(json["status"], "crawling");
    }
}
