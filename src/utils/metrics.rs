use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

/// Per-job fetch metrics collector
#[derive(Debug, Clone)]
pub struct FetchMetrics {
    metrics: Arc<Mutex<FetchStats>>,
}

/// Snapshot of the counters gathered for one job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchStats {
    /// Start time of the metrics collection
    pub start_time: DateTime<Utc>,
    
    /// Page and asset requests that completed (successfully or not)
    pub total_requests: usize,
    
    pub successful_requests: usize,
    
    pub failed_requests: usize,
    
    /// Pages served from the content cache instead of being processed again
    pub cache_hits: usize,
    
    /// Extra attempts spent by the retry policy
    pub retries: usize,
    
    /// Bytes downloaded
    pub bytes_downloaded: u64,
    
    /// Sum of request durations in milliseconds
    pub total_duration_ms: u64,
    
    /// Slowest single request in milliseconds
    pub max_duration_ms: u64,
    
    /// HTTP status code counts
    pub status_codes: HashMap<u16, usize>,
}

impl Default for FetchStats {
    fn default() -> Self {
        Self {
            start_time: Utc::now(),
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            cache_hits: 0,
            retries: 0,
            bytes_downloaded: 0,
            total_duration_ms: 0,
            max_duration_ms: 0,
            status_codes: HashMap::new(),
        }
    }
}

impl FetchStats {
    /// Mean request duration in milliseconds
    pub fn mean_duration_ms(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.total_duration_ms as f64 / self.total_requests as f64
        }
    }
    
    /// Requests per second since collection started
    pub fn requests_per_second(&self) -> f64 {
        let elapsed = (Utc::now() - self.start_time).num_milliseconds().max(1) as f64 / 1000.0;
        self.total_requests as f64 / elapsed
    }
}

impl Default for FetchMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl FetchMetrics {
    pub fn new() -> Self {
        Self {
            metrics: Arc::new(Mutex::new(FetchStats::default())),
        }
    }
    
    /// Record a finished request
    pub async fn record_request(&self, success: bool, duration_ms: u64, status_code: Option<u16>, bytes: u64) {
        let mut metrics = self.metrics.lock().await;
        
        metrics.total_requests += 1;
        if success {
            metrics.successful_requests += 1;
        } else {
            metrics.failed_requests += 1;
        }
        
        metrics.bytes_downloaded += bytes;
        metrics.total_duration_ms += duration_ms;
        metrics.max_duration_ms = metrics.max_duration_ms.max(duration_ms);
        
        if let Some(code) = status_code {
            *metrics.status_codes.entry(code).or_default() += 1;
        }
    }
    
    pub async fn record_cache_hit(&self) {
        self.metrics.lock().await.cache_hits += 1;
    }
    
    pub async fn record_retries(&self, retries: u32) {
        self.metrics.lock().await.retries += retries as usize;
    }
    
    /// Start timing a request
    pub fn start_timer(&self) -> RequestTimer {
        RequestTimer {
            start: Instant::now(),
        }
    }
    
    /// Get all metrics
    pub async fn snapshot(&self) -> FetchStats {
        self.metrics.lock().await.clone()
    }
}

/// Request timer for measuring request durations
pub struct RequestTimer {
    start: Instant,
}

impl RequestTimer {
    /// End timing and get the duration in milliseconds
    pub fn end(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_record_request_aggregates() {
        let metrics = FetchMetrics::new();
        metrics.record_request(true, 100, Some(200), 1000).await;
        metrics.record_request(false, 300, Some(429), 0).await;
        metrics.record_cache_hit().await;

        let stats = metrics.snapshot().await;
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.failed_requests, 1);
        assert_eq!(stats.bytes_downloaded, 1000);
        assert_eq!(stats.max_duration_ms, 300);
        assert_eq!(stats.mean_duration_ms(), 200.0);
        assert_eq!(stats.status_codes.get(&429), Some(&1));
        assert_eq!(stats.cache_hits, 1);
    }
}
