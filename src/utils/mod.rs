pub mod fs;
pub mod hashing;
pub mod logging;
pub mod metrics;

// Re-export common functions and types
pub use fs::write_atomic;
pub use hashing::{content_hash, short_hash};
pub use logging::{default_log_file, init_logging};
pub use metrics::{FetchMetrics, FetchStats, RequestTimer};
