pub mod behavior;
pub mod driver;
pub mod fetcher;
pub mod fingerprint;
pub mod http;
pub mod pool;
pub mod session;

// Re-export common types
pub use behavior::BehaviorSimulator;
pub use driver::{BrowserFetcher, BrowserScriptProbe};
pub use fetcher::{FetchProfile, FetchRequest, FetchedAsset, FetchedPage, PageFetcher};
pub use fingerprint::{Fingerprint, FingerprintManager};
pub use http::HttpFetcher;
pub use pool::{PooledSession, SessionPool};
pub use session::BrowserSession;
