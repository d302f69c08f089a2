pub mod optimize;
pub mod pipeline;
pub mod table;

use serde::{Deserialize, Serialize};
use url::Url;

/// One stored resource of the mirror.
///
/// Records are keyed by the hash of the downloaded bytes; every URL that
/// served the same bytes shares the record and its file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRecord {
    /// First URL the content was downloaded from
    pub source_url: String,

    /// Hash of the downloaded bytes, the dedup key
    pub content_hash: String,

    /// Hash of the file as written (after optimization or link rewriting)
    pub stored_hash: String,

    /// Size of the file as written
    pub byte_size: u64,

    /// Path relative to the mirror root
    pub local_path: String,

    pub optimized: bool,

    /// Pages and stylesheets referencing this content
    pub ref_count: u32,

    pub content_type: Option<String>,

    /// Other URLs that served identical bytes
    #[serde(default)]
    pub aliases: Vec<String>,

    /// Asset keys a stylesheet points at
    #[serde(default)]
    pub references: Vec<String>,
}

/// Table key of an asset URL; fragments never change the resource
pub fn asset_key(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    url.to_string()
}

// Re-export common types
pub use optimize::{optimize, Optimized};
pub use pipeline::{AssetPipeline, PageAssets};
pub use table::AssetTable;
