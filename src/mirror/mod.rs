pub mod manifest;
pub mod paths;
pub mod rewrite;

use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Result};

// Re-export common types
pub use manifest::{MirrorManifest, MIRROR_META_DIR};
pub use paths::{asset_path, classify_asset, relative_href, AssetCategory, MirrorLayout};
pub use rewrite::{rewrite_css, rewrite_html, MirrorIndex};

/// Absolute location of a mirror-relative path, refusing anything that escapes the mirror
pub fn mirror_file(output_dir: &Path, relative: &str) -> Result<PathBuf> {
    let relative = Path::new(relative);
    if relative.components().any(|c| !matches!(c, Component::Normal(_))) {
        bail!("Mirror path escapes the output directory: {}", relative.display());
    }
    Ok(output_dir.join(relative))
}
