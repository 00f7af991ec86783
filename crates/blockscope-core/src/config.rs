//! Scan configuration types.

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

use crate::pattern;

/// Configuration for scanning operations.
#[derive(Debug, Clone, Default, Builder, Serialize, Deserialize)]
#[builder(setter(into), default)]
pub struct ScanConfig {
    /// Skip entries whose device differs from their parent directory.
    #[serde(default)]
    pub same_fs: bool,

    /// Resolve symlinks whose target is not a directory.
    #[serde(default)]
    pub follow_symlinks: bool,

    /// Skip directories carrying a valid CACHEDIR.TAG.
    #[serde(default)]
    pub exclude_caches: bool,

    /// Skip kernel pseudo-filesystems (Linux only).
    #[serde(default)]
    pub exclude_kernfs: bool,

    /// Ordered fnmatch globs; matching entries are excluded.
    #[serde(default)]
    pub exclude_patterns: Vec<String>,

    /// Capture uid/gid/mode/mtime per entry.
    #[serde(default)]
    pub extended: bool,
}

impl ScanConfig {
    /// Create a scan config builder.
    pub fn builder() -> ScanConfigBuilder {
        ScanConfigBuilder::default()
    }

    /// Whether a full path matches any exclude pattern. Each pattern is
    /// tried against the path and every `/`-rooted suffix.
    pub fn is_excluded(&self, path: &[u8]) -> bool {
        self.exclude_patterns
            .iter()
            .any(|pat| pattern::matches_path(pat.as_bytes(), path))
    }
}
