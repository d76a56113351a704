//! Version information for boxpool.

/// Boxpool version from Cargo.toml
pub const BOXPOOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version information reported by the health endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    pub boxpool: &'static str,
    /// Linked SQLite library version.
    pub sqlite: &'static str,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            boxpool: BOXPOOL_VERSION,
            sqlite: rusqlite::version(),
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }
}
