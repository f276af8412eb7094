//! On-disk cache store

mod directory;
mod lock;
mod paths;

pub use directory::{CacheDirectory, CacheError, CachedAsset};
pub use paths::CachePaths;

/// Namespace of mirrored source references inside the cache's Git store.
pub const CACHE_REFERENCE_PREFIX: &str = "refs/remotes/origin/";
