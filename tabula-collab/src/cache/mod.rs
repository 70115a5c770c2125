//! Cache contract backing page/stroke persistence.
//!
//! The session core treats the cache as an external key-value +
//! sorted-set service. Per session `sid` and page `pid`:
//!
//! ```text
//! {sid}:rank        sorted set   page ids ordered by sparse integer score
//! {sid}:{pid}       hash         stroke id → camelCase stroke JSON
//! {sid}:{pid}:meta  string       page meta JSON
//! ```
//!
//! [`PageCache`] is the complete command contract. Two implementations:
//! [`RedisCache`](redis::RedisCache) for production and
//! [`MemoryCache`](memory::MemoryCache), an in-process double with
//! faithful sorted-set semantics used throughout the test suites.

pub mod memory;
pub mod redis;

use async_trait::async_trait;

use tabula_core::{PageMeta, Stroke};

pub use self::memory::MemoryCache;
pub use self::redis::RedisCache;

pub(crate) fn rank_key(session_id: &str) -> String {
    format!("{session_id}:rank")
}

pub(crate) fn strokes_key(session_id: &str, page_id: &str) -> String {
    format!("{session_id}:{page_id}")
}

pub(crate) fn meta_key(session_id: &str, page_id: &str) -> String {
    format!("{session_id}:{page_id}:meta")
}

/// Cache command contract consumed by the broadcaster's write-back loop
/// and the page operations.
#[async_trait]
pub trait PageCache: Send + Sync {
    /// Upsert non-deleted strokes keyed by (page, stroke id); strokes
    /// marked deleted are removed instead. Removing an absent stroke is
    /// not an error.
    async fn update_strokes(&self, session_id: &str, strokes: &[Stroke])
        -> Result<(), CacheError>;

    /// Raw serialized strokes of a page; empty for an unknown page.
    async fn get_page_strokes(
        &self,
        session_id: &str,
        page_id: &str,
    ) -> Result<Vec<Vec<u8>>, CacheError>;

    /// Ordered page ids; empty for a fresh session.
    async fn get_page_rank(&self, session_id: &str) -> Result<Vec<String>, CacheError>;

    async fn get_page_meta(&self, session_id: &str, page_id: &str)
        -> Result<PageMeta, CacheError>;

    async fn set_page_meta(
        &self,
        session_id: &str,
        page_id: &str,
        meta: &PageMeta,
    ) -> Result<(), CacheError>;

    /// Insert a page at `index` (negative or past-end appends), shifting
    /// the scores of later pages to open a gap. Insertion is conditional
    /// on absence: an already-ranked page keeps its position.
    async fn add_page(
        &self,
        session_id: &str,
        page_id: &str,
        index: i64,
        meta: &PageMeta,
    ) -> Result<(), CacheError>;

    /// Remove a page's strokes, meta, and rank entry.
    async fn delete_page(&self, session_id: &str, page_id: &str) -> Result<(), CacheError>;

    /// Remove only a page's strokes; meta and rank position survive.
    async fn clear_page(&self, session_id: &str, page_id: &str) -> Result<(), CacheError>;

    /// Remove every page's strokes and meta plus the rank key.
    async fn clear_session(&self, session_id: &str) -> Result<(), CacheError>;
}

/// Cache-layer failures.
#[derive(Debug, Clone)]
pub enum CacheError {
    /// Could not reach the cache service.
    Connection(String),
    /// A command failed on the cache side.
    Command(String),
    /// Stored payload could not be (de)serialized.
    Serialization(String),
    /// The requested page has no stored meta.
    PageNotFound(String),
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connection(e) => write!(f, "cache connection failed: {e}"),
            Self::Command(e) => write!(f, "cache command failed: {e}"),
            Self::Serialization(e) => write!(f, "cache serialization failed: {e}"),
            Self::PageNotFound(pid) => write!(f, "no meta stored for page {pid}"),
        }
    }
}

impl std::error::Error for CacheError {}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Serialization(e.to_string())
    }
}
