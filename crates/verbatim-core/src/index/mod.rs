//! Index Module
//!
//! Pluggable retrieval backends behind two trait seams:
//! - [`PrimaryIndex`]: keyword / full-text retrieval (FTS5 implementation here)
//! - [`SecondaryIndex`]: semantic fallback (embedding-scan implementation here)
//!
//! Backends return an empty list for "no matches"; an `Err` means the
//! backend itself is unavailable and the orchestrator should move down
//! its fallback chain.

mod keyword;
mod semantic;

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use keyword::{sanitize_fts5_query, KeywordIndex, KeywordIndexStats};
pub use semantic::{cosine_similarity, Embedder, SemanticIndex};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Index error type
///
/// Any variant is treated as "this backend is unavailable" by the
/// orchestrator; the distinction only matters for the explanation text.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// The backend cannot serve queries right now
    #[error("Index unavailable: {0}")]
    Unavailable(String),
    /// The backend rejected or failed this particular query
    #[error("Index backend error: {0}")]
    Backend(String),
}

impl From<rusqlite::Error> for IndexError {
    fn from(e: rusqlite::Error) -> Self {
        IndexError::Backend(e.to_string())
    }
}

/// Index result type
pub type Result<T> = std::result::Result<T, IndexError>;

// ============================================================================
// HITS
// ============================================================================

/// One raw hit from a backend, scored on that backend's own scale
///
/// Scores are not comparable across backends until the ranking layer
/// normalizes them per source.
#[derive(Debug, Clone)]
pub struct IndexHit {
    /// Document identifier
    pub document_id: String,
    /// Channel of the document
    pub channel: String,
    /// Publication timestamp
    pub published_at: DateTime<Utc>,
    /// Backend-scale relevance score (higher is better)
    pub score: f32,
}

// ============================================================================
// BACKEND TRAITS
// ============================================================================

/// Keyword / full-text retrieval backend
#[async_trait]
pub trait PrimaryIndex: Send + Sync {
    /// Ranked documents for a query string, optionally channel-filtered
    ///
    /// Must return an empty list (not an error) when nothing matches.
    async fn query(
        &self,
        text: &str,
        channels: Option<&HashSet<String>>,
        limit: usize,
    ) -> Result<Vec<IndexHit>>;
}

/// Semantic / graph retrieval backend, the fallback chain's second stop
#[async_trait]
pub trait SecondaryIndex: Send + Sync {
    /// Ranked documents for a query string, optionally channel-filtered
    async fn query(
        &self,
        text: &str,
        channels: Option<&HashSet<String>>,
        limit: usize,
    ) -> Result<Vec<IndexHit>>;

    /// Same contract, but skipping the embedding step for callers that
    /// already hold a vector
    async fn query_embedding(
        &self,
        embedding: &[f32],
        channels: Option<&HashSet<String>>,
        limit: usize,
    ) -> Result<Vec<IndexHit>>;
}
