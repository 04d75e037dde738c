//! # Verbatim Core
//!
//! Search engine for spoken-word transcripts. Transcripts are noisy - filler
//! words, jargon, inconsistent phrasing - so exact matching alone misses too
//! much. Verbatim layers three recovery mechanisms over a keyword index:
//!
//! - **Query optimization**: rule-based acronym expansion and filler stripping,
//!   with an optional generative backend behind a strict time budget
//! - **Progressive widening**: Exact -> Synonym -> Stemming -> Fuzzy -> Semantic
//!   query rewrites, stopping at the first level that yields enough results
//! - **Secondary fallback**: an embedding index queried concurrently with
//!   widening, merged in only when widening falls short
//!
//! A durable task layer runs background agents (fetch, optimize, analyze) over
//! the same SQLite database, with cooperative cancellation, retries, and
//! exactly-once message delivery between agents.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use verbatim_core::{KeywordIndex, SearchOrchestrator, SearchRequest};
//!
//! let primary = Arc::new(KeywordIndex::new(None)?);
//! let secondary = Arc::new(SemanticIndex::new(None, embedder)?);
//! let orchestrator = SearchOrchestrator::new(primary, secondary);
//!
//! let response = orchestrator
//!     .search(&SearchRequest::new("how does verl work").with_limit(10))
//!     .await;
//! for hit in &response.results {
//!     println!("{} {:.3} {}", hit.rank, hit.score, hit.document_id);
//! }
//! ```
//!
//! Every search returns a response, never an error: degraded backends shrink
//! the result set and show up in the response's `explanation` trail.

#![warn(rustdoc::missing_crate_level_docs)]

// ============================================================================
// MODULES
// ============================================================================

pub mod index;
pub mod search;
pub mod storage;
pub mod tasks;
pub mod transcript;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

// Transcript types
pub use transcript::{
    tokenize, Document, RankedResult, ResultSource, SearchRequest, SearchResponse,
    DEFAULT_LIMIT, DEFAULT_MIN_RESULTS,
};

// Index layer
pub use index::{
    cosine_similarity, Embedder, IndexError, IndexHit, KeywordIndex, KeywordIndexStats,
    PrimaryIndex, SecondaryIndex, SemanticIndex,
};

// Search pipeline
pub use search::{
    GenerativeBackend, Optimization, OptimizeError, QueryOptimizer, SearchOrchestrator,
    SearchWidener, WideningLevel, WideningState,
};

// Task layer
pub use tasks::{
    Agent, AgentContext, AgentError, AgentRuntime, AgentType, AnalyzeAgent, FetchAgent,
    Message, OptimizeAgent, StoreError, Task, TaskStats, TaskStatus, TaskStore,
    TranscriptSource,
};

// Storage
pub use storage::StorageError;

// ============================================================================
// VERSION INFO
// ============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// PRELUDE
// ============================================================================

/// Convenient imports for common usage
pub mod prelude {
    pub use crate::{
        AgentRuntime, AgentType, Document, KeywordIndex, QueryOptimizer, SearchOrchestrator,
        SearchRequest, SearchResponse, SearchWidener, SemanticIndex, TaskStatus, TaskStore,
    };
}
