//! Transcript Types - Documents and the search surface
//!
//! Core data model for the retrieval pipeline:
//! - Documents (one per transcribed video, immutable once indexed)
//! - Search requests and the structured response contract
//! - Ranked results with normalized scores and source tags

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// DOCUMENTS
// ============================================================================

/// A transcribed spoken-word document
///
/// Immutable once handed to an index; the index that stored it owns it.
/// Tokens are derived at construction so both widening transforms and
/// analysis agents see the same term stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    /// Stable document identifier (e.g. a video id)
    pub id: String,
    /// Channel the transcript belongs to
    pub channel: String,
    /// Publication timestamp of the source video
    pub published_at: DateTime<Utc>,
    /// Full transcript text
    pub body: String,
    /// Lowercased alphanumeric terms derived from the body
    pub tokens: Vec<String>,
}

impl Document {
    /// Build a document, deriving its token stream from the body
    pub fn new(
        id: impl Into<String>,
        channel: impl Into<String>,
        published_at: DateTime<Utc>,
        body: impl Into<String>,
    ) -> Self {
        let body = body.into();
        let tokens = tokenize(&body);
        Self {
            id: id.into(),
            channel: channel.into(),
            published_at,
            body,
            tokens,
        }
    }
}

/// Split text into lowercased alphanumeric terms
///
/// The single tokenization used everywhere: ingest, stemming transforms,
/// and term-frequency analysis all agree on term boundaries.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

// ============================================================================
// SEARCH REQUEST
// ============================================================================

/// Default minimum result count before the widener engages
pub const DEFAULT_MIN_RESULTS: usize = 5;

/// Default result limit when the caller does not set one
pub const DEFAULT_LIMIT: usize = 20;

/// A single search call's parameters
///
/// Created per call and never persisted. Request-scoped state
/// (widening progress, explanations) hangs off this, never off
/// the orchestrator itself.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    /// Raw query string as the caller typed it
    pub query: String,
    /// Restrict results to these channels (None = all channels)
    pub channels: Option<HashSet<String>>,
    /// Maximum number of results to return after merging
    pub limit: usize,
    /// Minimum result count before widening / fallback engages
    pub min_results: usize,
    /// Whether the query optimizer runs before retrieval
    pub optimize: bool,
}

impl SearchRequest {
    /// New request with defaults: no channel filter, optimization on
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            channels: None,
            limit: DEFAULT_LIMIT,
            min_results: DEFAULT_MIN_RESULTS,
            optimize: true,
        }
    }

    /// Restrict to a channel set
    pub fn with_channels(mut self, channels: HashSet<String>) -> Self {
        self.channels = Some(channels);
        self
    }

    /// Cap the merged result list
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Override the widening threshold
    pub fn with_min_results(mut self, min_results: usize) -> Self {
        self.min_results = min_results;
        self
    }

    /// Skip the optimizer and search the raw query
    pub fn without_optimization(mut self) -> Self {
        self.optimize = false;
        self
    }
}

// ============================================================================
// RANKED RESULTS
// ============================================================================

/// Which backend produced a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultSource {
    /// Keyword / full-text index
    Primary,
    /// Semantic / graph fallback index
    Secondary,
}

impl ResultSource {
    /// String tag used in the response surface
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultSource::Primary => "primary",
            ResultSource::Secondary => "secondary",
        }
    }
}

impl std::fmt::Display for ResultSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One merged, scored search hit
///
/// Scores are normalized to [0, 1] per source before merging, so results
/// from different backends compare on the same scale. A merged list never
/// contains the same document id twice.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedResult {
    /// Document identifier
    pub document_id: String,
    /// Channel of the document
    pub channel: String,
    /// Publication timestamp (recency tiebreak)
    pub published_at: DateTime<Utc>,
    /// Normalized score in [0, 1]
    pub score: f32,
    /// Which index produced this hit
    pub source: ResultSource,
    /// Zero-based position in the merged list
    pub rank: usize,
}

// ============================================================================
// SEARCH RESPONSE
// ============================================================================

/// Structured result of one orchestrated search
///
/// The stable contract consumed by any presentation layer. Always returned,
/// even when both backends are down - in that case `results` is empty and
/// `explanation` says why.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    /// Raw query as submitted
    pub query: String,
    /// Optimizer output, when optimization ran and changed the query
    pub optimized_query: Option<String>,
    /// Human-readable optimizer reasoning (empty when optimization was skipped)
    pub reasoning: String,
    /// Merged, deduplicated, normalized results
    pub results: Vec<RankedResult>,
    /// Number of results after merging, before the limit cut
    pub total_found: usize,
    /// What the pipeline tried, step by step
    pub explanation: Vec<String>,
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_lowercases_and_splits() {
        let tokens = tokenize("Volcano Engine: Reinforcement-Learning (VERL)!");
        assert_eq!(
            tokens,
            vec!["volcano", "engine", "reinforcement", "learning", "verl"]
        );
    }

    #[test]
    fn tokenize_empty_input() {
        assert!(tokenize("").is_empty());
        assert!(tokenize("  ...  ").is_empty());
    }

    #[test]
    fn document_derives_tokens() {
        let doc = Document::new("vid-1", "rust-talks", Utc::now(), "Hello World");
        assert_eq!(doc.tokens, vec!["hello", "world"]);
    }

    #[test]
    fn request_builder_defaults() {
        let req = SearchRequest::new("verl");
        assert_eq!(req.limit, DEFAULT_LIMIT);
        assert_eq!(req.min_results, DEFAULT_MIN_RESULTS);
        assert!(req.optimize);
        assert!(req.channels.is_none());
    }

    #[test]
    fn result_source_tags() {
        assert_eq!(ResultSource::Primary.as_str(), "primary");
        assert_eq!(ResultSource::Secondary.as_str(), "secondary");
    }
}
