//! Search Widener - progressive query relaxation
//!
//! A state machine over ordered widening levels:
//!
//! ```text
//! Exact -> Synonym -> Stemming -> Fuzzy -> Semantic
//! ```
//!
//! Each level rewrites the working query into a broader FTS expression and
//! requeries the primary index. Widening stops as soon as the configured
//! minimum result count is met, or when every level has been tried once.
//! Levels never repeat and never run out of order within one request, and
//! the whole process is deterministic for a fixed index and query.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::index::{IndexHit, PrimaryIndex, Result as IndexResult};
use crate::transcript::{tokenize, SearchRequest};

use super::ranking::sort_hits;

// ============================================================================
// WIDENING LEVELS
// ============================================================================

/// One step of progressive query relaxation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WideningLevel {
    /// The working query as-is
    Exact,
    /// Acronym / synonym alternatives OR-ed in
    Synonym,
    /// Suffix-stripped stems alongside the originals
    Stemming,
    /// Prefix-match variants for longer terms
    Fuzzy,
    /// Broadest: any-term match plus intent-template expansion
    Semantic,
}

impl WideningLevel {
    /// All levels in escalation order
    pub const ALL: [WideningLevel; 5] = [
        WideningLevel::Exact,
        WideningLevel::Synonym,
        WideningLevel::Stemming,
        WideningLevel::Fuzzy,
        WideningLevel::Semantic,
    ];

    /// The next, broader level
    pub fn next(&self) -> Option<WideningLevel> {
        match self {
            WideningLevel::Exact => Some(WideningLevel::Synonym),
            WideningLevel::Synonym => Some(WideningLevel::Stemming),
            WideningLevel::Stemming => Some(WideningLevel::Fuzzy),
            WideningLevel::Fuzzy => Some(WideningLevel::Semantic),
            WideningLevel::Semantic => None,
        }
    }

    /// Human-readable level name
    pub fn as_str(&self) -> &'static str {
        match self {
            WideningLevel::Exact => "Exact",
            WideningLevel::Synonym => "Synonym",
            WideningLevel::Stemming => "Stemming",
            WideningLevel::Fuzzy => "Fuzzy",
            WideningLevel::Semantic => "Semantic",
        }
    }
}

impl std::fmt::Display for WideningLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// WIDENING STATE
// ============================================================================

/// Request-scoped widening progress
///
/// Created at request start, mutated only by the widener, discarded after
/// the request. The applied-level sequence is strictly increasing; a level
/// is attempted at most once.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WideningState {
    /// Level the widener last attempted
    pub level: WideningLevel,
    /// Every level attempted, in order
    pub applied: Vec<WideningLevel>,
    /// One trail entry per attempted level, explaining its outcome
    pub trail: Vec<String>,
    /// Result count that stops the escalation
    pub min_results: usize,
}

impl WideningState {
    fn new(min_results: usize) -> Self {
        Self {
            level: WideningLevel::Exact,
            applied: Vec::new(),
            trail: Vec::new(),
            min_results,
        }
    }

    fn advance(&mut self, level: WideningLevel) {
        debug_assert!(self.applied.last().map(|l| *l < level).unwrap_or(true));
        self.level = level;
        self.applied.push(level);
    }
}

// ============================================================================
// WIDENER
// ============================================================================

/// Default synonym / acronym table
///
/// Keys are single lowercased tokens; values are space-separated expansions.
const DEFAULT_SYNONYMS: &[(&str, &str)] = &[
    ("verl", "volcano engine reinforcement learning"),
    ("rl", "reinforcement learning"),
    ("rlhf", "reinforcement learning from human feedback"),
    ("llm", "large language model"),
    ("ml", "machine learning"),
    ("k8s", "kubernetes"),
    ("ci", "continuous integration"),
    ("db", "database"),
    ("wasm", "webassembly"),
];

/// Minimum token length (in chars) before the Fuzzy level generates a
/// prefix variant
const FUZZY_MIN_TOKEN_LEN: usize = 5;

/// Query widener over a primary index
pub struct SearchWidener {
    synonyms: HashMap<String, String>,
}

impl Default for SearchWidener {
    fn default() -> Self {
        Self::new()
    }
}

impl SearchWidener {
    /// Widener with the built-in synonym table
    pub fn new() -> Self {
        Self {
            synonyms: DEFAULT_SYNONYMS
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    /// Widener with a caller-provided synonym table (lowercased keys)
    pub fn with_synonyms(synonyms: HashMap<String, String>) -> Self {
        Self { synonyms }
    }

    /// Drive the escalation until the threshold is met or levels run out
    ///
    /// Returns the result set of the stopping level (or the best set seen
    /// when every level was exhausted) plus the final widening state.
    pub async fn widen(
        &self,
        request: &SearchRequest,
        working_query: &str,
        index: &dyn PrimaryIndex,
    ) -> IndexResult<(Vec<IndexHit>, WideningState)> {
        let mut state = WideningState::new(request.min_results);
        let mut best: Vec<IndexHit> = Vec::new();

        for level in WideningLevel::ALL {
            state.advance(level);
            let expression = self.transform(level, working_query);
            debug!(level = level.as_str(), %expression, "widening attempt");

            let mut hits = index
                .query(&expression, request.channels.as_ref(), request.limit.max(request.min_results))
                .await?;
            sort_hits(&mut hits);

            if hits.len() >= request.min_results {
                if level == WideningLevel::Exact {
                    state.trail.push("no widening needed".to_string());
                } else {
                    state.trail.push(format!(
                        "{}: {} results, threshold of {} met",
                        level,
                        hits.len(),
                        request.min_results
                    ));
                }
                return Ok((hits, state));
            }

            state.trail.push(format!(
                "{}: {} results, below threshold of {}",
                level,
                hits.len(),
                request.min_results
            ));
            if hits.len() > best.len() {
                best = hits;
            }
        }

        debug!(best = best.len(), "widening exhausted");
        Ok((best, state))
    }

    /// Rewrite the query for one widening level
    ///
    /// Output is plain text destined for the index's own sanitizer; `OR`
    /// and a trailing `*` are the only operators the sanitizer keeps.
    pub fn transform(&self, level: WideningLevel, query: &str) -> String {
        let tokens = tokenize(query);
        if tokens.is_empty() {
            return String::new();
        }
        let base = tokens.join(" ");

        match level {
            WideningLevel::Exact => base,
            WideningLevel::Synonym => {
                // One alternative group per token that has an expansion
                let mut groups = vec![base.clone()];
                for (i, token) in tokens.iter().enumerate() {
                    if let Some(expansion) = self.synonyms.get(token.as_str()) {
                        let mut replaced = tokens.clone();
                        replaced.splice(i..=i, tokenize(expansion));
                        groups.push(replaced.join(" "));
                    }
                }
                groups.join(" OR ")
            }
            WideningLevel::Stemming => {
                let stemmed: Vec<String> = tokens.iter().map(|t| stem(t)).collect();
                if stemmed == tokens {
                    base
                } else {
                    format!("{} OR {}", base, stemmed.join(" "))
                }
            }
            WideningLevel::Fuzzy => {
                // Prefix variants absorb trailing typos and inflections
                let mut groups = vec![base.clone()];
                let fuzzed: Vec<String> = tokens
                    .iter()
                    .map(|t| match prefix_cut(t) {
                        Some(cut) => format!("{}*", &t[..cut]),
                        None => t.clone(),
                    })
                    .collect();
                if fuzzed.iter().any(|t| t.ends_with('*')) {
                    groups.push(fuzzed.join(" "));
                }
                groups.join(" OR ")
            }
            WideningLevel::Semantic => {
                // Broadest net: any single term matches, plus expansions of
                // every synonym so conceptually related transcripts surface
                let mut alternatives: Vec<String> = vec![base];
                for token in &tokens {
                    alternatives.push(token.clone());
                    if let Some(expansion) = self.synonyms.get(token.as_str()) {
                        alternatives.push(expansion.clone());
                    }
                }
                alternatives.join(" OR ")
            }
        }
    }
}

/// Byte offset that drops the last two chars of a long-enough token
///
/// Tokens may contain multi-byte chars, so the cut lands on a char
/// boundary rather than a fixed byte count from the end.
fn prefix_cut(token: &str) -> Option<usize> {
    if token.chars().count() < FUZZY_MIN_TOKEN_LEN {
        return None;
    }
    token.char_indices().rev().nth(1).map(|(i, _)| i)
}

/// Light suffix-stripping stemmer for query-side stemming
///
/// The FTS index already runs a porter tokenizer; this brings the query
/// side closer to index stems for inflections porter alone misses.
fn stem(token: &str) -> String {
    for suffix in ["ingly", "edly", "ings", "ing", "ed", "ies", "es", "s", "ly"] {
        if token.len() > suffix.len() + 2 && token.ends_with(suffix) {
            return token[..token.len() - suffix.len()].to_string();
        }
    }
    token.to_string()
}

// ============================================================================
// TESTS
// ============================================================================
