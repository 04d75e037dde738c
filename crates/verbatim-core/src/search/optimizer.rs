//! Query Optimizer - bounded-time query rewriting
//!
//! Expands a raw query into a richer one plus human-readable reasoning.
//! Deterministic rules (acronym table, filler-word stripping) run first
//! and take precedence; an optional generative backend handles queries the
//! rules leave untouched, under a hard time budget.
//!
//! Optimization fails open: on timeout or backend failure the original
//! query comes back unchanged with empty reasoning. A search request never
//! fails because its optimizer did.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use lru::LruCache;
use rusqlite::Connection;
use tracing::{debug, warn};

use crate::storage;
use crate::transcript::tokenize;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Optimizer-internal error type
///
/// Never escapes [`QueryOptimizer::optimize`]; backends return it, the
/// optimizer recovers from it.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum OptimizeError {
    /// The generative call exceeded the time budget
    #[error("Generative rewrite timed out")]
    Timeout,
    /// The generative backend failed
    #[error("Generative backend error: {0}")]
    Backend(String),
}

// ============================================================================
// GENERATIVE SEAM
// ============================================================================

/// Generative rewrite backend
///
/// External collaborator; anything that can turn a prompt into text.
/// The optimizer enforces the time budget, the backend just has to be
/// cancel-safe at its await points.
#[async_trait]
pub trait GenerativeBackend: Send + Sync {
    /// Produce a rewritten query for the given prompt
    async fn generate(&self, prompt: &str) -> Result<String, OptimizeError>;
}

// ============================================================================
// OPTIMIZER
// ============================================================================

/// Result of one optimization pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Optimization {
    /// The query retrieval should actually run
    pub optimized: String,
    /// Why the query changed (empty when it did not)
    pub reasoning: String,
}

/// Default time budget for the generative call
pub const DEFAULT_BUDGET: Duration = Duration::from_secs(2);

/// Acronym expansions applied by the deterministic layer
const ACRONYMS: &[(&str, &str)] = &[
    ("verl", "volcano engine reinforcement learning"),
    ("rlhf", "reinforcement learning from human feedback"),
    ("llm", "large language model"),
    ("gpu", "graphics processing unit"),
    ("k8s", "kubernetes"),
    ("wasm", "webassembly"),
    ("mcp", "model context protocol"),
];

/// Question scaffolding stripped from longer queries
const FILLER_WORDS: &[&str] = &[
    "how", "what", "why", "when", "where", "who", "is", "are", "was", "the",
    "a", "an", "do", "does", "did", "i", "to", "of", "in", "on", "about",
];

/// Query rewriter with deterministic rules and an optional generative layer
pub struct QueryOptimizer {
    acronyms: HashMap<String, String>,
    backend: Option<Arc<dyn GenerativeBackend>>,
    budget: Duration,
    /// Append-only (original, optimized) log; all failures swallowed
    context: Option<Mutex<Connection>>,
    /// Memoized recent optimizations; also what makes repeat calls cheap
    memo: Mutex<LruCache<String, Optimization>>,
}

impl Default for QueryOptimizer {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryOptimizer {
    /// Optimizer with deterministic rules only, no persistence
    pub fn new() -> Self {
        Self {
            acronyms: ACRONYMS
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            backend: None,
            budget: DEFAULT_BUDGET,
            context: None,
            memo: Mutex::new(LruCache::new(
                NonZeroUsize::new(128).expect("128 is non-zero"),
            )),
        }
    }

    /// Attach a generative rewrite backend
    pub fn with_backend(mut self, backend: Arc<dyn GenerativeBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Override the generative time budget
    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = budget;
        self
    }

    /// Persist (original, optimized) pairs to the context log at this path
    pub fn with_context_db(mut self, db_path: Option<PathBuf>) -> storage::Result<Self> {
        let conn = storage::open(db_path)?;
        self.context = Some(Mutex::new(conn));
        Ok(self)
    }

    /// Rewrite a query, always returning within the time budget
    pub async fn optimize(&self, query: &str) -> Optimization {
        if let Ok(mut memo) = self.memo.lock() {
            if let Some(hit) = memo.get(query) {
                return hit.clone();
            }
        }

        let result = self.optimize_uncached(query).await;

        if result.optimized != query {
            self.record_context(query, &result.optimized);
        }
        if let Ok(mut memo) = self.memo.lock() {
            memo.put(query.to_string(), result.clone());
        }
        result
    }

    async fn optimize_uncached(&self, query: &str) -> Optimization {
        // Deterministic layer first; it wins when it produces anything
        if let Some(rewritten) = self.apply_rules(query) {
            return rewritten;
        }

        // Generative layer under a hard budget, failing open
        if let Some(backend) = &self.backend {
            let prompt = format!(
                "Rewrite this transcript-search query to maximize keyword recall. \
                 Reply with the rewritten query only.\n\nQuery: {query}"
            );
            match tokio::time::timeout(self.budget, backend.generate(&prompt)).await {
                Ok(Ok(text)) => {
                    let optimized = text.trim().to_string();
                    if !optimized.is_empty() && optimized != query {
                        return Optimization {
                            optimized,
                            reasoning: "Generative rewrite for broader keyword recall".to_string(),
                        };
                    }
                }
                Ok(Err(e)) => {
                    debug!("Generative rewrite failed, keeping original query: {}", e);
                }
                Err(_) => {
                    debug!("Generative rewrite timed out, keeping original query");
                }
            }
        }

        Optimization {
            optimized: query.to_string(),
            reasoning: String::new(),
        }
    }

    /// Deterministic rules: acronym expansion, then filler stripping
    fn apply_rules(&self, query: &str) -> Option<Optimization> {
        let tokens = tokenize(query);
        if tokens.is_empty() {
            return None;
        }

        // Acronym expansion adds an OR-alternative per known acronym
        let expansions: Vec<(&String, &String)> = tokens
            .iter()
            .filter_map(|t| self.acronyms.get_key_value(t.as_str()))
            .collect();
        if !expansions.is_empty() {
            let mut groups = vec![tokens.join(" ")];
            let mut reasons = Vec::new();
            for (acronym, expansion) in expansions {
                let replaced: Vec<String> = tokens
                    .iter()
                    .flat_map(|t| {
                        if t == acronym {
                            tokenize(expansion)
                        } else {
                            vec![t.clone()]
                        }
                    })
                    .collect();
                groups.push(replaced.join(" "));
                reasons.push(format!("Expanded acronym '{}' to '{}'", acronym, expansion));
            }
            return Some(Optimization {
                optimized: groups.join(" OR "),
                reasoning: reasons.join("; "),
            });
        }

        // Question scaffolding hurts AND-semantics keyword search
        if tokens.len() >= 3 {
            let content: Vec<String> = tokens
                .iter()
                .filter(|t| !FILLER_WORDS.contains(&t.as_str()))
                .cloned()
                .collect();
            if !content.is_empty() && content.len() < tokens.len() {
                let stripped: Vec<String> = tokens
                    .iter()
                    .filter(|t| FILLER_WORDS.contains(&t.as_str()))
                    .cloned()
                    .collect();
                return Some(Optimization {
                    optimized: content.join(" "),
                    reasoning: format!("Removed filler words: {}", stripped.join(", ")),
                });
            }
        }

        None
    }

    /// Best-effort append to the context log
    fn record_context(&self, original: &str, optimized: &str) {
        let Some(context) = &self.context else {
            return;
        };
        let Ok(conn) = context.lock() else {
            warn!("Optimizer context lock poisoned, skipping record");
            return;
        };
        let outcome = conn.execute(
            "INSERT INTO optimizer_context (original, optimized, created_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![original, optimized, Utc::now().to_rfc3339()],
        );
        if let Err(e) = outcome {
            warn!("Failed to record optimizer context: {}", e);
        }
    }

    /// Prior optimizations recorded for a query, newest first
    ///
    /// Read side of the context log; empty when no store is attached.
    pub fn context_for(&self, original: &str, limit: usize) -> Vec<String> {
        let Some(context) = &self.context else {
            return Vec::new();
        };
        let Ok(conn) = context.lock() else {
            return Vec::new();
        };
        let mut out = Vec::new();
        let query = conn.prepare(
            "SELECT optimized FROM optimizer_context
             WHERE original = ?1 ORDER BY id DESC LIMIT ?2",
        );
        if let Ok(mut stmt) = query {
            if let Ok(rows) = stmt.query_map(rusqlite::params![original, limit as i64], |row| {
                row.get::<_, String>(0)
            }) {
                for row in rows.flatten() {
                    out.push(row);
                }
            }
        }
        out
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoBackend(String);

    #[async_trait]
    impl GenerativeBackend for EchoBackend {
        async fn generate(&self, _prompt: &str) -> Result<String, OptimizeError> {
            Ok(self.0.clone())
        }
    }

    struct SlowBackend;

    #[async_trait]
    impl GenerativeBackend for SlowBackend {
        async fn generate(&self, _prompt: &str) -> Result<String, OptimizeError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok("never".to_string())
        }
    }

    struct FailingBackend;

    #[async_trait]
    impl GenerativeBackend for FailingBackend {
        async fn generate(&self, _prompt: &str) -> Result<String, OptimizeError> {
            Err(OptimizeError::Backend("model unavailable".to_string()))
        }
    }

    #[tokio::test]
    async fn acronym_expansion_takes_precedence() {
        let optimizer =
            QueryOptimizer::new().with_backend(Arc::new(EchoBackend("generative".to_string())));
        let result = optimizer.optimize("verl training").await;
        assert_eq!(
            result.optimized,
            "verl training OR volcano engine reinforcement learning training"
        );
        assert!(result.reasoning.contains("verl"));
    }

    #[tokio::test]
    async fn filler_words_stripped_from_questions() {
        let optimizer = QueryOptimizer::new();
        let result = optimizer.optimize("how do rust lifetimes work").await;
        assert_eq!(result.optimized, "rust lifetimes work");
        assert!(result.reasoning.contains("filler"));
    }

    #[tokio::test]
    async fn generative_rewrite_when_rules_pass() {
        let optimizer =
            QueryOptimizer::new().with_backend(Arc::new(EchoBackend("borrow checker".to_string())));
        let result = optimizer.optimize("borrowck").await;
        assert_eq!(result.optimized, "borrow checker");
        assert!(!result.reasoning.is_empty());
    }

    #[tokio::test]
    async fn timeout_fails_open() {
        let optimizer = QueryOptimizer::new()
            .with_backend(Arc::new(SlowBackend))
            .with_budget(Duration::from_millis(20));
        let result = optimizer.optimize("arcane query").await;
        assert_eq!(result.optimized, "arcane query");
        assert!(result.reasoning.is_empty());
    }

    #[tokio::test]
    async fn backend_failure_fails_open() {
        let optimizer = QueryOptimizer::new().with_backend(Arc::new(FailingBackend));
        let result = optimizer.optimize("arcane query").await;
        assert_eq!(result.optimized, "arcane query");
        assert!(result.reasoning.is_empty());
    }

    #[tokio::test]
    async fn optimize_is_idempotent() {
        let optimizer = QueryOptimizer::new();
        let first = optimizer.optimize("verl rollout").await;
        let second = optimizer.optimize("verl rollout").await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn context_log_records_rewrites() {
        let dir = tempfile::tempdir().unwrap();
        let optimizer = QueryOptimizer::new()
            .with_context_db(Some(dir.path().join("ctx.db")))
            .unwrap();

        optimizer.optimize("verl").await;
        let history = optimizer.context_for("verl", 10);
        assert_eq!(history.len(), 1);
        assert!(history[0].contains("volcano"));

        // Unchanged queries are not recorded
        optimizer.optimize("sourdough").await;
        assert!(optimizer.context_for("sourdough", 10).is_empty());
    }
}
