//! Search Orchestrator - one ranked answer from many backends
//!
//! Composes the optimizer, the primary (keyword) index, the widener, and
//! the secondary (semantic) index into a single pipeline:
//!
//! 1. Optimize the raw query (when enabled; fails open)
//! 2. Query the primary index with the working query
//! 3. Below threshold? Drive the widener against the primary index
//! 4. Still below threshold? Query the secondary index
//! 5. Normalize per source, deduplicate, re-rank, truncate
//!
//! Widening always runs before secondary fallback. Steps 3 and 4 run
//! concurrently once the exact pass falls short - the secondary answer is
//! simply discarded when widening alone satisfies the threshold.
//!
//! Failure policy: an unavailable primary skips straight to the secondary;
//! both unavailable yields a well-formed empty response with an error
//! explanation. `search()` never returns an error to its caller.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use tracing::{debug, info, warn};

use crate::index::{IndexError, IndexHit, PrimaryIndex, SecondaryIndex};
use crate::transcript::{RankedResult, ResultSource, SearchRequest, SearchResponse};

use super::optimizer::QueryOptimizer;
use super::ranking::{merge_ranked, normalize_hits, sort_hits};
use super::widener::SearchWidener;

/// Default per-call timeout for each index backend
pub const DEFAULT_INDEX_TIMEOUT: Duration = Duration::from_secs(5);

/// Default response cache capacity
const CACHE_CAPACITY: usize = 64;

// ============================================================================
// ORCHESTRATOR
// ============================================================================

/// Multi-stage retrieval pipeline over two pluggable backends
pub struct SearchOrchestrator {
    primary: Arc<dyn PrimaryIndex>,
    secondary: Arc<dyn SecondaryIndex>,
    optimizer: Arc<QueryOptimizer>,
    widener: SearchWidener,
    index_timeout: Duration,
    cache: Mutex<LruCache<String, SearchResponse>>,
}

impl SearchOrchestrator {
    /// Orchestrator with a default optimizer and widener
    pub fn new(primary: Arc<dyn PrimaryIndex>, secondary: Arc<dyn SecondaryIndex>) -> Self {
        Self {
            primary,
            secondary,
            optimizer: Arc::new(QueryOptimizer::new()),
            widener: SearchWidener::new(),
            index_timeout: DEFAULT_INDEX_TIMEOUT,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(CACHE_CAPACITY).expect("capacity is non-zero"),
            )),
        }
    }

    /// Swap in a configured optimizer
    pub fn with_optimizer(mut self, optimizer: Arc<QueryOptimizer>) -> Self {
        self.optimizer = optimizer;
        self
    }

    /// Swap in a configured widener
    pub fn with_widener(mut self, widener: SearchWidener) -> Self {
        self.widener = widener;
        self
    }

    /// Override the per-call index timeout
    pub fn with_index_timeout(mut self, timeout: Duration) -> Self {
        self.index_timeout = timeout;
        self
    }

    /// Drop every cached response
    ///
    /// Called when agents announce corpus changes; stale ranked lists must
    /// not outlive the documents they rank.
    pub fn invalidate_cache(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
    }

    /// React to an inter-agent message
    ///
    /// Only `documents_available` notifications matter here; anything else
    /// is ignored. Safe to call with redelivered messages - invalidation
    /// is idempotent.
    pub fn handle_message(&self, content: &serde_json::Value) {
        if content.get("type").and_then(|t| t.as_str()) == Some("documents_available") {
            debug!("New documents announced, invalidating response cache");
            self.invalidate_cache();
        }
    }

    /// Run the full pipeline for one request
    ///
    /// Always returns a structured response; every failure mode is folded
    /// into the explanation trail instead of an error.
    pub async fn search(&self, request: &SearchRequest) -> SearchResponse {
        let cache_key = Self::cache_key(request);
        if let Ok(mut cache) = self.cache.lock() {
            if let Some(hit) = cache.get(&cache_key) {
                debug!(query = %request.query, "response cache hit");
                return hit.clone();
            }
        }

        let mut explanation: Vec<String> = Vec::new();

        // Step 1: optimization (fails open, never fatal)
        let (working_query, optimized_query, reasoning) = if request.optimize {
            let opt = self.optimizer.optimize(&request.query).await;
            if opt.optimized != request.query {
                explanation.push(format!("Query optimized to '{}'", opt.optimized));
                (opt.optimized.clone(), Some(opt.optimized), opt.reasoning)
            } else {
                (request.query.clone(), None, opt.reasoning)
            }
        } else {
            (request.query.clone(), None, String::new())
        };

        // Step 2: primary index with the working query
        let fetch_limit = request.limit.max(request.min_results);
        let primary_outcome = self
            .query_primary(&working_query, request, fetch_limit)
            .await;

        let (primary_hits, primary_available) = match primary_outcome {
            Ok(mut hits) => {
                sort_hits(&mut hits);
                if hits.len() >= request.min_results {
                    explanation.push(format!("Primary index: {} results", hits.len()));
                    let results = normalize_hits(&hits, ResultSource::Primary);
                    return self.finish(request, &cache_key, optimized_query, reasoning, results, Vec::new(), explanation);
                }
                explanation.push(format!(
                    "Primary index: {} results, below threshold of {}",
                    hits.len(),
                    request.min_results
                ));
                (hits, true)
            }
            Err(e) => {
                warn!(query = %working_query, "Primary index unavailable: {}", e);
                explanation.push(format!("Primary index unavailable ({}), skipped to secondary", e));
                (Vec::new(), false)
            }
        };

        // Steps 3 + 4: widen against the primary while the secondary runs.
        // The secondary answer is only consulted if widening falls short.
        // Each widening level queries through the same per-call timeout as
        // the direct passes, so a hung primary degrades instead of stalling.
        let (widened, secondary_outcome) = if primary_available {
            let timed = TimedPrimary {
                inner: Arc::clone(&self.primary),
                timeout: self.index_timeout,
            };
            let (w, s) = tokio::join!(
                self.widener.widen(request, &working_query, &timed),
                self.query_secondary(&working_query, request, fetch_limit)
            );
            (Some(w), s)
        } else {
            let s = self.query_secondary(&working_query, request, fetch_limit).await;
            (None, s)
        };

        let (mut final_primary, widening_done) = match widened {
            Some(Ok((hits, state))) => {
                explanation.extend(state.trail.iter().map(|t| format!("Widening - {}", t)));
                let met = hits.len() >= request.min_results;
                (hits, met)
            }
            Some(Err(e)) => {
                warn!("Primary index failed during widening: {}", e);
                explanation.push(format!("Primary index failed during widening ({})", e));
                (primary_hits, false)
            }
            None => (Vec::new(), false),
        };

        // Post-hoc channel guard for backends without native filtering
        if let Some(channels) = &request.channels {
            final_primary.retain(|h| channels.contains(&h.channel));
        }

        if widening_done {
            let results = normalize_hits(&final_primary, ResultSource::Primary);
            return self.finish(request, &cache_key, optimized_query, reasoning, results, Vec::new(), explanation);
        }

        // Step 4 resolution: fold in the secondary answer
        let secondary_hits = match secondary_outcome {
            Ok(mut hits) => {
                if let Some(channels) = &request.channels {
                    hits.retain(|h| channels.contains(&h.channel));
                }
                explanation.push(format!("Secondary index: {} results", hits.len()));
                hits
            }
            Err(e) => {
                warn!(query = %working_query, "Secondary index unavailable: {}", e);
                if primary_available {
                    explanation.push(format!("Secondary index unavailable ({})", e));
                } else {
                    explanation.push(format!(
                        "Error: both indexes unavailable, no results (secondary: {})",
                        e
                    ));
                }
                Vec::new()
            }
        };

        let primary_results = normalize_hits(&final_primary, ResultSource::Primary);
        let secondary_results = normalize_hits(&secondary_hits, ResultSource::Secondary);
        self.finish(request, &cache_key, optimized_query, reasoning, primary_results, secondary_results, explanation)
    }

    async fn query_primary(
        &self,
        query: &str,
        request: &SearchRequest,
        limit: usize,
    ) -> Result<Vec<IndexHit>, IndexError> {
        match tokio::time::timeout(
            self.index_timeout,
            self.primary.query(query, request.channels.as_ref(), limit),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(IndexError::Unavailable(format!(
                "primary query timed out after {:?}",
                self.index_timeout
            ))),
        }
    }

    async fn query_secondary(
        &self,
        query: &str,
        request: &SearchRequest,
        limit: usize,
    ) -> Result<Vec<IndexHit>, IndexError> {
        match tokio::time::timeout(
            self.index_timeout,
            self.secondary.query(query, request.channels.as_ref(), limit),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(IndexError::Unavailable(format!(
                "secondary query timed out after {:?}",
                self.index_timeout
            ))),
        }
    }

    /// Step 5: merge, rank, truncate, cache, return
    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        request: &SearchRequest,
        cache_key: &str,
        optimized_query: Option<String>,
        reasoning: String,
        primary: Vec<RankedResult>,
        secondary: Vec<RankedResult>,
        mut explanation: Vec<String>,
    ) -> SearchResponse {
        let (results, total_found) = merge_ranked(primary, secondary, request.limit);
        if results.is_empty() && !explanation.iter().any(|e| e.starts_with("Error:")) {
            explanation.push("No matching documents found".to_string());
        }
        info!(
            query = %request.query,
            total_found,
            returned = results.len(),
            "search complete"
        );

        // A response shaped by backend outages must not outlive the outage
        let degraded = explanation
            .iter()
            .any(|e| e.contains("unavailable") || e.contains("failed during widening"));
        let response = SearchResponse {
            query: request.query.clone(),
            optimized_query,
            reasoning,
            results,
            total_found,
            explanation,
        };
        if !degraded {
            if let Ok(mut cache) = self.cache.lock() {
                cache.put(cache_key.to_string(), response.clone());
            }
        }
        response
    }

    fn cache_key(request: &SearchRequest) -> String {
        let mut channels: Vec<&String> = request
            .channels
            .iter()
            .flat_map(|set| set.iter())
            .collect();
        channels.sort();
        format!(
            "{}|{:?}|{}|{}|{}",
            request.query, channels, request.limit, request.min_results, request.optimize
        )
    }
}

/// Per-call timeout shim over a primary backend
///
/// The widener drives its level queries through this so a hung primary
/// surfaces as `IndexError::Unavailable`, just like the direct passes.
struct TimedPrimary {
    inner: Arc<dyn PrimaryIndex>,
    timeout: Duration,
}

#[async_trait]
impl PrimaryIndex for TimedPrimary {
    async fn query(
        &self,
        text: &str,
        channels: Option<&HashSet<String>>,
        limit: usize,
    ) -> Result<Vec<IndexHit>, IndexError> {
        match tokio::time::timeout(self.timeout, self.inner.query(text, channels, limit)).await {
            Ok(result) => result,
            Err(_) => Err(IndexError::Unavailable(format!(
                "primary query timed out after {:?}",
                self.timeout
            ))),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
