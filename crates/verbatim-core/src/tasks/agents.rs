//! Concrete Agents - fetch, optimize, analyze
//!
//! Every agent type executes real work against the index or optimizer and
//! returns a typed result payload. Checkpoints sit at the natural unit
//! boundary for each agent: per fetched batch, per optimized query, per
//! analyzed document chunk.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::index::KeywordIndex;
use crate::search::QueryOptimizer;
use crate::transcript::Document;

use super::{Agent, AgentContext, AgentError, AgentType};

/// Recipient address for corpus-change notifications
pub const ORCHESTRATOR_INBOX: &str = "orchestrator";

// ============================================================================
// FETCH
// ============================================================================

/// Transcript source collaborator
///
/// How transcripts are actually downloaded is outside this crate; the
/// fetch agent only needs batches of ready documents.
#[async_trait]
pub trait TranscriptSource: Send + Sync {
    /// Fetch up to `limit` new documents for a channel
    async fn fetch(&self, channel: &str, limit: usize) -> Result<Vec<Document>, AgentError>;
}

#[derive(Debug, Deserialize)]
struct FetchConfig {
    channel: String,
    #[serde(default = "default_fetch_limit")]
    limit: usize,
}

fn default_fetch_limit() -> usize {
    50
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FetchOutcome {
    channel: String,
    fetched: usize,
    indexed: usize,
}

/// Pulls new transcripts from a source and indexes them
///
/// Posts a `documents_available` message to the orchestrator inbox after
/// indexing, deduped per task so redelivery cannot double-invalidate.
pub struct FetchAgent {
    source: Arc<dyn TranscriptSource>,
    index: Arc<KeywordIndex>,
    max_retries: u32,
}

impl FetchAgent {
    pub fn new(source: Arc<dyn TranscriptSource>, index: Arc<KeywordIndex>) -> Self {
        Self {
            source,
            index,
            max_retries: 2,
        }
    }

    /// Override the retry budget
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

#[async_trait]
impl Agent for FetchAgent {
    fn agent_type(&self) -> AgentType {
        AgentType::Fetch
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }

    async fn execute(&self, ctx: &AgentContext) -> Result<serde_json::Value, AgentError> {
        let config: FetchConfig = serde_json::from_value(ctx.config().clone())
            .map_err(|e| AgentError::Failed(format!("invalid fetch config: {}", e)))?;

        ctx.checkpoint()?;
        let documents = self.source.fetch(&config.channel, config.limit).await?;
        let fetched = documents.len();
        ctx.progress(0.5)?;

        // Checkpoint between fetch and the (batched) index write
        ctx.checkpoint()?;
        let indexed = self
            .index
            .ingest_batch(&documents)
            .map_err(|e| AgentError::Failed(format!("ingest failed: {}", e)))?;
        ctx.progress(0.9)?;

        if indexed > 0 {
            let dedup = format!("documents-available-{}", ctx.task().id);
            ctx.send(
                ORCHESTRATOR_INBOX,
                serde_json::json!({
                    "type": "documents_available",
                    "channel": config.channel,
                    "count": indexed,
                }),
                Some(&dedup),
            )
            .await?;
        }

        info!(channel = %config.channel, fetched, indexed, "fetch task finished");
        let outcome = FetchOutcome {
            channel: config.channel,
            fetched,
            indexed,
        };
        serde_json::to_value(outcome).map_err(|e| AgentError::Failed(e.to_string()))
    }
}

// ============================================================================
// OPTIMIZE
// ============================================================================

#[derive(Debug, Deserialize)]
struct OptimizeConfig {
    queries: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OptimizedQuery {
    query: String,
    optimized: String,
    reasoning: String,
}

/// Batch-optimizes queries through the query optimizer
///
/// Useful for warming the optimizer's context log with a channel's common
/// queries ahead of interactive traffic.
pub struct OptimizeAgent {
    optimizer: Arc<QueryOptimizer>,
}

impl OptimizeAgent {
    pub fn new(optimizer: Arc<QueryOptimizer>) -> Self {
        Self { optimizer }
    }
}

#[async_trait]
impl Agent for OptimizeAgent {
    fn agent_type(&self) -> AgentType {
        AgentType::Optimize
    }

    async fn execute(&self, ctx: &AgentContext) -> Result<serde_json::Value, AgentError> {
        let config: OptimizeConfig = serde_json::from_value(ctx.config().clone())
            .map_err(|e| AgentError::Failed(format!("invalid optimize config: {}", e)))?;

        let total = config.queries.len().max(1);
        let mut optimizations = Vec::with_capacity(config.queries.len());
        for (i, query) in config.queries.iter().enumerate() {
            // Checkpoint per query: optimization batches can be long
            ctx.checkpoint()?;
            let opt = self.optimizer.optimize(query).await;
            optimizations.push(OptimizedQuery {
                query: query.clone(),
                optimized: opt.optimized,
                reasoning: opt.reasoning,
            });
            ctx.progress((i + 1) as f32 / total as f32)?;
        }

        info!(count = optimizations.len(), "optimize task finished");
        Ok(serde_json::json!({ "optimizations": optimizations }))
    }
}

// ============================================================================
// ANALYZE
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeConfig {
    /// Restrict to one channel (None = whole corpus)
    channel: Option<String>,
    #[serde(default = "default_top_terms")]
    top_terms: usize,
    #[serde(default = "default_scan_limit")]
    scan_limit: usize,
}

fn default_top_terms() -> usize {
    20
}

fn default_scan_limit() -> usize {
    1000
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeOutcome {
    documents: usize,
    channels: usize,
    top_terms: Vec<(String, usize)>,
}

/// Term-frequency and channel statistics over the indexed corpus
pub struct AnalyzeAgent {
    index: Arc<KeywordIndex>,
}

impl AnalyzeAgent {
    pub fn new(index: Arc<KeywordIndex>) -> Self {
        Self { index }
    }
}

#[async_trait]
impl Agent for AnalyzeAgent {
    fn agent_type(&self) -> AgentType {
        AgentType::Analyze
    }

    async fn execute(&self, ctx: &AgentContext) -> Result<serde_json::Value, AgentError> {
        let config: AnalyzeConfig = serde_json::from_value(ctx.config().clone())
            .map_err(|e| AgentError::Failed(format!("invalid analyze config: {}", e)))?;

        ctx.checkpoint()?;
        let documents = self
            .index
            .documents(config.channel.as_deref(), config.scan_limit)
            .map_err(|e| AgentError::Failed(format!("corpus scan failed: {}", e)))?;

        let mut term_counts: HashMap<&str, usize> = HashMap::new();
        let mut channels: HashMap<&str, usize> = HashMap::new();
        for (i, doc) in documents.iter().enumerate() {
            if i % 100 == 0 {
                ctx.checkpoint()?;
                ctx.progress(i as f32 / documents.len().max(1) as f32)?;
            }
            *channels.entry(doc.channel.as_str()).or_default() += 1;
            for token in &doc.tokens {
                *term_counts.entry(token.as_str()).or_default() += 1;
            }
        }

        let mut top: Vec<(String, usize)> = term_counts
            .into_iter()
            .map(|(term, count)| (term.to_string(), count))
            .collect();
        top.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top.truncate(config.top_terms);

        info!(documents = documents.len(), "analyze task finished");
        let outcome = AnalyzeOutcome {
            documents: documents.len(),
            channels: channels.len(),
            top_terms: top,
        };
        serde_json::to_value(outcome).map_err(|e| AgentError::Failed(e.to_string()))
    }
}

// ============================================================================
// TESTS
// ============================================================================
