//! Search Module
//!
//! The retrieval pipeline, composed from the bottom up:
//! - Query optimization with a bounded time budget (fails open)
//! - Progressive query widening (Exact -> Synonym -> Stemming -> Fuzzy -> Semantic)
//! - Score normalization, deduplication, and deterministic ranking
//! - Orchestration with primary/secondary fallback and a response cache

mod optimizer;
mod orchestrator;
mod ranking;
mod widener;

pub use optimizer::{
    GenerativeBackend, Optimization, OptimizeError, QueryOptimizer, DEFAULT_BUDGET,
};

pub use widener::{SearchWidener, WideningLevel, WideningState};

pub use ranking::{merge_ranked, normalize_hits, sort_hits};

pub use orchestrator::{SearchOrchestrator, DEFAULT_INDEX_TIMEOUT};
