//! Semantic Index - embedding-scan secondary retrieval
//!
//! Fallback backend for queries the keyword index cannot satisfy. Embeds
//! the query through a pluggable [`Embedder`] collaborator, then scores
//! stored document vectors by cosine similarity. Vectors live in the
//! `embeddings` table as JSON-encoded f32 arrays, one row per document.
//!
//! The scan is linear over stored vectors, which is the right trade for
//! a fallback path over a transcript corpus; swap the backend behind
//! [`SecondaryIndex`](super::SecondaryIndex) when the corpus outgrows it.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::debug;

use crate::storage;
use crate::transcript::Document;

use super::{IndexError, IndexHit, Result, SecondaryIndex};

// ============================================================================
// EMBEDDER SEAM
// ============================================================================

/// Pluggable embedding backend
///
/// An external collaborator: how vectors are produced (local model, remote
/// service) is outside this crate's contract.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a text into a fixed-dimension vector
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Cosine similarity between two vectors
///
/// Returns 0.0 for mismatched dimensions or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

// ============================================================================
// SEMANTIC INDEX
// ============================================================================

/// Embedding-scan semantic index
pub struct SemanticIndex {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
    embedder: Arc<dyn Embedder>,
}

impl SemanticIndex {
    /// Open (or create) the index at the given path with an embedder
    pub fn new(db_path: Option<PathBuf>, embedder: Arc<dyn Embedder>) -> storage::Result<Self> {
        let path = match db_path {
            Some(p) => p,
            None => storage::default_db_path()?,
        };
        let writer = storage::open(Some(path.clone()))?;
        let reader = storage::open(Some(path))?;
        Ok(Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            embedder,
        })
    }

    /// Embed and store a document's vector
    ///
    /// The document row itself must already exist (the keyword index owns
    /// document ingestion); this only attaches the vector.
    pub async fn index_document(&self, doc: &Document) -> Result<()> {
        let vector = self.embedder.embed(&doc.body).await?;
        self.store_embedding(&doc.id, &vector)
    }

    /// Attach a precomputed vector to a document
    pub fn store_embedding(&self, document_id: &str, vector: &[f32]) -> Result<()> {
        let writer = self
            .writer
            .lock()
            .map_err(|_| IndexError::Unavailable("Writer lock poisoned".into()))?;
        let encoded = serde_json::to_string(vector)
            .map_err(|e| IndexError::Backend(format!("Vector encode failed: {}", e)))?;
        writer.execute(
            "INSERT OR REPLACE INTO embeddings (document_id, vector, dims) VALUES (?1, ?2, ?3)",
            rusqlite::params![document_id, encoded, vector.len() as i64],
        )?;
        Ok(())
    }

    /// Number of stored vectors
    pub fn embedding_count(&self) -> Result<usize> {
        let reader = self
            .reader
            .lock()
            .map_err(|_| IndexError::Unavailable("Reader lock poisoned".into()))?;
        let count: i64 = reader.query_row("SELECT COUNT(*) FROM embeddings", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn scan(
        &self,
        query_vec: &[f32],
        channels: Option<&HashSet<String>>,
        limit: usize,
    ) -> Result<Vec<IndexHit>> {
        let reader = self
            .reader
            .lock()
            .map_err(|_| IndexError::Unavailable("Reader lock poisoned".into()))?;

        let mut stmt = reader.prepare(
            "SELECT e.document_id, e.vector, d.channel, d.published_at
             FROM embeddings e JOIN documents d ON d.id = e.document_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, DateTime<Utc>>(3)?,
            ))
        })?;

        let mut hits: Vec<IndexHit> = Vec::new();
        for row in rows {
            let (document_id, encoded, channel, published_at) = row?;
            if let Some(set) = channels {
                if !set.contains(&channel) {
                    continue;
                }
            }
            let vector: Vec<f32> = serde_json::from_str(&encoded)
                .map_err(|e| IndexError::Backend(format!("Vector decode failed: {}", e)))?;
            let score = cosine_similarity(query_vec, &vector);
            if score > 0.0 {
                hits.push(IndexHit {
                    document_id,
                    channel,
                    published_at,
                    score,
                });
            }
        }

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.published_at.cmp(&a.published_at))
                .then_with(|| a.document_id.cmp(&b.document_id))
        });
        hits.truncate(limit);
        debug!(hits = hits.len(), "semantic scan");
        Ok(hits)
    }
}

#[async_trait]
impl SecondaryIndex for SemanticIndex {
    async fn query(
        &self,
        text: &str,
        channels: Option<&HashSet<String>>,
        limit: usize,
    ) -> Result<Vec<IndexHit>> {
        let query_vec = self.embedder.embed(text).await?;
        self.scan(&query_vec, channels, limit)
    }

    async fn query_embedding(
        &self,
        embedding: &[f32],
        channels: Option<&HashSet<String>>,
        limit: usize,
    ) -> Result<Vec<IndexHit>> {
        self.scan(embedding, channels, limit)
    }
}

// ============================================================================
// TESTS
// ============================================================================
