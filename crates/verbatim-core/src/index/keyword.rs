//! Keyword Index - FTS5-backed primary retrieval
//!
//! Full-text retrieval over the `documents_fts` virtual table with BM25
//! ranking and a porter tokenizer. Also owns document ingestion: the FTS
//! index stays in sync through the triggers installed by migration v1.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::Connection;
use tracing::debug;

use crate::storage;
use crate::transcript::Document;

use super::{IndexError, IndexHit, PrimaryIndex, Result};

// ============================================================================
// FTS5 QUERY SANITIZATION
// ============================================================================

/// Sanitize raw text into a safe FTS5 MATCH expression
///
/// Every term is individually quoted so user input can never break MATCH
/// syntax. Two operators survive sanitization because widening transforms
/// rely on them: the literal token `OR`, and a trailing `*` marking a
/// prefix term. Everything else gets implicit AND semantics. Returns an
/// empty string when nothing queryable remains.
pub fn sanitize_fts5_query(text: &str) -> String {
    let mut parts: Vec<String> = Vec::new();
    for raw in text.split_whitespace() {
        if raw == "OR" {
            // Never lead with an operator, never stack two
            if !parts.is_empty() && parts.last().map(String::as_str) != Some("OR") {
                parts.push("OR".to_string());
            }
            continue;
        }
        let prefix = raw.ends_with('*');
        let term: String = raw.chars().filter(|c| c.is_alphanumeric()).collect();
        if !term.is_empty() {
            if prefix {
                parts.push(format!("\"{}\"*", term));
            } else {
                parts.push(format!("\"{}\"", term));
            }
        }
    }
    // A trailing operator is a syntax error
    if parts.last().map(String::as_str) == Some("OR") {
        parts.pop();
    }
    parts.join(" ")
}

// ============================================================================
// KEYWORD INDEX
// ============================================================================

/// Index statistics
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeywordIndexStats {
    /// Total indexed documents
    pub documents: usize,
    /// Distinct channels
    pub channels: usize,
}

/// FTS5-backed keyword index
///
/// Separate reader/writer connections for interior mutability; all methods
/// take `&self` so the orchestrator and the agent runtime can share an
/// `Arc<KeywordIndex>` without an outer lock.
pub struct KeywordIndex {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
}

impl KeywordIndex {
    /// Open (or create) the index at the given path
    ///
    /// `None` resolves to the platform default database location.
    pub fn new(db_path: Option<PathBuf>) -> storage::Result<Self> {
        let path = match db_path {
            Some(p) => p,
            None => storage::default_db_path()?,
        };
        let writer = storage::open(Some(path.clone()))?;
        let reader = storage::open(Some(path))?;
        Ok(Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
        })
    }

    /// Insert or replace a single document
    pub fn ingest(&self, doc: &Document) -> storage::Result<()> {
        let writer = self
            .writer
            .lock()
            .map_err(|_| storage::StorageError::Init("Writer lock poisoned".into()))?;
        writer.execute(
            "INSERT OR REPLACE INTO documents (id, channel, published_at, body, tokens)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                doc.id,
                doc.channel,
                doc.published_at.to_rfc3339(),
                doc.body,
                serde_json::to_string(&doc.tokens).unwrap_or_else(|_| "[]".to_string()),
            ],
        )?;
        Ok(())
    }

    /// Insert a batch of documents in one transaction
    pub fn ingest_batch(&self, docs: &[Document]) -> storage::Result<usize> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| storage::StorageError::Init("Writer lock poisoned".into()))?;
        let tx = writer.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO documents (id, channel, published_at, body, tokens)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for doc in docs {
                stmt.execute(rusqlite::params![
                    doc.id,
                    doc.channel,
                    doc.published_at.to_rfc3339(),
                    doc.body,
                    serde_json::to_string(&doc.tokens).unwrap_or_else(|_| "[]".to_string()),
                ])?;
            }
        }
        tx.commit()?;
        Ok(docs.len())
    }

    /// Fetch a document by id
    pub fn document(&self, id: &str) -> storage::Result<Option<Document>> {
        let reader = self
            .reader
            .lock()
            .map_err(|_| storage::StorageError::Init("Reader lock poisoned".into()))?;
        let doc = reader
            .query_row(
                "SELECT id, channel, published_at, body, tokens FROM documents WHERE id = ?1",
                [id],
                row_to_document,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(doc)
    }

    /// All documents, optionally restricted to one channel
    ///
    /// Ordered by recency; used by the analysis agent, not the search path.
    pub fn documents(&self, channel: Option<&str>, limit: usize) -> storage::Result<Vec<Document>> {
        let reader = self
            .reader
            .lock()
            .map_err(|_| storage::StorageError::Init("Reader lock poisoned".into()))?;
        let mut out = Vec::new();
        match channel {
            Some(ch) => {
                let mut stmt = reader.prepare(
                    "SELECT id, channel, published_at, body, tokens FROM documents
                     WHERE channel = ?1 ORDER BY published_at DESC LIMIT ?2",
                )?;
                let rows = stmt.query_map(rusqlite::params![ch, limit as i64], row_to_document)?;
                for row in rows {
                    out.push(row?);
                }
            }
            None => {
                let mut stmt = reader.prepare(
                    "SELECT id, channel, published_at, body, tokens FROM documents
                     ORDER BY published_at DESC LIMIT ?1",
                )?;
                let rows = stmt.query_map([limit as i64], row_to_document)?;
                for row in rows {
                    out.push(row?);
                }
            }
        }
        Ok(out)
    }

    /// Index statistics
    pub fn stats(&self) -> storage::Result<KeywordIndexStats> {
        let reader = self
            .reader
            .lock()
            .map_err(|_| storage::StorageError::Init("Reader lock poisoned".into()))?;
        let documents: i64 =
            reader.query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))?;
        let channels: i64 = reader.query_row(
            "SELECT COUNT(DISTINCT channel) FROM documents",
            [],
            |row| row.get(0),
        )?;
        Ok(KeywordIndexStats {
            documents: documents as usize,
            channels: channels as usize,
        })
    }

    /// Run a sanitized MATCH query against the FTS table
    fn query_sync(
        &self,
        text: &str,
        channels: Option<&HashSet<String>>,
        limit: usize,
    ) -> Result<Vec<IndexHit>> {
        let match_expr = sanitize_fts5_query(text);
        if match_expr.is_empty() {
            return Ok(Vec::new());
        }

        let reader = self
            .reader
            .lock()
            .map_err(|_| IndexError::Unavailable("Reader lock poisoned".into()))?;

        // bm25-derived rank: lower is better, so negate into higher-is-better
        let mut sql = String::from(
            "SELECT d.id, d.channel, d.published_at, -documents_fts.rank
             FROM documents_fts
             JOIN documents d ON d.rowid = documents_fts.rowid
             WHERE documents_fts MATCH ?1",
        );
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(match_expr)];
        if let Some(set) = channels {
            if !set.is_empty() {
                let placeholders: Vec<String> = (0..set.len())
                    .map(|i| format!("?{}", i + 2))
                    .collect();
                sql.push_str(&format!(" AND d.channel IN ({})", placeholders.join(", ")));
                // Sorted for a stable placeholder order
                let mut sorted: Vec<&String> = set.iter().collect();
                sorted.sort();
                for ch in sorted {
                    params.push(Box::new(ch.clone()));
                }
            }
        }
        sql.push_str(&format!(
            " ORDER BY documents_fts.rank, d.published_at DESC, d.id ASC LIMIT {}",
            limit
        ));

        let mut stmt = reader.prepare(&sql)?;
        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let rows = stmt.query_map(param_refs.as_slice(), |row| {
            Ok(IndexHit {
                document_id: row.get(0)?,
                channel: row.get(1)?,
                published_at: row.get(2)?,
                score: row.get::<_, f64>(3)? as f32,
            })
        })?;

        let mut hits = Vec::new();
        for row in rows {
            hits.push(row?);
        }
        debug!(hits = hits.len(), "keyword query");
        Ok(hits)
    }
}

#[async_trait]
impl PrimaryIndex for KeywordIndex {
    async fn query(
        &self,
        text: &str,
        channels: Option<&HashSet<String>>,
        limit: usize,
    ) -> Result<Vec<IndexHit>> {
        self.query_sync(text, channels, limit)
    }
}

fn row_to_document(row: &rusqlite::Row<'_>) -> rusqlite::Result<Document> {
    let tokens_json: String = row.get(4)?;
    Ok(Document {
        id: row.get(0)?,
        channel: row.get(1)?,
        published_at: row.get(2)?,
        body: row.get(3)?,
        tokens: serde_json::from_str(&tokens_json).unwrap_or_default(),
    })
}

// ============================================================================
// TESTS
// ============================================================================
