//! Ranking utilities - normalization, merge, deterministic ordering
//!
//! Keyword BM25 and cosine similarity live on different scales, so each
//! source's scores are min/max-normalized into [0, 1] before any merge.
//! Merged lists are deduplicated by document id, keeping whichever source
//! scored the document higher.

use std::collections::HashMap;

use crate::index::IndexHit;
use crate::transcript::{RankedResult, ResultSource};

/// Deterministic ordering for raw hits: score desc, recency desc, id asc
pub fn sort_hits(hits: &mut [IndexHit]) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.published_at.cmp(&a.published_at))
            .then_with(|| a.document_id.cmp(&b.document_id))
    });
}

/// Normalize one source's hits to [0, 1] using that source's own min/max
///
/// A degenerate set (single hit, or all scores equal) normalizes to 1.0
/// for every hit. Ranks are provisional; the merge reassigns them.
pub fn normalize_hits(hits: &[IndexHit], source: ResultSource) -> Vec<RankedResult> {
    if hits.is_empty() {
        return Vec::new();
    }
    let min = hits.iter().map(|h| h.score).fold(f32::INFINITY, f32::min);
    let max = hits.iter().map(|h| h.score).fold(f32::NEG_INFINITY, f32::max);
    let span = max - min;

    hits.iter()
        .enumerate()
        .map(|(rank, hit)| RankedResult {
            document_id: hit.document_id.clone(),
            channel: hit.channel.clone(),
            published_at: hit.published_at,
            score: if span > 0.0 { (hit.score - min) / span } else { 1.0 },
            source,
            rank,
        })
        .collect()
}

/// Merge two normalized result lists into one ranked answer
///
/// Deduplicates by document id, preferring the higher normalized score
/// when a document appears from both sources. Returns the merged list
/// (truncated to `limit`, ranks reassigned) and the pre-truncation count.
pub fn merge_ranked(
    primary: Vec<RankedResult>,
    secondary: Vec<RankedResult>,
    limit: usize,
) -> (Vec<RankedResult>, usize) {
    let mut best: HashMap<String, RankedResult> = HashMap::new();
    for result in primary.into_iter().chain(secondary) {
        match best.get(&result.document_id) {
            Some(existing) if existing.score >= result.score => {}
            _ => {
                best.insert(result.document_id.clone(), result);
            }
        }
    }

    let mut merged: Vec<RankedResult> = best.into_values().collect();
    merged.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.published_at.cmp(&a.published_at))
            .then_with(|| a.document_id.cmp(&b.document_id))
    });

    let total_found = merged.len();
    merged.truncate(limit);
    for (rank, result) in merged.iter_mut().enumerate() {
        result.rank = rank;
    }
    (merged, total_found)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn hit(id: &str, score: f32) -> IndexHit {
        IndexHit {
            document_id: id.to_string(),
            channel: "c".to_string(),
            published_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            score,
        }
    }

    #[test]
    fn normalize_maps_to_unit_interval() {
        let hits = vec![hit("a", 10.0), hit("b", 5.0), hit("c", 0.0)];
        let normalized = normalize_hits(&hits, ResultSource::Primary);
        assert_eq!(normalized[0].score, 1.0);
        assert_eq!(normalized[1].score, 0.5);
        assert_eq!(normalized[2].score, 0.0);
        assert!(normalized.iter().all(|r| r.source == ResultSource::Primary));
    }

    #[test]
    fn normalize_degenerate_set_is_all_ones() {
        let hits = vec![hit("a", 7.0), hit("b", 7.0)];
        let normalized = normalize_hits(&hits, ResultSource::Secondary);
        assert!(normalized.iter().all(|r| r.score == 1.0));
    }

    #[test]
    fn normalize_empty_is_empty() {
        assert!(normalize_hits(&[], ResultSource::Primary).is_empty());
    }

    #[test]
    fn merge_deduplicates_preferring_higher_score() {
        let primary = normalize_hits(
            &[hit("a", 10.0), hit("b", 5.0), hit("c", 0.0)],
            ResultSource::Primary,
        );
        let secondary = normalize_hits(
            &[hit("b", 0.9), hit("d", 0.1)],
            ResultSource::Secondary,
        );

        let (merged, total) = merge_ranked(primary, secondary, 10);
        assert_eq!(total, 4);

        let ids: Vec<&str> = merged.iter().map(|r| r.document_id.as_str()).collect();
        let unique: std::collections::HashSet<&&str> = ids.iter().collect();
        assert_eq!(ids.len(), unique.len());

        // "b" normalized to 1.0 in secondary (top of its set) vs 0.5 in primary
        let b = merged.iter().find(|r| r.document_id == "b").unwrap();
        assert_eq!(b.source, ResultSource::Secondary);
        assert_eq!(b.score, 1.0);
    }

    #[test]
    fn merge_truncates_and_reranks() {
        let primary = normalize_hits(
            &[hit("a", 3.0), hit("b", 2.0), hit("c", 1.0)],
            ResultSource::Primary,
        );
        let (merged, total) = merge_ranked(primary, Vec::new(), 2);
        assert_eq!(total, 3);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].rank, 0);
        assert_eq!(merged[1].rank, 1);
    }

    #[test]
    fn sort_hits_breaks_ties_by_recency_then_id() {
        let older = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let newer = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let mut hits = vec![
            IndexHit {
                document_id: "b".into(),
                channel: "c".into(),
                published_at: older,
                score: 1.0,
            },
            IndexHit {
                document_id: "a".into(),
                channel: "c".into(),
                published_at: newer,
                score: 1.0,
            },
            IndexHit {
                document_id: "z".into(),
                channel: "c".into(),
                published_at: newer,
                score: 1.0,
            },
        ];
        sort_hits(&mut hits);
        assert_eq!(hits[0].document_id, "a");
        assert_eq!(hits[1].document_id, "z");
        assert_eq!(hits[2].document_id, "b");
    }
}
