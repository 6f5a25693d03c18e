// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use rusqlite::Connection;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use alfred_config::Settings;
use alfred_events::embed::{blob_to_vec, cosine, embed_text, vec_to_blob};
use alfred_store::{new_id, now_iso, StoreError};

use crate::policy::apply_memory_policy;
use crate::state_items::tier_priority;
use crate::state_store::StateStore;

/// Reciprocal Rank Fusion dampening constant.
const RRF_K: f64 = 60.0;
/// Candidate pool per source list before fusion.
const CANDIDATE_POOL: usize = 50;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("memory write denied by policy: {reason}")]
    PolicyDenied { reason: String },
}

/// One fused retrieval hit.
#[derive(Debug, Clone)]
pub struct MemoryHit {
    pub id: String,
    pub text: String,
    pub score: f64,
    pub last_seen_at: String,
}

/// One state-item retrieval hit.
#[derive(Debug, Clone)]
pub struct StateHit {
    pub uid: String,
    pub text: String,
    pub type_tag: String,
    pub status: String,
    pub tier: String,
    pub score: f64,
    pub last_seen_at: String,
}

/// Hybrid retrieval over thread-scoped memory items.
#[derive(Debug, Default)]
pub struct MemoryService;

fn fts_query(text: &str) -> String {
    let tokens: Vec<String> = text
        .replace('"', " ")
        .split_whitespace()
        .filter(|t| !t.is_empty())
        .take(8)
        .map(|t| t.to_string())
        .collect();
    tokens.join(" OR ")
}

impl MemoryService {
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        embed_text(text)
    }

    /// Store one memory item after the governance gates.  A policy `deny`
    /// stores nothing and surfaces as [`MemoryError::PolicyDenied`].
    pub fn write(
        &self,
        conn: &Connection,
        settings: &Settings,
        thread_id: &str,
        text: &str,
        metadata: Option<&Value>,
    ) -> Result<String, MemoryError> {
        let (filtered, decision, reason) = apply_memory_policy(
            conn,
            settings,
            text,
            Some(thread_id),
            "main",
            "memory_item",
            "",
        )?;
        if decision == "deny" {
            return Err(MemoryError::PolicyDenied {
                reason: reason.to_string(),
            });
        }
        let id = new_id("mem");
        let now = now_iso();
        conn.execute(
            "INSERT INTO memory_items(id, thread_id, text, metadata_json, created_at, \
                                      last_seen_at) \
             VALUES(?1, ?2, ?3, ?4, ?5, ?5)",
            (
                &id,
                thread_id,
                &filtered,
                metadata.map(|m| m.to_string()).unwrap_or_else(|| "{}".to_string()),
                &now,
            ),
        )
        .map_err(StoreError::from)?;
        conn.execute(
            "INSERT INTO memory_fts(memory_id, thread_id, text) VALUES(?1, ?2, ?3)",
            (&id, thread_id, &filtered),
        )
        .map_err(StoreError::from)?;
        conn.execute(
            "INSERT OR REPLACE INTO memory_vecs(id, thread_id, vec) VALUES(?1, ?2, ?3)",
            (&id, thread_id, vec_to_blob(&embed_text(&filtered))),
        )
        .map_err(StoreError::from)?;
        Ok(id)
    }

    fn recency_list(
        &self,
        conn: &Connection,
        thread_id: &str,
    ) -> Result<Vec<(String, String, String)>, StoreError> {
        let mut stmt = conn.prepare(
            "SELECT id, text, last_seen_at FROM memory_items WHERE thread_id = ?1 \
             ORDER BY last_seen_at DESC, id ASC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map((thread_id, CANDIDATE_POOL as i64), |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn vector_list(
        &self,
        conn: &Connection,
        thread_id: &str,
        query: &str,
    ) -> Result<Vec<String>, StoreError> {
        let query_vec = embed_text(query);
        let mut stmt = conn.prepare(
            "SELECT id, vec FROM memory_vecs WHERE thread_id = ?1",
        )?;
        let mut scored: Vec<(String, f32)> = stmt
            .query_map([thread_id], |row| {
                let id: String = row.get(0)?;
                let blob: Vec<u8> = row.get(1)?;
                Ok((id, blob))
            })?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|(id, blob)| {
                let score = cosine(&query_vec, &blob_to_vec(&blob));
                (id, score)
            })
            .filter(|(_, score)| *score > 0.0)
            .collect();
        scored.sort_by(|(ida, sa), (idb, sb)| {
            sb.partial_cmp(sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| ida.cmp(idb))
        });
        scored.truncate(CANDIDATE_POOL);
        Ok(scored.into_iter().map(|(id, _)| id).collect())
    }

    fn bm25_list(
        &self,
        conn: &Connection,
        thread_id: &str,
        query: &str,
    ) -> Result<Vec<String>, StoreError> {
        let match_expr = fts_query(query);
        if match_expr.is_empty() {
            return Ok(Vec::new());
        }
        let fts = conn
            .prepare(
                "SELECT memory_id FROM memory_fts \
                 WHERE memory_fts MATCH ?1 AND thread_id = ?2 \
                 ORDER BY bm25(memory_fts) LIMIT ?3",
            )
            .and_then(|mut stmt| {
                stmt.query_map(
                    rusqlite::params![match_expr, thread_id, CANDIDATE_POOL as i64],
                    |row| row.get::<_, String>(0),
                )?
                .collect::<Result<Vec<_>, _>>()
            });
        match fts {
            Ok(rows) => Ok(rows),
            // A query that FTS refuses falls back to substring matching.
            Err(err) => {
                warn!(error = %err, "FTS query failed; falling back to LIKE");
                let mut stmt = conn.prepare(
                    "SELECT id FROM memory_items \
                     WHERE thread_id = ?1 AND text LIKE ?2 \
                     ORDER BY last_seen_at DESC, id ASC LIMIT ?3",
                )?;
                let rows = stmt
                    .query_map(
                        rusqlite::params![
                            thread_id,
                            format!("%{}%", query.trim()),
                            CANDIDATE_POOL as i64
                        ],
                        |row| row.get::<_, String>(0),
                    )?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            }
        }
    }

    /// Ranked hybrid retrieval with Reciprocal Rank Fusion.
    ///
    /// With a query, three candidate lists contribute `weight / (k + rank)`
    /// each; without one, recency alone decides.  Ordering is fully
    /// deterministic: fused score desc, then `last_seen_at` desc, then id asc.
    #[allow(clippy::too_many_arguments)]
    pub fn search(
        &self,
        conn: &Connection,
        thread_id: &str,
        limit: usize,
        query: Option<&str>,
        vector_weight: f64,
        bm25_weight: f64,
        recency_weight: f64,
    ) -> Result<Vec<MemoryHit>, MemoryError> {
        let recency = self.recency_list(conn, thread_id)?;
        let mut meta: HashMap<String, (String, String)> = recency
            .iter()
            .map(|(id, text, seen)| (id.clone(), (text.clone(), seen.clone())))
            .collect();

        let query = match query.map(str::trim).filter(|q| !q.is_empty()) {
            Some(query) => query,
            None => {
                return Ok(recency
                    .into_iter()
                    .take(limit)
                    .map(|(id, text, last_seen_at)| MemoryHit {
                        id,
                        text,
                        score: 0.0,
                        last_seen_at,
                    })
                    .collect());
            }
        };

        let vector_ids = self.vector_list(conn, thread_id, query)?;
        let bm25_ids = self.bm25_list(conn, thread_id, query)?;
        let recency_ids: Vec<String> = recency.iter().map(|(id, _, _)| id.clone()).collect();

        let mut fused: HashMap<String, f64> = HashMap::new();
        for (ids, weight) in [
            (&vector_ids, vector_weight),
            (&bm25_ids, bm25_weight),
            (&recency_ids, recency_weight),
        ] {
            for (rank, id) in ids.iter().enumerate() {
                *fused.entry(id.clone()).or_default() += weight / (RRF_K + rank as f64 + 1.0);
            }
        }

        // Texts for ids surfaced only by vector/FTS lists.
        for id in fused.keys() {
            if !meta.contains_key(id) {
                let row: Option<(String, String)> = conn
                    .query_row(
                        "SELECT text, last_seen_at FROM memory_items WHERE id = ?1",
                        [id],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .map_err(StoreError::from)
                    .ok();
                if let Some(row) = row {
                    meta.insert(id.clone(), row);
                }
            }
        }

        let mut hits: Vec<MemoryHit> = fused
            .into_iter()
            .filter_map(|(id, score)| {
                meta.get(&id).map(|(text, last_seen_at)| MemoryHit {
                    id,
                    text: text.clone(),
                    score,
                    last_seen_at: last_seen_at.clone(),
                })
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.last_seen_at.cmp(&a.last_seen_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    /// State-item retrieval with the per-tier prior: at equal fused score,
    /// `working` beats `episodic` beats `semantic_longterm`.  Stable across
    /// repeat calls with the same inputs.
    ///
    /// `actor_id` scopes the view: a worker agent sees its own items plus the
    /// main agent's shared ones.
    pub fn search_state(
        &self,
        conn: &Connection,
        thread_id: &str,
        query: &str,
        k: usize,
        min_score: f32,
        actor_id: Option<&str>,
    ) -> Result<Vec<StateHit>, MemoryError> {
        let store = StateStore;
        let query_vec = embed_text(query);
        let in_scope = |agent_id: &str| match actor_id {
            Some(actor) => agent_id == actor || agent_id == "main",
            None => true,
        };
        let similar: Vec<_> = store
            .search_similar_items(conn, thread_id, &query_vec, CANDIDATE_POOL, min_score)?
            .into_iter()
            .filter(|(item, _)| in_scope(&item.agent_id))
            .collect();
        let recent: Vec<_> = store
            .get_active_items(conn, thread_id, CANDIDATE_POOL)?
            .into_iter()
            .filter(|item| in_scope(&item.agent_id))
            .collect();

        let mut items: HashMap<String, StateHit> = HashMap::new();
        let mut fused: HashMap<String, f64> = HashMap::new();
        for (rank, (item, score)) in similar.iter().enumerate() {
            fused
                .entry(item.uid.clone())
                .and_modify(|s| *s += 0.6 / (RRF_K + rank as f64 + 1.0))
                .or_insert(0.6 / (RRF_K + rank as f64 + 1.0));
            items.entry(item.uid.clone()).or_insert_with(|| StateHit {
                uid: item.uid.clone(),
                text: item.text.clone(),
                type_tag: item.type_tag.clone(),
                status: item.status.clone(),
                tier: item.tier.clone(),
                score: *score as f64,
                last_seen_at: item.last_seen_at.clone(),
            });
        }
        for (rank, item) in recent.iter().enumerate() {
            *fused.entry(item.uid.clone()).or_default() += 0.4 / (RRF_K + rank as f64 + 1.0);
            items.entry(item.uid.clone()).or_insert_with(|| StateHit {
                uid: item.uid.clone(),
                text: item.text.clone(),
                type_tag: item.type_tag.clone(),
                status: item.status.clone(),
                tier: item.tier.clone(),
                score: 0.0,
                last_seen_at: item.last_seen_at.clone(),
            });
        }

        let mut hits: Vec<(f64, StateHit)> = items
            .into_iter()
            .map(|(uid, hit)| (fused.get(&uid).copied().unwrap_or(0.0), hit))
            .collect();
        hits.sort_by(|(sa, a), (sb, b)| {
            sb.partial_cmp(sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| tier_priority(&a.tier).cmp(&tier_priority(&b.tier)))
                .then_with(|| b.last_seen_at.cmp(&a.last_seen_at))
                .then_with(|| a.uid.cmp(&b.uid))
        });
        Ok(hits
            .into_iter()
            .take(k)
            .map(|(fused_score, mut hit)| {
                hit.score = fused_score;
                hit
            })
            .collect())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_items::{StateItem, StateItemType};
    use alfred_store::open_in_memory;

    fn svc() -> MemoryService {
        MemoryService
    }

    fn dev_settings() -> Settings {
        Settings::default()
    }

    #[test]
    fn search_empty_thread_returns_empty() {
        let conn = open_in_memory().unwrap();
        let hits = svc()
            .search(&conn, "thr_none", 5, Some("test"), 0.4, 0.35, 0.25)
            .unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn search_finds_written_items() {
        let conn = open_in_memory().unwrap();
        let settings = dev_settings();
        let s = svc();
        s.write(&conn, &settings, "thr_1", "Python is a great programming language", None)
            .unwrap();
        s.write(&conn, &settings, "thr_1", "SQLite supports full-text search via FTS5", None)
            .unwrap();
        s.write(&conn, &settings, "thr_1", "Vector databases enable semantic search", None)
            .unwrap();
        let hits = s
            .search(&conn, "thr_1", 3, Some("search"), 0.4, 0.35, 0.25)
            .unwrap();
        assert!(!hits.is_empty());
        assert!(hits.iter().all(|h| !h.id.is_empty() && !h.text.is_empty()));
    }

    #[test]
    fn no_query_means_recency_only() {
        let conn = open_in_memory().unwrap();
        let settings = dev_settings();
        let s = svc();
        s.write(&conn, &settings, "thr_1", "First item", None).unwrap();
        s.write(&conn, &settings, "thr_1", "Second item", None).unwrap();
        let hits = s.search(&conn, "thr_1", 2, None, 0.4, 0.35, 0.25).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].text, "Second item");
    }

    #[test]
    fn search_order_is_stable_across_calls() {
        let conn = open_in_memory().unwrap();
        let settings = dev_settings();
        let s = svc();
        for i in 0..10 {
            s.write(&conn, &settings, "thr_1", &format!("shared topic entry {i}"), None)
                .unwrap();
        }
        let first: Vec<String> = s
            .search(&conn, "thr_1", 5, Some("shared topic"), 0.4, 0.35, 0.25)
            .unwrap()
            .into_iter()
            .map(|h| h.id)
            .collect();
        let second: Vec<String> = s
            .search(&conn, "thr_1", 5, Some("shared topic"), 0.4, 0.35, 0.25)
            .unwrap()
            .into_iter()
            .map(|h| h.id)
            .collect();
        assert_eq!(first, second);
    }

    fn seed_state(conn: &Connection, uid: &str, tier: &str, seen_at: &str) {
        let store = StateStore;
        let mut item = StateItem::new(StateItemType::Decision, "alpha query item");
        item.uid = uid.to_string();
        item.refs = vec!["msg_1".to_string()];
        item.tier = tier.to_string();
        item.last_seen_at = seen_at.to_string();
        store.upsert_item(conn, "thr_state", &item).unwrap();
        store
            .upsert_item_embedding(conn, uid, "thr_state", &embed_text("alpha query item"))
            .unwrap();
    }

    #[test]
    fn state_search_tier_prior_breaks_ties() {
        let conn = open_in_memory().unwrap();
        let seen = "2026-02-10T00:00:05Z";
        seed_state(&conn, "st_sem", "semantic_longterm", seen);
        seed_state(&conn, "st_epi", "episodic", seen);
        seed_state(&conn, "st_work", "working", seen);
        let uids: Vec<String> = svc()
            .search_state(&conn, "thr_state", "alpha", 3, 0.0, None)
            .unwrap()
            .into_iter()
            .map(|h| h.uid)
            .collect();
        assert_eq!(uids, vec!["st_work", "st_epi", "st_sem"]);
    }

    #[test]
    fn state_search_is_stable_across_calls() {
        let conn = open_in_memory().unwrap();
        let seen = "2026-02-10T00:00:05Z";
        seed_state(&conn, "st_work_a", "working", seen);
        seed_state(&conn, "st_work_b", "working", seen);
        let run = || -> Vec<String> {
            svc()
                .search_state(&conn, "thr_state", "alpha", 2, 0.0, None)
                .unwrap()
                .into_iter()
                .map(|h| h.uid)
                .collect()
        };
        assert_eq!(run(), vec!["st_work_a", "st_work_b"]);
        assert_eq!(run(), run());
    }

    #[test]
    fn write_denied_by_policy_stores_nothing() {
        let conn = open_in_memory().unwrap();
        let settings = Settings {
            memory_pii_redact_mode: alfred_config::PiiRedactMode::Deny,
            ..Settings::default()
        };
        let err = svc()
            .write(&conn, &settings, "thr_1", "call 555-123-4567", None)
            .unwrap_err();
        assert!(matches!(err, MemoryError::PolicyDenied { .. }));
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM memory_items", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
