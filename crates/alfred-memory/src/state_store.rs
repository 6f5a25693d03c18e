// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;

use alfred_events::embed::{blob_to_vec, cosine, vec_to_blob};
use alfred_store::{now_iso, StoreError};

use crate::state_items::{tier_priority, StateItem};

/// Row-level access to `state_items` and their embeddings.  Merge policy
/// lives in the extractor; this store is deliberately mechanical.
#[derive(Debug, Default)]
pub struct StateStore;

fn item_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StateItem> {
    let topic_tags: String = row.get(5)?;
    let refs: String = row.get(6)?;
    let evidence: Option<String> = row.get(9)?;
    Ok(StateItem {
        uid: row.get(0)?,
        text: row.get(2)?,
        status: row.get(3)?,
        type_tag: row.get(4)?,
        topic_tags: serde_json::from_str(&topic_tags).unwrap_or_default(),
        refs: serde_json::from_str(&refs).unwrap_or_default(),
        confidence: row.get(7)?,
        replaced_by: row.get(8)?,
        supersession_evidence: evidence.and_then(|raw| serde_json::from_str(&raw).ok()),
        conflict: row.get::<_, i64>(10)? != 0,
        pinned: row.get::<_, i64>(11)? != 0,
        source: row.get(12)?,
        created_at: row.get(13)?,
        last_seen_at: row.get(14)?,
        tier: row.get(15)?,
        importance_score: row.get(16)?,
        access_count: row.get::<_, i64>(17)? as u32,
        conflict_count: row.get::<_, i64>(18)? as u32,
        agent_id: row.get(19)?,
        last_accessed_at: row.get(20)?,
    })
}

const ITEM_COLUMNS: &str = "uid, thread_id, text, status, type_tag, topic_tags_json, refs_json, \
     confidence, replaced_by, supersession_evidence, conflict, pinned, source, created_at, \
     last_seen_at, tier, importance_score, access_count, conflict_count, agent_id, \
     last_accessed_at";

impl StateStore {
    /// Insert or update one item.  `created_at` of an existing row is
    /// preserved; `last_seen_at` and `updated_at` always advance.
    pub fn upsert_item(
        &self,
        conn: &Connection,
        thread_id: &str,
        item: &StateItem,
    ) -> Result<(), StoreError> {
        let now = now_iso();
        let created_at: Option<String> = conn
            .query_row(
                "SELECT created_at FROM state_items WHERE thread_id = ?1 AND uid = ?2",
                (thread_id, &item.uid),
                |row| row.get(0),
            )
            .optional()?;
        let created_at = created_at.unwrap_or_else(|| {
            if item.created_at.is_empty() {
                now.clone()
            } else {
                item.created_at.clone()
            }
        });
        let last_seen = if item.last_seen_at.is_empty() {
            now.clone()
        } else {
            item.last_seen_at.clone()
        };
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO state_items({ITEM_COLUMNS}, updated_at) \
                 VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, \
                        ?17, ?18, ?19, ?20, ?21, ?22)"
            ),
            rusqlite::params![
                item.uid,
                thread_id,
                item.text,
                item.status,
                item.type_tag,
                serde_json::to_string(&item.topic_tags).unwrap_or_else(|_| "[]".to_string()),
                serde_json::to_string(&item.refs).unwrap_or_else(|_| "[]".to_string()),
                item.confidence,
                item.replaced_by,
                item.supersession_evidence
                    .as_ref()
                    .map(|evidence| evidence.to_string()),
                item.conflict as i64,
                item.pinned as i64,
                item.source,
                created_at,
                last_seen,
                item.tier,
                item.importance_score,
                item.access_count as i64,
                item.conflict_count as i64,
                item.agent_id,
                item.last_accessed_at,
                now,
            ],
        )?;
        Ok(())
    }

    pub fn get_item(
        &self,
        conn: &Connection,
        thread_id: &str,
        uid: &str,
    ) -> Result<Option<StateItem>, StoreError> {
        let row = conn
            .query_row(
                &format!(
                    "SELECT {ITEM_COLUMNS} FROM state_items WHERE thread_id = ?1 AND uid = ?2"
                ),
                (thread_id, uid),
                item_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Non-superseded items, most recently seen first.  Ties break by tier
    /// (short-term first) then uid, so rank order is reproducible.
    pub fn get_active_items(
        &self,
        conn: &Connection,
        thread_id: &str,
        limit: usize,
    ) -> Result<Vec<StateItem>, StoreError> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {ITEM_COLUMNS} FROM state_items \
             WHERE thread_id = ?1 AND status != 'superseded' \
             ORDER BY last_seen_at DESC, \
                      CASE tier \
                          WHEN 'working' THEN 0 \
                          WHEN 'episodic' THEN 1 \
                          WHEN 'semantic_longterm' THEN 2 \
                          WHEN 'procedural' THEN 3 \
                          ELSE 4 \
                      END ASC, \
                      uid ASC \
             LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map((thread_id, limit as i64), item_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn upsert_item_embedding(
        &self,
        conn: &Connection,
        uid: &str,
        thread_id: &str,
        vec: &[f32],
    ) -> Result<(), StoreError> {
        conn.execute(
            "INSERT OR REPLACE INTO state_item_vecs(uid, thread_id, vec) VALUES(?1, ?2, ?3)",
            (uid, thread_id, vec_to_blob(vec)),
        )?;
        Ok(())
    }

    /// Active items ranked by cosine similarity against `query_vec`.
    /// Deterministic: ties break by `(tier, last_seen_at desc, uid asc)`.
    pub fn search_similar_items(
        &self,
        conn: &Connection,
        thread_id: &str,
        query_vec: &[f32],
        k: usize,
        min_score: f32,
    ) -> Result<Vec<(StateItem, f32)>, StoreError> {
        let qualified_columns = ITEM_COLUMNS
            .split(", ")
            .map(|c| format!("s.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        let mut stmt = conn.prepare(&format!(
            "SELECT {qualified_columns}, v.vec FROM state_items s \
             JOIN state_item_vecs v ON v.thread_id = s.thread_id AND v.uid = s.uid \
             WHERE s.thread_id = ?1 AND s.status != 'superseded'"
        ))?;
        let mut scored: Vec<(StateItem, f32)> = stmt
            .query_map([thread_id], |row| {
                let item = item_from_row(row)?;
                let blob: Vec<u8> = row.get(21)?;
                Ok((item, blob))
            })?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|(item, blob)| {
                let score = cosine(query_vec, &blob_to_vec(&blob));
                (item, score)
            })
            .filter(|(_, score)| *score >= min_score)
            .collect();
        scored.sort_by(|(a, sa), (b, sb)| {
            sb.partial_cmp(sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| tier_priority(&a.tier).cmp(&tier_priority(&b.tier)))
                .then_with(|| b.last_seen_at.cmp(&a.last_seen_at))
                .then_with(|| a.uid.cmp(&b.uid))
        });
        scored.truncate(k);
        Ok(scored)
    }

    /// Mark `old_uid` superseded by `new_uid` in one statement; the status
    /// flip and the back-reference are never observable separately.
    pub fn supersede(
        &self,
        conn: &Connection,
        thread_id: &str,
        old_uid: &str,
        new_uid: &str,
        evidence: &Value,
    ) -> Result<(), StoreError> {
        conn.execute(
            "UPDATE state_items \
             SET status = 'superseded', replaced_by = ?1, supersession_evidence = ?2, \
                 updated_at = ?3 \
             WHERE thread_id = ?4 AND uid = ?5",
            (new_uid, evidence.to_string(), now_iso(), thread_id, old_uid),
        )?;
        Ok(())
    }

    pub fn get_extraction_watermark(
        &self,
        conn: &Connection,
        thread_id: &str,
    ) -> Result<Option<(String, String)>, StoreError> {
        let row = conn
            .query_row(
                "SELECT last_created_at, last_message_id FROM state_extraction_watermarks \
                 WHERE thread_id = ?1",
                [thread_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(row)
    }

    pub fn set_extraction_watermark(
        &self,
        conn: &Connection,
        thread_id: &str,
        last_created_at: &str,
        last_message_id: &str,
    ) -> Result<(), StoreError> {
        conn.execute(
            "INSERT OR REPLACE INTO state_extraction_watermarks(\
                 thread_id, last_created_at, last_message_id\
             ) VALUES(?1, ?2, ?3)",
            (thread_id, last_created_at, last_message_id),
        )?;
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_items::StateItemType;
    use alfred_events::embed::embed_text;
    use alfred_store::open_in_memory;

    fn item(text: &str) -> StateItem {
        let mut item = StateItem::new(StateItemType::Decision, text);
        item.refs = vec!["msg_1".to_string()];
        item
    }

    #[test]
    fn upsert_preserves_created_at() {
        let conn = open_in_memory().unwrap();
        let store = StateStore;
        let mut it = item("Use Redis");
        it.created_at = "2026-02-01T00:00:00Z".to_string();
        store.upsert_item(&conn, "thr_1", &it).unwrap();
        store.upsert_item(&conn, "thr_1", &it).unwrap();
        let stored = store.get_item(&conn, "thr_1", &it.uid).unwrap().unwrap();
        assert_eq!(stored.created_at, "2026-02-01T00:00:00Z");
    }

    #[test]
    fn one_row_per_thread_uid() {
        let conn = open_in_memory().unwrap();
        let store = StateStore;
        let it = item("Use Redis");
        store.upsert_item(&conn, "thr_1", &it).unwrap();
        store.upsert_item(&conn, "thr_1", &it).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM state_items", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn supersede_flips_status_and_back_reference_together() {
        let conn = open_in_memory().unwrap();
        let store = StateStore;
        let old = item("Use Redis for caching");
        store.upsert_item(&conn, "thr_1", &old).unwrap();
        store
            .supersede(
                &conn,
                "thr_1",
                &old.uid,
                "d_new",
                &serde_json::json!({"trigger": "instead"}),
            )
            .unwrap();
        let stored = store.get_item(&conn, "thr_1", &old.uid).unwrap().unwrap();
        assert_eq!(stored.status, "superseded");
        assert_eq!(stored.replaced_by.as_deref(), Some("d_new"));
        assert!(stored.supersession_evidence.is_some());
    }

    #[test]
    fn similar_items_rank_by_cosine() {
        let conn = open_in_memory().unwrap();
        let store = StateStore;
        for (text, uid_text) in [
            ("Use Redis for caching", "redis"),
            ("Deploy on Fridays is risky", "fridays"),
        ] {
            let mut it = item(text);
            it.uid = format!("d_{uid_text}");
            store.upsert_item(&conn, "thr_1", &it).unwrap();
            store
                .upsert_item_embedding(&conn, &it.uid, "thr_1", &embed_text(text))
                .unwrap();
        }
        let hits = store
            .search_similar_items(&conn, "thr_1", &embed_text("redis caching"), 2, 0.0)
            .unwrap();
        assert_eq!(hits[0].0.uid, "d_redis");
    }

    #[test]
    fn similar_items_tie_break_is_deterministic() {
        let conn = open_in_memory().unwrap();
        let store = StateStore;
        let vec = embed_text("identical text");
        for uid in ["d_bbb", "d_aaa"] {
            let mut it = item("identical text");
            it.uid = uid.to_string();
            it.last_seen_at = "2026-02-10T00:00:05Z".to_string();
            store.upsert_item(&conn, "thr_1", &it).unwrap();
            store.upsert_item_embedding(&conn, uid, "thr_1", &vec).unwrap();
        }
        let first: Vec<String> = store
            .search_similar_items(&conn, "thr_1", &vec, 2, 0.0)
            .unwrap()
            .into_iter()
            .map(|(i, _)| i.uid)
            .collect();
        let second: Vec<String> = store
            .search_similar_items(&conn, "thr_1", &vec, 2, 0.0)
            .unwrap()
            .into_iter()
            .map(|(i, _)| i.uid)
            .collect();
        assert_eq!(first, vec!["d_aaa", "d_bbb"]);
        assert_eq!(first, second);
    }

    #[test]
    fn watermark_round_trip() {
        let conn = open_in_memory().unwrap();
        let store = StateStore;
        assert!(store.get_extraction_watermark(&conn, "thr_1").unwrap().is_none());
        store
            .set_extraction_watermark(&conn, "thr_1", "2026-02-01T00:00:00Z", "msg_9")
            .unwrap();
        assert_eq!(
            store.get_extraction_watermark(&conn, "thr_1").unwrap(),
            Some(("2026-02-01T00:00:00Z".to_string(), "msg_9".to_string()))
        );
    }
}
