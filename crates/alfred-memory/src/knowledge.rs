// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Titled knowledge documents with tag-aware full-text search.

use rusqlite::{Connection, OptionalExtension};
use tracing::warn;

use alfred_store::{new_id, now_iso, StoreError};

#[derive(Debug, Clone)]
pub struct KnowledgeDoc {
    pub id: String,
    pub title: String,
    pub content: String,
    pub updated_at: String,
}

#[derive(Debug, Default)]
pub struct KnowledgeBaseService;

fn fts_query(text: &str) -> String {
    let tokens: Vec<&str> = text
        .split(|c: char| c == '"' || c.is_whitespace())
        .filter(|t| !t.is_empty())
        .take(8)
        .collect();
    tokens.join(" OR ")
}

impl KnowledgeBaseService {
    /// Insert or update a document keyed by title; the FTS mirror row is
    /// refreshed in the same call.
    pub fn put(
        &self,
        conn: &Connection,
        title: &str,
        content: &str,
        tags: &[String],
    ) -> Result<String, StoreError> {
        let clean_title = title.trim();
        let clean_content = content.trim();
        if clean_title.is_empty() || clean_content.is_empty() {
            return Err(StoreError::Invalid(
                "title and content are required".to_string(),
            ));
        }
        let clean_tags: Vec<String> = tags
            .iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        let now = now_iso();
        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM knowledge_docs WHERE title = ?1",
                [clean_title],
                |row| row.get(0),
            )
            .optional()?;
        let doc_id = match existing {
            Some(doc_id) => {
                conn.execute(
                    "UPDATE knowledge_docs SET content = ?1, tags_json = ?2, updated_at = ?3 \
                     WHERE id = ?4",
                    (
                        clean_content,
                        serde_json::to_string(&clean_tags).unwrap_or_else(|_| "[]".to_string()),
                        &now,
                        &doc_id,
                    ),
                )?;
                doc_id
            }
            None => {
                let doc_id = new_id("kb");
                conn.execute(
                    "INSERT INTO knowledge_docs(id, title, content, tags_json, created_at, \
                                                updated_at) \
                     VALUES(?1, ?2, ?3, ?4, ?5, ?5)",
                    (
                        &doc_id,
                        clean_title,
                        clean_content,
                        serde_json::to_string(&clean_tags).unwrap_or_else(|_| "[]".to_string()),
                        &now,
                    ),
                )?;
                doc_id
            }
        };
        conn.execute("DELETE FROM knowledge_docs_fts WHERE doc_id = ?1", [&doc_id])?;
        conn.execute(
            "INSERT INTO knowledge_docs_fts(doc_id, title, content, tags) VALUES(?1, ?2, ?3, ?4)",
            (&doc_id, clean_title, clean_content, clean_tags.join(" ")),
        )?;
        Ok(doc_id)
    }

    pub fn list_docs(
        &self,
        conn: &Connection,
        limit: usize,
    ) -> Result<Vec<KnowledgeDoc>, StoreError> {
        let mut stmt = conn.prepare(
            "SELECT id, title, content, updated_at FROM knowledge_docs \
             ORDER BY updated_at DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([limit.clamp(1, 100) as i64], |row| {
                Ok(KnowledgeDoc {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    content: row.get(2)?,
                    updated_at: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Fetch by id, falling back to exact title.
    pub fn get(
        &self,
        conn: &Connection,
        reference: &str,
    ) -> Result<Option<KnowledgeDoc>, StoreError> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Ok(None);
        }
        for column in ["id", "title"] {
            let row = conn
                .query_row(
                    &format!(
                        "SELECT id, title, content, updated_at FROM knowledge_docs \
                         WHERE {column} = ?1"
                    ),
                    [reference],
                    |row| {
                        Ok(KnowledgeDoc {
                            id: row.get(0)?,
                            title: row.get(1)?,
                            content: row.get(2)?,
                            updated_at: row.get(3)?,
                        })
                    },
                )
                .optional()?;
            if row.is_some() {
                return Ok(row);
            }
        }
        Ok(None)
    }

    /// BM25-ranked search with a LIKE fallback when FTS rejects the query.
    pub fn search(
        &self,
        conn: &Connection,
        query: &str,
        limit: usize,
    ) -> Result<Vec<KnowledgeDoc>, StoreError> {
        let clean = query.trim();
        if clean.is_empty() {
            return Ok(Vec::new());
        }
        let match_expr = fts_query(clean);
        if match_expr.is_empty() {
            return Ok(Vec::new());
        }
        let limit = limit.clamp(1, 50) as i64;
        let fts = conn
            .prepare(
                "SELECT kd.id, kd.title, kd.content, kd.updated_at \
                 FROM knowledge_docs_fts kf \
                 JOIN knowledge_docs kd ON kd.id = kf.doc_id \
                 WHERE knowledge_docs_fts MATCH ?1 \
                 ORDER BY bm25(knowledge_docs_fts), kd.updated_at DESC LIMIT ?2",
            )
            .and_then(|mut stmt| {
                stmt.query_map(rusqlite::params![match_expr, limit], |row| {
                    Ok(KnowledgeDoc {
                        id: row.get(0)?,
                        title: row.get(1)?,
                        content: row.get(2)?,
                        updated_at: row.get(3)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()
            });
        match fts {
            Ok(rows) => Ok(rows),
            Err(err) => {
                warn!(error = %err, "knowledge FTS query failed; falling back to LIKE");
                let pattern = format!("%{clean}%");
                let mut stmt = conn.prepare(
                    "SELECT id, title, content, updated_at FROM knowledge_docs \
                     WHERE title LIKE ?1 OR content LIKE ?1 \
                     ORDER BY updated_at DESC LIMIT ?2",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![pattern, limit], |row| {
                        Ok(KnowledgeDoc {
                            id: row.get(0)?,
                            title: row.get(1)?,
                            content: row.get(2)?,
                            updated_at: row.get(3)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
