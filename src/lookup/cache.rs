// src/lookup/cache.rs
//
// SQLite-backed cache for lookup results, keyed on a normalised query
// string (lower-cased, whitespace-collapsed). Writes are upserts; racing
// writers on one key converge to last-write-wins.

use crate::lookup::EvidenceSnippet;
use rusqlite::{Connection, Result as SqliteResult, params};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;
use time::OffsetDateTime;
use tracing::info;

/// Cached outcome of a single lookup.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LookupResult {
    pub query: String,
    pub pack_qty: Option<u32>,
    pub uom: Option<String>,
    pub evidence_snippets: Vec<EvidenceSnippet>,
    pub source_urls: Vec<String>,
    pub llm_used: bool,
    pub timestamp: f64,
}

/// Thread-safe, durable cache. One row per normalised query.
pub struct LookupCache {
    conn: Mutex<Connection>,
}

impl LookupCache {
    pub fn new<P: AsRef<Path>>(db_path: P) -> SqliteResult<Self> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                // Failure surfaces as an open error below.
                let _ = std::fs::create_dir_all(parent);
            }
        }
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS lookup_cache (
                query_key    TEXT PRIMARY KEY,
                pack_qty     INTEGER,
                uom          TEXT,
                evidence     TEXT,
                source_urls  TEXT,
                llm_used     INTEGER NOT NULL DEFAULT 0,
                ts           REAL
            )",
            [],
        )?;

        info!("Lookup cache initialised");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory cache for tests and dry runs.
    pub fn in_memory() -> SqliteResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS lookup_cache (
                query_key    TEXT PRIMARY KEY,
                pack_qty     INTEGER,
                uom          TEXT,
                evidence     TEXT,
                source_urls  TEXT,
                llm_used     INTEGER NOT NULL DEFAULT 0,
                ts           REAL
            )",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Case-fold and collapse whitespace. Callers elsewhere must use the
    /// same normalisation for key coherence.
    pub fn normalize_query(query: &str) -> String {
        query.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
    }

    pub fn get(&self, query: &str) -> SqliteResult<Option<LookupResult>> {
        let key = Self::normalize_query(query);
        let conn = self.conn.lock().expect("cache lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT pack_qty, uom, evidence, source_urls, llm_used, ts
             FROM lookup_cache WHERE query_key = ?1",
        )?;
        let mut rows = stmt.query(params![key])?;

        let Some(row) = rows.next()? else {
            return Ok(None);
        };

        let evidence_json: Option<String> = row.get(2)?;
        let urls_json: Option<String> = row.get(3)?;
        Ok(Some(LookupResult {
            query: query.to_string(),
            pack_qty: row.get::<_, Option<i64>>(0)?.map(|v| v as u32),
            uom: row.get(1)?,
            evidence_snippets: evidence_json
                .and_then(|j| serde_json::from_str(&j).ok())
                .unwrap_or_default(),
            source_urls: urls_json
                .and_then(|j| serde_json::from_str(&j).ok())
                .unwrap_or_default(),
            llm_used: row.get::<_, i64>(4)? != 0,
            timestamp: row.get::<_, Option<f64>>(5)?.unwrap_or(0.0),
        }))
    }

    /// Upsert keyed on the normalised query.
    pub fn put(&self, result: &LookupResult) -> SqliteResult<()> {
        let key = Self::normalize_query(&result.query);
        let evidence =
            serde_json::to_string(&result.evidence_snippets).unwrap_or_else(|_| "[]".to_string());
        let urls =
            serde_json::to_string(&result.source_urls).unwrap_or_else(|_| "[]".to_string());
        let ts = OffsetDateTime::now_utc().unix_timestamp() as f64;

        let conn = self.conn.lock().expect("cache lock poisoned");
        conn.execute(
            "INSERT INTO lookup_cache (query_key, pack_qty, uom, evidence, source_urls, llm_used, ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(query_key) DO UPDATE SET
                pack_qty = excluded.pack_qty,
                uom = excluded.uom,
                evidence = excluded.evidence,
                source_urls = excluded.source_urls,
                llm_used = excluded.llm_used,
                ts = excluded.ts",
            params![
                key,
                result.pack_qty.map(|v| v as i64),
                result.uom,
                evidence,
                urls,
                result.llm_used as i64,
                ts,
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snippet(url: &str, text: &str) -> EvidenceSnippet {
        EvidenceSnippet {
            url: url.to_string(),
            snippet: text.to_string(),
        }
    }

    #[test]
    fn round_trip() {
        let cache = LookupCache::in_memory().unwrap();
        let result = LookupResult {
            query: "MFR-B14".to_string(),
            pack_qty: Some(25),
            uom: Some("CS".to_string()),
            evidence_snippets: vec![snippet("https://a.example", "sold as 25/CS")],
            source_urls: vec!["https://a.example".to_string()],
            llm_used: false,
            timestamp: 0.0,
        };
        cache.put(&result).unwrap();

        let fetched = cache.get("MFR-B14").unwrap().unwrap();
        assert_eq!(fetched.pack_qty, Some(25));
        assert_eq!(fetched.uom.as_deref(), Some("CS"));
        assert_eq!(fetched.evidence_snippets, result.evidence_snippets);
        assert_eq!(fetched.source_urls, result.source_urls);
        assert!(!fetched.llm_used);
    }

    #[test]
    fn key_is_case_and_whitespace_insensitive() {
        let cache = LookupCache::in_memory().unwrap();
        cache
            .put(&LookupResult {
                query: "Nitrile  Gloves   Large".to_string(),
                pack_qty: Some(10),
                ..LookupResult::default()
            })
            .unwrap();

        let fetched = cache.get("nitrile gloves large").unwrap();
        assert_eq!(fetched.unwrap().pack_qty, Some(10));
    }

    #[test]
    fn miss_returns_none() {
        let cache = LookupCache::in_memory().unwrap();
        assert!(cache.get("never seen").unwrap().is_none());
    }

    #[test]
    fn later_put_overwrites() {
        let cache = LookupCache::in_memory().unwrap();
        cache
            .put(&LookupResult {
                query: "widget".to_string(),
                pack_qty: Some(6),
                ..LookupResult::default()
            })
            .unwrap();
        cache
            .put(&LookupResult {
                query: "WIDGET".to_string(),
                pack_qty: Some(12),
                llm_used: true,
                ..LookupResult::default()
            })
            .unwrap();

        let fetched = cache.get("widget").unwrap().unwrap();
        assert_eq!(fetched.pack_qty, Some(12));
        assert!(fetched.llm_used);
    }

    #[test]
    fn negative_rows_round_trip() {
        let cache = LookupCache::in_memory().unwrap();
        cache
            .put(&LookupResult {
                query: "unresolvable thing".to_string(),
                ..LookupResult::default()
            })
            .unwrap();

        let fetched = cache.get("unresolvable thing").unwrap().unwrap();
        assert!(fetched.pack_qty.is_none());
        assert!(fetched.uom.is_none());
        assert!(fetched.evidence_snippets.is_empty());
    }

    #[test]
    fn durable_cache_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lookup_cache.db");
        {
            let cache = LookupCache::new(&path).unwrap();
            cache
                .put(&LookupResult {
                    query: "persisted".to_string(),
                    pack_qty: Some(4),
                    ..LookupResult::default()
                })
                .unwrap();
        }
        let cache = LookupCache::new(&path).unwrap();
        assert_eq!(cache.get("persisted").unwrap().unwrap().pack_qty, Some(4));
    }
}
