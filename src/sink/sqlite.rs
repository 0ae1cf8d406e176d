use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

use super::remote::{validate_table, RecordStore, RemoteRow};
use crate::error::SinkError;
use crate::models::PersistedRecord;

pub fn connect(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let conn = Connection::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

/// Price table plus the read-path indexes downstream queries rely on.
pub fn init_schema(conn: &Connection, table: &str) -> Result<()> {
    validate_table(table)?;
    conn.execute_batch(&format!(
        "
        CREATE TABLE IF NOT EXISTS {t} (
            id            INTEGER PRIMARY KEY,
            brand         VARCHAR(200) NOT NULL,
            description   TEXT NOT NULL,
            site          VARCHAR(200) NOT NULL,
            size          VARCHAR(200),
            ply           VARCHAR(200),
            price         REAL,
            total_reviews INTEGER,
            total_rating  REAL,
            source_url    TEXT NOT NULL,
            metadata      TEXT NOT NULL DEFAULT '{{}}',
            collected_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );
        CREATE INDEX IF NOT EXISTS idx_{t}_natural ON {t}(brand, description, site);
        CREATE INDEX IF NOT EXISTS idx_{t}_brand ON {t}(brand);
        CREATE INDEX IF NOT EXISTS idx_{t}_site ON {t}(site);
        CREATE INDEX IF NOT EXISTS idx_{t}_size ON {t}(size);
        CREATE INDEX IF NOT EXISTS idx_{t}_ply ON {t}(ply);
        ",
        t = table
    ))?;
    Ok(())
}

/// Append rows in one transaction; nothing is written if any insert fails.
pub fn insert_rows(conn: &Connection, table: &str, rows: &[RemoteRow]) -> Result<usize> {
    validate_table(table)?;
    let tx = conn.unchecked_transaction()?;
    let mut count = 0;
    {
        let mut stmt = tx.prepare(&format!(
            "INSERT INTO {} (brand, description, site, size, ply, price, total_reviews,
                             total_rating, source_url, metadata, collected_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                     COALESCE(?11, strftime('%Y-%m-%dT%H:%M:%fZ', 'now')))",
            table
        ))?;
        for r in rows {
            let metadata = serde_json::to_string(&r.metadata)?;
            let collected_at = r
                .collected_at
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Nanos, true));
            count += stmt.execute(rusqlite::params![
                r.brand, r.description, r.site, r.size, r.ply, r.price, r.total_reviews,
                r.total_rating, r.source_url, metadata, collected_at,
            ])?;
        }
    }
    tx.commit()?;
    Ok(count)
}

/// Every stored row in insertion order.
pub fn fetch_all(conn: &Connection, table: &str) -> Result<Vec<PersistedRecord>> {
    validate_table(table)?;
    let mut stmt = conn.prepare(&format!(
        "SELECT id, brand, description, site, size, ply, price, total_reviews, total_rating,
                source_url, metadata, collected_at
         FROM {} ORDER BY id",
        table
    ))?;
    let raw = stmt
        .query_map([], |row| {
            let id: i64 = row.get(0)?;
            let metadata: String = row.get(10)?;
            let collected_at: String = row.get(11)?;
            let partial = RemoteRow {
                brand: row.get(1)?,
                description: row.get(2)?,
                site: row.get(3)?,
                size: row.get(4)?,
                ply: row.get(5)?,
                price: row.get(6)?,
                total_reviews: row.get(7)?,
                total_rating: row.get(8)?,
                source_url: row.get(9)?,
                metadata: Default::default(),
                collected_at: None,
            };
            Ok((id, partial, metadata, collected_at))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    raw.into_iter()
        .map(|(id, mut row, metadata, collected_at)| {
            row.metadata = serde_json::from_str(&metadata)
                .with_context(|| format!("row {} has invalid metadata", id))?;
            let collected_at = DateTime::parse_from_rfc3339(&collected_at)
                .with_context(|| format!("row {} has invalid collected_at", id))?
                .with_timezone(&Utc);
            Ok(PersistedRecord {
                id,
                observation: row.into_observation(collected_at),
            })
        })
        .collect()
}

/// Row count and latest collection time for one storefront.
#[derive(Debug, Clone, PartialEq)]
pub struct SiteStats {
    pub site: String,
    pub rows: i64,
    pub latest: Option<String>,
}

pub fn stats(conn: &Connection, table: &str) -> Result<Vec<SiteStats>> {
    validate_table(table)?;
    let mut stmt = conn.prepare(&format!(
        "SELECT site, COUNT(*), MAX(collected_at) FROM {} GROUP BY site ORDER BY site",
        table
    ))?;
    let rows = stmt
        .query_map([], |row| {
            Ok(SiteStats {
                site: row.get(0)?,
                rows: row.get(1)?,
                latest: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// `sqlite://<path>` backend; each append opens its own connection.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    pub fn open(path: &str) -> Result<Self, SinkError> {
        let path = path.trim();
        if path.is_empty() {
            return Err(SinkError::Unavailable("sqlite endpoint has no path".into()));
        }
        Ok(Self {
            path: PathBuf::from(path),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RecordStore for SqliteStore {
    fn target(&self) -> String {
        format!("sqlite://{}", self.path().display())
    }

    async fn append(&self, table: &str, rows: &[RemoteRow]) -> Result<usize, SinkError> {
        let path = self.path.clone();
        let table = table.to_string();
        let rows = rows.to_vec();
        tokio::task::spawn_blocking(move || -> Result<usize> {
            let conn = connect(&path)?;
            init_schema(&conn, &table)?;
            insert_rows(&conn, &table, &rows)
        })
        .await
        .map_err(|e| SinkError::WriteFailed(format!("sqlite writer panicked: {}", e)))?
        .map_err(|e| SinkError::WriteFailed(format!("{:#}", e)))
    }
}
