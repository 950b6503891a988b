//! SQLite persistence for automation records.
//!
//! Each automation is stored as one row: a few indexed columns for listing
//! plus the full record as JSON. Runtime-only fields are never written, so a
//! loaded record is exactly what the engine needs to restart it.

use crate::strategy::Automation;
use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Storage for automation records.
#[cfg_attr(test, mockall::automock)]
pub trait AutomationStore: Send + Sync {
    /// Insert or replace a record.
    fn save(&self, automation: &Automation) -> Result<()>;

    fn delete(&self, id: &str) -> Result<()>;

    fn get(&self, id: &str) -> Result<Option<Automation>>;

    /// Every stored record, oldest first.
    fn load_all(&self) -> Result<Vec<Automation>>;
}

/// SQLite-backed [`AutomationStore`].
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open the database at `db_path`, creating it and its schema if needed.
    ///
    /// `":memory:"` gives a private in-memory database.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {:?}", path))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        info!("Automation store initialized at {:?}", path);
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn init_schema(&self) -> Result<()> {
        self.conn().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS automations (
                id TEXT PRIMARY KEY,
                venue_a TEXT NOT NULL,
                symbol_a TEXT NOT NULL,
                venue_b TEXT NOT NULL,
                symbol_b TEXT NOT NULL,
                record TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_automations_created ON automations(created_at);
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    /// Number of stored records.
    pub fn count(&self) -> Result<usize> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM automations", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

fn decode(id: &str, json: &str) -> Option<Automation> {
    match serde_json::from_str(json) {
        Ok(automation) => Some(automation),
        Err(e) => {
            warn!(automation = %id, error = %e, "Skipping unreadable automation record");
            None
        }
    }
}

impl AutomationStore for SqliteStore {
    fn save(&self, automation: &Automation) -> Result<()> {
        let now = Utc::now();
        let mut record = automation.clone();
        record.created_at.get_or_insert(now);
        record.updated_at = Some(now);
        let json = serde_json::to_string(&record).context("Failed to encode automation")?;

        self.conn().execute(
            r#"
            INSERT INTO automations (id, venue_a, symbol_a, venue_b, symbol_b, record, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(id) DO UPDATE SET
                venue_a = ?2,
                symbol_a = ?3,
                venue_b = ?4,
                symbol_b = ?5,
                record = ?6,
                updated_at = ?8
            "#,
            params![
                record.id,
                record.venue_a,
                record.symbol_a,
                record.venue_b,
                record.symbol_b,
                json,
                now.to_rfc3339(),
                now.to_rfc3339(),
            ],
        )?;

        debug!(automation = %record.id, "Automation saved");
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<()> {
        let removed = self
            .conn()
            .execute("DELETE FROM automations WHERE id = ?1", params![id])?;
        debug!(automation = %id, removed, "Automation deleted");
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<Automation>> {
        let json: Option<String> = self
            .conn()
            .query_row(
                "SELECT record FROM automations WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(json.and_then(|json| decode(id, &json)))
    }

    fn load_all(&self) -> Result<Vec<Automation>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT id, record FROM automations ORDER BY created_at, id")?;
        let rows: Vec<(String, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .filter_map(|r| r.ok())
            .collect();

        let automations: Vec<Automation> = rows
            .iter()
            .filter_map(|(id, json)| decode(id, json))
            .collect();

        info!(count = automations.len(), "Loaded automations from database");
        Ok(automations)
    }
}
