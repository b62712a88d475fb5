use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde_json::{Map, Value};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use tracing::{debug, info};

use super::AppConfig;
use crate::error::{AppError, Result};

/// Persistent [`AppConfig`], one SQLite row per top-level section
///
/// Reads are served from an `ArcSwap` snapshot. Writes store only the
/// sections that actually changed.
#[derive(Clone)]
pub struct ConfigStore {
    pool: Pool<Sqlite>,
    current: Arc<ArcSwap<AppConfig>>,
}

impl ConfigStore {
    /// Open the database at `db_path`, creating it with defaults if needed
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(dir) = db_path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        // Single writer; the store is read once at boot
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(5))
            .connect(&format!("sqlite:{}?mode=rwc", db_path.display()))
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS settings (
                section TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
        )
        .execute(&pool)
        .await?;

        let rows: Vec<(String, String)> = sqlx::query_as("SELECT section, value FROM settings")
            .fetch_all(&pool)
            .await?;
        let config = if rows.is_empty() {
            info!("Initializing {} with default configuration", db_path.display());
            let config = AppConfig::default();
            write_sections(&pool, &sections_of(&config)?).await?;
            config
        } else {
            debug!("Loaded {} config sections from {}", rows.len(), db_path.display());
            assemble(rows)?
        };

        Ok(Self {
            pool,
            current: Arc::new(ArcSwap::from_pointee(config)),
        })
    }

    /// Snapshot of the current configuration
    pub fn get(&self) -> Arc<AppConfig> {
        self.current.load_full()
    }

    /// Store `config`; returns the names of the sections that changed
    pub async fn set(&self, config: AppConfig) -> Result<Vec<String>> {
        let before = sections_of(&self.current.load())?;
        let after = sections_of(&config)?;
        let changed: Map<String, Value> = after
            .into_iter()
            .filter(|(name, value)| before.get(name) != Some(value))
            .collect();
        if changed.is_empty() {
            return Ok(Vec::new());
        }

        write_sections(&self.pool, &changed).await?;
        self.current.store(Arc::new(config));
        Ok(changed.keys().cloned().collect())
    }

    /// Edit a copy of the current configuration and store it
    pub async fn update<F>(&self, f: F) -> Result<Vec<String>>
    where
        F: FnOnce(&mut AppConfig),
    {
        let mut config = AppConfig::clone(&self.current.load());
        f(&mut config);
        self.set(config).await
    }

    /// Close the database before the process image is replaced
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn sections_of(config: &AppConfig) -> Result<Map<String, Value>> {
    match serde_json::to_value(config)? {
        Value::Object(map) => Ok(map),
        other => Err(AppError::Config(format!(
            "configuration serialized to {} instead of an object",
            other
        ))),
    }
}

/// Unknown sections are ignored, missing ones fall back to defaults
fn assemble(rows: Vec<(String, String)>) -> Result<AppConfig> {
    let mut map = Map::new();
    for (section, json) in rows {
        let value = serde_json::from_str(&json)
            .map_err(|e| AppError::Config(format!("section '{}': {}", section, e)))?;
        map.insert(section, value);
    }
    serde_json::from_value(Value::Object(map)).map_err(|e| AppError::Config(e.to_string()))
}

async fn write_sections(pool: &Pool<Sqlite>, sections: &Map<String, Value>) -> Result<()> {
    let mut tx = pool.begin().await?;
    for (section, value) in sections {
        sqlx::query(
            "INSERT INTO settings (section, value, updated_at)
             VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(section) DO UPDATE SET value = ?2, updated_at = datetime('now')",
        )
        .bind(section)
        .bind(value.to_string())
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}
