use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::debug;

use shared::{domain::TemplateId, protocol::HandoffRecord};

const SELECTED_TEMPLATE_SLOT: &str = "selected_template";
const LAST_SESSION_SLOT: &str = "last_session";

/// Local persistence for data handed from one kiosk step to the next.
///
/// This is a fallback copy only; the in-process hand-off is authoritative.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredSlot {
    pub payload: String,
    pub updated_at: DateTime<Utc>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // Every connection to an in-memory database sees its own empty schema.
        let max_connections = if is_memory_url(database_url) { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn save_selected_template(&self, template_id: TemplateId) -> Result<()> {
        self.put_slot(SELECTED_TEMPLATE_SLOT, &template_id.0.to_string())
            .await
    }

    pub async fn load_selected_template(&self) -> Result<Option<TemplateId>> {
        let Some(slot) = self.get_slot(SELECTED_TEMPLATE_SLOT).await? else {
            return Ok(None);
        };
        let id = slot
            .payload
            .trim()
            .parse::<i64>()
            .with_context(|| format!("corrupt selected template slot '{}'", slot.payload))?;
        Ok(Some(TemplateId(id)))
    }

    pub async fn save_session_handoff(&self, record: &HandoffRecord) -> Result<()> {
        let payload =
            serde_json::to_string(record).context("failed to serialize session hand-off")?;
        self.put_slot(LAST_SESSION_SLOT, &payload).await?;
        debug!(
            session_id = %record.session_id,
            frames = record.frames.len(),
            has_result = record.result.is_some(),
            "persisted session hand-off"
        );
        Ok(())
    }

    pub async fn load_session_handoff(&self) -> Result<Option<HandoffRecord>> {
        let Some(slot) = self.get_slot(LAST_SESSION_SLOT).await? else {
            return Ok(None);
        };
        let record = serde_json::from_str(&slot.payload)
            .context("failed to decode persisted session hand-off")?;
        Ok(Some(record))
    }

    pub async fn clear_session_handoff(&self) -> Result<bool> {
        let result = sqlx::query("DELETE FROM handoff_slots WHERE slot = ?")
            .bind(LAST_SESSION_SLOT)
            .execute(&self.pool)
            .await
            .context("failed to clear session hand-off")?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_slot(&self, slot: &str) -> Result<Option<StoredSlot>> {
        let row = sqlx::query("SELECT payload, updated_at FROM handoff_slots WHERE slot = ?")
            .bind(slot)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("failed to read hand-off slot '{slot}'"))?;

        row.map(|row| {
            Ok::<_, anyhow::Error>(StoredSlot {
                payload: row.try_get("payload")?,
                updated_at: row.try_get("updated_at")?,
            })
        })
        .transpose()
    }

    async fn put_slot(&self, slot: &str, payload: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO handoff_slots (slot, payload, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(slot) DO UPDATE SET payload = excluded.payload,
                                             updated_at = excluded.updated_at",
        )
        .bind(slot)
        .bind(payload)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to write hand-off slot '{slot}'"))?;
        Ok(())
    }
}

fn is_memory_url(database_url: &str) -> bool {
    database_url.starts_with("sqlite::memory:") || database_url.contains("mode=memory")
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if is_memory_url(database_url) || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
