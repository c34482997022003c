use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{GridDocument, Reservation, ReservationId};

/// Key of the single document holding the sold ledger and the reservation table.
pub const GRID_STATE_KEY: &str = "state";
const UPDATE_GRID_MAX_ATTEMPTS: usize = 8;

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredBlob {
    pub version: i64,
    pub body: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VersionedGrid {
    /// 0 when nothing has been written yet.
    pub version: i64,
    pub document: GridDocument,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved { version: i64 },
    /// Someone else wrote the document after it was read.
    Conflict,
}

/// Versioned access to the shared grid document. Reads are strongly
/// consistent; writes only land when the stored version still matches.
#[async_trait]
pub trait GridStore: Send + Sync {
    async fn load_grid(&self) -> Result<VersionedGrid>;
    async fn save_grid(&self, document: &GridDocument, expected_version: i64)
        -> Result<SaveOutcome>;
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn load_blob(&self, key: &str) -> Result<Option<StoredBlob>> {
        let row = sqlx::query("SELECT version, body FROM kv_blobs WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("failed to read blob '{key}'"))?;
        Ok(row.map(|r| StoredBlob {
            version: r.get::<i64, _>(0),
            body: r.get::<String, _>(1),
        }))
    }

    /// Writes `body` under `key` only if the stored version equals
    /// `expected_version` (0 meaning "absent"). Bumps the version on success.
    pub async fn compare_and_swap_blob(
        &self,
        key: &str,
        expected_version: i64,
        body: &str,
    ) -> Result<SaveOutcome> {
        let result = if expected_version == 0 {
            sqlx::query(
                "INSERT INTO kv_blobs (key, version, body, updated_at) VALUES (?, 1, ?, CURRENT_TIMESTAMP)
                 ON CONFLICT(key) DO NOTHING",
            )
            .bind(key)
            .bind(body)
            .execute(&self.pool)
            .await
        } else {
            sqlx::query(
                "UPDATE kv_blobs SET body = ?, version = version + 1, updated_at = CURRENT_TIMESTAMP
                 WHERE key = ? AND version = ?",
            )
            .bind(body)
            .bind(key)
            .bind(expected_version)
            .execute(&self.pool)
            .await
        };
        let result = result.with_context(|| format!("failed to write blob '{key}'"))?;

        if result.rows_affected() == 0 {
            return Ok(SaveOutcome::Conflict);
        }
        Ok(SaveOutcome::Saved {
            version: expected_version + 1,
        })
    }

    /// Read-modify-write of the grid document, retried on version conflicts.
    pub async fn update_grid<R, F>(&self, mut apply: F) -> Result<R>
    where
        F: FnMut(&mut GridDocument) -> R + Send,
        R: Send,
    {
        for _ in 0..UPDATE_GRID_MAX_ATTEMPTS {
            let VersionedGrid {
                version,
                mut document,
            } = self.load_grid().await?;
            let outcome = apply(&mut document);
            if let SaveOutcome::Saved { .. } = self.save_grid(&document, version).await? {
                return Ok(outcome);
            }
        }
        anyhow::bail!("grid document kept changing; gave up after {UPDATE_GRID_MAX_ATTEMPTS} attempts")
    }

    pub async fn put_reservation(&self, id: &ReservationId, reservation: Reservation) -> Result<()> {
        self.update_grid(|document| {
            document.locks.insert(id.clone(), reservation.clone());
        })
        .await
    }

    pub async fn remove_reservation(&self, id: &ReservationId) -> Result<bool> {
        self.update_grid(|document| document.locks.remove(id).is_some())
            .await
    }
}

#[async_trait]
impl GridStore for Storage {
    async fn load_grid(&self) -> Result<VersionedGrid> {
        let Some(blob) = self.load_blob(GRID_STATE_KEY).await? else {
            return Ok(VersionedGrid::default());
        };
        let document = serde_json::from_str(&blob.body).with_context(|| {
            format!("grid document '{GRID_STATE_KEY}' is not valid JSON (version {})", blob.version)
        })?;
        Ok(VersionedGrid {
            version: blob.version,
            document,
        })
    }

    async fn save_grid(
        &self,
        document: &GridDocument,
        expected_version: i64,
    ) -> Result<SaveOutcome> {
        let body = serde_json::to_string(document).context("failed to encode grid document")?;
        self.compare_and_swap_blob(GRID_STATE_KEY, expected_version, &body)
            .await
    }
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
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
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
