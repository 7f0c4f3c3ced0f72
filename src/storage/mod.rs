use crate::backup::JobRecord;
use crate::utils::log_buffer::{EventSink, JobEvent};
use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        // Create the parent directory of a file database
        if !database_url.contains(":memory:") {
            let path = database_url.strip_prefix("sqlite://").unwrap_or(database_url);
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
        }

        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;

        Ok(Self { pool })
    }

    /// Private in-memory database; one connection that never expires.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS job_list (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                data TEXT NOT NULL,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS job_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_name TEXT,
                kind TEXT NOT NULL,
                level TEXT NOT NULL,
                data TEXT NOT NULL,
                created_at DATETIME NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_job ON job_events(job_name)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Replaces the persisted job list.
    pub async fn save_jobs(&self, jobs: &[JobRecord]) -> Result<()> {
        let data = serde_json::to_string(jobs)?;

        sqlx::query(
            r#"
            INSERT INTO job_list (id, data, updated_at)
            VALUES (1, ?1, CURRENT_TIMESTAMP)
            ON CONFLICT(id) DO UPDATE SET
                data = excluded.data,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(&data)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn load_jobs(&self) -> Result<Vec<JobRecord>> {
        let row = sqlx::query("SELECT data FROM job_list WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let data: String = row.get("data");
                Ok(serde_json::from_str(&data)?)
            }
            None => Ok(Vec::new()),
        }
    }

    pub async fn add_event(&self, event: &JobEvent) -> Result<()> {
        let data = serde_json::to_value(event)?;
        let kind = data
            .get("kind")
            .and_then(|kind| kind.as_str())
            .unwrap_or("unknown")
            .to_string();

        sqlx::query(
            r#"
            INSERT INTO job_events (job_name, kind, level, data, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(event.job_name())
        .bind(kind)
        .bind(event.level())
        .bind(data.to_string())
        .bind(event.timestamp().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_events(&self, job_name: Option<&str>, limit: i64) -> Result<Vec<EventEntry>> {
        let query = if let Some(job_name) = job_name {
            sqlx::query_as::<_, EventEntry>(
                r#"
                SELECT job_name, kind, level, data, created_at
                FROM job_events
                WHERE job_name = ?1 COLLATE NOCASE
                ORDER BY id DESC
                LIMIT ?2
                "#,
            )
            .bind(job_name)
            .bind(limit)
        } else {
            sqlx::query_as::<_, EventEntry>(
                r#"
                SELECT job_name, kind, level, data, created_at
                FROM job_events
                ORDER BY id DESC
                LIMIT ?1
                "#,
            )
            .bind(limit)
        };

        Ok(query.fetch_all(&self.pool).await?)
    }
}

#[derive(Debug, serde::Serialize, sqlx::FromRow)]
pub struct EventEntry {
    pub job_name: Option<String>,
    pub kind: String,
    pub level: String,
    pub data: String,
    pub created_at: String,
}

/// Event sink that hands events to a background writer task.
#[derive(Clone)]
pub struct StorageSink {
    tx: mpsc::UnboundedSender<JobEvent>,
}

impl StorageSink {
    pub fn spawn(storage: Storage) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<JobEvent>();
        let writer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = storage.add_event(&event).await {
                    warn!("Failed to store event: {}", e);
                }
            }
        });
        (Self { tx }, writer)
    }
}

impl EventSink for StorageSink {
    fn record(&self, event: JobEvent) {
        // The writer only stops at shutdown.
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::{BackupType, JobDefinition, JobState};

    fn record(name: &str, state: JobState) -> JobRecord {
        let dir = std::env::temp_dir();
        let definition = JobDefinition::new(name, &dir, dir.join("target"), BackupType::Differential)
            .unwrap()
            .with_encryption(["docx"])
            .with_blocked_processes(["excel"]);
        let mut record = JobRecord::from(&definition);
        record.state = state;
        record.progress = 42.0;
        record
    }

    #[tokio::test]
    async fn job_list_is_replaced_wholesale() {
        let storage = Storage::in_memory().await.unwrap();
        assert!(storage.load_jobs().await.unwrap().is_empty());

        storage
            .save_jobs(&[record("a", JobState::Completed), record("b", JobState::Running)])
            .await
            .unwrap();
        storage.save_jobs(&[record("b", JobState::Paused)]).await.unwrap();

        let loaded = storage.load_jobs().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "b");
        assert_eq!(loaded[0].state, JobState::Paused);
        assert_eq!(loaded[0].extensions_to_encrypt, vec!["docx"]);
    }

    #[tokio::test]
    async fn file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("nested/jobs.db").display());

        let storage = Storage::new(&url).await.unwrap();
        storage.run_migrations().await.unwrap();
        storage.save_jobs(&[record("keep", JobState::Pending)]).await.unwrap();
        drop(storage);

        let reopened = Storage::new(&url).await.unwrap();
        reopened.run_migrations().await.unwrap();
        assert_eq!(reopened.load_jobs().await.unwrap()[0].name, "keep");
    }

    #[tokio::test]
    async fn sink_writes_events_in_background() {
        let storage = Storage::in_memory().await.unwrap();
        let (sink, writer) = StorageSink::spawn(storage.clone());

        sink.record(JobEvent::status("Backup1", JobState::Running, 0.0));
        sink.record(JobEvent::error(Some("Backup1"), "disk full"));
        sink.record(JobEvent::error(None, "probe failed"));
        drop(sink);
        writer.await.unwrap();

        let events = storage.get_events(Some("backup1"), 10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, "error");
        assert_eq!(events[0].level, "error");
        assert_eq!(events[1].kind, "status");
        assert_eq!(storage.get_events(None, 10).await.unwrap().len(), 3);
    }
}
