use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{migrate::Migrator, SqlitePool};

use crate::models::NormalizedScanRecord;

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

pub async fn create_pool(url: &str) -> anyhow::Result<SqlitePool> {
    Ok(SqlitePool::connect(url).await?)
}

pub async fn run_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
    MIGRATOR.run(pool).await?;
    Ok(())
}

/// Where finished scan records go. Called once per executed job.
#[async_trait]
pub trait ScanRecordSink: Send + Sync {
    async fn save(
        &self,
        record: &NormalizedScanRecord,
        project_ref: Option<i64>,
    ) -> anyhow::Result<i64>;
}

#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct ScanResultRow {
    pub id: i64,
    pub scan_type: String,
    pub project_id: Option<i64>,
    pub status: String,
    pub raw_output: String,
    pub parsed_data: Option<String>,
    pub scan_options: String,
    pub command: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SqliteScanStore {
    pool: SqlitePool,
}

impl SqliteScanStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn list_for_project(&self, project_id: i64) -> anyhow::Result<Vec<ScanResultRow>> {
        let rows = sqlx::query_as::<_, ScanResultRow>(
            "SELECT id, scan_type, project_id, status, raw_output, parsed_data, scan_options, command, started_at, completed_at, error_message FROM scan_results WHERE project_id=? ORDER BY id",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[async_trait]
impl ScanRecordSink for SqliteScanStore {
    async fn save(
        &self,
        record: &NormalizedScanRecord,
        project_ref: Option<i64>,
    ) -> anyhow::Result<i64> {
        let parsed = record.parsed.as_ref().map(serde_json::to_string).transpose()?;
        let options = serde_json::to_string(&record.options)?;

        let inserted = sqlx::query(
            "INSERT INTO scan_results(scan_type, project_id, status, raw_output, parsed_data, scan_options, command, started_at, completed_at, error_message) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.scan_kind.as_str())
        .bind(project_ref)
        .bind(record.status.to_string())
        .bind(&record.raw_output)
        .bind(parsed)
        .bind(options)
        .bind(&record.command)
        .bind(record.started_at)
        .bind(record.completed_at)
        .bind(&record.error_message)
        .execute(&self.pool)
        .await?;

        Ok(inserted.last_insert_rowid())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use sqlx::sqlite::SqlitePoolOptions;

    use super::*;
    use crate::models::{FingerprintValue, OptionValue, ScanPayload, TaskStatus, ToolKind};

    async fn memory_store() -> SqliteScanStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite");
        run_migrations(&pool).await.expect("migrations apply");
        SqliteScanStore::new(pool)
    }

    fn record(status: TaskStatus) -> NormalizedScanRecord {
        let now = Utc::now();
        let mut parsed = BTreeMap::new();
        parsed.insert(
            "title".to_string(),
            FingerprintValue::Text("Example Domain".to_string()),
        );
        let mut options = BTreeMap::new();
        options.insert("--user-agent".to_string(), OptionValue::from("scanner"));
        NormalizedScanRecord {
            scan_kind: ToolKind::Fingerprint,
            status,
            raw_output: "https://example.com [200 OK] Title[Example Domain]".to_string(),
            parsed: Some(ScanPayload::Fingerprint(parsed)),
            command: "whatweb --no-errors https://example.com --user-agent=scanner".to_string(),
            options,
            started_at: now,
            completed_at: now,
            error_message: None,
        }
    }

    #[tokio::test]
    async fn saved_records_are_listed_per_project() {
        let store = memory_store().await;
        let first = store
            .save(&record(TaskStatus::Completed), Some(3))
            .await
            .expect("save");
        let second = store
            .save(&record(TaskStatus::Completed), Some(3))
            .await
            .expect("save");
        store
            .save(&record(TaskStatus::Completed), Some(4))
            .await
            .expect("save");
        assert!(second > first);

        let rows = store.list_for_project(3).await.expect("list");
        assert_eq!(rows.iter().map(|r| r.id).collect::<Vec<_>>(), [first, second]);
        let row = &rows[0];
        assert_eq!(row.scan_type, "whatweb");
        assert_eq!(row.status, "COMPLETED");
        assert_eq!(row.project_id, Some(3));
        assert!(row.error_message.is_none());

        let parsed: ScanPayload =
            serde_json::from_str(row.parsed_data.as_deref().expect("parsed stored"))
                .expect("parsed is json");
        assert!(matches!(parsed, ScanPayload::Fingerprint(ref m) if m.contains_key("title")));
        let options: BTreeMap<String, OptionValue> =
            serde_json::from_str(&row.scan_options).expect("options are json");
        assert_eq!(options["--user-agent"], OptionValue::from("scanner"));
    }

    #[tokio::test]
    async fn failed_record_without_project_is_kept() {
        let store = memory_store().await;
        let mut failed = record(TaskStatus::Failed);
        failed.parsed = None;
        failed.error_message = Some("execution error: tool timed out after 300s".to_string());

        let id = store.save(&failed, None).await.expect("save");
        let (status, parsed, error): (String, Option<String>, Option<String>) = sqlx::query_as(
            "SELECT status, parsed_data, error_message FROM scan_results WHERE id=?",
        )
        .bind(id)
        .fetch_one(&store.pool)
        .await
        .expect("row exists");
        assert_eq!(status, "FAILED");
        assert!(parsed.is_none());
        assert_eq!(error.as_deref(), Some("execution error: tool timed out after 300s"));
    }
}
