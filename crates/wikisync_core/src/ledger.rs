use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;

const LEDGER_SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS upload_records (
    workspace_slug TEXT NOT NULL,
    file_name TEXT NOT NULL,
    digest TEXT NOT NULL,
    status TEXT NOT NULL,
    location TEXT,
    superseded_location TEXT,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    updated_at_unix INTEGER NOT NULL,
    PRIMARY KEY (workspace_slug, file_name)
);
CREATE TABLE IF NOT EXISTS crawl_state (
    scope_key TEXT PRIMARY KEY,
    cursor TEXT NOT NULL,
    updated_at_unix INTEGER NOT NULL
);
";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Pending,
    Succeeded,
    Failed,
    UploadedUnattached,
}

impl UploadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::UploadedUnattached => "uploaded_unattached",
        }
    }

    fn parse(value: &str) -> Result<Self> {
        Ok(match value {
            "pending" => Self::Pending,
            "succeeded" => Self::Succeeded,
            "failed" => Self::Failed,
            "uploaded_unattached" => Self::UploadedUnattached,
            other => bail!("unknown upload status in ledger: {other}"),
        })
    }
}

/// Last known upload state of one exported file in one workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadRecord {
    pub workspace_slug: String,
    pub file_name: String,
    pub digest: String,
    pub status: UploadStatus,
    /// Platform-assigned document location of the latest upload.
    pub location: Option<String>,
    /// Location of an older upload still attached to the workspace.
    pub superseded_location: Option<String>,
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl UploadRecord {
    pub fn pending(
        workspace_slug: &str,
        file_name: &str,
        digest: &str,
        previous: Option<&UploadRecord>,
    ) -> Self {
        let superseded_location = previous.and_then(|record| match record.status {
            UploadStatus::Succeeded => record.location.clone(),
            _ => record.superseded_location.clone(),
        });
        Self {
            workspace_slug: workspace_slug.to_string(),
            file_name: file_name.to_string(),
            digest: digest.to_string(),
            status: UploadStatus::Pending,
            location: None,
            superseded_location,
            attempts: previous.map_or(0, |record| record.attempts),
            last_error: None,
        }
    }

    pub fn is_current(&self, digest: &str) -> bool {
        self.status == UploadStatus::Succeeded && self.digest == digest
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UploadCounts {
    pub pending: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub uploaded_unattached: usize,
}

impl UploadCounts {
    pub fn total(&self) -> usize {
        self.pending + self.succeeded + self.failed + self.uploaded_unattached
    }
}

/// Durable run state: per-file upload records and listing cursors.
pub struct StateLedger {
    connection: Connection,
}

impl StateLedger {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create ledger directory {}", parent.display())
            })?;
        }
        let connection = Connection::open(db_path)
            .with_context(|| format!("failed to open {}", db_path.display()))?;
        connection
            .busy_timeout(Duration::from_secs(5))
            .context("failed to set sqlite busy timeout")?;
        connection
            .pragma_update(None, "journal_mode", "WAL")
            .context("failed to enable WAL journal mode")?;
        Self::initialize(connection)
    }

    pub fn open_in_memory() -> Result<Self> {
        let connection =
            Connection::open_in_memory().context("failed to open in-memory ledger")?;
        Self::initialize(connection)
    }

    fn initialize(connection: Connection) -> Result<Self> {
        connection
            .execute_batch(LEDGER_SCHEMA_SQL)
            .context("failed to initialize ledger schema")?;
        Ok(Self { connection })
    }

    pub fn upload_record(
        &self,
        workspace_slug: &str,
        file_name: &str,
    ) -> Result<Option<UploadRecord>> {
        let row = self
            .connection
            .query_row(
                "SELECT file_name, digest, status, location, superseded_location, attempts, last_error
                 FROM upload_records WHERE workspace_slug = ?1 AND file_name = ?2",
                params![workspace_slug, file_name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, Option<String>>(6)?,
                    ))
                },
            )
            .optional()
            .with_context(|| format!("failed to load upload record for {file_name}"))?;

        let Some((file_name, digest, status, location, superseded_location, attempts, last_error)) =
            row
        else {
            return Ok(None);
        };
        Ok(Some(UploadRecord {
            workspace_slug: workspace_slug.to_string(),
            file_name,
            digest,
            status: UploadStatus::parse(&status)?,
            location,
            superseded_location,
            attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
            last_error,
        }))
    }

    pub fn record_upload(&self, record: &UploadRecord) -> Result<()> {
        self.connection
            .execute(
                "INSERT INTO upload_records (
                    workspace_slug,
                    file_name,
                    digest,
                    status,
                    location,
                    superseded_location,
                    attempts,
                    last_error,
                    updated_at_unix
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ON CONFLICT(workspace_slug, file_name) DO UPDATE SET
                    digest = excluded.digest,
                    status = excluded.status,
                    location = excluded.location,
                    superseded_location = excluded.superseded_location,
                    attempts = excluded.attempts,
                    last_error = excluded.last_error,
                    updated_at_unix = excluded.updated_at_unix",
                params![
                    record.workspace_slug,
                    record.file_name,
                    record.digest,
                    record.status.as_str(),
                    record.location,
                    record.superseded_location,
                    i64::from(record.attempts),
                    record.last_error,
                    unix_timestamp()?,
                ],
            )
            .with_context(|| format!("failed to record upload state for {}", record.file_name))?;
        Ok(())
    }

    pub fn upload_counts(&self, workspace_slug: Option<&str>) -> Result<UploadCounts> {
        let mut statement = self
            .connection
            .prepare(
                "SELECT status, COUNT(*) FROM upload_records
                 WHERE ?1 IS NULL OR workspace_slug = ?1
                 GROUP BY status",
            )
            .context("failed to prepare upload count query")?;
        let rows = statement
            .query_map(params![workspace_slug], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .context("failed to count upload records")?;

        let mut counts = UploadCounts::default();
        for row in rows {
            let (status, count) = row.context("failed to read upload count row")?;
            let count = usize::try_from(count).context("count query returned negative value")?;
            match UploadStatus::parse(&status)? {
                UploadStatus::Pending => counts.pending = count,
                UploadStatus::Succeeded => counts.succeeded = count,
                UploadStatus::Failed => counts.failed = count,
                UploadStatus::UploadedUnattached => counts.uploaded_unattached = count,
            }
        }
        Ok(counts)
    }

    pub fn crawl_cursor(&self, scope_key: &str) -> Result<Option<String>> {
        self.connection
            .query_row(
                "SELECT cursor FROM crawl_state WHERE scope_key = ?1",
                params![scope_key],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to load crawl cursor for {scope_key}"))
    }

    pub fn set_crawl_cursor(&self, scope_key: &str, cursor: &str) -> Result<()> {
        self.connection
            .execute(
                "INSERT INTO crawl_state (scope_key, cursor, updated_at_unix)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(scope_key) DO UPDATE SET
                    cursor = excluded.cursor,
                    updated_at_unix = excluded.updated_at_unix",
                params![scope_key, cursor, unix_timestamp()?],
            )
            .with_context(|| format!("failed to save crawl cursor for {scope_key}"))?;
        Ok(())
    }

    pub fn clear_crawl_cursor(&self, scope_key: &str) -> Result<()> {
        self.connection
            .execute(
                "DELETE FROM crawl_state WHERE scope_key = ?1",
                params![scope_key],
            )
            .with_context(|| format!("failed to clear crawl cursor for {scope_key}"))?;
        Ok(())
    }
}

fn unix_timestamp() -> Result<i64> {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock is before UNIX_EPOCH")?
        .as_secs();
    i64::try_from(seconds).context("timestamp does not fit into i64")
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::{StateLedger, UploadRecord, UploadStatus};

    const SLUG: &str = "testwiki";

    fn succeeded(file_name: &str, digest: &str, location: &str) -> UploadRecord {
        UploadRecord {
            status: UploadStatus::Succeeded,
            location: Some(location.to_string()),
            attempts: 1,
            ..UploadRecord::pending(SLUG, file_name, digest, None)
        }
    }

    #[test]
    fn upload_records_round_trip_and_upsert() {
        let ledger = StateLedger::open_in_memory().expect("ledger");
        assert!(ledger.upload_record(SLUG, "Home.md").expect("load").is_none());

        ledger
            .record_upload(&succeeded("Home.md", "aaaa", "custom-documents/home-1.json"))
            .expect("record");
        let loaded = ledger.upload_record(SLUG, "Home.md").expect("load").expect("present");
        assert!(loaded.is_current("aaaa"));
        assert!(!loaded.is_current("bbbb"));

        let pending = UploadRecord::pending(SLUG, "Home.md", "bbbb", Some(&loaded));
        assert_eq!(
            pending.superseded_location.as_deref(),
            Some("custom-documents/home-1.json")
        );
        ledger.record_upload(&pending).expect("record");
        let reloaded = ledger.upload_record(SLUG, "Home.md").expect("load").expect("present");
        assert_eq!(reloaded.status, UploadStatus::Pending);
        assert_eq!(reloaded.digest, "bbbb");
        assert!(reloaded.location.is_none());
    }

    #[test]
    fn superseded_location_survives_repeated_failures() {
        let ledger = StateLedger::open_in_memory().expect("ledger");
        let first = succeeded("FAQ.md", "aaaa", "custom-documents/faq-1.json");
        let pending = UploadRecord::pending(SLUG, "FAQ.md", "bbbb", Some(&first));
        let failed = UploadRecord {
            status: UploadStatus::Failed,
            last_error: Some("HTTP 502".to_string()),
            ..pending
        };
        ledger.record_upload(&failed).expect("record");

        let loaded = ledger.upload_record(SLUG, "FAQ.md").expect("load").expect("present");
        let retry = UploadRecord::pending(SLUG, "FAQ.md", "bbbb", Some(&loaded));
        assert_eq!(
            retry.superseded_location.as_deref(),
            Some("custom-documents/faq-1.json")
        );
    }

    #[test]
    fn counts_group_by_status() {
        let ledger = StateLedger::open_in_memory().expect("ledger");
        ledger
            .record_upload(&succeeded("A.md", "1", "loc-a"))
            .expect("record");
        ledger
            .record_upload(&succeeded("B.md", "2", "loc-b"))
            .expect("record");
        ledger
            .record_upload(&UploadRecord::pending(SLUG, "C.md", "3", None))
            .expect("record");

        ledger
            .record_upload(&UploadRecord::pending("other", "A.md", "1", None))
            .expect("record");

        let counts = ledger.upload_counts(Some(SLUG)).expect("counts");
        assert_eq!(counts.succeeded, 2);
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.total(), 3);
        assert_eq!(ledger.upload_counts(None).expect("counts").pending, 2);
        assert!(ledger.upload_record("other", "B.md").expect("load").is_none());
    }

    #[test]
    fn crawl_cursor_persists_across_reopen() {
        let temp = tempdir().expect("tempdir");
        let db_path = temp.path().join("state").join("state.db");
        {
            let ledger = StateLedger::open(&db_path).expect("ledger");
            assert!(ledger.crawl_cursor("scope").expect("load").is_none());
            ledger.set_crawl_cursor("scope", "Page 010").expect("save");
            ledger.set_crawl_cursor("scope", "Page 020").expect("save");
        }
        let ledger = StateLedger::open(&db_path).expect("reopen");
        assert_eq!(
            ledger.crawl_cursor("scope").expect("load").as_deref(),
            Some("Page 020")
        );
        ledger.clear_crawl_cursor("scope").expect("clear");
        assert!(ledger.crawl_cursor("scope").expect("load").is_none());
    }
}
