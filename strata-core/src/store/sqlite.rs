//! SQLite implementation of [`TableStore`].
//!
//! One connection behind a mutex; every call runs on the blocking pool so
//! the async runtime never waits on disk.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use super::{SilverBatch, TableStore};
use crate::aggregate::{WindowKey, WindowState, WindowStatus};
use crate::error::StoreError;
use crate::schema::SchemaVersion;
use crate::types::{
    AggregateRow, Checkpoint, CleanRecord, FileStatus, Granularity, IngestedFileRecord,
    LateRejection, LedgerConflict, Payload, PipelineRun, RawRecord, RecordKey, Stage,
    Supersession,
};

const MIGRATIONS: &str = r#"
CREATE TABLE IF NOT EXISTS schema_versions (
    dataset     TEXT    NOT NULL,
    version     INTEGER NOT NULL,
    body        TEXT    NOT NULL,
    created_at  INTEGER NOT NULL,
    PRIMARY KEY (dataset, version)
);

CREATE TABLE IF NOT EXISTS ledger (
    dataset         TEXT    NOT NULL,
    file_identity   TEXT    NOT NULL,
    fingerprint     TEXT    NOT NULL,
    schema_version  INTEGER,
    row_count       INTEGER NOT NULL,
    error_rows      INTEGER NOT NULL,
    ingested_at     INTEGER NOT NULL,
    status          TEXT    NOT NULL,
    failure_kind    TEXT,
    failure_reason  TEXT,
    claimed_by      TEXT,
    PRIMARY KEY (dataset, file_identity)
);

CREATE TABLE IF NOT EXISTS ledger_conflicts (
    dataset                TEXT    NOT NULL,
    file_identity          TEXT    NOT NULL,
    observed_fingerprint   TEXT    NOT NULL,
    committed_fingerprint  TEXT    NOT NULL,
    detected_at            INTEGER NOT NULL,
    acknowledged           INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (dataset, file_identity, observed_fingerprint)
);

CREATE TABLE IF NOT EXISTS bronze (
    seq             INTEGER PRIMARY KEY AUTOINCREMENT,
    dataset         TEXT    NOT NULL,
    source_file     TEXT    NOT NULL,
    row_index       INTEGER NOT NULL,
    schema_version  INTEGER NOT NULL,
    ingested_at     INTEGER NOT NULL,
    payload         TEXT    NOT NULL,
    UNIQUE (dataset, source_file, row_index)
);

CREATE TABLE IF NOT EXISTS silver (
    seq             INTEGER PRIMARY KEY AUTOINCREMENT,
    dataset         TEXT    NOT NULL,
    entity_key      TEXT    NOT NULL,
    event_ts        INTEGER NOT NULL,
    fields          TEXT    NOT NULL,
    flags           TEXT    NOT NULL,
    anomalies       TEXT    NOT NULL,
    is_anomaly      INTEGER NOT NULL,
    bronze_seq      INTEGER NOT NULL,
    source_file     TEXT    NOT NULL,
    schema_version  INTEGER NOT NULL,
    processed_at    INTEGER NOT NULL,
    UNIQUE (dataset, entity_key, event_ts)
);
CREATE INDEX IF NOT EXISTS silver_arrival ON silver (dataset, entity_key, bronze_seq);

CREATE TABLE IF NOT EXISTS superseded (
    dataset        TEXT    NOT NULL,
    bronze_seq     INTEGER NOT NULL,
    superseded_by  INTEGER NOT NULL,
    entity_key     TEXT    NOT NULL,
    event_ts       INTEGER NOT NULL,
    PRIMARY KEY (dataset, bronze_seq)
);

CREATE TABLE IF NOT EXISTS checkpoints (
    dataset    TEXT    NOT NULL,
    stage      TEXT    NOT NULL,
    position   INTEGER NOT NULL,
    watermark  INTEGER,
    PRIMARY KEY (dataset, stage)
);

CREATE TABLE IF NOT EXISTS windows (
    dataset       TEXT    NOT NULL,
    entity_key    TEXT    NOT NULL,
    granularity   TEXT    NOT NULL,
    window_start  INTEGER NOT NULL,
    state         TEXT    NOT NULL,
    updated_at    INTEGER NOT NULL,
    PRIMARY KEY (dataset, entity_key, granularity, window_start)
);

CREATE TABLE IF NOT EXISTS gold (
    dataset              TEXT    NOT NULL,
    entity_key           TEXT    NOT NULL,
    granularity          TEXT    NOT NULL,
    window_start         INTEGER NOT NULL,
    metrics              TEXT    NOT NULL,
    source_record_count  INTEGER NOT NULL,
    anomaly_count        INTEGER NOT NULL,
    flagged_count        INTEGER NOT NULL,
    input_digest         TEXT    NOT NULL,
    last_refreshed_at    INTEGER NOT NULL,
    PRIMARY KEY (dataset, entity_key, granularity, window_start)
);

CREATE TABLE IF NOT EXISTS late_rejections (
    dataset       TEXT    NOT NULL,
    silver_seq    INTEGER NOT NULL,
    entity_key    TEXT    NOT NULL,
    window_start  INTEGER NOT NULL,
    event_ts      INTEGER NOT NULL,
    rejected_at   INTEGER NOT NULL,
    PRIMARY KEY (dataset, silver_seq)
);

CREATE TABLE IF NOT EXISTS runs (
    run_id      TEXT    PRIMARY KEY,
    dataset     TEXT    NOT NULL,
    started_at  INTEGER NOT NULL,
    body        TEXT    NOT NULL
);
CREATE INDEX IF NOT EXISTS runs_started ON runs (dataset, started_at);
"#;

const LEDGER_COLUMNS: &str = "dataset, file_identity, fingerprint, schema_version, row_count, \
     error_rows, ingested_at, status, failure_kind, failure_reason, claimed_by";

const SILVER_COLUMNS: &str = "seq, dataset, entity_key, event_ts, fields, flags, anomalies, \
     is_anomaly, bronze_seq, source_file, schema_version, processed_at";

const GOLD_COLUMNS: &str = "dataset, entity_key, granularity, window_start, metrics, \
     source_record_count, anomaly_count, flagged_count, input_digest, last_refreshed_at";

/// Table store persisted in a single SQLite database.
#[derive(Clone)]
pub struct SqliteTableStore {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteTableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteTableStore").finish_non_exhaustive()
    }
}

impl SqliteTableStore {
    /// Open (or create) a database file and apply migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get::<_, String>(0))?;
        debug!(path = %path.display(), "Opened table store");
        Self::init(conn)
    }

    /// A private in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(MIGRATIONS)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn call<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Task {
            message: e.to_string(),
        })?
    }
}

// ---------------------------------------------------------------------------
// Column helpers
// ---------------------------------------------------------------------------

fn ms(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn time_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let millis: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(millis)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, millis))
}

fn opt_time_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<i64>>(idx)? {
        Some(millis) => DateTime::from_timestamp_millis(millis)
            .map(Some)
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, millis)),
        None => Ok(None),
    }
}

fn json_at<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parsed_at<T: FromStr<Err = String>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    text.parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn opt_parsed_at<T: FromStr<Err = String>>(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<T>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(text) => text.parse().map(Some).map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into())
        }),
        None => Ok(None),
    }
}

fn opt_uuid_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(text) => Uuid::parse_str(&text)
            .map(Some)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))),
        None => Ok(None),
    }
}

fn ledger_from_row(row: &Row<'_>) -> rusqlite::Result<IngestedFileRecord> {
    Ok(IngestedFileRecord {
        dataset: row.get(0)?,
        file_identity: row.get(1)?,
        fingerprint: row.get(2)?,
        schema_version: row.get::<_, Option<i64>>(3)?.map(|v| v as u32),
        row_count: row.get::<_, i64>(4)? as u64,
        error_rows: row.get::<_, i64>(5)? as u64,
        ingested_at: time_at(row, 6)?,
        status: parsed_at(row, 7)?,
        failure_kind: opt_parsed_at(row, 8)?,
        failure_reason: row.get(9)?,
        claimed_by: opt_uuid_at(row, 10)?,
    })
}

fn bronze_from_row(row: &Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok(RawRecord {
        seq: row.get(0)?,
        dataset: row.get(1)?,
        source_file: row.get(2)?,
        row_index: row.get::<_, i64>(3)? as u64,
        schema_version: row.get::<_, i64>(4)? as u32,
        ingested_at: time_at(row, 5)?,
        payload: json_at(row, 6)?,
    })
}

fn silver_from_row(row: &Row<'_>) -> rusqlite::Result<CleanRecord> {
    Ok(CleanRecord {
        seq: row.get(0)?,
        dataset: row.get(1)?,
        entity_key: row.get(2)?,
        event_time: time_at(row, 3)?,
        fields: json_at(row, 4)?,
        flags: json_at(row, 5)?,
        anomalies: json_at(row, 6)?,
        is_anomaly: row.get(7)?,
        bronze_seq: row.get(8)?,
        source_file: row.get(9)?,
        schema_version: row.get::<_, i64>(10)? as u32,
        processed_at: time_at(row, 11)?,
    })
}

fn gold_from_row(row: &Row<'_>) -> rusqlite::Result<AggregateRow> {
    Ok(AggregateRow {
        dataset: row.get(0)?,
        entity_key: row.get(1)?,
        granularity: parsed_at(row, 2)?,
        window_start: time_at(row, 3)?,
        metrics: json_at(row, 4)?,
        source_record_count: row.get::<_, i64>(5)? as u64,
        anomaly_count: row.get::<_, i64>(6)? as u64,
        flagged_count: row.get::<_, i64>(7)? as u64,
        input_digest: row.get(8)?,
        last_refreshed_at: time_at(row, 9)?,
    })
}

fn window_from_row(row: &Row<'_>) -> rusqlite::Result<WindowStatus> {
    Ok(WindowStatus {
        key: WindowKey {
            dataset: row.get(0)?,
            entity_key: row.get(1)?,
            granularity: parsed_at(row, 2)?,
            window_start: time_at(row, 3)?,
        },
        state: parsed_at(row, 4)?,
        updated_at: time_at(row, 5)?,
    })
}

fn upsert_checkpoint(
    conn: &Connection,
    dataset: &str,
    stage: Stage,
    checkpoint: &Checkpoint,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO checkpoints (dataset, stage, position, watermark) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (dataset, stage) DO UPDATE
         SET position = excluded.position, watermark = excluded.watermark",
        params![
            dataset,
            stage.as_str(),
            checkpoint.position,
            checkpoint.watermark.map(ms)
        ],
    )?;
    Ok(())
}

fn upsert_window(
    conn: &Connection,
    key: &WindowKey,
    state: WindowState,
    at: DateTime<Utc>,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO windows (dataset, entity_key, granularity, window_start, state, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT (dataset, entity_key, granularity, window_start) DO UPDATE
         SET state = excluded.state, updated_at = excluded.updated_at",
        params![
            key.dataset,
            key.entity_key,
            key.granularity.as_str(),
            ms(key.window_start),
            state.as_str(),
            ms(at)
        ],
    )?;
    Ok(())
}

#[async_trait]
impl TableStore for SqliteTableStore {
    async fn schema_versions(&self, dataset: &str) -> Result<Vec<SchemaVersion>, StoreError> {
        let dataset = dataset.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT body FROM schema_versions WHERE dataset = ?1 ORDER BY version ASC",
            )?;
            let versions = stmt
                .query_map(params![dataset], |row| json_at::<SchemaVersion>(row, 0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(versions)
        })
        .await
    }

    async fn publish_schema(&self, version: &SchemaVersion) -> Result<bool, StoreError> {
        let version = version.clone();
        self.call(move |conn| {
            let body = serde_json::to_string(&version)?;
            let tx = conn.transaction()?;
            let latest: i64 = tx.query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_versions WHERE dataset = ?1",
                params![version.dataset],
                |row| row.get(0),
            )?;
            if i64::from(version.version) != latest + 1 {
                return Ok(false);
            }
            tx.execute(
                "INSERT INTO schema_versions (dataset, version, body, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    version.dataset,
                    i64::from(version.version),
                    body,
                    ms(version.created_at)
                ],
            )?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    async fn ledger_entry(
        &self,
        dataset: &str,
        file_identity: &str,
    ) -> Result<Option<IngestedFileRecord>, StoreError> {
        let (dataset, file) = (dataset.to_string(), file_identity.to_string());
        self.call(move |conn| {
            let entry = conn
                .query_row(
                    &format!(
                        "SELECT {LEDGER_COLUMNS} FROM ledger WHERE dataset = ?1 AND file_identity = ?2"
                    ),
                    params![dataset, file],
                    ledger_from_row,
                )
                .optional()?;
            Ok(entry)
        })
        .await
    }

    async fn ledger_insert(&self, entry: &IngestedFileRecord) -> Result<bool, StoreError> {
        let entry = entry.clone();
        self.call(move |conn| {
            let changed = conn.execute(
                &format!(
                    "INSERT OR IGNORE INTO ledger ({LEDGER_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
                ),
                params![
                    entry.dataset,
                    entry.file_identity,
                    entry.fingerprint,
                    entry.schema_version.map(i64::from),
                    entry.row_count as i64,
                    entry.error_rows as i64,
                    ms(entry.ingested_at),
                    entry.status.to_string(),
                    entry.failure_kind.map(|k| k.to_string()),
                    entry.failure_reason,
                    entry.claimed_by.map(|id| id.to_string()),
                ],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn ledger_swap(
        &self,
        expected: &IngestedFileRecord,
        next: &IngestedFileRecord,
    ) -> Result<bool, StoreError> {
        let (expected, next) = (expected.clone(), next.clone());
        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE ledger
                 SET fingerprint = ?3, schema_version = ?4, row_count = ?5, error_rows = ?6,
                     ingested_at = ?7, status = ?8, failure_kind = ?9, failure_reason = ?10,
                     claimed_by = ?11
                 WHERE dataset = ?1 AND file_identity = ?2
                   AND status = ?12 AND fingerprint = ?13 AND claimed_by IS ?14",
                params![
                    expected.dataset,
                    expected.file_identity,
                    next.fingerprint,
                    next.schema_version.map(i64::from),
                    next.row_count as i64,
                    next.error_rows as i64,
                    ms(next.ingested_at),
                    next.status.to_string(),
                    next.failure_kind.map(|k| k.to_string()),
                    next.failure_reason,
                    next.claimed_by.map(|id| id.to_string()),
                    expected.status.to_string(),
                    expected.fingerprint,
                    expected.claimed_by.map(|id| id.to_string()),
                ],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn ledger_entries(
        &self,
        dataset: &str,
        status: Option<FileStatus>,
    ) -> Result<Vec<IngestedFileRecord>, StoreError> {
        let dataset = dataset.to_string();
        let status = status.map(|s| s.to_string());
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {LEDGER_COLUMNS} FROM ledger
                 WHERE dataset = ?1 AND (?2 IS NULL OR status = ?2)
                 ORDER BY ingested_at ASC, file_identity ASC"
            ))?;
            let entries = stmt
                .query_map(params![dataset, status], ledger_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(entries)
        })
        .await
    }

    async fn commit_file(
        &self,
        committed: &IngestedFileRecord,
        rows: &[Payload],
    ) -> Result<bool, StoreError> {
        let committed = committed.clone();
        let rows = rows.to_vec();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let current = tx
                .query_row(
                    &format!(
                        "SELECT {LEDGER_COLUMNS} FROM ledger WHERE dataset = ?1 AND file_identity = ?2"
                    ),
                    params![committed.dataset, committed.file_identity],
                    ledger_from_row,
                )
                .optional()?;
            let claimable = matches!(
                &current,
                Some(c) if c.status == FileStatus::Pending
                    && c.fingerprint == committed.fingerprint
                    && c.claimed_by == committed.claimed_by
            );
            if !claimable {
                return Ok(false);
            }

            tx.execute(
                "DELETE FROM bronze WHERE dataset = ?1 AND source_file = ?2",
                params![committed.dataset, committed.file_identity],
            )?;
            let schema_version = i64::from(committed.schema_version.unwrap_or_default());
            {
                let mut insert = tx.prepare(
                    "INSERT INTO bronze
                     (dataset, source_file, row_index, schema_version, ingested_at, payload)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?;
                for (idx, payload) in rows.iter().enumerate() {
                    insert.execute(params![
                        committed.dataset,
                        committed.file_identity,
                        idx as i64,
                        schema_version,
                        ms(committed.ingested_at),
                        serde_json::to_string(payload)?,
                    ])?;
                }
            }
            tx.execute(
                "UPDATE ledger
                 SET status = ?3, schema_version = ?4, row_count = ?5, error_rows = ?6,
                     ingested_at = ?7, failure_kind = NULL, failure_reason = NULL
                 WHERE dataset = ?1 AND file_identity = ?2",
                params![
                    committed.dataset,
                    committed.file_identity,
                    FileStatus::Committed.to_string(),
                    schema_version,
                    rows.len() as i64,
                    committed.error_rows as i64,
                    ms(committed.ingested_at),
                ],
            )?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    async fn record_conflict(&self, conflict: &LedgerConflict) -> Result<bool, StoreError> {
        let c = conflict.clone();
        self.call(move |conn| {
            let changed = conn.execute(
                "INSERT OR IGNORE INTO ledger_conflicts
                 (dataset, file_identity, observed_fingerprint, committed_fingerprint,
                  detected_at, acknowledged)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    c.dataset,
                    c.file_identity,
                    c.observed_fingerprint,
                    c.committed_fingerprint,
                    ms(c.detected_at),
                    c.acknowledged,
                ],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn conflicts(
        &self,
        dataset: &str,
        include_acknowledged: bool,
    ) -> Result<Vec<LedgerConflict>, StoreError> {
        let dataset = dataset.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT dataset, file_identity, committed_fingerprint, observed_fingerprint,
                        detected_at, acknowledged
                 FROM ledger_conflicts
                 WHERE dataset = ?1 AND (?2 OR acknowledged = 0)
                 ORDER BY detected_at ASC",
            )?;
            let conflicts = stmt
                .query_map(params![dataset, include_acknowledged], |row| {
                    Ok(LedgerConflict {
                        dataset: row.get(0)?,
                        file_identity: row.get(1)?,
                        committed_fingerprint: row.get(2)?,
                        observed_fingerprint: row.get(3)?,
                        detected_at: time_at(row, 4)?,
                        acknowledged: row.get(5)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(conflicts)
        })
        .await
    }

    async fn acknowledge_conflict(
        &self,
        dataset: &str,
        file_identity: &str,
    ) -> Result<usize, StoreError> {
        let (dataset, file) = (dataset.to_string(), file_identity.to_string());
        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE ledger_conflicts SET acknowledged = 1
                 WHERE dataset = ?1 AND file_identity = ?2 AND acknowledged = 0",
                params![dataset, file],
            )?;
            Ok(changed)
        })
        .await
    }

    async fn bronze_after(
        &self,
        dataset: &str,
        after_seq: i64,
        limit: usize,
    ) -> Result<Vec<RawRecord>, StoreError> {
        let dataset = dataset.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT seq, dataset, source_file, row_index, schema_version, ingested_at, payload
                 FROM bronze WHERE dataset = ?1 AND seq > ?2 ORDER BY seq ASC LIMIT ?3",
            )?;
            let rows = stmt
                .query_map(params![dataset, after_seq, limit as i64], bronze_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn bronze_count(&self, dataset: &str) -> Result<u64, StoreError> {
        let dataset = dataset.to_string();
        self.call(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM bronze WHERE dataset = ?1",
                params![dataset],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
        .await
    }

    async fn checkpoint(&self, dataset: &str, stage: Stage) -> Result<Checkpoint, StoreError> {
        let dataset = dataset.to_string();
        self.call(move |conn| {
            let checkpoint = conn
                .query_row(
                    "SELECT position, watermark FROM checkpoints WHERE dataset = ?1 AND stage = ?2",
                    params![dataset, stage.as_str()],
                    |row| {
                        Ok(Checkpoint {
                            position: row.get(0)?,
                            watermark: opt_time_at(row, 1)?,
                        })
                    },
                )
                .optional()?;
            Ok(checkpoint.unwrap_or_default())
        })
        .await
    }

    async fn set_checkpoint(
        &self,
        dataset: &str,
        stage: Stage,
        checkpoint: &Checkpoint,
    ) -> Result<(), StoreError> {
        let dataset = dataset.to_string();
        let checkpoint = checkpoint.clone();
        self.call(move |conn| Ok(upsert_checkpoint(conn, &dataset, stage, &checkpoint)?))
            .await
    }

    async fn silver_existing(
        &self,
        dataset: &str,
        keys: &[RecordKey],
    ) -> Result<HashMap<RecordKey, i64>, StoreError> {
        let dataset = dataset.to_string();
        let keys = keys.to_vec();
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT bronze_seq FROM silver
                 WHERE dataset = ?1 AND entity_key = ?2 AND event_ts = ?3",
            )?;
            let mut found = HashMap::new();
            for key in keys {
                let seq: Option<i64> = stmt
                    .query_row(
                        params![dataset, key.entity_key, ms(key.event_time)],
                        |row| row.get(0),
                    )
                    .optional()?;
                if let Some(seq) = seq {
                    found.insert(key, seq);
                }
            }
            Ok(found)
        })
        .await
    }

    async fn silver_recent(
        &self,
        dataset: &str,
        entity_key: &str,
        limit: usize,
    ) -> Result<Vec<CleanRecord>, StoreError> {
        let (dataset, entity) = (dataset.to_string(), entity_key.to_string());
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SILVER_COLUMNS} FROM silver
                 WHERE dataset = ?1 AND entity_key = ?2
                 ORDER BY event_ts DESC LIMIT ?3"
            ))?;
            let mut rows = stmt
                .query_map(params![dataset, entity, limit as i64], silver_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.reverse();
            Ok(rows)
        })
        .await
    }

    async fn silver_last_arrival(
        &self,
        dataset: &str,
        entity_key: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let (dataset, entity) = (dataset.to_string(), entity_key.to_string());
        self.call(move |conn| {
            let latest = conn
                .query_row(
                    "SELECT event_ts FROM silver WHERE dataset = ?1 AND entity_key = ?2
                     ORDER BY bronze_seq DESC LIMIT 1",
                    params![dataset, entity],
                    |row| time_at(row, 0),
                )
                .optional()?;
            Ok(latest)
        })
        .await
    }

    async fn commit_silver(&self, batch: &SilverBatch) -> Result<(), StoreError> {
        let batch = batch.clone();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut supersede = tx.prepare(
                    "INSERT OR REPLACE INTO superseded
                     (dataset, bronze_seq, superseded_by, entity_key, event_ts)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                for s in &batch.supersessions {
                    supersede.execute(params![
                        s.dataset,
                        s.bronze_seq,
                        s.superseded_by,
                        s.entity_key,
                        ms(s.event_time)
                    ])?;
                }
                let mut upsert = tx.prepare(
                    "INSERT OR REPLACE INTO silver
                     (dataset, entity_key, event_ts, fields, flags, anomalies, is_anomaly,
                      bronze_seq, source_file, schema_version, processed_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                )?;
                for r in &batch.records {
                    upsert.execute(params![
                        r.dataset,
                        r.entity_key,
                        ms(r.event_time),
                        serde_json::to_string(&r.fields)?,
                        serde_json::to_string(&r.flags)?,
                        serde_json::to_string(&r.anomalies)?,
                        r.is_anomaly,
                        r.bronze_seq,
                        r.source_file,
                        i64::from(r.schema_version),
                        ms(r.processed_at),
                    ])?;
                }
            }
            upsert_checkpoint(&tx, &batch.dataset, Stage::Quality, &batch.checkpoint)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn silver_after(
        &self,
        dataset: &str,
        after_seq: i64,
        limit: usize,
    ) -> Result<Vec<CleanRecord>, StoreError> {
        let dataset = dataset.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SILVER_COLUMNS} FROM silver
                 WHERE dataset = ?1 AND seq > ?2 ORDER BY seq ASC LIMIT ?3"
            ))?;
            let rows = stmt
                .query_map(params![dataset, after_seq, limit as i64], silver_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn silver_window(
        &self,
        dataset: &str,
        entity_key: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<CleanRecord>, StoreError> {
        let (dataset, entity) = (dataset.to_string(), entity_key.to_string());
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SILVER_COLUMNS} FROM silver s
                 WHERE s.dataset = ?1 AND s.entity_key = ?2
                   AND s.event_ts >= ?3 AND s.event_ts < ?4
                   AND NOT EXISTS (
                       SELECT 1 FROM late_rejections r
                       WHERE r.dataset = s.dataset AND r.silver_seq = s.seq
                   )
                 ORDER BY s.event_ts ASC, s.seq ASC"
            ))?;
            let rows = stmt
                .query_map(
                    params![dataset, entity, ms(start), ms(end)],
                    silver_from_row,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn silver_record(
        &self,
        dataset: &str,
        key: &RecordKey,
    ) -> Result<Option<CleanRecord>, StoreError> {
        let dataset = dataset.to_string();
        let key = key.clone();
        self.call(move |conn| {
            let record = conn
                .query_row(
                    &format!(
                        "SELECT {SILVER_COLUMNS} FROM silver
                         WHERE dataset = ?1 AND entity_key = ?2 AND event_ts = ?3"
                    ),
                    params![dataset, key.entity_key, ms(key.event_time)],
                    silver_from_row,
                )
                .optional()?;
            Ok(record)
        })
        .await
    }

    async fn silver_count(&self, dataset: &str) -> Result<u64, StoreError> {
        let dataset = dataset.to_string();
        self.call(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM silver WHERE dataset = ?1",
                params![dataset],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
        .await
    }

    async fn supersessions(&self, dataset: &str) -> Result<Vec<Supersession>, StoreError> {
        let dataset = dataset.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT dataset, bronze_seq, superseded_by, entity_key, event_ts
                 FROM superseded WHERE dataset = ?1 ORDER BY bronze_seq ASC",
            )?;
            let rows = stmt
                .query_map(params![dataset], |row| {
                    Ok(Supersession {
                        dataset: row.get(0)?,
                        bronze_seq: row.get(1)?,
                        superseded_by: row.get(2)?,
                        entity_key: row.get(3)?,
                        event_time: time_at(row, 4)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn windows(
        &self,
        dataset: &str,
        range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> Result<Vec<WindowStatus>, StoreError> {
        let dataset = dataset.to_string();
        let (from, to) = match range {
            Some((start, end)) => (Some(ms(start)), Some(ms(end))),
            None => (None, None),
        };
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT dataset, entity_key, granularity, window_start, state, updated_at
                 FROM windows
                 WHERE dataset = ?1
                   AND (?2 IS NULL OR window_start >= ?2)
                   AND (?3 IS NULL OR window_start < ?3)
                 ORDER BY entity_key ASC, granularity ASC, window_start ASC",
            )?;
            let rows = stmt
                .query_map(params![dataset, from, to], window_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn window_status(&self, key: &WindowKey) -> Result<Option<WindowStatus>, StoreError> {
        let key = key.clone();
        self.call(move |conn| {
            let status = conn
                .query_row(
                    "SELECT dataset, entity_key, granularity, window_start, state, updated_at
                     FROM windows
                     WHERE dataset = ?1 AND entity_key = ?2 AND granularity = ?3
                       AND window_start = ?4",
                    params![
                        key.dataset,
                        key.entity_key,
                        key.granularity.as_str(),
                        ms(key.window_start)
                    ],
                    window_from_row,
                )
                .optional()?;
            Ok(status)
        })
        .await
    }

    async fn set_window_state(&self, status: &WindowStatus) -> Result<(), StoreError> {
        let status = status.clone();
        self.call(move |conn| {
            Ok(upsert_window(
                conn,
                &status.key,
                status.state,
                status.updated_at,
            )?)
        })
        .await
    }

    async fn commit_window_marks(
        &self,
        dataset: &str,
        dirty: &[WindowKey],
        rejections: &[LateRejection],
        checkpoint: &Checkpoint,
    ) -> Result<(), StoreError> {
        let dataset = dataset.to_string();
        let dirty = dirty.to_vec();
        let rejections = rejections.to_vec();
        let checkpoint = checkpoint.clone();
        self.call(move |conn| {
            let now = Utc::now();
            let tx = conn.transaction()?;
            for key in &dirty {
                upsert_window(&tx, key, WindowState::Dirty, now)?;
            }
            {
                let mut reject = tx.prepare(
                    "INSERT OR IGNORE INTO late_rejections
                     (dataset, silver_seq, entity_key, window_start, event_ts, rejected_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?;
                for r in &rejections {
                    reject.execute(params![
                        r.dataset,
                        r.silver_seq,
                        r.entity_key,
                        ms(r.window_start),
                        ms(r.event_time),
                        ms(r.rejected_at)
                    ])?;
                }
            }
            upsert_checkpoint(&tx, &dataset, Stage::Aggregation, &checkpoint)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn commit_refresh(&self, row: &AggregateRow) -> Result<(), StoreError> {
        let row = row.clone();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                &format!(
                    "INSERT OR REPLACE INTO gold ({GOLD_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                ),
                params![
                    row.dataset,
                    row.entity_key,
                    row.granularity.as_str(),
                    ms(row.window_start),
                    serde_json::to_string(&row.metrics)?,
                    row.source_record_count as i64,
                    row.anomaly_count as i64,
                    row.flagged_count as i64,
                    row.input_digest,
                    ms(row.last_refreshed_at),
                ],
            )?;
            let key = WindowKey {
                dataset: row.dataset.clone(),
                entity_key: row.entity_key.clone(),
                granularity: row.granularity,
                window_start: row.window_start,
            };
            upsert_window(&tx, &key, WindowState::Fresh, row.last_refreshed_at)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn gold_row(&self, key: &WindowKey) -> Result<Option<AggregateRow>, StoreError> {
        let key = key.clone();
        self.call(move |conn| {
            let row = conn
                .query_row(
                    &format!(
                        "SELECT {GOLD_COLUMNS} FROM gold
                         WHERE dataset = ?1 AND entity_key = ?2 AND granularity = ?3
                           AND window_start = ?4"
                    ),
                    params![
                        key.dataset,
                        key.entity_key,
                        key.granularity.as_str(),
                        ms(key.window_start)
                    ],
                    gold_from_row,
                )
                .optional()?;
            Ok(row)
        })
        .await
    }

    async fn gold_rows(
        &self,
        dataset: &str,
        entity_key: Option<&str>,
        granularity: Option<Granularity>,
    ) -> Result<Vec<AggregateRow>, StoreError> {
        let dataset = dataset.to_string();
        let entity = entity_key.map(str::to_string);
        let granularity = granularity.map(|g| g.as_str());
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {GOLD_COLUMNS} FROM gold
                 WHERE dataset = ?1
                   AND (?2 IS NULL OR entity_key = ?2)
                   AND (?3 IS NULL OR granularity = ?3)
                 ORDER BY entity_key ASC, granularity ASC, window_start ASC"
            ))?;
            let rows = stmt
                .query_map(params![dataset, entity, granularity], gold_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn late_rejections(&self, dataset: &str) -> Result<Vec<LateRejection>, StoreError> {
        let dataset = dataset.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT dataset, silver_seq, entity_key, window_start, event_ts, rejected_at
                 FROM late_rejections WHERE dataset = ?1 ORDER BY silver_seq ASC",
            )?;
            let rows = stmt
                .query_map(params![dataset], |row| {
                    Ok(LateRejection {
                        dataset: row.get(0)?,
                        silver_seq: row.get(1)?,
                        entity_key: row.get(2)?,
                        window_start: time_at(row, 3)?,
                        event_time: time_at(row, 4)?,
                        rejected_at: time_at(row, 5)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn save_run(&self, run: &PipelineRun) -> Result<(), StoreError> {
        let run = run.clone();
        self.call(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO runs (run_id, dataset, started_at, body)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    run.run_id.to_string(),
                    run.dataset,
                    ms(run.started_at),
                    serde_json::to_string(&run)?
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn runs(
        &self,
        dataset: Option<&str>,
        limit: usize,
    ) -> Result<Vec<PipelineRun>, StoreError> {
        let dataset = dataset.map(str::to_string);
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT body FROM runs WHERE (?1 IS NULL OR dataset = ?1)
                 ORDER BY started_at DESC, rowid DESC LIMIT ?2",
            )?;
            let runs = stmt
                .query_map(params![dataset, limit as i64], |row| {
                    json_at::<PipelineRun>(row, 0)
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(runs)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldDef, FieldType};
    use crate::types::{MetricSummary, QualityFlag};
    use chrono::TimeZone;
    use serde_json::json;
    use std::collections::{BTreeMap, BTreeSet};

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, 0).unwrap()
    }

    fn payload(v: serde_json::Value) -> Payload {
        v.as_object().cloned().unwrap()
    }

    fn clean(entity: &str, t: DateTime<Utc>, bronze_seq: i64, value: f64) -> CleanRecord {
        CleanRecord {
            seq: 0,
            dataset: "sensors".into(),
            entity_key: entity.into(),
            event_time: t,
            fields: payload(json!({"value": value})),
            flags: BTreeSet::new(),
            anomalies: Vec::new(),
            is_anomaly: false,
            bronze_seq,
            source_file: "a.csv".into(),
            schema_version: 1,
            processed_at: Utc::now(),
        }
    }

    fn version(n: u32) -> SchemaVersion {
        SchemaVersion {
            dataset: "sensors".into(),
            version: n,
            fields: vec![FieldDef::new("value", FieldType::Float, false)],
            parent_version: n.checked_sub(1).filter(|p| *p > 0),
            changes: Vec::new(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_publish_schema_is_compare_and_set() {
        let store = SqliteTableStore::open_in_memory().unwrap();
        assert!(store.publish_schema(&version(1)).await.unwrap());
        assert!(!store.publish_schema(&version(1)).await.unwrap());
        assert!(!store.publish_schema(&version(3)).await.unwrap());
        assert!(store.publish_schema(&version(2)).await.unwrap());
        let versions = store.schema_versions("sensors").await.unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[1].version, 2);
    }

    #[tokio::test]
    async fn test_ledger_insert_and_swap() {
        let store = SqliteTableStore::open_in_memory().unwrap();
        let run = Uuid::new_v4();
        let entry = IngestedFileRecord::pending("sensors", "a.csv", "fp1", run);
        assert!(store.ledger_insert(&entry).await.unwrap());
        assert!(!store.ledger_insert(&entry).await.unwrap());

        let mut failed = entry.clone();
        failed.status = FileStatus::Failed;
        failed.failure_reason = Some("bad".into());
        assert!(store.ledger_swap(&entry, &failed).await.unwrap());
        // The expected state no longer matches.
        assert!(!store.ledger_swap(&entry, &failed).await.unwrap());

        let stored = store.ledger_entry("sensors", "a.csv").await.unwrap().unwrap();
        assert_eq!(stored.status, FileStatus::Failed);
        assert_eq!(stored.claimed_by, Some(run));
        assert_eq!(
            store
                .ledger_entries("sensors", Some(FileStatus::Failed))
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_commit_file_replaces_rows_once() {
        let store = SqliteTableStore::open_in_memory().unwrap();
        let entry = IngestedFileRecord::pending("sensors", "a.csv", "fp1", Uuid::new_v4());
        store.ledger_insert(&entry).await.unwrap();

        let mut committed = entry.clone();
        committed.schema_version = Some(1);
        let rows = vec![payload(json!({"v": 1})), payload(json!({"v": 2}))];
        assert!(store.commit_file(&committed, &rows).await.unwrap());
        assert!(!store.commit_file(&committed, &rows).await.unwrap());
        assert_eq!(store.bronze_count("sensors").await.unwrap(), 2);

        let stored = store.ledger_entry("sensors", "a.csv").await.unwrap().unwrap();
        assert_eq!(stored.status, FileStatus::Committed);
        assert_eq!(stored.row_count, 2);

        let bronze = store.bronze_after("sensors", 0, 10).await.unwrap();
        assert_eq!(bronze[0].row_index, 0);
        assert_eq!(bronze[1].payload["v"], json!(2));
    }

    #[tokio::test]
    async fn test_commit_file_rejects_foreign_claim() {
        let store = SqliteTableStore::open_in_memory().unwrap();
        let entry = IngestedFileRecord::pending("sensors", "a.csv", "fp1", Uuid::new_v4());
        store.ledger_insert(&entry).await.unwrap();
        let other = IngestedFileRecord::pending("sensors", "a.csv", "fp1", Uuid::new_v4());
        assert!(!store.commit_file(&other, &[]).await.unwrap());
    }

    #[tokio::test]
    async fn test_silver_upsert_reassigns_seq() {
        let store = SqliteTableStore::open_in_memory().unwrap();
        let batch = SilverBatch {
            dataset: "sensors".into(),
            records: vec![clean("S1", at(10, 0), 1, 20.0), clean("S1", at(10, 5), 2, 21.0)],
            supersessions: Vec::new(),
            checkpoint: Checkpoint {
                position: 2,
                watermark: None,
            },
        };
        store.commit_silver(&batch).await.unwrap();
        let first = store.silver_after("sensors", 0, 10).await.unwrap();
        assert_eq!(first.len(), 2);

        let rewrite = SilverBatch {
            dataset: "sensors".into(),
            records: vec![clean("S1", at(10, 0), 3, 25.0)],
            supersessions: vec![Supersession {
                dataset: "sensors".into(),
                bronze_seq: 1,
                superseded_by: 3,
                entity_key: "S1".into(),
                event_time: at(10, 0),
            }],
            checkpoint: Checkpoint {
                position: 3,
                watermark: None,
            },
        };
        store.commit_silver(&rewrite).await.unwrap();
        assert_eq!(store.silver_count("sensors").await.unwrap(), 2);
        let tail = store.silver_after("sensors", first[1].seq, 10).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].bronze_seq, 3);
        assert_eq!(store.supersessions("sensors").await.unwrap().len(), 1);
        assert_eq!(
            store
                .checkpoint("sensors", Stage::Quality)
                .await
                .unwrap()
                .position,
            3
        );
        assert_eq!(
            store.silver_last_arrival("sensors", "S1").await.unwrap(),
            Some(at(10, 0))
        );
    }

    #[tokio::test]
    async fn test_window_marks_and_refresh() {
        let store = SqliteTableStore::open_in_memory().unwrap();
        let mut record = clean("S1", at(10, 0), 1, 20.0);
        record.flags.insert(QualityFlag::OutOfRange);
        store
            .commit_silver(&SilverBatch {
                dataset: "sensors".into(),
                records: vec![record, clean("S1", at(10, 30), 2, 22.0)],
                supersessions: Vec::new(),
                checkpoint: Checkpoint::default(),
            })
            .await
            .unwrap();
        let rows = store.silver_after("sensors", 0, 10).await.unwrap();

        let key = WindowKey::containing("sensors", "S1", Granularity::Hour, at(10, 0));
        let rejection = LateRejection {
            dataset: "sensors".into(),
            silver_seq: rows[1].seq,
            entity_key: "S1".into(),
            window_start: key.window_start,
            event_time: at(10, 30),
            rejected_at: Utc::now(),
        };
        store
            .commit_window_marks(
                "sensors",
                std::slice::from_ref(&key),
                &[rejection],
                &Checkpoint {
                    position: rows[1].seq,
                    watermark: Some(at(10, 30)),
                },
            )
            .await
            .unwrap();
        let status = store.window_status(&key).await.unwrap().unwrap();
        assert_eq!(status.state, WindowState::Dirty);
        let visible = store
            .silver_window("sensors", "S1", key.window_start, key.window_end())
            .await
            .unwrap();
        assert_eq!(visible.len(), 1);
        assert!(visible[0].has_flag(QualityFlag::OutOfRange));

        let row = AggregateRow {
            dataset: "sensors".into(),
            entity_key: "S1".into(),
            granularity: Granularity::Hour,
            window_start: key.window_start,
            metrics: BTreeMap::from([(
                "value".to_string(),
                MetricSummary {
                    count: 1,
                    sum: 20.0,
                    min: 20.0,
                    max: 20.0,
                    mean: 20.0,
                },
            )]),
            source_record_count: 1,
            anomaly_count: 0,
            flagged_count: 1,
            input_digest: "d".into(),
            last_refreshed_at: at(11, 0),
        };
        store.commit_refresh(&row).await.unwrap();
        assert_eq!(store.gold_row(&key).await.unwrap().unwrap(), row);
        assert_eq!(
            store.window_status(&key).await.unwrap().unwrap().state,
            WindowState::Fresh
        );
        assert_eq!(
            store
                .gold_rows("sensors", Some("S1"), Some(Granularity::Day))
                .await
                .unwrap()
                .len(),
            0
        );
        assert_eq!(store.late_rejections("sensors").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_runs_most_recent_first() {
        let store = SqliteTableStore::open_in_memory().unwrap();
        let mut first = PipelineRun::new("sensors");
        first.started_at = at(1, 0);
        let mut second = PipelineRun::new("sensors");
        second.started_at = at(2, 0);
        store.save_run(&first).await.unwrap();
        store.save_run(&second).await.unwrap();
        store.save_run(&PipelineRun::new("logs")).await.unwrap();

        let runs = store.runs(Some("sensors"), 10).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].run_id, second.run_id);
        assert_eq!(store.runs(None, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_open_on_disk_persists() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("strata.db");
        {
            let store = SqliteTableStore::open(&path).unwrap();
            store
                .set_checkpoint(
                    "sensors",
                    Stage::Ingestion,
                    &Checkpoint {
                        position: 7,
                        watermark: Some(at(3, 0)),
                    },
                )
                .await
                .unwrap();
        }
        let store = SqliteTableStore::open(&path).unwrap();
        let checkpoint = store.checkpoint("sensors", Stage::Ingestion).await.unwrap();
        assert_eq!(checkpoint.position, 7);
        assert_eq!(checkpoint.watermark, Some(at(3, 0)));
    }
}
