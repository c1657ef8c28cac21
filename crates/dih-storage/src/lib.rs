//! Durable donation stores + HTTP fetch utilities for the hub.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use dih_core::DonationRecord;
use rand::Rng;
use reqwest::StatusCode;
use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, ToSql};
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "dih-storage";

/// Idempotent per-window store: one SQLite file per fetch window.
///
/// Insertion is a mapping-union keyed by the record's natural `id`, so
/// page retries and whole-window re-runs are safe to repeat.
#[derive(Debug)]
pub struct PartitionStore {
    conn: Connection,
    path: PathBuf,
}

impl PartitionStore {
    /// Opens (creating if absent) the partition file. Fails fast when the
    /// storage medium is unwritable.
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating partition directory {}", parent.display()))?;
        }
        let conn = Connection::open(&path)
            .with_context(|| format!("opening partition store {}", path.display()))?;
        if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
            warn!(path = %path.display(), "failed to enable WAL mode: {err}");
        }
        Ok(Self { conn, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn ensure_schema(&self) -> anyhow::Result<()> {
        self.conn
            .execute(
                "CREATE TABLE IF NOT EXISTS donations (
                    id INTEGER PRIMARY KEY,
                    amount REAL,
                    currency TEXT,
                    date TEXT,
                    comment TEXT,
                    source TEXT
                )",
                [],
            )
            .with_context(|| format!("creating donations table in {}", self.path.display()))?;
        Ok(())
    }

    /// Inserts records by natural key, silently ignoring ids that are
    /// already present. Returns the count of truly new rows so callers can
    /// log real progress.
    pub fn save(&mut self, records: &[DonationRecord]) -> anyhow::Result<usize> {
        let tx = self
            .conn
            .transaction()
            .context("opening partition save transaction")?;
        let mut inserted = 0usize;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT OR IGNORE INTO donations (id, amount, currency, date, comment, source)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )
                .context("preparing partition insert")?;
            for record in records {
                inserted += stmt
                    .execute(params![
                        record.id,
                        record.amount,
                        record.currency,
                        record.date,
                        record.comment,
                        record.source,
                    ])
                    .with_context(|| format!("inserting donation id {}", record.id))?;
            }
        }
        tx.commit().context("committing partition save")?;
        Ok(inserted)
    }

    /// Full contents of the partition, consolidation input.
    pub fn load_all(&self) -> anyhow::Result<Vec<DonationRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, amount, currency, date, comment, source FROM donations ORDER BY id")
            .context("preparing partition select")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(DonationRecord {
                    id: row.get(0)?,
                    amount: row.get::<_, Option<f64>>(1)?.unwrap_or(0.0),
                    currency: row.get(2)?,
                    date: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                    comment: row.get(4)?,
                    category: None,
                    source: row.get(5)?,
                })
            })
            .context("querying partition rows")?
            .collect::<Result<Vec<_>, _>>()
            .context("decoding partition rows")?;
        Ok(rows)
    }

    pub fn count(&self) -> anyhow::Result<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM donations", [], |row| row.get(0))
            .context("counting partition rows")
    }
}

/// A dynamically typed SQLite cell, used when consolidating inputs whose
/// column sets are only known at runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl From<ValueRef<'_>> for CellValue {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => CellValue::Null,
            ValueRef::Integer(v) => CellValue::Integer(v),
            ValueRef::Real(v) => CellValue::Real(v),
            ValueRef::Text(text) => CellValue::Text(String::from_utf8_lossy(text).into_owned()),
            // Donation stores never carry blobs.
            ValueRef::Blob(_) => CellValue::Null,
        }
    }
}

impl From<Option<String>> for CellValue {
    fn from(value: Option<String>) -> Self {
        value.map(CellValue::Text).unwrap_or(CellValue::Null)
    }
}

impl ToSql for CellValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            CellValue::Null => ToSqlOutput::Owned(Value::Null),
            CellValue::Integer(v) => ToSqlOutput::Owned(Value::Integer(*v)),
            CellValue::Real(v) => ToSqlOutput::Owned(Value::Real(*v)),
            CellValue::Text(v) => ToSqlOutput::Borrowed(ValueRef::Text(v.as_bytes())),
        })
    }
}

/// SQL column type used when the canonical schema grows a new column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Real,
}

impl ColumnKind {
    fn sql(self) -> &'static str {
        match self {
            ColumnKind::Text => "TEXT",
            ColumnKind::Real => "REAL",
        }
    }
}

fn ensure_safe_identifier(name: &str) -> anyhow::Result<()> {
    let mut chars = name.chars();
    let head_ok = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if !head_ok || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        bail!("refusing unsafe column name {name:?}");
    }
    Ok(())
}

/// The unified dataset: superset of all partition and batch columns, with
/// a `record_key` uniqueness discipline that makes consolidation re-runs
/// idempotent.
#[derive(Debug)]
pub struct CanonicalStore {
    conn: Connection,
    path: PathBuf,
}

impl CanonicalStore {
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating master directory {}", parent.display()))?;
        }
        let conn = Connection::open(&path)
            .with_context(|| format!("opening canonical store {}", path.display()))?;
        if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
            warn!(path = %path.display(), "failed to enable WAL mode: {err}");
        }
        Ok(Self { conn, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn ensure_schema(&self) -> anyhow::Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS donations (
                    record_key TEXT,
                    id INTEGER,
                    amount REAL,
                    currency TEXT,
                    date TEXT,
                    comment TEXT,
                    source TEXT,
                    category TEXT
                );
                CREATE UNIQUE INDEX IF NOT EXISTS idx_record_key ON donations (record_key);",
            )
            .with_context(|| format!("creating canonical schema in {}", self.path.display()))?;
        Ok(())
    }

    /// Current column names of the donations table, in declaration order.
    pub fn columns(&self) -> anyhow::Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("PRAGMA table_info(donations)")
            .context("preparing table_info pragma")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .context("querying table_info")?
            .collect::<Result<Vec<_>, _>>()
            .context("decoding table_info")?;
        Ok(names)
    }

    /// Adds a column if absent; pre-existing rows default to NULL. Returns
    /// whether the column was added.
    pub fn ensure_column(&self, name: &str, kind: ColumnKind) -> anyhow::Result<bool> {
        if self.columns()?.iter().any(|column| column == name) {
            return Ok(false);
        }
        ensure_safe_identifier(name)?;
        self.conn
            .execute(
                &format!("ALTER TABLE donations ADD COLUMN {name} {}", kind.sql()),
                [],
            )
            .with_context(|| format!("adding column {name}"))?;
        info!(column = name, "canonical schema grew a new column");
        Ok(true)
    }

    /// Appends rows under the given column set, ignoring rows whose
    /// `record_key` is already present. Returns the count of truly new rows.
    pub fn append_rows(
        &mut self,
        columns: &[String],
        rows: &[Vec<CellValue>],
    ) -> anyhow::Result<usize> {
        if columns.is_empty() {
            return Ok(0);
        }
        for column in columns {
            ensure_safe_identifier(column)?;
        }
        let placeholders = (1..=columns.len())
            .map(|index| format!("?{index}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT OR IGNORE INTO donations ({}) VALUES ({placeholders})",
            columns.join(", ")
        );

        let tx = self
            .conn
            .transaction()
            .context("opening canonical append transaction")?;
        let mut inserted = 0usize;
        {
            let mut stmt = tx.prepare(&sql).context("preparing canonical insert")?;
            for row in rows {
                if row.len() != columns.len() {
                    bail!(
                        "row arity {} does not match column arity {}",
                        row.len(),
                        columns.len()
                    );
                }
                inserted += stmt
                    .execute(rusqlite::params_from_iter(row.iter()))
                    .context("inserting canonical row")?;
            }
        }
        tx.commit().context("committing canonical append")?;
        Ok(inserted)
    }

    /// Secondary indexes that bound query latency as the store grows. The
    /// short-date expression index serves downstream day-range queries.
    pub fn ensure_indexes(&self) -> anyhow::Result<()> {
        self.conn
            .execute_batch(
                "CREATE INDEX IF NOT EXISTS idx_date ON donations (date);
                 CREATE INDEX IF NOT EXISTS idx_source ON donations (source);
                 CREATE INDEX IF NOT EXISTS idx_category ON donations (category);
                 CREATE INDEX IF NOT EXISTS idx_short_date ON donations (substr(date, 1, 10));",
            )
            .context("creating canonical indexes")?;
        Ok(())
    }

    /// Fills NULL categories for one source with its declared default label.
    pub fn apply_default_category(
        &self,
        source: &str,
        default_category: &str,
    ) -> anyhow::Result<usize> {
        self.conn
            .execute(
                "UPDATE donations SET category = ?1 WHERE source = ?2 AND category IS NULL",
                params![default_category, source],
            )
            .with_context(|| format!("applying default category for {source}"))
    }

    /// Legacy masters carried provenance under `foundation_name`. Copies
    /// those values into `source` where `source` is NULL and reports the
    /// migrated row count; a no-op when the legacy column is absent.
    pub fn migrate_foundation_name(&self) -> anyhow::Result<usize> {
        if !self
            .columns()?
            .iter()
            .any(|column| column == "foundation_name")
        {
            return Ok(0);
        }
        let migrated = self
            .conn
            .execute(
                "UPDATE donations SET source = foundation_name
                 WHERE source IS NULL AND foundation_name IS NOT NULL",
                [],
            )
            .context("unifying foundation_name into source")?;
        if migrated > 0 {
            info!(migrated, "migrated legacy foundation_name provenance into source");
        }
        Ok(migrated)
    }

    pub fn count(&self) -> anyhow::Result<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM donations", [], |row| row.get(0))
            .context("counting canonical rows")
    }

    pub fn count_for_source(&self, source: &str) -> anyhow::Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM donations WHERE source = ?1",
                params![source],
                |row| row.get(0),
            )
            .with_context(|| format!("counting rows for source {source}"))
    }

    /// NULL count for one column, used for post-merge validation logging.
    pub fn null_count(&self, column: &str) -> anyhow::Result<i64> {
        ensure_safe_identifier(column)?;
        self.conn
            .query_row(
                &format!("SELECT COUNT(*) FROM donations WHERE {column} IS NULL"),
                [],
                |row| row.get(0),
            )
            .with_context(|| format!("counting NULL {column} rows"))
    }

    /// Single-cell lookup by record key, mostly useful in tests and spot
    /// checks.
    pub fn cell_for_key(&self, record_key: &str, column: &str) -> anyhow::Result<Option<CellValue>> {
        ensure_safe_identifier(column)?;
        self.conn
            .query_row(
                &format!("SELECT {column} FROM donations WHERE record_key = ?1"),
                params![record_key],
                |row| Ok(CellValue::from(row.get_ref(0)?)),
            )
            .optional()
            .with_context(|| format!("selecting {column} for {record_key}"))
    }
}

/// Failure classes of the remote reporting API, each with its own recovery
/// policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Throttled,
    GatewayTimeout,
    Other,
    Transport,
}

impl FailureClass {
    pub fn from_status_code(code: u16) -> Self {
        match code {
            429 => FailureClass::Throttled,
            504 => FailureClass::GatewayTimeout,
            _ => FailureClass::Other,
        }
    }
}

/// `None` means success; otherwise the failure class driving the retry
/// delay.
pub fn classify_status(status: StatusCode) -> Option<FailureClass> {
    if status.is_success() {
        None
    } else {
        Some(FailureClass::from_status_code(status.as_u16()))
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("transport failure: {0}")]
    Transport(#[from] reqwest::Error),
}

impl FetchError {
    pub fn class(&self) -> FailureClass {
        match self {
            FetchError::HttpStatus { status, .. } => FailureClass::from_status_code(*status),
            FetchError::Transport(_) => FailureClass::Transport,
        }
    }
}

/// An inclusive jittered delay range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayRange {
    pub min: Duration,
    pub max: Duration,
}

impl DelayRange {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }

    pub fn sample(&self) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        let millis = rand::thread_rng()
            .gen_range(self.min.as_millis() as u64..=self.max.as_millis() as u64);
        Duration::from_millis(millis)
    }

    pub fn contains(&self, delay: Duration) -> bool {
        delay >= self.min && delay <= self.max
    }
}

/// Per-class retry delays. Jittered where the remote is sensitive to
/// synchronized clients, fixed elsewhere.
#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    /// Pause after each successfully persisted page.
    pub success_pause: DelayRange,
    /// Pause after a throttling signal.
    pub throttle_pause: DelayRange,
    pub gateway_timeout_pause: Duration,
    pub failure_pause: Duration,
    pub transport_pause: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            success_pause: DelayRange::new(Duration::from_millis(200), Duration::from_millis(600)),
            throttle_pause: DelayRange::new(Duration::from_secs(45), Duration::from_secs(90)),
            gateway_timeout_pause: Duration::from_secs(15),
            failure_pause: Duration::from_secs(30),
            transport_pause: Duration::from_secs(10),
        }
    }
}

impl BackoffConfig {
    pub fn delay_for(&self, class: FailureClass) -> Duration {
        match class {
            FailureClass::Throttled => self.throttle_pause.sample(),
            FailureClass::GatewayTimeout => self.gateway_timeout_pause,
            FailureClass::Other => self.failure_pause,
            FailureClass::Transport => self.transport_pause,
        }
    }

    pub fn page_delay(&self) -> Duration {
        self.success_pause.sample()
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

pub fn build_client(config: &HttpClientConfig) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout);
    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }
    builder.build().context("building reqwest client")
}
