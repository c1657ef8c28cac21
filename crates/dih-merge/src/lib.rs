//! Consolidation of partition stores and batch inputs into the canonical
//! store, with schema reconciliation across heterogeneous sources.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use dih_core::DonationRecord;
use dih_storage::{CanonicalStore, CellValue, ColumnKind, PartitionStore};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dih-merge";

/// Record attributes a delimited batch may carry under its own header
/// names. Anything else must be declared in the source's mapping rules or
/// it is dropped.
const RECORD_ATTRIBUTES: [&str; 6] = ["id", "amount", "currency", "date", "comment", "category"];

/// Versioned registry of upstream sources and their reconciliation rules.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourceRegistry {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub sources: Vec<SourceSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceSpec {
    pub source_id: String,
    pub display_name: String,
    /// Label applied to this source's NULL categories after each merge.
    #[serde(default)]
    pub default_category: Option<String>,
    /// Declared column mapping, consulted before any name heuristic.
    #[serde(default)]
    pub amount_columns: Vec<AmountColumnRule>,
    /// Delimited batch inputs expected inside the group directory.
    #[serde(default)]
    pub batch_files: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AmountColumnRule {
    pub from: String,
    pub to: String,
}

impl SourceRegistry {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn spec_for(&self, source_id: &str) -> Option<&SourceSpec> {
        self.sources.iter().find(|spec| spec.source_id == source_id)
    }
}

/// How an incoming amount-bearing column was mapped onto the canonical
/// store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AmountResolution {
    /// A declared per-source mapping rule matched.
    Declared(String),
    /// The incoming name already exists in the store.
    Exact(String),
    /// Best-effort substring match; first candidate in declaration order.
    Heuristic(String),
    /// No candidate found; the incoming name becomes a new column.
    Fresh(String),
}

impl AmountResolution {
    pub fn column_name(&self) -> &str {
        match self {
            AmountResolution::Declared(name)
            | AmountResolution::Exact(name)
            | AmountResolution::Heuristic(name)
            | AmountResolution::Fresh(name) => name,
        }
    }
}

pub fn looks_like_amount(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.contains("amount") || lower.contains("sum")
}

/// Maps an incoming amount column onto the store: declared rule first,
/// then exact name match, then the substring heuristic over existing
/// columns (first candidate in column-declaration order), else fresh.
pub fn resolve_amount_column(
    existing: &[String],
    incoming: &str,
    rules: &[AmountColumnRule],
) -> AmountResolution {
    if let Some(rule) = rules.iter().find(|rule| rule.from == incoming) {
        return AmountResolution::Declared(rule.to.clone());
    }
    if existing.iter().any(|column| column == incoming) {
        return AmountResolution::Exact(incoming.to_string());
    }
    if let Some(candidate) = existing
        .iter()
        .find(|column| *column != "record_key" && looks_like_amount(column))
    {
        return AmountResolution::Heuristic(candidate.clone());
    }
    AmountResolution::Fresh(incoming.to_string())
}

#[derive(Debug, Clone)]
pub struct MergeConfig {
    pub raw_dir: PathBuf,
    pub master_path: PathBuf,
    pub registry_path: PathBuf,
}

impl MergeConfig {
    pub fn from_env() -> Self {
        Self {
            raw_dir: std::env::var("DIH_RAW_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/raw")),
            master_path: std::env::var("DIH_MASTER_DB")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/master/master.db")),
            registry_path: std::env::var("DIH_SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./sources.yaml")),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GroupSummary {
    pub source_id: String,
    pub partition_files: usize,
    pub batch_files: usize,
    pub rows_added: usize,
    pub rows_already_present: usize,
    pub rows_dropped: usize,
    pub files_skipped: usize,
    pub categories_defaulted: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub master_path: String,
    pub groups: Vec<GroupSummary>,
    pub total_rows: i64,
}

#[derive(Debug, Default)]
struct BatchStats {
    added: usize,
    already_present: usize,
    dropped: usize,
}

/// Column plan for one delimited batch: which headers survive, where each
/// one lands, and which canonical columns must exist first.
#[derive(Debug)]
struct BatchColumnPlan {
    /// (header index, target canonical column)
    mapped: Vec<(usize, String)>,
    /// Columns to create before the append, with their kind.
    new_columns: Vec<(String, ColumnKind)>,
    /// The target holding the batch's amount values, if any.
    amount_target: Option<String>,
}

fn plan_batch_columns(
    headers: &[String],
    existing: &[String],
    spec: &SourceSpec,
) -> BatchColumnPlan {
    let mut mapped: Vec<(usize, String)> = Vec::new();
    let mut new_columns: Vec<(String, ColumnKind)> = Vec::new();
    let mut amount_target: Option<String> = None;

    let claim = |target: String,
                 index: usize,
                 mapped: &mut Vec<(usize, String)>,
                 new_columns: &mut Vec<(String, ColumnKind)>| {
        if target == "source" || target == "record_key" {
            warn!(column = %target, "provenance columns come from the group, not the batch; dropping");
            return;
        }
        if mapped.iter().any(|(_, existing_target)| *existing_target == target) {
            warn!(column = %target, "two headers map to the same column; dropping the later one");
            return;
        }
        if !existing.iter().any(|column| *column == target)
            && !new_columns.iter().any(|(name, _)| *name == target)
        {
            let kind = if looks_like_amount(&target) {
                ColumnKind::Real
            } else {
                ColumnKind::Text
            };
            new_columns.push((target.clone(), kind));
        }
        mapped.push((index, target));
    };

    for (index, header) in headers.iter().enumerate() {
        if let Some(rule) = spec.amount_columns.iter().find(|rule| rule.from == *header) {
            info!(from = %rule.from, to = %rule.to, "declared column mapping applied");
            if looks_like_amount(&rule.to) && amount_target.is_none() {
                amount_target = Some(rule.to.clone());
            }
            claim(rule.to.clone(), index, &mut mapped, &mut new_columns);
        } else if RECORD_ATTRIBUTES.contains(&header.as_str()) {
            if header == "amount" && amount_target.is_none() {
                amount_target = Some(header.clone());
            }
            claim(header.clone(), index, &mut mapped, &mut new_columns);
        } else if looks_like_amount(header) {
            if amount_target.is_some() {
                info!(column = %header, "additional amount column; dropping (declare a mapping rule to keep it)");
                continue;
            }
            let resolution = resolve_amount_column(existing, header, &spec.amount_columns);
            match &resolution {
                AmountResolution::Declared(target) | AmountResolution::Exact(target) => {
                    info!(from = %header, to = %target, "amount column mapped");
                }
                AmountResolution::Heuristic(target) => {
                    warn!(
                        from = %header,
                        to = %target,
                        "store uses a different amount column name; mapping by substring heuristic"
                    );
                }
                AmountResolution::Fresh(target) => {
                    info!(column = %target, "no amount column detected; initializing a new one");
                }
            }
            let target = resolution.column_name().to_string();
            amount_target = Some(target.clone());
            claim(target, index, &mut mapped, &mut new_columns);
        } else {
            info!(column = %header, "column not mapped onto a record attribute; dropping");
        }
    }

    BatchColumnPlan {
        mapped,
        new_columns,
        amount_target,
    }
}

fn batch_record_key(
    source_id: &str,
    file_stem: &str,
    row_index: usize,
    date: &str,
    amount: Option<f64>,
    category: &str,
) -> String {
    let identity = format!(
        "{source_id}/{file_stem}/{row_index}/{date}/{}/{category}",
        amount.map(|v| v.to_string()).unwrap_or_default()
    );
    Uuid::new_v5(&Uuid::NAMESPACE_URL, identity.as_bytes()).to_string()
}

/// Unions partition stores and batch inputs into the canonical store, one
/// provenance-labeled group at a time.
pub struct Consolidator {
    config: MergeConfig,
    registry: SourceRegistry,
}

impl Consolidator {
    pub fn new(config: MergeConfig) -> Result<Self> {
        let registry = if config.registry_path.exists() {
            SourceRegistry::load(&config.registry_path)?
        } else {
            warn!(
                path = %config.registry_path.display(),
                "source registry not found; proceeding without per-source rules"
            );
            SourceRegistry::default()
        };
        Ok(Self { config, registry })
    }

    /// Full rebuild pass over every group directory under the raw root.
    /// Aborts early, with no partial work, when the raw root is absent.
    pub fn merge_all(&self) -> Result<MergeRunSummary> {
        if !self.config.raw_dir.exists() {
            bail!("raw directory not found: {}", self.config.raw_dir.display());
        }

        let mut group_dirs: Vec<PathBuf> = fs::read_dir(&self.config.raw_dir)
            .with_context(|| format!("reading {}", self.config.raw_dir.display()))?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
            .map(|entry| entry.path())
            .collect();
        group_dirs.sort();
        if group_dirs.is_empty() {
            warn!(raw = %self.config.raw_dir.display(), "no source folders found");
        }

        self.run(group_dirs)
    }

    /// Incremental re-run for one named group. Aborts early when the group
    /// directory is absent.
    pub fn merge_group(&self, source_id: &str) -> Result<MergeRunSummary> {
        let group_dir = self.config.raw_dir.join(source_id);
        if !group_dir.is_dir() {
            bail!("source directory not found: {}", group_dir.display());
        }
        self.run(vec![group_dir])
    }

    fn run(&self, group_dirs: Vec<PathBuf>) -> Result<MergeRunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, master = %self.config.master_path.display(), "merge run started");

        let mut store = CanonicalStore::open(&self.config.master_path)?;
        store.ensure_schema()?;
        store.migrate_foundation_name()?;

        let mut groups = Vec::new();
        for group_dir in group_dirs {
            let source_id = group_dir
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            groups.push(self.merge_group_into(&mut store, &group_dir, &source_id));
        }

        let total_rows = store.count()?;
        let untagged = store.null_count("source")?;
        if untagged > 0 {
            warn!(rows = untagged, "rows remain without a provenance tag");
        } else {
            info!("validation successful: every row carries a provenance tag");
        }

        let finished_at = Utc::now();
        let summary = MergeRunSummary {
            run_id,
            started_at,
            finished_at,
            master_path: self.config.master_path.display().to_string(),
            groups,
            total_rows,
        };
        match self.write_summary(&summary) {
            Ok(path) => info!(report = %path.display(), total_rows, "merge run finished"),
            Err(err) => warn!(error = %err, "failed to write merge summary"),
        }
        Ok(summary)
    }

    /// Merges one group. Per-file failures are logged and skipped; they
    /// never abort sibling files or sibling groups.
    fn merge_group_into(
        &self,
        store: &mut CanonicalStore,
        group_dir: &Path,
        source_id: &str,
    ) -> GroupSummary {
        let spec = self.registry.spec_for(source_id);
        info!(
            source = source_id,
            display_name = spec.map(|s| s.display_name.as_str()).unwrap_or(source_id),
            "processing source group"
        );
        let mut summary = GroupSummary {
            source_id: source_id.to_string(),
            ..GroupSummary::default()
        };

        let mut partition_files: Vec<PathBuf> = match fs::read_dir(group_dir) {
            Ok(entries) => entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| path.extension().map(|ext| ext == "db").unwrap_or(false))
                .collect(),
            Err(err) => {
                error!(group = %group_dir.display(), error = %err, "cannot read group directory; skipping");
                summary.files_skipped += 1;
                return summary;
            }
        };
        partition_files.sort();
        if partition_files.is_empty() {
            info!(source = source_id, "no partition files in group");
        }

        for path in partition_files {
            match self.merge_partition_file(store, &path, source_id) {
                Ok((added, already_present)) => {
                    summary.partition_files += 1;
                    summary.rows_added += added;
                    summary.rows_already_present += already_present;
                }
                Err(err) => {
                    error!(file = %path.display(), error = %err, "failed to merge partition file; skipping");
                    summary.files_skipped += 1;
                }
            }
        }

        if let Some(spec) = spec {
            for file_name in &spec.batch_files {
                let path = group_dir.join(file_name);
                match self.ingest_batch_file(store, &path, spec) {
                    Ok(stats) => {
                        summary.batch_files += 1;
                        summary.rows_added += stats.added;
                        summary.rows_already_present += stats.already_present;
                        summary.rows_dropped += stats.dropped;
                    }
                    Err(err) => {
                        error!(file = %path.display(), error = %err, "failed to ingest batch file; skipping");
                        summary.files_skipped += 1;
                    }
                }
            }
        }

        if let Err(err) = store.ensure_indexes() {
            error!(error = %err, "failed to rebuild canonical indexes");
        }

        if let Some(default_category) = spec.and_then(|s| s.default_category.as_deref()) {
            match store.apply_default_category(source_id, default_category) {
                Ok(filled) => {
                    summary.categories_defaulted = filled;
                    if filled > 0 {
                        info!(source = source_id, filled, label = default_category, "defaulted NULL categories");
                    }
                }
                Err(err) => {
                    error!(source = source_id, error = %err, "failed to apply default category");
                }
            }
        }

        info!(
            source = source_id,
            rows_added = summary.rows_added,
            rows_already_present = summary.rows_already_present,
            "finished source group"
        );
        summary
    }

    fn merge_partition_file(
        &self,
        store: &mut CanonicalStore,
        path: &Path,
        source_id: &str,
    ) -> Result<(usize, usize)> {
        let partition = PartitionStore::open(path)?;
        let records: Vec<DonationRecord> = partition.load_all()?;
        if records.is_empty() {
            info!(file = %path.display(), "file is empty, skipping");
            return Ok((0, 0));
        }

        let columns: Vec<String> = [
            "record_key",
            "id",
            "amount",
            "currency",
            "date",
            "comment",
            "source",
            "category",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let rows: Vec<Vec<CellValue>> = records
            .into_iter()
            .map(|record| {
                vec![
                    CellValue::Text(format!("{source_id}:{}", record.id)),
                    CellValue::Integer(record.id),
                    CellValue::Real(record.amount),
                    CellValue::from(record.currency),
                    CellValue::Text(record.date),
                    CellValue::from(record.comment),
                    // The group stamp wins over whatever the partition carried.
                    CellValue::Text(source_id.to_string()),
                    CellValue::from(record.category),
                ]
            })
            .collect();

        let submitted = rows.len();
        let added = store.append_rows(&columns, &rows)?;
        info!(file = %path.display(), submitted, added, "partition merged");
        Ok((added, submitted - added))
    }

    fn ingest_batch_file(
        &self,
        store: &mut CanonicalStore,
        path: &Path,
        spec: &SourceSpec,
    ) -> Result<BatchStats> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(path)
            .with_context(|| format!("opening {}", path.display()))?;
        let headers: Vec<String> = reader
            .headers()
            .with_context(|| format!("reading headers of {}", path.display()))?
            .iter()
            .map(str::to_string)
            .collect();

        let plan = plan_batch_columns(&headers, &store.columns()?, spec);
        if plan.mapped.is_empty() {
            bail!("no batch column maps onto a record attribute");
        }
        for (column, kind) in &plan.new_columns {
            store.ensure_column(column, *kind)?;
        }

        let file_stem = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut columns: Vec<String> = vec!["record_key".to_string(), "source".to_string()];
        columns.extend(plan.mapped.iter().map(|(_, target)| target.clone()));

        let mut rows: Vec<Vec<CellValue>> = Vec::new();
        let mut stats = BatchStats::default();
        for (row_index, result) in reader.records().enumerate() {
            let record = match result {
                Ok(record) => record,
                Err(err) => {
                    warn!(file = %path.display(), row = row_index, error = %err, "unreadable row dropped");
                    stats.dropped += 1;
                    continue;
                }
            };

            let mut cells: Vec<CellValue> = Vec::with_capacity(plan.mapped.len());
            let mut amount: Option<f64> = None;
            let mut date = String::new();
            let mut category = String::new();
            let mut malformed = false;

            for (header_index, target) in &plan.mapped {
                let raw = record.get(*header_index).unwrap_or("").trim();
                let is_amount_target = Some(target.as_str()) == plan.amount_target.as_deref();
                let cell = if raw.is_empty() {
                    if is_amount_target {
                        // A donation without an amount is not a record.
                        malformed = true;
                        break;
                    }
                    CellValue::Null
                } else if is_amount_target || looks_like_amount(target) {
                    match raw.parse::<f64>() {
                        Ok(value) => {
                            if is_amount_target {
                                amount = Some(value);
                            }
                            CellValue::Real(value)
                        }
                        Err(_) => {
                            malformed = true;
                            break;
                        }
                    }
                } else if target == "id" {
                    match raw.parse::<i64>() {
                        Ok(value) => CellValue::Integer(value),
                        Err(_) => {
                            malformed = true;
                            break;
                        }
                    }
                } else {
                    if target == "date" {
                        date = raw.to_string();
                    } else if target == "category" {
                        category = raw.to_string();
                    }
                    CellValue::Text(raw.to_string())
                };
                cells.push(cell);
            }

            if malformed {
                warn!(file = %path.display(), row = row_index, "row with malformed numeric field dropped");
                stats.dropped += 1;
                continue;
            }

            let key = batch_record_key(
                &spec.source_id,
                &file_stem,
                row_index,
                &date,
                amount,
                &category,
            );
            let mut row = vec![
                CellValue::Text(key),
                CellValue::Text(spec.source_id.clone()),
            ];
            row.extend(cells);
            rows.push(row);
        }

        if rows.is_empty() {
            info!(file = %path.display(), "batch produced no ingestible rows, skipping");
            return Ok(stats);
        }

        let submitted = rows.len();
        stats.added = store.append_rows(&columns, &rows)?;
        stats.already_present = submitted - stats.added;
        info!(
            file = %path.display(),
            submitted,
            added = stats.added,
            dropped = stats.dropped,
            "batch ingested"
        );
        Ok(stats)
    }

    fn write_summary(&self, summary: &MergeRunSummary) -> Result<PathBuf> {
        let reports_dir = self
            .config
            .master_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("reports");
        fs::create_dir_all(&reports_dir)
            .with_context(|| format!("creating {}", reports_dir.display()))?;
        let path = reports_dir.join(format!("merge_{}.json", summary.run_id));
        let bytes = serde_json::to_vec_pretty(summary).context("serializing merge summary")?;
        fs::write(&path, bytes).with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: i64, amount: f64) -> DonationRecord {
        DonationRecord {
            id,
            amount,
            currency: Some("UAH".to_string()),
            date: format!("2025-01-{:02}T12:00:00", (id % 27) + 1),
            comment: None,
            category: None,
            source: None,
        }
    }

    fn seed_partition(raw_dir: &Path, source: &str, file: &str, ids: &[i64]) {
        let path = raw_dir.join(source).join(file);
        let mut store = PartitionStore::open(&path).expect("open partition");
        store.ensure_schema().expect("schema");
        let records: Vec<_> = ids.iter().map(|&id| record(id, id as f64 * 10.0)).collect();
        store.save(&records).expect("seed");
    }

    fn config_in(dir: &Path) -> MergeConfig {
        MergeConfig {
            raw_dir: dir.join("raw"),
            master_path: dir.join("master").join("master.db"),
            registry_path: dir.join("sources.yaml"),
        }
    }

    fn write_registry(dir: &Path, body: &str) {
        fs::write(dir.join("sources.yaml"), body).expect("write registry");
    }

    #[test]
    fn consolidation_tags_every_row_with_provenance() {
        let dir = tempfile::tempdir().expect("tempdir");
        seed_partition(&dir.path().join("raw"), "alpha", "donations_2025-01.db", &[1, 2, 3]);
        seed_partition(&dir.path().join("raw"), "beta", "donations_2025-01.db", &[1, 2]);

        let consolidator = Consolidator::new(config_in(dir.path())).expect("consolidator");
        let summary = consolidator.merge_all().expect("merge");

        assert_eq!(summary.total_rows, 5);
        assert_eq!(summary.groups.len(), 2);

        let store = CanonicalStore::open(dir.path().join("master").join("master.db")).expect("open");
        assert_eq!(store.count_for_source("alpha").expect("alpha"), 3);
        assert_eq!(store.count_for_source("beta").expect("beta"), 2);
        assert_eq!(store.null_count("source").expect("nulls"), 0);
    }

    #[test]
    fn rerunning_a_merge_does_not_duplicate_rows() {
        let dir = tempfile::tempdir().expect("tempdir");
        seed_partition(&dir.path().join("raw"), "alpha", "donations_2025-02.db", &[1, 2, 3]);

        let consolidator = Consolidator::new(config_in(dir.path())).expect("consolidator");
        let first = consolidator.merge_all().expect("first merge");
        assert_eq!(first.total_rows, 3);
        assert_eq!(first.groups[0].rows_added, 3);

        let second = consolidator.merge_all().expect("second merge");
        assert_eq!(second.total_rows, 3);
        assert_eq!(second.groups[0].rows_added, 0);
        assert_eq!(second.groups[0].rows_already_present, 3);
    }

    #[test]
    fn named_group_merge_leaves_siblings_alone() {
        let dir = tempfile::tempdir().expect("tempdir");
        seed_partition(&dir.path().join("raw"), "alpha", "donations_2025-01.db", &[1, 2]);
        seed_partition(&dir.path().join("raw"), "beta", "donations_2025-01.db", &[9]);

        let consolidator = Consolidator::new(config_in(dir.path())).expect("consolidator");
        let summary = consolidator.merge_group("alpha").expect("merge alpha");
        assert_eq!(summary.total_rows, 2);

        let store = CanonicalStore::open(dir.path().join("master").join("master.db")).expect("open");
        assert_eq!(store.count_for_source("beta").expect("beta"), 0);
    }

    #[test]
    fn missing_raw_directory_aborts_with_no_partial_work() {
        let dir = tempfile::tempdir().expect("tempdir");
        let consolidator = Consolidator::new(config_in(dir.path())).expect("consolidator");
        assert!(consolidator.merge_all().is_err());
        assert!(consolidator.merge_group("alpha").is_err());
        assert!(!dir.path().join("master").join("master.db").exists());
    }

    #[test]
    fn malformed_partition_file_is_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let raw = dir.path().join("raw");
        seed_partition(&raw, "alpha", "donations_2025-01.db", &[1, 2]);
        fs::write(raw.join("alpha").join("donations_2025-02.db"), b"this is not sqlite")
            .expect("garbage file");

        let consolidator = Consolidator::new(config_in(dir.path())).expect("consolidator");
        let summary = consolidator.merge_all().expect("merge");
        assert_eq!(summary.total_rows, 2);
        assert_eq!(summary.groups[0].files_skipped, 1);
        assert_eq!(summary.groups[0].partition_files, 1);
    }

    const UNITED24_REGISTRY: &str = r#"
version: 1
sources:
  - source_id: united24
    display_name: United24
    amount_columns:
      - from: amount_uah
        to: amount
    batch_files:
      - u24_master_dataset.csv
"#;

    #[test]
    fn batch_rows_land_under_the_declared_amount_column() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_registry(dir.path(), UNITED24_REGISTRY);
        let group = dir.path().join("raw").join("united24");
        fs::create_dir_all(&group).expect("group dir");
        fs::write(
            group.join("u24_master_dataset.csv"),
            "date,amount_uah,category\n01.02.2025,1500.75,medical\n02.02.2025,320.5,drones\n",
        )
        .expect("csv");

        let consolidator = Consolidator::new(config_in(dir.path())).expect("consolidator");
        let summary = consolidator.merge_all().expect("merge");
        assert_eq!(summary.total_rows, 2);
        assert_eq!(summary.groups[0].batch_files, 1);
        assert_eq!(summary.groups[0].rows_added, 2);

        let store = CanonicalStore::open(dir.path().join("master").join("master.db")).expect("open");
        assert_eq!(store.count_for_source("united24").expect("count"), 2);
        // Declared mapping landed the values in `amount`, not a new column.
        assert!(!store.columns().expect("columns").contains(&"amount_uah".to_string()));
        assert_eq!(store.null_count("amount").expect("nulls"), 0);
    }

    #[test]
    fn batch_reruns_are_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_registry(dir.path(), UNITED24_REGISTRY);
        let group = dir.path().join("raw").join("united24");
        fs::create_dir_all(&group).expect("group dir");
        fs::write(
            group.join("u24_master_dataset.csv"),
            "date,amount_uah,category\n01.02.2025,1500.75,medical\n01.02.2025,1500.75,medical\n",
        )
        .expect("csv");

        let consolidator = Consolidator::new(config_in(dir.path())).expect("consolidator");
        // Two identical rows are distinct donations and must both survive;
        // a rerun of the same file must add nothing.
        let first = consolidator.merge_all().expect("first");
        assert_eq!(first.total_rows, 2);
        let second = consolidator.merge_all().expect("second");
        assert_eq!(second.total_rows, 2);
        assert_eq!(second.groups[0].rows_added, 0);
    }

    #[test]
    fn malformed_amount_rows_are_dropped_not_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_registry(dir.path(), UNITED24_REGISTRY);
        let group = dir.path().join("raw").join("united24");
        fs::create_dir_all(&group).expect("group dir");
        fs::write(
            group.join("u24_master_dataset.csv"),
            "date,amount_uah,category\n01.02.2025,100.0,health\n02.02.2025,not-a-number,health\n03.02.2025,55.5,education\n",
        )
        .expect("csv");

        let consolidator = Consolidator::new(config_in(dir.path())).expect("consolidator");
        let summary = consolidator.merge_all().expect("merge");
        assert_eq!(summary.total_rows, 2);
        assert_eq!(summary.groups[0].rows_dropped, 1);
    }

    #[test]
    fn schema_grows_for_batch_only_columns_and_backfills_null() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_registry(
            dir.path(),
            r#"
version: 1
sources:
  - source_id: united24
    display_name: United24
    amount_columns:
      - from: amount_uah
        to: amount
      - from: amount_usd
        to: amount_usd
    batch_files:
      - reports.csv
"#,
        );
        let raw = dir.path().join("raw");
        seed_partition(&raw, "come_back_alive", "donations_2025-01.db", &[1, 2]);
        let group = raw.join("united24");
        fs::create_dir_all(&group).expect("group dir");
        fs::write(
            group.join("reports.csv"),
            "date,amount_uah,amount_usd,category\n01.02.2025,400.0,10.0,health\n",
        )
        .expect("csv");

        let consolidator = Consolidator::new(config_in(dir.path())).expect("consolidator");
        let summary = consolidator.merge_all().expect("merge");
        assert_eq!(summary.total_rows, 3);

        let store = CanonicalStore::open(dir.path().join("master").join("master.db")).expect("open");
        assert!(store.columns().expect("columns").contains(&"amount_usd".to_string()));
        // The partition-derived rows predate the new column and stay NULL.
        assert_eq!(store.null_count("amount_usd").expect("nulls"), 2);
        assert_eq!(
            store.cell_for_key("come_back_alive:1", "amount_usd").expect("cell"),
            Some(CellValue::Null)
        );
    }

    #[test]
    fn default_category_policy_applies_per_source() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_registry(
            dir.path(),
            r#"
version: 1
sources:
  - source_id: come_back_alive
    display_name: Come Back Alive
    default_category: general
"#,
        );
        seed_partition(
            &dir.path().join("raw"),
            "come_back_alive",
            "donations_2025-01.db",
            &[1, 2, 3],
        );
        seed_partition(&dir.path().join("raw"), "other_fund", "donations_2025-01.db", &[7]);

        let consolidator = Consolidator::new(config_in(dir.path())).expect("consolidator");
        let summary = consolidator.merge_all().expect("merge");

        let cba = summary
            .groups
            .iter()
            .find(|group| group.source_id == "come_back_alive")
            .expect("cba group");
        assert_eq!(cba.categories_defaulted, 3);

        let store = CanonicalStore::open(dir.path().join("master").join("master.db")).expect("open");
        assert_eq!(
            store.cell_for_key("come_back_alive:1", "category").expect("cell"),
            Some(CellValue::Text("general".to_string()))
        );
        // No policy declared for the sibling source; its categories stay NULL.
        assert_eq!(
            store.cell_for_key("other_fund:7", "category").expect("cell"),
            Some(CellValue::Null)
        );
    }

    #[test]
    fn amount_resolution_prefers_declared_then_exact_then_heuristic() {
        let rules = vec![AmountColumnRule {
            from: "amount_uah".to_string(),
            to: "amount".to_string(),
        }];
        let existing: Vec<String> = ["record_key", "id", "amount", "date"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        assert_eq!(
            resolve_amount_column(&existing, "amount_uah", &rules),
            AmountResolution::Declared("amount".to_string())
        );
        assert_eq!(
            resolve_amount_column(&existing, "amount", &[]),
            AmountResolution::Exact("amount".to_string())
        );
        assert_eq!(
            resolve_amount_column(&existing, "donation_sum", &[]),
            AmountResolution::Heuristic("amount".to_string())
        );

        let bare: Vec<String> = ["record_key", "date"].iter().map(|s| s.to_string()).collect();
        assert_eq!(
            resolve_amount_column(&bare, "amount_uah", &[]),
            AmountResolution::Fresh("amount_uah".to_string())
        );
    }

    #[test]
    fn heuristic_takes_first_candidate_in_declaration_order() {
        let existing: Vec<String> = ["total_sum", "amount_local", "date"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            resolve_amount_column(&existing, "amount_uah", &[]),
            AmountResolution::Heuristic("total_sum".to_string())
        );
    }

    #[test]
    fn registry_parses_versioned_yaml() {
        let registry: SourceRegistry =
            serde_yaml::from_str(UNITED24_REGISTRY).expect("parse registry");
        assert_eq!(registry.version, 1);
        let spec = registry.spec_for("united24").expect("spec");
        assert_eq!(spec.display_name, "United24");
        assert_eq!(spec.amount_columns[0].to, "amount");
        assert_eq!(spec.batch_files, vec!["u24_master_dataset.csv".to_string()]);
        assert!(registry.spec_for("unknown").is_none());
    }

    #[test]
    fn legacy_foundation_name_is_unified_during_merge() {
        let dir = tempfile::tempdir().expect("tempdir");
        let master_path = dir.path().join("master").join("master.db");

        // A legacy master written by an older ingestion path.
        {
            let mut store = CanonicalStore::open(&master_path).expect("open");
            store.ensure_schema().expect("schema");
            store
                .ensure_column("foundation_name", ColumnKind::Text)
                .expect("legacy column");
            let columns: Vec<String> = ["record_key", "id", "foundation_name"]
                .iter()
                .map(|s| s.to_string())
                .collect();
            store
                .append_rows(
                    &columns,
                    &[vec![
                        CellValue::Text("legacy-row".to_string()),
                        CellValue::Integer(42),
                        CellValue::Text("united24".to_string()),
                    ]],
                )
                .expect("legacy row");
        }

        seed_partition(&dir.path().join("raw"), "alpha", "donations_2025-01.db", &[1]);
        let consolidator = Consolidator::new(config_in(dir.path())).expect("consolidator");
        consolidator.merge_all().expect("merge");

        let store = CanonicalStore::open(&master_path).expect("reopen");
        assert_eq!(store.count_for_source("united24").expect("count"), 1);
        assert_eq!(store.null_count("source").expect("nulls"), 0);
    }
}
