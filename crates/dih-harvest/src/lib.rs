//! Resilient paginated harvesting against the remote reporting API.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use dih_core::{plan_year, DonationRecord, MonthWindow};
use dih_storage::{
    build_client, BackoffConfig, FetchError, HttpClientConfig, PartitionStore,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dih-harvest";

/// Per-page retry policy. `Unbounded` never gives up on a recoverable
/// failure; `Capped` surfaces the window as incomplete instead of hanging,
/// and a later re-run resumes idempotently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryLimit {
    Unbounded,
    Capped(u32),
}

#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub api_url: String,
    pub raw_data_dir: PathBuf,
    pub source_id: String,
    pub year: i32,
    pub per_page: u32,
    pub backoff: BackoffConfig,
    pub retry_limit: RetryLimit,
    pub http: HttpClientConfig,
    pub window_cooldown: Duration,
}

impl HarvestConfig {
    pub fn from_env() -> Self {
        Self {
            api_url: std::env::var("DIH_API_URL").unwrap_or_else(|_| {
                "https://cba-transapi.savelife.in.ua/wp-json/savelife/reporting/income".to_string()
            }),
            raw_data_dir: std::env::var("DIH_RAW_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/raw")),
            source_id: std::env::var("DIH_SOURCE_ID")
                .unwrap_or_else(|_| "come_back_alive".to_string()),
            year: std::env::var("DIH_TARGET_YEAR")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2025),
            per_page: std::env::var("DIH_PER_PAGE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(100),
            backoff: BackoffConfig::default(),
            retry_limit: std::env::var("DIH_MAX_PAGE_RETRIES")
                .ok()
                .and_then(|v| v.parse::<u32>().ok())
                .filter(|&n| n > 0)
                .map(RetryLimit::Capped)
                .unwrap_or(RetryLimit::Unbounded),
            http: HttpClientConfig {
                timeout: std::env::var("DIH_HTTP_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .map(Duration::from_secs)
                    .unwrap_or_else(|| Duration::from_secs(20)),
                user_agent: Some(
                    std::env::var("DIH_USER_AGENT").unwrap_or_else(|_| "dih-bot/0.1".to_string()),
                ),
            },
            window_cooldown: Duration::from_secs(3),
        }
    }

    pub fn partition_path(&self, window: &MonthWindow) -> PathBuf {
        self.raw_data_dir
            .join(&self.source_id)
            .join(window.partition_file_name())
    }
}

/// One row as the reporting API serializes it. Amounts arrive as either
/// numbers or numeric strings.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiDonationRow {
    pub id: i64,
    pub amount: JsonValue,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
}

impl ApiDonationRow {
    /// Returns `None` when the amount parses as neither a number nor a
    /// numeric string; such rows are dropped, never aborted on.
    pub fn into_record(self) -> Option<DonationRecord> {
        let amount = match &self.amount {
            JsonValue::Number(number) => number.as_f64(),
            JsonValue::String(text) => text.trim().parse::<f64>().ok(),
            _ => None,
        }?;
        Some(DonationRecord {
            id: self.id,
            amount,
            currency: self.currency,
            date: self.date.unwrap_or_default(),
            comment: self.comment,
            category: None,
            source: self.source,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PageEnvelope {
    #[serde(default)]
    pub total_count: u64,
    #[serde(default)]
    pub rows: Vec<ApiDonationRow>,
}

pub fn total_pages(total_count: u64, per_page: u32) -> u32 {
    total_count.div_ceil(per_page.max(1) as u64) as u32
}

/// Pure pagination cursor. Only two events move it: a persisted non-empty
/// page advances, an empty page stops the window. Failures leave it in
/// place so the same page is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCursor {
    page: u32,
    total_pages: u32,
    finished: bool,
}

impl PageCursor {
    pub fn new(total_pages: u32) -> Self {
        Self {
            page: 1,
            total_pages,
            finished: total_pages == 0,
        }
    }

    /// The page to fetch next, or `None` when the window is exhausted.
    pub fn current(&self) -> Option<u32> {
        (!self.finished).then_some(self.page)
    }

    pub fn advance(&mut self) {
        self.page += 1;
        if self.page > self.total_pages {
            self.finished = true;
        }
    }

    /// An empty page means end-of-data, even when fewer than the computed
    /// pages were consumed.
    pub fn stop(&mut self) {
        self.finished = true;
    }

    pub fn total_pages(&self) -> u32 {
        self.total_pages
    }
}

/// Thin client over the paginated reporting endpoint.
#[derive(Debug)]
pub struct ReportingApiClient {
    client: reqwest::Client,
    api_url: String,
    per_page: u32,
}

impl ReportingApiClient {
    pub fn new(api_url: String, per_page: u32, http: &HttpClientConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: build_client(http)?,
            api_url,
            per_page,
        })
    }

    async fn fetch_envelope(
        &self,
        window: &MonthWindow,
        page: u32,
    ) -> Result<PageEnvelope, FetchError> {
        let response = self
            .client
            .get(&self.api_url)
            .query(&[
                ("date_from", window.date_from_param()),
                ("date_to", window.date_to_param()),
                ("per_page", self.per_page.to_string()),
                ("page", page.to_string()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: response.url().to_string(),
            });
        }
        Ok(response.json::<PageEnvelope>().await?)
    }

    /// Metadata request: learns the window's total record count for page
    /// planning.
    pub async fn fetch_total_count(&self, window: &MonthWindow) -> Result<u64, FetchError> {
        Ok(self.fetch_envelope(window, 1).await?.total_count)
    }

    /// Fetches one page and decodes its rows, dropping rows with malformed
    /// amounts.
    pub async fn fetch_page(
        &self,
        window: &MonthWindow,
        page: u32,
    ) -> Result<Vec<DonationRecord>, FetchError> {
        let envelope = self.fetch_envelope(window, page).await?;
        let submitted = envelope.rows.len();
        let records: Vec<DonationRecord> = envelope
            .rows
            .into_iter()
            .filter_map(ApiDonationRow::into_record)
            .collect();
        if records.len() < submitted {
            warn!(
                window = %window.label(),
                page,
                dropped = submitted - records.len(),
                "dropped rows with malformed amounts"
            );
        }
        Ok(records)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum WindowOutcome {
    Complete { pages: u32, new_rows: usize },
    Incomplete { page: u32, retries: u32 },
}

#[derive(Debug, Clone, Serialize)]
pub struct WindowReport {
    pub window: String,
    pub outcome: WindowOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct HarvestRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub source_id: String,
    pub year: i32,
    pub windows: Vec<WindowReport>,
    pub new_rows: usize,
}

/// Fetches every page of every window for one source and year, persisting
/// page-by-page into per-window partition stores.
pub struct WindowHarvester {
    api: ReportingApiClient,
    config: HarvestConfig,
}

impl WindowHarvester {
    pub fn new(config: HarvestConfig) -> anyhow::Result<Self> {
        let api = ReportingApiClient::new(config.api_url.clone(), config.per_page, &config.http)?;
        Ok(Self { api, config })
    }

    /// Harvests one window to completion (or to the retry ceiling).
    /// Persistence is page-granular: a fatal failure mid-window never
    /// touches pages already written.
    pub async fn harvest_window(
        &self,
        run_id: Uuid,
        window: &MonthWindow,
    ) -> anyhow::Result<WindowReport> {
        let mut store = PartitionStore::open(self.config.partition_path(window))?;
        store.ensure_schema()?;
        info!(
            %run_id,
            window = %window.label(),
            path = %store.path().display(),
            "targeting window"
        );

        let total_pages = match self.api.fetch_total_count(window).await {
            Ok(count) => {
                let pages = total_pages(count, self.config.per_page);
                info!(window = %window.label(), total_count = count, pages, "window metadata fetched");
                pages
            }
            Err(err) => {
                // Degraded: attempt at least one page rather than silently
                // skipping the window's data.
                warn!(
                    window = %window.label(),
                    error = %err,
                    "metadata request failed; proceeding with a single page attempt"
                );
                1
            }
        };

        let mut cursor = PageCursor::new(total_pages);
        let mut retries_this_page = 0u32;
        let mut new_rows = 0usize;
        let mut pages_persisted = 0u32;

        while let Some(page) = cursor.current() {
            match self.api.fetch_page(window, page).await {
                Ok(rows) if rows.is_empty() => {
                    info!(window = %window.label(), page, "empty page, treating as end of data");
                    cursor.stop();
                }
                Ok(rows) => {
                    let inserted = store
                        .save(&rows)
                        .with_context(|| format!("persisting page {page}"))?;
                    new_rows += inserted;
                    pages_persisted += 1;
                    info!(
                        window = %window.label(),
                        page,
                        total_pages = cursor.total_pages(),
                        inserted,
                        "page persisted"
                    );
                    cursor.advance();
                    retries_this_page = 0;
                    tokio::time::sleep(self.config.backoff.page_delay()).await;
                }
                Err(err) => {
                    let class = err.class();
                    retries_this_page += 1;
                    if let RetryLimit::Capped(ceiling) = self.config.retry_limit {
                        if retries_this_page >= ceiling {
                            warn!(
                                window = %window.label(),
                                page,
                                retries = retries_this_page,
                                "retry ceiling reached; leaving window incomplete"
                            );
                            return Ok(WindowReport {
                                window: window.label(),
                                outcome: WindowOutcome::Incomplete {
                                    page,
                                    retries: retries_this_page,
                                },
                            });
                        }
                    }
                    let delay = self.config.backoff.delay_for(class);
                    warn!(
                        window = %window.label(),
                        page,
                        class = ?class,
                        wait_secs = delay.as_secs_f64(),
                        error = %err,
                        "page fetch failed; backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }

        info!(
            window = %window.label(),
            pages = pages_persisted,
            new_rows,
            "window complete"
        );
        Ok(WindowReport {
            window: window.label(),
            outcome: WindowOutcome::Complete {
                pages: pages_persisted,
                new_rows,
            },
        })
    }

    /// Harvests all twelve windows of the configured year in sequence. A
    /// failed window is logged and skipped; siblings continue.
    pub async fn harvest_year(&self) -> anyhow::Result<HarvestRunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(
            %run_id,
            year = self.config.year,
            source = %self.config.source_id,
            "harvest run started"
        );

        let mut windows = Vec::new();
        let mut new_rows = 0usize;
        for window in plan_year(self.config.year) {
            match self.harvest_window(run_id, &window).await {
                Ok(report) => {
                    if let WindowOutcome::Complete { new_rows: rows, .. } = &report.outcome {
                        new_rows += *rows;
                    }
                    windows.push(report);
                }
                Err(err) => {
                    error!(
                        window = %window.label(),
                        error = %err,
                        "window failed; continuing with the next window"
                    );
                }
            }
            // Cool down between months.
            tokio::time::sleep(self.config.window_cooldown).await;
        }

        let finished_at = Utc::now();
        info!(%run_id, windows = windows.len(), new_rows, "harvest run finished");
        Ok(HarvestRunSummary {
            run_id,
            started_at,
            finished_at,
            source_id: self.config.source_id.clone(),
            year: self.config.year,
            windows,
            new_rows,
        })
    }
}

#[derive(Debug, Clone)]
pub struct DocumentDownloadConfig {
    pub target_dir: PathBuf,
    pub pause: Duration,
    pub http: HttpClientConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DownloadSummary {
    pub downloaded: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Only report assets are downloaded; rendered pages link plenty of static
/// site files too.
pub fn is_report_asset(url: &str) -> bool {
    url.to_ascii_lowercase().contains("report")
}

/// Basename of the link with any query string stripped.
pub fn document_file_name(url: &str) -> Option<String> {
    let path = url.split('?').next()?;
    let name = path.trim_end_matches('/').rsplit('/').next()?;
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

async fn fetch_document(client: &reqwest::Client, url: &str) -> Result<Vec<u8>, FetchError> {
    let response = client.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::HttpStatus {
            status: status.as_u16(),
            url: response.url().to_string(),
        });
    }
    Ok(response.bytes().await?.to_vec())
}

/// Downloads the document links discovered by the rendering collaborator.
/// Links are expected deduplicated and absolute. Files already present on
/// disk are skipped; a failed download never aborts the batch.
pub async fn download_documents(
    config: &DocumentDownloadConfig,
    links: &[String],
) -> anyhow::Result<DownloadSummary> {
    fs::create_dir_all(&config.target_dir)
        .await
        .with_context(|| format!("creating document directory {}", config.target_dir.display()))?;
    let client = build_client(&config.http)?;

    let mut summary = DownloadSummary::default();
    for url in links {
        if !is_report_asset(url) {
            debug!(url = %url, "not a report asset; ignoring");
            continue;
        }
        let Some(file_name) = document_file_name(url) else {
            warn!(url = %url, "could not derive a file name; skipping");
            summary.failed += 1;
            continue;
        };
        let path = config.target_dir.join(&file_name);
        if fs::try_exists(&path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            info!(file = %file_name, "already present; skipping");
            summary.skipped += 1;
            continue;
        }

        match fetch_document(&client, url).await {
            Ok(bytes) => {
                let digest = hex::encode(Sha256::digest(&bytes));
                fs::write(&path, &bytes)
                    .await
                    .with_context(|| format!("writing {}", path.display()))?;
                info!(file = %file_name, bytes = bytes.len(), %digest, "document downloaded");
                summary.downloaded += 1;
            }
            Err(err) => {
                warn!(url = %url, error = %err, "document download failed");
                summary.failed += 1;
            }
        }
        // Polite delay between downloads.
        tokio::time::sleep(config.pause).await;
    }
    Ok(summary)
}
