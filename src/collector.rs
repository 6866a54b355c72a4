//! Rate-limited, paginated, cancellable API collection.
//!
//! A [`Collector`] fetches every page of a remote listing and forwards
//! the parsed records as [`RawEnvelope`]s to a table writer. The call
//! site supplies two closures: a request builder (produces the next HTTP
//! request from a [`PageCursor`]) and a response parser (extracts records
//! plus the next-page indicator). Pagination mode is a parameter of each
//! call site, not a property of the collector:
//!
//! - [`Pagination::Cursor`] — the server returns an opaque continuation
//!   token that must be echoed verbatim, so pages chain sequentially.
//! - [`Pagination::Offset`] — the first page reports a total count; the
//!   remaining pages are computed up front and fanned out to a fixed
//!   worker pool pulling from a work queue.
//!
//! All workers of a connection share one [`RateLimiter`] and one
//! `reqwest` client through an [`ApiClient`], which the owning task
//! releases exactly once when it finishes, however it finishes.

use std::sync::Arc;
use std::time::Duration;

use reqwest::RequestBuilder;
use serde_json::Value;
use sqlx::SqlitePool;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ApiConfig, ConnectionConfig};
use crate::error::{RuntimeError, RuntimeResult};
use crate::models::{params_fingerprint, RawEnvelope};
use crate::ratelimit::RateLimiter;
use crate::writer::{ensure_raw_table, PageSink};

const BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Rate-limited HTTP client for one connection.
///
/// Shared by every collector a task runs against that connection; the
/// throughput budget therefore spans all of them, as the remote API
/// meters by credential, not by endpoint.
pub struct ApiClient {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
    limiter: Arc<RateLimiter>,
    max_retries: u32,
    workers: usize,
    cancel: CancellationToken,
}

impl ApiClient {
    /// Build a client from the plugin's connection and the runtime API
    /// defaults. `cancel` is the task-scoped cancellation signal.
    pub fn new(
        connection: &ConnectionConfig,
        api: &ApiConfig,
        cancel: CancellationToken,
    ) -> RuntimeResult<Self> {
        let client = reqwest::Client::builder()
            // Short fixed timeout per call, independent of retry backoff.
            .timeout(Duration::from_secs(api.timeout_secs))
            .build()
            .map_err(|e| RuntimeError::bad_input(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            endpoint: connection.endpoint.trim_end_matches('/').to_string(),
            token: connection.auth.token.clone(),
            limiter: Arc::new(RateLimiter::new(connection.rate_limit.requests_per_hour)),
            max_retries: api.max_retries,
            workers: api.workers.max(1),
            cancel,
        })
    }

    /// Start a GET request against `path`, with the endpoint prefix and
    /// bearer token applied. Request builders call this.
    pub fn get(&self, path: &str) -> RequestBuilder {
        let url = format!("{}/{}", self.endpoint, path.trim_start_matches('/'));
        let mut req = self.client.get(url);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        req
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Perform one attempt: wait for a rate-limit slot, send, classify.
    /// Returns the body and the final URL. `Ok(None)` means the task was
    /// cancelled while waiting.
    async fn send_once(&self, req: RequestBuilder) -> RuntimeResult<Option<(Vec<u8>, String)>> {
        tokio::select! {
            _ = self.cancel.cancelled() => return Ok(None),
            _ = self.limiter.acquire() => {}
        }
        let response = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(None),
            res = req.send() => res?,
        };
        let url = response.url().to_string();
        let status = response.status();
        if !status.is_success() {
            return Err(RuntimeError::from_status(status, &url));
        }
        let body = response.bytes().await?;
        Ok(Some((body.to_vec(), url)))
    }

    /// Release the connection: drop the idle pool. Consumes the client so
    /// it can only happen once; the owning task calls this whether it
    /// succeeded, failed, or was cancelled.
    pub fn release(self) {
        info!(endpoint = %self.endpoint, "releasing api client");
        drop(self.client);
    }
}

/// Position of the next page request.
#[derive(Debug, Clone, Default)]
pub struct PageCursor {
    /// 1-based page number.
    pub page: usize,
    /// Records to skip (offset mode).
    pub offset: usize,
    /// Continuation token from the previous response (cursor mode,
    /// `None` for the first page). Echo it verbatim.
    pub cursor: Option<String>,
}

/// What the response parser extracted from one page.
pub struct ParsedPage {
    pub records: Vec<Value>,
    /// Token for the next page; `None` ends a cursor collection.
    pub next_cursor: Option<String>,
    /// Total record count reported by the source; required on the first
    /// page of an offset collection.
    pub total: Option<usize>,
}

/// Pagination addressing mode for one call site.
#[derive(Debug, Clone, Copy)]
pub enum Pagination {
    Cursor { page_size: usize },
    Offset { page_size: usize },
}

pub type BuildRequest = Box<dyn Fn(&ApiClient, &PageCursor) -> RequestBuilder + Send + Sync>;
pub type ParseResponse = Box<dyn Fn(&[u8]) -> RuntimeResult<ParsedPage> + Send + Sync>;

/// Everything a collect subtask supplies to drive one collection.
pub struct CollectorArgs {
    /// Raw table collected rows land in, e.g. `_raw_issues`.
    pub table: String,
    /// Collection scope parameters; fingerprinted into every envelope.
    pub params: Value,
    pub pagination: Pagination,
    /// Incremental collections keep previously collected rows; full
    /// collections delete the scope's rows before fetching.
    pub incremental: bool,
    pub build_request: BuildRequest,
    pub parse_response: ParseResponse,
}

/// Outcome counters for one collection.
#[derive(Debug, Clone, Copy, Default)]
pub struct CollectStats {
    pub pages: u64,
    pub records: u64,
    /// True when the run stopped early because the task was cancelled.
    pub cancelled: bool,
}

pub struct Collector {
    api: Arc<ApiClient>,
    args: CollectorArgs,
    fingerprint: String,
}

impl Collector {
    pub fn new(api: Arc<ApiClient>, args: CollectorArgs) -> Self {
        let fingerprint = params_fingerprint(&args.params);
        Self {
            api,
            args,
            fingerprint,
        }
    }

    /// Run the collection to completion, forwarding whole pages to
    /// `sink`. Returns once every page is fetched and forwarded, an
    /// error is fatal, or cancellation has drained the workers.
    pub async fn execute(
        &self,
        pool: &SqlitePool,
        sink: PageSink<RawEnvelope>,
    ) -> RuntimeResult<CollectStats> {
        info!(table = %self.args.table, "start collection");
        ensure_raw_table(pool, &self.args.table).await?;

        if !self.args.incremental {
            // Full collection supersedes this scope's previous rows.
            let deleted = sqlx::query(&format!("DELETE FROM {} WHERE params = ?", self.args.table))
                .bind(&self.fingerprint)
                .execute(pool)
                .await?
                .rows_affected();
            if deleted > 0 {
                debug!(table = %self.args.table, deleted, "cleared previous collection");
            }
        }

        let stats = match self.args.pagination {
            Pagination::Cursor { page_size } => self.collect_cursor(page_size, &sink).await?,
            Pagination::Offset { page_size } => self.collect_offset(page_size, &sink).await?,
        };

        if stats.cancelled {
            warn!(table = %self.args.table, "collection cancelled");
        } else {
            info!(
                table = %self.args.table,
                pages = stats.pages,
                records = stats.records,
                "end collection"
            );
        }
        Ok(stats)
    }

    /// Fetch one page with bounded exponential backoff on transient
    /// failures. The request is rebuilt from the closure on every attempt
    /// so retried requests see the same cursor. `Ok(None)` means
    /// cancelled.
    ///
    /// Public for call sites that drive pagination themselves instead of
    /// going through [`Collector::execute`].
    pub async fn fetch_page(
        &self,
        cursor: &PageCursor,
    ) -> RuntimeResult<Option<(ParsedPage, String)>> {
        let mut attempt = 0u32;
        loop {
            let req = (self.args.build_request)(&self.api, cursor);
            match self.api.send_once(req).await {
                Ok(None) => return Ok(None),
                Ok(Some((body, url))) => {
                    let parsed = (self.args.parse_response)(&body)?;
                    return Ok(Some((parsed, url)));
                }
                Err(err) if err.is_retryable() && attempt < self.api.max_retries => {
                    let delay = BACKOFF_BASE * 2u32.pow(attempt);
                    attempt += 1;
                    warn!(
                        page = cursor.page,
                        attempt,
                        ?delay,
                        error = %err,
                        "transient fetch failure, retrying"
                    );
                    tokio::select! {
                        _ = self.api.cancel.cancelled() => return Ok(None),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Turn a parsed page into envelopes and forward it as one unit, so a
    /// cancelled or failed run never hands the writer a partial page.
    async fn forward_page(
        &self,
        cursor: &PageCursor,
        records: Vec<Value>,
        url: &str,
        sink: &PageSink<RawEnvelope>,
    ) -> RuntimeResult<usize> {
        let page_key = format!("page-{}", cursor.page);
        let count = records.len();
        let envelopes: Vec<RawEnvelope> = records
            .into_iter()
            .enumerate()
            .map(|(index, data)| RawEnvelope::new(&self.fingerprint, &page_key, index, data, url))
            .collect();
        sink.send(envelopes).await?;
        Ok(count)
    }

    /// Sequential chain: each response carries the token for the next
    /// request.
    async fn collect_cursor(
        &self,
        page_size: usize,
        sink: &PageSink<RawEnvelope>,
    ) -> RuntimeResult<CollectStats> {
        let mut stats = CollectStats::default();
        let mut cursor = PageCursor {
            page: 1,
            ..Default::default()
        };
        loop {
            let Some((parsed, url)) = self.fetch_page(&cursor).await? else {
                stats.cancelled = true;
                return Ok(stats);
            };
            let short_page = parsed.records.len() < page_size;
            if !parsed.records.is_empty() {
                stats.records += self.forward_page(&cursor, parsed.records, &url, sink).await? as u64;
                stats.pages += 1;
            }
            match parsed.next_cursor {
                Some(token) if !short_page => {
                    cursor.offset += page_size;
                    cursor.page += 1;
                    cursor.cursor = Some(token);
                }
                _ => return Ok(stats),
            }
        }
    }

    /// Offset fan-out: page 1 reports the total, the rest go through a
    /// work queue drained by the worker pool. The first error cancels the
    /// remaining fetches and wins.
    async fn collect_offset(
        &self,
        page_size: usize,
        sink: &PageSink<RawEnvelope>,
    ) -> RuntimeResult<CollectStats> {
        if page_size == 0 {
            return Err(RuntimeError::bad_input("page_size must be > 0"));
        }
        let mut stats = CollectStats::default();

        let first = PageCursor {
            page: 1,
            ..Default::default()
        };
        let Some((parsed, url)) = self.fetch_page(&first).await? else {
            stats.cancelled = true;
            return Ok(stats);
        };
        let total = parsed.total.ok_or_else(|| {
            RuntimeError::bad_input("offset pagination requires a total count on the first page")
        })?;
        if !parsed.records.is_empty() {
            stats.records += self.forward_page(&first, parsed.records, &url, sink).await? as u64;
            stats.pages += 1;
        }

        let total_pages = total.div_ceil(page_size);
        if total_pages <= 1 {
            return Ok(stats);
        }

        // Work queue of remaining page numbers, sized to hold all of them.
        let (queue_tx, queue_rx) = mpsc::channel::<usize>(total_pages - 1);
        for page in 2..=total_pages {
            queue_tx
                .try_send(page)
                .map_err(|_| RuntimeError::internal("page queue overflow"))?;
        }
        drop(queue_tx);
        let queue = Arc::new(Mutex::new(queue_rx));

        // First failure stops the pool via this local token; the task
        // token keeps its own meaning.
        let abort = CancellationToken::new();
        let failure: Arc<Mutex<Option<RuntimeError>>> = Arc::new(Mutex::new(None));

        let workers = self.api.workers().min(total_pages - 1);
        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let queue = Arc::clone(&queue);
            let abort = abort.clone();
            let failure = Arc::clone(&failure);
            let sink = sink.clone();
            let collector = self;
            handles.push(async move {
                let mut local = CollectStats::default();
                loop {
                    if abort.is_cancelled() || collector.api.cancel.is_cancelled() {
                        local.cancelled = collector.api.cancel.is_cancelled();
                        return local;
                    }
                    let Some(page) = queue.lock().await.recv().await else {
                        return local;
                    };
                    let cursor = PageCursor {
                        page,
                        offset: (page - 1) * page_size,
                        cursor: None,
                    };
                    debug!(worker, page, "fetching page");
                    match collector.fetch_page(&cursor).await {
                        Ok(None) => {
                            local.cancelled = true;
                            return local;
                        }
                        Ok(Some((parsed, url))) => {
                            if parsed.records.is_empty() {
                                continue;
                            }
                            match collector
                                .forward_page(&cursor, parsed.records, &url, &sink)
                                .await
                            {
                                Ok(count) => {
                                    local.records += count as u64;
                                    local.pages += 1;
                                }
                                Err(err) => {
                                    *failure.lock().await = Some(err);
                                    abort.cancel();
                                    return local;
                                }
                            }
                        }
                        Err(err) => {
                            let mut slot = failure.lock().await;
                            if slot.is_none() {
                                *slot = Some(err);
                            }
                            abort.cancel();
                            return local;
                        }
                    }
                }
            });
        }

        // Workers borrow `self`, so they are joined on this task rather
        // than spawned.
        let results = futures::future::join_all(handles).await;
        for local in results {
            stats.pages += local.pages;
            stats.records += local.records;
            stats.cancelled |= local.cancelled;
        }

        if let Some(err) = failure.lock().await.take() {
            return Err(err);
        }
        Ok(stats)
    }
}

