//! Batched, idempotent persistence.
//!
//! Records flush in fixed-size batches (default 500), one transaction per
//! batch, as primary-key upserts — re-delivering a record after a retried
//! page fetch is a no-op on state, not a duplicate row. A failed flush
//! rejects the whole batch and surfaces as the owning subtask's error.
//!
//! Two layers:
//!
//! - [`BatchInserter`] is the synchronous-feeling core: `add` buffers,
//!   every `batch_size` rows it flushes, `close` flushes the remainder.
//!   Extract/convert subtasks drive it directly.
//! - [`TableWriter`] wraps a `BatchInserter` in a per-table task fed by a
//!   bounded page channel. Collector workers suspend when the channel is
//!   full (backpressure) rather than dropping or buffering unboundedly.
//!   One writer per table keeps per-table arrival order; independent
//!   tables run their own writers without coordination.

use sqlx::sqlite::{Sqlite, SqliteArguments, SqlitePool};
use sqlx::query::Query;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{RuntimeError, RuntimeResult};
use crate::models::RawEnvelope;

/// A row that can be upserted into a named table.
///
/// Implemented by [`RawEnvelope`] for the raw layer and by plugin
/// tool-layer types. `conflict_key` must name the table's primary key so
/// the generated `ON CONFLICT` clause deduplicates re-deliveries.
pub trait Record: Send + Sync + 'static {
    fn columns() -> &'static [&'static str];
    fn conflict_key() -> &'static [&'static str];
    /// Bind this row's values in `columns()` order.
    fn bind<'q>(
        &'q self,
        query: Query<'q, Sqlite, SqliteArguments<'q>>,
    ) -> Query<'q, Sqlite, SqliteArguments<'q>>;
}

/// Build the upsert statement for `table` once per writer.
fn upsert_sql<R: Record>(table: &str) -> String {
    let columns = R::columns().join(", ");
    let placeholders = vec!["?"; R::columns().len()].join(", ");
    let key = R::conflict_key().join(", ");
    let updates: Vec<String> = R::columns()
        .iter()
        .filter(|c| !R::conflict_key().contains(*c))
        .map(|c| format!("{c} = excluded.{c}"))
        .collect();
    if updates.is_empty() {
        format!("INSERT INTO {table} ({columns}) VALUES ({placeholders}) ON CONFLICT({key}) DO NOTHING")
    } else {
        format!(
            "INSERT INTO {table} ({columns}) VALUES ({placeholders}) ON CONFLICT({key}) DO UPDATE SET {}",
            updates.join(", ")
        )
    }
}

/// Counters reported when a writer finishes.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriterReport {
    pub rows: u64,
    pub batches: u64,
}

/// Buffers records for one table and flushes them in transactional,
/// fixed-size upsert batches.
pub struct BatchInserter<R: Record> {
    pool: SqlitePool,
    table: String,
    sql: String,
    batch_size: usize,
    buffer: Vec<R>,
    report: WriterReport,
}

impl<R: Record> BatchInserter<R> {
    pub fn new(pool: SqlitePool, table: &str, batch_size: usize) -> Self {
        Self {
            pool,
            table: table.to_string(),
            sql: upsert_sql::<R>(table),
            batch_size: batch_size.max(1),
            buffer: Vec::new(),
            report: WriterReport::default(),
        }
    }

    /// Append a record, flushing when the buffer reaches the batch size.
    pub async fn add(&mut self, record: R) -> RuntimeResult<()> {
        self.buffer.push(record);
        if self.buffer.len() >= self.batch_size {
            self.flush().await?;
        }
        Ok(())
    }

    /// Write the buffered batch in a single transaction.
    ///
    /// On failure nothing from the batch persists and the error is fatal
    /// to the owning subtask.
    pub async fn flush(&mut self) -> RuntimeResult<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for row in &self.buffer {
            row.bind(sqlx::query(&self.sql)).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        self.report.rows += self.buffer.len() as u64;
        self.report.batches += 1;
        debug!(
            table = %self.table,
            rows = self.buffer.len(),
            "flushed batch"
        );
        self.buffer.clear();
        Ok(())
    }

    /// Flush the final partial batch and return the counters.
    pub async fn close(mut self) -> RuntimeResult<WriterReport> {
        self.flush().await?;
        Ok(self.report)
    }

    pub fn report(&self) -> WriterReport {
        self.report
    }
}

/// Sending half of a [`TableWriter`]: collector workers push whole pages
/// through it. Cloneable; the writer drains until every clone is dropped.
pub struct PageSink<R: Record> {
    tx: mpsc::Sender<Vec<R>>,
}

impl<R: Record> Clone for PageSink<R> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<R: Record> PageSink<R> {
    /// Forward one fully-received page. Suspends while the queue is full;
    /// errors once the writer has shut down.
    pub async fn send(&self, page: Vec<R>) -> RuntimeResult<()> {
        self.tx
            .send(page)
            .await
            .map_err(|_| RuntimeError::internal("writer closed before collection finished"))
    }
}

/// Per-table writer task.
pub struct TableWriter<R: Record> {
    handle: JoinHandle<RuntimeResult<WriterReport>>,
    sink: PageSink<R>,
}

impl<R: Record> TableWriter<R> {
    /// Start a writer for `table` with a bounded queue of `queue_pages`
    /// pages.
    ///
    /// After `cancel` fires, the batch in flight finishes (partial row
    /// writes would be worse than late cancellation) but no further page
    /// is consumed.
    pub fn spawn(
        pool: SqlitePool,
        table: &str,
        batch_size: usize,
        queue_pages: usize,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<Vec<R>>(queue_pages.max(1));
        let mut inserter = BatchInserter::new(pool, table, batch_size);
        let handle = tokio::spawn(async move {
            while let Some(page) = rx.recv().await {
                if cancel.is_cancelled() {
                    break;
                }
                for record in page {
                    inserter.add(record).await?;
                }
            }
            inserter.close().await
        });
        Self {
            handle,
            sink: PageSink { tx },
        }
    }

    pub fn sink(&self) -> PageSink<R> {
        self.sink.clone()
    }

    /// Drop the local sink and wait for the writer to drain and flush.
    /// Counters come back so the caller can report progress.
    pub async fn finish(self) -> RuntimeResult<WriterReport> {
        drop(self.sink);
        self.handle
            .await
            .map_err(|e| RuntimeError::internal(format!("writer task panicked: {e}")))?
    }
}

/// Create a raw-envelope table if it is missing.
///
/// Raw tables all share one fixed shape, so their DDL lives here rather
/// than in every plugin's migration scripts — the one piece of schema the
/// runtime owns on behalf of collectors.
pub async fn ensure_raw_table(pool: &SqlitePool, table: &str) -> RuntimeResult<()> {
    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {table} (
            id TEXT PRIMARY KEY,
            params TEXT NOT NULL,
            data TEXT NOT NULL,
            url TEXT NOT NULL,
            input TEXT,
            created_at INTEGER NOT NULL
        )
        "#
    ))
    .execute(pool)
    .await?;
    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS idx_{table}_params ON {table}(params)"
    ))
    .execute(pool)
    .await?;
    Ok(())
}

impl Record for RawEnvelope {
    fn columns() -> &'static [&'static str] {
        &["id", "params", "data", "url", "input", "created_at"]
    }

    fn conflict_key() -> &'static [&'static str] {
        &["id"]
    }

    fn bind<'q>(
        &'q self,
        query: Query<'q, Sqlite, SqliteArguments<'q>>,
    ) -> Query<'q, Sqlite, SqliteArguments<'q>> {
        query
            .bind(&self.id)
            .bind(&self.params)
            .bind(self.data.to_string())
            .bind(&self.url)
            .bind(self.input.as_ref().map(|v| v.to_string()))
            .bind(self.created_at.timestamp())
    }
}
