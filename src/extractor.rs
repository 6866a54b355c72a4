//! Raw-envelope extraction into tool-layer tables.
//!
//! Extract subtasks replay the raw rows a collect subtask persisted and
//! turn each envelope into zero or more typed records, written through
//! the same batched upsert path as everything else. Every produced record
//! carries [`Provenance`] back to its envelope, so any stored row can be
//! traced to the API response and collection parameters that derived it.

use futures::TryStreamExt;
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use tracing::info;

use crate::error::{RuntimeError, RuntimeResult};
use crate::models::{params_fingerprint, Provenance, RawEnvelope};
use crate::writer::{BatchInserter, Record};

/// Transform one envelope into tool-layer records. Returning an empty
/// vec skips the envelope (e.g. a pull request in an issue listing).
/// [`Provenance::from_envelope`] supplies the provenance values.
pub type Extract<R> = Box<dyn Fn(&RawEnvelope) -> RuntimeResult<Vec<R>> + Send + Sync>;

pub struct ExtractorArgs<R: Record> {
    /// Raw table to replay, e.g. `_raw_issues`.
    pub table: String,
    /// Must match the params the collect subtask ran with; scopes the
    /// replay to this collection's rows.
    pub params: Value,
    pub extract: Extract<R>,
}

pub struct Extractor<R: Record> {
    args: ExtractorArgs<R>,
    fingerprint: String,
}

impl<R: Record> Extractor<R> {
    pub fn new(args: ExtractorArgs<R>) -> Self {
        let fingerprint = params_fingerprint(&args.params);
        Self { args, fingerprint }
    }

    /// Replay the raw rows in insertion order through the transform into
    /// `writer`. Returns the number of records produced. The caller owns
    /// the writer and decides when to close it, so several extractors can
    /// share one target table.
    pub async fn execute(
        &self,
        pool: &SqlitePool,
        writer: &mut BatchInserter<R>,
    ) -> RuntimeResult<u64> {
        let sql = format!(
            "SELECT id, params, data, url, input, created_at FROM {} WHERE params = ? ORDER BY rowid",
            self.args.table
        );
        let mut rows = sqlx::query(&sql).bind(&self.fingerprint).fetch(pool);

        let mut produced = 0u64;
        while let Some(row) = rows.try_next().await? {
            let envelope = decode_envelope(&row)?;
            for record in (self.args.extract)(&envelope)? {
                writer.add(record).await?;
                produced += 1;
            }
        }
        info!(table = %self.args.table, records = produced, "extraction finished");
        Ok(produced)
    }
}

fn decode_envelope(row: &sqlx::sqlite::SqliteRow) -> RuntimeResult<RawEnvelope> {
    let data: String = row.get("data");
    let input: Option<String> = row.get("input");
    let created_at: i64 = row.get("created_at");
    Ok(RawEnvelope {
        id: row.get("id"),
        params: row.get("params"),
        data: serde_json::from_str(&data)
            .map_err(|e| RuntimeError::internal(format!("corrupt raw envelope: {e}")))?,
        url: row.get("url"),
        input: input
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(|e| RuntimeError::internal(format!("corrupt raw input: {e}")))?,
        created_at: chrono::DateTime::from_timestamp(created_at, 0)
            .ok_or_else(|| RuntimeError::internal("raw envelope timestamp out of range"))?,
    })
}
