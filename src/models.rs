//! Core data models used throughout the runtime.
//!
//! These types describe a plugin's subtasks, the tasks that execute them,
//! and the raw envelopes that carry collected API responses into storage.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Static description of one phase (collect/extract/convert) of a
/// plugin's task. Immutable once registered.
///
/// The `reads` and `writes` table sets are declared explicitly by the
/// plugin author; the scheduler's ordering is only as correct as these
/// declarations.
#[derive(Debug, Clone)]
pub struct SubtaskMeta {
    /// Unique within a plugin.
    pub name: String,
    pub description: String,
    /// Always enabled, even when the caller selects a subset.
    pub required: bool,
    pub enabled_by_default: bool,
    /// Tables this subtask consumes.
    pub reads: Vec<String>,
    /// Tables this subtask produces.
    pub writes: Vec<String>,
    /// Free-form domain tags, e.g. "TICKET" or "CICD".
    pub domain_types: Vec<String>,
}

impl SubtaskMeta {
    /// A collect-style subtask: no upstream tables, writes one raw table.
    pub fn collector(name: &str, description: &str, raw_table: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            required: false,
            enabled_by_default: true,
            reads: Vec::new(),
            writes: vec![raw_table.to_string()],
            domain_types: Vec::new(),
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn disabled_by_default(mut self) -> Self {
        self.enabled_by_default = false;
        self
    }

    pub fn with_domain_types(mut self, types: &[&str]) -> Self {
        self.domain_types = types.iter().map(|t| t.to_string()).collect();
        self
    }
}

/// Lifecycle of a [`Task`] row. Terminal once succeeded or failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Created,
    Running,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Created => "created",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(TaskStatus::Created),
            "running" => Some(TaskStatus::Running),
            "succeeded" => Some(TaskStatus::Succeeded),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed)
    }
}

/// One plugin invocation within a pipeline, persisted in `_tasks`.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub pipeline_id: String,
    pub plugin: String,
    pub status: TaskStatus,
    /// First failing subtask's error message, empty on success.
    pub message: String,
    pub failed_subtask: Option<String>,
    pub finished_subtasks: i64,
    pub total_subtasks: i64,
    pub finished_records: i64,
    pub began_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Execution record of a single subtask, persisted in `_subtasks` for
/// timing and audit. Written whether the subtask succeeded or not.
#[derive(Debug, Clone)]
pub struct SubtaskRecord {
    pub task_id: String,
    pub name: String,
    /// 1-based position in the executed order.
    pub number: i64,
    pub records: i64,
    pub began_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Provenance columns carried by every tool-layer row, linking it back
/// to the raw envelope and collection parameters that produced it.
#[derive(Debug, Clone, Default)]
pub struct Provenance {
    pub raw_data_table: String,
    pub raw_data_params: String,
    pub raw_data_id: String,
    pub raw_data_remark: String,
}

impl Provenance {
    /// Provenance for a record derived from `envelope`, which was
    /// collected into `raw_table`.
    pub fn from_envelope(raw_table: &str, envelope: &RawEnvelope) -> Self {
        Self {
            raw_data_table: raw_table.to_string(),
            raw_data_params: envelope.params.clone(),
            raw_data_id: envelope.id.clone(),
            raw_data_remark: String::new(),
        }
    }
}

/// A persisted raw API response row. Never mutated after creation;
/// re-collection with the same parameters supersedes by key.
#[derive(Debug, Clone)]
pub struct RawEnvelope {
    /// Deterministic: the same (params, page, index) always maps to the
    /// same id, so re-delivered pages upsert instead of duplicating.
    pub id: String,
    /// Fingerprint of the collection parameters, see [`params_fingerprint`].
    pub params: String,
    /// The raw record as returned by the remote API.
    pub data: Value,
    /// URL the record was fetched from.
    pub url: String,
    /// Iteration input that parameterized the request, if any.
    pub input: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl RawEnvelope {
    pub fn new(params: &str, page_key: &str, index: usize, data: Value, url: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(params.as_bytes());
        hasher.update(page_key.as_bytes());
        hasher.update(index.to_le_bytes());
        let id = hex::encode(hasher.finalize());
        Self {
            id,
            params: params.to_string(),
            data,
            url: url.to_string(),
            input: None,
            created_at: Utc::now(),
        }
    }
}

/// Stable fingerprint of a collection-parameter value.
///
/// Identifies the minimal scope of data a collect run covers (e.g. one
/// connection + one project), so re-collection can find and supersede
/// its own rows without touching a sibling scope's.
pub fn params_fingerprint(params: &Value) -> String {
    let canonical = params.to_string();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}
