//! Task and pipeline execution.
//!
//! A task is one plugin invocation: the registered (already ordered)
//! subtask list is filtered by the caller's selection, executed in order,
//! and its status and progress counters are persisted in the framework's
//! `_tasks` / `_subtasks` tables as it runs. A failed subtask fails the
//! task, and because the order is topological, subtasks that depend on a
//! failed subtask's output are never started. A missing remote resource
//! (`NotFound`) is the one failure that lets independent siblings keep
//! running; anything else stops the task where it stands.
//!
//! A pipeline is an ordered list of task specs run sequentially, stopping
//! at the first failed task.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::collector::ApiClient;
use crate::config::RuntimeConfig;
use crate::error::{RuntimeError, RuntimeResult};
use crate::migrate::{MigrationScript, Migrator, SqlScript};
use crate::models::{SubtaskMeta, SubtaskRecord, Task, TaskStatus};
use crate::plugin::{PluginRegistry, SubtaskContext};
use crate::progress::{NoProgress, ProgressEvent, ProgressReporter};

/// Schema owned by the runtime itself, applied ahead of plugin scripts.
pub fn framework_migrations() -> Vec<Arc<dyn MigrationScript>> {
    vec![Arc::new(SqlScript::new(
        20240101000001,
        "create task bookkeeping tables",
        &[
            r#"
            CREATE TABLE IF NOT EXISTS _tasks (
                id TEXT PRIMARY KEY,
                pipeline_id TEXT,
                plugin TEXT NOT NULL,
                status TEXT NOT NULL,
                message TEXT NOT NULL DEFAULT '',
                failed_subtask TEXT,
                finished_subtasks INTEGER NOT NULL DEFAULT 0,
                total_subtasks INTEGER NOT NULL DEFAULT 0,
                finished_records INTEGER NOT NULL DEFAULT 0,
                began_at INTEGER,
                finished_at INTEGER,
                created_at INTEGER NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_tasks_pipeline ON _tasks(pipeline_id)",
            r#"
            CREATE TABLE IF NOT EXISTS _subtasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL,
                name TEXT NOT NULL,
                number INTEGER NOT NULL,
                records INTEGER NOT NULL DEFAULT 0,
                began_at INTEGER NOT NULL,
                finished_at INTEGER NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_subtasks_task ON _subtasks(task_id)",
        ],
    ))]
}

/// One task to run: which plugin, with what options, and optionally which
/// subtasks.
pub struct TaskSpec {
    pub plugin: String,
    pub options: Value,
    /// Explicit subtask selection. When present and non-empty, only the
    /// listed subtasks run — plus `required` ones, which cannot be
    /// disabled.
    pub subtasks: Option<Vec<String>>,
    pub pipeline_id: Option<String>,
    /// Task-scoped cancellation signal; callers keep a clone to cancel.
    pub cancel: CancellationToken,
}

impl TaskSpec {
    pub fn new(plugin: &str, options: Value) -> Self {
        Self {
            plugin: plugin.to_string(),
            options,
            subtasks: None,
            pipeline_id: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_subtasks(mut self, names: &[&str]) -> Self {
        self.subtasks = Some(names.iter().map(|n| n.to_string()).collect());
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Outcome of [`Runner::run_pipeline`].
pub struct PipelineReport {
    pub pipeline_id: String,
    pub tasks: Vec<Task>,
}

impl PipelineReport {
    pub fn succeeded(&self) -> bool {
        self.tasks.iter().all(|t| t.status == TaskStatus::Succeeded)
    }
}

pub struct Runner {
    pool: SqlitePool,
    registry: Arc<PluginRegistry>,
    config: RuntimeConfig,
    progress: Arc<dyn ProgressReporter>,
}

impl Runner {
    pub fn new(pool: SqlitePool, registry: Arc<PluginRegistry>, config: RuntimeConfig) -> Self {
        Self {
            pool,
            registry,
            config,
            progress: Arc::new(NoProgress),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Bring the schema up to date: framework scripts first, then every
    /// registered plugin's. Must complete before any task runs; a failure
    /// here is fatal to startup.
    pub async fn init_schema(&self) -> RuntimeResult<u32> {
        let mut migrator = Migrator::new(self.pool.clone());
        migrator.register(framework_migrations())?;
        migrator.register(self.registry.migrations())?;
        migrator.execute().await
    }

    /// Execute one task to completion.
    ///
    /// Subtask failures are reported through the returned task's status,
    /// message, and `failed_subtask` — not as an `Err`, which is reserved
    /// for infrastructure problems (unknown plugin, lost database).
    pub async fn run_task(&self, spec: TaskSpec) -> RuntimeResult<Task> {
        let registered = self.registry.find(&spec.plugin).ok_or_else(|| {
            RuntimeError::bad_input(format!("plugin {} is not registered", spec.plugin))
        })?;
        let selected = select_subtasks(&registered.subtasks, &spec.subtasks)?;

        let task_id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO _tasks (id, pipeline_id, plugin, status, total_subtasks, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&task_id)
        .bind(&spec.pipeline_id)
        .bind(&spec.plugin)
        .bind(TaskStatus::Created.as_str())
        .bind(selected.len() as i64)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        info!(task = %task_id, plugin = %spec.plugin, subtasks = selected.len(), "start task");
        sqlx::query("UPDATE _tasks SET status = ?, began_at = ? WHERE id = ?")
            .bind(TaskStatus::Running.as_str())
            .bind(Utc::now().timestamp())
            .bind(&task_id)
            .execute(&self.pool)
            .await?;

        let api = if registered.capabilities.has_api {
            // The connection's presence was checked at registration.
            let connection = registered.plugin().connection().ok_or_else(|| {
                RuntimeError::internal(format!("plugin {} lost its connection", spec.plugin))
            })?;
            Some(Arc::new(ApiClient::new(
                connection,
                &self.config.api,
                spec.cancel.clone(),
            )?))
        } else {
            None
        };

        let ctx = SubtaskContext {
            pool: self.pool.clone(),
            api: api.clone(),
            options: spec.options.clone(),
            cancel: spec.cancel.clone(),
            writer: self.config.writer.clone(),
        };

        let total = selected.len();
        let mut finished = 0i64;
        let mut total_records = 0i64;
        let mut failure: Option<(String, RuntimeError)> = None;
        // Tables whose producer failed; anything downstream of them is
        // skipped rather than run against missing data.
        let mut poisoned_tables: HashSet<String> = HashSet::new();

        for (index, meta) in selected.iter().enumerate() {
            if spec.cancel.is_cancelled() {
                // Not a subtask failure; the task as a whole was stopped.
                failure = Some((String::new(), RuntimeError::internal("task cancelled")));
                break;
            }

            if meta.reads.iter().any(|t| poisoned_tables.contains(t)) {
                warn!(task = %task_id, subtask = %meta.name, "skipping subtask, upstream failed");
                poisoned_tables.extend(meta.writes.iter().cloned());
                continue;
            }

            self.progress.report(ProgressEvent::SubtaskStarted {
                subtask: meta.name.clone(),
                number: index + 1,
                total,
            });
            let began_at = Utc::now();
            let result = registered.plugin().execute_subtask(meta, &ctx).await;

            // Timing row is written whether the subtask succeeded or not.
            let record = SubtaskRecord {
                task_id: task_id.clone(),
                name: meta.name.clone(),
                number: (index + 1) as i64,
                records: *result.as_ref().unwrap_or(&0) as i64,
                began_at,
                finished_at: Utc::now(),
            };
            sqlx::query(
                "INSERT INTO _subtasks (task_id, name, number, records, began_at, finished_at) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&record.task_id)
            .bind(&record.name)
            .bind(record.number)
            .bind(record.records)
            .bind(record.began_at.timestamp())
            .bind(record.finished_at.timestamp())
            .execute(&self.pool)
            .await?;

            match result {
                Ok(n) => {
                    finished += 1;
                    total_records += n as i64;
                    sqlx::query(
                        "UPDATE _tasks SET finished_subtasks = ?, finished_records = ? WHERE id = ?",
                    )
                    .bind(finished)
                    .bind(total_records)
                    .bind(&task_id)
                    .execute(&self.pool)
                    .await?;
                    self.progress.report(ProgressEvent::SubtaskFinished {
                        subtask: meta.name.clone(),
                        number: index + 1,
                        total,
                        records: n,
                    });
                }
                Err(err) => {
                    // A missing remote resource fails this subtask and its
                    // dependents but leaves independent siblings running;
                    // everything else aborts the task.
                    let missing = matches!(err, RuntimeError::NotFound(_));
                    let err = err.in_subtask(&meta.name);
                    error!(task = %task_id, %err, "subtask failed");
                    if failure.is_none() {
                        failure = Some((meta.name.clone(), err));
                    }
                    if missing {
                        poisoned_tables.extend(meta.writes.iter().cloned());
                        continue;
                    }
                    break;
                }
            }
        }

        // A cancellation during the final subtask still fails the task.
        if failure.is_none() && spec.cancel.is_cancelled() {
            failure = Some((String::new(), RuntimeError::internal("task cancelled")));
        }

        // Teardown happens on every path: close the plugin, release the
        // connection.
        if registered.capabilities.closeable {
            if let Err(err) = registered.plugin().close().await {
                warn!(plugin = %spec.plugin, %err, "plugin close failed");
            }
        }
        drop(ctx);
        if let Some(api) = api {
            match Arc::try_unwrap(api) {
                Ok(client) => client.release(),
                Err(_) => warn!(plugin = %spec.plugin, "api client still shared at task end"),
            }
        }

        match &failure {
            Some((subtask, err)) => {
                sqlx::query(
                    "UPDATE _tasks SET status = ?, message = ?, failed_subtask = ?, finished_at = ? \
                     WHERE id = ?",
                )
                .bind(TaskStatus::Failed.as_str())
                .bind(err.to_string())
                .bind(if subtask.is_empty() { None } else { Some(subtask.as_str()) })
                .bind(Utc::now().timestamp())
                .bind(&task_id)
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query("UPDATE _tasks SET status = ?, finished_at = ? WHERE id = ?")
                    .bind(TaskStatus::Succeeded.as_str())
                    .bind(Utc::now().timestamp())
                    .bind(&task_id)
                    .execute(&self.pool)
                    .await?;
            }
        }

        let task = self.get_task(&task_id).await?;
        info!(task = %task_id, status = task.status.as_str(), "end task");
        Ok(task)
    }

    /// Run a pipeline's tasks in order, stopping at the first failure.
    pub async fn run_pipeline(&self, specs: Vec<TaskSpec>) -> RuntimeResult<PipelineReport> {
        let pipeline_id = Uuid::new_v4().to_string();
        info!(pipeline = %pipeline_id, tasks = specs.len(), "start pipeline");
        let mut tasks = Vec::with_capacity(specs.len());
        for mut spec in specs {
            spec.pipeline_id = Some(pipeline_id.clone());
            let task = self.run_task(spec).await?;
            let failed = task.status == TaskStatus::Failed;
            tasks.push(task);
            if failed {
                warn!(pipeline = %pipeline_id, "pipeline stopped at failed task");
                break;
            }
        }
        Ok(PipelineReport { pipeline_id, tasks })
    }

    /// Load a task row.
    pub async fn get_task(&self, id: &str) -> RuntimeResult<Task> {
        let row = sqlx::query("SELECT * FROM _tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| RuntimeError::not_found(format!("task {id}")))?;
        task_from_row(&row)
    }
}

fn task_from_row(row: &sqlx::sqlite::SqliteRow) -> RuntimeResult<Task> {
    let status: String = row.get("status");
    let began_at: Option<i64> = row.get("began_at");
    let finished_at: Option<i64> = row.get("finished_at");
    Ok(Task {
        id: row.get("id"),
        pipeline_id: row.get::<Option<String>, _>("pipeline_id").unwrap_or_default(),
        plugin: row.get("plugin"),
        status: TaskStatus::parse(&status)
            .ok_or_else(|| RuntimeError::internal(format!("unknown task status {status}")))?,
        message: row.get("message"),
        failed_subtask: row.get("failed_subtask"),
        finished_subtasks: row.get("finished_subtasks"),
        total_subtasks: row.get("total_subtasks"),
        finished_records: row.get("finished_records"),
        began_at: began_at.and_then(|t| DateTime::<Utc>::from_timestamp(t, 0)),
        finished_at: finished_at.and_then(|t| DateTime::<Utc>::from_timestamp(t, 0)),
    })
}

/// Apply the caller's subtask selection to the scheduled order.
///
/// An explicit non-empty selection disables everything else; unknown
/// names are an error; `required` subtasks are always re-enabled.
fn select_subtasks(
    ordered: &[SubtaskMeta],
    selection: &Option<Vec<String>>,
) -> RuntimeResult<Vec<SubtaskMeta>> {
    let mut enabled: HashMap<&str, bool> = ordered
        .iter()
        .map(|m| (m.name.as_str(), m.enabled_by_default))
        .collect();

    if let Some(names) = selection {
        if !names.is_empty() {
            for flag in enabled.values_mut() {
                *flag = false;
            }
            for name in names {
                match enabled.get_mut(name.as_str()) {
                    Some(flag) => *flag = true,
                    None => {
                        return Err(RuntimeError::bad_input(format!(
                            "subtask {name} does not exist"
                        )))
                    }
                }
            }
        }
    }

    for meta in ordered {
        if meta.required {
            enabled.insert(meta.name.as_str(), true);
        }
    }

    Ok(ordered
        .iter()
        .filter(|m| enabled[m.name.as_str()])
        .cloned()
        .collect())
}
