//! End-to-end runtime flow: migrations, plugin registration, task and
//! pipeline execution, provenance, and status bookkeeping — against a
//! loopback stub API and a scratch SQLite database.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments};
use sqlx::SqlitePool;

use lakerunner::collector::{ApiClient, CollectorArgs, PageCursor, Pagination, ParsedPage};
use lakerunner::config::{
    ApiConfig, AuthConfig, ConnectionConfig, DbConfig, RateLimitConfig, RuntimeConfig, WriterConfig,
};
use lakerunner::error::{RuntimeError, RuntimeResult};
use lakerunner::extractor::{Extractor, ExtractorArgs};
use lakerunner::migrate::{MigrationScript, SqlScript};
use lakerunner::models::{Provenance, SubtaskMeta, TaskStatus};
use lakerunner::plugin::{CollectionPlugin, PluginCapabilities, PluginRegistry, SubtaskContext};
use lakerunner::progress::{ProgressEvent, ProgressReporter};
use lakerunner::runner::{Runner, TaskSpec};
use lakerunner::writer::Record;

const RAW_TABLE: &str = "_raw_tracker_issues";
const TOOL_TABLE: &str = "tracker_issues";

/// Tool-layer issue row with provenance columns.
struct IssueRow {
    id: i64,
    title: String,
    provenance: Provenance,
}

impl Record for IssueRow {
    fn columns() -> &'static [&'static str] {
        &[
            "id",
            "title",
            "raw_data_table",
            "raw_data_params",
            "raw_data_id",
            "raw_data_remark",
        ]
    }

    fn conflict_key() -> &'static [&'static str] {
        &["id"]
    }

    fn bind<'q>(
        &'q self,
        query: Query<'q, Sqlite, SqliteArguments<'q>>,
    ) -> Query<'q, Sqlite, SqliteArguments<'q>> {
        query
            .bind(self.id)
            .bind(&self.title)
            .bind(&self.provenance.raw_data_table)
            .bind(&self.provenance.raw_data_params)
            .bind(&self.provenance.raw_data_id)
            .bind(&self.provenance.raw_data_remark)
    }
}

/// Issue-tracker plugin: one collect subtask feeding one extract subtask.
struct TrackerPlugin {
    name: String,
    connection: ConnectionConfig,
    migration_version: u64,
    closed: AtomicUsize,
}

impl TrackerPlugin {
    fn new(name: &str, endpoint: &str) -> Self {
        Self {
            name: name.to_string(),
            connection: ConnectionConfig {
                endpoint: endpoint.to_string(),
                auth: AuthConfig {
                    token: Some("tracker-token".to_string()),
                },
                rate_limit: RateLimitConfig {
                    requests_per_hour: 3_600_000,
                },
            },
            migration_version: 20240315000001,
            closed: AtomicUsize::new(0),
        }
    }

    /// Migration versions are unique across the whole registry, so a
    /// second instance registered alongside needs its own.
    fn with_migration_version(mut self, version: u64) -> Self {
        self.migration_version = version;
        self
    }

    fn scope_params(&self) -> Value {
        json!({"connection_id": 1, "project": "demo"})
    }
}

#[async_trait]
impl CollectionPlugin for TrackerPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Collects and extracts issues from the tracker API"
    }

    fn capabilities(&self) -> PluginCapabilities {
        PluginCapabilities {
            has_api: true,
            has_migrations: true,
            closeable: true,
        }
    }

    fn subtasks(&self) -> Vec<SubtaskMeta> {
        vec![
            SubtaskMeta {
                name: "extractIssues".to_string(),
                description: "Extract raw issues into the tool layer".to_string(),
                required: false,
                enabled_by_default: true,
                reads: vec![RAW_TABLE.to_string()],
                writes: vec![TOOL_TABLE.to_string()],
                domain_types: vec!["TICKET".to_string()],
            },
            // Declared after the extractor on purpose; the scheduler puts
            // it first.
            SubtaskMeta::collector("collectIssues", "Collect issues from the API", RAW_TABLE)
                .with_domain_types(&["TICKET"]),
        ]
    }

    fn migrations(&self) -> Vec<Arc<dyn MigrationScript>> {
        let create_issues = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {TOOL_TABLE} (
                id INTEGER PRIMARY KEY,
                title TEXT NOT NULL,
                raw_data_table TEXT NOT NULL DEFAULT '',
                raw_data_params TEXT NOT NULL DEFAULT '',
                raw_data_id TEXT NOT NULL DEFAULT '',
                raw_data_remark TEXT NOT NULL DEFAULT ''
            )
            "#
        );
        vec![Arc::new(SqlScript::new(
            self.migration_version,
            "create tracker issue table",
            &[create_issues.as_str()],
        ))]
    }

    fn connection(&self) -> Option<&ConnectionConfig> {
        Some(&self.connection)
    }

    async fn execute_subtask(
        &self,
        subtask: &SubtaskMeta,
        ctx: &SubtaskContext,
    ) -> RuntimeResult<u64> {
        match subtask.name.as_str() {
            "collectIssues" => {
                let stats = ctx
                    .collect(CollectorArgs {
                        table: RAW_TABLE.to_string(),
                        params: self.scope_params(),
                        pagination: Pagination::Cursor { page_size: 2 },
                        incremental: false,
                        build_request: Box::new(|api: &ApiClient, cursor: &PageCursor| {
                            let mut query: Vec<(&str, String)> =
                                vec![("per_page", "2".to_string())];
                            if let Some(token) = &cursor.cursor {
                                query.push(("cursor", token.clone()));
                            }
                            api.get("issues").query(&query)
                        }),
                        parse_response: Box::new(|body| {
                            let value: Value = serde_json::from_slice(body).map_err(|e| {
                                RuntimeError::internal(format!("bad issue page: {e}"))
                            })?;
                            Ok(ParsedPage {
                                records: value["issues"].as_array().cloned().unwrap_or_default(),
                                next_cursor: value["next_cursor"].as_str().map(String::from),
                                total: None,
                            })
                        }),
                    })
                    .await?;
                Ok(stats.records)
            }
            "extractIssues" => {
                let extractor = Extractor::new(ExtractorArgs {
                    table: RAW_TABLE.to_string(),
                    params: self.scope_params(),
                    extract: Box::new(|envelope| {
                        let Some(id) = envelope.data.get("id").and_then(Value::as_i64) else {
                            return Ok(Vec::new());
                        };
                        Ok(vec![IssueRow {
                            id,
                            title: envelope.data["title"]
                                .as_str()
                                .unwrap_or_default()
                                .to_string(),
                            provenance: Provenance::from_envelope(RAW_TABLE, envelope),
                        }])
                    }),
                });
                let mut writer = ctx.tool_writer::<IssueRow>(TOOL_TABLE);
                let produced = extractor.execute(&ctx.pool, &mut writer).await?;
                writer.close().await?;
                Ok(produced)
            }
            other => Err(RuntimeError::bad_input(format!("unknown subtask {other}"))),
        }
    }

    async fn close(&self) -> RuntimeResult<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Records every progress event the runner emits.
#[derive(Default)]
struct RecordingProgress(Mutex<Vec<ProgressEvent>>);

impl ProgressReporter for RecordingProgress {
    fn report(&self, event: ProgressEvent) {
        self.0.lock().unwrap().push(event);
    }
}

/// Stub tracker API: two cursor pages of three issues.
fn tracker_stub() -> Router {
    Router::new().route(
        "/issues",
        get(|req: axum::extract::Query<std::collections::HashMap<String, String>>| async move {
            let body = match req.get("cursor").map(String::as_str) {
                None => json!({
                    "issues": [
                        {"id": 1, "title": "crash on save"},
                        {"id": 2, "title": "slow search"}
                    ],
                    "next_cursor": "c2"
                }),
                Some(_) => json!({
                    "issues": [{"id": 3, "title": "login loop"}],
                    "next_cursor": null
                }),
            };
            Json(body)
        }),
    )
}

/// Stub that always reports a server error.
fn broken_stub() -> Router {
    Router::new().route(
        "/issues",
        get(|| async { (StatusCode::BAD_GATEWAY, Json(json!({}))) }),
    )
}

async fn spawn_stub(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn runtime_config(tmp: &tempfile::TempDir) -> RuntimeConfig {
    RuntimeConfig {
        db: DbConfig {
            path: tmp.path().join("lake.sqlite"),
        },
        api: ApiConfig {
            timeout_secs: 5,
            max_retries: 1,
            workers: 4,
            requests_per_hour: 3_600_000,
        },
        writer: WriterConfig {
            batch_size: 500,
            queue_pages: 4,
        },
    }
}

struct Harness {
    _tmp: tempfile::TempDir,
    pool: SqlitePool,
    runner: Runner,
    plugin: Arc<TrackerPlugin>,
    progress: Arc<RecordingProgress>,
}

async fn harness_with(endpoint: &str) -> Harness {
    let tmp = tempfile::TempDir::new().unwrap();
    let config = runtime_config(&tmp);
    let pool = lakerunner::db::connect(&config.db).await.unwrap();

    let plugin = Arc::new(TrackerPlugin::new("tracker", endpoint));
    let mut registry = PluginRegistry::new();
    registry.register(plugin.clone()).unwrap();

    let progress = Arc::new(RecordingProgress::default());
    let runner = Runner::new(pool.clone(), Arc::new(registry), config)
        .with_progress(progress.clone());
    runner.init_schema().await.unwrap();

    Harness {
        _tmp: tmp,
        pool,
        runner,
        plugin,
        progress,
    }
}

#[tokio::test]
async fn collect_and_extract_round_trip_with_provenance() {
    let endpoint = spawn_stub(tracker_stub()).await;
    let h = harness_with(&endpoint).await;

    let task = h
        .runner
        .run_task(TaskSpec::new("tracker", json!({})))
        .await
        .unwrap();

    assert_eq!(task.status, TaskStatus::Succeeded);
    assert_eq!(task.total_subtasks, 2);
    assert_eq!(task.finished_subtasks, 2);
    assert_eq!(task.finished_records, 6, "3 collected + 3 extracted");
    assert!(task.failed_subtask.is_none());
    assert!(task.began_at.is_some() && task.finished_at.is_some());

    // Raw layer holds the three envelopes.
    let raw_count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {RAW_TABLE}"))
        .fetch_one(&h.pool)
        .await
        .unwrap();
    assert_eq!(raw_count, 3);

    // Tool layer rows trace back to real raw rows.
    let rows: Vec<(i64, String, String, String)> = sqlx::query_as(&format!(
        "SELECT id, title, raw_data_table, raw_data_id FROM {TOOL_TABLE} ORDER BY id"
    ))
    .fetch_all(&h.pool)
    .await
    .unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0].1, "crash on save");
    for (_, _, raw_table, raw_id) in &rows {
        assert_eq!(raw_table, RAW_TABLE);
        let exists: bool = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) > 0 FROM {RAW_TABLE} WHERE id = ?"
        ))
        .bind(raw_id)
        .fetch_one(&h.pool)
        .await
        .unwrap();
        assert!(exists);
    }

    // Subtask timing rows, in scheduled order: collect before extract.
    let subtasks: Vec<(String, i64)> =
        sqlx::query_as("SELECT name, records FROM _subtasks WHERE task_id = ? ORDER BY number")
            .bind(&task.id)
            .fetch_all(&h.pool)
            .await
            .unwrap();
    assert_eq!(subtasks.len(), 2);
    assert_eq!(subtasks[0].0, "collectIssues");
    assert_eq!(subtasks[1].0, "extractIssues");
    assert_eq!(subtasks[0].1, 3);

    // Progress: started + finished per subtask.
    let events = h.progress.0.lock().unwrap();
    let started = events
        .iter()
        .filter(|e| matches!(e, ProgressEvent::SubtaskStarted { .. }))
        .count();
    let finished = events
        .iter()
        .filter(|e| matches!(e, ProgressEvent::SubtaskFinished { .. }))
        .count();
    assert_eq!((started, finished), (2, 2));

    // Closeable plugin closed exactly once.
    assert_eq!(h.plugin.closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn schema_init_is_idempotent_across_restarts() {
    let endpoint = spawn_stub(tracker_stub()).await;
    let h = harness_with(&endpoint).await;

    // harness_with already ran init_schema once; a second run applies
    // nothing.
    assert_eq!(h.runner.init_schema().await.unwrap(), 0);

    let versions: Vec<i64> =
        sqlx::query_scalar("SELECT version FROM _migration_ledger ORDER BY version")
            .fetch_all(&h.pool)
            .await
            .unwrap();
    assert_eq!(versions, vec![20240101000001, 20240315000001]);
}

#[tokio::test]
async fn failed_collect_marks_task_and_skips_dependents() {
    let endpoint = spawn_stub(broken_stub()).await;
    let h = harness_with(&endpoint).await;

    let task = h
        .runner
        .run_task(TaskSpec::new("tracker", json!({})))
        .await
        .unwrap();

    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.failed_subtask.as_deref(), Some("collectIssues"));
    assert!(task.message.contains("collectIssues"));
    assert_eq!(task.finished_subtasks, 0);

    // The extractor depends on the collector's output and never started.
    let subtasks: Vec<String> =
        sqlx::query_scalar("SELECT name FROM _subtasks WHERE task_id = ? ORDER BY number")
            .bind(&task.id)
            .fetch_all(&h.pool)
            .await
            .unwrap();
    assert_eq!(subtasks, vec!["collectIssues".to_string()]);

    // Teardown still ran.
    assert_eq!(h.plugin.closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn pipeline_stops_at_first_failed_task() {
    let good_endpoint = spawn_stub(tracker_stub()).await;
    let broken_endpoint = spawn_stub(broken_stub()).await;

    let tmp = tempfile::TempDir::new().unwrap();
    let config = runtime_config(&tmp);
    let pool = lakerunner::db::connect(&config.db).await.unwrap();

    let mut registry = PluginRegistry::new();
    registry
        .register(Arc::new(
            TrackerPlugin::new("brokentracker", &broken_endpoint)
                .with_migration_version(20240316000001),
        ))
        .unwrap();
    registry
        .register(Arc::new(TrackerPlugin::new("tracker", &good_endpoint)))
        .unwrap();
    let runner = Runner::new(pool.clone(), Arc::new(registry), config);
    runner.init_schema().await.unwrap();

    let report = runner
        .run_pipeline(vec![
            TaskSpec::new("brokentracker", json!({})),
            TaskSpec::new("tracker", json!({})),
        ])
        .await
        .unwrap();

    assert!(!report.succeeded());
    assert_eq!(report.tasks.len(), 1, "second task never started");
    assert_eq!(report.tasks[0].status, TaskStatus::Failed);

    let task_count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM _tasks WHERE pipeline_id = ?")
            .bind(&report.pipeline_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(task_count, 1);
}

#[tokio::test]
async fn explicit_subtask_selection_runs_only_the_collector() {
    let endpoint = spawn_stub(tracker_stub()).await;
    let h = harness_with(&endpoint).await;

    let task = h
        .runner
        .run_task(TaskSpec::new("tracker", json!({})).with_subtasks(&["collectIssues"]))
        .await
        .unwrap();

    assert_eq!(task.status, TaskStatus::Succeeded);
    assert_eq!(task.total_subtasks, 1);

    let raw_count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {RAW_TABLE}"))
        .fetch_one(&h.pool)
        .await
        .unwrap();
    assert_eq!(raw_count, 3);

    let tool_count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {TOOL_TABLE}"))
        .fetch_one(&h.pool)
        .await
        .unwrap();
    assert_eq!(tool_count, 0, "extractor was deselected");
}

/// Plugin with two independent collections plus an extractor that
/// depends on the first one. Used to verify the not-found skip rules.
struct MultiPlugin {
    connection: ConnectionConfig,
    extract_ran: std::sync::atomic::AtomicBool,
}

impl MultiPlugin {
    fn new(endpoint: &str) -> Self {
        Self {
            connection: ConnectionConfig {
                endpoint: endpoint.to_string(),
                auth: AuthConfig::default(),
                rate_limit: RateLimitConfig {
                    requests_per_hour: 3_600_000,
                },
            },
            extract_ran: std::sync::atomic::AtomicBool::new(false),
        }
    }

    fn collect_args(path: &'static str, table: &str) -> CollectorArgs {
        CollectorArgs {
            table: table.to_string(),
            params: json!({"connection_id": 1}),
            pagination: Pagination::Cursor { page_size: 50 },
            incremental: false,
            build_request: Box::new(move |api: &ApiClient, _cursor: &PageCursor| api.get(path)),
            parse_response: Box::new(|body| {
                let value: Value = serde_json::from_slice(body)
                    .map_err(|e| RuntimeError::internal(format!("bad page: {e}")))?;
                Ok(ParsedPage {
                    records: value["items"].as_array().cloned().unwrap_or_default(),
                    next_cursor: None,
                    total: None,
                })
            }),
        }
    }
}

#[async_trait]
impl CollectionPlugin for MultiPlugin {
    fn name(&self) -> &str {
        "multi"
    }

    fn capabilities(&self) -> PluginCapabilities {
        PluginCapabilities {
            has_api: true,
            has_migrations: false,
            closeable: false,
        }
    }

    fn subtasks(&self) -> Vec<SubtaskMeta> {
        vec![
            SubtaskMeta::collector("collectMissing", "Collect a resource that is gone", "_raw_missing"),
            SubtaskMeta {
                name: "extractMissing".to_string(),
                description: String::new(),
                required: false,
                enabled_by_default: true,
                reads: vec!["_raw_missing".to_string()],
                writes: vec!["missing_items".to_string()],
                domain_types: Vec::new(),
            },
            SubtaskMeta::collector("collectItems", "Collect a healthy resource", "_raw_items"),
        ]
    }

    fn connection(&self) -> Option<&ConnectionConfig> {
        Some(&self.connection)
    }

    async fn execute_subtask(
        &self,
        subtask: &SubtaskMeta,
        ctx: &SubtaskContext,
    ) -> RuntimeResult<u64> {
        match subtask.name.as_str() {
            "collectMissing" => Ok(ctx
                .collect(Self::collect_args("gone", "_raw_missing"))
                .await?
                .records),
            "collectItems" => Ok(ctx
                .collect(Self::collect_args("items", "_raw_items"))
                .await?
                .records),
            "extractMissing" => {
                self.extract_ran
                    .store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(0)
            }
            other => Err(RuntimeError::bad_input(format!("unknown subtask {other}"))),
        }
    }
}

#[tokio::test]
async fn not_found_fails_the_subtask_but_spares_independent_siblings() {
    let app = Router::new()
        .route(
            "/gone",
            get(|| async { (StatusCode::NOT_FOUND, Json(json!({}))) }),
        )
        .route(
            "/items",
            get(|| async { Json(json!({"items": [{"id": 10}, {"id": 11}]})) }),
        );
    let endpoint = spawn_stub(app).await;

    let tmp = tempfile::TempDir::new().unwrap();
    let config = runtime_config(&tmp);
    let pool = lakerunner::db::connect(&config.db).await.unwrap();

    let plugin = Arc::new(MultiPlugin::new(&endpoint));
    let mut registry = PluginRegistry::new();
    registry.register(plugin.clone()).unwrap();
    let runner = Runner::new(pool.clone(), Arc::new(registry), config);
    runner.init_schema().await.unwrap();

    let task = runner.run_task(TaskSpec::new("multi", json!({}))).await.unwrap();

    // The missing resource is recorded as the task's failure...
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.failed_subtask.as_deref(), Some("collectMissing"));
    assert!(task.message.contains("not found"));

    // ...its dependent never ran...
    assert!(!plugin.extract_ran.load(std::sync::atomic::Ordering::SeqCst));

    // ...but the independent collection completed.
    let items: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM _raw_items")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(items, 2);
    assert_eq!(task.finished_subtasks, 1);

    let executed: Vec<String> =
        sqlx::query_scalar("SELECT name FROM _subtasks WHERE task_id = ? ORDER BY number")
            .bind(&task.id)
            .fetch_all(&pool)
            .await
            .unwrap();
    assert_eq!(
        executed,
        vec!["collectMissing".to_string(), "collectItems".to_string()],
        "the skipped extractor leaves no execution record"
    );
}

#[tokio::test]
async fn cancelled_task_fails_without_blaming_a_subtask() {
    // Page one answers, the continuation hangs until cancellation lands.
    let app = Router::new().route(
        "/issues",
        get(|req: axum::extract::Query<std::collections::HashMap<String, String>>| async move {
            if req.get("cursor").is_some() {
                tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            }
            Json(json!({
                "issues": [{"id": 1, "title": "crash on save"}, {"id": 2, "title": "slow search"}],
                "next_cursor": "c2"
            }))
        }),
    );
    let endpoint = spawn_stub(app).await;
    let h = harness_with(&endpoint).await;

    let cancel = tokio_util::sync::CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    let task = h
        .runner
        .run_task(TaskSpec::new("tracker", json!({})).with_cancel(cancel))
        .await
        .unwrap();

    assert!(started.elapsed() < std::time::Duration::from_secs(10));
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.message.contains("cancelled"));
    assert!(
        task.failed_subtask.is_none(),
        "cancellation is a task-level stop, not a subtask failure"
    );

    // The extractor never ran, so nothing partial reached the tool layer.
    let tool_count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {TOOL_TABLE}"))
        .fetch_one(&h.pool)
        .await
        .unwrap();
    assert_eq!(tool_count, 0);

    // Teardown still ran exactly once.
    assert_eq!(h.plugin.closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unknown_plugin_and_unknown_subtask_are_bad_input() {
    let endpoint = spawn_stub(tracker_stub()).await;
    let h = harness_with(&endpoint).await;

    let err = h
        .runner
        .run_task(TaskSpec::new("ghost", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::BadInput(_)));

    let err = h
        .runner
        .run_task(TaskSpec::new("tracker", json!({})).with_subtasks(&["collectGhosts"]))
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::BadInput(_)));
}
