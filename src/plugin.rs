//! Plugin trait and registry.
//!
//! A plugin declares its subtasks, migrations, connection, and an
//! explicit capability set. Registration resolves everything that can be
//! resolved up front — capabilities are checked, migrations collected,
//! and the scheduler runs once to freeze the subtask order — so a broken
//! plugin fails at startup, not mid-collection, and nothing about a
//! registered plugin ever mutates afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::collector::{ApiClient, Collector, CollectorArgs, CollectStats};
use crate::config::{ConnectionConfig, WriterConfig};
use crate::error::{RuntimeError, RuntimeResult};
use crate::migrate::MigrationScript;
use crate::models::{RawEnvelope, SubtaskMeta};
use crate::scheduler::schedule;
use crate::writer::{BatchInserter, Record, TableWriter};

/// What a plugin can do, declared by the plugin itself and resolved once
/// at registration. The runtime never inspects types at runtime to find
/// out.
#[derive(Debug, Clone, Copy, Default)]
pub struct PluginCapabilities {
    /// Talks to a remote API; the runtime builds a rate-limited client
    /// from the plugin's connection for every run.
    pub has_api: bool,
    /// Contributes migration scripts to the executor.
    pub has_migrations: bool,
    /// Wants `close` called when a task finishes.
    pub closeable: bool,
}

/// A data-collection plugin.
///
/// The plugin owns its [`ConnectionConfig`] exclusively; the runtime
/// borrows it read-only to wire a collector for each run.
#[async_trait]
pub trait CollectionPlugin: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    fn capabilities(&self) -> PluginCapabilities;

    /// Subtask declarations in the plugin author's preferred order; the
    /// scheduler only reorders where table dependencies require it.
    fn subtasks(&self) -> Vec<SubtaskMeta>;

    fn migrations(&self) -> Vec<Arc<dyn MigrationScript>> {
        Vec::new()
    }

    /// The connection this plugin collects through. Required when
    /// `capabilities().has_api`.
    fn connection(&self) -> Option<&ConnectionConfig> {
        None
    }

    /// Run one subtask. Returns the number of records it processed.
    async fn execute_subtask(
        &self,
        subtask: &SubtaskMeta,
        ctx: &SubtaskContext,
    ) -> RuntimeResult<u64>;

    /// Called exactly once when a task finishes, on success, failure,
    /// and cancellation alike. Only invoked when `capabilities().closeable`.
    async fn close(&self) -> RuntimeResult<()> {
        Ok(())
    }
}

/// Everything a subtask gets from the runtime for one run: storage, the
/// connection's rate-limited client, the run options, and the task-scoped
/// cancellation signal.
pub struct SubtaskContext {
    pub pool: SqlitePool,
    pub api: Option<Arc<ApiClient>>,
    /// Run options as passed to the task, e.g. which project to collect.
    pub options: Value,
    pub cancel: CancellationToken,
    pub writer: WriterConfig,
}

impl SubtaskContext {
    /// The connection's API client. Errors for plugins registered
    /// without the `has_api` capability.
    pub fn api(&self) -> RuntimeResult<Arc<ApiClient>> {
        self.api
            .clone()
            .ok_or_else(|| RuntimeError::bad_input("plugin has no api capability"))
    }

    /// Writer handle for a tool-layer table.
    pub fn tool_writer<R: Record>(&self, table: &str) -> BatchInserter<R> {
        BatchInserter::new(self.pool.clone(), table, self.writer.batch_size)
    }

    /// Run a full collection: spawns the raw-table writer, drives the
    /// collector into it, and drains the writer before returning. This is
    /// the whole collect-subtask body for most plugins.
    pub async fn collect(&self, args: CollectorArgs) -> RuntimeResult<CollectStats> {
        let writer = TableWriter::<RawEnvelope>::spawn(
            self.pool.clone(),
            &args.table,
            self.writer.batch_size,
            self.writer.queue_pages,
            self.cancel.clone(),
        );
        let collector = Collector::new(self.api()?, args);
        let result = collector.execute(&self.pool, writer.sink()).await;
        let flushed = writer.finish().await;
        let stats = result?;
        flushed?;
        Ok(stats)
    }
}

/// A plugin after registration: capabilities resolved, subtask order
/// frozen. Immutable for the life of the process.
pub struct RegisteredPlugin {
    plugin: Arc<dyn CollectionPlugin>,
    pub capabilities: PluginCapabilities,
    /// Scheduler output; tasks execute in exactly this order.
    pub subtasks: Vec<SubtaskMeta>,
}

impl RegisteredPlugin {
    pub fn plugin(&self) -> &Arc<dyn CollectionPlugin> {
        &self.plugin
    }
}

/// Registry of every plugin the process serves. Built during startup,
/// read-only afterwards.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: HashMap<String, RegisteredPlugin>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin, failing fast on anything the scheduler or
    /// capability declaration can catch before data is touched.
    pub fn register(&mut self, plugin: Arc<dyn CollectionPlugin>) -> RuntimeResult<()> {
        let name = plugin.name().to_string();
        if self.plugins.contains_key(&name) {
            return Err(RuntimeError::bad_input(format!(
                "plugin {name} is already registered"
            )));
        }

        let capabilities = plugin.capabilities();
        if capabilities.has_api && plugin.connection().is_none() {
            return Err(RuntimeError::bad_input(format!(
                "plugin {name} declares has_api but provides no connection"
            )));
        }
        if capabilities.has_migrations && plugin.migrations().is_empty() {
            return Err(RuntimeError::bad_input(format!(
                "plugin {name} declares has_migrations but provides no scripts"
            )));
        }

        // Order the subtasks now; a cycle or a missing producer is a
        // registration failure.
        let subtasks = schedule(&plugin.subtasks())?;
        info!(
            plugin = %name,
            subtasks = subtasks.len(),
            "registered plugin"
        );
        self.plugins.insert(
            name,
            RegisteredPlugin {
                plugin,
                capabilities,
                subtasks,
            },
        );
        Ok(())
    }

    pub fn find(&self, name: &str) -> Option<&RegisteredPlugin> {
        self.plugins.get(name)
    }

    /// Migration scripts from every plugin that declares the migration
    /// capability, for the executor to merge with the framework's own.
    pub fn migrations(&self) -> Vec<Arc<dyn MigrationScript>> {
        let mut scripts = Vec::new();
        for registered in self.plugins.values() {
            if registered.capabilities.has_migrations {
                scripts.extend(registered.plugin.migrations());
            }
        }
        scripts
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }
}
