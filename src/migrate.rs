//! Versioned schema migrations.
//!
//! Scripts register at process init and run exactly once, in ascending
//! version order, before any task executes. Applied versions live in the
//! `_migration_ledger` table; on every startup the pending set is the
//! registry minus the ledger. The first failing script halts the run —
//! the process must not serve tasks against a schema in an unknown
//! intermediate state.
//!
//! Each script's `up` must be written so it can resume after a partial
//! application: SQLite does not roll back DDL issued outside the
//! surrounding transaction, so the executor documents rather than
//! enforces idempotence. `CREATE TABLE IF NOT EXISTS` and guarded
//! `ALTER TABLE` are the usual shapes.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::error::{RuntimeError, RuntimeResult};

/// One schema-change script. The version is opaque to the executor apart
/// from ordering; by convention it is a timestamp-shaped integer such as
/// `20240115000001`.
#[async_trait]
pub trait MigrationScript: Send + Sync {
    fn version(&self) -> u64;
    fn name(&self) -> &str;
    async fn up(&self, pool: &SqlitePool) -> RuntimeResult<()>;
}

/// A migration expressed as a fixed list of SQL statements, executed in
/// order. Covers the common add-table/add-column/backfill scripts without
/// a handwritten trait impl.
pub struct SqlScript {
    version: u64,
    name: String,
    statements: Vec<String>,
}

impl SqlScript {
    pub fn new(version: u64, name: &str, statements: &[&str]) -> Self {
        Self {
            version,
            name: name.to_string(),
            statements: statements.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[async_trait]
impl MigrationScript for SqlScript {
    fn version(&self) -> u64 {
        self.version
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn up(&self, pool: &SqlitePool) -> RuntimeResult<()> {
        for statement in &self.statements {
            sqlx::query(statement).execute(pool).await?;
        }
        Ok(())
    }
}

/// Applies registered scripts exactly once, in order. Strictly
/// sequential: no internal concurrency, completes fully before any task
/// begins.
pub struct Migrator {
    pool: SqlitePool,
    scripts: Vec<Arc<dyn MigrationScript>>,
    versions: HashSet<u64>,
}

impl Migrator {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            scripts: Vec::new(),
            versions: HashSet::new(),
        }
    }

    /// Add scripts to the registry.
    ///
    /// Two scripts sharing a version is a fatal registration-time error,
    /// no matter which plugins contributed them.
    pub fn register(&mut self, scripts: Vec<Arc<dyn MigrationScript>>) -> RuntimeResult<()> {
        for script in scripts {
            if !self.versions.insert(script.version()) {
                return Err(RuntimeError::bad_input(format!(
                    "duplicate migration version {} ({})",
                    script.version(),
                    script.name()
                )));
            }
            self.scripts.push(script);
        }
        Ok(())
    }

    /// Apply every pending script in ascending version order.
    ///
    /// On success each script's ledger row is written before the next
    /// script starts; a ledger-write failure is treated exactly like a
    /// script failure. Execution stops at the first failure and the error
    /// names the failing script and version. Returns how many scripts
    /// were applied; a ledger that already covers the registry applies
    /// zero.
    pub async fn execute(&self) -> RuntimeResult<u32> {
        self.ensure_ledger().await?;
        let applied = self.applied_versions().await?;

        let mut pending: Vec<&Arc<dyn MigrationScript>> = self
            .scripts
            .iter()
            .filter(|s| !applied.contains(&s.version()))
            .collect();
        pending.sort_by_key(|s| s.version());

        if pending.is_empty() {
            debug!("schema is up to date");
            return Ok(0);
        }

        let mut count = 0u32;
        for script in pending {
            info!(
                version = script.version(),
                name = script.name(),
                "applying migration"
            );
            let fail = |source: RuntimeError| RuntimeError::Migration {
                version: script.version(),
                name: script.name().to_string(),
                source: Box::new(source),
            };
            script.up(&self.pool).await.map_err(fail)?;
            sqlx::query("INSERT INTO _migration_ledger (version, name, applied_at) VALUES (?, ?, ?)")
                .bind(script.version() as i64)
                .bind(script.name())
                .bind(Utc::now().timestamp())
                .execute(&self.pool)
                .await
                .map_err(|e| fail(e.into()))?;
            count += 1;
        }
        info!(applied = count, "migrations complete");
        Ok(count)
    }

    /// Whether any registered script has not been applied yet.
    pub async fn has_pending(&self) -> RuntimeResult<bool> {
        self.ensure_ledger().await?;
        let applied = self.applied_versions().await?;
        Ok(self.scripts.iter().any(|s| !applied.contains(&s.version())))
    }

    async fn ensure_ledger(&self) -> RuntimeResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS _migration_ledger (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn applied_versions(&self) -> RuntimeResult<HashSet<u64>> {
        let rows: Vec<i64> = sqlx::query_scalar("SELECT version FROM _migration_ledger")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|v| v as u64).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DbConfig;
    use std::sync::Mutex;

    /// Records the order it ran in; optionally fails.
    struct ProbeScript {
        version: u64,
        name: String,
        log: Arc<Mutex<Vec<u64>>>,
        fail: bool,
    }

    #[async_trait]
    impl MigrationScript for ProbeScript {
        fn version(&self) -> u64 {
            self.version
        }

        fn name(&self) -> &str {
            &self.name
        }

        async fn up(&self, _pool: &SqlitePool) -> RuntimeResult<()> {
            self.log.lock().unwrap().push(self.version);
            if self.fail {
                return Err(RuntimeError::internal("boom"));
            }
            Ok(())
        }
    }

    fn probe(version: u64, log: &Arc<Mutex<Vec<u64>>>) -> Arc<dyn MigrationScript> {
        Arc::new(ProbeScript {
            version,
            name: format!("script_{version}"),
            log: Arc::clone(log),
            fail: false,
        })
    }

    async fn test_pool() -> (tempfile::TempDir, SqlitePool) {
        let tmp = tempfile::TempDir::new().unwrap();
        let pool = crate::db::connect(&DbConfig {
            path: tmp.path().join("migrate.sqlite"),
        })
        .await
        .unwrap();
        (tmp, pool)
    }

    async fn ledger_versions(pool: &SqlitePool) -> Vec<i64> {
        sqlx::query_scalar("SELECT version FROM _migration_ledger ORDER BY version")
            .fetch_all(pool)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn applies_in_version_order_regardless_of_registration_order() {
        let (_tmp, pool) = test_pool().await;
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut migrator = Migrator::new(pool.clone());
        migrator
            .register(vec![
                probe(20220101, &log),
                probe(20220301, &log),
                probe(20220201, &log),
            ])
            .unwrap();

        let applied = migrator.execute().await.unwrap();
        assert_eq!(applied, 3);
        assert_eq!(*log.lock().unwrap(), vec![20220101, 20220201, 20220301]);
        assert_eq!(
            ledger_versions(&pool).await,
            vec![20220101, 20220201, 20220301]
        );
    }

    #[tokio::test]
    async fn rerun_with_complete_ledger_applies_nothing() {
        let (_tmp, pool) = test_pool().await;
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut migrator = Migrator::new(pool.clone());
        migrator
            .register(vec![probe(20220101, &log), probe(20220201, &log)])
            .unwrap();
        assert_eq!(migrator.execute().await.unwrap(), 2);
        assert!(!migrator.has_pending().await.unwrap());

        // Fresh process, same registry, same database.
        let mut again = Migrator::new(pool.clone());
        again
            .register(vec![probe(20220101, &log), probe(20220201, &log)])
            .unwrap();
        assert_eq!(again.execute().await.unwrap(), 0);
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn duplicate_version_is_fatal_at_registration() {
        let (_tmp, pool) = test_pool().await;
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut migrator = Migrator::new(pool);
        let err = migrator
            .register(vec![probe(20220101, &log), probe(20220101, &log)])
            .unwrap_err();
        assert!(matches!(err, RuntimeError::BadInput(_)));
        assert!(err.to_string().contains("20220101"));
    }

    #[tokio::test]
    async fn failure_stops_later_scripts_and_keeps_earlier_ledger_rows() {
        let (_tmp, pool) = test_pool().await;
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut migrator = Migrator::new(pool.clone());
        migrator.register(vec![probe(20220101, &log)]).unwrap();
        migrator
            .register(vec![Arc::new(ProbeScript {
                version: 20220201,
                name: "breaks".into(),
                log: Arc::clone(&log),
                fail: true,
            })])
            .unwrap();
        migrator.register(vec![probe(20220301, &log)]).unwrap();

        let err = migrator.execute().await.unwrap_err();
        match &err {
            RuntimeError::Migration { version, name, .. } => {
                assert_eq!(*version, 20220201);
                assert_eq!(name, "breaks");
            }
            other => panic!("expected Migration error, got {other}"),
        }

        // The failing script ran, the later one never started.
        assert_eq!(*log.lock().unwrap(), vec![20220101, 20220201]);
        assert_eq!(ledger_versions(&pool).await, vec![20220101]);
        assert!(migrator.has_pending().await.unwrap());
    }

    #[tokio::test]
    async fn sql_script_runs_statements_in_order() {
        let (_tmp, pool) = test_pool().await;
        let mut migrator = Migrator::new(pool.clone());
        migrator
            .register(vec![Arc::new(SqlScript::new(
                20240101,
                "create boards",
                &[
                    "CREATE TABLE boards (id TEXT PRIMARY KEY, name TEXT NOT NULL)",
                    "CREATE INDEX idx_boards_name ON boards(name)",
                ],
            ))])
            .unwrap();
        migrator.execute().await.unwrap();

        sqlx::query("INSERT INTO boards (id, name) VALUES ('b1', 'sprint')")
            .execute(&pool)
            .await
            .unwrap();
    }
}
