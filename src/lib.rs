//! # Lakerunner
//!
//! A plugin-driven data collection runtime.
//!
//! Lakerunner is the execution core of a multi-source data-collection
//! platform: plugins declare subtasks that pull records from remote APIs
//! (issue trackers, CI systems, chat tools) and persist them through a
//! shared batched writer, with versioned schema migrations applied before
//! any task runs.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐    ┌───────────────┐    ┌──────────────┐
//! │   Plugins    │───▶│   Scheduler    │───▶│    Runner    │
//! │ subtasks +   │    │ topological   │    │ task status  │
//! │ migrations   │    │ subtask order │    │ + progress   │
//! └──────────────┘    └───────────────┘    └──────┬───────┘
//!                                                 │
//!                       ┌─────────────────────────┤
//!                       ▼                         ▼
//!                 ┌──────────────┐         ┌──────────────┐
//!                 │  Collector   │────────▶│ Batch Writer │
//!                 │ rate-limited │  pages  │ upsert SQLite│
//!                 │  paginated   │         │ transactions │
//!                 └──────────────┘         └──────────────┘
//! ```
//!
//! At startup the [`migrate::Migrator`] brings the schema up to date —
//! framework tables first, then every plugin's scripts, each applied
//! exactly once in version order. Registering a plugin runs the
//! [`scheduler`] over its declared `reads`/`writes` table sets and
//! freezes the resulting order. When a task runs, collect subtasks drive
//! the [`collector`] under a shared hourly budget, pages stream into the
//! [`writer`] through a bounded queue, and extract/convert subtasks
//! replay raw envelopes through the [`extractor`] into tool-layer tables
//! with full provenance.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and connection settings |
//! | [`models`] | Subtask metadata, tasks, raw envelopes, provenance |
//! | [`scheduler`] | Dependency-aware subtask ordering |
//! | [`ratelimit`] | Rolling-hour request pacing |
//! | [`collector`] | Paginated, cancellable API collection |
//! | [`writer`] | Batched idempotent persistence |
//! | [`extractor`] | Raw-envelope replay into tool tables |
//! | [`migrate`] | Versioned schema migrations |
//! | [`plugin`] | Plugin trait, capabilities, registry |
//! | [`runner`] | Task and pipeline execution |
//! | [`progress`] | Progress reporting |
//! | [`db`] | Database connection |
//! | [`logging`] | Tracing setup |

pub mod collector;
pub mod config;
pub mod db;
pub mod error;
pub mod extractor;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod plugin;
pub mod progress;
pub mod ratelimit;
pub mod runner;
pub mod scheduler;
pub mod writer;

pub use error::{RuntimeError, RuntimeResult};
