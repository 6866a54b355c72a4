//! Tracing subscriber setup.
//!
//! Host applications call [`init`] once at startup; embedded and test
//! usage can skip it and install their own subscriber instead. The
//! default filter keeps runtime lifecycle at `info` and per-page chatter
//! at `debug`, overridable through `RUST_LOG`.

use tracing_subscriber::{fmt, EnvFilter};

/// Install the global tracing subscriber. Safe to call once; subsequent
/// calls are ignored (some host already installed one).
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
