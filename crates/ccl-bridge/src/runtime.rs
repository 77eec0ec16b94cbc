//! Shared tokio runtime singleton.
//!
//! Every blocking Python entry point runs its future through
//! `get_runtime()?.block_on(...)` with the GIL released, so link reader
//! and writer tasks keep running on the runtime's worker threads.

use std::sync::OnceLock;

use pyo3::prelude::*;
use tokio::runtime::Runtime;

use crate::errors::PyCclError;

static RUNTIME: OnceLock<std::io::Result<Runtime>> = OnceLock::new();

/// Return (or lazily create) the global multi-threaded tokio runtime.
pub fn get_runtime() -> PyResult<&'static Runtime> {
    RUNTIME
        .get_or_init(|| {
            tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .thread_name("ccl-worker")
                .build()
        })
        .as_ref()
        .map_err(|e| PyCclError::new_err(format!("failed to create tokio runtime: {e}")))
}
