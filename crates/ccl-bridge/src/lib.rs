//! ccl-bridge: PyO3 bindings for the ccl collective runtime.
//!
//! Produces the native extension module `_ccl`: process-group creation
//! through a `tcp://host:port` rendezvous, the collectives over Python lists
//! or raw bytes (blocking, or as a `Work` with `async_op=True`), and a
//! default group owned by the interpreter.

use std::sync::Arc;
use std::time::Duration;

use pyo3::prelude::*;
use tracing::debug;

use ccl_net::TransportRegistry;

pub mod convert;
pub mod errors;
pub mod group;
pub mod runtime;
pub mod types;
pub mod work;

use errors::{anyhow_to_pyerr, ccl_to_pyerr};
use group::{PyProcessGroup, DEFAULT_GROUP};
use runtime::get_runtime;
use types::{PyBufferDescriptor, PyEnvConfig};
use work::PyWork;

/// Form a group and make it the default. Every rank calls this with the same
/// `init_method` and `world_size`. A concurrent second call fails instead of
/// forming a second group.
#[pyfunction]
#[pyo3(signature = (
    backend="ccl",
    init_method="tcp://127.0.0.1:29500",
    world_size=1,
    rank=0,
    timeout_secs=1800.0,
    env=None,
))]
fn init_process_group(
    py: Python<'_>,
    backend: &str,
    init_method: &str,
    world_size: u32,
    rank: u32,
    timeout_secs: f64,
    env: Option<PyEnvConfig>,
) -> PyResult<PyProcessGroup> {
    let reservation = ccl_to_pyerr(DEFAULT_GROUP.reserve())?;
    let timeout = Duration::try_from_secs_f64(timeout_secs)
        .map_err(|e| pyo3::exceptions::PyValueError::new_err(format!("timeout_secs: {e}")))?;
    let env = env.map(|e| e.inner).unwrap_or_else(ccl_types::EnvConfig::from_current_exe);
    let registry = TransportRegistry::from_env(&env);
    debug!(backend, init_method, world_size, rank, providers = ?registry.names(), "init_process_group");

    let rt = get_runtime()?;
    let created = py.allow_threads(|| {
        rt.block_on(ccl_collective::init_with(
            backend, init_method, world_size, rank, timeout, &env, &registry,
        ))
    });
    let group = Arc::new(anyhow_to_pyerr(created.map_err(anyhow::Error::from))?);
    reservation.install(group.clone());
    Ok(PyProcessGroup { inner: group })
}

#[pyfunction]
fn get_default_group() -> PyResult<PyProcessGroup> {
    group::default_group()
}

#[pyfunction]
fn is_initialized() -> bool {
    group::is_initialized()
}

/// Destroy `group`, or the default group when none is given.
#[pyfunction]
#[pyo3(signature = (group=None))]
fn destroy_process_group(py: Python<'_>, group: Option<PyProcessGroup>) -> PyResult<()> {
    let group = match group {
        Some(g) => g,
        None => group::default_group()?,
    };
    group.destroy(py)
}

/// True only if every buffer is contiguous and no two share a device.
#[pyfunction]
fn is_available(buffers: Vec<PyBufferDescriptor>) -> bool {
    let descriptors: Vec<_> = buffers.into_iter().map(|b| b.inner).collect();
    ccl_types::is_available(&descriptors)
}

/// Names of the transport providers a group could use in this environment.
#[pyfunction]
#[pyo3(signature = (env=None))]
fn transport_providers(env: Option<PyEnvConfig>) -> Vec<String> {
    let env = env.map(|e| e.inner).unwrap_or_else(ccl_types::EnvConfig::from_current_exe);
    TransportRegistry::from_env(&env).names()
}

/// Native extension module entry point: `_ccl`
#[pymodule]
fn _ccl(m: &Bound<'_, PyModule>) -> PyResult<()> {
    // ── Exceptions ───────────────────────────────────────────────────────
    let py = m.py();
    m.add("CclError", py.get_type::<errors::PyCclError>())?;
    m.add("RendezvousError", py.get_type::<errors::PyRendezvousError>())?;
    m.add("ConnectionError", py.get_type::<errors::PyConnectionError>())?;
    m.add("TransportError", py.get_type::<errors::PyTransportError>())?;
    m.add("CollectiveError", py.get_type::<errors::PyCollectiveError>())?;
    m.add("InvalidStateError", py.get_type::<errors::PyInvalidStateError>())?;
    m.add("MismatchedCollectiveError", py.get_type::<errors::PyMismatchedCollectiveError>())?;

    // ── Types ────────────────────────────────────────────────────────────
    m.add_class::<PyEnvConfig>()?;
    m.add_class::<PyBufferDescriptor>()?;
    m.add_class::<PyProcessGroup>()?;
    m.add_class::<PyWork>()?;

    // ── Functions ────────────────────────────────────────────────────────
    m.add_function(wrap_pyfunction!(init_process_group, m)?)?;
    m.add_function(wrap_pyfunction!(get_default_group, m)?)?;
    m.add_function(wrap_pyfunction!(is_initialized, m)?)?;
    m.add_function(wrap_pyfunction!(destroy_process_group, m)?)?;
    m.add_function(wrap_pyfunction!(is_available, m)?)?;
    m.add_function(wrap_pyfunction!(transport_providers, m)?)?;

    m.add("BACKEND", ccl_collective::CCL_BACKEND)?;
    Ok(())
}
