use pyo3::create_exception;
use pyo3::exceptions::PyException;
use pyo3::prelude::*;

use ccl_types::CclError;

create_exception!(ccl, PyCclError, PyException, "Base exception for collective runtime errors.");
create_exception!(ccl, PyRendezvousError, PyCclError, "Group formation did not complete.");
create_exception!(ccl, PyConnectionError, PyCclError, "A peer could not be reached.");
create_exception!(ccl, PyTransportError, PyCclError, "A link failed or no transport is usable.");
create_exception!(ccl, PyCollectiveError, PyCclError, "A collective aborted; see failed_peer.");
create_exception!(ccl, PyInvalidStateError, PyCclError, "Operation on a destroyed or uninitialized group.");
create_exception!(
    ccl,
    PyMismatchedCollectiveError,
    PyCollectiveError,
    "A peer is running a different collective."
);

/// Each error variant raises its own exception class. Peer information is
/// attached as `failed_peer` / `peer` attributes where it exists.
pub fn to_pyerr(err: CclError) -> PyErr {
    let message = err.to_string();
    let peer = err.peer();
    let py_err = match err {
        CclError::Rendezvous(_) => PyRendezvousError::new_err(message),
        CclError::Connection { .. } => PyConnectionError::new_err(message),
        CclError::Transport { .. } => PyTransportError::new_err(message),
        CclError::Collective { .. } => PyCollectiveError::new_err(message),
        CclError::MismatchedCollective { .. } => PyMismatchedCollectiveError::new_err(message),
        CclError::InvalidState(_) => PyInvalidStateError::new_err(message),
        CclError::InvalidArgument(_) | CclError::Config(_) => {
            pyo3::exceptions::PyValueError::new_err(message)
        }
        CclError::Serialization(_) | CclError::Io(_) => PyCclError::new_err(message),
    };
    Python::with_gil(|py| {
        let value = py_err.value(py);
        let _ = value.setattr("failed_peer", peer);
    });
    py_err
}

pub fn ccl_to_pyerr<T>(r: ccl_types::Result<T>) -> PyResult<T> {
    r.map_err(to_pyerr)
}

/// Errors raised at the bridge edge. A wrapped `CclError` keeps its class.
pub fn anyhow_to_pyerr<T>(r: anyhow::Result<T>) -> PyResult<T> {
    r.map_err(|e: anyhow::Error| match e.downcast::<CclError>() {
        Ok(ccl) => to_pyerr(ccl),
        Err(other) => PyCclError::new_err(format!("{other:#}")),
    })
}
