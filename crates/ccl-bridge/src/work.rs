//! #[pyclass] handle for a collective submitted with `async_op=True`.

use std::sync::{Mutex, MutexGuard};

use pyo3::prelude::*;

use ccl_collective::{CompletionHandle, RequestStatus};
use ccl_types::CollectiveKind;

use crate::convert::output_to_py;
use crate::errors::{ccl_to_pyerr, PyInvalidStateError};
use crate::runtime::get_runtime;

enum WorkState {
    Pending(CompletionHandle),
    Waiting,
    Done(RequestStatus),
}

#[pyclass(name = "Work")]
pub struct PyWork {
    id: u64,
    kind: CollectiveKind,
    state: Mutex<WorkState>,
}

impl PyWork {
    pub fn new(handle: CompletionHandle) -> Self {
        Self {
            id: handle.id(),
            kind: handle.kind(),
            state: Mutex::new(WorkState::Pending(handle)),
        }
    }

    fn state(&self) -> MutexGuard<'_, WorkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn status(&self) -> RequestStatus {
        match &*self.state() {
            WorkState::Pending(handle) => handle.query(),
            WorkState::Waiting => RequestStatus::Running,
            WorkState::Done(status) => *status,
        }
    }
}

#[pymethods]
impl PyWork {
    #[getter]
    fn id(&self) -> u64 {
        self.id
    }

    #[getter]
    fn kind(&self) -> String {
        self.kind.to_string()
    }

    /// `"Queued"`, `"Running"`, `"Completed"`, `"Failed"` or `"Cancelled"`.
    fn query(&self) -> String {
        self.status().to_string()
    }

    fn is_completed(&self) -> bool {
        self.status().is_finished()
    }

    /// Block until the collective finishes and return its result, shaped as
    /// the blocking call would return it. A work can be waited on once.
    fn wait(&self, py: Python<'_>) -> PyResult<PyObject> {
        let handle = {
            let mut state = self.state();
            match std::mem::replace(&mut *state, WorkState::Waiting) {
                WorkState::Pending(handle) => handle,
                other => {
                    *state = other;
                    return Err(PyInvalidStateError::new_err(format!(
                        "work {} was already waited on",
                        self.id
                    )));
                }
            }
        };

        let rt = get_runtime()?;
        let outcome = py.allow_threads(|| rt.block_on(handle.wait()));
        *self.state() = WorkState::Done(match &outcome {
            Ok(_) => RequestStatus::Completed,
            Err(_) => RequestStatus::Failed,
        });
        output_to_py(py, &ccl_to_pyerr(outcome)?)
    }

    /// Skip or abort the collective. The group is faulted afterwards.
    fn cancel(&self) {
        if let WorkState::Pending(handle) = &*self.state() {
            handle.cancel();
        }
    }

    fn __repr__(&self) -> String {
        format!("Work(id={}, kind='{}', status={})", self.id, self.kind, self.status())
    }
}
