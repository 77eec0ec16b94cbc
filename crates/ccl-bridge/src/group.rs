//! #[pyclass] wrapper for ProcessGroup, plus the default-group singleton.
//!
//! Every collective takes `async_op`. When set, the call returns a `Work`
//! as soon as the request is queued instead of blocking on the result.

use std::future::Future;
use std::sync::Arc;

use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;

use ccl_collective::{DefaultGroup, ProcessGroup};
use ccl_types::{Buffer, CollectiveRequest, ReduceOp};

use crate::convert::{output_to_py, parse_dtype, to_buffer, to_buffers};
use crate::errors::ccl_to_pyerr;
use crate::runtime::get_runtime;
use crate::work::PyWork;

#[pyclass(name = "ProcessGroup")]
#[derive(Clone)]
pub struct PyProcessGroup {
    pub inner: Arc<ProcessGroup>,
}

/// Run a group future on the shared runtime with the GIL released.
fn block_on<T, F>(py: Python<'_>, fut: F) -> PyResult<T>
where
    T: Send,
    F: Future<Output = ccl_types::Result<T>> + Send,
{
    let rt = get_runtime()?;
    ccl_to_pyerr(py.allow_threads(|| rt.block_on(fut)))
}

fn parse_op(op: &str) -> PyResult<ReduceOp> {
    ccl_to_pyerr(op.parse())
}

impl PyProcessGroup {
    /// Submit `request`, then either wait for it or hand back a `Work`.
    fn run(&self, py: Python<'_>, request: CollectiveRequest, async_op: bool) -> PyResult<PyObject> {
        if async_op {
            let handle = block_on(py, self.inner.submit_async(request))?;
            return Ok(Py::new(py, PyWork::new(handle))?.into_any());
        }
        let output = block_on(py, self.inner.submit(request))?;
        output_to_py(py, &output)
    }
}

#[pymethods]
impl PyProcessGroup {
    #[getter]
    fn rank(&self) -> u32 {
        self.inner.rank()
    }

    #[getter]
    fn world_size(&self) -> u32 {
        self.inner.world_size()
    }

    #[getter]
    fn group_id(&self) -> String {
        self.inner.group_id().to_string()
    }

    #[getter]
    fn transport(&self) -> String {
        self.inner.transport().to_string()
    }

    /// `"Active"`, `"Faulted"` or `"Destroyed"`.
    #[getter]
    fn state(&self) -> String {
        self.inner.state().to_string()
    }

    /// Peer named by the fault that moved this group out of Active.
    #[getter]
    fn failed_peer(&self) -> Option<u32> {
        self.inner.fault().and_then(|f| f.failed_peer)
    }

    /// Copy `root`'s values to every rank. Non-root ranks pass a buffer of
    /// the right length; its contents are overwritten.
    #[pyo3(signature = (data, root=0, dtype="f32", async_op=false))]
    fn broadcast(
        &self,
        py: Python<'_>,
        data: &Bound<'_, PyAny>,
        root: u32,
        dtype: &str,
        async_op: bool,
    ) -> PyResult<PyObject> {
        let buffer = to_buffer(parse_dtype(dtype)?, data)?;
        self.run(py, CollectiveRequest::Broadcast { root, buffer }, async_op)
    }

    /// Reduce onto `root`. Other ranks get their own values back.
    #[pyo3(signature = (data, root=0, op="sum", dtype="f32", async_op=false))]
    fn reduce(
        &self,
        py: Python<'_>,
        data: &Bound<'_, PyAny>,
        root: u32,
        op: &str,
        dtype: &str,
        async_op: bool,
    ) -> PyResult<PyObject> {
        let op = parse_op(op)?;
        let input = to_buffer(parse_dtype(dtype)?, data)?;
        let output = input.clone();
        self.run(py, CollectiveRequest::Reduce { root, op, input, output }, async_op)
    }

    #[pyo3(signature = (data, op="sum", dtype="f32", async_op=false))]
    fn all_reduce(
        &self,
        py: Python<'_>,
        data: &Bound<'_, PyAny>,
        op: &str,
        dtype: &str,
        async_op: bool,
    ) -> PyResult<PyObject> {
        let op = parse_op(op)?;
        let input = to_buffer(parse_dtype(dtype)?, data)?;
        let output = Buffer::zeros(input.dtype(), input.count());
        self.run(py, CollectiveRequest::AllReduce { op, input, output }, async_op)
    }

    /// One list per rank. `counts` gives each rank's element count when
    /// contributions differ in length; by default all match this rank's.
    #[pyo3(signature = (data, dtype="f32", counts=None, async_op=false))]
    fn all_gather(
        &self,
        py: Python<'_>,
        data: &Bound<'_, PyAny>,
        dtype: &str,
        counts: Option<Vec<usize>>,
        async_op: bool,
    ) -> PyResult<PyObject> {
        let input = to_buffer(parse_dtype(dtype)?, data)?;
        let outputs = self.slots(&input, counts);
        self.run(py, CollectiveRequest::AllGather { input, outputs }, async_op)
    }

    /// One list per rank on `root`, an empty list elsewhere. `counts` works
    /// as for `all_gather` and only matters on root.
    #[pyo3(signature = (data, root=0, dtype="f32", counts=None, async_op=false))]
    fn gather(
        &self,
        py: Python<'_>,
        data: &Bound<'_, PyAny>,
        root: u32,
        dtype: &str,
        counts: Option<Vec<usize>>,
        async_op: bool,
    ) -> PyResult<PyObject> {
        let input = to_buffer(parse_dtype(dtype)?, data)?;
        let outputs = if self.inner.rank() == root {
            self.slots(&input, counts)
        } else {
            Vec::new()
        };
        self.run(py, CollectiveRequest::Gather { root, input, outputs }, async_op)
    }

    /// Root passes one list per rank as `data`. Every other rank passes
    /// `count`, the length of the piece it receives.
    #[pyo3(signature = (data=None, count=None, root=0, dtype="f32", async_op=false))]
    fn scatter(
        &self,
        py: Python<'_>,
        data: Option<&Bound<'_, PyAny>>,
        count: Option<usize>,
        root: u32,
        dtype: &str,
        async_op: bool,
    ) -> PyResult<PyObject> {
        let dtype = parse_dtype(dtype)?;
        let rank = self.inner.rank();
        let inputs = match data {
            Some(data) if rank == root => to_buffers(dtype, data)?,
            None if rank == root => return Err(PyValueError::new_err("scatter root must pass data")),
            _ => Vec::new(),
        };
        let count = match (count, inputs.get(rank as usize)) {
            (Some(count), _) => count,
            (None, Some(own)) => own.count(),
            (None, None) => return Err(PyValueError::new_err("scatter needs count on non-root ranks")),
        };
        let output = Buffer::zeros(dtype, count);
        self.run(py, CollectiveRequest::Scatter { root, inputs, output }, async_op)
    }

    /// `data[j]` goes to rank `j`. Returns one list per rank: what that rank
    /// sent here. `counts` gives the incoming lengths; by default each
    /// matches the length sent to that rank.
    #[pyo3(signature = (data, dtype="f32", counts=None, async_op=false))]
    fn all_to_all(
        &self,
        py: Python<'_>,
        data: &Bound<'_, PyAny>,
        dtype: &str,
        counts: Option<Vec<usize>>,
        async_op: bool,
    ) -> PyResult<PyObject> {
        let dtype = parse_dtype(dtype)?;
        let inputs = to_buffers(dtype, data)?;
        let counts = counts.unwrap_or_else(|| inputs.iter().map(Buffer::count).collect());
        let outputs = counts.into_iter().map(|count| Buffer::zeros(dtype, count)).collect();
        self.run(py, CollectiveRequest::AllToAll { inputs, outputs }, async_op)
    }

    #[pyo3(signature = (async_op=false))]
    fn barrier(&self, py: Python<'_>, async_op: bool) -> PyResult<PyObject> {
        self.run(py, CollectiveRequest::Barrier, async_op)
    }

    /// Close every link. Clears the default group if this is it.
    pub fn destroy(&self, py: Python<'_>) -> PyResult<()> {
        DEFAULT_GROUP.clear_if(&self.inner);
        block_on(py, self.inner.destroy())
    }

    fn __repr__(&self) -> String {
        format!(
            "ProcessGroup(rank={}, world_size={}, transport='{}', state={})",
            self.inner.rank(),
            self.inner.world_size(),
            self.inner.transport(),
            self.inner.state(),
        )
    }
}

impl PyProcessGroup {
    /// Zeroed receive buffers, one per rank.
    fn slots(&self, input: &Buffer, counts: Option<Vec<usize>>) -> Vec<Buffer> {
        let world_size = self.inner.world_size() as usize;
        counts
            .unwrap_or_else(|| vec![input.count(); world_size])
            .into_iter()
            .map(|count| Buffer::zeros(input.dtype(), count))
            .collect()
    }
}

// ── Default group ────────────────────────────────────────────────────────────

pub static DEFAULT_GROUP: DefaultGroup = DefaultGroup::new();

pub fn default_group() -> PyResult<PyProcessGroup> {
    ccl_to_pyerr(DEFAULT_GROUP.get()).map(|inner| PyProcessGroup { inner })
}

pub fn is_initialized() -> bool {
    DEFAULT_GROUP.is_initialized()
}
