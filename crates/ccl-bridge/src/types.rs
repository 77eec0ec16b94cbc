//! #[pyclass] wrappers for ccl-types structs.

use std::path::PathBuf;

use pyo3::prelude::*;

use ccl_types::{BufferDescriptor, DataType, Device, EnvConfig};

use crate::errors::ccl_to_pyerr;

// ── EnvConfig ────────────────────────────────────────────────────────────────

#[pyclass(name = "EnvConfig")]
#[derive(Clone)]
pub struct PyEnvConfig {
    pub inner: EnvConfig,
}

#[pymethods]
impl PyEnvConfig {
    /// Read `CCL_ROOT` / `FI_PROVIDER_PATH`; unset variables derive from
    /// `install_dir` (default: the interpreter's directory).
    #[new]
    #[pyo3(signature = (install_dir=None))]
    fn new(install_dir: Option<PathBuf>) -> Self {
        let inner = match install_dir {
            Some(dir) => EnvConfig::from_env(&dir),
            None => EnvConfig::from_current_exe(),
        };
        Self { inner }
    }

    #[getter]
    fn root_path(&self) -> String {
        self.inner.root_path.display().to_string()
    }

    #[getter]
    fn provider_search_path(&self) -> String {
        self.inner.provider_search_path.display().to_string()
    }

    fn __repr__(&self) -> String {
        format!(
            "EnvConfig(root_path='{}', provider_search_path='{}')",
            self.inner.root_path.display(),
            self.inner.provider_search_path.display(),
        )
    }
}

// ── BufferDescriptor ─────────────────────────────────────────────────────────

#[pyclass(name = "BufferDescriptor")]
#[derive(Clone)]
pub struct PyBufferDescriptor {
    pub inner: BufferDescriptor,
}

#[pymethods]
impl PyBufferDescriptor {
    /// `device` is `"cpu"` or `"<kind>:<index>"`, e.g. `"cuda:0"`.
    #[new]
    #[pyo3(signature = (dtype="f32", count=0, contiguous=true, device="cpu"))]
    fn new(dtype: &str, count: usize, contiguous: bool, device: &str) -> PyResult<Self> {
        let dtype: DataType = ccl_to_pyerr(dtype.parse())?;
        let device = parse_device(device)?;
        Ok(Self {
            inner: BufferDescriptor {
                dtype,
                count,
                contiguous,
                device,
            },
        })
    }

    #[getter]
    fn dtype(&self) -> &'static str {
        self.inner.dtype.name()
    }

    #[getter]
    fn count(&self) -> usize {
        self.inner.count
    }

    #[getter]
    fn contiguous(&self) -> bool {
        self.inner.contiguous
    }

    #[getter]
    fn nbytes(&self) -> usize {
        self.inner.len_bytes()
    }

    fn __repr__(&self) -> String {
        format!(
            "BufferDescriptor(dtype='{}', count={}, contiguous={}, device={:?})",
            self.inner.dtype, self.inner.count, self.inner.contiguous, self.inner.device,
        )
    }
}

fn parse_device(device: &str) -> PyResult<Device> {
    if device.eq_ignore_ascii_case("cpu") {
        return Ok(Device::Cpu);
    }
    device
        .rsplit_once(':')
        .and_then(|(_, index)| index.parse().ok())
        .map(Device::Accelerator)
        .ok_or_else(|| {
            pyo3::exceptions::PyValueError::new_err(format!(
                "device '{device}' must be 'cpu' or '<kind>:<index>'"
            ))
        })
}
