//! Python values ↔ typed buffers.
//!
//! Collectives take either a list of numbers or raw little-endian `bytes`
//! plus a dtype name, and hand back a list of numbers of the same dtype.
//! Per-rank collectives take and return a list of such values.

use half::{bf16, f16};
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;
use pyo3::types::{PyBytes, PyList};

use ccl_types::{Buffer, CollectiveOutput, DataType};

use crate::errors::ccl_to_pyerr;

pub fn parse_dtype(name: &str) -> PyResult<DataType> {
    ccl_to_pyerr(name.parse())
}

fn narrow<T: TryFrom<i64>>(values: Vec<i64>, dtype: DataType) -> PyResult<Vec<T>> {
    values
        .into_iter()
        .map(|v| {
            T::try_from(v)
                .map_err(|_| PyValueError::new_err(format!("{v} does not fit in {dtype}")))
        })
        .collect()
}

pub fn to_buffer(dtype: DataType, values: &Bound<'_, PyAny>) -> PyResult<Buffer> {
    if let Ok(bytes) = values.downcast::<PyBytes>() {
        return ccl_to_pyerr(Buffer::from_bytes(dtype, bytes.as_bytes().to_vec()));
    }
    Ok(match dtype {
        DataType::U8 => Buffer::from_u8(&narrow(values.extract()?, dtype)?),
        DataType::I8 => Buffer::from_i8(&narrow(values.extract()?, dtype)?),
        DataType::I32 => Buffer::from_i32(&narrow(values.extract()?, dtype)?),
        DataType::I64 => Buffer::from_i64(&values.extract::<Vec<i64>>()?),
        DataType::F16 => {
            let v: Vec<f64> = values.extract()?;
            Buffer::from_f16(&v.into_iter().map(f16::from_f64).collect::<Vec<_>>())
        }
        DataType::BF16 => {
            let v: Vec<f64> = values.extract()?;
            Buffer::from_bf16(&v.into_iter().map(bf16::from_f64).collect::<Vec<_>>())
        }
        DataType::F32 => {
            let v: Vec<f64> = values.extract()?;
            Buffer::from_f32(&v.into_iter().map(|x| x as f32).collect::<Vec<_>>())
        }
        DataType::F64 => Buffer::from_f64(&values.extract::<Vec<f64>>()?),
    })
}

pub fn from_buffer(py: Python<'_>, buffer: &Buffer) -> PyResult<PyObject> {
    let list = match buffer.dtype() {
        DataType::U8 => PyList::new(py, ccl_to_pyerr(buffer.to_u8())?)?,
        DataType::I8 => PyList::new(py, ccl_to_pyerr(buffer.to_i8())?)?,
        DataType::I32 => PyList::new(py, ccl_to_pyerr(buffer.to_i32())?)?,
        DataType::I64 => PyList::new(py, ccl_to_pyerr(buffer.to_i64())?)?,
        DataType::F16 => PyList::new(py, ccl_to_pyerr(buffer.to_f16())?.into_iter().map(f16::to_f64))?,
        DataType::BF16 => PyList::new(py, ccl_to_pyerr(buffer.to_bf16())?.into_iter().map(bf16::to_f64))?,
        DataType::F32 => PyList::new(py, ccl_to_pyerr(buffer.to_f32())?.into_iter().map(f64::from))?,
        DataType::F64 => PyList::new(py, ccl_to_pyerr(buffer.to_f64())?)?,
    };
    Ok(list.into_any().unbind())
}

pub fn from_buffers(py: Python<'_>, buffers: &[Buffer]) -> PyResult<PyObject> {
    let lists = buffers
        .iter()
        .map(|b| from_buffer(py, b))
        .collect::<PyResult<Vec<_>>>()?;
    Ok(PyList::new(py, lists)?.into_any().unbind())
}

/// One buffer per list element, for collectives that take a slot per rank.
pub fn to_buffers(dtype: DataType, values: &Bound<'_, PyAny>) -> PyResult<Vec<Buffer>> {
    values
        .extract::<Vec<Bound<'_, PyAny>>>()?
        .iter()
        .map(|v| to_buffer(dtype, v))
        .collect()
}

/// The caller-visible result of a finished collective. Reduce hands back
/// `output`, which holds the reduction only on root.
pub fn output_to_py(py: Python<'_>, output: &CollectiveOutput) -> PyResult<PyObject> {
    match output {
        CollectiveOutput::Broadcast { buffer } => from_buffer(py, buffer),
        CollectiveOutput::Reduce { output, .. }
        | CollectiveOutput::AllReduce { output, .. }
        | CollectiveOutput::Scatter { output, .. } => from_buffer(py, output),
        CollectiveOutput::AllGather { outputs, .. }
        | CollectiveOutput::Gather { outputs, .. }
        | CollectiveOutput::AllToAll { outputs, .. } => from_buffers(py, outputs),
        CollectiveOutput::Barrier => Ok(py.None()),
    }
}
