use super::buffer_manager::BufferAllocation;
use crate::error::{KernelError, KernelResult};
use crate::layout::size_from_shape;
use crate::types::DataType;
use std::collections::HashMap;
use std::fmt;

/// Opaque handle of a tensor record; ids are never reused within a backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DataId(u64);

impl DataId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DataId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Caller-visible handle of a tensor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TensorInfo {
    pub data_id: DataId,
    pub shape: Vec<usize>,
    pub dtype: DataType,
}

/// Host-side values of a tensor. Complex values are interleaved `re, im` pairs.
#[derive(Clone, Debug, PartialEq)]
pub enum BackendValues {
    Float32(Vec<f32>),
    Int32(Vec<i32>),
    Bool(Vec<bool>),
    Complex64(Vec<f32>),
}

impl BackendValues {
    pub fn dtype(&self) -> DataType {
        match self {
            BackendValues::Float32(_) => DataType::Float32,
            BackendValues::Int32(_) => DataType::Int32,
            BackendValues::Bool(_) => DataType::Bool,
            BackendValues::Complex64(_) => DataType::Complex64,
        }
    }

    /// Logical element count; a complex element is one `re, im` pair.
    pub fn len(&self) -> usize {
        match self {
            BackendValues::Float32(v) => v.len(),
            BackendValues::Int32(v) => v.len(),
            BackendValues::Bool(v) => v.len(),
            BackendValues::Complex64(v) => v.len() / 2,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Device representation: f32 words for floats, i32 words for ints and bools.
    pub fn to_device_bytes(&self) -> KernelResult<Vec<u8>> {
        match self {
            BackendValues::Float32(v) => Ok(bytemuck::cast_slice(v).to_vec()),
            BackendValues::Int32(v) => Ok(bytemuck::cast_slice(v).to_vec()),
            BackendValues::Bool(v) => {
                let words: Vec<i32> = v.iter().map(|&b| i32::from(b)).collect();
                Ok(bytemuck::cast_slice(&words).to_vec())
            }
            BackendValues::Complex64(_) => Err(KernelError::UnsupportedDtype {
                dtype: DataType::Complex64,
                context: "device upload",
            }),
        }
    }

    pub fn from_device_bytes(dtype: DataType, bytes: &[u8], len: usize) -> KernelResult<Self> {
        let byte_len = len * 4;
        if bytes.len() < byte_len {
            return Err(KernelError::Readback(format!(
                "expected {byte_len} bytes, mapped {}",
                bytes.len()
            )));
        }
        let bytes = &bytes[..byte_len];
        match dtype {
            DataType::Float32 => Ok(BackendValues::Float32(bytemuck::pod_collect_to_vec(bytes))),
            DataType::Int32 => Ok(BackendValues::Int32(bytemuck::pod_collect_to_vec(bytes))),
            DataType::Bool => {
                let words: Vec<i32> = bytemuck::pod_collect_to_vec(bytes);
                Ok(BackendValues::Bool(words.into_iter().map(|w| w != 0).collect()))
            }
            DataType::Complex64 => Err(KernelError::UnsupportedDtype {
                dtype,
                context: "device readback",
            }),
        }
    }

    /// Interleave a real and an imaginary part into complex values.
    pub fn merge_complex(real: &BackendValues, imag: &BackendValues) -> KernelResult<Self> {
        match (real, imag) {
            (BackendValues::Float32(re), BackendValues::Float32(im)) if re.len() == im.len() => {
                let mut out = Vec::with_capacity(re.len() * 2);
                for (r, i) in re.iter().zip(im) {
                    out.push(*r);
                    out.push(*i);
                }
                Ok(BackendValues::Complex64(out))
            }
            _ => Err(KernelError::UnsupportedLayout(
                "complex parts must be float32 tensors of equal size".to_string(),
            )),
        }
    }

    /// Split interleaved complex values into real and imaginary parts.
    pub fn split_complex(values: &[f32]) -> KernelResult<(Vec<f32>, Vec<f32>)> {
        if values.len() % 2 != 0 {
            return Err(KernelError::UnsupportedLayout(format!(
                "interleaved complex data needs an even number of floats, got {}",
                values.len()
            )));
        }
        let re = values.iter().step_by(2).copied().collect();
        let im = values.iter().skip(1).step_by(2).copied().collect();
        Ok((re, im))
    }

    /// Fails unless the values fill `shape` exactly.
    pub fn check_shape(&self, shape: &[usize]) -> KernelResult<()> {
        if let BackendValues::Complex64(interleaved) = self {
            if interleaved.len() % 2 != 0 {
                return Err(KernelError::UnsupportedLayout(format!(
                    "{} floats cannot be read as interleaved complex pairs",
                    interleaved.len()
                )));
            }
        }
        let size = size_from_shape(shape);
        if self.len() != size {
            return Err(KernelError::UnsupportedLayout(format!(
                "{} values supplied for shape {:?}",
                self.len(),
                shape
            )));
        }
        Ok(())
    }
}

pub struct TensorRecord<B> {
    pub dtype: DataType,
    pub shape: Vec<usize>,
    pub values: Option<BackendValues>,
    pub resource: Option<BufferAllocation<B>>,
    pub ref_count: usize,
    /// Real and imaginary children of a complex record.
    pub complex_parts: Option<(DataId, DataId)>,
}

impl<B> TensorRecord<B> {
    pub fn new(dtype: DataType, shape: Vec<usize>, values: Option<BackendValues>) -> Self {
        Self {
            dtype,
            shape,
            values,
            resource: None,
            ref_count: 1,
            complex_parts: None,
        }
    }

    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Records owned by one backend, keyed by [`DataId`].
pub struct TensorStore<B> {
    records: HashMap<DataId, TensorRecord<B>>,
    next_id: u64,
}

impl<B> Default for TensorStore<B> {
    fn default() -> Self {
        Self {
            records: HashMap::new(),
            next_id: 0,
        }
    }
}

impl<B> TensorStore<B> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: TensorRecord<B>) -> DataId {
        let id = DataId(self.next_id);
        self.next_id += 1;
        self.records.insert(id, record);
        id
    }

    pub fn contains(&self, id: DataId) -> bool {
        self.records.contains_key(&id)
    }

    pub fn get(&self, id: DataId) -> KernelResult<&TensorRecord<B>> {
        self.records.get(&id).ok_or(KernelError::UnknownTensor(id))
    }

    pub fn get_mut(&mut self, id: DataId) -> KernelResult<&mut TensorRecord<B>> {
        self.records.get_mut(&id).ok_or(KernelError::UnknownTensor(id))
    }

    pub fn remove(&mut self, id: DataId) -> Option<TensorRecord<B>> {
        self.records.remove(&id)
    }

    pub fn inc_ref(&mut self, id: DataId) -> KernelResult<usize> {
        let record = self.get_mut(id)?;
        record.ref_count += 1;
        Ok(record.ref_count)
    }

    pub fn dec_ref(&mut self, id: DataId) -> KernelResult<usize> {
        let record = self.get_mut(id)?;
        record.ref_count = record.ref_count.saturating_sub(1);
        Ok(record.ref_count)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Remove every record, returning their device allocations.
    pub fn drain_resources(&mut self) -> Vec<BufferAllocation<B>> {
        self.records
            .drain()
            .filter_map(|(_, record)| record.resource)
            .collect()
    }
}
