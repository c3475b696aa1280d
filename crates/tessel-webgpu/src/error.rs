use crate::backend::tensor_data::DataId;
use crate::types::DataType;
use thiserror::Error;

/// Failures raised by the kernel runtime.
///
/// Entry points on [`crate::WebGpuBackend`] return `anyhow::Result`; callers that need
/// to branch on a specific failure can `downcast_ref::<KernelError>()`.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("rank {rank} is not supported for {context}")]
    UnsupportedRank { rank: usize, context: &'static str },

    #[error("unsupported layout: {0}")]
    UnsupportedLayout(String),

    #[error("dtype {dtype} is not supported for {context}")]
    UnsupportedDtype {
        dtype: DataType,
        context: &'static str,
    },

    #[error("buffer of {size} bytes with usage {usage:?} was not acquired from this manager")]
    UntrackedBuffer { size: u64, usage: wgpu::BufferUsages },

    #[error("unknown tensor {0}")]
    UnknownTensor(DataId),

    #[error("tensor {0} has neither host values nor a device buffer")]
    UninitializedTensor(DataId),

    #[error("backend has been disposed")]
    BackendDisposed,

    #[error("no compatible GPU adapter found")]
    AdapterUnavailable,

    #[error("device request failed: {0}")]
    DeviceRequest(String),

    #[error("buffer of {size} bytes exceeds the device limit of {limit} bytes")]
    BufferTooLarge { size: u64, limit: u64 },

    #[error("dispatch {dispatch:?} exceeds the per-dimension limit of {limit} workgroups")]
    DispatchTooLarge { dispatch: [u32; 3], limit: u32 },

    #[error("shader '{label}' failed to compile: {message}")]
    ShaderCompile { label: String, message: String },

    #[error("program '{program}' has no {target} body")]
    MissingShaderBody {
        program: String,
        target: crate::types::ShadingTarget,
    },

    #[error("no shader snippet for op '{0}'")]
    UnknownOp(String),

    #[error("uniform mismatch: {0}")]
    UniformMismatch(String),

    #[error("readback failed: {0}")]
    Readback(String),
}

pub type KernelResult<T> = Result<T, KernelError>;
