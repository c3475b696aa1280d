//! tessel-webgpu: a WebGPU compute-kernel runtime for tensor programs.
//!
//! A [`Program`] describes one kernel: its output shape, dispatch layout, operand
//! variable names and a shader body in WGSL or GLSL. The runtime generates the
//! surrounding shader (uniform block, bindings, index and broadcast helpers), caches
//! the compiled pipeline by structure rather than by extent, and records dispatches
//! into batched command encoders. Device memory comes from a pool keyed by exact
//! `(size, usage)`.
//!
//! The moving parts:
//! - [`layout`]: shape, stride and dispatch arithmetic
//! - [`codegen`]: typed shader AST and the WGSL/GLSL renderers
//! - [`uniforms`]: uniform field assembly and std140-style packing
//! - [`backend`]: buffer pool, pipeline/layout caches, submit scheduler and the
//!   [`WebGpuBackend`] orchestrator
//! - [`programs`]: reference unary, binary and fill programs
//!
//! ## Usage
//!
//! ```ignore
//! use tessel_webgpu::{BackendConfig, BackendValues, BinaryOp, BinaryOpProgram, DataType,
//!     WebGpuBackend};
//!
//! let mut backend = WebGpuBackend::new_blocking(BackendConfig::from_env())?;
//! let a = backend.make_tensor_info(vec![1, 4], DataType::Float32,
//!     Some(BackendValues::Float32(vec![1.0, 2.0, 3.0, 4.0])))?;
//! let b = backend.make_tensor_info(vec![3, 4], DataType::Float32,
//!     Some(BackendValues::Float32(vec![0.5; 12])))?;
//! let program = BinaryOpProgram::build(BinaryOp::Add, &a.shape, &b.shape,
//!     backend.shading_target(), Default::default(), backend.config().workgroup_size)?;
//! let out = backend.run_program(&program, &[a, b], DataType::Float32, &[])?;
//! let values = backend.read_sync(out.data_id)?;
//! ```

pub mod backend;
pub mod codegen;
pub mod config;
pub mod error;
pub mod layout;
pub mod program;
pub mod programs;
pub mod types;
pub mod uniforms;

pub use backend::{
    BackendValues, DataId, EncoderState, KernelRuntime, MemoryInfo, MetricsSnapshot,
    TensorInfo, WebGpuBackend,
};
pub use codegen::{generate_shader, GeneratedShader};
pub use config::{BackendConfig, PowerPreference};
pub use error::{KernelError, KernelResult};
pub use layout::DispatchLayout;
pub use program::{OperandInfo, Program, UniformDecl};
pub use programs::{BinaryOp, BinaryOpProgram, FillProgram, UnaryOp, UnaryOpProgram};
pub use types::{DataType, EntryKind, ShadingTarget, StorageType, Vectorization};
pub use uniforms::{UniformData, UniformKind};
