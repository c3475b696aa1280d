use crate::codegen::GeneratedShader;
use crate::error::{KernelError, KernelResult};
use crate::layout::{broadcast_dims, DispatchLayout};
use crate::program::{OperandInfo, Program, UniformDecl};
use crate::types::{DataType, EntryKind, ShadingTarget, Vectorization};
use smallvec::SmallVec;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::bindings::build_program_bgl;

/// Structural facts about one operand that change the generated source.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OperandSignature {
    pub name: String,
    pub rank: usize,
    pub dtype: DataType,
    pub shape_matches_output: bool,
    pub broadcast_dims: SmallVec<[usize; 4]>,
}

/// Everything the generated shader depends on, and nothing else.
///
/// Concrete extents are absent on purpose: they reach the shader as uniforms, so
/// programs differing only in extents map to one key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PipelineKey {
    pub shader_key: String,
    pub entry: EntryKind,
    pub vectorization: Vectorization,
    pub target: ShadingTarget,
    pub workgroup_size: [u32; 3],
    pub layout: DispatchLayout,
    pub output_rank: usize,
    pub output_dtype: DataType,
    pub operands: Vec<OperandSignature>,
    pub uniforms: Vec<UniformDecl>,
    /// Whether the uniform block carries the element-count field.
    pub includes_size: bool,
}

impl PipelineKey {
    pub fn new(program: &Program, inputs: &[OperandInfo], output: &OperandInfo) -> Self {
        let operands = inputs
            .iter()
            .map(|input| OperandSignature {
                name: input.name.clone(),
                rank: input.rank(),
                dtype: input.dtype,
                shape_matches_output: input.shape == output.shape,
                broadcast_dims: broadcast_dims(&input.shape, &output.shape).into_iter().collect(),
            })
            .collect();
        Self {
            shader_key: program.shader_key().to_string(),
            entry: program.entry(),
            vectorization: program.vectorization(),
            target: program.target(),
            workgroup_size: program.workgroup_size(),
            layout: program.layout().clone(),
            output_rank: output.rank(),
            output_dtype: output.dtype,
            operands,
            uniforms: program.uniform_decls().to_vec(),
            includes_size: program.includes_size(),
        }
    }
}

impl fmt::Display for PipelineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{:?}_r{}{}_{}{}",
            self.shader_key,
            self.target,
            self.vectorization,
            self.output_rank,
            self.output_dtype,
            self.layout,
            if self.includes_size { "_n" } else { "" }
        )?;
        for op in &self.operands {
            write!(
                f,
                "_{}r{}{}{}{:?}",
                op.name,
                op.rank,
                op.dtype,
                if op.shape_matches_output { "s" } else { "" },
                op.broadcast_dims.as_slice()
            )?;
        }
        Ok(())
    }
}

/// Compiled pipelines keyed by [`PipelineKey`]; entries live as long as the cache.
pub struct PipelineCache<P> {
    entries: HashMap<PipelineKey, Arc<P>>,
    hits: u64,
    misses: u64,
}

impl<P> Default for PipelineCache<P> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            hits: 0,
            misses: 0,
        }
    }
}

impl<P> PipelineCache<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the pipeline for `key`, running `compile` only on the first request.
    pub fn get_or_compile<E, F>(&mut self, key: &PipelineKey, compile: F) -> Result<Arc<P>, E>
    where
        F: FnOnce() -> Result<P, E>,
    {
        if let Some(pipeline) = self.entries.get(key) {
            self.hits += 1;
            log::trace!("pipeline_cache: hit {key}");
            return Ok(Arc::clone(pipeline));
        }
        self.misses += 1;
        let pipeline = Arc::new(compile()?);
        log::debug!("pipeline_cache: compiled {key} (entries={})", self.entries.len() + 1);
        self.entries.insert(key.clone(), Arc::clone(&pipeline));
        Ok(pipeline)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `(hits, misses)`
    pub fn counters(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Bind-group and pipeline layouts keyed by operand count.
pub struct LayoutCache<L> {
    entries: HashMap<usize, Arc<L>>,
}

impl<L> Default for LayoutCache<L> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<L> LayoutCache<L> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create<F>(&mut self, operand_count: usize, create: F) -> Arc<L>
    where
        F: FnOnce() -> L,
    {
        Arc::clone(
            self.entries
                .entry(operand_count)
                .or_insert_with(|| Arc::new(create())),
        )
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

pub struct ProgramLayout {
    pub bind_group_layout: wgpu::BindGroupLayout,
    pub pipeline_layout: wgpu::PipelineLayout,
}

impl ProgramLayout {
    pub fn new(device: &wgpu::Device, operand_count: usize) -> Self {
        let bind_group_layout = build_program_bgl(device, operand_count);
        let label = format!("tessel-program-pl-{operand_count}");
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(&label),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });
        Self {
            bind_group_layout,
            pipeline_layout,
        }
    }
}

/// Create the shader module and compute pipeline for `shader`, surfacing
/// validation failures as [`KernelError::ShaderCompile`].
pub fn compile_pipeline(
    device: &wgpu::Device,
    layout: &ProgramLayout,
    shader: &GeneratedShader,
    label: &str,
) -> KernelResult<wgpu::ComputePipeline> {
    let source = match shader.target {
        ShadingTarget::Wgsl => wgpu::ShaderSource::Wgsl(Cow::Borrowed(&shader.source)),
        ShadingTarget::Glsl => wgpu::ShaderSource::Glsl {
            shader: Cow::Borrowed(&shader.source),
            stage: naga::ShaderStage::Compute,
            defines: Default::default(),
        },
    };
    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source,
    });
    let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(label),
        layout: Some(&layout.pipeline_layout),
        module: &module,
        entry_point: shader.entry_point,
    });
    if let Some(error) = pop_validation_scope(device) {
        log::debug!("pipeline compile failed for {label}:\n{}", shader.source);
        return Err(KernelError::ShaderCompile {
            label: label.to_string(),
            message: error.to_string(),
        });
    }
    Ok(pipeline)
}

#[cfg(not(target_arch = "wasm32"))]
fn pop_validation_scope(device: &wgpu::Device) -> Option<wgpu::Error> {
    pollster::block_on(device.pop_error_scope())
}

// Browsers resolve error scopes asynchronously; failures surface through the
// device's uncaptured-error handler instead.
#[cfg(target_arch = "wasm32")]
fn pop_validation_scope(device: &wgpu::Device) -> Option<wgpu::Error> {
    drop(device.pop_error_scope());
    None
}
