use crate::error::{KernelError, KernelResult};
use crate::layout::{
    broadcast_dims, compute_dispatch, reshape_dispatch, size_from_shape, DispatchLayout, MAX_RANK,
};
use crate::types::{DataType, EntryKind, ShadingTarget, Vectorization};
use crate::uniforms::UniformKind;

/// Extra uniform field appended after the standard ones.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct UniformDecl {
    pub name: String,
    pub kind: UniformKind,
    pub width: usize,
}

impl UniformDecl {
    pub fn new(name: impl Into<String>, kind: UniformKind, width: usize) -> Self {
        Self {
            name: name.into(),
            kind,
            width,
        }
    }
}

/// Name, dtype and shape of one tensor a program touches.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperandInfo {
    pub name: String,
    pub dtype: DataType,
    pub shape: Vec<usize>,
}

impl OperandInfo {
    pub fn new(name: impl Into<String>, dtype: DataType, shape: Vec<usize>) -> Self {
        Self {
            name: name.into(),
            dtype,
            shape,
        }
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn size(&self) -> usize {
        size_from_shape(&self.shape)
    }
}

/// Description of one compute operation, independent of the data it runs on.
///
/// Built with the consuming `with_*` setters and immutable afterwards. Concrete
/// extents only reach the shader through uniforms, so programs that differ in
/// extents alone share a compiled pipeline.
#[derive(Clone, Debug)]
pub struct Program {
    shader_key: String,
    output_shape: Vec<usize>,
    layout: DispatchLayout,
    workgroup_size: [u32; 3],
    elements_per_thread: [u32; 3],
    variable_names: Vec<String>,
    vectorization: Vectorization,
    target: ShadingTarget,
    uniforms: Vec<UniformDecl>,
    size: bool,
    entry: EntryKind,
    wgsl_body: Option<String>,
    glsl_body: Option<String>,
}

impl Program {
    pub fn new(shader_key: impl Into<String>, output_shape: Vec<usize>) -> Self {
        let layout = DispatchLayout::flat(output_shape.len());
        Self {
            shader_key: shader_key.into(),
            output_shape,
            layout,
            workgroup_size: crate::config::DEFAULT_WORKGROUP_SIZE,
            elements_per_thread: [1, 1, 1],
            variable_names: Vec::new(),
            vectorization: Vectorization::Scalar,
            target: ShadingTarget::Wgsl,
            uniforms: Vec::new(),
            size: false,
            entry: EntryKind::Main,
            wgsl_body: None,
            glsl_body: None,
        }
    }

    pub fn with_layout(mut self, layout: DispatchLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_workgroup_size(mut self, workgroup_size: [u32; 3]) -> Self {
        self.workgroup_size = workgroup_size;
        self
    }

    pub fn with_elements_per_thread(mut self, elements_per_thread: [u32; 3]) -> Self {
        self.elements_per_thread = elements_per_thread;
        self
    }

    pub fn with_variables<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.variable_names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_vectorization(mut self, vectorization: Vectorization) -> Self {
        self.vectorization = vectorization;
        self
    }

    pub fn with_target(mut self, target: ShadingTarget) -> Self {
        self.target = target;
        self
    }

    pub fn with_uniform(mut self, decl: UniformDecl) -> Self {
        self.uniforms.push(decl);
        self
    }

    pub fn with_size(mut self, size: bool) -> Self {
        self.size = size;
        self
    }

    pub fn with_entry(mut self, entry: EntryKind) -> Self {
        self.entry = entry;
        self
    }

    pub fn with_wgsl_body(mut self, body: impl Into<String>) -> Self {
        self.wgsl_body = Some(body.into());
        self
    }

    pub fn with_glsl_body(mut self, body: impl Into<String>) -> Self {
        self.glsl_body = Some(body.into());
        self
    }

    pub fn shader_key(&self) -> &str {
        &self.shader_key
    }

    pub fn output_shape(&self) -> &[usize] {
        &self.output_shape
    }

    pub fn layout(&self) -> &DispatchLayout {
        &self.layout
    }

    pub fn workgroup_size(&self) -> [u32; 3] {
        self.workgroup_size
    }

    pub fn elements_per_thread(&self) -> [u32; 3] {
        self.elements_per_thread
    }

    pub fn variable_names(&self) -> &[String] {
        &self.variable_names
    }

    pub fn vectorization(&self) -> Vectorization {
        self.vectorization
    }

    pub fn target(&self) -> ShadingTarget {
        self.target
    }

    pub fn uniform_decls(&self) -> &[UniformDecl] {
        &self.uniforms
    }

    pub fn includes_size(&self) -> bool {
        self.size
    }

    pub fn entry(&self) -> EntryKind {
        self.entry
    }

    pub fn is_flat(&self) -> bool {
        self.layout.is_flat(self.output_shape.len())
    }

    pub fn body(&self) -> KernelResult<&str> {
        let body = match self.target {
            ShadingTarget::Wgsl => self.wgsl_body.as_deref(),
            ShadingTarget::Glsl => self.glsl_body.as_deref(),
        };
        body.ok_or_else(|| KernelError::MissingShaderBody {
            program: self.shader_key.clone(),
            target: self.target,
        })
    }

    /// Workgroup counts for this program, folded under `limit` when needed.
    pub fn dispatch(&self, limit: u32) -> KernelResult<[u32; 3]> {
        let dispatch = compute_dispatch(
            &self.layout,
            &self.output_shape,
            self.workgroup_size,
            self.elements_per_thread,
        );
        reshape_dispatch(&self.layout, dispatch, limit)
    }

    /// Reject operand/output combinations the generator cannot express.
    pub fn validate(&self, inputs: &[OperandInfo], output: &OperandInfo) -> KernelResult<()> {
        if inputs.len() != self.variable_names.len() {
            return Err(KernelError::UnsupportedLayout(format!(
                "program '{}' names {} operands but {} were supplied",
                self.shader_key,
                self.variable_names.len(),
                inputs.len()
            )));
        }
        let out_rank = output.rank();
        if out_rank > MAX_RANK {
            return Err(KernelError::UnsupportedRank {
                rank: out_rank,
                context: "program output",
            });
        }
        if output.dtype.storage().is_none() {
            return Err(KernelError::UnsupportedDtype {
                dtype: output.dtype,
                context: "program output",
            });
        }
        self.layout.validate(out_rank)?;
        if self.entry == EntryKind::Elementwise {
            if !self.is_flat() {
                return Err(KernelError::UnsupportedLayout(format!(
                    "elementwise program '{}' requires a flat layout, got {}",
                    self.shader_key, self.layout
                )));
            }
            if !self.size {
                return Err(KernelError::UnsupportedLayout(format!(
                    "elementwise program '{}' must emit the size uniform",
                    self.shader_key
                )));
            }
        }
        for input in inputs {
            if input.rank() > MAX_RANK {
                return Err(KernelError::UnsupportedRank {
                    rank: input.rank(),
                    context: "program operand",
                });
            }
            if input.dtype.storage().is_none() {
                return Err(KernelError::UnsupportedDtype {
                    dtype: input.dtype,
                    context: "program operand",
                });
            }
            if self.entry == EntryKind::Elementwise && input.rank() > out_rank {
                return Err(KernelError::UnsupportedLayout(format!(
                    "operand '{}' of rank {} cannot be sampled by a rank-{out_rank} output",
                    input.name,
                    input.rank()
                )));
            }
        }
        if self.vectorization == Vectorization::Vec4 {
            for operand in inputs.iter().chain(std::iter::once(output)) {
                check_vec4_operand(operand, &output.shape)?;
            }
        }
        for decl in &self.uniforms {
            if decl.width == 0 || decl.width > 4 {
                return Err(KernelError::UniformMismatch(format!(
                    "uniform '{}' must have 1 to 4 components, got {}",
                    decl.name, decl.width
                )));
            }
        }
        Ok(())
    }
}

fn check_vec4_operand(operand: &OperandInfo, out_shape: &[usize]) -> KernelResult<()> {
    if operand.rank() == 0 {
        return Err(KernelError::UnsupportedLayout(format!(
            "vec4 operand '{}' cannot be rank 0",
            operand.name
        )));
    }
    if operand.size() % 4 != 0 {
        return Err(KernelError::UnsupportedLayout(format!(
            "vec4 operand '{}' has {} elements, not a multiple of 4",
            operand.name,
            operand.size()
        )));
    }
    if operand.rank() <= out_shape.len()
        && broadcast_dims(&operand.shape, out_shape).contains(&(out_shape.len() - 1))
    {
        return Err(KernelError::UnsupportedLayout(format!(
            "vec4 operand '{}' broadcasts its innermost axis",
            operand.name
        )));
    }
    if operand.rank() <= out_shape.len() && operand.shape.last() != out_shape.last() {
        return Err(KernelError::UnsupportedLayout(format!(
            "vec4 operand '{}' must match the output's innermost extent",
            operand.name
        )));
    }
    // Packed reads of a broadcast operand must not straddle rows.
    if operand.shape != out_shape && out_shape.last().map_or(true, |d| d % 4 != 0) {
        return Err(KernelError::UnsupportedLayout(format!(
            "vec4 operand '{}' is broadcast but the innermost output extent is not a multiple of 4",
            operand.name
        )));
    }
    Ok(())
}
