use crate::program::{Program, UniformDecl};
use crate::types::{ShadingTarget, Vectorization};
use crate::uniforms::{UniformData, UniformKind};

const WGSL_BODY: &str = "fn userMain(index : i32) {
  if (index < uniforms.size) {
    setOutputAtIndex(index, uniforms.value);
  }
}
";

const GLSL_BODY: &str = "void userMain(int index) {
  if (index < uniforms.size) {
    setOutputAtIndex(index, uniforms.value);
  }
}
";

/// Writes one constant, supplied as the `value` uniform, to every output element.
pub struct FillProgram;

impl FillProgram {
    pub fn build(shape: Vec<usize>, target: ShadingTarget, workgroup_size: [u32; 3]) -> Program {
        Program::new("fill", shape)
            .with_size(true)
            .with_target(target)
            .with_vectorization(Vectorization::Scalar)
            .with_workgroup_size(workgroup_size)
            .with_uniform(UniformDecl::new("value", UniformKind::Float32, 1))
            .with_wgsl_body(WGSL_BODY)
            .with_glsl_body(GLSL_BODY)
    }

    pub fn uniforms(value: f32) -> Vec<UniformData> {
        vec![UniformData::Float32(vec![value])]
    }
}
