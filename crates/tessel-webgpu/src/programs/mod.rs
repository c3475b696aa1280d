//! Reference programs the runtime uses to exercise itself.

pub mod binary;
pub mod fill;
pub mod unary;

pub use binary::{broadcast_shapes, BinaryOp, BinaryOpProgram};
pub use fill::FillProgram;
pub use unary::{UnaryOp, UnaryOpProgram};

use crate::layout::COMPONENTS;
use crate::types::ShadingTarget;

/// A scalar float function `name(params..)` whose body is `snippet`.
pub(crate) fn scalar_operation(
    target: ShadingTarget,
    name: &str,
    params: &[&str],
    snippet: &str,
) -> String {
    match target {
        ShadingTarget::Wgsl => {
            let params: Vec<String> = params.iter().map(|p| format!("{p} : f32")).collect();
            format!("fn {name}({}) -> f32 {{\n  {snippet}\n}}\n", params.join(", "))
        }
        ShadingTarget::Glsl => {
            let params: Vec<String> = params.iter().map(|p| format!("float {p}")).collect();
            format!("float {name}({}) {{\n  {snippet}\n}}\n", params.join(", "))
        }
    }
}

/// A 4-wide `operation` applying the scalar `snippet` to each component.
pub(crate) fn component_wise(target: ShadingTarget, params: &[&str], snippet: &str) -> String {
    let scalar = scalar_operation(target, "operationScalar", params, snippet);
    let lanes: Vec<String> = COMPONENTS
        .iter()
        .map(|c| {
            let args: Vec<String> = params.iter().map(|p| format!("{p}.{c}")).collect();
            format!("operationScalar({})", args.join(", "))
        })
        .collect();
    match target {
        ShadingTarget::Wgsl => {
            let params: Vec<String> = params.iter().map(|p| format!("{p} : vec4<f32>")).collect();
            format!(
                "{scalar}\nfn operation({}) -> vec4<f32> {{\n  return vec4<f32>({});\n}}\n",
                params.join(", "),
                lanes.join(", ")
            )
        }
        ShadingTarget::Glsl => {
            let params: Vec<String> = params.iter().map(|p| format!("vec4 {p}")).collect();
            format!(
                "{scalar}\nvec4 operation({}) {{\n  return vec4({});\n}}\n",
                params.join(", "),
                lanes.join(", ")
            )
        }
    }
}
