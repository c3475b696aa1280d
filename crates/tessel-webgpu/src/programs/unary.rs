use super::{component_wise, scalar_operation};
use crate::error::{KernelError, KernelResult};
use crate::program::Program;
use crate::types::{EntryKind, ShadingTarget, Vectorization};
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Linear,
    Relu,
    Relu6,
    Elu,
    Sigmoid,
    Abs,
    Neg,
    Exp,
    Log,
    Sqrt,
    Square,
    Tanh,
    Floor,
    Ceil,
    Sin,
    Cos,
    IsNan,
    LogicalNot,
}

impl UnaryOp {
    pub const ALL: [UnaryOp; 18] = [
        UnaryOp::Linear,
        UnaryOp::Relu,
        UnaryOp::Relu6,
        UnaryOp::Elu,
        UnaryOp::Sigmoid,
        UnaryOp::Abs,
        UnaryOp::Neg,
        UnaryOp::Exp,
        UnaryOp::Log,
        UnaryOp::Sqrt,
        UnaryOp::Square,
        UnaryOp::Tanh,
        UnaryOp::Floor,
        UnaryOp::Ceil,
        UnaryOp::Sin,
        UnaryOp::Cos,
        UnaryOp::IsNan,
        UnaryOp::LogicalNot,
    ];

    pub fn name(self) -> &'static str {
        match self {
            UnaryOp::Linear => "linear",
            UnaryOp::Relu => "relu",
            UnaryOp::Relu6 => "relu6",
            UnaryOp::Elu => "elu",
            UnaryOp::Sigmoid => "sigmoid",
            UnaryOp::Abs => "abs",
            UnaryOp::Neg => "neg",
            UnaryOp::Exp => "exp",
            UnaryOp::Log => "log",
            UnaryOp::Sqrt => "sqrt",
            UnaryOp::Square => "square",
            UnaryOp::Tanh => "tanh",
            UnaryOp::Floor => "floor",
            UnaryOp::Ceil => "ceil",
            UnaryOp::Sin => "sin",
            UnaryOp::Cos => "cos",
            UnaryOp::IsNan => "is_nan",
            UnaryOp::LogicalNot => "logical_not",
        }
    }

    /// Body of `operation(a)` in `target`, operating on one scalar.
    pub fn snippet(self, target: ShadingTarget) -> &'static str {
        match self {
            UnaryOp::Linear => "return a;",
            UnaryOp::Relu => "if (a < 0.0) { return 0.0; }\n  return a;",
            UnaryOp::Relu6 => "if (isnanCustom(a)) { return a; }\n  return clamp(a, 0.0, 6.0);",
            UnaryOp::Elu => "if (a >= 0.0) { return a; }\n  return exp(a) - 1.0;",
            UnaryOp::Sigmoid => "return 1.0 / (1.0 + exp(-1.0 * a));",
            UnaryOp::Abs => "return abs(a);",
            UnaryOp::Neg => "return -a;",
            UnaryOp::Exp => "return exp(a);",
            UnaryOp::Log => "if (a < 0.0) { return uniforms.NAN; }\n  return log(a);",
            UnaryOp::Sqrt => "return sqrt(a);",
            UnaryOp::Square => "return a * a;",
            UnaryOp::Tanh => match target {
                ShadingTarget::Wgsl => {
                    "let e2x = exp(-2.0 * abs(a));\n  return sign(a) * (1.0 - e2x) / (1.0 + e2x);"
                }
                ShadingTarget::Glsl => {
                    "float e2x = exp(-2.0 * abs(a));\n  return sign(a) * (1.0 - e2x) / (1.0 + e2x);"
                }
            },
            UnaryOp::Floor => "return floor(a);",
            UnaryOp::Ceil => "return ceil(a);",
            UnaryOp::Sin => "return sin(a);",
            UnaryOp::Cos => "return cos(a);",
            UnaryOp::IsNan => "if (isnanCustom(a)) { return 1.0; }\n  return 0.0;",
            UnaryOp::LogicalNot => "if (a == 0.0) { return 1.0; }\n  return 0.0;",
        }
    }

    /// Ops offered with a 4-wide path: the float arithmetic subset.
    pub fn supports_vec4(self) -> bool {
        !matches!(self, UnaryOp::IsNan | UnaryOp::LogicalNot)
    }
}

impl FromStr for UnaryOp {
    type Err = KernelError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        UnaryOp::ALL
            .into_iter()
            .find(|op| op.name() == name)
            .ok_or_else(|| KernelError::UnknownOp(name.to_string()))
    }
}

/// Elementwise `result = op(x)` over a tensor of `shape`.
pub struct UnaryOpProgram;

impl UnaryOpProgram {
    pub fn build(
        op: UnaryOp,
        shape: Vec<usize>,
        target: ShadingTarget,
        vectorization: Vectorization,
        workgroup_size: [u32; 3],
    ) -> KernelResult<Program> {
        if vectorization == Vectorization::Vec4 && !op.supports_vec4() {
            return Err(KernelError::UnsupportedLayout(format!(
                "unary op '{}' has no vec4 path",
                op.name()
            )));
        }
        let params = ["a"];
        let (wgsl, glsl) = match vectorization {
            Vectorization::Scalar => (
                scalar_operation(ShadingTarget::Wgsl, "operation", &params, op.snippet(ShadingTarget::Wgsl)),
                scalar_operation(ShadingTarget::Glsl, "operation", &params, op.snippet(ShadingTarget::Glsl)),
            ),
            Vectorization::Vec4 => (
                component_wise(ShadingTarget::Wgsl, &params, op.snippet(ShadingTarget::Wgsl)),
                component_wise(ShadingTarget::Glsl, &params, op.snippet(ShadingTarget::Glsl)),
            ),
        };
        Ok(Program::new(format!("unary_{}", op.name()), shape)
            .with_variables(["x"])
            .with_entry(EntryKind::Elementwise)
            .with_size(true)
            .with_target(target)
            .with_vectorization(vectorization)
            .with_elements_per_thread([vectorization.width() as u32, 1, 1])
            .with_workgroup_size(workgroup_size)
            .with_wgsl_body(wgsl)
            .with_glsl_body(glsl))
    }

    /// Look `name` up in the snippet table and build the program.
    pub fn from_name(
        name: &str,
        shape: Vec<usize>,
        target: ShadingTarget,
        vectorization: Vectorization,
        workgroup_size: [u32; 3],
    ) -> KernelResult<Program> {
        Self::build(name.parse()?, shape, target, vectorization, workgroup_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip_through_the_table() {
        for op in UnaryOp::ALL {
            assert_eq!(op.name().parse::<UnaryOp>().expect("known"), op);
        }
    }

    #[test]
    fn unknown_op_is_an_error() {
        let err = UnaryOpProgram::from_name("gelu_fast", vec![4], ShadingTarget::Wgsl, Vectorization::Scalar, [64, 1, 1])
            .unwrap_err();
        assert!(matches!(err, KernelError::UnknownOp(name) if name == "gelu_fast"));
    }

    #[test]
    fn vec4_is_refused_for_predicates() {
        assert!(UnaryOpProgram::build(UnaryOp::IsNan, vec![8], ShadingTarget::Wgsl, Vectorization::Vec4, [64, 1, 1]).is_err());
    }
}
