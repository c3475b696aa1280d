use super::{component_wise, scalar_operation};
use crate::error::{KernelError, KernelResult};
use crate::layout::broadcast_dims;
use crate::program::Program;
use crate::types::{EntryKind, ShadingTarget, Vectorization};
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    IntDiv,
    Pow,
    Maximum,
    Minimum,
    Equal,
    Less,
    Greater,
    Prelu,
}

impl BinaryOp {
    pub const ALL: [BinaryOp; 12] = [
        BinaryOp::Add,
        BinaryOp::Sub,
        BinaryOp::Mul,
        BinaryOp::Div,
        BinaryOp::IntDiv,
        BinaryOp::Pow,
        BinaryOp::Maximum,
        BinaryOp::Minimum,
        BinaryOp::Equal,
        BinaryOp::Less,
        BinaryOp::Greater,
        BinaryOp::Prelu,
    ];

    pub fn name(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::IntDiv => "int_div",
            BinaryOp::Pow => "pow",
            BinaryOp::Maximum => "maximum",
            BinaryOp::Minimum => "minimum",
            BinaryOp::Equal => "equal",
            BinaryOp::Less => "less",
            BinaryOp::Greater => "greater",
            BinaryOp::Prelu => "prelu",
        }
    }

    pub fn snippet(self, target: ShadingTarget) -> &'static str {
        match self {
            BinaryOp::Add => "return a + b;",
            BinaryOp::Sub => "return a - b;",
            BinaryOp::Mul => "return a * b;",
            BinaryOp::Div => "return a / b;",
            BinaryOp::IntDiv => match target {
                ShadingTarget::Wgsl => {
                    "let s = sign(a) * sign(b);\n  let ia = i32(round(a));\n  let ib = i32(round(b));\n  return f32(idiv(ia, ib, s));"
                }
                ShadingTarget::Glsl => {
                    "float s = sign(a) * sign(b);\n  int ia = int(round(a));\n  int ib = int(round(b));\n  return float(idiv(ia, ib, s));"
                }
            },
            BinaryOp::Pow => match target {
                ShadingTarget::Wgsl => {
                    "if (a < 0.0 && floor(b) < b) { return uniforms.NAN; }\n  if (b == 0.0) { return 1.0; }\n  if (round(abs(b) % 2.0) != 1.0) { return pow(abs(a), b); }\n  return sign(a) * pow(abs(a), b);"
                }
                ShadingTarget::Glsl => {
                    "if (a < 0.0 && floor(b) < b) { return uniforms.NAN; }\n  if (b == 0.0) { return 1.0; }\n  if (round(mod(abs(b), 2.0)) != 1.0) { return pow(abs(a), b); }\n  return sign(a) * pow(abs(a), b);"
                }
            },
            BinaryOp::Maximum => {
                "if (isnanCustom(a)) { return a; }\n  if (isnanCustom(b)) { return b; }\n  return max(a, b);"
            }
            BinaryOp::Minimum => {
                "if (isnanCustom(a)) { return a; }\n  if (isnanCustom(b)) { return b; }\n  return min(a, b);"
            }
            BinaryOp::Equal => "if (a == b) { return 1.0; }\n  return 0.0;",
            BinaryOp::Less => "if (a < b) { return 1.0; }\n  return 0.0;",
            BinaryOp::Greater => "if (a > b) { return 1.0; }\n  return 0.0;",
            BinaryOp::Prelu => "if (a < 0.0) { return b * a; }\n  return a;",
        }
    }

    pub fn supports_vec4(self) -> bool {
        matches!(
            self,
            BinaryOp::Add
                | BinaryOp::Sub
                | BinaryOp::Mul
                | BinaryOp::Div
                | BinaryOp::Pow
                | BinaryOp::Maximum
                | BinaryOp::Minimum
                | BinaryOp::Prelu
        )
    }
}

impl FromStr for BinaryOp {
    type Err = KernelError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        BinaryOp::ALL
            .into_iter()
            .find(|op| op.name() == name)
            .ok_or_else(|| KernelError::UnknownOp(name.to_string()))
    }
}

/// Output shape of broadcasting `a` against `b`, numpy-style.
pub fn broadcast_shapes(a: &[usize], b: &[usize]) -> KernelResult<Vec<usize>> {
    let rank = a.len().max(b.len());
    let mut out = vec![0usize; rank];
    for i in 0..rank {
        let da = if i < rank - a.len() { 1 } else { a[i - (rank - a.len())] };
        let db = if i < rank - b.len() { 1 } else { b[i - (rank - b.len())] };
        out[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => {
                return Err(KernelError::UnsupportedLayout(format!(
                    "shapes {a:?} and {b:?} do not broadcast"
                )))
            }
        };
    }
    Ok(out)
}

/// Elementwise `result = op(A, B)` with broadcasting.
pub struct BinaryOpProgram;

impl BinaryOpProgram {
    pub fn build(
        op: BinaryOp,
        a_shape: &[usize],
        b_shape: &[usize],
        target: ShadingTarget,
        vectorization: Vectorization,
        workgroup_size: [u32; 3],
    ) -> KernelResult<Program> {
        let output_shape = broadcast_shapes(a_shape, b_shape)?;
        if vectorization == Vectorization::Vec4 && !op.supports_vec4() {
            return Err(KernelError::UnsupportedLayout(format!(
                "binary op '{}' has no vec4 path",
                op.name()
            )));
        }
        let params = ["a", "b"];
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
        log::trace!(
            "binary program {}: {:?} x {:?} -> {:?} (broadcast a={:?} b={:?})",
            op.name(),
            a_shape,
            b_shape,
            output_shape,
            broadcast_dims(a_shape, &output_shape),
            broadcast_dims(b_shape, &output_shape)
        );
        Ok(Program::new(format!("binary_{}", op.name()), output_shape)
            .with_variables(["A", "B"])
            .with_entry(EntryKind::Elementwise)
            .with_size(true)
            .with_target(target)
            .with_vectorization(vectorization)
            .with_elements_per_thread([vectorization.width() as u32, 1, 1])
            .with_workgroup_size(workgroup_size)
            .with_wgsl_body(wgsl)
            .with_glsl_body(glsl))
    }

    pub fn from_name(
        name: &str,
        a_shape: &[usize],
        b_shape: &[usize],
        target: ShadingTarget,
        vectorization: Vectorization,
        workgroup_size: [u32; 3],
    ) -> KernelResult<Program> {
        Self::build(name.parse()?, a_shape, b_shape, target, vectorization, workgroup_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_shape_right_aligns() {
        assert_eq!(broadcast_shapes(&[1, 4], &[3, 4]).expect("ok"), vec![3, 4]);
        assert_eq!(broadcast_shapes(&[4], &[2, 3, 4]).expect("ok"), vec![2, 3, 4]);
        assert_eq!(broadcast_shapes(&[], &[5]).expect("ok"), vec![5]);
        assert!(broadcast_shapes(&[2], &[3]).is_err());
    }

    #[test]
    fn program_declares_both_operands() {
        let program = BinaryOpProgram::build(
            BinaryOp::Add,
            &[1, 4],
            &[3, 4],
            ShadingTarget::Wgsl,
            Vectorization::Scalar,
            [64, 1, 1],
        )
        .expect("program");
        assert_eq!(program.output_shape(), &[3, 4]);
        assert_eq!(program.variable_names(), &["A".to_string(), "B".to_string()]);
        assert!(program.body().expect("body").contains("return a + b;"));
    }

    #[test]
    fn unknown_binary_op_is_an_error() {
        let err = BinaryOpProgram::from_name(
            "atan2",
            &[2],
            &[2],
            ShadingTarget::Glsl,
            Vectorization::Scalar,
            [64, 1, 1],
        )
        .unwrap_err();
        assert!(matches!(err, KernelError::UnknownOp(_)));
    }
}
