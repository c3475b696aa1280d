//! Shader source generation.
//!
//! A [`Program`] plus operand metadata is first lowered to a [`ShaderModule`] of typed
//! fragments by the builder, then rendered to text by the [`ShaderRenderer`] for the
//! program's [`ShadingTarget`]. Both targets share the module, so the helpers they emit
//! agree by construction.
//!
//! ## Usage
//!
//! ```ignore
//! use tessel_webgpu::codegen::generate_shader;
//!
//! let shader = generate_shader(&program, &inputs, &output)?;
//! println!("{}", shader.source);
//! ```

pub mod ast;
mod builder;
pub mod glsl;
pub mod wgsl;

pub use builder::{capitalize, shape_uniform, OUTPUT_NAME};
pub use glsl::GlslRenderer;
pub use wgsl::WgslRenderer;

use crate::error::KernelResult;
use crate::program::{OperandInfo, Program};
use crate::types::ShadingTarget;
use ast::{BinaryOp, Builtin, Expr, Function, ShaderModule, ShaderType, Stmt};
use builder::ModuleBuilder;
use std::fmt::Write as _;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GeneratedShader {
    pub target: ShadingTarget,
    pub entry_point: &'static str,
    pub source: String,
}

/// Lower `program` for the given operands without rendering it.
pub fn build_module(
    program: &Program,
    inputs: &[OperandInfo],
    output: &OperandInfo,
) -> KernelResult<ShaderModule> {
    ModuleBuilder::new(program, inputs, output).build()
}

/// Complete shader source for `program` in its target language.
pub fn generate_shader(
    program: &Program,
    inputs: &[OperandInfo],
    output: &OperandInfo,
) -> KernelResult<GeneratedShader> {
    let module = build_module(program, inputs, output)?;
    let target = program.target();
    let source = match target {
        ShadingTarget::Wgsl => WgslRenderer.render(&module),
        ShadingTarget::Glsl => GlslRenderer.render(&module),
    };
    log::trace!(
        "codegen: {} {} bytes for '{}'",
        target,
        source.len(),
        program.shader_key()
    );
    Ok(GeneratedShader {
        target,
        entry_point: target.entry_point(),
        source,
    })
}

/// Turns a [`ShaderModule`] into source text for one shading language.
///
/// Implementors supply the language-specific spellings; expressions, statements and
/// function bodies are rendered by the provided methods.
pub trait ShaderRenderer {
    fn render(&self, module: &ShaderModule) -> String;

    fn type_name(&self, ty: ShaderType) -> String;

    fn builtin(&self, builtin: Builtin) -> &'static str;

    /// Declaration head of a local, without the initializer.
    fn declare(&self, name: &str, ty: ShaderType, mutable: bool) -> String;

    fn signature(&self, function: &Function) -> String;

    fn expr(&self, expr: &Expr) -> String {
        match expr {
            Expr::Ident(name) => name.clone(),
            Expr::Int(value) => value.to_string(),
            Expr::Float(value) => format!("{value:?}"),
            Expr::Bool(value) => value.to_string(),
            Expr::Member(base, name) => format!("{}.{name}", self.operand(base)),
            Expr::Index(base, at) => format!("{}[{}]", self.operand(base), self.expr(at)),
            Expr::Binary(op, lhs, rhs) => {
                format!("{} {} {}", self.operand(lhs), binary_symbol(*op), self.operand(rhs))
            }
            Expr::Neg(inner) => format!("-{}", self.operand(inner)),
            Expr::Call(name, args) => format!("{name}({})", self.args(args)),
            Expr::Construct(ty, args) => format!("{}({})", self.type_name(*ty), self.args(args)),
            Expr::Builtin(builtin) => self.builtin(*builtin).to_string(),
        }
    }

    /// Render `expr` as an operand of a larger expression, parenthesizing compounds.
    fn operand(&self, expr: &Expr) -> String {
        match expr {
            Expr::Binary(..) | Expr::Neg(_) => format!("({})", self.expr(expr)),
            _ => self.expr(expr),
        }
    }

    fn args(&self, args: &[Expr]) -> String {
        args.iter()
            .map(|arg| self.expr(arg))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn block(&self, stmts: &[Stmt], depth: usize, out: &mut String) {
        let pad = "  ".repeat(depth);
        for stmt in stmts {
            match stmt {
                Stmt::Let { name, ty, value } => {
                    let _ = writeln!(out, "{pad}{} = {};", self.declare(name, *ty, false), self.expr(value));
                }
                Stmt::Var { name, ty, value } => {
                    let _ = writeln!(out, "{pad}{} = {};", self.declare(name, *ty, true), self.expr(value));
                }
                Stmt::Assign { target, value } => {
                    let _ = writeln!(out, "{pad}{} = {};", self.expr(target), self.expr(value));
                }
                Stmt::If { cond, then } => {
                    let _ = writeln!(out, "{pad}if ({}) {{", self.expr(cond));
                    self.block(then, depth + 1, out);
                    let _ = writeln!(out, "{pad}}}");
                }
                Stmt::Return(Some(value)) => {
                    let _ = writeln!(out, "{pad}return {};", self.expr(value));
                }
                Stmt::Return(None) => {
                    let _ = writeln!(out, "{pad}return;");
                }
                Stmt::Expr(expr) => {
                    let _ = writeln!(out, "{pad}{};", self.expr(expr));
                }
            }
        }
    }

    fn function(&self, function: &Function, out: &mut String) {
        let _ = writeln!(out, "{} {{", self.signature(function));
        self.block(&function.body, 1, out);
        out.push_str("}\n\n");
    }
}

fn binary_symbol(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Add => "+",
        BinaryOp::Sub => "-",
        BinaryOp::Mul => "*",
        BinaryOp::Div => "/",
        BinaryOp::Rem => "%",
        BinaryOp::Lt => "<",
        BinaryOp::Ge => ">=",
        BinaryOp::Gt => ">",
        BinaryOp::Eq => "==",
        BinaryOp::Ne => "!=",
        BinaryOp::And => "&&",
        BinaryOp::Or => "||",
    }
}
