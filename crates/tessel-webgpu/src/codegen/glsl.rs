use super::ast::{Access, Builtin, Function, ScalarType, ShaderModule, ShaderType};
use super::ShaderRenderer;
use std::fmt::Write as _;

/// GLSL 4.50 compute shaders: std430 storage blocks and a std140 uniform block.
#[derive(Clone, Copy, Debug, Default)]
pub struct GlslRenderer;

impl ShaderRenderer for GlslRenderer {
    fn render(&self, module: &ShaderModule) -> String {
        let mut out = String::with_capacity(8 * 1024);
        out.push_str("#version 450\n\n");
        let [x, y, z] = module.entry.workgroup_size;
        let _ = writeln!(
            out,
            "layout(local_size_x = {x}, local_size_y = {y}, local_size_z = {z}) in;\n"
        );

        for binding in &module.storage {
            let qualifier = match binding.access {
                Access::Read => "readonly ",
                Access::ReadWrite => "",
            };
            let _ = writeln!(
                out,
                "layout(std430, set = 0, binding = {}) {qualifier}buffer ssb_{} {{\n  {} {}[];\n}};",
                binding.binding,
                binding.name,
                self.type_name(binding.element),
                binding.name
            );
        }
        let _ = writeln!(
            out,
            "layout(std140, set = 0, binding = {}) uniform Uniforms {{",
            module.uniform_binding
        );
        for member in &module.uniforms {
            let _ = writeln!(out, "  {} {};", self.type_name(member.ty), member.name);
        }
        out.push_str("} uniforms;\n\n");

        for helper in &module.helpers {
            self.function(helper, &mut out);
        }

        out.push_str(module.user_code.trim_end());
        out.push_str("\n\n");

        out.push_str("void main() {\n");
        self.block(&module.entry.body, 1, &mut out);
        out.push_str("}\n");
        out
    }

    fn type_name(&self, ty: ShaderType) -> String {
        match ty {
            ShaderType::Scalar(ScalarType::F32) => "float".into(),
            ShaderType::Scalar(ScalarType::I32) => "int".into(),
            ShaderType::Scalar(ScalarType::U32) => "uint".into(),
            ShaderType::Scalar(ScalarType::Bool) => "bool".into(),
            ShaderType::Vector(n, ScalarType::F32) => format!("vec{n}"),
            ShaderType::Vector(n, ScalarType::I32) => format!("ivec{n}"),
            ShaderType::Vector(n, ScalarType::U32) => format!("uvec{n}"),
            ShaderType::Vector(n, ScalarType::Bool) => format!("bvec{n}"),
        }
    }

    fn builtin(&self, builtin: Builtin) -> &'static str {
        match builtin {
            Builtin::LocalInvocationId => "gl_LocalInvocationID",
            Builtin::GlobalInvocationId => "gl_GlobalInvocationID",
            Builtin::WorkgroupId => "gl_WorkGroupID",
        }
    }

    fn declare(&self, name: &str, ty: ShaderType, _mutable: bool) -> String {
        format!("{} {name}", self.type_name(ty))
    }

    fn signature(&self, function: &Function) -> String {
        let params: Vec<String> = function
            .params
            .iter()
            .map(|p| format!("{} {}", self.type_name(p.ty), p.name))
            .collect();
        let ret = function
            .ret
            .map(|ty| self.type_name(ty))
            .unwrap_or_else(|| "void".to_string());
        format!("{ret} {}({})", function.name, params.join(", "))
    }
}
