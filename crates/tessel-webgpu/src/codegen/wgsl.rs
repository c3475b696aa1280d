use super::ast::{Access, Builtin, Function, ScalarType, ShaderModule, ShaderType};
use super::ShaderRenderer;
use crate::types::ShadingTarget;
use std::fmt::Write as _;

#[derive(Clone, Copy, Debug, Default)]
pub struct WgslRenderer;

fn scalar_name(scalar: ScalarType) -> &'static str {
    match scalar {
        ScalarType::F32 => "f32",
        ScalarType::I32 => "i32",
        ScalarType::U32 => "u32",
        ScalarType::Bool => "bool",
    }
}

impl ShaderRenderer for WgslRenderer {
    fn render(&self, module: &ShaderModule) -> String {
        let mut out = String::with_capacity(8 * 1024);

        out.push_str("struct Uniforms {\n");
        for member in &module.uniforms {
            let _ = writeln!(out, "  {} : {},", member.name, self.type_name(member.ty));
        }
        out.push_str("}\n\n");

        for binding in &module.storage {
            let access = match binding.access {
                Access::Read => "read",
                Access::ReadWrite => "read_write",
            };
            let _ = writeln!(
                out,
                "@group(0) @binding({}) var<storage, {access}> {} : array<{}>;",
                binding.binding,
                binding.name,
                self.type_name(binding.element)
            );
        }
        let _ = writeln!(
            out,
            "@group(0) @binding({}) var<uniform> uniforms : Uniforms;\n",
            module.uniform_binding
        );

        out.push_str("var<private> localId : vec3<u32>;\n");
        out.push_str("var<private> globalId : vec3<u32>;\n");
        out.push_str("var<private> workgroupId : vec3<u32>;\n\n");

        for helper in &module.helpers {
            self.function(helper, &mut out);
        }

        out.push_str(module.user_code.trim_end());
        out.push_str("\n\n");

        let [x, y, z] = module.entry.workgroup_size;
        let _ = writeln!(out, "@compute @workgroup_size({x}, {y}, {z})");
        let _ = writeln!(
            out,
            "fn {}(@builtin(local_invocation_id) LocalId : vec3<u32>, @builtin(global_invocation_id) GlobalId : vec3<u32>, @builtin(workgroup_id) WorkgroupId : vec3<u32>) {{",
            ShadingTarget::Wgsl.entry_point()
        );
        out.push_str("  localId = LocalId;\n");
        out.push_str("  globalId = GlobalId;\n");
        out.push_str("  workgroupId = WorkgroupId;\n");
        self.block(&module.entry.body, 1, &mut out);
        out.push_str("}\n");
        out
    }

    fn type_name(&self, ty: ShaderType) -> String {
        match ty {
            ShaderType::Scalar(scalar) => scalar_name(scalar).to_string(),
            ShaderType::Vector(n, scalar) => format!("vec{n}<{}>", scalar_name(scalar)),
        }
    }

    fn builtin(&self, builtin: Builtin) -> &'static str {
        match builtin {
            Builtin::LocalInvocationId => "localId",
            Builtin::GlobalInvocationId => "globalId",
            Builtin::WorkgroupId => "workgroupId",
        }
    }

    fn declare(&self, name: &str, ty: ShaderType, mutable: bool) -> String {
        let keyword = if mutable { "var" } else { "let" };
        format!("{keyword} {name} : {}", self.type_name(ty))
    }

    fn signature(&self, function: &Function) -> String {
        let params: Vec<String> = function
            .params
            .iter()
            .map(|p| format!("{} : {}", p.name, self.type_name(p.ty)))
            .collect();
        match function.ret {
            Some(ret) => format!(
                "fn {}({}) -> {}",
                function.name,
                params.join(", "),
                self.type_name(ret)
            ),
            None => format!("fn {}({})", function.name, params.join(", ")),
        }
    }
}
