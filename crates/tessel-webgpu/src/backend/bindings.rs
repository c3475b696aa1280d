use wgpu::{BindGroupLayoutEntry, BindingType, BufferBindingType, ShaderStages};

/// What a program binding slot holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindingRole {
    Output,
    Operand,
    Uniforms,
}

impl BindingRole {
    fn buffer_type(self) -> BufferBindingType {
        match self {
            BindingRole::Output => BufferBindingType::Storage { read_only: false },
            BindingRole::Operand => BufferBindingType::Storage { read_only: true },
            BindingRole::Uniforms => BufferBindingType::Uniform,
        }
    }

    pub fn layout_entry(self, binding: u32) -> BindGroupLayoutEntry {
        BindGroupLayoutEntry {
            binding,
            visibility: ShaderStages::COMPUTE,
            ty: BindingType::Buffer {
                ty: self.buffer_type(),
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        }
    }
}

/// Roles by slot for a program with `operand_count` inputs: the output at 0, the
/// operands at `1..=operand_count`, the uniforms last.
pub fn program_binding_roles(operand_count: usize) -> Vec<BindingRole> {
    std::iter::once(BindingRole::Output)
        .chain(std::iter::repeat(BindingRole::Operand).take(operand_count))
        .chain(std::iter::once(BindingRole::Uniforms))
        .collect()
}

pub fn program_layout_entries(operand_count: usize) -> Vec<BindGroupLayoutEntry> {
    program_binding_roles(operand_count)
        .into_iter()
        .enumerate()
        .map(|(slot, role)| role.layout_entry(slot as u32))
        .collect()
}

pub fn build_program_bgl(device: &wgpu::Device, operand_count: usize) -> wgpu::BindGroupLayout {
    let label = format!("tessel-program-bgl-{operand_count}");
    device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some(&label),
        entries: &program_layout_entries(operand_count),
    })
}
