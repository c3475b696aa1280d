//! Packing of per-dispatch uniform data.
//!
//! Every field is aligned by its component count, counted in 4-byte units: one
//! component aligns to 1, two to 2, three and four to 4. These are the `uniform`
//! address-space rules of both WGSL and std140 for 32-bit scalars and vectors, so the
//! packed bytes line up with the struct the generator declares.

use crate::error::{KernelError, KernelResult};
use crate::layout::{compute_strides, size_from_shape};
use crate::program::{OperandInfo, Program};
use crate::types::Vectorization;
use smallvec::SmallVec;

/// Byte alignment of a uniform buffer allocation.
pub const UNIFORM_BUFFER_ALIGNMENT: u64 = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UniformKind {
    Float32,
    Int32,
    Uint32,
}

#[derive(Clone, Debug, PartialEq)]
pub enum UniformData {
    Float32(Vec<f32>),
    Int32(Vec<i32>),
    Uint32(Vec<u32>),
}

impl UniformData {
    pub fn len(&self) -> usize {
        match self {
            UniformData::Float32(v) => v.len(),
            UniformData::Int32(v) => v.len(),
            UniformData::Uint32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn kind(&self) -> UniformKind {
        match self {
            UniformData::Float32(_) => UniformKind::Float32,
            UniformData::Int32(_) => UniformKind::Int32,
            UniformData::Uint32(_) => UniformKind::Uint32,
        }
    }

    /// Raw 32-bit words of the field in host byte order.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            UniformData::Float32(v) => bytemuck::cast_slice(v),
            UniformData::Int32(v) => bytemuck::cast_slice(v),
            UniformData::Uint32(v) => bytemuck::cast_slice(v),
        }
    }
}

fn base_alignment(len: usize) -> KernelResult<usize> {
    match len {
        1 => Ok(1),
        2 => Ok(2),
        3 | 4 => Ok(4),
        other => Err(KernelError::UniformMismatch(format!(
            "uniform fields hold 1 to 4 components, got {other}"
        ))),
    }
}

/// Insert `Int32([0])` padding fields so every field starts on its alignment.
///
/// Empty fields are replaced by a single `Int32(1)` component, which is how rank-0
/// and rank-1 shapes and strides reach the shader.
pub fn compute_padding(fields: &[UniformData]) -> KernelResult<Vec<UniformData>> {
    let mut padded = Vec::with_capacity(fields.len() * 2);
    let mut offset = 0usize;
    for field in fields {
        let field = if field.is_empty() {
            UniformData::Int32(vec![1])
        } else {
            field.clone()
        };
        let align = base_alignment(field.len())?;
        let pad = offset.next_multiple_of(align) - offset;
        for _ in 0..pad {
            padded.push(UniformData::Int32(vec![0]));
        }
        offset += pad + field.len();
        padded.push(field);
    }
    Ok(padded)
}

/// Pad and serialize `fields` as 32-bit words, ready for `Queue::write_buffer`.
pub fn pack_uniforms(fields: &[UniformData]) -> KernelResult<Vec<u8>> {
    let padded = compute_padding(fields)?;
    let mut bytes = Vec::with_capacity(padded.iter().map(UniformData::len).sum::<usize>() * 4);
    for field in &padded {
        bytes.extend_from_slice(field.as_bytes());
    }
    Ok(bytes)
}

pub fn uniform_buffer_size(packed_len: usize) -> u64 {
    (packed_len as u64)
        .max(UNIFORM_BUFFER_ALIGNMENT)
        .next_multiple_of(UNIFORM_BUFFER_ALIGNMENT)
}

fn shape_field(shape: &[usize]) -> UniformData {
    UniformData::Int32(shape.iter().map(|&d| d as i32).collect())
}

/// Assemble the uniform fields for one dispatch, in declaration order:
/// the NaN sentinel, each operand shape, the output shape and strides, the optional
/// logical size, the dispatch size and finally the program's extra fields.
pub fn program_uniform_fields(
    program: &Program,
    inputs: &[OperandInfo],
    output_shape: &[usize],
    dispatch: [u32; 3],
    extra: &[UniformData],
) -> KernelResult<Vec<UniformData>> {
    let decls = program.uniform_decls();
    if decls.len() != extra.len() {
        return Err(KernelError::UniformMismatch(format!(
            "program '{}' declares {} extra uniforms, got {}",
            program.shader_key(),
            decls.len(),
            extra.len()
        )));
    }
    let mut fields: SmallVec<[UniformData; 12]> = SmallVec::new();
    fields.push(UniformData::Float32(vec![f32::NAN]));
    for input in inputs {
        fields.push(shape_field(&input.shape));
    }
    fields.push(shape_field(output_shape));
    fields.push(shape_field(&compute_strides(output_shape)));
    if program.includes_size() {
        let mut size = size_from_shape(output_shape);
        if program.vectorization() == Vectorization::Vec4 {
            size /= 4;
        }
        fields.push(UniformData::Int32(vec![size as i32]));
    }
    fields.push(UniformData::Int32(dispatch.iter().map(|&d| d as i32).collect()));
    for (decl, data) in decls.iter().zip(extra) {
        if decl.kind != data.kind() || decl.width != data.len() {
            return Err(KernelError::UniformMismatch(format!(
                "uniform '{}' expects {} x {:?}, got {} x {:?}",
                decl.name,
                decl.width,
                decl.kind,
                data.len(),
                data.kind()
            )));
        }
        fields.push(data.clone());
    }
    Ok(fields.into_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::UniformDecl;
    use crate::types::{DataType, EntryKind};

    fn words(bytes: &[u8]) -> Vec<u32> {
        bytes.chunks_exact(4).map(bytemuck::pod_read_unaligned).collect()
    }

    #[test]
    fn vec3_after_scalar_pads_to_four_words() {
        let padded = compute_padding(&[
            UniformData::Float32(vec![1.0]),
            UniformData::Int32(vec![2, 3, 4]),
        ])
        .expect("pad");
        assert_eq!(
            padded,
            vec![
                UniformData::Float32(vec![1.0]),
                UniformData::Int32(vec![0]),
                UniformData::Int32(vec![0]),
                UniformData::Int32(vec![0]),
                UniformData::Int32(vec![2, 3, 4]),
            ]
        );
    }

    #[test]
    fn vec2_aligns_to_two_words() {
        let bytes = pack_uniforms(&[
            UniformData::Int32(vec![7]),
            UniformData::Int32(vec![8, 9]),
            UniformData::Uint32(vec![10]),
        ])
        .expect("pack");
        assert_eq!(words(&bytes), vec![7, 0, 8, 9, 10]);
    }

    #[test]
    fn empty_fields_become_one() {
        let padded = compute_padding(&[UniformData::Int32(vec![])]).expect("pad");
        assert_eq!(padded, vec![UniformData::Int32(vec![1])]);
    }

    #[test]
    fn five_component_fields_are_rejected() {
        let err = compute_padding(&[UniformData::Float32(vec![0.0; 5])]).unwrap_err();
        assert!(matches!(err, KernelError::UniformMismatch(_)));
    }

    #[test]
    fn buffer_size_rounds_up_to_sixteen() {
        assert_eq!(uniform_buffer_size(4), 16);
        assert_eq!(uniform_buffer_size(16), 16);
        assert_eq!(uniform_buffer_size(36), 48);
    }

    #[test]
    fn nan_sentinel_is_first_word() {
        let bytes = pack_uniforms(&[UniformData::Float32(vec![f32::NAN])]).expect("pack");
        assert!(bytemuck::pod_read_unaligned::<f32>(&bytes[..4]).is_nan());
    }

    #[test]
    fn program_fields_follow_declaration_order() {
        let program = Program::new("fill", vec![2, 3])
            .with_entry(EntryKind::Main)
            .with_size(true)
            .with_uniform(UniformDecl::new("value", UniformKind::Float32, 1));
        let inputs = [OperandInfo::new("x", DataType::Float32, vec![3])];
        let fields = program_uniform_fields(
            &program,
            &inputs,
            &[2, 3],
            [1, 1, 1],
            &[UniformData::Float32(vec![2.5])],
        )
        .expect("fields");
        assert_eq!(fields.len(), 7);
        assert_eq!(fields[1], UniformData::Int32(vec![3]));
        assert_eq!(fields[2], UniformData::Int32(vec![2, 3]));
        assert_eq!(fields[3], UniformData::Int32(vec![3]));
        assert_eq!(fields[4], UniformData::Int32(vec![6]));
        assert_eq!(fields[5], UniformData::Int32(vec![1, 1, 1]));
        assert_eq!(fields[6], UniformData::Float32(vec![2.5]));
    }

    #[test]
    fn extra_uniform_width_is_checked() {
        let program = Program::new("fill", vec![4])
            .with_uniform(UniformDecl::new("value", UniformKind::Float32, 1));
        let err = program_uniform_fields(
            &program,
            &[],
            &[4],
            [1, 1, 1],
            &[UniformData::Float32(vec![1.0, 2.0])],
        )
        .unwrap_err();
        assert!(matches!(err, KernelError::UniformMismatch(_)));
    }

    #[test]
    fn padding_is_idempotent() {
        let fields = vec![
            UniformData::Float32(vec![f32::MAX]),
            UniformData::Int32(vec![2, 3]),
            UniformData::Int32(vec![]),
            UniformData::Int32(vec![4, 5, 6]),
            UniformData::Float32(vec![0.5, 1.5]),
        ];
        let once = compute_padding(&fields).expect("pad");
        let twice = compute_padding(&once).expect("repad");
        assert_eq!(once, twice);
        let raw = pack_uniforms(&fields).expect("pack");
        let repacked = pack_uniforms(&once).expect("pack padded");
        assert_eq!(raw, repacked);
        assert_eq!(raw.len() % 4, 0);
    }

    // NaN never compares equal, so fields are matched on kind and bits.
    fn same_field(a: &UniformData, b: &UniformData) -> bool {
        a.kind() == b.kind() && a.as_bytes() == b.as_bytes()
    }

    /// Word offset of every caller field inside `padded`, skipping inserted padding.
    fn field_offsets(fields: &[UniformData], padded: &[UniformData]) -> Vec<usize> {
        let pad = UniformData::Int32(vec![0]);
        let mut offsets = Vec::with_capacity(fields.len());
        let mut slots = padded.iter();
        let mut offset = 0;
        for field in fields {
            let expected = if field.is_empty() {
                UniformData::Int32(vec![1])
            } else {
                field.clone()
            };
            loop {
                let slot = slots.next().expect("field missing from padded list");
                if same_field(slot, &expected) {
                    offsets.push(offset);
                    offset += slot.len();
                    break;
                }
                assert!(same_field(slot, &pad), "unexpected filler before {expected:?}");
                offset += 1;
            }
        }
        assert!(slots.next().is_none(), "trailing filler");
        offsets
    }

    #[test]
    fn program_fields_land_on_their_alignment() {
        let full = [2usize, 3, 4, 8];
        for rank in 0..=4 {
            let shape = full[4 - rank..].to_vec();
            let broadcast: Vec<usize> = shape
                .iter()
                .enumerate()
                .map(|(axis, &d)| if axis + 1 == rank { d } else { 1 })
                .collect();
            for vectorization in [Vectorization::Scalar, Vectorization::Vec4] {
                for with_size in [false, true] {
                    let program = Program::new("walk", shape.clone())
                        .with_vectorization(vectorization)
                        .with_size(with_size)
                        .with_uniform(UniformDecl::new("alpha", UniformKind::Float32, 1))
                        .with_uniform(UniformDecl::new("window", UniformKind::Int32, 3))
                        .with_uniform(UniformDecl::new("pair", UniformKind::Uint32, 2));
                    let inputs = [
                        OperandInfo::new("A", DataType::Float32, shape.clone()),
                        OperandInfo::new("B", DataType::Float32, broadcast.clone()),
                    ];
                    let extra = [
                        UniformData::Float32(vec![0.25]),
                        UniformData::Int32(vec![3, 3, 1]),
                        UniformData::Uint32(vec![9, 11]),
                    ];
                    let fields =
                        program_uniform_fields(&program, &inputs, &shape, [5, 6, 7], &extra)
                            .expect("fields");
                    let padded = compute_padding(&fields).expect("pad");
                    let offsets = field_offsets(&fields, &padded);
                    for (field, offset) in fields.iter().zip(&offsets) {
                        let align = base_alignment(field.len().max(1)).expect("align");
                        assert_eq!(
                            offset % align,
                            0,
                            "rank {rank} {vectorization:?} size={with_size}: {field:?} at {offset}"
                        );
                    }
                    let bytes = pack_uniforms(&fields).expect("pack");
                    let total: usize = padded.iter().map(UniformData::len).sum();
                    assert_eq!(bytes.len(), total * 4);
                    let dispatch_at = offsets[fields.len() - 4];
                    assert_eq!(&words(&bytes)[dispatch_at..dispatch_at + 3], &[5, 6, 7]);
                }
            }
        }
    }
}
