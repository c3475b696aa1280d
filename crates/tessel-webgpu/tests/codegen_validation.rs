//! Every generated shader must get through naga's front end and validator.

use tessel_webgpu::codegen::OUTPUT_NAME;
use tessel_webgpu::{
    generate_shader, BinaryOp, BinaryOpProgram, DataType, DispatchLayout, FillProgram,
    GeneratedShader, OperandInfo, Program, ShadingTarget, UnaryOp, UnaryOpProgram,
    Vectorization,
};

const TARGETS: [ShadingTarget; 2] = [ShadingTarget::Wgsl, ShadingTarget::Glsl];
const WG: [u32; 3] = [64, 1, 1];

fn parse(shader: &GeneratedShader) -> naga::Module {
    match shader.target {
        ShadingTarget::Wgsl => naga::front::wgsl::parse_str(&shader.source)
            .unwrap_or_else(|e| panic!("wgsl parse failed: {e:?}\n{}", shader.source)),
        ShadingTarget::Glsl => {
            let mut frontend = naga::front::glsl::Frontend::default();
            frontend
                .parse(
                    &naga::front::glsl::Options::from(naga::ShaderStage::Compute),
                    &shader.source,
                )
                .unwrap_or_else(|e| panic!("glsl parse failed: {e:?}\n{}", shader.source))
        }
    }
}

fn assert_valid(shader: &GeneratedShader) {
    let module = parse(shader);
    let mut validator = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::empty(),
    );
    if let Err(e) = validator.validate(&module) {
        panic!("validation failed: {e:?}\n{}", shader.source);
    }
    assert!(
        module.entry_points.iter().any(|ep| ep.name == shader.entry_point),
        "missing entry point {}",
        shader.entry_point
    );
}

fn output(shape: &[usize], dtype: DataType) -> OperandInfo {
    OperandInfo::new(OUTPUT_NAME, dtype, shape.to_vec())
}

#[test]
fn binary_add_with_broadcast_for_every_rank() {
    let cases: [(&[usize], &[usize]); 5] = [
        (&[4], &[4]),
        (&[1, 4], &[3, 4]),
        (&[2, 1, 4], &[2, 3, 4]),
        (&[1, 1, 1, 4], &[2, 3, 2, 4]),
        (&[], &[5]),
    ];
    for target in TARGETS {
        for (a, b) in cases {
            let program =
                BinaryOpProgram::build(BinaryOp::Add, a, b, target, Vectorization::Scalar, WG)
                    .expect("program");
            let inputs = [
                OperandInfo::new("A", DataType::Float32, a.to_vec()),
                OperandInfo::new("B", DataType::Float32, b.to_vec()),
            ];
            let shader =
                generate_shader(&program, &inputs, &output(program.output_shape(), DataType::Float32))
                    .expect("shader");
            assert_valid(&shader);
        }
    }
}

#[test]
fn every_binary_op_validates_on_int_storage() {
    for target in TARGETS {
        for op in BinaryOp::ALL {
            let program =
                BinaryOpProgram::build(op, &[2, 3], &[3], target, Vectorization::Scalar, WG)
                    .expect("program");
            let inputs = [
                OperandInfo::new("A", DataType::Int32, vec![2, 3]),
                OperandInfo::new("B", DataType::Int32, vec![3]),
            ];
            let shader = generate_shader(&program, &inputs, &output(&[2, 3], DataType::Int32))
                .unwrap_or_else(|e| panic!("{op:?}: {e}"));
            assert_valid(&shader);
        }
    }
}

#[test]
fn every_unary_op_validates() {
    for target in TARGETS {
        for op in UnaryOp::ALL {
            let program =
                UnaryOpProgram::build(op, vec![3, 5], target, Vectorization::Scalar, WG)
                    .expect("program");
            let inputs = [OperandInfo::new("x", DataType::Float32, vec![3, 5])];
            let out_dtype = match op {
                UnaryOp::IsNan | UnaryOp::LogicalNot => DataType::Bool,
                _ => DataType::Float32,
            };
            let shader = generate_shader(&program, &inputs, &output(&[3, 5], out_dtype))
                .unwrap_or_else(|e| panic!("{op:?}: {e}"));
            assert_valid(&shader);
        }
    }
}

#[test]
fn vec4_programs_validate() {
    for target in TARGETS {
        let program =
            BinaryOpProgram::build(BinaryOp::Mul, &[8], &[2, 8], target, Vectorization::Vec4, WG)
                .expect("program");
        let inputs = [
            OperandInfo::new("A", DataType::Float32, vec![8]),
            OperandInfo::new("B", DataType::Float32, vec![2, 8]),
        ];
        let shader = generate_shader(&program, &inputs, &output(&[2, 8], DataType::Float32))
            .expect("shader");
        assert_valid(&shader);

        let program =
            UnaryOpProgram::build(UnaryOp::Relu, vec![4, 4], target, Vectorization::Vec4, WG)
                .expect("program");
        let inputs = [OperandInfo::new("x", DataType::Float32, vec![4, 4])];
        let shader = generate_shader(&program, &inputs, &output(&[4, 4], DataType::Float32))
            .expect("shader");
        assert_valid(&shader);
    }
}

#[test]
fn fill_program_validates() {
    for target in TARGETS {
        let program = FillProgram::build(vec![2, 2, 2], target, WG);
        let shader = generate_shader(&program, &[], &output(&[2, 2, 2], DataType::Float32))
            .expect("shader");
        assert_valid(&shader);
    }
}

#[test]
fn non_flat_layout_validates() {
    let wgsl = "fn userMain() {
  let coords = getOutputCoords();
  if (coordsInBounds2D(coords, uniforms.outShape)) {
    setOutputAtCoords(coords.x, coords.y, getX(coords.y, coords.x));
  }
}
";
    let glsl = "void userMain() {
  ivec2 coords = getOutputCoords();
  if (coordsInBounds2D(coords, uniforms.outShape)) {
    setOutputAtCoords(coords.x, coords.y, getX(coords.y, coords.x));
  }
}
";
    for target in TARGETS {
        let program = Program::new("transpose", vec![8, 6])
            .with_layout(DispatchLayout::new(vec![1], vec![0], vec![]))
            .with_workgroup_size([8, 8, 1])
            .with_variables(["x"])
            .with_target(target)
            .with_wgsl_body(wgsl)
            .with_glsl_body(glsl);
        let inputs = [OperandInfo::new("x", DataType::Float32, vec![6, 8])];
        let shader = generate_shader(&program, &inputs, &output(&[8, 6], DataType::Float32))
            .expect("shader");
        assert_valid(&shader);
    }
}

#[test]
fn rank_four_main_program_validates() {
    let wgsl = "fn userMain(index : i32) {
  if (index < uniforms.size) {
    let coords = getCoordsFromIndex(index);
    setOutputAtIndex(index, getX(coords[0], coords[1], coords[2], coords[3]) * 2.0);
  }
}
";
    let glsl = "void userMain(int index) {
  if (index < uniforms.size) {
    ivec4 coords = getCoordsFromIndex(index);
    setOutputAtIndex(index, getX(coords[0], coords[1], coords[2], coords[3]) * 2.0);
  }
}
";
    for target in TARGETS {
        let program = Program::new("double", vec![2, 3, 4, 5])
            .with_size(true)
            .with_variables(["x"])
            .with_target(target)
            .with_wgsl_body(wgsl)
            .with_glsl_body(glsl);
        let inputs = [OperandInfo::new("x", DataType::Float32, vec![2, 3, 4, 5])];
        let shader = generate_shader(&program, &inputs, &output(&[2, 3, 4, 5], DataType::Float32))
            .expect("shader");
        assert_valid(&shader);
    }
}
