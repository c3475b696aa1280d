//! End-to-end runs against a real adapter. Each test returns early when the host has
//! no usable GPU (or software) adapter.

use serial_test::serial;
use std::sync::Once;
use tessel_logging::{init_logging, LoggingOptions};
use tessel_webgpu::{
    BackendConfig, BackendValues, BinaryOp, BinaryOpProgram, DataType, EncoderState,
    FillProgram, KernelError, ShadingTarget, TensorInfo, UnaryOp, UnaryOpProgram,
    Vectorization, WebGpuBackend,
};

static LOGGING: Once = Once::new();

fn backend_with(config: BackendConfig) -> Option<WebGpuBackend> {
    LOGGING.call_once(|| {
        std::mem::forget(init_logging(LoggingOptions::default()));
    });
    match WebGpuBackend::new_blocking(config) {
        Ok(backend) => Some(backend),
        Err(err) => {
            log::warn!("skipping device test: {err}");
            None
        }
    }
}

fn backend() -> Option<WebGpuBackend> {
    backend_with(BackendConfig::default())
}

fn floats(backend: &mut WebGpuBackend, shape: Vec<usize>, values: Vec<f32>) -> TensorInfo {
    backend
        .make_tensor_info(shape, DataType::Float32, Some(BackendValues::Float32(values)))
        .expect("tensor")
}

fn kernel_error(err: &anyhow::Error) -> &KernelError {
    err.downcast_ref::<KernelError>()
        .unwrap_or_else(|| panic!("not a KernelError: {err:#}"))
}

fn add(backend: &mut WebGpuBackend, a: TensorInfo, b: TensorInfo) -> TensorInfo {
    let program = BinaryOpProgram::build(
        BinaryOp::Add,
        &a.shape,
        &b.shape,
        backend.shading_target(),
        Vectorization::Scalar,
        backend.config().workgroup_size,
    )
    .expect("program");
    backend
        .run_program(&program, &[a, b], DataType::Float32, &[])
        .expect("run")
}

#[test]
#[serial]
fn add_broadcasts_a_row_across_rows() {
    let Some(mut backend) = backend() else { return };
    let a = floats(&mut backend, vec![1, 4], vec![1.0, 2.0, 3.0, 4.0]);
    let b = floats(&mut backend, vec![3, 4], (0..12).map(|v| v as f32 * 10.0).collect());
    let out = add(&mut backend, a, b);
    assert_eq!(out.shape, vec![3, 4]);
    let values = backend.read_sync(out.data_id).expect("read");
    let expected: Vec<f32> = (0..12)
        .map(|i| (i as f32) * 10.0 + (i % 4 + 1) as f32)
        .collect();
    assert_eq!(values, BackendValues::Float32(expected));
}

#[test]
#[serial]
fn glsl_programs_run_end_to_end() {
    let config = BackendConfig {
        shading_language: ShadingTarget::Glsl,
        ..BackendConfig::default()
    };
    let Some(mut backend) = backend_with(config) else { return };
    let a = floats(&mut backend, vec![2, 1], vec![1.0, -1.0]);
    let b = floats(&mut backend, vec![2, 3], vec![1.0; 6]);
    let out = add(&mut backend, a, b);
    let values = backend.read_sync(out.data_id).expect("read");
    assert_eq!(
        values,
        BackendValues::Float32(vec![2.0, 2.0, 2.0, 0.0, 0.0, 0.0])
    );
}

#[test]
#[serial]
fn int_div_floors_toward_negative_infinity() {
    let Some(mut backend) = backend() else { return };
    let a = backend
        .make_tensor_info(
            vec![4],
            DataType::Int32,
            Some(BackendValues::Int32(vec![-7, 7, -8, 9])),
        )
        .expect("a");
    let b = backend
        .make_tensor_info(
            vec![4],
            DataType::Int32,
            Some(BackendValues::Int32(vec![2, 2, 3, -2])),
        )
        .expect("b");
    let program = BinaryOpProgram::build(
        BinaryOp::IntDiv,
        &a.shape,
        &b.shape,
        backend.shading_target(),
        Vectorization::Scalar,
        backend.config().workgroup_size,
    )
    .expect("program");
    let out = backend
        .run_program(&program, &[a, b], DataType::Int32, &[])
        .expect("run");
    let values = backend.read_sync(out.data_id).expect("read");
    assert_eq!(values, BackendValues::Int32(vec![-4, 3, -3, -5]));
}

#[test]
#[serial]
fn comparisons_produce_bools() {
    let Some(mut backend) = backend() else { return };
    let a = floats(&mut backend, vec![3], vec![1.0, 5.0, 2.0]);
    let b = floats(&mut backend, vec![], vec![2.0]);
    let program = BinaryOpProgram::build(
        BinaryOp::Less,
        &a.shape,
        &b.shape,
        backend.shading_target(),
        Vectorization::Scalar,
        backend.config().workgroup_size,
    )
    .expect("program");
    let out = backend
        .run_program(&program, &[a, b], DataType::Bool, &[])
        .expect("run");
    let values = backend.read_sync(out.data_id).expect("read");
    assert_eq!(values, BackendValues::Bool(vec![true, false, false]));
}

#[test]
#[serial]
fn fill_writes_the_uniform_value() {
    let Some(mut backend) = backend() else { return };
    let program = FillProgram::build(
        vec![3, 5],
        backend.shading_target(),
        backend.config().workgroup_size,
    );
    let out = backend
        .run_program(&program, &[], DataType::Float32, &FillProgram::uniforms(2.5))
        .expect("run");
    let values = backend.read_sync(out.data_id).expect("read");
    assert_eq!(values, BackendValues::Float32(vec![2.5; 15]));

    let err = backend
        .run_program(&program, &[], DataType::Float32, &[])
        .unwrap_err();
    assert!(matches!(kernel_error(&err), KernelError::UniformMismatch(_)));
}

#[test]
#[serial]
fn vec4_relu_matches_scalar() {
    let Some(mut backend) = backend() else { return };
    let input: Vec<f32> = (0..16).map(|v| v as f32 - 8.0).collect();
    let x = floats(&mut backend, vec![4, 4], input.clone());
    let program = UnaryOpProgram::build(
        UnaryOp::Relu,
        vec![4, 4],
        backend.shading_target(),
        Vectorization::Vec4,
        backend.config().workgroup_size,
    )
    .expect("program");
    let out = backend
        .run_program(&program, &[x], DataType::Float32, &[])
        .expect("run");
    let values = backend.read_sync(out.data_id).expect("read");
    let expected: Vec<f32> = input.iter().map(|v| v.max(0.0)).collect();
    assert_eq!(values, BackendValues::Float32(expected));
}

#[test]
#[serial]
fn folded_dispatch_still_covers_every_element() {
    let config = BackendConfig {
        max_dispatch_per_dimension: 16,
        ..BackendConfig::default()
    };
    let Some(mut backend) = backend_with(config) else { return };
    // 20 workgroups of 64 exceed the limit of 16 and fold to a 5x5 grid.
    let len = 64 * 20 - 3;
    let x = floats(&mut backend, vec![len], (0..len).map(|v| v as f32).collect());
    let program = UnaryOpProgram::build(
        UnaryOp::Neg,
        vec![len],
        backend.shading_target(),
        Vectorization::Scalar,
        backend.config().workgroup_size,
    )
    .expect("program");
    assert_eq!(program.dispatch(16).expect("dispatch"), [5, 5, 1]);
    let out = backend
        .run_program(&program, &[x], DataType::Float32, &[])
        .expect("run");
    let values = backend.read_sync(out.data_id).expect("read");
    let expected: Vec<f32> = (0..len).map(|v| -(v as f32)).collect();
    assert_eq!(values, BackendValues::Float32(expected));
}

#[test]
#[serial]
fn sixteen_dispatches_with_batch_fifteen_submit_once() {
    let config = BackendConfig {
        deferred_submit_batch_size: 15,
        ..BackendConfig::default()
    };
    let Some(mut backend) = backend_with(config) else { return };
    let mut current = floats(&mut backend, vec![4], vec![1.0, 2.0, 3.0, 4.0]);
    let program = UnaryOpProgram::build(
        UnaryOp::Neg,
        vec![4],
        backend.shading_target(),
        Vectorization::Scalar,
        backend.config().workgroup_size,
    )
    .expect("program");
    assert_eq!(backend.encoder_state(), EncoderState::Idle);
    for pass in 1..=16 {
        current = backend
            .run_program(&program, &[current], DataType::Float32, &[])
            .expect("run");
        match pass {
            1..=14 => {
                assert_eq!(backend.encoder_state(), EncoderState::EncoderOpen);
                assert_eq!(backend.submission_count(), 0);
            }
            15 => {
                assert_eq!(backend.submission_count(), 1);
                assert_eq!(backend.encoder_state(), EncoderState::Idle);
            }
            _ => {
                assert_eq!(backend.submission_count(), 1);
                assert_eq!(backend.passes_in_encoder(), 1);
            }
        }
    }
    let values = backend.read_sync(current.data_id).expect("read");
    assert_eq!(values, BackendValues::Float32(vec![1.0, 2.0, 3.0, 4.0]));
    assert_eq!(backend.submission_count(), 2);
    assert_eq!(backend.metrics().dispatches, 16);
    assert_eq!(backend.memory_info().num_pipelines, 1);
}

#[test]
#[serial]
fn pipelines_are_shared_across_extents() {
    let Some(mut backend) = backend() else { return };
    let a = floats(&mut backend, vec![1, 4], vec![0.0; 4]);
    let b = floats(&mut backend, vec![3, 4], vec![0.0; 12]);
    add(&mut backend, a, b);
    let c = floats(&mut backend, vec![1, 9], vec![0.0; 9]);
    let d = floats(&mut backend, vec![7, 9], vec![0.0; 63]);
    add(&mut backend, c, d);
    backend.submit_queue().expect("submit");
    assert_eq!(backend.memory_info().num_pipelines, 1);
    let metrics = backend.metrics();
    assert_eq!((metrics.pipeline_hits, metrics.pipeline_misses), (1, 1));
}

#[test]
#[serial]
fn empty_outputs_skip_the_device() {
    let Some(mut backend) = backend() else { return };
    let a = floats(&mut backend, vec![0, 4], Vec::new());
    let b = floats(&mut backend, vec![1, 4], vec![1.0; 4]);
    let out = add(&mut backend, a, b);
    assert_eq!(out.shape, vec![0, 4]);
    assert_eq!(backend.metrics().dispatches, 0);
    assert_eq!(backend.encoder_state(), EncoderState::Idle);
    let values = backend.read_sync(out.data_id).expect("read");
    assert!(values.is_empty());
}

#[test]
#[serial]
fn complex_reads_interleave_parts() {
    let Some(mut backend) = backend() else { return };
    let id = backend
        .write(BackendValues::Complex64(vec![1.0, -1.0, 2.0, -2.0]), vec![2])
        .expect("write");
    assert_eq!(
        backend.read_sync(id).expect("read"),
        BackendValues::Complex64(vec![1.0, -1.0, 2.0, -2.0])
    );
    // 1 parent + 2 children
    assert_eq!(backend.num_data_ids(), 3);
    assert!(backend.dispose_data(id, false).expect("dispose"));
    assert_eq!(backend.num_data_ids(), 0);

    // Parts computed on the device.
    let re = floats(&mut backend, vec![2], vec![1.0, 2.0]);
    let one = floats(&mut backend, vec![], vec![1.0]);
    let shifted = add(&mut backend, re.clone(), one);
    let im = floats(&mut backend, vec![2], vec![5.0, 6.0]);
    let complex = backend.complex(&shifted, &im).expect("complex");
    assert_eq!(backend.ref_count(shifted.data_id), 2);
    assert_eq!(
        backend.read_sync(complex.data_id).expect("read"),
        BackendValues::Complex64(vec![2.0, 5.0, 3.0, 6.0])
    );
    assert!(backend.dispose_data(complex.data_id, false).expect("dispose"));
    assert_eq!(backend.ref_count(shifted.data_id), 1);
}

#[test]
#[serial]
fn disposal_waits_for_the_open_encoder() {
    let Some(mut backend) = backend() else { return };
    let a = floats(&mut backend, vec![4], vec![1.0; 4]);
    let b = floats(&mut backend, vec![4], vec![2.0; 4]);
    let out = add(&mut backend, a.clone(), b);
    assert_eq!(backend.encoder_state(), EncoderState::EncoderOpen);

    assert!(!backend.dispose_data(a.data_id, false).expect("dispose"));
    assert_eq!(backend.ref_count(a.data_id), 0);
    let in_use = backend.memory_info().num_used_buffers;

    backend.submit_queue().expect("submit");
    assert_eq!(backend.ref_count(a.data_id), 0);
    let err = backend.read_sync(a.data_id).unwrap_err();
    assert!(matches!(kernel_error(&err), KernelError::UnknownTensor(id) if *id == a.data_id));
    // input A and the uniform buffer went back to the pool
    assert_eq!(backend.memory_info().num_used_buffers, in_use - 2);

    assert_eq!(
        backend.read_sync(out.data_id).expect("read"),
        BackendValues::Float32(vec![3.0; 4])
    );
}

#[test]
#[serial]
fn uninitialized_and_disposed_backends_fail_loudly() {
    let Some(mut backend) = backend() else { return };
    let empty = backend
        .make_tensor_info(vec![2], DataType::Float32, None)
        .expect("info");
    let err = backend.read_sync(empty.data_id).unwrap_err();
    assert!(matches!(kernel_error(&err), KernelError::UninitializedTensor(_)));

    let x = floats(&mut backend, vec![2], vec![1.0, 2.0]);
    let program = UnaryOpProgram::build(
        UnaryOp::Exp,
        vec![2],
        backend.shading_target(),
        Vectorization::Scalar,
        backend.config().workgroup_size,
    )
    .expect("program");
    backend
        .run_program(&program, &[x.clone()], DataType::Float32, &[])
        .expect("run");
    backend.dispose();
    assert!(backend.is_disposed());
    assert_eq!(backend.memory_info().num_bytes_allocated, 0);
    let err = backend
        .run_program(&program, &[x], DataType::Float32, &[])
        .unwrap_err();
    assert!(matches!(kernel_error(&err), KernelError::BackendDisposed));
}

#[test]
#[serial]
fn cpu_forwarding_only_for_small_host_tensors() {
    let Some(mut backend) = backend() else { return };
    let small = floats(&mut backend, vec![4], vec![1.0; 4]);
    let large = floats(&mut backend, vec![256], vec![1.0; 256]);
    assert!(backend.should_execute_on_cpu(&[small.clone()]));
    assert!(!backend.should_execute_on_cpu(&[small.clone(), large]));

    let out = add(&mut backend, small.clone(), small.clone());
    assert!(!backend.should_execute_on_cpu(&[out]));
    assert!(!backend.should_execute_on_cpu(&[small]));
}

#[test]
#[serial]
fn odd_interleaved_complex_data_is_rejected() {
    let Some(mut backend) = backend() else { return };
    let err = backend
        .write(BackendValues::Complex64(vec![1.0, 2.0, 3.0]), vec![1])
        .unwrap_err();
    assert!(matches!(kernel_error(&err), KernelError::UnsupportedLayout(_)));
    let err = backend
        .write(BackendValues::Complex64(vec![1.0, 2.0, 3.0, 4.0]), vec![3])
        .unwrap_err();
    assert!(matches!(kernel_error(&err), KernelError::UnsupportedLayout(_)));
    assert_eq!(backend.num_data_ids(), 0);
}

#[test]
#[serial]
fn forced_complex_disposal_only_drops_the_parents_references() {
    let Some(mut backend) = backend() else { return };
    let re = floats(&mut backend, vec![2], vec![1.0, 2.0]);
    let zero = floats(&mut backend, vec![2], vec![0.0, 0.0]);
    // `real` stays owned by the open encoder while the complex parent goes away.
    let real = add(&mut backend, re, zero);
    let imag = floats(&mut backend, vec![2], vec![3.0, 4.0]);
    let complex = backend.complex(&real, &imag).expect("complex");
    assert_eq!(backend.encoder_state(), EncoderState::EncoderOpen);

    assert!(backend.dispose_data(complex.data_id, true).expect("dispose"));
    assert_eq!(backend.ref_count(real.data_id), 1);
    assert_eq!(backend.ref_count(imag.data_id), 1);
    assert_eq!(
        backend.read_sync(real.data_id).expect("read"),
        BackendValues::Float32(vec![1.0, 2.0])
    );
}

#[test]
#[serial]
fn oversized_outputs_leave_the_pool_balanced() {
    let Some(mut backend) = backend() else { return };
    let limit = backend.device().limits().max_buffer_size;
    let Ok(elements) = usize::try_from(limit / 4 + 1) else { return };
    let program = FillProgram::build(
        vec![elements],
        backend.shading_target(),
        backend.config().workgroup_size,
    );
    if program.dispatch(backend.max_dispatch_per_dimension()).is_err() {
        log::warn!("skipping: {elements} elements cannot be dispatched on this adapter");
        return;
    }
    let before = backend.memory_info();
    let err = backend
        .run_program(&program, &[], DataType::Float32, &FillProgram::uniforms(1.0))
        .unwrap_err();
    assert!(matches!(kernel_error(&err), KernelError::BufferTooLarge { .. }));

    let after = backend.memory_info();
    assert_eq!(after.num_used_buffers, before.num_used_buffers);
    assert_eq!(after.num_bytes_in_gpu, before.num_bytes_in_gpu);
    // the uniform buffer taken first went back to the pool
    assert_eq!(after.num_free_buffers, before.num_free_buffers + 1);
    assert_eq!(backend.encoder_state(), EncoderState::Idle);
    assert_eq!(backend.num_data_ids(), 0);
}
