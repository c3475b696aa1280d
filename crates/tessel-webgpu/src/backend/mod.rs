pub mod bindings;
pub mod buffer_manager;
pub mod metrics;
pub mod pipelines;
pub mod readback;
pub mod scheduler;
pub mod tensor_data;

use std::sync::Arc;

use anyhow::Result;
use log::{debug, error, info, trace, warn};
use tracing::{info_span, Instrument};

use crate::codegen::{generate_shader, OUTPUT_NAME};
use crate::config::BackendConfig;
use crate::error::KernelError;
use crate::layout::size_from_shape;
use crate::program::{OperandInfo, Program};
use crate::types::{DataType, ShadingTarget};
use crate::uniforms::{pack_uniforms, program_uniform_fields, uniform_buffer_size, UniformData};

pub use buffer_manager::{
    storage_buffer_size, BufferAllocation, BufferAllocator, BufferManager, DeviceAllocator,
    PoolStats,
};
pub use metrics::{BackendMetrics, MetricsSnapshot};
pub use pipelines::{
    compile_pipeline, LayoutCache, OperandSignature, PipelineCache, PipelineKey, ProgramLayout,
};
pub use scheduler::{EncoderState, SubmitScheduler};
pub use tensor_data::{BackendValues, DataId, TensorInfo, TensorRecord, TensorStore};

type GpuAllocation = BufferAllocation<wgpu::Buffer>;

const STORAGE_USAGE: wgpu::BufferUsages = wgpu::BufferUsages::STORAGE
    .union(wgpu::BufferUsages::COPY_SRC)
    .union(wgpu::BufferUsages::COPY_DST);
const UNIFORM_USAGE: wgpu::BufferUsages =
    wgpu::BufferUsages::UNIFORM.union(wgpu::BufferUsages::COPY_DST);
const STAGING_USAGE: wgpu::BufferUsages =
    wgpu::BufferUsages::MAP_READ.union(wgpu::BufferUsages::COPY_DST);

/// Pools and caches owned by a single backend instance.
pub struct KernelRuntime {
    pub buffers: BufferManager<DeviceAllocator>,
    pub pipelines: PipelineCache<wgpu::ComputePipeline>,
    pub layouts: LayoutCache<ProgramLayout>,
}

impl KernelRuntime {
    pub fn new(device: Arc<wgpu::Device>) -> Self {
        Self {
            buffers: BufferManager::new(DeviceAllocator::new(device)),
            pipelines: PipelineCache::new(),
            layouts: LayoutCache::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryInfo {
    pub num_bytes_in_gpu: u64,
    pub num_bytes_allocated: u64,
    pub num_used_buffers: usize,
    pub num_free_buffers: usize,
    pub num_pipelines: usize,
}

/// Records compute programs into batched command encoders and moves tensor data
/// between host and device.
///
/// Single-threaded by construction: every method takes `&mut self`, and the only
/// suspension points are device negotiation in [`WebGpuBackend::new`] and the
/// map operation inside [`WebGpuBackend::read`].
pub struct WebGpuBackend {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    config: BackendConfig,
    max_dispatch: u32,
    runtime: KernelRuntime,
    tensors: TensorStore<wgpu::Buffer>,
    scheduler: SubmitScheduler<GpuAllocation>,
    encoder: Option<wgpu::CommandEncoder>,
    metrics: BackendMetrics,
    disposed: bool,
}

impl WebGpuBackend {
    /// Negotiate an adapter and device honouring `config`'s power preference.
    pub async fn new(config: BackendConfig) -> Result<Self> {
        let config = config.normalized();
        let mut instance_desc = wgpu::InstanceDescriptor::default();
        #[cfg(target_arch = "wasm32")]
        {
            instance_desc.backends = wgpu::Backends::BROWSER_WEBGPU;
        }
        #[cfg(not(target_arch = "wasm32"))]
        {
            if let Some(backends) = wgpu::util::backend_bits_from_env() {
                instance_desc.backends = backends;
            }
        }
        let instance = wgpu::Instance::new(instance_desc);
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: config.power_preference.into(),
                force_fallback_adapter: config.force_fallback_adapter,
                compatible_surface: None,
            })
            .await
            .ok_or(KernelError::AdapterUnavailable)?;
        let adapter_info = adapter.get_info();
        info!(
            "tessel-webgpu: adapter '{}' backend={:?} type={:?}",
            adapter_info.name, adapter_info.backend, adapter_info.device_type
        );
        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("tessel-webgpu device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: adapter.limits(),
                },
                None,
            )
            .await
            .map_err(|err| KernelError::DeviceRequest(err.to_string()))?;
        let device = Arc::new(device);
        install_device_error_handlers(&device);
        Ok(Self::from_device(device, Arc::new(queue), config))
    }

    #[cfg(not(target_arch = "wasm32"))]
    pub fn new_blocking(config: BackendConfig) -> Result<Self> {
        pollster::block_on(Self::new(config))
    }

    /// Wrap an existing device. The dispatch limit is clamped to the device's.
    pub fn from_device(
        device: Arc<wgpu::Device>,
        queue: Arc<wgpu::Queue>,
        config: BackendConfig,
    ) -> Self {
        let config = config.normalized();
        let device_limit = device.limits().max_compute_workgroups_per_dimension;
        let max_dispatch = config.max_dispatch_per_dimension.min(device_limit).max(1);
        debug!(
            "tessel-webgpu: batch={} max_dispatch={} target={}",
            config.deferred_submit_batch_size, max_dispatch, config.shading_language
        );
        Self {
            runtime: KernelRuntime::new(Arc::clone(&device)),
            scheduler: SubmitScheduler::new(config.deferred_submit_batch_size),
            device,
            queue,
            config,
            max_dispatch,
            tensors: TensorStore::new(),
            encoder: None,
            metrics: BackendMetrics::new(),
            disposed: false,
        }
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn device(&self) -> &Arc<wgpu::Device> {
        &self.device
    }

    pub fn queue(&self) -> &Arc<wgpu::Queue> {
        &self.queue
    }

    /// Shading language reference programs should be built for.
    pub fn shading_target(&self) -> ShadingTarget {
        self.config.shading_language
    }

    pub fn max_dispatch_per_dimension(&self) -> u32 {
        self.max_dispatch
    }

    fn ensure_live(&self) -> Result<(), KernelError> {
        if self.disposed {
            Err(KernelError::BackendDisposed)
        } else {
            Ok(())
        }
    }

    /// Store host values; nothing touches the device until a program reads them.
    pub fn write(&mut self, values: BackendValues, shape: Vec<usize>) -> Result<DataId> {
        self.ensure_live()?;
        values.check_shape(&shape)?;
        if let BackendValues::Complex64(interleaved) = &values {
            let (re, im) = BackendValues::split_complex(interleaved)?;
            let real = self.tensors.insert(TensorRecord::new(
                DataType::Float32,
                shape.clone(),
                Some(BackendValues::Float32(re)),
            ));
            let imag = self.tensors.insert(TensorRecord::new(
                DataType::Float32,
                shape.clone(),
                Some(BackendValues::Float32(im)),
            ));
            let mut record = TensorRecord::new(DataType::Complex64, shape, None);
            record.complex_parts = Some((real, imag));
            return Ok(self.tensors.insert(record));
        }
        let dtype = values.dtype();
        Ok(self
            .tensors
            .insert(TensorRecord::new(dtype, shape, Some(values))))
    }

    pub fn make_tensor_info(
        &mut self,
        shape: Vec<usize>,
        dtype: DataType,
        values: Option<BackendValues>,
    ) -> Result<TensorInfo> {
        self.ensure_live()?;
        let data_id = match values {
            Some(values) => {
                if values.dtype() != dtype {
                    return Err(KernelError::UnsupportedDtype {
                        dtype: values.dtype(),
                        context: "make_tensor_info with mismatched values",
                    }
                    .into());
                }
                self.write(values, shape.clone())?
            }
            None => self
                .tensors
                .insert(TensorRecord::new(dtype, shape.clone(), None)),
        };
        Ok(TensorInfo {
            data_id,
            shape,
            dtype,
        })
    }

    /// Pair two float32 tensors of equal shape into a complex tensor that
    /// references them.
    pub fn complex(&mut self, real: &TensorInfo, imag: &TensorInfo) -> Result<TensorInfo> {
        self.ensure_live()?;
        for part in [real, imag] {
            let record = self.tensors.get(part.data_id)?;
            if record.dtype != DataType::Float32 {
                return Err(KernelError::UnsupportedDtype {
                    dtype: record.dtype,
                    context: "complex parts",
                }
                .into());
            }
        }
        if real.shape != imag.shape {
            return Err(KernelError::UnsupportedLayout(format!(
                "complex parts disagree on shape: {:?} vs {:?}",
                real.shape, imag.shape
            ))
            .into());
        }
        self.tensors.inc_ref(real.data_id)?;
        self.tensors.inc_ref(imag.data_id)?;
        let mut record = TensorRecord::new(DataType::Complex64, real.shape.clone(), None);
        record.complex_parts = Some((real.data_id, imag.data_id));
        let data_id = self.tensors.insert(record);
        Ok(TensorInfo {
            data_id,
            shape: real.shape.clone(),
            dtype: DataType::Complex64,
        })
    }

    pub fn inc_ref(&mut self, id: DataId) -> Result<usize> {
        self.ensure_live()?;
        Ok(self.tensors.inc_ref(id)?)
    }

    /// Current reference count; 0 for ids that are unknown or already disposed.
    pub fn ref_count(&self, id: DataId) -> usize {
        self.tensors.get(id).map(|r| r.ref_count).unwrap_or(0)
    }

    pub fn num_data_ids(&self) -> usize {
        self.tensors.len()
    }

    /// Drop one reference to `id`. Returns `true` once the record is gone.
    ///
    /// A record still referenced by the unsubmitted encoder is parked on the
    /// pending-disposal queue and finalized at the next submission. `force`
    /// ignores outstanding references.
    pub fn dispose_data(&mut self, id: DataId, force: bool) -> Result<bool> {
        self.ensure_live()?;
        if !self.tensors.contains(id) || self.scheduler.is_pending_disposal(id) {
            return Ok(!self.tensors.contains(id));
        }
        let remaining = self.tensors.dec_ref(id)?;
        if remaining > 0 && !force {
            return Ok(false);
        }
        if self.scheduler.is_queue_owned(id) {
            trace!("dispose_data: deferring {id} until submission");
            self.scheduler.defer_disposal(id);
            return Ok(false);
        }
        self.finalize_disposal(id)?;
        Ok(true)
    }

    /// Release `id`'s buffer. Complex children each drop the one reference the parent
    /// held and follow the normal rules, so a child still used elsewhere or owned by
    /// the open encoder survives.
    fn finalize_disposal(&mut self, id: DataId) -> Result<()> {
        let Some(record) = self.tensors.remove(id) else {
            return Ok(());
        };
        if let Some(resource) = record.resource {
            self.runtime.buffers.release(&resource)?;
        }
        if let Some((real, imag)) = record.complex_parts {
            self.dispose_data(real, false)?;
            self.dispose_data(imag, false)?;
        }
        trace!("dispose_data: released {id}");
        Ok(())
    }

    /// Whether an op over `inputs` is cheaper on the host: CPU forwarding is on and
    /// every input is host-resident and below the hand-off threshold.
    pub fn should_execute_on_cpu(&self, inputs: &[TensorInfo]) -> bool {
        self.config.cpu_forward
            && inputs.iter().all(|input| {
                self.tensors
                    .get(input.data_id)
                    .map(|record| {
                        record.resource.is_none()
                            && size_from_shape(&input.shape)
                                < self.config.cpu_handoff_size_threshold
                    })
                    .unwrap_or(false)
            })
    }

    /// Record one dispatch of `program` over `inputs`.
    ///
    /// The returned tensor's contents are only guaranteed after a read completes.
    pub fn run_program(
        &mut self,
        program: &Program,
        inputs: &[TensorInfo],
        output_dtype: DataType,
        extra_uniforms: &[UniformData],
    ) -> Result<TensorInfo> {
        self.ensure_live()?;
        let output_shape = program.output_shape().to_vec();
        let mut operands = Vec::with_capacity(inputs.len());
        for (input, name) in inputs.iter().zip(program.variable_names()) {
            let record = self.tensors.get(input.data_id)?;
            operands.push(OperandInfo::new(
                name.clone(),
                record.dtype,
                record.shape.clone(),
            ));
        }
        if operands.len() != inputs.len() {
            return Err(KernelError::UnsupportedLayout(format!(
                "program '{}' names {} operands but {} were supplied",
                program.shader_key(),
                program.variable_names().len(),
                inputs.len()
            ))
            .into());
        }
        let output = OperandInfo::new(OUTPUT_NAME, output_dtype, output_shape.clone());
        program.validate(&operands, &output)?;

        let size = output.size();
        if size == 0 {
            trace!("run_program: '{}' has an empty output", program.shader_key());
            let values = empty_values(output_dtype);
            return self.make_tensor_info(output_shape, output_dtype, Some(values));
        }

        let dispatch = program.dispatch(self.max_dispatch)?;
        let fields =
            program_uniform_fields(program, &operands, &output_shape, dispatch, extra_uniforms)?;
        let uniform_bytes = pack_uniforms(&fields)?;

        let key = PipelineKey::new(program, &operands, &output);
        let operand_count = operands.len();
        let device = &self.device;
        let layout = self
            .runtime
            .layouts
            .get_or_create(operand_count, || ProgramLayout::new(device, operand_count));
        let mut compiled = false;
        let pipeline = self.runtime.pipelines.get_or_compile(&key, || {
            compiled = true;
            let shader = generate_shader(program, &operands, &output)?;
            compile_pipeline(device, &layout, &shader, &key.to_string())
        })?;
        if compiled {
            self.metrics.inc_miss();
        } else {
            self.metrics.inc_hit();
        }

        let mut input_buffers = Vec::with_capacity(inputs.len());
        for input in inputs {
            input_buffers.push(self.upload_to_gpu(input.data_id)?);
        }

        // Infallible from here until the pass is recorded.
        let byte_len = (size * output_dtype.bytes_per_element()) as u64;
        let [uniform_alloc, output_alloc] = self.runtime.buffers.acquire_all([
            (uniform_buffer_size(uniform_bytes.len()), UNIFORM_USAGE),
            (storage_buffer_size(byte_len), STORAGE_USAGE),
        ])?;
        self.queue
            .write_buffer(&uniform_alloc.buffer, 0, &uniform_bytes);

        let mut entries = Vec::with_capacity(operand_count + 2);
        entries.push(wgpu::BindGroupEntry {
            binding: 0,
            resource: output_alloc.buffer.as_entire_binding(),
        });
        for (i, alloc) in input_buffers.iter().enumerate() {
            entries.push(wgpu::BindGroupEntry {
                binding: i as u32 + 1,
                resource: alloc.buffer.as_entire_binding(),
            });
        }
        entries.push(wgpu::BindGroupEntry {
            binding: operand_count as u32 + 1,
            resource: uniform_alloc.buffer.as_entire_binding(),
        });
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("tessel-program-bind-group"),
            layout: &layout.bind_group_layout,
            entries: &entries,
        });

        let mut record = TensorRecord::new(output_dtype, output_shape.clone(), None);
        record.resource = Some(output_alloc);
        let output_id = self.tensors.insert(record);

        if self.scheduler.begin_dispatch() {
            trace!("run_program: opening encoder");
        }
        let device = &self.device;
        let encoder = self.encoder.get_or_insert_with(|| {
            device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("tessel-batch-encoder"),
            })
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(program.shader_key()),
                timestamp_writes: None,
            });
            pass.set_pipeline(&pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(dispatch[0], dispatch[1], dispatch[2]);
        }
        self.metrics.inc_dispatch();
        trace!(
            "run_program: '{}' dispatch={:?} -> {}",
            program.shader_key(),
            dispatch,
            output_id
        );

        let mut touched: Vec<DataId> = inputs.iter().map(|i| i.data_id).collect();
        touched.push(output_id);
        if self.scheduler.record_pass(&touched, uniform_alloc) {
            self.submit_queue()?;
        }
        Ok(TensorInfo {
            data_id: output_id,
            shape: output_shape,
            dtype: output_dtype,
        })
    }

    fn upload_to_gpu(&mut self, id: DataId) -> Result<GpuAllocation> {
        let record = self.tensors.get(id)?;
        if let Some(resource) = &record.resource {
            return Ok(resource.clone());
        }
        let values = record
            .values
            .as_ref()
            .ok_or(KernelError::UninitializedTensor(id))?;
        let bytes = values.to_device_bytes()?;
        let alloc = self
            .runtime
            .buffers
            .acquire(storage_buffer_size(bytes.len() as u64), STORAGE_USAGE)?;
        if !bytes.is_empty() {
            self.queue.write_buffer(&alloc.buffer, 0, &bytes);
        }
        self.metrics.add_upload_bytes(bytes.len() as u64);
        trace!("upload: {id} {} bytes", bytes.len());
        self.tensors.get_mut(id)?.resource = Some(alloc.clone());
        Ok(alloc)
    }

    /// Submit the open encoder, if any, then release everything deferred to it.
    pub fn submit_queue(&mut self) -> Result<()> {
        self.ensure_live()?;
        let Some(encoder) = self.encoder.take() else {
            return Ok(());
        };
        let submission = self.scheduler.submission_count() + 1;
        let _span = info_span!("gpu.submit", submission = submission).entered();
        let drained = self.scheduler.begin_submit();
        let index = self.queue.submit(Some(encoder.finish()));
        self.metrics.inc_submission();
        trace!("submit {submission}: submitted (index={index:?})");
        for uniform in &drained.uniforms {
            self.runtime.buffers.release(uniform)?;
        }
        for id in drained.disposals {
            self.finalize_disposal(id)?;
        }
        self.scheduler.finish_submit();
        Ok(())
    }

    /// Read a tensor back to the host, submitting pending work first.
    ///
    /// Complex tensors come back as interleaved `re, im` pairs.
    pub async fn read(&mut self, id: DataId) -> Result<BackendValues> {
        self.ensure_live()?;
        let record = self.tensors.get(id)?;
        if let Some((real, imag)) = record.complex_parts {
            let re = self.read_plain(real).await?;
            let im = self.read_plain(imag).await?;
            return Ok(BackendValues::merge_complex(&re, &im)?);
        }
        self.read_plain(id).await
    }

    #[cfg(not(target_arch = "wasm32"))]
    pub fn read_sync(&mut self, id: DataId) -> Result<BackendValues> {
        pollster::block_on(self.read(id))
    }

    async fn read_plain(&mut self, id: DataId) -> Result<BackendValues> {
        let record = self.tensors.get(id)?;
        if let Some(values) = &record.values {
            return Ok(values.clone());
        }
        let dtype = record.dtype;
        let len = record.size();
        let resource = record
            .resource
            .clone()
            .ok_or(KernelError::UninitializedTensor(id))?;
        if self.scheduler.is_queue_owned(id) || self.encoder.is_some() {
            self.submit_queue()?;
        }

        let byte_len = (len * dtype.bytes_per_element()) as u64;
        let span = info_span!("gpu.readback", data_id = id.raw(), bytes = byte_len);
        let staging = self
            .runtime
            .buffers
            .acquire(storage_buffer_size(byte_len), STAGING_USAGE)?;
        span.in_scope(|| {
            let mut encoder = self
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("tessel-readback-encoder"),
                });
            encoder.copy_buffer_to_buffer(&resource.buffer, 0, &staging.buffer, 0, staging.size);
            self.queue.submit(Some(encoder.finish()));
        });
        let mapped = readback::map_readback_bytes(
            &self.device,
            &staging.buffer,
            staging.size,
            "read",
        )
        .instrument(span)
        .await;
        self.runtime.buffers.release(&staging)?;
        let bytes = mapped?;
        self.metrics.add_download_bytes(byte_len);

        let values = BackendValues::from_device_bytes(dtype, &bytes, len)?;
        self.tensors.get_mut(id)?.values = Some(values.clone());
        Ok(values)
    }

    pub fn encoder_state(&self) -> EncoderState {
        self.scheduler.state()
    }

    pub fn submission_count(&self) -> u64 {
        self.scheduler.submission_count()
    }

    pub fn passes_in_encoder(&self) -> usize {
        self.scheduler.passes_in_encoder()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn memory_info(&self) -> MemoryInfo {
        let stats = self.runtime.buffers.stats();
        MemoryInfo {
            num_bytes_in_gpu: stats.num_bytes_used,
            num_bytes_allocated: stats.num_bytes_allocated,
            num_used_buffers: stats.num_used_buffers,
            num_free_buffers: stats.num_free_buffers,
            num_pipelines: self.runtime.pipelines.len(),
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Tear everything down. Unsubmitted work is dropped.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        if self.encoder.take().is_some() {
            warn!(
                "tessel-webgpu: disposing with an open encoder; dropping {} unsubmitted passes",
                self.scheduler.passes_in_encoder()
            );
        }
        self.scheduler.abandon();
        let records = self.tensors.drain_resources().len();
        self.runtime.buffers.dispose();
        self.runtime.pipelines.clear();
        self.runtime.layouts.clear();
        self.disposed = true;
        debug!("tessel-webgpu: disposed ({records} device-resident tensors)");
    }
}

impl Drop for WebGpuBackend {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn empty_values(dtype: DataType) -> BackendValues {
    match dtype {
        DataType::Float32 => BackendValues::Float32(Vec::new()),
        DataType::Int32 => BackendValues::Int32(Vec::new()),
        DataType::Bool => BackendValues::Bool(Vec::new()),
        DataType::Complex64 => BackendValues::Complex64(Vec::new()),
    }
}

#[cfg(not(target_arch = "wasm32"))]
fn install_device_error_handlers(device: &wgpu::Device) {
    device.on_uncaptured_error(Box::new(|error| {
        error!("tessel-webgpu uncaptured error: {error:?}");
    }));
    device.set_device_lost_callback(|reason, message| {
        error!("tessel-webgpu device lost: reason={reason:?}, message={message}");
    });
}

#[cfg(target_arch = "wasm32")]
fn install_device_error_handlers(device: &wgpu::Device) {
    device.on_uncaptured_error(Box::new(|error| {
        error!("tessel-webgpu uncaptured error (wasm): {error:?}");
    }));
}
