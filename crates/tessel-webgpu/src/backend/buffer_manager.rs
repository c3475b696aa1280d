use crate::error::{KernelError, KernelResult};
use std::collections::HashMap;
use std::sync::Arc;

/// Storage and staging buffers are rounded up to whole 32-bit words.
pub const STORAGE_ALIGNMENT: u64 = 4;

/// Creates and destroys the objects a [`BufferManager`] pools.
pub trait BufferAllocator {
    type Buffer;

    fn allocate(&self, size: u64, usage: wgpu::BufferUsages) -> KernelResult<Self::Buffer>;

    fn destroy(&self, buffer: &Self::Buffer);
}

pub struct DeviceAllocator {
    device: Arc<wgpu::Device>,
    max_buffer_size: u64,
}

impl DeviceAllocator {
    pub fn new(device: Arc<wgpu::Device>) -> Self {
        let max_buffer_size = device.limits().max_buffer_size;
        Self {
            device,
            max_buffer_size,
        }
    }
}

impl BufferAllocator for DeviceAllocator {
    type Buffer = wgpu::Buffer;

    fn allocate(&self, size: u64, usage: wgpu::BufferUsages) -> KernelResult<wgpu::Buffer> {
        if size > self.max_buffer_size {
            return Err(KernelError::BufferTooLarge {
                size,
                limit: self.max_buffer_size,
            });
        }
        Ok(self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("tessel-pooled-buffer"),
            size,
            usage,
            mapped_at_creation: false,
        }))
    }

    fn destroy(&self, buffer: &wgpu::Buffer) {
        buffer.destroy();
    }
}

/// A pooled buffer together with the key it was acquired under.
pub struct BufferAllocation<B> {
    pub buffer: Arc<B>,
    pub size: u64,
    pub usage: wgpu::BufferUsages,
}

impl<B> Clone for BufferAllocation<B> {
    fn clone(&self) -> Self {
        Self {
            buffer: Arc::clone(&self.buffer),
            size: self.size,
            usage: self.usage,
        }
    }
}

impl<B> std::fmt::Debug for BufferAllocation<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferAllocation")
            .field("ptr", &Arc::as_ptr(&self.buffer))
            .field("size", &self.size)
            .field("usage", &self.usage)
            .finish()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
struct PoolKey {
    size: u64,
    usage: wgpu::BufferUsages,
}

struct PoolEntry<B> {
    free: Vec<Arc<B>>,
    in_use: Vec<Arc<B>>,
}

impl<B> Default for PoolEntry<B> {
    fn default() -> Self {
        Self {
            free: Vec::new(),
            in_use: Vec::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub num_bytes_used: u64,
    pub num_bytes_allocated: u64,
    pub num_used_buffers: usize,
    pub num_free_buffers: usize,
}

/// Pool of device buffers keyed by exact `(size, usage)`.
///
/// Released buffers go back to their free list and are only destroyed by
/// [`BufferManager::dispose`], so steady-state workloads stop allocating.
pub struct BufferManager<A: BufferAllocator> {
    allocator: A,
    pools: HashMap<PoolKey, PoolEntry<A::Buffer>>,
    stats: PoolStats,
    disposed: bool,
}

impl<A: BufferAllocator> BufferManager<A> {
    pub fn new(allocator: A) -> Self {
        Self {
            allocator,
            pools: HashMap::new(),
            stats: PoolStats::default(),
            disposed: false,
        }
    }

    pub fn acquire(
        &mut self,
        size: u64,
        usage: wgpu::BufferUsages,
    ) -> KernelResult<BufferAllocation<A::Buffer>> {
        if self.disposed {
            return Err(KernelError::BackendDisposed);
        }
        let key = PoolKey { size, usage };
        let entry = self.pools.entry(key).or_default();
        let buffer = match entry.free.pop() {
            Some(buffer) => {
                self.stats.num_free_buffers -= 1;
                log::trace!(
                    "buffer_manager: reuse size={} usage={:?} ptr={:p}",
                    size,
                    usage,
                    Arc::as_ptr(&buffer)
                );
                buffer
            }
            None => {
                let buffer = Arc::new(self.allocator.allocate(size, usage)?);
                self.stats.num_bytes_allocated += size;
                log::trace!(
                    "buffer_manager: allocate size={} usage={:?} ptr={:p}",
                    size,
                    usage,
                    Arc::as_ptr(&buffer)
                );
                buffer
            }
        };
        entry.in_use.push(Arc::clone(&buffer));
        self.stats.num_used_buffers += 1;
        self.stats.num_bytes_used += size;
        Ok(BufferAllocation { buffer, size, usage })
    }

    /// Return `allocation` to its free list.
    ///
    /// Fails with [`KernelError::UntrackedBuffer`] when the buffer is not currently
    /// in use under its key.
    pub fn release(&mut self, allocation: &BufferAllocation<A::Buffer>) -> KernelResult<()> {
        if self.disposed {
            return Err(KernelError::BackendDisposed);
        }
        let key = PoolKey {
            size: allocation.size,
            usage: allocation.usage,
        };
        let untracked = || KernelError::UntrackedBuffer {
            size: allocation.size,
            usage: allocation.usage,
        };
        let entry = self.pools.get_mut(&key).ok_or_else(untracked)?;
        let position = entry
            .in_use
            .iter()
            .position(|b| Arc::ptr_eq(b, &allocation.buffer))
            .ok_or_else(untracked)?;
        let buffer = entry.in_use.swap_remove(position);
        entry.free.push(buffer);
        self.stats.num_used_buffers -= 1;
        self.stats.num_free_buffers += 1;
        self.stats.num_bytes_used -= allocation.size;
        log::trace!(
            "buffer_manager: release size={} usage={:?} ptr={:p}",
            allocation.size,
            allocation.usage,
            Arc::as_ptr(&allocation.buffer)
        );
        Ok(())
    }

    /// Acquire one buffer per `(size, usage)` request, all or nothing. If a request
    /// fails, the buffers already taken go back to their free lists.
    pub fn acquire_all<const N: usize>(
        &mut self,
        requests: [(u64, wgpu::BufferUsages); N],
    ) -> KernelResult<[BufferAllocation<A::Buffer>; N]> {
        let mut acquired = Vec::with_capacity(N);
        for (size, usage) in requests {
            match self.acquire(size, usage) {
                Ok(allocation) => acquired.push(allocation),
                Err(err) => {
                    for allocation in &acquired {
                        self.release(allocation)?;
                    }
                    return Err(err);
                }
            }
        }
        Ok(std::array::from_fn(|i| acquired[i].clone()))
    }

    /// Destroy every pooled buffer. The manager refuses all later requests.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        let mut destroyed = 0usize;
        for (_, entry) in self.pools.drain() {
            for buffer in entry.free.iter().chain(entry.in_use.iter()) {
                self.allocator.destroy(buffer);
                destroyed += 1;
            }
        }
        log::debug!(
            "buffer_manager: disposed {} buffers ({} bytes allocated)",
            destroyed,
            self.stats.num_bytes_allocated
        );
        self.stats = PoolStats::default();
        self.disposed = true;
    }

    pub fn stats(&self) -> PoolStats {
        self.stats
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }
}

pub fn storage_buffer_size(byte_len: u64) -> u64 {
    byte_len.max(STORAGE_ALIGNMENT).next_multiple_of(STORAGE_ALIGNMENT)
}
