use crate::error::{KernelError, KernelResult};
use futures::channel::oneshot;

/// Map the first `size_bytes` of `staging` for reading and copy them out.
///
/// `staging` must carry `MAP_READ` and the copy into it must already be submitted.
/// The buffer is unmapped again before returning so it can go back to the pool.
pub async fn map_readback_bytes(
    device: &wgpu::Device,
    staging: &wgpu::Buffer,
    size_bytes: u64,
    context: &str,
) -> KernelResult<Vec<u8>> {
    let size_usize = usize::try_from(size_bytes)
        .map_err(|_| KernelError::Readback(format!("{context}: readback size overflow")))?;
    let slice = staging.slice(..size_bytes);
    let (tx, rx) = oneshot::channel();
    slice.map_async(wgpu::MapMode::Read, move |res| {
        log::trace!("readback map_async callback status={res:?}");
        let _ = tx.send(res);
    });
    #[cfg(not(target_arch = "wasm32"))]
    {
        device.poll(wgpu::Maintain::Wait);
    }
    #[cfg(target_arch = "wasm32")]
    let _ = device;
    let map_result = rx
        .await
        .map_err(|_| KernelError::Readback(format!("{context}: map_async callback dropped")))?;
    map_result.map_err(|e| KernelError::Readback(format!("{context}: {e}")))?;
    let data = slice.get_mapped_range();
    let mut out = vec![0u8; size_usize];
    out.copy_from_slice(&data[..size_usize]);
    drop(data);
    staging.unmap();
    Ok(out)
}
