// Buffer utilities for vertex, index, uniform and staging buffers
//
// Every buffer owns exactly one memory block. Device-local buffers are
// filled through a temporary host-visible staging buffer and a blocking
// one-shot copy.

use ash::vk;
use bytemuck::Pod;
use std::sync::Arc;

use super::memory::allocate_memory;
use super::DeviceContext;
use crate::error::{RendererError, Result, VkResultExt};

const HOST_MEMORY: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
    vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw() | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
);

/// A buffer and its dedicated memory, released together on drop.
pub struct GpuBuffer {
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    ctx: Arc<DeviceContext>,
}

impl GpuBuffer {
    pub fn new(
        ctx: &Arc<DeviceContext>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory_properties: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let device = &ctx.device;
        let buffer = unsafe { device.create_buffer(&buffer_info, None) }.stage("create buffer")?;

        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
        let memory = match allocate_memory(ctx, requirements, memory_properties) {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        if let Err(e) = unsafe { device.bind_buffer_memory(buffer, memory, 0) } {
            unsafe {
                device.destroy_buffer(buffer, None);
                device.free_memory(memory, None);
            }
            return Err(RendererError::vulkan("bind buffer memory", e));
        }

        Ok(Self {
            buffer,
            memory,
            size,
            ctx: ctx.clone(),
        })
    }

    /// Host-visible, host-coherent buffer holding `data`.
    pub fn staging(ctx: &Arc<DeviceContext>, data: &[u8]) -> Result<Self> {
        let staging = Self::new(ctx, data.len() as vk::DeviceSize, vk::BufferUsageFlags::TRANSFER_SRC, HOST_MEMORY)?;
        staging.write(data)?;
        Ok(staging)
    }

    /// Host-visible buffer for per-frame data written with [`GpuBuffer::write`].
    pub fn host_visible(ctx: &Arc<DeviceContext>, size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> Result<Self> {
        Self::new(ctx, size, usage, HOST_MEMORY)
    }

    /// Device-local buffer initialised from `data` through a staging copy.
    pub fn device_local_with_data<T: Pod>(
        ctx: &Arc<DeviceContext>,
        usage: vk::BufferUsageFlags,
        data: &[T],
    ) -> Result<Self> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let buffer = Self::new(
            ctx,
            bytes.len() as vk::DeviceSize,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        upload_via_staging(ctx, bytes, &buffer)?;
        Ok(buffer)
    }

    /// Map, copy, unmap. Only valid for host-visible memory.
    pub fn write<T: Pod>(&self, data: &[T]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let len = bytes.len() as vk::DeviceSize;
        if len > self.size {
            return Err(RendererError::BufferOverflow {
                len,
                capacity: self.size,
            });
        }
        if bytes.is_empty() {
            return Ok(());
        }

        unsafe {
            let ptr = self
                .ctx
                .device
                .map_memory(self.memory, 0, len, vk::MemoryMapFlags::empty())
                .stage("map buffer memory")? as *mut u8;
            ptr.copy_from_nonoverlapping(bytes.as_ptr(), bytes.len());
            self.ctx.device.unmap_memory(self.memory);
        }
        Ok(())
    }

    /// Copy the whole buffer back to the host. Only valid for host-visible memory.
    pub fn read_bytes(&self) -> Result<Vec<u8>> {
        let mut out = vec![0u8; self.size as usize];
        if out.is_empty() {
            return Ok(out);
        }

        unsafe {
            let ptr = self
                .ctx
                .device
                .map_memory(self.memory, 0, self.size, vk::MemoryMapFlags::empty())
                .stage("map buffer memory")? as *const u8;
            ptr.copy_to_nonoverlapping(out.as_mut_ptr(), out.len());
            self.ctx.device.unmap_memory(self.memory);
        }
        Ok(out)
    }

    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        unsafe {
            self.ctx.device.destroy_buffer(self.buffer, None);
            self.ctx.device.free_memory(self.memory, None);
        }
    }
}

fn copy_buffer(ctx: &DeviceContext, src: &GpuBuffer, dst: &GpuBuffer, size: vk::DeviceSize) -> Result<()> {
    ctx.one_shot(|device, cmd| {
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size,
        };
        unsafe { device.cmd_copy_buffer(cmd, src.handle(), dst.handle(), &[region]) };
    })
}

/// Copy `data` into `dst` through a temporary staging buffer. Blocks until
/// the copy finished; the staging buffer is gone when this returns.
pub fn upload_via_staging(ctx: &Arc<DeviceContext>, data: &[u8], dst: &GpuBuffer) -> Result<()> {
    let len = data.len() as vk::DeviceSize;
    if len > dst.size() {
        return Err(RendererError::BufferOverflow {
            len,
            capacity: dst.size(),
        });
    }
    if data.is_empty() {
        return Ok(());
    }

    let staging = GpuBuffer::staging(ctx, data)?;
    copy_buffer(ctx, &staging, dst, len)
}

/// Read a device-local buffer back through a second staging buffer.
/// `src` must have been created with `TRANSFER_SRC` usage.
pub fn download_via_staging(ctx: &Arc<DeviceContext>, src: &GpuBuffer) -> Result<Vec<u8>> {
    let readback = GpuBuffer::new(ctx, src.size(), vk::BufferUsageFlags::TRANSFER_DST, HOST_MEMORY)?;
    copy_buffer(ctx, src, &readback, src.size())?;
    readback.read_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore = "requires a Vulkan device"]
    fn staging_round_trip_preserves_bytes() {
        let ctx = DeviceContext::headless("staging-test", false).unwrap();
        let data: Vec<u8> = (0..=255u8).cycle().take(4096 + 3).collect();

        let device_local = GpuBuffer::new(
            &ctx,
            data.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )
        .unwrap();
        upload_via_staging(&ctx, &data, &device_local).unwrap();

        assert_eq!(download_via_staging(&ctx, &device_local).unwrap(), data);
    }

    #[test]
    #[ignore = "requires a Vulkan device"]
    fn oversized_write_is_rejected() {
        let ctx = DeviceContext::headless("staging-test", false).unwrap();
        let buffer = GpuBuffer::host_visible(&ctx, 4, vk::BufferUsageFlags::UNIFORM_BUFFER).unwrap();
        let err = buffer.write(&[0u32, 1]).unwrap_err();
        assert!(matches!(err, RendererError::BufferOverflow { len: 8, capacity: 4 }));
    }
}
