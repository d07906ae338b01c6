//! Buffer objects and data transfer.
//!
//! [`GpuBuffer`] is a move-only owning handle over a device buffer. Uploads
//! and downloads pick the transfer path from the buffer's memory class:
//! host-visible buffers are written through a mapped pointer, device-local
//! buffers go through a temporary staging buffer and a one-shot transfer
//! submission. [`TypedBuffer`] and [`UniformBuffer`] layer element and
//! struct semantics on top.

use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::Arc;

use ash::vk;
use bitflags::bitflags;
use bytemuck::Pod;

use crate::command::OneTimeCommand;
use crate::device::DeviceHandle;
use crate::error::GpuError;
use crate::memory::{BufferAllocation, MemoryManager, MemoryUsage};

bitflags! {
    /// How a buffer will be used by the pipeline.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const VERTEX = 1 << 0;
        const INDEX = 1 << 1;
        const UNIFORM = 1 << 2;
        const STORAGE = 1 << 3;
        const INDIRECT = 1 << 4;
        const COPY_SRC = 1 << 5;
        const COPY_DST = 1 << 6;
    }
}

impl BufferUsage {
    /// Translate to the backend usage flags.
    ///
    /// Device-local buffers always get the transfer bits added, since the
    /// only way data moves in or out of them is through copy commands.
    pub(crate) fn to_vk(self, memory_usage: MemoryUsage) -> vk::BufferUsageFlags {
        let mut flags = vk::BufferUsageFlags::empty();
        if self.contains(Self::VERTEX) {
            flags |= vk::BufferUsageFlags::VERTEX_BUFFER;
        }
        if self.contains(Self::INDEX) {
            flags |= vk::BufferUsageFlags::INDEX_BUFFER;
        }
        if self.contains(Self::UNIFORM) {
            flags |= vk::BufferUsageFlags::UNIFORM_BUFFER;
        }
        if self.contains(Self::STORAGE) {
            flags |= vk::BufferUsageFlags::STORAGE_BUFFER;
        }
        if self.contains(Self::INDIRECT) {
            flags |= vk::BufferUsageFlags::INDIRECT_BUFFER;
        }
        if self.contains(Self::COPY_SRC) {
            flags |= vk::BufferUsageFlags::TRANSFER_SRC;
        }
        if self.contains(Self::COPY_DST) {
            flags |= vk::BufferUsageFlags::TRANSFER_DST;
        }
        if memory_usage == MemoryUsage::GpuOnly {
            flags |= vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST;
        }
        flags
    }
}

/// An owning handle over a device buffer.
///
/// Move-only; destruction routes through the [`MemoryManager`] that created
/// it, so dropping the handle frees both the buffer and its memory.
pub struct GpuBuffer {
    device: DeviceHandle,
    manager: Arc<MemoryManager>,
    allocation: BufferAllocation,
    usage: BufferUsage,
    memory_usage: MemoryUsage,
    mapped: Option<NonNull<u8>>,
}

// The mapped pointer aliases allocator-owned memory reachable only through
// this handle.
unsafe impl Send for GpuBuffer {}
unsafe impl Sync for GpuBuffer {}

impl GpuBuffer {
    /// Create a buffer of `size` bytes.
    pub fn new(
        device: &DeviceHandle,
        manager: &Arc<MemoryManager>,
        size: u64,
        usage: BufferUsage,
        memory_usage: MemoryUsage,
    ) -> Result<Self, GpuError> {
        Self::with_mapping(device, manager, size, usage, memory_usage, false)
    }

    /// Create a host-visible buffer that stays mapped for its lifetime.
    ///
    /// When the allocator cannot provide a mapped pointer the buffer is
    /// still created; a warning is logged and writes take the ordinary
    /// upload path. Non-host-visible classes are rejected with
    /// [`GpuError::InvalidAllocation`].
    pub fn new_persistent(
        device: &DeviceHandle,
        manager: &Arc<MemoryManager>,
        size: u64,
        usage: BufferUsage,
        memory_usage: MemoryUsage,
    ) -> Result<Self, GpuError> {
        Self::with_mapping(device, manager, size, usage, memory_usage, true)
    }

    fn with_mapping(
        device: &DeviceHandle,
        manager: &Arc<MemoryManager>,
        size: u64,
        usage: BufferUsage,
        memory_usage: MemoryUsage,
        persistent_mapping: bool,
    ) -> Result<Self, GpuError> {
        let allocation = manager.create_buffer(
            size,
            usage.to_vk(memory_usage),
            memory_usage,
            persistent_mapping,
        )?;
        // A failed persistent mapping is a degradation, not an error: the
        // buffer stays valid and writes take the ordinary upload path.
        let mapped = if persistent_mapping {
            match manager.map_memory(&allocation) {
                Ok(ptr) => Some(ptr),
                Err(e) => {
                    log::warn!("Persistent mapping unavailable: {}", e);
                    None
                }
            }
        } else {
            None
        };
        Ok(Self {
            device: device.clone(),
            manager: Arc::clone(manager),
            allocation,
            usage,
            memory_usage,
            mapped,
        })
    }

    /// Raw buffer handle.
    pub fn raw(&self) -> vk::Buffer {
        self.allocation.raw()
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.allocation.size()
    }

    /// Pipeline usage flags chosen at creation.
    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    /// Memory class chosen at creation.
    pub fn memory_usage(&self) -> MemoryUsage {
        self.memory_usage
    }

    /// Whether the buffer is currently mapped.
    pub fn is_mapped(&self) -> bool {
        self.mapped.is_some()
    }

    /// Map the buffer into host address space.
    ///
    /// Idempotent: mapping an already-mapped buffer returns the same
    /// pointer. Fails with [`GpuError::InvalidParameter`] for device-local
    /// buffers.
    pub fn map(&mut self) -> Result<NonNull<u8>, GpuError> {
        if let Some(ptr) = self.mapped {
            return Ok(ptr);
        }
        let ptr = self.manager.map_memory(&self.allocation)?;
        self.mapped = Some(ptr);
        Ok(ptr)
    }

    /// Release the host mapping. Idempotent; unmapping an unmapped buffer is
    /// a no-op.
    pub fn unmap(&mut self) {
        if self.mapped.take().is_some() {
            self.manager.unmap_memory(&self.allocation);
        }
    }

    /// Write `data` into the buffer starting at `offset`.
    ///
    /// Host-visible buffers are written directly through a mapped pointer,
    /// mapping transiently (and unmapping afterwards) when the buffer was
    /// not already mapped. Device-local buffers are staged through a
    /// temporary host-visible buffer and a blocking copy on the transfer
    /// queue.
    pub fn upload(&mut self, data: &[u8], offset: u64) -> Result<(), GpuError> {
        if data.is_empty() {
            return Ok(());
        }
        self.check_range(data.len(), offset)?;

        if self.memory_usage.is_host_visible() {
            let was_mapped = self.is_mapped();
            let ptr = self.map()?;
            unsafe {
                std::ptr::copy_nonoverlapping(
                    data.as_ptr(),
                    ptr.as_ptr().add(offset as usize),
                    data.len(),
                );
            }
            if !was_mapped {
                self.unmap();
            }
            return Ok(());
        }

        let mut staging = GpuBuffer::new(
            &self.device,
            &self.manager,
            data.len() as u64,
            BufferUsage::COPY_SRC,
            MemoryUsage::CpuToGpu,
        )?;
        staging.upload(data, 0)?;
        self.copy_from(&staging, 0, offset, data.len() as u64)
    }

    /// Read `out.len()` bytes from the buffer starting at `offset`.
    ///
    /// The staged path for device-local buffers copies through a temporary
    /// readback buffer on the transfer queue and blocks until the copy
    /// completes.
    pub fn download(&mut self, out: &mut [u8], offset: u64) -> Result<(), GpuError> {
        if out.is_empty() {
            return Ok(());
        }
        self.check_range(out.len(), offset)?;

        if self.memory_usage.is_host_visible() {
            let was_mapped = self.is_mapped();
            let ptr = self.map()?;
            unsafe {
                std::ptr::copy_nonoverlapping(
                    ptr.as_ptr().add(offset as usize),
                    out.as_mut_ptr(),
                    out.len(),
                );
            }
            if !was_mapped {
                self.unmap();
            }
            return Ok(());
        }

        let mut staging = GpuBuffer::new(
            &self.device,
            &self.manager,
            out.len() as u64,
            BufferUsage::COPY_DST,
            MemoryUsage::GpuToCpu,
        )?;
        staging.copy_from(self, offset, 0, out.len() as u64)?;
        staging.download(out, 0)
    }

    /// Destroy the current allocation and create a fresh one of `new_size`.
    ///
    /// Contents are not preserved. A mapped buffer is remapped after the
    /// resize when possible.
    pub fn resize(&mut self, new_size: u64) -> Result<(), GpuError> {
        if new_size == 0 {
            return Err(GpuError::InvalidParameter(
                "buffer size must be non-zero".to_string(),
            ));
        }
        let was_mapped = self.mapped.take().is_some();

        self.manager.destroy_buffer(&mut self.allocation);
        self.allocation = self.manager.create_buffer(
            new_size,
            self.usage.to_vk(self.memory_usage),
            self.memory_usage,
            false,
        )?;

        if was_mapped {
            match self.manager.map_memory(&self.allocation) {
                Ok(ptr) => self.mapped = Some(ptr),
                Err(e) => log::warn!("Failed to remap buffer after resize: {}", e),
            }
        }
        Ok(())
    }

    /// Record and run a blocking buffer-to-buffer copy on the transfer
    /// queue.
    fn copy_from(
        &self,
        src: &GpuBuffer,
        src_offset: u64,
        dst_offset: u64,
        size: u64,
    ) -> Result<(), GpuError> {
        let command = OneTimeCommand::new(&self.device, self.device.transfer_queue())?;
        let region = vk::BufferCopy::default()
            .src_offset(src_offset)
            .dst_offset(dst_offset)
            .size(size);
        unsafe {
            self.device
                .raw()
                .cmd_copy_buffer(command.raw(), src.raw(), self.raw(), &[region]);
        }
        command.submit()
    }

    fn check_range(&self, len: usize, offset: u64) -> Result<(), GpuError> {
        let end = offset
            .checked_add(len as u64)
            .ok_or_else(|| GpuError::InvalidParameter("transfer range overflows".to_string()))?;
        if end > self.size() {
            return Err(GpuError::InvalidParameter(format!(
                "transfer range {}..{} exceeds buffer size {}",
                offset,
                end,
                self.size()
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for GpuBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuBuffer")
            .field("buffer", &self.raw())
            .field("size", &self.size())
            .field("usage", &self.usage)
            .field("memory_usage", &self.memory_usage)
            .field("mapped", &self.mapped.is_some())
            .finish_non_exhaustive()
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        self.mapped = None;
        self.manager.destroy_buffer(&mut self.allocation);
    }
}

/// A buffer holding a fixed number of `T` elements.
///
/// All transfers are bounds-checked against the element count; partial
/// updates address elements, not bytes.
pub struct TypedBuffer<T: Pod> {
    buffer: GpuBuffer,
    count: usize,
    _marker: PhantomData<T>,
}

impl<T: Pod> TypedBuffer<T> {
    /// Create a buffer sized for `count` elements.
    pub fn new(
        device: &DeviceHandle,
        manager: &Arc<MemoryManager>,
        count: usize,
        usage: BufferUsage,
        memory_usage: MemoryUsage,
    ) -> Result<Self, GpuError> {
        if count == 0 {
            return Err(GpuError::InvalidParameter(
                "element count must be non-zero".to_string(),
            ));
        }
        let size = (count * std::mem::size_of::<T>()) as u64;
        let buffer = GpuBuffer::new(device, manager, size, usage, memory_usage)?;
        Ok(Self {
            buffer,
            count,
            _marker: PhantomData,
        })
    }

    /// A device-local vertex buffer.
    pub fn vertex(
        device: &DeviceHandle,
        manager: &Arc<MemoryManager>,
        count: usize,
    ) -> Result<Self, GpuError> {
        Self::new(
            device,
            manager,
            count,
            BufferUsage::VERTEX | BufferUsage::COPY_DST,
            MemoryUsage::GpuOnly,
        )
    }

    /// A device-local index buffer.
    pub fn index(
        device: &DeviceHandle,
        manager: &Arc<MemoryManager>,
        count: usize,
    ) -> Result<Self, GpuError> {
        Self::new(
            device,
            manager,
            count,
            BufferUsage::INDEX | BufferUsage::COPY_DST,
            MemoryUsage::GpuOnly,
        )
    }

    /// A host-visible uniform buffer.
    pub fn uniform(
        device: &DeviceHandle,
        manager: &Arc<MemoryManager>,
        count: usize,
    ) -> Result<Self, GpuError> {
        Self::new(
            device,
            manager,
            count,
            BufferUsage::UNIFORM,
            MemoryUsage::CpuToGpu,
        )
    }

    /// A device-local storage buffer, readable and writable by shaders.
    pub fn storage(
        device: &DeviceHandle,
        manager: &Arc<MemoryManager>,
        count: usize,
    ) -> Result<Self, GpuError> {
        Self::new(
            device,
            manager,
            count,
            BufferUsage::STORAGE | BufferUsage::COPY_SRC | BufferUsage::COPY_DST,
            MemoryUsage::GpuOnly,
        )
    }

    /// A device-local indirect-argument buffer.
    pub fn indirect(
        device: &DeviceHandle,
        manager: &Arc<MemoryManager>,
        count: usize,
    ) -> Result<Self, GpuError> {
        Self::new(
            device,
            manager,
            count,
            BufferUsage::INDIRECT | BufferUsage::COPY_DST,
            MemoryUsage::GpuOnly,
        )
    }

    /// Number of elements.
    pub fn count(&self) -> usize {
        self.count
    }

    /// The underlying untyped buffer.
    pub fn buffer(&self) -> &GpuBuffer {
        &self.buffer
    }

    /// Raw buffer handle.
    pub fn raw(&self) -> vk::Buffer {
        self.buffer.raw()
    }

    /// Upload elements starting at element 0.
    pub fn upload_slice(&mut self, data: &[T]) -> Result<(), GpuError> {
        self.upload_at(0, data)
    }

    /// Upload elements starting at element `index`.
    pub fn upload_at(&mut self, index: usize, data: &[T]) -> Result<(), GpuError> {
        self.check_elements(index, data.len())?;
        let offset = (index * std::mem::size_of::<T>()) as u64;
        self.buffer.upload(bytemuck::cast_slice(data), offset)
    }

    /// Download elements starting at element 0.
    pub fn download_slice(&mut self, out: &mut [T]) -> Result<(), GpuError> {
        self.download_at(0, out)
    }

    /// Download elements starting at element `index`.
    pub fn download_at(&mut self, index: usize, out: &mut [T]) -> Result<(), GpuError> {
        self.check_elements(index, out.len())?;
        let offset = (index * std::mem::size_of::<T>()) as u64;
        self.buffer.download(bytemuck::cast_slice_mut(out), offset)
    }

    fn check_elements(&self, index: usize, len: usize) -> Result<(), GpuError> {
        let end = index
            .checked_add(len)
            .ok_or_else(|| GpuError::InvalidParameter("element range overflows".to_string()))?;
        if end > self.count {
            return Err(GpuError::InvalidParameter(format!(
                "element range {}..{} exceeds buffer count {}",
                index, end, self.count
            )));
        }
        Ok(())
    }
}

impl<T: Pod> std::fmt::Debug for TypedBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedBuffer")
            .field("count", &self.count)
            .field("buffer", &self.buffer)
            .finish()
    }
}

/// A persistently mapped single-struct uniform buffer.
///
/// Updates write straight through the mapping, making per-frame parameter
/// updates a memcpy.
pub struct UniformBuffer<T: Pod> {
    buffer: GpuBuffer,
    _marker: PhantomData<T>,
}

impl<T: Pod> UniformBuffer<T> {
    /// Create a uniform buffer holding one `T`.
    pub fn new(device: &DeviceHandle, manager: &Arc<MemoryManager>) -> Result<Self, GpuError> {
        let buffer = GpuBuffer::new_persistent(
            device,
            manager,
            std::mem::size_of::<T>() as u64,
            BufferUsage::UNIFORM,
            MemoryUsage::CpuToGpu,
        )?;
        Ok(Self {
            buffer,
            _marker: PhantomData,
        })
    }

    /// Raw buffer handle, for descriptor writes.
    pub fn raw(&self) -> vk::Buffer {
        self.buffer.raw()
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.buffer.size()
    }

    /// The underlying untyped buffer.
    pub fn buffer(&self) -> &GpuBuffer {
        &self.buffer
    }

    /// Mutable access to the underlying untyped buffer.
    pub fn buffer_mut(&mut self) -> &mut GpuBuffer {
        &mut self.buffer
    }

    /// Write a new value through the persistent mapping, falling back to the
    /// ordinary upload path when no mapping is live.
    pub fn update(&mut self, value: &T) -> Result<(), GpuError> {
        match self.buffer.mapped {
            Some(ptr) => {
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        value as *const T as *const u8,
                        ptr.as_ptr(),
                        std::mem::size_of::<T>(),
                    );
                }
                Ok(())
            }
            // Degraded path: the persistent mapping was unavailable at
            // construction (already logged there) or the buffer was
            // explicitly unmapped.
            None => self.buffer.upload(bytemuck::bytes_of(value), 0),
        }
    }
}

impl<T: Pod> std::fmt::Debug for UniformBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UniformBuffer")
            .field("buffer", &self.buffer)
            .finish()
    }
}
