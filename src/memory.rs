//! Device memory management.
//!
//! [`MemoryManager`] is the sole authority for allocating, classifying and
//! destroying device buffers and images. It is built on `gpu-allocator` and
//! tracks aggregate usage statistics for diagnostics.

use std::collections::HashMap;
use std::ptr::NonNull;

use ash::vk;
use ash::vk::Handle;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;

use crate::device::GpuContext;
use crate::error::GpuError;

/// Access-pattern classification for an allocation.
///
/// The class is fixed at creation time; resizing a buffer destroys and
/// recreates the allocation under the same class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryUsage {
    /// Device-local memory, not host-visible. Fastest for GPU access.
    GpuOnly,
    /// Host-visible memory optimized for host-to-device traffic.
    CpuToGpu,
    /// Host-visible memory optimized for device-to-host readback.
    GpuToCpu,
    /// Host-visible and coherent memory; slower for the device to access.
    CpuOnly,
}

impl MemoryUsage {
    /// Whether the class can be mapped into host address space.
    pub fn is_host_visible(self) -> bool {
        !matches!(self, Self::GpuOnly)
    }

    /// Map to the allocator's memory location. The allocator exposes no
    /// separate CPU-only class, so `CpuOnly` shares the host-visible
    /// coherent `CpuToGpu` location.
    pub(crate) fn location(self) -> MemoryLocation {
        match self {
            Self::GpuOnly => MemoryLocation::GpuOnly,
            Self::CpuToGpu | Self::CpuOnly => MemoryLocation::CpuToGpu,
            Self::GpuToCpu => MemoryLocation::GpuToCpu,
        }
    }
}

/// Point-in-time snapshot of the manager's allocation statistics.
///
/// Not synchronized against concurrent allocation: two reads may interleave
/// with allocations on other threads and observe different totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Bytes requested by live allocations.
    pub used_bytes: u64,
    /// Bytes actually reserved for live allocations (including alignment).
    pub allocated_bytes: u64,
    /// Number of live allocations.
    pub allocation_count: usize,
    /// Number of distinct device memory blocks backing live allocations.
    pub block_count: usize,
}

/// A device buffer together with its allocator-owned memory.
///
/// Handle and allocation token are both null or both valid; a destroyed
/// record has both nulled so repeated destroys are safe. Records are
/// exclusively owned by the [`MemoryManager`] that created them and must be
/// destroyed through it.
pub struct BufferAllocation {
    pub(crate) buffer: vk::Buffer,
    pub(crate) allocation: Option<Allocation>,
    pub(crate) size: u64,
    pub(crate) memory_usage: MemoryUsage,
}

impl BufferAllocation {
    /// Raw buffer handle, for binding into pipelines or descriptor sets.
    pub fn raw(&self) -> vk::Buffer {
        self.buffer
    }

    /// Requested size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Access-pattern class chosen at creation.
    pub fn memory_usage(&self) -> MemoryUsage {
        self.memory_usage
    }

    /// Whether the record has already been destroyed.
    pub fn is_null(&self) -> bool {
        self.buffer == vk::Buffer::null() && self.allocation.is_none()
    }
}

impl std::fmt::Debug for BufferAllocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferAllocation")
            .field("buffer", &self.buffer)
            .field("size", &self.size)
            .field("memory_usage", &self.memory_usage)
            .finish_non_exhaustive()
    }
}

/// A device image together with its allocator-owned memory.
///
/// Images are never implicitly mapped; they are not host-addressable in the
/// general case.
pub struct ImageAllocation {
    pub(crate) image: vk::Image,
    pub(crate) allocation: Option<Allocation>,
    pub(crate) size: u64,
    pub(crate) extent: vk::Extent3D,
    pub(crate) format: vk::Format,
    pub(crate) mip_levels: u32,
    pub(crate) array_layers: u32,
}

impl ImageAllocation {
    /// Raw image handle.
    pub fn raw(&self) -> vk::Image {
        self.image
    }

    /// Image extent.
    pub fn extent(&self) -> vk::Extent3D {
        self.extent
    }

    /// Image format.
    pub fn format(&self) -> vk::Format {
        self.format
    }

    /// Number of mip levels.
    pub fn mip_levels(&self) -> u32 {
        self.mip_levels
    }

    /// Number of array layers.
    pub fn array_layers(&self) -> u32 {
        self.array_layers
    }

    /// Whether the record has already been destroyed.
    pub fn is_null(&self) -> bool {
        self.image == vk::Image::null() && self.allocation.is_none()
    }
}

impl std::fmt::Debug for ImageAllocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageAllocation")
            .field("image", &self.image)
            .field("extent", &self.extent)
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

/// Internal statistics, maintained on every allocate/free.
#[derive(Default)]
struct StatsInner {
    used_bytes: u64,
    allocated_bytes: u64,
    allocation_count: usize,
    /// Live allocations per device memory block, keyed by the raw handle.
    blocks: HashMap<u64, usize>,
}

impl StatsInner {
    fn on_allocate(&mut self, requested: u64, allocation: &Allocation) {
        self.used_bytes += requested;
        self.allocated_bytes += allocation.size();
        self.allocation_count += 1;
        let block = unsafe { allocation.memory() }.as_raw();
        *self.blocks.entry(block).or_insert(0) += 1;
    }

    fn on_free(&mut self, requested: u64, allocation: &Allocation) {
        self.used_bytes = self.used_bytes.saturating_sub(requested);
        self.allocated_bytes = self.allocated_bytes.saturating_sub(allocation.size());
        self.allocation_count = self.allocation_count.saturating_sub(1);
        let block = unsafe { allocation.memory() }.as_raw();
        if let Some(count) = self.blocks.get_mut(&block) {
            *count -= 1;
            if *count == 0 {
                self.blocks.remove(&block);
            }
        }
    }
}

/// Sole authority for device memory allocation and destruction.
///
/// Thread-safe (allocator and statistics are behind mutexes), but
/// [`MemoryManager::stats`] returns unsynchronized snapshots. The manager
/// must outlive every allocation it produced; leaked allocations are logged
/// at teardown.
pub struct MemoryManager {
    device: ash::Device,
    allocator: Mutex<Allocator>,
    stats: Mutex<StatsInner>,
}

impl MemoryManager {
    /// Create a memory manager for the context's device.
    pub fn new(context: &GpuContext) -> Result<Self, GpuError> {
        let device = context.device_handle().raw().clone();
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: context.instance().clone(),
            device: device.clone(),
            physical_device: context.physical_device(),
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: gpu_allocator::AllocationSizes::default(),
        })
        .map_err(|e| {
            GpuError::InitializationFailed(format!("Failed to create memory allocator: {}", e))
        })?;

        Ok(Self {
            device,
            allocator: Mutex::new(allocator),
            stats: Mutex::new(StatsInner::default()),
        })
    }

    /// Create a buffer classified by `memory_usage`.
    ///
    /// `persistent_mapping` keeps the allocation mapped for the buffer's
    /// lifetime and is only valid for host-visible classes. A host-visible
    /// allocation that the allocator failed to map is logged, not rejected;
    /// callers fall back to staged transfers.
    pub fn create_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        memory_usage: MemoryUsage,
        persistent_mapping: bool,
    ) -> Result<BufferAllocation, GpuError> {
        if size == 0 {
            return Err(GpuError::InvalidAllocation(
                "buffer size must be non-zero".to_string(),
            ));
        }
        if persistent_mapping && !memory_usage.is_host_visible() {
            return Err(GpuError::InvalidAllocation(
                "persistent mapping requires a host-visible memory class".to_string(),
            ));
        }

        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { self.device.create_buffer(&buffer_info, None) }
            .map_err(|e| GpuError::OperationFailed(format!("Failed to create buffer: {:?}", e)))?;

        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = {
            let mut allocator = self.allocator.lock();
            allocator.allocate(&AllocationCreateDesc {
                name: "buffer",
                requirements,
                location: memory_usage.location(),
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
        };

        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(map_allocation_error(e));
            }
        };

        if let Err(e) = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        } {
            self.release(allocation);
            unsafe { self.device.destroy_buffer(buffer, None) };
            return Err(GpuError::OperationFailed(format!(
                "Failed to bind buffer memory: {:?}",
                e
            )));
        }

        if persistent_mapping && allocation.mapped_ptr().is_none() {
            // The allocation is still usable through staged transfers, so
            // this degrades instead of failing.
            log::warn!("Host-visible allocation has no mapped pointer; persistent mapping unavailable");
        }

        self.stats.lock().on_allocate(size, &allocation);

        Ok(BufferAllocation {
            buffer,
            allocation: Some(allocation),
            size,
            memory_usage,
        })
    }

    /// Create a 1-3D image with the same allocation discipline as buffers.
    ///
    /// The dimensionality is inferred from the extent. Images are never
    /// implicitly mapped.
    pub fn create_image(
        &self,
        extent: vk::Extent3D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        mip_levels: u32,
        array_layers: u32,
        memory_usage: MemoryUsage,
    ) -> Result<ImageAllocation, GpuError> {
        if extent.width == 0 || extent.height == 0 || extent.depth == 0 {
            return Err(GpuError::InvalidAllocation(
                "image extent must be non-zero in every dimension".to_string(),
            ));
        }
        if mip_levels == 0 || array_layers == 0 {
            return Err(GpuError::InvalidAllocation(
                "mip level and array layer counts must be non-zero".to_string(),
            ));
        }

        let image_type = if extent.height == 1 && extent.depth == 1 {
            vk::ImageType::TYPE_1D
        } else if extent.depth == 1 {
            vk::ImageType::TYPE_2D
        } else {
            vk::ImageType::TYPE_3D
        };

        let image_info = vk::ImageCreateInfo::default()
            .image_type(image_type)
            .format(format)
            .extent(extent)
            .mip_levels(mip_levels)
            .array_layers(array_layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { self.device.create_image(&image_info, None) }
            .map_err(|e| GpuError::OperationFailed(format!("Failed to create image: {:?}", e)))?;

        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let allocation = {
            let mut allocator = self.allocator.lock();
            allocator.allocate(&AllocationCreateDesc {
                name: "image",
                requirements,
                location: memory_usage.location(),
                linear: false,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
        };

        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(map_allocation_error(e));
            }
        };

        if let Err(e) = unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        } {
            self.release(allocation);
            unsafe { self.device.destroy_image(image, None) };
            return Err(GpuError::OperationFailed(format!(
                "Failed to bind image memory: {:?}",
                e
            )));
        }

        self.stats.lock().on_allocate(requirements.size, &allocation);

        Ok(ImageAllocation {
            image,
            size: requirements.size,
            allocation: Some(allocation),
            extent,
            format,
            mip_levels,
            array_layers,
        })
    }

    /// Destroy a buffer and free its memory.
    ///
    /// Idempotent: a record that was already destroyed (or never valid) is a
    /// no-op. On success the record's handle fields are nulled so later
    /// destroy calls are safe.
    pub fn destroy_buffer(&self, record: &mut BufferAllocation) {
        let Some(allocation) = record.allocation.take() else {
            return;
        };

        self.stats.lock().on_free(record.size, &allocation);
        self.release(allocation);

        if record.buffer != vk::Buffer::null() {
            unsafe { self.device.destroy_buffer(record.buffer, None) };
        }
        record.buffer = vk::Buffer::null();
        record.size = 0;
    }

    /// Destroy an image and free its memory. Idempotent, like
    /// [`MemoryManager::destroy_buffer`].
    pub fn destroy_image(&self, record: &mut ImageAllocation) {
        let Some(allocation) = record.allocation.take() else {
            return;
        };

        self.stats.lock().on_free(record.size, &allocation);
        self.release(allocation);

        if record.image != vk::Image::null() {
            unsafe { self.device.destroy_image(record.image, None) };
        }
        record.image = vk::Image::null();
        record.size = 0;
    }

    /// Get a host pointer into a buffer's memory.
    ///
    /// Only valid for host-visible classes; `GpuOnly` fails with
    /// [`GpuError::InvalidParameter`]. Host-visible allocations stay mapped
    /// for their whole lifetime, so this never issues a device call.
    pub fn map_memory(&self, record: &BufferAllocation) -> Result<NonNull<u8>, GpuError> {
        if !record.memory_usage.is_host_visible() {
            return Err(GpuError::InvalidParameter(
                "GpuOnly buffers are not host-addressable".to_string(),
            ));
        }
        let Some(allocation) = record.allocation.as_ref() else {
            return Err(GpuError::InvalidParameter(
                "buffer has been destroyed".to_string(),
            ));
        };
        allocation
            .mapped_ptr()
            .map(|ptr| ptr.cast::<u8>())
            .ok_or_else(|| {
                GpuError::OperationFailed("host-visible allocation is not mapped".to_string())
            })
    }

    /// Release a host mapping obtained from [`MemoryManager::map_memory`].
    ///
    /// Host-visible allocations are persistently mapped by the allocator, so
    /// this is a logical no-op; it exists so callers can bracket their
    /// accesses. Idempotent.
    pub fn unmap_memory(&self, _record: &BufferAllocation) {}

    /// Snapshot the current allocation statistics.
    pub fn stats(&self) -> MemoryStats {
        let stats = self.stats.lock();
        MemoryStats {
            used_bytes: stats.used_bytes,
            allocated_bytes: stats.allocated_bytes,
            allocation_count: stats.allocation_count,
            block_count: stats.blocks.len(),
        }
    }

    pub(crate) fn device(&self) -> &ash::Device {
        &self.device
    }

    fn release(&self, allocation: Allocation) {
        if let Err(e) = self.allocator.lock().free(allocation) {
            log::error!("Failed to free allocation: {}", e);
        }
    }
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        let live = self.stats.lock().allocation_count;
        if live != 0 {
            log::error!(
                "MemoryManager dropped with {} live allocation(s); \
                 destroy all buffers and images before the manager",
                live
            );
        }
    }
}

static_assertions::assert_impl_all!(MemoryManager: Send, Sync);

fn map_allocation_error(e: gpu_allocator::AllocationError) -> GpuError {
    match e {
        gpu_allocator::AllocationError::OutOfMemory => GpuError::OutOfMemory,
        gpu_allocator::AllocationError::InvalidAllocationCreateDesc => {
            GpuError::InvalidAllocation("allocator rejected creation parameters".to_string())
        }
        other => GpuError::OperationFailed(format!("allocator error: {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_usage_host_visibility() {
        assert!(!MemoryUsage::GpuOnly.is_host_visible());
        assert!(MemoryUsage::CpuToGpu.is_host_visible());
        assert!(MemoryUsage::GpuToCpu.is_host_visible());
        assert!(MemoryUsage::CpuOnly.is_host_visible());
    }

    #[test]
    fn test_memory_usage_location_mapping() {
        assert_eq!(MemoryUsage::GpuOnly.location(), MemoryLocation::GpuOnly);
        assert_eq!(MemoryUsage::CpuToGpu.location(), MemoryLocation::CpuToGpu);
        assert_eq!(MemoryUsage::GpuToCpu.location(), MemoryLocation::GpuToCpu);
        // CpuOnly shares the host-visible coherent location
        assert_eq!(MemoryUsage::CpuOnly.location(), MemoryLocation::CpuToGpu);
    }

    #[test]
    fn test_stats_default() {
        let stats = MemoryStats::default();
        assert_eq!(stats.used_bytes, 0);
        assert_eq!(stats.allocation_count, 0);
        assert_eq!(stats.block_count, 0);
    }
}
