//! Host/device and device/device synchronization.
//!
//! Fences give the host a binary view of one submission's completion.
//! Semaphores order work between queues on the device. Timeline semaphores
//! add a host-readable monotonic counter. Barrier functions record ordering
//! constraints into a command buffer; they take effect only when that buffer
//! is submitted and the device reaches them in execution order. Barriers are
//! the only mechanism here for making one device operation's writes visible
//! to a later operation's reads; a missing barrier is a silent data race,
//! not a crash.

use std::time::Duration;

use ash::vk;

use crate::device::DeviceHandle;
use crate::error::GpuError;

fn timeout_ns(timeout: Option<Duration>) -> u64 {
    match timeout {
        Some(d) => d.as_nanos().min(u64::MAX as u128) as u64,
        None => u64::MAX,
    }
}

/// A binary, host-observable completion flag tied to one submission.
///
/// State machine: unsignaled, then signaled when the submitted work
/// completes, then unsignaled again only after an explicit [`Fence::reset`].
pub struct Fence {
    device: ash::Device,
    fence: vk::Fence,
}

impl Fence {
    /// Create a fence, optionally already in the signaled state.
    pub fn new(device: &DeviceHandle, signaled: bool) -> Result<Self, GpuError> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let fence_info = vk::FenceCreateInfo::default().flags(flags);
        let fence = unsafe { device.raw().create_fence(&fence_info, None) }
            .map_err(|e| GpuError::OperationFailed(format!("Failed to create fence: {:?}", e)))?;
        Ok(Self {
            device: device.raw().clone(),
            fence,
        })
    }

    /// Raw fence handle, for passing to a queue submission.
    pub fn raw(&self) -> vk::Fence {
        self.fence
    }

    /// Block the calling thread until the fence signals or the timeout
    /// elapses. `None` waits forever. A timeout is reported as
    /// [`GpuError::Timeout`], distinct from a device failure.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<(), GpuError> {
        match unsafe {
            self.device
                .wait_for_fences(&[self.fence], true, timeout_ns(timeout))
        } {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => Err(GpuError::Timeout),
            Err(e) => Err(GpuError::OperationFailed(format!(
                "Fence wait failed: {:?}",
                e
            ))),
        }
    }

    /// Non-blocking poll of the fence state.
    pub fn is_signaled(&self) -> bool {
        matches!(unsafe { self.device.get_fence_status(self.fence) }, Ok(true))
    }

    /// Return the fence to the unsignaled state.
    pub fn reset(&self) -> Result<(), GpuError> {
        unsafe { self.device.reset_fences(&[self.fence]) }
            .map_err(|e| GpuError::OperationFailed(format!("Fence reset failed: {:?}", e)))
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        unsafe { self.device.destroy_fence(self.fence, None) };
    }
}

impl std::fmt::Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fence")
            .field("fence", &self.fence)
            .finish_non_exhaustive()
    }
}

/// A growable pool of reusable fences.
///
/// [`FencePool::acquire`] always hands out an unsignaled fence, resetting it
/// lazily if it was released in a signaled state. Callers release fences
/// without resetting them first.
pub struct FencePool {
    device: DeviceHandle,
    available: Vec<Fence>,
    created: usize,
}

impl FencePool {
    /// Create an empty pool.
    pub fn new(device: &DeviceHandle) -> Self {
        Self {
            device: device.clone(),
            available: Vec::new(),
            created: 0,
        }
    }

    /// Acquire a fence guaranteed to be unsignaled, growing the pool if no
    /// released fence is available.
    pub fn acquire(&mut self) -> Result<Fence, GpuError> {
        if let Some(fence) = self.available.pop() {
            if fence.is_signaled() {
                fence.reset()?;
            }
            return Ok(fence);
        }
        let fence = Fence::new(&self.device, false)?;
        self.created += 1;
        Ok(fence)
    }

    /// Return a fence to the pool. The fence may still be signaled; it is
    /// reset lazily on the next acquire.
    pub fn release(&mut self, fence: Fence) {
        self.available.push(fence);
    }

    /// Number of fences this pool has ever created.
    pub fn created_count(&self) -> usize {
        self.created
    }

    /// Number of fences currently available for acquisition.
    pub fn available_count(&self) -> usize {
        self.available.len()
    }
}

/// A binary device-side ordering token with no host-visible state.
///
/// Single-use per signal/wait pairing: a signal on one submission must be
/// consumed by exactly one wait on another.
pub struct Semaphore {
    device: ash::Device,
    semaphore: vk::Semaphore,
}

impl Semaphore {
    /// Create a binary semaphore.
    pub fn new(device: &DeviceHandle) -> Result<Self, GpuError> {
        let semaphore_info = vk::SemaphoreCreateInfo::default();
        let semaphore = unsafe { device.raw().create_semaphore(&semaphore_info, None) }.map_err(
            |e| GpuError::OperationFailed(format!("Failed to create semaphore: {:?}", e)),
        )?;
        Ok(Self {
            device: device.raw().clone(),
            semaphore,
        })
    }

    /// Raw semaphore handle.
    pub fn raw(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe { self.device.destroy_semaphore(self.semaphore, None) };
    }
}

/// A device ordering token with a monotonically increasing 64-bit counter.
///
/// A newly signaled value must be strictly greater than the current value;
/// waiters block until the counter reaches or exceeds their target.
pub struct TimelineSemaphore {
    device: ash::Device,
    semaphore: vk::Semaphore,
}

impl TimelineSemaphore {
    /// Create a timeline semaphore starting at `initial_value`.
    pub fn new(device: &DeviceHandle, initial_value: u64) -> Result<Self, GpuError> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(initial_value);
        let semaphore_info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
        let semaphore = unsafe { device.raw().create_semaphore(&semaphore_info, None) }.map_err(
            |e| {
                GpuError::OperationFailed(format!(
                    "Failed to create timeline semaphore: {:?}",
                    e
                ))
            },
        )?;
        Ok(Self {
            device: device.raw().clone(),
            semaphore,
        })
    }

    /// Raw semaphore handle.
    pub fn raw(&self) -> vk::Semaphore {
        self.semaphore
    }

    /// Signal the counter from the host.
    ///
    /// Fails with [`GpuError::InvalidParameter`] when `value` does not
    /// strictly exceed the current counter.
    pub fn signal(&self, value: u64) -> Result<(), GpuError> {
        let current = self.value()?;
        if value <= current {
            return Err(GpuError::InvalidParameter(format!(
                "timeline signal value {} must exceed current value {}",
                value, current
            )));
        }
        let signal_info = vk::SemaphoreSignalInfo::default()
            .semaphore(self.semaphore)
            .value(value);
        unsafe { self.device.signal_semaphore(&signal_info) }.map_err(|e| {
            GpuError::OperationFailed(format!("Timeline semaphore signal failed: {:?}", e))
        })
    }

    /// Block until the counter reaches `value` or the timeout elapses.
    pub fn wait(&self, value: u64, timeout: Option<Duration>) -> Result<(), GpuError> {
        let semaphores = [self.semaphore];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        match unsafe { self.device.wait_semaphores(&wait_info, timeout_ns(timeout)) } {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => Err(GpuError::Timeout),
            Err(e) => Err(GpuError::OperationFailed(format!(
                "Timeline semaphore wait failed: {:?}",
                e
            ))),
        }
    }

    /// Non-blocking read of the current counter.
    pub fn value(&self) -> Result<u64, GpuError> {
        unsafe { self.device.get_semaphore_counter_value(self.semaphore) }.map_err(|e| {
            GpuError::OperationFailed(format!("Timeline semaphore read failed: {:?}", e))
        })
    }
}

impl Drop for TimelineSemaphore {
    fn drop(&mut self) {
        unsafe { self.device.destroy_semaphore(self.semaphore, None) };
    }
}

/// Description of an image memory barrier with an optional layout
/// transition.
#[derive(Debug, Clone)]
pub struct ImageBarrier {
    pub image: vk::Image,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub aspect_mask: vk::ImageAspectFlags,
    pub base_mip_level: u32,
    pub level_count: u32,
    pub base_array_layer: u32,
    pub layer_count: u32,
}

impl ImageBarrier {
    /// Describe a transition covering the image's full color subresource
    /// range, ordered between all commands.
    pub fn new(image: vk::Image, old_layout: vk::ImageLayout, new_layout: vk::ImageLayout) -> Self {
        Self {
            image,
            old_layout,
            new_layout,
            src_stage: vk::PipelineStageFlags::ALL_COMMANDS,
            dst_stage: vk::PipelineStageFlags::ALL_COMMANDS,
            src_access: vk::AccessFlags::MEMORY_WRITE,
            dst_access: vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: vk::REMAINING_MIP_LEVELS,
            base_array_layer: 0,
            layer_count: vk::REMAINING_ARRAY_LAYERS,
        }
    }

    /// Set the source/destination pipeline stage pair.
    pub fn with_stages(
        mut self,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
    ) -> Self {
        self.src_stage = src_stage;
        self.dst_stage = dst_stage;
        self
    }

    /// Set the source/destination access mask pair.
    pub fn with_access(mut self, src_access: vk::AccessFlags, dst_access: vk::AccessFlags) -> Self {
        self.src_access = src_access;
        self.dst_access = dst_access;
        self
    }

    /// Restrict the barrier to a mip/array subresource range.
    pub fn with_subresource_range(
        mut self,
        aspect_mask: vk::ImageAspectFlags,
        base_mip_level: u32,
        level_count: u32,
        base_array_layer: u32,
        layer_count: u32,
    ) -> Self {
        self.aspect_mask = aspect_mask;
        self.base_mip_level = base_mip_level;
        self.level_count = level_count;
        self.base_array_layer = base_array_layer;
        self.layer_count = layer_count;
        self
    }
}

/// Description of a buffer memory barrier over a byte range.
#[derive(Debug, Clone)]
pub struct BufferBarrier {
    pub buffer: vk::Buffer,
    pub offset: u64,
    pub size: u64,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
}

impl BufferBarrier {
    /// Describe a barrier covering the buffer's whole range, ordered between
    /// all commands.
    pub fn new(buffer: vk::Buffer) -> Self {
        Self {
            buffer,
            offset: 0,
            size: vk::WHOLE_SIZE,
            src_stage: vk::PipelineStageFlags::ALL_COMMANDS,
            dst_stage: vk::PipelineStageFlags::ALL_COMMANDS,
            src_access: vk::AccessFlags::MEMORY_WRITE,
            dst_access: vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
        }
    }

    /// Restrict the barrier to a byte range.
    pub fn with_range(mut self, offset: u64, size: u64) -> Self {
        self.offset = offset;
        self.size = size;
        self
    }

    /// Set the source/destination pipeline stage pair.
    pub fn with_stages(
        mut self,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
    ) -> Self {
        self.src_stage = src_stage;
        self.dst_stage = dst_stage;
        self
    }

    /// Set the source/destination access mask pair.
    pub fn with_access(mut self, src_access: vk::AccessFlags, dst_access: vk::AccessFlags) -> Self {
        self.src_access = src_access;
        self.dst_access = dst_access;
        self
    }
}

/// Record an image layout transition barrier into `cmd`.
pub fn image_barrier(device: &ash::Device, cmd: vk::CommandBuffer, barrier: &ImageBarrier) {
    let image_barrier = vk::ImageMemoryBarrier::default()
        .old_layout(barrier.old_layout)
        .new_layout(barrier.new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(barrier.image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: barrier.aspect_mask,
            base_mip_level: barrier.base_mip_level,
            level_count: barrier.level_count,
            base_array_layer: barrier.base_array_layer,
            layer_count: barrier.layer_count,
        })
        .src_access_mask(barrier.src_access)
        .dst_access_mask(barrier.dst_access);

    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            barrier.src_stage,
            barrier.dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[image_barrier],
        );
    }
}

/// Record a buffer memory barrier into `cmd`.
pub fn buffer_barrier(device: &ash::Device, cmd: vk::CommandBuffer, barrier: &BufferBarrier) {
    let buffer_barrier = vk::BufferMemoryBarrier::default()
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .buffer(barrier.buffer)
        .offset(barrier.offset)
        .size(barrier.size)
        .src_access_mask(barrier.src_access)
        .dst_access_mask(barrier.dst_access);

    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            barrier.src_stage,
            barrier.dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[buffer_barrier],
            &[],
        );
    }
}

/// Record a global memory barrier into `cmd`.
pub fn memory_barrier(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    src_stage: vk::PipelineStageFlags,
    src_access: vk::AccessFlags,
    dst_stage: vk::PipelineStageFlags,
    dst_access: vk::AccessFlags,
) {
    let barrier = vk::MemoryBarrier::default()
        .src_access_mask(src_access)
        .dst_access_mask(dst_access);

    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            src_stage,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[barrier],
            &[],
            &[],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn test_image_barrier_defaults_cover_full_range() {
        let barrier = ImageBarrier::new(
            vk::Image::from_raw(1),
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        );
        assert_eq!(barrier.base_mip_level, 0);
        assert_eq!(barrier.level_count, vk::REMAINING_MIP_LEVELS);
        assert_eq!(barrier.layer_count, vk::REMAINING_ARRAY_LAYERS);
        assert_eq!(barrier.aspect_mask, vk::ImageAspectFlags::COLOR);
    }

    #[test]
    fn test_buffer_barrier_builders() {
        let barrier = BufferBarrier::new(vk::Buffer::from_raw(1))
            .with_range(64, 128)
            .with_stages(
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::COMPUTE_SHADER,
            )
            .with_access(
                vk::AccessFlags::TRANSFER_WRITE,
                vk::AccessFlags::SHADER_READ,
            );
        assert_eq!(barrier.offset, 64);
        assert_eq!(barrier.size, 128);
        assert_eq!(barrier.src_stage, vk::PipelineStageFlags::TRANSFER);
        assert_eq!(barrier.dst_access, vk::AccessFlags::SHADER_READ);
    }

    #[test]
    fn test_timeout_conversion() {
        assert_eq!(timeout_ns(None), u64::MAX);
        assert_eq!(timeout_ns(Some(Duration::from_nanos(500))), 500);
        assert_eq!(timeout_ns(Some(Duration::from_secs(1))), 1_000_000_000);
    }
}
