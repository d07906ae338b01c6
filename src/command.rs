//! Command recording and submission.
//!
//! [`CommandPool`] owns the backing storage for command buffers; one pool
//! per thread by convention, pools are not safe for concurrent use.
//! [`OneTimeCommand`] is the scope-bound primitive behind staged transfers:
//! it begins recording on construction and guarantees the recorded work is
//! submitted and waited on before the value goes out of scope, on every exit
//! path.

use ash::vk;

use crate::device::{DeviceHandle, QueueHandle};
use crate::error::GpuError;
use crate::sync::Fence;

/// A pool of command buffers targeting one queue family.
///
/// Not thread-safe; each thread must own its pool. Resetting the pool
/// invalidates every buffer allocated from it at once, which is cheaper than
/// per-buffer resets.
pub struct CommandPool {
    device: DeviceHandle,
    queue: QueueHandle,
    pool: vk::CommandPool,
}

impl CommandPool {
    /// Create a command pool for the given queue.
    pub fn new(device: &DeviceHandle, queue: QueueHandle) -> Result<Self, GpuError> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue.family_index)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let pool = unsafe { device.raw().create_command_pool(&pool_info, None) }.map_err(|e| {
            GpuError::OperationFailed(format!("Failed to create command pool: {:?}", e))
        })?;

        Ok(Self {
            device: device.clone(),
            queue,
            pool,
        })
    }

    /// Allocate one primary command buffer.
    pub fn allocate(&self) -> Result<CommandBuffer, GpuError> {
        Ok(self.allocate_many(1)?.remove(0))
    }

    /// Allocate several primary command buffers at once.
    pub fn allocate_many(&self, count: u32) -> Result<Vec<CommandBuffer>, GpuError> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        let buffers = unsafe { self.device.raw().allocate_command_buffers(&alloc_info) }.map_err(
            |e| GpuError::OperationFailed(format!("Failed to allocate command buffers: {:?}", e)),
        )?;

        Ok(buffers
            .into_iter()
            .map(|cmd| CommandBuffer {
                device: self.device.clone(),
                queue: self.queue,
                cmd,
            })
            .collect())
    }

    /// Reset the pool, invalidating all command buffers allocated from it.
    ///
    /// With `release_resources` the pool also returns its backing memory to
    /// the driver.
    pub fn reset(&self, release_resources: bool) -> Result<(), GpuError> {
        let flags = if release_resources {
            vk::CommandPoolResetFlags::RELEASE_RESOURCES
        } else {
            vk::CommandPoolResetFlags::empty()
        };
        unsafe { self.device.raw().reset_command_pool(self.pool, flags) }
            .map_err(|e| GpuError::OperationFailed(format!("Failed to reset pool: {:?}", e)))
    }

    /// The queue this pool's buffers submit to.
    pub fn queue(&self) -> QueueHandle {
        self.queue
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe {
            self.device.raw().destroy_command_pool(self.pool, None);
        }
    }
}

/// A recorded or recordable command buffer.
///
/// Lifetime is governed by the pool it came from: a pool reset or drop
/// invalidates the buffer, so a `CommandBuffer` must not outlive its pool.
pub struct CommandBuffer {
    device: DeviceHandle,
    queue: QueueHandle,
    cmd: vk::CommandBuffer,
}

impl CommandBuffer {
    /// Raw handle, for recording commands and barriers.
    pub fn raw(&self) -> vk::CommandBuffer {
        self.cmd
    }

    /// Begin recording. `one_time` marks the buffer for a single submission.
    pub fn begin(&self, one_time: bool) -> Result<(), GpuError> {
        let flags = if one_time {
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT
        } else {
            vk::CommandBufferUsageFlags::empty()
        };
        let begin_info = vk::CommandBufferBeginInfo::default().flags(flags);
        unsafe { self.device.raw().begin_command_buffer(self.cmd, &begin_info) }.map_err(|e| {
            GpuError::OperationFailed(format!("Failed to begin command buffer: {:?}", e))
        })
    }

    /// End recording.
    pub fn end(&self) -> Result<(), GpuError> {
        unsafe { self.device.raw().end_command_buffer(self.cmd) }.map_err(|e| {
            GpuError::OperationFailed(format!("Failed to end command buffer: {:?}", e))
        })
    }

    /// Reset this buffer back to the initial state.
    pub fn reset(&self) -> Result<(), GpuError> {
        unsafe {
            self.device
                .raw()
                .reset_command_buffer(self.cmd, vk::CommandBufferResetFlags::empty())
        }
        .map_err(|e| GpuError::OperationFailed(format!("Failed to reset command buffer: {:?}", e)))
    }

    /// Submit the recorded buffer to its queue.
    ///
    /// Waits on `wait_semaphores` at the given stages, signals
    /// `signal_semaphores` on completion and optionally signals `fence`.
    /// Returns as soon as the submission is queued; it does not block.
    pub fn submit(
        &self,
        wait_semaphores: &[(vk::Semaphore, vk::PipelineStageFlags)],
        signal_semaphores: &[vk::Semaphore],
        fence: Option<&Fence>,
    ) -> Result<(), GpuError> {
        let wait_handles: Vec<vk::Semaphore> = wait_semaphores.iter().map(|(s, _)| *s).collect();
        let wait_stages: Vec<vk::PipelineStageFlags> =
            wait_semaphores.iter().map(|(_, stage)| *stage).collect();
        let command_buffers = [self.cmd];

        let mut submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);
        if !wait_handles.is_empty() {
            submit_info = submit_info
                .wait_semaphores(&wait_handles)
                .wait_dst_stage_mask(&wait_stages);
        }
        if !signal_semaphores.is_empty() {
            submit_info = submit_info.signal_semaphores(signal_semaphores);
        }

        unsafe {
            self.device.raw().queue_submit(
                self.queue.queue,
                &[submit_info],
                fence.map(|f| f.raw()).unwrap_or(vk::Fence::null()),
            )
        }
        .map_err(|e| GpuError::OperationFailed(format!("Failed to submit: {:?}", e)))
    }

    /// Submit and block the calling thread until the work completes.
    ///
    /// The common case for non-overlapped, synchronous GPU work: creates a
    /// transient fence, submits, waits.
    pub fn submit_and_wait(&self) -> Result<(), GpuError> {
        let fence = Fence::new(&self.device, false)?;
        self.submit(&[], &[], Some(&fence))?;
        fence.wait(None)
    }
}

/// A scope-bound one-shot command recording.
///
/// Construction allocates a transient pool and one buffer and begins
/// recording. [`OneTimeCommand::submit`] ends recording, submits and blocks
/// until completion. Dropping without calling `submit` performs the same
/// end/submit/wait, logging (never panicking) on failure, so the recorded
/// work is always complete before the enclosing scope exits.
pub struct OneTimeCommand {
    device: DeviceHandle,
    queue: QueueHandle,
    pool: vk::CommandPool,
    cmd: vk::CommandBuffer,
    submitted: bool,
}

impl OneTimeCommand {
    /// Allocate and begin a one-shot recording on the given queue.
    pub fn new(device: &DeviceHandle, queue: QueueHandle) -> Result<Self, GpuError> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue.family_index)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);

        let pool = unsafe { device.raw().create_command_pool(&pool_info, None) }.map_err(|e| {
            GpuError::OperationFailed(format!("Failed to create transient pool: {:?}", e))
        })?;

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let cmd = match unsafe { device.raw().allocate_command_buffers(&alloc_info) } {
            Ok(buffers) => buffers[0],
            Err(e) => {
                unsafe { device.raw().destroy_command_pool(pool, None) };
                return Err(GpuError::OperationFailed(format!(
                    "Failed to allocate command buffer: {:?}",
                    e
                )));
            }
        };

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        if let Err(e) = unsafe { device.raw().begin_command_buffer(cmd, &begin_info) } {
            unsafe { device.raw().destroy_command_pool(pool, None) };
            return Err(GpuError::OperationFailed(format!(
                "Failed to begin command buffer: {:?}",
                e
            )));
        }

        Ok(Self {
            device: device.clone(),
            queue,
            pool,
            cmd,
            submitted: false,
        })
    }

    /// Raw handle, for recording copies and barriers.
    pub fn raw(&self) -> vk::CommandBuffer {
        self.cmd
    }

    /// End recording, submit, and block until the work completes.
    pub fn submit(mut self) -> Result<(), GpuError> {
        self.finish()
    }

    fn finish(&mut self) -> Result<(), GpuError> {
        // Marked before the attempt so the drop path never submits twice.
        self.submitted = true;

        unsafe { self.device.raw().end_command_buffer(self.cmd) }.map_err(|e| {
            GpuError::OperationFailed(format!("Failed to end command buffer: {:?}", e))
        })?;

        let fence = Fence::new(&self.device, false)?;
        let command_buffers = [self.cmd];
        let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);

        unsafe {
            self.device
                .raw()
                .queue_submit(self.queue.queue, &[submit_info], fence.raw())
        }
        .map_err(|e| GpuError::OperationFailed(format!("Failed to submit: {:?}", e)))?;

        fence.wait(None)
    }
}

impl Drop for OneTimeCommand {
    fn drop(&mut self) {
        if !self.submitted {
            if let Err(e) = self.finish() {
                log::error!("One-time command failed during drop: {}", e);
            }
        }
        unsafe {
            self.device.raw().destroy_command_pool(self.pool, None);
        }
    }
}
