//! GPU resource lifecycle and transfer layer over Vulkan.
//!
//! The crate is organized around four concerns:
//! - **Memory**: [`MemoryManager`] is the sole authority for allocating and
//!   destroying device buffers and images, with aggregate statistics.
//! - **Buffers**: [`GpuBuffer`] owns a device buffer and picks the transfer
//!   path (direct mapped write or staged copy) from its memory class;
//!   [`TypedBuffer`] and [`UniformBuffer`] add element and struct semantics.
//! - **Synchronization**: fences, a [`FencePool`], binary and timeline
//!   semaphores, and pipeline barrier helpers.
//! - **Commands**: [`CommandPool`] / [`CommandBuffer`] for explicit
//!   recording, and [`OneTimeCommand`] for scope-bound one-shot work.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use cinder_gpu::{
//!     BufferUsage, ContextParams, GpuBuffer, GpuContext, MemoryManager, MemoryUsage,
//! };
//!
//! # fn main() -> Result<(), cinder_gpu::GpuError> {
//! let context = GpuContext::new(&ContextParams::default())?;
//! let manager = Arc::new(MemoryManager::new(&context)?);
//! let device = context.device_handle();
//!
//! let mut buffer = GpuBuffer::new(
//!     &device,
//!     &manager,
//!     1024,
//!     BufferUsage::STORAGE,
//!     MemoryUsage::GpuOnly,
//! )?;
//! buffer.upload(&[0u8; 1024], 0)?;
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod command;
pub mod device;
pub mod error;
mod instance;
pub mod memory;
pub mod sync;

pub use buffer::{BufferUsage, GpuBuffer, TypedBuffer, UniformBuffer};
pub use command::{CommandBuffer, CommandPool, OneTimeCommand};
pub use device::{ContextParams, DeviceHandle, GpuContext, QueueHandle};
pub use error::GpuError;
pub use memory::{BufferAllocation, ImageAllocation, MemoryManager, MemoryStats, MemoryUsage};
pub use sync::{
    buffer_barrier, image_barrier, memory_barrier, BufferBarrier, Fence, FencePool, ImageBarrier,
    Semaphore, TimelineSemaphore,
};

/// Crate version, for diagnostics.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
