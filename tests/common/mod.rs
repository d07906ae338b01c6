#![allow(dead_code)]

use std::sync::Arc;

use cinder_gpu::{
    BufferUsage, ContextParams, DeviceHandle, GpuBuffer, GpuContext, GpuError, MemoryManager,
    MemoryUsage,
};

/// Shared harness for tests that need a real device.
///
/// Field order matters: the manager must drop before the context tears the
/// device down.
pub struct TestContext {
    pub manager: Arc<MemoryManager>,
    pub device: DeviceHandle,
    pub context: GpuContext,
}

impl TestContext {
    /// Returns `None` when no Vulkan device is available, so tests skip
    /// instead of failing on machines without a GPU.
    pub fn new() -> Option<Self> {
        let _ = env_logger::builder().is_test(true).try_init();

        let context = match GpuContext::new(&ContextParams::default()) {
            Ok(context) => context,
            Err(e) => {
                eprintln!("Skipping GPU test, no usable device: {}", e);
                return None;
            }
        };
        let manager = match MemoryManager::new(&context) {
            Ok(manager) => Arc::new(manager),
            Err(e) => {
                eprintln!("Skipping GPU test, allocator setup failed: {}", e);
                return None;
            }
        };
        let device = context.device_handle();

        Some(Self {
            manager,
            device,
            context,
        })
    }

    pub fn buffer(
        &self,
        size: u64,
        usage: BufferUsage,
        memory_usage: MemoryUsage,
    ) -> Result<GpuBuffer, GpuError> {
        GpuBuffer::new(&self.device, &self.manager, size, usage, memory_usage)
    }
}
