//! Integration tests against a real Vulkan device.
//!
//! Every test skips (with a note on stderr) when no usable device is
//! present, so the suite is safe to run on headless CI machines.

mod common;

use std::sync::Arc;
use std::time::Duration;

use rstest::rstest;

use cinder_gpu::{
    BufferUsage, CommandPool, Fence, FencePool, GpuBuffer, GpuError, ImageAllocation,
    MemoryManager, MemoryUsage, OneTimeCommand, Semaphore, TimelineSemaphore, TypedBuffer,
    UniformBuffer,
};

use common::TestContext;

// -- memory manager --------------------------------------------------------

#[test]
fn test_stats_balance_after_destroy() {
    let Some(ctx) = TestContext::new() else {
        return;
    };

    let baseline = ctx.manager.stats();
    assert_eq!(baseline.allocation_count, 0);

    {
        let _a = ctx
            .buffer(4096, BufferUsage::STORAGE, MemoryUsage::GpuOnly)
            .unwrap();
        let _b = ctx
            .buffer(1024, BufferUsage::COPY_SRC, MemoryUsage::CpuToGpu)
            .unwrap();
        let _c = ctx
            .buffer(256, BufferUsage::COPY_DST, MemoryUsage::GpuToCpu)
            .unwrap();

        let stats = ctx.manager.stats();
        assert_eq!(stats.allocation_count, 3);
        assert_eq!(stats.used_bytes, 4096 + 1024 + 256);
        assert!(stats.allocated_bytes >= stats.used_bytes);
        assert!(stats.block_count >= 1);
    }

    let stats = ctx.manager.stats();
    assert_eq!(stats.allocation_count, 0);
    assert_eq!(stats.used_bytes, 0);
    assert_eq!(stats.allocated_bytes, 0);
    assert_eq!(stats.block_count, 0);
}

#[test]
fn test_zero_size_buffer_rejected() {
    let Some(ctx) = TestContext::new() else {
        return;
    };

    let result = ctx.buffer(0, BufferUsage::STORAGE, MemoryUsage::GpuOnly);
    assert!(matches!(result, Err(GpuError::InvalidAllocation(_))));
}

#[test]
fn test_destroy_buffer_is_idempotent() {
    let Some(ctx) = TestContext::new() else {
        return;
    };

    let mut record = ctx
        .manager
        .create_buffer(
            512,
            ash::vk::BufferUsageFlags::TRANSFER_DST,
            MemoryUsage::GpuOnly,
            false,
        )
        .unwrap();
    assert!(!record.is_null());

    ctx.manager.destroy_buffer(&mut record);
    assert!(record.is_null());
    assert_eq!(ctx.manager.stats().allocation_count, 0);

    // Second destroy is a no-op.
    ctx.manager.destroy_buffer(&mut record);
    assert_eq!(ctx.manager.stats().allocation_count, 0);
}

#[test]
fn test_image_lifecycle() {
    let Some(ctx) = TestContext::new() else {
        return;
    };

    let mut image: ImageAllocation = ctx
        .manager
        .create_image(
            ash::vk::Extent3D {
                width: 64,
                height: 64,
                depth: 1,
            },
            ash::vk::Format::R8G8B8A8_UNORM,
            ash::vk::ImageUsageFlags::SAMPLED | ash::vk::ImageUsageFlags::TRANSFER_DST,
            1,
            1,
            MemoryUsage::GpuOnly,
        )
        .unwrap();
    assert_eq!(image.extent().width, 64);
    assert_eq!(ctx.manager.stats().allocation_count, 1);

    ctx.manager.destroy_image(&mut image);
    assert!(image.is_null());
    assert_eq!(ctx.manager.stats().allocation_count, 0);
}

// -- mapping ---------------------------------------------------------------

#[rstest]
#[case::cpu_to_gpu(MemoryUsage::CpuToGpu)]
#[case::gpu_to_cpu(MemoryUsage::GpuToCpu)]
#[case::cpu_only(MemoryUsage::CpuOnly)]
fn test_host_visible_classes_map(#[case] memory_usage: MemoryUsage) {
    let Some(ctx) = TestContext::new() else {
        return;
    };

    let mut buffer = ctx.buffer(256, BufferUsage::COPY_SRC, memory_usage).unwrap();
    let first = buffer.map().unwrap();
    // Mapping again returns the same pointer.
    let second = buffer.map().unwrap();
    assert_eq!(first, second);

    buffer.unmap();
    assert!(!buffer.is_mapped());
    // Unmapping twice is a no-op.
    buffer.unmap();
}

#[test]
fn test_gpu_only_map_rejected() {
    let Some(ctx) = TestContext::new() else {
        return;
    };

    let mut buffer = ctx
        .buffer(256, BufferUsage::STORAGE, MemoryUsage::GpuOnly)
        .unwrap();
    assert!(matches!(buffer.map(), Err(GpuError::InvalidParameter(_))));
}

#[test]
fn test_persistent_mapping_requires_host_visible() {
    let Some(ctx) = TestContext::new() else {
        return;
    };

    let result = GpuBuffer::new_persistent(
        &ctx.device,
        &ctx.manager,
        256,
        BufferUsage::UNIFORM,
        MemoryUsage::GpuOnly,
    );
    assert!(matches!(result, Err(GpuError::InvalidAllocation(_))));
}

// -- transfers -------------------------------------------------------------

#[rstest]
#[case::staged_gpu_only(MemoryUsage::GpuOnly)]
#[case::direct_cpu_to_gpu(MemoryUsage::CpuToGpu)]
#[case::direct_gpu_to_cpu(MemoryUsage::GpuToCpu)]
#[case::direct_cpu_only(MemoryUsage::CpuOnly)]
fn test_round_trip(#[case] memory_usage: MemoryUsage) {
    let Some(ctx) = TestContext::new() else {
        return;
    };

    let data: Vec<u8> = (0..1024).map(|i| (i % 251) as u8).collect();
    let mut buffer = ctx
        .buffer(
            1024,
            BufferUsage::COPY_SRC | BufferUsage::COPY_DST,
            memory_usage,
        )
        .unwrap();

    buffer.upload(&data, 0).unwrap();
    let mut readback = vec![0u8; 1024];
    buffer.download(&mut readback, 0).unwrap();
    assert_eq!(readback, data);
}

#[test]
fn test_offset_transfer() {
    let Some(ctx) = TestContext::new() else {
        return;
    };

    let mut buffer = ctx
        .buffer(64, BufferUsage::STORAGE, MemoryUsage::GpuOnly)
        .unwrap();
    buffer.upload(&[0u8; 64], 0).unwrap();
    buffer.upload(&[0xAB; 16], 32).unwrap();

    let mut readback = [0u8; 16];
    buffer.download(&mut readback, 32).unwrap();
    assert_eq!(readback, [0xAB; 16]);

    let mut head = [0xFFu8; 16];
    buffer.download(&mut head, 0).unwrap();
    assert_eq!(head, [0u8; 16]);
}

#[test]
fn test_out_of_range_transfer_rejected() {
    let Some(ctx) = TestContext::new() else {
        return;
    };

    let mut buffer = ctx
        .buffer(64, BufferUsage::COPY_DST, MemoryUsage::CpuToGpu)
        .unwrap();
    let result = buffer.upload(&[0u8; 32], 48);
    assert!(matches!(result, Err(GpuError::InvalidParameter(_))));

    let mut out = [0u8; 32];
    let result = buffer.download(&mut out, 48);
    assert!(matches!(result, Err(GpuError::InvalidParameter(_))));
}

#[test]
fn test_resize_is_destructive() {
    let Some(ctx) = TestContext::new() else {
        return;
    };

    let mut buffer = ctx
        .buffer(64, BufferUsage::STORAGE, MemoryUsage::GpuOnly)
        .unwrap();
    buffer.upload(&[7u8; 64], 0).unwrap();

    buffer.resize(256).unwrap();
    assert_eq!(buffer.size(), 256);

    // The contents of a fresh allocation are unspecified, and the allocator
    // may hand back the just-freed block with the old bytes still in place,
    // so asserting the old pattern is gone would be flaky. Destructiveness
    // is observed through the new size and a full overwrite instead.
    buffer.upload(&[9u8; 256], 0).unwrap();
    let mut readback = vec![0u8; 256];
    buffer.download(&mut readback, 0).unwrap();
    assert_eq!(readback, vec![9u8; 256]);

    assert!(matches!(
        buffer.resize(0),
        Err(GpuError::InvalidParameter(_))
    ));
}

// -- typed buffers ---------------------------------------------------------

#[test]
fn test_typed_buffer_float_round_trip() {
    let Some(ctx) = TestContext::new() else {
        return;
    };

    let data: Vec<f32> = (0..1024).map(|i| i as f32).collect();
    let mut buffer =
        TypedBuffer::<f32>::storage(&ctx.device, &ctx.manager, 1024).unwrap();
    assert_eq!(buffer.count(), 1024);
    assert_eq!(buffer.buffer().size(), 4096);

    buffer.upload_slice(&data).unwrap();
    let mut readback = vec![0f32; 1024];
    buffer.download_slice(&mut readback).unwrap();
    assert_eq!(readback, data);
}

#[test]
fn test_typed_buffer_element_boundary() {
    let Some(ctx) = TestContext::new() else {
        return;
    };

    let mut buffer =
        TypedBuffer::<u32>::new(
            &ctx.device,
            &ctx.manager,
            16,
            BufferUsage::STORAGE | BufferUsage::COPY_SRC | BufferUsage::COPY_DST,
            MemoryUsage::CpuToGpu,
        )
        .unwrap();

    // Exactly filling the last elements is fine.
    buffer.upload_at(12, &[1, 2, 3, 4]).unwrap();
    // One element past the end is not.
    assert!(matches!(
        buffer.upload_at(13, &[1, 2, 3, 4]),
        Err(GpuError::InvalidParameter(_))
    ));
    let mut out = [0u32; 4];
    assert!(matches!(
        buffer.download_at(13, &mut out),
        Err(GpuError::InvalidParameter(_))
    ));

    buffer.download_at(12, &mut out).unwrap();
    assert_eq!(out, [1, 2, 3, 4]);
}

#[test]
fn test_uniform_buffer_update() {
    let Some(ctx) = TestContext::new() else {
        return;
    };

    #[repr(C)]
    #[derive(Clone, Copy, PartialEq, Debug, bytemuck::Pod, bytemuck::Zeroable)]
    struct Params {
        scale: [f32; 4],
        offset: [f32; 4],
    }

    let mut uniform = UniformBuffer::<Params>::new(&ctx.device, &ctx.manager).unwrap();
    assert_eq!(uniform.size(), 32);

    let value = Params {
        scale: [1.0, 2.0, 3.0, 4.0],
        offset: [0.5; 4],
    };
    uniform.update(&value).unwrap();
    uniform
        .update(&Params {
            scale: [9.0; 4],
            ..value
        })
        .unwrap();
}

#[test]
fn test_uniform_buffer_update_without_mapping() {
    let Some(ctx) = TestContext::new() else {
        return;
    };

    #[repr(C)]
    #[derive(Clone, Copy, PartialEq, Debug, bytemuck::Pod, bytemuck::Zeroable)]
    struct Params {
        value: [f32; 4],
    }

    let mut uniform = UniformBuffer::<Params>::new(&ctx.device, &ctx.manager).unwrap();

    // Drop the persistent mapping; updates must still land through the
    // upload fallback.
    uniform.buffer_mut().unmap();
    assert!(!uniform.buffer().is_mapped());

    let value = Params {
        value: [1.0, 2.0, 3.0, 4.0],
    };
    uniform.update(&value).unwrap();

    let mut readback = [0u8; 16];
    uniform.buffer_mut().download(&mut readback, 0).unwrap();
    assert_eq!(&readback[..], bytemuck::bytes_of(&value));
}

#[test]
fn test_transfer_releases_transient_mapping() {
    let Some(ctx) = TestContext::new() else {
        return;
    };

    let mut buffer = ctx
        .buffer(
            64,
            BufferUsage::COPY_SRC | BufferUsage::COPY_DST,
            MemoryUsage::CpuToGpu,
        )
        .unwrap();
    assert!(!buffer.is_mapped());

    // Transfers on an unmapped buffer map only for their own duration.
    buffer.upload(&[1u8; 64], 0).unwrap();
    assert!(!buffer.is_mapped());
    let mut out = [0u8; 64];
    buffer.download(&mut out, 0).unwrap();
    assert!(!buffer.is_mapped());
    assert_eq!(out, [1u8; 64]);

    // An explicit mapping survives transfers.
    buffer.map().unwrap();
    buffer.upload(&[2u8; 64], 0).unwrap();
    assert!(buffer.is_mapped());
    buffer.download(&mut out, 0).unwrap();
    assert!(buffer.is_mapped());
    assert_eq!(out, [2u8; 64]);
}

// -- synchronization -------------------------------------------------------

#[test]
fn test_fence_states() {
    let Some(ctx) = TestContext::new() else {
        return;
    };

    let fence = Fence::new(&ctx.device, true).unwrap();
    assert!(fence.is_signaled());
    fence.wait(Some(Duration::from_millis(10))).unwrap();

    fence.reset().unwrap();
    assert!(!fence.is_signaled());
    let result = fence.wait(Some(Duration::from_millis(10)));
    assert!(matches!(result, Err(GpuError::Timeout)));
}

#[test]
fn test_fence_pool_reuses_fences() {
    let Some(ctx) = TestContext::new() else {
        return;
    };

    let mut pool = FencePool::new(&ctx.device);
    assert_eq!(pool.created_count(), 0);

    let fence = pool.acquire().unwrap();
    assert_eq!(pool.created_count(), 1);
    assert!(!fence.is_signaled());

    // Signal the fence through a trivial submission, then release it
    // without resetting.
    let cmd_pool = CommandPool::new(&ctx.device, ctx.device.graphics_queue()).unwrap();
    let cmd = cmd_pool.allocate().unwrap();
    cmd.begin(true).unwrap();
    cmd.end().unwrap();
    cmd.submit(&[], &[], Some(&fence)).unwrap();
    fence.wait(None).unwrap();
    assert!(fence.is_signaled());
    pool.release(fence);
    assert_eq!(pool.available_count(), 1);

    // Reacquisition hands back the pooled fence, reset to unsignaled.
    let fence = pool.acquire().unwrap();
    assert_eq!(pool.created_count(), 1);
    assert!(!fence.is_signaled());

    let other = pool.acquire().unwrap();
    assert_eq!(pool.created_count(), 2);
    pool.release(fence);
    pool.release(other);
}

#[test]
fn test_timeline_semaphore_monotonic() {
    let Some(ctx) = TestContext::new() else {
        return;
    };

    let timeline = TimelineSemaphore::new(&ctx.device, 0).unwrap();
    assert_eq!(timeline.value().unwrap(), 0);

    timeline.signal(5).unwrap();
    assert_eq!(timeline.value().unwrap(), 5);
    timeline.wait(5, Some(Duration::from_millis(10))).unwrap();
    // Waits for already-reached values return immediately.
    timeline.wait(3, Some(Duration::from_millis(10))).unwrap();

    // Signaling backwards or in place is rejected.
    assert!(matches!(
        timeline.signal(5),
        Err(GpuError::InvalidParameter(_))
    ));
    assert!(matches!(
        timeline.signal(2),
        Err(GpuError::InvalidParameter(_))
    ));
    assert_eq!(timeline.value().unwrap(), 5);

    // Waiting for a value nothing will signal times out.
    let result = timeline.wait(100, Some(Duration::from_millis(10)));
    assert!(matches!(result, Err(GpuError::Timeout)));
}

#[test]
fn test_binary_semaphore_creation() {
    let Some(ctx) = TestContext::new() else {
        return;
    };

    let semaphore = Semaphore::new(&ctx.device).unwrap();
    assert_ne!(semaphore.raw(), ash::vk::Semaphore::null());
}

// -- command execution -----------------------------------------------------

#[test]
fn test_command_pool_allocate_and_reset() {
    let Some(ctx) = TestContext::new() else {
        return;
    };

    let pool = CommandPool::new(&ctx.device, ctx.device.graphics_queue()).unwrap();
    let buffers = pool.allocate_many(3).unwrap();
    assert_eq!(buffers.len(), 3);

    for cmd in &buffers {
        cmd.begin(false).unwrap();
        cmd.end().unwrap();
    }
    buffers[0].submit_and_wait().unwrap();

    pool.reset(true).unwrap();
}

#[test]
fn test_one_time_command_submit() {
    let Some(ctx) = TestContext::new() else {
        return;
    };

    let mut src = ctx
        .buffer(64, BufferUsage::COPY_SRC, MemoryUsage::CpuToGpu)
        .unwrap();
    src.upload(&[0x42; 64], 0).unwrap();
    let mut dst = ctx
        .buffer(
            64,
            BufferUsage::COPY_DST | BufferUsage::COPY_SRC,
            MemoryUsage::GpuToCpu,
        )
        .unwrap();

    let command = OneTimeCommand::new(&ctx.device, ctx.device.transfer_queue()).unwrap();
    let region = ash::vk::BufferCopy::default().size(64);
    unsafe {
        ctx.device
            .raw()
            .cmd_copy_buffer(command.raw(), src.raw(), dst.raw(), &[region]);
    }
    command.submit().unwrap();

    let mut readback = [0u8; 64];
    dst.download(&mut readback, 0).unwrap();
    assert_eq!(readback, [0x42; 64]);
}

#[test]
fn test_one_time_command_submits_on_drop() {
    let Some(ctx) = TestContext::new() else {
        return;
    };

    let mut src = ctx
        .buffer(32, BufferUsage::COPY_SRC, MemoryUsage::CpuToGpu)
        .unwrap();
    src.upload(&[0x77; 32], 0).unwrap();
    let mut dst = ctx
        .buffer(
            32,
            BufferUsage::COPY_DST | BufferUsage::COPY_SRC,
            MemoryUsage::GpuToCpu,
        )
        .unwrap();

    {
        let command = OneTimeCommand::new(&ctx.device, ctx.device.transfer_queue()).unwrap();
        let region = ash::vk::BufferCopy::default().size(32);
        unsafe {
            ctx.device
                .raw()
                .cmd_copy_buffer(command.raw(), src.raw(), dst.raw(), &[region]);
        }
        // Dropped without submit: the recorded copy still runs to
        // completion before the scope exits.
    }

    let mut readback = [0u8; 32];
    dst.download(&mut readback, 0).unwrap();
    assert_eq!(readback, [0x77; 32]);
}

#[test]
fn test_barriers_record_and_submit() {
    let Some(ctx) = TestContext::new() else {
        return;
    };

    let buffer = ctx
        .buffer(128, BufferUsage::STORAGE, MemoryUsage::GpuOnly)
        .unwrap();

    let command = OneTimeCommand::new(&ctx.device, ctx.device.graphics_queue()).unwrap();
    cinder_gpu::memory_barrier(
        ctx.device.raw(),
        command.raw(),
        ash::vk::PipelineStageFlags::TRANSFER,
        ash::vk::AccessFlags::TRANSFER_WRITE,
        ash::vk::PipelineStageFlags::COMPUTE_SHADER,
        ash::vk::AccessFlags::SHADER_READ,
    );
    let barrier = cinder_gpu::BufferBarrier::new(buffer.raw())
        .with_stages(
            ash::vk::PipelineStageFlags::COMPUTE_SHADER,
            ash::vk::PipelineStageFlags::COMPUTE_SHADER,
        )
        .with_access(
            ash::vk::AccessFlags::SHADER_WRITE,
            ash::vk::AccessFlags::SHADER_READ,
        );
    cinder_gpu::buffer_barrier(ctx.device.raw(), command.raw(), &barrier);
    command.submit().unwrap();
}

// -- teardown ordering -----------------------------------------------------

#[test]
fn test_manager_shared_across_buffers() {
    let Some(ctx) = TestContext::new() else {
        return;
    };

    let manager: Arc<MemoryManager> = Arc::clone(&ctx.manager);
    let a = GpuBuffer::new(
        &ctx.device,
        &manager,
        64,
        BufferUsage::STORAGE,
        MemoryUsage::GpuOnly,
    )
    .unwrap();
    let b = GpuBuffer::new(
        &ctx.device,
        &manager,
        64,
        BufferUsage::STORAGE,
        MemoryUsage::GpuOnly,
    )
    .unwrap();

    assert_eq!(ctx.manager.stats().allocation_count, 2);
    drop(a);
    assert_eq!(ctx.manager.stats().allocation_count, 1);
    drop(b);
    assert_eq!(ctx.manager.stats().allocation_count, 0);
}
