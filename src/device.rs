//! Physical device selection, queue discovery and logical device creation.
//!
//! Everything above this module consumes the device through [`DeviceHandle`]:
//! an opaque logical device plus three queues (graphics, compute, transfer),
//! each with a stable queue-family index. [`GpuContext`] owns the underlying
//! instance and device and must outlive every resource created from it.

use std::ffi::CStr;

use ash::vk;

use crate::error::GpuError;
use crate::instance;

/// A queue together with the family index it was created from.
#[derive(Debug, Clone, Copy)]
pub struct QueueHandle {
    /// The raw queue. Submissions to one queue must be externally
    /// synchronized.
    pub queue: vk::Queue,
    /// Queue family index, stable for the lifetime of the device.
    pub family_index: u32,
}

/// Cheap-to-clone bundle of the logical device and its three queues.
///
/// This is the handle every component of this crate is built on. Cloning
/// shares the same underlying `ash::Device`.
#[derive(Clone)]
pub struct DeviceHandle {
    device: ash::Device,
    graphics: QueueHandle,
    compute: QueueHandle,
    transfer: QueueHandle,
}

impl DeviceHandle {
    /// Get the raw ash device.
    pub fn raw(&self) -> &ash::Device {
        &self.device
    }

    /// Get the graphics queue.
    pub fn graphics_queue(&self) -> QueueHandle {
        self.graphics
    }

    /// Get the compute queue. Falls back to the graphics family when the
    /// device has no dedicated compute family.
    pub fn compute_queue(&self) -> QueueHandle {
        self.compute
    }

    /// Get the transfer queue. Falls back to the graphics family when the
    /// device has no dedicated transfer family.
    pub fn transfer_queue(&self) -> QueueHandle {
        self.transfer
    }
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("graphics", &self.graphics)
            .field("compute", &self.compute)
            .field("transfer", &self.transfer)
            .finish_non_exhaustive()
    }
}

/// Parameters for context creation.
#[derive(Debug, Clone)]
pub struct ContextParams {
    /// Enable the Khronos validation layer if it is installed.
    pub validation: bool,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            validation: cfg!(debug_assertions),
        }
    }
}

/// Owner of the Vulkan instance and logical device.
///
/// Resources created from a context (memory manager, buffers, sync
/// primitives, command pools) borrow clones of the device handle and must be
/// dropped before the context itself.
pub struct GpuContext {
    entry: ash::Entry,
    instance: ash::Instance,
    debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
    debug_utils: Option<ash::ext::debug_utils::Instance>,
    physical_device: vk::PhysicalDevice,
    device_handle: DeviceHandle,
}

impl GpuContext {
    /// Create a headless context: instance, physical device, logical device
    /// and the three queues.
    pub fn new(params: &ContextParams) -> Result<Self, GpuError> {
        let entry = unsafe { ash::Entry::load() }.map_err(|e| {
            GpuError::InitializationFailed(format!("Failed to load Vulkan: {}", e))
        })?;

        let (instance, debug_messenger, debug_utils) =
            instance::create_instance(&entry, params.validation)?;

        let physical_device = select_physical_device(&instance)?;
        let families = find_queue_families(&instance, physical_device)?;
        let device = create_logical_device(&instance, physical_device, &families)?;

        let graphics = QueueHandle {
            queue: unsafe { device.get_device_queue(families.graphics, 0) },
            family_index: families.graphics,
        };
        let compute = QueueHandle {
            queue: unsafe { device.get_device_queue(families.compute, 0) },
            family_index: families.compute,
        };
        let transfer = QueueHandle {
            queue: unsafe { device.get_device_queue(families.transfer, 0) },
            family_index: families.transfer,
        };

        log::info!(
            "GPU context initialized (queue families: graphics {}, compute {}, transfer {})",
            families.graphics,
            families.compute,
            families.transfer
        );

        Ok(Self {
            entry,
            instance,
            debug_messenger,
            debug_utils,
            physical_device,
            device_handle: DeviceHandle {
                device,
                graphics,
                compute,
                transfer,
            },
        })
    }

    /// Get a cloneable handle to the logical device and its queues.
    pub fn device_handle(&self) -> DeviceHandle {
        self.device_handle.clone()
    }

    /// Get the Vulkan instance.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Get the Vulkan entry points.
    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    /// Get the physical device.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device_handle.device.device_wait_idle();
            self.device_handle.device.destroy_device(None);

            if let (Some(debug_utils), Some(messenger)) = (&self.debug_utils, self.debug_messenger)
            {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

/// Queue family indices discovered for the three roles.
struct QueueFamilies {
    graphics: u32,
    compute: u32,
    transfer: u32,
}

impl QueueFamilies {
    /// Distinct family indices, for building queue create infos.
    fn distinct(&self) -> Vec<u32> {
        let mut families = vec![self.graphics];
        if !families.contains(&self.compute) {
            families.push(self.compute);
        }
        if !families.contains(&self.transfer) {
            families.push(self.transfer);
        }
        families
    }
}

/// Select the best physical device.
///
/// Prefers discrete GPUs over integrated GPUs and rejects devices without
/// timeline semaphore support.
fn select_physical_device(instance: &ash::Instance) -> Result<vk::PhysicalDevice, GpuError> {
    let devices = unsafe { instance.enumerate_physical_devices() }.map_err(|e| {
        GpuError::InitializationFailed(format!("Failed to enumerate physical devices: {:?}", e))
    })?;

    if devices.is_empty() {
        return Err(GpuError::InitializationFailed(
            "No Vulkan-capable GPU found".to_string(),
        ));
    }

    let mut best_device = None;
    let mut best_score = 0;

    for device in devices {
        let properties = unsafe { instance.get_physical_device_properties(device) };

        if vk::api_version_minor(properties.api_version) < 2
            && vk::api_version_major(properties.api_version) <= 1
        {
            continue;
        }

        if !supports_timeline_semaphores(instance, device) {
            continue;
        }

        let mut score = 1;
        if properties.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
            score += 1000;
        } else if properties.device_type == vk::PhysicalDeviceType::INTEGRATED_GPU {
            score += 100;
        }

        let device_name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) };
        log::info!(
            "Found GPU: {:?} (type: {:?}, score: {})",
            device_name,
            properties.device_type,
            score
        );

        if score > best_score {
            best_score = score;
            best_device = Some(device);
        }
    }

    best_device
        .ok_or_else(|| GpuError::InitializationFailed("No suitable GPU found".to_string()))
}

/// Check Vulkan 1.2 timeline semaphore support.
fn supports_timeline_semaphores(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> bool {
    let mut vulkan_12_features = vk::PhysicalDeviceVulkan12Features::default();
    let mut features = vk::PhysicalDeviceFeatures2::default().push_next(&mut vulkan_12_features);
    unsafe { instance.get_physical_device_features2(physical_device, &mut features) };
    vulkan_12_features.timeline_semaphore == vk::TRUE
}

/// Find queue families for the three roles.
///
/// The graphics family is mandatory. For compute and transfer, a dedicated
/// family (one that is not also the graphics family) is preferred; both fall
/// back to the graphics family otherwise.
fn find_queue_families(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<QueueFamilies, GpuError> {
    let queue_families =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

    let mut graphics = None;
    let mut dedicated_compute = None;
    let mut dedicated_transfer = None;

    for (index, family) in queue_families.iter().enumerate() {
        let index = index as u32;
        let flags = family.queue_flags;

        if graphics.is_none() && flags.contains(vk::QueueFlags::GRAPHICS) {
            graphics = Some(index);
            continue;
        }

        if dedicated_compute.is_none()
            && flags.contains(vk::QueueFlags::COMPUTE)
            && !flags.contains(vk::QueueFlags::GRAPHICS)
        {
            dedicated_compute = Some(index);
        }

        if dedicated_transfer.is_none()
            && flags.contains(vk::QueueFlags::TRANSFER)
            && !flags.contains(vk::QueueFlags::GRAPHICS)
            && !flags.contains(vk::QueueFlags::COMPUTE)
        {
            dedicated_transfer = Some(index);
        }
    }

    let graphics = graphics.ok_or_else(|| {
        GpuError::InitializationFailed("No graphics queue family found".to_string())
    })?;

    Ok(QueueFamilies {
        graphics,
        compute: dedicated_compute.unwrap_or(graphics),
        transfer: dedicated_transfer.or(dedicated_compute).unwrap_or(graphics),
    })
}

/// Create a logical device with one queue per distinct family.
fn create_logical_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    families: &QueueFamilies,
) -> Result<ash::Device, GpuError> {
    let queue_priorities = [1.0f32];
    let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = families
        .distinct()
        .into_iter()
        .map(|family| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family)
                .queue_priorities(&queue_priorities)
        })
        .collect();

    let features = vk::PhysicalDeviceFeatures::default();

    let mut vulkan_12_features =
        vk::PhysicalDeviceVulkan12Features::default().timeline_semaphore(true);

    let create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_features(&features)
        .push_next(&mut vulkan_12_features);

    let device =
        unsafe { instance.create_device(physical_device, &create_info, None) }.map_err(|e| {
            GpuError::InitializationFailed(format!("Failed to create logical device: {:?}", e))
        })?;

    Ok(device)
}
