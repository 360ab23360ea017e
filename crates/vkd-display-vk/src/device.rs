// SPDX-License-Identifier: CEPL-1.0
//! Instance, surface and logical device bootstrap.

use std::ffi::{c_char, c_void, CStr};
use std::fmt;

use ash::ext::debug_utils;
use ash::khr::{surface, swapchain};
use ash::{vk, Entry, Instance};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle};
use tracing::{debug, error, info, warn};

use crate::error::{DisplayError, DisplayResult};

const APP_NAME: &CStr = c"vkd";
const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// A physical device as reported by [`list_gpus`].
#[derive(Clone, Debug)]
pub struct GpuInfo {
    pub index: usize,
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
}

impl fmt::Display for GpuInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} ({:?})", self.index, self.name, self.device_type)
    }
}

/// Enumerates GPUs without creating a window or surface.
pub fn list_gpus() -> DisplayResult<Vec<GpuInfo>> {
    unsafe {
        let entry = Entry::load()?;
        let instance = create_instance(&entry, &[], false)?;
        let gpus = instance
            .enumerate_physical_devices()
            .map_err(DisplayError::vulkan("enumerate_physical_devices"));
        let infos = gpus.map(|gpus| {
            gpus.into_iter()
                .enumerate()
                .map(|(index, phys)| gpu_info(&instance, index, phys))
                .collect()
        });
        instance.destroy_instance(None);
        infos
    }
}

unsafe fn gpu_info(instance: &Instance, index: usize, phys: vk::PhysicalDevice) -> GpuInfo {
    let props = instance.get_physical_device_properties(phys);
    let name = props
        .device_name_as_c_str()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| String::from("<unnamed>"));
    GpuInfo {
        index,
        name,
        device_type: props.device_type,
    }
}

/// Everything one display needs from the driver, torn down in reverse order
/// once the last user is gone.
pub struct DeviceContext {
    /// Keeps the loader library mapped.
    _entry: Entry,
    instance: Instance,
    debug: Option<(debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    surface_loader: surface::Instance,
    surface: vk::SurfaceKHR,
    phys: vk::PhysicalDevice,
    gpu: GpuInfo,
    memory: vk::PhysicalDeviceMemoryProperties,
    queue_family: u32,
    device: ash::Device,
    queue: vk::Queue,
}

impl DeviceContext {
    pub fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        gpu_index: Option<usize>,
        validation: bool,
    ) -> DisplayResult<Self> {
        let dh = display.display_handle()?.as_raw();
        let wh = window.window_handle()?.as_raw();

        unsafe {
            let entry = Entry::load()?;
            let validation = validation && has_validation_layer(&entry);
            let instance = create_instance(&entry, &required_extensions(dh)?, validation)?;

            // From here on the partial context cleans up after itself on failure.
            let mut ctx = PartialContext {
                entry,
                instance,
                debug: None,
                surface: vk::SurfaceKHR::null(),
                armed: true,
            };
            if validation {
                ctx.debug = Some(create_debug_messenger(&ctx.entry, &ctx.instance)?);
            }
            ctx.surface = ash_window::create_surface(&ctx.entry, &ctx.instance, dh, wh, None)
                .map_err(DisplayError::vulkan("create_surface"))?;
            let surface_loader = surface::Instance::new(&ctx.entry, &ctx.instance);

            let (phys, queue_family, gpu) =
                select_gpu(&ctx.instance, &surface_loader, ctx.surface, gpu_index)?;
            let device = create_device(&ctx.instance, phys, queue_family)?;
            let queue = device.get_device_queue(queue_family, 0);
            let memory = ctx.instance.get_physical_device_memory_properties(phys);

            info!(gpu = %gpu.name, kind = ?gpu.device_type, queue_family, "Vulkan device ready");

            let (entry, instance, debug, surface) = ctx.into_parts();
            Ok(Self {
                _entry: entry,
                instance,
                debug,
                surface_loader,
                surface,
                phys,
                gpu,
                memory,
                queue_family,
                device,
                queue,
            })
        }
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.phys
    }

    pub fn gpu(&self) -> &GpuInfo {
        &self.gpu
    }

    /// Graphics queue that can also present to the surface. Only the display
    /// thread submits to it.
    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    pub fn surface(&self) -> vk::SurfaceKHR {
        self.surface
    }

    pub fn surface_loader(&self) -> &surface::Instance {
        &self.surface_loader
    }

    pub fn find_memory_type(&self, type_bits: u32, required: vk::MemoryPropertyFlags) -> Option<u32> {
        find_memory_type(&self.memory, type_bits, required)
    }

    pub fn format_properties(&self, format: vk::Format) -> vk::FormatProperties {
        unsafe {
            self.instance
                .get_physical_device_format_properties(self.phys, format)
        }
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        unsafe {
            self.device.device_wait_idle().ok();
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);
            if let Some((loader, messenger)) = self.debug.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Instance-level objects created before the device exists. Destroys them
/// on drop unless handed over with `into_parts`.
struct PartialContext {
    entry: Entry,
    instance: Instance,
    debug: Option<(debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    surface: vk::SurfaceKHR,
    armed: bool,
}

type InstanceParts = (
    Entry,
    Instance,
    Option<(debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    vk::SurfaceKHR,
);

impl PartialContext {
    fn into_parts(mut self) -> InstanceParts {
        self.armed = false;
        (
            self.entry.clone(),
            self.instance.clone(),
            self.debug.take(),
            self.surface,
        )
    }
}

impl Drop for PartialContext {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        unsafe {
            if self.surface != vk::SurfaceKHR::null() {
                surface::Instance::new(&self.entry, &self.instance)
                    .destroy_surface(self.surface, None);
            }
            if let Some((loader, messenger)) = self.debug.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

fn required_extensions(display: RawDisplayHandle) -> DisplayResult<Vec<*const c_char>> {
    let exts = ash_window::enumerate_required_extensions(display)
        .map_err(DisplayError::vulkan("enumerate_required_extensions"))?;
    Ok(exts.to_vec())
}

unsafe fn has_validation_layer(entry: &Entry) -> bool {
    let found = entry
        .enumerate_instance_layer_properties()
        .unwrap_or_default()
        .iter()
        .any(|layer| layer.layer_name_as_c_str() == Ok(VALIDATION_LAYER));
    if !found {
        warn!("validation requested but VK_LAYER_KHRONOS_validation is not installed");
    }
    found
}

unsafe fn create_instance(
    entry: &Entry,
    extensions: &[*const c_char],
    validation: bool,
) -> DisplayResult<Instance> {
    let app_info = vk::ApplicationInfo {
        s_type: vk::StructureType::APPLICATION_INFO,
        p_application_name: APP_NAME.as_ptr(),
        application_version: 0,
        p_engine_name: APP_NAME.as_ptr(),
        engine_version: 0,
        api_version: vk::API_VERSION_1_0,
        ..Default::default()
    };

    let mut ext_vec = extensions.to_vec();
    let layers = [VALIDATION_LAYER.as_ptr()];
    let (enabled_layer_count, pp_enabled_layer_names) = if validation {
        ext_vec.push(debug_utils::NAME.as_ptr());
        (layers.len() as u32, layers.as_ptr())
    } else {
        (0, std::ptr::null())
    };

    let create_info = vk::InstanceCreateInfo {
        s_type: vk::StructureType::INSTANCE_CREATE_INFO,
        p_application_info: &app_info,
        enabled_extension_count: ext_vec.len() as u32,
        pp_enabled_extension_names: ext_vec.as_ptr(),
        enabled_layer_count,
        pp_enabled_layer_names,
        ..Default::default()
    };

    entry
        .create_instance(&create_info, None)
        .map_err(DisplayError::vulkan("create_instance"))
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user: *mut c_void,
) -> vk::Bool32 {
    if data.is_null() || (*data).p_message.is_null() {
        return vk::FALSE;
    }
    let msg = CStr::from_ptr((*data).p_message).to_string_lossy();
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        error!(target: "vulkan", "{msg}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        warn!(target: "vulkan", "{msg}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        info!(target: "vulkan", "{msg}");
    } else {
        debug!(target: "vulkan", "{msg}");
    }
    vk::FALSE
}

unsafe fn create_debug_messenger(
    entry: &Entry,
    instance: &Instance,
) -> DisplayResult<(debug_utils::Instance, vk::DebugUtilsMessengerEXT)> {
    let loader = debug_utils::Instance::new(entry, instance);
    let ci = vk::DebugUtilsMessengerCreateInfoEXT {
        s_type: vk::StructureType::DEBUG_UTILS_MESSENGER_CREATE_INFO_EXT,
        message_severity: vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
            | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
            | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
            | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        message_type: vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
            | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
            | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        pfn_user_callback: Some(debug_callback),
        ..Default::default()
    };
    let messenger = loader
        .create_debug_utils_messenger(&ci, None)
        .map_err(DisplayError::vulkan("create_debug_utils_messenger"))?;
    Ok((loader, messenger))
}

/// What selection needs to know about one physical device.
#[derive(Clone, Copy, Debug)]
struct Candidate {
    device_type: vk::PhysicalDeviceType,
    /// Graphics family that can present to the surface, if the device is usable.
    queue_family: Option<u32>,
}

fn type_rank(device_type: vk::PhysicalDeviceType) -> u8 {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 0,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 1,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 2,
        vk::PhysicalDeviceType::CPU => 3,
        _ => 4,
    }
}

/// Explicit index first, else discrete, else integrated, else the first usable.
fn choose_gpu(candidates: &[Candidate], requested: Option<usize>) -> DisplayResult<usize> {
    if let Some(index) = requested {
        let candidate = candidates
            .get(index)
            .ok_or(DisplayError::GpuIndexOutOfRange {
                index,
                count: candidates.len(),
            })?;
        return match candidate.queue_family {
            Some(_) => Ok(index),
            None => Err(DisplayError::NoSuitableGpu),
        };
    }

    candidates
        .iter()
        .enumerate()
        .filter(|(_, c)| c.queue_family.is_some())
        .min_by_key(|(index, c)| (type_rank(c.device_type), *index))
        .map(|(index, _)| index)
        .ok_or(DisplayError::NoSuitableGpu)
}

unsafe fn present_queue_family(
    instance: &Instance,
    surface_loader: &surface::Instance,
    surface: vk::SurfaceKHR,
    phys: vk::PhysicalDevice,
) -> Option<u32> {
    let has_swapchain = instance
        .enumerate_device_extension_properties(phys)
        .unwrap_or_default()
        .iter()
        .any(|ext| ext.extension_name_as_c_str() == Ok(swapchain::NAME));
    if !has_swapchain {
        return None;
    }

    instance
        .get_physical_device_queue_family_properties(phys)
        .iter()
        .enumerate()
        .find(|(i, family)| {
            family.queue_flags.contains(vk::QueueFlags::GRAPHICS)
                && surface_loader
                    .get_physical_device_surface_support(phys, *i as u32, surface)
                    .unwrap_or(false)
        })
        .map(|(i, _)| i as u32)
}

unsafe fn select_gpu(
    instance: &Instance,
    surface_loader: &surface::Instance,
    surface: vk::SurfaceKHR,
    requested: Option<usize>,
) -> DisplayResult<(vk::PhysicalDevice, u32, GpuInfo)> {
    let physical = instance
        .enumerate_physical_devices()
        .map_err(DisplayError::vulkan("enumerate_physical_devices"))?;

    let candidates: Vec<Candidate> = physical
        .iter()
        .map(|&phys| Candidate {
            device_type: instance.get_physical_device_properties(phys).device_type,
            queue_family: present_queue_family(instance, surface_loader, surface, phys),
        })
        .collect();
    for (index, candidate) in candidates.iter().enumerate() {
        debug!(index, kind = ?candidate.device_type, usable = candidate.queue_family.is_some(), "GPU candidate");
    }

    let index = choose_gpu(&candidates, requested)?;
    let queue_family = candidates[index]
        .queue_family
        .ok_or(DisplayError::NoSuitableGpu)?;
    let phys = physical[index];
    Ok((phys, queue_family, gpu_info(instance, index, phys)))
}

unsafe fn create_device(
    instance: &Instance,
    phys: vk::PhysicalDevice,
    queue_family: u32,
) -> DisplayResult<ash::Device> {
    let priorities = [1.0_f32];
    let qinfo = vk::DeviceQueueCreateInfo {
        s_type: vk::StructureType::DEVICE_QUEUE_CREATE_INFO,
        queue_family_index: queue_family,
        queue_count: 1,
        p_queue_priorities: priorities.as_ptr(),
        ..Default::default()
    };

    let device_exts = [swapchain::NAME.as_ptr()];
    let dinfo = vk::DeviceCreateInfo {
        s_type: vk::StructureType::DEVICE_CREATE_INFO,
        queue_create_info_count: 1,
        p_queue_create_infos: &qinfo,
        enabled_extension_count: device_exts.len() as u32,
        pp_enabled_extension_names: device_exts.as_ptr(),
        ..Default::default()
    };

    instance
        .create_device(phys, &dinfo, None)
        .map_err(DisplayError::vulkan("create_device"))
}

fn find_memory_type(
    memory: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..memory.memory_type_count).find(|&i| {
        type_bits & (1 << i) != 0
            && memory.memory_types[i as usize]
                .property_flags
                .contains(required)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(device_type: vk::PhysicalDeviceType, usable: bool) -> Candidate {
        Candidate {
            device_type,
            queue_family: usable.then_some(0),
        }
    }

    #[test]
    fn test_prefers_discrete_then_integrated() {
        let gpus = [
            candidate(vk::PhysicalDeviceType::CPU, true),
            candidate(vk::PhysicalDeviceType::INTEGRATED_GPU, true),
            candidate(vk::PhysicalDeviceType::DISCRETE_GPU, true),
        ];
        assert_eq!(choose_gpu(&gpus, None).unwrap(), 2);
        assert_eq!(choose_gpu(&gpus[..2], None).unwrap(), 1);
        assert_eq!(choose_gpu(&gpus[..1], None).unwrap(), 0);
    }

    #[test]
    fn test_skips_unusable_devices() {
        let gpus = [
            candidate(vk::PhysicalDeviceType::DISCRETE_GPU, false),
            candidate(vk::PhysicalDeviceType::INTEGRATED_GPU, true),
        ];
        assert_eq!(choose_gpu(&gpus, None).unwrap(), 1);
        assert!(matches!(
            choose_gpu(&gpus[..1], None),
            Err(DisplayError::NoSuitableGpu)
        ));
    }

    #[test]
    fn test_first_wins_ties() {
        let gpus = [
            candidate(vk::PhysicalDeviceType::DISCRETE_GPU, true),
            candidate(vk::PhysicalDeviceType::DISCRETE_GPU, true),
        ];
        assert_eq!(choose_gpu(&gpus, None).unwrap(), 0);
    }

    #[test]
    fn test_explicit_index() {
        let gpus = [
            candidate(vk::PhysicalDeviceType::DISCRETE_GPU, true),
            candidate(vk::PhysicalDeviceType::INTEGRATED_GPU, true),
            candidate(vk::PhysicalDeviceType::CPU, false),
        ];
        assert_eq!(choose_gpu(&gpus, Some(1)).unwrap(), 1);
        assert!(matches!(
            choose_gpu(&gpus, Some(2)),
            Err(DisplayError::NoSuitableGpu)
        ));
        assert!(matches!(
            choose_gpu(&gpus, Some(5)),
            Err(DisplayError::GpuIndexOutOfRange { index: 5, count: 3 })
        ));
    }

    #[test]
    fn test_memory_type_respects_mask_and_flags() {
        let mut memory = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: 3,
            ..Default::default()
        };
        memory.memory_types[0].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        memory.memory_types[1].property_flags =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        memory.memory_types[2].property_flags = vk::MemoryPropertyFlags::HOST_VISIBLE
            | vk::MemoryPropertyFlags::HOST_COHERENT
            | vk::MemoryPropertyFlags::HOST_CACHED;

        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        assert_eq!(find_memory_type(&memory, 0b111, host), Some(1));
        assert_eq!(find_memory_type(&memory, 0b100, host), Some(2));
        assert_eq!(find_memory_type(&memory, 0b001, host), None);
    }
}
