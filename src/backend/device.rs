// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with optional validation layers
// - Window surface creation (owned here so teardown order is explicit)
// - Physical device selection (prefer discrete GPU)
// - Logical device + graphics/present/transfer queues

use anyhow::{Context, Result};
use ash::{vk, Entry};
use raw_window_handle::HasRawDisplayHandle;
use std::collections::BTreeSet;
use std::ffi::{CStr, CString};
use std::sync::Arc;

use super::error::RhiError;
use super::surface::{PresentationWindow, Surface, SurfaceSupport};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

fn required_device_extensions() -> [&'static CStr; 1] {
    [ash::extensions::khr::Swapchain::name()]
}

/// Features every selected adapter must support; the same set is enabled on
/// the logical device.
fn required_device_features() -> vk::PhysicalDeviceFeatures {
    vk::PhysicalDeviceFeatures::builder()
        .geometry_shader(true)
        .sampler_anisotropy(true)
        .build()
}

/// Queue families discovered on one adapter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: Option<u32>,
    pub present: Option<u32>,
    /// Transfer-only family (no graphics, no compute), when the adapter has one.
    pub transfer: Option<u32>,
}

impl QueueFamilyIndices {
    pub fn is_complete(&self) -> bool {
        self.graphics.is_some() && self.present.is_some()
    }
}

/// Scan the queue families once.
///
/// Presentation prefers the graphics family itself so both roles share a
/// queue when possible; otherwise the first family that can present wins.
pub fn find_queue_families(
    families: &[vk::QueueFamilyProperties],
    mut supports_present: impl FnMut(u32) -> bool,
) -> QueueFamilyIndices {
    let mut indices = QueueFamilyIndices::default();
    let mut first_present = None;

    for (i, family) in families.iter().enumerate() {
        let index = i as u32;
        if family.queue_count == 0 {
            continue;
        }

        let flags = family.queue_flags;
        if indices.graphics.is_none() && flags.contains(vk::QueueFlags::GRAPHICS) {
            indices.graphics = Some(index);
        }

        if indices.transfer.is_none()
            && flags.contains(vk::QueueFlags::TRANSFER)
            && !flags.intersects(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
        {
            indices.transfer = Some(index);
        }

        if first_present.is_none() && supports_present(index) {
            first_present = Some(index);
        }
    }

    indices.present = match (indices.graphics, first_present) {
        (Some(graphics), Some(_)) if supports_present(graphics) => Some(graphics),
        (_, present) => present,
    };

    indices
}

/// Returns the required extensions the adapter does not advertise.
pub fn missing_extensions<'a>(
    available: &[vk::ExtensionProperties],
    required: &[&'a CStr],
) -> Vec<&'a CStr> {
    required
        .iter()
        .copied()
        .filter(|&name| {
            !available.iter().any(|ext| {
                let ext_name = unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) };
                ext_name == name
            })
        })
        .collect()
}

pub fn check_device_features(features: &vk::PhysicalDeviceFeatures) -> bool {
    features.geometry_shader == vk::TRUE && features.sampler_anisotropy == vk::TRUE
}

/// Everything the selection predicate needs to know about one adapter.
#[derive(Debug, Clone)]
pub struct AdapterReport {
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub has_required_extensions: bool,
    pub has_required_features: bool,
    pub queue_families: QueueFamilyIndices,
    /// Surface format and present mode lists are non-empty (always true headless).
    pub surface_adequate: bool,
}

impl AdapterReport {
    pub fn is_suitable(&self) -> bool {
        self.has_required_extensions
            && self.has_required_features
            && self.queue_families.is_complete()
            && self.surface_adequate
    }
}

/// Index of the adapter to use: the first suitable discrete GPU, or the first
/// suitable adapter of any kind when no discrete one qualifies.
pub fn pick_adapter(reports: &[AdapterReport]) -> Option<usize> {
    reports
        .iter()
        .position(|r| r.is_suitable() && r.device_type == vk::PhysicalDeviceType::DISCRETE_GPU)
        .or_else(|| reports.iter().position(AdapterReport::is_suitable))
}

/// A failed surface query rejects the adapter instead of aborting selection.
pub fn support_is_adequate(query: Result<SurfaceSupport>) -> bool {
    match query {
        Ok(support) => support.is_adequate(),
        Err(e) => {
            log::debug!("Rejecting adapter, surface query failed: {:?}", e);
            false
        }
    }
}

/// Why selection failed: `PresentationUnsupported` when some adapter meets
/// every requirement except presenting to the surface.
pub fn selection_failure(reports: &[AdapterReport]) -> RhiError {
    let only_presentation_missing = reports.iter().any(|r| {
        r.has_required_extensions
            && r.has_required_features
            && r.queue_families.graphics.is_some()
            && r.queue_families.present.is_none()
    });

    if only_presentation_missing {
        RhiError::PresentationUnsupported
    } else {
        RhiError::NoSuitableDevice
    }
}

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    // Keeps the loader library mapped until the instance is destroyed
    _entry: Entry,

    surface: Option<Surface>,

    // Queue handles (may alias each other)
    pub graphics_queue: vk::Queue,
    pub graphics_queue_family: u32,
    pub present_queue: vk::Queue,
    pub present_queue_family: u32,
    pub transfer_queue: vk::Queue,
    pub transfer_queue_family: u32,

    debug_utils: Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,

    // Device properties (cached)
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl VulkanDevice {
    /// Create the Vulkan device.
    ///
    /// With a window the device is bound to its surface and must be able to
    /// present to it. Without one (`None`) the device is headless and the
    /// presentation queue aliases the graphics queue.
    pub fn new(
        app_name: &str,
        enable_validation: bool,
        window: Option<&dyn PresentationWindow>,
    ) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan device: {}", app_name);

        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        let enable_validation = enable_validation && Self::validation_layer_available(&entry);

        let instance = Self::create_instance(&entry, app_name, enable_validation, window)?;

        let debug_utils = if enable_validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        let surface = window
            .map(|w| Surface::new(&entry, &instance, w))
            .transpose()?;

        let (physical_device, families) =
            Self::pick_physical_device(&instance, surface.as_ref())?;

        let graphics_queue_family = families.graphics.ok_or(RhiError::NoSuitableDevice)?;
        let present_queue_family = families.present.ok_or(RhiError::NoSuitableDevice)?;
        // Uploads end with a fragment-stage barrier, so the transfer role
        // stays on the graphics family even when a dedicated one exists
        let transfer_queue_family = graphics_queue_family;

        let device = Self::create_logical_device(
            &instance,
            physical_device,
            &[graphics_queue_family, present_queue_family],
        )?;

        let (graphics_queue, present_queue) = unsafe {
            (
                device.get_device_queue(graphics_queue_family, 0),
                device.get_device_queue(present_queue_family, 0),
            )
        };
        let transfer_queue = graphics_queue;

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        log::info!(
            "Selected GPU: {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy()
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );
        log::info!(
            "Queue families: graphics={} present={} transfer={} (dedicated transfer family: {:?})",
            graphics_queue_family,
            present_queue_family,
            transfer_queue_family,
            families.transfer
        );

        Ok(Arc::new(Self {
            device,
            physical_device,
            instance,
            _entry: entry,
            surface,
            graphics_queue,
            graphics_queue_family,
            present_queue,
            present_queue_family,
            transfer_queue,
            transfer_queue_family,
            debug_utils,
            properties,
            memory_properties,
        }))
    }

    fn validation_layer_available(entry: &Entry) -> bool {
        let layers = entry.enumerate_instance_layer_properties().unwrap_or_default();
        let found = layers
            .iter()
            .any(|layer| unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) } == VALIDATION_LAYER);

        if !found {
            log::warn!("Validation requested but VK_LAYER_KHRONOS_validation is not installed");
        }
        found
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        enable_validation: bool,
        window: Option<&dyn PresentationWindow>,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;
        let engine_name = CString::new("RHI Renderer")?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_1);

        let mut extensions = match window {
            Some(w) => Surface::required_instance_extensions(w.raw_display_handle())?.to_vec(),
            None => Vec::new(),
        };
        if enable_validation {
            extensions.push(ash::extensions::ext::DebugUtils::name().as_ptr());
        }

        let layer_names = if enable_validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .map_err(|e| RhiError::vulkan("vkCreateInstance", e))
            .context("Failed to create Vulkan instance")?;

        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::extensions::ext::DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .context("Failed to create debug messenger")?;

        Ok((debug_utils, messenger))
    }

    fn pick_physical_device(
        instance: &ash::Instance,
        surface: Option<&Surface>,
    ) -> Result<(vk::PhysicalDevice, QueueFamilyIndices)> {
        let devices = unsafe { instance.enumerate_physical_devices() }
            .context("Failed to enumerate physical devices")?;

        if devices.is_empty() {
            log::error!("No Vulkan-capable GPU found");
            return Err(RhiError::NoSuitableDevice.into());
        }

        let required_extensions = required_device_extensions();
        let mut reports = Vec::with_capacity(devices.len());

        for &device in &devices {
            let report = Self::inspect_adapter(instance, device, surface, &required_extensions);
            log::debug!(
                "Adapter '{}' ({:?}): suitable={}",
                report.name,
                report.device_type,
                report.is_suitable()
            );
            reports.push(report);
        }

        match pick_adapter(&reports) {
            Some(index) => Ok((devices[index], reports[index].queue_families)),
            None => {
                log::error!("None of {} adapters satisfies the requirements", devices.len());
                Err(selection_failure(&reports).into())
            }
        }
    }

    fn inspect_adapter(
        instance: &ash::Instance,
        device: vk::PhysicalDevice,
        surface: Option<&Surface>,
        required_extensions: &[&CStr],
    ) -> AdapterReport {
        let props = unsafe { instance.get_physical_device_properties(device) };
        let features = unsafe { instance.get_physical_device_features(device) };
        let extensions = unsafe { instance.enumerate_device_extension_properties(device) }
            .unwrap_or_default();
        let families = unsafe { instance.get_physical_device_queue_family_properties(device) };

        let missing = missing_extensions(&extensions, required_extensions);
        let queue_families = find_queue_families(&families, |index| match surface {
            Some(surface) => surface.supports_present(device, index),
            // Headless: any graphics family stands in for presentation
            None => families[index as usize]
                .queue_flags
                .contains(vk::QueueFlags::GRAPHICS),
        });

        // Querying surface details is only valid once the swapchain extension exists
        let surface_adequate = match surface {
            Some(surface) if missing.is_empty() => support_is_adequate(surface.query_support(device)),
            Some(_) => false,
            None => true,
        };

        AdapterReport {
            name: unsafe { CStr::from_ptr(props.device_name.as_ptr()) }
                .to_string_lossy()
                .into_owned(),
            device_type: props.device_type,
            has_required_extensions: missing.is_empty(),
            has_required_features: check_device_features(&features),
            queue_families,
            surface_adequate,
        }
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        families: &[u32],
    ) -> Result<ash::Device> {
        let unique_families: BTreeSet<u32> = families.iter().copied().collect();
        let queue_priorities = [1.0];

        let queue_create_infos: Vec<_> = unique_families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        let extensions: Vec<_> = required_device_extensions()
            .iter()
            .map(|name| name.as_ptr())
            .collect();
        let features = required_device_features();

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .map_err(|e| RhiError::vulkan("vkCreateDevice", e))
            .context("Failed to create logical device")?;

        Ok(device)
    }

    /// The window surface; fails on a headless device.
    pub fn surface(&self) -> Result<&Surface> {
        self.surface
            .as_ref()
            .context("Device was created without a window surface")
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.context("vkDeviceWaitIdle failed")?;
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        let _ = self.wait_idle();

        // Reverse order: device, surface, debug messenger, instance
        unsafe {
            self.device.destroy_device(None);

            if let Some(surface) = self.surface.as_mut() {
                surface.destroy();
            }

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    fn extension(name: &CStr) -> vk::ExtensionProperties {
        let mut props = vk::ExtensionProperties::default();
        for (dst, &src) in props.extension_name.iter_mut().zip(name.to_bytes()) {
            *dst = src as std::os::raw::c_char;
        }
        props
    }

    fn suitable_report(device_type: vk::PhysicalDeviceType) -> AdapterReport {
        AdapterReport {
            name: "test".to_string(),
            device_type,
            has_required_extensions: true,
            has_required_features: true,
            queue_families: QueueFamilyIndices {
                graphics: Some(0),
                present: Some(0),
                transfer: None,
            },
            surface_adequate: true,
        }
    }

    #[test]
    fn graphics_family_is_reused_for_present_when_possible() {
        let families = [
            family(vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::GRAPHICS),
        ];

        let indices = find_queue_families(&families, |_| true);
        assert_eq!(indices.graphics, Some(1));
        assert_eq!(indices.present, Some(1));
        assert!(indices.is_complete());
    }

    #[test]
    fn present_falls_back_to_first_presenting_family() {
        let families = [
            family(vk::QueueFlags::GRAPHICS),
            family(vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::COMPUTE),
        ];

        let indices = find_queue_families(&families, |i| i >= 1);
        assert_eq!(indices.graphics, Some(0));
        assert_eq!(indices.present, Some(1));
    }

    #[test]
    fn selection_incomplete_without_presentation() {
        let families = [family(vk::QueueFlags::GRAPHICS)];
        let indices = find_queue_families(&families, |_| false);
        assert_eq!(indices.graphics, Some(0));
        assert_eq!(indices.present, None);
        assert!(!indices.is_complete());
    }

    #[test]
    fn dedicated_transfer_family_is_detected() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::TRANSFER | vk::QueueFlags::SPARSE_BINDING),
        ];

        let indices = find_queue_families(&families, |i| i == 0);
        assert_eq!(indices.transfer, Some(2));
    }

    #[test]
    fn empty_families_are_skipped() {
        let mut empty = family(vk::QueueFlags::GRAPHICS);
        empty.queue_count = 0;
        let families = [empty, family(vk::QueueFlags::GRAPHICS)];

        let indices = find_queue_families(&families, |_| true);
        assert_eq!(indices.graphics, Some(1));
        assert_eq!(indices.present, Some(1));
    }

    #[test]
    fn missing_extensions_reports_only_absent_names() {
        let swapchain = ash::extensions::khr::Swapchain::name();
        let other = c"VK_KHR_maintenance1";

        let available = [extension(other)];
        assert_eq!(missing_extensions(&available, &[swapchain, other]), vec![swapchain]);

        let available = [extension(other), extension(swapchain)];
        assert!(missing_extensions(&available, &[swapchain, other]).is_empty());
    }

    #[test]
    fn features_require_geometry_shader_and_anisotropy() {
        let mut features = vk::PhysicalDeviceFeatures::default();
        assert!(!check_device_features(&features));

        features.sampler_anisotropy = vk::TRUE;
        assert!(!check_device_features(&features));

        features.geometry_shader = vk::TRUE;
        assert!(check_device_features(&features));
    }

    #[test]
    fn pick_adapter_prefers_first_suitable_discrete() {
        let mut unsuitable_discrete = suitable_report(vk::PhysicalDeviceType::DISCRETE_GPU);
        unsuitable_discrete.has_required_features = false;

        let reports = [
            suitable_report(vk::PhysicalDeviceType::INTEGRATED_GPU),
            unsuitable_discrete,
            suitable_report(vk::PhysicalDeviceType::DISCRETE_GPU),
            suitable_report(vk::PhysicalDeviceType::DISCRETE_GPU),
        ];

        assert_eq!(pick_adapter(&reports), Some(2));
    }

    #[test]
    fn pick_adapter_falls_back_to_any_suitable() {
        let mut no_surface = suitable_report(vk::PhysicalDeviceType::DISCRETE_GPU);
        no_surface.surface_adequate = false;

        let reports = [no_surface, suitable_report(vk::PhysicalDeviceType::INTEGRATED_GPU)];
        assert_eq!(pick_adapter(&reports), Some(1));
    }

    #[test]
    fn pick_adapter_fails_when_nothing_qualifies() {
        let mut missing_ext = suitable_report(vk::PhysicalDeviceType::DISCRETE_GPU);
        missing_ext.has_required_extensions = false;
        let mut no_present = suitable_report(vk::PhysicalDeviceType::DISCRETE_GPU);
        no_present.queue_families.present = None;

        assert_eq!(pick_adapter(&[missing_ext, no_present]), None);
        assert_eq!(pick_adapter(&[]), None);
    }

    #[test]
    fn selection_failure_names_missing_presentation() {
        let mut no_present = suitable_report(vk::PhysicalDeviceType::DISCRETE_GPU);
        no_present.queue_families.present = None;
        assert!(matches!(
            selection_failure(&[no_present]),
            RhiError::PresentationUnsupported
        ));

        let mut no_features = suitable_report(vk::PhysicalDeviceType::DISCRETE_GPU);
        no_features.has_required_features = false;
        no_features.queue_families.present = None;
        assert!(matches!(
            selection_failure(&[no_features]),
            RhiError::NoSuitableDevice
        ));
        assert!(matches!(selection_failure(&[]), RhiError::NoSuitableDevice));
    }

    #[test]
    fn failed_surface_query_rejects_only_that_adapter() {
        let failed = support_is_adequate(Err(anyhow::anyhow!("VK_ERROR_SURFACE_LOST_KHR")));
        assert!(!failed);

        let supported = SurfaceSupport {
            capabilities: vk::SurfaceCapabilitiesKHR::default(),
            formats: vec![vk::SurfaceFormatKHR::default()],
            present_modes: vec![vk::PresentModeKHR::FIFO],
        };
        assert!(support_is_adequate(Ok(supported)));

        let mut query_failed = suitable_report(vk::PhysicalDeviceType::DISCRETE_GPU);
        query_failed.surface_adequate = failed;

        let reports = [query_failed, suitable_report(vk::PhysicalDeviceType::INTEGRATED_GPU)];
        assert_eq!(pick_adapter(&reports), Some(1));
    }
}
