//! Vulkan context management
//!
//! [`DeviceContext`] is the root object. It walks through instance, device
//! and swapchain creation, recovers from stale swapchains and tears
//! everything down in reverse order. Subsystems that derive state from the
//! device or swapchain subscribe to its lifecycle events.

use ash::prelude::VkResult;
use ash::{vk, Entry, Instance};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::{CStr, CString};
use std::sync::atomic::{AtomicBool, Ordering};

use super::device::{DeviceAccess, DeviceCapabilities, LogicalDevice};
use super::instance::{
    available_extensions, available_layers, latest_api_version, InstanceNames, InstanceSettings,
    VulkanInstance,
};
use super::lifecycle::{LifecycleBus, LifecycleEvent};
use super::queue_family::{QueueFamilyCache, QueueFamilyCapabilities, QueueFamilyIndices, QueueRequest};
use super::surface::{required_surface_extensions, Surface};
use crate::config::ContextConfig;
use crate::vulkan::state::recreate::{
    acquire_with_recreate, present_with_recreate, recreate_swapchain_on, SwapchainHost,
};
use crate::vulkan::state::submit;
use crate::vulkan::state::swapchain::{choose_extent, is_zero_extent, match_surface_format, Swapchain, SwapchainSettings};
use crate::vulkan::state::sync::{Fence, Semaphore};
use crate::vulkan::transfer::{TransferPipeline, TransferSettings};
use crate::vulkan::{SwapchainStatus, VulkanError, VulkanResult};

/// Where a [`DeviceContext`] is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    /// Entry points loaded, nothing created
    Uninitialized,
    /// Instance created
    InstanceCreated,
    /// A physical device and its queue families were chosen
    DeviceSelected,
    /// Logical device created
    DeviceCreated,
    /// Swapchain created, no image acquired yet
    SwapchainCreated,
    /// At least one image was acquired
    Running,
    /// A swapchain rebuild is in progress
    Recreating,
    /// Everything was destroyed; the context cannot be reused
    Terminated,
}

/// Operations whose availability depends on the [`ContextState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextOperation {
    /// Request instance layers, extensions or the API version
    ConfigureInstance,
    /// Create the instance
    CreateInstance,
    /// Attach or adopt a surface
    AttachSurface,
    /// Choose a physical device
    SelectPhysicalDevice,
    /// Create the logical device
    CreateDevice,
    /// Destroy and rebuild the device and swapchain
    RecreateDevice,
    /// Create the first swapchain
    CreateSwapchain,
    /// Rebuild the swapchain
    RecreateSwapchain,
    /// Acquire a swapchain image
    AcquireImage,
    /// Present the acquired image
    PresentImage,
    /// Destroy everything
    Terminate,
}

impl ContextState {
    /// State the context is in once `operation` succeeds from `self`
    ///
    /// `None` means the operation is not allowed in this state. For
    /// [`ContextOperation::RecreateSwapchain`] the result is the state held
    /// while the rebuild runs; the previous state is restored afterwards.
    pub fn after(self, operation: ContextOperation) -> Option<Self> {
        use ContextOperation as Op;
        use ContextState as S;

        match (operation, self) {
            (Op::Terminate, _) => Some(S::Terminated),
            (Op::ConfigureInstance, S::Uninitialized) => Some(S::Uninitialized),
            (Op::CreateInstance, S::Uninitialized) => Some(S::InstanceCreated),
            (Op::AttachSurface, S::InstanceCreated | S::DeviceSelected) => Some(S::InstanceCreated),
            (Op::SelectPhysicalDevice, S::InstanceCreated | S::DeviceSelected) => Some(S::DeviceSelected),
            (Op::CreateDevice, S::DeviceSelected) => Some(S::DeviceCreated),
            (Op::RecreateDevice, S::DeviceCreated) => Some(S::DeviceCreated),
            (Op::RecreateDevice, S::SwapchainCreated | S::Running) => Some(S::SwapchainCreated),
            (Op::CreateSwapchain, S::DeviceCreated) => Some(S::SwapchainCreated),
            (Op::RecreateSwapchain, S::SwapchainCreated | S::Running) => Some(S::Recreating),
            (Op::AcquireImage, S::SwapchainCreated | S::Running) => Some(S::Running),
            (Op::PresentImage, S::Running) => Some(S::Running),
            _ => None,
        }
    }

    /// Whether `operation` may start from this state
    pub fn permits(self, operation: ContextOperation) -> bool {
        self.after(operation).is_some()
    }
}

static CONTEXT_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Process-wide token: at most one live context at a time
#[derive(Debug)]
struct ContextGuard;

impl ContextGuard {
    fn acquire() -> VulkanResult<Self> {
        CONTEXT_ACTIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| Self)
            .map_err(|_| VulkanError::invalid("a DeviceContext already exists in this process"))
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        CONTEXT_ACTIVE.store(false, Ordering::Release);
    }
}

/// Main Vulkan context that owns all core Vulkan resources
///
/// Field order matters for the fallback drop path: the swapchain goes
/// before the device, the device before the surface, the surface before the
/// instance.
pub struct DeviceContext {
    config: ContextConfig,
    state: ContextState,
    names: InstanceNames,
    api_version: u32,
    physical_devices: Vec<vk::PhysicalDevice>,
    selected_device: Option<usize>,
    queue_cache: QueueFamilyCache,
    indices: QueueFamilyIndices,
    preferred_format: Option<vk::SurfaceFormatKHR>,
    limit_frame_rate: bool,
    current_image_index: u32,
    observers: LifecycleBus<DeviceContext>,
    swapchain: Option<Swapchain>,
    device: Option<LogicalDevice>,
    surface: Option<Surface>,
    instance: Option<VulkanInstance>,
    entry: Entry,
    _guard: ContextGuard,
}

impl DeviceContext {
    /// Load the Vulkan entry points and create an empty context
    ///
    /// Fails if another context is alive in this process.
    pub fn new(config: ContextConfig) -> VulkanResult<Self> {
        config
            .validate()
            .map_err(|e| VulkanError::InitializationFailed(e.to_string()))?;
        let guard = ContextGuard::acquire()?;

        let entry = unsafe { Entry::load() }.map_err(|e| VulkanError::Loading(e.to_string()))?;
        log::debug!("Vulkan entry points loaded");

        Ok(Self {
            limit_frame_rate: config.limit_frame_rate,
            config,
            state: ContextState::Uninitialized,
            names: InstanceNames::new(),
            api_version: vk::API_VERSION_1_0,
            physical_devices: Vec::new(),
            selected_device: None,
            queue_cache: QueueFamilyCache::new(),
            indices: QueueFamilyIndices::default(),
            preferred_format: None,
            current_image_index: 0,
            observers: LifecycleBus::new(),
            swapchain: None,
            device: None,
            surface: None,
            instance: None,
            entry,
            _guard: guard,
        })
    }

    fn require_state(&self, operation: ContextOperation) -> VulkanResult<ContextState> {
        self.state.after(operation).ok_or_else(|| {
            VulkanError::invalid(format!("{operation:?} is not allowed in state {:?}", self.state))
        })
    }

    // Instance

    /// Request an instance layer; duplicates are ignored
    pub fn add_instance_layer(&mut self, name: &CStr) -> VulkanResult<()> {
        self.require_state(ContextOperation::ConfigureInstance)?;
        self.names.add_layer(name);
        Ok(())
    }

    /// Request an instance extension; duplicates are ignored
    pub fn add_instance_extension(&mut self, name: &CStr) -> VulkanResult<()> {
        self.require_state(ContextOperation::ConfigureInstance)?;
        self.names.add_extension(name);
        Ok(())
    }

    /// Request the instance extensions needed to present on `display`
    pub fn enable_surface_extensions(&mut self, display: RawDisplayHandle) -> VulkanResult<()> {
        for name in required_surface_extensions(display)? {
            self.add_instance_extension(name)?;
        }
        Ok(())
    }

    /// Drop requested names the driver does not offer and return them
    pub fn retain_available_instance_names(&mut self) -> VulkanResult<Vec<CString>> {
        self.require_state(ContextOperation::ConfigureInstance)?;
        let layers = available_layers(&self.entry)?;
        let extensions = available_extensions(&self.entry)?;
        let dropped = self.names.retain_available(&layers, &extensions);
        for name in &dropped {
            log::warn!("Instance layer/extension {name:?} is not available and was dropped");
        }
        Ok(dropped)
    }

    /// Fail if any requested name is unavailable
    pub fn require_instance_names(&self) -> VulkanResult<()> {
        let layers = available_layers(&self.entry)?;
        let extensions = available_extensions(&self.entry)?;
        match self.names.first_missing(&layers, &extensions) {
            Some(missing) => Err(VulkanError::MissingLayerOrExtension {
                name: missing.to_string_lossy().into_owned(),
            }),
            None => Ok(()),
        }
    }

    /// Request the highest API version the loader supports
    pub fn use_latest_api_version(&mut self) -> VulkanResult<u32> {
        self.require_state(ContextOperation::ConfigureInstance)?;
        self.api_version = latest_api_version(&self.entry);
        log::info!(
            "Using Vulkan API {}.{}",
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version)
        );
        Ok(self.api_version)
    }

    /// Create the instance with the requested names, plus validation when configured
    pub fn create_instance(&mut self) -> VulkanResult<()> {
        let next = self.require_state(ContextOperation::CreateInstance)?;

        let settings = InstanceSettings {
            application_name: self.config.application_name.clone(),
            application_version: self.config.packed_version(),
            api_version: self.api_version,
            enable_validation: self.config.validation_enabled(),
        };
        let instance = VulkanInstance::new(&self.entry, &settings, self.names.clone())?;
        self.names = instance.names().clone();
        self.instance = Some(instance);
        self.state = next;

        log::info!(
            "Vulkan instance created for '{}' ({} layers, {} extensions)",
            self.config.application_name,
            self.names.layers().len(),
            self.names.extensions().len()
        );
        Ok(())
    }

    // Surface

    /// Create a surface from raw window handles and attach it
    pub fn attach_surface(&mut self, display: RawDisplayHandle, window: RawWindowHandle) -> VulkanResult<()> {
        self.require_surface_slot()?;
        let surface = Surface::from_handles(&self.entry, self.instance()?, display, window)?;
        self.set_surface(surface);
        Ok(())
    }

    /// Take ownership of a surface created elsewhere and attach it
    pub fn adopt_surface(&mut self, surface: vk::SurfaceKHR) -> VulkanResult<()> {
        self.require_surface_slot()?;
        let surface = Surface::adopt(&self.entry, self.instance()?, surface);
        self.set_surface(surface);
        Ok(())
    }

    fn require_surface_slot(&self) -> VulkanResult<()> {
        self.require_state(ContextOperation::AttachSurface)?;
        if self.surface.is_some() {
            return Err(VulkanError::invalid("a surface is already attached"));
        }
        Ok(())
    }

    fn set_surface(&mut self, surface: Surface) {
        self.surface = Some(surface);
        // Presentation support depends on the surface
        self.queue_cache.clear();
        if self.state == ContextState::DeviceSelected {
            self.state = ContextState::InstanceCreated;
            self.selected_device = None;
        }
    }

    // Physical device

    /// Enumerate physical devices; none at all is fatal
    pub fn enumerate_physical_devices(&mut self) -> VulkanResult<&[vk::PhysicalDevice]> {
        let devices = unsafe {
            self.instance()?
                .enumerate_physical_devices()
                .map_err(VulkanError::Api)?
        };
        if devices.is_empty() {
            log::error!("No Vulkan physical device found");
            return Err(VulkanError::NoPhysicalDevice);
        }

        for (index, &device) in devices.iter().enumerate() {
            let capabilities = DeviceCapabilities::query(self.instance()?, device);
            log::debug!("Physical device {}: {}", index, capabilities.device_name());
        }
        self.physical_devices = devices;
        self.queue_cache.clear();
        Ok(&self.physical_devices)
    }

    fn physical_device(&self, index: usize) -> VulkanResult<vk::PhysicalDevice> {
        self.physical_devices.get(index).copied().ok_or_else(|| {
            VulkanError::invalid(format!(
                "physical device {index} out of range ({} enumerated)",
                self.physical_devices.len()
            ))
        })
    }

    /// Properties, limits and memory types of an enumerated device
    pub fn physical_device_capabilities(&self, index: usize) -> VulkanResult<DeviceCapabilities> {
        Ok(DeviceCapabilities::query(self.instance()?, self.physical_device(index)?))
    }

    /// Resolve queue families for an enumerated device
    ///
    /// Presentation is requested whenever a surface is attached. Results are
    /// cached per device; only requested capabilities can fail.
    pub fn resolve_queue_families(
        &mut self,
        physical_device_index: usize,
        want_graphics: bool,
        want_compute: bool,
    ) -> VulkanResult<QueueFamilyIndices> {
        let physical_device = self.physical_device(physical_device_index)?;
        let request = QueueRequest::from_flags(want_graphics, want_compute, self.surface.is_some());

        let instance = self
            .instance
            .as_ref()
            .ok_or_else(|| VulkanError::invalid("instance not created"))?;
        let surface = self.surface.as_ref();
        self.queue_cache.resolve(physical_device_index, request, || {
            query_queue_families(instance.instance(), surface, physical_device)
        })
    }

    /// Select an enumerated device for logical device creation
    pub fn select_physical_device(&mut self, index: usize) -> VulkanResult<()> {
        let next = self.require_state(ContextOperation::SelectPhysicalDevice)?;
        let indices = self.resolve_queue_families(index, self.config.want_graphics, self.config.want_compute)?;

        let physical_device = self.physical_device(index)?;
        if self.surface.is_some() && !supports_swapchain(self.instance()?, physical_device)? {
            return Err(VulkanError::MissingLayerOrExtension {
                name: ash::extensions::khr::Swapchain::name().to_string_lossy().into_owned(),
            });
        }

        self.selected_device = Some(index);
        self.indices = indices;
        self.state = next;
        log::info!(
            "Selected GPU {}: {}",
            index,
            self.physical_device_capabilities(index)?.device_name()
        );
        Ok(())
    }

    /// Select the first device that satisfies the configured queue request
    pub fn select_first_suitable(&mut self) -> VulkanResult<usize> {
        if self.physical_devices.is_empty() {
            self.enumerate_physical_devices()?;
        }

        let mut last_error = VulkanError::NoPhysicalDevice;
        for index in 0..self.physical_devices.len() {
            match self.select_physical_device(index) {
                Ok(()) => return Ok(index),
                Err(e) => {
                    log::warn!("Physical device {index} rejected: {e}");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    // Logical device

    /// Create the logical device and notify `CreateDevice` observers
    pub fn create_device(&mut self) -> VulkanResult<()> {
        let next = self.require_state(ContextOperation::CreateDevice)?;
        let index = self
            .selected_device
            .ok_or_else(|| VulkanError::invalid("no physical device selected"))?;
        let physical_device = self.physical_device(index)?;

        let device = LogicalDevice::new(self.instance()?, physical_device, self.indices, &[])?;
        self.device = Some(device);
        self.state = next;

        self.notify(LifecycleEvent::CreateDevice);
        Ok(())
    }

    /// Destroy and recreate the device, and the swapchain if there was one
    ///
    /// Queue families of the selected device are resolved again, so the new
    /// device does not reuse indices learned before the old one was lost.
    pub fn recreate_device(&mut self) -> VulkanResult<()> {
        self.require_state(ContextOperation::RecreateDevice)?;
        self.wait_idle()?;
        let index = self
            .selected_device
            .ok_or_else(|| VulkanError::invalid("no physical device selected"))?;

        let had_swapchain = self.swapchain.is_some();
        if had_swapchain {
            self.notify(LifecycleEvent::DestroySwapchain);
            self.swapchain = None;
        }
        self.notify(LifecycleEvent::DestroyDevice);
        self.device = None;
        self.state = ContextState::DeviceSelected;
        log::info!("Recreating logical device");

        self.queue_cache.invalidate(index);
        self.indices = self.resolve_queue_families(index, self.config.want_graphics, self.config.want_compute)?;

        self.create_device()?;
        if had_swapchain {
            self.create_swapchain(self.limit_frame_rate)?;
        }
        Ok(())
    }

    /// Block until the device is idle; a no-op without a device
    pub fn wait_idle(&self) -> VulkanResult<()> {
        match &self.device {
            Some(device) => device.access().wait_idle(),
            None => Ok(()),
        }
    }

    // Swapchain

    /// Create the swapchain and notify `CreateSwapchain` observers
    ///
    /// MAILBOX is used when `limit_frame_rate` is false and the surface
    /// offers it. A zero-sized surface returns [`SwapchainStatus::Skipped`].
    pub fn create_swapchain(&mut self, limit_frame_rate: bool) -> VulkanResult<SwapchainStatus> {
        let next = self.require_state(ContextOperation::CreateSwapchain)?;
        self.limit_frame_rate = limit_frame_rate;

        let Some(settings) = self.plan_swapchain()? else {
            log::debug!("Surface extent is zero, swapchain creation skipped");
            return Ok(SwapchainStatus::Skipped);
        };

        let device = self.device()?;
        let loader = device
            .swapchain_loader()
            .ok_or_else(|| VulkanError::invalid("device was created without presentation support"))?;
        let swapchain = Swapchain::new(device.device(), loader, settings)?;

        self.swapchain = Some(swapchain);
        self.state = next;
        self.notify(LifecycleEvent::CreateSwapchain);
        Ok(SwapchainStatus::Ready)
    }

    fn plan_swapchain(&self) -> VulkanResult<Option<SwapchainSettings>> {
        let surface = self.surface()?;
        let physical_device = self.access()?.capabilities().physical_device;

        let capabilities = surface.capabilities(physical_device)?;
        let fallback = self.config.default_extent();
        if is_zero_extent(choose_extent(&capabilities, fallback)) {
            return Ok(None);
        }

        let formats = surface.formats(physical_device)?;
        let present_modes = surface.present_modes(physical_device)?;
        SwapchainSettings::plan(
            surface.handle(),
            &capabilities,
            &formats,
            &present_modes,
            self.preferred_format,
            self.limit_frame_rate,
            fallback,
        )
        .map(Some)
    }

    /// Prefer `format`, recreating the swapchain if one exists
    ///
    /// An UNDEFINED format matches any format with the same color space.
    pub fn set_surface_format(&mut self, format: vk::SurfaceFormatKHR) -> VulkanResult<SwapchainStatus> {
        let physical_device = self.access()?.capabilities().physical_device;
        let formats = self.surface()?.formats(physical_device)?;
        let matched = match_surface_format(&formats, format)
            .ok_or(VulkanError::SwapchainCreation(vk::Result::ERROR_FORMAT_NOT_SUPPORTED))?;
        self.preferred_format = Some(matched);

        if self.swapchain.is_some() {
            self.recreate_swapchain()
        } else {
            Ok(SwapchainStatus::Ready)
        }
    }

    /// Rebuild the swapchain for the surface's current state
    ///
    /// A zero extent returns [`SwapchainStatus::Skipped`] and no observer
    /// runs. Otherwise the queues are idled, `DestroySwapchain` observers run,
    /// the swapchain is rebuilt and `CreateSwapchain` observers run.
    pub fn recreate_swapchain(&mut self) -> VulkanResult<SwapchainStatus> {
        let rebuilding = self.require_state(ContextOperation::RecreateSwapchain)?;
        let previous = self.state;
        self.state = rebuilding;
        let result = recreate_swapchain_on(self);
        self.state = previous;
        result
    }

    /// Acquire the next swapchain image, signaling `semaphore` and/or `fence`
    ///
    /// A stale swapchain is recreated once and the acquire retried.
    pub fn acquire_image(&mut self, semaphore: Option<&Semaphore>, fence: Option<&Fence>) -> VulkanResult<u32> {
        let next = self.require_state(ContextOperation::AcquireImage)?;
        self.swapchain_mut()?.destroy_retired();

        let semaphore = semaphore.map_or_else(vk::Semaphore::null, Semaphore::handle);
        let fence = fence.map_or_else(vk::Fence::null, Fence::handle);
        let index = acquire_with_recreate(self, |context| context.acquire_next(semaphore, fence))?;

        self.current_image_index = index;
        self.state = next;
        Ok(index)
    }

    fn acquire_next(&self, semaphore: vk::Semaphore, fence: vk::Fence) -> VkResult<(u32, bool)> {
        let Some(swapchain) = &self.swapchain else {
            return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
        };
        unsafe {
            swapchain
                .loader()
                .acquire_next_image(swapchain.handle(), u64::MAX, semaphore, fence)
        }
    }

    /// Present the current image after `wait` is signaled
    ///
    /// A stale swapchain is recreated and the present counts as done.
    pub fn present_image(&mut self, wait: Option<&Semaphore>) -> VulkanResult<()> {
        self.require_state(ContextOperation::PresentImage)?;
        let queue = self.access()?.queues().presentation()?.queue;
        let wait_semaphores: Vec<vk::Semaphore> = wait.map(Semaphore::handle).into_iter().collect();

        present_with_recreate(self, |context| {
            let Some(swapchain) = &context.swapchain else {
                return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
            };
            let swapchains = [swapchain.handle()];
            let image_indices = [context.current_image_index];
            let present_info = vk::PresentInfoKHR::builder()
                .wait_semaphores(&wait_semaphores)
                .swapchains(&swapchains)
                .image_indices(&image_indices);
            unsafe { swapchain.loader().queue_present(queue, &present_info) }
        })
    }

    // Submission

    /// Transfer settings derived from the configuration
    pub fn transfer_settings(&self) -> TransferSettings {
        TransferSettings::from(&self.config)
    }

    /// Create a transfer pipeline honoring the configured fence timeout and staging mode
    pub fn create_transfer_pipeline(&self) -> VulkanResult<TransferPipeline> {
        TransferPipeline::with_settings(self.access()?, self.transfer_settings())
    }

    /// Submit to the graphics queue
    pub fn submit_graphics(
        &self,
        command_buffer: vk::CommandBuffer,
        wait: Option<&Semaphore>,
        signal: Option<&Semaphore>,
        fence: Option<&Fence>,
    ) -> VulkanResult<()> {
        self.access()?.submit_graphics(command_buffer, wait, signal, fence)
    }

    /// Submit to the compute queue
    pub fn submit_compute(
        &self,
        command_buffer: vk::CommandBuffer,
        wait: Option<&Semaphore>,
        signal: Option<&Semaphore>,
        fence: Option<&Fence>,
    ) -> VulkanResult<()> {
        self.access()?.submit_compute(command_buffer, wait, signal, fence)
    }

    /// Submit to the presentation queue
    pub fn submit_presentation(
        &self,
        command_buffer: vk::CommandBuffer,
        wait: Option<&Semaphore>,
        signal: Option<&Semaphore>,
        fence: Option<&Fence>,
    ) -> VulkanResult<()> {
        self.access()?.submit_presentation(command_buffer, wait, signal, fence)
    }

    /// Record the release of the current swapchain image to the present family
    ///
    /// Records nothing when graphics and presentation share a family.
    pub fn cmd_transfer_image_ownership(&self, command_buffer: vk::CommandBuffer) -> VulkanResult<()> {
        let queues = self.access()?.queues();
        if !queues.presentation_is_separate() {
            return Ok(());
        }
        let image = self
            .swapchain()?
            .images()
            .get(self.current_image_index as usize)
            .copied()
            .ok_or_else(|| VulkanError::invalid("no swapchain image acquired"))?;

        submit::cmd_transfer_image_ownership(
            self.access()?.device(),
            command_buffer,
            image,
            queues.graphics()?.family,
            queues.presentation()?.family,
        );
        Ok(())
    }

    // Lifecycle

    /// Run `observer` on every `event`, after observers registered earlier
    pub fn subscribe<F>(&mut self, event: LifecycleEvent, observer: F)
    where
        F: FnMut(&DeviceContext) + 'static,
    {
        self.observers.subscribe(event, observer);
    }

    fn notify(&mut self, event: LifecycleEvent) {
        let mut observers = std::mem::take(&mut self.observers);
        observers.notify(event, self);
        self.observers = observers;
    }

    /// Destroy everything in reverse creation order
    ///
    /// Destroy observers run first, while the device is still alive.
    /// Calling this more than once is harmless.
    pub fn terminate(&mut self) {
        if self.state == ContextState::Terminated {
            return;
        }
        if let Err(e) = self.wait_idle() {
            log::warn!("Device did not idle before termination: {e}");
        }

        if self.swapchain.is_some() {
            self.notify(LifecycleEvent::DestroySwapchain);
        }
        if self.device.is_some() {
            self.notify(LifecycleEvent::DestroyDevice);
        }

        self.swapchain = None;
        self.device = None;
        self.surface = None;
        self.instance = None;

        self.observers.clear();
        self.queue_cache.clear();
        self.physical_devices.clear();
        self.selected_device = None;
        self.indices = QueueFamilyIndices::default();
        self.state = ContextState::Terminated;
        log::info!("Device context terminated");
    }

    // Accessors

    /// Current lifecycle state
    pub fn state(&self) -> ContextState {
        self.state
    }

    /// Configuration the context was created with
    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Loaded entry points
    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    /// Instance dispatch table
    pub fn instance(&self) -> VulkanResult<&Instance> {
        self.vulkan_instance().map(VulkanInstance::instance)
    }

    /// The instance wrapper
    pub fn vulkan_instance(&self) -> VulkanResult<&VulkanInstance> {
        self.instance
            .as_ref()
            .ok_or_else(|| VulkanError::invalid("instance not created"))
    }

    /// Requested (before creation) or enabled (after) instance names
    pub fn instance_names(&self) -> &InstanceNames {
        &self.names
    }

    /// API version requested for the instance
    pub fn api_version(&self) -> u32 {
        self.api_version
    }

    /// The attached surface
    pub fn surface(&self) -> VulkanResult<&Surface> {
        self.surface
            .as_ref()
            .ok_or_else(|| VulkanError::invalid("no surface attached"))
    }

    /// Enumerated physical devices
    pub fn physical_devices(&self) -> &[vk::PhysicalDevice] {
        &self.physical_devices
    }

    /// Index of the selected physical device
    pub fn selected_device(&self) -> Option<usize> {
        self.selected_device
    }

    /// Queue families of the selected device
    pub fn queue_family_indices(&self) -> QueueFamilyIndices {
        self.indices
    }

    /// The logical device
    pub fn device(&self) -> VulkanResult<&LogicalDevice> {
        self.device
            .as_ref()
            .ok_or_else(|| VulkanError::invalid("logical device not created"))
    }

    /// Device access handle for building resources
    pub fn access(&self) -> VulkanResult<&DeviceAccess> {
        self.device().map(LogicalDevice::access)
    }

    /// The swapchain
    pub fn swapchain(&self) -> VulkanResult<&Swapchain> {
        self.swapchain
            .as_ref()
            .ok_or_else(|| VulkanError::invalid("swapchain not created"))
    }

    fn swapchain_mut(&mut self) -> VulkanResult<&mut Swapchain> {
        self.swapchain
            .as_mut()
            .ok_or_else(|| VulkanError::invalid("swapchain not created"))
    }

    /// Index of the most recently acquired image
    pub fn current_image_index(&self) -> u32 {
        self.current_image_index
    }

    /// Whether presentation is capped to the display refresh rate
    pub fn limit_frame_rate(&self) -> bool {
        self.limit_frame_rate
    }
}

impl SwapchainHost for DeviceContext {
    fn plan_rebuild(&self) -> VulkanResult<Option<SwapchainSettings>> {
        self.plan_swapchain()
    }

    fn idle_present_queues(&self) -> VulkanResult<()> {
        let access = self.access()?;
        let queues = access.queues();
        let mut idle: Vec<vk::Queue> = Vec::with_capacity(2);
        for queue in [queues.graphics, queues.presentation].into_iter().flatten() {
            if !idle.contains(&queue.queue) {
                idle.push(queue.queue);
            }
        }
        for queue in idle {
            unsafe {
                access.device().queue_wait_idle(queue).map_err(VulkanError::Api)?;
            }
        }
        Ok(())
    }

    fn notify_lifecycle(&mut self, event: LifecycleEvent) {
        self.notify(event);
    }

    fn rebuild_swapchain(&mut self, settings: SwapchainSettings) -> VulkanResult<()> {
        self.swapchain_mut()?.rebuild(settings)
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn query_queue_families(
    instance: &Instance,
    surface: Option<&Surface>,
    physical_device: vk::PhysicalDevice,
) -> VulkanResult<Vec<QueueFamilyCapabilities>> {
    let families = unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
    families
        .iter()
        .enumerate()
        .map(|(index, family)| {
            let index = u32::try_from(index).map_err(|_| VulkanError::invalid("queue family index overflow"))?;
            let supports_present = match surface {
                Some(surface) => surface.supports_present(physical_device, index)?,
                None => false,
            };
            Ok(QueueFamilyCapabilities {
                flags: family.queue_flags,
                supports_present,
                queue_count: family.queue_count,
            })
        })
        .collect()
}

fn supports_swapchain(instance: &Instance, physical_device: vk::PhysicalDevice) -> VulkanResult<bool> {
    let extensions = unsafe {
        instance
            .enumerate_device_extension_properties(physical_device)
            .map_err(VulkanError::Api)?
    };
    let required = ash::extensions::khr::Swapchain::name();
    Ok(extensions.iter().any(|available| {
        let name = unsafe { CStr::from_ptr(available.extension_name.as_ptr()) };
        name == required
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATES: [ContextState; 8] = [
        ContextState::Uninitialized,
        ContextState::InstanceCreated,
        ContextState::DeviceSelected,
        ContextState::DeviceCreated,
        ContextState::SwapchainCreated,
        ContextState::Running,
        ContextState::Recreating,
        ContextState::Terminated,
    ];

    #[test]
    fn test_full_lifecycle_chain() {
        let chain = [
            (ContextOperation::ConfigureInstance, ContextState::Uninitialized),
            (ContextOperation::CreateInstance, ContextState::InstanceCreated),
            (ContextOperation::AttachSurface, ContextState::InstanceCreated),
            (ContextOperation::SelectPhysicalDevice, ContextState::DeviceSelected),
            (ContextOperation::SelectPhysicalDevice, ContextState::DeviceSelected),
            (ContextOperation::CreateDevice, ContextState::DeviceCreated),
            (ContextOperation::CreateSwapchain, ContextState::SwapchainCreated),
            (ContextOperation::AcquireImage, ContextState::Running),
            (ContextOperation::PresentImage, ContextState::Running),
            (ContextOperation::AcquireImage, ContextState::Running),
            (ContextOperation::RecreateDevice, ContextState::SwapchainCreated),
            (ContextOperation::Terminate, ContextState::Terminated),
        ];

        let mut state = ContextState::Uninitialized;
        for (operation, expected) in chain {
            state = state
                .after(operation)
                .unwrap_or_else(|| panic!("{operation:?} rejected in {state:?}"));
            assert_eq!(state, expected, "after {operation:?}");
        }
    }

    #[test]
    fn test_out_of_order_operations_are_rejected() {
        assert!(!ContextState::Uninitialized.permits(ContextOperation::CreateDevice));
        assert!(!ContextState::InstanceCreated.permits(ContextOperation::CreateDevice));
        assert!(!ContextState::DeviceCreated.permits(ContextOperation::AcquireImage));
        assert!(!ContextState::SwapchainCreated.permits(ContextOperation::PresentImage));
        assert!(!ContextState::DeviceCreated.permits(ContextOperation::AttachSurface));
        assert!(!ContextState::InstanceCreated.permits(ContextOperation::CreateInstance));
        assert!(!ContextState::InstanceCreated.permits(ContextOperation::ConfigureInstance));
        assert!(!ContextState::SwapchainCreated.permits(ContextOperation::CreateSwapchain));
    }

    #[test]
    fn test_surface_attach_resets_selection() {
        assert_eq!(
            ContextState::DeviceSelected.after(ContextOperation::AttachSurface),
            Some(ContextState::InstanceCreated)
        );
    }

    #[test]
    fn test_recreating_substate() {
        for from in [ContextState::SwapchainCreated, ContextState::Running] {
            assert_eq!(
                from.after(ContextOperation::RecreateSwapchain),
                Some(ContextState::Recreating)
            );
        }
        assert!(!ContextState::DeviceCreated.permits(ContextOperation::RecreateSwapchain));

        // Nothing but termination may start while a rebuild is running
        for operation in [
            ContextOperation::ConfigureInstance,
            ContextOperation::CreateInstance,
            ContextOperation::AttachSurface,
            ContextOperation::SelectPhysicalDevice,
            ContextOperation::CreateDevice,
            ContextOperation::RecreateDevice,
            ContextOperation::CreateSwapchain,
            ContextOperation::RecreateSwapchain,
            ContextOperation::AcquireImage,
            ContextOperation::PresentImage,
        ] {
            assert!(!ContextState::Recreating.permits(operation), "{operation:?}");
        }
        assert!(ContextState::Recreating.permits(ContextOperation::Terminate));
    }

    #[test]
    fn test_terminate_from_every_state() {
        for state in ALL_STATES {
            assert_eq!(
                state.after(ContextOperation::Terminate),
                Some(ContextState::Terminated),
                "from {state:?}"
            );
        }
        assert!(!ContextState::Terminated.permits(ContextOperation::CreateInstance));
        assert!(!ContextState::Terminated.permits(ContextOperation::AcquireImage));
    }

    #[test]
    fn test_recreate_device_keeps_setup_level() {
        assert_eq!(
            ContextState::DeviceCreated.after(ContextOperation::RecreateDevice),
            Some(ContextState::DeviceCreated)
        );
        assert!(!ContextState::DeviceSelected.permits(ContextOperation::RecreateDevice));
    }

    #[test]
    fn test_only_one_guard_at_a_time() {
        let guard = ContextGuard::acquire().unwrap();
        assert!(matches!(ContextGuard::acquire(), Err(VulkanError::InvalidOperation { .. })));
        drop(guard);

        let again = ContextGuard::acquire();
        assert!(again.is_ok());
    }
}
