//! Swapchain recreation and the acquire/present retry built on it
//!
//! The sequence is written against [`SwapchainHost`] so it runs the same
//! way for the device context and for test doubles:
//!
//! ```text
//! plan (zero extent -> Skipped) -> idle queues -> DestroySwapchain
//!      -> rebuild with old-swapchain chaining -> CreateSwapchain
//! ```

use ash::prelude::VkResult;
use ash::vk;

use super::swapchain::SwapchainSettings;
use crate::vulkan::initialization::LifecycleEvent;
use crate::vulkan::{SwapchainStatus, VulkanError, VulkanResult};

/// Owner of a swapchain that can rebuild it
pub trait SwapchainHost {
    /// Settings for the next swapchain, or `None` when the surface has no area
    fn plan_rebuild(&self) -> VulkanResult<Option<SwapchainSettings>>;

    /// Wait for the graphics queue, and the present queue when distinct
    fn idle_present_queues(&self) -> VulkanResult<()>;

    /// Run the observers registered for `event`
    fn notify_lifecycle(&mut self, event: LifecycleEvent);

    /// Replace the swapchain, views included
    fn rebuild_swapchain(&mut self, settings: SwapchainSettings) -> VulkanResult<()>;
}

/// Recreate the host's swapchain
///
/// A zero extent returns [`SwapchainStatus::Skipped`] before anything is
/// touched or any observer runs.
pub fn recreate_swapchain_on<H: SwapchainHost + ?Sized>(host: &mut H) -> VulkanResult<SwapchainStatus> {
    let Some(settings) = host.plan_rebuild()? else {
        log::debug!("Surface extent is zero, swapchain recreation skipped");
        return Ok(SwapchainStatus::Skipped);
    };

    host.idle_present_queues()?;
    host.notify_lifecycle(LifecycleEvent::DestroySwapchain);
    host.rebuild_swapchain(settings)?;
    host.notify_lifecycle(LifecycleEvent::CreateSwapchain);
    Ok(SwapchainStatus::Ready)
}

fn needs_recreate<T>(result: &VkResult<(T, bool)>) -> bool {
    matches!(result, Ok((_, true)) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR))
}

/// Acquire an image, recreating the swapchain and retrying once when it is stale
///
/// `acquire` returns the image index and whether the swapchain is
/// suboptimal. A stale result after the retry is accepted when it still
/// carries an image, otherwise it is [`VulkanError::SwapchainOutOfDate`].
pub fn acquire_with_recreate<H, F>(host: &mut H, mut acquire: F) -> VulkanResult<u32>
where
    H: SwapchainHost + ?Sized,
    F: FnMut(&mut H) -> VkResult<(u32, bool)>,
{
    let first = acquire(host);
    if !needs_recreate(&first) {
        return first.map(|(index, _)| index).map_err(VulkanError::from_surface_result);
    }

    log::debug!("Swapchain stale on acquire ({:?}), recreating", first.err());
    if !recreate_swapchain_on(host)?.is_ready() {
        return Err(VulkanError::SwapchainOutOfDate);
    }

    match acquire(host) {
        Ok((index, suboptimal)) => {
            if suboptimal {
                log::warn!("Swapchain still suboptimal after recreation");
            }
            Ok(index)
        }
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(VulkanError::SwapchainOutOfDate),
        Err(e) => Err(VulkanError::from_surface_result(e)),
    }
}

/// Present, recreating the swapchain once when it is stale
///
/// `present` returns whether the swapchain is suboptimal. A stale present
/// still succeeds once the swapchain was recreated or skipped.
pub fn present_with_recreate<H, F>(host: &mut H, present: F) -> VulkanResult<()>
where
    H: SwapchainHost + ?Sized,
    F: FnOnce(&mut H) -> VkResult<bool>,
{
    match present(host) {
        Ok(false) => Ok(()),
        Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
            log::debug!("Swapchain stale on present, recreating");
            recreate_swapchain_on(host).map(|_| ())
        }
        Err(e) => Err(VulkanError::from_surface_result(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> SwapchainSettings {
        SwapchainSettings {
            surface: vk::SurfaceKHR::null(),
            min_image_count: 3,
            surface_format: vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            extent: vk::Extent2D { width: 800, height: 600 },
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            pre_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            present_mode: vk::PresentModeKHR::FIFO,
        }
    }

    #[derive(Default)]
    struct MockHost {
        minimized: bool,
        fail_rebuild: bool,
        calls: Vec<&'static str>,
        rebuilds: usize,
    }

    impl SwapchainHost for MockHost {
        fn plan_rebuild(&self) -> VulkanResult<Option<SwapchainSettings>> {
            Ok((!self.minimized).then(settings))
        }

        fn idle_present_queues(&self) -> VulkanResult<()> {
            Ok(())
        }

        fn notify_lifecycle(&mut self, event: LifecycleEvent) {
            self.calls.push(match event {
                LifecycleEvent::DestroySwapchain => "destroy",
                LifecycleEvent::CreateSwapchain => "create",
                LifecycleEvent::CreateDevice | LifecycleEvent::DestroyDevice => "device",
            });
        }

        fn rebuild_swapchain(&mut self, _settings: SwapchainSettings) -> VulkanResult<()> {
            if self.fail_rebuild {
                return Err(VulkanError::SwapchainCreation(vk::Result::ERROR_NATIVE_WINDOW_IN_USE_KHR));
            }
            self.calls.push("rebuild");
            self.rebuilds += 1;
            Ok(())
        }
    }

    #[test]
    fn test_recreate_notifies_around_rebuild() {
        crate::foundation::logging::init_test_logging();
        let mut host = MockHost::default();
        assert_eq!(recreate_swapchain_on(&mut host).unwrap(), SwapchainStatus::Ready);
        assert_eq!(host.calls, vec!["destroy", "rebuild", "create"]);
    }

    #[test]
    fn test_zero_extent_skips_without_callbacks() {
        let mut host = MockHost {
            minimized: true,
            ..MockHost::default()
        };
        assert_eq!(recreate_swapchain_on(&mut host).unwrap(), SwapchainStatus::Skipped);
        assert!(host.calls.is_empty());
    }

    #[test]
    fn test_failed_rebuild_does_not_announce_creation() {
        let mut host = MockHost {
            fail_rebuild: true,
            ..MockHost::default()
        };
        assert!(recreate_swapchain_on(&mut host).is_err());
        assert_eq!(host.calls, vec!["destroy"]);
    }

    #[test]
    fn test_acquire_success_does_not_recreate() {
        let mut host = MockHost::default();
        let index = acquire_with_recreate(&mut host, |_| Ok((2, false))).unwrap();
        assert_eq!(index, 2);
        assert_eq!(host.rebuilds, 0);
    }

    #[test]
    fn test_acquire_out_of_date_recreates_once_and_retries() {
        let mut host = MockHost::default();
        let mut attempts = 0;
        let index = acquire_with_recreate(&mut host, |_| {
            attempts += 1;
            if attempts == 1 {
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR)
            } else {
                Ok((1, false))
            }
        })
        .unwrap();

        assert_eq!(index, 1);
        assert_eq!(attempts, 2);
        assert_eq!(host.rebuilds, 1);
    }

    #[test]
    fn test_acquire_suboptimal_recreates() {
        let mut host = MockHost::default();
        let mut attempts = 0;
        let index = acquire_with_recreate(&mut host, |_| {
            attempts += 1;
            Ok((attempts, attempts == 1))
        })
        .unwrap();

        assert_eq!(index, 2);
        assert_eq!(host.rebuilds, 1);
    }

    #[test]
    fn test_acquire_gives_up_after_one_retry() {
        let mut host = MockHost::default();
        let mut attempts = 0;
        let result = acquire_with_recreate(&mut host, |_| {
            attempts += 1;
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR)
        });

        assert!(matches!(result, Err(VulkanError::SwapchainOutOfDate)));
        assert_eq!(attempts, 2);
        assert_eq!(host.rebuilds, 1);
    }

    #[test]
    fn test_acquire_while_minimized_reports_out_of_date() {
        let mut host = MockHost {
            minimized: true,
            ..MockHost::default()
        };
        let mut attempts = 0;
        let result = acquire_with_recreate(&mut host, |_| {
            attempts += 1;
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR)
        });

        assert!(matches!(result, Err(VulkanError::SwapchainOutOfDate)));
        assert_eq!(attempts, 1);
        assert!(host.calls.is_empty());
    }

    #[test]
    fn test_acquire_other_errors_pass_through() {
        let mut host = MockHost::default();
        let result = acquire_with_recreate(&mut host, |_| Err(vk::Result::ERROR_DEVICE_LOST));
        assert!(matches!(result, Err(VulkanError::Api(vk::Result::ERROR_DEVICE_LOST))));

        let result = acquire_with_recreate(&mut host, |_| Err(vk::Result::ERROR_SURFACE_LOST_KHR));
        assert!(matches!(result, Err(VulkanError::SurfaceLost)));
        assert_eq!(host.rebuilds, 0);
    }

    #[test]
    fn test_present_stale_recreates_and_succeeds() {
        let mut host = MockHost::default();
        present_with_recreate(&mut host, |_| Err(vk::Result::ERROR_OUT_OF_DATE_KHR)).unwrap();
        present_with_recreate(&mut host, |_| Ok(true)).unwrap();
        assert_eq!(host.rebuilds, 2);

        present_with_recreate(&mut host, |_| Ok(false)).unwrap();
        assert_eq!(host.rebuilds, 2);
    }

    #[test]
    fn test_present_other_errors_pass_through() {
        let mut host = MockHost::default();
        let result = present_with_recreate(&mut host, |_| Err(vk::Result::ERROR_DEVICE_LOST));
        assert!(matches!(result, Err(VulkanError::Api(vk::Result::ERROR_DEVICE_LOST))));
        assert_eq!(host.rebuilds, 0);
    }
}
