//! Queue family resolution
//!
//! Resolution is a pure function of the families a physical device reports
//! and the capabilities requested, so repeated probing of an unchanged device
//! always yields the same indices. Results are cached per physical device,
//! including capabilities that were searched for and found missing.

use ash::vk;
use bitflags::bitflags;
use std::collections::HashMap;

use crate::vulkan::{VulkanError, VulkanResult};

bitflags! {
    /// Queue capabilities a caller needs from a physical device
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct QueueRequest: u8 {
        /// Graphics commands
        const GRAPHICS = 1;
        /// Compute dispatches
        const COMPUTE = 1 << 1;
        /// Presentation to the attached surface
        const PRESENT = 1 << 2;
    }
}

impl QueueRequest {
    /// Build a request from the usual graphics/compute toggles
    pub fn from_flags(want_graphics: bool, want_compute: bool, want_present: bool) -> Self {
        let mut request = Self::empty();
        request.set(Self::GRAPHICS, want_graphics);
        request.set(Self::COMPUTE, want_compute);
        request.set(Self::PRESENT, want_present);
        request
    }
}

/// State of one queue family index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueFamilySlot {
    /// Never requested, so never searched
    #[default]
    Unsearched,
    /// Searched for and not supported by any family
    Absent,
    /// Resolved family index
    Found(u32),
}

impl QueueFamilySlot {
    /// The family index, if one was found
    pub fn index(self) -> Option<u32> {
        match self {
            Self::Found(index) => Some(index),
            _ => None,
        }
    }

    fn or_search(self, search: impl FnOnce() -> Option<u32>) -> Self {
        match self {
            Self::Unsearched => search().map_or(Self::Absent, Self::Found),
            resolved => resolved,
        }
    }
}

/// Graphics, presentation and compute family indices of one physical device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueFamilyIndices {
    /// Family used for graphics and staged transfers
    pub graphics: QueueFamilySlot,
    /// Family used for presentation
    pub presentation: QueueFamilySlot,
    /// Family used for compute
    pub compute: QueueFamilySlot,
}

impl QueueFamilyIndices {
    /// Distinct family indices that need a queue create info, ascending
    pub fn unique_families(&self) -> Vec<u32> {
        let mut families: Vec<u32> = [self.graphics, self.presentation, self.compute]
            .into_iter()
            .filter_map(QueueFamilySlot::index)
            .collect();
        families.sort_unstable();
        families.dedup();
        families
    }

    /// Fail if any requested capability resolved to [`QueueFamilySlot::Absent`]
    pub fn require(&self, request: QueueRequest) -> VulkanResult<()> {
        let checks = [
            (QueueRequest::GRAPHICS, self.graphics, "graphics"),
            (QueueRequest::COMPUTE, self.compute, "compute"),
            (QueueRequest::PRESENT, self.presentation, "presentation"),
        ];
        for (capability, slot, name) in checks {
            if request.contains(capability) && slot.index().is_none() {
                return Err(VulkanError::NoCompatibleQueueFamily {
                    reason: format!("no queue family supports {name}"),
                });
            }
        }
        Ok(())
    }

    fn covers(&self, request: QueueRequest) -> bool {
        (!request.contains(QueueRequest::GRAPHICS) || self.graphics != QueueFamilySlot::Unsearched)
            && (!request.contains(QueueRequest::COMPUTE) || self.compute != QueueFamilySlot::Unsearched)
            && (!request.contains(QueueRequest::PRESENT) || self.presentation != QueueFamilySlot::Unsearched)
    }
}

/// What one queue family can do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyCapabilities {
    /// Queue flags reported by the driver
    pub flags: vk::QueueFlags,
    /// Whether the family can present to the attached surface
    pub supports_present: bool,
    /// Number of queues in the family
    pub queue_count: u32,
}

impl QueueFamilyCapabilities {
    fn supports(&self, request: QueueRequest) -> bool {
        self.queue_count > 0
            && (!request.contains(QueueRequest::GRAPHICS) || self.flags.contains(vk::QueueFlags::GRAPHICS))
            && (!request.contains(QueueRequest::COMPUTE) || self.flags.contains(vk::QueueFlags::COMPUTE))
            && (!request.contains(QueueRequest::PRESENT) || self.supports_present)
    }
}

fn first_supporting(families: &[QueueFamilyCapabilities], request: QueueRequest) -> Option<u32> {
    families
        .iter()
        .position(|family| family.supports(request))
        .map(|index| index as u32)
}

/// Resolve queue family indices for `request`
///
/// The lowest family supporting every requested capability wins all of them.
/// Otherwise graphics and compute prefer a shared family, presentation
/// prefers the graphics family, and each remaining slot takes the lowest
/// family that supports it. Unrequested slots stay
/// [`QueueFamilySlot::Unsearched`].
pub fn resolve_queue_families(
    families: &[QueueFamilyCapabilities],
    request: QueueRequest,
) -> QueueFamilyIndices {
    let mut indices = QueueFamilyIndices::default();
    if request.is_empty() {
        return indices;
    }

    if let Some(shared) = first_supporting(families, request) {
        let found = QueueFamilySlot::Found(shared);
        if request.contains(QueueRequest::GRAPHICS) {
            indices.graphics = found;
        }
        if request.contains(QueueRequest::COMPUTE) {
            indices.compute = found;
        }
        if request.contains(QueueRequest::PRESENT) {
            indices.presentation = found;
        }
        return indices;
    }

    let graphics_compute = QueueRequest::GRAPHICS | QueueRequest::COMPUTE;
    if request.contains(graphics_compute) {
        if let Some(shared) = first_supporting(families, graphics_compute) {
            indices.graphics = QueueFamilySlot::Found(shared);
            indices.compute = QueueFamilySlot::Found(shared);
        }
    }

    if request.contains(QueueRequest::GRAPHICS) {
        indices.graphics = indices
            .graphics
            .or_search(|| first_supporting(families, QueueRequest::GRAPHICS));
    }
    if request.contains(QueueRequest::COMPUTE) {
        indices.compute = indices
            .compute
            .or_search(|| first_supporting(families, QueueRequest::COMPUTE));
    }
    if request.contains(QueueRequest::PRESENT) {
        let graphics_presents = indices
            .graphics
            .index()
            .filter(|&index| families[index as usize].supports(QueueRequest::PRESENT));
        indices.presentation = indices
            .presentation
            .or_search(|| graphics_presents.or_else(|| first_supporting(families, QueueRequest::PRESENT)));
    }

    indices
}

#[derive(Debug, Clone, Copy)]
struct CachedResolution {
    request: QueueRequest,
    indices: QueueFamilyIndices,
}

/// Per-physical-device cache of resolved queue families
#[derive(Debug, Default)]
pub struct QueueFamilyCache {
    entries: HashMap<usize, CachedResolution>,
}

impl QueueFamilyCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `request` for the device at `device_index`
    ///
    /// `query` is only called when the cache cannot answer, either because
    /// the device was never queried or because `request` asks for a
    /// capability that was not searched before.
    pub fn resolve(
        &mut self,
        device_index: usize,
        request: QueueRequest,
        query: impl FnOnce() -> VulkanResult<Vec<QueueFamilyCapabilities>>,
    ) -> VulkanResult<QueueFamilyIndices> {
        if let Some(cached) = self.entries.get(&device_index) {
            if cached.indices.covers(request) {
                cached.indices.require(request)?;
                return Ok(cached.indices);
            }
        }

        let families = query()?;
        if families.iter().all(|family| family.queue_count == 0) {
            log::error!("Physical device {device_index} exposes no usable queue family");
            return Err(VulkanError::NoCompatibleQueueFamily {
                reason: format!("physical device {device_index} exposes no queue families"),
            });
        }

        let merged = self
            .entries
            .get(&device_index)
            .map_or(request, |cached| cached.request | request);
        let indices = resolve_queue_families(&families, merged);
        log::debug!("Resolved queue families for device {device_index}: {indices:?}");

        self.entries.insert(device_index, CachedResolution { request: merged, indices });
        indices.require(request)?;
        Ok(indices)
    }

    /// Cached indices for a device, if it has been queried
    pub fn get(&self, device_index: usize) -> Option<QueueFamilyIndices> {
        self.entries.get(&device_index).map(|cached| cached.indices)
    }

    /// Forget everything learned about a device
    pub fn invalidate(&mut self, device_index: usize) {
        self.entries.remove(&device_index);
    }

    /// Forget every device, e.g. after the surface changed
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags, supports_present: bool) -> QueueFamilyCapabilities {
        QueueFamilyCapabilities { flags, supports_present, queue_count: 1 }
    }

    const ALL: QueueRequest = QueueRequest::all();

    #[test]
    fn test_single_family_wins_everything() {
        let families = [
            family(vk::QueueFlags::TRANSFER, false),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, true),
        ];
        let indices = resolve_queue_families(&families, ALL);
        assert_eq!(indices.graphics, QueueFamilySlot::Found(1));
        assert_eq!(indices.compute, QueueFamilySlot::Found(1));
        assert_eq!(indices.presentation, QueueFamilySlot::Found(1));
        assert_eq!(indices.unique_families(), vec![1]);
    }

    #[test]
    fn test_split_families() {
        let families = [
            family(vk::QueueFlags::GRAPHICS, false),
            family(vk::QueueFlags::COMPUTE, false),
            family(vk::QueueFlags::TRANSFER, true),
        ];
        let indices = resolve_queue_families(&families, ALL);
        assert_eq!(indices.graphics, QueueFamilySlot::Found(0));
        assert_eq!(indices.compute, QueueFamilySlot::Found(1));
        assert_eq!(indices.presentation, QueueFamilySlot::Found(2));
        assert_eq!(indices.unique_families(), vec![0, 1, 2]);
    }

    #[test]
    fn test_presentation_prefers_graphics_family() {
        let families = [
            family(vk::QueueFlags::COMPUTE, true),
            family(vk::QueueFlags::GRAPHICS, true),
        ];
        let indices = resolve_queue_families(&families, QueueRequest::GRAPHICS | QueueRequest::PRESENT);
        assert_eq!(indices.graphics, QueueFamilySlot::Found(1));
        assert_eq!(indices.presentation, QueueFamilySlot::Found(1));
        assert_eq!(indices.compute, QueueFamilySlot::Unsearched);
    }

    #[test]
    fn test_only_required_slots_fail() {
        let families = [family(vk::QueueFlags::COMPUTE, false)];
        let indices = resolve_queue_families(&families, QueueRequest::COMPUTE | QueueRequest::GRAPHICS);
        assert_eq!(indices.graphics, QueueFamilySlot::Absent);
        assert_eq!(indices.compute, QueueFamilySlot::Found(0));

        assert!(indices.require(QueueRequest::COMPUTE).is_ok());
        assert!(indices.require(QueueRequest::GRAPHICS).is_err());
    }

    #[test]
    fn test_cache_answers_repeat_requests() {
        let mut cache = QueueFamilyCache::new();
        let families = vec![family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, false)];

        let first = cache
            .resolve(0, QueueRequest::GRAPHICS, || Ok(families.clone()))
            .unwrap();
        let second = cache
            .resolve(0, QueueRequest::GRAPHICS, || panic!("cache should answer"))
            .unwrap();
        assert_eq!(first, second);

        // Asking for more queries again and keeps the earlier capability
        let wider = cache
            .resolve(0, QueueRequest::GRAPHICS | QueueRequest::COMPUTE, || Ok(families.clone()))
            .unwrap();
        assert_eq!(wider.graphics, QueueFamilySlot::Found(0));
        assert_eq!(wider.compute, QueueFamilySlot::Found(0));
    }

    #[test]
    fn test_invalidate_forces_a_fresh_query() {
        let mut cache = QueueFamilyCache::new();
        let graphics = vec![family(vk::QueueFlags::GRAPHICS, false)];
        cache.resolve(1, QueueRequest::GRAPHICS, || Ok(graphics.clone())).unwrap();
        cache.resolve(2, QueueRequest::GRAPHICS, || Ok(graphics.clone())).unwrap();

        cache.invalidate(1);
        assert!(cache.get(1).is_none());
        assert!(cache.get(2).is_some());

        // The device now reports a different family layout
        let mut queried = false;
        let moved = vec![family(vk::QueueFlags::TRANSFER, false), family(vk::QueueFlags::GRAPHICS, false)];
        let indices = cache
            .resolve(1, QueueRequest::GRAPHICS, || {
                queried = true;
                Ok(moved)
            })
            .unwrap();
        assert!(queried);
        assert_eq!(indices.graphics, QueueFamilySlot::Found(1));
    }

    #[test]
    fn test_cache_remembers_absent() {
        let mut cache = QueueFamilyCache::new();
        let families = vec![family(vk::QueueFlags::COMPUTE, false)];

        assert!(cache.resolve(3, QueueRequest::GRAPHICS, || Ok(families.clone())).is_err());
        assert_eq!(cache.get(3).map(|i| i.graphics), Some(QueueFamilySlot::Absent));
        let again = cache.resolve(3, QueueRequest::GRAPHICS, || panic!("absent result is cached"));
        assert!(again.is_err());
    }

    #[test]
    fn test_no_families_is_fatal() {
        let mut cache = QueueFamilyCache::new();
        let err = cache.resolve(0, QueueRequest::GRAPHICS, || Ok(Vec::new())).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_resolution_stable_for_every_small_topology() {
        let options: Vec<QueueFamilyCapabilities> = [
            vk::QueueFlags::empty(),
            vk::QueueFlags::GRAPHICS,
            vk::QueueFlags::COMPUTE,
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
        ]
        .into_iter()
        .flat_map(|flags| [family(flags, false), family(flags, true)])
        .collect();

        let mut topologies: Vec<Vec<QueueFamilyCapabilities>> = options.iter().map(|f| vec![*f]).collect();
        for a in &options {
            for b in &options {
                topologies.push(vec![*a, *b]);
                for c in &options {
                    topologies.push(vec![*a, *b, *c]);
                }
            }
        }

        for families in &topologies {
            for bits in 1..=ALL.bits() {
                let request = QueueRequest::from_bits_truncate(bits);
                let indices = resolve_queue_families(families, request);
                assert_eq!(indices, resolve_queue_families(families, request));

                let mut cache = QueueFamilyCache::new();
                let cached = cache.resolve(0, request, || Ok(families.clone()));
                let repeated = cache.resolve(0, request, || panic!("repeated call must hit the cache"));
                assert_eq!(cached.is_ok(), repeated.is_ok());
                if let (Ok(first), Ok(second)) = (cached, repeated) {
                    assert_eq!(first, second);
                    assert_eq!(first, indices);
                }

                let slots = [
                    (QueueRequest::GRAPHICS, indices.graphics),
                    (QueueRequest::COMPUTE, indices.compute),
                    (QueueRequest::PRESENT, indices.presentation),
                ];
                for (capability, slot) in slots {
                    if !request.contains(capability) {
                        assert_eq!(slot, QueueFamilySlot::Unsearched);
                        continue;
                    }
                    let exists = first_supporting(families, capability).is_some();
                    match slot {
                        QueueFamilySlot::Found(index) => {
                            assert!(families[index as usize].supports(capability));
                        }
                        QueueFamilySlot::Absent => assert!(!exists),
                        QueueFamilySlot::Unsearched => panic!("requested slot left unsearched"),
                    }
                }

                if let Some(shared) = first_supporting(families, request) {
                    for (capability, slot) in slots {
                        if request.contains(capability) {
                            assert_eq!(slot, QueueFamilySlot::Found(shared));
                        }
                    }
                }
            }
        }
    }
}
