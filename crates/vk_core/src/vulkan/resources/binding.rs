//! The create → allocate → bind protocol shared by buffers and images
//!
//! A resource is built in three steps and each one only runs if the previous
//! one succeeded. A failed step leaves the resource where it was, unbound and
//! safe to drop.

use ash::prelude::VkResult;
use ash::vk;

use super::memory::MemoryAllocation;
use crate::vulkan::initialization::DeviceAccess;
use crate::vulkan::{VulkanError, VulkanResult};

/// How far a resource got through construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BindPhase {
    /// The buffer/image handle exists, no memory yet
    HandleCreated,
    /// Memory is allocated but not bound
    MemoryAllocated,
    /// Memory is bound; the resource is usable
    Bound,
}

impl BindPhase {
    /// Fail unless the resource is exactly at `expected`
    pub fn require(self, expected: Self, operation: &str) -> VulkanResult<()> {
        if self == expected {
            Ok(())
        } else {
            Err(VulkanError::invalid(format!(
                "{operation} requires phase {expected:?}, resource is at {self:?}"
            )))
        }
    }
}

/// Memory half of a resource plus its construction phase
#[derive(Debug)]
pub struct MemoryBinding {
    memory: Option<MemoryAllocation>,
    phase: BindPhase,
}

impl Default for MemoryBinding {
    fn default() -> Self {
        Self {
            memory: None,
            phase: BindPhase::HandleCreated,
        }
    }
}

impl MemoryBinding {
    /// Allocate memory for `requirements`, trying each property set in order
    pub fn allocate(
        &mut self,
        access: &DeviceAccess,
        requirements: vk::MemoryRequirements,
        candidates: &[vk::MemoryPropertyFlags],
    ) -> VulkanResult<()> {
        self.phase.require(BindPhase::HandleCreated, "allocate_memory")?;

        let mut last_error = VulkanError::NoSuitableMemoryType;
        for &desired in candidates {
            match MemoryAllocation::allocate(access, requirements, desired) {
                Ok(memory) => {
                    self.memory = Some(memory);
                    self.phase = BindPhase::MemoryAllocated;
                    return Ok(());
                }
                Err(e) => {
                    log::debug!("Allocation with {desired:?} failed: {e}");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// Bind through `bind`, which receives the memory handle
    pub fn bind(&mut self, bind: impl FnOnce(vk::DeviceMemory) -> VkResult<()>) -> VulkanResult<()> {
        self.phase.require(BindPhase::MemoryAllocated, "bind_memory")?;
        let memory = self
            .memory
            .as_mut()
            .ok_or_else(|| VulkanError::invalid("bind_memory without an allocation"))?;

        bind(memory.handle()).map_err(VulkanError::BindFailed)?;
        memory.mark_bound();
        self.phase = BindPhase::Bound;
        Ok(())
    }

    /// Current construction phase
    pub fn phase(&self) -> BindPhase {
        self.phase
    }

    /// Whether create, allocate and bind all succeeded
    pub fn is_bound(&self) -> bool {
        self.phase == BindPhase::Bound
    }

    /// The allocation, once one exists
    pub fn memory(&self) -> Option<&MemoryAllocation> {
        self.memory.as_ref()
    }

    /// The allocation of a bound resource
    pub fn bound_memory(&self) -> VulkanResult<&MemoryAllocation> {
        self.phase.require(BindPhase::Bound, "memory access")?;
        self.memory
            .as_ref()
            .ok_or_else(|| VulkanError::invalid("bound resource without an allocation"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_requirements() {
        assert!(BindPhase::HandleCreated.require(BindPhase::HandleCreated, "allocate").is_ok());
        assert!(BindPhase::HandleCreated.require(BindPhase::MemoryAllocated, "bind").is_err());
        assert!(BindPhase::Bound.require(BindPhase::MemoryAllocated, "bind").is_err());
        assert!(BindPhase::HandleCreated < BindPhase::Bound);
    }

    #[test]
    fn test_fresh_binding_is_inert() {
        let mut binding = MemoryBinding::default();
        assert!(!binding.is_bound());
        assert!(binding.memory().is_none());
        assert!(binding.bound_memory().is_err());

        // Binding before allocating is rejected and leaves the phase alone
        let mut called = false;
        let result = binding.bind(|_| {
            called = true;
            Ok(())
        });
        assert!(matches!(result, Err(VulkanError::InvalidOperation { .. })));
        assert!(!called);
        assert_eq!(binding.phase(), BindPhase::HandleCreated);
    }
}
