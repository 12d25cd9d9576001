//! Vulkan resource management
//!
//! Every resource pairs one owned handle with one owned memory allocation,
//! created through the create, allocate, bind sequence.

/// Create/allocate/bind phase tracking
pub mod binding;

/// Buffer resources and their vertex, index, uniform and storage roles
pub mod buffer;

/// Command pools and recording
pub mod commands;

/// Descriptor set layouts, pools and sets
pub mod descriptor;

/// Pixel sizes and cached format properties
pub mod format;

/// Images and image views
pub mod image;

/// Device memory allocation and host mapping
pub mod memory;

/// Texture samplers
pub mod sampler;

/// SPIR-V shader modules
pub mod shader;

pub use binding::{BindPhase, MemoryBinding};
pub use buffer::{
    align_up, BufferResource, BufferRole, DeviceLocalBuffer, IndexBuffer, StorageBuffer, TypedBuffer, UniformBuffer,
    VertexBuffer, MAX_INLINE_UPDATE,
};
pub use commands::{CommandBuffer, CommandPool};
pub use descriptor::{DescriptorPool, DescriptorSet, DescriptorSetLayout, DescriptorSetLayoutBuilder};
pub use format::FormatTable;
pub use image::{ImageResource, ImageView};
pub use memory::{select_memory_type, MemoryAllocation};
pub use sampler::{Sampler, SamplerSettings};
pub use shader::ShaderModule;
