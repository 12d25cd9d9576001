//! SPIR-V shader modules

use ash::vk;
use std::ffi::CStr;
use std::path::Path;

use crate::vulkan::handle::{destroy, OwnedHandle};
use crate::vulkan::initialization::DeviceAccess;
use crate::vulkan::{VulkanError, VulkanResult};

/// First word of every SPIR-V binary
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Default shader entry point
pub const DEFAULT_ENTRY_POINT: &CStr = c"main";

/// Decode SPIR-V bytecode into words
///
/// The byte length must be a non-zero multiple of four. Words are read in
/// native byte order, so the input slice itself need not be aligned.
pub fn spirv_words(code: &[u8]) -> VulkanResult<Vec<u32>> {
    if code.is_empty() {
        return Err(VulkanError::invalid("SPIR-V bytecode is empty"));
    }
    if code.len() % 4 != 0 {
        return Err(VulkanError::invalid(format!(
            "SPIR-V bytecode length {} is not a multiple of 4",
            code.len()
        )));
    }

    let words: Vec<u32> = code
        .chunks_exact(4)
        .map(|chunk| u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();

    if words[0] != SPIRV_MAGIC {
        return Err(VulkanError::invalid(format!(
            "bad SPIR-V magic number {:#010x}",
            words[0]
        )));
    }
    Ok(words)
}

/// Shader module wrapper with RAII cleanup
#[derive(Debug)]
pub struct ShaderModule {
    module: OwnedHandle<vk::ShaderModule>,
    word_count: usize,
}

impl ShaderModule {
    /// Create a shader module from SPIR-V bytecode
    pub fn new(access: &DeviceAccess, code: &[u8]) -> VulkanResult<Self> {
        let words = spirv_words(code)?;
        log::debug!("Creating shader module from {} SPIR-V words", words.len());

        let create_info = vk::ShaderModuleCreateInfo::builder().code(&words);
        let device = access.device();
        let module = unsafe {
            device.create_shader_module(&create_info, None)
                .map_err(VulkanError::Api)?
        };

        Ok(Self {
            module: OwnedHandle::new(device, module, destroy::shader_module),
            word_count: words.len(),
        })
    }

    /// Read a `.spv` file and create a shader module from it
    pub fn from_file(access: &DeviceAccess, path: impl AsRef<Path>) -> VulkanResult<Self> {
        let path = path.as_ref();
        let code = std::fs::read(path).map_err(|e| {
            VulkanError::invalid(format!("failed to read shader {}: {e}", path.display()))
        })?;
        Self::new(access, &code)
    }

    /// Get the shader module handle
    pub fn handle(&self) -> vk::ShaderModule {
        self.module.raw()
    }

    /// Size of the module in 32-bit words
    pub fn word_count(&self) -> usize {
        self.word_count
    }

    /// Stage description for pipeline creation
    ///
    /// `entry` must outlive the pipeline creation call.
    pub fn stage_info(&self, stage: vk::ShaderStageFlags, entry: &CStr) -> vk::PipelineShaderStageCreateInfo {
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(stage)
            .module(self.handle())
            .name(entry)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module_bytes(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_ne_bytes()).collect()
    }

    #[test]
    fn test_words_decode() {
        let bytes = module_bytes(&[SPIRV_MAGIC, 0x0001_0000, 7]);
        assert_eq!(spirv_words(&bytes).unwrap(), vec![SPIRV_MAGIC, 0x0001_0000, 7]);
    }

    #[test]
    fn test_unaligned_slice_is_accepted() {
        let mut bytes = vec![0u8];
        bytes.extend(module_bytes(&[SPIRV_MAGIC, 1]));
        assert_eq!(spirv_words(&bytes[1..]).unwrap(), vec![SPIRV_MAGIC, 1]);
    }

    #[test]
    fn test_rejects_bad_length() {
        assert!(spirv_words(&[]).is_err());

        let mut bytes = module_bytes(&[SPIRV_MAGIC, 1]);
        bytes.pop();
        let err = spirv_words(&bytes).unwrap_err();
        assert!(err.to_string().contains("multiple of 4"));
    }

    #[test]
    fn test_rejects_bad_magic() {
        let bytes = module_bytes(&[0xdead_beef, 1]);
        assert!(spirv_words(&bytes).is_err());
    }
}
