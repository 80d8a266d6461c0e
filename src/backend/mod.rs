//! Graphics backend: shared GPU data layouts and the Vulkan
//! implementation.

pub mod types;
pub mod vulkan;
