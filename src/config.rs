//! Batch configuration
//!
//! Environment switches are resolved once into an immutable config object
//! handed to each batch at construction, so tests can vary them without
//! process-wide state.

/// Configuration switches for GPU culling behavior.
///
/// `freeze_culling` is a debug mode: the cull pass is suppressed while the
/// draw still executes from previously-computed counts, so culling results
/// can be inspected frame-to-frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    /// Enable GPU frustum culling
    pub enable_gpu_frustum_culling: bool,

    /// Enable the GPU visible-instance count query (diagnostic only;
    /// the readback blocks on GPU completion)
    pub enable_gpu_count_visible_instances: bool,

    /// Enable per-instance GPU frustum culling
    pub enable_gpu_instance_frustum_culling: bool,

    /// Suppress re-running the cull pass while still issuing the draw
    pub freeze_culling: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            enable_gpu_frustum_culling: true,
            enable_gpu_count_visible_instances: false,
            enable_gpu_instance_frustum_culling: true,
            freeze_culling: false,
        }
    }
}

impl BatchConfig {
    /// Resolve the configuration from environment variables once, at startup.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            enable_gpu_frustum_culling: env_flag(
                "MDI_ENABLE_GPU_FRUSTUM_CULLING",
                defaults.enable_gpu_frustum_culling,
            ),
            enable_gpu_count_visible_instances: env_flag(
                "MDI_ENABLE_GPU_COUNT_VISIBLE_INSTANCES",
                defaults.enable_gpu_count_visible_instances,
            ),
            enable_gpu_instance_frustum_culling: env_flag(
                "MDI_ENABLE_GPU_INSTANCE_FRUSTUM_CULLING",
                defaults.enable_gpu_instance_frustum_culling,
            ),
            freeze_culling: env_flag("MDI_FREEZE_CULLING", defaults.freeze_culling),
        }
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => parse_flag(&value, default),
        Err(_) => default,
    }
}

fn parse_flag(value: &str, default: bool) -> bool {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => true,
        "0" | "false" | "off" | "no" => false,
        _ => default,
    }
}
