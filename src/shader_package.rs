//! Embedded culling shader sources
//!
//! Shader lookup is a thin utility: sources are compiled into the binary
//! and specialized per configuration key by prepending module-scope
//! constants, so each distinct key yields a distinct module while the
//! bodies stay shared.

use crate::culling::CullingShaderKey;

pub const FRUSTUM_CULL: &str = include_str!("shaders/frustum_cull.wgsl");
pub const FRUSTUM_CULL_INSTANCED: &str = include_str!("shaders/frustum_cull_instanced.wgsl");

/// Shader module name for a culling configuration.
pub fn shader_name(key: &CullingShaderKey) -> &'static str {
    if key.use_instance_culling {
        "frustum_cull_instanced"
    } else {
        "frustum_cull"
    }
}

/// Assemble the WGSL source for a culling configuration.
pub fn culling_shader_source(key: &CullingShaderKey) -> String {
    let body = if key.use_instance_culling {
        FRUSTUM_CULL_INSTANCED
    } else {
        FRUSTUM_CULL
    };
    format!(
        "const COUNT_VISIBLE_INSTANCES: bool = {};\n\
         const ENABLE_TINY_PRIM_CULLING: bool = {};\n\n{}",
        key.count_visible_instances, key.tiny_prim_culling, body
    )
}
