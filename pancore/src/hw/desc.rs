use bytemuck::{Pod, Zeroable};

pub const MAX_DYNAMIC_STORAGE_BUFFERS: usize = 8;

/// Per-draw state shared by vertex, tiler and compute jobs.
#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub struct DrawDescriptor {
    pub flags: u32,
    pub offset_start: u32,
    /// Padded vertex count when instancing, 0 otherwise.
    pub instance_size: u32,
    pub instance_count: u32,
    /// Fragment renderer state for tiler jobs, shader program for vertex and compute jobs.
    pub renderer_state: u64,
    pub position: u64,
    pub varyings: u64,
    pub varying_buffers: u64,
    pub attributes: u64,
    pub attribute_buffers: u64,
    pub textures: u64,
    pub samplers: u64,
    pub uniform_buffers: u64,
    pub push_uniforms: u64,
    pub thread_storage: u64,
    pub fbd: u64,
    pub viewport: u64,
}

/// Uniform buffer table entry. Also used for dynamic storage buffers in the sysvals.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct UniformBuffer {
    pub pointer: u64,
    pub size: u32,
    pub _pad: u32,
}

pub const ATTRIBUTE_BUFFER_LINEAR: u32 = 1;
/// Per-vertex attribute buffer in an instanced draw: indexed modulo the padded vertex count.
pub const ATTRIBUTE_BUFFER_MODULO: u32 = 2;

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct AttributeBuffer {
    pub pointer: u64,
    pub kind: u32,
    pub stride: u32,
    pub size: u32,
    /// Instance divisor for per-instance buffers, padded vertex count for modulo buffers.
    pub divisor: u32,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct Attribute {
    pub buffer_index: u32,
    pub offset: u32,
    pub format: u32,
    pub _pad: u32,
}

pub const MAX_DISCARD_RECTANGLES: usize = 4;

/// Pixel area whose fragments are dropped. The max corner is exclusive, so the all-zero
/// rectangle drops nothing.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct DiscardRectangle {
    pub min_x: u16,
    pub min_y: u16,
    pub max_x: u16,
    pub max_y: u16,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct Viewport {
    pub min_x: u16,
    pub min_y: u16,
    /// Inclusive.
    pub max_x: u16,
    pub max_y: u16,
    pub min_depth: f32,
    pub max_depth: f32,
    pub discard_rectangles: [DiscardRectangle; MAX_DISCARD_RECTANGLES],
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct RendererState {
    pub shader: u64,
    pub flags: u32,
    /// Reference in bits 0..8, compare mask in bits 8..16, write mask in bits 16..24.
    pub stencil_front: u32,
    pub stencil_back: u32,
    pub depth_units: f32,
    pub depth_factor: f32,
    pub depth_bias_clamp: f32,
    pub blend_constants: [f32; 4],
    pub depth_bounds: [f32; 2],
}

impl RendererState {
    pub fn pack_stencil(reference: u8, compare_mask: u8, write_mask: u8) -> u32 {
        reference as u32 | (compare_mask as u32) << 8 | (write_mask as u32) << 16
    }
}

/// Graphics and compute system values, uploaded as uniform buffer 0.
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct Sysvals {
    pub viewport_scale: [f32; 4],
    pub viewport_offset: [f32; 4],
    pub blend_constants: [f32; 4],
    pub first_vertex: u32,
    pub base_vertex: i32,
    pub base_instance: u32,
    pub _pad: u32,
    pub num_work_groups: [u32; 4],
    pub local_group_size: [u32; 4],
    pub dyn_ssbos: [UniformBuffer; MAX_DYNAMIC_STORAGE_BUFFERS],
}

/// Thread-local and workgroup-local storage.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct LocalStorage {
    pub tls_base: u64,
    /// Per-thread stack size in bytes, 0 when no stack is needed.
    pub tls_size: u32,
    /// log2 of the number of workgroup instances.
    pub wls_instances_log2: u32,
    pub wls_base: u64,
    pub wls_size: u32,
    pub _pad: u32,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct TilerHeap {
    pub base: u64,
    pub top: u64,
    pub size: u32,
    pub _pad: u32,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct TilerContext {
    /// Heap descriptor on generations that have one, heap memory otherwise.
    pub heap: u64,
    pub fb_width: u32,
    pub fb_height: u32,
    pub hierarchy_mask: u32,
    pub sample_count: u32,
    pub polygon_list: u64,
}

pub const ZS_CLEAR_Z: u32 = 1 << 0;
pub const ZS_CLEAR_S: u32 = 1 << 1;
pub const ZS_PRELOAD_Z: u32 = 1 << 2;
pub const ZS_PRELOAD_S: u32 = 1 << 3;

/// Pre-frame shader mode: reload attachment contents before rendering the tiles.
pub const FBD_PRE_FRAME_PRELOAD: u32 = 1;

/// Framebuffer descriptor header, followed by `rt_count` render target descriptors.
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct FramebufferDescriptor {
    pub width: u32,
    pub height: u32,
    pub bound_min: u32,
    pub bound_max: u32,
    pub sample_count: u32,
    pub rt_count: u32,
    pub tiler: u64,
    pub thread_storage: u64,
    pub sample_positions: u64,
    pub zs_base: u64,
    pub s_base: u64,
    pub zs_flags: u32,
    pub z_clear: f32,
    pub s_clear: u32,
    pub pre_frame: u32,
}

pub const RT_CLEAR: u32 = 1 << 0;
pub const RT_PRELOAD: u32 = 1 << 1;

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct RenderTargetDescriptor {
    pub base: u64,
    pub row_stride: u32,
    pub format: u32,
    pub flags: u32,
    pub _pad: u32,
    pub clear_color: [u32; 4],
}

/// Opaque texture descriptor produced by the image-view code.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct TextureDescriptor(pub [u32; 8]);

/// Opaque sampler descriptor produced by the sampler code.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct SamplerDescriptor(pub [u32; 8]);

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn descriptor_sizes() {
        assert_eq!(size_of::<DrawDescriptor>(), 120);
        assert_eq!(size_of::<FramebufferDescriptor>(), 80);
        assert_eq!(size_of::<RenderTargetDescriptor>(), 40);
        assert_eq!(size_of::<Sysvals>(), 224);
    }
}
