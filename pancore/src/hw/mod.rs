//! Hardware descriptor encodings.
//!
//! Every structure here is `#[repr(C)]` and `Pod`: it is written as-is into GPU memory.
//! Pointers are 64-bit GPU virtual addresses, 0 meaning "none".
mod desc;
mod format;
mod invocation;
mod job;

pub use self::{
    desc::{
        Attribute, AttributeBuffer, DiscardRectangle, DrawDescriptor, FramebufferDescriptor,
        LocalStorage, RenderTargetDescriptor, RendererState, SamplerDescriptor, Sysvals,
        TextureDescriptor, TilerContext, TilerHeap, UniformBuffer, Viewport,
        ATTRIBUTE_BUFFER_LINEAR, ATTRIBUTE_BUFFER_MODULO, FBD_PRE_FRAME_PRELOAD,
        MAX_DISCARD_RECTANGLES, MAX_DYNAMIC_STORAGE_BUFFERS, RT_CLEAR, RT_PRELOAD, ZS_CLEAR_S,
        ZS_CLEAR_Z, ZS_PRELOAD_S, ZS_PRELOAD_Z,
    },
    format::Format,
    invocation::{padded_vertex_count, Invocation, SPLIT_MIN_EFFICIENT},
    job::{
        ComputeJobPayload, FragmentJobPayload, JobHeader, JobType, PrimitiveDescriptor,
        TilerJobPayload, VertexJobPayload, WriteValueJobPayload, JOB_HEADER_SIZE,
    },
};

/// Rounds `value` up to a multiple of `align` (a power of two).
pub const fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}
