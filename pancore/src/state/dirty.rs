use bitflags::bitflags;

bitflags! {
    /// Logical state groups whose hardware encoding must be regenerated before the next
    /// draw or dispatch.
    #[derive(Default)]
    pub struct DirtyState: u32 {
        const VIEWPORT = 1 << 0;
        const SCISSOR = 1 << 1;
        const LINE_WIDTH = 1 << 2;
        const DEPTH_BIAS = 1 << 3;
        const BLEND_CONSTANTS = 1 << 4;
        const DEPTH_BOUNDS = 1 << 5;
        const STENCIL_COMPARE_MASK = 1 << 6;
        const STENCIL_WRITE_MASK = 1 << 7;
        const STENCIL_REFERENCE = 1 << 8;
        const DISCARD_RECTANGLE = 1 << 9;

        const PIPELINE = 1 << 16;
        const VERTEX_BUFFERS = 1 << 17;
        const DESCRIPTOR_SETS = 1 << 18;
        const PUSH_CONSTANTS = 1 << 19;

        /// Every group that can be dynamic pipeline state.
        const DYNAMIC_ALL = (1 << 10) - 1;

        /// Groups encoded in the viewport descriptor.
        const VIEWPORT_DESCRIPTOR = Self::VIEWPORT.bits
            | Self::SCISSOR.bits
            | Self::DISCARD_RECTANGLE.bits;

        /// Groups encoded in the fragment renderer state.
        const RSD = Self::DEPTH_BIAS.bits
            | Self::BLEND_CONSTANTS.bits
            | Self::DEPTH_BOUNDS.bits
            | Self::STENCIL_COMPARE_MASK.bits
            | Self::STENCIL_WRITE_MASK.bits
            | Self::STENCIL_REFERENCE.bits;
    }
}
