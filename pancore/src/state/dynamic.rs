use bitflags::bitflags;

pub use crate::hw::MAX_DISCARD_RECTANGLES;

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct Rect2D {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect2D {
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Rect2D {
        Rect2D {
            x,
            y,
            width,
            height,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct ViewportState {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct DepthBias {
    pub constant_factor: f32,
    pub clamp: f32,
    pub slope_factor: f32,
}

bitflags! {
    pub struct StencilFaces: u32 {
        const FRONT = 1 << 0;
        const BACK = 1 << 1;
        const FRONT_AND_BACK = Self::FRONT.bits | Self::BACK.bits;
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct StencilFaceState {
    pub compare_mask: u8,
    pub write_mask: u8,
    pub reference: u8,
}

impl Default for StencilFaceState {
    fn default() -> Self {
        StencilFaceState {
            compare_mask: 0xff,
            write_mask: 0xff,
            reference: 0,
        }
    }
}

/// Values of the state groups that a pipeline may leave dynamic.
///
/// Pipelines carry the baked values; command buffers carry the values set by the `set_*`
/// commands. Which one is used is decided per group by the pipeline's dynamic mask.
#[derive(Clone, Debug, PartialEq)]
pub struct DynamicValues {
    pub viewport: ViewportState,
    pub scissor: Rect2D,
    pub line_width: f32,
    pub depth_bias: DepthBias,
    pub blend_constants: [f32; 4],
    pub depth_bounds: [f32; 2],
    pub stencil_front: StencilFaceState,
    pub stencil_back: StencilFaceState,
    pub discard_rectangles: [Rect2D; MAX_DISCARD_RECTANGLES],
}

impl Default for DynamicValues {
    fn default() -> Self {
        DynamicValues {
            viewport: ViewportState::default(),
            scissor: Rect2D::default(),
            line_width: 1.0,
            depth_bias: DepthBias::default(),
            blend_constants: [0.0; 4],
            depth_bounds: [0.0, 1.0],
            stencil_front: StencilFaceState::default(),
            stencil_back: StencilFaceState::default(),
            discard_rectangles: [Rect2D::default(); MAX_DISCARD_RECTANGLES],
        }
    }
}

impl DynamicValues {
    pub(crate) fn stencil_faces_mut(
        &mut self,
        faces: StencilFaces,
    ) -> impl Iterator<Item = &mut StencilFaceState> {
        let front = faces.contains(StencilFaces::FRONT);
        let back = faces.contains(StencilFaces::BACK);
        let DynamicValues {
            stencil_front,
            stencil_back,
            ..
        } = self;
        std::iter::once(stencil_front)
            .filter(move |_| front)
            .chain(std::iter::once(stencil_back).filter(move |_| back))
    }
}
