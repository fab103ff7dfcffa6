//! Command-buffer recording state.
//!
//! Recording calls only update [`CmdState`] and set dirty bits. The hardware tables a draw or
//! dispatch reads are produced by the `materialize_*` methods right before the jobs are
//! emitted, and only for the groups that changed since they were last uploaded.
mod dirty;
mod dynamic;
mod materialize;
mod tracker;

pub use self::{
    dirty::DirtyState,
    dynamic::{
        DepthBias, DynamicValues, Rect2D, StencilFaceState, StencilFaces, ViewportState,
        MAX_DISCARD_RECTANGLES,
    },
    materialize::MaterializeStats,
    tracker::{BoundSet, CmdState, DescriptorState, IndexType, MAX_VERTEX_BUFFERS},
};
pub(crate) use self::materialize::{ComputeInputs, GraphicsInputs, StateTables};
