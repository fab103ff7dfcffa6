use crate::{
    descriptor::DescriptorSet,
    hw::Sysvals,
    pipeline::{BindPoint, Pipeline, MAX_BIND_POINTS, MAX_PUSH_CONSTANTS_SIZE, MAX_SETS},
    resource::Buffer,
    state::{
        materialize::{AttribKey, MaterializeStats},
        DepthBias, DirtyState, DynamicValues, Rect2D, StencilFaces, ViewportState,
        MAX_DISCARD_RECTANGLES,
    },
    Error,
};
use pankmod::BoHandle;
use std::{fmt, sync::Arc};

pub const MAX_VERTEX_BUFFERS: usize = 16;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IndexType {
    U8,
    U16,
    U32,
}

impl IndexType {
    pub fn size(self) -> u32 {
        match self {
            IndexType::U8 => 1,
            IndexType::U16 => 2,
            IndexType::U32 => 4,
        }
    }
}

/// A descriptor set bound at some slot, with the dynamic offsets it was bound with.
#[derive(Clone, Debug)]
pub struct BoundSet {
    pub set: Arc<DescriptorSet>,
    /// Offsets of the dynamic uniform buffers, then of the dynamic storage buffers.
    pub dynamic_offsets: Vec<u32>,
}

/// Per-bind-point state: pipeline, descriptor sets and the tables last uploaded for them.
///
/// The table addresses are `None` until first materialized. They stay valid until the
/// command buffer pools are reset.
#[derive(Default)]
pub struct DescriptorState {
    pub(crate) pipeline: Option<Arc<Pipeline>>,
    pub(crate) sets: [Option<BoundSet>; MAX_SETS],
    pub(crate) dirty: DirtyState,
    pub(crate) sysvals: Option<u64>,
    pub(crate) sysval_values: Sysvals,
    pub(crate) push_constants: Option<u64>,
    pub(crate) ubos: Option<u64>,
    pub(crate) textures: Option<u64>,
    pub(crate) samplers: Option<u64>,
    pub(crate) vs_attribs: Option<u64>,
    pub(crate) vs_attrib_bufs: Option<u64>,
    pub(crate) attrib_key: Option<AttribKey>,
}

impl DescriptorState {
    pub fn pipeline(&self) -> Option<&Arc<Pipeline>> {
        self.pipeline.as_ref()
    }

    pub fn dirty(&self) -> DirtyState {
        self.dirty
    }

    pub fn set(&self, index: usize) -> Option<&BoundSet> {
        self.sets.get(index).and_then(Option::as_ref)
    }
}

impl fmt::Debug for DescriptorState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DescriptorState")
            .field("pipeline", &self.pipeline.as_ref().map(|p| p.bind_point))
            .field("dirty", &self.dirty)
            .field("sysvals", &self.sysvals)
            .field("ubos", &self.ubos)
            .field("textures", &self.textures)
            .field("samplers", &self.samplers)
            .finish()
    }
}

/// Logical state accumulated by a command buffer.
///
/// Cmd-level `dirty` tracks the dynamic state groups and the vertex input bindings. Pipeline,
/// descriptor-set and push-constant changes are tracked per bind point.
pub struct CmdState {
    pub(crate) dirty: DirtyState,
    pub(crate) bind_points: [DescriptorState; MAX_BIND_POINTS],
    pub(crate) vertex_buffers: [Option<Buffer>; MAX_VERTEX_BUFFERS],
    pub(crate) index_buffer: Option<(Buffer, IndexType)>,
    pub(crate) push_constants: [u8; MAX_PUSH_CONSTANTS_SIZE],
    pub(crate) dynamic: DynamicValues,
    /// Viewport descriptor.
    pub(crate) vpd: Option<u64>,
    /// Fragment renderer state.
    pub(crate) fs_rsd: Option<u64>,
    pub(crate) stats: MaterializeStats,
}

impl Default for CmdState {
    fn default() -> Self {
        CmdState::new()
    }
}

impl CmdState {
    pub fn new() -> CmdState {
        CmdState {
            dirty: DirtyState::empty(),
            bind_points: Default::default(),
            vertex_buffers: Default::default(),
            index_buffer: None,
            push_constants: [0; MAX_PUSH_CONSTANTS_SIZE],
            dynamic: DynamicValues::default(),
            vpd: None,
            fs_rsd: None,
            stats: MaterializeStats::default(),
        }
    }

    /// Forgets everything, including the materialized tables.
    pub fn reset(&mut self) {
        *self = CmdState::new();
    }

    pub fn dirty(&self) -> DirtyState {
        self.dirty
    }

    pub fn stats(&self) -> MaterializeStats {
        self.stats
    }

    pub fn dynamic(&self) -> &DynamicValues {
        &self.dynamic
    }

    pub fn descriptor_state(&self, bind_point: BindPoint) -> &DescriptorState {
        &self.bind_points[bind_point as usize]
    }

    pub fn pipeline(&self, bind_point: BindPoint) -> Option<&Arc<Pipeline>> {
        self.bind_points[bind_point as usize].pipeline.as_ref()
    }

    pub fn bind_pipeline(&mut self, pipeline: Arc<Pipeline>) {
        let bind_point = pipeline.bind_point;
        let ds = &mut self.bind_points[bind_point as usize];

        let layout_changed = match &ds.pipeline {
            Some(current) if Arc::ptr_eq(current, &pipeline) => return,
            Some(current) => !Arc::ptr_eq(&current.layout, &pipeline.layout),
            None => true,
        };
        if layout_changed {
            // table layouts depend on the pipeline layout
            ds.dirty |= DirtyState::DESCRIPTOR_SETS | DirtyState::PUSH_CONSTANTS;
        }
        ds.dirty |= DirtyState::PIPELINE;
        ds.pipeline = Some(pipeline);

        if bind_point == BindPoint::Graphics {
            self.dirty |= DirtyState::DYNAMIC_ALL;
        }
    }

    pub fn bind_vertex_buffers(&mut self, first: u32, buffers: &[Buffer]) -> Result<(), Error> {
        let first = first as usize;
        if first + buffers.len() > MAX_VERTEX_BUFFERS {
            return Err(Error::invalid_usage("vertex buffer binding out of range"));
        }
        for (slot, buffer) in self.vertex_buffers[first..].iter_mut().zip(buffers) {
            *slot = Some(buffer.clone());
        }
        self.dirty |= DirtyState::VERTEX_BUFFERS;
        Ok(())
    }

    /// Index buffers are read when an indexed draw is recorded, nothing is uploaded for them.
    pub fn bind_index_buffer(&mut self, buffer: Buffer, index_type: IndexType) {
        self.index_buffer = Some((buffer, index_type));
    }

    /// Binds `sets` starting at slot `first_set`. Each set consumes as many entries of
    /// `dynamic_offsets` as it has dynamic buffers.
    pub fn bind_descriptor_sets(
        &mut self,
        bind_point: BindPoint,
        first_set: u32,
        sets: &[Arc<DescriptorSet>],
        dynamic_offsets: &[u32],
    ) -> Result<(), Error> {
        let first_set = first_set as usize;
        if first_set + sets.len() > MAX_SETS {
            return Err(Error::invalid_usage("descriptor set index out of range"));
        }
        let needed: usize = sets.iter().map(|s| s.layout.dynamic_offset_count()).sum();
        if needed != dynamic_offsets.len() {
            return Err(Error::invalid_usage(format!(
                "expected {} dynamic offsets, got {}",
                needed,
                dynamic_offsets.len()
            )));
        }

        let ds = &mut self.bind_points[bind_point as usize];
        let mut offsets = dynamic_offsets;
        for (i, set) in sets.iter().enumerate() {
            let (mine, rest) = offsets.split_at(set.layout.dynamic_offset_count());
            offsets = rest;
            ds.sets[first_set + i] = Some(BoundSet {
                set: set.clone(),
                dynamic_offsets: mine.to_vec(),
            });
        }
        ds.dirty |= DirtyState::DESCRIPTOR_SETS;
        Ok(())
    }

    /// Updates push constants. Visible to both bind points.
    pub fn push_constants(&mut self, offset: u32, data: &[u8]) -> Result<(), Error> {
        let start = offset as usize;
        let end = start
            .checked_add(data.len())
            .filter(|&end| end <= MAX_PUSH_CONSTANTS_SIZE)
            .ok_or_else(|| Error::invalid_usage("push constants overflow"))?;
        self.push_constants[start..end].copy_from_slice(data);
        for ds in self.bind_points.iter_mut() {
            ds.dirty |= DirtyState::PUSH_CONSTANTS;
        }
        Ok(())
    }

    pub fn set_viewport(&mut self, viewport: ViewportState) {
        self.dynamic.viewport = viewport;
        self.dirty |= DirtyState::VIEWPORT;
    }

    pub fn set_scissor(&mut self, scissor: Rect2D) {
        self.dynamic.scissor = scissor;
        self.dirty |= DirtyState::SCISSOR;
    }

    pub fn set_line_width(&mut self, width: f32) {
        self.dynamic.line_width = width;
        self.dirty |= DirtyState::LINE_WIDTH;
    }

    pub fn set_depth_bias(&mut self, bias: DepthBias) {
        self.dynamic.depth_bias = bias;
        self.dirty |= DirtyState::DEPTH_BIAS;
    }

    pub fn set_blend_constants(&mut self, constants: [f32; 4]) {
        self.dynamic.blend_constants = constants;
        self.dirty |= DirtyState::BLEND_CONSTANTS;
    }

    pub fn set_depth_bounds(&mut self, min: f32, max: f32) {
        self.dynamic.depth_bounds = [min, max];
        self.dirty |= DirtyState::DEPTH_BOUNDS;
    }

    pub fn set_stencil_compare_mask(&mut self, faces: StencilFaces, mask: u8) {
        for face in self.dynamic.stencil_faces_mut(faces) {
            face.compare_mask = mask;
        }
        self.dirty |= DirtyState::STENCIL_COMPARE_MASK;
    }

    pub fn set_stencil_write_mask(&mut self, faces: StencilFaces, mask: u8) {
        for face in self.dynamic.stencil_faces_mut(faces) {
            face.write_mask = mask;
        }
        self.dirty |= DirtyState::STENCIL_WRITE_MASK;
    }

    pub fn set_stencil_reference(&mut self, faces: StencilFaces, reference: u8) {
        for face in self.dynamic.stencil_faces_mut(faces) {
            face.reference = reference;
        }
        self.dirty |= DirtyState::STENCIL_REFERENCE;
    }

    pub fn set_discard_rectangles(&mut self, first: u32, rects: &[Rect2D]) -> Result<(), Error> {
        let first = first as usize;
        if first + rects.len() > MAX_DISCARD_RECTANGLES {
            return Err(Error::invalid_usage("discard rectangle index out of range"));
        }
        self.dynamic.discard_rectangles[first..first + rects.len()].copy_from_slice(rects);
        self.dirty |= DirtyState::DISCARD_RECTANGLE;
        Ok(())
    }

    /// The viewport descriptor depends on the framebuffer size.
    pub(crate) fn framebuffer_changed(&mut self) {
        self.dirty |= DirtyState::VIEWPORT_DESCRIPTOR;
    }

    pub(crate) fn clear_graphics_dirty(&mut self) {
        self.dirty = DirtyState::empty();
        self.bind_points[BindPoint::Graphics as usize].dirty = DirtyState::empty();
    }

    pub(crate) fn clear_compute_dirty(&mut self) {
        self.bind_points[BindPoint::Compute as usize].dirty = DirtyState::empty();
    }

    /// Buffer objects read by a draw or dispatch on `bind_point`.
    pub(crate) fn referenced_bos(&self, bind_point: BindPoint) -> Vec<BoHandle> {
        let mut bos = vec![];
        if bind_point == BindPoint::Graphics {
            bos.extend(self.vertex_buffers.iter().flatten().map(Buffer::handle));
            bos.extend(self.index_buffer.iter().map(|(b, _)| b.handle()));
        }
        for bound in self.bind_points[bind_point as usize].sets.iter().flatten() {
            bos.extend_from_slice(&bound.set.bos);
        }
        bos
    }
}

impl fmt::Debug for CmdState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CmdState")
            .field("dirty", &self.dirty)
            .field("graphics", &self.bind_points[BindPoint::Graphics as usize])
            .field("compute", &self.bind_points[BindPoint::Compute as usize])
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{PipelineLayout, ShaderInfo};

    fn graphics(layout: &Arc<PipelineLayout>) -> Arc<Pipeline> {
        Arc::new(Pipeline::graphics(layout.clone(), ShaderInfo::default(), None))
    }

    #[test]
    fn rebinding_the_same_pipeline_is_a_no_op() {
        let layout = PipelineLayout::new(vec![], 0);
        let pipeline = graphics(&layout);
        let mut state = CmdState::new();
        state.bind_pipeline(pipeline.clone());
        state.clear_graphics_dirty();
        state.bind_pipeline(pipeline);
        assert!(state.descriptor_state(BindPoint::Graphics).dirty().is_empty());
        assert!(state.dirty().is_empty());
    }

    #[test]
    fn layout_change_redirties_descriptor_tables() {
        let layout_a = PipelineLayout::new(vec![], 0);
        let layout_b = PipelineLayout::new(vec![], 0);
        let mut state = CmdState::new();
        state.bind_pipeline(graphics(&layout_a));
        state.clear_graphics_dirty();

        // same layout: only the pipeline itself is dirty
        state.bind_pipeline(graphics(&layout_a));
        let dirty = state.descriptor_state(BindPoint::Graphics).dirty();
        assert_eq!(dirty, DirtyState::PIPELINE);
        state.clear_graphics_dirty();

        state.bind_pipeline(graphics(&layout_b));
        let dirty = state.descriptor_state(BindPoint::Graphics).dirty();
        assert!(dirty.contains(DirtyState::DESCRIPTOR_SETS | DirtyState::PUSH_CONSTANTS));
    }

    #[test]
    fn push_constants_are_bounds_checked() {
        let mut state = CmdState::new();
        state.push_constants(120, &[1; 8]).unwrap();
        assert!(matches!(
            state.push_constants(121, &[1; 8]),
            Err(Error::InvalidUsage(_))
        ));
        assert_eq!(state.push_constants[127], 1);
    }

    #[test]
    fn setters_mark_their_group_dirty() {
        let mut state = CmdState::new();
        state.set_stencil_reference(StencilFaces::BACK, 7);
        assert_eq!(state.dynamic().stencil_back.reference, 7);
        assert_eq!(state.dynamic().stencil_front.reference, 0);
        state.set_blend_constants([1.0; 4]);
        assert_eq!(
            state.dirty(),
            DirtyState::STENCIL_REFERENCE | DirtyState::BLEND_CONSTANTS
        );
        state.clear_compute_dirty();
        assert!(!state.dirty().is_empty());
    }
}
