//! Pipelines and pipeline layouts.
//!
//! Pipelines are built elsewhere (shader compilation is not part of this crate). What the
//! recording code needs from them is the information below: where the shaders live, what
//! they consume, and which state groups are baked versus dynamic.
use crate::{
    descriptor::DescriptorSetLayout,
    hw::{Format, RendererState},
    state::{DirtyState, DynamicValues},
};
use std::sync::Arc;

pub const MAX_SETS: usize = 4;
pub const MAX_PUSH_CONSTANTS_SIZE: usize = 128;
pub const MAX_VERTEX_ATTRIBS: usize = 16;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum BindPoint {
    Graphics = 0,
    Compute = 1,
}

pub const MAX_BIND_POINTS: usize = 2;

/// Descriptor set layouts and push constant range of a pipeline.
#[derive(Debug, Default)]
pub struct PipelineLayout {
    pub sets: Vec<Arc<DescriptorSetLayout>>,
    pub push_constant_size: u32,
}

impl PipelineLayout {
    pub fn new(sets: Vec<Arc<DescriptorSetLayout>>, push_constant_size: u32) -> Arc<PipelineLayout> {
        Arc::new(PipelineLayout {
            sets,
            push_constant_size,
        })
    }

    /// Uniform buffer table entries: sysvals, push constants, then the static and dynamic
    /// uniform buffers of each set.
    pub fn ubo_count(&self) -> u32 {
        2 + self
            .sets
            .iter()
            .map(|s| s.num_ubos + s.num_dyn_ubos)
            .sum::<u32>()
    }

    pub fn texture_count(&self) -> u32 {
        self.sets.iter().map(|s| s.num_textures).sum()
    }

    pub fn sampler_count(&self) -> u32 {
        self.sets.iter().map(|s| s.num_samplers).sum()
    }

    pub fn dyn_ssbo_count(&self) -> u32 {
        self.sets.iter().map(|s| s.num_dyn_ssbos).sum()
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Topology {
    PointList,
    LineList,
    LineStrip,
    TriangleList,
    TriangleStrip,
    TriangleFan,
}

impl Topology {
    pub fn hw_draw_mode(self) -> u32 {
        match self {
            Topology::PointList => 0x1,
            Topology::LineList => 0x2,
            Topology::LineStrip => 0x4,
            Topology::TriangleList => 0x8,
            Topology::TriangleStrip => 0xa,
            Topology::TriangleFan => 0xc,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct VertexBinding {
    pub binding: u32,
    pub stride: u32,
    pub per_instance: bool,
    /// Instance divisor of per-instance bindings.
    pub divisor: u32,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct VertexAttribute {
    pub location: u32,
    pub binding: u32,
    pub offset: u32,
    pub format: Format,
}

/// Compiled shader as seen by the job builder.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ShaderInfo {
    /// GPU address of the shader binary.
    pub binary: u64,
    /// Per-thread stack size.
    pub tls_size: u32,
    /// Workgroup-local storage size (compute only).
    pub wls_size: u32,
}

#[derive(Clone, Debug)]
pub struct Pipeline {
    pub bind_point: BindPoint,
    pub layout: Arc<PipelineLayout>,
    pub vs: ShaderInfo,
    pub fs: Option<ShaderInfo>,
    pub cs: ShaderInfo,
    /// Compute workgroup size.
    pub local_size: [u32; 3],
    pub rasterizer_enabled: bool,
    pub topology: Topology,
    pub vertex_bindings: Vec<VertexBinding>,
    pub vertex_attributes: Vec<VertexAttribute>,
    /// Bytes of varyings written per vertex, position excluded.
    pub varying_stride: u32,
    /// State groups taken from the command buffer instead of `static_state`.
    pub dynamic: DirtyState,
    pub static_state: DynamicValues,
    /// Fragment renderer state with the pipeline's baked values.
    pub rsd_template: RendererState,
    /// Pre-built fragment renderer state, usable when no renderer-state group is dynamic.
    pub static_rsd: Option<u64>,
}

impl Pipeline {
    pub fn graphics(layout: Arc<PipelineLayout>, vs: ShaderInfo, fs: Option<ShaderInfo>) -> Pipeline {
        let mut rsd_template = RendererState::default();
        rsd_template.shader = fs.map_or(0, |fs| fs.binary);
        Pipeline {
            bind_point: BindPoint::Graphics,
            layout,
            vs,
            fs,
            cs: ShaderInfo::default(),
            local_size: [1, 1, 1],
            rasterizer_enabled: true,
            topology: Topology::TriangleList,
            vertex_bindings: vec![],
            vertex_attributes: vec![],
            varying_stride: 0,
            dynamic: DirtyState::empty(),
            static_state: DynamicValues::default(),
            rsd_template,
            static_rsd: None,
        }
    }

    pub fn compute(layout: Arc<PipelineLayout>, cs: ShaderInfo, local_size: [u32; 3]) -> Pipeline {
        Pipeline {
            bind_point: BindPoint::Compute,
            cs,
            local_size,
            rasterizer_enabled: false,
            ..Pipeline::graphics(layout, ShaderInfo::default(), None)
        }
    }

    /// Largest per-thread stack size of the pipeline's shaders.
    pub fn tls_size(&self) -> u32 {
        match self.bind_point {
            BindPoint::Graphics => self
                .vs
                .tls_size
                .max(self.fs.map_or(0, |fs| fs.tls_size)),
            BindPoint::Compute => self.cs.tls_size,
        }
    }

    /// Whether `group` is taken from the command buffer's dynamic state.
    pub fn is_dynamic(&self, group: DirtyState) -> bool {
        self.dynamic.intersects(group)
    }
}
