use crate::{
    hw::{
        Attribute, AttributeBuffer, DiscardRectangle, RendererState, SamplerDescriptor, Sysvals,
        TextureDescriptor, UniformBuffer, Viewport, ATTRIBUTE_BUFFER_LINEAR,
        ATTRIBUTE_BUFFER_MODULO, MAX_DISCARD_RECTANGLES, MAX_DYNAMIC_STORAGE_BUFFERS,
    },
    memory::Pool,
    pipeline::{BindPoint, Pipeline, PipelineLayout, MAX_PUSH_CONSTANTS_SIZE, MAX_VERTEX_ATTRIBS},
    state::{
        tracker::{CmdState, DescriptorState},
        DirtyState, DynamicValues, Rect2D, StencilFaceState,
    },
    Error,
};
use std::{mem::size_of, sync::Arc};
use tracing::trace_span;

const TABLE_ALIGN: u64 = 64;

/// Number of hardware tables uploaded by the materialization step.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct MaterializeStats {
    pub uploads: u64,
}

/// What attribute buffer descriptors were last built for.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct AttribKey {
    pub(crate) padded_vertex_count: u32,
    pub(crate) instanced: bool,
}

/// Per-draw values that feed the graphics tables.
#[derive(Copy, Clone, Debug)]
pub(crate) struct GraphicsInputs {
    pub(crate) first_vertex: u32,
    pub(crate) base_vertex: i32,
    pub(crate) base_instance: u32,
    pub(crate) padded_vertex_count: u32,
    pub(crate) instanced: bool,
    pub(crate) fb_width: u32,
    pub(crate) fb_height: u32,
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct ComputeInputs {
    pub(crate) workgroup_count: [u32; 3],
}

/// GPU addresses of the tables read by a draw or dispatch. 0 means "no table".
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct StateTables {
    pub(crate) sysvals: u64,
    pub(crate) push_constants: u64,
    pub(crate) ubos: u64,
    pub(crate) textures: u64,
    pub(crate) samplers: u64,
    pub(crate) attributes: u64,
    pub(crate) attribute_buffers: u64,
    pub(crate) viewport: u64,
    pub(crate) renderer_state: u64,
}

fn pick<T: Copy>(dynamic: bool, from_cmd: T, from_pipeline: T) -> T {
    if dynamic {
        from_cmd
    } else {
        from_pipeline
    }
}

impl CmdState {
    /// Values of the dynamic state groups as seen by `pipeline`.
    fn effective_values(&self, pipeline: &Pipeline) -> DynamicValues {
        let d = &self.dynamic;
        let s = &pipeline.static_state;
        let is = |group| pipeline.is_dynamic(group);
        let stencil = |d: &StencilFaceState, s: &StencilFaceState| StencilFaceState {
            compare_mask: pick(is(DirtyState::STENCIL_COMPARE_MASK), d.compare_mask, s.compare_mask),
            write_mask: pick(is(DirtyState::STENCIL_WRITE_MASK), d.write_mask, s.write_mask),
            reference: pick(is(DirtyState::STENCIL_REFERENCE), d.reference, s.reference),
        };
        DynamicValues {
            viewport: pick(is(DirtyState::VIEWPORT), d.viewport, s.viewport),
            scissor: pick(is(DirtyState::SCISSOR), d.scissor, s.scissor),
            line_width: pick(is(DirtyState::LINE_WIDTH), d.line_width, s.line_width),
            depth_bias: pick(is(DirtyState::DEPTH_BIAS), d.depth_bias, s.depth_bias),
            blend_constants: pick(
                is(DirtyState::BLEND_CONSTANTS),
                d.blend_constants,
                s.blend_constants,
            ),
            depth_bounds: pick(is(DirtyState::DEPTH_BOUNDS), d.depth_bounds, s.depth_bounds),
            stencil_front: stencil(&d.stencil_front, &s.stencil_front),
            stencil_back: stencil(&d.stencil_back, &s.stencil_back),
            discard_rectangles: pick(
                is(DirtyState::DISCARD_RECTANGLE),
                d.discard_rectangles,
                s.discard_rectangles,
            ),
        }
    }

    /// Line width the tiler should use for the bound graphics pipeline.
    pub(crate) fn line_width(&self) -> f32 {
        match self.pipeline(BindPoint::Graphics) {
            Some(p) if !p.is_dynamic(DirtyState::LINE_WIDTH) => p.static_state.line_width,
            _ => self.dynamic.line_width,
        }
    }

    /// Uploads the dirty graphics tables and returns the addresses of all of them.
    pub(crate) fn materialize_graphics(
        &mut self,
        pool: &mut Pool,
        inputs: &GraphicsInputs,
    ) -> Result<StateTables, Error> {
        let _span = trace_span!("materialize_graphics").entered();
        let pipeline = self
            .pipeline(BindPoint::Graphics)
            .cloned()
            .ok_or_else(|| Error::invalid_usage("draw without a bound graphics pipeline"))?;
        if pipeline.vertex_attributes.len() > MAX_VERTEX_ATTRIBS {
            return Err(Error::invalid_usage(format!(
                "{} vertex attributes, at most {} are supported",
                pipeline.vertex_attributes.len(),
                MAX_VERTEX_ATTRIBS
            )));
        }
        let values = self.effective_values(&pipeline);

        let mut sysvals = Sysvals::default();
        let vp = &values.viewport;
        sysvals.viewport_scale = [
            0.5 * vp.width,
            0.5 * vp.height,
            vp.max_depth - vp.min_depth,
            0.0,
        ];
        sysvals.viewport_offset = [
            vp.x + 0.5 * vp.width,
            vp.y + 0.5 * vp.height,
            vp.min_depth,
            0.0,
        ];
        sysvals.blend_constants = values.blend_constants;
        sysvals.first_vertex = inputs.first_vertex;
        sysvals.base_vertex = inputs.base_vertex;
        sysvals.base_instance = inputs.base_instance;

        let cmd_dirty = self.dirty;
        let ds = &mut self.bind_points[BindPoint::Graphics as usize];
        let pipeline_dirty = ds.dirty.contains(DirtyState::PIPELINE);
        let mut uploads = 0;
        let mut tables = upload_descriptor_tables(
            ds,
            &self.push_constants,
            &mut uploads,
            pool,
            &pipeline.layout,
            sysvals,
        )?;

        // vertex attributes
        let key = AttribKey {
            padded_vertex_count: if inputs.instanced {
                inputs.padded_vertex_count
            } else {
                0
            },
            instanced: inputs.instanced,
        };
        if ds.vs_attribs.is_none()
            || pipeline_dirty
            || cmd_dirty.contains(DirtyState::VERTEX_BUFFERS)
            || ds.attrib_key != Some(key)
        {
            let (attribs, bufs) = if pipeline.vertex_attributes.is_empty() {
                (0, 0)
            } else {
                uploads += 2;
                let bufs = attribute_buffers(&pipeline, &self.vertex_buffers, &key);
                let attribs = attributes(&pipeline);
                (
                    pool.upload_slice(&attribs, TABLE_ALIGN)?,
                    pool.upload_slice(&bufs, TABLE_ALIGN)?,
                )
            };
            ds.vs_attribs = Some(attribs);
            ds.vs_attrib_bufs = Some(bufs);
            ds.attrib_key = Some(key);
        }
        tables.attributes = ds.vs_attribs.unwrap_or_default();
        tables.attribute_buffers = ds.vs_attrib_bufs.unwrap_or_default();

        // viewport, scissor and discard rectangles
        if self.vpd.is_none()
            || pipeline_dirty
            || cmd_dirty.intersects(DirtyState::VIEWPORT_DESCRIPTOR)
        {
            let desc = viewport_descriptor(&values, inputs.fb_width, inputs.fb_height);
            self.vpd = Some(pool.upload_pod(&desc, TABLE_ALIGN)?);
            uploads += 1;
        }
        tables.viewport = self.vpd.unwrap_or_default();

        // fragment renderer state
        if self.fs_rsd.is_none() || pipeline_dirty || cmd_dirty.intersects(DirtyState::RSD) {
            self.fs_rsd = match pipeline.static_rsd {
                Some(rsd) if !pipeline.is_dynamic(DirtyState::RSD) => Some(rsd),
                _ => {
                    uploads += 1;
                    let rsd = renderer_state(&pipeline.rsd_template, &values);
                    Some(pool.upload_pod(&rsd, TABLE_ALIGN)?)
                }
            };
        }
        tables.renderer_state = self.fs_rsd.unwrap_or_default();

        self.stats.uploads += uploads;
        Ok(tables)
    }

    /// Uploads the dirty compute tables and returns the addresses of all of them.
    pub(crate) fn materialize_compute(
        &mut self,
        pool: &mut Pool,
        inputs: &ComputeInputs,
    ) -> Result<StateTables, Error> {
        let _span = trace_span!("materialize_compute").entered();
        let pipeline = self
            .pipeline(BindPoint::Compute)
            .cloned()
            .ok_or_else(|| Error::invalid_usage("dispatch without a bound compute pipeline"))?;

        let mut sysvals = Sysvals::default();
        let [x, y, z] = inputs.workgroup_count;
        sysvals.num_work_groups = [x, y, z, 0];
        let [lx, ly, lz] = pipeline.local_size;
        sysvals.local_group_size = [lx, ly, lz, 0];

        let ds = &mut self.bind_points[BindPoint::Compute as usize];
        let mut uploads = 0;
        let tables = upload_descriptor_tables(
            ds,
            &self.push_constants,
            &mut uploads,
            pool,
            &pipeline.layout,
            sysvals,
        )?;
        self.stats.uploads += uploads;
        Ok(tables)
    }
}

/// Sysvals, push constants, uniform buffers, textures and samplers.
fn upload_descriptor_tables(
    ds: &mut DescriptorState,
    push_constants: &[u8; MAX_PUSH_CONSTANTS_SIZE],
    uploads: &mut u64,
    pool: &mut Pool,
    layout: &Arc<PipelineLayout>,
    mut sysvals: Sysvals,
) -> Result<StateTables, Error> {
    for (slot, ssbo) in sysvals
        .dyn_ssbos
        .iter_mut()
        .zip(dynamic_storage_buffers(ds, layout))
    {
        *slot = ssbo;
    }

    let mut ubos_stale = ds.ubos.is_none() || ds.dirty.contains(DirtyState::DESCRIPTOR_SETS);

    if ds.sysvals.is_none() || ds.sysval_values != sysvals {
        ds.sysvals = Some(pool.upload_pod(&sysvals, TABLE_ALIGN)?);
        ds.sysval_values = sysvals;
        *uploads += 1;
        ubos_stale = true;
    }

    let push_size = (layout.push_constant_size as usize).min(MAX_PUSH_CONSTANTS_SIZE);
    if ds.push_constants.is_none() || ds.dirty.contains(DirtyState::PUSH_CONSTANTS) {
        ds.push_constants = Some(if push_size == 0 {
            0
        } else {
            *uploads += 1;
            pool.upload(&push_constants[..push_size], TABLE_ALIGN)?
        });
        ubos_stale = true;
    }

    if ubos_stale {
        let mut table = Vec::with_capacity(layout.ubo_count() as usize);
        table.push(UniformBuffer {
            pointer: ds.sysvals.unwrap_or_default(),
            size: size_of::<Sysvals>() as u32,
            _pad: 0,
        });
        table.push(UniformBuffer {
            pointer: ds.push_constants.unwrap_or_default(),
            size: push_size as u32,
            _pad: 0,
        });
        for (i, set_layout) in layout.sets.iter().enumerate() {
            let bound = ds.sets[i].as_ref();
            for j in 0..set_layout.num_ubos as usize {
                let ubo = bound.and_then(|b| b.set.ubos.get(j).copied());
                table.push(ubo.unwrap_or_default());
            }
            for j in 0..set_layout.num_dyn_ubos as usize {
                let ubo = bound.and_then(|b| {
                    let mut ubo = *b.set.dyn_ubos.get(j)?;
                    ubo.pointer += *b.dynamic_offsets.get(j).unwrap_or(&0) as u64;
                    Some(ubo)
                });
                table.push(ubo.unwrap_or_default());
            }
        }
        ds.ubos = Some(pool.upload_slice(&table, TABLE_ALIGN)?);
        *uploads += 1;
    }

    if ds.textures.is_none() || ds.dirty.contains(DirtyState::DESCRIPTOR_SETS) {
        let mut table = vec![];
        for (i, set_layout) in layout.sets.iter().enumerate() {
            let bound = ds.sets[i].as_ref();
            for j in 0..set_layout.num_textures as usize {
                let t = bound.and_then(|b| b.set.textures.get(j).copied());
                table.push(t.unwrap_or_default());
            }
        }
        ds.textures = Some(upload_table::<TextureDescriptor>(pool, &table, uploads)?);
    }

    if ds.samplers.is_none() || ds.dirty.contains(DirtyState::DESCRIPTOR_SETS) {
        let mut table = vec![];
        for (i, set_layout) in layout.sets.iter().enumerate() {
            let bound = ds.sets[i].as_ref();
            for j in 0..set_layout.num_samplers as usize {
                let s = bound.and_then(|b| b.set.samplers.get(j).copied());
                table.push(s.unwrap_or_default());
            }
        }
        ds.samplers = Some(upload_table::<SamplerDescriptor>(pool, &table, uploads)?);
    }

    Ok(StateTables {
        sysvals: ds.sysvals.unwrap_or_default(),
        push_constants: ds.push_constants.unwrap_or_default(),
        ubos: ds.ubos.unwrap_or_default(),
        textures: ds.textures.unwrap_or_default(),
        samplers: ds.samplers.unwrap_or_default(),
        ..Default::default()
    })
}

fn upload_table<T: bytemuck::Pod>(pool: &mut Pool, table: &[T], uploads: &mut u64) -> Result<u64, Error> {
    if table.is_empty() {
        return Ok(0);
    }
    *uploads += 1;
    pool.upload_slice(table, TABLE_ALIGN)
}

/// Dynamic storage buffers of the bound sets, dynamic offsets applied.
fn dynamic_storage_buffers(ds: &DescriptorState, layout: &PipelineLayout) -> Vec<UniformBuffer> {
    let mut out = vec![];
    for (i, set_layout) in layout.sets.iter().enumerate() {
        let bound = ds.sets[i].as_ref();
        for j in 0..set_layout.num_dyn_ssbos as usize {
            let ssbo = bound.and_then(|b| {
                let mut ssbo = *b.set.dyn_ssbos.get(j)?;
                let offset = b.dynamic_offsets.get(set_layout.num_dyn_ubos as usize + j);
                ssbo.pointer += *offset.unwrap_or(&0) as u64;
                Some(ssbo)
            });
            out.push(ssbo.unwrap_or_default());
        }
    }
    out.truncate(MAX_DYNAMIC_STORAGE_BUFFERS);
    out
}

fn attributes(pipeline: &Pipeline) -> Vec<Attribute> {
    pipeline
        .vertex_attributes
        .iter()
        .map(|attr| Attribute {
            buffer_index: pipeline
                .vertex_bindings
                .iter()
                .position(|b| b.binding == attr.binding)
                .unwrap_or(0) as u32,
            offset: attr.offset,
            format: attr.format.hw_code(),
            _pad: 0,
        })
        .collect()
}

fn attribute_buffers(
    pipeline: &Pipeline,
    vertex_buffers: &[Option<crate::resource::Buffer>],
    key: &AttribKey,
) -> Vec<AttributeBuffer> {
    pipeline
        .vertex_bindings
        .iter()
        .map(|binding| {
            let buffer = vertex_buffers
                .get(binding.binding as usize)
                .and_then(Option::as_ref);
            let (kind, divisor) = if binding.per_instance {
                (ATTRIBUTE_BUFFER_LINEAR, binding.divisor.max(1))
            } else if key.instanced {
                (ATTRIBUTE_BUFFER_MODULO, key.padded_vertex_count)
            } else {
                (ATTRIBUTE_BUFFER_LINEAR, 0)
            };
            AttributeBuffer {
                pointer: buffer.map_or(0, |b| b.address()),
                kind,
                stride: binding.stride,
                size: buffer.map_or(0, |b| b.size as u32),
                divisor,
            }
        })
        .collect()
}

/// Discard rectangle clamped to the framebuffer.
fn discard_rectangle(rect: &Rect2D, fb_width: u32, fb_height: u32) -> DiscardRectangle {
    let span = |start: i32, len: u32, fb: u32| -> (u16, u16) {
        let end = (start as i64 + len as i64).min(fb as i64).min(u16::MAX as i64);
        let start = (start as i64).max(0);
        if end <= start {
            (0, 0)
        } else {
            (start as u16, end as u16)
        }
    };
    let (min_x, max_x) = span(rect.x, rect.width, fb_width);
    let (min_y, max_y) = span(rect.y, rect.height, fb_height);
    if min_x == max_x || min_y == max_y {
        return DiscardRectangle::default();
    }
    DiscardRectangle {
        min_x,
        min_y,
        max_x,
        max_y,
    }
}

/// Viewport intersected with the scissor and clamped to the framebuffer. An empty area is
/// encoded with min > max.
pub(crate) fn viewport_descriptor(values: &DynamicValues, fb_width: u32, fb_height: u32) -> Viewport {
    let vp = &values.viewport;
    let sc = &values.scissor;

    let clip = |v0: f32, vlen: f32, s0: i32, slen: u32, fb: u32| -> (u16, u16) {
        let lo = (v0.floor() as i64).max(s0 as i64).max(0);
        let hi = ((v0 + vlen).ceil() as i64)
            .min(s0 as i64 + slen as i64)
            .min(fb as i64)
            .min(u16::MAX as i64 + 1);
        if hi <= lo {
            (1, 0)
        } else {
            (lo as u16, (hi - 1) as u16)
        }
    };
    let (min_x, max_x) = clip(vp.x, vp.width, sc.x, sc.width, fb_width);
    let (min_y, max_y) = clip(vp.y, vp.height, sc.y, sc.height, fb_height);

    let mut discard_rectangles = [DiscardRectangle::default(); MAX_DISCARD_RECTANGLES];
    for (out, rect) in discard_rectangles.iter_mut().zip(&values.discard_rectangles) {
        *out = discard_rectangle(rect, fb_width, fb_height);
    }

    Viewport {
        min_x,
        min_y,
        max_x,
        max_y,
        min_depth: vp.min_depth.min(vp.max_depth),
        max_depth: vp.min_depth.max(vp.max_depth),
        discard_rectangles,
    }
}

fn renderer_state(template: &RendererState, values: &DynamicValues) -> RendererState {
    let face = |f: &StencilFaceState| {
        RendererState::pack_stencil(f.reference, f.compare_mask, f.write_mask)
    };
    RendererState {
        stencil_front: face(&values.stencil_front),
        stencil_back: face(&values.stencil_back),
        depth_units: values.depth_bias.constant_factor,
        depth_factor: values.depth_bias.slope_factor,
        depth_bias_clamp: values.depth_bias.clamp,
        blend_constants: values.blend_constants,
        depth_bounds: values.depth_bounds,
        ..*template
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Rect2D, ViewportState};

    fn values(viewport: ViewportState, scissor: Rect2D) -> DynamicValues {
        DynamicValues {
            viewport,
            scissor,
            ..Default::default()
        }
    }

    #[test]
    fn viewport_is_clipped_to_scissor_and_framebuffer() {
        let v = values(
            ViewportState {
                x: -10.0,
                y: 0.0,
                width: 200.0,
                height: 50.0,
                min_depth: 1.0,
                max_depth: 0.0,
            },
            Rect2D::new(8, 4, 1000, 1000),
        );
        let desc = viewport_descriptor(&v, 100, 60);
        assert_eq!((desc.min_x, desc.max_x), (8, 99));
        assert_eq!((desc.min_y, desc.max_y), (4, 49));
        assert_eq!((desc.min_depth, desc.max_depth), (0.0, 1.0));
    }

    #[test]
    fn empty_intersection_has_min_above_max() {
        let v = values(
            ViewportState {
                width: 10.0,
                height: 10.0,
                ..Default::default()
            },
            Rect2D::new(20, 20, 5, 5),
        );
        let desc = viewport_descriptor(&v, 100, 100);
        assert!(desc.min_x > desc.max_x);
    }

    #[test]
    fn discard_rectangles_are_clamped_to_the_framebuffer() {
        let mut v = values(ViewportState::default(), Rect2D::new(0, 0, 100, 100));
        v.discard_rectangles[0] = Rect2D::new(-4, 10, 20, 200);
        v.discard_rectangles[2] = Rect2D::new(90, 0, 0, 50);
        v.discard_rectangles[3] = Rect2D::new(150, 0, 10, 10);
        let desc = viewport_descriptor(&v, 100, 60);
        assert_eq!(
            desc.discard_rectangles[0],
            DiscardRectangle {
                min_x: 0,
                min_y: 10,
                max_x: 16,
                max_y: 60,
            }
        );
        // unset, zero-sized and off-screen rectangles drop nothing
        assert_eq!(desc.discard_rectangles[1], DiscardRectangle::default());
        assert_eq!(desc.discard_rectangles[2], DiscardRectangle::default());
        assert_eq!(desc.discard_rectangles[3], DiscardRectangle::default());
    }

    #[test]
    fn renderer_state_keeps_the_shader_of_the_template() {
        let template = RendererState {
            shader: 0x1234_0000,
            ..Default::default()
        };
        let mut v = DynamicValues::default();
        v.stencil_front.reference = 3;
        let rsd = renderer_state(&template, &v);
        assert_eq!(rsd.shader, 0x1234_0000);
        assert_eq!(rsd.stencil_front, RendererState::pack_stencil(3, 0xff, 0xff));
    }
}
