//! Draw job construction.
use crate::{
    hw::{
        padded_vertex_count, AttributeBuffer, DrawDescriptor, Invocation, PrimitiveDescriptor,
        TilerJobPayload, VertexJobPayload, ATTRIBUTE_BUFFER_LINEAR,
    },
    memory::Pool,
    pipeline::Pipeline,
    resource::Buffer,
    state::{GraphicsInputs, IndexType, StateTables},
    Error,
};

/// Bytes of the position output of one vertex.
const POSITION_SIZE: u64 = 16;

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Draw {
    pub vertex_count: u32,
    pub instance_count: u32,
    pub first_vertex: u32,
    pub first_instance: u32,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct DrawIndexed {
    pub index_count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub vertex_offset: i32,
    pub first_instance: u32,
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct IndexInfo {
    pub(crate) address: u64,
    pub(crate) index_type: IndexType,
    pub(crate) count: u32,
}

/// Draw parameters resolved into what the jobs encode.
#[derive(Copy, Clone, Debug)]
pub(crate) struct DrawInfo {
    /// Vertices shaded per instance.
    pub(crate) vertex_range: u32,
    /// Vertex count used to lay out per-vertex outputs.
    pub(crate) padded_vertex_count: u32,
    /// First vertex fetched: lowest index plus vertex offset for indexed draws.
    pub(crate) offset_start: u32,
    pub(crate) instance_count: u32,
    pub(crate) first_vertex: u32,
    pub(crate) vertex_offset: i32,
    pub(crate) first_instance: u32,
    /// Non-indexed vertex count.
    pub(crate) vertex_count: u32,
    pub(crate) indices: Option<IndexInfo>,
    pub(crate) invocation: Invocation,
}

impl DrawInfo {
    fn with_range(vertex_range: u32, instance_count: u32) -> Result<DrawInfo, Error> {
        let padded = if instance_count > 1 {
            padded_vertex_count(vertex_range).ok_or_else(|| {
                Error::invalid_usage(format!("{} vertices cannot be instanced", vertex_range))
            })?
        } else {
            vertex_range
        };
        Ok(DrawInfo {
            vertex_range,
            padded_vertex_count: padded,
            offset_start: 0,
            instance_count,
            first_vertex: 0,
            vertex_offset: 0,
            first_instance: 0,
            vertex_count: 0,
            indices: None,
            invocation: Invocation::pack(
                [1, vertex_range, instance_count],
                [1, 1, 1],
                true,
                false,
            )?,
        })
    }

    pub(crate) fn new(draw: &Draw) -> Result<DrawInfo, Error> {
        Ok(DrawInfo {
            offset_start: draw.first_vertex,
            first_vertex: draw.first_vertex,
            first_instance: draw.first_instance,
            vertex_count: draw.vertex_count,
            ..DrawInfo::with_range(draw.vertex_count, draw.instance_count)?
        })
    }

    /// Resolves an indexed draw. The index range is scanned for its bounds, so the index
    /// buffer must be host-visible.
    pub(crate) fn indexed(
        draw: &DrawIndexed,
        buffer: &Buffer,
        index_type: IndexType,
    ) -> Result<DrawInfo, Error> {
        let (min, max) = index_min_max(buffer, index_type, draw.first_index, draw.index_count)?;
        let vertex_range = (max - min)
            .checked_add(1)
            .ok_or_else(|| Error::invalid_usage("index range spans every 32-bit index"))?;
        let offset = draw.first_index as u64 * index_type.size() as u64;
        Ok(DrawInfo {
            offset_start: (min as i64 + draw.vertex_offset as i64) as u32,
            first_vertex: 0,
            vertex_offset: draw.vertex_offset,
            first_instance: draw.first_instance,
            indices: Some(IndexInfo {
                address: buffer.address() + offset,
                index_type,
                count: draw.index_count,
            }),
            ..DrawInfo::with_range(vertex_range, draw.instance_count)?
        })
    }

    pub(crate) fn instanced(&self) -> bool {
        self.instance_count > 1
    }

    pub(crate) fn graphics_inputs(&self, fb_width: u32, fb_height: u32) -> GraphicsInputs {
        GraphicsInputs {
            first_vertex: self.offset_start,
            base_vertex: self.vertex_offset,
            base_instance: self.first_instance,
            padded_vertex_count: self.padded_vertex_count,
            instanced: self.instanced(),
            fb_width,
            fb_height,
        }
    }

    /// Draw descriptor fields that only depend on the draw parameters.
    fn base_descriptor(&self) -> DrawDescriptor {
        DrawDescriptor {
            offset_start: self.offset_start,
            instance_size: if self.instanced() {
                self.padded_vertex_count
            } else {
                0
            },
            instance_count: self.instance_count,
            ..Default::default()
        }
    }
}

/// Returns the smallest and largest index of `count` indices starting at `first`.
pub fn index_min_max(
    buffer: &Buffer,
    index_type: IndexType,
    first: u32,
    count: u32,
) -> Result<(u32, u32), Error> {
    let size = index_type.size() as usize;
    let mut bytes = vec![0u8; count as usize * size];
    buffer.read(first as u64 * size as u64, &mut bytes)?;

    let mut min = u32::MAX;
    let mut max = 0;
    for chunk in bytes.chunks_exact(size) {
        let index = match index_type {
            IndexType::U8 => chunk[0] as u32,
            IndexType::U16 => u16::from_le_bytes([chunk[0], chunk[1]]) as u32,
            IndexType::U32 => u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]),
        };
        min = min.min(index);
        max = max.max(index);
    }
    if min > max {
        return Err(Error::invalid_usage("indexed draw without indices"));
    }
    Ok((min, max))
}

/// Vertex shader outputs of a draw.
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct Varyings {
    pub(crate) position: u64,
    pub(crate) varyings: u64,
    /// Table describing the two buffers above.
    pub(crate) buffers: u64,
}

impl Varyings {
    /// Allocates output storage for every vertex of every instance of the draw.
    pub(crate) fn alloc(
        varying_pool: &mut Pool,
        desc_pool: &mut Pool,
        info: &DrawInfo,
        stride: u32,
    ) -> Result<Varyings, Error> {
        let vertices = info.padded_vertex_count as u64 * info.instance_count as u64;
        let position = varying_pool.alloc(vertices * POSITION_SIZE, 64)?.gpu;
        let varyings = if stride == 0 {
            0
        } else {
            varying_pool.alloc(vertices * stride as u64, 64)?.gpu
        };
        let table = [
            AttributeBuffer {
                pointer: varyings,
                kind: ATTRIBUTE_BUFFER_LINEAR,
                stride,
                size: (vertices * stride as u64) as u32,
                divisor: 0,
            },
            AttributeBuffer {
                pointer: position,
                kind: ATTRIBUTE_BUFFER_LINEAR,
                stride: POSITION_SIZE as u32,
                size: (vertices * POSITION_SIZE) as u32,
                divisor: 0,
            },
        ];
        let buffers = desc_pool.upload_slice(&table, 64)?;
        Ok(Varyings {
            position,
            varyings,
            buffers,
        })
    }
}

/// Per-batch descriptors referenced by every draw of the batch.
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct BatchDescriptors {
    pub(crate) tls: u64,
    pub(crate) fbd: u64,
    pub(crate) tiler_context: u64,
}

fn shared_descriptor(
    info: &DrawInfo,
    tables: &StateTables,
    varyings: &Varyings,
    batch: &BatchDescriptors,
) -> DrawDescriptor {
    DrawDescriptor {
        position: varyings.position,
        varyings: varyings.varyings,
        varying_buffers: varyings.buffers,
        textures: tables.textures,
        samplers: tables.samplers,
        uniform_buffers: tables.ubos,
        push_uniforms: tables.push_constants,
        thread_storage: batch.tls,
        fbd: batch.fbd,
        ..info.base_descriptor()
    }
}

pub(crate) fn vertex_payload(
    pipeline: &Pipeline,
    info: &DrawInfo,
    tables: &StateTables,
    varyings: &Varyings,
    batch: &BatchDescriptors,
) -> VertexJobPayload {
    VertexJobPayload {
        invocation: info.invocation,
        draw: DrawDescriptor {
            renderer_state: pipeline.vs.binary,
            attributes: tables.attributes,
            attribute_buffers: tables.attribute_buffers,
            ..shared_descriptor(info, tables, varyings, batch)
        },
    }
}

pub(crate) fn tiler_payload(
    pipeline: &Pipeline,
    info: &DrawInfo,
    tables: &StateTables,
    varyings: &Varyings,
    batch: &BatchDescriptors,
    line_width: f32,
) -> TilerJobPayload {
    let primitive = match info.indices {
        Some(indices) => PrimitiveDescriptor {
            draw_mode: pipeline.topology.hw_draw_mode(),
            index_type: indices.index_type.size(),
            index_count: indices.count,
            base_vertex_offset: (info.vertex_offset as i64 - info.offset_start as i64) as i32,
            indices: indices.address,
            line_width,
            _pad: 0,
        },
        None => PrimitiveDescriptor {
            draw_mode: pipeline.topology.hw_draw_mode(),
            index_count: info.vertex_count,
            line_width,
            ..Default::default()
        },
    };
    TilerJobPayload {
        invocation: info.invocation,
        primitive,
        tiler_context: batch.tiler_context,
        draw: DrawDescriptor {
            renderer_state: tables.renderer_state,
            viewport: tables.viewport,
            ..shared_descriptor(info, tables, varyings, batch)
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::DriverConfig,
        memory::{Allocator, BoFlags, BoScope},
    };
    use pankmod::SoftKernel;
    use std::sync::Arc;

    fn index_buffer(indices: &[u16]) -> (Arc<SoftKernel>, Buffer) {
        let kernel = Arc::new(SoftKernel::new(0x7212));
        let alloc = Allocator::new(kernel.clone(), &DriverConfig::default(), None).unwrap();
        let mut bo = alloc
            .create_bo(0x1000, BoFlags::empty(), BoScope::Object)
            .unwrap();
        bo.write(0, bytemuck::cast_slice(indices)).unwrap();
        (kernel, Buffer::whole(Arc::new(bo)))
    }

    #[test]
    fn non_instanced_draws_are_not_padded() {
        let info = DrawInfo::new(&Draw {
            vertex_count: 33,
            instance_count: 1,
            first_vertex: 5,
            first_instance: 0,
        })
        .unwrap();
        assert_eq!(info.padded_vertex_count, 33);
        assert_eq!(info.offset_start, 5);
        assert_eq!(info.base_descriptor().instance_size, 0);
    }

    #[test]
    fn instanced_draws_are_padded() {
        let info = DrawInfo::new(&Draw {
            vertex_count: 33,
            instance_count: 4,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(info.padded_vertex_count, 36);
        assert_eq!(info.base_descriptor().instance_size, 36);
    }

    #[test]
    fn indexed_draws_scan_the_index_range() {
        let (_kernel, buffer) = index_buffer(&[100, 7, 12, 9, 50, 3]);
        let draw = DrawIndexed {
            index_count: 3,
            instance_count: 1,
            first_index: 1,
            vertex_offset: 10,
            first_instance: 2,
        };
        let info = DrawInfo::indexed(&draw, &buffer, IndexType::U16).unwrap();
        // indices 7, 12, 9
        assert_eq!(info.vertex_range, 6);
        assert_eq!(info.offset_start, 17);
        assert_eq!(info.indices.unwrap().address, buffer.address() + 2);
        let inputs = info.graphics_inputs(64, 64);
        assert_eq!(inputs.first_vertex, 17);
        assert_eq!(inputs.base_vertex, 10);
        assert_eq!(inputs.base_instance, 2);
    }

    #[test]
    fn index_reads_are_bounds_checked() {
        let (_kernel, buffer) = index_buffer(&[1, 2, 3]);
        let buffer = Buffer::new(buffer.memory, 0, 6);
        assert!(index_min_max(&buffer, IndexType::U16, 2, 2).is_err());
        assert_eq!(index_min_max(&buffer, IndexType::U16, 0, 3).unwrap(), (1, 3));
    }
}
