//! Command recording and batch management.
//!
//! # Batches
//!
//! Recorded work is split into batches. A batch holds one job chain, plus at most one
//! fragment job when it renders to a framebuffer. Batches are opened lazily, by the first
//! command that needs one, and closed when:
//!
//! * the render pass ends, or moves to a subpass with incompatible attachments;
//! * a compute dispatch or buffer copy is recorded (those always get a batch of their own);
//! * an event is set or reset, or an event wait follows recorded work;
//! * the job chain runs out of job indices;
//! * the render pass is explicitly split with [`CommandBuffer::split_render_pass`];
//! * recording ends.
//!
//! When a batch is closed in the middle of a render pass, the next batch reloads the
//! attachments instead of clearing them, so nothing rendered so far is lost.
//!
//! # Errors
//!
//! Recording commands do not return errors. The first error is latched: the open batch is
//! discarded, every later command is ignored, and [`CommandBuffer::end`] returns the error.
use crate::{
    batch::{Batch, BlitBos, EventOp, EventOpKind},
    caps::{Capabilities, Features},
    descriptor::DescriptorSet,
    device::Device,
    event::Event,
    hw::{
        ComputeJobPayload, DrawDescriptor, FragmentJobPayload, Invocation, JobHeader, JobType,
        LocalStorage, PrimitiveDescriptor, TilerContext, TilerHeap, TilerJobPayload,
        UniformBuffer, Viewport, JOB_HEADER_SIZE,
    },
    job::{
        compute_payload, tiler_payload, tls_size_per_thread, tls_total_size, vertex_payload,
        wls_instance_size, wls_instances, wls_total_size, BatchDescriptors, Dispatch, Draw,
        DrawIndexed, DrawInfo, Varyings,
    },
    memory::{BoFlags, Pool},
    pipeline::{BindPoint, Pipeline, Topology},
    render_pass::{FramebufferInfo, RenderingInfo},
    resource::Buffer,
    state::{
        CmdState, DepthBias, IndexType, MaterializeStats, Rect2D, StencilFaces, ViewportState,
    },
    Error,
};
use bytemuck::{bytes_of, Pod, Zeroable};
use pankmod::BoHandle;
use std::{fmt, mem::size_of, sync::Arc};
use tracing::{trace, trace_span, warn};

/// Tiler hierarchy levels enabled in tiler contexts.
const HIERARCHY_MASK_ALL: u32 = 0xfff;
/// Polygon list header preceding the per-tile entries.
const POLYGON_LIST_HEADER_SIZE: u64 = 0x200;
/// Bytes copied by one invocation of the buffer copy shader.
const COPY_GRANULARITY: u64 = 16;

/// Push constants of the buffer copy shader.
#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
#[repr(C)]
struct CopyPushConstants {
    src: u64,
    dst: u64,
    size: u64,
    _pad: u64,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CommandBufferStatus {
    Initial,
    Recording,
    Executable,
    /// Recording failed. The command buffer must be reset or begun again.
    Invalid,
}

/// Records commands into batches of GPU jobs.
pub struct CommandBuffer {
    device: Arc<Device>,
    status: CommandBufferStatus,
    state: CmdState,
    /// Descriptors, tables and job descriptors.
    desc_pool: Pool,
    /// Vertex shader outputs and polygon lists. Never mapped on the host.
    varying_pool: Pool,
    /// Thread and workgroup local storage. Never mapped on the host.
    tls_pool: Pool,
    batches: Vec<Batch>,
    batch: Option<Batch>,
    /// Framebuffer of the current render pass.
    fb: Option<FramebufferInfo>,
    error: Option<Error>,
}

impl CommandBuffer {
    pub(crate) fn new(device: Arc<Device>) -> CommandBuffer {
        let allocator = device.allocator().clone();
        let slab_size = device.config().pool_slab_size;
        CommandBuffer {
            desc_pool: Pool::new(allocator.clone(), "desc", slab_size, BoFlags::empty()),
            varying_pool: Pool::new(allocator.clone(), "varying", slab_size, BoFlags::NO_MMAP),
            tls_pool: Pool::new(allocator, "tls", slab_size, BoFlags::NO_MMAP),
            device,
            status: CommandBufferStatus::Initial,
            state: CmdState::new(),
            batches: vec![],
            batch: None,
            fb: None,
            error: None,
        }
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn status(&self) -> CommandBufferStatus {
        self.status
    }

    /// Closed batches, in recording order.
    pub fn batches(&self) -> &[Batch] {
        &self.batches
    }

    pub(crate) fn batches_mut(&mut self) -> &mut [Batch] {
        &mut self.batches
    }

    pub fn state(&self) -> &CmdState {
        &self.state
    }

    pub fn materialize_stats(&self) -> MaterializeStats {
        self.state.stats()
    }

    /// Buffer objects of the command buffer's pools.
    pub fn pool_bos(&self) -> Vec<BoHandle> {
        self.desc_pool
            .handles()
            .chain(self.varying_pool.handles())
            .chain(self.tls_pool.handles())
            .collect()
    }

    /// Host-visible pool memory, as (GPU address, contents) pairs.
    pub(crate) fn pool_contents(&self) -> Vec<(u64, Vec<u8>)> {
        self.desc_pool
            .bos()
            .iter()
            .filter_map(|bo| bo.contents().map(|c| (bo.gpu_address(), c)))
            .collect()
    }

    /// Throws away everything recorded. Pool memory is kept for reuse.
    pub fn reset(&mut self) {
        let _span = trace_span!("reset_command_buffer").entered();
        self.batches.clear();
        self.batch = None;
        self.fb = None;
        self.error = None;
        self.state.reset();
        self.desc_pool.reset();
        self.varying_pool.reset();
        self.tls_pool.reset();
        self.status = CommandBufferStatus::Initial;
    }

    /// Starts recording, discarding anything previously recorded.
    pub fn begin(&mut self) {
        self.reset();
        self.status = CommandBufferStatus::Recording;
    }

    /// Ends recording. Returns the first error that occurred while recording, if any.
    ///
    /// Ending a command buffer that is not recording fails and leaves it as it was.
    pub fn end(&mut self) -> Result<(), Error> {
        if self.status != CommandBufferStatus::Recording {
            return Err(self
                .error
                .clone()
                .unwrap_or_else(|| Error::invalid_usage("command buffer is not recording")));
        }
        self.record(|cb| {
            if cb.fb.is_some() {
                return Err(Error::invalid_usage("recording ended inside a render pass"));
            }
            cb.close_batch()
        });
        match self.error.clone() {
            Some(err) => {
                self.status = CommandBufferStatus::Invalid;
                Err(err)
            }
            None => {
                self.status = CommandBufferStatus::Executable;
                Ok(())
            }
        }
    }

    /// Runs a recording command, latching its error.
    fn record(&mut self, f: impl FnOnce(&mut CommandBuffer) -> Result<(), Error>) {
        if self.error.is_some() {
            return;
        }
        let result = if self.status != CommandBufferStatus::Recording {
            Err(Error::invalid_usage("command recorded outside of begin/end"))
        } else {
            f(self)
        };
        if let Err(err) = result {
            warn!("recording failed: {}", err);
            if let Some(batch) = self.batch.take() {
                trace!("discarding open batch with {} jobs", batch.chain.len());
            }
            self.error = Some(err);
        }
    }

    //----------------------------------------------------------------------------------------------
    // State

    pub fn bind_pipeline(&mut self, pipeline: &Arc<Pipeline>) {
        self.record(|cb| {
            cb.state.bind_pipeline(pipeline.clone());
            Ok(())
        })
    }

    pub fn bind_vertex_buffers(&mut self, first: u32, buffers: &[Buffer]) {
        self.record(|cb| cb.state.bind_vertex_buffers(first, buffers))
    }

    pub fn bind_index_buffer(&mut self, buffer: &Buffer, index_type: IndexType) {
        self.record(|cb| {
            cb.state.bind_index_buffer(buffer.clone(), index_type);
            Ok(())
        })
    }

    pub fn bind_descriptor_sets(
        &mut self,
        bind_point: BindPoint,
        first_set: u32,
        sets: &[Arc<DescriptorSet>],
        dynamic_offsets: &[u32],
    ) {
        self.record(|cb| {
            cb.state
                .bind_descriptor_sets(bind_point, first_set, sets, dynamic_offsets)
        })
    }

    pub fn push_constants(&mut self, offset: u32, data: &[u8]) {
        self.record(|cb| cb.state.push_constants(offset, data))
    }

    pub fn set_viewport(&mut self, viewport: ViewportState) {
        self.record(|cb| {
            cb.state.set_viewport(viewport);
            Ok(())
        })
    }

    pub fn set_scissor(&mut self, scissor: Rect2D) {
        self.record(|cb| {
            cb.state.set_scissor(scissor);
            Ok(())
        })
    }

    pub fn set_line_width(&mut self, width: f32) {
        self.record(|cb| {
            cb.state.set_line_width(width);
            Ok(())
        })
    }

    pub fn set_depth_bias(&mut self, bias: DepthBias) {
        self.record(|cb| {
            cb.state.set_depth_bias(bias);
            Ok(())
        })
    }

    pub fn set_blend_constants(&mut self, constants: [f32; 4]) {
        self.record(|cb| {
            cb.state.set_blend_constants(constants);
            Ok(())
        })
    }

    pub fn set_depth_bounds(&mut self, min: f32, max: f32) {
        self.record(|cb| {
            cb.state.set_depth_bounds(min, max);
            Ok(())
        })
    }

    pub fn set_stencil_compare_mask(&mut self, faces: StencilFaces, mask: u8) {
        self.record(|cb| {
            cb.state.set_stencil_compare_mask(faces, mask);
            Ok(())
        })
    }

    pub fn set_stencil_write_mask(&mut self, faces: StencilFaces, mask: u8) {
        self.record(|cb| {
            cb.state.set_stencil_write_mask(faces, mask);
            Ok(())
        })
    }

    pub fn set_stencil_reference(&mut self, faces: StencilFaces, reference: u8) {
        self.record(|cb| {
            cb.state.set_stencil_reference(faces, reference);
            Ok(())
        })
    }

    pub fn set_discard_rectangles(&mut self, first: u32, rects: &[Rect2D]) {
        self.record(|cb| cb.state.set_discard_rectangles(first, rects))
    }

    //----------------------------------------------------------------------------------------------
    // Render passes

    pub fn begin_rendering(&mut self, info: &RenderingInfo) {
        self.record(|cb| {
            if cb.fb.is_some() {
                return Err(Error::invalid_usage("render pass already active"));
            }
            let fb = FramebufferInfo::from_rendering(info, cb.device.caps())?;
            // work recorded outside of the render pass does not belong to its batches
            cb.close_batch()?;
            let has_clears = fb.has_clears();
            cb.fb = Some(fb);
            cb.state.framebuffer_changed();
            if has_clears {
                cb.open_batch()?;
            }
            Ok(())
        })
    }

    /// Moves to the next subpass. A subpass rendering to the same attachments keeps the
    /// current batch, and the load operations of its attachments are ignored.
    pub fn next_subpass(&mut self, info: &RenderingInfo) {
        self.record(|cb| {
            let current = cb
                .fb
                .as_ref()
                .ok_or_else(|| Error::invalid_usage("next subpass outside of a render pass"))?;
            let fb = FramebufferInfo::from_rendering(info, cb.device.caps())?;
            if current.is_compatible(&fb) {
                return Ok(());
            }
            cb.close_batch()?;
            let has_clears = fb.has_clears();
            cb.fb = Some(fb);
            cb.state.framebuffer_changed();
            if has_clears {
                cb.open_batch()?;
            }
            Ok(())
        })
    }

    pub fn end_rendering(&mut self) {
        self.record(|cb| {
            if cb.fb.is_none() {
                return Err(Error::invalid_usage("no active render pass"));
            }
            cb.close_batch()?;
            cb.fb = None;
            Ok(())
        })
    }

    /// Closes the current batch and continues the render pass in a new one.
    ///
    /// Used when later work must observe everything rendered so far, for example when a
    /// draw reads an attachment written by a previous draw.
    pub fn split_render_pass(&mut self) {
        self.record(|cb| {
            if cb.fb.is_none() {
                return Err(Error::invalid_usage("render pass split outside of a render pass"));
            }
            cb.split_batch()
        })
    }

    //----------------------------------------------------------------------------------------------
    // Work

    pub fn draw(&mut self, draw: &Draw) {
        self.record(|cb| {
            cb.check_draw()?;
            if draw.vertex_count == 0 || draw.instance_count == 0 {
                return Ok(());
            }
            cb.record_draw(&DrawInfo::new(draw)?)
        })
    }

    pub fn draw_indexed(&mut self, draw: &DrawIndexed) {
        self.record(|cb| {
            cb.check_draw()?;
            if draw.index_count == 0 || draw.instance_count == 0 {
                return Ok(());
            }
            let (buffer, index_type) = cb
                .state
                .index_buffer
                .clone()
                .ok_or_else(|| Error::invalid_usage("indexed draw without an index buffer"))?;
            let info = DrawInfo::indexed(draw, &buffer, index_type)?;
            cb.record_draw(&info)?;
            if let Some(batch) = cb.batch.as_mut() {
                batch.bos.push(buffer.handle());
            }
            Ok(())
        })
    }

    pub fn dispatch(&mut self, dispatch: &Dispatch) {
        self.record(|cb| cb.record_dispatch(dispatch))
    }

    /// Copies `size` bytes from `src` to `dst` with a compute job running `pipeline`, the
    /// buffer copy shader.
    ///
    /// The copy has its own batch and leaves the recorded state untouched.
    pub fn copy_buffer(&mut self, pipeline: &Pipeline, src: &Buffer, dst: &Buffer, size: u64) {
        self.record(|cb| cb.record_copy(pipeline, src, dst, size))
    }

    pub fn set_event(&mut self, event: &Arc<Event>) {
        self.record(|cb| cb.add_event_op(EventOpKind::Set, event))
    }

    pub fn reset_event(&mut self, event: &Arc<Event>) {
        self.record(|cb| cb.add_event_op(EventOpKind::Reset, event))
    }

    pub fn wait_events(&mut self, events: &[Arc<Event>]) {
        self.record(|cb| {
            for event in events {
                cb.add_event_op(EventOpKind::Wait, event)?;
            }
            Ok(())
        })
    }

    //----------------------------------------------------------------------------------------------
    // Batches

    fn open_batch(&mut self) -> Result<(), Error> {
        debug_assert!(self.batch.is_none());
        trace!("opening batch (render pass: {})", self.fb.is_some());
        let mut batch = Batch::new(self.fb.clone());
        if batch.fb.as_ref().map_or(false, FramebufferInfo::has_clears) {
            self.alloc_fb_descriptor(&mut batch)?;
        }
        self.batch = Some(batch);
        Ok(())
    }

    /// Closes the open batch and opens a new one continuing the render pass, if any.
    fn split_batch(&mut self) -> Result<(), Error> {
        self.close_batch()?;
        if let Some(fb) = self.fb.as_mut() {
            fb.preload_after_split();
        }
        self.open_batch()
    }

    fn take_batch(&mut self) -> Result<Batch, Error> {
        self.batch
            .take()
            .ok_or_else(|| Error::invalid_usage("no open batch"))
    }

    /// Closes the open batch, writing all of its descriptors and jobs to GPU memory.
    fn close_batch(&mut self) -> Result<(), Error> {
        let mut batch = match self.batch.take() {
            Some(batch) => batch,
            None => return Ok(()),
        };
        let _span = trace_span!("close_batch", jobs = batch.chain.len()).entered();
        let device = self.device.clone();
        let caps = device.caps();

        if !batch.has_content() {
            if batch.event_ops.is_empty() {
                trace!("dropping empty batch");
                return Ok(());
            }
            // event operations need a job to hang on
            batch.chain.add_job(caps, JobType::Null, None, vec![]);
        }

        if batch.tls.is_some() {
            self.write_local_storage(&mut batch, caps)?;
        }

        if batch.chain.first_tiler().is_some() {
            let needs_preload = batch.fb.as_ref().map_or(false, FramebufferInfo::needs_preload);
            if needs_preload && !caps.has(Features::FRAME_SHADER_PRELOAD) {
                self.inject_preload(&mut batch, caps)?;
            }
            if caps.has(Features::WRITE_VALUE_BEFORE_TILER) {
                batch
                    .chain
                    .initialize_tiler(batch.polygon_list.unwrap_or_default());
            }
        }

        if let (Some(fb), Some(fbd)) = (batch.fb.as_ref(), batch.fbd) {
            let descriptor = fb.encode(
                caps,
                batch.tiler_context.unwrap_or_default(),
                batch.tls().unwrap_or_default(),
                device.sample_positions(fb.samples),
            );
            self.desc_pool.write(&fbd, 0, &descriptor)?;

            let (bound_min, bound_max) = fb.tile_bounds(caps.tile_shift);
            let job = self.desc_pool.alloc(caps.job_sizes.fragment, caps.job_sizes.align)?;
            let header = JobHeader::new(JobType::Fragment, 1, [0, 0], 0);
            let payload = FragmentJobPayload {
                bound_min,
                bound_max,
                framebuffer: fbd.gpu,
            };
            self.desc_pool.write(&job, 0, bytes_of(&header))?;
            self.desc_pool
                .write(&job, JOB_HEADER_SIZE as u64, bytes_of(&payload))?;
            batch.fragment_job = Some(job.gpu);
            let fb_bos = fb.bos();
            batch.bos.extend(fb_bos);
        }

        batch.jobs = batch.chain.finalize(caps, &mut self.desc_pool)?;
        batch.bos.sort();
        batch.bos.dedup();
        trace!(
            "closed batch {}: {} jobs, fragment job {:?}",
            self.batches.len(),
            batch.jobs.len(),
            batch.fragment_job
        );
        self.batches.push(batch);
        Ok(())
    }

    /// Allocates thread and workgroup storage and fills the local storage descriptor.
    fn write_local_storage(&mut self, batch: &mut Batch, caps: &Capabilities) -> Result<(), Error> {
        let desc = match batch.tls {
            Some(desc) => desc,
            None => return Ok(()),
        };
        let mut storage = LocalStorage::default();
        let tls_size = tls_total_size(batch.tls_size, caps);
        if tls_size > 0 {
            storage.tls_base = self.tls_pool.alloc(tls_size, 4096)?.gpu;
            storage.tls_size = tls_size_per_thread(batch.tls_size);
        }
        if batch.wls_size > 0 {
            let total = (wls_instance_size(batch.wls_size) as u64)
                .checked_mul(batch.wls_instances)
                .and_then(|size| size.checked_mul(caps.core_count as u64))
                .ok_or(Error::DeviceOutOfMemory)?;
            storage.wls_base = self.tls_pool.alloc(total, 4096)?.gpu;
            storage.wls_size = wls_instance_size(batch.wls_size);
            storage.wls_instances_log2 = batch.wls_instances.trailing_zeros();
        }
        self.desc_pool.write(&desc, 0, bytes_of(&storage))
    }

    /// Injects a tiler job drawing the preload shader over the whole framebuffer, ahead of
    /// every other tiler job of the batch.
    fn inject_preload(&mut self, batch: &mut Batch, caps: &Capabilities) -> Result<(), Error> {
        let fb = match batch.fb.as_ref() {
            Some(fb) => fb,
            None => return Ok(()),
        };
        let renderer_state = self
            .device
            .preload_rsd()
            .ok_or_else(|| Error::invalid_usage("no preload shader on this device"))?;
        let (w, h) = (fb.width as f32, fb.height as f32);
        #[rustfmt::skip]
        let positions: [f32; 16] = [
            0.0, 0.0, 0.0, 1.0,
            w, 0.0, 0.0, 1.0,
            0.0, h, 0.0, 1.0,
            w, h, 0.0, 1.0,
        ];
        let position = self.desc_pool.upload_slice(&positions, 64)?;
        let viewport = self.desc_pool.upload_pod(
            &Viewport {
                min_x: 0,
                min_y: 0,
                max_x: (fb.width - 1) as u16,
                max_y: (fb.height - 1) as u16,
                min_depth: 0.0,
                max_depth: 1.0,
                discard_rectangles: Default::default(),
            },
            64,
        )?;
        let payload = TilerJobPayload {
            invocation: Invocation::pack([1, 4, 1], [1, 1, 1], true, false)?,
            primitive: PrimitiveDescriptor {
                draw_mode: Topology::TriangleStrip.hw_draw_mode(),
                index_count: 4,
                line_width: 1.0,
                ..Default::default()
            },
            tiler_context: batch.tiler_context.unwrap_or_default(),
            draw: DrawDescriptor {
                renderer_state,
                position,
                viewport,
                thread_storage: batch.tls().unwrap_or_default(),
                fbd: batch.fbd().unwrap_or_default(),
                ..Default::default()
            },
        };
        batch.chain.inject_tiler(caps, bytes_of(&payload).to_vec());
        Ok(())
    }

    fn alloc_fb_descriptor(&mut self, batch: &mut Batch) -> Result<(), Error> {
        if batch.fbd.is_some() {
            return Ok(());
        }
        if let Some(fb) = batch.fb.as_ref() {
            batch.fbd = Some(self.desc_pool.alloc(fb.descriptor_size(), 64)?);
        }
        Ok(())
    }

    fn alloc_tls_descriptor(&mut self, batch: &mut Batch) -> Result<(), Error> {
        if batch.tls.is_none() {
            batch.tls = Some(self.desc_pool.alloc(size_of::<LocalStorage>() as u64, 64)?);
        }
        Ok(())
    }

    fn alloc_tiler_context(&mut self, batch: &mut Batch) -> Result<(), Error> {
        if batch.tiler_context.is_some() {
            return Ok(());
        }
        let fb = match batch.fb.as_ref() {
            Some(fb) => fb,
            None => return Ok(()),
        };
        let caps = self.device.caps();
        let heap = self.device.tiler_heap();
        let heap_ptr = if caps.has(Features::TILER_HEAP_DESCRIPTOR) {
            self.desc_pool.upload_pod(
                &TilerHeap {
                    base: heap.gpu_address(),
                    top: heap.gpu_address() + heap.size(),
                    size: heap.size() as u32,
                    _pad: 0,
                },
                64,
            )?
        } else {
            heap.gpu_address()
        };
        let polygon_list = if caps.has(Features::WRITE_VALUE_BEFORE_TILER) {
            let tiles = ((fb.width as u64 + 15) >> 4) * ((fb.height as u64 + 15) >> 4);
            Some(
                self.varying_pool
                    .alloc(POLYGON_LIST_HEADER_SIZE + tiles * 8, 64)?
                    .gpu,
            )
        } else {
            None
        };
        let context = TilerContext {
            heap: heap_ptr,
            fb_width: fb.width,
            fb_height: fb.height,
            hierarchy_mask: HIERARCHY_MASK_ALL,
            sample_count: fb.samples,
            polygon_list: polygon_list.unwrap_or_default(),
        };
        batch.tiler_context = Some(self.desc_pool.upload_pod(&context, 64)?);
        batch.polygon_list = polygon_list;
        Ok(())
    }

    fn check_draw(&self) -> Result<(), Error> {
        if self.fb.is_none() {
            return Err(Error::invalid_usage("draw outside of a render pass"));
        }
        if self.state.pipeline(BindPoint::Graphics).is_none() {
            return Err(Error::invalid_usage("draw without a bound graphics pipeline"));
        }
        Ok(())
    }

    fn record_draw(&mut self, info: &DrawInfo) -> Result<(), Error> {
        let _span = trace_span!("draw", vertices = info.vertex_range, instances = info.instance_count)
            .entered();
        let device = self.device.clone();
        let caps = device.caps();
        let pipeline = self
            .state
            .pipeline(BindPoint::Graphics)
            .cloned()
            .ok_or_else(|| Error::invalid_usage("draw without a bound graphics pipeline"))?;
        let (fb_width, fb_height) = match self.fb.as_ref() {
            Some(fb) => (fb.width, fb.height),
            None => return Err(Error::invalid_usage("draw outside of a render pass")),
        };

        if let Some(batch) = self.batch.as_ref() {
            if batch.chain.job_index() >= caps.max_job_index.saturating_sub(caps.jobs_per_draw) {
                trace!("out of job indices, splitting batch");
                self.split_batch()?;
            }
        }
        if self.batch.is_none() {
            self.open_batch()?;
        }
        let mut batch = self.take_batch()?;

        self.alloc_fb_descriptor(&mut batch)?;
        self.alloc_tls_descriptor(&mut batch)?;
        if pipeline.rasterizer_enabled {
            self.alloc_tiler_context(&mut batch)?;
        }
        batch.tls_size = batch.tls_size.max(pipeline.tls_size());

        let tables = self
            .state
            .materialize_graphics(&mut self.desc_pool, &info.graphics_inputs(fb_width, fb_height))?;
        let varyings = Varyings::alloc(
            &mut self.varying_pool,
            &mut self.desc_pool,
            info,
            pipeline.varying_stride,
        )?;
        let descriptors = BatchDescriptors {
            tls: batch.tls().unwrap_or_default(),
            fbd: batch.fbd().unwrap_or_default(),
            tiler_context: batch.tiler_context.unwrap_or_default(),
        };

        let vertex = vertex_payload(&pipeline, info, &tables, &varyings, &descriptors);
        let vertex_index = batch
            .chain
            .add_job(caps, JobType::Vertex, None, bytes_of(&vertex).to_vec());
        if pipeline.rasterizer_enabled {
            let tiler = tiler_payload(
                &pipeline,
                info,
                &tables,
                &varyings,
                &descriptors,
                self.state.line_width(),
            );
            batch.chain.add_job(
                caps,
                JobType::Tiler,
                Some(vertex_index),
                bytes_of(&tiler).to_vec(),
            );
        }

        batch
            .bos
            .extend(self.state.referenced_bos(BindPoint::Graphics));
        self.state.clear_graphics_dirty();
        self.batch = Some(batch);
        Ok(())
    }

    fn record_dispatch(&mut self, dispatch: &Dispatch) -> Result<(), Error> {
        if self.fb.is_some() {
            return Err(Error::invalid_usage("dispatch inside a render pass"));
        }
        let pipeline = self
            .state
            .pipeline(BindPoint::Compute)
            .cloned()
            .ok_or_else(|| Error::invalid_usage("dispatch without a bound compute pipeline"))?;
        if dispatch.is_empty() {
            return Ok(());
        }
        let invocation = dispatch.invocation(pipeline.local_size)?;
        let _span = trace_span!("dispatch", workgroups = ?dispatch.workgroup_count).entered();
        let device = self.device.clone();
        let caps = device.caps();

        self.close_batch()?;
        self.open_batch()?;
        let mut batch = self.take_batch()?;
        self.alloc_tls_descriptor(&mut batch)?;
        batch.tls_size = pipeline.tls_size();
        batch.wls_size = pipeline.cs.wls_size;
        batch.wls_instances = wls_instances(dispatch.workgroup_count);
        trace!(
            "local storage: {} bytes of TLS, {} bytes of WLS",
            tls_total_size(batch.tls_size, caps),
            wls_total_size(batch.wls_size, dispatch.workgroup_count, caps)
        );

        let tables = self
            .state
            .materialize_compute(&mut self.desc_pool, &dispatch.inputs())?;
        let payload = compute_payload(
            &pipeline,
            invocation,
            &tables,
            batch.tls().unwrap_or_default(),
        );
        batch
            .chain
            .add_job(caps, JobType::Compute, None, bytes_of(&payload).to_vec());
        batch.bos.extend(self.state.referenced_bos(BindPoint::Compute));
        self.state.clear_compute_dirty();
        self.batch = Some(batch);
        self.close_batch()
    }

    fn record_copy(
        &mut self,
        pipeline: &Pipeline,
        src: &Buffer,
        dst: &Buffer,
        size: u64,
    ) -> Result<(), Error> {
        if self.fb.is_some() {
            return Err(Error::invalid_usage("buffer copy inside a render pass"));
        }
        if pipeline.bind_point != BindPoint::Compute {
            return Err(Error::invalid_usage("buffer copy needs a compute pipeline"));
        }
        if size > src.size || size > dst.size {
            return Err(Error::invalid_usage(format!(
                "copy of {} bytes out of bounds (source {} bytes, destination {} bytes)",
                size, src.size, dst.size
            )));
        }
        if size == 0 {
            return Ok(());
        }
        let _span = trace_span!("copy_buffer", size).entered();
        let device = self.device.clone();
        let caps = device.caps();

        self.close_batch()?;
        self.open_batch()?;
        let mut batch = self.take_batch()?;
        self.alloc_tls_descriptor(&mut batch)?;
        batch.tls_size = pipeline.tls_size();

        let push = CopyPushConstants {
            src: src.address(),
            dst: dst.address(),
            size,
            _pad: 0,
        };
        let push_constants = self.desc_pool.upload_pod(&push, 16)?;
        let ubos = self.desc_pool.upload_pod(
            &UniformBuffer {
                pointer: push_constants,
                size: size_of::<CopyPushConstants>() as u32,
                _pad: 0,
            },
            64,
        )?;

        let invocations = (size + COPY_GRANULARITY - 1) / COPY_GRANULARITY;
        let local_x = pipeline.local_size[0].max(1) as u64;
        let groups = u32::try_from((invocations + local_x - 1) / local_x)
            .map_err(|_| Error::invalid_usage("buffer copy too large for one dispatch"))?;
        let invocation = Invocation::pack([groups, 1, 1], pipeline.local_size, false, false)?;
        let payload = ComputeJobPayload {
            invocation,
            job_task_split: invocation.workgroups_x_shift(),
            _pad: 0,
            draw: DrawDescriptor {
                renderer_state: pipeline.cs.binary,
                uniform_buffers: ubos,
                push_uniforms: push_constants,
                thread_storage: batch.tls().unwrap_or_default(),
                ..Default::default()
            },
        };
        batch
            .chain
            .add_job(caps, JobType::Compute, None, bytes_of(&payload).to_vec());
        batch.blit = Some(BlitBos {
            src: src.handle(),
            dst: dst.handle(),
        });
        batch.bos.extend([src.handle(), dst.handle()]);
        self.batch = Some(batch);
        self.close_batch()
    }

    /// Attaches an event operation to a batch boundary.
    ///
    /// Sets and resets complete the batch they are attached to, so that they apply after
    /// everything recorded before them. Waits start a new batch, so that they apply before
    /// everything recorded after them.
    fn add_event_op(&mut self, kind: EventOpKind, event: &Arc<Event>) -> Result<(), Error> {
        let op = EventOp {
            kind,
            event: event.clone(),
        };
        match kind {
            EventOpKind::Set | EventOpKind::Reset => {
                if self.batch.is_none() {
                    self.open_batch()?;
                    self.attach_event_op(op)?;
                    self.close_batch()
                } else {
                    self.attach_event_op(op)?;
                    self.split_batch()
                }
            }
            EventOpKind::Wait => {
                match self.batch.as_ref() {
                    None => self.open_batch()?,
                    Some(batch) if batch.has_content() => self.split_batch()?,
                    Some(_) => {}
                }
                self.attach_event_op(op)
            }
        }
    }

    fn attach_event_op(&mut self, op: EventOp) -> Result<(), Error> {
        let batch = self
            .batch
            .as_mut()
            .ok_or_else(|| Error::invalid_usage("no open batch"))?;
        trace!("attaching {:?}", op);
        batch.event_ops.push(op);
        Ok(())
    }
}

impl fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("status", &self.status)
            .field("batches", &self.batches)
            .field("open_batch", &self.batch.is_some())
            .field("error", &self.error)
            .finish()
    }
}
