//! Render pass attachments and the framebuffer state of a batch.
use crate::{
    caps::{Capabilities, Features},
    hw::{
        FramebufferDescriptor, RenderTargetDescriptor, FBD_PRE_FRAME_PRELOAD, RT_CLEAR,
        RT_PRELOAD, ZS_CLEAR_S, ZS_CLEAR_Z, ZS_PRELOAD_S, ZS_PRELOAD_Z,
    },
    resource::ImageView,
    state::Rect2D,
    Error,
};
use pankmod::BoHandle;
use std::mem::size_of;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LoadOp {
    /// Previous contents are reloaded.
    Load,
    Clear,
    DontCare,
}

#[derive(Clone, Debug)]
pub struct ColorAttachment {
    pub view: ImageView,
    pub load_op: LoadOp,
    /// Clear color, already packed in the attachment format.
    pub clear_color: [u32; 4],
}

#[derive(Clone, Debug)]
pub struct DepthStencilAttachment {
    pub view: ImageView,
    pub depth_load_op: LoadOp,
    pub stencil_load_op: LoadOp,
    pub clear_depth: f32,
    pub clear_stencil: u8,
}

#[derive(Clone, Debug)]
pub struct RenderingInfo {
    pub render_area: Rect2D,
    pub color_attachments: Vec<ColorAttachment>,
    pub depth_stencil_attachment: Option<DepthStencilAttachment>,
}

#[derive(Clone, Debug)]
pub struct RenderTargetInfo {
    pub view: ImageView,
    pub clear: bool,
    pub preload: bool,
    pub clear_color: [u32; 4],
}

#[derive(Clone, Debug)]
pub struct ZsInfo {
    pub view: ImageView,
    pub clear_z: bool,
    pub clear_s: bool,
    pub preload_z: bool,
    pub preload_s: bool,
    pub clear_depth: f32,
    pub clear_stencil: u8,
}

/// Attachments of the current render pass, with what happens to their contents when a
/// batch starts rendering into them.
#[derive(Clone, Debug)]
pub struct FramebufferInfo {
    pub width: u32,
    pub height: u32,
    pub samples: u32,
    pub render_area: Rect2D,
    pub rts: Vec<RenderTargetInfo>,
    pub zs: Option<ZsInfo>,
}

impl FramebufferInfo {
    pub fn from_rendering(info: &RenderingInfo, caps: &Capabilities) -> Result<FramebufferInfo, Error> {
        if info.color_attachments.len() > caps.max_render_targets {
            return Err(Error::invalid_usage(format!(
                "{} render targets, at most {} supported",
                info.color_attachments.len(),
                caps.max_render_targets
            )));
        }
        let area = info.render_area;
        if area.x < 0 || area.y < 0 || area.width == 0 || area.height == 0 {
            return Err(Error::invalid_usage("invalid render area"));
        }

        let samples = info
            .color_attachments
            .iter()
            .map(|a| a.view.samples)
            .chain(info.depth_stencil_attachment.iter().map(|a| a.view.samples))
            .max()
            .unwrap_or(1);

        let rts = info
            .color_attachments
            .iter()
            .map(|a| RenderTargetInfo {
                view: a.view.clone(),
                clear: a.load_op == LoadOp::Clear,
                preload: a.load_op == LoadOp::Load,
                clear_color: a.clear_color,
            })
            .collect();

        let zs = info.depth_stencil_attachment.as_ref().map(|a| {
            let format = a.view.format;
            ZsInfo {
                view: a.view.clone(),
                clear_z: format.has_depth() && a.depth_load_op == LoadOp::Clear,
                clear_s: format.has_stencil() && a.stencil_load_op == LoadOp::Clear,
                preload_z: format.has_depth() && a.depth_load_op == LoadOp::Load,
                preload_s: format.has_stencil() && a.stencil_load_op == LoadOp::Load,
                clear_depth: a.clear_depth,
                clear_stencil: a.clear_stencil,
            }
        });

        Ok(FramebufferInfo {
            width: area.x as u32 + area.width,
            height: area.y as u32 + area.height,
            samples,
            render_area: area,
            rts,
            zs,
        })
    }

    pub fn has_clears(&self) -> bool {
        self.rts.iter().any(|rt| rt.clear)
            || self.zs.as_ref().map_or(false, |zs| zs.clear_z || zs.clear_s)
    }

    pub fn needs_preload(&self) -> bool {
        self.rts.iter().any(|rt| rt.preload)
            || self.zs.as_ref().map_or(false, |zs| zs.preload_z || zs.preload_s)
    }

    /// Sets up the framebuffer of a batch that continues a render pass: what the previous
    /// batch rendered is reloaded instead of cleared.
    pub fn preload_after_split(&mut self) {
        for rt in self.rts.iter_mut() {
            rt.clear = false;
            rt.preload = true;
        }
        if let Some(zs) = self.zs.as_mut() {
            let format = zs.view.format;
            if format.has_depth() {
                zs.clear_z = false;
                zs.preload_z = true;
            }
            if format.has_stencil() {
                zs.clear_s = false;
                zs.preload_s = true;
            }
        }
    }

    /// Whether a batch rendering to `self` can keep rendering to `other`.
    pub fn is_compatible(&self, other: &FramebufferInfo) -> bool {
        self.width == other.width
            && self.height == other.height
            && self.samples == other.samples
            && self.rts.len() == other.rts.len()
            && self
                .rts
                .iter()
                .zip(&other.rts)
                .all(|(a, b)| a.view.same_view(&b.view))
            && match (&self.zs, &other.zs) {
                (Some(a), Some(b)) => a.view.same_view(&b.view),
                (None, None) => true,
                _ => false,
            }
    }

    pub fn bos(&self) -> Vec<BoHandle> {
        self.rts
            .iter()
            .map(|rt| rt.view.handle())
            .chain(self.zs.iter().map(|zs| zs.view.handle()))
            .collect()
    }

    /// Bytes of the framebuffer descriptor and its render target descriptors.
    pub fn descriptor_size(&self) -> u64 {
        (size_of::<FramebufferDescriptor>() + self.rts.len() * size_of::<RenderTargetDescriptor>())
            as u64
    }

    /// Tile coordinates covered by the render area, as packed in fragment jobs.
    pub fn tile_bounds(&self, tile_shift: u32) -> (u32, u32) {
        let area = &self.render_area;
        let min_x = area.x as u32 >> tile_shift;
        let min_y = area.y as u32 >> tile_shift;
        let max_x = (self.width - 1) >> tile_shift;
        let max_y = (self.height - 1) >> tile_shift;
        (min_x | min_y << 16, max_x | max_y << 16)
    }

    /// Encodes the framebuffer descriptor followed by the render target descriptors.
    pub(crate) fn encode(
        &self,
        caps: &Capabilities,
        tiler_context: u64,
        thread_storage: u64,
        sample_positions: u64,
    ) -> Vec<u8> {
        let (bound_min, bound_max) = self.tile_bounds(caps.tile_shift);
        let mut fbd = FramebufferDescriptor {
            width: self.width,
            height: self.height,
            bound_min,
            bound_max,
            sample_count: self.samples,
            rt_count: self.rts.len() as u32,
            tiler: tiler_context,
            thread_storage,
            sample_positions,
            ..Default::default()
        };
        if self.needs_preload() && caps.has(Features::FRAME_SHADER_PRELOAD) {
            fbd.pre_frame = FBD_PRE_FRAME_PRELOAD;
        }
        if let Some(zs) = &self.zs {
            let mut flags = 0;
            if zs.clear_z {
                flags |= ZS_CLEAR_Z;
            }
            if zs.clear_s {
                flags |= ZS_CLEAR_S;
            }
            if zs.preload_z {
                flags |= ZS_PRELOAD_Z;
            }
            if zs.preload_s {
                flags |= ZS_PRELOAD_S;
            }
            fbd.zs_base = zs.view.address();
            fbd.s_base = if zs.view.format.has_stencil() {
                zs.view.address()
            } else {
                0
            };
            fbd.zs_flags = flags;
            fbd.z_clear = zs.clear_depth;
            fbd.s_clear = zs.clear_stencil as u32;
        }

        let mut bytes = bytemuck::bytes_of(&fbd).to_vec();
        for rt in &self.rts {
            let mut flags = 0;
            if rt.clear {
                flags |= RT_CLEAR;
            }
            if rt.preload {
                flags |= RT_PRELOAD;
            }
            let desc = RenderTargetDescriptor {
                base: rt.view.address(),
                row_stride: rt.view.row_stride,
                format: rt.view.format.hw_code(),
                flags,
                _pad: 0,
                clear_color: rt.clear_color,
            };
            bytes.extend_from_slice(bytemuck::bytes_of(&desc));
        }
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::DriverConfig,
        hw::Format,
        memory::{Allocator, BoFlags, BoScope},
    };
    use pankmod::SoftKernel;
    use std::sync::Arc;

    fn views() -> (Arc<SoftKernel>, ImageView, ImageView) {
        let kernel = Arc::new(SoftKernel::new(0x7212));
        let alloc = Allocator::new(kernel.clone(), &DriverConfig::default(), None).unwrap();
        let bo = Arc::new(
            alloc
                .create_bo(0x20000, BoFlags::empty(), BoScope::Object)
                .unwrap(),
        );
        let color = ImageView::new(bo.clone(), 0, Format::R8G8B8A8Unorm, 64, 64);
        let depth = ImageView::new(bo, 0x10000, Format::D24UnormS8Uint, 64, 64);
        (kernel, color, depth)
    }

    fn rendering(color: &ImageView, depth: &ImageView) -> RenderingInfo {
        RenderingInfo {
            render_area: Rect2D::new(0, 0, 64, 64),
            color_attachments: vec![ColorAttachment {
                view: color.clone(),
                load_op: LoadOp::Clear,
                clear_color: [0xff00ff00, 0, 0, 0],
            }],
            depth_stencil_attachment: Some(DepthStencilAttachment {
                view: depth.clone(),
                depth_load_op: LoadOp::Clear,
                stencil_load_op: LoadOp::DontCare,
                clear_depth: 1.0,
                clear_stencil: 0,
            }),
        }
    }

    fn caps() -> Capabilities {
        Capabilities::from_props(&pankmod::DeviceProps {
            gpu_prod_id: 0x7212,
            va_bits: 32,
            page_size: 4096,
            shader_present: 1,
        })
        .unwrap()
    }

    #[test]
    fn split_turns_clears_into_preloads() {
        let (_k, color, depth) = views();
        let mut fb = FramebufferInfo::from_rendering(&rendering(&color, &depth), &caps()).unwrap();
        assert!(fb.has_clears());
        assert!(!fb.needs_preload());

        let before = fb.clone();
        fb.preload_after_split();
        assert!(!fb.has_clears());
        assert!(fb.rts[0].preload);
        let zs = fb.zs.as_ref().unwrap();
        assert!(zs.preload_z && zs.preload_s);
        assert!(before.is_compatible(&fb));
    }

    #[test]
    fn descriptor_encodes_render_targets() {
        let (_k, color, depth) = views();
        let caps = caps();
        let mut fb = FramebufferInfo::from_rendering(&rendering(&color, &depth), &caps).unwrap();
        let bytes = fb.encode(&caps, 0, 0, 0);
        assert_eq!(bytes.len() as u64, fb.descriptor_size());
        let header: FramebufferDescriptor =
            bytemuck::pod_read_unaligned(&bytes[..size_of::<FramebufferDescriptor>()]);
        assert_eq!(header.zs_flags, ZS_CLEAR_Z);
        assert_eq!(header.pre_frame, 0);
        assert_eq!(header.bound_max, 3 | 3 << 16);

        fb.preload_after_split();
        let bytes = fb.encode(&caps, 0, 0, 0);
        let rt: RenderTargetDescriptor =
            bytemuck::pod_read_unaligned(&bytes[size_of::<FramebufferDescriptor>()..]);
        assert_eq!(rt.flags, RT_PRELOAD);
        assert_eq!(rt.base, color.address());
        let header: FramebufferDescriptor =
            bytemuck::pod_read_unaligned(&bytes[..size_of::<FramebufferDescriptor>()]);
        assert_eq!(header.pre_frame, FBD_PRE_FRAME_PRELOAD);
    }

    #[test]
    fn too_many_render_targets_is_invalid() {
        let (_k, color, depth) = views();
        let mut info = rendering(&color, &depth);
        let c = info.color_attachments[0].clone();
        info.color_attachments = vec![c; 9];
        assert!(matches!(
            FramebufferInfo::from_rendering(&info, &caps()),
            Err(Error::InvalidUsage(_))
        ));
    }
}
