#![allow(dead_code)]

use pancore::{
    memory::{BoFlags, BoScope},
    pankmod::{KernelDevice, SoftKernel},
    state::Rect2D,
    Buffer, Capabilities, ColorAttachment, CommandBuffer, Device, DriverConfig, Format,
    ImageView, LoadOp, Pipeline, PipelineLayout, RenderingInfo, ShaderInfo,
};
use std::sync::Arc;

pub const V5: u32 = 0x860;
pub const V7: u32 = 0x7212;

pub const VS_BINARY: u64 = 0x1_0000;
pub const FS_BINARY: u64 = 0x2_0000;
pub const CS_BINARY: u64 = 0x3_0000;

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// A device on top of an emulated kernel.
pub struct Fixture {
    pub kernel: Arc<SoftKernel>,
    pub device: Arc<Device>,
}

impl Fixture {
    pub fn new(gpu_prod_id: u32) -> Fixture {
        Fixture::with_config(gpu_prod_id, DriverConfig::default())
    }

    pub fn with_config(gpu_prod_id: u32, config: DriverConfig) -> Fixture {
        init_logging();
        let kernel = Arc::new(SoftKernel::new(gpu_prod_id));
        let device = Device::new(kernel.clone(), config).unwrap();
        Fixture { kernel, device }
    }

    /// Device with a modified capability table.
    pub fn with_caps(gpu_prod_id: u32, f: impl FnOnce(&mut Capabilities)) -> Fixture {
        init_logging();
        let kernel = Arc::new(SoftKernel::new(gpu_prod_id));
        let mut caps = Capabilities::from_props(&kernel.props()).unwrap();
        f(&mut caps);
        let device = Device::with_capabilities(kernel.clone(), DriverConfig::default(), caps).unwrap();
        Fixture { kernel, device }
    }

    pub fn command_buffer(&self) -> CommandBuffer {
        let mut cb = self.device.create_command_buffer();
        cb.begin();
        cb
    }

    /// Host-visible buffer filled with `contents`.
    pub fn buffer(&self, contents: &[u8]) -> Buffer {
        let mut bo = self
            .device
            .allocator()
            .create_bo(contents.len() as u64, BoFlags::empty(), BoScope::Object)
            .unwrap();
        bo.write(0, contents).unwrap();
        let size = contents.len() as u64;
        Buffer::new(Arc::new(bo), 0, size)
    }

    pub fn color_target(&self, width: u32, height: u32) -> ImageView {
        let bo = self
            .device
            .allocate_memory((width * height * 4) as u64, BoFlags::empty())
            .unwrap();
        ImageView::new(bo, 0, Format::R8G8B8A8Unorm, width, height)
    }

    pub fn graphics_pipeline(&self) -> Arc<Pipeline> {
        let layout = PipelineLayout::new(vec![], 0);
        Arc::new(Pipeline::graphics(
            layout,
            ShaderInfo {
                binary: VS_BINARY,
                ..Default::default()
            },
            Some(ShaderInfo {
                binary: FS_BINARY,
                ..Default::default()
            }),
        ))
    }

    pub fn compute_pipeline(&self) -> Arc<Pipeline> {
        let layout = PipelineLayout::new(vec![], 0);
        Arc::new(Pipeline::compute(
            layout,
            ShaderInfo {
                binary: CS_BINARY,
                tls_size: 64,
                wls_size: 256,
            },
            [8, 8, 1],
        ))
    }
}

pub fn rendering(view: &ImageView, load_op: LoadOp) -> RenderingInfo {
    RenderingInfo {
        render_area: Rect2D::new(0, 0, view.width, view.height),
        color_attachments: vec![ColorAttachment {
            view: view.clone(),
            load_op,
            clear_color: [0xff00_00ff, 0, 0, 0],
        }],
        depth_stencil_attachment: None,
    }
}
