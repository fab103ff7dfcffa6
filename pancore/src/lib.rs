mod batch;
pub mod caps;
mod command_buffer;
pub mod config;
pub(crate) mod descriptor;
mod device;
mod error;
mod event;
pub mod hw;
pub mod job;
pub mod memory;
pub(crate) mod pipeline;
mod queue;
pub(crate) mod render_pass;
pub(crate) mod resource;
pub mod serial;
pub mod state;

pub use crate::batch::Batch;
pub use crate::batch::BlitBos;
pub use crate::batch::EventOp;
pub use crate::batch::EventOpKind;
pub use crate::caps::Capabilities;
pub use crate::caps::Features;
pub use crate::command_buffer::CommandBuffer;
pub use crate::command_buffer::CommandBufferStatus;
pub use crate::config::DebugFlags;
pub use crate::config::DriverConfig;
pub use crate::descriptor::DescriptorCounts;
pub use crate::descriptor::DescriptorPool;
pub use crate::descriptor::DescriptorSet;
pub use crate::descriptor::DescriptorSetLayout;
pub use crate::device::Device;
pub use crate::error::Error;
pub use crate::event::Event;
pub use crate::hw::Format;
pub use crate::pipeline::BindPoint;
pub use crate::pipeline::Pipeline;
pub use crate::pipeline::PipelineLayout;
pub use crate::pipeline::ShaderInfo;
pub use crate::pipeline::Topology;
pub use crate::pipeline::VertexAttribute;
pub use crate::pipeline::VertexBinding;
pub use crate::pipeline::MAX_PUSH_CONSTANTS_SIZE;
pub use crate::pipeline::MAX_SETS;
pub use crate::pipeline::MAX_VERTEX_ATTRIBS;
pub use crate::queue::Queue;
pub use crate::render_pass::ColorAttachment;
pub use crate::render_pass::DepthStencilAttachment;
pub use crate::render_pass::FramebufferInfo;
pub use crate::render_pass::LoadOp;
pub use crate::render_pass::RenderingInfo;
pub use crate::resource::Buffer;
pub use crate::resource::ImageView;

pub use pankmod;
