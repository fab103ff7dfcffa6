//! Buffers and image views as seen by the recording code.
use crate::{hw::Format, memory::Bo, Error};
use pankmod::BoHandle;
use std::sync::Arc;

/// A range of a memory allocation used as a buffer.
#[derive(Clone, Debug)]
pub struct Buffer {
    pub memory: Arc<Bo>,
    pub offset: u64,
    pub size: u64,
}

impl Buffer {
    pub fn new(memory: Arc<Bo>, offset: u64, size: u64) -> Buffer {
        Buffer {
            memory,
            offset,
            size,
        }
    }

    /// Buffer covering a whole allocation.
    pub fn whole(memory: Arc<Bo>) -> Buffer {
        let size = memory.size();
        Buffer::new(memory, 0, size)
    }

    pub fn address(&self) -> u64 {
        self.memory.gpu_address() + self.offset
    }

    pub fn handle(&self) -> BoHandle {
        self.memory.handle()
    }

    /// Reads buffer contents through the host mapping of the backing memory.
    pub fn read(&self, offset: u64, out: &mut [u8]) -> Result<(), Error> {
        if offset + out.len() as u64 > self.size {
            return Err(Error::invalid_usage("buffer read out of bounds"));
        }
        self.memory.read(self.offset + offset, out)
    }
}

/// A single-level 2D view of an image, usable as an attachment.
#[derive(Clone, Debug)]
pub struct ImageView {
    pub memory: Arc<Bo>,
    pub offset: u64,
    pub format: Format,
    pub width: u32,
    pub height: u32,
    pub samples: u32,
    pub row_stride: u32,
}

impl ImageView {
    pub fn new(memory: Arc<Bo>, offset: u64, format: Format, width: u32, height: u32) -> ImageView {
        ImageView {
            memory,
            offset,
            format,
            width,
            height,
            samples: 1,
            row_stride: width * format.block_size(),
        }
    }

    pub fn with_samples(mut self, samples: u32) -> ImageView {
        self.samples = samples;
        self
    }

    pub fn address(&self) -> u64 {
        self.memory.gpu_address() + self.offset
    }

    pub fn handle(&self) -> BoHandle {
        self.memory.handle()
    }

    /// Whether two views designate the same memory with the same layout.
    pub fn same_view(&self, other: &ImageView) -> bool {
        self.address() == other.address()
            && self.format == other.format
            && self.width == other.width
            && self.height == other.height
            && self.samples == other.samples
    }
}
