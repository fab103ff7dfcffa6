//! Descriptor sets.
//!
//! Descriptor storage is owned by the sets themselves: the recording code only reads the
//! descriptors of bound sets and copies them into per-draw tables. `DescriptorPool` only
//! accounts for set and descriptor counts against the pool limits.
use crate::{
    hw::{SamplerDescriptor, TextureDescriptor, UniformBuffer},
    Error,
};
use pankmod::BoHandle;
use std::sync::Arc;

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DescriptorSetLayout {
    pub num_ubos: u32,
    pub num_dyn_ubos: u32,
    pub num_dyn_ssbos: u32,
    pub num_textures: u32,
    pub num_samplers: u32,
}

impl DescriptorSetLayout {
    /// Number of dynamic offsets consumed when binding a set of this layout.
    pub fn dynamic_offset_count(&self) -> usize {
        (self.num_dyn_ubos + self.num_dyn_ssbos) as usize
    }
}

#[derive(Clone, Debug)]
pub struct DescriptorSet {
    pub layout: Arc<DescriptorSetLayout>,
    pub ubos: Vec<UniformBuffer>,
    /// Dynamic uniform buffers, before dynamic offsets are applied.
    pub dyn_ubos: Vec<UniformBuffer>,
    pub dyn_ssbos: Vec<UniformBuffer>,
    pub textures: Vec<TextureDescriptor>,
    pub samplers: Vec<SamplerDescriptor>,
    /// Memory referenced by the descriptors.
    pub bos: Vec<BoHandle>,
}

impl DescriptorSet {
    /// Creates a set with zeroed descriptors.
    pub fn new(layout: Arc<DescriptorSetLayout>) -> DescriptorSet {
        DescriptorSet {
            ubos: vec![UniformBuffer::default(); layout.num_ubos as usize],
            dyn_ubos: vec![UniformBuffer::default(); layout.num_dyn_ubos as usize],
            dyn_ssbos: vec![UniformBuffer::default(); layout.num_dyn_ssbos as usize],
            textures: vec![TextureDescriptor::default(); layout.num_textures as usize],
            samplers: vec![SamplerDescriptor::default(); layout.num_samplers as usize],
            bos: vec![],
            layout,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct DescriptorCounts {
    pub sets: u32,
    pub ubos: u32,
    pub dyn_ubos: u32,
    pub dyn_ssbos: u32,
    pub textures: u32,
    pub samplers: u32,
}

impl DescriptorCounts {
    fn of_layout(layout: &DescriptorSetLayout) -> DescriptorCounts {
        DescriptorCounts {
            sets: 1,
            ubos: layout.num_ubos,
            dyn_ubos: layout.num_dyn_ubos,
            dyn_ssbos: layout.num_dyn_ssbos,
            textures: layout.num_textures,
            samplers: layout.num_samplers,
        }
    }

    fn fits_in(&self, max: &DescriptorCounts) -> bool {
        self.sets <= max.sets
            && self.ubos <= max.ubos
            && self.dyn_ubos <= max.dyn_ubos
            && self.dyn_ssbos <= max.dyn_ssbos
            && self.textures <= max.textures
            && self.samplers <= max.samplers
    }

    fn add(&self, o: &DescriptorCounts) -> DescriptorCounts {
        DescriptorCounts {
            sets: self.sets + o.sets,
            ubos: self.ubos + o.ubos,
            dyn_ubos: self.dyn_ubos + o.dyn_ubos,
            dyn_ssbos: self.dyn_ssbos + o.dyn_ssbos,
            textures: self.textures + o.textures,
            samplers: self.samplers + o.samplers,
        }
    }

    fn sub(&self, o: &DescriptorCounts) -> DescriptorCounts {
        DescriptorCounts {
            sets: self.sets.saturating_sub(o.sets),
            ubos: self.ubos.saturating_sub(o.ubos),
            dyn_ubos: self.dyn_ubos.saturating_sub(o.dyn_ubos),
            dyn_ssbos: self.dyn_ssbos.saturating_sub(o.dyn_ssbos),
            textures: self.textures.saturating_sub(o.textures),
            samplers: self.samplers.saturating_sub(o.samplers),
        }
    }
}

/// Descriptor set allocation accounting.
#[derive(Debug)]
pub struct DescriptorPool {
    max: DescriptorCounts,
    current: DescriptorCounts,
}

impl DescriptorPool {
    pub fn new(max: DescriptorCounts) -> DescriptorPool {
        DescriptorPool {
            max,
            current: DescriptorCounts::default(),
        }
    }

    pub fn allocate(&mut self, layout: &Arc<DescriptorSetLayout>) -> Result<DescriptorSet, Error> {
        let next = self.current.add(&DescriptorCounts::of_layout(layout));
        if !next.fits_in(&self.max) {
            return Err(Error::OutOfPoolMemory);
        }
        self.current = next;
        Ok(DescriptorSet::new(layout.clone()))
    }

    pub fn free(&mut self, set: DescriptorSet) {
        self.current = self.current.sub(&DescriptorCounts::of_layout(&set.layout));
    }

    pub fn reset(&mut self) {
        self.current = DescriptorCounts::default();
    }

    pub fn current(&self) -> DescriptorCounts {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_limits_and_reset() {
        let layout = Arc::new(DescriptorSetLayout {
            num_ubos: 2,
            num_textures: 1,
            ..Default::default()
        });
        let mut pool = DescriptorPool::new(DescriptorCounts {
            sets: 4,
            ubos: 3,
            textures: 4,
            ..Default::default()
        });
        let set = pool.allocate(&layout).unwrap();
        assert_eq!(set.ubos.len(), 2);
        assert_eq!(pool.allocate(&layout).unwrap_err(), Error::OutOfPoolMemory);
        pool.free(set);
        assert!(pool.allocate(&layout).is_ok());
        pool.reset();
        assert_eq!(pool.current(), DescriptorCounts::default());
    }
}
