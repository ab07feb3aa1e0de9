use parking_lot::Mutex;
use render_tracing::trace_span;
use slab::Slab;

use crate::error::DeviceError;
use crate::types::ResourceKind;

/// Number of descriptors of every kind.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct DescriptorCounts {
    pub uniform_buffers: u32,
    pub uniform_buffers_dynamic: u32,
    pub sampled_images: u32,
    pub samplers: u32,
    pub storage_buffers: u32,
    pub storage_buffers_dynamic: u32,
    pub storage_images: u32,
}

impl DescriptorCounts {
    /// Returns counts with every kind set to `count`.
    pub const fn splat(count: u32) -> Self {
        Self {
            uniform_buffers: count,
            uniform_buffers_dynamic: count,
            sampled_images: count,
            samplers: count,
            storage_buffers: count,
            storage_buffers_dynamic: count,
            storage_images: count,
        }
    }

    /// Adds one descriptor for a layout element of `kind`.
    pub fn add(&mut self, kind: ResourceKind, dynamic: bool) {
        let slot = match (kind, dynamic) {
            (ResourceKind::UniformBuffer, false) => &mut self.uniform_buffers,
            (ResourceKind::UniformBuffer, true) => &mut self.uniform_buffers_dynamic,
            (
                ResourceKind::StructuredBufferReadOnly | ResourceKind::StructuredBufferReadWrite,
                false,
            ) => &mut self.storage_buffers,
            (
                ResourceKind::StructuredBufferReadOnly | ResourceKind::StructuredBufferReadWrite,
                true,
            ) => &mut self.storage_buffers_dynamic,
            (ResourceKind::TextureReadOnly, _) => &mut self.sampled_images,
            (ResourceKind::TextureReadWrite, _) => &mut self.storage_images,
            (ResourceKind::Sampler, _) => &mut self.samplers,
        };

        *slot += 1;
    }

    fn as_array(&self) -> [u32; 7] {
        [
            self.uniform_buffers,
            self.uniform_buffers_dynamic,
            self.sampled_images,
            self.samplers,
            self.storage_buffers,
            self.storage_buffers_dynamic,
            self.storage_images,
        ]
    }

    fn from_array(v: [u32; 7]) -> Self {
        Self {
            uniform_buffers: v[0],
            uniform_buffers_dynamic: v[1],
            sampled_images: v[2],
            samplers: v[3],
            storage_buffers: v[4],
            storage_buffers_dynamic: v[5],
            storage_images: v[6],
        }
    }

    /// Returns `true` if every count in `self` is at most the count in `other`.
    pub fn fits_in(&self, other: &Self) -> bool {
        self.as_array()
            .iter()
            .zip(other.as_array())
            .all(|(lhs, rhs)| *lhs <= rhs)
    }

    pub fn max(&self, other: &Self) -> Self {
        let (lhs, rhs) = (self.as_array(), other.as_array());
        Self::from_array(std::array::from_fn(|i| lhs[i].max(rhs[i])))
    }

    pub(crate) fn debit(&mut self, other: &Self) {
        let (lhs, rhs) = (self.as_array(), other.as_array());
        *self = Self::from_array(std::array::from_fn(|i| lhs[i] - rhs[i]));
    }

    pub(crate) fn credit(&mut self, other: &Self) {
        let (lhs, rhs) = (self.as_array(), other.as_array());
        *self = Self::from_array(std::array::from_fn(|i| lhs[i] + rhs[i]));
    }

    pub fn total(&self) -> u32 {
        self.as_array().iter().sum()
    }
}

/// Creates the native units backing a [`DescriptorAllocator`].
pub trait DescriptorBlockProvider {
    type Block: Clone;

    fn create_block(
        &self,
        max_sets: u32,
        capacity: &DescriptorCounts,
    ) -> Result<Self::Block, DeviceError>;

    fn destroy_block(&self, block: Self::Block);
}

/// A region of a descriptor block owned by one resource set.
///
/// Must be returned with [`DescriptorAllocator::free`].
#[derive(Debug, PartialEq, Eq)]
pub struct DescriptorAllocation {
    block: usize,
    counts: DescriptorCounts,
}

impl DescriptorAllocation {
    #[inline]
    pub fn block(&self) -> usize {
        self.block
    }

    #[inline]
    pub fn counts(&self) -> &DescriptorCounts {
        &self.counts
    }
}

#[derive(Debug)]
struct Block<T> {
    raw: T,
    remaining: DescriptorCounts,
    remaining_sets: u32,
    allocated: u32,
}

/// A non-defragmenting slab allocator over fixed-capacity descriptor blocks.
#[derive(Debug)]
pub struct DescriptorAllocator<P>
where
    P: DescriptorBlockProvider,
{
    provider: P,
    blocks: Mutex<Slab<Block<P::Block>>>,
    max_sets: u32,
    capacity: DescriptorCounts,
}

impl<P> DescriptorAllocator<P>
where
    P: DescriptorBlockProvider,
{
    pub fn new(provider: P, max_sets: u32, capacity: DescriptorCounts) -> Self {
        Self {
            provider,
            blocks: Mutex::new(Slab::new()),
            max_sets: max_sets.max(1),
            capacity,
        }
    }

    /// Allocates `counts` descriptors from the first block that can hold them.
    ///
    /// If no block fits, a new block is created. Requests larger than a
    /// regular block get a block sized to the request.
    pub fn allocate(
        &self,
        counts: &DescriptorCounts,
    ) -> Result<(DescriptorAllocation, P::Block), DeviceError> {
        let _span = trace_span!("DescriptorAllocator::allocate").entered();

        let mut blocks = self.blocks.lock();

        // Blocks are never removed, the slab iterates in creation order.
        for (key, block) in blocks.iter_mut() {
            if block.remaining_sets == 0 || !counts.fits_in(&block.remaining) {
                continue;
            }

            block.remaining.debit(counts);
            block.remaining_sets -= 1;
            block.allocated += 1;

            return Ok((
                DescriptorAllocation {
                    block: key,
                    counts: *counts,
                },
                block.raw.clone(),
            ));
        }

        let capacity = self.capacity.max(counts);
        if capacity != self.capacity {
            tracing::debug!("creating oversize descriptor block for {:?}", counts);
        }

        let raw = self.provider.create_block(self.max_sets, &capacity)?;

        let mut remaining = capacity;
        remaining.debit(counts);

        let key = blocks.insert(Block {
            raw: raw.clone(),
            remaining,
            // We are immediately allocating a set from the block.
            remaining_sets: self.max_sets - 1,
            allocated: 1,
        });

        tracing::debug!("created descriptor block #{}", key);

        Ok((
            DescriptorAllocation {
                block: key,
                counts: *counts,
            },
            raw,
        ))
    }

    /// Returns the descriptors of `allocation` to their block.
    pub fn free(&self, allocation: DescriptorAllocation) {
        let _span = trace_span!("DescriptorAllocator::free").entered();

        let mut blocks = self.blocks.lock();
        let Some(block) = blocks.get_mut(allocation.block) else {
            tracing::error!("free of allocation in unknown block {}", allocation.block);
            return;
        };

        block.remaining.credit(&allocation.counts);
        block.remaining_sets += 1;
        block.allocated -= 1;
    }

    pub fn block_count(&self) -> usize {
        self.blocks.lock().len()
    }

    /// Returns the remaining descriptors and set slots of `block`.
    pub fn remaining(&self, block: usize) -> Option<(DescriptorCounts, u32)> {
        self.blocks
            .lock()
            .get(block)
            .map(|block| (block.remaining, block.remaining_sets))
    }

    /// Returns the number of live allocations in `block`.
    pub fn allocated(&self, block: usize) -> Option<u32> {
        self.blocks.lock().get(block).map(|block| block.allocated)
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }
}

impl<P> Drop for DescriptorAllocator<P>
where
    P: DescriptorBlockProvider,
{
    fn drop(&mut self) {
        for block in self.blocks.get_mut().drain() {
            if block.allocated != 0 {
                tracing::warn!(
                    "dropping descriptor block with {} live allocations",
                    block.allocated
                );
            }

            self.provider.destroy_block(block.raw);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use crate::error::DeviceError;
    use crate::types::ResourceKind;

    use super::{DescriptorAllocator, DescriptorBlockProvider, DescriptorCounts};

    #[derive(Debug, Default)]
    struct TestProvider {
        created: Cell<u32>,
        destroyed: Cell<u32>,
    }

    impl DescriptorBlockProvider for &TestProvider {
        type Block = u32;

        fn create_block(
            &self,
            _max_sets: u32,
            _capacity: &DescriptorCounts,
        ) -> Result<u32, DeviceError> {
            let id = self.created.get();
            self.created.set(id + 1);
            Ok(id)
        }

        fn destroy_block(&self, _block: u32) {
            self.destroyed.set(self.destroyed.get() + 1);
        }
    }

    fn uniforms(n: u32) -> DescriptorCounts {
        DescriptorCounts {
            uniform_buffers: n,
            ..Default::default()
        }
    }

    #[test]
    fn counts_from_layout_elements() {
        let mut counts = DescriptorCounts::default();
        counts.add(ResourceKind::UniformBuffer, false);
        counts.add(ResourceKind::UniformBuffer, true);
        counts.add(ResourceKind::StructuredBufferReadWrite, true);
        counts.add(ResourceKind::TextureReadOnly, false);
        counts.add(ResourceKind::Sampler, false);

        assert_eq!(counts.uniform_buffers, 1);
        assert_eq!(counts.uniform_buffers_dynamic, 1);
        assert_eq!(counts.storage_buffers_dynamic, 1);
        assert_eq!(counts.sampled_images, 1);
        assert_eq!(counts.samplers, 1);
        assert_eq!(counts.total(), 5);
    }

    #[test]
    fn first_fit_in_creation_order() {
        let provider = TestProvider::default();
        let allocator = DescriptorAllocator::new(&provider, 10, DescriptorCounts::splat(4));

        let (a, raw_a) = allocator.allocate(&uniforms(3)).unwrap();
        let (b, raw_b) = allocator.allocate(&uniforms(3)).unwrap();
        assert_eq!(raw_a, 0);
        assert_eq!(raw_b, 1);
        assert_eq!(allocator.block_count(), 2);

        // A small request fits into the first block again.
        let (c, raw_c) = allocator.allocate(&uniforms(1)).unwrap();
        assert_eq!(raw_c, 0);
        assert_eq!(c.block(), a.block());
        assert_eq!(allocator.remaining(a.block()).unwrap().0.uniform_buffers, 0);

        allocator.free(a);
        allocator.free(b);
        allocator.free(c);
        assert_eq!(
            allocator.remaining(0).unwrap(),
            (DescriptorCounts::splat(4), 10)
        );
        assert_eq!(provider.created.get(), 2);
    }

    #[test]
    fn set_slots_are_a_limit() {
        let provider = TestProvider::default();
        let allocator = DescriptorAllocator::new(&provider, 2, DescriptorCounts::splat(100));

        let allocs: Vec<_> = (0..5)
            .map(|_| allocator.allocate(&uniforms(1)).unwrap().0)
            .collect();
        assert_eq!(allocator.block_count(), 3);
        assert_eq!(allocator.allocated(0), Some(2));
        assert_eq!(allocator.allocated(2), Some(1));

        for alloc in allocs {
            allocator.free(alloc);
        }
        assert_eq!(allocator.allocated(0), Some(0));
    }

    #[test]
    fn freed_capacity_is_reused() {
        let provider = TestProvider::default();
        let allocator = DescriptorAllocator::new(&provider, 1000, DescriptorCounts::splat(100));

        for _ in 0..1000 {
            let (alloc, _) = allocator.allocate(&uniforms(100)).unwrap();
            allocator.free(alloc);
        }

        assert_eq!(allocator.block_count(), 1);
    }

    #[test]
    fn oversize_request_gets_own_block() {
        let provider = TestProvider::default();
        let allocator = DescriptorAllocator::new(&provider, 10, DescriptorCounts::splat(4));

        let (alloc, _) = allocator.allocate(&uniforms(9)).unwrap();
        assert_eq!(allocator.block_count(), 1);
        let (remaining, _) = allocator.remaining(alloc.block()).unwrap();
        assert_eq!(remaining.uniform_buffers, 0);
        assert_eq!(remaining.samplers, 4);
    }

    #[test]
    fn drop_destroys_blocks() {
        let provider = TestProvider::default();
        {
            let allocator = DescriptorAllocator::new(&provider, 1, DescriptorCounts::splat(4));
            let (a, _) = allocator.allocate(&uniforms(1)).unwrap();
            let (b, _) = allocator.allocate(&uniforms(1)).unwrap();
            allocator.free(a);
            allocator.free(b);
        }

        assert_eq!(provider.destroyed.get(), 2);
    }
}
