use hashbrown::HashSet;

use super::ref_count::{RefCountRegistry, RefId};
use super::staging::{StagingPool, StagingResource};

/// The set of objects touched by one recording.
///
/// Every object is captured at most once. The reference is taken on first
/// capture and released when the governing fence has been observed signaled.
#[derive(Debug)]
pub struct SubmissionInfo<B, T> {
    refs: HashSet<RefId>,
    staging_buffers: Vec<B>,
    staging_textures: Vec<T>,
}

impl<B, T> SubmissionInfo<B, T>
where
    B: StagingResource,
    T: StagingResource,
{
    pub fn new() -> Self {
        Self {
            refs: HashSet::new(),
            staging_buffers: Vec::new(),
            staging_textures: Vec::new(),
        }
    }

    /// Captures `id`. Returns `true` if this is the first capture.
    pub fn add_ref(&mut self, registry: &RefCountRegistry, id: RefId) -> bool {
        if !self.refs.insert(id) {
            return false;
        }

        if !registry.increment(id) {
            self.refs.remove(&id);
            return false;
        }

        true
    }

    pub fn add_staging_buffer(&mut self, buffer: B) {
        self.staging_buffers.push(buffer);
    }

    pub fn add_staging_texture(&mut self, texture: T) {
        self.staging_textures.push(texture);
    }

    #[inline]
    pub fn contains(&self, id: RefId) -> bool {
        self.refs.contains(&id)
    }

    /// Returns the number of captured objects.
    #[inline]
    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn staging_buffers(&self) -> usize {
        self.staging_buffers.len()
    }

    pub fn staging_textures(&self) -> usize {
        self.staging_textures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty() && self.staging_buffers.is_empty() && self.staging_textures.is_empty()
    }

    /// Releases every captured reference, returns the staging resources to
    /// their pools and leaves `self` empty for reuse.
    pub fn release(
        &mut self,
        registry: &RefCountRegistry,
        buffers: &StagingPool<B>,
        textures: &StagingPool<T>,
    ) {
        for id in self.refs.drain() {
            registry.decrement(id);
        }

        for buffer in self.staging_buffers.drain(..) {
            buffers.release(buffer);
        }

        for texture in self.staging_textures.drain(..) {
            textures.release(texture);
        }
    }
}

impl<B, T> Default for SubmissionInfo<B, T>
where
    B: StagingResource,
    T: StagingResource,
{
    fn default() -> Self {
        Self::new()
    }
}
