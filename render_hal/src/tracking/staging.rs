use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use render_tracing::trace_span;

/// A host-visible scratch resource that can be pooled.
pub trait StagingResource {
    /// Returns the size in bytes this resource can hold.
    fn capacity(&self) -> u64;
}

/// A pool of reusable staging resources.
///
/// Resources acquired from the pool must only be released back once the
/// submission that used them has completed.
#[derive(Debug)]
pub struct StagingPool<T> {
    available: Mutex<Vec<T>>,
    granularity: u64,
    created: AtomicUsize,
}

impl<T> StagingPool<T>
where
    T: StagingResource,
{
    /// Creates a new pool. New resources are at least `granularity` bytes.
    pub fn new(granularity: u64) -> Self {
        Self {
            available: Mutex::new(Vec::new()),
            granularity,
            created: AtomicUsize::new(0),
        }
    }

    /// Returns the smallest available resource that can hold `request` bytes.
    ///
    /// If no resource fits, `create` is called with the size the new
    /// resource should have.
    pub fn acquire<F, E>(&self, request: u64, create: F) -> Result<T, E>
    where
        F: FnOnce(u64) -> Result<T, E>,
    {
        let _span = trace_span!("StagingPool::acquire").entered();

        {
            let mut available = self.available.lock();

            let best = available
                .iter()
                .enumerate()
                .filter(|(_, res)| res.capacity() >= request)
                .min_by_key(|(_, res)| res.capacity())
                .map(|(index, _)| index);

            if let Some(index) = best {
                return Ok(available.swap_remove(index));
            }
        }

        let size = request.max(self.granularity);
        let resource = create(size)?;
        debug_assert!(resource.capacity() >= request);

        let created = self.created.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(
            "created staging resource #{} with {} bytes (requested {})",
            created,
            resource.capacity(),
            request,
        );

        Ok(resource)
    }

    /// Returns a resource to the pool.
    pub fn release(&self, resource: T) {
        self.available.lock().push(resource);
    }

    /// Removes all available resources from the pool.
    pub fn drain(&self) -> Vec<T> {
        std::mem::take(&mut *self.available.lock())
    }

    /// Returns the number of resources waiting for reuse.
    pub fn available(&self) -> usize {
        self.available.lock().len()
    }

    /// Returns the number of resources this pool has created in total.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    pub fn granularity(&self) -> u64 {
        self.granularity
    }
}
