//! Shared ownership of GPU objects.
//!
//! Every object created by a device is registered with a [`RefCountRegistry`]
//! with a count of 1 owned by the caller. Recordings take additional references
//! while they are in flight. The destruction hook of an object runs exactly once,
//! when the last reference is released.

use std::fmt::{self, Debug, Formatter};
use std::sync::atomic::{fence, AtomicUsize, Ordering};

use parking_lot::Mutex;
use render_tracing::trace_span;
use sharded_slab::Slab;

use crate::error::DeviceError;

/// Returned by the registry when an object is destroyed.
pub type DestroyHook = Box<dyn FnOnce(&RefCountRegistry) + Send + 'static>;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Buffer,
    Texture,
    Sampler,
    Shader,
    ResourceLayout,
    ResourceSet,
    Pipeline,
    Framebuffer,
}

/// The identity of a registered object.
///
/// Ids are generational: an id of a destroyed object never aliases a
/// later object.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RefId(usize);

impl RefId {
    #[inline]
    pub fn to_bits(self) -> usize {
        self.0
    }
}

#[derive(Debug)]
pub struct RefCount(AtomicUsize);

impl RefCount {
    pub const fn new() -> Self {
        RefCount(AtomicUsize::new(1))
    }

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrements the reference counter and returns whether the refcount was the last one.
    #[must_use]
    pub fn decrement(&self) -> bool {
        self.decrement_many(1)
    }

    /// Decrements the reference counter by `count` at once.
    ///
    /// A decrement that would move the counter below zero is refused and
    /// returns `false`.
    #[must_use]
    pub fn decrement_many(&self, count: usize) -> bool {
        match self
            .0
            .fetch_update(Ordering::Release, Ordering::Relaxed, |v| v.checked_sub(count))
        {
            Ok(prev) if prev == count => {
                fence(Ordering::Acquire);
                true
            }
            Ok(_) | Err(_) => false,
        }
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for RefCount {
    fn default() -> Self {
        Self::new()
    }
}

struct Entry {
    kind: ObjectKind,
    count: RefCount,
    hook: Mutex<Option<DestroyHook>>,
}

pub struct RefCountRegistry {
    entries: Slab<Entry>,
    live: AtomicUsize,
    destroyed: AtomicUsize,
}

impl RefCountRegistry {
    pub fn new() -> Self {
        Self {
            entries: Slab::new(),
            live: AtomicUsize::new(0),
            destroyed: AtomicUsize::new(0),
        }
    }

    /// Registers a new object with a count of 1.
    pub fn register<F>(&self, kind: ObjectKind, hook: F) -> Result<RefId, DeviceError>
    where
        F: FnOnce(&RefCountRegistry) + Send + 'static,
    {
        let key = self
            .entries
            .insert(Entry {
                kind,
                count: RefCount::new(),
                hook: Mutex::new(Some(Box::new(hook))),
            })
            .ok_or_else(|| DeviceError::Native("object registry is full".to_owned()))?;

        self.live.fetch_add(1, Ordering::Relaxed);
        Ok(RefId(key))
    }

    /// Takes an additional reference. Returns `false` if `id` is not live.
    pub fn increment(&self, id: RefId) -> bool {
        match self.entries.get(id.0) {
            Some(entry) => {
                entry.count.increment();
                true
            }
            None => {
                tracing::error!("increment of retired object {:?}", id);
                false
            }
        }
    }

    /// Releases a reference and returns `true` if the object was destroyed.
    pub fn decrement(&self, id: RefId) -> bool {
        let Some(entry) = self.entries.get(id.0) else {
            tracing::error!("decrement of retired object {:?}", id);
            return false;
        };

        if !entry.count.decrement() {
            return false;
        }
        let kind = entry.kind;
        drop(entry);

        let _span = trace_span!("RefCountRegistry::destroy").entered();

        // The `Entry` guard must be released before `take` or it will
        // wait for ourselves.
        let Some(entry) = self.entries.take(id.0) else {
            return false;
        };

        self.live.fetch_sub(1, Ordering::Relaxed);
        self.destroyed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("destroying {:?} {:?}", kind, id);

        if let Some(hook) = entry.hook.into_inner() {
            hook(self);
        }

        true
    }

    /// Returns the current count of `id`, or `None` if it was destroyed.
    pub fn count(&self, id: RefId) -> Option<usize> {
        self.entries.get(id.0).map(|entry| entry.count.get())
    }

    pub fn kind(&self, id: RefId) -> Option<ObjectKind> {
        self.entries.get(id.0).map(|entry| entry.kind)
    }

    #[inline]
    pub fn is_live(&self, id: RefId) -> bool {
        self.entries.contains(id.0)
    }

    /// Returns the number of live objects.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// Returns the number of objects destroyed so far.
    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::Relaxed)
    }
}

impl Default for RefCountRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for RefCountRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefCountRegistry")
            .field("live", &self.live())
            .field("destroyed", &self.destroyed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};

    use super::{ObjectKind, RefCount, RefCountRegistry};

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce(&RefCountRegistry) + Send + 'static) {
        let calls = Arc::new(AtomicUsize::new(0));
        let hook = {
            let calls = calls.clone();
            move |_: &RefCountRegistry| {
                calls.fetch_add(1, Ordering::SeqCst);
            }
        };
        (calls, hook)
    }

    #[test]
    fn ref_count_refuses_underflow() {
        let count = RefCount::new();
        assert!(count.decrement());
        assert!(!count.decrement());
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn ref_count_decrement_many() {
        let count = RefCount::new();
        count.increment();
        count.increment();
        assert!(!count.decrement_many(2));
        assert!(count.decrement_many(1));
    }

    #[test]
    fn hook_runs_on_last_decrement() {
        let registry = RefCountRegistry::new();
        let (calls, hook) = counter();

        let id = registry.register(ObjectKind::Buffer, hook).unwrap();
        assert!(registry.increment(id));
        assert_eq!(registry.count(id), Some(2));

        assert!(!registry.decrement(id));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        assert!(registry.decrement(id));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!registry.is_live(id));
        assert_eq!(registry.count(id), None);
    }

    #[test]
    fn decrement_past_zero_is_ignored() {
        let registry = RefCountRegistry::new();
        let (calls, hook) = counter();

        let id = registry.register(ObjectKind::Texture, hook).unwrap();
        assert!(registry.decrement(id));
        assert!(!registry.decrement(id));
        assert!(!registry.increment(id));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.destroyed(), 1);
    }

    #[test]
    fn ids_are_not_reused() {
        let registry = RefCountRegistry::new();
        let a = registry.register(ObjectKind::Sampler, |_| {}).unwrap();
        assert!(registry.decrement(a));

        let b = registry.register(ObjectKind::Sampler, |_| {}).unwrap();
        assert_ne!(a, b);
        assert!(!registry.is_live(a));
        assert!(registry.is_live(b));
    }

    #[test]
    fn hook_releases_dependents() {
        let registry = RefCountRegistry::new();
        let (calls, hook) = counter();

        let member = registry.register(ObjectKind::Buffer, hook).unwrap();
        registry.increment(member);
        let set = registry
            .register(ObjectKind::ResourceSet, move |registry| {
                registry.decrement(member);
            })
            .unwrap();

        // Owner releases the member first, the set still holds it.
        assert!(!registry.decrement(member));
        assert!(registry.is_live(member));

        assert!(registry.decrement(set));
        assert!(!registry.is_live(member));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.live(), 0);
    }

    #[test]
    fn concurrent_decrements_destroy_once() {
        const THREADS: usize = 8;

        let registry = Arc::new(RefCountRegistry::new());
        let (calls, hook) = counter();
        let id = registry.register(ObjectKind::Pipeline, hook).unwrap();
        for _ in 1..THREADS {
            registry.increment(id);
        }

        let barrier = Arc::new(Barrier::new(THREADS));
        let threads: Vec<_> = (0..THREADS)
            .map(|_| {
                let registry = registry.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    registry.decrement(id)
                })
            })
            .collect();

        let destroyed = threads
            .into_iter()
            .map(|t| t.join().unwrap())
            .filter(|destroyed| *destroyed)
            .count();

        assert_eq!(destroyed, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
