//! Dirty tracking of native bindings.
//!
//! The caches distinguish the binding the application requested from the
//! binding that was last emitted natively. A binding is only emitted again
//! when the two differ.

use std::ops::Range;

use smallvec::SmallVec;

/// A single bind point, such as the graphics pipeline.
#[derive(Clone, Debug)]
pub struct BindingSlot<T> {
    requested: Option<T>,
    bound: Option<T>,
}

impl<T> BindingSlot<T>
where
    T: Clone + PartialEq,
{
    pub const fn new() -> Self {
        Self {
            requested: None,
            bound: None,
        }
    }

    /// Requests `value`. Returns `true` if the request changed.
    pub fn set(&mut self, value: T) -> bool {
        if self.requested.as_ref() == Some(&value) {
            return false;
        }

        self.requested = Some(value);
        true
    }

    pub fn get(&self) -> Option<&T> {
        self.requested.as_ref()
    }

    /// Returns the requested value if it has not been emitted yet and
    /// marks it as emitted.
    pub fn take_dirty(&mut self) -> Option<T> {
        if self.requested.is_none() || self.requested == self.bound {
            return None;
        }

        self.bound.clone_from(&self.requested);
        self.requested.clone()
    }

    pub fn is_dirty(&self) -> bool {
        self.requested.is_some() && self.requested != self.bound
    }

    /// Forgets the native binding so the next flush emits it again.
    pub fn invalidate(&mut self) {
        self.bound = None;
    }

    pub fn clear(&mut self) {
        self.requested = None;
        self.bound = None;
    }
}

impl<T> Default for BindingSlot<T>
where
    T: Clone + PartialEq,
{
    fn default() -> Self {
        Self::new()
    }
}

/// An array of bind points, such as resource set slots.
#[derive(Clone, Debug)]
pub struct SlotCache<T> {
    requested: SmallVec<[Option<T>; 4]>,
    bound: SmallVec<[Option<T>; 4]>,
}

impl<T> SlotCache<T>
where
    T: Clone + PartialEq,
{
    pub fn new() -> Self {
        Self {
            requested: SmallVec::new(),
            bound: SmallVec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.requested.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requested.is_empty()
    }

    /// Resizes the cache to `len` slots. New slots are empty.
    pub fn resize(&mut self, len: usize) {
        self.requested.resize(len, None);
        self.bound.resize(len, None);
    }

    /// Requests `value` at `slot`, growing the cache if needed.
    ///
    /// Returns `true` if the request changed.
    pub fn set(&mut self, slot: usize, value: T) -> bool {
        if slot >= self.requested.len() {
            self.resize(slot + 1);
        }

        if self.requested[slot].as_ref() == Some(&value) {
            return false;
        }

        self.requested[slot] = Some(value);
        true
    }

    pub fn get(&self, slot: usize) -> Option<&T> {
        self.requested.get(slot).and_then(Option::as_ref)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> + '_ {
        self.requested
            .iter()
            .enumerate()
            .filter_map(|(slot, value)| value.as_ref().map(|value| (slot, value)))
    }

    /// Removes the request at `slot`.
    pub fn unset(&mut self, slot: usize) {
        if let Some(value) = self.requested.get_mut(slot) {
            *value = None;
        }
    }

    /// Returns the first slot in `0..count` without a request.
    pub fn first_unset(&self, count: usize) -> Option<usize> {
        (0..count).find(|slot| self.get(*slot).is_none())
    }

    /// Returns the contiguous ranges of slots whose requests differ from
    /// the native bindings.
    pub fn dirty_ranges(&self) -> SmallVec<[Range<usize>; 2]> {
        let mut ranges = SmallVec::new();
        let mut current: Option<Range<usize>> = None;

        for slot in 0..self.requested.len() {
            let dirty =
                self.requested[slot].is_some() && self.requested[slot] != self.bound[slot];

            if !dirty {
                ranges.extend(current.take());
            } else if let Some(range) = current.as_mut() {
                range.end = slot + 1;
            } else {
                current = Some(slot..slot + 1);
            }
        }

        ranges.extend(current);
        ranges
    }

    /// Marks the requests in `range` as emitted.
    pub fn mark_bound(&mut self, range: Range<usize>) {
        for slot in range {
            self.bound[slot].clone_from(&self.requested[slot]);
        }
    }

    /// Forgets all native bindings so the next flush emits every request.
    pub fn invalidate(&mut self) {
        self.bound.iter_mut().for_each(|value| *value = None);
    }

    pub fn clear(&mut self) {
        self.requested.clear();
        self.bound.clear();
    }
}

impl<T> Default for SlotCache<T>
where
    T: Clone + PartialEq,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{BindingSlot, SlotCache};

    #[test]
    fn unchanged_binding_is_not_dirty() {
        let mut slot = BindingSlot::new();
        assert!(slot.set(1));
        assert_eq!(slot.take_dirty(), Some(1));

        assert!(!slot.set(1));
        assert_eq!(slot.take_dirty(), None);
    }

    #[test]
    fn request_reverted_before_flush_is_not_dirty() {
        let mut slot = BindingSlot::new();
        slot.set(1);
        slot.take_dirty();

        slot.set(2);
        slot.set(1);
        assert!(!slot.is_dirty());
        assert_eq!(slot.take_dirty(), None);
    }

    #[test]
    fn invalidate_reemits() {
        let mut slot = BindingSlot::new();
        slot.set(7);
        slot.take_dirty();
        slot.invalidate();
        assert_eq!(slot.take_dirty(), Some(7));
    }

    #[test]
    fn dirty_ranges_are_contiguous() {
        let mut cache = SlotCache::new();
        cache.set(0, 'a');
        cache.set(1, 'b');
        cache.set(3, 'd');
        cache.set(4, 'e');

        assert_eq!(cache.dirty_ranges().as_slice(), &[0..2, 3..5]);

        cache.mark_bound(0..2);
        cache.mark_bound(3..5);
        assert!(cache.dirty_ranges().is_empty());

        // Same value, same slot: nothing to emit.
        assert!(!cache.set(1, 'b'));
        assert!(cache.dirty_ranges().is_empty());

        cache.set(1, 'x');
        assert_eq!(cache.dirty_ranges().as_slice(), &[1..2]);
    }

    #[test]
    fn invalidate_marks_every_request() {
        let mut cache = SlotCache::new();
        cache.set(0, 1);
        cache.set(2, 3);
        cache.mark_bound(0..3);

        cache.invalidate();
        assert_eq!(cache.dirty_ranges().as_slice(), &[0..1, 2..3]);
        assert_eq!(cache.first_unset(3), Some(1));
    }

    #[test]
    fn resize_keeps_requests() {
        let mut cache = SlotCache::new();
        cache.set(0, 1);
        cache.resize(4);
        assert_eq!(cache.get(0), Some(&1));
        assert_eq!(cache.first_unset(4), Some(1));

        cache.resize(1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.iter().count(), 1);
    }
}
