//! Per-subresource hardware state of textures.

use std::ops::Range;

use smallvec::SmallVec;
use thiserror::Error;

use crate::types::{TextureDescription, TextureUsage};

/// The hardware-visible layout of a single subresource.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TextureState {
    /// Contents are undefined. This is the state of every texture at creation.
    Undefined,
    /// Host-written linear contents, the initial state of staging textures.
    Preinitialized,
    General,
    ColorAttachment,
    DepthStencilAttachment,
    ShaderReadOnly,
    TransferSrc,
    TransferDst,
    Present,
}

impl TextureState {
    /// Returns the state a texture created with `usage` starts in.
    pub fn initial(usage: TextureUsage) -> Self {
        if usage.contains(TextureUsage::STAGING) {
            Self::Preinitialized
        } else {
            Self::Undefined
        }
    }

    /// Returns the state a texture with `usage` is returned to after every
    /// operation that moved it elsewhere.
    pub fn rest(usage: TextureUsage) -> Self {
        if usage.contains(TextureUsage::STAGING) {
            Self::General
        } else if usage.contains(TextureUsage::SAMPLED) {
            Self::ShaderReadOnly
        } else if usage.contains(TextureUsage::RENDER_TARGET) {
            Self::ColorAttachment
        } else if usage.contains(TextureUsage::DEPTH_STENCIL) {
            Self::DepthStencilAttachment
        } else {
            Self::General
        }
    }
}

/// A range of mip levels and array layers.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubresourceRange {
    pub mips: Range<u32>,
    pub layers: Range<u32>,
}

impl SubresourceRange {
    pub fn new(mips: Range<u32>, layers: Range<u32>) -> Self {
        Self { mips, layers }
    }

    /// Returns the range covering a single subresource.
    pub fn single(mip: u32, layer: u32) -> Self {
        Self {
            mips: mip..mip + 1,
            layers: layer..layer + 1,
        }
    }

    /// Returns the range covering every subresource of a texture.
    pub fn full(desc: &TextureDescription) -> Self {
        Self {
            mips: 0..desc.mip_levels,
            layers: 0..desc.array_layers,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.mips.is_empty() || self.layers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.mips.len() * self.layers.len()
    }
}

/// A state change over a range of subresources.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Transition<S> {
    pub range: SubresourceRange,
    pub old: S,
    pub new: S,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
#[error("subresource ({mip}, {layer}) is in a different state than the start of the range")]
pub struct MixedStates {
    pub mip: u32,
    pub layer: u32,
}

/// The last known state of every (mip, layer) pair of a texture.
#[derive(Clone, Debug)]
pub struct SubresourceTracker<S> {
    mips: u32,
    layers: u32,
    states: Vec<S>,
}

impl<S> SubresourceTracker<S>
where
    S: Copy + Eq,
{
    pub fn new(mips: u32, layers: u32, initial: S) -> Self {
        assert!(mips != 0 && layers != 0, "texture without subresources");

        Self {
            mips,
            layers,
            states: vec![initial; (mips * layers) as usize],
        }
    }

    pub fn full_range(&self) -> SubresourceRange {
        SubresourceRange::new(0..self.mips, 0..self.layers)
    }

    pub fn state(&self, mip: u32, layer: u32) -> Option<S> {
        if mip >= self.mips || layer >= self.layers {
            return None;
        }

        Some(self.states[self.index(mip, layer)])
    }

    /// Returns the common state of all subresources in `range`, or `None`
    /// if they differ.
    pub fn uniform_state(&self, range: &SubresourceRange) -> Option<S> {
        self.check_range(range);

        let first = self.states[self.index(range.mips.start, range.layers.start)];
        self.indices(range)
            .all(|index| self.states[index] == first)
            .then_some(first)
    }

    /// Returns `true` if transitioning `range` to `new` would emit a barrier.
    pub fn needs_transition(&self, range: &SubresourceRange, new: S) -> bool {
        self.check_range(range);
        self.indices(range).any(|index| self.states[index] != new)
    }

    /// Transitions every subresource in `range` to `new`.
    ///
    /// All subresources in `range` must share one state. With `validate`
    /// set this is checked and [`MixedStates`] is returned on mismatch,
    /// without modifying any state. Returns `None` if the range is already
    /// in `new`.
    #[track_caller]
    pub fn transition_to(
        &mut self,
        range: &SubresourceRange,
        new: S,
        validate: bool,
    ) -> Result<Option<Transition<S>>, MixedStates> {
        self.check_range(range);

        let old = self.states[self.index(range.mips.start, range.layers.start)];

        if validate {
            for mip in range.mips.clone() {
                for layer in range.layers.clone() {
                    if self.states[self.index(mip, layer)] != old {
                        return Err(MixedStates { mip, layer });
                    }
                }
            }
        }

        if old == new {
            return Ok(None);
        }

        for mip in range.mips.clone() {
            for layer in range.layers.clone() {
                let index = self.index(mip, layer);
                self.states[index] = new;
            }
        }

        Ok(Some(Transition {
            range: range.clone(),
            old,
            new,
        }))
    }

    /// Transitions every subresource in `range` to `new`, regardless of
    /// their current states.
    ///
    /// Emits one transition per subresource that is not yet in `new`.
    #[track_caller]
    pub fn transition_each(
        &mut self,
        range: &SubresourceRange,
        new: S,
    ) -> SmallVec<[Transition<S>; 4]> {
        self.check_range(range);

        let mut transitions = SmallVec::new();
        for mip in range.mips.clone() {
            for layer in range.layers.clone() {
                let index = self.index(mip, layer);
                let old = self.states[index];
                if old != new {
                    self.states[index] = new;
                    transitions.push(Transition {
                        range: SubresourceRange::single(mip, layer),
                        old,
                        new,
                    });
                }
            }
        }

        transitions
    }

    /// Resets the tracker to a new shape with every subresource in `state`.
    pub fn reset(&mut self, mips: u32, layers: u32, state: S) {
        *self = Self::new(mips, layers, state);
    }

    #[inline]
    fn index(&self, mip: u32, layer: u32) -> usize {
        (mip * self.layers + layer) as usize
    }

    fn indices<'a>(&'a self, range: &'a SubresourceRange) -> impl Iterator<Item = usize> + 'a {
        range.mips.clone().flat_map(move |mip| {
            range
                .layers
                .clone()
                .map(move |layer| self.index(mip, layer))
        })
    }

    #[track_caller]
    fn check_range(&self, range: &SubresourceRange) {
        assert!(!range.is_empty(), "empty subresource range");
        assert!(
            range.mips.end <= self.mips && range.layers.end <= self.layers,
            "subresource range {:?} out of bounds for {} mips and {} layers",
            range,
            self.mips,
            self.layers,
        );
    }
}

#[cfg(test)]
mod tests {
    use crate::types::TextureUsage;

    use super::{MixedStates, SubresourceRange, SubresourceTracker, TextureState};

    #[test]
    fn transition_to_current_state_is_noop() {
        let mut tracker = SubresourceTracker::new(4, 2, TextureState::ShaderReadOnly);
        let range = tracker.full_range();

        let transition = tracker
            .transition_to(&range, TextureState::ShaderReadOnly, true)
            .unwrap();
        assert_eq!(transition, None);
    }

    #[test]
    fn forward_and_back_emits_two_transitions() {
        let rest = TextureState::ShaderReadOnly;
        let mut tracker = SubresourceTracker::new(4, 2, rest);
        let range = SubresourceRange::new(1..3, 0..2);

        let mut barriers = Vec::new();
        barriers.extend(
            tracker
                .transition_to(&range, TextureState::TransferDst, true)
                .unwrap(),
        );
        barriers.extend(tracker.transition_to(&range, rest, true).unwrap());

        assert_eq!(barriers.len(), 2);
        assert_eq!(barriers[0].old, rest);
        assert_eq!(barriers[0].new, TextureState::TransferDst);
        assert_eq!(barriers[1].new, rest);
        assert_eq!(tracker.uniform_state(&tracker.full_range()), Some(rest));
    }

    #[test]
    fn transition_writes_every_entry_in_range() {
        let mut tracker = SubresourceTracker::new(3, 3, TextureState::Undefined);
        let range = SubresourceRange::new(1..2, 0..3);

        tracker
            .transition_to(&range, TextureState::ColorAttachment, true)
            .unwrap();

        for layer in 0..3 {
            assert_eq!(tracker.state(0, layer), Some(TextureState::Undefined));
            assert_eq!(tracker.state(1, layer), Some(TextureState::ColorAttachment));
            assert_eq!(tracker.state(2, layer), Some(TextureState::Undefined));
        }
        assert_eq!(tracker.uniform_state(&tracker.full_range()), None);
    }

    #[test]
    fn mixed_range_is_rejected() {
        let mut tracker = SubresourceTracker::new(2, 1, TextureState::Undefined);
        tracker
            .transition_to(&SubresourceRange::single(1, 0), TextureState::General, true)
            .unwrap();

        let err = tracker
            .transition_to(&tracker.full_range(), TextureState::TransferSrc, true)
            .unwrap_err();
        assert_eq!(err, MixedStates { mip: 1, layer: 0 });

        // Nothing is written on error.
        assert_eq!(tracker.state(0, 0), Some(TextureState::Undefined));
        assert_eq!(tracker.state(1, 0), Some(TextureState::General));
    }

    #[test]
    fn transition_each_handles_mixed_ranges() {
        let mut tracker = SubresourceTracker::new(2, 2, TextureState::ShaderReadOnly);
        tracker
            .transition_to(&SubresourceRange::single(0, 1), TextureState::TransferDst, true)
            .unwrap();

        let transitions = tracker.transition_each(&tracker.full_range(), TextureState::ShaderReadOnly);
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].range, SubresourceRange::single(0, 1));
        assert_eq!(transitions[0].old, TextureState::TransferDst);
    }

    #[test]
    fn needs_transition() {
        let tracker = SubresourceTracker::new(1, 2, TextureState::General);
        assert!(!tracker.needs_transition(&tracker.full_range(), TextureState::General));
        assert!(tracker.needs_transition(&tracker.full_range(), TextureState::ShaderReadOnly));
    }

    #[test]
    #[should_panic]
    fn out_of_bounds_range_panics() {
        let mut tracker = SubresourceTracker::new(1, 1, TextureState::Undefined);
        let _ = tracker.transition_to(
            &SubresourceRange::new(0..2, 0..1),
            TextureState::General,
            true,
        );
    }

    #[test]
    fn rest_states() {
        assert_eq!(
            TextureState::rest(TextureUsage::SAMPLED | TextureUsage::RENDER_TARGET),
            TextureState::ShaderReadOnly
        );
        assert_eq!(
            TextureState::rest(TextureUsage::RENDER_TARGET),
            TextureState::ColorAttachment
        );
        assert_eq!(
            TextureState::rest(TextureUsage::DEPTH_STENCIL),
            TextureState::DepthStencilAttachment
        );
        assert_eq!(TextureState::rest(TextureUsage::STORAGE), TextureState::General);
        assert_eq!(
            TextureState::initial(TextureUsage::STAGING),
            TextureState::Preinitialized
        );
    }
}
