//! The render-pass and encoder state machine.

use smallvec::SmallVec;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum EncoderState {
    /// No pass or encoder is open.
    Idle,
    /// A render pass is open.
    Active,
    /// A transfer (blit) encoder is open.
    TransferActive,
    /// A compute encoder is open.
    ComputeActive,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum LoadOp<T> {
    Clear(T),
    Load,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum InPassClear {
    Color { index: u32, color: [f32; 4] },
    DepthStencil { depth: f32, stencil: u8 },
}

/// How to open a render pass.
#[derive(Clone, Debug, PartialEq)]
pub struct PassBegin {
    pub color: SmallVec<[LoadOp<[f32; 4]>; 4]>,
    pub depth: Option<LoadOp<(f32, u8)>>,
    /// Clears to record immediately after the pass is opened.
    pub clears: SmallVec<[InPassClear; 4]>,
}

impl PassBegin {
    /// Returns `true` if every attachment is cleared on load.
    pub fn clears_on_load(&self) -> bool {
        self.color
            .iter()
            .all(|op| matches!(op, LoadOp::Clear(_)))
            && self
                .depth
                .map_or(true, |op| matches!(op, LoadOp::Clear(_)))
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Shape {
    color_targets: u32,
    has_depth: bool,
}

/// Tracks the open pass or encoder, the bound framebuffer and its deferred
/// clears.
#[derive(Clone, Debug)]
pub struct PassState {
    state: EncoderState,
    framebuffer: Option<Shape>,
    pending_colors: SmallVec<[Option<[f32; 4]>; 4]>,
    pending_depth: Option<(f32, u8)>,
    ever_active: bool,
}

impl PassState {
    pub fn new() -> Self {
        Self {
            state: EncoderState::Idle,
            framebuffer: None,
            pending_colors: SmallVec::new(),
            pending_depth: None,
            ever_active: false,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    #[inline]
    pub fn state(&self) -> EncoderState {
        self.state
    }

    #[inline]
    pub fn is_render_active(&self) -> bool {
        self.state == EncoderState::Active
    }

    #[inline]
    pub fn has_framebuffer(&self) -> bool {
        self.framebuffer.is_some()
    }

    /// Returns `true` if a render pass was opened since the framebuffer was bound.
    #[inline]
    pub fn ever_active(&self) -> bool {
        self.ever_active
    }

    /// Binds a framebuffer. The render pass must be closed.
    #[track_caller]
    pub fn bind_framebuffer(&mut self, color_targets: u32, has_depth: bool) {
        assert_ne!(self.state, EncoderState::Active, "render pass still open");

        self.framebuffer = Some(Shape {
            color_targets,
            has_depth,
        });
        self.pending_colors.clear();
        self.pending_colors.resize(color_targets as usize, None);
        self.pending_depth = None;
        self.ever_active = false;
    }

    pub fn queue_clear_color(&mut self, index: u32, color: [f32; 4]) {
        if let Some(slot) = self.pending_colors.get_mut(index as usize) {
            *slot = Some(color);
        }
    }

    pub fn queue_clear_depth_stencil(&mut self, depth: f32, stencil: u8) {
        self.pending_depth = Some((depth, stencil));
    }

    pub fn has_pending_clears(&self) -> bool {
        self.pending_depth.is_some() || self.pending_colors.iter().any(Option::is_some)
    }

    /// Returns `true` if the bound framebuffer must have a pass opened and
    /// closed before it is replaced or the recording ends.
    ///
    /// This is the case if the framebuffer never had a pass opened or has
    /// clears queued that no pass has consumed yet.
    pub fn needs_flush(&self) -> bool {
        self.framebuffer.is_some()
            && self.state != EncoderState::Active
            && (!self.ever_active || self.has_pending_clears())
    }

    /// Opens a render pass on the bound framebuffer and consumes queued clears.
    ///
    /// If every attachment has a queued clear, the pass clears on load.
    /// Otherwise all attachments are loaded and the queued clears are
    /// returned as in-pass clears.
    #[track_caller]
    pub fn begin_render(&mut self) -> PassBegin {
        assert_eq!(self.state, EncoderState::Idle, "encoder still open");
        let Some(shape) = self.framebuffer else {
            panic!("no framebuffer bound");
        };

        let all_colors = self.pending_colors.iter().all(Option::is_some);
        let all_depth = !shape.has_depth || self.pending_depth.is_some();

        let begin = if all_colors && all_depth {
            PassBegin {
                color: self
                    .pending_colors
                    .iter()
                    .flatten()
                    .map(|color| LoadOp::Clear(*color))
                    .collect(),
                depth: shape
                    .has_depth
                    .then(|| self.pending_depth.map_or(LoadOp::Load, LoadOp::Clear)),
                clears: SmallVec::new(),
            }
        } else {
            let mut clears: SmallVec<[InPassClear; 4]> = self
                .pending_colors
                .iter()
                .enumerate()
                .filter_map(|(index, color)| {
                    color.map(|color| InPassClear::Color {
                        index: index as u32,
                        color,
                    })
                })
                .collect();
            if shape.has_depth {
                if let Some((depth, stencil)) = self.pending_depth {
                    clears.push(InPassClear::DepthStencil { depth, stencil });
                }
            }

            PassBegin {
                color: (0..shape.color_targets).map(|_| LoadOp::Load).collect(),
                depth: shape.has_depth.then_some(LoadOp::Load),
                clears,
            }
        };

        self.pending_colors.iter_mut().for_each(|color| *color = None);
        self.pending_depth = None;
        self.state = EncoderState::Active;
        self.ever_active = true;

        begin
    }

    #[track_caller]
    pub fn end_render(&mut self) {
        assert_eq!(self.state, EncoderState::Active, "no render pass open");
        self.state = EncoderState::Idle;
    }

    #[track_caller]
    pub fn begin_transfer(&mut self) {
        assert_eq!(self.state, EncoderState::Idle, "encoder still open");
        self.state = EncoderState::TransferActive;
    }

    #[track_caller]
    pub fn begin_compute(&mut self) {
        assert_eq!(self.state, EncoderState::Idle, "encoder still open");
        self.state = EncoderState::ComputeActive;
    }

    /// Closes a transfer or compute encoder.
    #[track_caller]
    pub fn end_encoder(&mut self) {
        assert!(
            matches!(
                self.state,
                EncoderState::TransferActive | EncoderState::ComputeActive
            ),
            "no transfer or compute encoder open"
        );
        self.state = EncoderState::Idle;
    }
}

impl Default for PassState {
    fn default() -> Self {
        Self::new()
    }
}
