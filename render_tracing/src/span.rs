//! Zones around recording, submission and completion steps.
//!
//! Span names follow `Type::method` of the entry point they cover. Ids that
//! tie a zone to a submission or command buffer are attached as fields:
//!
//! ```
//! # let id = 3u64;
//! let _span = render_tracing::trace_span!("Device::submit", submission = id).entered();
//! ```

#[doc(hidden)]
pub use tracing;

/// Creates a new [`Span`] with the given `name` and optional `field = value`
/// pairs at the current callsite.
#[macro_export]
macro_rules! trace_span {
    ($name:expr) => {
        $crate::__trace_span_impl!($name,)
    };
    ($name:expr, $($field:ident = $value:expr),+ $(,)?) => {
        $crate::__trace_span_impl!($name, $($field = $value),+)
    };
}

#[cfg(feature = "spans")]
#[macro_export]
#[doc(hidden)]
macro_rules! __trace_span_impl {
    ($name:expr, $($field:ident = $value:expr),*) => {{
        $crate::span::Span {
            inner: $crate::span::tracing::span!(
                target: "render",
                $crate::span::tracing::Level::TRACE,
                $name,
                $($field = $value),*
            ),
            _priv: (),
        }
    }};
}

#[cfg(not(feature = "spans"))]
#[macro_export]
#[doc(hidden)]
macro_rules! __trace_span_impl {
    ($name:expr, $($field:ident = $value:expr),*) => {{
        $(let _ = &$value;)*
        $crate::span::Span { _priv: () }
    }};
}

/// The zone of one engine step. Does nothing until [`entered`].
///
/// [`entered`]: Span::entered
#[derive(Clone, Debug)]
pub struct Span {
    #[cfg(feature = "spans")]
    #[doc(hidden)]
    pub inner: tracing::span::Span,
    #[doc(hidden)]
    pub _priv: (),
}

impl Span {
    pub fn entered(self) -> EnteredSpan {
        EnteredSpan {
            #[cfg(feature = "spans")]
            _inner: self.inner.entered(),
        }
    }

    /// Runs `f` inside this span without keeping it entered.
    pub fn in_scope<F, T>(&self, f: F) -> T
    where
        F: FnOnce() -> T,
    {
        #[cfg(feature = "spans")]
        {
            self.inner.in_scope(f)
        }

        #[cfg(not(feature = "spans"))]
        {
            f()
        }
    }

    /// Returns `true` if no subscriber records this span.
    pub fn is_disabled(&self) -> bool {
        #[cfg(feature = "spans")]
        {
            self.inner.is_disabled()
        }

        #[cfg(not(feature = "spans"))]
        {
            true
        }
    }
}

/// Guard of an entered [`Span`]. The zone closes on drop.
#[derive(Debug)]
#[non_exhaustive]
pub struct EnteredSpan {
    #[cfg(feature = "spans")]
    _inner: tracing::span::EnteredSpan,
}
