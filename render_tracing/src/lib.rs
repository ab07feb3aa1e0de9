pub mod logger;
pub mod span;

pub use span::{EnteredSpan, Span};
