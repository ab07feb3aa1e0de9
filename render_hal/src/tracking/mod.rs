//! Backend-agnostic state shared by every backend.

pub mod bindings;
pub mod descriptors;
pub mod pass;
pub mod ref_count;
pub mod staging;
pub mod submission;
pub mod subresource;
