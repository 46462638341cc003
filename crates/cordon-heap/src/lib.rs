//! Reference-counted object heap consumed by the Cordon region subsystem.
//!
//! This crate stands in for the host object runtime: it owns object storage,
//! reference counts, per-object region tags, and the generic outgoing-edge
//! enumeration protocol. Region semantics (the write barrier, lifecycle, and
//! freezing) are layered on top by `cordon-region`; nothing in here knows
//! what a region is beyond storing the tag.

pub mod heap;
pub mod object;

pub use heap::Heap;
pub use object::{CoreTypes, ObjectKind};
