//! Region-based ownership for the Cordon object runtime.
//!
//! Objects start out thread-local and can move into one of three owned
//! states: a *region* (a transferable heap partition entered only through
//! its bridge object), the *immutable* set (deeply frozen, shareable), or a
//! *cown* (a concurrent owner cell handing a region between threads). The
//! write barrier keeps the partition consistent on every edge mutation,
//! the lifecycle module decides when a region may be handed over, and the
//! invariant checker re-derives the whole discipline from the live heap on
//! demand.
//!
//! [`Runtime`] is the embedding surface; everything else is plumbing behind
//! it.

pub mod cown;
pub mod invariant;
pub mod metadata;
pub mod runtime;

mod barrier;
mod freeze;
mod lifecycle;

pub use cordon_error::{RegionError, Result};
pub use cordon_types::{CownId, CownState, ObjectId, RegionId, RegionPointer};

pub use crate::cown::CownSync;
pub use crate::invariant::{InvariantChecker, Violation, ViolationKind};
pub use crate::lifecycle::DEFAULT_PERMITTED_HOLDERS;
pub use crate::metadata::{MergeError, RegionTable};
pub use crate::runtime::{Runtime, RuntimeConfig, RegionStats, DEFAULT_TRAVERSAL_BUDGET};
