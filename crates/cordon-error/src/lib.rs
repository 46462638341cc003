//! Error taxonomy for the Cordon region runtime.
//!
//! Every violation of the ownership discipline is surfaced as a
//! [`RegionError`] carrying the object handles involved, so an embedding can
//! report the offending edge without re-deriving it. First error wins:
//! callers never overwrite an already-pending error with a new one.

use cordon_types::ObjectId;
use thiserror::Error;

/// Primary error type for region, freeze, and cown operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegionError {
    // === Topology violations (write barrier) ===
    /// A cross-region edge targets an interior (non-bridge) object.
    #[error("invalid edge {src} -> {tgt}: target is interior to another region")]
    ContainedObjectReference { src: ObjectId, tgt: ObjectId },

    /// A proposed parent or merge relationship would create a cycle in the
    /// region topology.
    #[error("invalid edge {src} -> {tgt}: region cycle")]
    CycleCreation { src: ObjectId, tgt: ObjectId },

    /// The targeted bridge object already has a parent region.
    #[error("invalid edge {src} -> {tgt}: bridge already has an owner")]
    SharedCustody { src: ObjectId, tgt: ObjectId },

    /// Absorption reached a live function object; capturing functions into a
    /// region is not supported by the traversal.
    #[error("cannot absorb function {obj} into a region")]
    UnsupportedFunctionCapture { obj: ObjectId },

    // === Lock / cown discipline ===
    /// Release of an unheld cown, release by a non-owning thread, or a
    /// released cown that still records an owner.
    #[error("lock discipline violation on {obj}: {detail}")]
    LockDiscipline { obj: ObjectId, detail: String },

    /// A cown may only store a bridge object, another cown, or an immutable
    /// object.
    #[error("cown {cown} cannot store {value}: not a bridge, cown, or immutable object")]
    InvalidCownValue { cown: ObjectId, value: ObjectId },

    // === Lifecycle ===
    /// `close` found more external borrows than the permitted holder count.
    #[error("region of {bridge} still borrowed: lrc {lrc} exceeds {permitted} permitted holder(s)")]
    StillBorrowed {
        bridge: ObjectId,
        lrc: u32,
        permitted: u32,
    },

    /// `close` found open child regions.
    #[error("region of {bridge} has {osc} open subregion(s)")]
    OpenSubregions { bridge: ObjectId, osc: u32 },

    /// Reference accounting found a parent link that does not match the edge
    /// being removed.
    #[error("inconsistent parent link removing edge {src} -> {tgt}")]
    InconsistentParent { src: ObjectId, tgt: ObjectId },

    // === Host-boundary guards ===
    /// `add_object` on an object that already belongs to a region, a cown, or
    /// the immutable set.
    #[error("{obj} already has an owner or is immutable")]
    AlreadyOwned { obj: ObjectId },

    /// `remove_object` on an object the region does not own.
    #[error("{obj} is not a member of the region")]
    NotAMember { obj: ObjectId },

    /// Field store on a frozen object.
    #[error("cannot mutate immutable object {obj}")]
    WriteToImmutable { obj: ObjectId },

    /// Mutation addressed to an object of the wrong kind: a field store on a
    /// non-instance, a cell store on a non-cell, a binding on a
    /// non-namespace.
    #[error("{obj} is not {expected}")]
    KindMismatch {
        obj: ObjectId,
        expected: &'static str,
    },

    // === Resource exhaustion ===
    /// Traversal worklist exceeded its budget. The traversal unwinds cleanly;
    /// if it happened mid-reconstruction the region has been marked dirty.
    #[error("traversal budget of {budget} objects exhausted")]
    OutOfMemory { budget: usize },
}

impl RegionError {
    /// Whether this error reports a region-topology violation (as opposed to
    /// lock discipline, lifecycle, or resource errors).
    #[must_use]
    pub const fn is_topology(&self) -> bool {
        matches!(
            self,
            Self::ContainedObjectReference { .. }
                | Self::CycleCreation { .. }
                | Self::SharedCustody { .. }
        )
    }

    /// Whether the operation may succeed if retried later (after borrows are
    /// dropped or subregions close).
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::StillBorrowed { .. } | Self::OpenSubregions { .. }
        )
    }

    /// The source object of the offending edge, where one exists.
    #[must_use]
    pub const fn source(&self) -> Option<ObjectId> {
        match self {
            Self::ContainedObjectReference { src, .. }
            | Self::CycleCreation { src, .. }
            | Self::SharedCustody { src, .. }
            | Self::InconsistentParent { src, .. } => Some(*src),
            _ => None,
        }
    }

    /// The target object of the offending edge, where one exists.
    #[must_use]
    pub const fn target(&self) -> Option<ObjectId> {
        match self {
            Self::ContainedObjectReference { tgt, .. }
            | Self::CycleCreation { tgt, .. }
            | Self::SharedCustody { tgt, .. }
            | Self::InconsistentParent { tgt, .. } => Some(*tgt),
            _ => None,
        }
    }

    /// Create a lock-discipline error.
    pub fn lock_discipline(obj: ObjectId, detail: impl Into<String>) -> Self {
        Self::LockDiscipline {
            obj,
            detail: detail.into(),
        }
    }
}

/// Result type alias using [`RegionError`].
pub type Result<T> = std::result::Result<T, RegionError>;
