//! Heap-wide invariant checking.
//!
//! The checker re-derives the region topology from nothing but tags and
//! edges, flagging the first edge that breaks the discipline. It is an
//! explicit context object: arming, the recorded violation, and the
//! per-pass captured set all live here, and the captured set is scoped to
//! one call so no state can leak between passes.

use std::collections::HashSet;

use cordon_heap::Heap;
use cordon_types::{ObjectId, RegionId, RegionPointer};
use tracing::warn;

use crate::barrier;
use crate::metadata::RegionTable;

/// Which rule an edge broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ViolationKind {
    /// An immutable source references a mutable target.
    ImmutableToMutable,
    /// A region member references something outside its region that is not
    /// a bridge (a local object or another region's interior).
    InteriorReference,
    /// A bridge is referenced from more than one region in the same pass.
    NotExternallyUnique,
    /// An edge that implies a cycle in the region topology.
    RegionCycle,
}

/// The first offending edge found by a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct Violation {
    pub src: ObjectId,
    pub tgt: ObjectId,
    pub kind: ViolationKind,
}

/// Explicit checker context: no ambient globals, one per runtime.
#[derive(Debug, Default)]
pub struct InvariantChecker {
    armed: bool,
    violation: Option<Violation>,
}

impl InvariantChecker {
    /// A disarmed checker with no recorded violation.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the checker unless a violation is pending. Called when regions
    /// come into use.
    pub(crate) fn notify_regions_in_use(&mut self) {
        if self.violation.is_none() {
            self.armed = true;
        }
    }

    /// Clear the recorded violation and arm the checker again.
    pub fn rearm(&mut self) {
        self.violation = None;
        self.armed = true;
    }

    /// Whether a pass will actually run.
    #[must_use]
    pub const fn is_armed(&self) -> bool {
        self.armed
    }

    /// The first violation of the last failing pass.
    #[must_use]
    pub const fn violation(&self) -> Option<&Violation> {
        self.violation.as_ref()
    }

    /// Source object of the last recorded violation.
    #[must_use]
    pub fn last_source(&self) -> Option<ObjectId> {
        self.violation.map(|v| v.src)
    }

    /// Target object of the last recorded violation.
    #[must_use]
    pub fn last_target(&self) -> Option<ObjectId> {
        self.violation.map(|v| v.tgt)
    }

    /// Validate every edge of every live object. Returns true if a
    /// violation was found; the violation is recorded and the checker
    /// disarms itself until [`InvariantChecker::rearm`] so one corrupt edge
    /// does not turn into an error storm.
    ///
    /// Function objects and opaque natives are exempt as sources.
    pub fn check(&mut self, heap: &mut Heap, regions: &mut RegionTable) -> bool {
        if !self.armed {
            return false;
        }
        let mut captured: HashSet<RegionId> = HashSet::new();
        let live: Vec<ObjectId> = heap.iter_live().collect();
        for src in live {
            let src_tag = barrier::resolved_tag(heap, regions, src);
            // Local sources are unrestricted.
            if src_tag.is_local() {
                continue;
            }
            if heap.is_function(src) || heap.is_native(src) {
                continue;
            }
            let mut edges = heap.children(src);
            edges.push(heap.type_of(src));
            for tgt in edges {
                if let Some(violation) =
                    check_edge(heap, regions, &mut captured, src, src_tag, tgt)
                {
                    warn!(
                        src = %violation.src,
                        tgt = %violation.tgt,
                        kind = ?violation.kind,
                        "region invariant violated"
                    );
                    self.violation = Some(violation);
                    self.armed = false;
                    return true;
                }
            }
        }
        false
    }
}

fn check_edge(
    heap: &mut Heap,
    regions: &mut RegionTable,
    captured: &mut HashSet<RegionId>,
    src: ObjectId,
    src_tag: RegionPointer,
    tgt: ObjectId,
) -> Option<Violation> {
    let tgt_tag = barrier::resolved_tag(heap, regions, tgt);
    // Internal references are always allowed.
    if src_tag == tgt_tag {
        return None;
    }
    // Anything may point at immutable data or at a cown handle.
    if tgt_tag.is_unrestricted_target() {
        return None;
    }
    if src_tag.is_immutable() {
        return Some(Violation {
            src,
            tgt,
            kind: ViolationKind::ImmutableToMutable,
        });
    }
    let RegionPointer::Region(src_region) = src_tag else {
        // Cown-tagged sources carry no traversable fields.
        return None;
    };
    let RegionPointer::Region(tgt_region) = tgt_tag else {
        // A region member reaching out to a local object.
        return Some(Violation {
            src,
            tgt,
            kind: ViolationKind::InteriorReference,
        });
    };
    // Cross-region references must go through the bridge.
    if regions.bridge(tgt_region) != Some(tgt) {
        return Some(Violation {
            src,
            tgt,
            kind: ViolationKind::InteriorReference,
        });
    }
    if captured.contains(&tgt_region) {
        return Some(Violation {
            src,
            tgt,
            kind: ViolationKind::NotExternallyUnique,
        });
    }
    if regions.has_ancestor(src_region, tgt_region) {
        return Some(Violation {
            src,
            tgt,
            kind: ViolationKind::RegionCycle,
        });
    }
    captured.insert(tgt_region);
    None
}
