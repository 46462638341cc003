//! Reference-accounting write barrier.
//!
//! Conceptually these functions run on every field store `src.f = tgt` and
//! on every removal of such an edge. They keep the region topology and the
//! borrow counters consistent: same-region and unrestricted-target stores
//! are free, stores from local objects record a borrow, and stores from
//! region members trigger absorption of the reachable local subgraph.
//!
//! Borrow accounting invariant: a region's `lrc` equals the number of edges
//! from local objects (embedding handles included) into the region. Every
//! path that changes an edge's classification adjusts `lrc` exactly once:
//! a store counts it, absorption of the source converts it, removal
//! uncounts it.

use cordon_error::{RegionError, Result};
use cordon_heap::Heap;
use cordon_types::{ObjectId, RegionId, RegionPointer};
use tracing::{debug, trace};

use crate::metadata::RegionTable;

/// The object's ownership tag with merge forwarding resolved. A tag that
/// pointed at merged-away metadata is rewritten to the root, moving one
/// metadata reference.
pub(crate) fn resolved_tag(
    heap: &mut Heap,
    regions: &mut RegionTable,
    obj: ObjectId,
) -> RegionPointer {
    match heap.region_tag(obj) {
        RegionPointer::Region(r) => {
            let root = regions.resolve(r);
            if root != RegionPointer::Region(r) {
                if let RegionPointer::Region(new) = root {
                    regions.inc_rc(new);
                }
                heap.set_region_tag(obj, root);
                regions.dec_rc(r);
            }
            root
        }
        tag => tag,
    }
}

/// Overwrite an object's tag, transferring the metadata reference the tag
/// holds.
pub(crate) fn retag(
    heap: &mut Heap,
    regions: &mut RegionTable,
    obj: ObjectId,
    new_tag: RegionPointer,
) {
    let old = resolved_tag(heap, regions, obj);
    if old == new_tag {
        return;
    }
    if let RegionPointer::Region(r) = new_tag {
        regions.inc_rc(r);
    }
    heap.set_region_tag(obj, new_tag);
    if let RegionPointer::Region(r) = old {
        regions.dec_rc(r);
    }
}

/// Account for a new edge `src -> tgt`.
pub(crate) fn add_reference(
    heap: &mut Heap,
    regions: &mut RegionTable,
    budget: usize,
    src: ObjectId,
    tgt: ObjectId,
) -> Result<()> {
    let src_tag = resolved_tag(heap, regions, src);
    let tgt_tag = resolved_tag(heap, regions, tgt);
    if tgt_tag.is_unrestricted_target() || src_tag == tgt_tag {
        return Ok(());
    }
    match src_tag {
        RegionPointer::Local => {
            if let RegionPointer::Region(r) = tgt_tag {
                regions.add_lrc(r, 1);
                trace!(src = %src, tgt = %tgt, region = %r, "borrow recorded");
            }
            Ok(())
        }
        RegionPointer::Immutable => Err(RegionError::WriteToImmutable { obj: src }),
        // Cown handles carry no traversable fields; their value edge is
        // accounted by the cown itself.
        RegionPointer::Cown(_) => Ok(()),
        RegionPointer::Region(r) => add_to_region(heap, regions, budget, src, tgt, r, 1),
    }
}

/// Account for a new edge into `tgt` from a local source that is not itself
/// a heap object (an embedding handle, a VM stack slot).
pub(crate) fn add_local_reference(heap: &mut Heap, regions: &mut RegionTable, tgt: ObjectId) {
    if let RegionPointer::Region(r) = resolved_tag(heap, regions, tgt) {
        regions.add_lrc(r, 1);
    }
}

/// Undo the accounting for an existing edge `src -> tgt` that is about to be
/// dropped.
pub(crate) fn remove_reference(
    heap: &mut Heap,
    regions: &mut RegionTable,
    src: ObjectId,
    tgt: ObjectId,
) -> Result<()> {
    let src_tag = resolved_tag(heap, regions, src);
    let tgt_tag = resolved_tag(heap, regions, tgt);
    if tgt_tag.is_unrestricted_target() || src_tag == tgt_tag {
        return Ok(());
    }
    match (src_tag, tgt_tag) {
        (RegionPointer::Local, RegionPointer::Region(r)) => {
            // Settle any pending parent-link dissolution first so the borrow
            // this edge may have turned into is on the books before we take
            // it off.
            let _ = regions.get_parent(r);
            regions.sub_lrc(r, 1);
            Ok(())
        }
        (RegionPointer::Region(a), RegionPointer::Region(b)) => {
            if regions.bridge(b) != Some(tgt) {
                return Err(RegionError::ContainedObjectReference { src, tgt });
            }
            match regions.get_parent(b) {
                Some(p) if p == a => {
                    regions.set_parent(b, None);
                    debug!(child = %b, parent = %a, "subregion link dissolved");
                    Ok(())
                }
                _ => Err(RegionError::InconsistentParent { src, tgt }),
            }
        }
        // Edges out of immutable or cown sources and edges onto local
        // targets carry no region accounting.
        _ => Ok(()),
    }
}

/// Absorb the local subgraph reachable from `root` into `dst`.
///
/// `src` is the edge source for diagnostics. `root_discount` is the number
/// of `root`'s inbound references that are already accounted elsewhere and
/// must not be treated as borrows: 1 when called for a freshly stored edge,
/// 0 when `root` is handed over without an edge (`add_object`).
///
/// On any failure the destination region is marked dirty: part of the
/// subgraph may already have been absorbed and its `lrc` can no longer be
/// trusted incrementally.
pub(crate) fn add_to_region(
    heap: &mut Heap,
    regions: &mut RegionTable,
    budget: usize,
    src: ObjectId,
    root: ObjectId,
    dst: RegionId,
    root_discount: u32,
) -> Result<()> {
    let result = absorb(heap, regions, budget, src, root, dst, root_discount);
    if let Err(err) = &result {
        debug!(region = %dst, error = %err, "absorption failed, marking dirty");
        regions.mark_dirty(dst);
    }
    result
}

struct WorkItem {
    /// Edge source, for error reporting.
    src: ObjectId,
    obj: ObjectId,
    /// True for the object the caller handed in, whose edge accounting
    /// differs from edges discovered during the walk.
    is_root: bool,
}

fn absorb(
    heap: &mut Heap,
    regions: &mut RegionTable,
    budget: usize,
    src: ObjectId,
    root: ObjectId,
    dst: RegionId,
    root_discount: u32,
) -> Result<()> {
    let mut work = vec![WorkItem {
        src,
        obj: root,
        is_root: true,
    }];
    let mut processed = 0usize;

    while let Some(item) = work.pop() {
        processed += 1;
        if processed > budget {
            return Err(RegionError::OutOfMemory { budget });
        }
        let obj = item.obj;
        match resolved_tag(heap, regions, obj) {
            RegionPointer::Immutable | RegionPointer::Cown(_) => {}
            RegionPointer::Region(r) if r == dst => {
                // The followed edge used to be a borrow from a local object;
                // it is internal now.
                if !item.is_root {
                    regions.sub_lrc(dst, 1);
                }
            }
            RegionPointer::Region(other) => {
                // Cross-region edge: only the other region's bridge may be
                // referenced, and only if it can become our subregion.
                if regions.bridge(other) != Some(obj) {
                    return Err(RegionError::ContainedObjectReference { src: item.src, tgt: obj });
                }
                let parent = regions.get_parent(other);
                if parent.is_some() || regions.cown(other).is_some() {
                    return Err(RegionError::SharedCustody { src: item.src, tgt: obj });
                }
                if regions.has_ancestor(dst, other) {
                    return Err(RegionError::CycleCreation { src: item.src, tgt: obj });
                }
                if !item.is_root {
                    regions.sub_lrc(other, 1);
                }
                regions.set_parent(other, Some(dst));
                debug!(child = %other, parent = %dst, "subregion created");
            }
            RegionPointer::Local => {
                if heap.is_function(obj) {
                    return Err(RegionError::UnsupportedFunctionCapture { obj });
                }
                if heap.is_native(obj) {
                    // Opaque natives carry no mutable region-relevant state;
                    // freeze in place instead of walking.
                    heap.set_region_tag(obj, RegionPointer::Immutable);
                    continue;
                }
                regions.inc_rc(dst);
                heap.set_region_tag(obj, RegionPointer::Region(dst));
                let discount = if item.is_root { root_discount } else { 1 };
                let borrows = heap.rc(obj).saturating_sub(discount);
                regions.add_lrc(dst, borrows);
                trace!(obj = %obj, region = %dst, borrows, "object absorbed");
                for child in heap.children(obj) {
                    work.push(WorkItem {
                        src: obj,
                        obj: child,
                        is_root: false,
                    });
                }
                // Type edges are not part of ordinary enumeration but obey
                // the same invariant.
                work.push(WorkItem {
                    src: obj,
                    obj: heap.type_of(obj),
                    is_root: false,
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const BUDGET: usize = 1 << 10;

    /// Built-in types are frozen eagerly, as the runtime does at startup, so
    /// absorption prunes at type edges instead of pulling type objects into
    /// regions.
    fn freeze_core_types(heap: &mut Heap) {
        let t = *heap.types();
        for ty in [
            t.type_type,
            t.object_type,
            t.str_type,
            t.cell_type,
            t.function_type,
            t.code_type,
            t.namespace_type,
            t.native_type,
        ] {
            heap.set_region_tag(ty, RegionPointer::Immutable);
        }
    }

    /// Heap object plus region wired the way the runtime does it: bridge
    /// tagged, metadata referenced by the tag, creator handle counted as a
    /// borrow.
    fn new_region(heap: &mut Heap, regions: &mut RegionTable) -> (ObjectId, RegionId) {
        let bridge = heap.alloc_plain();
        let r = regions.alloc(None, bridge);
        regions.inc_rc(r);
        heap.set_region_tag(bridge, RegionPointer::Region(r));
        regions.add_lrc(r, 1);
        (bridge, r)
    }

    #[test]
    fn local_store_records_borrow() {
        let mut heap = Heap::new();
        freeze_core_types(&mut heap);
        let mut regions = RegionTable::new();
        let (bridge, r) = new_region(&mut heap, &mut regions);
        let local = heap.alloc_plain();

        add_reference(&mut heap, &mut regions, BUDGET, local, bridge).unwrap();
        assert_eq!(regions.lrc(r), 2);

        remove_reference(&mut heap, &mut regions, local, bridge).unwrap();
        assert_eq!(regions.lrc(r), 1);
    }

    #[test]
    fn absorption_pulls_local_subgraph() {
        let mut heap = Heap::new();
        freeze_core_types(&mut heap);
        let mut regions = RegionTable::new();
        let (bridge, r) = new_region(&mut heap, &mut regions);

        let a = heap.alloc_plain();
        let b = heap.alloc_plain();
        heap.set_field_raw(a, "b", b);

        // Store a into the bridge: a and b are pulled in transitively.
        heap.set_field_raw(bridge, "a", a);
        add_reference(&mut heap, &mut regions, BUDGET, bridge, a).unwrap();

        assert_eq!(heap.region_tag(a), RegionPointer::Region(r));
        assert_eq!(heap.region_tag(b), RegionPointer::Region(r));
        // Borrows: bridge handle, a's handle, b's handle. The two internal
        // edges are discounted.
        assert_eq!(regions.lrc(r), 3);
    }

    #[test]
    fn function_capture_is_rejected() {
        let mut heap = Heap::new();
        freeze_core_types(&mut heap);
        let mut regions = RegionTable::new();
        let (bridge, r) = new_region(&mut heap, &mut regions);

        let globals = heap.alloc_namespace();
        let builtins = heap.alloc_namespace();
        let code = heap.alloc_code(vec![], vec![]);
        let f = heap.alloc_function(code, vec![], vec![], globals, builtins);

        heap.set_field_raw(bridge, "f", f);
        let err =
            add_reference(&mut heap, &mut regions, BUDGET, bridge, f).unwrap_err();
        assert_eq!(err, RegionError::UnsupportedFunctionCapture { obj: f });
        assert!(regions.is_dirty(r));
    }

    #[test]
    fn native_is_frozen_in_place() {
        let mut heap = Heap::new();
        freeze_core_types(&mut heap);
        let mut regions = RegionTable::new();
        let (bridge, r) = new_region(&mut heap, &mut regions);

        let n = heap.alloc_native();
        heap.set_field_raw(bridge, "n", n);
        add_reference(&mut heap, &mut regions, BUDGET, bridge, n).unwrap();

        assert_eq!(heap.region_tag(n), RegionPointer::Immutable);
        assert!(!regions.is_dirty(r));
    }

    #[test]
    fn interior_reference_is_rejected() {
        let mut heap = Heap::new();
        freeze_core_types(&mut heap);
        let mut regions = RegionTable::new();
        let (bridge_a, _ra) = new_region(&mut heap, &mut regions);
        let (bridge_b, rb) = new_region(&mut heap, &mut regions);

        // Put an interior object into b.
        let member = heap.alloc_plain();
        heap.set_field_raw(bridge_b, "m", member);
        add_reference(&mut heap, &mut regions, BUDGET, bridge_b, member).unwrap();
        assert_eq!(heap.region_tag(member), RegionPointer::Region(rb));

        // a's bridge may not reference b's interior.
        heap.set_field_raw(bridge_a, "x", member);
        let err =
            add_reference(&mut heap, &mut regions, BUDGET, bridge_a, member).unwrap_err();
        assert!(matches!(err, RegionError::ContainedObjectReference { tgt, .. } if tgt == member));
    }

    #[test]
    fn bridge_reference_creates_subregion() {
        let mut heap = Heap::new();
        freeze_core_types(&mut heap);
        let mut regions = RegionTable::new();
        let (bridge_a, ra) = new_region(&mut heap, &mut regions);
        let (bridge_b, rb) = new_region(&mut heap, &mut regions);

        heap.set_field_raw(bridge_a, "child", bridge_b);
        add_reference(&mut heap, &mut regions, BUDGET, bridge_a, bridge_b).unwrap();
        assert_eq!(regions.get_parent(rb), Some(ra));
        assert_eq!(regions.osc(ra), 1);

        // A second custody claim is refused.
        let (bridge_c, _rc) = new_region(&mut heap, &mut regions);
        heap.set_field_raw(bridge_c, "child", bridge_b);
        let err =
            add_reference(&mut heap, &mut regions, BUDGET, bridge_c, bridge_b).unwrap_err();
        assert!(matches!(err, RegionError::SharedCustody { .. }));
    }

    #[test]
    fn cycle_creating_promotion_is_rejected() {
        let mut heap = Heap::new();
        freeze_core_types(&mut heap);
        let mut regions = RegionTable::new();
        let (bridge_a, ra) = new_region(&mut heap, &mut regions);
        let (bridge_b, rb) = new_region(&mut heap, &mut regions);

        heap.set_field_raw(bridge_a, "child", bridge_b);
        add_reference(&mut heap, &mut regions, BUDGET, bridge_a, bridge_b).unwrap();
        assert_eq!(regions.get_parent(rb), Some(ra));

        // b -> a would close the loop.
        heap.set_field_raw(bridge_b, "parent", bridge_a);
        let err =
            add_reference(&mut heap, &mut regions, BUDGET, bridge_b, bridge_a).unwrap_err();
        assert!(matches!(err, RegionError::CycleCreation { .. }));
    }

    #[test]
    fn budget_exhaustion_unwinds_and_marks_dirty() {
        let mut heap = Heap::new();
        freeze_core_types(&mut heap);
        let mut regions = RegionTable::new();
        let (bridge, r) = new_region(&mut heap, &mut regions);

        // A chain longer than the budget.
        let head = heap.alloc_plain();
        let mut cursor = head;
        for _ in 0..8 {
            let next = heap.alloc_plain();
            heap.set_field_raw(cursor, "next", next);
            cursor = next;
        }

        heap.set_field_raw(bridge, "head", head);
        let err = add_reference(&mut heap, &mut regions, 4, bridge, head).unwrap_err();
        assert_eq!(err, RegionError::OutOfMemory { budget: 4 });
        assert!(regions.is_dirty(r));
    }

    #[test]
    fn tag_through_merged_region_is_compressed() {
        let mut heap = Heap::new();
        freeze_core_types(&mut heap);
        let mut regions = RegionTable::new();
        let (bridge_a, ra) = new_region(&mut heap, &mut regions);
        let (_bridge_b, rb) = new_region(&mut heap, &mut regions);

        regions.merge(ra, rb).unwrap();
        assert_eq!(
            resolved_tag(&mut heap, &mut regions, bridge_a),
            RegionPointer::Region(rb)
        );
        assert_eq!(heap.region_tag(bridge_a), RegionPointer::Region(rb));
        // The tag was ra's last holder; rewriting it frees the slot.
        assert!(!regions.is_live(ra));
    }
}
