//! Transitive immutability.
//!
//! `make_immutable` runs a worklist closure over everything reachable from
//! the root, flipping tags to immutable. Types are pushed explicitly
//! because type links are outside the ordinary enumeration protocol.
//! Functions get capture analysis instead of a blind walk: freezing a
//! function must not freeze its whole globals namespace, only the bindings
//! the code can actually reach.

use cordon_error::{RegionError, Result};
use cordon_heap::{Heap, ObjectKind};
use cordon_types::{ObjectId, RegionPointer};
use tracing::{debug, trace};

use crate::barrier;
use crate::metadata::RegionTable;

/// Freeze `root` and its reachable closure.
///
/// Idempotent once the object and its type are both immutable. Opaque
/// natives are frozen without traversal. Freezing a bridge object
/// dissolves its region: the members fold back into the local set and the
/// traversal freezes whichever of them are still reachable.
pub(crate) fn make_immutable(
    heap: &mut Heap,
    regions: &mut RegionTable,
    budget: usize,
    root: ObjectId,
) -> Result<()> {
    if heap.region_tag(root).is_immutable() && heap.region_tag(heap.type_of(root)).is_immutable() {
        return Ok(());
    }
    trace!(obj = %root, "make_immutable");

    let mut frontier = vec![root];
    let mut processed = 0usize;
    while let Some(item) = frontier.pop() {
        processed += 1;
        if processed > budget {
            return Err(RegionError::OutOfMemory { budget });
        }

        if barrier::resolved_tag(heap, regions, item).is_immutable() {
            // The object is done but its type can lag behind it.
            push_type(heap, &mut frontier, item);
            continue;
        }
        set_immutable(heap, regions, item);

        if heap.is_native(item) {
            // Nothing to walk, and native types are exempt from the pass.
            continue;
        }
        if heap.is_function(item) {
            walk_function(heap, regions, budget, &mut processed, item, &mut frontier)?;
            push_type(heap, &mut frontier, item);
            continue;
        }
        for child in heap.children(item) {
            if !heap.region_tag(child).is_immutable() {
                frontier.push(child);
            }
        }
        push_type(heap, &mut frontier, item);
    }
    Ok(())
}

fn push_type(heap: &Heap, frontier: &mut Vec<ObjectId>, item: ObjectId) {
    let ty = heap.type_of(item);
    if !heap.region_tag(ty).is_immutable() {
        frontier.push(ty);
    }
}

/// Flip one tag to immutable, transferring any region metadata reference it
/// held. Freezing a region's bridge dissolves the region first; freezing an
/// interior member leaves the region dirty, since its inbound borrows stop
/// being uncounted once the tag is immutable. Cown handles keep their tag.
fn set_immutable(heap: &mut Heap, regions: &mut RegionTable, obj: ObjectId) {
    match barrier::resolved_tag(heap, regions, obj) {
        RegionPointer::Cown(_) => return,
        RegionPointer::Region(r) => {
            if regions.bridge(r) == Some(obj) {
                debug!(region = %r, bridge = %obj, "region dissolved by freeze");
                regions.set_parent(r, None);
                if let Some(_c) = regions.cown(r) {
                    regions.set_cown(r, None);
                    regions.dec_rc(r);
                }
                regions.merge_into_local(r);
            } else {
                debug!(region = %r, obj = %obj, "member frozen, lrc untrusted");
                regions.mark_dirty(r);
            }
        }
        RegionPointer::Local | RegionPointer::Immutable => {}
    }
    barrier::retag(heap, regions, obj, RegionPointer::Immutable);
}

/// Capture analysis for functions.
///
/// The code object's name table tells us which globals and builtins the
/// body can reach: each captured global is frozen individually and its key
/// pinned in the namespace, builtins get the key pinned and a shallow
/// freeze of the value. Nested code objects found in the constant table are
/// scanned the same way. If the body can call the reflective `globals`
/// primitive, any string constant (or closure cell string) naming a global
/// is conservatively treated as a capture.
fn walk_function(
    heap: &mut Heap,
    regions: &mut RegionTable,
    budget: usize,
    processed: &mut usize,
    func: ObjectId,
    frontier: &mut Vec<ObjectId>,
) -> Result<()> {
    set_immutable(heap, regions, func);

    let ObjectKind::Function {
        code,
        defaults,
        closure,
        globals,
        builtins,
    } = heap.kind(func).clone()
    else {
        unreachable!("walk_function on a non-function object")
    };

    for &attr in defaults.iter().chain(closure.iter()) {
        if !heap.region_tag(attr).is_immutable() {
            frontier.push(attr);
        }
    }

    // The namespaces themselves stay mutable; only captured keys are pinned.
    let mut code_stack = vec![code];
    let mut check_globals = false;
    while let Some(code_obj) = code_stack.pop() {
        *processed += 1;
        if *processed > budget {
            return Err(RegionError::OutOfMemory { budget });
        }
        set_immutable(heap, regions, code_obj);

        let ObjectKind::Code { names, consts } = heap.kind(code_obj).clone() else {
            unreachable!("function code table holds a non-code object")
        };

        for name in &names {
            if name == "globals" {
                // The body can read the whole namespace reflectively.
                check_globals = true;
            }
            if heap.ns_contains(globals, name) {
                capture_global(heap, globals, name, frontier);
            } else if heap.ns_contains(builtins, name) {
                heap.ns_freeze_key(builtins, name);
                if let Some(value) = heap.ns_get(builtins, name) {
                    if !heap.region_tag(value).is_immutable() {
                        // Builtins are frozen shallowly.
                        set_immutable(heap, regions, value);
                    }
                }
            }
        }

        for value in consts {
            if !heap.region_tag(value).is_immutable() {
                if matches!(heap.kind(value), ObjectKind::Code { .. }) {
                    code_stack.push(value);
                } else {
                    frontier.push(value);
                }
            }
            if check_globals {
                if let ObjectKind::Str(s) = heap.kind(value) {
                    let s = s.clone();
                    if heap.ns_contains(globals, &s) {
                        capture_global(heap, globals, &s, frontier);
                    }
                }
            }
        }
    }

    if check_globals {
        // Closure cells may hold strings naming globals.
        for cell in closure {
            if let Some(value) = heap.cell_contents(cell) {
                if let ObjectKind::Str(s) = heap.kind(value) {
                    let s = s.clone();
                    if heap.ns_contains(globals, &s) {
                        capture_global(heap, globals, &s, frontier);
                    }
                }
            }
        }
    }
    Ok(())
}

/// Pin a captured global's key and queue its value for freezing.
fn capture_global(heap: &mut Heap, globals: ObjectId, name: &str, frontier: &mut Vec<ObjectId>) {
    trace!(ns = %globals, name, "global captured");
    heap.ns_freeze_key(globals, name);
    if let Some(value) = heap.ns_get(globals, name) {
        if !heap.region_tag(value).is_immutable() {
            frontier.push(value);
        }
    }
}
