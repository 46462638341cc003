//! Embedding facade.
//!
//! `Runtime` ties the heap, the region table, the cown table, and the
//! invariant checker together behind the operation surface an embedding
//! sees: allocation, barrier-mediated mutation, region lifecycle, freezing,
//! and cowns. Everything except blocking on a cown executes under the
//! embedding's single exclusion domain; tests wrap the runtime in a mutex
//! and that is the intended deployment shape.
//!
//! Handle discipline: every `ObjectId` an allocation or `cown_get` returns
//! is a counted embedding handle and counts as one local borrow if the
//! object is a region member. Hand it back with
//! [`Runtime::release_handle`].

use std::sync::Arc;

use cordon_error::{RegionError, Result};
use cordon_heap::{Heap, ObjectKind};
use cordon_types::{CownId, CownState, ObjectId, RegionId, RegionPointer};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::barrier;
use crate::cown::{CownSync, CownTable};
use crate::freeze;
use crate::invariant::{InvariantChecker, Violation};
use crate::lifecycle::{self, DEFAULT_PERMITTED_HOLDERS};
use crate::metadata::RegionTable;

/// Default cap on objects visited by one absorption, reconstruction, or
/// freeze pass.
pub const DEFAULT_TRAVERSAL_BUDGET: usize = 1 << 16;

/// Tunables for a [`Runtime`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Worklist cap per traversal; exceeding it unwinds with
    /// [`RegionError::OutOfMemory`].
    pub traversal_budget: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            traversal_budget: DEFAULT_TRAVERSAL_BUDGET,
        }
    }
}

/// Point-in-time snapshot of one region's counters, for diagnostics and
/// tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegionStats {
    pub name: Option<String>,
    pub lrc: u32,
    pub osc: u32,
    pub open: bool,
    pub dirty: bool,
}

/// The region subsystem's embedding surface.
pub struct Runtime {
    heap: Heap,
    regions: RegionTable,
    cowns: CownTable,
    checker: InvariantChecker,
    config: RuntimeConfig,
    /// Lazily created, frozen type object for cown handles.
    cown_type: Option<ObjectId>,
}

impl Runtime {
    /// Runtime with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    /// Runtime with explicit tunables.
    #[must_use]
    pub fn with_config(config: RuntimeConfig) -> Self {
        let mut heap = Heap::new();
        // Built-in types are shared across regions from the start, so they
        // are frozen eagerly instead of being dragged into regions by
        // absorption.
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
        Self {
            heap,
            regions: RegionTable::new(),
            cowns: CownTable::default(),
            checker: InvariantChecker::new(),
            config,
            cown_type: None,
        }
    }

    fn budget(&self) -> usize {
        self.config.traversal_budget.max(1)
    }

    // -----------------------------------------------------------------------
    // Allocation
    // -----------------------------------------------------------------------

    /// Count each edge the constructor took as a borrow from the new local
    /// object.
    fn account_new_object(&mut self, obj: ObjectId) {
        for child in self.heap.children(obj) {
            barrier::add_local_reference(&mut self.heap, &mut self.regions, child);
        }
        let ty = self.heap.type_of(obj);
        barrier::add_local_reference(&mut self.heap, &mut self.regions, ty);
    }

    /// Allocate an empty instance of `object`.
    pub fn alloc_object(&mut self) -> ObjectId {
        let obj = self.heap.alloc_plain();
        self.account_new_object(obj);
        obj
    }

    /// Allocate an empty instance of a custom type.
    pub fn alloc_instance(&mut self, ty: ObjectId) -> ObjectId {
        let obj = self.heap.alloc_instance(ty);
        self.account_new_object(obj);
        obj
    }

    /// Allocate a new type object.
    pub fn new_type(&mut self, name: &str) -> ObjectId {
        let obj = self.heap.new_type(name);
        self.account_new_object(obj);
        obj
    }

    /// Allocate a string.
    pub fn alloc_str(&mut self, value: &str) -> ObjectId {
        let obj = self.heap.alloc_str(value);
        self.account_new_object(obj);
        obj
    }

    /// Allocate an empty closure cell.
    pub fn alloc_cell(&mut self) -> ObjectId {
        let obj = self.heap.alloc_cell();
        self.account_new_object(obj);
        obj
    }

    /// Allocate an opaque native callable.
    pub fn alloc_native(&mut self) -> ObjectId {
        let obj = self.heap.alloc_native();
        self.account_new_object(obj);
        obj
    }

    /// Allocate an empty namespace.
    pub fn alloc_namespace(&mut self) -> ObjectId {
        let obj = self.heap.alloc_namespace();
        self.account_new_object(obj);
        obj
    }

    /// Allocate a code object.
    pub fn alloc_code(&mut self, names: Vec<String>, consts: Vec<ObjectId>) -> ObjectId {
        let obj = self.heap.alloc_code(names, consts);
        self.account_new_object(obj);
        obj
    }

    /// Allocate a function object.
    pub fn alloc_function(
        &mut self,
        code: ObjectId,
        defaults: Vec<ObjectId>,
        closure: Vec<ObjectId>,
        globals: ObjectId,
        builtins: ObjectId,
    ) -> ObjectId {
        let obj = self
            .heap
            .alloc_function(code, defaults, closure, globals, builtins);
        self.account_new_object(obj);
        obj
    }

    // -----------------------------------------------------------------------
    // Handles
    // -----------------------------------------------------------------------

    /// Take another counted handle on an object.
    pub fn retain_handle(&mut self, obj: ObjectId) {
        self.heap.incref(obj);
        barrier::add_local_reference(&mut self.heap, &mut self.regions, obj);
    }

    /// Give back a counted handle, tearing the object down if it was the
    /// last reference.
    pub fn release_handle(&mut self, obj: ObjectId) {
        if let RegionPointer::Region(r) = barrier::resolved_tag(&mut self.heap, &mut self.regions, obj)
        {
            self.regions.sub_lrc(r, 1);
        }
        self.drop_ref(obj);
    }

    /// Drop one reference; on zero, free and cascade through the object's
    /// edges iteratively.
    fn drop_ref(&mut self, obj: ObjectId) {
        let mut stack = vec![obj];
        while let Some(o) = stack.pop() {
            if self.heap.decref(o) > 0 {
                continue;
            }
            self.teardown(o, &mut stack);
        }
    }

    fn teardown(&mut self, o: ObjectId, stack: &mut Vec<ObjectId>) {
        trace!(obj = %o, "teardown");
        let tag = barrier::resolved_tag(&mut self.heap, &mut self.regions, o);
        let children = self.heap.children(o);
        for &child in &children {
            if let Err(err) = barrier::remove_reference(&mut self.heap, &mut self.regions, o, child)
            {
                trace!(obj = %o, error = %err, "edge accounting skipped during teardown");
            }
        }
        let ty = self.heap.type_of(o);
        match tag {
            RegionPointer::Cown(c) => {
                if let Some(value) = self.cowns.remove(c) {
                    stack.push(value);
                }
            }
            RegionPointer::Region(r) => {
                if self.regions.bridge(r) == Some(o) {
                    self.regions.set_bridge(r, None);
                }
                // The tag's metadata reference.
                self.regions.dec_rc(r);
            }
            RegionPointer::Local | RegionPointer::Immutable => {}
        }
        self.heap.free(o);
        stack.extend(children);
        stack.push(ty);
    }

    // -----------------------------------------------------------------------
    // Barrier-mediated mutation
    // -----------------------------------------------------------------------

    fn check_mutable(&mut self, obj: ObjectId) -> Result<()> {
        if barrier::resolved_tag(&mut self.heap, &mut self.regions, obj).is_immutable() {
            Err(RegionError::WriteToImmutable { obj })
        } else {
            Ok(())
        }
    }

    fn check_instance(&self, obj: ObjectId) -> Result<()> {
        if self.heap.is_instance(obj) {
            Ok(())
        } else {
            Err(RegionError::KindMismatch {
                obj,
                expected: "an instance",
            })
        }
    }

    /// Re-run add-side accounting for a previously valid edge that was put
    /// back after a failed store.
    fn restore_edge(&mut self, src: ObjectId, old: ObjectId) {
        let budget = self.budget();
        let restored =
            barrier::add_reference(&mut self.heap, &mut self.regions, budget, src, old);
        debug_assert!(restored.is_ok(), "re-adding a previously valid edge failed");
    }

    /// Store an attribute, `obj.name = value`.
    ///
    /// The replaced edge's accounting is undone before the new edge is
    /// checked, so overwriting a field with the value it already holds is
    /// never a custody violation. A rejected store leaves the old binding in
    /// place.
    pub fn set_field(&mut self, obj: ObjectId, name: &str, value: ObjectId) -> Result<()> {
        self.check_instance(obj)?;
        self.check_mutable(obj)?;
        let old = self.heap.field(obj, name);
        if let Some(o) = old {
            barrier::remove_reference(&mut self.heap, &mut self.regions, obj, o)?;
        }
        // The raw store records the edge (and its reference) first; the
        // barrier's borrow accounting reads live counts and expects it.
        let displaced = self.heap.set_field_raw(obj, name, value);
        debug_assert_eq!(displaced, old);
        let budget = self.budget();
        if let Err(err) =
            barrier::add_reference(&mut self.heap, &mut self.regions, budget, obj, value)
        {
            match old {
                Some(o) => {
                    let undone = self.heap.set_field_raw(obj, name, o);
                    debug_assert_eq!(undone, Some(value));
                    self.drop_ref(value);
                    // One displaced reference is now surplus.
                    self.drop_ref(o);
                    self.restore_edge(obj, o);
                }
                None => {
                    let undone = self.heap.remove_field_raw(obj, name);
                    debug_assert_eq!(undone, Some(value));
                    self.drop_ref(value);
                }
            }
            return Err(err);
        }
        if let Some(o) = displaced {
            self.drop_ref(o);
        }
        Ok(())
    }

    /// Delete an attribute.
    pub fn remove_field(&mut self, obj: ObjectId, name: &str) -> Result<()> {
        self.check_instance(obj)?;
        self.check_mutable(obj)?;
        if let Some(old) = self.heap.field(obj, name) {
            barrier::remove_reference(&mut self.heap, &mut self.regions, obj, old)?;
            let removed = self.heap.remove_field_raw(obj, name);
            debug_assert_eq!(removed, Some(old));
            self.drop_ref(old);
        }
        Ok(())
    }

    /// Store into a closure cell.
    pub fn set_cell(&mut self, cell: ObjectId, value: Option<ObjectId>) -> Result<()> {
        if !self.heap.is_cell(cell) {
            return Err(RegionError::KindMismatch {
                obj: cell,
                expected: "a cell",
            });
        }
        self.check_mutable(cell)?;
        let old = self.heap.cell_contents(cell);
        if let Some(o) = old {
            barrier::remove_reference(&mut self.heap, &mut self.regions, cell, o)?;
        }
        let displaced = self.heap.set_cell_raw(cell, value);
        debug_assert_eq!(displaced, old);
        if let Some(v) = value {
            let budget = self.budget();
            if let Err(err) =
                barrier::add_reference(&mut self.heap, &mut self.regions, budget, cell, v)
            {
                let undone = self.heap.set_cell_raw(cell, old);
                debug_assert_eq!(undone, Some(v));
                self.drop_ref(v);
                if let Some(o) = old {
                    self.drop_ref(o);
                    self.restore_edge(cell, o);
                }
                return Err(err);
            }
        }
        if let Some(o) = displaced {
            self.drop_ref(o);
        }
        Ok(())
    }

    /// Bind a namespace key. Rebinding a key that capture analysis pinned
    /// is rejected.
    pub fn ns_bind(&mut self, ns: ObjectId, key: &str, value: ObjectId) -> Result<()> {
        if !self.heap.is_namespace(ns) {
            return Err(RegionError::KindMismatch {
                obj: ns,
                expected: "a namespace",
            });
        }
        self.check_mutable(ns)?;
        if self.heap.ns_key_frozen(ns, key) {
            return Err(RegionError::WriteToImmutable { obj: ns });
        }
        let old = self.heap.ns_get(ns, key);
        if let Some(o) = old {
            barrier::remove_reference(&mut self.heap, &mut self.regions, ns, o)?;
        }
        let displaced = self.heap.ns_bind_raw(ns, key, value);
        debug_assert_eq!(displaced, old);
        let budget = self.budget();
        if let Err(err) =
            barrier::add_reference(&mut self.heap, &mut self.regions, budget, ns, value)
        {
            match old {
                Some(o) => {
                    let undone = self.heap.ns_bind_raw(ns, key, o);
                    debug_assert_eq!(undone, Some(value));
                    self.drop_ref(value);
                    self.drop_ref(o);
                    self.restore_edge(ns, o);
                }
                None => {
                    let undone = self.heap.ns_unbind_raw(ns, key);
                    debug_assert_eq!(undone, Some(value));
                    self.drop_ref(value);
                }
            }
            return Err(err);
        }
        if let Some(o) = displaced {
            self.drop_ref(o);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Peek at an attribute without taking a handle.
    #[must_use]
    pub fn field(&self, obj: ObjectId, name: &str) -> Option<ObjectId> {
        self.heap.field(obj, name)
    }

    /// Peek at a closure cell.
    #[must_use]
    pub fn cell_contents(&self, cell: ObjectId) -> Option<ObjectId> {
        self.heap.cell_contents(cell)
    }

    /// Peek at a namespace binding.
    #[must_use]
    pub fn ns_get(&self, ns: ObjectId, key: &str) -> Option<ObjectId> {
        self.heap.ns_get(ns, key)
    }

    /// Whether capture analysis pinned a namespace key.
    #[must_use]
    pub fn ns_key_frozen(&self, ns: ObjectId, key: &str) -> bool {
        self.heap.ns_key_frozen(ns, key)
    }

    /// Current reference count.
    #[must_use]
    pub fn rc(&self, obj: ObjectId) -> u32 {
        self.heap.rc(obj)
    }

    /// Number of live heap objects.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.heap.live_count()
    }

    /// The object's ownership, with merge forwarding resolved.
    pub fn ownership(&mut self, obj: ObjectId) -> RegionPointer {
        barrier::resolved_tag(&mut self.heap, &mut self.regions, obj)
    }

    /// True once the object has been frozen.
    #[must_use]
    pub fn is_immutable(&self, obj: ObjectId) -> bool {
        self.heap.region_tag(obj).is_immutable()
    }

    // -----------------------------------------------------------------------
    // Regions
    // -----------------------------------------------------------------------

    /// Create a new open region, returning its bridge object (a counted
    /// handle; the handle is the region's first borrow).
    pub fn new_region(&mut self, name: Option<&str>) -> ObjectId {
        self.checker.notify_regions_in_use();
        let bridge = self.heap.alloc_plain();
        let r = self.regions.alloc(name.map(str::to_owned), bridge);
        self.regions.inc_rc(r);
        self.heap.set_region_tag(bridge, RegionPointer::Region(r));
        self.regions.add_lrc(r, 1);
        debug!(region = %r, bridge = %bridge, name, "region created");
        bridge
    }

    fn region_of(&mut self, bridge: ObjectId) -> Result<RegionId> {
        match barrier::resolved_tag(&mut self.heap, &mut self.regions, bridge) {
            RegionPointer::Region(r) if self.regions.bridge(r) == Some(bridge) => Ok(r),
            _ => Err(RegionError::NotAMember { obj: bridge }),
        }
    }

    /// (Re)open a region. Idempotent; propagates openness to ancestors.
    pub fn open(&mut self, bridge: ObjectId) -> Result<()> {
        let r = self.region_of(bridge)?;
        self.regions.open(r);
        Ok(())
    }

    /// Whether the region is open.
    pub fn is_open(&mut self, bridge: ObjectId) -> Result<bool> {
        let r = self.region_of(bridge)?;
        Ok(self.regions.is_open(r))
    }

    /// Close the region, tolerating one external holder (the bridge
    /// handle).
    pub fn close(&mut self, bridge: ObjectId) -> Result<()> {
        self.close_with_holders(bridge, DEFAULT_PERMITTED_HOLDERS)
    }

    /// Close the region with an explicit external holder allowance.
    ///
    /// A dirty region's incremental counters are not trusted; closing one
    /// goes through reconstruction instead.
    pub fn close_with_holders(&mut self, bridge: ObjectId, permitted: u32) -> Result<()> {
        let r = self.region_of(bridge)?;
        if self.regions.is_dirty(r) {
            let budget = self.budget();
            return lifecycle::try_close(
                &mut self.heap,
                &mut self.regions,
                &self.cowns,
                budget,
                bridge,
                r,
                permitted,
            );
        }
        lifecycle::close_region(&mut self.regions, &self.cowns, r, permitted)
    }

    /// Close after re-deriving membership and borrows from the live graph.
    pub fn try_close(&mut self, bridge: ObjectId) -> Result<()> {
        self.try_close_with_holders(bridge, DEFAULT_PERMITTED_HOLDERS)
    }

    /// Reconstructing close with an explicit holder allowance.
    pub fn try_close_with_holders(&mut self, bridge: ObjectId, permitted: u32) -> Result<()> {
        let r = self.region_of(bridge)?;
        let budget = self.budget();
        lifecycle::try_close(
            &mut self.heap,
            &mut self.regions,
            &self.cowns,
            budget,
            bridge,
            r,
            permitted,
        )
    }

    /// Pull a local object (and its reachable local subgraph) into the
    /// region.
    pub fn add_object(&mut self, bridge: ObjectId, obj: ObjectId) -> Result<()> {
        let r = self.region_of(bridge)?;
        if barrier::resolved_tag(&mut self.heap, &mut self.regions, obj) != RegionPointer::Local {
            return Err(RegionError::AlreadyOwned { obj });
        }
        let budget = self.budget();
        barrier::add_to_region(&mut self.heap, &mut self.regions, budget, bridge, obj, r, 0)
    }

    /// Turn a member back into a local object. The bridge itself is not a
    /// removable member.
    ///
    /// The caller keeps custody through its own handle and is expected to
    /// have dropped interior references to `obj` first. The borrow estimate
    /// below cannot tell remaining interior references from external
    /// handles, so the region is left dirty and the next close re-derives
    /// membership from the live graph; an object still reachable from the
    /// bridge is simply re-absorbed then.
    pub fn remove_object(&mut self, bridge: ObjectId, obj: ObjectId) -> Result<()> {
        let r = self.region_of(bridge)?;
        if barrier::resolved_tag(&mut self.heap, &mut self.regions, obj)
            != RegionPointer::Region(r)
            || obj == bridge
        {
            return Err(RegionError::NotAMember { obj });
        }
        // Inbound references stop being borrows into the region; outgoing
        // edges onto members become borrows.
        let inbound = self.heap.rc(obj).min(self.regions.lrc(r));
        self.regions.sub_lrc(r, inbound);
        let mut edges = self.heap.children(obj);
        edges.push(self.heap.type_of(obj));
        for child in edges {
            if barrier::resolved_tag(&mut self.heap, &mut self.regions, child)
                == RegionPointer::Region(r)
            {
                self.regions.add_lrc(r, 1);
            }
        }
        barrier::retag(&mut self.heap, &mut self.regions, obj, RegionPointer::Local);
        self.regions.mark_dirty(r);
        Ok(())
    }

    /// Whether the region owns `obj`.
    pub fn owns_object(&mut self, bridge: ObjectId, obj: ObjectId) -> Result<bool> {
        let r = self.region_of(bridge)?;
        Ok(barrier::resolved_tag(&mut self.heap, &mut self.regions, obj)
            == RegionPointer::Region(r))
    }

    /// Snapshot the region's counters.
    pub fn region_stats(&mut self, bridge: ObjectId) -> Result<RegionStats> {
        let r = self.region_of(bridge)?;
        Ok(RegionStats {
            name: self.regions.name(r).map(str::to_owned),
            lrc: self.regions.lrc(r),
            osc: self.regions.osc(r),
            open: self.regions.is_open(r),
            dirty: self.regions.is_dirty(r),
        })
    }

    // -----------------------------------------------------------------------
    // Freezing
    // -----------------------------------------------------------------------

    /// Freeze the object and everything reachable from it.
    pub fn make_immutable(&mut self, obj: ObjectId) -> Result<()> {
        let budget = self.budget();
        freeze::make_immutable(&mut self.heap, &mut self.regions, budget, obj)
    }

    // -----------------------------------------------------------------------
    // Cowns
    // -----------------------------------------------------------------------

    fn cown_type(&mut self) -> Result<ObjectId> {
        if let Some(ty) = self.cown_type {
            return Ok(ty);
        }
        let ty = self.heap.new_type("cown");
        let budget = self.budget();
        freeze::make_immutable(&mut self.heap, &mut self.regions, budget, ty)?;
        self.cown_type = Some(ty);
        Ok(ty)
    }

    /// Create a cown, optionally wiring an initial value the way `set`
    /// would. Returns the cown's heap handle.
    pub fn new_cown(&mut self, value: Option<ObjectId>) -> Result<ObjectId> {
        self.checker.notify_regions_in_use();
        let ty = self.cown_type()?;
        let handle = self.heap.alloc(ObjectKind::Native, ty);
        let c = self.cowns.alloc(handle);
        self.heap.set_region_tag(handle, RegionPointer::Cown(c));
        debug!(cown = %c, handle = %handle, "cown created");
        if let Some(v) = value {
            if let Err(err) = self.cown_store(c, handle, v) {
                self.drop_ref(handle);
                return Err(err);
            }
        }
        Ok(handle)
    }

    fn cown_of(&self, handle: ObjectId) -> Result<CownId> {
        match self.heap.region_tag(handle) {
            RegionPointer::Cown(c) => Ok(c),
            _ => Err(RegionError::lock_discipline(handle, "object is not a cown")),
        }
    }

    /// The thread-safe acquisition half of a cown, for blocking from other
    /// threads without holding the runtime.
    pub fn cown_sync(&self, handle: ObjectId) -> Result<Arc<CownSync>> {
        Ok(Arc::clone(self.cowns.sync(self.cown_of(handle)?)))
    }

    /// Block until the calling thread holds the cown.
    pub fn cown_acquire(&self, handle: ObjectId) -> Result<()> {
        self.cowns.sync(self.cown_of(handle)?).acquire();
        Ok(())
    }

    /// Release the cown, waking one waiter.
    pub fn cown_release(&self, handle: ObjectId) -> Result<()> {
        self.cowns.sync(self.cown_of(handle)?).release()
    }

    /// Current acquisition state.
    pub fn cown_state(&self, handle: ObjectId) -> Result<CownState> {
        Ok(self.cowns.sync(self.cown_of(handle)?).state())
    }

    /// Read the stored value. Requires the calling thread to hold the cown;
    /// the returned id is a fresh counted handle.
    pub fn cown_get(&mut self, handle: ObjectId) -> Result<Option<ObjectId>> {
        let c = self.cown_of(handle)?;
        self.cowns.sync(c).require_held()?;
        let value = self.cowns.value(c);
        if let Some(v) = value {
            self.retain_handle(v);
        }
        Ok(value)
    }

    /// Store a value. Requires the calling thread to hold the cown; only a
    /// bridge object, another cown, or an immutable object is accepted.
    ///
    /// Storing a closed region's bridge releases the cown immediately (the
    /// region is ready for the next owner); an open region parks the cown
    /// until the region closes; non-region values release immediately.
    pub fn cown_set(&mut self, handle: ObjectId, value: ObjectId) -> Result<()> {
        let c = self.cown_of(handle)?;
        self.cowns.sync(c).require_held()?;
        self.cown_store(c, handle, value)
    }

    fn cown_store(&mut self, c: CownId, handle: ObjectId, value: ObjectId) -> Result<()> {
        let region = match barrier::resolved_tag(&mut self.heap, &mut self.regions, value) {
            RegionPointer::Region(r) if self.regions.bridge(r) == Some(value) => Some(r),
            RegionPointer::Cown(_) | RegionPointer::Immutable => None,
            _ => {
                return Err(RegionError::InvalidCownValue {
                    cown: handle,
                    value,
                })
            }
        };
        if let Some(r) = region {
            // Re-storing the region this cown already owns is idempotent.
            if self.regions.cown(r).is_some_and(|owner| owner != c)
                || self.regions.get_parent(r).is_some()
            {
                return Err(RegionError::AlreadyOwned { obj: value });
            }
        }

        self.heap.incref(value);
        let old = self.cowns.set_value(c, Some(value));
        if let Some(o) = old {
            if let RegionPointer::Region(old_r) =
                barrier::resolved_tag(&mut self.heap, &mut self.regions, o)
            {
                if self.regions.cown(old_r) == Some(c) {
                    self.regions.set_cown(old_r, None);
                    self.regions.dec_rc(old_r);
                }
            }
            self.drop_ref(o);
        }

        match region {
            Some(r) => {
                // Region ownership moves to the cown; close will hand it
                // back.
                self.regions.set_cown(r, Some(c));
                self.regions.inc_rc(r);
                if self.regions.is_open(r) {
                    self.cowns.sync(c).park_pending_release();
                    Ok(())
                } else {
                    self.cowns.sync(c).release()
                }
            }
            None => self.cowns.sync(c).release(),
        }
    }

    // -----------------------------------------------------------------------
    // Invariant checking
    // -----------------------------------------------------------------------

    /// Run a full-heap pass. Returns true if a violation was found and
    /// recorded.
    pub fn check_invariant(&mut self) -> bool {
        self.checker.check(&mut self.heap, &mut self.regions)
    }

    /// Clear the recorded violation and arm the checker again.
    pub fn rearm_invariant(&mut self) {
        self.checker.rearm();
    }

    /// The first violation of the last failing pass.
    #[must_use]
    pub fn invariant_violation(&self) -> Option<&Violation> {
        self.checker.violation()
    }

    /// Checker context, for state queries.
    #[must_use]
    pub const fn invariant_checker(&self) -> &InvariantChecker {
        &self.checker
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}
