//! Region metadata records and the merge tree.
//!
//! Every region is one arena slot in the [`RegionTable`]. A slot carries the
//! borrow and open-subregion counters, the lifecycle flags, the parent link,
//! and — once the region has been merged away — a forwarding pointer that
//! turns the slot into a union-find node. Forwarding chains are compressed
//! lazily on lookup, transferring one metadata reference per rewritten link.
//!
//! Metadata liveness is reference counted. Contributions to `rc`:
//! - every live object currently tagged with the region (the bridge object
//!   included),
//! - every child region's parent link,
//! - a cown that owns the region,
//! - every forwarding link that targets the region.
//!
//! Reaching zero frees the slot and cascades a decrement to the parent and
//! to the forwarding target. Counter folds (`lrc`, `osc`, the open flag)
//! happen eagerly at merge time; lazy link rewrites only ever move `rc`.

use cordon_types::{CownId, ObjectId, RegionId, RegionPointer};
use tracing::{debug, trace};

/// Why a merge was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeError {
    /// The fold would create a cycle in the parent topology.
    WouldCycle,
    /// The region being merged away has a parent (or cown) that cannot be
    /// hoisted onto the merge target.
    ForeignParent,
}

/// Per-region record.
#[derive(Debug, Default)]
struct RegionMetadata {
    /// Borrowed references from local objects into this region.
    lrc: u32,
    /// Currently open child regions.
    osc: u32,
    /// Metadata liveness count (see module docs).
    rc: u32,
    open: bool,
    /// Set when a traversal failed mid-flight; `lrc` is untrusted and the
    /// region must not be auto-closed by `osc` bookkeeping.
    dirty: bool,
    parent: Option<RegionId>,
    /// Union-find forwarding link; `Some` once merged away.
    forward: Option<RegionPointer>,
    /// Weak handle to the unique entry-point object.
    bridge: Option<ObjectId>,
    name: Option<String>,
    cown: Option<CownId>,
}

/// Arena of region metadata records.
#[derive(Default)]
pub struct RegionTable {
    slots: Vec<Option<RegionMetadata>>,
    free_list: Vec<u32>,
}

impl RegionTable {
    /// Empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, id: RegionId) -> &RegionMetadata {
        self.slots[id.index()].as_ref().expect("dangling region id")
    }

    fn slot_mut(&mut self, id: RegionId) -> &mut RegionMetadata {
        self.slots[id.index()].as_mut().expect("dangling region id")
    }

    /// True while the slot is live (unfreed). Mostly useful in tests that
    /// assert on cascade frees.
    #[must_use]
    pub fn is_live(&self, id: RegionId) -> bool {
        self.slots
            .get(id.index())
            .is_some_and(std::option::Option::is_some)
    }

    /// Allocate a fresh, open region with `rc = 0`; the caller establishes
    /// the bridge tag (which contributes the first reference).
    pub fn alloc(&mut self, name: Option<String>, bridge: ObjectId) -> RegionId {
        let meta = RegionMetadata {
            open: true,
            bridge: Some(bridge),
            name,
            ..RegionMetadata::default()
        };
        let id = if let Some(idx) = self.free_list.pop() {
            self.slots[idx as usize] = Some(meta);
            RegionId::new(idx + 1).expect("region index overflow")
        } else {
            self.slots.push(Some(meta));
            let n = u32::try_from(self.slots.len()).expect("region table exceeded u32 slots");
            RegionId::new(n).expect("region index overflow")
        };
        trace!(region = %id, "region metadata allocated");
        id
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    /// Local (borrowed) reference count.
    #[must_use]
    pub fn lrc(&self, id: RegionId) -> u32 {
        self.slot(id).lrc
    }

    /// Open subregion count.
    #[must_use]
    pub fn osc(&self, id: RegionId) -> u32 {
        self.slot(id).osc
    }

    /// Metadata liveness count.
    #[must_use]
    pub fn rc(&self, id: RegionId) -> u32 {
        self.slot(id).rc
    }

    /// Whether the region is open.
    #[must_use]
    pub fn is_open(&self, id: RegionId) -> bool {
        self.slot(id).open
    }

    /// Whether the region's `lrc` is untrusted.
    #[must_use]
    pub fn is_dirty(&self, id: RegionId) -> bool {
        self.slot(id).dirty
    }

    /// The region's unique entry-point object, if it still has one.
    #[must_use]
    pub fn bridge(&self, id: RegionId) -> Option<ObjectId> {
        self.slot(id).bridge
    }

    /// Diagnostic label.
    #[must_use]
    pub fn name(&self, id: RegionId) -> Option<&str> {
        self.slot(id).name.as_deref()
    }

    /// The cown that owns this region, if any.
    #[must_use]
    pub fn cown(&self, id: RegionId) -> Option<CownId> {
        self.slot(id).cown
    }

    /// True once the region has been merged away.
    #[must_use]
    pub fn is_merged(&self, id: RegionId) -> bool {
        self.slot(id).forward.is_some()
    }

    pub(crate) fn add_lrc(&mut self, id: RegionId, n: u32) {
        self.slot_mut(id).lrc += n;
    }

    pub(crate) fn sub_lrc(&mut self, id: RegionId, n: u32) {
        let slot = self.slot_mut(id);
        debug_assert!(slot.lrc >= n, "lrc underflow");
        slot.lrc = slot.lrc.saturating_sub(n);
    }

    pub(crate) fn sub_osc(&mut self, id: RegionId, n: u32) {
        let slot = self.slot_mut(id);
        debug_assert!(slot.osc >= n, "osc underflow");
        slot.osc = slot.osc.saturating_sub(n);
    }

    pub(crate) fn set_cown(&mut self, id: RegionId, cown: Option<CownId>) {
        self.slot_mut(id).cown = cown;
    }

    pub(crate) fn set_bridge(&mut self, id: RegionId, bridge: Option<ObjectId>) {
        self.slot_mut(id).bridge = bridge;
    }

    pub(crate) fn take_name(&mut self, id: RegionId) -> Option<String> {
        self.slot_mut(id).name.take()
    }

    pub(crate) fn set_open_flag(&mut self, id: RegionId, open: bool) {
        self.slot_mut(id).open = open;
    }

    /// Mark `id` and every ancestor dirty.
    pub fn mark_dirty(&mut self, id: RegionId) {
        let mut cursor = Some(id);
        while let Some(r) = cursor {
            self.slot_mut(r).dirty = true;
            cursor = self.get_parent(r);
        }
    }

    // -----------------------------------------------------------------------
    // Liveness
    // -----------------------------------------------------------------------

    /// Add one metadata reference.
    pub fn inc_rc(&mut self, id: RegionId) {
        self.slot_mut(id).rc += 1;
    }

    /// Drop one metadata reference, freeing the slot (and cascading to the
    /// parent and forwarding target) when it reaches zero.
    pub fn dec_rc(&mut self, id: RegionId) {
        let slot = self.slot_mut(id);
        debug_assert!(slot.rc > 0, "region metadata rc underflow");
        slot.rc -= 1;
        if slot.rc == 0 {
            let meta = self.slots[id.index()].take().expect("dangling region id");
            self.free_list.push(id.index() as u32);
            trace!(region = %id, "region metadata freed");
            if let Some(parent) = meta.parent {
                self.dec_rc(parent);
            }
            if let Some(RegionPointer::Region(target)) = meta.forward {
                self.dec_rc(target);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Merge tree
    // -----------------------------------------------------------------------

    /// Resolve a region to its merge-tree root: the region itself if it has
    /// never been merged, another region, or `Local` if it was folded back
    /// into the thread-local set. Forwarding links along the chain are
    /// rewritten to the root, moving one `rc` per rewritten link.
    pub fn resolve(&mut self, id: RegionId) -> RegionPointer {
        match self.slot(id).forward {
            None => RegionPointer::Region(id),
            Some(RegionPointer::Region(next)) => {
                let root = self.resolve(next);
                if root != RegionPointer::Region(next) {
                    if let RegionPointer::Region(r) = root {
                        self.inc_rc(r);
                    }
                    self.slot_mut(id).forward = Some(root);
                    self.dec_rc(next);
                }
                root
            }
            Some(other) => other,
        }
    }

    /// Fold `src` into `dst`. `src`'s counters and open flag move to `dst`,
    /// `src` becomes a forwarding node, and its bridge handle is cleared
    /// (weak: the bridge object itself is untouched).
    ///
    /// A `src` with its own parent is accepted only when that parent resolves
    /// to `dst` (the link is dissolved) or when `dst` is a root that can take
    /// the parent over; anything else is refused.
    pub fn merge(&mut self, src: RegionId, dst: RegionId) -> Result<(), MergeError> {
        debug_assert!(!self.is_merged(src), "merging an already-merged region");
        debug_assert!(!self.is_merged(dst), "merging into a merged region");
        if src == dst {
            return Err(MergeError::WouldCycle);
        }
        if self.has_ancestor(dst, src) {
            return Err(MergeError::WouldCycle);
        }
        if self.slot(src).cown.is_some() && self.slot(dst).cown.is_some() {
            return Err(MergeError::ForeignParent);
        }

        if let Some(parent) = self.get_parent(src) {
            if parent == dst {
                self.set_parent(src, None);
            } else if self.get_parent(dst).is_none() {
                // Hoist src's parent onto the merge target.
                self.set_parent(dst, Some(parent));
                self.set_parent(src, None);
            } else {
                return Err(MergeError::ForeignParent);
            }
        }

        if let Some(cown) = self.slot(src).cown {
            // The cown's reference moves with the ownership.
            self.slot_mut(src).cown = None;
            self.slot_mut(dst).cown = Some(cown);
            self.inc_rc(dst);
            self.dec_rc(src);
        }

        let (lrc, osc, was_open) = {
            let s = self.slot_mut(src);
            let vals = (s.lrc, s.osc, s.open);
            s.lrc = 0;
            s.osc = 0;
            s.bridge = None;
            s.forward = Some(RegionPointer::Region(dst));
            vals
        };
        self.inc_rc(dst);
        self.slot_mut(dst).lrc += lrc;
        self.slot_mut(dst).osc += osc;
        if was_open {
            self.open(dst);
        }
        debug!(src = %src, dst = %dst, lrc, osc, "regions merged");
        Ok(())
    }

    /// Fold `src` back into the thread-local set: its members are treated as
    /// unowned from now on. Counters are discarded (local objects have no
    /// region counters) and the bridge handle is cleared.
    pub fn merge_into_local(&mut self, src: RegionId) {
        debug_assert!(!self.is_merged(src), "merging an already-merged region");
        debug_assert!(
            self.slot(src).parent.is_none(),
            "merging a parented region into local"
        );
        debug_assert!(
            self.slot(src).cown.is_none(),
            "merging a cown-owned region into local"
        );
        let s = self.slot_mut(src);
        s.lrc = 0;
        s.osc = 0;
        s.bridge = None;
        s.forward = Some(RegionPointer::Local);
        debug!(src = %src, "region folded into local");
    }

    // -----------------------------------------------------------------------
    // Parent topology
    // -----------------------------------------------------------------------

    /// The region's parent, resolving (and compressing) a parent link whose
    /// target has itself been merged away. Rewrites move one `rc`.
    #[allow(clippy::missing_panics_doc)]
    pub fn get_parent(&mut self, id: RegionId) -> Option<RegionId> {
        let parent = self.slot(id).parent?;
        match self.resolve(parent) {
            RegionPointer::Region(root) if root == parent => Some(parent),
            RegionPointer::Region(root) => {
                self.inc_rc(root);
                self.slot_mut(id).parent = Some(root);
                self.dec_rc(parent);
                Some(root)
            }
            // The parent was folded into the thread-local set; the subregion
            // link is gone. The member edge that backed it still exists and
            // its source is local now, so it counts as a borrow from here on.
            RegionPointer::Local => {
                let slot = self.slot_mut(id);
                slot.parent = None;
                slot.lrc += 1;
                self.dec_rc(parent);
                None
            }
            RegionPointer::Immutable | RegionPointer::Cown(_) => {
                unreachable!("forwarding links only target regions or local")
            }
        }
    }

    /// Replace the parent link. This is the only place that moves the
    /// rc/osc bookkeeping for a parent change: the new parent gains a
    /// reference (and an open-subregion unit if the child is open, opening
    /// it if needed), then the old parent loses both, which may cascade a
    /// free or a transitive close elsewhere.
    pub fn set_parent(&mut self, id: RegionId, new_parent: Option<RegionId>) {
        let old_parent = self.get_parent(id);
        if old_parent == new_parent {
            return;
        }
        let child_open = self.slot(id).open;

        if let Some(p) = new_parent {
            debug_assert!(!self.is_merged(p), "parenting onto a merged region");
            self.inc_rc(p);
            if child_open {
                self.slot_mut(p).osc += 1;
                if !self.slot(p).open {
                    self.open(p);
                }
            }
        }
        self.slot_mut(id).parent = new_parent;
        if let Some(p) = old_parent {
            if child_open {
                let slot = self.slot_mut(p);
                debug_assert!(slot.osc > 0, "osc underflow");
                slot.osc = slot.osc.saturating_sub(1);
            }
            self.dec_rc(p);
        }
    }

    /// True if `candidate` is a strict ancestor of `id` in the parent
    /// topology (a region is not its own ancestor).
    pub fn has_ancestor(&mut self, id: RegionId, candidate: RegionId) -> bool {
        let mut cursor = self.get_parent(id);
        while let Some(r) = cursor {
            if r == candidate {
                return true;
            }
            cursor = self.get_parent(r);
        }
        false
    }

    /// Mark the region open, propagating the open-subregion count upward:
    /// an open child keeps its whole ancestor chain open.
    pub fn open(&mut self, id: RegionId) {
        if self.slot(id).open {
            return;
        }
        self.slot_mut(id).open = true;
        if let Some(parent) = self.get_parent(id) {
            self.slot_mut(parent).osc += 1;
            self.open(parent);
        }
    }
}
