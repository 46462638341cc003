//! Slab-backed object heap with manual reference counting.
//!
//! The heap is the host-runtime collaborator the region subsystem is layered
//! on. It owns object storage, reference counts, and the per-object region
//! tag, and it exposes the generic outgoing-edge enumeration protocol plus
//! allocation-ordered live-object iteration. It knows nothing about region
//! semantics: the write barrier and teardown accounting live above it.
//!
//! Reference-count discipline:
//! - constructors and storing mutators take their own strong reference on
//!   every child edge they record;
//! - mutators return the displaced value with its reference still counted,
//!   so the caller can run barrier accounting before dropping it;
//! - `decref` never frees. The owner of the heap drives teardown explicitly
//!   via [`Heap::free`] so edge accounting can run per dropped object.

use std::collections::BTreeMap;

use cordon_types::{ObjectId, RegionPointer};
use tracing::trace;

use crate::object::{CoreTypes, ObjectKind};

struct Slot {
    rc: u32,
    tag: RegionPointer,
    ty: ObjectId,
    kind: ObjectKind,
}

/// Reference-counted object heap.
pub struct Heap {
    slots: Vec<Option<Slot>>,
    free_list: Vec<u32>,
    types: CoreTypes,
}

impl Heap {
    /// Create a heap with the built-in type objects bootstrapped.
    #[must_use]
    pub fn new() -> Self {
        let mut heap = Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            // Fixed up below, once the real type objects exist.
            types: CoreTypes {
                type_type: ObjectId::new(1).unwrap(),
                object_type: ObjectId::new(1).unwrap(),
                str_type: ObjectId::new(1).unwrap(),
                cell_type: ObjectId::new(1).unwrap(),
                function_type: ObjectId::new(1).unwrap(),
                code_type: ObjectId::new(1).unwrap(),
                namespace_type: ObjectId::new(1).unwrap(),
                native_type: ObjectId::new(1).unwrap(),
            },
        };

        // `type` is its own type; the placeholder self-link is already
        // correct because slot 1 is the first allocation.
        let type_type = heap.push_slot(Slot {
            rc: 1,
            tag: RegionPointer::Local,
            ty: ObjectId::new(1).unwrap(),
            kind: ObjectKind::Type {
                name: "type".to_owned(),
            },
        });
        debug_assert_eq!(type_type.get(), 1);
        heap.types.type_type = type_type;

        heap.types.object_type = heap.new_type("object");
        heap.types.str_type = heap.new_type("str");
        heap.types.cell_type = heap.new_type("cell");
        heap.types.function_type = heap.new_type("function");
        heap.types.code_type = heap.new_type("code");
        heap.types.namespace_type = heap.new_type("namespace");
        heap.types.native_type = heap.new_type("native");
        heap
    }

    /// Handles to the built-in type objects.
    #[must_use]
    pub const fn types(&self) -> &CoreTypes {
        &self.types
    }

    fn push_slot(&mut self, slot: Slot) -> ObjectId {
        if let Some(idx) = self.free_list.pop() {
            self.slots[idx as usize] = Some(slot);
            ObjectId::new(idx + 1).expect("slot index overflow")
        } else {
            self.slots.push(Some(slot));
            let n = u32::try_from(self.slots.len()).expect("heap exceeded u32 slots");
            ObjectId::new(n).expect("slot index overflow")
        }
    }

    fn slot(&self, id: ObjectId) -> &Slot {
        self.slots[id.index()].as_ref().expect("dangling object id")
    }

    fn slot_mut(&mut self, id: ObjectId) -> &mut Slot {
        self.slots[id.index()].as_mut().expect("dangling object id")
    }

    // -----------------------------------------------------------------------
    // Allocation
    // -----------------------------------------------------------------------

    /// Allocate an object with an explicit payload and type. The new object
    /// starts with `rc = 1` (the creator's handle), tagged `Local`. Takes a
    /// strong reference on the type.
    pub fn alloc(&mut self, kind: ObjectKind, ty: ObjectId) -> ObjectId {
        self.incref(ty);
        let id = self.push_slot(Slot {
            rc: 1,
            tag: RegionPointer::Local,
            ty,
            kind,
        });
        trace!(obj = %id, "alloc");
        id
    }

    /// Allocate a new type object.
    pub fn new_type(&mut self, name: &str) -> ObjectId {
        let ty = self.types.type_type;
        self.alloc(
            ObjectKind::Type {
                name: name.to_owned(),
            },
            ty,
        )
    }

    /// Allocate an empty instance of `object`.
    pub fn alloc_plain(&mut self) -> ObjectId {
        let ty = self.types.object_type;
        self.alloc(ObjectKind::plain(), ty)
    }

    /// Allocate an empty instance of a custom type.
    pub fn alloc_instance(&mut self, ty: ObjectId) -> ObjectId {
        self.alloc(ObjectKind::plain(), ty)
    }

    /// Allocate a string.
    pub fn alloc_str(&mut self, value: &str) -> ObjectId {
        let ty = self.types.str_type;
        self.alloc(ObjectKind::Str(value.to_owned()), ty)
    }

    /// Allocate an empty closure cell.
    pub fn alloc_cell(&mut self) -> ObjectId {
        let ty = self.types.cell_type;
        self.alloc(ObjectKind::Cell { contents: None }, ty)
    }

    /// Allocate an opaque native callable.
    pub fn alloc_native(&mut self) -> ObjectId {
        let ty = self.types.native_type;
        self.alloc(ObjectKind::Native, ty)
    }

    /// Allocate an empty namespace.
    pub fn alloc_namespace(&mut self) -> ObjectId {
        let ty = self.types.namespace_type;
        self.alloc(ObjectKind::namespace(), ty)
    }

    /// Allocate a code object. Takes strong references on the constants.
    pub fn alloc_code(&mut self, names: Vec<String>, consts: Vec<ObjectId>) -> ObjectId {
        for &c in &consts {
            self.incref(c);
        }
        let ty = self.types.code_type;
        self.alloc(ObjectKind::Code { names, consts }, ty)
    }

    /// Allocate a function object. Takes strong references on every captured
    /// edge (code, defaults, closure cells, and both namespaces).
    pub fn alloc_function(
        &mut self,
        code: ObjectId,
        defaults: Vec<ObjectId>,
        closure: Vec<ObjectId>,
        globals: ObjectId,
        builtins: ObjectId,
    ) -> ObjectId {
        self.incref(code);
        for &d in &defaults {
            self.incref(d);
        }
        for &c in &closure {
            self.incref(c);
        }
        self.incref(globals);
        self.incref(builtins);
        let ty = self.types.function_type;
        self.alloc(
            ObjectKind::Function {
                code,
                defaults,
                closure,
                globals,
                builtins,
            },
            ty,
        )
    }

    // -----------------------------------------------------------------------
    // Reference counting
    // -----------------------------------------------------------------------

    /// Increment an object's reference count.
    pub fn incref(&mut self, id: ObjectId) {
        self.slot_mut(id).rc += 1;
    }

    /// Decrement an object's reference count and return the new count.
    /// Never frees; the heap's owner drives teardown via [`Heap::free`].
    pub fn decref(&mut self, id: ObjectId) -> u32 {
        let slot = self.slot_mut(id);
        debug_assert!(slot.rc > 0, "decref of dead object");
        slot.rc -= 1;
        slot.rc
    }

    /// Current reference count.
    #[must_use]
    pub fn rc(&self, id: ObjectId) -> u32 {
        self.slot(id).rc
    }

    /// Reclaim a slot whose reference count has reached zero, returning the
    /// payload and the type handle so the caller can account for and drop
    /// the outgoing edges.
    pub fn free(&mut self, id: ObjectId) -> (ObjectKind, ObjectId) {
        let slot = self.slots[id.index()]
            .take()
            .expect("freeing dangling object id");
        debug_assert_eq!(slot.rc, 0, "freeing live object");
        trace!(obj = %id, "free");
        self.free_list.push(id.index() as u32);
        (slot.kind, slot.ty)
    }

    // -----------------------------------------------------------------------
    // Region tags and type links
    // -----------------------------------------------------------------------

    /// The object's current ownership tag.
    #[must_use]
    pub fn region_tag(&self, id: ObjectId) -> RegionPointer {
        self.slot(id).tag
    }

    /// Overwrite the object's ownership tag.
    pub fn set_region_tag(&mut self, id: ObjectId, tag: RegionPointer) {
        self.slot_mut(id).tag = tag;
    }

    /// The object's type object.
    #[must_use]
    pub fn type_of(&self, id: ObjectId) -> ObjectId {
        self.slot(id).ty
    }

    /// Read access to the payload.
    #[must_use]
    pub fn kind(&self, id: ObjectId) -> &ObjectKind {
        &self.slot(id).kind
    }

    /// True for attribute-carrying instances.
    #[must_use]
    pub fn is_instance(&self, id: ObjectId) -> bool {
        self.slot(id).kind.is_instance()
    }

    /// True for closure cells.
    #[must_use]
    pub fn is_cell(&self, id: ObjectId) -> bool {
        self.slot(id).kind.is_cell()
    }

    /// True for namespaces.
    #[must_use]
    pub fn is_namespace(&self, id: ObjectId) -> bool {
        self.slot(id).kind.is_namespace()
    }

    /// True for function objects.
    #[must_use]
    pub fn is_function(&self, id: ObjectId) -> bool {
        self.slot(id).kind.is_function()
    }

    /// True for opaque native callables.
    #[must_use]
    pub fn is_native(&self, id: ObjectId) -> bool {
        self.slot(id).kind.is_native()
    }

    // -----------------------------------------------------------------------
    // Enumeration protocol
    // -----------------------------------------------------------------------

    /// Visit every outgoing strong edge of `id` except the type link.
    pub fn for_each_child(&self, id: ObjectId, visit: &mut dyn FnMut(ObjectId)) {
        self.slot(id).kind.for_each_child(visit);
    }

    /// Outgoing edges of `id` (excluding the type link) as a vector. Handy
    /// when the caller needs to mutate the heap while walking.
    #[must_use]
    pub fn children(&self, id: ObjectId) -> Vec<ObjectId> {
        let mut out = Vec::new();
        self.for_each_child(id, &mut |c| out.push(c));
        out
    }

    /// Iterate all live objects in allocation order. This is the heap
    /// enumerator capability consumed by the invariant checker.
    pub fn iter_live(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            s.as_ref()
                .map(|_| ObjectId::new(i as u32 + 1).expect("slot index overflow"))
        })
    }

    /// Number of live objects.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    // -----------------------------------------------------------------------
    // Raw mutators (no barrier; the region runtime wraps these)
    // -----------------------------------------------------------------------

    /// Store an attribute. Takes a strong reference on `value`; the displaced
    /// value (if any) is returned with its reference still counted.
    ///
    /// Panics if `obj` is not an instance.
    pub fn set_field_raw(
        &mut self,
        obj: ObjectId,
        name: &str,
        value: ObjectId,
    ) -> Option<ObjectId> {
        self.incref(value);
        match &mut self.slot_mut(obj).kind {
            ObjectKind::Plain { fields } => fields.insert(name.to_owned(), value),
            _ => panic!("set_field_raw on non-instance object"),
        }
    }

    /// Remove an attribute, returning the value with its reference still
    /// counted.
    pub fn remove_field_raw(&mut self, obj: ObjectId, name: &str) -> Option<ObjectId> {
        match &mut self.slot_mut(obj).kind {
            ObjectKind::Plain { fields } => fields.remove(name),
            _ => panic!("remove_field_raw on non-instance object"),
        }
    }

    /// Read an attribute.
    #[must_use]
    pub fn field(&self, obj: ObjectId, name: &str) -> Option<ObjectId> {
        match &self.slot(obj).kind {
            ObjectKind::Plain { fields } => fields.get(name).copied(),
            _ => None,
        }
    }

    /// Attribute names of an instance.
    #[must_use]
    pub fn field_names(&self, obj: ObjectId) -> Vec<String> {
        match &self.slot(obj).kind {
            ObjectKind::Plain { fields } => fields.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// Store into a closure cell. Takes a strong reference on `value`; the
    /// displaced contents are returned with their reference still counted.
    pub fn set_cell_raw(&mut self, cell: ObjectId, value: Option<ObjectId>) -> Option<ObjectId> {
        if let Some(v) = value {
            self.incref(v);
        }
        match &mut self.slot_mut(cell).kind {
            ObjectKind::Cell { contents } => std::mem::replace(contents, value),
            _ => panic!("set_cell_raw on non-cell object"),
        }
    }

    /// Current contents of a closure cell.
    #[must_use]
    pub fn cell_contents(&self, cell: ObjectId) -> Option<ObjectId> {
        match &self.slot(cell).kind {
            ObjectKind::Cell { contents } => *contents,
            _ => None,
        }
    }

    /// Bind a namespace key. Takes a strong reference on `value`; the
    /// displaced binding is returned with its reference still counted.
    ///
    /// Callers must check [`Heap::ns_key_frozen`] first; rebinding a frozen
    /// key is a host-level error.
    pub fn ns_bind_raw(&mut self, ns: ObjectId, key: &str, value: ObjectId) -> Option<ObjectId> {
        self.incref(value);
        match &mut self.slot_mut(ns).kind {
            ObjectKind::Namespace { entries, .. } => entries.insert(key.to_owned(), value),
            _ => panic!("ns_bind_raw on non-namespace object"),
        }
    }

    /// Unbind a namespace key, returning the value with its reference still
    /// counted.
    pub fn ns_unbind_raw(&mut self, ns: ObjectId, key: &str) -> Option<ObjectId> {
        match &mut self.slot_mut(ns).kind {
            ObjectKind::Namespace { entries, .. } => entries.remove(key),
            _ => panic!("ns_unbind_raw on non-namespace object"),
        }
    }

    /// Look up a namespace binding.
    #[must_use]
    pub fn ns_get(&self, ns: ObjectId, key: &str) -> Option<ObjectId> {
        match &self.slot(ns).kind {
            ObjectKind::Namespace { entries, .. } => entries.get(key).copied(),
            _ => None,
        }
    }

    /// True if the namespace binds `key`.
    #[must_use]
    pub fn ns_contains(&self, ns: ObjectId, key: &str) -> bool {
        self.ns_get(ns, key).is_some()
    }

    /// Pin a namespace key: the binding may no longer be replaced.
    pub fn ns_freeze_key(&mut self, ns: ObjectId, key: &str) {
        match &mut self.slot_mut(ns).kind {
            ObjectKind::Namespace { frozen_keys, .. } => {
                frozen_keys.insert(key.to_owned());
            }
            _ => panic!("ns_freeze_key on non-namespace object"),
        }
    }

    /// True if the key has been pinned immutable.
    #[must_use]
    pub fn ns_key_frozen(&self, ns: ObjectId, key: &str) -> bool {
        match &self.slot(ns).kind {
            ObjectKind::Namespace { frozen_keys, .. } => frozen_keys.contains(key),
            _ => false,
        }
    }

    /// All fields of an instance as `(name, value)` pairs.
    #[must_use]
    pub fn fields(&self, obj: ObjectId) -> BTreeMap<String, ObjectId> {
        match &self.slot(obj).kind {
            ObjectKind::Plain { fields } => fields.clone(),
            _ => BTreeMap::new(),
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}
