//! Object kinds and the built-in type objects.
//!
//! The heap models just enough of a dynamic object runtime for the region
//! subsystem to be exercised faithfully: attribute-carrying instances, type
//! objects, strings, closure cells, functions with code objects and
//! namespaces, and opaque native callables that carry no traversable state.

use std::collections::{BTreeMap, BTreeSet};

use cordon_types::ObjectId;

/// The payload of a heap object.
///
/// Edges to other objects live here; the object's type link is stored
/// separately on the slot because type edges are not part of the ordinary
/// enumeration protocol.
#[derive(Debug, Clone)]
pub enum ObjectKind {
    /// An ordinary instance with named attributes.
    Plain {
        /// Attribute map. Ordered so enumeration is deterministic.
        fields: BTreeMap<String, ObjectId>,
    },
    /// A type object.
    Type {
        /// Diagnostic type name.
        name: String,
    },
    /// An interned-style string.
    Str(String),
    /// A closure cell holding at most one value.
    Cell {
        /// Current cell contents.
        contents: Option<ObjectId>,
    },
    /// A function: code plus captured environment.
    Function {
        /// The function's code object.
        code: ObjectId,
        /// Default argument values.
        defaults: Vec<ObjectId>,
        /// Closure cells, in capture order.
        closure: Vec<ObjectId>,
        /// The module namespace the function resolves globals in.
        globals: ObjectId,
        /// The builtin namespace.
        builtins: ObjectId,
    },
    /// A code object: the symbol and constant tables the freezer scans.
    Code {
        /// Names referenced by the code (globals, builtins, attributes).
        names: Vec<String>,
        /// Constants, including nested code objects.
        consts: Vec<ObjectId>,
    },
    /// A string-keyed namespace (module globals, builtins).
    Namespace {
        /// Bindings.
        entries: BTreeMap<String, ObjectId>,
        /// Keys pinned immutable; rebinding them is rejected.
        frozen_keys: BTreeSet<String>,
    },
    /// An opaque native callable. Carries no mutable region-relevant state;
    /// traversals freeze it in place instead of walking it.
    Native,
}

impl ObjectKind {
    /// New empty instance payload.
    #[must_use]
    pub fn plain() -> Self {
        Self::Plain {
            fields: BTreeMap::new(),
        }
    }

    /// New empty namespace payload.
    #[must_use]
    pub fn namespace() -> Self {
        Self::Namespace {
            entries: BTreeMap::new(),
            frozen_keys: BTreeSet::new(),
        }
    }

    /// True for attribute-carrying instances.
    #[must_use]
    pub const fn is_instance(&self) -> bool {
        matches!(self, Self::Plain { .. })
    }

    /// True for closure cells.
    #[must_use]
    pub const fn is_cell(&self) -> bool {
        matches!(self, Self::Cell { .. })
    }

    /// True for namespaces.
    #[must_use]
    pub const fn is_namespace(&self) -> bool {
        matches!(self, Self::Namespace { .. })
    }

    /// True for function objects.
    #[must_use]
    pub const fn is_function(&self) -> bool {
        matches!(self, Self::Function { .. })
    }

    /// True for opaque native callables.
    #[must_use]
    pub const fn is_native(&self) -> bool {
        matches!(self, Self::Native)
    }

    /// Invoke `visit` for every outgoing strong edge of this payload.
    ///
    /// Type links are not included; callers that need them read the slot's
    /// type separately.
    pub fn for_each_child(&self, visit: &mut dyn FnMut(ObjectId)) {
        match self {
            Self::Plain { fields } => {
                for &v in fields.values() {
                    visit(v);
                }
            }
            Self::Type { .. } | Self::Str(_) | Self::Native => {}
            Self::Cell { contents } => {
                if let Some(v) = contents {
                    visit(*v);
                }
            }
            Self::Function {
                code,
                defaults,
                closure,
                globals,
                builtins,
            } => {
                visit(*code);
                for &v in defaults {
                    visit(v);
                }
                for &v in closure {
                    visit(v);
                }
                visit(*globals);
                visit(*builtins);
            }
            Self::Code { consts, .. } => {
                for &v in consts {
                    visit(v);
                }
            }
            Self::Namespace { entries, .. } => {
                for &v in entries.values() {
                    visit(v);
                }
            }
        }
    }
}

/// Handles to the built-in type objects created when the heap is
/// bootstrapped. The type of `type` is itself.
#[derive(Debug, Clone, Copy)]
pub struct CoreTypes {
    /// The metatype.
    pub type_type: ObjectId,
    /// Type of instances created with [`crate::Heap::alloc_plain`] unless a
    /// custom type is supplied.
    pub object_type: ObjectId,
    /// Type of strings.
    pub str_type: ObjectId,
    /// Type of closure cells.
    pub cell_type: ObjectId,
    /// Type of functions.
    pub function_type: ObjectId,
    /// Type of code objects.
    pub code_type: ObjectId,
    /// Type of namespaces.
    pub namespace_type: ObjectId,
    /// Type of opaque native callables.
    pub native_type: ObjectId,
}
