//! Open/close lifecycle, membership reconstruction, and the transitive
//! freezer, exercised through the embedding surface.

use cordon_region::{CownState, RegionError, Runtime, RuntimeConfig};

#[test]
fn close_and_reopen_round_trip() {
    let mut rt = Runtime::new();
    let bridge = rt.new_region(Some("scratch"));

    rt.close(bridge).unwrap();
    assert!(!rt.is_open(bridge).unwrap());

    rt.open(bridge).unwrap();
    assert!(rt.is_open(bridge).unwrap());

    // Reopening keeps the membership intact.
    let x = rt.alloc_object();
    rt.set_field(bridge, "x", x).unwrap();
    rt.release_handle(x);
    rt.close(bridge).unwrap();
    assert!(rt.owns_object(bridge, x).unwrap());
}

#[test]
fn reopening_a_committed_subregion_reopens_the_parent() {
    let mut rt = Runtime::new();
    let parent = rt.new_region(None);
    let child = rt.new_region(None);
    rt.set_field(parent, "c", child).unwrap();
    rt.release_handle(child);

    rt.close(child).unwrap();
    assert!(!rt.is_open(parent).unwrap());

    rt.open(child).unwrap();
    let stats = rt.region_stats(parent).unwrap();
    assert!(stats.open);
    assert_eq!(stats.osc, 1);
}

#[test]
fn traversal_budget_exhaustion_leaves_the_region_open_and_dirty() {
    let mut rt = Runtime::with_config(RuntimeConfig {
        traversal_budget: 4,
    });
    let bridge = rt.new_region(None);

    let head = rt.alloc_object();
    let mut cursor = head;
    for _ in 0..8 {
        let next = rt.alloc_object();
        rt.set_field(cursor, "next", next).unwrap();
        rt.release_handle(next);
        cursor = rt.field(cursor, "next").unwrap();
    }

    let err = rt.set_field(bridge, "head", head).unwrap_err();
    assert_eq!(err, RegionError::OutOfMemory { budget: 4 });
    let stats = rt.region_stats(bridge).unwrap();
    assert!(stats.open);
    assert!(stats.dirty);

    // Reconstruction walks the same graph and hits the same wall, so the
    // region stays open rather than closing over untrusted counters.
    let err = rt.close(bridge).unwrap_err();
    assert_eq!(err, RegionError::OutOfMemory { budget: 4 });
    assert!(rt.is_open(bridge).unwrap());
}

#[test]
fn reconstruction_recovers_a_dirty_region() {
    let mut rt = Runtime::new();
    let bridge = rt.new_region(None);
    let x = rt.alloc_object();
    rt.set_field(bridge, "x", x).unwrap();
    rt.release_handle(x);

    // A rejected store dirties the region without adding an edge.
    let globals = rt.alloc_namespace();
    let builtins = rt.alloc_namespace();
    let code = rt.alloc_code(vec![], vec![]);
    let f = rt.alloc_function(code, vec![], vec![], globals, builtins);
    let err = rt.set_field(bridge, "f", f).unwrap_err();
    assert_eq!(err, RegionError::UnsupportedFunctionCapture { obj: f });
    assert!(rt.region_stats(bridge).unwrap().dirty);

    // The dirty close re-derives membership from the live graph.
    rt.close(bridge).unwrap();
    let stats = rt.region_stats(bridge).unwrap();
    assert!(!stats.open);
    assert!(!stats.dirty);
    assert!(rt.owns_object(bridge, x).unwrap());
}

#[test]
fn freezing_a_member_routes_close_through_reconstruction() {
    let mut rt = Runtime::new();
    let bridge = rt.new_region(None);
    let x = rt.alloc_object();
    rt.set_field(bridge, "x", x).unwrap();

    // The member's inbound borrows can no longer be uncounted once its tag
    // is immutable, so the incremental count is untrusted from here on.
    rt.make_immutable(x).unwrap();
    assert!(rt.is_immutable(x));
    assert!(rt.region_stats(bridge).unwrap().dirty);

    rt.release_handle(x);
    rt.close(bridge).unwrap();
    let stats = rt.region_stats(bridge).unwrap();
    assert!(!stats.open);
    assert!(!stats.dirty);
}

#[test]
fn removal_with_interior_references_is_caught_at_close() {
    let mut rt = Runtime::new();
    let bridge = rt.new_region(None);
    let x = rt.alloc_object();
    rt.set_field(bridge, "x", x).unwrap();

    // The bridge still references x, so the removal's borrow estimate is
    // unreliable and the region is dirtied.
    rt.remove_object(bridge, x).unwrap();
    assert!(rt.region_stats(bridge).unwrap().dirty);

    // Reconstruction re-absorbs the still-reachable object and sees the
    // live external handle.
    let err = rt.close(bridge).unwrap_err();
    assert!(matches!(err, RegionError::StillBorrowed { lrc: 2, .. }));
    assert!(rt.owns_object(bridge, x).unwrap());

    rt.release_handle(x);
    rt.close(bridge).unwrap();
}

#[test]
fn freezing_a_graph_leaves_cown_handles_intact() {
    let mut rt = Runtime::new();
    let cown = rt.new_cown(None).unwrap();
    let holder = rt.alloc_object();
    rt.set_field(holder, "cell", cown).unwrap();

    rt.make_immutable(holder).unwrap();
    assert!(rt.is_immutable(holder));
    // The cown keeps its tag and stays acquirable.
    assert_eq!(rt.cown_state(cown).unwrap(), CownState::Released);
    rt.cown_acquire(cown).unwrap();
    rt.cown_release(cown).unwrap();
}

#[test]
fn freeze_handles_reference_cycles() {
    let mut rt = Runtime::new();
    let a = rt.alloc_object();
    let b = rt.alloc_object();
    rt.set_field(a, "b", b).unwrap();
    rt.set_field(b, "a", a).unwrap();

    rt.make_immutable(a).unwrap();
    assert!(rt.is_immutable(a));
    assert!(rt.is_immutable(b));
}

#[test]
fn function_freeze_pins_only_captured_globals() {
    let mut rt = Runtime::new();
    let globals = rt.alloc_namespace();
    let builtins = rt.alloc_namespace();

    let used = rt.alloc_object();
    let unused = rt.alloc_object();
    rt.ns_bind(globals, "used", used).unwrap();
    rt.ns_bind(globals, "unused", unused).unwrap();
    let print = rt.alloc_native();
    rt.ns_bind(builtins, "print", print).unwrap();

    let code = rt.alloc_code(vec!["used".to_owned(), "print".to_owned()], vec![]);
    let f = rt.alloc_function(code, vec![], vec![], globals, builtins);

    rt.make_immutable(f).unwrap();
    assert!(rt.is_immutable(f));
    assert!(rt.is_immutable(code));

    // Captured global: key pinned, value deeply frozen.
    assert!(rt.ns_key_frozen(globals, "used"));
    assert!(rt.is_immutable(used));
    // Builtin: key pinned, value frozen shallowly.
    assert!(rt.ns_key_frozen(builtins, "print"));
    assert!(rt.is_immutable(print));
    // Untouched binding stays mutable and rebindable.
    assert!(!rt.ns_key_frozen(globals, "unused"));
    assert!(!rt.is_immutable(unused));
    let fresh = rt.alloc_object();
    rt.ns_bind(globals, "unused", fresh).unwrap();

    // The namespace itself is not frozen, but pinned keys are final.
    assert!(!rt.is_immutable(globals));
    let other = rt.alloc_object();
    let err = rt.ns_bind(globals, "used", other).unwrap_err();
    assert_eq!(err, RegionError::WriteToImmutable { obj: globals });
}

#[test]
fn reflective_globals_access_pins_string_named_bindings() {
    let mut rt = Runtime::new();
    let globals = rt.alloc_namespace();
    let builtins = rt.alloc_namespace();

    let secret = rt.alloc_object();
    rt.ns_bind(globals, "secret", secret).unwrap();

    // The body never names `secret` directly, but it can reach it through
    // the reflective namespace accessor plus a string constant.
    let name_const = rt.alloc_str("secret");
    let code = rt.alloc_code(vec!["globals".to_owned()], vec![name_const]);
    let f = rt.alloc_function(code, vec![], vec![], globals, builtins);

    rt.make_immutable(f).unwrap();
    assert!(rt.ns_key_frozen(globals, "secret"));
    assert!(rt.is_immutable(secret));
}

#[test]
fn reflective_globals_access_scans_closure_cells() {
    let mut rt = Runtime::new();
    let globals = rt.alloc_namespace();
    let builtins = rt.alloc_namespace();

    let hidden = rt.alloc_object();
    rt.ns_bind(globals, "hidden", hidden).unwrap();

    let name = rt.alloc_str("hidden");
    let cell = rt.alloc_cell();
    rt.set_cell(cell, Some(name)).unwrap();

    let code = rt.alloc_code(vec!["globals".to_owned()], vec![]);
    let f = rt.alloc_function(code, vec![], vec![cell], globals, builtins);

    rt.make_immutable(f).unwrap();
    assert!(rt.ns_key_frozen(globals, "hidden"));
    assert!(rt.is_immutable(hidden));
}

#[test]
fn nested_code_objects_are_scanned_for_captures() {
    let mut rt = Runtime::new();
    let globals = rt.alloc_namespace();
    let builtins = rt.alloc_namespace();

    let inner_target = rt.alloc_object();
    rt.ns_bind(globals, "inner_target", inner_target).unwrap();

    let inner = rt.alloc_code(vec!["inner_target".to_owned()], vec![]);
    let outer = rt.alloc_code(vec![], vec![inner]);
    let f = rt.alloc_function(outer, vec![], vec![], globals, builtins);

    rt.make_immutable(f).unwrap();
    assert!(rt.is_immutable(inner));
    assert!(rt.ns_key_frozen(globals, "inner_target"));
    assert!(rt.is_immutable(inner_target));
}

#[test]
fn freezing_defaults_and_closure_values_is_deep() {
    let mut rt = Runtime::new();
    let globals = rt.alloc_namespace();
    let builtins = rt.alloc_namespace();

    let leaf = rt.alloc_object();
    let default = rt.alloc_object();
    rt.set_field(default, "leaf", leaf).unwrap();
    let cell = rt.alloc_cell();
    let captured = rt.alloc_object();
    rt.set_cell(cell, Some(captured)).unwrap();

    let code = rt.alloc_code(vec![], vec![]);
    let f = rt.alloc_function(code, vec![default], vec![cell], globals, builtins);

    rt.make_immutable(f).unwrap();
    assert!(rt.is_immutable(default));
    assert!(rt.is_immutable(leaf));
    assert!(rt.is_immutable(cell));
    assert!(rt.is_immutable(captured));
    // Namespaces stay mutable: nothing was captured.
    assert!(!rt.is_immutable(globals));
    assert!(!rt.is_immutable(builtins));
}
