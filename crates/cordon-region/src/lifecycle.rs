//! Region open/close lifecycle and membership reconstruction.
//!
//! Closing is the handover point: only a closed region may be owned by a
//! cown or committed as a subregion. A close can fail and be retried, so
//! every failure path here leaves the region open.

use cordon_error::{RegionError, Result};
use cordon_heap::Heap;
use cordon_types::{ObjectId, RegionId};
use tracing::debug;

use crate::barrier;
use crate::cown::CownTable;
use crate::metadata::RegionTable;

/// External holders a close tolerates by default: the one embedding handle
/// that pins the bridge. Callers add one when the bridge is also a live
/// call argument.
pub const DEFAULT_PERMITTED_HOLDERS: u32 = 1;

/// Close `r`, releasing an owning cown and propagating upward.
///
/// Idempotent on a closed region. Preconditions: borrows within the
/// permitted holder count and no open subregions. A successful close
/// decrements the parent's open-subregion count and, when that count
/// reaches zero on a clean parent, attempts to close the parent too; a
/// parent that is still borrowed simply stays open.
pub(crate) fn close_region(
    regions: &mut RegionTable,
    cowns: &CownTable,
    r: RegionId,
    permitted: u32,
) -> Result<()> {
    if !regions.is_open(r) {
        return Ok(());
    }
    let bridge = regions.bridge(r).expect("open region without a bridge");
    let lrc = regions.lrc(r);
    if lrc > permitted {
        return Err(RegionError::StillBorrowed {
            bridge,
            lrc,
            permitted,
        });
    }
    let osc = regions.osc(r);
    if osc > 0 {
        return Err(RegionError::OpenSubregions { bridge, osc });
    }

    regions.set_open_flag(r, false);
    debug!(region = %r, "region closed");

    // A close hands the region back to its cown's waiters.
    if let Some(c) = regions.cown(r) {
        cowns.sync(c).release()?;
    }

    if let Some(parent) = regions.get_parent(r) {
        regions.sub_osc(parent, 1);
        if regions.osc(parent) == 0 && !regions.is_dirty(parent) {
            match close_region(regions, cowns, parent, DEFAULT_PERMITTED_HOLDERS) {
                // A still-borrowed parent stays open until closed explicitly.
                Ok(()) | Err(RegionError::StillBorrowed { .. }) => {}
                Err(err) => return Err(err),
            }
        }
    }
    Ok(())
}

/// Close with membership reconstruction: re-derive the region from the
/// bridge instead of trusting the incremental `lrc`.
///
/// Fresh metadata is allocated and the name, parent link, and cown
/// ownership move to it; the old metadata is folded into the thread-local
/// set so stale tags resolve to local and the traversal re-absorbs exactly
/// what is reachable. Borrow counts come out of live reference counts,
/// discounted per followed edge. A traversal failure marks the rebuilt
/// region and its ancestors dirty; a region still over its holder limit
/// stays open for a later retry.
pub(crate) fn try_close(
    heap: &mut Heap,
    regions: &mut RegionTable,
    cowns: &CownTable,
    budget: usize,
    bridge: ObjectId,
    r: RegionId,
    permitted: u32,
) -> Result<()> {
    if !regions.is_open(r) {
        return Ok(());
    }
    debug!(region = %r, "reconstructing region membership");

    let name = regions.take_name(r);
    let rebuilt = regions.alloc(name, bridge);

    let parent = regions.get_parent(r);
    if let Some(p) = parent {
        regions.set_parent(rebuilt, Some(p));
        regions.set_parent(r, None);
    }
    let cown = regions.cown(r);
    if let Some(c) = cown {
        regions.set_cown(rebuilt, Some(c));
        regions.inc_rc(rebuilt);
        regions.set_cown(r, None);
        regions.dec_rc(r);
    }
    regions.merge_into_local(r);

    // The parent's member edge and a cown's value reference pin the bridge
    // but are not borrows.
    let root_discount = u32::from(parent.is_some()) + u32::from(cown.is_some());
    barrier::add_to_region(heap, regions, budget, bridge, bridge, rebuilt, root_discount)?;

    close_region(regions, cowns, rebuilt, permitted)
}
