//! Shared vocabulary for the Cordon region runtime.
//!
//! Handles are 1-based `NonZeroU32` newtypes so that `Option<Id>` stays one
//! word and slot 0 can never be forged. The per-object ownership tag is the
//! closed [`RegionPointer`] enum; there is no pointer bit packing anywhere.

use std::fmt;
use std::num::NonZeroU32;

/// Handle to an object in the host heap.
///
/// Object ids are allocation handles, not addresses: the heap may reuse a
/// slot after the object's reference count reaches zero.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct ObjectId(NonZeroU32);

impl ObjectId {
    /// Create an object id from a raw 1-based slot number.
    ///
    /// Returns `None` for 0 (slot numbers start at 1).
    #[inline]
    pub const fn new(n: u32) -> Option<Self> {
        match NonZeroU32::new(n) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Get the raw 1-based slot number.
    #[inline]
    pub const fn get(self) -> u32 {
        self.0.get()
    }

    /// Zero-based index into the backing slab.
    #[inline]
    pub const fn index(self) -> usize {
        self.0.get() as usize - 1
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj#{}", self.0)
    }
}

/// Handle to a region metadata record.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct RegionId(NonZeroU32);

impl RegionId {
    /// Create a region id from a raw 1-based slot number.
    #[inline]
    pub const fn new(n: u32) -> Option<Self> {
        match NonZeroU32::new(n) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Get the raw 1-based slot number.
    #[inline]
    pub const fn get(self) -> u32 {
        self.0.get()
    }

    /// Zero-based index into the region table.
    #[inline]
    pub const fn index(self) -> usize {
        self.0.get() as usize - 1
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "region#{}", self.0)
    }
}

/// Handle to a concurrent owner cell.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct CownId(NonZeroU32);

impl CownId {
    /// Create a cown id from a raw 1-based slot number.
    #[inline]
    pub const fn new(n: u32) -> Option<Self> {
        match NonZeroU32::new(n) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Get the raw 1-based slot number.
    #[inline]
    pub const fn get(self) -> u32 {
        self.0.get()
    }

    /// Zero-based index into the cown table.
    #[inline]
    pub const fn index(self) -> usize {
        self.0.get() as usize - 1
    }
}

impl fmt::Display for CownId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cown#{}", self.0)
    }
}

/// Per-object ownership tag.
///
/// Every heap object carries exactly one of these. `Local` objects are
/// thread-confined and freely mutable; `Immutable` objects are shared and
/// deeply frozen; `Cown` objects are the cell handles themselves; `Region`
/// objects belong to the identified region and are reachable from outside it
/// only through the region's bridge object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum RegionPointer {
    /// Unowned, thread-confined, freely mutable.
    Local,
    /// Shared-immutable; the freezer's terminal state.
    Immutable,
    /// The object is a concurrent owner cell.
    Cown(CownId),
    /// Member of the identified region.
    Region(RegionId),
}

impl RegionPointer {
    /// True for the `Local` tag.
    #[inline]
    #[must_use]
    pub const fn is_local(self) -> bool {
        matches!(self, Self::Local)
    }

    /// True for the `Immutable` tag.
    #[inline]
    #[must_use]
    pub const fn is_immutable(self) -> bool {
        matches!(self, Self::Immutable)
    }

    /// True for targets the barrier never restricts (immutable data and
    /// cown handles).
    #[inline]
    #[must_use]
    pub const fn is_unrestricted_target(self) -> bool {
        matches!(self, Self::Immutable | Self::Cown(_))
    }

    /// The region id, if this tag names a region.
    #[inline]
    #[must_use]
    pub const fn as_region(self) -> Option<RegionId> {
        match self {
            Self::Region(r) => Some(r),
            _ => None,
        }
    }
}

impl fmt::Display for RegionPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Immutable => f.write_str("immutable"),
            Self::Cown(c) => write!(f, "{c}"),
            Self::Region(r) => write!(f, "{r}"),
        }
    }
}

/// Cown acquisition state, stored as one atomic byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum CownState {
    /// No thread holds the cell; `acquire` succeeds immediately.
    Released = 0,
    /// Exactly one thread holds the cell.
    Acquired = 1,
    /// Construction-time parking: the cell holds an open region's bridge and
    /// releases itself when that region closes.
    PendingRelease = 2,
}

impl CownState {
    /// Decode the atomic byte written by [`CownState::as_u8`].
    #[inline]
    #[must_use]
    pub const fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Released),
            1 => Some(Self::Acquired),
            2 => Some(Self::PendingRelease),
            _ => None,
        }
    }

    /// Encode for atomic storage.
    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for CownState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Released => f.write_str("released"),
            Self::Acquired => f.write_str("acquired"),
            Self::PendingRelease => f.write_str("pending-release"),
        }
    }
}
