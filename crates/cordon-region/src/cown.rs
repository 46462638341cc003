//! Concurrent owner cells.
//!
//! A cown is the only cross-thread boundary in the subsystem. Its
//! acquisition state is one atomic byte driven by compare-and-swap, with a
//! counting semaphore to park contending acquirers and the owning thread's
//! identity checked on every release. Everything else about a cown (its
//! stored value, its link to an owned region) mutates under the embedding's
//! exclusion domain like the rest of the topology.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use cordon_error::{RegionError, Result};
use cordon_types::{CownId, CownState, ObjectId};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

/// Counting semaphore. `release` wakes exactly one waiter; permits posted
/// with nobody waiting are kept for the next acquirer.
struct Semaphore {
    permits: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    const fn new() -> Self {
        Self {
            permits: Mutex::new(0),
            available: Condvar::new(),
        }
    }

    fn wait(&self) {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.available.wait(&mut permits);
        }
        *permits -= 1;
    }

    fn post(&self) {
        *self.permits.lock() += 1;
        self.available.notify_one();
    }
}

/// The thread-safe half of a cown: state word, owner identity, and the
/// semaphore. Shared via `Arc` so other threads can block on `acquire`
/// without holding the embedding's runtime lock.
pub struct CownSync {
    /// Heap handle of the cown object, for diagnostics.
    handle: ObjectId,
    state: AtomicU8,
    owner: Mutex<Option<ThreadId>>,
    semaphore: Semaphore,
}

impl CownSync {
    pub(crate) fn new(handle: ObjectId) -> Self {
        Self {
            handle,
            state: AtomicU8::new(CownState::Released.as_u8()),
            owner: Mutex::new(None),
            semaphore: Semaphore::new(),
        }
    }

    /// Current acquisition state.
    #[must_use]
    pub fn state(&self) -> CownState {
        CownState::from_u8(self.state.load(Ordering::Acquire)).expect("corrupt cown state byte")
    }

    /// Heap handle of the cown object this state belongs to.
    #[must_use]
    pub const fn handle(&self) -> ObjectId {
        self.handle
    }

    /// Block until the cown is held by the calling thread.
    ///
    /// Spins a compare-and-swap from released to acquired; each failed
    /// attempt parks on the semaphore until a release posts.
    pub fn acquire(&self) {
        loop {
            if self
                .state
                .compare_exchange(
                    CownState::Released.as_u8(),
                    CownState::Acquired.as_u8(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                *self.owner.lock() = Some(thread::current().id());
                trace!(cown = %self.handle, "acquired");
                return;
            }
            self.semaphore.wait();
        }
    }

    /// Release the cown and wake one waiter.
    ///
    /// Releasing an unheld, ownerless cown is a no-op. A released cown that
    /// still records an owner, or a release from a thread that does not own
    /// the cown, is a lock discipline violation.
    pub fn release(&self) -> Result<()> {
        if self.state() == CownState::Released {
            if self.owner.lock().is_some() {
                return Err(RegionError::lock_discipline(
                    self.handle,
                    "released cown still records an owning thread",
                ));
            }
            return Ok(());
        }
        {
            let mut owner = self.owner.lock();
            if *owner != Some(thread::current().id()) {
                return Err(RegionError::lock_discipline(
                    self.handle,
                    "release from a thread that does not own the cown",
                ));
            }
            *owner = None;
        }
        self.state
            .store(CownState::Released.as_u8(), Ordering::Release);
        self.semaphore.post();
        trace!(cown = %self.handle, "released");
        Ok(())
    }

    /// Park the cown until its stored region closes. The storing thread is
    /// recorded as owner so the eventual close can release on its behalf.
    pub(crate) fn park_pending_release(&self) {
        *self.owner.lock() = Some(thread::current().id());
        self.state
            .store(CownState::PendingRelease.as_u8(), Ordering::Release);
        debug!(cown = %self.handle, "parked until region closes");
    }

    /// True while the calling thread holds the cown.
    #[must_use]
    pub fn is_held_by_current(&self) -> bool {
        self.state() == CownState::Acquired && *self.owner.lock() == Some(thread::current().id())
    }

    pub(crate) fn require_held(&self) -> Result<()> {
        if self.is_held_by_current() {
            Ok(())
        } else {
            Err(RegionError::lock_discipline(
                self.handle,
                "cown is not acquired by the calling thread",
            ))
        }
    }
}

pub(crate) struct CownEntry {
    pub(crate) sync: Arc<CownSync>,
    /// Stored value: a bridge object, another cown, or an immutable object.
    /// The entry holds one strong reference to it.
    pub(crate) value: Option<ObjectId>,
}

/// Arena of cown records, indexed by [`CownId`]. Slots are reclaimed when
/// the cown's heap object is torn down.
#[derive(Default)]
pub(crate) struct CownTable {
    slots: Vec<Option<CownEntry>>,
    free_list: Vec<u32>,
}

impl CownTable {
    pub(crate) fn alloc(&mut self, handle: ObjectId) -> CownId {
        let entry = CownEntry {
            sync: Arc::new(CownSync::new(handle)),
            value: None,
        };
        if let Some(idx) = self.free_list.pop() {
            self.slots[idx as usize] = Some(entry);
            CownId::new(idx + 1).expect("cown index overflow")
        } else {
            self.slots.push(Some(entry));
            let n = u32::try_from(self.slots.len()).expect("cown table exceeded u32 slots");
            CownId::new(n).expect("cown index overflow")
        }
    }

    fn entry(&self, id: CownId) -> &CownEntry {
        self.slots[id.index()].as_ref().expect("dangling cown id")
    }

    fn entry_mut(&mut self, id: CownId) -> &mut CownEntry {
        self.slots[id.index()].as_mut().expect("dangling cown id")
    }

    pub(crate) fn sync(&self, id: CownId) -> &Arc<CownSync> {
        &self.entry(id).sync
    }

    pub(crate) fn value(&self, id: CownId) -> Option<ObjectId> {
        self.entry(id).value
    }

    /// Swap the stored value, returning the displaced one with its reference
    /// still counted.
    pub(crate) fn set_value(&mut self, id: CownId, value: Option<ObjectId>) -> Option<ObjectId> {
        std::mem::replace(&mut self.entry_mut(id).value, value)
    }

    /// Drop the record for a torn-down cown object, returning the stored
    /// value so the caller can release its reference.
    pub(crate) fn remove(&mut self, id: CownId) -> Option<ObjectId> {
        let entry = self.slots[id.index()].take().expect("dangling cown id");
        self.free_list.push(id.index() as u32);
        entry.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(n: u32) -> ObjectId {
        ObjectId::new(n).unwrap()
    }

    #[test]
    fn acquire_records_owner() {
        let sync = CownSync::new(obj(1));
        assert_eq!(sync.state(), CownState::Released);
        sync.acquire();
        assert_eq!(sync.state(), CownState::Acquired);
        assert!(sync.is_held_by_current());
        sync.release().unwrap();
        assert_eq!(sync.state(), CownState::Released);
        assert!(!sync.is_held_by_current());
    }

    #[test]
    fn release_of_unheld_cown_is_noop() {
        let sync = CownSync::new(obj(1));
        sync.release().unwrap();
        assert_eq!(sync.state(), CownState::Released);
    }

    #[test]
    fn release_from_other_thread_is_rejected() {
        let sync = Arc::new(CownSync::new(obj(1)));
        sync.acquire();
        let remote = Arc::clone(&sync);
        let err = std::thread::spawn(move || remote.release().unwrap_err())
            .join()
            .unwrap();
        assert!(matches!(err, RegionError::LockDiscipline { .. }));
        sync.release().unwrap();
    }

    #[test]
    fn pending_release_is_released_by_owner() {
        let sync = CownSync::new(obj(1));
        sync.park_pending_release();
        assert_eq!(sync.state(), CownState::PendingRelease);
        // The parking thread owns the cown and may release it.
        sync.release().unwrap();
        assert_eq!(sync.state(), CownState::Released);
    }

    #[test]
    fn contended_acquire_blocks_until_release() {
        let sync = Arc::new(CownSync::new(obj(1)));
        sync.acquire();

        let remote = Arc::clone(&sync);
        let waiter = std::thread::spawn(move || {
            remote.acquire();
            remote.release().unwrap();
        });

        // Give the waiter a moment to park, then hand over.
        std::thread::sleep(std::time::Duration::from_millis(20));
        sync.release().unwrap();
        waiter.join().unwrap();
        assert_eq!(sync.state(), CownState::Released);
    }

    #[test]
    fn table_reuses_slots() {
        let mut table = CownTable::default();
        let a = table.alloc(obj(1));
        assert_eq!(table.value(a), None);
        table.set_value(a, Some(obj(2)));
        assert_eq!(table.remove(a), Some(obj(2)));
        let b = table.alloc(obj(3));
        assert_eq!(a, b);
    }
}
