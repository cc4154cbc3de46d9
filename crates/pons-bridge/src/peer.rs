//! Peer-handle registries: one slot table per exporting side.

use std::any::Any;
use std::sync::{Arc, Mutex};

use once_cell::sync::OnceCell;

use pons_contracts::{TRAP_NIL_RESOLVE, TRAP_OVER_RELEASE, TRAP_STALE_HANDLE};

use crate::error::BridgeError;

/// An object pinned for the far runtime, type-erased.
pub type PeerObject = Arc<dyn Any + Send + Sync>;

/// Which runtime owns a registry or entry table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Host,
    Guest,
}

impl Side {
    pub fn other(self) -> Side {
        match self {
            Side::Host => Side::Guest,
            Side::Guest => Side::Host,
        }
    }

    /// The table holding objects exported by this side.
    pub fn exports(self) -> &'static PeerTable {
        match self {
            Side::Host => host_exports(),
            Side::Guest => guest_exports(),
        }
    }
}

/// Opaque reference to a pinned peer object.
///
/// Layout: low 32 bits are the slot index plus one, high 32 bits are the
/// slot generation at export time. Zero is the nil sentinel and never names
/// a live object; generations make handles from a recycled slot detectably
/// stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerHandle(u64);

pub const NIL_HANDLE: PeerHandle = PeerHandle(0);

impl PeerHandle {
    pub fn from_raw(raw: u64) -> PeerHandle {
        PeerHandle(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn is_nil(self) -> bool {
        self.0 == 0
    }

    fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    fn index(self) -> Option<usize> {
        let low = (self.0 & 0xffff_ffff) as u32;
        if low == 0 {
            None
        } else {
            Some(low as usize - 1)
        }
    }

    fn from_parts(generation: u32, index: usize) -> PeerHandle {
        PeerHandle(((generation as u64) << 32) | (index as u64 + 1))
    }
}

struct Slot {
    object: Option<PeerObject>,
    count: u64,
    generation: u32,
}

/// Slot table mapping live handles to pinned objects with retain counts.
///
/// Export inserts at count 1 in one critical section, so a handle can never
/// be observed before its first retain. Vacated slots keep their bumped
/// generation and are reused by later exports.
pub struct PeerTable {
    slots: Mutex<Vec<Slot>>,
}

impl PeerTable {
    pub fn new() -> PeerTable {
        PeerTable {
            slots: Mutex::new(Vec::new()),
        }
    }

    /// Pins `object` and returns an owning handle with retain count 1.
    pub fn export(&self, object: PeerObject) -> PeerHandle {
        let mut slots = lock(&self.slots);
        for (idx, slot) in slots.iter_mut().enumerate() {
            if slot.object.is_none() {
                slot.object = Some(object);
                slot.count = 1;
                return PeerHandle::from_parts(slot.generation, idx);
            }
        }
        slots.push(Slot {
            object: Some(object),
            count: 1,
            generation: 0,
        });
        PeerHandle::from_parts(0, slots.len() - 1)
    }

    /// Pins `object` for the duration of one call; the guard releases it.
    pub fn export_borrowed(&self, object: PeerObject) -> BorrowedHandle<'_> {
        BorrowedHandle {
            table: self,
            handle: self.export(object),
        }
    }

    /// Increments the retain count and returns the same handle. Nil is a
    /// no-op so generated retain/release pairs can pass absent optionals
    /// through unchanged.
    pub fn retain(&self, handle: PeerHandle) -> PeerHandle {
        if handle.is_nil() {
            return handle;
        }
        let mut slots = lock(&self.slots);
        match live_slot(&mut slots, handle) {
            Some(slot) => slot.count += 1,
            None => {
                if cfg!(debug_assertions) {
                    panic!(
                        "pons trap {TRAP_STALE_HANDLE}: retain of stale peer handle {:#x}",
                        handle.raw()
                    );
                }
            }
        }
        handle
    }

    /// Decrements the retain count; the object is unpinned when it reaches
    /// zero. Releasing nil or an already-released handle is fatal in debug
    /// builds; release builds tolerate nil and report detectable stale
    /// releases as protocol violations.
    pub fn release(&self, handle: PeerHandle) -> Result<(), BridgeError> {
        if handle.is_nil() {
            if cfg!(debug_assertions) {
                panic!("pons trap {TRAP_OVER_RELEASE}: release of nil peer handle");
            }
            return Ok(());
        }
        let victim;
        {
            let mut slots = lock(&self.slots);
            let Some(slot) = live_slot(&mut slots, handle) else {
                if cfg!(debug_assertions) {
                    panic!(
                        "pons trap {TRAP_OVER_RELEASE}: release of stale peer handle {:#x}",
                        handle.raw()
                    );
                }
                return Err(BridgeError::ProtocolViolation {
                    what: format!("release of stale peer handle {:#x}", handle.raw()),
                });
            };
            slot.count -= 1;
            if slot.count > 0 {
                return Ok(());
            }
            slot.generation = slot.generation.wrapping_add(1);
            victim = slot.object.take();
        }
        // Dropped after unlocking: the object may itself hold foreign
        // handles whose release re-enters a peer table.
        drop(victim);
        Ok(())
    }

    /// Dereferences a live handle. Nil aborts in every build; a stale handle
    /// aborts in debug builds and reports a protocol violation otherwise.
    pub fn resolve(&self, handle: PeerHandle) -> Result<PeerObject, BridgeError> {
        if handle.is_nil() {
            panic!("pons trap {TRAP_NIL_RESOLVE}: resolve of nil peer handle");
        }
        let slots = lock(&self.slots);
        let found = handle
            .index()
            .and_then(|idx| slots.get(idx))
            .and_then(|slot| {
                if slot.generation == handle.generation() {
                    slot.object.clone()
                } else {
                    None
                }
            });
        match found {
            Some(object) => Ok(object),
            None => {
                if cfg!(debug_assertions) {
                    panic!(
                        "pons trap {TRAP_STALE_HANDLE}: resolve of stale peer handle {:#x}",
                        handle.raw()
                    );
                }
                Err(BridgeError::ProtocolViolation {
                    what: format!("resolve of stale peer handle {:#x}", handle.raw()),
                })
            }
        }
    }

    /// Current retain count of a live handle, `None` for nil or stale ones.
    pub fn retain_count(&self, handle: PeerHandle) -> Option<u64> {
        if handle.is_nil() {
            return None;
        }
        let slots = lock(&self.slots);
        let idx = handle.index()?;
        let slot = slots.get(idx)?;
        if slot.generation == handle.generation() && slot.object.is_some() {
            Some(slot.count)
        } else {
            None
        }
    }

    /// Number of currently pinned objects.
    pub fn live_count(&self) -> usize {
        lock(&self.slots).iter().filter(|s| s.object.is_some()).count()
    }
}

impl Default for PeerTable {
    fn default() -> Self {
        Self::new()
    }
}

fn lock(slots: &Mutex<Vec<Slot>>) -> std::sync::MutexGuard<'_, Vec<Slot>> {
    // Every critical section leaves the table consistent, so a poisoned
    // lock still guards valid state.
    slots.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn live_slot<'s>(slots: &'s mut [Slot], handle: PeerHandle) -> Option<&'s mut Slot> {
    let idx = handle.index()?;
    let slot = slots.get_mut(idx)?;
    if slot.generation == handle.generation() && slot.object.is_some() {
        Some(slot)
    } else {
        None
    }
}

/// Releases its borrowing export when dropped.
pub struct BorrowedHandle<'a> {
    table: &'a PeerTable,
    handle: PeerHandle,
}

impl BorrowedHandle<'_> {
    pub fn handle(&self) -> PeerHandle {
        self.handle
    }
}

impl Drop for BorrowedHandle<'_> {
    fn drop(&mut self) {
        let _ = self.table.release(self.handle);
    }
}

static HOST_EXPORTS: OnceCell<PeerTable> = OnceCell::new();
static GUEST_EXPORTS: OnceCell<PeerTable> = OnceCell::new();

/// Registry of objects the native host has exported to the guest.
pub fn host_exports() -> &'static PeerTable {
    HOST_EXPORTS.get_or_init(PeerTable::new)
}

/// Registry of objects the managed guest has exported to the host.
pub fn guest_exports() -> &'static PeerTable {
    GUEST_EXPORTS.get_or_init(PeerTable::new)
}
