//! Per-process capability table (spec component C1).
//!
//! Handles returned to callers pack a slot index in the low 24 bits and a
//! generation counter in the high 8 bits. Closing a slot bumps its
//! generation before the index is recycled, so a raw handle value minted
//! before a close can never alias the object that later reuses the same
//! slot index — it is rejected as stale instead.

use std::sync::Arc;

use viper_abi::{Handle, Rights, VError};
use viper_sync::SpinLock;

use crate::object::KernelObject;

const INDEX_BITS: u32 = 24;
const INDEX_MASK: u32 = (1 << INDEX_BITS) - 1;

fn pack(generation: u8, index: usize) -> u32 {
    ((generation as u32) << INDEX_BITS) | (index as u32 & INDEX_MASK)
}

fn unpack(raw: u32) -> (u8, usize) {
    ((raw >> INDEX_BITS) as u8, (raw & INDEX_MASK) as usize)
}

#[derive(Clone)]
pub struct CapEntry {
    pub rights: Rights,
    pub object: KernelObject,
}

struct Slot {
    generation: u8,
    entry: Option<CapEntry>,
}

/// A single process's capability table.
pub struct CapTable {
    inner: SpinLock<CapTableInner>,
}

struct CapTableInner {
    slots: Vec<Slot>,
    free: Vec<usize>,
}

impl Default for CapTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CapTable {
    pub fn new() -> Self {
        CapTable { inner: SpinLock::new(CapTableInner { slots: Vec::new(), free: Vec::new() }) }
    }

    /// Installs a new object, returning a fresh typed handle for it.
    pub fn insert<Kind>(&self, rights: Rights, object: KernelObject) -> Handle<Kind> {
        let mut inner = self.inner.lock();
        let entry = CapEntry { rights, object };
        if let Some(index) = inner.free.pop() {
            let generation = inner.slots[index].generation;
            inner.slots[index].entry = Some(entry);
            Handle::from_raw(pack(generation, index))
        } else {
            let index = inner.slots.len();
            inner.slots.push(Slot { generation: 0, entry: Some(entry) });
            Handle::from_raw(pack(0, index))
        }
    }

    /// Looks up a handle, returning its entry if the handle is live.
    /// A stale generation (the slot was revoked and possibly reused) is
    /// reported the same as an unknown index — `InvalidHandle` — per the
    /// generation-monotonicity contract: a caller never learns whether a
    /// stale handle is "closed" versus "never existed".
    pub fn query<Kind>(&self, handle: Handle<Kind>) -> Result<CapEntry, VError> {
        let (generation, index) = unpack(handle.raw());
        let inner = self.inner.lock();
        let slot = inner.slots.get(index).ok_or(VError::InvalidHandle)?;
        if slot.generation != generation {
            return Err(VError::InvalidHandle);
        }
        slot.entry.clone().ok_or(VError::InvalidHandle)
    }

    /// Closes a handle, invalidating it and any copies sharing its raw
    /// value. The underlying object is dropped once its last `Arc` goes
    /// away.
    pub fn close<Kind>(&self, handle: Handle<Kind>) -> Result<(), VError> {
        let (generation, index) = unpack(handle.raw());
        let mut inner = self.inner.lock();
        let slot = inner.slots.get_mut(index).ok_or(VError::InvalidHandle)?;
        if slot.generation != generation || slot.entry.is_none() {
            return Err(VError::InvalidHandle);
        }
        slot.entry = None;
        slot.generation = slot.generation.wrapping_add(1);
        inner.free.push(index);
        Ok(())
    }

    /// Derives a new handle from an existing one with a narrower (never
    /// wider) rights set, referencing the same underlying object.
    pub fn derive<Kind>(
        &self,
        handle: Handle<Kind>,
        requested: Rights,
    ) -> Result<Handle<Kind>, VError> {
        let entry = self.query(handle)?;
        if !requested.derivable_from(entry.rights) {
            return Err(VError::Permission);
        }
        Ok(self.insert(requested, entry.object))
    }

    /// Lists live handles, for diagnostics and tests.
    pub fn list(&self) -> Vec<u32> {
        let inner = self.inner.lock();
        inner
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.entry.is_some())
            .map(|(i, s)| pack(s.generation, i))
            .collect()
    }
}

pub type SharedCapTable = Arc<CapTable>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::KernelObject;

    struct Marker;

    fn dummy_object() -> KernelObject {
        KernelObject::Opaque(Arc::new(0u8))
    }

    #[test]
    fn stale_handle_after_close_is_rejected() {
        let table = CapTable::new();
        let h: Handle<Marker> = table.insert(Rights::SEND, dummy_object());
        table.close(h).unwrap();
        assert_eq!(table.query(h).unwrap_err(), VError::InvalidHandle);
    }

    #[test]
    fn reused_slot_gets_new_generation() {
        let table = CapTable::new();
        let h1: Handle<Marker> = table.insert(Rights::SEND, dummy_object());
        table.close(h1).unwrap();
        let h2: Handle<Marker> = table.insert(Rights::SEND, dummy_object());
        assert_ne!(h1.raw(), h2.raw());
        assert_eq!(table.query(h1).unwrap_err(), VError::InvalidHandle);
        assert!(table.query(h2).is_ok());
    }

    #[test]
    fn derive_only_narrows_rights() {
        let table = CapTable::new();
        let h: Handle<Marker> = table.insert(Rights::SEND | Rights::RECV, dummy_object());
        let narrowed = table.derive(h, Rights::SEND).unwrap();
        assert!(table.query(narrowed).is_ok());
        let widened = table.derive(h, Rights::SEND | Rights::MANAGE);
        assert_eq!(widened.unwrap_err(), VError::Permission);
    }

    #[test]
    fn invalid_index_is_rejected() {
        let table = CapTable::new();
        let bogus: Handle<Marker> = Handle::from_raw(0x00FF_FFFF);
        assert_eq!(table.query(bogus).unwrap_err(), VError::InvalidHandle);
    }
}
