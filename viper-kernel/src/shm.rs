//! Shared-memory regions (spec component C3).
//!
//! Creation, transfer, and mapping are distinct steps: handing a SHM
//! handle to another process (via a channel message) never implicitly
//! maps it there. The receiver must call `map` explicitly before touching
//! the bytes.

use std::sync::Arc;

use parking_lot::Mutex;
use viper_abi::{Handle, VError};

/// The backing bytes of a shared-memory region, reference counted so the
/// region survives an `unmap` as long as any handle (mapped or not) still
/// references it.
pub struct SharedRegion {
    bytes: Mutex<Vec<u8>>,
}

impl SharedRegion {
    pub fn create(len: usize) -> Arc<Self> {
        Arc::new(SharedRegion { bytes: Mutex::new(vec![0u8; len]) })
    }

    pub fn len(&self) -> usize {
        self.bytes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn read(&self, offset: usize, out: &mut [u8]) -> Result<(), VError> {
        let bytes = self.bytes.lock();
        let end = offset.checked_add(out.len()).ok_or(VError::InvalidArg)?;
        if end > bytes.len() {
            return Err(VError::InvalidArg);
        }
        out.copy_from_slice(&bytes[offset..end]);
        Ok(())
    }

    pub fn write(&self, offset: usize, data: &[u8]) -> Result<(), VError> {
        let mut bytes = self.bytes.lock();
        let end = offset.checked_add(data.len()).ok_or(VError::InvalidArg)?;
        if end > bytes.len() {
            return Err(VError::InvalidArg);
        }
        bytes[offset..end].copy_from_slice(data);
        Ok(())
    }
}

/// A process-local mapping of a shared region. Mapping is idempotent per
/// process but must be explicit: obtaining the handle alone grants no
/// access until `map` is called.
pub struct Mapping {
    region: Arc<SharedRegion>,
}

impl Mapping {
    pub fn region(&self) -> &Arc<SharedRegion> {
        &self.region
    }
}

pub struct SharedMemory;
pub type ShmHandle = Handle<SharedMemory>;

pub fn map(region: &Arc<SharedRegion>) -> Mapping {
    Mapping { region: region.clone() }
}
