//! The tagged union of things a capability table slot can reference.

use std::sync::Arc;

use crate::channel::Endpoint;
use crate::pollset::PollSet;
use crate::shm::SharedRegion;

#[derive(Clone)]
pub enum KernelObject {
    Channel(Arc<Endpoint>),
    Shm(Arc<SharedRegion>),
    PollSet(Arc<PollSet>),
    /// Placeholder for object kinds this workspace does not model in
    /// detail (e.g. a raw task handle), kept so capability-table tests do
    /// not need a full kernel object to exercise generation/rights logic.
    Opaque(Arc<dyn std::any::Any + Send + Sync>),
}

impl KernelObject {
    pub fn as_channel(&self) -> Option<&Arc<Endpoint>> {
        match self {
            KernelObject::Channel(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_shm(&self) -> Option<&Arc<SharedRegion>> {
        match self {
            KernelObject::Shm(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_pollset(&self) -> Option<&Arc<PollSet>> {
        match self {
            KernelObject::PollSet(p) => Some(p),
            _ => None,
        }
    }
}
