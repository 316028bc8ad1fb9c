//! Name registry / service discovery (spec component C5).
//!
//! System-global, as the original source behaves: one table shared across
//! every process in the simulation, mirroring `samgr`'s single
//! `HostRegistry` rather than a per-process table.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use thiserror::Error;

use crate::channel::Endpoint;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AssignError {
    #[error("name already registered")]
    Duplicate,
    #[error("name not registered")]
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Generation(u64);

impl Generation {
    pub const fn first() -> Self {
        Generation(1)
    }

    pub fn next(self) -> Self {
        Generation(self.0 + 1)
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct AssignFlags(u32);

impl AssignFlags {
    pub const NONE: Self = AssignFlags(0);
    pub const SYSTEM: Self = AssignFlags(1 << 0);
    pub const DEFERRED: Self = AssignFlags(1 << 1);
    pub const MULTI: Self = AssignFlags(1 << 2);

    pub fn bits(self) -> u32 {
        self.0
    }
}

#[derive(Clone)]
struct Record {
    handle_raw: u32,
    connector: Arc<Endpoint>,
    generation: Generation,
    flags: AssignFlags,
}

/// A resolved registry entry. Holding one does not pin the registration:
/// a later `set` under the same name only affects handles obtained by a
/// *subsequent* `get`.
///
/// `handle_raw` is a diagnostic-only counter (what the wire protocol would
/// carry); `connector` is the actual channel endpoint a client uses to
/// reach the service, standing in for the real kernel's handle-transfer
/// machinery in this host simulation.
#[derive(Clone)]
pub struct AssignEntry {
    pub name: String,
    pub handle_raw: u32,
    pub connector: Arc<Endpoint>,
    pub generation: Generation,
    pub flags: AssignFlags,
}

#[derive(Default)]
struct Inner {
    records: HashMap<String, Record>,
}

pub struct AssignRegistry {
    inner: Mutex<Inner>,
}

static REGISTRY: OnceLock<AssignRegistry> = OnceLock::new();

impl AssignRegistry {
    fn new() -> Self {
        AssignRegistry { inner: Mutex::new(Inner::default()) }
    }

    /// The single system-wide registry instance.
    pub fn global() -> &'static AssignRegistry {
        REGISTRY.get_or_init(AssignRegistry::new)
    }

    pub fn set(
        &self,
        name: &str,
        handle_raw: u32,
        connector: Arc<Endpoint>,
        flags: AssignFlags,
    ) -> Result<AssignEntry, AssignError> {
        let mut inner = self.inner.lock();
        if inner.records.contains_key(name) {
            return Err(AssignError::Duplicate);
        }
        let record = Record { handle_raw, connector, generation: Generation::first(), flags };
        inner.records.insert(name.to_string(), record.clone());
        Ok(AssignEntry {
            name: name.to_string(),
            handle_raw,
            connector: record.connector,
            generation: record.generation,
            flags,
        })
    }

    pub fn get(&self, name: &str) -> Result<AssignEntry, AssignError> {
        let inner = self.inner.lock();
        let record = inner.records.get(name).ok_or(AssignError::NotFound)?;
        Ok(AssignEntry {
            name: name.to_string(),
            handle_raw: record.handle_raw,
            connector: record.connector.clone(),
            generation: record.generation,
            flags: record.flags,
        })
    }

    /// Re-registers a name, bumping its generation. Handles already handed
    /// out by earlier `get` calls remain valid for the caller that holds
    /// them — only a fresh `get` observes the new registration.
    pub fn restart(
        &self,
        name: &str,
        handle_raw: u32,
        connector: Arc<Endpoint>,
        flags: AssignFlags,
    ) -> Result<AssignEntry, AssignError> {
        let mut inner = self.inner.lock();
        let record = inner.records.get_mut(name).ok_or(AssignError::NotFound)?;
        record.generation = record.generation.next();
        record.handle_raw = handle_raw;
        record.connector = connector;
        record.flags = flags;
        Ok(AssignEntry {
            name: name.to_string(),
            handle_raw,
            connector: record.connector.clone(),
            generation: record.generation,
            flags,
        })
    }

    /// Unregisters `name`. A subsequent `get` for it fails with `NotFound`;
    /// handles already handed out by earlier `get`/`resolve` calls are
    /// unaffected, mirroring `restart`'s "only a fresh lookup observes the
    /// change" rule.
    pub fn remove(&self, name: &str) -> Result<(), AssignError> {
        let mut inner = self.inner.lock();
        inner.records.remove(name).map(|_| ()).ok_or(AssignError::NotFound)
    }

    /// Resolves a `NAME:rest/of/path` style path: looks up `NAME` in the
    /// registry and returns its entry alongside the remaining path
    /// components, left for the caller to walk against that service (e.g.
    /// fsd) relative to its own root. A path with no `:` is treated as a
    /// bare name with an empty remainder.
    pub fn resolve(&self, path: &str) -> Result<(AssignEntry, String), AssignError> {
        let (name, rest) = match path.split_once(':') {
            Some((name, rest)) => (name, rest.to_string()),
            None => (path, String::new()),
        };
        let entry = self.get(name)?;
        Ok((entry, rest))
    }

    pub fn list(&self) -> Vec<AssignEntry> {
        let inner = self.inner.lock();
        inner
            .records
            .iter()
            .map(|(name, r)| AssignEntry {
                name: name.clone(),
                handle_raw: r.handle_raw,
                connector: r.connector.clone(),
                generation: r.generation,
                flags: r.flags,
            })
            .collect()
    }

    #[cfg(test)]
    fn new_for_test() -> Self {
        AssignRegistry::new()
    }
}
