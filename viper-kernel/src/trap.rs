//! Syscall dispatcher (spec component C6): one typed free function per
//! syscall, each returning `Result<T, VError>`. This is the only module
//! that would need architecture-specific trap-entry assembly in a
//! bare-metal build; everything above it is ordinary Rust.

use std::sync::Arc;

use viper_abi::{Rights, VError};

use crate::assign::{AssignEntry, AssignError, AssignFlags, AssignRegistry};
use crate::channel::{self, ChannelHandle, Endpoint, Message};
use crate::object::KernelObject;
use crate::pollset::{PollMask, PollSet, PollSetHandle};
use crate::process::Process;
use crate::shm::{self, ShmHandle, SharedRegion};

impl From<AssignError> for VError {
    fn from(err: AssignError) -> Self {
        match err {
            AssignError::Duplicate => VError::AlreadyExists,
            AssignError::NotFound => VError::NotFound,
        }
    }
}

pub fn yield_() {
    std::thread::yield_now();
}

/// Creates a connected channel pair and installs both endpoints in
/// `proc`'s capability table.
pub fn channel_create(proc: &Process, depth: usize) -> (ChannelHandle, ChannelHandle) {
    let (a, b) = channel::pair(depth);
    let ha = proc.caps.insert(Rights::SEND | Rights::RECV, channel::wrap(a));
    let hb = proc.caps.insert(Rights::SEND | Rights::RECV, channel::wrap(b));
    (ha, hb)
}

fn resolve_channel(proc: &Process, handle: ChannelHandle) -> Result<Arc<Endpoint>, VError> {
    let entry = proc.caps.query(handle)?;
    entry.object.as_channel().cloned().ok_or(VError::WrongType)
}

/// Sends `payload` on `handle`, transferring the capabilities named by
/// `handles` (raw values in `proc`'s own table) along with it.
///
/// Transfer is atomic: the handles are resolved from `proc`'s table up
/// front but not closed there until the underlying `endpoint.send`
/// actually succeeds. A failing send (channel full, channel closed,
/// oversized message) leaves `proc`'s capability table completely
/// unchanged — nothing is moved on failure, and on success every listed
/// handle is moved exactly once.
pub fn channel_send(
    proc: &Process,
    handle: ChannelHandle,
    payload: Vec<u8>,
    handles: Vec<u32>,
) -> Result<(), VError> {
    let entry = proc.caps.query(handle)?;
    if !entry.rights.contains(Rights::SEND) {
        return Err(VError::Permission);
    }
    let endpoint = entry.object.as_channel().ok_or(VError::WrongType)?;

    let transfers = handles
        .iter()
        .map(|&raw| proc.caps.query::<()>(viper_abi::Handle::from_raw(raw)))
        .collect::<Result<Vec<_>, _>>()?;

    let message = Message::new(payload, transfers)?;
    endpoint.send(message)?;

    for &raw in &handles {
        proc.caps.close::<()>(viper_abi::Handle::from_raw(raw))?;
    }
    Ok(())
}

/// Receives a pending message on `handle`, installing every transferred
/// capability into `proc`'s own table and returning the freshly minted
/// raw handle values for them — a raw index is only meaningful within
/// the table that minted it, so the sender's handle numbers never leak
/// across the channel.
pub fn channel_recv(proc: &Process, handle: ChannelHandle) -> Result<(Vec<u8>, Vec<u32>), VError> {
    let entry = proc.caps.query(handle)?;
    if !entry.rights.contains(Rights::RECV) {
        return Err(VError::Permission);
    }
    let endpoint = entry.object.as_channel().ok_or(VError::WrongType)?;
    let message = endpoint.try_recv()?;
    let handles = message
        .transfers
        .into_iter()
        .map(|entry| proc.caps.insert::<()>(entry.rights, entry.object).raw())
        .collect();
    Ok((message.payload, handles))
}

pub fn channel_close(proc: &Process, handle: ChannelHandle) -> Result<(), VError> {
    let endpoint = resolve_channel(proc, handle)?;
    endpoint.close();
    proc.caps.close(handle)
}

pub fn shm_create(proc: &Process, len: usize) -> ShmHandle {
    let region = SharedRegion::create(len);
    proc.caps.insert(Rights::MAP | Rights::MANAGE, KernelObject::Shm(region))
}

pub fn shm_write(proc: &Process, handle: ShmHandle, offset: usize, data: &[u8]) -> Result<(), VError> {
    let entry = proc.caps.query(handle)?;
    let region = entry.object.as_shm().ok_or(VError::WrongType)?;
    region.write(offset, data)
}

pub fn shm_read(proc: &Process, handle: ShmHandle, offset: usize, out: &mut [u8]) -> Result<(), VError> {
    let entry = proc.caps.query(handle)?;
    let region = entry.object.as_shm().ok_or(VError::WrongType)?;
    region.read(offset, out)
}

/// Maps a transferred SHM handle in the receiving process's own table,
/// producing a usable handle there. Receiving a handle via `channel_recv`
/// does not implicitly do this.
pub fn shm_map(proc: &Process, handle: ShmHandle) -> Result<ShmHandle, VError> {
    let entry = proc.caps.query(handle)?;
    if !entry.rights.contains(Rights::MAP) {
        return Err(VError::Permission);
    }
    let region = entry.object.as_shm().ok_or(VError::WrongType)?.clone();
    let _mapping = shm::map(&region);
    Ok(proc.caps.insert(entry.rights, KernelObject::Shm(region)))
}

pub fn shm_unmap(proc: &Process, handle: ShmHandle) -> Result<(), VError> {
    proc.caps.close(handle)
}

pub fn poll_create(proc: &Process) -> PollSetHandle {
    proc.caps.insert(Rights::MANAGE, KernelObject::PollSet(Arc::new(PollSet::new())))
}

/// Arms `watched` in `poll_handle`'s set. `watched` may be an ordinary
/// channel handle, or the well-known console pseudo-handle
/// (`viper_abi::CONSOLE_INPUT`), which is valid only inside a poll set and
/// has no capability-table entry of its own.
pub fn poll_arm(
    proc: &Process,
    poll_handle: PollSetHandle,
    watched: ChannelHandle,
    requested: PollMask,
) -> Result<(), VError> {
    let poll_entry = proc.caps.query(poll_handle)?;
    let poll = poll_entry.object.as_pollset().ok_or(VError::WrongType)?;
    if watched.raw() == viper_abi::CONSOLE_INPUT {
        poll.arm(watched.raw(), requested, proc.console.clone());
        return Ok(());
    }
    let endpoint = resolve_channel(proc, watched)?;
    poll.arm(watched.raw(), requested, endpoint);
    Ok(())
}

pub fn poll_disarm(proc: &Process, poll_handle: PollSetHandle, watched_raw: u32) -> Result<(), VError> {
    let poll_entry = proc.caps.query(poll_handle)?;
    let poll = poll_entry.object.as_pollset().ok_or(VError::WrongType)?;
    poll.disarm(watched_raw)
}

pub fn poll_wait(proc: &Process, poll_handle: PollSetHandle, timeout_ms: i64) -> Result<Vec<(u32, PollMask)>, VError> {
    let poll_entry = proc.caps.query(poll_handle)?;
    let poll = poll_entry.object.as_pollset().ok_or(VError::WrongType)?;
    Ok(poll.poll_wait(timeout_ms))
}

/// Registers `name` in the global registry, pointing at `connector` (the
/// channel endpoint clients should send requests on) and a diagnostic
/// `handle_raw` value.
pub fn assign_set(
    name: &str,
    handle_raw: u32,
    connector: Arc<Endpoint>,
    flags: AssignFlags,
) -> Result<AssignEntry, VError> {
    Ok(AssignRegistry::global().set(name, handle_raw, connector, flags)?)
}

pub fn assign_get(name: &str) -> Result<AssignEntry, VError> {
    Ok(AssignRegistry::global().get(name)?)
}

pub fn assign_remove(name: &str) -> Result<(), VError> {
    Ok(AssignRegistry::global().remove(name)?)
}

/// Resolves a `NAME:rest/of/path` style path against the global registry,
/// returning the named entry and the remainder of the path relative to it.
pub fn assign_resolve(path: &str) -> Result<(AssignEntry, String), VError> {
    Ok(AssignRegistry::global().resolve(path)?)
}

pub fn assign_restart(
    name: &str,
    handle_raw: u32,
    connector: Arc<Endpoint>,
    flags: AssignFlags,
) -> Result<AssignEntry, VError> {
    Ok(AssignRegistry::global().restart(name, handle_raw, connector, flags)?)
}

pub fn cap_close(proc: &Process, handle_raw: u32) -> Result<(), VError> {
    proc.caps.close::<()>(viper_abi::Handle::from_raw(handle_raw))
}
