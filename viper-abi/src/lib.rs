//! Wire types shared between the simulated kernel and every service:
//! handles, rights, the stable numeric error taxonomy, and the message
//! header layout.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

use core::fmt;
use core::marker::PhantomData;

pub mod config;

/// Bytes carried inline in a single IPC message.
pub const MAX_PAYLOAD: usize = 256;
/// Handles carried alongside a single IPC message.
pub const MAX_HANDLES_PER_MSG: usize = 4;
/// Longest path accepted by fsd, in bytes.
pub const MAX_PATH_LEN: usize = 200;
/// Longest inline data blob accepted by fsd read/write requests.
pub const MAX_INLINE_DATA: usize = 200;
/// Largest sector run a single blkd request may address.
pub const MAX_SECTORS_PER_REQUEST: usize = 128;

/// Reserved value meaning "no handle".
pub const HANDLE_NONE: u32 = 0;
/// Well-known bootstrap receive endpoint every spawned server inherits.
pub const HANDLE_BOOTSTRAP: u32 = 0;
/// Pseudo-handle for the console/debug input stream.
pub const CONSOLE_INPUT: u32 = 0xFFFF_0001;

/// Well-known names registered in the assign registry.
pub mod assign_names {
    pub const BLKD: &str = "blkd";
    pub const FSD: &str = "fsd";
    pub const NETD: &str = "netd";
    pub const INPUTD: &str = "inputd";
    pub const DISPLAYD: &str = "displayd";
}

/// A capability table slot index, typed by the kind of object it refers to
/// so a channel handle can never be passed where a shared-memory handle is
/// expected.
#[repr(transparent)]
pub struct Handle<Kind> {
    raw: u32,
    _kind: PhantomData<fn() -> Kind>,
}

impl<Kind> Handle<Kind> {
    pub const fn from_raw(raw: u32) -> Self {
        Handle { raw, _kind: PhantomData }
    }

    pub const fn raw(&self) -> u32 {
        self.raw
    }

    pub const fn is_none(&self) -> bool {
        self.raw == HANDLE_NONE
    }
}

impl<Kind> Clone for Handle<Kind> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<Kind> Copy for Handle<Kind> {}

impl<Kind> PartialEq for Handle<Kind> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}
impl<Kind> Eq for Handle<Kind> {}

impl<Kind> fmt::Debug for Handle<Kind> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({:#010x})", self.raw)
    }
}

bitflags::bitflags! {
    /// Rights attached to a capability. Deriving a new capability from an
    /// existing one may only narrow this set, never widen it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Rights: u32 {
        const SEND    = 1 << 0;
        const RECV    = 1 << 1;
        const MAP     = 1 << 2;
        const MANAGE  = 1 << 3;
        const DUPLICATE = 1 << 4;
    }
}

impl Rights {
    /// Whether `self` could legally be derived from `parent` (i.e. `self`
    /// is a subset of `parent`).
    pub fn derivable_from(self, parent: Rights) -> bool {
        parent.contains(self)
    }
}

/// Stable numeric error codes. Values match
/// `viperdos/include/viperdos/syscall_abi.hpp` in the original source
/// exactly, so any tooling that logs raw codes stays meaningful across
/// both implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum VError {
    Unknown = -1,
    InvalidArg = -2,
    OutOfMemory = -3,
    NotFound = -4,
    AlreadyExists = -5,
    Permission = -6,
    NotSupported = -7,
    Busy = -8,
    Timeout = -9,
    InvalidHandle = -100,
    HandleClosed = -101,
    WrongType = -102,
    TaskExited = -200,
    TaskNotFound = -201,
    WouldBlock = -300,
    ChannelClosed = -301,
    MsgTooLarge = -302,
    PollFull = -400,
    Io = -500,
    NoResource = -501,
    Connection = -502,
}

impl VError {
    pub const OK: i32 = 0;

    pub const fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            -1 => Self::Unknown,
            -2 => Self::InvalidArg,
            -3 => Self::OutOfMemory,
            -4 => Self::NotFound,
            -5 => Self::AlreadyExists,
            -6 => Self::Permission,
            -7 => Self::NotSupported,
            -8 => Self::Busy,
            -9 => Self::Timeout,
            -100 => Self::InvalidHandle,
            -101 => Self::HandleClosed,
            -102 => Self::WrongType,
            -200 => Self::TaskExited,
            -201 => Self::TaskNotFound,
            -300 => Self::WouldBlock,
            -301 => Self::ChannelClosed,
            -302 => Self::MsgTooLarge,
            -400 => Self::PollFull,
            -500 => Self::Io,
            -501 => Self::NoResource,
            -502 => Self::Connection,
            _ => return None,
        })
    }
}

impl fmt::Display for VError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::Unknown => "unknown error",
            Self::InvalidArg => "invalid argument",
            Self::OutOfMemory => "out of memory",
            Self::NotFound => "not found",
            Self::AlreadyExists => "already exists",
            Self::Permission => "permission denied",
            Self::NotSupported => "not supported",
            Self::Busy => "resource busy",
            Self::Timeout => "timed out",
            Self::InvalidHandle => "invalid handle",
            Self::HandleClosed => "handle closed",
            Self::WrongType => "wrong object type for handle",
            Self::TaskExited => "task exited",
            Self::TaskNotFound => "task not found",
            Self::WouldBlock => "operation would block",
            Self::ChannelClosed => "channel closed",
            Self::MsgTooLarge => "message too large",
            Self::PollFull => "poll set full",
            Self::Io => "I/O error",
            Self::NoResource => "no resource available",
            Self::Connection => "connection error",
        };
        f.write_str(msg)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for VError {}

/// 8-byte little-endian message header: `{u32 type, u32 request_id}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
    pub ty: u32,
    pub request_id: u32,
}

impl MsgHeader {
    pub const WIRE_LEN: usize = 8;

    pub const fn new(ty: u32, request_id: u32) -> Self {
        MsgHeader { ty, request_id }
    }

    /// Sets the reply bit (0x80) on the opcode, per the canonical
    /// request/reply convention shared by every service protocol: request
    /// opcodes live in 1..=127, and a reply's type is always
    /// `request_ty | 0x80`.
    pub const fn reply_ty(ty: u32) -> u32 {
        ty | 0x80
    }

    pub const fn is_reply(ty: u32) -> bool {
        ty & 0x80 != 0
    }

    pub fn to_le_bytes(self) -> [u8; Self::WIRE_LEN] {
        let mut out = [0u8; Self::WIRE_LEN];
        out[0..4].copy_from_slice(&self.ty.to_le_bytes());
        out[4..8].copy_from_slice(&self.request_id.to_le_bytes());
        out
    }

    pub fn from_le_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::WIRE_LEN {
            return None;
        }
        let ty = u32::from_le_bytes(bytes[0..4].try_into().ok()?);
        let request_id = u32::from_le_bytes(bytes[4..8].try_into().ok()?);
        Some(MsgHeader { ty, request_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msg_header_roundtrip() {
        let h = MsgHeader::new(7, 42);
        let bytes = h.to_le_bytes();
        assert_eq!(MsgHeader::from_le_bytes(&bytes), Some(h));
    }

    #[test]
    fn reply_ty_sets_reply_bit() {
        assert!(MsgHeader::is_reply(MsgHeader::reply_ty(3)));
        assert!(!MsgHeader::is_reply(3));
    }

    #[test]
    fn verror_code_roundtrip() {
        for v in [
            VError::Unknown,
            VError::InvalidArg,
            VError::OutOfMemory,
            VError::NotFound,
            VError::AlreadyExists,
            VError::Permission,
            VError::NotSupported,
            VError::Busy,
            VError::Timeout,
            VError::InvalidHandle,
            VError::HandleClosed,
            VError::WrongType,
            VError::TaskExited,
            VError::TaskNotFound,
            VError::WouldBlock,
            VError::ChannelClosed,
            VError::MsgTooLarge,
            VError::PollFull,
            VError::Io,
            VError::NoResource,
            VError::Connection,
        ] {
            assert_eq!(VError::from_code(v.code()), Some(v));
        }
    }

    #[test]
    fn rights_derivation_only_narrows() {
        let parent = Rights::SEND | Rights::RECV;
        assert!(Rights::SEND.derivable_from(parent));
        assert!(!(Rights::MAP).derivable_from(parent));
    }
}
