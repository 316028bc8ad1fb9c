//! fsd wire protocol: a small path-addressed filesystem surface backed
//! internally by a blkd client for geometry reporting.

use viper_abi::{MAX_INLINE_DATA, MAX_PATH_LEN};

use crate::wire::{Reader, WireError, Writer};

pub const OP_OPEN: u32 = 1;
pub const OP_READ: u32 = 2;
pub const OP_WRITE: u32 = 3;
pub const OP_CLOSE: u32 = 4;
pub const OP_STAT: u32 = 5;
pub const OP_STATFS: u32 = 6;
pub const OP_SEEK: u32 = 7;
pub const OP_READDIR: u32 = 8;
pub const OP_MKDIR: u32 = 9;
pub const OP_RMDIR: u32 = 10;
pub const OP_UNLINK: u32 = 11;
pub const OP_RENAME: u32 = 12;
pub const OP_SYMLINK: u32 = 13;
pub const OP_READLINK: u32 = 14;

/// Maximum directory entries a single `Readdir` reply returns; callers
/// needing more page through with repeated calls (not yet implemented —
/// every directory in this workspace's test trees is small).
pub const MAX_READDIR_ENTRIES: usize = 256;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const RDONLY = 0;
        const WRONLY = 1 << 0;
        const RDWR   = 1 << 1;
        const CREAT  = 1 << 2;
        const TRUNC  = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set = 0,
    Cur = 1,
    End = 2,
}

impl Whence {
    fn from_u8(v: u8) -> Result<Self, WireError> {
        Ok(match v {
            0 => Whence::Set,
            1 => Whence::Cur,
            2 => Whence::End,
            _ => return Err(WireError::BadOpcode),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Open { path: String, flags: OpenFlags },
    Read { handle: u32, offset: u64, len: u32 },
    Write { handle: u32, offset: u64, data: Vec<u8> },
    Close { handle: u32 },
    Stat { path: String },
    Statfs,
    Seek { handle: u32, offset: i64, whence: Whence },
    Readdir { path: String },
    Mkdir { path: String },
    Rmdir { path: String },
    Unlink { path: String },
    Rename { from: String, to: String },
    Symlink { target: String, link_path: String },
    Readlink { path: String },
}

impl Request {
    pub fn opcode(&self) -> u32 {
        match self {
            Request::Open { .. } => OP_OPEN,
            Request::Read { .. } => OP_READ,
            Request::Write { .. } => OP_WRITE,
            Request::Close { .. } => OP_CLOSE,
            Request::Stat { .. } => OP_STAT,
            Request::Statfs => OP_STATFS,
            Request::Seek { .. } => OP_SEEK,
            Request::Readdir { .. } => OP_READDIR,
            Request::Mkdir { .. } => OP_MKDIR,
            Request::Rmdir { .. } => OP_RMDIR,
            Request::Unlink { .. } => OP_UNLINK,
            Request::Rename { .. } => OP_RENAME,
            Request::Symlink { .. } => OP_SYMLINK,
            Request::Readlink { .. } => OP_READLINK,
        }
    }

    pub fn encode_body(&self) -> Vec<u8> {
        let mut w = Writer::new();
        match self {
            Request::Open { path, flags } => {
                w.string(path).u32(flags.bits());
            }
            Request::Read { handle, offset, len } => {
                w.u32(*handle).u64(*offset).u32(*len);
            }
            Request::Write { handle, offset, data } => {
                w.u32(*handle).u64(*offset).bytes(data);
            }
            Request::Close { handle } => {
                w.u32(*handle);
            }
            Request::Stat { path } => {
                w.string(path);
            }
            Request::Statfs => {}
            Request::Seek { handle, offset, whence } => {
                w.u32(*handle).u64(*offset as u64).u8(*whence as u8);
            }
            Request::Readdir { path } => {
                w.string(path);
            }
            Request::Mkdir { path } => {
                w.string(path);
            }
            Request::Rmdir { path } => {
                w.string(path);
            }
            Request::Unlink { path } => {
                w.string(path);
            }
            Request::Rename { from, to } => {
                w.string(from).string(to);
            }
            Request::Symlink { target, link_path } => {
                w.string(target).string(link_path);
            }
            Request::Readlink { path } => {
                w.string(path);
            }
        }
        w.into_vec()
    }

    pub fn decode(opcode: u32, body: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(body);
        Ok(match opcode {
            OP_OPEN => {
                let path = r.string(MAX_PATH_LEN)?;
                let flags = OpenFlags::from_bits_truncate(r.u32()?);
                Request::Open { path, flags }
            }
            OP_READ => {
                let handle = r.u32()?;
                let offset = r.u64()?;
                let len = r.u32()?;
                if len as usize > MAX_INLINE_DATA {
                    return Err(WireError::TooLarge);
                }
                Request::Read { handle, offset, len }
            }
            OP_WRITE => {
                let handle = r.u32()?;
                let offset = r.u64()?;
                let data = r.bytes(MAX_INLINE_DATA)?;
                Request::Write { handle, offset, data }
            }
            OP_CLOSE => Request::Close { handle: r.u32()? },
            OP_STAT => Request::Stat { path: r.string(MAX_PATH_LEN)? },
            OP_STATFS => Request::Statfs,
            OP_SEEK => {
                let handle = r.u32()?;
                let offset = r.u64()? as i64;
                let whence = Whence::from_u8(r.u8()?)?;
                Request::Seek { handle, offset, whence }
            }
            OP_READDIR => Request::Readdir { path: r.string(MAX_PATH_LEN)? },
            OP_MKDIR => Request::Mkdir { path: r.string(MAX_PATH_LEN)? },
            OP_RMDIR => Request::Rmdir { path: r.string(MAX_PATH_LEN)? },
            OP_UNLINK => Request::Unlink { path: r.string(MAX_PATH_LEN)? },
            OP_RENAME => {
                let from = r.string(MAX_PATH_LEN)?;
                let to = r.string(MAX_PATH_LEN)?;
                Request::Rename { from, to }
            }
            OP_SYMLINK => {
                let target = r.string(MAX_PATH_LEN)?;
                let link_path = r.string(MAX_PATH_LEN)?;
                Request::Symlink { target, link_path }
            }
            OP_READLINK => Request::Readlink { path: r.string(MAX_PATH_LEN)? },
            _ => return Err(WireError::BadOpcode),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Opened { handle: u32 },
    Data(Vec<u8>),
    Written { len: u32 },
    Closed,
    Stat { size: u64, is_dir: bool },
    Statfs { total_sectors: u64, sector_size: u32 },
    Seeked { offset: u64 },
    Dir { entries: Vec<String> },
    Mkdired,
    Rmdired,
    Unlinked,
    Renamed,
    Symlinked,
    Readlink { target: String },
    Error(i32),
}

impl Reply {
    pub fn encode_body(&self) -> Vec<u8> {
        let mut w = Writer::new();
        match self {
            Reply::Opened { handle } => {
                w.i32(0).u32(*handle);
            }
            Reply::Data(d) => {
                w.i32(0).bytes(d);
            }
            Reply::Written { len } => {
                w.i32(0).u32(*len);
            }
            Reply::Closed
            | Reply::Mkdired
            | Reply::Rmdired
            | Reply::Unlinked
            | Reply::Renamed
            | Reply::Symlinked => {
                w.i32(0);
            }
            Reply::Stat { size, is_dir } => {
                w.i32(0).u64(*size).u8(*is_dir as u8);
            }
            Reply::Statfs { total_sectors, sector_size } => {
                w.i32(0).u64(*total_sectors).u32(*sector_size);
            }
            Reply::Seeked { offset } => {
                w.i32(0).u64(*offset);
            }
            Reply::Dir { entries } => {
                w.i32(0).u32(entries.len() as u32);
                for entry in entries {
                    w.string(entry);
                }
            }
            Reply::Readlink { target } => {
                w.i32(0).string(target);
            }
            Reply::Error(code) => {
                w.i32(*code);
            }
        }
        w.into_vec()
    }

    pub fn decode(opcode: u32, body: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(body);
        let status = r.i32()?;
        if status != 0 {
            return Ok(Reply::Error(status));
        }
        Ok(match opcode {
            OP_OPEN => Reply::Opened { handle: r.u32()? },
            OP_READ => Reply::Data(r.bytes(MAX_INLINE_DATA)?),
            OP_WRITE => Reply::Written { len: r.u32()? },
            OP_CLOSE => Reply::Closed,
            OP_STAT => Reply::Stat { size: r.u64()?, is_dir: r.u8()? != 0 },
            OP_STATFS => {
                let total_sectors = r.u64()?;
                let sector_size = r.u32()?;
                Reply::Statfs { total_sectors, sector_size }
            }
            OP_SEEK => Reply::Seeked { offset: r.u64()? },
            OP_READDIR => {
                let count = r.u32()? as usize;
                if count > MAX_READDIR_ENTRIES {
                    return Err(WireError::TooLarge);
                }
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    entries.push(r.string(MAX_PATH_LEN)?);
                }
                Reply::Dir { entries }
            }
            OP_MKDIR => Reply::Mkdired,
            OP_RMDIR => Reply::Rmdired,
            OP_UNLINK => Reply::Unlinked,
            OP_RENAME => Reply::Renamed,
            OP_SYMLINK => Reply::Symlinked,
            OP_READLINK => Reply::Readlink { target: r.string(MAX_PATH_LEN)? },
            _ => return Err(WireError::BadOpcode),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_request_roundtrip() {
        let req = Request::Open { path: "/etc/motd".into(), flags: OpenFlags::RDONLY };
        let decoded = Request::decode(req.opcode(), &req.encode_body()).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn stat_reply_roundtrip() {
        let reply = Reply::Stat { size: 4096, is_dir: false };
        let decoded = Reply::decode(OP_STAT, &reply.encode_body()).unwrap();
        assert_eq!(decoded, reply);
    }

    #[test]
    fn overlong_path_rejected() {
        let req = Request::Stat { path: "x".repeat(MAX_PATH_LEN + 1) };
        assert_eq!(Request::decode(req.opcode(), &req.encode_body()).unwrap_err(), WireError::TooLarge);
    }

    #[test]
    fn seek_request_roundtrip() {
        let req = Request::Seek { handle: 3, offset: -10, whence: Whence::End };
        let decoded = Request::decode(req.opcode(), &req.encode_body()).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn rename_request_roundtrip() {
        let req = Request::Rename { from: "/a".into(), to: "/b".into() };
        let decoded = Request::decode(req.opcode(), &req.encode_body()).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn readdir_reply_roundtrip() {
        let reply = Reply::Dir { entries: vec!["a".into(), "b".into()] };
        let decoded = Reply::decode(OP_READDIR, &reply.encode_body()).unwrap();
        assert_eq!(decoded, reply);
    }

    #[test]
    fn symlink_then_readlink_roundtrip() {
        let req = Request::Symlink { target: "/real".into(), link_path: "/link".into() };
        assert_eq!(Request::decode(req.opcode(), &req.encode_body()).unwrap(), req);
        let reply = Reply::Readlink { target: "/real".into() };
        assert_eq!(Reply::decode(OP_READLINK, &reply.encode_body()).unwrap(), reply);
    }
}
