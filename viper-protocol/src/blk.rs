//! blkd wire protocol: flat sector-addressed block device access.
//!
//! Sector data never rides in the message payload — `Read`/`Write` only
//! carry scalar fields on the wire, and the bytes themselves travel as a
//! transferred SHM handle (the client maps it for a write, blkd maps it to
//! fill it for a read), per the bulk-transfer convention every canonical
//! protocol with more than a few bytes of payload follows.

use viper_abi::MAX_SECTORS_PER_REQUEST;

use crate::wire::{Reader, WireError, Writer};

pub const SECTOR_SIZE: usize = 512;

pub const OP_READ: u32 = 1;
pub const OP_WRITE: u32 = 2;
pub const OP_INFO: u32 = 3;
pub const OP_FLUSH: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// `count` sectors starting at `sector`; the reply transfers an SHM
    /// handle sized to hold them.
    Read { sector: u64, count: u32 },
    /// `count` sectors starting at `sector`; the caller transfers an SHM
    /// handle already filled with `count * SECTOR_SIZE` bytes.
    Write { sector: u64, count: u32 },
    Info,
    Flush,
}

impl Request {
    pub fn opcode(&self) -> u32 {
        match self {
            Request::Read { .. } => OP_READ,
            Request::Write { .. } => OP_WRITE,
            Request::Info => OP_INFO,
            Request::Flush => OP_FLUSH,
        }
    }

    pub fn encode_body(&self) -> Vec<u8> {
        let mut w = Writer::new();
        match self {
            Request::Read { sector, count } | Request::Write { sector, count } => {
                w.u64(*sector).u32(*count);
            }
            Request::Info | Request::Flush => {}
        }
        w.into_vec()
    }

    pub fn decode(opcode: u32, body: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(body);
        Ok(match opcode {
            OP_READ => {
                let sector = r.u64()?;
                let count = r.u32()?;
                if count as usize > MAX_SECTORS_PER_REQUEST {
                    return Err(WireError::TooLarge);
                }
                Request::Read { sector, count }
            }
            OP_WRITE => {
                let sector = r.u64()?;
                let count = r.u32()?;
                if count as usize > MAX_SECTORS_PER_REQUEST {
                    return Err(WireError::TooLarge);
                }
                Request::Write { sector, count }
            }
            OP_INFO => Request::Info,
            OP_FLUSH => Request::Flush,
            _ => return Err(WireError::BadOpcode),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// The data itself rides in the transferred SHM handle, not here.
    Read { bytes_read: u32 },
    Written { bytes_written: u32 },
    Info { total_sectors: u64, sector_size: u32, max_request: u32, readonly: bool },
    Flushed,
    Error(i32),
}

impl Reply {
    pub fn encode_body(&self) -> Vec<u8> {
        let mut w = Writer::new();
        match self {
            Reply::Read { bytes_read } => {
                w.i32(0).u32(*bytes_read);
            }
            Reply::Written { bytes_written } => {
                w.i32(0).u32(*bytes_written);
            }
            Reply::Flushed => {
                w.i32(0);
            }
            Reply::Info { total_sectors, sector_size, max_request, readonly } => {
                w.i32(0).u64(*total_sectors).u32(*sector_size).u32(*max_request).u8(*readonly as u8);
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
            OP_READ => Reply::Read { bytes_read: r.u32()? },
            OP_WRITE => Reply::Written { bytes_written: r.u32()? },
            OP_INFO => {
                let total_sectors = r.u64()?;
                let sector_size = r.u32()?;
                let max_request = r.u32()?;
                let readonly = r.u8()? != 0;
                Reply::Info { total_sectors, sector_size, max_request, readonly }
            }
            OP_FLUSH => Reply::Flushed,
            _ => return Err(WireError::BadOpcode),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_request_roundtrip() {
        let req = Request::Read { sector: 3, count: 2 };
        let decoded = Request::decode(req.opcode(), &req.encode_body()).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn oversized_read_count_rejected() {
        let req = Request::Read { sector: 0, count: (MAX_SECTORS_PER_REQUEST + 1) as u32 };
        assert_eq!(Request::decode(req.opcode(), &req.encode_body()).unwrap_err(), WireError::TooLarge);
    }

    #[test]
    fn oversized_write_count_rejected() {
        let req = Request::Write { sector: 0, count: (MAX_SECTORS_PER_REQUEST + 1) as u32 };
        assert_eq!(Request::decode(req.opcode(), &req.encode_body()).unwrap_err(), WireError::TooLarge);
    }

    #[test]
    fn info_reply_roundtrip() {
        let reply = Reply::Info { total_sectors: 2048, sector_size: 512, max_request: MAX_SECTORS_PER_REQUEST as u32, readonly: false };
        let decoded = Reply::decode(OP_INFO, &reply.encode_body()).unwrap();
        assert_eq!(decoded, reply);
    }

    #[test]
    fn read_reply_carries_no_inline_data() {
        let reply = Reply::Read { bytes_read: 1024 };
        let encoded = reply.encode_body();
        assert!(encoded.len() < SECTOR_SIZE, "reply body must stay scalar-only, bulk data travels via SHM");
        assert_eq!(Reply::decode(OP_READ, &encoded).unwrap(), reply);
    }
}
