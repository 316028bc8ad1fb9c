//! netd wire protocol: a loopback-only socket table plus a tiny built-in
//! DNS resolver (no real TCP/IP stack — out of scope per Non-goals).
//! Socket creation and connection are separate calls so a caller can hold
//! a socket handle before a peer address is known, and event subscription
//! hands netd a channel to notify on instead of polling.

use viper_abi::MAX_INLINE_DATA;

use crate::wire::{Reader, WireError, Writer};

pub const OP_SOCKET_CREATE: u32 = 1;
pub const OP_SOCKET_CONNECT: u32 = 2;
pub const OP_SOCKET_SEND: u32 = 3;
pub const OP_SOCKET_RECV: u32 = 4;
pub const OP_SOCKET_CLOSE: u32 = 5;
pub const OP_SOCKET_STATUS: u32 = 6;
pub const OP_DNS_RESOLVE: u32 = 7;
pub const OP_SUBSCRIBE_EVENTS: u32 = 8;

const MAX_HOSTNAME_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    SocketCreate,
    SocketConnect { handle: u32, addr: [u8; 4], port: u16 },
    SocketSend { handle: u32, data: Vec<u8> },
    SocketRecv { handle: u32, max_len: u32 },
    SocketClose { handle: u32 },
    SocketStatus { handle: u32 },
    DnsResolve { name: String },
    /// A channel send endpoint travels as a transferred handle alongside
    /// this request; netd notifies it (coalesced, at most one outstanding
    /// wakeup) whenever the socket's readable state changes.
    SubscribeEvents { handle: u32 },
}

impl Request {
    pub fn opcode(&self) -> u32 {
        match self {
            Request::SocketCreate => OP_SOCKET_CREATE,
            Request::SocketConnect { .. } => OP_SOCKET_CONNECT,
            Request::SocketSend { .. } => OP_SOCKET_SEND,
            Request::SocketRecv { .. } => OP_SOCKET_RECV,
            Request::SocketClose { .. } => OP_SOCKET_CLOSE,
            Request::SocketStatus { .. } => OP_SOCKET_STATUS,
            Request::DnsResolve { .. } => OP_DNS_RESOLVE,
            Request::SubscribeEvents { .. } => OP_SUBSCRIBE_EVENTS,
        }
    }

    pub fn encode_body(&self) -> Vec<u8> {
        let mut w = Writer::new();
        match self {
            Request::SocketCreate => {}
            Request::SocketConnect { handle, addr, port } => {
                w.u32(*handle);
                for b in addr {
                    w.u8(*b);
                }
                w.u32(*port as u32);
            }
            Request::SocketSend { handle, data } => {
                w.u32(*handle).bytes(data);
            }
            Request::SocketRecv { handle, max_len } => {
                w.u32(*handle).u32(*max_len);
            }
            Request::SocketClose { handle } => {
                w.u32(*handle);
            }
            Request::SocketStatus { handle } => {
                w.u32(*handle);
            }
            Request::DnsResolve { name } => {
                w.string(name);
            }
            Request::SubscribeEvents { handle } => {
                w.u32(*handle);
            }
        }
        w.into_vec()
    }

    pub fn decode(opcode: u32, body: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(body);
        Ok(match opcode {
            OP_SOCKET_CREATE => Request::SocketCreate,
            OP_SOCKET_CONNECT => {
                let handle = r.u32()?;
                let addr = [r.u8()?, r.u8()?, r.u8()?, r.u8()?];
                let port = r.u32()? as u16;
                Request::SocketConnect { handle, addr, port }
            }
            OP_SOCKET_SEND => {
                let handle = r.u32()?;
                let data = r.bytes(MAX_INLINE_DATA)?;
                Request::SocketSend { handle, data }
            }
            OP_SOCKET_RECV => {
                let handle = r.u32()?;
                let max_len = r.u32()?;
                if max_len as usize > MAX_INLINE_DATA {
                    return Err(WireError::TooLarge);
                }
                Request::SocketRecv { handle, max_len }
            }
            OP_SOCKET_CLOSE => Request::SocketClose { handle: r.u32()? },
            OP_SOCKET_STATUS => Request::SocketStatus { handle: r.u32()? },
            OP_DNS_RESOLVE => Request::DnsResolve { name: r.string(MAX_HOSTNAME_LEN)? },
            OP_SUBSCRIBE_EVENTS => Request::SubscribeEvents { handle: r.u32()? },
            _ => return Err(WireError::BadOpcode),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Created { handle: u32 },
    Connected,
    Sent { len: u32 },
    Data(Vec<u8>),
    Closed,
    Status { connected: bool, addr: [u8; 4], port: u16, pending: u32 },
    Resolved { addr: [u8; 4] },
    Subscribed,
    Error(i32),
}

impl Reply {
    pub fn encode_body(&self) -> Vec<u8> {
        let mut w = Writer::new();
        match self {
            Reply::Created { handle } => {
                w.i32(0).u32(*handle);
            }
            Reply::Connected | Reply::Closed | Reply::Subscribed => {
                w.i32(0);
            }
            Reply::Sent { len } => {
                w.i32(0).u32(*len);
            }
            Reply::Data(d) => {
                w.i32(0).bytes(d);
            }
            Reply::Status { connected, addr, port, pending } => {
                w.i32(0).u8(*connected as u8);
                for b in addr {
                    w.u8(*b);
                }
                w.u32(*port as u32).u32(*pending);
            }
            Reply::Resolved { addr } => {
                w.i32(0);
                for b in addr {
                    w.u8(*b);
                }
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
            OP_SOCKET_CREATE => Reply::Created { handle: r.u32()? },
            OP_SOCKET_CONNECT => Reply::Connected,
            OP_SOCKET_SEND => Reply::Sent { len: r.u32()? },
            OP_SOCKET_RECV => Reply::Data(r.bytes(MAX_INLINE_DATA)?),
            OP_SOCKET_CLOSE => Reply::Closed,
            OP_SOCKET_STATUS => {
                let connected = r.u8()? != 0;
                let addr = [r.u8()?, r.u8()?, r.u8()?, r.u8()?];
                let port = r.u32()? as u16;
                let pending = r.u32()?;
                Reply::Status { connected, addr, port, pending }
            }
            OP_DNS_RESOLVE => Reply::Resolved { addr: [r.u8()?, r.u8()?, r.u8()?, r.u8()?] },
            OP_SUBSCRIBE_EVENTS => Reply::Subscribed,
            _ => return Err(WireError::BadOpcode),
        })
    }
}
