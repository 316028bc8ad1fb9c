//! blkd: a flat sector-addressed block device backed by an in-memory
//! store standing in for the VirtIO MMIO layer this workspace excludes.
//!
//! Bulk sector data never rides in a message payload: `Read` replies
//! transfer a freshly created SHM handle holding the sectors, and `Write`
//! requests expect one transferred alongside them, per the server
//! framework's "first transferred handle is the reply channel, any
//! further ones carry bulk data" convention.

use std::fmt::Write as _;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use viper_abi::{Handle, MsgHeader};
use viper_ipc::{IpcError, Server, Wait};
use viper_kernel::channel::ChannelHandle;
use viper_kernel::{trap, Process};
use viper_protocol::blk::{Reply, Request, SECTOR_SIZE};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("ipc error: {0}")]
    Ipc(#[from] IpcError),
    #[error("wire error: {0}")]
    Wire(#[from] viper_protocol::WireError),
}

pub struct BlkdServer {
    store: Mutex<Vec<[u8; SECTOR_SIZE]>>,
    process: Arc<Process>,
    readonly: bool,
}

impl BlkdServer {
    pub fn new(total_sectors: usize, process: Arc<Process>) -> Arc<Self> {
        Arc::new(BlkdServer {
            store: Mutex::new(vec![[0u8; SECTOR_SIZE]; total_sectors]),
            process,
            readonly: false,
        })
    }

    /// `request`'s reply, plus any handles (already live in this server's
    /// own process) the reply must transfer alongside it.
    fn handle(&self, request: Request, extra_handles: &[u32]) -> (Reply, Vec<u32>) {
        match request {
            Request::Read { sector, count } => {
                let store = self.store.lock();
                let start = sector as usize;
                let end = start + count as usize;
                if end > store.len() {
                    return (Reply::Error(viper_abi::VError::InvalidArg.code()), Vec::new());
                }
                let mut data = Vec::with_capacity(count as usize * SECTOR_SIZE);
                for s in &store[start..end] {
                    data.extend_from_slice(s);
                }
                let shm = trap::shm_create(&self.process, data.len());
                trap::shm_write(&self.process, shm, 0, &data).expect("freshly created region fits its own data");
                (Reply::Read { bytes_read: data.len() as u32 }, vec![shm.raw()])
            }
            Request::Write { sector, count } => {
                if self.readonly {
                    return (Reply::Error(viper_abi::VError::Permission.code()), Vec::new());
                }
                let Some(&data_handle_raw) = extra_handles.first() else {
                    return (Reply::Error(viper_abi::VError::InvalidArg.code()), Vec::new());
                };
                let data_handle: viper_kernel::shm::ShmHandle = Handle::from_raw(data_handle_raw);
                let expected_len = count as usize * SECTOR_SIZE;
                let mut data = vec![0u8; expected_len];
                if trap::shm_read(&self.process, data_handle, 0, &mut data).is_err() {
                    let _ = trap::cap_close(&self.process, data_handle_raw);
                    return (Reply::Error(viper_abi::VError::InvalidArg.code()), Vec::new());
                }
                let _ = trap::cap_close(&self.process, data_handle_raw);

                let mut store = self.store.lock();
                let start = sector as usize;
                if start + count as usize > store.len() {
                    return (Reply::Error(viper_abi::VError::InvalidArg.code()), Vec::new());
                }
                for (i, chunk) in data.chunks_exact(SECTOR_SIZE).enumerate() {
                    store[start + i].copy_from_slice(chunk);
                }
                (Reply::Written { bytes_written: data.len() as u32 }, Vec::new())
            }
            Request::Info => {
                let store = self.store.lock();
                (
                    Reply::Info {
                        total_sectors: store.len() as u64,
                        sector_size: SECTOR_SIZE as u32,
                        max_request: viper_abi::MAX_SECTORS_PER_REQUEST as u32,
                        readonly: self.readonly,
                    },
                    Vec::new(),
                )
            }
            Request::Flush => (Reply::Flushed, Vec::new()),
        }
    }

    /// Services exactly one request/reply cycle on `transport`. Returns
    /// `Ok(false)` once the channel has closed, so callers can stop
    /// looping instead of busy-spinning on a dead connection.
    pub fn run_once(&self, transport: &dyn Server) -> Result<bool, ServerError> {
        let (frame, handles) = match transport.recv(Wait::Blocking) {
            Ok(f) => f,
            Err(IpcError::Disconnected) => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let header = MsgHeader::from_le_bytes(&frame).ok_or(viper_protocol::WireError::Truncated)?;
        let body = &frame[MsgHeader::WIRE_LEN..];

        let mut handles = handles.into_iter();
        let Some(reply_channel_raw) = handles.next() else {
            viper_log::warn("blkd", |l| {
                let _ = write!(l, "request carried no reply channel, dropping");
            });
            return Ok(true);
        };
        let reply_channel: ChannelHandle = Handle::from_raw(reply_channel_raw);
        let extra_handles: Vec<u32> = handles.collect();

        let (reply, out_handles) = match Request::decode(header.ty, body) {
            Ok(request) => self.handle(request, &extra_handles),
            Err(_) => (Reply::Error(viper_abi::VError::InvalidArg.code()), Vec::new()),
        };

        let mut out = MsgHeader::new(MsgHeader::reply_ty(header.ty), header.request_id).to_le_bytes().to_vec();
        out.extend_from_slice(&reply.encode_body());
        trap::channel_send(&self.process, reply_channel, out, out_handles).map_err(IpcError::from)?;
        trap::channel_close(&self.process, reply_channel).map_err(IpcError::from)?;
        viper_log::debug("blkd", |l| {
            let _ = write!(l, "handled request_id={}", header.request_id);
        });
        Ok(true)
    }

    pub fn run_forever(&self, transport: &dyn Server) -> Result<(), ServerError> {
        while self.run_once(transport)? {}
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use viper_ipc::Client;

    /// Sends a request over `client`, transferring a fresh reply channel
    /// (plus `extra`) as the server framework requires, and returns the
    /// decoded reply frame and any handles it carried.
    fn call(client: &dyn Client, req: &Request, extra: &[u32]) -> (MsgHeader, Vec<u8>, Vec<u32>) {
        let client_process = client.process();
        let (reply_send, reply_recv) = trap::channel_create(client_process, 1);
        let mut frame = MsgHeader::new(req.opcode(), 1).to_le_bytes().to_vec();
        frame.extend_from_slice(&req.encode_body());
        let mut handles = vec![reply_send.raw()];
        handles.extend_from_slice(extra);
        client.send(&frame, &handles).unwrap();

        let (reply_frame, reply_handles) = loop {
            match trap::channel_recv(client_process, reply_recv) {
                Ok(got) => break got,
                Err(viper_abi::VError::WouldBlock) => std::thread::yield_now(),
                Err(e) => panic!("reply recv failed: {e:?}"),
            }
        };
        trap::channel_close(client_process, reply_recv).unwrap();
        let header = MsgHeader::from_le_bytes(&reply_frame).unwrap();
        (header, reply_frame[MsgHeader::WIRE_LEN..].to_vec(), reply_handles)
    }

    #[test]
    fn read_after_write_round_trips_through_shm() {
        let (client, server_endpoint) = viper_ipc::loopback_pair();
        let server = BlkdServer::new(4, server_endpoint.process().clone());

        let write_req = Request::Write { sector: 0, count: 1 };
        let data_shm = trap::shm_create(client.process(), SECTOR_SIZE);
        trap::shm_write(client.process(), data_shm, 0, &[7u8; SECTOR_SIZE]).unwrap();
        let (header, body, _) = {
            std::thread::scope(|scope| {
                scope.spawn(|| {
                    server.run_once(&server_endpoint).unwrap();
                });
                call(&client, &write_req, &[data_shm.raw()])
            })
        };
        assert_eq!(Reply::decode(header.ty & !0x80, &body).unwrap(), Reply::Written { bytes_written: SECTOR_SIZE as u32 });

        let read_req = Request::Read { sector: 0, count: 1 };
        let (header, body, handles) = std::thread::scope(|scope| {
            scope.spawn(|| {
                server.run_once(&server_endpoint).unwrap();
            });
            call(&client, &read_req, &[])
        });
        let reply = Reply::decode(header.ty & !0x80, &body).unwrap();
        assert_eq!(reply, Reply::Read { bytes_read: SECTOR_SIZE as u32 });
        assert_eq!(handles.len(), 1, "read reply must transfer exactly one SHM handle");
        let data_handle: viper_kernel::shm::ShmHandle = Handle::from_raw(handles[0]);
        let mut out = [0u8; SECTOR_SIZE];
        trap::shm_read(client.process(), data_handle, 0, &mut out).unwrap();
        assert_eq!(out, [7u8; SECTOR_SIZE]);
    }

    #[test]
    fn out_of_range_read_reports_invalid_arg() {
        let (client, server_endpoint) = viper_ipc::loopback_pair();
        let server = BlkdServer::new(2, server_endpoint.process().clone());
        let req = Request::Read { sector: 10, count: 1 };
        let (header, body, _) = std::thread::scope(|scope| {
            scope.spawn(|| {
                server.run_once(&server_endpoint).unwrap();
            });
            call(&client, &req, &[])
        });
        assert_eq!(Reply::decode(header.ty & !0x80, &body).unwrap(), Reply::Error(viper_abi::VError::InvalidArg.code()));
    }

    #[test]
    fn request_with_no_reply_channel_is_dropped_not_crashed() {
        let (client, server_endpoint) = viper_ipc::loopback_pair();
        let server = BlkdServer::new(2, server_endpoint.process().clone());
        let req = Request::Info;
        let mut frame = MsgHeader::new(req.opcode(), 1).to_le_bytes().to_vec();
        frame.extend_from_slice(&req.encode_body());
        client.send(&frame, &[]).unwrap();
        assert!(server.run_once(&server_endpoint).unwrap());
    }

    #[test]
    fn run_once_reports_channel_closed_as_stop_signal() {
        let (client, server_endpoint) = viper_ipc::loopback_pair();
        let server = BlkdServer::new(2, server_endpoint.process().clone());
        drop(client);
        assert!(!server.run_once(&server_endpoint).unwrap());
    }
}
