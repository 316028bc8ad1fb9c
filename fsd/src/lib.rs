//! fsd: a small in-memory filesystem tree standing in for the excluded
//! on-disk format. `Statfs` genuinely calls through to a blkd client for
//! backing-device geometry, keeping that dependency real rather than
//! decorative.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use viper_abi::{assign_names, Handle, MsgHeader};
use viper_ipc::{IpcError, Server, ServiceClient, Wait};
use viper_kernel::channel::ChannelHandle;
use viper_kernel::{trap, Process};
use viper_protocol::blk;
use viper_protocol::fs::{OpenFlags, Reply, Request, Whence};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("ipc error: {0}")]
    Ipc(#[from] IpcError),
    #[error("wire error: {0}")]
    Wire(#[from] viper_protocol::WireError),
}

#[derive(Clone)]
struct Node {
    data: Vec<u8>,
    is_dir: bool,
}

struct OpenFile {
    path: String,
    pos: u64,
}

pub struct FsdServer {
    tree: Mutex<HashMap<String, Node>>,
    open_files: Mutex<HashMap<u32, OpenFile>>,
    next_handle: AtomicU32,
    process: Arc<Process>,
    blk_client: ServiceClient,
}

/// Direct children of `dir` (one path component deep, no recursive walk).
fn children_of<'a>(tree: &'a HashMap<String, Node>, dir: &str) -> Vec<&'a str> {
    let prefix = if dir == "/" { "/".to_string() } else { format!("{dir}/") };
    tree.keys()
        .filter(|k| k.as_str() != dir && k.starts_with(&prefix))
        .filter(|k| !k[prefix.len()..].contains('/'))
        .map(|k| k.as_str())
        .collect()
}

impl FsdServer {
    pub fn new(process: Arc<Process>) -> Arc<Self> {
        let mut tree = HashMap::new();
        tree.insert("/".to_string(), Node { data: Vec::new(), is_dir: true });
        Arc::new(FsdServer {
            tree: Mutex::new(tree),
            open_files: Mutex::new(HashMap::new()),
            next_handle: AtomicU32::new(1),
            process,
            blk_client: ServiceClient::new(assign_names::BLKD),
        })
    }

    fn statfs(&self) -> Result<Reply, ServerError> {
        let req = blk::Request::Info;
        let (body, _) = self.blk_client.call(req.opcode(), &req.encode_body(), &[], 0)?;
        let reply = blk::Reply::decode(blk::OP_INFO, &body)?;
        Ok(match reply {
            blk::Reply::Info { total_sectors, sector_size, .. } => Reply::Statfs { total_sectors, sector_size },
            blk::Reply::Error(code) => Reply::Error(code),
            _ => Reply::Error(viper_abi::VError::Unknown.code()),
        })
    }

    fn handle(&self, request: Request) -> Result<Reply, ServerError> {
        Ok(match request {
            Request::Open { path, flags } => {
                let mut tree = self.tree.lock();
                if !tree.contains_key(&path) {
                    if flags.contains(OpenFlags::CREAT) {
                        tree.insert(path.clone(), Node { data: Vec::new(), is_dir: false });
                    } else {
                        return Ok(Reply::Error(viper_abi::VError::NotFound.code()));
                    }
                } else if flags.contains(OpenFlags::TRUNC) {
                    tree.get_mut(&path).unwrap().data.clear();
                }
                drop(tree);
                let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
                self.open_files.lock().insert(handle, OpenFile { path, pos: 0 });
                Reply::Opened { handle }
            }
            Request::Read { handle, offset, len } => {
                let open = self.open_files.lock();
                let Some(of) = open.get(&handle) else {
                    return Ok(Reply::Error(viper_abi::VError::InvalidHandle.code()));
                };
                let tree = self.tree.lock();
                let node = tree.get(&of.path).expect("open file's path stays in the tree");
                let start = (offset as usize).min(node.data.len());
                let end = (start + len as usize).min(node.data.len());
                Reply::Data(node.data[start..end].to_vec())
            }
            Request::Write { handle, offset, data } => {
                let open = self.open_files.lock();
                let Some(of) = open.get(&handle) else {
                    return Ok(Reply::Error(viper_abi::VError::InvalidHandle.code()));
                };
                let mut tree = self.tree.lock();
                let node = tree.get_mut(&of.path).expect("open file's path stays in the tree");
                let end = offset as usize + data.len();
                if node.data.len() < end {
                    node.data.resize(end, 0);
                }
                node.data[offset as usize..end].copy_from_slice(&data);
                Reply::Written { len: data.len() as u32 }
            }
            Request::Close { handle } => {
                if self.open_files.lock().remove(&handle).is_none() {
                    return Ok(Reply::Error(viper_abi::VError::InvalidHandle.code()));
                }
                Reply::Closed
            }
            Request::Stat { path } => {
                let tree = self.tree.lock();
                let Some(node) = tree.get(&path) else {
                    return Ok(Reply::Error(viper_abi::VError::NotFound.code()));
                };
                Reply::Stat { size: node.data.len() as u64, is_dir: node.is_dir }
            }
            Request::Statfs => self.statfs()?,
            Request::Seek { handle, offset, whence } => {
                let mut open = self.open_files.lock();
                let Some(of) = open.get_mut(&handle) else {
                    return Ok(Reply::Error(viper_abi::VError::InvalidHandle.code()));
                };
                let base: i64 = match whence {
                    Whence::Set => 0,
                    Whence::Cur => of.pos as i64,
                    Whence::End => {
                        let tree = self.tree.lock();
                        let node = tree.get(&of.path).expect("open file's path stays in the tree");
                        node.data.len() as i64
                    }
                };
                let new_pos = base + offset;
                if new_pos < 0 {
                    return Ok(Reply::Error(viper_abi::VError::InvalidArg.code()));
                }
                of.pos = new_pos as u64;
                Reply::Seeked { offset: of.pos }
            }
            Request::Readdir { path } => {
                let tree = self.tree.lock();
                let Some(node) = tree.get(&path) else {
                    return Ok(Reply::Error(viper_abi::VError::NotFound.code()));
                };
                if !node.is_dir {
                    return Ok(Reply::Error(viper_abi::VError::InvalidArg.code()));
                }
                let entries = children_of(&tree, &path).into_iter().map(str::to_string).collect();
                Reply::Dir { entries }
            }
            Request::Mkdir { path } => {
                let mut tree = self.tree.lock();
                if tree.contains_key(&path) {
                    return Ok(Reply::Error(viper_abi::VError::AlreadyExists.code()));
                }
                tree.insert(path, Node { data: Vec::new(), is_dir: true });
                Reply::Mkdired
            }
            Request::Rmdir { path } => {
                let mut tree = self.tree.lock();
                let Some(node) = tree.get(&path) else {
                    return Ok(Reply::Error(viper_abi::VError::NotFound.code()));
                };
                if !node.is_dir {
                    return Ok(Reply::Error(viper_abi::VError::InvalidArg.code()));
                }
                if !children_of(&tree, &path).is_empty() {
                    return Ok(Reply::Error(viper_abi::VError::InvalidArg.code()));
                }
                tree.remove(&path);
                Reply::Rmdired
            }
            Request::Unlink { path } => {
                let mut tree = self.tree.lock();
                match tree.get(&path) {
                    None => return Ok(Reply::Error(viper_abi::VError::NotFound.code())),
                    Some(node) if node.is_dir => return Ok(Reply::Error(viper_abi::VError::InvalidArg.code())),
                    _ => {}
                }
                tree.remove(&path);
                Reply::Unlinked
            }
            Request::Rename { from, to } => {
                let mut tree = self.tree.lock();
                let Some(node) = tree.remove(&from) else {
                    return Ok(Reply::Error(viper_abi::VError::NotFound.code()));
                };
                tree.insert(to, node);
                Reply::Renamed
            }
            Request::Symlink { target, link_path } => {
                let mut tree = self.tree.lock();
                if tree.contains_key(&link_path) {
                    return Ok(Reply::Error(viper_abi::VError::AlreadyExists.code()));
                }
                tree.insert(link_path, Node { data: target.into_bytes(), is_dir: false });
                Reply::Symlinked
            }
            Request::Readlink { path } => {
                let tree = self.tree.lock();
                let Some(node) = tree.get(&path) else {
                    return Ok(Reply::Error(viper_abi::VError::NotFound.code()));
                };
                Reply::Readlink { target: String::from_utf8_lossy(&node.data).into_owned() }
            }
        })
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
            viper_log::warn("fsd", |l| {
                let _ = write!(l, "request carried no reply channel, dropping");
            });
            return Ok(true);
        };
        let reply_channel: ChannelHandle = Handle::from_raw(reply_channel_raw);
        for extra in handles {
            let _ = trap::cap_close(&self.process, extra);
        }

        let reply = match Request::decode(header.ty, body) {
            Ok(request) => self.handle(request)?,
            Err(_) => Reply::Error(viper_abi::VError::InvalidArg.code()),
        };

        let mut out = MsgHeader::new(MsgHeader::reply_ty(header.ty), header.request_id).to_le_bytes().to_vec();
        out.extend_from_slice(&reply.encode_body());
        trap::channel_send(&self.process, reply_channel, out, vec![]).map_err(IpcError::from)?;
        trap::channel_close(&self.process, reply_channel).map_err(IpcError::from)?;
        viper_log::debug("fsd", |l| {
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
    use blkd::BlkdServer;
    use viper_kernel::assign::AssignFlags;

    fn frame(ty: u32, id: u32, body: Vec<u8>) -> Vec<u8> {
        let mut f = MsgHeader::new(ty, id).to_le_bytes().to_vec();
        f.extend_from_slice(&body);
        f
    }

    fn decode_reply(frame: &[u8]) -> Reply {
        let header = MsgHeader::from_le_bytes(frame).unwrap();
        Reply::decode(header.ty & !0x80, &frame[MsgHeader::WIRE_LEN..]).unwrap()
    }

    /// Spins up a loopback blkd, registers it under `assign_names::BLKD`
    /// (each test uses the shared global registry, so callers must not
    /// register the same name twice within one test binary run), and
    /// returns the server-side fsd process plus its client transport.
    fn new_server() -> (Arc<FsdServer>, ChannelEndpointPair) {
        let blkd_process = Arc::new(Process::new("test-blkd"));
        let (service_handle, accept_handle) = trap::channel_create(&blkd_process, 4);
        let connector = blkd_process.caps.query(service_handle).unwrap().object.as_channel().unwrap().clone();
        let _ = viper_kernel::assign::AssignRegistry::global().set(
            assign_names::BLKD,
            service_handle.raw(),
            connector,
            AssignFlags::NONE,
        );
        let blk = BlkdServer::new(16, blkd_process.clone());
        let blkd_transport = viper_ipc::ChannelEndpoint::new(blkd_process, accept_handle);
        std::thread::spawn(move || {
            let _ = blk.run_forever(&blkd_transport);
        });

        let (client, server_endpoint) = viper_ipc::loopback_pair();
        let server = FsdServer::new(server_endpoint.process().clone());
        (server, ChannelEndpointPair { client, server_endpoint })
    }

    struct ChannelEndpointPair {
        client: viper_ipc::ChannelEndpoint,
        server_endpoint: viper_ipc::ChannelEndpoint,
    }

    /// Sends `req` transferring a fresh reply channel, as the server
    /// framework requires, and returns the decoded reply.
    fn call(server: &FsdServer, pair: &ChannelEndpointPair, req: &Request) -> Reply {
        use viper_ipc::Client;
        let (reply_send, reply_recv) = trap::channel_create(pair.client.process(), 1);
        pair.client.send(&frame(req.opcode(), 1, req.encode_body()), &[reply_send.raw()]).unwrap();
        server.run_once(&pair.server_endpoint).unwrap();
        let (reply_frame, _) = loop {
            match trap::channel_recv(pair.client.process(), reply_recv) {
                Ok(got) => break got,
                Err(viper_abi::VError::WouldBlock) => std::thread::yield_now(),
                Err(e) => panic!("reply recv failed: {e:?}"),
            }
        };
        trap::channel_close(pair.client.process(), reply_recv).unwrap();
        decode_reply(&reply_frame)
    }

    #[test]
    fn write_then_read_round_trips() {
        let (server, pair) = new_server();
        let open = Request::Open { path: "/hello".into(), flags: OpenFlags::CREAT | OpenFlags::RDWR };
        let Reply::Opened { handle } = call(&server, &pair, &open) else { panic!("expected Opened") };

        let write = Request::Write { handle, offset: 0, data: b"hi".to_vec() };
        call(&server, &pair, &write);

        let read = Request::Read { handle, offset: 0, len: 2 };
        assert_eq!(call(&server, &pair, &read), Reply::Data(b"hi".to_vec()));
    }

    #[test]
    fn stat_on_missing_path_is_not_found() {
        let (server, pair) = new_server();
        let stat = Request::Stat { path: "/missing".into() };
        assert_eq!(call(&server, &pair, &stat), Reply::Error(viper_abi::VError::NotFound.code()));
    }

    #[test]
    fn statfs_reaches_through_to_blk_client() {
        let (server, pair) = new_server();
        assert_eq!(call(&server, &pair, &Request::Statfs), Reply::Statfs { total_sectors: 16, sector_size: 512 });
    }

    #[test]
    fn seek_end_reports_file_size() {
        let (server, pair) = new_server();
        let open = Request::Open { path: "/seek-me".into(), flags: OpenFlags::CREAT | OpenFlags::RDWR };
        let Reply::Opened { handle } = call(&server, &pair, &open) else { panic!("expected Opened") };
        call(&server, &pair, &Request::Write { handle, offset: 0, data: vec![0u8; 10] });
        let seek = Request::Seek { handle, offset: 0, whence: Whence::End };
        assert_eq!(call(&server, &pair, &seek), Reply::Seeked { offset: 10 });
    }

    #[test]
    fn mkdir_then_readdir_lists_the_new_entry() {
        let (server, pair) = new_server();
        call(&server, &pair, &Request::Mkdir { path: "/sub".into() });
        let open = Request::Open { path: "/sub/file".into(), flags: OpenFlags::CREAT };
        call(&server, &pair, &open);
        let Reply::Dir { mut entries } = call(&server, &pair, &Request::Readdir { path: "/sub".into() }) else {
            panic!("expected Dir")
        };
        entries.sort();
        assert_eq!(entries, vec!["/sub/file".to_string()]);
    }

    #[test]
    fn rmdir_refuses_when_not_empty() {
        let (server, pair) = new_server();
        call(&server, &pair, &Request::Mkdir { path: "/sub".into() });
        call(&server, &pair, &Request::Open { path: "/sub/file".into(), flags: OpenFlags::CREAT });
        assert_eq!(
            call(&server, &pair, &Request::Rmdir { path: "/sub".into() }),
            Reply::Error(viper_abi::VError::InvalidArg.code())
        );
    }

    #[test]
    fn rename_moves_the_node() {
        let (server, pair) = new_server();
        call(&server, &pair, &Request::Open { path: "/a".into(), flags: OpenFlags::CREAT });
        call(&server, &pair, &Request::Rename { from: "/a".into(), to: "/b".into() });
        assert_eq!(
            call(&server, &pair, &Request::Stat { path: "/a".into() }),
            Reply::Error(viper_abi::VError::NotFound.code())
        );
        assert!(matches!(call(&server, &pair, &Request::Stat { path: "/b".into() }), Reply::Stat { .. }));
    }

    #[test]
    fn symlink_then_readlink_round_trips() {
        let (server, pair) = new_server();
        call(&server, &pair, &Request::Symlink { target: "/real".into(), link_path: "/link".into() });
        assert_eq!(
            call(&server, &pair, &Request::Readlink { path: "/link".into() }),
            Reply::Readlink { target: "/real".into() }
        );
    }

    #[test]
    fn unlink_removes_a_file_but_not_a_directory() {
        let (server, pair) = new_server();
        call(&server, &pair, &Request::Mkdir { path: "/sub".into() });
        assert_eq!(
            call(&server, &pair, &Request::Unlink { path: "/sub".into() }),
            Reply::Error(viper_abi::VError::InvalidArg.code())
        );
        call(&server, &pair, &Request::Open { path: "/sub/file".into(), flags: OpenFlags::CREAT });
        call(&server, &pair, &Request::Unlink { path: "/sub/file".into() });
        assert_eq!(
            call(&server, &pair, &Request::Stat { path: "/sub/file".into() }),
            Reply::Error(viper_abi::VError::NotFound.code())
        );
    }
}
