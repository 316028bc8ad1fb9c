//! netd: a loopback-only socket table plus a tiny built-in hosts table,
//! standing in for the excluded TCP/IP stack.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use viper_abi::{Handle, MsgHeader};
use viper_ipc::{IpcError, Server, Wait};
use viper_kernel::channel::{Endpoint, Message};
use viper_kernel::{trap, Process};
use viper_protocol::net::{Reply, Request};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("ipc error: {0}")]
    Ipc(#[from] IpcError),
    #[error("wire error: {0}")]
    Wire(#[from] viper_protocol::WireError),
}

struct Socket {
    inbox: Vec<u8>,
    connected: bool,
    addr: [u8; 4],
    port: u16,
    subscriber: Option<Arc<Endpoint>>,
}

pub struct NetdServer {
    process: Arc<Process>,
    hosts: HashMap<&'static str, [u8; 4]>,
    sockets: Mutex<HashMap<u32, Socket>>,
    next_handle: AtomicU32,
}

impl NetdServer {
    pub fn new(process: Arc<Process>) -> Self {
        let mut hosts = HashMap::new();
        hosts.insert("localhost", [127, 0, 0, 1]);
        NetdServer { process, hosts, sockets: Mutex::new(HashMap::new()), next_handle: AtomicU32::new(1) }
    }

    /// Notifies a socket's subscriber, if any, that its readable state
    /// changed. The channel's bounded queue does the coalescing: if a
    /// wakeup is already pending and unread, this returns `Busy` and is
    /// dropped rather than queued, so a burst of activity produces at
    /// most one outstanding notification.
    fn notify(socket: &Socket) {
        if let Some(endpoint) = &socket.subscriber {
            let _ = endpoint.send(Message::new(Vec::new(), Vec::new()).expect("empty message always fits"));
        }
    }

    fn handle(&self, request: Request, extra_handles: &[u32]) -> Reply {
        match request {
            Request::SocketCreate => {
                let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
                self.sockets.lock().insert(
                    handle,
                    Socket { inbox: Vec::new(), connected: false, addr: [0; 4], port: 0, subscriber: None },
                );
                Reply::Created { handle }
            }
            Request::SocketConnect { handle, addr, port } => {
                let mut sockets = self.sockets.lock();
                let Some(socket) = sockets.get_mut(&handle) else {
                    return Reply::Error(viper_abi::VError::InvalidHandle.code());
                };
                socket.connected = true;
                socket.addr = addr;
                socket.port = port;
                Reply::Connected
            }
            Request::SocketSend { handle, data } => {
                let mut sockets = self.sockets.lock();
                let Some(socket) = sockets.get_mut(&handle) else {
                    return Reply::Error(viper_abi::VError::InvalidHandle.code());
                };
                if !socket.connected {
                    return Reply::Error(viper_abi::VError::InvalidArg.code());
                }
                // Loopback: whatever is sent becomes available to read back.
                socket.inbox.extend_from_slice(&data);
                let len = data.len() as u32;
                Self::notify(socket);
                Reply::Sent { len }
            }
            Request::SocketRecv { handle, max_len } => {
                let mut sockets = self.sockets.lock();
                let Some(socket) = sockets.get_mut(&handle) else {
                    return Reply::Error(viper_abi::VError::InvalidHandle.code());
                };
                let take = (max_len as usize).min(socket.inbox.len());
                Reply::Data(socket.inbox.drain(..take).collect())
            }
            Request::SocketClose { handle } => {
                if self.sockets.lock().remove(&handle).is_none() {
                    return Reply::Error(viper_abi::VError::InvalidHandle.code());
                }
                Reply::Closed
            }
            Request::SocketStatus { handle } => {
                let sockets = self.sockets.lock();
                let Some(socket) = sockets.get(&handle) else {
                    return Reply::Error(viper_abi::VError::InvalidHandle.code());
                };
                Reply::Status {
                    connected: socket.connected,
                    addr: socket.addr,
                    port: socket.port,
                    pending: socket.inbox.len() as u32,
                }
            }
            Request::DnsResolve { name } => match self.hosts.get(name.as_str()) {
                Some(addr) => Reply::Resolved { addr: *addr },
                None => Reply::Error(viper_abi::VError::NotFound.code()),
            },
            Request::SubscribeEvents { handle } => {
                let Some(&sub_raw) = extra_handles.first() else {
                    return Reply::Error(viper_abi::VError::InvalidArg.code());
                };
                let sub_handle: viper_kernel::channel::ChannelHandle = Handle::from_raw(sub_raw);
                let Ok(entry) = self.process.caps.query(sub_handle) else {
                    return Reply::Error(viper_abi::VError::InvalidHandle.code());
                };
                let Some(endpoint) = entry.object.as_channel().cloned() else {
                    return Reply::Error(viper_abi::VError::InvalidArg.code());
                };
                let _ = trap::cap_close(&self.process, sub_raw);

                let mut sockets = self.sockets.lock();
                let Some(socket) = sockets.get_mut(&handle) else {
                    return Reply::Error(viper_abi::VError::InvalidHandle.code());
                };
                socket.subscriber = Some(endpoint);
                Reply::Subscribed
            }
        }
    }

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
            viper_log::warn("netd", |l| {
                let _ = write!(l, "request carried no reply channel, dropping");
            });
            return Ok(true);
        };
        let reply_channel: viper_kernel::channel::ChannelHandle = Handle::from_raw(reply_channel_raw);
        let extra_handles: Vec<u32> = handles.collect();

        let reply = match Request::decode(header.ty, body) {
            Ok(request) => {
                let reply = self.handle(request, &extra_handles);
                let consumed = matches!(reply, Reply::Subscribed);
                if !consumed {
                    for extra in &extra_handles {
                        let _ = trap::cap_close(&self.process, *extra);
                    }
                }
                reply
            }
            Err(_) => {
                for extra in &extra_handles {
                    let _ = trap::cap_close(&self.process, *extra);
                }
                Reply::Error(viper_abi::VError::InvalidArg.code())
            }
        };

        let mut out = MsgHeader::new(MsgHeader::reply_ty(header.ty), header.request_id).to_le_bytes().to_vec();
        out.extend_from_slice(&reply.encode_body());
        trap::channel_send(&self.process, reply_channel, out, vec![]).map_err(IpcError::from)?;
        trap::channel_close(&self.process, reply_channel).map_err(IpcError::from)?;
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

    fn new_server() -> (NetdServer, viper_ipc::ChannelEndpoint, viper_ipc::ChannelEndpoint) {
        let (client, server_endpoint) = viper_ipc::loopback_pair();
        let process = server_endpoint.process().clone();
        (NetdServer::new(process), client, server_endpoint)
    }

    /// Mirrors the C9 client library pattern by hand: creates a fresh reply
    /// channel, transfers it (plus any extra handles) with the request,
    /// drives one server iteration, and decodes the reply.
    fn call(
        server: &NetdServer,
        server_endpoint: &viper_ipc::ChannelEndpoint,
        client: &viper_ipc::ChannelEndpoint,
        req: Request,
        extra: &[u32],
    ) -> (Reply, Vec<u32>) {
        let process = client.process().clone();
        let (reply_send, reply_recv) = trap::channel_create(&process, 1);
        let mut handles = vec![reply_send.raw()];
        handles.extend_from_slice(extra);

        let mut frame = MsgHeader::new(req.opcode(), 1).to_le_bytes().to_vec();
        frame.extend_from_slice(&req.encode_body());
        client.send(&frame, &handles).unwrap();

        server.run_once(server_endpoint).unwrap();

        let (reply_frame, reply_handles) = trap::channel_recv(&process, reply_recv).unwrap();
        let _ = trap::channel_close(&process, reply_recv);
        let header = MsgHeader::from_le_bytes(&reply_frame).unwrap();
        let reply = Reply::decode(header.ty & !0x80, &reply_frame[MsgHeader::WIRE_LEN..]).unwrap();
        (reply, reply_handles)
    }

    #[test]
    fn create_connect_then_send_recv_round_trips() {
        let (server, client, server_endpoint) = new_server();

        let (Reply::Created { handle }, _) = call(&server, &server_endpoint, &client, Request::SocketCreate, &[])
        else {
            panic!("expected Created")
        };

        let connect = Request::SocketConnect { handle, addr: [127, 0, 0, 1], port: 80 };
        assert_eq!(call(&server, &server_endpoint, &client, connect, &[]).0, Reply::Connected);

        let send = Request::SocketSend { handle, data: b"hi".to_vec() };
        assert_eq!(call(&server, &server_endpoint, &client, send, &[]).0, Reply::Sent { len: 2 });

        let recv = Request::SocketRecv { handle, max_len: 10 };
        assert_eq!(call(&server, &server_endpoint, &client, recv, &[]).0, Reply::Data(b"hi".to_vec()));
    }

    #[test]
    fn send_before_connect_is_rejected() {
        let (server, client, server_endpoint) = new_server();
        let (Reply::Created { handle }, _) = call(&server, &server_endpoint, &client, Request::SocketCreate, &[])
        else {
            panic!("expected Created")
        };
        let send = Request::SocketSend { handle, data: b"hi".to_vec() };
        assert_eq!(
            call(&server, &server_endpoint, &client, send, &[]).0,
            Reply::Error(viper_abi::VError::InvalidArg.code())
        );
    }

    #[test]
    fn status_reports_pending_bytes() {
        let (server, client, server_endpoint) = new_server();
        let (Reply::Created { handle }, _) = call(&server, &server_endpoint, &client, Request::SocketCreate, &[])
        else {
            panic!("expected Created")
        };
        call(&server, &server_endpoint, &client, Request::SocketConnect { handle, addr: [10, 0, 0, 1], port: 9000 }, &[]);
        call(&server, &server_endpoint, &client, Request::SocketSend { handle, data: b"abc".to_vec() }, &[]);

        let (status, _) = call(&server, &server_endpoint, &client, Request::SocketStatus { handle }, &[]);
        assert_eq!(status, Reply::Status { connected: true, addr: [10, 0, 0, 1], port: 9000, pending: 3 });
    }

    #[test]
    fn subscribing_delivers_a_coalesced_notification_on_send() {
        let (server, client, server_endpoint) = new_server();
        let process = client.process().clone();

        let (Reply::Created { handle }, _) = call(&server, &server_endpoint, &client, Request::SocketCreate, &[])
        else {
            panic!("expected Created")
        };
        call(&server, &server_endpoint, &client, Request::SocketConnect { handle, addr: [1, 2, 3, 4], port: 1 }, &[]);

        let (notify_send, notify_recv) = trap::channel_create(&process, 1);
        let (subscribed, _) =
            call(&server, &server_endpoint, &client, Request::SubscribeEvents { handle }, &[notify_send.raw()]);
        assert_eq!(subscribed, Reply::Subscribed);

        call(&server, &server_endpoint, &client, Request::SocketSend { handle, data: b"x".to_vec() }, &[]);
        let (_frame, _) = trap::channel_recv(&process, notify_recv).expect("a notification should be pending");

        // A second send while the first notification is still unread is
        // coalesced: the bounded queue reports `Busy` and the wakeup is
        // dropped rather than queued, so nothing new is waiting yet.
        call(&server, &server_endpoint, &client, Request::SocketSend { handle, data: b"y".to_vec() }, &[]);
        assert_eq!(trap::channel_recv(&process, notify_recv).unwrap_err(), viper_abi::VError::WouldBlock);
    }

    #[test]
    fn dns_resolve_known_host() {
        let (server, client, server_endpoint) = new_server();
        let req = Request::DnsResolve { name: "localhost".into() };
        assert_eq!(
            call(&server, &server_endpoint, &client, req, &[]).0,
            Reply::Resolved { addr: [127, 0, 0, 1] }
        );
    }

    #[test]
    fn dns_resolve_unknown_host_not_found() {
        let (server, client, server_endpoint) = new_server();
        let req = Request::DnsResolve { name: "example.invalid".into() };
        assert_eq!(
            call(&server, &server_endpoint, &client, req, &[]).0,
            Reply::Error(viper_abi::VError::NotFound.code())
        );
    }

    #[test]
    fn close_unknown_handle_is_invalid() {
        let (server, client, server_endpoint) = new_server();
        let req = Request::SocketClose { handle: 999 };
        assert_eq!(
            call(&server, &server_endpoint, &client, req, &[]).0,
            Reply::Error(viper_abi::VError::InvalidHandle.code())
        );
    }
}
