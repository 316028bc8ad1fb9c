//! The client library pattern (spec component C9): lazy-connect on first
//! call, then a fresh reply channel created and transferred per request,
//! closed again before the call returns.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use viper_abi::{MsgHeader, Rights};
use viper_kernel::assign::AssignRegistry;
use viper_kernel::channel::ChannelHandle;
use viper_kernel::object::KernelObject;
use viper_kernel::{trap, Process};

use crate::{IpcError, Result};

const REPLY_CHANNEL_DEPTH: usize = 1;
const CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// A lazily-connecting client for one of the canonical named services.
/// Resolves the service's connector through the assign registry on first
/// `call` and keeps sending requests on it; each individual `call`,
/// however, creates its own reply channel, transfers its send endpoint as
/// the first handle, and closes the receive endpoint again before
/// returning — exactly one reply channel per call, per the client library
/// convention every canonical service protocol relies on.
pub struct ServiceClient {
    name: &'static str,
    process: Arc<Process>,
    connector: Mutex<Option<ChannelHandle>>,
}

impl ServiceClient {
    pub fn new(name: &'static str) -> Self {
        ServiceClient {
            name,
            process: Arc::new(Process::new(name)),
            connector: Mutex::new(None),
        }
    }

    fn ensure_connected(&self) -> Result<ChannelHandle> {
        let mut guard = self.connector.lock();
        if let Some(handle) = *guard {
            return Ok(handle);
        }
        let entry = AssignRegistry::global().get(self.name).map_err(|_| IpcError::Disconnected)?;
        let handle: ChannelHandle =
            self.process.caps.insert(Rights::SEND, KernelObject::Channel(entry.connector));
        *guard = Some(handle);
        Ok(handle)
    }

    /// Sends `request_ty`/`body`, transferring `send_handles` (e.g. a bulk
    /// SHM handle for a write) alongside a freshly created reply channel,
    /// and waits for the matching reply. Any transferred handles on the
    /// reply beyond `expected_reply_handles` are closed here as
    /// unexpected; the caller receives at most `expected_reply_handles` of
    /// them, in the order the server sent them.
    pub fn call(
        &self,
        request_ty: u32,
        body: &[u8],
        send_handles: &[u32],
        expected_reply_handles: usize,
    ) -> Result<(Vec<u8>, Vec<u32>)> {
        let connector = self.ensure_connected()?;

        let (reply_send, reply_recv) = trap::channel_create(&self.process, REPLY_CHANNEL_DEPTH);

        let mut transfers = Vec::with_capacity(1 + send_handles.len());
        transfers.push(reply_send.raw());
        transfers.extend_from_slice(send_handles);

        let mut frame = MsgHeader::new(request_ty, 0).to_le_bytes().to_vec();
        frame.extend_from_slice(body);

        if let Err(err) = trap::channel_send(&self.process, connector, frame, transfers) {
            let _ = trap::channel_close(&self.process, reply_recv);
            return Err(err.into());
        }

        let received = recv_reply(&self.process, reply_recv, CALL_TIMEOUT);
        let _ = trap::channel_close(&self.process, reply_recv);

        let (frame, mut handles) = received?;
        if handles.len() > expected_reply_handles {
            for extra in handles.split_off(expected_reply_handles) {
                let _ = trap::cap_close(&self.process, extra);
            }
        }
        Ok((frame[MsgHeader::WIRE_LEN..].to_vec(), handles))
    }
}

fn recv_reply(process: &Process, handle: ChannelHandle, timeout: Duration) -> Result<(Vec<u8>, Vec<u32>)> {
    let deadline = Instant::now() + timeout;
    loop {
        match trap::channel_recv(process, handle) {
            Ok(reply) => return Ok(reply),
            Err(viper_abi::VError::WouldBlock) => {
                if Instant::now() >= deadline {
                    return Err(IpcError::Timeout);
                }
                std::thread::yield_now();
            }
            Err(err) => return Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use viper_kernel::assign::AssignFlags;

    #[test]
    fn call_creates_and_closes_a_fresh_reply_channel_each_time() {
        let server_process = Arc::new(Process::new("test-server"));
        let (service_handle, accept_handle) = trap::channel_create(&server_process, 4);
        let entry_connector = server_process.caps.query(service_handle).unwrap().object.as_channel().unwrap().clone();

        let name: &'static str = "test-echo-service";
        AssignRegistry::global()
            .set(name, 1, entry_connector, AssignFlags::NONE)
            .expect("unique test service name");

        let client = ServiceClient::new(name);
        let reply_thread = std::thread::spawn(move || {
            let (frame, handles) = loop {
                match trap::channel_recv(&server_process, accept_handle) {
                    Ok(got) => break got,
                    Err(viper_abi::VError::WouldBlock) => std::thread::yield_now(),
                    Err(e) => panic!("unexpected recv error: {e:?}"),
                }
            };
            assert_eq!(handles.len(), 1, "reply-channel send endpoint must be transferred");
            let reply_send: ChannelHandle = viper_abi::Handle::from_raw(handles[0]);

            let header = MsgHeader::from_le_bytes(&frame).unwrap();
            let mut reply = MsgHeader::new(MsgHeader::reply_ty(header.ty), header.request_id).to_le_bytes().to_vec();
            reply.extend_from_slice(b"pong");
            trap::channel_send(&server_process, reply_send, reply, vec![]).unwrap();
        });

        let (reply, handles) = client.call(1, b"ping", &[], 0).unwrap();
        assert_eq!(reply, b"pong");
        assert!(handles.is_empty());
        reply_thread.join().unwrap();
    }

    #[test]
    fn unexpected_reply_handles_beyond_the_requested_count_are_closed() {
        let server_process = Arc::new(Process::new("test-server-2"));
        let (service_handle, accept_handle) = trap::channel_create(&server_process, 4);
        let entry_connector = server_process.caps.query(service_handle).unwrap().object.as_channel().unwrap().clone();

        let name: &'static str = "test-echo-service-extra-handle";
        AssignRegistry::global()
            .set(name, 1, entry_connector, AssignFlags::NONE)
            .expect("unique test service name");

        let client = ServiceClient::new(name);
        let reply_thread = std::thread::spawn(move || {
            let (frame, handles) = loop {
                match trap::channel_recv(&server_process, accept_handle) {
                    Ok(got) => break got,
                    Err(viper_abi::VError::WouldBlock) => std::thread::yield_now(),
                    Err(e) => panic!("unexpected recv error: {e:?}"),
                }
            };
            let reply_send: ChannelHandle = viper_abi::Handle::from_raw(handles[0]);
            let bonus = trap::shm_create(&server_process, 4);

            let header = MsgHeader::from_le_bytes(&frame).unwrap();
            let reply = MsgHeader::new(MsgHeader::reply_ty(header.ty), header.request_id).to_le_bytes().to_vec();
            trap::channel_send(&server_process, reply_send, reply, vec![bonus.raw()]).unwrap();
        });

        let (_reply, handles) = client.call(1, b"ping", &[], 0).unwrap();
        assert!(handles.is_empty(), "unrequested handle should have been closed, not returned");
        reply_thread.join().unwrap();
    }

    #[test]
    fn call_against_unregistered_name_reports_disconnected() {
        let client = ServiceClient::new("nothing-registered-here");
        assert_eq!(client.call(1, b"x", &[], 0).unwrap_err(), IpcError::Disconnected);
    }

    #[test]
    fn recv_reply_times_out_if_nothing_arrives() {
        let process = Arc::new(Process::new("test-waiter"));
        let (_send, recv) = trap::channel_create(&process, 1);
        let got = recv_reply(&process, recv, Duration::from_millis(20));
        assert_eq!(got.unwrap_err(), IpcError::Timeout);
    }
}
