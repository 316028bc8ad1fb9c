//! Client/server IPC traits, wait semantics, and request/reply correlation
//! helpers built atop `viper-kernel`'s simulated channel endpoints.

use std::fmt;
use std::time::Duration;

pub mod service_client;

pub use service_client::ServiceClient;

/// How a `recv` call should behave when nothing is pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    Blocking,
    NonBlocking,
    Timeout(Duration),
}

impl Wait {
    pub fn is_non_blocking(self) -> bool {
        matches!(self, Wait::NonBlocking) || matches!(self, Wait::Timeout(d) if d.is_zero())
    }

    pub fn timeout(self) -> Option<Duration> {
        match self {
            Wait::Timeout(d) => Some(d),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcError {
    WouldBlock,
    Timeout,
    Disconnected,
    Kernel(viper_abi::VError),
}

impl fmt::Display for IpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpcError::WouldBlock => write!(f, "would block"),
            IpcError::Timeout => write!(f, "timed out"),
            IpcError::Disconnected => write!(f, "channel closed"),
            IpcError::Kernel(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for IpcError {}

impl From<viper_abi::VError> for IpcError {
    fn from(err: viper_abi::VError) -> Self {
        match err {
            viper_abi::VError::WouldBlock => IpcError::WouldBlock,
            viper_abi::VError::Timeout => IpcError::Timeout,
            viper_abi::VError::ChannelClosed => IpcError::Disconnected,
            other => IpcError::Kernel(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, IpcError>;

/// The client side of a frame-oriented IPC connection.
pub trait Client: Send + Sync {
    fn send(&self, frame: &[u8], handles: &[u32]) -> Result<()>;
    fn recv(&self, wait: Wait) -> Result<(Vec<u8>, Vec<u32>)>;
    /// The owning process's capability table, for acting on handles this
    /// connection transfers (e.g. `shm_map`-ing a bulk-data reply handle).
    fn process(&self) -> &std::sync::Arc<viper_kernel::Process>;
}

/// The server side of the same connection; the method names mirror
/// `Client`'s because either endpoint of a channel can play either role.
pub trait Server: Send + Sync {
    fn recv(&self, wait: Wait) -> Result<(Vec<u8>, Vec<u32>)>;
    fn send(&self, frame: &[u8], handles: &[u32]) -> Result<()>;
    fn process(&self) -> &std::sync::Arc<viper_kernel::Process>;
}

/// Wraps a `viper-kernel` channel endpoint, driven through its process's
/// syscall-dispatcher-equivalent free functions, in the `Client`/`Server`
/// trait pair.
pub struct ChannelEndpoint {
    process: std::sync::Arc<viper_kernel::Process>,
    handle: viper_kernel::channel::ChannelHandle,
}

impl ChannelEndpoint {
    pub fn new(process: std::sync::Arc<viper_kernel::Process>, handle: viper_kernel::channel::ChannelHandle) -> Self {
        ChannelEndpoint { process, handle }
    }

    fn recv_once(&self) -> Result<(Vec<u8>, Vec<u32>)> {
        Ok(viper_kernel::trap::channel_recv(&self.process, self.handle)?)
    }

    /// The owning process's capability table, for handlers that need to
    /// act on a transferred handle (e.g. `shm_map`/`shm_read` a bulk-data
    /// handle received alongside a request).
    pub fn process(&self) -> &std::sync::Arc<viper_kernel::Process> {
        &self.process
    }
}

impl Drop for ChannelEndpoint {
    /// Closing is implicit on scope exit, matching the client library
    /// pattern's RAII reply-channel guarantee: a dropped endpoint's peer
    /// observes `ChannelClosed` on its next `recv` rather than hanging.
    fn drop(&mut self) {
        let _ = viper_kernel::trap::channel_close(&self.process, self.handle);
    }
}

fn recv_with_wait(this: &ChannelEndpoint, wait: Wait) -> Result<(Vec<u8>, Vec<u32>)> {
    match wait {
        Wait::NonBlocking => this.recv_once(),
        Wait::Blocking => loop {
            match this.recv_once() {
                Err(IpcError::WouldBlock) => std::thread::yield_now(),
                other => return other,
            }
        },
        Wait::Timeout(d) => {
            if d.is_zero() {
                return this.recv_once();
            }
            let deadline = std::time::Instant::now() + d;
            loop {
                match this.recv_once() {
                    Err(IpcError::WouldBlock) => {
                        if std::time::Instant::now() >= deadline {
                            return Err(IpcError::Timeout);
                        }
                        std::thread::yield_now();
                    }
                    other => return other,
                }
            }
        }
    }
}

impl Client for ChannelEndpoint {
    fn send(&self, frame: &[u8], handles: &[u32]) -> Result<()> {
        Ok(viper_kernel::trap::channel_send(&self.process, self.handle, frame.to_vec(), handles.to_vec())?)
    }

    fn recv(&self, wait: Wait) -> Result<(Vec<u8>, Vec<u32>)> {
        recv_with_wait(self, wait)
    }

    fn process(&self) -> &std::sync::Arc<viper_kernel::Process> {
        &self.process
    }
}

impl Server for ChannelEndpoint {
    fn recv(&self, wait: Wait) -> Result<(Vec<u8>, Vec<u32>)> {
        recv_with_wait(self, wait)
    }

    fn send(&self, frame: &[u8], handles: &[u32]) -> Result<()> {
        Ok(viper_kernel::trap::channel_send(&self.process, self.handle, frame.to_vec(), handles.to_vec())?)
    }

    fn process(&self) -> &std::sync::Arc<viper_kernel::Process> {
        &self.process
    }
}

/// Wraps a bare `viper-kernel` channel endpoint obtained from the assign
/// registry (not yet installed in any process's capability table) by
/// installing it into a dedicated owning process, then driving it exactly
/// like `ChannelEndpoint`. A real process/capability table is unavoidable
/// here: sending or receiving transferred handles on this connection must
/// resolve/install them somewhere, and a raw `Endpoint` has nowhere to put
/// them on its own.
pub struct RawChannelEndpoint {
    process: std::sync::Arc<viper_kernel::Process>,
    handle: viper_kernel::channel::ChannelHandle,
}

impl RawChannelEndpoint {
    pub fn new(endpoint: std::sync::Arc<viper_kernel::channel::Endpoint>) -> Self {
        let process = std::sync::Arc::new(viper_kernel::Process::new("raw-endpoint"));
        let handle = process.caps.insert(
            viper_abi::Rights::SEND | viper_abi::Rights::RECV,
            viper_kernel::object::KernelObject::Channel(endpoint),
        );
        RawChannelEndpoint { process, handle }
    }

    fn recv_once(&self) -> Result<(Vec<u8>, Vec<u32>)> {
        Ok(viper_kernel::trap::channel_recv(&self.process, self.handle)?)
    }
}

fn raw_recv_with_wait(this: &RawChannelEndpoint, wait: Wait) -> Result<(Vec<u8>, Vec<u32>)> {
    match wait {
        Wait::NonBlocking => this.recv_once(),
        Wait::Blocking => loop {
            match this.recv_once() {
                Err(IpcError::WouldBlock) => std::thread::yield_now(),
                other => return other,
            }
        },
        Wait::Timeout(d) => {
            if d.is_zero() {
                return this.recv_once();
            }
            let deadline = std::time::Instant::now() + d;
            loop {
                match this.recv_once() {
                    Err(IpcError::WouldBlock) => {
                        if std::time::Instant::now() >= deadline {
                            return Err(IpcError::Timeout);
                        }
                        std::thread::yield_now();
                    }
                    other => return other,
                }
            }
        }
    }
}

impl Client for RawChannelEndpoint {
    fn send(&self, frame: &[u8], handles: &[u32]) -> Result<()> {
        Ok(viper_kernel::trap::channel_send(&self.process, self.handle, frame.to_vec(), handles.to_vec())?)
    }

    fn recv(&self, wait: Wait) -> Result<(Vec<u8>, Vec<u32>)> {
        raw_recv_with_wait(self, wait)
    }

    fn process(&self) -> &std::sync::Arc<viper_kernel::Process> {
        &self.process
    }
}

impl Server for RawChannelEndpoint {
    fn recv(&self, wait: Wait) -> Result<(Vec<u8>, Vec<u32>)> {
        raw_recv_with_wait(self, wait)
    }

    fn send(&self, frame: &[u8], handles: &[u32]) -> Result<()> {
        Ok(viper_kernel::trap::channel_send(&self.process, self.handle, frame.to_vec(), handles.to_vec())?)
    }

    fn process(&self) -> &std::sync::Arc<viper_kernel::Process> {
        &self.process
    }
}

/// Builds a connected, in-process client/server pair for tests, the way
/// the teacher's `loopback_channel` does.
pub fn loopback_pair() -> (ChannelEndpoint, ChannelEndpoint) {
    let process = std::sync::Arc::new(viper_kernel::Process::new("loopback"));
    let (ha, hb) = viper_kernel::trap::channel_create(&process, viper_abi::config::channel_fifo_depth());
    (
        ChannelEndpoint::new(process.clone(), ha),
        ChannelEndpoint::new(process, hb),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_roundtrip() {
        let (client, server) = loopback_pair();
        client.send(&[1, 2, 3], &[]).unwrap();
        let (frame, _) = server.recv(Wait::Blocking).unwrap();
        assert_eq!(frame, vec![1, 2, 3]);
    }

    #[test]
    fn recv_timeout_on_empty_channel() {
        let (_client, server) = loopback_pair();
        let err = server.recv(Wait::Timeout(Duration::from_millis(10))).unwrap_err();
        assert_eq!(err, IpcError::Timeout);
    }

    #[test]
    fn non_blocking_recv_on_empty_channel_would_block() {
        let (_client, server) = loopback_pair();
        assert_eq!(server.recv(Wait::NonBlocking).unwrap_err(), IpcError::WouldBlock);
    }
}
