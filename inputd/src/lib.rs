//! inputd: a polled keyboard/mouse surface backed by an injectable event
//! queue. Tests (and, in a real bring-up, a driver below this workspace's
//! scope) push synthetic events through [`InputdServer::inject`].

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicI32, AtomicI32 as AtomicY, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use viper_abi::{Handle, MsgHeader};
use viper_ipc::{IpcError, Server, Wait};
use viper_kernel::{trap, Process};
use viper_protocol::input::{Event, Modifiers, Reply, Request};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("ipc error: {0}")]
    Ipc(#[from] IpcError),
    #[error("wire error: {0}")]
    Wire(#[from] viper_protocol::WireError),
}

pub struct InputdServer {
    process: Arc<Process>,
    queue: Mutex<VecDeque<Event>>,
    modifiers: Mutex<Modifiers>,
    mouse_x: AtomicI32,
    mouse_y: AtomicY,
    mouse_buttons: Mutex<u8>,
}

impl InputdServer {
    pub fn new(process: Arc<Process>) -> Self {
        InputdServer {
            process,
            queue: Mutex::new(VecDeque::new()),
            modifiers: Mutex::new(Modifiers::empty()),
            mouse_x: AtomicI32::new(0),
            mouse_y: AtomicY::new(0),
            mouse_buttons: Mutex::new(0),
        }
    }

    /// Pushes a synthetic event, updating the derived modifier/mouse state
    /// the same way a real keyboard/mouse IRQ handler would.
    pub fn inject(&self, event: Event) {
        match event {
            Event::KeyDown { keycode } => self.set_modifier_for(keycode, true),
            Event::KeyUp { keycode } => self.set_modifier_for(keycode, false),
            Event::MouseMove { x, y } => {
                self.mouse_x.store(x, Ordering::Relaxed);
                self.mouse_y.store(y, Ordering::Relaxed);
            }
            Event::MouseButton { button, pressed } => {
                let mut buttons = self.mouse_buttons.lock();
                if pressed {
                    *buttons |= 1 << button;
                } else {
                    *buttons &= !(1 << button);
                }
            }
        }
        self.queue.lock().push_back(event);
    }

    fn set_modifier_for(&self, keycode: u32, down: bool) {
        let bit = match keycode {
            0xE1 => Modifiers::SHIFT,
            0xE0 => Modifiers::CTRL,
            0xE2 => Modifiers::ALT,
            0xE3 => Modifiers::SUPER,
            _ => return,
        };
        let mut modifiers = self.modifiers.lock();
        modifiers.set(bit, down);
    }

    fn handle(&self, request: Request) -> Reply {
        match request {
            Request::GetChar => {
                let mut queue = self.queue.lock();
                let position = queue.iter().position(|e| matches!(e, Event::KeyDown { keycode } if *keycode < 256));
                match position {
                    Some(i) => {
                        let Event::KeyDown { keycode } = queue.remove(i).unwrap() else { unreachable!() };
                        Reply::Char(Some(keycode as u8))
                    }
                    None => Reply::Char(None),
                }
            }
            Request::GetEvent => Reply::Event(self.queue.lock().pop_front()),
            Request::GetModifiers => Reply::Modifiers(*self.modifiers.lock()),
            Request::HasInput => Reply::HasInput(!self.queue.lock().is_empty()),
            Request::GetMouse => Reply::Mouse {
                x: self.mouse_x.load(Ordering::Relaxed),
                y: self.mouse_y.load(Ordering::Relaxed),
                buttons: *self.mouse_buttons.lock(),
            },
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
            viper_log::warn("inputd", |l| {
                let _ = write!(l, "request carried no reply channel, dropping");
            });
            return Ok(true);
        };
        let reply_channel: viper_kernel::channel::ChannelHandle = Handle::from_raw(reply_channel_raw);
        for extra in handles {
            let _ = trap::cap_close(&self.process, extra);
        }

        let reply = match Request::decode(header.ty, body) {
            Ok(request) => self.handle(request),
            Err(_) => Reply::Error(viper_abi::VError::InvalidArg.code()),
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
