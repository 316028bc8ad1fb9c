//! Bidirectional bounded-FIFO channel endpoints (spec component C2).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use viper_abi::{Handle, MAX_HANDLES_PER_MSG, MAX_PAYLOAD};
use viper_abi::VError;

use crate::captable::CapEntry;
use crate::object::KernelObject;
use crate::pollset::{PollMask, Pollable};

/// A single IPC message: an inline payload plus a handful of capability
/// entries being transferred to the receiving process. `transfers` holds
/// the actual `(rights, object)` pairs rather than raw handle numbers —
/// the receiving process's handle values for them only exist once
/// `trap::channel_recv` installs each entry into its own capability
/// table, since a raw index is only meaningful within the table that
/// minted it.
#[derive(Clone, Default)]
pub struct Message {
    pub payload: Vec<u8>,
    pub transfers: Vec<CapEntry>,
}

impl Message {
    pub fn new(payload: Vec<u8>, transfers: Vec<CapEntry>) -> Result<Self, VError> {
        if payload.len() > MAX_PAYLOAD || transfers.len() > MAX_HANDLES_PER_MSG {
            return Err(VError::MsgTooLarge);
        }
        Ok(Message { payload, transfers })
    }
}

struct Queue {
    messages: Mutex<VecDeque<Message>>,
    depth: usize,
}

impl Queue {
    fn new(depth: usize) -> Self {
        Queue { messages: Mutex::new(VecDeque::with_capacity(depth)), depth }
    }
}

struct Shared {
    /// Messages flowing from endpoint A to endpoint B.
    a_to_b: Queue,
    /// Messages flowing from endpoint B to endpoint A.
    b_to_a: Queue,
    closed: AtomicBool,
}

/// One side of a channel. Cloning an `Endpoint` is how `channel_send`'s
/// handle-transfer of the channel itself would be modeled at a higher
/// layer; the endpoint itself is never silently duplicated by this type.
#[derive(Clone)]
pub struct Endpoint {
    shared: Arc<Shared>,
    is_a: bool,
}

/// Creates a connected pair of endpoints with the given FIFO depth per
/// direction.
pub fn pair(depth: usize) -> (Endpoint, Endpoint) {
    let shared = Arc::new(Shared {
        a_to_b: Queue::new(depth),
        b_to_a: Queue::new(depth),
        closed: AtomicBool::new(false),
    });
    (
        Endpoint { shared: shared.clone(), is_a: true },
        Endpoint { shared, is_a: false },
    )
}

impl Endpoint {
    fn outbound(&self) -> &Queue {
        if self.is_a { &self.shared.a_to_b } else { &self.shared.b_to_a }
    }

    fn inbound(&self) -> &Queue {
        if self.is_a { &self.shared.b_to_a } else { &self.shared.a_to_b }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
    }

    /// Non-blocking send. Returns `MsgTooLarge` or `ChannelClosed` as
    /// appropriate; returns `Busy` if the outbound queue is at capacity,
    /// since only `channel_recv` is specified to ever yield `WouldBlock`.
    pub fn send(&self, message: Message) -> Result<(), VError> {
        if self.is_closed() {
            return Err(VError::ChannelClosed);
        }
        let queue = self.outbound();
        let mut messages = queue.messages.lock();
        if messages.len() >= queue.depth {
            return Err(VError::Busy);
        }
        messages.push_back(message);
        Ok(())
    }

    /// Non-blocking receive: pops the oldest pending message, or reports
    /// `WouldBlock`/`ChannelClosed`.
    pub fn try_recv(&self) -> Result<Message, VError> {
        let queue = self.inbound();
        if let Some(message) = queue.messages.lock().pop_front() {
            return Ok(message);
        }
        if self.is_closed() {
            return Err(VError::ChannelClosed);
        }
        Err(VError::WouldBlock)
    }

    pub fn pending_count(&self) -> usize {
        self.inbound().messages.lock().len()
    }
}

impl Pollable for Endpoint {
    fn readiness(&self) -> PollMask {
        let mut mask = PollMask::empty();
        if !self.inbound().messages.lock().is_empty() {
            mask |= PollMask::RECV;
        }
        let queue = self.outbound();
        if queue.messages.lock().len() < queue.depth {
            mask |= PollMask::SEND;
        }
        if self.is_closed() {
            mask |= PollMask::HUP;
        }
        mask
    }
}

pub struct Channel;

pub fn wrap(endpoint: Endpoint) -> KernelObject {
    KernelObject::Channel(Arc::new(endpoint))
}

pub type ChannelHandle = Handle<Channel>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_then_recv_roundtrip() {
        let (a, b) = pair(4);
        a.send(Message::new(vec![1, 2, 3], vec![]).unwrap()).unwrap();
        let got = b.try_recv().unwrap();
        assert_eq!(got.payload, vec![1, 2, 3]);
    }

    #[test]
    fn recv_on_empty_channel_would_block() {
        let (_a, b) = pair(4);
        assert_eq!(b.try_recv().unwrap_err(), VError::WouldBlock);
    }

    #[test]
    fn recv_after_close_reports_closed_not_would_block() {
        let (a, b) = pair(4);
        a.close();
        assert_eq!(b.try_recv().unwrap_err(), VError::ChannelClosed);
    }

    #[test]
    fn send_past_depth_is_busy_not_blocking() {
        let (a, _b) = pair(1);
        a.send(Message::new(vec![], vec![]).unwrap()).unwrap();
        assert_eq!(a.send(Message::new(vec![], vec![]).unwrap()).unwrap_err(), VError::Busy);
    }

    #[test]
    fn oversized_payload_is_rejected_before_queuing() {
        let oversized = vec![0u8; MAX_PAYLOAD + 1];
        assert_eq!(Message::new(oversized, vec![]).unwrap_err(), VError::MsgTooLarge);
    }

    #[test]
    fn per_channel_fifo_ordering_is_preserved() {
        let (a, b) = pair(8);
        for i in 0..5u8 {
            a.send(Message::new(vec![i], vec![]).unwrap()).unwrap();
        }
        for i in 0..5u8 {
            assert_eq!(b.try_recv().unwrap().payload, vec![i]);
        }
    }
}
