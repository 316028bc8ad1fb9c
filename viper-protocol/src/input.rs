//! inputd wire protocol: polled character/event/modifier/mouse access
//! over an injectable event queue (no real keyboard IRQ in this
//! workspace).

use crate::wire::{Reader, WireError, Writer};

pub const OP_GET_CHAR: u32 = 1;
pub const OP_GET_EVENT: u32 = 2;
pub const OP_GET_MODIFIERS: u32 = 3;
pub const OP_HAS_INPUT: u32 = 4;
pub const OP_GET_MOUSE: u32 = 5;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Modifiers: u32 {
        const SHIFT = 1 << 0;
        const CTRL  = 1 << 1;
        const ALT   = 1 << 2;
        const SUPER = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    KeyDown { keycode: u32 },
    KeyUp { keycode: u32 },
    MouseMove { x: i32, y: i32 },
    MouseButton { button: u8, pressed: bool },
}

impl Event {
    const TAG_KEY_DOWN: u8 = 1;
    const TAG_KEY_UP: u8 = 2;
    const TAG_MOUSE_MOVE: u8 = 3;
    const TAG_MOUSE_BUTTON: u8 = 4;

    fn encode(&self, w: &mut Writer) {
        match self {
            Event::KeyDown { keycode } => {
                w.u8(Self::TAG_KEY_DOWN).u32(*keycode);
            }
            Event::KeyUp { keycode } => {
                w.u8(Self::TAG_KEY_UP).u32(*keycode);
            }
            Event::MouseMove { x, y } => {
                w.u8(Self::TAG_MOUSE_MOVE).i32(*x).i32(*y);
            }
            Event::MouseButton { button, pressed } => {
                w.u8(Self::TAG_MOUSE_BUTTON).u8(*button).u8(*pressed as u8);
            }
        }
    }

    fn decode(r: &mut Reader) -> Result<Self, WireError> {
        Ok(match r.u8()? {
            Self::TAG_KEY_DOWN => Event::KeyDown { keycode: r.u32()? },
            Self::TAG_KEY_UP => Event::KeyUp { keycode: r.u32()? },
            Self::TAG_MOUSE_MOVE => Event::MouseMove { x: r.i32()?, y: r.i32()? },
            Self::TAG_MOUSE_BUTTON => Event::MouseButton { button: r.u8()?, pressed: r.u8()? != 0 },
            _ => return Err(WireError::BadOpcode),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    GetChar,
    GetEvent,
    GetModifiers,
    HasInput,
    GetMouse,
}

impl Request {
    pub fn opcode(&self) -> u32 {
        match self {
            Request::GetChar => OP_GET_CHAR,
            Request::GetEvent => OP_GET_EVENT,
            Request::GetModifiers => OP_GET_MODIFIERS,
            Request::HasInput => OP_HAS_INPUT,
            Request::GetMouse => OP_GET_MOUSE,
        }
    }

    pub fn encode_body(&self) -> Vec<u8> {
        Vec::new()
    }

    pub fn decode(opcode: u32, _body: &[u8]) -> Result<Self, WireError> {
        Ok(match opcode {
            OP_GET_CHAR => Request::GetChar,
            OP_GET_EVENT => Request::GetEvent,
            OP_GET_MODIFIERS => Request::GetModifiers,
            OP_HAS_INPUT => Request::HasInput,
            OP_GET_MOUSE => Request::GetMouse,
            _ => return Err(WireError::BadOpcode),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Char(Option<u8>),
    Event(Option<Event>),
    Modifiers(Modifiers),
    HasInput(bool),
    Mouse { x: i32, y: i32, buttons: u8 },
    Error(i32),
}

impl Reply {
    pub fn encode_body(&self) -> Vec<u8> {
        let mut w = Writer::new();
        match self {
            Reply::Char(c) => {
                w.i32(0).u8(c.is_some() as u8).u8(c.unwrap_or(0));
            }
            Reply::Event(e) => {
                w.i32(0).u8(e.is_some() as u8);
                if let Some(e) = e {
                    e.encode(&mut w);
                }
            }
            Reply::Modifiers(m) => {
                w.i32(0).u32(m.bits());
            }
            Reply::HasInput(b) => {
                w.i32(0).u8(*b as u8);
            }
            Reply::Mouse { x, y, buttons } => {
                w.i32(0).i32(*x).i32(*y).u8(*buttons);
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
            OP_GET_CHAR => {
                let present = r.u8()? != 0;
                let c = r.u8()?;
                Reply::Char(present.then_some(c))
            }
            OP_GET_EVENT => {
                let present = r.u8()? != 0;
                Reply::Event(if present { Some(Event::decode(&mut r)?) } else { None })
            }
            OP_GET_MODIFIERS => Reply::Modifiers(Modifiers::from_bits_truncate(r.u32()?)),
            OP_HAS_INPUT => Reply::HasInput(r.u8()? != 0),
            OP_GET_MOUSE => Reply::Mouse { x: r.i32()?, y: r.i32()?, buttons: r.u8()? },
            _ => return Err(WireError::BadOpcode),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_event_roundtrip() {
        let reply = Reply::Event(Some(Event::KeyDown { keycode: 65 }));
        let decoded = Reply::decode(OP_GET_EVENT, &reply.encode_body()).unwrap();
        assert_eq!(decoded, reply);
    }

    #[test]
    fn no_pending_event_roundtrip() {
        let reply = Reply::Event(None);
        let decoded = Reply::decode(OP_GET_EVENT, &reply.encode_body()).unwrap();
        assert_eq!(decoded, reply);
    }

    #[test]
    fn mouse_reply_roundtrip() {
        let reply = Reply::Mouse { x: -5, y: 12, buttons: 0b011 };
        let decoded = Reply::decode(OP_GET_MOUSE, &reply.encode_body()).unwrap();
        assert_eq!(decoded, reply);
    }
}
