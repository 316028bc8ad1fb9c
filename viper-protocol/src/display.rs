//! displayd wire protocol: a surface table with z-order, geometry, and
//! visibility, composited into a single canvas on `Present` (no real
//! framebuffer). Bulk pixel data never rides in the payload — `Present`
//! and `CreateSurface`'s backing buffer both travel as transferred SHM
//! handles, per the bulk-transfer convention every canonical protocol
//! with more than a few bytes of payload follows.

use crate::wire::{Reader, WireError, Writer};

pub const OP_CREATE_SURFACE: u32 = 1;
pub const OP_DESTROY_SURFACE: u32 = 2;
pub const OP_SET_GEOMETRY: u32 = 3;
pub const OP_PRESENT: u32 = 4;
pub const OP_SET_Z_ORDER: u32 = 5;
pub const OP_GET_INFO: u32 = 6;
pub const OP_SET_VISIBLE: u32 = 7;
pub const OP_SET_TITLE: u32 = 8;
pub const OP_POLL_EVENT: u32 = 9;
pub const OP_LIST_WINDOWS: u32 = 10;
pub const OP_RESTORE_WINDOW: u32 = 11;

pub const MAX_TITLE_LEN: usize = 128;
pub const MAX_WINDOW_LIST: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowEvent {
    Closed { id: u32 },
    Resized { id: u32, width: u32, height: u32 },
}

impl WindowEvent {
    const TAG_CLOSED: u8 = 1;
    const TAG_RESIZED: u8 = 2;

    fn encode(&self, w: &mut Writer) {
        match self {
            WindowEvent::Closed { id } => {
                w.u8(Self::TAG_CLOSED).u32(*id);
            }
            WindowEvent::Resized { id, width, height } => {
                w.u8(Self::TAG_RESIZED).u32(*id).u32(*width).u32(*height);
            }
        }
    }

    fn decode(r: &mut Reader) -> Result<Self, WireError> {
        Ok(match r.u8()? {
            Self::TAG_CLOSED => WindowEvent::Closed { id: r.u32()? },
            Self::TAG_RESIZED => WindowEvent::Resized { id: r.u32()?, width: r.u32()?, height: r.u32()? },
            _ => return Err(WireError::BadOpcode),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    CreateSurface { width: u32, height: u32 },
    DestroySurface { id: u32 },
    SetGeometry { id: u32, geometry: Geometry },
    /// The pixel buffer travels as a transferred SHM handle alongside this
    /// request, not inline here.
    Present { id: u32 },
    SetZOrder { id: u32, z: i32 },
    GetInfo,
    SetVisible { id: u32, visible: bool },
    SetTitle { id: u32, title: String },
    PollEvent,
    ListWindows,
    RestoreWindow { id: u32 },
}

impl Request {
    pub fn opcode(&self) -> u32 {
        match self {
            Request::CreateSurface { .. } => OP_CREATE_SURFACE,
            Request::DestroySurface { .. } => OP_DESTROY_SURFACE,
            Request::SetGeometry { .. } => OP_SET_GEOMETRY,
            Request::Present { .. } => OP_PRESENT,
            Request::SetZOrder { .. } => OP_SET_Z_ORDER,
            Request::GetInfo => OP_GET_INFO,
            Request::SetVisible { .. } => OP_SET_VISIBLE,
            Request::SetTitle { .. } => OP_SET_TITLE,
            Request::PollEvent => OP_POLL_EVENT,
            Request::ListWindows => OP_LIST_WINDOWS,
            Request::RestoreWindow { .. } => OP_RESTORE_WINDOW,
        }
    }

    pub fn encode_body(&self) -> Vec<u8> {
        let mut w = Writer::new();
        match self {
            Request::CreateSurface { width, height } => {
                w.u32(*width).u32(*height);
            }
            Request::DestroySurface { id } => {
                w.u32(*id);
            }
            Request::SetGeometry { id, geometry } => {
                w.u32(*id).i32(geometry.x).i32(geometry.y).u32(geometry.width).u32(geometry.height);
            }
            Request::Present { id } => {
                w.u32(*id);
            }
            Request::SetZOrder { id, z } => {
                w.u32(*id).i32(*z);
            }
            Request::GetInfo | Request::PollEvent | Request::ListWindows => {}
            Request::SetVisible { id, visible } => {
                w.u32(*id).u8(*visible as u8);
            }
            Request::SetTitle { id, title } => {
                w.u32(*id).string(title);
            }
            Request::RestoreWindow { id } => {
                w.u32(*id);
            }
        }
        w.into_vec()
    }

    pub fn decode(opcode: u32, body: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(body);
        Ok(match opcode {
            OP_CREATE_SURFACE => Request::CreateSurface { width: r.u32()?, height: r.u32()? },
            OP_DESTROY_SURFACE => Request::DestroySurface { id: r.u32()? },
            OP_SET_GEOMETRY => {
                let id = r.u32()?;
                let x = r.i32()?;
                let y = r.i32()?;
                let width = r.u32()?;
                let height = r.u32()?;
                Request::SetGeometry { id, geometry: Geometry { x, y, width, height } }
            }
            OP_PRESENT => Request::Present { id: r.u32()? },
            OP_SET_Z_ORDER => Request::SetZOrder { id: r.u32()?, z: r.i32()? },
            OP_GET_INFO => Request::GetInfo,
            OP_SET_VISIBLE => Request::SetVisible { id: r.u32()?, visible: r.u8()? != 0 },
            OP_SET_TITLE => Request::SetTitle { id: r.u32()?, title: r.string(MAX_TITLE_LEN)? },
            OP_POLL_EVENT => Request::PollEvent,
            OP_LIST_WINDOWS => Request::ListWindows,
            OP_RESTORE_WINDOW => Request::RestoreWindow { id: r.u32()? },
            _ => return Err(WireError::BadOpcode),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// The backing pixel buffer rides in a transferred SHM handle, not
    /// here; `stride` is its row pitch in bytes.
    Created { id: u32, stride: u32 },
    Destroyed,
    GeometrySet,
    Presented,
    ZOrderSet,
    Info { width: u32, height: u32, bytes_per_pixel: u32 },
    VisibleSet,
    TitleSet,
    Event(Option<WindowEvent>),
    Windows { ids: Vec<u32> },
    Restored,
    Error(i32),
}

impl Reply {
    pub fn encode_body(&self) -> Vec<u8> {
        let mut w = Writer::new();
        match self {
            Reply::Created { id, stride } => {
                w.i32(0).u32(*id).u32(*stride);
            }
            Reply::Destroyed | Reply::GeometrySet | Reply::Presented | Reply::ZOrderSet | Reply::VisibleSet
            | Reply::TitleSet | Reply::Restored => {
                w.i32(0);
            }
            Reply::Info { width, height, bytes_per_pixel } => {
                w.i32(0).u32(*width).u32(*height).u32(*bytes_per_pixel);
            }
            Reply::Event(e) => {
                w.i32(0).u8(e.is_some() as u8);
                if let Some(e) = e {
                    e.encode(&mut w);
                }
            }
            Reply::Windows { ids } => {
                w.i32(0).u32(ids.len() as u32);
                for id in ids {
                    w.u32(*id);
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
            OP_CREATE_SURFACE => Reply::Created { id: r.u32()?, stride: r.u32()? },
            OP_DESTROY_SURFACE => Reply::Destroyed,
            OP_SET_GEOMETRY => Reply::GeometrySet,
            OP_PRESENT => Reply::Presented,
            OP_SET_Z_ORDER => Reply::ZOrderSet,
            OP_GET_INFO => {
                let width = r.u32()?;
                let height = r.u32()?;
                let bytes_per_pixel = r.u32()?;
                Reply::Info { width, height, bytes_per_pixel }
            }
            OP_SET_VISIBLE => Reply::VisibleSet,
            OP_SET_TITLE => Reply::TitleSet,
            OP_POLL_EVENT => {
                let present = r.u8()? != 0;
                Reply::Event(if present { Some(WindowEvent::decode(&mut r)?) } else { None })
            }
            OP_LIST_WINDOWS => {
                let count = r.u32()? as usize;
                if count > MAX_WINDOW_LIST {
                    return Err(WireError::TooLarge);
                }
                let mut ids = Vec::with_capacity(count);
                for _ in 0..count {
                    ids.push(r.u32()?);
                }
                Reply::Windows { ids }
            }
            OP_RESTORE_WINDOW => Reply::Restored,
            _ => return Err(WireError::BadOpcode),
        })
    }
}
