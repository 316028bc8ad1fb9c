//! displayd: a surface table with z-order, geometry, and visibility,
//! composited into a single in-memory canvas on `Present` — standing in
//! for the excluded real framebuffer/GPU path. Pixel data always rides in
//! a transferred SHM region, so the map-before-use discipline in
//! `viper-kernel::shm` is exercised for real rather than decoratively.

use std::collections::{HashMap, VecDeque};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use viper_abi::{Handle, MsgHeader};
use viper_ipc::{IpcError, Server, Wait};
use viper_kernel::channel::ChannelHandle;
use viper_kernel::shm::ShmHandle;
use viper_kernel::{trap, Process};
use viper_protocol::display::{Geometry, Reply, Request, WindowEvent};

pub const BYTES_PER_PIXEL: usize = 4;
const MAX_QUEUED_EVENTS: usize = 64;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("ipc error: {0}")]
    Ipc(#[from] IpcError),
    #[error("wire error: {0}")]
    Wire(#[from] viper_protocol::WireError),
}

struct Surface {
    geometry: Geometry,
    z: i32,
    visible: bool,
    title: String,
}

pub struct DisplaydServer {
    process: Arc<Process>,
    canvas_width: u32,
    canvas_height: u32,
    canvas: Mutex<Vec<u8>>,
    surfaces: Mutex<HashMap<u32, Surface>>,
    next_id: AtomicU32,
    events: Mutex<VecDeque<WindowEvent>>,
}

impl DisplaydServer {
    pub fn new(process: Arc<Process>, canvas_width: u32, canvas_height: u32) -> Arc<Self> {
        let canvas = vec![0u8; canvas_width as usize * canvas_height as usize * BYTES_PER_PIXEL];
        Arc::new(DisplaydServer {
            process,
            canvas_width,
            canvas_height,
            canvas: Mutex::new(canvas),
            surfaces: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            events: Mutex::new(VecDeque::new()),
        })
    }

    /// A read-only snapshot of the composited canvas, for tests.
    pub fn canvas_snapshot(&self) -> Vec<u8> {
        self.canvas.lock().clone()
    }

    fn push_event(&self, event: WindowEvent) {
        let mut events = self.events.lock();
        if events.len() >= MAX_QUEUED_EVENTS {
            events.pop_front();
        }
        events.push_back(event);
    }

    fn present(&self, id: u32, extra_handles: &[u32]) -> Reply {
        let Some(&shm_raw) = extra_handles.first() else {
            return Reply::Error(viper_abi::VError::InvalidArg.code());
        };
        let mut surfaces = self.surfaces.lock();
        let Some(surface) = surfaces.get_mut(&id) else {
            let _ = trap::cap_close(&self.process, shm_raw);
            return Reply::Error(viper_abi::VError::NotFound.code());
        };
        let geometry = surface.geometry;
        let visible = surface.visible;
        drop(surfaces);

        let pixel_count = geometry.width as usize * geometry.height as usize;
        let mut pixels = vec![0u8; pixel_count * BYTES_PER_PIXEL];
        let handle: ShmHandle = Handle::from_raw(shm_raw);
        let read_result = trap::shm_read(&self.process, handle, 0, &mut pixels);
        let _ = trap::cap_close(&self.process, shm_raw);
        if let Err(err) = read_result {
            return Reply::Error(err.code());
        }

        if !visible {
            return Reply::Presented;
        }

        let mut canvas = self.canvas.lock();
        for row in 0..geometry.height as i64 {
            let dst_y = geometry.y as i64 + row;
            if dst_y < 0 || dst_y >= self.canvas_height as i64 {
                continue;
            }
            for col in 0..geometry.width as i64 {
                let dst_x = geometry.x as i64 + col;
                if dst_x < 0 || dst_x >= self.canvas_width as i64 {
                    continue;
                }
                let src_offset = (row as usize * geometry.width as usize + col as usize) * BYTES_PER_PIXEL;
                let dst_offset = (dst_y as usize * self.canvas_width as usize + dst_x as usize) * BYTES_PER_PIXEL;
                canvas[dst_offset..dst_offset + BYTES_PER_PIXEL]
                    .copy_from_slice(&pixels[src_offset..src_offset + BYTES_PER_PIXEL]);
            }
        }
        Reply::Presented
    }

    /// `request`'s reply, plus any handles (already live in this server's
    /// own process) the reply must transfer alongside it.
    fn handle(&self, request: Request, extra_handles: &[u32]) -> (Reply, Vec<u32>) {
        match request {
            Request::CreateSurface { width, height } => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                self.surfaces.lock().insert(
                    id,
                    Surface { geometry: Geometry { x: 0, y: 0, width, height }, z: 0, visible: true, title: String::new() },
                );
                let stride = width * BYTES_PER_PIXEL as u32;
                let shm = trap::shm_create(&self.process, width as usize * height as usize * BYTES_PER_PIXEL);
                (Reply::Created { id, stride }, vec![shm.raw()])
            }
            Request::DestroySurface { id } => {
                if self.surfaces.lock().remove(&id).is_none() {
                    return (Reply::Error(viper_abi::VError::NotFound.code()), Vec::new());
                }
                self.push_event(WindowEvent::Closed { id });
                (Reply::Destroyed, Vec::new())
            }
            Request::SetGeometry { id, geometry } => {
                let mut surfaces = self.surfaces.lock();
                let Some(surface) = surfaces.get_mut(&id) else {
                    return (Reply::Error(viper_abi::VError::NotFound.code()), Vec::new());
                };
                surface.geometry = geometry;
                drop(surfaces);
                self.push_event(WindowEvent::Resized { id, width: geometry.width, height: geometry.height });
                (Reply::GeometrySet, Vec::new())
            }
            Request::SetZOrder { id, z } => {
                let mut surfaces = self.surfaces.lock();
                let Some(surface) = surfaces.get_mut(&id) else {
                    return (Reply::Error(viper_abi::VError::NotFound.code()), Vec::new());
                };
                surface.z = z;
                (Reply::ZOrderSet, Vec::new())
            }
            Request::Present { id } => (self.present(id, extra_handles), Vec::new()),
            Request::GetInfo => (
                Reply::Info { width: self.canvas_width, height: self.canvas_height, bytes_per_pixel: BYTES_PER_PIXEL as u32 },
                Vec::new(),
            ),
            Request::SetVisible { id, visible } => {
                let mut surfaces = self.surfaces.lock();
                let Some(surface) = surfaces.get_mut(&id) else {
                    return (Reply::Error(viper_abi::VError::NotFound.code()), Vec::new());
                };
                surface.visible = visible;
                (Reply::VisibleSet, Vec::new())
            }
            Request::SetTitle { id, title } => {
                let mut surfaces = self.surfaces.lock();
                let Some(surface) = surfaces.get_mut(&id) else {
                    return (Reply::Error(viper_abi::VError::NotFound.code()), Vec::new());
                };
                surface.title = title;
                (Reply::TitleSet, Vec::new())
            }
            Request::PollEvent => (Reply::Event(self.events.lock().pop_front()), Vec::new()),
            Request::ListWindows => {
                let mut ids: Vec<u32> = self.surfaces.lock().keys().copied().collect();
                ids.sort_unstable();
                (Reply::Windows { ids }, Vec::new())
            }
            Request::RestoreWindow { id } => {
                let mut surfaces = self.surfaces.lock();
                let Some(surface) = surfaces.get_mut(&id) else {
                    return (Reply::Error(viper_abi::VError::NotFound.code()), Vec::new());
                };
                surface.visible = true;
                (Reply::Restored, Vec::new())
            }
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
            viper_log::warn("displayd", |l| {
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
        viper_log::debug("displayd", |l| {
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

    /// Sends `req` transferring a fresh reply channel (plus `extra`), as
    /// the server framework requires, and returns the decoded reply and
    /// any handles it carried.
    fn call(client: &dyn Client, req: &Request, extra: &[u32]) -> (Reply, Vec<u32>) {
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
        let reply = Reply::decode(header.ty & !0x80, &reply_frame[MsgHeader::WIRE_LEN..]).unwrap();
        (reply, reply_handles)
    }

    #[test]
    fn create_then_destroy_surface() {
        let process = Arc::new(Process::new("displayd-test"));
        let (client, server_endpoint) = viper_ipc::loopback_pair();
        let server = DisplaydServer::new(process, 64, 64);

        let (reply, handles) = std::thread::scope(|scope| {
            scope.spawn(|| {
                server.run_once(&server_endpoint).unwrap();
            });
            call(&client, &Request::CreateSurface { width: 8, height: 8 }, &[])
        });
        let Reply::Created { id, stride } = reply else { panic!("expected Created") };
        assert_eq!(stride, 8 * BYTES_PER_PIXEL as u32);
        assert_eq!(handles.len(), 1, "CreateSurface must transfer a backing SHM handle");

        let (reply, _) = std::thread::scope(|scope| {
            scope.spawn(|| {
                server.run_once(&server_endpoint).unwrap();
            });
            call(&client, &Request::DestroySurface { id }, &[])
        });
        assert_eq!(reply, Reply::Destroyed);
    }

    #[test]
    fn present_unknown_surface_is_not_found() {
        let process = Arc::new(Process::new("displayd-test"));
        let (client, server_endpoint) = viper_ipc::loopback_pair();
        let server = DisplaydServer::new(process, 64, 64);

        let shm = trap::shm_create(client.process(), BYTES_PER_PIXEL);
        let (reply, _) = std::thread::scope(|scope| {
            scope.spawn(|| {
                server.run_once(&server_endpoint).unwrap();
            });
            call(&client, &Request::Present { id: 99 }, &[shm.raw()])
        });
        assert_eq!(reply, Reply::Error(viper_abi::VError::NotFound.code()));
    }

    #[test]
    fn present_composites_shm_backed_pixels_into_canvas() {
        let process = Arc::new(Process::new("displayd-test"));
        let (client, server_endpoint) = viper_ipc::loopback_pair();
        let server = DisplaydServer::new(process, 4, 4);

        let (reply, created_handles) = std::thread::scope(|scope| {
            scope.spawn(|| {
                server.run_once(&server_endpoint).unwrap();
            });
            call(&client, &Request::CreateSurface { width: 2, height: 2 }, &[])
        });
        let Reply::Created { id, .. } = reply else { panic!("expected Created") };

        let shm_handle: ShmHandle = viper_abi::Handle::from_raw(created_handles[0]);
        trap::shm_write(client.process(), shm_handle, 0, &[255u8; 2 * 2 * BYTES_PER_PIXEL]).unwrap();

        let (reply, _) = std::thread::scope(|scope| {
            scope.spawn(|| {
                server.run_once(&server_endpoint).unwrap();
            });
            call(&client, &Request::Present { id }, &[shm_handle.raw()])
        });
        assert_eq!(reply, Reply::Presented);

        let canvas = server.canvas_snapshot();
        assert_eq!(&canvas[0..BYTES_PER_PIXEL], &[255, 255, 255, 255]);
    }

    #[test]
    fn destroy_surface_enqueues_a_closed_event() {
        let process = Arc::new(Process::new("displayd-test"));
        let (client, server_endpoint) = viper_ipc::loopback_pair();
        let server = DisplaydServer::new(process, 64, 64);

        let (reply, _) = std::thread::scope(|scope| {
            scope.spawn(|| {
                server.run_once(&server_endpoint).unwrap();
            });
            call(&client, &Request::CreateSurface { width: 4, height: 4 }, &[])
        });
        let Reply::Created { id, .. } = reply else { panic!("expected Created") };

        std::thread::scope(|scope| {
            scope.spawn(|| {
                server.run_once(&server_endpoint).unwrap();
            });
            call(&client, &Request::DestroySurface { id }, &[])
        });

        let (reply, _) = std::thread::scope(|scope| {
            scope.spawn(|| {
                server.run_once(&server_endpoint).unwrap();
            });
            call(&client, &Request::PollEvent, &[])
        });
        assert_eq!(reply, Reply::Event(Some(WindowEvent::Closed { id })));
    }

    #[test]
    fn set_visible_false_skips_compositing_but_still_reports_presented() {
        let process = Arc::new(Process::new("displayd-test"));
        let (client, server_endpoint) = viper_ipc::loopback_pair();
        let server = DisplaydServer::new(process, 4, 4);

        let (reply, created_handles) = std::thread::scope(|scope| {
            scope.spawn(|| {
                server.run_once(&server_endpoint).unwrap();
            });
            call(&client, &Request::CreateSurface { width: 2, height: 2 }, &[])
        });
        let Reply::Created { id, .. } = reply else { panic!("expected Created") };
        let shm_handle: ShmHandle = viper_abi::Handle::from_raw(created_handles[0]);
        trap::shm_write(client.process(), shm_handle, 0, &[255u8; 2 * 2 * BYTES_PER_PIXEL]).unwrap();

        std::thread::scope(|scope| {
            scope.spawn(|| {
                server.run_once(&server_endpoint).unwrap();
            });
            call(&client, &Request::SetVisible { id, visible: false }, &[])
        });

        let (reply, _) = std::thread::scope(|scope| {
            scope.spawn(|| {
                server.run_once(&server_endpoint).unwrap();
            });
            call(&client, &Request::Present { id }, &[shm_handle.raw()])
        });
        assert_eq!(reply, Reply::Presented);
        assert_eq!(server.canvas_snapshot(), vec![0u8; 4 * 4 * BYTES_PER_PIXEL]);
    }

    #[test]
    fn list_windows_reports_live_surface_ids() {
        let process = Arc::new(Process::new("displayd-test"));
        let (client, server_endpoint) = viper_ipc::loopback_pair();
        let server = DisplaydServer::new(process, 64, 64);

        let (first, _) = std::thread::scope(|scope| {
            scope.spawn(|| {
                server.run_once(&server_endpoint).unwrap();
            });
            call(&client, &Request::CreateSurface { width: 4, height: 4 }, &[])
        });
        let (second, _) = std::thread::scope(|scope| {
            scope.spawn(|| {
                server.run_once(&server_endpoint).unwrap();
            });
            call(&client, &Request::CreateSurface { width: 4, height: 4 }, &[])
        });
        let Reply::Created { id: id1, .. } = first else { panic!("expected Created") };
        let Reply::Created { id: id2, .. } = second else { panic!("expected Created") };

        let (reply, _) = std::thread::scope(|scope| {
            scope.spawn(|| {
                server.run_once(&server_endpoint).unwrap();
            });
            call(&client, &Request::ListWindows, &[])
        });
        assert_eq!(reply, Reply::Windows { ids: vec![id1, id2] });
    }
}
