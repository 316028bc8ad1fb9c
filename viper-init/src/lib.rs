//! The bootstrap process (spec component C7): spawns the five canonical
//! servers as threads inside one address space — standing in for separate
//! microkernel processes in this host simulation, which is also why it is
//! the only place these servers can share one `AssignRegistry` instance
//! with each other. Each server additionally receives a delegated
//! bootstrap bundle over its handle 0, the host-simulation stand-in for a
//! spawned process inheriting a capability at a well-known slot instead of
//! discovering it through the name registry.

use std::fmt::Write as _;
use std::sync::Arc;
use std::thread::JoinHandle;

use viper_abi::assign_names;
use viper_ipc::{ChannelEndpoint, RawChannelEndpoint};
use viper_kernel::assign::{AssignFlags, AssignRegistry};
use viper_kernel::bootstrap::BootstrapChannel;
use viper_kernel::channel::Message;
use viper_kernel::{trap, Process};

const BLKD_SECTORS: usize = 4096;
const CANVAS_WIDTH: u32 = 1024;
const CANVAS_HEIGHT: u32 = 768;
const BOOTSTRAP_ACCEPT_ITERS: usize = 50;

/// Creates a process, a connected channel pair for it, registers the
/// client-facing endpoint under `name`, and delegates a bootstrap bundle
/// over a second pair bound to the server's handle 0.
fn provision(name: &'static str) -> (Arc<Process>, viper_kernel::channel::ChannelHandle) {
    let process = Arc::new(Process::new(name));
    let (server_handle, client_handle) = trap::channel_create(&process, viper_abi::config::channel_fifo_depth());

    let connector = process
        .caps
        .query(client_handle)
        .expect("just-created handle")
        .object
        .as_channel()
        .expect("channel object")
        .clone();
    trap::assign_set(name, client_handle.raw(), connector, AssignFlags::NONE)
        .unwrap_or_else(|e| panic!("{name} must register exactly once at boot: {e}"));

    let (bootstrap_init_side, bootstrap_server_side) = viper_kernel::channel::pair(1);
    bootstrap_init_side
        .send(Message::new(name.as_bytes().to_vec(), vec![]).expect("name fits a bootstrap message"))
        .expect("freshly created bootstrap channel accepts one message");
    let bootstrap = BootstrapChannel::new(bootstrap_server_side);
    if let Some(bundle) = bootstrap.accept(BOOTSTRAP_ACCEPT_ITERS) {
        viper_log::info("viper-init", |l| {
            let _ = write!(l, "{name} accepted {}-byte bootstrap bundle", bundle.payload.len());
        });
    }

    (process, server_handle)
}

fn connect(name: &'static str) -> Arc<RawChannelEndpoint> {
    let entry = AssignRegistry::global()
        .get(name)
        .unwrap_or_else(|e| panic!("{name} must already be registered: {e}"));
    Arc::new(RawChannelEndpoint::new(entry.connector))
}

/// Handle to a spawned service's worker thread; dropping it does not stop
/// the service, it is only a join point for orderly shutdown.
pub struct ServiceHandle {
    pub name: &'static str,
    join: JoinHandle<()>,
}

impl ServiceHandle {
    pub fn join(self) {
        let _ = self.join.join();
    }
}

pub struct Supervisor {
    pub services: Vec<ServiceHandle>,
}

impl Supervisor {
    pub fn join_all(self) {
        for service in self.services {
            service.join();
        }
    }
}

/// Boots all five canonical services in dependency order (`blkd` before
/// `fsd`, which calls through to it) and returns their thread handles.
pub fn spawn_all() -> Supervisor {
    viper_log::init_from_env();
    let mut services = Vec::new();

    let (blkd_process, blkd_server_handle) = provision(assign_names::BLKD);
    let blkd_transport = ChannelEndpoint::new(blkd_process.clone(), blkd_server_handle);
    let blkd_server = blkd::BlkdServer::new(BLKD_SECTORS, blkd_process);
    services.push(ServiceHandle {
        name: assign_names::BLKD,
        join: std::thread::spawn(move || {
            let _ = blkd_server.run_forever(&blkd_transport);
        }),
    });

    let (fsd_process, fsd_server_handle) = provision(assign_names::FSD);
    let fsd_transport = ChannelEndpoint::new(fsd_process.clone(), fsd_server_handle);
    let fsd_server = fsd::FsdServer::new(fsd_process);
    services.push(ServiceHandle {
        name: assign_names::FSD,
        join: std::thread::spawn(move || {
            let _ = fsd_server.run_forever(&fsd_transport);
        }),
    });

    let (netd_process, netd_server_handle) = provision(assign_names::NETD);
    let netd_transport = ChannelEndpoint::new(netd_process.clone(), netd_server_handle);
    let netd_server = netd::NetdServer::new(netd_process);
    services.push(ServiceHandle {
        name: assign_names::NETD,
        join: std::thread::spawn(move || {
            let _ = netd_server.run_forever(&netd_transport);
        }),
    });

    let (inputd_process, inputd_server_handle) = provision(assign_names::INPUTD);
    let inputd_transport = ChannelEndpoint::new(inputd_process.clone(), inputd_server_handle);
    let inputd_server = inputd::InputdServer::new(inputd_process);
    services.push(ServiceHandle {
        name: assign_names::INPUTD,
        join: std::thread::spawn(move || {
            let _ = inputd_server.run_forever(&inputd_transport);
        }),
    });

    let (displayd_process, displayd_server_handle) = provision(assign_names::DISPLAYD);
    let displayd_transport = ChannelEndpoint::new(displayd_process.clone(), displayd_server_handle);
    let displayd_server = displayd::DisplaydServer::new(displayd_process, CANVAS_WIDTH, CANVAS_HEIGHT);
    services.push(ServiceHandle {
        name: assign_names::DISPLAYD,
        join: std::thread::spawn(move || {
            let _ = displayd_server.run_forever(&displayd_transport);
        }),
    });

    Supervisor { services }
}
