use std::fmt::Write as _;
use std::sync::Arc;

use viper_abi::assign_names;
use viper_kernel::assign::AssignFlags;
use viper_kernel::{trap, Process};
use viper_ipc::ChannelEndpoint;

fn main() {
    viper_log::init_from_env();
    let process = Arc::new(Process::new(assign_names::NETD));
    let (server_handle, client_handle) = trap::channel_create(&process, viper_abi::config::channel_fifo_depth());

    let connector = process
        .caps
        .query(client_handle)
        .expect("just-created handle")
        .object
        .as_channel()
        .expect("channel object")
        .clone();
    trap::assign_set(assign_names::NETD, client_handle.raw(), connector, AssignFlags::NONE)
        .expect("netd registers exactly once at boot");

    viper_log::info("netd", |l| {
        let _ = write!(l, "serving loopback-only socket requests");
    });

    let transport = ChannelEndpoint::new(process.clone(), server_handle);
    let server = netd::NetdServer::new(process);
    server.run_forever(&transport).expect("netd server loop");
}
