use std::fmt::Write as _;
use std::sync::Arc;

use viper_abi::assign_names;
use viper_ipc::ChannelEndpoint;
use viper_kernel::assign::AssignFlags;
use viper_kernel::{trap, Process};

fn main() {
    viper_log::init_from_env();
    let process = Arc::new(Process::new(assign_names::FSD));
    let (server_handle, client_handle) = trap::channel_create(&process, viper_abi::config::channel_fifo_depth());

    let connector = process
        .caps
        .query(client_handle)
        .expect("just-created handle")
        .object
        .as_channel()
        .expect("channel object")
        .clone();
    trap::assign_set(assign_names::FSD, client_handle.raw(), connector, AssignFlags::NONE)
        .expect("fsd registers exactly once at boot");

    viper_log::info("fsd", |l| {
        let _ = write!(l, "serving filesystem requests backed by {}", assign_names::BLKD);
    });

    let transport = ChannelEndpoint::new(process.clone(), server_handle);
    let server = fsd::FsdServer::new(process);
    server.run_forever(&transport).expect("fsd server loop");
}
