use std::fmt::Write as _;
use std::sync::Arc;

use viper_abi::assign_names;
use viper_kernel::assign::AssignFlags;
use viper_kernel::{trap, Process};
use viper_ipc::ChannelEndpoint;

fn main() {
    viper_log::init_from_env();
    let process = Arc::new(Process::new(assign_names::INPUTD));
    let (server_handle, client_handle) = trap::channel_create(&process, viper_abi::config::channel_fifo_depth());

    let connector = process
        .caps
        .query(client_handle)
        .expect("just-created handle")
        .object
        .as_channel()
        .expect("channel object")
        .clone();
    trap::assign_set(assign_names::INPUTD, client_handle.raw(), connector, AssignFlags::NONE)
        .expect("inputd registers exactly once at boot");

    viper_log::info("inputd", |l| {
        let _ = write!(l, "serving keyboard/mouse requests");
    });

    let transport = ChannelEndpoint::new(process.clone(), server_handle);
    let server = inputd::InputdServer::new(process);
    server.run_forever(&transport).expect("inputd server loop");
}
