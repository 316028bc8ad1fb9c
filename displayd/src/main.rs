use std::fmt::Write as _;
use std::sync::Arc;

use viper_abi::assign_names;
use viper_kernel::assign::AssignFlags;
use viper_kernel::{trap, Process};
use viper_ipc::ChannelEndpoint;

const CANVAS_WIDTH: u32 = 1024;
const CANVAS_HEIGHT: u32 = 768;

fn main() {
    viper_log::init_from_env();
    let process = Arc::new(Process::new(assign_names::DISPLAYD));
    let (server_handle, client_handle) = trap::channel_create(&process, viper_abi::config::channel_fifo_depth());

    let connector = process
        .caps
        .query(client_handle)
        .expect("just-created handle")
        .object
        .as_channel()
        .expect("channel object")
        .clone();
    trap::assign_set(assign_names::DISPLAYD, client_handle.raw(), connector, AssignFlags::NONE)
        .expect("displayd registers exactly once at boot");

    viper_log::info("displayd", |l| {
        let _ = write!(l, "compositing onto a {}x{} canvas", CANVAS_WIDTH, CANVAS_HEIGHT);
    });

    let transport = ChannelEndpoint::new(process.clone(), server_handle);
    let server = displayd::DisplaydServer::new(process, CANVAS_WIDTH, CANVAS_HEIGHT);
    server.run_forever(&transport).expect("displayd server loop");
}
