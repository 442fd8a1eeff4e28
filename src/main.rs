mod server;

use lsp_server::Connection;
use vitest_explorer::{config, logging::init_logging};

use crate::server::Server;

fn main() {
    let config = config::init();
    if let Err(err) = init_logging(config, "server") {
        eprintln!("failed to initialize logger: {err}");
    }

    let (connection, io_threads) = Connection::stdio();
    let (fs_tx, fs_rx) = crossbeam_channel::unbounded();
    let mut server = Server::new(connection.sender.clone(), config.clone(), fs_tx, fs_rx);

    if let Err(err) = server.main_loop(&connection.receiver) {
        log::error!("Error: {err:?}");
    }
    server.dispose();

    drop(connection);
    if let Err(err) = io_threads.join() {
        log::error!("io threads failed: {err}");
    }
}
