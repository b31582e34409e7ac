use std::sync::Arc;

use syncroom::{
    DiskDocumentProvider, DocumentCallbacks, Hub, ServerConfig, SyncServer, WriterConfig,
};

#[tokio::main]
async fn main() {
    env_logger::init();

    let bind_addr =
        std::env::var("SYNCROOM_ADDR").unwrap_or_else(|_| "127.0.0.1:9999".to_string());
    let data_dir =
        std::env::var("SYNCROOM_DATA").unwrap_or_else(|_| "syncroom-data".to_string());

    let provider =
        match DiskDocumentProvider::new(WriterConfig::new(&data_dir), DocumentCallbacks::empty()) {
            Ok(provider) => provider,
            Err(e) => {
                log::error!("failed to open data directory {data_dir}: {e}");
                std::process::exit(1);
            }
        };
    let hub = Arc::new(Hub::new(Arc::new(provider)));

    let config = ServerConfig {
        bind_addr,
        ..ServerConfig::default()
    };
    let server = SyncServer::new(config, hub);
    if let Err(e) = server.run().await {
        log::error!("server exited: {e}");
        std::process::exit(1);
    }
}
