//! Casement display service
//!
//! Coordinates per-application client runtimes over IPC: paces their
//! rendering against the vsync source, moves pixels through
//! shared-memory buffer queues, and keeps the authoritative
//! display -> token -> window -> surface graph.

mod config;
mod input_dispatcher;
mod ipc;
mod root;
mod service;
mod token;
mod window;

use anyhow::Result;
use config::Config;
use ipc::ServiceMsg;
use root::VsyncSource;
use service::WindowManagerService;
use tokio::sync::mpsc::unbounded_channel;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "casement=debug,info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("starting casement service");

    let config = Config::load()?;
    let mut vsync = VsyncSource::new(&config.display)?;
    let mut service = WindowManagerService::new(config);

    let (tx, mut rx) = unbounded_channel();
    ipc::spawn_listener(&casement_ipc::socket_path(), tx)?;

    loop {
        tokio::select! {
            Some(msg) = rx.recv() => handle_msg(&mut service, msg),
            _ = vsync.tick(), if service.vsync_active() => service.on_vsync(),
        }
    }
}

fn handle_msg(service: &mut WindowManagerService, msg: ServiceMsg) {
    match msg {
        ServiceMsg::Connected { client, sink } => service.register_client(client, sink),
        ServiceMsg::Request { client, seq, request } => {
            let (reply, fds) = service.dispatch(client, request);
            service.send_reply(client, seq, reply, fds);
        }
        ServiceMsg::Disconnected { client } => service.on_client_died(client),
    }
}
