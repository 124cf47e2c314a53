//! Demo client: one window filled by the dummy driver
//!
//! Connects to a running casement service, creates a window, asks for
//! periodic vsync, and lets the dummy driver paint a rotating solid
//! color every frame.

use anyhow::{Context, Result};
use casement_client::{DummyDriverProxy, WindowManager};
use casement_ipc::types::{LayoutParams, TokenHandle, VsyncRequest, WindowFlags};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "casement_client=debug,info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut manager = WindowManager::connect().context("failed to connect to the service")?;
    let (display_width, display_height) = manager.display_size();
    info!("connected, display is {}x{}", display_width, display_height);

    let mut attrs = LayoutParams::new(TokenHandle(0));
    attrs.width = display_width / 2;
    attrs.height = display_height / 2;
    attrs.x = display_width / 4;
    attrs.y = display_height / 4;
    attrs.flags = WindowFlags::INPUT;

    let window = manager.new_window(Box::new(DummyDriverProxy::new()), attrs);
    manager.attach_window(window).context("failed to attach window")?;
    manager.relayout_window(window).context("relayout failed")?;
    manager.schedule_vsync(window, VsyncRequest::Periodic)?;
    manager.dump_windows();

    manager.run().await;
    Ok(())
}
