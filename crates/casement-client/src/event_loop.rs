//! Client main-loop plumbing
//!
//! Everything the service (or an input channel) wants from the app is
//! posted here as a [`ClientTask`] and dispatched on the app's own loop;
//! transport threads never run user drawing code.

use casement_ipc::buffer::BufferKey;
use casement_ipc::input::{InputChannel, InputMessage};
use casement_ipc::types::{WindowFrames, WindowHandle};
use nix::poll::{poll, PollFd, PollFlags};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

/// Work posted to the client main loop
#[derive(Debug)]
pub enum ClientTask {
    OnFrame { window: WindowHandle, seq: u32 },
    BufferReleased { window: WindowHandle, key: BufferKey },
    AppVisibility { window: WindowHandle, visible: bool },
    Moved { window: WindowHandle, x: i32, y: i32 },
    Resized { window: WindowHandle, frames: WindowFrames, display_id: i32 },
    Input { window: WindowHandle, message: InputMessage },
    ServiceDied,
}

/// Poll interval for the pump's stop flag
const PUMP_POLL_MS: libc::c_int = 200;

/// Drain a window's input channel into the main loop.
///
/// The pump owns the channel; setting `stop` makes it exit within one
/// poll interval.
pub(crate) fn spawn_input_pump(
    window: WindowHandle,
    channel: InputChannel,
    tx: UnboundedSender<ClientTask>,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let fd = channel.event_fd();
        loop {
            if stop.load(Ordering::Relaxed) {
                debug!("input pump for {} stopping", window);
                return;
            }
            let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
            match poll(&mut fds, PUMP_POLL_MS) {
                Ok(0) => continue,
                Ok(_) => {
                    let revents = fds[0].revents().unwrap_or(PollFlags::empty());
                    if revents.intersects(
                        PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL,
                    ) {
                        debug!("input pump for {} lost its channel", window);
                        return;
                    }
                    while let Some(message) = channel.receive_message() {
                        if tx.send(ClientTask::Input { window, message }).is_err() {
                            return;
                        }
                    }
                }
                Err(err) => {
                    debug!("input pump for {} poll failed: {}", window, err);
                    return;
                }
            }
        }
    })
}
