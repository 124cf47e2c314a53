//! Service connection
//!
//! [`WindowService`] is the client's view of the service's IPC surface;
//! the remote implementation speaks the wire protocol over the service
//! socket. Calls are synchronous: one request in flight per connection,
//! replies matched by sequence number. Unsolicited events are forwarded
//! to the main loop by the reader thread, which also implements the
//! `frame_done` fast path: a tick that arrives while the previous frame
//! is still being drawn is dropped before it ever reaches the loop.

use crate::event_loop::ClientTask;
use casement_ipc::input::InputChannel;
use casement_ipc::layer::LayerState;
use casement_ipc::proto::{Event, Reply, Request, RequestEnvelope, ServerMessage};
use casement_ipc::surface::SurfaceControl;
use casement_ipc::transport::{self, MessageWriter};
use casement_ipc::types::{DisplayInfo, LayoutParams, TokenHandle, VsyncRequest, WindowHandle};
use casement_ipc::WmError;
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

/// The service surface as seen by the client runtime
pub trait WindowService {
    fn get_display_info(&self, display_id: i32) -> Result<DisplayInfo, WmError>;

    fn add_window_token(
        &self,
        token: TokenHandle,
        window_type: i32,
        display_id: i32,
    ) -> Result<(), WmError>;

    fn remove_window_token(&self, token: TokenHandle, display_id: i32) -> Result<(), WmError>;

    fn is_window_token(&self, token: TokenHandle) -> Result<bool, WmError>;

    fn update_window_token_visibility(
        &self,
        token: TokenHandle,
        visible: bool,
    ) -> Result<(), WmError>;

    /// Returns the input channel when one was requested
    fn add_window(
        &self,
        window: WindowHandle,
        attrs: &LayoutParams,
        visible: bool,
        input: bool,
    ) -> Result<Option<InputChannel>, WmError>;

    fn remove_window(&self, window: WindowHandle) -> Result<(), WmError>;

    /// Returns the fresh surface when the window is visible
    fn relayout(
        &self,
        window: WindowHandle,
        attrs: &LayoutParams,
        requested_width: i32,
        requested_height: i32,
        visible: bool,
    ) -> Result<Option<SurfaceControl>, WmError>;

    /// Returns whether the request actually changed state
    fn request_vsync(&self, window: WindowHandle, request: VsyncRequest)
        -> Result<bool, WmError>;

    fn apply_transaction(&self, states: Vec<LayerState>) -> Result<(), WmError>;

    fn monitor_input(
        &self,
        token: TokenHandle,
        name: &str,
        display_id: i32,
    ) -> Result<InputChannel, WmError>;

    fn release_input(&self, token: TokenHandle) -> Result<(), WmError>;
}

/// Shared `frame_done` flags, indexed by window
#[derive(Clone, Default)]
pub struct FrameGate {
    flags: Arc<Mutex<HashMap<WindowHandle, Arc<AtomicBool>>>>,
}

impl FrameGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, window: WindowHandle, flag: Arc<AtomicBool>) {
        self.flags.lock().expect("gate lock").insert(window, flag);
    }

    pub fn unregister(&self, window: WindowHandle) {
        self.flags.lock().expect("gate lock").remove(&window);
    }

    /// Claim the frame slot: `false` when the previous frame is still
    /// outstanding and the tick must be dropped
    fn begin_frame(&self, window: WindowHandle) -> bool {
        let flags = self.flags.lock().expect("gate lock");
        match flags.get(&window) {
            Some(flag) => flag.swap(false, Ordering::AcqRel),
            None => true,
        }
    }
}

/// Turns inbound events into main-loop tasks; runs on the reader thread
#[derive(Clone)]
pub struct EventForwarder {
    gate: FrameGate,
    tx: UnboundedSender<ClientTask>,
}

impl EventForwarder {
    pub fn new(gate: FrameGate, tx: UnboundedSender<ClientTask>) -> Self {
        Self { gate, tx }
    }

    pub fn handle(&self, window: WindowHandle, event: Event) {
        let task = match event {
            Event::OnFrame { seq } => {
                if !self.gate.begin_frame(window) {
                    warn!("onFrame {} for {}, waiting frame done", seq, window);
                    return;
                }
                ClientTask::OnFrame { window, seq }
            }
            Event::BufferReleased { key } => ClientTask::BufferReleased { window, key },
            Event::DispatchAppVisibility { visible } => {
                ClientTask::AppVisibility { window, visible }
            }
            Event::Moved { x, y } => ClientTask::Moved { window, x, y },
            Event::Resized { frames, display_id } => {
                ClientTask::Resized { window, frames, display_id }
            }
        };
        let _ = self.tx.send(task);
    }

    fn service_died(&self) {
        let _ = self.tx.send(ClientTask::ServiceDied);
    }
}

type PendingReply = (u64, Reply, Vec<RawFd>);

/// Wire implementation of [`WindowService`]
pub struct RemoteWindowService {
    writer: Mutex<MessageWriter>,
    replies: Mutex<mpsc::Receiver<PendingReply>>,
    call_lock: Mutex<()>,
    next_seq: AtomicU64,
}

impl RemoteWindowService {
    /// Connect to the service socket and start the reader thread
    pub fn connect(forwarder: EventForwarder) -> Result<Self, WmError> {
        let stream =
            UnixStream::connect(casement_ipc::socket_path()).map_err(|_| WmError::ClientDead)?;
        let (mut reader, writer) = transport::split(stream).map_err(|_| WmError::ClientDead)?;

        let (reply_tx, reply_rx) = mpsc::channel();
        std::thread::spawn(move || loop {
            match reader.recv::<ServerMessage>() {
                Ok((ServerMessage::Reply { seq, reply }, fds)) => {
                    if reply_tx.send((seq, reply, fds)).is_err() {
                        return;
                    }
                }
                Ok((ServerMessage::Event { window, event }, fds)) => {
                    for fd in fds {
                        let _ = nix::unistd::close(fd);
                    }
                    forwarder.handle(window, event);
                }
                Err(err) => {
                    debug!("service connection closed: {}", err);
                    forwarder.service_died();
                    return;
                }
            }
        });

        let service = Self {
            writer: Mutex::new(writer),
            replies: Mutex::new(reply_rx),
            call_lock: Mutex::new(()),
            next_seq: AtomicU64::new(1),
        };
        service.call(Request::Hello { pid: std::process::id() as i32 })?;
        Ok(service)
    }

    /// Synchronous request/reply round trip
    fn call(&self, request: Request) -> Result<(Reply, Vec<RawFd>), WmError> {
        let _in_flight = self.call_lock.lock().expect("call lock");
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);

        self.writer
            .lock()
            .expect("writer lock")
            .send(&RequestEnvelope { seq, request }, &[])
            .map_err(|_| WmError::ClientDead)?;

        let replies = self.replies.lock().expect("reply lock");
        loop {
            let (reply_seq, reply, fds) = replies.recv().map_err(|_| WmError::ClientDead)?;
            if reply_seq != seq {
                // stale reply from an abandoned call
                for fd in fds {
                    let _ = nix::unistd::close(fd);
                }
                continue;
            }
            if let Reply::Error { code, message } = reply {
                for fd in fds {
                    let _ = nix::unistd::close(fd);
                }
                return Err(WmError::from_wire(code, message));
            }
            return Ok((reply, fds));
        }
    }
}

impl WindowService for RemoteWindowService {
    fn get_display_info(&self, display_id: i32) -> Result<DisplayInfo, WmError> {
        match self.call(Request::GetPhysicalDisplayInfo { display_id })? {
            (Reply::DisplayInfo { info }, _) => Ok(info),
            _ => Err(WmError::UnknownHandle),
        }
    }

    fn add_window_token(
        &self,
        token: TokenHandle,
        window_type: i32,
        display_id: i32,
    ) -> Result<(), WmError> {
        self.call(Request::AddWindowToken { token, window_type, display_id })?;
        Ok(())
    }

    fn remove_window_token(&self, token: TokenHandle, display_id: i32) -> Result<(), WmError> {
        self.call(Request::RemoveWindowToken { token, display_id })?;
        Ok(())
    }

    fn is_window_token(&self, token: TokenHandle) -> Result<bool, WmError> {
        match self.call(Request::IsWindowToken { token })? {
            (Reply::IsWindowToken { is_token }, _) => Ok(is_token),
            _ => Err(WmError::UnknownHandle),
        }
    }

    fn update_window_token_visibility(
        &self,
        token: TokenHandle,
        visible: bool,
    ) -> Result<(), WmError> {
        self.call(Request::UpdateWindowTokenVisibility { token, visible })?;
        Ok(())
    }

    fn add_window(
        &self,
        window: WindowHandle,
        attrs: &LayoutParams,
        visible: bool,
        input: bool,
    ) -> Result<Option<InputChannel>, WmError> {
        let (reply, fds) = self.call(Request::AddWindow {
            window,
            attrs: attrs.clone(),
            visible,
            display_id: 0,
            user_id: 0,
            input,
        })?;
        match reply {
            Reply::WindowAdded { channel: Some(info) } => {
                let fd = fds
                    .get(info.fd_index as usize)
                    .copied()
                    .ok_or(WmError::UnknownHandle)?;
                Ok(Some(InputChannel::from_parts(info.name, fd)))
            }
            Reply::WindowAdded { channel: None } => Ok(None),
            _ => Err(WmError::UnknownHandle),
        }
    }

    fn remove_window(&self, window: WindowHandle) -> Result<(), WmError> {
        self.call(Request::RemoveWindow { window })?;
        Ok(())
    }

    fn relayout(
        &self,
        window: WindowHandle,
        attrs: &LayoutParams,
        requested_width: i32,
        requested_height: i32,
        visible: bool,
    ) -> Result<Option<SurfaceControl>, WmError> {
        let (reply, fds) = self.call(Request::Relayout {
            window,
            attrs: attrs.clone(),
            requested_width,
            requested_height,
            visible,
        })?;
        match reply {
            Reply::Relayout { surface: Some(info) } => {
                Ok(Some(SurfaceControl::from_wire(info, &fds)?))
            }
            Reply::Relayout { surface: None } => Ok(None),
            _ => Err(WmError::UnknownHandle),
        }
    }

    fn request_vsync(
        &self,
        window: WindowHandle,
        request: VsyncRequest,
    ) -> Result<bool, WmError> {
        match self.call(Request::RequestVsync { window, request })? {
            (Reply::VsyncScheduled { rescheduled }, _) => Ok(rescheduled),
            _ => Err(WmError::UnknownHandle),
        }
    }

    fn apply_transaction(&self, states: Vec<LayerState>) -> Result<(), WmError> {
        self.call(Request::ApplyTransaction { states })?;
        Ok(())
    }

    fn monitor_input(
        &self,
        token: TokenHandle,
        name: &str,
        display_id: i32,
    ) -> Result<InputChannel, WmError> {
        let (reply, fds) =
            self.call(Request::MonitorInput { token, name: name.to_owned(), display_id })?;
        match reply {
            Reply::InputMonitor { channel } => {
                let fd = fds
                    .get(channel.fd_index as usize)
                    .copied()
                    .ok_or(WmError::UnknownHandle)?;
                Ok(InputChannel::from_parts(channel.name, fd))
            }
            _ => Err(WmError::UnknownHandle),
        }
    }

    fn release_input(&self, token: TokenHandle) -> Result<(), WmError> {
        self.call(Request::ReleaseInput { token })?;
        Ok(())
    }
}
