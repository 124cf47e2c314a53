//! Window manager service
//!
//! The authoritative side of the system: owns the token and window maps,
//! dispatches client requests, allocates surfaces and their shared
//! buffers, drives the per-tick compositor pass, and tears down
//! everything a dead client left behind.

use crate::config::Config;
use crate::input_dispatcher::InputMonitor;
use crate::root::RootContainer;
use crate::token::WindowToken;
use crate::window::WindowState;
use casement_ipc::buffer::BufferId;
use casement_ipc::input::{InputChannelInfo, InputMessage};
use casement_ipc::layer::LayerState;
use casement_ipc::proto::{Event, Reply, Request, ServerMessage};
use casement_ipc::shm::SharedMemory;
use casement_ipc::surface::SurfaceControl;
use casement_ipc::types::{
    LayoutParams, Rect, SurfaceHandle, TokenHandle, VsyncRequest, WindowFrames, WindowHandle,
};
use casement_ipc::WmError;
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Identity of one client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub u64);

/// Token handle scoped to its client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TokenKey {
    pub client: ClientId,
    pub handle: TokenHandle,
}

/// Window handle scoped to its client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowKey {
    pub client: ClientId,
    pub window: WindowHandle,
}

/// Outbound path to one client connection.
///
/// The real implementation hands messages to the connection's writer
/// thread; tests capture them in memory.
pub trait ClientSink: Send + Sync {
    /// Queue a message; the sink takes ownership of the fds
    fn deliver(&self, message: ServerMessage, fds: Vec<RawFd>);

    fn send_event(&self, window: WindowHandle, event: Event) {
        self.deliver(ServerMessage::Event { window, event }, Vec::new());
    }
}

struct ClientEntry {
    pid: i32,
    sink: Arc<dyn ClientSink>,
}

/// Depth of every buffer queue: double buffering
const BUFFER_QUEUE_DEPTH: usize = 2;

/// The service-side facade
pub struct WindowManagerService {
    config: Config,
    root: RootContainer,
    clients: HashMap<ClientId, ClientEntry>,
    tokens: HashMap<TokenKey, WindowToken>,
    windows: HashMap<WindowKey, WindowState>,
    monitors: HashMap<TokenKey, InputMonitor>,
    next_surface: u64,
    next_buffer_key: i32,
    vsync_active: bool,
}

impl WindowManagerService {
    pub fn new(config: Config) -> Self {
        let root = RootContainer::new(&config.display);
        info!(
            "service up: display {}x{}, window limit {}",
            config.display.width, config.display.height, config.service.window_limit_max
        );
        Self {
            config,
            root,
            clients: HashMap::new(),
            tokens: HashMap::new(),
            windows: HashMap::new(),
            monitors: HashMap::new(),
            next_surface: 1,
            next_buffer_key: 1,
            vsync_active: false,
        }
    }

    /// The composition target, for inspection
    #[allow(dead_code)]
    pub fn root(&self) -> &RootContainer {
        &self.root
    }

    /// Whether any window currently wants vsync ticks
    pub fn vsync_active(&self) -> bool {
        self.vsync_active
    }

    /// A new connection appeared
    pub fn register_client(&mut self, client: ClientId, sink: Arc<dyn ClientSink>) {
        debug!("client {:?} connected", client);
        self.clients.insert(client, ClientEntry { pid: 0, sink });
    }

    /// Route a reply back through the client's connection
    pub fn send_reply(&self, client: ClientId, seq: u64, reply: Reply, fds: Vec<RawFd>) {
        match self.clients.get(&client) {
            Some(entry) => entry.sink.deliver(ServerMessage::Reply { seq, reply }, fds),
            None => close_all(&fds),
        }
    }

    /// Death recipient: cascade teardown of everything the client owned
    pub fn on_client_died(&mut self, client: ClientId) {
        info!("client {:?} died, tearing down", client);
        let windows: Vec<WindowKey> =
            self.windows.keys().filter(|k| k.client == client).copied().collect();
        for key in windows {
            self.remove_window_internal(key);
        }
        let tokens: Vec<TokenKey> =
            self.tokens.keys().filter(|k| k.client == client).copied().collect();
        for key in tokens {
            if let Some(token) = self.tokens.remove(&key) {
                debug!("{} dropped with its client", token.handle);
            }
        }
        let monitors: Vec<TokenKey> =
            self.monitors.keys().filter(|k| k.client == client).copied().collect();
        for key in monitors {
            if let Some(mut monitor) = self.monitors.remove(&key) {
                monitor.release();
            }
        }
        self.clients.remove(&client);
        self.recompute_vsync();
    }

    /// Handle one request; errors become non-ok replies, never panics
    pub fn dispatch(&mut self, client: ClientId, request: Request) -> (Reply, Vec<RawFd>) {
        let result = match request {
            Request::Hello { pid } => self.hello(client, pid),
            Request::GetPhysicalDisplayInfo { display_id: _ } => {
                Ok((Reply::DisplayInfo { info: self.root.display_info() }, Vec::new()))
            }
            Request::AddWindowToken { token, window_type, display_id } => {
                self.add_window_token(client, token, window_type, display_id)
            }
            Request::RemoveWindowToken { token, display_id: _ } => {
                self.remove_window_token(client, token)
            }
            Request::IsWindowToken { token } => {
                let key = TokenKey { client, handle: token };
                Ok((Reply::IsWindowToken { is_token: self.tokens.contains_key(&key) }, Vec::new()))
            }
            Request::UpdateWindowTokenVisibility { token, visible } => {
                self.update_window_token_visibility(client, token, visible)
            }
            Request::AddWindow { window, attrs, visible, display_id: _, user_id: _, input } => {
                self.add_window(client, window, attrs, visible, input)
            }
            Request::RemoveWindow { window } => self.remove_window(client, window),
            Request::Relayout { window, attrs, requested_width, requested_height, visible } => {
                self.relayout(client, window, attrs, requested_width, requested_height, visible)
            }
            Request::RequestVsync { window, request } => {
                self.request_vsync(client, window, request)
            }
            Request::ApplyTransaction { states } => self.apply_transaction(client, states),
            Request::MonitorInput { token, name, display_id: _ } => {
                self.monitor_input(client, token, &name)
            }
            Request::ReleaseInput { token } => self.release_input(client, token),
        };
        match result {
            Ok(reply) => reply,
            Err(err) => {
                debug!("request failed: {}", err);
                (Reply::Error { code: err.code(), message: err.to_string() }, Vec::new())
            }
        }
    }

    fn hello(&mut self, client: ClientId, pid: i32) -> DispatchResult {
        let entry = self.clients.get_mut(&client).ok_or(WmError::ClientDead)?;
        entry.pid = pid;
        Ok((Reply::Ok, Vec::new()))
    }

    fn add_window_token(
        &mut self,
        client: ClientId,
        token: TokenHandle,
        window_type: i32,
        display_id: i32,
    ) -> DispatchResult {
        let key = TokenKey { client, handle: token };
        if self.tokens.contains_key(&key) {
            return Err(WmError::DuplicateRegistration);
        }
        let pid = self.client_pid(client);
        self.tokens.insert(key, WindowToken::new(token, pid, window_type, display_id));
        debug!("{} added for client {:?}", token, client);
        Ok((Reply::Ok, Vec::new()))
    }

    fn remove_window_token(&mut self, client: ClientId, token: TokenHandle) -> DispatchResult {
        let key = TokenKey { client, handle: token };
        let (owner_pid, member_windows) = match self.tokens.get(&key) {
            Some(token) => (token.owner_pid, token.windows().to_vec()),
            None => return Err(WmError::UnknownHandle),
        };
        for window in member_windows {
            self.remove_window_internal(window);
        }
        self.tokens.remove(&key);
        debug!("{} removed (owner pid {})", token, owner_pid);
        Ok((Reply::Ok, Vec::new()))
    }

    fn update_window_token_visibility(
        &mut self,
        client: ClientId,
        token: TokenHandle,
        visible: bool,
    ) -> DispatchResult {
        let key = TokenKey { client, handle: token };
        let (client_visible, member_windows) = match self.tokens.get_mut(&key) {
            Some(token) => {
                token.set_client_visible(visible);
                (token.is_client_visible(), token.windows().to_vec())
            }
            None => return Err(WmError::UnknownHandle),
        };
        for window in member_windows {
            if let Some(win) = self.windows.get_mut(&window) {
                win.send_app_visibility(client_visible);
            }
        }
        self.recompute_vsync();
        Ok((Reply::Ok, Vec::new()))
    }

    fn add_window(
        &mut self,
        client: ClientId,
        window: WindowHandle,
        attrs: LayoutParams,
        visible: bool,
        input: bool,
    ) -> DispatchResult {
        let key = WindowKey { client, window };
        if self.windows.contains_key(&key) {
            return Err(WmError::DuplicateRegistration);
        }
        let token_key = TokenKey { client, handle: attrs.token };
        match self.tokens.get(&token_key) {
            Some(token) => {
                debug!("{} joins {} (type {})", window, attrs.token, token.window_type)
            }
            None => {
                warn!("{} references unknown {}", window, attrs.token);
                return Err(WmError::UnknownHandle);
            }
        }
        if self.windows.len() >= self.config.service.window_limit_max {
            self.show_toast("exceed maximum window limit");
            return Err(WmError::LimitExceeded);
        }

        let sink = self.client_sink(client)?;
        let mut win = WindowState::new(key, token_key, sink, attrs, visible);

        let mut fds = Vec::new();
        let mut channel = None;
        if input {
            let name = casement_ipc::event_name(self.client_pid(client));
            let dispatcher = win.create_input_dispatcher(&name)?;
            fds.push(dispatcher.channel().dup_fd()?);
            channel = Some(InputChannelInfo { name, fd_index: 0 });
        }

        if let Some(token) = self.tokens.get_mut(&token_key) {
            token.add_window(key);
        }
        self.root.add_to_stack(key);
        self.windows.insert(key, win);
        info!("{} added ({} windows)", window, self.windows.len());
        Ok((Reply::WindowAdded { channel }, fds))
    }

    fn remove_window(&mut self, client: ClientId, window: WindowHandle) -> DispatchResult {
        let key = WindowKey { client, window };
        if !self.windows.contains_key(&key) {
            // removing twice is a no-op
            debug!("{} already gone", window);
            return Ok((Reply::Ok, Vec::new()));
        }
        self.remove_window_internal(key);
        Ok((Reply::Ok, Vec::new()))
    }

    fn remove_window_internal(&mut self, key: WindowKey) {
        if let Some(mut win) = self.windows.remove(&key) {
            win.remove_if_possible();
            if let Some(token) = self.tokens.get_mut(&win.token) {
                token.remove_window(key);
            }
            self.root.remove_from_stack(key);
        }
        self.recompute_vsync();
    }

    fn relayout(
        &mut self,
        client: ClientId,
        window: WindowHandle,
        attrs: LayoutParams,
        requested_width: i32,
        requested_height: i32,
        visible: bool,
    ) -> DispatchResult {
        let key = WindowKey { client, window };
        let (width, height, format, token) = {
            let win = self.windows.get_mut(&key).ok_or(WmError::UnknownHandle)?;
            win.set_attrs(attrs);
            win.set_requested_size(requested_width, requested_height);
            if !visible {
                win.destroy_surface_control();
                self.recompute_vsync();
                return Ok((Reply::Relayout { surface: None }, Vec::new()));
            }
            // a fresh queue replaces any existing surface; the vsync
            // request survives the swap
            win.reset_surface();
            let (width, height) = win.effective_size();
            (width, height, win.attrs().format, win.attrs().token)
        };

        let by_name = self.config.service.buffer_queue_by_name;
        let pid = self.client_pid(client);
        let slot_size = format.stride(width) * height.max(0) as usize;
        let buffers = self.allocate_buffers(pid, BUFFER_QUEUE_DEPTH, slot_size, by_name)?;

        let handle = SurfaceHandle(self.next_surface);
        self.next_surface += 1;
        let mut control =
            SurfaceControl::new(token, window, handle, width, height, format, buffers);
        if by_name {
            control = control.owning_names();
        }
        let (info, fds) = control.to_wire(by_name)?;

        let win = match self.windows.get_mut(&key) {
            Some(win) => win,
            None => {
                close_all(&fds);
                return Err(WmError::UnknownHandle);
            }
        };
        if let Err(err) = win.install_surface(control) {
            close_all(&fds);
            return Err(err);
        }

        debug!("{} relayout -> surface {:?} {}x{}", window, handle, width, height);
        self.notify_resized(key);
        Ok((Reply::Relayout { surface: Some(info) }, fds))
    }

    fn allocate_buffers(
        &mut self,
        pid: i32,
        count: usize,
        slot_size: usize,
        by_name: bool,
    ) -> Result<Vec<BufferId>, WmError> {
        let mut ids: Vec<BufferId> = Vec::with_capacity(count);
        for _ in 0..count {
            let created = if by_name {
                let name = casement_ipc::buffer_name(pid);
                SharedMemory::create_named(&name, slot_size)
            } else {
                SharedMemory::create_anon(slot_size)
            };
            match created {
                Ok(memory) => {
                    let key = self.next_buffer_key;
                    self.next_buffer_key += 1;
                    let (fd, name) = memory.into_parts();
                    ids.push(BufferId { name, key, fd });
                }
                Err(err) => {
                    // creation is atomic: drop everything from this attempt
                    warn!("buffer allocation failed, rolling back: {}", err);
                    for id in &ids {
                        let _ = nix::unistd::close(id.fd);
                        if let Some(name) = &id.name {
                            let _ = nix::sys::mman::shm_unlink(name.as_str());
                        }
                    }
                    return Err(err);
                }
            }
        }
        Ok(ids)
    }

    fn request_vsync(
        &mut self,
        client: ClientId,
        window: WindowHandle,
        request: VsyncRequest,
    ) -> DispatchResult {
        let key = WindowKey { client, window };
        let win = self.windows.get_mut(&key).ok_or(WmError::UnknownHandle)?;
        let rescheduled = win.schedule_vsync(request);
        self.recompute_vsync();
        Ok((Reply::VsyncScheduled { rescheduled }, Vec::new()))
    }

    fn apply_transaction(&mut self, client: ClientId, states: Vec<LayerState>) -> DispatchResult {
        for state in states {
            let key = WindowKey { client, window: state.window };
            match self.windows.get_mut(&key) {
                Some(win) => win.apply_transaction(state),
                None => debug!("transaction entry for unknown {} skipped", state.window),
            }
        }
        Ok((Reply::Ok, Vec::new()))
    }

    fn monitor_input(
        &mut self,
        client: ClientId,
        token: TokenHandle,
        name: &str,
    ) -> DispatchResult {
        let key = TokenKey { client, handle: token };
        if self.monitors.contains_key(&key) {
            return Err(WmError::DuplicateRegistration);
        }
        let queue_name = casement_ipc::monitor_name(self.client_pid(client), name);
        let monitor = InputMonitor::create(token, name, &queue_name)?;
        let fd = monitor.dispatcher().channel().dup_fd()?;
        self.monitors.insert(key, monitor);
        Ok((
            Reply::InputMonitor { channel: InputChannelInfo { name: queue_name, fd_index: 0 } },
            vec![fd],
        ))
    }

    fn release_input(&mut self, client: ClientId, token: TokenHandle) -> DispatchResult {
        let key = TokenKey { client, handle: token };
        let mut monitor = self.monitors.remove(&key).ok_or(WmError::UnknownHandle)?;
        info!("releasing input monitor {} ({})", monitor.name, monitor.token);
        monitor.release();
        Ok((Reply::Ok, Vec::new()))
    }

    /// Deliver an input event to a window's channel and to every monitor
    #[allow(dead_code)]
    pub fn inject_input(&self, key: WindowKey, message: &InputMessage) {
        if let Some(win) = self.windows.get(&key) {
            match win.input_dispatcher() {
                Some(dispatcher) => {
                    dispatcher.send_message(message);
                }
                None => warn!("input message: {} has no input channel", key.window),
            }
        }
        for monitor in self.monitors.values() {
            monitor.dispatcher().send_message(message);
        }
    }

    /// One vsync tick: compositor pass, then frame callbacks
    pub fn on_vsync(&mut self) {
        self.draw_frame();
        self.response_vsync();
        self.recompute_vsync();
    }

    /// Compositor pass: commit staged transactions and consume queued
    /// buffers, bottom of the stack first
    fn draw_frame(&mut self) {
        for key in self.root.stack() {
            let Some(win) = self.windows.get_mut(&key) else {
                continue;
            };
            win.commit_pending();
            if !win.is_visible() {
                continue;
            }
            let Some(buffer_key) = win.acquire_buffer() else {
                continue;
            };
            if let Some(surface) = win.surface() {
                if let Some(slot) = surface.consumer.slot(buffer_key) {
                    self.root.composite(
                        win.node(),
                        slot,
                        surface.control.width,
                        surface.control.height,
                        surface.control.format,
                    );
                }
            }
            if let Err(err) = win.release_buffer(buffer_key) {
                warn!("{} release of {} failed: {}", key.window, buffer_key, err);
            }
        }
    }

    fn response_vsync(&mut self) {
        for win in self.windows.values_mut() {
            win.on_vsync();
        }
    }

    fn recompute_vsync(&mut self) {
        let active =
            self.windows.values().any(|w| w.vsync_request().is_active() && w.is_visible());
        if active != self.vsync_active {
            debug!("vsync source {}", if active { "enabled" } else { "disabled" });
            self.vsync_active = active;
        }
    }

    /// User-visible failure surface; rendering a real toast is up to the
    /// system shell, the service logs it
    fn show_toast(&self, message: &str) {
        warn!("toast: {}", message);
    }

    fn client_sink(&self, client: ClientId) -> Result<Arc<dyn ClientSink>, WmError> {
        self.clients.get(&client).map(|c| c.sink.clone()).ok_or(WmError::ClientDead)
    }

    fn client_pid(&self, client: ClientId) -> i32 {
        self.clients.get(&client).map(|c| c.pid).unwrap_or(0)
    }

    /// Notify a window that its geometry changed; informational only
    pub fn notify_resized(&self, key: WindowKey) {
        if let Some(win) = self.windows.get(&key) {
            let attrs = win.attrs();
            let (width, height) = win.effective_size();
            let frames = WindowFrames { frame: Rect::from_size(attrs.x, attrs.y, width, height) };
            let display_id = self.tokens.get(&win.token).map(|t| t.display_id).unwrap_or(0);
            if let Some(entry) = self.clients.get(&key.client) {
                entry.sink.send_event(key.window, Event::Resized { frames, display_id });
            }
        }
    }
}

type DispatchResult = Result<(Reply, Vec<RawFd>), WmError>;

fn close_all(fds: &[RawFd]) {
    for fd in fds {
        let _ = nix::unistd::close(*fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use casement_ipc::buffer::BufferProducer;
    use std::sync::Mutex;

    struct TestSink {
        events: Mutex<Vec<(WindowHandle, Event)>>,
    }

    impl TestSink {
        fn new() -> Arc<Self> {
            Arc::new(Self { events: Mutex::new(Vec::new()) })
        }

        fn events(&self) -> Vec<(WindowHandle, Event)> {
            self.events.lock().unwrap().clone()
        }

        fn frames(&self) -> Vec<u32> {
            self.events()
                .into_iter()
                .filter_map(|(_, event)| match event {
                    Event::OnFrame { seq } => Some(seq),
                    _ => None,
                })
                .collect()
        }

        fn released(&self) -> Vec<i32> {
            self.events()
                .into_iter()
                .filter_map(|(_, event)| match event {
                    Event::BufferReleased { key } => Some(key),
                    _ => None,
                })
                .collect()
        }
    }

    impl ClientSink for TestSink {
        fn deliver(&self, message: ServerMessage, fds: Vec<RawFd>) {
            close_all(&fds);
            if let ServerMessage::Event { window, event } = message {
                self.events.lock().unwrap().push((window, event));
            }
        }
    }

    const CLIENT: ClientId = ClientId(1);
    const TOKEN: TokenHandle = TokenHandle(10);
    const WINDOW: WindowHandle = WindowHandle(100);

    fn service_with_limit(limit: usize) -> (WindowManagerService, Arc<TestSink>) {
        let mut config = Config::default();
        config.service.window_limit_max = limit;
        config.display.width = 64;
        config.display.height = 64;
        let mut service = WindowManagerService::new(config);
        let sink = TestSink::new();
        service.register_client(CLIENT, sink.clone());
        let (reply, _) = service.dispatch(CLIENT, Request::Hello { pid: 1234 });
        assert!(matches!(reply, Reply::Ok));
        (service, sink)
    }

    fn attrs(width: i32, height: i32) -> LayoutParams {
        let mut attrs = LayoutParams::new(TOKEN);
        attrs.width = width;
        attrs.height = height;
        attrs
    }

    fn add_window(service: &mut WindowManagerService, window: WindowHandle, width: i32, height: i32) {
        let (reply, _) = service.dispatch(
            CLIENT,
            Request::AddWindowToken { token: TOKEN, window_type: 0, display_id: 0 },
        );
        assert!(matches!(reply, Reply::Ok | Reply::Error { code: 1, .. }));
        let (reply, _) = service.dispatch(
            CLIENT,
            Request::AddWindow {
                window,
                attrs: attrs(width, height),
                visible: true,
                display_id: 0,
                user_id: 0,
                input: false,
            },
        );
        assert!(matches!(reply, Reply::WindowAdded { .. }), "add failed: {:?}", reply);
    }

    fn relayout_visible(
        service: &mut WindowManagerService,
        window: WindowHandle,
        width: i32,
        height: i32,
    ) -> (SurfaceControl, BufferProducer) {
        let (reply, fds) = service.dispatch(
            CLIENT,
            Request::Relayout {
                window,
                attrs: attrs(width, height),
                requested_width: width,
                requested_height: height,
                visible: true,
            },
        );
        let Reply::Relayout { surface: Some(info) } = reply else {
            panic!("relayout failed: {:?}", reply);
        };
        let control = SurfaceControl::from_wire(info, &fds).unwrap();
        let producer = BufferProducer::new(&control).unwrap();
        (control, producer)
    }

    #[test]
    fn s1_happy_frame() {
        let (mut service, sink) = service_with_limit(8);
        add_window(&mut service, WINDOW, 200, 100);
        let (control, mut producer) = relayout_visible(&mut service, WINDOW, 200, 100);

        let (reply, _) = service.dispatch(
            CLIENT,
            Request::RequestVsync { window: WINDOW, request: VsyncRequest::Periodic },
        );
        assert!(matches!(reply, Reply::VsyncScheduled { rescheduled: true }));
        assert!(service.vsync_active());

        service.on_vsync();
        assert_eq!(sink.frames(), vec![1]);

        // client renders
        let key = producer.dequeue_buffer().unwrap();
        producer.slot_mut(key).unwrap().as_mut_slice().fill(0x7F);
        producer.queue_buffer(key).unwrap();

        let mut state = LayerState::new(WINDOW);
        state.set_buffer(key).set_buffer_crop(Rect::from_size(0, 0, 200, 100));
        let (reply, _) =
            service.dispatch(CLIENT, Request::ApplyTransaction { states: vec![state] });
        assert!(matches!(reply, Reply::Ok));

        // next pass acquires, composites, releases, notifies
        service.on_vsync();
        assert_eq!(sink.released(), vec![key]);
        assert_eq!(sink.frames(), vec![1, 2]);
        // the client's pixels reached the screen
        assert_eq!(&service.root().screen()[0..4], &[0x7F; 4]);

        producer.sync_free_state(key).unwrap();
        drop(control);
    }

    #[test]
    fn s3_window_limit_with_toast() {
        let (mut service, _sink) = service_with_limit(1);
        add_window(&mut service, WINDOW, 32, 32);

        let (reply, _) = service.dispatch(
            CLIENT,
            Request::AddWindow {
                window: WindowHandle(101),
                attrs: attrs(32, 32),
                visible: true,
                display_id: 0,
                user_id: 0,
                input: false,
            },
        );
        match reply {
            Reply::Error { code, message } => {
                assert_eq!(code, WmError::LimitExceeded.code());
                assert_eq!(message, "exceed maximum window limit");
            }
            other => panic!("expected limit error, got {:?}", other),
        }
        assert_eq!(service.windows.len(), 1);
    }

    #[test]
    fn s4_hide_cancels_vsync() {
        let (mut service, sink) = service_with_limit(8);
        add_window(&mut service, WINDOW, 32, 32);
        let _surface = relayout_visible(&mut service, WINDOW, 32, 32);

        service.dispatch(
            CLIENT,
            Request::RequestVsync { window: WINDOW, request: VsyncRequest::Periodic },
        );
        assert!(service.vsync_active());

        let (reply, _) = service.dispatch(
            CLIENT,
            Request::UpdateWindowTokenVisibility { token: TOKEN, visible: false },
        );
        assert!(matches!(reply, Reply::Ok));
        assert!(!service.vsync_active());

        service.on_vsync();
        assert!(sink.frames().is_empty());
        assert!(sink
            .events()
            .iter()
            .any(|(_, e)| matches!(e, Event::DispatchAppVisibility { visible: false })));
    }

    #[test]
    fn s5_client_death_cleanup() {
        let (mut service, sink) = service_with_limit(8);
        let (reply, _) = service.dispatch(
            CLIENT,
            Request::AddWindowToken { token: TOKEN, window_type: 0, display_id: 0 },
        );
        assert!(matches!(reply, Reply::Ok));
        let mut with_input = attrs(32, 32);
        with_input.flags |= casement_ipc::types::WindowFlags::INPUT;
        let (reply, fds) = service.dispatch(
            CLIENT,
            Request::AddWindow {
                window: WINDOW,
                attrs: with_input,
                visible: true,
                display_id: 0,
                user_id: 0,
                input: true,
            },
        );
        let Reply::WindowAdded { channel: Some(_) } = reply else {
            panic!("expected input channel: {:?}", reply);
        };
        close_all(&fds);
        let _surface = relayout_visible(&mut service, WINDOW, 32, 32);
        service.dispatch(
            CLIENT,
            Request::RequestVsync { window: WINDOW, request: VsyncRequest::Periodic },
        );

        let frames_before = sink.frames().len();
        service.on_client_died(CLIENT);

        assert_eq!(service.windows.len(), 0);
        assert!(!service.vsync_active());
        let (reply, _) = service.dispatch(CLIENT, Request::IsWindowToken { token: TOKEN });
        assert!(matches!(reply, Reply::IsWindowToken { is_token: false }));

        // no callbacks after death
        service.on_vsync();
        assert_eq!(sink.frames().len(), frames_before);
    }

    #[test]
    fn s6_transaction_order_is_preserved() {
        let (mut service, _sink) = service_with_limit(8);
        add_window(&mut service, WINDOW, 16, 16);
        let (_control, mut producer) = relayout_visible(&mut service, WINDOW, 16, 16);

        let key = producer.dequeue_buffer().unwrap();
        producer.queue_buffer(key).unwrap();

        let mut position = LayerState::new(WINDOW);
        position.set_position(10, 10);
        let mut buffer = LayerState::new(WINDOW);
        buffer.set_buffer(key).set_buffer_crop(Rect::from_size(0, 0, 16, 16));

        service.dispatch(
            CLIENT,
            Request::ApplyTransaction { states: vec![position, buffer] },
        );
        service.on_vsync();

        let win_key = WindowKey { client: CLIENT, window: WINDOW };
        let node = &service.windows[&win_key].node();
        assert_eq!((node.x, node.y), (10, 10));
        assert_eq!(node.crop, Some(Rect::from_size(0, 0, 16, 16)));
    }

    #[test]
    fn s6_disjoint_entries_commute() {
        for reversed in [false, true] {
            let (mut service, _sink) = service_with_limit(8);
            add_window(&mut service, WINDOW, 16, 16);
            let (_control, mut producer) = relayout_visible(&mut service, WINDOW, 16, 16);

            let key = producer.dequeue_buffer().unwrap();
            producer.queue_buffer(key).unwrap();

            let mut position = LayerState::new(WINDOW);
            position.set_position(10, 10);
            let mut buffer = LayerState::new(WINDOW);
            buffer.set_buffer(key).set_buffer_crop(Rect::from_size(0, 0, 8, 8));

            let states =
                if reversed { vec![buffer, position] } else { vec![position, buffer] };
            service.dispatch(CLIENT, Request::ApplyTransaction { states });
            service.on_vsync();

            let win_key = WindowKey { client: CLIENT, window: WINDOW };
            let node = service.windows[&win_key].node();
            assert_eq!((node.x, node.y), (10, 10));
            assert_eq!(node.crop, Some(Rect::from_size(0, 0, 8, 8)));
        }
    }

    #[test]
    fn token_round_trip_restores_state() {
        let (mut service, _sink) = service_with_limit(8);
        add_window(&mut service, WINDOW, 32, 32);

        let (reply, _) = service
            .dispatch(CLIENT, Request::RemoveWindowToken { token: TOKEN, display_id: 0 });
        assert!(matches!(reply, Reply::Ok));

        // invariant: every window of the token is gone with it
        assert_eq!(service.windows.len(), 0);
        let (reply, _) = service.dispatch(CLIENT, Request::IsWindowToken { token: TOKEN });
        assert!(matches!(reply, Reply::IsWindowToken { is_token: false }));
    }

    #[test]
    fn duplicate_token_is_rejected() {
        let (mut service, _sink) = service_with_limit(8);
        let request = Request::AddWindowToken { token: TOKEN, window_type: 0, display_id: 0 };
        let (reply, _) = service.dispatch(CLIENT, request.clone());
        assert!(matches!(reply, Reply::Ok));
        let (reply, _) = service.dispatch(CLIENT, request);
        assert!(matches!(reply, Reply::Error { code: 1, .. }));
    }

    #[test]
    fn schedule_vsync_twice_reports_not_rescheduled() {
        let (mut service, _sink) = service_with_limit(8);
        add_window(&mut service, WINDOW, 32, 32);

        let request =
            Request::RequestVsync { window: WINDOW, request: VsyncRequest::Periodic };
        let (reply, _) = service.dispatch(CLIENT, request.clone());
        assert!(matches!(reply, Reply::VsyncScheduled { rescheduled: true }));
        let (reply, _) = service.dispatch(CLIENT, request);
        assert!(matches!(reply, Reply::VsyncScheduled { rescheduled: false }));
    }

    #[test]
    fn single_vsync_fires_once() {
        let (mut service, sink) = service_with_limit(8);
        add_window(&mut service, WINDOW, 32, 32);
        service.dispatch(
            CLIENT,
            Request::RequestVsync { window: WINDOW, request: VsyncRequest::Single },
        );

        service.on_vsync();
        service.on_vsync();
        assert_eq!(sink.frames(), vec![1]);
        assert!(!service.vsync_active());
    }

    #[test]
    fn remove_window_twice_is_noop() {
        let (mut service, _sink) = service_with_limit(8);
        add_window(&mut service, WINDOW, 32, 32);

        let (reply, _) = service.dispatch(CLIENT, Request::RemoveWindow { window: WINDOW });
        assert!(matches!(reply, Reply::Ok));
        let (reply, _) = service.dispatch(CLIENT, Request::RemoveWindow { window: WINDOW });
        assert!(matches!(reply, Reply::Ok));
        assert_eq!(service.windows.len(), 0);
    }

    #[test]
    fn relayout_hidden_destroys_surface() {
        let (mut service, _sink) = service_with_limit(8);
        add_window(&mut service, WINDOW, 32, 32);
        let _surface = relayout_visible(&mut service, WINDOW, 32, 32);

        let win_key = WindowKey { client: CLIENT, window: WINDOW };
        assert!(service.windows[&win_key].surface().is_some());

        let (reply, _) = service.dispatch(
            CLIENT,
            Request::Relayout {
                window: WINDOW,
                attrs: attrs(32, 32),
                requested_width: 32,
                requested_height: 32,
                visible: false,
            },
        );
        assert!(matches!(reply, Reply::Relayout { surface: None }));
        assert!(!service.windows[&win_key].surface().is_some());
    }

    #[test]
    fn transaction_with_unqueued_key_is_skipped() {
        let (mut service, sink) = service_with_limit(8);
        add_window(&mut service, WINDOW, 16, 16);
        let _surface = relayout_visible(&mut service, WINDOW, 16, 16);

        let mut state = LayerState::new(WINDOW);
        state.set_buffer(9999);
        service.dispatch(CLIENT, Request::ApplyTransaction { states: vec![state] });
        service.on_vsync();
        assert!(sink.released().is_empty());
    }

    #[test]
    fn input_reaches_window_and_monitor() {
        let (mut service, _sink) = service_with_limit(8);
        let (reply, _) = service.dispatch(
            CLIENT,
            Request::AddWindowToken { token: TOKEN, window_type: 0, display_id: 0 },
        );
        assert!(matches!(reply, Reply::Ok));
        let (reply, window_fds) = service.dispatch(
            CLIENT,
            Request::AddWindow {
                window: WINDOW,
                attrs: attrs(16, 16),
                visible: true,
                display_id: 0,
                user_id: 0,
                input: true,
            },
        );
        let Reply::WindowAdded { channel: Some(window_channel) } = reply else {
            panic!("expected channel: {:?}", reply);
        };

        let monitor_token = TokenHandle(77);
        let (reply, monitor_fds) = service.dispatch(
            CLIENT,
            Request::MonitorInput { token: monitor_token, name: "recorder".into(), display_id: 0 },
        );
        let Reply::InputMonitor { channel: monitor_channel } = reply else {
            panic!("expected monitor channel: {:?}", reply);
        };

        let message = InputMessage::pointer(casement_ipc::input::InputState::Pressed, 3, 4);
        service.inject_input(WindowKey { client: CLIENT, window: WINDOW }, &message);

        let window_rx = casement_ipc::input::InputChannel::from_parts(
            window_channel.name,
            window_fds[window_channel.fd_index as usize],
        );
        assert_eq!(window_rx.receive_message(), Some(message));

        let monitor_rx = casement_ipc::input::InputChannel::from_parts(
            monitor_channel.name,
            monitor_fds[monitor_channel.fd_index as usize],
        );
        assert_eq!(monitor_rx.receive_message(), Some(message));

        let (reply, _) =
            service.dispatch(CLIENT, Request::ReleaseInput { token: monitor_token });
        assert!(matches!(reply, Reply::Ok));
    }
}
