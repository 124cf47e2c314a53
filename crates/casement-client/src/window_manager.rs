//! Client window manager
//!
//! Process-wide facade over the service connection: owns the app token,
//! the windows, and the main-loop dispatch. One instance per
//! application; create windows through it and drive it with `run` (or
//! `poll_tasks` from an existing loop).

use crate::base_window::BaseWindow;
use crate::driver::UiDriverProxy;
use crate::event_loop::{spawn_input_pump, ClientTask};
use crate::proxy::{EventForwarder, FrameGate, RemoteWindowService, WindowService};
use crate::transaction::SurfaceTransaction;
use casement_ipc::input::InputChannel;
use casement_ipc::types::{LayoutParams, TokenHandle, VsyncRequest, WindowHandle};
use casement_ipc::WmError;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{info, warn};

/// The primary display
pub const DEFAULT_DISPLAY: i32 = 0;

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

fn next_handle() -> u64 {
    NEXT_HANDLE.fetch_add(1, Ordering::Relaxed)
}

/// A registered input monitor
pub struct InputMonitor {
    pub token: TokenHandle,
    pub channel: InputChannel,
}

struct WindowEntry {
    window: BaseWindow,
    pump_stop: Option<Arc<AtomicBool>>,
}

/// Per-process window manager facade
pub struct WindowManager {
    service: Rc<dyn WindowService>,
    token: TokenHandle,
    display_width: i32,
    display_height: i32,
    windows: HashMap<WindowHandle, WindowEntry>,
    gate: FrameGate,
    task_tx: UnboundedSender<ClientTask>,
    task_rx: Option<UnboundedReceiver<ClientTask>>,
    service_alive: bool,
}

impl WindowManager {
    /// Connect to the running service
    pub fn connect() -> Result<Self, WmError> {
        let (task_tx, task_rx) = unbounded_channel();
        let gate = FrameGate::new();
        let forwarder = EventForwarder::new(gate.clone(), task_tx.clone());
        let service = Rc::new(RemoteWindowService::connect(forwarder)?);
        Self::assemble(service, gate, task_tx, task_rx)
    }

    /// Build a manager over any service implementation, returning the
    /// forwarder a transport (or a test) feeds events into
    pub fn with_service(
        service: Rc<dyn WindowService>,
    ) -> Result<(Self, EventForwarder), WmError> {
        let (task_tx, task_rx) = unbounded_channel();
        let gate = FrameGate::new();
        let forwarder = EventForwarder::new(gate.clone(), task_tx.clone());
        let manager = Self::assemble(service, gate, task_tx, task_rx)?;
        Ok((manager, forwarder))
    }

    fn assemble(
        service: Rc<dyn WindowService>,
        gate: FrameGate,
        task_tx: UnboundedSender<ClientTask>,
        task_rx: UnboundedReceiver<ClientTask>,
    ) -> Result<Self, WmError> {
        let info = service.get_display_info(DEFAULT_DISPLAY)?;
        let token = TokenHandle(next_handle());
        service.add_window_token(token, 0, DEFAULT_DISPLAY)?;
        info!("connected: display {}x{}, {}", info.width, info.height, token);
        Ok(Self {
            service,
            token,
            display_width: info.width,
            display_height: info.height,
            windows: HashMap::new(),
            gate,
            task_tx,
            task_rx: Some(task_rx),
            service_alive: true,
        })
    }

    pub fn token(&self) -> TokenHandle {
        self.token
    }

    pub fn display_size(&self) -> (i32, i32) {
        (self.display_width, self.display_height)
    }

    pub fn window(&self, handle: WindowHandle) -> Option<&BaseWindow> {
        self.windows.get(&handle).map(|entry| &entry.window)
    }

    pub fn window_mut(&mut self, handle: WindowHandle) -> Option<&mut BaseWindow> {
        self.windows.get_mut(&handle).map(|entry| &mut entry.window)
    }

    pub fn window_count(&self) -> usize {
        self.windows.len()
    }

    /// Create a window; `attrs.token` is replaced with the app token
    pub fn new_window(
        &mut self,
        driver: Box<dyn UiDriverProxy>,
        mut attrs: LayoutParams,
    ) -> WindowHandle {
        attrs.token = self.token;
        let handle = WindowHandle(next_handle());
        let window = BaseWindow::new(handle, attrs, driver);
        self.windows.insert(handle, WindowEntry { window, pump_stop: None });
        info!("{} created", handle);
        handle
    }

    /// Register the window with the service, wiring up its input channel
    pub fn attach_window(&mut self, handle: WindowHandle) -> Result<(), WmError> {
        let entry = self.windows.get_mut(&handle).ok_or(WmError::UnknownHandle)?;
        let attrs = entry.window.attrs().clone();
        let channel =
            self.service.add_window(handle, &attrs, true, attrs.has_input())?;
        entry.window.set_visible(true);
        self.gate.register(handle, entry.window.frame_done_flag());
        if let Some(channel) = channel {
            let stop = Arc::new(AtomicBool::new(false));
            spawn_input_pump(handle, channel, self.task_tx.clone(), stop.clone());
            entry.pump_stop = Some(stop);
        }
        Ok(())
    }

    /// Relayout now; normally the first `onFrame` does this lazily
    pub fn relayout_window(&mut self, handle: WindowHandle) -> Result<(), WmError> {
        let entry = self.windows.get_mut(&handle).ok_or(WmError::UnknownHandle)?;
        entry.window.relayout(self.service.as_ref())
    }

    pub fn schedule_vsync(
        &mut self,
        handle: WindowHandle,
        request: VsyncRequest,
    ) -> Result<bool, WmError> {
        let entry = self.windows.get_mut(&handle).ok_or(WmError::UnknownHandle)?;
        entry.window.schedule_vsync(self.service.as_ref(), request)
    }

    /// Remove the window from the service and tear down its local state
    pub fn remove_window(&mut self, handle: WindowHandle) -> Result<(), WmError> {
        let mut entry = self.windows.remove(&handle).ok_or(WmError::UnknownHandle)?;
        if let Some(stop) = entry.pump_stop.take() {
            stop.store(true, Ordering::Relaxed);
        }
        self.gate.unregister(handle);
        if self.service_alive {
            self.service.remove_window(handle)?;
        }
        entry.window.destroy();
        info!("{} removed ({} windows left)", handle, self.windows.len());
        Ok(())
    }

    /// A fresh transaction builder
    pub fn transaction(&self) -> SurfaceTransaction {
        SurfaceTransaction::new()
    }

    pub fn apply(&self, transaction: &mut SurfaceTransaction) -> Result<(), WmError> {
        transaction.apply(self.service.as_ref())
    }

    /// Register a named monitor receiving a copy of all input
    pub fn monitor_input(&self, name: &str) -> Result<InputMonitor, WmError> {
        let token = TokenHandle(next_handle());
        let channel = self.service.monitor_input(token, name, DEFAULT_DISPLAY)?;
        Ok(InputMonitor { token, channel })
    }

    pub fn release_input(&self, monitor: &InputMonitor) -> Result<(), WmError> {
        self.service.release_input(monitor.token)
    }

    /// Dispatch one posted task on the main loop
    pub fn handle_task(&mut self, task: ClientTask) {
        match task {
            ClientTask::OnFrame { window, seq } => {
                if let Some(entry) = self.windows.get_mut(&window) {
                    entry.window.handle_on_frame(self.service.as_ref(), seq);
                    entry.window.frame_done_flag().store(true, Ordering::Release);
                }
            }
            ClientTask::BufferReleased { window, key } => {
                if let Some(entry) = self.windows.get_mut(&window) {
                    entry.window.handle_buffer_released(key);
                }
            }
            ClientTask::AppVisibility { window, visible } => {
                if let Some(entry) = self.windows.get_mut(&window) {
                    entry.window.handle_app_visibility(self.service.as_ref(), visible);
                }
            }
            ClientTask::Moved { window, x, y } => {
                if let Some(entry) = self.windows.get_mut(&window) {
                    let attrs = entry.window.attrs();
                    let frames = casement_ipc::types::WindowFrames {
                        frame: casement_ipc::types::Rect::from_size(
                            x,
                            y,
                            attrs.width,
                            attrs.height,
                        ),
                    };
                    entry.window.handle_geometry(frames);
                }
            }
            ClientTask::Resized { window, frames, .. } => {
                if let Some(entry) = self.windows.get_mut(&window) {
                    entry.window.handle_geometry(frames);
                }
            }
            ClientTask::Input { window, message } => {
                if let Some(entry) = self.windows.get_mut(&window) {
                    entry.window.handle_input(message);
                }
            }
            ClientTask::ServiceDied => {
                warn!("service connection lost");
                self.service_alive = false;
            }
        }
    }

    /// Drain and dispatch everything already posted; used by tests and
    /// by apps embedding their own loop
    pub fn poll_tasks(&mut self) {
        let mut rx = self.task_rx.take().expect("loop already running");
        while let Ok(task) = rx.try_recv() {
            self.handle_task(task);
        }
        self.task_rx = Some(rx);
    }

    /// Run the main loop until the task channel closes
    pub async fn run(&mut self) {
        let mut rx = self.task_rx.take().expect("loop already running");
        while let Some(task) = rx.recv().await {
            self.handle_task(task);
            if !self.service_alive {
                break;
            }
        }
        self.task_rx = Some(rx);
    }

    /// Log the layout of every live window
    pub fn dump_windows(&self) {
        for (number, entry) in self.windows.values().enumerate() {
            let attrs = entry.window.attrs();
            info!("window {}", number + 1);
            info!("\t\tsize: {}x{}", attrs.width, attrs.height);
            info!("\t\tposition: [{}, {}]", attrs.x, attrs.y);
            info!("\t\tvisibility: {}", entry.window.is_visible());
            info!("\t\ttype: {}", attrs.window_type);
            info!("\t\tformat: {:?}", attrs.format);
        }
    }
}

impl Drop for WindowManager {
    fn drop(&mut self) {
        let handles: Vec<WindowHandle> = self.windows.keys().copied().collect();
        for handle in handles {
            let _ = self.remove_window(handle);
        }
        if self.service_alive {
            let _ = self.service.remove_window_token(self.token, DEFAULT_DISPLAY);
        }
    }
}
