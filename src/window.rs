//! Per-window server state
//!
//! Holds the vsync schedule, the surface and its consumer half of the
//! buffer queue, the input dispatcher, and the render node the
//! compositor pass reads. All mutation happens on the service loop.

use crate::input_dispatcher::InputDispatcher;
use crate::service::{ClientSink, TokenKey, WindowKey};
use casement_ipc::buffer::{BufferConsumer, BufferKey};
use casement_ipc::layer::{LayerFlags, LayerState};
use casement_ipc::proto::Event;
use casement_ipc::surface::SurfaceControl;
use casement_ipc::types::{LayoutParams, Rect, VsyncRequest};
use casement_ipc::WmError;
use std::sync::Arc;
use tracing::{debug, warn};

/// A surface with the service's half of its buffer queue
pub struct ServerSurface {
    pub control: SurfaceControl,
    pub consumer: BufferConsumer,
}

/// Committed render state read by the compositor pass
#[derive(Debug, Default)]
pub struct WindowNode {
    pub x: i32,
    pub y: i32,
    pub alpha: f32,
    pub crop: Option<Rect>,
    /// Layer diffs staged by transactions, committed at pass start
    pub(crate) pending: Vec<LayerState>,
}

impl WindowNode {
    fn new(x: i32, y: i32) -> Self {
        Self { x, y, alpha: 1.0, crop: None, pending: Vec::new() }
    }
}

/// Server record for one window
pub struct WindowState {
    pub key: WindowKey,
    pub token: TokenKey,
    sink: Arc<dyn ClientSink>,
    attrs: LayoutParams,
    visible: bool,
    vsync_request: VsyncRequest,
    frame_seq: u32,
    requested_width: i32,
    requested_height: i32,
    surface: Option<ServerSurface>,
    input: Option<InputDispatcher>,
    node: WindowNode,
}

impl WindowState {
    pub fn new(
        key: WindowKey,
        token: TokenKey,
        sink: Arc<dyn ClientSink>,
        attrs: LayoutParams,
        visible: bool,
    ) -> Self {
        let node = WindowNode::new(attrs.x, attrs.y);
        Self {
            key,
            token,
            sink,
            attrs,
            visible,
            vsync_request: VsyncRequest::None,
            frame_seq: 0,
            requested_width: 0,
            requested_height: 0,
            surface: None,
            input: None,
            node,
        }
    }

    pub fn attrs(&self) -> &LayoutParams {
        &self.attrs
    }

    pub fn set_attrs(&mut self, attrs: LayoutParams) {
        self.node.x = attrs.x;
        self.node.y = attrs.y;
        self.attrs = attrs;
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn vsync_request(&self) -> VsyncRequest {
        self.vsync_request
    }

    pub fn node(&self) -> &WindowNode {
        &self.node
    }

    pub fn surface(&self) -> Option<&ServerSurface> {
        self.surface.as_ref()
    }

    pub fn set_requested_size(&mut self, width: i32, height: i32) {
        if self.requested_width != width || self.requested_height != height {
            self.requested_width = width;
            self.requested_height = height;
        }
    }

    /// Effective size for surface allocation, preferring the requested one
    pub fn effective_size(&self) -> (i32, i32) {
        if self.requested_width > 0 && self.requested_height > 0 {
            (self.requested_width, self.requested_height)
        } else {
            (self.attrs.width, self.attrs.height)
        }
    }

    /// Update the vsync request; `false` means "not rescheduled"
    pub fn schedule_vsync(&mut self, request: VsyncRequest) -> bool {
        if self.vsync_request == request {
            return false;
        }
        self.vsync_request = request;
        true
    }

    /// Vsync tick: deliver `onFrame` if this window asked for it
    pub fn on_vsync(&mut self) -> bool {
        if !self.vsync_request.is_active() || !self.visible {
            return false;
        }
        self.vsync_request = self.vsync_request.advance();
        self.frame_seq += 1;
        debug!("{} onFrame {}", self.key.window, self.frame_seq);
        self.sink.send_event(self.key.window, Event::OnFrame { seq: self.frame_seq });
        true
    }

    /// Token visibility changed: propagate, cancelling vsync when hidden
    pub fn send_app_visibility(&mut self, visible: bool) {
        self.visible = visible;
        if !visible {
            self.schedule_vsync(VsyncRequest::None);
        }
        self.sink.send_event(self.key.window, Event::DispatchAppVisibility { visible });
    }

    /// Install a freshly allocated surface and its consumer half
    pub fn install_surface(&mut self, control: SurfaceControl) -> Result<(), WmError> {
        let consumer = BufferConsumer::new(&control)?;
        self.surface = Some(ServerSurface { control, consumer });
        Ok(())
    }

    /// Drop the surface ahead of reallocation, keeping the vsync request
    pub fn reset_surface(&mut self) {
        self.surface = None;
        self.node.pending.clear();
        self.node.crop = None;
    }

    /// Drop the surface, draining its queue, and stop vsync delivery
    pub fn destroy_surface_control(&mut self) {
        if self.surface.take().is_some() {
            debug!("{} surface destroyed", self.key.window);
        }
        self.node.pending.clear();
        self.node.crop = None;
        self.schedule_vsync(VsyncRequest::None);
    }

    pub fn create_input_dispatcher(&mut self, name: &str) -> Result<&InputDispatcher, WmError> {
        if self.input.is_some() {
            warn!("{} input channel already exists", self.key.window);
            return Err(WmError::DuplicateRegistration);
        }
        let dispatcher = InputDispatcher::create(name)?;
        Ok(self.input.insert(dispatcher))
    }

    pub fn input_dispatcher(&self) -> Option<&InputDispatcher> {
        self.input.as_ref()
    }

    /// Stage one transaction entry onto the node.
    ///
    /// Buffer keys are validated against the queue now (the client queued
    /// the slot before applying); everything else commits at pass start.
    pub fn apply_transaction(&mut self, state: LayerState) {
        if state.flags.contains(LayerFlags::BUFFER) {
            let consumer = match self.surface.as_mut() {
                Some(surface) => &mut surface.consumer,
                None => {
                    warn!("{} transaction names a buffer but has no surface", self.key.window);
                    return;
                }
            };
            if let Err(err) = consumer.sync_queued_state(state.buffer_key) {
                warn!(
                    "{} rejected buffer key {} in transaction: {}",
                    self.key.window, state.buffer_key, err
                );
                return;
            }
        }
        self.node.pending.push(state);
    }

    /// Commit staged layer diffs; runs at the start of the compositor pass
    pub fn commit_pending(&mut self) {
        let pending = std::mem::take(&mut self.node.pending);
        for state in pending {
            if state.flags.contains(LayerFlags::POSITION) {
                self.node.x = state.x;
                self.node.y = state.y;
            }
            if state.flags.contains(LayerFlags::ALPHA) {
                self.node.alpha = state.alpha.clamp(0.0, 1.0);
            }
            if state.flags.contains(LayerFlags::BUFFER_CROP) {
                self.node.crop = Some(state.buffer_crop);
            }
            // LayerFlags::BUFFER was consumed at apply time by
            // sync_queued_state; the pass acquires it below.
        }
    }

    /// Next queued buffer for composition, oldest first
    pub fn acquire_buffer(&mut self) -> Option<BufferKey> {
        self.surface.as_mut()?.consumer.acquire_buffer()
    }

    /// Return a composited buffer and notify the client
    pub fn release_buffer(&mut self, key: BufferKey) -> Result<(), WmError> {
        let surface = self.surface.as_mut().ok_or(WmError::UnknownHandle)?;
        surface.consumer.release_buffer(key)?;
        self.sink.send_event(self.key.window, Event::BufferReleased { key });
        Ok(())
    }

    /// Full teardown; callable once, later calls are no-ops
    pub fn remove_if_possible(&mut self) {
        self.destroy_surface_control();
        if let Some(mut input) = self.input.take() {
            input.release();
        }
        debug!("{} removed", self.key.window);
    }
}
