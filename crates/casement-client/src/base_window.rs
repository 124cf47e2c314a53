//! Client-side window
//!
//! Owns the producer half of the buffer queue and the UI driver, and
//! handles the callbacks the service sends: frame ticks, buffer
//! releases, and visibility changes. Everything here runs on the app's
//! main loop.

use crate::driver::UiDriverProxy;
use crate::proxy::WindowService;
use crate::transaction::SurfaceTransaction;
use casement_ipc::buffer::{BufferKey, BufferProducer};
use casement_ipc::surface::SurfaceControl;
use casement_ipc::types::{LayoutParams, VsyncRequest, WindowFrames, WindowHandle};
use casement_ipc::WmError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// A surface with the client's half of its buffer queue
pub struct ClientSurface {
    pub control: SurfaceControl,
    pub producer: BufferProducer,
}

/// Hook invoked when the service reports a geometry change
pub type GeometryListener = Box<dyn Fn(WindowFrames)>;

/// Client-side window state
pub struct BaseWindow {
    handle: WindowHandle,
    attrs: LayoutParams,
    vsync_request: VsyncRequest,
    app_visible: bool,
    /// Cleared when a frame tick is posted, set when its work is done.
    /// The transport thread reads it through the frame gate.
    frame_done: Arc<AtomicBool>,
    surface: Option<ClientSurface>,
    driver: Box<dyn UiDriverProxy>,
    geometry_listener: Option<GeometryListener>,
}

impl BaseWindow {
    pub fn new(handle: WindowHandle, attrs: LayoutParams, driver: Box<dyn UiDriverProxy>) -> Self {
        Self {
            handle,
            attrs,
            vsync_request: VsyncRequest::None,
            app_visible: false,
            frame_done: Arc::new(AtomicBool::new(true)),
            surface: None,
            driver,
            geometry_listener: None,
        }
    }

    pub fn handle(&self) -> WindowHandle {
        self.handle
    }

    pub fn attrs(&self) -> &LayoutParams {
        &self.attrs
    }

    pub fn is_visible(&self) -> bool {
        self.app_visible
    }

    pub fn set_visible(&mut self, visible: bool) {
        self.app_visible = visible;
    }

    pub fn frame_done_flag(&self) -> Arc<AtomicBool> {
        self.frame_done.clone()
    }

    pub fn surface(&self) -> Option<&ClientSurface> {
        self.surface.as_ref()
    }

    pub fn driver(&self) -> &dyn UiDriverProxy {
        self.driver.as_ref()
    }

    /// Geometry callbacks are informational; this is the hook point
    pub fn set_geometry_listener(&mut self, listener: GeometryListener) {
        self.geometry_listener = Some(listener);
    }

    /// Ask the service for vsync ticks; `false` when nothing changed
    pub fn schedule_vsync(
        &mut self,
        service: &dyn WindowService,
        request: VsyncRequest,
    ) -> Result<bool, WmError> {
        if self.vsync_request == request {
            debug!("{} still waiting for the previous vsync", self.handle);
            return Ok(false);
        }
        self.vsync_request = request;
        service.request_vsync(self.handle, request)?;
        Ok(true)
    }

    /// Relayout against the service and install (or drop) the surface
    pub fn relayout(&mut self, service: &dyn WindowService) -> Result<(), WmError> {
        let surface = service.relayout(
            self.handle,
            &self.attrs,
            self.attrs.width,
            self.attrs.height,
            self.app_visible,
        )?;
        match surface {
            Some(control) => self.install_surface(control),
            None => {
                self.clear_surface();
                Ok(())
            }
        }
    }

    fn install_surface(&mut self, control: SurfaceControl) -> Result<(), WmError> {
        let producer = BufferProducer::new(&control)?;
        self.driver.update_resolution(control.width, control.height, control.format);
        debug!("{} installed surface {}x{}", self.handle, control.width, control.height);
        self.surface = Some(ClientSurface { control, producer });
        Ok(())
    }

    fn clear_surface(&mut self) {
        if self.surface.take().is_some() {
            debug!("{} surface released", self.handle);
        }
        self.driver.reset_buffer();
    }

    /// Frame tick on the main loop: dequeue, draw, queue, apply
    pub fn handle_on_frame(&mut self, service: &dyn WindowService, seq: u32) {
        self.vsync_request = self.vsync_request.advance();

        if self.surface.is_none() {
            // first frame after becoming visible: get a surface, draw next tick
            if let Err(err) = self.relayout(service) {
                warn!("{} relayout on frame {} failed: {}", self.handle, seq, err);
            }
            return;
        }

        let Some(surface) = self.surface.as_mut() else {
            return;
        };
        let Some(key) = surface.producer.dequeue_buffer() else {
            warn!("{} frame {}: no valid buffer", self.handle, seq);
            return;
        };

        match surface.producer.slot_mut(key) {
            Ok(slot) => {
                self.driver.on_dequeue_buffer(slot);
                self.driver.draw_frame(slot);
            }
            Err(err) => {
                warn!("{} frame {}: {}", self.handle, seq, err);
                return;
            }
        }

        if !self.driver.finish_drawing() {
            // nothing dirty; put the buffer back
            if let Err(err) = surface.producer.cancel_buffer(key) {
                warn!("{} cancel of {} failed: {}", self.handle, key, err);
            }
            return;
        }

        if let Err(err) = surface.producer.queue_buffer(key) {
            warn!("{} queue of {} failed: {}", self.handle, key, err);
            return;
        }

        let mut transaction = SurfaceTransaction::new();
        transaction.set_buffer(&surface.control, key);
        if let Some(crop) = self.driver.rect_crop() {
            transaction.set_buffer_crop(&surface.control, crop);
        }
        debug!("{} frame {} applying transaction", self.handle, seq);
        if let Err(err) = transaction.apply(service) {
            warn!("{} frame {} transaction failed: {}", self.handle, seq, err);
        }
    }

    /// Release notification on the main loop: slot back to FREE
    pub fn handle_buffer_released(&mut self, key: BufferKey) {
        let Some(surface) = self.surface.as_mut() else {
            warn!("{} release of {} without a surface", self.handle, key);
            return;
        };
        if let Err(err) = surface.producer.sync_free_state(key) {
            warn!("{} release of {} failed: {}", self.handle, key, err);
        }
    }

    /// Visibility from the service on the main loop
    pub fn handle_app_visibility(&mut self, service: &dyn WindowService, visible: bool) {
        if self.app_visible == visible {
            return;
        }
        self.app_visible = visible;
        self.driver.update_visibility(visible);
        if let Err(err) = self.relayout(service) {
            warn!("{} relayout on visibility change failed: {}", self.handle, err);
        }
    }

    pub fn handle_input(&mut self, message: casement_ipc::input::InputMessage) {
        self.driver.handle_event(message);
    }

    pub fn handle_geometry(&mut self, frames: WindowFrames) {
        if let Some(listener) = &self.geometry_listener {
            listener(frames);
        }
    }

    /// Final teardown when the window is removed
    pub fn destroy(&mut self) {
        self.clear_surface();
        self.vsync_request = VsyncRequest::None;
    }
}
