//! UI driver seam
//!
//! The windowing core never draws; a concrete toolkit implements
//! [`UiDriverProxy`] and renders into dequeued buffer slots. Drivers may
//! attach an opaque cookie to a slot on first dequeue (for example a
//! pre-initialized draw descriptor) and rely on it surviving later
//! dequeues of the same slot; cookies belong to the driver, and
//! `reset_buffer` is where it lets go of them.

use casement_ipc::buffer::BufferSlot;
use casement_ipc::input::InputMessage;
use casement_ipc::types::{PixelFormat, Rect};
use std::rc::Rc;

/// Capability set a drawing toolkit plugs into the window runtime
pub trait UiDriverProxy {
    /// A slot was dequeued for this frame; prepare per-slot state
    fn on_dequeue_buffer(&mut self, slot: &mut BufferSlot);

    /// Render the frame into the slot
    fn draw_frame(&mut self, slot: &mut BufferSlot);

    /// Whether the frame should be presented; `false` cancels the buffer
    fn finish_drawing(&mut self) -> bool;

    /// Damage rect for the transaction, if the driver tracks one
    fn rect_crop(&self) -> Option<Rect>;

    /// An input message arrived on the window's channel
    fn handle_event(&mut self, message: InputMessage);

    fn update_resolution(&mut self, width: i32, height: i32, format: PixelFormat);

    fn update_visibility(&mut self, visible: bool);

    /// The surface is gone; drop every per-slot cookie
    fn reset_buffer(&mut self);
}

/// Per-slot state the dummy driver hangs on a buffer cookie
#[derive(Debug)]
pub struct DrawDescriptor {
    pub id: usize,
}

/// Headless driver used by tests and the demo client.
///
/// Fills each frame with a rotating solid color.
pub struct DummyDriverProxy {
    color: u32,
    frames_drawn: u32,
    dirty: bool,
    visible: bool,
    resolution: Option<(i32, i32)>,
    events: Vec<InputMessage>,
    descriptors: Vec<Rc<DrawDescriptor>>,
}

impl DummyDriverProxy {
    pub fn new() -> Self {
        Self {
            color: 0xFF20_4060,
            frames_drawn: 0,
            dirty: true,
            visible: false,
            resolution: None,
            events: Vec::new(),
            descriptors: Vec::new(),
        }
    }

    /// A driver that declines every frame (nothing dirty)
    pub fn declining() -> Self {
        Self { dirty: false, ..Self::new() }
    }

    pub fn frames_drawn(&self) -> u32 {
        self.frames_drawn
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn events(&self) -> &[InputMessage] {
        &self.events
    }

    pub fn descriptor_count(&self) -> usize {
        self.descriptors.len()
    }
}

impl Default for DummyDriverProxy {
    fn default() -> Self {
        Self::new()
    }
}

impl UiDriverProxy for DummyDriverProxy {
    fn on_dequeue_buffer(&mut self, slot: &mut BufferSlot) {
        if slot.cookie().is_none() {
            let descriptor = Rc::new(DrawDescriptor { id: self.descriptors.len() });
            slot.set_cookie(descriptor.clone());
            self.descriptors.push(descriptor);
        }
    }

    fn draw_frame(&mut self, slot: &mut BufferSlot) {
        let color = self.color.to_le_bytes();
        for pixel in slot.as_mut_slice().chunks_exact_mut(4) {
            pixel.copy_from_slice(&color);
        }
        self.color = self.color.rotate_left(8);
        self.frames_drawn += 1;
    }

    fn finish_drawing(&mut self) -> bool {
        self.dirty
    }

    fn rect_crop(&self) -> Option<Rect> {
        let (width, height) = self.resolution?;
        Some(Rect::from_size(0, 0, width, height))
    }

    fn handle_event(&mut self, message: InputMessage) {
        self.events.push(message);
    }

    fn update_resolution(&mut self, width: i32, height: i32, _format: PixelFormat) {
        self.resolution = Some((width, height));
    }

    fn update_visibility(&mut self, visible: bool) {
        self.visible = visible;
    }

    fn reset_buffer(&mut self) {
        self.descriptors.clear();
    }
}
