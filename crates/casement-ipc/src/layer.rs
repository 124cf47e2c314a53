//! Layer state diffs
//!
//! A transaction is an ordered list of these diffs; each entry carries a
//! change-flag bitset and only the flagged fields are meaningful. The
//! service stages entries onto the target window's node and commits them
//! at the start of the next compositor pass.

use crate::buffer::BufferKey;
use crate::types::{Rect, WindowHandle};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Which fields of a [`LayerState`] changed
    pub struct LayerFlags: u32 {
        const POSITION = 1 << 0;
        const ALPHA = 1 << 1;
        const BUFFER = 1 << 2;
        const BUFFER_CROP = 1 << 3;
    }
}

impl Serialize for LayerFlags {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.bits())
    }
}

impl<'de> Deserialize<'de> for LayerFlags {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bits = u32::deserialize(deserializer)?;
        Ok(LayerFlags::from_bits_truncate(bits))
    }
}

/// A diff of surface properties for one window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerState {
    /// Window whose node this entry targets
    pub window: WindowHandle,
    pub flags: LayerFlags,
    pub x: i32,
    pub y: i32,
    pub alpha: f32,
    pub buffer_key: BufferKey,
    pub buffer_crop: Rect,
}

impl LayerState {
    pub fn new(window: WindowHandle) -> Self {
        Self {
            window,
            flags: LayerFlags::empty(),
            x: 0,
            y: 0,
            alpha: 1.0,
            buffer_key: 0,
            buffer_crop: Rect::default(),
        }
    }

    pub fn set_position(&mut self, x: i32, y: i32) -> &mut Self {
        self.x = x;
        self.y = y;
        self.flags |= LayerFlags::POSITION;
        self
    }

    pub fn set_alpha(&mut self, alpha: f32) -> &mut Self {
        self.alpha = alpha;
        self.flags |= LayerFlags::ALPHA;
        self
    }

    pub fn set_buffer(&mut self, key: BufferKey) -> &mut Self {
        self.buffer_key = key;
        self.flags |= LayerFlags::BUFFER;
        self
    }

    pub fn set_buffer_crop(&mut self, crop: Rect) -> &mut Self {
        self.buffer_crop = crop;
        self.flags |= LayerFlags::BUFFER_CROP;
        self
    }
}
