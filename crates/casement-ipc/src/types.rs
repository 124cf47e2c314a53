//! Core data types shared by the service and client runtimes

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Opaque token handle, minted by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenHandle(pub u64);

/// Opaque window handle, minted by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WindowHandle(pub u64);

/// Surface handle, minted by the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SurfaceHandle(pub u64);

impl fmt::Display for TokenHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "token:{}", self.0)
    }
}

impl fmt::Display for WindowHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "window:{}", self.0)
    }
}

/// Physical display description: immutable for the life of the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayInfo {
    pub width: i32,
    pub height: i32,
    /// Refresh period in nanoseconds
    pub refresh_ns: u64,
}

impl DisplayInfo {
    pub fn refresh_period(&self) -> Duration {
        Duration::from_nanos(self.refresh_ns)
    }
}

/// Rectangle with inclusive corners
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self { left, top, right, bottom }
    }

    pub fn from_size(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { left: x, top: y, right: x + width - 1, bottom: y + height - 1 }
    }

    pub fn width(&self) -> i32 {
        self.right - self.left + 1
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top + 1
    }

    pub fn is_empty(&self) -> bool {
        self.right < self.left || self.bottom < self.top
    }

    /// Intersection, or `None` when the rects do not overlap
    pub fn intersect(&self, other: &Rect) -> Option<Rect> {
        let r = Rect {
            left: self.left.max(other.left),
            top: self.top.max(other.top),
            right: self.right.min(other.right),
            bottom: self.bottom.min(other.bottom),
        };
        if r.is_empty() {
            None
        } else {
            Some(r)
        }
    }
}

/// Pixel formats understood by the compositor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PixelFormat {
    Argb8888,
    Rgb888,
    Rgb565,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Argb8888 => 4,
            PixelFormat::Rgb888 => 3,
            PixelFormat::Rgb565 => 2,
        }
    }

    /// Row stride in bytes, rounded up to 4-byte alignment
    pub fn stride(&self, width: i32) -> usize {
        let raw = width.max(0) as usize * self.bytes_per_pixel();
        (raw + 3) & !3
    }
}

/// Per-window vsync request state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VsyncRequest {
    None,
    Single,
    Periodic,
}

impl VsyncRequest {
    /// State after a vsync tick fires: `Single` is consumed, `Periodic` re-arms
    pub fn advance(self) -> Self {
        match self {
            VsyncRequest::Single => VsyncRequest::None,
            other => other,
        }
    }

    pub fn is_active(self) -> bool {
        !matches!(self, VsyncRequest::None)
    }
}

bitflags! {
    /// Window behavior flags carried in [`LayoutParams`]
    pub struct WindowFlags: u32 {
        /// The window wants an input channel
        const INPUT = 1 << 0;
        /// The window is not composited with alpha blending
        const OPAQUE = 1 << 1;
    }
}

impl Serialize for WindowFlags {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.bits())
    }
}

impl<'de> Deserialize<'de> for WindowFlags {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bits = u32::deserialize(deserializer)?;
        Ok(WindowFlags::from_bits_truncate(bits))
    }
}

/// Window layout parameters supplied by the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutParams {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
    pub format: PixelFormat,
    pub window_type: i32,
    pub flags: WindowFlags,
    pub token: TokenHandle,
}

impl LayoutParams {
    pub fn new(token: TokenHandle) -> Self {
        Self {
            x: 0,
            y: 0,
            width: 0,
            height: 0,
            format: PixelFormat::Argb8888,
            window_type: 0,
            flags: WindowFlags::empty(),
            token,
        }
    }

    pub fn has_input(&self) -> bool {
        self.flags.contains(WindowFlags::INPUT)
    }
}

/// Window geometry reported by `resized`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowFrames {
    pub frame: Rect,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vsync_advance_table() {
        assert_eq!(VsyncRequest::None.advance(), VsyncRequest::None);
        assert_eq!(VsyncRequest::Single.advance(), VsyncRequest::None);
        assert_eq!(VsyncRequest::Periodic.advance(), VsyncRequest::Periodic);
    }

    #[test]
    fn stride_rounds_up() {
        assert_eq!(PixelFormat::Argb8888.stride(200), 800);
        assert_eq!(PixelFormat::Rgb888.stride(3), 12);
        assert_eq!(PixelFormat::Rgb565.stride(5), 12);
    }

    #[test]
    fn rect_dimensions_are_inclusive() {
        let r = Rect::from_size(0, 0, 200, 100);
        assert_eq!(r.right, 199);
        assert_eq!(r.bottom, 99);
        assert_eq!(r.width(), 200);
        assert_eq!(r.height(), 100);
    }

    #[test]
    fn rect_intersection() {
        let a = Rect::from_size(0, 0, 10, 10);
        let b = Rect::from_size(5, 5, 10, 10);
        assert_eq!(a.intersect(&b), Some(Rect::new(5, 5, 9, 9)));
        let c = Rect::from_size(20, 20, 5, 5);
        assert_eq!(a.intersect(&c), None);
    }
}
