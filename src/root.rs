//! Root container
//!
//! Owns the display description, the vsync source, and the screen
//! buffer the compositor pass blits into. The z-order is the order
//! windows were added.

use crate::config::{DisplayConfig, SyncMode};
use crate::service::WindowKey;
use crate::window::WindowNode;
use anyhow::{Context, Result};
use casement_ipc::buffer::BufferSlot;
use casement_ipc::types::{DisplayInfo, PixelFormat, Rect};
use std::fs::File;
use std::io::Read;
use std::os::unix::fs::OpenOptionsExt;
use tokio::io::unix::AsyncFd;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, info};

/// Screen pixel layout; everything composites into ARGB8888
const SCREEN_FORMAT: PixelFormat = PixelFormat::Argb8888;

/// Root of the window graph plus the composition target
pub struct RootContainer {
    info: DisplayInfo,
    /// Window keys in stacking order, bottom first
    stack: Vec<WindowKey>,
    screen: Vec<u8>,
    screen_stride: usize,
}

impl RootContainer {
    pub fn new(display: &DisplayConfig) -> Self {
        let info = display.display_info();
        let screen_stride = SCREEN_FORMAT.stride(info.width);
        Self {
            info,
            stack: Vec::new(),
            screen: vec![0u8; screen_stride * info.height.max(0) as usize],
            screen_stride,
        }
    }

    pub fn display_info(&self) -> DisplayInfo {
        self.info
    }

    pub fn add_to_stack(&mut self, key: WindowKey) {
        if !self.stack.contains(&key) {
            self.stack.push(key);
        }
    }

    pub fn remove_from_stack(&mut self, key: WindowKey) {
        self.stack.retain(|k| *k != key);
    }

    pub fn stack(&self) -> Vec<WindowKey> {
        self.stack.clone()
    }

    /// Pixels of the composited screen, for inspection
    pub fn screen(&self) -> &[u8] {
        &self.screen
    }

    /// Blit one acquired buffer into the screen at the node's position,
    /// honoring the crop rect and alpha.
    pub fn composite(
        &mut self,
        node: &WindowNode,
        slot: &BufferSlot,
        surface_width: i32,
        surface_height: i32,
        format: PixelFormat,
    ) {
        let src_stride = format.stride(surface_width);
        let bpp = format.bytes_per_pixel();
        let full = Rect::from_size(0, 0, surface_width, surface_height);
        let crop = match node.crop {
            Some(crop) => match crop.intersect(&full) {
                Some(rect) => rect,
                None => return,
            },
            None => full,
        };

        let screen_rect = Rect::from_size(0, 0, self.info.width, self.info.height);
        let dest = Rect::from_size(node.x, node.y, crop.width(), crop.height());
        let Some(visible) = dest.intersect(&screen_rect) else {
            return;
        };

        let alpha = (node.alpha.clamp(0.0, 1.0) * 255.0) as u32;
        let src = slot.as_slice();
        for row in 0..visible.height() {
            let src_y = (crop.top + (visible.top - dest.top) + row) as usize;
            let dst_y = (visible.top + row) as usize;
            for col in 0..visible.width() {
                let src_x = (crop.left + (visible.left - dest.left) + col) as usize;
                let dst_x = (visible.left + col) as usize;
                let src_at = src_y * src_stride + src_x * bpp;
                if src_at + bpp > src.len() {
                    continue;
                }
                let pixel = read_argb(&src[src_at..src_at + bpp], format);
                let dst_at = dst_y * self.screen_stride + dst_x * 4;
                let dst = &mut self.screen[dst_at..dst_at + 4];
                let blended = if alpha == 255 {
                    pixel
                } else {
                    blend(u32::from_le_bytes(dst.try_into().unwrap()), pixel, alpha)
                };
                dst.copy_from_slice(&blended.to_le_bytes());
            }
        }
        debug!(
            "composited {}x{} at ({},{})",
            visible.width(),
            visible.height(),
            visible.left,
            visible.top
        );
    }
}

fn read_argb(bytes: &[u8], format: PixelFormat) -> u32 {
    match format {
        PixelFormat::Argb8888 => u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
        PixelFormat::Rgb888 => {
            0xFF00_0000 | (bytes[2] as u32) << 16 | (bytes[1] as u32) << 8 | bytes[0] as u32
        }
        PixelFormat::Rgb565 => {
            let v = u16::from_le_bytes(bytes[0..2].try_into().unwrap()) as u32;
            let r = (v >> 11) << 3;
            let g = ((v >> 5) & 0x3F) << 2;
            let b = (v & 0x1F) << 3;
            0xFF00_0000 | r << 16 | g << 8 | b
        }
    }
}

fn blend(dst: u32, src: u32, alpha: u32) -> u32 {
    let mut out = 0xFF00_0000;
    for shift in [16, 8, 0] {
        let d = (dst >> shift) & 0xFF;
        let s = (src >> shift) & 0xFF;
        let mixed = (s * alpha + d * (255 - alpha)) / 255;
        out |= mixed << shift;
    }
    out
}

/// Where vsync ticks come from
pub enum VsyncSource {
    Timer(Interval),
    Fd(AsyncFd<File>),
}

impl VsyncSource {
    pub fn new(display: &DisplayConfig) -> Result<Self> {
        match display.sync_mode {
            SyncMode::Timer => {
                let mut timer = interval(display.display_info().refresh_period());
                timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
                let refresh_hz = display.refresh_hz;
                info!("vsync source: timer at {} Hz", refresh_hz);
                Ok(VsyncSource::Timer(timer))
            }
            SyncMode::VsyncFd => {
                let fbdev_device_path = &display.fbdev_device_path;
                let file = std::fs::OpenOptions::new()
                    .read(true)
                    .custom_flags(libc::O_NONBLOCK)
                    .open(fbdev_device_path)
                    .with_context(|| {
                        format!("failed to open vsync fd {}", fbdev_device_path)
                    })?;
                info!("vsync source: fd {}", fbdev_device_path);
                Ok(VsyncSource::Fd(AsyncFd::new(file)?))
            }
        }
    }

    /// Resolve on the next vsync tick
    pub async fn tick(&mut self) {
        match self {
            VsyncSource::Timer(timer) => {
                timer.tick().await;
            }
            VsyncSource::Fd(fd) => loop {
                let Ok(mut guard) = fd.readable().await else {
                    return;
                };
                let mut scratch = [0u8; 8];
                match guard.try_io(|inner| inner.get_ref().read(&mut scratch)) {
                    Ok(_) => return,
                    Err(_would_block) => continue,
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use casement_ipc::buffer::{BufferId, BufferProducer};
    use casement_ipc::shm::SharedMemory;
    use casement_ipc::surface::SurfaceControl;
    use casement_ipc::types::{SurfaceHandle, TokenHandle, WindowHandle};

    fn small_display() -> DisplayConfig {
        DisplayConfig { width: 8, height: 8, ..Default::default() }
    }

    fn one_slot_control(width: i32, height: i32) -> SurfaceControl {
        let size = PixelFormat::Argb8888.stride(width) * height as usize;
        let memory = SharedMemory::create_anon(size).unwrap();
        let buffers = vec![BufferId { name: None, key: 1, fd: memory.dup_fd().unwrap() }];
        SurfaceControl::new(
            TokenHandle(1),
            WindowHandle(1),
            SurfaceHandle(1),
            width,
            height,
            PixelFormat::Argb8888,
            buffers,
        )
    }

    #[test]
    fn composite_copies_pixels_at_position() {
        let mut root = RootContainer::new(&small_display());
        let control = one_slot_control(2, 2);
        let mut producer = BufferProducer::new(&control).unwrap();

        let key = producer.dequeue_buffer().unwrap();
        let slot = producer.slot_mut(key).unwrap();
        for pixel in slot.as_mut_slice().chunks_exact_mut(4) {
            pixel.copy_from_slice(&0xFFAA_BBCCu32.to_le_bytes());
        }

        let node = WindowNode { x: 3, y: 3, alpha: 1.0, ..Default::default() };
        root.composite(&node, producer.slot(key).unwrap(), 2, 2, PixelFormat::Argb8888);

        let stride = PixelFormat::Argb8888.stride(8);
        let at = 3 * stride + 3 * 4;
        assert_eq!(&root.screen()[at..at + 4], &0xFFAA_BBCCu32.to_le_bytes());
        // outside the window stays untouched
        assert_eq!(&root.screen()[0..4], &[0, 0, 0, 0]);
    }

    #[test]
    fn composite_honors_crop() {
        let mut root = RootContainer::new(&small_display());
        let control = one_slot_control(4, 4);
        let mut producer = BufferProducer::new(&control).unwrap();

        let key = producer.dequeue_buffer().unwrap();
        producer.slot_mut(key).unwrap().as_mut_slice().fill(0xFF);

        let node = WindowNode {
            x: 0,
            y: 0,
            alpha: 1.0,
            crop: Some(Rect::from_size(0, 0, 1, 1)),
            ..Default::default()
        };
        root.composite(&node, producer.slot(key).unwrap(), 4, 4, PixelFormat::Argb8888);

        assert_eq!(&root.screen()[0..4], &[0xFF; 4]);
        // the pixel right of the crop is untouched
        assert_eq!(&root.screen()[4..8], &[0, 0, 0, 0]);
    }

    #[test]
    fn stack_preserves_add_order() {
        let mut root = RootContainer::new(&small_display());
        let a = WindowKey { client: crate::service::ClientId(1), window: WindowHandle(1) };
        let b = WindowKey { client: crate::service::ClientId(1), window: WindowHandle(2) };
        root.add_to_stack(a);
        root.add_to_stack(b);
        root.add_to_stack(a);
        assert_eq!(root.stack(), vec![a, b]);
        root.remove_from_stack(a);
        assert_eq!(root.stack(), vec![b]);
    }
}
