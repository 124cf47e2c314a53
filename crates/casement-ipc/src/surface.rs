//! Surface handles
//!
//! A `SurfaceControl` bundles everything a client needs to render into a
//! window: the owning token, the server-minted surface handle, the
//! geometry, and the identities of the shared buffers. The wire form
//! references fds by index into the frame's ancillary data.

use crate::buffer::{BufferId, BufferKey};
use crate::error::WmError;
use crate::shm::SharedMemory;
use crate::types::{PixelFormat, SurfaceHandle, TokenHandle, WindowHandle};
use serde::{Deserialize, Serialize};
use std::os::unix::io::RawFd;
use tracing::warn;

/// Client-visible handle to a server-side surface
#[derive(Debug)]
pub struct SurfaceControl {
    pub token: TokenHandle,
    pub window: WindowHandle,
    pub handle: SurfaceHandle,
    pub width: i32,
    pub height: i32,
    pub format: PixelFormat,
    pub buffers: Vec<BufferId>,
    /// Set on the allocating side: named objects are unlinked on drop
    owns_names: bool,
}

impl SurfaceControl {
    pub fn new(
        token: TokenHandle,
        window: WindowHandle,
        handle: SurfaceHandle,
        width: i32,
        height: i32,
        format: PixelFormat,
        buffers: Vec<BufferId>,
    ) -> Self {
        Self { token, window, handle, width, height, format, buffers, owns_names: false }
    }

    /// Mark this control as the allocating side
    pub fn owning_names(mut self) -> Self {
        self.owns_names = true;
        self
    }

    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0 && !self.buffers.is_empty()
    }

    /// Bytes per buffer slot: stride x height
    pub fn slot_size(&self) -> usize {
        self.format.stride(self.width) * self.height.max(0) as usize
    }

    pub fn buffer_keys(&self) -> Vec<BufferKey> {
        self.buffers.iter().map(|b| b.key).collect()
    }

    /// Wire form plus duplicated fds to attach to the frame.
    ///
    /// In by-name mode only names travel; otherwise each buffer
    /// contributes one fd, referenced by index.
    pub fn to_wire(&self, by_name: bool) -> Result<(SurfaceControlInfo, Vec<RawFd>), WmError> {
        let mut fds = Vec::new();
        let mut buffers = Vec::with_capacity(self.buffers.len());
        for id in &self.buffers {
            let fd_index = if by_name && id.name.is_some() {
                None
            } else {
                let dup = match nix::unistd::dup(id.fd) {
                    Ok(fd) => fd,
                    Err(err) => {
                        for fd in fds {
                            let _ = nix::unistd::close(fd);
                        }
                        return Err(WmError::AllocationFailure(err.to_string()));
                    }
                };
                fds.push(dup);
                Some(fds.len() as u32 - 1)
            };
            buffers.push(BufferIdInfo { name: id.name.clone(), key: id.key, fd_index });
        }
        let info = SurfaceControlInfo {
            token: self.token,
            window: self.window,
            handle: self.handle,
            width: self.width,
            height: self.height,
            format: self.format,
            buffers,
        };
        Ok((info, fds))
    }

    /// Rebuild a control from its wire form and the frame's fds.
    ///
    /// Takes ownership of every fd in `fds`; named buffers without an
    /// fd are reopened by name.
    pub fn from_wire(info: SurfaceControlInfo, fds: &[RawFd]) -> Result<Self, WmError> {
        let size = info.format.stride(info.width) * info.height.max(0) as usize;
        let mut buffers = Vec::with_capacity(info.buffers.len());
        for id in info.buffers {
            let fd = match id.fd_index {
                Some(index) => *fds.get(index as usize).ok_or(WmError::UnknownHandle)?,
                None => {
                    let name = id.name.as_deref().ok_or(WmError::UnknownHandle)?;
                    // reopen by name and keep only the raw fd
                    SharedMemory::open_named(name, size)?.into_parts().0
                }
            };
            buffers.push(BufferId { name: id.name, key: id.key, fd });
        }
        Ok(Self {
            token: info.token,
            window: info.window,
            handle: info.handle,
            width: info.width,
            height: info.height,
            format: info.format,
            buffers,
            owns_names: false,
        })
    }
}

impl Drop for SurfaceControl {
    fn drop(&mut self) {
        for id in &self.buffers {
            if let Err(err) = nix::unistd::close(id.fd) {
                warn!("failed to close buffer fd {}: {}", id.fd, err);
            }
            if self.owns_names {
                if let Some(name) = &id.name {
                    let _ = nix::sys::mman::shm_unlink(name.as_str());
                }
            }
        }
    }
}

/// Wire form of one buffer identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferIdInfo {
    pub name: Option<String>,
    pub key: BufferKey,
    /// Index into the frame's ancillary fds; `None` in by-name mode
    pub fd_index: Option<u32>,
}

/// Wire form of a [`SurfaceControl`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurfaceControlInfo {
    pub token: TokenHandle,
    pub window: WindowHandle,
    pub handle: SurfaceHandle,
    pub width: i32,
    pub height: i32,
    pub format: PixelFormat,
    pub buffers: Vec<BufferIdInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anon_control() -> SurfaceControl {
        let size = PixelFormat::Argb8888.stride(4) * 4;
        let buffers = (0..2)
            .map(|i| {
                let memory = SharedMemory::create_anon(size).unwrap();
                BufferId { name: None, key: i, fd: memory.dup_fd().unwrap() }
            })
            .collect();
        SurfaceControl::new(
            TokenHandle(1),
            WindowHandle(2),
            SurfaceHandle(3),
            4,
            4,
            PixelFormat::Argb8888,
            buffers,
        )
    }

    #[test]
    fn wire_round_trip_by_fd() {
        let control = anon_control();
        let (info, fds) = control.to_wire(false).unwrap();
        assert_eq!(fds.len(), 2);

        let rebuilt = SurfaceControl::from_wire(info, &fds).unwrap();
        assert_eq!(rebuilt.window, control.window);
        assert_eq!(rebuilt.buffer_keys(), control.buffer_keys());
        assert_eq!(rebuilt.slot_size(), control.slot_size());
    }

    #[test]
    fn slot_size_uses_stride() {
        let control = anon_control();
        assert_eq!(control.slot_size(), 64);
    }
}
