//! Shared-memory regions backing buffer-queue slots
//!
//! The service allocates one region per slot; both sides map it
//! independently. The default transport is an anonymous memfd passed by
//! fd; with `buffer_queue_by_name` the region is a named POSIX shm
//! object that clients reopen by name.

use crate::error::WmError;
use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::ptr;
use tracing::warn;

/// One shared-memory region with its backing fd
#[derive(Debug)]
pub struct SharedMemory {
    fd: RawFd,
    name: Option<String>,
    size: usize,
    /// Whether this side created the named object and must unlink it
    owns_name: bool,
}

impl SharedMemory {
    /// Create an anonymous region via memfd
    pub fn create_anon(size: usize) -> Result<Self, WmError> {
        let tag = CString::new("casement-bq").expect("static name");
        let fd = nix::sys::memfd::memfd_create(&tag, nix::sys::memfd::MemFdCreateFlag::MFD_CLOEXEC)?;
        if let Err(err) = nix::unistd::ftruncate(fd, size as libc::off_t) {
            let _ = nix::unistd::close(fd);
            return Err(WmError::AllocationFailure(err.to_string()));
        }
        Ok(Self { fd, name: None, size, owns_name: false })
    }

    /// Create a named region via shm_open
    pub fn create_named(name: &str, size: usize) -> Result<Self, WmError> {
        let fd = shm_open(name, OFlag::O_CREAT | OFlag::O_RDWR, Mode::S_IRUSR | Mode::S_IWUSR)?;
        if let Err(err) = nix::unistd::ftruncate(fd, size as libc::off_t) {
            let _ = nix::unistd::close(fd);
            let _ = shm_unlink(name);
            return Err(WmError::AllocationFailure(err.to_string()));
        }
        Ok(Self { fd, name: Some(name.to_owned()), size, owns_name: true })
    }

    /// Reopen an existing named region (client side, by-name mode)
    pub fn open_named(name: &str, size: usize) -> Result<Self, WmError> {
        let fd = shm_open(name, OFlag::O_RDWR, Mode::S_IRUSR | Mode::S_IWUSR)?;
        Ok(Self { fd, name: Some(name.to_owned()), size, owns_name: false })
    }

    /// Adopt a region fd received over the transport
    pub fn from_fd(fd: RawFd, name: Option<String>, size: usize) -> Self {
        Self { fd, name, size, owns_name: false }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Duplicate the backing fd for transfer over the transport
    pub fn dup_fd(&self) -> Result<RawFd, WmError> {
        Ok(nix::unistd::dup(self.fd)?)
    }

    /// Release ownership of the fd and name without closing or unlinking
    pub fn into_parts(self) -> (RawFd, Option<String>) {
        let fd = self.fd;
        let name = self.name.clone();
        std::mem::forget(self);
        (fd, name)
    }

    /// Map the whole region into this process
    pub fn map(&self) -> Result<SharedMapping, WmError> {
        let ptr = unsafe {
            mmap(
                ptr::null_mut(),
                self.size,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                self.fd,
                0,
            )?
        };
        Ok(SharedMapping { ptr: ptr as *mut u8, len: self.size })
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        if let Err(err) = nix::unistd::close(self.fd) {
            warn!("failed to close shm fd {}: {}", self.fd, err);
        }
        if self.owns_name {
            if let Some(name) = &self.name {
                let _ = shm_unlink(name.as_str());
            }
        }
    }
}

/// A mapped view of a [`SharedMemory`] region, unmapped on drop
#[derive(Debug)]
pub struct SharedMapping {
    ptr: *mut u8,
    len: usize,
}

impl SharedMapping {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl Drop for SharedMapping {
    fn drop(&mut self) {
        if let Err(err) = unsafe { munmap(self.ptr as *mut _, self.len) } {
            warn!("munmap failed: {}", err);
        }
    }
}
