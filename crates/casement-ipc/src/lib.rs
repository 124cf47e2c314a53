//! Casement IPC Protocol
//!
//! Shared types and mechanisms for communication between the casement
//! display service and client applications: wire messages, the framed
//! fd-passing transport, shared-memory buffer queues, surface handles,
//! layer state, and input channels.

pub mod buffer;
pub mod error;
pub mod input;
pub mod layer;
pub mod proto;
pub mod shm;
pub mod surface;
pub mod transport;
pub mod types;

pub use error::WmError;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

/// Socket path for service IPC
pub fn socket_path() -> PathBuf {
    let runtime_dir = std::env::var("XDG_RUNTIME_DIR").unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(runtime_dir).join("casement-wm.sock")
}

static UNIQUE: AtomicU64 = AtomicU64::new(1);

/// Process-wide unique suffix for shared object names
pub fn next_unique() -> u64 {
    UNIQUE.fetch_add(1, Ordering::Relaxed)
}

// Linux restricts shm/mq object names to a single path component, so the
// hierarchical graphics layout is encoded with dots.

/// Shared-memory object name for a buffer-queue slot owned by `pid`
pub fn buffer_name(pid: i32) -> String {
    format!("/casement.{}.bq.{}", pid, next_unique())
}

/// Message-queue name for the input channel of a window owned by `pid`
pub fn event_name(pid: i32) -> String {
    format!("/casement.{}.event.{}", pid, next_unique())
}

/// Message-queue name for a named input monitor registered by `pid`
pub fn monitor_name(pid: i32, name: &str) -> String {
    format!("/casement.monitor.{}.{}", pid, name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_suffixes_are_distinct() {
        let a = buffer_name(42);
        let b = buffer_name(42);
        assert_ne!(a, b);
        assert!(a.starts_with("/casement.42.bq."));
    }

    #[test]
    fn monitor_names_are_stable() {
        assert_eq!(monitor_name(7, "recorder"), "/casement.monitor.7.recorder");
    }
}
