//! Window tokens
//!
//! A token groups the windows of one client identity and carries the
//! client-visibility flag that propagates to every member window.

use crate::service::WindowKey;
use casement_ipc::types::TokenHandle;

/// Server-side record for one window token
#[derive(Debug)]
pub struct WindowToken {
    pub handle: TokenHandle,
    pub owner_pid: i32,
    pub window_type: i32,
    pub display_id: i32,
    client_visible: bool,
    /// Member windows, in add order; back-references only
    windows: Vec<WindowKey>,
}

impl WindowToken {
    pub fn new(handle: TokenHandle, owner_pid: i32, window_type: i32, display_id: i32) -> Self {
        Self {
            handle,
            owner_pid,
            window_type,
            display_id,
            client_visible: true,
            windows: Vec::new(),
        }
    }

    pub fn is_client_visible(&self) -> bool {
        self.client_visible
    }

    pub fn set_client_visible(&mut self, visible: bool) {
        self.client_visible = visible;
    }

    pub fn add_window(&mut self, key: WindowKey) {
        if !self.windows.contains(&key) {
            self.windows.push(key);
        }
    }

    pub fn remove_window(&mut self, key: WindowKey) {
        self.windows.retain(|w| *w != key);
    }

    pub fn windows(&self) -> &[WindowKey] {
        &self.windows
    }
}
