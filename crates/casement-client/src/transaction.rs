//! Surface transactions
//!
//! Batches layer-state changes and applies them in one IPC call.
//! Changes to the same surface merge into a single entry; entries for
//! different surfaces keep their insertion order.

use crate::proxy::WindowService;
use casement_ipc::buffer::BufferKey;
use casement_ipc::layer::LayerState;
use casement_ipc::surface::SurfaceControl;
use casement_ipc::types::{Rect, WindowHandle};
use casement_ipc::WmError;

/// A batched, atomic set of layer-state changes
#[derive(Default)]
pub struct SurfaceTransaction {
    order: Vec<WindowHandle>,
    states: Vec<LayerState>,
}

impl SurfaceTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&mut self, control: &SurfaceControl) -> &mut LayerState {
        let window = control.window;
        let at = match self.order.iter().position(|w| *w == window) {
            Some(at) => at,
            None => {
                self.order.push(window);
                self.states.push(LayerState::new(window));
                self.states.len() - 1
            }
        };
        &mut self.states[at]
    }

    pub fn set_position(&mut self, control: &SurfaceControl, x: i32, y: i32) -> &mut Self {
        self.entry(control).set_position(x, y);
        self
    }

    pub fn set_alpha(&mut self, control: &SurfaceControl, alpha: f32) -> &mut Self {
        self.entry(control).set_alpha(alpha);
        self
    }

    pub fn set_buffer(&mut self, control: &SurfaceControl, key: BufferKey) -> &mut Self {
        self.entry(control).set_buffer(key);
        self
    }

    pub fn set_buffer_crop(&mut self, control: &SurfaceControl, crop: Rect) -> &mut Self {
        self.entry(control).set_buffer_crop(crop);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Send every pending entry to the service; the transaction is empty
    /// afterwards, ready for reuse
    pub fn apply(&mut self, service: &dyn WindowService) -> Result<(), WmError> {
        if self.states.is_empty() {
            return Ok(());
        }
        let states = std::mem::take(&mut self.states);
        self.order.clear();
        service.apply_transaction(states)
    }

    /// Drop pending entries without applying them
    pub fn clean(&mut self) {
        self.states.clear();
        self.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use casement_ipc::layer::LayerFlags;
    use casement_ipc::types::{PixelFormat, SurfaceHandle, TokenHandle};

    fn control(window: u64) -> SurfaceControl {
        SurfaceControl::new(
            TokenHandle(1),
            WindowHandle(window),
            SurfaceHandle(window),
            4,
            4,
            PixelFormat::Argb8888,
            Vec::new(),
        )
    }

    #[test]
    fn same_surface_merges_into_one_entry() {
        let control = control(1);
        let mut txn = SurfaceTransaction::new();
        txn.set_buffer(&control, 5).set_buffer_crop(&control, Rect::from_size(0, 0, 4, 4));

        assert_eq!(txn.states.len(), 1);
        assert!(txn.states[0].flags.contains(LayerFlags::BUFFER | LayerFlags::BUFFER_CROP));
    }

    #[test]
    fn different_surfaces_keep_order() {
        let first = control(1);
        let second = control(2);
        let mut txn = SurfaceTransaction::new();
        txn.set_position(&first, 1, 1);
        txn.set_position(&second, 2, 2);
        txn.set_alpha(&first, 0.5);

        assert_eq!(txn.states.len(), 2);
        assert_eq!(txn.states[0].window, WindowHandle(1));
        assert_eq!(txn.states[1].window, WindowHandle(2));
    }

    #[test]
    fn clean_discards_pending_entries() {
        let control = control(1);
        let mut txn = SurfaceTransaction::new();
        txn.set_position(&control, 3, 3);
        txn.clean();
        assert!(txn.is_empty());
    }
}
