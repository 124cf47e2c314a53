//! Casement client runtime
//!
//! In-process window runtime for applications: connects to the casement
//! service, owns the client side of each window (buffer producer, UI
//! driver, frame pacing), and dispatches service callbacks on the app's
//! main loop.

pub mod base_window;
pub mod driver;
pub mod event_loop;
pub mod proxy;
pub mod transaction;
pub mod window_manager;

pub use base_window::BaseWindow;
pub use driver::{DummyDriverProxy, UiDriverProxy};
pub use event_loop::ClientTask;
pub use proxy::{EventForwarder, FrameGate, RemoteWindowService, WindowService};
pub use transaction::SurfaceTransaction;
pub use window_manager::{InputMonitor, WindowManager, DEFAULT_DISPLAY};
