//! Wire protocol between client applications and the service
//!
//! Clients send [`RequestEnvelope`]s and receive [`ServerMessage`]s: a
//! reply matched by sequence number, or an unsolicited per-window event.
//! File descriptors referenced by a message ride in the frame's
//! ancillary data.

use crate::input::InputChannelInfo;
use crate::layer::LayerState;
use crate::surface::SurfaceControlInfo;
use crate::types::{DisplayInfo, LayoutParams, VsyncRequest, WindowFrames, WindowHandle, TokenHandle};
use serde::{Deserialize, Serialize};

/// Client-to-service calls
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    /// First message on a connection; identifies the client process
    Hello { pid: i32 },

    GetPhysicalDisplayInfo { display_id: i32 },

    AddWindowToken { token: TokenHandle, window_type: i32, display_id: i32 },

    RemoveWindowToken { token: TokenHandle, display_id: i32 },

    IsWindowToken { token: TokenHandle },

    UpdateWindowTokenVisibility { token: TokenHandle, visible: bool },

    AddWindow {
        window: WindowHandle,
        attrs: LayoutParams,
        visible: bool,
        display_id: i32,
        user_id: i32,
        input: bool,
    },

    RemoveWindow { window: WindowHandle },

    Relayout {
        window: WindowHandle,
        attrs: LayoutParams,
        requested_width: i32,
        requested_height: i32,
        visible: bool,
    },

    RequestVsync { window: WindowHandle, request: VsyncRequest },

    ApplyTransaction { states: Vec<LayerState> },

    MonitorInput { token: TokenHandle, name: String, display_id: i32 },

    ReleaseInput { token: TokenHandle },
}

/// Service-to-client reply payloads
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Reply {
    Ok,

    Error { code: i32, message: String },

    DisplayInfo { info: DisplayInfo },

    IsWindowToken { is_token: bool },

    /// `addWindow` result; the channel is present when input was requested
    WindowAdded { channel: Option<InputChannelInfo> },

    /// `relayout` result; the surface is present when the window is visible
    Relayout { surface: Option<SurfaceControlInfo> },

    /// Whether a vsync request actually changed state
    VsyncScheduled { rescheduled: bool },

    /// `monitorInput` result
    InputMonitor { channel: InputChannelInfo },
}

/// Unsolicited service-to-client callbacks
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    Moved { x: i32, y: i32 },

    Resized { frames: WindowFrames, display_id: i32 },

    DispatchAppVisibility { visible: bool },

    /// Vsync tick: the window may render one frame
    OnFrame { seq: u32 },

    /// A queued buffer came back from composition
    BufferReleased { key: i32 },
}

/// A client request with its sequence number
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub seq: u64,
    pub request: Request,
}

/// Everything the service sends down a connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ServerMessage {
    Reply { seq: u64, reply: Reply },
    Event { window: WindowHandle, event: Event },
}
