//! Input dispatch
//!
//! Each input-enabled window owns a dispatcher wrapping its bounded
//! channel; named monitors additionally receive a copy of every event.
//! Sends never block: a full queue drops the message with a warning.

use casement_ipc::input::{InputChannel, InputMessage};
use casement_ipc::types::TokenHandle;
use casement_ipc::WmError;
use tracing::{info, warn};

/// Delivers input messages to one window's channel
pub struct InputDispatcher {
    channel: InputChannel,
}

impl InputDispatcher {
    pub fn create(name: &str) -> Result<Self, WmError> {
        Ok(Self { channel: InputChannel::create(name)? })
    }

    pub fn channel(&self) -> &InputChannel {
        &self.channel
    }

    /// Non-blocking send; overflow drops the message
    pub fn send_message(&self, message: &InputMessage) -> bool {
        match self.channel.send_message(message) {
            Ok(()) => true,
            Err(WmError::ChannelOverflow) => {
                warn!("input channel {} full, dropping message", self.channel.name());
                false
            }
            Err(err) => {
                warn!("input send on {} failed: {}", self.channel.name(), err);
                false
            }
        }
    }

    pub fn release(&mut self) {
        self.channel.release();
    }
}

/// A named monitor channel receiving a copy of every dispatched event
pub struct InputMonitor {
    pub token: TokenHandle,
    pub name: String,
    dispatcher: InputDispatcher,
}

impl InputMonitor {
    pub fn create(token: TokenHandle, name: &str, queue_name: &str) -> Result<Self, WmError> {
        info!("registering input monitor {}", name);
        Ok(Self {
            token,
            name: name.to_owned(),
            dispatcher: InputDispatcher::create(queue_name)?,
        })
    }

    pub fn dispatcher(&self) -> &InputDispatcher {
        &self.dispatcher
    }

    pub fn release(&mut self) {
        self.dispatcher.release();
    }
}
