//! Input channels
//!
//! A named, bounded, non-blocking POSIX message queue carrying fixed-size
//! [`InputMessage`] records from the service to one window (or to a
//! registered monitor). Sends that would overflow the queue drop the
//! message with a warning; readers poll the queue fd for readability.

use crate::error::WmError;
use nix::mqueue::{mq_close, mq_open, mq_receive, mq_send, mq_unlink, MQ_OFlag, MqAttr};
use nix::sys::stat::Mode;
use serde::{Deserialize, Serialize};
use std::ffi::CString;
use std::os::unix::io::RawFd;
use tracing::{debug, warn};

/// Maximum messages held by one channel
pub const MAX_INPUT_MESSAGES: i64 = 8;

/// Send priority; all input shares one priority band
const MSG_PRIO: u32 = 100;

/// Kind of input event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Pointer,
    Key,
}

/// Press state of an input event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputState {
    Pressed,
    Released,
}

/// Fixed-size input record crossing the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputMessage {
    pub kind: InputKind,
    pub state: InputState,
    pub x: i32,
    pub y: i32,
    pub code: u32,
}

/// Encoded size of one message on the queue
pub const INPUT_MESSAGE_SIZE: usize = 20;

impl InputMessage {
    pub fn pointer(state: InputState, x: i32, y: i32) -> Self {
        Self { kind: InputKind::Pointer, state, x, y, code: 0 }
    }

    pub fn key(state: InputState, code: u32) -> Self {
        Self { kind: InputKind::Key, state, x: 0, y: 0, code }
    }

    pub fn encode(&self) -> [u8; INPUT_MESSAGE_SIZE] {
        let mut out = [0u8; INPUT_MESSAGE_SIZE];
        let kind: u32 = match self.kind {
            InputKind::Pointer => 1,
            InputKind::Key => 2,
        };
        let state: u32 = match self.state {
            InputState::Pressed => 1,
            InputState::Released => 2,
        };
        out[0..4].copy_from_slice(&kind.to_le_bytes());
        out[4..8].copy_from_slice(&state.to_le_bytes());
        out[8..12].copy_from_slice(&self.x.to_le_bytes());
        out[12..16].copy_from_slice(&self.y.to_le_bytes());
        out[16..20].copy_from_slice(&self.code.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < INPUT_MESSAGE_SIZE {
            return None;
        }
        let word = |at: usize| u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap());
        let kind = match word(0) {
            1 => InputKind::Pointer,
            2 => InputKind::Key,
            _ => return None,
        };
        let state = match word(4) {
            1 => InputState::Pressed,
            2 => InputState::Released,
            _ => return None,
        };
        Some(Self {
            kind,
            state,
            x: word(8) as i32,
            y: word(12) as i32,
            code: word(16),
        })
    }
}

/// Wire form of a channel: the name plus the queue fd in ancillary data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputChannelInfo {
    pub name: String,
    pub fd_index: u32,
}

/// One end of a named input queue
#[derive(Debug)]
pub struct InputChannel {
    name: String,
    mqd: libc::mqd_t,
    /// The creating side unlinks the name on release
    owns_name: bool,
}

impl InputChannel {
    /// Create the queue; used by the service when a window asks for input
    pub fn create(name: &str) -> Result<Self, WmError> {
        let cname = CString::new(name).map_err(|_| WmError::AllocationFailure("bad name".into()))?;
        let attr = MqAttr::new(0, MAX_INPUT_MESSAGES, INPUT_MESSAGE_SIZE as i64, 0);
        let mqd = mq_open(
            &cname,
            MQ_OFlag::O_CREAT | MQ_OFlag::O_RDWR | MQ_OFlag::O_NONBLOCK,
            Mode::from_bits_truncate(0o600),
            Some(&attr),
        )
        .map_err(|err| WmError::AllocationFailure(format!("mq_open {}: {}", name, err)))?;
        debug!("created input channel {}", name);
        Ok(Self { name: name.to_owned(), mqd, owns_name: true })
    }

    /// Adopt a queue fd received over the transport (client side)
    pub fn from_parts(name: String, fd: RawFd) -> Self {
        Self { name, mqd: fd as libc::mqd_t, owns_name: false }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pollable fd of the queue
    pub fn event_fd(&self) -> RawFd {
        self.mqd as RawFd
    }

    pub fn is_valid(&self) -> bool {
        self.mqd as RawFd >= 0
    }

    /// Duplicate the queue fd for transfer over the transport
    pub fn dup_fd(&self) -> Result<RawFd, WmError> {
        Ok(nix::unistd::dup(self.mqd as RawFd)?)
    }

    /// Non-blocking send; a full queue drops the message
    pub fn send_message(&self, message: &InputMessage) -> Result<(), WmError> {
        if !self.is_valid() {
            return Err(WmError::ClientDead);
        }
        match mq_send(self.mqd, &message.encode(), MSG_PRIO) {
            Ok(()) => Ok(()),
            Err(nix::errno::Errno::EAGAIN) => Err(WmError::ChannelOverflow),
            Err(err) => {
                warn!("input send on {} failed: {}", self.name, err);
                Err(WmError::ClientDead)
            }
        }
    }

    /// Non-blocking receive; `None` when the queue is empty
    pub fn receive_message(&self) -> Option<InputMessage> {
        let mut buf = [0u8; INPUT_MESSAGE_SIZE];
        let mut prio = 0u32;
        match mq_receive(self.mqd, &mut buf, &mut prio) {
            Ok(len) if len >= INPUT_MESSAGE_SIZE => InputMessage::decode(&buf),
            Ok(_) => None,
            Err(_) => None,
        }
    }

    /// Close the queue and, on the owning side, unlink the name
    pub fn release(&mut self) {
        if !self.is_valid() {
            return;
        }
        let _ = mq_close(self.mqd);
        if self.owns_name {
            if let Ok(cname) = CString::new(self.name.as_str()) {
                let _ = mq_unlink(&cname);
                debug!("unlinked input channel {}", self.name);
            }
        }
        self.mqd = -1 as libc::mqd_t;
    }
}

impl Drop for InputChannel {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::next_unique;

    fn unique_name(tag: &str) -> String {
        format!("/casement.test.{}.{}.{}", tag, std::process::id(), next_unique())
    }

    #[test]
    fn message_codec_round_trips() {
        let msg = InputMessage::pointer(InputState::Pressed, 17, -3);
        assert_eq!(InputMessage::decode(&msg.encode()), Some(msg));

        let key = InputMessage::key(InputState::Released, 42);
        assert_eq!(InputMessage::decode(&key.encode()), Some(key));
    }

    #[test]
    fn send_and_receive() {
        let name = unique_name("sr");
        let mut channel = InputChannel::create(&name).unwrap();

        let msg = InputMessage::pointer(InputState::Pressed, 5, 9);
        channel.send_message(&msg).unwrap();
        assert_eq!(channel.receive_message(), Some(msg));
        assert_eq!(channel.receive_message(), None);
        channel.release();
    }

    #[test]
    fn overflow_drops_with_error() {
        let name = unique_name("of");
        let mut channel = InputChannel::create(&name).unwrap();

        let msg = InputMessage::key(InputState::Pressed, 1);
        for _ in 0..MAX_INPUT_MESSAGES {
            channel.send_message(&msg).unwrap();
        }
        assert_eq!(channel.send_message(&msg), Err(WmError::ChannelOverflow));
        channel.release();
    }

    #[test]
    fn release_invalidates_the_channel() {
        let name = unique_name("rel");
        let mut channel = InputChannel::create(&name).unwrap();
        channel.release();
        assert!(!channel.is_valid());
        let msg = InputMessage::key(InputState::Pressed, 1);
        assert_eq!(channel.send_message(&msg), Err(WmError::ClientDead));
    }
}
