//! Framed fd-passing transport
//!
//! Every message is one JSON frame behind a fixed header
//! `{magic, payload len, fd count}` (big-endian). File descriptors are
//! attached as `SCM_RIGHTS` ancillary data on the sendmsg call that
//! writes the header, and consumed in FIFO order on the receiving side,
//! `fd count` per frame.

use anyhow::{anyhow, bail, Context, Result};
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use nix::sys::uio::IoVec;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::VecDeque;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use tracing::warn;

/// "CASE" in ASCII
pub const FRAME_MAGIC: u32 = 0x43415345;

const HEADER_LEN: usize = 12;

/// Refuse frames larger than this
const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Split a stream into its reader and writer halves
pub fn split(stream: UnixStream) -> std::io::Result<(MessageReader, MessageWriter)> {
    let write_half = stream.try_clone()?;
    Ok((
        MessageReader { stream, buf: Vec::new(), fds: VecDeque::new() },
        MessageWriter { stream: write_half },
    ))
}

/// Sending half of a connection
pub struct MessageWriter {
    stream: UnixStream,
}

impl MessageWriter {
    /// Send one frame; `fds` are duplicated into the peer process.
    ///
    /// The caller keeps ownership of the fds and closes them afterwards.
    pub fn send<T: Serialize>(&mut self, msg: &T, fds: &[RawFd]) -> Result<()> {
        let payload = serde_json::to_vec(msg).context("encode frame")?;
        if payload.len() > MAX_FRAME_LEN {
            bail!("frame too large: {} bytes", payload.len());
        }

        let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
        frame.extend_from_slice(&FRAME_MAGIC.to_be_bytes());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&(fds.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);

        let mut sent = 0;
        while sent < frame.len() {
            let iov = [IoVec::from_slice(&frame[sent..])];
            let cmsgs = if sent == 0 && !fds.is_empty() {
                vec![ControlMessage::ScmRights(fds)]
            } else {
                Vec::new()
            };
            let n = sendmsg(
                self.stream.as_raw_fd(),
                &iov,
                &cmsgs,
                MsgFlags::from_bits_truncate(libc::MSG_NOSIGNAL),
                None,
            )
            .context("sendmsg")?;
            if n == 0 {
                bail!("peer closed while sending");
            }
            sent += n;
        }
        Ok(())
    }
}

/// Receiving half of a connection
pub struct MessageReader {
    stream: UnixStream,
    buf: Vec<u8>,
    fds: VecDeque<RawFd>,
}

impl MessageReader {
    /// Block until one full frame arrives; returns the decoded message
    /// and ownership of its fds.
    pub fn recv<T: DeserializeOwned>(&mut self) -> Result<(T, Vec<RawFd>)> {
        loop {
            if let Some(result) = self.try_decode()? {
                return Ok(result);
            }
            self.fill()?;
        }
    }

    fn try_decode<T: DeserializeOwned>(&mut self) -> Result<Option<(T, Vec<RawFd>)>> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let magic = u32::from_be_bytes(self.buf[0..4].try_into().unwrap());
        if magic != FRAME_MAGIC {
            bail!("bad frame magic {:#x}", magic);
        }
        let len = u32::from_be_bytes(self.buf[4..8].try_into().unwrap()) as usize;
        let num_fds = u32::from_be_bytes(self.buf[8..12].try_into().unwrap()) as usize;
        if len > MAX_FRAME_LEN {
            bail!("frame too large: {} bytes", len);
        }
        if self.buf.len() < HEADER_LEN + len {
            return Ok(None);
        }

        // Ancillary fds travel with the header bytes, so by the time the
        // full payload is buffered they must all be here.
        if self.fds.len() < num_fds {
            bail!("frame announced {} fds, {} received", num_fds, self.fds.len());
        }

        let msg: T = serde_json::from_slice(&self.buf[HEADER_LEN..HEADER_LEN + len])
            .context("decode frame")?;
        self.buf.drain(..HEADER_LEN + len);
        let fds = self.fds.drain(..num_fds).collect();
        Ok(Some((msg, fds)))
    }

    fn fill(&mut self) -> Result<()> {
        let mut scratch = vec![0u8; 16384];
        let mut cmsg = nix::cmsg_space!([RawFd; 16]);
        let iov = [IoVec::from_mut_slice(&mut scratch)];
        let res = recvmsg(self.stream.as_raw_fd(), &iov, Some(&mut cmsg), MsgFlags::empty())
            .context("recvmsg")?;
        if res.bytes == 0 {
            return Err(anyhow!("connection closed"));
        }
        for cmsg in res.cmsgs() {
            if let ControlMessageOwned::ScmRights(received) = cmsg {
                self.fds.extend(received);
            }
        }
        self.buf.extend_from_slice(&scratch[..res.bytes]);
        Ok(())
    }
}

impl Drop for MessageReader {
    fn drop(&mut self) {
        for fd in self.fds.drain(..) {
            warn!("closing unclaimed fd {}", fd);
            let _ = nix::unistd::close(fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{Event, ServerMessage};
    use crate::shm::SharedMemory;
    use crate::types::WindowHandle;

    #[test]
    fn frame_round_trip_without_fds() {
        let (a, b) = UnixStream::pair().unwrap();
        let (_reader_a, mut writer) = split(a).unwrap();
        let (mut reader, _writer_b) = split(b).unwrap();

        let msg = ServerMessage::Event {
            window: WindowHandle(5),
            event: Event::BufferReleased { key: 42 },
        };
        writer.send(&msg, &[]).unwrap();

        let (back, fds): (ServerMessage, Vec<RawFd>) = reader.recv().unwrap();
        assert!(fds.is_empty());
        match back {
            ServerMessage::Event { window, event: Event::BufferReleased { key } } => {
                assert_eq!(window, WindowHandle(5));
                assert_eq!(key, 42);
            }
            other => panic!("wrong message: {:?}", other),
        }
    }

    #[test]
    fn fds_cross_the_socket() {
        let (a, b) = UnixStream::pair().unwrap();
        let (_ra, mut writer) = split(a).unwrap();
        let (mut reader, _wb) = split(b).unwrap();

        let shm = SharedMemory::create_anon(64).unwrap();
        shm.map().unwrap().as_mut_slice()[0] = 0x5A;

        let msg = ServerMessage::Event {
            window: WindowHandle(1),
            event: Event::OnFrame { seq: 1 },
        };
        writer.send(&msg, &[shm.fd()]).unwrap();

        let (_back, fds): (ServerMessage, Vec<RawFd>) = reader.recv().unwrap();
        assert_eq!(fds.len(), 1);

        let adopted = SharedMemory::from_fd(fds[0], None, 64);
        assert_eq!(adopted.map().unwrap().as_slice()[0], 0x5A);
    }

    #[test]
    fn back_to_back_frames_decode_in_order() {
        let (a, b) = UnixStream::pair().unwrap();
        let (_ra, mut writer) = split(a).unwrap();
        let (mut reader, _wb) = split(b).unwrap();

        for seq in 1..=3u32 {
            let msg = ServerMessage::Event {
                window: WindowHandle(1),
                event: Event::OnFrame { seq },
            };
            writer.send(&msg, &[]).unwrap();
        }

        for expected in 1..=3u32 {
            let (msg, _): (ServerMessage, Vec<RawFd>) = reader.recv().unwrap();
            match msg {
                ServerMessage::Event { event: Event::OnFrame { seq }, .. } => {
                    assert_eq!(seq, expected)
                }
                other => panic!("wrong message: {:?}", other),
            }
        }
    }
}
