//! Service transport
//!
//! Accepts client connections on the service socket and bridges them
//! into the main loop. Each connection gets a blocking reader thread
//! (requests in, death detection) and a writer thread (replies and
//! events out); the service loop only ever sees [`ServiceMsg`]s.

use crate::service::{ClientId, ClientSink};
use anyhow::{Context, Result};
use casement_ipc::proto::{Request, RequestEnvelope, ServerMessage};
use casement_ipc::transport::{self, MessageReader, MessageWriter};
use std::os::unix::io::RawFd;
use std::os::unix::net::UnixListener;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tracing::{debug, info, warn};

/// Everything the transport injects into the service loop
pub enum ServiceMsg {
    Connected { client: ClientId, sink: Arc<dyn ClientSink> },
    Request { client: ClientId, seq: u64, request: Request },
    Disconnected { client: ClientId },
}

struct Outbound {
    message: ServerMessage,
    fds: Vec<RawFd>,
}

/// Forwards messages to the connection's writer thread
struct ConnectionSink {
    tx: UnboundedSender<Outbound>,
}

impl ClientSink for ConnectionSink {
    fn deliver(&self, message: ServerMessage, fds: Vec<RawFd>) {
        if let Err(err) = self.tx.send(Outbound { message, fds }) {
            // writer already gone; nobody will close these for us
            for fd in err.0.fds {
                let _ = nix::unistd::close(fd);
            }
        }
    }
}

/// Bind the service socket and start accepting clients
pub fn spawn_listener(path: &Path, tx: UnboundedSender<ServiceMsg>) -> Result<()> {
    if path.exists() {
        std::fs::remove_file(path).context("failed to remove stale socket")?;
    }
    let listener = UnixListener::bind(path)
        .with_context(|| format!("failed to bind service socket {:?}", path))?;
    info!("listening on {:?}", path);

    thread::spawn(move || {
        let next_client = AtomicU64::new(1);
        for stream in listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(err) => {
                    warn!("accept failed: {}", err);
                    continue;
                }
            };
            let client = ClientId(next_client.fetch_add(1, Ordering::Relaxed));
            let (reader, writer) = match transport::split(stream) {
                Ok(halves) => halves,
                Err(err) => {
                    warn!("failed to split connection: {}", err);
                    continue;
                }
            };

            let (out_tx, out_rx) = unbounded_channel();
            let sink: Arc<dyn ClientSink> = Arc::new(ConnectionSink { tx: out_tx });
            if tx.send(ServiceMsg::Connected { client, sink }).is_err() {
                break;
            }

            thread::spawn(move || write_loop(client, writer, out_rx));

            let tx = tx.clone();
            thread::spawn(move || read_loop(client, reader, tx));
        }
    });
    Ok(())
}

fn read_loop(client: ClientId, mut reader: MessageReader, tx: UnboundedSender<ServiceMsg>) {
    loop {
        match reader.recv::<RequestEnvelope>() {
            Ok((envelope, fds)) => {
                // requests never carry fds today
                for fd in fds {
                    let _ = nix::unistd::close(fd);
                }
                let msg = ServiceMsg::Request {
                    client,
                    seq: envelope.seq,
                    request: envelope.request,
                };
                if tx.send(msg).is_err() {
                    return;
                }
            }
            Err(err) => {
                debug!("client {:?} reader finished: {}", client, err);
                let _ = tx.send(ServiceMsg::Disconnected { client });
                return;
            }
        }
    }
}

fn write_loop(
    client: ClientId,
    mut writer: MessageWriter,
    mut rx: tokio::sync::mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(outbound) = rx.blocking_recv() {
        if let Err(err) = writer.send(&outbound.message, &outbound.fds) {
            debug!("client {:?} writer finished: {}", client, err);
            for fd in outbound.fds {
                let _ = nix::unistd::close(fd);
            }
            return;
        }
        // fds were duplicated into the peer by sendmsg
        for fd in outbound.fds {
            let _ = nix::unistd::close(fd);
        }
    }
}
