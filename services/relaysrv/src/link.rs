//! TCP link to the device
//!
//! Owns the socket: connects (with timeout), forwards received chunks to the
//! event loop, writes queued frames, reports receive inactivity as a
//! transport timeout and reconnects after a delay whenever the connection
//! ends.

use bytes::Bytes;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use relay_modbus::constants::MAX_RECEIVE_BUFFER;
use relay_modbus::Transport;

use crate::runtime::Event;

/// TCP link configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
    /// Receive inactivity after which a transport timeout is reported
    pub transport_timeout: Duration,
    pub reconnect_delay: Duration,
}

impl LinkConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Link changes reported to the event loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Connected,
    Received(Bytes),
    Sent(Bytes),
    Disconnected,
    TransportTimeout,
}

/// Requests from the engine to the link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCommand {
    Send(Bytes),
    Drop,
}

/// Engine-side [`Transport`] backed by the link task's command channel
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    commands: mpsc::UnboundedSender<LinkCommand>,
}

impl ChannelTransport {
    pub fn new(commands: mpsc::UnboundedSender<LinkCommand>) -> Self {
        Self { commands }
    }
}

impl Transport for ChannelTransport {
    fn send(&mut self, frame: Bytes) {
        if self.commands.send(LinkCommand::Send(frame)).is_err() {
            debug!("Link task gone, frame discarded");
        }
    }

    fn drop_connection(&mut self) {
        let _ = self.commands.send(LinkCommand::Drop);
    }
}

/// Why a connection ended
#[derive(Debug, PartialEq, Eq)]
enum Ended {
    PeerClosed,
    Dropped,
    Failed,
    Shutdown,
}

/// Connect/serve/reconnect until `token` is cancelled
pub async fn run_link(
    config: LinkConfig,
    mut commands: mpsc::UnboundedReceiver<LinkCommand>,
    events: mpsc::UnboundedSender<Event>,
    token: CancellationToken,
) {
    let address = config.address();
    info!("TCP link to {} starting", address);

    loop {
        if token.is_cancelled() {
            break;
        }

        let attempt = tokio::select! {
            result = timeout(config.connect_timeout, TcpStream::connect(&address)) => result,
            _ = token.cancelled() => break,
        };

        match attempt {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    warn!("Failed to set TCP_NODELAY: {}", e);
                }
                // Frames queued for a previous connection must not leak into this one
                while commands.try_recv().is_ok() {}

                if events.send(Event::Link(LinkEvent::Connected)).is_err() {
                    break;
                }
                let ended = serve(stream, &config, &mut commands, &events, &token).await;
                debug!("Connection to {} ended: {:?}", address, ended);
                if events.send(Event::Link(LinkEvent::Disconnected)).is_err()
                    || ended == Ended::Shutdown
                {
                    break;
                }
            },
            Ok(Err(e)) => error!("Connect to {} failed: {}", address, e),
            Err(_) => error!(
                "Connect to {} timed out after {:?}",
                address, config.connect_timeout
            ),
        }

        tokio::select! {
            _ = sleep(config.reconnect_delay) => {},
            _ = token.cancelled() => break,
        }
    }

    info!("TCP link to {} stopped", address);
}

async fn serve(
    mut stream: TcpStream,
    config: &LinkConfig,
    commands: &mut mpsc::UnboundedReceiver<LinkCommand>,
    events: &mpsc::UnboundedSender<Event>,
    token: &CancellationToken,
) -> Ended {
    let (mut reader, mut writer) = stream.split();
    let mut buf = vec![0u8; MAX_RECEIVE_BUFFER];
    let mut deadline = Instant::now() + config.transport_timeout;

    loop {
        tokio::select! {
            _ = token.cancelled() => return Ended::Shutdown,

            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    info!("Peer closed the connection");
                    return Ended::PeerClosed;
                },
                Ok(n) => {
                    deadline = Instant::now() + config.transport_timeout;
                    trace!(
                        "TCP rx {} bytes: {}",
                        n,
                        common::hex::format_pretty(&buf[..n], 64)
                    );
                    let chunk = Bytes::copy_from_slice(&buf[..n]);
                    if events.send(Event::Link(LinkEvent::Received(chunk))).is_err() {
                        return Ended::Shutdown;
                    }
                },
                Err(e) => {
                    warn!("TCP read failed: {}", e);
                    return Ended::Failed;
                },
            },

            command = commands.recv() => match command {
                Some(LinkCommand::Send(frame)) => {
                    if let Err(e) = writer.write_all(&frame).await {
                        warn!("TCP write failed: {}", e);
                        return Ended::Failed;
                    }
                    trace!(
                        "TCP tx {} bytes: {}",
                        frame.len(),
                        common::hex::format_pretty(&frame, 64)
                    );
                    let _ = events.send(Event::Link(LinkEvent::Sent(frame)));
                },
                Some(LinkCommand::Drop) => {
                    info!("Dropping TCP connection");
                    return Ended::Dropped;
                },
                None => return Ended::Shutdown,
            },

            _ = sleep_until(deadline) => {
                // Re-arm so a slow drop does not spin
                deadline = Instant::now() + config.transport_timeout;
                if events.send(Event::Link(LinkEvent::TransportTimeout)).is_err() {
                    return Ended::Shutdown;
                }
            },
        }
    }
}
