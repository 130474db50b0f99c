//! Virtual amplifier actor task
//!
//! This module provides an async task that owns a [`VirtualAmplifier`] and
//! serves it over any byte stream, plus a [`VirtualAmpServer`] that accepts
//! TCP connections on a loopback port. The task uses a select! loop to:
//! - Read protocol commands from the stream and answer them
//! - Apply control commands (gain changes, silence, dropped connections)
//! - Broadcast every command received and every state change

use std::io;
use std::net::SocketAddr;

use amp_protocol::{
    ChannelKind, Command, CommandCodec, EncodeFrame, Level, MuteTarget, ProtocolCodec,
};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::VirtualAmplifier;

/// Capacity of the event broadcast; subscribers that fall further behind lag
const EVENT_CAPACITY: usize = 1024;

/// Commands that can be sent to a virtual amplifier actor
#[derive(Debug, Clone, PartialEq)]
pub enum VirtualAmpCommand {
    /// Change the level of one channel
    SetGain {
        kind: ChannelKind,
        channel: u8,
        level: Level,
    },
    /// Change a mute state from the front panel
    SetMute { target: MuteTarget, muted: bool },
    /// Stop (or resume) answering protocol commands
    SetSilent(bool),
    /// Close the current client connection
    DropConnection,
    /// Shutdown the virtual amplifier actor
    Shutdown,
}

/// Event emitted by the virtual amplifier
#[derive(Debug, Clone, PartialEq)]
pub enum VirtualAmpEvent {
    /// A controller connected
    ClientConnected(SocketAddr),
    /// The controller connection ended
    ClientDisconnected,
    /// A protocol command arrived, in wire order
    CommandReceived(Command),
    /// A channel level changed
    GainChanged {
        kind: ChannelKind,
        channel: u8,
        level: Level,
    },
    /// A mute state changed
    MuteChanged { target: MuteTarget, muted: bool },
}

/// Why the task stopped serving a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskExit {
    /// The peer closed the stream
    StreamClosed,
    /// `DropConnection` was requested
    Dropped,
    /// `Shutdown` was requested or the command channel closed
    Shutdown,
}

/// Errors from the server control API
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SimError {
    #[error("virtual amplifier has shut down")]
    Closed,
}

/// Apply a control command. Returns an exit reason for the commands that end a stream.
fn apply_control(
    amp: &mut VirtualAmplifier,
    command: VirtualAmpCommand,
    state_tx: &broadcast::Sender<VirtualAmpEvent>,
) -> Option<TaskExit> {
    match command {
        VirtualAmpCommand::SetGain {
            kind,
            channel,
            level,
        } => {
            if amp.set_gain(kind, channel, level) {
                let _ = state_tx.send(VirtualAmpEvent::GainChanged {
                    kind,
                    channel,
                    level,
                });
            }
            None
        }
        VirtualAmpCommand::SetMute { target, muted } => {
            if amp.set_muted(target, muted) {
                let _ = state_tx.send(VirtualAmpEvent::MuteChanged { target, muted });
            }
            None
        }
        VirtualAmpCommand::SetSilent(silent) => {
            info!("Virtual amp {} silent={}", amp.id(), silent);
            amp.set_silent(silent);
            None
        }
        VirtualAmpCommand::DropConnection => Some(TaskExit::Dropped),
        VirtualAmpCommand::Shutdown => Some(TaskExit::Shutdown),
    }
}

/// Run the virtual amplifier actor task
///
/// Serves one stream until the peer closes it, `DropConnection` or
/// `Shutdown` arrives, or the command channel closes. The amplifier and the
/// command receiver are borrowed so a server can keep both across connections.
pub async fn run_virtual_amp_task<S>(
    mut stream: S,
    amp: &mut VirtualAmplifier,
    cmd_rx: &mut mpsc::Receiver<VirtualAmpCommand>,
    state_tx: &broadcast::Sender<VirtualAmpEvent>,
) -> io::Result<TaskExit>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut codec = CommandCodec::new();
    let mut buf = [0u8; 1024];

    info!("Starting virtual amplifier task for {}", amp.id());

    loop {
        tokio::select! {
            // Read protocol commands from the connection stream
            result = stream.read(&mut buf) => {
                match result {
                    Ok(0) => {
                        debug!("Virtual amplifier stream closed for {}", amp.id());
                        return Ok(TaskExit::StreamClosed);
                    }
                    Ok(n) => {
                        codec.push_bytes(&buf[..n]);
                        while let Some(command) = codec.next_frame() {
                            debug!("Virtual amplifier {} processing {}", amp.id(), command);
                            let _ = state_tx.send(VirtualAmpEvent::CommandReceived(command));

                            let before = match command {
                                Command::SetMute { target, .. } => Some(amp.muted(target)),
                                _ => None,
                            };
                            let response = amp.process_command(command);
                            if let Command::SetMute { target, muted } = command {
                                if before != Some(muted) {
                                    let _ = state_tx
                                        .send(VirtualAmpEvent::MuteChanged { target, muted });
                                }
                            }

                            if let Some(response) = response {
                                let bytes = response.encode();
                                stream.write_all(&bytes).await?;
                                stream.flush().await?;
                            }
                        }
                    }
                    Err(e) => {
                        warn!("Virtual amplifier {} stream error: {}", amp.id(), e);
                        return Err(e);
                    }
                }
            }

            // Handle commands from the channel
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else {
                    debug!("Command channel closed for virtual amplifier {}", amp.id());
                    return Ok(TaskExit::Shutdown);
                };
                if let Some(exit) = apply_control(amp, cmd, state_tx) {
                    info!("Virtual amplifier {} ending stream: {:?}", amp.id(), exit);
                    return Ok(exit);
                }
            }
        }
    }
}

/// A virtual amplifier listening on a loopback TCP port
///
/// Serves one controller at a time, like the real hardware. Device state
/// survives dropped connections.
#[derive(Debug)]
pub struct VirtualAmpServer {
    local_addr: SocketAddr,
    cmd_tx: mpsc::Sender<VirtualAmpCommand>,
    event_tx: broadcast::Sender<VirtualAmpEvent>,
    task: JoinHandle<()>,
}

impl VirtualAmpServer {
    /// Listen on `127.0.0.1:0` and start serving
    pub async fn bind(amp: VirtualAmplifier) -> io::Result<Self> {
        Self::bind_port(amp, 0).await
    }

    /// Listen on `127.0.0.1:port` and start serving
    pub async fn bind_port(amp: VirtualAmplifier, port: u16) -> io::Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        let local_addr = listener.local_addr()?;
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);

        info!("Virtual amplifier {} listening on {}", amp.id(), local_addr);
        let task = tokio::spawn(serve(listener, amp, cmd_rx, event_tx.clone()));

        Ok(Self {
            local_addr,
            cmd_tx,
            event_tx,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Receive every event emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<VirtualAmpEvent> {
        self.event_tx.subscribe()
    }

    pub async fn send(&self, command: VirtualAmpCommand) -> Result<(), SimError> {
        self.cmd_tx.send(command).await.map_err(|_| SimError::Closed)
    }

    pub async fn set_gain(
        &self,
        kind: ChannelKind,
        channel: u8,
        level: Level,
    ) -> Result<(), SimError> {
        self.send(VirtualAmpCommand::SetGain {
            kind,
            channel,
            level,
        })
        .await
    }

    pub async fn set_mute(&self, target: MuteTarget, muted: bool) -> Result<(), SimError> {
        self.send(VirtualAmpCommand::SetMute { target, muted }).await
    }

    pub async fn set_silent(&self, silent: bool) -> Result<(), SimError> {
        self.send(VirtualAmpCommand::SetSilent(silent)).await
    }

    pub async fn drop_connection(&self) -> Result<(), SimError> {
        self.send(VirtualAmpCommand::DropConnection).await
    }

    /// Stop serving and wait for the task to finish
    pub async fn shutdown(self) {
        let _ = self.cmd_tx.send(VirtualAmpCommand::Shutdown).await;
        let _ = self.task.await;
    }
}

/// Accept loop: one client at a time, control commands applied in between
async fn serve(
    listener: TcpListener,
    mut amp: VirtualAmplifier,
    mut cmd_rx: mpsc::Receiver<VirtualAmpCommand>,
    event_tx: broadcast::Sender<VirtualAmpEvent>,
) {
    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Virtual amplifier {} accept failed: {}", amp.id(), e);
                    continue;
                }
            },
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                match apply_control(&mut amp, cmd, &event_tx) {
                    Some(TaskExit::Shutdown) => break,
                    _ => continue,
                }
            }
        };

        info!("Virtual amplifier {} accepted {}", amp.id(), peer);
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Virtual amplifier {} could not set TCP_NODELAY: {}", amp.id(), e);
        }
        let _ = event_tx.send(VirtualAmpEvent::ClientConnected(peer));

        let exit = run_virtual_amp_task(stream, &mut amp, &mut cmd_rx, &event_tx).await;
        let _ = event_tx.send(VirtualAmpEvent::ClientDisconnected);
        match exit {
            Ok(TaskExit::Shutdown) => break,
            Ok(exit) => debug!("Virtual amplifier {} client gone: {:?}", amp.id(), exit),
            Err(e) => warn!("Virtual amplifier {} connection error: {}", amp.id(), e),
        }
    }

    info!("Virtual amplifier task ended for {}", amp.id());
}

#[cfg(test)]
mod tests {
    use super::*;
    use amp_protocol::{Response, ResponseCodec};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    async fn read_response<S: AsyncRead + Unpin>(
        stream: &mut S,
        codec: &mut ResponseCodec,
    ) -> Response {
        let mut buf = [0u8; 64];
        loop {
            if let Some(response) = codec.next_frame() {
                return response;
            }
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "amplifier closed the stream");
            codec.push_bytes(&buf[..n]);
        }
    }

    #[tokio::test]
    async fn test_virtual_amp_answers_gain_read() {
        // Create duplex streams
        let (mut connection_stream, amp_stream) = tokio::io::duplex(1024);

        let (cmd_tx, mut cmd_rx) = mpsc::channel(32);
        let (state_tx, mut state_rx) = broadcast::channel(32);

        let task_handle = tokio::spawn(async move {
            let mut amp = VirtualAmplifier::new("Test");
            run_virtual_amp_task(amp_stream, &mut amp, &mut cmd_rx, &state_tx).await
        });

        let read = Command::ReadGain {
            kind: ChannelKind::Input,
            channel: 2,
        };
        connection_stream.write_all(&read.encode()).await.unwrap();

        let mut codec = ResponseCodec::new();
        let response = read_response(&mut connection_stream, &mut codec).await;
        assert_eq!(
            response,
            Response::Gain {
                kind: ChannelKind::Input,
                channel: 2,
                level: Level::from_raw(-200)
            }
        );
        assert_eq!(
            state_rx.recv().await.unwrap(),
            VirtualAmpEvent::CommandReceived(read)
        );

        // Shutdown
        drop(cmd_tx);
        assert_eq!(task_handle.await.unwrap().unwrap(), TaskExit::Shutdown);
    }

    #[tokio::test]
    async fn test_virtual_amp_reports_mute_changes() {
        let (mut connection_stream, amp_stream) = tokio::io::duplex(1024);

        let (_cmd_tx, mut cmd_rx) = mpsc::channel(32);
        let (state_tx, mut state_rx) = broadcast::channel(32);

        let task_handle = tokio::spawn(async move {
            let mut amp = VirtualAmplifier::new("Test");
            run_virtual_amp_task(amp_stream, &mut amp, &mut cmd_rx, &state_tx).await
        });

        let target = MuteTarget::channel(ChannelKind::Output, 4);
        let set = Command::SetMute {
            target,
            muted: true,
        };
        connection_stream.write_all(&set.encode()).await.unwrap();

        let mut codec = ResponseCodec::new();
        assert_eq!(
            read_response(&mut connection_stream, &mut codec).await,
            Response::Mute {
                target,
                muted: true
            }
        );
        assert_eq!(
            state_rx.recv().await.unwrap(),
            VirtualAmpEvent::CommandReceived(set)
        );
        assert_eq!(
            state_rx.recv().await.unwrap(),
            VirtualAmpEvent::MuteChanged {
                target,
                muted: true
            }
        );

        drop(connection_stream);
        assert_eq!(task_handle.await.unwrap().unwrap(), TaskExit::StreamClosed);
    }

    #[tokio::test]
    async fn test_silent_amp_does_not_answer() {
        let (mut connection_stream, amp_stream) = tokio::io::duplex(1024);

        let (cmd_tx, mut cmd_rx) = mpsc::channel(32);
        let (state_tx, mut state_rx) = broadcast::channel(32);

        let task_handle = tokio::spawn(async move {
            let mut amp = VirtualAmplifier::new("Test");
            amp.set_silent(true);
            run_virtual_amp_task(amp_stream, &mut amp, &mut cmd_rx, &state_tx).await
        });

        let read = Command::ReadMute {
            target: MuteTarget::Master,
        };
        connection_stream.write_all(&read.encode()).await.unwrap();
        assert_eq!(
            state_rx.recv().await.unwrap(),
            VirtualAmpEvent::CommandReceived(read)
        );

        let mut buf = [0u8; 16];
        let answer =
            tokio::time::timeout(Duration::from_millis(100), connection_stream.read(&mut buf))
                .await;
        assert!(answer.is_err(), "silent amplifier answered");

        cmd_tx.send(VirtualAmpCommand::DropConnection).await.unwrap();
        assert_eq!(task_handle.await.unwrap().unwrap(), TaskExit::Dropped);
    }

    #[tokio::test]
    async fn test_server_keeps_state_across_connections() {
        let server = VirtualAmpServer::bind(VirtualAmplifier::new("Server"))
            .await
            .unwrap();
        let mut events = server.subscribe();

        server
            .set_gain(ChannelKind::Output, 1, Level::from_raw(-42))
            .await
            .unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            VirtualAmpEvent::GainChanged { channel: 1, .. }
        ));

        let read = Command::ReadGain {
            kind: ChannelKind::Output,
            channel: 1,
        };
        for _ in 0..2 {
            let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
            client.write_all(&read.encode()).await.unwrap();
            let mut codec = ResponseCodec::new();
            assert_eq!(
                read_response(&mut client, &mut codec).await,
                Response::Gain {
                    kind: ChannelKind::Output,
                    channel: 1,
                    level: Level::from_raw(-42)
                }
            );
            server.drop_connection().await.unwrap();

            // The server closes its side
            let mut buf = [0u8; 8];
            assert_eq!(client.read(&mut buf).await.unwrap(), 0);
        }

        server.shutdown().await;
    }
}
