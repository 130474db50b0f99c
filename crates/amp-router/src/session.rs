//! Device session
//!
//! A session owns the TCP connection to one amplifier and runs in its own
//! task. It connects with a timeout, polls the device one query per tick,
//! and reconnects with exponential backoff whenever the connection is lost.
//!
//! The wire protocol is half-duplex: at most one command is in flight, and
//! the next one is written only after a matching response decodes or the
//! response timeout fires. Commands from the owner (mute changes) wait in a
//! queue and take priority over the next poll query.
//!
//! The owner talks to the task through a [`SessionHandle`]. Dropping or
//! closing the handle cancels the task wherever it is suspended (connect,
//! read, response wait or backoff sleep).

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use amp_protocol::{Command, EncodeFrame, ProtocolCodec, Response, ResponseCodec};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, sleep_until, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::config::SessionConfig;
use crate::error::RouterError;
use crate::events::{SessionEvent, SessionEventKind};
use crate::poll::PollCycle;
use crate::state::{DeviceAddress, SessionId, SessionState, SessionStatus};

/// Exponential reconnect delay: base, 2x base, 4x base ... capped at max
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        let max = max.max(base);
        Self {
            base,
            max,
            next: base,
        }
    }

    /// Delay before the next attempt; doubles the following one
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.saturating_mul(2).min(self.max);
        delay
    }

    /// Start over from the base delay (after a successful connect)
    pub fn reset(&mut self) {
        self.next = self.base;
    }
}

/// Owner's side of a running session
#[derive(Debug)]
pub struct SessionHandle {
    id: SessionId,
    address: DeviceAddress,
    cmd_tx: mpsc::Sender<Command>,
    resync: Arc<Notify>,
    status_rx: watch::Receiver<SessionStatus>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// Spawn a session task for `address`. Must be called inside a tokio runtime.
    pub fn open(
        id: SessionId,
        address: DeviceAddress,
        config: SessionConfig,
        event_tx: mpsc::Sender<SessionEvent>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_queue.max(1));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (status_tx, status_rx) = watch::channel(SessionStatus::default());
        let resync = Arc::new(Notify::new());

        let session = SessionTask::new(
            id,
            address.clone(),
            config,
            cmd_rx,
            resync.clone(),
            shutdown_rx,
            status_tx,
            event_tx,
        );
        let task = tokio::spawn(session.run());

        Self {
            id,
            address,
            cmd_tx,
            resync,
            status_rx,
            shutdown_tx: Some(shutdown_tx),
            task,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    pub fn status(&self) -> SessionStatus {
        self.status_rx.borrow().clone()
    }

    pub fn state(&self) -> SessionState {
        self.status_rx.borrow().state
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Receiver that observes every state and counter change
    pub fn watch(&self) -> watch::Receiver<SessionStatus> {
        self.status_rx.clone()
    }

    /// Queue a command for the device
    ///
    /// Fails with `NotConnected` unless the session is connected right now.
    /// The command is written once the line is free.
    pub fn send(&self, command: Command) -> Result<(), RouterError> {
        if !self.is_connected() {
            return Err(RouterError::NotConnected(self.address.to_string()));
        }
        self.cmd_tx
            .try_send(command)
            .map_err(|e| match e {
                TrySendError::Full(_) => RouterError::QueueFull(self.address.to_string()),
                TrySendError::Closed(_) => RouterError::NotConnected(self.address.to_string()),
            })
    }

    /// Ask the session to report every reading again on its next cycle
    ///
    /// Used after a reassignment, when a display channel moves to a device
    /// whose cached values would otherwise be suppressed as duplicates.
    /// Never lost to a full command queue; repeated calls before the task
    /// wakes collapse into one.
    pub fn resync(&self) {
        self.resync.notify_one();
    }

    /// Stop the session. The returned handle resolves once the task has exited.
    pub fn close(mut self) -> JoinHandle<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.task
    }
}

/// Why a connected loop returned
#[derive(Debug, PartialEq, Eq)]
enum ConnectionExit {
    /// Owner asked the session to stop
    Shutdown,
    /// Connection failed; reconnect after backoff
    Lost(String),
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    command: Command,
    deadline: Instant,
}

struct SessionTask {
    id: SessionId,
    address: DeviceAddress,
    config: SessionConfig,
    cmd_rx: mpsc::Receiver<Command>,
    resync: Arc<Notify>,
    shutdown_rx: oneshot::Receiver<()>,
    status_tx: watch::Sender<SessionStatus>,
    event_tx: mpsc::Sender<SessionEvent>,
    codec: ResponseCodec,
    poll: PollCycle,
    pending: VecDeque<Command>,
    in_flight: Option<InFlight>,
}

impl SessionTask {
    fn new(
        id: SessionId,
        address: DeviceAddress,
        config: SessionConfig,
        cmd_rx: mpsc::Receiver<Command>,
        resync: Arc<Notify>,
        shutdown_rx: oneshot::Receiver<()>,
        status_tx: watch::Sender<SessionStatus>,
        event_tx: mpsc::Sender<SessionEvent>,
    ) -> Self {
        let codec = ResponseCodec::with_max_buffer_len(config.max_buffer_len);
        Self {
            id,
            address,
            config,
            cmd_rx,
            resync,
            shutdown_rx,
            status_tx,
            event_tx,
            codec,
            poll: PollCycle::new(),
            pending: VecDeque::new(),
            in_flight: None,
        }
    }

    /// Connect, poll, reconnect; until shutdown
    async fn run(mut self) {
        info!("Session {} for {} starting", self.id, self.address);

        let mut backoff = Backoff::new(self.config.reconnect_base(), self.config.reconnect_max());
        let mut first_attempt = true;

        loop {
            if !first_attempt {
                self.update_status(|s| s.stats.reconnects += 1);
            }
            first_attempt = false;
            self.set_state(SessionState::Connecting);

            let connect = timeout(
                self.config.connect_timeout(),
                TcpStream::connect((self.address.host.as_str(), self.address.port)),
            );
            let result = tokio::select! {
                _ = &mut self.shutdown_rx => break,
                result = connect => result,
            };

            match result {
                Ok(Ok(mut stream)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("{}: could not set TCP_NODELAY: {}", self.address, e);
                    }
                    backoff.reset();
                    info!("Connected to amplifier at {}", self.address);
                    self.set_state(SessionState::Connected);
                    self.emit(SessionEventKind::Connected).await;

                    let exit = self.run_connected(&mut stream).await;
                    self.forget_connection();

                    match exit {
                        ConnectionExit::Shutdown => break,
                        ConnectionExit::Lost(reason) => {
                            warn!("Lost connection to {}: {}", self.address, reason);
                            self.set_state(SessionState::ReconnectWait);
                            self.emit(SessionEventKind::Disconnected { reason }).await;
                        }
                    }
                }
                Ok(Err(e)) => {
                    let message = RouterError::Connection(format!("{}: {}", self.address, e));
                    warn!("{}", message);
                    self.set_state(SessionState::ReconnectWait);
                    self.emit(SessionEventKind::Error(message.to_string())).await;
                }
                Err(_) => {
                    let message = RouterError::Connection(format!(
                        "{}: connect timed out after {}ms",
                        self.address, self.config.connect_timeout_ms
                    ));
                    warn!("{}", message);
                    self.set_state(SessionState::ReconnectWait);
                    self.emit(SessionEventKind::Error(message.to_string())).await;
                }
            }

            let delay = backoff.next_delay();
            debug!("Reconnecting to {} in {:?}", self.address, delay);
            tokio::select! {
                _ = &mut self.shutdown_rx => break,
                _ = sleep(delay) => {}
            }
        }

        self.set_state(SessionState::Terminated);
        info!("Session {} for {} terminated", self.id, self.address);
    }

    /// Poll and serve commands until the connection fails or shutdown
    async fn run_connected<T>(&mut self, io: &mut T) -> ConnectionExit
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let mut ticker = interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buffer = [0u8; 256];

        loop {
            // Queued commands go out as soon as the line is free
            if self.in_flight.is_none() {
                if let Some(command) = self.pending.pop_front() {
                    if let Err(reason) = self.transmit(io, command).await {
                        return ConnectionExit::Lost(reason);
                    }
                }
            }

            let deadline = self.in_flight.map(|f| f.deadline);
            let line_free = deadline.is_none();

            tokio::select! {
                _ = &mut self.shutdown_rx => return ConnectionExit::Shutdown,

                request = self.cmd_rx.recv() => match request {
                    Some(command) => {
                        debug!("{}: queued {}", self.address, command);
                        self.pending.push_back(command);
                    }
                    None => return ConnectionExit::Shutdown,
                },

                _ = self.resync.notified() => {
                    debug!("{}: resync, reporting every reading again", self.address);
                    self.poll.forget();
                }

                result = io.read(&mut buffer) => match result {
                    Ok(0) => return ConnectionExit::Lost("connection closed by device".into()),
                    Ok(n) => self.on_bytes(&buffer[..n]).await,
                    Err(e) => return ConnectionExit::Lost(format!("read error: {}", e)),
                },

                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if !line_free => {
                    self.on_timeout();
                }

                _ = ticker.tick(), if line_free => {
                    if let Some(query) = self.poll.next_query() {
                        let poll = self.poll.stats();
                        self.update_status(|s| s.stats.poll = poll);
                        if let Err(reason) = self.transmit(io, query).await {
                            return ConnectionExit::Lost(reason);
                        }
                    }
                }
            }
        }
    }

    async fn transmit<T>(&mut self, io: &mut T, command: Command) -> Result<(), String>
    where
        T: AsyncWrite + Unpin,
    {
        let bytes = command.encode();
        trace!("OUT -> {} {}: {:02X?}", self.address, command, bytes);

        let write = async {
            io.write_all(&bytes).await?;
            io.flush().await
        };
        match timeout(self.config.response_timeout(), write).await {
            Ok(Ok(())) => {
                self.in_flight = Some(InFlight {
                    command,
                    deadline: Instant::now() + self.config.response_timeout(),
                });
                self.update_status(|s| s.stats.commands_sent += 1);
                Ok(())
            }
            Ok(Err(e)) => Err(format!("write error: {}", e)),
            Err(_) => Err("write timed out".to_string()),
        }
    }

    async fn on_bytes(&mut self, data: &[u8]) {
        self.codec.push_bytes(data);
        while let Some((response, raw)) = self.codec.next_frame_with_bytes() {
            trace!("IN <- {}: {:02X?}", self.address, raw);
            self.on_response(response).await;
        }
        let codec = self.codec.stats();
        self.update_status(|s| s.stats.codec = codec);
    }

    async fn on_response(&mut self, response: Response) {
        match self.in_flight {
            Some(in_flight) if response.answers(&in_flight.command) => {
                self.in_flight = None;
                let sample = self.poll.observe(&response);
                let poll = self.poll.stats();
                self.update_status(|s| {
                    s.stats.responses += 1;
                    s.stats.poll = poll;
                });
                if let Some(sample) = sample {
                    self.emit(SessionEventKind::Sample(sample)).await;
                }
            }
            Some(in_flight) => {
                // Wrong family: treat as garbled and keep waiting for the deadline
                self.update_status(|s| s.stats.mismatched += 1);
                warn!(
                    "{}: {:?} response does not answer {}",
                    self.address,
                    response.function(),
                    in_flight.command
                );
            }
            None => {
                self.update_status(|s| s.stats.unsolicited += 1);
                debug!("{}: unsolicited {:?}", self.address, response);
            }
        }
    }

    fn on_timeout(&mut self) {
        if let Some(in_flight) = self.in_flight.take() {
            self.update_status(|s| s.stats.timeouts += 1);
            debug!(
                "{}: {} skipped, {}",
                self.address,
                in_flight.command,
                RouterError::ResponseTimeout(self.config.response_timeout_ms)
            );
        }
    }

    /// Drop all per-connection state so the next connection starts clean
    fn forget_connection(&mut self) {
        self.poll.reset();
        self.codec.clear();
        self.in_flight = None;
        for command in self.pending.drain(..) {
            debug!("{}: dropping queued {}", self.address, command);
        }
        while let Ok(command) = self.cmd_rx.try_recv() {
            debug!("{}: dropping queued {}", self.address, command);
        }
    }

    fn update_status(&self, apply: impl FnOnce(&mut SessionStatus)) {
        self.status_tx.send_modify(apply);
    }

    fn set_state(&self, state: SessionState) {
        let mut previous = state;
        self.status_tx.send_modify(|s| {
            previous = s.state;
            s.state = state;
        });
        if previous != state {
            debug!("{}: {} -> {}", self.address, previous, state);
        }
    }

    async fn emit(&self, kind: SessionEventKind) {
        let event = SessionEvent {
            id: self.id,
            address: self.address.clone(),
            kind,
        };
        let _ = self.event_tx.send(event).await;
    }
}
