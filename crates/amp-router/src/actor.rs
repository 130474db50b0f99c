//! Router Actor
//!
//! The router owns the assignment table and one [`SessionHandle`] per device
//! the table needs. All control commands and all session events are handled
//! in this one task, so a configuration change is applied completely before
//! the next sample is routed.
//!
//! # Architecture
//!
//! - Control commands arrive as [`RouterCommand`] over an mpsc channel, with a
//!   oneshot responder for the result
//! - Sessions report over a second mpsc channel as [`SessionEvent`]
//! - Everything subscribers should see goes out on a broadcast channel as
//!   [`RouterEvent`]
//!
//! Samples are attributed at delivery time: a reading is published only for
//! the display channels the reporting device owns *now*, and only if the
//! report comes from the device's current session instance.
//!
//! # Example
//!
//! ```rust,no_run
//! use amp_router::{AssignmentTable, RouterConfig, RouterHandle};
//!
//! # async fn demo() -> Result<(), amp_router::RouterError> {
//! let (router, _task) = RouterHandle::spawn(RouterConfig::default(), AssignmentTable::new());
//! let mut events = router.subscribe();
//! router.connect("192.168.1.50".parse()?).await?;
//! while let Ok(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use amp_protocol::MuteTarget;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::assignment::AssignmentTable;
use crate::channel::{DisplayChannel, MuteSlot};
use crate::config::{RouterConfig, SessionConfig};
use crate::error::RouterError;
use crate::events::{RouterEvent, Sample, SessionEvent, SessionEventKind};
use crate::gateway::MuteRequest;
use crate::session::SessionHandle;
use crate::state::{DeviceAddress, SessionId, SessionState, SessionStats};

/// How long shutdown waits for session tasks to exit
const SESSION_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// One live session in a status snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub address: DeviceAddress,
    pub state: SessionState,
    pub stats: SessionStats,
}

/// Point-in-time view of the router
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    /// Device used for unassigned channels and the master mute
    pub default_address: Option<DeviceAddress>,
    /// Whether the default device's session is connected
    pub connected: bool,
    /// Every open session, ordered by address
    pub sessions: Vec<SessionSummary>,
}

impl StatusSnapshot {
    /// Summary for one device, if it has a session
    pub fn session(&self, address: &DeviceAddress) -> Option<&SessionSummary> {
        self.sessions.iter().find(|s| &s.address == address)
    }
}

/// Commands sent to the router actor
#[derive(Debug)]
pub enum RouterCommand {
    /// Make `address` the default device
    Connect {
        address: DeviceAddress,
        response: oneshot::Sender<Result<(), RouterError>>,
    },

    /// Clear the default device
    Disconnect {
        response: oneshot::Sender<Result<(), RouterError>>,
    },

    /// Assign a display channel to a device (`None` = back to default)
    SetAssignment {
        channel: DisplayChannel,
        address: Option<DeviceAddress>,
        response: oneshot::Sender<Result<(), RouterError>>,
    },

    /// Override the physical channel behind a display channel (`None` = clear)
    SetChannelNumber {
        channel: DisplayChannel,
        physical: Option<u8>,
        response: oneshot::Sender<Result<(), RouterError>>,
    },

    /// Replace the whole assignment table (e.g. from saved settings)
    LoadAssignments {
        table: AssignmentTable,
        response: oneshot::Sender<()>,
    },

    /// Mute or unmute a display channel or the master
    SetMute {
        request: MuteRequest,
        response: oneshot::Sender<Result<(), RouterError>>,
    },

    /// Query connection status and session counters
    QueryStatus {
        response: oneshot::Sender<StatusSnapshot>,
    },

    /// Query the current assignment table
    QueryAssignments {
        response: oneshot::Sender<AssignmentTable>,
    },

    /// Close every session and stop the actor
    Shutdown,
}

/// Internal state for the router actor
struct RouterState {
    /// Applied to every new session
    session_config: SessionConfig,
    table: AssignmentTable,
    /// Open sessions, keyed by device
    sessions: BTreeMap<DeviceAddress, SessionHandle>,
    /// Last session id handed out
    last_session_id: u64,
    /// Cloned into each session
    session_tx: mpsc::Sender<SessionEvent>,
    event_tx: broadcast::Sender<RouterEvent>,
}

impl RouterState {
    fn new(
        session_config: SessionConfig,
        table: AssignmentTable,
        session_tx: mpsc::Sender<SessionEvent>,
        event_tx: broadcast::Sender<RouterEvent>,
    ) -> Self {
        Self {
            session_config,
            table,
            sessions: BTreeMap::new(),
            last_session_id: 0,
            session_tx,
            event_tx,
        }
    }

    fn publish(&self, event: RouterEvent) {
        // No subscribers is not an error
        let _ = self.event_tx.send(event);
    }

    /// Open and close sessions until they match the table
    fn reconcile(&mut self) {
        let required = self.table.required_addresses();

        // Retire first so a removed device can no longer deliver
        let stale: Vec<DeviceAddress> = self
            .sessions
            .keys()
            .filter(|address| !required.contains(*address))
            .cloned()
            .collect();
        for address in stale {
            if let Some(session) = self.sessions.remove(&address) {
                info!("Closing session {} for {}", session.id(), address);
                let was_connected = session.is_connected();
                drop(session.close());
                self.publish(RouterEvent::SessionState {
                    address: address.clone(),
                    state: SessionState::Terminated,
                });
                if was_connected {
                    self.publish(RouterEvent::Status {
                        connected: false,
                        address,
                    });
                }
            }
        }

        for address in required {
            if self.sessions.contains_key(&address) {
                continue;
            }
            self.last_session_id += 1;
            let id = SessionId(self.last_session_id);
            info!("Opening session {} for {}", id, address);
            let session = SessionHandle::open(
                id,
                address.clone(),
                self.session_config.clone(),
                self.session_tx.clone(),
            );
            self.publish(RouterEvent::SessionState {
                address: address.clone(),
                state: SessionState::Connecting,
            });
            self.sessions.insert(address, session);
        }
    }

    /// Apply a table change: reopen sessions and make every device report afresh
    fn apply_table_change(&mut self) {
        self.reconcile();
        for session in self.sessions.values() {
            session.resync();
        }
    }

    /// Handle one control command. Returns false when the actor should stop.
    fn handle_command(&mut self, command: RouterCommand) -> bool {
        match command {
            RouterCommand::Connect { address, response } => {
                if self.table.set_default_address(Some(address.clone())) {
                    info!("Default device is now {}", address);
                    self.apply_table_change();
                }
                let _ = response.send(Ok(()));
            }

            RouterCommand::Disconnect { response } => {
                let result = match self.table.default_address().cloned() {
                    Some(address) => {
                        info!("Releasing default device {}", address);
                        self.table.set_default_address(None);
                        self.apply_table_change();
                        Ok(())
                    }
                    None => Err(RouterError::NotConnected("no default device".into())),
                };
                let _ = response.send(result);
            }

            RouterCommand::SetAssignment {
                channel,
                address,
                response,
            } => {
                let result = self.table.set_assignment(channel, address);
                if let Ok(true) = result {
                    info!(
                        "{} now read from {}",
                        channel,
                        self.table
                            .owner_of(channel)
                            .map(ToString::to_string)
                            .unwrap_or_else(|| "nowhere".into())
                    );
                    self.apply_table_change();
                }
                let _ = response.send(result.map(|_| ()));
            }

            RouterCommand::SetChannelNumber {
                channel,
                physical,
                response,
            } => {
                let result = self.table.set_channel_number(channel, physical);
                if let Ok(true) = result {
                    info!(
                        "{} now backed by physical channel {}",
                        channel,
                        self.table.physical_of(channel)
                    );
                    self.apply_table_change();
                }
                let _ = response.send(result.map(|_| ()));
            }

            RouterCommand::LoadAssignments { table, response } => {
                if self.table != table {
                    info!("Loading assignment table");
                    self.table = table;
                    self.apply_table_change();
                }
                let _ = response.send(());
            }

            RouterCommand::SetMute { request, response } => {
                let result = self.set_mute(request);
                if let Err(e) = &result {
                    debug!("Mute request {:?} refused: {}", request, e);
                }
                let _ = response.send(result);
            }

            RouterCommand::QueryStatus { response } => {
                let _ = response.send(self.snapshot());
            }

            RouterCommand::QueryAssignments { response } => {
                let _ = response.send(self.table.clone());
            }

            RouterCommand::Shutdown => {
                info!("Router shutting down");
                return false;
            }
        }
        true
    }

    fn set_mute(&self, request: MuteRequest) -> Result<(), RouterError> {
        let route = request.resolve(&self.table)?;
        let session = self
            .sessions
            .get(&route.address)
            .ok_or_else(|| RouterError::NotConnected(route.address.to_string()))?;
        session.send(route.command)?;
        info!(
            "{} {} on {}",
            if request.muted { "Muting" } else { "Unmuting" },
            route.slot,
            route.address
        );
        Ok(())
    }

    fn snapshot(&self) -> StatusSnapshot {
        let sessions = self
            .sessions
            .values()
            .map(|session| {
                let status = session.status();
                SessionSummary {
                    id: session.id(),
                    address: session.address().clone(),
                    state: status.state,
                    stats: status.stats,
                }
            })
            .collect();
        let connected = self
            .table
            .default_address()
            .and_then(|address| self.sessions.get(address))
            .is_some_and(SessionHandle::is_connected);

        StatusSnapshot {
            default_address: self.table.default_address().cloned(),
            connected,
            sessions,
        }
    }

    fn on_session_event(&mut self, event: SessionEvent) {
        let current = self.sessions.get(&event.address).map(SessionHandle::id);
        if current != Some(event.id) {
            trace!(
                "Dropping event from retired session {} for {}",
                event.id,
                event.address
            );
            return;
        }

        let address = event.address;
        match event.kind {
            SessionEventKind::Connected => {
                self.publish(RouterEvent::SessionState {
                    address: address.clone(),
                    state: SessionState::Connected,
                });
                self.publish(RouterEvent::Status {
                    connected: true,
                    address,
                });
            }
            SessionEventKind::Disconnected { reason } => {
                self.publish(RouterEvent::SessionState {
                    address: address.clone(),
                    state: SessionState::ReconnectWait,
                });
                self.publish(RouterEvent::Status {
                    connected: false,
                    address: address.clone(),
                });
                self.publish(RouterEvent::Error {
                    source: address.to_string(),
                    message: reason,
                });
            }
            SessionEventKind::Error(message) => {
                self.publish(RouterEvent::SessionState {
                    address: address.clone(),
                    state: SessionState::ReconnectWait,
                });
                self.publish(RouterEvent::Error {
                    source: address.to_string(),
                    message,
                });
            }
            SessionEventKind::Sample(sample) => self.route_sample(&address, sample),
        }
    }

    /// Publish a reading under every display channel the device currently owns
    fn route_sample(&self, address: &DeviceAddress, sample: Sample) {
        match sample {
            Sample::Gain {
                kind,
                channel,
                level,
                at,
            } => {
                for display in self.table.display_channels_for(address, kind, channel) {
                    self.publish(RouterEvent::ChannelSample {
                        channel: display,
                        level,
                        at,
                    });
                }
            }
            Sample::Mute {
                target: MuteTarget::Master,
                muted,
                at,
            } => {
                if self.table.default_address() == Some(address) {
                    self.publish(RouterEvent::MuteSample {
                        slot: MuteSlot::Master,
                        muted,
                        at,
                    });
                }
            }
            Sample::Mute {
                target: MuteTarget::Channel { kind, channel },
                muted,
                at,
            } => {
                for display in self.table.display_channels_for(address, kind, channel) {
                    self.publish(RouterEvent::MuteSample {
                        slot: MuteSlot::Channel(display),
                        muted,
                        at,
                    });
                }
            }
        }
    }

    /// Close every session and wait briefly for the tasks to exit
    async fn close_all(&mut self) {
        let sessions = std::mem::take(&mut self.sessions);
        for (address, session) in sessions {
            debug!("Closing session {} for {}", session.id(), address);
            let task = session.close();
            if tokio::time::timeout(SESSION_CLOSE_TIMEOUT, task)
                .await
                .is_err()
            {
                warn!("Session for {} did not stop in time", address);
            }
        }
    }
}

/// Run the router actor
///
/// Processes commands until `Shutdown` is received or every command sender
/// is dropped. Sessions for the initial table are opened immediately.
pub async fn run_router(
    config: RouterConfig,
    table: AssignmentTable,
    mut cmd_rx: mpsc::Receiver<RouterCommand>,
    event_tx: broadcast::Sender<RouterEvent>,
) {
    info!("Router actor starting");

    let (session_tx, mut session_rx) = mpsc::channel(config.event_capacity.max(1));
    let mut state = RouterState::new(config.session, table, session_tx, event_tx);
    state.reconcile();

    loop {
        tokio::select! {
            command = cmd_rx.recv() => {
                let Some(command) = command else {
                    info!("Router command channel closed");
                    break;
                };
                if !state.handle_command(command) {
                    break;
                }
            }

            Some(event) = session_rx.recv() => {
                state.on_session_event(event);
            }
        }
    }

    // Sessions blocked on a full event channel see it closed and exit
    drop(session_rx);
    state.close_all().await;
    info!("Router actor stopped");
}

/// Cloneable client for a running router actor
#[derive(Debug, Clone)]
pub struct RouterHandle {
    cmd_tx: mpsc::Sender<RouterCommand>,
    event_tx: broadcast::Sender<RouterEvent>,
}

impl RouterHandle {
    /// Spawn the router actor on the current runtime
    pub fn spawn(config: RouterConfig, table: AssignmentTable) -> (Self, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_capacity.max(1));
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));
        let task = tokio::spawn(run_router(config, table, cmd_rx, event_tx.clone()));
        (Self { cmd_tx, event_tx }, task)
    }

    /// Wrap channels for an actor started with [`run_router`]
    pub fn new(
        cmd_tx: mpsc::Sender<RouterCommand>,
        event_tx: broadcast::Sender<RouterEvent>,
    ) -> Self {
        Self { cmd_tx, event_tx }
    }

    /// Receive every event published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<RouterEvent> {
        self.event_tx.subscribe()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> RouterCommand,
    ) -> Result<T, RouterError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| RouterError::RouterClosed)?;
        rx.await.map_err(|_| RouterError::RouterClosed)
    }

    /// Use `address` as the default device
    pub async fn connect(&self, address: DeviceAddress) -> Result<(), RouterError> {
        self.request(|response| RouterCommand::Connect { address, response })
            .await?
    }

    /// Release the default device
    pub async fn disconnect(&self) -> Result<(), RouterError> {
        self.request(|response| RouterCommand::Disconnect { response })
            .await?
    }

    pub async fn set_assignment(
        &self,
        channel: DisplayChannel,
        address: Option<DeviceAddress>,
    ) -> Result<(), RouterError> {
        self.request(|response| RouterCommand::SetAssignment {
            channel,
            address,
            response,
        })
        .await?
    }

    pub async fn set_channel_number(
        &self,
        channel: DisplayChannel,
        physical: Option<u8>,
    ) -> Result<(), RouterError> {
        self.request(|response| RouterCommand::SetChannelNumber {
            channel,
            physical,
            response,
        })
        .await?
    }

    pub async fn load_assignments(&self, table: AssignmentTable) -> Result<(), RouterError> {
        self.request(|response| RouterCommand::LoadAssignments { table, response })
            .await
    }

    pub async fn set_mute(&self, request: MuteRequest) -> Result<(), RouterError> {
        self.request(|response| RouterCommand::SetMute { request, response })
            .await?
    }

    pub async fn status(&self) -> Result<StatusSnapshot, RouterError> {
        self.request(|response| RouterCommand::QueryStatus { response })
            .await
    }

    pub async fn assignments(&self) -> Result<AssignmentTable, RouterError> {
        self.request(|response| RouterCommand::QueryAssignments { response })
            .await
    }

    /// Ask the actor to stop; returns once the request is queued
    pub async fn shutdown(&self) -> Result<(), RouterError> {
        self.cmd_tx
            .send(RouterCommand::Shutdown)
            .await
            .map_err(|_| RouterError::RouterClosed)
    }
}
