//! Peripheral handle and the task that owns its state
//!
//! Every peripheral runs one tokio task. Caller commands, transport events
//! and timer fires all land in that task and are handled one at a time, so the
//! state machine, the discovery pipeline and the RSSI reader never need locks.
//! Callers observe state through a `watch` snapshot.

use std::sync::Arc;
use std::time::Duration;

use log::debug;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::{oneshot, watch};

use crate::bluetooth::connection::ConnectionMachine;
use crate::bluetooth::discovery::{DiscoveryDepth, DiscoveryPipeline, DiscoveryReply};
use crate::bluetooth::events::{ConnectionResult, EventStream, RssiResult};
use crate::bluetooth::options::ConnectOptions;
use crate::bluetooth::rssi::{RssiReader, RssiReply};
use crate::bluetooth::snapshot::{
    Advertisement, ConnectionState, DiscoveredService, PeripheralId, PeripheralSnapshot,
};
use crate::bluetooth::timeout::{TimeoutScheduler, TimerId};
use crate::bluetooth::transport::{Attempt, Callback, Transport, TransportEvent, TransportMessage};
use crate::error::{PeripheralError, Result};

/// Resources shared by the components of one peripheral task
pub(crate) struct LinkContext {
    pub id: PeripheralId,
    pub transport: Arc<dyn Transport>,
    pub timers: TimeoutScheduler,
    events: UnboundedSender<TransportMessage>,
    snapshot: watch::Sender<PeripheralSnapshot>,
    last_attempt: Attempt,
}

impl LinkContext {
    /// Allocate a fresh attempt token
    pub fn next_attempt(&mut self) -> Attempt {
        self.last_attempt = self.last_attempt.next();
        self.last_attempt
    }

    /// Completion handle for a transport call made under `attempt`
    pub fn callback(&self, attempt: Attempt) -> Callback {
        Callback::new(attempt, self.events.clone())
    }

    pub fn snapshot(&self) -> PeripheralSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn update<F: FnOnce(&mut PeripheralSnapshot)>(&self, modify: F) {
        self.snapshot.send_modify(modify);
    }
}

enum Command {
    Connect {
        options: ConnectOptions,
        reply: oneshot::Sender<EventStream<ConnectionResult>>,
    },
    Reconnect {
        done: oneshot::Sender<()>,
    },
    Disconnect {
        done: oneshot::Sender<()>,
    },
    DiscoverServices {
        depth: DiscoveryDepth,
        timeout: Option<Duration>,
        reply: DiscoveryReply,
    },
    ReadRssi {
        reply: RssiReply,
    },
    StartPolling {
        interval: Duration,
        reply: oneshot::Sender<EventStream<RssiResult>>,
    },
    StopPolling {
        done: oneshot::Sender<()>,
    },
}

struct PeripheralTask {
    ctx: LinkContext,
    connection: ConnectionMachine,
    discovery: DiscoveryPipeline,
    rssi: RssiReader,
}

impl PeripheralTask {
    async fn run(
        mut self,
        mut commands: UnboundedReceiver<Command>,
        mut events: UnboundedReceiver<TransportMessage>,
        mut timers: UnboundedReceiver<TimerId>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(message) = events.recv() => self.handle_transport(message),
                Some(timer) = timers.recv() => self.handle_timer(timer),
            }
        }
        debug!("Peripheral task for {} stopped", self.ctx.id);
    }

    /// Connected as far as both the state machine and the radio are concerned
    fn is_connected(&self) -> bool {
        self.connection.is_connected() && self.ctx.transport.is_connected(&self.ctx.id)
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { options, reply } => {
                // Connecting while Disconnecting drops the old link
                let was_linked = self.linked();
                let stream = self.connection.connect(&mut self.ctx, options);
                self.after_transition(was_linked);
                let _ = reply.send(stream);
            }
            Command::Reconnect { done } => {
                self.connection.reconnect(&mut self.ctx);
                let _ = done.send(());
            }
            Command::Disconnect { done } => {
                let was_linked = self.linked();
                self.connection.disconnect(&mut self.ctx);
                self.after_transition(was_linked);
                let _ = done.send(());
            }
            Command::DiscoverServices { depth, timeout, reply } => {
                let connected = self.is_connected();
                self.discovery.discover(&mut self.ctx, connected, depth, timeout, reply);
            }
            Command::ReadRssi { reply } => {
                let connected = self.is_connected();
                self.rssi.read(&mut self.ctx, connected, reply);
            }
            Command::StartPolling { interval, reply } => {
                let connected = self.is_connected();
                let stream = self.rssi.start_polling(&mut self.ctx, connected, interval);
                let _ = reply.send(stream);
            }
            Command::StopPolling { done } => {
                self.rssi.stop_polling(&mut self.ctx);
                let _ = done.send(());
            }
        }
    }

    fn handle_transport(&mut self, message: TransportMessage) {
        let TransportMessage { attempt, event } = message;
        match event {
            TransportEvent::ServicesDiscovered { services, error } => {
                self.discovery.on_services(&mut self.ctx, attempt, services, error);
            }
            TransportEvent::CharacteristicsDiscovered {
                service,
                characteristics,
                error,
            } => {
                self.discovery
                    .on_characteristics(&mut self.ctx, attempt, service, characteristics, error);
            }
            TransportEvent::RssiRead { rssi, error } => {
                self.rssi.on_rssi(&mut self.ctx, attempt, rssi, error);
            }
            link_event => {
                let was_linked = self.linked();
                self.connection.on_transport(&mut self.ctx, attempt, link_event);
                self.after_transition(was_linked);
            }
        }
    }

    fn handle_timer(&mut self, timer: TimerId) {
        if !self.ctx.timers.take_fired(timer) {
            debug!("Ignoring cancelled {}", timer);
            return;
        }

        let was_linked = self.linked();
        if self.connection.on_timer(&mut self.ctx, timer) {
            self.after_transition(was_linked);
            return;
        }
        if self.discovery.on_timer(&mut self.ctx, timer) {
            return;
        }
        let connected = self.is_connected();
        if !self.rssi.on_timer(&mut self.ctx, connected, timer) {
            debug!("No owner for {}", timer);
        }
    }

    fn linked(&self) -> bool {
        matches!(
            self.connection.state(),
            ConnectionState::Connected | ConnectionState::Disconnecting
        )
    }

    /// Fail work that depends on the link once it has gone down
    fn after_transition(&mut self, was_linked: bool) {
        if was_linked && !self.linked() {
            self.discovery.on_disconnected(&mut self.ctx);
            self.rssi.on_disconnected(&mut self.ctx);
        }
    }
}

/// Handle to a remote peripheral
///
/// Cheap to clone. The owning task stops when the last handle is dropped.
#[derive(Clone)]
pub struct Peripheral {
    id: PeripheralId,
    commands: UnboundedSender<Command>,
    snapshot: watch::Receiver<PeripheralSnapshot>,
    events: UnboundedSender<TransportMessage>,
}

impl std::fmt::Debug for Peripheral {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peripheral")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

impl Peripheral {
    /// Create a peripheral and spawn its task on the current tokio runtime
    ///
    /// The initial state is `Connected` if the transport already reports a
    /// link, `Disconnected` otherwise.
    pub fn new(
        id: PeripheralId,
        advertisement: Advertisement,
        rssi: i16,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let initial = if transport.is_connected(&id) {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        };

        let (command_tx, command_rx) = unbounded_channel();
        let (event_tx, event_rx) = unbounded_channel();
        let (timer_tx, timer_rx) = unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(PeripheralSnapshot::new(
            id.clone(),
            advertisement,
            rssi,
            initial,
        ));

        let task = PeripheralTask {
            ctx: LinkContext {
                id: id.clone(),
                transport,
                timers: TimeoutScheduler::new(timer_tx),
                events: event_tx.clone(),
                snapshot: snapshot_tx,
                last_attempt: Attempt::INITIAL,
            },
            connection: ConnectionMachine::new(initial),
            discovery: DiscoveryPipeline::default(),
            rssi: RssiReader::default(),
        };
        tokio::spawn(task.run(command_rx, event_rx, timer_rx));

        Self {
            id,
            commands: command_tx,
            snapshot: snapshot_rx,
            events: event_tx,
        }
    }

    pub fn id(&self) -> &PeripheralId {
        &self.id
    }

    /// Current state as published by the peripheral task
    pub fn snapshot(&self) -> PeripheralSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.snapshot.borrow().state
    }

    /// Whether the peripheral task reports the link up
    pub fn is_connected(&self) -> bool {
        self.snapshot.borrow().is_connected()
    }

    /// Last known signal strength
    pub fn rssi(&self) -> i16 {
        self.snapshot.borrow().rssi
    }

    /// Services found by the last successful discovery
    pub fn services(&self) -> Vec<DiscoveredService> {
        self.snapshot.borrow().services.clone()
    }

    pub fn advertisement(&self) -> Advertisement {
        self.snapshot.borrow().advertisement.clone()
    }

    /// Callback bound to the current connection, for transports reporting
    /// unsolicited link loss
    pub fn link_callback(&self) -> Callback {
        Callback::new(self.snapshot.borrow().link, self.events.clone())
    }

    /// Connect and follow the connection lifecycle
    ///
    /// A no-op for the transport when already connected or connecting. The
    /// stream replaces any stream returned by an earlier call and ends after
    /// `GiveUp`.
    pub async fn connect(&self, options: ConnectOptions) -> Result<EventStream<ConnectionResult>> {
        self.request(|reply| Command::Connect { options, reply }).await
    }

    /// Try again after a `Timeout`, `Disconnect` or connection error
    pub async fn reconnect(&self) -> Result<()> {
        self.request(|done| Command::Reconnect { done }).await
    }

    /// Close the link, or abandon a pending connection attempt
    ///
    /// While connected the link is closed and `ForceDisconnect` follows once
    /// the transport confirms. While connecting the attempt is abandoned and
    /// `ForceDisconnect` is emitted right away, without waiting for the
    /// transport. While disconnected or terminated the connection stream
    /// receives `Err(PeripheralError::Disconnected)`.
    pub async fn disconnect(&self) -> Result<()> {
        self.request(|done| Command::Disconnect { done }).await
    }

    /// Discover all services, optionally bounded by `timeout`
    pub async fn discover_all_services(&self, timeout: Option<Duration>) -> Result<Vec<DiscoveredService>> {
        self.discover(DiscoveryDepth::Services, timeout).await
    }

    /// Discover all services and then the characteristics of each of them
    ///
    /// `timeout` bounds the whole chain. The first failing characteristic
    /// discovery fails the result with its transport error.
    pub async fn discover_all_peripheral_services(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Vec<DiscoveredService>> {
        self.discover(DiscoveryDepth::Characteristics, timeout).await
    }

    pub async fn read_rssi(&self) -> Result<i16> {
        self.request(|reply| Command::ReadRssi { reply }).await?
    }

    /// Read RSSI every `interval` until stopped, disconnected or a read fails
    pub async fn start_polling_rssi(&self, interval: Duration) -> Result<EventStream<RssiResult>> {
        self.request(|reply| Command::StartPolling { interval, reply }).await
    }

    pub async fn stop_polling_rssi(&self) -> Result<()> {
        self.request(|done| Command::StopPolling { done }).await
    }

    async fn discover(&self, depth: DiscoveryDepth, timeout: Option<Duration>) -> Result<Vec<DiscoveredService>> {
        self.request(|reply| Command::DiscoverServices { depth, timeout, reply })
            .await?
    }

    async fn request<T, F>(&self, command: F) -> Result<T>
    where
        F: FnOnce(oneshot::Sender<T>) -> Command,
    {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .map_err(|_| PeripheralError::Stopped)?;
        rx.await.map_err(|_| PeripheralError::Stopped)
    }
}
