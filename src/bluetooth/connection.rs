//! Connection state machine
//!
//! Owns the connection state, the retry budgets and the attempt token of the
//! current connection, and emits outcomes on the caller's connection stream.
//! Retrying is half-automatic: budgets are consumed here when a `Timeout` or
//! `Disconnect` is emitted, but only the caller decides to `reconnect()`.

use log::{debug, info, warn};
use tokio::sync::mpsc::UnboundedSender;

use crate::bluetooth::events::{ConnectionEvent, ConnectionResult, ConnectionUpdate, EventStream};
use crate::bluetooth::options::{ConnectOptions, RetryBudget};
use crate::bluetooth::peripheral::LinkContext;
use crate::bluetooth::snapshot::{ConnectionState, Termination};
use crate::bluetooth::timeout::TimerId;
use crate::bluetooth::transport::{Attempt, TransportEvent};
use crate::error::{PeripheralError, TransportError};

/// Configuration and remaining budgets of the current `connect()` call
#[derive(Debug, Clone)]
struct AttemptContext {
    options: ConnectOptions,
    timeout_retries: RetryBudget,
    disconnect_retries: RetryBudget,
}

impl AttemptContext {
    fn new(options: ConnectOptions) -> Self {
        Self {
            timeout_retries: options.timeout_retries,
            disconnect_retries: options.disconnect_retries,
            options,
        }
    }
}

pub(crate) struct ConnectionMachine {
    state: ConnectionState,
    attempt: Attempt,
    context: Option<AttemptContext>,
    subscriber: Option<UnboundedSender<ConnectionResult>>,
    timer: Option<TimerId>,
    forced: bool,
}

impl ConnectionMachine {
    pub fn new(state: ConnectionState) -> Self {
        Self {
            state,
            attempt: Attempt::INITIAL,
            context: None,
            subscriber: None,
            timer: None,
            forced: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Start a connection lifecycle and return its event stream
    pub fn connect(&mut self, ctx: &mut LinkContext, options: ConnectOptions) -> EventStream<ConnectionResult> {
        let (tx, stream) = EventStream::channel();
        if self.subscriber.replace(tx).is_some() {
            debug!("Replacing connection stream of {}", ctx.id);
        }
        self.context = Some(AttemptContext::new(options));

        match self.state {
            ConnectionState::Connected => {
                debug!("Already connected to {}", ctx.id);
            }
            ConnectionState::Connecting => {
                debug!("Connection to {} already in progress", ctx.id);
            }
            ConnectionState::Disconnected
            | ConnectionState::Disconnecting
            | ConnectionState::Terminated(_) => self.begin_attempt(ctx),
        }

        stream
    }

    /// Retry with the configuration of the last `connect()`
    pub fn reconnect(&mut self, ctx: &mut LinkContext) {
        match self.state {
            ConnectionState::Disconnected if self.context.is_some() => self.begin_attempt(ctx),
            ConnectionState::Disconnected => {
                debug!("Ignoring reconnect for {}: connect() was never called", ctx.id);
            }
            state => {
                debug!("Ignoring reconnect for {} while {}", ctx.id, state);
            }
        }
    }

    /// Caller-initiated disconnect
    pub fn disconnect(&mut self, ctx: &mut LinkContext) {
        self.cancel_timer(ctx);

        match self.state {
            ConnectionState::Connected => {
                self.forced = true;
                let attempt = self.advance(ctx);
                self.set_state(ctx, ConnectionState::Disconnecting);
                debug!("Disconnecting from {} ({})", ctx.id, attempt);
                ctx.transport.disconnect(&ctx.id, ctx.callback(attempt));
            }
            ConnectionState::Connecting => {
                let attempt = self.advance(ctx);
                debug!("Abandoning connection attempt to {} ({})", ctx.id, attempt);
                ctx.transport.disconnect(&ctx.id, ctx.callback(attempt));
                self.set_state(ctx, ConnectionState::Disconnected);
                self.emit(ctx, ConnectionEvent::ForceDisconnect);
            }
            ConnectionState::Disconnecting => {
                debug!("Disconnect from {} already in progress", ctx.id);
            }
            ConnectionState::Disconnected | ConnectionState::Terminated(_) => {
                self.fail(PeripheralError::Disconnected);
            }
        }
    }

    /// Handle a timer fire. Returns `false` if the timer is not ours.
    pub fn on_timer(&mut self, ctx: &mut LinkContext, timer: TimerId) -> bool {
        if self.timer != Some(timer) {
            return false;
        }
        self.timer = None;

        if self.state != ConnectionState::Connecting {
            debug!("Ignoring connection timeout of {} while {}", ctx.id, self.state);
            return true;
        }

        let attempt = self.advance(ctx);
        warn!("Connection to {} timed out", ctx.id);
        ctx.transport.disconnect(&ctx.id, ctx.callback(attempt));
        self.set_state(ctx, ConnectionState::Disconnected);

        let retry = self.context.as_mut().map_or(true, |context| {
            let retry = context.timeout_retries.try_consume();
            debug!("Timeout retries left for {}: {:?}", ctx.id, context.timeout_retries.remaining());
            retry
        });
        if retry {
            self.emit(ctx, ConnectionEvent::Timeout);
        } else {
            self.give_up(ctx);
        }
        true
    }

    /// Handle a link-level transport event
    pub fn on_transport(&mut self, ctx: &mut LinkContext, attempt: Attempt, event: TransportEvent) {
        if attempt != self.attempt {
            debug!("Discarding stale {:?} for {} (attempt {}, current {})", event, ctx.id, attempt, self.attempt);
            return;
        }

        match event {
            TransportEvent::Connected => self.on_connected(ctx),
            TransportEvent::FailedToConnect(error) => self.on_failed_to_connect(ctx, error),
            TransportEvent::Disconnected(error) => self.on_disconnected(ctx, error),
            other => debug!("Connection state machine ignoring {:?}", other),
        }
    }

    fn on_connected(&mut self, ctx: &mut LinkContext) {
        if self.state != ConnectionState::Connecting {
            debug!("Ignoring connect completion for {} while {}", ctx.id, self.state);
            return;
        }
        self.cancel_timer(ctx);
        self.set_state(ctx, ConnectionState::Connected);
        info!("Connected to {}", ctx.id);
        self.emit(ctx, ConnectionEvent::Connect);
    }

    fn on_failed_to_connect(&mut self, ctx: &mut LinkContext, error: TransportError) {
        if self.state != ConnectionState::Connecting {
            debug!("Ignoring connect failure for {} while {}", ctx.id, self.state);
            return;
        }
        self.cancel_timer(ctx);
        self.set_state(ctx, ConnectionState::Disconnected);
        warn!("Failed to connect to {}: {}", ctx.id, error);
        self.fail(error.into());
    }

    fn on_disconnected(&mut self, ctx: &mut LinkContext, error: Option<TransportError>) {
        match self.state {
            ConnectionState::Connecting => {
                // The link dropped before it was ever up
                self.cancel_timer(ctx);
                self.set_state(ctx, ConnectionState::Disconnected);
                warn!("Lost {} while connecting", ctx.id);
                self.fail(error.map_or(PeripheralError::Disconnected, PeripheralError::from));
            }
            ConnectionState::Connected | ConnectionState::Disconnecting => {
                let forced = std::mem::take(&mut self.forced);
                self.set_state(ctx, ConnectionState::Disconnected);
                info!("Disconnected from {}{}", ctx.id, if forced { " (forced)" } else { "" });

                let retry = self.context.as_mut().map_or(true, |context| {
                    let retry = context.disconnect_retries.try_consume();
                    debug!(
                        "Disconnect retries left for {}: {:?}",
                        ctx.id,
                        context.disconnect_retries.remaining()
                    );
                    retry
                });
                if !retry {
                    self.give_up(ctx);
                } else if forced {
                    self.emit(ctx, ConnectionEvent::ForceDisconnect);
                } else if let Some(error) = error {
                    self.fail(error.into());
                } else {
                    self.emit(ctx, ConnectionEvent::Disconnect);
                }
            }
            ConnectionState::Disconnected | ConnectionState::Terminated(_) => {
                debug!("Ignoring disconnect of {} while {}", ctx.id, self.state);
            }
        }
    }

    fn begin_attempt(&mut self, ctx: &mut LinkContext) {
        self.cancel_timer(ctx);
        self.forced = false;
        let attempt = self.advance(ctx);
        self.set_state(ctx, ConnectionState::Connecting);

        debug!("Connecting to {} ({})", ctx.id, attempt);
        ctx.transport.connect(&ctx.id, ctx.callback(attempt));

        if let Some(timeout) = self.context.as_ref().and_then(|context| context.options.timeout) {
            self.timer = Some(ctx.timers.arm(timeout));
        }
    }

    fn give_up(&mut self, ctx: &mut LinkContext) {
        self.set_state(ctx, ConnectionState::Terminated(Termination::GiveUp));
        warn!("Giving up on {}", ctx.id);
        self.emit(ctx, ConnectionEvent::GiveUp);
        self.context = None;
    }

    /// Start a new attempt; completions of older attempts become stale
    fn advance(&mut self, ctx: &mut LinkContext) -> Attempt {
        self.attempt = ctx.next_attempt();
        let attempt = self.attempt;
        ctx.update(|snapshot| snapshot.link = attempt);
        attempt
    }

    fn cancel_timer(&mut self, ctx: &mut LinkContext) {
        if let Some(timer) = self.timer.take() {
            ctx.timers.cancel(timer);
        }
    }

    fn set_state(&mut self, ctx: &LinkContext, state: ConnectionState) {
        self.state = state;
        ctx.update(|snapshot| snapshot.state = state);
    }

    fn emit(&mut self, ctx: &LinkContext, event: ConnectionEvent) {
        let update = ConnectionUpdate {
            peripheral: ctx.snapshot(),
            event,
        };
        self.send(Ok(update));
        if event.is_terminal() {
            // Ends the caller's stream
            self.subscriber = None;
        }
    }

    fn fail(&mut self, error: PeripheralError) {
        self.send(Err(error));
    }

    fn send(&mut self, item: ConnectionResult) {
        if let Some(subscriber) = &self.subscriber {
            if subscriber.send(item).is_err() {
                debug!("Connection stream dropped by caller");
                self.subscriber = None;
            }
        }
    }
}
