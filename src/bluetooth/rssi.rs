//! Signal strength reads and the polling loop
//!
//! Reads are coalesced: while one transport read is in flight, further
//! requests (single reads or poll ticks) wait on the same completion. The
//! polling loop re-arms its timer only after its read completes, so reads
//! never overlap.

use std::time::Duration;

use log::{debug, warn};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;

use crate::bluetooth::events::{EventStream, RssiResult};
use crate::bluetooth::peripheral::LinkContext;
use crate::bluetooth::timeout::TimerId;
use crate::bluetooth::transport::Attempt;
use crate::error::{PeripheralError, TransportError};

pub(crate) type RssiReply = oneshot::Sender<RssiResult>;

enum Waiter {
    Read(RssiReply),
    Poll(u64),
}

struct PollLoop {
    generation: u64,
    interval: Duration,
    timer: Option<TimerId>,
    sink: UnboundedSender<RssiResult>,
}

#[derive(Default)]
pub(crate) struct RssiReader {
    in_flight: Option<Attempt>,
    waiters: Vec<Waiter>,
    poll: Option<PollLoop>,
    generations: u64,
}

impl RssiReader {
    pub fn read(&mut self, ctx: &mut LinkContext, connected: bool, reply: RssiReply) {
        if !connected {
            let _ = reply.send(Err(PeripheralError::Disconnected));
            return;
        }
        self.waiters.push(Waiter::Read(reply));
        self.issue(ctx);
    }

    pub fn start_polling(
        &mut self,
        ctx: &mut LinkContext,
        connected: bool,
        interval: Duration,
    ) -> EventStream<RssiResult> {
        self.stop_polling(ctx);
        let (sink, stream) = EventStream::channel();

        if !connected {
            let _ = sink.send(Err(PeripheralError::Disconnected));
            return stream;
        }

        self.generations += 1;
        debug!("Polling RSSI of {} every {:?}", ctx.id, interval);
        self.poll = Some(PollLoop {
            generation: self.generations,
            interval,
            timer: Some(ctx.timers.arm(interval)),
            sink,
        });
        stream
    }

    /// Idempotent; readings still in flight are dropped
    pub fn stop_polling(&mut self, ctx: &mut LinkContext) {
        if let Some(poll) = self.poll.take() {
            if let Some(timer) = poll.timer {
                ctx.timers.cancel(timer);
            }
            debug!("Stopped polling RSSI of {}", ctx.id);
        }
    }

    /// Handle a timer fire. Returns `false` if the timer is not ours.
    pub fn on_timer(&mut self, ctx: &mut LinkContext, connected: bool, timer: TimerId) -> bool {
        let generation = match self.poll.as_mut() {
            Some(poll) if poll.timer == Some(timer) => {
                poll.timer = None;
                poll.generation
            }
            _ => return false,
        };

        if !connected {
            self.terminate_poll(PeripheralError::Disconnected);
            return true;
        }
        self.waiters.push(Waiter::Poll(generation));
        self.issue(ctx);
        true
    }

    pub fn on_rssi(&mut self, ctx: &mut LinkContext, attempt: Attempt, rssi: i16, error: Option<TransportError>) {
        if self.in_flight != Some(attempt) {
            debug!("Discarding stale RSSI response for {} ({})", ctx.id, attempt);
            return;
        }
        self.in_flight = None;

        let result = match error {
            Some(error) => {
                warn!("RSSI read failed for {}: {}", ctx.id, error);
                Err(PeripheralError::from(error))
            }
            None => {
                ctx.update(|snapshot| snapshot.rssi = rssi);
                Ok(rssi)
            }
        };

        for waiter in std::mem::take(&mut self.waiters) {
            match waiter {
                Waiter::Read(reply) => {
                    let _ = reply.send(result.clone());
                }
                Waiter::Poll(generation) => self.on_poll_reading(ctx, generation, result.clone()),
            }
        }
    }

    /// The link went down
    pub fn on_disconnected(&mut self, ctx: &mut LinkContext) {
        self.in_flight = None;
        for waiter in std::mem::take(&mut self.waiters) {
            if let Waiter::Read(reply) = waiter {
                let _ = reply.send(Err(PeripheralError::Disconnected));
            }
        }
        if let Some(timer) = self.poll.as_mut().and_then(|poll| poll.timer.take()) {
            ctx.timers.cancel(timer);
        }
        self.terminate_poll(PeripheralError::Disconnected);
    }

    fn on_poll_reading(&mut self, ctx: &mut LinkContext, generation: u64, result: RssiResult) {
        let Some(poll) = self.poll.as_mut().filter(|poll| poll.generation == generation) else {
            return;
        };

        match result {
            Ok(rssi) => {
                if poll.sink.send(Ok(rssi)).is_err() {
                    debug!("RSSI stream of {} dropped by caller", ctx.id);
                    self.poll = None;
                    return;
                }
                poll.timer = Some(ctx.timers.arm(poll.interval));
            }
            Err(error) => self.terminate_poll(error),
        }
    }

    fn terminate_poll(&mut self, error: PeripheralError) {
        if let Some(poll) = self.poll.take() {
            let _ = poll.sink.send(Err(error));
        }
    }

    fn issue(&mut self, ctx: &mut LinkContext) {
        if self.in_flight.is_some() {
            return;
        }
        let attempt = ctx.next_attempt();
        self.in_flight = Some(attempt);
        debug!("Reading RSSI of {} ({})", ctx.id, attempt);
        ctx.transport.read_rssi(&ctx.id, ctx.callback(attempt));
    }
}
