//! Service discovery pipeline
//!
//! A plain discovery asks the transport for the service list. A full
//! discovery then asks for the characteristics of every service and only
//! completes once all of them have answered. The optional timeout covers the
//! whole chain, and the first error fails it.

use std::time::Duration;

use log::{debug, warn};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::bluetooth::peripheral::LinkContext;
use crate::bluetooth::snapshot::{DiscoveredCharacteristic, DiscoveredService};
use crate::bluetooth::timeout::TimerId;
use crate::bluetooth::transport::Attempt;
use crate::error::{PeripheralError, Result, TransportError};

pub(crate) type DiscoveryReply = oneshot::Sender<Result<Vec<DiscoveredService>>>;

/// How far a discovery goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DiscoveryDepth {
    Services,
    Characteristics,
}

enum Phase {
    Services,
    /// Services are known; `pending[i]` is set while service `i` awaits its
    /// characteristics
    Characteristics {
        services: Vec<DiscoveredService>,
        pending: Vec<bool>,
    },
}

struct PendingDiscovery {
    attempt: Attempt,
    timer: Option<TimerId>,
    depth: DiscoveryDepth,
    phase: Phase,
    reply: DiscoveryReply,
}

/// At most one discovery in flight per peripheral
#[derive(Default)]
pub(crate) struct DiscoveryPipeline {
    pending: Option<PendingDiscovery>,
}

impl DiscoveryPipeline {
    pub fn discover(
        &mut self,
        ctx: &mut LinkContext,
        connected: bool,
        depth: DiscoveryDepth,
        timeout: Option<Duration>,
        reply: DiscoveryReply,
    ) {
        if !connected {
            let _ = reply.send(Err(PeripheralError::Disconnected));
            return;
        }
        if self.pending.is_some() {
            let _ = reply.send(Err(PeripheralError::ServiceDiscoveryInProgress));
            return;
        }

        let attempt = ctx.next_attempt();
        debug!("Discovering services of {} ({}, {:?})", ctx.id, attempt, depth);
        ctx.transport.discover_services(&ctx.id, ctx.callback(attempt));
        let timer = timeout.map(|timeout| ctx.timers.arm(timeout));

        self.pending = Some(PendingDiscovery {
            attempt,
            timer,
            depth,
            phase: Phase::Services,
            reply,
        });
    }

    pub fn on_services(
        &mut self,
        ctx: &mut LinkContext,
        attempt: Attempt,
        services: Vec<DiscoveredService>,
        error: Option<TransportError>,
    ) {
        let pending = match self.pending.take() {
            Some(pending) if pending.attempt == attempt && matches!(pending.phase, Phase::Services) => {
                pending
            }
            other => {
                debug!("Discarding stale service discovery response for {} ({})", ctx.id, attempt);
                self.pending = other;
                return;
            }
        };

        if let Some(error) = error {
            warn!("Service discovery failed for {}: {}", ctx.id, error);
            return Self::finish(ctx, pending, Err(error.into()));
        }
        if services.is_empty() {
            return Self::finish(ctx, pending, Err(PeripheralError::NoServices));
        }
        debug!("Discovered {} services on {}", services.len(), ctx.id);

        match pending.depth {
            DiscoveryDepth::Services => Self::finish(ctx, pending, Ok(services)),
            DiscoveryDepth::Characteristics => {
                for service in &services {
                    ctx.transport
                        .discover_characteristics(&ctx.id, service.uuid, ctx.callback(attempt));
                }
                let pending_flags = vec![true; services.len()];
                self.pending = Some(PendingDiscovery {
                    phase: Phase::Characteristics {
                        services,
                        pending: pending_flags,
                    },
                    ..pending
                });
            }
        }
    }

    pub fn on_characteristics(
        &mut self,
        ctx: &mut LinkContext,
        attempt: Attempt,
        service: Uuid,
        characteristics: Vec<DiscoveredCharacteristic>,
        error: Option<TransportError>,
    ) {
        let Some(mut pending) = self.pending.take() else {
            debug!("Discarding unsolicited characteristics of {} on {}", service, ctx.id);
            return;
        };
        let slot = match &pending.phase {
            Phase::Characteristics { services, pending: waiting } if pending.attempt == attempt => services
                .iter()
                .zip(waiting)
                .position(|(known, waiting)| *waiting && known.uuid == service),
            _ => None,
        };
        let Some(slot) = slot else {
            debug!("Discarding stale characteristics of {} on {} ({})", service, ctx.id, attempt);
            self.pending = Some(pending);
            return;
        };

        if let Some(error) = error {
            warn!("Characteristic discovery of {} failed for {}: {}", service, ctx.id, error);
            return Self::finish(ctx, pending, Err(error.into()));
        }

        let done = match &mut pending.phase {
            Phase::Characteristics { services, pending: waiting } => {
                services[slot].characteristics = characteristics;
                waiting[slot] = false;
                !waiting.contains(&true)
            }
            Phase::Services => false,
        };
        if !done {
            self.pending = Some(pending);
            return;
        }

        match std::mem::replace(&mut pending.phase, Phase::Services) {
            Phase::Characteristics { services, .. } => {
                debug!("Discovered characteristics of {} services on {}", services.len(), ctx.id);
                Self::finish(ctx, pending, Ok(services));
            }
            Phase::Services => self.pending = Some(pending),
        }
    }

    /// Handle a timer fire. Returns `false` if the timer is not ours.
    pub fn on_timer(&mut self, ctx: &mut LinkContext, timer: TimerId) -> bool {
        match self.pending.take() {
            Some(mut pending) if pending.timer == Some(timer) => {
                warn!("Service discovery timed out for {}", ctx.id);
                pending.timer = None;
                Self::finish(ctx, pending, Err(PeripheralError::ServiceDiscoveryTimeout));
                true
            }
            other => {
                self.pending = other;
                false
            }
        }
    }

    /// The link went down
    pub fn on_disconnected(&mut self, ctx: &mut LinkContext) {
        match self.pending.take() {
            Some(pending) => Self::finish(ctx, pending, Err(PeripheralError::Disconnected)),
            None => ctx.update(|snapshot| snapshot.services.clear()),
        }
    }

    /// Publish the outcome: services on success, an empty list otherwise
    fn finish(ctx: &mut LinkContext, pending: PendingDiscovery, result: Result<Vec<DiscoveredService>>) {
        if let Some(timer) = pending.timer {
            ctx.timers.cancel(timer);
        }
        match &result {
            Ok(services) => ctx.update(|snapshot| snapshot.services = services.clone()),
            Err(_) => ctx.update(|snapshot| snapshot.services.clear()),
        }
        let _ = pending.reply.send(result);
    }
}
