//! The global dispatcher: fans catalog change events into coalesced
//! proxy-broadcast announcements.
//!
//! Two timers bound the coalescing window. The grace deadline slides
//! forward on every qualifying event, collapsing bursts of related changes
//! into one broadcast; the hard deadline keeps its original fire time, so
//! continuous churn cannot delay an update forever. Whichever fires first
//! publishes a single [`Topic::ProxyBroadcast`] and disarms both.

use std::time::Duration;

use metrics::counter;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::bus::Broker;
use crate::event::{Event, Topic};
use crate::shutdown::ShutdownSignal;

/// Timing configuration for broadcast coalescing.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// How long to wait for further changes before broadcasting. Re-armed
    /// by every qualifying event.
    pub grace_deadline: Duration,
    /// Upper bound on how long a scheduled broadcast may be delayed.
    pub hard_deadline: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            grace_deadline: Duration::from_secs(3),
            hard_deadline: Duration::from_secs(15),
        }
    }
}

impl DispatchConfig {
    /// Override the grace deadline.
    #[must_use]
    pub fn with_grace_deadline(mut self, grace: Duration) -> Self {
        self.grace_deadline = grace;
        self
    }

    /// Override the hard deadline.
    #[must_use]
    pub fn with_hard_deadline(mut self, hard: Duration) -> Self {
        self.hard_deadline = hard;
        self
    }
}

/// The broadcast-coalescing event loop. One per process.
#[derive(Debug)]
pub struct Dispatcher {
    broker: Broker,
    config: DispatchConfig,
}

impl Dispatcher {
    /// Create a dispatcher over the given bus.
    pub fn new(broker: Broker, config: DispatchConfig) -> Self {
        Self { broker, config }
    }

    /// Spawn the dispatcher loop; it runs until `shutdown` triggers or the
    /// bus closes.
    pub fn spawn(self, shutdown: ShutdownSignal) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Run the dispatcher loop on the current task.
    pub async fn run(self, mut shutdown: ShutdownSignal) {
        let mut subscription = self.broker.subscribe(
            Topic::POLICY_CHANGES
                .into_iter()
                .chain([Topic::ScheduleProxyBroadcast]),
        );

        let mut scheduled = false;
        let mut grace_at: Option<Instant> = None;
        let mut hard_at: Option<Instant> = None;

        info!("dispatcher started");

        loop {
            // The earlier of the two armed deadlines, if any.
            let next_deadline = match (grace_at, hard_at) {
                (Some(g), Some(h)) => Some(g.min(h)),
                (deadline, None) | (None, deadline) => deadline,
            };

            tokio::select! {
                _ = shutdown.wait() => {
                    debug!("dispatcher stopping");
                    break;
                }

                maybe_event = subscription.recv() => {
                    let Some(event) = maybe_event else {
                        warn!("event bus closed, dispatcher stopping");
                        break;
                    };

                    let delta = event.is_delta();
                    debug!(topic = %event.topic, delta, "dispatcher observed event");

                    if !delta && event.topic != Topic::ScheduleProxyBroadcast {
                        continue;
                    }

                    let now = Instant::now();
                    if !scheduled {
                        scheduled = true;
                        hard_at = Some(now + self.config.hard_deadline);
                        grace_at = Some(now + self.config.grace_deadline);
                        info!("proxy broadcast scheduled");
                    } else {
                        // Already scheduled: only the grace window slides.
                        grace_at = Some(now + self.config.grace_deadline);
                    }
                }

                _ = tokio::time::sleep_until(next_deadline.unwrap_or_else(Instant::now)),
                    if next_deadline.is_some() =>
                {
                    info!("coalescing window elapsed, broadcasting proxy update");
                    self.broker.publish(Event::new(Topic::ProxyBroadcast));
                    counter!("mesh_proxy_broadcast_total").increment(1);

                    scheduled = false;
                    grace_at = None;
                    hard_at = None;
                }
            }
        }
    }
}
