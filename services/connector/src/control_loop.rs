//! Poll / execute / acknowledge loop.
//!
//! Each cycle fetches at most one command, runs it to completion and
//! acknowledges it. Polling speeds up for a while after any activity (a
//! command or a poll error) and falls back to the baseline when idle.
//! Shutdown is only observed while sleeping, so a command that has started
//! is always finished and acknowledged.

use std::future::Future;
use std::io;
use std::time::Duration;

use connector_protocol::Acknowledgment;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client::{ClientError, ControlPlaneClient};
use crate::dispatcher::Dispatcher;

/// Baseline interval when the control plane does not choose one.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Interval while boosted.
pub const FAST_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// How long polling stays fast after activity.
pub const BOOST_WINDOW: Duration = Duration::from_secs(60);

/// Minimum gap between "no commands" log lines.
const IDLE_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Adaptive poll interval.
#[derive(Debug, Clone)]
pub struct PollSchedule {
    base: Duration,
    fast: Duration,
    window: Duration,
    boost_until: Instant,
}

impl PollSchedule {
    /// Build a schedule from the configured interval in seconds (zero or
    /// negative means default). Starts boosted.
    pub fn new(poll_interval_seconds: i64, now: Instant) -> Self {
        let base = u64::try_from(poll_interval_seconds)
            .ok()
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_POLL_INTERVAL);
        Self::with_intervals(base, FAST_POLL_INTERVAL.min(base), BOOST_WINDOW, now)
    }

    pub fn with_intervals(base: Duration, fast: Duration, window: Duration, now: Instant) -> Self {
        Self {
            base,
            fast,
            window,
            boost_until: now + window,
        }
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn fast(&self) -> Duration {
        self.fast
    }

    /// Re-arm the boost window.
    pub fn record_activity(&mut self, now: Instant) {
        self.boost_until = now + self.window;
    }

    pub fn is_boosted(&self, now: Instant) -> bool {
        now < self.boost_until
    }

    /// Sleep to use before the next poll.
    pub fn interval_at(&self, now: Instant) -> Duration {
        if self.is_boosted(now) {
            self.fast
        } else {
            self.base
        }
    }
}

/// What a single cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// No command was pending.
    Idle,
    /// A command ran and an acknowledgment was attempted.
    Handled,
}

/// The connector's main loop.
pub struct ControlLoop {
    client: ControlPlaneClient,
    dispatcher: Dispatcher,
    schedule: PollSchedule,
    last_idle_log: Instant,
}

impl ControlLoop {
    pub fn new(client: ControlPlaneClient, dispatcher: Dispatcher, schedule: PollSchedule) -> Self {
        Self {
            client,
            dispatcher,
            schedule,
            last_idle_log: Instant::now(),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn schedule(&self) -> &PollSchedule {
        &self.schedule
    }

    /// Fetch and handle at most one command.
    ///
    /// Only fetch failures are returned. A command failure is acknowledged
    /// as an error and an acknowledgment failure is logged.
    pub async fn poll_once(&mut self) -> Result<CycleOutcome, ClientError> {
        let Some(envelope) = self.client.next_command().await? else {
            return Ok(CycleOutcome::Idle);
        };
        info!(id = %envelope.id, action = %envelope.action, "Command received");

        let ack = match self.dispatcher.execute(&envelope).await {
            Ok(result) => {
                info!(
                    id = %envelope.id,
                    action = %envelope.action,
                    state = %result.state,
                    "Command finished"
                );
                Acknowledgment::ok(&envelope.id, result)
            }
            Err(e) => {
                warn!(id = %envelope.id, action = %envelope.action, error = %e, "Command failed");
                Acknowledgment::error(&envelope.id, e.to_string())
            }
        };

        if let Err(e) = self.client.ack(&ack).await {
            warn!(id = %envelope.id, error = %e, "Ack failed");
        }
        Ok(CycleOutcome::Handled)
    }

    /// Run one cycle, updating the schedule. Returns the sleep before the
    /// next cycle.
    pub async fn cycle(&mut self) -> Duration {
        match self.poll_once().await {
            Ok(CycleOutcome::Handled) => self.schedule.record_activity(Instant::now()),
            Ok(CycleOutcome::Idle) => {
                if idle_log_due(&mut self.last_idle_log, Instant::now()) {
                    info!("Poll ok (no commands)");
                }
            }
            Err(e) => {
                warn!(error = %e, "Poll error");
                self.schedule.record_activity(Instant::now());
            }
        }
        self.schedule.interval_at(Instant::now())
    }

    /// Loop until `shutdown` resolves.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        info!(
            base_url = %self.client.base_url(),
            poll_seconds = self.schedule.base().as_secs(),
            fast_poll_seconds = self.schedule.fast().as_secs(),
            poll_boost_seconds = BOOST_WINDOW.as_secs(),
            "Connector started"
        );

        tokio::pin!(shutdown);
        loop {
            let interval = self.cycle().await;
            debug!(interval_secs = interval.as_secs(), "Sleeping until next poll");

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = &mut shutdown => {
                    info!("Connector shutting down");
                    break;
                }
            }
        }
    }
}

/// Whether an idle line should be logged at `now`. Advances `last` when it is.
fn idle_log_due(last: &mut Instant, now: Instant) -> bool {
    if now.saturating_duration_since(*last) < IDLE_LOG_INTERVAL {
        return false;
    }
    *last = now;
    true
}

/// Resolves on SIGTERM or SIGINT.
///
/// Handlers are installed before this returns, so a signal that arrives
/// while a command is running is still seen at the next sleep.
#[cfg(unix)]
pub fn shutdown_signal() -> io::Result<impl Future<Output = ()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    Ok(async move {
        tokio::select! {
            _ = terminate.recv() => info!("Received SIGTERM"),
            _ = interrupt.recv() => info!("Received SIGINT"),
        }
    })
}

#[cfg(not(unix))]
pub fn shutdown_signal() -> io::Result<impl Future<Output = ()>> {
    Ok(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received ctrl-c");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_defaults() {
        let now = Instant::now();
        let schedule = PollSchedule::new(0, now);
        assert_eq!(schedule.base(), Duration::from_secs(10));
        assert_eq!(schedule.fast(), Duration::from_secs(3));

        let schedule = PollSchedule::new(-5, now);
        assert_eq!(schedule.base(), Duration::from_secs(10));
    }

    #[test]
    fn test_fast_never_exceeds_base() {
        let schedule = PollSchedule::new(2, Instant::now());
        assert_eq!(schedule.base(), Duration::from_secs(2));
        assert_eq!(schedule.fast(), Duration::from_secs(2));
    }

    #[test]
    fn test_idle_log_at_most_once_per_minute() {
        let start = Instant::now();
        let mut last = start;

        assert!(!idle_log_due(&mut last, start + Duration::from_secs(10)));
        assert!(idle_log_due(&mut last, start + Duration::from_secs(60)));
        assert!(!idle_log_due(&mut last, start + Duration::from_secs(90)));
        assert!(idle_log_due(&mut last, start + Duration::from_secs(121)));
        assert_eq!(last, start + Duration::from_secs(121));
    }

    #[test]
    fn test_boost_window() {
        let start = Instant::now();
        let mut schedule = PollSchedule::new(10, start);

        assert_eq!(schedule.interval_at(start), Duration::from_secs(3));
        assert_eq!(
            schedule.interval_at(start + Duration::from_secs(59)),
            Duration::from_secs(3)
        );
        assert_eq!(
            schedule.interval_at(start + Duration::from_secs(60)),
            Duration::from_secs(10)
        );

        let command_at = start + Duration::from_secs(120);
        schedule.record_activity(command_at);
        assert_eq!(schedule.interval_at(command_at), Duration::from_secs(3));
        assert_eq!(
            schedule.interval_at(command_at + Duration::from_secs(45)),
            Duration::from_secs(3)
        );
        assert_eq!(
            schedule.interval_at(command_at + Duration::from_secs(61)),
            Duration::from_secs(10)
        );
    }
}
