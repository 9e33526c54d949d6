//! One watering cycle for one channel, run as its own task.
//!
//! ## State machine
//!
//! ```text
//! Idle ──▶ Acquiring ──[moisture above threshold]──────────────────────▶ Done
//!              │
//!              ▼ (pin lock taken)
//!             On ──▶ WaitingForStop ──[duration | signal]──▶ Off ──▶ Done
//!              │                                              ▲
//!              └──[relay fault]──▶ Error ─────────────────────┘
//! ```
//!
//! Driving the pin off, releasing the pin lock and dropping the registry
//! entry belong to an [`ExitGuard`], so they also happen when the task
//! panics or is aborted mid-cycle.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::channels::Channel;
use crate::error::{RelayError, SessionFault};
use crate::locks::LockTable;
use crate::moisture::MoistureProbe;
use crate::notify::Notifier;
use crate::relay::{Level, Relay};
use crate::sessions::{SessionRegistry, Signal};
use crate::state::SharedState;

/// Everything a session touches. Shared by the dispatcher and every
/// running session.
pub struct SessionContext {
    pub relay: Arc<dyn Relay>,
    pub probe: Option<Arc<dyn MoistureProbe>>,
    pub notifier: Arc<dyn Notifier>,
    pub locks: LockTable,
    pub sessions: SessionRegistry,
    pub state: SharedState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Acquiring,
    On,
    WaitingForStop,
    Off,
    Done,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Ran for the full duration.
    Completed,
    /// Stopped early by an `off` or `shutdown`.
    Cancelled,
    /// Moisture gate said the soil is wet enough.
    Skipped { reading: f64 },
    Failed(SessionFault),
}

#[derive(Debug)]
pub struct SessionReport {
    pub channel: String,
    pub outcome: Outcome,
    pub phases: Vec<Phase>,
    pub elapsed: Duration,
}

// ---------------------------------------------------------------------------
// Exit guard
// ---------------------------------------------------------------------------

struct ExitGuard {
    ctx: Arc<SessionContext>,
    channel: String,
    pin: u8,
    signal: Signal,
    pin_held: bool,
}

impl ExitGuard {
    /// Drive the relay off and free the pin lock, if this session holds it.
    fn release_pin(&mut self) -> Result<(), RelayError> {
        if !self.pin_held {
            return Ok(());
        }
        self.pin_held = false;

        let off = self.ctx.relay.set_output(self.pin, Level::Off);
        if let Err(e) = &off {
            tracing::error!(channel = %self.channel, pin = self.pin, "failed to drive relay off: {e}");
        }
        if let Err(e) = self.ctx.locks.release(self.pin) {
            tracing::warn!(channel = %self.channel, "pin release: {e}");
        }
        off
    }
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        if self.pin_held {
            tracing::warn!(
                channel = %self.channel,
                pin = self.pin,
                cancelled = self.signal.is_set(),
                "session ended before reaching off, forcing relay off"
            );
            let _ = self.release_pin();
        }
        self.ctx.sessions.finish(&self.channel, &self.signal);
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

pub struct Session {
    channel: Channel,
    signal: Signal,
    ctx: Arc<SessionContext>,
    started_at: Instant,
    phases: Vec<Phase>,
}

impl Session {
    /// `signal` must come from `ctx.sessions.begin(&channel.name)`.
    pub fn new(channel: Channel, signal: Signal, ctx: Arc<SessionContext>) -> Self {
        Self {
            channel,
            signal,
            ctx,
            started_at: Instant::now(),
            phases: vec![Phase::Idle],
        }
    }

    pub async fn run(mut self) -> SessionReport {
        let mut guard = ExitGuard {
            ctx: Arc::clone(&self.ctx),
            channel: self.channel.name.clone(),
            pin: self.channel.pin,
            signal: self.signal.clone(),
            pin_held: false,
        };

        let outcome = self.cycle(&mut guard).await;
        drop(guard);
        self.enter(Phase::Done);

        self.report(&outcome).await;

        SessionReport {
            channel: self.channel.name,
            outcome,
            phases: self.phases,
            elapsed: self.started_at.elapsed(),
        }
    }

    async fn cycle(&mut self, guard: &mut ExitGuard) -> Outcome {
        let pin = self.channel.pin;
        self.enter(Phase::Acquiring);

        if let Some(reading) = self.gate_reading() {
            return Outcome::Skipped { reading };
        }

        if let Err(e) = self.ctx.locks.acquire(pin).await {
            self.enter(Phase::Error);
            return Outcome::Failed(e.into());
        }
        guard.pin_held = true;

        if let Err(e) = self.ctx.relay.set_output(pin, Level::On) {
            tracing::error!(channel = %self.channel.name, pin, "failed to drive relay on: {e}");
            self.enter(Phase::Error);
            self.enter(Phase::Off);
            // The pin may be in any state after a driver fault.
            let _ = guard.release_pin();
            return Outcome::Failed(e.into());
        }
        self.enter(Phase::On);
        self.announce_on().await;

        self.enter(Phase::WaitingForStop);
        let cancelled = self.signal.wait(Some(self.channel.duration)).await;

        self.enter(Phase::Off);
        match guard.release_pin() {
            Err(e) => Outcome::Failed(e.into()),
            Ok(()) if cancelled => Outcome::Cancelled,
            Ok(()) => Outcome::Completed,
        }
    }

    /// Reading that stops this cycle, if the moisture gate applies.
    /// A missing or failing sensor counts as dry.
    fn gate_reading(&self) -> Option<f64> {
        let gate = self.channel.gate?;
        let Some(probe) = &self.ctx.probe else {
            tracing::warn!(channel = %self.channel.name, "no moisture probe attached, watering anyway");
            return None;
        };

        match probe.read(gate.input) {
            Ok(reading) if reading > gate.threshold => Some(reading),
            Ok(reading) => {
                tracing::debug!(
                    channel = %self.channel.name,
                    reading,
                    threshold = gate.threshold,
                    "moisture below threshold"
                );
                None
            }
            Err(e) => {
                tracing::warn!(channel = %self.channel.name, "{e}; watering anyway");
                None
            }
        }
    }

    fn enter(&mut self, phase: Phase) {
        tracing::debug!(channel = %self.channel.name, ?phase, "session phase");
        self.phases.push(phase);
    }

    async fn announce_on(&self) {
        let name = &self.channel.name;
        tracing::info!(
            channel = %name,
            plant = %self.channel.plant,
            pin = self.channel.pin,
            duration_sec = self.channel.duration.as_secs(),
            "watering started"
        );
        self.ctx.state.write().await.record_output(name, true);
        self.ctx.notifier.publish_status(name, Level::On);
        self.ctx.notifier.notify(&format!(
            "{} ({name}): watering for {}s",
            self.channel.plant,
            self.channel.duration.as_secs()
        ));
    }

    async fn report(&self, outcome: &Outcome) {
        let name = &self.channel.name;
        let plant = &self.channel.plant;
        let secs = self.started_at.elapsed().as_secs();

        match outcome {
            Outcome::Skipped { reading } => {
                let threshold = self.channel.gate.map(|g| g.threshold).unwrap_or_default();
                let text = format!(
                    "{plant} ({name}): skipped, moisture {reading:.1} above threshold {threshold:.1}"
                );
                tracing::info!(channel = %name, reading, threshold, "watering skipped");
                self.ctx.state.write().await.record_skip(text.clone());
                self.ctx.notifier.notify(&text);
            }
            Outcome::Completed | Outcome::Cancelled => {
                let how = if *outcome == Outcome::Cancelled {
                    "stopped"
                } else {
                    "finished"
                };
                tracing::info!(channel = %name, elapsed_sec = secs, "watering {how}");
                self.ctx.state.write().await.record_output(name, false);
                self.ctx.notifier.publish_status(name, Level::Off);
                self.ctx
                    .notifier
                    .notify(&format!("{plant} ({name}): watering {how} after {secs}s"));
            }
            Outcome::Failed(fault) => {
                tracing::error!(channel = %name, "watering aborted: {fault}");
                self.ctx
                    .state
                    .write()
                    .await
                    .record_error(format!("{name}: watering aborted: {fault}"));
                self.ctx
                    .notifier
                    .notify(&format!("{plant} ({name}): watering aborted: {fault}"));
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LockError;
    use crate::testing::{channel, gated, Harness};

    fn session(h: &Harness, channel: Channel) -> Session {
        let signal = h.ctx.sessions.begin(&channel.name).unwrap();
        Session::new(channel, signal, Arc::clone(&h.ctx))
    }

    #[tokio::test(start_paused = true)]
    async fn full_cycle_runs_for_duration() {
        let h = Harness::new(vec![channel("in01", 5, 10)]);
        let start = Instant::now();

        let report = session(&h, channel("in01", 5, 10)).run().await;

        assert_eq!(report.outcome, Outcome::Completed);
        assert_eq!(
            report.phases,
            vec![
                Phase::Idle,
                Phase::Acquiring,
                Phase::On,
                Phase::WaitingForStop,
                Phase::Off,
                Phase::Done
            ]
        );
        let times = h.relay.times(5, start);
        assert_eq!(times.len(), 2);
        assert_eq!(times[0].0, Level::On);
        assert!(times[0].1 < Duration::from_millis(50));
        assert_eq!(times[1].0, Level::Off);
        assert!(times[1].1 >= Duration::from_secs(10));
        assert!(times[1].1 < Duration::from_millis(10_050));

        assert!(!h.ctx.locks.is_held(5));
        assert!(!h.ctx.sessions.is_running("in01"));
    }

    #[tokio::test(start_paused = true)]
    async fn wet_soil_skips_without_touching_relay() {
        let h = Harness::new(vec![gated("in01", 5, 10, 450.0)]);
        h.probe.set(Some(460.0));

        let report = session(&h, gated("in01", 5, 10, 450.0)).run().await;

        assert_eq!(report.outcome, Outcome::Skipped { reading: 460.0 });
        assert_eq!(
            report.phases,
            vec![Phase::Idle, Phase::Acquiring, Phase::Done]
        );
        assert!(h.relay.history().is_empty());
        assert!(!h.ctx.locks.is_held(5));
        assert!(!h.ctx.sessions.is_running("in01"));
        assert!(h.notifier.texts()[0].contains("skipped, moisture 460.0 above threshold 450.0"));
    }

    #[tokio::test(start_paused = true)]
    async fn dry_soil_waters() {
        let h = Harness::new(vec![gated("in01", 5, 10, 450.0)]);
        h.probe.set(Some(300.0));

        let report = session(&h, gated("in01", 5, 10, 450.0)).run().await;

        assert_eq!(report.outcome, Outcome::Completed);
        assert!(report.phases.contains(&Phase::On));
        assert_eq!(h.relay.levels(5), vec![Level::On, Level::Off]);
    }

    #[tokio::test(start_paused = true)]
    async fn reading_equal_to_threshold_waters() {
        let h = Harness::new(vec![gated("in01", 5, 1, 450.0)]);
        h.probe.set(Some(450.0));

        let report = session(&h, gated("in01", 5, 1, 450.0)).run().await;

        assert_eq!(report.outcome, Outcome::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn sensor_failure_counts_as_dry() {
        let h = Harness::new(vec![gated("in01", 5, 10, 450.0)]);
        h.probe.set(None);

        let report = session(&h, gated("in01", 5, 10, 450.0)).run().await;

        assert_eq!(report.outcome, Outcome::Completed);
        assert_eq!(h.relay.levels(5), vec![Level::On, Level::Off]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_early() {
        let h = Harness::new(vec![channel("in01", 5, 10)]);
        let start = Instant::now();
        let task = tokio::spawn(session(&h, channel("in01", 5, 10)).run());

        tokio::time::sleep(Duration::from_secs(3)).await;
        h.ctx.sessions.cancel("in01").unwrap();
        let report = task.await.unwrap();

        assert_eq!(report.outcome, Outcome::Cancelled);
        let times = h.relay.times(5, start);
        assert_eq!(times[1].0, Level::Off);
        assert!(times[1].1 >= Duration::from_secs(3));
        assert!(times[1].1 < Duration::from_millis(3_050));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_right_after_on_still_turns_off() {
        let h = Harness::new(vec![channel("in01", 5, 10)]);
        let signal = h.ctx.sessions.begin("in01").unwrap();
        // Signal already set before the session observes it.
        signal.set();

        let report = Session::new(channel("in01", 5, 10), signal, Arc::clone(&h.ctx))
            .run()
            .await;

        assert_eq!(report.outcome, Outcome::Cancelled);
        assert_eq!(h.relay.levels(5), vec![Level::On, Level::Off]);
        assert!(!h.ctx.locks.is_held(5));
    }

    #[tokio::test(start_paused = true)]
    async fn relay_fault_on_still_drives_off() {
        let h = Harness::new(vec![channel("in01", 5, 10)]);
        h.relay.fail(5, Level::On);

        let report = session(&h, channel("in01", 5, 10)).run().await;

        assert!(matches!(
            report.outcome,
            Outcome::Failed(SessionFault::Relay(RelayError::Driver { pin: 5, .. }))
        ));
        assert_eq!(
            report.phases,
            vec![
                Phase::Idle,
                Phase::Acquiring,
                Phase::Error,
                Phase::Off,
                Phase::Done
            ]
        );
        assert_eq!(h.relay.levels(5), vec![Level::Off]);
        assert!(!h.ctx.locks.is_held(5));
        assert!(!h.ctx.sessions.is_running("in01"));
        assert_eq!(
            h.state
                .read()
                .await
                .events_of(crate::state::EventKind::Error)
                .len(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn relay_fault_off_is_reported_and_lock_released() {
        let h = Harness::new(vec![channel("in01", 5, 1)]);
        h.relay.fail(5, Level::Off);

        let report = session(&h, channel("in01", 5, 1)).run().await;

        assert!(matches!(report.outcome, Outcome::Failed(_)));
        assert!(!h.ctx.locks.is_held(5));
        assert_eq!(h.ctx.locks.release(5), Err(LockError::AlreadyFree(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn aborted_task_forces_relay_off() {
        let h = Harness::new(vec![channel("in01", 5, 600)]);
        let task = tokio::spawn(session(&h, channel("in01", 5, 600)).run());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.relay.level(5), Some(Level::On));

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        assert_eq!(h.relay.levels(5), vec![Level::On, Level::Off]);
        assert!(!h.ctx.locks.is_held(5));
        assert!(!h.ctx.sessions.is_running("in01"));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_session_does_not_remove_successor_entry() {
        let h = Harness::new(vec![channel("in01", 5, 10)]);
        let first = tokio::spawn(session(&h, channel("in01", 5, 10)).run());
        tokio::time::sleep(Duration::from_secs(1)).await;

        // off, then an immediate on: the registry is free before the first
        // session has driven the pin off.
        h.ctx.sessions.cancel("in01").unwrap();
        let second = tokio::spawn(session(&h, channel("in01", 5, 10)).run());

        assert_eq!(first.await.unwrap().outcome, Outcome::Cancelled);
        assert!(h.ctx.sessions.is_running("in01"));

        assert_eq!(second.await.unwrap().outcome, Outcome::Completed);
        assert_eq!(
            h.relay.levels(5),
            vec![Level::On, Level::Off, Level::On, Level::Off]
        );
        assert!(!h.relay.double_on(5));
    }
}
