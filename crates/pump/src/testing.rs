//! Test doubles for the hardware and notification collaborators.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use crate::channels::{Channel, ChannelRegistry, MoistureGate};
use crate::dispatcher::Dispatcher;
use crate::error::RelayError;
use crate::locks::LockTable;
use crate::moisture::StaticProbe;
use crate::notify::Notifier;
use crate::relay::{Level, Relay};
use crate::session::SessionContext;
use crate::sessions::SessionRegistry;
use crate::state::{SharedState, SystemState};

#[derive(Debug, Clone, Copy)]
pub(crate) struct Transition {
    pub pin: u8,
    pub level: Level,
    pub at: Instant,
}

/// Records every successful output change; can be told to fail.
#[derive(Default)]
pub(crate) struct RecordingRelay {
    history: Mutex<Vec<Transition>>,
    faults: Mutex<HashSet<(u8, Level)>>,
}

impl RecordingRelay {
    pub fn fail(&self, pin: u8, level: Level) {
        self.faults.lock().unwrap().insert((pin, level));
    }

    pub fn history(&self) -> Vec<Transition> {
        self.history.lock().unwrap().clone()
    }

    pub fn levels(&self, pin: u8) -> Vec<Level> {
        self.history()
            .into_iter()
            .filter(|t| t.pin == pin)
            .map(|t| t.level)
            .collect()
    }

    pub fn level(&self, pin: u8) -> Option<Level> {
        self.levels(pin).last().copied()
    }

    pub fn on_count(&self, pin: u8) -> usize {
        self.levels(pin).iter().filter(|l| **l == Level::On).count()
    }

    /// Level changes on `pin` with their offset from `start`.
    pub fn times(&self, pin: u8, start: Instant) -> Vec<(Level, Duration)> {
        self.history()
            .into_iter()
            .filter(|t| t.pin == pin)
            .map(|t| (t.level, t.at.duration_since(start)))
            .collect()
    }

    /// True if `pin` was ever driven on while already on.
    pub fn double_on(&self, pin: u8) -> bool {
        let mut on = false;
        for level in self.levels(pin) {
            match level {
                Level::On if on => return true,
                Level::On => on = true,
                Level::Off => on = false,
            }
        }
        false
    }
}

impl Relay for RecordingRelay {
    fn set_output(&self, pin: u8, level: Level) -> Result<(), RelayError> {
        if self.faults.lock().unwrap().contains(&(pin, level)) {
            return Err(RelayError::Driver {
                pin,
                reason: "injected fault".into(),
            });
        }
        self.history.lock().unwrap().push(Transition {
            pin,
            level,
            at: Instant::now(),
        });
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct RecordingNotifier {
    texts: Mutex<Vec<String>>,
    statuses: Mutex<Vec<(String, Level)>>,
}

impl RecordingNotifier {
    pub fn texts(&self) -> Vec<String> {
        self.texts.lock().unwrap().clone()
    }

    pub fn statuses(&self) -> Vec<(String, Level)> {
        self.statuses.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, text: &str) {
        self.texts.lock().unwrap().push(text.to_string());
    }

    fn publish_status(&self, channel: &str, level: Level) {
        self.statuses
            .lock()
            .unwrap()
            .push((channel.to_string(), level));
    }
}

pub(crate) fn channel(name: &str, pin: u8, secs: u64) -> Channel {
    Channel {
        name: name.into(),
        plant: format!("plant-{name}"),
        pin,
        duration: Duration::from_secs(secs),
        gate: None,
    }
}

pub(crate) fn gated(name: &str, pin: u8, secs: u64, threshold: f64) -> Channel {
    Channel {
        gate: Some(MoistureGate { input: 0, threshold }),
        ..channel(name, pin, secs)
    }
}

/// A dispatcher wired to recording doubles.
pub(crate) struct Harness {
    pub relay: Arc<RecordingRelay>,
    pub probe: Arc<StaticProbe>,
    pub notifier: Arc<RecordingNotifier>,
    pub state: SharedState,
    pub ctx: Arc<SessionContext>,
    pub dispatcher: Dispatcher,
}

impl Harness {
    pub fn new(channels: Vec<Channel>) -> Self {
        let relay = Arc::new(RecordingRelay::default());
        let probe = Arc::new(StaticProbe::new(None));
        let notifier = Arc::new(RecordingNotifier::default());

        let pins: Vec<(String, u8)> = channels.iter().map(|c| (c.name.clone(), c.pin)).collect();
        let state = SystemState::new(&pins).shared();

        let ctx = Arc::new(SessionContext {
            relay: relay.clone(),
            probe: Some(probe.clone()),
            notifier: notifier.clone(),
            locks: LockTable::new(),
            sessions: SessionRegistry::new(),
            state: state.clone(),
        });

        let dispatcher = Dispatcher::new(
            ChannelRegistry::new(channels),
            Arc::clone(&ctx),
            Duration::from_secs(5),
        );

        Self {
            relay,
            probe,
            notifier,
            state,
            ctx,
            dispatcher,
        }
    }
}

/// Let spawned sessions run until they block. Advances the paused clock
/// by one millisecond.
pub(crate) async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
