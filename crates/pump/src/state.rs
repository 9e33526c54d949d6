//! In-memory status board for the HTTP status endpoint. Written by the
//! dispatcher and sessions, never read back for decisions.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub channels: HashMap<String, ChannelState>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Serialize)]
pub struct ChannelState {
    pub on: bool,
    pub pin: u8,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_changed: Option<OffsetDateTime>,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Command,
    Relay,
    Skip,
    Warning,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub channels: HashMap<String, ChannelState>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new(channel_to_pin: &[(String, u8)]) -> Self {
        let mut channels = HashMap::new();
        for (name, pin) in channel_to_pin {
            channels.insert(
                name.clone(),
                ChannelState {
                    on: false,
                    pin: *pin,
                    last_changed: None,
                },
            );
        }

        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            channels,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared(self) -> SharedState {
        Arc::new(RwLock::new(self))
    }

    /// Record an accepted command.
    pub fn record_command(&mut self, channel: &str, command: &str) {
        self.push_event(EventKind::Command, format!("{channel}: {command}"));
    }

    /// Record a relay output change for a channel.
    pub fn record_output(&mut self, channel: &str, on: bool) {
        if let Some(state) = self.channels.get_mut(channel) {
            state.on = on;
            state.last_changed = Some(OffsetDateTime::now_utc());
        }

        let state_str = if on { "ON" } else { "OFF" };
        self.push_event(EventKind::Relay, format!("{channel} set {state_str}"));
    }

    /// Record a watering cycle skipped by the moisture gate.
    pub fn record_skip(&mut self, detail: String) {
        self.push_event(EventKind::Skip, detail);
    }

    /// Record a refused command or a hazard.
    pub fn record_warning(&mut self, detail: String) {
        self.push_event(EventKind::Warning, detail);
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Events of one kind, oldest first.
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn events_of(&self, kind: EventKind) -> Vec<&SystemEvent> {
        self.events.iter().filter(|e| e.kind == kind).collect()
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            channels: self.channels.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}
