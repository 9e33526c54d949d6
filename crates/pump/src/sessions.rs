//! Cancellation registry: the single source of truth for "is channel X
//! currently watering". Each entry holds the cancellation [`Signal`] of the
//! channel's running session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::SessionError;

/// One-shot, multiply-observable stop request for a watering session.
#[derive(Debug, Clone)]
pub struct Signal {
    id: u64,
    token: CancellationToken,
}

impl Signal {
    fn new(id: u64) -> Self {
        Self {
            id,
            token: CancellationToken::new(),
        }
    }

    pub fn set(&self) {
        self.token.cancel();
    }

    pub fn is_set(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait until the signal is set or `timeout` elapses. Returns `true` if
    /// the signal was set.
    pub async fn wait(&self, timeout: Option<Duration>) -> bool {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, self.token.cancelled())
                .await
                .is_ok(),
            None => {
                self.token.cancelled().await;
                true
            }
        }
    }

    pub fn same_session(&self, other: &Signal) -> bool {
        self.id == other.id
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    active: Mutex<HashMap<String, Signal>>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `channel` for a new session.
    pub fn begin(&self, channel: &str) -> Result<Signal, SessionError> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.contains_key(channel) {
            return Err(SessionError::AlreadyRunning(channel.to_string()));
        }
        let signal = Signal::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        active.insert(channel.to_string(), signal.clone());
        Ok(signal)
    }

    /// Ask the running session to stop and forget it immediately, so a new
    /// `begin` can succeed before the old session has finished unwinding.
    pub fn cancel(&self, channel: &str) -> Result<(), SessionError> {
        let signal = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(channel)
            .ok_or_else(|| SessionError::NotRunning(channel.to_string()))?;
        signal.set();
        Ok(())
    }

    /// Cancel every running session. Returns the affected channels, sorted.
    pub fn cancel_all(&self) -> Vec<String> {
        let drained: Vec<(String, Signal)> = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();

        let mut channels = Vec::with_capacity(drained.len());
        for (channel, signal) in drained {
            signal.set();
            channels.push(channel);
        }
        channels.sort();
        channels
    }

    /// Remove `channel`'s entry if it still belongs to `signal`'s session.
    /// Returns `false` when it was already cancelled (or replaced).
    pub fn finish(&self, channel: &str, signal: &Signal) -> bool {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        match active.get(channel) {
            Some(current) if current.same_session(signal) => {
                active.remove(channel);
                true
            }
            _ => false,
        }
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn is_running(&self, channel: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(channel)
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn active_channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        channels.sort();
        channels
    }
}
