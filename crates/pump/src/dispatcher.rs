//! Command dispatcher: turns `(channel, command)` pairs into watering
//! sessions. Never waits on a session, except for the bounded drain during
//! `shutdown`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::task::TaskTracker;

use crate::channels::ChannelRegistry;
use crate::error::CommandError;
use crate::relay::Level;
use crate::session::{Outcome, Session, SessionContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    On,
    Off,
    Shutdown,
}

impl Command {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "on" => Some(Self::On),
            "off" => Some(Self::Off),
            "shutdown" => Some(Self::Shutdown),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    /// A session was spawned for the channel.
    Started,
    /// The channel's session was asked to stop.
    Stopping,
    /// Every session was cancelled and drained; these were running.
    ShutDown { cancelled: Vec<String> },
}

pub struct Dispatcher {
    channels: ChannelRegistry,
    ctx: Arc<SessionContext>,
    tracker: TaskTracker,
    drain: Duration,
    stopped: AtomicBool,
}

impl Dispatcher {
    pub fn new(channels: ChannelRegistry, ctx: Arc<SessionContext>, drain: Duration) -> Self {
        Self {
            channels,
            ctx,
            tracker: TaskTracker::new(),
            drain,
            stopped: AtomicBool::new(false),
        }
    }

    /// Handle one inbound command. Refusals are logged as warnings, recorded
    /// on the status board, and returned.
    pub async fn on_command(&self, channel: &str, command: &str) -> Result<Dispatched, CommandError> {
        let result = self.dispatch(channel, command).await;

        match &result {
            Ok(_) => {
                self.ctx.state.write().await.record_command(channel, command);
            }
            Err(e) => {
                tracing::warn!(%channel, %command, "command refused: {e}");
                self.ctx
                    .state
                    .write()
                    .await
                    .record_warning(format!("{channel} {command}: {e}"));
            }
        }

        result
    }

    async fn dispatch(&self, channel: &str, command: &str) -> Result<Dispatched, CommandError> {
        if self.is_stopped() {
            return Err(CommandError::ShuttingDown(channel.to_string()));
        }

        match Command::parse(command) {
            Some(Command::On) => self.start(channel).await,
            Some(Command::Off) => {
                let name = &self.channels.resolve(channel)?.name;
                self.ctx.sessions.cancel(name)?;
                tracing::info!(%channel, "stop requested");
                Ok(Dispatched::Stopping)
            }
            Some(Command::Shutdown) => Ok(self.shutdown().await),
            None => Err(CommandError::UnknownCommand(command.to_string())),
        }
    }

    async fn start(&self, channel: &str) -> Result<Dispatched, CommandError> {
        let resolved = self.channels.resolve(channel)?.clone();

        let sharers = self.channels.pin_sharers(resolved.pin);
        if sharers.len() > 1 {
            let detail = format!(
                "pin {} is shared by channels {}; hazardous config, watering '{}' only",
                resolved.pin,
                sharers.join(", "),
                resolved.name
            );
            tracing::warn!(%channel, "{detail}");
            self.ctx.state.write().await.record_warning(detail);
        }

        let signal = self.ctx.sessions.begin(&resolved.name)?;
        let session = Session::new(resolved, signal, Arc::clone(&self.ctx));

        self.tracker.spawn(async move {
            let report = session.run().await;
            tracing::debug!(
                channel = %report.channel,
                outcome = ?report.outcome,
                phases = ?report.phases,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "session done"
            );
            if let Outcome::Failed(fault) = &report.outcome {
                tracing::error!(channel = %report.channel, "session failed: {fault}");
            }
        });

        Ok(Dispatched::Started)
    }

    /// Cancel every session, wait (bounded) for them to finish, then drive
    /// every configured pin off. Later commands are refused.
    pub async fn shutdown(&self) -> Dispatched {
        self.stopped.store(true, Ordering::SeqCst);

        let cancelled = self.ctx.sessions.cancel_all();
        tracing::info!(?cancelled, "shutdown: cancelling sessions");

        self.tracker.close();
        if tokio::time::timeout(self.drain, self.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                drain_sec = self.drain.as_secs(),
                remaining = self.tracker.len(),
                "shutdown: sessions still running after drain"
            );
        }

        self.shutdown_all();
        self.ctx
            .state
            .write()
            .await
            .record_system(format!("shutdown, cancelled {} session(s)", cancelled.len()));

        Dispatched::ShutDown { cancelled }
    }

    /// Synchronously drive every configured pin off. Safe to call at any
    /// time, including after a fatal error.
    pub fn shutdown_all(&self) {
        for pin in self.channels.pins() {
            if let Err(e) = self.ctx.relay.set_output(pin, Level::Off) {
                tracing::error!(pin, "shutdown: failed to drive relay off: {e}");
            }
        }
        tracing::info!("all relays off");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
