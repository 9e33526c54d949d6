//! Relay control via GPIO. The `gpio` feature gates the real rppal driver;
//! without it, a mock implementation logs state changes.

use anyhow::Result;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

use crate::error::RelayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Level {
    On,
    Off,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::On => write!(f, "on"),
            Self::Off => write!(f, "off"),
        }
    }
}

/// Anything that can drive a relay pin to a logical level.
pub trait Relay: Send + Sync {
    fn set_output(&self, pin: u8, level: Level) -> Result<(), RelayError>;
}

/// GPIO level that switches a relay to `level`. Many relay boards are
/// active-low: LOW = ON, HIGH = OFF.
fn drives_high(level: Level, active_low: bool) -> bool {
    match level {
        Level::On => !active_low,
        Level::Off => active_low,
    }
}

// ---------------------------------------------------------------------------
// Real GPIO relay board (requires rppal and Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub struct RelayBoard {
    pins: Mutex<HashMap<u8, OutputPin>>,
    active_low: bool,
}

#[cfg(feature = "gpio")]
impl RelayBoard {
    pub fn new(pins: &[u8], active_low: bool) -> Result<Self> {
        let gpio = Gpio::new()?;
        let mut outputs = HashMap::new();

        for &pin_num in pins {
            let mut pin = gpio.get(pin_num)?.into_output();

            // Fail-safe: ensure "OFF" at startup
            if drives_high(Level::Off, active_low) {
                pin.set_high();
            } else {
                pin.set_low();
            }

            outputs.insert(pin_num, pin);
        }

        tracing::info!(pins = ?pins, active_low, "relay board initialised");
        Ok(Self {
            pins: Mutex::new(outputs),
            active_low,
        })
    }
}

#[cfg(feature = "gpio")]
impl Relay for RelayBoard {
    fn set_output(&self, pin: u8, level: Level) -> Result<(), RelayError> {
        let mut pins = self.pins.lock().unwrap_or_else(PoisonError::into_inner);
        let output = pins.get_mut(&pin).ok_or(RelayError::UnknownPin(pin))?;
        if drives_high(level, self.active_low) {
            output.set_high();
        } else {
            output.set_low();
        }
        tracing::info!(pin, %level, "relay set");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Mock relay board (no hardware, logs state)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub struct RelayBoard {
    levels: Mutex<HashMap<u8, Level>>,
    active_low: bool,
}

#[cfg(not(feature = "gpio"))]
impl RelayBoard {
    pub fn new(pins: &[u8], active_low: bool) -> Result<Self> {
        let mut levels = HashMap::new();
        for &pin in pins {
            tracing::info!(pin, "[mock-gpio] registered relay (not wired)");
            levels.insert(pin, Level::Off);
        }
        tracing::info!(active_low, "[mock-gpio] relay board initialised (no hardware)");
        Ok(Self {
            levels: Mutex::new(levels),
            active_low,
        })
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn level(&self, pin: u8) -> Option<Level> {
        self.levels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&pin)
            .copied()
    }
}

#[cfg(not(feature = "gpio"))]
impl Relay for RelayBoard {
    fn set_output(&self, pin: u8, level: Level) -> Result<(), RelayError> {
        let mut levels = self.levels.lock().unwrap_or_else(PoisonError::into_inner);
        let state = levels.get_mut(&pin).ok_or(RelayError::UnknownPin(pin))?;
        *state = level;
        tracing::info!(
            pin,
            %level,
            gpio_high = drives_high(level, self.active_low),
            "[mock-gpio] relay set"
        );
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
