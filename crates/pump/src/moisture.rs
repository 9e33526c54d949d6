//! MCP3008 10-bit ADC driver over SPI for soil moisture sensing, plus a
//! static probe for running without hardware.
//!
//! Each reading is the mean of [`SAMPLES`] single-ended conversions.

use std::sync::{Mutex, PoisonError};

#[cfg(feature = "adc")]
use rppal::spi::{Bus, Mode, SlaveSelect, Spi};

use crate::error::SensorError;

/// Conversions averaged into one reading.
#[cfg_attr(not(feature = "adc"), allow(dead_code))]
const SAMPLES: usize = 10;

/// 1.35 MHz is the MCP3008's maximum clock at 3.3 V.
#[cfg_attr(not(feature = "adc"), allow(dead_code))]
const SPI_CLOCK_HZ: u32 = 1_350_000;

/// Anything that can produce a moisture reading for an ADC input.
pub trait MoistureProbe: Send + Sync {
    fn read(&self, input: u8) -> Result<f64, SensorError>;
}

// ── Frame encoding ──────────────────────────────────────────────────────────
//
// Request (3 bytes, MSB first):
//   [0]  0000_0001       start bit
//   [1]  1ddd_0000       SGL/DIFF=1 (single-ended), D2..D0 = input
//   [2]  0000_0000       clocks out the low byte
// Response: null bit + 10 result bits in the low 2 bits of [1] and all of [2].

#[cfg_attr(not(feature = "adc"), allow(dead_code))]
fn request_frame(input: u8) -> [u8; 3] {
    [0x01, (0x08 | (input & 0x07)) << 4, 0x00]
}

#[cfg_attr(not(feature = "adc"), allow(dead_code))]
fn decode_frame(rx: &[u8; 3]) -> u16 {
    (u16::from(rx[1] & 0x03) << 8) | u16::from(rx[2])
}

#[cfg_attr(not(feature = "adc"), allow(dead_code))]
fn mean(samples: &[u16]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().map(|&s| f64::from(s)).sum::<f64>() / samples.len() as f64
}

// ── Driver ──────────────────────────────────────────────────────────────────

/// MCP3008 driver backed by `rppal::spi` on SPI0 / CE0.
#[cfg(feature = "adc")]
pub struct Mcp3008 {
    spi: Mutex<Spi>,
}

#[cfg(feature = "adc")]
impl Mcp3008 {
    pub fn new() -> anyhow::Result<Self> {
        let spi = Spi::new(Bus::Spi0, SlaveSelect::Ss0, SPI_CLOCK_HZ, Mode::Mode0)?;
        tracing::info!(clock_hz = SPI_CLOCK_HZ, "mcp3008 initialised");
        Ok(Self {
            spi: Mutex::new(spi),
        })
    }

    fn sample(spi: &Spi, input: u8) -> Result<u16, SensorError> {
        let mut rx = [0u8; 3];
        spi.transfer(&mut rx, &request_frame(input))
            .map_err(|e| SensorError::Unavailable {
                input,
                reason: e.to_string(),
            })?;
        Ok(decode_frame(&rx))
    }
}

#[cfg(feature = "adc")]
impl MoistureProbe for Mcp3008 {
    fn read(&self, input: u8) -> Result<f64, SensorError> {
        let spi = self.spi.lock().unwrap_or_else(PoisonError::into_inner);
        let mut samples = Vec::with_capacity(SAMPLES);
        for _ in 0..SAMPLES {
            samples.push(Self::sample(&spi, input)?);
        }
        let value = mean(&samples);
        tracing::debug!(input, value = format_args!("{value:.2}"), "moisture read");
        Ok(value)
    }
}

// ── Static probe ────────────────────────────────────────────────────────────

/// Reports a fixed value for every input, or "unavailable" when unset.
/// Used when the crate is built without the `adc` feature.
#[cfg_attr(feature = "adc", allow(dead_code))]
pub struct StaticProbe {
    value: Mutex<Option<f64>>,
}

#[cfg_attr(feature = "adc", allow(dead_code))]
impl StaticProbe {
    pub fn new(value: Option<f64>) -> Self {
        Self {
            value: Mutex::new(value),
        }
    }

    pub fn set(&self, value: Option<f64>) {
        *self.value.lock().unwrap_or_else(PoisonError::into_inner) = value;
    }
}

impl MoistureProbe for StaticProbe {
    fn read(&self, input: u8) -> Result<f64, SensorError> {
        let value = *self.value.lock().unwrap_or_else(PoisonError::into_inner);
        value.ok_or_else(|| SensorError::Unavailable {
            input,
            reason: "no moisture hardware".to_string(),
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
