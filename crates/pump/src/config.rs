//! TOML config file loading and validation for the pump channels.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_base_topic")]
    pub base_topic: String,
    #[serde(default = "default_shutdown_drain_sec")]
    pub shutdown_drain_sec: u64,
    #[serde(default)]
    pub channels: Vec<ChannelEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelEntry {
    pub name: String,
    #[serde(default)]
    pub plant: String,
    pub pin: i64,
    pub duration_sec: i64,
    #[serde(default)]
    pub check_moisture: bool,
    pub moisture_pin: Option<i64>,
    pub moisture_threshold: Option<f64>,
}

fn default_base_topic() -> String {
    "garden/watering".to_string()
}

fn default_shutdown_drain_sec() -> u64 {
    5
}

// ---------------------------------------------------------------------------
// GPIO / ADC whitelists
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: &[i64] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

/// The MCP3008 has eight single-ended inputs.
const MCP3008_MAX_INPUT: i64 = 7;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    ///
    /// Duplicate names and shared pins are not rejected here; see
    /// [`Config::hazards`].
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.base_topic().is_empty() {
            errors.push("base_topic is empty".to_string());
        } else if self.base_topic.contains(['+', '#']) {
            errors.push(format!(
                "base_topic '{}' must not contain MQTT wildcards",
                self.base_topic
            ));
        }

        if self.shutdown_drain_sec == 0 {
            errors.push("shutdown_drain_sec must be positive".to_string());
        }

        self.validate_channels(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_channels(&self, errors: &mut Vec<String>) {
        for (i, c) in self.channels.iter().enumerate() {
            let ctx = || {
                if c.name.is_empty() {
                    format!("channels[{i}]")
                } else {
                    format!("channel '{}'", c.name)
                }
            };

            if c.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            } else if c.name.contains(['/', '+', '#']) {
                errors.push(format!(
                    "{}: name must be a single topic segment",
                    ctx()
                ));
            }

            if c.duration_sec <= 0 {
                errors.push(format!(
                    "{}: duration_sec must be positive, got {}",
                    ctx(),
                    c.duration_sec
                ));
            }

            if !VALID_GPIO_PINS.contains(&c.pin) {
                errors.push(format!(
                    "{}: pin {} is not a valid BCM GPIO pin (allowed: 2-27)",
                    ctx(),
                    c.pin
                ));
            }

            // ── Moisture gate ───────────────────────────────────
            if let Some(input) = c.moisture_pin {
                if !(0..=MCP3008_MAX_INPUT).contains(&input) {
                    errors.push(format!(
                        "{}: moisture_pin {input} out of MCP3008 range [0, {MCP3008_MAX_INPUT}]",
                        ctx()
                    ));
                }
            }
            if let Some(threshold) = c.moisture_threshold {
                if !threshold.is_finite() || threshold < 0.0 {
                    errors.push(format!(
                        "{}: moisture_threshold {threshold} must be a non-negative number",
                        ctx()
                    ));
                }
            }
            if c.check_moisture {
                if c.moisture_pin.is_none() {
                    errors.push(format!(
                        "{}: check_moisture requires moisture_pin",
                        ctx()
                    ));
                }
                if c.moisture_threshold.is_none() {
                    errors.push(format!(
                        "{}: check_moisture requires moisture_threshold",
                        ctx()
                    ));
                }
            }
        }
    }

    /// Hazardous but loadable configuration: channel names defined more than
    /// once, and relay pins driven by more than one channel.
    pub fn hazards(&self) -> Vec<String> {
        let mut hazards = Vec::new();

        let mut seen_names: HashSet<&str> = HashSet::new();
        let mut reported: HashSet<&str> = HashSet::new();
        for c in &self.channels {
            if !seen_names.insert(&c.name) && reported.insert(&c.name) {
                hazards.push(format!(
                    "channel '{}' is defined more than once; commands for it will be refused",
                    c.name
                ));
            }
        }

        let mut by_pin: HashMap<i64, Vec<&str>> = HashMap::new();
        for c in &self.channels {
            by_pin.entry(c.pin).or_default().push(&c.name);
        }
        let mut shared: Vec<_> = by_pin.into_iter().filter(|(_, v)| v.len() > 1).collect();
        shared.sort_by_key(|(pin, _)| *pin);
        for (pin, names) in shared {
            hazards.push(format!(
                "pin {pin} is shared by channels {}; they will be serialized on one relay",
                names.join(", ")
            ));
        }

        hazards
    }

    /// Base topic without surrounding slashes.
    pub fn base_topic(&self) -> &str {
        self.base_topic.trim_matches('/')
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    parse(&contents).with_context(|| format!("invalid config: {path}"))
}

/// Parse and validate config text, logging any hazards found.
pub fn parse(contents: &str) -> Result<Config> {
    let config: Config = toml::from_str(contents).context("failed to parse config")?;
    config.validate()?;

    for hazard in config.hazards() {
        tracing::warn!("hazardous config: {hazard}");
    }

    tracing::info!(
        channels = config.channels.len(),
        base_topic = config.base_topic(),
        "config loaded"
    );

    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
