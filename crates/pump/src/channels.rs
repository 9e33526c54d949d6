//! Channel registry: maps a channel name to the relay pin and watering
//! parameters it controls. Built once from config, read-only afterwards.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

use crate::config::{ChannelEntry, Config};
use crate::error::RegistryError;

/// Skip watering when the moisture reading on `input` is above `threshold`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoistureGate {
    pub input: u8,
    pub threshold: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    pub name: String,
    pub plant: String,
    pub pin: u8,
    pub duration: Duration,
    pub gate: Option<MoistureGate>,
}

impl Channel {
    /// Build a channel from a validated config entry.
    pub fn from_entry(entry: &ChannelEntry) -> Self {
        let plant = if entry.plant.trim().is_empty() {
            entry.name.clone()
        } else {
            entry.plant.clone()
        };

        let gate = match (entry.check_moisture, entry.moisture_pin, entry.moisture_threshold) {
            (true, Some(input), Some(threshold)) => Some(MoistureGate {
                input: input as u8,
                threshold,
            }),
            _ => None,
        };

        Self {
            name: entry.name.clone(),
            plant,
            pin: entry.pin as u8,
            duration: Duration::from_secs(entry.duration_sec.max(1) as u64),
            gate,
        }
    }
}

#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: HashMap<String, Channel>,
    ambiguous: HashSet<String>,
    by_pin: HashMap<u8, Vec<String>>,
}

impl ChannelRegistry {
    pub fn new(channels: impl IntoIterator<Item = Channel>) -> Self {
        let mut registry = Self::default();

        for channel in channels {
            registry
                .by_pin
                .entry(channel.pin)
                .or_default()
                .push(channel.name.clone());

            if registry.channels.contains_key(&channel.name) {
                registry.ambiguous.insert(channel.name.clone());
            } else {
                registry.channels.insert(channel.name.clone(), channel);
            }
        }

        for names in registry.by_pin.values_mut() {
            names.sort();
            names.dedup();
        }

        registry
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.channels.iter().map(Channel::from_entry))
    }

    pub fn resolve(&self, name: &str) -> Result<&Channel, RegistryError> {
        if self.ambiguous.contains(name) {
            return Err(RegistryError::Ambiguous(name.to_string()));
        }
        self.channels
            .get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// Every channel name driving `pin`, sorted.
    pub fn pin_sharers(&self, pin: u8) -> &[String] {
        self.by_pin.get(&pin).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All distinct relay pins, ascending.
    pub fn pins(&self) -> Vec<u8> {
        self.by_pin
            .keys()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, pin: i64) -> ChannelEntry {
        ChannelEntry {
            name: name.into(),
            plant: String::new(),
            pin,
            duration_sec: 10,
            check_moisture: false,
            moisture_pin: None,
            moisture_threshold: None,
        }
    }

    fn channel(name: &str, pin: u8) -> Channel {
        Channel::from_entry(&entry(name, pin as i64))
    }

    #[test]
    fn from_entry_defaults_plant_to_name() {
        let c = channel("in01", 5);
        assert_eq!(c.plant, "in01");
        assert_eq!(c.duration, Duration::from_secs(10));
        assert_eq!(c.gate, None);
    }

    #[test]
    fn from_entry_builds_gate_only_when_enabled() {
        let mut e = entry("in01", 5);
        e.moisture_pin = Some(2);
        e.moisture_threshold = Some(450.0);
        assert_eq!(Channel::from_entry(&e).gate, None);

        e.check_moisture = true;
        assert_eq!(
            Channel::from_entry(&e).gate,
            Some(MoistureGate {
                input: 2,
                threshold: 450.0
            })
        );
    }

    #[test]
    fn resolve_known_channel() {
        let reg = ChannelRegistry::new([channel("in01", 5), channel("in02", 6)]);
        assert_eq!(reg.resolve("in02").unwrap().pin, 6);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn resolve_unknown_channel() {
        let reg = ChannelRegistry::new([channel("in01", 5)]);
        assert_eq!(
            reg.resolve("in09"),
            Err(RegistryError::NotFound("in09".into()))
        );
    }

    #[test]
    fn duplicate_name_is_ambiguous() {
        let reg = ChannelRegistry::new([channel("in01", 5), channel("in01", 6)]);
        assert_eq!(
            reg.resolve("in01"),
            Err(RegistryError::Ambiguous("in01".into()))
        );
    }

    #[test]
    fn shared_pin_lists_all_channels() {
        let reg = ChannelRegistry::new([channel("in02", 5), channel("in01", 5), channel("in03", 6)]);
        assert_eq!(reg.pin_sharers(5), ["in01", "in02"]);
        assert_eq!(reg.pin_sharers(6), ["in03"]);
        assert!(reg.pin_sharers(7).is_empty());
        // Both names still resolve on their own.
        assert!(reg.resolve("in01").is_ok());
        assert!(reg.resolve("in02").is_ok());
    }

    #[test]
    fn pins_are_distinct_and_sorted() {
        let reg = ChannelRegistry::new([channel("a", 13), channel("b", 5), channel("c", 13)]);
        assert_eq!(reg.pins(), vec![5, 13]);
    }
}
