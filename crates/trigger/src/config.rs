//! Just enough of the pump's `config.toml` to know the base topic and the
//! channel names. Everything else in the file is ignored.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;

fn default_base_topic() -> String {
    "garden/watering".to_string()
}

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_base_topic")]
    base_topic: String,
    #[serde(default)]
    channels: Vec<ChannelEntry>,
}

#[derive(Debug, Deserialize)]
struct ChannelEntry {
    name: String,
}

impl Config {
    pub fn base_topic(&self) -> &str {
        self.base_topic.trim_matches('/')
    }

    /// Configured channel names, in file order, without duplicates.
    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for c in &self.channels {
            if !names.contains(&c.name) {
                names.push(c.name.clone());
            }
        }
        names
    }

    /// Channels to trigger: the `CHANNELS` selection if given, else all.
    /// Every selected name must be configured.
    pub fn select(&self, selection: Option<&str>) -> Result<Vec<String>> {
        let known = self.channel_names();
        let Some(selection) = selection.map(str::trim).filter(|s| !s.is_empty()) else {
            return Ok(known);
        };

        let mut picked = Vec::new();
        let mut unknown = Vec::new();
        for name in selection.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            if !known.iter().any(|k| k == name) {
                unknown.push(name.to_string());
            } else if !picked.iter().any(|p| p == name) {
                picked.push(name.to_string());
            }
        }

        if !unknown.is_empty() {
            bail!("unknown channel(s) in CHANNELS: {}", unknown.join(", "));
        }
        Ok(picked)
    }
}

pub fn command_topic(base: &str, channel: &str) -> String {
    format!("{base}/{channel}")
}

pub fn load(path: &str) -> Result<Config> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("failed to read config file: {path}"))?;
    parse(&contents).with_context(|| format!("invalid config file: {path}"))
}

pub fn parse(contents: &str) -> Result<Config> {
    let cfg: Config = toml::from_str(contents)?;
    if cfg.base_topic().is_empty() {
        bail!("base_topic is empty");
    }
    Ok(cfg)
}
