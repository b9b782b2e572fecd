// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::Path;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

use blkmq::QueueOpts;

/// Configuration of a request queue and the simulated device behind it.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub queue: Queue,

    #[serde(default)]
    pub driver: Driver,
}

/// Shape of the request queue itself.
#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct Queue {
    pub hw_queues: usize,
    pub depth: usize,
    pub reserved: usize,
    pub cpus: usize,

    /// CPUs sharing a cache domain
    pub cache_domain_size: usize,
    pub remote_completion: bool,
    pub blocking: bool,

    /// Request timeout, in milliseconds
    pub timeout_ms: u64,

    /// Name of the I/O scheduler to attach, if any
    pub scheduler: Option<String>,
    pub sched_depth: Option<usize>,
}
impl Default for Queue {
    fn default() -> Self {
        let opts = QueueOpts::default();
        Self {
            hw_queues: opts.nr_hw_queues,
            depth: opts.queue_depth,
            reserved: opts.reserved_tags,
            cpus: opts.nr_cpus,
            cache_domain_size: opts.cache_domain_size,
            remote_completion: opts.remote_completion,
            blocking: opts.blocking,
            timeout_ms: opts.timeout.as_millis() as u64,
            scheduler: None,
            sched_depth: opts.sched_depth,
        }
    }
}
impl Queue {
    pub fn opts(&self) -> QueueOpts {
        QueueOpts {
            nr_hw_queues: self.hw_queues,
            queue_depth: self.depth,
            reserved_tags: self.reserved,
            timeout: Duration::from_millis(self.timeout_ms),
            nr_cpus: self.cpus,
            cache_domain_size: self.cache_domain_size,
            remote_completion: self.remote_completion,
            blocking: self.blocking,
            sched_depth: self.sched_depth,
        }
    }
}

/// Behavior of the simulated device.
#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct Driver {
    /// Service time of each request, in microseconds
    pub latency_us: u64,
    /// Requests the device can hold at once, beyond which it reports busy
    pub capacity: Option<usize>,
    /// Probability of a submission being refused as busy
    pub busy_rate: f64,
    /// Probability of a submission failing outright
    pub error_rate: f64,
}
impl Default for Driver {
    fn default() -> Self {
        Self {
            latency_us: 100,
            capacity: None,
            busy_rate: 0.0,
            error_rate: 0.0,
        }
    }
}
impl Driver {
    pub fn latency(&self) -> Duration {
        Duration::from_micros(self.latency_us)
    }
}

/// Errors which may be returned when parsing the configuration.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid rate {1} for {0}: must be within [0, 1]")]
    InvalidRate(&'static str, f64),
}

/// Parses a TOML file into a configuration object.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<Config, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    parse_str(&contents)
}

pub fn parse_str(contents: &str) -> Result<Config, ParseError> {
    let cfg = toml::from_str::<Config>(contents)?;
    for (name, rate) in [
        ("busy-rate", cfg.driver.busy_rate),
        ("error-rate", cfg.driver.error_rate),
    ] {
        if !(0.0..=1.0).contains(&rate) {
            return Err(ParseError::InvalidRate(name, rate));
        }
    }
    Ok(cfg)
}

#[cfg(test)]
mod test {
    use super::*;

    use std::io::Write;

    #[test]
    fn config_can_be_serialized_as_toml() {
        let dummy_config = Config { ..Default::default() };
        let serialized = toml::ser::to_string(&dummy_config).unwrap();
        let deserialized: Config = toml::de::from_str(&serialized).unwrap();
        assert_eq!(dummy_config, deserialized);
    }

    #[test]
    fn empty_config_matches_library_defaults() {
        let cfg = parse_str("").unwrap();
        let opts = cfg.queue.opts();
        let defaults = QueueOpts::default();
        assert_eq!(opts.nr_hw_queues, defaults.nr_hw_queues);
        assert_eq!(opts.queue_depth, defaults.queue_depth);
        assert_eq!(opts.timeout, defaults.timeout);
        assert_eq!(opts.sched_depth, None);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn parse_basic_config() {
        let raw = r#"
[queue]
hw-queues = 4
depth = 32
reserved = 2
cpus = 8
cache-domain-size = 4
remote-completion = true
timeout-ms = 1500
scheduler = "fifo"

[driver]
latency-us = 250
capacity = 16
busy-rate = 0.05
"#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(raw.as_bytes()).unwrap();
        let cfg = parse(file.path()).unwrap();

        assert_eq!(cfg.queue.scheduler.as_deref(), Some("fifo"));
        let opts = cfg.queue.opts();
        assert_eq!(opts.nr_hw_queues, 4);
        assert_eq!(opts.queue_depth, 32);
        assert_eq!(opts.reserved_tags, 2);
        assert_eq!(opts.nr_cpus, 8);
        assert_eq!(opts.cache_domain_size, 4);
        assert!(opts.remote_completion);
        assert!(!opts.blocking);
        assert_eq!(opts.timeout, Duration::from_millis(1500));

        assert_eq!(cfg.driver.latency(), Duration::from_micros(250));
        assert_eq!(cfg.driver.capacity, Some(16));
        assert_eq!(cfg.driver.busy_rate, 0.05);
        assert_eq!(cfg.driver.error_rate, 0.0);
    }

    #[test]
    fn bad_input() {
        assert!(matches!(
            parse_str("[driver]\nerror-rate = 1.5\n"),
            Err(ParseError::InvalidRate("error-rate", _))
        ));
        assert!(matches!(
            parse_str("[queue]\ndepth = \"deep\"\n"),
            Err(ParseError::Toml(_))
        ));

        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            parse(dir.path().join("missing.toml")),
            Err(ParseError::Io(_))
        ));
    }
}
