//! Resolved run parameters for both sides of the loop.
//!
//! The binaries fill these from command-line flags; each run also writes the
//! values it used next to its recordings so an experiment can be replayed.

use std::fs::File;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::{EmulationError, Result};

/// Longest the controller worker may block on an empty slot. Shutdown waits
/// out at most one poll.
pub const MAX_POLL_TIMEOUT_MS: u64 = 60_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlantConfig {
    /// Plant ticks per second.
    pub tick_rate: u32,
    /// Stop after this many seconds; run until interrupted when unset.
    pub duration_s: Option<f64>,
    pub bind_addr: SocketAddr,
    /// Remote controller service. Unset means start one in-process.
    pub controller_addr: Option<SocketAddr>,
    pub output_dir: Option<PathBuf>,
    /// Upper bound on the blocking pool that runs simulation steps.
    pub blocking_threads: usize,
}

impl Default for PlantConfig {
    fn default() -> Self {
        Self {
            tick_rate: 100,
            duration_s: None,
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            controller_addr: None,
            output_dir: None,
            blocking_threads: 2,
        }
    }
}

impl PlantConfig {
    pub fn validate(&self) -> Result<()> {
        if self.tick_rate == 0 {
            return Err(EmulationError::Config("tick_rate must be positive".into()));
        }
        if let Some(d) = self.duration_s {
            if !(d.is_finite() && d > 0.0) {
                return Err(EmulationError::Config(format!(
                    "duration must be a positive number of seconds, got {d}"
                )));
            }
        }
        if self.blocking_threads == 0 {
            return Err(EmulationError::Config(
                "blocking_threads must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration_s.map(Duration::from_secs_f64)
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate.max(1) as f64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerServiceConfig {
    pub bind_addr: SocketAddr,
    /// Artificial delay before each reply, in milliseconds.
    pub reply_delay_ms: u64,
    /// How long the worker waits on an empty work slot before rechecking
    /// for shutdown.
    pub poll_timeout_ms: u64,
    pub output_dir: Option<PathBuf>,
    /// Run the worker at maximum thread priority.
    pub realtime_priority: bool,
    /// Pin the worker to this core index.
    pub pin_core: Option<usize>,
}

impl Default for ControllerServiceConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            reply_delay_ms: 0,
            poll_timeout_ms: 10,
            output_dir: None,
            realtime_priority: false,
            pin_core: None,
        }
    }
}

impl ControllerServiceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.poll_timeout_ms == 0 {
            return Err(EmulationError::Config(
                "poll_timeout_ms must be positive".into(),
            ));
        }
        if self.poll_timeout_ms > MAX_POLL_TIMEOUT_MS {
            return Err(EmulationError::Config(format!(
                "poll_timeout_ms must be at most {MAX_POLL_TIMEOUT_MS}, got {}",
                self.poll_timeout_ms
            )));
        }
        Ok(())
    }

    pub fn reply_delay(&self) -> Option<Duration> {
        (self.reply_delay_ms > 0).then(|| Duration::from_millis(self.reply_delay_ms))
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

/// Writes `config` as a single-row CSV with a header.
pub fn save_config<T: Serialize>(config: &T, path: impl AsRef<Path>) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(File::create(path)?);
    wtr.serialize(config)?;
    wtr.flush()?;
    Ok(())
}

/// Reads back a file written by [`save_config`].
pub fn load_config<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let mut rdr = csv::Reader::from_reader(File::open(path)?);
    match rdr.deserialize().next() {
        Some(row) => Ok(row?),
        None => Err(EmulationError::Config("configuration file is empty".into())),
    }
}
