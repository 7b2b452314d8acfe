//! Configuration system.
//!
//! Loads network configuration from JSON strings (file IO left to the app).
//! Every tunable has a default so a partial document is valid.

use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Root configuration shared by client/server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConfig {
    /// Server listen address, e.g. `127.0.0.1:40000`.
    #[serde(default = "default_server_addr")]
    pub server_addr: String,
    /// Fixed simulation tick rate.
    #[serde(default = "default_tick_hz")]
    pub tick_hz: u32,
    /// Maximum number of gobs announced to one connection per tick.
    #[serde(default = "default_announce_batch_cap")]
    pub announce_batch_cap: usize,
    /// Server update pass runs every this many ticks.
    #[serde(default = "default_cadence")]
    pub update_cadence_ticks: u32,
    /// Pending deletions are flushed every this many ticks.
    #[serde(default = "default_cadence")]
    pub deletion_cadence_ticks: u32,
    /// Client sends its control/local-authority update every this many ticks.
    #[serde(default = "default_client_update_cadence")]
    pub client_update_cadence_ticks: u32,
    /// RTT and frame offset recalibration interval.
    #[serde(default = "default_clock_sync_interval_ms")]
    pub clock_sync_interval_ms: u64,
    /// Weight of a new RTT/offset sample in the exponential average.
    #[serde(default = "default_rtt_smoothing")]
    pub rtt_smoothing: f64,
    /// Fraction of the estimated frame offset applied per nudge.
    #[serde(default = "default_frame_nudge_fraction")]
    pub frame_nudge_fraction: f64,
    /// Upper bound on the frames moved by a single nudge.
    #[serde(default = "default_max_frame_nudge")]
    pub max_frame_nudge: i64,
    /// Connections still handshaking after this long are dropped.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

fn default_server_addr() -> String {
    "127.0.0.1:40000".to_string()
}

fn default_tick_hz() -> u32 {
    60
}

fn default_announce_batch_cap() -> usize {
    10
}

fn default_cadence() -> u32 {
    3
}

fn default_client_update_cadence() -> u32 {
    2
}

fn default_clock_sync_interval_ms() -> u64 {
    1000
}

fn default_rtt_smoothing() -> f64 {
    0.125
}

fn default_frame_nudge_fraction() -> f64 {
    0.5
}

fn default_max_frame_nudge() -> i64 {
    2
}

fn default_handshake_timeout_ms() -> u64 {
    5000
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            server_addr: default_server_addr(),
            tick_hz: default_tick_hz(),
            announce_batch_cap: default_announce_batch_cap(),
            update_cadence_ticks: default_cadence(),
            deletion_cadence_ticks: default_cadence(),
            client_update_cadence_ticks: default_client_update_cadence(),
            clock_sync_interval_ms: default_clock_sync_interval_ms(),
            rtt_smoothing: default_rtt_smoothing(),
            frame_nudge_fraction: default_frame_nudge_fraction(),
            max_frame_nudge: default_max_frame_nudge(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
        }
    }
}

impl NetConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Builds config from command-line flags (program name excluded).
    ///
    /// `--config <file>` sets the base; `--addr` and `--tick-hz` after it
    /// override. Unknown arguments are skipped.
    pub fn from_args<I>(args: I) -> anyhow::Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut cfg = NetConfig::default();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" => {
                    let path = args.next().context("--config needs a path")?;
                    let text = std::fs::read_to_string(&path).with_context(|| format!("read config {path}"))?;
                    cfg = NetConfig::from_json_str(&text).context("parse config")?;
                }
                "--addr" => {
                    cfg.server_addr = args.next().context("--addr needs an address")?;
                }
                "--tick-hz" => {
                    let value = args.next().context("--tick-hz needs a rate")?;
                    let hz: u32 = value.parse().with_context(|| format!("parse --tick-hz {value:?}"))?;
                    anyhow::ensure!(hz > 0, "--tick-hz must be positive");
                    cfg.tick_hz = hz;
                }
                _ => {}
            }
        }
        Ok(cfg)
    }

    /// Duration of one simulation frame.
    pub fn frame_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_hz.max(1) as f64)
    }

    pub fn clock_sync_interval(&self) -> Duration {
        Duration::from_millis(self.clock_sync_interval_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}
