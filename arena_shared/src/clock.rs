//! Clock and frame-number synchronization.
//!
//! Each connection owns a [`ClockSync`]: a smoothed round-trip time and an
//! estimate of `remote_frame - local_frame`, both refreshed by ping/pong once
//! per recalibration interval.
//!
//! Clients move their [`FrameCounter`] toward the server's frame with
//! [`ClockSync::nudge`]: a bounded fraction of the estimated offset, at most
//! once per interval. The counter never runs backwards; a negative correction
//! stalls it for that many ticks instead.

use std::time::{Duration, Instant};

use crate::{
    config::NetConfig,
    protocol::{Ping, Pong},
};

/// Simulation frame index.
pub type FrameNumber = i64;

/// Exponentially weighted RTT estimate.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    smoothing: f64,
    estimate: Option<Duration>,
}

impl RttEstimator {
    pub fn new(smoothing: f64) -> Self {
        Self {
            smoothing: smoothing.clamp(0.0, 1.0),
            estimate: None,
        }
    }

    /// Folds in one sample; the first sample is taken as-is.
    pub fn update(&mut self, sample: Duration) -> Duration {
        let next = match self.estimate {
            None => sample,
            Some(prev) => {
                let prev = prev.as_nanos() as f64;
                let s = sample.as_nanos() as f64;
                Duration::from_nanos((prev + self.smoothing * (s - prev)).round().max(0.0) as u64)
            }
        };
        self.estimate = Some(next);
        next
    }

    pub fn estimate(&self) -> Option<Duration> {
        self.estimate
    }
}

/// Non-decreasing local frame counter.
#[derive(Debug, Clone, Default)]
pub struct FrameCounter {
    frame: FrameNumber,
    stall: u64,
}

impl FrameCounter {
    pub fn new(frame: FrameNumber) -> Self {
        Self { frame, stall: 0 }
    }

    pub fn get(&self) -> FrameNumber {
        self.frame
    }

    /// Jumps to `frame`, e.g. when an arena starts. Clears pending stalls.
    pub fn reset(&mut self, frame: FrameNumber) {
        self.frame = frame;
        self.stall = 0;
    }

    /// Advances one tick, or burns one stalled tick.
    pub fn advance(&mut self) {
        if self.stall > 0 {
            self.stall -= 1;
        } else {
            self.frame += 1;
        }
    }

    /// Applies a clock-sync correction.
    pub fn apply(&mut self, correction: FrameNumber) {
        if correction > 0 {
            let burned = self.stall.min(correction as u64);
            self.stall -= burned;
            self.frame += correction - burned as FrameNumber;
        } else if correction < 0 {
            self.stall += correction.unsigned_abs();
        }
    }

    pub fn stalled_ticks(&self) -> u64 {
        self.stall
    }
}

/// Per-connection RTT and frame offset bookkeeping.
#[derive(Debug, Clone)]
pub struct ClockSync {
    epoch: Instant,
    interval: Duration,
    frame_duration: Duration,
    smoothing: f64,
    nudge_fraction: f64,
    max_nudge: FrameNumber,
    rtt: RttEstimator,
    offset: Option<f64>,
    last_ping: Option<Instant>,
    last_nudge_interval: Option<u64>,
    /// Pongs for pings sent before this point carry a stale frame.
    reset_at_micros: u64,
}

impl ClockSync {
    pub fn new(cfg: &NetConfig, epoch: Instant) -> Self {
        Self {
            epoch,
            interval: cfg.clock_sync_interval(),
            frame_duration: cfg.frame_duration(),
            smoothing: cfg.rtt_smoothing.clamp(0.0, 1.0),
            nudge_fraction: cfg.frame_nudge_fraction.clamp(0.0, 1.0),
            max_nudge: cfg.max_frame_nudge.max(1),
            rtt: RttEstimator::new(cfg.rtt_smoothing),
            offset: None,
            last_ping: None,
            last_nudge_interval: None,
            reset_at_micros: 0,
        }
    }

    fn micros_since_epoch(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_micros() as u64
    }

    /// True once per recalibration interval.
    pub fn should_ping(&self, now: Instant) -> bool {
        match self.last_ping {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.interval,
        }
    }

    pub fn make_ping(&mut self, now: Instant, local_frame: FrameNumber) -> Ping {
        self.last_ping = Some(now);
        Ping {
            sent_at_micros: self.micros_since_epoch(now),
            frame: local_frame,
        }
    }

    pub fn answer_ping(ping: &Ping, local_frame: FrameNumber) -> Pong {
        Pong {
            ping_sent_at_micros: ping.sent_at_micros,
            frame: local_frame,
        }
    }

    /// Folds a pong into the RTT and frame offset estimates.
    ///
    /// A pong answering a ping sent before the last [`ClockSync::reset_offset`]
    /// still counts for RTT, but its frame belongs to the old timeline.
    pub fn on_pong(&mut self, now: Instant, pong: &Pong, local_frame: FrameNumber) {
        let now_micros = self.micros_since_epoch(now);
        let sample = Duration::from_micros(now_micros.saturating_sub(pong.ping_sent_at_micros));
        let rtt = self.rtt.update(sample);
        if pong.ping_sent_at_micros < self.reset_at_micros {
            return;
        }
        self.record_offset_sample(pong.frame, rtt, local_frame);
    }

    /// Forgets the frame offset after either side's frame counter jumped,
    /// e.g. on arena start. The next ping goes out right away.
    pub fn reset_offset(&mut self, now: Instant) {
        self.offset = None;
        self.last_ping = None;
        self.last_nudge_interval = None;
        self.reset_at_micros = self.micros_since_epoch(now);
    }

    /// `remote_frame` was read on the remote side `rtt / 2` ago.
    pub fn record_offset_sample(&mut self, remote_frame: FrameNumber, rtt: Duration, local_frame: FrameNumber) {
        let one_way = rtt.as_secs_f64() / 2.0 / self.frame_duration.as_secs_f64();
        let sample = remote_frame as f64 + one_way - local_frame as f64;
        self.offset = Some(match self.offset {
            None => sample,
            Some(prev) => prev + self.smoothing * (sample - prev),
        });
    }

    pub fn rtt(&self) -> Option<Duration> {
        self.rtt.estimate()
    }

    /// Estimated `remote_frame - local_frame`, zero before the first sample.
    pub fn frame_offset(&self) -> FrameNumber {
        self.offset.map(|o| o.round() as FrameNumber).unwrap_or(0)
    }

    /// Translates a remote frame number to the local timeline.
    pub fn remote_to_local(&self, remote_frame: FrameNumber) -> FrameNumber {
        remote_frame - self.frame_offset()
    }

    /// Correction to apply to the local frame counter, or zero when this
    /// interval has already been handled.
    ///
    /// The correction never exceeds the estimated offset in magnitude nor
    /// `max_frame_nudge`, and is subtracted from the estimate right away so a
    /// second call before the next measurement cannot double-apply it.
    pub fn nudge(&mut self, now: Instant) -> FrameNumber {
        let Some(offset) = self.offset else {
            return 0;
        };
        let interval_index = (now.saturating_duration_since(self.epoch).as_nanos()
            / self.interval.as_nanos().max(1)) as u64;
        if self.last_nudge_interval == Some(interval_index) {
            return 0;
        }
        self.last_nudge_interval = Some(interval_index);

        let whole = offset.round() as FrameNumber;
        let mut correction = (offset * self.nudge_fraction).round() as FrameNumber;
        correction = correction.clamp(-self.max_nudge, self.max_nudge);
        if correction.abs() > whole.abs() {
            correction = whole;
        }
        self.offset = Some(offset - correction as f64);
        correction
    }
}
