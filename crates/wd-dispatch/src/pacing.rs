//! Pacing and backoff policy.
//!
//! Stateless: every draw takes the caller's RNG, so each dispatch loop owns
//! its randomness and tests can pass a seeded one.

use std::time::Duration;

use rand::Rng;

/// Inclusive window a delay is drawn uniformly from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayWindow {
    pub min: Duration,
    pub max: Duration,
}

impl DelayWindow {
    pub const ZERO: DelayWindow = DelayWindow::from_millis(0, 0);

    pub const fn from_millis(min_ms: u64, max_ms: u64) -> Self {
        Self {
            min: Duration::from_millis(min_ms),
            max: Duration::from_millis(max_ms),
        }
    }

    /// Uniform draw with millisecond granularity. A degenerate window
    /// (`max <= min`) always yields `min`.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let lo = self.min.as_millis() as u64;
        let hi = self.max.as_millis() as u64;
        if hi <= lo {
            return self.min;
        }
        Duration::from_millis(rng.gen_range(lo..=hi))
    }

    pub fn contains(&self, d: Duration) -> bool {
        d >= self.min && d <= self.max
    }
}

/// Pause taken when an instance hits its per-cycle send limit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePause {
    /// Occasional long break
    Break(Duration),
    /// Regular (possibly extended) pause
    Pause(Duration),
}

impl CyclePause {
    pub fn duration(&self) -> Duration {
        match self {
            CyclePause::Break(d) | CyclePause::Pause(d) => *d,
        }
    }
}

/// Delay windows and probabilities shared by every dispatch loop
#[derive(Debug, Clone)]
pub struct PacingPolicy {
    /// Sends per instance before a cycle pause
    pub max_messages_per_cycle: u32,
    pub message_interval: DelayWindow,
    pub extended_pause: DelayWindow,
    pub extended_pause_probability: f64,
    pub occasional_break: DelayWindow,
    pub occasional_break_probability: f64,
    pub reading: DelayWindow,
    pub writing_base: DelayWindow,
    pub writing_per_word: DelayWindow,
    pub retry_backoff: DelayWindow,
}

impl Default for PacingPolicy {
    fn default() -> Self {
        Self {
            max_messages_per_cycle: 7,
            message_interval: DelayWindow::from_millis(20_000, 60_000),
            extended_pause: DelayWindow::from_millis(60_000, 180_000),
            extended_pause_probability: 0.25,
            occasional_break: DelayWindow::from_millis(120_000, 300_000),
            occasional_break_probability: 0.10,
            reading: DelayWindow::from_millis(2_000, 4_000),
            writing_base: DelayWindow::from_millis(3_000, 6_000),
            writing_per_word: DelayWindow::from_millis(80, 200),
            retry_backoff: DelayWindow::from_millis(30_000, 120_000),
        }
    }
}

impl PacingPolicy {
    /// Every window collapsed to zero
    pub fn without_delays() -> Self {
        Self {
            max_messages_per_cycle: u32::MAX,
            message_interval: DelayWindow::ZERO,
            extended_pause: DelayWindow::ZERO,
            extended_pause_probability: 0.0,
            occasional_break: DelayWindow::ZERO,
            occasional_break_probability: 0.0,
            reading: DelayWindow::ZERO,
            writing_base: DelayWindow::ZERO,
            writing_per_word: DelayWindow::ZERO,
            retry_backoff: DelayWindow::ZERO,
        }
    }

    /// Wait after a send: drawn from the extended window with
    /// `extended_pause_probability`, otherwise from the regular one.
    pub fn inter_message_delay<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        if rng.gen::<f64>() < self.extended_pause_probability {
            self.extended_pause.sample(rng)
        } else {
            self.message_interval.sample(rng)
        }
    }

    pub fn cycle_limit_reached(&self, sent_in_cycle: u32) -> bool {
        sent_in_cycle >= self.max_messages_per_cycle
    }

    /// Pause once the per-cycle limit is hit
    pub fn cycle_pause<R: Rng + ?Sized>(&self, rng: &mut R) -> CyclePause {
        if rng.gen::<f64>() < self.occasional_break_probability {
            CyclePause::Break(self.occasional_break.sample(rng))
        } else {
            CyclePause::Pause(self.inter_message_delay(rng))
        }
    }

    /// Reading time plus writing time; writing grows with the word count.
    pub fn typing_delay<R: Rng + ?Sized>(&self, body: &str, rng: &mut R) -> Duration {
        let words = body.split_whitespace().count() as u32;
        if words == 0 {
            return Duration::ZERO;
        }
        let reading = self.reading.sample(rng);
        let writing = self.writing_base.sample(rng) + self.writing_per_word.sample(rng) * words;
        reading + writing
    }

    pub fn retry_backoff<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        self.retry_backoff.sample(rng)
    }
}
