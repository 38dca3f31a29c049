//! Listen-before-talk channel access.
//!
//! Before every transmission the node sleeps a random delay so that nodes
//! woken by the same event do not talk at once. Then, if channel activity
//! detection is enabled, the radio assesses the channel until it is clear,
//! backing off a second random delay each time activity is detected.
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LbtConfig {
    pub cad_enabled: bool,
    /// The initial delay is `delay_step * n` for `n` uniform in `0..delay_slots`.
    pub delay_step: Duration,
    pub delay_slots: u32,
    /// The busy backoff is `backoff_step * n` for `n` uniform in `0..backoff_slots`.
    pub backoff_step: Duration,
    pub backoff_slots: u32,
    /// The transmission is abandoned at this many busy assessments, so
    /// `Some(n)` allows `n - 1` backoffs. `None` for no limit.
    pub max_busy_assessments: Option<u32>,
    /// How long to wait for the radio to report an assessment.
    pub cad_timeout: Duration,
}

impl Default for LbtConfig {
    fn default() -> Self {
        Self {
            cad_enabled: true,
            delay_step: Duration::from_millis(10),
            delay_slots: 100,
            backoff_step: Duration::from_millis(100),
            backoff_slots: 20,
            max_busy_assessments: Some(10),
            cad_timeout: Duration::from_secs(1),
        }
    }
}

impl LbtConfig {
    pub fn max_initial_delay(&self) -> Duration {
        self.delay_step * self.delay_slots.saturating_sub(1)
    }
}

/// Randomized delays and busy accounting for one radio.
pub struct ChannelAccess {
    config: LbtConfig,
    rng: StdRng,
    busy: u32,
}

impl ChannelAccess {
    /// Nodes seeded with their own id draw different delays.
    pub fn new(config: LbtConfig, seed: u64) -> Self {
        Self {
            config,
            rng: StdRng::seed_from_u64(seed),
            busy: 0,
        }
    }

    pub fn config(&self) -> &LbtConfig {
        &self.config
    }

    /// Starts a new transmission and returns its initial delay.
    pub fn begin(&mut self) -> Duration {
        self.busy = 0;
        draw(&mut self.rng, self.config.delay_step, self.config.delay_slots)
    }

    /// Records a busy assessment and returns the backoff to wait before the
    /// next one, or `None` once `max_busy_assessments` busy results were seen.
    pub fn on_busy(&mut self) -> Option<Duration> {
        self.busy += 1;
        match self.config.max_busy_assessments {
            Some(max) if self.busy >= max => None,
            _ => Some(draw(
                &mut self.rng,
                self.config.backoff_step,
                self.config.backoff_slots,
            )),
        }
    }

    pub fn busy_assessments(&self) -> u32 {
        self.busy
    }
}

fn draw(rng: &mut StdRng, step: Duration, slots: u32) -> Duration {
    if slots == 0 {
        return Duration::ZERO;
    }
    step * rng.gen_range(0..slots)
}
