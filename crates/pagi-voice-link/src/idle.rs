//! Inactivity countdown with speech hysteresis.
//!
//! The clock is advanced by the driver's idle tick and decrements by the wall-clock time
//! since the previous tick. It is held at full duration whenever the conversation is busy,
//! so a full idle window only starts after the remote peer has finished speaking.

use crate::config::VoiceLinkConfig;
use crate::session::SessionState;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// What the clock needs to know about the rest of the session on each tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IdleInputs {
    pub state: SessionState,
    pub answer_in_progress: bool,
    /// Latest smoothed remote level.
    pub remote_level: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleVerdict {
    /// Not armed, or already expired.
    Inactive,
    /// Held at full duration.
    Holding,
    Counting { remaining: Duration },
    /// Reached zero on this tick. Reported once per arming.
    Expired,
}

#[derive(Debug, Clone)]
pub struct IdleClock {
    timeout: Duration,
    remaining: Duration,
    last_tick: Option<Instant>,
    armed: bool,
    remote_threshold: f32,
    local_threshold: f32,
    confirm_samples: u32,
    streak: u32,
}

impl IdleClock {
    pub fn new(config: &VoiceLinkConfig) -> Self {
        Self {
            timeout: config.timing.idle_timeout(),
            remaining: config.timing.idle_timeout(),
            last_tick: None,
            armed: false,
            remote_threshold: config.levels.remote_speech_threshold,
            local_threshold: config.levels.local_speech_threshold,
            confirm_samples: config.levels.confirm_samples.max(1),
            streak: 0,
        }
    }

    /// Start counting for a new session at full duration.
    pub fn arm(&mut self, now: Instant) {
        self.armed = true;
        self.streak = 0;
        self.reset(now);
    }

    pub fn disarm(&mut self) {
        self.armed = false;
        self.streak = 0;
        self.last_tick = None;
        self.remaining = self.timeout;
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn remaining(&self) -> Duration {
        self.remaining
    }

    /// Back to full duration.
    pub fn reset(&mut self, now: Instant) {
        self.remaining = self.timeout;
        self.last_tick = Some(now);
    }

    /// The remote peer transcribed user speech.
    pub fn confirm_user_speech(&mut self, now: Instant) {
        if self.armed {
            debug!(target: "pagi::voice_link::idle", "User transcript received; idle clock reset");
            self.reset(now);
        }
    }

    /// Feed one pre-smoothing local energy sample. Returns true when this sample confirmed
    /// a new sustained-speech episode, which resets the clock once.
    pub fn observe_local_sample(&mut self, energy: f32, now: Instant) -> bool {
        if energy <= self.local_threshold {
            self.streak = 0;
            return false;
        }
        self.streak = self.streak.saturating_add(1);
        if self.streak == self.confirm_samples {
            if self.armed {
                debug!(
                    target: "pagi::voice_link::idle",
                    samples = self.streak,
                    "Sustained local speech confirmed; idle clock reset"
                );
                self.reset(now);
            }
            return true;
        }
        false
    }

    pub fn tick(&mut self, now: Instant, inputs: IdleInputs) -> IdleVerdict {
        if !self.armed {
            return IdleVerdict::Inactive;
        }
        let elapsed = self
            .last_tick
            .map_or(Duration::ZERO, |prev| now.saturating_duration_since(prev));
        self.last_tick = Some(now);

        let busy = match inputs.state {
            SessionState::Disconnected => return IdleVerdict::Inactive,
            SessionState::Connecting | SessionState::Speaking => true,
            SessionState::Connected | SessionState::Listening => {
                inputs.answer_in_progress || inputs.remote_level > self.remote_threshold
            }
        };
        if busy {
            self.remaining = self.timeout;
            return IdleVerdict::Holding;
        }

        self.remaining = self.remaining.saturating_sub(elapsed);
        if self.remaining.is_zero() {
            self.armed = false;
            info!(
                target: "pagi::voice_link::idle",
                timeout_ms = self.timeout.as_millis() as u64,
                "Idle timeout reached"
            );
            return IdleVerdict::Expired;
        }
        IdleVerdict::Counting {
            remaining: self.remaining,
        }
    }
}
