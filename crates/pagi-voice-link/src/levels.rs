//! Audio level monitor.
//!
//! Two independent analyzer feeds (local microphone, remote voice) are sampled on the
//! driver's level cadence, turned into smoothed 0..=1 levels and published to observers on
//! a slower, throttled cadence. The local feed's raw energy also drives speech hysteresis.
//!
//! ```text
//!  AnalyzerFeed ──bins──▶ bin_energy ──raw──▶ LevelMeter ──level──▶ watch<AudioLevels>
//!                                       │
//!                                       └──(local, every speech_sample_ms)──▶ IdleClock
//! ```

use crate::capture::AudioChunk;
use crate::config::{LevelConfig, VoiceLinkConfig};
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::debug;

/// Whether a feed can still produce data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedStatus {
    Live,
    /// Track ended or graph disconnected; the feed will be dropped.
    Ended,
}

/// Frequency-domain analyzer over one audio signal.
pub trait AnalyzerFeed: Send {
    /// Overwrite `bins` with byte frequency magnitudes (0..=255).
    fn frequency_bins(&mut self, bins: &mut Vec<u8>) -> FeedStatus;
}

/// RMS of the bins scaled to 0..=1.
pub fn bin_energy(bins: &[u8]) -> f32 {
    if bins.is_empty() {
        return 0.0;
    }
    let sum: f32 = bins
        .iter()
        .map(|&b| {
            let v = f32::from(b) / 255.0;
            v * v
        })
        .sum();
    (sum / bins.len() as f32).sqrt()
}

/// Asymmetric attack/decay smoothing of one normalized level.
#[derive(Debug, Clone)]
pub struct LevelMeter {
    ceiling: f32,
    attack: f32,
    decay: f32,
    level: f32,
}

impl LevelMeter {
    pub fn new(config: &LevelConfig) -> Self {
        Self {
            ceiling: config.energy_ceiling,
            attack: config.attack,
            decay: config.decay,
            level: 0.0,
        }
    }

    /// Raw energy against the empirical ceiling.
    pub fn normalize(&self, raw: f32) -> f32 {
        (raw / self.ceiling).clamp(0.0, 1.0)
    }

    /// Feed a normalized sample and return the smoothed level.
    pub fn update(&mut self, normalized: f32) -> f32 {
        let weight = if normalized > self.level {
            self.attack
        } else {
            self.decay
        };
        self.level += (normalized - self.level) * weight;
        if self.level < 1e-4 {
            self.level = 0.0;
        }
        self.level
    }

    pub fn level(&self) -> f32 {
        self.level
    }

    pub fn clear(&mut self) {
        self.level = 0.0;
    }
}

/// Smoothed levels published to observers.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct AudioLevels {
    pub local: f32,
    pub remote: f32,
}

/// Result of one sampling pass.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LevelTick {
    pub levels: AudioLevels,
    /// Normalized, unsmoothed local energy when a speech sample is due.
    pub speech_sample: Option<f32>,
    pub published: bool,
}

struct Signal {
    name: &'static str,
    feed: Option<Box<dyn AnalyzerFeed>>,
    meter: LevelMeter,
}

impl Signal {
    /// Returns the normalized raw energy if the feed produced data.
    fn sample(&mut self, bins: &mut Vec<u8>) -> Option<f32> {
        let status = match self.feed.as_mut() {
            Some(feed) => feed.frequency_bins(bins),
            None => {
                self.meter.update(0.0);
                return None;
            }
        };
        match status {
            FeedStatus::Live => {
                let normalized = self.meter.normalize(bin_energy(bins));
                self.meter.update(normalized);
                Some(normalized)
            }
            FeedStatus::Ended => {
                debug!(target: "pagi::voice_link::levels", signal = self.name, "Analyzer feed ended; decaying level");
                self.feed = None;
                self.meter.update(0.0);
                None
            }
        }
    }
}

/// Samples both feeds and publishes throttled levels.
pub struct AudioLevelMonitor {
    local: Signal,
    remote: Signal,
    publisher: watch::Sender<AudioLevels>,
    publish_every: Duration,
    last_publish: Option<Instant>,
    speech_every: Duration,
    last_speech_sample: Option<Instant>,
    bins: Vec<u8>,
}

impl AudioLevelMonitor {
    pub fn new(config: &VoiceLinkConfig, publisher: watch::Sender<AudioLevels>) -> Self {
        Self {
            local: Signal {
                name: "local",
                feed: None,
                meter: LevelMeter::new(&config.levels),
            },
            remote: Signal {
                name: "remote",
                feed: None,
                meter: LevelMeter::new(&config.levels),
            },
            publisher,
            publish_every: config.timing.level_publish(),
            last_publish: None,
            speech_every: config.timing.speech_sample(),
            last_speech_sample: None,
            bins: Vec::new(),
        }
    }

    pub fn attach_local(&mut self, feed: Box<dyn AnalyzerFeed>) {
        debug!(target: "pagi::voice_link::levels", "Local analyzer attached");
        self.local.feed = Some(feed);
        self.last_speech_sample = None;
    }

    pub fn attach_remote(&mut self, feed: Box<dyn AnalyzerFeed>) {
        debug!(target: "pagi::voice_link::levels", "Remote analyzer attached");
        self.remote.feed = Some(feed);
    }

    /// Drop both feeds and publish silence.
    pub fn detach_all(&mut self) {
        self.local.feed = None;
        self.remote.feed = None;
        self.local.meter.clear();
        self.remote.meter.clear();
        self.last_speech_sample = None;
        self.last_publish = None;
        self.publisher.send_replace(AudioLevels::default());
    }

    pub fn levels(&self) -> AudioLevels {
        AudioLevels {
            local: self.local.meter.level(),
            remote: self.remote.meter.level(),
        }
    }

    /// No feed attached and both levels at rest.
    pub fn is_quiet(&self) -> bool {
        self.local.feed.is_none()
            && self.remote.feed.is_none()
            && self.local.meter.level() == 0.0
            && self.remote.meter.level() == 0.0
    }

    pub fn sample(&mut self, now: Instant) -> LevelTick {
        let local_energy = self.local.sample(&mut self.bins);
        self.remote.sample(&mut self.bins);
        let levels = self.levels();

        let speech_sample = match local_energy {
            Some(energy) if self.due(self.last_speech_sample, self.speech_every, now) => {
                self.last_speech_sample = Some(now);
                Some(energy)
            }
            _ => None,
        };

        let published = self.due(self.last_publish, self.publish_every, now);
        if published {
            self.last_publish = Some(now);
            self.publisher.send_replace(levels);
        }

        LevelTick {
            levels,
            speech_sample,
            published,
        }
    }

    fn due(&self, last: Option<Instant>, every: Duration, now: Instant) -> bool {
        last.map_or(true, |at| now.saturating_duration_since(at) >= every)
    }
}

impl std::fmt::Debug for AudioLevelMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioLevelMonitor")
            .field("levels", &self.levels())
            .field("local_attached", &self.local.feed.is_some())
            .field("remote_attached", &self.remote.feed.is_some())
            .finish()
    }
}

const MIN_DECIBELS: f32 = -100.0;
const MAX_DECIBELS: f32 = -30.0;

/// FFT analyzer over a broadcast PCM stream, producing byte bins on the same decibel
/// scale as a browser `AnalyserNode`.
pub struct PcmAnalyzer {
    rx: broadcast::Receiver<AudioChunk>,
    fft: Arc<dyn Fft<f32>>,
    size: usize,
    ring: VecDeque<f32>,
    window: Vec<f32>,
    scratch: Vec<Complex<f32>>,
}

impl PcmAnalyzer {
    pub fn new(rx: broadcast::Receiver<AudioChunk>, fft_size: usize) -> Self {
        let size = fft_size.max(32).next_power_of_two();
        let fft = FftPlanner::new().plan_fft_forward(size);
        let window = (0..size)
            .map(|i| {
                let phase = 2.0 * std::f32::consts::PI * i as f32 / size as f32;
                0.5 * (1.0 - phase.cos())
            })
            .collect();
        Self {
            rx,
            fft,
            size,
            ring: VecDeque::with_capacity(size),
            window,
            scratch: vec![Complex::new(0.0, 0.0); size],
        }
    }

    fn drain(&mut self) -> FeedStatus {
        loop {
            match self.rx.try_recv() {
                Ok(chunk) => {
                    for &s in chunk.samples.iter() {
                        if self.ring.len() == self.size {
                            self.ring.pop_front();
                        }
                        self.ring.push_back(s);
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return FeedStatus::Live,
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    debug!(target: "pagi::voice_link::levels", skipped, "Analyzer lagged behind audio stream");
                }
                Err(broadcast::error::TryRecvError::Closed) => return FeedStatus::Ended,
            }
        }
    }
}

impl AnalyzerFeed for PcmAnalyzer {
    fn frequency_bins(&mut self, bins: &mut Vec<u8>) -> FeedStatus {
        let status = self.drain();

        let pad = self.size - self.ring.len();
        for (i, slot) in self.scratch.iter_mut().enumerate() {
            let sample = if i < pad { 0.0 } else { self.ring[i - pad] };
            *slot = Complex::new(sample * self.window[i], 0.0);
        }
        self.fft.process(&mut self.scratch);

        let half = self.size / 2;
        bins.clear();
        bins.extend(self.scratch[..half].iter().map(|c| {
            let magnitude = c.norm() / self.size as f32;
            let db = 20.0 * magnitude.max(1e-12).log10();
            let scaled = (db - MIN_DECIBELS) / (MAX_DECIBELS - MIN_DECIBELS) * 255.0;
            scaled.clamp(0.0, 255.0) as u8
        }));
        status
    }
}
