//! Voice link configuration loaded from TOML and `PAGI_VOICE_LINK__*` environment overrides.
//!
//! Every timing and threshold the controller uses lives here. None of the defaults is
//! load-bearing; only their relative ordering matters (e.g. the stuck-response watchdog
//! fires before the completion timeout, the idle tick is much shorter than the idle timeout).
//!
//! | Env | Default | Description |
//! |-----|---------|-------------|
//! | PAGI_VOICE_LINK_CONFIG | config/voice_link | Path of the TOML file (extension optional). |
//! | PAGI_VOICE_LINK__ENDPOINTS__CREDENTIAL_URL | http://localhost:8001/api/voice/session | Credential issuer. |
//! | PAGI_VOICE_LINK__ENDPOINTS__RELAY_URL | http://localhost:8001/api/voice/handshake | Handshake relay. |
//! | PAGI_VOICE_LINK__TIMING__IDLE_TIMEOUT_MS | 15000 | Inactivity span before forced disconnect. |
//! | PAGI_VOICE_LINK__RETRY__MAX_RETRIES | 3 | Continuation ceiling per logical answer. |

use crate::error::{VoiceLinkError, VoiceLinkResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceLinkConfig {
    pub endpoints: EndpointConfig,
    pub timing: TimingConfig,
    pub retry: RetryConfig,
    pub dedup: DedupConfig,
    pub levels: LevelConfig,
    pub session: SessionConfig,
}

/// External collaborator endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Credential issuer (POST `{ voicePreference, fastPath }`).
    pub credential_url: String,
    /// Handshake relay (POST `{ localOfferDescription, shortLivedCredential }`).
    pub relay_url: String,
    /// Per-request HTTP timeout.
    pub request_timeout_ms: u64,
    /// STUN/TURN urls for the peer transport.
    pub ice_servers: Vec<String>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            credential_url: "http://localhost:8001/api/voice/session".to_string(),
            relay_url: "http://localhost:8001/api/voice/handshake".to_string(),
            request_timeout_ms: 10_000,
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
        }
    }
}

impl EndpointConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Timers and cadences.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Completion timeout armed when an answer starts and refreshed on every fragment.
    pub response_timeout_ms: u64,
    /// Ceiling on time spent in `speaking` without a completion.
    pub stuck_response_ms: u64,
    /// Pause between an incomplete finalize and the continuation request.
    pub retry_cooldown_ms: u64,
    /// Inactivity span before forced disconnect.
    pub idle_timeout_ms: u64,
    /// Idle clock tick.
    pub idle_tick_ms: u64,
    /// Level sampling cadence (the "animation frame").
    pub level_sample_ms: u64,
    /// Level publish cadence towards observers.
    pub level_publish_ms: u64,
    /// Cadence of local-energy samples fed to the speech hysteresis.
    pub speech_sample_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: 45_000,
            stuck_response_ms: 30_000,
            retry_cooldown_ms: 800,
            idle_timeout_ms: 15_000,
            idle_tick_ms: 500,
            level_sample_ms: 16,
            level_publish_ms: 50,
            speech_sample_ms: 250,
        }
    }
}

impl TimingConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn stuck_response(&self) -> Duration {
        Duration::from_millis(self.stuck_response_ms)
    }

    pub fn retry_cooldown(&self) -> Duration {
        Duration::from_millis(self.retry_cooldown_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn idle_tick(&self) -> Duration {
        Duration::from_millis(self.idle_tick_ms)
    }

    pub fn level_sample(&self) -> Duration {
        Duration::from_millis(self.level_sample_ms)
    }

    pub fn level_publish(&self) -> Duration {
        Duration::from_millis(self.level_publish_ms)
    }

    pub fn speech_sample(&self) -> Duration {
        Duration::from_millis(self.speech_sample_ms)
    }
}

/// Answer repair budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Hard ceiling of continuation requests per logical answer (explicit failures).
    pub max_retries: u32,
    /// Allowance for heuristic incompleteness and completion timeouts.
    pub heuristic_retries: u32,
    /// How many trailing characters of the produced text the continuation quotes.
    pub continuation_tail_chars: usize,
    /// Answers shorter than this are never flagged as cut off.
    pub min_incomplete_chars: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            heuristic_retries: 1,
            continuation_tail_chars: 40,
            min_incomplete_chars: 3,
        }
    }
}

/// Duplicate suppression.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Horizon within which a near-identical answer is suppressed.
    pub near_duplicate_window_ms: u64,
    /// Processed response ids kept before the oldest is evicted.
    pub response_id_capacity: usize,
    /// Processed response ids older than this stop suppressing.
    pub response_id_horizon_ms: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            near_duplicate_window_ms: 5_000,
            response_id_capacity: 64,
            response_id_horizon_ms: 300_000,
        }
    }
}

impl DedupConfig {
    pub fn near_duplicate_window(&self) -> Duration {
        Duration::from_millis(self.near_duplicate_window_ms)
    }

    pub fn response_id_horizon(&self) -> Duration {
        Duration::from_millis(self.response_id_horizon_ms)
    }
}

/// Level metering and speech thresholds. Energies are normalized to 0..=1.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LevelConfig {
    /// Raw RMS energy mapped to a level of 1.0.
    pub energy_ceiling: f32,
    /// Smoothing weight of a new sample while the level rises.
    pub attack: f32,
    /// Smoothing weight of a new sample while the level falls.
    pub decay: f32,
    /// Local energy above this counts towards confirmed user speech.
    pub local_speech_threshold: f32,
    /// Remote energy above this holds the idle clock.
    pub remote_speech_threshold: f32,
    /// Consecutive qualifying local samples that confirm speech.
    pub confirm_samples: u32,
    /// FFT size of the PCM analyzer (power of two).
    pub fft_size: usize,
}

impl Default for LevelConfig {
    fn default() -> Self {
        Self {
            energy_ceiling: 0.5,
            attack: 0.6,
            decay: 0.12,
            local_speech_threshold: 0.3,
            remote_speech_threshold: 0.15,
            confirm_samples: 4,
            fft_size: 512,
        }
    }
}

/// Remote session parameters sent on channel open.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Voice preference forwarded to the credential issuer and `session.update`.
    pub voice: String,
    /// Optional instructions forwarded in `session.update`.
    pub instructions: Option<String>,
    /// Model used by the remote peer to transcribe user speech.
    pub transcription_model: String,
    /// Inbound error codes that end the session.
    pub fatal_error_codes: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            voice: "alloy".to_string(),
            instructions: None,
            transcription_model: "whisper-1".to_string(),
            fatal_error_codes: vec!["session_expired".to_string()],
        }
    }
}

impl VoiceLinkConfig {
    /// Load config from file and environment. Precedence: env `PAGI_VOICE_LINK__*` >
    /// file at `PAGI_VOICE_LINK_CONFIG` (or `config/voice_link`) > defaults.
    pub fn load() -> VoiceLinkResult<Self> {
        let config_path = std::env::var("PAGI_VOICE_LINK_CONFIG")
            .unwrap_or_else(|_| "config/voice_link".to_string());
        Self::load_from(Path::new(&config_path))
    }

    /// Load from an explicit file path (missing file means defaults) plus environment.
    pub fn load_from(path: &Path) -> VoiceLinkResult<Self> {
        let builder = config::Config::builder();

        let toml_path = path.with_extension("toml");
        let builder = if path.is_file() {
            builder.add_source(config::File::from(path).format(config::FileFormat::Toml))
        } else if toml_path.is_file() {
            builder.add_source(config::File::from(toml_path.as_path()).format(config::FileFormat::Toml))
        } else {
            builder
        };

        let built = builder
            .add_source(config::Environment::with_prefix("PAGI_VOICE_LINK").separator("__"))
            .build()?;

        let cfg: Self = built.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject tunables that would stall or spin the controller.
    pub fn validate(&self) -> VoiceLinkResult<()> {
        let t = &self.timing;
        for (name, value) in [
            ("timing.idle_tick_ms", t.idle_tick_ms),
            ("timing.level_sample_ms", t.level_sample_ms),
            ("timing.level_publish_ms", t.level_publish_ms),
            ("timing.speech_sample_ms", t.speech_sample_ms),
            ("timing.response_timeout_ms", t.response_timeout_ms),
            ("timing.stuck_response_ms", t.stuck_response_ms),
        ] {
            if value == 0 {
                return Err(VoiceLinkError::Config(format!("{name} must be greater than zero")));
            }
        }
        if t.idle_tick_ms >= t.idle_timeout_ms {
            return Err(VoiceLinkError::Config(format!(
                "timing.idle_tick_ms ({}) must be shorter than timing.idle_timeout_ms ({})",
                t.idle_tick_ms, t.idle_timeout_ms
            )));
        }

        let l = &self.levels;
        for (name, value) in [
            ("levels.attack", l.attack),
            ("levels.decay", l.decay),
            ("levels.local_speech_threshold", l.local_speech_threshold),
            ("levels.remote_speech_threshold", l.remote_speech_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(VoiceLinkError::Config(format!("{name} must be within 0..=1, got {value}")));
            }
        }
        if l.energy_ceiling <= 0.0 {
            return Err(VoiceLinkError::Config("levels.energy_ceiling must be positive".to_string()));
        }
        if l.confirm_samples == 0 {
            return Err(VoiceLinkError::Config("levels.confirm_samples must be at least 1".to_string()));
        }
        if !l.fft_size.is_power_of_two() || l.fft_size < 32 {
            return Err(VoiceLinkError::Config(format!(
                "levels.fft_size must be a power of two >= 32, got {}",
                l.fft_size
            )));
        }

        if self.retry.heuristic_retries > self.retry.max_retries {
            return Err(VoiceLinkError::Config(format!(
                "retry.heuristic_retries ({}) cannot exceed retry.max_retries ({})",
                self.retry.heuristic_retries, self.retry.max_retries
            )));
        }
        if self.dedup.response_id_capacity == 0 {
            return Err(VoiceLinkError::Config("dedup.response_id_capacity must be at least 1".to_string()));
        }

        Ok(())
    }
}
