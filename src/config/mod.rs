//! Configuration management for the voice pipeline

pub mod file;

use std::time::Duration;

use crate::voice::BargeInPolicy;
use crate::{Error, Result};

use file::MeowkoConfigFile;

/// Default Soniox real-time model
const DEFAULT_SONIOX_MODEL: &str = "stt-rt-preview";

/// Default `ElevenLabs` model
const DEFAULT_ELEVENLABS_MODEL: &str = "eleven_flash_v2_5";

/// Default OpenAI-compatible endpoint
const DEFAULT_LLM_BASE_URL: &str = "https://api.openai.com/v1";

/// Voice pipeline configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Voice session tuning
    pub voice: VoiceConfig,

    /// Streaming STT provider
    pub soniox: SonioxConfig,

    /// Streaming TTS provider
    pub elevenlabs: ElevenLabsConfig,

    /// Text generation collaborator
    pub llm: LlmConfig,
}

/// Voice session tuning
#[derive(Debug, Clone)]
pub struct VoiceConfig {
    /// Sample rate the STT service expects (Hz, mono)
    pub stt_sample_rate: u32,

    /// Sample rate the TTS service produces (Hz, mono)
    pub tts_sample_rate: u32,

    /// Silence after the last speech frame before the utterance is finalized
    pub endpointing: Duration,

    /// How long to wait for a Final transcript after finalizing
    pub final_timeout: Duration,

    /// Upper bound on buffered playback audio
    pub playback_buffer: Duration,

    /// Outgoing STT queue bound, in frames; oldest frames are dropped beyond it
    pub capture_queue_frames: usize,

    /// RMS level (0.0-1.0) above which a capture frame counts as speech
    pub speech_threshold: f32,

    /// Bound on establishing the STT connection
    pub stt_connect_timeout: Duration,

    /// Bound on opening the TTS stream
    pub tts_open_timeout: Duration,

    /// Bound on the text-generation call
    pub llm_timeout: Duration,

    /// Minimum gap between STT reconnect attempts while degraded
    pub stt_retry_cooldown: Duration,

    /// Sessions with no utterance for this long may be torn down
    pub idle_timeout: Duration,

    /// Text delivered when no reply could be produced in time
    pub apology_text: String,

    /// When an interruption stops the assistant
    pub barge_in: BargeInPolicy,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            stt_sample_rate: 16_000,
            tts_sample_rate: 24_000,
            endpointing: Duration::from_millis(500),
            final_timeout: Duration::from_secs(3),
            playback_buffer: Duration::from_secs(5),
            capture_queue_frames: 50,
            speech_threshold: 0.01,
            stt_connect_timeout: Duration::from_secs(5),
            tts_open_timeout: Duration::from_secs(5),
            llm_timeout: Duration::from_secs(30),
            stt_retry_cooldown: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(300),
            apology_text: "Sorry, I lost my train of thought. Could you say that again?"
                .to_string(),
            barge_in: BargeInPolicy::default(),
        }
    }
}

/// Soniox streaming STT configuration
#[derive(Debug, Clone, Default)]
pub struct SonioxConfig {
    /// API key (from `SONIOX_API_KEY` env)
    pub api_key: Option<String>,

    /// Real-time model identifier
    pub model: String,

    /// Language hints (e.g. `["en", "ja"]`)
    pub language_hints: Vec<String>,
}

/// `ElevenLabs` streaming TTS configuration
#[derive(Debug, Clone, Default)]
pub struct ElevenLabsConfig {
    /// API key (from `ELEVENLABS_API_KEY` env)
    pub api_key: Option<String>,

    /// Voice identifier
    pub voice_id: Option<String>,

    /// Model identifier
    pub model_id: String,

    /// Optional language code
    pub language: Option<String>,

    /// Optional `voice_settings` object passed through to the API
    pub voice_settings: Option<serde_json::Value>,
}

/// Text generation configuration
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// OpenAI-compatible base URL
    pub base_url: String,

    /// API key (from `LLM_API_KEY` or `OPENAI_API_KEY` env)
    pub api_key: Option<String>,

    /// Model identifier
    pub model: String,

    /// Maximum completion tokens
    pub max_tokens: u32,

    /// Sampling temperature
    pub temperature: f32,

    /// System prompt prepended to every voice turn
    pub system_prompt: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_LLM_BASE_URL.to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            max_tokens: 1024,
            temperature: 0.7,
            system_prompt: None,
        }
    }
}

impl Config {
    /// Load configuration (env > toml > default)
    ///
    /// # Errors
    ///
    /// Returns error if a value is out of range
    pub fn load() -> Result<Self> {
        let fc = file::load_config_file();
        Self::from_sources(fc, |key| std::env::var(key).ok())
    }

    /// Build configuration from a parsed config file and an env lookup
    ///
    /// # Errors
    ///
    /// Returns error if a value is out of range
    pub fn from_sources(fc: MeowkoConfigFile, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = VoiceConfig::default();
        let fv = fc.voice;
        let ms = Duration::from_millis;

        let endpointing_ms = env("MEOWKO_ENDPOINTING_MS")
            .and_then(|v| v.parse().ok())
            .or(fv.endpointing_ms);
        let stt_sample_rate = env("MEOWKO_STT_SAMPLE_RATE")
            .and_then(|v| v.parse().ok())
            .or(fv.stt_sample_rate)
            .unwrap_or(defaults.stt_sample_rate);

        let default_policy = BargeInPolicy::default();
        let barge_in = BargeInPolicy {
            enabled: fv.barge_in.enabled.unwrap_or(default_policy.enabled),
            min_interim_events: fv
                .barge_in
                .min_interim_events
                .unwrap_or(default_policy.min_interim_events),
            min_interim_chars: fv
                .barge_in
                .min_interim_chars
                .unwrap_or(default_policy.min_interim_chars),
            on_final: fv.barge_in.on_final.unwrap_or(default_policy.on_final),
        };

        let voice = VoiceConfig {
            stt_sample_rate,
            tts_sample_rate: fv.tts_sample_rate.unwrap_or(defaults.tts_sample_rate),
            endpointing: endpointing_ms.map_or(defaults.endpointing, ms),
            final_timeout: fv.final_timeout_ms.map_or(defaults.final_timeout, ms),
            playback_buffer: fv.playback_buffer_ms.map_or(defaults.playback_buffer, ms),
            capture_queue_frames: fv
                .capture_queue_frames
                .unwrap_or(defaults.capture_queue_frames),
            speech_threshold: fv.speech_threshold.unwrap_or(defaults.speech_threshold),
            stt_connect_timeout: fv
                .stt_connect_timeout_ms
                .map_or(defaults.stt_connect_timeout, ms),
            tts_open_timeout: fv.tts_open_timeout_ms.map_or(defaults.tts_open_timeout, ms),
            llm_timeout: fv.llm_timeout_ms.map_or(defaults.llm_timeout, ms),
            stt_retry_cooldown: fv
                .stt_retry_cooldown_ms
                .map_or(defaults.stt_retry_cooldown, ms),
            idle_timeout: fv
                .idle_timeout_secs
                .map_or(defaults.idle_timeout, Duration::from_secs),
            apology_text: fv.apology_text.unwrap_or(defaults.apology_text),
            barge_in,
        };
        voice.validate()?;

        let soniox = SonioxConfig {
            api_key: env("SONIOX_API_KEY").or(fc.soniox.api_key),
            model: fc
                .soniox
                .model
                .unwrap_or_else(|| DEFAULT_SONIOX_MODEL.to_string()),
            language_hints: fc.soniox.language_hints.unwrap_or_default(),
        };

        let voice_settings = fc
            .elevenlabs
            .voice_settings
            .map(serde_json::to_value)
            .transpose()?;
        let elevenlabs = ElevenLabsConfig {
            api_key: env("ELEVENLABS_API_KEY").or(fc.elevenlabs.api_key),
            voice_id: env("ELEVENLABS_VOICE_ID").or(fc.elevenlabs.voice_id),
            model_id: fc
                .elevenlabs
                .model_id
                .unwrap_or_else(|| DEFAULT_ELEVENLABS_MODEL.to_string()),
            language: fc.elevenlabs.language,
            voice_settings,
        };

        let llm_defaults = LlmConfig::default();
        let llm = LlmConfig {
            base_url: env("LLM_BASE_URL")
                .or(fc.llm.base_url)
                .unwrap_or(llm_defaults.base_url),
            api_key: env("LLM_API_KEY")
                .or_else(|| env("OPENAI_API_KEY"))
                .or(fc.llm.api_key),
            model: env("LLM_MODEL")
                .or(fc.llm.model)
                .unwrap_or(llm_defaults.model),
            max_tokens: fc.llm.max_tokens.unwrap_or(llm_defaults.max_tokens),
            temperature: fc.llm.temperature.unwrap_or(llm_defaults.temperature),
            system_prompt: fc.llm.system_prompt,
        };

        Ok(Self {
            voice,
            soniox,
            elevenlabs,
            llm,
        })
    }
}

impl VoiceConfig {
    /// Reject values the pipeline cannot run with
    ///
    /// # Errors
    ///
    /// Returns error if a sample rate, bound, or policy value is zero
    pub fn validate(&self) -> Result<()> {
        if self.stt_sample_rate == 0 || self.tts_sample_rate == 0 {
            return Err(Error::Config("sample rates must be non-zero".to_string()));
        }
        if self.capture_queue_frames == 0 {
            return Err(Error::Config(
                "capture_queue_frames must be at least 1".to_string(),
            ));
        }
        if self.playback_buffer < crate::voice::FRAME_DURATION {
            return Err(Error::Config(
                "playback_buffer_ms must hold at least one 20ms frame".to_string(),
            ));
        }
        if self.barge_in.min_interim_events == 0 {
            return Err(Error::Config(
                "barge_in.min_interim_events must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
