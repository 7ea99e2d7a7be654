//! TOML configuration file loading
//!
//! Supports `~/.config/meowko/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct MeowkoConfigFile {
    /// Voice pipeline tuning
    #[serde(default)]
    pub voice: VoiceFileConfig,

    /// Soniox streaming STT
    #[serde(default)]
    pub soniox: SonioxFileConfig,

    /// `ElevenLabs` streaming TTS
    #[serde(default)]
    pub elevenlabs: ElevenLabsFileConfig,

    /// Text generation
    #[serde(default)]
    pub llm: LlmFileConfig,
}

/// Voice pipeline configuration
#[derive(Debug, Default, Deserialize)]
pub struct VoiceFileConfig {
    /// Sample rate the STT service expects (Hz)
    pub stt_sample_rate: Option<u32>,

    /// Sample rate the TTS service produces (Hz)
    pub tts_sample_rate: Option<u32>,

    /// Silence after the last speech frame before the utterance is finalized
    pub endpointing_ms: Option<u64>,

    /// How long to wait for a Final transcript after finalizing
    pub final_timeout_ms: Option<u64>,

    /// Maximum buffered playback audio
    pub playback_buffer_ms: Option<u64>,

    /// Outgoing STT queue bound, in 20ms frames
    pub capture_queue_frames: Option<usize>,

    /// RMS level (0.0-1.0) above which a capture frame counts as speech
    pub speech_threshold: Option<f32>,

    pub stt_connect_timeout_ms: Option<u64>,
    pub tts_open_timeout_ms: Option<u64>,
    pub llm_timeout_ms: Option<u64>,
    pub stt_retry_cooldown_ms: Option<u64>,

    /// Sessions with no utterance for this long are torn down
    pub idle_timeout_secs: Option<u64>,

    /// Text delivered when no reply could be produced in time
    pub apology_text: Option<String>,

    /// Barge-in policy
    #[serde(default)]
    pub barge_in: BargeInFileConfig,
}

/// Barge-in policy configuration
#[derive(Debug, Default, Deserialize)]
pub struct BargeInFileConfig {
    pub enabled: Option<bool>,
    /// Consecutive non-trivial interim transcripts that trigger barge-in
    pub min_interim_events: Option<usize>,
    /// Minimum characters for an interim transcript to count as non-trivial
    pub min_interim_chars: Option<usize>,
    /// Whether a Final transcript always triggers barge-in
    pub on_final: Option<bool>,
}

/// Soniox configuration
#[derive(Debug, Default, Deserialize)]
pub struct SonioxFileConfig {
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub language_hints: Option<Vec<String>>,
}

/// `ElevenLabs` configuration
#[derive(Debug, Default, Deserialize)]
pub struct ElevenLabsFileConfig {
    pub api_key: Option<String>,
    pub voice_id: Option<String>,
    pub model_id: Option<String>,
    pub language: Option<String>,
    /// Passed through verbatim as `voice_settings`
    pub voice_settings: Option<toml::Table>,
}

/// LLM configuration
#[derive(Debug, Default, Deserialize)]
pub struct LlmFileConfig {
    /// OpenAI-compatible base URL
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub system_prompt: Option<String>,
}

/// Load the TOML config file from the standard path
///
/// Returns `MeowkoConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> MeowkoConfigFile {
    let Some(path) = config_file_path() else {
        return MeowkoConfigFile::default();
    };

    load_config_file_from(&path)
}

/// Load a TOML config file from an explicit path
///
/// Falls back to defaults on any read or parse failure.
pub fn load_config_file_from(path: &Path) -> MeowkoConfigFile {
    if !path.exists() {
        return MeowkoConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                MeowkoConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            MeowkoConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/meowko/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("meowko").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let cfg = load_config_file_from(Path::new("/nonexistent/meowko/config.toml"));
        assert!(cfg.voice.endpointing_ms.is_none());
        assert!(cfg.llm.model.is_none());
    }

    #[test]
    fn parses_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[voice]
endpointing_ms = 700
stt_sample_rate = 48000

[voice.barge_in]
min_interim_events = 3

[elevenlabs]
voice_id = "cat"

[elevenlabs.voice_settings]
stability = 0.4
"#,
        )
        .unwrap();

        let cfg = load_config_file_from(&path);
        assert_eq!(cfg.voice.endpointing_ms, Some(700));
        assert_eq!(cfg.voice.stt_sample_rate, Some(48000));
        assert_eq!(cfg.voice.barge_in.min_interim_events, Some(3));
        assert_eq!(cfg.elevenlabs.voice_id.as_deref(), Some("cat"));
        assert!(cfg.elevenlabs.voice_settings.is_some());
    }

    #[test]
    fn unparsable_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "voice = [not toml").unwrap();

        let cfg = load_config_file_from(&path);
        assert!(cfg.voice.endpointing_ms.is_none());
    }
}
