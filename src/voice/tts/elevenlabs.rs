//! `ElevenLabs` streaming TTS over HTTP

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;

use super::TextToSpeech;
use crate::config::ElevenLabsConfig;
use crate::{Error, Result};

const API_BASE: &str = "https://api.elevenlabs.io/v1/text-to-speech";

/// Raw PCM rates the streaming endpoint can produce
const PCM_RATES: [u32; 6] = [8_000, 16_000, 22_050, 24_000, 44_100, 48_000];

/// `ElevenLabs` text-to-speech producing raw mono PCM
pub struct ElevenLabsTts {
    client: reqwest::Client,
    api_key: String,
    voice_id: String,
    model_id: String,
    language: Option<String>,
    voice_settings: Option<serde_json::Value>,
    sample_rate: u32,
}

impl ElevenLabsTts {
    /// Create a provider streaming `pcm_{sample_rate}`
    ///
    /// # Errors
    ///
    /// Returns error if the API key or voice is missing, or the rate is not
    /// one the API offers as raw PCM
    pub fn new(config: &ElevenLabsConfig, sample_rate: u32) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| Error::Config("ElevenLabs API key required for TTS".to_string()))?;
        let voice_id = config
            .voice_id
            .clone()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::Config("ElevenLabs voice_id required for TTS".to_string()))?;
        if !PCM_RATES.contains(&sample_rate) {
            return Err(Error::Config(format!(
                "ElevenLabs cannot stream PCM at {sample_rate}Hz"
            )));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            voice_id,
            model_id: config.model_id.clone(),
            language: config.language.clone(),
            voice_settings: config.voice_settings.clone(),
            sample_rate,
        })
    }

    fn stream_url(&self) -> String {
        format!(
            "{API_BASE}/{}/stream?output_format=pcm_{}",
            self.voice_id, self.sample_rate
        )
    }
}

#[async_trait]
impl TextToSpeech for ElevenLabsTts {
    async fn stream(&self, text: &str) -> Result<BoxStream<'static, Result<Vec<u8>>>> {
        #[derive(serde::Serialize)]
        struct StreamRequest<'a> {
            text: &'a str,
            model_id: &'a str,
            #[serde(skip_serializing_if = "Option::is_none")]
            language_code: Option<&'a str>,
            #[serde(skip_serializing_if = "Option::is_none")]
            voice_settings: Option<&'a serde_json::Value>,
        }

        let request = StreamRequest {
            text,
            model_id: &self.model_id,
            language_code: self.language.as_deref(),
            voice_settings: self.voice_settings.as_ref(),
        };

        tracing::debug!(voice = %self.voice_id, model = %self.model_id, chars = text.len(), "requesting ElevenLabs stream");

        let response = self
            .client
            .post(self.stream_url())
            .header("xi-api-key", &self.api_key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Tts(format!("ElevenLabs TTS error {status}: {body}")));
        }

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(Error::from))
            .boxed())
    }
}
