//! Soniox real-time STT over WebSocket
//!
//! Protocol: a JSON config message opens the stream, PCM goes up as binary
//! frames, `{"type":"finalize"}` asks the server to commit everything heard so
//! far. Final tokens accumulate until the `<fin>` marker token.

use std::collections::VecDeque;

use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use uuid::Uuid;

use super::{SpeechToText, SttChannel, SttMessage, SttSink};
use crate::config::SonioxConfig;
use crate::{Error, Result};

/// Real-time transcription endpoint
const STREAMING_URL: &str = "wss://stt-rt.soniox.com/transcribe-websocket";

/// Token marking the end of a manual finalization
const FIN_MARKER: &str = "<fin>";

/// Token marking a server-detected endpoint
const END_MARKER: &str = "<end>";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Deserialize)]
struct SonioxResponse {
    #[serde(default)]
    tokens: Vec<SonioxToken>,
    #[serde(default)]
    finished: bool,
    #[serde(default)]
    error_code: Option<serde_json::Value>,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SonioxToken {
    text: String,
    #[serde(default)]
    is_final: bool,
}

/// Soniox streaming speech-to-text
pub struct SonioxStt {
    api_key: String,
    model: String,
    language_hints: Vec<String>,
    sample_rate: u32,
}

impl SonioxStt {
    /// Create a Soniox provider for mono s16le audio at `sample_rate`
    ///
    /// # Errors
    ///
    /// Returns error if the API key is missing
    pub fn new(config: &SonioxConfig, sample_rate: u32) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| Error::Config("Soniox API key required for STT".to_string()))?;

        Ok(Self {
            api_key,
            model: config.model.clone(),
            language_hints: config.language_hints.clone(),
            sample_rate,
        })
    }

    fn config_message(&self, reference_id: &str) -> serde_json::Value {
        let mut msg = serde_json::json!({
            "api_key": self.api_key,
            "model": self.model,
            "audio_format": "s16le",
            "sample_rate": self.sample_rate,
            "num_channels": 1,
            "client_reference_id": reference_id,
        });
        if !self.language_hints.is_empty() {
            msg["language_hints"] = serde_json::json!(self.language_hints);
        }
        msg
    }
}

#[async_trait]
impl SpeechToText for SonioxStt {
    async fn connect(&self, session_id: &str) -> Result<SttChannel> {
        // Reconnects of one session stay distinguishable in provider logs
        let reference_id = format!("{session_id}:{}", Uuid::new_v4());
        tracing::debug!(session_id, %reference_id, model = %self.model, "connecting to Soniox");

        let (ws, _) = connect_async(STREAMING_URL).await.map_err(|e| {
            tracing::error!(error = %e, "Soniox connection failed");
            Error::Transport(format!("Soniox connect failed: {e}"))
        })?;
        let (mut sink, stream) = ws.split();

        sink.send(Message::Text(self.config_message(&reference_id).to_string().into()))
            .await?;

        let events = futures::stream::unfold(
            (stream, TokenAccumulator::default(), VecDeque::new()),
            |(mut stream, mut acc, mut queue)| async move {
                loop {
                    if let Some(msg) = queue.pop_front() {
                        return Some((Ok(msg), (stream, acc, queue)));
                    }
                    if acc.is_finished() {
                        return None;
                    }
                    match stream.next().await {
                        None | Some(Ok(Message::Close(_))) => return None,
                        Some(Err(e)) => {
                            return Some((Err(Error::from(e)), (stream, acc, queue)));
                        }
                        Some(Ok(Message::Text(text))) => match acc.ingest(text.as_str()) {
                            Ok(msgs) => queue.extend(msgs),
                            Err(e) => return Some((Err(e), (stream, acc, queue))),
                        },
                        Some(Ok(_)) => {}
                    }
                }
            },
        )
        .boxed();

        Ok(SttChannel {
            sink: Box::new(SonioxSink { ws: sink }),
            events,
        })
    }
}

struct SonioxSink {
    ws: SplitSink<WsStream, Message>,
}

#[async_trait]
impl SttSink for SonioxSink {
    async fn send_audio(&mut self, pcm: Vec<u8>) -> Result<()> {
        self.ws
            .send(Message::Binary(pcm.into()))
            .await
            .map_err(|e| Error::Transport(format!("Soniox send failed: {e}")))
    }

    async fn finalize(&mut self) -> Result<()> {
        self.ws
            .send(Message::Text(r#"{"type":"finalize"}"#.to_string().into()))
            .await
            .map_err(|e| Error::Transport(format!("Soniox finalize failed: {e}")))
    }

    async fn close(&mut self) {
        // An empty frame tells the server no more audio follows
        let _ = self.ws.send(Message::Binary(Vec::new().into())).await;
        let _ = self.ws.close().await;
        tracing::debug!("Soniox stream closed");
    }
}

/// Turns Soniox token responses into partial and committed transcripts
#[derive(Debug, Default)]
pub struct TokenAccumulator {
    final_parts: Vec<String>,
    finished: bool,
}

impl TokenAccumulator {
    /// Feed one raw JSON response
    ///
    /// # Errors
    ///
    /// Returns `Transport` for server-reported errors and `Serialization` for
    /// unparsable messages
    pub fn ingest(&mut self, raw: &str) -> Result<Vec<SttMessage>> {
        let response: SonioxResponse = serde_json::from_str(raw)?;

        if let Some(code) = response.error_code {
            let message = response.error_message.unwrap_or_default();
            tracing::error!(code = %code, message = %message, "Soniox stream error");
            return Err(Error::Transport(format!("Soniox error {code}: {message}")));
        }

        let mut out = Vec::new();
        let mut tail = String::new();
        let mut commit = false;
        let mut progressed = false;

        for token in response.tokens {
            match token.text.as_str() {
                FIN_MARKER | END_MARKER => commit = true,
                _ if token.is_final => {
                    self.final_parts.push(token.text);
                    progressed = true;
                }
                _ => {
                    tail.push_str(&token.text);
                    progressed = true;
                }
            }
        }

        if commit {
            let text = self.final_parts.concat().trim().to_string();
            self.final_parts.clear();
            out.push(SttMessage::Committed(text));
            if !tail.trim().is_empty() {
                out.push(SttMessage::Partial(tail.trim().to_string()));
            }
        } else if progressed {
            let hypothesis = format!("{}{}", self.final_parts.concat(), tail);
            out.push(SttMessage::Partial(hypothesis.trim().to_string()));
        }

        if response.finished {
            self.finished = true;
            tracing::debug!("Soniox stream finished");
        }

        Ok(out)
    }

    /// Whether the server has ended the stream
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_includes_final_prefix() {
        let mut acc = TokenAccumulator::default();
        let out = acc
            .ingest(r#"{"tokens":[{"text":"Hel","is_final":true},{"text":"lo wor","is_final":false}]}"#)
            .unwrap();
        assert_eq!(out, vec![SttMessage::Partial("Hello wor".to_string())]);
    }

    #[test]
    fn fin_marker_commits_accumulated_text() {
        let mut acc = TokenAccumulator::default();
        acc.ingest(r#"{"tokens":[{"text":"Hello","is_final":true}]}"#)
            .unwrap();
        let out = acc
            .ingest(r#"{"tokens":[{"text":" there","is_final":true},{"text":"<fin>","is_final":true}]}"#)
            .unwrap();
        assert_eq!(out, vec![SttMessage::Committed("Hello there".to_string())]);

        // Next utterance starts clean
        let out = acc
            .ingest(r#"{"tokens":[{"text":"again","is_final":false}]}"#)
            .unwrap();
        assert_eq!(out, vec![SttMessage::Partial("again".to_string())]);
    }

    #[test]
    fn empty_response_yields_nothing() {
        let mut acc = TokenAccumulator::default();
        let out = acc
            .ingest(r#"{"tokens":[],"final_audio_proc_ms":0,"total_audio_proc_ms":120}"#)
            .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn server_error_is_transport_error() {
        let mut acc = TokenAccumulator::default();
        let err = acc
            .ingest(r#"{"error_code":503,"error_message":"service unavailable"}"#)
            .unwrap_err();
        assert!(err.is_transport());
    }

    #[test]
    fn finished_flag_is_tracked() {
        let mut acc = TokenAccumulator::default();
        acc.ingest(r#"{"tokens":[],"finished":true}"#).unwrap();
        assert!(acc.is_finished());
    }

    #[test]
    fn missing_key_is_config_error() {
        let config = SonioxConfig::default();
        assert!(matches!(SonioxStt::new(&config, 16_000), Err(Error::Config(_))));
    }
}
