//! Text generation collaborator
//!
//! The voice session hands each finished utterance to a [`Responder`] and
//! speaks whatever comes back. Replies may carry out-of-band directives that
//! must not be read aloud; [`voice_text`] removes them.

mod chat;

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;

use crate::Result;
use crate::voice::UtteranceId;

pub use chat::ChatCompletionsResponder;

/// Image-generation blocks, dropped entirely
static TTI_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\[tti\].*?\[/tti\]").expect("valid regex"));

/// Speech markup tags, dropped but their content kept
static TTS_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[/?tts\]").expect("valid regex"));

/// One finished user utterance to respond to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseRequest {
    /// Voice channel the session belongs to
    pub channel_id: String,
    /// Utterance being answered
    pub utterance_id: UtteranceId,
    /// Committed transcript
    pub transcript: String,
}

/// Generated response text, possibly with directives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Raw text as produced by the model
    pub text: String,
}

impl Reply {
    /// The part of the reply meant to be spoken
    #[must_use]
    pub fn voice_text(&self) -> String {
        voice_text(&self.text)
    }
}

/// Produces the assistant's reply to an utterance
///
/// Called once per finalized utterance. The session bounds every call with
/// its own timeout.
#[async_trait]
pub trait Responder: Send + Sync {
    /// Generate a reply
    async fn respond(&self, request: ResponseRequest) -> Result<Reply>;
}

/// Strip directives from model output, leaving speakable text
#[must_use]
pub fn voice_text(raw: &str) -> String {
    let text = TTI_BLOCK.replace_all(raw, "");
    let text = TTS_TAG.replace_all(&text, "");
    text.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_blocks_are_removed() {
        assert_eq!(
            voice_text("Here you go! [tti]a cat\non a sofa[/tti] Enjoy."),
            "Here you go!  Enjoy."
        );
    }

    #[test]
    fn speech_tags_keep_content() {
        assert_eq!(voice_text("[tts]Nyaa~[/tts] hello"), "Nyaa~ hello");
    }

    #[test]
    fn only_directives_leaves_nothing() {
        assert!(voice_text("  [tti]sunset[/tti]  ").is_empty());
        let reply = Reply {
            text: "[tti]x[/tti]".to_string(),
        };
        assert!(reply.voice_text().is_empty());
    }
}
