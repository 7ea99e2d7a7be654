//! Meowko Voice - real-time voice conversation pipeline
//!
//! This library provides the per-channel voice core of the Meowko assistant:
//! - Audio resampling between the voice transport and STT/TTS formats
//! - Streaming speech-to-text and text-to-speech clients
//! - A duration-bounded playback buffer with generation-scoped flushing
//! - The voice session state machine with barge-in
//! - A registry of sessions keyed by voice channel
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │              Voice transport (48 kHz stereo)         │
//! │        capture frames  ▲            │  20ms ticks    │
//! └────────────────────────┼────────────┼────────────────┘
//!                          │            ▼
//! ┌────────────────────────┴─────────────────────────────┐
//! │   SessionRegistry ──▶ VoiceSession (per channel)      │
//! │   Resampler │ Transcription │ Synthesis │ Playback    │
//! └────────────────────┬─────────────────────────────────┘
//!                      │
//! ┌────────────────────▼─────────────────────────────────┐
//! │   Soniox STT  │  ElevenLabs TTS  │  Chat completions  │
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod llm;
pub mod voice;

pub use config::Config;
pub use error::{Error, Result};
pub use llm::{ChatCompletionsResponder, Reply, Responder, ResponseRequest};
pub use voice::{SessionDeps, SessionEvent, SessionRegistry, SessionState, VoiceSession};
