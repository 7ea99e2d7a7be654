//! Real-time voice pipeline
//!
//! Capture audio is resampled and streamed to speech-to-text, finished
//! utterances go to the responder, and replies are synthesized, resampled, and
//! queued for the output tick. See [`VoiceSession`] for the state machine and
//! [`SessionRegistry`] for the per-channel lifecycle.

mod barge_in;
mod frame;
mod playback;
mod registry;
mod resample;
mod session;
pub mod stt;
pub mod tts;
pub mod wav;

pub use barge_in::BargeInPolicy;
pub use frame::{
    AudioFormat, AudioFrame, BYTES_PER_SAMPLE, FRAME_DURATION, TRANSPORT_CHANNELS, TRANSPORT_FORMAT,
    TRANSPORT_SAMPLE_RATE,
};
pub use playback::{FrameSource, PlaybackBuffer, PlaybackFrame, PushOutcome};
pub use registry::{LifecycleEvent, SessionRegistry};
pub use resample::{Direction, Resampler};
pub use session::{SessionDeps, SessionEvent, SessionState, SessionStats, Utterance, VoiceSession};
pub use stt::{
    SonioxStt, SpeechToText, SttChannel, SttMessage, SttSink, TranscriptEvent, TranscriptionClient,
    TranscriptionConnection, UtteranceCounter, UtteranceId,
};
pub use tts::{ElevenLabsTts, GenerationId, PlaybackItem, SynthesisClient, SynthesisStream, TextToSpeech};
