//! Per-channel voice session
//!
//! A session wires capture audio through transcription, hands finished
//! utterances to the [`Responder`], and streams the synthesized reply into its
//! playback buffer. One driver task owns the state machine; every response
//! runs in its own task so the capture path and the output tick never wait on
//! the network.
//!
//! ```text
//! push_audio ─▶ driver ─▶ to_stt ─▶ TranscriptionConnection
//!                 ▲                         │
//!                 └──── TranscriptEvent ◀───┘
//!                 │
//!                 └─▶ response task ─▶ Responder ─▶ SynthesisClient ─▶ to_playback ─▶ PlaybackBuffer ─▶ pull_audio
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use super::frame::{AudioFrame, TRANSPORT_FORMAT};
use super::playback::{FrameSource, PlaybackBuffer, PlaybackFrame, PushOutcome};
use super::resample::Resampler;
use super::stt::{SpeechToText, TranscriptEvent, TranscriptionClient, TranscriptionConnection, UtteranceId};
use super::tts::{GenerationId, PlaybackItem, SynthesisClient, TextToSpeech};
use crate::config::VoiceConfig;
use crate::llm::{Responder, ResponseRequest};
use crate::{Error, Result};

/// Session events buffered for slow subscribers
const EVENT_CAPACITY: usize = 256;

/// Conversation state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Nobody speaking, nothing playing
    Idle,
    /// An utterance is in progress
    Listening,
    /// A reply is being generated, synthesized, or played
    Responding,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Listening => write!(f, "listening"),
            Self::Responding => write!(f, "responding"),
        }
    }
}

/// One user speech turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utterance {
    /// Monotonic per session
    pub id: UtteranceId,
    /// When speech was first detected
    pub started_at: Instant,
    /// When the Final transcript arrived
    pub ended_at: Option<Instant>,
    /// Committed transcript
    pub transcript: String,
}

/// Observable session activity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The state machine moved
    StateChanged(SessionState),
    /// Speech started a new utterance
    UtteranceStarted {
        /// Utterance id
        utterance_id: UtteranceId,
    },
    /// A transcript event from the STT connection
    Transcript(TranscriptEvent),
    /// An utterance received its Final transcript
    UtteranceClosed(Utterance),
    /// No Final arrived in time; the utterance was abandoned
    UtteranceTimedOut {
        /// Utterance id
        utterance_id: UtteranceId,
    },
    /// The STT connection failed mid-utterance; its transcript will never arrive
    UtteranceDiscarded {
        /// Utterance id
        utterance_id: UtteranceId,
    },
    /// The responder produced text for a generation
    ResponseText {
        /// Generation id
        generation: GenerationId,
        /// Raw reply, including directives
        text: String,
    },
    /// A generation finished playing or was delivered as text
    ResponseFinished {
        /// Generation id
        generation: GenerationId,
    },
    /// User speech interrupted a generation
    BargeIn {
        /// The cancelled generation
        generation: GenerationId,
    },
    /// A reply could not be voiced and is delivered as text instead
    TextFallback {
        /// Generation id
        generation: GenerationId,
        /// Text to show the user
        text: String,
        /// Why voice was unavailable
        reason: String,
    },
    /// Transcription is unavailable; the session keeps running without it
    Degraded {
        /// Connection failure
        reason: String,
    },
    /// Transcription is available again
    Recovered,
    /// The session has shut down
    Closed,
}

/// Counters for dropped or rejected audio
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Capture frames dropped because the driver was behind
    pub capture_frames_dropped: u64,
    /// Capture frames rejected for a bad format
    pub invalid_frames: u64,
    /// Frames dropped on the way to the STT service
    pub stt_frames_dropped: u64,
    /// Audio chunks handed to the playback buffer
    pub chunks_queued: u64,
}

/// Collaborators a session needs
#[derive(Clone)]
pub struct SessionDeps {
    /// Speech-to-text provider
    pub stt: Arc<dyn SpeechToText>,
    /// Text-to-speech provider
    pub tts: Arc<dyn TextToSpeech>,
    /// Reply generator
    pub responder: Arc<dyn Responder>,
    /// Pipeline tuning
    pub config: VoiceConfig,
}

/// State shared between the session handle, its driver, and response tasks
struct Shared {
    /// 0 when no generation is active
    active_generation: AtomicU64,
    degraded: AtomicBool,
    capture_dropped: AtomicU64,
    invalid_frames: AtomicU64,
    stt_frames_dropped: AtomicU64,
    chunks_queued: AtomicU64,
    last_activity: Mutex<Instant>,
}

impl Shared {
    fn new() -> Self {
        Self {
            active_generation: AtomicU64::new(0),
            degraded: AtomicBool::new(false),
            capture_dropped: AtomicU64::new(0),
            invalid_frames: AtomicU64::new(0),
            stt_frames_dropped: AtomicU64::new(0),
            chunks_queued: AtomicU64::new(0),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }
}

/// Voice pipeline for one channel
pub struct VoiceSession {
    channel_id: String,
    capture: mpsc::Sender<AudioFrame>,
    played: mpsc::UnboundedSender<GenerationId>,
    state: watch::Receiver<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    playback: Arc<PlaybackBuffer>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl VoiceSession {
    /// Start a session and its driver task
    ///
    /// Must be called inside a Tokio runtime. The STT connection is opened
    /// lazily when speech is first heard.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is unusable
    pub fn spawn(channel_id: impl Into<String>, deps: SessionDeps) -> Result<Self> {
        let channel_id = channel_id.into();
        deps.config.validate()?;
        let config = deps.config;

        let to_stt = Resampler::to_stt(config.stt_sample_rate)?;
        // Fail early if the playback direction cannot be built either
        Resampler::to_playback(config.tts_sample_rate)?;

        let (capture_tx, capture_rx) = mpsc::channel(config.capture_queue_frames);
        let (played_tx, played_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let playback = Arc::new(PlaybackBuffer::new(config.playback_buffer));
        let shared = Arc::new(Shared::new());
        let cancel = CancellationToken::new();

        let driver = Driver {
            channel_id: channel_id.clone(),
            stt: Arc::new(TranscriptionClient::new(
                deps.stt,
                config.stt_connect_timeout,
                config.capture_queue_frames,
            )),
            synth: Arc::new(SynthesisClient::new(
                deps.tts,
                config.tts_sample_rate,
                config.tts_open_timeout,
            )),
            responder: deps.responder,
            to_stt,
            playback: Arc::clone(&playback),
            shared: Arc::clone(&shared),
            state: state_tx,
            events: events.clone(),
            capture: capture_rx,
            played: played_rx,
            cancel: cancel.clone(),
            link: Link::Disconnected,
            reconnecting: false,
            utterance: None,
            timed_out: None,
            speech_deadline: None,
            final_deadline: None,
            next_generation: 0,
            active: None,
            barge_window: Vec::new(),
            config,
        };
        let handle = tokio::spawn(driver.run());

        tracing::info!(channel = %channel_id, "voice session started");

        Ok(Self {
            channel_id,
            capture: capture_tx,
            played: played_tx,
            state: state_rx,
            events,
            playback,
            shared,
            cancel,
            driver: Mutex::new(Some(handle)),
        })
    }

    /// Channel this session serves
    #[must_use]
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// Hand one 48 kHz stereo capture frame to the session
    ///
    /// Never blocks. Returns false if the frame was dropped because the
    /// session is behind or shut down.
    pub fn push_audio(&self, frame: AudioFrame) -> bool {
        match self.capture.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let dropped = self.shared.capture_dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped % 100 == 1 {
                    tracing::warn!(channel = %self.channel_id, dropped, "capture queue full, dropping frames");
                }
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Next 20ms of output audio, or silence
    ///
    /// Call once per output tick. Never blocks.
    #[must_use]
    pub fn pull_audio(&self) -> PlaybackFrame {
        let frame = self.playback.pull();
        if let FrameSource::Generation {
            id,
            end_of_response: true,
        } = frame.source
        {
            let _ = self.played.send(id);
        }
        frame
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Subscribe to session events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Generation currently being produced or played
    #[must_use]
    pub fn active_generation(&self) -> Option<GenerationId> {
        match self.shared.active_generation.load(Ordering::SeqCst) {
            0 => None,
            id => Some(id),
        }
    }

    /// Whether transcription is currently unavailable
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.shared.degraded.load(Ordering::SeqCst)
    }

    /// Audio waiting in the playback buffer
    #[must_use]
    pub fn buffered_audio(&self) -> Duration {
        self.playback.buffered()
    }

    /// Time since the last utterance or response activity
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.shared
            .last_activity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }

    /// Whether the session has been idle for at least `max_idle`
    #[must_use]
    pub fn is_idle_for(&self, max_idle: Duration) -> bool {
        self.state() == SessionState::Idle && self.idle_for() >= max_idle
    }

    /// Snapshot of drop counters
    #[must_use]
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            capture_frames_dropped: self.shared.capture_dropped.load(Ordering::Relaxed),
            invalid_frames: self.shared.invalid_frames.load(Ordering::Relaxed),
            stt_frames_dropped: self.shared.stt_frames_dropped.load(Ordering::Relaxed),
            chunks_queued: self.shared.chunks_queued.load(Ordering::Relaxed),
        }
    }

    /// Stop the session: cancel any response, close the STT connection, and
    /// drop queued playback
    ///
    /// Idempotent.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self
            .driver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    tracing::error!(channel = %self.channel_id, "voice session driver panicked");
                }
            }
        }
    }
}

impl Drop for VoiceSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// STT connection lifecycle as seen by the driver
enum Link {
    /// Not yet needed
    Disconnected,
    Connecting {
        attempt: BoxFuture<'static, Result<TranscriptionConnection>>,
        /// Audio captured while the connection opens
        backlog: VecDeque<AudioFrame>,
        /// Endpoint reached before the connection was ready
        finalize: bool,
        recovering: bool,
    },
    Connected(TranscriptionConnection),
    /// Connecting failed; retried on speech after the cooldown
    Degraded { since: Instant },
}

enum LinkEvent {
    Opened(Result<TranscriptionConnection>),
    Transcript(Option<TranscriptEvent>),
}

struct ActiveResponse {
    generation: GenerationId,
    task: Option<JoinHandle<ResponseOutcome>>,
    /// All audio for the generation is in the playback buffer
    audio_queued: bool,
    /// The end-of-response frame has been pulled
    played: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseOutcome {
    /// Audio is queued; done once it has played
    Queued,
    /// Delivered as text only
    TextOnly,
    /// Nothing speakable in the reply
    Silent,
    /// The generation was flushed while producing
    Cancelled,
}

struct Driver {
    channel_id: String,
    config: VoiceConfig,
    stt: Arc<TranscriptionClient>,
    synth: Arc<SynthesisClient>,
    responder: Arc<dyn Responder>,
    to_stt: Resampler,
    playback: Arc<PlaybackBuffer>,
    shared: Arc<Shared>,
    state: watch::Sender<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    capture: mpsc::Receiver<AudioFrame>,
    played: mpsc::UnboundedReceiver<GenerationId>,
    cancel: CancellationToken,

    link: Link,
    /// The live connection replaced a failed one and has not yet delivered a transcript
    reconnecting: bool,
    utterance: Option<Utterance>,
    /// Latest utterance abandoned for lack of a Final
    timed_out: Option<UtteranceId>,
    speech_deadline: Option<tokio::time::Instant>,
    final_deadline: Option<tokio::time::Instant>,
    next_generation: GenerationId,
    active: Option<ActiveResponse>,
    /// Transcript events seen since the active generation started
    barge_window: Vec<TranscriptEvent>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                frame = self.capture.recv() => match frame {
                    Some(frame) => self.on_capture(&frame),
                    None => break,
                },
                event = poll_link(&mut self.link) => self.on_link(event),
                (generation, result) = join_response(&mut self.active) => {
                    self.on_response_done(generation, result);
                }
                Some(generation) = self.played.recv() => self.on_played(generation),
                () = sleep_until(self.speech_deadline) => self.on_endpoint(),
                () = sleep_until(self.final_deadline) => self.on_final_timeout(),
            }
        }
        self.teardown().await;
    }

    fn current_state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: SessionState) {
        let changed = self.state.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            tracing::debug!(channel = %self.channel_id, state = %next, "session state changed");
            self.emit(SessionEvent::StateChanged(next));
        }
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn on_capture(&mut self, frame: &AudioFrame) {
        let mono = match self.to_stt.process(frame) {
            Ok(mono) => mono,
            Err(e) => {
                let invalid = self.shared.invalid_frames.fetch_add(1, Ordering::Relaxed) + 1;
                if invalid % 50 == 1 {
                    tracing::warn!(channel = %self.channel_id, invalid, error = %e, "dropping invalid capture frame");
                }
                return;
            }
        };

        let speech = frame.rms() >= self.config.speech_threshold;
        if speech {
            self.on_speech();
        }
        if mono.is_empty() {
            return;
        }

        match &mut self.link {
            Link::Connected(conn) => {
                conn.send(mono);
                self.shared
                    .stt_frames_dropped
                    .store(self.stt.frames_dropped(), Ordering::Relaxed);
            }
            Link::Connecting { backlog, .. } => {
                if backlog.len() >= self.config.capture_queue_frames {
                    backlog.pop_front();
                    self.shared.stt_frames_dropped.fetch_add(1, Ordering::Relaxed);
                }
                backlog.push_back(mono);
            }
            Link::Disconnected | Link::Degraded { .. } => {}
        }
    }

    fn on_speech(&mut self) {
        let wants_connect = match &self.link {
            Link::Disconnected => true,
            Link::Degraded { since } => since.elapsed() >= self.config.stt_retry_cooldown,
            Link::Connecting { .. } | Link::Connected(_) => false,
        };
        if wants_connect {
            self.begin_connect();
        }

        if self.current_state() == SessionState::Idle {
            self.start_utterance();
        }
        self.speech_deadline = Some(tokio::time::Instant::now() + self.config.endpointing);
        self.final_deadline = None;
    }

    fn begin_connect(&mut self) {
        let recovering = matches!(self.link, Link::Degraded { .. });
        if recovering {
            self.reconnecting = true;
        }
        let client = Arc::clone(&self.stt);
        let session_id = self.channel_id.clone();
        tracing::debug!(channel = %self.channel_id, recovering, "opening transcription stream");

        self.link = Link::Connecting {
            attempt: async move { client.open(&session_id).await }.boxed(),
            backlog: VecDeque::new(),
            finalize: false,
            recovering,
        };
    }

    fn on_link(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Opened(Ok(conn)) => {
                let previous = std::mem::replace(&mut self.link, Link::Disconnected);
                if let Link::Connecting {
                    backlog,
                    finalize,
                    recovering,
                    ..
                } = previous
                {
                    for frame in backlog {
                        conn.send(frame);
                    }
                    if finalize {
                        conn.finalize();
                    }
                    if recovering {
                        self.shared.degraded.store(false, Ordering::SeqCst);
                        tracing::info!(channel = %self.channel_id, "transcription recovered");
                        self.emit(SessionEvent::Recovered);
                    }
                }
                self.link = Link::Connected(conn);
            }
            LinkEvent::Opened(Err(e)) => self.degrade(&e.to_string()),
            LinkEvent::Transcript(Some(event)) => self.on_transcript(event),
            LinkEvent::Transcript(None) => {
                tracing::debug!(channel = %self.channel_id, "transcription stream ended");
                self.link = Link::Disconnected;
                self.reconnecting = false;
            }
        }
    }

    /// Give up on transcription until speech after the retry cooldown
    fn degrade(&mut self, reason: &str) {
        tracing::warn!(channel = %self.channel_id, reason, "transcription unavailable, continuing without it");
        self.reconnecting = false;
        self.link = Link::Degraded {
            since: Instant::now(),
        };
        self.shared.degraded.store(true, Ordering::SeqCst);
        self.emit(SessionEvent::Degraded {
            reason: reason.to_string(),
        });
    }

    fn on_transcript(&mut self, event: TranscriptEvent) {
        self.emit(SessionEvent::Transcript(event.clone()));
        if !matches!(event, TranscriptEvent::StreamFailed { .. }) {
            self.reconnecting = false;
        }

        match event {
            TranscriptEvent::StreamFailed { reason } => self.on_stream_failed(&reason),
            TranscriptEvent::Interim { text } => match self.current_state() {
                SessionState::Idle => {
                    self.start_utterance();
                    self.speech_deadline = Some(tokio::time::Instant::now() + self.config.endpointing);
                }
                SessionState::Listening => {
                    if let Some(utterance) = self.utterance.as_mut() {
                        utterance.transcript = text;
                    }
                }
                SessionState::Responding => {
                    self.barge_window.push(TranscriptEvent::Interim { text });
                    if self.config.barge_in.should_barge_in(&self.barge_window) {
                        self.barge_in();
                    }
                }
            },
            TranscriptEvent::Final { text, utterance_id } => {
                if self.timed_out.is_some_and(|id| utterance_id <= id) {
                    tracing::debug!(channel = %self.channel_id, utterance_id, "late final transcript for abandoned utterance ignored");
                    return;
                }
                if self.current_state() == SessionState::Responding {
                    self.barge_window.push(TranscriptEvent::Final {
                        text: text.clone(),
                        utterance_id,
                    });
                    if !self.config.barge_in.should_barge_in(&self.barge_window) {
                        tracing::debug!(channel = %self.channel_id, utterance_id, "final transcript ignored while responding");
                        return;
                    }
                    // The Final is the interrupting utterance itself
                    if self.interrupt() {
                        self.open_utterance(utterance_id);
                    }
                }
                self.complete_utterance(text, utterance_id);
            }
        }
    }

    fn on_stream_failed(&mut self, reason: &str) {
        if let Link::Connected(mut conn) = std::mem::replace(&mut self.link, Link::Disconnected) {
            tokio::spawn(async move { conn.close().await });
        }

        if self.current_state() == SessionState::Listening {
            if let Some(utterance) = self.utterance.take() {
                self.stt.utterances().discard();
                tracing::info!(channel = %self.channel_id, utterance_id = utterance.id, "discarding in-flight utterance");
                self.emit(SessionEvent::UtteranceDiscarded {
                    utterance_id: utterance.id,
                });
            }
            self.speech_deadline = None;
            self.final_deadline = None;
            self.set_state(SessionState::Idle);
        }

        if self.reconnecting {
            self.degrade(reason);
            return;
        }
        tracing::warn!(channel = %self.channel_id, reason, "transcription stream failed, reconnecting");
        self.reconnecting = true;
        self.begin_connect();
    }

    fn on_endpoint(&mut self) {
        self.speech_deadline = None;
        match &mut self.link {
            Link::Connected(conn) => conn.finalize(),
            Link::Connecting { finalize, .. } => *finalize = true,
            Link::Disconnected | Link::Degraded { .. } => {}
        }
        if self.current_state() == SessionState::Listening {
            self.final_deadline = Some(tokio::time::Instant::now() + self.config.final_timeout);
        }
    }

    fn on_final_timeout(&mut self) {
        self.final_deadline = None;
        if self.current_state() != SessionState::Listening {
            return;
        }
        if let Some(utterance) = self.utterance.take() {
            tracing::debug!(channel = %self.channel_id, utterance_id = utterance.id, "no transcript for utterance, closing it");
            self.timed_out = Some(utterance.id);
            self.emit(SessionEvent::UtteranceTimedOut {
                utterance_id: utterance.id,
            });
        }
        self.set_state(SessionState::Idle);
    }

    fn start_utterance(&mut self) {
        self.open_utterance(self.stt.utterances().current());
    }

    fn open_utterance(&mut self, id: UtteranceId) {
        self.utterance = Some(Utterance {
            id,
            started_at: Instant::now(),
            ended_at: None,
            transcript: String::new(),
        });
        self.shared.touch();
        self.emit(SessionEvent::UtteranceStarted { utterance_id: id });
        self.set_state(SessionState::Listening);
    }

    fn complete_utterance(&mut self, text: String, utterance_id: UtteranceId) {
        let mut utterance = self.utterance.take().unwrap_or_else(|| Utterance {
            id: utterance_id,
            started_at: Instant::now(),
            ended_at: None,
            transcript: String::new(),
        });
        utterance.id = utterance_id;
        utterance.ended_at = Some(Instant::now());
        utterance.transcript.clone_from(&text);

        self.speech_deadline = None;
        self.final_deadline = None;
        self.emit(SessionEvent::UtteranceClosed(utterance));
        self.start_response(text, utterance_id);
    }

    fn start_response(&mut self, transcript: String, utterance_id: UtteranceId) {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.shared.active_generation.store(generation, Ordering::SeqCst);
        self.barge_window.clear();

        tracing::info!(channel = %self.channel_id, generation, utterance_id, "responding");

        let job = ResponseJob {
            request: ResponseRequest {
                channel_id: self.channel_id.clone(),
                utterance_id,
                transcript,
            },
            generation,
            responder: Arc::clone(&self.responder),
            synth: Arc::clone(&self.synth),
            playback: Arc::clone(&self.playback),
            events: self.events.clone(),
            shared: Arc::clone(&self.shared),
            llm_timeout: self.config.llm_timeout,
            tts_sample_rate: self.config.tts_sample_rate,
            apology_text: self.config.apology_text.clone(),
        };
        self.active = Some(ActiveResponse {
            generation,
            task: Some(tokio::spawn(job.run())),
            audio_queued: false,
            played: false,
        });
        self.set_state(SessionState::Responding);
    }

    /// Interrupt the active generation, then listen for the rest of the
    /// interrupting utterance
    fn barge_in(&mut self) {
        if self.interrupt() {
            self.start_utterance();
            self.speech_deadline = Some(tokio::time::Instant::now() + self.config.endpointing);
        }
    }

    /// Cancel synthesis, flush playback, and stop the response task
    ///
    /// Returns false if no generation was active.
    fn interrupt(&mut self) -> bool {
        let Some(active) = self.active.take() else {
            return false;
        };
        let generation = active.generation;

        self.synth.cancel(generation);
        let dropped = self.playback.flush(generation);
        if let Some(task) = active.task {
            task.abort();
        }
        self.shared.active_generation.store(0, Ordering::SeqCst);
        self.barge_window.clear();

        tracing::info!(channel = %self.channel_id, generation, dropped, "barge-in");
        self.emit(SessionEvent::BargeIn { generation });
        true
    }

    fn on_response_done(
        &mut self,
        generation: GenerationId,
        result: std::result::Result<ResponseOutcome, JoinError>,
    ) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if active.generation != generation {
            return;
        }
        active.task = None;

        let finished = match result {
            Ok(ResponseOutcome::Queued) => {
                active.audio_queued = true;
                active.played
            }
            Ok(ResponseOutcome::TextOnly | ResponseOutcome::Silent | ResponseOutcome::Cancelled) => true,
            Err(e) => {
                if e.is_panic() {
                    tracing::error!(channel = %self.channel_id, generation, "response task panicked");
                }
                true
            }
        };
        if finished {
            self.finish_response();
        }
    }

    fn on_played(&mut self, generation: GenerationId) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if active.generation != generation {
            return;
        }
        active.played = true;
        if active.audio_queued {
            self.finish_response();
        }
    }

    fn finish_response(&mut self) {
        if let Some(active) = self.active.take() {
            self.shared.active_generation.store(0, Ordering::SeqCst);
            self.shared.touch();
            tracing::debug!(channel = %self.channel_id, generation = active.generation, "response finished");
            self.emit(SessionEvent::ResponseFinished {
                generation: active.generation,
            });
        }
        self.set_state(SessionState::Idle);
    }

    async fn teardown(mut self) {
        if let Some(active) = self.active.take() {
            self.synth.cancel(active.generation);
            if let Some(task) = active.task {
                task.abort();
            }
        }
        self.synth.cancel_all();
        self.playback.close();
        self.shared.active_generation.store(0, Ordering::SeqCst);

        if let Link::Connected(mut conn) = std::mem::replace(&mut self.link, Link::Disconnected) {
            conn.close().await;
        }

        self.set_state(SessionState::Idle);
        self.emit(SessionEvent::Closed);
        tracing::info!(channel = %self.channel_id, "voice session closed");
    }
}

async fn poll_link(link: &mut Link) -> LinkEvent {
    match link {
        Link::Connecting { attempt, .. } => LinkEvent::Opened(attempt.await),
        Link::Connected(conn) => LinkEvent::Transcript(conn.next_event().await),
        Link::Disconnected | Link::Degraded { .. } => std::future::pending().await,
    }
}

async fn join_response(
    active: &mut Option<ActiveResponse>,
) -> (GenerationId, std::result::Result<ResponseOutcome, JoinError>) {
    let running = active.as_mut().and_then(|a| {
        let generation = a.generation;
        a.task.as_mut().map(|task| (generation, task))
    });
    match running {
        Some((generation, task)) => (generation, task.await),
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Everything one generation needs, moved into its task
struct ResponseJob {
    request: ResponseRequest,
    generation: GenerationId,
    responder: Arc<dyn Responder>,
    synth: Arc<SynthesisClient>,
    playback: Arc<PlaybackBuffer>,
    events: broadcast::Sender<SessionEvent>,
    shared: Arc<Shared>,
    llm_timeout: Duration,
    tts_sample_rate: u32,
    apology_text: String,
}

impl ResponseJob {
    async fn run(self) -> ResponseOutcome {
        let generation = self.generation;

        let reply = match tokio::time::timeout(self.llm_timeout, self.responder.respond(self.request.clone())).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                tracing::warn!(generation, error = %e, "responder failed");
                self.fallback(self.apology_text.clone(), &e);
                return ResponseOutcome::TextOnly;
            }
            Err(_) => {
                let e = Error::timeout("LLM call", self.llm_timeout);
                tracing::warn!(generation, error = %e, "responder timed out");
                self.fallback(self.apology_text.clone(), &e);
                return ResponseOutcome::TextOnly;
            }
        };

        let _ = self.events.send(SessionEvent::ResponseText {
            generation,
            text: reply.text.clone(),
        });

        let voice = reply.voice_text();
        if voice.is_empty() {
            tracing::warn!(generation, "reply has no speakable text, skipping synthesis");
            return ResponseOutcome::Silent;
        }

        match self.speak(voice.clone()).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancellation() => ResponseOutcome::Cancelled,
            Err(e) => {
                // Partial audio would be confusing next to the text fallback
                self.playback.flush(generation);
                self.fallback(voice, &e);
                ResponseOutcome::TextOnly
            }
        }
    }

    async fn speak(&self, text: String) -> Result<ResponseOutcome> {
        let generation = self.generation;
        let mut resampler = Resampler::to_playback(self.tts_sample_rate)?;
        let mut stream = self.synth.synthesize(generation, text);
        let mut sequence = 0;

        while let Some(item) = stream.next().await {
            let item = item?;
            let mut audio = resampler.process(&item.audio)?;
            if item.end_of_response {
                let tail = resampler.finish()?;
                if !tail.is_empty() {
                    audio = AudioFrame::new([audio.data(), tail.data()].concat(), TRANSPORT_FORMAT)?;
                }
            }
            if audio.is_empty() && !item.end_of_response {
                continue;
            }

            let outcome = self
                .playback
                .push(PlaybackItem {
                    generation,
                    sequence,
                    audio,
                    end_of_response: item.end_of_response,
                })
                .await?;
            if outcome == PushOutcome::Discarded {
                return Ok(ResponseOutcome::Cancelled);
            }
            self.shared.chunks_queued.fetch_add(1, Ordering::Relaxed);
            sequence += 1;

            if item.end_of_response {
                return Ok(ResponseOutcome::Queued);
            }
        }

        Err(Error::SynthesisFailed(
            "synthesis ended without a final chunk".to_string(),
        ))
    }

    fn fallback(&self, text: String, cause: &Error) {
        let _ = self.events.send(SessionEvent::TextFallback {
            generation: self.generation,
            text,
            reason: cause.to_string(),
        });
    }
}
