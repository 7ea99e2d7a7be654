//! Shared test utilities: scripted providers and session helpers

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::channel::mpsc as stream_mpsc;
use futures::stream::BoxStream;
use tokio::sync::{broadcast, mpsc};

use meowko_voice::config::VoiceConfig;
use meowko_voice::voice::{
    AudioFrame, FRAME_DURATION, SessionDeps, SessionEvent, SessionState, SpeechToText, SttChannel,
    SttMessage, SttSink, TRANSPORT_FORMAT, TextToSpeech, VoiceSession,
};
use meowko_voice::{Error, Reply, Responder, ResponseRequest, Result};

/// Handle on one fake STT connection
pub struct SttController {
    messages: stream_mpsc::UnboundedSender<Result<SttMessage>>,
    pub audio_frames: Arc<AtomicUsize>,
    pub finalizes: Arc<AtomicUsize>,
}

impl SttController {
    pub fn partial(&self, text: &str) {
        let _ = self.messages.unbounded_send(Ok(SttMessage::Partial(text.to_string())));
    }

    pub fn commit(&self, text: &str) {
        let _ = self.messages.unbounded_send(Ok(SttMessage::Committed(text.to_string())));
    }

    pub fn fail(&self, reason: &str) {
        let _ = self.messages.unbounded_send(Err(Error::Transport(reason.to_string())));
    }
}

struct FakeSink {
    audio_frames: Arc<AtomicUsize>,
    finalizes: Arc<AtomicUsize>,
}

#[async_trait]
impl SttSink for FakeSink {
    async fn send_audio(&mut self, _pcm: Vec<u8>) -> Result<()> {
        self.audio_frames.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn finalize(&mut self) -> Result<()> {
        self.finalizes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&mut self) {}
}

/// STT provider whose connections are driven by the test
pub struct FakeStt {
    controllers: Mutex<mpsc::UnboundedSender<SttController>>,
    /// Upcoming connection attempts that should fail
    pub failing_connects: AtomicUsize,
    /// Accept connections, then reject the stream straight away
    pub rejecting_streams: AtomicBool,
    pub connects: AtomicUsize,
}

impl FakeStt {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<SttController>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let stt = Arc::new(Self {
            controllers: Mutex::new(tx),
            failing_connects: AtomicUsize::new(0),
            rejecting_streams: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
        });
        (stt, rx)
    }
}

#[async_trait]
impl SpeechToText for FakeStt {
    async fn connect(&self, _session_id: &str) -> Result<SttChannel> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_connects.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_connects.store(failing - 1, Ordering::SeqCst);
            return Err(Error::Transport("connection refused".to_string()));
        }

        let (tx, rx) = stream_mpsc::unbounded();
        let audio_frames = Arc::new(AtomicUsize::new(0));
        let finalizes = Arc::new(AtomicUsize::new(0));
        let controller = SttController {
            messages: tx,
            audio_frames: Arc::clone(&audio_frames),
            finalizes: Arc::clone(&finalizes),
        };
        if self.rejecting_streams.load(Ordering::SeqCst) {
            controller.fail("401 invalid api key");
        }
        let _ = self.controllers.lock().unwrap().send(controller);

        Ok(SttChannel {
            sink: Box::new(FakeSink {
                audio_frames,
                finalizes,
            }),
            events: rx.boxed(),
        })
    }
}

/// How the fake TTS behaves
#[derive(Debug, Clone, Copy)]
pub enum TtsScript {
    /// Produce `count` 20ms chunks, then end
    Chunks(usize),
    /// Produce `count` chunks, then stall without ending
    ChunksThenStall(usize),
    /// Never finish opening the stream
    NeverOpens,
}

/// TTS provider producing 24 kHz mono tone chunks
pub struct FakeTts {
    script: TtsScript,
    pub opened: AtomicUsize,
}

impl FakeTts {
    pub fn new(script: TtsScript) -> Arc<Self> {
        Arc::new(Self {
            script,
            opened: AtomicUsize::new(0),
        })
    }
}

fn tts_chunk(index: usize) -> Vec<u8> {
    // 20ms at 24 kHz mono
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    let value = (1000 * (index + 1)) as i16;
    std::iter::repeat_n(value.to_le_bytes(), 480).flatten().collect()
}

#[async_trait]
impl TextToSpeech for FakeTts {
    async fn stream(&self, _text: &str) -> Result<BoxStream<'static, Result<Vec<u8>>>> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        match self.script {
            TtsScript::Chunks(count) => Ok(futures::stream::iter((0..count).map(|i| Ok(tts_chunk(i)))).boxed()),
            TtsScript::ChunksThenStall(count) => Ok(futures::stream::iter((0..count).map(|i| Ok(tts_chunk(i))))
                .chain(futures::stream::pending())
                .boxed()),
            TtsScript::NeverOpens => {
                futures::future::pending::<()>().await;
                Err(Error::Tts("unreachable".to_string()))
            }
        }
    }
}

/// Responder returning a fixed reply, optionally never answering
pub struct FakeResponder {
    reply: Option<String>,
    pub requests: Mutex<Vec<ResponseRequest>>,
}

impl FakeResponder {
    pub fn replying(text: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: Some(text.to_string()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn stalled() -> Arc<Self> {
        Arc::new(Self {
            reply: None,
            requests: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Responder for FakeResponder {
    async fn respond(&self, request: ResponseRequest) -> Result<Reply> {
        self.requests.lock().unwrap().push(request);
        match &self.reply {
            Some(text) => Ok(Reply { text: text.clone() }),
            None => {
                futures::future::pending::<()>().await;
                Err(Error::Llm("unreachable".to_string()))
            }
        }
    }
}

/// Voice config with timeouts short enough for tests
pub fn test_config() -> VoiceConfig {
    VoiceConfig {
        stt_sample_rate: 16_000,
        tts_sample_rate: 24_000,
        endpointing: Duration::from_millis(50),
        final_timeout: Duration::from_millis(500),
        stt_connect_timeout: Duration::from_millis(500),
        tts_open_timeout: Duration::from_millis(100),
        llm_timeout: Duration::from_millis(200),
        stt_retry_cooldown: Duration::from_millis(100),
        ..VoiceConfig::default()
    }
}

pub fn deps(stt: Arc<FakeStt>, tts: Arc<FakeTts>, responder: Arc<FakeResponder>) -> SessionDeps {
    deps_with(stt, tts, responder, test_config())
}

pub fn deps_with(
    stt: Arc<FakeStt>,
    tts: Arc<FakeTts>,
    responder: Arc<FakeResponder>,
    config: VoiceConfig,
) -> SessionDeps {
    SessionDeps {
        stt,
        tts,
        responder,
        config,
    }
}

/// A 20ms capture frame well above the speech threshold
pub fn loud_frame() -> AudioFrame {
    AudioFrame::from_samples(&[8000; 1920], TRANSPORT_FORMAT)
}

pub fn quiet_frame() -> AudioFrame {
    AudioFrame::silence(TRANSPORT_FORMAT, FRAME_DURATION)
}

pub async fn next_controller(conns: &mut mpsc::UnboundedReceiver<SttController>) -> SttController {
    tokio::time::timeout(Duration::from_secs(2), conns.recv())
        .await
        .expect("no STT connection opened")
        .expect("controller channel closed")
}

pub async fn wait_for_state(session: &VoiceSession, state: SessionState) {
    let mut rx = session.watch_state();
    tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("session never reached {state}, stuck in {}", session.state()))
        .expect("session state channel closed");
}

/// Wait for the first event matching `pred`
pub async fn wait_for_event(
    events: &mut broadcast::Receiver<SessionEvent>,
    pred: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("expected session event never arrived")
}

/// Every event up to and including the first one matching `pred`
pub async fn collect_until(
    events: &mut broadcast::Receiver<SessionEvent>,
    pred: impl Fn(&SessionEvent) -> bool,
) -> Vec<SessionEvent> {
    tokio::time::timeout(Duration::from_secs(2), async {
        let mut seen = Vec::new();
        loop {
            match events.recv().await {
                Ok(event) => {
                    let done = pred(&event);
                    seen.push(event);
                    if done {
                        return seen;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("expected session event never arrived")
}

/// Everything already emitted, without waiting
pub fn drain_events(events: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}
