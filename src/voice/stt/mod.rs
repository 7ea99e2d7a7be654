//! Streaming speech-to-text
//!
//! [`SpeechToText`] is the provider seam: one bidirectional stream per
//! connection. [`TranscriptionClient`] adapts it into a non-blocking capture
//! sink plus an ordered sequence of [`TranscriptEvent`]s.

mod soniox;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::frame::AudioFrame;
use crate::{Error, Result};

pub use soniox::{SonioxStt, TokenAccumulator};

/// Identifier of one user speech turn, monotonic per session
pub type UtteranceId = u64;

/// Transcript event delivered to the voice session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptEvent {
    /// Provisional text for the utterance in progress; advisory only
    Interim {
        /// Current hypothesis
        text: String,
    },
    /// Committed text for a finished utterance; emitted at most once per id
    Final {
        /// Committed transcript
        text: String,
        /// Utterance this transcript closes
        utterance_id: UtteranceId,
    },
    /// The connection failed; no further events follow on it
    StreamFailed {
        /// Human-readable cause
        reason: String,
    },
}

/// Message produced by an STT provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SttMessage {
    /// Provisional hypothesis
    Partial(String),
    /// Committed text for the utterance ended by `finalize`
    Committed(String),
}

/// Outbound half of a provider connection
#[async_trait]
pub trait SttSink: Send {
    /// Send mono s16le PCM at the provider's configured rate
    async fn send_audio(&mut self, pcm: Vec<u8>) -> Result<()>;

    /// Ask the provider to commit the current utterance
    async fn finalize(&mut self) -> Result<()>;

    /// Close the connection; errors are swallowed
    async fn close(&mut self);
}

/// An open provider connection, split into its two directions
pub struct SttChannel {
    /// Audio and control messages to the provider
    pub sink: Box<dyn SttSink>,
    /// Provider messages in the order the service emitted them
    pub events: BoxStream<'static, Result<SttMessage>>,
}

/// Streaming speech-to-text provider
#[async_trait]
pub trait SpeechToText: Send + Sync {
    /// Open a new streaming connection
    async fn connect(&self, session_id: &str) -> Result<SttChannel>;
}

/// Per-session utterance counter shared by every connection the session opens
#[derive(Debug, Clone, Default)]
pub struct UtteranceCounter(Arc<AtomicU64>);

impl UtteranceCounter {
    /// Id the next Final transcript will carry
    #[must_use]
    pub fn current(&self) -> UtteranceId {
        self.0.load(Ordering::SeqCst)
    }

    /// Claim the current id for a Final transcript
    fn commit(&self) -> UtteranceId {
        self.0.fetch_add(1, Ordering::SeqCst)
    }

    /// Retire the current id without a Final, so a discarded utterance never resurfaces
    pub fn discard(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// Opens transcription connections for one session
pub struct TranscriptionClient {
    provider: Arc<dyn SpeechToText>,
    connect_timeout: Duration,
    queue_frames: usize,
    utterances: UtteranceCounter,
    frames_dropped: Arc<AtomicU64>,
}

impl TranscriptionClient {
    /// Create a client over a provider
    #[must_use]
    pub fn new(provider: Arc<dyn SpeechToText>, connect_timeout: Duration, queue_frames: usize) -> Self {
        Self {
            provider,
            connect_timeout,
            queue_frames: queue_frames.max(1),
            utterances: UtteranceCounter::default(),
            frames_dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Open a connection, bounded by the connect timeout
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if the provider does not connect in time, or the
    /// provider's connection error
    pub async fn open(&self, session_id: &str) -> Result<TranscriptionConnection> {
        let channel = tokio::time::timeout(self.connect_timeout, self.provider.connect(session_id))
            .await
            .map_err(|_| Error::timeout("STT connect", self.connect_timeout))??;

        tracing::debug!(session_id, "transcription stream connected");
        Ok(TranscriptionConnection::spawn(
            channel,
            self.queue_frames,
            self.utterances.clone(),
            Arc::clone(&self.frames_dropped),
        ))
    }

    /// Utterance ids shared with the session
    #[must_use]
    pub const fn utterances(&self) -> &UtteranceCounter {
        &self.utterances
    }

    /// Frames dropped because the outgoing queue was full
    #[must_use]
    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }
}

enum Outgoing {
    Audio(AudioFrame),
    Finalize,
}

/// Bounded drop-oldest queue between capture and the provider writer
struct Outbound {
    queue: Mutex<VecDeque<Outgoing>>,
    notify: Notify,
    bound: usize,
    dropped: Arc<AtomicU64>,
}

impl Outbound {
    fn push(&self, item: Outgoing) {
        {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            if matches!(item, Outgoing::Audio(_)) {
                let audio = queue
                    .iter()
                    .filter(|i| matches!(i, Outgoing::Audio(_)))
                    .count();
                if audio >= self.bound {
                    if let Some(pos) = queue.iter().position(|i| matches!(i, Outgoing::Audio(_))) {
                        queue.remove(pos);
                        let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                        if total % 50 == 1 {
                            tracing::warn!(dropped = total, "STT send queue full, dropping oldest frames");
                        }
                    }
                }
            }
            queue.push_back(item);
        }
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Outgoing> {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }
}

/// Failure reporting shared by the writer and reader tasks
struct FailureGate {
    failed: AtomicBool,
    events: mpsc::Sender<TranscriptEvent>,
    stop: CancellationToken,
}

impl FailureGate {
    async fn fail(&self, reason: String) {
        if !self.failed.swap(true, Ordering::SeqCst) {
            tracing::warn!(reason = %reason, "transcription stream failed");
            let _ = self.events.send(TranscriptEvent::StreamFailed { reason }).await;
        }
        self.stop.cancel();
    }
}

/// One open transcription connection
///
/// Dropping the connection stops its tasks; prefer [`close`](Self::close) so the
/// provider sees a clean shutdown.
pub struct TranscriptionConnection {
    outbound: Arc<Outbound>,
    events: mpsc::Receiver<TranscriptEvent>,
    stop: CancellationToken,
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

impl TranscriptionConnection {
    fn spawn(
        channel: SttChannel,
        bound: usize,
        utterances: UtteranceCounter,
        dropped: Arc<AtomicU64>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(256);
        let stop = CancellationToken::new();
        let outbound = Arc::new(Outbound {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            bound,
            dropped,
        });
        let gate = Arc::new(FailureGate {
            failed: AtomicBool::new(false),
            events: tx.clone(),
            stop: stop.clone(),
        });

        let writer = tokio::spawn(run_writer(
            channel.sink,
            Arc::clone(&outbound),
            Arc::clone(&gate),
            stop.clone(),
        ));
        let reader = tokio::spawn(run_reader(channel.events, tx, utterances, gate, stop.clone()));

        Self {
            outbound,
            events: rx,
            stop,
            writer: Some(writer),
            reader: Some(reader),
        }
    }

    /// Queue audio for the provider; never blocks
    ///
    /// When the queue is full the oldest unsent frame is dropped.
    pub fn send(&self, frame: AudioFrame) {
        if self.stop.is_cancelled() {
            return;
        }
        self.outbound.push(Outgoing::Audio(frame));
    }

    /// Ask the provider to commit the utterance in progress
    pub fn finalize(&self) {
        if self.stop.is_cancelled() {
            return;
        }
        self.outbound.push(Outgoing::Finalize);
    }

    /// Next transcript event, or `None` once the connection has ended
    pub async fn next_event(&mut self) -> Option<TranscriptEvent> {
        self.events.recv().await
    }

    /// Whether the connection is still usable
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.stop.is_cancelled()
    }

    /// Stop both directions and close the provider connection
    pub async fn close(&mut self) {
        self.stop.cancel();
        if let Some(writer) = self.writer.take() {
            if tokio::time::timeout(Duration::from_secs(2), writer).await.is_err() {
                tracing::warn!("STT writer did not shut down in time");
            }
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        tracing::debug!("transcription stream closed");
    }
}

impl Drop for TranscriptionConnection {
    fn drop(&mut self) {
        self.stop.cancel();
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

async fn run_writer(
    mut sink: Box<dyn SttSink>,
    outbound: Arc<Outbound>,
    gate: Arc<FailureGate>,
    stop: CancellationToken,
) {
    let mut sent: u64 = 0;
    loop {
        let Some(item) = outbound.pop() else {
            tokio::select! {
                () = stop.cancelled() => break,
                () = outbound.notify.notified() => {}
            }
            continue;
        };
        if stop.is_cancelled() {
            break;
        }

        let result = match item {
            Outgoing::Audio(frame) => {
                sent += 1;
                if sent % 250 == 1 {
                    tracing::trace!(sent, bytes = frame.len(), "streaming audio to STT");
                }
                sink.send_audio(frame.data().to_vec()).await
            }
            Outgoing::Finalize => {
                tracing::debug!("finalizing utterance");
                sink.finalize().await
            }
        };

        if let Err(e) = result {
            gate.fail(e.to_string()).await;
            break;
        }
    }
    sink.close().await;
}

async fn run_reader(
    mut events: BoxStream<'static, Result<SttMessage>>,
    tx: mpsc::Sender<TranscriptEvent>,
    utterances: UtteranceCounter,
    gate: Arc<FailureGate>,
    stop: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            () = stop.cancelled() => return,
            next = events.next() => next,
        };

        let event = match next {
            Some(Ok(SttMessage::Partial(text))) => {
                let text = text.trim();
                if text.is_empty() {
                    continue;
                }
                TranscriptEvent::Interim {
                    text: text.to_string(),
                }
            }
            Some(Ok(SttMessage::Committed(text))) => {
                let text = text.trim();
                if text.is_empty() {
                    tracing::debug!("provider committed an empty utterance");
                    continue;
                }
                let utterance_id = utterances.commit();
                tracing::info!(utterance_id, transcript = %text, "utterance committed");
                TranscriptEvent::Final {
                    text: text.to_string(),
                    utterance_id,
                }
            }
            Some(Err(e)) => {
                gate.fail(e.to_string()).await;
                return;
            }
            None => {
                gate.fail("stream closed by provider".to_string()).await;
                return;
            }
        };

        if tx.send(event).await.is_err() {
            return;
        }
    }
}
