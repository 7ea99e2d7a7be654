//! Streaming text-to-speech
//!
//! [`TextToSpeech`] is the provider seam. [`SynthesisClient`] turns one
//! provider stream per generation into ordered [`PlaybackItem`]s and supports
//! generation-scoped cancellation.

mod elevenlabs;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::frame::{AudioFormat, AudioFrame};
use crate::{Error, Result};

pub use elevenlabs::ElevenLabsTts;

/// Identifier of one assistant response cycle, monotonic per session
pub type GenerationId = u64;

/// Chunks the producer may run ahead of the consumer
const SYNTHESIS_LOOKAHEAD: usize = 4;

/// Ordered audio chunk belonging to one generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackItem {
    /// Generation this chunk belongs to
    pub generation: GenerationId,
    /// Position within the generation, starting at 0
    pub sequence: u64,
    /// PCM audio
    pub audio: AudioFrame,
    /// Whether this is the last chunk of the generation
    pub end_of_response: bool,
}

/// Streaming text-to-speech provider
#[async_trait]
pub trait TextToSpeech: Send + Sync {
    /// Start synthesizing `text`; yields raw mono s16le PCM as it is produced
    ///
    /// Chunk boundaries may split samples.
    async fn stream(&self, text: &str) -> Result<BoxStream<'static, Result<Vec<u8>>>>;
}

/// Runs synthesis generations for one session
pub struct SynthesisClient {
    provider: Arc<dyn TextToSpeech>,
    format: AudioFormat,
    open_timeout: Duration,
    active: Arc<Mutex<HashMap<GenerationId, CancellationToken>>>,
}

impl SynthesisClient {
    /// Create a client producing mono audio at `sample_rate`
    #[must_use]
    pub fn new(provider: Arc<dyn TextToSpeech>, sample_rate: u32, open_timeout: Duration) -> Self {
        Self {
            provider,
            format: AudioFormat::mono(sample_rate),
            open_timeout,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Format of produced chunks
    #[must_use]
    pub const fn format(&self) -> AudioFormat {
        self.format
    }

    /// Start synthesizing a generation
    ///
    /// The returned stream is lazy and finite; chunks arrive as the provider
    /// produces them.
    pub fn synthesize(&self, generation: GenerationId, text: String) -> SynthesisStream {
        let token = CancellationToken::new();
        self.lock_active().insert(generation, token.clone());

        let (tx, rx) = mpsc::channel(SYNTHESIS_LOOKAHEAD);
        let producer = Producer {
            provider: Arc::clone(&self.provider),
            format: self.format,
            open_timeout: self.open_timeout,
            generation,
            token,
            tx,
        };
        let active = Arc::clone(&self.active);

        tokio::spawn(async move {
            let tx = producer.tx.clone();
            let result = producer.run(text).await;
            if let Err(e) = result {
                if e.is_cancellation() {
                    tracing::debug!(generation, "synthesis cancelled");
                } else {
                    tracing::warn!(generation, error = %e, "synthesis failed");
                }
                let _ = tx.send(Err(e)).await;
            }
            active
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&generation);
        });

        SynthesisStream { generation, rx }
    }

    /// Stop a generation; other generations are unaffected
    ///
    /// Returns whether the generation was still running.
    pub fn cancel(&self, generation: GenerationId) -> bool {
        let token = self.lock_active().remove(&generation);
        token.is_some_and(|token| {
            token.cancel();
            tracing::debug!(generation, "synthesis cancel requested");
            true
        })
    }

    /// Stop every running generation
    pub fn cancel_all(&self) {
        for (_, token) in self.lock_active().drain() {
            token.cancel();
        }
    }

    /// Generations still producing audio
    #[must_use]
    pub fn active_generations(&self) -> Vec<GenerationId> {
        let mut ids: Vec<_> = self.lock_active().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, HashMap<GenerationId, CancellationToken>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Ordered chunks of one generation
#[derive(Debug)]
pub struct SynthesisStream {
    generation: GenerationId,
    rx: mpsc::Receiver<Result<PlaybackItem>>,
}

impl SynthesisStream {
    /// Generation this stream belongs to
    #[must_use]
    pub const fn generation(&self) -> GenerationId {
        self.generation
    }

    /// Next chunk; `None` after the end-of-response chunk or an error
    pub async fn next(&mut self) -> Option<Result<PlaybackItem>> {
        self.rx.recv().await
    }
}

struct Producer {
    provider: Arc<dyn TextToSpeech>,
    format: AudioFormat,
    open_timeout: Duration,
    generation: GenerationId,
    token: CancellationToken,
    tx: mpsc::Sender<Result<PlaybackItem>>,
}

impl Producer {
    async fn run(&self, text: String) -> Result<()> {
        let opened = tokio::select! {
            biased;
            () = self.token.cancelled() => return Err(Error::GenerationCancelled(self.generation)),
            opened = tokio::time::timeout(self.open_timeout, self.provider.stream(&text)) => opened,
        };
        let mut upstream = opened
            .map_err(|_| Error::timeout("TTS open", self.open_timeout))?
            .map_err(|e| match e {
                Error::Timeout { .. } => e,
                other => Error::SynthesisFailed(other.to_string()),
            })?;

        tracing::debug!(generation = self.generation, chars = text.len(), "synthesis started");

        let mut sequence = 0;
        let mut held: Option<Vec<u8>> = None;
        let mut odd_byte: Option<u8> = None;
        let mut total_bytes = 0usize;

        loop {
            let next = tokio::select! {
                biased;
                () = self.token.cancelled() => return Err(Error::GenerationCancelled(self.generation)),
                next = upstream.next() => next,
            };

            let chunk = match next {
                None => break,
                Some(Err(e)) => return Err(Error::SynthesisFailed(e.to_string())),
                Some(Ok(chunk)) => chunk,
            };

            let aligned = align_samples(&mut odd_byte, chunk);
            if aligned.is_empty() {
                continue;
            }
            total_bytes += aligned.len();

            // One chunk is held back so the final one can carry the end flag
            if let Some(previous) = held.replace(aligned) {
                if !self.emit(sequence, previous, false).await? {
                    return Ok(());
                }
                sequence += 1;
            }
        }

        let mut last = held.unwrap_or_default();
        if let Some(byte) = odd_byte {
            last.extend_from_slice(&[byte, 0]);
            total_bytes += 2;
        }
        self.emit(sequence, last, true).await?;

        tracing::debug!(
            generation = self.generation,
            chunks = sequence + 1,
            bytes = total_bytes,
            "synthesis complete"
        );
        Ok(())
    }

    /// Send one chunk; returns false if the consumer has gone away
    async fn emit(&self, sequence: u64, bytes: Vec<u8>, end_of_response: bool) -> Result<bool> {
        let item = PlaybackItem {
            generation: self.generation,
            sequence,
            audio: AudioFrame::new(bytes, self.format)?,
            end_of_response,
        };

        tokio::select! {
            biased;
            () = self.token.cancelled() => Err(Error::GenerationCancelled(self.generation)),
            sent = self.tx.send(Ok(item)) => Ok(sent.is_ok()),
        }
    }
}

/// Re-align a byte chunk to whole 16-bit samples, carrying a split byte forward
fn align_samples(odd_byte: &mut Option<u8>, chunk: Vec<u8>) -> Vec<u8> {
    let mut bytes = match odd_byte.take() {
        Some(byte) => {
            let mut joined = Vec::with_capacity(chunk.len() + 1);
            joined.push(byte);
            joined.extend_from_slice(&chunk);
            joined
        }
        None => chunk,
    };
    if bytes.len() % 2 == 1 {
        *odd_byte = bytes.pop();
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Notify;

    struct ChunkProvider {
        chunks: Vec<Vec<u8>>,
        /// When set, each chunk waits for a permit
        gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl TextToSpeech for ChunkProvider {
        async fn stream(&self, _text: &str) -> Result<BoxStream<'static, Result<Vec<u8>>>> {
            let chunks = self.chunks.clone();
            let gate = self.gate.clone();
            Ok(futures::stream::iter(chunks)
                .then(move |chunk| {
                    let gate = gate.clone();
                    async move {
                        if let Some(gate) = gate {
                            gate.notified().await;
                        }
                        Ok(chunk)
                    }
                })
                .boxed())
        }
    }

    struct StalledProvider;

    #[async_trait]
    impl TextToSpeech for StalledProvider {
        async fn stream(&self, _text: &str) -> Result<BoxStream<'static, Result<Vec<u8>>>> {
            futures::future::pending::<()>().await;
            unreachable!()
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl TextToSpeech for FailingProvider {
        async fn stream(&self, _text: &str) -> Result<BoxStream<'static, Result<Vec<u8>>>> {
            Ok(futures::stream::iter(vec![
                Ok(vec![0u8; 4]),
                Err(Error::Tts("upstream 500".to_string())),
            ])
            .boxed())
        }
    }

    fn client(provider: impl TextToSpeech + 'static) -> SynthesisClient {
        SynthesisClient::new(Arc::new(provider), 24_000, Duration::from_millis(200))
    }

    #[tokio::test]
    async fn chunks_are_sequenced_with_end_flag_on_last() {
        let synth = client(ChunkProvider {
            chunks: vec![vec![1u8; 8], vec![2u8; 8], vec![3u8; 8]],
            gate: None,
        });
        let mut stream = synth.synthesize(7, "hello".to_string());

        let mut items = Vec::new();
        while let Some(item) = stream.next().await {
            items.push(item.unwrap());
        }

        let seqs: Vec<_> = items.iter().map(|i| i.sequence).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert!(items.iter().all(|i| i.generation == 7));
        assert!(items[2].end_of_response);
        assert!(!items[0].end_of_response && !items[1].end_of_response);
    }

    #[tokio::test]
    async fn odd_bytes_are_realigned() {
        let synth = client(ChunkProvider {
            chunks: vec![vec![1u8; 3], vec![2u8; 3]],
            gate: None,
        });
        let mut stream = synth.synthesize(1, "x".to_string());

        let mut total = 0;
        while let Some(item) = stream.next().await {
            let item = item.unwrap();
            assert_eq!(item.audio.len() % 2, 0);
            total += item.audio.len();
        }
        assert_eq!(total, 6);
    }

    #[tokio::test]
    async fn empty_response_still_ends() {
        let synth = client(ChunkProvider {
            chunks: vec![],
            gate: None,
        });
        let mut stream = synth.synthesize(2, String::new());
        let item = stream.next().await.unwrap().unwrap();
        assert!(item.end_of_response);
        assert!(item.audio.is_empty());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn open_timeout_fails_generation() {
        let synth = client(StalledProvider);
        let mut stream = synth.synthesize(3, "hi".to_string());
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(err.is_timeout());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn upstream_error_is_synthesis_failure() {
        let synth = client(FailingProvider);
        let mut stream = synth.synthesize(4, "hi".to_string());

        let mut saw_failure = false;
        while let Some(item) = stream.next().await {
            if let Err(e) = item {
                assert!(matches!(e, Error::SynthesisFailed(_)));
                saw_failure = true;
            }
        }
        assert!(saw_failure);
    }

    #[tokio::test]
    async fn cancel_is_generation_scoped() {
        let gate = Arc::new(Notify::new());
        let provider = Arc::new(ChunkProvider {
            chunks: vec![vec![0u8; 4]; 3],
            gate: Some(Arc::clone(&gate)),
        });
        let synth = SynthesisClient::new(provider, 24_000, Duration::from_secs(1));

        let mut old = synth.synthesize(1, "old".to_string());
        let mut new = synth.synthesize(2, "new".to_string());
        tokio::task::yield_now().await;

        assert!(synth.cancel(1));
        assert!(!synth.cancel(1));

        let err = old.next().await.unwrap().unwrap_err();
        assert!(err.is_cancellation());
        assert!(old.next().await.is_none());

        for _ in 0..3 {
            gate.notify_one();
            tokio::task::yield_now().await;
        }
        let mut count = 0;
        while let Some(item) = new.next().await {
            let item = item.unwrap();
            assert_eq!(item.generation, 2);
            count += 1;
            if item.end_of_response {
                break;
            }
            gate.notify_one();
        }
        assert_eq!(count, 3);
    }
}
