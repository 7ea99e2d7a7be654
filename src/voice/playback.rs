//! Outbound audio queue drained at the transport's tick rate
//!
//! The buffer holds resampled [`PlaybackItem`]s in transport format and hands
//! out exactly one 20ms frame per [`pull`](PlaybackBuffer::pull). It never
//! blocks the caller of `pull`: an empty queue yields silence.
//!
//! Flushing raises a generation floor. Anything at or below the floor is
//! dropped on the way in and on the way out, so audio from a cancelled
//! generation can never be pulled again no matter when its producer stops.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;

use super::frame::{AudioFrame, FRAME_DURATION, TRANSPORT_FORMAT};
use super::tts::{GenerationId, PlaybackItem};
use crate::Result;

/// Fade-out applied to the end of a response to avoid a click
const FADE_OUT: Duration = Duration::from_millis(5);

/// Result of offering an item to the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The item will be played
    Queued,
    /// The item belongs to a flushed generation or repeats a sequence number
    Discarded,
}

/// Where a pulled frame came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSource {
    /// Nothing was ready
    Silence,
    /// Audio from a response generation
    Generation {
        /// Generation the audio belongs to
        id: GenerationId,
        /// Whether this frame finished the generation
        end_of_response: bool,
    },
}

/// One output tick's worth of audio
#[derive(Debug, Clone)]
pub struct PlaybackFrame {
    /// Exactly one transport frame
    pub frame: AudioFrame,
    /// Origin of the audio
    pub source: FrameSource,
}

impl PlaybackFrame {
    /// Whether this frame is filler silence
    #[must_use]
    pub const fn is_silence(&self) -> bool {
        matches!(self.source, FrameSource::Silence)
    }
}

/// Contiguous audio ready for playback
#[derive(Debug)]
struct Segment {
    generation: GenerationId,
    audio: AudioFrame,
    offset: usize,
    end_of_response: bool,
}

impl Segment {
    fn remaining(&self) -> usize {
        self.audio.len() - self.offset
    }
}

#[derive(Debug, Default)]
struct State {
    ready: VecDeque<Segment>,
    /// Items waiting for an earlier sequence number, keyed by (generation, sequence)
    held: BTreeMap<(GenerationId, u64), PlaybackItem>,
    next_sequence: HashMap<GenerationId, u64>,
    /// Bytes in `ready` (unread part) and `held`
    buffered_bytes: usize,
    /// Highest flushed generation
    floor: Option<GenerationId>,
}

impl State {
    fn is_stale(&self, generation: GenerationId) -> bool {
        self.floor.is_some_and(|floor| generation <= floor)
    }

    fn ready_bytes(&self) -> usize {
        self.ready.iter().map(Segment::remaining).sum()
    }

    fn insert(&mut self, item: PlaybackItem) -> PushOutcome {
        let generation = item.generation;
        let expected = self.next_sequence.entry(generation).or_insert(0);

        if item.sequence < *expected || self.held.contains_key(&(generation, item.sequence)) {
            tracing::debug!(generation, sequence = item.sequence, "duplicate playback item");
            return PushOutcome::Discarded;
        }

        self.buffered_bytes += item.audio.len();
        if item.sequence > *expected {
            tracing::trace!(generation, sequence = item.sequence, expected = *expected, "holding out-of-order item");
            self.held.insert((generation, item.sequence), item);
            return PushOutcome::Queued;
        }

        self.append(item);
        // Release anything the new item made contiguous
        loop {
            let next = self.next_sequence.get(&generation).copied().unwrap_or(0);
            match self.held.remove(&(generation, next)) {
                Some(held) => self.append(held),
                None => break,
            }
        }
        PushOutcome::Queued
    }

    fn append(&mut self, item: PlaybackItem) {
        self.next_sequence.insert(item.generation, item.sequence + 1);
        self.ready.push_back(Segment {
            generation: item.generation,
            audio: item.audio,
            offset: 0,
            end_of_response: item.end_of_response,
        });
    }

    fn flush(&mut self, generation: GenerationId) -> usize {
        let floor = self.floor.map_or(generation, |f| f.max(generation));
        self.floor = Some(floor);

        let before = self.ready.len() + self.held.len();
        self.ready.retain(|s| s.generation > floor);
        self.held.retain(|&(g, _), _| g > floor);
        self.next_sequence.retain(|&g, _| g > floor);
        self.buffered_bytes = self.ready_bytes() + self.held.values().map(|i| i.audio.len()).sum::<usize>();
        before - (self.ready.len() + self.held.len())
    }
}

/// Duration-bounded, generation-aware playback queue for one session
#[derive(Debug)]
pub struct PlaybackBuffer {
    state: Mutex<State>,
    capacity_bytes: usize,
    space: Notify,
}

impl PlaybackBuffer {
    /// Create a buffer holding at most `capacity` of transport audio
    #[must_use]
    pub fn new(capacity: Duration) -> Self {
        let capacity_bytes = TRANSPORT_FORMAT
            .bytes_for(capacity)
            .max(TRANSPORT_FORMAT.bytes_for(FRAME_DURATION));
        Self {
            state: Mutex::new(State::default()),
            capacity_bytes,
            space: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Maximum buffered audio
    #[must_use]
    pub fn capacity(&self) -> Duration {
        TRANSPORT_FORMAT.duration_of(self.capacity_bytes)
    }

    /// Audio currently buffered, including out-of-order items
    #[must_use]
    pub fn buffered(&self) -> Duration {
        TRANSPORT_FORMAT.duration_of(self.lock().buffered_bytes)
    }

    /// Whether nothing is waiting to be played
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().buffered_bytes == 0
    }

    /// Queue an item, waiting while the buffer is full
    ///
    /// Only the response path waits here; capture and output never do.
    ///
    /// # Errors
    ///
    /// Returns `InvalidAudioFormat` if the item is not transport audio
    pub async fn push(&self, item: PlaybackItem) -> Result<PushOutcome> {
        item.audio.expect_format(TRANSPORT_FORMAT)?;
        let mut item = Some(item);

        loop {
            let notified = self.space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(outcome) = self.offer(&mut item) {
                return Ok(outcome);
            }
            notified.await;
        }
    }

    /// Queue an item without waiting
    ///
    /// A full buffer hands the item back as the inner `Err`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidAudioFormat` if the item is not transport audio
    pub fn try_push(&self, item: PlaybackItem) -> Result<std::result::Result<PushOutcome, PlaybackItem>> {
        item.audio.expect_format(TRANSPORT_FORMAT)?;
        let mut slot = Some(item);
        match self.offer(&mut slot) {
            Some(outcome) => Ok(Ok(outcome)),
            None => Ok(slot.map_or(Ok(PushOutcome::Discarded), Err)),
        }
    }

    /// Insert the item if it fits; `None` leaves it in the slot
    fn offer(&self, slot: &mut Option<PlaybackItem>) -> Option<PushOutcome> {
        let mut state = self.lock();
        let item = slot.as_ref()?;

        if state.is_stale(item.generation) {
            tracing::debug!(generation = item.generation, sequence = item.sequence, "discarding flushed generation");
            slot.take();
            return Some(PushOutcome::Discarded);
        }

        // An empty ready queue always admits, so held items can never wedge the buffer
        let fits = state.buffered_bytes + item.audio.len() <= self.capacity_bytes;
        if !fits && !state.ready.is_empty() {
            return None;
        }

        let item = slot.take()?;
        Some(state.insert(item))
    }

    /// Take the next 20ms frame, or silence if nothing is ready
    #[must_use]
    pub fn pull(&self) -> PlaybackFrame {
        let frame_bytes = TRANSPORT_FORMAT.bytes_for(FRAME_DURATION);
        let mut state = self.lock();

        let Some(generation) = state.ready.front().map(|s| s.generation) else {
            return silence();
        };

        let available: usize = state
            .ready
            .iter()
            .take_while(|s| s.generation == generation)
            .map(Segment::remaining)
            .sum();
        let ends_here = state
            .ready
            .iter()
            .take_while(|s| s.generation == generation)
            .any(|s| s.end_of_response);
        let superseded = state.ready.iter().any(|s| s.generation != generation);

        // Mid-response underrun: wait for more audio rather than cut a frame short
        if available < frame_bytes && !ends_here && !superseded {
            return silence();
        }

        let mut data = Vec::with_capacity(frame_bytes);
        let mut end_of_response = false;
        while data.len() < frame_bytes {
            let Some(segment) = state.ready.front_mut() else {
                break;
            };
            if segment.generation != generation {
                break;
            }
            let take = segment.remaining().min(frame_bytes - data.len());
            data.extend_from_slice(&segment.audio.data()[segment.offset..segment.offset + take]);
            segment.offset += take;

            if segment.remaining() == 0 {
                let done = segment.end_of_response;
                state.ready.pop_front();
                if done {
                    end_of_response = true;
                    break;
                }
            }
        }
        state.buffered_bytes = state.buffered_bytes.saturating_sub(data.len());
        drop(state);
        self.space.notify_waiters();

        let audio_len = data.len();
        if end_of_response || audio_len < frame_bytes {
            fade_out(&mut data[..audio_len]);
            data.resize(frame_bytes, 0);
        }

        PlaybackFrame {
            frame: AudioFrame::new(data, TRANSPORT_FORMAT)
                .unwrap_or_else(|_| AudioFrame::silence(TRANSPORT_FORMAT, FRAME_DURATION)),
            source: FrameSource::Generation {
                id: generation,
                end_of_response,
            },
        }
    }

    /// Drop every item from `generation` and older, now and in the future
    ///
    /// Returns the number of items discarded.
    pub fn flush(&self, generation: GenerationId) -> usize {
        let dropped = self.lock().flush(generation);
        self.space.notify_waiters();
        if dropped > 0 {
            tracing::debug!(generation, dropped, "playback flushed");
        }
        dropped
    }

    /// Drop everything and refuse all further audio
    pub fn close(&self) {
        self.flush(GenerationId::MAX);
    }
}

fn silence() -> PlaybackFrame {
    PlaybackFrame {
        frame: AudioFrame::silence(TRANSPORT_FORMAT, FRAME_DURATION),
        source: FrameSource::Silence,
    }
}

/// Linear fade over the last few milliseconds of interleaved s16le audio
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn fade_out(data: &mut [u8]) {
    let frame_bytes = TRANSPORT_FORMAT.frame_bytes();
    let fade_bytes = TRANSPORT_FORMAT.bytes_for(FADE_OUT).min(data.len());
    let fade_frames = fade_bytes / frame_bytes;
    if fade_frames == 0 {
        return;
    }

    let start = data.len() - fade_frames * frame_bytes;
    for (i, frame) in data[start..].chunks_exact_mut(frame_bytes).enumerate() {
        let gain = 1.0 - (i + 1) as f32 / fade_frames as f32;
        for sample in frame.chunks_exact_mut(2) {
            let value = f32::from(i16::from_le_bytes([sample[0], sample[1]])) * gain;
            sample.copy_from_slice(&(value as i16).to_le_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio_test::{assert_pending, assert_ready, task};

    use super::*;

    fn item(generation: GenerationId, sequence: u64, ms: u64, fill: i16, last: bool) -> PlaybackItem {
        let frames = TRANSPORT_FORMAT.bytes_for(Duration::from_millis(ms)) / TRANSPORT_FORMAT.frame_bytes();
        let samples = vec![fill; frames * 2];
        PlaybackItem {
            generation,
            sequence,
            audio: AudioFrame::from_samples(&samples, TRANSPORT_FORMAT),
            end_of_response: last,
        }
    }

    fn first_sample(frame: &PlaybackFrame) -> i16 {
        frame.frame.samples()[0]
    }

    #[test]
    fn empty_buffer_yields_silence() {
        let buffer = PlaybackBuffer::new(Duration::from_secs(1));
        let frame = buffer.pull();
        assert!(frame.is_silence());
        assert_eq!(frame.frame.len(), 3840);
    }

    #[tokio::test]
    async fn frames_come_out_in_sequence_order() {
        let buffer = PlaybackBuffer::new(Duration::from_secs(1));
        buffer.push(item(1, 1, 20, 200, false)).await.unwrap();
        buffer.push(item(1, 0, 20, 100, false)).await.unwrap();
        buffer.push(item(1, 2, 20, 300, true)).await.unwrap();

        assert_eq!(first_sample(&buffer.pull()), 100);
        assert_eq!(first_sample(&buffer.pull()), 200);
        let last = buffer.pull();
        assert_eq!(first_sample(&last), 300);
        assert_eq!(
            last.source,
            FrameSource::Generation {
                id: 1,
                end_of_response: true
            }
        );
        assert!(buffer.pull().is_silence());
    }

    #[tokio::test]
    async fn gap_holds_later_items() {
        let buffer = PlaybackBuffer::new(Duration::from_secs(1));
        buffer.push(item(1, 1, 20, 200, false)).await.unwrap();
        assert!(buffer.pull().is_silence());
        assert_eq!(buffer.buffered(), Duration::from_millis(20));
    }

    #[tokio::test]
    async fn partial_tail_is_padded_and_faded() {
        let buffer = PlaybackBuffer::new(Duration::from_secs(1));
        buffer.push(item(4, 0, 30, 1000, true)).await.unwrap();

        let first = buffer.pull();
        assert_eq!(
            first.source,
            FrameSource::Generation {
                id: 4,
                end_of_response: false
            }
        );
        let tail = buffer.pull();
        assert_eq!(tail.frame.len(), 3840);
        let samples = tail.frame.samples();
        // 10ms of audio then silence; the last audio sample is faded to zero
        assert_eq!(samples[0], 1000);
        assert_eq!(samples[959], 0);
        assert_eq!(samples[1919], 0);
        assert!(matches!(
            tail.source,
            FrameSource::Generation {
                id: 4,
                end_of_response: true
            }
        ));
    }

    #[tokio::test]
    async fn mid_response_underrun_waits_for_more() {
        let buffer = PlaybackBuffer::new(Duration::from_secs(1));
        buffer.push(item(1, 0, 10, 50, false)).await.unwrap();
        assert!(buffer.pull().is_silence());

        buffer.push(item(1, 1, 10, 60, true)).await.unwrap();
        let frame = buffer.pull();
        let samples = frame.frame.samples();
        assert_eq!(samples[0], 50);
        assert_eq!(samples[960], 60);
    }

    #[tokio::test]
    async fn flushed_generation_is_never_pulled() {
        let buffer = PlaybackBuffer::new(Duration::from_secs(1));
        buffer.push(item(1, 0, 20, 100, false)).await.unwrap();
        buffer.push(item(1, 1, 20, 200, false)).await.unwrap();
        assert_eq!(first_sample(&buffer.pull()), 100);

        assert_eq!(buffer.flush(1), 1);

        // A late chunk from the cancelled producer
        let late = buffer.push(item(1, 2, 20, 300, true)).await.unwrap();
        assert_eq!(late, PushOutcome::Discarded);

        buffer.push(item(2, 0, 20, 900, true)).await.unwrap();
        let frame = buffer.pull();
        assert_eq!(first_sample(&frame), 900);
        assert!(matches!(frame.source, FrameSource::Generation { id: 2, .. }));
        assert!(buffer.pull().is_silence());
    }

    #[tokio::test]
    async fn flush_keeps_newer_generations() {
        let buffer = PlaybackBuffer::new(Duration::from_secs(1));
        buffer.push(item(3, 0, 20, 300, true)).await.unwrap();
        buffer.flush(2);
        assert_eq!(first_sample(&buffer.pull()), 300);
    }

    #[tokio::test]
    async fn duplicate_sequence_is_discarded() {
        let buffer = PlaybackBuffer::new(Duration::from_secs(1));
        buffer.push(item(1, 0, 20, 1, false)).await.unwrap();
        let again = buffer.push(item(1, 0, 20, 2, false)).await.unwrap();
        assert_eq!(again, PushOutcome::Discarded);
    }

    #[tokio::test]
    async fn wrong_format_is_rejected() {
        let buffer = PlaybackBuffer::new(Duration::from_secs(1));
        let bad = PlaybackItem {
            generation: 1,
            sequence: 0,
            audio: AudioFrame::silence(super::super::frame::AudioFormat::mono(24_000), FRAME_DURATION),
            end_of_response: true,
        };
        assert!(buffer.push(bad).await.is_err());
    }

    #[test]
    fn full_buffer_backpressures_push_until_pull() {
        let buffer = PlaybackBuffer::new(Duration::from_millis(40));
        assert!(buffer.try_push(item(1, 0, 20, 1, false)).unwrap().is_ok());
        assert!(buffer.try_push(item(1, 1, 20, 2, false)).unwrap().is_ok());

        let rejected = buffer.try_push(item(1, 2, 20, 3, false)).unwrap();
        assert!(rejected.is_err());

        let mut push = task::spawn(buffer.push(item(1, 2, 20, 3, true)));
        assert_pending!(push.poll());

        let _ = buffer.pull();
        assert!(push.is_woken());
        let outcome = assert_ready!(push.poll()).unwrap();
        assert_eq!(outcome, PushOutcome::Queued);
    }

    #[test]
    fn flush_releases_blocked_pusher() {
        let buffer = PlaybackBuffer::new(Duration::from_millis(20));
        assert!(buffer.try_push(item(1, 0, 20, 1, false)).unwrap().is_ok());

        let mut push = task::spawn(buffer.push(item(1, 1, 20, 2, true)));
        assert_pending!(push.poll());
        buffer.flush(1);

        assert!(push.is_woken());
        assert_eq!(assert_ready!(push.poll()).unwrap(), PushOutcome::Discarded);
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn close_refuses_everything() {
        let buffer = PlaybackBuffer::new(Duration::from_secs(1));
        buffer.close();
        let outcome = buffer.push(item(100, 0, 20, 1, true)).await.unwrap();
        assert_eq!(outcome, PushOutcome::Discarded);
    }
}
