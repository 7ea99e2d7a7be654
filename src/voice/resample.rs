//! Sample-rate and channel conversion between the transport and STT/TTS formats
//!
//! Each [`Resampler`] handles one direction of one session. Input that does not
//! fill a whole filter chunk is held back as a continuity tail so successive
//! frames are filtered as one signal (no clicks at chunk boundaries).

use std::time::Duration;

use rubato::{FftFixedIn, Resampler as _};

use super::frame::{AudioFormat, AudioFrame, FRAME_DURATION, TRANSPORT_FORMAT};
use crate::{Error, Result};

/// Which way audio flows through the resampler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Transport (48 kHz stereo) to STT (mono)
    ToStt,
    /// TTS (mono) to transport (48 kHz stereo)
    ToPlayback,
}

/// Streaming PCM resampler for one direction
pub struct Resampler {
    direction: Direction,
    input: AudioFormat,
    output: AudioFormat,
    filter: Option<FftFixedIn<f32>>,
    /// Mono input samples not yet consumed by the filter
    pending: Vec<f32>,
}

impl std::fmt::Debug for Resampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resampler")
            .field("direction", &self.direction)
            .field("input", &self.input)
            .field("output", &self.output)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl Resampler {
    /// Converter from transport audio to the STT service's mono format
    ///
    /// # Errors
    ///
    /// Returns error if the filter cannot be built for this rate
    pub fn to_stt(stt_sample_rate: u32) -> Result<Self> {
        Self::new(
            Direction::ToStt,
            TRANSPORT_FORMAT,
            AudioFormat::mono(stt_sample_rate),
        )
    }

    /// Converter from the TTS service's mono format to transport audio
    ///
    /// # Errors
    ///
    /// Returns error if the filter cannot be built for this rate
    pub fn to_playback(tts_sample_rate: u32) -> Result<Self> {
        Self::new(
            Direction::ToPlayback,
            AudioFormat::mono(tts_sample_rate),
            TRANSPORT_FORMAT,
        )
    }

    fn new(direction: Direction, input: AudioFormat, output: AudioFormat) -> Result<Self> {
        let filter = if input.sample_rate == output.sample_rate {
            None
        } else {
            let chunk = (input.bytes_for(FRAME_DURATION) / input.frame_bytes()).max(1);
            let filter = FftFixedIn::<f32>::new(
                input.sample_rate as usize,
                output.sample_rate as usize,
                chunk,
                1,
                1,
            )
            .map_err(|e| Error::Audio(format!("resampler init failed: {e}")))?;
            Some(filter)
        };

        tracing::debug!(
            ?direction,
            from = input.sample_rate,
            to = output.sample_rate,
            filtered = filter.is_some(),
            "resampler initialized"
        );

        Ok(Self {
            direction,
            input,
            output,
            filter,
            pending: Vec::new(),
        })
    }

    /// Direction of this converter
    #[must_use]
    pub const fn direction(&self) -> Direction {
        self.direction
    }

    /// Expected input format
    #[must_use]
    pub const fn input_format(&self) -> AudioFormat {
        self.input
    }

    /// Produced output format
    #[must_use]
    pub const fn output_format(&self) -> AudioFormat {
        self.output
    }

    /// Input audio held back waiting for a full filter chunk
    #[must_use]
    pub fn pending(&self) -> Duration {
        let frames = self.pending.len() as u64;
        Duration::from_micros(frames * 1_000_000 / u64::from(self.input.sample_rate))
    }

    /// Convert one frame
    ///
    /// Output may be shorter than the input by the held-back tail, and longer
    /// when a previous tail completes a chunk.
    ///
    /// # Errors
    ///
    /// Returns `InvalidAudioFormat` if the frame is not in the input format;
    /// the caller should drop the frame and continue
    pub fn process(&mut self, frame: &AudioFrame) -> Result<AudioFrame> {
        frame.expect_format(self.input)?;

        let mono = downmix(frame);
        let Some(filter) = self.filter.as_mut() else {
            return Ok(encode(&mono, self.output));
        };

        self.pending.extend_from_slice(&mono);
        let mut out = Vec::new();
        loop {
            let needed = filter.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let chunk: Vec<f32> = self.pending.drain(..needed).collect();
            let result = filter
                .process(&[chunk], None)
                .map_err(|e| Error::Audio(format!("resample failed: {e}")))?;
            if let Some(channel) = result.first() {
                out.extend_from_slice(channel);
            }
        }

        Ok(encode(&out, self.output))
    }

    /// Flush the held-back tail, zero-padding the last filter chunk
    ///
    /// # Errors
    ///
    /// Returns error if the filter rejects the final chunk
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn finish(&mut self) -> Result<AudioFrame> {
        let Some(filter) = self.filter.as_mut() else {
            return Ok(AudioFrame::empty(self.output));
        };
        if self.pending.is_empty() {
            return Ok(AudioFrame::empty(self.output));
        }

        let expected = (self.pending.len() as u64 * u64::from(self.output.sample_rate)
            / u64::from(self.input.sample_rate)) as usize;
        let waves = vec![std::mem::take(&mut self.pending)];
        let result = filter
            .process_partial(Some(waves.as_slice()), None)
            .map_err(|e| Error::Audio(format!("resample failed: {e}")))?;

        let mut out = result.into_iter().next().unwrap_or_default();
        out.truncate(expected);
        Ok(encode(&out, self.output))
    }

    /// Drop the continuity tail and filter state
    pub fn reset(&mut self) {
        self.pending.clear();
        if let Some(filter) = self.filter.as_mut() {
            filter.reset();
        }
    }
}

/// Average interleaved channels into normalized mono samples
fn downmix(frame: &AudioFrame) -> Vec<f32> {
    let channels = usize::from(frame.format().channels);
    frame
        .samples()
        .chunks_exact(channels)
        .map(|ch| {
            let sum: i32 = ch.iter().map(|&s| i32::from(s)).sum();
            #[allow(clippy::cast_precision_loss)]
            let avg = sum as f32 / channels as f32;
            avg / 32768.0
        })
        .collect()
}

/// Quantize mono samples to s16le, duplicating into every output channel
fn encode(mono: &[f32], format: AudioFormat) -> AudioFrame {
    let channels = usize::from(format.channels);
    let mut samples = Vec::with_capacity(mono.len() * channels);
    for &s in mono {
        #[allow(clippy::cast_possible_truncation)]
        let q = (s * 32768.0).round().clamp(-32768.0, 32767.0) as i16;
        samples.extend(std::iter::repeat_n(q, channels));
    }
    AudioFrame::from_samples(&samples, format)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    fn sine(format: AudioFormat, frequency: f32, duration: Duration) -> AudioFrame {
        let frames = format.bytes_for(duration) / format.frame_bytes();
        let channels = usize::from(format.channels);
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
        let samples: Vec<i16> = (0..frames)
            .flat_map(|i| {
                let t = i as f32 / format.sample_rate as f32;
                let v = (0.5 * (2.0 * std::f32::consts::PI * frequency * t).sin() * 32767.0) as i16;
                std::iter::repeat_n(v, channels)
            })
            .collect();
        AudioFrame::from_samples(&samples, format)
    }

    fn split(frame: &AudioFrame, piece: Duration) -> Vec<AudioFrame> {
        let step = frame.format().bytes_for(piece);
        frame
            .data()
            .chunks(step)
            .map(|c| AudioFrame::new(c.to_vec(), frame.format()).unwrap())
            .collect()
    }

    #[test]
    fn stereo_to_mono_same_rate_averages() {
        let mut r = Resampler::to_stt(48_000).unwrap();
        let frame = AudioFrame::from_samples(&[100, 300, -50, -150], TRANSPORT_FORMAT);
        let out = r.process(&frame).unwrap();
        assert_eq!(out.format(), AudioFormat::mono(48_000));
        assert_eq!(out.samples(), vec![200, -100]);
    }

    #[test]
    fn mono_to_stereo_same_rate_duplicates() {
        let mut r = Resampler::to_playback(48_000).unwrap();
        let frame = AudioFrame::from_samples(&[7, -9], AudioFormat::mono(48_000));
        let out = r.process(&frame).unwrap();
        assert_eq!(out.samples(), vec![7, 7, -9, -9]);
    }

    #[test]
    fn wrong_format_is_invalid() {
        let mut r = Resampler::to_stt(16_000).unwrap();
        let frame = AudioFrame::silence(AudioFormat::mono(48_000), FRAME_DURATION);
        assert!(matches!(r.process(&frame), Err(Error::InvalidAudioFormat(_))));
    }

    #[test]
    fn downsampling_transport_frame_is_exact() {
        let mut r = Resampler::to_stt(16_000).unwrap();
        let frame = AudioFrame::silence(TRANSPORT_FORMAT, FRAME_DURATION);
        let out = r.process(&frame).unwrap();
        assert_eq!(out.sample_frames(), 320);
        assert_eq!(out.duration(), FRAME_DURATION);
        assert_eq!(r.pending(), Duration::ZERO);
    }

    #[test]
    fn round_trip_preserves_duration() {
        let input = sine(TRANSPORT_FORMAT, 440.0, Duration::from_secs(1));
        let mut down = Resampler::to_stt(16_000).unwrap();
        let mut up = Resampler::to_playback(16_000).unwrap();

        let mut out_frames = 0;
        let mut out_samples = Vec::new();
        for frame in split(&input, FRAME_DURATION) {
            let stt = down.process(&frame).unwrap();
            let back = up.process(&stt).unwrap();
            out_frames += back.sample_frames();
            out_samples.extend(back.samples());
        }

        let tolerance = TRANSPORT_FORMAT.bytes_for(FRAME_DURATION) / TRANSPORT_FORMAT.frame_bytes();
        assert!(input.sample_frames().abs_diff(out_frames) <= tolerance);

        // After the filter delay settles, a clean sine has no sample-to-sample jumps
        let settled = &out_samples[2 * 4800..];
        let max_jump = settled
            .chunks_exact(2)
            .map(|c| c[0])
            .collect::<Vec<_>>()
            .windows(2)
            .map(|w| (i32::from(w[1]) - i32::from(w[0])).abs())
            .max()
            .unwrap();
        assert!(max_jump < 3000, "discontinuity of {max_jump}");
    }

    #[test]
    fn odd_sized_chunks_are_carried() {
        let input = sine(AudioFormat::mono(24_000), 220.0, Duration::from_millis(500));
        let mut up = Resampler::to_playback(24_000).unwrap();

        let mut produced = 0;
        for frame in split(&input, Duration::from_millis(7)) {
            produced += up.process(&frame).unwrap().sample_frames();
        }
        produced += up.finish().unwrap().sample_frames();

        // 500ms at 48kHz, within one transport frame
        assert!(24_000usize.abs_diff(produced) <= 960);
        assert_eq!(up.pending(), Duration::ZERO);
    }

    #[test]
    fn reset_drops_tail() {
        let mut up = Resampler::to_playback(24_000).unwrap();
        let frame = AudioFrame::silence(AudioFormat::mono(24_000), Duration::from_millis(5));
        let out = up.process(&frame).unwrap();
        assert!(out.is_empty());
        assert!(up.pending() > Duration::ZERO);

        up.reset();
        assert_eq!(up.pending(), Duration::ZERO);
        assert!(up.finish().unwrap().is_empty());
    }
}
