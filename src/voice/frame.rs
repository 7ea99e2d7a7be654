//! Audio frames passed between pipeline stages

use std::sync::Arc;
use std::time::Duration;

use crate::{Error, Result};

/// Bytes per 16-bit sample
pub const BYTES_PER_SAMPLE: usize = 2;

/// Sample rate of the voice transport (Hz)
pub const TRANSPORT_SAMPLE_RATE: u32 = 48_000;

/// Channel count of the voice transport
pub const TRANSPORT_CHANNELS: u16 = 2;

/// Output tick / transport frame length
pub const FRAME_DURATION: Duration = Duration::from_millis(20);

/// Native format of the voice transport: 48 kHz stereo s16le
pub const TRANSPORT_FORMAT: AudioFormat = AudioFormat::new(TRANSPORT_SAMPLE_RATE, TRANSPORT_CHANNELS);

/// Sample rate and channel layout of 16-bit little-endian PCM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AudioFormat {
    /// Samples per second per channel
    pub sample_rate: u32,
    /// Interleaved channel count
    pub channels: u16,
}

impl AudioFormat {
    /// Create a format
    #[must_use]
    pub const fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    /// Mono at the given rate
    #[must_use]
    pub const fn mono(sample_rate: u32) -> Self {
        Self::new(sample_rate, 1)
    }

    /// Bytes per interleaved sample frame (all channels)
    #[must_use]
    pub const fn frame_bytes(self) -> usize {
        BYTES_PER_SAMPLE * self.channels as usize
    }

    /// Bytes covering `duration` of audio, rounded down to whole sample frames
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn bytes_for(self, duration: Duration) -> usize {
        let frames = u128::from(self.sample_rate) * duration.as_micros() / 1_000_000;
        frames as usize * self.frame_bytes()
    }

    /// Duration of `bytes` of audio in this format
    #[must_use]
    pub fn duration_of(self, bytes: usize) -> Duration {
        if self.sample_rate == 0 || self.channels == 0 {
            return Duration::ZERO;
        }
        let frames = (bytes / self.frame_bytes()) as u64;
        Duration::from_micros(frames * 1_000_000 / u64::from(self.sample_rate))
    }
}

/// Immutable chunk of PCM audio
///
/// Cloning shares the underlying bytes; a frame is never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    data: Arc<[u8]>,
    format: AudioFormat,
}

impl AudioFrame {
    /// Wrap PCM bytes, validating alignment to whole sample frames
    ///
    /// # Errors
    ///
    /// Returns `InvalidAudioFormat` if the length is not a multiple of the frame size
    pub fn new(data: impl Into<Arc<[u8]>>, format: AudioFormat) -> Result<Self> {
        let data = data.into();
        if format.channels == 0 || format.sample_rate == 0 {
            return Err(Error::InvalidAudioFormat(format!(
                "unusable format {}Hz/{}ch",
                format.sample_rate, format.channels
            )));
        }
        if data.len() % format.frame_bytes() != 0 {
            return Err(Error::InvalidAudioFormat(format!(
                "{} bytes is not a multiple of the {}-byte frame",
                data.len(),
                format.frame_bytes()
            )));
        }
        Ok(Self { data, format })
    }

    /// Build a frame from samples
    #[must_use]
    pub fn from_samples(samples: &[i16], format: AudioFormat) -> Self {
        let data: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        Self {
            data: data.into(),
            format,
        }
    }

    /// A frame of digital silence
    #[must_use]
    pub fn silence(format: AudioFormat, duration: Duration) -> Self {
        Self {
            data: vec![0u8; format.bytes_for(duration)].into(),
            format,
        }
    }

    /// An empty frame
    #[must_use]
    pub fn empty(format: AudioFormat) -> Self {
        Self {
            data: Arc::from(Vec::new()),
            format,
        }
    }

    /// Raw PCM bytes
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Audio format
    #[must_use]
    pub const fn format(&self) -> AudioFormat {
        self.format
    }

    /// Byte length
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the frame holds no audio
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of sample frames (per-channel samples)
    #[must_use]
    pub fn sample_frames(&self) -> usize {
        self.data.len() / self.format.frame_bytes()
    }

    /// Playback duration
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.format.duration_of(self.data.len())
    }

    /// Decode interleaved samples
    #[must_use]
    pub fn samples(&self) -> Vec<i16> {
        self.data
            .chunks_exact(BYTES_PER_SAMPLE)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect()
    }

    /// Root-mean-square level normalized to 0.0-1.0
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    pub fn rms(&self) -> f32 {
        let samples = self.samples();
        if samples.is_empty() {
            return 0.0;
        }
        let sum: f64 = samples
            .iter()
            .map(|&s| {
                let v = f64::from(s) / 32768.0;
                v * v
            })
            .sum();
        (sum / samples.len() as f64).sqrt() as f32
    }

    /// Check that this frame is in the expected format
    ///
    /// # Errors
    ///
    /// Returns `InvalidAudioFormat` on mismatch
    pub fn expect_format(&self, expected: AudioFormat) -> Result<()> {
        if self.format == expected {
            Ok(())
        } else {
            Err(Error::InvalidAudioFormat(format!(
                "expected {}Hz/{}ch, got {}Hz/{}ch",
                expected.sample_rate, expected.channels, self.format.sample_rate, self.format.channels
            )))
        }
    }
}
