//! WAV file helpers for feeding and recording sessions

use std::path::Path;

use super::frame::{AudioFormat, AudioFrame, FRAME_DURATION, TRANSPORT_FORMAT};
use super::resample::Resampler;
use crate::{Error, Result};

/// Read a 16-bit PCM WAV file and cut it into 20ms transport frames
///
/// Audio in any other rate or layout is converted to 48 kHz stereo first. The
/// last frame is padded with silence.
///
/// # Errors
///
/// Returns error if the file cannot be read or is not 16-bit integer PCM
pub fn read_transport_frames(path: &Path) -> Result<Vec<AudioFrame>> {
    let reader = hound::WavReader::open(path).map_err(|e| Error::Audio(format!("{}: {e}", path.display())))?;
    let spec = reader.spec();
    if spec.bits_per_sample != 16 || spec.sample_format != hound::SampleFormat::Int {
        return Err(Error::InvalidAudioFormat(format!(
            "{} must be 16-bit PCM, got {}-bit {:?}",
            path.display(),
            spec.bits_per_sample,
            spec.sample_format
        )));
    }

    let samples = reader
        .into_samples::<i16>()
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Audio(e.to_string()))?;
    let format = AudioFormat::new(spec.sample_rate, spec.channels);

    tracing::debug!(
        path = %path.display(),
        sample_rate = spec.sample_rate,
        channels = spec.channels,
        samples = samples.len(),
        "read WAV"
    );

    let transport = if format == TRANSPORT_FORMAT {
        AudioFrame::from_samples(&samples, TRANSPORT_FORMAT)
    } else {
        convert_to_transport(&samples, format)?
    };
    Ok(split_frames(&transport))
}

fn convert_to_transport(samples: &[i16], format: AudioFormat) -> Result<AudioFrame> {
    let channels = usize::from(format.channels.max(1));
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    let mono: Vec<i16> = samples
        .chunks_exact(channels)
        .map(|frame| (frame.iter().map(|&s| i32::from(s)).sum::<i32>() / channels as i32) as i16)
        .collect();

    let mono_format = AudioFormat::mono(format.sample_rate);
    let mut resampler = Resampler::to_playback(format.sample_rate)?;
    let step = mono_format.bytes_for(FRAME_DURATION) / mono_format.frame_bytes();

    let mut out = Vec::new();
    for chunk in mono.chunks(step.max(1)) {
        let frame = AudioFrame::from_samples(chunk, mono_format);
        out.extend_from_slice(resampler.process(&frame)?.data());
    }
    out.extend_from_slice(resampler.finish()?.data());
    AudioFrame::new(out, TRANSPORT_FORMAT)
}

/// Cut audio into 20ms frames, padding the last one with silence
#[must_use]
pub fn split_frames(audio: &AudioFrame) -> Vec<AudioFrame> {
    let format = audio.format();
    let frame_bytes = format.bytes_for(FRAME_DURATION);
    audio
        .data()
        .chunks(frame_bytes)
        .filter_map(|chunk| {
            let mut data = chunk.to_vec();
            data.resize(frame_bytes, 0);
            AudioFrame::new(data, format).ok()
        })
        .collect()
}

/// Encode frames as an in-memory WAV file
///
/// # Errors
///
/// Returns error if the frames disagree on format or encoding fails
pub fn encode_wav(frames: &[AudioFrame], format: AudioFormat) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: format.channels,
        sample_rate: format.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;
        for frame in frames {
            frame.expect_format(format)?;
            for sample in frame.samples() {
                writer
                    .write_sample(sample)
                    .map_err(|e| Error::Audio(e.to_string()))?;
            }
        }
        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

/// Write frames to a WAV file
///
/// # Errors
///
/// Returns error if encoding or writing fails
pub fn write_wav(path: &Path, frames: &[AudioFrame], format: AudioFormat) -> Result<()> {
    let bytes = encode_wav(frames, format)?;
    std::fs::write(path, bytes)?;
    tracing::debug!(path = %path.display(), frames = frames.len(), "wrote WAV");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn transport_wav_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.wav");

        let frames = vec![
            AudioFrame::from_samples(&[100; 1920], TRANSPORT_FORMAT),
            AudioFrame::from_samples(&[-100; 1920], TRANSPORT_FORMAT),
        ];
        write_wav(&path, &frames, TRANSPORT_FORMAT).unwrap();

        let read = read_transport_frames(&path).unwrap();
        assert_eq!(read, frames);
    }

    #[test]
    fn mono_wav_is_converted_to_transport() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mono.wav");
        let format = AudioFormat::mono(16_000);
        let second = AudioFrame::silence(format, Duration::from_secs(1));
        write_wav(&path, &[second], format).unwrap();

        let frames = read_transport_frames(&path).unwrap();
        assert!(frames.iter().all(|f| f.format() == TRANSPORT_FORMAT && f.len() == 3840));
        assert!(frames.len().abs_diff(50) <= 1);
    }

    #[test]
    fn partial_last_frame_is_padded() {
        let audio = AudioFrame::silence(TRANSPORT_FORMAT, Duration::from_millis(30));
        let frames = split_frames(&audio);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].len(), 3840);
    }

    #[test]
    fn mismatched_frame_format_is_rejected() {
        let frames = vec![AudioFrame::silence(AudioFormat::mono(24_000), FRAME_DURATION)];
        assert!(encode_wav(&frames, TRANSPORT_FORMAT).is_err());
    }
}
