use std::{f32::consts::PI, io::Cursor, path::Path};

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};

use crate::{AudioConfig, DriftError, Result};

/// Decoded, mono, normalised audio ready for analysis.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBuffer {
    /// Samples in `[-1.0, 1.0]`.
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl SampleBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn duration_ms(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 * 1000.0 / self.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// What the audio source collaborator hands to the analyzer.
#[derive(Debug, Clone)]
pub enum AudioSource {
    /// Raw container bytes that still need decoding.
    Encoded(Vec<u8>),
    /// Samples that were already decoded elsewhere.
    Decoded(SampleBuffer),
}

impl AudioSource {
    /// Returns mono samples, decoding the container if necessary.
    pub fn decode(&self) -> Result<SampleBuffer> {
        match self {
            Self::Encoded(bytes) => decode_wav(bytes),
            Self::Decoded(buffer) => {
                if buffer.sample_rate == 0 {
                    return Err(DriftError::UnsupportedFormat(
                        "decoded buffer reports a zero sample rate".into(),
                    ));
                }
                Ok(buffer.clone())
            }
        }
    }
}

/// Decodes a RIFF/WAVE byte stream and downmixes it to mono.
pub fn decode_wav(bytes: &[u8]) -> Result<SampleBuffer> {
    if bytes.len() < 12 || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        return Err(DriftError::UnsupportedFormat(format!(
            "expected a RIFF/WAVE container, found {}",
            describe_container(bytes)
        )));
    }

    let mut reader = WavReader::new(Cursor::new(bytes)).map_err(map_wav_error)?;
    let spec = reader.spec();
    if spec.channels == 0 || spec.sample_rate == 0 {
        return Err(DriftError::UnsupportedFormat(
            "wav header declares zero channels or sample rate".into(),
        ));
    }

    let decoded: std::result::Result<Vec<f32>, hound::Error> =
        match (spec.sample_format, spec.bits_per_sample) {
            (SampleFormat::Int, 8) => reader
                .samples::<i8>()
                .map(|s| s.map(|v| v as f32 / 128.0))
                .collect(),
            (SampleFormat::Int, 16) => reader
                .samples::<i16>()
                .map(|s| s.map(|v| v as f32 / 32_768.0))
                .collect(),
            (SampleFormat::Int, 24) => reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / 8_388_608.0))
                .collect(),
            (SampleFormat::Int, 32) => reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / 2_147_483_648.0))
                .collect(),
            (SampleFormat::Float, 32) => reader.samples::<f32>().collect(),
            (format, bits) => {
                return Err(DriftError::UnsupportedFormat(format!(
                    "{format:?} samples at {bits} bits"
                )))
            }
        };
    let interleaved = decoded.map_err(map_wav_error)?;

    let channels = spec.channels as usize;
    let samples = interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect();

    Ok(SampleBuffer::new(samples, spec.sample_rate))
}

fn map_wav_error(err: hound::Error) -> DriftError {
    match err {
        hound::Error::IoError(io) => DriftError::Io(io),
        other => DriftError::UnsupportedFormat(other.to_string()),
    }
}

fn describe_container(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(b"ID3") || bytes.starts_with(&[0xFF, 0xFB]) {
        "an MP3 stream"
    } else if bytes.starts_with(b"OggS") {
        "an Ogg stream"
    } else if bytes.starts_with(b"fLaC") {
        "a FLAC stream"
    } else {
        "an unrecognised byte stream"
    }
}

/// Volume and bass-boost stage applied before handing audio to the player.
#[derive(Debug, Clone)]
pub struct PlaybackChain {
    volume: f32,
    shelf: Option<LowShelf>,
}

impl PlaybackChain {
    pub fn new(config: &AudioConfig, sample_rate: u32) -> Self {
        let shelf = config.bass_boost.then(|| {
            LowShelf::new(config.bass_frequency, config.bass_gain_db, sample_rate)
        });
        Self {
            volume: config.volume.clamp(0.0, 1.0),
            shelf,
        }
    }

    pub fn process(&mut self, samples: &mut [f32]) {
        for sample in samples.iter_mut() {
            let boosted = match self.shelf.as_mut() {
                Some(shelf) => shelf.process(*sample),
                None => *sample,
            };
            *sample = (boosted * self.volume).clamp(-1.0, 1.0);
        }
    }
}

/// RBJ low-shelf biquad.
#[derive(Debug, Clone)]
struct LowShelf {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
    x1: f32,
    x2: f32,
    y1: f32,
    y2: f32,
}

impl LowShelf {
    fn new(frequency: f32, gain_db: f32, sample_rate: u32) -> Self {
        let nyquist = sample_rate.max(1) as f32 * 0.5;
        let frequency = frequency.clamp(1.0, nyquist * 0.99);
        let a = 10f32.powf(gain_db / 40.0);
        let w0 = 2.0 * PI * frequency / sample_rate.max(1) as f32;
        let (sin, cos) = w0.sin_cos();
        let alpha = sin / 2.0 * 2f32.sqrt();
        let two_sqrt_a_alpha = 2.0 * a.sqrt() * alpha;

        let b0 = a * ((a + 1.0) - (a - 1.0) * cos + two_sqrt_a_alpha);
        let b1 = 2.0 * a * ((a - 1.0) - (a + 1.0) * cos);
        let b2 = a * ((a + 1.0) - (a - 1.0) * cos - two_sqrt_a_alpha);
        let a0 = (a + 1.0) + (a - 1.0) * cos + two_sqrt_a_alpha;
        let a1 = -2.0 * ((a - 1.0) + (a + 1.0) * cos);
        let a2 = (a + 1.0) + (a - 1.0) * cos - two_sqrt_a_alpha;

        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
            x1: 0.0,
            x2: 0.0,
            y1: 0.0,
            y2: 0.0,
        }
    }

    fn process(&mut self, x: f32) -> f32 {
        let y = self.b0 * x + self.b1 * self.x1 + self.b2 * self.x2
            - self.a1 * self.y1
            - self.a2 * self.y2;
        self.x2 = self.x1;
        self.x1 = x;
        self.y2 = self.y1;
        self.y1 = y;
        y
    }
}

/// Runs `buffer` through the playback chain and writes a 16-bit mono WAV.
pub fn render_playback(buffer: &SampleBuffer, config: &AudioConfig, path: &Path) -> Result<()> {
    let mut chain = PlaybackChain::new(config, buffer.sample_rate);
    let mut samples = buffer.samples.clone();
    chain.process(&mut samples);

    let spec = WavSpec {
        channels: 1,
        sample_rate: buffer.sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(path, spec).map_err(map_wav_error)?;
    for sample in samples {
        writer
            .write_sample((sample * i16::MAX as f32) as i16)
            .map_err(map_wav_error)?;
    }
    writer.finalize().map_err(map_wav_error)?;
    tracing::info!(path = %path.display(), "rendered playback audio");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wav_bytes(channels: u16, frames: &[[i16; 2]]) -> Vec<u8> {
        let spec = WavSpec {
            channels,
            sample_rate: 8_000,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = WavWriter::new(&mut cursor, spec).unwrap();
            for frame in frames {
                for sample in frame.iter().take(channels as usize) {
                    writer.write_sample(*sample).unwrap();
                }
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn decodes_and_downmixes_stereo_wav() {
        let bytes = wav_bytes(2, &[[16_384, 0], [-16_384, -16_384]]);
        let buffer = decode_wav(&bytes).unwrap();

        assert_eq!(buffer.sample_rate, 8_000);
        assert_eq!(buffer.samples.len(), 2);
        assert!((buffer.samples[0] - 0.25).abs() < 1e-4);
        assert!((buffer.samples[1] + 0.5).abs() < 1e-4);
    }

    #[test]
    fn rejects_non_wav_containers() {
        let err = decode_wav(b"ID3\x04\x00\x00\x00\x00\x00\x00\x00\x00").unwrap_err();
        assert!(matches!(err, DriftError::UnsupportedFormat(ref msg) if msg.contains("MP3")));
    }

    #[test]
    fn decoded_source_requires_sample_rate() {
        let source = AudioSource::Decoded(SampleBuffer::new(vec![0.0; 4], 0));
        assert!(matches!(
            source.decode(),
            Err(DriftError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn playback_chain_applies_volume_and_clamps() {
        let config = AudioConfig {
            volume: 0.5,
            bass_boost: false,
            ..AudioConfig::default()
        };
        let mut chain = PlaybackChain::new(&config, 48_000);
        let mut samples = vec![1.0, -0.5, 0.0];
        chain.process(&mut samples);
        assert_eq!(samples, vec![0.5, -0.25, 0.0]);
    }

    #[test]
    fn bass_boost_lifts_low_frequencies() {
        let config = AudioConfig {
            volume: 1.0,
            bass_boost: true,
            bass_frequency: 200.0,
            bass_gain_db: 6.0,
            ..AudioConfig::default()
        };
        let sample_rate = 8_000;
        let mut chain = PlaybackChain::new(&config, sample_rate);
        let mut tone: Vec<f32> = (0..sample_rate)
            .map(|i| 0.2 * (2.0 * PI * 50.0 * i as f32 / sample_rate as f32).sin())
            .collect();
        chain.process(&mut tone);

        let tail = &tone[tone.len() / 2..];
        let peak = tail.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));
        assert!(peak > 0.3, "expected boosted peak, got {peak}");
    }
}
