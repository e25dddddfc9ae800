//! PCM frame conversion between the two legs of a relay session.
//!
//! Conversion is a pure function of the input buffer and the two format
//! descriptors: samples are decoded into normalized `f64`, linearly
//! resampled when the rates differ, and re-encoded at the target depth and
//! byte order.

use crate::error::ConversionError;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// Sample rate used by the telephony side in every observed deployment.
pub const TELEPHONY_SAMPLE_RATE: u32 = 8000;
/// Sample rate requested from the voice-AI provider by default.
pub const AGENT_SAMPLE_RATE: u32 = 16000;

const I16_SCALE: f64 = 32768.0;
const I32_SCALE: f64 = 2147483648.0;

/// How samples are represented on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    /// Signed integer linear PCM.
    Pcm,
    /// IEEE-754 float PCM in the range [-1, 1].
    Float,
    /// Signed integer linear PCM carried as base64 text.
    Base64Pcm,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endianness {
    Little,
    Big,
}

/// Describes a mono PCM stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub bit_depth: u16,
    pub encoding: Encoding,
    pub endianness: Endianness,
}

/// The decoded representation of one sample.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SampleKind {
    I16,
    I32,
    F32,
}

impl SampleKind {
    fn width(self) -> usize {
        match self {
            SampleKind::I16 => 2,
            SampleKind::I32 | SampleKind::F32 => 4,
        }
    }
}

impl AudioFormat {
    /// 8 kHz signed 16-bit little-endian, as spoken by the call leg.
    pub const TELEPHONY: AudioFormat = AudioFormat::pcm16(TELEPHONY_SAMPLE_RATE);
    /// 16 kHz signed 16-bit little-endian, as requested from the agent.
    pub const AGENT_DEFAULT: AudioFormat = AudioFormat::pcm16(AGENT_SAMPLE_RATE);

    /// Signed 16-bit little-endian PCM at `sample_rate`.
    pub const fn pcm16(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            bit_depth: 16,
            encoding: Encoding::Pcm,
            endianness: Endianness::Little,
        }
    }

    /// 32-bit little-endian float PCM at `sample_rate`.
    pub const fn float32(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            bit_depth: 32,
            encoding: Encoding::Float,
            endianness: Endianness::Little,
        }
    }

    pub const fn with_encoding(self, encoding: Encoding) -> Self {
        Self { encoding, ..self }
    }

    pub const fn with_endianness(self, endianness: Endianness) -> Self {
        Self { endianness, ..self }
    }

    fn sample_kind(&self) -> Result<SampleKind, ConversionError> {
        let kind = match (self.encoding, self.bit_depth) {
            _ if self.sample_rate == 0 => None,
            (Encoding::Pcm | Encoding::Base64Pcm, 16) => Some(SampleKind::I16),
            (Encoding::Pcm | Encoding::Base64Pcm, 32) => Some(SampleKind::I32),
            (Encoding::Float, 32) => Some(SampleKind::F32),
            _ => None,
        };
        kind.ok_or(ConversionError::UnsupportedFormat {
            sample_rate: self.sample_rate,
            bit_depth: self.bit_depth,
            encoding: self.encoding,
        })
    }

    /// Checks that this descriptor names a supported combination.
    pub fn validate(&self) -> Result<(), ConversionError> {
        self.sample_kind().map(|_| ())
    }

    /// The format name used by provider negotiation payloads, e.g. `pcm_s16le`.
    pub fn wire_name(&self) -> String {
        let kind = match self.encoding {
            Encoding::Float => 'f',
            Encoding::Pcm | Encoding::Base64Pcm => 's',
        };
        let order = match self.endianness {
            Endianness::Little => "le",
            Endianness::Big => "be",
        };
        format!("pcm_{}{}{}", kind, self.bit_depth, order)
    }
}

/// A buffer of audio tagged with the format it was produced in.
#[derive(Clone, Debug, PartialEq)]
pub struct AudioFrame {
    pub data: Bytes,
    pub format: AudioFormat,
}

impl AudioFrame {
    pub fn new(data: impl Into<Bytes>, format: AudioFormat) -> Self {
        Self {
            data: data.into(),
            format,
        }
    }

    /// Re-encodes this frame at `target`. The original frame is untouched.
    pub fn convert_to(&self, target: &AudioFormat) -> Result<AudioFrame, ConversionError> {
        let data = convert(&self.data, &self.format, target)?;
        Ok(AudioFrame::new(data, *target))
    }
}

/// Converts `buffer`, described by `source`, into a new buffer in `target`.
///
/// Rates are bridged by linear interpolation producing
/// `floor(n * target_rate / source_rate)` samples. Integer samples are
/// normalized by 2^(bits-1) in both directions, so 16-bit audio survives a
/// same-rate trip through float unchanged.
pub fn convert(
    buffer: &[u8],
    source: &AudioFormat,
    target: &AudioFormat,
) -> Result<Vec<u8>, ConversionError> {
    let source_kind = source.sample_kind()?;
    let target_kind = target.sample_kind()?;

    let raw: Cow<'_, [u8]> = match source.encoding {
        Encoding::Base64Pcm => Cow::Owned(decode_base64(buffer)?),
        Encoding::Pcm | Encoding::Float => Cow::Borrowed(buffer),
    };
    let width = source_kind.width();
    if raw.len() % width != 0 {
        return Err(ConversionError::MisalignedBuffer {
            len: raw.len(),
            width,
        });
    }

    if source == target {
        return Ok(buffer.to_vec());
    }

    let samples = decode_samples(&raw, source_kind, source.endianness);
    let resampled = resample_linear(&samples, source.sample_rate, target.sample_rate);
    let pcm = encode_samples(&resampled, target_kind, target.endianness);

    Ok(match target.encoding {
        Encoding::Base64Pcm => encode_base64(&pcm).into_bytes(),
        Encoding::Pcm | Encoding::Float => pcm,
    })
}

/// Encodes raw bytes as standard base64.
pub fn encode_base64(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

/// Decodes standard base64 into raw bytes.
pub fn decode_base64(data: impl AsRef<[u8]>) -> Result<Vec<u8>, ConversionError> {
    Ok(base64::engine::general_purpose::STANDARD.decode(data)?)
}

fn decode_samples(raw: &[u8], kind: SampleKind, order: Endianness) -> Vec<f64> {
    raw.chunks_exact(kind.width())
        .map(|c| match (kind, order) {
            (SampleKind::I16, Endianness::Little) => i16::from_le_bytes([c[0], c[1]]) as f64 / I16_SCALE,
            (SampleKind::I16, Endianness::Big) => i16::from_be_bytes([c[0], c[1]]) as f64 / I16_SCALE,
            (SampleKind::I32, Endianness::Little) => {
                i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64 / I32_SCALE
            }
            (SampleKind::I32, Endianness::Big) => {
                i32::from_be_bytes([c[0], c[1], c[2], c[3]]) as f64 / I32_SCALE
            }
            (SampleKind::F32, Endianness::Little) => f32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64,
            (SampleKind::F32, Endianness::Big) => f32::from_be_bytes([c[0], c[1], c[2], c[3]]) as f64,
        })
        .collect()
}

fn encode_samples(samples: &[f64], kind: SampleKind, order: Endianness) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * kind.width());
    for &sample in samples {
        match kind {
            SampleKind::I16 => {
                let v = (sample * I16_SCALE).round().clamp(i16::MIN as f64, i16::MAX as f64) as i16;
                match order {
                    Endianness::Little => out.extend_from_slice(&v.to_le_bytes()),
                    Endianness::Big => out.extend_from_slice(&v.to_be_bytes()),
                }
            }
            SampleKind::I32 => {
                let v = (sample * I32_SCALE).round().clamp(i32::MIN as f64, i32::MAX as f64) as i32;
                match order {
                    Endianness::Little => out.extend_from_slice(&v.to_le_bytes()),
                    Endianness::Big => out.extend_from_slice(&v.to_be_bytes()),
                }
            }
            SampleKind::F32 => {
                let v = sample as f32;
                match order {
                    Endianness::Little => out.extend_from_slice(&v.to_le_bytes()),
                    Endianness::Big => out.extend_from_slice(&v.to_be_bytes()),
                }
            }
        }
    }
    out
}

/// Linear interpolation between neighbouring samples. Positions are computed
/// in integer arithmetic so the output depends only on the input.
fn resample_linear(samples: &[f64], from_rate: u32, to_rate: u32) -> Vec<f64> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }
    let from = from_rate as u64;
    let to = to_rate as u64;
    let out_len = (samples.len() as u64 * to / from) as usize;
    let last = samples.len() - 1;

    (0..out_len as u64)
        .map(|i| {
            let numerator = i * from;
            let idx = (numerator / to) as usize;
            let frac = (numerator % to) as f64 / to as f64;
            let a = samples[idx.min(last)];
            let b = samples[(idx + 1).min(last)];
            a + (b - a) * frac
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn pcm16_bytes(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    fn pcm16_samples(bytes: &[u8]) -> Vec<i16> {
        bytes
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect()
    }

    fn sine(len: usize, freq: f64, rate: f64, amplitude: f64) -> Vec<i16> {
        (0..len)
            .map(|n| (amplitude * (2.0 * std::f64::consts::PI * freq * n as f64 / rate).sin()) as i16)
            .collect()
    }

    #[test]
    fn test_downsample_agent_frame_to_telephony() {
        // 20 ms of 16 kHz audio: 320 samples, 640 bytes.
        let input = pcm16_bytes(&sine(320, 440.0, 16000.0, 8000.0));
        assert_eq!(input.len(), 640);

        let output = convert(&input, &AudioFormat::AGENT_DEFAULT, &AudioFormat::TELEPHONY).unwrap();
        assert_eq!(output.len(), 320);

        // A 2:1 ratio lands exactly on every other source sample.
        let src = pcm16_samples(&input);
        let dst = pcm16_samples(&output);
        for (i, v) in dst.iter().enumerate() {
            assert_eq!(*v, src[i * 2]);
        }
    }

    #[test]
    fn test_upsample_doubles_length_and_interpolates() {
        let input = pcm16_bytes(&[0, 1000, -1000, 2000]);
        let output = convert(&input, &AudioFormat::TELEPHONY, &AudioFormat::AGENT_DEFAULT).unwrap();
        assert_eq!(pcm16_samples(&output), vec![0, 500, 1000, 0, -1000, 500, 2000, 2000]);
    }

    #[test]
    fn test_round_trip_is_amplitude_bounded() {
        let original = sine(320, 200.0, 16000.0, 10000.0);
        let input = pcm16_bytes(&original);

        let down = convert(&input, &AudioFormat::AGENT_DEFAULT, &AudioFormat::TELEPHONY).unwrap();
        let up = convert(&down, &AudioFormat::TELEPHONY, &AudioFormat::AGENT_DEFAULT).unwrap();
        let restored = pcm16_samples(&up);
        assert_eq!(restored.len(), original.len());

        let diffs: Vec<i32> = original
            .iter()
            .zip(&restored)
            .map(|(a, b)| (*a as i32 - *b as i32).abs())
            .collect();
        // Interior samples are averages of their neighbours; only the final
        // sample, which has no right neighbour, deviates by a full step.
        assert!(diffs[..diffs.len() - 1].iter().all(|d| *d <= 64), "{diffs:?}");
        assert!(diffs.iter().all(|d| *d <= 1000), "{diffs:?}");
    }

    #[test]
    fn test_conversion_is_deterministic() {
        let input = pcm16_bytes(&sine(480, 330.0, 24000.0, 12000.0));
        let source = AudioFormat::pcm16(24000);
        let targets = [
            AudioFormat::TELEPHONY,
            AudioFormat::AGENT_DEFAULT,
            AudioFormat::float32(16000),
            AudioFormat::pcm16(16000).with_encoding(Encoding::Base64Pcm),
            AudioFormat::pcm16(8000).with_endianness(Endianness::Big),
        ];
        for target in &targets {
            let first = convert(&input, &source, target).unwrap();
            let second = convert(&input, &source, target).unwrap();
            assert_eq!(first, second, "non-deterministic output for {target:?}");
        }
    }

    #[test]
    fn test_rejects_misaligned_buffers() {
        for len in [1usize, 3, 5, 321, 639] {
            let input = vec![0u8; len];
            let err = convert(&input, &AudioFormat::AGENT_DEFAULT, &AudioFormat::TELEPHONY).unwrap_err();
            assert_eq!(err, ConversionError::MisalignedBuffer { len, width: 2 });
        }

        let err = convert(&[0u8; 6], &AudioFormat::float32(16000), &AudioFormat::TELEPHONY).unwrap_err();
        assert_eq!(err, ConversionError::MisalignedBuffer { len: 6, width: 4 });
    }

    #[test]
    fn test_rejects_unsupported_formats() {
        let eight_bit = AudioFormat {
            bit_depth: 8,
            ..AudioFormat::TELEPHONY
        };
        assert!(matches!(
            convert(&[0u8; 4], &eight_bit, &AudioFormat::TELEPHONY),
            Err(ConversionError::UnsupportedFormat { bit_depth: 8, .. })
        ));

        let float16 = AudioFormat {
            bit_depth: 16,
            ..AudioFormat::float32(16000)
        };
        assert!(float16.validate().is_err());

        let zero_rate = AudioFormat::pcm16(0);
        assert!(matches!(
            convert(&[0u8; 4], &AudioFormat::TELEPHONY, &zero_rate),
            Err(ConversionError::UnsupportedFormat { sample_rate: 0, .. })
        ));
    }

    #[test]
    fn test_identical_formats_copy_buffer() {
        let input = pcm16_bytes(&[1, -2, 3, -4]);
        let output = convert(&input, &AudioFormat::TELEPHONY, &AudioFormat::TELEPHONY).unwrap();
        assert_eq!(output, input);
    }

    #[test]
    fn test_int16_float_normalization() {
        let input = pcm16_bytes(&[16384, i16::MIN, 0]);
        let output = convert(&input, &AudioFormat::pcm16(8000), &AudioFormat::float32(8000)).unwrap();
        let floats: Vec<f32> = output
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(floats.len(), 3);
        assert_abs_diff_eq!(floats[0], 0.5, epsilon = 0.0001);
        assert_abs_diff_eq!(floats[1], -1.0, epsilon = 0.0001);
        assert_abs_diff_eq!(floats[2], 0.0, epsilon = 0.0001);

        // Back to int16 is exact at the same rate.
        let back = convert(&output, &AudioFormat::float32(8000), &AudioFormat::pcm16(8000)).unwrap();
        assert_eq!(back, input);
    }

    #[test]
    fn test_float_input_is_clamped() {
        let input: Vec<u8> = [2.0f32, -2.0, f32::NAN]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let output = convert(&input, &AudioFormat::float32(8000), &AudioFormat::TELEPHONY).unwrap();
        assert_eq!(pcm16_samples(&output), vec![i16::MAX, i16::MIN, 0]);
    }

    #[test]
    fn test_endianness_swap() {
        let input = pcm16_bytes(&[0x0102]);
        let big = AudioFormat::TELEPHONY.with_endianness(Endianness::Big);
        let output = convert(&input, &AudioFormat::TELEPHONY, &big).unwrap();
        assert_eq!(output, vec![0x01, 0x02]);
    }

    #[test]
    fn test_base64_wrapped_pcm() {
        let samples = [256i16, -256, 0, 1000];
        let encoded = encode_base64(&pcm16_bytes(&samples));
        let b64 = AudioFormat::TELEPHONY.with_encoding(Encoding::Base64Pcm);

        let raw = convert(encoded.as_bytes(), &b64, &AudioFormat::TELEPHONY).unwrap();
        assert_eq!(pcm16_samples(&raw), samples.to_vec());

        let wrapped = convert(&raw, &AudioFormat::TELEPHONY, &b64).unwrap();
        assert_eq!(String::from_utf8(wrapped).unwrap(), encoded);

        assert!(matches!(
            convert(b"invalid_base64!", &b64, &AudioFormat::TELEPHONY),
            Err(ConversionError::InvalidBase64(_))
        ));

        // A single decoded byte cannot form a 16-bit sample.
        let odd = encode_base64(&[0x00]);
        assert_eq!(
            convert(odd.as_bytes(), &b64, &AudioFormat::TELEPHONY),
            Err(ConversionError::MisalignedBuffer { len: 1, width: 2 })
        );
    }

    #[test]
    fn test_empty_buffer_converts_to_empty() {
        let output = convert(&[], &AudioFormat::AGENT_DEFAULT, &AudioFormat::TELEPHONY).unwrap();
        assert!(output.is_empty());
    }

    #[test]
    fn test_audio_frame_convert_to() {
        let frame = AudioFrame::new(vec![0u8; 640], AudioFormat::AGENT_DEFAULT);
        let converted = frame.convert_to(&AudioFormat::TELEPHONY).unwrap();
        assert_eq!(converted.data.len(), 320);
        assert_eq!(converted.format, AudioFormat::TELEPHONY);
        assert_eq!(frame.data.len(), 640);
    }

    #[test]
    fn test_wire_name() {
        assert_eq!(AudioFormat::TELEPHONY.wire_name(), "pcm_s16le");
        assert_eq!(AudioFormat::float32(16000).wire_name(), "pcm_f32le");
        assert_eq!(
            AudioFormat::pcm16(8000).with_endianness(Endianness::Big).wire_name(),
            "pcm_s16be"
        );
    }
}
