//! # Audio Codec
//!
//! Stateless conversions between the telephony audio formats and the linear
//! PCM16 the realtime AI service speaks.
//!
//! ## Formats:
//! - **audio/x-mulaw**: G.711 µ-law, 1 byte per sample (telephony default, 8kHz)
//! - **audio/x-alaw**: G.711 A-law, 1 byte per sample
//! - **audio/x-raw / audio/L16**: already PCM16, passed through
//!
//! All PCM buffers are mono, 16-bit signed, little-endian. A trailing odd byte
//! in a PCM buffer is not a whole sample and is dropped when samples are read.
//!
//! ## Rust Concepts:
//! - **FromStr**: Parses the encoding tag into a closed enum, so a bad tag fails once at the edge
//! - **byteorder**: Reads and writes little-endian samples without manual bit shuffling

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Cursor;
use std::str::FromStr;

use crate::error::{BridgeError, BridgeResult};

/// Highest sample rate we accept from either side.
pub const MAX_SAMPLE_RATE: u32 = 192_000;

const ULAW_BIAS: i32 = 0x84;
const ULAW_CLIP: i32 = 32635;

/// Audio encodings the telephony side may announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AudioEncoding {
    Mulaw,
    Alaw,
    Raw,
    L16,
}

impl AudioEncoding {
    /// Wire tag for this encoding.
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioEncoding::Mulaw => "audio/x-mulaw",
            AudioEncoding::Alaw => "audio/x-alaw",
            AudioEncoding::Raw => "audio/x-raw",
            AudioEncoding::L16 => "audio/L16",
        }
    }

    /// True for the encodings that are already linear PCM16.
    pub fn is_linear(&self) -> bool {
        matches!(self, AudioEncoding::Raw | AudioEncoding::L16)
    }
}

impl FromStr for AudioEncoding {
    type Err = BridgeError;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        match tag {
            "audio/x-mulaw" => Ok(AudioEncoding::Mulaw),
            "audio/x-alaw" => Ok(AudioEncoding::Alaw),
            "audio/x-raw" => Ok(AudioEncoding::Raw),
            "audio/L16" => Ok(AudioEncoding::L16),
            other => Err(BridgeError::UnsupportedEncoding(other.to_string())),
        }
    }
}

impl fmt::Display for AudioEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Negotiated audio format of one telephony stream.
///
/// Only constructible through [`AudioFormat::new`], which validates the rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    encoding: AudioEncoding,
    sample_rate: u32,
}

impl AudioFormat {
    pub fn new(encoding: AudioEncoding, sample_rate: u32) -> BridgeResult<Self> {
        if sample_rate == 0 || sample_rate > MAX_SAMPLE_RATE {
            return Err(BridgeError::InvalidSampleRate(sample_rate));
        }
        Ok(Self {
            encoding,
            sample_rate,
        })
    }

    /// Parse a wire encoding tag and rate, as announced in a stream start frame.
    pub fn parse(encoding: &str, sample_rate: u32) -> BridgeResult<Self> {
        Self::new(encoding.parse()?, sample_rate)
    }

    pub fn encoding(&self) -> AudioEncoding {
        self.encoding
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl Default for AudioFormat {
    /// Telephony default: µ-law at 8kHz.
    fn default() -> Self {
        Self {
            encoding: AudioEncoding::Mulaw,
            sample_rate: 8000,
        }
    }
}

/// Convert telephony audio to PCM16 at `dst_rate`.
///
/// ## Parameters:
/// - **bytes**: Decoded (not base64) media payload
/// - **encoding**: Negotiated encoding; parse wire tags such as `audio/x-mulaw` with [`str::parse`]
/// - **src_rate / dst_rate**: Sample rates in Hz; resampling only happens when they differ
///
/// Linear input at the target rate is returned unchanged.
pub fn to_linear16(bytes: &[u8], encoding: AudioEncoding, src_rate: u32, dst_rate: u32) -> Vec<u8> {
    if encoding.is_linear() && src_rate == dst_rate {
        return bytes.to_vec();
    }

    let samples: Vec<i16> = match encoding {
        AudioEncoding::Mulaw => bytes.iter().map(|&b| ulaw_to_linear(b)).collect(),
        AudioEncoding::Alaw => bytes.iter().map(|&b| alaw_to_linear(b)).collect(),
        AudioEncoding::Raw | AudioEncoding::L16 => read_samples(bytes),
    };

    samples_to_bytes(&resample(&samples, src_rate, dst_rate))
}

/// Convert PCM16 at `src_rate` to µ-law at `dst_rate`.
pub fn from_linear16(bytes: &[u8], src_rate: u32, dst_rate: u32) -> Vec<u8> {
    let samples = read_samples(bytes);
    resample(&samples, src_rate, dst_rate)
        .into_iter()
        .map(linear_to_ulaw)
        .collect()
}

/// Linear-interpolation resampler.
///
/// `n` input samples become `round(n * dst_rate / src_rate)` output samples.
/// Positions are computed in exact integer arithmetic, so long calls do not
/// drift.
pub fn resample(samples: &[i16], src_rate: u32, dst_rate: u32) -> Vec<i16> {
    if src_rate == dst_rate || samples.is_empty() || src_rate == 0 || dst_rate == 0 {
        return samples.to_vec();
    }

    let n = samples.len() as u64;
    let src = src_rate as u64;
    let dst = dst_rate as u64;
    let out_len = (n * dst + src / 2) / src;
    let last = samples.len() - 1;

    (0..out_len)
        .map(|i| {
            let position = i * src;
            let index = ((position / dst) as usize).min(last);
            let frac = (position % dst) as i64;
            let s0 = samples[index] as i64;
            let s1 = samples[(index + 1).min(last)] as i64;
            (s0 + (s1 - s0) * frac / dst as i64) as i16
        })
        .collect()
}

/// Decode one G.711 µ-law byte.
pub fn ulaw_to_linear(byte: u8) -> i16 {
    let value = !byte;
    let exponent = (value >> 4) & 0x07;
    let mantissa = (value & 0x0F) as i32;
    let magnitude = (((mantissa << 3) + ULAW_BIAS) << exponent) - ULAW_BIAS;
    if value & 0x80 != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// Encode one sample as G.711 µ-law.
pub fn linear_to_ulaw(sample: i16) -> u8 {
    let mut pcm = sample as i32;
    let sign: u8 = if pcm < 0 {
        pcm = -pcm;
        0x80
    } else {
        0
    };
    pcm = pcm.min(ULAW_CLIP) + ULAW_BIAS;

    // Segment = position of the highest set bit above bit 7
    let mut exponent: u8 = 7;
    let mut mask = 0x4000;
    while exponent > 0 && pcm & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = ((pcm >> (exponent + 3)) & 0x0F) as u8;
    !(sign | (exponent << 4) | mantissa)
}

/// Decode one G.711 A-law byte.
pub fn alaw_to_linear(byte: u8) -> i16 {
    let value = byte ^ 0x55;
    let exponent = (value >> 4) & 0x07;
    let mantissa = (value & 0x0F) as i32;
    let magnitude = if exponent == 0 {
        (mantissa << 4) + 8
    } else {
        ((mantissa << 4) + 0x108) << (exponent - 1)
    };
    // A-law sets the sign bit for positive samples
    if value & 0x80 != 0 {
        magnitude as i16
    } else {
        -magnitude as i16
    }
}

/// Read little-endian PCM16 samples, ignoring a trailing odd byte.
pub fn read_samples(bytes: &[u8]) -> Vec<i16> {
    let mut cursor = Cursor::new(bytes);
    let mut samples = Vec::with_capacity(bytes.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample);
    }
    samples
}

fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = vec![0u8; samples.len() * 2];
    LittleEndian::write_i16_into(samples, &mut out);
    out
}
