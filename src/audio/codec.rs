//! # Sample Format Conversion
//!
//! Stateless conversions between the audio formats the gateway speaks:
//!
//! - **8-bit G.711 mu-law** at 8 kHz (telephony media streams)
//! - **16-bit little-endian linear PCM** at 16 kHz (audio sent to the AI service)
//! - **16-bit little-endian linear PCM** at 24 kHz (audio returned by the AI service)
//!
//! ## Resampling
//! Rate changes are naive: upsampling duplicates every sample and downsampling
//! keeps every third sample. There is no interpolation and no anti-alias
//! filter, so downsampled speech carries some aliasing. That quality ceiling
//! is accepted for narrow-band telephone audio.

use byteorder::{ByteOrder, LittleEndian};

/// Clip level applied before biasing, keeps the biased magnitude inside 15 bits.
const MULAW_CLIP: i32 = 32635;

/// Bias added to the magnitude so every segment has a leading one bit.
const MULAW_BIAS: i32 = 0x84;

/// Canonical mu-law expansion for every possible byte, computed at compile time.
pub const MULAW_DECODE_TABLE: [i16; 256] = build_decode_table();

const fn expand(byte: u8) -> i16 {
    let inverted = !byte;
    let exponent = (inverted >> 4) & 0x07;
    let mantissa = (inverted & 0x0F) as i32;
    let magnitude = (((mantissa << 3) + MULAW_BIAS) << exponent) - MULAW_BIAS;

    if inverted & 0x80 != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

const fn build_decode_table() -> [i16; 256] {
    let mut table = [0i16; 256];
    let mut i = 0;
    while i < 256 {
        table[i] = expand(i as u8);
        i += 1;
    }
    table
}

/// Decode one mu-law byte into a linear 16-bit sample.
#[inline]
pub fn decode_mulaw(byte: u8) -> i16 {
    MULAW_DECODE_TABLE[byte as usize]
}

/// Encode one linear 16-bit sample as a mu-law byte.
///
/// The magnitude is computed in 32 bits so `i16::MIN` does not overflow.
pub fn encode_mulaw(sample: i16) -> u8 {
    let mut magnitude = sample as i32;
    let sign: u8 = if magnitude < 0 {
        magnitude = -magnitude;
        0x80
    } else {
        0
    };

    magnitude = magnitude.min(MULAW_CLIP) + MULAW_BIAS;

    // Segment = position of the highest set bit among bits 14..7.
    let mut exponent: u8 = 7;
    let mut mask: i32 = 0x4000;
    while exponent > 0 && magnitude & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }

    let mantissa = ((magnitude >> (exponent + 3)) & 0x0F) as u8;
    !(sign | (exponent << 4) | mantissa)
}

/// Interpret a byte slice as little-endian 16-bit samples.
///
/// A trailing odd byte is ignored.
pub fn pcm_bytes_to_samples(bytes: &[u8]) -> Vec<i16> {
    bytes.chunks_exact(2).map(LittleEndian::read_i16).collect()
}

/// Serialize samples as little-endian 16-bit PCM.
pub fn samples_to_pcm_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = vec![0u8; samples.len() * 2];
    LittleEndian::write_i16_into(samples, &mut out);
    out
}

/// Double the sample rate by repeating each sample.
pub fn upsample_2x(samples: &[i16]) -> Vec<i16> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        out.push(sample);
        out.push(sample);
    }
    out
}

/// Divide the sample rate by three, keeping samples 0, 3, 6, ...
pub fn decimate_3x(samples: &[i16]) -> Vec<i16> {
    samples.iter().step_by(3).copied().collect()
}

/// Telephony inbound path: 8 kHz mu-law bytes to 16 kHz little-endian PCM.
///
/// Produces exactly four output bytes per input byte.
pub fn mulaw_8k_to_pcm_16k(mulaw: &[u8]) -> Vec<u8> {
    let decoded: Vec<i16> = mulaw.iter().map(|&b| decode_mulaw(b)).collect();
    samples_to_pcm_bytes(&upsample_2x(&decoded))
}

/// Telephony outbound path: 24 kHz little-endian PCM to 8 kHz mu-law bytes.
///
/// Produces one byte per three input samples (rounded up). A trailing odd
/// byte in the input is ignored.
pub fn pcm_24k_to_mulaw_8k(pcm: &[u8]) -> Vec<u8> {
    decimate_3x(&pcm_bytes_to_samples(pcm))
        .into_iter()
        .map(encode_mulaw)
        .collect()
}
