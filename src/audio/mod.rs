//! # Audio Processing Module
//!
//! Format handling for the two client protocols the gateway bridges.
//!
//! ## Key Components:
//! - **Codec**: G.711 mu-law encode/decode and naive 8/16/24 kHz resampling
//! - **Audio Buffer**: bounded per-turn accumulator for browser audio
//!
//! ## Audio Formats:
//! - **Browser → AI**: 16 kHz, 16-bit little-endian PCM, mono (passed through)
//! - **Telephony → AI**: 8 kHz mu-law, upsampled to 16 kHz PCM
//! - **AI → Browser**: 24 kHz PCM, base64 in JSON envelopes
//! - **AI → Telephony**: 24 kHz PCM, decimated to 8 kHz mu-law

pub mod buffer;
pub mod codec;

pub use buffer::AudioBuffer;
