//! Codec interface and the built-in PCM codec.
//!
//! The registry is explicit: the host constructs one, registers any
//! additional codecs (e.g. Opus) and hands it to the engines. PCM is
//! always available.

use aoo_wire::AooError;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// A complete stream format description as exchanged in `/format`
/// messages: codec name, channel layout, rates, and an opaque blob of
/// codec-specific options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Format {
    pub codec: String,
    pub nchannels: i32,
    pub samplerate: i32,
    /// Encoder block length in sample frames.
    pub blocksize: i32,
    pub options: Vec<u8>,
}

impl Format {
    #[inline(always)]
    pub fn block_samples(&self) -> usize {
        (self.blocksize * self.nchannels) as usize
    }

    pub fn validate(&self) -> Result<(), AooError> {
        if self.nchannels > 0 && self.samplerate > 0 && self.blocksize > 0 {
            Ok(())
        } else {
            Err(AooError::BadArgument)
        }
    }
}

/// Stateful encoder instance. `encode` consumes exactly one block of
/// interleaved samples.
pub trait Encoder: Send {
    fn format(&self) -> &Format;

    /// Encodes `samples` into `out`, returning the payload size.
    fn encode(&mut self, samples: &[f32], out: &mut [u8]) -> Result<usize, AooError>;

    /// Drops any inter-block state.
    fn reset(&mut self);
}

/// Stateful decoder instance. `decode` produces exactly one block of
/// interleaved samples; `None` input asks for loss concealment.
pub trait Decoder: Send {
    fn format(&self) -> &Format;

    fn decode(&mut self, data: Option<&[u8]>, out: &mut [f32]) -> Result<(), AooError>;

    fn reset(&mut self);
}

/// A codec: a named factory for encoder/decoder pairs.
pub trait Codec: Send + Sync {
    fn name(&self) -> &str;

    /// Validates the format (including its options blob) and creates an
    /// encoder for it.
    fn make_encoder(&self, format: &Format) -> Result<Box<dyn Encoder>, AooError>;

    fn make_decoder(&self, format: &Format) -> Result<Box<dyn Decoder>, AooError>;
}

/// Explicit codec registry, passed to the engines at construction.
#[derive(Clone)]
pub struct CodecRegistry {
    codecs: FxHashMap<String, Arc<dyn Codec>>,
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CodecRegistry {
    /// Creates a registry with the built-in PCM codec.
    pub fn new() -> Self {
        let mut registry = Self {
            codecs: FxHashMap::default(),
        };
        registry.register(Arc::new(PcmCodec));
        registry
    }

    /// Registers a codec; returns `AlreadyExists` for duplicate names.
    pub fn register(&mut self, codec: Arc<dyn Codec>) -> Result<(), AooError> {
        let name = codec.name().to_string();
        if self.codecs.contains_key(&name) {
            log::warn!("codec '{name}' already registered");
            return Err(AooError::AlreadyExists);
        }
        log::debug!("registered codec '{name}'");
        self.codecs.insert(name, codec);
        Ok(())
    }

    pub fn find(&self, name: &str) -> Option<&Arc<dyn Codec>> {
        self.codecs.get(name)
    }
}

//------------------------------ PCM ---------------------------------//

pub const PCM_CODEC_NAME: &str = "pcm";

/// PCM sample widths, encoded as a single big-endian `i32` in the format
/// options blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum PcmDepth {
    Int16 = 0,
    Int24 = 1,
    Float32 = 2,
    Float64 = 3,
}

impl PcmDepth {
    #[inline(always)]
    pub const fn sample_size(self) -> usize {
        match self {
            Self::Int16 => 2,
            Self::Int24 => 3,
            Self::Float32 => 4,
            Self::Float64 => 8,
        }
    }

    pub const fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => Self::Int16,
            1 => Self::Int24,
            2 => Self::Float32,
            3 => Self::Float64,
            _ => return None,
        })
    }

    /// Serializes the depth as a PCM options blob.
    pub fn to_options(self) -> Vec<u8> {
        (self as i32).to_be_bytes().to_vec()
    }

    pub fn from_options(options: &[u8]) -> Result<Self, AooError> {
        let bytes: [u8; 4] = options.try_into().map_err(|_| AooError::BadFormat)?;
        Self::from_code(i32::from_be_bytes(bytes)).ok_or(AooError::BadFormat)
    }
}

/// The built-in uncompressed codec. Samples are packed big-endian.
pub struct PcmCodec;

impl Codec for PcmCodec {
    fn name(&self) -> &str {
        PCM_CODEC_NAME
    }

    fn make_encoder(&self, format: &Format) -> Result<Box<dyn Encoder>, AooError> {
        format.validate()?;
        let depth = PcmDepth::from_options(&format.options)?;
        Ok(Box::new(PcmEncoder {
            format: format.clone(),
            depth,
        }))
    }

    fn make_decoder(&self, format: &Format) -> Result<Box<dyn Decoder>, AooError> {
        format.validate()?;
        let depth = PcmDepth::from_options(&format.options)?;
        Ok(Box::new(PcmDecoder {
            format: format.clone(),
            depth,
        }))
    }
}

struct PcmEncoder {
    format: Format,
    depth: PcmDepth,
}

struct PcmDecoder {
    format: Format,
    depth: PcmDepth,
}

#[inline]
fn clamp_unit(x: f32) -> f32 {
    x.clamp(-1.0, 1.0)
}

#[inline]
fn write_sample(depth: PcmDepth, sample: f32, out: &mut [u8]) {
    match depth {
        PcmDepth::Int16 => {
            let v = (clamp_unit(sample) * 32767.0) as i16;
            out[..2].copy_from_slice(&v.to_be_bytes());
        }
        PcmDepth::Int24 => {
            let v = (clamp_unit(sample) as f64 * 8388607.0) as i32;
            out[..3].copy_from_slice(&v.to_be_bytes()[1..4]);
        }
        PcmDepth::Float32 => {
            out[..4].copy_from_slice(&sample.to_be_bytes());
        }
        PcmDepth::Float64 => {
            out[..8].copy_from_slice(&(sample as f64).to_be_bytes());
        }
    }
}

#[inline]
fn read_sample(depth: PcmDepth, data: &[u8]) -> f32 {
    match depth {
        PcmDepth::Int16 => {
            i16::from_be_bytes([data[0], data[1]]) as f32 / 32768.0
        }
        PcmDepth::Int24 => {
            // sign-extend the top byte
            let v = i32::from_be_bytes([data[0], data[1], data[2], 0]) >> 8;
            (v as f64 / 8388608.0) as f32
        }
        PcmDepth::Float32 => f32::from_be_bytes([data[0], data[1], data[2], data[3]]),
        PcmDepth::Float64 => {
            f64::from_be_bytes(data[..8].try_into().unwrap()) as f32
        }
    }
}

impl Encoder for PcmEncoder {
    fn format(&self) -> &Format {
        &self.format
    }

    fn encode(&mut self, samples: &[f32], out: &mut [u8]) -> Result<usize, AooError> {
        let size = self.depth.sample_size();
        let needed = samples.len() * size;
        if out.len() < needed {
            return Err(AooError::InsufficientBuffer);
        }
        for (sample, chunk) in samples.iter().zip(out.chunks_exact_mut(size)) {
            write_sample(self.depth, *sample, chunk);
        }
        Ok(needed)
    }

    fn reset(&mut self) {}
}

impl Decoder for PcmDecoder {
    fn format(&self) -> &Format {
        &self.format
    }

    fn decode(&mut self, data: Option<&[u8]>, out: &mut [f32]) -> Result<(), AooError> {
        let Some(data) = data else {
            out.fill(0.0);
            return Ok(());
        };
        let size = self.depth.sample_size();
        if data.len() != out.len() * size {
            return Err(AooError::BadFormat);
        }
        for (sample, chunk) in out.iter_mut().zip(data.chunks_exact(size)) {
            *sample = read_sample(self.depth, chunk);
        }
        Ok(())
    }

    fn reset(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm_format(depth: PcmDepth) -> Format {
        Format {
            codec: PCM_CODEC_NAME.into(),
            nchannels: 2,
            samplerate: 48000,
            blocksize: 4,
            options: depth.to_options(),
        }
    }

    #[test]
    fn pcm_round_trip_all_depths() {
        let samples = [0.0, 0.25, -0.5, 1.0, -1.0, 0.125, -0.0625, 0.75];
        for depth in [
            PcmDepth::Int16,
            PcmDepth::Int24,
            PcmDepth::Float32,
            PcmDepth::Float64,
        ] {
            let registry = CodecRegistry::new();
            let codec = registry.find(PCM_CODEC_NAME).unwrap();
            let format = pcm_format(depth);
            let mut enc = codec.make_encoder(&format).unwrap();
            let mut dec = codec.make_decoder(&format).unwrap();

            let mut buf = vec![0u8; 64];
            let n = enc.encode(&samples, &mut buf).unwrap();
            assert_eq!(n, samples.len() * depth.sample_size());

            let mut out = [0.0f32; 8];
            dec.decode(Some(&buf[..n]), &mut out).unwrap();
            for (a, b) in samples.iter().zip(&out) {
                assert!((a - b).abs() < 1e-3, "{depth:?}: {a} vs {b}");
            }
        }
    }

    #[test]
    fn pcm_conceals_loss_with_silence() {
        let registry = CodecRegistry::new();
        let codec = registry.find(PCM_CODEC_NAME).unwrap();
        let format = pcm_format(PcmDepth::Float32);
        let mut dec = codec.make_decoder(&format).unwrap();
        let mut out = [1.0f32; 8];
        dec.decode(None, &mut out).unwrap();
        assert_eq!(out, [0.0; 8]);
    }

    #[test]
    fn bad_options_rejected() {
        let registry = CodecRegistry::new();
        let codec = registry.find(PCM_CODEC_NAME).unwrap();
        let mut format = pcm_format(PcmDepth::Int16);
        format.options = vec![9, 9];
        assert_eq!(
            codec.make_encoder(&format).err(),
            Some(AooError::BadFormat)
        );
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut registry = CodecRegistry::new();
        assert_eq!(
            registry.register(Arc::new(PcmCodec)).err(),
            Some(AooError::AlreadyExists)
        );
    }
}
