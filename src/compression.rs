//! Compression codec registry, keyed by the wire format's `metadata_id`.
//!
//! Generalizes the teacher's frozen-UUID codec registry
//! ([`crate::codec`] in the original tree) to the identity scheme this
//! wire format actually uses: a `u16` written directly into the metadata
//! blob. Like the teacher's registry, resolution is fail-hard — an
//! unrecognised id is never silently substituted.

use std::io::{self, Read, Write};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CompressionError {
    #[error("compression error: {0}")]
    Compress(String),
    #[error("decompression error: {0}")]
    Decompress(String),
    #[error("unknown compression codec id {0}")]
    Unavailable(u16),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionCodecId {
    Gzip,
    Zstd,
    Lz4,
    Brotli,
}

impl CompressionCodecId {
    /// The id written into the `compression_codec` wire field. Gzip=0 is
    /// mandatory per the external interface; the others are this crate's
    /// own registrations, the way the teacher registers Zstd/Lz4/Brotli/Lzma
    /// alongside its mandatory `None` codec.
    pub fn metadata_id(self) -> u16 {
        match self {
            CompressionCodecId::Gzip => 0,
            CompressionCodecId::Zstd => 1,
            CompressionCodecId::Lz4 => 2,
            CompressionCodecId::Brotli => 3,
        }
    }

    pub fn from_metadata_id(id: u16) -> Option<Self> {
        match id {
            0 => Some(CompressionCodecId::Gzip),
            1 => Some(CompressionCodecId::Zstd),
            2 => Some(CompressionCodecId::Lz4),
            3 => Some(CompressionCodecId::Brotli),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CompressionCodecId::Gzip => "gzip",
            CompressionCodecId::Zstd => "zstd",
            CompressionCodecId::Lz4 => "lz4",
            CompressionCodecId::Brotli => "brotli",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "gzip" => Some(CompressionCodecId::Gzip),
            "zstd" => Some(CompressionCodecId::Zstd),
            "lz4" => Some(CompressionCodecId::Lz4),
            "brotli" => Some(CompressionCodecId::Brotli),
            _ => None,
        }
    }
}

pub trait CompressionCodec: Send + Sync {
    fn id(&self) -> CompressionCodecId;
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CompressionError>;
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError>;

    /// Like [`Self::decompress`], but refuses to materialize more than
    /// `max_len` bytes of output — a caller-declared `decompressed_length`
    /// bounds the expected size, but nothing stops a malicious payload from
    /// being a decompression bomb that expands far past it. Callers that
    /// have such a bound should always prefer this over `decompress`.
    fn decompress_capped(&self, data: &[u8], max_len: u64) -> Result<Vec<u8>, CompressionError>;
}

fn read_capped(mut r: impl Read, max_len: u64) -> Result<Vec<u8>, CompressionError> {
    let mut out = Vec::new();
    let mut limited = (&mut r).take(max_len.saturating_add(1));
    limited.read_to_end(&mut out).map_err(|e| CompressionError::Decompress(e.to_string()))?;
    if out.len() as u64 > max_len {
        return Err(CompressionError::Decompress(format!(
            "decompressed output exceeds cap of {max_len} bytes"
        )));
    }
    Ok(out)
}

pub struct GzipCodec;
impl CompressionCodec for GzipCodec {
    fn id(&self) -> CompressionCodecId { CompressionCodecId::Gzip }
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CompressionError> {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        let level = (level.clamp(0, 9)) as u32;
        let mut enc = GzEncoder::new(Vec::new(), Compression::new(level));
        enc.write_all(data).map_err(|e| CompressionError::Compress(e.to_string()))?;
        enc.finish().map_err(|e| CompressionError::Compress(e.to_string()))
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        use flate2::read::GzDecoder;
        let mut out = Vec::new();
        GzDecoder::new(data).read_to_end(&mut out)
            .map_err(|e| CompressionError::Decompress(e.to_string()))?;
        Ok(out)
    }
    fn decompress_capped(&self, data: &[u8], max_len: u64) -> Result<Vec<u8>, CompressionError> {
        use flate2::read::GzDecoder;
        read_capped(GzDecoder::new(data), max_len)
    }
}

pub struct ZstdCompressionCodec;
impl CompressionCodec for ZstdCompressionCodec {
    fn id(&self) -> CompressionCodecId { CompressionCodecId::Zstd }
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CompressionError> {
        zstd::encode_all(data, level).map_err(|e| CompressionError::Compress(e.to_string()))
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        zstd::decode_all(data).map_err(|e| CompressionError::Decompress(e.to_string()))
    }
    fn decompress_capped(&self, data: &[u8], max_len: u64) -> Result<Vec<u8>, CompressionError> {
        let decoder = zstd::stream::Decoder::new(data)
            .map_err(|e| CompressionError::Decompress(e.to_string()))?;
        read_capped(decoder, max_len)
    }
}

pub struct Lz4CompressionCodec;
impl CompressionCodec for Lz4CompressionCodec {
    fn id(&self) -> CompressionCodecId { CompressionCodecId::Lz4 }
    fn compress(&self, data: &[u8], _level: i32) -> Result<Vec<u8>, CompressionError> {
        Ok(lz4_flex::compress_prepend_size(data))
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        lz4_flex::decompress_size_prepended(data)
            .map_err(|e| CompressionError::Decompress(e.to_string()))
    }
    fn decompress_capped(&self, data: &[u8], max_len: u64) -> Result<Vec<u8>, CompressionError> {
        let (uncompressed_size, _) = lz4_flex::block::uncompressed_size(data)
            .map_err(|e| CompressionError::Decompress(e.to_string()))?;
        if uncompressed_size as u64 > max_len {
            return Err(CompressionError::Decompress(format!(
                "decompressed output exceeds cap of {max_len} bytes"
            )));
        }
        self.decompress(data)
    }
}

pub struct BrotliCompressionCodec;
impl CompressionCodec for BrotliCompressionCodec {
    fn id(&self) -> CompressionCodecId { CompressionCodecId::Brotli }
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CompressionError> {
        let quality = level.clamp(0, 11) as u32;
        let mut out = Vec::new();
        {
            let mut w = brotli::CompressorWriter::new(&mut out, 4096, quality, 22);
            w.write_all(data).map_err(|e| CompressionError::Compress(e.to_string()))?;
        }
        Ok(out)
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        let mut out = Vec::new();
        brotli::Decompressor::new(data, 4096)
            .read_to_end(&mut out)
            .map_err(|e| CompressionError::Decompress(e.to_string()))?;
        Ok(out)
    }
    fn decompress_capped(&self, data: &[u8], max_len: u64) -> Result<Vec<u8>, CompressionError> {
        read_capped(brotli::Decompressor::new(data, 4096), max_len)
    }
}

/// Resolve a `metadata_id` to a built-in codec. Fails hard on an unknown id
/// — callers must never fall back to a different codec.
pub fn get_codec(id: CompressionCodecId) -> Box<dyn CompressionCodec> {
    match id {
        CompressionCodecId::Gzip => Box::new(GzipCodec),
        CompressionCodecId::Zstd => Box::new(ZstdCompressionCodec),
        CompressionCodecId::Lz4 => Box::new(Lz4CompressionCodec),
        CompressionCodecId::Brotli => Box::new(BrotliCompressionCodec),
    }
}

pub fn get_codec_by_metadata_id(id: u16) -> Result<Box<dyn CompressionCodec>, CompressionError> {
    CompressionCodecId::from_metadata_id(id)
        .map(get_codec)
        .ok_or(CompressionError::Unavailable(id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_codec_round_trips() {
        let data = b"the quick brown fox jumps over the lazy dog".repeat(50);
        for id in [
            CompressionCodecId::Gzip,
            CompressionCodecId::Zstd,
            CompressionCodecId::Lz4,
            CompressionCodecId::Brotli,
        ] {
            let codec = get_codec(id);
            let compressed = codec.compress(&data, 3).unwrap();
            let restored = codec.decompress(&compressed).unwrap();
            assert_eq!(restored, data, "{} round-trip failed", id.name());
        }
    }

    #[test]
    fn unknown_metadata_id_fails_hard() {
        assert!(get_codec_by_metadata_id(99).is_err());
    }

    #[test]
    fn decompress_capped_rejects_output_past_the_cap() {
        let data = b"the quick brown fox jumps over the lazy dog".repeat(50);
        for id in [
            CompressionCodecId::Gzip,
            CompressionCodecId::Zstd,
            CompressionCodecId::Lz4,
            CompressionCodecId::Brotli,
        ] {
            let codec = get_codec(id);
            let compressed = codec.compress(&data, 3).unwrap();
            assert!(codec.decompress_capped(&compressed, 4).is_err(), "{} should reject", id.name());
            let restored = codec.decompress_capped(&compressed, data.len() as u64).unwrap();
            assert_eq!(restored, data, "{} capped round-trip failed", id.name());
        }
    }
}
