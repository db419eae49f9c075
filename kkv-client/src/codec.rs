//! Gzip helpers for write bodies and cache responses.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use kkv_core::{KkvError, KkvResult, Value};
use std::io::{Read, Write};

pub const GZIP_ENCODING: &str = "gzip";

/// Gzip `payload` at the default compression level.
pub fn compress_gzip_payload(payload: &[u8]) -> KkvResult<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(payload.len() / 2), Compression::default());
    encoder.write_all(payload).map_err(codec_error)?;
    encoder.finish().map_err(codec_error)
}

pub fn gunzip(body: &[u8]) -> KkvResult<Vec<u8>> {
    let mut decoder = GzDecoder::new(body);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).map_err(codec_error)?;
    Ok(out)
}

/// Gunzip a response body and decode it as JSON.
pub fn decompress_gzip_response(body: &[u8]) -> KkvResult<Value> {
    let raw = gunzip(body)?;
    serde_json::from_slice(&raw).map_err(|e| KkvError::Codec {
        reason: format!("gzip body is not JSON: {}", e),
    })
}

fn codec_error(err: std::io::Error) -> KkvError {
    KkvError::Codec {
        reason: err.to_string(),
    }
}
