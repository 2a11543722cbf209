//! Compressed payload encoding for large control message values
//!
//! Error reports can be large, so they travel as zlib-compressed,
//! base64-encoded text inside an ordinary [`ControlMessage`](super::ControlMessage) value.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};

use crate::error::CodecResult;

/// Compress and encode UTF-8 text
pub fn compress_encode(text: &str) -> CodecResult<String> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(text.as_bytes())?;
    let compressed = encoder.finish()?;
    Ok(BASE64.encode(compressed))
}

/// Decode and decompress text produced by [`compress_encode`]
pub fn decode_decompress(encoded: &str) -> CodecResult<String> {
    let compressed = BASE64.decode(encoded.trim())?;
    let mut decoder = ZlibDecoder::new(compressed.as_slice());
    let mut bytes = Vec::new();
    decoder.read_to_end(&mut bytes)?;
    Ok(String::from_utf8(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_large_report_shrinks() {
        let report = format!("{{\"failures\":[{}]}}", vec!["\"/data/a/b/c.txt\""; 500].join(","));
        let encoded = compress_encode(&report).unwrap();
        assert!(encoded.len() < report.len() / 4);
        assert_eq!(decode_decompress(&encoded).unwrap(), report);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(decode_decompress("not base64 !!").is_err());
        // valid base64, not zlib
        assert!(decode_decompress("aGVsbG8=").is_err());
    }
}
