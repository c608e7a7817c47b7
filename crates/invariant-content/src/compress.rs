//! Compression codecs for the content pipeline.

use std::io::{Read, Write};

use flate2::read::{DeflateDecoder, GzDecoder};
use flate2::write::{DeflateEncoder, GzEncoder};

use crate::link::Compression;
use crate::{ContentError, Result};

const BROTLI_BUFFER: usize = 4096;
const BROTLI_QUALITY: u32 = 5;
const BROTLI_WINDOW: u32 = 22;

/// Compress `data` with the chosen algorithm.
pub fn compress(data: &[u8], algorithm: Compression) -> Result<Vec<u8>> {
    match algorithm {
        Compression::None => Ok(data.to_vec()),
        Compression::Inflate => {
            let mut encoder = DeflateEncoder::new(Vec::new(), flate2::Compression::default());
            encoder
                .write_all(data)
                .and_then(|_| encoder.finish())
                .map_err(|e| ContentError::Compress(e.to_string()))
        }
        Compression::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder
                .write_all(data)
                .and_then(|_| encoder.finish())
                .map_err(|e| ContentError::Compress(e.to_string()))
        }
        Compression::Brotli => {
            let mut out = Vec::new();
            {
                let mut writer = brotli::CompressorWriter::new(
                    &mut out,
                    BROTLI_BUFFER,
                    BROTLI_QUALITY,
                    BROTLI_WINDOW,
                );
                writer
                    .write_all(data)
                    .map_err(|e| ContentError::Compress(e.to_string()))?;
            }
            Ok(out)
        }
    }
}

/// Decompress `data` using the algorithm named in a `Decompress` transform.
/// `unzip` is accepted as an alias for `gzip`.
pub fn decompress(data: &[u8], algorithm: &str) -> Result<Vec<u8>> {
    match algorithm {
        "inflate" => {
            let mut out = Vec::new();
            DeflateDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(|e| ContentError::Compress(e.to_string()))?;
            Ok(out)
        }
        "gzip" | "unzip" => {
            let mut out = Vec::new();
            GzDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(|e| ContentError::Compress(e.to_string()))?;
            Ok(out)
        }
        "brotli" => {
            let mut out = Vec::new();
            brotli::Decompressor::new(data, BROTLI_BUFFER)
                .read_to_end(&mut out)
                .map_err(|e| ContentError::Compress(e.to_string()))?;
            Ok(out)
        }
        other => Err(ContentError::UnsupportedTransform(format!(
            "Decompress {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_inflate_roundtrip(data in prop::collection::vec(0u8..=255, 0..50_000)) {
            let c = compress(&data, Compression::Inflate).unwrap();
            prop_assert_eq!(decompress(&c, "inflate").unwrap(), data);
        }

        #[test]
        fn prop_gzip_roundtrip(data in prop::collection::vec(0u8..=255, 0..50_000)) {
            let c = compress(&data, Compression::Gzip).unwrap();
            prop_assert_eq!(decompress(&c, "gzip").unwrap(), data);
        }

        #[test]
        fn prop_brotli_roundtrip(data in prop::collection::vec(0u8..=255, 0..50_000)) {
            let c = compress(&data, Compression::Brotli).unwrap();
            prop_assert_eq!(decompress(&c, "brotli").unwrap(), data);
        }
    }

    #[test]
    fn unzip_is_a_gzip_alias() {
        let c = compress(b"aliased", Compression::Gzip).unwrap();
        assert_eq!(decompress(&c, "unzip").unwrap(), b"aliased");
    }

    #[test]
    fn unknown_algorithm_is_unsupported() {
        assert!(matches!(
            decompress(b"x", "lzma"),
            Err(ContentError::UnsupportedTransform(_))
        ));
    }
}
