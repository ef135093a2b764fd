//! Gzip stream adapters.
//!
//! Entry files are compressed with the fastest level; partitions are large
//! and mostly empty space, so speed wins over ratio.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Wrap a sink in a gzip encoder.
pub fn compress_writer<W: Write>(sink: W) -> GzEncoder<W> {
    GzEncoder::new(sink, Compression::fast())
}

/// Wrap a source in a gzip decoder.
pub fn decompress_reader<R: Read>(source: R) -> GzDecoder<R> {
    GzDecoder::new(source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Cursor};

    #[test]
    fn test_gzip_round_trip() -> io::Result<()> {
        let data = vec![0u8; 256 * 1024];

        let mut encoder = compress_writer(Vec::new());
        encoder.write_all(&data)?;
        let compressed = encoder.finish()?;
        assert!(compressed.len() < data.len() / 10);
        // gzip magic
        assert_eq!(&compressed[..2], &[0x1f, 0x8b]);

        let mut out = Vec::new();
        decompress_reader(Cursor::new(compressed)).read_to_end(&mut out)?;
        assert_eq!(out, data);
        Ok(())
    }

    #[test]
    fn test_corrupt_gzip_errors() {
        let mut out = Vec::new();
        let result = decompress_reader(Cursor::new(b"not gzip at all".to_vec())).read_to_end(&mut out);
        assert!(result.is_err());
    }
}
