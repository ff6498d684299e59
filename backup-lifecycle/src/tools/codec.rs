//! Compression stream wrappers for the supported archive formats.

use crate::archive::CompressionFormat;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};

/// Compressing writer over an archive file.
pub enum Encoder {
    Gzip(flate2::write::GzEncoder<File>),
    Bzip2(bzip2::write::BzEncoder<File>),
    Xz(xz2::write::XzEncoder<File>),
    Zstd(zstd::stream::write::Encoder<'static, File>),
}

impl Encoder {
    pub fn new(format: CompressionFormat, file: File) -> io::Result<Self> {
        let encoder = match format {
            CompressionFormat::Gzip => {
                Encoder::Gzip(flate2::write::GzEncoder::new(file, flate2::Compression::default()))
            }
            CompressionFormat::Bzip2 => {
                Encoder::Bzip2(bzip2::write::BzEncoder::new(file, bzip2::Compression::default()))
            }
            CompressionFormat::Xz => Encoder::Xz(xz2::write::XzEncoder::new(file, 6)),
            CompressionFormat::Zstd => Encoder::Zstd(zstd::stream::write::Encoder::new(file, 3)?),
        };
        Ok(encoder)
    }

    /// Flush the compressor trailer and hand back the file.
    pub fn finish(self) -> io::Result<File> {
        match self {
            Encoder::Gzip(e) => e.finish(),
            Encoder::Bzip2(e) => e.finish(),
            Encoder::Xz(e) => e.finish(),
            Encoder::Zstd(e) => e.finish(),
        }
    }
}

impl Write for Encoder {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Encoder::Gzip(e) => e.write(buf),
            Encoder::Bzip2(e) => e.write(buf),
            Encoder::Xz(e) => e.write(buf),
            Encoder::Zstd(e) => e.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Encoder::Gzip(e) => e.flush(),
            Encoder::Bzip2(e) => e.flush(),
            Encoder::Xz(e) => e.flush(),
            Encoder::Zstd(e) => e.flush(),
        }
    }
}

/// Decompressing reader over an archive file.
pub fn decoder(format: CompressionFormat, file: File) -> io::Result<Box<dyn Read>> {
    let reader = BufReader::new(file);
    let decoder: Box<dyn Read> = match format {
        CompressionFormat::Gzip => Box::new(flate2::read::GzDecoder::new(reader)),
        CompressionFormat::Bzip2 => Box::new(bzip2::read::BzDecoder::new(reader)),
        CompressionFormat::Xz => Box::new(xz2::read::XzDecoder::new(reader)),
        CompressionFormat::Zstd => Box::new(zstd::stream::read::Decoder::with_buffer(reader)?),
    };
    Ok(decoder)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_encoded_output_carries_detectable_magic() -> io::Result<()> {
        let dir = TempDir::new()?;

        for format in CompressionFormat::ALL {
            let path = dir.path().join(format.extension());
            let mut encoder = Encoder::new(format, File::create(&path)?)?;
            encoder.write_all(b"payload")?;
            encoder.finish()?.sync_all()?;

            assert_eq!(CompressionFormat::detect(&path)?, Some(format), "format {}", format);
        }
        Ok(())
    }

    #[test]
    fn test_truncated_stream_fails_to_decode() -> io::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("x.gz");
        let mut encoder = Encoder::new(CompressionFormat::Gzip, File::create(&path)?)?;
        encoder.write_all(&b"abcdefgh".repeat(1000))?;
        encoder.finish()?;

        let bytes = std::fs::read(&path)?;
        std::fs::write(&path, &bytes[..bytes.len() / 2])?;

        let mut sink = Vec::new();
        let result = decoder(CompressionFormat::Gzip, File::open(&path)?)?.read_to_end(&mut sink);
        assert!(result.is_err());
        Ok(())
    }
}
