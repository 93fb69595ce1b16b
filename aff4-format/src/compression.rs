use std::fmt;
use std::io::{Cursor, Read, Result, Seek, Write};

#[cfg(feature = "brotli")]
use comde::brotli::{BrotliCompressor, BrotliDecompressor};
#[cfg(feature = "deflate")]
use comde::deflate::{DeflateCompressor, DeflateDecompressor};
#[cfg(feature = "snappy")]
use comde::snappy::{SnappyCompressor, SnappyDecompressor};
#[cfg(feature = "xz")]
use comde::xz::{XzCompressor, XzDecompressor};
#[cfg(feature = "zstd")]
use comde::zstd::{ZstdCompressor, ZstdDecompressor};
use comde::{
    stored::{StoredCompressor, StoredDecompressor},
    ByteCount, Compressor, Decompressor,
};

pub mod constants {
    pub const ZIP_METHOD_STORED: u16 = 0;
    pub const ZIP_METHOD_DEFLATE: u16 = 8;
    pub const ZIP_METHOD_ZSTD: u16 = 93;
}

use self::constants::*;

// Upper bound on presizing from sizes read out of an archive.
const MAX_SIZE_HINT: usize = 16 << 20;

/// Compression of a ZIP member or an image chunk.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Default)]
pub enum Compression {
    #[default]
    Stored,
    Deflate,
    Zstd,
    Snappy,
    Brotli,
    Xz,
    /// A ZIP method this crate has no codec for.
    Unknown(u16),
}

impl Compression {
    pub const fn available_variants() -> &'static [&'static str] {
        &["stored", "deflate", "zstd", "snappy", "brotli", "xz"]
    }

    /// Value of the `aff4:compression` attribute.
    pub fn name(self) -> String {
        match self {
            Compression::Stored => "stored".into(),
            Compression::Deflate => "deflate".into(),
            Compression::Zstd => "zstd".into(),
            Compression::Snappy => "snappy".into(),
            Compression::Brotli => "brotli".into(),
            Compression::Xz => "xz".into(),
            Compression::Unknown(method) => format!("zip-method-{}", method),
        }
    }

    pub fn from_name(name: &str) -> Option<Compression> {
        match name {
            "stored" => Some(Compression::Stored),
            "deflate" => Some(Compression::Deflate),
            "zstd" => Some(Compression::Zstd),
            "snappy" => Some(Compression::Snappy),
            "brotli" => Some(Compression::Brotli),
            "xz" => Some(Compression::Xz),
            _ => name
                .strip_prefix("zip-method-")
                .and_then(|m| m.parse().ok())
                .map(Compression::from_zip_method),
        }
    }

    /// ZIP method number, if the algorithm has one.
    pub const fn zip_method(self) -> Option<u16> {
        match self {
            Compression::Stored => Some(ZIP_METHOD_STORED),
            Compression::Deflate => Some(ZIP_METHOD_DEFLATE),
            Compression::Zstd => Some(ZIP_METHOD_ZSTD),
            // Image chunks only.
            Compression::Snappy | Compression::Brotli | Compression::Xz => None,
            Compression::Unknown(method) => Some(method),
        }
    }

    pub const fn from_zip_method(method: u16) -> Compression {
        match method {
            ZIP_METHOD_STORED => Compression::Stored,
            ZIP_METHOD_DEFLATE => Compression::Deflate,
            ZIP_METHOD_ZSTD => Compression::Zstd,
            other => Compression::Unknown(other),
        }
    }

    pub fn compress<W: Write + Seek, R: Read>(
        self,
        mut writer: W,
        reader: &mut R,
    ) -> Result<ByteCount> {
        use Compression::*;

        match self {
            Stored => StoredCompressor.compress(&mut writer, reader),
            #[cfg(feature = "deflate")]
            Deflate => DeflateCompressor.compress(&mut writer, reader),
            #[cfg(feature = "zstd")]
            Zstd => ZstdCompressor.compress(&mut writer, reader),
            #[cfg(feature = "snappy")]
            Snappy => SnappyCompressor.compress(&mut writer, reader),
            #[cfg(feature = "brotli")]
            Brotli => BrotliCompressor.compress(&mut writer, reader),
            #[cfg(feature = "xz")]
            Xz => XzCompressor.compress(&mut writer, reader),
            Unknown(id) => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Cannot handle compression with ZIP method {}", id),
            )),
            #[allow(unreachable_patterns)]
            missing => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Compiled without support for {:?}", missing),
            )),
        }
    }

    /// Compress a whole buffer.
    pub fn compress_bytes(self, data: &[u8]) -> Result<Vec<u8>> {
        if self == Compression::Stored {
            return Ok(data.to_vec());
        }
        let mut out = Cursor::new(Vec::with_capacity(data.len() / 2));
        let mut reader = data;
        self.compress(&mut out, &mut reader)?;
        Ok(out.into_inner())
    }

    pub fn decompress_write<R: Read, W: Write>(self, reader: R, writer: W) -> Result<()> {
        use Compression::*;

        match self {
            Stored => StoredDecompressor.copy(reader, writer),
            #[cfg(feature = "deflate")]
            Deflate => DeflateDecompressor.copy(reader, writer),
            #[cfg(feature = "zstd")]
            Zstd => ZstdDecompressor.copy(reader, writer),
            #[cfg(feature = "snappy")]
            Snappy => SnappyDecompressor.copy(reader, writer),
            #[cfg(feature = "brotli")]
            Brotli => BrotliDecompressor.copy(reader, writer),
            #[cfg(feature = "xz")]
            Xz => XzDecompressor.copy(reader, writer),
            Unknown(id) => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Cannot handle decompression with ZIP method {}", id),
            )),
            #[allow(unreachable_patterns)]
            missing => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Compiled without support for {:?}", missing),
            )),
        }?;

        Ok(())
    }

    /// Decompress a whole buffer, expecting roughly `size_hint` bytes out.
    pub fn decompress_bytes(self, data: &[u8], size_hint: usize) -> Result<Vec<u8>> {
        if self == Compression::Stored {
            return Ok(data.to_vec());
        }
        let mut out = Vec::with_capacity(size_hint.min(MAX_SIZE_HINT));
        self.decompress_write(data, &mut out)?;
        Ok(out)
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Compression::*;

        let s = match self {
            Stored => "stored",
            Deflate => "DEFLATE",
            Zstd => "Zstandard",
            Snappy => "Snappy",
            Brotli => "Brotli",
            Xz => "xz",
            Unknown(id) => return write!(f, "Unknown(method: {})", id),
        };

        write!(f, "{}", s)
    }
}

impl fmt::Debug for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_and_methods() {
        for name in Compression::available_variants() {
            let c = Compression::from_name(name).unwrap();
            assert_eq!(&c.name(), name);
        }
        assert_eq!(Compression::from_zip_method(8), Compression::Deflate);
        assert_eq!(Compression::Snappy.zip_method(), None);
        assert_eq!(
            Compression::from_name("zip-method-14"),
            Some(Compression::Unknown(14))
        );
    }

    #[test]
    fn buffers_survive_every_codec() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        for name in Compression::available_variants() {
            let c = Compression::from_name(name).unwrap();
            let packed = c.compress_bytes(&data).unwrap();
            assert_eq!(c.decompress_bytes(&packed, data.len()).unwrap(), data, "{}", c);
        }
    }

    #[test]
    fn unknown_method_is_invalid_input() {
        let err = Compression::Unknown(99).compress_bytes(b"x").unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }
}
