use std::io::{self, Read, Seek, SeekFrom, Write};

use crate::attrs;
use crate::compression::Compression;
use crate::error::{Error, Result};
use crate::object::{Handle, Mode, Object, ObjectType, Stream};
use crate::resolver::Resolver;
use crate::urn::Urn;
use crate::volume::ZipVolume;
use crate::zip;

#[derive(Debug)]
enum Data {
    /// A stored member, read straight from the backing store.
    InPlace { backing: Urn, offset: u64, size: u64 },
    /// An inflated member, or the pending content of a member being written.
    Buffer(Vec<u8>),
}

/// A single archive member exposed as a stream.
#[derive(Debug)]
pub struct Segment {
    urn: Urn,
    mode: Mode,
    resolver: Resolver,
    volume: Urn,
    compression: Compression,
    data: Data,
    pos: u64,
}

impl Segment {
    pub(crate) fn construct(resolver: &Resolver, urn: &Urn, mode: Mode) -> Result<Box<dyn Object>> {
        let volume = resolver.require_urn(urn, attrs::STORED)?;
        let compression = resolver
            .resolve_string(urn, attrs::COMPRESSION)
            .and_then(|name| Compression::from_name(&name))
            .unwrap_or_default();

        let data = match mode {
            Mode::Write => Data::Buffer(vec![]),
            Mode::Read => Segment::load(resolver, urn, &volume)?,
        };

        Ok(Box::new(Segment {
            urn: urn.clone(),
            mode,
            resolver: resolver.clone(),
            volume,
            compression,
            data,
            pos: 0,
        }))
    }

    fn load(resolver: &Resolver, urn: &Urn, volume: &Urn) -> Result<Data> {
        let method = resolver.require_u64(urn, attrs::ZIP_METHOD)? as u16;
        let header_offset = resolver.require_u64(urn, attrs::ZIP_HEADER_OFFSET)?;
        let compressed_size = resolver.require_u64(urn, attrs::ZIP_COMPRESSED_SIZE)?;
        let size = resolver.require_u64(urn, attrs::SIZE)?;
        let backing = match resolver.resolve_urn(urn, attrs::ZIP_BACKING) {
            Some(backing) => backing,
            None => resolver.require_urn(volume, attrs::STORED)?,
        };

        let mut handle = resolver.open(&backing, Mode::Read)?;
        let result = (|| -> Result<Data> {
            let stream = handle.stream()?;
            let offset = zip::member_data_offset(stream, header_offset, compressed_size)?;
            let compression = Compression::from_zip_method(method);
            if compression == Compression::Stored {
                return Ok(Data::InPlace {
                    backing: backing.clone(),
                    offset,
                    size,
                });
            }

            stream.seek(SeekFrom::Start(offset))?;
            let mut raw = vec![0u8; compressed_size as usize];
            stream.read_exact(&mut raw)?;
            let data = compression.decompress_bytes(&raw, size as usize)?;

            let expected = resolver.resolve_u64(urn, attrs::ZIP_CRC);
            if expected.is_some() && expected != Some(u64::from(crc32fast::hash(&data))) {
                return Err(Error::structural(format!("CRC mismatch in member {}", urn)));
            }
            Ok(Data::Buffer(data))
        })();
        resolver.cache_return(handle);
        result
    }

    /// Start a new member `name` of `volume`.
    pub fn create_in(resolver: &Resolver, volume: &Urn, name: &str) -> Result<Handle<Segment>> {
        resolver
            .create(ObjectType::Segment)
            .urn(volume.append(name))
            .set(attrs::STORED, volume)
            .finish_as::<Segment>()
    }

    /// Read the whole member `urn`.
    pub fn read_all(resolver: &Resolver, urn: &Urn) -> Result<Vec<u8>> {
        let mut segment = resolver.open_as::<Segment>(urn, Mode::Read)?;
        let mut out = vec![];
        let result = segment
            .seek(SeekFrom::Start(0))
            .and_then(|_| segment.read_to_end(&mut out));
        resolver.cache_return(segment);
        result?;
        Ok(out)
    }

    pub fn volume(&self) -> &Urn {
        &self.volume
    }

    fn read_in_place(&mut self, buf: &mut [u8], backing: &Urn, offset: u64, size: u64) -> io::Result<usize> {
        let n = (size.saturating_sub(self.pos)).min(buf.len() as u64) as usize;
        if n == 0 {
            return Ok(0);
        }

        let mut handle = self.resolver.open(backing, Mode::Read)?;
        let result = (|| -> Result<()> {
            let stream = handle.stream()?;
            stream.seek(SeekFrom::Start(offset + self.pos))?;
            stream.read_exact(&mut buf[..n])?;
            Ok(())
        })();
        self.resolver.cache_return(handle);
        result?;

        self.pos += n as u64;
        Ok(n)
    }
}

impl Object for Segment {
    fn urn(&self) -> &Urn {
        &self.urn
    }

    fn object_type(&self) -> ObjectType {
        ObjectType::Segment
    }

    fn mode(&self) -> Mode {
        self.mode
    }

    fn close(&mut self) -> Result<()> {
        if self.mode != Mode::Write {
            return Ok(());
        }
        let data = match &self.data {
            Data::Buffer(data) => data,
            Data::InPlace { .. } => return Ok(()),
        };

        let mut volume = self.resolver.open_as::<ZipVolume>(&self.volume, Mode::Write)?;
        let result = volume.writestr(&self.urn, data, self.compression);
        self.resolver.cache_return(volume);
        result
    }

    fn as_stream(&mut self) -> Option<&mut dyn Stream> {
        Some(self)
    }
}

impl Read for Segment {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &self.data {
            Data::InPlace {
                backing,
                offset,
                size,
            } => {
                let (backing, offset, size) = (backing.clone(), *offset, *size);
                self.read_in_place(buf, &backing, offset, size)
            }
            Data::Buffer(data) => {
                let start = (self.pos as usize).min(data.len());
                let n = (data.len() - start).min(buf.len());
                buf[..n].copy_from_slice(&data[start..start + n]);
                self.pos += n as u64;
                Ok(n)
            }
        }
    }
}

impl Write for Segment {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let data = match (&mut self.data, self.mode) {
            (Data::Buffer(data), Mode::Write) => data,
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    format!("segment {} is not open for writing", self.urn),
                ))
            }
        };

        let start = self.pos as usize;
        if data.len() < start {
            data.resize(start, 0);
        }
        let overlap = (data.len() - start).min(buf.len());
        data[start..start + overlap].copy_from_slice(&buf[..overlap]);
        data.extend_from_slice(&buf[overlap..]);
        self.pos += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for Segment {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let size = self.size() as i128;
        let target = match pos {
            SeekFrom::Start(n) => n as i128,
            SeekFrom::End(n) => size + n as i128,
            SeekFrom::Current(n) => self.pos as i128 + n as i128,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of segment",
            ));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }
}

impl Stream for Segment {
    fn size(&self) -> u64 {
        match &self.data {
            Data::InPlace { size, .. } => *size,
            Data::Buffer(data) => data.len() as u64,
        }
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        match (&mut self.data, self.mode) {
            (Data::Buffer(data), Mode::Write) => {
                data.truncate(len as usize);
                Ok(())
            }
            _ => Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("segment {} is not open for writing", self.urn),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_mode_is_readable_and_persists_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let backing = Urn::from_path(dir.path().join("seg.zip")).unwrap();
        let resolver = Resolver::default();
        let volume = ZipVolume::create_in(&resolver, &backing).unwrap();
        let volume_urn = volume.urn().clone();
        resolver.cache_return(volume);

        let mut segment = Segment::create_in(&resolver, &volume_urn, "notes").unwrap();
        segment.write_all(b"hello world").unwrap();
        segment.seek(SeekFrom::Start(6)).unwrap();
        segment.write_all(b"there").unwrap();
        segment.seek(SeekFrom::Start(0)).unwrap();
        let mut text = String::new();
        segment.read_to_string(&mut text).unwrap();
        assert_eq!(text, "hello there");
        let urn = segment.urn().clone();
        segment.close().unwrap();

        assert_eq!(Segment::read_all(&resolver, &urn).unwrap(), b"hello there");
        resolver.flush().unwrap();
    }

    #[test]
    fn deflated_members_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let backing = Urn::from_path(dir.path().join("deflate.zip")).unwrap();
        let resolver = Resolver::default();
        let volume = ZipVolume::create_in(&resolver, &backing).unwrap();
        let volume_urn = volume.urn().clone();
        resolver.cache_return(volume);

        let segment = resolver
            .create(ObjectType::Segment)
            .urn(volume_urn.append("packed"))
            .set(attrs::STORED, &volume_urn)
            .set(attrs::COMPRESSION, Compression::Deflate.name())
            .finish_as::<Segment>();
        let mut segment = segment.unwrap();
        let payload = b"abcabcabc".repeat(500);
        segment.write_all(&payload).unwrap();
        let urn = segment.urn().clone();
        segment.close().unwrap();

        assert_eq!(
            resolver.resolve_u64(&urn, attrs::ZIP_METHOD),
            Some(u64::from(crate::compression::constants::ZIP_METHOD_DEFLATE))
        );
        let mut reader = resolver.open_as::<Segment>(&urn, Mode::Read).unwrap();
        reader.seek(SeekFrom::End(-3)).unwrap();
        let mut tail = vec![];
        reader.read_to_end(&mut tail).unwrap();
        assert_eq!(tail, b"abc");
        assert!(reader.write_all(b"x").is_err());
        resolver.cache_return(reader);

        assert_eq!(Segment::read_all(&resolver, &urn).unwrap(), payload);
        assert_eq!(Segment::read_all(&resolver, &urn).unwrap(), payload);
        resolver.flush().unwrap();

        resolver.set(&urn, attrs::ZIP_COMPRESSED_SIZE, 0xFFFF_FFF0u64);
        let err = resolver.open_as::<Segment>(&urn, Mode::Read).unwrap_err();
        assert!(matches!(err, Error::Structural(_)), "{:?}", err);
    }
}
