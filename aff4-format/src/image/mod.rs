//! Chunked, compressed image streams.
//!
//! The logical stream is cut into `chunk_size` chunks; every
//! `chunks_in_segment` chunks form a bevy. A bevy is stored as two volume
//! members: `<image>/<8-digit number>` holding the compressed chunks back to
//! back, and `<image>/<8-digit number>.idx` holding one little-endian `u32`
//! offset per chunk followed by `0xFFFFFFFF`.
//!
//! Writing is append-only. Full bevies are compressed and written by a
//! bounded pool of workers while the caller keeps writing.

use std::fmt;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use lru::LruCache;

use crate::attrs;
use crate::compression::Compression;
use crate::config::{DEFAULT_CHUNKS_IN_SEGMENT, DEFAULT_CHUNK_SIZE};
use crate::error::{Error, Result};
use crate::object::{Handle, Mode, Object, ObjectType, Stream};
use crate::resolver::Resolver;
use crate::segment::Segment;
use crate::ser;
use crate::urn::Urn;
use crate::volume::ZipVolume;

mod pool;

use self::pool::BevyPool;

/// Terminates every bevy index.
pub const INDEX_SENTINEL: u32 = 0xFFFF_FFFF;

const INDEX_CACHE_SIZE: usize = 16;

/// A reversible per-chunk transformation applied before compression on
/// write and after decompression on read.
pub trait ChunkTransform: Send + Sync + fmt::Debug {
    /// `chunk` is never longer than the chunk size; it is shorter only for
    /// the final chunk of the stream.
    fn encode(&self, chunk_index: u64, chunk: &[u8], chunk_size: u64) -> Result<Vec<u8>>;

    /// `plain_len` is the number of logical bytes the chunk holds.
    fn decode(&self, chunk_index: u64, chunk: Vec<u8>, plain_len: u64) -> Result<Vec<u8>>;
}

/// Everything a worker needs to write one bevy.
struct BevyJob {
    resolver: Resolver,
    image: Urn,
    volume: Urn,
    number: u64,
    first_chunk: u64,
    chunk_size: u64,
    compression: Compression,
    transform: Option<Arc<dyn ChunkTransform>>,
    data: Vec<u8>,
}

impl BevyJob {
    fn run(self) -> Result<()> {
        let mut payload = Vec::with_capacity(self.data.len() / 2);
        let chunk_count = (self.data.len() as u64).div_ceil(self.chunk_size);
        let mut index = Vec::with_capacity((chunk_count as usize + 1) * 4);

        for (i, chunk) in self.data.chunks(self.chunk_size as usize).enumerate() {
            let offset = u32::try_from(payload.len())
                .ok()
                .filter(|&o| o != INDEX_SENTINEL)
                .ok_or_else(|| {
                    Error::structural(format!(
                        "bevy {} of {} does not fit 32-bit offsets",
                        self.number, self.image
                    ))
                })?;
            index.write_u32::<LittleEndian>(offset)?;

            let chunk_index = self.first_chunk + i as u64;
            let compressed = match &self.transform {
                Some(transform) => {
                    let encoded = transform.encode(chunk_index, chunk, self.chunk_size)?;
                    self.compression.compress_bytes(&encoded)?
                }
                None => self.compression.compress_bytes(chunk)?,
            };
            payload.extend_from_slice(&compressed);
        }
        index.write_u32::<LittleEndian>(INDEX_SENTINEL)?;

        // Hash before taking the volume so the lock is held only for I/O.
        let hash = blake3::hash(&payload).to_hex().to_string();

        let bevy = bevy_urn(&self.image, self.number);
        let bevy_index = index_urn(&self.image, self.number);
        let mut volume = self
            .resolver
            .open_as::<ZipVolume>(&self.volume, Mode::Write)?;
        let result = volume
            .writestr(&bevy, &payload, Compression::Stored)
            .and_then(|_| volume.writestr(&bevy_index, &index, Compression::Stored));
        self.resolver.cache_return(volume);
        result?;

        self.resolver.set(&bevy, attrs::HASH, hash);
        tracing::debug!(
            image = %self.image,
            bevy = self.number,
            chunks = chunk_count,
            bytes = self.data.len(),
            compressed = payload.len(),
            "flushed bevy"
        );
        Ok(())
    }
}

pub(crate) fn bevy_urn(image: &Urn, number: u64) -> Urn {
    image.append(format!("{:08}", number))
}

pub(crate) fn index_urn(image: &Urn, number: u64) -> Urn {
    image.append(format!("{:08}.idx", number))
}

struct Writer {
    bevy: Vec<u8>,
    next_bevy: u64,
    hasher: blake3::Hasher,
    pool: BevyPool,
}

struct Reader {
    chunks: LruCache<u64, Arc<Vec<u8>>>,
    indexes: LruCache<u64, Arc<Vec<u32>>>,
}

enum State {
    Writing(Box<Writer>),
    Reading(Box<Reader>),
    Closed,
}

pub struct ImageStream {
    urn: Urn,
    mode: Mode,
    object_type: ObjectType,
    resolver: Resolver,
    volume: Urn,
    chunk_size: u64,
    chunks_in_segment: u64,
    compression: Compression,
    transform: Option<Arc<dyn ChunkTransform>>,
    size: u64,
    pos: u64,
    state: State,
}

fn default_compression() -> Compression {
    if cfg!(feature = "deflate") {
        Compression::Deflate
    } else {
        Compression::Stored
    }
}

impl ImageStream {
    pub(crate) fn construct(resolver: &Resolver, urn: &Urn, mode: Mode) -> Result<Box<dyn Object>> {
        Ok(Box::new(ImageStream::build(
            resolver,
            urn,
            mode,
            ObjectType::Image,
            None,
        )?))
    }

    /// Set up an image, filling in default parameters for a new writer.
    pub(crate) fn build(
        resolver: &Resolver,
        urn: &Urn,
        mode: Mode,
        object_type: ObjectType,
        transform: Option<Arc<dyn ChunkTransform>>,
    ) -> Result<ImageStream> {
        let volume = resolver.require_urn(urn, attrs::STORED)?;

        if mode == Mode::Write {
            if resolver.resolve_u64(urn, attrs::SIZE).unwrap_or(0) > 0 {
                return Err(Error::structural(format!(
                    "image {} already holds data and cannot be reopened for writing",
                    urn
                )));
            }
            if resolver.resolve(urn, attrs::CHUNK_SIZE).is_none() {
                resolver.set(urn, attrs::CHUNK_SIZE, DEFAULT_CHUNK_SIZE);
            }
            if resolver.resolve(urn, attrs::CHUNKS_IN_SEGMENT).is_none() {
                resolver.set(urn, attrs::CHUNKS_IN_SEGMENT, DEFAULT_CHUNKS_IN_SEGMENT);
            }
            if resolver.resolve(urn, attrs::COMPRESSION).is_none() {
                resolver.set(urn, attrs::COMPRESSION, default_compression().name());
            }
            resolver.set(urn, attrs::SIZE, 0u64);
        }

        let chunk_size = resolver.require_u64(urn, attrs::CHUNK_SIZE)?;
        let chunks_in_segment = resolver.require_u64(urn, attrs::CHUNKS_IN_SEGMENT)?;
        if chunk_size == 0 || chunks_in_segment == 0 {
            return Err(Error::structural(format!(
                "image {} has a zero chunk size or bevy size",
                urn
            )));
        }
        let compression = match resolver.resolve_string(urn, attrs::COMPRESSION) {
            Some(name) => Compression::from_name(&name).ok_or_else(|| {
                Error::structural(format!("unknown compression {:?} on {}", name, urn))
            })?,
            None => Compression::Stored,
        };

        let (size, state) = match mode {
            Mode::Write => {
                let writer = Writer {
                    bevy: Vec::new(),
                    next_bevy: 0,
                    hasher: blake3::Hasher::new(),
                    pool: BevyPool::new(resolver.config().max_bevy_workers)?,
                };
                (0, State::Writing(Box::new(writer)))
            }
            Mode::Read => {
                let chunks = NonZeroUsize::new(resolver.config().chunk_cache_size)
                    .unwrap_or(NonZeroUsize::MIN);
                let indexes = NonZeroUsize::new(INDEX_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
                let reader = Reader {
                    chunks: LruCache::new(chunks),
                    indexes: LruCache::new(indexes),
                };
                (
                    resolver.require_u64(urn, attrs::SIZE)?,
                    State::Reading(Box::new(reader)),
                )
            }
        };

        Ok(ImageStream {
            urn: urn.clone(),
            mode,
            object_type,
            resolver: resolver.clone(),
            volume,
            chunk_size,
            chunks_in_segment,
            compression,
            transform,
            size,
            pos: 0,
            state,
        })
    }

    /// Start a new image in `volume`.
    pub fn create_in(resolver: &Resolver, volume: &Urn) -> Result<Handle<ImageStream>> {
        resolver
            .create(ObjectType::Image)
            .set(attrs::STORED, volume)
            .finish_as::<ImageStream>()
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn chunks_in_segment(&self) -> u64 {
        self.chunks_in_segment
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    fn bevy_size(&self) -> u64 {
        self.chunk_size * self.chunks_in_segment
    }

    fn dispatch_bevy(&mut self, data: Vec<u8>) {
        let writer = match &mut self.state {
            State::Writing(writer) => writer,
            _ => return,
        };
        let number = writer.next_bevy;
        writer.next_bevy += 1;

        let job = BevyJob {
            resolver: self.resolver.clone(),
            image: self.urn.clone(),
            volume: self.volume.clone(),
            number,
            first_chunk: number * self.chunks_in_segment,
            chunk_size: self.chunk_size,
            compression: self.compression,
            transform: self.transform.clone(),
            data,
        };
        tracing::trace!(image = %self.urn, bevy = number, "dispatching bevy");
        writer.pool.spawn(move || job.run());
    }

    fn write_properties(&mut self, bevies: u64) -> Result<()> {
        let mut text = String::new();
        if let Some(set) = self.resolver.properties(&self.urn) {
            ser::write_properties(&mut text, &self.urn, &self.urn, &set);
        }
        for number in 0..bevies {
            let bevy = bevy_urn(&self.urn, number);
            if let Some(hash) = self.resolver.resolve_string(&bevy, attrs::HASH) {
                let mut set = crate::store::PropertySet::new();
                set.set(attrs::HASH, hash.into());
                ser::write_properties(&mut text, &self.urn, &bevy, &set);
            }
        }

        let member = self.urn.append("properties");
        let mut volume = self
            .resolver
            .open_as::<ZipVolume>(&self.volume, Mode::Write)?;
        let result = volume.writestr(&member, text.as_bytes(), Compression::Stored);
        self.resolver.cache_return(volume);
        result
    }

    fn read_index(&mut self, bevy: u64) -> Result<Arc<Vec<u32>>> {
        if let State::Reading(reader) = &mut self.state {
            if let Some(index) = reader.indexes.get(&bevy) {
                return Ok(index.clone());
            }
        }

        let raw = Segment::read_all(&self.resolver, &index_urn(&self.urn, bevy))?;
        let mut cur = io::Cursor::new(raw.as_slice());
        let mut offsets = Vec::with_capacity(raw.len() / 4);
        loop {
            let offset = cur.read_u32::<LittleEndian>().map_err(|_| {
                Error::structural(format!("bevy index {} of {} has no sentinel", bevy, self.urn))
            })?;
            if offset == INDEX_SENTINEL {
                break;
            }
            offsets.push(offset);
        }

        let index = Arc::new(offsets);
        if let State::Reading(reader) = &mut self.state {
            reader.indexes.put(bevy, index.clone());
        }
        Ok(index)
    }

    fn read_chunk(&mut self, chunk_index: u64) -> Result<Arc<Vec<u8>>> {
        if let State::Reading(reader) = &mut self.state {
            if let Some(chunk) = reader.chunks.get(&chunk_index) {
                return Ok(chunk.clone());
            }
        }

        let bevy = chunk_index / self.chunks_in_segment;
        let in_bevy = (chunk_index % self.chunks_in_segment) as usize;
        let index = self.read_index(bevy)?;
        let start = *index.get(in_bevy).ok_or_else(|| {
            Error::structural(format!(
                "chunk {} missing from bevy {} of {}",
                chunk_index, bevy, self.urn
            ))
        })? as u64;

        let bevy_urn = bevy_urn(&self.urn, bevy);
        let mut segment = self.resolver.open_as::<Segment>(&bevy_urn, Mode::Read)?;
        let end = match index.get(in_bevy + 1) {
            Some(&next) => next as u64,
            None => segment.size(),
        };
        let raw = (|| -> Result<Vec<u8>> {
            if end < start || end > segment.size() {
                return Err(Error::structural(format!(
                    "bevy index of {} is not ascending or points past the bevy",
                    bevy_urn
                )));
            }
            let mut raw = vec![0u8; (end - start) as usize];
            segment.seek(SeekFrom::Start(start))?;
            segment.read_exact(&mut raw)?;
            Ok(raw)
        })();
        self.resolver.cache_return(segment);
        let raw = raw?;

        let plain_len = self
            .chunk_size
            .min(self.size.saturating_sub(chunk_index * self.chunk_size));
        let data = self
            .compression
            .decompress_bytes(&raw, self.chunk_size as usize)?;
        let data = match &self.transform {
            Some(transform) => transform.decode(chunk_index, data, plain_len)?,
            None => data,
        };
        if (data.len() as u64) < plain_len {
            return Err(Error::structural(format!(
                "chunk {} of {} is {} bytes, expected {}",
                chunk_index,
                self.urn,
                data.len(),
                plain_len
            )));
        }

        let chunk = Arc::new(data);
        if let State::Reading(reader) = &mut self.state {
            reader.chunks.put(chunk_index, chunk.clone());
        }
        Ok(chunk)
    }
}

impl Object for ImageStream {
    fn urn(&self) -> &Urn {
        &self.urn
    }

    fn object_type(&self) -> ObjectType {
        self.object_type
    }

    fn mode(&self) -> Mode {
        self.mode
    }

    fn close(&mut self) -> Result<()> {
        let tail = match &mut self.state {
            State::Writing(writer) => std::mem::take(&mut writer.bevy),
            _ => return Ok(()),
        };
        if !tail.is_empty() {
            self.dispatch_bevy(tail);
        }
        let writer = match std::mem::replace(&mut self.state, State::Closed) {
            State::Writing(writer) => writer,
            _ => return Ok(()),
        };
        writer.pool.join()?;

        let hash = writer.hasher.finalize().to_hex().to_string();
        self.resolver.set(&self.urn, attrs::SIZE, self.size);
        self.resolver.set(&self.urn, attrs::HASH, hash);
        self.write_properties(writer.next_bevy)?;

        tracing::info!(
            urn = %self.urn,
            size = self.size,
            bevies = writer.next_bevy,
            "closed image"
        );
        Ok(())
    }

    fn as_stream(&mut self) -> Option<&mut dyn Stream> {
        Some(self)
    }
}

impl Read for ImageStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !matches!(self.state, State::Reading(_)) {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("image {} is not open for reading", self.urn),
            ));
        }

        let mut done = 0;
        while done < buf.len() && self.pos < self.size {
            let chunk_index = self.pos / self.chunk_size;
            let in_chunk = (self.pos % self.chunk_size) as usize;
            let chunk = self.read_chunk(chunk_index)?;
            let available = (chunk.len().saturating_sub(in_chunk) as u64).min(self.size - self.pos);
            let n = (available as usize).min(buf.len() - done);
            if n == 0 {
                break;
            }
            buf[done..done + n].copy_from_slice(&chunk[in_chunk..in_chunk + n]);
            done += n;
            self.pos += n as u64;
        }
        Ok(done)
    }
}

impl Write for ImageStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let bevy_size = self.bevy_size() as usize;
        let writer = match &mut self.state {
            State::Writing(writer) => writer,
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    format!("image {} is not open for writing", self.urn),
                ))
            }
        };

        writer.hasher.update(buf);
        let mut rest = buf;
        let mut full = vec![];
        while !rest.is_empty() {
            let n = (bevy_size - writer.bevy.len()).min(rest.len());
            writer.bevy.extend_from_slice(&rest[..n]);
            rest = &rest[n..];
            if writer.bevy.len() == bevy_size {
                full.push(std::mem::replace(&mut writer.bevy, Vec::with_capacity(bevy_size)));
            }
        }
        for bevy in full {
            self.dispatch_bevy(bevy);
        }

        self.size += buf.len() as u64;
        self.pos = self.size;
        self.resolver.set(&self.urn, attrs::SIZE, self.size);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for ImageStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::End(n) => self.size.checked_add_signed(n),
            SeekFrom::Current(n) => self.pos.checked_add_signed(n),
        }
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "seek out of range"))?;

        if self.mode == Mode::Write && target != self.size {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("image {} is append-only while writing", self.urn),
            ));
        }
        self.pos = target;
        Ok(target)
    }
}

impl Stream for ImageStream {
    fn size(&self) -> u64 {
        self.size
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        if len == self.size {
            return Ok(());
        }
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("image {} cannot be truncated", self.urn),
        ))
    }
}

impl fmt::Debug for ImageStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageStream")
            .field("urn", &self.urn)
            .field("mode", &self.mode)
            .field("type", &self.object_type)
            .field("chunk_size", &self.chunk_size)
            .field("chunks_in_segment", &self.chunks_in_segment)
            .field("compression", &self.compression)
            .field("size", &self.size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_volume(resolver: &Resolver) -> (tempfile::TempDir, Urn) {
        let dir = tempfile::tempdir().unwrap();
        let backing = Urn::from_path(dir.path().join("image.zip")).unwrap();
        let volume = ZipVolume::create_in(resolver, &backing).unwrap();
        let urn = volume.urn().clone();
        resolver.cache_return(volume);
        (dir, urn)
    }

    fn small_image(resolver: &Resolver, volume: &Urn) -> Handle<ImageStream> {
        resolver
            .create(ObjectType::Image)
            .set(attrs::STORED, volume)
            .set(attrs::CHUNK_SIZE, 16u64)
            .set(attrs::CHUNKS_IN_SEGMENT, 4u64)
            .finish_as::<ImageStream>()
            .unwrap()
    }

    #[test]
    fn bevies_and_indexes_are_laid_out_as_members() {
        let resolver = Resolver::default();
        let (_dir, volume) = scratch_volume(&resolver);
        let mut image = small_image(&resolver, &volume);
        let urn = image.urn().clone();
        // Two full bevies plus one partial chunk.
        image.write_all(&[7u8; 16 * 4 * 2 + 5]).unwrap();
        image.close().unwrap();

        for number in 0..3 {
            assert!(resolver.has_subject(&bevy_urn(&urn, number)));
            let raw = Segment::read_all(&resolver, &index_urn(&urn, number)).unwrap();
            assert_eq!(&raw[raw.len() - 4..], &INDEX_SENTINEL.to_le_bytes());
            assert!(resolver.resolve_string(&bevy_urn(&urn, number), attrs::HASH).is_some());
        }
        let last = Segment::read_all(&resolver, &index_urn(&urn, 2)).unwrap();
        assert_eq!(last.len(), 8);
        assert!(!resolver.has_subject(&bevy_urn(&urn, 3)));
        assert_eq!(resolver.resolve_u64(&urn, attrs::SIZE), Some(16 * 4 * 2 + 5));
        resolver.flush().unwrap();
    }

    #[test]
    fn image_reads_again_after_its_reader_is_returned() {
        let resolver = Resolver::default();
        let (_dir, volume) = scratch_volume(&resolver);
        let mut image = small_image(&resolver, &volume);
        let urn = image.urn().clone();
        let data: Vec<u8> = (0..300u32).map(|i| (i % 251) as u8).collect();
        image.write_all(&data).unwrap();
        image.close().unwrap();

        for _ in 0..2 {
            let mut image = resolver.open_as::<ImageStream>(&urn, Mode::Read).unwrap();
            let mut out = vec![];
            image.read_to_end(&mut out).unwrap();
            assert_eq!(out, data);
            resolver.cache_return(image);
        }
        resolver.flush().unwrap();
    }

    #[test]
    fn random_access_reads() {
        let resolver = Resolver::default();
        let (_dir, volume) = scratch_volume(&resolver);
        let mut image = small_image(&resolver, &volume);
        let urn = image.urn().clone();
        let data: Vec<u8> = (0..1000u32).map(|i| (i * 7 % 256) as u8).collect();
        image.write_all(&data).unwrap();
        image.close().unwrap();

        let mut image = resolver.open_as::<ImageStream>(&urn, Mode::Read).unwrap();
        image.seek(SeekFrom::Start(333)).unwrap();
        let mut buf = [0u8; 100];
        image.read_exact(&mut buf).unwrap();
        assert_eq!(&buf[..], &data[333..433]);

        image.seek(SeekFrom::End(-10)).unwrap();
        let mut tail = vec![];
        image.read_to_end(&mut tail).unwrap();
        assert_eq!(tail, &data[990..]);
        resolver.cache_return(image);
        resolver.flush().unwrap();
    }

    #[test]
    fn writers_cannot_seek_backwards() {
        let resolver = Resolver::default();
        let (_dir, volume) = scratch_volume(&resolver);
        let mut image = small_image(&resolver, &volume);
        image.write_all(b"abc").unwrap();
        assert!(image.seek(SeekFrom::Start(0)).is_err());
        assert_eq!(image.seek(SeekFrom::End(0)).unwrap(), 3);
        assert!(image.read(&mut [0u8; 3]).is_err());
        image.close().unwrap();
        resolver.flush().unwrap();
    }

    #[test]
    fn missing_bevy_fails_the_read() {
        let resolver = Resolver::default();
        let (_dir, volume) = scratch_volume(&resolver);
        let mut image = small_image(&resolver, &volume);
        let urn = image.urn().clone();
        image.write_all(&[1u8; 200]).unwrap();
        image.close().unwrap();

        let index = index_urn(&urn, 1);
        resolver.delete_subject(&index);
        resolver.remove_value(&volume, attrs::CONTAINS, &crate::value::Value::from(&index));
        let mut image = resolver.open_as::<ImageStream>(&urn, Mode::Read).unwrap();
        let mut out = vec![];
        let err = image.read_to_end(&mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        resolver.cache_return(image);
        resolver.flush().unwrap();
    }
}
