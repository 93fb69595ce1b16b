//! ZIP volumes.
//!
//! A volume keeps no directory of its own: the offset, size, CRC and method
//! of every member live in the resolver as volatile attributes on the
//! member's URN, and `close` rebuilds the central directory from them. The
//! volume's URN is written into the archive comment so a relocated archive
//! can be identified again on load.

use std::collections::HashSet;
use std::io::SeekFrom;

use crate::attrs;
use crate::compression::Compression;
use crate::de;
use crate::error::{Error, Result};
use crate::object::{Handle, Mode, Object, ObjectType, Stream};
use crate::path::MemberPath;
use crate::resolver::Resolver;
use crate::ser;
use crate::urn::Urn;
use crate::value::Value;
use crate::zip::{self, Directory, ZipEntry};

pub mod merge;

use self::merge::MemberEntry;

const PROPERTIES: &str = "properties";

#[derive(Debug)]
pub struct ZipVolume {
    urn: Urn,
    mode: Mode,
    resolver: Resolver,
    backing: Urn,
}

impl ZipVolume {
    pub(crate) fn construct(resolver: &Resolver, urn: &Urn, mode: Mode) -> Result<Box<dyn Object>> {
        let backing = resolver.require_urn(urn, attrs::STORED)?;

        if resolver.resolve_u64(urn, attrs::DIRECTORY_OFFSET).is_none() {
            if mode == Mode::Read {
                return Err(Error::MissingAttribute {
                    urn: urn.clone(),
                    attr: attrs::DIRECTORY_OFFSET,
                });
            }

            let mut handle = resolver.open(&backing, Mode::Write)?;
            handle.stream()?.truncate(0)?;
            resolver.cache_return(handle);

            resolver.set(urn, attrs::DIRECTORY_OFFSET, 0u64);
            resolver.set(urn, attrs::DIRTY, 1u64);
            resolver.set(urn, attrs::VERSION, attrs::VOCABULARY_VERSION);
            resolver.set(urn, attrs::TIMESTAMP, zip::now());
            tracing::info!(urn = %urn, backing = %backing, "created volume");
        }

        Ok(Box::new(ZipVolume {
            urn: urn.clone(),
            mode,
            resolver: resolver.clone(),
            backing,
        }))
    }

    /// Create a new, empty volume stored in `backing`. Any previous content
    /// of the backing store is discarded.
    pub fn create_in(resolver: &Resolver, backing: &Urn) -> Result<Handle<ZipVolume>> {
        resolver
            .create(ObjectType::ZipVolume)
            .set(attrs::STORED, backing)
            .finish_as::<ZipVolume>()
    }

    /// Create a new volume under a caller-chosen URN, e.g. another archive
    /// of a volume that is split or appended across files. Whatever the
    /// resolver knew about the volume's directory is forgotten.
    pub fn create_named(resolver: &Resolver, urn: &Urn, backing: &Urn) -> Result<Handle<ZipVolume>> {
        resolver.delete(urn, attrs::DIRECTORY_OFFSET);
        resolver.delete(urn, attrs::CONTAINS);
        resolver.delete(urn, attrs::DIRTY);
        resolver
            .create(ObjectType::ZipVolume)
            .urn(urn.clone())
            .set(attrs::STORED, backing)
            .finish_as::<ZipVolume>()
    }

    /// Load the archive at a local path; see [`ZipVolume::load_from`].
    pub fn open_path<P: AsRef<std::path::Path>>(resolver: &Resolver, path: P) -> Result<Urn> {
        let backing = Urn::from_path(path)?;
        ZipVolume::load_from(resolver, &backing)
    }

    pub fn backing(&self) -> &Urn {
        &self.backing
    }

    /// URN of the member called `name` in this volume.
    pub fn member_urn(&self, name: &str) -> Urn {
        self.urn.append(name)
    }

    /// Members currently in the volume, excluding deleted ones.
    pub fn members(&self) -> Vec<Urn> {
        list_members(&self.resolver, &self.urn)
    }

    /// Append `data` as the member `member`.
    pub fn writestr(&mut self, member: &Urn, data: &[u8], compression: Compression) -> Result<()> {
        let method = compression.zip_method().ok_or_else(|| {
            Error::structural(format!("{} has no ZIP method and cannot store members", compression))
        })?;
        let payload = compression.compress_bytes(data)?;
        let path = MemberPath::for_urn(member, &self.urn);
        let offset = self
            .resolver
            .require_u64(&self.urn, attrs::DIRECTORY_OFFSET)?;

        let entry = ZipEntry {
            name: path.as_str().to_string(),
            method,
            crc32: crc32fast::hash(data),
            compressed_size: payload.len() as u64,
            uncompressed_size: data.len() as u64,
            header_offset: offset,
            timestamp: zip::now(),
        };

        let end = self.with_backing(|stream| {
            stream.seek(SeekFrom::Start(offset))?;
            entry.write_local_header(stream)?;
            stream.write_all(&payload)?;
            Ok(stream.stream_position()?)
        })?;

        let r = &self.resolver;
        r.set(member, attrs::TYPE, ObjectType::Segment.tag());
        r.set(member, attrs::STORED, &self.urn);
        r.set(member, attrs::SIZE, entry.uncompressed_size);
        r.set(member, attrs::TIMESTAMP, entry.timestamp);
        r.set(member, attrs::ZIP_HEADER_OFFSET, entry.header_offset);
        r.set(member, attrs::ZIP_COMPRESSED_SIZE, entry.compressed_size);
        r.set(member, attrs::ZIP_CRC, u64::from(entry.crc32));
        r.set(member, attrs::ZIP_METHOD, u64::from(entry.method));
        r.delete(member, attrs::ZIP_BACKING);
        r.add(&self.urn, attrs::CONTAINS, member);
        r.set(&self.urn, attrs::DIRECTORY_OFFSET, end);
        r.set(&self.urn, attrs::DIRTY, 1u64);
        r.invalidate(member);

        tracing::debug!(
            name = %path,
            offset = format_args!("{:#x}", offset),
            size = entry.uncompressed_size,
            compressed = entry.compressed_size,
            "wrote member"
        );
        Ok(())
    }

    /// Delete `member` by writing a zero-length entry over it. The entry
    /// supersedes older copies when volumes are merged.
    pub fn remove_member(&mut self, member: &Urn) -> Result<()> {
        self.writestr(member, &[], Compression::Stored)?;
        tracing::debug!(member = %member, "wrote tombstone");
        Ok(())
    }

    /// Load the archive in `backing` into the resolver and return the URN
    /// of the volume it holds.
    ///
    /// The URN comes from the archive comment or, failing that, from the
    /// root `properties` member. Deleted members are not registered.
    pub fn load_from(resolver: &Resolver, backing: &Urn) -> Result<Urn> {
        let directory = read_directory(resolver, backing)?;

        let volume = match directory.comment.trim() {
            "" => urn_from_properties(resolver, backing, &directory)?,
            comment => Urn::new(comment),
        };

        let entries: Vec<_> = directory
            .entries
            .into_iter()
            .map(|entry| Located {
                backing: backing.clone(),
                entry,
            })
            .collect();
        let survivors = merge::consolidate(entries);
        register(resolver, &volume, backing, directory.directory_offset, &survivors, false)?;

        tracing::info!(
            urn = %volume,
            backing = %backing,
            members = survivors.len(),
            "loaded volume"
        );
        Ok(volume)
    }

    /// Load several archives that carry the same volume URN and reconcile
    /// their directories, newest entry first, tombstones winning ties.
    ///
    /// The last archive becomes the volume's backing store for appends.
    pub fn load_merged(resolver: &Resolver, backings: &[Urn]) -> Result<Urn> {
        let mut volume: Option<Urn> = None;
        let mut entries = vec![];
        let mut directory_offset = 0;

        for backing in backings {
            let directory = read_directory(resolver, backing)?;
            let urn = match directory.comment.trim() {
                "" => {
                    return Err(Error::structural(format!(
                        "{} has no volume URN in its archive comment",
                        backing
                    )))
                }
                comment => Urn::new(comment),
            };
            match &volume {
                Some(existing) if *existing != urn => {
                    return Err(Error::structural(format!(
                        "cannot merge volume {} into {}",
                        urn, existing
                    )))
                }
                Some(_) => {}
                None => volume = Some(urn),
            }

            directory_offset = directory.directory_offset;
            entries.extend(directory.entries.into_iter().map(|entry| Located {
                backing: backing.clone(),
                entry,
            }));
        }

        let (volume, last) = match (volume, backings.last()) {
            (Some(volume), Some(last)) => (volume, last),
            _ => return Err(Error::structural("no archives to merge")),
        };

        let survivors = merge::consolidate(entries);
        register(resolver, &volume, last, directory_offset, &survivors, true)?;

        tracing::info!(
            urn = %volume,
            archives = backings.len(),
            members = survivors.len(),
            "merged volume"
        );
        Ok(volume)
    }

    fn with_backing<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut dyn Stream) -> Result<R>,
    {
        let mut handle = self.resolver.open(&self.backing, Mode::Write)?;
        let result = f(handle.stream()?);
        self.resolver.cache_return(handle);
        result
    }

    fn write_properties(&mut self) -> Result<()> {
        let mut text = String::new();
        self.resolver.with_store(|store| {
            if let Some(set) = store.properties(&self.urn) {
                // Membership is rebuilt from the central directory.
                ser::write_qualified(&mut text, &self.urn, set, &[attrs::CONTAINS]);
            }

            let mut links: Vec<&Urn> = store
                .subjects()
                .filter(|urn| {
                    store.resolve(urn, attrs::TYPE).and_then(Value::as_str)
                        == Some(ObjectType::Link.tag())
                        && store.resolve(urn, attrs::STORED).and_then(Value::as_urn)
                            == Some(&self.urn)
                })
                .collect();
            links.sort();
            for link in links {
                if let Some(set) = store.properties(link) {
                    ser::write_qualified(&mut text, link, set, &[]);
                }
            }
        });

        let member = self.member_urn(PROPERTIES);
        self.writestr(&member, text.as_bytes(), Compression::Stored)
    }

    fn directory_entries(&self) -> Result<Vec<ZipEntry>> {
        let r = &self.resolver;
        let mut out = vec![];
        for value in r.resolve_list(&self.urn, attrs::CONTAINS) {
            let member = match value.as_urn() {
                Some(member) => member,
                None => continue,
            };
            // Merged members that live in an older archive.
            if let Some(backing) = r.resolve_urn(member, attrs::ZIP_BACKING) {
                if backing != self.backing {
                    continue;
                }
            }

            out.push(ZipEntry {
                name: MemberPath::for_urn(member, &self.urn).as_str().to_string(),
                method: r.require_u64(member, attrs::ZIP_METHOD)? as u16,
                crc32: r.require_u64(member, attrs::ZIP_CRC)? as u32,
                compressed_size: r.require_u64(member, attrs::ZIP_COMPRESSED_SIZE)?,
                uncompressed_size: r.require_u64(member, attrs::SIZE)?,
                header_offset: r.require_u64(member, attrs::ZIP_HEADER_OFFSET)?,
                timestamp: r
                    .resolve(member, attrs::TIMESTAMP)
                    .and_then(|v| v.as_timestamp())
                    .unwrap_or_else(zip::now),
            });
        }
        Ok(out)
    }

    fn write_directory(&mut self) -> Result<()> {
        let offset = self
            .resolver
            .require_u64(&self.urn, attrs::DIRECTORY_OFFSET)?;
        let entries = self.directory_entries()?;

        let mut buf = vec![];
        for entry in &entries {
            entry.write_central_header(&mut buf)?;
        }
        let directory_size = buf.len() as u64;
        zip::write_end_of_directory(
            &mut buf,
            offset + directory_size,
            entries.len() as u64,
            offset,
            directory_size,
            self.urn.as_str(),
        )?;

        self.with_backing(|stream| {
            stream.seek(SeekFrom::Start(offset))?;
            stream.write_all(&buf)?;
            let end = stream.stream_position()?;
            stream.truncate(end)?;
            stream.flush()?;
            Ok(())
        })?;

        tracing::debug!(
            entries = entries.len(),
            offset = format_args!("{:#x}", offset),
            "wrote central directory"
        );
        Ok(())
    }
}

impl Object for ZipVolume {
    fn urn(&self) -> &Urn {
        &self.urn
    }

    fn object_type(&self) -> ObjectType {
        ObjectType::ZipVolume
    }

    fn mode(&self) -> Mode {
        self.mode
    }

    fn close(&mut self) -> Result<()> {
        if self.resolver.resolve_u64(&self.urn, attrs::DIRTY) != Some(1) {
            return Ok(());
        }

        self.write_properties()?;
        self.write_directory()?;
        self.resolver.delete(&self.urn, attrs::DIRTY);

        tracing::info!(urn = %self.urn, backing = %self.backing, "closed volume");
        Ok(())
    }
}

/// A directory entry together with the archive it was read from.
#[derive(Debug)]
struct Located {
    backing: Urn,
    entry: ZipEntry,
}

impl MemberEntry for Located {
    fn path(&self) -> &str {
        &self.entry.name
    }

    fn timestamp(&self) -> chrono::DateTime<chrono::Utc> {
        self.entry.timestamp
    }

    fn is_tombstone(&self) -> bool {
        self.entry.is_tombstone()
    }
}

pub(crate) fn list_members(resolver: &Resolver, volume: &Urn) -> Vec<Urn> {
    resolver
        .resolve_list(volume, attrs::CONTAINS)
        .into_iter()
        .filter_map(|v| v.as_urn().cloned())
        .filter(|member| {
            resolver.resolve_u64(member, attrs::SIZE) != Some(0)
                || resolver.resolve_u64(member, attrs::ZIP_COMPRESSED_SIZE) != Some(0)
        })
        .collect()
}

fn read_directory(resolver: &Resolver, backing: &Urn) -> Result<Directory> {
    let mut handle = resolver.open(backing, Mode::Read)?;
    let directory = zip::read_directory(handle.stream()?);
    resolver.cache_return(handle);
    directory
}

/// Read a member's data straight from the archive, before any URN is known.
fn read_entry(resolver: &Resolver, backing: &Urn, entry: &ZipEntry) -> Result<Vec<u8>> {
    let mut handle = resolver.open(backing, Mode::Read)?;
    let result = (|| -> Result<Vec<u8>> {
        let stream = handle.stream()?;
        let offset = zip::member_data_offset(stream, entry.header_offset, entry.compressed_size)?;
        stream.seek(SeekFrom::Start(offset))?;
        let mut raw = vec![0u8; entry.compressed_size as usize];
        stream.read_exact(&mut raw)?;
        Ok(Compression::from_zip_method(entry.method)
            .decompress_bytes(&raw, entry.uncompressed_size as usize)?)
    })();
    resolver.cache_return(handle);
    result
}

fn urn_from_properties(resolver: &Resolver, backing: &Urn, directory: &Directory) -> Result<Urn> {
    let entry = directory
        .entries
        .iter()
        .find(|e| e.name == PROPERTIES)
        .ok_or_else(|| {
            Error::structural(format!(
                "{} has neither a volume URN comment nor a properties member",
                backing
            ))
        })?;
    let data = read_entry(resolver, backing, entry)?;
    let text = String::from_utf8(data).map_err(|e| Error::structural(e.to_string()))?;

    de::parse_properties(&text, backing)?
        .into_iter()
        .find(|(_, attr, value)| {
            attr == attrs::TYPE && value.as_str() == Some(ObjectType::ZipVolume.tag())
        })
        .map(|(subject, _, _)| subject)
        .ok_or_else(|| Error::structural(format!("{} does not name its volume", backing)))
}

fn register(
    resolver: &Resolver,
    volume: &Urn,
    backing: &Urn,
    directory_offset: u64,
    members: &[Located],
    merged: bool,
) -> Result<()> {
    let mut properties = vec![];

    for Located {
        backing: member_backing,
        entry,
    } in members
    {
        let path = MemberPath::new(entry.name.clone())?;
        let member = path.to_urn(volume)?;

        resolver.set(&member, attrs::TYPE, ObjectType::Segment.tag());
        resolver.set(&member, attrs::STORED, volume);
        resolver.set(&member, attrs::SIZE, entry.uncompressed_size);
        resolver.set(&member, attrs::TIMESTAMP, entry.timestamp);
        resolver.set(&member, attrs::ZIP_HEADER_OFFSET, entry.header_offset);
        resolver.set(&member, attrs::ZIP_COMPRESSED_SIZE, entry.compressed_size);
        resolver.set(&member, attrs::ZIP_CRC, u64::from(entry.crc32));
        resolver.set(&member, attrs::ZIP_METHOD, u64::from(entry.method));
        if merged {
            resolver.set(&member, attrs::ZIP_BACKING, member_backing);
        }
        resolver.add(volume, attrs::CONTAINS, &member);
        resolver.invalidate(&member);

        if path.is_properties() {
            properties.push(member);
        }
    }

    resolver.set(volume, attrs::TYPE, ObjectType::ZipVolume.tag());
    resolver.set(volume, attrs::STORED, backing);
    resolver.set(volume, attrs::DIRECTORY_OFFSET, directory_offset);

    for member in properties {
        let owner = match member.as_str().strip_suffix("/properties") {
            Some(owner) if owner != volume.as_str() => Urn::new(owner),
            _ => volume.clone(),
        };
        let data = crate::segment::Segment::read_all(resolver, &member)?;
        let text = String::from_utf8(data).map_err(|e| Error::structural(e.to_string()))?;
        apply_triples(resolver, de::parse_properties(&text, &owner)?);
    }

    // The archive may have moved since the properties were written.
    resolver.set(volume, attrs::STORED, backing);
    Ok(())
}

/// Publish parsed triples. The first occurrence of an attribute for a
/// subject replaces what the resolver knew, later ones are appended.
pub(crate) fn apply_triples(resolver: &Resolver, triples: Vec<de::Triple>) {
    let mut seen = HashSet::new();
    for (subject, attr, value) in triples {
        if seen.insert((subject.clone(), attr.clone())) {
            resolver.set(&subject, &attr, value);
        } else {
            resolver.add(&subject, &attr, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::Segment;

    fn scratch() -> (tempfile::TempDir, Urn) {
        let dir = tempfile::tempdir().unwrap();
        let backing = Urn::from_path(dir.path().join("vol.zip")).unwrap();
        (dir, backing)
    }

    #[test]
    fn close_without_writes_is_a_no_op_after_first_close() {
        let (_dir, backing) = scratch();
        let resolver = Resolver::default();
        let mut volume = ZipVolume::create_in(&resolver, &backing).unwrap();
        let urn = volume.urn().clone();
        volume.close().unwrap();

        let size = std::fs::metadata(backing.to_file_path().unwrap()).unwrap().len();
        let volume = resolver.open(&urn, Mode::Write).unwrap();
        volume.close().unwrap();
        assert_eq!(
            std::fs::metadata(backing.to_file_path().unwrap()).unwrap().len(),
            size
        );
    }

    #[test]
    fn members_survive_reopen_in_a_fresh_resolver() {
        let (_dir, backing) = scratch();
        let resolver = Resolver::default();
        let mut volume = ZipVolume::create_in(&resolver, &backing).unwrap();
        let urn = volume.urn().clone();
        let a = volume.member_urn("a");
        let b = volume.member_urn("nested/b");
        volume.writestr(&a, b"alpha", Compression::Stored).unwrap();
        volume
            .writestr(&b, &b"beta".repeat(100), Compression::Deflate)
            .unwrap();
        volume.close().unwrap();

        let fresh = Resolver::default();
        assert_eq!(ZipVolume::load_from(&fresh, &backing).unwrap(), urn);
        assert_eq!(Segment::read_all(&fresh, &a).unwrap(), b"alpha");
        assert_eq!(Segment::read_all(&fresh, &b).unwrap(), b"beta".repeat(100));
        assert_eq!(
            fresh.resolve_u64(&urn, attrs::VERSION),
            Some(attrs::VOCABULARY_VERSION)
        );
    }

    #[test]
    fn snappy_is_not_a_member_method() {
        let (_dir, backing) = scratch();
        let resolver = Resolver::default();
        let mut volume = ZipVolume::create_in(&resolver, &backing).unwrap();
        let member = volume.member_urn("x");
        let err = volume
            .writestr(&member, b"x", Compression::Snappy)
            .unwrap_err();
        assert!(matches!(err, Error::Structural(_)));
        volume.close().unwrap();
    }

    #[test]
    fn garbage_is_a_structural_error() {
        let (_dir, backing) = scratch();
        std::fs::write(backing.to_file_path().unwrap(), b"definitely not a zip file").unwrap();
        let err = ZipVolume::load_from(&Resolver::default(), &backing).unwrap_err();
        assert!(matches!(err, Error::Structural(_)));
    }
}
