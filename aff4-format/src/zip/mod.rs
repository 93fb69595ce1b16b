//! ZIP records: local headers, central directory entries and the
//! (ZIP64-aware) end of central directory.
//!
//! Only the subset needed to write and read back volumes is covered: one
//! disk, no encryption, no data descriptors. Names are always flagged UTF-8.

use std::io::{self, Write};

use byteorder::{LittleEndian, WriteBytesExt};
use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Timelike, Utc};

mod reader;

pub use self::reader::{member_data_offset, read_directory, Directory};

pub(crate) const LOCAL_HEADER_SIGNATURE: u32 = 0x0403_4b50;
pub(crate) const CENTRAL_HEADER_SIGNATURE: u32 = 0x0201_4b50;
pub(crate) const EOCD_SIGNATURE: u32 = 0x0605_4b50;
pub(crate) const ZIP64_EOCD_SIGNATURE: u32 = 0x0606_4b50;
pub(crate) const ZIP64_LOCATOR_SIGNATURE: u32 = 0x0706_4b50;

pub(crate) const ZIP64_EXTRA_ID: u16 = 0x0001;
pub(crate) const TIMESTAMP_EXTRA_ID: u16 = 0x5455;

pub(crate) const LOCAL_HEADER_LEN: u64 = 30;
pub(crate) const EOCD_LEN: u64 = 22;
pub(crate) const ZIP64_EOCD_LEN: u64 = 56;
pub(crate) const ZIP64_LOCATOR_LEN: u64 = 20;

const U32_MAX: u64 = 0xFFFF_FFFF;
const U16_MAX: u64 = 0xFFFF;
const FLAG_UTF8: u16 = 0x0800;
const VERSION_DEFAULT: u16 = 20;
const VERSION_ZIP64: u16 = 45;
// Unix host, so the external attributes carry a file mode.
const HOST_UNIX: u16 = 3 << 8;
const MODE_REGULAR_FILE: u32 = 0o100_644;

/// Everything the central directory needs to know about one member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZipEntry {
    pub name: String,
    pub method: u16,
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub header_offset: u64,
    pub timestamp: DateTime<Utc>,
}

impl ZipEntry {
    /// An entry with zero compressed and uncompressed size marks the member
    /// as deleted.
    pub fn is_tombstone(&self) -> bool {
        self.compressed_size == 0 && self.uncompressed_size == 0
    }

    fn needs_zip64_sizes(&self) -> bool {
        self.compressed_size >= U32_MAX || self.uncompressed_size >= U32_MAX
    }

    /// Bytes occupied by the local header, name and extra fields.
    #[cfg(test)]
    pub fn local_header_len(&self) -> u64 {
        LOCAL_HEADER_LEN + self.name.len() as u64 + self.local_extra().len() as u64
    }

    fn local_extra(&self) -> Vec<u8> {
        let mut extra = vec![];
        if self.needs_zip64_sizes() {
            push_extra_header(&mut extra, ZIP64_EXTRA_ID, 16);
            extra.extend_from_slice(&self.uncompressed_size.to_le_bytes());
            extra.extend_from_slice(&self.compressed_size.to_le_bytes());
        }
        push_timestamp_extra(&mut extra, &self.timestamp);
        extra
    }

    fn central_extra(&self) -> Vec<u8> {
        let mut fields = vec![];
        if self.uncompressed_size >= U32_MAX {
            fields.extend_from_slice(&self.uncompressed_size.to_le_bytes());
        }
        if self.compressed_size >= U32_MAX {
            fields.extend_from_slice(&self.compressed_size.to_le_bytes());
        }
        if self.header_offset >= U32_MAX {
            fields.extend_from_slice(&self.header_offset.to_le_bytes());
        }

        let mut extra = vec![];
        if !fields.is_empty() {
            push_extra_header(&mut extra, ZIP64_EXTRA_ID, fields.len() as u16);
            extra.extend_from_slice(&fields);
        }
        push_timestamp_extra(&mut extra, &self.timestamp);
        extra
    }

    fn version_needed(&self) -> u16 {
        if self.needs_zip64_sizes() || self.header_offset >= U32_MAX {
            VERSION_ZIP64
        } else {
            VERSION_DEFAULT
        }
    }

    pub fn write_local_header<W: Write + ?Sized>(&self, w: &mut W) -> io::Result<()> {
        let extra = self.local_extra();
        let (time, date) = dos_datetime(&self.timestamp);

        w.write_u32::<LittleEndian>(LOCAL_HEADER_SIGNATURE)?;
        w.write_u16::<LittleEndian>(self.version_needed())?;
        w.write_u16::<LittleEndian>(FLAG_UTF8)?;
        w.write_u16::<LittleEndian>(self.method)?;
        w.write_u16::<LittleEndian>(time)?;
        w.write_u16::<LittleEndian>(date)?;
        w.write_u32::<LittleEndian>(self.crc32)?;
        w.write_u32::<LittleEndian>(saturate32(self.compressed_size, self.needs_zip64_sizes()))?;
        w.write_u32::<LittleEndian>(saturate32(self.uncompressed_size, self.needs_zip64_sizes()))?;
        w.write_u16::<LittleEndian>(name_len(&self.name)?)?;
        w.write_u16::<LittleEndian>(extra.len() as u16)?;
        w.write_all(self.name.as_bytes())?;
        w.write_all(&extra)
    }

    pub fn write_central_header<W: Write + ?Sized>(&self, w: &mut W) -> io::Result<()> {
        let extra = self.central_extra();
        let (time, date) = dos_datetime(&self.timestamp);

        w.write_u32::<LittleEndian>(CENTRAL_HEADER_SIGNATURE)?;
        w.write_u16::<LittleEndian>(HOST_UNIX | VERSION_ZIP64)?;
        w.write_u16::<LittleEndian>(self.version_needed())?;
        w.write_u16::<LittleEndian>(FLAG_UTF8)?;
        w.write_u16::<LittleEndian>(self.method)?;
        w.write_u16::<LittleEndian>(time)?;
        w.write_u16::<LittleEndian>(date)?;
        w.write_u32::<LittleEndian>(self.crc32)?;
        w.write_u32::<LittleEndian>(saturate32(
            self.compressed_size,
            self.compressed_size >= U32_MAX,
        ))?;
        w.write_u32::<LittleEndian>(saturate32(
            self.uncompressed_size,
            self.uncompressed_size >= U32_MAX,
        ))?;
        w.write_u16::<LittleEndian>(name_len(&self.name)?)?;
        w.write_u16::<LittleEndian>(extra.len() as u16)?;
        w.write_u16::<LittleEndian>(0)?; // comment
        w.write_u16::<LittleEndian>(0)?; // disk
        w.write_u16::<LittleEndian>(0)?; // internal attributes
        w.write_u32::<LittleEndian>(MODE_REGULAR_FILE << 16)?;
        w.write_u32::<LittleEndian>(saturate32(
            self.header_offset,
            self.header_offset >= U32_MAX,
        ))?;
        w.write_all(self.name.as_bytes())?;
        w.write_all(&extra)
    }
}

/// Write the end of central directory, preceded by the ZIP64 record and
/// locator when any field overflows. `offset` is where this trailer starts.
pub fn write_end_of_directory<W: Write + ?Sized>(
    w: &mut W,
    offset: u64,
    entries: u64,
    directory_offset: u64,
    directory_size: u64,
    comment: &str,
) -> io::Result<()> {
    let comment_len = u16::try_from(comment.len()).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, "archive comment is too long")
    })?;
    let zip64 = entries >= U16_MAX || directory_offset >= U32_MAX || directory_size >= U32_MAX;

    if zip64 {
        w.write_u32::<LittleEndian>(ZIP64_EOCD_SIGNATURE)?;
        w.write_u64::<LittleEndian>(ZIP64_EOCD_LEN - 12)?;
        w.write_u16::<LittleEndian>(HOST_UNIX | VERSION_ZIP64)?;
        w.write_u16::<LittleEndian>(VERSION_ZIP64)?;
        w.write_u32::<LittleEndian>(0)?;
        w.write_u32::<LittleEndian>(0)?;
        w.write_u64::<LittleEndian>(entries)?;
        w.write_u64::<LittleEndian>(entries)?;
        w.write_u64::<LittleEndian>(directory_size)?;
        w.write_u64::<LittleEndian>(directory_offset)?;

        w.write_u32::<LittleEndian>(ZIP64_LOCATOR_SIGNATURE)?;
        w.write_u32::<LittleEndian>(0)?;
        w.write_u64::<LittleEndian>(offset)?;
        w.write_u32::<LittleEndian>(1)?;
    }

    let entries16 = if zip64 { U16_MAX as u16 } else { entries as u16 };
    w.write_u32::<LittleEndian>(EOCD_SIGNATURE)?;
    w.write_u16::<LittleEndian>(0)?;
    w.write_u16::<LittleEndian>(0)?;
    w.write_u16::<LittleEndian>(entries16)?;
    w.write_u16::<LittleEndian>(entries16)?;
    w.write_u32::<LittleEndian>(saturate32(directory_size, zip64))?;
    w.write_u32::<LittleEndian>(saturate32(directory_offset, zip64))?;
    w.write_u16::<LittleEndian>(comment_len)?;
    w.write_all(comment.as_bytes())
}

fn saturate32(value: u64, overflow: bool) -> u32 {
    if overflow {
        U32_MAX as u32
    } else {
        value as u32
    }
}

fn name_len(name: &str) -> io::Result<u16> {
    u16::try_from(name.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "member name is too long"))
}

fn push_extra_header(extra: &mut Vec<u8>, id: u16, len: u16) {
    extra.extend_from_slice(&id.to_le_bytes());
    extra.extend_from_slice(&len.to_le_bytes());
}

fn push_timestamp_extra(extra: &mut Vec<u8>, timestamp: &DateTime<Utc>) {
    // Flags: modification time present.
    push_extra_header(extra, TIMESTAMP_EXTRA_ID, 5);
    extra.push(1);
    let secs = timestamp.timestamp().clamp(i32::MIN as i64, i32::MAX as i64) as i32;
    extra.extend_from_slice(&secs.to_le_bytes());
}

/// MS-DOS `(time, date)`; dates before 1980 clamp to 1980-01-01.
pub(crate) fn dos_datetime(timestamp: &DateTime<Utc>) -> (u16, u16) {
    if timestamp.year() < 1980 {
        return (0, (1 << 5) | 1);
    }
    let time = (timestamp.hour() << 11) | (timestamp.minute() << 5) | (timestamp.second() / 2);
    let date = (((timestamp.year() - 1980) as u32) << 9) | (timestamp.month() << 5) | timestamp.day();
    (time as u16, date.min(0xFFFF) as u16)
}

pub(crate) fn from_dos_datetime(time: u16, date: u16) -> Option<DateTime<Utc>> {
    let year = 1980 + i32::from(date >> 9);
    let month = u32::from((date >> 5) & 0xF);
    let day = u32::from(date & 0x1F);
    let hour = u32::from(time >> 11);
    let minute = u32::from((time >> 5) & 0x3F);
    let second = u32::from(time & 0x1F) * 2;
    let naive = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, second)?;
    Some(Utc.from_utc_datetime(&naive))
}

/// Current time truncated to the one-second resolution the archive keeps.
pub(crate) fn now() -> DateTime<Utc> {
    let now = Utc::now();
    Utc.timestamp_opt(now.timestamp(), 0).single().unwrap_or(now)
}
