use std::io::{self, Cursor, Read, Seek, SeekFrom};

use byteorder::{LittleEndian, ReadBytesExt};
use chrono::{DateTime, TimeZone, Utc};

use super::*;
use crate::error::{Error, Result};

/// Parsed central directory of an archive.
#[derive(Debug, Clone)]
pub struct Directory {
    pub entries: Vec<ZipEntry>,
    /// Offset of the first central directory record, i.e. where new members
    /// may be appended.
    pub directory_offset: u64,
    pub comment: String,
}

const MAX_COMMENT_LEN: u64 = 0xFFFF;

/// Locate and parse the central directory of the archive in `r`.
pub fn read_directory<R: Read + Seek + ?Sized>(r: &mut R) -> Result<Directory> {
    let len = r.seek(SeekFrom::End(0))?;
    if len < EOCD_LEN {
        return Err(Error::structural("archive is too short for a ZIP trailer"));
    }

    let tail_len = len.min(EOCD_LEN + MAX_COMMENT_LEN);
    let tail_start = len - tail_len;
    r.seek(SeekFrom::Start(tail_start))?;
    let mut tail = vec![0u8; tail_len as usize];
    r.read_exact(&mut tail)?;

    let eocd_pos = find_eocd(&tail)
        .ok_or_else(|| Error::structural("no end of central directory record"))?;
    let eocd_offset = tail_start + eocd_pos as u64;

    let mut cur = Cursor::new(&tail[eocd_pos + 4..]);
    let _disk = cur.read_u16::<LittleEndian>()?;
    let _cd_disk = cur.read_u16::<LittleEndian>()?;
    let _disk_entries = cur.read_u16::<LittleEndian>()?;
    let mut entries = u64::from(cur.read_u16::<LittleEndian>()?);
    let mut directory_size = u64::from(cur.read_u32::<LittleEndian>()?);
    let mut directory_offset = u64::from(cur.read_u32::<LittleEndian>()?);
    let comment_len = cur.read_u16::<LittleEndian>()? as usize;
    let comment_start = eocd_pos + EOCD_LEN as usize;
    let comment = String::from_utf8_lossy(&tail[comment_start..comment_start + comment_len])
        .into_owned();

    if eocd_offset >= ZIP64_LOCATOR_LEN {
        if let Some(zip64_offset) = read_locator(r, eocd_offset - ZIP64_LOCATOR_LEN)? {
            r.seek(SeekFrom::Start(zip64_offset))?;
            if r.read_u32::<LittleEndian>()? != ZIP64_EOCD_SIGNATURE {
                return Err(Error::structural("ZIP64 locator points at garbage"));
            }
            let _record_len = r.read_u64::<LittleEndian>()?;
            let _made_by = r.read_u16::<LittleEndian>()?;
            let _needed = r.read_u16::<LittleEndian>()?;
            let _disk = r.read_u32::<LittleEndian>()?;
            let _cd_disk = r.read_u32::<LittleEndian>()?;
            let _disk_entries = r.read_u64::<LittleEndian>()?;
            entries = r.read_u64::<LittleEndian>()?;
            directory_size = r.read_u64::<LittleEndian>()?;
            directory_offset = r.read_u64::<LittleEndian>()?;
        }
    }

    if directory_offset.saturating_add(directory_size) > eocd_offset {
        return Err(Error::structural(format!(
            "central directory at {:#x}+{:#x} overlaps its trailer at {:#x}",
            directory_offset, directory_size, eocd_offset
        )));
    }

    r.seek(SeekFrom::Start(directory_offset))?;
    let mut raw = vec![0u8; directory_size as usize];
    r.read_exact(&mut raw)?;
    let mut cur = Cursor::new(raw.as_slice());

    let mut out = Vec::with_capacity(entries.min(1 << 16) as usize);
    for index in 0..entries {
        let entry = read_central_header(&mut cur).map_err(|err| match err {
            Error::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof => Error::structural(format!(
                "central directory ends inside record {} of {}",
                index, entries
            )),
            other => other,
        })?;
        out.push(entry);
    }

    tracing::debug!(
        entries = out.len(),
        offset = format_args!("{:#x}", directory_offset),
        "parsed central directory"
    );

    Ok(Directory {
        entries: out,
        directory_offset,
        comment,
    })
}

fn find_eocd(tail: &[u8]) -> Option<usize> {
    let sig = EOCD_SIGNATURE.to_le_bytes();
    let last = tail.len().checked_sub(EOCD_LEN as usize)?;
    (0..=last).rev().find(|&i| {
        if tail[i..i + 4] != sig {
            return false;
        }
        let comment_len = u16::from_le_bytes([tail[i + 20], tail[i + 21]]) as usize;
        i + EOCD_LEN as usize + comment_len == tail.len()
    })
}

fn read_locator<R: Read + Seek + ?Sized>(r: &mut R, offset: u64) -> io::Result<Option<u64>> {
    r.seek(SeekFrom::Start(offset))?;
    if r.read_u32::<LittleEndian>()? != ZIP64_LOCATOR_SIGNATURE {
        return Ok(None);
    }
    let _disk = r.read_u32::<LittleEndian>()?;
    Ok(Some(r.read_u64::<LittleEndian>()?))
}

fn read_central_header(cur: &mut Cursor<&[u8]>) -> Result<ZipEntry> {
    if cur.read_u32::<LittleEndian>()? != CENTRAL_HEADER_SIGNATURE {
        return Err(Error::structural(format!(
            "bad central directory record at {:#x}",
            cur.position() - 4
        )));
    }
    let _made_by = cur.read_u16::<LittleEndian>()?;
    let _needed = cur.read_u16::<LittleEndian>()?;
    let _flags = cur.read_u16::<LittleEndian>()?;
    let method = cur.read_u16::<LittleEndian>()?;
    let time = cur.read_u16::<LittleEndian>()?;
    let date = cur.read_u16::<LittleEndian>()?;
    let crc32 = cur.read_u32::<LittleEndian>()?;
    let mut compressed_size = u64::from(cur.read_u32::<LittleEndian>()?);
    let mut uncompressed_size = u64::from(cur.read_u32::<LittleEndian>()?);
    let name_len = cur.read_u16::<LittleEndian>()? as usize;
    let extra_len = cur.read_u16::<LittleEndian>()? as usize;
    let comment_len = cur.read_u16::<LittleEndian>()? as i64;
    let _disk = cur.read_u16::<LittleEndian>()?;
    let _internal = cur.read_u16::<LittleEndian>()?;
    let _external = cur.read_u32::<LittleEndian>()?;
    let mut header_offset = u64::from(cur.read_u32::<LittleEndian>()?);

    let mut name = vec![0u8; name_len];
    cur.read_exact(&mut name)?;
    let name = String::from_utf8(name)
        .map_err(|_| Error::structural("member name is not UTF-8"))?;
    let mut extra = vec![0u8; extra_len];
    cur.read_exact(&mut extra)?;
    cur.seek(SeekFrom::Current(comment_len))?;

    let mut timestamp = None;
    let mut fields = Cursor::new(extra.as_slice());
    while (fields.position() as usize) + 4 <= extra.len() {
        let id = fields.read_u16::<LittleEndian>()?;
        let len = fields.read_u16::<LittleEndian>()? as u64;
        let end = fields.position() + len;
        match id {
            ZIP64_EXTRA_ID => {
                if uncompressed_size == U32_MAX {
                    uncompressed_size = fields.read_u64::<LittleEndian>()?;
                }
                if compressed_size == U32_MAX {
                    compressed_size = fields.read_u64::<LittleEndian>()?;
                }
                if header_offset == U32_MAX {
                    header_offset = fields.read_u64::<LittleEndian>()?;
                }
            }
            TIMESTAMP_EXTRA_ID if len >= 5 => {
                let flags = fields.read_u8()?;
                if flags & 1 == 1 {
                    let secs = fields.read_i32::<LittleEndian>()?;
                    timestamp = Utc.timestamp_opt(i64::from(secs), 0).single();
                }
            }
            _ => {}
        }
        fields.set_position(end);
    }

    let timestamp: DateTime<Utc> = timestamp
        .or_else(|| from_dos_datetime(time, date))
        .unwrap_or_default();

    Ok(ZipEntry {
        name,
        method,
        crc32,
        compressed_size,
        uncompressed_size,
        header_offset,
        timestamp,
    })
}

/// Length of the local header at `offset`, i.e. the distance to the
/// member's data.
pub fn read_local_header_len<R: Read + Seek + ?Sized>(r: &mut R, offset: u64) -> Result<u64> {
    r.seek(SeekFrom::Start(offset))?;
    let mut header = [0u8; LOCAL_HEADER_LEN as usize];
    r.read_exact(&mut header)?;
    let mut cur = Cursor::new(&header[..]);
    if cur.read_u32::<LittleEndian>()? != LOCAL_HEADER_SIGNATURE {
        return Err(Error::structural(format!(
            "no local header at {:#x}",
            offset
        )));
    }
    cur.set_position(26);
    let name_len = u64::from(cur.read_u16::<LittleEndian>()?);
    let extra_len = u64::from(cur.read_u16::<LittleEndian>()?);
    Ok(LOCAL_HEADER_LEN + name_len + extra_len)
}

/// Offset of the data of the member whose local header is at
/// `header_offset`. Fails unless all `compressed_size` bytes lie inside the
/// archive.
pub fn member_data_offset<R: Read + Seek + ?Sized>(
    r: &mut R,
    header_offset: u64,
    compressed_size: u64,
) -> Result<u64> {
    let len = r.seek(SeekFrom::End(0))?;
    if header_offset.saturating_add(LOCAL_HEADER_LEN) > len {
        return Err(Error::structural(format!(
            "local header at {:#x} lies past the end of the archive",
            header_offset
        )));
    }
    let offset = header_offset + read_local_header_len(r, header_offset)?;
    match offset.checked_add(compressed_size) {
        Some(end) if end <= len => Ok(offset),
        _ => Err(Error::structural(format!(
            "member at {:#x} claims {} bytes but the archive ends at {:#x}",
            header_offset, compressed_size, len
        ))),
    }
}
