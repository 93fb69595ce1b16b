use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};

use crate::error::{Error, Result};
use crate::object::{Mode, Object, ObjectType, Stream};
use crate::resolver::Resolver;
use crate::urn::Urn;

/// A local file addressed by a `file://` URN.
#[derive(Debug)]
pub struct FileBackingStore {
    urn: Urn,
    mode: Mode,
    file: fs::File,
    size: u64,
}

impl FileBackingStore {
    pub(crate) fn construct(_resolver: &Resolver, urn: &Urn, mode: Mode) -> Result<Box<dyn Object>> {
        let path = urn
            .to_file_path()
            .ok_or_else(|| Error::NotFound(urn.clone()))?;

        let file = match mode {
            Mode::Read => fs::File::open(path)?,
            Mode::Write => fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)?,
        };
        let size = file.metadata()?.len();
        tracing::trace!(urn = %urn, ?mode, size, "opened backing file");

        Ok(Box::new(FileBackingStore {
            urn: urn.clone(),
            mode,
            file,
            size,
        }))
    }
}

impl Object for FileBackingStore {
    fn urn(&self) -> &Urn {
        &self.urn
    }

    fn object_type(&self) -> ObjectType {
        ObjectType::File
    }

    fn mode(&self) -> Mode {
        self.mode
    }

    fn close(&mut self) -> Result<()> {
        if self.mode == Mode::Write {
            self.file.sync_data()?;
        }
        Ok(())
    }

    fn as_stream(&mut self) -> Option<&mut dyn Stream> {
        Some(self)
    }
}

impl Read for FileBackingStore {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for FileBackingStore {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.file.write(buf)?;
        let pos = self.file.stream_position()?;
        self.size = self.size.max(pos);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for FileBackingStore {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

impl Stream for FileBackingStore {
    fn size(&self) -> u64 {
        self.size
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.file.set_len(len)?;
        self.size = len;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_through_resolver() {
        let dir = tempfile::tempdir().unwrap();
        let urn = Urn::from_path(dir.path().join("raw.bin")).unwrap();
        let resolver = Resolver::default();

        let mut handle = resolver.open(&urn, Mode::Write).unwrap();
        let stream = handle.stream().unwrap();
        stream.write_all(b"0123456789").unwrap();
        stream.truncate(4).unwrap();
        assert_eq!(stream.size(), 4);
        handle.close().unwrap();

        let mut handle = resolver.open(&urn, Mode::Read).unwrap();
        let mut out = String::new();
        handle.stream().unwrap().read_to_string(&mut out).unwrap();
        assert_eq!(out, "0123");
        resolver.cache_return(handle);
    }

    #[test]
    fn missing_file_for_read_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let urn = Urn::from_path(dir.path().join("absent")).unwrap();
        let err = Resolver::default().open(&urn, Mode::Read).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
