use super::{IoError, zigzag_encode};
use crate::FileOffset;
use crate::geom::GeoCoord;
use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Sequential writer for database files.
///
/// A failed write poisons the writer: all subsequent operations (including
/// [`FileWriter::close`]) fail fast, so a half-written file is never reported
/// as successfully produced.
pub struct FileWriter {
    path: PathBuf,
    pos: u64,
    poisoned: bool,
    file: Option<BufWriter<File>>,
}

impl FileWriter {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, IoError> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).map_err(|source| IoError::Io {
            path: path.clone(),
            source,
        })?;

        Ok(Self {
            path,
            pos: 0,
            poisoned: false,
            file: Some(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    #[inline]
    pub fn pos(&self) -> u64 {
        self.pos
    }

    fn poison<T>(&mut self, error: IoError) -> Result<T, IoError> {
        self.poisoned = true;
        Err(error)
    }

    fn check(&self) -> Result<(), IoError> {
        if self.poisoned {
            return Err(IoError::Poisoned {
                path: self.path.clone(),
            });
        }
        if self.file.is_none() {
            return Err(IoError::NotOpen {
                path: self.path.clone(),
            });
        }
        Ok(())
    }

    pub fn set_pos(&mut self, pos: FileOffset) -> Result<(), IoError> {
        self.check()?;
        let path = self.path.clone();
        let result = self
            .file
            .as_mut()
            .expect("checked above")
            .seek(SeekFrom::Start(pos));

        match result {
            Ok(_) => {
                self.pos = pos;
                Ok(())
            }
            Err(source) => self.poison(IoError::Io { path, source }),
        }
    }

    pub fn write_bytes(&mut self, buf: &[u8]) -> Result<(), IoError> {
        self.check()?;
        let path = self.path.clone();
        let result = self.file.as_mut().expect("checked above").write_all(buf);

        match result {
            Ok(()) => {
                self.pos += buf.len() as u64;
                Ok(())
            }
            Err(source) => self.poison(IoError::Io { path, source }),
        }
    }

    pub fn write_u8(&mut self, value: u8) -> Result<(), IoError> {
        self.write_bytes(&[value])
    }

    pub fn write_u16(&mut self, value: u16) -> Result<(), IoError> {
        self.write_bytes(&value.to_le_bytes())
    }

    pub fn write_u32(&mut self, value: u32) -> Result<(), IoError> {
        self.write_bytes(&value.to_le_bytes())
    }

    pub fn write_u64(&mut self, value: u64) -> Result<(), IoError> {
        self.write_bytes(&value.to_le_bytes())
    }

    pub fn write_i8(&mut self, value: i8) -> Result<(), IoError> {
        self.write_bytes(&value.to_le_bytes())
    }

    pub fn write_i16(&mut self, value: i16) -> Result<(), IoError> {
        self.write_bytes(&value.to_le_bytes())
    }

    pub fn write_i32(&mut self, value: i32) -> Result<(), IoError> {
        self.write_bytes(&value.to_le_bytes())
    }

    pub fn write_i64(&mut self, value: i64) -> Result<(), IoError> {
        self.write_bytes(&value.to_le_bytes())
    }

    pub fn write_bool(&mut self, value: bool) -> Result<(), IoError> {
        self.write_u8(u8::from(value))
    }

    pub fn write_f64(&mut self, value: f64) -> Result<(), IoError> {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Writes an unsigned base-128 varint.
    pub fn write_number(&mut self, value: u64) -> Result<(), IoError> {
        let mut value = value;
        let mut buf = [0u8; 10];
        let mut len = 0;

        while value > 0x7f {
            buf[len] = (value as u8 & 0x7f) | 0x80;
            value >>= 7;
            len += 1;
        }
        buf[len] = value as u8;
        len += 1;

        self.write_bytes(&buf[..len])
    }

    /// Writes a zigzag-encoded signed varint.
    pub fn write_signed_number(&mut self, value: i64) -> Result<(), IoError> {
        self.write_number(zigzag_encode(value))
    }

    /// Writes a varint-length-prefixed UTF-8 string.
    pub fn write_string(&mut self, value: &str) -> Result<(), IoError> {
        self.write_number(value.len() as u64)?;
        self.write_bytes(value.as_bytes())
    }

    /// Writes the packed 8-byte `(lon, lat)` coordinate record.
    pub fn write_coord(&mut self, coord: &GeoCoord) -> Result<(), IoError> {
        let (lon, lat) = coord.to_packed();
        self.write_u32(lon)?;
        self.write_u32(lat)
    }

    pub fn write_file_offset(&mut self, offset: FileOffset) -> Result<(), IoError> {
        self.write_u64(offset)
    }

    /// Writes a file offset compressed to `bytes` little-endian bytes.
    /// Fails (and poisons the writer) if the value does not fit.
    pub fn write_sized_file_offset(&mut self, offset: FileOffset, bytes: u8) -> Result<(), IoError> {
        debug_assert!((1..=8).contains(&bytes));

        if bytes < 8 && offset >> (u32::from(bytes) * 8) != 0 {
            return self.poison(IoError::OffsetTooLarge {
                value: offset,
                bytes,
            });
        }

        let buf = offset.to_le_bytes();
        self.write_bytes(&buf[..bytes as usize])
    }

    pub fn flush(&mut self) -> Result<(), IoError> {
        self.check()?;
        let path = self.path.clone();
        match self.file.as_mut().expect("checked above").flush() {
            Ok(()) => Ok(()),
            Err(source) => self.poison(IoError::Io { path, source }),
        }
    }

    pub fn close(&mut self) -> Result<(), IoError> {
        self.flush()?;
        self.file = None;
        Ok(())
    }
}
