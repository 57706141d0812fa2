use super::{AccessMode, IoError, zigzag_decode};
use crate::FileOffset;
use crate::geom::GeoCoord;
use memmap2::Mmap;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

enum Source {
    Mapped(Mmap),
    Direct(BufReader<File>),
}

/// Sequential/random reader over a single database file.
///
/// All reads advance the position; [`FileScanner::set_pos`] repositions.
/// Every call returns a [`IoError`] on failure and the caller is expected to
/// short-circuit with `?`.
pub struct FileScanner {
    path: PathBuf,
    size: u64,
    pos: u64,
    source: Option<Source>,
}

impl FileScanner {
    pub fn open(
        path: impl AsRef<Path>,
        mode: AccessMode,
        memory_mapped: bool,
    ) -> Result<Self, IoError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|source| IoError::Io {
            path: path.clone(),
            source,
        })?;
        let size = file
            .metadata()
            .map_err(|source| IoError::Io {
                path: path.clone(),
                source,
            })?
            .len();

        // Zero-length files cannot be mapped; fall back to plain reads.
        let source = if memory_mapped && size > 0 {
            // SAFETY: the database directory is treated as immutable while
            // open; concurrent truncation is outside the supported contract.
            let map = unsafe { Mmap::map(&file) }.map_err(|source| IoError::Io {
                path: path.clone(),
                source,
            })?;
            Source::Mapped(map)
        } else {
            let capacity = match mode {
                AccessMode::Sequential => 64 * 1024,
                AccessMode::FastRandom => 16 * 1024,
                AccessMode::Random => 4 * 1024,
                AccessMode::LowMemRandom => 1024,
            };
            Source::Direct(BufReader::with_capacity(capacity, file))
        };

        Ok(Self {
            path,
            size,
            pos: 0,
            source: Some(source),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.source.is_some()
    }

    /// Total size of the underlying file in bytes.
    pub fn len(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    #[inline]
    pub fn pos(&self) -> u64 {
        self.pos
    }

    pub fn set_pos(&mut self, pos: FileOffset) -> Result<(), IoError> {
        let path = self.path.clone();
        match self.source.as_mut() {
            None => return Err(IoError::NotOpen { path }),
            Some(Source::Mapped(_)) => {}
            Some(Source::Direct(reader)) => {
                reader
                    .seek(SeekFrom::Start(pos))
                    .map_err(|source| IoError::Io { path, source })?;
            }
        }
        self.pos = pos;
        Ok(())
    }

    pub fn close(&mut self) -> Result<(), IoError> {
        if self.source.take().is_none() {
            return Err(IoError::NotOpen {
                path: self.path.clone(),
            });
        }
        Ok(())
    }

    pub fn read_bytes(&mut self, buf: &mut [u8]) -> Result<(), IoError> {
        let path = &self.path;
        match self.source.as_mut() {
            None => {
                return Err(IoError::NotOpen { path: path.clone() });
            }
            Some(Source::Mapped(map)) => {
                let start = usize::try_from(self.pos).map_err(|_| IoError::UnexpectedEof {
                    path: path.clone(),
                })?;
                let end = start
                    .checked_add(buf.len())
                    .ok_or_else(|| IoError::UnexpectedEof { path: path.clone() })?;
                if end > map.len() {
                    return Err(IoError::UnexpectedEof { path: path.clone() });
                }
                buf.copy_from_slice(&map[start..end]);
            }
            Some(Source::Direct(reader)) => {
                reader.read_exact(buf).map_err(|source| {
                    if source.kind() == std::io::ErrorKind::UnexpectedEof {
                        IoError::UnexpectedEof { path: path.clone() }
                    } else {
                        IoError::Io {
                            path: path.clone(),
                            source,
                        }
                    }
                })?;
            }
        }
        self.pos += buf.len() as u64;
        Ok(())
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], IoError> {
        let mut buf = [0u8; N];
        self.read_bytes(&mut buf)?;
        Ok(buf)
    }

    pub fn read_u8(&mut self) -> Result<u8, IoError> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, IoError> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, IoError> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64, IoError> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    pub fn read_i8(&mut self) -> Result<i8, IoError> {
        Ok(i8::from_le_bytes(self.read_array()?))
    }

    pub fn read_i16(&mut self) -> Result<i16, IoError> {
        Ok(i16::from_le_bytes(self.read_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32, IoError> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64, IoError> {
        Ok(i64::from_le_bytes(self.read_array()?))
    }

    pub fn read_bool(&mut self) -> Result<bool, IoError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_f64(&mut self) -> Result<f64, IoError> {
        Ok(f64::from_le_bytes(self.read_array()?))
    }

    /// Reads an unsigned base-128 varint.
    pub fn read_number(&mut self) -> Result<u64, IoError> {
        let mut value = 0u64;
        let mut shift = 0u32;

        loop {
            let byte = self.read_u8()?;

            if shift > 63 || (shift == 63 && (byte & 0x7e) != 0) {
                return Err(IoError::NumberOverflow {
                    path: self.path.clone(),
                });
            }

            value |= u64::from(byte & 0x7f) << shift;

            if byte & 0x80 == 0 {
                return Ok(value);
            }

            shift += 7;
        }
    }

    /// Reads a zigzag-encoded signed varint.
    pub fn read_signed_number(&mut self) -> Result<i64, IoError> {
        Ok(zigzag_decode(self.read_number()?))
    }

    /// Reads a varint-length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String, IoError> {
        let len = self.read_number()?;
        if self.pos.checked_add(len).is_none_or(|end| end > self.size) {
            return Err(IoError::UnexpectedEof {
                path: self.path.clone(),
            });
        }

        let mut buf = vec![0u8; len as usize];
        self.read_bytes(&mut buf)?;
        String::from_utf8(buf).map_err(|_| IoError::InvalidString {
            path: self.path.clone(),
        })
    }

    /// Reads a packed 8-byte `(lon, lat)` coordinate record.
    pub fn read_coord(&mut self) -> Result<GeoCoord, IoError> {
        let lon = self.read_u32()?;
        let lat = self.read_u32()?;
        Ok(GeoCoord::from_packed(lon, lat))
    }

    pub fn read_file_offset(&mut self) -> Result<FileOffset, IoError> {
        self.read_u64()
    }

    /// Reads a file offset compressed to `bytes` little-endian bytes, as
    /// declared by the surrounding index structure.
    pub fn read_sized_file_offset(&mut self, bytes: u8) -> Result<FileOffset, IoError> {
        debug_assert!((1..=8).contains(&bytes));

        let mut buf = [0u8; 8];
        self.read_bytes(&mut buf[..bytes as usize])?;
        Ok(u64::from_le_bytes(buf))
    }
}
