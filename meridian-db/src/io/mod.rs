//! # Typed binary file layer
//!
//! A sequential/random [`FileScanner`] and a sequential [`FileWriter`] over
//! the database's numeric encodings:
//!
//! - unsigned varints: little-endian base-128, bit 7 of every byte is the
//!   continuation flag;
//! - signed varints: zigzag pre-encoding, then the unsigned varint;
//! - coordinates: two packed fixed-point `u32` values (lon, lat), 8 bytes;
//! - strings: varint length prefix followed by UTF-8 bytes, no terminator;
//! - file offsets: 8 bytes little-endian, or sized down by the surrounding
//!   structure's `data_offset_bytes` field.
//!
//! The encodings are bit-exact format contracts; see the test vectors below.

mod scanner;
mod writer;

pub use scanner::FileScanner;
pub use writer::FileWriter;

use std::path::PathBuf;
use thiserror::Error;

/// Hint describing the intended access pattern of a reader.
///
/// The scanner only uses this to pick buffer sizes; random modes keep the
/// read-ahead small so seek-heavy index traversal does not thrash.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AccessMode {
    Sequential,
    Random,
    LowMemRandom,
    FastRandom,
}

#[derive(Debug, Error)]
pub enum IoError {
    #[error("I/O error accessing '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("'{path}' is not open")]
    NotOpen { path: PathBuf },
    #[error("Read past the end of '{path}'")]
    UnexpectedEof { path: PathBuf },
    #[error("Variable-length number in '{path}' does not fit into 64 bits")]
    NumberOverflow { path: PathBuf },
    #[error("String data in '{path}' is not valid UTF-8")]
    InvalidString { path: PathBuf },
    #[error("Writer for '{path}' is poisoned by an earlier failure")]
    Poisoned { path: PathBuf },
    #[error("Value {value} does not fit into {bytes} offset bytes")]
    OffsetTooLarge { value: u64, bytes: u8 },
    #[error("Unexpected byte value {value} while reading {what} from '{path}'")]
    UnexpectedValue {
        path: PathBuf,
        what: &'static str,
        value: u64,
    },
}

/// The number of bytes the unsigned varint encoding of `value` occupies.
pub const fn varint_len(value: u64) -> usize {
    let mut value = value;
    let mut len = 1;
    while value > 0x7f {
        value >>= 7;
        len += 1;
    }
    len
}

/// Appends the unsigned varint encoding of `value` to an in-memory buffer;
/// used by index builders that lay out data regions before writing them.
pub fn append_varint(buf: &mut Vec<u8>, value: u64) {
    let mut value = value;
    while value > 0x7f {
        buf.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

/// The smallest number of plain little-endian bytes that can hold `value`;
/// used by index structures to choose their `data_offset_bytes`.
pub const fn bytes_needed_for_offset(value: u64) -> u8 {
    let mut value = value;
    let mut bytes = 1;
    while value > 0xff {
        value >>= 8;
        bytes += 1;
    }
    bytes
}

#[inline]
pub(crate) const fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

#[inline]
pub(crate) const fn zigzag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geom::GeoCoord;
    use proptest::{prop_assert_eq, proptest};

    fn roundtrip_file() -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("test.dat");
        (dir, path)
    }

    /// The canonical unsigned varint vectors. `2^63 - 1` carries 63
    /// significant bits and therefore needs exactly 9 base-128 bytes; only
    /// values of 64 significant bits (e.g. `u64::MAX`) need the tenth byte.
    #[test]
    fn varint_test_vectors() {
        let vectors: &[(u64, usize)] = &[
            (0, 1),
            (1, 1),
            (127, 1),
            (128, 2),
            (16_383, 2),
            (16_384, 3),
            (u64::from(u32::MAX), 5),
            ((1u64 << 63) - 1, 9),
            (u64::MAX, 10),
        ];

        let (_dir, path) = roundtrip_file();
        let mut writer = FileWriter::open(&path).expect("open writer");
        for (value, _) in vectors {
            writer.write_number(*value).expect("write");
        }
        writer.close().expect("close");

        let expected_size: usize = vectors.iter().map(|(_, len)| len).sum();
        assert_eq!(
            std::fs::metadata(&path).expect("metadata").len(),
            expected_size as u64
        );

        let mut scanner =
            FileScanner::open(&path, AccessMode::Sequential, false).expect("open scanner");
        for (value, len) in vectors {
            assert_eq!(varint_len(*value), *len);
            let before = scanner.pos();
            assert_eq!(scanner.read_number().expect("read"), *value);
            assert_eq!((scanner.pos() - before) as usize, *len);
        }
    }

    #[test]
    fn zigzag_vectors() {
        assert_eq!(zigzag_encode(0), 0);
        assert_eq!(zigzag_encode(-1), 1);
        assert_eq!(zigzag_encode(1), 2);
        assert_eq!(zigzag_encode(-2), 3);
        assert_eq!(zigzag_encode(i64::MAX), u64::MAX - 1);
        assert_eq!(zigzag_encode(i64::MIN), u64::MAX);
    }

    proptest! {
        #[test]
        fn varint_roundtrip_is_bijective(value: u64) {
            let (_dir, path) = roundtrip_file();
            let mut writer = FileWriter::open(&path).expect("open writer");
            writer.write_number(value).expect("write");
            writer.close().expect("close");

            let mut scanner =
                FileScanner::open(&path, AccessMode::Sequential, false).expect("open scanner");
            prop_assert_eq!(scanner.read_number().expect("read"), value);
        }

        #[test]
        fn signed_varint_roundtrip_is_bijective(value: i64) {
            prop_assert_eq!(zigzag_decode(zigzag_encode(value)), value);

            let (_dir, path) = roundtrip_file();
            let mut writer = FileWriter::open(&path).expect("open writer");
            writer.write_signed_number(value).expect("write");
            writer.close().expect("close");

            let mut scanner =
                FileScanner::open(&path, AccessMode::Sequential, false).expect("open scanner");
            prop_assert_eq!(scanner.read_signed_number().expect("read"), value);
        }
    }

    #[test]
    fn primitive_roundtrip_via_mmap_and_plain_reads() {
        let (_dir, path) = roundtrip_file();

        let coord = GeoCoord::new(51.5726, 7.1597);
        let mut writer = FileWriter::open(&path).expect("open writer");
        writer.write_u8(0xfe).unwrap();
        writer.write_u16(0xbeef).unwrap();
        writer.write_u32(0xdead_beef).unwrap();
        writer.write_u64(0x0123_4567_89ab_cdef).unwrap();
        writer.write_i8(-3).unwrap();
        writer.write_i32(-70_000).unwrap();
        writer.write_i64(i64::MIN).unwrap();
        writer.write_bool(true).unwrap();
        writer.write_f64(-12.75).unwrap();
        writer.write_string("Unter den Linden").unwrap();
        writer.write_coord(&coord).unwrap();
        writer.write_file_offset(0xffff_ffff_ff).unwrap();
        writer.write_sized_file_offset(300, 2).unwrap();
        writer.close().expect("close");

        for mmap in [false, true] {
            let mut scanner =
                FileScanner::open(&path, AccessMode::Random, mmap).expect("open scanner");
            assert_eq!(scanner.read_u8().unwrap(), 0xfe);
            assert_eq!(scanner.read_u16().unwrap(), 0xbeef);
            assert_eq!(scanner.read_u32().unwrap(), 0xdead_beef);
            assert_eq!(scanner.read_u64().unwrap(), 0x0123_4567_89ab_cdef);
            assert_eq!(scanner.read_i8().unwrap(), -3);
            assert_eq!(scanner.read_i32().unwrap(), -70_000);
            assert_eq!(scanner.read_i64().unwrap(), i64::MIN);
            assert!(scanner.read_bool().unwrap());
            assert_eq!(scanner.read_f64().unwrap(), -12.75);
            assert_eq!(scanner.read_string().unwrap(), "Unter den Linden");
            let restored = scanner.read_coord().unwrap();
            assert!((restored.lat() - coord.lat()).abs() < 1e-7);
            assert!((restored.lon() - coord.lon()).abs() < 1e-7);
            assert_eq!(scanner.read_file_offset().unwrap(), 0xffff_ffff_ff);
            assert_eq!(scanner.read_sized_file_offset(2).unwrap(), 300);
        }
    }

    #[test]
    fn set_pos_and_eof() {
        let (_dir, path) = roundtrip_file();
        let mut writer = FileWriter::open(&path).expect("open writer");
        writer.write_u32(7).unwrap();
        writer.write_u32(11).unwrap();
        writer.close().unwrap();

        let mut scanner =
            FileScanner::open(&path, AccessMode::FastRandom, true).expect("open scanner");
        scanner.set_pos(4).unwrap();
        assert_eq!(scanner.read_u32().unwrap(), 11);
        assert!(matches!(
            scanner.read_u32(),
            Err(IoError::UnexpectedEof { .. })
        ));

        scanner.set_pos(0).unwrap();
        assert_eq!(scanner.read_u32().unwrap(), 7);
    }

    #[test]
    fn writer_rejects_oversized_sized_offsets() {
        let (_dir, path) = roundtrip_file();
        let mut writer = FileWriter::open(&path).expect("open writer");
        assert!(matches!(
            writer.write_sized_file_offset(0x1_00_00, 2),
            Err(IoError::OffsetTooLarge { .. })
        ));
        // The failed range check must poison the writer.
        assert!(matches!(
            writer.write_u8(0),
            Err(IoError::Poisoned { .. })
        ));
    }

    #[test]
    fn offset_byte_sizing() {
        assert_eq!(bytes_needed_for_offset(0), 1);
        assert_eq!(bytes_needed_for_offset(255), 1);
        assert_eq!(bytes_needed_for_offset(256), 2);
        assert_eq!(bytes_needed_for_offset(u64::MAX), 8);
    }
}
