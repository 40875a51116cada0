//! Fixed-layout records of the container format. All fields little-endian.

use std::io::{self, Write};

pub const LOCAL_HEADER_SIGNATURE: u32 = 0x0403_4b50;
pub const CENTRAL_HEADER_SIGNATURE: u32 = 0x0201_4b50;
pub const END_OF_CENTRAL_DIR_SIGNATURE: u32 = 0x0605_4b50;

pub const LOCAL_HEADER_LEN: usize = 30;
pub const CENTRAL_HEADER_LEN: usize = 46;
pub const END_OF_CENTRAL_DIR_LEN: usize = 22;

/// "2.0": the lowest version that understands stored entries with UTF-8 names.
pub const VERSION: u16 = 20;
pub const METHOD_STORE: u16 = 0;
/// General-purpose bit 11: names are UTF-8.
pub const FLAG_UTF8: u16 = 0x0800;
pub const FLAG_ENCRYPTED: u16 = 0x0001;
pub const FLAG_DATA_DESCRIPTOR: u16 = 0x0008;

/// Upper bound on a trailing comment, hence on how far back the
/// end-of-central-directory record can sit.
pub const MAX_COMMENT_LEN: usize = u16::MAX as usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalHeader {
    pub flags: u16,
    pub method: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub name_len: u16,
    pub extra_len: u16,
}

impl LocalHeader {
    pub fn stored(crc32: u32, size: u32, name_len: u16) -> Self {
        Self {
            flags: FLAG_UTF8,
            method: METHOD_STORE,
            crc32,
            compressed_size: size,
            uncompressed_size: size,
            name_len,
            extra_len: 0,
        }
    }

    pub fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        let mut b = [0u8; LOCAL_HEADER_LEN];
        put_u32(&mut b, 0, LOCAL_HEADER_SIGNATURE);
        put_u16(&mut b, 4, VERSION);
        put_u16(&mut b, 6, self.flags);
        put_u16(&mut b, 8, self.method);
        // 10..14: modification time and date, left zero
        put_u32(&mut b, 14, self.crc32);
        put_u32(&mut b, 18, self.compressed_size);
        put_u32(&mut b, 22, self.uncompressed_size);
        put_u16(&mut b, 26, self.name_len);
        put_u16(&mut b, 28, self.extra_len);
        out.write_all(&b)
    }

    /// Returns `None` when the signature does not match.
    pub fn parse(b: &[u8; LOCAL_HEADER_LEN]) -> Option<Self> {
        if get_u32(b, 0) != LOCAL_HEADER_SIGNATURE {
            return None;
        }
        Some(Self {
            flags: get_u16(b, 6),
            method: get_u16(b, 8),
            crc32: get_u32(b, 14),
            compressed_size: get_u32(b, 18),
            uncompressed_size: get_u32(b, 22),
            name_len: get_u16(b, 26),
            extra_len: get_u16(b, 28),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CentralHeader {
    pub flags: u16,
    pub method: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub name_len: u16,
    pub extra_len: u16,
    pub comment_len: u16,
    pub local_header_offset: u32,
}

impl CentralHeader {
    pub fn stored(crc32: u32, size: u32, name_len: u16, local_header_offset: u32) -> Self {
        Self {
            flags: FLAG_UTF8,
            method: METHOD_STORE,
            crc32,
            compressed_size: size,
            uncompressed_size: size,
            name_len,
            extra_len: 0,
            comment_len: 0,
            local_header_offset,
        }
    }

    pub fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        let mut b = [0u8; CENTRAL_HEADER_LEN];
        put_u32(&mut b, 0, CENTRAL_HEADER_SIGNATURE);
        put_u16(&mut b, 4, VERSION); // made by: MS-DOS attributes, 2.0
        put_u16(&mut b, 6, VERSION);
        put_u16(&mut b, 8, self.flags);
        put_u16(&mut b, 10, self.method);
        put_u32(&mut b, 16, self.crc32);
        put_u32(&mut b, 20, self.compressed_size);
        put_u32(&mut b, 24, self.uncompressed_size);
        put_u16(&mut b, 28, self.name_len);
        put_u16(&mut b, 30, self.extra_len);
        put_u16(&mut b, 32, self.comment_len);
        // 34..42: disk number start, internal and external attributes
        put_u32(&mut b, 42, self.local_header_offset);
        out.write_all(&b)
    }

    pub fn parse(b: &[u8; CENTRAL_HEADER_LEN]) -> Option<Self> {
        if get_u32(b, 0) != CENTRAL_HEADER_SIGNATURE {
            return None;
        }
        Some(Self {
            flags: get_u16(b, 8),
            method: get_u16(b, 10),
            crc32: get_u32(b, 16),
            compressed_size: get_u32(b, 20),
            uncompressed_size: get_u32(b, 24),
            name_len: get_u16(b, 28),
            extra_len: get_u16(b, 30),
            comment_len: get_u16(b, 32),
            local_header_offset: get_u32(b, 42),
        })
    }

    /// Number of bytes this record occupies in the central directory.
    pub fn record_len(&self) -> u64 {
        CENTRAL_HEADER_LEN as u64
            + self.name_len as u64
            + self.extra_len as u64
            + self.comment_len as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndOfCentralDir {
    pub disk_entries: u16,
    pub total_entries: u16,
    pub central_dir_size: u32,
    pub central_dir_offset: u32,
    pub comment_len: u16,
}

impl EndOfCentralDir {
    pub fn new(entries: u16, central_dir_size: u32, central_dir_offset: u32) -> Self {
        Self {
            disk_entries: entries,
            total_entries: entries,
            central_dir_size,
            central_dir_offset,
            comment_len: 0,
        }
    }

    pub fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        let mut b = [0u8; END_OF_CENTRAL_DIR_LEN];
        put_u32(&mut b, 0, END_OF_CENTRAL_DIR_SIGNATURE);
        // 4..8: this disk, disk holding the central directory
        put_u16(&mut b, 8, self.disk_entries);
        put_u16(&mut b, 10, self.total_entries);
        put_u32(&mut b, 12, self.central_dir_size);
        put_u32(&mut b, 16, self.central_dir_offset);
        put_u16(&mut b, 20, self.comment_len);
        out.write_all(&b)
    }

    pub fn parse(b: &[u8]) -> Option<Self> {
        if b.len() < END_OF_CENTRAL_DIR_LEN || get_u32(b, 0) != END_OF_CENTRAL_DIR_SIGNATURE {
            return None;
        }
        Some(Self {
            disk_entries: get_u16(b, 8),
            total_entries: get_u16(b, 10),
            central_dir_size: get_u32(b, 12),
            central_dir_offset: get_u32(b, 16),
            comment_len: get_u16(b, 20),
        })
    }
}

/// Offset of the last complete end-of-central-directory record in `tail`.
///
/// Scanning from the back keeps the reader working when a tool appended a
/// comment or other trailing bytes after the record.
pub fn find_end_of_central_dir(tail: &[u8]) -> Option<usize> {
    if tail.len() < END_OF_CENTRAL_DIR_LEN {
        return None;
    }
    let sig = END_OF_CENTRAL_DIR_SIGNATURE.to_le_bytes();
    (0..=tail.len() - END_OF_CENTRAL_DIR_LEN)
        .rev()
        .find(|&i| tail[i..i + 4] == sig)
}

fn put_u16(b: &mut [u8], at: usize, v: u16) {
    b[at..at + 2].copy_from_slice(&v.to_le_bytes());
}

fn put_u32(b: &mut [u8], at: usize, v: u32) {
    b[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

fn get_u16(b: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([b[at], b[at + 1]])
}

fn get_u32(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_header_layout() {
        let mut out = Vec::new();
        LocalHeader::stored(0xDEAD_BEEF, 120_000, 5)
            .write_to(&mut out)
            .unwrap();

        assert_eq!(out.len(), LOCAL_HEADER_LEN);
        assert_eq!(&out[0..4], b"PK\x03\x04");
        assert_eq!(&out[8..10], &[0, 0]); // stored
        assert_eq!(&out[14..18], &0xDEAD_BEEFu32.to_le_bytes());
        assert_eq!(&out[18..22], &120_000u32.to_le_bytes());
        assert_eq!(&out[22..26], &120_000u32.to_le_bytes());
        assert_eq!(&out[26..28], &5u16.to_le_bytes());
        assert_eq!(&out[28..30], &[0, 0]);
    }

    #[test]
    fn test_central_header_parse_reads_offset() {
        let mut out = Vec::new();
        CentralHeader::stored(7, 98_000, 5, 120_035)
            .write_to(&mut out)
            .unwrap();
        assert_eq!(out.len(), CENTRAL_HEADER_LEN);
        assert_eq!(&out[0..4], b"PK\x01\x02");

        let arr: [u8; CENTRAL_HEADER_LEN] = out.try_into().unwrap();
        let parsed = CentralHeader::parse(&arr).unwrap();
        assert_eq!(parsed.local_header_offset, 120_035);
        assert_eq!(parsed.uncompressed_size, 98_000);
        assert_eq!(parsed.record_len(), 51);
    }

    #[test]
    fn test_find_end_record_prefers_last_complete_one() {
        let mut out = Vec::new();
        EndOfCentralDir::new(1, 10, 20).write_to(&mut out).unwrap();
        EndOfCentralDir::new(2, 30, 40).write_to(&mut out).unwrap();
        // a dangling signature without a full record behind it
        out.extend_from_slice(&END_OF_CENTRAL_DIR_SIGNATURE.to_le_bytes());

        let at = find_end_of_central_dir(&out).unwrap();
        assert_eq!(at, END_OF_CENTRAL_DIR_LEN);
        let eocd = EndOfCentralDir::parse(&out[at..]).unwrap();
        assert_eq!(eocd.total_entries, 2);
    }

    #[test]
    fn test_find_end_record_rejects_short_tail() {
        assert_eq!(find_end_of_central_dir(b"PK\x05\x06"), None);
    }
}
