use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use tempfile::NamedTempFile;

use crate::crc::Crc32;
use crate::format::{
    find_end_of_central_dir, CentralHeader, EndOfCentralDir, LocalHeader, CENTRAL_HEADER_LEN,
    END_OF_CENTRAL_DIR_LEN, FLAG_DATA_DESCRIPTOR, FLAG_ENCRYPTED, LOCAL_HEADER_LEN,
    MAX_COMMENT_LEN, METHOD_STORE,
};
use crate::{ArchiveError, Entry, ReadReport, Result, SkipReason, SkippedEntry, CHUNK_SIZE};

/// A central directory record together with its raw name.
struct CentralRecord {
    header: CentralHeader,
    raw_name: Vec<u8>,
}

impl CentralRecord {
    fn display_name(&self) -> String {
        String::from_utf8_lossy(&self.raw_name).into_owned()
    }
}

/// Per-entry failure: either the entry is left out, or extraction as a whole
/// cannot go on.
enum EntryError {
    Skip(SkipReason),
    Fatal(ArchiveError),
}

impl From<SkipReason> for EntryError {
    fn from(reason: SkipReason) -> Self {
        EntryError::Skip(reason)
    }
}

/// Extract every entry of the container at `input` into `dest`.
///
/// Entries that fail validation are reported in [`ReadReport::skipped`] and
/// never touch `dest`; the rest still extract. Only an unreadable end record
/// or central directory, or an I/O failure on the destination side, fail the
/// whole call.
pub fn read_archive(input: &Path, dest: &Path) -> Result<ReadReport> {
    let mut file = File::open(input)?;
    let len = file.metadata()?.len();

    let (eocd, eocd_pos) = locate_end_record(&mut file, len)?;
    let records = read_central_directory(&mut file, &eocd, eocd_pos)?;
    tracing::debug!(
        "Container {} lists {} entries",
        input.display(),
        records.len()
    );

    fs::create_dir_all(dest)?;
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut report = ReadReport::default();

    for record in &records {
        match extract_entry(&mut file, record, dest, &mut buf) {
            Ok(entry) => report.extracted.push(entry),
            Err(EntryError::Skip(reason)) => {
                let name = record.display_name();
                tracing::warn!("Skipping entry {:?}: {}", name, reason);
                report.skipped.push(SkippedEntry { name, reason });
            }
            Err(EntryError::Fatal(e)) => return Err(e),
        }
    }

    tracing::info!("Read {}: {}", input.display(), report.summary());
    Ok(report)
}

fn locate_end_record(file: &mut File, len: u64) -> Result<(EndOfCentralDir, u64)> {
    if len < END_OF_CENTRAL_DIR_LEN as u64 {
        return Err(ArchiveError::Format(
            "too short to hold an end of central directory record".into(),
        ));
    }

    let tail_len = len.min((END_OF_CENTRAL_DIR_LEN + MAX_COMMENT_LEN) as u64);
    let tail_start = len - tail_len;
    let mut tail = vec![0u8; tail_len as usize];
    file.seek(SeekFrom::Start(tail_start))?;
    file.read_exact(&mut tail)?;

    let at = find_end_of_central_dir(&tail).ok_or_else(|| {
        ArchiveError::Format("end of central directory record not found".into())
    })?;
    let eocd = EndOfCentralDir::parse(&tail[at..])
        .ok_or_else(|| ArchiveError::Format("unreadable end of central directory".into()))?;
    let eocd_pos = tail_start + at as u64;

    if eocd.disk_entries != eocd.total_entries {
        return Err(ArchiveError::Format("multi-disk containers are not supported".into()));
    }
    if eocd.central_dir_offset == u32::MAX || eocd.central_dir_size == u32::MAX {
        return Err(ArchiveError::Format("zip64 containers are not supported".into()));
    }
    let cd_end = eocd.central_dir_offset as u64 + eocd.central_dir_size as u64;
    if cd_end > eocd_pos {
        return Err(ArchiveError::Format(format!(
            "central directory ({}..{}) overlaps the end record at {}",
            eocd.central_dir_offset, cd_end, eocd_pos
        )));
    }
    Ok((eocd, eocd_pos))
}

fn read_central_directory(
    file: &mut File,
    eocd: &EndOfCentralDir,
    eocd_pos: u64,
) -> Result<Vec<CentralRecord>> {
    file.seek(SeekFrom::Start(eocd.central_dir_offset as u64))?;
    let mut r = BufReader::with_capacity(CHUNK_SIZE, &mut *file).take(eocd.central_dir_size as u64);

    let mut records = Vec::with_capacity(eocd.total_entries as usize);
    let mut consumed = 0u64;
    for i in 0..eocd.total_entries {
        let mut fixed = [0u8; CENTRAL_HEADER_LEN];
        read_exact_or_format(&mut r, &mut fixed, "central directory record")?;
        let header = CentralHeader::parse(&fixed).ok_or_else(|| {
            ArchiveError::Format(format!("bad signature on central directory record {}", i))
        })?;

        let mut raw_name = vec![0u8; header.name_len as usize];
        read_exact_or_format(&mut r, &mut raw_name, "central directory name")?;
        let trailing = header.extra_len as u64 + header.comment_len as u64;
        let skipped = io::copy(&mut (&mut r).take(trailing), &mut io::sink())?;
        if skipped != trailing {
            return Err(ArchiveError::Format("central directory truncated".into()));
        }

        consumed += header.record_len();
        if header.local_header_offset as u64 >= eocd_pos {
            return Err(ArchiveError::Format(format!(
                "entry {} points past the end of the container",
                i
            )));
        }
        records.push(CentralRecord { header, raw_name });
    }

    if consumed != eocd.central_dir_size as u64 {
        return Err(ArchiveError::Format(format!(
            "central directory holds {} bytes, end record declares {}",
            consumed, eocd.central_dir_size
        )));
    }
    Ok(records)
}

fn read_exact_or_format<R: Read>(r: &mut R, buf: &mut [u8], what: &str) -> Result<()> {
    r.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => ArchiveError::Format(format!("{} truncated", what)),
        _ => ArchiveError::Io(e),
    })
}

/// Check an entry name is a plain file name that stays inside the
/// destination directory.
fn validate_name(raw: &[u8]) -> std::result::Result<&str, SkipReason> {
    let name = std::str::from_utf8(raw)
        .map_err(|_| SkipReason::Unsupported("non UTF-8 entry name".into()))?;
    if name.is_empty() {
        return Err(SkipReason::EmptyName);
    }
    if name.contains('\0')
        || name.starts_with('/')
        || name.starts_with('\\')
        || name.split(|c: char| c == '/' || c == '\\').any(|part| part == "..")
        || name == "."
    {
        return Err(SkipReason::UnsafeName);
    }
    if name.contains('/') || name.contains('\\') {
        return Err(SkipReason::NotAFile);
    }
    Ok(name)
}

fn extract_entry(
    file: &mut File,
    record: &CentralRecord,
    dest: &Path,
    buf: &mut [u8],
) -> std::result::Result<Entry, EntryError> {
    let h = &record.header;
    let name = validate_name(&record.raw_name)?;

    if h.flags & FLAG_ENCRYPTED != 0 {
        return Err(SkipReason::Unsupported("encrypted entry".into()).into());
    }
    if h.method != METHOD_STORE {
        return Err(SkipReason::Unsupported(format!("compression method {}", h.method)).into());
    }
    if h.uncompressed_size == u32::MAX || h.local_header_offset == u32::MAX {
        return Err(SkipReason::Unsupported("zip64 entry".into()).into());
    }
    if h.compressed_size != h.uncompressed_size {
        return Err(SkipReason::HeaderMismatch("stored entry sizes differ".into()).into());
    }

    let data_start = check_local_header(file, record)?;
    file.seek(SeekFrom::Start(data_start))
        .map_err(|e| EntryError::Fatal(e.into()))?;

    let tmp = NamedTempFile::new_in(dest).map_err(|e| EntryError::Fatal(e.into()))?;
    let crc = {
        let mut out = BufWriter::with_capacity(CHUNK_SIZE, tmp.as_file());
        let crc = stream_data(file, &mut out, h.uncompressed_size as u64, buf)?;
        out.flush().map_err(|e| EntryError::Fatal(e.into()))?;
        crc
    };

    if crc != h.crc32 {
        return Err(SkipReason::ChecksumMismatch {
            expected: h.crc32,
            actual: crc,
        }
        .into());
    }

    tmp.persist(dest.join(name))
        .map_err(|e| EntryError::Fatal(e.error.into()))?;

    Ok(Entry {
        name: name.to_string(),
        uncompressed_size: h.uncompressed_size as u64,
        crc32: h.crc32,
        local_header_offset: h.local_header_offset,
    })
}

/// Re-validate the local header against the central record and return the
/// offset where the entry's data starts.
fn check_local_header(file: &mut File, record: &CentralRecord) -> std::result::Result<u64, EntryError> {
    let h = &record.header;
    file.seek(SeekFrom::Start(h.local_header_offset as u64))
        .map_err(|e| EntryError::Fatal(e.into()))?;

    let mut fixed = [0u8; LOCAL_HEADER_LEN];
    read_entry_bytes(file, &mut fixed)?;
    let local = LocalHeader::parse(&fixed)
        .ok_or_else(|| SkipReason::HeaderMismatch("bad local header signature".into()))?;

    let mut local_name = vec![0u8; local.name_len as usize];
    read_entry_bytes(file, &mut local_name)?;
    if local_name != record.raw_name {
        return Err(SkipReason::HeaderMismatch("name differs from central directory".into()).into());
    }
    if local.method != h.method {
        return Err(SkipReason::HeaderMismatch("compression method differs".into()).into());
    }
    // With a data descriptor the local sizes and CRC are zero placeholders.
    if local.flags & FLAG_DATA_DESCRIPTOR == 0 {
        if local.crc32 != h.crc32 {
            return Err(SkipReason::HeaderMismatch("checksum differs".into()).into());
        }
        // Streaming writers put zip64 sentinels here and the real sizes in
        // the central record only.
        let zip64_sizes =
            local.uncompressed_size == u32::MAX || local.compressed_size == u32::MAX;
        if !zip64_sizes
            && (local.uncompressed_size != h.uncompressed_size
                || local.compressed_size != h.compressed_size)
        {
            return Err(SkipReason::HeaderMismatch("size differs".into()).into());
        }
    }

    Ok(h.local_header_offset as u64
        + LOCAL_HEADER_LEN as u64
        + local.name_len as u64
        + local.extra_len as u64)
}

fn read_entry_bytes(file: &mut File, buf: &mut [u8]) -> std::result::Result<(), EntryError> {
    file.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => EntryError::Skip(SkipReason::Truncated),
        _ => EntryError::Fatal(e.into()),
    })
}

fn stream_data<W: Write>(
    file: &mut File,
    out: &mut W,
    size: u64,
    buf: &mut [u8],
) -> std::result::Result<u32, EntryError> {
    let mut crc = Crc32::new();
    let mut remaining = size;
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = file
            .read(&mut buf[..want])
            .map_err(|e| EntryError::Fatal(e.into()))?;
        if n == 0 {
            return Err(SkipReason::Truncated.into());
        }
        crc.update(&buf[..n]);
        out.write_all(&buf[..n])
            .map_err(|e| EntryError::Fatal(e.into()))?;
        remaining -= n as u64;
    }
    Ok(crc.finalize())
}
