use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::crc::Crc32;
use crate::format::{CentralHeader, EndOfCentralDir, LocalHeader};
use crate::{ArchiveError, Entry, Result, CHUNK_SIZE};

/// A file selected for archiving, with the size and checksum learned in the
/// pre-pass.
struct Source {
    path: PathBuf,
    name: String,
    size: u64,
    crc32: u32,
}

/// Archive every regular, non-hidden file directly inside `source_dir` into
/// a store-only container at `output`.
///
/// The container is assembled in a temporary file next to `output` and only
/// renamed into place once complete, so a failed write leaves nothing behind.
pub fn write_archive(source_dir: &Path, output: &Path) -> Result<PathBuf> {
    let files = list_sources(source_dir)?;
    tracing::debug!(
        "Archiving {} file(s) from {}",
        files.len(),
        source_dir.display()
    );

    if files.len() > u16::MAX as usize {
        return Err(ArchiveError::TooLarge(format!(
            "{} files exceed the {} entry limit",
            files.len(),
            u16::MAX
        )));
    }

    let parent = match output.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let tmp = NamedTempFile::new_in(&parent)?;
    let mut buf = vec![0u8; CHUNK_SIZE];

    let entries = {
        let mut out = CountingWriter::new(BufWriter::with_capacity(CHUNK_SIZE, tmp.as_file()));
        let mut entries = Vec::with_capacity(files.len());

        for src in &files {
            let offset = checked_offset(out.position(), &src.name)?;
            let size = u32::try_from(src.size).map_err(|_| {
                ArchiveError::TooLarge(format!("{} is larger than 4 GiB", src.name))
            })?;

            LocalHeader::stored(src.crc32, size, src.name.len() as u16).write_to(&mut out)?;
            out.write_all(src.name.as_bytes())?;
            copy_contents(src, &mut out, &mut buf)?;

            entries.push(Entry {
                name: src.name.clone(),
                uncompressed_size: src.size,
                crc32: src.crc32,
                local_header_offset: offset,
            });
        }

        let cd_offset = checked_offset(out.position(), "central directory")?;
        for entry in &entries {
            CentralHeader::stored(
                entry.crc32,
                entry.uncompressed_size as u32,
                entry.name.len() as u16,
                entry.local_header_offset,
            )
            .write_to(&mut out)?;
            out.write_all(entry.name.as_bytes())?;
        }
        let cd_end = checked_offset(out.position(), "end of central directory")?;

        EndOfCentralDir::new(entries.len() as u16, cd_end - cd_offset, cd_offset)
            .write_to(&mut out)?;
        out.into_inner().into_inner().map_err(|e| e.into_error())?;
        entries
    };

    tmp.as_file().sync_all()?;
    tmp.persist(output).map_err(|e| ArchiveError::Io(e.error))?;

    tracing::info!(
        "Wrote container {} ({} entries)",
        output.display(),
        entries.len()
    );
    Ok(output.to_path_buf())
}

/// Regular files directly inside `dir`, in listing order, with their size and
/// CRC computed by streaming each one once.
fn list_sources(dir: &Path) -> Result<Vec<Source>> {
    let mut out = Vec::new();
    let mut buf = vec![0u8; CHUNK_SIZE];

    for dirent in fs::read_dir(dir)? {
        let dirent = dirent?;
        let path = dirent.path();

        let Some(name) = dirent.file_name().to_str().map(str::to_string) else {
            tracing::warn!("Skipping non UTF-8 file name: {:?}", dirent.file_name());
            continue;
        };
        if name.starts_with('.') || !path.is_file() {
            continue;
        }
        if name.len() > u16::MAX as usize {
            return Err(ArchiveError::TooLarge(format!("file name too long: {}", name)));
        }

        let (size, crc32) = checksum_file(&path, &mut buf)?;
        out.push(Source {
            path,
            name,
            size,
            crc32,
        });
    }
    Ok(out)
}

fn checksum_file(path: &Path, buf: &mut [u8]) -> io::Result<(u64, u32)> {
    let mut f = File::open(path)?;
    let mut crc = Crc32::new();
    let mut size = 0u64;
    loop {
        let n = f.read(buf)?;
        if n == 0 {
            break;
        }
        crc.update(&buf[..n]);
        size += n as u64;
    }
    Ok((size, crc.finalize()))
}

/// Stream a source file's bytes into the container, checking that it still
/// matches what the pre-pass recorded in the header.
fn copy_contents<W: Write>(src: &Source, out: &mut W, buf: &mut [u8]) -> Result<()> {
    let mut f = File::open(&src.path)?;
    let mut crc = Crc32::new();
    let mut written = 0u64;
    loop {
        let n = f.read(buf)?;
        if n == 0 {
            break;
        }
        written += n as u64;
        if written > src.size {
            break;
        }
        crc.update(&buf[..n]);
        out.write_all(&buf[..n])?;
    }

    if written != src.size || crc.finalize() != src.crc32 {
        return Err(ArchiveError::Io(io::Error::new(
            io::ErrorKind::Other,
            format!("{} changed while it was being archived", src.name),
        )));
    }
    Ok(())
}

fn checked_offset(pos: u64, what: &str) -> Result<u32> {
    u32::try_from(pos).map_err(|_| {
        ArchiveError::TooLarge(format!("{} starts beyond the 4 GiB offset limit", what))
    })
}

/// Tracks how many bytes went through so offsets can be recorded without
/// seeking.
struct CountingWriter<W> {
    inner: W,
    written: u64,
}

impl<W: Write> CountingWriter<W> {
    fn new(inner: W) -> Self {
        Self { inner, written: 0 }
    }

    fn position(&self) -> u64 {
        self.written
    }

    fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
