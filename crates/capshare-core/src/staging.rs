use archive::{read_archive, ReadReport};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::{TempDir, TempPath};

use crate::error::TransferError;

const CONTAINER_NAME: &str = "received.zip";
const EXTRACTED_DIR: &str = "extracted";

/// One received capture set, exclusively owned by the receiving session.
///
/// Dropping it removes the whole root recursively.
#[derive(Debug)]
pub struct StagingRoot {
    dir: TempDir,
    folder: PathBuf,
    report: ReadReport,
}

impl StagingRoot {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Directory holding the extracted files.
    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn report(&self) -> &ReadReport {
        &self.report
    }
}

/// Move a fully received container into a fresh staging root under `base`,
/// extract it, and delete the container.
///
/// Blocking; run it on a worker thread. On error nothing is left behind:
/// neither the container nor a partial root.
pub fn stage_container(container: TempPath, base: &Path) -> Result<StagingRoot, TransferError> {
    fs::create_dir_all(base)?;
    let dir = tempfile::Builder::new().prefix("staging-").tempdir_in(base)?;

    let target = dir.path().join(CONTAINER_NAME);
    if let Err(e) = container.persist(&target) {
        // rename fails across filesystems; fall back to a copy
        tracing::debug!("Rename into staging failed ({}), copying", e.error);
        fs::copy(&e.path, &target)?;
    }

    let folder = dir.path().join(EXTRACTED_DIR);
    fs::create_dir(&folder)?;
    let report = read_archive(&target, &folder)?;
    fs::remove_file(&target)?;

    tracing::info!(
        "Staged {} in {}: {}",
        CONTAINER_NAME,
        dir.path().display(),
        report.summary()
    );
    Ok(StagingRoot {
        dir,
        folder,
        report,
    })
}
