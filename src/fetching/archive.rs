//! Unpacking of zipped repositories

use std::fs::File;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::error::{FetchError, Result};

/// Extract `archive` into `dest` and return the directory holding the repository.
///
/// Archives either contain the repository at their root or wrapped in a single
/// top-level directory (as produced by zipping a checkout).
pub fn unpack_repository(archive: &Path, dest: &Path) -> Result<PathBuf> {
    debug!("Unpacking {:?} into {:?}", archive, dest);

    let file = File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file)?;
    zip.extract(dest)?;

    if looks_like_repository(dest) {
        return Ok(dest.to_path_buf());
    }

    let mut dirs = std::fs::read_dir(dest)?
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_dir());

    match (dirs.next(), dirs.next()) {
        (Some(single), None) if looks_like_repository(&single) => Ok(single),
        _ => Err(FetchError::invalid_uri(
            archive.display().to_string(),
            "archive does not contain a git repository",
        )),
    }
}

fn looks_like_repository(path: &Path) -> bool {
    path.join(".git").exists() || (path.join("HEAD").is_file() && path.join("objects").is_dir())
}
