//! Zip export of the embedding cache directory

use crate::embedding_cache::TEMP_PREFIX;
use crate::error::{GatewayError, Result};
use std::fs::File;
use std::io::{Seek, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use zip::write::{FileOptions, ZipWriter};
use zip::CompressionMethod;

/// Archive every committed file under `dir` into `writer`
///
/// Paths inside the archive are relative to `dir` and use `/` separators.
/// In-flight temp files are skipped; files removed while the archive is
/// being built (eviction in another process) are skipped too.
///
/// # Returns
/// Number of files written to the archive
pub fn write_zip<W: Write + Seek>(dir: &Path, writer: W) -> Result<u64> {
    let files = collect_files(dir)?;
    let mut zip = ZipWriter::new(writer);
    let options = FileOptions::<()>::default().compression_method(CompressionMethod::Deflated);

    let mut written = 0;
    for path in files {
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Skipping vanished cache file {}", path.display());
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let name = archive_name(dir, &path)?;
        zip.start_file(name, options).map_err(zip_error)?;
        std::io::copy(&mut file, &mut zip)?;
        written += 1;
    }

    zip.finish().map_err(zip_error)?;
    info!("Archived {} cache files from {}", written, dir.display());
    Ok(written)
}

fn collect_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        for item in std::fs::read_dir(&current)? {
            let item = item?;
            let path = item.path();
            let file_type = item.file_type()?;
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() && !is_temp_file(&path) {
                files.push(path);
            }
        }
    }

    files.sort();
    Ok(files)
}

fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with(TEMP_PREFIX))
}

fn archive_name(root: &Path, path: &Path) -> Result<String> {
    let relative = path.strip_prefix(root).map_err(|_| {
        GatewayError::Internal(format!("{} is outside {}", path.display(), root.display()))
    })?;
    let parts: Vec<_> = relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect();
    Ok(parts.join("/"))
}

fn zip_error(err: zip::result::ZipError) -> GatewayError {
    GatewayError::Cache(format!("failed to build cache archive: {}", err))
}
