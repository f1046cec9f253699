//! Snapshot archives: a tar stream compressed with zstd.
//!
//! Everything here is blocking I/O; callers run it on the blocking pool.

use crate::model::snapshot::MANIFEST_FILE_NAME;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// zstd level used for new archives
const COMPRESSION_LEVEL: i32 = 3;

/// Largest manifest `read_manifest` will load.
pub const MAX_MANIFEST_BYTES: u64 = 64 * 1024 * 1024;

/// A regular file below a snapshot root
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    pub path: PathBuf,

    /// Relative to the snapshot root
    pub relative_path: PathBuf,

    pub size: u64,
}

/// Every regular file below `root`, in file-name order.
///
/// Symlinks are not followed; snapshots never contain them.
pub fn snapshot_files(root: &Path) -> io::Result<Vec<SnapshotFile>> {
    let mut files = Vec::new();

    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path().to_path_buf();
        let relative_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
        files.push(SnapshotFile {
            size: entry.metadata()?.len(),
            path,
            relative_path,
        });
    }

    Ok(files)
}

/// Pack `dir` into a zstd-compressed tar at `archive`.
///
/// Returns the number of files written. On failure the partially written
/// archive is left for the caller to remove.
pub fn compress_dir(dir: &Path, archive: &Path) -> io::Result<usize> {
    let files = snapshot_files(dir)?;

    let writer = BufWriter::new(File::create(archive)?);
    let encoder = zstd::Encoder::new(writer, COMPRESSION_LEVEL)?;
    let mut builder = tar::Builder::new(encoder);

    for file in &files {
        builder.append_path_with_name(&file.path, &file.relative_path)?;
    }

    let encoder = builder.into_inner()?;
    let mut writer = encoder.finish()?;
    io::Write::flush(&mut writer)?;

    Ok(files.len())
}

/// Unpack an archive produced by `compress_dir` into `dest`.
pub fn extract(archive: &Path, dest: &Path) -> io::Result<()> {
    let decoder = zstd::Decoder::new(BufReader::new(File::open(archive)?))?;
    tar::Archive::new(decoder).unpack(dest)
}

/// Read the manifest out of an archive without unpacking anything else.
pub fn read_manifest(archive: &Path) -> io::Result<Vec<u8>> {
    let decoder = zstd::Decoder::new(BufReader::new(File::open(archive)?))?;
    let mut tar = tar::Archive::new(decoder);

    for entry in tar.entries()? {
        let mut entry = entry?;
        if entry.path()?.as_ref() == Path::new(MANIFEST_FILE_NAME) {
            if entry.size() > MAX_MANIFEST_BYTES {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "{} in {} claims {} bytes",
                        MANIFEST_FILE_NAME,
                        archive.display(),
                        entry.size()
                    ),
                ));
            }
            let mut content = Vec::new();
            entry.take(MAX_MANIFEST_BYTES).read_to_end(&mut content)?;
            return Ok(content);
        }
    }

    Err(io::Error::new(
        io::ErrorKind::NotFound,
        format!("{} has no {}", archive.display(), MANIFEST_FILE_NAME),
    ))
}
