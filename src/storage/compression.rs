//! Segment compression
//!
//! Rotated segments are stored as single-member zip archives. The one entry
//! carries the segment's uncompressed file name, so a compressed segment can
//! be expanded with any zip tool.
//!
//! Reads never expand in place: the entry is copied to a scratch file that is
//! removed when the returned handle is dropped.

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::segment::COMPRESSED_SUFFIX;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Path of the compressed copy of `path`
pub fn compressed_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(COMPRESSED_SUFFIX);
    PathBuf::from(name)
}

fn entry_name(path: &Path) -> StorageResult<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| StorageError::Compression(format!("no file name in {:?}", path)))
}

/// Write `path` into a new single-entry zip next to it
///
/// The original is left untouched. A partially written archive is removed
/// on failure.
pub fn compress_file(path: &Path) -> StorageResult<PathBuf> {
    let target = compressed_path(path);
    let result = write_archive(path, &target);
    if result.is_err() {
        let _ = std::fs::remove_file(&target);
    }
    result.map(|_| target)
}

fn write_archive(source: &Path, target: &Path) -> StorageResult<()> {
    let name = entry_name(source)?;
    let mut input = BufReader::new(File::open(source)?);

    let mut zip = ZipWriter::new(File::create(target)?);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    zip.start_file(name, options)?;
    std::io::copy(&mut input, &mut zip)?;

    let file = zip.finish()?;
    file.sync_all()?;
    Ok(())
}

/// Compress a segment and remove the original
///
/// If the original cannot be removed the compressed copy is deleted instead,
/// so the same records never exist twice.
pub fn compress_in_place(path: &Path) -> StorageResult<PathBuf> {
    compress_replacing(path, |original| std::fs::remove_file(original))
}

fn compress_replacing<F>(path: &Path, remove_original: F) -> StorageResult<PathBuf>
where
    F: FnOnce(&Path) -> std::io::Result<()>,
{
    let target = compress_file(path)?;

    if let Err(e) = remove_original(path) {
        tracing::warn!(
            "Could not remove {:?} after compressing it, discarding the archive copy: {}",
            path,
            e
        );
        std::fs::remove_file(&target)?;
        return Err(e.into());
    }
    Ok(target)
}

/// Copy the single entry of a compressed segment into `writer`
pub fn expand_into<W: Write>(zip_path: &Path, writer: &mut W) -> StorageResult<u64> {
    let mut archive = ZipArchive::new(BufReader::new(File::open(zip_path)?))?;
    if archive.is_empty() {
        return Err(StorageError::Compression(format!("{:?} is empty", zip_path)));
    }

    // Prefer the entry named after the segment, fall back to the first one
    let expected = zip_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .and_then(|n| n.strip_suffix(COMPRESSED_SUFFIX).map(str::to_string));
    let index = expected
        .and_then(|name| archive.index_for_name(&name))
        .unwrap_or(0);

    let mut entry = archive.by_index(index)?;
    let copied = std::io::copy(&mut entry, writer)?;
    Ok(copied)
}

/// Expand a compressed segment into a scratch file under `temp_dir`
pub fn decompress_to_scratch(zip_path: &Path, temp_dir: &Path) -> StorageResult<NamedTempFile> {
    std::fs::create_dir_all(temp_dir)?;
    let scratch = NamedTempFile::new_in(temp_dir)?;
    {
        let mut writer = BufWriter::new(scratch.as_file());
        expand_into(zip_path, &mut writer)?;
        writer.flush()?;
    }
    Ok(scratch)
}

/// Expand a compressed segment next to itself and remove the archive
pub fn decompress_in_place(zip_path: &Path) -> StorageResult<PathBuf> {
    let name = zip_path.to_string_lossy();
    let target = name
        .strip_suffix(COMPRESSED_SUFFIX)
        .map(PathBuf::from)
        .ok_or_else(|| StorageError::Compression(format!("{:?} is not compressed", zip_path)))?;

    {
        let mut writer = BufWriter::new(File::create(&target)?);
        if let Err(e) = expand_into(zip_path, &mut writer) {
            drop(writer);
            let _ = std::fs::remove_file(&target);
            return Err(e);
        }
        writer.flush()?;
    }
    std::fs::remove_file(zip_path)?;
    Ok(target)
}
