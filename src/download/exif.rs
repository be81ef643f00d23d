//! EXIF timestamp injection for published JPEGs.
//!
//! Failures surface as [`SyncError::Filesystem`] so the reconciliation
//! engine treats them like any other per-asset filesystem fault: log,
//! skip, continue the pass.

use std::path::Path;

use crate::error::{SyncError, SyncResult};

/// Read the `DateTimeOriginal` tag from an image file.
///
/// `Ok(Some(value))` when the tag is present, `Ok(None)` when the file has
/// no EXIF data or no such tag (common for service-generated renditions),
/// `Err` only when the file itself cannot be read.
pub fn get_photo_exif(path: &Path) -> SyncResult<Option<String>> {
    let file = std::fs::File::open(path).map_err(|e| SyncError::fs(path, e))?;
    let mut bufreader = std::io::BufReader::new(&file);

    match exif::Reader::new().read_from_container(&mut bufreader) {
        Ok(exif_data) => Ok(exif_data
            .get_field(exif::Tag::DateTimeOriginal, exif::In::PRIMARY)
            .map(|field| field.display_value().to_string())),
        Err(e) => {
            tracing::debug!("No EXIF data in {}: {}", path.display(), e);
            Ok(None)
        }
    }
}

/// Write `DateTimeOriginal` into a JPEG, in `"YYYY:MM:DD HH:MM:SS"` form.
///
/// Only called for files that carry no timestamp of their own; the caller
/// re-stamps the mtime afterwards because this rewrites the file.
pub fn set_photo_exif(path: &Path, datetime_str: &str) -> SyncResult<()> {
    use little_exif::exif_tag::ExifTag;
    use little_exif::metadata::Metadata;

    let mut metadata = Metadata::new_from_path(path).map_err(|e| SyncError::fs(path, e))?;
    metadata.set_tag(ExifTag::DateTimeOriginal(datetime_str.to_string()));
    metadata
        .write_to_file(path)
        .map_err(|e| SyncError::fs(path, e))?;

    tracing::debug!(
        "Set EXIF DateTimeOriginal={} on {}",
        datetime_str,
        path.display()
    );
    Ok(())
}
