//! Raster storage backends.

mod geotiff;
#[cfg(feature = "gdal")]
mod gdal_backend;

pub use geotiff::GeoTiffBackend;
#[cfg(feature = "gdal")]
pub use gdal_backend::GdalBackend;

use crate::error::Result;
use crate::raster::{Raster, RasterMetadata};
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Read, write, and describe single-band rasters.
pub trait RasterBackend {
    /// Header only: size, georeferencing, pixel type and no-data.
    fn describe(&self, path: &Path) -> Result<RasterMetadata>;

    fn read(&self, path: &Path) -> Result<Raster>;

    /// Implementations must not leave a partially written file at `path`.
    fn write(&self, path: &Path, raster: &Raster) -> Result<()>;

    fn delete(&self, path: &Path) -> Result<()> {
        remove_file_if_exists(path)?;
        Ok(())
    }
}

impl<B: RasterBackend + ?Sized> RasterBackend for &B {
    fn describe(&self, path: &Path) -> Result<RasterMetadata> {
        (**self).describe(path)
    }

    fn read(&self, path: &Path) -> Result<Raster> {
        (**self).read(path)
    }

    fn write(&self, path: &Path, raster: &Raster) -> Result<()> {
        (**self).write(path, raster)
    }

    fn delete(&self, path: &Path) -> Result<()> {
        (**self).delete(path)
    }
}

pub fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Removing a directory that is already gone is not an error.
pub fn remove_dir_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Sibling path used while a file is being written.
pub(crate) fn partial_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_default();
    name.push(".partial");
    path.with_file_name(name)
}

/// Write `bytes` to a temporary sibling, sync it, and rename over `path`.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = partial_path(path);
    {
        let mut file = fs::File::create(&tmp)?;
        io::Write::write_all(&mut file, bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remove_dir_twice_is_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("group_01_scratch");
        fs::create_dir_all(dir.join("nested")).unwrap();
        fs::write(dir.join("nested/a.tif"), b"x").unwrap();

        remove_dir_if_exists(&dir).unwrap();
        assert!(!dir.exists());
        remove_dir_if_exists(&dir).unwrap();
    }

    #[test]
    fn test_remove_missing_file_is_noop() {
        let tmp = tempfile::tempdir().unwrap();
        remove_file_if_exists(&tmp.path().join("missing.tif")).unwrap();
    }

    #[test]
    fn test_write_atomic_leaves_no_partial() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("out.tif");
        write_atomic(&path, b"abc").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"abc");
        assert!(!partial_path(&path).exists());
        assert_eq!(partial_path(&path).file_name().unwrap(), "out.tif.partial");
    }
}
