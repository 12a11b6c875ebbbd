//! Atomic file writes for crash-safe persistence.
//!
//! Strategy: write to a temporary file in the same directory, `sync_all()`,
//! rename over the target, then fsync the parent directory (Unix only).
//! After a crash the target holds either the old content or the new content,
//! never a partial state.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use uuid::Uuid;

/// Generate a temporary file path in the same directory as the target.
fn temp_path(path: &Path) -> io::Result<PathBuf> {
    let parent = path.parent().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("path has no parent directory: {}", path.display()),
        )
    })?;

    let file_name = path.file_name().and_then(|s| s.to_str()).unwrap_or("file");
    Ok(parent.join(format!(".{}.tmp.{}", file_name, Uuid::new_v4())))
}

#[cfg(unix)]
fn fsync_dir(path: &Path) -> io::Result<()> {
    let dir = File::open(path)?;
    dir.sync_all()
}

#[cfg(not(unix))]
fn fsync_dir(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// Atomically write data to a file, replacing any existing content.
///
/// # Errors
///
/// Returns an error if the path has no parent directory or any I/O
/// operation fails.
pub fn atomic_write(path: impl AsRef<Path>, data: &[u8]) -> io::Result<()> {
    let path = path.as_ref();
    let parent = path.parent().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("path has no parent directory: {}", path.display()),
        )
    })?;

    if !parent.as_os_str().is_empty() {
        fs::create_dir_all(parent)?;
    }

    let temp = temp_path(path)?;

    let mut file = File::create(&temp)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);

    if let Err(e) = fs::rename(&temp, path) {
        let _ = fs::remove_file(&temp);
        return Err(e);
    }

    if !parent.as_os_str().is_empty() {
        fsync_dir(parent)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_atomic_write_basic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snapshot.dat");

        atomic_write(&path, b"hello").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"hello");
    }

    #[test]
    fn test_atomic_write_overwrites() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snapshot.dat");

        atomic_write(&path, b"first").unwrap();
        atomic_write(&path, b"second").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"second");
    }

    #[test]
    fn test_atomic_write_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.dat");

        atomic_write(&path, &[]).unwrap();

        assert!(fs::read(&path).unwrap().is_empty());
    }

    #[test]
    fn test_no_temp_files_after_success() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snapshot.dat");

        atomic_write(&path, b"content").unwrap();

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_atomic_write_creates_parent_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("snapshot.dat");

        atomic_write(&path, b"nested").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"nested");
    }

    #[test]
    fn test_atomic_write_no_parent_error() {
        assert!(atomic_write("/", b"data").is_err());
    }

    #[test]
    fn test_atomic_write_binary_data() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("binary.dat");

        let data: Vec<u8> = (0..=255).collect();
        atomic_write(&path, &data).unwrap();

        assert_eq!(fs::read(&path).unwrap(), data);
    }
}
