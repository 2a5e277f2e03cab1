use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use super::{Dirent, FileStatus, FileSystem, FileType};

/// The host filesystem. No content digests are computed; changes are detected through
/// size and modification time.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealFileSystem;

fn file_type(metadata_type: std::fs::FileType) -> FileType {
    if metadata_type.is_symlink() {
        FileType::Symlink
    } else if metadata_type.is_dir() {
        FileType::Directory
    } else if metadata_type.is_file() {
        FileType::File
    } else {
        FileType::Special
    }
}

/// `ENOTDIR` on every unix the standard library supports.
#[cfg(unix)]
const ENOTDIR: i32 = 20;

/// A path is absent both when it does not exist and when one of its ancestors is not a
/// directory.
fn is_absent(e: &io::Error) -> bool {
    if e.kind() == io::ErrorKind::NotFound {
        return true;
    }
    #[cfg(unix)]
    if e.raw_os_error() == Some(ENOTDIR) {
        return true;
    }
    false
}

impl FileSystem for RealFileSystem {
    fn lstat(&self, path: &Path) -> io::Result<Option<FileStatus>> {
        let metadata = match std::fs::symlink_metadata(path) {
            Ok(metadata) => metadata,
            Err(e) if is_absent(&e) => return Ok(None),
            Err(e) => return Err(e),
        };
        let modified = metadata
            .modified()
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_nanos() as u64);
        Ok(Some(FileStatus {
            file_type: file_type(metadata.file_type()),
            size: metadata.len(),
            modified,
            digest: None,
        }))
    }

    fn read_link(&self, path: &Path) -> io::Result<PathBuf> {
        std::fs::read_link(path)
    }

    /// Fails with [`io::ErrorKind::InvalidData`] when an entry name is not valid UTF-8.
    fn read_dir(&self, path: &Path) -> io::Result<Vec<Dirent>> {
        std::fs::read_dir(path)?
            .map(|entry| {
                let entry = entry?;
                let name = entry.file_name().into_string().map_err(|name| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("entry {:?} in {} is not valid UTF-8", name, path.display()),
                    )
                })?;
                Ok(Dirent {
                    name,
                    file_type: file_type(entry.file_type()?),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lstat_and_listing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "hello").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let fs = RealFileSystem;
        let status = fs.lstat(&dir.path().join("a.txt")).unwrap().unwrap();
        assert_eq!(status.file_type, FileType::File);
        assert_eq!(status.size, 5);
        assert_eq!(fs.lstat(&dir.path().join("missing")).unwrap(), None);

        let mut entries = fs.read_dir(dir.path()).unwrap();
        entries.sort();
        assert_eq!(
            entries,
            vec![
                Dirent {
                    name: "a.txt".into(),
                    file_type: FileType::File
                },
                Dirent {
                    name: "sub".into(),
                    file_type: FileType::Directory
                },
            ]
        );
    }

    #[test]
    fn test_lstat_below_regular_file_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pkg"), "not a directory").unwrap();
        let fs = RealFileSystem;
        assert_eq!(fs.lstat(&dir.path().join("pkg/BUILD")).unwrap(), None);
        assert_eq!(fs.lstat(&dir.path().join("pkg/sub/BUILD")).unwrap(), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_listing_with_undecodable_name_fails() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ok.txt"), "").unwrap();
        let bad = dir.path().join(OsStr::from_bytes(b"bad\xff"));
        if std::fs::write(&bad, "").is_err() {
            // Some filesystems refuse non UTF-8 names outright.
            return;
        }
        let err = RealFileSystem.read_dir(dir.path()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_is_not_followed() {
        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink("nowhere", dir.path().join("link")).unwrap();
        let fs = RealFileSystem;
        let status = fs.lstat(&dir.path().join("link")).unwrap().unwrap();
        assert_eq!(status.file_type, FileType::Symlink);
        assert_eq!(fs.read_link(&dir.path().join("link")).unwrap(), PathBuf::from("nowhere"));
    }
}
