use std::hash::Hash;
use std::path::{Path, PathBuf};

use super::{Dirent, FileStatus, FileSystem, FileType, RootedPath};

/// The `lstat` of one path, as a node value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FileStateValue {
    /// Nothing exists at the path.
    NonExistent,
    /// A regular file.
    Regular {
        /// Size in bytes.
        size: u64,
        /// Modification time in nanoseconds.
        modified: u64,
        /// Content digest, if known.
        digest: Option<u64>,
    },
    /// A directory. Its contents are tracked by the directory listing nodes.
    Directory,
    /// A symlink and its unresolved target.
    Symlink {
        /// The link text.
        target: PathBuf,
    },
    /// A socket, device or fifo.
    Special {
        /// Modification time in nanoseconds.
        modified: u64,
    },
}

impl FileStateValue {
    /// Build from a stat result; `link_target` is consulted only for symlinks.
    pub fn from_status(status: Option<&FileStatus>, link_target: impl FnOnce() -> std::io::Result<PathBuf>) -> std::io::Result<Self> {
        let Some(status) = status else {
            return Ok(FileStateValue::NonExistent);
        };
        Ok(match status.file_type {
            FileType::File => FileStateValue::Regular {
                size: status.size,
                modified: status.modified,
                digest: status.digest,
            },
            FileType::Directory => FileStateValue::Directory,
            FileType::Symlink => FileStateValue::Symlink {
                target: link_target()?,
            },
            FileType::Special => FileStateValue::Special {
                modified: status.modified,
            },
        })
    }

    /// Stat `path` on `fs`.
    pub fn read(fs: &dyn FileSystem, path: &Path) -> std::io::Result<Self> {
        let status = fs.lstat(path)?;
        Self::from_status(status.as_ref(), || fs.read_link(path))
    }

    /// The entry kind, or `None` if nothing exists.
    pub fn file_type(&self) -> Option<FileType> {
        match self {
            FileStateValue::NonExistent => None,
            FileStateValue::Regular { .. } => Some(FileType::File),
            FileStateValue::Directory => Some(FileType::Directory),
            FileStateValue::Symlink { .. } => Some(FileType::Symlink),
            FileStateValue::Special { .. } => Some(FileType::Special),
        }
    }

    /// Returns true unless nothing exists at the path.
    pub fn exists(&self) -> bool {
        !matches!(self, FileStateValue::NonExistent)
    }

    /// A stable hash of the metadata, used to detect content changes of traversed files.
    pub fn metadata_hash(&self) -> u64 {
        stable_hash(self)
    }
}

pub(crate) fn stable_hash<T: Hash + ?Sized>(value: &T) -> u64 {
    ahash::RandomState::with_seeds(0x5eed, 0xf11e, 0x57a7, 0xe5).hash_one(value)
}

/// A path with symlinks resolved.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileValue {
    /// The requested path.
    pub path: RootedPath,
    /// `lstat` of the requested path itself.
    pub state: FileStateValue,
    /// Where the symlink chain ends; equals `path` for non-symlinks.
    pub real_path: RootedPath,
    /// `lstat` of `real_path`.
    pub real_state: FileStateValue,
    /// The link text, if `path` is a symlink.
    pub unresolved_link: Option<PathBuf>,
}

impl FileValue {
    /// Returns true if the resolved entry exists. False for dangling symlinks.
    pub fn exists(&self) -> bool {
        self.real_state.exists()
    }

    /// Returns true if the requested path is a symlink.
    pub fn is_symlink(&self) -> bool {
        self.unresolved_link.is_some()
    }

    /// Returns true if the resolved entry is a directory.
    pub fn is_directory(&self) -> bool {
        self.real_state == FileStateValue::Directory
    }

    /// Returns true if the resolved entry is a regular or special file.
    pub fn is_file(&self) -> bool {
        matches!(
            self.real_state,
            FileStateValue::Regular { .. } | FileStateValue::Special { .. }
        )
    }

    /// The link text of a symlink.
    pub fn unresolved_link_target(&self) -> Option<&Path> {
        self.unresolved_link.as_deref()
    }
}

/// The raw, sorted entries of one directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct DirectoryListingStateValue {
    dirents: Vec<Dirent>,
}

impl DirectoryListingStateValue {
    /// Build from entries in any order.
    pub fn new(mut dirents: Vec<Dirent>) -> Self {
        dirents.sort();
        dirents.dedup_by(|a, b| a.name == b.name);
        Self { dirents }
    }

    /// Entries sorted by name.
    pub fn dirents(&self) -> &[Dirent] {
        &self.dirents
    }

    /// The entry named `name`.
    pub fn get(&self, name: &str) -> Option<&Dirent> {
        self.dirents
            .binary_search_by(|d| d.name.as_str().cmp(name))
            .ok()
            .map(|i| &self.dirents[i])
    }
}

/// The entries of a directory reached through symlinks.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DirectoryListingValue {
    /// The directory after symlink resolution.
    pub real_path: RootedPath,
    /// Its entries.
    pub listing: DirectoryListingStateValue,
}

impl DirectoryListingValue {
    /// Entries sorted by name.
    pub fn dirents(&self) -> &[Dirent] {
        self.listing.dirents()
    }
}

/// Where packages live: an ordered list of package roots and the build file name that
/// marks a package directory. Injected as a precomputed value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackageLocator {
    /// Package roots, searched in order.
    pub roots: Vec<PathBuf>,
    /// Name of the file that makes a directory a package.
    pub build_file_name: String,
}

impl PackageLocator {
    /// A locator over `roots` using `BUILD` files.
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self {
            roots,
            build_file_name: "BUILD".to_string(),
        }
    }

    /// Use another build file name.
    pub fn with_build_file_name(mut self, name: impl Into<String>) -> Self {
        self.build_file_name = name.into();
        self
    }
}

/// Whether a root-relative directory is a package, and under which root.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PackageLookupValue {
    /// The first root holding the build file.
    Package {
        /// That root.
        root: PathBuf,
    },
    /// No root holds a build file for this path.
    NoBuildFile,
}

impl PackageLookupValue {
    /// Returns true if a package exists.
    pub fn package_exists(&self) -> bool {
        matches!(self, PackageLookupValue::Package { .. })
    }

    /// The package root, if a package exists.
    pub fn root(&self) -> Option<&Path> {
        match self {
            PackageLookupValue::Package { root } => Some(root),
            PackageLookupValue::NoBuildFile => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listing_sorted_lookup() {
        let listing = DirectoryListingStateValue::new(vec![
            Dirent {
                name: "b".into(),
                file_type: FileType::File,
            },
            Dirent {
                name: "a".into(),
                file_type: FileType::Directory,
            },
        ]);
        assert_eq!(listing.dirents()[0].name, "a");
        assert_eq!(listing.get("b").map(|d| d.file_type), Some(FileType::File));
        assert!(listing.get("c").is_none());
    }

    #[test]
    fn test_metadata_hash_is_stable_and_content_sensitive() {
        let a = FileStateValue::Regular {
            size: 1,
            modified: 2,
            digest: Some(3),
        };
        let b = FileStateValue::Regular {
            size: 1,
            modified: 2,
            digest: Some(4),
        };
        assert_eq!(a.metadata_hash(), a.clone().metadata_hash());
        assert_ne!(a.metadata_hash(), b.metadata_hash());
    }
}
