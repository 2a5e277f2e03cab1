//! Filesystem access and the low-level node functions built on it.
//!
//! Node functions never touch the disk directly. They go through a [`FileSystem`], which
//! is either the real one or an in-memory fixture, and every fact they read becomes a
//! node (`FILE_STATE`, `DIRECTORY_LISTING_STATE`) that the differencer can invalidate.

mod functions;
mod memory;
mod real;
mod values;

pub use functions::{
    directory_listing_key, directory_listing_state_key, file_key, file_state_key, filesystem_functions,
    package_locator_key, package_lookup_key, precomputed_key, FileError, DIRECTORY_LISTING,
    DIRECTORY_LISTING_STATE, FILE, FILE_STATE, PACKAGE_LOOKUP, PRECOMPUTED,
};
pub use memory::InMemoryFileSystem;
pub use real::RealFileSystem;
pub use values::{
    DirectoryListingStateValue, DirectoryListingValue, FileStateValue, FileValue, PackageLocator,
    PackageLookupValue,
};

use std::fmt;
use std::io;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Kind of a filesystem entry, as reported by `lstat` (symlinks are not followed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FileType {
    /// A regular file.
    File,
    /// A directory.
    Directory,
    /// A symbolic link.
    Symlink,
    /// Anything else: sockets, devices, fifos.
    Special,
}

/// Metadata of one entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileStatus {
    /// Entry kind.
    pub file_type: FileType,
    /// Size in bytes.
    pub size: u64,
    /// Modification time in nanoseconds since the epoch.
    pub modified: u64,
    /// Content digest, when the filesystem can supply one cheaply.
    pub digest: Option<u64>,
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Dirent {
    /// Base name.
    pub name: String,
    /// Entry kind.
    pub file_type: FileType,
}

/// Access to a filesystem.
pub trait FileSystem: Send + Sync + 'static {
    /// Stat `path` without following a final symlink. `Ok(None)` if nothing exists there.
    fn lstat(&self, path: &Path) -> io::Result<Option<FileStatus>>;

    /// The target of the symlink at `path`, unresolved.
    fn read_link(&self, path: &Path) -> io::Result<PathBuf>;

    /// Entries of the directory at `path`, in any order. An entry whose name cannot be
    /// carried as a `String` fails the whole listing with [`io::ErrorKind::InvalidData`].
    fn read_dir(&self, path: &Path) -> io::Result<Vec<Dirent>>;
}

/// A path split into a root (a package root or the filesystem root) and a path relative
/// to it.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RootedPath {
    root: PathBuf,
    relative: PathBuf,
}

impl RootedPath {
    /// Create a rooted path. The relative part is normalized lexically.
    pub fn new(root: impl Into<PathBuf>, relative: impl AsRef<Path>) -> Self {
        Self {
            root: root.into(),
            relative: normalize(relative.as_ref()),
        }
    }

    /// Root an absolute path at `/`.
    pub fn absolute(path: &Path) -> Self {
        let mut root = PathBuf::new();
        let mut relative = PathBuf::new();
        for component in path.components() {
            match component {
                Component::Prefix(_) | Component::RootDir => root.push(component.as_os_str()),
                other => relative.push(other.as_os_str()),
            }
        }
        Self::new(root, relative)
    }

    /// Root `path` under the first of `roots` that contains it, or at `/`.
    pub fn under_roots(path: &Path, roots: &[PathBuf]) -> Self {
        for root in roots {
            if let Ok(relative) = path.strip_prefix(root) {
                return Self::new(root.clone(), relative);
            }
        }
        Self::absolute(path)
    }

    /// The root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The root-relative part.
    pub fn relative(&self) -> &Path {
        &self.relative
    }

    /// The full path.
    pub fn as_path(&self) -> PathBuf {
        if self.relative.as_os_str().is_empty() {
            self.root.clone()
        } else {
            self.root.join(&self.relative)
        }
    }

    /// Returns true if this is the root itself.
    pub fn is_root(&self) -> bool {
        self.relative.as_os_str().is_empty()
    }

    /// Last component of the relative part.
    pub fn file_name(&self) -> Option<&str> {
        self.relative.file_name().and_then(|n| n.to_str())
    }

    /// The containing directory, under the same root. `None` for the root itself.
    pub fn parent(&self) -> Option<RootedPath> {
        if self.is_root() {
            return None;
        }
        let parent = self.relative.parent().map(Path::to_path_buf).unwrap_or_default();
        Some(Self {
            root: self.root.clone(),
            relative: parent,
        })
    }

    /// A child entry.
    pub fn child(&self, name: &str) -> RootedPath {
        Self {
            root: self.root.clone(),
            relative: self.relative.join(name),
        }
    }

    /// The same relative path under another root.
    pub fn with_root(&self, root: impl Into<PathBuf>) -> RootedPath {
        Self {
            root: root.into(),
            relative: self.relative.clone(),
        }
    }

    /// Resolve a symlink target found at this path. Relative targets are taken relative to
    /// the containing directory. Targets that leave the root are rooted at `/`.
    pub fn resolve_link(&self, target: &Path) -> RootedPath {
        if target.is_absolute() {
            return match target.strip_prefix(&self.root) {
                Ok(relative) => Self::new(self.root.clone(), relative),
                Err(_) => Self::absolute(target),
            };
        }
        let base = self.relative.parent().map(Path::to_path_buf).unwrap_or_default();
        let joined = base.join(target);
        let escapes = joined
            .components()
            .try_fold(0usize, |depth, component| match component {
                Component::ParentDir => depth.checked_sub(1),
                Component::Normal(_) => Some(depth + 1),
                _ => Some(depth),
            })
            .is_none();
        if escapes {
            Self::absolute(&normalize(&self.root.join(joined)))
        } else {
            Self::new(self.root.clone(), joined)
        }
    }
}

impl fmt::Debug for RootedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]/[{}]", self.root.display(), self.relative.display())
    }
}

impl fmt::Display for RootedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_path().display())
    }
}

/// Lexically remove `.` and resolve `..` against preceding components.
fn normalize(path: &Path) -> PathBuf {
    let mut out: Vec<Component<'_>> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.last() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(component),
            },
            other => out.push(other),
        }
    }
    out.iter().map(|c| c.as_os_str()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_and_child() {
        let path = RootedPath::new("/ws", "a/b");
        assert_eq!(path.parent(), Some(RootedPath::new("/ws", "a")));
        assert_eq!(RootedPath::new("/ws", "a").parent(), Some(RootedPath::new("/ws", "")));
        assert_eq!(RootedPath::new("/ws", "").parent(), None);
        assert_eq!(path.child("c").relative(), Path::new("a/b/c"));
        assert_eq!(path.as_path(), PathBuf::from("/ws/a/b"));
        assert_eq!(path.file_name(), Some("b"));
    }

    #[test]
    fn test_resolve_relative_link() {
        let link = RootedPath::new("/ws", "d/link");
        assert_eq!(link.resolve_link(Path::new("target")), RootedPath::new("/ws", "d/target"));
        assert_eq!(link.resolve_link(Path::new("../e/f")), RootedPath::new("/ws", "e/f"));
        assert_eq!(link.resolve_link(Path::new("/ws/x")), RootedPath::new("/ws", "x"));
    }

    #[test]
    fn test_link_leaving_root_is_absolute() {
        let link = RootedPath::new("/ws", "link");
        let resolved = link.resolve_link(Path::new("../other/x"));
        assert_eq!(resolved.as_path(), PathBuf::from("/other/x"));
        assert_eq!(resolved.root(), Path::new("/"));
    }

    #[test]
    fn test_under_roots() {
        let roots = vec![PathBuf::from("/a"), PathBuf::from("/b")];
        assert_eq!(RootedPath::under_roots(Path::new("/b/x"), &roots), RootedPath::new("/b", "x"));
        assert_eq!(RootedPath::under_roots(Path::new("/c/x"), &roots).root(), Path::new("/"));
    }
}
