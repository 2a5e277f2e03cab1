use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{ComputeError, Failure, FailureExt};
use crate::function::{Environment, NodeFunction};
use crate::key::{FunctionKind, NodeKey};
use crate::value::{value, Value};

use super::values::{DirectoryListingStateValue, DirectoryListingValue, FileStateValue, FileValue, PackageLocator, PackageLookupValue};
use super::{FileSystem, RootedPath};

/// `lstat` of a [`RootedPath`]. Value: [`FileStateValue`].
pub const FILE_STATE: FunctionKind = FunctionKind::new("FILE_STATE");
/// A [`RootedPath`] with symlinks resolved. Value: [`FileValue`].
pub const FILE: FunctionKind = FunctionKind::new("FILE");
/// Raw entries of a directory. Value: [`DirectoryListingStateValue`].
pub const DIRECTORY_LISTING_STATE: FunctionKind = FunctionKind::new("DIRECTORY_LISTING_STATE");
/// Entries of a directory reached through symlinks. Value: [`DirectoryListingValue`].
pub const DIRECTORY_LISTING: FunctionKind = FunctionKind::new("DIRECTORY_LISTING");
/// Package lookup of a root-relative directory. Value: [`PackageLookupValue`].
pub const PACKAGE_LOOKUP: FunctionKind = FunctionKind::new("PACKAGE_LOOKUP");
/// Values that only exist through injection.
pub const PRECOMPUTED: FunctionKind = FunctionKind::new("PRECOMPUTED");

const PACKAGE_LOCATOR: &str = "package_locator";

/// Key of the `lstat` node for `path`.
pub fn file_state_key(path: RootedPath) -> NodeKey {
    NodeKey::new(FILE_STATE, path)
}

/// Key of the resolved file node for `path`.
pub fn file_key(path: RootedPath) -> NodeKey {
    NodeKey::new(FILE, path)
}

/// Key of the raw listing node for `path`.
pub fn directory_listing_state_key(path: RootedPath) -> NodeKey {
    NodeKey::new(DIRECTORY_LISTING_STATE, path)
}

/// Key of the resolved listing node for `path`.
pub fn directory_listing_key(path: RootedPath) -> NodeKey {
    NodeKey::new(DIRECTORY_LISTING, path)
}

/// Key of the package lookup for a root-relative directory.
pub fn package_lookup_key(relative: impl Into<PathBuf>) -> NodeKey {
    NodeKey::new(PACKAGE_LOOKUP, relative.into())
}

/// Key of a precomputed value.
pub fn precomputed_key(name: &'static str) -> NodeKey {
    NodeKey::new(PRECOMPUTED, name)
}

/// Key under which the [`PackageLocator`] is injected.
pub fn package_locator_key() -> NodeKey {
    precomputed_key(PACKAGE_LOCATOR)
}

/// Errors of the filesystem node functions.
#[derive(Debug, thiserror::Error)]
pub enum FileError {
    /// The filesystem returned an error. Retried on the next build, except for
    /// directory entries whose names are not valid UTF-8.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// The path being read.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// A directory listing was requested for something else.
    #[error("{0} is not a directory")]
    NotADirectory(RootedPath),

    /// The key's argument has the wrong type for its function kind.
    #[error("{0} does not carry the argument its function expects")]
    InvalidArgument(NodeKey),

    /// A precomputed value was requested but never injected.
    #[error("precomputed value {0} was never injected")]
    NotInjected(String),
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> FileError + '_ {
    move |source| FileError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn argument<A: 'static>(key: &NodeKey) -> Result<&A, Failure> {
    key.argument::<A>()
        .ok_or_else(|| Failure::persistent(FileError::InvalidArgument(key.clone())))
}

struct FileStateFunction {
    fs: Arc<dyn FileSystem>,
}

impl NodeFunction for FileStateFunction {
    fn compute(&self, key: &NodeKey, _env: &mut Environment<'_>) -> Result<Value, ComputeError> {
        let path = argument::<RootedPath>(key)?.as_path();
        let state = FileStateValue::read(self.fs.as_ref(), &path)
            .map_err(io_error(&path))
            .transient()?;
        Ok(value(state))
    }
}

/// Resolves ancestors first, so a path below a symlinked directory is stat'ed at its
/// real location. A chain of links that revisits a path is a dependency cycle.
struct FileFunction;

impl NodeFunction for FileFunction {
    fn compute(&self, key: &NodeKey, env: &mut Environment<'_>) -> Result<Value, ComputeError> {
        let path = argument::<RootedPath>(key)?.clone();
        let lookup = match (path.parent(), path.file_name()) {
            (Some(parent), Some(name)) => {
                let parent_value = env.get::<FileValue>(&file_key(parent.clone()))?;
                if parent_value.real_path == parent {
                    path.clone()
                } else {
                    parent_value.real_path.child(name)
                }
            }
            _ => path.clone(),
        };

        let state = env.get::<FileStateValue>(&file_state_key(lookup.clone()))?;
        let file = match state.as_ref() {
            FileStateValue::Symlink { target } => {
                let resolved = env.get::<FileValue>(&file_key(lookup.resolve_link(target)))?;
                FileValue {
                    path,
                    state: state.as_ref().clone(),
                    real_path: resolved.real_path.clone(),
                    real_state: resolved.real_state.clone(),
                    unresolved_link: Some(target.clone()),
                }
            }
            other => FileValue {
                path,
                state: other.clone(),
                real_path: lookup,
                real_state: other.clone(),
                unresolved_link: None,
            },
        };
        Ok(value(file))
    }
}

struct DirectoryListingStateFunction {
    fs: Arc<dyn FileSystem>,
}

impl NodeFunction for DirectoryListingStateFunction {
    fn compute(&self, key: &NodeKey, _env: &mut Environment<'_>) -> Result<Value, ComputeError> {
        let path = argument::<RootedPath>(key)?.as_path();
        let dirents = match self.fs.read_dir(&path) {
            Ok(dirents) => dirents,
            // An entry name that cannot be represented does not go away by retrying.
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                return Err(Failure::persistent(io_error(&path)(e)).into());
            }
            Err(e) => return Err(Failure::transient(io_error(&path)(e)).into()),
        };
        Ok(value(DirectoryListingStateValue::new(dirents)))
    }
}

struct DirectoryListingFunction;

impl NodeFunction for DirectoryListingFunction {
    fn compute(&self, key: &NodeKey, env: &mut Environment<'_>) -> Result<Value, ComputeError> {
        let path = argument::<RootedPath>(key)?;
        let file = env.get::<FileValue>(&file_key(path.clone()))?;
        if !file.is_directory() {
            return Err(Failure::persistent(FileError::NotADirectory(path.clone())).into());
        }
        let listing =
            env.get::<DirectoryListingStateValue>(&directory_listing_state_key(file.real_path.clone()))?;
        Ok(value(DirectoryListingValue {
            real_path: file.real_path.clone(),
            listing: listing.as_ref().clone(),
        }))
    }
}

/// Tries each package root in order. Roots after the first hit are never read.
struct PackageLookupFunction;

impl NodeFunction for PackageLookupFunction {
    fn compute(&self, key: &NodeKey, env: &mut Environment<'_>) -> Result<Value, ComputeError> {
        let relative = argument::<PathBuf>(key)?;
        let locator = env.get::<PackageLocator>(&package_locator_key())?;
        for root in &locator.roots {
            let build_file = RootedPath::new(root.clone(), relative.join(&locator.build_file_name));
            let file = env.get::<FileValue>(&file_key(build_file))?;
            if file.is_file() {
                return Ok(value(PackageLookupValue::Package { root: root.clone() }));
            }
        }
        Ok(value(PackageLookupValue::NoBuildFile))
    }
}

struct PrecomputedFunction;

impl NodeFunction for PrecomputedFunction {
    fn compute(&self, key: &NodeKey, _env: &mut Environment<'_>) -> Result<Value, ComputeError> {
        Err(Failure::persistent(FileError::NotInjected(key.debug_repr())).into())
    }
}

/// The low-level filesystem functions, bound to `fs`, ready to register.
pub fn filesystem_functions(fs: Arc<dyn FileSystem>) -> Vec<(FunctionKind, Arc<dyn NodeFunction>)> {
    let functions: [(FunctionKind, Arc<dyn NodeFunction>); 6] = [
        (FILE_STATE, Arc::new(FileStateFunction { fs: fs.clone() })),
        (FILE, Arc::new(FileFunction)),
        (DIRECTORY_LISTING_STATE, Arc::new(DirectoryListingStateFunction { fs })),
        (DIRECTORY_LISTING, Arc::new(DirectoryListingFunction)),
        (PACKAGE_LOOKUP, Arc::new(PackageLookupFunction)),
        (PRECOMPUTED, Arc::new(PrecomputedFunction)),
    ];
    functions.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{Dirent, FileStatus, InMemoryFileSystem};
    use crate::graph::InMemoryGraph;
    use crate::version::Version;

    fn rooted(rel: &str) -> RootedPath {
        RootedPath::new("/ws", rel)
    }

    #[test]
    fn test_file_state_reads_symlink_target() {
        let fs = Arc::new(InMemoryFileSystem::new());
        fs.symlink("target", "/ws/link");
        let graph = InMemoryGraph::new();
        let key = file_state_key(rooted("link"));
        let mut env = Environment::new(&key, &graph, None);
        let function = FileStateFunction { fs };
        let state = function.compute(&key, &mut env).unwrap();
        assert_eq!(
            crate::value::downcast_value::<FileStateValue>(&state).as_deref(),
            Some(&FileStateValue::Symlink {
                target: PathBuf::from("target")
            })
        );
    }

    #[test]
    fn test_file_requests_parent_then_state() {
        let graph = InMemoryGraph::new();
        let key = file_key(rooted("a/b"));
        let mut env = Environment::new(&key, &graph, None);
        assert!(matches!(FileFunction.compute(&key, &mut env), Err(ComputeError::Unavailable)));
        let invocation = env.finish();
        assert_eq!(invocation.missing, vec![file_key(rooted("a"))]);
    }

    #[test]
    fn test_file_follows_symlink_to_real_path() {
        let graph = InMemoryGraph::new();
        let plain = |rel: &str, state: FileStateValue| FileValue {
            path: rooted(rel),
            state: state.clone(),
            real_path: rooted(rel),
            real_state: state,
            unresolved_link: None,
        };
        let v1 = Version(1);
        graph
            .create_if_absent(&file_key(rooted("")))
            .inject(value(plain("", FileStateValue::Directory)), v1);
        graph.create_if_absent(&file_state_key(rooted("link"))).inject(
            value(FileStateValue::Symlink {
                target: PathBuf::from("dir"),
            }),
            v1,
        );
        graph
            .create_if_absent(&file_key(rooted("dir")))
            .inject(value(plain("dir", FileStateValue::Directory)), v1);

        let key = file_key(rooted("link"));
        let mut env = Environment::new(&key, &graph, None);
        let result = FileFunction.compute(&key, &mut env).unwrap();
        let file = crate::value::downcast_value::<FileValue>(&result).unwrap();
        assert!(file.is_symlink() && file.is_directory());
        assert_eq!(file.real_path, rooted("dir"));
    }

    struct FailingListing(io::ErrorKind);

    impl FileSystem for FailingListing {
        fn lstat(&self, _path: &Path) -> io::Result<Option<FileStatus>> {
            Ok(None)
        }

        fn read_link(&self, path: &Path) -> io::Result<PathBuf> {
            Err(io::Error::new(io::ErrorKind::InvalidInput, path.display().to_string()))
        }

        fn read_dir(&self, _path: &Path) -> io::Result<Vec<Dirent>> {
            Err(io::Error::new(self.0, "listing failed"))
        }
    }

    fn listing_failure(kind: io::ErrorKind) -> Failure {
        let graph = InMemoryGraph::new();
        let key = directory_listing_state_key(rooted("dir"));
        let mut env = Environment::new(&key, &graph, None);
        let function = DirectoryListingStateFunction {
            fs: Arc::new(FailingListing(kind)),
        };
        match function.compute(&key, &mut env) {
            Err(ComputeError::Failed(failure)) => failure,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_undecodable_listing_is_persistent() {
        use crate::error::Transience;

        let failure = listing_failure(io::ErrorKind::InvalidData);
        assert_eq!(failure.transience(), Transience::Persistent);
        assert!(failure.is::<FileError>());
        assert_eq!(listing_failure(io::ErrorKind::PermissionDenied).transience(), Transience::Transient);
    }

    #[test]
    fn test_precomputed_fails_when_not_injected() {
        let graph = InMemoryGraph::new();
        let key = package_locator_key();
        let mut env = Environment::new(&key, &graph, None);
        match PrecomputedFunction.compute(&key, &mut env) {
            Err(ComputeError::Failed(failure)) => assert!(failure.is::<FileError>()),
            other => panic!("unexpected {other:?}"),
        }
    }
}
